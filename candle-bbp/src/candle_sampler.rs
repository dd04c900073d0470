use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// How Bayesian layers resolve their weights in a forward pass.
///
/// The mode is carried by the [`Sampler`] handed to every forward call, so a
/// whole network always runs in one mode. Mixing sampled and mean weights in
/// one pass would bias the KL estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardMode {
    /// Sample weights, dropout on, batch statistics updated.
    Train,
    /// Sample weights, dropout off, running statistics (MC evaluation).
    Sample,
    /// Posterior means, no sampling; every layer reports zero KL.
    Mean,
}

impl ForwardMode {
    pub fn is_train(&self) -> bool {
        matches!(self, ForwardMode::Train)
    }

    pub fn samples_weights(&self) -> bool {
        !matches!(self, ForwardMode::Mean)
    }
}

/// Explicit random state threaded through forward passes.
///
/// All noise (reparameterization and dropout masks) is drawn from this
/// generator, so a fixed seed reproduces a forward pass exactly.
pub struct Sampler {
    rng: StdRng,
    mode: ForwardMode,
}

impl Sampler {
    pub fn new(seed: u64, mode: ForwardMode) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            mode,
        }
    }

    pub fn mode(&self) -> ForwardMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ForwardMode) {
        self.mode = mode;
    }

    /// Draw `epsilon ~ N(0, I)` of the given shape
    ///
    /// f64 draws for f64 parameters; every other dtype is drawn as f32
    pub fn standard_normal<S: Into<Shape>>(
        &mut self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let shape: Shape = shape.into();
        let n = shape.elem_count();
        let eps = match dtype {
            DType::F64 => {
                let eps: Vec<f64> = (0..n)
                    .map(|_| self.rng.sample::<f64, _>(StandardNormal))
                    .collect();
                Tensor::from_vec(eps, shape, &Device::Cpu)?
            }
            _ => {
                let eps: Vec<f32> = (0..n)
                    .map(|_| self.rng.sample::<f32, _>(StandardNormal))
                    .collect();
                Tensor::from_vec(eps, shape, &Device::Cpu)?.to_dtype(dtype)?
            }
        };
        eps.to_device(device)
    }

    /// Inverted dropout: zero each entry with probability `p` and
    /// rescale the survivors by `1/(1-p)`. Identity outside training.
    pub fn dropout(&mut self, x: &Tensor, p: f64) -> candle_core::Result<Tensor> {
        if !self.mode.is_train() || p <= 0. {
            return Ok(x.clone());
        }
        if p >= 1. {
            return x.zeros_like();
        }
        let scale = 1. / (1. - p);
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| {
                if self.rng.random::<f64>() < p {
                    0.
                } else {
                    scale as f32
                }
            })
            .collect();
        let mask = Tensor::from_vec(mask, x.shape().clone(), &Device::Cpu)?
            .to_dtype(x.dtype())?
            .to_device(x.device())?;
        x.mul(&mask)
    }
}
