use std::cell::RefCell;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::mixture_prior::MixturePrior;
use super::traits::{BayesModuleT, VariationalDistribution};
use super::variational_param::{PosteriorInit, VariationalParameter};
use crate::candle_sampler::Sampler;
use crate::error::{BbpError, Result};

//////////////////////////////////////////////
// Linear module with variational weights   //
//////////////////////////////////////////////

/// Fully connected layer y = x Wᵀ + b whose weight and bias are
/// [`VariationalParameter`]s.
///
/// Each forward pass draws a fresh weight, computes the output with it, and
/// caches the KL estimate of that same draw in `last_kl`. The cache lives in
/// a `RefCell`, so a layer cannot be shared across threads.
pub struct BayesianLinear {
    name: String,
    in_dim: usize,
    out_dim: usize,
    weight: VariationalParameter,
    bias: Option<VariationalParameter>,
    last_kl: RefCell<Option<Tensor>>,
}

/// Weights resolved for one forward pass, with their KL estimate
///
/// Applying the same `SampledLinear` several times reuses one draw.
pub struct SampledLinear {
    name: String,
    in_dim: usize,
    weight: Tensor,
    bias: Option<Tensor>,
    pub kl: Tensor,
}

impl SampledLinear {
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// y = x Wᵀ + b for any input of shape (..., in_dim)
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match x.dims().last() {
            Some(&d) if d == self.in_dim => {}
            _ => {
                return Err(BbpError::ShapeMismatch {
                    layer: self.name.clone(),
                    expected: self.in_dim,
                    actual: x.dims().to_vec(),
                })
            }
        }

        let w_t = match *x.dims() {
            [b1, b2, _, _] => self.weight.broadcast_left((b1, b2))?.t()?,
            [bsize, _, _] => self.weight.broadcast_left(bsize)?.t()?,
            [_, _] => self.weight.t()?,
            [_] => {
                let y = x.unsqueeze(0)?.matmul(&self.weight.t()?)?.squeeze(0)?;
                return self.add_bias(y);
            }
            _ => return Ok(self.add_bias(x.broadcast_matmul(&self.weight.t()?)?)?),
        };

        self.add_bias(x.matmul(&w_t)?)
    }

    fn add_bias(&self, y: Tensor) -> Result<Tensor> {
        match &self.bias {
            None => Ok(y),
            Some(bias) => Ok(y.broadcast_add(bias)?),
        }
    }
}

impl BayesianLinear {
    pub fn new(
        name: String,
        in_dim: usize,
        out_dim: usize,
        weight: VariationalParameter,
        bias: Option<VariationalParameter>,
    ) -> Self {
        Self {
            name,
            in_dim,
            out_dim,
            weight,
            bias,
            last_kl: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn weight(&self) -> &VariationalParameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&VariationalParameter> {
        self.bias.as_ref()
    }

    /// Resolve weights for one forward pass and cache their KL
    ///
    /// Sampling modes draw w = μ + σ ε and estimate
    /// KL = log q(w) - log p(w) (plus the bias term);
    /// [`crate::ForwardMode::Mean`] uses μ and reports zero KL.
    pub fn sample(&self, sampler: &mut Sampler) -> Result<SampledLinear> {
        let (weight, bias, kl) = if sampler.mode().samples_weights() {
            let w = self.weight.sample(sampler)?;
            let mut kl = self.weight.kl(&w)?;
            let bias = match &self.bias {
                Some(b) => {
                    let bs = b.sample(sampler)?;
                    kl = (kl + b.kl(&bs)?)?;
                    Some(bs.value)
                }
                None => None,
            };
            (w.value, bias, kl)
        } else {
            let zero = Tensor::zeros((), self.weight.dtype(), self.weight.device())?;
            (
                self.weight.mean().clone(),
                self.bias.as_ref().map(|b| b.mean().clone()),
                zero,
            )
        };

        *self.last_kl.borrow_mut() = Some(kl.clone());

        Ok(SampledLinear {
            name: self.name.clone(),
            in_dim: self.in_dim,
            weight,
            bias,
            kl,
        })
    }

    /// Sample, apply, and return `(output, kl)`
    pub fn forward(&self, x: &Tensor, sampler: &mut Sampler) -> Result<(Tensor, Tensor)> {
        let sampled = self.sample(sampler)?;
        let y = sampled.forward(x)?;
        Ok((y, sampled.kl))
    }

    /// KL of the most recent forward pass, if any
    pub fn last_kl(&self) -> Option<Tensor> {
        self.last_kl.borrow().clone()
    }

    pub(crate) fn cached_kl(&self) -> Result<Tensor> {
        self.last_kl()
            .ok_or_else(|| BbpError::KlUnavailable(self.name.clone()))
    }
}

impl BayesModuleT for BayesianLinear {
    fn bayes_layers(&self) -> Vec<&BayesianLinear> {
        vec![self]
    }
}

/// Create a Bayesian linear layer
///
/// Variables: `{prefix}.weight.mu`, `{prefix}.weight.rho`, and the
/// `bias` counterparts when `bias` is set.
pub fn bayesian_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    prior: MixturePrior,
    init: PosteriorInit,
    vb: VarBuilder,
) -> Result<BayesianLinear> {
    let weight = VariationalParameter::new(vb.clone(), (out_dim, in_dim), "weight", prior, init)?;
    let bias = if bias {
        Some(VariationalParameter::new(
            vb.clone(),
            out_dim,
            "bias",
            prior,
            init,
        )?)
    } else {
        None
    };
    Ok(BayesianLinear::new(vb.prefix(), in_dim, out_dim, weight, bias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_sampler::ForwardMode;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(varmap: &VarMap, bias: bool) -> Result<BayesianLinear> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        bayesian_linear(
            5,
            3,
            bias,
            MixturePrior::default(),
            PosteriorInit::default(),
            vb.pp("fc"),
        )
    }

    #[test]
    fn test_output_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let fc = layer(&varmap, true)?;
        let mut sampler = Sampler::new(0, ForwardMode::Train);

        for dims in [vec![5], vec![7, 5], vec![2, 7, 5], vec![2, 2, 7, 5]] {
            let x = Tensor::randn(0f32, 1f32, dims.as_slice(), &Device::Cpu)?;
            let (y, _) = fc.forward(&x, &mut sampler)?;
            let mut expected = dims.clone();
            *expected.last_mut().expect("non-empty") = 3;
            assert_eq!(y.dims(), expected.as_slice());
        }
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_names_layer() -> Result<()> {
        let varmap = VarMap::new();
        let fc = layer(&varmap, false)?;
        let mut sampler = Sampler::new(0, ForwardMode::Train);
        let x = Tensor::zeros((4, 6), DType::F32, &Device::Cpu)?;

        match fc.forward(&x, &mut sampler) {
            Err(BbpError::ShapeMismatch {
                layer,
                expected,
                actual,
            }) => {
                assert_eq!(layer, "fc");
                assert_eq!(expected, 5);
                assert_eq!(actual, vec![4, 6]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn test_last_kl_overwritten() -> Result<()> {
        let varmap = VarMap::new();
        let fc = layer(&varmap, true)?;
        let mut sampler = Sampler::new(3, ForwardMode::Train);
        let x = Tensor::ones((2, 5), DType::F32, &Device::Cpu)?;

        assert!(fc.last_kl().is_none());

        let (_, kl1) = fc.forward(&x, &mut sampler)?;
        let cached1 = fc.last_kl().expect("cached").to_scalar::<f32>()?;
        assert_abs_diff_eq!(cached1, kl1.to_scalar::<f32>()?);

        let (_, kl2) = fc.forward(&x, &mut sampler)?;
        let cached2 = fc.last_kl().expect("cached").to_scalar::<f32>()?;
        assert_abs_diff_eq!(cached2, kl2.to_scalar::<f32>()?);
        assert!(cached1 != cached2);
        Ok(())
    }

    #[test]
    fn test_mean_mode_is_deterministic() -> Result<()> {
        let varmap = VarMap::new();
        let fc = layer(&varmap, true)?;
        let mut sampler = Sampler::new(3, ForwardMode::Mean);
        let x = Tensor::randn(0f32, 1f32, (4, 5), &Device::Cpu)?;

        let (y1, kl) = fc.forward(&x, &mut sampler)?;
        let (y2, _) = fc.forward(&x, &mut sampler)?;
        assert_eq!(kl.to_scalar::<f32>()?, 0.);
        assert_eq!(y1.to_vec2::<f32>()?, y2.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_sampled_weights_reused() -> Result<()> {
        let varmap = VarMap::new();
        let fc = layer(&varmap, false)?;
        let mut sampler = Sampler::new(5, ForwardMode::Train);
        let x = Tensor::randn(0f32, 1f32, (4, 5), &Device::Cpu)?;

        let sampled = fc.sample(&mut sampler)?;
        let y1 = sampled.forward(&x)?;
        let y2 = sampled.forward(&x)?;
        assert_eq!(y1.to_vec2::<f32>()?, y2.to_vec2::<f32>()?);

        let expected = x.matmul(&sampled.weight().t()?)?;
        let diff = (y1 - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
