use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::VarBuilder;

use super::mixture_prior::MixturePrior;
use super::traits::{Prior, VariationalDistribution};
use crate::candle_sampler::Sampler;

/// Lower bound on σ; softplus underflows for very negative ρ in f32.
const MIN_SIGMA: f64 = 1e-8;

/// Initial values of the variational parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PosteriorInit {
    /// μ ~ N(0, mu_std²)
    pub mu_std: f64,
    /// ρ ~ N(rho_mean, rho_std²)
    pub rho_mean: f64,
    pub rho_std: f64,
}

impl Default for PosteriorInit {
    fn default() -> Self {
        Self {
            mu_std: 0.1,
            rho_mean: -7.0,
            rho_std: 0.1,
        }
    }
}

/// Gaussian variational parameter q(w) = N(μ, σ²), σ = softplus(ρ)
///
/// Both μ and ρ are trainable. The prior is fixed at construction.
pub struct VariationalParameter {
    mu: Tensor,
    rho: Tensor,
    prior: MixturePrior,
}

/// One reparameterized draw w = μ + σ ε together with the σ it used
pub struct WeightSample {
    pub value: Tensor,
    sigma: Tensor,
}

/// Numerically stable softplus: relu(ρ) + log(1 + exp(-|ρ|))
fn softplus(rho: &Tensor) -> candle_core::Result<Tensor> {
    let tail = (rho.abs()?.neg()?.exp()? + 1.)?.log()?;
    rho.relu()? + tail
}

impl VariationalParameter {
    /// Create trainable `mu` and `rho` of the given shape
    ///
    /// # Arguments
    /// * `vb` - VarBuilder; variables are named `{name}.mu` and `{name}.rho`
    /// * `shape` - parameter shape
    /// * `prior` - fixed mixture prior
    /// * `init` - initialization of μ and ρ
    pub fn new<S: Into<Shape>>(
        vb: VarBuilder,
        shape: S,
        name: &str,
        prior: MixturePrior,
        init: PosteriorInit,
    ) -> candle_core::Result<Self> {
        let shape: Shape = shape.into();
        let mu = vb.get_with_hints(
            shape.clone(),
            &format!("{}.mu", name),
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: init.mu_std,
            },
        )?;
        let rho = vb.get_with_hints(
            shape,
            &format!("{}.rho", name),
            candle_nn::Init::Randn {
                mean: init.rho_mean,
                stdev: init.rho_std,
            },
        )?;
        Ok(Self { mu, rho, prior })
    }

    /// Wrap existing tensors (e.g., restored or hand-set parameters)
    pub fn from_tensors(mu: Tensor, rho: Tensor, prior: MixturePrior) -> candle_core::Result<Self> {
        if mu.shape() != rho.shape() {
            candle_core::bail!(
                "mu {:?} and rho {:?} must share a shape",
                mu.dims(),
                rho.dims()
            );
        }
        Ok(Self { mu, rho, prior })
    }

    pub fn prior(&self) -> &MixturePrior {
        &self.prior
    }

    pub fn dims(&self) -> &[usize] {
        self.mu.dims()
    }

    pub fn device(&self) -> &Device {
        self.mu.device()
    }

    pub fn dtype(&self) -> DType {
        self.mu.dtype()
    }

    /// Reparameterized draw w = μ + σ ε, ε ~ N(0, I)
    pub fn sample(&self, sampler: &mut Sampler) -> candle_core::Result<WeightSample> {
        let sigma = self.std()?;
        let eps = sampler.standard_normal(self.mu.shape().clone(), self.dtype(), self.device())?;
        let value = (&self.mu + sigma.mul(&eps)?)?;
        Ok(WeightSample { value, sigma })
    }

    /// log p(w) under the mixture prior, summed over elements
    pub fn log_prior(&self, sample: &WeightSample) -> candle_core::Result<Tensor> {
        self.prior.log_prob(&sample.value)
    }

    /// log q(w) = sum log N(w; μ, σ²), with the σ of this very sample
    ///
    /// log N(w; μ, σ²) = -0.5 * [(w-μ)²/σ² + 2 ln σ + ln 2π]
    pub fn log_posterior(&self, sample: &WeightSample) -> candle_core::Result<Tensor> {
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let sq = sample.value.sub(&self.mu)?.sqr()?.div(&sample.sigma.sqr()?)?;
        let ln_sigma = sample.sigma.log()?;
        ((sq + (ln_sigma * 2.)?)? + ln_2pi)?.affine(-0.5, 0.)?.sum_all()
    }

    /// Single-sample Monte Carlo KL: log q(w) - log p(w)
    ///
    /// Can be negative for a particular draw; only its expectation is
    /// the KL divergence.
    pub fn kl(&self, sample: &WeightSample) -> candle_core::Result<Tensor> {
        self.log_posterior(sample)? - self.log_prior(sample)?
    }
}

impl VariationalDistribution for VariationalParameter {
    fn mean(&self) -> &Tensor {
        &self.mu
    }

    fn std(&self) -> candle_core::Result<Tensor> {
        softplus(&self.rho)?.maximum(MIN_SIGMA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_loss_functions::gaussian_kl_closed_form;
    use crate::candle_sampler::ForwardMode;
    use approx::assert_abs_diff_eq;
    use candle_nn::VarMap;

    #[test]
    fn test_sigma_stays_positive() -> candle_core::Result<()> {
        let rho = Tensor::new(&[-200f32, -20., 0., 20., 200.], &Device::Cpu)?;
        let mu = rho.zeros_like()?;
        let param = VariationalParameter::from_tensors(mu, rho, MixturePrior::default())?;
        let sigma = param.std()?.to_vec1::<f32>()?;

        assert!(sigma.iter().all(|s| *s > 0. && s.is_finite()));
        assert_abs_diff_eq!(sigma[2], 2f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(sigma[4], 200., epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_two_samples_differ() -> candle_core::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let param = VariationalParameter::new(
            vb,
            (4, 3),
            "weight",
            MixturePrior::default(),
            PosteriorInit::default(),
        )?;

        let mut sampler = Sampler::new(11, ForwardMode::Train);
        let w1 = param.sample(&mut sampler)?.value;
        let w2 = param.sample(&mut sampler)?.value;

        assert_eq!(w1.dims(), &[4, 3]);
        assert_eq!(w1.dims(), w2.dims());
        let diff = w1.sub(&w2)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.);
        Ok(())
    }

    #[test]
    fn test_log_posterior_at_mean() -> candle_core::Result<()> {
        // rho = ln(e - 1) gives sigma = 1
        let rho_val = (std::f64::consts::E - 1.).ln();
        let mu = Tensor::new(&[0.3f64, -0.2], &Device::Cpu)?;
        let rho = Tensor::new(&[rho_val, rho_val], &Device::Cpu)?;
        let param = VariationalParameter::from_tensors(mu.clone(), rho, MixturePrior::default())?;

        let sample = WeightSample {
            value: mu,
            sigma: param.std()?,
        };
        let lq: f64 = param.log_posterior(&sample)?.to_scalar()?;
        assert_abs_diff_eq!(lq, -(2.0 * std::f64::consts::PI).ln(), epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_mc_kl_converges_to_closed_form() -> candle_core::Result<()> {
        let n = 50;
        let sigma = 0.5f64;
        let rho_val = (sigma.exp() - 1.).ln();
        let mu = Tensor::full(0.5f64, n, &Device::Cpu)?;
        let rho = Tensor::full(rho_val, n, &Device::Cpu)?;
        let prior = MixturePrior::new(1.0, 0.3, 1.0).expect("valid prior");
        let param = VariationalParameter::from_tensors(mu.clone(), rho, prior)?;

        let mut sampler = Sampler::new(2024, ForwardMode::Train);
        let num_draws = 2000;
        let mut acc = 0f64;
        for _ in 0..num_draws {
            let sample = param.sample(&mut sampler)?;
            acc += param.kl(&sample)?.to_scalar::<f64>()?;
        }
        let mc_kl = acc / num_draws as f64;

        let exact: f64 = gaussian_kl_closed_form(&mu, &param.std()?, prior.sigma_1())?.to_scalar()?;
        assert_abs_diff_eq!(exact, 22.157, epsilon = 1e-2);
        assert_abs_diff_eq!(mc_kl, exact, epsilon = 0.5);
        Ok(())
    }
}
