use candle_core::Tensor;

use super::traits::Prior;
use crate::error::{BbpError, Result};

/// Fixed scale mixture prior
///
/// p(w) = π N(w; 0, σ₁²) + (1 - π) N(w; 0, σ₂²)
///
/// The hyperparameters are validated once and never change afterwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixturePrior {
    sigma_1: f64,
    sigma_2: f64,
    pi: f64,
}

impl Default for MixturePrior {
    fn default() -> Self {
        Self {
            sigma_1: 0.1,
            sigma_2: 0.4,
            pi: 1.0,
        }
    }
}

impl MixturePrior {
    /// Create a mixture prior.
    ///
    /// # Arguments
    /// * `sigma_1` - scale of the first component, > 0
    /// * `sigma_2` - scale of the second component, > 0
    /// * `pi` - weight of the first component, in [0, 1]
    pub fn new(sigma_1: f64, sigma_2: f64, pi: f64) -> Result<Self> {
        if !(sigma_1.is_finite() && sigma_1 > 0.) {
            return Err(BbpError::InvalidPriorParameters(format!(
                "sigma_1 must be positive, got {}",
                sigma_1
            )));
        }
        if !(sigma_2.is_finite() && sigma_2 > 0.) {
            return Err(BbpError::InvalidPriorParameters(format!(
                "sigma_2 must be positive, got {}",
                sigma_2
            )));
        }
        if !(0. ..=1.).contains(&pi) {
            return Err(BbpError::InvalidPriorParameters(format!(
                "pi must lie in [0, 1], got {}",
                pi
            )));
        }
        Ok(Self {
            sigma_1,
            sigma_2,
            pi,
        })
    }

    pub fn sigma_1(&self) -> f64 {
        self.sigma_1
    }

    pub fn sigma_2(&self) -> f64 {
        self.sigma_2
    }

    pub fn pi(&self) -> f64 {
        self.pi
    }
}

/// Elementwise log N(w; 0, σ²) = -0.5 * [w²/σ² + 2 ln σ + ln 2π]
fn log_normal_zero_mean(w: &Tensor, sigma: f64) -> candle_core::Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let const_term = 2.0 * sigma.ln() + ln_2pi;
    (w.sqr()? / sigma.powi(2))?.affine(-0.5, -0.5 * const_term)
}

impl Prior for MixturePrior {
    fn log_prob(&self, w: &Tensor) -> candle_core::Result<Tensor> {
        if self.pi >= 1. {
            return log_normal_zero_mean(w, self.sigma_1)?.sum_all();
        }
        if self.pi <= 0. {
            return log_normal_zero_mean(w, self.sigma_2)?.sum_all();
        }

        // log-sum-exp over the two weighted components
        let a = (log_normal_zero_mean(w, self.sigma_1)? + self.pi.ln())?;
        let b = (log_normal_zero_mean(w, self.sigma_2)? + (1. - self.pi).ln())?;
        let m = a.maximum(&b)?;
        let lse = (a.sub(&m)?.exp()? + b.sub(&m)?.exp()?)?.log()?;
        (m + lse)?.sum_all()
    }
}
