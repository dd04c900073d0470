use candle_core::Tensor;

use super::bayes_linear::BayesianLinear;
use crate::error::{BbpError, Result};

/// Prior distribution over a weight tensor.
pub trait Prior {
    /// Compute log p(w) under the prior.
    ///
    /// # Arguments
    /// * `w` - Weight sample of any shape
    ///
    /// # Returns
    /// Scalar tensor, summed over all elements
    fn log_prob(&self, w: &Tensor) -> candle_core::Result<Tensor>;
}

/// Variational posterior q(w) over a weight tensor.
pub trait VariationalDistribution {
    /// Variational mean μ
    fn mean(&self) -> &Tensor;

    /// Variational standard deviation σ, strictly positive
    fn std(&self) -> candle_core::Result<Tensor>;
}

/// Anything that owns Bayes-by-Backprop layers.
///
/// The KL of a composite module is the sum of the `last_kl` caches of
/// all the [`BayesianLinear`] instances it reports here.
pub trait BayesModuleT {
    /// Every Bayesian linear layer owned by this module, in forward order
    fn bayes_layers(&self) -> Vec<&BayesianLinear>;

    /// Sum of the KL terms cached by the most recent forward pass
    fn total_kl(&self) -> Result<Tensor> {
        let layers = self.bayes_layers();
        let mut iter = layers.iter();
        let first = iter
            .next()
            .ok_or_else(|| BbpError::Config("module has no Bayesian layers".into()))?;
        let mut total = first.cached_kl()?;
        for layer in iter {
            total = (total + layer.cached_kl()?)?;
        }
        Ok(total)
    }
}
