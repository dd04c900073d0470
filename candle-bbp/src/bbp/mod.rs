//! Bayes-by-Backprop building blocks.
//!
//! Weights are Gaussian variational parameters sampled with the
//! reparameterization trick; every layer reports a single-sample Monte
//! Carlo KL estimate `log q(w) - log p(w)` against a scale-mixture prior.
//!
//! # Example
//!
//! ```ignore
//! use candle_bbp::bbp::{bayesian_linear, MixturePrior, PosteriorInit};
//! use candle_bbp::{ForwardMode, Sampler};
//!
//! let prior = MixturePrior::new(0.1, 0.4, 0.5)?;
//! let fc = bayesian_linear(16, 4, true, prior, PosteriorInit::default(), vb.pp("fc"))?;
//!
//! let mut sampler = Sampler::new(42, ForwardMode::Train);
//! let (y, kl) = fc.forward(&x, &mut sampler)?;
//! let loss = (task_loss(&y)? + (kl * kl_weight)?)?;
//! ```

mod bayes_linear;
mod mixture_prior;
mod mlp_readout;
mod traits;
mod variational_param;

pub use bayes_linear::{bayesian_linear, BayesianLinear, SampledLinear};
pub use mixture_prior::MixturePrior;
pub use mlp_readout::{MlpReadout, StackBayesLayers};
pub use traits::{BayesModuleT, Prior, VariationalDistribution};
pub use variational_param::{PosteriorInit, VariationalParameter, WeightSample};
