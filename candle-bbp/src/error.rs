//! Error types for Bayes-by-Backprop layers and the models built on them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BbpError {
    /// Missing or invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Feature dimension of the input does not match the layer.
    #[error("shape mismatch in `{layer}`: expected last dim {expected}, got input {actual:?}")]
    ShapeMismatch {
        layer: String,
        expected: usize,
        actual: Vec<usize>,
    },

    /// Prior scales must be positive and the mixture weight within [0, 1].
    #[error("invalid prior parameters: {0}")]
    InvalidPriorParameters(String),

    /// Graph topology violates an invariant (edge endpoints, node types).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// KL was queried before the layer ran a forward pass.
    #[error("no KL cached for `{0}`; run a forward pass first")]
    KlUnavailable(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, BbpError>;
