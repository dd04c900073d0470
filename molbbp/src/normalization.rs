use candle_bbp::Result;
use candle_core::Tensor;
use candle_nn::{BatchNorm, LayerNorm, Module, ModuleT, VarBuilder};

use crate::config::NormalizationMode;

/// Feature normalization applied to node or edge states inside a conv layer
pub enum FeatureNorm {
    Identity,
    /// x * snorm, snorm = 1/sqrt(graph size)
    Graph,
    Batch(BatchNorm),
    Layer(LayerNorm),
}

impl FeatureNorm {
    /// Variables (if any) live directly under `vb`
    pub fn new(mode: NormalizationMode, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match mode {
            NormalizationMode::None => FeatureNorm::Identity,
            NormalizationMode::Graph => FeatureNorm::Graph,
            NormalizationMode::Batch => FeatureNorm::Batch(candle_nn::batch_norm(
                dim,
                candle_nn::BatchNormConfig::default(),
                vb,
            )?),
            NormalizationMode::Layer => FeatureNorm::Layer(candle_nn::layer_norm(dim, 1e-5, vb)?),
        })
    }

    /// * `x` - `(rows, dim)` states
    /// * `snorm` - `(rows, 1)` size norms, used by graph norm only
    /// * `train` - batch norm uses batch statistics and updates its running ones
    pub fn forward(&self, x: &Tensor, snorm: &Tensor, train: bool) -> Result<Tensor> {
        Ok(match self {
            FeatureNorm::Identity => x.clone(),
            FeatureNorm::Graph => x.broadcast_mul(snorm)?,
            FeatureNorm::Batch(bn) => bn.forward_t(x, train)?,
            FeatureNorm::Layer(ln) => ln.forward(x)?,
        })
    }
}
