use candle_core::Tensor;
use candle_nn::{Activation, Module, VarBuilder};

use super::bayes_linear::{bayesian_linear, BayesianLinear};
use super::mixture_prior::MixturePrior;
use super::traits::BayesModuleT;
use super::variational_param::PosteriorInit;
use crate::candle_sampler::Sampler;
use crate::error::Result;

/// A stack of alternating Bayesian linear and activation layers
pub struct StackBayesLayers {
    module_layers: Vec<BayesianLinear>,
    activation_layers: Vec<Option<Activation>>,
}

impl StackBayesLayers {
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: BayesianLinear, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: BayesianLinear) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    /// Forward through every layer; returns `(output, summed kl)`
    pub fn forward(&self, input: &Tensor, sampler: &mut Sampler) -> Result<(Tensor, Tensor)> {
        let mut x = input.clone();
        let mut kl_tot: Option<Tensor> = None;
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            let (y, kl) = module.forward(&x, sampler)?;
            x = match activation {
                Some(activation) => activation.forward(&y)?,
                None => y,
            };
            kl_tot = Some(match kl_tot {
                Some(acc) => (acc + kl)?,
                None => kl,
            });
        }
        let kl_tot = match kl_tot {
            Some(kl) => kl,
            None => Tensor::zeros((), input.dtype(), input.device())?,
        };
        Ok((x, kl_tot))
    }
}

impl Default for StackBayesLayers {
    fn default() -> Self {
        Self::new()
    }
}

impl BayesModuleT for StackBayesLayers {
    fn bayes_layers(&self) -> Vec<&BayesianLinear> {
        self.module_layers.iter().collect()
    }
}

/// MLP readout after the graph-level representation:
/// `num_hidden` Bayesian `in -> in` layers with ReLU, then `in -> out`
pub struct MlpReadout {
    stack: StackBayesLayers,
}

impl MlpReadout {
    /// Variables live under `{prefix}.fc.{l}`
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        num_hidden: usize,
        bias: bool,
        prior: MixturePrior,
        init: PosteriorInit,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut stack = StackBayesLayers::new();
        for l in 0..num_hidden {
            let fc = bayesian_linear(in_dim, in_dim, bias, prior, init, vb.pp(format!("fc.{}", l)))?;
            stack.push_with_act(fc, Activation::Relu);
        }
        let last = bayesian_linear(
            in_dim,
            out_dim,
            bias,
            prior,
            init,
            vb.pp(format!("fc.{}", num_hidden)),
        )?;
        stack.push(last);
        Ok(Self { stack })
    }

    pub fn num_layers(&self) -> usize {
        self.stack.len()
    }

    pub fn forward(&self, x: &Tensor, sampler: &mut Sampler) -> Result<(Tensor, Tensor)> {
        self.stack.forward(x, sampler)
    }
}

impl BayesModuleT for MlpReadout {
    fn bayes_layers(&self) -> Vec<&BayesianLinear> {
        self.stack.bayes_layers()
    }
}
