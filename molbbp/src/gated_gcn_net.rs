use candle_bbp::bbp::{
    bayesian_linear, BayesModuleT, BayesianLinear, MlpReadout, SampledLinear,
};
use candle_bbp::candle_loss_functions::{bce_with_logits, mse};
use candle_bbp::{BbpError, Result, Sampler};
use candle_core::{DType, Device, Tensor};
use candle_nn::{ops, VarBuilder, VarMap};
use log::debug;

use crate::config::{NetConfig, ResidualMode, TaskType};
use crate::gated_gcn_layer::{GatedGcnLayer, GatedGcnLayerConfig};
use crate::graph::{GraphBatch, GraphTopology};
use crate::readout::graph_readout;

/// z h_new + (1 - z) h_in
pub fn gated_residual(z: &Tensor, h_new: &Tensor, h_in: &Tensor) -> Result<Tensor> {
    let keep = z.mul(h_new)?;
    let carry = z.affine(-1., 1.)?.mul(h_in)?;
    Ok((keep + carry)?)
}

enum Residual {
    None,
    Add,
    /// W_g: [h_new, h_in] -> gate logits
    Gated(BayesianLinear),
}

/// Residual policy with its gate weights resolved for one forward pass
enum ResolvedResidual {
    None,
    Add,
    Gated(SampledLinear),
}

impl Residual {
    fn resolve(&self, sampler: &mut Sampler) -> Result<ResolvedResidual> {
        Ok(match self {
            Residual::None => ResolvedResidual::None,
            Residual::Add => ResolvedResidual::Add,
            Residual::Gated(w_g) => ResolvedResidual::Gated(w_g.sample(sampler)?),
        })
    }
}

impl ResolvedResidual {
    fn apply(&self, h_new: Tensor, h_in: &Tensor) -> Result<Tensor> {
        match self {
            ResolvedResidual::None => Ok(h_new),
            ResolvedResidual::Add => Ok((h_new + h_in)?),
            ResolvedResidual::Gated(w_g) => {
                let z = ops::sigmoid(&w_g.forward(&Tensor::cat(&[&h_new, h_in], 1)?)?)?;
                gated_residual(&z, &h_new, h_in)
            }
        }
    }

    fn kl(&self) -> Option<&Tensor> {
        match self {
            ResolvedResidual::Gated(w_g) => Some(&w_g.kl),
            _ => None,
        }
    }
}

enum PredictionHead {
    Linear(BayesianLinear),
    Mlp(MlpReadout),
}

impl PredictionHead {
    fn forward(&self, x: &Tensor, sampler: &mut Sampler) -> Result<(Tensor, Tensor)> {
        match self {
            PredictionHead::Linear(fc) => fc.forward(x, sampler),
            PredictionHead::Mlp(mlp) => mlp.forward(x, sampler),
        }
    }

    fn bayes_layers(&self) -> Vec<&BayesianLinear> {
        match self {
            PredictionHead::Linear(fc) => vec![fc],
            PredictionHead::Mlp(mlp) => mlp.bayes_layers(),
        }
    }
}

/// Residual gated graph ConvNet with Bayes-by-Backprop weights
///
/// atoms --embedding_h--> h, bonds --embedding_e--> e,
/// L gated convolutions (with residual policy), per-node `linear_ro`,
/// graph readout, prediction head.
///
/// Every forward returns `(prediction, kl)` where `kl` sums the
/// single-sample estimates of all Bayesian layers of that pass.
pub struct GatedGcnNet {
    embedding_h: BayesianLinear,
    embedding_e: BayesianLinear,
    layers: Vec<GatedGcnLayer>,
    residual: Residual,
    linear_ro: BayesianLinear,
    head: PredictionHead,
    config: NetConfig,
    task: TaskType,
    pred_dim: usize,
}

impl GatedGcnNet {
    pub fn new(config: &NetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let task = config.task()?;
        let pred_dim = config.pred_dim()?;
        let prior = config.prior()?;
        let init = config.posterior_init();
        let hidden = config.hidden_dim;

        let embedding_h = bayesian_linear(
            config.num_atom_type,
            hidden,
            false,
            prior,
            init,
            vb.pp("embedding_h"),
        )?;

        // without bond features every edge carries a constant 1
        let edge_in = if config.edge_feat { config.num_bond_type } else { 1 };
        let embedding_e = bayesian_linear(edge_in, hidden, false, prior, init, vb.pp("embedding_e"))?;

        let layer_config = GatedGcnLayerConfig {
            in_dim: hidden,
            out_dim: hidden,
            dropout: config.dropout,
            normalization: config.normalization()?,
            aggregation: config.aggregation,
            prior,
            init,
        };
        let layers = (0..config.num_layers)
            .map(|l| GatedGcnLayer::new(&layer_config, vb.pp(format!("layers.{}", l))))
            .collect::<Result<Vec<_>>>()?;

        let residual = match config.residual {
            ResidualMode::None => Residual::None,
            ResidualMode::Add => Residual::Add,
            ResidualMode::Gated => Residual::Gated(bayesian_linear(
                2 * hidden,
                hidden,
                false,
                prior,
                init,
                vb.pp("W_g"),
            )?),
        };

        let linear_ro = bayesian_linear(hidden, config.out_dim, false, prior, init, vb.pp("linear_ro"))?;

        let head = match config.mlp_readout_layers {
            Some(num_hidden) => PredictionHead::Mlp(MlpReadout::new(
                config.out_dim,
                pred_dim,
                num_hidden,
                true,
                prior,
                init,
                vb.pp("mlp_readout"),
            )?),
            None => PredictionHead::Linear(bayesian_linear(
                config.out_dim,
                pred_dim,
                true,
                prior,
                init,
                vb.pp("linear_predict"),
            )?),
        };

        debug!(
            "GatedGcnNet: {} layers, hidden {}, out {}, pred {}, residual {}, readout {:?}",
            config.num_layers, hidden, config.out_dim, pred_dim, config.residual, config.readout
        );

        Ok(Self {
            embedding_h,
            embedding_e,
            layers,
            residual,
            linear_ro,
            head,
            config: config.clone(),
            task,
            pred_dim,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn task(&self) -> TaskType {
        self.task
    }

    pub fn pred_dim(&self) -> usize {
        self.pred_dim
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// * `topology` - batch connectivity
    /// * `h` - `(N, num_atom_type)` atom features
    /// * `e` - `(E, num_bond_type)` bond features (ignored unless `edge_feat`)
    /// * `snorm_n` - `(N, 1)` node size norms
    /// * `snorm_e` - `(E, 1)` edge size norms
    ///
    /// Returns `(prediction (B, pred_dim), kl)`
    pub fn forward(
        &self,
        topology: &GraphTopology,
        h: &Tensor,
        e: &Tensor,
        snorm_n: &Tensor,
        snorm_e: &Tensor,
        sampler: &mut Sampler,
    ) -> Result<(Tensor, Tensor)> {
        let (h, mut kl) = self.embedding_h.forward(h, sampler)?;
        let mut h = sampler.dropout(&h, self.config.in_feat_dropout)?;

        let emb_e = self.embedding_e.sample(sampler)?;
        kl = (kl + &emb_e.kl)?;
        let mut e = if topology.num_edges() == 0 {
            Tensor::zeros((0, self.config.hidden_dim), h.dtype(), h.device())?
        } else if self.config.edge_feat {
            emb_e.forward(e)?
        } else {
            let ones = Tensor::ones((topology.num_edges(), 1), h.dtype(), h.device())?;
            emb_e.forward(&ones)?
        };

        let residual = self.residual.resolve(sampler)?;
        if let Some(kl_g) = residual.kl() {
            kl = (kl + kl_g)?;
        }

        for layer in self.layers.iter() {
            let h_in = h;
            let out = layer.forward(topology, &h_in, &e, snorm_n, snorm_e, sampler)?;
            kl = (kl + out.kl)?;
            e = out.e;
            h = residual.apply(out.h, &h_in)?;
        }

        let (h, kl_ro) = self.linear_ro.forward(&h, sampler)?;
        let hg = graph_readout(&h, topology, self.config.readout)?;
        let (pred, kl_head) = self.head.forward(&hg, sampler)?;

        let kl = ((kl + kl_ro)? + kl_head)?;
        Ok((pred, kl))
    }

    pub fn forward_batch(&self, batch: &GraphBatch, sampler: &mut Sampler) -> Result<(Tensor, Tensor)> {
        self.forward(
            &batch.topology,
            &batch.node_features,
            &batch.edge_features,
            &batch.snorm_n,
            &batch.snorm_e,
            sampler,
        )
    }

    /// Mean task loss over observed targets (NaN entries are skipped)
    ///
    /// classification: BCE with logits; regression: MSE
    pub fn loss(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        if pred.dims() != target.dims() {
            return Err(BbpError::ShapeMismatch {
                layer: "loss".into(),
                expected: self.pred_dim,
                actual: target.dims().to_vec(),
            });
        }
        let target = target.to_dtype(pred.dtype())?;

        let values = target.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let observed: Vec<u32> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .map(|(i, _)| i as u32)
            .collect();

        let (pred, target) = if observed.len() == values.len() {
            (pred.clone(), target)
        } else if observed.is_empty() {
            return Ok(Tensor::zeros((), pred.dtype(), pred.device())?);
        } else {
            let n = observed.len();
            let idx = Tensor::from_vec(observed, n, pred.device())?;
            (
                pred.flatten_all()?.index_select(&idx, 0)?,
                target.flatten_all()?.index_select(&idx, 0)?,
            )
        };

        Ok(match self.task {
            TaskType::Classification => bce_with_logits(&pred, &target)?,
            TaskType::Regression => mse(&pred, &target)?,
        })
    }

    /// Map raw predictions to scores: probabilities for classification
    pub fn scores(&self, pred: &Tensor) -> Result<Tensor> {
        Ok(match self.task {
            TaskType::Classification => ops::sigmoid(pred)?,
            TaskType::Regression => pred.clone(),
        })
    }
}

impl BayesModuleT for GatedGcnNet {
    fn bayes_layers(&self) -> Vec<&BayesianLinear> {
        let mut out = vec![&self.embedding_h, &self.embedding_e];
        for layer in self.layers.iter() {
            out.extend(layer.bayes_layers());
        }
        if let Residual::Gated(w_g) = &self.residual {
            out.push(w_g);
        }
        out.push(&self.linear_ro);
        out.extend(self.head.bayes_layers());
        out
    }
}

/// Allocate every variable of the network in a fresh `VarMap`
pub fn build_model(config: &NetConfig, device: &Device) -> Result<(GatedGcnNet, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, config.dtype(), device);
    let model = GatedGcnNet::new(config, vb)?;
    Ok((model, varmap))
}
