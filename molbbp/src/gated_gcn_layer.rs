use candle_bbp::bbp::{bayesian_linear, BayesModuleT, BayesianLinear, MixturePrior, PosteriorInit};
use candle_bbp::{Result, Sampler};
use candle_core::Tensor;
use candle_nn::{ops, VarBuilder};

use crate::config::{AggregationMode, NormalizationMode};
use crate::graph::GraphTopology;
use crate::normalization::FeatureNorm;

const GATE_EPS: f64 = 1e-6;

#[derive(Clone, Copy, Debug)]
pub struct GatedGcnLayerConfig {
    pub in_dim: usize,
    pub out_dim: usize,
    pub dropout: f64,
    pub normalization: NormalizationMode,
    pub aggregation: AggregationMode,
    pub prior: MixturePrior,
    pub init: PosteriorInit,
}

/// One round of edge-gated message passing
///
/// For an edge `i -> j`:
///
/// ```text
/// e'_ij = C e_ij + D h_i + E h_j
/// σ_ij  = sigmoid(e'_ij)
/// h'_j  = A h_j + Σ_i σ_ij ⊙ B h_i / (Σ_i σ_ij + ε)
/// ```
///
/// followed by normalization, ReLU and dropout on both node and edge states.
/// All five transforms are Bayesian, so the layer KL is the sum of theirs.
pub struct GatedGcnLayer {
    a: BayesianLinear,
    b: BayesianLinear,
    c: BayesianLinear,
    d: BayesianLinear,
    e: BayesianLinear,
    norm_h: FeatureNorm,
    norm_e: FeatureNorm,
    aggregation: AggregationMode,
    dropout: f64,
    out_dim: usize,
}

/// Node states, edge states and KL of one layer
pub struct GatedGcnOutput {
    pub h: Tensor,
    pub e: Tensor,
    pub kl: Tensor,
}

impl GatedGcnLayer {
    pub fn new(config: &GatedGcnLayerConfig, vb: VarBuilder) -> Result<Self> {
        let (din, dout) = (config.in_dim, config.out_dim);
        let linear = |name: &str| {
            bayesian_linear(din, dout, true, config.prior, config.init, vb.pp(name))
        };

        Ok(Self {
            a: linear("A")?,
            b: linear("B")?,
            c: linear("C")?,
            d: linear("D")?,
            e: linear("E")?,
            norm_h: FeatureNorm::new(config.normalization, dout, vb.pp("norm_h"))?,
            norm_e: FeatureNorm::new(config.normalization, dout, vb.pp("norm_e"))?,
            aggregation: config.aggregation,
            dropout: config.dropout,
            out_dim: dout,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// * `topology` - batch connectivity
    /// * `h` - `(N, in_dim)` node states
    /// * `e` - `(E, in_dim)` edge states
    /// * `snorm_n` - `(N, 1)`
    /// * `snorm_e` - `(E, 1)`
    pub fn forward(
        &self,
        topology: &GraphTopology,
        h: &Tensor,
        e: &Tensor,
        snorm_n: &Tensor,
        snorm_e: &Tensor,
        sampler: &mut Sampler,
    ) -> Result<GatedGcnOutput> {
        // draw all five weights first so the KL is complete even without edges
        let a = self.a.sample(sampler)?;
        let b = self.b.sample(sampler)?;
        let c = self.c.sample(sampler)?;
        let d = self.d.sample(sampler)?;
        let e_lin = self.e.sample(sampler)?;
        let kl = ((((&a.kl + &b.kl)? + &c.kl)? + &d.kl)? + &e_lin.kl)?;

        let train = sampler.mode().is_train();
        let ah = a.forward(h)?;

        let (h_new, e_new) = if topology.num_edges() == 0 {
            let e_new = Tensor::zeros((0, self.out_dim), h.dtype(), h.device())?;
            (ah, e_new)
        } else {
            let src = topology.src();
            let dst = topology.dst();

            let dh = d.forward(h)?.index_select(src, 0)?;
            let eh = e_lin.forward(h)?.index_select(dst, 0)?;
            let e_new = ((c.forward(e)? + dh)? + eh)?;
            let gate = ops::sigmoid(&e_new)?;

            let msg = b.forward(h)?.index_select(src, 0)?.mul(&gate)?;
            let num = ah.zeros_like()?.index_add(dst, &msg, 0)?;
            let agg = match self.aggregation {
                AggregationMode::GatedSum => num,
                AggregationMode::GatedMean => {
                    let den = incoming_gate_mass(topology, &gate)?;
                    num.div(&(den + GATE_EPS)?)?
                }
            };
            let e_new = self.norm_e.forward(&e_new, snorm_e, train)?.relu()?;
            let e_new = sampler.dropout(&e_new, self.dropout)?;
            ((ah + agg)?, e_new)
        };

        let h_new = self.norm_h.forward(&h_new, snorm_n, train)?.relu()?;
        let h_new = sampler.dropout(&h_new, self.dropout)?;

        Ok(GatedGcnOutput {
            h: h_new,
            e: e_new,
            kl,
        })
    }
}

impl BayesModuleT for GatedGcnLayer {
    fn bayes_layers(&self) -> Vec<&BayesianLinear> {
        vec![&self.a, &self.b, &self.c, &self.d, &self.e]
    }
}

/// Σ_i σ_ij for every node j, `(N, dim)`; zero for nodes without in-edges
pub fn incoming_gate_mass(topology: &GraphTopology, gate: &Tensor) -> Result<Tensor> {
    let dim = gate.dim(1)?;
    let zeros = Tensor::zeros((topology.num_nodes(), dim), gate.dtype(), gate.device())?;
    Ok(zeros.index_add(topology.dst(), gate, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBatch, MolGraph};
    use approx::assert_abs_diff_eq;
    use candle_bbp::ForwardMode;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(varmap: &VarMap, normalization: NormalizationMode) -> Result<GatedGcnLayer> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let config = GatedGcnLayerConfig {
            in_dim: 4,
            out_dim: 4,
            dropout: 0.,
            normalization,
            aggregation: AggregationMode::GatedMean,
            prior: MixturePrior::default(),
            init: PosteriorInit::default(),
        };
        GatedGcnLayer::new(&config, vb.pp("layer"))
    }

    fn batch(graph: &MolGraph) -> Result<GraphBatch> {
        GraphBatch::collate(&[graph], 2, 1, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_isolated_node_is_finite() -> Result<()> {
        let varmap = VarMap::new();
        let layer = layer(&varmap, NormalizationMode::Graph)?;
        let g = MolGraph {
            smiles: None,
            atoms: vec![0, 1, 0],
            bonds: vec![[0, 1, 0]],
            target: vec![1.],
        };
        let batch = batch(&g)?;
        let h = Tensor::randn(0f32, 1f32, (3, 4), &Device::Cpu)?;
        let e = Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu)?;

        let mut sampler = Sampler::new(3, ForwardMode::Train);
        let out = layer.forward(
            &batch.topology,
            &h,
            &e,
            &batch.snorm_n,
            &batch.snorm_e,
            &mut sampler,
        )?;
        assert_eq!(out.h.dims(), &[3, 4]);
        assert_eq!(out.e.dims(), &[2, 4]);
        for v in out.h.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
            assert!(v >= 0.);
        }
        Ok(())
    }

    #[test]
    fn test_layer_kl_is_sum_of_sublayers() -> Result<()> {
        let varmap = VarMap::new();
        let layer = layer(&varmap, NormalizationMode::None)?;
        let g = MolGraph {
            smiles: None,
            atoms: vec![0],
            bonds: vec![],
            target: vec![0.],
        };
        let batch = batch(&g)?;
        let h = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        let e = Tensor::zeros((0, 4), DType::F32, &Device::Cpu)?;

        let mut sampler = Sampler::new(5, ForwardMode::Train);
        let out = layer.forward(
            &batch.topology,
            &h,
            &e,
            &batch.snorm_n,
            &batch.snorm_e,
            &mut sampler,
        )?;
        assert_eq!(out.e.dims(), &[0, 4]);

        let mut expected = 0f32;
        for sub in layer.bayes_layers() {
            if let Some(kl) = sub.last_kl() {
                expected += kl.to_scalar::<f32>()?;
            }
        }
        assert_eq!(layer.bayes_layers().len(), 5);
        assert_abs_diff_eq!(out.kl.to_scalar::<f32>()?, expected, epsilon = 1e-1);
        assert_abs_diff_eq!(
            layer.total_kl()?.to_scalar::<f32>()?,
            expected,
            epsilon = 1e-1
        );
        Ok(())
    }

    #[test]
    fn test_gate_mass_counts_in_edges() -> Result<()> {
        let g = MolGraph {
            smiles: None,
            atoms: vec![0, 0, 0],
            bonds: vec![[0, 1, 0], [0, 2, 0]],
            target: vec![0.],
        };
        let batch = batch(&g)?;
        let gate = Tensor::ones((4, 1), DType::F32, &Device::Cpu)?;
        let mass = incoming_gate_mass(&batch.topology, &gate)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(mass, vec![2., 1., 1.]);
        Ok(())
    }

    #[test]
    fn test_self_loop_feeds_its_own_node() -> Result<()> {
        let varmap = VarMap::new();
        let layer = layer(&varmap, NormalizationMode::None)?;
        // node 0 carries a self-loop, node 1 has no edges
        let g = MolGraph {
            smiles: None,
            atoms: vec![0, 0],
            bonds: vec![[0, 0, 0]],
            target: vec![0.],
        };
        let batch = batch(&g)?;
        assert_eq!(batch.topology.num_edges(), 1);

        let row = Tensor::randn(0f32, 1f32, (1, 4), &Device::Cpu)?;
        let h = Tensor::cat(&[&row, &row], 0)?;
        let e = Tensor::randn(0f32, 1f32, (1, 4), &Device::Cpu)?;

        let mut sampler = Sampler::new(0, ForwardMode::Mean);
        let out = layer.forward(
            &batch.topology,
            &h,
            &e,
            &batch.snorm_n,
            &batch.snorm_e,
            &mut sampler,
        )?;
        let out = out.h.to_vec2::<f32>()?;

        // with a single incoming edge the gated mean is B h itself
        let ah = layer.a.sample(&mut sampler)?.forward(&row)?;
        let bh = layer.b.sample(&mut sampler)?.forward(&row)?;
        let looped = (&ah + &bh)?.relu()?.to_vec2::<f32>()?;
        let isolated = ah.relu()?.to_vec2::<f32>()?;

        for k in 0..4 {
            assert_abs_diff_eq!(out[0][k], looped[0][k], epsilon = 1e-4);
            assert_abs_diff_eq!(out[1][k], isolated[0][k], epsilon = 1e-6);
        }
        Ok(())
    }
}
