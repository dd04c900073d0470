use candle_bbp::Result;
use candle_core::{Tensor, D};

use crate::config::ReadoutMode;
use crate::graph::GraphTopology;

/// Pool node states `(N, dim)` into graph states `(B, dim)`
pub fn graph_readout(h: &Tensor, topology: &GraphTopology, mode: ReadoutMode) -> Result<Tensor> {
    match mode {
        ReadoutMode::Sum => sum_pool(h, topology),
        ReadoutMode::Mean => mean_pool(h, topology),
        ReadoutMode::Max => max_pool(h, topology),
    }
}

fn sum_pool(h: &Tensor, topology: &GraphTopology) -> Result<Tensor> {
    let dim = h.dim(D::Minus1)?;
    let zeros = Tensor::zeros((topology.num_graphs(), dim), h.dtype(), h.device())?;
    Ok(zeros.index_add(topology.graph_index(), h, 0)?)
}

/// an empty graph pools to zero
fn mean_pool(h: &Tensor, topology: &GraphTopology) -> Result<Tensor> {
    let counts: Vec<f32> = topology
        .node_counts()
        .iter()
        .map(|&n| n.max(1) as f32)
        .collect();
    let counts = Tensor::from_vec(counts, (topology.num_graphs(), 1), h.device())?
        .to_dtype(h.dtype())?;
    Ok(sum_pool(h, topology)?.broadcast_div(&counts)?)
}

/// Gather nodes into a `(B, max_n, dim)` block padded with -inf and reduce
/// once over the node axis. An empty graph points its first slot at a zero
/// row, so it pools to zero.
fn max_pool(h: &Tensor, topology: &GraphTopology) -> Result<Tensor> {
    let (num_nodes, dim) = h.dims2()?;
    let num_graphs = topology.num_graphs();
    let max_n = topology.node_counts().iter().copied().max().unwrap_or(0).max(1);

    let pad_row = num_nodes as u32;
    let zero_row = pad_row + 1;
    let mut index = Vec::with_capacity(num_graphs * max_n);
    let mut offset = 0;
    for &n in topology.node_counts() {
        for k in 0..max_n {
            index.push(match (n, k) {
                (0, 0) => zero_row,
                _ if k < n => (offset + k) as u32,
                _ => pad_row,
            });
        }
        offset += n;
    }
    let index = Tensor::from_vec(index, num_graphs * max_n, h.device())?;

    let pad = Tensor::full(f32::NEG_INFINITY, (1, dim), h.device())?.to_dtype(h.dtype())?;
    let zero = Tensor::zeros((1, dim), h.dtype(), h.device())?;
    let padded = Tensor::cat(&[h, &pad, &zero], 0)?;

    Ok(padded
        .index_select(&index, 0)?
        .reshape((num_graphs, max_n, dim))?
        .max(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// graphs of 2 and 1 nodes
    fn setup() -> Result<(Tensor, GraphTopology)> {
        let h = Tensor::new(&[[1f32, -1.], [3., 5.], [2., 2.]], &Device::Cpu)?;
        let topology = GraphTopology::new(vec![0, 1], vec![1, 0], vec![2, 1], vec![2, 0], &Device::Cpu)?;
        Ok((h, topology))
    }

    #[test]
    fn test_readouts() -> Result<()> {
        let (h, topology) = setup()?;

        let sum = graph_readout(&h, &topology, ReadoutMode::Sum)?.to_vec2::<f32>()?;
        assert_eq!(sum, vec![vec![4., 4.], vec![2., 2.]]);

        let mean = graph_readout(&h, &topology, ReadoutMode::Mean)?.to_vec2::<f32>()?;
        assert_eq!(mean, vec![vec![2., 2.], vec![2., 2.]]);

        let max = graph_readout(&h, &topology, ReadoutMode::Max)?.to_vec2::<f32>()?;
        assert_eq!(max, vec![vec![3., 5.], vec![2., 2.]]);
        Ok(())
    }

    #[test]
    fn test_unknown_readout_pools_as_sum() -> Result<()> {
        let (h, topology) = setup()?;
        let mode = ReadoutMode::parse("set2set");
        let pooled = graph_readout(&h, &topology, mode)?.to_vec2::<f32>()?;
        assert_eq!(pooled, vec![vec![4., 4.], vec![2., 2.]]);
        Ok(())
    }

    #[test]
    fn test_empty_graph_pools_to_zero() -> Result<()> {
        let h = Tensor::new(&[[1f32, 2.]], &Device::Cpu)?;
        let topology = GraphTopology::new(vec![], vec![], vec![0, 1], vec![0, 0], &Device::Cpu)?;
        for mode in [ReadoutMode::Sum, ReadoutMode::Mean, ReadoutMode::Max] {
            let pooled = graph_readout(&h, &topology, mode)?.to_vec2::<f32>()?;
            assert_eq!(pooled, vec![vec![0., 0.], vec![1., 2.]]);
        }
        Ok(())
    }

    #[test]
    fn test_max_pool_over_uneven_graphs() -> Result<()> {
        let h = Tensor::new(
            &[[-5f32, -1.], [-2., -7.], [-3., -3.], [4., 0.], [1., 9.], [-1., -1.]],
            &Device::Cpu,
        )?;
        // sizes 3, 0, 1, 2; negative states must not be lifted to zero by padding
        let topology = GraphTopology::new(vec![], vec![], vec![3, 0, 1, 2], vec![0; 4], &Device::Cpu)?;
        let max = graph_readout(&h, &topology, ReadoutMode::Max)?.to_vec2::<f32>()?;
        assert_eq!(
            max,
            vec![vec![-2., -1.], vec![0., 0.], vec![4., 0.], vec![1., 9.]]
        );
        Ok(())
    }
}
