//! Molecular graphs and their batched, disjoint-union form.

use candle_bbp::{BbpError, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// One molecule as stored on disk
///
/// `bonds` are undirected `[src, dst, bond_type]` triples; `target` holds one
/// value per task (NaN marks a missing label, stored as `null`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MolGraph {
    #[serde(default)]
    pub smiles: Option<String>,
    pub atoms: Vec<usize>,
    #[serde(default)]
    pub bonds: Vec<[usize; 3]>,
    #[serde(with = "missing_labels")]
    pub target: Vec<f32>,
}

/// `null` in JSON maps to NaN in memory and back
mod missing_labels {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(target: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        target
            .iter()
            .map(|&y| if y.is_nan() { None } else { Some(y) })
            .collect::<Vec<Option<f32>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let target = Vec::<Option<f32>>::deserialize(deserializer)?;
        Ok(target.into_iter().map(|y| y.unwrap_or(f32::NAN)).collect())
    }
}

impl MolGraph {
    pub fn num_atoms(&self) -> usize {
        self.atoms.len()
    }

    /// Directed edges `(src, dst, bond_type)`: one per direction, self-loops once
    pub fn directed_edges(&self) -> Vec<(usize, usize, usize)> {
        let mut edges = Vec::with_capacity(2 * self.bonds.len());
        for &[a, b, t] in self.bonds.iter() {
            edges.push((a, b, t));
            if a != b {
                edges.push((b, a, t));
            }
        }
        edges
    }

    fn check(&self, num_atom_type: usize, num_bond_type: usize) -> Result<()> {
        let name = self.smiles.as_deref().unwrap_or("<unnamed>");
        if self.atoms.is_empty() {
            return Err(BbpError::InvalidGraph(format!("{}: molecule without atoms", name)));
        }
        if let Some(&t) = self.atoms.iter().find(|&&t| t >= num_atom_type) {
            return Err(BbpError::InvalidGraph(format!(
                "{}: atom type {} >= num_atom_type {}",
                name, t, num_atom_type
            )));
        }
        for &[a, b, t] in self.bonds.iter() {
            if a >= self.atoms.len() || b >= self.atoms.len() {
                return Err(BbpError::InvalidGraph(format!(
                    "{}: bond ({}, {}) references a missing atom (n = {})",
                    name,
                    a,
                    b,
                    self.atoms.len()
                )));
            }
            if t >= num_bond_type {
                return Err(BbpError::InvalidGraph(format!(
                    "{}: bond type {} >= num_bond_type {}",
                    name, t, num_bond_type
                )));
            }
        }
        Ok(())
    }
}

/// Connectivity of a batch of graphs
///
/// Nodes of one graph are contiguous; `src`/`dst` are `u32` index vectors
/// into the batch-wide node dimension.
#[derive(Clone, Debug)]
pub struct GraphTopology {
    src: Tensor,
    dst: Tensor,
    graph_index: Tensor,
    node_counts: Vec<usize>,
    edge_counts: Vec<usize>,
    num_nodes: usize,
    num_edges: usize,
}

impl GraphTopology {
    /// * `src`, `dst` - directed edges over the batch-wide node indices
    /// * `node_counts` - nodes per graph, in batch order
    /// * `edge_counts` - edges per graph, in batch order
    pub fn new(
        src: Vec<u32>,
        dst: Vec<u32>,
        node_counts: Vec<usize>,
        edge_counts: Vec<usize>,
        device: &Device,
    ) -> Result<Self> {
        let num_nodes: usize = node_counts.iter().sum();
        let num_edges = src.len();

        if dst.len() != num_edges {
            return Err(BbpError::InvalidGraph(format!(
                "{} sources but {} destinations",
                num_edges,
                dst.len()
            )));
        }
        if node_counts.len() != edge_counts.len() || edge_counts.iter().sum::<usize>() != num_edges
        {
            return Err(BbpError::InvalidGraph(
                "edge counts do not partition the edge list".into(),
            ));
        }

        // every edge must stay inside its own graph
        let mut offset = 0usize;
        let mut e = 0usize;
        for (&n, &m) in node_counts.iter().zip(edge_counts.iter()) {
            for k in e..(e + m) {
                let (s, d) = (src[k] as usize, dst[k] as usize);
                if s < offset || s >= offset + n || d < offset || d >= offset + n {
                    return Err(BbpError::InvalidGraph(format!(
                        "edge {} ({} -> {}) leaves its graph (nodes {}..{})",
                        k,
                        s,
                        d,
                        offset,
                        offset + n
                    )));
                }
            }
            offset += n;
            e += m;
        }

        let graph_index: Vec<u32> = node_counts
            .iter()
            .enumerate()
            .flat_map(|(g, &n)| std::iter::repeat_n(g as u32, n))
            .collect();

        Ok(Self {
            src: Tensor::from_vec(src, num_edges, device)?,
            dst: Tensor::from_vec(dst, num_edges, device)?,
            graph_index: Tensor::from_vec(graph_index, num_nodes, device)?,
            node_counts,
            edge_counts,
            num_nodes,
            num_edges,
        })
    }

    pub fn src(&self) -> &Tensor {
        &self.src
    }

    pub fn dst(&self) -> &Tensor {
        &self.dst
    }

    /// graph id of every node, `(N,)` `u32`
    pub fn graph_index(&self) -> &Tensor {
        &self.graph_index
    }

    pub fn node_counts(&self) -> &[usize] {
        &self.node_counts
    }

    pub fn edge_counts(&self) -> &[usize] {
        &self.edge_counts
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn num_graphs(&self) -> usize {
        self.node_counts.len()
    }
}

/// A collated minibatch: topology, one-hot features, size norms, targets
pub struct GraphBatch {
    pub topology: GraphTopology,
    /// `(N, num_atom_type)`
    pub node_features: Tensor,
    /// `(E, num_bond_type)`
    pub edge_features: Tensor,
    /// `(N, 1)`, 1/sqrt(nodes in the node's graph)
    pub snorm_n: Tensor,
    /// `(E, 1)`, 1/sqrt(edges in the edge's graph)
    pub snorm_e: Tensor,
    /// `(B, T)`
    pub targets: Tensor,
    pub smiles: Vec<Option<String>>,
}

impl GraphBatch {
    /// Disjoint union of `graphs`, features built on the host then moved
    pub fn collate(
        graphs: &[&MolGraph],
        num_atom_type: usize,
        num_bond_type: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let first = graphs
            .first()
            .ok_or_else(|| BbpError::InvalidGraph("empty batch".into()))?;
        let num_tasks = first.target.len();

        let mut node_counts = Vec::with_capacity(graphs.len());
        let mut edge_counts = Vec::with_capacity(graphs.len());
        let mut src = vec![];
        let mut dst = vec![];
        let mut node_onehot = vec![];
        let mut edge_onehot = vec![];
        let mut snorm_n = vec![];
        let mut snorm_e = vec![];
        let mut targets = Vec::with_capacity(graphs.len() * num_tasks);

        let mut offset = 0usize;
        for g in graphs.iter() {
            g.check(num_atom_type, num_bond_type)?;
            if g.target.len() != num_tasks {
                return Err(BbpError::InvalidGraph(format!(
                    "target width {} differs from {} in the same batch",
                    g.target.len(),
                    num_tasks
                )));
            }

            let n = g.num_atoms();
            for &t in g.atoms.iter() {
                let mut row = vec![0f32; num_atom_type];
                row[t] = 1.;
                node_onehot.extend(row);
            }
            let n_norm = if n > 0 { 1. / (n as f32).sqrt() } else { 0. };
            snorm_n.extend(std::iter::repeat_n(n_norm, n));

            let edges = g.directed_edges();
            let m = edges.len();
            let e_norm = if m > 0 { 1. / (m as f32).sqrt() } else { 0. };
            for (a, b, t) in edges {
                src.push((offset + a) as u32);
                dst.push((offset + b) as u32);
                let mut row = vec![0f32; num_bond_type];
                row[t] = 1.;
                edge_onehot.extend(row);
                snorm_e.push(e_norm);
            }

            targets.extend(g.target.iter().copied());
            node_counts.push(n);
            edge_counts.push(m);
            offset += n;
        }

        let num_nodes = offset;
        let num_edges = src.len();
        let topology = GraphTopology::new(src, dst, node_counts, edge_counts, device)?;

        let to_device = |v: Vec<f32>, shape: (usize, usize)| -> Result<Tensor> {
            Ok(Tensor::from_vec(v, shape, &Device::Cpu)?
                .to_dtype(dtype)?
                .to_device(device)?)
        };

        Ok(Self {
            topology,
            node_features: to_device(node_onehot, (num_nodes, num_atom_type))?,
            edge_features: to_device(edge_onehot, (num_edges, num_bond_type))?,
            snorm_n: to_device(snorm_n, (num_nodes, 1))?,
            snorm_e: to_device(snorm_e, (num_edges, 1))?,
            targets: to_device(targets, (graphs.len(), num_tasks))?,
            smiles: graphs.iter().map(|g| g.smiles.clone()).collect(),
        })
    }

    pub fn num_graphs(&self) -> usize {
        self.topology.num_graphs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ethanol() -> MolGraph {
        MolGraph {
            smiles: Some("CCO".into()),
            atoms: vec![0, 0, 1],
            bonds: vec![[0, 1, 0], [1, 2, 0]],
            target: vec![1.],
        }
    }

    #[test]
    fn test_collate_disjoint_union() -> Result<()> {
        let water = MolGraph {
            smiles: None,
            atoms: vec![1],
            bonds: vec![],
            target: vec![0.],
        };
        let a = ethanol();
        let batch = GraphBatch::collate(&[&a, &water, &a], 2, 1, DType::F32, &Device::Cpu)?;

        assert_eq!(batch.num_graphs(), 3);
        assert_eq!(batch.topology.num_nodes(), 7);
        assert_eq!(batch.topology.num_edges(), 8);
        assert_eq!(batch.topology.node_counts(), &[3, 1, 3]);
        assert_eq!(batch.topology.edge_counts(), &[4, 0, 4]);
        assert_eq!(batch.node_features.dims(), &[7, 2]);
        assert_eq!(batch.edge_features.dims(), &[8, 1]);
        assert_eq!(batch.targets.dims(), &[3, 1]);

        // the third graph's edges are shifted past the first four nodes
        let src = batch.topology.src().to_vec1::<u32>()?;
        assert_eq!(&src[4..], &[4, 5, 5, 6]);
        let gid = batch.topology.graph_index().to_vec1::<u32>()?;
        assert_eq!(gid, vec![0, 0, 0, 1, 2, 2, 2]);

        let snorm_n = batch.snorm_n.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(snorm_n[0], 1. / 3f32.sqrt(), epsilon = 1e-6);
        assert_abs_diff_eq!(snorm_n[3], 1., epsilon = 1e-6);
        let snorm_e = batch.snorm_e.flatten_all()?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(snorm_e[0], 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_self_loop_is_single_edge() {
        let g = MolGraph {
            smiles: None,
            atoms: vec![0, 0],
            bonds: vec![[0, 0, 0], [0, 1, 0]],
            target: vec![0.],
        };
        assert_eq!(g.directed_edges(), vec![(0, 0, 0), (0, 1, 0), (1, 0, 0)]);
    }

    #[test]
    fn test_invalid_graphs_are_rejected() {
        let mut g = ethanol();
        g.bonds.push([0, 7, 0]);
        assert!(matches!(
            GraphBatch::collate(&[&g], 2, 1, DType::F32, &Device::Cpu),
            Err(BbpError::InvalidGraph(_))
        ));

        let g = ethanol();
        assert!(matches!(
            GraphBatch::collate(&[&g], 1, 1, DType::F32, &Device::Cpu),
            Err(BbpError::InvalidGraph(_))
        ));

        assert!(matches!(
            GraphBatch::collate(&[], 2, 1, DType::F32, &Device::Cpu),
            Err(BbpError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_topology_rejects_cross_graph_edges() {
        let res = GraphTopology::new(vec![0], vec![2], vec![2, 1], vec![1, 0], &Device::Cpu);
        assert!(matches!(res, Err(BbpError::InvalidGraph(_))));
    }
}
