use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device};
use flate2::read::GzDecoder;
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::graph::{GraphBatch, MolGraph};

/// Open a file for reading, gzipped or not
pub fn open_buf_reader(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Open a file for writing, gzipped if it ends with `.gz`
pub fn open_buf_writer(path: &Path) -> anyhow::Result<Box<dyn Write>> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// One molecule per line; blank lines are skipped
pub fn read_molecules(path: &Path) -> anyhow::Result<Vec<MolGraph>> {
    let reader = open_buf_reader(path)?;
    let mut out = vec![];
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mol: MolGraph = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed molecule", path.display(), i + 1))?;
        out.push(mol);
    }
    Ok(out)
}

pub fn write_molecules(path: &Path, molecules: &[MolGraph]) -> anyhow::Result<()> {
    let mut writer = open_buf_writer(path)?;
    for mol in molecules {
        serde_json::to_writer(&mut writer, mol)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// `{dir}/{stem}.jsonl` or `{dir}/{stem}.jsonl.gz`
pub fn locate_split(dir: &Path, stem: &str) -> anyhow::Result<PathBuf> {
    for name in [format!("{}.jsonl", stem), format!("{}.jsonl.gz", stem)] {
        let path = dir.join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(anyhow::anyhow!(
        "no {}.jsonl(.gz) under {}",
        stem,
        dir.display()
    ))
}

/// train/val/test splits of a molecule dataset
pub struct MoleculeDataset {
    pub train: Vec<MolGraph>,
    pub val: Vec<MolGraph>,
    pub test: Vec<MolGraph>,
}

impl MoleculeDataset {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let train = read_molecules(&locate_split(dir, "train")?)?;
        let val = read_molecules(&locate_split(dir, "val")?)?;
        let test = read_molecules(&locate_split(dir, "test")?)?;
        info!(
            "loaded {}: {} train, {} val, {} test molecules",
            dir.display(),
            train.len(),
            val.len(),
            test.len()
        );
        Ok(Self { train, val, test })
    }

    pub fn num_tasks(&self) -> usize {
        self.train.first().map(|m| m.target.len()).unwrap_or(0)
    }
}

/// Index chunks over a sample set
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    /// Permute all samples and cut the permutation into chunks;
    /// every sample is visited once per epoch
    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) {
        self.samples.shuffle(rng);
        self.chunk(batch_size);
    }

    /// Chunks in file order, for evaluation
    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        self.samples.sort_unstable();
        self.chunk(batch_size);
    }

    fn chunk(&mut self, batch_size: usize) {
        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Collates minibatches of molecules into [`GraphBatch`]es
pub struct GraphLoader<'a> {
    molecules: &'a [MolGraph],
    minibatches: Minibatches,
    num_atom_type: usize,
    num_bond_type: usize,
    dtype: DType,
}

impl<'a> GraphLoader<'a> {
    pub fn new(
        molecules: &'a [MolGraph],
        num_atom_type: usize,
        num_bond_type: usize,
        dtype: DType,
    ) -> Self {
        Self {
            molecules,
            minibatches: Minibatches::new(molecules.len()),
            num_atom_type,
            num_bond_type,
            dtype,
        }
    }

    pub fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    pub fn num_molecules(&self) -> usize {
        self.minibatches.size()
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) {
        self.minibatches.shuffle_minibatch(batch_size, rng);
    }

    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        self.minibatches.sequential_minibatch(batch_size);
    }

    pub fn minibatch_data(&self, batch_idx: usize, device: &Device) -> anyhow::Result<GraphBatch> {
        let chunk = self
            .minibatches
            .chunks
            .get(batch_idx)
            .ok_or_else(|| anyhow::anyhow!("minibatch {} out of range", batch_idx))?;
        let graphs: Vec<&MolGraph> = chunk.iter().map(|&i| &self.molecules[i]).collect();
        Ok(GraphBatch::collate(
            &graphs,
            self.num_atom_type,
            self.num_bond_type,
            self.dtype,
            device,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn molecule(k: usize) -> MolGraph {
        MolGraph {
            smiles: Some(format!("mol{}", k)),
            atoms: vec![k % 2, 1],
            bonds: vec![[0, 1, 0]],
            target: vec![(k % 2) as f32],
        }
    }

    #[test]
    fn test_jsonl_round_trip_gz() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mols: Vec<MolGraph> = (0..5).map(molecule).collect();
        let path = dir.path().join("train.jsonl.gz");
        write_molecules(&path, &mols)?;

        let back = read_molecules(&path)?;
        assert_eq!(back.len(), 5);
        assert_eq!(back[3].smiles.as_deref(), Some("mol3"));
        assert_eq!(back[3].bonds, vec![[0, 1, 0]]);
        Ok(())
    }

    #[test]
    fn test_missing_labels_survive_a_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.jsonl");
        let mut mol = molecule(0);
        mol.target = vec![1., f32::NAN, 0.];
        write_molecules(&path, &[mol])?;

        let line = std::fs::read_to_string(&path)?;
        assert!(line.contains(r#""target":[1.0,null,0.0]"#));

        let back = read_molecules(&path)?;
        assert_eq!(back[0].target[0], 1.);
        assert!(back[0].target[1].is_nan());
        assert_eq!(back[0].target[2], 0.);
        Ok(())
    }

    #[test]
    fn test_null_labels_in_hand_written_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("val.jsonl");
        std::fs::write(
            &path,
            "{\"atoms\": [0, 1], \"bonds\": [[0, 1, 0]], \"target\": [null, 1]}\n",
        )?;
        let back = read_molecules(&path)?;
        assert!(back[0].target[0].is_nan());
        assert_eq!(back[0].target[1], 1.);
        Ok(())
    }

    #[test]
    fn test_missing_split_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_molecules(&dir.path().join("train.jsonl"), &[molecule(0)])?;
        assert!(MoleculeDataset::load(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_shuffled_minibatches_cover_every_molecule() -> anyhow::Result<()> {
        let mols: Vec<MolGraph> = (0..10).map(molecule).collect();
        let mut loader = GraphLoader::new(&mols, 2, 1, DType::F32);
        let mut rng = StdRng::seed_from_u64(3);
        loader.shuffle_minibatch(4, &mut rng);
        assert_eq!(loader.num_minibatch(), 3);

        let mut seen = 0;
        for b in 0..loader.num_minibatch() {
            let batch = loader.minibatch_data(b, &Device::Cpu)?;
            seen += batch.num_graphs();
        }
        assert_eq!(seen, 10);

        let mut all: Vec<usize> = loader.minibatches.chunks.concat();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        Ok(())
    }
}
