use std::io::Write;
use std::path::Path;
use std::time::Instant;

use candle_bbp::candle_loss_functions::variational_objective;
use candle_bbp::{ForwardMode, Sampler};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::config::{OptimizerKind, SchedulerKind, TrainConfig};
use crate::dataset::{open_buf_writer, GraphLoader, MoleculeDataset};
use crate::gated_gcn_net::GatedGcnNet;
use crate::graph::MolGraph;
use crate::metrics::{evaluate, Metrics};
use crate::scheduler::LrScheduler;

/// `Optimizer` is not object safe, so the two supported ones are wrapped
pub enum ModelOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl ModelOptimizer {
    pub fn new(config: &TrainConfig, varmap: &VarMap) -> anyhow::Result<Self> {
        let vars = varmap.all_vars();
        Ok(match config.optimizer {
            OptimizerKind::Adam => ModelOptimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: config.init_lr,
                    weight_decay: config.weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => {
                if config.weight_decay > 0. {
                    warn!("weight_decay is ignored by the sgd optimizer");
                }
                ModelOptimizer::Sgd(SGD::new(vars, config.init_lr)?)
            }
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            ModelOptimizer::Adam(opt) => opt.backward_step(loss),
            ModelOptimizer::Sgd(opt) => opt.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            ModelOptimizer::Adam(opt) => opt.learning_rate(),
            ModelOptimizer::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            ModelOptimizer::Adam(opt) => opt.set_learning_rate(lr),
            ModelOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// MC-averaged predictions on one split
#[derive(Clone, Debug, Serialize)]
pub struct Evaluation {
    /// task loss averaged over batches and weight samples
    pub loss: f64,
    pub metrics: Metrics,
    #[serde(skip)]
    pub scores: Vec<Vec<f32>>,
    #[serde(skip)]
    pub targets: Vec<Vec<f32>>,
    #[serde(skip)]
    pub smiles: Vec<Option<String>>,
}

/// Draw `num_samples` weight sets per batch and average the scores
/// (probabilities for classification, predictions for regression)
pub fn evaluate_network(
    model: &GatedGcnNet,
    molecules: &[MolGraph],
    batch_size: usize,
    num_samples: usize,
    sampler: &mut Sampler,
    device: &Device,
) -> anyhow::Result<Evaluation> {
    let net = model.config();
    let mut loader = GraphLoader::new(molecules, net.num_atom_type, net.num_bond_type, net.dtype());
    loader.sequential_minibatch(batch_size);

    let prev_mode = sampler.mode();
    sampler.set_mode(ForwardMode::Sample);

    let num_samples = num_samples.max(1);
    let mut loss_tot = 0f64;
    let mut scores = Vec::with_capacity(molecules.len());
    let mut targets = Vec::with_capacity(molecules.len());
    let mut smiles = Vec::with_capacity(molecules.len());

    for b in 0..loader.num_minibatch() {
        let batch = loader.minibatch_data(b, device)?;
        let mut score_sum: Option<Tensor> = None;
        for _ in 0..num_samples {
            let (pred, _kl) = model.forward_batch(&batch, sampler)?;
            loss_tot += scalar(&model.loss(&pred, &batch.targets)?)?;
            let s = model.scores(&pred)?;
            score_sum = Some(match score_sum {
                Some(acc) => (acc + s)?,
                None => s,
            });
        }
        let score_sum = score_sum.ok_or_else(|| anyhow::anyhow!("no weight samples drawn"))?;
        let avg = (score_sum / num_samples as f64)?;
        scores.extend(avg.to_dtype(DType::F32)?.to_vec2::<f32>()?);
        targets.extend(batch.targets.to_dtype(DType::F32)?.to_vec2::<f32>()?);
        smiles.extend(batch.smiles);
    }
    sampler.set_mode(prev_mode);

    let denom = (loader.num_minibatch() * num_samples).max(1) as f64;
    let metrics = evaluate(model.task(), &scores, &targets);
    Ok(Evaluation {
        loss: loss_tot / denom,
        metrics,
        scores,
        targets,
        smiles,
    })
}

fn scalar(x: &Tensor) -> candle_core::Result<f64> {
    x.to_dtype(DType::F64)?.to_scalar::<f64>()
}

#[derive(Clone, Debug, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub train_kl: f64,
    pub val_loss: f64,
    pub val_metric: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_ece: Option<f64>,
    pub test_loss: f64,
    pub test_metric: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_ece: Option<f64>,
    pub elapsed_secs: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrainOutcome {
    pub history: Vec<EpochRecord>,
    pub epochs_run: usize,
    pub stop_reason: String,
    pub elapsed_secs: f64,
}

/// Minimize task_loss + β KL over the training split
///
/// * `model` - network whose variables live in `varmap`
/// * `dataset` - train split is shuffled each epoch, val split drives the scheduler
/// * `config` - optimizer, schedule and stopping rules
/// * `verbose` - per-epoch log lines instead of a progress bar
pub fn train_network(
    model: &GatedGcnNet,
    varmap: &VarMap,
    dataset: &MoleculeDataset,
    config: &TrainConfig,
    device: &Device,
    verbose: bool,
) -> anyhow::Result<TrainOutcome> {
    let net = model.config();
    let mut loader = GraphLoader::new(
        &dataset.train,
        net.num_atom_type,
        net.num_bond_type,
        net.dtype(),
    );
    if loader.num_molecules() == 0 {
        return Err(anyhow::anyhow!("empty training split"));
    }

    let mut optimizer = ModelOptimizer::new(config, varmap)?;
    let mut scheduler = LrScheduler::new(config);
    let mut shuffle_rng = StdRng::seed_from_u64(config.seed);
    let mut sampler = Sampler::new(config.seed.wrapping_add(1), ForwardMode::Train);

    let num_batches = loader.num_molecules().div_ceil(config.batch_size);
    let kl_weight = config.kl_weight.unwrap_or(1. / num_batches as f64);
    info!(
        "training on {} molecules, {} minibatches per epoch, kl weight {:.3e}",
        loader.num_molecules(),
        num_batches,
        kl_weight
    );

    let pb = ProgressBar::new(config.epochs as u64);
    if verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let start = Instant::now();
    let mut history = vec![];
    let mut stop_reason = "max epochs".to_string();

    for epoch in 0..config.epochs {
        loader.shuffle_minibatch(config.batch_size, &mut shuffle_rng);
        sampler.set_mode(ForwardMode::Train);

        let (mut loss_tot, mut kl_tot) = (0f64, 0f64);
        for b in 0..loader.num_minibatch() {
            let batch = loader.minibatch_data(b, device)?;
            let (pred, kl) = model.forward_batch(&batch, &mut sampler)?;
            let task_loss = model.loss(&pred, &batch.targets)?;
            let objective = variational_objective(&task_loss, &kl, kl_weight)?;
            optimizer.backward_step(&objective)?;
            loss_tot += scalar(&task_loss)?;
            kl_tot += scalar(&kl)?;
        }
        let nb = loader.num_minibatch() as f64;

        let val = evaluate_network(
            model,
            &dataset.val,
            config.batch_size,
            config.eval_num_samples,
            &mut sampler,
            device,
        )?;
        let test = evaluate_network(
            model,
            &dataset.test,
            config.batch_size,
            config.eval_num_samples,
            &mut sampler,
            device,
        )?;

        let record = EpochRecord {
            epoch: epoch + 1,
            lr: optimizer.learning_rate(),
            train_loss: loss_tot / nb,
            train_kl: kl_tot / nb,
            val_loss: val.loss,
            val_metric: val.metrics.headline().1,
            val_ece: val.metrics.ece(),
            test_loss: test.loss,
            test_metric: test.metrics.headline().1,
            test_ece: test.metrics.ece(),
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        pb.inc(1);
        if verbose {
            let metric = val.metrics.headline().0;
            info!(
                "[{}] lr {:.3e} train loss {:.4} kl {:.2} val loss {:.4} {} {:.4} test loss {:.4} {} {:.4}",
                record.epoch,
                record.lr,
                record.train_loss,
                record.train_kl,
                record.val_loss,
                metric,
                record.val_metric,
                record.test_loss,
                metric,
                record.test_metric
            );
            if let (Some(val_ece), Some(test_ece)) = (record.val_ece, record.test_ece) {
                info!("[{}] ece val {:.4} test {:.4}", record.epoch, val_ece, test_ece);
            }
        }
        history.push(record);

        let lr = scheduler.step(val.loss);
        optimizer.set_learning_rate(lr);

        if config.scheduler == SchedulerKind::Plateau && lr < config.min_lr {
            stop_reason = format!("learning rate {:.3e} below min_lr", lr);
            break;
        }
        if start.elapsed().as_secs_f64() > config.max_time * 3600. {
            stop_reason = format!("max_time of {} hours", config.max_time);
            break;
        }
    }
    pb.finish_and_clear();
    info!("training stopped: {}", stop_reason);

    Ok(TrainOutcome {
        epochs_run: history.len(),
        history,
        stop_reason,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

/// Pretty-printed JSON file
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut writer = open_buf_writer(path)?;
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
pub struct SplitPredictions<'a> {
    pub smiles: &'a [Option<String>],
    pub scores: &'a [Vec<f32>],
    pub targets: &'a [Vec<f32>],
}

impl<'a> From<&'a Evaluation> for SplitPredictions<'a> {
    fn from(eval: &'a Evaluation) -> Self {
        Self {
            smiles: &eval.smiles,
            scores: &eval.scores,
            targets: &eval.targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::gated_gcn_net::build_model;

    fn toy_split(n: usize) -> Vec<MolGraph> {
        (0..n)
            .map(|k| {
                // label is whether the molecule holds an atom of type 1
                let label = k % 2;
                MolGraph {
                    smiles: Some(format!("m{}", k)),
                    atoms: vec![0, label, 0],
                    bonds: vec![[0, 1, 0], [1, 2, 0]],
                    target: vec![label as f32],
                }
            })
            .collect()
    }

    #[test]
    fn test_train_and_evaluate_toy_data() -> anyhow::Result<()> {
        let config = RunConfig::from_json_str(
            r#"{
                "params": { "optimizer": "ADAM", "init_lr": 0.01, "epochs": 3, "batch_size": 4,
                            "scheduler": "step", "step_size": 2, "bbp_eval_Nsample": 3, "seed": 7 },
                "net_params": { "num_atom_type": 2, "num_bond_type": 1, "hidden_dim": 8,
                                "out_dim": 8, "L": 2, "residual": "add", "graph_norm": true,
                                "task": "classification", "num_classes": 2 }
            }"#,
        )?;
        let dataset = MoleculeDataset {
            train: toy_split(12),
            val: toy_split(4),
            test: toy_split(4),
        };
        let (model, varmap) = build_model(&config.net_params, &Device::Cpu)?;
        let outcome = train_network(&model, &varmap, &dataset, &config.train, &Device::Cpu, true)?;
        assert_eq!(outcome.epochs_run, 3);
        assert!(outcome.history.iter().all(|r| r.train_loss.is_finite()));
        assert!(outcome.history[2].lr < outcome.history[0].lr);
        for record in outcome.history.iter() {
            assert!(record.test_loss.is_finite());
            assert!((0. ..=1.).contains(&record.test_metric));
            let ece = record.val_ece.expect("classification reports ece");
            assert!((0. ..=1.).contains(&ece));
            assert!(record.test_ece.is_some());
        }

        let mut sampler = Sampler::new(0, ForwardMode::Train);
        let eval = evaluate_network(&model, &dataset.test, 3, 4, &mut sampler, &Device::Cpu)?;
        assert_eq!(eval.scores.len(), 4);
        assert_eq!(eval.smiles[2].as_deref(), Some("m2"));
        assert!(eval.scores.iter().flatten().all(|p| (0. ..=1.).contains(p)));
        assert_eq!(sampler.mode(), ForwardMode::Train);
        Ok(())
    }
}
