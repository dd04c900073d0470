use std::path::{Path, PathBuf};

use candle_bbp::{ForwardMode, Sampler};
use candle_core::Device;
use clap::Args;
use log::info;
use molbbp::config::{NetConfig, RunConfig, TrainConfig};
use molbbp::dataset::MoleculeDataset;
use molbbp::gated_gcn_net::{build_model, GatedGcnNet};
use molbbp::train::{evaluate_network, train_network, write_json, Evaluation, SplitPredictions, TrainOutcome};
use serde::Serialize;

use crate::ComputeDevice;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Run configuration (JSON)",
        long_help = "Run configuration with two sections:\n\
		     `params` (optimizer, schedule, epochs, ...)\n\
		     `net_params` (architecture and prior)."
    )]
    config: PathBuf,

    #[arg(
        long,
        short,
        required = true,
        help = "Dataset directory",
        long_help = "Directory holding train/val/test.jsonl (optionally .gz).\n\
		     One molecule per line:\n\
		     {\"smiles\": .., \"atoms\": [..], \"bonds\": [[src, dst, type], ..], \"target\": [..]}"
    )]
    data_dir: PathBuf,

    #[arg(long, short, required = true, help = "Output directory")]
    out_dir: PathBuf,

    #[arg(long, help = "Override `params.seed`")]
    seed: Option<u64>,

    #[arg(long, help = "Override `params.epochs`")]
    epochs: Option<usize>,

    #[arg(long, value_enum, help = "Override `net_params.device`")]
    device: Option<ComputeDevice>,

    #[arg(
        long,
        short,
        default_value_t = false,
        help = "Per-epoch log lines instead of a progress bar"
    )]
    verbose: bool,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    params: &'a TrainConfig,
    net_params: &'a NetConfig,
    num_parameters: usize,
    training: &'a TrainOutcome,
    train: &'a Evaluation,
    val: &'a Evaluation,
    test: &'a Evaluation,
}

#[derive(Serialize)]
struct Predictions<'a> {
    train: SplitPredictions<'a>,
    val: SplitPredictions<'a>,
    test: SplitPredictions<'a>,
}

pub fn fit_gated_gcn(args: &TrainArgs) -> anyhow::Result<()> {
    let mut config = RunConfig::from_json_file(&args.config)?;
    if let Some(seed) = args.seed {
        config.train.seed = seed;
    }
    if let Some(epochs) = args.epochs {
        config.train.epochs = epochs;
    }
    if let Some(device) = args.device.as_ref() {
        config.net_params.device = device.into();
    }

    let device = config.net_params.device()?;
    info!("device: {:?}", device);

    let dataset = MoleculeDataset::load(&args.data_dir)?;
    let (model, varmap) = build_model(&config.net_params, &device)?;
    let num_parameters: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    info!(
        "{} tasks, {} variational parameters",
        dataset.num_tasks(),
        num_parameters
    );

    let outcome = train_network(
        &model,
        &varmap,
        &dataset,
        &config.train,
        &device,
        args.verbose,
    )?;

    let mut sampler = Sampler::new(config.train.seed.wrapping_add(2), ForwardMode::Sample);
    let mut eval = |split: &[molbbp::MolGraph]| {
        evaluate_split(&model, split, &config.train, &mut sampler, &device)
    };
    let train = eval(&dataset.train)?;
    let val = eval(&dataset.val)?;
    let test = eval(&dataset.test)?;

    for (name, ev) in [("train", &train), ("val", &val), ("test", &test)] {
        let (metric, value) = ev.metrics.headline();
        info!("{}: loss {:.4}, {} {:.4}", name, ev.loss, metric, value);
    }

    std::fs::create_dir_all(&args.out_dir)?;
    if config.train.save_params {
        let path = args.out_dir.join("model.safetensors");
        varmap.save(&path)?;
        info!("saved parameters to {}", path.display());
    }

    let summary = RunSummary {
        params: &config.train,
        net_params: &config.net_params,
        num_parameters,
        training: &outcome,
        train: &train,
        val: &val,
        test: &test,
    };
    write_summary(&args.out_dir, &summary)?;

    let predictions = Predictions {
        train: (&train).into(),
        val: (&val).into(),
        test: (&test).into(),
    };
    write_json(&args.out_dir.join("predictions.json"), &predictions)?;
    Ok(())
}

fn evaluate_split(
    model: &GatedGcnNet,
    split: &[molbbp::MolGraph],
    train: &TrainConfig,
    sampler: &mut Sampler,
    device: &Device,
) -> anyhow::Result<Evaluation> {
    evaluate_network(
        model,
        split,
        train.batch_size,
        train.eval_num_samples,
        sampler,
        device,
    )
}

fn write_summary(out_dir: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let path = out_dir.join("results.json");
    write_json(&path, summary)?;
    info!("wrote {}", path.display());
    Ok(())
}
