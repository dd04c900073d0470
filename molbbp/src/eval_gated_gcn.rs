use std::path::PathBuf;

use candle_bbp::{ForwardMode, Sampler};
use clap::Args;
use log::info;
use molbbp::config::RunConfig;
use molbbp::dataset::{locate_split, read_molecules};
use molbbp::gated_gcn_net::build_model;
use molbbp::train::{evaluate_network, write_json, SplitPredictions};

use crate::ComputeDevice;

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[arg(long, short, required = true, help = "Run configuration used for training")]
    config: PathBuf,

    #[arg(long, short, required = true, help = "Dataset directory")]
    data_dir: PathBuf,

    #[arg(
        long,
        required = true,
        help = "Trained parameters",
        long_help = "Parameters saved by `train` with `save_params` (safetensors)."
    )]
    checkpoint: PathBuf,

    #[arg(long, default_value = "test", help = "Split to evaluate (train, val, test)")]
    split: String,

    #[arg(long, help = "Override `params.bbp_eval_Nsample`")]
    num_samples: Option<usize>,

    #[arg(long, help = "Override `params.seed`")]
    seed: Option<u64>,

    #[arg(long, value_enum, help = "Override `net_params.device`")]
    device: Option<ComputeDevice>,

    #[arg(long, short, help = "Write predictions to this JSON file")]
    out: Option<PathBuf>,
}

pub fn evaluate_gated_gcn(args: &EvaluateArgs) -> anyhow::Result<()> {
    let mut config = RunConfig::from_json_file(&args.config)?;
    if let Some(device) = args.device.as_ref() {
        config.net_params.device = device.into();
    }
    let seed = args.seed.unwrap_or(config.train.seed);
    let num_samples = args.num_samples.unwrap_or(config.train.eval_num_samples);

    let device = config.net_params.device()?;
    let (model, mut varmap) = build_model(&config.net_params, &device)?;
    varmap.load(&args.checkpoint)?;
    info!("loaded {}", args.checkpoint.display());

    let molecules = read_molecules(&locate_split(&args.data_dir, &args.split)?)?;
    let mut sampler = Sampler::new(seed, ForwardMode::Sample);
    let eval = evaluate_network(
        &model,
        &molecules,
        config.train.batch_size,
        num_samples,
        &mut sampler,
        &device,
    )?;

    info!(
        "{} ({} molecules, {} weight samples): {}",
        args.split,
        molecules.len(),
        num_samples,
        serde_json::to_string(&eval)?
    );

    if let Some(out) = args.out.as_ref() {
        write_json(out, &SplitPredictions::from(&eval))?;
        info!("wrote {}", out.display());
    }
    Ok(())
}
