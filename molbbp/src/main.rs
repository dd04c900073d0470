mod eval_gated_gcn;
mod fit_gated_gcn;

use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use eval_gated_gcn::*;
use fit_gated_gcn::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "MOLBBP",
    long_about = "Bayesian gated graph ConvNets for molecular property prediction\n\
		  Weights are learned by Bayes-by-Backprop; predictions are\n\
		  averaged over posterior weight samples."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a Bayesian gated GCN",
        long_about = "Train on {data-dir}/train.jsonl(.gz), schedule on val.jsonl(.gz),\n\
		      and report MC-averaged metrics on all three splits:\n\
		      - {out-dir}/results.json\n\
		      - {out-dir}/predictions.json\n\
		      - {out-dir}/model.safetensors (if save_params)\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Evaluate a trained model",
        long_about = "Load a checkpoint and report MC-averaged metrics\n\
		      on one split of the dataset.\n"
    )]
    Evaluate(EvaluateArgs),
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Gpu,
}

impl From<&ComputeDevice> for molbbp::config::DeviceKind {
    fn from(device: &ComputeDevice) -> Self {
        match device {
            ComputeDevice::Cpu => molbbp::config::DeviceKind::Cpu,
            ComputeDevice::Gpu => molbbp::config::DeviceKind::Gpu,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match &cli.commands {
        Commands::Train(args) => {
            fit_gated_gcn(args)?;
        }
        Commands::Evaluate(args) => {
            evaluate_gated_gcn(args)?;
        }
    }

    info!("Done");
    Ok(())
}
