//! Run configuration: `params` (training) and `net_params` (model).
//!
//! Layout of a run file:
//!
//! ```json
//! {
//!   "params": { "optimizer": "ADAM", "init_lr": 0.001, "epochs": 100, ... },
//!   "net_params": { "num_atom_type": 28, "hidden_dim": 64, "L": 4, "task": "classification", ... }
//! }
//! ```

use std::fmt;
use std::path::Path;

use anyhow::Context;
use candle_bbp::bbp::{MixturePrior, PosteriorInit};
use candle_bbp::{BbpError, Result};
use candle_core::{DType, Device};
use log::warn;
use serde::{Deserialize, Serialize};

//////////////////////
// Model variants   //
//////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Classification,
    Regression,
}

/// Residual connection after each convolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResidualRepr", into = "String")]
pub enum ResidualMode {
    None,
    /// h = h_new + h_in
    Add,
    /// h = z h_new + (1 - z) h_in, z = sigmoid(W_g [h_new, h_in])
    Gated,
}

/// Accepts the legacy boolean flag as well as a mode name
#[derive(Deserialize)]
#[serde(untagged)]
enum ResidualRepr {
    Flag(bool),
    Name(String),
}

impl TryFrom<ResidualRepr> for ResidualMode {
    type Error = BbpError;

    fn try_from(repr: ResidualRepr) -> Result<Self> {
        match repr {
            ResidualRepr::Flag(true) => Ok(ResidualMode::Add),
            ResidualRepr::Flag(false) => Ok(ResidualMode::None),
            ResidualRepr::Name(name) => name.parse(),
        }
    }
}

impl std::str::FromStr for ResidualMode {
    type Err = BbpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "false" => Ok(ResidualMode::None),
            "add" | "true" => Ok(ResidualMode::Add),
            "gated" => Ok(ResidualMode::Gated),
            other => Err(BbpError::Config(format!(
                "unknown residual mode `{}` (none, add, gated)",
                other
            ))),
        }
    }
}

impl fmt::Display for ResidualMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResidualMode::None => "none",
            ResidualMode::Add => "add",
            ResidualMode::Gated => "gated",
        };
        write!(f, "{}", name)
    }
}

impl From<ResidualMode> for String {
    fn from(mode: ResidualMode) -> Self {
        mode.to_string()
    }
}

/// Graph-level pooling of node states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReadoutMode {
    Sum,
    Max,
    Mean,
}

impl ReadoutMode {
    /// Unrecognized names fall back to `Sum`
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "sum" => ReadoutMode::Sum,
            "max" => ReadoutMode::Max,
            "mean" => ReadoutMode::Mean,
            other => {
                warn!("unknown readout `{}`; using sum", other);
                ReadoutMode::Sum
            }
        }
    }
}

impl From<String> for ReadoutMode {
    fn from(name: String) -> Self {
        ReadoutMode::parse(&name)
    }
}

impl From<ReadoutMode> for String {
    fn from(mode: ReadoutMode) -> Self {
        match mode {
            ReadoutMode::Sum => "sum",
            ReadoutMode::Max => "max",
            ReadoutMode::Mean => "mean",
        }
        .to_string()
    }
}

impl Default for ReadoutMode {
    fn default() -> Self {
        ReadoutMode::Sum
    }
}

/// How gated neighbor messages are combined at the destination node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregationMode {
    /// sum_j σ_ji ⊙ B h_j / (sum_j σ_ji + ε)
    GatedMean,
    /// sum_j σ_ji ⊙ B h_j
    GatedSum,
}

impl Default for AggregationMode {
    fn default() -> Self {
        AggregationMode::GatedMean
    }
}

impl TryFrom<String> for AggregationMode {
    type Error = BbpError;

    fn try_from(name: String) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "gated_mean" | "mean" | "gated" => Ok(AggregationMode::GatedMean),
            "gated_sum" | "sum" => Ok(AggregationMode::GatedSum),
            other => Err(BbpError::Config(format!(
                "unknown gated_gcn_agg `{}` (gated_mean, gated_sum)",
                other
            ))),
        }
    }
}

impl From<AggregationMode> for String {
    fn from(mode: AggregationMode) -> Self {
        match mode {
            AggregationMode::GatedMean => "gated_mean",
            AggregationMode::GatedSum => "gated_sum",
        }
        .to_string()
    }
}

/// At most one feature normalization per layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizationMode {
    None,
    /// scale by `snorm_n` / `snorm_e`
    Graph,
    Batch,
    Layer,
}

impl NormalizationMode {
    pub fn from_flags(graph_norm: bool, batch_norm: bool, layer_norm: bool) -> Result<Self> {
        match (graph_norm, batch_norm, layer_norm) {
            (false, false, false) => Ok(NormalizationMode::None),
            (true, false, false) => Ok(NormalizationMode::Graph),
            (false, true, false) => Ok(NormalizationMode::Batch),
            (false, false, true) => Ok(NormalizationMode::Layer),
            _ => Err(BbpError::Config(format!(
                "at most one of graph_norm/batch_norm/layer_norm may be set (got {}/{}/{})",
                graph_norm, batch_norm, layer_norm
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Gpu,
}

//////////////////////
// Network params   //
//////////////////////

fn default_true() -> bool {
    true
}

fn default_sigma_1() -> f64 {
    0.1
}

fn default_sigma_2() -> f64 {
    0.4
}

fn default_pi() -> f64 {
    1.0
}

fn default_mu_std() -> f64 {
    0.1
}

fn default_rho_init() -> f64 {
    -7.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetConfig {
    pub num_atom_type: usize,
    pub num_bond_type: usize,
    pub hidden_dim: usize,
    pub out_dim: usize,
    #[serde(rename = "L")]
    pub num_layers: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default)]
    pub in_feat_dropout: f64,
    #[serde(default)]
    pub readout: ReadoutMode,
    #[serde(default)]
    pub graph_norm: bool,
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(default)]
    pub layer_norm: bool,
    #[serde(rename = "gated_gcn_agg", default)]
    pub aggregation: AggregationMode,
    #[serde(default = "default_residual")]
    pub residual: ResidualMode,
    #[serde(default = "default_true")]
    pub edge_feat: bool,
    #[serde(default)]
    pub task: Option<TaskType>,
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(rename = "bbp_prior_sigma_1", default = "default_sigma_1")]
    pub prior_sigma_1: f64,
    #[serde(rename = "bbp_prior_sigma_2", default = "default_sigma_2")]
    pub prior_sigma_2: f64,
    #[serde(rename = "bbp_prior_pi", default = "default_pi")]
    pub prior_pi: f64,
    /// Replace the single prediction layer by an MLP with this many hidden layers
    #[serde(default)]
    pub mlp_readout_layers: Option<usize>,
    #[serde(default = "default_mu_std")]
    pub posterior_mu_std: f64,
    #[serde(default = "default_rho_init")]
    pub posterior_rho_init: f64,
    #[serde(default)]
    pub dtype: Precision,
    #[serde(default)]
    pub device: DeviceKind,
}

fn default_residual() -> ResidualMode {
    ResidualMode::None
}

impl NetConfig {
    /// Check every construction-time invariant at once
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("num_atom_type", self.num_atom_type),
            ("num_bond_type", self.num_bond_type),
            ("hidden_dim", self.hidden_dim),
            ("out_dim", self.out_dim),
        ] {
            if value == 0 {
                return Err(BbpError::Config(format!("{} must be positive", key)));
            }
        }
        for (key, p) in [("dropout", self.dropout), ("in_feat_dropout", self.in_feat_dropout)] {
            if !(0. ..1.).contains(&p) {
                return Err(BbpError::Config(format!("{} must lie in [0, 1), got {}", key, p)));
            }
        }
        self.task()?;
        self.normalization()?;
        self.prior()?;
        self.pred_dim()?;
        Ok(())
    }

    pub fn task(&self) -> Result<TaskType> {
        self.task
            .ok_or_else(|| BbpError::Config("task type is not set".into()))
    }

    pub fn normalization(&self) -> Result<NormalizationMode> {
        NormalizationMode::from_flags(self.graph_norm, self.batch_norm, self.layer_norm)
    }

    pub fn prior(&self) -> Result<MixturePrior> {
        MixturePrior::new(self.prior_sigma_1, self.prior_sigma_2, self.prior_pi)
    }

    pub fn posterior_init(&self) -> PosteriorInit {
        PosteriorInit {
            mu_std: self.posterior_mu_std,
            rho_mean: self.posterior_rho_init,
            ..PosteriorInit::default()
        }
    }

    /// Width of the prediction: one logit per binary task, one value for regression
    pub fn pred_dim(&self) -> Result<usize> {
        match self.task()? {
            TaskType::Regression => Ok(1),
            TaskType::Classification => match self.num_classes {
                None => Err(BbpError::Config(
                    "num_classes is required for classification".into(),
                )),
                Some(0) => Err(BbpError::Config("num_classes must be positive".into())),
                Some(k) if k <= 2 => Ok(1),
                Some(k) => Ok(k),
            },
        }
    }

    pub fn dtype(&self) -> DType {
        match self.dtype {
            Precision::F32 => DType::F32,
            Precision::F64 => DType::F64,
        }
    }

    pub fn device(&self) -> Result<Device> {
        match self.device {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Gpu => Ok(Device::cuda_if_available(0)?),
        }
    }
}

//////////////////////
// Training params  //
//////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[serde(alias = "ADAM", alias = "Adam")]
    Adam,
    #[serde(alias = "SGD")]
    Sgd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// multiply the rate by `lr_reduce_factor` every `step_size` epochs
    Step,
    /// reduce on validation loss plateau
    Plateau,
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::Plateau
}

fn default_step_size() -> usize {
    50
}

fn default_reduce_factor() -> f64 {
    0.5
}

fn default_patience() -> usize {
    10
}

fn default_min_lr() -> f64 {
    1e-5
}

fn default_max_time() -> f64 {
    24.
}

fn default_seed() -> u64 {
    41
}

fn default_eval_samples() -> usize {
    10
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    pub optimizer: OptimizerKind,
    pub init_lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_reduce_factor")]
    pub lr_reduce_factor: f64,
    #[serde(default = "default_patience")]
    pub lr_schedule_patience: usize,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// hours
    #[serde(default = "default_max_time")]
    pub max_time: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// β in task_loss + β KL; defaults to 1 / number of training minibatches
    #[serde(default)]
    pub kl_weight: Option<f64>,
    #[serde(rename = "bbp_eval_Nsample", default = "default_eval_samples")]
    pub eval_num_samples: usize,
    #[serde(default)]
    pub save_params: bool,
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(BbpError::Config("batch_size must be positive".into()));
        }
        if !(self.init_lr > 0.) {
            return Err(BbpError::Config(format!("init_lr must be positive, got {}", self.init_lr)));
        }
        if self.eval_num_samples == 0 {
            return Err(BbpError::Config("bbp_eval_Nsample must be positive".into()));
        }
        if !(self.lr_reduce_factor > 0. && self.lr_reduce_factor <= 1.) {
            return Err(BbpError::Config(format!(
                "lr_reduce_factor must lie in (0, 1], got {}",
                self.lr_reduce_factor
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(rename = "params")]
    pub train: TrainConfig,
    pub net_params: NetConfig,
}

impl RunConfig {
    /// Parse and validate; every problem surfaces as a configuration error
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RunConfig =
            serde_json::from_str(json).map_err(|e| BbpError::Config(e.to_string()))?;
        config.train.validate()?;
        config.net_params.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"{
        "params": { "optimizer": "ADAM", "init_lr": 0.001, "epochs": 3, "batch_size": 8 },
        "net_params": {
            "num_atom_type": 5, "num_bond_type": 3, "hidden_dim": 8, "out_dim": 8, "L": 2,
            "readout": "mean", "residual": true, "task": "classification", "num_classes": 2,
            "bbp_prior_sigma_1": 0.1, "bbp_prior_sigma_2": 0.4, "bbp_prior_pi": 0.5
        }
    }"#;

    #[test]
    fn test_parse_run_file() -> Result<()> {
        let config = RunConfig::from_json_str(RUN)?;
        assert_eq!(config.train.optimizer, OptimizerKind::Adam);
        assert_eq!(config.train.scheduler, SchedulerKind::Plateau);
        assert_eq!(config.net_params.num_layers, 2);
        assert_eq!(config.net_params.residual, ResidualMode::Add);
        assert_eq!(config.net_params.readout, ReadoutMode::Mean);
        assert_eq!(config.net_params.aggregation, AggregationMode::GatedMean);
        assert_eq!(config.net_params.pred_dim()?, 1);
        assert!(config.net_params.edge_feat);
        Ok(())
    }

    #[test]
    fn test_unknown_readout_falls_back_to_sum() {
        assert_eq!(ReadoutMode::parse("attention"), ReadoutMode::Sum);
        assert_eq!(ReadoutMode::parse("MAX"), ReadoutMode::Max);
    }

    #[test]
    fn test_config_errors() {
        let bad_optimizer = RUN.replace("\"ADAM\"", "\"RMSPROP\"");
        assert!(matches!(
            RunConfig::from_json_str(&bad_optimizer),
            Err(BbpError::Config(_))
        ));

        let bad_residual = RUN.replace("\"residual\": true", "\"residual\": \"highway\"");
        assert!(matches!(
            RunConfig::from_json_str(&bad_residual),
            Err(BbpError::Config(_))
        ));

        let no_task = RUN.replace("\"task\": \"classification\",", "");
        assert!(matches!(
            RunConfig::from_json_str(&no_task),
            Err(BbpError::Config(_))
        ));

        let bad_prior = RUN.replace("\"bbp_prior_pi\": 0.5", "\"bbp_prior_pi\": 1.5");
        assert!(matches!(
            RunConfig::from_json_str(&bad_prior),
            Err(BbpError::InvalidPriorParameters(_))
        ));
    }

    #[test]
    fn test_normalization_flags_are_exclusive() {
        assert_eq!(
            NormalizationMode::from_flags(true, false, false).ok(),
            Some(NormalizationMode::Graph)
        );
        assert!(matches!(
            NormalizationMode::from_flags(true, true, false),
            Err(BbpError::Config(_))
        ));
    }
}
