pub mod config;
pub mod dataset;
pub mod gated_gcn_layer;
pub mod gated_gcn_net;
pub mod graph;
pub mod metrics;
pub mod normalization;
pub mod readout;
pub mod scheduler;
pub mod train;

pub use config::{NetConfig, RunConfig, TrainConfig};
pub use gated_gcn_net::{build_model, GatedGcnNet};
pub use graph::{GraphBatch, GraphTopology, MolGraph};

pub use candle_bbp;
