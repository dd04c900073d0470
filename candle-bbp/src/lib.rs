pub mod bbp;
pub mod candle_loss_functions;
pub mod candle_sampler;
pub mod error;

pub use candle_sampler::{ForwardMode, Sampler};
pub use error::{BbpError, Result};

pub use candle_core;
pub use candle_nn;
