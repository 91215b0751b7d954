//! Typed failures of the training pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the training loop and its components.
#[derive(Debug, Error)]
pub enum TrainError {
    /// The total loss or one of its components is NaN or infinite.
    #[error("non-finite loss at step {step}: {component} = {value}")]
    NonFiniteLoss {
        step: usize,
        component: String,
        value: f32,
    },
    /// A keyboard interrupt was observed between epochs.
    #[error("training interrupted")]
    Interrupted,
    /// A checkpoint could not be matched to the model at all.
    #[error("checkpoint {path} is incompatible with the model: {reason}")]
    IncompatibleCheckpoint { path: PathBuf, reason: String },
    /// A checkpoint file is corrupt or could not be written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    /// The configuration cannot be honored.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Dataset metadata or feature files are malformed.
    #[error("data error: {0}")]
    Data(String),
    /// A collective operation failed or a peer disconnected.
    #[error("distributed error: {0}")]
    Distributed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TrainError {
    /// Whether the error is a graceful shutdown rather than a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TrainError::Interrupted)
    }
}

pub type TrainResult<T> = Result<T, TrainError>;
