use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid run config: {0}")]
    InvalidConfig(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("distributed backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rendezvous failed: {0}")]
    Rendezvous(String),

    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint architecture mismatch: expected {expected}, found {found}")]
    IncompatibleCheckpoint { expected: String, found: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("optimizer error: {0}")]
    Optimizer(String),

    #[error("data pipeline error: {0}")]
    Data(String),

    #[error("training step failed: {0}")]
    Step(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by callers that map failures to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resource,
    Checkpoint,
    TrainingStep,
    Internal,
}

impl TrainingError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::UnsupportedArchitecture(_) | Self::Toml(_) => {
                ErrorKind::Configuration
            }
            Self::BackendUnavailable(_) | Self::Rendezvous(_) => ErrorKind::Resource,
            Self::CheckpointNotFound(_)
            | Self::IncompatibleCheckpoint { .. }
            | Self::Checkpoint(_) => ErrorKind::Checkpoint,
            Self::Step(_) => ErrorKind::TrainingStep,
            Self::Optimizer(_) | Self::Data(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Wraps a failure raised inside an external training step.
    pub fn step(err: impl Into<anyhow::Error>) -> Self {
        Self::Step(err.into())
    }
}
