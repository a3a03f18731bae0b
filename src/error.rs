use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, MaddpgError>;

#[derive(Debug, thiserror::Error)]
pub enum MaddpgError {
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("replay buffer holds {len} transitions, cannot sample a batch of {batch_size}")]
    BufferUnderflow { len: usize, batch_size: usize },

    #[error("index {index} out of range for replay buffer of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{what} of agent {agent} diverged: {value}")]
    NumericDivergence {
        agent: String,
        what: &'static str,
        value: f32,
    },

    #[error("unknown agent {0}")]
    UnknownAgent(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("checkpoint {path:?}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl MaddpgError {
    pub fn dims(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}
