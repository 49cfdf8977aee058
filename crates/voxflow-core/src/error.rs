use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxflowError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider connection closed: {0}")]
    Disconnected(String),

    #[error(
        "Alignment error: expected {ch:?} at {expected}, found at {found} (tolerance {tolerance})"
    )]
    Alignment {
        ch: String,
        expected: usize,
        found: usize,
        tolerance: usize,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Reconnect budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxflowError {
    /// Only a remote-closed provider connection is retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

pub type Result<T> = std::result::Result<T, VoxflowError>;
