//! Error types for Margin Core

use thiserror::Error;

/// Result type alias using Margin Error
pub type Result<T> = std::result::Result<T, Error>;

/// Margin error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Message queue is full ({limit} pending)")]
    QueueFull { limit: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An editor call outlived `editor.timeout_ms`
    #[error("Editor did not respond within {0} ms")]
    EditorTimeout(u64),
}

impl Error {
    /// Build a transport error from anything displayable
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport(message.to_string())
    }
}
