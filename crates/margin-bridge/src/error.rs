//! Error types for the native-messaging bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
