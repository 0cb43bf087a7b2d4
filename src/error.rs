//! Error types for the lumiere training core.

use thiserror::Error;

/// Errors produced by the training core and its collaborators
#[derive(Error, Debug)]
pub enum LumiereError {
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Token id {token} is out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: i64, vocab_size: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Epoch produced no batches; cannot compute averages")]
    EmptyEpoch,

    #[error("Non-finite loss {loss} at global step {step}")]
    NonFiniteLoss { step: usize, loss: f32 },

    #[error("Non-finite gradient norm {norm} at global step {step}")]
    NonFiniteGradient { step: usize, norm: f32 },

    #[error("Reporter error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for lumiere operations
pub type Result<T> = std::result::Result<T, LumiereError>;
