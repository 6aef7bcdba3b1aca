//! Error types for the Tether engine.

use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Path errors
    #[error("invalid path '{path}': cannot descend into a primitive at '{token}'")]
    InvalidPath { path: String, token: String },

    // Version errors
    #[error("invalid version token: {0}")]
    InvalidVersion(String),

    // Framing errors
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown topic code: {0}")]
    UnknownTopic(String),

    #[error("unknown action code: {0}")]
    UnknownAction(String),

    #[error("invalid typed value: {0}")]
    InvalidTypedValue(String),

    #[error("invalid json payload: {0}")]
    InvalidJson(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
