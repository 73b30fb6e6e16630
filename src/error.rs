//! Error types for tar-delta

use thiserror::Error;

/// Main error type for delta generation and application
#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid delta stream: {0}")]
    InvalidDelta(String),

    #[error("Unknown delta opcode {0}")]
    UnknownOpcode(u8),

    #[error("{0} opcode but no source file is open")]
    NoSourceOpen(&'static str),

    #[error("Inconsistent chunk table for {path}: {detail}")]
    InvalidChunks { path: String, detail: String },
}

/// Result type alias for tar-delta operations
pub type Result<T> = std::result::Result<T, DeltaError>;
