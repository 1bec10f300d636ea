use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

/// Recoverable failures: persisted buffers and configuration.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid file magic, expected {expected:?}")]
    InvalidMagic { expected: &'static str },

    #[error("unsupported file version {0}")]
    UnsupportedVersion(u16),

    #[error("corrupt file: {0}")]
    Corrupt(&'static str),

    #[error("{what} size mismatch (expected {expected}, found {found})")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
