//! Error types shared across Ledgerflow crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Common error type
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid amount '{input}': {reason}")]
    InvalidAmount { input: String, reason: String },

    #[error("Amount overflow while adding {left} and {right}")]
    AmountOverflow { left: String, right: String },

    #[error("Configuration error: {0}")]
    Config(String),
}
