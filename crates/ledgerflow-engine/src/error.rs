//! Engine error taxonomy
//!
//! Stages and the accumulator never raise these past their boundary; they
//! return tagged results instead. Only the coordinator's persistence step and
//! the source iterator surface real errors, which the fault policy classifies
//! through [`BatchError::kind`].

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type BatchResult<T> = std::result::Result<T, BatchError>;

/// Coarse classification consumed by the fault policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Record source failure; aborts the job without touching the skip budget
    Source,
    /// Validation or business-rule violation; skip candidate, never retried
    Validation,
    /// Transient infrastructure failure; retried within the retry budget
    Transient,
    /// Unclassified failure; aborts the job
    Unknown,
}

/// Main error type for the batch engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Record source out of order: '{next}' follows '{previous}'")]
    SourceOrder { previous: String, next: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("Transient infrastructure failure: {0}")]
    Transient(String),

    #[error("Chunk commit timed out after {0:?}")]
    CommitTimeout(Duration),

    #[error("Job '{job_name}' is already running as execution {holder}")]
    AlreadyRunning { job_name: String, holder: Uuid },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::SourceUnavailable(_) | BatchError::SourceOrder { .. } => ErrorKind::Source,
            BatchError::Validation(_) | BatchError::BusinessRule(_) => ErrorKind::Validation,
            BatchError::Transient(_) | BatchError::CommitTimeout(_) => ErrorKind::Transient,
            BatchError::AlreadyRunning { .. } | BatchError::Config(_) | BatchError::Unknown(_) => {
                ErrorKind::Unknown
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<ledgerflow_common::LedgerError> for BatchError {
    fn from(err: ledgerflow_common::LedgerError) -> Self {
        use ledgerflow_common::LedgerError;
        match err {
            LedgerError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock => BatchError::Transient(e.to_string()),
                _ => BatchError::Unknown(e.to_string()),
            },
            LedgerError::InvalidAmount { .. } | LedgerError::AmountOverflow { .. } => {
                BatchError::Validation(err.to_string())
            },
            LedgerError::Serialization(e) => BatchError::Unknown(e.to_string()),
            LedgerError::Config(msg) => BatchError::Config(msg),
        }
    }
}

impl From<std::io::Error> for BatchError {
    fn from(err: std::io::Error) -> Self {
        ledgerflow_common::LedgerError::Io(err).into()
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        BatchError::Unknown(format!("serialization: {}", err))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for BatchError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                BatchError::Transient(err.to_string())
            },
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    BatchError::Transient(err.to_string())
                },
                Some(code) if code.starts_with("23") => BatchError::Validation(err.to_string()),
                _ => BatchError::Unknown(err.to_string()),
            },
            _ => BatchError::Unknown(err.to_string()),
        }
    }
}
