//! Ledgerflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Ledgerflow workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Money**: Two-decimal fixed-point currency with banker's rounding
//! - **Checksums**: Content digests used for idempotent upserts
//! - **Logging**: Subscriber initialisation shared by every launcher
//!
//! # Example
//!
//! ```
//! use ledgerflow_common::Money;
//!
//! let total: Money = ["10.00", "-5.00", "20.00"]
//!     .iter()
//!     .map(|s| s.parse::<Money>().unwrap())
//!     .sum();
//! assert_eq!(total.to_string(), "25.00");
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod money;

// Re-export commonly used types
pub use error::{LedgerError, Result};
pub use money::Money;
