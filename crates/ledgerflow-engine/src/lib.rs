//! Ledgerflow batch engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! A domain-agnostic, chunk-oriented batch engine for ledger-style jobs:
//! account processing, transaction reporting, statement generation.
//!
//! # Modules
//!
//! - **framework**: source iterator, stage pipeline, break-total accumulator,
//!   fault policy, chunk transaction coordinator, sinks and listeners
//! - **config**: engine defaults loaded from the environment
//! - **error**: error taxonomy consumed by the fault policy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledgerflow_engine::framework::{
//!     BatchJob, JobControl, JobParameters, LedgerEntry, MemoryStore, VecSource,
//! };
//!
//! # async fn run(entries: Vec<LedgerEntry>) -> ledgerflow_engine::error::BatchResult<()> {
//! let records = entries.into_iter().map(LedgerEntry::into_record).collect();
//! let store = Arc::new(MemoryStore::new("ledger"));
//! let job = BatchJob::builder(JobParameters::new("nightly-ledger"))
//!     .source(VecSource::new(records))
//!     .sink(store.clone())
//!     .build()?;
//! let report = job.run(&JobControl::new()).await?;
//! println!("{}", report.render_text());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod framework;

pub use config::EngineConfig;
pub use error::{BatchError, BatchResult, ErrorKind};
