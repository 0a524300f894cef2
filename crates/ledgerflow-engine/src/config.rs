//! Engine configuration

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::framework::JobParameters;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default number of records per chunk transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default number of detail lines per report page.
pub const DEFAULT_PAGE_SIZE: usize = 60;

/// Default number of retries for a failed chunk.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default number of skipped records tolerated before the job fails.
pub const DEFAULT_SKIP_LIMIT: u64 = 10;

/// Default fault-tolerance mode.
pub const DEFAULT_FAULT_TOLERANT: bool = true;

/// Default chunk commit timeout in seconds.
pub const DEFAULT_COMMIT_TIMEOUT_SECS: u64 = 30;

/// Default base backoff between chunk retries in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Default number of source page retries before the source is unavailable.
pub const DEFAULT_SOURCE_RETRY_ATTEMPTS: u32 = 3;

/// Engine defaults applied to every job launched from this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub page_size: usize,
    pub max_retry_attempts: u32,
    pub skip_limit: u64,
    pub fault_tolerant: bool,
    pub commit_timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub source_retry_attempts: u32,
    /// Records per source page; falls back to `chunk_size`
    pub fetch_page_size: Option<usize>,
    pub output_target: Option<String>,
}

impl EngineConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            chunk_size: env_or("LEDGERFLOW_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            page_size: env_or("LEDGERFLOW_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            max_retry_attempts: env_or("LEDGERFLOW_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)?,
            skip_limit: env_or("LEDGERFLOW_SKIP_LIMIT", DEFAULT_SKIP_LIMIT)?,
            fault_tolerant: env_or("LEDGERFLOW_FAULT_TOLERANT", DEFAULT_FAULT_TOLERANT)?,
            commit_timeout_secs: env_or("LEDGERFLOW_COMMIT_TIMEOUT_SECS", DEFAULT_COMMIT_TIMEOUT_SECS)?,
            retry_backoff_ms: env_or("LEDGERFLOW_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?,
            source_retry_attempts: env_or(
                "LEDGERFLOW_SOURCE_RETRY_ATTEMPTS",
                DEFAULT_SOURCE_RETRY_ATTEMPTS,
            )?,
            fetch_page_size: env_opt("LEDGERFLOW_FETCH_PAGE_SIZE")?,
            output_target: std::env::var("LEDGERFLOW_OUTPUT_TARGET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than 0");
        }

        if self.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0");
        }

        if self.commit_timeout_secs == 0 {
            anyhow::bail!("commit_timeout_secs must be greater than 0");
        }

        if self.fetch_page_size == Some(0) {
            anyhow::bail!("fetch_page_size must be greater than 0");
        }

        if !self.fault_tolerant && self.skip_limit > 0 {
            tracing::warn!(
                skip_limit = self.skip_limit,
                "skip_limit has no effect when fault tolerance is disabled"
            );
        }

        Ok(())
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_page_size.unwrap_or(self.chunk_size)
    }

    /// Launch parameters for `job_name` carrying these defaults
    pub fn job_parameters(&self, job_name: impl Into<String>) -> JobParameters {
        let mut params = JobParameters::new(job_name)
            .with_chunk_size(self.chunk_size)
            .with_page_size(self.page_size)
            .with_max_retry_attempts(self.max_retry_attempts)
            .with_skip_limit(self.skip_limit)
            .with_fault_tolerant(self.fault_tolerant)
            .with_commit_timeout(Duration::from_secs(self.commit_timeout_secs))
            .with_retry_backoff(Duration::from_millis(self.retry_backoff_ms))
            .with_fetch_size(self.fetch_size());
        params.source_retry_attempts = self.source_retry_attempts;
        if let Some(target) = &self.output_target {
            params = params.with_output_target(target.clone());
        }
        params
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            skip_limit: DEFAULT_SKIP_LIMIT,
            fault_tolerant: DEFAULT_FAULT_TOLERANT,
            commit_timeout_secs: DEFAULT_COMMIT_TIMEOUT_SECS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            source_retry_attempts: DEFAULT_SOURCE_RETRY_ATTEMPTS,
            fetch_page_size: None,
            output_target: None,
        }
    }
}

fn env_opt<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        _ => Ok(None),
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env_opt(key)?.unwrap_or(default))
}
