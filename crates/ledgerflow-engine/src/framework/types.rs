//! Core types for the chunked batch engine

use std::time::Duration;

use chrono::{DateTime, Utc};
use ledgerflow_common::Money;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::accumulator::AccumulatorState;
use crate::error::{BatchError, BatchResult};

/// Input record read from a source
///
/// Immutable once read: stages consume a record and hand back a new one
/// inside [`ProcessingResult::Accepted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<P> {
    /// Key used by persistence sinks for idempotent upserts
    pub natural_key: String,
    /// Defines read and commit sequence; compared lexicographically
    pub order_key: String,
    /// Defines control-break grouping (e.g. account id)
    pub group_key: String,
    pub payload: P,
}

impl<P> Record<P> {
    pub fn new(
        natural_key: impl Into<String>,
        order_key: impl Into<String>,
        group_key: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            natural_key: natural_key.into(),
            order_key: order_key.into(),
            group_key: group_key.into(),
            payload,
        }
    }

    /// Replace the payload, keeping the keys
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> Record<Q> {
        Record {
            natural_key: self.natural_key,
            order_key: self.order_key,
            group_key: self.group_key,
            payload: f(self.payload),
        }
    }
}

/// Payloads that contribute an amount to the break totals
pub trait Amounted {
    fn amount(&self) -> Money;
}

/// Outcome of running a record through a stage
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResult<P> {
    Accepted(Record<P>),
    Skipped(String),
    Retryable(BatchError),
    Fatal(BatchError),
}

impl<P> ProcessingResult<P> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProcessingResult::Accepted(_))
    }

    /// Map an infrastructure error onto the matching variant
    pub fn from_error(err: BatchError) -> Self {
        use crate::error::ErrorKind;
        match err.kind() {
            ErrorKind::Transient => ProcessingResult::Retryable(err),
            ErrorKind::Validation => ProcessingResult::Skipped(err.to_string()),
            ErrorKind::Source | ErrorKind::Unknown => ProcessingResult::Fatal(err),
        }
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Starting,
    Running,
    Completed,
    CompletedWithSkips,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Starting => "STARTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedWithSkips => "COMPLETED_WITH_SKIPS",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithSkips
                | JobStatus::Failed
                | JobStatus::Stopped
        )
    }

    /// Whether `self -> next` is a legal lifecycle step
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Starting, JobStatus::Running) => true,
            // Lock or checkpoint failures end a job before it runs
            (JobStatus::Starting, JobStatus::Failed) => true,
            (JobStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "COMPLETED_WITH_SKIPS" => JobStatus::CompletedWithSkips,
            "FAILED" => JobStatus::Failed,
            "STOPPED" => JobStatus::Stopped,
            _ => JobStatus::Starting,
        }
    }
}

/// Per-chunk state machine: `Collecting -> Committing -> {Committed, RolledBack}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Collecting,
    Committing,
    Committed,
    RolledBack,
}

/// Position in a record source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Number of records consumed from the start of the (filtered) source
    pub offset: u64,
    /// Order key of the last consumed record
    pub after_key: Option<String>,
}

/// Inclusive order-key range a source is restricted to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start_key: Option<String>,
    pub end_key: Option<String>,
}

impl KeyRange {
    pub fn contains(&self, key: &str) -> bool {
        self.start_key.as_deref().is_none_or(|s| key >= s)
            && self.end_key.as_deref().is_none_or(|e| key <= e)
    }
}

/// Durable marker of the last committed chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub execution_id: Uuid,
    /// Sequence number of the last committed (or rolled-back-and-skipped) chunk
    pub chunk_sequence: u64,
    pub last_order_key: Option<String>,
    pub cursor: Cursor,
    /// Records durably committed across all executions of this job instance
    pub committed_records: u64,
    /// Break totals as of this checkpoint, restored on restart
    pub totals: AccumulatorState,
    /// Report header already committed
    #[serde(default)]
    pub header_written: bool,
    /// Set once the trailer (final totals) has been committed
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn initial(job_name: &str, execution_id: Uuid, totals: AccumulatorState) -> Self {
        Self {
            job_name: job_name.to_string(),
            execution_id,
            chunk_sequence: 0,
            last_order_key: None,
            cursor: Cursor::default(),
            committed_records: 0,
            totals,
            header_written: false,
            completed: false,
            updated_at: Utc::now(),
        }
    }
}

/// Parameters a job is launched with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub job_name: String,
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub chunk_size: usize,
    /// Detail lines per report page
    pub page_size: usize,
    pub max_retry_attempts: u32,
    pub skip_limit: u64,
    /// When false, the first skip candidate fails the job
    pub fault_tolerant: bool,
    pub commit_timeout: Duration,
    pub retry_backoff: Duration,
    /// Records fetched per source page
    pub fetch_size: usize,
    /// Source-internal retries before `SourceUnavailable`
    pub source_retry_attempts: u32,
    pub output_target: Option<String>,
}

impl JobParameters {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            start_key: None,
            end_key: None,
            chunk_size: 100,
            page_size: 60,
            max_retry_attempts: 3,
            skip_limit: 10,
            fault_tolerant: true,
            commit_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(200),
            fetch_size: 100,
            source_retry_attempts: 3,
            output_target: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_fault_tolerant(mut self, fault_tolerant: bool) -> Self {
        self.fault_tolerant = fault_tolerant;
        self
    }

    pub fn with_key_range(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.start_key = start;
        self.end_key = end;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    pub fn with_output_target(mut self, target: impl Into<String>) -> Self {
        self.output_target = Some(target.into());
        self
    }

    pub fn key_range(&self) -> KeyRange {
        KeyRange {
            start_key: self.start_key.clone(),
            end_key: self.end_key.clone(),
        }
    }

    pub fn validate(&self) -> BatchResult<()> {
        if self.job_name.trim().is_empty() {
            return Err(BatchError::Config("job_name cannot be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(BatchError::Config("chunk_size must be greater than 0".into()));
        }
        if self.page_size == 0 {
            return Err(BatchError::Config("page_size must be greater than 0".into()));
        }
        if self.fetch_size == 0 {
            return Err(BatchError::Config("fetch_size must be greater than 0".into()));
        }
        if self.commit_timeout.is_zero() {
            return Err(BatchError::Config("commit_timeout must be greater than 0".into()));
        }
        if let (Some(start), Some(end)) = (&self.start_key, &self.end_key) {
            if start > end {
                return Err(BatchError::Config(format!(
                    "start_key '{}' is after end_key '{}'",
                    start, end
                )));
            }
        }
        Ok(())
    }
}

/// Classification of a formatted report line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Header,
    Detail,
    PageTotal,
    GroupTotal,
    GrandTotal,
}

impl LineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineKind::Header => "header",
            LineKind::Detail => "detail",
            LineKind::PageTotal => "page_total",
            LineKind::GroupTotal => "group_total",
            LineKind::GrandTotal => "grand_total",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLine {
    pub kind: LineKind,
    pub text: String,
}

impl ReportLine {
    pub fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Everything written atomically for one chunk
#[derive(Debug, Clone)]
pub struct ChunkBatch<P> {
    pub job_name: String,
    pub execution_id: Uuid,
    pub sequence: u64,
    pub records: Vec<Record<P>>,
    pub lines: Vec<ReportLine>,
    pub checkpoint: Checkpoint,
}

/// Why a record was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// A stage returned `Skipped`
    Rejected,
    /// The whole chunk was rolled back after its retries were spent
    ChunkRolledBack,
}

/// Skipped record, reported for manual remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub natural_key: String,
    pub order_key: String,
    pub chunk_sequence: u64,
    /// Stage that rejected the record, or "commit" for chunk rollbacks
    pub stage: String,
    pub reason: String,
    pub cause: SkipCause,
}
