//! Shared fixtures for engine integration tests
//!
//! - Ledger record builders
//! - Sinks that fail on demand
//! - A listener that records the hooks it saw

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ledgerflow_common::Money;
use ledgerflow_engine::error::{BatchError, BatchResult};
use ledgerflow_engine::framework::{
    ChunkBatch, ChunkSink, ChunkState, ChunkSummary, JobControl, JobExecutionContext, JobListener,
    JobParameters, LedgerEntry, LineKind, Record, ReportLine, SkippedRecord,
};

/// Engine logs on the test writer; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ledgerflow_engine=debug")
        .with_test_writer()
        .try_init();
}

pub fn posted_on() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

pub fn entry(txn: &str, account: &str, amount: &str) -> LedgerEntry {
    LedgerEntry::new(txn, account, posted_on(), "CARD PAYMENT", amount.parse().unwrap())
}

/// `(transaction id, account, amount)` rows as ledger records
pub fn ledger(rows: &[(&str, &str, &str)]) -> Vec<Record<LedgerEntry>> {
    rows.iter()
        .map(|(txn, account, amount)| entry(txn, account, amount).into_record())
        .collect()
}

/// `count` records for `account`, amounts 1.01, 2.02, ...
pub fn numbered(account: &str, count: usize) -> Vec<Record<LedgerEntry>> {
    (1..=count)
        .map(|i| {
            LedgerEntry::new(
                format!("{}-T{:04}", account, i),
                account,
                posted_on(),
                "STANDING ORDER",
                Money::from_cents(101 * i as i64),
            )
            .into_record()
        })
        .collect()
}

pub fn sum(records: &[Record<LedgerEntry>]) -> Money {
    records.iter().map(|r| r.payload.amount).sum()
}

pub fn params(job_name: &str, chunk_size: usize, page_size: usize) -> JobParameters {
    JobParameters::new(job_name)
        .with_chunk_size(chunk_size)
        .with_page_size(page_size)
        .with_fetch_size(chunk_size)
        .with_retry_backoff(Duration::from_millis(1))
        .with_commit_timeout(Duration::from_secs(5))
}

/// Amount at the end of a total line
pub fn trailing_amount(line: &ReportLine) -> Money {
    line.text
        .split_whitespace()
        .last()
        .unwrap()
        .parse()
        .unwrap()
}

pub fn kinds(lines: &[ReportLine]) -> Vec<LineKind> {
    lines.iter().map(|l| l.kind).collect()
}

// ============================================================================
// Failing sink
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stage,
    Commit,
}

/// Transactional sink that fails a given chunk sequence a number of times
pub struct FailingSink {
    phase: Phase,
    remaining: Mutex<HashMap<u64, u32>>,
    error: fn() -> BatchError,
    failures: Mutex<u32>,
}

impl FailingSink {
    pub fn new(phase: Phase, error: fn() -> BatchError) -> Self {
        Self {
            phase,
            remaining: Mutex::new(HashMap::new()),
            error,
            failures: Mutex::new(0),
        }
    }

    pub fn fail(self, sequence: u64, times: u32) -> Self {
        self.remaining.lock().unwrap().insert(sequence, times);
        self
    }

    pub fn failures(&self) -> u32 {
        *self.failures.lock().unwrap()
    }

    fn trip(&self, phase: Phase, sequence: u64) -> BatchResult<()> {
        if phase != self.phase {
            return Ok(());
        }
        let mut remaining = self.remaining.lock().unwrap();
        match remaining.get_mut(&sequence) {
            Some(left) if *left > 0 => {
                *left -= 1;
                *self.failures.lock().unwrap() += 1;
                Err((self.error)())
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<P: Send + Sync> ChunkSink<P> for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        self.trip(Phase::Stage, batch.sequence)
    }

    async fn commit(&self, sequence: u64) -> BatchResult<()> {
        self.trip(Phase::Commit, sequence)
    }

    async fn rollback(&self, _sequence: u64) -> BatchResult<()> {
        Ok(())
    }

    async fn undo(&self, _sequence: u64) -> BatchResult<()> {
        Ok(())
    }
}

pub fn transient() -> BatchError {
    BatchError::Transient("connection reset by peer".into())
}

pub fn crash() -> BatchError {
    BatchError::Unknown("process killed".into())
}

// ============================================================================
// Recording listener
// ============================================================================

/// Records every hook as a short event string
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    states: Mutex<Vec<(u64, ChunkState)>>,
    /// Graceful stop once this chunk has committed
    stop_after: Option<(u64, JobControl)>,
    /// Hard abort when this chunk starts
    abort_at: Option<(u64, JobControl)>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stopping_after(sequence: u64, control: JobControl) -> Self {
        Self {
            stop_after: Some((sequence, control)),
            ..Self::default()
        }
    }

    pub fn aborting_at(sequence: u64, control: JobControl) -> Self {
        Self {
            abort_at: Some((sequence, control)),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Chunk state transitions in the order they happened
    pub fn states(&self) -> Vec<(u64, ChunkState)> {
        self.states.lock().unwrap().clone()
    }

    pub fn states_of(&self, sequence: u64) -> Vec<ChunkState> {
        self.states()
            .into_iter()
            .filter(|(seq, _)| *seq == sequence)
            .map(|(_, state)| state)
            .collect()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl JobListener for RecordingListener {
    fn before_job(&self, _ctx: &JobExecutionContext) {
        self.push("before_job".into());
    }

    fn after_job(&self, _ctx: &JobExecutionContext, report: &ledgerflow_engine::framework::JobReport) {
        self.push(format!("after_job:{}", report.status));
    }

    fn before_chunk(&self, _ctx: &JobExecutionContext, sequence: u64, attempt: u32) {
        self.push(format!("before_chunk:{}:{}", sequence, attempt));
        if let Some((at, control)) = &self.abort_at {
            if *at == sequence {
                control.abort();
            }
        }
    }

    fn after_chunk(&self, _ctx: &JobExecutionContext, summary: &ChunkSummary) {
        self.push(format!("after_chunk:{}:{:?}", summary.sequence, summary.state));
        if let Some((after, control)) = &self.stop_after {
            if *after == summary.sequence {
                control.stop();
            }
        }
    }

    fn on_chunk_error(&self, _ctx: &JobExecutionContext, sequence: u64, _error: &BatchError) {
        self.push(format!("chunk_error:{}", sequence));
    }

    fn on_skip(&self, _ctx: &JobExecutionContext, record: &SkippedRecord) {
        self.push(format!("skip:{}", record.natural_key));
    }

    fn on_chunk_state(&self, _ctx: &JobExecutionContext, sequence: u64, state: ChunkState) {
        self.states.lock().unwrap().push((sequence, state));
    }
}
