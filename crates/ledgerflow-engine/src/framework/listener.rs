//! Job and chunk lifecycle hooks

use serde::{Deserialize, Serialize};

use super::context::JobExecutionContext;
use super::report::JobReport;
use super::types::{ChunkState, SkippedRecord};
use crate::error::BatchError;

/// Outcome of one chunk, passed to `after_chunk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub sequence: u64,
    pub state: ChunkState,
    /// Records written to the sinks
    pub committed: usize,
    /// Records counted against the skip budget
    pub skipped: usize,
    /// Attempts taken, 1 when the first attempt succeeded
    pub attempts: u32,
}

/// Hooks are synchronous and must not fail the job
pub trait JobListener: Send + Sync {
    fn before_job(&self, _ctx: &JobExecutionContext) {}

    fn after_job(&self, _ctx: &JobExecutionContext, _report: &JobReport) {}

    fn before_chunk(&self, _ctx: &JobExecutionContext, _sequence: u64, _attempt: u32) {}

    fn after_chunk(&self, _ctx: &JobExecutionContext, _summary: &ChunkSummary) {}

    /// Every chunk state transition, retries included
    fn on_chunk_state(&self, _ctx: &JobExecutionContext, _sequence: u64, _state: ChunkState) {}

    fn on_chunk_error(&self, _ctx: &JobExecutionContext, _sequence: u64, _error: &BatchError) {}

    fn on_skip(&self, _ctx: &JobExecutionContext, _record: &SkippedRecord) {}
}

/// Emits structured log events for every hook
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl JobListener for LoggingListener {
    fn before_job(&self, ctx: &JobExecutionContext) {
        tracing::info!(
            job = %ctx.job_name,
            execution_id = %ctx.execution_id,
            resumed_from = ?ctx.resumed_from(),
            "Job started"
        );
    }

    fn after_job(&self, ctx: &JobExecutionContext, report: &JobReport) {
        tracing::info!(
            job = %ctx.job_name,
            execution_id = %ctx.execution_id,
            status = %report.status,
            committed = report.committed,
            skipped = report.skipped,
            chunks = report.chunks_committed,
            duration_ms = report.duration.as_millis() as u64,
            throughput = format!("{:.1}", report.throughput()),
            "Job finished"
        );
    }

    fn before_chunk(&self, ctx: &JobExecutionContext, sequence: u64, attempt: u32) {
        tracing::debug!(job = %ctx.job_name, sequence, attempt, "Chunk started");
    }

    fn after_chunk(&self, ctx: &JobExecutionContext, summary: &ChunkSummary) {
        tracing::debug!(
            job = %ctx.job_name,
            sequence = summary.sequence,
            state = ?summary.state,
            committed = summary.committed,
            skipped = summary.skipped,
            attempts = summary.attempts,
            "Chunk finished"
        );
    }

    fn on_chunk_error(&self, ctx: &JobExecutionContext, sequence: u64, error: &BatchError) {
        tracing::warn!(job = %ctx.job_name, sequence, error = %error, "Chunk failed");
    }

    fn on_skip(&self, ctx: &JobExecutionContext, record: &SkippedRecord) {
        tracing::warn!(
            job = %ctx.job_name,
            natural_key = %record.natural_key,
            stage = %record.stage,
            reason = %record.reason,
            "Record skipped"
        );
    }
}
