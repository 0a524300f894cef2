//! Execution report

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledgerflow_common::Money;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::JobExecutionContext;
use super::types::{JobStatus, SkippedRecord};

/// Final report of one job execution
///
/// Every record the execution read ends up committed, skipped, or discarded
/// (read as part of a chunk that was abandoned by a failure or an abort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_name: String,
    pub execution_id: Uuid,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub records_read: u64,
    pub committed: u64,
    pub skipped: u64,
    pub errored: u64,
    pub chunks_committed: u64,
    pub chunks_rolled_back: u64,
    pub retries: u64,
    pub stage_errors: BTreeMap<String, u64>,
    pub skipped_records: Vec<SkippedRecord>,
    /// Grand total as of the last committed chunk
    pub grand_total: Money,
    pub failure: Option<String>,
    /// Chunk sequence this execution resumed after, if it was a restart
    pub resumed_from: Option<u64>,
}

impl JobReport {
    pub fn from_context(ctx: &JobExecutionContext, grand_total: Money) -> Self {
        let m = ctx.metrics();
        Self {
            job_name: ctx.job_name.clone(),
            execution_id: ctx.execution_id,
            status: ctx.status(),
            started_at: ctx.started_at(),
            ended_at: ctx.ended_at(),
            duration: ctx.elapsed(),
            records_read: m.records_read,
            committed: m.committed,
            skipped: m.skipped,
            errored: m.errored,
            chunks_committed: m.chunks_committed,
            chunks_rolled_back: m.chunks_rolled_back,
            retries: m.retries,
            stage_errors: m.stage_errors.clone(),
            skipped_records: ctx.skipped().to_vec(),
            grand_total,
            failure: ctx.failure().map(str::to_string),
            resumed_from: ctx.resumed_from(),
        }
    }

    /// Read but neither committed nor skipped
    pub fn discarded(&self) -> u64 {
        self.records_read
            .saturating_sub(self.committed)
            .saturating_sub(self.skipped)
    }

    /// Committed records per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.committed as f64 / secs
        } else {
            0.0
        }
    }

    /// Share of processed records that were committed
    pub fn success_rate(&self) -> f64 {
        let processed = self.committed + self.skipped;
        if processed == 0 {
            1.0
        } else {
            self.committed as f64 / processed as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::CompletedWithSkips)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Job:         {}", self.job_name);
        let _ = writeln!(out, "Execution:   {}", self.execution_id);
        let _ = writeln!(out, "Status:      {}", self.status);
        let _ = writeln!(out, "Started:     {}", self.started_at.to_rfc3339());
        if let Some(ended) = self.ended_at {
            let _ = writeln!(out, "Ended:       {}", ended.to_rfc3339());
        }
        let _ = writeln!(out, "Duration:    {:.3}s", self.duration.as_secs_f64());
        let _ = writeln!(
            out,
            "Records:     read={} committed={} skipped={} discarded={}",
            self.records_read,
            self.committed,
            self.skipped,
            self.discarded()
        );
        let _ = writeln!(
            out,
            "Chunks:      committed={} rolled_back={} retries={}",
            self.chunks_committed, self.chunks_rolled_back, self.retries
        );
        let _ = writeln!(
            out,
            "Rates:       success={:.2}% error={:.2}% throughput={:.1}/s",
            self.success_rate() * 100.0,
            self.error_rate() * 100.0,
            self.throughput()
        );
        let _ = writeln!(out, "Grand total: {}", self.grand_total);
        if let Some(failure) = &self.failure {
            let _ = writeln!(out, "Failure:     {}", failure);
        }
        if !self.stage_errors.is_empty() {
            let _ = writeln!(out, "Errors by stage:");
            for (stage, count) in &self.stage_errors {
                let _ = writeln!(out, "  {:<24} {}", stage, count);
            }
        }
        if !self.skipped_records.is_empty() {
            let _ = writeln!(out, "Skipped records:");
            for r in &self.skipped_records {
                let _ = writeln!(out, "  {} [{}] {}", r.natural_key, r.stage, r.reason);
            }
        }
        out
    }
}
