//! Per-execution state
//!
//! One [`JobExecutionContext`] exists per job execution. It is created with
//! zeroed counters, threaded through the coordinator by `&mut`, and turned
//! into an [`ExecutionRecord`] and a [`JobReport`](super::report::JobReport)
//! at the end. Nothing in here is global.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fault::FaultState;
use super::repository::ExecutionRecord;
use super::types::{JobStatus, SkippedRecord};
use crate::error::{BatchError, BatchResult};

/// Counters accumulated over one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub records_read: u64,
    /// Records durably committed by this execution
    pub committed: u64,
    pub skipped: u64,
    /// Chunk-level failures (stage retries, commit failures)
    pub errored: u64,
    pub chunks_committed: u64,
    pub chunks_rolled_back: u64,
    pub retries: u64,
    /// Rejections and failures per stage name ("commit" for sink failures)
    pub stage_errors: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct JobExecutionContext {
    pub execution_id: Uuid,
    pub job_name: String,
    status: JobStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    clock: Instant,
    elapsed: Option<Duration>,
    metrics: ExecutionMetrics,
    fault_state: FaultState,
    skipped: Vec<SkippedRecord>,
    failure: Option<String>,
    resumed_from: Option<u64>,
}

impl JobExecutionContext {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            job_name: job_name.into(),
            status: JobStatus::Starting,
            started_at: Utc::now(),
            ended_at: None,
            clock: Instant::now(),
            elapsed: None,
            metrics: ExecutionMetrics::default(),
            fault_state: FaultState::new(),
            skipped: Vec::new(),
            failure: None,
            resumed_from: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move along the job lifecycle; terminal states stamp the end time
    pub fn transition(&mut self, next: JobStatus) -> BatchResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BatchError::Unknown(format!(
                "illegal job status transition {} -> {}",
                self.status, next
            )));
        }
        tracing::debug!(from = %self.status, to = %next, "Job status transition");
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.elapsed = Some(self.clock.elapsed());
        }
        Ok(())
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.clock.elapsed())
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut ExecutionMetrics {
        &mut self.metrics
    }

    pub fn fault_state(&self) -> &FaultState {
        &self.fault_state
    }

    pub fn fault_state_mut(&mut self) -> &mut FaultState {
        &mut self.fault_state
    }

    pub fn record_stage_error(&mut self, stage: &str) {
        *self.metrics.stage_errors.entry(stage.to_string()).or_insert(0) += 1;
    }

    /// Count skipped records against the skip budget; returns the new total
    pub fn record_skips(&mut self, records: Vec<SkippedRecord>) -> u64 {
        for record in &records {
            *self
                .metrics
                .stage_errors
                .entry(record.stage.clone())
                .or_insert(0) += 1;
        }
        let total = self.fault_state.record_skips(records.len() as u64);
        self.metrics.skipped = total;
        self.skipped.extend(records);
        total
    }

    pub fn skipped(&self) -> &[SkippedRecord] {
        &self.skipped
    }

    /// Remember why the job failed; the first reason wins
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn set_resumed_from(&mut self, chunk_sequence: u64) {
        self.resumed_from = Some(chunk_sequence);
    }

    pub fn resumed_from(&self) -> Option<u64> {
        self.resumed_from
    }

    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id,
            job_name: self.job_name.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            metrics: self.metrics.clone(),
            failure: self.failure.clone(),
        }
    }
}
