//! Chunk transaction coordinator
//!
//! Drives one job execution:
//! 1. Claim the run lock and load the last checkpoint (resume or fresh start)
//! 2. Read up to `chunk_size` records, run them through the stage pipeline
//!    and fold the accepted ones into the break totals
//! 3. Commit records, report lines and the new checkpoint as one unit
//! 4. Repeat until the source is exhausted, then commit the final group and
//!    grand totals
//!
//! Per chunk: `Collecting -> Committing -> {Committed, RolledBack}`. A failed
//! attempt restores the break totals to the chunk-start snapshot and the
//! fault policy decides between retrying the whole chunk from `Collecting`,
//! rolling it back (every record skipped) or failing the job.

use std::sync::Arc;

use chrono::Utc;
use ledgerflow_common::Money;
use tracing::Instrument;

use super::accumulator::{AccumulatorState, BreakTotalAccumulator};
use super::context::JobExecutionContext;
use super::control::JobControl;
use super::fault::{ChunkFailureAction, FaultPolicy};
use super::layout::ReportLayout;
use super::listener::{ChunkSummary, JobListener};
use super::report::JobReport;
use super::repository::{JobRepository, MemoryJobRepository};
use super::sink::{ChunkSink, FileReportSink, SinkSet};
use super::source::{RecordSource, SourceIterator};
use super::stage::{PipelineOutcome, Rejection, StagePipeline};
use super::types::{
    Amounted, Checkpoint, ChunkBatch, ChunkState, Cursor, JobParameters, JobStatus, LineKind,
    Record, ReportLine, SkipCause, SkippedRecord,
};
use crate::error::{BatchError, BatchResult};

/// How a chunk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Committed,
    RolledBack,
    /// Hard abort; nothing committed
    Aborted,
    /// Job must fail; reason recorded in the context
    Failed,
}

/// A configured chunk-oriented job
pub struct BatchJob<P> {
    params: JobParameters,
    policy: FaultPolicy,
    source: Arc<dyn RecordSource<P>>,
    pipeline: StagePipeline<P>,
    layout: Option<Arc<dyn ReportLayout<P>>>,
    sinks: SinkSet<P>,
    repository: Arc<dyn JobRepository>,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl<P> BatchJob<P>
where
    P: Amounted + Clone + Send + Sync + 'static,
{
    pub fn builder(params: JobParameters) -> BatchJobBuilder<P> {
        BatchJobBuilder {
            params,
            source: None,
            pipeline: None,
            layout: None,
            sinks: SinkSet::new(),
            repository: None,
            listeners: Vec::new(),
        }
    }

    pub fn params(&self) -> &JobParameters {
        &self.params
    }

    pub fn policy(&self) -> &FaultPolicy {
        &self.policy
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        Arc::clone(&self.repository)
    }

    /// Run the job to a terminal state
    ///
    /// Failures inside the run end as a `FAILED` report. An `Err` means the
    /// execution never started (run lock held elsewhere, repository down).
    pub async fn run(&self, control: &JobControl) -> BatchResult<JobReport> {
        let mut ctx = JobExecutionContext::new(self.params.job_name.clone());
        let span = tracing::info_span!(
            "batch_job",
            job = %self.params.job_name,
            execution_id = %ctx.execution_id
        );

        async {
            self.repository
                .acquire_lock(&self.params.job_name, ctx.execution_id)
                .await?;

            let grand_total = self.execute(&mut ctx, control).await;

            if let Err(e) = self.repository.save_execution(&ctx.to_record()).await {
                tracing::warn!(error = %e, "Failed to persist execution record");
            }
            if let Err(e) = self
                .repository
                .release_lock(&self.params.job_name, ctx.execution_id)
                .await
            {
                tracing::warn!(error = %e, "Failed to release run lock");
            }

            let report = JobReport::from_context(&ctx, grand_total);
            for listener in &self.listeners {
                listener.after_job(&ctx, &report);
            }
            tracing::info!(
                status = %report.status,
                records_read = report.records_read,
                committed = report.committed,
                skipped = report.skipped,
                grand_total = %report.grand_total,
                "Batch job completed"
            );
            Ok::<_, BatchError>(report)
        }
        .instrument(span)
        .await
    }

    /// Everything between lock acquisition and release; returns the grand
    /// total as of the last commit
    async fn execute(&self, ctx: &mut JobExecutionContext, control: &JobControl) -> Money {
        let job_name = self.params.job_name.as_str();

        let mut checkpoint = match self.repository.load_checkpoint(job_name).await {
            Ok(Some(cp)) if !cp.completed => {
                tracing::info!(
                    chunk_sequence = cp.chunk_sequence,
                    last_order_key = ?cp.last_order_key,
                    committed_records = cp.committed_records,
                    "Resuming from checkpoint"
                );
                ctx.set_resumed_from(cp.chunk_sequence);
                Checkpoint {
                    execution_id: ctx.execution_id,
                    ..cp
                }
            },
            Ok(_) => Checkpoint::initial(job_name, ctx.execution_id, AccumulatorState::default()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load checkpoint");
                ctx.fail(format!("checkpoint load failed: {}", e));
                self.set_status(ctx, JobStatus::Failed);
                return Money::ZERO;
            },
        };

        if let Err(e) = self.sinks.open(checkpoint.chunk_sequence).await {
            tracing::error!(error = %e, "Failed to open sinks");
            ctx.fail(format!("sink open failed: {}", e));
            self.set_status(ctx, JobStatus::Failed);
            return checkpoint.totals.grand_total;
        }

        self.set_status(ctx, JobStatus::Running);
        for listener in &self.listeners {
            listener.before_job(ctx);
        }

        let mut accumulator =
            BreakTotalAccumulator::from_state(self.params.page_size, checkpoint.totals.clone());
        let mut reader = SourceIterator::new(
            Arc::clone(&self.source),
            self.params.key_range(),
            self.params.fetch_size,
        )
        .resume_from(checkpoint.cursor.clone())
        .with_retry(self.params.source_retry_attempts, self.params.retry_backoff);

        let status = loop {
            if control.is_stop_requested() {
                tracing::info!(
                    chunk_sequence = checkpoint.chunk_sequence,
                    "Stop requested, ending at chunk boundary"
                );
                break JobStatus::Stopped;
            }

            let read = tokio::select! {
                biased;
                _ = control.aborted() => None,
                read = reader.next_chunk(self.params.chunk_size) => Some(read),
            };
            let records = match read {
                None => break JobStatus::Stopped,
                Some(Ok(records)) => records,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Record source failed, aborting job");
                    ctx.fail(e.to_string());
                    break JobStatus::Failed;
                },
            };

            if records.is_empty() {
                break if self.commit_trailer(ctx, &mut accumulator, &mut checkpoint).await {
                    if ctx.fault_state().skip_count_total() > 0 {
                        JobStatus::CompletedWithSkips
                    } else {
                        JobStatus::Completed
                    }
                } else {
                    JobStatus::Failed
                };
            }

            ctx.metrics_mut().records_read += records.len() as u64;
            let position = reader.position().clone();

            match self
                .run_chunk(ctx, control, &mut accumulator, &mut checkpoint, records, position)
                .await
            {
                ChunkOutcome::Committed | ChunkOutcome::RolledBack => {},
                ChunkOutcome::Aborted => break JobStatus::Stopped,
                ChunkOutcome::Failed => break JobStatus::Failed,
            }
        };

        self.set_status(ctx, status);
        accumulator.grand_total()
    }

    /// One chunk, from `Collecting` to a final chunk state
    async fn run_chunk(
        &self,
        ctx: &mut JobExecutionContext,
        control: &JobControl,
        accumulator: &mut BreakTotalAccumulator,
        checkpoint: &mut Checkpoint,
        records: Vec<Record<P>>,
        position: Cursor,
    ) -> ChunkOutcome {
        let sequence = checkpoint.chunk_sequence + 1;
        let snapshot = accumulator.state().clone();
        let mut attempt: u32 = 1;

        loop {
            for listener in &self.listeners {
                listener.before_chunk(ctx, sequence, attempt);
            }
            self.enter_state(ctx, sequence, ChunkState::Collecting);

            let outcome = tokio::select! {
                biased;
                _ = control.aborted() => None,
                outcome = self.pipeline.process_chunk(records.clone()) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                return self.abandon(sequence).await;
            };

            let (failed_stage, error) = match outcome {
                PipelineOutcome::Fatal { stage, error } => {
                    tracing::error!(sequence, stage = %stage, error = %error, "Stage failed fatally");
                    ctx.record_stage_error(&stage);
                    ctx.fail(format!("stage '{}' failed: {}", stage, error));
                    return ChunkOutcome::Failed;
                },
                PipelineOutcome::Retry { stage, error } => (stage, error),
                PipelineOutcome::Completed { accepted, rejected } => {
                    let rejected = Self::rejections(sequence, rejected);

                    if !rejected.is_empty() {
                        if !self.policy.fault_tolerant {
                            let first = format!("{} ({})", rejected[0].natural_key, rejected[0].reason);
                            self.record_skips(ctx, rejected);
                            ctx.fail(format!("record {} rejected and job is not fault tolerant", first));
                            return ChunkOutcome::Failed;
                        }
                        let projected = ctx.fault_state().skip_count_total() + rejected.len() as u64;
                        if self.policy.exceeds_skip_limit(projected) {
                            let total = self.record_skips(ctx, rejected);
                            tracing::error!(
                                sequence,
                                skip_count_total = total,
                                skip_limit = self.policy.skip_limit,
                                "Skip limit exceeded"
                            );
                            ctx.fail(format!(
                                "skip limit {} exceeded ({} skipped)",
                                self.policy.skip_limit, total
                            ));
                            return ChunkOutcome::Failed;
                        }
                    }

                    if control.is_abort_requested() {
                        return self.abandon(sequence).await;
                    }

                    *accumulator =
                        BreakTotalAccumulator::from_state(self.params.page_size, snapshot.clone());
                    let lines = match self.format_chunk(accumulator, &accepted, !checkpoint.header_written) {
                        Ok(lines) => lines,
                        Err(e) => {
                            tracing::error!(sequence, error = %e, "Break totals could not absorb chunk");
                            *accumulator =
                                BreakTotalAccumulator::from_state(self.params.page_size, snapshot.clone());
                            ctx.fail(format!("chunk {} totals: {}", sequence, e));
                            return ChunkOutcome::Failed;
                        },
                    };
                    let batch = ChunkBatch {
                        job_name: self.params.job_name.clone(),
                        execution_id: ctx.execution_id,
                        sequence,
                        checkpoint: Checkpoint {
                            chunk_sequence: sequence,
                            last_order_key: position.after_key.clone(),
                            cursor: position.clone(),
                            committed_records: checkpoint.committed_records + accepted.len() as u64,
                            totals: accumulator.state().clone(),
                            header_written: true,
                            completed: false,
                            updated_at: Utc::now(),
                            ..checkpoint.clone()
                        },
                        records: accepted,
                        lines,
                    };

                    self.enter_state(ctx, sequence, ChunkState::Committing);
                    match self.commit(&batch, checkpoint).await {
                        Ok(()) => {
                            self.enter_state(ctx, sequence, ChunkState::Committed);
                            let summary = ChunkSummary {
                                sequence,
                                state: ChunkState::Committed,
                                committed: batch.records.len(),
                                skipped: rejected.len(),
                                attempts: attempt,
                            };
                            self.record_skips(ctx, rejected);
                            {
                                let m = ctx.metrics_mut();
                                m.committed += summary.committed as u64;
                                m.chunks_committed += 1;
                            }
                            ctx.fault_state_mut().reset_chunk(sequence);
                            *checkpoint = batch.checkpoint.clone();
                            self.sinks.notify(&batch).await;

                            tracing::debug!(
                                sequence,
                                committed = summary.committed,
                                skipped = summary.skipped,
                                last_order_key = ?checkpoint.last_order_key,
                                "Chunk committed"
                            );
                            for listener in &self.listeners {
                                listener.after_chunk(ctx, &summary);
                            }
                            return ChunkOutcome::Committed;
                        },
                        Err(e) => ("commit".to_string(), e),
                    }
                },
            };

            // Failed attempt: totals back to the chunk-start snapshot
            *accumulator = BreakTotalAccumulator::from_state(self.params.page_size, snapshot.clone());
            ctx.metrics_mut().errored += 1;
            for listener in &self.listeners {
                listener.on_chunk_error(ctx, sequence, &error);
            }

            match self
                .policy
                .on_chunk_failure(ctx.fault_state_mut(), sequence, &error)
            {
                ChunkFailureAction::RetryChunk { attempt: retry } => {
                    ctx.metrics_mut().retries += 1;
                    let delay = self.policy.backoff_for(retry);
                    tracing::warn!(
                        sequence,
                        stage = %failed_stage,
                        attempt = retry,
                        max_attempts = self.policy.max_retry_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Chunk failed, retrying"
                    );
                    let aborted = tokio::select! {
                        biased;
                        _ = control.aborted() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if aborted {
                        return self.abandon(sequence).await;
                    }
                    attempt = retry + 1;
                },
                ChunkFailureAction::SkipChunk => {
                    return self
                        .roll_back_chunk(ctx, checkpoint, &records, &position, &failed_stage, &error, attempt)
                        .await;
                },
                ChunkFailureAction::AbortJob => {
                    tracing::error!(sequence, stage = %failed_stage, error = %error, "Chunk failure is fatal");
                    ctx.fail(format!("chunk {} failed in {}: {}", sequence, failed_stage, error));
                    return ChunkOutcome::Failed;
                },
            }
        }
    }

    /// Roll back a chunk whose retries are spent; its records become skips
    #[allow(clippy::too_many_arguments)]
    async fn roll_back_chunk(
        &self,
        ctx: &mut JobExecutionContext,
        checkpoint: &mut Checkpoint,
        records: &[Record<P>],
        position: &Cursor,
        failed_stage: &str,
        error: &BatchError,
        attempts: u32,
    ) -> ChunkOutcome {
        let sequence = checkpoint.chunk_sequence + 1;
        self.sinks.rollback(sequence).await;
        ctx.metrics_mut().chunks_rolled_back += 1;
        ctx.fault_state_mut().reset_chunk(sequence);

        let skipped: Vec<SkippedRecord> = records
            .iter()
            .map(|r| SkippedRecord {
                natural_key: r.natural_key.clone(),
                order_key: r.order_key.clone(),
                chunk_sequence: sequence,
                stage: failed_stage.to_string(),
                reason: error.to_string(),
                cause: SkipCause::ChunkRolledBack,
            })
            .collect();
        let count = skipped.len();
        let total = self.record_skips(ctx, skipped);
        tracing::warn!(
            sequence,
            records = count,
            skip_count_total = total,
            error = %error,
            "Chunk rolled back, records skipped"
        );

        if self.policy.exceeds_skip_limit(total) {
            ctx.fail(format!(
                "skip limit {} exceeded ({} skipped)",
                self.policy.skip_limit, total
            ));
            return ChunkOutcome::Failed;
        }

        // Move past the chunk; totals stay at the last committed state
        let next = Checkpoint {
            chunk_sequence: sequence,
            last_order_key: position.after_key.clone(),
            cursor: position.clone(),
            updated_at: Utc::now(),
            ..checkpoint.clone()
        };
        let saved = tokio::time::timeout(
            self.params.commit_timeout,
            self.repository.save_checkpoint(&next),
        )
        .await
        .unwrap_or(Err(BatchError::CommitTimeout(self.params.commit_timeout)));

        if let Err(e) = saved {
            tracing::error!(sequence, error = %e, "Failed to checkpoint rolled-back chunk");
            ctx.fail(format!("checkpoint after rollback of chunk {} failed: {}", sequence, e));
            return ChunkOutcome::Failed;
        }
        *checkpoint = next;
        self.enter_state(ctx, sequence, ChunkState::RolledBack);

        let summary = ChunkSummary {
            sequence,
            state: ChunkState::RolledBack,
            committed: 0,
            skipped: count,
            attempts,
        };
        for listener in &self.listeners {
            listener.after_chunk(ctx, &summary);
        }
        ChunkOutcome::RolledBack
    }

    /// Commit the final group and grand totals; the checkpoint is marked
    /// complete so the next run starts fresh
    async fn commit_trailer(
        &self,
        ctx: &mut JobExecutionContext,
        accumulator: &mut BreakTotalAccumulator,
        checkpoint: &mut Checkpoint,
    ) -> bool {
        let sequence = checkpoint.chunk_sequence + 1;
        let events = accumulator.finish();

        let mut lines = Vec::new();
        if let Some(layout) = self.layout.as_deref() {
            if !checkpoint.header_written {
                lines.extend(self.header_lines(layout));
            }
            lines.extend(events.iter().map(|e| layout.break_line(e)));
        }

        let batch = ChunkBatch {
            job_name: self.params.job_name.clone(),
            execution_id: ctx.execution_id,
            sequence,
            records: Vec::new(),
            lines,
            checkpoint: Checkpoint {
                chunk_sequence: sequence,
                totals: accumulator.state().clone(),
                header_written: true,
                completed: true,
                updated_at: Utc::now(),
                ..checkpoint.clone()
            },
        };

        loop {
            match self.commit(&batch, checkpoint).await {
                Ok(()) => {
                    *checkpoint = batch.checkpoint.clone();
                    self.sinks.notify(&batch).await;
                    tracing::info!(
                        sequence,
                        grand_total = %accumulator.grand_total(),
                        "Final totals committed"
                    );
                    return true;
                },
                Err(e) => {
                    ctx.metrics_mut().errored += 1;
                    for listener in &self.listeners {
                        listener.on_chunk_error(ctx, sequence, &e);
                    }
                    match self.policy.on_chunk_failure(ctx.fault_state_mut(), sequence, &e) {
                        ChunkFailureAction::RetryChunk { attempt } => {
                            ctx.metrics_mut().retries += 1;
                            tracing::warn!(attempt, error = %e, "Final totals commit failed, retrying");
                            tokio::time::sleep(self.policy.backoff_for(attempt)).await;
                        },
                        _ => {
                            tracing::error!(error = %e, "Final totals commit failed");
                            ctx.fail(format!("final totals commit failed: {}", e));
                            return false;
                        },
                    }
                },
            }
        }
    }

    /// Sinks and checkpoint as one unit, bounded by the commit timeout
    ///
    /// When a sink, the checkpoint save or the deadline fails the attempt,
    /// every sink that already committed the chunk is undone, so a failed
    /// attempt leaves no writes behind. Undo data is released once the
    /// checkpoint is durable.
    async fn commit(&self, batch: &ChunkBatch<P>, previous: &Checkpoint) -> BatchResult<()> {
        let timeout = self.params.commit_timeout;
        let write = async {
            self.sinks.write(batch).await?;
            if let Err(e) = self.repository.save_checkpoint(&batch.checkpoint).await {
                tracing::warn!(sequence = batch.sequence, error = %e, "Checkpoint save failed, undoing sinks");
                self.sinks.undo(batch.sequence).await?;
                return Err(e);
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                self.sinks.release(batch.sequence).await;
                Ok(())
            },
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    sequence = batch.sequence,
                    timeout_ms = timeout.as_millis() as u64,
                    "Chunk commit timed out, undoing sinks"
                );
                // The checkpoint may have landed before the deadline
                let restored = tokio::time::timeout(timeout, self.repository.save_checkpoint(previous))
                    .await
                    .unwrap_or(Err(BatchError::CommitTimeout(timeout)));
                if let Err(e) = restored {
                    return Err(BatchError::Unknown(format!(
                        "restoring checkpoint {} after commit timeout failed: {}",
                        previous.chunk_sequence, e
                    )));
                }
                self.sinks.undo(batch.sequence).await?;
                Err(BatchError::CommitTimeout(timeout))
            },
        }
    }

    /// Hard abort: drop the in-flight chunk
    async fn abandon(&self, sequence: u64) -> ChunkOutcome {
        tracing::warn!(sequence, "Abort requested, in-flight chunk rolled back");
        self.sinks.rollback(sequence).await;
        ChunkOutcome::Aborted
    }

    fn header_lines(&self, layout: &dyn ReportLayout<P>) -> Vec<ReportLine> {
        layout
            .header(&self.params.job_name)
            .into_iter()
            .map(|text| ReportLine::new(LineKind::Header, text))
            .collect()
    }

    /// Fold accepted records into the totals and lay out their report lines:
    /// group break, detail, page break
    fn format_chunk(
        &self,
        accumulator: &mut BreakTotalAccumulator,
        records: &[Record<P>],
        with_header: bool,
    ) -> BatchResult<Vec<ReportLine>> {
        let layout = self.layout.as_deref();
        let mut lines = Vec::new();
        if let (true, Some(layout)) = (with_header, layout) {
            lines.extend(self.header_lines(layout));
        }

        for record in records {
            let breaks = accumulator.accept(&record.group_key, record.payload.amount())?;
            if let Some(group) = &breaks.group {
                tracing::trace!(group = ?group.group_key, total = %group.total, "Group break");
            }
            let Some(layout) = layout else {
                continue;
            };
            if let Some(group) = &breaks.group {
                lines.push(layout.break_line(group));
            }
            lines.push(ReportLine::new(LineKind::Detail, layout.detail(record)));
            if let Some(page) = &breaks.page {
                lines.push(layout.break_line(page));
            }
        }
        Ok(lines)
    }

    fn rejections(sequence: u64, rejected: Vec<Rejection>) -> Vec<SkippedRecord> {
        rejected
            .into_iter()
            .map(|r| SkippedRecord {
                natural_key: r.natural_key,
                order_key: r.order_key,
                chunk_sequence: sequence,
                stage: r.stage,
                reason: r.reason,
                cause: SkipCause::Rejected,
            })
            .collect()
    }

    fn record_skips(&self, ctx: &mut JobExecutionContext, skipped: Vec<SkippedRecord>) -> u64 {
        for record in &skipped {
            for listener in &self.listeners {
                listener.on_skip(ctx, record);
            }
        }
        ctx.record_skips(skipped)
    }

    fn enter_state(&self, ctx: &JobExecutionContext, sequence: u64, state: ChunkState) {
        tracing::trace!(sequence, state = ?state, "Chunk state");
        for listener in &self.listeners {
            listener.on_chunk_state(ctx, sequence, state);
        }
    }

    fn set_status(&self, ctx: &mut JobExecutionContext, status: JobStatus) {
        if let Err(e) = ctx.transition(status) {
            tracing::error!(error = %e, "Job status transition rejected");
        }
    }
}

/// Builder for [`BatchJob`]
pub struct BatchJobBuilder<P> {
    params: JobParameters,
    source: Option<Arc<dyn RecordSource<P>>>,
    pipeline: Option<StagePipeline<P>>,
    layout: Option<Arc<dyn ReportLayout<P>>>,
    sinks: SinkSet<P>,
    repository: Option<Arc<dyn JobRepository>>,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl<P> BatchJobBuilder<P>
where
    P: Amounted + Clone + Send + Sync + 'static,
{
    pub fn source(mut self, source: impl RecordSource<P> + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn shared_source(mut self, source: Arc<dyn RecordSource<P>>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn pipeline(mut self, pipeline: StagePipeline<P>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn layout(mut self, layout: impl ReportLayout<P> + 'static) -> Self {
        self.layout = Some(Arc::new(layout));
        self
    }

    /// Sinks commit in the order they are added; a report file named by
    /// `output_target` is committed last
    pub fn sink(mut self, sink: Arc<dyn ChunkSink<P>>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> BatchResult<BatchJob<P>> {
        self.params.validate()?;
        let source = self
            .source
            .ok_or_else(|| BatchError::Config("a record source is required".into()))?;

        let policy = FaultPolicy::new(
            self.params.max_retry_attempts,
            self.params.skip_limit,
            self.params.fault_tolerant,
        )
        .with_retry_backoff(self.params.retry_backoff);

        let mut sinks = self.sinks;
        if let Some(target) = &self.params.output_target {
            sinks.push(Arc::new(FileReportSink::new(target)));
        }

        Ok(BatchJob {
            policy,
            source,
            pipeline: self.pipeline.unwrap_or_else(StagePipeline::empty),
            layout: self.layout,
            sinks,
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(MemoryJobRepository::new())),
            listeners: self.listeners,
            params: self.params,
        })
    }
}
