//! End-to-end tests for chunked job execution
//!
//! Coverage includes:
//! - Control-break reports (group, page and grand totals)
//! - Record accounting and the skip budget
//! - Retry, chunk rollback, commit timeouts and fatal failures
//! - Undo of partially committed chunks
//! - Restart from checkpoint after a crash, graceful stop and hard abort
//! - Run lock

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgerflow_common::Money;
use ledgerflow_engine::error::{BatchError, BatchResult};
use ledgerflow_engine::framework::ledger::{amount_limit, structural_validation};
use ledgerflow_engine::framework::{
    BatchJob, ChunkBatch, ChunkSink, ChunkState, ColumnWidths, Cursor, FixedWidthLayout, JobControl,
    JobRepository, JobStatus, LedgerEntry, LineKind, MemoryJobRepository, MemoryReport,
    MemoryStore, Page, PageRequest, Record, RecordSource, SkipCause, StagePipeline, TracingSink,
    VecSource,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

mod common;

use common::*;

fn layout() -> FixedWidthLayout<LedgerEntry> {
    FixedWidthLayout::new("TRANSACTION REPORT", ColumnWidths::default())
        .with_description(|e: &LedgerEntry| e.description.clone())
}

fn validating_pipeline(limit: &str) -> StagePipeline<LedgerEntry> {
    StagePipeline::builder()
        .stage(structural_validation())
        .stage(amount_limit(limit.parse().unwrap()))
        .build()
        .unwrap()
}

// ============================================================================
// Control-break reports
// ============================================================================

#[tokio::test]
async fn test_group_break_before_first_record_of_next_group() {
    let records = ledger(&[
        ("T1", "A", "10.00"),
        ("T2", "A", "-5.00"),
        ("T3", "A", "20.00"),
        ("T4", "B", "7.50"),
    ]);
    let report_sink = Arc::new(MemoryReport::new("report"));
    let job = BatchJob::builder(params("statement", 2, 10))
        .source(VecSource::new(records))
        .layout(layout())
        .sink(report_sink.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.committed, 4);
    assert_eq!(report.grand_total.as_decimal(), dec!(32.50));

    let lines = report_sink.lines().await;
    assert_eq!(
        kinds(&lines),
        [
            LineKind::Header,
            LineKind::Header,
            LineKind::Header,
            LineKind::Detail,
            LineKind::Detail,
            LineKind::Detail,
            LineKind::GroupTotal,
            LineKind::Detail,
            LineKind::GroupTotal,
            LineKind::GrandTotal,
        ]
    );

    // Group A closes right before the B detail line
    assert!(lines[6].text.starts_with("GROUP TOTAL A"));
    assert_eq!(trailing_amount(&lines[6]).as_decimal(), dec!(25.00));
    assert!(lines[7].text.starts_with("T4"));
    assert_eq!(trailing_amount(&lines[8]).as_decimal(), dec!(7.50));
    assert_eq!(trailing_amount(&lines[9]).as_decimal(), dec!(32.50));
    assert!(!lines.iter().any(|l| l.kind == LineKind::PageTotal));
}

#[tokio::test]
async fn test_single_page_break_then_group_and_grand_at_end() {
    let records = numbered("ACC1", 25);
    let expected = sum(&records);
    let report_sink = Arc::new(MemoryReport::new("report"));
    let job = BatchJob::builder(params("statement", 10, 20))
        .source(VecSource::new(records))
        .layout(layout())
        .sink(report_sink.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.grand_total, expected);

    let lines = report_sink.lines().await;
    let details: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.kind == LineKind::Detail)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(details.len(), 25);

    let pages: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.kind == LineKind::PageTotal)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(pages, [details[19] + 1]);
    assert!(lines[pages[0]].text.starts_with("PAGE 1 TOTAL"));
    // 1.01 + 2.02 + ... + 20.20
    assert_eq!(trailing_amount(&lines[pages[0]]).as_decimal(), dec!(212.10));

    let groups: Vec<_> = lines.iter().filter(|l| l.kind == LineKind::GroupTotal).collect();
    assert_eq!(groups.len(), 1);
    assert_eq!(trailing_amount(groups[0]), expected);

    let last = lines.last().unwrap();
    assert_eq!(last.kind, LineKind::GrandTotal);
    assert_eq!(trailing_amount(last), expected);
    assert_eq!(expected.as_decimal(), dec!(328.25));
}

#[tokio::test]
async fn test_empty_source_still_writes_header_and_zero_totals() {
    let report_sink = Arc::new(MemoryReport::new("report"));
    let job = BatchJob::builder(params("statement", 10, 20))
        .source(VecSource::<LedgerEntry>::new(Vec::new()))
        .layout(layout())
        .sink(report_sink.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.records_read, 0);
    assert!(report.grand_total.is_zero());

    let lines = report_sink.lines().await;
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[4].kind, LineKind::GrandTotal);
    assert!(trailing_amount(&lines[4]).is_zero());
}

// ============================================================================
// Accounting and skip budget
// ============================================================================

#[tokio::test]
async fn test_every_read_record_is_committed_or_skipped() {
    let records = ledger(&[
        ("T01", "A", "10.00"),
        ("T02", "A", "900.00"),
        ("T03", "A", "-20.00"),
        ("T04", "B", "5.55"),
        ("T05", "B", "-750.00"),
        ("T06", "C", "1.10"),
        ("T07", "C", "99.99"),
    ]);
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let listener = Arc::new(RecordingListener::new());
    let job = BatchJob::builder(params("ledger", 3, 60))
        .source(VecSource::new(records))
        .pipeline(validating_pipeline("500.00"))
        .sink(store.clone())
        .sink(Arc::new(TracingSink::new()))
        .listener(listener.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::CompletedWithSkips);
    assert_eq!(report.records_read, 7);
    assert_eq!(report.committed, 5);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.discarded(), 0);
    assert_eq!(report.stage_errors.get("amount_limit"), Some(&2));

    let skipped: Vec<&str> = report
        .skipped_records
        .iter()
        .map(|s| s.natural_key.as_str())
        .collect();
    assert_eq!(skipped, ["T02", "T05"]);
    assert!(report
        .skipped_records
        .iter()
        .all(|s| s.cause == SkipCause::Rejected));

    assert_eq!(store.len().await, 5);
    assert!(store.get("T02").await.is_none());
    assert_eq!(report.grand_total.as_decimal(), dec!(96.64));

    let events = listener.events();
    assert!(events.contains(&"skip:T02".to_string()));
    assert_eq!(events.first().map(String::as_str), Some("before_job"));
    assert_eq!(
        events.last().map(String::as_str),
        Some("after_job:COMPLETED_WITH_SKIPS")
    );
}

#[tokio::test]
async fn test_job_fails_only_when_skips_exceed_limit() {
    let rows = [
        ("T01", "A", "1.00"),
        ("T02", "A", "1000.00"),
        ("T03", "A", "2000.00"),
        ("T04", "B", "3000.00"),
        ("T05", "B", "4.00"),
    ];

    for (limit, expected) in [
        (3, JobStatus::CompletedWithSkips),
        (4, JobStatus::CompletedWithSkips),
        (2, JobStatus::Failed),
        (0, JobStatus::Failed),
    ] {
        let job = BatchJob::builder(params("limits", 2, 60).with_skip_limit(limit))
            .source(VecSource::new(ledger(&rows)))
            .pipeline(validating_pipeline("100.00"))
            .build()
            .unwrap();

        let report = job.run(&JobControl::new()).await.unwrap();
        assert_eq!(report.status, expected, "skip_limit = {}", limit);
        if expected == JobStatus::Failed {
            assert!(report.skipped > limit);
            assert!(report.failure.unwrap().contains("skip limit"));
        } else {
            assert_eq!(report.skipped, 3);
        }
    }
}

#[tokio::test]
async fn test_not_fault_tolerant_fails_on_first_rejection() {
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let job = BatchJob::builder(params("strict", 2, 60).with_fault_tolerant(false))
        .source(VecSource::new(ledger(&[
            ("T01", "A", "1.00"),
            ("T02", "A", "2.00"),
            ("T03", "A", "5000.00"),
            ("T04", "A", "3.00"),
        ])))
        .pipeline(validating_pipeline("100.00"))
        .sink(store.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.committed, 2);
    assert_eq!(store.len().await, 2);
    assert!(report.failure.as_ref().unwrap().contains("T03"));
    // The failed chunk never committed, so its accepted record is discarded
    assert_eq!(report.discarded(), 1);
}

#[tokio::test]
async fn test_out_of_order_source_fails_job() {
    struct Unsorted(Vec<Record<LedgerEntry>>);

    #[async_trait]
    impl RecordSource<LedgerEntry> for Unsorted {
        async fn fetch_page(&self, request: &PageRequest) -> BatchResult<Page<LedgerEntry>> {
            let start = request.cursor.offset as usize;
            let records: Vec<_> = self.0.iter().skip(start).cloned().collect();
            let mut next = request.cursor.clone();
            next.offset += records.len() as u64;
            Ok(Page {
                records,
                next_cursor: next,
                has_more: false,
            })
        }
    }

    let job = BatchJob::builder(params("unsorted", 10, 60))
        .source(Unsorted(ledger(&[("T02", "A", "1.00"), ("T01", "A", "2.00")])))
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.committed, 0);
    assert!(report.failure.unwrap().contains("T01"));
}

#[tokio::test]
async fn test_source_failure_after_first_chunk_keeps_its_checkpoint() {
    /// Serves the first page, then the feed is gone for good
    struct ClosesAfterFirstPage(Vec<Record<LedgerEntry>>);

    #[async_trait]
    impl RecordSource<LedgerEntry> for ClosesAfterFirstPage {
        async fn fetch_page(&self, request: &PageRequest) -> BatchResult<Page<LedgerEntry>> {
            if request.cursor.offset > 0 {
                return Err(BatchError::SourceUnavailable("statement feed closed".into()));
            }
            let records: Vec<_> = self.0.iter().take(request.limit).cloned().collect();
            Ok(Page {
                next_cursor: Cursor {
                    offset: records.len() as u64,
                    after_key: records.last().map(|r| r.order_key.clone()),
                },
                records,
                has_more: true,
            })
        }
    }

    let repository = Arc::new(MemoryJobRepository::new());
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let job = BatchJob::builder(params("feed", 2, 60))
        .source(ClosesAfterFirstPage(numbered("A", 4)))
        .sink(store.clone())
        .repository(repository.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.records_read, 2);
    assert_eq!(report.committed, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.retries, 0);
    assert!(report.failure.unwrap().contains("statement feed closed"));

    let checkpoint = repository.checkpoint("feed").await.unwrap();
    assert_eq!(checkpoint.chunk_sequence, 1);
    assert_eq!(checkpoint.committed_records, 2);
    assert_eq!(checkpoint.last_order_key, Some(numbered("A", 2)[1].order_key.clone()));
    assert!(!checkpoint.completed);
    assert_eq!(store.keys().await, ["A-T0001", "A-T0002"]);
}

#[tokio::test]
async fn test_total_overflow_fails_job_without_commit() {
    let huge = "40000000000000000000000000000";
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let job = BatchJob::builder(params("overflow", 2, 60))
        .source(VecSource::new(ledger(&[("T1", "A", huge), ("T2", "A", huge)])))
        .sink(store.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.committed, 0);
    assert_eq!(report.skipped, 0);
    assert!(report.grand_total.is_zero());
    assert!(report.failure.unwrap().contains("overflow"));
    assert!(store.is_empty().await);
}

// ============================================================================
// Retry and rollback
// ============================================================================

#[tokio::test]
async fn test_transient_commit_failure_is_retried() {
    let records = numbered("A", 6);
    let expected = sum(&records);
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let failing = Arc::new(FailingSink::new(Phase::Commit, transient).fail(2, 2));
    let listener = Arc::new(RecordingListener::new());
    let job = BatchJob::builder(params("retry", 2, 60).with_max_retry_attempts(3))
        .source(VecSource::new(records))
        .sink(store.clone())
        .sink(failing.clone())
        .listener(listener.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.committed, 6);
    assert_eq!(report.retries, 2);
    assert_eq!(report.errored, 2);
    assert_eq!(report.grand_total, expected);
    assert_eq!(failing.failures(), 2);

    // Failed attempts of chunk 2 were undone in the store
    let counters = store.counters().await;
    assert_eq!(counters.inserted, 6);
    assert_eq!(counters.updated, 0);
    assert_eq!(counters.unchanged, 0);

    let events = listener.events();
    for attempt in 1..=3 {
        assert!(events.contains(&format!("before_chunk:2:{}", attempt)));
    }
    assert!(!events.contains(&"before_chunk:2:4".to_string()));

    use ChunkState::*;
    assert_eq!(listener.states_of(1), [Collecting, Committing, Committed]);
    assert_eq!(
        listener.states_of(2),
        [Collecting, Committing, Collecting, Committing, Collecting, Committing, Committed]
    );
}

#[tokio::test]
async fn test_chunk_rolled_back_after_commit_failure_leaves_earlier_sinks_clean() {
    let records = numbered("A", 6);
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let report_sink = Arc::new(MemoryReport::new("report"));
    let failing = Arc::new(FailingSink::new(Phase::Commit, transient).fail(2, 10));
    let listener = Arc::new(RecordingListener::new());
    let job = BatchJob::builder(
        params("undo", 2, 60)
            .with_max_retry_attempts(1)
            .with_skip_limit(5),
    )
    .source(VecSource::new(records))
    .layout(layout())
    .sink(store.clone())
    .sink(report_sink.clone())
    .sink(failing.clone())
    .listener(listener.clone())
    .build()
    .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::CompletedWithSkips);
    assert_eq!(report.chunks_rolled_back, 1);
    assert_eq!(report.retries, 1);
    assert_eq!(report.committed, 4);
    assert_eq!(report.skipped, 2);
    assert_eq!(failing.failures(), 2);

    // Chunk 2 reached the store and report on both attempts and was undone
    assert_eq!(store.len().await, report.committed as usize);
    assert_eq!(store.keys().await, ["A-T0001", "A-T0002", "A-T0005", "A-T0006"]);
    assert_eq!(store.counters().await.inserted, 4);

    let lines = report_sink.lines().await;
    let details: Vec<&str> = lines
        .iter()
        .filter(|l| l.kind == LineKind::Detail)
        .map(|l| l.text.as_str())
        .collect();
    assert_eq!(details.len(), 4);
    assert!(!details.iter().any(|d| d.starts_with("A-T0003") || d.starts_with("A-T0004")));
    assert_eq!(trailing_amount(lines.last().unwrap()).as_decimal(), dec!(14.14));

    use ChunkState::*;
    assert_eq!(
        listener.states_of(2),
        [Collecting, Committing, Collecting, Committing, RolledBack]
    );
}

/// Sink whose first commit outlasts the commit timeout
struct SlowFirstCommit {
    delay: Duration,
    commits: AtomicU32,
}

#[async_trait]
impl ChunkSink<LedgerEntry> for SlowFirstCommit {
    fn name(&self) -> &str {
        "slow"
    }

    async fn stage(&self, _batch: &ChunkBatch<LedgerEntry>) -> BatchResult<()> {
        Ok(())
    }

    async fn commit(&self, _sequence: u64) -> BatchResult<()> {
        if self.commits.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    async fn rollback(&self, _sequence: u64) -> BatchResult<()> {
        Ok(())
    }

    async fn undo(&self, _sequence: u64) -> BatchResult<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_commit_timeout_is_retried_and_undone() {
    let records = numbered("A", 4);
    let expected = sum(&records);
    let repository = Arc::new(MemoryJobRepository::new());
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let slow = Arc::new(SlowFirstCommit {
        delay: Duration::from_secs(60),
        commits: AtomicU32::new(0),
    });
    let listener = Arc::new(RecordingListener::new());
    let job = BatchJob::builder(
        params("timeout", 2, 60)
            .with_commit_timeout(Duration::from_millis(50))
            .with_max_retry_attempts(2),
    )
    .source(VecSource::new(records))
    .sink(store.clone())
    .sink(slow.clone())
    .repository(repository.clone())
    .listener(listener.clone())
    .build()
    .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.retries, 1);
    assert_eq!(report.errored, 1);
    assert_eq!(report.committed, 4);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.grand_total, expected);

    // The timed-out attempt of chunk 1 left nothing behind
    assert_eq!(store.len().await, 4);
    assert_eq!(store.counters().await.inserted, 4);
    assert!(listener.events().contains(&"before_chunk:1:2".to_string()));
    assert_eq!(
        listener.states_of(1),
        [
            ChunkState::Collecting,
            ChunkState::Committing,
            ChunkState::Collecting,
            ChunkState::Committing,
            ChunkState::Committed
        ]
    );
    assert!(repository.checkpoint("timeout").await.unwrap().completed);
}

#[tokio::test]
async fn test_exhausted_retries_roll_back_chunk_as_skips() {
    let records = numbered("A", 6);
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let failing = Arc::new(FailingSink::new(Phase::Stage, transient).fail(2, 10));
    let job = BatchJob::builder(
        params("rollback", 2, 60)
            .with_max_retry_attempts(2)
            .with_skip_limit(5),
    )
    .source(VecSource::new(records))
    .sink(failing.clone())
    .sink(store.clone())
    .build()
    .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::CompletedWithSkips);
    assert_eq!(report.chunks_rolled_back, 1);
    assert_eq!(report.retries, 2);
    assert_eq!(report.committed, 4);
    assert_eq!(report.skipped, 2);
    assert_eq!(failing.failures(), 3);
    assert!(report
        .skipped_records
        .iter()
        .all(|s| s.cause == SkipCause::ChunkRolledBack && s.chunk_sequence == 2));

    assert_eq!(store.keys().await, ["A-T0001", "A-T0002", "A-T0005", "A-T0006"]);
    // 1.01 + 2.02 + 5.05 + 6.06
    assert_eq!(report.grand_total.as_decimal(), dec!(14.14));
}

#[tokio::test]
async fn test_rolled_back_chunk_counts_against_skip_limit() {
    let failing = Arc::new(FailingSink::new(Phase::Stage, transient).fail(1, 10));
    let job = BatchJob::builder(
        params("rollback-limit", 3, 60)
            .with_max_retry_attempts(1)
            .with_skip_limit(2),
    )
    .source(VecSource::new(numbered("A", 6)))
    .sink(failing)
    .build()
    .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.committed, 0);
}

#[tokio::test]
async fn test_unknown_commit_error_fails_without_retry() {
    let failing = Arc::new(FailingSink::new(Phase::Commit, crash).fail(1, 1));
    let job = BatchJob::builder(params("fatal", 5, 60).with_max_retry_attempts(3))
        .source(VecSource::new(numbered("A", 3)))
        .sink(failing.clone())
        .build()
        .unwrap();

    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.retries, 0);
    assert_eq!(failing.failures(), 1);
    assert!(report.grand_total.is_zero());
}

// ============================================================================
// Restart, stop and abort
// ============================================================================

#[tokio::test]
async fn test_restart_after_crash_matches_clean_run() {
    init_tracing();
    let records = numbered("A", 5)
        .into_iter()
        .chain(numbered("B", 5))
        .collect::<Vec<_>>();

    // Reference run
    let clean_store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let clean_report = Arc::new(MemoryReport::new("report"));
    let clean = BatchJob::builder(params("restart", 3, 4))
        .source(VecSource::new(records.clone()))
        .layout(layout())
        .sink(clean_store.clone())
        .sink(clean_report.clone())
        .build()
        .unwrap();
    let clean = clean.run(&JobControl::new()).await.unwrap();
    assert_eq!(clean.status, JobStatus::Completed);

    // Crash while committing chunk 3, after the store and report took it
    let repository = Arc::new(MemoryJobRepository::new());
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let report_sink = Arc::new(MemoryReport::new("report"));
    let crashing = BatchJob::builder(params("restart", 3, 4))
        .source(VecSource::new(records.clone()))
        .layout(layout())
        .sink(store.clone())
        .sink(report_sink.clone())
        .sink(Arc::new(FailingSink::new(Phase::Commit, crash).fail(3, 1)))
        .repository(repository.clone())
        .build()
        .unwrap();
    let first = crashing.run(&JobControl::new()).await.unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(first.committed, 6);
    assert_eq!(store.len().await, 6);

    let checkpoint = repository.checkpoint("restart").await.unwrap();
    assert_eq!(checkpoint.chunk_sequence, 2);
    assert!(!checkpoint.completed);
    assert!(!repository.is_locked("restart").await);

    let restarted = BatchJob::builder(params("restart", 3, 4))
        .source(VecSource::new(records))
        .layout(layout())
        .sink(store.clone())
        .sink(report_sink.clone())
        .repository(repository.clone())
        .build()
        .unwrap();
    let second = restarted.run(&JobControl::new()).await.unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.resumed_from, Some(2));
    assert_eq!(second.records_read, 4);
    assert_eq!(second.committed, 4);
    assert_eq!(second.grand_total, clean.grand_total);

    // Chunk 3 was undone by the crash and written once on restart
    assert_eq!(store.digest().await.unwrap(), clean_store.digest().await.unwrap());
    let counters = store.counters().await;
    assert_eq!(counters.inserted, 10);
    assert_eq!(counters.unchanged, 0);
    assert_eq!(report_sink.text().await, clean_report.text().await);

    let executions = repository.executions("restart").await;
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, JobStatus::Failed);
    assert_eq!(executions[1].status, JobStatus::Completed);

    // A completed checkpoint makes the next run start from scratch
    assert!(repository.checkpoint("restart").await.unwrap().completed);
}

#[tokio::test]
async fn test_graceful_stop_then_resume() {
    let records = numbered("A", 9);
    let repository = Arc::new(MemoryJobRepository::new());
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));

    let control = JobControl::new();
    let job = BatchJob::builder(params("stoppable", 3, 60))
        .source(VecSource::new(records.clone()))
        .sink(store.clone())
        .repository(repository.clone())
        .listener(Arc::new(RecordingListener::stopping_after(1, control.clone())))
        .build()
        .unwrap();

    let report = job.run(&control).await.unwrap();
    assert_eq!(report.status, JobStatus::Stopped);
    assert_eq!(report.committed, 3);
    assert_eq!(report.records_read, 3);
    assert_eq!(repository.checkpoint("stoppable").await.unwrap().chunk_sequence, 1);

    let job = BatchJob::builder(params("stoppable", 3, 60))
        .source(VecSource::new(records.clone()))
        .sink(store.clone())
        .repository(repository.clone())
        .build()
        .unwrap();
    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.resumed_from, Some(1));
    assert_eq!(report.committed, 6);
    assert_eq!(report.grand_total, sum(&records));
    assert_eq!(store.len().await, 9);
}

#[tokio::test]
async fn test_abort_drops_in_flight_chunk() {
    let repository = Arc::new(MemoryJobRepository::new());
    let store = Arc::new(MemoryStore::<LedgerEntry>::new("ledger"));
    let control = JobControl::new();
    let job = BatchJob::builder(params("abortable", 3, 60))
        .source(VecSource::new(numbered("A", 9)))
        .sink(store.clone())
        .repository(repository.clone())
        .listener(Arc::new(RecordingListener::aborting_at(2, control.clone())))
        .build()
        .unwrap();

    let report = job.run(&control).await.unwrap();
    assert_eq!(report.status, JobStatus::Stopped);
    assert_eq!(report.records_read, 6);
    assert_eq!(report.committed, 3);
    assert_eq!(report.discarded(), 3);
    assert_eq!(store.len().await, 3);
    assert_eq!(repository.checkpoint("abortable").await.unwrap().chunk_sequence, 1);
    assert_eq!(report.grand_total, Money::from_cents(101 + 202 + 303));
}

// ============================================================================
// Run lock
// ============================================================================

#[tokio::test]
async fn test_second_execution_is_rejected_while_locked() {
    let repository = Arc::new(MemoryJobRepository::new());
    let holder = Uuid::new_v4();
    repository.acquire_lock("locked", holder).await.unwrap();

    let job = BatchJob::builder(params("locked", 3, 60))
        .source(VecSource::new(numbered("A", 3)))
        .repository(repository.clone())
        .build()
        .unwrap();

    let err = job.run(&JobControl::new()).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::AlreadyRunning { holder: h, .. } if h == holder
    ));
    assert!(repository.checkpoint("locked").await.is_none());

    repository.release_lock("locked", holder).await.unwrap();
    let report = job.run(&JobControl::new()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_builder_requires_source_and_valid_parameters() {
    let missing = BatchJob::<LedgerEntry>::builder(params("no-source", 3, 60)).build();
    assert!(matches!(missing, Err(BatchError::Config(_))));

    let invalid = BatchJob::builder(params("bad", 0, 60))
        .source(VecSource::new(numbered("A", 1)))
        .build();
    assert!(matches!(invalid, Err(BatchError::Config(_))));
}
