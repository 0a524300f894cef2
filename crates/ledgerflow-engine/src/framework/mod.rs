//! Generic chunked batch-processing framework
//!
//! Reads ordered records, runs them through validate/transform stages,
//! accumulates control-break totals and persists results in chunked,
//! fault-tolerant transactions with restart checkpoints. Payload types,
//! stages, layouts and sinks are pluggable; the engine knows only keys and
//! amounts.

pub mod types;
pub mod accumulator;
pub mod fault;
pub mod control;
pub mod source;
pub mod stage;
pub mod lookup;
pub mod ledger;
pub mod layout;
pub mod sink;
pub mod repository;
pub mod context;
pub mod listener;
pub mod report;
pub mod coordinator;
pub mod partition;
#[cfg(feature = "database")]
pub mod postgres;

// Re-export commonly used types
pub use types::{
    Amounted, Checkpoint, ChunkBatch, ChunkState, Cursor, JobParameters, JobStatus, KeyRange,
    LineKind, ProcessingResult, Record, ReportLine, SkipCause, SkippedRecord,
};
pub use accumulator::{AccumulatorState, BreakEvent, BreakLevel, BreakTotalAccumulator, Breaks};
pub use fault::{ChunkFailureAction, Disposition, FaultPolicy, FaultState};
pub use control::JobControl;
pub use source::{JsonLinesSource, Page, PageRequest, RecordSource, SourceIterator, VecSource};
pub use stage::{
    FnStage, PipelineOutcome, Rejection, Stage, StageKind, StagePipeline, StagePipelineBuilder,
};
pub use lookup::{CrossReference, EnrichmentStage, MapLookup};
pub use ledger::LedgerEntry;
pub use layout::{ColumnWidths, FixedWidthLayout, ReportLayout};
pub use sink::{
    ChunkSink, FileReportSink, MemoryReport, MemoryStore, SinkSet, TracingSink, UpsertOutcome,
    WriteCounters,
};
pub use repository::{ExecutionRecord, JobRepository, MemoryJobRepository};
pub use context::{ExecutionMetrics, JobExecutionContext};
pub use listener::{ChunkSummary, JobListener, LoggingListener};
pub use report::JobReport;
pub use coordinator::{BatchJob, BatchJobBuilder};
pub use partition::{partition_by_group, run_partitioned, PartitionedReport};
#[cfg(feature = "database")]
pub use postgres::{PgConfig, PgJobRepository, PgReportSink, PgUpsertSink};
