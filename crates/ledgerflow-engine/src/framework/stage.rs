//! Stage pipeline
//!
//! An ordered list of validate/transform stages. Each stage turns a record
//! into a [`ProcessingResult`]; anything other than `Accepted` stops the
//! remaining stages for that record. Stages are registered in canonical
//! order: structural validation, business rules, cross-reference
//! enrichment, derived fields.
//!
//! A chunk runs stage by stage: every stage first sees the surviving records
//! of the chunk through [`Stage::prepare_chunk`] (batched lookups happen
//! there), then processes them one at a time in order key order.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{ProcessingResult, Record};
use crate::error::{BatchError, BatchResult};

/// Position of a stage in the canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Structural,
    BusinessRule,
    Enrichment,
    Derivation,
}

/// One validate/transform step
#[async_trait]
pub trait Stage<P>: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Called once per chunk attempt, before `process`, with the records
    /// that reached this stage
    async fn prepare_chunk(&self, _records: &[Record<P>]) -> BatchResult<()> {
        Ok(())
    }

    async fn process(&self, record: Record<P>) -> ProcessingResult<P>;
}

/// A record a stage turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub natural_key: String,
    pub order_key: String,
    pub stage: String,
    pub reason: String,
}

/// Result of running one chunk through the pipeline
#[derive(Debug)]
pub enum PipelineOutcome<P> {
    /// Every record reached a verdict; `accepted` keeps order key order
    Completed {
        accepted: Vec<Record<P>>,
        rejected: Vec<Rejection>,
    },
    /// A stage asked for the chunk to be retried
    Retry { stage: String, error: BatchError },
    /// A stage hit an unrecoverable error
    Fatal { stage: String, error: BatchError },
}

pub struct StagePipeline<P> {
    stages: Vec<Arc<dyn Stage<P>>>,
}

impl<P> Clone for StagePipeline<P> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> StagePipeline<P> {
    pub fn builder() -> StagePipelineBuilder<P> {
        StagePipelineBuilder { stages: Vec::new() }
    }

    /// Pipeline that accepts everything unchanged
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a single record through every stage, short-circuiting
    ///
    /// Returns the verdict and the name of the stage that produced it
    /// (`None` when the record made it through all stages).
    pub async fn process_record(&self, record: Record<P>) -> (ProcessingResult<P>, Option<String>) {
        let mut current = record;
        for stage in &self.stages {
            match stage.process(current).await {
                ProcessingResult::Accepted(next) => current = next,
                other => return (other, Some(stage.name().to_string())),
            }
        }
        (ProcessingResult::Accepted(current), None)
    }

    /// Run a whole chunk, stage by stage
    pub async fn process_chunk(&self, records: Vec<Record<P>>) -> PipelineOutcome<P> {
        let mut surviving = records;
        let mut rejected = Vec::new();

        for stage in &self.stages {
            if surviving.is_empty() {
                break;
            }

            if let Err(error) = stage.prepare_chunk(&surviving).await {
                let stage = stage.name().to_string();
                return if error.is_transient() {
                    PipelineOutcome::Retry { stage, error }
                } else {
                    PipelineOutcome::Fatal { stage, error }
                };
            }

            let mut next = Vec::with_capacity(surviving.len());
            for record in surviving {
                let natural_key = record.natural_key.clone();
                let order_key = record.order_key.clone();
                match stage.process(record).await {
                    ProcessingResult::Accepted(r) => next.push(r),
                    ProcessingResult::Skipped(reason) => {
                        tracing::debug!(
                            stage = stage.name(),
                            natural_key = %natural_key,
                            reason = %reason,
                            "Record rejected"
                        );
                        rejected.push(Rejection {
                            natural_key,
                            order_key,
                            stage: stage.name().to_string(),
                            reason,
                        });
                    },
                    ProcessingResult::Retryable(error) => {
                        return PipelineOutcome::Retry {
                            stage: stage.name().to_string(),
                            error,
                        };
                    },
                    ProcessingResult::Fatal(error) => {
                        return PipelineOutcome::Fatal {
                            stage: stage.name().to_string(),
                            error,
                        };
                    },
                }
            }
            surviving = next;
        }

        PipelineOutcome::Completed {
            accepted: surviving,
            rejected,
        }
    }
}

pub struct StagePipelineBuilder<P> {
    stages: Vec<Arc<dyn Stage<P>>>,
}

impl<P: Send + Sync + 'static> StagePipelineBuilder<P> {
    pub fn stage(mut self, stage: impl Stage<P> + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn shared_stage(mut self, stage: Arc<dyn Stage<P>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Fails when stages were registered out of canonical order
    pub fn build(self) -> BatchResult<StagePipeline<P>> {
        for pair in self.stages.windows(2) {
            if pair[1].kind() < pair[0].kind() {
                return Err(BatchError::Config(format!(
                    "stage '{}' ({:?}) cannot run after '{}' ({:?})",
                    pair[1].name(),
                    pair[1].kind(),
                    pair[0].name(),
                    pair[0].kind()
                )));
            }
        }
        Ok(StagePipeline {
            stages: self.stages,
        })
    }
}

/// Stage backed by a plain function
pub struct FnStage<P, F> {
    name: String,
    kind: StageKind,
    f: F,
    _payload: PhantomData<fn(P) -> P>,
}

impl<P, F> FnStage<P, F>
where
    F: Fn(Record<P>) -> ProcessingResult<P> + Send + Sync,
{
    pub fn new(name: impl Into<String>, kind: StageKind, f: F) -> Self {
        Self {
            name: name.into(),
            kind,
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P, F> Stage<P> for FnStage<P, F>
where
    P: Send + Sync + 'static,
    F: Fn(Record<P>) -> ProcessingResult<P> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn process(&self, record: Record<P>) -> ProcessingResult<P> {
        (self.f)(record)
    }
}
