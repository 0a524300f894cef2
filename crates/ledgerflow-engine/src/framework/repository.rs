//! Job repository: run lock, checkpoints and execution history

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::context::ExecutionMetrics;
use super::types::{Checkpoint, JobStatus};
use crate::error::{BatchError, BatchResult};

/// Persisted summary of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metrics: ExecutionMetrics,
    pub failure: Option<String>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Claim the run lock for `job_name`; fails with `AlreadyRunning` when
    /// another execution holds it
    async fn acquire_lock(&self, job_name: &str, execution_id: Uuid) -> BatchResult<()>;

    async fn release_lock(&self, job_name: &str, execution_id: Uuid) -> BatchResult<()>;

    async fn load_checkpoint(&self, job_name: &str) -> BatchResult<Option<Checkpoint>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BatchResult<()>;

    async fn save_execution(&self, record: &ExecutionRecord) -> BatchResult<()>;
}

#[derive(Debug, Default)]
struct RepositoryState {
    locks: HashMap<String, Uuid>,
    checkpoints: HashMap<String, Checkpoint>,
    executions: Vec<ExecutionRecord>,
    checkpoint_saves: u64,
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    state: Mutex<RepositoryState>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn checkpoint(&self, job_name: &str) -> Option<Checkpoint> {
        self.state.lock().await.checkpoints.get(job_name).cloned()
    }

    pub async fn executions(&self, job_name: &str) -> Vec<ExecutionRecord> {
        self.state
            .lock()
            .await
            .executions
            .iter()
            .filter(|e| e.job_name == job_name)
            .cloned()
            .collect()
    }

    pub async fn is_locked(&self, job_name: &str) -> bool {
        self.state.lock().await.locks.contains_key(job_name)
    }

    pub async fn checkpoint_saves(&self) -> u64 {
        self.state.lock().await.checkpoint_saves
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn acquire_lock(&self, job_name: &str, execution_id: Uuid) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        match state.locks.get(job_name) {
            Some(holder) if *holder != execution_id => Err(BatchError::AlreadyRunning {
                job_name: job_name.to_string(),
                holder: *holder,
            }),
            _ => {
                state.locks.insert(job_name.to_string(), execution_id);
                Ok(())
            },
        }
    }

    async fn release_lock(&self, job_name: &str, execution_id: Uuid) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        if state.locks.get(job_name) == Some(&execution_id) {
            state.locks.remove(job_name);
        }
        Ok(())
    }

    async fn load_checkpoint(&self, job_name: &str) -> BatchResult<Option<Checkpoint>> {
        Ok(self.checkpoint(job_name).await)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        state
            .checkpoints
            .insert(checkpoint.job_name.clone(), checkpoint.clone());
        state.checkpoint_saves += 1;
        Ok(())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        state.executions.retain(|e| e.execution_id != record.execution_id);
        state.executions.push(record.clone());
        Ok(())
    }
}
