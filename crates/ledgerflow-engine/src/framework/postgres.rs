//! PostgreSQL job repository and sinks
//!
//! Schema lives in `migrations/`. Checkpoints, executions and sink rows are
//! stored per job name, so partition jobs sharing one database never touch
//! each other's rows.
//!
//! Each sink commits a chunk in its own transaction and reads the rows it
//! is about to replace inside that transaction. Those pre-images are kept
//! until the chunk's checkpoint is saved, so a chunk can still be undone
//! when a later sink or the checkpoint save fails.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tokio::sync::Mutex;
use uuid::Uuid;

use ledgerflow_common::checksum::content_digest;

use super::repository::{ExecutionRecord, JobRepository};
use super::sink::ChunkSink;
use super::types::{ChunkBatch, Checkpoint, ReportLine};
use crate::error::{BatchError, BatchResult};

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

// ============================================================================
// Pool
// ============================================================================

/// Default maximum connections in the pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Default minimum connections in the pool.
pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;

/// Default acquire timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl PgConfig {
    pub fn from_env() -> BatchResult<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("DATABASE_URL")
            .map_err(|_| BatchError::Config("DATABASE_URL not set".to_string()))?;

        Ok(Self {
            url,
            max_connections: std::env::var("LEDGERFLOW_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            min_connections: std::env::var("LEDGERFLOW_DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_MIN_CONNECTIONS),
            connect_timeout_secs: std::env::var("LEDGERFLOW_DB_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS),
        })
    }
}

/// Connect and run pending migrations
pub async fn create_pool(config: &PgConfig) -> BatchResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;

    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| BatchError::Config(format!("migrations failed: {}", e)))?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );
    Ok(pool)
}

// ============================================================================
// Job repository
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn acquire_lock(&self, job_name: &str, execution_id: Uuid) -> BatchResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_job_locks (job_name, execution_id, acquired_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (job_name) DO NOTHING
            "#,
        )
        .bind(job_name)
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(());
        }

        let holder: Uuid =
            sqlx::query_scalar("SELECT execution_id FROM batch_job_locks WHERE job_name = $1")
                .bind(job_name)
                .fetch_one(&self.pool)
                .await?;

        if holder == execution_id {
            Ok(())
        } else {
            Err(BatchError::AlreadyRunning {
                job_name: job_name.to_string(),
                holder,
            })
        }
    }

    async fn release_lock(&self, job_name: &str, execution_id: Uuid) -> BatchResult<()> {
        sqlx::query("DELETE FROM batch_job_locks WHERE job_name = $1 AND execution_id = $2")
            .bind(job_name)
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_checkpoint(&self, job_name: &str) -> BatchResult<Option<Checkpoint>> {
        let state: Option<Json<Checkpoint>> =
            sqlx::query_scalar("SELECT state FROM batch_checkpoints WHERE job_name = $1")
                .bind(job_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(state.map(|Json(cp)| cp))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BatchResult<()> {
        let grand_total: Decimal = checkpoint.totals.grand_total.into();
        sqlx::query(
            r#"
            INSERT INTO batch_checkpoints (
                job_name, execution_id, chunk_sequence, last_order_key,
                grand_total, completed, state, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (job_name) DO UPDATE SET
                execution_id = EXCLUDED.execution_id,
                chunk_sequence = EXCLUDED.chunk_sequence,
                last_order_key = EXCLUDED.last_order_key,
                grand_total = EXCLUDED.grand_total,
                completed = EXCLUDED.completed,
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(&checkpoint.job_name)
        .bind(checkpoint.execution_id)
        .bind(checkpoint.chunk_sequence as i64)
        .bind(&checkpoint.last_order_key)
        .bind(grand_total)
        .bind(checkpoint.completed)
        .bind(Json(checkpoint))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> BatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO batch_executions (
                execution_id, job_name, status, started_at, ended_at, metrics, failure
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id) DO UPDATE SET
                status = EXCLUDED.status,
                ended_at = EXCLUDED.ended_at,
                metrics = EXCLUDED.metrics,
                failure = EXCLUDED.failure
            "#,
        )
        .bind(record.execution_id)
        .bind(&record.job_name)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(Json(&record.metrics))
        .bind(&record.failure)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

struct StagedRow {
    natural_key: String,
    payload: serde_json::Value,
    digest: String,
}

/// A `batch_records` row as it was before a chunk's commit
#[derive(sqlx::FromRow)]
struct PriorRecord {
    natural_key: String,
    payload: serde_json::Value,
    digest: String,
    chunk_sequence: i64,
}

struct RecordUndo {
    job_name: String,
    keys: Vec<String>,
    prior: Vec<PriorRecord>,
}

/// Upserts record payloads (JSONB) keyed by `(job_name, natural_key)`
///
/// Rows whose content digest is unchanged are left untouched, so a replayed
/// chunk is a no-op.
pub struct PgUpsertSink {
    name: String,
    pool: PgPool,
    staged: Mutex<HashMap<u64, (String, Vec<StagedRow>)>>,
    undo: Mutex<BTreeMap<u64, RecordUndo>>,
}

impl PgUpsertSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            name: "postgres:batch_records".to_string(),
            pool,
            staged: Mutex::new(HashMap::new()),
            undo: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl<P> ChunkSink<P> for PgUpsertSink
where
    P: Serialize + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        let rows = batch
            .records
            .iter()
            .map(|r| -> BatchResult<StagedRow> {
                Ok(StagedRow {
                    natural_key: r.natural_key.clone(),
                    payload: serde_json::to_value(&r.payload)?,
                    digest: content_digest(&r.payload)?,
                })
            })
            .collect::<BatchResult<Vec<_>>>()?;
        self.staged
            .lock()
            .await
            .insert(batch.sequence, (batch.job_name.clone(), rows));
        Ok(())
    }

    async fn commit(&self, sequence: u64) -> BatchResult<()> {
        let Some((job_name, rows)) = self.staged.lock().await.remove(&sequence) else {
            return Ok(());
        };

        let keys: Vec<String> = rows.iter().map(|r| r.natural_key.clone()).collect();
        let mut tx = self.pool.begin().await?;
        let prior: Vec<PriorRecord> = sqlx::query_as(
            r#"
            SELECT natural_key, payload, digest, chunk_sequence
            FROM batch_records
            WHERE job_name = $1 AND natural_key = ANY($2)
            FOR UPDATE
            "#,
        )
        .bind(&job_name)
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO batch_records (job_name, natural_key, payload, digest, chunk_sequence, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (job_name, natural_key) DO UPDATE SET
                    payload = EXCLUDED.payload,
                    digest = EXCLUDED.digest,
                    chunk_sequence = EXCLUDED.chunk_sequence,
                    updated_at = NOW()
                WHERE batch_records.digest <> EXCLUDED.digest
                "#,
            )
            .bind(&job_name)
            .bind(&row.natural_key)
            .bind(&row.payload)
            .bind(&row.digest)
            .bind(sequence as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.undo
            .lock()
            .await
            .entry(sequence)
            .or_insert(RecordUndo { job_name, keys, prior });
        Ok(())
    }

    async fn rollback(&self, sequence: u64) -> BatchResult<()> {
        self.staged.lock().await.remove(&sequence);
        Ok(())
    }

    async fn undo(&self, sequence: u64) -> BatchResult<()> {
        let Some(undo) = self.undo.lock().await.remove(&sequence) else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM batch_records WHERE job_name = $1 AND natural_key = ANY($2)")
            .bind(&undo.job_name)
            .bind(&undo.keys)
            .execute(&mut *tx)
            .await?;
        for row in &undo.prior {
            sqlx::query(
                r#"
                INSERT INTO batch_records (job_name, natural_key, payload, digest, chunk_sequence, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(&undo.job_name)
            .bind(&row.natural_key)
            .bind(&row.payload)
            .bind(&row.digest)
            .bind(row.chunk_sequence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(sequence, restored = undo.prior.len(), "Record chunk undone");
        Ok(())
    }

    async fn release(&self, sequence: u64) -> BatchResult<()> {
        self.undo.lock().await.retain(|seq, _| *seq > sequence);
        Ok(())
    }
}

/// A `batch_report_lines` row as it was before a chunk's commit
#[derive(sqlx::FromRow)]
struct PriorLine {
    line_no: i32,
    kind: String,
    text: String,
}

/// Report lines keyed by `(job_name, chunk_sequence, line_no)`
pub struct PgReportSink {
    name: String,
    job_name: String,
    pool: PgPool,
    staged: Mutex<HashMap<u64, Vec<ReportLine>>>,
    undo: Mutex<BTreeMap<u64, Vec<PriorLine>>>,
}

impl PgReportSink {
    pub fn new(pool: PgPool, job_name: impl Into<String>) -> Self {
        Self {
            name: "postgres:batch_report_lines".to_string(),
            job_name: job_name.into(),
            pool,
            staged: Mutex::new(HashMap::new()),
            undo: Mutex::new(BTreeMap::new()),
        }
    }

    /// Committed report text in order
    pub async fn text(&self) -> BatchResult<String> {
        let lines: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT text FROM batch_report_lines
            WHERE job_name = $1
            ORDER BY chunk_sequence, line_no
            "#,
        )
        .bind(&self.job_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines.into_iter().map(|l| l + "\n").collect())
    }
}

#[async_trait]
impl<P: Send + Sync> ChunkSink<P> for PgReportSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, committed_through: u64) -> BatchResult<()> {
        sqlx::query("DELETE FROM batch_report_lines WHERE job_name = $1 AND chunk_sequence > $2")
            .bind(&self.job_name)
            .bind(committed_through as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        self.staged
            .lock()
            .await
            .insert(batch.sequence, batch.lines.clone());
        Ok(())
    }

    async fn commit(&self, sequence: u64) -> BatchResult<()> {
        let Some(lines) = self.staged.lock().await.remove(&sequence) else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        let prior: Vec<PriorLine> = sqlx::query_as(
            r#"
            SELECT line_no, kind, text FROM batch_report_lines
            WHERE job_name = $1 AND chunk_sequence = $2
            ORDER BY line_no
            "#,
        )
        .bind(&self.job_name)
        .bind(sequence as i64)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM batch_report_lines WHERE job_name = $1 AND chunk_sequence = $2")
            .bind(&self.job_name)
            .bind(sequence as i64)
            .execute(&mut *tx)
            .await?;
        for (idx, line) in lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO batch_report_lines (job_name, chunk_sequence, line_no, kind, text)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&self.job_name)
            .bind(sequence as i64)
            .bind(idx as i32)
            .bind(line.kind.as_str())
            .bind(&line.text)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.undo.lock().await.entry(sequence).or_insert(prior);
        Ok(())
    }

    async fn rollback(&self, sequence: u64) -> BatchResult<()> {
        self.staged.lock().await.remove(&sequence);
        Ok(())
    }

    async fn undo(&self, sequence: u64) -> BatchResult<()> {
        let Some(prior) = self.undo.lock().await.remove(&sequence) else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM batch_report_lines WHERE job_name = $1 AND chunk_sequence = $2")
            .bind(&self.job_name)
            .bind(sequence as i64)
            .execute(&mut *tx)
            .await?;
        for line in &prior {
            sqlx::query(
                r#"
                INSERT INTO batch_report_lines (job_name, chunk_sequence, line_no, kind, text)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&self.job_name)
            .bind(sequence as i64)
            .bind(line.line_no)
            .bind(&line.kind)
            .bind(&line.text)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, sequence: u64) -> BatchResult<()> {
        self.undo.lock().await.retain(|seq, _| *seq > sequence);
        Ok(())
    }
}
