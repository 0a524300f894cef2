//! Sink writers
//!
//! A chunk fans out to every configured sink. Transactional sinks take part
//! in the chunk commit: all of them stage the chunk first, then all of them
//! commit, and only then does the coordinator advance the checkpoint. Each
//! commit keeps undo data for its chunk until the checkpoint is durable; if
//! a later sink or the checkpoint save fails, the sinks that already
//! committed are undone and the chunk is written nowhere.
//!
//! A replayed chunk (retry, or redo after a crash) must leave a transactional
//! sink exactly as a single commit would, so record stores upsert by natural
//! key and report sinks key their lines by chunk sequence and line number.
//!
//! Best-effort sinks (logging, metrics) run after the commit and their
//! failures are only logged.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ledgerflow_common::checksum::content_digest;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::types::{ChunkBatch, ReportLine};
use crate::error::{BatchError, BatchResult};

#[async_trait]
pub trait ChunkSink<P>: Send + Sync {
    fn name(&self) -> &str;

    /// Best-effort sinks are written after the commit and never fail it
    fn is_best_effort(&self) -> bool {
        false
    }

    /// Called once per execution before the first chunk; everything written
    /// for chunks after `committed_through` is stale and may be discarded
    async fn open(&self, _committed_through: u64) -> BatchResult<()> {
        Ok(())
    }

    /// Phase one: buffer the chunk's writes
    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()>;

    /// Phase two: make the staged writes for `sequence` durable
    async fn commit(&self, sequence: u64) -> BatchResult<()>;

    /// Drop whatever was staged for `sequence`
    async fn rollback(&self, sequence: u64) -> BatchResult<()>;

    /// Revert a commit of `sequence` whose checkpoint was never saved
    ///
    /// A no-op when nothing was committed for `sequence` since its last
    /// release.
    async fn undo(&self, sequence: u64) -> BatchResult<()>;

    /// The checkpoint covering `sequence` is durable; undo data up to and
    /// including it can be dropped
    async fn release(&self, _sequence: u64) -> BatchResult<()> {
        Ok(())
    }
}

// ============================================================================
// Record store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
struct StoredRow<P> {
    payload: P,
    digest: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounters {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

/// Rows and counters as they were before a chunk's commit
#[derive(Debug)]
struct StoreUndo<P> {
    prior: Vec<(String, Option<StoredRow<P>>)>,
    counters: WriteCounters,
}

#[derive(Debug)]
struct StoreState<P> {
    rows: BTreeMap<String, StoredRow<P>>,
    staged: HashMap<u64, Vec<(String, P)>>,
    undo: BTreeMap<u64, StoreUndo<P>>,
    counters: WriteCounters,
}

/// In-memory primary store keyed by natural key
#[derive(Debug)]
pub struct MemoryStore<P> {
    name: String,
    state: Mutex<StoreState<P>>,
}

impl<P> MemoryStore<P>
where
    P: Clone + Serialize + Send + Sync,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(StoreState {
                rows: BTreeMap::new(),
                staged: HashMap::new(),
                undo: BTreeMap::new(),
                counters: WriteCounters::default(),
            }),
        }
    }

    /// Insert or replace the payload stored under `natural_key`
    pub async fn upsert(&self, natural_key: &str, payload: &P) -> BatchResult<UpsertOutcome> {
        let mut state = self.state.lock().await;
        Self::upsert_locked(&mut state, natural_key, payload.clone())
    }

    fn upsert_locked(state: &mut StoreState<P>, natural_key: &str, payload: P) -> BatchResult<UpsertOutcome> {
        let digest = content_digest(&payload)?;
        let outcome = match state.rows.get(natural_key) {
            Some(row) if row.digest == digest => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        match outcome {
            UpsertOutcome::Inserted => state.counters.inserted += 1,
            UpsertOutcome::Updated => state.counters.updated += 1,
            UpsertOutcome::Unchanged => state.counters.unchanged += 1,
        }
        if outcome != UpsertOutcome::Unchanged {
            state
                .rows
                .insert(natural_key.to_string(), StoredRow { payload, digest });
        }
        Ok(outcome)
    }

    pub async fn get(&self, natural_key: &str) -> Option<P> {
        self.state
            .lock()
            .await
            .rows
            .get(natural_key)
            .map(|row| row.payload.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.rows.keys().cloned().collect()
    }

    pub async fn counters(&self) -> WriteCounters {
        self.state.lock().await.counters
    }

    /// Digest over the full committed content, in natural key order
    pub async fn digest(&self) -> BatchResult<String> {
        let state = self.state.lock().await;
        let content: Vec<(&String, &P)> = state.rows.iter().map(|(k, row)| (k, &row.payload)).collect();
        Ok(content_digest(&content)?)
    }
}

#[async_trait]
impl<P> ChunkSink<P> for MemoryStore<P>
where
    P: Clone + Serialize + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        let rows = batch
            .records
            .iter()
            .map(|r| (r.natural_key.clone(), r.payload.clone()))
            .collect();
        self.state.lock().await.staged.insert(batch.sequence, rows);
        Ok(())
    }

    async fn commit(&self, sequence: u64) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        let rows = state.staged.remove(&sequence).unwrap_or_default();
        if !state.undo.contains_key(&sequence) {
            let prior = rows
                .iter()
                .map(|(key, _)| (key.clone(), state.rows.get(key).cloned()))
                .collect();
            let counters = state.counters;
            state.undo.insert(sequence, StoreUndo { prior, counters });
        }
        for (key, payload) in rows {
            Self::upsert_locked(&mut state, &key, payload)?;
        }
        Ok(())
    }

    async fn rollback(&self, sequence: u64) -> BatchResult<()> {
        self.state.lock().await.staged.remove(&sequence);
        Ok(())
    }

    async fn undo(&self, sequence: u64) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        let Some(undo) = state.undo.remove(&sequence) else {
            return Ok(());
        };
        // Newest first, so a key written twice ends at its oldest value
        for (key, prior) in undo.prior.into_iter().rev() {
            match prior {
                Some(row) => {
                    state.rows.insert(key, row);
                },
                None => {
                    state.rows.remove(&key);
                },
            }
        }
        state.counters = undo.counters;
        Ok(())
    }

    async fn release(&self, sequence: u64) -> BatchResult<()> {
        self.state.lock().await.undo.retain(|seq, _| *seq > sequence);
        Ok(())
    }
}

// ============================================================================
// Report sinks
// ============================================================================

#[derive(Debug, Default)]
struct ReportState {
    lines: BTreeMap<(u64, usize), ReportLine>,
    staged: HashMap<u64, Vec<ReportLine>>,
    /// Lines a chunk replaced, by chunk sequence
    undo: BTreeMap<u64, Vec<ReportLine>>,
}

/// In-memory report keyed by (chunk sequence, line number)
#[derive(Debug)]
pub struct MemoryReport {
    name: String,
    state: Mutex<ReportState>,
}

impl MemoryReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ReportState::default()),
        }
    }

    /// Committed lines in report order
    pub async fn lines(&self) -> Vec<ReportLine> {
        self.state.lock().await.lines.values().cloned().collect()
    }

    pub async fn text(&self) -> String {
        let lines = self.lines().await;
        let mut out = String::new();
        for line in lines {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    fn replace_chunk(state: &mut ReportState, sequence: u64, lines: Vec<ReportLine>) {
        state.lines.retain(|(seq, _), _| *seq != sequence);
        for (idx, line) in lines.into_iter().enumerate() {
            state.lines.insert((sequence, idx), line);
        }
    }
}

#[async_trait]
impl<P: Send + Sync> ChunkSink<P> for MemoryReport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, committed_through: u64) -> BatchResult<()> {
        self.state
            .lock()
            .await
            .lines
            .retain(|(seq, _), _| *seq <= committed_through);
        Ok(())
    }

    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        self.state
            .lock()
            .await
            .staged
            .insert(batch.sequence, batch.lines.clone());
        Ok(())
    }

    async fn commit(&self, sequence: u64) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        if let Some(lines) = state.staged.remove(&sequence) {
            if !state.undo.contains_key(&sequence) {
                let prior = state
                    .lines
                    .range((sequence, 0)..=(sequence, usize::MAX))
                    .map(|(_, line)| line.clone())
                    .collect();
                state.undo.insert(sequence, prior);
            }
            Self::replace_chunk(&mut state, sequence, lines);
        }
        Ok(())
    }

    async fn rollback(&self, sequence: u64) -> BatchResult<()> {
        self.state.lock().await.staged.remove(&sequence);
        Ok(())
    }

    async fn undo(&self, sequence: u64) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        if let Some(prior) = state.undo.remove(&sequence) {
            Self::replace_chunk(&mut state, sequence, prior);
        }
        Ok(())
    }

    async fn release(&self, sequence: u64) -> BatchResult<()> {
        self.state.lock().await.undo.retain(|seq, _| *seq > sequence);
        Ok(())
    }
}

/// Byte offset where each chunk's output starts, plus the committed end
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReportOffsets {
    chunks: BTreeMap<u64, u64>,
    end: u64,
}

/// Fixed-width text report on disk
///
/// A side file (`<report>.offsets`) records where every committed chunk's
/// output starts. Replaying a chunk truncates the report back to that
/// offset, and output past the last committed chunk is cut off, so a torn
/// write from a crashed run never survives.
pub struct FileReportSink {
    name: String,
    path: PathBuf,
    offsets_path: PathBuf,
    staged: Mutex<HashMap<u64, Vec<ReportLine>>>,
    /// Offsets as they were before a chunk's commit
    undo: Mutex<BTreeMap<u64, ReportOffsets>>,
}

impl FileReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut offsets = path.clone().into_os_string();
        offsets.push(".offsets");
        Self {
            name: format!("report:{}", path.display()),
            offsets_path: PathBuf::from(offsets),
            path,
            staged: Mutex::new(HashMap::new()),
            undo: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_offsets(&self) -> BatchResult<ReportOffsets> {
        match tokio::fs::read(&self.offsets_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ReportOffsets::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_offsets(&self, offsets: &ReportOffsets) -> BatchResult<()> {
        let mut tmp = self.offsets_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, serde_json::to_vec(offsets)?).await?;
        tokio::fs::rename(&tmp, &self.offsets_path).await?;
        Ok(())
    }

    async fn truncate_to(&self, len: u64) -> BatchResult<()> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl<P: Send + Sync> ChunkSink<P> for FileReportSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, committed_through: u64) -> BatchResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut offsets = self.read_offsets().await?;
        let stale: Vec<u64> = offsets
            .chunks
            .range(committed_through.saturating_add(1)..)
            .map(|(seq, _)| *seq)
            .collect();
        if let Some(first) = stale.first() {
            offsets.end = offsets.chunks[first];
        }
        for seq in stale {
            offsets.chunks.remove(&seq);
        }

        self.truncate_to(offsets.end).await?;
        self.write_offsets(&offsets).await?;
        tracing::debug!(
            path = %self.path.display(),
            committed_through,
            bytes = offsets.end,
            "Report file opened"
        );
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

        let mut offsets = self.read_offsets().await?;
        self.undo
            .lock()
            .await
            .entry(sequence)
            .or_insert_with(|| offsets.clone());
        // Replay: drop this chunk's earlier output and everything after it
        if let Some(start) = offsets.chunks.get(&sequence).copied() {
            offsets.chunks.retain(|seq, _| *seq < sequence);
            offsets.end = start;
        }
        let start = offsets.end;
        self.truncate_to(start).await?;

        let mut buf = String::new();
        for line in &lines {
            buf.push_str(&line.text);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;

        offsets.chunks.insert(sequence, start);
        offsets.end = start + buf.len() as u64;
        self.write_offsets(&offsets).await
    }

    async fn rollback(&self, sequence: u64) -> BatchResult<()> {
        self.staged.lock().await.remove(&sequence);
        Ok(())
    }

    async fn undo(&self, sequence: u64) -> BatchResult<()> {
        let Some(prior) = self.undo.lock().await.remove(&sequence) else {
            return Ok(());
        };
        self.truncate_to(prior.end).await?;
        self.write_offsets(&prior).await?;
        tracing::debug!(path = %self.path.display(), sequence, bytes = prior.end, "Report chunk undone");
        Ok(())
    }

    async fn release(&self, sequence: u64) -> BatchResult<()> {
        self.undo.lock().await.retain(|seq, _| *seq > sequence);
        Ok(())
    }
}

// ============================================================================
// Best-effort sinks
// ============================================================================

/// Logs one line per committed chunk
#[derive(Debug, Default)]
pub struct TracingSink {
    staged: Mutex<HashMap<u64, (String, usize, usize)>>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<P: Send + Sync> ChunkSink<P> for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn is_best_effort(&self) -> bool {
        true
    }

    async fn stage(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        self.staged.lock().await.insert(
            batch.sequence,
            (batch.job_name.clone(), batch.records.len(), batch.lines.len()),
        );
        Ok(())
    }

    async fn commit(&self, sequence: u64) -> BatchResult<()> {
        if let Some((job_name, records, lines)) = self.staged.lock().await.remove(&sequence) {
            tracing::info!(job = %job_name, sequence, records, lines, "Chunk written");
        }
        Ok(())
    }

    async fn rollback(&self, sequence: u64) -> BatchResult<()> {
        self.staged.lock().await.remove(&sequence);
        Ok(())
    }

    async fn undo(&self, _sequence: u64) -> BatchResult<()> {
        Ok(())
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// All sinks of a job, written as one unit per chunk
pub struct SinkSet<P> {
    sinks: Vec<Arc<dyn ChunkSink<P>>>,
}

impl<P> Clone for SinkSet<P> {
    fn clone(&self) -> Self {
        Self {
            sinks: self.sinks.clone(),
        }
    }
}

impl<P> Default for SinkSet<P> {
    fn default() -> Self {
        Self { sinks: Vec::new() }
    }
}

impl<P: Send + Sync> SinkSet<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ChunkSink<P>>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn ChunkSink<P>>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn open(&self, committed_through: u64) -> BatchResult<()> {
        for sink in &self.sinks {
            sink.open(committed_through).await?;
        }
        Ok(())
    }

    fn transactional(&self) -> impl Iterator<Item = &Arc<dyn ChunkSink<P>>> {
        self.sinks.iter().filter(|s| !s.is_best_effort())
    }

    /// Stage then commit the chunk on every transactional sink
    ///
    /// When a commit fails, the sinks after it are rolled back and the ones
    /// up to and including it are undone, so the chunk is written nowhere.
    /// The commit error is returned for the fault policy to classify; a
    /// failed undo is returned instead, as `Unknown`.
    pub async fn write(&self, batch: &ChunkBatch<P>) -> BatchResult<()> {
        for sink in self.transactional() {
            if let Err(e) = sink.stage(batch).await {
                tracing::warn!(sink = sink.name(), sequence = batch.sequence, error = %e, "Sink stage failed");
                self.rollback(batch.sequence).await;
                return Err(e);
            }
        }

        let sinks: Vec<_> = self.transactional().collect();
        for (idx, sink) in sinks.iter().enumerate() {
            if let Err(e) = sink.commit(batch.sequence).await {
                tracing::warn!(sink = sink.name(), sequence = batch.sequence, error = %e, "Sink commit failed");
                for pending in &sinks[idx + 1..] {
                    if let Err(rb) = pending.rollback(batch.sequence).await {
                        tracing::warn!(sink = pending.name(), error = %rb, "Sink rollback failed");
                    }
                }
                Self::undo_all(&sinks[..=idx], batch.sequence).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Revert a committed chunk on every transactional sink
    pub async fn undo(&self, sequence: u64) -> BatchResult<()> {
        let sinks: Vec<_> = self.transactional().collect();
        Self::undo_all(&sinks, sequence).await
    }

    /// Drop undo data once the checkpoint for `sequence` is durable
    pub async fn release(&self, sequence: u64) {
        for sink in self.transactional() {
            if let Err(e) = sink.release(sequence).await {
                tracing::warn!(sink = sink.name(), sequence, error = %e, "Sink release failed");
            }
        }
    }

    async fn undo_all(sinks: &[&Arc<dyn ChunkSink<P>>], sequence: u64) -> BatchResult<()> {
        let mut failed = None;
        for sink in sinks.iter().rev() {
            if let Err(e) = sink.undo(sequence).await {
                tracing::error!(sink = sink.name(), sequence, error = %e, "Sink undo failed");
                if failed.is_none() {
                    failed = Some(format!("{}: {}", sink.name(), e));
                }
            }
            if let Err(e) = sink.rollback(sequence).await {
                tracing::warn!(sink = sink.name(), sequence, error = %e, "Sink rollback failed");
            }
        }
        match failed {
            Some(reason) => Err(BatchError::Unknown(format!(
                "chunk {} could not be undone ({})",
                sequence, reason
            ))),
            None => Ok(()),
        }
    }

    /// Best-effort sinks, after the chunk is durable
    pub async fn notify(&self, batch: &ChunkBatch<P>) {
        let writes = self.sinks.iter().filter(|s| s.is_best_effort()).map(|sink| async move {
            let result = match sink.stage(batch).await {
                Ok(()) => sink.commit(batch.sequence).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(sink = sink.name(), sequence = batch.sequence, error = %e, "Best-effort sink failed");
            }
        });
        futures::future::join_all(writes).await;
    }

    /// Discard anything staged for `sequence` on every sink
    pub async fn rollback(&self, sequence: u64) {
        for sink in &self.sinks {
            if let Err(e) = sink.rollback(sequence).await {
                tracing::warn!(sink = sink.name(), sequence, error = %e, "Sink rollback failed");
            }
        }
    }
}
