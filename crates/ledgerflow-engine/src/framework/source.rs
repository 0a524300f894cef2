//! Record sources and the ordered source iterator
//!
//! A [`RecordSource`] hands out pages of records strictly ascending by
//! `order_key`, starting at an arbitrary cursor so a restarted job can pick up
//! where its last checkpoint left off. [`SourceIterator`] flattens those pages,
//! retries transient fetch failures on its own, and enforces the ordering
//! contract the break totals depend on.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::Mutex;

use super::types::{Cursor, KeyRange, Record};
use crate::error::{BatchError, BatchResult, ErrorKind};

/// One page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Cursor,
    pub limit: usize,
    pub range: KeyRange,
}

/// One page of records
#[derive(Debug, Clone)]
pub struct Page<P> {
    pub records: Vec<Record<P>>,
    pub next_cursor: Cursor,
    pub has_more: bool,
}

/// Paginated supplier of ordered records
///
/// Filtering (date ranges, key ranges) and ordering belong to the
/// implementation; the engine only checks that order keys ascend.
#[async_trait]
pub trait RecordSource<P>: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> BatchResult<Page<P>>;
}

/// Slice-backed page: records `cursor.offset..cursor.offset + limit` of `filtered`
fn page_of<P: Clone>(filtered: &[&Record<P>], request: &PageRequest) -> Page<P> {
    let start = (request.cursor.offset as usize).min(filtered.len());
    let end = start.saturating_add(request.limit).min(filtered.len());
    let records: Vec<Record<P>> = filtered[start..end].iter().map(|r| (*r).clone()).collect();

    let next_cursor = Cursor {
        offset: end as u64,
        after_key: records
            .last()
            .map(|r| r.order_key.clone())
            .or_else(|| request.cursor.after_key.clone()),
    };

    Page {
        records,
        next_cursor,
        has_more: end < filtered.len(),
    }
}

/// In-memory source, sorted by order key on construction
#[derive(Debug, Clone)]
pub struct VecSource<P> {
    records: Vec<Record<P>>,
}

impl<P> VecSource<P> {
    pub fn new(mut records: Vec<Record<P>>) -> Self {
        records.sort_by(|a, b| a.order_key.cmp(&b.order_key));
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync> RecordSource<P> for VecSource<P> {
    async fn fetch_page(&self, request: &PageRequest) -> BatchResult<Page<P>> {
        let filtered: Vec<&Record<P>> = self
            .records
            .iter()
            .filter(|r| request.range.contains(&r.order_key))
            .collect();
        Ok(page_of(&filtered, request))
    }
}

/// Open statement file, positioned after `consumed` in-range records
struct LineReader {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    consumed: u64,
    range: KeyRange,
}

/// Statement-file source: one JSON-encoded [`Record`] per line
///
/// Lines are read as pages are requested, in file order. Consecutive pages
/// reuse the open file; a request at any other cursor reopens it and skips
/// forward.
pub struct JsonLinesSource<P> {
    path: PathBuf,
    reader: Mutex<Option<LineReader>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> JsonLinesSource<P> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: Mutex::new(None),
            _payload: PhantomData,
        }
    }

    fn unavailable(&self, e: std::io::Error) -> BatchError {
        let err: BatchError = e.into();
        if err.is_transient() {
            err
        } else {
            BatchError::SourceUnavailable(format!("{}: {}", self.path.display(), err))
        }
    }
}

impl<P: DeserializeOwned> JsonLinesSource<P> {
    async fn open(&self, request: &PageRequest) -> BatchResult<LineReader> {
        let file = File::open(&self.path).await.map_err(|e| self.unavailable(e))?;
        let mut reader = LineReader {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            consumed: 0,
            range: request.range.clone(),
        };
        while reader.consumed < request.cursor.offset {
            if self.next_record(&mut reader).await?.is_none() {
                break;
            }
            reader.consumed += 1;
        }
        Ok(reader)
    }

    /// Next in-range record, `None` at end of file
    async fn next_record(&self, reader: &mut LineReader) -> BatchResult<Option<Record<P>>> {
        while let Some(line) = reader.lines.next_line().await.map_err(|e| self.unavailable(e))? {
            reader.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record<P> = serde_json::from_str(&line).map_err(|e| {
                BatchError::SourceUnavailable(format!(
                    "{}:{}: malformed record: {}",
                    self.path.display(),
                    reader.line_no,
                    e
                ))
            })?;
            if reader.range.contains(&record.order_key) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<P> RecordSource<P> for JsonLinesSource<P>
where
    P: DeserializeOwned + Send + Sync,
{
    async fn fetch_page(&self, request: &PageRequest) -> BatchResult<Page<P>> {
        let mut slot = self.reader.lock().await;
        let mut reader = match slot.take() {
            Some(reader) if reader.consumed == request.cursor.offset && reader.range == request.range => {
                reader
            },
            _ => self.open(request).await?,
        };

        let mut records = Vec::with_capacity(request.limit);
        let mut exhausted = false;
        while records.len() < request.limit {
            match self.next_record(&mut reader).await? {
                Some(record) => records.push(record),
                None => {
                    exhausted = true;
                    break;
                },
            }
        }
        reader.consumed += records.len() as u64;

        let next_cursor = Cursor {
            offset: reader.consumed,
            after_key: records
                .last()
                .map(|r| r.order_key.clone())
                .or_else(|| request.cursor.after_key.clone()),
        };
        if !exhausted {
            *slot = Some(reader);
        }

        Ok(Page {
            records,
            next_cursor,
            has_more: !exhausted,
        })
    }
}

/// Lazy, ordered iterator over a [`RecordSource`]
pub struct SourceIterator<P> {
    source: Arc<dyn RecordSource<P>>,
    range: KeyRange,
    fetch_size: usize,
    retry_attempts: u32,
    retry_backoff: Duration,
    /// Where the next page starts
    fetch_cursor: Cursor,
    /// Just past the last record handed out
    position: Cursor,
    buffer: VecDeque<Record<P>>,
    has_more: bool,
    pages_fetched: u64,
}

impl<P: Send + 'static> SourceIterator<P> {
    pub fn new(source: Arc<dyn RecordSource<P>>, range: KeyRange, fetch_size: usize) -> Self {
        Self {
            source,
            range,
            fetch_size: fetch_size.max(1),
            retry_attempts: 0,
            retry_backoff: Duration::ZERO,
            fetch_cursor: Cursor::default(),
            position: Cursor::default(),
            buffer: VecDeque::new(),
            has_more: true,
            pages_fetched: 0,
        }
    }

    /// Start reading just after `cursor` (restart from a checkpoint)
    pub fn resume_from(mut self, cursor: Cursor) -> Self {
        self.fetch_cursor = cursor.clone();
        self.position = cursor;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    pub fn position(&self) -> &Cursor {
        &self.position
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// Next record, or `None` once the source is exhausted
    pub async fn next(&mut self) -> BatchResult<Option<Record<P>>> {
        if self.buffer.is_empty() && self.has_more {
            self.fetch().await?;
        }

        let Some(record) = self.buffer.pop_front() else {
            return Ok(None);
        };

        if let Some(previous) = &self.position.after_key {
            if record.order_key.as_str() <= previous.as_str() {
                return Err(BatchError::SourceOrder {
                    previous: previous.clone(),
                    next: record.order_key.clone(),
                });
            }
        }

        self.position.offset += 1;
        self.position.after_key = Some(record.order_key.clone());
        Ok(Some(record))
    }

    /// Up to `size` records; fewer only at end of source
    pub async fn next_chunk(&mut self, size: usize) -> BatchResult<Vec<Record<P>>> {
        let mut chunk = Vec::with_capacity(size);
        while chunk.len() < size {
            match self.next().await? {
                Some(record) => chunk.push(record),
                None => break,
            }
        }
        Ok(chunk)
    }

    async fn fetch(&mut self) -> BatchResult<()> {
        let request = PageRequest {
            cursor: self.fetch_cursor.clone(),
            limit: self.fetch_size,
            range: self.range.clone(),
        };

        let mut attempt = 0u32;
        let page = loop {
            match self.source.fetch_page(&request).await {
                Ok(page) => break page,
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    attempt += 1;
                    let delay = self.retry_backoff.saturating_mul(1u32 << (attempt - 1).min(5));
                    tracing::warn!(
                        offset = request.cursor.offset,
                        attempt,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "Source page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => {
                    tracing::error!(offset = request.cursor.offset, error = %e, "Record source unavailable");
                    return Err(match e.kind() {
                        ErrorKind::Source => e,
                        _ => BatchError::SourceUnavailable(e.to_string()),
                    });
                },
            }
        };

        self.pages_fetched += 1;
        self.has_more = page.has_more && !page.records.is_empty();
        self.fetch_cursor = page.next_cursor;
        self.buffer.extend(page.records);
        Ok(())
    }
}
