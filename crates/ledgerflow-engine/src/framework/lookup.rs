//! Cross-reference lookups for enrichment stages
//!
//! Lookups are batched per chunk: [`EnrichmentStage::prepare_chunk`] issues
//! one `lookup_many` call for the distinct keys of the chunk and fills a
//! chunk-scoped cache that `process` reads from. The cache is rebuilt on
//! every chunk attempt, so a retried chunk sees fresh reference data.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::stage::{Stage, StageKind};
use super::types::{ProcessingResult, Record};
use crate::error::BatchResult;

/// External reference data (accounts, customers, cards, ...)
#[async_trait]
pub trait CrossReference: Send + Sync {
    type Entity: Clone + Send + Sync;

    /// Resolve many keys in one round trip; missing keys are simply absent
    async fn lookup_many(&self, keys: &[String]) -> BatchResult<HashMap<String, Self::Entity>>;

    async fn lookup(&self, key: &str) -> BatchResult<Option<Self::Entity>> {
        let mut found = self.lookup_many(&[key.to_string()]).await?;
        Ok(found.remove(key))
    }
}

/// In-memory reference table that counts round trips
#[derive(Debug, Default)]
pub struct MapLookup<E> {
    entries: HashMap<String, E>,
    calls: AtomicU64,
}

impl<E> MapLookup<E> {
    pub fn new(entries: HashMap<String, E>) -> Self {
        Self {
            entries,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of `lookup_many` round trips served
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<E: Clone + Send + Sync> CrossReference for MapLookup<E> {
    type Entity = E;

    async fn lookup_many(&self, keys: &[String]) -> BatchResult<HashMap<String, E>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(keys
            .iter()
            .filter_map(|k| self.entries.get(k).map(|e| (k.clone(), e.clone())))
            .collect())
    }
}

type KeyFn<P> = dyn Fn(&Record<P>) -> String + Send + Sync;
type EnrichFn<P, E> = dyn Fn(Record<P>, Option<&E>) -> ProcessingResult<P> + Send + Sync;

/// Enrichment stage with a chunk-scoped lookup cache
pub struct EnrichmentStage<P, L: CrossReference> {
    name: String,
    lookup: Arc<L>,
    key_of: Box<KeyFn<P>>,
    enrich: Box<EnrichFn<P, L::Entity>>,
    cache: Mutex<HashMap<String, Option<L::Entity>>>,
}

impl<P, L: CrossReference> EnrichmentStage<P, L> {
    /// `key_of` extracts the reference key; `enrich` combines the record with
    /// the resolved entity (`None` when the key is unknown)
    pub fn new<K, F>(name: impl Into<String>, lookup: Arc<L>, key_of: K, enrich: F) -> Self
    where
        K: Fn(&Record<P>) -> String + Send + Sync + 'static,
        F: Fn(Record<P>, Option<&L::Entity>) -> ProcessingResult<P> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            lookup,
            key_of: Box::new(key_of),
            enrich: Box::new(enrich),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<P, L> Stage<P> for EnrichmentStage<P, L>
where
    P: Send + Sync + 'static,
    L: CrossReference + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Enrichment
    }

    async fn prepare_chunk(&self, records: &[Record<P>]) -> BatchResult<()> {
        let keys: Vec<String> = records
            .iter()
            .map(|r| (self.key_of)(r))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut cache = self.cache.lock().await;
        cache.clear();
        if keys.is_empty() {
            return Ok(());
        }

        let found = self.lookup.lookup_many(&keys).await?;
        tracing::debug!(
            stage = %self.name,
            requested = keys.len(),
            resolved = found.len(),
            "Cross-reference cache loaded"
        );
        for key in keys {
            let entity = found.get(&key).cloned();
            cache.insert(key, entity);
        }
        Ok(())
    }

    async fn process(&self, record: Record<P>) -> ProcessingResult<P> {
        let key = (self.key_of)(&record);
        let cached = self.cache.lock().await.get(&key).cloned();

        let entity = match cached {
            Some(entity) => entity,
            // Not prepared for this chunk: single lookup
            None => match self.lookup.lookup(&key).await {
                Ok(entity) => entity,
                Err(e) => return ProcessingResult::from_error(e),
            },
        };

        (self.enrich)(record, entity.as_ref())
    }
}
