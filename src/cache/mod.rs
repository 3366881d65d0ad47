//! Write-back aggregator cache
//!
//! Maps `"{aggregateType}:{id}"` to the pending mutation for that aggregate
//! entity. Mutations to the same key coalesce into one outstanding record,
//! so a flush applies the net effect since the entry was created rather
//! than each delta as a separate store write. The cache never silently
//! drops an entry: the bounded in-process backend hands displaced entries
//! back to the caller, which flushes them.

pub mod http;
pub mod memory;

use crate::core::config::{BackendMode, CacheConfig};
use crate::core::error::Result;
use crate::core::types::{Document, OpType};
use crate::system::metrics::Metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

pub use http::HttpCacheStore;
pub use memory::MemoryCacheStore;

/// A pending aggregate mutation that has not reached the store yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The accumulated aggregate document
    pub doc: Document,
    /// The aggregate document the accumulation started from
    #[serde(rename = "existingDoc")]
    pub existing_doc: Document,
    /// Net effect classification; set when the entry is created and
    /// preserved by later coalesced mutations
    #[serde(rename = "opType")]
    pub op_type: OpType,
    /// Aggregate entity id
    pub id: String,
    /// Aggregate type discriminator
    #[serde(rename = "type")]
    pub doc_type: String,
}

/// Entries displaced from a bounded backend; each must be flushed.
pub type Displaced = Vec<(String, CacheEntry)>;

/// Storage backend for pending mutations.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read the entry for a key.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Write the entry for a key, returning any entries displaced past the
    /// backend's bound. Displacement is never a drop: the caller owns
    /// flushing what comes back.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<Displaced>;

    /// Remove the entry for a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys with outstanding entries.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// The write-back cache plus the flush gate coordinating scheduled flush
/// cycles with aggregate-mode writers.
pub struct AggregatorCache {
    store: Box<dyn CacheStore>,
    flush_gate: RwLock<()>,
}

impl AggregatorCache {
    /// Build a cache from configuration.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let store: Box<dyn CacheStore> = match config.mode {
            BackendMode::Memory => Box::new(MemoryCacheStore::new(config.max_entries)),
            BackendMode::Http => Box::new(HttpCacheStore::new(config)?),
        };

        Ok(Self {
            store,
            flush_gate: RwLock::new(()),
        })
    }

    /// An in-process cache with the given entry bound.
    pub fn in_process(max_entries: usize) -> Self {
        Self {
            store: Box::new(MemoryCacheStore::new(max_entries)),
            flush_gate: RwLock::new(()),
        }
    }

    /// Read the pending mutation for a key.
    pub async fn retrieve(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry = self.store.get(key).await?;

        let metrics = Metrics::global();
        match entry {
            Some(_) => metrics.cache_hits.inc(),
            None => metrics.cache_misses.inc(),
        }

        Ok(entry)
    }

    /// Write the pending mutation for a key. Returns displaced entries the
    /// caller must flush once it is outside its current critical section.
    pub async fn store(&self, key: &str, entry: CacheEntry) -> Result<Displaced> {
        let displaced = self.store.put(key, entry).await?;

        if !displaced.is_empty() {
            Metrics::global()
                .cache_evictions
                .inc_by(displaced.len() as u64);
            debug!(key, displaced = displaced.len(), "cache bound reached");
        }

        Ok(displaced)
    }

    /// Drop the entry for a key (after a successful flush).
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }

    /// All keys with outstanding mutations.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.store.keys().await
    }

    /// Wait until no scheduled flush cycle is in flight. The returned guard
    /// keeps the next cycle out until the caller's aggregate operation
    /// completes.
    pub async fn ensure_flush_complete(&self) -> RwLockReadGuard<'_, ()> {
        self.flush_gate.read().await
    }

    /// Enter a scheduled flush cycle, excluding new aggregate-mode writers
    /// for its duration.
    pub async fn begin_flush_cycle(&self) -> RwLockWriteGuard<'_, ()> {
        self.flush_gate.write().await
    }

    /// Report outstanding keys so the owner can run a final flush pass.
    pub async fn shutdown(&self) -> Result<Vec<String>> {
        let keys = self.store.keys().await?;
        if !keys.is_empty() {
            debug!(outstanding = keys.len(), "cache shutting down with pending mutations");
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, op_type: OpType) -> CacheEntry {
        let mut doc = Document::new();
        doc.insert("count".into(), json!(1));
        CacheEntry {
            doc,
            existing_doc: Document::new(),
            op_type,
            id: id.to_string(),
            doc_type: "authorAutocomplete".to_string(),
        }
    }

    fn memory_cache(max_entries: usize) -> AggregatorCache {
        AggregatorCache::in_process(max_entries)
    }

    #[tokio::test]
    async fn test_store_retrieve_remove_round_trip() {
        let cache = memory_cache(16);
        let key = "authorAutocomplete:a1";

        assert!(cache.retrieve(key).await.unwrap().is_none());

        cache.store(key, entry("a1", OpType::Add)).await.unwrap();
        let cached = cache.retrieve(key).await.unwrap().unwrap();
        assert_eq!(cached.op_type, OpType::Add);

        cache.remove(key).await.unwrap();
        assert!(cache.retrieve(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entry_serde_wire_names() {
        let value = serde_json::to_value(entry("a1", OpType::Update)).unwrap();
        assert_eq!(value["opType"], json!("UPDATE"));
        assert_eq!(value["type"], json!("authorAutocomplete"));
        assert!(value.get("existingDoc").is_some());
    }

    #[tokio::test]
    async fn test_bound_displaces_oldest_never_newest() {
        let cache = memory_cache(2);

        assert!(cache.store("t:a", entry("a", OpType::Add)).await.unwrap().is_empty());
        assert!(cache.store("t:b", entry("b", OpType::Add)).await.unwrap().is_empty());

        let displaced = cache.store("t:c", entry("c", OpType::Add)).await.unwrap();
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].0, "t:a");

        // Displaced entries are handed back intact, not dropped.
        assert_eq!(displaced[0].1.id, "a");
        assert!(cache.retrieve("t:a").await.unwrap().is_none());
        assert!(cache.retrieve("t:c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rewriting_a_key_does_not_displace() {
        let cache = memory_cache(2);
        cache.store("t:a", entry("a", OpType::Add)).await.unwrap();
        cache.store("t:b", entry("b", OpType::Add)).await.unwrap();

        let displaced = cache.store("t:a", entry("a", OpType::Add)).await.unwrap();
        assert!(displaced.is_empty());
        assert_eq!(cache.keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_gate_blocks_writers_during_cycle() {
        let cache = std::sync::Arc::new(memory_cache(16));

        let gate = cache.begin_flush_cycle().await;

        let waiter = {
            let cache = std::sync::Arc::clone(&cache);
            tokio::spawn(async move {
                let _read = cache.ensure_flush_complete().await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(gate);
        waiter.await.unwrap();
    }
}
