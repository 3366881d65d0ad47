//! In-process cache backend
//!
//! Bounded map with insertion-order displacement. When the bound is hit the
//! oldest entries are removed and returned to the caller so they can be
//! flushed; the key currently being written is never a displacement victim.

use super::{CacheEntry, CacheStore, Displaced};
use crate::core::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded in-process store for pending aggregate mutations.
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    /// Keys in insertion order; a key appears at most once.
    order: Mutex<VecDeque<String>>,
    max_entries: usize,
}

impl MemoryCacheStore {
    /// Create a store holding at most `max_entries` pending mutations.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<Displaced> {
        let rewrite = self.entries.insert(key.to_string(), entry).is_some();

        let mut displaced = Vec::new();
        {
            let mut order = self.order.lock();
            if !rewrite {
                order.push_back(key.to_string());
            }

            while self.entries.len() > self.max_entries {
                // The key just written stays; rotate it to the back if it
                // happens to be the oldest.
                let Some(victim) = order.pop_front() else { break };
                if victim == key {
                    order.push_back(victim);
                    continue;
                }
                if let Some((victim, entry)) = self.entries.remove(&victim) {
                    displaced.push((victim, entry));
                }
            }
        }

        Ok(displaced)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            let mut order = self.order.lock();
            if let Some(pos) = order.iter().position(|k| k == key) {
                order.remove(pos);
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}
