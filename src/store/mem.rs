//! In-memory document store
//!
//! Backs tests and local development with the same contract as the HTTP
//! store: per-document version counters, soft 404s, index-scoped deletes.

use crate::core::error::Result;
use crate::core::types::Document;
use crate::store::{DocumentStore, StoreWrite};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// DashMap-backed store with HTTP-store semantics.
#[derive(Debug, Default)]
pub struct MemStore {
    documents: DashMap<String, (Document, i64)>,
    indices: DashMap<String, Value>,
}

impl MemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(index: &str, doc_type: &str, id: &str) -> String {
        format!("{}/{}/{}", index, doc_type, id)
    }

    /// Number of documents across all indices.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn get(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>> {
        Ok(self
            .documents
            .get(&Self::key(index, doc_type, id))
            .map(|entry| entry.0.clone()))
    }

    async fn get_fields(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        fields: &[String],
    ) -> Result<Option<Document>> {
        let Some(entry) = self.documents.get(&Self::key(index, doc_type, id)) else {
            return Ok(None);
        };

        let mut projected = Document::new();
        for field in fields {
            if let Some(value) = entry.0.get(field) {
                // Match the wire behavior: single-element arrays unwrap.
                let value = match value {
                    Value::Array(values) if values.len() == 1 => values[0].clone(),
                    other => other.clone(),
                };
                projected.insert(field.clone(), value);
            }
        }

        Ok(Some(projected))
    }

    async fn exists(&self, index: &str, doc_type: &str, id: &str) -> Result<bool> {
        Ok(self.documents.contains_key(&Self::key(index, doc_type, id)))
    }

    async fn put(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Document,
    ) -> Result<StoreWrite> {
        let key = Self::key(index, doc_type, id);
        let mut version = 1;

        self.documents
            .entry(key)
            .and_modify(|(stored, v)| {
                *stored = doc.clone();
                *v += 1;
                version = *v;
            })
            .or_insert_with(|| (doc.clone(), 1));

        Ok(StoreWrite::ok(if version == 1 { 201 } else { 200 }, Some(version)))
    }

    async fn partial_update(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Document,
    ) -> Result<StoreWrite> {
        let key = Self::key(index, doc_type, id);
        let Some(mut entry) = self.documents.get_mut(&key) else {
            return Ok(StoreWrite::ok(404, None));
        };

        for (field, value) in doc {
            entry.0.insert(field.clone(), value.clone());
        }
        entry.1 += 1;
        let version = entry.1;

        Ok(StoreWrite::ok(200, Some(version)))
    }

    async fn delete(&self, index: &str, doc_type: &str, id: &str) -> Result<StoreWrite> {
        match self.documents.remove(&Self::key(index, doc_type, id)) {
            Some((_, (_, version))) => Ok(StoreWrite::ok(200, Some(version))),
            None => Ok(StoreWrite::ok(404, None)),
        }
    }

    async fn create_index(&self, index: &str, body: Value) -> Result<StoreWrite> {
        self.indices.insert(index.to_string(), body);
        Ok(StoreWrite::ok(200, None))
    }

    async fn delete_index(&self, index: &str) -> Result<StoreWrite> {
        let existed = self.indices.remove(index).is_some();
        let prefix = format!("{}/", index);
        self.documents.retain(|key, _| !key.starts_with(&prefix));

        Ok(StoreWrite::ok(if existed { 200 } else { 404 }, None))
    }
}
