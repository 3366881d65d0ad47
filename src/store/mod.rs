//! Backing document store
//!
//! The store is a remote collaborator addressed as `{index}/{type}/{id}`
//! with CRUD-over-HTTP semantics. The trait is the seam: the engine is
//! written against it, the HTTP implementation talks to the real index,
//! and the in-memory implementation backs tests and local runs.

pub mod http;
pub mod mem;

use crate::core::error::Result;
use crate::core::types::Document;
use async_trait::async_trait;
use serde_json::Value;

pub use http::HttpStore;
pub use mem::MemStore;

/// Outcome of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreWrite {
    /// HTTP-style status code
    pub status_code: u16,
    /// Store-assigned document version, when reported
    pub version: Option<i64>,
}

impl StoreWrite {
    /// A write acknowledged with a version.
    pub fn ok(status_code: u16, version: Option<i64>) -> Self {
        Self { status_code, version }
    }
}

/// CRUD surface of the backing document index.
///
/// A `404` from the store is part of the contract (absent document, absent
/// index), never an error; anything else non-2xx surfaces as an
/// internal-service error.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a full document; absent documents resolve to `None`.
    async fn get(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>>;

    /// Fetch only the named top-level fields of a document, unwrapping
    /// single-element array responses to scalars.
    async fn get_fields(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        fields: &[String],
    ) -> Result<Option<Document>>;

    /// Existence check (HEAD).
    async fn exists(&self, index: &str, doc_type: &str, id: &str) -> Result<bool>;

    /// Create or replace a document (PUT, body = full document).
    async fn put(&self, index: &str, doc_type: &str, id: &str, doc: &Document)
        -> Result<StoreWrite>;

    /// Partial merge into an existing document (POST `.../_update`).
    async fn partial_update(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Document,
    ) -> Result<StoreWrite>;

    /// Delete a document; deleting an absent document reports `404` softly.
    async fn delete(&self, index: &str, doc_type: &str, id: &str) -> Result<StoreWrite>;

    /// Create an index with settings and mappings.
    async fn create_index(&self, index: &str, body: Value) -> Result<StoreWrite>;

    /// Delete an index; `404` is tolerated as success.
    async fn delete_index(&self, index: &str) -> Result<StoreWrite>;
}
