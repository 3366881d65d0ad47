//! Shared types for the indexing engine
//!
//! Documents are schemaless JSON objects; the engine only ever interprets
//! individual numeric fields (measures, weights) and the id. Everything an
//! operation returns is folded into an [`IndexResult`] carrying the store's
//! wire-level field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A document as stored in the backing index: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Read a numeric field from a document, treating missing or non-numeric
/// values as `0.0`.
pub fn num_field(doc: &Document, field: &str) -> f64 {
    doc.get(field).and_then(Value::as_f64).unwrap_or(0.0)
}

/// [`num_field`] over an optional document.
pub fn num_field_opt(doc: Option<&Document>, field: &str) -> f64 {
    doc.map(|d| num_field(d, field)).unwrap_or(0.0)
}

/// Write a numeric field into a document. Non-finite values degrade to `0`.
pub fn set_num_field(doc: &mut Document, field: &str, value: f64) {
    let number = serde_json::Number::from_f64(value)
        .unwrap_or_else(|| serde_json::Number::from(0));
    doc.insert(field.to_string(), Value::Number(number));
}

/// Round to a fixed number of decimal places, half away from zero.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Engine operation, reported back on every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Create a new document
    Add,
    /// Merge changes into an existing document
    Update,
    /// Update invoked with partial semantics
    PartialUpdate,
    /// Delete a document
    Remove,
    /// Create-or-update dispatch
    Upsert,
    /// Read a full document
    Get,
    /// Read only measure-relevant fields
    OptimisedGet,
    /// Existence check
    Exists,
    /// Aggregate-mode upsert absorbed by the write-back cache
    LazyAggregate,
    /// Cache-to-store flush of a pending aggregate mutation
    Flush,
    /// Index-level create
    CreateIndex,
    /// Index-level delete
    DeleteIndex,
}

/// Net effect classification of a pending aggregate mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    /// Membership gained
    Add,
    /// Membership retained, fields changed
    Update,
    /// Membership lost
    Remove,
}

/// Outcome status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    /// Operation applied
    Success,
    /// Operation not applied; see the fail code
    Fail,
}

/// Business outcome for operations that fail without being faults.
///
/// These are structured results, not errors: they are never retried and
/// never logged at error level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailCode {
    /// Update or remove target does not exist
    NotFound,
    /// Document rejected by a filter predicate
    Skip,
    /// Add target already present
    ExistsAlready,
}

/// Result of a single engine operation, in the store's wire vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResult {
    /// Document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Type discriminator
    #[serde(rename = "_type")]
    pub doc_type: String,
    /// Store index the document lives in
    #[serde(rename = "_index")]
    pub index: String,
    /// Store-assigned version, when the store reported one
    #[serde(rename = "_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// HTTP-style status code of the underlying store operation
    #[serde(rename = "_statusCode")]
    pub status_code: u16,
    /// Success or fail
    #[serde(rename = "_status")]
    pub status: OpStatus,
    /// Business fail code, present only on soft failures
    #[serde(rename = "_failCode", skip_serializing_if = "Option::is_none")]
    pub fail_code: Option<FailCode>,
    /// Operation that produced this result
    #[serde(rename = "_operation")]
    pub operation: Operation,
}

impl IndexResult {
    /// A successful write result.
    pub fn success(
        id: impl Into<String>,
        doc_type: impl Into<String>,
        index: impl Into<String>,
        status_code: u16,
        version: Option<i64>,
        operation: Operation,
    ) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            index: index.into(),
            version,
            status_code,
            status: OpStatus::Success,
            fail_code: None,
            operation,
        }
    }

    /// A soft failure carrying a business fail code.
    pub fn soft_fail(
        id: impl Into<String>,
        doc_type: impl Into<String>,
        index: impl Into<String>,
        fail_code: FailCode,
        operation: Operation,
    ) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            index: index.into(),
            version: None,
            status_code: 404,
            status: OpStatus::Fail,
            fail_code: Some(fail_code),
            operation,
        }
    }

    /// Whether the operation was applied.
    pub fn is_success(&self) -> bool {
        self.status == OpStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_to_places() {
        assert_eq!(round_to(1.79175946, 3), 1.792);
        assert_eq!(round_to(4.25, 1), 4.3);
        assert_eq!(round_to(-1.2345, 2), -1.23);
        assert_eq!(round_to(3.0, 3), 3.0);
    }

    #[test]
    fn test_num_field_defaults_to_zero() {
        let mut doc = Document::new();
        doc.insert("count".into(), json!(7));
        doc.insert("title".into(), json!("abc"));

        assert_eq!(num_field(&doc, "count"), 7.0);
        assert_eq!(num_field(&doc, "missing"), 0.0);
        assert_eq!(num_field(&doc, "title"), 0.0);
        assert_eq!(num_field_opt(None, "count"), 0.0);
    }

    #[test]
    fn test_set_num_field_guards_non_finite() {
        let mut doc = Document::new();
        set_num_field(&mut doc, "weight", f64::NAN);
        assert_eq!(num_field(&doc, "weight"), 0.0);
    }

    #[test]
    fn test_index_result_wire_names() {
        let result = IndexResult::soft_fail("b1", "book", "books", FailCode::Skip, Operation::Add);
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["_id"], json!("b1"));
        assert_eq!(value["_type"], json!("book"));
        assert_eq!(value["_statusCode"], json!(404));
        assert_eq!(value["_status"], json!("FAIL"));
        assert_eq!(value["_failCode"], json!("SKIP"));
        assert_eq!(value["_operation"], json!("ADD"));
        assert!(value.get("_version").is_none());
    }
}
