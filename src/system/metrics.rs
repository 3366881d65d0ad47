//! Metrics collection for the indexing engine
//!
//! Prometheus counters registered once through the global instance, kept
//! cheap enough to increment on every operation.

use crate::core::error::{Error, Result};
use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};

/// Centralized counters for indexing and aggregation activity.
pub struct Metrics {
    /// Documents written through ADD (and the ADD arm of UPSERT)
    pub documents_added: IntCounter,
    /// Documents rewritten through UPDATE or PARTIAL_UPDATE
    pub documents_updated: IntCounter,
    /// Documents removed
    pub documents_removed: IntCounter,
    /// Operations resolved as soft failures (SKIP, NOT_FOUND, EXISTS_ALREADY)
    pub operations_skipped: IntCounter,
    /// Aggregate member mutations applied (adds, removes, and updates)
    pub aggregate_mutations: IntCounter,
    /// Pending aggregate mutations written back to the store
    pub aggregates_flushed: IntCounter,
    /// Cache lookups that found a pending mutation
    pub cache_hits: IntCounter,
    /// Cache lookups that fell through to the store
    pub cache_misses: IntCounter,
    /// Entries displaced from the bounded cache
    pub cache_evictions: IntCounter,
    /// Lock acquisitions that exhausted their retry budget
    pub lock_failures: IntCounter,
    /// Duration of top-level indexing operations in seconds
    pub operation_duration: Histogram,
}

impl Metrics {
    fn new() -> Result<Self> {
        Ok(Self {
            documents_added: register_int_counter!(
                "agx_documents_added_total",
                "Total number of documents added"
            )
            .map_err(metrics_error)?,
            documents_updated: register_int_counter!(
                "agx_documents_updated_total",
                "Total number of documents updated"
            )
            .map_err(metrics_error)?,
            documents_removed: register_int_counter!(
                "agx_documents_removed_total",
                "Total number of documents removed"
            )
            .map_err(metrics_error)?,
            operations_skipped: register_int_counter!(
                "agx_operations_skipped_total",
                "Total number of operations resolved as soft failures"
            )
            .map_err(metrics_error)?,
            aggregate_mutations: register_int_counter!(
                "agx_aggregate_mutations_total",
                "Total number of aggregate member mutations applied"
            )
            .map_err(metrics_error)?,
            aggregates_flushed: register_int_counter!(
                "agx_aggregates_flushed_total",
                "Total number of pending aggregate mutations flushed"
            )
            .map_err(metrics_error)?,
            cache_hits: register_int_counter!(
                "agx_cache_hits_total",
                "Total number of cache hits"
            )
            .map_err(metrics_error)?,
            cache_misses: register_int_counter!(
                "agx_cache_misses_total",
                "Total number of cache misses"
            )
            .map_err(metrics_error)?,
            cache_evictions: register_int_counter!(
                "agx_cache_evictions_total",
                "Total number of entries displaced from the cache"
            )
            .map_err(metrics_error)?,
            lock_failures: register_int_counter!(
                "agx_lock_failures_total",
                "Total number of failed lock acquisitions"
            )
            .map_err(metrics_error)?,
            operation_duration: register_histogram!(
                "agx_operation_duration_seconds",
                "Duration of indexing operations in seconds",
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
            )
            .map_err(metrics_error)?,
        })
    }

    /// Get the global metrics instance.
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> =
            Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
        &INSTANCE
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::internal(format!("metrics registration failed: {err}"))
}

/// Collect all registered metrics in the Prometheus exposition format.
pub fn collect_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::global();
        let before = metrics.documents_added.get();
        metrics.documents_added.inc();
        assert_eq!(metrics.documents_added.get(), before + 1);
    }

    #[test]
    fn test_collect_includes_registered_families() {
        Metrics::global().cache_hits.inc();
        let exposition = collect_metrics();
        assert!(exposition.contains("agx_cache_hits_total"));
    }
}
