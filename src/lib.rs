//! Aggdex - Write-Back Aggregating Document Indexer
//!
//! Aggdex fronts a document store with an indexing engine that keeps derived
//! aggregate entities (autocomplete entries, search-query analytics, rollup
//! counters) incrementally consistent with their source documents. Mutations
//! run inside per-key exclusive sections, measure updates are pure deltas
//! against the prior aggregate state, and hot aggregate writes coalesce in a
//! write-back cache that a background scheduler flushes to the store.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;

// Main functional modules
pub mod cache;
pub mod engine;
pub mod lock;
pub mod schema;
pub mod store;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::config::Config;
pub use crate::core::error::{Error, Result};
pub use crate::core::types::{Document, FailCode, IndexResult, OpType, Operation};
pub use engine::{
    spawn_flush_scheduler, Baseline, IndexRequest, IndexerEngine, RemoveRequest, TypeRef,
};
pub use schema::{
    AggregateConfig, AggregatorConfig, IndexConfig, IndicesConfig, Measure, TypeConfig,
};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing and the metrics registry.
pub fn init(config: &crate::core::config::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    // Force registration of every collector before the first scrape.
    let _ = system::Metrics::global();

    Ok(())
}
