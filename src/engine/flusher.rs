//! Periodic cache-to-store flush scheduling

use super::IndexerEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Spawn the background task that runs a full flush cycle every `interval`.
///
/// A cycle that overruns its interval delays the next tick instead of
/// bursting to catch up. Abort the handle to stop the scheduler; pending
/// mutations stay cached for [`IndexerEngine::shutdown`] to drain.
pub fn spawn_flush_scheduler(engine: Arc<IndexerEngine>, interval: Duration) -> JoinHandle<()> {
    info!(interval_ms = interval.as_millis() as u64, "flush scheduler started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh engine is
        // not flushed before anything accumulated.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match engine.flush_all_aggregates().await {
                Ok(0) => {}
                Ok(flushed) => debug!(flushed, "scheduled flush cycle complete"),
                Err(error) => warn!(%error, "scheduled flush cycle failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::num_field;
    use crate::schema::{IndicesConfig, Measure, TypeConfig};
    use crate::store::MemStore;
    use serde_json::{json, Value};

    fn search_engine() -> Arc<IndexerEngine> {
        let search = TypeConfig::builder("searchQuery", "analytics")
            .id(|d| d.get("query").and_then(Value::as_str).map(str::to_string))
            .aggregate(
                |_, new| {
                    let mut partial = crate::core::types::Document::new();
                    if let Some(query) = new.get("query") {
                        partial.insert("query".into(), query.clone());
                    }
                    partial
                },
                vec![Measure::count("count")],
            )
            .build();

        let indices = Arc::new(IndicesConfig::new().doc_type(search));
        Arc::new(IndexerEngine::with_store(indices, Arc::new(MemStore::new())))
    }

    #[tokio::test]
    async fn test_scheduler_persists_pending_mutations() {
        let engine = search_engine();
        let scheduler = spawn_flush_scheduler(Arc::clone(&engine), Duration::from_millis(20));

        engine
            .upsert(
                "searchQuery",
                json!({"query": "alpha"}).as_object().unwrap().clone(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = engine.get("searchQuery", "alpha").await.unwrap().unwrap();
        assert_eq!(num_field(&stored, "count"), 1.0);

        scheduler.abort();
    }
}
