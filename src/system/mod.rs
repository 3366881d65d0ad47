//! Cross-cutting system concerns: metrics collection and exposition.

pub mod metrics;

pub use metrics::Metrics;
