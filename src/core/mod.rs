//! Core system types and foundations
//!
//! This module contains the fundamental building blocks of the engine:
//! shared type definitions, error handling, and configuration.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used items
pub use config::{BackendMode, CacheConfig, Config, LocksConfig, StoreConfig};
pub use error::{Error, InternalServiceError, LockAcquisitionError, Result, ValidationError};
pub use types::{Document, FailCode, IndexResult, OpStatus, OpType, Operation};
