//! In-process lock backend
//!
//! One single-permit semaphore per key, created on first use. Tokio
//! semaphores queue waiters FIFO, which gives the fairness the engine
//! relies on under contention. A TTL makes no sense in-process: handle
//! drop already guarantees the permit comes back.

use crate::core::config::LocksConfig;
use crate::core::error::{LockAcquisitionError, Result};
use crate::lock::{LockBackend, LockHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Keyed-semaphore backend for single-process deployments.
pub(crate) struct LocalBackend {
    semaphores: DashMap<String, Arc<Semaphore>>,
    timeout: Duration,
}

impl LocalBackend {
    pub(crate) fn new(config: &LocksConfig) -> Self {
        Self {
            semaphores: DashMap::new(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl LockBackend for LocalBackend {
    async fn acquire(&self, key: &str) -> Result<LockHandle> {
        let semaphore = self
            .semaphores
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .value()
            .clone();

        match tokio::time::timeout(self.timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(LockHandle::local(key, permit)),
            Ok(Err(_)) => Err(LockAcquisitionError {
                key: key.to_string(),
                details: "semaphore closed".to_string(),
            }
            .into()),
            Err(_) => Err(LockAcquisitionError {
                key: key.to_string(),
                details: format!("timed out after {:?}", self.timeout),
            }
            .into()),
        }
    }
}
