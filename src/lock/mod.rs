//! Per-key mutual exclusion
//!
//! Every mutating engine call funnels through [`LockProvider::using_lock`].
//! Two backends implement the same contract: in-process keyed semaphores and
//! a remote mutex service for cross-process exclusion. A handle release
//! failure is logged and swallowed — the lock's TTL is the backstop against
//! deadlock, and a stuck remote lock must not crash the caller.

pub mod local;
pub mod remote;

use crate::core::config::{BackendMode, LocksConfig};
use crate::core::error::Result;
use crate::system::metrics::Metrics;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use local::LocalBackend;
use remote::RemoteBackend;

/// Exclusive section held on a named key.
///
/// Handles are cheap to clone so they can be threaded through nested engine
/// calls; release happens exactly once regardless of how many clones exist.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    key: String,
    released: AtomicBool,
    kind: HandleKind,
}

enum HandleKind {
    Local {
        permit: parking_lot::Mutex<Option<OwnedSemaphorePermit>>,
    },
    Remote {
        client: reqwest::Client,
        url: String,
        token: String,
    },
}

impl LockHandle {
    pub(crate) fn local(key: &str, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                key: key.to_string(),
                released: AtomicBool::new(false),
                kind: HandleKind::Local {
                    permit: parking_lot::Mutex::new(Some(permit)),
                },
            }),
        }
    }

    pub(crate) fn remote(key: &str, client: reqwest::Client, url: String, token: String) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                key: key.to_string(),
                released: AtomicBool::new(false),
                kind: HandleKind::Remote { client, url, token },
            }),
        }
    }

    /// The key this handle serializes.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Release the section. Idempotent; failures are logged, never
    /// propagated — the TTL reclaims a lock whose release was lost.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }

        match &self.inner.kind {
            HandleKind::Local { permit } => {
                permit.lock().take();
            }
            HandleKind::Remote { client, url, token } => {
                let result = client
                    .delete(url)
                    .query(&[("token", token.as_str())])
                    .send()
                    .await;

                match result {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => warn!(
                        key = %self.inner.key,
                        status = response.status().as_u16(),
                        "remote lock release rejected; ttl will reclaim it"
                    ),
                    Err(error) => warn!(
                        key = %self.inner.key,
                        %error,
                        "remote lock release failed; ttl will reclaim it"
                    ),
                }
            }
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if *self.released.get_mut() {
            return;
        }

        // Abnormal path: the section never released explicitly. The local
        // permit frees itself on drop; a remote lock gets a best-effort
        // fire-and-forget release, with the ttl as the real backstop.
        if let HandleKind::Remote { client, url, token } = &self.kind {
            warn!(key = %self.key, "lock handle dropped without release");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let request = client.delete(url.clone()).query(&[("token", token.as_str())]);
                runtime.spawn(async move {
                    let _ = request.send().await;
                });
            }
        }
    }
}

/// Acquisition backend: in-process or remote mutex service.
#[async_trait]
pub(crate) trait LockBackend: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<LockHandle>;
}

/// Acquires and releases named exclusive sections.
pub struct LockProvider {
    backend: Box<dyn LockBackend>,
}

impl LockProvider {
    /// Build a provider from lock configuration.
    pub fn new(config: &LocksConfig) -> Result<Self> {
        let backend: Box<dyn LockBackend> = match config.mode {
            BackendMode::Memory => Box::new(LocalBackend::new(config)),
            BackendMode::Http => Box::new(RemoteBackend::new(config)?),
        };

        Ok(Self { backend })
    }

    /// An in-process provider with default budgets.
    pub fn in_process() -> Self {
        Self {
            backend: Box::new(LocalBackend::new(&LocksConfig::default())),
        }
    }

    /// Acquire the named section, failing once the timeout/retry budget is
    /// exhausted.
    pub async fn acquire(&self, key: &str) -> Result<LockHandle> {
        match self.backend.acquire(key).await {
            Ok(handle) => Ok(handle),
            Err(error) => {
                Metrics::global().lock_failures.inc();
                Err(error)
            }
        }
    }

    /// Run `op` inside the named section.
    ///
    /// When `existing` is supplied the caller already owns the section: `op`
    /// runs directly and the caller keeps responsibility for the release.
    /// Otherwise the section is acquired, `op` runs, and the handle is
    /// released whatever `op` returned.
    pub async fn using_lock<T, F, Fut>(
        &self,
        key: &str,
        existing: Option<LockHandle>,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(handle) = existing {
            return op(handle).await;
        }

        let handle = self.acquire(key).await?;
        let started = Instant::now();

        let result = op(handle.clone()).await;

        handle.release().await;
        debug!(
            key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "released lock"
        );

        result
    }
}
