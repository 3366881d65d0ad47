//! Remote mutex-service backend
//!
//! Cross-process exclusion keyed by the same strings as the local backend.
//! Acquisition is `PUT {base}/locks/{key}` stamped with a TTL; the service
//! answers 200 with a fencing token, or 409 while another holder exists.
//! Contention is retried every `delay` within the `timeout`/`retries`
//! budget; release sends the token back with a DELETE.

use crate::core::config::LocksConfig;
use crate::core::error::{Error, InternalServiceError, LockAcquisitionError, Result};
use crate::lock::{LockBackend, LockHandle};
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::trace;

/// HTTP client for the remote lock service.
pub(crate) struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    retries: u32,
    delay: Duration,
    ttl: Duration,
}

impl RemoteBackend {
    pub(crate) fn new(config: &LocksConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            retries: config.retries,
            delay: config.delay,
            ttl: config.ttl,
        })
    }

    fn lock_url(&self, key: &str) -> String {
        format!("{}/locks/{}", self.base_url, key)
    }
}

#[async_trait]
impl LockBackend for RemoteBackend {
    async fn acquire(&self, key: &str) -> Result<LockHandle> {
        let url = self.lock_url(key);
        let ttl_ms = self.ttl.as_millis() as u64;
        let deadline = Instant::now() + self.timeout;

        for attempt in 0..self.retries {
            let response = self
                .client
                .put(&url)
                .query(&[("ttl_ms", ttl_ms)])
                .send()
                .await?;

            let status = response.status();

            if status.is_success() {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                let token = body
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                trace!(key, attempt, "acquired remote lock");
                return Ok(LockHandle::remote(key, self.client.clone(), url, token));
            }

            // 409: held by someone else; stay inside the retry budget.
            if status.as_u16() == 409 {
                if Instant::now() + self.delay >= deadline {
                    break;
                }
                tokio::time::sleep(self.delay).await;
                continue;
            }

            return Err(InternalServiceError::from_status(
                status.as_u16(),
                format!("lock service rejected acquisition of '{key}'"),
            )
            .into());
        }

        Err(LockAcquisitionError {
            key: key.to_string(),
            details: format!(
                "budget exhausted ({} retries / {:?} timeout)",
                self.retries, self.timeout
            ),
        }
        .into())
    }
}
