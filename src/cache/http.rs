//! HTTP cache backend
//!
//! Talks to an external cache service keyed by the aggregate key. The
//! service owns capacity, so `put` never reports displaced entries.

use super::{CacheEntry, CacheStore, Displaced};
use crate::core::config::CacheConfig;
use crate::core::error::{Error, InternalServiceError, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Cache backend over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCacheStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCacheStore {
    /// Build a client from cache configuration.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build().map_err(Error::from)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn entry_url(&self, key: &str) -> String {
        format!("{}/cache/{}", self.base_url, key)
    }

    async fn check(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(InternalServiceError::from_status(status.as_u16(), details).into());
        }
        Ok(Some(response))
    }
}

#[async_trait]
impl CacheStore for HttpCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let response = self.client.get(self.entry_url(key)).send().await?;

        let Some(response) = Self::check(response).await? else {
            return Ok(None);
        };

        Ok(Some(response.json().await?))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<Displaced> {
        let response = self
            .client
            .put(self.entry_url(key))
            .json(&entry)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(Vec::new())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.client.delete(self.entry_url(key)).send().await?;

        // A missing entry is already in the state delete asks for.
        Self::check(response).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/cache", self.base_url))
            .send()
            .await?;

        let Some(response) = Self::check(response).await? else {
            return Ok(Vec::new());
        };

        let body: Value = response.json().await?;
        let keys = body
            .get("keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(keys)
    }
}
