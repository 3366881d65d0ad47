//! HTTP implementation of the document store
//!
//! One `reqwest::Client` per store, shared across requests. Response
//! handling follows the store contract: 404 resolves softly, any other
//! non-2xx status becomes an internal-service error carrying the body.

use crate::core::config::StoreConfig;
use crate::core::error::{Error, InternalServiceError, Result};
use crate::core::types::Document;
use crate::store::{DocumentStore, StoreWrite};
use async_trait::async_trait;
use serde_json::Value;

/// Document store client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    /// Build a client from store configuration.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn doc_url(&self, index: &str, doc_type: &str, id: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, index, doc_type, id)
    }

    fn index_url(&self, index: &str) -> String {
        format!("{}/{}", self.base_url, index)
    }

    /// Map a response to its JSON body, treating 404 as `None` and any other
    /// non-2xx status as an internal-service error.
    async fn handle(&self, response: reqwest::Response) -> Result<Option<(u16, Value)>> {
        let status = response.status();

        if status.as_u16() == 404 {
            return Ok(None);
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let details = body
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(InternalServiceError::from_status(status.as_u16(), details).into());
        }

        Ok(Some((status.as_u16(), body)))
    }

    fn write_from(parsed: Option<(u16, Value)>) -> StoreWrite {
        match parsed {
            Some((status, body)) => StoreWrite::ok(status, body.get("_version").and_then(Value::as_i64)),
            None => StoreWrite::ok(404, None),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn get(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>> {
        let response = self
            .client
            .get(self.doc_url(index, doc_type, id))
            .send()
            .await?;

        let Some((_, body)) = self.handle(response).await? else {
            return Ok(None);
        };

        Ok(body
            .get("_source")
            .and_then(Value::as_object)
            .cloned())
    }

    async fn get_fields(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        fields: &[String],
    ) -> Result<Option<Document>> {
        let response = self
            .client
            .get(self.doc_url(index, doc_type, id))
            .query(&[("fields", fields.join(","))])
            .send()
            .await?;

        let Some((_, body)) = self.handle(response).await? else {
            return Ok(None);
        };

        let Some(mut result) = body.get("fields").and_then(Value::as_object).cloned() else {
            return Ok(None);
        };

        // Field-level responses wrap scalars in single-element arrays.
        for field in fields {
            let unwrapped = match result.get(field) {
                Some(Value::Array(values)) => values.first().cloned(),
                _ => None,
            };
            if let Some(value) = unwrapped {
                result.insert(field.clone(), value);
            }
        }

        Ok(Some(result))
    }

    async fn exists(&self, index: &str, doc_type: &str, id: &str) -> Result<bool> {
        let response = self
            .client
            .head(self.doc_url(index, doc_type, id))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(
                InternalServiceError::from_status(status.as_u16(), "existence check failed").into(),
            );
        }

        Ok(true)
    }

    async fn put(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Document,
    ) -> Result<StoreWrite> {
        let response = self
            .client
            .put(self.doc_url(index, doc_type, id))
            .json(doc)
            .send()
            .await?;

        Ok(Self::write_from(self.handle(response).await?))
    }

    async fn partial_update(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        doc: &Document,
    ) -> Result<StoreWrite> {
        let response = self
            .client
            .post(format!("{}/_update", self.doc_url(index, doc_type, id)))
            .json(&serde_json::json!({ "doc": doc }))
            .send()
            .await?;

        Ok(Self::write_from(self.handle(response).await?))
    }

    async fn delete(&self, index: &str, doc_type: &str, id: &str) -> Result<StoreWrite> {
        let response = self
            .client
            .delete(self.doc_url(index, doc_type, id))
            .send()
            .await?;

        Ok(Self::write_from(self.handle(response).await?))
    }

    async fn create_index(&self, index: &str, body: Value) -> Result<StoreWrite> {
        let response = self
            .client
            .put(self.index_url(index))
            .json(&body)
            .send()
            .await?;

        Ok(Self::write_from(self.handle(response).await?))
    }

    async fn delete_index(&self, index: &str) -> Result<StoreWrite> {
        let response = self.client.delete(self.index_url(index)).send().await?;

        Ok(Self::write_from(self.handle(response).await?))
    }
}
