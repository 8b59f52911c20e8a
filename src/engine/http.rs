//! JSON-over-HTTP client for a remote memory engine.
//!
//! Endpoints, relative to `engine.base_url`:
//! `POST /memories`, `POST /memories/search`, `POST /memories/delete`,
//! `POST /memories/state`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EngineHit, EngineScope, MemoryEngine};
use crate::config::EngineConfig;
use crate::error::{GatewayError, Result};
use crate::memory::MemoryState;

pub struct HttpMemoryEngine {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct AddRequest<'a> {
    text: &'a str,
    user_id: &'a str,
    app_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

#[derive(Deserialize)]
struct AddResponse {
    id: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    user_id: &'a str,
    app_id: &'a str,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<EngineHit>,
}

#[derive(Serialize)]
struct IdsRequest<'a> {
    memory_ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<MemoryState>,
}

impl HttpMemoryEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status.is_server_error() {
            tracing::warn!(url = %url, status = %status, "memory engine error");
            return Err(GatewayError::UpstreamUnavailable(format!("engine returned {status}")));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Validation(format!("engine rejected request ({status}): {body}")));
        }
        Ok(response)
    }

    fn map_transport_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout(self.timeout)
        } else {
            tracing::warn!(error = %e, "memory engine unreachable");
            GatewayError::UpstreamUnavailable(e.to_string())
        }
    }

    async fn decode<T: for<'de> Deserialize<'de>>(&self, response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("bad engine response: {e}")))
    }
}

#[async_trait]
impl MemoryEngine for HttpMemoryEngine {
    async fn add(
        &self,
        text: &str,
        metadata: Option<&serde_json::Value>,
        scope: &EngineScope,
    ) -> Result<String> {
        let body = AddRequest {
            text,
            user_id: &scope.account_id,
            app_id: &scope.app_id,
            metadata,
        };
        let response = self.post("/memories", &body).await?;
        Ok(self.decode::<AddResponse>(response).await?.id)
    }

    async fn search(&self, query: &str, limit: usize, scope: &EngineScope) -> Result<Vec<EngineHit>> {
        let body = SearchRequest {
            query,
            user_id: &scope.account_id,
            app_id: &scope.app_id,
            limit,
        };
        let response = self.post("/memories/search", &body).await?;
        Ok(self.decode::<SearchResponse>(response).await?.results)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let body = IdsRequest {
            memory_ids: ids,
            state: None,
        };
        self.post("/memories/delete", &body).await?;
        Ok(())
    }

    async fn set_state(&self, ids: &[String], state: MemoryState) -> Result<()> {
        let body = IdsRequest {
            memory_ids: ids,
            state: Some(state),
        };
        self.post("/memories/state", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_engine_is_retryable() {
        // Port 9 (discard) on localhost is closed in test environments
        let config = EngineConfig {
            provider: "http".into(),
            base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
        };
        let engine = HttpMemoryEngine::new(&config).unwrap();
        let scope = EngineScope {
            account_id: "a".into(),
            app_id: "x".into(),
        };
        let err = engine.add("hello", None, &scope).await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }
}
