//! External memory engine collaborator.
//!
//! Extraction, embedding and similarity search happen behind [`MemoryEngine`].
//! The gateway only forwards validated `(account, application)` context. The
//! engine is created via [`create_engine`] from configuration.

pub mod http;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::memory::MemoryState;

/// Who a call is on behalf of.
#[derive(Debug, Clone, Serialize)]
pub struct EngineScope {
    pub account_id: String,
    pub app_id: String,
}

/// A search result as returned by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHit {
    pub id: String,
    #[serde(alias = "memory")]
    pub text: String,
    pub score: f32,
    pub app_id: Option<String>,
}

/// Operations the gateway needs from the engine. Failures must map onto
/// `UpstreamUnavailable`, `UpstreamTimeout`, or `Validation`.
#[async_trait]
pub trait MemoryEngine: Send + Sync {
    /// Store a memory; returns the engine's id for it.
    async fn add(
        &self,
        text: &str,
        metadata: Option<&serde_json::Value>,
        scope: &EngineScope,
    ) -> Result<String>;

    /// Search the account's memories.
    async fn search(&self, query: &str, limit: usize, scope: &EngineScope) -> Result<Vec<EngineHit>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn set_state(&self, ids: &[String], state: MemoryState) -> Result<()>;
}

/// Create the engine named by `config.provider` (`local` or `http`).
pub fn create_engine(config: &EngineConfig) -> anyhow::Result<Arc<dyn MemoryEngine>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(local::LocalEngine::new())),
        "http" => Ok(Arc::new(http::HttpMemoryEngine::new(config)?)),
        other => anyhow::bail!("unknown engine provider: {other}. Supported: local, http"),
    }
}
