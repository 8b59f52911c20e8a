//! In-process memory engine for development and tests.
//!
//! Scores by token overlap with the query. Can be switched to behave like an
//! unreachable or slow upstream.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{EngineHit, EngineScope, MemoryEngine};
use crate::error::{GatewayError, Result};
use crate::memory::MemoryState;

#[derive(Debug, Clone)]
struct StoredMemory {
    id: String,
    account_id: String,
    app_id: String,
    text: String,
    state: MemoryState,
}

#[derive(Default)]
pub struct LocalEngine {
    memories: Mutex<Vec<StoredMemory>>,
    unavailable: AtomicBool,
    delay_ms: AtomicU64,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `UpstreamUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call, to exercise call timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.memories.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn gate(&self) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::UpstreamUnavailable(
                "local engine switched off".into(),
            ));
        }
        Ok(())
    }

    fn store(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredMemory>>> {
        self.memories
            .lock()
            .map_err(|e| GatewayError::Internal(format!("engine lock poisoned: {e}")))
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemoryEngine for LocalEngine {
    async fn add(
        &self,
        text: &str,
        _metadata: Option<&serde_json::Value>,
        scope: &EngineScope,
    ) -> Result<String> {
        self.gate().await?;
        let id = uuid::Uuid::now_v7().to_string();
        self.store()?.push(StoredMemory {
            id: id.clone(),
            account_id: scope.account_id.clone(),
            app_id: scope.app_id.clone(),
            text: text.to_string(),
            state: MemoryState::Active,
        });
        Ok(id)
    }

    async fn search(&self, query: &str, limit: usize, scope: &EngineScope) -> Result<Vec<EngineHit>> {
        self.gate().await?;
        let query = tokens(query);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let memories = self.store()?;
        let mut hits: Vec<EngineHit> = memories
            .iter()
            .filter(|m| m.account_id == scope.account_id && m.state == MemoryState::Active)
            .filter_map(|m| {
                let overlap = tokens(&m.text).intersection(&query).count();
                (overlap > 0).then(|| EngineHit {
                    id: m.id.clone(),
                    text: m.text.clone(),
                    score: overlap as f32 / query.len() as f32,
                    app_id: Some(m.app_id.clone()),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| b.id.cmp(&a.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.gate().await?;
        self.store()?.retain(|m| !ids.contains(&m.id));
        Ok(())
    }

    async fn set_state(&self, ids: &[String], state: MemoryState) -> Result<()> {
        self.gate().await?;
        for memory in self.store()?.iter_mut().filter(|m| ids.contains(&m.id)) {
            memory.state = state;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(account: &str) -> EngineScope {
        EngineScope {
            account_id: account.into(),
            app_id: "app".into(),
        }
    }

    #[tokio::test]
    async fn search_ranks_by_overlap_and_scopes_by_account() {
        let engine = LocalEngine::new();
        engine.add("likes green tea in the morning", None, &scope("a")).await.unwrap();
        engine.add("green sofa", None, &scope("a")).await.unwrap();
        engine.add("green tea too", None, &scope("b")).await.unwrap();

        let hits = engine.search("green tea", 5, &scope("a")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("tea"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn paused_memories_are_not_returned() {
        let engine = LocalEngine::new();
        let id = engine.add("walks the dog", None, &scope("a")).await.unwrap();
        engine.set_state(&[id.clone()], MemoryState::Paused).await.unwrap();
        assert!(engine.search("dog", 5, &scope("a")).await.unwrap().is_empty());
        engine.delete(&[id]).await.unwrap();
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn unavailable_switch() {
        let engine = LocalEngine::new();
        engine.set_unavailable(true);
        let err = engine.add("x", None, &scope("a")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code(), "upstream_unavailable");
    }
}
