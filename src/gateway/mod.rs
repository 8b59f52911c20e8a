//! Protocol gateway: binds connections to a scope and serves tool calls.
//!
//! [`Gateway`] is transport-agnostic. The WebSocket transport ([`ws`]) and the
//! MCP stdio surface (`crate::tools`) both authenticate through
//! [`Gateway::open_session`] and push every call through [`Gateway::call`],
//! which owns validation, quota, the engine timeout, and metering.

pub mod dispatch;
pub mod session;
pub mod ws;

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;

pub use dispatch::{ToolCall, ToolOutput};
pub use session::{BoundSession, ConnectionState};

use crate::config::GatewayConfig;
use crate::db::{self, Db};
use crate::engine::MemoryEngine;
use crate::error::{GatewayError, Result};
use crate::identity::{Account, Credential, IdentityService};
use crate::memory::{self, MemoryState};
use crate::scope::{self, ScopeRequest};
use crate::usage::{self, AccessEvent, AccessKind};

/// Shared gateway state. Cheap to clone; one instance serves every connection.
#[derive(Clone)]
pub struct Gateway {
    db: Db,
    engine: Arc<dyn MemoryEngine>,
    identity: IdentityService,
    config: Arc<GatewayConfig>,
}

impl Gateway {
    pub fn new(
        db: Db,
        engine: Arc<dyn MemoryEngine>,
        identity: IdentityService,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            db,
            engine,
            identity,
            config,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// `Authenticating → Bound`: resolve the caller, then its scope, once.
    ///
    /// A device credential with no explicit device in `scope` is scoped to that
    /// device's own application.
    pub async fn open_session(
        &self,
        credential: Credential,
        mut scope: ScopeRequest,
        protocol: &'static str,
    ) -> Result<Arc<BoundSession>> {
        if let (Credential::Device(device), None) = (&credential, &scope.device) {
            scope.device = Some(device.clone());
        }

        let account = self.identity.resolve(credential).await?;
        let owner = account.clone();
        let application = db::run(&self.db, move |conn| {
            scope::resolve_scope(conn, &owner, &scope, Utc::now())
        })
        .await?;

        tracing::info!(
            account = %account.id,
            app = %application.id,
            protocol,
            "session bound"
        );
        Ok(Arc::new(BoundSession::new(account, application, protocol)))
    }

    /// Run an engine round trip under the per-call timeout.
    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.server.call_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "engine call timed out");
                Err(GatewayError::UpstreamTimeout(limit))
            }
        }
    }

    /// Move memories to `to` on behalf of `account`.
    ///
    /// Ownership and legality of every move are checked before the engine is
    /// touched. Returns the ids that actually changed; same-state moves are no-ops.
    pub async fn update_memory_state(
        &self,
        account: &Account,
        ids: Vec<String>,
        to: MemoryState,
    ) -> Result<Vec<String>> {
        let account_id = account.id.clone();
        let plan = db::run(&self.db, move |conn| {
            memory::plan_transition(conn, &account_id, &ids, to)
        })
        .await?;
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let moving: Vec<String> = plan.iter().map(|m| m.id.clone()).collect();
        if to == MemoryState::Deleted {
            self.with_timeout(self.engine.delete(&moving)).await?;
        } else {
            self.with_timeout(self.engine.set_state(&moving, to)).await?;
        }

        let now = Utc::now();
        let changed_by = account.id.clone();
        let committed = plan.clone();
        db::run(&self.db, move |conn| {
            memory::commit_transition(conn, &changed_by, &committed, to, now)
        })
        .await?;

        if to == MemoryState::Deleted {
            let events = plan
                .into_iter()
                .map(|m| AccessEvent {
                    account_id: account.id.clone(),
                    app_id: m.app_id,
                    memory_id: Some(m.id),
                    kind: AccessKind::Delete,
                    at: now,
                    metadata: Some(serde_json::json!({ "protocol": "rest" })),
                })
                .collect();
            usage::record_best_effort(&self.db, events).await;
        }

        Ok(moving)
    }
}
