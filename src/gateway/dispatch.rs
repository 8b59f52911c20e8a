//! Tool calls and their execution.

use chrono::Utc;
use serde::Serialize;

use super::{BoundSession, Gateway};
use crate::binding::{self, DeviceSummary};
use crate::db::{self, timestamp};
use crate::engine::EngineHit;
use crate::error::{GatewayError, Result};
use crate::memory::{self, MemoryRef, MemoryState};
use crate::scope;
use crate::tools::add_memory::AddMemoryParams;
use crate::tools::list_devices::ListDevicesParams;
use crate::tools::search_memory::SearchMemoryParams;
use crate::usage::{self, AccessEvent, AccessKind};

/// Characters of memory text echoed into access log metadata.
const ECHO_CHARS: usize = 200;

/// One validated-on-execute tool invocation.
#[derive(Debug, Clone)]
pub enum ToolCall {
    AddMemory(AddMemoryParams),
    SearchMemory(SearchMemoryParams),
    ListDevices(ListDevicesParams),
}

impl ToolCall {
    /// Decode a named tool call from its JSON arguments. `null` arguments are
    /// treated as an empty object.
    pub fn parse(tool: &str, arguments: serde_json::Value) -> Result<Self> {
        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        match tool {
            "add_memory" => Ok(Self::AddMemory(serde_json::from_value(arguments)?)),
            "search_memory" => Ok(Self::SearchMemory(serde_json::from_value(arguments)?)),
            "list_devices" => Ok(Self::ListDevices(serde_json::from_value(arguments)?)),
            other => Err(GatewayError::Validation(format!(
                "unknown tool: {other}. Available: add_memory, search_memory, list_devices"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddMemory(_) => "add_memory",
            Self::SearchMemory(_) => "search_memory",
            Self::ListDevices(_) => "list_devices",
        }
    }

    pub fn kind(&self) -> AccessKind {
        match self {
            Self::AddMemory(_) => AccessKind::Add,
            Self::SearchMemory(_) => AccessKind::Search,
            Self::ListDevices(_) => AccessKind::List,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::AddMemory(p) => p.validate(),
            Self::SearchMemory(p) => p.validate(),
            Self::ListDevices(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Added {
        memory: MemoryRef,
    },
    Found {
        results: Vec<EngineHit>,
    },
    Devices {
        total_devices: usize,
        devices: Vec<DeviceSummary>,
    },
}

impl Gateway {
    /// Execute one call for a bound session.
    ///
    /// Validation, the paused-application check and the quota check all happen
    /// before the engine is contacted. Only calls that complete are metered.
    pub async fn call(&self, session: &BoundSession, call: ToolCall) -> Result<ToolOutput> {
        call.validate()?;

        let account = session.account.clone();
        let app_id = session.application.id.clone();
        let billing = self.config().billing.clone();
        let needs_active = matches!(call, ToolCall::AddMemory(_));
        db::run(self.db(), move |conn| {
            if needs_active {
                let app = scope::get_application(conn, &app_id)?
                    .ok_or_else(|| GatewayError::ForbiddenApplication(app_id.clone()))?;
                if !app.is_active {
                    return Err(GatewayError::ApplicationPaused(app_id));
                }
            }
            usage::check_quota(conn, &account, &billing, Utc::now())?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            tool = call.name(),
            account = %session.account.id,
            app = %session.application.id,
            "tool call"
        );

        match call {
            ToolCall::AddMemory(params) => self.add_memory(session, params).await,
            ToolCall::SearchMemory(params) => self.search_memory(session, params).await,
            ToolCall::ListDevices(_) => self.list_devices(session).await,
        }
    }

    async fn add_memory(&self, session: &BoundSession, params: AddMemoryParams) -> Result<ToolOutput> {
        let scope = session.engine_scope();
        let metadata = params.metadata.filter(|m| !m.is_null());
        let id = self
            .with_timeout(self.engine.add(&params.text, metadata.as_ref(), &scope))
            .await?;

        let at = session.next_timestamp();
        let (memory_id, account_id, app_id) = (id.clone(), scope.account_id.clone(), scope.app_id.clone());
        let stored = db::run(self.db(), move |conn| {
            let tx = conn.transaction()?;
            memory::insert_ref(&tx, &memory_id, &account_id, &app_id, at)?;
            scope::record_activity(&tx, &app_id, 1, 0, at)?;
            tx.commit()?;
            Ok(())
        })
        .await;
        if let Err(err) = stored {
            self.discard_orphan(&id, &scope.app_id).await;
            return Err(err);
        }

        let echo: String = params.text.chars().take(ECHO_CHARS).collect();
        usage::record_best_effort(
            self.db(),
            vec![AccessEvent {
                account_id: scope.account_id.clone(),
                app_id: scope.app_id.clone(),
                memory_id: Some(id.clone()),
                kind: AccessKind::Add,
                at,
                metadata: Some(serde_json::json!({ "protocol": session.protocol, "text": echo })),
            }],
        )
        .await;

        tracing::info!(memory = %id, app = %scope.app_id, "memory added");
        Ok(ToolOutput::Added {
            memory: MemoryRef {
                id,
                account_id: scope.account_id,
                app_id: scope.app_id,
                state: MemoryState::Active,
                created_at: timestamp(at),
                updated_at: timestamp(at),
            },
        })
    }

    /// The engine holds a memory the gateway failed to record. Remove it so a
    /// retry does not duplicate it; if that fails too, leave the id in the log.
    async fn discard_orphan(&self, memory_id: &str, app_id: &str) {
        let ids = [memory_id.to_string()];
        match self.with_timeout(self.engine.delete(&ids)).await {
            Ok(()) => {
                tracing::warn!(memory = %memory_id, app = %app_id, "reference write failed, engine memory removed")
            }
            Err(e) => tracing::warn!(
                memory = %memory_id,
                app = %app_id,
                error = %e,
                "reference write failed, orphaned engine memory needs reconciliation"
            ),
        }
    }

    async fn search_memory(
        &self,
        session: &BoundSession,
        params: SearchMemoryParams,
    ) -> Result<ToolOutput> {
        let scope = session.engine_scope();
        let limit = params.effective_limit();
        let hits = self
            .with_timeout(self.engine.search(&params.query, limit, &scope))
            .await?;

        let at = session.next_timestamp();
        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let app_id = scope.app_id.clone();
        let hidden = db::run(self.db(), move |conn| {
            let hidden = memory::hidden_ids(conn, &ids)?;
            let visible = ids.len().saturating_sub(hidden.len()) as u64;
            scope::record_activity(conn, &app_id, 0, visible, at)?;
            Ok(hidden)
        })
        .await?;

        let results: Vec<EngineHit> = hits
            .into_iter()
            .filter(|h| !hidden.contains(&h.id))
            .take(limit)
            .collect();

        let returned: Vec<serde_json::Value> = results
            .iter()
            .map(|h| serde_json::json!({ "id": h.id, "score": h.score }))
            .collect();
        usage::record_best_effort(
            self.db(),
            vec![AccessEvent {
                account_id: scope.account_id.clone(),
                app_id: scope.app_id.clone(),
                memory_id: None,
                kind: AccessKind::Search,
                at,
                metadata: Some(serde_json::json!({
                    "protocol": session.protocol,
                    "query": params.query,
                    "results": returned,
                })),
            }],
        )
        .await;

        Ok(ToolOutput::Found { results })
    }

    async fn list_devices(&self, session: &BoundSession) -> Result<ToolOutput> {
        let account_id = session.account.id.clone();
        let devices = db::run(self.db(), move |conn| binding::list_devices(conn, &account_id)).await?;
        let devices: Vec<DeviceSummary> = devices.iter().map(DeviceSummary::from).collect();

        usage::record_best_effort(
            self.db(),
            vec![AccessEvent {
                account_id: session.account.id.clone(),
                app_id: session.application.id.clone(),
                memory_id: None,
                kind: AccessKind::List,
                at: session.next_timestamp(),
                metadata: Some(serde_json::json!({ "protocol": session.protocol })),
            }],
        )
        .await;

        Ok(ToolOutput::Devices {
            total_devices: devices.len(),
            devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_tools() {
        let call = ToolCall::parse("add_memory", serde_json::json!({ "text": "hello" })).unwrap();
        assert_eq!(call.kind(), AccessKind::Add);
        let call = ToolCall::parse("search_memory", serde_json::json!({ "query": "hi" })).unwrap();
        match call {
            ToolCall::SearchMemory(p) => assert_eq!(p.effective_limit(), 5),
            other => panic!("unexpected call {other:?}"),
        }
        let call = ToolCall::parse("list_devices", serde_json::Value::Null).unwrap();
        assert_eq!(call.name(), "list_devices");
    }

    #[test]
    fn malformed_calls_are_validation_errors() {
        let err = ToolCall::parse("drop_tables", serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "validation_error");
        let err = ToolCall::parse("add_memory", serde_json::json!({ "txt": "typo" })).unwrap_err();
        assert_eq!(err.code(), "validation_error");

        let empty = ToolCall::parse("add_memory", serde_json::json!({ "text": "   " })).unwrap();
        assert!(empty.validate().is_err());
        let bad_limit =
            ToolCall::parse("search_memory", serde_json::json!({ "query": "q", "limit": 0 })).unwrap();
        assert!(bad_limit.validate().is_err());
        let bad_meta = ToolCall::parse(
            "add_memory",
            serde_json::json!({ "text": "ok", "metadata": [1, 2] }),
        )
        .unwrap();
        assert!(bad_meta.validate().is_err());
    }
}
