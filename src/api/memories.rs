use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::{ApiError, Caller};
use crate::db;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::memory::{self, MemoryState};
use crate::usage;

#[derive(Debug, Deserialize)]
pub struct UpdateStateRequest {
    pub memory_ids: Vec<String>,
    /// `active`, `paused`, `archived` or `deleted`.
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub memory_ids: Vec<String>,
}

pub async fn update_state(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Json(req): Json<UpdateStateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state: MemoryState = req.state.parse().map_err(GatewayError::Validation)?;
    let changed = gateway
        .update_memory_state(&account, req.memory_ids, state)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "state": state,
        "updated": changed.len(),
        "memory_ids": changed,
    })))
}

pub async fn delete_memories(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Json(req): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = gateway
        .update_memory_state(&account, req.memory_ids, MemoryState::Deleted)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "deleted": deleted.len(),
        "memory_ids": deleted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AccessLogQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    10
}

pub const MAX_PAGE_SIZE: u64 = 100;

/// Audit view of one memory: its access log (newest first) and state history.
/// Memories owned by other accounts are reported as not found.
pub async fn access_log(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Path(memory_id): Path<String>,
    Query(q): Query<AccessLogQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if q.page == 0 || q.page_size == 0 || q.page_size > MAX_PAGE_SIZE {
        return Err(GatewayError::Validation(format!(
            "page must be >= 1 and page_size within 1..={MAX_PAGE_SIZE}"
        ))
        .into());
    }
    let offset = (q.page - 1) * q.page_size;
    let limit = q.page_size;
    let (memory, page, history) = db::run(gateway.db(), move |conn| {
        let memory = memory::get_ref(conn, &memory_id)?
            .filter(|m| m.account_id == account.id)
            .ok_or_else(|| GatewayError::NotFound(format!("memory {memory_id}")))?;
        let page = usage::memory_access_log(conn, &memory_id, offset, limit)?;
        let history = memory::state_history(conn, &memory_id)?;
        Ok((memory, page, history))
    })
    .await?;

    Ok(Json(serde_json::json!({
        "memory_id": memory.id,
        "state": memory.state,
        "app_id": memory.app_id,
        "total": page.total,
        "page": q.page,
        "page_size": q.page_size,
        "logs": page.entries,
        "state_history": history,
    })))
}
