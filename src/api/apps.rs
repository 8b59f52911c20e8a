use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use super::{ApiError, Caller};
use crate::binding::DeviceId;
use crate::db;
use crate::gateway::Gateway;
use crate::scope::{self, Application, ScopeRequest};

pub async fn list_apps(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    let apps = db::run(gateway.db(), move |conn| scope::list_applications(conn, &account.id)).await?;
    Ok(Json(serde_json::json!({
        "total": apps.len(),
        "apps": apps,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub app_id: Option<String>,
    /// MAC address, endpoint URL, or `agent:<id>`.
    pub device: Option<String>,
    pub app_name: Option<String>,
}

/// Resolve the application a caller would write into, creating client apps as needed.
pub async fn resolve_app(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Application>, ApiError> {
    let request = ScopeRequest {
        app_id: req.app_id,
        device: req.device.as_deref().map(DeviceId::parse).transpose()?,
        app_name: req.app_name,
    };
    let app = db::run(gateway.db(), move |conn| {
        scope::resolve_scope(conn, &account, &request, Utc::now())
    })
    .await?;
    Ok(Json(app))
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub is_active: bool,
}

pub async fn set_active(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Path(app_id): Path<String>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<Application>, ApiError> {
    let app = db::run(gateway.db(), move |conn| {
        scope::set_active(conn, &account.id, &app_id, req.is_active, Utc::now())
    })
    .await?;
    Ok(Json(app))
}

pub async fn delete_app(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Path(app_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = app_id.clone();
    db::run(gateway.db(), move |conn| {
        scope::delete_application(conn, &account.id, &app_id)
    })
    .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "app_id": deleted,
    })))
}
