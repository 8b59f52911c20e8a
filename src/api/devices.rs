use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use super::{ApiError, Caller, UserQuery};
use crate::binding::{self, BindOutcome, DeviceId, DeviceSummary};
use crate::db;
use crate::gateway::Gateway;

#[derive(Debug, Deserialize)]
pub struct BindMacRequest {
    pub mac_address: String,
    pub device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindEndpointRequest {
    pub endpoint_url: String,
    pub device_name: Option<String>,
}

/// Render a bind outcome. Conflicts become a 409 that still names the identifier.
fn bind_response(
    outcome: BindOutcome,
    field: &'static str,
    identifier: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = outcome.status();
    match outcome {
        BindOutcome::Success { application } | BindOutcome::AlreadyBound { application } => {
            let mut body = serde_json::json!({
                "status": status,
                "app_id": application.id,
                "device_name": application.name,
                "bound_at": application.bound_at,
            });
            body[field] = serde_json::json!(identifier);
            Ok(Json(body))
        }
        BindOutcome::Conflict { .. } => Err(ApiError::BindConflict { field, identifier }),
    }
}

async fn bind_device(
    gateway: &Gateway,
    caller: Caller,
    device: DeviceId,
    device_name: Option<String>,
) -> Result<BindOutcome, ApiError> {
    let account_id = caller.0.id;
    let outcome = db::run(gateway.db(), move |conn| {
        binding::bind(conn, &account_id, &device, device_name.as_deref(), Utc::now())
    })
    .await?;
    Ok(outcome)
}

pub async fn bind_mac(
    State(gateway): State<Gateway>,
    caller: Caller,
    Query(q): Query<UserQuery>,
    Json(req): Json<BindMacRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.check_user(q.user_id.as_deref())?;
    let device = DeviceId::mac(&req.mac_address)?;
    let identifier = device.key();
    let outcome = bind_device(&gateway, caller, device, req.device_name).await?;
    bind_response(outcome, "mac_address", identifier)
}

pub async fn bind_endpoint(
    State(gateway): State<Gateway>,
    caller: Caller,
    Query(q): Query<UserQuery>,
    Json(req): Json<BindEndpointRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.check_user(q.user_id.as_deref())?;
    let device = DeviceId::endpoint(&req.endpoint_url)?;
    let identifier = device.key();
    let outcome = bind_device(&gateway, caller, device, req.device_name).await?;
    bind_response(outcome, "endpoint_url", identifier)
}

#[derive(Debug, Deserialize)]
pub struct AutoBindQuery {
    pub user_id: String,
    pub device_identifier: String,
    pub device_name: Option<String>,
    #[serde(default)]
    pub auto_create_user: bool,
}

/// Device provisioning: bind to a named user, optionally creating it.
///
/// Without a credential this can only claim a user id that does not exist yet.
pub async fn auto_bind(
    State(gateway): State<Gateway>,
    caller: Option<Caller>,
    Query(q): Query<AutoBindQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device = DeviceId::parse(&q.device_identifier)?;
    let identifier = device.key();
    let user_id = q.user_id.clone();
    let caller_user_id = caller.map(|c| c.0.user_id);
    let (account, created, outcome) = db::run(gateway.db(), move |conn| {
        let created = crate::identity::accounts::find_by_user_id(conn, &user_id)?.is_none();
        let (account, outcome) = binding::auto_bind(
            conn,
            &user_id,
            caller_user_id.as_deref(),
            &device,
            q.device_name.as_deref(),
            q.auto_create_user,
            Utc::now(),
        )?;
        Ok((account, created, outcome))
    })
    .await?;

    let mut response = bind_response(outcome, "device_identifier", identifier)?;
    response.0["user_id"] = serde_json::json!(account.user_id);
    if created && response.0["status"] == "success" {
        response.0["status"] = serde_json::json!("user_created");
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct UnbindMacQuery {
    pub user_id: Option<String>,
    pub mac_address: String,
}

#[derive(Debug, Deserialize)]
pub struct UnbindEndpointQuery {
    pub user_id: Option<String>,
    pub endpoint_url: String,
}

async fn unbind_device(
    gateway: &Gateway,
    caller: Caller,
    device: DeviceId,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account_id = caller.0.id;
    let app = db::run(gateway.db(), move |conn| {
        binding::unbind(conn, &account_id, &device, Utc::now())
    })
    .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "app_id": app.id,
    })))
}

pub async fn unbind_mac(
    State(gateway): State<Gateway>,
    caller: Caller,
    Query(q): Query<UnbindMacQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.check_user(q.user_id.as_deref())?;
    let device = DeviceId::mac(&q.mac_address)?;
    unbind_device(&gateway, caller, device).await
}

pub async fn unbind_endpoint(
    State(gateway): State<Gateway>,
    caller: Caller,
    Query(q): Query<UnbindEndpointQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.check_user(q.user_id.as_deref())?;
    let device = DeviceId::endpoint(&q.endpoint_url)?;
    unbind_device(&gateway, caller, device).await
}

pub async fn list_devices(
    State(gateway): State<Gateway>,
    caller: Caller,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.check_user(Some(&user_id))?;
    let account_id = caller.0.id;
    let apps = db::run(gateway.db(), move |conn| binding::list_devices(conn, &account_id)).await?;
    let devices: Vec<DeviceSummary> = apps.iter().map(DeviceSummary::from).collect();
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "total_devices": devices.len(),
        "devices": devices,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeviceOwnerQuery {
    /// MAC address, endpoint URL, or `agent:<id>`.
    pub device: String,
}

pub async fn device_owner(
    State(gateway): State<Gateway>,
    _caller: Caller,
    Query(q): Query<DeviceOwnerQuery>,
) -> Result<Json<binding::DeviceOwner>, ApiError> {
    let device = DeviceId::parse(&q.device)?;
    let owner = db::run(gateway.db(), move |conn| binding::device_owner(conn, &device)).await?;
    Ok(Json(owner))
}
