use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use super::{ApiError, Caller};
use crate::db;
use crate::gateway::Gateway;
use crate::identity::api_keys::{self, ApiKeyInfo};

#[derive(Debug, Default, Deserialize)]
pub struct CreateKeyRequest {
    pub name: Option<String>,
}

/// The plaintext key is only ever returned here.
pub async fn create_key(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Json(req): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (info, key) = db::run(gateway.db(), move |conn| {
        api_keys::create_api_key(conn, &account.id, req.name.as_deref(), Utc::now())
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "key": key,
            "info": info,
        })),
    ))
}

pub async fn list_keys(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
) -> Result<Json<Vec<ApiKeyInfo>>, ApiError> {
    let keys = db::run(gateway.db(), move |conn| api_keys::list_api_keys(conn, &account.id)).await?;
    Ok(Json(keys))
}

pub async fn revoke_key(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
    Path(key_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revoked = key_id.clone();
    db::run(gateway.db(), move |conn| {
        api_keys::revoke_api_key(conn, &account.id, &key_id, Utc::now())
    })
    .await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "key_id": revoked,
    })))
}
