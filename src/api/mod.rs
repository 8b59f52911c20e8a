//! REST surface.
//!
//! Every handler funnels through the same library operations as the streaming
//! gateway. Errors leave as `{status: "error", code, message, retryable}` with
//! an HTTP status derived from the error's code.

pub mod apps;
pub mod auth;
pub mod devices;
pub mod keys;
pub mod memories;
pub mod stats;

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{AuthError, GatewayError};
use crate::gateway::{ws, Gateway};
use crate::identity::api_keys::API_KEY_PREFIX;
use crate::identity::{Account, Credential};

/// Cookie carrying a browser session token.
pub const SESSION_COOKIE: &str = "memgate_session";

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/captcha", post(auth::captcha))
        .route("/auth/send-code", post(auth::send_code))
        .route("/auth/login", post(auth::login))
        .route("/auth/set-password", post(auth::set_password))
        .route("/auth/profile", get(auth::profile))
        .route("/auth/bind-mac", post(devices::bind_mac))
        .route("/auth/bind-endpoint", post(devices::bind_endpoint))
        .route("/auth/auto-bind", post(devices::auto_bind))
        .route("/auth/unbind-mac", delete(devices::unbind_mac))
        .route("/auth/unbind-endpoint", delete(devices::unbind_endpoint))
        .route("/auth/user/{user_id}/devices", get(devices::list_devices))
        .route("/auth/device-owner", get(devices::device_owner))
        .route("/apps", get(apps::list_apps))
        .route("/apps/resolve", post(apps::resolve_app))
        .route("/apps/{app_id}/active", put(apps::set_active))
        .route("/apps/{app_id}", delete(apps::delete_app))
        .route("/memories/actions/update-state", post(memories::update_state))
        .route("/memories/actions/delete", post(memories::delete_memories))
        .route("/memories/{memory_id}/access-log", get(memories::access_log))
        .route("/stats/usage", get(stats::usage))
        .route("/api-keys", post(keys::create_key).get(keys::list_keys))
        .route("/api-keys/{key_id}", delete(keys::revoke_key))
        .route("/gateway/ws", get(ws::gateway_ws))
        .with_state(gateway)
}

async fn health(
    axum::extract::State(gateway): axum::extract::State<Gateway>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = crate::db::run(gateway.db(), |conn| {
        crate::db::check_database_health(conn).map_err(|e| GatewayError::Internal(e.to_string()))
    })
    .await?;
    Ok(Json(serde_json::json!({
        "status": if report.integrity_ok { "ok" } else { "degraded" },
        "schema_version": report.schema_version,
    })))
}

#[derive(Debug)]
pub enum ApiError {
    Gateway(GatewayError),
    /// `user_id` in the request names someone other than the caller.
    Forbidden(String),
    /// A bind lost to another account; echoes the identifier under its field name.
    BindConflict {
        field: &'static str,
        identifier: String,
    },
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::Gateway(e.into())
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Auth(AuthError::AccountNotFound) => StatusCode::NOT_FOUND,
        GatewayError::Auth(AuthError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Auth(AuthError::CaptchaRequired) => StatusCode::BAD_REQUEST,
        GatewayError::Auth(AuthError::Forbidden) => StatusCode::FORBIDDEN,
        GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
        GatewayError::BindConflict { .. }
        | GatewayError::ApplicationPaused(_)
        | GatewayError::ApplicationNotEmpty(_)
        | GatewayError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        GatewayError::NotBound(_) | GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::ForbiddenApplication(_) => StatusCode::FORBIDDEN,
        GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::Storage(_) | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Gateway(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(code = err.code(), error = %err, "request failed");
                }
                let mut body = serde_json::json!({
                    "status": "error",
                    "code": err.code(),
                    "message": err.user_message(),
                    "retryable": err.is_retryable(),
                });
                if let Some(at) = err.resets_at() {
                    body["resets_at"] = serde_json::json!(at);
                }
                if let GatewayError::Auth(AuthError::RateLimited { retry_after_secs }) = err {
                    body["retry_after_secs"] = serde_json::json!(retry_after_secs);
                }
                (status, Json(body)).into_response()
            }
            Self::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "status": "error",
                    "code": "forbidden",
                    "message": message,
                    "retryable": false,
                })),
            )
                .into_response(),
            Self::BindConflict { field, identifier } => {
                let mut body = serde_json::json!({
                    "status": "error",
                    "code": "bind_conflict",
                    "message": "already bound to another account",
                    "retryable": false,
                });
                body[field] = serde_json::json!(identifier);
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
        }
    }
}

/// `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

fn query_api_key(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "api_key")
        .map(|(_, v)| v.into_owned())
}

fn token_credential(token: String) -> Credential {
    if token.starts_with(API_KEY_PREFIX) {
        Credential::ApiKey(token)
    } else {
        Credential::Session(token)
    }
}

/// Credential presented with a request: bearer token, then `?api_key=`, then cookie.
fn request_credential(parts: &Parts) -> Option<Credential> {
    if let Some(token) = bearer_token(&parts.headers) {
        Some(token_credential(token))
    } else if let Some(key) = query_api_key(parts) {
        Some(Credential::ApiKey(key))
    } else {
        session_cookie(&parts.headers).map(Credential::Session)
    }
}

/// The authenticated account behind a REST request.
pub struct Caller(pub Account);

impl FromRequestParts<Gateway> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, gateway: &Gateway) -> Result<Self, Self::Rejection> {
        let credential = request_credential(parts).ok_or(AuthError::InvalidCredential)?;
        let account = gateway.identity().resolve(credential).await?;
        Ok(Caller(account))
    }
}

/// `Option<Caller>`: `None` when no credential was sent. A credential that
/// fails to resolve is still rejected.
impl OptionalFromRequestParts<Gateway> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        gateway: &Gateway,
    ) -> Result<Option<Self>, Self::Rejection> {
        let Some(credential) = request_credential(parts) else {
            return Ok(None);
        };
        let account = gateway.identity().resolve(credential).await?;
        Ok(Some(Caller(account)))
    }
}

impl Caller {
    /// Reject a `user_id` that names another account. Absent means "me".
    pub fn check_user(&self, user_id: Option<&str>) -> Result<(), ApiError> {
        match user_id {
            Some(id) if id != self.0.user_id => Err(ApiError::Forbidden(format!(
                "user_id {id} does not match the authenticated account"
            ))),
            _ => Ok(()),
        }
    }
}

/// `?user_id=` on routes that accept it.
#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_and_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-memgate-x"));
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; memgate_session=tok123"),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-memgate-x"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("tok123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            status_for(&GatewayError::BindConflict { device: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AuthError::InvalidCredential.into()),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&GatewayError::UpstreamUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
