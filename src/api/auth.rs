use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::{ApiError, Caller, SESSION_COOKIE};
use crate::db;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::identity::{CaptchaAnswer, CodePurpose, Credential, LoginType};
use crate::usage;

pub async fn captcha(State(gateway): State<Gateway>) -> Result<Response, ApiError> {
    let captcha = gateway.identity().issue_captcha().await?;
    Ok(Json(captcha).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub email: String,
    /// `login` (default), `set_password` or `reset_password`.
    pub purpose: Option<String>,
    pub captcha_id: Option<String>,
    pub captcha_answer: Option<String>,
}

pub async fn send_code(
    State(gateway): State<Gateway>,
    Json(req): Json<SendCodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let purpose = match req.purpose.as_deref() {
        None => CodePurpose::Login,
        Some(p) => p.parse().map_err(GatewayError::Validation)?,
    };
    let captcha = match (req.captcha_id, req.captcha_answer) {
        (Some(captcha_id), Some(answer)) => Some(CaptchaAnswer { captcha_id, answer }),
        _ => None,
    };
    gateway.identity().send_code(&req.email, purpose, captcha).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "verification code sent",
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// `email` (default) or an OAuth-style provider (`qq`, `wechat`, `google`, `github`).
    pub login_type: Option<String>,
    pub email: Option<String>,
    pub code: Option<String>,
    pub password: Option<String>,
    /// Provider token for OAuth-style logins.
    pub token: Option<String>,
}

impl LoginRequest {
    fn into_credential(self) -> Result<Credential, GatewayError> {
        let login_type: LoginType = match self.login_type.as_deref() {
            None => LoginType::Email,
            Some(t) => t.parse().map_err(GatewayError::Validation)?,
        };
        if login_type.is_oauth() {
            let token = self
                .token
                .ok_or_else(|| GatewayError::Validation("token is required".into()))?;
            return Ok(Credential::OAuth {
                provider: login_type,
                token,
            });
        }
        if login_type != LoginType::Email {
            return Err(GatewayError::Validation(format!(
                "{login_type} accounts cannot log in interactively"
            )));
        }
        let email = self
            .email
            .ok_or_else(|| GatewayError::Validation("email is required".into()))?;
        match (self.code, self.password) {
            (Some(code), _) => Ok(Credential::EmailCode { email, code }),
            (None, Some(password)) => Ok(Credential::EmailPassword { email, password }),
            (None, None) => Err(GatewayError::Validation(
                "either code or password is required".into(),
            )),
        }
    }
}

pub async fn login(
    State(gateway): State<Gateway>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let credential = req.into_credential()?;
    let outcome = gateway.identity().login(credential).await?;

    let max_age = gateway.config().auth.session_ttl_days * 24 * 3600;
    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}",
        outcome.session_token
    );
    let body = Json(serde_json::json!({
        "status": "success",
        "user_id": outcome.account.user_id,
        "display_name": outcome.account.display_name,
        "session_token": outcome.session_token,
        "created": outcome.created,
    }));
    Ok(([(header::SET_COOKIE, cookie)], body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

pub async fn set_password(
    State(gateway): State<Gateway>,
    Json(req): Json<SetPasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gateway
        .identity()
        .set_password(&req.email, &req.code, &req.new_password)
        .await?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

pub async fn profile(
    State(gateway): State<Gateway>,
    Caller(account): Caller,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = gateway.config().billing.clone();
    let owner = account.clone();
    let plan = db::run(gateway.db(), move |conn| usage::get_plan(conn, &owner, &billing)).await?;
    Ok(Json(serde_json::json!({
        "user_id": account.user_id,
        "display_name": account.display_name,
        "email": account.email,
        "created_at": account.created_at,
        "last_login_at": account.last_login_at,
        "plan": plan,
    })))
}
