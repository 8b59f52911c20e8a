//! Error taxonomy shared by every gateway surface.
//!
//! [`GatewayError`] is what library operations return. Each variant has a stable
//! machine [`code`](GatewayError::code) that the REST layer and the streaming
//! gateway put on the wire, so callers can branch without parsing messages.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Authentication failures. At the streaming gateway these terminate the connection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("account not found")]
    AccountNotFound,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("verification code expired")]
    VerificationExpired,
    #[error("too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("a solved captcha is required for this request")]
    CaptchaRequired,
    #[error("device is not bound to any account")]
    UnboundDevice,
    #[error("credential does not belong to the named account")]
    Forbidden,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountNotFound => "account_not_found",
            Self::InvalidCredential => "invalid_credential",
            Self::VerificationExpired => "verification_expired",
            Self::RateLimited { .. } => "rate_limited",
            Self::CaptchaRequired => "captcha_required",
            Self::UnboundDevice => "unbound_device",
            Self::Forbidden => "forbidden",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{device} is already bound to another account")]
    BindConflict { device: String },

    #[error("{0} is not bound to this account")]
    NotBound(String),

    #[error("application {0} is not owned by the caller")]
    ForbiddenApplication(String),

    #[error("application {0} is paused")]
    ApplicationPaused(String),

    #[error("application {0} still owns memories")]
    ApplicationNotEmpty(String),

    #[error("quota exceeded: {used}/{limit} requests this cycle")]
    QuotaExceeded {
        used: u64,
        limit: u64,
        resets_at: Option<DateTime<Utc>>,
    },

    #[error("memory engine unavailable, try again: {0}")]
    UpstreamUnavailable(String),

    #[error("memory engine did not answer within {0:?}, try again")]
    UpstreamTimeout(Duration),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot move memory from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::BindConflict { .. } => "bind_conflict",
            Self::NotBound(_) => "not_bound",
            Self::ForbiddenApplication(_) => "forbidden_application",
            Self::ApplicationPaused(_) => "application_paused",
            Self::ApplicationNotEmpty(_) => "application_not_empty",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the same call may succeed later without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. }
                | Self::UpstreamUnavailable(_)
                | Self::UpstreamTimeout(_)
                | Self::Auth(AuthError::RateLimited { .. })
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Reset time for quota errors, if known.
    pub fn resets_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::QuotaExceeded { resets_at, .. } => *resets_at,
            _ => None,
        }
    }

    /// Message shown to end users.
    pub fn user_message(&self) -> String {
        match self {
            Self::BindConflict { .. } => "already bound to another account".to_string(),
            Self::QuotaExceeded { resets_at: Some(at), .. } => {
                format!("usage quota exhausted, resets at {}", at.to_rfc3339())
            }
            Self::QuotaExceeded { resets_at: None, .. } => "usage quota exhausted".to_string(),
            Self::UpstreamUnavailable(_) | Self::UpstreamTimeout(_) => {
                "memory service is busy, try again".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = GatewayError::BindConflict {
            device: "aa:bb:cc:dd:ee:ff".into(),
        };
        assert_eq!(err.code(), "bind_conflict");
        assert_eq!(err.user_message(), "already bound to another account");
        assert_eq!(
            GatewayError::from(AuthError::VerificationExpired).code(),
            "verification_expired"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(GatewayError::UpstreamTimeout(Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::QuotaExceeded {
            used: 10,
            limit: 10,
            resets_at: None
        }
        .is_retryable());
        assert!(!GatewayError::Validation("empty".into()).is_retryable());
        assert!(!GatewayError::from(AuthError::InvalidCredential).is_retryable());
    }

    #[test]
    fn quota_message_includes_reset_time() {
        let at = "2026-11-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let err = GatewayError::QuotaExceeded {
            used: 100,
            limit: 100,
            resets_at: Some(at),
        };
        assert!(err.user_message().contains("2026-11-01"));
        assert_eq!(err.resets_at(), Some(at));
    }
}
