//! Per-connection state.
//!
//! A connection walks `Connecting → Authenticating → Bound → Serving → Closed`
//! exactly once. The scope resolved when entering `Bound` is cached in a
//! [`BoundSession`] and never re-resolved; dropping the session releases it.

use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Mutex;

use crate::engine::EngineScope;
use crate::identity::Account;
use crate::scope::Application;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Bound,
    Serving,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Bound => "bound",
            Self::Serving => "serving",
            Self::Closed => "closed",
        }
    }

    /// Legal successor states. Any state may close.
    pub fn can_advance_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Bound)
                | (Bound, Serving)
                | (Connecting | Authenticating | Bound | Serving, Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity and scope a connection is bound to.
#[derive(Debug)]
pub struct BoundSession {
    pub account: Account,
    pub application: Application,
    /// Transport name recorded on every access log entry (`ws`, `mcp`).
    pub protocol: &'static str,
    last_event: Mutex<DateTime<Utc>>,
}

impl BoundSession {
    pub fn new(account: Account, application: Application, protocol: &'static str) -> Self {
        Self {
            account,
            application,
            protocol,
            last_event: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn engine_scope(&self) -> EngineScope {
        EngineScope {
            account_id: self.account.id.clone(),
            app_id: self.application.id.clone(),
        }
    }

    /// Event timestamp strictly greater than the previous one handed out by this
    /// session, at the microsecond precision the access log stores.
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.last_event.lock().unwrap_or_else(|e| e.into_inner());
        let next = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }
}
