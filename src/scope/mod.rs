//! Application scope resolution.
//!
//! An application is the bucket memories are attributed to: a bound device or a
//! named software client. [`resolve_scope`] is the one place that decides which
//! bucket a call lands in, and it never trusts a caller-supplied application id
//! without checking ownership.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::binding::{self, DeviceId};
use crate::db::timestamp;
use crate::error::{GatewayError, Result};
use crate::identity::Account;

/// Name of the application used when a caller declares nothing.
pub const DEFAULT_APP_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    Device,
    Client,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Client => "client",
        }
    }
}

/// A named scope owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Application {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub kind: AppKind,
    /// Bound device key; `None` for clients and for unbound devices.
    pub device_id: Option<String>,
    pub device_kind: Option<String>,
    pub agent_id: Option<i64>,
    pub is_active: bool,
    pub memories_created: u64,
    pub memories_accessed: u64,
    pub bound_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) const APP_COLUMNS: &str = "id, account_id, name, kind, device_id, device_kind, agent_id, \
     is_active, memories_created, memories_accessed, bound_at, created_at, updated_at";

pub(crate) fn app_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Application> {
    let kind: String = row.get(3)?;
    Ok(Application {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        kind: if kind == "device" {
            AppKind::Device
        } else {
            AppKind::Client
        },
        device_id: row.get(4)?,
        device_kind: row.get(5)?,
        agent_id: row.get(6)?,
        is_active: row.get(7)?,
        memories_created: row.get::<_, i64>(8)? as u64,
        memories_accessed: row.get::<_, i64>(9)? as u64,
        bound_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// What a caller says about the scope of its calls. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct ScopeRequest {
    /// Claimed application id; must be owned by the resolved account.
    pub app_id: Option<String>,
    pub device: Option<DeviceId>,
    /// Declared client name, e.g. `"cursor"`.
    pub app_name: Option<String>,
}

/// `resolveScope(account, device_id?, declared_app_name?) -> Application`.
///
/// Order: claimed id, then a bound device, then the declared name, then the
/// account's default application. A device bound to another account is
/// rejected rather than silently falling through.
pub fn resolve_scope(
    conn: &Connection,
    account: &Account,
    request: &ScopeRequest,
    now: DateTime<Utc>,
) -> Result<Application> {
    if let Some(app_id) = &request.app_id {
        return match get_application(conn, app_id)? {
            Some(app) if app.account_id == account.id => Ok(app),
            _ => Err(GatewayError::ForbiddenApplication(app_id.clone())),
        };
    }

    if let Some(device) = &request.device {
        match binding::find_by_device(conn, device)? {
            Some(app) if app.account_id == account.id => return Ok(app),
            Some(_) => return Err(GatewayError::ForbiddenApplication(device.key())),
            None => {
                tracing::debug!(account = %account.id, device = %device, "device not bound, using client scope");
            }
        }
    }

    let name = request
        .app_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_APP_NAME);
    upsert_client_app(conn, &account.id, name, now)
}

/// Deterministic key of a client application. Including the account id keeps
/// two accounts that pick the same generic name apart.
pub fn client_key(account_id: &str, name: &str) -> String {
    format!("{account_id}/{}", name.trim().to_lowercase())
}

/// Find or create the client application `name` for the account.
pub fn upsert_client_app(
    conn: &Connection,
    account_id: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Application> {
    let key = client_key(account_id, name);
    let now_str = timestamp(now);
    let inserted = conn.execute(
        "INSERT INTO applications
             (id, account_id, name, kind, client_key, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'client', ?4, 1, ?5, ?5)
         ON CONFLICT(client_key) DO NOTHING",
        params![uuid::Uuid::now_v7().to_string(), account_id, name.trim(), key, now_str],
    )?;
    if inserted == 1 {
        tracing::info!(account = %account_id, name = %name.trim(), "client application created");
    }

    let sql = format!("SELECT {APP_COLUMNS} FROM applications WHERE client_key = ?1");
    conn.query_row(&sql, params![key], app_from_row)
        .optional()?
        .ok_or_else(|| GatewayError::Internal(format!("client application {key} missing after upsert")))
}

pub fn get_application(conn: &Connection, app_id: &str) -> Result<Option<Application>> {
    let sql = format!("SELECT {APP_COLUMNS} FROM applications WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![app_id], app_from_row)
        .optional()?)
}

/// The application if the account owns it. Missing → `NotFound`, foreign → `ForbiddenApplication`.
pub fn owned_application(conn: &Connection, account_id: &str, app_id: &str) -> Result<Application> {
    match get_application(conn, app_id)? {
        Some(app) if app.account_id == account_id => Ok(app),
        Some(_) => Err(GatewayError::ForbiddenApplication(app_id.to_string())),
        None => Err(GatewayError::NotFound(format!("application {app_id}"))),
    }
}

pub fn list_applications(conn: &Connection, account_id: &str) -> Result<Vec<Application>> {
    let sql = format!(
        "SELECT {APP_COLUMNS} FROM applications WHERE account_id = ?1 ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let apps = stmt
        .query_map(params![account_id], app_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(apps)
}

/// Pause or resume ingestion for an application.
pub fn set_active(
    conn: &Connection,
    account_id: &str,
    app_id: &str,
    active: bool,
    now: DateTime<Utc>,
) -> Result<Application> {
    owned_application(conn, account_id, app_id)?;
    conn.execute(
        "UPDATE applications SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
        params![active, timestamp(now), app_id],
    )?;
    tracing::info!(account = %account_id, app = %app_id, active, "application activity changed");
    owned_application(conn, account_id, app_id)
}

/// Delete an application that owns no live memories and holds no binding.
pub fn delete_application(conn: &mut Connection, account_id: &str, app_id: &str) -> Result<()> {
    let app = owned_application(conn, account_id, app_id)?;
    if let Some(device) = &app.device_id {
        return Err(GatewayError::Validation(format!(
            "application {app_id} is bound to {device}; unbind it first"
        )));
    }

    let tx = conn.transaction()?;
    let live: i64 = tx.query_row(
        "SELECT COUNT(*) FROM memory_refs WHERE app_id = ?1 AND state != 'deleted'",
        params![app_id],
        |row| row.get(0),
    )?;
    if live > 0 {
        return Err(GatewayError::ApplicationNotEmpty(app_id.to_string()));
    }

    tx.execute(
        "DELETE FROM memory_state_history
         WHERE memory_id IN (SELECT id FROM memory_refs WHERE app_id = ?1)",
        params![app_id],
    )?;
    tx.execute("DELETE FROM memory_refs WHERE app_id = ?1", params![app_id])?;
    tx.execute("DELETE FROM applications WHERE id = ?1", params![app_id])?;
    tx.commit()?;

    tracing::info!(account = %account_id, app = %app_id, "application deleted");
    Ok(())
}

/// Bump the per-application counters after a successful engine call.
pub fn record_activity(
    conn: &Connection,
    app_id: &str,
    created: u64,
    accessed: u64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE applications
         SET memories_created = memories_created + ?1,
             memories_accessed = memories_accessed + ?2,
             updated_at = ?3
         WHERE id = ?4",
        params![created as i64, accessed as i64, timestamp(now), app_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::identity::accounts::{upsert_account, LoginType};

    fn account(conn: &mut Connection, user_id: &str) -> Account {
        upsert_account(conn, LoginType::Auto, user_id, None, Utc::now())
            .unwrap()
            .account
    }

    #[test]
    fn same_client_name_is_per_account() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "alpha");
        let b = account(&mut conn, "bravo");
        let req = ScopeRequest {
            app_name: Some("Cursor".into()),
            ..Default::default()
        };

        let xa = resolve_scope(&conn, &a, &req, Utc::now()).unwrap();
        let xb = resolve_scope(&conn, &b, &req, Utc::now()).unwrap();
        assert_ne!(xa.id, xb.id);
        assert_eq!(xa.name, "Cursor");

        // Case and whitespace do not create a second application
        let again = ScopeRequest {
            app_name: Some("  cursor ".into()),
            ..Default::default()
        };
        assert_eq!(resolve_scope(&conn, &a, &again, Utc::now()).unwrap().id, xa.id);
    }

    #[test]
    fn empty_request_uses_default_app() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "alpha");
        let first = resolve_scope(&conn, &a, &ScopeRequest::default(), Utc::now()).unwrap();
        let second = resolve_scope(&conn, &a, &ScopeRequest::default(), Utc::now()).unwrap();
        assert_eq!(first.name, DEFAULT_APP_NAME);
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, AppKind::Client);
    }

    #[test]
    fn claimed_foreign_app_is_forbidden() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "alpha");
        let b = account(&mut conn, "bravo");
        let b_app = upsert_client_app(&conn, &b.id, "notes", Utc::now()).unwrap();

        let req = ScopeRequest {
            app_id: Some(b_app.id.clone()),
            ..Default::default()
        };
        let err = resolve_scope(&conn, &a, &req, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "forbidden_application");

        let missing = ScopeRequest {
            app_id: Some("no-such-app".into()),
            ..Default::default()
        };
        let err = resolve_scope(&conn, &a, &missing, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "forbidden_application");
    }

    #[test]
    fn toggling_active() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "alpha");
        let app = upsert_client_app(&conn, &a.id, "notes", Utc::now()).unwrap();
        assert!(app.is_active);
        let paused = set_active(&conn, &a.id, &app.id, false, Utc::now()).unwrap();
        assert!(!paused.is_active);
    }

    #[test]
    fn delete_refuses_app_with_memories() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "alpha");
        let app = upsert_client_app(&conn, &a.id, "notes", Utc::now()).unwrap();
        crate::memory::insert_ref(&conn, "m1", &a.id, &app.id, Utc::now()).unwrap();

        let err = delete_application(&mut conn, &a.id, &app.id).unwrap_err();
        assert_eq!(err.code(), "application_not_empty");

        conn.execute("UPDATE memory_refs SET state = 'deleted' WHERE id = 'm1'", [])
            .unwrap();
        delete_application(&mut conn, &a.id, &app.id).unwrap();
        assert!(get_application(&conn, &app.id).unwrap().is_none());
    }
}
