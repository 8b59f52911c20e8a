//! Device/endpoint binding store.
//!
//! A binding is an `applications` row with a non-null `device_id`. The unique
//! index on that column is the only arbiter of ownership: [`bind`] is a single
//! `INSERT ... ON CONFLICT DO NOTHING` followed by a read of the winner, so
//! concurrent claims from different processes resolve to exactly one owner.

pub mod device;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

pub use device::DeviceId;

use crate::db::timestamp;
use crate::error::{AuthError, GatewayError, Result};
use crate::identity::accounts::{self, Account, LoginType};
use crate::scope::{app_from_row, Application, APP_COLUMNS};

/// Outcome of a bind attempt. `Conflict` is an outcome, not an error, so callers
/// always see an explicit status.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BindOutcome {
    Success { application: Application },
    AlreadyBound { application: Application },
    Conflict { device: String },
}

impl BindOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::AlreadyBound { .. } => "already_bound",
            Self::Conflict { .. } => "conflict",
        }
    }

    /// The caller's application, or [`GatewayError::BindConflict`].
    pub fn into_result(self) -> Result<Application> {
        match self {
            Self::Success { application } | Self::AlreadyBound { application } => Ok(application),
            Self::Conflict { device } => Err(GatewayError::BindConflict { device }),
        }
    }
}

/// One bound device as shown to its owner.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub app_id: String,
    pub identifier: Option<String>,
    pub device_kind: Option<String>,
    pub device_name: String,
    pub bound_at: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

impl From<&Application> for DeviceSummary {
    fn from(app: &Application) -> Self {
        Self {
            app_id: app.id.clone(),
            identifier: app.device_id.clone(),
            device_kind: app.device_kind.clone(),
            device_name: app.name.clone(),
            bound_at: app.bound_at.clone(),
            is_active: app.is_active,
            created_at: app.created_at.clone(),
        }
    }
}

/// Claim `device` for `account_id`.
pub fn bind(
    conn: &Connection,
    account_id: &str,
    device: &DeviceId,
    device_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<BindOutcome> {
    if let DeviceId::Agent(_) = device {
        return Err(GatewayError::Validation(
            "agent ids are derived from endpoint URLs and cannot be bound directly".into(),
        ));
    }

    let key = device.key();
    let name = device_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Device {key}"));

    // An unbind can slip in between the insert and the owner read; retry then.
    for _ in 0..3 {
        let id = uuid::Uuid::now_v7().to_string();
        let now_str = timestamp(now);
        let inserted = conn.execute(
            "INSERT INTO applications
                 (id, account_id, name, kind, device_id, device_kind, agent_id, is_active,
                  bound_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'device', ?4, ?5, ?6, 1, ?7, ?7, ?7)
             ON CONFLICT(device_id) DO NOTHING",
            params![id, account_id, name, key, device.kind(), device.agent_id(), now_str],
        )?;

        if inserted == 1 {
            tracing::info!(account = %account_id, device = %key, app = %id, "device bound");
            let application = find_by_key(conn, &key)?.ok_or_else(|| {
                GatewayError::Internal(format!("binding for {key} vanished after insert"))
            })?;
            return Ok(BindOutcome::Success { application });
        }

        match find_by_key(conn, &key)? {
            Some(application) if application.account_id == account_id => {
                return Ok(BindOutcome::AlreadyBound { application });
            }
            Some(application) => {
                tracing::warn!(
                    account = %account_id,
                    owner = %application.account_id,
                    device = %key,
                    "bind conflict"
                );
                return Ok(BindOutcome::Conflict { device: key });
            }
            None => continue,
        }
    }

    Err(GatewayError::Internal(format!(
        "binding for {key} kept changing during bind"
    )))
}

/// Remove the caller's binding. The application keeps its history and counters.
pub fn unbind(
    conn: &Connection,
    account_id: &str,
    device: &DeviceId,
    now: DateTime<Utc>,
) -> Result<Application> {
    let key = device.key();
    let application = match find_by_device(conn, device)? {
        Some(app) if app.account_id == account_id => app,
        _ => return Err(GatewayError::NotBound(key)),
    };

    let n = conn.execute(
        "UPDATE applications SET device_id = NULL, bound_at = NULL, updated_at = ?1
         WHERE id = ?2 AND account_id = ?3 AND device_id IS NOT NULL",
        params![timestamp(now), application.id, account_id],
    )?;
    if n == 0 {
        return Err(GatewayError::NotBound(key));
    }

    tracing::info!(account = %account_id, device = %key, app = %application.id, "device unbound");
    crate::scope::get_application(conn, &application.id)?
        .ok_or_else(|| GatewayError::Internal(format!("application {} vanished", application.id)))
}

/// Devices currently bound to the account, oldest binding first.
pub fn list_devices(conn: &Connection, account_id: &str) -> Result<Vec<Application>> {
    let sql = format!(
        "SELECT {APP_COLUMNS} FROM applications
         WHERE account_id = ?1 AND kind = 'device' AND device_id IS NOT NULL
         ORDER BY bound_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let apps = stmt
        .query_map(params![account_id], app_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(apps)
}

/// The application bound to `device`, or `NotBound`.
pub fn resolve_owner(conn: &Connection, device: &DeviceId) -> Result<Application> {
    find_by_device(conn, device)?.ok_or_else(|| GatewayError::NotBound(device.key()))
}

/// Like [`resolve_owner`] but absence is not an error.
pub fn find_by_device(conn: &Connection, device: &DeviceId) -> Result<Option<Application>> {
    match device {
        DeviceId::Agent(agent_id) => {
            let sql = format!(
                "SELECT {APP_COLUMNS} FROM applications
                 WHERE agent_id = ?1 AND device_id IS NOT NULL
                 ORDER BY bound_at DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![agent_id], app_from_row)
                .optional()?)
        }
        other => find_by_key(conn, &other.key()),
    }
}

fn find_by_key(conn: &Connection, key: &str) -> Result<Option<Application>> {
    let sql = format!("SELECT {APP_COLUMNS} FROM applications WHERE device_id = ?1");
    Ok(conn.query_row(&sql, params![key], app_from_row).optional()?)
}

/// Who owns a device, for REST callers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOwner {
    pub user_id: String,
    pub app_id: String,
    pub device_name: String,
    pub bound_at: Option<String>,
}

pub fn device_owner(conn: &Connection, device: &DeviceId) -> Result<DeviceOwner> {
    let app = resolve_owner(conn, device)?;
    let account = accounts::get_account(conn, &app.account_id)?.ok_or(AuthError::AccountNotFound)?;
    Ok(DeviceOwner {
        user_id: account.user_id,
        app_id: app.id,
        device_name: app.name,
        bound_at: app.bound_at,
    })
}

/// Bind on behalf of `user_id`, creating the account first when allowed.
///
/// Binding to an account that already exists requires the caller to be that
/// account (`caller_user_id`); only a freshly created account may be claimed
/// without a credential.
pub fn auto_bind(
    conn: &mut Connection,
    user_id: &str,
    caller_user_id: Option<&str>,
    device: &DeviceId,
    device_name: Option<&str>,
    auto_create: bool,
    now: DateTime<Utc>,
) -> Result<(Account, BindOutcome)> {
    let account = match accounts::find_by_user_id(conn, user_id)? {
        Some(account) => match caller_user_id {
            None => return Err(AuthError::InvalidCredential.into()),
            Some(caller) if caller != account.user_id => return Err(AuthError::Forbidden.into()),
            Some(_) => account,
        },
        None if auto_create => {
            accounts::upsert_account(conn, LoginType::Auto, user_id, None, now)?.account
        }
        None => return Err(AuthError::AccountNotFound.into()),
    };
    let outcome = bind(conn, &account.id, device, device_name, now)?;
    Ok((account, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn account(conn: &mut Connection, user_id: &str) -> Account {
        accounts::upsert_account(conn, LoginType::Auto, user_id, None, Utc::now())
            .unwrap()
            .account
    }

    #[test]
    fn bind_twice_is_already_bound() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "owner-a");
        let mac = DeviceId::mac("AA:BB:CC:DD:EE:FF").unwrap();

        let first = bind(&conn, &a.id, &mac, Some("Kitchen"), Utc::now()).unwrap();
        let second = bind(&conn, &a.id, &mac, Some("Renamed"), Utc::now()).unwrap();
        assert_eq!(first.status(), "success");
        assert_eq!(second.status(), "already_bound");

        let (BindOutcome::Success { application: x }, BindOutcome::AlreadyBound { application: y }) =
            (first, second)
        else {
            panic!("unexpected outcomes");
        };
        assert_eq!(x.id, y.id);
        assert_eq!(y.name, "Kitchen");
    }

    #[test]
    fn default_device_name() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "owner-a");
        let mac = DeviceId::mac("aa:bb:cc:dd:ee:01").unwrap();
        let app = bind(&conn, &a.id, &mac, None, Utc::now())
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(app.name, "Device aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn unbind_requires_ownership() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "owner-a");
        let b = account(&mut conn, "owner-b");
        let mac = DeviceId::mac("aa:bb:cc:dd:ee:02").unwrap();
        bind(&conn, &a.id, &mac, None, Utc::now()).unwrap();

        let err = unbind(&conn, &b.id, &mac, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "not_bound");
        assert_eq!(resolve_owner(&conn, &mac).unwrap().account_id, a.id);
    }

    #[test]
    fn unbind_keeps_application() {
        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "owner-a");
        let mac = DeviceId::mac("aa:bb:cc:dd:ee:03").unwrap();
        let app = bind(&conn, &a.id, &mac, None, Utc::now())
            .unwrap()
            .into_result()
            .unwrap();

        let after = unbind(&conn, &a.id, &mac, Utc::now()).unwrap();
        assert_eq!(after.id, app.id);
        assert_eq!(after.device_id, None);
        assert!(list_devices(&conn, &a.id).unwrap().is_empty());
        assert!(crate::scope::get_application(&conn, &app.id).unwrap().is_some());
    }

    #[test]
    fn agent_id_resolves_endpoint_binding() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let mut conn = open_memory_database().unwrap();
        let a = account(&mut conn, "owner-a");
        let token = format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(r#"{"agentId":9001,"sub":"x"}"#)
        );
        let endpoint = DeviceId::endpoint(&format!("wss://robot.example.com/ws?token={token}")).unwrap();
        bind(&conn, &a.id, &endpoint, Some("Robot"), Utc::now()).unwrap();

        let app = resolve_owner(&conn, &DeviceId::Agent(9001)).unwrap();
        assert_eq!(app.name, "Robot");
        assert_eq!(app.agent_id, Some(9001));
        assert!(bind(&conn, &a.id, &DeviceId::Agent(9001), None, Utc::now()).is_err());
    }

    #[test]
    fn auto_bind_creates_account_only_when_allowed() {
        let mut conn = open_memory_database().unwrap();
        let mac = DeviceId::mac("aa:bb:cc:dd:ee:04").unwrap();

        let err = auto_bind(&mut conn, "newcomer", None, &mac, None, false, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "account_not_found");

        let (account, outcome) =
            auto_bind(&mut conn, "newcomer", None, &mac, None, true, Utc::now()).unwrap();
        assert_eq!(account.user_id, "newcomer");
        assert_eq!(outcome.status(), "success");

        let owner = device_owner(&conn, &mac).unwrap();
        assert_eq!(owner.user_id, "newcomer");
    }
}
