//! SQLite storage: connection setup, schema, migrations, and health checks.
//!
//! Every invariant that must hold across gateway processes (one owner per device,
//! one account per login identifier) is a uniqueness constraint in this database,
//! never an in-process lock.

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::GatewayError;

/// Shared handle used by the async surfaces. Work runs on the blocking pool.
pub type Db = Arc<Mutex<Connection>>;

/// Open (or create) the gateway database at the given path with schema and
/// migrations applied.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    // WAL lets several gateway processes share one file
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}

pub fn shared(conn: Connection) -> Db {
    Arc::new(Mutex::new(conn))
}

/// Run synchronous storage work on the blocking pool.
pub async fn run<T, F>(db: &Db, f: F) -> crate::error::Result<T>
where
    F: FnOnce(&mut Connection) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || {
        let mut conn = db
            .lock()
            .map_err(|e| GatewayError::Internal(format!("db lock poisoned: {e}")))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("db task failed: {e}")))?
}

/// Canonical stored form of a timestamp. Fixed precision keeps string order
/// equal to time order, which range queries rely on.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Internal(format!("bad stored timestamp {value:?}: {e}")))
}

/// Result of `memgate doctor`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub schema_version: u32,
    pub account_count: u64,
    pub application_count: u64,
    pub bound_device_count: u64,
    pub access_log_count: u64,
}

pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    Ok(HealthReport {
        integrity_ok: integrity == "ok",
        schema_version: migrations::get_schema_version(conn)?,
        account_count: count("SELECT COUNT(*) FROM accounts WHERE deleted_at IS NULL")?,
        application_count: count("SELECT COUNT(*) FROM applications")?,
        bound_device_count: count("SELECT COUNT(*) FROM applications WHERE device_id IS NOT NULL")?,
        access_log_count: count("SELECT COUNT(*) FROM access_log")?,
    })
}
