pub mod account;
pub mod doctor;
pub mod keys;
pub mod plan;
pub mod stats;

use anyhow::{Context, Result};
use rusqlite::Connection;

use memgate::config::GatewayConfig;
use memgate::identity::accounts;
use memgate::identity::Account;

/// Open the configured database for a one-shot command.
fn open(config: &GatewayConfig) -> Result<Connection> {
    let db_path = config.resolved_db_path();
    memgate::db::open_database(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))
}

fn require_account(conn: &Connection, user_id: &str) -> Result<Account> {
    accounts::find_by_user_id(conn, user_id)?
        .with_context(|| format!("no account with user_id {user_id}"))
}
