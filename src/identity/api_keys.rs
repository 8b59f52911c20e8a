//! API keys and session tokens. Only SHA-256 digests of secrets are stored.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::accounts::{get_account, Account};
use crate::db::{parse_timestamp, timestamp};
use crate::error::{AuthError, GatewayError, Result};

pub const API_KEY_PREFIX: &str = "sk-memgate-";

/// Metadata about an API key. The secret itself is shown once, at creation.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub id: String,
    /// First characters of the key, enough to recognise it in a list.
    pub prefix: String,
    pub name: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked: bool,
}

fn random_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

pub fn create_api_key(
    conn: &Connection,
    account_id: &str,
    name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(ApiKeyInfo, String)> {
    let key = format!("{API_KEY_PREFIX}{}", random_secret());
    let id = uuid::Uuid::now_v7().to_string();
    let prefix: String = key.chars().take(API_KEY_PREFIX.len() + 6).collect();
    let name = name.map(str::trim).filter(|n| !n.is_empty());

    conn.execute(
        "INSERT INTO api_keys (id, account_id, key_hash, prefix, name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, account_id, super::sha256_hex(&key), prefix, name, timestamp(now)],
    )?;
    tracing::info!(account = %account_id, key_id = %id, "api key created");

    let info = ApiKeyInfo {
        id,
        prefix,
        name: name.map(str::to_string),
        created_at: timestamp(now),
        last_used_at: None,
        revoked: false,
    };
    Ok((info, key))
}

pub fn list_api_keys(conn: &Connection, account_id: &str) -> Result<Vec<ApiKeyInfo>> {
    let mut stmt = conn.prepare(
        "SELECT id, prefix, name, created_at, last_used_at, revoked_at IS NOT NULL
         FROM api_keys WHERE account_id = ?1 ORDER BY created_at",
    )?;
    let keys = stmt
        .query_map(params![account_id], |row| {
            Ok(ApiKeyInfo {
                id: row.get(0)?,
                prefix: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
                last_used_at: row.get(4)?,
                revoked: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys)
}

pub fn revoke_api_key(
    conn: &Connection,
    account_id: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE api_keys SET revoked_at = ?1
         WHERE id = ?2 AND account_id = ?3 AND revoked_at IS NULL",
        params![timestamp(now), key_id, account_id],
    )?;
    if n == 0 {
        return Err(GatewayError::NotFound(format!("api key {key_id}")));
    }
    tracing::info!(account = %account_id, key_id = %key_id, "api key revoked");
    Ok(())
}

/// Resolve a presented API key to its account, stamping `last_used_at`.
pub fn resolve_api_key(conn: &Connection, key: &str, now: DateTime<Utc>) -> Result<Account> {
    let key = key.trim();
    if !key.starts_with(API_KEY_PREFIX) {
        return Err(AuthError::InvalidCredential.into());
    }
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, account_id FROM api_keys WHERE key_hash = ?1 AND revoked_at IS NULL",
            params![super::sha256_hex(key)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((key_id, account_id)) = row else {
        return Err(AuthError::InvalidCredential.into());
    };

    conn.execute(
        "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
        params![timestamp(now), key_id],
    )?;
    get_account(conn, &account_id)?.ok_or_else(|| AuthError::AccountNotFound.into())
}

/// Start a session for an account and return the bearer token.
pub fn create_session(
    conn: &Connection,
    account_id: &str,
    ttl_days: u64,
    now: DateTime<Utc>,
) -> Result<String> {
    let token = random_secret();
    let expires_at = now + Duration::days(ttl_days as i64);

    conn.execute(
        "DELETE FROM sessions WHERE account_id = ?1 AND expires_at <= ?2",
        params![account_id, timestamp(now)],
    )?;
    conn.execute(
        "INSERT INTO sessions (token_hash, account_id, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            super::sha256_hex(&token),
            account_id,
            timestamp(now),
            timestamp(expires_at)
        ],
    )?;
    Ok(token)
}

pub fn resolve_session(conn: &Connection, token: &str, now: DateTime<Utc>) -> Result<Account> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT account_id, expires_at FROM sessions WHERE token_hash = ?1",
            params![super::sha256_hex(token.trim())],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((account_id, expires_at)) = row else {
        return Err(AuthError::InvalidCredential.into());
    };
    if now >= parse_timestamp(&expires_at)? {
        return Err(AuthError::VerificationExpired.into());
    }
    get_account(conn, &account_id)?.ok_or_else(|| AuthError::AccountNotFound.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::identity::accounts::{upsert_account, LoginType};

    fn account(conn: &mut Connection) -> Account {
        upsert_account(conn, LoginType::Auto, "key-owner", None, Utc::now())
            .unwrap()
            .account
    }

    #[test]
    fn api_key_resolves_until_revoked() {
        let mut conn = open_memory_database().unwrap();
        let acct = account(&mut conn);
        let now = Utc::now();

        let (info, key) = create_api_key(&conn, &acct.id, Some("laptop"), now).unwrap();
        assert!(key.starts_with("sk-memgate-"));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + 64);

        let resolved = resolve_api_key(&conn, &key, now).unwrap();
        assert_eq!(resolved.id, acct.id);

        let listed = list_api_keys(&conn, &acct.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].last_used_at.is_some());

        revoke_api_key(&conn, &acct.id, &info.id, now).unwrap();
        assert!(resolve_api_key(&conn, &key, now).is_err());
        assert!(list_api_keys(&conn, &acct.id).unwrap()[0].revoked);
    }

    #[test]
    fn revoking_someone_elses_key_is_not_found() {
        let mut conn = open_memory_database().unwrap();
        let acct = account(&mut conn);
        let (info, _) = create_api_key(&conn, &acct.id, None, Utc::now()).unwrap();
        let err = revoke_api_key(&conn, "other", &info.id, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn session_expires() {
        let mut conn = open_memory_database().unwrap();
        let acct = account(&mut conn);
        let now = Utc::now();
        let token = create_session(&conn, &acct.id, 30, now).unwrap();
        assert_eq!(resolve_session(&conn, &token, now).unwrap().id, acct.id);

        let later = now + Duration::days(31);
        let err = resolve_session(&conn, &token, later).unwrap_err();
        assert_eq!(err.code(), "verification_expired");
    }
}
