//! Account registry: login identities, auto-registration, passwords.
//!
//! Every login mechanism is a `(login_type, login_id)` row in `login_identities`
//! pointing at one account. Auto-registration is an upsert keyed by that pair.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::db::timestamp;
use crate::error::{AuthError, GatewayError, Result};

/// Tag of a login identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginType {
    Email,
    Qq,
    Wechat,
    Google,
    Github,
    /// Created by device auto-bind.
    Auto,
}

impl LoginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Qq => "qq",
            Self::Wechat => "wechat",
            Self::Google => "google",
            Self::Github => "github",
            Self::Auto => "auto",
        }
    }

    /// Providers whose identities arrive already verified by an external handshake.
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Qq | Self::Wechat | Self::Google | Self::Github)
    }

    /// Canonical form of a login id for this type.
    pub fn normalize(&self, login_id: &str) -> Result<String> {
        let trimmed = login_id.trim();
        match self {
            Self::Email => {
                let email = trimmed.to_lowercase();
                if !is_valid_email(&email) {
                    return Err(GatewayError::Validation(format!("invalid email: {login_id}")));
                }
                Ok(email)
            }
            _ if trimmed.chars().count() < 3 => Err(GatewayError::Validation(format!(
                "{} login id must be at least 3 characters",
                self.as_str()
            ))),
            _ => Ok(trimmed.to_string()),
        }
    }
}

impl std::fmt::Display for LoginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoginType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "qq" => Ok(Self::Qq),
            "wechat" => Ok(Self::Wechat),
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            "auto" => Ok(Self::Auto),
            _ => Err(format!("unknown login type: {s}")),
        }
    }
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && domain.contains('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// A resolved user identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    /// UUID v7 primary key.
    pub id: String,
    /// Human-facing identifier used by the REST surface.
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub created_at: String,
    pub last_login_at: Option<String>,
}

const ACCOUNT_COLUMNS: &str = "id, user_id, display_name, email, created_at, last_login_at";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
        created_at: row.get(4)?,
        last_login_at: row.get(5)?,
    })
}

pub fn get_account(conn: &Connection, account_id: &str) -> Result<Option<Account>> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1 AND deleted_at IS NULL");
    Ok(conn
        .query_row(&sql, params![account_id], account_from_row)
        .optional()?)
}

pub fn find_by_user_id(conn: &Connection, user_id: &str) -> Result<Option<Account>> {
    let sql =
        format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1 AND deleted_at IS NULL");
    Ok(conn
        .query_row(&sql, params![user_id], account_from_row)
        .optional()?)
}

/// Look up the account owning a login identifier. `login_id` must be normalized.
pub fn find_by_login(
    conn: &Connection,
    login_type: LoginType,
    login_id: &str,
) -> Result<Option<Account>> {
    Ok(conn
        .query_row(
            "SELECT a.id, a.user_id, a.display_name, a.email, a.created_at, a.last_login_at
             FROM accounts a JOIN login_identities l ON l.account_id = a.id
             WHERE l.login_type = ?1 AND l.login_id = ?2 AND a.deleted_at IS NULL",
            params![login_type.as_str(), login_id],
            account_from_row,
        )
        .optional()?)
}

/// Outcome of [`upsert_account`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub account: Account,
    /// `true` if this call created the account.
    pub created: bool,
}

/// Find or create the account owning `(login_type, login_id)`.
///
/// Runs as one immediate transaction. The identity insert is
/// `ON CONFLICT DO NOTHING`: a caller that loses a first-login race rolls back
/// its provisional account and returns the winner's.
pub fn upsert_account(
    conn: &mut Connection,
    login_type: LoginType,
    login_id: &str,
    display_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Registration> {
    let login_id = login_type.normalize(login_id)?;
    let now_str = timestamp(now);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(existing) = find_by_login(&tx, login_type, &login_id)? {
        tx.commit()?;
        return Ok(Registration {
            account: existing,
            created: false,
        });
    }

    let id = uuid::Uuid::now_v7().to_string();
    let user_id = unique_user_id(&tx, &default_user_id(login_type, &login_id), &id)?;
    let display_name = display_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_display_name(login_type, &login_id));
    let email = (login_type == LoginType::Email).then(|| login_id.clone());

    tx.execute(
        "INSERT INTO accounts (id, user_id, display_name, email, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, user_id, display_name, email, now_str],
    )?;
    let inserted = tx.execute(
        "INSERT INTO login_identities (login_type, login_id, account_id, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(login_type, login_id) DO NOTHING",
        params![login_type.as_str(), login_id, id, now_str],
    )?;

    if inserted == 0 {
        // Lost the race: discard the provisional account
        drop(tx);
        let account = find_by_login(conn, login_type, &login_id)?
            .ok_or(GatewayError::Auth(AuthError::AccountNotFound))?;
        return Ok(Registration {
            account,
            created: false,
        });
    }

    tx.commit()?;
    tracing::info!(account = %id, login_type = %login_type, "account registered");

    let account = get_account(conn, &id)?
        .ok_or_else(|| GatewayError::Internal(format!("account {id} vanished after insert")))?;
    Ok(Registration {
        account,
        created: true,
    })
}

fn default_user_id(login_type: LoginType, login_id: &str) -> String {
    match login_type {
        LoginType::Email | LoginType::Auto => login_id.to_string(),
        other => format!("{}_{}", other.as_str(), login_id),
    }
}

fn default_display_name(login_type: LoginType, login_id: &str) -> String {
    match login_type {
        LoginType::Email => login_id
            .split_once('@')
            .map(|(local, _)| local.to_string())
            .unwrap_or_else(|| login_id.to_string()),
        _ => login_id.to_string(),
    }
}

/// `candidate`, or `candidate-<suffix>` if another account already uses it.
fn unique_user_id(conn: &Connection, candidate: &str, account_id: &str) -> Result<String> {
    let taken: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM accounts WHERE user_id = ?1)",
        params![candidate],
        |row| row.get(0),
    )?;
    if !taken {
        return Ok(candidate.to_string());
    }
    let suffix: String = account_id.chars().rev().take(8).collect();
    Ok(format!("{candidate}-{suffix}"))
}

pub fn touch_last_login(conn: &Connection, account_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET last_login_at = ?1 WHERE id = ?2",
        params![timestamp(now), account_id],
    )?;
    Ok(())
}

/// Soft-delete an account. Its applications and identities stay for attribution;
/// every credential stops resolving.
pub fn soft_delete_account(conn: &Connection, account_id: &str, now: DateTime<Utc>) -> Result<()> {
    let n = conn.execute(
        "UPDATE accounts SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![timestamp(now), account_id],
    )?;
    if n == 0 {
        return Err(AuthError::AccountNotFound.into());
    }
    conn.execute(
        "UPDATE api_keys SET revoked_at = ?1 WHERE account_id = ?2 AND revoked_at IS NULL",
        params![timestamp(now), account_id],
    )?;
    conn.execute("DELETE FROM sessions WHERE account_id = ?1", params![account_id])?;
    tracing::info!(account = %account_id, "account soft-deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Passwords
// ---------------------------------------------------------------------------

pub const MIN_PASSWORD_LEN: usize = 8;

/// Salted SHA-256, stored as `<salt hex>$<digest hex>`.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let salt = hex::encode(salt);
    let digest = super::sha256_hex(&format!("{salt}:{password}"));
    format!("{salt}${digest}")
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => {
            constant_time_eq(&super::sha256_hex(&format!("{salt}:{password}")), digest)
        }
        None => false,
    }
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(left: &str, right: &str) -> bool {
    let (left, right) = (left.as_bytes(), right.as_bytes());
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).fold(0_u8, |diff, (a, b)| diff | (a ^ b)) == 0
}

pub fn set_password_hash(conn: &Connection, account_id: &str, password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(GatewayError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    conn.execute(
        "UPDATE accounts SET password_hash = ?1 WHERE id = ?2",
        params![hash_password(password), account_id],
    )?;
    Ok(())
}

/// Check an email + password pair.
pub fn check_password(conn: &Connection, email: &str, password: &str) -> Result<Account> {
    let email = LoginType::Email.normalize(email)?;
    let account = find_by_login(conn, LoginType::Email, &email)?.ok_or(AuthError::AccountNotFound)?;
    let stored: Option<String> = conn.query_row(
        "SELECT password_hash FROM accounts WHERE id = ?1",
        params![account.id],
        |row| row.get(0),
    )?;
    match stored {
        Some(hash) if verify_password(password, &hash) => Ok(account),
        _ => Err(AuthError::InvalidCredential.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    #[test]
    fn email_is_normalized() {
        assert_eq!(
            LoginType::Email.normalize("  Alice@Example.COM ").unwrap(),
            "alice@example.com"
        );
        assert!(LoginType::Email.normalize("not-an-email").is_err());
        assert!(LoginType::Email.normalize("a@b").is_err());
        assert!(LoginType::Qq.normalize("12").is_err());
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut conn = open_memory_database().unwrap();
        let now = Utc::now();
        let first = upsert_account(&mut conn, LoginType::Email, "Bob@Example.com", None, now).unwrap();
        let second = upsert_account(&mut conn, LoginType::Email, "bob@example.com", None, now).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.account.id, second.account.id);
        assert_eq!(first.account.user_id, "bob@example.com");
        assert_eq!(first.account.display_name, "bob");
    }

    #[test]
    fn same_id_under_different_types_are_distinct_accounts() {
        let mut conn = open_memory_database().unwrap();
        let now = Utc::now();
        let qq = upsert_account(&mut conn, LoginType::Qq, "12345", None, now).unwrap();
        let wx = upsert_account(&mut conn, LoginType::Wechat, "12345", None, now).unwrap();
        assert_ne!(qq.account.id, wx.account.id);
        assert_eq!(qq.account.user_id, "qq_12345");
    }

    #[test]
    fn user_id_collision_gets_suffix() {
        let mut conn = open_memory_database().unwrap();
        let now = Utc::now();
        let auto = upsert_account(&mut conn, LoginType::Auto, "carol@example.com", None, now).unwrap();
        let email = upsert_account(&mut conn, LoginType::Email, "carol@example.com", None, now).unwrap();
        assert_eq!(auto.account.user_id, "carol@example.com");
        assert!(email.account.user_id.starts_with("carol@example.com-"));
    }

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("correct horse");
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert_ne!(hash, hash_password("correct horse"), "salt must differ");
    }

    #[test]
    fn truncated_or_malformed_hashes_never_verify() {
        let hash = hash_password("correct horse");
        let truncated = &hash[..hash.len() - 1];
        assert!(!verify_password("correct horse", truncated));
        assert!(!verify_password("correct horse", "no-separator"));
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn soft_deleted_account_stops_resolving() {
        let mut conn = open_memory_database().unwrap();
        let reg = upsert_account(&mut conn, LoginType::Auto, "dave-device", None, Utc::now()).unwrap();
        soft_delete_account(&conn, &reg.account.id, Utc::now()).unwrap();
        assert!(get_account(&conn, &reg.account.id).unwrap().is_none());
        assert!(find_by_login(&conn, LoginType::Auto, "dave-device").unwrap().is_none());
    }
}
