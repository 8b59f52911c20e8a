//! Verification codes and CAPTCHA challenges.
//!
//! Codes and CAPTCHA answers are stored only as SHA-256 digests. A code row is
//! keyed by login id, so issuing a new code replaces the old one.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::db::{parse_timestamp, timestamp};
use crate::error::{AuthError, GatewayError, Result};

/// What a verification code may be spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePurpose {
    Login,
    SetPassword,
    ResetPassword,
}

impl CodePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::SetPassword => "set_password",
            Self::ResetPassword => "reset_password",
        }
    }

    /// Password flows are gated by a CAPTCHA before a code is sent.
    pub fn requires_captcha(&self) -> bool {
        matches!(self, Self::SetPassword | Self::ResetPassword)
    }
}

impl std::fmt::Display for CodePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CodePurpose {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "login" => Ok(Self::Login),
            "set_password" => Ok(Self::SetPassword),
            "reset_password" => Ok(Self::ResetPassword),
            _ => Err(format!("unknown code purpose: {s}")),
        }
    }
}

fn code_digest(login_id: &str, code: &str) -> String {
    super::sha256_hex(&format!("{login_id}:{code}"))
}

/// Issue a fresh 6-digit code for `login_id` and return it in plain text for
/// delivery. `login_id` must be normalized.
pub fn issue_code(
    conn: &Connection,
    login_id: &str,
    purpose: CodePurpose,
    config: &AuthConfig,
    now: DateTime<Utc>,
) -> Result<String> {
    let last_issued: Option<String> = conn
        .query_row(
            "SELECT issued_at FROM verification_codes WHERE login_id = ?1",
            params![login_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(issued_at) = last_issued {
        let next_allowed =
            parse_timestamp(&issued_at)? + Duration::seconds(config.code_resend_secs as i64);
        if now < next_allowed {
            let wait = (next_allowed - now).num_seconds().max(1) as u64;
            return Err(AuthError::RateLimited {
                retry_after_secs: wait,
            }
            .into());
        }
    }

    let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
    let expires_at = now + Duration::seconds(config.code_ttl_secs as i64);

    conn.execute(
        "INSERT OR REPLACE INTO verification_codes
             (login_id, purpose, code_hash, attempts, issued_at, expires_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?5)",
        params![
            login_id,
            purpose.as_str(),
            code_digest(login_id, &code),
            timestamp(now),
            timestamp(expires_at)
        ],
    )?;

    tracing::debug!(login_id = %login_id, purpose = %purpose, "verification code issued");
    Ok(code)
}

/// Spend a code. It must have been issued for one of `accepted` purposes.
///
/// A wrong guess counts an attempt; after `max_code_attempts` the code is burned.
pub fn verify_code(
    conn: &Connection,
    login_id: &str,
    code: &str,
    accepted: &[CodePurpose],
    config: &AuthConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    let row: Option<(String, String, u32, String)> = conn
        .query_row(
            "SELECT purpose, code_hash, attempts, expires_at FROM verification_codes
             WHERE login_id = ?1",
            params![login_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let Some((purpose, code_hash, attempts, expires_at)) = row else {
        return Err(AuthError::InvalidCredential.into());
    };

    let purpose_ok = purpose
        .parse::<CodePurpose>()
        .map(|p| accepted.contains(&p))
        .unwrap_or(false);
    if !purpose_ok {
        return Err(AuthError::InvalidCredential.into());
    }

    if now >= parse_timestamp(&expires_at)? {
        delete_code(conn, login_id)?;
        return Err(AuthError::VerificationExpired.into());
    }

    if code_digest(login_id, code.trim()) != code_hash {
        let attempts = attempts + 1;
        if attempts >= config.max_code_attempts {
            tracing::warn!(login_id = %login_id, attempts, "verification code burned");
            delete_code(conn, login_id)?;
        } else {
            conn.execute(
                "UPDATE verification_codes SET attempts = ?1 WHERE login_id = ?2",
                params![attempts, login_id],
            )?;
        }
        return Err(AuthError::InvalidCredential.into());
    }

    delete_code(conn, login_id)?;
    Ok(())
}

fn delete_code(conn: &Connection, login_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM verification_codes WHERE login_id = ?1",
        params![login_id],
    )?;
    Ok(())
}

/// A challenge handed to the client. The answer never leaves the server.
#[derive(Debug, Clone, Serialize)]
pub struct Captcha {
    pub captcha_id: String,
    pub prompt: String,
}

/// A client's answer to a [`Captcha`].
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaAnswer {
    pub captcha_id: String,
    pub answer: String,
}

pub fn issue_captcha(conn: &Connection, config: &AuthConfig, now: DateTime<Utc>) -> Result<Captcha> {
    let mut rng = rand::rng();
    let a: u32 = rng.random_range(1..=20);
    let b: u32 = rng.random_range(1..=20);
    let id = uuid::Uuid::now_v7().to_string();
    let expires_at = now + Duration::seconds(config.captcha_ttl_secs as i64);

    // Sweep stale challenges opportunistically
    conn.execute(
        "DELETE FROM captcha_challenges WHERE expires_at <= ?1",
        params![timestamp(now)],
    )?;
    conn.execute(
        "INSERT INTO captcha_challenges (id, answer_hash, expires_at) VALUES (?1, ?2, ?3)",
        params![
            id,
            super::sha256_hex(&format!("{id}:{}", a + b)),
            timestamp(expires_at)
        ],
    )?;

    Ok(Captcha {
        captcha_id: id,
        prompt: format!("What is {a} + {b}?"),
    })
}

/// Consume a CAPTCHA. Challenges are single use, right or wrong.
pub fn solve_captcha(conn: &Connection, answer: &CaptchaAnswer, now: DateTime<Utc>) -> Result<()> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT answer_hash, expires_at FROM captcha_challenges WHERE id = ?1",
            params![answer.captcha_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((answer_hash, expires_at)) = row else {
        return Err(AuthError::CaptchaRequired.into());
    };

    conn.execute(
        "DELETE FROM captcha_challenges WHERE id = ?1",
        params![answer.captcha_id],
    )?;

    if now >= parse_timestamp(&expires_at)? {
        return Err(AuthError::CaptchaRequired.into());
    }
    let given = super::sha256_hex(&format!("{}:{}", answer.captcha_id, answer.answer.trim()));
    if given != answer_hash {
        return Err(GatewayError::Auth(AuthError::InvalidCredential));
    }
    Ok(())
}
