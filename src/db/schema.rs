//! SQL DDL for the gateway tables.
//!
//! Defines `accounts`, `login_identities`, `api_keys`, `sessions`,
//! `verification_codes`, `captcha_challenges`, `applications`, `memory_refs`,
//! `access_log`, `plans`, and `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

/// Version-1 schema. Later columns and tables arrive through migrations.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    email TEXT,
    password_hash TEXT,
    created_at TEXT NOT NULL,
    last_login_at TEXT,
    deleted_at TEXT
);

-- Every login mechanism is a tagged identifier owned by exactly one account
CREATE TABLE IF NOT EXISTS login_identities (
    login_type TEXT NOT NULL CHECK(login_type IN ('email','qq','wechat','google','github','auto')),
    login_id TEXT NOT NULL,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    created_at TEXT NOT NULL,
    PRIMARY KEY (login_type, login_id)
);

CREATE INDEX IF NOT EXISTS idx_identities_account ON login_identities(account_id);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    key_hash TEXT NOT NULL UNIQUE,
    prefix TEXT NOT NULL,
    name TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    revoked_at TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    token_hash TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_codes (
    login_id TEXT PRIMARY KEY,
    purpose TEXT NOT NULL CHECK(purpose IN ('login','set_password','reset_password')),
    code_hash TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS captcha_challenges (
    id TEXT PRIMARY KEY,
    answer_hash TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Named scopes. device_id is the global device binding; client_key makes
-- client applications unique per account.
CREATE TABLE IF NOT EXISTS applications (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('device','client')),
    device_id TEXT UNIQUE,
    device_kind TEXT CHECK(device_kind IN ('mac','endpoint')),
    client_key TEXT UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1,
    memories_created INTEGER NOT NULL DEFAULT 0,
    memories_accessed INTEGER NOT NULL DEFAULT 0,
    bound_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_applications_account ON applications(account_id);

CREATE TABLE IF NOT EXISTS memory_refs (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    app_id TEXT NOT NULL REFERENCES applications(id),
    state TEXT NOT NULL DEFAULT 'active' CHECK(state IN ('active','paused','archived','deleted')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    archived_at TEXT,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memory_refs_app_state ON memory_refs(app_id, state);

-- Append-only audit of gateway-mediated operations
CREATE TABLE IF NOT EXISTS access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    app_id TEXT NOT NULL,
    memory_id TEXT,
    kind TEXT NOT NULL CHECK(kind IN ('add','search','list','delete')),
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_account_time ON access_log(account_id, created_at);
CREATE INDEX IF NOT EXISTS idx_access_app_time ON access_log(app_id, created_at);
CREATE INDEX IF NOT EXISTS idx_access_memory ON access_log(memory_id);

CREATE TABLE IF NOT EXISTS plans (
    account_id TEXT PRIMARY KEY REFERENCES accounts(id),
    plan_id TEXT NOT NULL,
    quota INTEGER,
    cycle TEXT NOT NULL,
    anchor_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
