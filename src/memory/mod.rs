//! References to memories held by the external engine.
//!
//! The gateway does not own memory content. It keeps one reference row per
//! memory it created (owner, application, lifecycle state) so it can enforce
//! ownership and hide non-active memories, plus an append-only state history.

pub mod state;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;

pub use state::MemoryState;

use crate::db::timestamp;
use crate::error::{GatewayError, Result};

/// The gateway's view of a memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRef {
    pub id: String,
    pub account_id: String,
    pub app_id: String,
    pub state: MemoryState,
    pub created_at: String,
    pub updated_at: String,
}

fn ref_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRef> {
    let state: String = row.get(3)?;
    Ok(MemoryRef {
        id: row.get(0)?,
        account_id: row.get(1)?,
        app_id: row.get(2)?,
        state: state.parse().unwrap_or(MemoryState::Active),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn insert_ref(
    conn: &Connection,
    memory_id: &str,
    account_id: &str,
    app_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let now = timestamp(now);
    conn.execute(
        "INSERT INTO memory_refs (id, account_id, app_id, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
        params![memory_id, account_id, app_id, now],
    )?;
    Ok(())
}

pub fn get_ref(conn: &Connection, memory_id: &str) -> Result<Option<MemoryRef>> {
    Ok(conn
        .query_row(
            "SELECT id, account_id, app_id, state, created_at, updated_at
             FROM memory_refs WHERE id = ?1",
            params![memory_id],
            ref_from_row,
        )
        .optional()?)
}

/// Of `ids`, those whose reference exists and is not active. Ids the gateway has
/// no reference for are not hidden.
pub fn hidden_ids(conn: &Connection, ids: &[String]) -> Result<HashSet<String>> {
    let mut stmt =
        conn.prepare("SELECT state FROM memory_refs WHERE id = ?1 AND state != 'active'")?;
    let mut hidden = HashSet::new();
    for id in ids {
        if stmt.exists(params![id])? {
            hidden.insert(id.clone());
        }
    }
    Ok(hidden)
}

/// Validate a bulk state change and return the references that actually move.
///
/// Every id must belong to the account (`NotFound` otherwise) and every move must
/// be legal; nothing is written.
pub fn plan_transition(
    conn: &Connection,
    account_id: &str,
    ids: &[String],
    to: MemoryState,
) -> Result<Vec<MemoryRef>> {
    if ids.is_empty() {
        return Err(GatewayError::Validation("memory_ids must not be empty".into()));
    }

    let mut seen = HashSet::new();
    let mut moving = Vec::new();
    for id in ids {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let memory = match get_ref(conn, id)? {
            Some(m) if m.account_id == account_id => m,
            _ => return Err(GatewayError::NotFound(format!("memory {id}"))),
        };
        if !memory.state.can_transition_to(to) {
            return Err(GatewayError::InvalidStateTransition {
                from: memory.state.to_string(),
                to: to.to_string(),
            });
        }
        if memory.state != to {
            moving.push(memory);
        }
    }
    Ok(moving)
}

/// Apply a planned transition and append history, in one transaction.
pub fn commit_transition(
    conn: &mut Connection,
    changed_by: &str,
    refs: &[MemoryRef],
    to: MemoryState,
    now: DateTime<Utc>,
) -> Result<()> {
    let now = timestamp(now);
    let tx = conn.transaction()?;
    for memory in refs {
        tx.execute(
            "UPDATE memory_refs SET state = ?1, updated_at = ?2,
                 archived_at = CASE WHEN ?1 = 'archived' THEN ?2 ELSE archived_at END,
                 deleted_at = CASE WHEN ?1 = 'deleted' THEN ?2 ELSE deleted_at END
             WHERE id = ?3",
            params![to.as_str(), now, memory.id],
        )?;
        tx.execute(
            "INSERT INTO memory_state_history (memory_id, changed_by, old_state, new_state, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![memory.id, changed_by, memory.state.as_str(), to.as_str(), now],
        )?;
    }
    tx.commit()?;
    tracing::info!(count = refs.len(), state = %to, "memory state changed");
    Ok(())
}

/// One row of a memory's state history.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub changed_by: String,
    pub old_state: String,
    pub new_state: String,
    pub changed_at: String,
}

pub fn state_history(conn: &Connection, memory_id: &str) -> Result<Vec<StateChange>> {
    let mut stmt = conn.prepare(
        "SELECT changed_by, old_state, new_state, changed_at FROM memory_state_history
         WHERE memory_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![memory_id], |row| {
            Ok(StateChange {
                changed_by: row.get(0)?,
                old_state: row.get(1)?,
                new_state: row.get(2)?,
                changed_at: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
