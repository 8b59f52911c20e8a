//! Plans and quota checks.
//!
//! The quota is joint: every access kind counts against one ceiling per cycle.
//! The check and the later record are not one transaction, so concurrent calls
//! at the ceiling can overshoot by at most the number of calls in flight.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::cycle::{cycle_window, CycleLength, CycleWindow};
use crate::config::BillingConfig;
use crate::db::{parse_timestamp, timestamp};
use crate::error::{GatewayError, Result};
use crate::identity::Account;

/// Identifier of the implicit plan given to accounts without one.
pub const FREE_PLAN_ID: &str = "free";

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub plan_id: String,
    /// `None` means unlimited.
    pub quota: Option<u64>,
    #[serde(serialize_with = "serialize_cycle")]
    pub cycle: CycleLength,
    pub anchor: DateTime<Utc>,
    /// `false` for the implicit free tier.
    pub explicit: bool,
}

fn serialize_cycle<S: serde::Serializer>(cycle: &CycleLength, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&cycle.to_string())
}

/// The account's plan, or the free tier anchored at account creation.
pub fn get_plan(conn: &Connection, account: &Account, billing: &BillingConfig) -> Result<Plan> {
    let row: Option<(String, Option<i64>, String, String)> = conn
        .query_row(
            "SELECT plan_id, quota, cycle, anchor_at FROM plans WHERE account_id = ?1",
            params![account.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    match row {
        Some((plan_id, quota, cycle, anchor)) => Ok(Plan {
            plan_id,
            quota: quota.map(|q| q.max(0) as u64),
            cycle: cycle.parse().map_err(GatewayError::Internal)?,
            anchor: parse_timestamp(&anchor)?,
            explicit: true,
        }),
        None => {
            let cycle = billing.default_cycle.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "invalid billing.default_cycle, using monthly");
                CycleLength::Months(1)
            });
            Ok(Plan {
                plan_id: FREE_PLAN_ID.to_string(),
                quota: Some(billing.default_quota),
                cycle,
                anchor: parse_timestamp(&account.created_at)?,
                explicit: false,
            })
        }
    }
}

/// Create or replace the account's plan.
pub fn set_plan(
    conn: &Connection,
    account_id: &str,
    plan_id: &str,
    quota: Option<u64>,
    cycle: CycleLength,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO plans (account_id, plan_id, quota, cycle, anchor_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(account_id) DO UPDATE SET
             plan_id = excluded.plan_id, quota = excluded.quota, cycle = excluded.cycle,
             anchor_at = excluded.anchor_at, updated_at = excluded.updated_at",
        params![
            account_id,
            plan_id,
            quota.map(|q| q as i64),
            cycle.to_string(),
            timestamp(anchor),
            timestamp(now)
        ],
    )?;
    tracing::info!(account = %account_id, plan = %plan_id, quota = ?quota, cycle = %cycle, "plan set");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub plan: Plan,
    pub window: CycleWindow,
    pub used: u64,
    pub limit: Option<u64>,
}

impl QuotaStatus {
    pub fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.used >= limit)
    }
}

/// Usage in the cycle containing `now`.
pub fn quota_status(
    conn: &Connection,
    account: &Account,
    billing: &BillingConfig,
    now: DateTime<Utc>,
) -> Result<QuotaStatus> {
    let plan = get_plan(conn, account, billing)?;
    let window = cycle_window(plan.anchor, plan.cycle, now);
    let used = super::count_in_window(conn, &account.id, window.start, window.end)?;
    let limit = plan.quota;
    Ok(QuotaStatus {
        plan,
        window,
        used,
        limit,
    })
}

/// `QuotaExceeded` (with the cycle reset time) if one more call would pass the ceiling.
pub fn check_quota(
    conn: &Connection,
    account: &Account,
    billing: &BillingConfig,
    now: DateTime<Utc>,
) -> Result<QuotaStatus> {
    let status = quota_status(conn, account, billing, now)?;
    if let (true, Some(limit)) = (status.exhausted(), status.limit) {
        tracing::info!(account = %account.id, used = status.used, limit, "quota exceeded");
        return Err(GatewayError::QuotaExceeded {
            used: status.used,
            limit,
            resets_at: Some(status.window.end),
        });
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::identity::accounts::{upsert_account, LoginType};
    use crate::usage::{record, AccessEvent, AccessKind};

    #[test]
    fn free_tier_uses_defaults_and_creation_anchor() {
        let mut conn = open_memory_database().unwrap();
        let account = upsert_account(&mut conn, LoginType::Auto, "freebie", None, Utc::now())
            .unwrap()
            .account;
        let plan = get_plan(&conn, &account, &BillingConfig::default()).unwrap();
        assert_eq!(plan.plan_id, FREE_PLAN_ID);
        assert_eq!(plan.quota, Some(5000));
        assert_eq!(plan.cycle, CycleLength::Months(1));
        assert_eq!(timestamp(plan.anchor), account.created_at);
    }

    #[test]
    fn explicit_plan_overrides_and_unlimited_never_exhausts() {
        let mut conn = open_memory_database().unwrap();
        let account = upsert_account(&mut conn, LoginType::Auto, "pro-user", None, Utc::now())
            .unwrap()
            .account;
        let now = Utc::now();
        set_plan(&conn, &account.id, "pro", None, CycleLength::Months(12), now, now).unwrap();

        let events: Vec<AccessEvent> = (0..3)
            .map(|_| AccessEvent {
                account_id: account.id.clone(),
                app_id: "app".into(),
                memory_id: None,
                kind: AccessKind::Search,
                at: now,
                metadata: None,
            })
            .collect();
        record(&mut conn, &events).unwrap();

        let status = check_quota(&conn, &account, &BillingConfig::default(), now).unwrap();
        assert_eq!(status.plan.plan_id, "pro");
        assert_eq!(status.used, 3);
        assert!(!status.exhausted());
    }

    #[test]
    fn exceeded_reports_reset_time() {
        let mut conn = open_memory_database().unwrap();
        let account = upsert_account(&mut conn, LoginType::Auto, "tiny-user", None, Utc::now())
            .unwrap()
            .account;
        let now: DateTime<Utc> = "2026-10-19T12:00:00Z".parse().unwrap();
        set_plan(&conn, &account.id, "tiny", Some(0), CycleLength::Days(7), now, now).unwrap();

        let err = check_quota(&conn, &account, &BillingConfig::default(), now).unwrap_err();
        assert_eq!(err.code(), "quota_exceeded");
        assert_eq!(err.resets_at(), Some(now + chrono::Duration::days(7)));
    }
}
