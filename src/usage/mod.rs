//! Usage meter: append-only access log and cycle-scoped aggregates.
//!
//! Usage counters are never stored; they are computed from `access_log` over a
//! half-open time range. Recording is best-effort from the caller's point of
//! view ([`record_best_effort`]) but every failure is logged for reconciliation.

pub mod cycle;
pub mod quota;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;

pub use cycle::{cycle_window, CycleLength, CycleWindow};
pub use quota::{check_quota, get_plan, quota_status, set_plan, Plan, QuotaStatus};

use crate::config::BillingConfig;
use crate::db::{self, timestamp, Db};
use crate::error::{GatewayError, Result};
use crate::identity::Account;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Add,
    Search,
    List,
    Delete,
}

impl AccessKind {
    pub const ALL: [AccessKind; 4] = [Self::Add, Self::Search, Self::List, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Search => "search",
            Self::List => "list",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "search" => Ok(Self::Search),
            "list" => Ok(Self::List),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("unknown access kind: {s}")),
        }
    }
}

/// One gateway-mediated operation, about to be appended to the log.
#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub account_id: String,
    pub app_id: String,
    pub memory_id: Option<String>,
    pub kind: AccessKind,
    pub at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// A stored access log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub id: i64,
    pub app_id: String,
    pub app_name: Option<String>,
    pub memory_id: Option<String>,
    pub kind: String,
    pub created_at: String,
    pub metadata: Option<serde_json::Value>,
}

/// One page of a memory's access log, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogPage {
    pub total: u64,
    pub entries: Vec<AccessLogEntry>,
}

/// Append events in one transaction.
pub fn record(conn: &mut Connection, events: &[AccessEvent]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO access_log (account_id, app_id, memory_id, kind, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for event in events {
            let metadata = event
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            stmt.execute(params![
                event.account_id,
                event.app_id,
                event.memory_id,
                event.kind.as_str(),
                metadata,
                timestamp(event.at)
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Record without failing the caller. Failures are logged with enough context
/// to reconcile the log later.
pub async fn record_best_effort(db: &Db, events: Vec<AccessEvent>) {
    if events.is_empty() {
        return;
    }
    let summary: Vec<(String, AccessKind, DateTime<Utc>)> = events
        .iter()
        .map(|e| (e.app_id.clone(), e.kind, e.at))
        .collect();
    if let Err(e) = db::run(db, move |conn| record(conn, &events)).await {
        for (app_id, kind, at) in summary {
            tracing::warn!(
                app = %app_id,
                kind = %kind,
                at = %timestamp(at),
                error = %e,
                "failed to record usage event"
            );
        }
    }
}

/// Number of events for the account in `[start, end)`.
pub fn count_in_window(
    conn: &Connection,
    account_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM access_log
         WHERE account_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        params![account_id, timestamp(start), timestamp(end)],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct AppUsage {
    pub app_id: String,
    pub app_name: Option<String>,
    pub requests: u64,
}

/// `{total, by_kind, by_day}` plus a per-application breakdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageAggregate {
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub by_day: BTreeMap<String, u64>,
    pub by_app: Vec<AppUsage>,
}

/// Aggregate the account's events in `[start, end)`.
pub fn aggregate(
    conn: &Connection,
    account_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<UsageAggregate> {
    let (start, end) = (timestamp(start), timestamp(end));
    let mut agg = UsageAggregate::default();
    for kind in AccessKind::ALL {
        agg.by_kind.insert(kind.as_str().to_string(), 0);
    }

    let mut stmt = conn.prepare(
        "SELECT kind, substr(created_at, 1, 10) AS day, COUNT(*) FROM access_log
         WHERE account_id = ?1 AND created_at >= ?2 AND created_at < ?3
         GROUP BY kind, day",
    )?;
    let rows = stmt.query_map(params![account_id, start, end], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)? as u64,
        ))
    })?;
    for row in rows {
        let (kind, day, n) = row?;
        agg.total += n;
        *agg.by_kind.entry(kind).or_insert(0) += n;
        *agg.by_day.entry(day).or_insert(0) += n;
    }

    let mut stmt = conn.prepare(
        "SELECT l.app_id, a.name, COUNT(*) FROM access_log l
         LEFT JOIN applications a ON a.id = l.app_id
         WHERE l.account_id = ?1 AND l.created_at >= ?2 AND l.created_at < ?3
         GROUP BY l.app_id ORDER BY COUNT(*) DESC, l.app_id",
    )?;
    agg.by_app = stmt
        .query_map(params![account_id, start, end], |row| {
            Ok(AppUsage {
                app_id: row.get(0)?,
                app_name: row.get(1)?,
                requests: row.get::<_, i64>(2)? as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(agg)
}

/// Access log of one memory, newest first, skipping `offset` entries.
pub fn memory_access_log(
    conn: &Connection,
    memory_id: &str,
    offset: u64,
    limit: u64,
) -> Result<AccessLogPage> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM access_log WHERE memory_id = ?1",
        params![memory_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT l.id, l.app_id, a.name, l.memory_id, l.kind, l.created_at, l.metadata
         FROM access_log l LEFT JOIN applications a ON a.id = l.app_id
         WHERE l.memory_id = ?1 ORDER BY l.id DESC LIMIT ?2 OFFSET ?3",
    )?;
    let entries = stmt
        .query_map(params![memory_id, limit as i64, offset as i64], |row| {
            let metadata: Option<String> = row.get(6)?;
            Ok(AccessLogEntry {
                id: row.get(0)?,
                app_id: row.get(1)?,
                app_name: row.get(2)?,
                memory_id: row.get(3)?,
                kind: row.get(4)?,
                created_at: row.get(5)?,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(AccessLogPage {
        total: total as u64,
        entries,
    })
}

/// Dashboard view returned by `GET /stats/usage` and `memgate stats`.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub user_id: String,
    pub start_date: String,
    pub end_date: String,
    pub total_requests: u64,
    pub requests_by_type: BTreeMap<String, u64>,
    pub usage_by_date: BTreeMap<String, u64>,
    pub usage_by_app: Vec<AppUsage>,
    pub plan_id: String,
    pub billing_cycle: String,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub cycle_requests: u64,
    pub plan_quota: Option<u64>,
    pub plan_usage_percent: Option<f64>,
}

/// Days covered by a report when the caller gives no range.
pub const DEFAULT_REPORT_DAYS: i64 = 30;

/// Build the usage report for inclusive calendar dates `start..=end` (UTC).
/// Missing bounds default to the last [`DEFAULT_REPORT_DAYS`] days.
pub fn usage_report(
    conn: &Connection,
    account: &Account,
    billing: &BillingConfig,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Result<UsageReport> {
    let end_date = end_date.unwrap_or_else(|| now.date_naive());
    let start_date =
        start_date.unwrap_or_else(|| end_date - Duration::days(DEFAULT_REPORT_DAYS - 1));
    if start_date > end_date {
        return Err(GatewayError::Validation(format!(
            "start_date {start_date} is after end_date {end_date}"
        )));
    }

    let start = start_date.and_time(chrono::NaiveTime::MIN).and_utc();
    let end = (end_date + Duration::days(1)).and_time(chrono::NaiveTime::MIN).and_utc();
    let agg = aggregate(conn, &account.id, start, end)?;
    let status = quota_status(conn, account, billing, now)?;

    let plan_usage_percent = status.limit.map(|limit| {
        if limit == 0 {
            100.0
        } else {
            ((status.used as f64 / limit as f64) * 10_000.0).round() / 100.0
        }
    });

    Ok(UsageReport {
        user_id: account.user_id.clone(),
        start_date: start_date.to_string(),
        end_date: end_date.to_string(),
        total_requests: agg.total,
        requests_by_type: agg.by_kind,
        usage_by_date: agg.by_day,
        usage_by_app: agg.by_app,
        plan_id: status.plan.plan_id.clone(),
        billing_cycle: status.plan.cycle.to_string(),
        cycle_start: status.window.start,
        cycle_end: status.window.end,
        cycle_requests: status.used,
        plan_quota: status.limit,
        plan_usage_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn event(kind: AccessKind, at: DateTime<Utc>) -> AccessEvent {
        AccessEvent {
            account_id: "acct".into(),
            app_id: "app".into(),
            memory_id: None,
            kind,
            at,
            metadata: None,
        }
    }

    #[test]
    fn aggregate_groups_by_kind_and_day() {
        let mut conn = open_memory_database().unwrap();
        let day1: DateTime<Utc> = "2026-10-01T23:59:59Z".parse().unwrap();
        let day2: DateTime<Utc> = "2026-10-02T00:00:00Z".parse().unwrap();
        record(
            &mut conn,
            &[
                event(AccessKind::Add, day1),
                event(AccessKind::Search, day1),
                event(AccessKind::Search, day2),
            ],
        )
        .unwrap();

        let agg = aggregate(&conn, "acct", day1, day2 + Duration::days(1)).unwrap();
        assert_eq!(agg.total, 3);
        assert_eq!(agg.by_kind["search"], 2);
        assert_eq!(agg.by_kind["delete"], 0);
        assert_eq!(agg.by_day["2026-10-01"], 2);
        assert_eq!(agg.by_day["2026-10-02"], 1);
        assert_eq!(agg.by_app[0].requests, 3);
    }

    #[test]
    fn window_is_half_open() {
        let mut conn = open_memory_database().unwrap();
        let start: DateTime<Utc> = "2026-10-01T00:00:00Z".parse().unwrap();
        let end = start + Duration::days(30);
        record(
            &mut conn,
            &[
                event(AccessKind::Add, start),
                event(AccessKind::Add, end - Duration::microseconds(1)),
                event(AccessKind::Add, end),
                event(AccessKind::Add, start - Duration::microseconds(1)),
            ],
        )
        .unwrap();
        assert_eq!(count_in_window(&conn, "acct", start, end).unwrap(), 2);
    }

    #[test]
    fn metadata_survives_in_memory_log() {
        let mut conn = open_memory_database().unwrap();
        let mut e = event(AccessKind::Search, Utc::now());
        e.memory_id = Some("m1".into());
        e.metadata = Some(serde_json::json!({"score": 0.5, "protocol": "ws"}));
        record(&mut conn, &[e]).unwrap();

        let page = memory_access_log(&conn, "m1", 0, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].metadata.as_ref().unwrap()["protocol"], "ws");
        assert!(memory_access_log(&conn, "m1", 1, 10).unwrap().entries.is_empty());
    }
}
