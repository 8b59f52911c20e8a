use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use memgate::config::GatewayConfig;
use memgate::usage::{self, CycleLength};

/// Assign a plan. `quota = None` means unlimited; the anchor defaults to now.
pub fn set(
    config: &GatewayConfig,
    user_id: &str,
    plan_id: &str,
    quota: Option<u64>,
    cycle: &str,
    anchor: Option<&str>,
) -> Result<()> {
    let cycle: CycleLength = cycle.parse().map_err(anyhow::Error::msg)?;
    let now = Utc::now();
    let anchor = match anchor {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
            })
            .with_context(|| format!("invalid anchor {raw:?}, expected RFC 3339 or YYYY-MM-DD"))?,
        None => now,
    };

    let conn = super::open(config)?;
    let account = super::require_account(&conn, user_id)?;
    usage::set_plan(&conn, &account.id, plan_id, quota, cycle, anchor, now)?;

    let status = usage::quota_status(&conn, &account, &config.billing, now)?;
    println!("Plan for {}: {} ({})", account.user_id, plan_id, cycle);
    match quota {
        Some(q) => println!("  Quota:         {q} requests per cycle"),
        None => println!("  Quota:         unlimited"),
    }
    println!(
        "  Current cycle: {} .. {}",
        status.window.start.to_rfc3339(),
        status.window.end.to_rfc3339()
    );
    println!("  Used so far:   {}", status.used);
    Ok(())
}
