use anyhow::Result;
use chrono::Utc;

use memgate::config::GatewayConfig;
use memgate::usage;

/// Display an account's usage report in the terminal.
pub fn stats(config: &GatewayConfig, user_id: &str) -> Result<()> {
    let conn = super::open(config)?;
    let account = super::require_account(&conn, user_id)?;
    let report = usage::usage_report(&conn, &account, &config.billing, None, None, Utc::now())?;

    println!("Usage for {}", report.user_id);
    println!("{}", "=".repeat(40));
    println!("  Range:               {} .. {}", report.start_date, report.end_date);
    println!("  Total requests:      {}", report.total_requests);
    println!();

    println!("By Type:");
    for (kind, count) in &report.requests_by_type {
        println!("  {:<12} {}", kind, count);
    }
    println!();

    if !report.usage_by_app.is_empty() {
        println!("By Application:");
        for app in &report.usage_by_app {
            let name = app.app_name.as_deref().unwrap_or("(deleted)");
            println!("  {:<24} {}", name, app.requests);
        }
        println!();
    }

    println!("Plan:                  {} ({})", report.plan_id, report.billing_cycle);
    println!(
        "Current cycle:         {} .. {}",
        report.cycle_start.format("%Y-%m-%d %H:%M"),
        report.cycle_end.format("%Y-%m-%d %H:%M")
    );
    match (report.plan_quota, report.plan_usage_percent) {
        (Some(quota), Some(percent)) => {
            println!("Cycle usage:           {} / {} ({percent}%)", report.cycle_requests, quota);
        }
        _ => println!("Cycle usage:           {} (unlimited)", report.cycle_requests),
    }

    Ok(())
}
