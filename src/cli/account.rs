use anyhow::{bail, Result};
use chrono::Utc;
use std::io::Write;

use memgate::config::GatewayConfig;
use memgate::identity::accounts;

/// Soft-delete an account after confirmation. Its applications and access
/// history stay; every API key and session stops resolving.
pub fn delete(config: &GatewayConfig, user_id: &str, yes: bool) -> Result<()> {
    let conn = super::open(config)?;
    let account = super::require_account(&conn, user_id)?;

    if !yes {
        println!("This will disable account {} ({}).", account.user_id, account.id);
        println!("API keys are revoked and sessions dropped; history is kept.");
        print!("\nType YES to confirm: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != "YES" {
            bail!("delete cancelled");
        }
    }

    accounts::soft_delete_account(&conn, &account.id, Utc::now())?;
    println!("Account {} deleted.", account.user_id);
    Ok(())
}
