//! CLI `keys` commands: create and list API keys for an account.

use anyhow::Result;
use chrono::Utc;

use memgate::config::GatewayConfig;
use memgate::identity::api_keys;

/// Create a key and print it once.
pub fn create(config: &GatewayConfig, user_id: &str, name: Option<&str>) -> Result<()> {
    let conn = super::open(config)?;
    let account = super::require_account(&conn, user_id)?;
    let (info, key) = api_keys::create_api_key(&conn, &account.id, name, Utc::now())?;

    println!("Created API key {} for {}", info.id, account.user_id);
    println!();
    println!("  {key}");
    println!();
    println!("Store it now; it cannot be shown again.");
    Ok(())
}

pub fn list(config: &GatewayConfig, user_id: &str) -> Result<()> {
    let conn = super::open(config)?;
    let account = super::require_account(&conn, user_id)?;
    let keys = api_keys::list_api_keys(&conn, &account.id)?;

    if keys.is_empty() {
        println!("No API keys for {}", account.user_id);
        return Ok(());
    }
    println!("{:<38} {:<20} {:<16} {:<28} status", "id", "prefix", "name", "last used");
    for key in keys {
        println!(
            "{:<38} {:<20} {:<16} {:<28} {}",
            key.id,
            key.prefix,
            key.name.as_deref().unwrap_or("-"),
            key.last_used_at.as_deref().unwrap_or("never"),
            if key.revoked { "revoked" } else { "active" }
        );
    }
    Ok(())
}
