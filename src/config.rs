use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub billing: BillingConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Streaming connections with no inbound frame for this long are closed.
    pub idle_timeout_secs: u64,
    /// Upper bound on a single tool call, engine round trip included.
    pub call_timeout_secs: u64,
    /// Calls buffered per connection while an earlier call is still running.
    pub max_pending_calls: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// `local` (in-process) or `http`.
    pub provider: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BillingConfig {
    /// Ceiling applied to accounts without an explicit plan.
    pub default_quota: u64,
    pub default_cycle: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub code_ttl_secs: u64,
    pub code_resend_secs: u64,
    pub max_code_attempts: u32,
    pub captcha_ttl_secs: u64,
    pub session_ttl_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8765,
            log_level: "info".into(),
            idle_timeout_secs: 300,
            call_timeout_secs: 15,
            max_pending_calls: 32,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_memgate_dir()
            .join("gateway.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            base_url: "http://127.0.0.1:8000".into(),
            timeout_secs: 10,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_quota: 5000,
            default_cycle: "monthly".into(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 600,
            code_resend_secs: 60,
            max_code_attempts: 5,
            captcha_ttl_secs: 300,
            session_ttl_days: 30,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Returns `~/.memgate/`, or `./.memgate/` when no home directory is known.
pub fn default_memgate_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memgate")
}

/// Returns the default config file path: `~/.memgate/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memgate_dir().join("config.toml")
}

impl GatewayConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MEMGATE_DB, MEMGATE_LOG_LEVEL, MEMGATE_PORT, MEMGATE_ENGINE_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMGATE_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMGATE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MEMGATE_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MEMGATE_PORT"),
            }
        }
        if let Ok(val) = std::env::var("MEMGATE_ENGINE_URL") {
            self.engine.base_url = val;
            self.engine.provider = "http".into();
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.engine.provider, "local");
        assert_eq!(config.billing.default_quota, 5000);
        assert_eq!(config.auth.code_ttl_secs, 600);
        assert!(config.storage.db_path.ends_with("gateway.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
idle_timeout_secs = 30

[storage]
db_path = "/tmp/test.db"

[billing]
default_quota = 100
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.billing.default_quota, 100);
        // defaults still apply for unset fields
        assert_eq!(config.server.call_timeout_secs, 15);
        assert_eq!(config.billing.default_cycle, "monthly");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = GatewayConfig::default();
        std::env::set_var("MEMGATE_DB", "/tmp/override.db");
        std::env::set_var("MEMGATE_LOG_LEVEL", "trace");
        std::env::set_var("MEMGATE_ENGINE_URL", "http://engine:9000");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.engine.base_url, "http://engine:9000");
        assert_eq!(config.engine.provider, "http");

        // Clean up
        std::env::remove_var("MEMGATE_DB");
        std::env::remove_var("MEMGATE_LOG_LEVEL");
        std::env::remove_var("MEMGATE_ENGINE_URL");
    }
}
