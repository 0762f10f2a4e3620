//! Time Capsule configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CapsuleError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl AppConfig {
    /// Load config from the default path (~/.timecapsule/config.toml), falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CapsuleError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CapsuleError::Config(format!("Failed to parse config: {e}")))
    }

    /// Secrets may come from the environment instead of the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(password) = std::env::var("TIMECAPSULE_SMTP_PASSWORD")
            && !password.is_empty()
        {
            self.smtp.password = password;
        }
        if let Ok(secret) = std::env::var("TIMECAPSULE_CRON_SECRET")
            && !secret.is_empty()
        {
            self.sweep.cron_secret = Some(secret);
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Time Capsule home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".timecapsule")
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Capsule database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.timecapsule/capsules.db".into() }

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Outgoing mail (SMTP) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// When disabled, deliveries are only logged.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Sender address; falls back to `username` when empty.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl SmtpConfig {
    /// Effective sender address.
    pub fn sender(&self) -> &str {
        if self.from.is_empty() {
            &self.username
        } else {
            &self.from
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            display_name: None,
        }
    }
}

/// Delivery attempt limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound for one gateway call, in seconds. 0 = no limit.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
    /// Attachments larger than this are refused by the mail gateway.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

fn default_delivery_timeout() -> u64 { 60 }
fn default_max_attachment_bytes() -> u64 { 25 * 1024 * 1024 }

impl DeliveryConfig {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_secs > 0).then(|| std::time::Duration::from_secs(self.timeout_secs))
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout(),
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Built-in periodic sweep interval, in seconds. 0 = rely on an external trigger.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Max capsules processed in parallel by one sweep.
    #[serde(default = "default_sweep_concurrency")]
    pub concurrency: usize,
    /// Bearer token required by the HTTP cron endpoint.
    #[serde(default)]
    pub cron_secret: Option<String>,
}

fn default_sweep_interval() -> u64 { 60 }
fn default_sweep_concurrency() -> usize { 8 }

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            concurrency: default_sweep_concurrency(),
            cron_secret: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert!(!config.smtp.enabled);
        assert_eq!(config.sweep.interval_secs, 60);
        assert_eq!(config.sweep.concurrency, 8);
        assert_eq!(
            config.delivery.timeout(),
            Some(std::time::Duration::from_secs(60))
        );
    }

    #[test]
    fn test_parse_sections() {
        let config = AppConfig::parse(
            r#"
            [server]
            port = 8080

            [smtp]
            enabled = true
            host = "mail.example.com"
            username = "bot@example.com"

            [delivery]
            timeout_secs = 0

            [sweep]
            interval_secs = 0
            cron_secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.smtp.enabled);
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.smtp.sender(), "bot@example.com");
        assert!(config.delivery.timeout().is_none());
        assert_eq!(config.sweep.cron_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = AppConfig::parse("[server\nport = ").unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("timecapsule-test-config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/tc.db\"\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/tc.db"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
