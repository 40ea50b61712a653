//! Configuration management for multipost

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, CredentialError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    pub facebook: Option<FacebookAppConfig>,
    pub tiktok: Option<TikTokAppConfig>,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Credential-at-rest encryption settings.
///
/// The master key is mandatory: without it stored tokens cannot be
/// decrypted, so startup fails loudly instead of falling back to a
/// generated key that would orphan everything already stored.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub master_key: Option<String>,
}

impl EncryptionConfig {
    /// Resolve the master key from config or `MULTIPOST_MASTER_KEY`.
    pub fn require_master_key(&self) -> Result<String> {
        if let Some(key) = &self.master_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        if let Ok(key) = std::env::var("MULTIPOST_MASTER_KEY") {
            if !key.is_empty() {
                return Ok(key);
            }
        }
        Err(CredentialError::MasterKeyMissing.into())
    }
}

/// App-level credentials for the Facebook Graph API. Instagram publishing
/// goes through the same Graph app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacebookAppConfig {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TikTokAppConfig {
    pub client_key: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Worker pool size per platform queue.
    #[serde(default = "default_per_platform")]
    pub per_platform: u32,
    /// Hard bound on any single remote call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_per_platform() -> u32 {
    4
}

fn default_call_timeout() -> u64 {
    30
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            per_platform: default_per_platform(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Credentials expiring within this window are refreshed by a sweep.
    #[serde(default = "default_lookahead")]
    pub lookahead_secs: i64,
}

fn default_lookahead() -> i64 {
    2 * 3600
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: default_lookahead(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Audit entries older than this are purged by the retention sweep.
    #[serde(default = "default_audit_days")]
    pub audit_days: i64,
}

fn default_audit_days() -> i64 {
    90
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            audit_days: default_audit_days(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/multipost/multipost.db".to_string(),
            },
            encryption: EncryptionConfig::default(),
            facebook: None,
            tiktok: None,
            workers: WorkersConfig::default(),
            refresh: RefreshConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("MULTIPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("multipost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [database]
            path = "/tmp/multipost.db"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.path, "/tmp/multipost.db");
        assert_eq!(config.workers.per_platform, 4);
        assert_eq!(config.workers.call_timeout_secs, 30);
        assert_eq!(config.refresh.lookahead_secs, 7200);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retention.audit_days, 90);
        assert!(config.facebook.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [database]
            path = "/tmp/multipost.db"

            [encryption]
            master_key = "0123456789abcdef0123456789abcdef"

            [facebook]
            app_id = "fb-app"
            app_secret = "fb-secret"

            [tiktok]
            client_key = "tt-key"
            client_secret = "tt-secret"

            [workers]
            per_platform = 2
            call_timeout_secs = 10

            [retry]
            max_attempts = 3
            base_delay_secs = 1
            max_delay_secs = 60
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workers.per_platform, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.facebook.unwrap().app_id, "fb-app");
        assert_eq!(config.tiktok.unwrap().client_key, "tt-key");
        assert_eq!(
            config.encryption.require_master_key().unwrap(),
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    #[serial]
    fn test_master_key_missing_is_an_error() {
        std::env::remove_var("MULTIPOST_MASTER_KEY");
        let config = Config::default_config();
        let err = config.encryption.require_master_key().unwrap_err();
        assert!(matches!(
            err,
            crate::error::MultipostError::Credential(CredentialError::MasterKeyMissing)
        ));
        assert!(format!("{}", err).contains("encryption.master_key"));
    }

    #[test]
    #[serial]
    fn test_master_key_from_env() {
        std::env::set_var("MULTIPOST_MASTER_KEY", "env-master-key-0123456789");
        let config = Config::default_config();
        assert_eq!(
            config.encryption.require_master_key().unwrap(),
            "env-master-key-0123456789"
        );
        std::env::remove_var("MULTIPOST_MASTER_KEY");
    }

    #[test]
    #[serial]
    fn test_config_field_wins_over_env() {
        std::env::set_var("MULTIPOST_MASTER_KEY", "env-key-0123456789abcdef");
        let mut config = Config::default_config();
        config.encryption.master_key = Some("config-key-0123456789abc".to_string());
        assert_eq!(
            config.encryption.require_master_key().unwrap(),
            "config-key-0123456789abc"
        );
        std::env::remove_var("MULTIPOST_MASTER_KEY");
    }

    #[test]
    fn test_load_from_missing_path() {
        let result = Config::load_from_path(&PathBuf::from("/nonexistent/config.toml"));
        assert!(result.is_err());
    }
}
