//! Client configuration.
//!
//! Loaded from a TOML file (`/etc/uapro/uapro.toml` by default). Every key is
//! optional:
//!
//! ```toml
//! [client]
//! data_dir = "/var/lib/uapro"
//! contract_url = "https://contracts.canonical.com"
//! log_level = "info"
//!
//! [contract_expiry]
//! soon_window_days = 20
//! grace_period_days = 14
//!
//! [upgrade]
//! apt_lock_path = "/var/lib/apt/lists/lock"
//! retry_interval = "10s"
//!
//! [apt]
//! http_proxy = "http://proxy.internal:3128"
//! ```

mod apply;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::apply::{APT_PROXY_HEADER, process_config, render_apt_proxy};
use crate::expiry::{DEFAULT_GRACE_PERIOD_DAYS, DEFAULT_SOON_WINDOW_DAYS, ExpiryPolicy};
use crate::system::SystemError;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/uapro/uapro.toml";

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UaConfig {
    /// Client paths and endpoints.
    #[serde(default)]
    pub client: ClientSection,

    /// Contract expiry windows.
    #[serde(default)]
    pub contract_expiry: ExpirySection,

    /// Release-upgrade processing.
    #[serde(default)]
    pub upgrade: UpgradeSection,

    /// MOTD integration.
    #[serde(default)]
    pub motd: MotdSection,

    /// Apt integration.
    #[serde(default)]
    pub apt: AptSection,
}

/// `[client]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSection {
    /// State directory holding the token, lock and message files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Contract server base URL.
    #[serde(default = "default_contract_url")]
    pub contract_url: String,

    /// Default log level for the CLI.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file; stderr when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/uapro")
}

fn default_contract_url() -> String {
    "https://contracts.canonical.com".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            contract_url: default_contract_url(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// `[contract_expiry]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirySection {
    /// Days before expiry at which the contract counts as expiring soon.
    #[serde(default = "default_soon_window_days")]
    pub soon_window_days: u32,

    /// Days after expiry during which entitlements keep working.
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: u32,
}

const fn default_soon_window_days() -> u32 {
    DEFAULT_SOON_WINDOW_DAYS
}

const fn default_grace_period_days() -> u32 {
    DEFAULT_GRACE_PERIOD_DAYS
}

impl Default for ExpirySection {
    fn default() -> Self {
        Self {
            soon_window_days: default_soon_window_days(),
            grace_period_days: default_grace_period_days(),
        }
    }
}

impl ExpirySection {
    /// Bucket boundaries for expiry resolution.
    #[must_use]
    pub fn policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::from_days(self.soon_window_days, self.grace_period_days)
    }
}

/// `[upgrade]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSection {
    /// Lock file apt holds while it runs.
    #[serde(default = "default_apt_lock_path")]
    pub apt_lock_path: PathBuf,

    /// Wait between apt lock polls.
    #[serde(default = "default_retry_interval")]
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Private ESM apt cache; `<data_dir>/apt/esm` when unset.
    #[serde(default)]
    pub esm_cache_dir: Option<PathBuf>,
}

fn default_apt_lock_path() -> PathBuf {
    PathBuf::from("/var/lib/apt/lists/lock")
}

const fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for UpgradeSection {
    fn default() -> Self {
        Self {
            apt_lock_path: default_apt_lock_path(),
            retry_interval: default_retry_interval(),
            esm_cache_dir: None,
        }
    }
}

/// `[motd]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotdSection {
    /// Optional helper regenerating the package-update MOTD section.
    #[serde(default = "default_update_notifier_script")]
    pub update_notifier_script: PathBuf,

    /// Command the MOTD machinery cannot work without.
    #[serde(default = "default_required_command")]
    pub required_command: String,
}

fn default_update_notifier_script() -> PathBuf {
    PathBuf::from("/usr/lib/update-notifier/update-motd-updates-available")
}

fn default_required_command() -> String {
    "run-parts".to_string()
}

impl Default for MotdSection {
    fn default() -> Self {
        Self {
            update_notifier_script: default_update_notifier_script(),
            required_command: default_required_command(),
        }
    }
}

/// `[apt]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AptSection {
    /// Directory for per-service sources files.
    #[serde(default = "default_sources_dir")]
    pub sources_dir: PathBuf,

    /// Apt configuration file carrying the proxy settings.
    #[serde(default = "default_proxy_conf_path")]
    pub proxy_conf_path: PathBuf,

    /// HTTP proxy for apt.
    #[serde(default)]
    pub http_proxy: Option<String>,

    /// HTTPS proxy for apt.
    #[serde(default)]
    pub https_proxy: Option<String>,
}

fn default_sources_dir() -> PathBuf {
    PathBuf::from("/etc/apt/sources.list.d")
}

fn default_proxy_conf_path() -> PathBuf {
    PathBuf::from("/etc/apt/apt.conf.d/90uapro-aptproxy")
}

impl Default for AptSection {
    fn default() -> Self {
        Self {
            sources_dir: default_sources_dir(),
            proxy_conf_path: default_proxy_conf_path(),
            http_proxy: None,
            https_proxy: None,
        }
    }
}

impl UaConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values serde cannot check.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first invalid
    /// value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.client.data_dir.is_absolute() {
            return Err(ConfigError::Validation(format!(
                "client.data_dir must be an absolute path, got {}",
                self.client.data_dir.display()
            )));
        }
        check_url("client.contract_url", &self.client.contract_url)?;
        if !LOG_LEVELS.contains(&self.client.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "client.log_level must be one of {}, got {:?}",
                LOG_LEVELS.join(", "),
                self.client.log_level
            )));
        }
        if self.upgrade.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "upgrade.retry_interval must be greater than zero".to_string(),
            ));
        }
        if let Some(proxy) = &self.apt.http_proxy {
            check_url("apt.http_proxy", proxy)?;
        }
        if let Some(proxy) = &self.apt.https_proxy {
            check_url("apt.https_proxy", proxy)?;
        }
        Ok(())
    }

    /// Host lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.client.data_dir.join("lock")
    }

    /// Machine token file.
    #[must_use]
    pub fn token_path(&self) -> PathBuf {
        self.client.data_dir.join("private").join("machine-token.json")
    }

    /// MOTD contract-status message file.
    #[must_use]
    pub fn motd_message_path(&self) -> PathBuf {
        self.client
            .data_dir
            .join("messages")
            .join("motd-contract-status")
    }

    /// Snapshot of the configuration last applied by `refresh config`.
    #[must_use]
    pub fn effective_config_path(&self) -> PathBuf {
        self.client.data_dir.join("effective-config.json")
    }

    /// Private ESM apt cache.
    #[must_use]
    pub fn esm_cache_dir(&self) -> PathBuf {
        self.upgrade
            .esm_cache_dir
            .clone()
            .unwrap_or_else(|| self.client.data_dir.join("apt").join("esm"))
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{field} is not a valid URL ({value:?}): {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "{field} must use http or https, got {value:?}"
        )));
    }
    Ok(())
}

/// Errors from loading or applying configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// Writing derived files failed.
    #[error("failed to apply configuration: {0}")]
    System(#[from] SystemError),

    /// Effective-configuration snapshot could not be encoded.
    #[error("failed to encode effective configuration: {0}")]
    Json(#[from] serde_json::Error),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = UaConfig::from_toml("").unwrap();
        assert_eq!(config, UaConfig::default());
        assert_eq!(config.upgrade.retry_interval, Duration::from_secs(10));
        assert_eq!(config.contract_expiry.policy(), ExpiryPolicy::default());
        assert_eq!(
            config.motd_message_path(),
            PathBuf::from("/var/lib/uapro/messages/motd-contract-status")
        );
        assert_eq!(config.esm_cache_dir(), PathBuf::from("/var/lib/uapro/apt/esm"));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let config = UaConfig::from_toml(
            r#"
[client]
data_dir = "/srv/uapro"
log_level = "debug"

[contract_expiry]
grace_period_days = 92

[upgrade]
retry_interval = "2s"
esm_cache_dir = "/tmp/esm"

[apt]
http_proxy = "http://proxy.internal:3128"
"#,
        )
        .unwrap();

        assert_eq!(config.lock_path(), PathBuf::from("/srv/uapro/lock"));
        assert_eq!(
            config.token_path(),
            PathBuf::from("/srv/uapro/private/machine-token.json")
        );
        assert_eq!(config.contract_expiry.soon_window_days, 20);
        assert_eq!(config.contract_expiry.grace_period_days, 92);
        assert_eq!(config.upgrade.retry_interval, Duration::from_secs(2));
        assert_eq!(config.esm_cache_dir(), PathBuf::from("/tmp/esm"));
        assert_eq!(config.apt.http_proxy.as_deref(), Some("http://proxy.internal:3128"));
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip_keeps_humantime() {
        let config = UaConfig::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("retry_interval = \"10s\""));
        assert_eq!(UaConfig::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        assert!(matches!(
            UaConfig::from_toml("[upgrade]\nretry_interval = \"soon\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = UaConfig::default();
        config.apt.https_proxy = Some("ftp://proxy".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Validation(msg)) if msg.contains("apt.https_proxy")));

        let mut config = UaConfig::default();
        config.client.data_dir = PathBuf::from("relative");
        assert!(config.validate().is_err());

        let mut config = UaConfig::default();
        config.client.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = UaConfig::default();
        config.upgrade.retry_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uapro.toml");
        assert_eq!(UaConfig::load_or_default(&path).unwrap(), UaConfig::default());

        std::fs::write(&path, "[client]\nlog_level = \"warn\"\n").unwrap();
        assert_eq!(UaConfig::load_or_default(&path).unwrap().client.log_level, "warn");
        assert!(UaConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
