//! Configuration loading from TOML files and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted idle threshold (one week).
pub const MAX_IDLE_THRESHOLD_SECS: u64 = 7 * 24 * 60 * 60;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of the tracked user and machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub machine_id: String,
    /// How long shutdown waits for the loops to notice the stop flag.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            machine_id: String::new(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl AgentConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Idle detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Idle threshold in seconds.
    #[serde(default = "default_idle_threshold")]
    pub threshold_seconds: u64,
    /// Check interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: default_idle_threshold(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl IdleConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_seconds)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Activity sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Sampling mode: "real" or "synthetic".
    #[serde(default)]
    pub mode: ActivityMode,
    /// How often the platform input facility is polled, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            mode: ActivityMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ActivityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivityMode {
    #[default]
    Real,
    Synthetic,
}

impl std::str::FromStr for ActivityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "real" => Ok(Self::Real),
            "synthetic" | "simulate" => Ok(Self::Synthetic),
            other => anyhow::bail!("Unknown activity mode: {}", other),
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database URL, e.g. `sqlite://time_tracker.db`.
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// Default value functions
fn default_shutdown_grace_ms() -> u64 {
    500
}

fn default_idle_threshold() -> u64 {
    120
}

fn default_check_interval_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_store_url() -> String {
    "sqlite://time_tracker.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            // Try default config locations
            let default_paths = [
                PathBuf::from("config/default.toml"),
                dirs::config_dir()
                    .map(|d| d.join("idletrack/config.toml"))
                    .unwrap_or_default(),
            ];

            let mut loaded = None;
            for path in &default_paths {
                if path.is_file() {
                    loaded = Some(Self::from_file(path)?);
                    break;
                }
            }
            loaded.unwrap_or_default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        Ok(config)
    }

    /// Apply `IDLETRACK_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("IDLETRACK_USER") {
            self.agent.user_id = val;
        }
        if let Some(val) = lookup("IDLETRACK_MACHINE") {
            self.agent.machine_id = val;
        }
        if let Some(val) = lookup("IDLETRACK_IDLE_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.idle.threshold_seconds = v;
            }
        }
        if let Some(val) = lookup("IDLETRACK_CHECK_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.idle.check_interval_ms = v;
            }
        }
        if let Some(val) = lookup("IDLETRACK_ACTIVITY_MODE") {
            if let Ok(v) = val.parse() {
                self.activity.mode = v;
            }
        }
        if let Some(val) = lookup("IDLETRACK_DB_URL") {
            self.store.url = val;
        }
        if let Some(val) = lookup("IDLETRACK_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("IDLETRACK_LOG_FORMAT") {
            match val.to_ascii_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "text" => self.logging.format = LogFormat::Text,
                _ => {}
            }
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.agent.user_id.trim().is_empty() {
            anyhow::bail!("User id cannot be empty");
        }
        if self.agent.machine_id.trim().is_empty() {
            anyhow::bail!("Machine id cannot be empty");
        }
        if self.idle.threshold_seconds == 0 {
            anyhow::bail!("Idle threshold must be greater than 0");
        }
        if self.idle.threshold_seconds > MAX_IDLE_THRESHOLD_SECS {
            anyhow::bail!(
                "Idle threshold {}s exceeds the maximum of {}s",
                self.idle.threshold_seconds,
                MAX_IDLE_THRESHOLD_SECS
            );
        }
        if self.idle.check_interval_ms == 0 {
            anyhow::bail!("Idle check interval must be greater than 0");
        }
        if self.activity.poll_interval_ms == 0 {
            anyhow::bail!("Activity poll interval must be greater than 0");
        }
        if self.store.url.trim().is_empty() {
            anyhow::bail!("Store URL cannot be empty");
        }
        Ok(())
    }

    /// Store URL with a leading `~` in the path expanded.
    pub fn store_url(&self) -> String {
        expand_tilde_url(&self.store.url)
    }
}

/// Expand `sqlite://~/...` to the home directory.
fn expand_tilde_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("sqlite://~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("sqlite://{}", home.join(rest).display());
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.agent.user_id = "alice".to_string();
        config.agent.machine_id = "WC-01".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.idle.threshold(), Duration::from_secs(120));
        assert_eq!(config.idle.check_interval(), Duration::from_secs(2));
        assert_eq!(config.agent.shutdown_grace(), Duration::from_millis(500));
        assert_eq!(config.activity.mode, ActivityMode::Real);
        assert_eq!(config.store.url, "sqlite://time_tracker.db");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_from_file_fills_missing_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[agent]
user_id = "alice"
machine_id = "WC-01"

[idle]
threshold_seconds = 300

[activity]
mode = "synthetic"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.agent.user_id, "alice");
        assert_eq!(config.idle.threshold_seconds, 300);
        assert_eq!(config.idle.check_interval_ms, 2000);
        assert_eq!(config.activity.mode, ActivityMode::Synthetic);
        assert_eq!(config.store.max_connections, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[idle\nthreshold_seconds = ").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("IDLETRACK_USER", "bob"),
            ("IDLETRACK_IDLE_THRESHOLD", "45"),
            ("IDLETRACK_CHECK_INTERVAL_MS", "not-a-number"),
            ("IDLETRACK_ACTIVITY_MODE", "synthetic"),
            ("IDLETRACK_DB_URL", "sqlite://other.db"),
            ("IDLETRACK_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.agent.user_id, "bob");
        assert_eq!(config.agent.machine_id, "WC-01");
        assert_eq!(config.idle.threshold_seconds, 45);
        assert_eq!(config.idle.check_interval_ms, 2000);
        assert_eq!(config.activity.mode, ActivityMode::Synthetic);
        assert_eq!(config.store.url, "sqlite://other.db");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate() {
        valid().validate().unwrap();

        let mut config = valid();
        config.agent.user_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.idle.threshold_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.store.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_caps_idle_threshold() {
        let mut config = valid();
        config.idle.threshold_seconds = MAX_IDLE_THRESHOLD_SECS;
        config.validate().unwrap();

        config.apply_overrides(|key| {
            (key == "IDLETRACK_IDLE_THRESHOLD").then(|| (u64::MAX / 2).to_string())
        });
        assert_eq!(config.idle.threshold_seconds, u64::MAX / 2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"), "{err}");
    }

    #[test]
    fn test_activity_mode_parsing() {
        assert_eq!("REAL".parse::<ActivityMode>().unwrap(), ActivityMode::Real);
        assert_eq!("simulate".parse::<ActivityMode>().unwrap(), ActivityMode::Synthetic);
        assert!("mouse".parse::<ActivityMode>().is_err());
    }

    #[test]
    fn test_store_url_tilde_expansion() {
        let mut config = valid();
        assert_eq!(config.store_url(), "sqlite://time_tracker.db");

        config.store.url = "sqlite://~/tracker.db".to_string();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.store_url(), format!("sqlite://{}", home.join("tracker.db").display()));
        }
    }
}
