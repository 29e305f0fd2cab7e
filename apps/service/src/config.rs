use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerting::AlertPolicy;
use crate::capture::CaptureSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to write config {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory: set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub alerts: Alerts,
    pub scheduler: Scheduler,
    pub check: Check,
    pub capture: Capture,
    pub database: Database,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alerts {
    pub failure_threshold: u32,
    pub cooldown_minutes: u64,
    /// Incoming webhook for notifications; absent disables delivery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scheduler {
    pub min_check_interval_seconds: u64,
    /// How often the running service re-reads targets from the database
    pub reload_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Check {
    pub timeout_seconds: u64,
    pub max_body_bytes: usize,
    pub dns_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capture {
    pub enabled: bool,
    pub tool: String,
    pub interface: String,
    pub filter: String,
    pub max_packets: u32,
    pub warmup_ms: u64,
    pub grace_ms: u64,
    pub max_window_seconds: u64,
    /// Extract resources from the fetched page when capture saw nothing
    pub document_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: path::PathBuf,
}

impl Default for Alerts {
    fn default() -> Self {
        Self { failure_threshold: 2, cooldown_minutes: 15, webhook_url: None }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self { min_check_interval_seconds: 10, reload_interval_seconds: 30, shutdown_grace_seconds: 10 }
    }
}

impl Default for Check {
    fn default() -> Self {
        Self { timeout_seconds: 10, max_body_bytes: 2 * 1024 * 1024, dns_timeout_ms: 2000 }
    }
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            enabled: true,
            tool: "tcpdump".into(),
            interface: "any".into(),
            filter: "tcp port 80 or tcp port 443 or udp port 443".into(),
            max_packets: 500,
            warmup_ms: 500,
            grace_ms: 2000,
            max_window_seconds: 15,
            document_fallback: true,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self { path: default_database_path() }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/pagewatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("pagewatch/config.toml"))
}

/// $XDG_DATA_HOME/pagewatch/pagewatch.db, $HOME/.local/share/..., or the
/// working directory
fn default_database_path() -> path::PathBuf {
    let base = if let Ok(data_home) = env::var("XDG_DATA_HOME") {
        path::PathBuf::from(data_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".local/share")
    } else {
        return path::PathBuf::from("pagewatch.db");
    };
    base.join("pagewatch/pagewatch.db")
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv { name, value })
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Configuration:")?;
        write_title_1(f, "Alerts")?;
        write_1(f, "Failure Threshold", &self.alerts.failure_threshold)?;
        write_1(f, "Cooldown (minutes)", &self.alerts.cooldown_minutes)?;
        write_1(f, "Webhook", &if self.alerts.webhook_url.is_some() { "configured" } else { "disabled" })?;

        write_title_1(f, "Scheduler")?;
        write_1(f, "Minimum Interval (s)", &self.scheduler.min_check_interval_seconds)?;
        write_1(f, "Reload Interval (s)", &self.scheduler.reload_interval_seconds)?;
        write_1(f, "Shutdown Grace (s)", &self.scheduler.shutdown_grace_seconds)?;

        write_title_1(f, "Check")?;
        write_1(f, "Timeout (s)", &self.check.timeout_seconds)?;
        write_1(f, "Max Body (bytes)", &self.check.max_body_bytes)?;
        write_1(f, "DNS Timeout (ms)", &self.check.dns_timeout_ms)?;

        write_title_1(f, "Capture")?;
        write_1(f, "Enabled", &self.capture.enabled)?;
        write_1(f, "Tool", &self.capture.tool)?;
        write_1(f, "Interface", &self.capture.interface)?;
        write_1(f, "Filter", &self.capture.filter)?;
        write_1(f, "Max Packets", &self.capture.max_packets)?;
        write_1(f, "Warm-up (ms)", &self.capture.warmup_ms)?;
        write_1(f, "Grace (ms)", &self.capture.grace_ms)?;
        write_1(f, "Max Window (s)", &self.capture.max_window_seconds)?;
        write_1(f, "Document Fallback", &self.capture.document_fallback)?;

        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/pagewatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist.
    ///  Environment overrides are applied on top.
    ///
    /// ```ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let mut config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            tracing::info!(path = %config_path.display(), "Created default configuration");
            config
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup("PAGEWATCH_WEBHOOK_URL").or_else(|| lookup("SLACK_WEBHOOK_URL")) {
            self.alerts.webhook_url = Some(url.trim().to_string());
        }
        if let Some(value) = lookup("ALERT_FAILURE_THRESHOLD") {
            self.alerts.failure_threshold = parse_env("ALERT_FAILURE_THRESHOLD", value)?;
        }
        if let Some(value) = lookup("ALERT_COOLDOWN_MINUTES") {
            self.alerts.cooldown_minutes = parse_env("ALERT_COOLDOWN_MINUTES", value)?;
        }
        if let Some(value) = lookup("PAGEWATCH_MIN_CHECK_INTERVAL") {
            self.scheduler.min_check_interval_seconds = parse_env("PAGEWATCH_MIN_CHECK_INTERVAL", value)?;
        }
        if let Some(value) = lookup("PAGEWATCH_DATABASE_PATH") {
            self.database.path = path::PathBuf::from(value.trim());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alerts.failure_threshold == 0 {
            return Err(ConfigError::Invalid("alerts.failure_threshold must be at least 1".into()));
        }
        if self.check.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("check.timeout_seconds must be at least 1".into()));
        }
        if self.scheduler.min_check_interval_seconds == 0 {
            return Err(ConfigError::Invalid("scheduler.min_check_interval_seconds must be at least 1".into()));
        }
        if self.capture.max_window_seconds == 0 {
            return Err(ConfigError::Invalid("capture.max_window_seconds must be at least 1".into()));
        }
        Ok(())
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            failure_threshold: self.alerts.failure_threshold,
            cooldown: chrono::Duration::minutes(self.alerts.cooldown_minutes.min(i64::MAX as u64 / 60_000) as i64),
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            warmup: Duration::from_millis(self.capture.warmup_ms),
            grace: Duration::from_millis(self.capture.grace_ms),
            max_window: Duration::from_secs(self.capture.max_window_seconds),
        }
    }
}
