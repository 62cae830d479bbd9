//! TOML configuration file schema and parsing.
//!
//! Example config file:
//!
//! ```toml
//! [general]
//! log_format = "json"
//! database = "upwatch.sqlite3"
//!
//! [defaults]
//! interval_seconds = 5
//! fail_threshold = 3
//!
//! [webhook]
//! url = "https://hooks.example.com/upwatch"
//! send_start = true
//!
//! [speedtest]
//! enabled = true
//! target = "isp"
//!
//! [[service]]
//! name = "isp"
//! target = "8.8.8.8"
//!
//! [[service]]
//! name = "homepage"
//! method = "http"
//! target = "example.com"
//! recover_threshold = 3
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use upwatch_core::{NotifierConfig, ProbeMethod, ServiceConfig, SpeedTestConfig};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub webhook: WebhookSection,

    #[serde(default)]
    pub speedtest: SpeedTestSection,

    /// Raw `[[service]]` tables, decoded one at a time so a bad entry
    /// only drops itself.
    #[serde(default)]
    pub service: Vec<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// SQLite file path, or `:memory:` for a store that dies with the process.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            database: default_database(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_database() -> String {
    "upwatch.sqlite3".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_interval")]
    pub interval_seconds: f64,

    #[serde(default = "default_threshold")]
    pub fail_threshold: u32,

    #[serde(default = "default_threshold")]
    pub recover_threshold: u32,

    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            interval_seconds: default_interval(),
            fail_threshold: default_threshold(),
            recover_threshold: default_threshold(),
            timeout_seconds: default_probe_timeout(),
        }
    }
}

fn default_method() -> String {
    "ping".into()
}

fn default_interval() -> f64 {
    1.0
}

fn default_threshold() -> u32 {
    2
}

fn default_probe_timeout() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSection {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: f64,

    #[serde(default = "default_dedup_window")]
    pub dedup_window_seconds: f64,

    #[serde(default)]
    pub send_start: bool,

    #[serde(default = "default_true")]
    pub send_end: bool,

    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: default_webhook_timeout(),
            dedup_window_seconds: default_dedup_window(),
            send_start: false,
            send_end: true,
            secret: None,
        }
    }
}

fn default_webhook_timeout() -> f64 {
    5.0
}

fn default_dedup_window() -> f64 {
    300.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeedTestSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_speedtest_interval")]
    pub interval_seconds: f64,

    #[serde(default = "default_speedtest_target")]
    pub target: String,

    #[serde(default = "default_speedtest_timeout")]
    pub timeout_seconds: f64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: f64,

    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl Default for SpeedTestSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_speedtest_interval(),
            target: default_speedtest_target(),
            timeout_seconds: default_speedtest_timeout(),
            retry_count: default_retry_count(),
            backoff_base_seconds: default_backoff_base(),
            backoff_max_seconds: default_backoff_max(),
            command: None,
        }
    }
}

fn default_speedtest_interval() -> f64 {
    3600.0
}

fn default_speedtest_target() -> String {
    "*".into()
}

fn default_speedtest_timeout() -> f64 {
    120.0
}

fn default_retry_count() -> u32 {
    2
}

fn default_backoff_base() -> f64 {
    5.0
}

fn default_backoff_max() -> f64 {
    60.0
}

/// One `[[service]]` entry. Omitted fields come from `[defaults]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    pub target: String,
    pub method: Option<String>,
    pub interval_seconds: Option<f64>,
    pub fail_threshold: Option<u32>,
    pub recover_threshold: Option<u32>,
    pub timeout_seconds: Option<f64>,
}

fn seconds(field: &str, value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("{} = {}: {}", field, value, e))
}

fn seconds_or(field: &str, value: f64, fallback: Duration) -> Duration {
    seconds(field, value).unwrap_or_else(|e| {
        warn!(error = %e, fallback_secs = fallback.as_secs_f64(), "Invalid duration, using default");
        fallback
    })
}

impl ServiceDef {
    pub fn from_value(value: &toml::Value) -> Result<Self, String> {
        value.clone().try_into().map_err(|e: toml::de::Error| e.to_string())
    }

    pub fn to_service_config(&self, defaults: &DefaultsConfig) -> Result<ServiceConfig, String> {
        let method: ProbeMethod = self
            .method
            .as_deref()
            .unwrap_or(&defaults.method)
            .parse()
            .map_err(|e: upwatch_core::ConfigError| e.to_string())?;
        let interval = seconds(
            "interval_seconds",
            self.interval_seconds.unwrap_or(defaults.interval_seconds),
        )?;
        let timeout = seconds(
            "timeout_seconds",
            self.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        )?;

        let config = ServiceConfig::new(&self.name, method, &self.target)
            .with_interval(interval)
            .with_thresholds(
                self.fail_threshold.unwrap_or(defaults.fail_threshold),
                self.recover_threshold.unwrap_or(defaults.recover_threshold),
            )
            .with_probe_timeout(timeout);
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `pretty` or `json`; anything else is reported and treated as `pretty`.
    pub fn log_format(&self) -> &str {
        match self.general.log_format.as_str() {
            "json" => "json",
            _ => "pretty",
        }
    }

    pub fn log_format_is_valid(&self) -> bool {
        matches!(self.general.log_format.as_str(), "pretty" | "json")
    }

    /// Valid services in file order. Invalid and repeated entries are skipped.
    pub fn service_configs(&self) -> Vec<ServiceConfig> {
        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(self.service.len());

        for (i, value) in self.service.iter().enumerate() {
            let name = value.get("name").and_then(toml::Value::as_str).unwrap_or("<unnamed>");
            let config = match ServiceDef::from_value(value)
                .and_then(|def| def.to_service_config(&self.defaults))
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(index = i, service = %name, error = %e, "Skipping invalid service");
                    continue;
                }
            };
            if !seen.insert(config.name.clone()) {
                warn!(index = i, service = %config.name, "Skipping duplicate service name");
                continue;
            }
            services.push(config);
        }
        services
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        let wh = &self.webhook;
        let defaults = NotifierConfig::default();
        let mut config = defaults
            .clone()
            .with_timeout(seconds_or("webhook.timeout_seconds", wh.timeout_seconds, defaults.timeout))
            .with_dedup_window(seconds_or(
                "webhook.dedup_window_seconds",
                wh.dedup_window_seconds,
                defaults.dedup_window,
            ))
            .with_events(wh.send_start, wh.send_end);

        if let Some(url) = wh.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            match url::Url::parse(url) {
                Ok(_) => config = config.with_url(url),
                Err(e) => warn!(url, error = %e, "Invalid webhook URL, notifications disabled"),
            }
        }
        if let Some(secret) = wh.secret.as_deref().filter(|s| !s.is_empty()) {
            config = config.with_secret(secret);
        }
        config
    }

    pub fn speedtest_config(&self) -> SpeedTestConfig {
        let st = &self.speedtest;
        let defaults = SpeedTestConfig::default();
        let mut config = defaults
            .clone()
            .with_enabled(st.enabled)
            .with_interval(seconds_or("speedtest.interval_seconds", st.interval_seconds, defaults.interval))
            .with_target_selector(&st.target)
            .with_timeout(seconds_or("speedtest.timeout_seconds", st.timeout_seconds, defaults.timeout))
            .with_retry_count(st.retry_count)
            .with_backoff(
                seconds_or("speedtest.backoff_base_seconds", st.backoff_base_seconds, defaults.backoff_base),
                seconds_or("speedtest.backoff_max_seconds", st.backoff_max_seconds, defaults.backoff_max),
            );
        if let Some(command) = st.command.clone().filter(|c| !c.is_empty()) {
            config = config.with_command(command);
        }
        config
    }
}
