use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service name must not be empty")]
    EmptyName,
    #[error("service '{service}': {field} must be at least 1")]
    ZeroThreshold {
        service: String,
        field: &'static str,
    },
    #[error("service '{0}': interval must be greater than zero")]
    ZeroInterval(String),
    #[error("service '{service}': invalid target '{target}' ({reason})")]
    InvalidTarget {
        service: String,
        target: String,
        reason: String,
    },
    #[error("unknown probe method '{0}': must be 'ping' or 'http'")]
    UnknownMethod(String),
}

/// How a service is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    Ping,
    Http,
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => write!(f, "ping"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl FromStr for ProbeMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(Self::Ping),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::UnknownMethod(other.to_string())),
        }
    }
}

/// Immutable descriptor for one monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique key for the service.
    pub name: String,
    pub method: ProbeMethod,
    /// Host for ping, URL (scheme optional) for http.
    pub target: String,
    /// Time between the starts of two consecutive checks (default: 1s).
    pub interval: Duration,
    /// Consecutive failures needed to open an outage (default: 2).
    pub fail_threshold: u32,
    /// Consecutive successes needed to close an outage (default: 2).
    pub recover_threshold: u32,
    /// Upper bound for a single probe (default: 2s).
    pub probe_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, method: ProbeMethod, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            target: target.into(),
            interval: Duration::from_secs(1),
            fail_threshold: 2,
            recover_threshold: 2,
            probe_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_thresholds(mut self, fail_threshold: u32, recover_threshold: u32) -> Self {
        self.fail_threshold = fail_threshold;
        self.recover_threshold = recover_threshold;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// The target as an absolute URL, defaulting the scheme to `http://`.
    pub fn http_url(&self) -> String {
        normalize_http_target(&self.target)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.fail_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                service: self.name.clone(),
                field: "fail_threshold",
            });
        }
        if self.recover_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                service: self.name.clone(),
                field: "recover_threshold",
            });
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval(self.name.clone()));
        }
        if self.target.trim().is_empty() {
            return Err(ConfigError::InvalidTarget {
                service: self.name.clone(),
                target: self.target.clone(),
                reason: "empty target".into(),
            });
        }
        if self.method == ProbeMethod::Http {
            url::Url::parse(&self.http_url()).map_err(|e| ConfigError::InvalidTarget {
                service: self.name.clone(),
                target: self.target.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

pub fn normalize_http_target(target: &str) -> String {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

/// Outbound webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Webhook endpoint. `None` disables notifications.
    pub url: Option<String>,
    pub timeout: Duration,
    /// Identical notifications inside this window are suppressed (default: 300s).
    pub dedup_window: Duration,
    pub send_start: bool,
    pub send_end: bool,
    /// Optional HMAC-SHA256 signing secret for `X-Upwatch-Signature-256`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(5),
            dedup_window: Duration::from_secs(300),
            send_start: false,
            send_end: true,
            secret: None,
        }
    }
}

impl NotifierConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_events(mut self, send_start: bool, send_end: bool) -> Self {
        self.send_start = send_start;
        self.send_end = send_end;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Periodic bandwidth test settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedTestConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// A service name, `*`, or a comma-separated list of names.
    pub target_selector: String,
    /// Per-attempt limit; a hung process is killed when it expires.
    pub timeout: Duration,
    /// Extra attempts after the first for retryable failures.
    pub retry_count: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Program and arguments of the external bandwidth tool.
    pub command: Vec<String>,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(3600),
            target_selector: "*".into(),
            timeout: Duration::from_secs(120),
            retry_count: 2,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            command: vec!["speedtest-cli".into(), "--json".into()],
        }
    }
}

impl SpeedTestConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_target_selector(mut self, selector: impl Into<String>) -> Self {
        self.target_selector = selector.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Delay before the given 1-based attempt. Attempt 1 never waits.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Sample retention and periodic logging for a service monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Prune latency samples every this many checks.
    pub prune_every: u64,
    /// Newest samples kept per service when pruning.
    pub keep_samples: usize,
    /// Log a stats line every this many checks.
    pub stats_every: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            prune_every: 500,
            keep_samples: 10_000,
            stats_every: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_defaults_match_single_host_setup() {
        let c = ServiceConfig::new("default", ProbeMethod::Ping, "8.8.8.8");
        assert_eq!(c.interval, Duration::from_secs(1));
        assert_eq!(c.fail_threshold, 2);
        assert_eq!(c.recover_threshold, 2);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_thresholds() {
        let c = ServiceConfig::new("a", ProbeMethod::Ping, "1.1.1.1").with_thresholds(0, 2);
        assert_eq!(
            c.validate(),
            Err(ConfigError::ZeroThreshold {
                service: "a".into(),
                field: "fail_threshold"
            })
        );
        let c = ServiceConfig::new("a", ProbeMethod::Ping, "1.1.1.1").with_thresholds(1, 0);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::ZeroThreshold { field: "recover_threshold", .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_name_and_zero_interval() {
        let c = ServiceConfig::new("  ", ProbeMethod::Ping, "1.1.1.1");
        assert_eq!(c.validate(), Err(ConfigError::EmptyName));
        let c = ServiceConfig::new("a", ProbeMethod::Ping, "1.1.1.1").with_interval(Duration::ZERO);
        assert_eq!(c.validate(), Err(ConfigError::ZeroInterval("a".into())));
    }

    #[test]
    fn http_target_gets_default_scheme() {
        let c = ServiceConfig::new("web", ProbeMethod::Http, "example.com/health");
        assert_eq!(c.http_url(), "http://example.com/health");
        let c = ServiceConfig::new("web", ProbeMethod::Http, "https://example.com");
        assert_eq!(c.http_url(), "https://example.com");
    }

    #[test]
    fn validate_rejects_unparsable_http_target() {
        let c = ServiceConfig::new("web", ProbeMethod::Http, "http://exa mple.com");
        assert!(matches!(c.validate(), Err(ConfigError::InvalidTarget { .. })));
    }

    #[test]
    fn probe_method_parses_case_insensitively() {
        assert_eq!("PING".parse::<ProbeMethod>().unwrap(), ProbeMethod::Ping);
        assert_eq!(" http ".parse::<ProbeMethod>().unwrap(), ProbeMethod::Http);
        assert!("tcp".parse::<ProbeMethod>().is_err());
    }

    #[test]
    fn notifier_defaults_to_end_only() {
        let c = NotifierConfig::default();
        assert!(!c.send_start);
        assert!(c.send_end);
        assert_eq!(c.dedup_window, Duration::from_secs(300));
        assert!(!c.is_configured());
        assert!(c.with_url("https://hooks.example.com").is_configured());
    }

    #[test]
    fn speedtest_backoff_is_capped_exponential() {
        let c = SpeedTestConfig::default()
            .with_backoff(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(c.backoff_for(1), Duration::ZERO);
        assert_eq!(c.backoff_for(2), Duration::from_secs(5));
        assert_eq!(c.backoff_for(3), Duration::from_secs(10));
        assert_eq!(c.backoff_for(4), Duration::from_secs(20));
        assert_eq!(c.backoff_for(5), Duration::from_secs(30));
        assert_eq!(c.backoff_for(40), Duration::from_secs(30));
    }
}
