//! Periodic bandwidth measurement through an external tool.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SpeedTestConfig;
use crate::storage::{SpeedtestSample, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CommandMissing,
    ReturnCode,
    Timeout,
    ParseError,
    ExecutionError,
}

impl FailureKind {
    /// Missing binaries and unreadable output do not improve on retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ReturnCode | Self::Timeout | Self::ExecutionError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CommandMissing => "command_missing",
            Self::ReturnCode => "return_code",
            Self::Timeout => "timeout",
            Self::ParseError => "parse_error",
            Self::ExecutionError => "execution_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct SpeedTestFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SpeedTestFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One invocation of the bandwidth tool, returning its stdout.
#[async_trait]
pub trait SpeedTestCommand: Send + Sync {
    async fn execute(&self, timeout: Duration) -> Result<String, SpeedTestFailure>;
}

/// Runs a configured argv as a child process.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    argv: Vec<String>,
}

impl ExternalCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl SpeedTestCommand for ExternalCommand {
    async fn execute(&self, timeout: Duration) -> Result<String, SpeedTestFailure> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(SpeedTestFailure::new(
                FailureKind::CommandMissing,
                "no speed test command configured",
            ));
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let kind = if e.kind() == io::ErrorKind::NotFound {
                    FailureKind::CommandMissing
                } else {
                    FailureKind::ExecutionError
                };
                SpeedTestFailure::new(kind, format!("failed to run {}: {}", program, e))
            })?;

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SpeedTestFailure::new(
                    FailureKind::Timeout,
                    format!("{} did not finish within {:?}", program, timeout),
                )
            })?
            .map_err(|e| SpeedTestFailure::new(FailureKind::ExecutionError, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(200).collect();
            return Err(SpeedTestFailure::new(
                FailureKind::ReturnCode,
                format!("{} exited with {}: {}", program, output.status, excerpt),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parsed result of one bandwidth test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub server: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawReport {
    Ookla(OoklaReport),
    Classic(ClassicReport),
}

/// `speedtest -f json`: bandwidth in bytes per second.
#[derive(Deserialize)]
struct OoklaReport {
    download: OoklaThroughput,
    upload: OoklaThroughput,
    ping: OoklaPing,
    #[serde(default)]
    server: Option<OoklaServer>,
}

#[derive(Deserialize)]
struct OoklaThroughput {
    bandwidth: f64,
}

#[derive(Deserialize)]
struct OoklaPing {
    latency: f64,
}

#[derive(Deserialize)]
struct OoklaServer {
    name: Option<String>,
    location: Option<String>,
}

/// `speedtest-cli --json`: bits per second.
#[derive(Deserialize)]
struct ClassicReport {
    download: f64,
    upload: f64,
    ping: f64,
    #[serde(default)]
    server: Option<ClassicServer>,
}

#[derive(Deserialize)]
struct ClassicServer {
    sponsor: Option<String>,
    name: Option<String>,
}

fn server_label(primary: Option<String>, secondary: Option<String>) -> String {
    match (primary, secondary) {
        (Some(p), Some(s)) => format!("{} ({})", p, s),
        (Some(p), None) => p,
        (None, Some(s)) => s,
        (None, None) => "unknown".into(),
    }
}

pub fn parse_output(output: &str) -> Result<Measurement, SpeedTestFailure> {
    let report: RawReport = serde_json::from_str(output.trim())
        .map_err(|e| SpeedTestFailure::new(FailureKind::ParseError, e.to_string()))?;

    let m = match report {
        RawReport::Ookla(r) => {
            let (name, location) = r.server.map(|s| (s.name, s.location)).unwrap_or_default();
            Measurement {
                download_mbps: r.download.bandwidth * 8.0 / 1_000_000.0,
                upload_mbps: r.upload.bandwidth * 8.0 / 1_000_000.0,
                ping_ms: r.ping.latency,
                server: server_label(name, location),
            }
        }
        RawReport::Classic(r) => {
            let (sponsor, name) = r.server.map(|s| (s.sponsor, s.name)).unwrap_or_default();
            Measurement {
                download_mbps: r.download / 1_000_000.0,
                upload_mbps: r.upload / 1_000_000.0,
                ping_ms: r.ping,
                server: server_label(sponsor, name),
            }
        }
    };
    Ok(m)
}

/// Pick the services a cycle measures.
///
/// `*` or an empty selector means every service. A comma list keeps the known
/// names in listed order. Anything that matches nothing falls back to every
/// service.
pub fn resolve_targets(selector: &str, services: &[String]) -> Vec<String> {
    let selector = selector.trim();
    if selector.is_empty() || selector == "*" {
        return services.to_vec();
    }

    let mut picked: Vec<String> = Vec::new();
    for name in selector.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if services.iter().any(|s| s == name) && !picked.iter().any(|p| p == name) {
            picked.push(name.to_string());
        }
    }

    if picked.is_empty() {
        warn!(selector, "Speed test target matches no service, testing all services");
        return services.to_vec();
    }
    picked
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpeedTestSummary {
    Success {
        service: String,
        attempts: u32,
        download_mbps: f64,
        upload_mbps: f64,
        ping_ms: f64,
        server: String,
    },
    Failure {
        service: String,
        attempts: u32,
        kind: FailureKind,
        message: String,
    },
}

impl SpeedTestSummary {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }
}

/// Shared, ordered list of service names a runner may measure.
///
/// Clones see each other's additions, so a runner resolves targets against
/// whatever is registered when a cycle begins.
#[derive(Debug, Clone, Default)]
pub struct ServiceList(Arc<RwLock<Vec<String>>>);

impl ServiceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `name` unless already present. Returns whether it was added.
    pub fn insert(&self, name: &str) -> bool {
        let mut names = self.0.write().unwrap_or_else(|e| e.into_inner());
        if names.iter().any(|n| n == name) {
            return false;
        }
        names.push(name.to_string());
        true
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl From<Vec<String>> for ServiceList {
    fn from(names: Vec<String>) -> Self {
        let list = Self::new();
        for name in &names {
            list.insert(name);
        }
        list
    }
}

pub struct SpeedTestRunner {
    config: SpeedTestConfig,
    services: ServiceList,
    command: Arc<dyn SpeedTestCommand>,
    storage: Arc<dyn Storage>,
}

impl SpeedTestRunner {
    pub fn new(
        config: SpeedTestConfig,
        services: impl Into<ServiceList>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let command = Arc::new(ExternalCommand::new(config.command.clone()));
        Self {
            config,
            services: services.into(),
            command,
            storage,
        }
    }

    pub fn with_command(mut self, command: Arc<dyn SpeedTestCommand>) -> Self {
        self.command = command;
        self
    }

    pub fn config(&self) -> &SpeedTestConfig {
        &self.config
    }

    pub fn targets(&self) -> Vec<String> {
        resolve_targets(&self.config.target_selector, &self.services.snapshot())
    }

    /// One retrying run for `service`. Never errors: every outcome is a summary.
    pub async fn run_once(&self, service: &str) -> SpeedTestSummary {
        let max_attempts = self.config.retry_count.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let delay = self.config.backoff_for(attempt);
            if !delay.is_zero() {
                debug!(service, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::time::sleep(delay).await;
            }

            let result = match self.command.execute(self.config.timeout).await {
                Ok(output) => parse_output(&output),
                Err(e) => Err(e),
            };

            match result {
                Ok(m) => return self.persist(service, attempt, m).await,
                Err(failure) => {
                    if !failure.kind.is_retryable() || attempt >= max_attempts {
                        warn!(
                            service,
                            attempt,
                            kind = %failure.kind,
                            error = %failure.message,
                            "Speed test failed"
                        );
                        return SpeedTestSummary::Failure {
                            service: service.to_string(),
                            attempts: attempt,
                            kind: failure.kind,
                            message: failure.message,
                        };
                    }
                    warn!(
                        service,
                        attempt,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Speed test attempt failed, retrying"
                    );
                }
            }
        }
    }

    async fn persist(&self, service: &str, attempts: u32, m: Measurement) -> SpeedTestSummary {
        let sample = SpeedtestSample {
            timestamp: Utc::now(),
            service: service.to_string(),
            download_mbps: m.download_mbps,
            upload_mbps: m.upload_mbps,
            ping_ms: m.ping_ms,
            server: m.server.clone(),
        };

        if let Err(e) = self.storage.append_speedtest_sample(&sample).await {
            warn!(service, error = %e, "Failed to store speed test sample");
            return SpeedTestSummary::Failure {
                service: service.to_string(),
                attempts,
                kind: FailureKind::ExecutionError,
                message: format!("failed to store sample: {}", e),
            };
        }

        info!(
            service,
            attempts,
            download_mbps = m.download_mbps,
            upload_mbps = m.upload_mbps,
            ping_ms = m.ping_ms,
            server = %m.server,
            "Speed test complete"
        );
        SpeedTestSummary::Success {
            service: service.to_string(),
            attempts,
            download_mbps: m.download_mbps,
            upload_mbps: m.upload_mbps,
            ping_ms: m.ping_ms,
            server: m.server,
        }
    }

    /// Measure every resolved target, one after another.
    pub async fn run_cycle(&self) -> Vec<SpeedTestSummary> {
        let mut summaries = Vec::new();
        for service in self.targets() {
            summaries.push(self.run_once(&service).await);
        }
        summaries
    }

    /// Run a cycle now and then every interval until shutdown.
    ///
    /// A shutdown during a cycle abandons it; the child process is killed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            selector = %self.config.target_selector,
            "Starting speed test runner"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                summaries = self.run_cycle() => {
                    let ok = summaries.iter().filter(|s| s.is_success()).count();
                    debug!(ok, total = summaries.len(), "Speed test cycle finished");
                }
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Speed test runner stopped");
    }
}
