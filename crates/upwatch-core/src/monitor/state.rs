use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tracker::{Health, OutageTracker};
use crate::config::{ProbeMethod, ServiceConfig};
use crate::probe::ProbeOutcome;

/// Lifecycle of a monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Active,
    Stopping,
    Stopped,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Mutable runtime record of one service. Owned by its monitor task only.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub tracker: OutageTracker,
    pub last_ok: Option<bool>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub checks: u64,
}

impl ServiceState {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            tracker: OutageTracker::new(config.fail_threshold, config.recover_threshold),
            last_ok: None,
            last_checked: None,
            last_latency_ms: None,
            last_error: None,
            checks: 0,
        }
    }

    pub fn observe(&mut self, outcome: &ProbeOutcome, at: DateTime<Utc>) {
        self.checks += 1;
        self.last_ok = Some(outcome.success);
        self.last_checked = Some(at);
        if outcome.success {
            // An unparsed ping keeps the previous latency visible.
            if let Some(ms) = outcome.latency_ms() {
                self.last_latency_ms = Some(ms);
            }
        } else {
            self.last_error = outcome.error.clone();
        }
    }
}

/// Read-only snapshot published after every check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub method: ProbeMethod,
    pub target: String,
    pub interval_secs: f64,
    pub state: MonitorState,
    pub health: Health,
    pub last_ok: Option<bool>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub checks: u64,
    pub open_outage_id: Option<i64>,
}

impl ServiceStatus {
    pub fn snapshot(config: &ServiceConfig, state: &ServiceState, lifecycle: MonitorState) -> Self {
        Self {
            name: config.name.clone(),
            method: config.method,
            target: config.target.clone(),
            interval_secs: config.interval.as_secs_f64(),
            state: lifecycle,
            health: state.tracker.health(),
            last_ok: state.last_ok,
            last_checked: state.last_checked,
            last_latency_ms: state.last_latency_ms,
            last_error: state.last_error.clone(),
            consecutive_failures: state.tracker.consecutive_failures(),
            consecutive_successes: state.tracker.consecutive_successes(),
            checks: state.checks,
            open_outage_id: state.tracker.open_outage().map(|o| o.id),
        }
    }
}
