mod http;
mod ping;

pub use http::HttpProber;
pub use ping::{parse_ping_time, PingProber};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{ProbeMethod, ServiceConfig};

/// Result of one connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Round trip, `None` when unsuccessful or not measurable.
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn ok(latency: Option<Duration>) -> Self {
        Self {
            success: true,
            latency,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency: None,
            error: Some(error.into()),
        }
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.map(|d| d.as_secs_f64() * 1000.0)
    }
}

/// Trait for a single connectivity check against one target.
///
/// Implementations must return within their own timeout and never error:
/// every failure is folded into an unsuccessful [`ProbeOutcome`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// Build the prober matching a service's configured method.
pub fn prober_for(config: &ServiceConfig) -> Arc<dyn Prober> {
    match config.method {
        ProbeMethod::Ping => Arc::new(PingProber::new(&config.target, config.probe_timeout)),
        ProbeMethod::Http => Arc::new(HttpProber::new(config.http_url(), config.probe_timeout)),
    }
}
