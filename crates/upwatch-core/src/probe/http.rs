use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{redirect, Client};
use tracing::{debug, warn};

use super::{ProbeOutcome, Prober};

/// HTTP GET probe. Any status in `[200, 400)` counts as up.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
    url: String,
}

impl HttpProber {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(Self::build_client(timeout), url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Redirects are reported rather than followed so a 3xx is a success.
    pub fn build_client(timeout: Duration) -> Client {
        Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self) -> ProbeOutcome {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let elapsed = started.elapsed();
                if (200..400).contains(&status) {
                    debug!(url = %self.url, status, latency_ms = elapsed.as_millis() as u64, "HTTP check ok");
                    ProbeOutcome::ok(Some(elapsed))
                } else {
                    warn!(url = %self.url, status, "HTTP check returned error status");
                    ProbeOutcome::failed(format!("HTTP {}", status))
                }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    e.to_string()
                };
                warn!(url = %self.url, error = %reason, "HTTP check failed");
                ProbeOutcome::failed(format!("Request to {} failed: {}", self.url, reason))
            }
        }
    }
}
