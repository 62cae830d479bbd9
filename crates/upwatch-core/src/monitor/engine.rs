use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::MonitorError;
use super::state::{MonitorState, ServiceState, ServiceStatus};
use super::tracker::{Decision, OpenOutage};
use crate::config::{RetentionConfig, ServiceConfig};
use crate::notify::{NotificationContext, Notifier};
use crate::probe::Prober;
use crate::storage::Storage;

/// Drives the check loop of a single service.
///
/// The monitor owns its [`ServiceState`] outright. Other tasks observe it
/// through the [`ServiceStatus`] snapshots published after every check.
pub struct ServiceMonitor {
    config: Arc<ServiceConfig>,
    context: NotificationContext,
    prober: Arc<dyn Prober>,
    storage: Arc<dyn Storage>,
    notifier: Option<Notifier>,
    retention: RetentionConfig,
    state: ServiceState,
    /// Also the single source of the lifecycle state.
    status_tx: Arc<watch::Sender<ServiceStatus>>,
}

impl ServiceMonitor {
    pub fn new(
        config: impl Into<Arc<ServiceConfig>>,
        prober: Arc<dyn Prober>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let config: Arc<ServiceConfig> = config.into();
        let state = ServiceState::new(&config);
        let (status_tx, _) = watch::channel(ServiceStatus::snapshot(
            &config,
            &state,
            MonitorState::Idle,
        ));
        Self {
            context: NotificationContext::from(&*config),
            config,
            prober,
            storage,
            notifier: None,
            retention: RetentionConfig::default(),
            state,
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn status(&self) -> ServiceStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    /// Adopt an outage left open by a previous run of this service.
    ///
    /// Returns the adopted outage, if any. A lookup failure is logged and the
    /// monitor starts out healthy.
    pub async fn resume(&mut self) -> Option<OpenOutage> {
        let found = match self.storage.get_open_outage(&self.config.name).await {
            Ok(found) => found,
            Err(e) => {
                error!(service = %self.config.name, error = %e, "Failed to look up open outage");
                return None;
            }
        };

        let outage = found.map(|o| OpenOutage {
            id: o.id,
            start_time: o.start_time,
        })?;
        self.state.tracker.adopt(outage);
        info!(
            service = %self.config.name,
            outage_id = outage.id,
            start_time = %outage.start_time,
            "Resumed open outage"
        );
        self.publish();
        Some(outage)
    }

    /// Run exactly one probe/record/decide iteration.
    pub async fn check_once(&mut self) -> Result<(), MonitorError> {
        let outcome = self.prober.probe().await;
        let now = Utc::now();
        self.state.observe(&outcome, now);

        if let Err(e) = self
            .storage
            .append_latency_sample(&self.config.name, now, outcome.success, outcome.latency_ms())
            .await
        {
            error!(service = %self.config.name, error = %e, "Failed to store latency sample");
        }

        debug!(
            service = %self.config.name,
            success = outcome.success,
            latency_ms = ?outcome.latency_ms(),
            "Check complete"
        );

        let decision = self.state.tracker.record(outcome.success, now);
        let result = self.apply(decision).await;

        self.maintenance().await;
        self.publish();
        result
    }

    async fn apply(&mut self, decision: Decision) -> Result<(), MonitorError> {
        match decision {
            Decision::Unchanged => Ok(()),
            Decision::OpenOutage { start_time } => {
                let id = self
                    .storage
                    .create_outage(&self.config.name, start_time)
                    .await
                    .map_err(|source| MonitorError::OpenOutage {
                        service: self.config.name.clone(),
                        source,
                    })?;
                self.state.tracker.outage_opened(id, start_time);
                info!(
                    service = %self.config.name,
                    outage_id = id,
                    start_time = %start_time,
                    failures = self.state.tracker.consecutive_failures(),
                    "Outage opened"
                );
                if let Some(notifier) = &self.notifier {
                    notifier.notify_outage_start(&self.context, id, start_time);
                }
                Ok(())
            }
            Decision::CloseOutage {
                outage,
                end_time,
                duration_seconds,
            } => {
                self.storage
                    .end_outage(outage.id, end_time, duration_seconds)
                    .await
                    .map_err(|source| MonitorError::CloseOutage {
                        service: self.config.name.clone(),
                        outage_id: outage.id,
                        source,
                    })?;
                self.state.tracker.outage_closed();
                info!(
                    service = %self.config.name,
                    outage_id = outage.id,
                    duration_seconds,
                    "Outage closed"
                );
                if let Some(notifier) = &self.notifier {
                    notifier.notify_outage_end(
                        &self.context,
                        outage.id,
                        outage.start_time,
                        end_time,
                        duration_seconds,
                    );
                }
                Ok(())
            }
        }
    }

    async fn maintenance(&mut self) {
        let checks = self.state.checks;

        if self.retention.stats_every > 0 && checks % self.retention.stats_every == 0 {
            info!(
                service = %self.config.name,
                checks,
                last_ok = ?self.state.last_ok,
                last_latency_ms = ?self.state.last_latency_ms,
                consecutive_failures = self.state.tracker.consecutive_failures(),
                consecutive_successes = self.state.tracker.consecutive_successes(),
                "Monitor stats"
            );
        }

        if self.retention.prune_every > 0 && checks % self.retention.prune_every == 0 {
            match self
                .storage
                .prune_latency_samples(&self.config.name, self.retention.keep_samples)
                .await
            {
                Ok(removed) => info!(service = %self.config.name, removed, "Pruned latency samples"),
                Err(e) => error!(service = %self.config.name, error = %e, "Failed to prune latency samples"),
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_modify(|status| {
            *status = ServiceStatus::snapshot(&self.config, &self.state, status.state);
        });
    }

    fn set_lifecycle(&self, lifecycle: MonitorState) {
        self.status_tx.send_modify(|status| status.state = lifecycle);
    }

    /// Loop until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// The flag is checked before every iteration and interrupts the sleep
    /// between checks. An in-flight check always runs to completion; the
    /// status reads `stopping` while it does.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.set_lifecycle(MonitorState::Active);
        info!(
            service = %self.config.name,
            method = %self.config.method,
            target = %self.config.target,
            interval_secs = self.config.interval.as_secs_f64(),
            "Starting monitor"
        );
        self.resume().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let status_tx = Arc::clone(&self.status_tx);
            let outcome = {
                let check = AssertUnwindSafe(self.check_once()).catch_unwind();
                tokio::pin!(check);
                tokio::select! {
                    biased;
                    outcome = &mut check => outcome,
                    _ = shutdown.changed() => {
                        status_tx.send_modify(|status| status.state = MonitorState::Stopping);
                        check.await
                    }
                }
            };
            let pause = match outcome {
                Ok(Ok(())) => self.config.interval.saturating_sub(started.elapsed()),
                Ok(Err(e)) => {
                    error!(service = %self.config.name, error = %e, "Check iteration failed");
                    self.config.interval
                }
                Err(_) => {
                    error!(service = %self.config.name, "Check iteration panicked");
                    self.config.interval
                }
            };

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(service = %self.config.name, "Shutdown channel closed");
                        break;
                    }
                }
            }
        }

        self.set_lifecycle(MonitorState::Stopped);
        info!(service = %self.config.name, checks = self.state.checks, "Monitor stopped");
    }
}
