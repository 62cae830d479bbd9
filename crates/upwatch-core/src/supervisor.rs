use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigError, RetentionConfig, ServiceConfig, SpeedTestConfig};
use crate::monitor::{ServiceMonitor, ServiceStatus};
use crate::notify::Notifier;
use crate::probe::{prober_for, Prober};
use crate::speedtest::{ServiceList, SpeedTestCommand, SpeedTestRunner};
use crate::storage::Storage;

/// Builds the prober for a service. Replaceable so tests can script outcomes.
pub type ProberFactory = Arc<dyn Fn(&ServiceConfig) -> Arc<dyn Prober> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid service: {0}")]
    InvalidService(#[from] ConfigError),
    #[error("supervisor is stopped")]
    Stopped,
}

struct MonitorHandle {
    task: Option<JoinHandle<()>>,
    status: watch::Receiver<ServiceStatus>,
}

/// Owns every running [`ServiceMonitor`] and the optional speed-test task.
pub struct Supervisor {
    services: Vec<ServiceConfig>,
    storage: Arc<dyn Storage>,
    notifier: Mutex<Option<Notifier>>,
    speedtest: Option<SpeedTestConfig>,
    speedtest_command: Option<Arc<dyn SpeedTestCommand>>,
    speedtest_task: Mutex<Option<JoinHandle<()>>>,
    retention: RetentionConfig,
    prober_factory: ProberFactory,
    monitors: DashMap<String, MonitorHandle>,
    /// Monitored names in registration order, shared with the speed-test runner.
    registered: ServiceList,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl Supervisor {
    pub fn new(services: Vec<ServiceConfig>, storage: Arc<dyn Storage>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            services,
            storage,
            notifier: Mutex::new(None),
            speedtest: None,
            speedtest_command: None,
            speedtest_task: Mutex::new(None),
            retention: RetentionConfig::default(),
            prober_factory: Arc::new(prober_for),
            monitors: DashMap::new(),
            registered: ServiceList::new(),
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_notifier(self, notifier: Notifier) -> Self {
        *lock(&self.notifier) = Some(notifier);
        self
    }

    pub fn with_speedtest(mut self, config: SpeedTestConfig) -> Self {
        self.speedtest = Some(config);
        self
    }

    pub fn with_speedtest_command(mut self, command: Arc<dyn SpeedTestCommand>) -> Self {
        self.speedtest_command = Some(command);
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_prober_factory(mut self, factory: ProberFactory) -> Self {
        self.prober_factory = factory;
        self
    }

    /// Spawn one monitor per configured service plus the speed-test runner.
    ///
    /// Returns as soon as every task is scheduled. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for config in &self.services {
            match self.add_service(config.clone()) {
                Ok(true) => {}
                Ok(false) => warn!(service = %config.name, "Duplicate service name, skipping"),
                Err(e) => warn!(service = %config.name, error = %e, "Skipping service"),
            }
        }
        info!(services = self.monitors.len(), "Supervisor started");

        if let Some(config) = self.speedtest.clone().filter(|c| c.enabled) {
            let mut runner =
                SpeedTestRunner::new(config, self.registered.clone(), Arc::clone(&self.storage));
            if let Some(command) = &self.speedtest_command {
                runner = runner.with_command(Arc::clone(command));
            }
            let task = tokio::spawn(runner.run(self.shutdown_tx.subscribe()));
            *lock(&self.speedtest_task) = Some(task);
        }
    }

    /// Start monitoring one more service.
    ///
    /// Returns `Ok(false)` if a monitor with that name is already registered.
    pub fn add_service(&self, config: ServiceConfig) -> Result<bool, SupervisorError> {
        config.validate()?;
        if *self.shutdown_tx.borrow() {
            return Err(SupervisorError::Stopped);
        }

        match self.monitors.entry(config.name.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                info!(service = %config.name, method = %config.method, target = %config.target, "Adding service");
                self.registered.insert(&config.name);
                slot.insert(self.spawn_monitor(config));
                Ok(true)
            }
        }
    }

    fn spawn_monitor(&self, config: ServiceConfig) -> MonitorHandle {
        let prober = (self.prober_factory)(&config);
        let mut monitor = ServiceMonitor::new(config, prober, Arc::clone(&self.storage))
            .with_retention(self.retention);
        if let Some(notifier) = lock(&self.notifier).clone() {
            monitor = monitor.with_notifier(notifier);
        }
        let status = monitor.subscribe();
        let task = tokio::spawn(monitor.run(self.shutdown_tx.subscribe()));
        MonitorHandle {
            task: Some(task),
            status,
        }
    }

    /// Signal every task to stop and wait for all of them.
    ///
    /// Releases the notifier afterwards so its dispatcher can drain and exit.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        info!(services = self.monitors.len(), "Stopping supervisor");

        let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();
        for mut entry in self.monitors.iter_mut() {
            if let Some(task) = entry.value_mut().task.take() {
                tasks.push((entry.key().clone(), task));
            }
        }
        if let Some(task) = lock(&self.speedtest_task).take() {
            tasks.push(("speedtest".to_string(), task));
        }

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        for (name, result) in names.iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!(task = %name, error = %e, "Task ended abnormally");
            }
        }

        lock(&self.notifier).take();
        info!("Supervisor stopped");
    }

    /// Latest status of every registered monitor, sorted by name.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let mut statuses: Vec<ServiceStatus> = self
            .monitors
            .iter()
            .map(|entry| entry.value().status.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.monitors
            .get(name)
            .map(|entry| entry.value().status.borrow().clone())
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.monitors.contains_key(name) && !*self.shutdown_tx.borrow()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
