#![forbid(unsafe_code)]

pub mod config;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod speedtest;
pub mod storage;
pub mod supervisor;

pub use config::{
    ConfigError, NotifierConfig, ProbeMethod, RetentionConfig, ServiceConfig, SpeedTestConfig,
};
pub use monitor::{
    Health, MonitorError, MonitorState, OpenOutage, OutageTracker, ServiceMonitor, ServiceStatus,
};
pub use notify::{
    DeliveryStatus, NotificationContext, Notifier, OutageEvent, OutagePayload, WebhookDispatcher,
};
pub use probe::{prober_for, HttpProber, PingProber, ProbeOutcome, Prober};
pub use speedtest::{
    ExternalCommand, FailureKind, ServiceList, SpeedTestCommand, SpeedTestFailure,
    SpeedTestRunner, SpeedTestSummary,
};
pub use storage::{
    LatencySample, MemoryStore, Outage, SpeedtestSample, SqliteStore, Storage, StorageError,
};
pub use supervisor::{ProberFactory, Supervisor, SupervisorError};
