pub mod engine;
pub mod error;
pub mod state;
pub mod tracker;

pub use engine::ServiceMonitor;
pub use error::MonitorError;
pub use state::{MonitorState, ServiceState, ServiceStatus};
pub use tracker::{Decision, Health, OpenOutage, OutageTracker};
