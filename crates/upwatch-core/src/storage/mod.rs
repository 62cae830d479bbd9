//! Persistence collaborator used by the monitoring engine.
//!
//! The engine only ever talks to [`Storage`]; the two implementations are an
//! in-process [`MemoryStore`] and a SQLite-backed [`SqliteStore`]. Every row is
//! scoped to a single service, so writes from different monitor tasks never
//! contend on a shared invariant.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("outage {0} not found")]
    OutageNotFound(i64),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}

impl From<tokio_rusqlite::Error> for StorageError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// A persisted interval during which a service was considered down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outage {
    pub id: i64,
    pub service: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl Outage {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub id: i64,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestSample {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub server: String,
}

/// Storage operations consumed by the monitors and the speed-test runner.
///
/// Each call is atomic on its own. The trait is object-safe and `Send + Sync`
/// so one store can be shared behind an `Arc` by every task.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_outage(
        &self,
        service: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, StorageError>;

    async fn end_outage(
        &self,
        id: i64,
        end_time: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Result<(), StorageError>;

    /// Newest outage of `service` that has no end time.
    async fn get_open_outage(&self, service: &str) -> Result<Option<Outage>, StorageError>;

    async fn append_latency_sample(
        &self,
        service: &str,
        timestamp: DateTime<Utc>,
        success: bool,
        latency_ms: Option<f64>,
    ) -> Result<(), StorageError>;

    async fn append_speedtest_sample(&self, sample: &SpeedtestSample) -> Result<(), StorageError>;

    /// Keep only the newest `keep_count` latency samples of `service`.
    /// Returns the number of rows removed.
    async fn prune_latency_samples(
        &self,
        service: &str,
        keep_count: usize,
    ) -> Result<usize, StorageError>;
}

/// Seconds between two instants, microsecond resolution.
pub fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn duration_seconds_is_end_minus_start() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 30).unwrap();
        assert_eq!(duration_seconds(start, end), 90.0);
        assert_eq!(duration_seconds(start, start), 0.0);
    }

    #[test]
    fn duration_seconds_keeps_sub_millisecond_part() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let end = start + chrono::Duration::microseconds(1500);
        assert_eq!(duration_seconds(start, end), 0.0015);
        assert_eq!(duration_seconds(end, start), -0.0015);
    }
}
