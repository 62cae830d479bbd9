use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LatencySample, Outage, SpeedtestSample, Storage, StorageError};

#[derive(Debug, Default)]
struct Tables {
    outages: Vec<Outage>,
    latency: Vec<LatencySample>,
    speedtests: Vec<SpeedtestSample>,
    next_outage_id: i64,
    next_sample_id: i64,
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn outages(&self) -> Vec<Outage> {
        self.lock().outages.clone()
    }

    pub fn outages_for(&self, service: &str) -> Vec<Outage> {
        self.lock()
            .outages
            .iter()
            .filter(|o| o.service == service)
            .cloned()
            .collect()
    }

    pub fn latency_samples(&self, service: &str) -> Vec<LatencySample> {
        self.lock()
            .latency
            .iter()
            .filter(|s| s.service == service)
            .cloned()
            .collect()
    }

    pub fn speedtest_samples(&self) -> Vec<SpeedtestSample> {
        self.lock().speedtests.clone()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_outage(
        &self,
        service: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let mut t = self.lock();
        t.next_outage_id += 1;
        let id = t.next_outage_id;
        t.outages.push(Outage {
            id,
            service: service.to_string(),
            start_time,
            end_time: None,
            duration_seconds: None,
        });
        Ok(id)
    }

    async fn end_outage(
        &self,
        id: i64,
        end_time: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Result<(), StorageError> {
        let mut t = self.lock();
        let outage = t
            .outages
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(StorageError::OutageNotFound(id))?;
        outage.end_time = Some(end_time);
        outage.duration_seconds = Some(duration_seconds);
        Ok(())
    }

    async fn get_open_outage(&self, service: &str) -> Result<Option<Outage>, StorageError> {
        Ok(self
            .lock()
            .outages
            .iter()
            .rev()
            .find(|o| o.service == service && o.is_open())
            .cloned())
    }

    async fn append_latency_sample(
        &self,
        service: &str,
        timestamp: DateTime<Utc>,
        success: bool,
        latency_ms: Option<f64>,
    ) -> Result<(), StorageError> {
        let mut t = self.lock();
        t.next_sample_id += 1;
        let id = t.next_sample_id;
        t.latency.push(LatencySample {
            id,
            service: service.to_string(),
            timestamp,
            success,
            latency_ms,
        });
        Ok(())
    }

    async fn append_speedtest_sample(&self, sample: &SpeedtestSample) -> Result<(), StorageError> {
        self.lock().speedtests.push(sample.clone());
        Ok(())
    }

    async fn prune_latency_samples(
        &self,
        service: &str,
        keep_count: usize,
    ) -> Result<usize, StorageError> {
        let mut t = self.lock();
        let total = t.latency.iter().filter(|s| s.service == service).count();
        let excess = total.saturating_sub(keep_count);
        if excess == 0 {
            return Ok(0);
        }
        // Samples are appended in id order, so the first `excess` matches are the oldest.
        let mut skipped = 0;
        t.latency.retain(|s| {
            if s.service == service && skipped < excess {
                skipped += 1;
                false
            } else {
                true
            }
        });
        Ok(excess)
    }
}
