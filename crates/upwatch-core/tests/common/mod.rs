#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use upwatch_core::storage::{Outage, SpeedtestSample};
use upwatch_core::{MemoryStore, ProbeOutcome, Prober, Storage, StorageError};

/// Returns scripted outcomes in order, then `fallback` forever.
pub struct ScriptedProber {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: bool,
    calls: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(outcomes: &[bool], fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(success: bool) -> Arc<Self> {
        Self::new(&[], success)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(self.fallback);
        if ok {
            ProbeOutcome::ok(Some(Duration::from_millis(5)))
        } else {
            ProbeOutcome::failed("scripted failure")
        }
    }
}

/// Wraps a [`MemoryStore`] and fails selected operations on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_samples: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_end: AtomicBool,
    pub fail_lookup: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_everything() -> Arc<Self> {
        let store = Self::default();
        store.fail_samples.store(true, Ordering::SeqCst);
        store.fail_create.store(true, Ordering::SeqCst);
        store.fail_end.store(true, Ordering::SeqCst);
        store.fail_lookup.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    fn check(flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Database("disk I/O error".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for FlakyStore {
    async fn create_outage(&self, service: &str, start_time: DateTime<Utc>) -> Result<i64, StorageError> {
        Self::check(&self.fail_create)?;
        self.inner.create_outage(service, start_time).await
    }

    async fn end_outage(&self, id: i64, end_time: DateTime<Utc>, duration_seconds: f64) -> Result<(), StorageError> {
        Self::check(&self.fail_end)?;
        self.inner.end_outage(id, end_time, duration_seconds).await
    }

    async fn get_open_outage(&self, service: &str) -> Result<Option<Outage>, StorageError> {
        Self::check(&self.fail_lookup)?;
        self.inner.get_open_outage(service).await
    }

    async fn append_latency_sample(
        &self,
        service: &str,
        timestamp: DateTime<Utc>,
        success: bool,
        latency_ms: Option<f64>,
    ) -> Result<(), StorageError> {
        Self::check(&self.fail_samples)?;
        self.inner.append_latency_sample(service, timestamp, success, latency_ms).await
    }

    async fn append_speedtest_sample(&self, sample: &SpeedtestSample) -> Result<(), StorageError> {
        Self::check(&self.fail_samples)?;
        self.inner.append_speedtest_sample(sample).await
    }

    async fn prune_latency_samples(&self, service: &str, keep_count: usize) -> Result<usize, StorageError> {
        Self::check(&self.fail_samples)?;
        self.inner.prune_latency_samples(service, keep_count).await
    }
}

/// Poll `cond` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
