mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{wait_until, FlakyStore, ScriptedProber};
use upwatch_core::storage::duration_seconds;
use upwatch_core::{
    Health, MemoryStore, MonitorError, MonitorState, NotifierConfig, Notifier, ProbeMethod,
    ProbeOutcome, Prober, RetentionConfig, ServiceConfig, ServiceMonitor, Storage,
};
use tokio::sync::Notify;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(fail: u32, recover: u32) -> ServiceConfig {
    ServiceConfig::new("default", ProbeMethod::Ping, "8.8.8.8").with_thresholds(fail, recover)
}

async fn run_checks(monitor: &mut ServiceMonitor, n: usize) {
    for _ in 0..n {
        monitor.check_once().await.expect("check succeeds");
    }
}

#[tokio::test]
async fn outage_start_is_back_dated_to_first_failure() {
    let store = Arc::new(MemoryStore::new());
    let prober = ScriptedProber::new(&[false, false, false, true, true, true], true);
    let mut monitor = ServiceMonitor::new(service(2, 2), prober, store.clone());

    run_checks(&mut monitor, 2).await;
    let samples = store.latency_samples("default");
    let outages = store.outages_for("default");
    assert_eq!(outages.len(), 1);
    assert!(outages[0].is_open());
    // Stored start is the first failure, not the check that crossed the threshold.
    assert_eq!(outages[0].start_time, samples[0].timestamp);
    assert_ne!(outages[0].start_time, samples[1].timestamp);
    assert_eq!(monitor.state().tracker.health(), Health::Down);

    run_checks(&mut monitor, 2).await;
    assert!(store.outages_for("default")[0].is_open(), "one success must not close");

    run_checks(&mut monitor, 1).await;
    let samples = store.latency_samples("default");
    let outage = &store.outages_for("default")[0];
    assert_eq!(outage.end_time, Some(samples[4].timestamp));
    assert_eq!(
        outage.duration_seconds,
        Some(duration_seconds(samples[0].timestamp, samples[4].timestamp))
    );

    run_checks(&mut monitor, 1).await;
    assert_eq!(store.outages().len(), 1);
    assert_eq!(monitor.state().tracker.health(), Health::Healthy);
}

#[tokio::test]
async fn failure_run_shorter_than_threshold_is_absorbed() {
    let store = Arc::new(MemoryStore::new());
    let prober = ScriptedProber::new(&[false, false, true, false, false, true, false], true);
    let mut monitor = ServiceMonitor::new(service(3, 1), prober, store.clone());

    run_checks(&mut monitor, 7).await;
    assert!(store.outages().is_empty());
    assert_eq!(store.latency_samples("default").len(), 7);
    assert_eq!(monitor.status().consecutive_failures, 1);
}

#[tokio::test]
async fn failed_probe_sample_has_no_latency() {
    let store = Arc::new(MemoryStore::new());
    let prober = ScriptedProber::new(&[true, false], true);
    let mut monitor = ServiceMonitor::new(service(2, 2), prober, store.clone());

    run_checks(&mut monitor, 2).await;
    let samples = store.latency_samples("default");
    assert!(samples[0].success);
    assert_eq!(samples[0].latency_ms, Some(5.0));
    assert!(!samples[1].success);
    assert_eq!(samples[1].latency_ms, None);
}

#[tokio::test]
async fn restart_adopts_open_outage_instead_of_creating_another() {
    let store = Arc::new(MemoryStore::new());
    let original_start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let id = store.create_outage("default", original_start).await.unwrap();

    let prober = ScriptedProber::new(&[false, false, false, true, true], true);
    let mut monitor = ServiceMonitor::new(service(2, 2), prober, store.clone());
    let adopted = monitor.resume().await.expect("open outage adopted");
    assert_eq!(adopted.id, id);
    assert_eq!(monitor.status().open_outage_id, Some(id));

    run_checks(&mut monitor, 3).await;
    assert_eq!(store.outages().len(), 1, "no second open row");

    run_checks(&mut monitor, 2).await;
    let outages = store.outages();
    assert_eq!(outages.len(), 1);
    let outage = &outages[0];
    assert_eq!(outage.id, id);
    assert_eq!(outage.start_time, original_start);
    let end = outage.end_time.expect("closed");
    assert_eq!(outage.duration_seconds, Some(duration_seconds(original_start, end)));
}

#[tokio::test]
async fn resume_ignores_other_services_and_closed_rows() {
    let store = Arc::new(MemoryStore::new());
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    store.create_outage("other", start).await.unwrap();
    let closed = store.create_outage("default", start).await.unwrap();
    store.end_outage(closed, start, 0.0).await.unwrap();

    let mut monitor = ServiceMonitor::new(service(2, 2), ScriptedProber::always(true), store);
    assert!(monitor.resume().await.is_none());
    assert_eq!(monitor.state().tracker.health(), Health::Healthy);
}

#[tokio::test]
async fn failed_outage_write_is_retried_on_next_failure() {
    let store = FlakyStore::new();
    store.fail_create.store(true, Ordering::SeqCst);
    let prober = ScriptedProber::always(false);
    let mut monitor = ServiceMonitor::new(service(2, 2), prober, store.clone());

    monitor.check_once().await.unwrap();
    let err = monitor.check_once().await.unwrap_err();
    assert!(matches!(err, MonitorError::OpenOutage { .. }));
    assert_eq!(monitor.state().tracker.health(), Health::Healthy);

    store.fail_create.store(false, Ordering::SeqCst);
    monitor.check_once().await.unwrap();
    let samples = store.inner.latency_samples("default");
    let outages = store.inner.outages();
    assert_eq!(outages.len(), 1);
    assert_eq!(outages[0].start_time, samples[0].timestamp);
}

#[tokio::test]
async fn failed_close_write_keeps_outage_open_until_retry() {
    let store = FlakyStore::new();
    let prober = ScriptedProber::new(&[false], true);
    let mut monitor = ServiceMonitor::new(service(1, 1), prober, store.clone());

    monitor.check_once().await.unwrap();
    store.fail_end.store(true, Ordering::SeqCst);
    assert!(matches!(
        monitor.check_once().await,
        Err(MonitorError::CloseOutage { .. })
    ));
    assert_eq!(monitor.state().tracker.health(), Health::Down);

    store.fail_end.store(false, Ordering::SeqCst);
    monitor.check_once().await.unwrap();
    assert!(!store.inner.outages()[0].is_open());
    assert_eq!(monitor.state().tracker.health(), Health::Healthy);
}

#[tokio::test]
async fn sample_write_failure_still_runs_transitions() {
    let store = FlakyStore::new();
    store.fail_samples.store(true, Ordering::SeqCst);
    let mut monitor = ServiceMonitor::new(service(1, 1), ScriptedProber::always(false), store.clone());

    monitor.check_once().await.unwrap();
    assert!(store.inner.latency_samples("default").is_empty());
    assert_eq!(store.inner.outages().len(), 1);
}

#[tokio::test]
async fn loop_survives_storage_outage_and_stops_on_signal() {
    let store = FlakyStore::failing_everything();
    let prober = ScriptedProber::always(false);
    let config = service(1, 1).with_interval(Duration::from_millis(10));
    let monitor = ServiceMonitor::new(config, prober.clone(), store);
    let mut status = monitor.subscribe();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(monitor.run(rx));

    assert!(wait_until(Duration::from_secs(2), || prober.calls() >= 5).await);
    assert_eq!(status.borrow_and_update().state, MonitorState::Active);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop exits promptly")
        .unwrap();
    assert_eq!(status.borrow().state, MonitorState::Stopped);
}

#[tokio::test]
async fn stop_interrupts_the_wait_between_checks() {
    let store = Arc::new(MemoryStore::new());
    let prober = ScriptedProber::always(true);
    let config = service(2, 2).with_interval(Duration::from_secs(3600));
    let monitor = ServiceMonitor::new(config, prober.clone(), store);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(monitor.run(rx));
    assert!(wait_until(Duration::from_secs(2), || prober.calls() == 1).await);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("stop does not wait out the interval")
        .unwrap();
    assert_eq!(prober.calls(), 1);
}

/// Blocks inside `probe` until released.
struct GatedProber {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Prober for GatedProber {
    async fn probe(&self) -> ProbeOutcome {
        self.entered.notify_one();
        self.release.notified().await;
        ProbeOutcome::ok(None)
    }
}

#[tokio::test]
async fn status_reads_stopping_while_the_last_check_finishes() {
    let store = Arc::new(MemoryStore::new());
    let prober = Arc::new(GatedProber {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let monitor = ServiceMonitor::new(service(2, 2), prober.clone(), store.clone());
    let mut status = monitor.subscribe();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(monitor.run(rx));
    prober.entered.notified().await;

    tx.send(true).unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == MonitorState::Stopping),
    )
    .await
    .expect("stopping is published")
    .unwrap();
    assert!(store.latency_samples("default").is_empty());

    prober.release.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop exits after the check")
        .unwrap();
    assert_eq!(status.borrow().state, MonitorState::Stopped);
    assert_eq!(store.latency_samples("default").len(), 1);
}

#[tokio::test]
async fn samples_are_pruned_on_schedule() {
    let store = Arc::new(MemoryStore::new());
    let retention = RetentionConfig {
        prune_every: 5,
        keep_samples: 3,
        stats_every: 2,
    };
    let mut monitor = ServiceMonitor::new(service(2, 2), ScriptedProber::always(true), store.clone())
        .with_retention(retention);

    run_checks(&mut monitor, 4).await;
    assert_eq!(store.latency_samples("default").len(), 4);
    run_checks(&mut monitor, 1).await;
    let kept = store.latency_samples("default");
    assert_eq!(kept.len(), 3);
    assert!(kept.iter().all(|s| s.id >= 3));
}

#[tokio::test]
async fn transitions_reach_the_webhook_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let config = NotifierConfig::default()
        .with_url(server.uri())
        .with_events(true, true);
    let (notifier, dispatcher) = Notifier::new(config, reqwest::Client::new());
    let dispatch = tokio::spawn(dispatcher.run());

    let store = Arc::new(MemoryStore::new());
    let prober = ScriptedProber::new(&[false, false, true, true], true);
    let mut monitor =
        ServiceMonitor::new(service(2, 2), prober, store.clone()).with_notifier(notifier);
    run_checks(&mut monitor, 4).await;
    drop(monitor);
    dispatch.await.unwrap();

    let outage = &store.outages()[0];
    let bodies: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(bodies[0]["event"], "outage.start");
    assert_eq!(bodies[0]["outage_id"], outage.id);
    assert_eq!(bodies[0]["start_time"], outage.start_time.to_rfc3339());
    assert_eq!(bodies[1]["event"], "outage.end");
    assert_eq!(bodies[1]["duration_seconds"], outage.duration_seconds.unwrap());
    assert_eq!(bodies[1]["fail_threshold"], 2);
}
