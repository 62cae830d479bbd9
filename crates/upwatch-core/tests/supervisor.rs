mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{wait_until, ScriptedProber};
use upwatch_core::{
    Health, MemoryStore, MonitorState, ProbeMethod, Prober, ProberFactory, ServiceConfig,
    SpeedTestCommand, SpeedTestConfig, SpeedTestFailure, Supervisor, SupervisorError,
};

fn fast(name: &str, target: &str) -> ServiceConfig {
    ServiceConfig::new(name, ProbeMethod::Ping, target)
        .with_interval(Duration::from_millis(10))
        .with_thresholds(1, 1)
}

/// Targets named "down" always fail; everything else succeeds.
fn scripted_factory() -> ProberFactory {
    Arc::new(|config: &ServiceConfig| -> Arc<dyn Prober> {
        ScriptedProber::always(config.target != "down")
    })
}

#[tokio::test]
async fn start_add_and_stop() {
    let store = Arc::new(MemoryStore::new());
    let supervisor = Supervisor::new(
        vec![fast("web", "up"), fast("lan", "down")],
        store.clone(),
    )
    .with_prober_factory(scripted_factory());

    supervisor.start();
    supervisor.start();
    assert_eq!(supervisor.service_names(), vec!["lan", "web"]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            supervisor.statuses().iter().all(|s| s.checks >= 2)
        })
        .await
    );
    let lan = supervisor.status("lan").unwrap();
    assert_eq!(lan.health, Health::Down);
    assert_eq!(lan.state, MonitorState::Active);
    assert_eq!(supervisor.status("web").unwrap().health, Health::Healthy);
    assert_eq!(store.outages_for("lan").len(), 1);
    assert!(store.outages_for("web").is_empty());

    // Adding a running name is a no-op; a new name starts without disturbing the rest.
    assert!(!supervisor.add_service(fast("web", "down")).unwrap());
    assert!(supervisor.add_service(fast("dns", "up")).unwrap());
    assert!(
        wait_until(Duration::from_secs(2), || {
            supervisor.status("dns").is_some_and(|s| s.checks >= 1)
        })
        .await
    );
    assert_eq!(supervisor.status("web").unwrap().health, Health::Healthy);

    tokio::time::timeout(Duration::from_secs(2), supervisor.stop())
        .await
        .expect("stop is bounded");
    assert!(supervisor
        .statuses()
        .iter()
        .all(|s| s.state == MonitorState::Stopped));
    assert!(!supervisor.is_running("web"));
    assert!(matches!(
        supervisor.add_service(fast("late", "up")),
        Err(SupervisorError::Stopped)
    ));
}

#[tokio::test]
async fn invalid_services_are_rejected_or_skipped() {
    let store = Arc::new(MemoryStore::new());
    let supervisor = Supervisor::new(
        vec![fast("ok", "up"), fast("bad", "up").with_thresholds(0, 1), fast("ok", "down")],
        store,
    )
    .with_prober_factory(scripted_factory());

    supervisor.start();
    assert_eq!(supervisor.service_names(), vec!["ok"]);
    assert!(matches!(
        supervisor.add_service(fast("", "up")),
        Err(SupervisorError::InvalidService(_))
    ));
    supervisor.stop().await;
}

#[tokio::test]
async fn stop_with_long_interval_returns_promptly() {
    let store = Arc::new(MemoryStore::new());
    let slow = ServiceConfig::new("slow", ProbeMethod::Ping, "up").with_interval(Duration::from_secs(3600));
    let supervisor = Supervisor::new(vec![slow], store).with_prober_factory(scripted_factory());

    supervisor.start();
    assert!(
        wait_until(Duration::from_secs(2), || {
            supervisor.status("slow").is_some_and(|s| s.checks == 1)
        })
        .await
    );
    tokio::time::timeout(Duration::from_secs(1), supervisor.stop())
        .await
        .expect("stop interrupts the idle wait");
}

struct FixedOutput;

#[async_trait]
impl SpeedTestCommand for FixedOutput {
    async fn execute(&self, _timeout: Duration) -> Result<String, SpeedTestFailure> {
        Ok(r#"{"download": 50000000, "upload": 10000000, "ping": 20.0}"#.to_string())
    }
}

#[tokio::test]
async fn speed_test_runs_for_each_monitored_service() {
    let store = Arc::new(MemoryStore::new());
    let supervisor = Supervisor::new(vec![fast("a", "up"), fast("b", "up")], store.clone())
        .with_prober_factory(scripted_factory())
        .with_speedtest(
            SpeedTestConfig::default()
                .with_enabled(true)
                .with_target_selector("does-not-exist"),
        )
        .with_speedtest_command(Arc::new(FixedOutput));

    supervisor.start();
    assert!(wait_until(Duration::from_secs(2), || store.speedtest_samples().len() >= 2).await);
    supervisor.stop().await;

    let samples = store.speedtest_samples();
    assert_eq!(samples[0].service, "a");
    assert_eq!(samples[1].service, "b");
    assert_eq!(samples[0].download_mbps, 50.0);
    assert_eq!(samples[0].server, "unknown");
}

#[tokio::test]
async fn speed_test_includes_services_added_after_start() {
    let store = Arc::new(MemoryStore::new());
    let supervisor = Supervisor::new(vec![fast("a", "up")], store.clone())
        .with_prober_factory(scripted_factory())
        .with_speedtest(
            SpeedTestConfig::default()
                .with_enabled(true)
                .with_interval(Duration::from_millis(20)),
        )
        .with_speedtest_command(Arc::new(FixedOutput));

    supervisor.start();
    assert!(wait_until(Duration::from_secs(2), || !store.speedtest_samples().is_empty()).await);
    assert!(supervisor.add_service(fast("late", "up")).unwrap());

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.speedtest_samples().iter().any(|s| s.service == "late")
        })
        .await
    );
    supervisor.stop().await;
}
