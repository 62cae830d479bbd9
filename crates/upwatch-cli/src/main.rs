mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use upwatch_core::{
    prober_for, MemoryStore, NotificationContext, Notifier, OutagePayload, ProbeMethod,
    ServiceConfig, SpeedTestRunner, SqliteStore, Storage, StorageError, Supervisor,
};

use crate::config::AppConfig;

/// Connectivity and uptime monitor with outage tracking and webhook alerts.
#[derive(Parser)]
#[command(name = "upwatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every configured service until Ctrl+C.
    Run {
        /// Path to TOML config file.
        #[arg(short, long, default_value = "upwatch.toml")]
        config: PathBuf,
    },
    /// Probe a single target once and print the result.
    Check {
        /// Host for ping, URL for http.
        target: String,

        /// Probe method: ping or http.
        #[arg(short, long, default_value = "ping")]
        method: ProbeMethod,

        /// Probe timeout in seconds.
        #[arg(short, long, default_value_t = 2.0)]
        timeout: f64,
    },
    /// Send a test notification to the configured webhook.
    NotifyTest {
        /// Path to TOML config file.
        #[arg(short, long, default_value = "upwatch.toml")]
        config: PathBuf,

        /// Which notification to send.
        #[arg(short, long, value_enum, default_value_t = TestEvent::End)]
        event: TestEvent,
    },
    /// Run one speed test cycle now and print the summaries.
    Speedtest {
        /// Path to TOML config file.
        #[arg(short, long, default_value = "upwatch.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TestEvent {
    /// An outage.start payload.
    Start,
    /// An outage.end payload for a 42s outage.
    End,
    /// A full simulated 37s outage, start and end as configured.
    Example,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run { config } => run_monitor(&config).await,
        Commands::Check {
            target,
            method,
            timeout,
        } => {
            init_tracing("pretty", "warn");
            run_check(target, method, timeout).await
        }
        Commands::NotifyTest { config, event } => run_notify_test(&config, event).await,
        Commands::Speedtest { config } => run_speedtest(&config).await,
    };

    std::process::exit(code);
}

fn init_tracing(log_format: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_format {
        "json" => {
            fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}

/// Load the config file and initialise logging from it.
///
/// A missing or broken file is logged and replaced by an empty config.
fn load_config(path: &Path) -> AppConfig {
    match AppConfig::load(path) {
        Ok(c) => {
            init_tracing(c.log_format(), "info");
            if !c.log_format_is_valid() {
                tracing::warn!(log_format = %c.general.log_format, "Unknown log_format, using pretty");
            }
            tracing::info!(path = %path.display(), "Loaded config file");
            c
        }
        Err(e) => {
            init_tracing("pretty", "info");
            tracing::error!(error = %e, "Continuing with empty configuration");
            AppConfig::default()
        }
    }
}

async fn open_storage(database: &str) -> Result<Arc<dyn Storage>, StorageError> {
    if database == ":memory:" {
        tracing::warn!("Using in-memory storage, nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::open(database).await?))
}

async fn run_monitor(config_path: &Path) -> i32 {
    let app_config = load_config(config_path);

    let storage = match open_storage(&app_config.general.database).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(database = %app_config.general.database, error = %e, "Failed to open storage");
            return 1;
        }
    };

    let services = app_config.service_configs();
    if services.is_empty() {
        tracing::warn!("No services configured, nothing to monitor");
    }

    let mut supervisor =
        Supervisor::new(services, storage).with_speedtest(app_config.speedtest_config());

    let notifier_config = app_config.notifier_config();
    let webhook_handle = if notifier_config.is_configured() {
        let client = Notifier::build_client(notifier_config.timeout);
        let (notifier, dispatcher) = Notifier::new(notifier_config, client);
        supervisor = supervisor.with_notifier(notifier);
        tracing::info!("Webhook dispatcher started");
        Some(tokio::spawn(dispatcher.run()))
    } else {
        tracing::info!("No webhook configured, notifications disabled");
        None
    };

    supervisor.start();

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping monitors...");

    supervisor.stop().await;
    drop(supervisor);

    if let Some(handle) = webhook_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(_) => tracing::info!("Webhook dispatcher shut down"),
            Err(_) => tracing::warn!("Webhook dispatcher did not shut down in time, aborting"),
        }
    }

    tracing::info!("Shutdown complete");
    0
}

async fn run_check(target: String, method: ProbeMethod, timeout: f64) -> i32 {
    let timeout = Duration::try_from_secs_f64(timeout).unwrap_or(Duration::from_secs(2));
    let config = ServiceConfig::new("check", method, &target).with_probe_timeout(timeout);
    if let Err(e) = config.validate() {
        eprintln!("{} {}", style("error:").red().bold(), e);
        return 2;
    }

    let shown = match method {
        ProbeMethod::Ping => config.target.clone(),
        ProbeMethod::Http => config.http_url(),
    };
    let outcome = prober_for(&config).probe().await;

    if outcome.success {
        let latency = outcome
            .latency_ms()
            .map(|ms| format!("{:.1} ms", ms))
            .unwrap_or_else(|| "latency unknown".into());
        println!(
            "{} {} {} {}",
            style("UP  ").green().bold(),
            style(&shown).bold(),
            style(format!("({})", method)).dim(),
            latency
        );
        0
    } else {
        println!(
            "{} {} {} {}",
            style("DOWN").red().bold(),
            style(&shown).bold(),
            style(format!("({})", method)).dim(),
            outcome.error.unwrap_or_default()
        );
        1
    }
}

async fn run_notify_test(config_path: &Path, event: TestEvent) -> i32 {
    let app_config = load_config(config_path);
    let notifier_config = app_config.notifier_config();
    if !notifier_config.is_configured() {
        eprintln!(
            "{} no webhook url configured in {}",
            style("error:").red().bold(),
            config_path.display()
        );
        return 1;
    }

    let send_start = notifier_config.send_start;
    let send_end = notifier_config.send_end;
    let client = Notifier::build_client(notifier_config.timeout);
    let (notifier, _dispatcher) = Notifier::new(notifier_config, client);
    let ctx = NotificationContext::example();
    let now = Utc::now();

    let mut results = Vec::new();
    let mut failed = false;

    match event {
        TestEvent::Start => {
            let payload = OutagePayload::start(&ctx, 0, now);
            if send_start {
                let (result, ok) = send(&notifier, &payload).await;
                failed |= !ok;
                results.push(result);
            } else {
                results.push(skipped(&payload, "start events are disabled (send_start = false)"));
            }
        }
        TestEvent::End => {
            let start = now - chrono::Duration::seconds(42);
            let payload = OutagePayload::end(&ctx, 0, start, now, 42.0);
            let (result, ok) = send(&notifier, &payload).await;
            failed |= !ok;
            results.push(result);
        }
        TestEvent::Example => {
            let start = now - chrono::Duration::seconds(37);
            let start_payload = OutagePayload::start(&ctx, 9999, start);
            let end_payload = OutagePayload::end(&ctx, 9999, start, now, 37.0);
            for (payload, enabled, reason) in [
                (&start_payload, send_start, "send_start = false"),
                (&end_payload, send_end, "send_end = false"),
            ] {
                if enabled {
                    let (result, ok) = send(&notifier, payload).await;
                    failed |= !ok;
                    results.push(result);
                } else {
                    results.push(skipped(payload, reason));
                }
            }
        }
    }

    let report = json!({
        "results": results,
        "status": notifier.status(),
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());

    if failed {
        1
    } else {
        0
    }
}

async fn send(notifier: &Notifier, payload: &OutagePayload) -> (serde_json::Value, bool) {
    match notifier.send_now(payload).await {
        Ok(code) => (
            json!({ "event": payload.event, "sent": true, "status_code": code, "payload": payload }),
            true,
        ),
        Err(e) => (
            json!({ "event": payload.event, "sent": false, "error": e, "payload": payload }),
            false,
        ),
    }
}

fn skipped(payload: &OutagePayload, reason: &str) -> serde_json::Value {
    json!({ "event": payload.event, "sent": false, "skipped": true, "reason": reason, "payload": payload })
}

async fn run_speedtest(config_path: &Path) -> i32 {
    let app_config = load_config(config_path);

    let storage = match open_storage(&app_config.general.database).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(database = %app_config.general.database, error = %e, "Failed to open storage");
            return 1;
        }
    };

    let services: Vec<String> = app_config
        .service_configs()
        .into_iter()
        .map(|s| s.name)
        .collect();
    if services.is_empty() {
        tracing::warn!("No services configured, nothing to measure");
    }

    let runner = SpeedTestRunner::new(app_config.speedtest_config(), services, storage);
    let summaries = runner.run_cycle().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&summaries).unwrap_or_default()
    );

    if summaries.iter().all(|s| s.is_success()) {
        0
    } else {
        1
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
