//! Outage notifications.
//!
//! Monitors hand transition payloads to a [`Notifier`], which filters and
//! deduplicates them and pushes the survivors onto an mpsc channel. The
//! [`WebhookDispatcher`] is the only consumer of that channel and POSTs one
//! payload at a time, so deliveries leave in the order transitions happened
//! and a slow endpoint never blocks a check loop.
//!
//! Delivery is best-effort: a failure is recorded in [`DeliveryStatus`] and
//! logged, never retried and never returned to the monitor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{NotifierConfig, ProbeMethod, ServiceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutageEvent {
    #[serde(rename = "outage.start")]
    Start,
    #[serde(rename = "outage.end")]
    End,
}

impl fmt::Display for OutageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "outage.start"),
            Self::End => write!(f, "outage.end"),
        }
    }
}

/// The service fields a notification carries.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationContext {
    pub name: String,
    pub target: String,
    pub method: ProbeMethod,
    pub interval: Duration,
    pub fail_threshold: u32,
    pub recover_threshold: u32,
}

impl NotificationContext {
    /// Stand-in service used by test deliveries.
    pub fn example() -> Self {
        Self {
            name: "example".into(),
            target: "example".into(),
            method: ProbeMethod::Ping,
            interval: Duration::from_secs(1),
            fail_threshold: 2,
            recover_threshold: 2,
        }
    }
}

impl From<&ServiceConfig> for NotificationContext {
    fn from(c: &ServiceConfig) -> Self {
        Self {
            name: c.name.clone(),
            target: c.target.clone(),
            method: c.method,
            interval: c.interval,
            fail_threshold: c.fail_threshold,
            recover_threshold: c.recover_threshold,
        }
    }
}

/// The JSON body POSTed to the webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutagePayload {
    pub event: OutageEvent,
    pub service: String,
    pub outage_id: i64,
    pub start_time: String,
    pub start_time_local: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub target: String,
    pub method: ProbeMethod,
    pub interval: f64,
    pub fail_threshold: u32,
    pub recover_threshold: u32,
}

fn utc_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn local_iso(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).to_rfc3339()
}

impl OutagePayload {
    pub fn start(ctx: &NotificationContext, outage_id: i64, start_time: DateTime<Utc>) -> Self {
        Self {
            event: OutageEvent::Start,
            service: ctx.name.clone(),
            outage_id,
            start_time: utc_iso(start_time),
            start_time_local: local_iso(start_time),
            end_time: None,
            end_time_local: None,
            duration_seconds: None,
            target: ctx.target.clone(),
            method: ctx.method,
            interval: ctx.interval.as_secs_f64(),
            fail_threshold: ctx.fail_threshold,
            recover_threshold: ctx.recover_threshold,
        }
    }

    pub fn end(
        ctx: &NotificationContext,
        outage_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            event: OutageEvent::End,
            end_time: Some(utc_iso(end_time)),
            end_time_local: Some(local_iso(end_time)),
            duration_seconds: Some(duration_seconds),
            ..Self::start(ctx, outage_id, start_time)
        }
    }

    fn dedup_key(&self) -> DedupKey {
        (self.event, self.service.clone(), self.outage_id)
    }
}

type DedupKey = (OutageEvent, String, i64);

/// Suppresses repeats of the same (event, service, outage) inside a window.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    seen: HashMap<DedupKey, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Records the key and returns `true` unless it was already sent inside
    /// the window. Expired keys are dropped on every call.
    pub fn should_send(&mut self, event: OutageEvent, service: &str, outage_id: i64, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < window);

        let key = (event, service.to_string(), outage_id);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Diagnostics about the most recent delivery attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryStatus {
    pub configured: bool,
    pub url: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_status_code: Option<u16>,
    pub last_event: Option<OutageEvent>,
    pub send_start_event: bool,
    pub send_end_event: bool,
    pub timeout_seconds: f64,
}

/// Owns the HTTP client and the send lock; every POST goes through here.
pub struct WebhookDelivery {
    client: Client,
    url: Option<String>,
    secret: Option<String>,
    timeout: Duration,
    send_lock: tokio::sync::Mutex<()>,
    status: Mutex<DeliveryStatus>,
}

impl WebhookDelivery {
    fn new(config: &NotifierConfig, client: Client) -> Self {
        let url = config.url.clone().filter(|_| config.is_configured());
        Self {
            client,
            status: Mutex::new(DeliveryStatus {
                configured: url.is_some(),
                url: url.clone(),
                send_start_event: config.send_start,
                send_end_event: config.send_end,
                timeout_seconds: config.timeout.as_secs_f64(),
                ..DeliveryStatus::default()
            }),
            url,
            secret: config.secret.clone(),
            timeout: config.timeout,
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn update_status(&self, f: impl FnOnce(&mut DeliveryStatus)) {
        let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// POST one payload. Returns the status code of a 2xx response.
    pub async fn post(&self, payload: &OutagePayload) -> Result<u16, String> {
        let Some(url) = self.url.as_deref() else {
            return Err("webhook not configured".into());
        };
        let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;

        let _guard = self.send_lock.lock().await;

        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("upwatch/", env!("CARGO_PKG_VERSION")))
            .header("X-Upwatch-Delivery", Uuid::new_v4().to_string())
            .timeout(self.timeout)
            .body(body.clone());

        if let Some(secret) = self.secret.as_deref() {
            req = req.header(
                "X-Upwatch-Signature-256",
                format!("sha256={}", sign_payload(&body, secret)),
            );
        }

        let event = payload.event;
        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let code = status.as_u16();
                if status.is_success() {
                    self.update_status(|s| {
                        s.last_status_code = Some(code);
                        s.last_success = Some(Utc::now());
                        s.last_error = None;
                        s.last_event = Some(event);
                    });
                    info!(event = %event, service = %payload.service, status = code, "Webhook sent");
                    Ok(code)
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    let excerpt: String = text.chars().take(200).collect();
                    let message = format!("HTTP {} body={}", code, excerpt);
                    self.update_status(|s| {
                        s.last_status_code = Some(code);
                        s.last_error = Some(message.clone());
                        s.last_event = Some(event);
                    });
                    warn!(event = %event, service = %payload.service, status = code, "Webhook rejected");
                    Err(message)
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.update_status(|s| {
                    s.last_status_code = None;
                    s.last_error = Some(message.clone());
                    s.last_event = Some(event);
                });
                warn!(event = %event, service = %payload.service, error = %message, "Webhook send failed");
                Err(message)
            }
        }
    }
}

/// Handle used by monitors to report transitions. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    config: Arc<NotifierConfig>,
    tx: mpsc::UnboundedSender<OutagePayload>,
    dedup: Arc<Mutex<DedupCache>>,
    delivery: Arc<WebhookDelivery>,
}

impl Notifier {
    /// Build a notifier and the dispatcher that must be spawned to drain it.
    pub fn new(config: NotifierConfig, client: Client) -> (Self, WebhookDispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = Arc::new(WebhookDelivery::new(&config, client));
        let notifier = Self {
            dedup: Arc::new(Mutex::new(DedupCache::new(config.dedup_window))),
            config: Arc::new(config),
            tx,
            delivery: Arc::clone(&delivery),
        };
        (notifier, WebhookDispatcher { rx, delivery })
    }

    pub fn build_client(timeout: Duration) -> Client {
        Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default webhook client");
                Client::new()
            })
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn status(&self) -> DeliveryStatus {
        self.delivery.status()
    }

    /// Shared delivery path. Holding it does not keep the dispatcher alive.
    pub fn delivery(&self) -> Arc<WebhookDelivery> {
        Arc::clone(&self.delivery)
    }

    /// Queue an outage-start notification. Returns whether it was queued.
    pub fn notify_outage_start(
        &self,
        ctx: &NotificationContext,
        outage_id: i64,
        start_time: DateTime<Utc>,
    ) -> bool {
        if !self.config.send_start {
            return false;
        }
        self.enqueue(OutagePayload::start(ctx, outage_id, start_time))
    }

    /// Queue an outage-end notification. Returns whether it was queued.
    pub fn notify_outage_end(
        &self,
        ctx: &NotificationContext,
        outage_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        duration_seconds: f64,
    ) -> bool {
        if !self.config.send_end {
            return false;
        }
        self.enqueue(OutagePayload::end(
            ctx,
            outage_id,
            start_time,
            end_time,
            duration_seconds,
        ))
    }

    fn enqueue(&self, payload: OutagePayload) -> bool {
        if !self.config.is_configured() {
            return false;
        }

        let (event, service, outage_id) = payload.dedup_key();
        let fresh = self
            .dedup
            .lock()
            .map(|mut d| d.should_send(event, &service, outage_id, Instant::now()))
            .unwrap_or(true);
        if !fresh {
            debug!(event = %event, service = %service, outage_id, "Suppressed duplicate notification");
            return false;
        }

        if self.tx.send(payload).is_err() {
            warn!(event = %event, service = %service, "Webhook dispatcher is gone, dropping notification");
            return false;
        }
        true
    }

    /// Deliver immediately, bypassing filters and dedup. Used by test fires.
    pub async fn send_now(&self, payload: &OutagePayload) -> Result<u16, String> {
        self.delivery.post(payload).await
    }
}

/// Single consumer of the notification channel.
pub struct WebhookDispatcher {
    rx: mpsc::UnboundedReceiver<OutagePayload>,
    delivery: Arc<WebhookDelivery>,
}

impl WebhookDispatcher {
    /// Run until every [`Notifier`] handle is dropped and the queue is drained.
    pub async fn run(mut self) {
        debug!("Webhook dispatcher started");
        while let Some(payload) = self.rx.recv().await {
            // Outcome is recorded in DeliveryStatus by post().
            let _ = self.delivery.post(&payload).await;
        }
        debug!("Webhook dispatcher shutting down");
    }
}

fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
