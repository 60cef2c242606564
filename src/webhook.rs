// =============================================================================
// Webhook Emitter — bounded per-session event queue with signed delivery
// =============================================================================
//
// The engine never blocks on the upstream platform: events are pushed into a
// bounded queue with a short enqueue timeout and a single consumer task per
// session posts them in FIFO order. The queue overflowing drops the *newest*
// event (the one that failed to enqueue) and keeps trading — losing a status
// update is acceptable, stalling the tick loop is not.
//
// Every request body is signed with HMAC-SHA256 over the exact bytes sent:
//
//   X-Webhook-Signature: hex(HMAC-SHA256(secret, body))
//
// Delivery is at-least-once within the retry budget; the upstream must
// tolerate duplicates.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exchange::retry::backoff_delay;

type HmacSha256 = Hmac<Sha256>;

/// Queue capacity per session.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// How long `emit` will wait for queue space before dropping the event.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-request deadline for the outbound POST.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery retries after the initial attempt.
const MAX_RETRIES: u32 = 3;

const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 5_000;
const RETRY_JITTER: f64 = 0.3;

// =============================================================================
// Events
// =============================================================================

/// Lifecycle event kinds reported to the upstream platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TradeOpened,
    TradeClosed,
    StatusUpdate,
    StatusChanged,
    ErrorOccurred,
    BalanceWarning,
    GlobalLimitHit,
}

/// One outbound webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// ISO-8601 UTC timestamp taken at emission time.
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl TradeEvent {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now().to_rfc3339(),
            data,
        }
    }
}

// =============================================================================
// Sink seam
// =============================================================================

/// Anything that can receive engine events. The engine composes with a sink
/// instead of knowing about webhooks, so tests swap in a collector and the
/// production wiring plugs in a [`WebhookEmitter`].
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TradeEvent);
}

/// Sink that discards everything. Used when a session has no webhook.
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn emit(&self, _event: TradeEvent) {}
}

/// Test sink that records every event in order.
#[cfg(test)]
pub struct CollectingSink {
    pub events: Mutex<Vec<TradeEvent>>,
}

#[cfg(test)]
impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: TradeEvent) {
        self.events.lock().push(event);
    }
}

// =============================================================================
// Emitter
// =============================================================================

/// Bounded-queue webhook emitter for one session.
pub struct WebhookEmitter {
    user_id: String,
    tx: Mutex<Option<mpsc::Sender<TradeEvent>>>,
    dropped: Arc<AtomicU64>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookEmitter {
    /// Create the emitter and spawn its consumer task.
    pub fn spawn(user_id: impl Into<String>, url: String, secret: String) -> Self {
        let user_id = user_id.into();
        let (tx, rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let dropped = Arc::new(AtomicU64::new(0));

        let consumer_user = user_id.clone();
        let consumer_dropped = dropped.clone();
        let handle = tokio::spawn(async move {
            consumer_loop(consumer_user, url, secret, rx, consumer_dropped).await;
        });

        Self {
            user_id,
            tx: Mutex::new(Some(tx)),
            dropped,
            consumer: Mutex::new(Some(handle)),
        }
    }

    /// Build an emitter whose queue is drained by the returned receiver
    /// instead of a consumer task. Lets tests observe the queue directly.
    #[cfg(test)]
    pub fn without_consumer(user_id: impl Into<String>) -> (Self, mpsc::Receiver<TradeEvent>) {
        let (tx, rx) = mpsc::channel(MAX_QUEUE_SIZE);
        (
            Self {
                user_id: user_id.into(),
                tx: Mutex::new(Some(tx)),
                dropped: Arc::new(AtomicU64::new(0)),
                consumer: Mutex::new(None),
            },
            rx,
        )
    }

    /// Events dropped due to backpressure or exhausted retries.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the consumer to drain what was accepted.
    pub async fn shutdown(&self) {
        // Dropping the sender closes the channel; recv() then returns None
        // once the backlog is drained.
        self.tx.lock().take();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(user_id = %self.user_id, error = %e, "webhook consumer ended abnormally");
            }
        }
        debug!(user_id = %self.user_id, dropped = self.dropped_count(), "webhook emitter shut down");
    }
}

#[async_trait]
impl EventSink for WebhookEmitter {
    async fn emit(&self, event: TradeEvent) {
        let sender = self.tx.lock().clone();
        let Some(sender) = sender else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(user_id = %self.user_id, kind = ?event.kind, "webhook queue closed — event dropped");
            return;
        };

        match sender.send_timeout(event, ENQUEUE_TIMEOUT).await {
            Ok(()) => {}
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    user_id = %self.user_id,
                    error = %e,
                    total_dropped = dropped,
                    "webhook queue full — event dropped"
                );
            }
        }
    }
}

// =============================================================================
// Consumer & delivery
// =============================================================================

async fn consumer_loop(
    user_id: String,
    url: String,
    secret: String,
    mut rx: mpsc::Receiver<TradeEvent>,
    dropped: Arc<AtomicU64>,
) {
    let client = reqwest::Client::builder()
        .timeout(SEND_TIMEOUT)
        .build()
        .expect("failed to build webhook client");

    info!(user_id = %user_id, "webhook consumer started");

    while let Some(event) = rx.recv().await {
        if !deliver(&client, &url, &secret, &event).await {
            dropped.fetch_add(1, Ordering::Relaxed);
            warn!(user_id = %user_id, kind = ?event.kind, "webhook delivery abandoned after retries");
        }
    }

    info!(user_id = %user_id, "webhook consumer stopped");
}

/// POST one event, retrying with exponential backoff and jitter. Returns
/// `false` once the retry budget is exhausted.
async fn deliver(client: &reqwest::Client, url: &str, secret: &str, event: &TradeEvent) -> bool {
    let body = match serde_json::to_string(event) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to serialise webhook event");
            return false;
        }
    };
    let signature = sign_body(secret, &body);

    for attempt in 0..=MAX_RETRIES {
        let result = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", &signature)
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(kind = ?event.kind, attempt, "webhook delivered");
                return true;
            }
            Ok(resp) => {
                warn!(kind = ?event.kind, attempt, status = %resp.status(), "webhook rejected");
            }
            Err(e) => {
                warn!(kind = ?event.kind, attempt, error = %e, "webhook send failed");
            }
        }

        if attempt < MAX_RETRIES {
            let delay =
                backoff_delay(attempt, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, RETRY_JITTER);
            tokio::time::sleep(delay).await;
        }
    }

    false
}

/// hex(HMAC-SHA256(secret, body))
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
