#![allow(dead_code)]
//! Interval-locked streaming price client.
//!
//! Rather than holding a persistent socket (which trips upstream rate
//! limiting), the worker connects shortly after each 5-minute boundary,
//! subscribes, waits for one price update, and disconnects. The latest
//! snapshot is cached behind a mutex with a freshness bound; consumers
//! that need the live feed register a subscriber callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::TokenProvider;
use crate::clock;
use crate::domain::{PriceChannel, PriceKind, PricePoint, PriceSnapshot};

/// Default freshness bound for `latest`: just over one interval.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(360);

/// Callbacks must be cheap; schedule real work onto your own task.
pub type PriceSubscriber = Arc<dyn Fn(PriceSnapshot) + Send + Sync>;

pub struct StreamConfig {
    pub url: String,
    pub site_id: String,
    pub token: TokenProvider,
    /// How long to wait for the interval's price after connecting.
    pub message_timeout: Duration,
    /// Backoff after a failed fetch.
    pub retry_delay: Duration,
    /// Minimum spacing between subscriber notifications.
    pub notify_cooldown: Duration,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>, site_id: impl Into<String>, token: TokenProvider) -> Self {
        Self {
            url: url.into(),
            site_id: site_id.into(),
            token,
            message_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(30),
            notify_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamHealth {
    pub status: String,
    pub last_update: Option<DateTime<Utc>>,
    pub age_seconds: Option<f64>,
    pub fetch_count: u64,
    pub message_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub has_cached_data: bool,
}

#[derive(Default)]
struct Cache {
    snapshot: Option<PriceSnapshot>,
    last_update: Option<DateTime<Utc>>,
    /// Warn once about staleness until data is fresh again.
    stale_warned: bool,
}

struct Inner {
    config: StreamConfig,
    cache: Mutex<Cache>,
    status: Mutex<&'static str>,
    fetch_count: AtomicU64,
    message_count: AtomicU64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    subscribers: Mutex<Vec<PriceSubscriber>>,
    last_notify: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
}

pub struct PriceStreamClient {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PriceStreamClient {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache: Mutex::new(Cache::default()),
                status: Mutex::new("disconnected"),
                fetch_count: AtomicU64::new(0),
                message_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_error: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                last_notify: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the dedicated fetch worker. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("price stream worker already running");
            return;
        }
        let inner = self.inner.clone();
        *self.worker.lock() = Some(tokio::spawn(Inner::run_loop(inner)));
        info!("price stream worker started (interval-locked fetching)");
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Liveness probe: restart the worker if it has exited. Returns true
    /// when a restart happened.
    pub fn ensure_running(&self) -> bool {
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut worker = self.worker.lock();
        let dead = worker.as_ref().map(|h| h.is_finished()).unwrap_or(true);
        if dead {
            warn!("price stream worker died unexpectedly - restarting");
            let inner = self.inner.clone();
            *worker = Some(tokio::spawn(Inner::run_loop(inner)));
            return true;
        }
        false
    }

    /// The cached snapshot iff it is at most `max_age` old.
    pub fn latest(&self, max_age: Duration) -> Option<PriceSnapshot> {
        let mut cache = self.inner.cache.lock();
        let last_update = cache.last_update?;
        let age = (Utc::now() - last_update).num_seconds();
        if age > max_age.as_secs() as i64 {
            if !cache.stale_warned {
                info!(age_seconds = age, "stream cache stale - consumers fall back to REST");
                cache.stale_warned = true;
            }
            return None;
        }
        cache.snapshot.clone()
    }

    /// Register a callback fired once per successful price receipt.
    pub fn subscribe(&self, subscriber: PriceSubscriber) {
        self.inner.subscribers.lock().push(subscriber);
    }

    pub fn health(&self) -> StreamHealth {
        let (last_update, has_cached_data) = {
            let cache = self.inner.cache.lock();
            (cache.last_update, cache.snapshot.is_some())
        };
        StreamHealth {
            status: self.inner.status.lock().to_string(),
            last_update,
            age_seconds: last_update.map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0),
            fetch_count: self.inner.fetch_count.load(Ordering::Relaxed),
            message_count: self.inner.message_count.load(Ordering::Relaxed),
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            last_error: self.inner.last_error.lock().clone(),
            has_cached_data,
        }
    }

    #[cfg(test)]
    fn inject_snapshot(&self, snapshot: PriceSnapshot, at: DateTime<Utc>) {
        let mut cache = self.inner.cache.lock();
        cache.snapshot = Some(snapshot);
        cache.last_update = Some(at);
        cache.stale_warned = false;
    }

    #[cfg(test)]
    fn handle_raw_message(&self, text: &str) -> bool {
        self.inner.handle_message(text)
    }
}

impl Inner {
    async fn run_loop(inner: Arc<Inner>) {
        // Immediate fetch on startup, then lock onto interval boundaries.
        if let Err(e) = inner.fetch_once().await {
            inner.record_error(&e);
        }

        while inner.running.load(Ordering::SeqCst) {
            let wait = clock::seconds_until_next_fetch(Utc::now());
            debug!(wait_seconds = wait, "sleeping until next interval fetch");

            let mut slept = 0u64;
            while inner.running.load(Ordering::SeqCst) && slept < wait {
                let chunk = (wait - slept).min(5);
                tokio::time::sleep(Duration::from_secs(chunk)).await;
                slept += chunk;
            }
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = inner.fetch_once().await {
                inner.record_error(&e);
                tokio::time::sleep(inner.config.retry_delay).await;
            }
        }
        *inner.status.lock() = "disconnected";
        info!("price stream worker stopped");
    }

    /// One connect/subscribe/receive/disconnect cycle.
    async fn fetch_once(&self) -> anyhow::Result<bool> {
        let fetch_no = self.fetch_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self.status.lock() = "connecting";
        debug!(fetch_no, "connecting to price stream");

        let result = self.fetch_inner().await;
        *self.status.lock() = "disconnected";

        match result {
            Ok(true) => {
                info!(fetch_no, "price fetch successful");
                Ok(true)
            }
            Ok(false) => {
                warn!(fetch_no, "price fetch completed without a price update");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_inner(&self) -> anyhow::Result<bool> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let token = (self.config.token)();
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        *self.status.lock() = "connected";
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "service": "live-prices",
            "action": "subscribe",
            "data": { "siteId": self.config.site_id }
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        debug!(site_id = %self.config.site_id, "subscription sent");

        let deadline = tokio::time::Instant::now() + self.config.message_timeout;
        let mut price_received = false;
        while !price_received {
            let message = match tokio::time::timeout_at(deadline, read.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    warn!("stream closed before a price update arrived");
                    break;
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.config.message_timeout.as_secs(),
                        "timed out waiting for price update"
                    );
                    break;
                }
            };
            if let Message::Text(text) = message {
                price_received = self.handle_message(&text);
            }
        }

        if let Ok(mut ws) = write.reunite(read) {
            ws.close(None).await.ok();
        }
        Ok(price_received)
    }

    /// Returns true for a price-update message.
    fn handle_message(&self, text: &str) -> bool {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                self.record_error(&anyhow::anyhow!("message parse failed: {}", e));
                return false;
            }
        };
        self.message_count.fetch_add(1, Ordering::Relaxed);

        if (value["action"] == "subscribe" && value["status"] == 200)
            || value["type"] == "subscription-success"
        {
            debug!("subscription confirmed");
            return false;
        }
        if value["type"] == "error" {
            let message = value["message"].as_str().unwrap_or("unknown stream error");
            self.record_error(&anyhow::anyhow!("stream error: {}", message));
            return false;
        }

        let is_price_update =
            value["action"] == "price-update" || value["data"].get("prices").is_some();
        if !is_price_update {
            debug!(action = %value["action"], "unhandled stream message");
            return false;
        }

        let data = &value["data"];
        if let Some(site_id) = data["siteId"].as_str() {
            if site_id != self.config.site_id {
                warn!(site_id, "price update for a different site - ignoring");
                return false;
            }
        }

        let Some(prices) = data["prices"].as_array() else {
            return false;
        };
        let mut import = None;
        let mut export = None;
        for raw in prices {
            let Ok(record) = serde_json::from_value::<RawStreamPrice>(raw.clone()) else {
                continue;
            };
            match record.channel_type.parse::<PriceChannel>() {
                Ok(PriceChannel::Import) => import = Some(record.into_point(PriceChannel::Import)),
                Ok(PriceChannel::Export) => export = Some(record.into_point(PriceChannel::Export)),
                Err(_) => continue,
            }
        }
        let (Some(import), Some(export)) = (import, export) else {
            warn!("price update missing a channel - ignoring");
            return false;
        };

        let snapshot = PriceSnapshot { import, export };
        info!(
            buy_cents = snapshot.import.per_kwh_cents,
            sell_cents = snapshot.export.per_kwh_cents,
            "price update received"
        );
        {
            let mut cache = self.cache.lock();
            cache.snapshot = Some(snapshot.clone());
            cache.last_update = Some(Utc::now());
            cache.stale_warned = false;
        }
        self.notify_subscribers(snapshot);
        true
    }

    fn notify_subscribers(&self, snapshot: PriceSnapshot) {
        {
            let mut last = self.last_notify.lock();
            if let Some(at) = *last {
                let elapsed = (Utc::now() - at).num_seconds();
                if elapsed < self.config.notify_cooldown.as_secs() as i64 {
                    debug!(elapsed, "notification cooldown active");
                    return;
                }
            }
            *last = Some(Utc::now());
        }
        let subscribers: Vec<PriceSubscriber> = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(snapshot.clone());
        }
    }

    fn record_error(&self, error: &anyhow::Error) {
        error!(error = %error, "price stream error");
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStreamPrice {
    channel_type: String,
    per_kwh: f64,
    #[serde(default)]
    spot_per_kwh: Option<f64>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl RawStreamPrice {
    fn into_point(self, channel: PriceChannel) -> PricePoint {
        PricePoint {
            start: self.start_time,
            end: self.end_time,
            channel,
            per_kwh_cents: self.per_kwh,
            kind: PriceKind::Current,
            wholesale_cents: self.spot_per_kwh,
            region: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prices::static_token;
    use std::sync::atomic::AtomicUsize;

    fn client() -> PriceStreamClient {
        PriceStreamClient::new(StreamConfig::new(
            "wss://stream.invalid",
            "SITE1",
            static_token("psk_testtoken"),
        ))
    }

    fn price_update_json() -> String {
        serde_json::json!({
            "action": "price-update",
            "data": {
                "siteId": "SITE1",
                "prices": [
                    {
                        "channelType": "general",
                        "perKwh": 25.3,
                        "spotPerKwh": 9.1,
                        "startTime": "2025-06-01T10:00:00Z",
                        "endTime": "2025-06-01T10:05:00Z"
                    },
                    {
                        "channelType": "feedIn",
                        "perKwh": -8.2,
                        "startTime": "2025-06-01T10:00:00Z",
                        "endTime": "2025-06-01T10:05:00Z"
                    }
                ]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_price_update_populates_cache() {
        let client = client();
        assert!(client.handle_raw_message(&price_update_json()));

        let snap = client.latest(DEFAULT_MAX_AGE).expect("cache should be fresh");
        assert_eq!(snap.import.per_kwh_cents, 25.3);
        assert_eq!(snap.export.per_kwh_cents, -8.2);
        assert_eq!(snap.import.kind, PriceKind::Current);
    }

    #[tokio::test]
    async fn test_subscription_ack_is_silent() {
        let client = client();
        let ack = serde_json::json!({"action": "subscribe", "status": 200}).to_string();
        assert!(!client.handle_raw_message(&ack));
        assert!(client.latest(DEFAULT_MAX_AGE).is_none());
    }

    #[tokio::test]
    async fn test_wrong_site_ignored() {
        let client = client();
        let message = price_update_json().replace("SITE1", "OTHER");
        assert!(!client.handle_raw_message(&message));
    }

    #[tokio::test]
    async fn test_latest_respects_max_age() {
        let client = client();
        client.handle_raw_message(&price_update_json());
        let snap = client.latest(DEFAULT_MAX_AGE).unwrap();

        // Backdate the cache past the freshness bound
        client.inject_snapshot(snap, Utc::now() - chrono::Duration::seconds(400));
        assert!(client.latest(DEFAULT_MAX_AGE).is_none());
    }

    #[tokio::test]
    async fn test_subscriber_notification_cooldown() {
        let client = client();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        client.subscribe(Arc::new(move |_snap| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        client.handle_raw_message(&price_update_json());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Second receipt inside the cooldown window does not re-notify
        client.handle_raw_message(&price_update_json());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_message_recorded() {
        let client = client();
        let message =
            serde_json::json!({"type": "error", "message": "subscription limit"}).to_string();
        assert!(!client.handle_raw_message(&message));
        let health = client.health();
        assert_eq!(health.error_count, 1);
        assert!(health.last_error.unwrap().contains("subscription limit"));
    }
}
