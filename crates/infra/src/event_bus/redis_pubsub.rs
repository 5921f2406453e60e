//! Redis pub/sub bus for cache invalidation events (optional).
//!
//! Pub/sub is not durable: a process that is offline when an event is
//! published misses it. Caches are empty at process start, so a missed
//! invalidation only matters for processes already running.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::{debug, warn};

use policybatch_events::{CacheEvent, EventBus, Subscription};

/// Default channel of cache invalidations.
pub const DEFAULT_CHANNEL: &str = "policybatch:cache";

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for [`CacheEvent`]s.
#[derive(Debug, Clone)]
pub struct RedisCacheBus {
    client: redis::Client,
    channel: String,
}

impl RedisCacheBus {
    pub fn new(redis_url: impl AsRef<str>, channel: Option<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        })
    }
}

impl EventBus<CacheEvent> for RedisCacheBus {
    type Error = RedisBusError;

    fn publish(&self, message: CacheEvent) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<CacheEvent> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Forwards messages until the subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "cache bus subscription failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %e, "cache bus subscription failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: CacheEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(channel = %channel, error = %e, "ignoring malformed cache event");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
