//! Response-idempotency cache
//!
//! Replies are memoized under `(chargePointId, messageId)` so a charger
//! retransmitting a CALL gets the previously-emitted bytes back verbatim,
//! without re-running validation or state transitions.
//!
//! Two levels: a per-process map (always on) and the shared KV store
//! (optional, so a retransmit landing on another node after takeover
//! still hits). KV failures are logged and ignored; the cache is an
//! optimization, not a source of truth.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::infrastructure::KeyValueStore;

#[derive(Debug, Clone)]
struct CachedReply {
    json: String,
    stored_at: Instant,
}

/// Two-level reply cache keyed by `(chargePointId, messageId)`
pub struct ResponseCache {
    local: DashMap<(String, String), CachedReply>,
    shared: Option<Arc<dyn KeyValueStore>>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    /// `ttl_seconds <= 0` disables the cache entirely.
    pub fn new(ttl_seconds: i64, shared: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            local: DashMap::new(),
            shared,
            ttl: Duration::from_secs(ttl_seconds.max(0) as u64),
            enabled: ttl_seconds > 0,
        }
    }

    fn key(charge_point_id: &str, message_id: &str) -> String {
        format!("response-cache:{}:{}", charge_point_id, message_id)
    }

    /// Look up a previously-emitted reply.
    pub async fn get(&self, charge_point_id: &str, message_id: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let local_key = (charge_point_id.to_string(), message_id.to_string());
        let expired = match self.local.get(&local_key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return Some(entry.json.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.local.remove(&local_key);
        }

        if let Some(kv) = &self.shared {
            match kv.get(&Self::key(charge_point_id, message_id)).await {
                Ok(hit @ Some(_)) => return hit,
                Ok(None) => {}
                Err(e) => debug!(charge_point_id, message_id, error = %e, "Response cache read failed"),
            }
        }
        None
    }

    /// Store a reply in the JSON form it was sent.
    pub async fn store(&self, charge_point_id: &str, message_id: &str, reply_json: &str) {
        if !self.enabled {
            return;
        }
        self.local.insert(
            (charge_point_id.to_string(), message_id.to_string()),
            CachedReply {
                json: reply_json.to_string(),
                stored_at: Instant::now(),
            },
        );
        if let Some(kv) = &self.shared {
            if let Err(e) = kv
                .put(&Self::key(charge_point_id, message_id), reply_json, Some(self.ttl))
                .await
            {
                debug!(charge_point_id, message_id, error = %e, "Response cache write failed");
            }
        }
    }
}
