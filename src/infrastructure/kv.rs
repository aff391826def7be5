//! Key/value store port
//!
//! The gateway keeps identity records, session ownership, revocations,
//! idempotency claims, audit records and rate counters in a shared KV
//! store. The concrete backend lives outside this crate; [`KeyValueStore`]
//! is the contract it implements.
//!
//! [`claim_session`](KeyValueStore::claim_session) is the one compound
//! operation: backends must run it atomically per key (a server-side
//! script on a networked store). All session-takeover arbitration lives
//! in that operation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::domain::session::{
    ClaimStatus, SessionClaimReply, SessionClaimRequest, SessionEntry,
};

/// KV operation failure
#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("kv operation timed out")]
    Timeout,
    #[error("kv circuit open")]
    CircuitOpen,
    #[error("stored value malformed: {0}")]
    Corrupt(String),
}

/// Port to the shared key/value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set a value, with an optional TTL.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set a value only if the key is absent. Returns `true` when the
    /// claim succeeded.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Delete a key. Returns `true` when it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Increment a counter, setting `ttl_on_create` as expiry when the
    /// counter is created by this call. Returns the new count.
    async fn increment(&self, key: &str, ttl_on_create: Duration) -> Result<i64, KvError>;

    /// Reset a key's TTL. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Atomic session-ownership claim (see module docs).
    async fn claim_session(
        &self,
        key: &str,
        request: SessionClaimRequest,
    ) -> Result<SessionClaimReply, KvError>;
}

// ── In-memory implementation ───────────────────────────────────

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory [`KeyValueStore`] used by tests and single-node runs.
///
/// Entries expire lazily on access. Per-key atomicity comes from the
/// map's entry locks, which is all `claim_session` needs.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_live(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.live() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.read_live(key))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        use dashmap::mapref::entry::Entry;

        let stored = StoredValue {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occ) if occ.get().live() => Ok(false),
            Entry::Occupied(mut occ) => {
                occ.insert(stored);
                Ok(true)
            }
            Entry::Vacant(vac) => {
                vac.insert(stored);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> Result<i64, KvError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| StoredValue {
            value: "0".to_string(),
            expires_at: Some(Instant::now() + ttl_on_create),
        });
        if !entry.live() {
            *entry = StoredValue {
                value: "0".to_string(),
                expires_at: Some(Instant::now() + ttl_on_create),
            };
        }
        let count = entry
            .value
            .parse::<i64>()
            .map_err(|e| KvError::Corrupt(format!("counter {}: {}", key, e)))?
            + 1;
        entry.value = count.to_string();
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.live() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_session(
        &self,
        key: &str,
        request: SessionClaimRequest,
    ) -> Result<SessionClaimReply, KvError> {
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| StoredValue {
            value: String::new(),
            expires_at: Some(Instant::now()),
        });

        let now_ms = request.entry.last_seen_at_ms;
        let current: Option<SessionEntry> = if slot.live() && !slot.value.is_empty() {
            // An unreadable entry is treated as absent and overwritten.
            serde_json::from_str(&slot.value).ok()
        } else {
            None
        };

        let mut entry = request.entry;
        let reply = match current {
            None => {
                entry.epoch = 1;
                SessionClaimReply {
                    status: ClaimStatus::Fresh,
                    previous_owner_node_id: None,
                    epoch: 1,
                }
            }
            Some(current) if current.node_id == entry.node_id => {
                entry.epoch = current.epoch;
                SessionClaimReply {
                    status: ClaimStatus::Refreshed,
                    previous_owner_node_id: Some(current.node_id),
                    epoch: current.epoch,
                }
            }
            Some(current)
                if request.stale_ms > 0
                    && now_ms - current.last_seen_at_ms > request.stale_ms =>
            {
                entry.epoch = current.epoch + 1;
                SessionClaimReply {
                    status: ClaimStatus::Takeover,
                    previous_owner_node_id: Some(current.node_id),
                    epoch: entry.epoch,
                }
            }
            Some(current) => {
                return Ok(SessionClaimReply {
                    status: ClaimStatus::Denied,
                    previous_owner_node_id: Some(current.node_id.clone()),
                    epoch: current.epoch,
                });
            }
        };

        let json = serde_json::to_string(&entry)
            .map_err(|e| KvError::Backend(e.to_string()))?;
        *slot = StoredValue {
            value: json,
            expires_at: Some(Instant::now() + request.ttl),
        };
        Ok(reply)
    }
}

// ── Circuit-protected decorator ────────────────────────────────

use std::sync::Arc;

use super::circuit_breaker::{CircuitBreaker, GuardError};

/// Decorator applying the shared circuit breaker and a fail-fast deadline
/// to every KV operation.
pub struct GuardedKvStore {
    inner: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedKvStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    fn map_err(err: GuardError<KvError>) -> KvError {
        match err {
            GuardError::Open => KvError::CircuitOpen,
            GuardError::Timeout => KvError::Timeout,
            GuardError::Inner(e) => e,
        }
    }
}

#[async_trait]
impl KeyValueStore for GuardedKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.breaker.run(self.inner.get(key)).await.map_err(Self::map_err)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.breaker
            .run(self.inner.put(key, value, ttl))
            .await
            .map_err(Self::map_err)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.breaker
            .run(self.inner.put_if_absent(key, value, ttl))
            .await
            .map_err(Self::map_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.breaker.run(self.inner.delete(key)).await.map_err(Self::map_err)
    }

    async fn increment(&self, key: &str, ttl_on_create: Duration) -> Result<i64, KvError> {
        self.breaker
            .run(self.inner.increment(key, ttl_on_create))
            .await
            .map_err(Self::map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        self.breaker
            .run(self.inner.expire(key, ttl))
            .await
            .map_err(Self::map_err)
    }

    async fn claim_session(
        &self,
        key: &str,
        request: SessionClaimRequest,
    ) -> Result<SessionClaimReply, KvError> {
        self.breaker
            .run(self.inner.claim_session(key, request))
            .await
            .map_err(Self::map_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppVersion;

    fn entry(node: &str, now_ms: i64) -> SessionEntry {
        SessionEntry {
            charge_point_id: "CP-1".into(),
            ocpp_version: OcppVersion::V16,
            node_id: node.into(),
            station_id: "ST-1".into(),
            tenant_id: "T-1".into(),
            connected_at_ms: now_ms,
            last_seen_at_ms: now_ms,
            epoch: 0,
        }
    }

    fn claim(node: &str, now_ms: i64, stale_ms: i64) -> SessionClaimRequest {
        SessionClaimRequest {
            entry: entry(node, now_ms),
            stale_ms,
            ttl: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn fresh_then_refreshed_then_denied() {
        let kv = InMemoryKvStore::new();

        let r = kv.claim_session("sessions:CP-1", claim("node-a", 1_000, 30_000)).await.unwrap();
        assert_eq!(r.status, ClaimStatus::Fresh);
        assert_eq!(r.epoch, 1);

        let r = kv.claim_session("sessions:CP-1", claim("node-a", 2_000, 30_000)).await.unwrap();
        assert_eq!(r.status, ClaimStatus::Refreshed);
        assert_eq!(r.epoch, 1);

        let r = kv.claim_session("sessions:CP-1", claim("node-b", 3_000, 30_000)).await.unwrap();
        assert_eq!(r.status, ClaimStatus::Denied);
        assert_eq!(r.previous_owner_node_id.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn stale_entry_is_taken_over_with_bumped_epoch() {
        let kv = InMemoryKvStore::new();
        kv.claim_session("sessions:CP-1", claim("node-a", 1_000, 30_000)).await.unwrap();

        let r = kv
            .claim_session("sessions:CP-1", claim("node-b", 40_000, 30_000))
            .await
            .unwrap();
        assert_eq!(r.status, ClaimStatus::Takeover);
        assert_eq!(r.epoch, 2);
        assert_eq!(r.previous_owner_node_id.as_deref(), Some("node-a"));

        // epoch survives into the stored entry
        let stored: SessionEntry =
            serde_json::from_str(&kv.get("sessions:CP-1").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.epoch, 2);
        assert_eq!(stored.node_id, "node-b");
    }

    #[tokio::test]
    async fn zero_stale_disables_takeover() {
        let kv = InMemoryKvStore::new();
        kv.claim_session("sessions:CP-1", claim("node-a", 1_000, 0)).await.unwrap();
        let r = kv
            .claim_session("sessions:CP-1", claim("node-b", 999_000, 0))
            .await
            .unwrap();
        assert_eq!(r.status, ClaimStatus::Denied);
    }

    #[tokio::test]
    async fn increment_sets_ttl_only_on_create() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.increment("rate:x", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(kv.increment("rate:x", Duration::from_secs(60)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn put_if_absent_claims_once() {
        let kv = InMemoryKvStore::new();
        assert!(kv.put_if_absent("k", "a", None).await.unwrap());
        assert!(!kv.put_if_absent("k", "b", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }
}
