//! Cluster-wide session ownership
//!
//! One entry per charger under `sessions:{chargePointId}`, claimed and
//! arbitrated atomically inside the KV store (see
//! [`KeyValueStore::claim_session`]). This directory is the sole
//! cluster-wide mutex: a node owns a charger exactly while the entry
//! carries its nodeId, and epochs discriminate stale from fresh
//! ownership after takeovers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::session::{SessionClaimReply, SessionClaimRequest, SessionEntry};
use crate::domain::OcppVersion;
use crate::infrastructure::{KeyValueStore, KvError};

/// Timing knobs for ownership
#[derive(Debug, Clone)]
pub struct SessionDirectorySettings {
    /// TTL on the session entry; refreshed on every touch.
    pub ttl: Duration,
    /// Age of `lastSeenAtMs` beyond which another node may take over.
    /// Zero disables takeover.
    pub stale: Duration,
}

/// Ownership operations for this node
pub struct SessionDirectory {
    kv: Arc<dyn KeyValueStore>,
    node_id: String,
    settings: SessionDirectorySettings,
}

impl SessionDirectory {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        node_id: impl Into<String>,
        settings: SessionDirectorySettings,
    ) -> Self {
        Self {
            kv,
            node_id: node_id.into(),
            settings,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn key(charge_point_id: &str) -> String {
        format!("sessions:{}", charge_point_id)
    }

    /// Attempt to own `charge_point_id` for this node.
    pub async fn claim(
        &self,
        charge_point_id: &str,
        version: OcppVersion,
        station_id: &str,
        tenant_id: &str,
    ) -> Result<SessionClaimReply, KvError> {
        let now_ms = Utc::now().timestamp_millis();
        let entry = SessionEntry {
            charge_point_id: charge_point_id.to_string(),
            ocpp_version: version,
            node_id: self.node_id.clone(),
            station_id: station_id.to_string(),
            tenant_id: tenant_id.to_string(),
            connected_at_ms: now_ms,
            last_seen_at_ms: now_ms,
            epoch: 0,
        };
        self.kv
            .claim_session(
                &Self::key(charge_point_id),
                SessionClaimRequest {
                    entry,
                    stale_ms: self.settings.stale.as_millis() as i64,
                    ttl: self.settings.ttl,
                },
            )
            .await
    }

    /// Refresh liveness on an inbound message. Never steals: if another
    /// node owns the entry by now, this is logged and skipped.
    pub async fn touch(&self, charge_point_id: &str) -> Result<(), KvError> {
        let key = Self::key(charge_point_id);
        let Some(raw) = self.kv.get(&key).await? else {
            debug!(charge_point_id, "Session entry missing on touch");
            return Ok(());
        };
        let mut entry: SessionEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(charge_point_id, error = %e, "Session entry unreadable on touch");
                return Ok(());
            }
        };
        if entry.node_id != self.node_id {
            debug!(
                charge_point_id,
                owner = entry.node_id.as_str(),
                "Session now owned elsewhere, touch skipped"
            );
            return Ok(());
        }
        entry.last_seen_at_ms = Utc::now().timestamp_millis();
        let json = serde_json::to_string(&entry).map_err(|e| KvError::Backend(e.to_string()))?;
        self.kv.put(&key, &json, Some(self.settings.ttl)).await
    }

    /// Delete the entry on clean close, but only while still the owner.
    pub async fn release(&self, charge_point_id: &str) -> Result<(), KvError> {
        let key = Self::key(charge_point_id);
        match self.kv.get(&key).await? {
            Some(raw) => {
                let owned = serde_json::from_str::<SessionEntry>(&raw)
                    .map(|e| e.node_id == self.node_id)
                    .unwrap_or(false);
                if owned {
                    self.kv.delete(&key).await?;
                } else {
                    debug!(charge_point_id, "Session owned elsewhere, release skipped");
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Current owner entry, if any.
    pub async fn owner_of(&self, charge_point_id: &str) -> Result<Option<SessionEntry>, KvError> {
        let raw = self.kv.get(&Self::key(charge_point_id)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::ClaimStatus;
    use crate::infrastructure::InMemoryKvStore;

    fn directory(kv: Arc<dyn KeyValueStore>, node: &str, stale: Duration) -> SessionDirectory {
        SessionDirectory::new(
            kv,
            node,
            SessionDirectorySettings {
                ttl: Duration::from_secs(300),
                stale,
            },
        )
    }

    #[tokio::test]
    async fn claim_touch_release_lifecycle() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let dir = directory(kv.clone(), "node-a", Duration::from_secs(30));

        let reply = dir
            .claim("CP-1", OcppVersion::V16, "ST-1", "T-1")
            .await
            .unwrap();
        assert_eq!(reply.status, ClaimStatus::Fresh);
        assert_eq!(reply.epoch, 1);

        dir.touch("CP-1").await.unwrap();
        let owner = dir.owner_of("CP-1").await.unwrap().unwrap();
        assert_eq!(owner.node_id, "node-a");

        dir.release("CP-1").await.unwrap();
        assert!(dir.owner_of("CP-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_owner_is_not_touched_or_released() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let a = directory(kv.clone(), "node-a", Duration::from_secs(30));
        let b = directory(kv.clone(), "node-b", Duration::from_secs(30));

        a.claim("CP-1", OcppVersion::V16, "ST-1", "T-1").await.unwrap();
        let before = a.owner_of("CP-1").await.unwrap().unwrap();

        // node-b must neither advance lastSeen nor delete
        b.touch("CP-1").await.unwrap();
        b.release("CP-1").await.unwrap();

        let after = a.owner_of("CP-1").await.unwrap().unwrap();
        assert_eq!(after.node_id, "node-a");
        assert_eq!(after.last_seen_at_ms, before.last_seen_at_ms);
    }

    #[tokio::test]
    async fn stale_owner_is_taken_over_with_epoch_bump() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let a = directory(kv.clone(), "node-a", Duration::from_millis(20));
        let b = directory(kv.clone(), "node-b", Duration::from_millis(20));

        let first = a.claim("CP-7", OcppVersion::V16, "ST-1", "T-1").await.unwrap();
        assert_eq!(first.epoch, 1);

        // node-a goes quiet past the staleness horizon
        tokio::time::sleep(Duration::from_millis(50)).await;

        let takeover = b.claim("CP-7", OcppVersion::V16, "ST-1", "T-1").await.unwrap();
        assert_eq!(takeover.status, ClaimStatus::Takeover);
        assert_eq!(takeover.epoch, first.epoch + 1);
        assert_eq!(takeover.previous_owner_node_id.as_deref(), Some("node-a"));
        assert_eq!(b.owner_of("CP-7").await.unwrap().unwrap().node_id, "node-b");
    }

    #[tokio::test]
    async fn denied_when_live_owner_exists() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let a = directory(kv.clone(), "node-a", Duration::from_secs(3600));
        let b = directory(kv.clone(), "node-b", Duration::from_secs(3600));

        a.claim("CP-1", OcppVersion::V16, "ST-1", "T-1").await.unwrap();
        let reply = b.claim("CP-1", OcppVersion::V16, "ST-1", "T-1").await.unwrap();
        assert_eq!(reply.status, ClaimStatus::Denied);
        assert_eq!(reply.previous_owner_node_id.as_deref(), Some("node-a"));
    }
}
