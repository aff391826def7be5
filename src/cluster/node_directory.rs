//! Node directory
//!
//! Each node advertises its routing topics under `nodes:{nodeId}` with a
//! TTL, refreshed by a heartbeat task. Command routing looks the owner's
//! topics up here and falls back to the deterministic names when the
//! entry is missing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::infrastructure::{KeyValueStore, KvError};
use crate::support::ShutdownSignal;

/// Deterministic per-node command topic.
pub fn command_topic_for(node_id: &str) -> String {
    format!("cpms.command.requests.node.{}", node_id)
}

/// Deterministic per-node session-control topic.
pub fn session_control_topic_for(node_id: &str) -> String {
    format!("ocpp.session.control.node.{}", node_id)
}

/// Advertised node entry (KV key `nodes:{nodeId}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub node_id: String,
    pub command_topic: String,
    pub session_control_topic: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Timing knobs for node advertisement
#[derive(Debug, Clone)]
pub struct NodeDirectorySettings {
    pub ttl: Duration,
    pub heartbeat: Duration,
}

/// This node's directory advertisement plus lookups of peers
pub struct NodeDirectory {
    kv: Arc<dyn KeyValueStore>,
    node_id: String,
    settings: NodeDirectorySettings,
    started_at: DateTime<Utc>,
}

impl NodeDirectory {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        node_id: impl Into<String>,
        settings: NodeDirectorySettings,
    ) -> Self {
        Self {
            kv,
            node_id: node_id.into(),
            settings,
            started_at: Utc::now(),
        }
    }

    fn key(node_id: &str) -> String {
        format!("nodes:{}", node_id)
    }

    /// Write (or refresh) this node's advertisement.
    pub async fn register(&self) -> Result<(), KvError> {
        let entry = NodeEntry {
            node_id: self.node_id.clone(),
            command_topic: command_topic_for(&self.node_id),
            session_control_topic: session_control_topic_for(&self.node_id),
            started_at: self.started_at,
            last_seen_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry).map_err(|e| KvError::Backend(e.to_string()))?;
        self.kv
            .put(&Self::key(&self.node_id), &json, Some(self.settings.ttl))
            .await
    }

    /// Look up another node's advertisement.
    pub async fn lookup(&self, node_id: &str) -> Result<Option<NodeEntry>, KvError> {
        let raw = self.kv.get(&Self::key(node_id)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    /// The command topic to route to `node_id`, from its advertisement
    /// or the deterministic fallback.
    pub async fn command_topic(&self, node_id: &str) -> String {
        match self.lookup(node_id).await {
            Ok(Some(entry)) => entry.command_topic,
            Ok(None) => command_topic_for(node_id),
            Err(e) => {
                debug!(node_id, error = %e, "Node lookup failed, using deterministic topic");
                command_topic_for(node_id)
            }
        }
    }

    /// Keep the advertisement fresh until shutdown.
    pub fn spawn_heartbeat(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let directory = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(directory.settings.heartbeat);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = directory.register().await {
                            warn!(node_id = directory.node_id.as_str(), error = %e, "Node heartbeat failed");
                        }
                    }
                    _ = shutdown.notified().wait() => {
                        // Let the TTL reap the advertisement.
                        break;
                    }
                }
            }
        })
    }
}
