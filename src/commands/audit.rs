//! Command audit trail
//!
//! Every dispatched command leaves a record in the KV store under its
//! commandId (and a messageId alias) mirroring the state machine
//! `Sent → {Accepted | Rejected | Failed | Timeout}`, and a copy on the
//! audit topic. Audit writes are best-effort: a degraded store is logged
//! and ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::events::EventPublisher;
use crate::infrastructure::KeyValueStore;

/// Command lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditState {
    Sent,
    Accepted,
    Rejected,
    Failed,
    Timeout,
}

impl AuditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "Sent",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
            Self::Timeout => "Timeout",
        }
    }
}

/// Stored audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAuditRecord {
    pub command_id: String,
    pub message_id: String,
    pub charge_point_id: String,
    pub command_type: String,
    pub action: String,
    pub state: AuditState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Audit writer shared by the dispatcher
pub struct CommandAudit {
    kv: Arc<dyn KeyValueStore>,
    publisher: Arc<EventPublisher>,
    ttl: Duration,
}

impl CommandAudit {
    pub fn new(kv: Arc<dyn KeyValueStore>, publisher: Arc<EventPublisher>, ttl: Duration) -> Self {
        Self { kv, publisher, ttl }
    }

    /// Record a state, updating both the commandId key and the messageId
    /// alias, and mirror it onto the audit topic.
    pub async fn record(&self, record: &CommandAuditRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!(command_id = record.command_id.as_str(), error = %e, "Audit record unserializable");
                return;
            }
        };
        for key in [
            format!("command-audit:{}", record.command_id),
            format!("command-audit:unique:{}", record.message_id),
        ] {
            if let Err(e) = self.kv.put(&key, &json, Some(self.ttl)).await {
                warn!(key = key.as_str(), error = %e, "Audit write failed");
            }
        }
        self.publisher
            .publish_audit(
                Some(record.charge_point_id.as_str()),
                json!({
                    "commandId": record.command_id,
                    "messageId": record.message_id,
                    "commandType": record.command_type,
                    "action": record.action,
                    "state": record.state.as_str(),
                    "detail": record.detail,
                }),
            )
            .await;
    }

    /// Fetch a record by commandId (used by tests and operators).
    pub async fn fetch(&self, command_id: &str) -> Option<CommandAuditRecord> {
        let raw = self
            .kv
            .get(&format!("command-audit:{}", command_id))
            .await
            .ok()??;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{CircuitBreaker, CircuitBreakerConfig, InMemoryEventBus};

    fn audit(kv: Arc<dyn KeyValueStore>) -> CommandAudit {
        let publisher = Arc::new(EventPublisher::new(
            Arc::new(InMemoryEventBus::new()),
            Arc::new(CircuitBreaker::new("bus", CircuitBreakerConfig::default())),
            "node-a",
        ));
        CommandAudit::new(kv, publisher, Duration::from_secs(86_400))
    }

    fn record(state: AuditState) -> CommandAuditRecord {
        CommandAuditRecord {
            command_id: "c1".into(),
            message_id: "m1".into(),
            charge_point_id: "CP-1".into(),
            command_type: "RemoteStop".into(),
            action: "RemoteStopTransaction".into(),
            state,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sent_then_final_state_overwrites() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(crate::infrastructure::InMemoryKvStore::new());
        let audit = audit(kv.clone());

        audit.record(&record(AuditState::Sent)).await;
        assert_eq!(audit.fetch("c1").await.unwrap().state, AuditState::Sent);

        audit.record(&record(AuditState::Accepted)).await;
        assert_eq!(audit.fetch("c1").await.unwrap().state, AuditState::Accepted);

        // messageId alias is maintained too
        assert!(kv
            .get("command-audit:unique:m1")
            .await
            .unwrap()
            .unwrap()
            .contains("Accepted"));
    }
}
