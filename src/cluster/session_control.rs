//! Cross-node session control
//!
//! When a claim ends in takeover, the winning node tells the previous
//! owner to drop its socket. The consumer only honors a ForceDisconnect
//! whose epoch is strictly newer than the local session's, so an echo of
//! an old takeover can never close a freshly-won session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infrastructure::{CircuitBreaker, EventBus};
use crate::server::registry::ConnectionRegistry;
use crate::support::ShutdownSignal;

use super::node_directory::session_control_topic_for;

/// WebSocket close code for a transferred session.
pub const CLOSE_SESSION_TRANSFERRED: u16 = 1012;

/// Cross-node disconnect order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceDisconnect {
    pub charge_point_id: String,
    pub new_epoch: u64,
    pub new_owner_node_id: String,
    pub reason: String,
}

/// Publisher half: used by the connection path on takeover
pub struct SessionControl {
    bus: Arc<dyn EventBus>,
    breaker: Arc<CircuitBreaker>,
    node_id: String,
}

impl SessionControl {
    pub fn new(bus: Arc<dyn EventBus>, breaker: Arc<CircuitBreaker>, node_id: impl Into<String>) -> Self {
        Self {
            bus,
            breaker,
            node_id: node_id.into(),
        }
    }

    /// Tell `previous_owner` to drop its socket for this charger.
    pub async fn publish_force_disconnect(&self, previous_owner: &str, order: ForceDisconnect) {
        let topic = session_control_topic_for(previous_owner);
        let payload = match serde_json::to_string(&order) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize ForceDisconnect");
                return;
            }
        };
        let result = self
            .breaker
            .run(self.bus.publish(&topic, Some(order.charge_point_id.as_str()), payload))
            .await;
        match result {
            Ok(()) => info!(
                charge_point_id = order.charge_point_id.as_str(),
                previous_owner,
                new_epoch = order.new_epoch,
                "ForceDisconnect published"
            ),
            Err(e) => warn!(
                charge_point_id = order.charge_point_id.as_str(),
                previous_owner,
                error = ?e,
                "ForceDisconnect publish failed"
            ),
        }
    }

    /// Consume this node's session-control topic and close superseded
    /// sockets.
    pub fn spawn_consumer(
        &self,
        registry: Arc<ConnectionRegistry>,
        group: String,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            let topic = session_control_topic_for(&node_id);
            let mut rx = match bus.subscribe(&topic, &group).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(topic = topic.as_str(), error = %e, "Session-control subscribe failed");
                    return;
                }
            };
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        handle_order(&registry, &message.payload);
                    }
                    _ = shutdown.notified().wait() => break,
                }
            }
        })
    }
}

fn handle_order(registry: &ConnectionRegistry, payload: &str) {
    let order: ForceDisconnect = match serde_json::from_str(payload) {
        Ok(order) => order,
        Err(e) => {
            debug!(error = %e, "Unreadable session-control message dropped");
            return;
        }
    };
    let Some(meta) = registry.meta(&order.charge_point_id) else {
        debug!(
            charge_point_id = order.charge_point_id.as_str(),
            "ForceDisconnect for unknown local session"
        );
        return;
    };
    // An echo carrying an epoch we already match (or beat) is stale.
    if meta.session_epoch >= order.new_epoch {
        debug!(
            charge_point_id = order.charge_point_id.as_str(),
            local_epoch = meta.session_epoch,
            new_epoch = order.new_epoch,
            "Stale ForceDisconnect ignored"
        );
        return;
    }
    info!(
        charge_point_id = order.charge_point_id.as_str(),
        new_owner = order.new_owner_node_id.as_str(),
        new_epoch = order.new_epoch,
        "Closing session transferred to another node"
    );
    registry.close(
        &order.charge_point_id,
        CLOSE_SESSION_TRANSFERRED,
        &order.reason,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionMeta, OcppVersion};
    use crate::server::registry::OutboundMessage;
    use tokio::sync::mpsc;

    fn register(registry: &ConnectionRegistry, epoch: u64) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(
            ConnectionMeta {
                connection_id: "conn-1".into(),
                charge_point_id: "CP-7".into(),
                ocpp_version: OcppVersion::V16,
                station_id: "ST-1".into(),
                tenant_id: "T-1".into(),
                session_epoch: epoch,
                ip: "10.0.0.1".into(),
            },
            tx,
        );
        rx
    }

    fn order(new_epoch: u64) -> String {
        serde_json::to_string(&ForceDisconnect {
            charge_point_id: "CP-7".into(),
            new_epoch,
            new_owner_node_id: "node-b".into(),
            reason: "session transferred".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn newer_epoch_closes_local_socket_with_1012() {
        let registry = ConnectionRegistry::new();
        let mut rx = register(&registry, 1);

        handle_order(&registry, &order(2));
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundMessage::Close {
                code: 1012,
                reason: "session transferred".into()
            }
        );
    }

    #[tokio::test]
    async fn echo_with_equal_or_older_epoch_is_ignored() {
        let registry = ConnectionRegistry::new();
        let mut rx = register(&registry, 3);

        handle_order(&registry, &order(3));
        handle_order(&registry, &order(2));
        assert!(rx.try_recv().is_err());
    }
}
