//! Command consumer
//!
//! Each node drinks from two topics: the shared `cpms.command.requests`
//! (competing consumers across the cluster) and its own node topic
//! (commands already routed here). A command for a charger owned by a
//! different node is republished verbatim onto the owner's topic; local
//! commands are deduplicated, dispatched, and their outcome emitted on
//! the command-event topic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{NodeDirectory, SessionDirectory};
use crate::domain::CommandRequest;
use crate::events::EventPublisher;
use crate::infrastructure::{EventBus, KeyValueStore};
use crate::server::registry::ConnectionRegistry;
use crate::support::ShutdownSignal;

use super::dispatcher::{CommandDispatcher, DispatchOutcome};

/// Shared command-request topic.
pub const TOPIC_COMMAND_REQUESTS: &str = "cpms.command.requests";

/// Consumer knobs
#[derive(Debug, Clone)]
pub struct CommandConsumerSettings {
    /// Base consumer group; the node topic uses `{base}-{nodeId}`.
    pub group: String,
    /// TTL on the `command-idempotency:{commandId}` claim.
    pub idempotency_ttl: Duration,
}

impl Default for CommandConsumerSettings {
    fn default() -> Self {
        Self {
            group: "ocpp-gateway".to_string(),
            idempotency_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Bus-driven command intake for one node
pub struct CommandConsumer {
    bus: Arc<dyn EventBus>,
    kv: Arc<dyn KeyValueStore>,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionDirectory>,
    nodes: Arc<NodeDirectory>,
    dispatcher: Arc<CommandDispatcher>,
    publisher: Arc<EventPublisher>,
    node_id: String,
    settings: CommandConsumerSettings,
}

impl CommandConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn EventBus>,
        kv: Arc<dyn KeyValueStore>,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionDirectory>,
        nodes: Arc<NodeDirectory>,
        dispatcher: Arc<CommandDispatcher>,
        publisher: Arc<EventPublisher>,
        node_id: impl Into<String>,
        settings: CommandConsumerSettings,
    ) -> Self {
        Self {
            bus,
            kv,
            registry,
            sessions,
            nodes,
            dispatcher,
            publisher,
            node_id: node_id.into(),
            settings,
        }
    }

    /// Subscribe both topics and process until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let node_topic = crate::cluster::command_topic_for(&self.node_id);
            let node_group = format!("{}-{}", self.settings.group, self.node_id);

            let mut shared_rx = match self
                .bus
                .subscribe(TOPIC_COMMAND_REQUESTS, &self.settings.group)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "Shared command topic subscribe failed");
                    return;
                }
            };
            // The node-specific group must never share work with peers.
            let mut node_rx = match self.bus.subscribe(&node_topic, &node_group).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "Node command topic subscribe failed");
                    return;
                }
            };
            info!(
                node_id = self.node_id.as_str(),
                node_topic = node_topic.as_str(),
                "Command consumer started"
            );

            loop {
                tokio::select! {
                    message = shared_rx.recv() => {
                        let Some(message) = message else { break };
                        self.handle_message(&message.payload).await;
                    }
                    message = node_rx.recv() => {
                        let Some(message) = message else { break };
                        self.handle_message(&message.payload).await;
                    }
                    _ = shutdown.notified().wait() => break,
                }
            }
        })
    }

    /// Process one raw bus message.
    pub async fn handle_message(&self, payload: &str) {
        let command: CommandRequest = match serde_json::from_str(payload) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "Unparseable command request dropped");
                return;
            }
        };
        let correlation = command.correlation_id.as_deref();

        let Some(charge_point_id) = command.charge_point_id.clone().filter(|id| !id.is_empty())
        else {
            self.publisher
                .publish_command(
                    "CommandFailed",
                    None,
                    correlation,
                    json!({
                        "commandId": command.command_id,
                        "commandType": command.command_type.as_str(),
                        "reason": "Missing chargePointId",
                    }),
                )
                .await;
            return;
        };

        // Route to the owner before consuming idempotency.
        match self.sessions.owner_of(&charge_point_id).await {
            Ok(Some(owner)) if owner.node_id != self.node_id => {
                let topic = self.nodes.command_topic(&owner.node_id).await;
                let routed = self
                    .bus
                    .publish(&topic, Some(charge_point_id.as_str()), payload.to_string())
                    .await;
                match routed {
                    Ok(()) => {
                        info!(
                            charge_point_id = charge_point_id.as_str(),
                            command_id = command.command_id.as_str(),
                            owner = owner.node_id.as_str(),
                            "Command routed to owning node"
                        );
                        self.publisher
                            .publish_command(
                                "CommandRouted",
                                Some(charge_point_id.as_str()),
                                correlation,
                                json!({
                                    "commandId": command.command_id,
                                    "commandType": command.command_type.as_str(),
                                    "ownerNodeId": owner.node_id,
                                }),
                            )
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            charge_point_id = charge_point_id.as_str(),
                            command_id = command.command_id.as_str(),
                            error = %e,
                            "Command routing publish failed"
                        );
                        self.publisher
                            .publish_command(
                                "CommandFailed",
                                Some(charge_point_id.as_str()),
                                correlation,
                                json!({
                                    "commandId": command.command_id,
                                    "commandType": command.command_type.as_str(),
                                    "reason": "Routing failed",
                                }),
                            )
                            .await;
                    }
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // Without ownership information, fall through to the local
                // socket check rather than dropping the command.
                warn!(charge_point_id = charge_point_id.as_str(), error = %e, "Owner lookup failed");
            }
        }

        // Dispatch-once claim.
        let idempotency_key = format!("command-idempotency:{}", command.command_id);
        match self
            .kv
            .put_if_absent(&idempotency_key, "1", Some(self.settings.idempotency_ttl))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    command_id = command.command_id.as_str(),
                    "Duplicate command dropped"
                );
                self.publisher
                    .publish_command(
                        "CommandDuplicate",
                        Some(charge_point_id.as_str()),
                        correlation,
                        json!({
                            "commandId": command.command_id,
                            "commandType": command.command_type.as_str(),
                        }),
                    )
                    .await;
                return;
            }
            Err(e) => {
                warn!(command_id = command.command_id.as_str(), error = %e, "Idempotency claim failed");
            }
        }

        // Resolve the local socket.
        let Some(meta) = self.registry.meta(&charge_point_id) else {
            self.publisher
                .publish_command(
                    "CommandFailed",
                    Some(charge_point_id.as_str()),
                    correlation,
                    json!({
                        "commandId": command.command_id,
                        "commandType": command.command_type.as_str(),
                        "reason": "Charge point offline",
                    }),
                )
                .await;
            return;
        };

        self.publisher
            .publish_command(
                "CommandDispatched",
                Some(charge_point_id.as_str()),
                correlation,
                json!({
                    "commandId": command.command_id,
                    "commandType": command.command_type.as_str(),
                    "ocppVersion": meta.ocpp_version,
                }),
            )
            .await;

        let outcome = self.dispatcher.dispatch(&meta, &command).await;
        let payload = match &outcome {
            DispatchOutcome::Accepted { status, .. } => json!({
                "commandId": command.command_id,
                "commandType": command.command_type.as_str(),
                "status": status,
            }),
            DispatchOutcome::Rejected { status, details } => json!({
                "commandId": command.command_id,
                "commandType": command.command_type.as_str(),
                "status": status,
                "details": details,
            }),
            DispatchOutcome::Timeout => json!({
                "commandId": command.command_id,
                "commandType": command.command_type.as_str(),
            }),
            DispatchOutcome::Failed(failure) => json!({
                "commandId": command.command_id,
                "commandType": command.command_type.as_str(),
                "reason": failure.reason(),
            }),
        };
        self.publisher
            .publish_command(outcome.event_type(), Some(charge_point_id.as_str()), correlation, payload)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeDirectorySettings, SessionDirectorySettings};
    use crate::commands::{CommandAudit, RequestTracker};
    use crate::domain::OcppVersion;
    use crate::events::{EventEnvelope, TOPIC_COMMAND_EVENTS};
    use crate::infrastructure::{
        CircuitBreaker, CircuitBreakerConfig, InMemoryEventBus, InMemoryKvStore,
    };
    use crate::schema::SchemaRegistry;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    struct Harness {
        consumer: CommandConsumer,
        bus: Arc<InMemoryEventBus>,
        kv: Arc<InMemoryKvStore>,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionDirectory>,
    }

    fn harness(node_id: &str) -> Harness {
        let bus = Arc::new(InMemoryEventBus::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let schemas = Arc::new(SchemaRegistry::load(&HashSet::new()).unwrap());
        let breaker = Arc::new(CircuitBreaker::new("bus", CircuitBreakerConfig::default()));
        let publisher = Arc::new(EventPublisher::new(bus.clone(), breaker, node_id));
        let sessions = Arc::new(SessionDirectory::new(
            kv.clone(),
            node_id,
            SessionDirectorySettings {
                ttl: Duration::from_secs(300),
                stale: Duration::from_secs(60),
            },
        ));
        let nodes = Arc::new(NodeDirectory::new(
            kv.clone(),
            node_id,
            NodeDirectorySettings {
                ttl: Duration::from_secs(120),
                heartbeat: Duration::from_secs(30),
            },
        ));
        let tracker = Arc::new(RequestTracker::new(schemas.clone()));
        let audit = Arc::new(CommandAudit::new(
            kv.clone(),
            publisher.clone(),
            Duration::from_secs(86_400),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            registry.clone(),
            tracker,
            schemas,
            audit,
            Duration::from_millis(100),
        ));
        let consumer = CommandConsumer::new(
            bus.clone(),
            kv.clone(),
            registry.clone(),
            sessions.clone(),
            nodes,
            dispatcher,
            publisher,
            node_id,
            CommandConsumerSettings::default(),
        );
        Harness {
            consumer,
            bus,
            kv,
            registry,
            sessions,
        }
    }

    async fn command_events(
        rx: &mut mpsc::Receiver<crate::infrastructure::BusMessage>,
    ) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            events.push(serde_json::from_str(&message.payload).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn missing_charge_point_id_fails() {
        let h = harness("node-a");
        let mut events_rx = h.bus.subscribe(TOPIC_COMMAND_EVENTS, "test").await.unwrap();

        h.consumer
            .handle_message(r#"{"commandId":"c1","commandType":"Reset"}"#)
            .await;

        let events = command_events(&mut events_rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "CommandFailed");
        assert_eq!(events[0].payload["reason"], "Missing chargePointId");
    }

    #[tokio::test]
    async fn foreign_owner_routes_verbatim_without_dispatch() {
        let h = harness("node-a");
        // node-b owns CP-7
        let b_sessions = SessionDirectory::new(
            h.kv.clone(),
            "node-b",
            SessionDirectorySettings {
                ttl: Duration::from_secs(300),
                stale: Duration::from_secs(60),
            },
        );
        b_sessions
            .claim("CP-7", OcppVersion::V16, "ST-1", "T-1")
            .await
            .unwrap();

        let mut routed_rx = h
            .bus
            .subscribe("cpms.command.requests.node.node-b", "test")
            .await
            .unwrap();
        let mut events_rx = h.bus.subscribe(TOPIC_COMMAND_EVENTS, "test").await.unwrap();

        let raw = r#"{"commandId":"c1","chargePointId":"CP-7","commandType":"RemoteStop","payload":{"sessionId":"TX-9"}}"#;
        h.consumer.handle_message(raw).await;

        // republished verbatim with the charger as partition key
        let routed = routed_rx.try_recv().unwrap();
        assert_eq!(routed.payload, raw);
        assert_eq!(routed.key.as_deref(), Some("CP-7"));

        let events = command_events(&mut events_rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "CommandRouted");
        assert_eq!(events[0].payload["ownerNodeId"], "node-b");

        // no idempotency claim was consumed on the routing node
        assert!(h.kv.get("command-idempotency:c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_command_id_reported() {
        let h = harness("node-a");
        h.sessions
            .claim("CP-7", OcppVersion::V16, "ST-1", "T-1")
            .await
            .unwrap();
        let mut events_rx = h.bus.subscribe(TOPIC_COMMAND_EVENTS, "test").await.unwrap();

        let raw = r#"{"commandId":"c1","chargePointId":"CP-7","commandType":"Reset","payload":{"type":"Soft"}}"#;
        h.consumer.handle_message(raw).await;
        h.consumer.handle_message(raw).await;

        let events = command_events(&mut events_rx).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        // first attempt: offline (no local socket); second: duplicate
        assert_eq!(types[0], "CommandFailed");
        assert_eq!(events[0].payload["reason"], "Charge point offline");
        assert_eq!(types[1], "CommandDuplicate");
    }

    #[tokio::test]
    async fn local_dispatch_emits_dispatched_then_outcome() {
        let h = harness("node-a");
        h.sessions
            .claim("CP-7", OcppVersion::V16, "ST-1", "T-1")
            .await
            .unwrap();

        let (tx, mut sock_rx) = mpsc::unbounded_channel();
        h.registry.register(
            crate::domain::ConnectionMeta {
                connection_id: "conn-1".into(),
                charge_point_id: "CP-7".into(),
                ocpp_version: OcppVersion::V16,
                station_id: "ST-1".into(),
                tenant_id: "T-1".into(),
                session_epoch: 1,
                ip: "10.0.0.1".into(),
            },
            tx,
        );
        let mut events_rx = h.bus.subscribe(TOPIC_COMMAND_EVENTS, "test").await.unwrap();

        // dispatch will time out quickly with nobody answering
        h.consumer
            .handle_message(
                r#"{"commandId":"c2","chargePointId":"CP-7","commandType":"Reset","payload":{"type":"Soft"}}"#,
            )
            .await;

        // the CALL reached the socket
        let sent = sock_rx.recv().await.unwrap();
        assert!(matches!(sent, crate::server::registry::OutboundMessage::Text(_)));

        let events = command_events(&mut events_rx).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["CommandDispatched", "CommandTimeout"]);
    }
}
