//! Outbound event envelopes and publishing
//!
//! Everything the gateway tells the CPMS goes out as an [`EventEnvelope`]
//! on one of four topics, partitioned by `chargePointId` (falling back to
//! `stationId`) so downstream consumers observe per-charger order.
//!
//! Publishing is best-effort: a degraded bus never blocks message
//! handling, it only costs telemetry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{ConnectionMeta, OcppVersion};
use crate::infrastructure::{CircuitBreaker, EventBus};
use crate::ocpp::EmittedEvent;

pub const TOPIC_STATION_EVENTS: &str = "ocpp.station.events";
pub const TOPIC_SESSION_EVENTS: &str = "ocpp.session.events";
pub const TOPIC_COMMAND_EVENTS: &str = "ocpp.command.events";
pub const TOPIC_AUDIT_EVENTS: &str = "cpms.audit.events";

/// Envelope wrapping every outbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocpp_version: Option<OcppVersion>,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            occurred_at: Utc::now(),
            correlation_id: None,
            station_id: None,
            tenant_id: None,
            charge_point_id: None,
            connector_id: None,
            ocpp_version: None,
            payload,
        }
    }

    fn for_connection(mut self, meta: &ConnectionMeta) -> Self {
        self.station_id = Some(meta.station_id.clone());
        self.tenant_id = Some(meta.tenant_id.clone());
        self.charge_point_id = Some(meta.charge_point_id.clone());
        self.ocpp_version = Some(meta.ocpp_version);
        self
    }

    /// Partition key: chargePointId, falling back to stationId.
    fn partition_key(&self) -> Option<&str> {
        self.charge_point_id
            .as_deref()
            .or(self.station_id.as_deref())
    }
}

/// Publishes envelopes onto the bus through the circuit breaker
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    breaker: Arc<CircuitBreaker>,
    source: String,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, breaker: Arc<CircuitBreaker>, node_id: impl Into<String>) -> Self {
        Self {
            bus,
            breaker,
            source: node_id.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Telemetry produced by a version adapter.
    pub async fn publish_station(&self, meta: &ConnectionMeta, event: EmittedEvent) {
        let mut envelope =
            EventEnvelope::new(event.event_type, &self.source, event.payload).for_connection(meta);
        envelope.connector_id = event.connector_id;
        self.publish(TOPIC_STATION_EVENTS, envelope).await;
    }

    /// Session lifecycle (connected, closed, transferred).
    pub async fn publish_session(&self, meta: &ConnectionMeta, event_type: &str, payload: Value) {
        let envelope = EventEnvelope::new(event_type, &self.source, payload).for_connection(meta);
        self.publish(TOPIC_SESSION_EVENTS, envelope).await;
    }

    /// Command pipeline outcomes.
    pub async fn publish_command(
        &self,
        event_type: &str,
        charge_point_id: Option<&str>,
        correlation_id: Option<&str>,
        payload: Value,
    ) {
        let mut envelope = EventEnvelope::new(event_type, &self.source, payload);
        envelope.charge_point_id = charge_point_id.map(str::to_string);
        envelope.correlation_id = correlation_id.map(str::to_string);
        self.publish(TOPIC_COMMAND_EVENTS, envelope).await;
    }

    /// Audit-trail mirror for the CPMS.
    pub async fn publish_audit(&self, charge_point_id: Option<&str>, payload: Value) {
        let mut envelope = EventEnvelope::new("CommandAudit", &self.source, payload);
        envelope.charge_point_id = charge_point_id.map(str::to_string);
        self.publish(TOPIC_AUDIT_EVENTS, envelope).await;
    }

    async fn publish(&self, topic: &str, envelope: EventEnvelope) {
        let key = envelope.partition_key().map(str::to_string);
        let payload = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!(topic, error = %e, "Failed to serialize event envelope");
                return;
            }
        };
        let result = self
            .breaker
            .run(self.bus.publish(topic, key.as_deref(), payload))
            .await;
        if let Err(e) = result {
            warn!(
                topic,
                event_type = envelope.event_type.as_str(),
                error = ?e,
                "Event publish failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{CircuitBreakerConfig, InMemoryEventBus};
    use serde_json::json;

    fn meta() -> ConnectionMeta {
        ConnectionMeta {
            connection_id: "conn-1".into(),
            charge_point_id: "CP-1".into(),
            ocpp_version: OcppVersion::V16,
            station_id: "ST-1".into(),
            tenant_id: "T-1".into(),
            session_epoch: 1,
            ip: "10.0.0.1".into(),
        }
    }

    fn publisher(bus: Arc<InMemoryEventBus>) -> EventPublisher {
        EventPublisher::new(
            bus,
            Arc::new(CircuitBreaker::new("bus", CircuitBreakerConfig::default())),
            "node-a",
        )
    }

    #[tokio::test]
    async fn station_event_is_enveloped_and_keyed_by_charge_point() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut rx = bus.subscribe(TOPIC_STATION_EVENTS, "test").await.unwrap();
        let publisher = publisher(bus);

        publisher
            .publish_station(
                &meta(),
                EmittedEvent::new("ConnectorStatusChanged", json!({"status": "Available"}))
                    .on_connector(Some(1)),
            )
            .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.key.as_deref(), Some("CP-1"));
        let envelope: EventEnvelope = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(envelope.event_type, "ConnectorStatusChanged");
        assert_eq!(envelope.source, "node-a");
        assert_eq!(envelope.connector_id, Some(1));
        assert_eq!(envelope.ocpp_version, Some(OcppVersion::V16));
        assert_eq!(envelope.payload["status"], "Available");
    }

    #[tokio::test]
    async fn command_event_carries_correlation() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut rx = bus.subscribe(TOPIC_COMMAND_EVENTS, "test").await.unwrap();
        let publisher = publisher(bus);

        publisher
            .publish_command("CommandRouted", Some("CP-7"), Some("corr-1"), json!({"ownerNodeId": "B"}))
            .await;

        let msg = rx.recv().await.unwrap();
        let envelope: EventEnvelope = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(envelope.payload["ownerNodeId"], "B");
    }
}
