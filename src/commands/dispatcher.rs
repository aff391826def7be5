//! Command dispatcher
//!
//! Maps a CPMS command to the version-specific OCPP action, normalizes
//! legacy payload shapes, validates against the request schema, sends
//! the CALL and awaits the tracker. Result codes propagate verbatim;
//! a tracker rejection becomes a timeout.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{CommandRequest, CommandType, ConnectionMeta, OcppVersion};
use crate::schema::SchemaRegistry;
use crate::server::registry::ConnectionRegistry;
use crate::support::ocpp_frame::OcppFrame;

use super::audit::{AuditState, CommandAudit, CommandAuditRecord};
use super::tracker::{RequestTracker, TrackedReply};

/// Failure before (or instead of) a charger verdict
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchFailure {
    /// No action exists for this command on the session's version.
    UnsupportedCommand,
    /// No request schema registered for the mapped action.
    SchemaMissing,
    PayloadValidationFailed(Vec<String>),
    SendFailed(String),
}

impl DispatchFailure {
    pub fn reason(&self) -> String {
        match self {
            Self::UnsupportedCommand => "UnsupportedCommand".into(),
            Self::SchemaMissing => "SchemaMissing".into(),
            Self::PayloadValidationFailed(errors) => {
                format!("PayloadValidationFailed: {}", errors.join("; "))
            }
            Self::SendFailed(e) => format!("SendFailed: {}", e),
        }
    }
}

/// Terminal outcome of one dispatched command
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Accepted { status: String, response: Value },
    Rejected { status: String, details: Value },
    Timeout,
    Failed(DispatchFailure),
}

impl DispatchOutcome {
    /// Event type emitted for this outcome on the command topic.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "CommandAccepted",
            Self::Rejected { .. } => "CommandRejected",
            Self::Timeout => "CommandTimeout",
            Self::Failed(_) => "CommandFailed",
        }
    }
}

/// Version-aware command → action mapping.
fn action_for(command_type: CommandType, version: OcppVersion) -> Option<&'static str> {
    use CommandType::*;
    match (command_type, version.is_v2x()) {
        (Reset, _) => Some("Reset"),
        (RemoteStart, false) => Some("RemoteStartTransaction"),
        (RemoteStart, true) => Some("RequestStartTransaction"),
        (RemoteStop, false) => Some("RemoteStopTransaction"),
        (RemoteStop, true) => Some("RequestStopTransaction"),
        (UnlockConnector, _) => Some("UnlockConnector"),
        (ChangeConfiguration, false) => Some("ChangeConfiguration"),
        (ChangeConfiguration, true) => None,
        (TriggerMessage, false) => Some("TriggerMessage"),
        (TriggerMessage, true) => None,
        (UpdateFirmware, _) => Some("UpdateFirmware"),
    }
}

/// Sends CALLs and resolves their replies
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<RequestTracker>,
    schemas: Arc<SchemaRegistry>,
    audit: Arc<CommandAudit>,
    default_timeout: Duration,
    remote_start_seq: AtomicI64,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<RequestTracker>,
        schemas: Arc<SchemaRegistry>,
        audit: Arc<CommandAudit>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            schemas,
            audit,
            default_timeout,
            remote_start_seq: AtomicI64::new(1),
        }
    }

    /// Dispatch one command to a locally-connected charger.
    pub async fn dispatch(&self, meta: &ConnectionMeta, command: &CommandRequest) -> DispatchOutcome {
        let version = meta.ocpp_version;
        let Some(action) = action_for(command.command_type, version) else {
            return DispatchOutcome::Failed(DispatchFailure::UnsupportedCommand);
        };

        let payload = self.normalize_payload(command.command_type, version, &command.payload);

        if !self.schemas.has_request_schema(version, action) {
            return DispatchOutcome::Failed(DispatchFailure::SchemaMissing);
        }
        let validation = self.schemas.validate_request(version, action, &payload);
        if !validation.is_valid() {
            return DispatchOutcome::Failed(DispatchFailure::PayloadValidationFailed(
                validation.errors().to_vec(),
            ));
        }

        let message_id = Uuid::new_v4().to_string();
        let mut record = CommandAuditRecord {
            command_id: command.command_id.clone(),
            message_id: message_id.clone(),
            charge_point_id: meta.charge_point_id.clone(),
            command_type: command.command_type.as_str().to_string(),
            action: action.to_string(),
            state: AuditState::Sent,
            detail: None,
            updated_at: Utc::now(),
        };
        self.audit.record(&record).await;

        let reply_rx = self.tracker.register(
            &message_id,
            &meta.charge_point_id,
            version,
            action,
            Some(command.command_id.clone()),
        );

        let call = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.to_string(),
            payload,
        }
        .serialize();

        info!(
            charge_point_id = meta.charge_point_id.as_str(),
            command_id = command.command_id.as_str(),
            action,
            message_id = message_id.as_str(),
            "Sending command"
        );
        if let Err(e) = self.registry.send_text(&meta.charge_point_id, call) {
            self.tracker.discard(&message_id);
            record.state = AuditState::Failed;
            record.detail = Some(e.clone());
            record.updated_at = Utc::now();
            self.audit.record(&record).await;
            return DispatchOutcome::Failed(DispatchFailure::SendFailed(e));
        }

        let timeout = command
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let outcome = match self.tracker.await_reply(&message_id, reply_rx, timeout).await {
            Some(TrackedReply::Result(response)) => {
                // Many responses carry no status member; absence means the
                // charger simply executed the request.
                let status = response
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("Accepted")
                    .to_string();
                if status == "Accepted" {
                    DispatchOutcome::Accepted { status, response }
                } else {
                    DispatchOutcome::Rejected {
                        status,
                        details: response,
                    }
                }
            }
            Some(TrackedReply::CallError {
                code,
                description,
                details,
            }) => DispatchOutcome::Rejected {
                status: code,
                details: json!({"description": description, "details": details}),
            },
            Some(TrackedReply::ResponseInvalid { errors }) => {
                warn!(
                    charge_point_id = meta.charge_point_id.as_str(),
                    action, "Charger response failed schema validation"
                );
                DispatchOutcome::Rejected {
                    status: "ResponseValidationFailed".into(),
                    details: json!({"errors": errors}),
                }
            }
            None => DispatchOutcome::Timeout,
        };

        record.state = match &outcome {
            DispatchOutcome::Accepted { .. } => AuditState::Accepted,
            DispatchOutcome::Rejected { .. } => AuditState::Rejected,
            DispatchOutcome::Timeout => AuditState::Timeout,
            DispatchOutcome::Failed(_) => AuditState::Failed,
        };
        record.detail = match &outcome {
            DispatchOutcome::Rejected { status, .. } => Some(status.clone()),
            DispatchOutcome::Timeout => Some("no reply within deadline".into()),
            _ => None,
        };
        record.updated_at = Utc::now();
        self.audit.record(&record).await;

        outcome
    }

    /// Legacy-shape normalization:
    /// - any *Stop: `sessionId` becomes `transactionId` (string on 2.x),
    /// - 2.x RemoteStart: bare `idTag` is wrapped as a Central idToken,
    ///   minting a `remoteStartId` when the legacy payload has none.
    fn normalize_payload(
        &self,
        command_type: CommandType,
        version: OcppVersion,
        payload: &Value,
    ) -> Value {
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => json!({}),
            other => other.clone(),
        };
        let Some(map) = payload.as_object_mut() else {
            return payload;
        };

        if command_type == CommandType::RemoteStop {
            if let Some(session_id) = map.remove("sessionId") {
                let transaction_id = if version.is_v2x() {
                    match session_id {
                        Value::String(s) => Value::String(s),
                        other => Value::String(other.to_string()),
                    }
                } else {
                    match &session_id {
                        Value::String(s) => s
                            .parse::<i64>()
                            .map(|n| json!(n))
                            .unwrap_or(session_id.clone()),
                        _ => session_id.clone(),
                    }
                };
                map.entry("transactionId".to_string())
                    .or_insert(transaction_id);
            }
        }

        if command_type == CommandType::RemoteStart && version.is_v2x() {
            if !map.contains_key("idToken") {
                if let Some(id_tag) = map.remove("idTag") {
                    map.insert(
                        "idToken".to_string(),
                        json!({"idToken": id_tag, "type": "Central"}),
                    );
                    map.entry("remoteStartId".to_string()).or_insert_with(|| {
                        json!(self.remote_start_seq.fetch_add(1, Ordering::Relaxed))
                    });
                }
            }
        }

        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::infrastructure::{
        CircuitBreaker, CircuitBreakerConfig, InMemoryEventBus, InMemoryKvStore,
    };
    use crate::server::registry::OutboundMessage;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn dispatcher(
        registry: Arc<ConnectionRegistry>,
    ) -> (CommandDispatcher, Arc<RequestTracker>, Arc<CommandAudit>) {
        let schemas = Arc::new(SchemaRegistry::load(&HashSet::new()).unwrap());
        let tracker = Arc::new(RequestTracker::new(schemas.clone()));
        let publisher = Arc::new(EventPublisher::new(
            Arc::new(InMemoryEventBus::new()),
            Arc::new(CircuitBreaker::new("bus", CircuitBreakerConfig::default())),
            "node-a",
        ));
        let audit = Arc::new(CommandAudit::new(
            Arc::new(InMemoryKvStore::new()),
            publisher,
            Duration::from_secs(86_400),
        ));
        (
            CommandDispatcher::new(
                registry,
                tracker.clone(),
                schemas,
                audit.clone(),
                Duration::from_millis(200),
            ),
            tracker,
            audit,
        )
    }

    fn meta(version: OcppVersion) -> ConnectionMeta {
        ConnectionMeta {
            connection_id: "conn-1".into(),
            charge_point_id: "CP-7".into(),
            ocpp_version: version,
            station_id: "ST-1".into(),
            tenant_id: "T-1".into(),
            session_epoch: 1,
            ip: "10.0.0.1".into(),
        }
    }

    fn command(command_type: CommandType, payload: Value) -> CommandRequest {
        CommandRequest {
            command_id: "c1".into(),
            charge_point_id: Some("CP-7".into()),
            command_type,
            payload,
            timeout_seconds: None,
            correlation_id: None,
        }
    }

    async fn sent_frame(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> OcppFrame {
        match rx.recv().await.unwrap() {
            OutboundMessage::Text(text) => OcppFrame::parse(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepted_reply_resolves_dispatch() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(meta(OcppVersion::V16).clone(), tx);
        let (dispatcher, tracker, audit) = self::dispatcher(registry);

        let meta_v16 = meta(OcppVersion::V16);
        let reset_command = command(CommandType::Reset, json!({"type": "Soft"}));
        let dispatch = dispatcher.dispatch(&meta_v16, &reset_command);
        tokio::pin!(dispatch);

        // Drive the dispatch until the CALL hits the socket, then reply.
        let frame = tokio::select! {
            frame = sent_frame(&mut rx) => frame,
            _ = &mut dispatch => panic!("dispatch finished before sending"),
        };
        let OcppFrame::Call { unique_id, action, payload } = frame else {
            panic!("expected Call")
        };
        assert_eq!(action, "Reset");
        assert_eq!(payload, json!({"type": "Soft"}));
        tracker.handle_call_result("CP-7", &unique_id, json!({"status": "Accepted"}));

        match dispatch.await {
            DispatchOutcome::Accepted { status, .. } => assert_eq!(status, "Accepted"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            audit.fetch("c1").await.unwrap().state,
            AuditState::Accepted
        );
    }

    #[tokio::test]
    async fn timeout_without_reply() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(meta(OcppVersion::V16).clone(), tx);
        let (dispatcher, _tracker, audit) = self::dispatcher(registry);

        let outcome = dispatcher
            .dispatch(
                &meta(OcppVersion::V16),
                &command(CommandType::Reset, json!({"type": "Hard"})),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Timeout);
        assert_eq!(audit.fetch("c1").await.unwrap().state, AuditState::Timeout);
    }

    #[tokio::test]
    async fn unsupported_command_on_2x() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, _, _) = self::dispatcher(registry);
        let outcome = dispatcher
            .dispatch(
                &meta(OcppVersion::V201),
                &command(CommandType::ChangeConfiguration, json!({"key": "a", "value": "b"})),
            )
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Failed(DispatchFailure::UnsupportedCommand)
        );
    }

    #[tokio::test]
    async fn invalid_payload_fails_validation() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, _, _) = self::dispatcher(registry);
        let outcome = dispatcher
            .dispatch(
                &meta(OcppVersion::V16),
                &command(CommandType::Reset, json!({"type": "Gentle"})),
            )
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(DispatchFailure::PayloadValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn remote_stop_session_id_mapping() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, _, _) = self::dispatcher(registry.clone());

        // 2.x: sessionId becomes a string transactionId
        let normalized = dispatcher.normalize_payload(
            CommandType::RemoteStop,
            OcppVersion::V201,
            &json!({"sessionId": "TX-9"}),
        );
        assert_eq!(normalized, json!({"transactionId": "TX-9"}));

        let normalized = dispatcher.normalize_payload(
            CommandType::RemoteStop,
            OcppVersion::V21,
            &json!({"sessionId": 42}),
        );
        assert_eq!(normalized, json!({"transactionId": "42"}));

        // 1.6J: numeric strings become integers
        let normalized = dispatcher.normalize_payload(
            CommandType::RemoteStop,
            OcppVersion::V16,
            &json!({"sessionId": "42"}),
        );
        assert_eq!(normalized, json!({"transactionId": 42}));
    }

    #[tokio::test]
    async fn legacy_id_tag_wrapped_for_2x_remote_start() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, _, _) = self::dispatcher(registry);
        let normalized = dispatcher.normalize_payload(
            CommandType::RemoteStart,
            OcppVersion::V201,
            &json!({"idTag": "TAG-1"}),
        );
        assert_eq!(normalized["idToken"], json!({"idToken": "TAG-1", "type": "Central"}));
        assert!(normalized["remoteStartId"].is_i64());
        assert!(normalized.get("idTag").is_none());
    }

    #[tokio::test]
    async fn charger_rejection_propagates_status_verbatim() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(meta(OcppVersion::V201).clone(), tx);
        let (dispatcher, tracker, _) = self::dispatcher(registry);

        let meta_v201 = meta(OcppVersion::V201);
        let remote_stop_command = command(CommandType::RemoteStop, json!({"sessionId": "TX-9"}));
        let dispatch = dispatcher.dispatch(&meta_v201, &remote_stop_command);
        tokio::pin!(dispatch);

        let frame = tokio::select! {
            frame = sent_frame(&mut rx) => frame,
            _ = &mut dispatch => panic!("dispatch finished before sending"),
        };
        let OcppFrame::Call { unique_id, action, payload } = frame else {
            panic!("expected Call")
        };
        assert_eq!(action, "RequestStopTransaction");
        assert_eq!(payload["transactionId"], "TX-9");
        tracker.handle_call_result("CP-7", &unique_id, json!({"status": "Rejected"}));

        match dispatch.await {
            DispatchOutcome::Rejected { status, .. } => assert_eq!(status, "Rejected"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
