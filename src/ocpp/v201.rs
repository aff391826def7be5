//! OCPP 2.x adapter core and the 2.0.1 adapter
//!
//! 2.0.1 and 2.1 share call semantics; [`V2xCore`] carries the shared
//! handling, parameterized only by the version tag it answers for.

use serde_json::{json, Value};

use crate::domain::OcppVersion;

use super::adapter::{
    accepted_status, now_iso, str_field, u64_field, CallContext, CallErrorBody, EmittedEvent,
    HandleOutcome, VersionAdapter,
};
use super::state::{StateStore, TxEventRequest, TxEventType};

const BOOT_INTERVAL_SECONDS: i64 = 300;

/// Shared 2.x call handling
pub(crate) struct V2xCore {
    version: OcppVersion,
}

impl V2xCore {
    pub(crate) fn new(version: OcppVersion) -> Self {
        Self { version }
    }

    fn missing(&self, field: &str) -> CallErrorBody {
        CallErrorBody::format_violation(self.version, format!("Missing {}", field))
    }

    fn handle_status_notification(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        let Some(evse_id) = u64_field(payload, "evseId") else {
            return HandleOutcome::error(self.missing("evseId"));
        };
        let Some(status) = str_field(payload, "connectorStatus") else {
            return HandleOutcome::error(self.missing("connectorStatus"));
        };
        let connector_id = u64_field(payload, "connectorId");
        let slot = connector_id.unwrap_or(evse_id);
        let previous = state.record_connector_status(ctx.charge_point_id, slot, status, None);

        HandleOutcome::reply(json!({})).with_event(
            EmittedEvent::new(
                "ConnectorStatusChanged",
                json!({
                    "evseId": evse_id,
                    "connectorId": connector_id,
                    "status": status,
                    "previousStatus": previous,
                }),
            )
            .on_connector(connector_id.or(Some(evse_id))),
        )
    }

    fn handle_transaction_event(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        let event_type = match str_field(payload, "eventType") {
            Some("Started") => TxEventType::Started,
            Some("Updated") => TxEventType::Updated,
            Some("Ended") => TxEventType::Ended,
            _ => return HandleOutcome::error(self.missing("eventType")),
        };
        let Some(seq_no) = u64_field(payload, "seqNo") else {
            return HandleOutcome::error(self.missing("seqNo"));
        };
        let Some(transaction_id) = payload
            .get("transactionInfo")
            .and_then(|t| t.get("transactionId"))
            .and_then(Value::as_str)
        else {
            return HandleOutcome::error(CallErrorBody::format_violation(
                self.version,
                "Missing transactionId",
            ));
        };
        let evse_id = payload.get("evse").and_then(|e| u64_field(e, "id"));
        let connector_id = payload.get("evse").and_then(|e| u64_field(e, "connectorId"));
        let id_token = payload
            .get("idToken")
            .and_then(|t| str_field(t, "idToken"))
            .map(str::to_string);
        let timestamp = str_field(payload, "timestamp").unwrap_or_default().to_string();

        let request = TxEventRequest {
            event_type,
            seq_no,
            transaction_id: transaction_id.to_string(),
            evse_id,
            connector_id,
            id_token: id_token.clone(),
            timestamp,
        };
        match state.transaction_event(ctx.charge_point_id, request) {
            Ok(outcome) => {
                let reply = if id_token.is_some() {
                    json!({"idTokenInfo": {"status": "Accepted"}})
                } else {
                    json!({})
                };
                let out = HandleOutcome::reply(reply);
                if outcome.idempotent {
                    out
                } else {
                    out.with_event(
                        EmittedEvent::new(
                            "TransactionEventReceived",
                            json!({
                                "eventType": str_field(payload, "eventType"),
                                "seqNo": seq_no,
                                "transactionId": transaction_id,
                                "triggerReason": str_field(payload, "triggerReason"),
                            }),
                        )
                        .on_connector(connector_id.or(evse_id)),
                    )
                }
            }
            Err(v) => HandleOutcome::error(CallErrorBody::from_violation(self.version, v)),
        }
    }

    pub(crate) fn handle_call(
        &self,
        action: &str,
        payload: &Value,
        ctx: &CallContext<'_>,
        state: &StateStore,
    ) -> HandleOutcome {
        match action {
            "BootNotification" => {
                state.record_boot(ctx.charge_point_id);
                HandleOutcome::reply(json!({
                    "currentTime": now_iso(),
                    "interval": BOOT_INTERVAL_SECONDS,
                    "status": "Accepted",
                }))
                .with_event(EmittedEvent::new("BootNotificationReceived", payload.clone()))
            }
            "Heartbeat" => {
                state.record_heartbeat(ctx.charge_point_id);
                HandleOutcome::reply(json!({"currentTime": now_iso()}))
            }
            "StatusNotification" => self.handle_status_notification(payload, state, ctx),
            "Authorize" => HandleOutcome::reply(json!({"idTokenInfo": {"status": "Accepted"}})),
            "DataTransfer" => HandleOutcome::reply(accepted_status())
                .with_event(EmittedEvent::new("DataTransferReceived", payload.clone())),
            "TransactionEvent" => self.handle_transaction_event(payload, state, ctx),
            "MeterValues" => HandleOutcome::reply(json!({})).with_event(
                EmittedEvent::new("MeterValuesReceived", payload.clone())
                    .on_connector(u64_field(payload, "evseId")),
            ),
            "SecurityEventNotification" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("SecurityEventReceived", payload.clone())),
            "FirmwareStatusNotification" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("FirmwareStatusReceived", payload.clone())),
            "LogStatusNotification" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("LogStatusReceived", payload.clone())),
            "NotifyEvent" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("NotifyEventReceived", payload.clone())),
            _ => HandleOutcome::error(CallErrorBody::not_implemented(action)),
        }
    }
}

/// OCPP 2.0.1 adapter
pub struct V201Adapter {
    core: V2xCore,
}

impl V201Adapter {
    pub fn new() -> Self {
        Self {
            core: V2xCore::new(OcppVersion::V201),
        }
    }
}

impl VersionAdapter for V201Adapter {
    fn version(&self) -> OcppVersion {
        OcppVersion::V201
    }

    fn handle_call(
        &self,
        action: &str,
        payload: &Value,
        ctx: &CallContext<'_>,
        state: &StateStore,
    ) -> HandleOutcome {
        self.core.handle_call(action, payload, ctx, state)
    }
}
