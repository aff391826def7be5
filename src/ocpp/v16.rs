//! OCPP 1.6J adapter

use serde_json::{json, Value};

use crate::domain::OcppVersion;

use super::adapter::{
    accepted_status, i64_field, now_iso, str_field, u64_field, CallContext, CallErrorBody,
    EmittedEvent, HandleOutcome, VersionAdapter,
};
use super::state::{StartTxRequest, StateStore, StopTxRequest};

/// Heartbeat interval handed to chargers in BootNotification responses.
const BOOT_INTERVAL_SECONDS: i64 = 300;

pub struct V16Adapter;

impl V16Adapter {
    pub fn new() -> Self {
        Self
    }

    fn missing(field: &str) -> CallErrorBody {
        CallErrorBody::format_violation(OcppVersion::V16, format!("Missing {}", field))
    }

    fn handle_boot_notification(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        state.record_boot(ctx.charge_point_id);
        HandleOutcome::reply(json!({
            "status": "Accepted",
            "currentTime": now_iso(),
            "interval": BOOT_INTERVAL_SECONDS,
        }))
        .with_event(EmittedEvent::new("BootNotificationReceived", payload.clone()))
    }

    fn handle_status_notification(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        let Some(connector_id) = u64_field(payload, "connectorId") else {
            return HandleOutcome::error(Self::missing("connectorId"));
        };
        let Some(status) = str_field(payload, "status") else {
            return HandleOutcome::error(Self::missing("status"));
        };
        let error_code = str_field(payload, "errorCode");
        let previous = state.record_connector_status(ctx.charge_point_id, connector_id, status, error_code);

        HandleOutcome::reply(json!({})).with_event(
            EmittedEvent::new(
                "ConnectorStatusChanged",
                json!({
                    "connectorId": connector_id,
                    "status": status,
                    "errorCode": error_code,
                    "previousStatus": previous,
                }),
            )
            .on_connector(Some(connector_id)),
        )
    }

    fn handle_start_transaction(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        let Some(connector_id) = u64_field(payload, "connectorId") else {
            return HandleOutcome::error(Self::missing("connectorId"));
        };
        let Some(id_tag) = str_field(payload, "idTag") else {
            return HandleOutcome::error(Self::missing("idTag"));
        };
        let Some(meter_start) = i64_field(payload, "meterStart") else {
            return HandleOutcome::error(Self::missing("meterStart"));
        };
        let Some(timestamp) = str_field(payload, "timestamp") else {
            return HandleOutcome::error(Self::missing("timestamp"));
        };

        let request = StartTxRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start,
            timestamp: timestamp.to_string(),
        };
        match state.start_transaction(ctx.charge_point_id, request) {
            Ok(outcome) => {
                let reply = HandleOutcome::reply(json!({
                    "transactionId": outcome.transaction_id,
                    "idTagInfo": {"status": "Accepted"},
                }));
                if outcome.idempotent {
                    reply
                } else {
                    reply.with_event(
                        EmittedEvent::new(
                            "TransactionStarted",
                            json!({
                                "transactionId": outcome.transaction_id,
                                "connectorId": connector_id,
                                "idTag": id_tag,
                                "meterStart": meter_start,
                                "timestamp": timestamp,
                            }),
                        )
                        .on_connector(Some(connector_id)),
                    )
                }
            }
            Err(v) => HandleOutcome::error(CallErrorBody::from_violation(OcppVersion::V16, v)),
        }
    }

    fn handle_stop_transaction(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        let Some(transaction_id) = i64_field(payload, "transactionId") else {
            return HandleOutcome::error(Self::missing("transactionId"));
        };
        let Some(meter_stop) = i64_field(payload, "meterStop") else {
            return HandleOutcome::error(Self::missing("meterStop"));
        };
        let Some(timestamp) = str_field(payload, "timestamp") else {
            return HandleOutcome::error(Self::missing("timestamp"));
        };

        let request = StopTxRequest {
            transaction_id,
            meter_stop,
            timestamp: timestamp.to_string(),
        };
        match state.stop_transaction(ctx.charge_point_id, request) {
            Ok(outcome) => {
                let reply = HandleOutcome::reply(json!({"idTagInfo": {"status": "Accepted"}}));
                if outcome.idempotent {
                    reply
                } else {
                    reply.with_event(EmittedEvent::new(
                        "TransactionStopped",
                        json!({
                            "transactionId": transaction_id,
                            "meterStop": meter_stop,
                            "timestamp": timestamp,
                            "reason": str_field(payload, "reason"),
                        }),
                    ))
                }
            }
            Err(v) => HandleOutcome::error(CallErrorBody::from_violation(OcppVersion::V16, v)),
        }
    }

    fn handle_meter_values(&self, payload: &Value, state: &StateStore, ctx: &CallContext<'_>) -> HandleOutcome {
        let transaction_id = i64_field(payload, "transactionId");
        match state.meter_values(ctx.charge_point_id, transaction_id) {
            Ok(outcome) => {
                let mut event_payload = payload.clone();
                if outcome.orphaned {
                    if let Some(map) = event_payload.as_object_mut() {
                        map.insert("orphaned".to_string(), Value::Bool(true));
                    }
                }
                HandleOutcome::reply(json!({})).with_event(
                    EmittedEvent::new("MeterValuesReceived", event_payload)
                        .on_connector(u64_field(payload, "connectorId")),
                )
            }
            Err(v) => HandleOutcome::error(CallErrorBody::from_violation(OcppVersion::V16, v)),
        }
    }
}

impl VersionAdapter for V16Adapter {
    fn version(&self) -> OcppVersion {
        OcppVersion::V16
    }

    fn handle_call(
        &self,
        action: &str,
        payload: &Value,
        ctx: &CallContext<'_>,
        state: &StateStore,
    ) -> HandleOutcome {
        match action {
            "BootNotification" => self.handle_boot_notification(payload, state, ctx),
            "Heartbeat" => {
                state.record_heartbeat(ctx.charge_point_id);
                HandleOutcome::reply(json!({"currentTime": now_iso()}))
            }
            "StatusNotification" => self.handle_status_notification(payload, state, ctx),
            "Authorize" => HandleOutcome::reply(json!({"idTagInfo": {"status": "Accepted"}})),
            "DataTransfer" => HandleOutcome::reply(accepted_status())
                .with_event(EmittedEvent::new("DataTransferReceived", payload.clone())),
            "StartTransaction" => self.handle_start_transaction(payload, state, ctx),
            "StopTransaction" => self.handle_stop_transaction(payload, state, ctx),
            "MeterValues" => self.handle_meter_values(payload, state, ctx),
            "DiagnosticsStatusNotification" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("DiagnosticsStatusReceived", payload.clone())),
            "FirmwareStatusNotification" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("FirmwareStatusReceived", payload.clone())),
            "SecurityEventNotification" => HandleOutcome::reply(json!({}))
                .with_event(EmittedEvent::new("SecurityEventReceived", payload.clone())),
            _ => HandleOutcome::error(CallErrorBody::not_implemented(action)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> CallContext<'a> {
        CallContext {
            charge_point_id: "CP-1",
            version: OcppVersion::V16,
        }
    }

    fn handle(state: &StateStore, action: &str, payload: Value) -> HandleOutcome {
        V16Adapter::new().handle_call(action, &payload, &ctx(), state)
    }

    #[test]
    fn boot_notification_accepted_with_interval() {
        let state = StateStore::new(false);
        let out = handle(
            &state,
            "BootNotification",
            json!({"chargePointVendor": "E", "chargePointModel": "M"}),
        );
        let reply = out.response.unwrap();
        assert_eq!(reply["status"], "Accepted");
        assert_eq!(reply["interval"], 300);
        assert!(reply["currentTime"].is_string());
    }

    #[test]
    fn status_notification_updates_state_and_emits() {
        let state = StateStore::new(false);
        let out = handle(
            &state,
            "StatusNotification",
            json!({"connectorId": 1, "errorCode": "NoError", "status": "Available"}),
        );
        assert_eq!(out.response.unwrap(), json!({}));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, "ConnectorStatusChanged");
        assert_eq!(state.connector_status("CP-1", 1).unwrap().status, "Available");
    }

    #[test]
    fn start_transaction_idempotent_replay_suppresses_event() {
        let state = StateStore::new(false);
        let payload = json!({
            "connectorId": 1, "idTag": "T", "meterStart": 100,
            "timestamp": "2024-01-01T00:00:00Z"
        });
        let first = handle(&state, "StartTransaction", payload.clone());
        let tx = first.response.as_ref().unwrap()["transactionId"].clone();
        assert_eq!(first.events.len(), 1);

        let second = handle(&state, "StartTransaction", payload);
        assert_eq!(second.response.unwrap()["transactionId"], tx);
        assert!(second.events.is_empty());
    }

    #[test]
    fn conflicting_start_maps_to_occurrence_constraint() {
        let state = StateStore::new(false);
        handle(
            &state,
            "StartTransaction",
            json!({"connectorId": 1, "idTag": "T", "meterStart": 100, "timestamp": "2024-01-01T00:00:00Z"}),
        );
        let out = handle(
            &state,
            "StartTransaction",
            json!({"connectorId": 1, "idTag": "OTHER", "meterStart": 0, "timestamp": "2024-01-01T00:05:00Z"}),
        );
        let err = out.response.unwrap_err();
        assert_eq!(err.code, "OccurrenceConstraintViolation");
    }

    #[test]
    fn meter_values_orphaned_flag_in_lenient_mode() {
        let state = StateStore::new(true);
        let out = handle(
            &state,
            "MeterValues",
            json!({"connectorId": 1, "transactionId": 42, "meterValue": []}),
        );
        assert_eq!(out.response.unwrap(), json!({}));
        assert_eq!(out.events[0].payload["orphaned"], true);
    }

    #[test]
    fn unknown_action_not_implemented() {
        let state = StateStore::new(false);
        let out = handle(&state, "FancyNewAction", json!({}));
        assert_eq!(out.response.unwrap_err().code, "NotImplemented");
    }
}
