//! The message engine
//!
//! One entry point per inbound frame. CALLs flow response-cache →
//! rate limiter → request-schema validation → version adapter →
//! response-schema validation → cache store; CALLRESULT/CALLERROR
//! resolve the outbound request tracker.
//!
//! Every OCPP-visible reply leaving here is structurally valid; bugs
//! (missing or failing response schemas) surface as `InternalError`
//! rather than being swallowed.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::commands::RequestTracker;
use crate::domain::ConnectionMeta;
use crate::events::EventPublisher;
use crate::infrastructure::{RateDecision, RateLimiter};
use crate::schema::SchemaRegistry;
use crate::support::ocpp_frame::{call_error, call_result, OcppFrame};

use super::adapter::{AdapterSet, CallContext};
use super::response_cache::ResponseCache;
use super::state::StateStore;

/// Inbound message engine shared by all connections
pub struct MessageEngine {
    schemas: Arc<SchemaRegistry>,
    adapters: AdapterSet,
    state: Arc<StateStore>,
    cache: ResponseCache,
    rate_limiter: RateLimiter,
    publisher: Arc<EventPublisher>,
    tracker: Arc<RequestTracker>,
}

impl MessageEngine {
    pub fn new(
        schemas: Arc<SchemaRegistry>,
        state: Arc<StateStore>,
        cache: ResponseCache,
        rate_limiter: RateLimiter,
        publisher: Arc<EventPublisher>,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            schemas,
            adapters: AdapterSet::new(),
            state,
            cache,
            rate_limiter,
            publisher,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// Handle one inbound text frame; returns the JSON to write back, if
    /// any.
    pub async fn handle_text(&self, meta: &ConnectionMeta, text: &str) -> Option<String> {
        let frame = match OcppFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) if e.is_answerable_call() => {
                let unique_id = e.unique_id.as_deref().unwrap_or_default();
                debug!(
                    charge_point_id = meta.charge_point_id.as_str(),
                    reason = e.reason.as_str(),
                    "Malformed Call answered with CallError"
                );
                return Some(call_error(
                    unique_id,
                    meta.ocpp_version.format_violation_code(),
                    "Malformed message",
                    json!({"reason": e.reason}),
                ));
            }
            Err(e) => {
                // Not a Call, or no usable id: dropped silently.
                debug!(
                    charge_point_id = meta.charge_point_id.as_str(),
                    reason = e.reason.as_str(),
                    "Unparseable frame dropped"
                );
                return None;
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => Some(self.handle_call(meta, &unique_id, &action, payload).await),
            OcppFrame::CallResult { unique_id, payload } => {
                self.tracker
                    .handle_call_result(&meta.charge_point_id, &unique_id, payload);
                None
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => {
                self.tracker.handle_call_error(
                    &meta.charge_point_id,
                    &unique_id,
                    &error_code,
                    &error_description,
                    error_details,
                );
                None
            }
        }
    }

    async fn handle_call(
        &self,
        meta: &ConnectionMeta,
        unique_id: &str,
        action: &str,
        payload: Value,
    ) -> String {
        let charge_point_id = meta.charge_point_id.as_str();

        // Replays get the previously-emitted bytes, before any validation.
        if let Some(cached) = self.cache.get(charge_point_id, unique_id).await {
            debug!(charge_point_id, message_id = unique_id, "Response cache hit");
            return cached;
        }

        let reply = match self.rate_limiter.check(action, charge_point_id).await {
            Ok(RateDecision::Allowed) => None,
            Ok(decision @ RateDecision::Limited { .. }) => {
                warn!(charge_point_id, action, "Rate limit exceeded");
                Some(call_error(
                    unique_id,
                    "OccurrenceConstraintViolation",
                    "Rate limit exceeded",
                    decision.error_details(),
                ))
            }
            Err(e) => {
                // A degraded store never blocks traffic.
                warn!(charge_point_id, action, error = %e, "Rate limiter unavailable, allowing");
                None
            }
        };
        if let Some(reply) = reply {
            self.cache.store(charge_point_id, unique_id, &reply).await;
            return reply;
        }

        let reply = self.process_call(meta, unique_id, action, &payload).await;
        self.cache.store(charge_point_id, unique_id, &reply).await;
        reply
    }

    async fn process_call(
        &self,
        meta: &ConnectionMeta,
        unique_id: &str,
        action: &str,
        payload: &Value,
    ) -> String {
        let version = meta.ocpp_version;

        if !self.schemas.has_request_schema(version, action) {
            return call_error(
                unique_id,
                "NotImplemented",
                &format!("Action '{}' is not supported", action),
                json!({}),
            );
        }

        let validation = self.schemas.validate_request(version, action, payload);
        if !validation.is_valid() {
            return call_error(
                unique_id,
                version.format_violation_code(),
                "Payload validation failed",
                json!({"errors": validation.errors()}),
            );
        }

        let ctx = CallContext {
            charge_point_id: &meta.charge_point_id,
            version,
        };
        let outcome = self
            .adapters
            .for_version(version)
            .handle_call(action, payload, &ctx, &self.state);

        for event in outcome.events {
            self.publisher.publish_station(meta, event).await;
        }

        match outcome.response {
            Ok(response) => {
                if !self.schemas.has_response_schema(version, action) {
                    error!(
                        charge_point_id = meta.charge_point_id.as_str(),
                        action, "No response schema registered"
                    );
                    return call_error(
                        unique_id,
                        "InternalError",
                        "Missing response schema",
                        json!({"action": action}),
                    );
                }
                let validation = self.schemas.validate_response(version, action, &response);
                if !validation.is_valid() {
                    error!(
                        charge_point_id = meta.charge_point_id.as_str(),
                        action,
                        errors = ?validation.errors(),
                        "Produced response failed schema validation"
                    );
                    return call_error(
                        unique_id,
                        "InternalError",
                        "Response validation failed",
                        json!({"errors": validation.errors()}),
                    );
                }
                call_result(unique_id, response)
            }
            Err(body) => call_error(unique_id, &body.code, &body.description, body.details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppVersion;
    use crate::infrastructure::{
        CircuitBreaker, CircuitBreakerConfig, InMemoryEventBus, InMemoryKvStore, KeyValueStore,
        RateLimitSettings,
    };

    fn engine_with(kv: Arc<dyn KeyValueStore>, settings: RateLimitSettings) -> MessageEngine {
        let schemas = Arc::new(
            SchemaRegistry::load(&["DataTransfer".to_string()].into_iter().collect()).unwrap(),
        );
        let publisher = Arc::new(EventPublisher::new(
            Arc::new(InMemoryEventBus::new()),
            Arc::new(CircuitBreaker::new("bus", CircuitBreakerConfig::default())),
            "node-test",
        ));
        MessageEngine::new(
            schemas.clone(),
            Arc::new(StateStore::new(false)),
            ResponseCache::new(300, None),
            RateLimiter::new(kv, settings),
            publisher,
            Arc::new(RequestTracker::new(schemas)),
        )
    }

    fn engine() -> MessageEngine {
        engine_with(Arc::new(InMemoryKvStore::new()), RateLimitSettings::default())
    }

    fn meta(version: OcppVersion) -> ConnectionMeta {
        ConnectionMeta {
            connection_id: "conn-1".into(),
            charge_point_id: "CP-1".into(),
            ocpp_version: version,
            station_id: "ST-1".into(),
            tenant_id: "T-1".into(),
            session_epoch: 1,
            ip: "10.0.0.1".into(),
        }
    }

    fn parse_reply(reply: &str) -> Vec<Value> {
        serde_json::from_str(reply).unwrap()
    }

    #[tokio::test]
    async fn v16_happy_path() {
        let engine = engine();
        let meta = meta(OcppVersion::V16);

        let reply = engine
            .handle_text(
                &meta,
                r#"[2,"1","BootNotification",{"chargePointVendor":"E","chargePointModel":"M"}]"#,
            )
            .await
            .unwrap();
        let arr = parse_reply(&reply);
        assert_eq!(arr[0], 3);
        assert_eq!(arr[1], "1");
        assert_eq!(arr[2]["status"], "Accepted");
        assert_eq!(arr[2]["interval"], 300);

        let reply = engine.handle_text(&meta, r#"[2,"2","Heartbeat",{}]"#).await.unwrap();
        let arr = parse_reply(&reply);
        assert!(arr[2]["currentTime"].is_string());

        let reply = engine
            .handle_text(
                &meta,
                r#"[2,"3","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Available"}]"#,
            )
            .await
            .unwrap();
        assert_eq!(parse_reply(&reply)[2], json!({}));
    }

    #[tokio::test]
    async fn v16_missing_field_answers_formation_violation() {
        let engine = engine();
        let reply = engine
            .handle_text(
                &meta(OcppVersion::V16),
                r#"[2,"7","BootNotification",{"chargePointVendor":"E"}]"#,
            )
            .await
            .unwrap();
        let arr = parse_reply(&reply);
        assert_eq!(arr[0], 4);
        assert_eq!(arr[1], "7");
        assert_eq!(arr[2], "FormationViolation");
        assert_eq!(arr[3], "Payload validation failed");
        let errors = arr[4]["errors"].as_array().unwrap();
        assert!(errors[0].as_str().unwrap().contains("chargePointModel"));
    }

    #[tokio::test]
    async fn start_transaction_replay_reuses_transaction_id() {
        let engine = engine();
        let meta = meta(OcppVersion::V16);
        let call = r#"[2,"10","StartTransaction",{"connectorId":1,"idTag":"T","meterStart":100,"timestamp":"2024-01-01T00:00:00Z"}]"#;

        let first = engine.handle_text(&meta, call).await.unwrap();
        // same messageId: cache serves identical bytes
        let second = engine.handle_text(&meta, call).await.unwrap();
        assert_eq!(first, second);

        // fresh messageId, identical payload: state store answers idempotently
        let call2 = call.replace("\"10\"", "\"11\"");
        let third = engine.handle_text(&meta, &call2).await.unwrap();
        assert_eq!(
            parse_reply(&first)[2]["transactionId"],
            parse_reply(&third)[2]["transactionId"]
        );
    }

    #[tokio::test]
    async fn v2x_unknown_transaction_update() {
        let engine = engine();
        let reply = engine
            .handle_text(
                &meta(OcppVersion::V201),
                r#"[2,"20","TransactionEvent",{"eventType":"Updated","timestamp":"2024-01-01T00:00:00Z","triggerReason":"Trigger","seqNo":1,"transactionInfo":{"transactionId":"TX-X"}}]"#,
            )
            .await
            .unwrap();
        let arr = parse_reply(&reply);
        assert_eq!(arr[0], 4);
        assert_eq!(arr[2], "OccurrenceConstraintViolation");
        assert_eq!(arr[3], "Unknown transaction");
    }

    #[tokio::test]
    async fn unknown_action_not_implemented() {
        let engine = engine();
        let reply = engine
            .handle_text(&meta(OcppVersion::V16), r#"[2,"5","MadeUp",{}]"#)
            .await
            .unwrap();
        assert_eq!(parse_reply(&reply)[2], "NotImplemented");
    }

    #[tokio::test]
    async fn malformed_call_with_id_answered_malformed_other_dropped() {
        let engine = engine();
        let meta16 = meta(OcppVersion::V16);

        let reply = engine.handle_text(&meta16, r#"[2,"m9",42,{}]"#).await.unwrap();
        let arr = parse_reply(&reply);
        assert_eq!(arr[0], 4);
        assert_eq!(arr[1], "m9");
        assert_eq!(arr[2], "FormationViolation");

        assert!(engine.handle_text(&meta16, "not json").await.is_none());
        assert!(engine.handle_text(&meta16, r#"[3,"",{}]"#).await.is_none());
    }

    #[tokio::test]
    async fn rate_limited_call_answers_occurrence_constraint() {
        let settings = RateLimitSettings {
            per_charger_limit: 1,
            ..Default::default()
        };
        let engine = engine_with(Arc::new(InMemoryKvStore::new()), settings);
        let meta = meta(OcppVersion::V16);

        let ok = engine
            .handle_text(&meta, r#"[2,"1","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Available"}]"#)
            .await
            .unwrap();
        assert_eq!(parse_reply(&ok)[0], 3);

        let limited = engine
            .handle_text(&meta, r#"[2,"2","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Available"}]"#)
            .await
            .unwrap();
        let arr = parse_reply(&limited);
        assert_eq!(arr[2], "OccurrenceConstraintViolation");
        assert_eq!(arr[3], "Rate limit exceeded");
        assert_eq!(arr[4]["scope"], "cp:CP-1");
    }

    #[tokio::test]
    async fn call_result_resolves_tracker() {
        let engine = engine();
        let meta = meta(OcppVersion::V16);
        let rx = engine
            .tracker()
            .register("out-1", "CP-1", OcppVersion::V16, "Reset", None);

        assert!(engine
            .handle_text(&meta, r#"[3,"out-1",{"status":"Accepted"}]"#)
            .await
            .is_none());
        let reply = engine
            .tracker()
            .await_reply("out-1", rx, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, crate::commands::TrackedReply::Result(json!({"status":"Accepted"})));
    }
}
