//! Outbound request tracker
//!
//! Every CALL the gateway sends registers here under its messageId. The
//! charger's CALLRESULT/CALLERROR resolves the pending entry; the
//! dispatcher's timeout or the socket closing rejects it. Replies with
//! unknown or already-resolved messageIds are silently dropped (the
//! charger may have answered after we gave up).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::OcppVersion;
use crate::schema::SchemaRegistry;

/// Terminal outcome of one tracked request
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedReply {
    /// CALLRESULT whose payload passed response-schema validation.
    Result(Value),
    /// CALLERROR from the charger.
    CallError {
        code: String,
        description: String,
        details: Value,
    },
    /// CALLRESULT whose payload failed response-schema validation.
    ResponseInvalid { errors: Vec<String> },
}

struct PendingRequest {
    charge_point_id: String,
    version: OcppVersion,
    action: String,
    reply_tx: oneshot::Sender<TrackedReply>,
    audit_command_id: Option<String>,
}

/// Pending-request table shared by dispatcher and engine
pub struct RequestTracker {
    pending: DashMap<String, PendingRequest>,
    schemas: Arc<SchemaRegistry>,
}

impl RequestTracker {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            pending: DashMap::new(),
            schemas,
        }
    }

    /// Register a pending request. The returned receiver resolves once,
    /// on reply; await it under your own deadline.
    pub fn register(
        &self,
        message_id: &str,
        charge_point_id: &str,
        version: OcppVersion,
        action: &str,
        audit_command_id: Option<String>,
    ) -> oneshot::Receiver<TrackedReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            message_id.to_string(),
            PendingRequest {
                charge_point_id: charge_point_id.to_string(),
                version,
                action: action.to_string(),
                reply_tx,
                audit_command_id,
            },
        );
        reply_rx
    }

    /// Await a registered reply. On deadline or closed channel the
    /// pending entry is cleared; the timer is dropped on every path.
    pub async fn await_reply(
        &self,
        message_id: &str,
        reply_rx: oneshot::Receiver<TrackedReply>,
        timeout: Duration,
    ) -> Option<TrackedReply> {
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(message_id);
                None
            }
        }
    }

    /// Resolve a pending request from an incoming CALLRESULT. The payload
    /// is validated against the response schema for (version, action)
    /// before the caller sees it.
    pub fn handle_call_result(&self, charge_point_id: &str, message_id: &str, payload: Value) {
        let Some((_, pending)) = self
            .pending
            .remove_if(message_id, |_, p| p.charge_point_id == charge_point_id)
        else {
            if self.pending.contains_key(message_id) {
                warn!(charge_point_id, message_id, "CallResult from wrong charge point, dropped");
            } else {
                debug!(charge_point_id, message_id, "CallResult for unknown request, dropped");
            }
            return;
        };

        let validation = self
            .schemas
            .validate_response(pending.version, &pending.action, &payload);
        let reply = if validation.is_valid() {
            TrackedReply::Result(payload)
        } else {
            TrackedReply::ResponseInvalid {
                errors: validation.errors().to_vec(),
            }
        };
        let _ = pending.reply_tx.send(reply);
    }

    /// Resolve a pending request from an incoming CALLERROR.
    pub fn handle_call_error(
        &self,
        charge_point_id: &str,
        message_id: &str,
        code: &str,
        description: &str,
        details: Value,
    ) {
        let Some((_, pending)) = self
            .pending
            .remove_if(message_id, |_, p| p.charge_point_id == charge_point_id)
        else {
            debug!(charge_point_id, message_id, "CallError for unknown request, dropped");
            return;
        };
        let _ = pending.reply_tx.send(TrackedReply::CallError {
            code: code.to_string(),
            description: description.to_string(),
            details,
        });
    }

    /// Drop one pending entry without resolving it (send failed before
    /// the charger could answer).
    pub fn discard(&self, message_id: &str) {
        self.pending.remove(message_id);
    }

    /// Fail everything pending for one connection (socket closed).
    pub fn abort_for_connection(&self, charge_point_id: &str) {
        self.pending.retain(|message_id, pending| {
            let keep = pending.charge_point_id != charge_point_id;
            if !keep {
                debug!(
                    charge_point_id,
                    message_id = message_id.as_str(),
                    action = pending.action.as_str(),
                    command_id = pending.audit_command_id.as_deref(),
                    "Dropping pending request on disconnect"
                );
            }
            keep
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
