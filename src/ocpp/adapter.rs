//! Version-adapter seam
//!
//! One adapter per OCPP version maps incoming actions to responses and
//! domain events. Dispatch across versions is by tag via [`AdapterSet`];
//! dispatch inside a version is by action name.

use serde_json::{json, Value};

use crate::domain::OcppVersion;

use super::state::{StateViolation, StateStore, ViolationKind};
use super::v16::V16Adapter;
use super::v201::V201Adapter;
use super::v21::V21Adapter;

/// Context handed to adapters for one call
#[derive(Debug, Clone)]
pub struct CallContext<'a> {
    pub charge_point_id: &'a str,
    pub version: OcppVersion,
}

/// Body of a CallError reply
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorBody {
    pub code: String,
    pub description: String,
    pub details: Value,
}

impl CallErrorBody {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new("NotImplemented", format!("Action '{}' is not supported", action))
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new("InternalError", description)
    }

    /// Spell a state violation for the wire, honoring the 1.6J
    /// `FormationViolation` spelling.
    pub fn from_violation(version: OcppVersion, violation: StateViolation) -> Self {
        let code = match violation.kind {
            ViolationKind::OccurrenceConstraint => "OccurrenceConstraintViolation",
            ViolationKind::Format => version.format_violation_code(),
        };
        Self::new(code, violation.description)
    }

    /// Malformed-payload error in the version's spelling.
    pub fn format_violation(version: OcppVersion, description: impl Into<String>) -> Self {
        Self::new(version.format_violation_code(), description)
    }
}

/// A domain event produced while handling a call
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub event_type: &'static str,
    pub connector_id: Option<u64>,
    pub payload: Value,
}

impl EmittedEvent {
    pub fn new(event_type: &'static str, payload: Value) -> Self {
        Self {
            event_type,
            connector_id: None,
            payload,
        }
    }

    pub fn on_connector(mut self, connector_id: Option<u64>) -> Self {
        self.connector_id = connector_id;
        self
    }
}

/// Result of handling one call
#[derive(Debug, Clone)]
pub struct HandleOutcome {
    pub response: Result<Value, CallErrorBody>,
    pub events: Vec<EmittedEvent>,
}

impl HandleOutcome {
    pub fn reply(payload: Value) -> Self {
        Self {
            response: Ok(payload),
            events: Vec::new(),
        }
    }

    pub fn error(body: CallErrorBody) -> Self {
        Self {
            response: Err(body),
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: EmittedEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Per-version call handling
pub trait VersionAdapter: Send + Sync {
    fn version(&self) -> OcppVersion;

    fn handle_call(
        &self,
        action: &str,
        payload: &Value,
        ctx: &CallContext<'_>,
        state: &StateStore,
    ) -> HandleOutcome;
}

/// The three adapters, selected by version tag
pub struct AdapterSet {
    v16: V16Adapter,
    v201: V201Adapter,
    v21: V21Adapter,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self {
            v16: V16Adapter::new(),
            v201: V201Adapter::new(),
            v21: V21Adapter::new(),
        }
    }

    pub fn for_version(&self, version: OcppVersion) -> &dyn VersionAdapter {
        match version {
            OcppVersion::V16 => &self.v16,
            OcppVersion::V201 => &self.v201,
            OcppVersion::V21 => &self.v21,
        }
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::new()
    }
}

// ── Shared payload accessors ───────────────────────────────────
//
// Schema validation runs before any adapter, so these only fail on
// engine bugs; adapters still surface a FormatViolation rather than
// panicking.

pub(crate) fn str_field<'v>(payload: &'v Value, field: &str) -> Option<&'v str> {
    payload.get(field).and_then(Value::as_str)
}

pub(crate) fn u64_field(payload: &Value, field: &str) -> Option<u64> {
    payload.get(field).and_then(Value::as_u64)
}

pub(crate) fn i64_field(payload: &Value, field: &str) -> Option<i64> {
    payload.get(field).and_then(Value::as_i64)
}

/// Current time in the RFC 3339 form used on the wire.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// `{status: Accepted}` and friends
pub(crate) fn accepted_status() -> Value {
    json!({"status": "Accepted"})
}
