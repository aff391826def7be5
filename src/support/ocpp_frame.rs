//! OCPP-J message framing
//!
//! Implements the OCPP-J (JSON over WebSocket) transport envelope. The
//! framing is **identical** across all OCPP versions (1.6J, 2.0.1, 2.1):
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", <payload>]`
//! - **CallResult** `[3, "<uniqueId>", <payload>]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! On a malformed Call the parser keeps whatever `uniqueId` it could
//! extract so the engine can still answer with a CallError referencing it.

use serde_json::Value;
use std::fmt;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult {
        unique_id: String,
        payload: Value,
    },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse a raw JSON text into an `OcppFrame`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| FrameError::new(format!("invalid JSON: {}", e)))?;

        if arr.is_empty() {
            return Err(FrameError::new("empty message array"));
        }

        let msg_type = arr[0]
            .as_u64()
            .ok_or_else(|| FrameError::new("messageTypeId is not a number"))?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(&arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(&arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(&arr),
            other => Err(FrameError::new(format!("unknown messageTypeId: {}", other))
                .with_message_type(other)),
        }
    }

    fn parse_call(arr: &[Value]) -> Result<Self, FrameError> {
        // Salvage the uniqueId before any structural check so a malformed
        // Call can still be answered with a CallError.
        let salvaged = arr.get(1).and_then(Value::as_str).filter(|s| !s.is_empty());

        let fail = |reason: &str| {
            let mut err = FrameError::new(reason).with_message_type(MSG_TYPE_CALL);
            if let Some(id) = salvaged {
                err = err.with_unique_id(id);
            }
            err
        };

        if arr.len() < 4 {
            return Err(fail("Call frame must have 4 elements"));
        }
        let unique_id = match salvaged {
            Some(id) => id.to_string(),
            None => return Err(fail("uniqueId must be a non-empty string")),
        };
        let action = match arr[2].as_str() {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => return Err(fail("action must be a non-empty string")),
        };

        Ok(Self::Call {
            unique_id,
            action,
            payload: arr[3].clone(),
        })
    }

    fn parse_call_result(arr: &[Value]) -> Result<Self, FrameError> {
        if arr.len() < 3 {
            return Err(
                FrameError::new("CallResult frame must have 3 elements")
                    .with_message_type(MSG_TYPE_CALL_RESULT),
            );
        }
        let unique_id = arr[1]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                FrameError::new("uniqueId must be a non-empty string")
                    .with_message_type(MSG_TYPE_CALL_RESULT)
            })?
            .to_string();

        Ok(Self::CallResult {
            unique_id,
            payload: arr[2].clone(),
        })
    }

    fn parse_call_error(arr: &[Value]) -> Result<Self, FrameError> {
        let fail = |reason: &str| FrameError::new(reason).with_message_type(MSG_TYPE_CALL_ERROR);

        if arr.len() < 5 {
            return Err(fail("CallError frame must have 5 elements"));
        }
        let unique_id = arr[1]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| fail("uniqueId must be a non-empty string"))?
            .to_string();
        let error_code = arr[2]
            .as_str()
            .ok_or_else(|| fail("errorCode must be a string"))?
            .to_string();
        let error_description = arr[3]
            .as_str()
            .ok_or_else(|| fail("errorDescription must be a string"))?
            .to_string();
        if !arr[4].is_object() {
            return Err(fail("errorDetails must be a JSON object"));
        }

        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details: arr[4].clone(),
        })
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to a JSON string.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        // serde_json::to_string on a Value never fails
        serde_json::to_string(&arr).unwrap_or_default()
    }

    // ── Helpers ────────────────────────────────────────────

    /// Get the unique message ID.
    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Returns `true` if this is a `Call` frame.
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

/// Emit a CallResult frame as wire JSON.
pub fn call_result(unique_id: &str, payload: Value) -> String {
    OcppFrame::CallResult {
        unique_id: unique_id.to_string(),
        payload,
    }
    .serialize()
}

/// Emit a CallError frame as wire JSON.
pub fn call_error(unique_id: &str, code: &str, description: &str, details: Value) -> String {
    let details = if details.is_object() {
        details
    } else {
        Value::Object(Default::default())
    };
    OcppFrame::CallError {
        unique_id: unique_id.to_string(),
        error_code: code.to_string(),
        error_description: description.to_string(),
        error_details: details,
    }
    .serialize()
}

// ── Errors ─────────────────────────────────────────────────────

/// A frame that could not be parsed.
///
/// `unique_id` is populated when the frame was a Call whose id could be
/// salvaged; `message_type_id` when the type tag itself was readable.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub reason: String,
    pub message_type_id: Option<u64>,
    pub unique_id: Option<String>,
}

impl FrameError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message_type_id: None,
            unique_id: None,
        }
    }

    fn with_message_type(mut self, t: u64) -> Self {
        self.message_type_id = Some(t);
        self
    }

    fn with_unique_id(mut self, id: &str) -> Self {
        self.unique_id = Some(id.to_string());
        self
    }

    /// Whether this was a Call with a usable uniqueId (answerable with
    /// a CallError).
    pub fn is_answerable_call(&self) -> bool {
        self.message_type_id == Some(MSG_TYPE_CALL) && self.unique_id.is_some()
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_call() {
        let text = r#"[2,"abc123","BootNotification",{"chargePointVendor":"Vendor","chargePointModel":"Model"}]"#;
        let frame = OcppFrame::parse(text).unwrap();
        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Vendor");
            }
            _ => panic!("Expected Call frame"),
        }
    }

    #[test]
    fn parse_call_result() {
        let text = r#"[3,"abc123",{"status":"Accepted"}]"#;
        let frame = OcppFrame::parse(text).unwrap();
        match frame {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(payload["status"], "Accepted");
            }
            _ => panic!("Expected CallResult frame"),
        }
    }

    #[test]
    fn parse_call_error_requires_object_details() {
        let err = OcppFrame::parse(r#"[4,"abc","NotImplemented","nope","details"]"#).unwrap_err();
        assert!(err.reason.contains("errorDetails"));

        let frame = OcppFrame::parse(r#"[4,"abc","NotImplemented","nope",{}]"#).unwrap();
        assert_eq!(frame.unique_id(), "abc");
    }

    #[test]
    fn malformed_call_keeps_unique_id() {
        // action is a number, but the id is salvageable
        let err = OcppFrame::parse(r#"[2,"msg-7",42,{}]"#).unwrap_err();
        assert_eq!(err.unique_id.as_deref(), Some("msg-7"));
        assert!(err.is_answerable_call());

        // short frame, id still present
        let err = OcppFrame::parse(r#"[2,"msg-8","Heartbeat"]"#).unwrap_err();
        assert_eq!(err.unique_id.as_deref(), Some("msg-8"));
    }

    #[test]
    fn empty_unique_id_rejected() {
        let err = OcppFrame::parse(r#"[2,"","Heartbeat",{}]"#).unwrap_err();
        assert!(err.unique_id.is_none());
        assert!(!err.is_answerable_call());
    }

    #[test]
    fn unknown_message_type() {
        let err = OcppFrame::parse(r#"[9,"id"]"#).unwrap_err();
        assert_eq!(err.message_type_id, Some(9));
    }

    #[test]
    fn roundtrip_is_stable() {
        for text in [
            r#"[2,"id1","Heartbeat",{}]"#,
            r#"[3,"id2",{"currentTime":"2024-01-01T00:00:00Z"}]"#,
            r#"[4,"id3","GenericError","Something went wrong",{"hint":"x"}]"#,
        ] {
            let frame = OcppFrame::parse(text).unwrap();
            let emitted = frame.serialize();
            let reparsed = OcppFrame::parse(&emitted).unwrap();
            assert_eq!(frame, reparsed);
            assert_eq!(emitted, reparsed.serialize());
        }
    }

    #[test]
    fn emitters() {
        assert_eq!(call_result("a", json!({})), r#"[3,"a",{}]"#);
        assert_eq!(
            call_error("a", "NotImplemented", "no such action", json!({})),
            r#"[4,"a","NotImplemented","no such action",{}]"#
        );
        // non-object details are coerced to an empty object
        assert_eq!(
            call_error("a", "InternalError", "x", json!("oops")),
            r#"[4,"a","InternalError","x",{}]"#
        );
    }
}
