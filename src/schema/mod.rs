//! Per-version JSON-Schema registry
//!
//! Request and response schemas for every supported action ship with the
//! gateway as per-version maps (`schemas/ocpp16.json`, `ocpp201.json`,
//! `ocpp21.json`) and are compiled once at startup.
//!
//! Before registering, every object schema that omits an
//! `additionalProperties` directive gets it set to `false`, recursively.
//! This deliberately mutates externally-authored schemas; actions on the
//! configured exemption list (default: `DataTransfer`, whose `data` field
//! is free-form) are registered as shipped.

use std::collections::{HashMap, HashSet};

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use thiserror::Error;

use crate::domain::OcppVersion;

const SCHEMAS_V16: &str = include_str!("../../schemas/ocpp16.json");
const SCHEMAS_V201: &str = include_str!("../../schemas/ocpp201.json");
const SCHEMAS_V21: &str = include_str!("../../schemas/ocpp21.json");

/// Which side of a call a schema describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Request,
    Response,
}

/// Schema-load failure. Aborts startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema map for {0} is not valid JSON: {1}")]
    Parse(OcppVersion, serde_json::Error),
    #[error("schema map for {0} has an unexpected shape: {1}")]
    Shape(OcppVersion, String),
    #[error("schema for {version} {action} failed to compile: {message}")]
    Compile {
        version: OcppVersion,
        action: String,
        message: String,
    },
}

/// Result of validating one payload
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<String>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn errors(&self) -> &[String] {
        match self {
            Self::Valid => &[],
            Self::Invalid(errors) => errors,
        }
    }

    fn schema_missing() -> Self {
        Self::Invalid(vec!["schema_missing".to_string()])
    }
}

/// Compiled request/response validators for all versions
pub struct SchemaRegistry {
    validators: HashMap<(OcppVersion, SchemaKind, String), JSONSchema>,
}

impl SchemaRegistry {
    /// Compile the shipped schema maps. `tighten_exempt` lists action
    /// names whose schemas keep their original `additionalProperties`
    /// behaviour.
    pub fn load(tighten_exempt: &HashSet<String>) -> Result<Self, SchemaError> {
        let mut validators = HashMap::new();
        for (version, raw) in [
            (OcppVersion::V16, SCHEMAS_V16),
            (OcppVersion::V201, SCHEMAS_V201),
            (OcppVersion::V21, SCHEMAS_V21),
        ] {
            let map: Value =
                serde_json::from_str(raw).map_err(|e| SchemaError::Parse(version, e))?;
            for (kind, field) in [(SchemaKind::Request, "request"), (SchemaKind::Response, "response")] {
                let actions = map
                    .get(field)
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        SchemaError::Shape(version, format!("missing '{}' object", field))
                    })?;
                for (action, schema) in actions {
                    let mut schema = schema.clone();
                    if !tighten_exempt.contains(action) {
                        tighten(&mut schema);
                    }
                    let compiled = JSONSchema::options()
                        .with_draft(Draft::Draft202012)
                        .compile(&schema)
                        .map_err(|e| SchemaError::Compile {
                            version,
                            action: action.clone(),
                            message: e.to_string(),
                        })?;
                    validators.insert((version, kind, action.clone()), compiled);
                }
            }
        }
        Ok(Self { validators })
    }

    pub fn has_request_schema(&self, version: OcppVersion, action: &str) -> bool {
        self.has(version, SchemaKind::Request, action)
    }

    pub fn has_response_schema(&self, version: OcppVersion, action: &str) -> bool {
        self.has(version, SchemaKind::Response, action)
    }

    fn has(&self, version: OcppVersion, kind: SchemaKind, action: &str) -> bool {
        self.validators
            .contains_key(&(version, kind, action.to_string()))
    }

    pub fn validate_request(
        &self,
        version: OcppVersion,
        action: &str,
        payload: &Value,
    ) -> ValidationResult {
        self.validate(version, SchemaKind::Request, action, payload)
    }

    pub fn validate_response(
        &self,
        version: OcppVersion,
        action: &str,
        payload: &Value,
    ) -> ValidationResult {
        self.validate(version, SchemaKind::Response, action, payload)
    }

    fn validate(
        &self,
        version: OcppVersion,
        kind: SchemaKind,
        action: &str,
        payload: &Value,
    ) -> ValidationResult {
        let Some(compiled) = self.validators.get(&(version, kind, action.to_string())) else {
            return ValidationResult::schema_missing();
        };
        match compiled.validate(payload) {
            Ok(()) => ValidationResult::Valid,
            Err(errors) => ValidationResult::Invalid(
                errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        let path = if path.is_empty() { "/".to_string() } else { path };
                        format!("{} {}", path, e)
                    })
                    .collect(),
            ),
        }
    }
}

/// Recursively set `additionalProperties: false` on every object schema
/// that does not state it, descending through the structural and
/// combinator keywords.
fn tighten(schema: &mut Value) {
    let Some(map) = schema.as_object_mut() else {
        return;
    };

    let is_object_schema = map.get("type").and_then(Value::as_str) == Some("object")
        || map.contains_key("properties")
        || map.contains_key("patternProperties");
    if is_object_schema && !map.contains_key("additionalProperties") {
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }

    // Keywords holding a map of subschemas
    for key in ["properties", "patternProperties", "$defs", "definitions", "dependentSchemas"] {
        if let Some(children) = map.get_mut(key).and_then(Value::as_object_mut) {
            for child in children.values_mut() {
                tighten(child);
            }
        }
    }

    // Keywords holding a single subschema
    for key in [
        "items",
        "not",
        "if",
        "then",
        "else",
        "propertyNames",
        "additionalProperties",
        "unevaluatedProperties",
        "unevaluatedItems",
    ] {
        if let Some(child) = map.get_mut(key) {
            if child.is_object() {
                tighten(child);
            }
        }
    }

    // Keywords holding an array of subschemas
    for key in ["prefixItems", "allOf", "anyOf", "oneOf"] {
        if let Some(children) = map.get_mut(key).and_then(Value::as_array_mut) {
            for child in children.iter_mut() {
                tighten(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::load(&["DataTransfer".to_string()].into_iter().collect()).unwrap()
    }

    #[test]
    fn tighten_closes_nested_objects() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "inner": {
                    "type": "object",
                    "properties": { "x": { "type": "string" } }
                },
                "list": {
                    "type": "array",
                    "items": { "type": "object", "properties": {} }
                }
            },
            "$defs": {
                "Aux": { "type": "object", "properties": {} }
            }
        });
        tighten(&mut schema);
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["properties"]["inner"]["additionalProperties"], false);
        assert_eq!(schema["properties"]["list"]["items"]["additionalProperties"], false);
        assert_eq!(schema["$defs"]["Aux"]["additionalProperties"], false);
    }

    #[test]
    fn tighten_keeps_explicit_directive() {
        let mut schema = json!({
            "type": "object",
            "additionalProperties": true,
            "properties": {}
        });
        tighten(&mut schema);
        assert_eq!(schema["additionalProperties"], true);
    }

    #[test]
    fn valid_boot_notification_passes() {
        let reg = registry();
        let result = reg.validate_request(
            OcppVersion::V16,
            "BootNotification",
            &json!({"chargePointVendor": "E", "chargePointModel": "M"}),
        );
        assert!(result.is_valid());
    }

    #[test]
    fn missing_required_property_reported_with_path() {
        let reg = registry();
        let result = reg.validate_request(
            OcppVersion::V16,
            "BootNotification",
            &json!({"chargePointVendor": "E"}),
        );
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with('/'));
        assert!(errors[0].contains("chargePointModel"));
    }

    #[test]
    fn unknown_property_rejected_after_tightening() {
        let reg = registry();
        let result = reg.validate_request(
            OcppVersion::V16,
            "Heartbeat",
            &json!({"unexpected": 1}),
        );
        assert!(!result.is_valid());
    }

    #[test]
    fn exempt_action_is_not_tightened() {
        let reg = registry();
        // 'data' is typed, but extra top-level members stay legal
        let result = reg.validate_request(
            OcppVersion::V16,
            "DataTransfer",
            &json!({"vendorId": "v", "extra": {"free": "form"}}),
        );
        assert!(result.is_valid());
    }

    #[test]
    fn unknown_action_reports_schema_missing() {
        let reg = registry();
        let result = reg.validate_request(OcppVersion::V16, "NoSuchAction", &json!({}));
        assert_eq!(result.errors(), ["schema_missing"]);
        assert!(!reg.has_request_schema(OcppVersion::V16, "NoSuchAction"));
    }

    #[test]
    fn transaction_event_schema_present_in_both_2x_versions() {
        let reg = registry();
        assert!(reg.has_request_schema(OcppVersion::V201, "TransactionEvent"));
        assert!(reg.has_request_schema(OcppVersion::V21, "TransactionEvent"));
        assert!(!reg.has_request_schema(OcppVersion::V16, "TransactionEvent"));
    }

    #[test]
    fn response_schemas_validate_engine_replies() {
        let reg = registry();
        let result = reg.validate_response(
            OcppVersion::V16,
            "BootNotification",
            &json!({"status": "Accepted", "currentTime": "2024-01-01T00:00:00Z", "interval": 300}),
        );
        assert!(result.is_valid());

        let result = reg.validate_response(
            OcppVersion::V16,
            "BootNotification",
            &json!({"status": "Maybe"}),
        );
        assert!(!result.is_valid());
    }
}
