//! Connection-path parsing and subprotocol negotiation
//!
//! Charge points connect at `/ocpp/{version}/{chargePointId}`. Scanner
//! traffic probing for admin panels and path traversal is rejected
//! before any identity lookup happens.

use crate::domain::OcppVersion;

/// Path fragments that mark a request as scanner noise.
const SUSPICIOUS_PATTERNS: &[&str] = &[
    ".env",
    "/etc/passwd",
    "admin",
    "login",
    "wp-admin",
    "phpmyadmin",
    "xmlrpc",
    "..",
];

/// A parsed, plausible connect path
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPath {
    pub version: OcppVersion,
    pub charge_point_id: String,
}

/// Why a path was refused
#[derive(Debug, Clone, PartialEq)]
pub enum PathRejection {
    /// Scanner noise; candidate for flood-controlled logging.
    Suspicious,
    /// Shape, version or id did not match the endpoint contract.
    Invalid(String),
}

/// Parse `/ocpp/{version}/{chargePointId}`.
pub fn parse_connect_path(path: &str) -> Result<ConnectPath, PathRejection> {
    let lowered = path.to_ascii_lowercase();
    if SUSPICIOUS_PATTERNS.iter().any(|p| lowered.contains(p))
        || (lowered.contains("select") && lowered.contains("from"))
    {
        return Err(PathRejection::Suspicious);
    }

    let mut segments = path.trim_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("ocpp"), Some(version), Some(id), None) => {
            let version = OcppVersion::normalize(version).ok_or_else(|| {
                PathRejection::Invalid(format!("unsupported version '{}'", version))
            })?;
            if !valid_charge_point_id(id) {
                return Err(PathRejection::Invalid(format!(
                    "charge point id '{}' not acceptable",
                    id
                )));
            }
            Ok(ConnectPath {
                version,
                charge_point_id: id.to_string(),
            })
        }
        _ => Err(PathRejection::Invalid("expected /ocpp/{version}/{chargePointId}".into())),
    }
}

/// `^[\w-]{3,}$`
fn valid_charge_point_id(id: &str) -> bool {
    id.len() >= 3
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Pick the subprotocol to echo back. The client must offer at least one
/// and the accepted value must belong to the path's version.
pub fn negotiate_subprotocol(version: OcppVersion, offered: Option<&str>) -> Option<&'static str> {
    let offered = offered?.trim();
    if offered.is_empty() {
        return None;
    }
    for candidate in offered.split(',').map(str::trim) {
        if let Some(matched) = version
            .subprotocols()
            .iter()
            .find(|accepted| candidate.eq_ignore_ascii_case(accepted))
        {
            return Some(matched);
        }
    }
    None
}
