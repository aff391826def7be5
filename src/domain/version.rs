//! OCPP protocol version
//!
//! Defines the supported OCPP versions for multi-protocol support.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "1.6J")]
    V16,
    /// OCPP 2.0.1
    #[serde(rename = "2.0.1")]
    V201,
    /// OCPP 2.1
    #[serde(rename = "2.1")]
    V21,
}

impl OcppVersion {
    /// Normalize a textual version as it appears in connection paths or
    /// identity records. `1.6` and `1.6j` are aliases for `1.6J`.
    pub fn normalize(s: &str) -> Option<Self> {
        match s.trim() {
            "1.6" | "1.6j" | "1.6J" => Some(Self::V16),
            "2.0.1" => Some(Self::V201),
            "2.1" => Some(Self::V21),
            _ => None,
        }
    }

    /// Canonical version string (`1.6J`, `2.0.1`, `2.1`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V16 => "1.6J",
            Self::V201 => "2.0.1",
            Self::V21 => "2.1",
        }
    }

    /// WebSocket subprotocols acceptable for this version, in the
    /// `Sec-WebSocket-Protocol` header during handshake.
    pub fn subprotocols(&self) -> &'static [&'static str] {
        match self {
            Self::V16 => &["ocpp1.6", "ocpp1.6j"],
            Self::V201 => &["ocpp2.0.1"],
            Self::V21 => &["ocpp2.1"],
        }
    }

    /// Whether this version belongs to the 2.x family.
    pub fn is_v2x(&self) -> bool {
        matches!(self, Self::V201 | Self::V21)
    }

    /// Wire error code for malformed payloads. The 1.6J spelling differs
    /// and is part of the wire contract.
    pub fn format_violation_code(&self) -> &'static str {
        match self {
            Self::V16 => "FormationViolation",
            Self::V201 | Self::V21 => "FormatViolation",
        }
    }

    /// All supported OCPP versions, ordered from newest to oldest.
    pub const ALL: &'static [OcppVersion] = &[Self::V21, Self::V201, Self::V16];
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.as_str())
    }
}
