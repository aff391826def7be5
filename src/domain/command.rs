//! CPMS command requests consumed off the event bus

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote-control command kinds accepted from the CPMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Reset,
    RemoteStart,
    RemoteStop,
    UnlockConnector,
    ChangeConfiguration,
    TriggerMessage,
    UpdateFirmware,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::RemoteStart => "RemoteStart",
            Self::RemoteStop => "RemoteStop",
            Self::UnlockConnector => "UnlockConnector",
            Self::ChangeConfiguration => "ChangeConfiguration",
            Self::TriggerMessage => "TriggerMessage",
            Self::UpdateFirmware => "UpdateFirmware",
        }
    }
}

/// One command request as published on `cpms.command.requests`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command_id: String,
    #[serde(default)]
    pub charge_point_id: Option<String>,
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Value,
    /// Per-command override of the reply timeout, in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bus_message() {
        let req: CommandRequest = serde_json::from_str(
            r#"{"commandId":"c1","chargePointId":"CP-7","commandType":"RemoteStop","payload":{"sessionId":"TX-9"}}"#,
        )
        .unwrap();
        assert_eq!(req.command_type, CommandType::RemoteStop);
        assert_eq!(req.charge_point_id.as_deref(), Some("CP-7"));
        assert_eq!(req.payload["sessionId"], "TX-9");
    }

    #[test]
    fn missing_charge_point_id_is_tolerated_at_decode() {
        let req: CommandRequest = serde_json::from_str(
            r#"{"commandId":"c2","commandType":"Reset"}"#,
        )
        .unwrap();
        assert!(req.charge_point_id.is_none());
        assert!(req.payload.is_null());
    }
}
