//! JSON wire protocol spoken over the persistent WebSocket.
//!
//! One JSON object per frame, dispatched on the `type` field. Protocol
//! errors are reported back to the sender and never terminate the
//! connection on their own.

use crate::model::SensorType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages accepted from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind identity and resolve/create the device's active session
    DeviceRegister { device_id: String },
    /// Ingest one reading; `device_id` is required only while the
    /// connection is still anonymous
    SensorData {
        #[serde(default)]
        device_id: Option<String>,
        sensor_type: SensorType,
        value: Value,
        /// Epoch milliseconds; server-assigned when absent
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Request a clean close, ending the bound session
    DeviceUnregister,
    /// Alias for `device_unregister` kept for older clients
    DeviceDisconnect,
    /// Liveness probe from the client
    Ping { timestamp: i64 },
}

/// Messages sent to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent immediately on connect
    Welcome { client_id: String },
    /// Registration confirmed with the resolved session
    DeviceRegistered {
        device_id: String,
        session_id: String,
    },
    /// One reading accepted
    Ack,
    /// Broadcast of another client's accepted reading
    SensorData { data: Value },
    /// Non-fatal protocol/validation failure
    Error {
        error_code: ErrorCode,
        error_message: String,
    },
    /// Administrative disconnect notice; reconnection is refused for
    /// `retry_after_ms`
    ForceDisconnect { retry_after_ms: u64 },
    /// Reply to `ping`
    Pong { original_timestamp: i64 },
}

/// Error codes carried by `ServerMessage::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    UnknownType,
    DeviceBlocked,
    ValidationFailed,
    NotRegistered,
}

/// WebSocket close codes used by the gateway
pub mod close_code {
    /// Normal closure requested by either side
    pub const NORMAL: u16 = 1000;
    /// Peer is going away (browser tab closed, app backgrounded)
    pub const GOING_AWAY: u16 = 1001;
    /// Registration/ingestion refused because the device is blocked
    pub const DEVICE_BLOCKED: u16 = 4001;
    /// Operator-initiated force disconnect
    pub const FORCE_DISCONNECT: u16 = 4002;
    /// Liveness timeout: no pong within the grace period
    pub const LIVENESS_TIMEOUT: u16 = 4008;
}

/// Whether a close code counts as a clean disconnect that should
/// complete the bound session.
pub fn is_clean_close(code: u16) -> bool {
    code == close_code::NORMAL || code == close_code::GOING_AWAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sensor_data_with_inline_device_id() {
        let raw = r#"{
            "type": "sensor_data",
            "device_id": "AMR-001",
            "sensor_type": "accelerometer",
            "value": {"x": 0.1, "y": 0.2, "z": 9.8},
            "timestamp": 1700000000000
        }"#;

        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::SensorData {
                device_id,
                sensor_type,
                timestamp,
                ..
            } => {
                assert_eq!(device_id.as_deref(), Some("AMR-001"));
                assert_eq!(sensor_type, crate::model::SensorType::Accelerometer);
                assert_eq!(timestamp, Some(1_700_000_000_000));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn sensor_data_device_id_is_optional() {
        let raw = r#"{"type": "sensor_data", "sensor_type": "gps", "value": {"latitude": 1.0, "longitude": 2.0}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SensorData { device_id: None, timestamp: None, .. }
        ));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type": "telepathy", "device_id": "AMR-001"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn error_codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_value(ErrorCode::DeviceBlocked).unwrap(),
            json!("DEVICE_BLOCKED")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::InvalidJson).unwrap(),
            json!("INVALID_JSON")
        );
    }

    #[test]
    fn server_messages_carry_type_tag() {
        let welcome = serde_json::to_value(ServerMessage::Welcome {
            client_id: "client-1-1700000000000".to_string(),
        })
        .unwrap();
        assert_eq!(welcome["type"], "welcome");

        let registered = serde_json::to_value(ServerMessage::DeviceRegistered {
            device_id: "AMR-002".to_string(),
            session_id: "AMR-002-1700000000000-abcd1234".to_string(),
        })
        .unwrap();
        assert_eq!(registered["type"], "device_registered");
        assert_eq!(registered["session_id"], "AMR-002-1700000000000-abcd1234");
    }

    #[test]
    fn clean_close_codes() {
        assert!(is_clean_close(close_code::NORMAL));
        assert!(is_clean_close(close_code::GOING_AWAY));
        assert!(!is_clean_close(close_code::LIVENESS_TIMEOUT));
        assert!(!is_clean_close(close_code::FORCE_DISCONNECT));
    }
}
