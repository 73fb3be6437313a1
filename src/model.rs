//! Core data model for the telemetry gateway.
//!
//! Defines sensor readings, the fixed sensor-type enumeration with
//! type-specific payload validation, and recording sessions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by reading validation
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} has wrong type: expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field {field} out of range: {message}")]
    OutOfRange { field: &'static str, message: String },

    #[error("Unknown sensor type: {0}")]
    UnknownSensorType(String),

    #[error("Device id must be non-empty")]
    EmptyDeviceId,
}

/// The fixed enumeration of supported sensor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Accelerometer,
    Gyroscope,
    Gps,
    Temperature,
    Battery,
    Magnetometer,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Accelerometer => "accelerometer",
            SensorType::Gyroscope => "gyroscope",
            SensorType::Gps => "gps",
            SensorType::Temperature => "temperature",
            SensorType::Battery => "battery",
            SensorType::Magnetometer => "magnetometer",
        }
    }

    /// Parse from the wire/storage representation
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "accelerometer" => Ok(SensorType::Accelerometer),
            "gyroscope" => Ok(SensorType::Gyroscope),
            "gps" => Ok(SensorType::Gps),
            "temperature" => Ok(SensorType::Temperature),
            "battery" => Ok(SensorType::Battery),
            "magnetometer" => Ok(SensorType::Magnetometer),
            other => Err(ValidationError::UnknownSensorType(other.to_string())),
        }
    }
}

/// One sensor sample from a device. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Device that produced the sample
    pub device_id: String,
    /// Sample timestamp in epoch milliseconds (producer-supplied, or
    /// server-assigned on arrival)
    pub recorded_at: i64,
    /// Which sensor produced the value
    pub sensor_type: SensorType,
    /// Sensor-type-specific structured payload
    pub value: Value,
    /// Recording session the sample belongs to, attached at ingestion
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Reading {
    /// Validate required fields and the type-specific value shape.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::EmptyDeviceId);
        }
        validate_value(self.sensor_type, &self.value)
    }
}

/// Validate a sensor payload against its type-specific shape.
///
/// Shapes:
/// - accelerometer / gyroscope / magnetometer: numeric `x`, `y`, `z`
/// - gps: `latitude` in [-90, 90], `longitude` in [-180, 180], with
///   optional numeric `altitude`, `accuracy`, `speed`
/// - temperature: numeric `celsius`
/// - battery: `level` in [0, 100], optional boolean `charging`
pub fn validate_value(sensor_type: SensorType, value: &Value) -> Result<(), ValidationError> {
    match sensor_type {
        SensorType::Accelerometer | SensorType::Gyroscope | SensorType::Magnetometer => {
            require_number(value, "x")?;
            require_number(value, "y")?;
            require_number(value, "z")?;
            Ok(())
        }
        SensorType::Gps => {
            let latitude = require_number(value, "latitude")?;
            let longitude = require_number(value, "longitude")?;
            if !(-90.0..=90.0).contains(&latitude) {
                return Err(ValidationError::OutOfRange {
                    field: "latitude",
                    message: format!("{} not in [-90, 90]", latitude),
                });
            }
            if !(-180.0..=180.0).contains(&longitude) {
                return Err(ValidationError::OutOfRange {
                    field: "longitude",
                    message: format!("{} not in [-180, 180]", longitude),
                });
            }
            for optional in ["altitude", "accuracy", "speed"] {
                if let Some(v) = value.get(optional) {
                    if !v.is_number() {
                        return Err(ValidationError::WrongType {
                            field: optional,
                            expected: "number",
                        });
                    }
                }
            }
            Ok(())
        }
        SensorType::Temperature => {
            require_number(value, "celsius")?;
            Ok(())
        }
        SensorType::Battery => {
            let level = require_number(value, "level")?;
            if !(0.0..=100.0).contains(&level) {
                return Err(ValidationError::OutOfRange {
                    field: "level",
                    message: format!("{} not in [0, 100]", level),
                });
            }
            if let Some(charging) = value.get("charging") {
                if !charging.is_boolean() {
                    return Err(ValidationError::WrongType {
                        field: "charging",
                        expected: "boolean",
                    });
                }
            }
            Ok(())
        }
    }
}

fn require_number(value: &Value, field: &'static str) -> Result<f64, ValidationError> {
    match value.get(field) {
        None => Err(ValidationError::MissingField(field)),
        Some(v) => v
            .as_f64()
            .ok_or(ValidationError::WrongType {
                field,
                expected: "number",
            }),
    }
}

/// Lifecycle state of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    Paused,
    Replaced,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Paused => "paused",
            SessionStatus::Replaced => "replaced",
            SessionStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            "paused" => Some(SessionStatus::Paused),
            "replaced" => Some(SessionStatus::Replaced),
            "aborted" => Some(SessionStatus::Aborted),
            _ => None,
        }
    }
}

/// A bounded recording interval grouping readings for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    /// Epoch milliseconds
    pub started_at: i64,
    /// Epoch milliseconds, set when the session ends
    pub ended_at: Option<i64>,
    pub status: SessionStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Session {
    /// Create a fresh active session for a device.
    pub fn new_active(device_id: &str) -> Self {
        let started_at = Utc::now().timestamp_millis();
        Self {
            session_id: derive_session_id(device_id, started_at),
            device_id: device_id.to_string(),
            started_at,
            ended_at: None,
            status: SessionStatus::Active,
            description: String::new(),
            metadata: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Derive a unique session id from device id, creation time, and a
/// random suffix.
pub fn derive_session_id(device_id: &str, started_at: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", device_id, started_at, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accelerometer_requires_three_axes() {
        assert!(validate_value(SensorType::Accelerometer, &json!({"x": 0.1, "y": -0.2, "z": 9.8})).is_ok());
        assert!(validate_value(SensorType::Accelerometer, &json!({"x": 0.1, "y": -0.2})).is_err());
        assert!(validate_value(SensorType::Gyroscope, &json!({"x": "a", "y": 0.0, "z": 0.0})).is_err());
    }

    #[test]
    fn gps_range_checks() {
        assert!(validate_value(SensorType::Gps, &json!({"latitude": 46.52, "longitude": 6.63})).is_ok());
        assert!(validate_value(SensorType::Gps, &json!({"latitude": 91.0, "longitude": 0.0})).is_err());
        assert!(validate_value(SensorType::Gps, &json!({"latitude": 0.0, "longitude": -180.5})).is_err());
        assert!(validate_value(
            SensorType::Gps,
            &json!({"latitude": 0.0, "longitude": 0.0, "altitude": "high"})
        )
        .is_err());
    }

    #[test]
    fn battery_level_bounds() {
        assert!(validate_value(SensorType::Battery, &json!({"level": 87.5, "charging": true})).is_ok());
        assert!(validate_value(SensorType::Battery, &json!({"level": 130.0})).is_err());
        assert!(validate_value(SensorType::Battery, &json!({"level": 50, "charging": "yes"})).is_err());
    }

    #[test]
    fn temperature_requires_celsius() {
        assert!(validate_value(SensorType::Temperature, &json!({"celsius": 21.3})).is_ok());
        assert!(validate_value(SensorType::Temperature, &json!({"fahrenheit": 70.0})).is_err());
    }

    #[test]
    fn reading_rejects_empty_device_id() {
        let reading = Reading {
            device_id: "  ".to_string(),
            recorded_at: 1_700_000_000_000,
            sensor_type: SensorType::Temperature,
            value: json!({"celsius": 20.0}),
            session_id: None,
        };
        assert!(matches!(reading.validate(), Err(ValidationError::EmptyDeviceId)));
    }

    #[test]
    fn sensor_type_round_trip() {
        for t in [
            SensorType::Accelerometer,
            SensorType::Gyroscope,
            SensorType::Gps,
            SensorType::Temperature,
            SensorType::Battery,
            SensorType::Magnetometer,
        ] {
            assert_eq!(SensorType::parse(t.as_str()).unwrap(), t);
        }
        assert!(SensorType::parse("microphone").is_err());
    }

    #[test]
    fn session_id_contains_device_and_time() {
        let session = Session::new_active("AMR-001");
        assert!(session.session_id.starts_with("AMR-001-"));
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.ended_at.is_none());
    }
}
