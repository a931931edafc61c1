use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Administrative status of a device. Only `active` devices may submit
/// telemetry; `maintenance` devices may still heartbeat and read config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}

impl TryFrom<String> for DeviceStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A registered IoT device.
///
/// The api_key is deliberately excluded from serialization; registration and
/// credential endpoints expose it explicitly where the contract requires it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub device_type: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[sqlx(try_from = "String")]
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Outcome of a registration attempt. The HTTP layer picks the status code;
/// the existing device's api_key is never part of the collision variant.
#[derive(Debug)]
pub enum RegisterOutcome {
    Registered(Device),
    NameTaken { existing_id: i64 },
}

/// Profile supplied at registration time.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub hardware_version: Option<String>,
}

/// Scalar data type of a time series, fixed at first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
    Bool,
    Text,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Text => "text",
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(DataType::Int),
            "float" => Ok(DataType::Float),
            "bool" => Ok(DataType::Bool),
            "text" => Ok(DataType::Text),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A tagged telemetry value. Coercion rules live in the pipeline; this type
/// only knows what it is and how to become a float.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TelemetryValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TelemetryValue::Int(_) => DataType::Int,
            TelemetryValue::Float(_) => DataType::Float,
            TelemetryValue::Bool(_) => DataType::Bool,
            TelemetryValue::Text(_) => DataType::Text,
        }
    }

    /// Integers up to 2^53 convert losslessly to f64.
    pub fn to_float(&self) -> Option<f64> {
        match self {
            TelemetryValue::Float(f) => Some(*f),
            TelemetryValue::Int(i) if i.unsigned_abs() <= (1 << 53) => Some(*i as f64),
            _ => None,
        }
    }
}

/// Builds the hierarchical storage path for a device measurement.
pub fn series_path(device_id: i64, measurement: &str) -> String {
    format!("root.iotflow.devices.device_{device_id}.{measurement}")
}

/// One normalized point headed for the time-series store.
#[derive(Debug, Clone)]
pub struct TelemetryPoint {
    pub measurement: String,
    pub path: String,
    pub ts: DateTime<Utc>,
    pub value: TelemetryValue,
}

impl TelemetryPoint {
    pub fn new(device_id: i64, measurement: &str, ts: DateTime<Utc>, value: TelemetryValue) -> Self {
        Self {
            path: series_path(device_id, measurement),
            measurement: measurement.to_string(),
            ts,
            value,
        }
    }
}

/// A point as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPoint {
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub value: TelemetryValue,
}

/// Telemetry submission body on the HTTP path. The api_key arrives in the
/// X-API-Key header, not the body.
#[derive(Debug, Deserialize)]
pub struct TelemetrySubmission {
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The MQTT payload envelope. Every message authenticates itself.
#[derive(Debug, Deserialize)]
pub struct MqttEnvelope {
    pub api_key: String,
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Where a status answer came from: the cache, or the store after a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Cache,
    Store,
}

/// Liveness snapshot for a device.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessRecord {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub source: StatusSource,
}

/// Outbound command published to a device's control topic.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub command_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_path_format() {
        assert_eq!(
            series_path(7, "temperature"),
            "root.iotflow.devices.device_7.temperature"
        );
    }

    #[test]
    fn test_status_round_trip() {
        for s in ["active", "inactive", "maintenance"] {
            let status: DeviceStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("deleted".parse::<DeviceStatus>().is_err());
    }

    #[test]
    fn test_int_to_float_limits() {
        assert_eq!(TelemetryValue::Int(22).to_float(), Some(22.0));
        assert_eq!(
            TelemetryValue::Int(1 << 53).to_float(),
            Some((1u64 << 53) as f64)
        );
        assert_eq!(TelemetryValue::Int((1 << 53) + 1).to_float(), None);
        assert_eq!(TelemetryValue::Text("x".into()).to_float(), None);
    }

    #[test]
    fn test_value_serializes_untagged() {
        assert_eq!(
            serde_json::to_string(&TelemetryValue::Float(22.5)).unwrap(),
            "22.5"
        );
        assert_eq!(
            serde_json::to_string(&TelemetryValue::Bool(true)).unwrap(),
            "true"
        );
        assert_eq!(
            serde_json::to_string(&TelemetryValue::Text("ok".into())).unwrap(),
            "\"ok\""
        );
    }
}
