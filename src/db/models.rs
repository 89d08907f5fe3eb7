use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Hardware categories a dashboard tile can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Relay,
    Led,
    Motor,
    Sensor,
    Actuator,
    Servo,
    Buzzer,
    Fan,
    Pump,
    Valve,
}

impl DeviceKind {
    pub fn is_sensor(self) -> bool {
        matches!(self, DeviceKind::Sensor)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Relay => "relay",
            DeviceKind::Led => "led",
            DeviceKind::Motor => "motor",
            DeviceKind::Sensor => "sensor",
            DeviceKind::Actuator => "actuator",
            DeviceKind::Servo => "servo",
            DeviceKind::Buzzer => "buzzer",
            DeviceKind::Fan => "fan",
            DeviceKind::Pump => "pump",
            DeviceKind::Valve => "valve",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    Light,
    Motion,
    Gas,
    WaterLevel,
    SoilMoisture,
    Distance,
    Current,
    Voltage,
    Power,
    Ph,
    Tds,
    Flow,
}

/// A sensor reading is either numeric or a boolean (motion, door contact).
///
/// `Bool` must come before `Number` so `true`/`false` never coerce.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum SensorValue {
    Bool(bool),
    Number(f64),
}

impl SensorValue {
    /// Numeric view used by automation thresholds: booleans map to 1/0.
    pub fn as_f64(self) -> f64 {
        match self {
            SensorValue::Bool(v) => f64::from(u8::from(v)),
            SensorValue::Number(v) => v,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            SensorValue::Bool(v) => Some(v),
            SensorValue::Number(_) => None,
        }
    }
}

/// One entry of the device directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    /// On/off state; absent for sensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    /// Latest reading; sensors only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SensorValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<SensorType>,
    /// LED brightness, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    /// Motor speed, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Device {
    /// Directory entry created on first contact from an unseen device id.
    pub fn auto_registered(id: &str, kind: DeviceKind) -> Self {
        Self {
            id: id.to_owned(),
            name: display_name_for(id),
            kind,
            pin: None,
            state: (!kind.is_sensor()).then_some(false),
            value: None,
            unit: None,
            sensor_type: None,
            brightness: None,
            speed: None,
            ip: None,
            last_updated: Some(Utc::now()),
        }
    }

    /// Value automation rules compare against: the sensor reading, or the
    /// on/off state as 1/0 for actuators.
    pub fn trigger_value(&self) -> Option<f64> {
        match (self.value, self.state) {
            (Some(v), _) => Some(v.as_f64()),
            (None, Some(s)) => Some(f64::from(u8::from(s))),
            (None, None) => None,
        }
    }
}

/// Derive a display name from a raw device id: `esp32_living-room` →
/// `Esp32 Living Room`.
pub fn display_name_for(id: &str) -> String {
    let name = id
        .split(|c| c == '_' || c == '-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        id.to_owned()
    } else {
        name
    }
}

/// Name shown for a rule reference that may no longer resolve.
pub fn resolve_device_name(devices: &[Device], id: &str) -> String {
    devices
        .iter()
        .find(|d| d.id == id)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| format!("Unknown device ({id})"))
}

/// Projection returned by `getDeviceStates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub state: Option<bool>,
    pub value: Option<SensorValue>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<Device> for DeviceState {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            name: d.name,
            kind: d.kind,
            state: d.state,
            value: d.value,
            last_updated: d.last_updated,
        }
    }
}

/// One stored telemetry row. Channels (`value`, `temperature`, `humidity`,
/// ...) are flattened next to the timestamp and device id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub channels: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum Condition {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl Condition {
    pub fn holds(self, observed: f64, threshold: f64) -> bool {
        match self {
            Condition::Greater => observed > threshold,
            Condition::Less => observed < threshold,
            Condition::Equal => (observed - threshold).abs() < f64::EPSILON,
            Condition::GreaterOrEqual => observed >= threshold,
            Condition::LessOrEqual => observed <= threshold,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Greater => ">",
            Condition::Less => "<",
            Condition::Equal => "==",
            Condition::GreaterOrEqual => ">=",
            Condition::LessOrEqual => "<=",
        };
        f.write_str(s)
    }
}

/// Trigger-condition-action tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    /// Device id whose value is compared.
    pub trigger: String,
    pub condition: Condition,
    pub value: SensorValue,
    /// Device id switched when the condition holds.
    pub action: String,
    pub action_state: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Technician,
    User,
}

/// Stored account row. `password` holds an Argon2 PHC string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Account as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

impl From<User> for UserProfile {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            name: u.name,
            role: u.role,
            created_at: u.created_at,
            is_active: u.is_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub user: String,
    #[serde(default)]
    pub details: String,
}
