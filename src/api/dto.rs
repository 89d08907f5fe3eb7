use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::{Device, DeviceKind, SensorType},
    state::ControlOptions,
};

/// Request body for `POST /dashboard/control`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ControlRequest {
    /// Device id.
    pub id: String,
    pub state: bool,
    /// LED brightness, 0..=100.
    #[serde(default)]
    pub brightness: Option<u8>,
    /// Motor speed, 0..=100.
    #[serde(default)]
    pub speed: Option<u8>,
}

impl ControlRequest {
    pub fn options(&self) -> ControlOptions {
        ControlOptions {
            brightness: self.brightness,
            speed: self.speed,
        }
    }
}

/// Request body for `POST /dashboard/devices`. The id is assigned on
/// insert.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewDeviceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    #[serde(default)]
    pub pin: Option<u8>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<SensorType>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl NewDeviceRequest {
    pub fn into_device(self) -> Device {
        Device {
            name: self.name,
            pin: self.pin,
            unit: self.unit,
            sensor_type: self.sensor_type,
            ip: self.ip,
            ..Device::auto_registered("", self.kind)
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}
