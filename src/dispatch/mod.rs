//! The hub's single RPC surface: a named action plus a flat parameter map,
//! answered with a uniform `{success, data|message|error}` envelope.

pub mod service;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::{
    auth::AuthError,
    db::models::{Condition, Device, DeviceKind, Role, SensorType, SensorValue},
    store::{Fields, StoreError},
};

pub use service::{HubService, HubSettings, ADMIN_ID};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_ACTIVITY_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Response body of every action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by `saveAutomationRule`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl Envelope {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// `Ok(data)` on success (`Value::Null` when absent), the error text
    /// otherwise.
    pub fn into_result(self) -> anyhow::Result<Value> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(anyhow::anyhow!(
                "hub action failed: {}",
                self.error.as_deref().unwrap_or("(no error message)")
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Missing action parameter")]
    MissingAction,
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid parameters for {action}: {source}")]
    InvalidParams {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Invalid session: {0}")]
    Session(#[source] AuthError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Maps a store miss to `<entity> not found`, passes anything else on.
    pub(crate) fn not_found_as(entity: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |e| match e {
            StoreError::NotFound { .. } => DispatchError::NotFound(entity),
            other => DispatchError::Store(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceParams {
    pub device: Device,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdParams {
    pub device_id: String,
}

/// Partial device update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DeviceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SensorValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<SensorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviceParams {
    pub device_id: String,
    pub updates: DevicePatch,
    #[serde(default, deserialize_with = "from_query_text")]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSensorDataParams {
    pub device_id: String,
    #[serde(deserialize_with = "from_query_text")]
    pub value: SensorValue,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Raw query fields as sent by the board firmware:
/// `temp`, `humidity`, `light`, `motion`, `relay1`..`relay4`.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSensorDataParams {
    #[serde(flatten)]
    pub raw: Fields,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorHistoryParams {
    pub device_id: String,
    #[serde(default = "default_history_limit", deserialize_with = "from_query_text")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDeviceStateParams {
    pub device_id: String,
    #[serde(deserialize_with = "from_query_text")]
    pub state: bool,
    #[serde(default, deserialize_with = "from_query_text")]
    pub brightness: Option<u8>,
    #[serde(default, deserialize_with = "from_query_text")]
    pub speed: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewRule {
    pub name: String,
    pub trigger: String,
    pub condition: Condition,
    pub value: SensorValue,
    pub action: String,
    pub action_state: bool,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAutomationRuleParams {
    pub rule: NewRule,
}

/// Partial rule update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SensorValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAutomationRuleParams {
    pub rule_id: String,
    pub updates: RulePatch,
    #[serde(default, deserialize_with = "from_query_text")]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleIdParams {
    pub rule_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    /// Supplied ids update the existing account with that id.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(alias = "username")]
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveUserParams {
    pub user: NewUser,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdParams {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
    #[serde(alias = "username")]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifySessionParams {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActivity {
    pub action: String,
    pub user: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogActivityParams {
    pub activity: NewActivity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitParams {
    #[serde(default, deserialize_with = "from_query_text")]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Every request the hub understands, one variant per action name.
#[derive(Debug, Clone)]
pub enum Action {
    RegisterDevice(RegisterDeviceParams),
    GetDevices,
    UpdateDevice(UpdateDeviceParams),
    DeleteDevice(DeviceIdParams),
    SaveSensorData(SaveSensorDataParams),
    LogSensorData(LogSensorDataParams),
    GetSensorHistory(SensorHistoryParams),
    SaveDeviceState(SaveDeviceStateParams),
    GetDeviceStates,
    SaveAutomationRule(SaveAutomationRuleParams),
    GetAutomationRules,
    UpdateAutomationRule(UpdateAutomationRuleParams),
    DeleteAutomationRule(RuleIdParams),
    SaveUser(SaveUserParams),
    GetUsers,
    DeleteUser(UserIdParams),
    Login(LoginParams),
    VerifySession(VerifySessionParams),
    LogActivity(LogActivityParams),
    GetActivityLogs(LimitParams),
}

impl Action {
    /// Resolve an action name and decode its parameters. Nothing is executed.
    pub fn parse(name: &str, params: Fields) -> Result<Self, DispatchError> {
        let action = match name {
            "registerDevice" => Action::RegisterDevice(decode("registerDevice", params)?),
            "getDevices" => Action::GetDevices,
            "updateDevice" => Action::UpdateDevice(decode("updateDevice", params)?),
            "deleteDevice" => Action::DeleteDevice(decode("deleteDevice", params)?),
            "saveSensorData" => Action::SaveSensorData(decode("saveSensorData", params)?),
            "logSensorData" | "log" => Action::LogSensorData(decode("logSensorData", params)?),
            "getSensorHistory" => Action::GetSensorHistory(decode("getSensorHistory", params)?),
            "saveDeviceState" => Action::SaveDeviceState(decode("saveDeviceState", params)?),
            "getDeviceStates" => Action::GetDeviceStates,
            "saveAutomationRule" => {
                Action::SaveAutomationRule(decode("saveAutomationRule", params)?)
            }
            "getAutomationRules" => Action::GetAutomationRules,
            "updateAutomationRule" => {
                Action::UpdateAutomationRule(decode("updateAutomationRule", params)?)
            }
            "deleteAutomationRule" => {
                Action::DeleteAutomationRule(decode("deleteAutomationRule", params)?)
            }
            "saveUser" => Action::SaveUser(decode("saveUser", params)?),
            "getUsers" => Action::GetUsers,
            "deleteUser" => Action::DeleteUser(decode("deleteUser", params)?),
            "login" => Action::Login(decode("login", params)?),
            "verifySession" => Action::VerifySession(decode("verifySession", params)?),
            "logActivity" => Action::LogActivity(decode("logActivity", params)?),
            "getActivityLogs" => Action::GetActivityLogs(decode("getActivityLogs", params)?),
            other => return Err(DispatchError::UnknownAction(other.to_owned())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::RegisterDevice(_) => "registerDevice",
            Action::GetDevices => "getDevices",
            Action::UpdateDevice(_) => "updateDevice",
            Action::DeleteDevice(_) => "deleteDevice",
            Action::SaveSensorData(_) => "saveSensorData",
            Action::LogSensorData(_) => "logSensorData",
            Action::GetSensorHistory(_) => "getSensorHistory",
            Action::SaveDeviceState(_) => "saveDeviceState",
            Action::GetDeviceStates => "getDeviceStates",
            Action::SaveAutomationRule(_) => "saveAutomationRule",
            Action::GetAutomationRules => "getAutomationRules",
            Action::UpdateAutomationRule(_) => "updateAutomationRule",
            Action::DeleteAutomationRule(_) => "deleteAutomationRule",
            Action::SaveUser(_) => "saveUser",
            Action::GetUsers => "getUsers",
            Action::DeleteUser(_) => "deleteUser",
            Action::Login(_) => "login",
            Action::VerifySession(_) => "verifySession",
            Action::LogActivity(_) => "logActivity",
            Action::GetActivityLogs(_) => "getActivityLogs",
        }
    }
}

fn decode<T: DeserializeOwned>(action: &'static str, params: Fields) -> Result<T, DispatchError> {
    serde_json::from_value(Value::Object(params))
        .map_err(|source| DispatchError::InvalidParams { action, source })
}

/// Turn query-string pairs into parameters. Values stay strings, except
/// JSON objects and arrays (`rule`, `user`, `updates`), which are decoded.
///
/// Scalars are left alone so ids and passwords that happen to look like
/// numbers keep their type; numeric and boolean fields read them back
/// through [`from_query_text`].
pub fn params_from_query<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|(k, v)| {
            let raw = v.as_ref();
            let value = match raw.trim_start().chars().next() {
                Some('{' | '[') => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
                }
                _ => Value::String(raw.to_owned()),
            };
            (k.into(), value)
        })
        .collect()
}

/// Deserialize a typed field that may arrive as query text: `"22.5"`,
/// `"true"` and `"3"` decode the same as their JSON counterparts.
fn from_query_text<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    let value = match value {
        Value::String(text) => {
            serde_json::from_str(text.trim()).unwrap_or(Value::String(text))
        }
        other => other,
    };
    serde_json::from_value(value).map_err(serde::de::Error::custom)
}
