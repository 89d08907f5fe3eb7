use std::{panic::AssertUnwindSafe, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    Action, DevicePatch, DispatchError, Envelope, LogSensorDataParams, NewActivity, NewRule,
    NewUser, RulePatch, SaveDeviceStateParams, SaveSensorDataParams, DEFAULT_ACTIVITY_LIMIT,
};
use crate::{
    auth::{hash_password, normalize_login, verify_password, AuthError, SessionSigner},
    db::models::{
        ActivityEntry, AutomationRule, Device, DeviceKind, DeviceState, Role, SensorReading,
        SensorType, SensorValue, User, UserProfile,
    },
    store::{to_fields, Fields, Row, RowStore, StoreError, Table},
};

/// Id of the seeded administrator; this account can never be deleted.
pub const ADMIN_ID: &str = "admin_1";

/// A sensor the board reports in a single `logSensorData` call, stored
/// under its own device id.
struct BoardChannel {
    key: &'static str,
    device_id: &'static str,
    name: &'static str,
    sensor_type: SensorType,
    unit: Option<&'static str>,
}

impl BoardChannel {
    fn device(&self) -> Device {
        let mut device = Device::auto_registered(self.device_id, DeviceKind::Sensor);
        device.name = self.name.to_owned();
        device.sensor_type = Some(self.sensor_type);
        device.unit = self.unit.map(str::to_owned);
        device
    }
}

const BOARD_CHANNELS: [BoardChannel; 4] = [
    BoardChannel {
        key: "temp",
        device_id: "temp1",
        name: "Temperature Sensor",
        sensor_type: SensorType::Temperature,
        unit: Some("°C"),
    },
    BoardChannel {
        key: "humidity",
        device_id: "hum1",
        name: "Humidity Sensor",
        sensor_type: SensorType::Humidity,
        unit: Some("%"),
    },
    BoardChannel {
        key: "light",
        device_id: "light1",
        name: "Light Sensor",
        sensor_type: SensorType::Light,
        unit: Some("lux"),
    },
    BoardChannel {
        key: "motion",
        device_id: "motion1",
        name: "Motion Sensor",
        sensor_type: SensorType::Motion,
        unit: None,
    },
];

const ID_COLUMN: &str = "id";
const MIN_LOGIN_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 6;

pub struct HubSettings {
    pub coalesce_window: Duration,
    pub session_secret: String,
    pub admin_email: String,
    pub admin_password: String,
}

/// A stored record together with the row version clients pass back as
/// `expectedVersion`.
#[derive(Debug, Serialize)]
pub struct Versioned<T> {
    #[serde(flatten)]
    pub record: T,
    pub version: u64,
}

/// Executes hub actions against a [`RowStore`].
pub struct HubService<S> {
    store: S,
    signer: SessionSigner,
    settings: HubSettings,
    /// Serializes check-then-append on the device directory.
    registration: Mutex<()>,
}

impl<S: RowStore> HubService<S> {
    pub fn new(store: S, settings: HubSettings) -> Result<Self, AuthError> {
        let signer = SessionSigner::new(settings.session_secret.as_bytes())?;
        Ok(Self {
            store,
            signer,
            settings,
            registration: Mutex::new(()),
        })
    }

    /// Seed the administrator account if it is missing. Returns whether a
    /// row was written.
    pub async fn ensure_default_admin(&self) -> Result<bool, DispatchError> {
        if self.users().await?.iter().any(|u| u.id == ADMIN_ID) {
            return Ok(false);
        }
        let admin = User {
            id: ADMIN_ID.to_owned(),
            email: self.settings.admin_email.clone(),
            name: "Administrator".to_owned(),
            role: Role::Admin,
            password: hash_password(&self.settings.admin_password)?,
            created_at: Utc::now(),
            is_active: true,
        };
        self.store.append(Table::Users, to_fields(&admin)?).await?;
        info!(email = %admin.email, "Seeded default administrator");
        Ok(true)
    }

    /// Run one request. Never fails: every error, including a panic inside
    /// the handler, comes back as a failed envelope.
    pub async fn dispatch(&self, action: Option<&str>, params: Fields) -> Envelope {
        let Some(name) = action.filter(|a| !a.is_empty()) else {
            return Envelope::failure(DispatchError::MissingAction.to_string());
        };
        let action = match Action::parse(name, params) {
            Ok(action) => action,
            Err(e) => {
                warn!(action = name, error = %e, "Rejected hub request");
                return Envelope::failure(e.to_string());
            }
        };

        let label = action.name();
        match AssertUnwindSafe(self.execute(action)).catch_unwind().await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(e)) => {
                warn!(action = label, error = %e, "Hub action failed");
                Envelope::failure(e.to_string())
            }
            Err(_) => {
                error!(action = label, "Hub action panicked");
                Envelope::failure(format!("Internal error while handling {label}"))
            }
        }
    }

    async fn execute(&self, action: Action) -> Result<Envelope, DispatchError> {
        match action {
            Action::RegisterDevice(p) => self.register_device(p.device).await,
            Action::GetDevices => {
                let devices = self.versioned::<Device>(Table::Devices).await?;
                Ok(Envelope::with_data(json!(devices)))
            }
            Action::UpdateDevice(p) => {
                self.update_device(&p.device_id, p.updates, p.expected_version)
                    .await
            }
            Action::DeleteDevice(p) => {
                self.store
                    .delete_by_key(Table::Devices, ID_COLUMN, &json!(p.device_id))
                    .await
                    .map_err(DispatchError::not_found_as("Device"))?;
                info!(device_id = %p.device_id, "Device deleted");
                Ok(Envelope::with_message("Device deleted"))
            }
            Action::SaveSensorData(p) => self.save_sensor_data(p).await,
            Action::LogSensorData(p) => self.log_sensor_data(p).await,
            Action::GetSensorHistory(p) => {
                let readings: Vec<SensorReading> = self
                    .decoded::<SensorReading>(Table::SensorReadings)
                    .await?
                    .into_iter()
                    .map(|(_, r)| r)
                    .filter(|r| r.device_id == p.device_id)
                    .collect();
                let start = readings.len().saturating_sub(p.limit);
                Ok(Envelope::with_data(json!(&readings[start..])))
            }
            Action::SaveDeviceState(p) => self.save_device_state(p).await,
            Action::GetDeviceStates => {
                let states: Vec<DeviceState> = self
                    .decoded::<Device>(Table::Devices)
                    .await?
                    .into_iter()
                    .map(|(_, d)| d.into())
                    .collect();
                Ok(Envelope::with_data(json!(states)))
            }
            Action::SaveAutomationRule(p) => self.save_rule(p.rule).await,
            Action::GetAutomationRules => {
                let rules = self.versioned::<AutomationRule>(Table::AutomationRules).await?;
                Ok(Envelope::with_data(json!(rules)))
            }
            Action::UpdateAutomationRule(p) => {
                self.update_rule(&p.rule_id, p.updates, p.expected_version)
                    .await
            }
            Action::DeleteAutomationRule(p) => {
                self.store
                    .delete_by_key(Table::AutomationRules, ID_COLUMN, &json!(p.rule_id))
                    .await
                    .map_err(DispatchError::not_found_as("Rule"))?;
                info!(rule_id = %p.rule_id, "Automation rule deleted");
                Ok(Envelope::with_message("Rule deleted"))
            }
            Action::SaveUser(p) => self.save_user(p.user).await,
            Action::GetUsers => {
                let profiles: Vec<UserProfile> =
                    self.users().await?.into_iter().map(Into::into).collect();
                Ok(Envelope::with_data(json!(profiles)))
            }
            Action::DeleteUser(p) => {
                if p.user_id == ADMIN_ID {
                    return Err(DispatchError::Forbidden(
                        "The primary administrator account cannot be deleted".to_owned(),
                    ));
                }
                self.store
                    .delete_by_key(Table::Users, ID_COLUMN, &json!(p.user_id))
                    .await
                    .map_err(DispatchError::not_found_as("User"))?;
                info!(user_id = %p.user_id, "User deleted");
                Ok(Envelope::with_message("User deleted"))
            }
            Action::Login(p) => self.login(&p.email, &p.password).await,
            Action::VerifySession(p) => {
                let user_id = self
                    .signer
                    .verify(&p.token, Utc::now())
                    .map_err(DispatchError::Session)?;
                let user = self
                    .users()
                    .await?
                    .into_iter()
                    .find(|u| u.id == user_id)
                    .ok_or(DispatchError::NotFound("User"))?;
                if !user.is_active {
                    return Err(DispatchError::Forbidden("Account is disabled".to_owned()));
                }
                Ok(Envelope::with_data(json!({ "user": UserProfile::from(user) })))
            }
            Action::LogActivity(p) => {
                let NewActivity {
                    action,
                    user,
                    details,
                } = p.activity;
                self.record_activity(&action, &user, &details).await?;
                Ok(Envelope::with_message("Activity logged"))
            }
            Action::GetActivityLogs(p) => {
                let limit = p.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
                let entries: Vec<ActivityEntry> = self
                    .decoded::<ActivityEntry>(Table::ActivityLog)
                    .await?
                    .into_iter()
                    .rev()
                    .take(limit)
                    .map(|(_, e)| e)
                    .collect();
                Ok(Envelope::with_data(json!(entries)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Devices and telemetry
    // -----------------------------------------------------------------------

    async fn register_device(&self, mut device: Device) -> Result<Envelope, DispatchError> {
        if device.id.trim().is_empty() {
            return Err(DispatchError::Validation("Device id is required".to_owned()));
        }
        device.last_updated = Some(Utc::now());
        let fields = to_fields(&device)?;

        let _guard = self.registration.lock().await;
        let key = json!(device.id);
        match self
            .store
            .update_by_key(Table::Devices, ID_COLUMN, &key, fields.clone(), None)
            .await
        {
            Ok(_) => info!(device_id = %device.id, "Device re-registered"),
            Err(StoreError::NotFound { .. }) => {
                self.store.append(Table::Devices, fields).await?;
                info!(device_id = %device.id, kind = %device.kind, "Device registered");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Envelope::with_message("Device registered"))
    }

    async fn update_device(
        &self,
        device_id: &str,
        patch: DevicePatch,
        expected_version: Option<u64>,
    ) -> Result<Envelope, DispatchError> {
        let mut updates = to_fields(&patch)?;
        if updates.is_empty() {
            return Err(DispatchError::Validation("No fields to update".to_owned()));
        }
        updates.insert("lastUpdated".to_owned(), json!(Utc::now()));
        let row = self
            .store
            .update_by_key(Table::Devices, ID_COLUMN, &json!(device_id), updates, expected_version)
            .await
            .map_err(DispatchError::not_found_as("Device"))?;
        Ok(Envelope::with_data(json!(versioned::<Device>(&row)?)))
    }

    /// Append `prototype` to the directory unless its id is already there.
    async fn ensure_device(&self, prototype: Device) -> Result<bool, DispatchError> {
        let _guard = self.registration.lock().await;
        let known = self
            .store
            .list_all(Table::Devices)
            .await?
            .iter()
            .any(|r| r.fields.get(ID_COLUMN).and_then(Value::as_str) == Some(prototype.id.as_str()));
        if known {
            return Ok(false);
        }
        self.store.append(Table::Devices, to_fields(&prototype)?).await?;
        info!(device_id = %prototype.id, kind = %prototype.kind, "Auto-registered device");
        Ok(true)
    }

    /// Store one reading for a sensor device: register it if needed,
    /// coalesce into its latest row and refresh the directory value.
    async fn record_reading(
        &self,
        prototype: Device,
        value: SensorValue,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let device_id = prototype.id.clone();
        let mut fields = Fields::new();
        fields.insert("value".to_owned(), json!(value));
        if let Some(sensor_type) = prototype.sensor_type {
            fields.insert("sensorType".to_owned(), json!(sensor_type));
        }
        if let Some(unit) = &prototype.unit {
            fields.insert("unit".to_owned(), json!(unit));
        }
        self.ensure_device(prototype).await?;

        let outcome = self
            .store
            .upsert_latest_within_window(
                Table::SensorReadings,
                &device_id,
                at,
                fields,
                self.settings.coalesce_window,
            )
            .await?;

        let mut latest = Fields::new();
        latest.insert("value".to_owned(), json!(value));
        latest.insert("lastUpdated".to_owned(), json!(at));
        self.store
            .update_by_key(Table::Devices, ID_COLUMN, &json!(device_id), latest, None)
            .await?;

        debug!(%device_id, ?outcome, "Sensor data stored");
        Ok(())
    }

    async fn save_sensor_data(&self, p: SaveSensorDataParams) -> Result<Envelope, DispatchError> {
        let timestamp = p.timestamp.unwrap_or_else(Utc::now);
        let mut prototype = Device::auto_registered(&p.device_id, DeviceKind::Sensor);
        prototype.unit = p.unit;
        self.record_reading(prototype, p.value, timestamp).await?;
        Ok(Envelope::with_message("Sensor data saved"))
    }

    async fn log_sensor_data(&self, p: LogSensorDataParams) -> Result<Envelope, DispatchError> {
        let now = Utc::now();

        let readings: Vec<(Device, SensorValue)> = BOARD_CHANNELS
            .iter()
            .filter_map(|channel| {
                let raw = p.raw.get(channel.key)?;
                let value = match channel.sensor_type {
                    SensorType::Motion => SensorValue::Bool(raw_flag(raw)?),
                    _ => SensorValue::Number(raw_number(raw)?),
                };
                Some((channel.device(), value))
            })
            .collect();

        let relays: Vec<(String, bool)> = (1..=4)
            .map(|n| format!("relay{n}"))
            .filter_map(|key| p.raw.get(&key).and_then(raw_flag).map(|on| (key, on)))
            .collect();

        if readings.is_empty() && relays.is_empty() {
            return Err(DispatchError::Validation(
                "No telemetry fields in request".to_owned(),
            ));
        }

        for (device, value) in readings {
            self.record_reading(device, value, now).await?;
        }
        for (relay_id, on) in relays {
            self.set_device_state(&relay_id, on, None, None, now).await?;
        }

        Ok(Envelope::with_message("Data logged successfully"))
    }

    async fn save_device_state(&self, p: SaveDeviceStateParams) -> Result<Envelope, DispatchError> {
        self.set_device_state(&p.device_id, p.state, p.brightness, p.speed, Utc::now())
            .await?;
        Ok(Envelope::with_message("Device state saved"))
    }

    /// Update the state columns of a directory entry, creating a relay
    /// entry for ids never seen before.
    async fn set_device_state(
        &self,
        device_id: &str,
        state: bool,
        brightness: Option<u8>,
        speed: Option<u8>,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let mut updates = Fields::new();
        updates.insert("state".to_owned(), json!(state));
        updates.insert("lastUpdated".to_owned(), json!(at));
        if let Some(b) = brightness {
            updates.insert("brightness".to_owned(), json!(b));
        }
        if let Some(s) = speed {
            updates.insert("speed".to_owned(), json!(s));
        }

        let _guard = self.registration.lock().await;
        match self
            .store
            .update_by_key(Table::Devices, ID_COLUMN, &json!(device_id), updates, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                let mut device = Device::auto_registered(device_id, DeviceKind::Relay);
                device.state = Some(state);
                device.brightness = brightness;
                device.speed = speed;
                device.last_updated = Some(at);
                self.store.append(Table::Devices, to_fields(&device)?).await?;
                info!(device_id, "Auto-registered device from state report");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Automation rules
    // -----------------------------------------------------------------------

    async fn save_rule(&self, rule: NewRule) -> Result<Envelope, DispatchError> {
        for (field, value) in [("name", &rule.name), ("trigger", &rule.trigger), ("action", &rule.action)] {
            if value.trim().is_empty() {
                return Err(DispatchError::Validation(format!("Rule {field} is required")));
            }
        }

        let existing = self.store.list_all(Table::AutomationRules).await?;
        let rule = AutomationRule {
            id: fresh_id("rule", &existing),
            name: rule.name,
            trigger: rule.trigger,
            condition: rule.condition,
            value: rule.value,
            action: rule.action,
            action_state: rule.action_state,
            enabled: rule.enabled.unwrap_or(true),
        };
        let row = self
            .store
            .append(Table::AutomationRules, to_fields(&rule)?)
            .await?;
        info!(rule_id = %rule.id, trigger = %rule.trigger, action = %rule.action, "Automation rule saved");

        let mut envelope = Envelope::with_data(json!(versioned::<AutomationRule>(&row)?));
        envelope.rule_id = Some(rule.id);
        Ok(envelope)
    }

    async fn update_rule(
        &self,
        rule_id: &str,
        patch: RulePatch,
        expected_version: Option<u64>,
    ) -> Result<Envelope, DispatchError> {
        let updates = to_fields(&patch)?;
        if updates.is_empty() {
            return Err(DispatchError::Validation("No fields to update".to_owned()));
        }
        let row = self
            .store
            .update_by_key(
                Table::AutomationRules,
                ID_COLUMN,
                &json!(rule_id),
                updates,
                expected_version,
            )
            .await
            .map_err(DispatchError::not_found_as("Rule"))?;
        info!(rule_id, version = row.version, "Automation rule updated");
        Ok(Envelope::with_data(json!(versioned::<AutomationRule>(&row)?)))
    }

    // -----------------------------------------------------------------------
    // Users and activity
    // -----------------------------------------------------------------------

    async fn save_user(&self, new: NewUser) -> Result<Envelope, DispatchError> {
        if new.email.trim().chars().count() < MIN_LOGIN_LEN {
            return Err(DispatchError::Validation(format!(
                "Login must be at least {MIN_LOGIN_LEN} characters"
            )));
        }
        if new.name.trim().is_empty() {
            return Err(DispatchError::Validation("Name is required".to_owned()));
        }
        if let Some(password) = &new.password {
            check_password(password)?;
        }

        let email = normalize_login(&new.email);
        let users = self.users().await?;
        let own_id = new.id.as_deref();
        let taken = users
            .iter()
            .any(|u| u.email.eq_ignore_ascii_case(&email) && Some(u.id.as_str()) != own_id)
            || (email.eq_ignore_ascii_case(&self.settings.admin_email) && own_id != Some(ADMIN_ID));
        if taken {
            return Err(DispatchError::Validation("Email already in use".to_owned()));
        }

        let existing = own_id.and_then(|id| users.iter().find(|u| u.id == id));
        match existing {
            Some(current) => {
                if current.id == ADMIN_ID
                    && (new.role.is_some_and(|r| r != Role::Admin) || new.is_active == Some(false))
                {
                    return Err(DispatchError::Forbidden(
                        "The primary administrator must remain an active admin".to_owned(),
                    ));
                }
                let mut updates = Fields::new();
                updates.insert("email".to_owned(), json!(email));
                updates.insert("name".to_owned(), json!(new.name));
                if let Some(role) = new.role {
                    updates.insert("role".to_owned(), json!(role));
                }
                if let Some(active) = new.is_active {
                    updates.insert("isActive".to_owned(), json!(active));
                }
                if let Some(password) = &new.password {
                    updates.insert("password".to_owned(), json!(hash_password(password)?));
                }
                let row = self
                    .store
                    .update_by_key(Table::Users, ID_COLUMN, &json!(current.id), updates, None)
                    .await
                    .map_err(DispatchError::not_found_as("User"))?;
                let profile = UserProfile::from(row.decode::<User>()?);
                info!(user_id = %profile.id, "User updated");
                Ok(Envelope {
                    message: Some("User updated".to_owned()),
                    ..Envelope::with_data(json!(profile))
                })
            }
            None => {
                let password = new.password.as_deref().ok_or_else(|| {
                    DispatchError::Validation(format!(
                        "Password must be at least {MIN_PASSWORD_LEN} characters"
                    ))
                })?;
                let rows = self.store.list_all(Table::Users).await?;
                let user = User {
                    id: new.id.unwrap_or_else(|| fresh_id("user", &rows)),
                    email,
                    name: new.name,
                    role: new.role.unwrap_or(Role::User),
                    password: hash_password(password)?,
                    created_at: Utc::now(),
                    is_active: new.is_active.unwrap_or(true),
                };
                self.store.append(Table::Users, to_fields(&user)?).await?;
                info!(user_id = %user.id, role = ?user.role, "User created");
                Ok(Envelope {
                    message: Some("User created".to_owned()),
                    ..Envelope::with_data(json!(UserProfile::from(user)))
                })
            }
        }
    }

    async fn login(&self, login: &str, password: &str) -> Result<Envelope, DispatchError> {
        let email = normalize_login(login);
        let user = self
            .users()
            .await?
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(&email))
            .filter(|u| verify_password(password, &u.password))
            .ok_or(DispatchError::InvalidCredentials)?;
        if !user.is_active {
            return Err(DispatchError::Forbidden(
                "Account is disabled. Contact an administrator.".to_owned(),
            ));
        }

        let token = self.signer.issue(&user.id, Utc::now());
        self.record_activity("login", &user.email, &format!("{} logged in", user.name))
            .await?;
        info!(user_id = %user.id, "User logged in");
        Ok(Envelope::with_data(json!({
            "user": UserProfile::from(user),
            "token": token,
        })))
    }

    async fn record_activity(&self, action: &str, user: &str, details: &str) -> Result<(), DispatchError> {
        let entry = ActivityEntry {
            timestamp: Utc::now(),
            action: action.to_owned(),
            user: user.to_owned(),
            details: details.to_owned(),
        };
        self.store.append(Table::ActivityLog, to_fields(&entry)?).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decoding helpers
    // -----------------------------------------------------------------------

    async fn users(&self) -> Result<Vec<User>, DispatchError> {
        Ok(self
            .decoded::<User>(Table::Users)
            .await?
            .into_iter()
            .map(|(_, u)| u)
            .collect())
    }

    /// Rows of `table` that decode as `T`. Hand-edited rows that no longer
    /// fit the schema are skipped.
    async fn decoded<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<(u64, T)>, DispatchError> {
        let rows = self.store.list_all(table).await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row.decode::<T>() {
                Ok(record) => Some((row.version, record)),
                Err(e) => {
                    warn!(%table, error = %e, "Skipping undecodable row");
                    None
                }
            })
            .collect())
    }

    async fn versioned<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<Versioned<T>>, DispatchError> {
        Ok(self
            .decoded::<T>(table)
            .await?
            .into_iter()
            .map(|(version, record)| Versioned { record, version })
            .collect())
    }
}

fn versioned<T: DeserializeOwned>(row: &Row) -> Result<Versioned<T>, DispatchError> {
    Ok(Versioned {
        record: row.decode()?,
        version: row.version,
    })
}

fn check_password(password: &str) -> Result<(), DispatchError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(DispatchError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// `<prefix>_<unix millis>`, bumped until it does not collide with an
/// existing row id.
fn fresh_id(prefix: &str, rows: &[Row]) -> String {
    let mut millis = Utc::now().timestamp_millis();
    loop {
        let id = format!("{prefix}_{millis}");
        let clash = rows
            .iter()
            .any(|r| r.fields.get(ID_COLUMN).and_then(Value::as_str) == Some(id.as_str()));
        if !clash {
            return id;
        }
        millis += 1;
    }
}

/// Firmware sends numbers either as JSON numbers or as strings.
fn raw_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `1`/`"1"`/`true` are on, `0`/`"0"`/`false` are off.
fn raw_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim() {
            "1" | "true" | "on" => Some(true),
            "0" | "false" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
