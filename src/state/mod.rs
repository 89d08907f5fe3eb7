//! In-process view of what the dashboard currently believes about every
//! device and rule.
//!
//! Mutations apply immediately and are announced on a broadcast channel.
//! Background workers (hub sync, telemetry feed, automation) react to those
//! events; nothing here waits on the network.

pub mod sync;
pub mod telemetry;

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::{
    db::models::{
        resolve_device_name, AutomationRule, Condition, Device, DeviceKind, DeviceState,
        SensorType, SensorValue,
    },
    dispatch::{DevicePatch, NewRule, RulePatch},
};

pub use telemetry::TelemetryUpdate;

const EVENT_CAPACITY: usize = 256;

/// Change notifications published by [`DeviceStateStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// A user or rule switched a device; the hub and the device feed should
    /// follow.
    DeviceControlled {
        id: String,
        state: bool,
        brightness: Option<u8>,
        speed: Option<u8>,
    },
    /// A sensor value arrived from a telemetry source.
    SensorChanged { id: String, value: SensorValue },
    /// An actuator reported (or the hub confirmed) a state the store did not
    /// initiate.
    DeviceStateChanged { id: String, state: bool },
}

/// Extra fields carried by a control action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ControlOptions {
    #[serde(default)]
    pub brightness: Option<u8>,
    #[serde(default)]
    pub speed: Option<u8>,
}

/// Serializable contents of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub devices: Vec<Device>,
    pub rules: Vec<AutomationRule>,
}

/// A rule together with the display names of the devices it references.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleView {
    #[serde(flatten)]
    pub rule: AutomationRule,
    pub trigger_name: String,
    pub action_name: String,
}

/// Shared handle; clones see the same state.
#[derive(Debug, Clone)]
pub struct DeviceStateStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<StoreSnapshot>,
    events: broadcast::Sender<StateEvent>,
}

impl DeviceStateStore {
    pub fn new(snapshot: StoreSnapshot) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(snapshot),
                events,
            }),
        }
    }

    /// Store seeded with the demo board layout.
    pub fn with_demo_data() -> Self {
        Self::new(demo_snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    // Lock poisoning only means a panic happened mid-update; every update
    // leaves the snapshot structurally valid, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, StoreSnapshot> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreSnapshot> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: StateEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.read().clone()
    }

    pub fn restore(&self, snapshot: StoreSnapshot) {
        info!(
            devices = snapshot.devices.len(),
            rules = snapshot.rules.len(),
            "Restored dashboard state"
        );
        *self.write() = snapshot;
    }

    pub fn devices(&self) -> Vec<Device> {
        self.read().devices.clone()
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.read().devices.iter().find(|d| d.id == id).cloned()
    }

    pub fn rules(&self) -> Vec<AutomationRule> {
        self.read().rules.clone()
    }

    /// Rules with resolved device names; dangling ids get a fallback name.
    pub fn rule_views(&self) -> Vec<RuleView> {
        let state = self.read();
        state
            .rules
            .iter()
            .map(|rule| RuleView {
                trigger_name: resolve_device_name(&state.devices, &rule.trigger),
                action_name: resolve_device_name(&state.devices, &rule.action),
                rule: rule.clone(),
            })
            .collect()
    }

    pub fn device_name(&self, id: &str) -> String {
        resolve_device_name(&self.read().devices, id)
    }

    /// Replace the device list with what the hub holds. An empty list keeps
    /// the current devices.
    pub fn hydrate_devices(&self, devices: Vec<Device>) -> bool {
        if devices.is_empty() {
            return false;
        }
        info!(count = devices.len(), "Hydrated devices from hub");
        self.write().devices = devices;
        true
    }

    /// Fold the hub's rules into the local list. Hub rules come first, in
    /// hub order, replacing local copies with the same id. Local rules the
    /// hub never reported are kept; ids in `known_remote` that the hub no
    /// longer reports are dropped.
    pub fn merge_hub_rules(&self, remote: Vec<AutomationRule>, known_remote: &HashSet<String>) -> bool {
        let mut guard = self.write();
        let local_only: Vec<AutomationRule> = {
            let remote_ids: HashSet<&str> = remote.iter().map(|r| r.id.as_str()).collect();
            guard
                .rules
                .iter()
                .filter(|r| !remote_ids.contains(r.id.as_str()) && !known_remote.contains(&r.id))
                .cloned()
                .collect()
        };
        let mut merged = remote;
        merged.extend(local_only);
        if merged == guard.rules {
            return false;
        }
        info!(count = merged.len(), "Merged automation rules from hub");
        guard.rules = merged;
        true
    }

    /// Whether `id` names a known relay, LED or motor. Unknown ids are not
    /// actuators.
    pub fn is_actuator(&self, id: &str) -> bool {
        self.read()
            .devices
            .iter()
            .any(|d| d.id == id && !d.kind.is_sensor())
    }

    /// Switch a device. The local record changes before this returns; the
    /// remote write happens later in whoever consumes
    /// [`StateEvent::DeviceControlled`].
    pub fn control_device(&self, id: &str, state: bool, options: ControlOptions) -> Option<Device> {
        let updated = {
            let mut guard = self.write();
            let device = guard.devices.iter_mut().find(|d| d.id == id)?;
            device.state = Some(state);
            if options.brightness.is_some() {
                device.brightness = options.brightness;
            }
            if options.speed.is_some() {
                device.speed = options.speed;
            }
            device.last_updated = Some(Utc::now());
            device.clone()
        };

        debug!(device_id = id, state, "Device controlled");
        self.publish(StateEvent::DeviceControlled {
            id: id.to_owned(),
            state,
            brightness: options.brightness,
            speed: options.speed,
        });
        Some(updated)
    }

    /// Apply one update from a telemetry source. Unknown ids are ignored.
    pub fn apply_telemetry(&self, update: TelemetryUpdate) -> bool {
        let event = {
            let mut guard = self.write();
            let now = Utc::now();
            match update {
                TelemetryUpdate::Sensor { id, value } => {
                    let Some(device) = guard.devices.iter_mut().find(|d| d.id == id) else {
                        return false;
                    };
                    device.value = Some(value);
                    device.last_updated = Some(now);
                    StateEvent::SensorChanged { id, value }
                }
                TelemetryUpdate::State { id, state } => {
                    let Some(device) = guard.devices.iter_mut().find(|d| d.id == id) else {
                        return false;
                    };
                    device.state = Some(state);
                    device.last_updated = Some(now);
                    StateEvent::DeviceStateChanged { id, state }
                }
            }
        };
        self.publish(event);
        true
    }

    /// Take the hub's view of device states after a failed write. Returns
    /// how many local states changed.
    pub fn reconcile_states(&self, remote: Vec<DeviceState>) -> usize {
        let changed: Vec<(String, bool)> = {
            let mut guard = self.write();
            remote
                .into_iter()
                .filter_map(|r| {
                    let state = r.state?;
                    let device = guard.devices.iter_mut().find(|d| d.id == r.id)?;
                    (device.state != Some(state)).then(|| {
                        device.state = Some(state);
                        device.last_updated = r.last_updated.or(device.last_updated);
                        (r.id, state)
                    })
                })
                .collect()
        };
        let count = changed.len();
        for (id, state) in changed {
            self.publish(StateEvent::DeviceStateChanged { id, state });
        }
        count
    }

    pub fn add_device(&self, mut device: Device) -> Device {
        let mut guard = self.write();
        device.id = fresh_id("device", guard.devices.iter().map(|d| d.id.as_str()));
        device.last_updated = Some(Utc::now());
        guard.devices.push(device.clone());
        info!(device_id = %device.id, kind = %device.kind, "Device added");
        device
    }

    pub fn update_device(&self, id: &str, patch: DevicePatch) -> Option<Device> {
        let mut guard = self.write();
        let device = guard.devices.iter_mut().find(|d| d.id == id)?;
        let DevicePatch {
            name,
            kind,
            pin,
            state,
            value,
            unit,
            sensor_type,
            brightness,
            speed,
            ip,
        } = patch;
        if let Some(v) = name {
            device.name = v;
        }
        if let Some(v) = kind {
            device.kind = v;
        }
        device.pin = pin.or(device.pin);
        device.state = state.or(device.state);
        device.value = value.or(device.value);
        device.unit = unit.or(device.unit.take());
        device.sensor_type = sensor_type.or(device.sensor_type);
        device.brightness = brightness.or(device.brightness);
        device.speed = speed.or(device.speed);
        device.ip = ip.or(device.ip.take());
        device.last_updated = Some(Utc::now());
        Some(device.clone())
    }

    pub fn remove_device(&self, id: &str) -> bool {
        let mut guard = self.write();
        let before = guard.devices.len();
        guard.devices.retain(|d| d.id != id);
        before != guard.devices.len()
    }

    /// New rules are always enabled.
    pub fn add_rule(&self, rule: NewRule) -> AutomationRule {
        let mut guard = self.write();
        let rule = AutomationRule {
            id: fresh_id("rule", guard.rules.iter().map(|r| r.id.as_str())),
            name: rule.name,
            trigger: rule.trigger,
            condition: rule.condition,
            value: rule.value,
            action: rule.action,
            action_state: rule.action_state,
            enabled: true,
        };
        guard.rules.push(rule.clone());
        info!(rule_id = %rule.id, "Automation rule added");
        rule
    }

    pub fn update_rule(&self, id: &str, patch: RulePatch) -> Option<AutomationRule> {
        let mut guard = self.write();
        let rule = guard.rules.iter_mut().find(|r| r.id == id)?;
        if let Some(v) = patch.name {
            rule.name = v;
        }
        if let Some(v) = patch.trigger {
            rule.trigger = v;
        }
        if let Some(v) = patch.condition {
            rule.condition = v;
        }
        if let Some(v) = patch.value {
            rule.value = v;
        }
        if let Some(v) = patch.action {
            rule.action = v;
        }
        if let Some(v) = patch.action_state {
            rule.action_state = v;
        }
        if let Some(v) = patch.enabled {
            rule.enabled = v;
        }
        Some(rule.clone())
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut guard = self.write();
        let before = guard.rules.len();
        guard.rules.retain(|r| r.id != id);
        before != guard.rules.len()
    }
}

fn fresh_id<'a>(prefix: &str, taken: impl Iterator<Item = &'a str> + Clone) -> String {
    let mut millis = Utc::now().timestamp_millis();
    loop {
        let id = format!("{prefix}_{millis}");
        if !taken.clone().any(|t| t == id) {
            return id;
        }
        millis += 1;
    }
}

fn actuator(id: &str, name: &str, kind: DeviceKind, pin: u8) -> Device {
    Device {
        name: name.to_owned(),
        pin: Some(pin),
        last_updated: None,
        ..Device::auto_registered(id, kind)
    }
}

fn sensor(id: &str, name: &str, sensor_type: SensorType, pin: u8, value: SensorValue, unit: Option<&str>) -> Device {
    Device {
        name: name.to_owned(),
        pin: Some(pin),
        value: Some(value),
        unit: unit.map(str::to_owned),
        sensor_type: Some(sensor_type),
        last_updated: None,
        ..Device::auto_registered(id, DeviceKind::Sensor)
    }
}

fn rule(id: &str, name: &str, trigger: &str, condition: Condition, value: SensorValue, action: &str, action_state: bool, enabled: bool) -> AutomationRule {
    AutomationRule {
        id: id.to_owned(),
        name: name.to_owned(),
        trigger: trigger.to_owned(),
        condition,
        value,
        action: action.to_owned(),
        action_state,
        enabled,
    }
}

/// The board layout shown before the hub has answered.
pub fn demo_snapshot() -> StoreSnapshot {
    use SensorValue::{Bool, Number};

    let devices = vec![
        actuator("relay1", "Living Room Light", DeviceKind::Relay, 26),
        actuator("relay2", "Kitchen Light", DeviceKind::Relay, 27),
        actuator("relay3", "AC Unit", DeviceKind::Relay, 14),
        actuator("relay4", "Water Pump", DeviceKind::Relay, 12),
        Device {
            brightness: Some(100),
            ..actuator("led1", "RGB LED Strip", DeviceKind::Led, 25)
        },
        Device {
            speed: Some(50),
            ..actuator("motor1", "Curtain Motor", DeviceKind::Motor, 33)
        },
        sensor("temp1", "Temperature Sensor", SensorType::Temperature, 32, Number(25.5), Some("°C")),
        sensor("hum1", "Humidity Sensor", SensorType::Humidity, 32, Number(65.0), Some("%")),
        sensor("light1", "Light Sensor", SensorType::Light, 34, Number(750.0), Some("lux")),
        sensor("motion1", "Motion Sensor", SensorType::Motion, 35, Bool(false), None),
    ];

    let rules = vec![
        rule("rule1", "Auto Light Off", "light1", Condition::Greater, Number(500.0), "relay1", false, true),
        rule("rule2", "AC Auto On", "temp1", Condition::Greater, Number(28.0), "relay3", true, true),
        rule("rule3", "Motion Light", "motion1", Condition::Equal, Bool(true), "relay2", true, false),
    ];

    StoreSnapshot { devices, rules }
}
