//! Rule evaluation against live sensor values.
//!
//! A pass is triggered by one [`StateEvent::SensorChanged`]. It reads a single
//! snapshot, decides every action up front, then applies them through
//! [`DeviceStateStore::control_device`]. Control actions only ever change
//! actuator state and never emit `SensorChanged`, so applying a pass cannot
//! schedule another one.
//!
//! For the same reason a rule whose trigger is an actuator never fires from
//! the running service. The dashboard refuses to save such rules; ones that
//! arrive from the hub are kept but stay inert.

use std::collections::HashSet;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    db::models::{AutomationRule, Device},
    state::{ControlOptions, DeviceStateStore, StateEvent},
};

/// One decided rule firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleAction {
    pub rule_id: String,
    pub target: String,
    pub state: bool,
}

/// Decide which rules fire after `changed` reported a new value.
///
/// Rules are visited in storage order. A rule is skipped when it is disabled,
/// watches another device, its trigger has no value, its target is missing or
/// already in the requested state, or an earlier rule in the same pass
/// already claimed the target.
pub fn evaluate(changed: &str, devices: &[Device], rules: &[AutomationRule]) -> Vec<RuleAction> {
    let find = |id: &str| devices.iter().find(|d| d.id == id);
    let Some(observed) = find(changed).and_then(Device::trigger_value) else {
        return Vec::new();
    };

    let mut claimed = HashSet::new();
    let mut actions = Vec::new();
    for rule in rules.iter().filter(|r| r.enabled && r.trigger == changed) {
        if !rule.condition.holds(observed, rule.value.as_f64()) {
            continue;
        }
        let Some(target) = find(&rule.action) else {
            warn!(rule_id = %rule.id, target = %rule.action, "Rule targets unknown device");
            continue;
        };
        if claimed.contains(target.id.as_str()) {
            warn!(rule_id = %rule.id, target = %target.id, "Conflicting rule skipped; earlier rule wins");
            continue;
        }
        claimed.insert(target.id.as_str());
        if target.state == Some(rule.action_state) {
            continue;
        }
        actions.push(RuleAction {
            rule_id: rule.id.clone(),
            target: target.id.clone(),
            state: rule.action_state,
        });
    }
    actions
}

pub struct AutomationService {
    store: DeviceStateStore,
}

impl AutomationService {
    pub fn new(store: DeviceStateStore) -> Self {
        Self { store }
    }

    /// Evaluate rules on every sensor change until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        info!("Automation evaluator started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(StateEvent::SensorChanged { id, .. }) => {
                    self.run_pass(&id);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Automation evaluator dropped events");
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("Automation evaluator stopped");
    }

    /// One evaluation pass for a changed sensor. Returns the applied actions.
    pub fn run_pass(&self, changed: &str) -> Vec<RuleAction> {
        let snapshot = self.store.snapshot();
        let actions = evaluate(changed, &snapshot.devices, &snapshot.rules);
        for action in &actions {
            info!(
                rule_id = %action.rule_id,
                target = %action.target,
                state = action.state,
                "Automation rule fired"
            );
            self.store
                .control_device(&action.target, action.state, ControlOptions::default());
        }
        if actions.is_empty() {
            debug!(device_id = changed, "No automation rule fired");
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::{
        db::models::{Condition, SensorValue},
        state::{StoreSnapshot, TelemetryUpdate},
    };

    fn store() -> DeviceStateStore {
        DeviceStateStore::with_demo_data()
    }

    fn set_sensor(store: &DeviceStateStore, id: &str, value: SensorValue) {
        store.apply_telemetry(TelemetryUpdate::Sensor {
            id: id.into(),
            value,
        });
    }

    fn rule(id: &str, trigger: &str, condition: Condition, value: f64, action: &str, state: bool) -> AutomationRule {
        AutomationRule {
            id: id.into(),
            name: id.into(),
            trigger: trigger.into(),
            condition,
            value: SensorValue::Number(value),
            action: action.into(),
            action_state: state,
            enabled: true,
        }
    }

    #[test]
    fn hot_room_turns_ac_on() {
        let store = store();
        set_sensor(&store, "temp1", SensorValue::Number(29.0));
        let service = AutomationService::new(store.clone());

        let fired = service.run_pass("temp1");
        assert_eq!(
            fired,
            vec![RuleAction {
                rule_id: "rule2".into(),
                target: "relay3".into(),
                state: true
            }]
        );
        assert_eq!(store.device("relay3").unwrap().state, Some(true));

        // Already on: a second pass is a no-op.
        assert!(service.run_pass("temp1").is_empty());
    }

    #[test]
    fn threshold_is_strict_for_greater_than() {
        let store = store();
        set_sensor(&store, "temp1", SensorValue::Number(28.0));
        assert!(AutomationService::new(store).run_pass("temp1").is_empty());
    }

    #[test]
    fn disabled_rules_never_fire() {
        let store = store();
        set_sensor(&store, "motion1", SensorValue::Bool(true));
        assert!(AutomationService::new(store.clone()).run_pass("motion1").is_empty());
        assert_eq!(store.device("relay2").unwrap().state, Some(false));
    }

    #[test]
    fn first_rule_wins_on_conflict() {
        let snapshot = crate::state::demo_snapshot();
        let mut devices = snapshot.devices;
        for d in &mut devices {
            if d.id == "temp1" {
                d.value = Some(SensorValue::Number(35.0));
            }
        }
        let rules = vec![
            rule("a", "temp1", Condition::Greater, 30.0, "relay4", true),
            rule("b", "temp1", Condition::Greater, 20.0, "relay4", false),
            rule("c", "temp1", Condition::Greater, 20.0, "relay1", true),
        ];
        let fired: Vec<_> = evaluate("temp1", &devices, &rules)
            .into_iter()
            .map(|a| a.rule_id)
            .collect();
        assert_eq!(fired, vec!["a", "c"]);
    }

    #[test]
    fn dangling_trigger_or_target_is_skipped() {
        let snapshot = crate::state::demo_snapshot();
        let rules = vec![
            rule("x", "ghost", Condition::Greater, 0.0, "relay1", true),
            rule("y", "light1", Condition::Greater, 0.0, "ghost", true),
        ];
        assert!(evaluate("ghost", &snapshot.devices, &rules).is_empty());
        assert!(evaluate("light1", &snapshot.devices, &rules).is_empty());
    }

    #[test]
    fn actuator_triggers_use_state_as_number() {
        let snapshot = crate::state::demo_snapshot();
        let mut devices = snapshot.devices;
        for d in &mut devices {
            if d.id == "relay3" {
                d.state = Some(true);
            }
        }
        let rules = vec![rule("z", "relay3", Condition::Equal, 1.0, "relay4", true)];
        assert_eq!(evaluate("relay3", &devices, &rules).len(), 1);
    }

    #[tokio::test]
    async fn chained_rules_do_not_cascade() {
        // relay1 drives relay2 but only a sensor change ever starts a pass.
        let snapshot = StoreSnapshot {
            devices: crate::state::demo_snapshot().devices,
            rules: vec![
                rule("r1", "light1", Condition::Greater, 100.0, "relay1", true),
                rule("r2", "relay1", Condition::Equal, 1.0, "relay2", true),
            ],
        };
        let store = DeviceStateStore::new(snapshot);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(AutomationService::new(store.clone()).run(cancel.clone()));
        time::sleep(Duration::from_millis(20)).await;

        set_sensor(&store, "light1", SensorValue::Number(900.0));
        time::timeout(Duration::from_secs(2), async {
            while store.device("relay1").and_then(|d| d.state) != Some(true) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.device("relay2").unwrap().state, Some(false));

        cancel.cancel();
        handle.await.unwrap();
    }
}
