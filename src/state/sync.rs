use std::{collections::HashSet, time::Duration};

use anyhow::Result;
use tokio::{
    sync::broadcast::error::RecvError,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ControlOptions, DeviceStateStore, StateEvent};
use crate::client::HubClient;

pub const DEFAULT_RULE_REFRESH: Duration = Duration::from_secs(30);

/// Keeps the dashboard store and the hub in step.
///
/// Local control actions are pushed to the hub; the local state is already
/// updated when an event arrives, and a failed push is followed by a
/// re-fetch of the hub's device states, which then overrides the local
/// view. The hub's automation rules are pulled on a timer so rules saved by
/// other clients reach the evaluator.
pub struct SyncWorker {
    store: DeviceStateStore,
    client: HubClient,
    rule_refresh: Duration,
    /// Rule ids the hub reported on the last successful fetch.
    remote_rules: HashSet<String>,
}

impl SyncWorker {
    pub fn new(store: DeviceStateStore, client: HubClient) -> Self {
        Self {
            store,
            client,
            rule_refresh: DEFAULT_RULE_REFRESH,
            remote_rules: HashSet::new(),
        }
    }

    pub fn with_rule_refresh(mut self, every: Duration) -> Self {
        self.rule_refresh = every;
        self
    }

    /// Pull the hub's device directory and rules into the store. An empty
    /// directory (or an offline hub) leaves the devices as they are.
    /// Returns whether the devices were replaced.
    pub async fn hydrate(&mut self) -> Result<bool> {
        let devices = self.client.get_devices().await?;
        let hydrated = self.store.hydrate_devices(devices);
        self.refresh_rules().await?;
        Ok(hydrated)
    }

    /// Merge the hub's current rules into the store. Skipped while the hub
    /// is unreachable.
    pub async fn refresh_rules(&mut self) -> Result<bool> {
        let rules = self.client.get_automation_rules().await?;
        if !self.client.is_online() {
            return Ok(false);
        }
        let ids = rules.iter().map(|r| r.id.clone()).collect();
        let changed = self.store.merge_hub_rules(rules, &self.remote_rules);
        self.remote_rules = ids;
        Ok(changed)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        let mut refresh = time::interval_at(Instant::now() + self.rule_refresh, self.rule_refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(rule_refresh_secs = self.rule_refresh.as_secs(), "Hub sync worker started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_rules().await {
                        warn!(error = %e, "Failed to refresh automation rules from hub");
                    }
                    continue;
                }
                event = events.recv() => event,
            };
            match event {
                Ok(StateEvent::DeviceControlled {
                    id,
                    state,
                    brightness,
                    speed,
                }) => {
                    self.push(&id, state, ControlOptions { brightness, speed })
                        .await
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sync worker fell behind; reconciling with hub");
                    self.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("Hub sync worker stopped");
    }

    async fn push(&self, device_id: &str, state: bool, options: ControlOptions) {
        match self.client.save_device_state(device_id, state, options).await {
            Ok(()) => {
                let online = self.client.is_online();
                info!(device_id, state, online, "Device state synced");
                if online {
                    self.record_control(device_id, state).await;
                }
            }
            Err(e) => {
                warn!(device_id, error = %e, "Device state sync failed; reconciling");
                self.reconcile().await;
            }
        }
    }

    async fn record_control(&self, device_id: &str, state: bool) {
        let details = format!(
            "{} turned {}",
            self.store.device_name(device_id),
            if state { "on" } else { "off" }
        );
        if let Err(e) = self.client.log_activity("device_control", "dashboard", &details).await {
            debug!(device_id, error = %e, "Control not recorded in activity log");
        }
    }

    async fn reconcile(&self) {
        match self.client.get_device_states().await {
            Ok(states) => {
                let changed = self.store.reconcile_states(states);
                info!(changed, "Reconciled device states with hub");
            }
            Err(e) => error!(error = %e, "Failed to fetch device states from hub"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::{net::TcpListener, time};

    use super::*;
    use crate::automation::AutomationService;

    /// Minimal hub: rejects every `saveDeviceState`, reports relay1 as off.
    async fn spawn_rejecting_hub() -> String {
        let app = Router::new().route(
            "/exec",
            post(|Json(body): Json<Value>| async move {
                match body["action"].as_str() {
                    Some("saveDeviceState") => {
                        Json(json!({"success": false, "error": "Device locked"}))
                    }
                    Some("getDeviceStates") => Json(json!({
                        "success": true,
                        "data": [{"id": "relay1", "name": "Living Room Light", "type": "relay", "state": false}]
                    })),
                    _ => Json(json!({"success": true, "data": []})),
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/exec")
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(3), async {
            while !check() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn failed_push_keeps_optimistic_update_until_reconciled() {
        let store = DeviceStateStore::with_demo_data();
        let client = HubClient::new(spawn_rejecting_hub().await, Duration::from_secs(2)).unwrap();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(SyncWorker::new(store.clone(), client).run(cancel.clone()));
        // Let the worker subscribe before the first event.
        time::sleep(Duration::from_millis(50)).await;

        store.control_device("relay1", true, ControlOptions::default());
        assert_eq!(store.device("relay1").unwrap().state, Some(true));

        let watched = store.clone();
        wait_for(move || watched.device("relay1").and_then(|d| d.state) == Some(false)).await;

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn offline_hub_leaves_local_state_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = DeviceStateStore::with_demo_data();
        let client = HubClient::new(format!("http://{addr}/exec"), Duration::from_secs(1)).unwrap();
        let mut worker = SyncWorker::new(store.clone(), client.clone());
        assert!(!worker.hydrate().await.unwrap());
        assert_eq!(store.rules().len(), 3);
        assert_eq!(store.devices().len(), 10);

        store.control_device("relay2", true, ControlOptions::default());
        worker
            .push("relay2", true, ControlOptions::default())
            .await;
        assert!(!client.is_online());
        assert_eq!(store.device("relay2").unwrap().state, Some(true));
    }

    #[tokio::test]
    async fn hydrate_replaces_demo_devices_and_merges_rules() {
        let app = Router::new().route(
            "/exec",
            post(|Json(body): Json<Value>| async move {
                match body["action"].as_str() {
                    Some("getDevices") => Json(json!({
                        "success": true,
                        "data": [{"id": "esp32", "name": "Esp32", "type": "sensor", "version": 3}]
                    })),
                    Some("getAutomationRules") => Json(json!({
                        "success": true,
                        "data": [hub_rule()]
                    })),
                    _ => Json(json!({"success": true, "data": []})),
                }
            }),
        );
        let hub = serve(app).await;

        let store = DeviceStateStore::with_demo_data();
        let client = HubClient::new(hub, Duration::from_secs(2)).unwrap();
        let mut worker = SyncWorker::new(store.clone(), client);
        assert!(worker.hydrate().await.unwrap());
        assert_eq!(store.devices().len(), 1);

        let rules = store.rules();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].id, "rule_hub");
    }

    fn hub_rule() -> Value {
        json!({
            "id": "rule_hub", "name": "Fan On", "trigger": "temp1", "condition": ">",
            "value": -100, "action": "relay4", "actionState": true, "enabled": true,
            "version": 1
        })
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/exec")
    }

    /// Hub whose rule list can be swapped mid-test; records every action
    /// it receives.
    async fn spawn_recording_hub(
        rules: Arc<Mutex<Vec<Value>>>,
        seen: Arc<Mutex<Vec<Value>>>,
    ) -> String {
        let app = Router::new().route(
            "/exec",
            post(move |Json(body): Json<Value>| {
                let rules = rules.clone();
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(body.clone());
                    match body["action"].as_str() {
                        Some("getAutomationRules") => {
                            let data = rules.lock().unwrap().clone();
                            Json(json!({"success": true, "data": data}))
                        }
                        Some("saveDeviceState") | Some("logActivity") => {
                            Json(json!({"success": true, "message": "ok"}))
                        }
                        _ => Json(json!({"success": true, "data": []})),
                    }
                }
            }),
        );
        serve(app).await
    }

    #[tokio::test]
    async fn hub_rules_are_refreshed_and_drive_automation() {
        let rules = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hub = spawn_recording_hub(rules.clone(), seen).await;

        let store = DeviceStateStore::with_demo_data();
        let client = HubClient::new(hub, Duration::from_secs(2)).unwrap();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(
            SyncWorker::new(store.clone(), client)
                .with_rule_refresh(Duration::from_millis(20))
                .run(cancel.clone()),
        );

        // A rule saved on the hub by another client shows up locally.
        rules.lock().unwrap().push(hub_rule());
        let watched = store.clone();
        wait_for(move || watched.rules().iter().any(|r| r.id == "rule_hub")).await;

        let actions = AutomationService::new(store.clone()).run_pass("temp1");
        assert!(actions.iter().any(|a| a.rule_id == "rule_hub"));
        assert_eq!(store.device("relay4").unwrap().state, Some(true));

        // Deleted on the hub: dropped locally, demo rules untouched.
        rules.lock().unwrap().clear();
        let watched = store.clone();
        wait_for(move || {
            let rules = watched.rules();
            rules.len() == 3 && !rules.iter().any(|r| r.id == "rule_hub")
        })
        .await;

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn synced_control_is_recorded_in_activity_log() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hub = spawn_recording_hub(Arc::new(Mutex::new(Vec::new())), seen.clone()).await;

        let store = DeviceStateStore::with_demo_data();
        let client = HubClient::new(hub, Duration::from_secs(2)).unwrap();
        let worker = SyncWorker::new(store.clone(), client);

        store.control_device("relay3", true, ControlOptions::default());
        worker.push("relay3", true, ControlOptions::default()).await;

        let seen = seen.lock().unwrap();
        let logged = seen
            .iter()
            .find(|b| b["action"] == "logActivity")
            .expect("activity logged");
        assert_eq!(logged["activity"]["action"], "device_control");
        assert_eq!(logged["activity"]["details"], "AC Unit turned on");
    }
}
