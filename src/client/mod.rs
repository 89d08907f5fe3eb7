use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::{
    db::models::{AutomationRule, Device, DeviceState, UserProfile},
    dispatch::Envelope,
    state::ControlOptions,
};

/// Error carried by the offline fallback for login-type actions.
pub const DEMO_MODE_ERROR: &str = "Demo mode - remote hub unavailable";

/// Speaks the hub's action vocabulary over HTTP.
///
/// Transport failures (unreachable, timeout, non-2xx, unreadable body) never
/// surface as errors from [`HubClient::call`]; the canned fallback envelope
/// is returned instead and [`HubClient::is_online`] flips to `false`.
#[derive(Debug, Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    endpoint: String,
    online: AtomicBool,
}

/// Successful `login` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginSession {
    pub user: UserProfile,
    pub token: String,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build hub HTTP client")?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoint: endpoint.into(),
                online: AtomicBool::new(true),
            }),
        })
    }

    /// Whether the last call reached the hub.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Relaxed)
    }

    /// Run one action. `params` must be a JSON object (or `null`).
    pub async fn call(&self, action: &str, params: Value) -> Envelope {
        match self.send(action, params).await {
            Ok(envelope) => {
                self.inner.online.store(true, Ordering::Relaxed);
                envelope
            }
            Err(e) => {
                if self.inner.online.swap(false, Ordering::Relaxed) {
                    warn!(action, error = %e, "Hub unreachable; switching to offline fallback");
                } else {
                    debug!(action, error = %e, "Hub still unreachable");
                }
                offline_fallback(action)
            }
        }
    }

    async fn send(&self, action: &str, params: Value) -> Result<Envelope> {
        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => anyhow::bail!("action parameters must be an object, got {other}"),
        };
        body.insert("action".to_owned(), Value::String(action.to_owned()));

        let bytes = self
            .inner
            .http
            .post(&self.inner.endpoint)
            .json(&body)
            .send()
            .await
            .context("Hub request failed")?
            .error_for_status()
            .context("Hub returned error status")?
            .bytes()
            .await
            .context("Failed to read hub response body")?;

        serde_json::from_slice::<Envelope>(&bytes).context("Failed to deserialize hub response")
    }

    pub async fn get_devices(&self) -> Result<Vec<Device>> {
        let data = self
            .call("getDevices", Value::Null)
            .await
            .into_result()
            .context("getDevices failed")?;
        decode_list(data).context("Unexpected getDevices payload")
    }

    pub async fn get_device_states(&self) -> Result<Vec<DeviceState>> {
        let data = self
            .call("getDeviceStates", Value::Null)
            .await
            .into_result()
            .context("getDeviceStates failed")?;
        decode_list(data).context("Unexpected getDeviceStates payload")
    }

    pub async fn get_automation_rules(&self) -> Result<Vec<AutomationRule>> {
        let data = self
            .call("getAutomationRules", Value::Null)
            .await
            .into_result()
            .context("getAutomationRules failed")?;
        decode_list(data).context("Unexpected getAutomationRules payload")
    }

    pub async fn save_device_state(
        &self,
        device_id: &str,
        state: bool,
        options: ControlOptions,
    ) -> Result<()> {
        let mut params = json!({ "deviceId": device_id, "state": state });
        if let Some(b) = options.brightness {
            params["brightness"] = json!(b);
        }
        if let Some(s) = options.speed {
            params["speed"] = json!(s);
        }
        self.call("saveDeviceState", params)
            .await
            .into_result()
            .with_context(|| format!("saveDeviceState failed for {device_id}"))?;
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginSession> {
        let data = self
            .call("login", json!({ "email": email, "password": password }))
            .await
            .into_result()?;
        serde_json::from_value(data).context("Unexpected login payload")
    }

    pub async fn verify_session(&self, token: &str) -> Result<UserProfile> {
        #[derive(Deserialize)]
        struct Verified {
            user: UserProfile,
        }

        let data = self
            .call("verifySession", json!({ "token": token }))
            .await
            .into_result()?;
        let verified: Verified =
            serde_json::from_value(data).context("Unexpected verifySession payload")?;
        Ok(verified.user)
    }

    pub async fn log_activity(&self, action: &str, user: &str, details: &str) -> Result<()> {
        self.call(
            "logActivity",
            json!({ "activity": { "action": action, "user": user, "details": details } }),
        )
        .await
        .into_result()
        .context("logActivity failed")?;
        Ok(())
    }
}

/// Canned answer used when the hub cannot be reached: a descriptive failure
/// for login-type actions, an empty success for everything else.
pub fn offline_fallback(action: &str) -> Envelope {
    match action {
        "login" | "verifySession" => Envelope::failure(DEMO_MODE_ERROR),
        _ => Envelope::with_data(Value::Array(Vec::new())),
    }
}

/// `null` and absent data decode as an empty list.
fn decode_list<T: DeserializeOwned>(data: Value) -> Result<Vec<T>> {
    match data {
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other).context("Failed to decode list"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{net::TcpListener, time};

    use super::*;
    use crate::{
        api::{router, AppState},
        dispatch::{HubService, HubSettings},
        state::DeviceStateStore,
        store::{AnyRowStore, MemoryRowStore},
    };

    async fn spawn_hub() -> String {
        let hub = HubService::new(
            AnyRowStore::Memory(MemoryRowStore::new()),
            HubSettings {
                coalesce_window: Duration::from_secs(60),
                session_secret: "client-test".to_owned(),
                admin_email: "admin@iothub.local".to_owned(),
                admin_password: "admin123".to_owned(),
            },
        )
        .unwrap();
        hub.ensure_default_admin().await.unwrap();
        let app = router(AppState {
            hub: Arc::new(hub),
            dashboard: DeviceStateStore::with_demo_data(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/exec")
    }

    async fn dead_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/exec")
    }

    #[test]
    fn fallback_depends_on_action_kind() {
        assert_eq!(
            offline_fallback("getDevices"),
            Envelope::with_data(json!([]))
        );
        assert_eq!(
            offline_fallback("login").error.as_deref(),
            Some(DEMO_MODE_ERROR)
        );
    }

    #[tokio::test]
    async fn round_trips_against_a_live_hub() {
        let client = HubClient::new(spawn_hub().await, Duration::from_secs(5)).unwrap();

        client
            .save_device_state("relay1", true, ControlOptions::default())
            .await
            .unwrap();
        assert!(client.is_online());

        let states = client.get_device_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].id, "relay1");
        assert_eq!(states[0].state, Some(true));

        let devices = client.get_devices().await.unwrap();
        assert_eq!(devices[0].name, "Relay1");

        let session = client.login("admin", "admin123").await.unwrap();
        let user = client.verify_session(&session.token).await.unwrap();
        assert_eq!(user.id, "admin_1");
    }

    #[tokio::test]
    async fn hub_failures_are_errors_not_fallbacks() {
        let client = HubClient::new(spawn_hub().await, Duration::from_secs(5)).unwrap();
        let err = client.login("admin", "nope").await.unwrap_err();
        assert!(err.to_string().contains("Invalid email or password"));
        assert!(client.is_online());
    }

    #[tokio::test]
    async fn unreachable_hub_falls_back() {
        let client = HubClient::new(dead_endpoint().await, Duration::from_secs(2)).unwrap();

        assert!(client.get_devices().await.unwrap().is_empty());
        assert!(!client.is_online());

        let err = client.login("admin", "admin123").await.unwrap_err();
        assert!(err.to_string().contains(DEMO_MODE_ERROR));
    }

    #[tokio::test]
    async fn hanging_hub_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });

        let client =
            HubClient::new(format!("http://{addr}/exec"), Duration::from_millis(200)).unwrap();
        let envelope = time::timeout(Duration::from_secs(3), client.call("getDevices", Value::Null))
            .await
            .expect("request must not hang past its timeout");
        assert_eq!(envelope, Envelope::with_data(json!([])));
        assert!(!client.is_online());
    }
}
