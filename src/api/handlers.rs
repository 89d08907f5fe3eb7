use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use utoipa::OpenApi;

use super::{
    dto::{ControlRequest, HealthResponse, NewDeviceRequest},
    errors::AppError,
    AppState,
};
use crate::{
    db::models::{AutomationRule, Condition, Device, DeviceKind, SensorType, SensorValue},
    dispatch::{params_from_query, DevicePatch, Envelope, NewRule, RulePatch},
    state::RuleView,
    store::Fields,
};

// ---------------------------------------------------------------------------
// Hub actions
// ---------------------------------------------------------------------------

/// Dispatch an action whose parameters are all in the query string.
///
/// Every outcome, including unknown actions, is a `200` with
/// `success: false` in the envelope.
#[utoipa::path(
    get,
    path = "/exec",
    params(
        ("action" = String, Query, description = "Action name, e.g. `getDevices`"),
    ),
    responses(
        (status = 200, description = "Action envelope", body = Envelope),
    ),
    tag = "hub"
)]
pub async fn exec_query(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Json<Envelope> {
    Json(run_action(&state, params_from_query(pairs)).await)
}

/// Dispatch an action from query parameters merged with a JSON object body.
/// Body fields win over query fields of the same name.
#[utoipa::path(
    post,
    path = "/exec",
    request_body(content = Object, description = "Action parameters, optionally including `action`"),
    responses(
        (status = 200, description = "Action envelope", body = Envelope),
    ),
    tag = "hub"
)]
pub async fn exec_body(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Json<Envelope> {
    let mut params = params_from_query(pairs);
    // Body is read raw: script clients post JSON as text/plain.
    if !body.is_empty() {
        match serde_json::from_slice::<Fields>(&body) {
            Ok(fields) => params.extend(fields),
            Err(e) => return Json(Envelope::failure(format!("Invalid JSON body: {e}"))),
        }
    }
    Json(run_action(&state, params).await)
}

async fn run_action(state: &AppState, mut params: Fields) -> Envelope {
    let action = params.remove("action").map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    });
    state.hub.dispatch(action.as_deref(), params).await
}

// ---------------------------------------------------------------------------
// Dashboard session
// ---------------------------------------------------------------------------

/// Devices as the dashboard session currently sees them.
#[utoipa::path(
    get,
    path = "/dashboard/devices",
    responses(
        (status = 200, description = "Current device list", body = Vec<Device>),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_devices(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(state.dashboard.devices())
}

/// Automation rules with resolved device names.
#[utoipa::path(
    get,
    path = "/dashboard/rules",
    responses(
        (status = 200, description = "Current rules", body = Vec<RuleView>),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_rules(State(state): State<AppState>) -> Json<Vec<RuleView>> {
    Json(state.dashboard.rule_views())
}

/// Switch a device. The returned record already reflects the change; the
/// hub is updated in the background.
#[utoipa::path(
    post,
    path = "/dashboard/control",
    request_body = ControlRequest,
    responses(
        (status = 200, description = "Updated device", body = Device),
        (status = 404, description = "Unknown device id"),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_control(
    State(state): State<AppState>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<Device>, AppError> {
    state
        .dashboard
        .control_device(&req.id, req.state, req.options())
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Device not found: {}", req.id)))
}

/// Add a device to the dashboard session.
#[utoipa::path(
    post,
    path = "/dashboard/devices",
    request_body = NewDeviceRequest,
    responses(
        (status = 201, description = "Device added", body = Device),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_add_device(
    State(state): State<AppState>,
    Json(req): Json<NewDeviceRequest>,
) -> (StatusCode, Json<Device>) {
    let device = state.dashboard.add_device(req.into_device());
    (StatusCode::CREATED, Json(device))
}

#[utoipa::path(
    patch,
    path = "/dashboard/devices/{id}",
    params(("id" = String, Path, description = "Device id")),
    request_body = DevicePatch,
    responses(
        (status = 200, description = "Updated device", body = Device),
        (status = 404, description = "Unknown device id"),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_update_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<DevicePatch>,
) -> Result<Json<Device>, AppError> {
    state
        .dashboard
        .update_device(&id, patch)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Device not found: {id}")))
}

#[utoipa::path(
    delete,
    path = "/dashboard/devices/{id}",
    params(("id" = String, Path, description = "Device id")),
    responses(
        (status = 204, description = "Device removed"),
        (status = 404, description = "Unknown device id"),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_remove_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.dashboard.remove_device(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("Device not found: {id}")))
    }
}

/// Rules only fire on sensor changes, so a rule triggered by an actuator is
/// refused.
fn check_trigger(state: &AppState, trigger: &str) -> Result<(), AppError> {
    if state.dashboard.is_actuator(trigger) {
        return Err(AppError::unprocessable(format!(
            "Rule trigger must be a sensor, {trigger} is an actuator"
        )));
    }
    Ok(())
}

/// Add an automation rule. New rules start enabled.
#[utoipa::path(
    post,
    path = "/dashboard/rules",
    request_body = NewRule,
    responses(
        (status = 201, description = "Rule added", body = AutomationRule),
        (status = 422, description = "Trigger is an actuator"),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_add_rule(
    State(state): State<AppState>,
    Json(rule): Json<NewRule>,
) -> Result<(StatusCode, Json<AutomationRule>), AppError> {
    check_trigger(&state, &rule.trigger)?;
    Ok((StatusCode::CREATED, Json(state.dashboard.add_rule(rule))))
}

/// Change a rule locally. Rules that came from the hub are overwritten by
/// the next rule refresh.
#[utoipa::path(
    patch,
    path = "/dashboard/rules/{id}",
    params(("id" = String, Path, description = "Rule id")),
    request_body = RulePatch,
    responses(
        (status = 200, description = "Updated rule", body = AutomationRule),
        (status = 404, description = "Unknown rule id"),
        (status = 422, description = "Trigger is an actuator"),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<AutomationRule>, AppError> {
    if let Some(trigger) = &patch.trigger {
        check_trigger(&state, trigger)?;
    }
    state
        .dashboard
        .update_rule(&id, patch)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Rule not found: {id}")))
}

#[utoipa::path(
    delete,
    path = "/dashboard/rules/{id}",
    params(("id" = String, Path, description = "Rule id")),
    responses(
        (status = 204, description = "Rule removed"),
        (status = 404, description = "Unknown rule id"),
    ),
    tag = "dashboard"
)]
pub async fn dashboard_remove_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.dashboard.remove_rule(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("Rule not found: {id}")))
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_owned(),
    })
}

// ---------------------------------------------------------------------------
// OpenAPI document
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        exec_query,
        exec_body,
        dashboard_devices,
        dashboard_rules,
        dashboard_control,
        dashboard_add_device,
        dashboard_update_device,
        dashboard_remove_device,
        dashboard_add_rule,
        dashboard_update_rule,
        dashboard_remove_rule,
        health
    ),
    components(schemas(
        Envelope,
        Device,
        DeviceKind,
        SensorType,
        SensorValue,
        AutomationRule,
        Condition,
        RuleView,
        ControlRequest,
        NewDeviceRequest,
        DevicePatch,
        NewRule,
        RulePatch,
        HealthResponse
    )),
    tags(
        (name = "hub", description = "Action-dispatched hub endpoint"),
        (name = "dashboard", description = "Live dashboard session"),
        (name = "system", description = "System endpoints"),
    ),
    info(
        title = "IoT Hub API",
        version = "0.1.0",
        description = "Device directory, telemetry, automation rules and users for ESP32 boards"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};

    use crate::{
        api::{router, AppState},
        dispatch::{HubService, HubSettings},
        state::DeviceStateStore,
        store::{AnyRowStore, MemoryRowStore},
    };

    async fn test_server() -> (TestServer, AppState) {
        let hub = HubService::new(
            AnyRowStore::Memory(MemoryRowStore::new()),
            HubSettings {
                coalesce_window: Duration::from_secs(60),
                session_secret: "test-secret".to_owned(),
                admin_email: "admin@iothub.local".to_owned(),
                admin_password: "admin123".to_owned(),
            },
        )
        .unwrap();
        hub.ensure_default_admin().await.unwrap();
        let state = AppState {
            hub: Arc::new(hub),
            dashboard: DeviceStateStore::with_demo_data(),
        };
        (TestServer::new(router(state.clone())).unwrap(), state)
    }

    // -----------------------------------------------------------------------
    // /exec
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn exec_lists_empty_device_directory() {
        let (server, _) = test_server().await;
        let resp = server.get("/exec").add_query_param("action", "getDevices").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body, json!({"success": true, "data": []}));
    }

    #[tokio::test]
    async fn exec_without_action_is_an_envelope_error() {
        let (server, _) = test_server().await;
        let resp = server.get("/exec").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Missing action parameter");
    }

    #[tokio::test]
    async fn exec_unknown_action_is_not_a_protocol_error() {
        let (server, _) = test_server().await;
        let resp = server
            .get("/exec")
            .add_query_param("action", "doesNotExist")
            .await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(
            body,
            json!({"success": false, "error": "Unknown action: doesNotExist"})
        );
    }

    #[tokio::test]
    async fn exec_query_telemetry_registers_device() {
        let (server, _) = test_server().await;
        let resp = server
            .get("/exec")
            .add_query_param("action", "saveSensorData")
            .add_query_param("deviceId", "esp32_a")
            .add_query_param("value", "21.5")
            .await;
        let body: Value = resp.json();
        assert_eq!(body["success"], true, "{body}");

        let body: Value = server
            .get("/exec")
            .add_query_param("action", "getDevices")
            .await
            .json();
        assert_eq!(body["data"][0]["id"], "esp32_a");
        assert_eq!(body["data"][0]["name"], "Esp32 A");
    }

    #[tokio::test]
    async fn exec_accepts_board_log_alias() {
        let (server, _) = test_server().await;
        let body: Value = server
            .get("/exec")
            .add_query_param("action", "log")
            .add_query_param("temp", "22.5")
            .add_query_param("humidity", "55")
            .add_query_param("motion", "1")
            .await
            .json();
        assert_eq!(body["message"], "Data logged successfully");

        let history = |device_id: &'static str| {
            server
                .get("/exec")
                .add_query_param("action", "getSensorHistory")
                .add_query_param("deviceId", device_id)
        };
        let body: Value = history("temp1").await.json();
        assert_eq!(body["data"][0]["value"], 22.5);
        let body: Value = history("hum1").await.json();
        assert_eq!(body["data"][0]["value"], 55.0);
        let body: Value = history("motion1").await.json();
        assert_eq!(body["data"][0]["value"], true);
        let body: Value = history("esp32").await.json();
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn exec_query_keeps_numeric_looking_strings() {
        let (server, _) = test_server().await;
        let saved: Value = server
            .get("/exec")
            .add_query_param("action", "saveUser")
            .add_query_param(
                "user",
                r#"{"email":"pin","name":"Pin User","password":"123456"}"#,
            )
            .await
            .json();
        assert_eq!(saved["success"], true, "{saved}");

        let login: Value = server
            .get("/exec")
            .add_query_param("action", "login")
            .add_query_param("email", "pin")
            .add_query_param("password", "123456")
            .await
            .json();
        assert_eq!(login["success"], true, "{login}");
        assert_eq!(login["data"]["user"]["email"], "pin@iothub.local");

        let stored: Value = server
            .get("/exec")
            .add_query_param("action", "saveSensorData")
            .add_query_param("deviceId", "101")
            .add_query_param("value", "3")
            .await
            .json();
        assert_eq!(stored["success"], true, "{stored}");

        let devices: Value = server
            .get("/exec")
            .add_query_param("action", "getDevices")
            .await
            .json();
        assert_eq!(devices["data"][0]["id"], "101");
        assert_eq!(devices["data"][0]["value"], 3.0);
    }

    #[tokio::test]
    async fn exec_body_overrides_query() {
        let (server, _) = test_server().await;
        let saved: Value = server
            .post("/exec")
            .json(&json!({
                "action": "saveAutomationRule",
                "rule": {
                    "name": "AC Auto On", "trigger": "temp1", "condition": ">",
                    "value": 28, "action": "relay3", "actionState": true
                }
            }))
            .await
            .json();
        assert!(saved["ruleId"].as_str().unwrap().starts_with("rule_"));

        let body: Value = server
            .post("/exec")
            .add_query_param("action", "getDevices")
            .json(&json!({"action": "getAutomationRules"}))
            .await
            .json();
        assert_eq!(body["data"][0]["name"], "AC Auto On");
        assert_eq!(body["data"][0]["version"], 1);
    }

    #[tokio::test]
    async fn exec_rejects_malformed_body() {
        let (server, _) = test_server().await;
        let resp = server.post("/exec").text("{not json").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["success"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON body"));
    }

    #[tokio::test]
    async fn exec_reads_are_idempotent() {
        let (server, _) = test_server().await;
        for action in ["getDevices", "getAutomationRules", "getActivityLogs"] {
            let a: Value = server.get("/exec").add_query_param("action", action).await.json();
            let b: Value = server.get("/exec").add_query_param("action", action).await.json();
            assert_eq!(a, b, "{action}");
        }
    }

    // -----------------------------------------------------------------------
    // /dashboard
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dashboard_lists_demo_devices() {
        let (server, _) = test_server().await;
        let body: Vec<Value> = server.get("/dashboard/devices").await.json();
        assert_eq!(body.len(), 10);
        assert!(body.iter().any(|d| d["id"] == "motor1" && d["speed"] == 50));
    }

    #[tokio::test]
    async fn dashboard_rules_carry_device_names() {
        let (server, _) = test_server().await;
        let body: Vec<Value> = server.get("/dashboard/rules").await.json();
        let rule = body.iter().find(|r| r["id"] == "rule2").unwrap();
        assert_eq!(rule["triggerName"], "Temperature Sensor");
        assert_eq!(rule["actionName"], "AC Unit");
    }

    #[tokio::test]
    async fn dashboard_control_updates_immediately() {
        let (server, state) = test_server().await;
        let resp = server
            .post("/dashboard/control")
            .json(&json!({"id": "led1", "state": true, "brightness": 30}))
            .await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["state"], true);
        assert_eq!(body["brightness"], 30);
        assert_eq!(state.dashboard.device("led1").unwrap().state, Some(true));
    }

    #[tokio::test]
    async fn dashboard_control_unknown_device_is_404() {
        let (server, _) = test_server().await;
        let resp = server
            .post("/dashboard/control")
            .json(&json!({"id": "nope", "state": true}))
            .await;
        resp.assert_status_not_found();
    }

    #[tokio::test]
    async fn dashboard_device_crud() {
        let (server, state) = test_server().await;
        let resp = server
            .post("/dashboard/devices")
            .json(&json!({"name": "Garage Fan", "type": "fan", "pin": 4}))
            .await;
        resp.assert_status(StatusCode::CREATED);
        let added: Value = resp.json();
        let id = added["id"].as_str().unwrap().to_owned();
        assert!(id.starts_with("device_"));
        assert_eq!(added["state"], false);

        let resp = server
            .patch(&format!("/dashboard/devices/{id}"))
            .json(&json!({"name": "Attic Fan"}))
            .await;
        resp.assert_status_ok();
        assert_eq!(state.dashboard.device(&id).unwrap().name, "Attic Fan");

        server
            .delete(&format!("/dashboard/devices/{id}"))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .delete(&format!("/dashboard/devices/{id}"))
            .await
            .assert_status_not_found();
        server
            .patch("/dashboard/devices/nope")
            .json(&json!({"name": "x"}))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn dashboard_rule_crud() {
        let (server, state) = test_server().await;
        let resp = server
            .post("/dashboard/rules")
            .json(&json!({
                "name": "Dark Lamp", "trigger": "light1", "condition": "<", "value": 50,
                "action": "led1", "actionState": true
            }))
            .await;
        resp.assert_status(StatusCode::CREATED);
        let added: Value = resp.json();
        let id = added["id"].as_str().unwrap().to_owned();
        assert_eq!(added["enabled"], true);
        assert_eq!(state.dashboard.rules().len(), 4);

        let resp = server
            .patch(&format!("/dashboard/rules/{id}"))
            .json(&json!({"enabled": false}))
            .await;
        resp.assert_status_ok();
        let updated: Value = resp.json();
        assert_eq!(updated["enabled"], false);

        server
            .delete(&format!("/dashboard/rules/{id}"))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        assert_eq!(state.dashboard.rules().len(), 3);
        server
            .delete("/dashboard/rules/nope")
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn dashboard_refuses_actuator_triggered_rules() {
        let (server, state) = test_server().await;
        let resp = server
            .post("/dashboard/rules")
            .json(&json!({
                "name": "Chain", "trigger": "relay1", "condition": "==", "value": 1,
                "action": "relay2", "actionState": true
            }))
            .await;
        resp.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(state.dashboard.rules().len(), 3);

        let resp = server
            .patch("/dashboard/rules/rule2")
            .json(&json!({"trigger": "motor1"}))
            .await;
        resp.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let rule2 = state.dashboard.rules().into_iter().find(|r| r.id == "rule2").unwrap();
        assert_eq!(rule2.trigger, "temp1");
    }

    // -----------------------------------------------------------------------
    // System
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_returns_ok() {
        let (server, _) = test_server().await;
        let resp = server.get("/health").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_spec_is_served() {
        let (server, _) = test_server().await;
        let resp = server.get("/api-docs/openapi.json").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["info"]["title"], "IoT Hub API");
        assert!(body["paths"]["/exec"]["post"].is_object());
    }
}
