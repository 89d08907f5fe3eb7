pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, patch, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use handlers::ApiDoc;

use crate::{dispatch::HubService, state::DeviceStateStore, store::AnyRowStore};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<HubService<AnyRowStore>>,
    pub dashboard: DeviceStateStore,
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/exec", get(handlers::exec_query).post(handlers::exec_body))
        .route(
            "/dashboard/devices",
            get(handlers::dashboard_devices).post(handlers::dashboard_add_device),
        )
        .route(
            "/dashboard/devices/{id}",
            patch(handlers::dashboard_update_device).delete(handlers::dashboard_remove_device),
        )
        .route(
            "/dashboard/rules",
            get(handlers::dashboard_rules).post(handlers::dashboard_add_rule),
        )
        .route(
            "/dashboard/rules/{id}",
            patch(handlers::dashboard_update_rule).delete(handlers::dashboard_remove_rule),
        )
        .route("/dashboard/control", post(handlers::dashboard_control))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
