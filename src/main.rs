use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iot_hub_service::{
    api::{self, AppState},
    automation::AutomationService,
    client::HubClient,
    config::{Config, TelemetrySourceConfig},
    db,
    dispatch::{HubService, HubSettings},
    snapshot_store,
    state::{
        sync::SyncWorker,
        telemetry::{pump, DeviceFeed, SyntheticDrift},
        DeviceStateStore,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    // Hub: action dispatcher over the row store
    let rows = db::open_row_store(config.database_url.as_deref()).await?;
    let hub = HubService::new(
        rows,
        HubSettings {
            coalesce_window: config.coalesce_window,
            session_secret: config.session_secret.clone(),
            admin_email: config.admin_email.clone(),
            admin_password: config.admin_password.clone(),
        },
    )
    .context("failed to initialise session signer")?;
    if hub
        .ensure_default_admin()
        .await
        .context("failed to seed administrator")?
    {
        info!(email = %config.admin_email, "Default administrator created");
    }

    // Dashboard session state
    let dashboard = DeviceStateStore::with_demo_data();
    if let Some(path) = &config.state_snapshot_path {
        if let Some(snapshot) = snapshot_store::load(path).await {
            dashboard.restore(snapshot);
        }
    }

    let cancel = CancellationToken::new();

    // Start HTTP server first so the sync client can reach its own hub
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    let app = api::router(AppState {
        hub: Arc::new(hub),
        dashboard: dashboard.clone(),
    });
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    let client = HubClient::new(&config.hub_api_url, config.request_timeout)?;
    let mut sync = SyncWorker::new(dashboard.clone(), client).with_rule_refresh(config.rule_refresh);
    match sync.hydrate().await {
        Ok(true) => {}
        Ok(false) => info!("Hub has no devices yet; keeping demo devices"),
        Err(e) => warn!(error = %e, "Failed to hydrate from hub"),
    }

    let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(sync.run(cancel.clone()))];

    tasks.push(match &config.telemetry_source {
        TelemetrySourceConfig::Synthetic => {
            info!(interval_ms = config.drift_interval.as_millis() as u64, "Using synthetic telemetry");
            tokio::spawn(pump(
                SyntheticDrift::new(config.drift_interval),
                dashboard.clone(),
                cancel.clone(),
            ))
        }
        TelemetrySourceConfig::Feed(feed_addr) => {
            info!(addr = %feed_addr, "Using device feed telemetry");
            tokio::spawn(pump(
                DeviceFeed::new(feed_addr.clone(), config.reconnect_delay),
                dashboard.clone(),
                cancel.clone(),
            ))
        }
    });

    tasks.push(tokio::spawn(
        AutomationService::new(dashboard.clone()).run(cancel.clone()),
    ));

    shutdown_signal().await;
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    server
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;

    if let Some(path) = &config.state_snapshot_path {
        snapshot_store::save(path, &dashboard.snapshot()).await;
        info!(path = %path.display(), "Dashboard state saved");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
