use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

// ---------------------------------------------------------------------------
// TelemetrySourceConfig
// ---------------------------------------------------------------------------

/// Where the dashboard session gets sensor values from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetrySourceConfig {
    Synthetic,
    /// NDJSON device feed at `host:port`.
    Feed(String),
}

impl FromStr for TelemetrySourceConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "synthetic" => Ok(Self::Synthetic),
            other => match other.strip_prefix("feed:") {
                Some(addr) if addr.contains(':') => Ok(Self::Feed(addr.to_owned())),
                Some(addr) => Err(anyhow::anyhow!("feed address must be host:port, got {addr:?}")),
                None => Err(anyhow::anyhow!("unknown telemetry source: {other:?}")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Postgres row store when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub coalesce_window: Duration,
    pub hub_api_url: String,
    /// Sync client request timeout, 1..=9 seconds.
    pub request_timeout: Duration,
    pub telemetry_source: TelemetrySourceConfig,
    pub drift_interval: Duration,
    pub reconnect_delay: Duration,
    /// How often the hub's automation rules are pulled.
    pub rule_refresh: Duration,
    pub session_secret: String,
    pub admin_email: String,
    pub admin_password: String,
    pub state_snapshot_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key).with_context(|| format!("missing required env var: {key}"))
        };
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let server_port: u16 = optional("SERVER_PORT", "8080")
            .parse()
            .context("SERVER_PORT must be a valid port number")?;

        let request_timeout_secs: u64 = optional("REQUEST_TIMEOUT_SECS", "5")
            .parse()
            .context("REQUEST_TIMEOUT_SECS must be a positive integer")?;
        if !(1..=9).contains(&request_timeout_secs) {
            bail!("REQUEST_TIMEOUT_SECS must be between 1 and 9, got {request_timeout_secs}");
        }

        let drift_interval_ms: u64 = optional("DRIFT_INTERVAL_MS", "2000")
            .parse()
            .context("DRIFT_INTERVAL_MS must be a positive integer")?;
        if drift_interval_ms == 0 {
            bail!("DRIFT_INTERVAL_MS must be greater than zero");
        }

        let rule_refresh_secs: u64 = optional("RULE_REFRESH_SECS", "30")
            .parse()
            .context("RULE_REFRESH_SECS must be a positive integer")?;
        if rule_refresh_secs == 0 {
            bail!("RULE_REFRESH_SECS must be greater than zero");
        }

        let session_secret = required("SESSION_SECRET")?;
        if session_secret.is_empty() {
            bail!("SESSION_SECRET must not be empty");
        }

        Ok(Self {
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port,
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            coalesce_window: Duration::from_secs(
                optional("COALESCE_WINDOW_SECS", "60")
                    .parse()
                    .context("COALESCE_WINDOW_SECS must be a positive integer")?,
            ),
            hub_api_url: optional(
                "HUB_API_URL",
                &format!("http://127.0.0.1:{server_port}/exec"),
            ),
            request_timeout: Duration::from_secs(request_timeout_secs),
            telemetry_source: optional("TELEMETRY_SOURCE", "synthetic")
                .parse()
                .context("TELEMETRY_SOURCE must be 'synthetic' or 'feed:<host:port>'")?,
            drift_interval: Duration::from_millis(drift_interval_ms),
            reconnect_delay: Duration::from_secs(
                optional("RECONNECT_DELAY_SECS", "5")
                    .parse()
                    .context("RECONNECT_DELAY_SECS must be a positive integer")?,
            ),
            rule_refresh: Duration::from_secs(rule_refresh_secs),
            session_secret,
            admin_email: optional("ADMIN_EMAIL", "admin@iothub.local"),
            admin_password: optional("ADMIN_PASSWORD", "admin123"),
            state_snapshot_path: lookup("STATE_SNAPSHOT_PATH")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        })
    }
}
