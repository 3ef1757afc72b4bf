//! OpenTelemetry collector extension binary.
//!
//! Registers with the Lambda Extensions API under the executable's file name
//! and runs the configured telemetry pipeline until the sandbox shuts down.
//!
//! # Environment Variables
//!
//! - `OPENTELEMETRY_COLLECTOR_CONFIG_FILE` - pipeline config path or `file:` URI
//! - `OPENTELEMETRY_COLLECTOR_CONFIG_CONTENT` - inline pipeline config
//! - `OPENTELEMETRY_EXTENSION_LOG_LEVEL` - `trace`, `debug`, `info`, `warn` or `error`
//!
//! `RUST_LOG` overrides the log level when set.

use anyhow::{Context, Result};
use opentelemetry_lambda_collector::{Manager, Settings};
use std::path::Path;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_LEVEL: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args()
        .skip(1)
        .any(|arg| arg == "-v" || arg == "--version")
    {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::load();
    let log_level = settings.as_ref().map(|s| s.log_level.clone()).ok();
    init_tracing(log_level.as_deref()).context("failed to initialise tracing subscriber")?;

    let settings = settings.context("failed to load extension settings")?;
    tracing::debug!(?settings, "Settings loaded");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone()).context("failed to install signal handlers")?;

    Manager::new(settings, extension_name())
        .context("failed to create lifecycle manager")?
        .run(cancel)
        .await
        .context("extension failed")?;

    tracing::info!("Extension stopped");
    Ok(())
}

fn extension_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or(env!("CARGO_PKG_NAME"))
        .to_string()
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let configured = log_level.and_then(opentelemetry_lambda_collector::config::parse_log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(configured.map_or(DEFAULT_LOG_LEVEL.to_string(), |l| l.to_string()))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    if let Some(level) = log_level
        && configured.is_none()
    {
        tracing::warn!(level, "Unknown log level, using {DEFAULT_LOG_LEVEL}");
    }
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
            _ = interrupt.recv() => tracing::info!("Received SIGINT"),
        }
        cancel.cancel();
    });
    Ok(())
}
