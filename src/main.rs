mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use obsd_core::{BroadcastBus, BusEvent};
use obsd_session::{SessionId, SessionOptions, SessionRegistry};
use obsd_telemetry::init_telemetry;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::settings::SessionSettings;

/// Supervise connections to one or more OBS instances.
#[derive(Debug, Parser)]
#[command(name = "obsd", version)]
struct Cli {
    /// Settings file (default: ~/.obsd/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect a single session to this WebSocket URI.
    #[arg(long)]
    uri: Option<String>,

    /// Session id used with --uri.
    #[arg(long, default_value = "default")]
    session: String,

    #[arg(long)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from_path(&path)?;

    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    if cli.plain_logs {
        settings.logging.json = false;
    }
    if let Some(uri) = cli.uri {
        let id = SessionId::from(cli.session.as_str());
        settings.sessions.retain(|s| s.id != id);
        settings.sessions.push(SessionSettings {
            id,
            options: SessionOptions::new(uri),
        });
    }

    let _telemetry = init_telemetry(settings.logging.telemetry_config());
    if settings.sessions.is_empty() {
        bail!(
            "no sessions configured; pass --uri or add sessions to {}",
            path.display()
        );
    }

    let bus = BroadcastBus::default();
    let bus_log = tokio::spawn(log_bus_events(bus.subscribe()));
    let registry = SessionRegistry::new(Arc::new(bus));
    for session in settings.sessions {
        registry.start_session(session.id, session.options);
    }
    info!(sessions = registry.list_sessions().len(), "obsd ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    registry.stop_all().await;
    bus_log.abort();
    Ok(())
}

async fn log_bus_events(mut rx: broadcast::Receiver<BusEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                info!(
                    session_id = %event.session_id(),
                    event_type = event.event_type(),
                    %payload,
                    "bus event"
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "bus log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
