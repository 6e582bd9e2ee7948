//! # outpost
//!
//! Monitor binary: loads settings, connects to every configured server and
//! prints each connection's world events as JSON lines on stdout. Logs go to
//! stderr.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn, Level};

use outpost_core::{ConnectionId, EventRecord, GameLink, MonitorError};
use outpost_engine::MonitorRegistry;
use outpost_link::{Credentials, Session, SessionConfig, WsConnector};
use outpost_settings::{OutpostSettings, ServerEntry};
use outpost_telemetry::{
    init_telemetry, parse_level, MetricsRecorder, TelemetryConfig, TelemetryGuard,
};

/// Live game-server event monitor.
#[derive(Parser, Debug)]
#[command(name = "outpost", about = "Live game-server event monitor")]
struct Cli {
    /// Settings file. Defaults to `~/.outpost/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level (`trace`, `debug`, `info`, `warn`, `error`). Overrides settings.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn telemetry_config(cli: &Cli, settings: &OutpostSettings) -> TelemetryConfig {
    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    let mut module_levels: Vec<(String, Level)> = settings
        .logging
        .module_levels
        .iter()
        .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
        .collect();
    module_levels.sort_by(|a, b| a.0.cmp(&b.0));
    TelemetryConfig {
        log_level: parse_level(level).unwrap_or(Level::INFO),
        module_levels,
        json: cli.json_logs || settings.logging.json,
    }
}

fn load(cli: &Cli) -> Result<OutpostSettings> {
    match &cli.settings {
        Some(path) => outpost_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => outpost_settings::load_settings().context("Failed to load settings"),
    }
}

/// Re-read the settings file and apply its logging levels.
fn reload_logging(cli: &Cli, telemetry: &TelemetryGuard) -> Result<()> {
    let config = telemetry_config(cli, &load(cli)?);
    telemetry.set_level(config.log_level)?;
    for (module, level) in &config.module_levels {
        telemetry.set_module_level(module, *level)?;
    }
    info!(level = %config.log_level, modules = config.module_levels.len(), "logging levels reloaded");
    Ok(())
}

/// Wait for ctrl-c. On unix, SIGHUP reloads logging levels meanwhile.
#[cfg(unix)]
async fn wait_for_shutdown(cli: &Cli, telemetry: &TelemetryGuard) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => return result.context("Failed to listen for ctrl-c"),
            Some(()) = hangup.recv() => {
                if let Err(e) = reload_logging(cli, telemetry) {
                    warn!(error = %e, "failed to reload logging levels");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_cli: &Cli, _telemetry: &TelemetryGuard) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

async fn start_server(
    registry: &MonitorRegistry,
    server: &ServerEntry,
    settings: &OutpostSettings,
    metrics: Arc<MetricsRecorder>,
) -> Result<(Arc<Session>, broadcast::Receiver<EventRecord>), MonitorError> {
    let connection_id = ConnectionId::new();
    let connector = Arc::new(WsConnector::new(settings.polling.request_timeout()));
    let session = Arc::new(
        Session::new(
            connection_id.clone(),
            connector,
            SessionConfig::from(&settings.link),
        )
        .with_metrics(metrics),
    );
    let credentials = Credentials {
        player_id: server.player_id,
        player_token: server.player_token,
    };
    session.connect(&server.endpoint, credentials).await?;
    info!(server = %server.id, %connection_id, endpoint = %server.endpoint, "connected");

    let link: Arc<dyn GameLink> = session.clone();
    let stream = registry.start(connection_id, link, settings)?;
    Ok((session, stream))
}

async fn print_events(server: String, mut stream: broadcast::Receiver<EventRecord>) {
    loop {
        match stream.recv().await {
            Ok(record) => match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(%server, error = %e, "failed to encode event"),
            },
            Err(RecvError::Lagged(n)) => warn!(%server, skipped = n, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load(&cli)?;
    let telemetry =
        init_telemetry(telemetry_config(&cli, &settings)).context("Failed to initialize logging")?;
    let metrics = telemetry.metrics();

    if settings.servers.is_empty() {
        anyhow::bail!("no servers configured");
    }

    let registry = MonitorRegistry::new().with_metrics(metrics.clone());
    let mut sessions = Vec::with_capacity(settings.servers.len());
    let mut printers = Vec::with_capacity(settings.servers.len());
    for server in &settings.servers {
        match start_server(&registry, server, &settings, metrics.clone()).await {
            Ok((session, stream)) => {
                sessions.push(session);
                printers.push(tokio::spawn(print_events(server.id.clone(), stream)));
            }
            Err(e) => error!(server = %server.id, error = %e, "failed to start monitor"),
        }
    }
    if sessions.is_empty() {
        anyhow::bail!("no configured server could be reached");
    }
    info!(monitors = registry.len(), "outpost running");

    wait_for_shutdown(&cli, &telemetry).await?;
    info!("shutting down");

    for connection_id in registry.ids() {
        if let Some(polls) = registry.poll_summary(&connection_id) {
            info!(
                %connection_id,
                polls = polls.count,
                p50_ms = polls.p50,
                p95_ms = polls.p95,
                "poll latency"
            );
        }
    }

    let stopped = registry.stop_all();
    for session in &sessions {
        session.disconnect();
    }
    for printer in printers {
        printer.abort();
    }
    for sample in metrics.snapshot() {
        debug!(name = %sample.name, labels = ?sample.labels, value = sample.value, "metric");
    }
    info!(stopped, "shutdown complete");
    Ok(())
}
