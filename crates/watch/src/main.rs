//! Command-line progress watcher for PromptLab.
//!
//! Opens one realtime connection, joins the given rooms, and prints every
//! inbound envelope as a JSON line on stdout.  Lifecycle events are logged.
//! Reconnects on its own; exits on Ctrl-C or once retries are exhausted.
//!
//! Usage:
//!   PL_TOKEN=secret pl-watch ws://localhost:8000/ws --room run-42
//!
//! Env vars:
//!   PL_TOKEN   bearer credential (optional)
//!   RUST_LOG   log filter (default: "info")

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pl_realtime::{ConnectionEvent, ConnectionRegistry, RealtimeSettings, WILDCARD_TOPIC};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pl-watch", version, about = "Stream realtime progress updates")]
struct Cli {
    /// WebSocket endpoint, e.g. ws://localhost:8000/ws
    url: String,

    /// Room to join (repeatable).
    #[arg(short, long = "room")]
    rooms: Vec<String>,

    /// Only print envelopes of these types (repeatable).  Default: all.
    #[arg(short, long = "topic")]
    topics: Vec<String>,

    /// Room requested at connect time through the query string.
    #[arg(long)]
    default_room: Option<String>,

    /// Registry key for this connection.
    #[arg(long, default_value = "watch")]
    key: String,

    /// TOML file with a `[realtime]` section.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Bearer credential.
    #[arg(long, env = "PL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    realtime: RealtimeSettings,
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<RealtimeSettings> {
    let Some(path) = path else {
        return Ok(RealtimeSettings::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings file {}", path.display()))?;
    let file: SettingsFile =
        toml::from_str(&raw).with_context(|| format!("parsing settings file {}", path.display()))?;
    Ok(file.realtime)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = load_settings(cli.settings.as_deref())?;

    let mut builder = settings.builder(&cli.url);
    if let Some(room) = &cli.default_room {
        builder = builder.default_room(room);
    }
    let config = builder.build()?;

    let registry = ConnectionRegistry::new();
    registry.set_token(cli.token.clone());
    let conn = registry.get_or_create(&cli.key, config);

    let topics: Arc<Vec<String>> = Arc::new(cli.topics);
    conn.on(WILDCARD_TOPIC, move |envelope| {
        let kind = envelope["type"].as_str().unwrap_or_default();
        if topics.is_empty() || topics.iter().any(|t| t == kind) {
            println!("{envelope}");
        }
    });

    for room in &cli.rooms {
        conn.join_room(room);
    }

    let mut events = conn.subscribe_events();
    tracing::info!(url = %cli.url, key = %cli.key, rooms = ?cli.rooms, "starting watcher");
    conn.connect().await;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected { connection_key }) => {
                    tracing::info!(key = %connection_key, "connected");
                }
                Ok(ConnectionEvent::Disconnected { code, reason }) => {
                    tracing::warn!(code = ?code, reason = %reason, "disconnected");
                }
                Ok(ConnectionEvent::Error { message }) => {
                    tracing::warn!(error = %message, "connection error");
                }
                Ok(ConnectionEvent::ReconnectScheduled { attempt, delay }) => {
                    tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                }
                Ok(ConnectionEvent::ServerError { message }) => {
                    tracing::warn!(message = %message, "server error");
                }
                Ok(ConnectionEvent::ReconnectFailed { attempts }) => {
                    break Err(anyhow::anyhow!("gave up after {attempts} reconnect attempts"));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    registry.disconnect_all();
    tracing::info!("watcher exiting");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_repeated_rooms_and_topics() {
        let cli = Cli::try_parse_from([
            "pl-watch",
            "ws://localhost:8000/ws",
            "--room",
            "a",
            "-r",
            "b",
            "--topic",
            "progress_update",
            "--token",
            "secret",
        ])
        .unwrap();
        assert_eq!(cli.rooms, vec!["a", "b"]);
        assert_eq!(cli.topics, vec!["progress_update"]);
        assert_eq!(cli.key, "watch");
        assert_eq!(cli.token.as_deref(), Some("secret"));
    }

    #[test]
    fn settings_file_section_is_optional() {
        let file: SettingsFile = toml::from_str("").unwrap();
        assert_eq!(file.realtime.max_attempts, 5);

        let file: SettingsFile = toml::from_str("[realtime]\nmax_attempts = 0\n").unwrap();
        assert_eq!(file.realtime.max_attempts, 0);
    }

    #[test]
    fn missing_settings_path_uses_defaults() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.ping_interval_ms, 30_000);
        assert!(load_settings(Some(Path::new("/nonexistent/realtime.toml"))).is_err());
    }
}
