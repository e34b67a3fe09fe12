//! pulsemon_agent: samples host metrics and ships them to the ingest API,
//! buffering snapshots in an on-disk queue when delivery fails.

mod buffer;
mod client;
mod config;
mod error;
mod metrics;
mod netrate;
mod retry;
mod send;
mod types;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::buffer::Buffer;
use crate::client::Client;
use crate::config::Config;
use crate::error::ClientError;
use crate::types::Snapshot;

const DEFAULT_CONFIG_PATH: &str = "/etc/pulsemon/config.json";
const DEFAULT_STATE_DIR: &str = "/var/lib/pulsemon";
const QUEUE_FILE: &str = "buffer.jsonl";
const LEGACY_QUEUE_FILE: &str = "pending-payloads.jsonl";
const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Parser)]
#[command(name = "pulsemon_agent", version, about = "Host telemetry shipping agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Enroll this host against the server and persist its identity.
    Enroll {
        /// One-time enrollment token issued by the server.
        #[arg(long)]
        token: String,
        /// Ingest server base URL.
        #[arg(long)]
        server: String,
        /// Permit plain http, but only towards loopback addresses.
        #[arg(long)]
        allow_insecure: bool,
    },
    /// Run one delivery cycle: flush the backlog, then send a fresh snapshot.
    Send,
    /// Collect one snapshot and pretty-print it without sending.
    PrintPayload,
    /// Print the agent version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Some(Command::Enroll {
            token,
            server,
            allow_insecure,
        }) => run_enroll(&token, &server, allow_insecure).await,
        Some(Command::Send) => {
            run_send().await;
            Ok(())
        }
        Some(Command::PrintPayload) => run_print_payload(),
        Some(Command::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            println!("pulsemon_agent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn config_path() -> PathBuf {
    std::env::var_os("PULSEMON_AGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn state_dir() -> PathBuf {
    std::env::var_os("PULSEMON_AGENT_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

fn queue_capacity() -> usize {
    std::env::var("PULSEMON_AGENT_BUFFER_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
}

fn build_snapshot(host_id: &str, state_dir: &Path) -> Snapshot {
    let mut snapshot = metrics::collect(state_dir);
    snapshot.host_id = host_id.to_string();
    snapshot.agent_version = env!("CARGO_PKG_VERSION").to_string();
    snapshot
}

/// A cancellation token tied to Ctrl+C, so an in-flight request or backoff
/// sleep aborts promptly instead of running out its budget.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });
    token
}

async fn run_enroll(token: &str, server: &str, allow_insecure: bool) -> anyhow::Result<()> {
    if token.trim().is_empty() {
        bail!("--token is required");
    }
    if server.trim().is_empty() {
        bail!("--server is required");
    }

    let hostname = metrics::hostname();
    let cfg = Config {
        server_url: server.to_string(),
        ..Config::default()
    };
    let client = Client::new(&cfg, allow_insecure);
    let cancel = shutdown_token();

    let response = match client.enroll(token, &hostname, &cancel).await {
        Ok(response) => response,
        Err(e) => return Err(enrollment_error(e)),
    };

    let cfg = Config {
        host_id: response.host_id.clone(),
        host_token: response.host_token,
        server_url: server.to_string(),
        allow_insecure_localhost: allow_insecure,
    };
    config::save(&config_path(), &cfg).context("failed to write config")?;

    println!("Enrolled successfully. Host ID: {}", response.host_id);
    Ok(())
}

/// Turn an enrollment failure into a user-facing error. Expired and
/// already-used tokens get distinct terminal messages.
fn enrollment_error(err: ClientError) -> anyhow::Error {
    match err {
        ClientError::Http { status: 410, .. } => anyhow::anyhow!(
            "enrollment token has expired; generate a new one from the server and retry"
        ),
        ClientError::Http {
            status: 400,
            ref body,
        } if is_token_used_body(body) => {
            anyhow::anyhow!("enrollment token has already been used")
        }
        other => anyhow::Error::new(other).context("enrollment failed"),
    }
}

fn is_token_used_body(body: &str) -> bool {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: String,
    }

    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.to_string(),
    };
    message
        .trim()
        .eq_ignore_ascii_case("enrollment token already used")
}

/// One delivery cycle. Nothing in here may fail the process: every error is
/// logged and the current snapshot is buffered for the next cycle.
async fn run_send() {
    let cfg = match config::load(&config_path()) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "failed to load config; is this host enrolled?");
            return;
        }
    };

    let state_dir = state_dir();
    let snapshot = build_snapshot(&cfg.host_id, &state_dir);

    migrate_legacy_queue(&state_dir.join(QUEUE_FILE), &state_dir.join(LEGACY_QUEUE_FILE));

    let buffer = Buffer::new(state_dir.join(QUEUE_FILE), queue_capacity());
    let client = Client::new(&cfg, cfg.allow_insecure_localhost);
    let cancel = shutdown_token();

    send::run_send_cycle(&client, &buffer, snapshot, &cancel).await;
}

/// Older agent releases queued under a different file name; adopt it when the
/// current queue file does not exist yet.
fn migrate_legacy_queue(current: &Path, legacy: &Path) {
    if current.exists() || !legacy.exists() {
        return;
    }
    if let Err(e) = std::fs::rename(legacy, current) {
        warn!(error = %e, "failed to migrate legacy buffer file");
    }
}

fn run_print_payload() -> anyhow::Result<()> {
    let host_id = match config::load(&config_path()) {
        Ok(cfg) if !cfg.host_id.is_empty() => cfg.host_id,
        Ok(_) => "(not enrolled)".to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => "(not enrolled)".to_string(),
        Err(e) => return Err(e).context("failed to load config"),
    };

    let snapshot = build_snapshot(&host_id, &state_dir());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
