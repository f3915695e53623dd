#![forbid(unsafe_code)]

//! `cloud-codex` — multi-tenant coding-agent gateway binary.
//!
//! Bootstraps configuration, the session registry, the approval broker, and
//! the client gateway, then serves a newline-framed JSON boundary transport
//! over stdin/stdout for a single asserted user. The HTTP/WebSocket
//! boundary server attaches through the library API instead.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloud_codex::audit::{AuditSink, JsonlAuditWriter, MemoryAuditLog, TeeAuditSink};
use cloud_codex::gateway::{ClientFrame, ClientGateway, ServerFrame};
use cloud_codex::registry::SessionRegistry;
use cloud_codex::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "cloud-codex", about = "Coding-agent gateway", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// A missing file is fine — every option has a default.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// User identity asserted for the stdio boundary transport.
    #[arg(long, default_value = "local")]
    user: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("cloud-codex gateway bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(workspace) = args.workspace {
        config.workspace_root = workspace;
    }
    let config = Arc::new(config);
    info!(workspace_root = %config.workspace_root.display(), "configuration loaded");

    // ── Audit sinks ─────────────────────────────────────
    let memory_log: Arc<dyn AuditSink> = Arc::new(MemoryAuditLog::new());
    let audit: Arc<dyn AuditSink> = match &config.audit.log_dir {
        Some(dir) => {
            let jsonl: Arc<dyn AuditSink> = Arc::new(JsonlAuditWriter::new(dir.clone())?);
            Arc::new(TeeAuditSink::new(vec![memory_log, jsonl]))
        }
        None => memory_log,
    };

    // ── Core wiring ─────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel(1024);
    let registry = SessionRegistry::new(Arc::clone(&config), audit, events_tx);
    let gateway = ClientGateway::new(Arc::clone(&registry));
    tokio::spawn(gateway.clone().run_event_pump(events_rx));

    // ── Stdio boundary transport ────────────────────────
    let (client_tx, client_rx) = mpsc::channel::<ServerFrame>(256);
    tokio::spawn(write_outbound_frames(client_rx));

    info!(user = args.user.as_str(), "connecting stdio client");
    gateway.connect(&args.user, client_tx).await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(%err, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => gateway.handle_frame(&args.user, frame).await,
                            Err(err) => {
                                warn!(%err, raw = text.as_str(), "unparseable client frame, skipping");
                            }
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                    Err(err) => {
                        error!(%err, "stdin read error, shutting down");
                        break;
                    }
                }
            }
        }
    }

    gateway.disconnect(&args.user).await;
    registry.shutdown().await;
    info!("goodbye");
    Ok(())
}

/// Print outbound server frames to stdout as NDJSON.
async fn write_outbound_frames(mut client_rx: mpsc::Receiver<ServerFrame>) {
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = client_rx.recv().await {
        match serde_json::to_vec(&frame) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                if stdout.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
            Err(err) => warn!(%err, "failed to serialise outbound frame"),
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    result.map_err(|err| AppError::Config(format!("failed to install tracing subscriber: {err}")))
}
