//! Agent process spawner.
//!
//! Spawns one coding-agent subprocess per session with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `cwd` set to the session's workspace directory.
//! - The host environment inherited, optionally extended per session.
//! - Piped stdin/stdout/stderr for line-framed JSON-RPC exchange.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chrono::Utc;

use super::{reject_pending, ErrorSource, PendingMap, ProcessError, SupervisorEvent};
use crate::errors::classify_error;
use crate::{AppError, Result};

/// Grace period between the terminate signal and a forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Configuration for spawning an agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent binary (e.g. `codex`).
    pub command: String,
    /// Arguments passed to the agent binary.
    pub args: Vec<String>,
    /// Session workspace; the child process starts in this directory.
    pub working_dir: PathBuf,
    /// Extra environment variables layered over the inherited host
    /// environment.
    pub extra_env: HashMap<String, String>,
    /// Maximum accepted length of one inbound frame line from the agent.
    pub max_frame_bytes: usize,
}

/// Active stdio connection to a spawned agent process.
///
/// The caller is responsible for keeping `child` alive (it has
/// `kill_on_drop(true)`), writing frames through `stdin`, and reading
/// `stdout`/`stderr`.
#[derive(Debug)]
pub struct AgentConnection {
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin for sending JSON-RPC frames.
    pub stdin: ChildStdin,
    /// Agent's stdout for line-by-line NDJSON reading.
    pub stdout: ChildStdout,
    /// Agent's stderr for process-error monitoring.
    pub stderr: BufReader<ChildStderr>,
}

/// Spawn an agent process for `session_id`.
///
/// # Errors
///
/// - `AppError::Session("failed to spawn agent: …")` — OS spawn failure
///   (missing binary, bad working directory).
/// - `AppError::Session("failed to capture …")` — stdio pipe missing.
pub fn spawn_agent(config: &SpawnConfig, session_id: &str) -> Result<AgentConnection> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, val) in &config.extra_env {
        cmd.env(key, val);
    }

    cmd.current_dir(&config.working_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Session(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Session("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Session("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Session("failed to capture agent stderr".into()))?;

    info!(
        session_id,
        command = config.command.as_str(),
        cwd = %config.working_dir.display(),
        "agent process spawned"
    );

    Ok(AgentConnection {
        child,
        stdin,
        stdout,
        stderr: BufReader::new(stderr),
    })
}

/// Spawn a background task that owns the child process handle.
///
/// Two exit paths:
/// - The child exits on its own: the task rejects every pending request
///   waiter, emits a process-error record when the exit was non-zero or
///   signalled, and finishes with [`SupervisorEvent::Exited`].
/// - `cancel` fires (supervisor stop): the task terminates the child,
///   waiting up to a 5-second grace period before forcing a kill, and exits
///   without emitting a terminated event — the caller drives shutdown.
#[must_use]
pub fn monitor_exit(
    session_id: String,
    mut child: Child,
    pending: PendingMap,
    event_tx: mpsc::Sender<SupervisorEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let (exit_code, reason) = match result {
                    Ok(status) => {
                        let code = status.code();
                        let reason = code.map_or_else(
                            || "process terminated by signal".to_owned(),
                            |c| format!("process exited with code {c}"),
                        );
                        (code, reason)
                    }
                    Err(err) => {
                        warn!(session_id, %err, "error waiting for agent child process");
                        (None, format!("wait error: {err}"))
                    }
                };

                reject_pending(&pending, &session_id, &reason).await;

                if exit_code != Some(0) {
                    let record = ProcessError {
                        summary: classify_error(&reason),
                        details: reason.clone(),
                        source: ErrorSource::Exit,
                        ts: Utc::now().timestamp_millis(),
                        thread_id: None,
                        turn_id: None,
                    };
                    let _ = event_tx.send(SupervisorEvent::ProcessError(record)).await;
                }

                let event = SupervisorEvent::Exited {
                    exit_code,
                    reason,
                };
                if event_tx.send(event).await.is_err() {
                    warn!(
                        session_id,
                        "event channel closed before exit event could be delivered"
                    );
                }
            }
            () = cancel.cancelled() => {
                terminate_child(&session_id, &mut child).await;
            }
        }
    })
}

/// Terminate the child with a grace period, then force-kill.
async fn terminate_child(session_id: &str, child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(session_id, %err, "failed to signal agent child process");
        return;
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(exit)) => {
            info!(session_id, ?exit, "agent child process exited");
        }
        Ok(Err(err)) => {
            warn!(session_id, %err, "error waiting for agent child process");
        }
        Err(_) => {
            warn!(
                session_id,
                "agent child did not exit within grace period, forcing kill"
            );
            if let Err(err) = child.kill().await {
                warn!(session_id, %err, "failed to force-kill agent child process");
            }
        }
    }
}
