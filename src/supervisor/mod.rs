//! Agent subprocess supervision.
//!
//! One [`AgentSupervisor`] owns one coding-agent subprocess: it spawns the
//! process, is the sole reader of its stdout and the sole writer of its
//! stdin, correlates outgoing requests with incoming responses, folds the
//! inbound event stream into the session's IR mapper, and publishes
//! everything up through a single [`mpsc`] event channel handed to
//! [`AgentSupervisor::start`]. The supervisor never calls back into its
//! owner — the registry owns the supervisor and consumes the channel.

pub mod reader;
pub mod spawner;
pub mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::classify_error;
use crate::ir::{RawEvent, RunView};
use crate::protocol::{Message, RpcId};
use crate::{AppError, Result};

pub use spawner::SpawnConfig;

/// Agent-initiated request methods that require an approval decision.
pub const APPROVAL_METHODS: &[&str] = &[
    "item/commandExecution/requestApproval",
    "item/fileChange/requestApproval",
];

/// Capacity of the outbound writer channel.
const WRITER_QUEUE: usize = 64;

/// Pending-request table: outgoing rpc id → response waiter.
pub type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

// ── Events ────────────────────────────────────────────────────────────────────

/// Where a process-error record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Stderr,
    Exit,
    Response,
}

/// A classified process-error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessError {
    /// Stable, user-facing summary derived from `details`.
    pub summary: String,
    /// Raw error text.
    pub details: String,
    /// Origin of the record.
    pub source: ErrorSource,
    /// Timestamp, epoch milliseconds.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

/// Events published by a supervisor to its owner.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// An inbound notification or non-approval request, as a raw event.
    Event(RawEvent),
    /// The IR mapper produced an updated run view.
    RunUpdate(RunView),
    /// The agent asked for an approval decision. The broker must eventually
    /// produce a Response echoing `rpc_id`.
    ApprovalRequest {
        /// Original request id the eventual Response must echo.
        rpc_id: RpcId,
        /// Approval method name.
        method: String,
        /// Request parameters.
        params: Value,
    },
    /// Classified stderr/exit/response error.
    ProcessError(ProcessError),
    /// The agent process exited.
    Exited {
        /// Exit code, if the process was not signalled.
        exit_code: Option<i32>,
        /// Human-readable exit description.
        reason: String,
    },
}

// ── Responder handle ──────────────────────────────────────────────────────────

/// Write-only handle for sending Responses back to the agent.
///
/// Held by the approval broker so it can answer agent-initiated requests
/// without owning the supervisor.
#[derive(Debug, Clone)]
pub struct AgentResponder {
    session_id: String,
    writer_tx: mpsc::Sender<Message>,
}

impl AgentResponder {
    /// Build a responder over a raw writer channel.
    #[must_use]
    pub fn new(session_id: String, writer_tx: mpsc::Sender<Message>) -> Self {
        Self {
            session_id,
            writer_tx,
        }
    }

    /// Send a success Response echoing `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`] when the writer channel is closed
    /// (agent exited).
    pub async fn respond(&self, id: RpcId, result: Value) -> Result<()> {
        let msg = Message::Response {
            id,
            result: Some(result),
            error: None,
        };
        self.writer_tx.send(msg).await.map_err(|_| {
            AppError::Process(format!(
                "agent stream closed for session '{}'",
                self.session_id
            ))
        })
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Owns one agent subprocess's lifecycle and stdio.
#[derive(Debug)]
pub struct AgentSupervisor {
    session_id: String,
    request_timeout: Duration,
    next_id: AtomicI64,
    pending: PendingMap,
    writer_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl AgentSupervisor {
    /// Spawn the agent process and start the reader/writer/stderr/exit tasks.
    ///
    /// All events are published through `event_tx`. After `start` returns,
    /// the caller must complete the `initialize`/`initialized` handshake
    /// before routing user traffic.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`] when the process cannot be spawned or
    /// its stdio cannot be captured.
    pub fn start(
        config: &SpawnConfig,
        session_id: &str,
        request_timeout: Duration,
        event_tx: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Self> {
        let conn = spawner::spawn_agent(config, session_id)?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE);
        let cancel = CancellationToken::new();

        let ctx = reader::ReaderContext::new(
            session_id.to_owned(),
            Arc::clone(&pending),
            event_tx.clone(),
        );
        tokio::spawn(reader::run_reader(
            ctx,
            conn.stdout,
            config.max_frame_bytes,
            cancel.clone(),
        ));
        tokio::spawn(writer::run_writer(
            session_id.to_owned(),
            conn.stdin,
            writer_rx,
            cancel.clone(),
        ));
        tokio::spawn(run_stderr_monitor(
            session_id.to_owned(),
            conn.stderr,
            event_tx.clone(),
            cancel.clone(),
        ));
        spawner::monitor_exit(
            session_id.to_owned(),
            conn.child,
            Arc::clone(&pending),
            event_tx,
            cancel.clone(),
        );

        Ok(Self {
            session_id: session_id.to_owned(),
            request_timeout,
            next_id: AtomicI64::new(1),
            pending,
            writer_tx,
            cancel,
            stopped: AtomicBool::new(false),
        })
    }

    /// Session this supervisor belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write-only handle for answering agent-initiated requests.
    #[must_use]
    pub fn responder(&self) -> AgentResponder {
        AgentResponder {
            session_id: self.session_id.clone(),
            writer_tx: self.writer_tx.clone(),
        }
    }

    /// Send a request to the agent and await its response.
    ///
    /// Requests receive monotonically increasing integer ids. The waiter is
    /// held in the pending table with take-and-remove resolution; when the
    /// deadline lapses the entry is removed and a late response is
    /// discarded by the reader.
    ///
    /// # Errors
    ///
    /// - [`AppError::Session`] — supervisor already stopped.
    /// - [`AppError::Process`] — agent stream closed before responding.
    /// - [`AppError::Timeout`] — no response within the request deadline.
    /// - [`AppError::Rpc`] — the agent answered with an error object.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AppError::Session(format!(
                "supervisor for session '{}' is stopped",
                self.session_id
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = Message::Request {
            id: RpcId::Num(id),
            method: method.to_owned(),
            params: Some(params),
        };
        if self.writer_tx.send(msg).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppError::Process(format!(
                "agent stream closed for session '{}'",
                self.session_id
            )));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::Process(format!(
                "agent exited before responding to '{method}'"
            ))),
            Err(_) => {
                // Deadline lapsed — drop the waiter so a late response is
                // silently discarded by the reader.
                self.pending.lock().await.remove(&id);
                Err(AppError::Timeout(format!(
                    "no response to '{method}' within {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    /// Send a fire-and-forget notification to the agent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`] when the agent stream is closed.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let msg = Message::Notification {
            method: method.to_owned(),
            params: Some(params),
        };
        self.writer_tx.send(msg).await.map_err(|_| {
            AppError::Process(format!(
                "agent stream closed for session '{}'",
                self.session_id
            ))
        })
    }

    /// Stop the supervisor: cancel all tasks, terminate the child process
    /// (5-second grace, then force kill), and reject in-flight waiters.
    ///
    /// Idempotent — a second `stop` is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session_id = self.session_id.as_str(), "supervisor stopping");
        self.cancel.cancel();
        reject_pending(&self.pending, &self.session_id, "supervisor stopped").await;
    }
}

/// Reject and drain every pending waiter.
pub(crate) async fn reject_pending(pending: &PendingMap, session_id: &str, reason: &str) {
    let waiters: Vec<_> = pending.lock().await.drain().collect();
    for (id, tx) in waiters {
        debug!(session_id, id, reason, "rejecting pending request");
        let _ = tx.send(Err(AppError::Process(format!(
            "request {id} aborted: {reason}"
        ))));
    }
}

/// Stderr monitor task — each non-empty line becomes a classified
/// process-error record. Stderr output alone never tears the session down.
pub async fn run_stderr_monitor<R>(
    session_id: String,
    stderr: R,
    event_tx: mpsc::Sender<SupervisorEvent>,
    cancel: CancellationToken,
) where
    R: tokio::io::AsyncBufRead + Unpin + Send,
{
    let mut lines = stderr.lines();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "stderr monitor: cancellation received, stopping");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let record = ProcessError {
                            summary: classify_error(&text),
                            details: text,
                            source: ErrorSource::Stderr,
                            ts: Utc::now().timestamp_millis(),
                            thread_id: None,
                            turn_id: None,
                        };
                        if event_tx
                            .send(SupervisorEvent::ProcessError(record))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(session_id, "stderr monitor: EOF");
                        break;
                    }
                    Err(err) => {
                        warn!(session_id, %err, "stderr monitor: read error, stopping");
                        break;
                    }
                }
            }
        }
    }
}
