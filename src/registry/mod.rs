//! Per-user session registry.
//!
//! The registry maintains at most one live session per user. It owns each
//! session (and through it the agent supervisor), wires supervisor events
//! into a single registry-level event stream tagged with `{sessionId,
//! userId}`, routes approval requests to the broker, and reaps idle
//! sessions on a periodic sweep.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalBroker, ApprovalContext, ApprovalDispatch};
use crate::audit::AuditSink;
use crate::config::GlobalConfig;
use crate::ir::{extract_thread_id, extract_turn_id, RawEvent, RunView};
use crate::supervisor::{
    AgentSupervisor, ProcessError, SpawnConfig, SupervisorEvent,
};
use crate::{AppError, Result};

pub use session::{Session, SessionState};

/// Capacity of the per-session supervisor event channel.
const SESSION_EVENT_QUEUE: usize = 256;

/// Registry-level events, fanned out to the client gateway.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A raw agent notification or request, forwarded verbatim.
    SessionEvent {
        session_id: String,
        user_id: String,
        event: RawEvent,
    },
    /// The session's run view changed.
    IrUpdate {
        session_id: String,
        user_id: String,
        view: RunView,
    },
    /// A manual approval awaits the user's decision.
    ApprovalRequest {
        session_id: String,
        user_id: String,
        payload: Value,
    },
    /// A classified process error.
    SessionError {
        session_id: String,
        user_id: String,
        error: ProcessError,
    },
    /// The agent process exited.
    Exited {
        session_id: String,
        user_id: String,
        exit_code: Option<i32>,
        reason: String,
    },
}

/// Maintains the per-user session population; see the module docs.
pub struct SessionRegistry {
    config: Arc<GlobalConfig>,
    broker: ApprovalBroker,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events_tx: mpsc::Sender<RegistryEvent>,
    cancel: CancellationToken,
}

impl SessionRegistry {
    /// Build a registry.
    ///
    /// Registry-level events are published through `events_tx`; the gateway
    /// owns the receiving end. The broker's `approval/request` dispatches
    /// are folded into the same stream by a forwarding task.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        audit: Arc<dyn AuditSink>,
        events_tx: mpsc::Sender<RegistryEvent>,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<ApprovalDispatch>(SESSION_EVENT_QUEUE);
        let broker = ApprovalBroker::new(&config.approval, audit, dispatch_tx);

        let registry = Arc::new(Self {
            config,
            broker,
            sessions: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            events_tx: events_tx.clone(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(forward_approval_dispatches(dispatch_rx, events_tx));
        registry.clone().spawn_idle_sweep();

        registry
    }

    /// The approval broker shared by all sessions.
    #[must_use]
    pub fn broker(&self) -> &ApprovalBroker {
        &self.broker
    }

    /// Resolve the live session for `user_id`, creating one if necessary.
    ///
    /// Race-free: two concurrent calls for the same user yield the same
    /// session. Creation spawns the supervisor, runs the
    /// initialize/initialized handshake, and registers the session only
    /// after both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`] when the spawn or handshake fails; the
    /// failed session is not retained.
    pub async fn get_or_create(&self, user_id: &str) -> Result<Arc<Session>> {
        // Serialize creation per user; lookups for other users proceed.
        let user_lock = {
            let mut locks = self.creation_locks.lock().await;
            Arc::clone(locks.entry(user_id.to_owned()).or_default())
        };
        let _guard = user_lock.lock().await;

        if let Some(session) = self.sessions.lock().await.get(user_id) {
            if session.state() != SessionState::Closed {
                return Ok(Arc::clone(session));
            }
        }

        let session = self.create_session(user_id).await?;
        self.sessions
            .lock()
            .await
            .insert(user_id.to_owned(), Arc::clone(&session));

        info!(
            user_id,
            session_id = session.id.as_str(),
            "session created and ready"
        );
        Ok(session)
    }

    /// Look up a session by its id.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .values()
            .find(|s| s.id == session_id)
            .cloned()
    }

    /// Look up the live session for a user.
    pub async fn get_by_user(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(user_id)
            .filter(|s| s.state() != SessionState::Closed)
            .cloned()
    }

    /// Destroy a session: stop the supervisor, remove the workspace
    /// directory (best effort), and drop the registry entry.
    pub async fn destroy(&self, session_id: &str) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(user_id) = sessions
                .iter()
                .find(|(_, s)| s.id == session_id)
                .map(|(u, _)| u.clone())
            else {
                debug!(session_id, "destroy: session not found");
                return;
            };
            sessions.remove(&user_id)
        };

        if let Some(session) = session {
            session.supervisor.stop().await;
            session.set_state(SessionState::Closed);

            if let Err(err) = tokio::fs::remove_dir_all(&session.working_directory).await {
                warn!(
                    session_id,
                    workspace = %session.working_directory.display(),
                    %err,
                    "failed to remove session workspace, continuing"
                );
            }
            info!(session_id, user_id = session.user_id.as_str(), "session destroyed");
        }
    }

    /// Stop all sessions without deleting workspaces. Used at shutdown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in sessions {
            session.supervisor.stop().await;
            session.set_state(SessionState::Closed);
        }
        info!("registry shut down");
    }

    /// Number of registered sessions (any state).
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    // ── Creation internals ───────────────────────────────────────────────────

    async fn create_session(&self, user_id: &str) -> Result<Arc<Session>> {
        let session_id = Uuid::new_v4().to_string();
        let working_dir = self.config.workspace_root.join(user_id);
        tokio::fs::create_dir_all(&working_dir).await.map_err(|e| {
            AppError::Session(format!(
                "failed to create workspace {}: {e}",
                working_dir.display()
            ))
        })?;

        let spawn_config = SpawnConfig {
            command: self.config.agent_command.clone(),
            args: self.config.agent_args.clone(),
            working_dir: working_dir.clone(),
            extra_env: HashMap::new(),
            max_frame_bytes: self.config.max_frame_bytes,
        };

        let (event_tx, event_rx) = mpsc::channel(SESSION_EVENT_QUEUE);
        let supervisor = AgentSupervisor::start(
            &spawn_config,
            &session_id,
            self.config.request_timeout(),
            event_tx,
        )?;

        // Handshake gates user traffic; a failure closes the session
        // without registering it.
        if let Err(err) = self.handshake(&supervisor).await {
            supervisor.stop().await;
            return Err(err);
        }

        let session = Arc::new(Session::new(
            session_id,
            user_id.to_owned(),
            supervisor,
            working_dir,
        ));
        session.set_state(SessionState::Ready);

        tokio::spawn(consume_supervisor_events(
            Arc::clone(&session),
            event_rx,
            self.broker.clone(),
            self.events_tx.clone(),
        ));

        Ok(session)
    }

    /// Perform the initialize/initialized exchange within its deadline.
    async fn handshake(&self, supervisor: &AgentSupervisor) -> Result<()> {
        let params = json!({
            "clientInfo": {
                "name": "cloud-codex",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        tokio::time::timeout(
            self.config.handshake_timeout(),
            supervisor.call("initialize", params),
        )
        .await
        .map_err(|_| {
            AppError::Session(format!(
                "initialize handshake timed out after {:?}",
                self.config.handshake_timeout()
            ))
        })?
        .map_err(|err| AppError::Session(format!("initialize handshake failed: {err}")))?;

        supervisor
            .notify("initialized", json!({}))
            .await
            .map_err(|err| AppError::Session(format!("initialized notification failed: {err}")))
    }

    // ── Idle sweep ───────────────────────────────────────────────────────────

    /// Spawn the periodic idle sweep task.
    fn spawn_idle_sweep(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("idle sweep: cancellation received, stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_idle().await;
                    }
                }
            }
        });
    }

    /// Destroy sessions idle past the threshold, unless a turn is in flight.
    async fn sweep_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let expired: Vec<String> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.state() != SessionState::Busy && s.idle_for() > idle_timeout)
            .map(|s| s.id.clone())
            .collect();

        for session_id in expired {
            info!(session_id = session_id.as_str(), "idle sweep: reaping session");
            self.destroy(&session_id).await;
        }
    }
}

// ── Event plumbing ────────────────────────────────────────────────────────────

/// Fold broker approval dispatches into the registry event stream.
async fn forward_approval_dispatches(
    mut dispatch_rx: mpsc::Receiver<ApprovalDispatch>,
    events_tx: mpsc::Sender<RegistryEvent>,
) {
    while let Some(dispatch) = dispatch_rx.recv().await {
        let event = RegistryEvent::ApprovalRequest {
            session_id: dispatch.session_id,
            user_id: dispatch.user_id,
            payload: dispatch.payload,
        };
        if events_tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Per-session consumer: re-broadcast supervisor events as registry events,
/// route approval requests to the broker, and track activity/state.
async fn consume_supervisor_events(
    session: Arc<Session>,
    mut event_rx: mpsc::Receiver<SupervisorEvent>,
    broker: ApprovalBroker,
    events_tx: mpsc::Sender<RegistryEvent>,
) {
    let session_id = session.id.clone();
    let user_id = session.user_id.clone();

    while let Some(event) = event_rx.recv().await {
        session.touch();

        match event {
            SupervisorEvent::Event(raw) => {
                // A completed turn releases the busy latch.
                if raw.event_type == "turn/completed" {
                    session.set_state(SessionState::Ready);
                }
                let _ = events_tx
                    .send(RegistryEvent::SessionEvent {
                        session_id: session_id.clone(),
                        user_id: user_id.clone(),
                        event: raw,
                    })
                    .await;
            }
            SupervisorEvent::RunUpdate(view) => {
                let _ = events_tx
                    .send(RegistryEvent::IrUpdate {
                        session_id: session_id.clone(),
                        user_id: user_id.clone(),
                        view,
                    })
                    .await;
            }
            SupervisorEvent::ApprovalRequest {
                rpc_id,
                method,
                params,
            } => {
                let ctx = ApprovalContext {
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                    thread_id: extract_thread_id(&params),
                    turn_id: extract_turn_id(&params),
                };
                if let Err(err) = broker
                    .handle_request(ctx, rpc_id, &method, params, session.supervisor.responder())
                    .await
                {
                    warn!(
                        session_id = session_id.as_str(),
                        %err,
                        "approval request handling failed"
                    );
                }
            }
            SupervisorEvent::ProcessError(error) => {
                let _ = events_tx
                    .send(RegistryEvent::SessionError {
                        session_id: session_id.clone(),
                        user_id: user_id.clone(),
                        error,
                    })
                    .await;
            }
            SupervisorEvent::Exited { exit_code, reason } => {
                session.set_state(SessionState::Closed);
                let _ = events_tx
                    .send(RegistryEvent::Exited {
                        session_id: session_id.clone(),
                        user_id: user_id.clone(),
                        exit_code,
                        reason,
                    })
                    .await;
            }
        }
    }

    debug!(
        session_id = session_id.as_str(),
        "supervisor event channel closed, consumer exiting"
    );
}
