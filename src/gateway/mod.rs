//! Client gateway adapter.
//!
//! Thin boundary layer between client transports (WebSocket, NDJSON stdio —
//! owned by the boundary server) and the core. Inbound frames carry a small
//! verb set that maps onto registry/supervisor/broker calls; outbound,
//! registry events are translated into server frames and delivered to the
//! per-user client sender registered on connect.
//!
//! | Client → server   | Handling                                   |
//! |-------------------|--------------------------------------------|
//! | `thread/start`    | Forwarded to the session supervisor        |
//! | `thread/resume`   | Forwarded to the session supervisor        |
//! | `turn/start`      | Forwarded; latches the session busy        |
//! | `turn/interrupt`  | Forwarded to the session supervisor        |
//! | `approval/respond`| Routed to the approval broker              |

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::approval::ApprovalDecision;
use crate::registry::{RegistryEvent, SessionRegistry, SessionState};
use crate::{AppError, Result};

/// Client verbs the gateway accepts as supervisor calls.
const CALL_VERBS: &[&str] = &["thread/start", "thread/resume", "turn/start", "turn/interrupt"];

/// One inbound boundary frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    /// Frame verb.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Verb payload.
    #[serde(default)]
    pub payload: Value,
    /// Opaque correlation id echoed on the response.
    #[serde(rename = "requestId", default)]
    pub request_id: Option<Value>,
}

/// One outbound boundary frame.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    /// Frame type: `response`, `event`, `approval/request`, `error`,
    /// `ir/update`.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Frame payload.
    pub payload: Value,
    /// Correlation id, present on `response` and correlated `error` frames.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

impl ServerFrame {
    fn new(frame_type: &str, payload: Value, request_id: Option<Value>) -> Self {
        Self {
            frame_type: frame_type.to_owned(),
            payload,
            request_id,
        }
    }
}

/// Per-user client senders.
type ClientMap = Arc<Mutex<HashMap<String, mpsc::Sender<ServerFrame>>>>;

/// Translates boundary frames to and from core verbs; see the module docs.
#[derive(Clone)]
pub struct ClientGateway {
    registry: Arc<SessionRegistry>,
    clients: ClientMap,
}

impl ClientGateway {
    /// Build a gateway over `registry`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle a new client connection for `user_id`.
    ///
    /// Registers the outbound sender, resolves (or creates) the user's
    /// session, and emits the connected response frame. A reconnect
    /// replaces the previous sender.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`] when session creation fails; no sender
    /// is registered in that case.
    pub async fn connect(&self, user_id: &str, tx: mpsc::Sender<ServerFrame>) -> Result<()> {
        let session = self.registry.get_or_create(user_id).await?;

        self.clients
            .lock()
            .await
            .insert(user_id.to_owned(), tx.clone());

        let frame = ServerFrame::new(
            "response",
            json!({ "status": "connected", "sessionId": session.id }),
            None,
        );
        let _ = tx.send(frame).await;
        Ok(())
    }

    /// Drop the client sender for `user_id`.
    ///
    /// The session itself outlives the connection; the idle sweep bounds
    /// its lifetime.
    pub async fn disconnect(&self, user_id: &str) {
        self.clients.lock().await.remove(user_id);
        debug!(user_id, "client disconnected");
    }

    /// Handle one inbound frame from `user_id`.
    ///
    /// Outcomes — success responses and correlated errors alike — are
    /// delivered through the user's registered sender.
    pub async fn handle_frame(&self, user_id: &str, frame: ClientFrame) {
        let request_id = frame.request_id.clone();

        let outcome = self.dispatch(user_id, frame).await;
        match outcome {
            Ok(Some(payload)) => {
                self.deliver(user_id, ServerFrame::new("response", payload, request_id))
                    .await;
            }
            Ok(None) => {}
            Err(err) => {
                self.deliver(
                    user_id,
                    ServerFrame::new(
                        "error",
                        json!({ "message": err.to_string() }),
                        request_id,
                    ),
                )
                .await;
            }
        }
    }

    /// Dispatch one verb; `Ok(Some(payload))` becomes a response frame.
    async fn dispatch(&self, user_id: &str, frame: ClientFrame) -> Result<Option<Value>> {
        if CALL_VERBS.contains(&frame.frame_type.as_str()) {
            let session = self
                .registry
                .get_by_user(user_id)
                .await
                .ok_or_else(|| AppError::Session(format!("no live session for '{user_id}'")))?;

            let is_turn_start = frame.frame_type == "turn/start";
            if is_turn_start {
                session.set_state(SessionState::Busy);
            }

            let result = session
                .supervisor
                .call(&frame.frame_type, frame.payload)
                .await;

            match result {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    // A failed turn start must not leave the session
                    // latched busy, or the idle sweep would never reap it.
                    if is_turn_start {
                        session.set_state(SessionState::Ready);
                    }
                    Err(err)
                }
            }
        } else if frame.frame_type == "approval/respond" {
            self.handle_approval_response(user_id, &frame.payload).await;
            Ok(None)
        } else {
            Err(AppError::Protocol(format!(
                "unknown frame type '{}'",
                frame.frame_type
            )))
        }
    }

    /// Route an `approval/respond` payload to the broker.
    ///
    /// Malformed payloads, unknown approval ids, and session mismatches are
    /// dropped with an error log — a second response for the same request
    /// must never reach the agent.
    async fn handle_approval_response(&self, user_id: &str, payload: &Value) {
        let Some(session) = self.registry.get_by_user(user_id).await else {
            warn!(user_id, "approval response without live session, dropping");
            return;
        };

        let Some(approval_id) = payload.get("approvalId").and_then(Value::as_str) else {
            warn!(user_id, "approval response missing approvalId, dropping");
            return;
        };
        let decision = match payload.get("decision").and_then(Value::as_str) {
            Some("accept") => ApprovalDecision::Accept,
            Some("decline") => ApprovalDecision::Decline,
            other => {
                warn!(user_id, ?other, "approval response with bad decision, dropping");
                return;
            }
        };
        let accept_settings = payload.get("acceptSettings").cloned();

        if let Err(err) = self
            .registry
            .broker()
            .respond(&session.id, approval_id, decision, accept_settings)
            .await
        {
            warn!(user_id, approval_id, %err, "approval response dropped");
        }
    }

    /// Deliver a frame to the user's client, dropping it when disconnected.
    async fn deliver(&self, user_id: &str, frame: ServerFrame) {
        let sender = self.clients.lock().await.get(user_id).cloned();
        match sender {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    debug!(user_id, "client sender closed, dropping frame");
                    self.clients.lock().await.remove(user_id);
                }
            }
            None => {
                debug!(user_id, "no client connected, dropping frame");
            }
        }
    }

    /// Outbound pump: translate registry events into server frames.
    ///
    /// Runs until the registry event channel closes. Clients observe their
    /// own events in the order the supervisor received them.
    pub async fn run_event_pump(self, mut events_rx: mpsc::Receiver<RegistryEvent>) {
        while let Some(event) = events_rx.recv().await {
            let (user_id, frame) = match event {
                RegistryEvent::SessionEvent {
                    user_id, event, ..
                } => {
                    let payload = json!({ "method": event.event_type, "params": event.payload });
                    (user_id, ServerFrame::new("event", payload, None))
                }
                RegistryEvent::IrUpdate { user_id, view, .. } => {
                    let payload = serde_json::to_value(&view).unwrap_or(Value::Null);
                    (user_id, ServerFrame::new("ir/update", payload, None))
                }
                RegistryEvent::ApprovalRequest {
                    user_id, payload, ..
                } => (user_id, ServerFrame::new("approval/request", payload, None)),
                RegistryEvent::SessionError { user_id, error, .. } => {
                    let payload = serde_json::to_value(&error).unwrap_or(Value::Null);
                    (user_id, ServerFrame::new("error", payload, None))
                }
                RegistryEvent::Exited {
                    user_id,
                    exit_code,
                    reason,
                    ..
                } => {
                    let payload = json!({
                        "method": "session/exit",
                        "params": { "exitCode": exit_code, "reason": reason },
                    });
                    (user_id, ServerFrame::new("event", payload, None))
                }
            };

            self.deliver(&user_id, frame).await;
        }
    }
}
