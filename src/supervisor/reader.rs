//! Inbound reader task.
//!
//! Reads newline-delimited JSON-RPC frames from the agent's stdout, parses
//! each line into a [`Message`], and dispatches it:
//!
//! | Frame          | Handling                                              |
//! |----------------|-------------------------------------------------------|
//! | Response       | Resolves the matching pending waiter (take-and-remove)|
//! | Request        | Approval methods go to the broker via the event tap;  |
//! |                | every request is also folded into the IR mapper       |
//! | Notification   | Folded into the IR mapper, surfaced on the event tap  |
//!
//! Malformed or oversized lines are logged and skipped — they never abort
//! the stream. The reader is the sole consumer of the subprocess's stdout,
//! so IR updates are emitted strictly in arrival order.

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ErrorSource, PendingMap, ProcessError, SupervisorEvent, APPROVAL_METHODS};
use crate::errors::classify_error;
use crate::ir::mapper::IrMapper;
use crate::ir::{extract_thread_id, extract_turn_id, RawEvent};
use crate::protocol::{FrameCodec, Message, RpcId};
use crate::{AppError, Result};

/// Mutable dispatch state owned by the reader task.
pub struct ReaderContext {
    session_id: String,
    pending: PendingMap,
    event_tx: mpsc::Sender<SupervisorEvent>,
    mapper: IrMapper,
    event_seq: u64,
    last_thread_id: Option<String>,
    last_turn_id: Option<String>,
}

impl ReaderContext {
    /// Create a fresh dispatch context for one supervisor.
    #[must_use]
    pub fn new(
        session_id: String,
        pending: PendingMap,
        event_tx: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            session_id,
            pending,
            event_tx,
            mapper: IrMapper::new(),
            event_seq: 0,
            last_thread_id: None,
            last_turn_id: None,
        }
    }

    /// Dispatch one parsed inbound message.
    pub async fn dispatch(&mut self, message: Message) {
        match message {
            Message::Response { id, result, error } => {
                self.dispatch_response(id, result, error).await;
            }
            Message::Request { id, method, params } => {
                let raw = self.make_raw_event(&method, params.clone(), Some(id.clone()));

                if APPROVAL_METHODS.contains(&method.as_str()) {
                    let event = SupervisorEvent::ApprovalRequest {
                        rpc_id: id,
                        method: method.clone(),
                        params: params.unwrap_or(Value::Null),
                    };
                    let _ = self.event_tx.send(event).await;
                } else {
                    let _ = self.event_tx.send(SupervisorEvent::Event(raw.clone())).await;
                }

                self.tap_ir(&raw).await;
            }
            Message::Notification { method, params } => {
                let raw = self.make_raw_event(&method, params, None);
                let _ = self.event_tx.send(SupervisorEvent::Event(raw.clone())).await;
                self.tap_ir(&raw).await;
            }
        }
    }

    /// Resolve the waiter for a response, classifying errors.
    ///
    /// A response whose id has no waiter (already timed out, or never ours)
    /// is discarded with a debug log.
    async fn dispatch_response(
        &mut self,
        id: RpcId,
        result: Option<Value>,
        error: Option<crate::protocol::RpcError>,
    ) {
        // Only integer ids are handed out by the supervisor; ids are opaque,
        // so a string id can never match a pending entry.
        let waiter = match id {
            RpcId::Num(n) => self.pending.lock().await.remove(&n),
            RpcId::Str(_) => None,
        };

        let outcome = match error {
            // Error wins when both result and error are present.
            Some(err) => {
                let summary = classify_error(&err.message);
                let record = ProcessError {
                    summary: summary.clone(),
                    details: err.message.clone(),
                    source: ErrorSource::Response,
                    ts: Utc::now().timestamp_millis(),
                    thread_id: self.last_thread_id.clone(),
                    turn_id: self.last_turn_id.clone(),
                };
                let _ = self
                    .event_tx
                    .send(SupervisorEvent::ProcessError(record))
                    .await;
                Err(AppError::Rpc(format!("{summary} (code {})", err.code)))
            }
            None => Ok(result.unwrap_or(Value::Null)),
        };

        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                debug!(
                    session_id = self.session_id.as_str(),
                    id = %id,
                    "reader: response without pending waiter, discarding"
                );
            }
        }
    }

    /// Construct a [`RawEvent`], assigning a fresh monotonic id and
    /// resolving thread/turn from the payload or the last known values.
    fn make_raw_event(
        &mut self,
        method: &str,
        params: Option<Value>,
        rpc_id: Option<RpcId>,
    ) -> RawEvent {
        self.event_seq += 1;
        let payload = params.unwrap_or(Value::Null);

        let thread_id = extract_thread_id(&payload);
        if thread_id.is_some() {
            self.last_thread_id.clone_from(&thread_id);
        }
        let turn_id = extract_turn_id(&payload);
        if turn_id.is_some() {
            self.last_turn_id.clone_from(&turn_id);
        }

        RawEvent {
            id: format!("evt-{}", self.event_seq),
            ts: Utc::now().timestamp_millis(),
            thread_id: thread_id.or_else(|| self.last_thread_id.clone()),
            turn_id: turn_id.or_else(|| self.last_turn_id.clone()),
            event_type: method.to_owned(),
            payload,
            rpc_id,
        }
    }

    /// Feed a raw event to the IR mapper, emitting a run update if touched.
    async fn tap_ir(&mut self, raw: &RawEvent) {
        if let Some(view) = self.mapper.consume(raw) {
            let _ = self.event_tx.send(SupervisorEvent::RunUpdate(view)).await;
        }
    }
}

/// Reader task — reads NDJSON lines from `stdout` and dispatches them.
///
/// Malformed lines and codec framing errors (line too long) are logged and
/// skipped. Unrecoverable I/O errors stop the reader; the exit monitor
/// reports the process death. On clean EOF the reader simply returns — EOF
/// always accompanies process exit, which the exit monitor surfaces.
pub async fn run_reader<R>(
    mut ctx: ReaderContext,
    stdout: R,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let session_id = ctx.session_id.clone();
    let mut framed = FramedRead::new(stdout, FrameCodec::new(max_frame_bytes));

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id, "reader: EOF detected");
                        break;
                    }

                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(
                            session_id,
                            error = msg.as_str(),
                            "reader: codec framing error, skipping"
                        );
                    }

                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "reader: IO error, stopping");
                        break;
                    }

                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Message::parse(&line) {
                            Ok(message) => ctx.dispatch(message).await,
                            Err(e) => {
                                warn!(
                                    session_id,
                                    error = %e,
                                    raw_line = %line,
                                    "reader: unparseable line, skipping"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
