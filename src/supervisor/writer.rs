//! Outbound writer task.
//!
//! Receives [`Message`]s from a tokio [`mpsc`] channel, serialises each to a
//! compact single-line JSON string, and writes the NDJSON line to the
//! agent's `stdin`. The supervisor is the sole writer on the subprocess's
//! stdin; every outbound frame funnels through this task, which preserves
//! program order.

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::Message;
use crate::Result;

/// Writer task — serialises outbound messages and writes them to `stdin`.
///
/// The task exits cleanly when:
/// - `cancel` is triggered (supervisor stop), or
/// - `msg_rx` is closed (all senders dropped), or
/// - a write fails (agent process exited) — pending messages are dropped
///   and the failure is logged; the exit monitor reports the process death.
pub async fn run_writer(
    session_id: String,
    mut stdin: ChildStdin,
    mut msg_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                match msg {
                    None => {
                        debug!(session_id, "writer: message channel closed, stopping");
                        break;
                    }
                    Some(message) => {
                        let mut bytes = message.encode_line().into_bytes();
                        bytes.push(b'\n');

                        if let Err(e) = stdin.write_all(&bytes).await {
                            warn!(session_id, error = %e, "writer: write to stdin failed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
