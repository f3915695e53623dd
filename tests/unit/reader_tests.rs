//! Unit tests for the supervisor's inbound dispatch: waiter resolution,
//! IR tapping, approval routing, error classification.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use cloud_codex::protocol::RpcId;
use cloud_codex::supervisor::reader::{run_reader, ReaderContext};
use cloud_codex::supervisor::{run_stderr_monitor, ErrorSource, PendingMap, SupervisorEvent};
use cloud_codex::AppError;

/// Frame bound for reader tests; generous enough for every scripted line.
const FRAME_LIMIT: usize = 4_096;

/// Drive the reader over a scripted stdout and collect emitted events.
async fn run_over(
    input: &str,
    pending: PendingMap,
) -> Vec<SupervisorEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    let ctx = ReaderContext::new("sess-1".to_owned(), pending, tx);

    run_reader(ctx, input.as_bytes(), FRAME_LIMIT, CancellationToken::new())
        .await
        .expect("reader returns Ok on EOF");

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn empty_pending() -> PendingMap {
    Arc::new(Mutex::new(HashMap::new()))
}

// ── Notifications ─────────────────────────────────────────────────────────────

/// A notification surfaces on the event tap and, when it touches a run,
/// is followed by an IR update.
#[tokio::test]
async fn notification_emits_event_then_run_update() {
    let input = "{\"method\":\"turn/started\",\"params\":{\"threadId\":\"t1\",\"turnId\":\"u1\"}}\n";
    let events = run_over(input, empty_pending()).await;

    assert_eq!(events.len(), 2, "event tap then run update, got: {events:?}");
    match &events[0] {
        SupervisorEvent::Event(raw) => {
            assert_eq!(raw.event_type, "turn/started");
            assert_eq!(raw.thread_id.as_deref(), Some("t1"));
            assert_eq!(raw.id, "evt-1", "monotonic event ids start at 1");
        }
        other => panic!("expected Event first, got: {other:?}"),
    }
    assert!(
        matches!(&events[1], SupervisorEvent::RunUpdate(view) if view.run_id == "t1"),
        "expected RunUpdate second, got: {:?}",
        events[1]
    );
}

/// Events without explicit ids inherit the last known thread and turn.
#[tokio::test]
async fn thread_and_turn_are_inherited() {
    let input = concat!(
        "{\"method\":\"turn/started\",\"params\":{\"threadId\":\"t1\",\"turnId\":\"u1\"}}\n",
        "{\"method\":\"item/started\",\"params\":{\"item\":{\"id\":\"i1\",\"type\":\"reasoning\"}}}\n",
    );
    let events = run_over(input, empty_pending()).await;

    let second_raw = events
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::Event(raw) if raw.event_type == "item/started" => Some(raw),
            _ => None,
        })
        .next()
        .expect("item/started event emitted");

    assert_eq!(second_raw.thread_id.as_deref(), Some("t1"));
    assert_eq!(second_raw.turn_id.as_deref(), Some("u1"));
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// An approval request routes to the broker surface with its original rpc
/// id, and still reaches the IR pipeline.
#[tokio::test]
async fn approval_request_routes_to_broker_and_ir() {
    let input = "{\"id\":7,\"method\":\"item/commandExecution/requestApproval\",\
        \"params\":{\"itemId\":\"i1\",\"threadId\":\"t1\",\"turnId\":\"u1\",\
        \"command\":\"ls -la\",\"cwd\":\"/home/u\"}}\n";
    let events = run_over(input, empty_pending()).await;

    let approval = events
        .iter()
        .find_map(|e| match e {
            SupervisorEvent::ApprovalRequest { rpc_id, method, .. } => {
                Some((rpc_id.clone(), method.clone()))
            }
            _ => None,
        })
        .expect("approval request surfaced");
    assert_eq!(approval.0, RpcId::Num(7));
    assert_eq!(approval.1, "item/commandExecution/requestApproval");

    assert!(
        events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::RunUpdate(view) if view.run_id == "t1")),
        "approval requests are tapped into the IR pipeline too"
    );
    assert!(
        !events.iter().any(|e| matches!(e, SupervisorEvent::Event(_))),
        "approval requests do not double-emit on the plain event surface"
    );
}

/// A non-approval request surfaces as a plain event and is IR-tapped.
#[tokio::test]
async fn other_request_surfaces_as_event() {
    let input = "{\"id\":\"q-1\",\"method\":\"thread/somethingElse\",\
        \"params\":{\"threadId\":\"t1\"}}\n";
    let events = run_over(input, empty_pending()).await;

    match &events[0] {
        SupervisorEvent::Event(raw) => {
            assert_eq!(raw.rpc_id, Some(RpcId::Str("q-1".to_owned())));
        }
        other => panic!("expected Event, got: {other:?}"),
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// A success response resolves its pending waiter with the result.
#[tokio::test]
async fn response_resolves_waiter() {
    let pending = empty_pending();
    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(4, tx);

    let input = "{\"id\":4,\"result\":{\"threadId\":\"t1\"}}\n";
    run_over(input, Arc::clone(&pending)).await;

    let outcome = rx.await.expect("waiter resolved");
    assert_eq!(
        outcome.expect("success")["threadId"],
        "t1",
        "result delivered verbatim"
    );
    assert!(
        pending.lock().await.is_empty(),
        "entry removed (take-and-remove)"
    );
}

/// An error response rejects the waiter with a classified message and emits
/// a process-error record with source `response`.
#[tokio::test]
async fn error_response_is_classified() {
    let pending = empty_pending();
    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(5, tx);

    let input =
        "{\"id\":5,\"error\":{\"code\":-32000,\"message\":\"http 401 invalid_api_key\"}}\n";
    let events = run_over(input, Arc::clone(&pending)).await;

    match rx.await.expect("waiter resolved") {
        Err(AppError::Rpc(msg)) => {
            assert!(
                msg.contains("鉴权失败：API Key 无效"),
                "classified summary delivered, got: {msg}"
            );
        }
        other => panic!("expected Err(AppError::Rpc), got: {other:?}"),
    }

    let record = events
        .iter()
        .find_map(|e| match e {
            SupervisorEvent::ProcessError(record) => Some(record),
            _ => None,
        })
        .expect("process error emitted");
    assert_eq!(record.source, ErrorSource::Response);
    assert_eq!(record.summary, "鉴权失败：API Key 无效");
}

/// A response with no matching waiter is silently discarded.
#[tokio::test]
async fn late_response_is_discarded() {
    let events = run_over("{\"id\":99,\"result\":{}}\n", empty_pending()).await;
    assert!(events.is_empty(), "no events for a stray response");
}

// ── Resilience ────────────────────────────────────────────────────────────────

/// Malformed lines are skipped without aborting the stream.
#[tokio::test]
async fn malformed_line_does_not_abort_stream() {
    let input = concat!(
        "this is not json\n",
        "\n",
        "{\"method\":\"turn/started\",\"params\":{\"threadId\":\"t1\"}}\n",
    );
    let events = run_over(input, empty_pending()).await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Event(raw) if raw.event_type == "turn/started")),
        "the stream continues past malformed lines"
    );
}

/// A frame past the configured bound is dropped; later frames still flow.
#[tokio::test]
async fn oversized_frame_does_not_abort_stream() {
    let input = format!(
        "{{\"method\":\"noise\",\"params\":{{\"x\":\"{}\"}}}}\n\
         {{\"method\":\"turn/started\",\"params\":{{\"threadId\":\"t1\"}}}}\n",
        "a".repeat(FRAME_LIMIT),
    );
    let events = run_over(&input, empty_pending()).await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Event(raw) if raw.event_type == "turn/started")),
        "the stream continues past oversized frames"
    );
}

// ── Stderr classification ─────────────────────────────────────────────────────

/// Stderr chunks become classified process errors with source `stderr`.
#[tokio::test]
async fn stderr_chunk_is_classified() {
    let (tx, mut rx) = mpsc::channel(8);
    let stderr: &[u8] = b"ERROR http 401 Unauthorized: invalid_api_key\n";

    run_stderr_monitor(
        "sess-1".to_owned(),
        stderr,
        tx,
        CancellationToken::new(),
    )
    .await;

    let event = rx.recv().await.expect("one process error");
    match event {
        SupervisorEvent::ProcessError(record) => {
            assert_eq!(record.source, ErrorSource::Stderr);
            assert_eq!(record.summary, "鉴权失败：API Key 无效");
            assert!(record.details.contains("401"));
        }
        other => panic!("expected ProcessError, got: {other:?}"),
    }
}

/// Blank stderr lines are ignored.
#[tokio::test]
async fn blank_stderr_lines_are_ignored() {
    let (tx, mut rx) = mpsc::channel(8);
    let stderr: &[u8] = b"\n   \n";

    run_stderr_monitor(
        "sess-1".to_owned(),
        stderr,
        tx,
        CancellationToken::new(),
    )
    .await;

    assert!(rx.try_recv().is_err(), "no events for blank lines");
}
