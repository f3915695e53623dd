//! Gateway flows: connect handshake, frame dispatch, and the full manual
//! approval round-trip from agent request to audited user decision.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use cloud_codex::audit::{AuditDecision, MemoryAuditLog};
use cloud_codex::config::GlobalConfig;
use cloud_codex::gateway::{ClientFrame, ClientGateway, ServerFrame};
use cloud_codex::registry::SessionRegistry;

/// Fake agent: complete the handshake, pause so the client can attach, then
/// raise a command approval request and swallow everything else.
const APPROVAL_AGENT: &str = r#"read _line
printf '{"id":1,"result":{}}\n'
sleep 1
printf '{"id":"codex-req-1","method":"item/commandExecution/requestApproval","params":{"itemId":"i1","threadId":"t1","turnId":"u1","command":"rm -rf build","cwd":"/home/u"}}\n'
cat >/dev/null"#;

const HANDSHAKE_AGENT: &str = r#"read _line
printf '{"id":1,"result":{}}\n'
cat >/dev/null"#;

struct Harness {
    registry: Arc<SessionRegistry>,
    gateway: ClientGateway,
    audit: Arc<MemoryAuditLog>,
    client_rx: mpsc::Receiver<ServerFrame>,
}

async fn connect(workspace: &std::path::Path, script: &str, user: &str) -> Harness {
    let config = GlobalConfig {
        workspace_root: workspace.to_path_buf(),
        agent_command: "sh".to_owned(),
        agent_args: vec!["-c".to_owned(), script.to_owned()],
        handshake_timeout_ms: 5_000,
        request_timeout_ms: 5_000,
        ..GlobalConfig::default()
    };

    let audit = Arc::new(MemoryAuditLog::new());
    let (events_tx, events_rx) = mpsc::channel(256);
    let registry = SessionRegistry::new(Arc::new(config), audit.clone(), events_tx);
    let gateway = ClientGateway::new(Arc::clone(&registry));
    tokio::spawn(gateway.clone().run_event_pump(events_rx));

    let (client_tx, client_rx) = mpsc::channel(64);
    gateway.connect(user, client_tx).await.expect("connected");

    Harness {
        registry,
        gateway,
        audit,
        client_rx,
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("client channel open")
}

/// Connecting yields the connected response carrying the session id.
#[tokio::test]
async fn connect_emits_session_handshake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut h = connect(dir.path(), HANDSHAKE_AGENT, "alice").await;

    let frame = next_frame(&mut h.client_rx).await;
    assert_eq!(frame.frame_type, "response");
    assert_eq!(frame.payload["status"], "connected");

    let session_id = frame.payload["sessionId"].as_str().expect("session id");
    assert!(h.registry.get(session_id).await.is_some());

    h.registry.shutdown().await;
}

/// Unknown frame types come back as correlated error frames.
#[tokio::test]
async fn unknown_verb_yields_error_frame() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut h = connect(dir.path(), HANDSHAKE_AGENT, "bob").await;
    let _connected = next_frame(&mut h.client_rx).await;

    h.gateway
        .handle_frame(
            "bob",
            ClientFrame {
                frame_type: "bogus/verb".to_owned(),
                payload: json!({}),
                request_id: Some(json!(5)),
            },
        )
        .await;

    let frame = next_frame(&mut h.client_rx).await;
    assert_eq!(frame.frame_type, "error");
    assert_eq!(frame.request_id, Some(json!(5)));
    assert!(
        frame.payload["message"]
            .as_str()
            .is_some_and(|m| m.contains("unknown frame type")),
        "got: {frame:?}"
    );

    h.registry.shutdown().await;
}

/// The full manual approval path: agent request → approval/request frame →
/// client decline → audited user decision, pending table drained.
#[tokio::test]
async fn manual_approval_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut h = connect(dir.path(), APPROVAL_AGENT, "carol").await;
    let _connected = next_frame(&mut h.client_rx).await;

    // The agent raises its approval request ~1s after the handshake.
    let approval = loop {
        let frame = next_frame(&mut h.client_rx).await;
        if frame.frame_type == "approval/request" {
            break frame;
        }
    };
    assert_eq!(approval.payload["command"], "rm -rf build");
    let approval_id = approval.payload["approvalId"]
        .as_str()
        .expect("fresh approval id")
        .to_owned();

    h.gateway
        .handle_frame(
            "carol",
            ClientFrame {
                frame_type: "approval/respond".to_owned(),
                payload: json!({"approvalId": approval_id, "decision": "decline"}),
                request_id: None,
            },
        )
        .await;

    // The audited decision is the observable end of the round trip.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !h.audit.for_user("carol").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("audit record within deadline");

    let records = h.audit.for_user("carol");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, AuditDecision::Decline);
    assert_eq!(records[0].approver, "user_carol");
    assert!(!records[0].auto_approved);
    assert_eq!(records[0].command.as_deref(), Some("rm -rf build"));
    assert_eq!(h.registry.broker().pending_count().await, 0);

    h.registry.shutdown().await;
}

/// The IR view of the approval also reaches the client as an `ir/update`
/// carrying the pending step.
#[tokio::test]
async fn approval_surfaces_in_run_view() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut h = connect(dir.path(), APPROVAL_AGENT, "dana").await;
    let _connected = next_frame(&mut h.client_rx).await;

    let view = loop {
        let frame = next_frame(&mut h.client_rx).await;
        if frame.frame_type == "ir/update" {
            break frame.payload;
        }
    };

    assert_eq!(view["runId"], "t1");
    let step = &view["steps"][0];
    assert_eq!(step["stepId"], "i1");
    assert_eq!(step["kind"], "commandExecution");
    assert_eq!(step["status"], "pending");
    assert_eq!(step["approval"]["status"], "pending");

    h.registry.shutdown().await;
}
