//! Session registry flows: per-user uniqueness, destruction, idle sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cloud_codex::audit::MemoryAuditLog;
use cloud_codex::config::GlobalConfig;
use cloud_codex::registry::{RegistryEvent, SessionRegistry, SessionState};
use cloud_codex::AppError;

/// Fake agent: answer the initialize request, then swallow everything.
const HANDSHAKE_AGENT: &str = r#"read _line
printf '{"id":1,"result":{}}\n'
cat >/dev/null"#;

fn test_config(workspace_root: &std::path::Path, script: &str) -> GlobalConfig {
    GlobalConfig {
        workspace_root: workspace_root.to_path_buf(),
        agent_command: "sh".to_owned(),
        agent_args: vec!["-c".to_owned(), script.to_owned()],
        handshake_timeout_ms: 5_000,
        request_timeout_ms: 5_000,
        ..GlobalConfig::default()
    }
}

fn registry_with(
    config: GlobalConfig,
) -> (Arc<SessionRegistry>, mpsc::Receiver<RegistryEvent>) {
    let (events_tx, events_rx) = mpsc::channel(256);
    let registry = SessionRegistry::new(
        Arc::new(config),
        Arc::new(MemoryAuditLog::new()),
        events_tx,
    );
    (registry, events_rx)
}

/// Each user gets at most one live session; repeat calls return it.
#[tokio::test]
async fn one_session_per_user() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _events) = registry_with(test_config(dir.path(), HANDSHAKE_AGENT));

    let first = registry.get_or_create("alice").await.expect("created");
    let second = registry.get_or_create("alice").await.expect("reused");

    assert_eq!(first.id, second.id, "same session for the same user");
    assert_eq!(registry.session_count().await, 1);
    assert_eq!(first.state(), SessionState::Ready);
    assert_eq!(first.user_id, "alice");
    assert!(
        first.working_directory.ends_with("alice"),
        "workspace is keyed by user"
    );
    assert!(first.working_directory.is_dir(), "workspace created");

    registry.shutdown().await;
}

/// Two concurrent creations for the same user converge on one session.
#[tokio::test]
async fn concurrent_creation_is_race_free() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _events) = registry_with(test_config(dir.path(), HANDSHAKE_AGENT));

    let (a, b) = tokio::join!(
        registry.get_or_create("bob"),
        registry.get_or_create("bob"),
    );
    let a = a.expect("first creation");
    let b = b.expect("second creation");

    assert_eq!(a.id, b.id);
    assert_eq!(registry.session_count().await, 1);

    registry.shutdown().await;
}

/// Sessions are found by id and by user.
#[tokio::test]
async fn lookup_by_id_and_user() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _events) = registry_with(test_config(dir.path(), HANDSHAKE_AGENT));

    let session = registry.get_or_create("carol").await.expect("created");

    let by_id = registry.get(&session.id).await.expect("found by id");
    assert_eq!(by_id.user_id, "carol");
    let by_user = registry.get_by_user("carol").await.expect("found by user");
    assert_eq!(by_user.id, session.id);
    assert!(registry.get("no-such-session").await.is_none());

    registry.shutdown().await;
}

/// Destroy stops the supervisor, removes the workspace, and frees the slot.
#[tokio::test]
async fn destroy_removes_workspace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _events) = registry_with(test_config(dir.path(), HANDSHAKE_AGENT));

    let session = registry.get_or_create("dave").await.expect("created");
    let workspace = session.working_directory.clone();
    assert!(workspace.is_dir());

    registry.destroy(&session.id).await;

    assert!(!workspace.exists(), "workspace removed recursively");
    assert_eq!(registry.session_count().await, 0);
    assert_eq!(session.state(), SessionState::Closed);

    // A fresh session can be created afterwards.
    let replacement = registry.get_or_create("dave").await.expect("recreated");
    assert_ne!(replacement.id, session.id);

    registry.shutdown().await;
}

/// A failed handshake propagates and leaves no registry entry.
#[tokio::test]
async fn failed_handshake_is_not_registered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path(), "exit 1");
    config.handshake_timeout_ms = 1_000;
    let (registry, _events) = registry_with(config);

    let result = registry.get_or_create("erin").await;
    assert!(
        matches!(result, Err(AppError::Session(_))),
        "expected session error, got: {:?}",
        result.map(|s| s.id.clone())
    );
    assert_eq!(registry.session_count().await, 0);

    registry.shutdown().await;
}

/// The idle sweep reaps sessions past the idle threshold.
#[tokio::test]
async fn idle_sweep_reaps_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path(), HANDSHAKE_AGENT);
    config.idle_timeout_ms = 200;
    config.sweep_interval_ms = 100;
    let (registry, _events) = registry_with(config);

    let session = registry.get_or_create("frank").await.expect("created");
    let workspace = session.working_directory.clone();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry.session_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("idle session reaped within deadline");

    assert!(!workspace.exists(), "reaped session's workspace removed");

    registry.shutdown().await;
}
