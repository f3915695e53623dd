//! Unit tests for configuration parsing and defaults.

use cloud_codex::approval::ApprovalDecision;
use cloud_codex::{AppError, GlobalConfig};

/// An empty TOML document yields the documented defaults.
#[test]
fn empty_toml_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config is valid");

    assert_eq!(config.agent_command, "codex");
    assert_eq!(config.agent_args, vec!["proto".to_owned()]);
    assert_eq!(config.idle_timeout_ms, 1_800_000);
    assert_eq!(config.sweep_interval_ms, 60_000);
    assert_eq!(config.request_timeout_ms, 60_000);
    assert_eq!(config.max_frame_bytes, 1_048_576);
    assert_eq!(config.approval.timeout_ms, 300_000);
    assert_eq!(config.approval.default_action, ApprovalDecision::Decline);
    assert_eq!(
        config.approval.auto_approve.commands,
        vec!["ls", "cat", "grep", "git status", "git log"]
    );
    assert_eq!(config.approval.auto_approve.paths, vec!["/tmp/*"]);
    assert!(
        config.workspace_root.ends_with(".cloud-codex/workspaces"),
        "workspace root must default under the home directory, got {}",
        config.workspace_root.display()
    );
}

/// Explicit values override the defaults, including nested tables.
#[test]
fn explicit_values_override_defaults() {
    let raw = r#"
        workspace_root = "/srv/codex"
        agent_command = "codex-nightly"
        agent_args = ["proto", "--verbose"]
        idle_timeout_ms = 60000

        [approval]
        timeout_ms = 1000
        default_action = "accept"

        [approval.auto_approve]
        commands = ["make check"]
        paths = []
    "#;
    let config = GlobalConfig::from_toml_str(raw).expect("valid config");

    assert_eq!(config.workspace_root.to_str(), Some("/srv/codex"));
    assert_eq!(config.agent_command, "codex-nightly");
    assert_eq!(config.idle_timeout_ms, 60_000);
    assert_eq!(config.approval.timeout_ms, 1_000);
    assert_eq!(config.approval.default_action, ApprovalDecision::Accept);
    assert_eq!(config.approval.auto_approve.commands, vec!["make check"]);
    assert!(config.approval.auto_approve.paths.is_empty());
}

/// Zero timeouts are rejected at validation.
#[test]
fn zero_timeout_is_rejected() {
    let result = GlobalConfig::from_toml_str("request_timeout_ms = 0");
    assert!(
        matches!(result, Err(AppError::Config(_))),
        "zero timeout must fail validation, got: {result:?}"
    );
}

/// A zero frame bound is rejected at validation.
#[test]
fn zero_frame_bound_is_rejected() {
    let result = GlobalConfig::from_toml_str("max_frame_bytes = 0");
    assert!(
        matches!(result, Err(AppError::Config(_))),
        "zero frame bound must fail validation, got: {result:?}"
    );
}

/// An empty agent command is rejected at validation.
#[test]
fn empty_agent_command_is_rejected() {
    let result = GlobalConfig::from_toml_str(r#"agent_command = "  ""#);
    assert!(
        matches!(result, Err(AppError::Config(_))),
        "blank agent command must fail validation, got: {result:?}"
    );
}

/// An unknown default action fails to parse.
#[test]
fn bad_default_action_is_rejected() {
    let raw = "[approval]\ndefault_action = \"maybe\"";
    assert!(GlobalConfig::from_toml_str(raw).is_err());
}

/// A missing config file yields the defaults rather than an error.
#[test]
fn missing_file_yields_defaults() {
    let config =
        GlobalConfig::load_from_path("/definitely/not/a/real/config.toml").expect("defaults");
    assert_eq!(config.agent_command, "codex");
}
