//! Global configuration parsing, validation, and defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::approval::ApprovalDecision;
use crate::{AppError, Result};

/// Auto-approve rules consulted by the policy engine.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AutoApproveConfig {
    /// Command prefixes that bypass the manual approval gate.
    #[serde(default = "default_auto_approve_commands")]
    pub commands: Vec<String>,
    /// Working-directory globs that bypass the manual approval gate.
    ///
    /// `*` matches any run of characters; patterns are anchored to the full
    /// cwd string.
    #[serde(default = "default_auto_approve_paths")]
    pub paths: Vec<String>,
}

impl Default for AutoApproveConfig {
    fn default() -> Self {
        Self {
            commands: default_auto_approve_commands(),
            paths: default_auto_approve_paths(),
        }
    }
}

fn default_auto_approve_commands() -> Vec<String> {
    ["ls", "cat", "grep", "git status", "git log"]
        .map(str::to_owned)
        .to_vec()
}

fn default_auto_approve_paths() -> Vec<String> {
    vec!["/tmp/*".to_owned()]
}

/// Approval broker configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalConfig {
    /// Pending-approval deadline in milliseconds.
    #[serde(default = "default_approval_timeout_ms")]
    pub timeout_ms: u64,
    /// Decision sent to the agent when an approval deadline lapses.
    #[serde(default = "default_action")]
    pub default_action: ApprovalDecision,
    /// Auto-approve rules.
    #[serde(default)]
    pub auto_approve: AutoApproveConfig,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_approval_timeout_ms(),
            default_action: default_action(),
            auto_approve: AutoApproveConfig::default(),
        }
    }
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

fn default_action() -> ApprovalDecision {
    ApprovalDecision::Decline
}

/// Audit sink configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuditConfig {
    /// Directory for daily-rotating JSONL audit files.
    ///
    /// When unset, audit records are kept in memory only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Global configuration parsed from `config.toml`.
///
/// Every field is defaulted, so an empty TOML document (or a missing file)
/// yields a usable configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Base directory for per-user workspaces.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Agent binary launched for each session.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    /// Arguments passed to the agent binary.
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Session idle reap threshold in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Idle sweep period in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Outgoing JSON-RPC request deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Initialize/initialized handshake deadline in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Maximum accepted length of one inbound agent frame, in bytes.
    ///
    /// Frames longer than this are dropped without buffering the line.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Approval broker settings.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Audit sink settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            agent_command: default_agent_command(),
            agent_args: default_agent_args(),
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            approval: ApprovalConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    home_dir().join(".cloud-codex").join("workspaces")
}

fn default_agent_command() -> String {
    "codex".to_owned()
}

fn default_agent_args() -> Vec<String> {
    vec!["proto".to_owned()]
}

fn default_idle_timeout_ms() -> u64 {
    1_800_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_bytes() -> usize {
    1_048_576
}

/// Resolve the user's home directory, falling back to the current directory.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
}

impl GlobalConfig {
    /// Load configuration from a TOML file path.
    ///
    /// A missing file is not an error — defaults are returned so the server
    /// can run without any configuration on disk.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be read or
    /// contains invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Outgoing JSON-RPC request deadline.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Initialize handshake deadline.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Session idle reap threshold.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Idle sweep period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Pending-approval deadline.
    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.agent_command.trim().is_empty() {
            return Err(AppError::Config("agent_command must not be empty".into()));
        }
        for field in [
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("approval.timeout_ms", self.approval.timeout_ms),
        ] {
            if field.1 == 0 {
                return Err(AppError::Config(format!("{} must be non-zero", field.0)));
            }
        }
        if self.max_frame_bytes == 0 {
            return Err(AppError::Config("max_frame_bytes must be non-zero".into()));
        }
        Ok(())
    }
}
