//! Approval policy evaluation.
//!
//! Determines whether a command-execution approval request can bypass the
//! human review gate. Rules are evaluated in order; the first match wins:
//!
//! 1. The command is a built-in read-only command and contains no output
//!    redirection (`>` / `>>`).
//! 2. The command starts with a configured auto-approve prefix.
//! 3. The working directory matches a configured path glob.
//! 4. Otherwise, the request goes to manual review.
//!
//! File-change requests never bypass review in the current policy.

use regex::Regex;
use tracing::{info, warn};

use crate::config::AutoApproveConfig;

/// Commands considered side-effect free when run without redirection.
///
/// Entries may be one token (`ls`) or two (`git status`); both the first
/// token and the first two tokens of a command are checked.
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "grep", "find", "head", "tail", "less", "more", "pwd", "echo", "date", "whoami",
    "which", "git log", "git status", "git diff", "git show", "npm list", "yarn list",
];

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Approve without asking the user.
    Accept,
    /// Reject without asking the user.
    Decline,
    /// Forward to the user for a decision.
    Manual,
}

/// Evaluates approval requests against built-in and configured rules.
#[derive(Debug)]
pub struct PolicyEngine {
    command_prefixes: Vec<String>,
    path_patterns: Vec<Regex>,
}

impl PolicyEngine {
    /// Build an engine from the auto-approve configuration.
    ///
    /// Invalid path globs are logged and skipped rather than failing the
    /// whole engine.
    #[must_use]
    pub fn new(config: &AutoApproveConfig) -> Self {
        let path_patterns = config
            .paths
            .iter()
            .filter_map(|pattern| match glob_to_regex(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = pattern.as_str(), %err, "invalid path glob, skipping");
                    None
                }
            })
            .collect();

        Self {
            command_prefixes: config.commands.clone(),
            path_patterns,
        }
    }

    /// Evaluate a command-execution approval request.
    #[must_use]
    pub fn evaluate_command(&self, command: &str, cwd: &str) -> PolicyDecision {
        // ── 1. Built-in read-only commands ───────────────────
        if is_read_only(command) && !command.contains('>') {
            info!(command, "auto-approved: read-only command");
            return PolicyDecision::Accept;
        }

        // ── 2. Configured command prefixes ───────────────────
        if let Some(prefix) = self
            .command_prefixes
            .iter()
            .find(|p| command.starts_with(p.as_str()))
        {
            info!(command, prefix = prefix.as_str(), "auto-approved: command prefix");
            return PolicyDecision::Accept;
        }

        // ── 3. Working-directory globs ───────────────────────
        if let Some(pattern) = self.path_patterns.iter().find(|re| re.is_match(cwd)) {
            info!(command, cwd, pattern = pattern.as_str(), "auto-approved: cwd glob");
            return PolicyDecision::Accept;
        }

        // ── 4. No match → manual review ─────────────────────
        PolicyDecision::Manual
    }

    /// Evaluate a file-change approval request.
    ///
    /// Always manual in the current policy.
    #[must_use]
    pub fn evaluate_file_change(&self) -> PolicyDecision {
        PolicyDecision::Manual
    }
}

/// Whether the command's first token (or first two tokens) names a
/// read-only command.
fn is_read_only(command: &str) -> bool {
    let mut tokens = command.split_whitespace();
    let Some(first) = tokens.next() else {
        return false;
    };

    if READ_ONLY_COMMANDS.contains(&first) {
        return true;
    }

    // Two-token entries like `git status`.
    tokens.next().is_some_and(|second| {
        let pair = format!("{first} {second}");
        READ_ONLY_COMMANDS.contains(&pair.as_str())
    })
}

/// Translate a path glob to an anchored regex: `*` matches any run of
/// characters, everything else is literal.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}
