//! Structured audit logging for approval decisions.
//!
//! Every approval outcome — auto-approved by policy, decided by the user,
//! or timed out — produces one [`AuditRecord`]. The [`AuditSink`] trait
//! decouples the broker from storage: the in-memory log satisfies the
//! queryable-by-user requirement, while [`JsonlAuditWriter`] offers local
//! JSONL persistence with daily rotation.

pub mod writer;

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub use writer::JsonlAuditWriter;

/// What kind of action the approval gated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Terminal command execution.
    CommandExecution,
    /// File modification.
    FileChange,
}

/// Final decision recorded for an approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Accept,
    Decline,
    /// Deadline lapsed; the configured default action was sent.
    Timeout,
}

/// One structured record of an approval outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Owning user.
    pub user_id: String,
    /// Owning session.
    pub session_id: String,
    /// Thread the approval belonged to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Turn the approval belonged to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Gated action kind.
    pub action: AuditAction,
    /// Command line (for command executions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Proposed file changes (for file changes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
    /// Final decision.
    pub decision: AuditDecision,
    /// Who decided: `policy_engine`, `user_<id>`, or `timeout`.
    pub approver: String,
    /// Matched policy rule or failure reason, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the decision was synthesized without a human.
    pub auto_approved: bool,
}

/// Writes structured audit records to a persistent or in-memory store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditSink: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn record(&self, entry: AuditRecord) -> Result<()>;
}

/// Append-only in-memory audit log, queryable by user.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, in write order.
    #[must_use]
    pub fn all(&self) -> Vec<AuditRecord> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Records belonging to `user_id`, in write order.
    #[must_use]
    pub fn for_user(&self, user_id: &str) -> Vec<AuditRecord> {
        self.entries
            .lock()
            .map(|e| {
                e.iter()
                    .filter(|r| r.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: AuditRecord) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| crate::AppError::Io("audit log mutex poisoned".into()))?
            .push(entry);
        Ok(())
    }
}

/// Fans one record out to several sinks; the first failure wins.
pub struct TeeAuditSink {
    sinks: Vec<std::sync::Arc<dyn AuditSink>>,
}

impl TeeAuditSink {
    /// Combine `sinks` into one.
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for TeeAuditSink {
    fn record(&self, entry: AuditRecord) -> Result<()> {
        for sink in &self.sinks {
            sink.record(entry.clone())?;
        }
        Ok(())
    }
}
