//! Intermediate representation of an agent thread.
//!
//! The raw event stream coming off an agent subprocess is heterogeneous:
//! thread/turn lifecycle notifications, item lifecycle, streaming deltas,
//! plan and diff updates, token usage, approval requests. The types here are
//! the normalized per-thread projection of that stream — the "run view" that
//! clients render — plus the [`RawEvent`] envelope the supervisor feeds into
//! the [`mapper::IrMapper`].
//!
//! Everything serializes camelCase to match the wire shapes forwarded to
//! clients in `ir/update` frames.

pub mod mapper;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::RpcId;

// ── Raw events ────────────────────────────────────────────────────────────────

/// One supervisor-produced event, append-only in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Monotonic event id, unique per supervisor (`evt-<seq>`).
    pub id: String,
    /// Wall-clock timestamp, epoch milliseconds.
    pub ts: i64,
    /// Owning thread, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Owning turn, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Source method name (`item/started`, `turn/completed`, …).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque method parameters.
    pub payload: Value,
    /// Original request id when the source frame was a Request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_id: Option<RpcId>,
}

/// Extract a thread id from a params payload.
///
/// Lookup order: `threadId`, `turn.threadId`, `thread.id`.
#[must_use]
pub fn extract_thread_id(payload: &Value) -> Option<String> {
    payload
        .get("threadId")
        .or_else(|| payload.get("turn").and_then(|t| t.get("threadId")))
        .or_else(|| payload.get("thread").and_then(|t| t.get("id")))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Extract a turn id from a params payload.
///
/// Lookup order: `turnId`, `turn.id`.
#[must_use]
pub fn extract_turn_id(payload: &Value) -> Option<String> {
    payload
        .get("turnId")
        .or_else(|| payload.get("turn").and_then(|t| t.get("id")))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

// ── Step model ────────────────────────────────────────────────────────────────

/// Closed set of step kinds a run can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    UserMessage,
    AssistantMessage,
    Reasoning,
    CommandExecution,
    FileChange,
    McpToolCall,
    CollabToolCall,
    WebSearch,
    ImageView,
    ReviewMode,
    Compacted,
    SystemNote,
}

impl StepKind {
    /// Map a raw `item.type` string to a [`StepKind`].
    ///
    /// Unknown item types map to [`StepKind::SystemNote`].
    #[must_use]
    pub fn from_item_type(item_type: &str) -> Self {
        match item_type {
            "userMessage" => Self::UserMessage,
            "agentMessage" | "assistantMessage" => Self::AssistantMessage,
            "reasoning" => Self::Reasoning,
            "commandExecution" => Self::CommandExecution,
            "fileChange" => Self::FileChange,
            "mcpToolCall" => Self::McpToolCall,
            "collabToolCall" => Self::CollabToolCall,
            "webSearch" => Self::WebSearch,
            "imageView" => Self::ImageView,
            "reviewMode" => Self::ReviewMode,
            "compacted" => Self::Compacted,
            _ => Self::SystemNote,
        }
    }
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    /// Created but not yet running (or awaiting approval).
    Pending,
    /// Actively running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Rejected by policy or the user.
    Declined,
}

impl StepStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Declined)
    }

    /// Map a raw item status string, defaulting to [`StepStatus::Completed`].
    #[must_use]
    pub fn from_item_status(status: &str) -> Self {
        match status {
            "pending" => Self::Pending,
            "inProgress" => Self::InProgress,
            "failed" => Self::Failed,
            "declined" => Self::Declined,
            _ => Self::Completed,
        }
    }
}

/// Approval state attached to a step that requested human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalView {
    /// Broker-scoped approval identifier shown to the client.
    pub approval_id: String,
    /// Current approval status.
    pub status: ApprovalState,
    /// Agent-supplied justification, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Agent-supplied risk classification, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<String>,
}

/// Lifecycle of an approval attached to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalState {
    Pending,
    Accepted,
    Declined,
    Timeout,
}

/// One logical activity within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    /// Step identity — the raw `itemId`, unique within a run.
    pub step_id: String,
    /// What kind of activity this step is.
    pub kind: StepKind,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Owning thread.
    pub thread_id: String,
    /// Owning turn, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Timestamp of the first lifecycle event, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_start: Option<i64>,
    /// Timestamp of the terminal event, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_end: Option<i64>,
    /// Kind-specific static attributes (command, cwd, changes, tool, query…).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Kind-specific terminal attributes (output, exit code, tool result…).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Accumulated streaming delta text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// Approval state, set only when the agent requested human approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalView>,
    /// Ordered ids of the raw events that contributed to this step.
    pub raw_event_ids: Vec<String>,
}

// ── Run model ─────────────────────────────────────────────────────────────────

/// Lifecycle status of a run (thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    /// Map a raw turn status string, defaulting to [`RunStatus::Completed`].
    #[must_use]
    pub fn from_turn_status(status: &str) -> Self {
        match status {
            "pending" => Self::Pending,
            "inProgress" => Self::InProgress,
            "interrupted" => Self::Interrupted,
            "failed" => Self::Failed,
            _ => Self::Completed,
        }
    }
}

/// One entry of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStepView {
    /// Step description.
    pub step: String,
    /// Step status string as reported by the agent.
    pub status: String,
}

/// An immutable snapshot of a superseded plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanVersion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub steps: Vec<PlanStepView>,
}

/// The current plan for a run, with the full history of prior versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    /// Turn the plan update belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Timestamp of the update, epoch milliseconds.
    pub updated_at: i64,
    /// Agent-supplied explanation of the plan change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Current plan entries.
    pub steps: Vec<PlanStepView>,
    /// Prior plan versions, oldest first. Never truncated.
    pub history: Vec<PlanVersion>,
}

impl PlanView {
    /// Snapshot this plan as an immutable [`PlanVersion`].
    #[must_use]
    pub fn to_version(&self) -> PlanVersion {
        PlanVersion {
            turn_id: self.turn_id.clone(),
            updated_at: self.updated_at,
            explanation: self.explanation.clone(),
            steps: self.steps.clone(),
        }
    }
}

/// The latest aggregated diff for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub updated_at: i64,
    pub diff: String,
}

/// Cumulative token usage for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageView {
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Free-form run metadata. `lastTurnId` is always tracked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    /// Most recent turn observed on this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_turn_id: Option<String>,
    /// Additional free-form attributes.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The normalized, append-only projection of one agent thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    /// Run identity — equal to the thread id.
    pub run_id: String,
    /// Timestamp of `thread/started`, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Current run status.
    pub status: RunStatus,
    /// Steps in visible-event order.
    pub steps: Vec<StepView>,
    /// Current plan with history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanView>,
    /// Latest aggregated diff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffView>,
    /// Latest token usage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsageView>,
    /// Free-form metadata.
    pub meta: RunMeta,
}

impl RunView {
    /// Construct an empty run view for `run_id`.
    #[must_use]
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            created_at: None,
            status: RunStatus::Pending,
            steps: Vec::new(),
            plan: None,
            diff: None,
            token_usage: None,
            meta: RunMeta::default(),
        }
    }
}
