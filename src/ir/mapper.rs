//! Raw-event stream → per-thread run view projection.
//!
//! [`IrMapper`] is pure and deterministic: it performs no I/O, never reads
//! the clock (timestamps come from the events themselves), and holds no
//! randomness. Feeding the same event sequence to a fresh mapper twice
//! yields byte-identical run-view snapshots.
//!
//! Projection invariants:
//!
//! - Steps are never removed once created.
//! - Step status moves forward along pending → inProgress → terminal; a
//!   later `item/completed` may re-confirm or overwrite a terminal value.
//! - `stream` is append-only; deltas arriving after a terminal status still
//!   append silently.
//! - `plan.history` never loses a prior version.

use std::collections::HashMap;

use serde_json::Value;

use super::{
    extract_thread_id, extract_turn_id, ApprovalState, ApprovalView, DiffView, PlanStepView,
    PlanView, RawEvent, RunStatus, RunView, StepKind, StepStatus, StepView, TokenUsageView,
};

/// Maps the raw event stream of one supervisor into per-thread [`RunView`]s.
#[derive(Debug, Default)]
pub struct IrMapper {
    /// Append-only log of everything consumed, in arrival order.
    raw_log: Vec<RawEvent>,
    /// Run views keyed by thread id.
    runs: HashMap<String, RunView>,
    /// Per-thread index: item id → position in `RunView::steps`.
    step_index: HashMap<String, HashMap<String, usize>>,
}

impl IrMapper {
    /// Create an empty mapper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw events consumed so far.
    #[must_use]
    pub fn raw_event_count(&self) -> usize {
        self.raw_log.len()
    }

    /// Current run view for `thread_id`, if one exists.
    #[must_use]
    pub fn run(&self, thread_id: &str) -> Option<&RunView> {
        self.runs.get(thread_id)
    }

    /// Consume one raw event and fold it into the owning run view.
    ///
    /// Returns a snapshot of the updated [`RunView`], or `None` when the
    /// event carried no thread id or its type is unknown (the event is still
    /// appended to the raw log).
    pub fn consume(&mut self, event: &RawEvent) -> Option<RunView> {
        self.raw_log.push(event.clone());

        let thread_id = event
            .thread_id
            .clone()
            .or_else(|| extract_thread_id(&event.payload))?;
        let turn_id = event
            .turn_id
            .clone()
            .or_else(|| extract_turn_id(&event.payload));

        let run = self
            .runs
            .entry(thread_id.clone())
            .or_insert_with(|| RunView::new(thread_id.clone()));
        let index = self.step_index.entry(thread_id.clone()).or_default();

        let touched = match event.event_type.as_str() {
            "thread/started" => {
                run.created_at = Some(event.ts);
                true
            }
            "turn/started" => {
                run.status = RunStatus::InProgress;
                run.meta.last_turn_id.clone_from(&turn_id);
                true
            }
            "turn/completed" => {
                run.status = event
                    .payload
                    .get("status")
                    .and_then(Value::as_str)
                    .map_or(RunStatus::Completed, RunStatus::from_turn_status);
                close_open_reasoning(run, turn_id.as_deref(), event);
                true
            }
            "turn/plan/updated" => {
                apply_plan_update(run, turn_id.clone(), event);
                true
            }
            "turn/diff/updated" => {
                run.diff = Some(DiffView {
                    turn_id: turn_id.clone(),
                    updated_at: event.ts,
                    diff: event
                        .payload
                        .get("diff")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                });
                true
            }
            "thread/tokenUsage/updated" => {
                run.token_usage = Some(TokenUsageView {
                    updated_at: event.ts,
                    input_tokens: event.payload.get("inputTokens").and_then(Value::as_u64),
                    output_tokens: event.payload.get("outputTokens").and_then(Value::as_u64),
                    total_tokens: event.payload.get("totalTokens").and_then(Value::as_u64),
                });
                true
            }
            "item/started" => apply_item_started(run, index, &thread_id, turn_id, event),
            "item/completed" => apply_item_completed(run, index, &thread_id, turn_id, event),
            "item/commandExecution/requestApproval" => apply_approval_request(
                run,
                index,
                &thread_id,
                turn_id,
                event,
                StepKind::CommandExecution,
            ),
            "item/fileChange/requestApproval" => {
                apply_approval_request(run, index, &thread_id, turn_id, event, StepKind::FileChange)
            }
            other => {
                if let Some(kind) = delta_kind(other) {
                    apply_delta(run, index, &thread_id, turn_id, event, kind)
                } else {
                    // Unknown event type — raw log only.
                    false
                }
            }
        };

        if touched {
            self.runs.get(&thread_id).cloned()
        } else {
            None
        }
    }
}

// ── Dispatch helpers ──────────────────────────────────────────────────────────

/// Infer a step kind from a streaming-delta method name.
fn delta_kind(method: &str) -> Option<StepKind> {
    match method {
        "item/agentMessage/delta" => Some(StepKind::AssistantMessage),
        "item/reasoning/summaryTextDelta"
        | "item/reasoning/summaryPartAdded"
        | "item/reasoning/textDelta" => Some(StepKind::Reasoning),
        "item/commandExecution/outputDelta" => Some(StepKind::CommandExecution),
        "item/fileChange/outputDelta" => Some(StepKind::FileChange),
        _ => None,
    }
}

/// The `item` object of an item lifecycle event, or the payload itself for
/// flat shapes.
fn item_object(payload: &Value) -> &Value {
    payload.get("item").unwrap_or(payload)
}

/// Resolve the item id of an item-scoped event.
fn item_id(payload: &Value) -> Option<String> {
    item_object(payload)
        .get("id")
        .or_else(|| payload.get("itemId"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Resolve an existing step by item id, or create a pending one.
fn resolve_step<'r>(
    run: &'r mut RunView,
    index: &mut HashMap<String, usize>,
    thread_id: &str,
    turn_id: Option<String>,
    step_id: &str,
    kind: StepKind,
) -> &'r mut StepView {
    let pos = *index.entry(step_id.to_owned()).or_insert_with(|| {
        run.steps.push(StepView {
            step_id: step_id.to_owned(),
            kind,
            status: StepStatus::Pending,
            thread_id: thread_id.to_owned(),
            turn_id,
            ts_start: None,
            ts_end: None,
            meta: None,
            result: None,
            stream: None,
            approval: None,
            raw_event_ids: Vec::new(),
        });
        run.steps.len() - 1
    });
    &mut run.steps[pos]
}

/// `item/started`: open the step, close any running reasoning sibling.
fn apply_item_started(
    run: &mut RunView,
    index: &mut HashMap<String, usize>,
    thread_id: &str,
    turn_id: Option<String>,
    event: &RawEvent,
) -> bool {
    let Some(id) = item_id(&event.payload) else {
        return false;
    };
    let item = item_object(&event.payload).clone();
    let kind = item
        .get("type")
        .and_then(Value::as_str)
        .map_or(StepKind::SystemNote, StepKind::from_item_type);

    // A non-reasoning item starting means the model stopped thinking: any
    // reasoning step still running in this turn is complete.
    if kind != StepKind::Reasoning {
        close_open_reasoning(run, turn_id.as_deref(), event);
    }

    let step = resolve_step(run, index, thread_id, turn_id.clone(), &id, kind);
    if !step.status.is_terminal() {
        step.status = StepStatus::InProgress;
        step.kind = kind;
    }
    if step.turn_id.is_none() {
        step.turn_id = turn_id;
    }
    step.ts_start.get_or_insert(event.ts);
    if let Some(meta) = step_meta(kind, &item) {
        step.meta = Some(meta);
    }
    step.raw_event_ids.push(event.id.clone());
    true
}

/// `item/completed`: terminal status, timestamps, result attributes.
fn apply_item_completed(
    run: &mut RunView,
    index: &mut HashMap<String, usize>,
    thread_id: &str,
    turn_id: Option<String>,
    event: &RawEvent,
) -> bool {
    let Some(id) = item_id(&event.payload) else {
        return false;
    };
    let item = item_object(&event.payload).clone();
    let kind = item
        .get("type")
        .and_then(Value::as_str)
        .map_or(StepKind::SystemNote, StepKind::from_item_type);

    let step = resolve_step(run, index, thread_id, turn_id, &id, kind);

    // Reasoning always completes; everything else follows the item status.
    // A later item/completed is authoritative even over a terminal value.
    let status = if kind == StepKind::Reasoning {
        StepStatus::Completed
    } else {
        item.get("status")
            .and_then(Value::as_str)
            .map_or(StepStatus::Completed, StepStatus::from_item_status)
    };
    step.status = status;
    step.ts_end = Some(event.ts);
    if step.ts_start.is_none() {
        step.ts_start = Some(event.ts);
    }
    if let Some(result) = step_result(kind, &item) {
        step.result = Some(result);
    }
    step.raw_event_ids.push(event.id.clone());
    true
}

/// Streaming delta: append text to the step's `stream`.
///
/// Deltas arriving after a terminal status still append; the terminal
/// status itself is untouched.
fn apply_delta(
    run: &mut RunView,
    index: &mut HashMap<String, usize>,
    thread_id: &str,
    turn_id: Option<String>,
    event: &RawEvent,
    kind: StepKind,
) -> bool {
    let Some(id) = item_id(&event.payload) else {
        return false;
    };
    let text = event
        .payload
        .get("delta")
        .or_else(|| event.payload.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let step = resolve_step(run, index, thread_id, turn_id, &id, kind);
    step.stream.get_or_insert_with(String::new).push_str(text);
    step.raw_event_ids.push(event.id.clone());
    true
}

/// Approval request: attach a pending [`ApprovalView`] to the step.
fn apply_approval_request(
    run: &mut RunView,
    index: &mut HashMap<String, usize>,
    thread_id: &str,
    turn_id: Option<String>,
    event: &RawEvent,
    kind: StepKind,
) -> bool {
    let Some(id) = item_id(&event.payload) else {
        return false;
    };
    let approval_id = event
        .payload
        .get("approvalId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| event.rpc_id.as_ref().map(ToString::to_string))
        .unwrap_or_else(|| event.id.clone());

    let step = resolve_step(run, index, thread_id, turn_id, &id, kind);
    step.approval = Some(ApprovalView {
        approval_id,
        status: ApprovalState::Pending,
        reason: event
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned),
        risk: event
            .payload
            .get("risk")
            .and_then(Value::as_str)
            .map(str::to_owned),
    });
    if !step.status.is_terminal() {
        step.status = StepStatus::Pending;
    }
    if step.meta.is_none() {
        step.meta = step_meta(kind, &event.payload);
    }
    step.raw_event_ids.push(event.id.clone());
    true
}

/// Replace the current plan, pushing the prior version onto the history.
fn apply_plan_update(run: &mut RunView, turn_id: Option<String>, event: &RawEvent) {
    let steps = event
        .payload
        .get("steps")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| PlanStepView {
                    step: entry
                        .get("step")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    status: entry
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut history = Vec::new();
    if let Some(prior) = run.plan.take() {
        history = prior.history.clone();
        history.push(prior.to_version());
    }

    run.plan = Some(PlanView {
        turn_id,
        updated_at: event.ts,
        explanation: event
            .payload
            .get("explanation")
            .and_then(Value::as_str)
            .map(str::to_owned),
        steps,
        history,
    });
}

/// Force-complete reasoning steps still running in `turn_id`.
fn close_open_reasoning(run: &mut RunView, turn_id: Option<&str>, event: &RawEvent) {
    for step in &mut run.steps {
        if step.kind == StepKind::Reasoning
            && step.status == StepStatus::InProgress
            && step.turn_id.as_deref() == turn_id
        {
            step.status = StepStatus::Completed;
            step.ts_end = Some(event.ts);
            step.raw_event_ids.push(event.id.clone());
        }
    }
}

// ── Kind-specific attribute extraction ────────────────────────────────────────

/// Static attributes captured when a step opens.
fn step_meta(kind: StepKind, item: &Value) -> Option<Value> {
    let keys: &[&str] = match kind {
        StepKind::CommandExecution => &["command", "cwd"],
        StepKind::FileChange => &["changes", "cwd"],
        StepKind::McpToolCall | StepKind::CollabToolCall => &["server", "tool", "arguments"],
        StepKind::WebSearch => &["query"],
        StepKind::UserMessage | StepKind::AssistantMessage => &["text"],
        StepKind::ImageView => &["path"],
        _ => &[],
    };
    pick_fields(item, keys)
}

/// Terminal attributes captured when a step completes.
fn step_result(kind: StepKind, item: &Value) -> Option<Value> {
    let mut obj = serde_json::Map::new();
    match kind {
        StepKind::CommandExecution => {
            // The wire calls accumulated output `aggregatedOutput`; the run
            // view exposes it as `output`.
            if let Some(output) = item
                .get("aggregatedOutput")
                .or_else(|| item.get("output"))
                .cloned()
            {
                obj.insert("output".into(), output);
            }
            copy_fields(item, &["exitCode", "durationMs"], &mut obj);
        }
        StepKind::FileChange => {
            if let Some(output) = item
                .get("aggregatedOutput")
                .or_else(|| item.get("output"))
                .cloned()
            {
                obj.insert("output".into(), output);
            }
            copy_fields(item, &["changes"], &mut obj);
        }
        StepKind::McpToolCall | StepKind::CollabToolCall => {
            copy_fields(item, &["result", "error", "durationMs"], &mut obj);
        }
        StepKind::AssistantMessage | StepKind::UserMessage => {
            copy_fields(item, &["text"], &mut obj);
        }
        StepKind::WebSearch => {
            copy_fields(item, &["results"], &mut obj);
        }
        _ => {}
    }
    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

/// Build an object from the listed fields that are present on `item`.
fn pick_fields(item: &Value, keys: &[&str]) -> Option<Value> {
    let mut obj = serde_json::Map::new();
    copy_fields(item, keys, &mut obj);
    if obj.is_empty() {
        None
    } else {
        Some(Value::Object(obj))
    }
}

/// Copy each present field from `item` into `dest`.
fn copy_fields(item: &Value, keys: &[&str], dest: &mut serde_json::Map<String, Value>) {
    for &key in keys {
        if let Some(value) = item.get(key) {
            dest.insert(key.to_owned(), value.clone());
        }
    }
}
