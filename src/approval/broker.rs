//! Approval broker: policy evaluation, pending table, auditing.
//!
//! Every agent-initiated approval request flows through
//! [`ApprovalBroker::handle_request`], which guarantees that exactly one
//! JSON-RPC Response echoing the original request id eventually reaches the
//! agent — synthesized by the policy engine, carried back from the client,
//! or forced by the deadline. The pending table uses take-and-remove
//! semantics so the client-response and timeout paths can never both send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApprovalDecision, PolicyDecision, PolicyEngine};
use crate::audit::{AuditAction, AuditDecision, AuditRecord, AuditSink};
use crate::protocol::RpcId;
use crate::supervisor::AgentResponder;
use crate::{AppError, Result};

/// Session/user identity attached to an approval request.
#[derive(Debug, Clone)]
pub struct ApprovalContext {
    /// Owning session.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Thread the request belongs to, when the payload carried one.
    pub thread_id: Option<String>,
    /// Turn the request belongs to, when the payload carried one.
    pub turn_id: Option<String>,
}

/// An `approval/request` frame bound for the owning client.
#[derive(Debug, Clone)]
pub struct ApprovalDispatch {
    /// Session the request belongs to.
    pub session_id: String,
    /// User whose client must decide.
    pub user_id: String,
    /// Frame payload: the original request params plus `approvalId` and
    /// `method`.
    pub payload: Value,
}

/// One approval awaiting a client decision.
#[derive(Debug)]
struct PendingApproval {
    rpc_id: RpcId,
    session_id: String,
    user_id: String,
    thread_id: Option<String>,
    turn_id: Option<String>,
    action: AuditAction,
    command: Option<String>,
    changes: Option<Value>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    #[allow(dead_code)]
    deadline: DateTime<Utc>,
    responder: AgentResponder,
    timer: Option<AbortHandle>,
}

/// Interposes on agent approval requests; see the module docs.
///
/// Cheaply cloneable — all state is behind [`Arc`]s, so the broker can be
/// shared across sessions, the gateway, and deadline tasks.
#[derive(Clone)]
pub struct ApprovalBroker {
    timeout: Duration,
    default_action: ApprovalDecision,
    policy: Arc<PolicyEngine>,
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
    audit: Arc<dyn AuditSink>,
    dispatch_tx: mpsc::Sender<ApprovalDispatch>,
}

impl ApprovalBroker {
    /// Build a broker.
    ///
    /// `dispatch_tx` receives the `approval/request` frames for manual
    /// decisions; the gateway owns the receiving end.
    #[must_use]
    pub fn new(
        config: &crate::config::ApprovalConfig,
        audit: Arc<dyn AuditSink>,
        dispatch_tx: mpsc::Sender<ApprovalDispatch>,
    ) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            default_action: config.default_action,
            policy: Arc::new(PolicyEngine::new(&config.auto_approve)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            audit,
            dispatch_tx,
        }
    }

    /// Number of approvals currently awaiting a decision.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Handle one agent-initiated approval request.
    ///
    /// Auto decisions respond to the agent immediately; manual decisions
    /// park the request and dispatch an `approval/request` frame to the
    /// owning client. Unknown approval methods are declined and audited.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`] when the Response cannot be written
    /// because the agent stream is closed.
    pub async fn handle_request(
        &self,
        ctx: ApprovalContext,
        rpc_id: RpcId,
        method: &str,
        params: Value,
        responder: AgentResponder,
    ) -> Result<()> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let changes = params.get("changes").cloned();

        let (action, decision) = match method {
            "item/commandExecution/requestApproval" => {
                let cwd = params.get("cwd").and_then(Value::as_str).unwrap_or("");
                let decision = self
                    .policy
                    .evaluate_command(command.as_deref().unwrap_or(""), cwd);
                (AuditAction::CommandExecution, decision)
            }
            "item/fileChange/requestApproval" => {
                (AuditAction::FileChange, self.policy.evaluate_file_change())
            }
            other => {
                // Unknown method routed here — decline and audit the failure.
                let err = AppError::Policy(format!("unknown approval method '{other}'"));
                warn!(%err, "declining unroutable approval request");
                responder
                    .respond(rpc_id, json!({ "decision": "decline" }))
                    .await?;
                self.write_audit(
                    &ctx,
                    AuditAction::CommandExecution,
                    command,
                    changes,
                    AuditDecision::Decline,
                    "policy_engine".to_owned(),
                    Some(err.to_string()),
                    true,
                );
                return Ok(());
            }
        };

        match decision {
            PolicyDecision::Accept => {
                responder
                    .respond(rpc_id, json!({ "decision": "accept" }))
                    .await?;
                self.write_audit(
                    &ctx,
                    action,
                    command,
                    changes,
                    AuditDecision::Accept,
                    "policy_engine".to_owned(),
                    None,
                    true,
                );
                Ok(())
            }
            PolicyDecision::Decline => {
                responder
                    .respond(rpc_id, json!({ "decision": "decline" }))
                    .await?;
                self.write_audit(
                    &ctx,
                    action,
                    command,
                    changes,
                    AuditDecision::Decline,
                    "policy_engine".to_owned(),
                    None,
                    true,
                );
                Ok(())
            }
            PolicyDecision::Manual => {
                self.park(ctx, rpc_id, method, params, action, command, changes, responder)
                    .await
            }
        }
    }

    /// Park a manual approval and dispatch it to the owning client.
    #[allow(clippy::too_many_arguments)]
    async fn park(
        &self,
        ctx: ApprovalContext,
        rpc_id: RpcId,
        method: &str,
        params: Value,
        action: AuditAction,
        command: Option<String>,
        changes: Option<Value>,
        responder: AgentResponder,
    ) -> Result<()> {
        let approval_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(self.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let entry = PendingApproval {
            rpc_id,
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            thread_id: ctx.thread_id.clone(),
            turn_id: ctx.turn_id.clone(),
            action,
            command,
            changes,
            created_at: now,
            deadline,
            responder,
            timer: None,
        };
        self.pending.lock().await.insert(approval_id.clone(), entry);

        // Arm the deadline. The timer resolves through the same
        // take-and-remove path as the client response, so only one of the
        // two ever sends.
        let broker = self.clone();
        let timer_id = approval_id.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            broker.resolve_timeout(&timer_id).await;
        })
        .abort_handle();
        if let Some(entry) = self.pending.lock().await.get_mut(&approval_id) {
            entry.timer = Some(handle);
        }

        // Forward to the owning client: original params + approvalId + method.
        let mut payload = match params {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("params".into(), other);
                map
            }
        };
        payload.insert("approvalId".into(), Value::String(approval_id.clone()));
        payload.insert("method".into(), Value::String(method.to_owned()));

        info!(
            approval_id = approval_id.as_str(),
            session_id = ctx.session_id.as_str(),
            method,
            "approval parked for manual decision"
        );

        let dispatch = ApprovalDispatch {
            session_id: ctx.session_id,
            user_id: ctx.user_id,
            payload: Value::Object(payload),
        };
        if self.dispatch_tx.send(dispatch).await.is_err() {
            // No client transport — the deadline will resolve the request.
            warn!(
                approval_id = approval_id.as_str(),
                "approval dispatch channel closed, relying on deadline"
            );
        }

        Ok(())
    }

    /// Resolve a pending approval with the client's decision.
    ///
    /// Verifies the session owns the approval before taking the entry;
    /// unknown ids and session mismatches are dropped with an error log —
    /// never a second Response.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] — `approval_id` has no pending entry.
    /// - [`AppError::Session`] — the approval belongs to another session.
    /// - [`AppError::Process`] — the agent stream is closed.
    pub async fn respond(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: ApprovalDecision,
        accept_settings: Option<Value>,
    ) -> Result<()> {
        let entry = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.remove(approval_id) else {
                warn!(approval_id, "approval response for unknown id, dropping");
                return Err(AppError::NotFound(format!(
                    "no pending approval '{approval_id}'"
                )));
            };
            if entry.session_id != session_id {
                warn!(
                    approval_id,
                    session_id, "approval response from wrong session, dropping"
                );
                pending.insert(approval_id.to_owned(), entry);
                return Err(AppError::Session(
                    "approval belongs to a different session".into(),
                ));
            }
            entry
        };

        if let Some(timer) = &entry.timer {
            timer.abort();
        }

        let mut result = serde_json::Map::new();
        result.insert(
            "decision".into(),
            Value::String(decision.as_str().to_owned()),
        );
        if let Some(settings) = accept_settings {
            result.insert("acceptSettings".into(), settings);
        }
        entry
            .responder
            .respond(entry.rpc_id.clone(), Value::Object(result))
            .await?;

        let ctx = ApprovalContext {
            session_id: entry.session_id.clone(),
            user_id: entry.user_id.clone(),
            thread_id: entry.thread_id.clone(),
            turn_id: entry.turn_id.clone(),
        };
        self.write_audit(
            &ctx,
            entry.action,
            entry.command.clone(),
            entry.changes.clone(),
            match decision {
                ApprovalDecision::Accept => AuditDecision::Accept,
                ApprovalDecision::Decline => AuditDecision::Decline,
            },
            format!("user_{}", entry.user_id),
            None,
            false,
        );

        info!(
            approval_id,
            decision = decision.as_str(),
            "approval resolved by user"
        );
        Ok(())
    }

    /// Deadline path: send the configured default action exactly once.
    async fn resolve_timeout(&self, approval_id: &str) {
        let Some(entry) = self.pending.lock().await.remove(approval_id) else {
            // Already resolved by the client — nothing to do.
            return;
        };

        warn!(
            approval_id,
            default_action = self.default_action.as_str(),
            "approval deadline lapsed, sending default action"
        );

        let result = json!({ "decision": self.default_action.as_str() });
        if let Err(err) = entry.responder.respond(entry.rpc_id.clone(), result).await {
            warn!(approval_id, %err, "failed to deliver timeout response");
        }

        let ctx = ApprovalContext {
            session_id: entry.session_id.clone(),
            user_id: entry.user_id.clone(),
            thread_id: entry.thread_id.clone(),
            turn_id: entry.turn_id.clone(),
        };
        self.write_audit(
            &ctx,
            entry.action,
            entry.command.clone(),
            entry.changes.clone(),
            AuditDecision::Timeout,
            "timeout".to_owned(),
            None,
            false,
        );
    }

    /// Append an audit record, logging (not failing) on sink errors.
    #[allow(clippy::too_many_arguments)]
    fn write_audit(
        &self,
        ctx: &ApprovalContext,
        action: AuditAction,
        command: Option<String>,
        changes: Option<Value>,
        decision: AuditDecision,
        approver: String,
        reason: Option<String>,
        auto_approved: bool,
    ) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            thread_id: ctx.thread_id.clone(),
            turn_id: ctx.turn_id.clone(),
            action,
            command,
            changes,
            decision,
            approver,
            reason,
            auto_approved,
        };
        if let Err(err) = self.audit.record(record) {
            warn!(%err, "failed to write audit record");
        }
    }
}
