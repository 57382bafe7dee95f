//! ToolRouter — dispatches model tool calls to the vault tool registry.
//!
//! The ToolRouter is the bridge between the model's tool call decisions and
//! the vault. It handles:
//! - Validation (tool exists, arguments match schema)
//! - Deferral of destructive calls into pending actions when confirmations
//!   are required
//! - Execution, including approved actions with a staleness check
//! - Audit logging of every execution and every rejected or expired action
//! - Index refresh after a mutation

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::agent_core::tokens::truncate_chars;
use crate::inference::types::ToolCall;
use crate::tools::{ToolContext, ToolRegistry};

use super::database::{self, SharedDatabase};
use super::errors::AgentError;
use super::types::{ActionStatus, AuditStatus, PendingAction};

// ─── Results ────────────────────────────────────────────────────────────────

/// Outcome of one executed (or refused) tool call.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// Value recorded as the tool-result turn, bounded to `max_chars`.
    pub fn to_model_value(&self, max_chars: usize) -> Value {
        if !self.success {
            let error = self.error.as_deref().unwrap_or("tool failed");
            return json!({ "error": error });
        }
        let value = self.result.clone().unwrap_or(Value::Null);
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        if text.chars().count() <= max_chars {
            return value;
        }
        Value::String(format!(
            "{}\n... (truncated, {} characters total)",
            truncate_chars(&text, max_chars),
            text.chars().count()
        ))
    }
}

/// What happened to a dispatched call.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Executed (or failed) now.
    Done(ToolCallResult),
    /// Destructive call turned into an action awaiting approval.
    Deferred(PendingAction),
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Dispatches tool calls and keeps the audit log.
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
    db: SharedDatabase,
}

impl ToolRouter {
    pub fn new(registry: Arc<ToolRegistry>, ctx: ToolContext, db: SharedDatabase) -> Self {
        Self { registry, ctx, db }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Dispatch one call.
    ///
    /// Read-only tools always run inline. Destructive tools run inline only
    /// when `confirmations_required` is false; otherwise they are previewed
    /// and returned as [`Dispatch::Deferred`] without touching the vault.
    pub fn dispatch_single(
        &self,
        tool_call: &ToolCall,
        identity: &str,
        confirmations_required: bool,
    ) -> Dispatch {
        let start = Instant::now();

        if let Err(e) = self
            .registry
            .validate_tool_call(&tool_call.name, &tool_call.arguments)
        {
            return Dispatch::Done(self.log_and_return_error(
                &tool_call.name,
                &tool_call.arguments,
                identity,
                AuditStatus::Error,
                false,
                start,
                &format!("validation failed: {e}"),
            ));
        }

        let destructive = self.registry.is_destructive(&tool_call.name);
        if destructive && confirmations_required {
            return match self
                .registry
                .propose(&tool_call.name, &self.ctx, &tool_call.arguments)
            {
                Ok(proposed) => {
                    tracing::debug!(tool = %tool_call.name, target = %proposed.target, "deferred for confirmation");
                    Dispatch::Deferred(PendingAction {
                        id: String::new(),
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name.clone(),
                        kind: proposed.kind,
                        target: proposed.target,
                        preview: proposed.preview,
                        arguments: tool_call.arguments.clone(),
                        base_hash: proposed.base_hash,
                        status: ActionStatus::Pending,
                    })
                }
                Err(e) => Dispatch::Done(self.log_and_return_error(
                    &tool_call.name,
                    &tool_call.arguments,
                    identity,
                    AuditStatus::Error,
                    false,
                    start,
                    &e.to_string(),
                )),
            };
        }

        let outcome = self
            .registry
            .execute(&tool_call.name, &self.ctx, &tool_call.arguments);
        Dispatch::Done(self.finish(
            &tool_call.name,
            &tool_call.arguments,
            identity,
            destructive,
            false,
            start,
            outcome,
        ))
    }

    /// Execute an action the user approved.
    pub fn execute_approved(&self, action: &PendingAction, identity: &str) -> ToolCallResult {
        let start = Instant::now();
        let outcome = self.registry.execute_approved(action, &self.ctx);
        self.finish(
            &action.tool_name,
            &action.arguments,
            identity,
            true,
            true,
            start,
            outcome,
        )
    }

    /// Record an action that will never run.
    pub fn record_unperformed(&self, action: &PendingAction, identity: &str, status: AuditStatus) {
        if let Err(e) = database::lock(&self.db).and_then(|db| {
            db.insert_audit_entry(
                identity,
                &action.tool_name,
                &action.arguments,
                None,
                status,
                false,
                0,
            )
        }) {
            tracing::warn!(tool = %action.tool_name, error = %e, "failed to write audit entry");
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        tool_name: &str,
        arguments: &Value,
        identity: &str,
        destructive: bool,
        user_confirmed: bool,
        start: Instant,
        outcome: Result<Value, AgentError>,
    ) -> ToolCallResult {
        match outcome {
            Ok(result) => {
                let elapsed = start.elapsed().as_millis() as u64;
                self.audit(
                    identity,
                    tool_name,
                    arguments,
                    Some(&result),
                    AuditStatus::Success,
                    user_confirmed,
                    elapsed,
                );
                if destructive {
                    if let Err(e) = self.ctx.index.refresh_now() {
                        tracing::warn!(tool = %tool_name, error = %e, "index refresh after write failed");
                    }
                }
                tracing::info!(tool = %tool_name, elapsed_ms = elapsed, destructive, "tool executed");
                ToolCallResult {
                    tool_name: tool_name.to_string(),
                    success: true,
                    result: Some(result),
                    error: None,
                    execution_time_ms: elapsed,
                }
            }
            Err(e) => self.log_and_return_error(
                tool_name,
                arguments,
                identity,
                AuditStatus::Error,
                user_confirmed,
                start,
                &e.to_string(),
            ),
        }
    }

    /// Log an error result to the audit log and return a ToolCallResult.
    #[allow(clippy::too_many_arguments)]
    fn log_and_return_error(
        &self,
        tool_name: &str,
        arguments: &Value,
        identity: &str,
        status: AuditStatus,
        user_confirmed: bool,
        start: Instant,
        error_msg: &str,
    ) -> ToolCallResult {
        let elapsed = start.elapsed().as_millis() as u64;
        tracing::warn!(tool = %tool_name, error = %error_msg, "tool call failed");
        self.audit(
            identity,
            tool_name,
            arguments,
            None,
            status,
            user_confirmed,
            elapsed,
        );

        ToolCallResult {
            tool_name: tool_name.to_string(),
            success: false,
            result: None,
            error: Some(error_msg.to_string()),
            execution_time_ms: elapsed,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        identity: &str,
        tool_name: &str,
        arguments: &Value,
        result: Option<&Value>,
        status: AuditStatus,
        user_confirmed: bool,
        elapsed: u64,
    ) {
        let written = database::lock(&self.db).and_then(|db| {
            db.insert_audit_entry(
                identity,
                tool_name,
                arguments,
                result,
                status,
                user_confirmed,
                elapsed,
            )
        });
        if let Err(e) = written {
            tracing::warn!(tool = %tool_name, error = %e, "failed to write audit entry");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
