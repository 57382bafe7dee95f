//! AgentLoop — drives one user request through the model/tool exchange.
//!
//! Per turn: `AWAITING_MODEL → {DISPATCHING_TOOLS, AWAITING_CONFIRMATION, DONE}`.
//! Read-only tool calls run inline. Destructive calls either run inline
//! (confirmations off) or become a confirmation batch, at which point the
//! turn suspends and control returns to the front end. A later decision
//! re-enters the loop: approved actions run, every deferred call gets its
//! tool-result turn, and the model is asked to acknowledge the outcome.
//!
//! Turns for one identity are serialized; different identities run
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde_json::json;

use crate::agent_core::tokens;
use crate::inference::{ChatMessage, InferenceError, LanguageModel, ModelReply};
use crate::tools::{ToolContext, ToolRegistry};
use crate::vault::{render_summary, SummaryLimits};

use super::confirmation::ConfirmationStore;
use super::conversation::{ConversationState, ConversationStore};
use super::database::SharedDatabase;
use super::errors::AgentError;
use super::prompts::{build_system_prompt, load_guidelines};
use super::tool_router::{Dispatch, ToolRouter};
use super::types::{
    ActionKind, AuditStatus, BatchStatus, ConfirmationBatch, Decision, PendingAction, Verdict,
};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Extra model attempts after a timeout or transient failure.
const MODEL_RETRIES: u32 = 1;

/// Tool result recorded for a deferred call whose batch lapsed.
const EXPIRED_RESULT: &str = "expired: not performed";

/// Tool result recorded for a deferred call the user rejected.
const REJECTED_RESULT: &str = "rejected by user: not performed";

// ─── Configuration ──────────────────────────────────────────────────────────

/// Tunables for the loop.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_tool_rounds: usize,
    pub max_history_messages: usize,
    pub model_timeout: Duration,
    pub model_retry_backoff: Duration,
    pub guideline_note: String,
    pub guideline_max_chars: usize,
    pub max_tool_result_chars: usize,
    pub summary_limits: SummaryLimits,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 20,
            max_history_messages: 40,
            model_timeout: Duration::from_secs(60),
            model_retry_backoff: Duration::from_millis(500),
            guideline_note: "KNAP.md".to_string(),
            guideline_max_chars: 4_000,
            max_tool_result_chars: 6_000,
            summary_limits: SummaryLimits::default(),
        }
    }
}

// ─── Replies ────────────────────────────────────────────────────────────────

/// How a front end should present a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The assistant's answer.
    Normal,
    /// Workflow message (nothing pending, already pending, expired, refreshed).
    Notice,
    /// The request failed.
    Error,
}

/// What the front end renders after a request.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub kind: ReplyKind,
    /// Batch awaiting a decision, if the turn suspended (or is still suspended).
    pub pending: Option<ConfirmationBatch>,
    /// Final status of a batch this request finished resolving.
    pub resolved: Option<BatchStatus>,
}

impl AgentReply {
    fn normal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: ReplyKind::Normal,
            pending: None,
            resolved: None,
        }
    }

    fn notice(text: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Notice,
            ..Self::normal(text)
        }
    }

    fn error(err: &AgentError) -> Self {
        Self {
            kind: ReplyKind::Error,
            ..Self::normal(err.user_message())
        }
    }

    fn from_error(err: &AgentError) -> Self {
        match err {
            AgentError::ConfirmationConflictError { .. }
            | AgentError::NoBatchError { .. }
            | AgentError::BatchExpiredError { .. }
            | AgentError::UnknownAction { .. } => Self::notice(err.user_message()),
            _ => Self::error(err),
        }
    }
}

/// Prompt listing the actions of a batch.
pub fn confirmation_prompt(batch: &ConfirmationBatch) -> String {
    let mut lines = vec![format!(
        "I need your approval before changing the vault (expires in {} min):",
        batch.timeout_minutes
    )];
    for action in batch.pending_actions() {
        lines.push(format!("{}. {}", action.id, action.preview.summary));
    }
    lines.push("Reply `approve`, `reject`, or name one action, e.g. `approve 1`.".to_string());
    lines.join("\n")
}

// ─── Identity locks ─────────────────────────────────────────────────────────

/// One async mutex per identity.
#[derive(Default)]
struct IdentityLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    fn get(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(identity.to_string()).or_default().clone()
    }
}

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ─── AgentLoop ──────────────────────────────────────────────────────────────

/// The conversation engine shared by every front end.
pub struct AgentLoop {
    model: Arc<dyn LanguageModel>,
    router: ToolRouter,
    confirmations: ConfirmationStore,
    conversations: ConversationStore,
    config: AgentLoopConfig,
    locks: IdentityLocks,
    clock: Clock,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        ctx: ToolContext,
        db: SharedDatabase,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            model,
            router: ToolRouter::new(registry, ctx, db.clone()),
            confirmations: ConfirmationStore::new(db.clone()),
            conversations: ConversationStore::new(db),
            config,
            locks: IdentityLocks::default(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock (tests).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn ctx(&self) -> &ToolContext {
        self.router.context()
    }

    // ─── Front-end actions ──────────────────────────────────────────────

    /// Process one user message.
    ///
    /// `interactive` is false for front ends that cannot show approval
    /// prompts; destructive tools then run immediately (and are audited).
    pub async fn handle_message(&self, identity: &str, text: &str, interactive: bool) -> AgentReply {
        let lock = self.locks.get(identity);
        let _turn = lock.lock().await;
        tracing::info!(identity = %identity, chars = text.len(), "user message");

        match self.run_message(identity, text, interactive).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(identity = %identity, error = %e, "turn failed");
                AgentReply::from_error(&e)
            }
        }
    }

    /// Apply an approve/reject decision to the identity's pending batch.
    pub async fn resolve_confirmation(
        &self,
        identity: &str,
        decision: Decision,
        selector: Option<&str>,
        interactive: bool,
    ) -> AgentReply {
        let lock = self.locks.get(identity);
        let _turn = lock.lock().await;

        match self
            .run_resolution(identity, decision, selector, interactive)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "confirmation decision failed");
                AgentReply::from_error(&e)
            }
        }
    }

    /// Rescan the whole vault.
    pub fn refresh_index(&self) -> AgentReply {
        match self.ctx().index.rebuild() {
            Ok(snapshot) => AgentReply::notice(format!(
                "Vault index refreshed: {} notes, {} folders, {} tags.",
                snapshot.note_count(),
                snapshot.folders.len(),
                snapshot.tags.len()
            )),
            Err(e) => {
                tracing::error!(error = %e, "index rebuild failed");
                AgentReply::error(&AgentError::from(e))
            }
        }
    }

    /// Forget the identity's history and any pending batch.
    pub async fn clear_history(&self, identity: &str) -> AgentReply {
        let lock = self.locks.get(identity);
        let _turn = lock.lock().await;

        let cleared = self.confirmations.discard(identity).and_then(|batch| {
            if let Some(batch) = batch {
                for action in batch.pending_actions() {
                    self.router
                        .record_unperformed(action, identity, AuditStatus::Expired);
                }
            }
            self.conversations.clear(identity)
        });
        match cleared {
            Ok(()) => AgentReply::notice("Conversation history cleared."),
            Err(e) => AgentReply::error(&e),
        }
    }

    /// The identity's open batch, for front ends that re-show prompts.
    pub fn pending_batch(&self, identity: &str) -> Result<Option<ConfirmationBatch>, AgentError> {
        self.confirmations.pending(identity, self.now())
    }

    // ─── Turn bodies ────────────────────────────────────────────────────

    async fn run_message(
        &self,
        identity: &str,
        text: &str,
        interactive: bool,
    ) -> Result<AgentReply, AgentError> {
        let now = self.now();
        let mut state = self.conversations.load(identity)?;

        if let Some(batch) = self.confirmations.pending(identity, now)? {
            let err = AgentError::ConfirmationConflictError {
                identity: identity.to_string(),
                batch_id: batch.id.clone(),
            };
            let mut reply = AgentReply::notice(format!(
                "{}\n\n{}",
                err.user_message(),
                confirmation_prompt(&batch)
            ));
            reply.pending = Some(batch);
            return Ok(reply);
        }

        let lapsed = self.settle_lapsed(&mut state, now)?;
        self.sweep_others(now);

        state.push_user(text);
        let dropped = state.trim_history(self.config.max_history_messages);
        if dropped > 0 {
            tracing::debug!(identity = %identity, dropped, "history trimmed");
        }

        let result = self.run_rounds(&mut state, interactive).await;
        self.finish_turn(&state, result).map(|mut reply| {
            if lapsed {
                reply.text = format!(
                    "(Earlier pending changes expired and were not applied.)\n\n{}",
                    reply.text
                );
            }
            reply
        })
    }

    async fn run_resolution(
        &self,
        identity: &str,
        decision: Decision,
        selector: Option<&str>,
        interactive: bool,
    ) -> Result<AgentReply, AgentError> {
        let now = self.now();
        let mut state = self.conversations.load(identity)?;

        let resolution = match self.confirmations.resolve(identity, decision, selector, now) {
            Ok(resolution) => resolution,
            Err(AgentError::BatchExpiredError { batch_id }) => {
                self.settle_lapsed(&mut state, now)?;
                self.conversations.save(&state)?;
                let err = AgentError::BatchExpiredError { batch_id };
                let mut reply = AgentReply::notice(err.user_message());
                reply.resolved = Some(BatchStatus::Expired);
                return Ok(reply);
            }
            Err(AgentError::NoBatchError { .. }) if state.pending_batch.is_some() => {
                // Batch swept while the conversation still pointed at it.
                let batch_id = state.pending_batch.clone().unwrap_or_default();
                self.settle_lapsed(&mut state, now)?;
                self.conversations.save(&state)?;
                let err = AgentError::BatchExpiredError { batch_id };
                let mut reply = AgentReply::notice(err.user_message());
                reply.resolved = Some(BatchStatus::Expired);
                return Ok(reply);
            }
            Err(e) => return Err(e),
        };

        let mut outcome_lines = Vec::new();
        // Notes changed by earlier actions of this batch, with their new hash.
        let mut carried: HashMap<String, Option<String>> = HashMap::new();
        for resolved in &resolution.resolved {
            let action = &resolved.action;
            match resolved.verdict {
                Verdict::Execute => {
                    let rebased;
                    let action = match carried.get(&action.target) {
                        Some(hash) => {
                            rebased = PendingAction {
                                base_hash: hash.clone(),
                                ..action.clone()
                            };
                            &rebased
                        }
                        None => action,
                    };
                    let result = self.router.execute_approved(action, identity);
                    if result.success && action.kind != ActionKind::Settings {
                        self.carry_hash(identity, &action.target, &mut carried);
                    }
                    outcome_lines.push(if result.success {
                        format!("done: {}", action.preview.summary)
                    } else {
                        format!(
                            "failed: {} ({})",
                            action.preview.summary,
                            result.error.as_deref().unwrap_or("unknown error")
                        )
                    });
                    state.push_tool_result(
                        &action.tool_call_id,
                        result.to_model_value(self.config.max_tool_result_chars),
                    );
                }
                Verdict::Discard => {
                    self.router
                        .record_unperformed(action, identity, AuditStatus::RejectedByUser);
                    outcome_lines.push(format!("rejected: {}", action.preview.summary));
                    state.push_tool_result(&action.tool_call_id, json!(REJECTED_RESULT));
                }
            }
        }

        if !resolution.is_complete() {
            self.conversations.save(&state)?;
            let mut reply = AgentReply::notice(format!(
                "{}\n\n{}",
                outcome_lines.join("\n"),
                confirmation_prompt(&resolution.batch)
            ));
            reply.pending = Some(resolution.batch);
            return Ok(reply);
        }

        state.pending_batch = None;
        let result = self.run_rounds(&mut state, interactive).await;
        self.finish_turn(&state, result).map(|mut reply| {
            reply.resolved = Some(resolution.batch.status);
            reply
        })
    }

    /// Record the hash `target` has after one of the batch's own actions
    /// changed it, so later actions on the same note are checked against
    /// that rather than the state they were proposed on.
    fn carry_hash(
        &self,
        identity: &str,
        target: &str,
        carried: &mut HashMap<String, Option<String>>,
    ) {
        let hash = match self.ctx().current_hash(target) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "could not rehash note after approved action");
                return;
            }
        };
        if let Err(e) = self.confirmations.rebase(identity, target, hash.as_deref()) {
            tracing::warn!(identity = %identity, target = %target, error = %e, "could not rebase pending actions");
        }
        carried.insert(target.to_string(), hash);
    }

    /// Persist the state whatever happened, then turn the outcome into a reply.
    fn finish_turn(
        &self,
        state: &ConversationState,
        result: Result<AgentReply, AgentError>,
    ) -> Result<AgentReply, AgentError> {
        self.conversations.save(state)?;
        match result {
            Ok(reply) => Ok(reply),
            Err(e @ AgentError::AgentLoopExceededError { .. }) => {
                tracing::warn!(identity = %state.identity, error = %e, "tool round limit reached");
                Ok(AgentReply::error(&e))
            }
            Err(e) => Err(e),
        }
    }

    /// Close out a batch that lapsed without a decision: every deferred call
    /// gets an "expired" result and the pointer is cleared.
    ///
    /// Returns whether anything was settled.
    fn settle_lapsed(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, AgentError> {
        if state.pending_batch.is_none() {
            return Ok(false);
        }
        if let Some(batch) = self.confirmations.expire(&state.identity, now)? {
            for action in batch.pending_actions() {
                self.router
                    .record_unperformed(action, &state.identity, AuditStatus::Expired);
            }
        }
        for call_id in state.unanswered_tool_calls() {
            state.push_tool_result(&call_id, json!(EXPIRED_RESULT));
        }
        tracing::info!(identity = %state.identity, batch = ?state.pending_batch, "abandoned batch settled as expired");
        state.pending_batch = None;
        Ok(true)
    }

    /// Periodic bookkeeping for other identities' lapsed batches.
    fn sweep_others(&self, now: DateTime<Utc>) {
        match self.confirmations.sweep(now) {
            Ok(expired) => {
                for batch in expired {
                    for action in batch.pending_actions() {
                        self.router
                            .record_unperformed(action, &batch.identity, AuditStatus::Expired);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "confirmation sweep failed"),
        }
    }

    // ─── Model rounds ───────────────────────────────────────────────────

    async fn run_rounds(
        &self,
        state: &mut ConversationState,
        interactive: bool,
    ) -> Result<AgentReply, AgentError> {
        let confirmations_required =
            interactive && self.ctx().settings.get().require_confirmations;

        for round in 0..self.config.max_tool_rounds {
            let messages = self.build_messages(state)?;
            tracing::debug!(
                round,
                estimated_tokens = tokens::estimate_request_tokens(&messages),
                "calling model"
            );
            let reply = self.call_model(messages).await?;

            if !reply.has_tool_calls() {
                let text = reply
                    .content
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| "Done.".to_string());
                state.push_assistant(&text);
                return Ok(AgentReply::normal(text));
            }

            let ModelReply {
                content, tool_calls, ..
            } = reply;
            state.push_tool_calls(content.as_deref(), tool_calls.clone());

            let mut deferred = Vec::new();
            for call in &tool_calls {
                tracing::info!(round, tool = %call.name, "tool call");
                match self
                    .router
                    .dispatch_single(call, &state.identity, confirmations_required)
                {
                    Dispatch::Done(result) => state.push_tool_result(
                        &call.id,
                        result.to_model_value(self.config.max_tool_result_chars),
                    ),
                    Dispatch::Deferred(action) => deferred.push(action),
                }
            }

            if !deferred.is_empty() {
                let timeout = self.ctx().settings.get().confirmation_timeout_minutes;
                let call_ids: Vec<String> =
                    deferred.iter().map(|a| a.tool_call_id.clone()).collect();
                let batch = match self
                    .confirmations
                    .propose(&state.identity, deferred, timeout, self.now())
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        for id in &call_ids {
                            state.push_tool_result(id, json!({ "error": e.to_string() }));
                        }
                        return Err(e);
                    }
                };
                state.pending_batch = Some(batch.id.clone());
                let mut reply = AgentReply::normal(confirmation_prompt(&batch));
                reply.pending = Some(batch);
                return Ok(reply);
            }
        }

        Err(AgentError::AgentLoopExceededError {
            rounds: self.config.max_tool_rounds,
        })
    }

    fn build_messages(&self, state: &ConversationState) -> Result<Vec<ChatMessage>, AgentError> {
        let now = self.now();
        let snapshot = self.ctx().index.ensure_fresh(now)?;
        let summary = render_summary(&snapshot, self.config.summary_limits, now);
        let guidelines = load_guidelines(
            self.ctx().vault(),
            &self.config.guideline_note,
            self.config.guideline_max_chars,
        );
        let prompt = build_system_prompt(
            now.with_timezone(&Local),
            guidelines.as_deref(),
            &summary,
        );
        Ok(state.build_chat_messages(&prompt))
    }

    /// Call the model with a timeout, retrying once after a backoff.
    async fn call_model(&self, messages: Vec<ChatMessage>) -> Result<ModelReply, AgentError> {
        let tools = self.router.registry().tool_definitions();
        let mut attempt = 0;
        loop {
            let outcome = tokio::time::timeout(
                self.config.model_timeout,
                self.model.complete(messages.clone(), tools.clone()),
            )
            .await;

            let (err, retriable) = match outcome {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => {
                    let retriable = e.is_retriable();
                    (model_error(e), retriable)
                }
                Err(_) => (
                    AgentError::ModelTimeoutError {
                        duration_secs: self.config.model_timeout.as_secs(),
                    },
                    true,
                ),
            };

            if !retriable || attempt >= MODEL_RETRIES {
                return Err(err);
            }
            attempt += 1;
            tracing::warn!(
                model = %self.model.model_name(),
                attempt,
                error = %err,
                "model call failed, retrying"
            );
            tokio::time::sleep(self.config.model_retry_backoff).await;
        }
    }
}

fn model_error(e: InferenceError) -> AgentError {
    match e {
        InferenceError::Timeout { duration_secs } => AgentError::ModelTimeoutError { duration_secs },
        other => AgentError::ModelError {
            reason: other.to_string(),
        },
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    use crate::agent_core::database::{self, AgentDatabase};
    use crate::inference::{ToolCall, ToolDefinition};
    use crate::tools::vault_tools;
    use crate::vault::{SettingsPatch, SettingsStore, Vault, VaultIndex};

    /// Model that replays a fixed script and records what it was sent.
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<ModelReply, InferenceError>>>,
        delay: Option<Duration>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<ModelReply, InferenceError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                delay: None,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                delay: Some(delay),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn last_request(&self) -> Vec<ChatMessage> {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(
            &self,
            messages: Vec<ChatMessage>,
            _tools: Vec<ToolDefinition>,
        ) -> Result<ModelReply, InferenceError> {
            self.seen.lock().unwrap().push(messages);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(InferenceError::ConfigError {
                        reason: "script exhausted".to_string(),
                    })
                })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct Harness {
        _dir: TempDir,
        agent: AgentLoop,
        ctx: ToolContext,
        db: SharedDatabase,
        clock: Arc<Mutex<DateTime<Utc>>>,
    }

    impl Harness {
        fn advance(&self, minutes: i64) {
            let mut now = self.clock.lock().unwrap();
            *now += ChronoDuration::minutes(minutes);
        }

        fn audit(&self) -> Vec<crate::agent_core::types::AuditEntry> {
            database::lock(&self.db)
                .unwrap()
                .get_audit_entries("u1")
                .unwrap()
        }

        fn history(&self) -> ConversationState {
            ConversationStore::new(self.db.clone()).load("u1").unwrap()
        }
    }

    fn harness(model: Arc<ScriptedModel>, config: AgentLoopConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let settings = Arc::new(SettingsStore::load(vault.state_dir().join("settings.json")));
        let index = Arc::new(VaultIndex::new(vault, ChronoDuration::minutes(5), None));
        let ctx = ToolContext::new(index, settings);
        let db = AgentDatabase::open(":memory:").unwrap().shared();

        let clock = Arc::new(Mutex::new(Utc::now()));
        let clock_ref = clock.clone();
        let agent = AgentLoop::new(
            model,
            Arc::new(vault_tools()),
            ctx.clone(),
            db.clone(),
            config,
        )
        .with_clock(Arc::new(move || *clock_ref.lock().unwrap()));

        Harness {
            _dir: dir,
            agent,
            ctx,
            db,
            clock,
        }
    }

    fn tool(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn delete_old() -> ModelReply {
        ModelReply::tools(vec![tool(
            "call_del",
            "delete_note",
            json!({"path": "Old.md"}),
        )])
    }

    #[tokio::test]
    async fn test_delete_then_reject_keeps_note() {
        let model = ScriptedModel::new(vec![
            Ok(delete_old()),
            Ok(ModelReply::text("Okay, I left Old.md alone.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "old stuff").unwrap();

        let reply = h.agent.handle_message("u1", "delete Old.md", true).await;
        let batch = reply.pending.clone().expect("batch proposed");
        assert_eq!(batch.actions.len(), 1);
        assert_eq!(batch.actions[0].kind, crate::agent_core::types::ActionKind::Delete);
        assert_eq!(batch.actions[0].target, "Old.md");
        assert!(reply.text.contains("Delete"));
        assert!(h.ctx.vault().exists("Old.md").unwrap());
        assert_eq!(h.history().pending_batch.as_deref(), Some(batch.id.as_str()));

        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::Reject, None, true)
            .await;
        assert_eq!(reply.kind, ReplyKind::Normal);
        assert_eq!(reply.resolved, Some(BatchStatus::Rejected));
        assert_eq!(reply.text, "Okay, I left Old.md alone.");
        assert!(h.ctx.vault().exists("Old.md").unwrap());

        let audit = h.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].result_status, AuditStatus::RejectedByUser);

        // The model saw the rejection as the deferred call's result.
        let last = model.last_request();
        let tool_msg = last
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_del"))
            .unwrap();
        assert_eq!(tool_msg.content.as_deref(), Some(REJECTED_RESULT));
        assert!(h.history().pending_batch.is_none());
    }

    #[tokio::test]
    async fn test_delete_without_confirmations_runs_in_turn() {
        let model = ScriptedModel::new(vec![
            Ok(delete_old()),
            Ok(ModelReply::text("Deleted Old.md.")),
        ]);
        let h = harness(model, AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "old stuff").unwrap();

        let reply = h.agent.handle_message("u1", "delete Old.md", false).await;
        assert!(reply.pending.is_none());
        assert_eq!(reply.text, "Deleted Old.md.");
        assert!(!h.ctx.vault().exists("Old.md").unwrap());

        let audit = h.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].tool_name, "delete_note");
        assert_eq!(audit[0].result_status, AuditStatus::Success);
        assert!(!audit[0].user_confirmed);
    }

    #[tokio::test]
    async fn test_settings_can_disable_confirmations() {
        let model = ScriptedModel::new(vec![Ok(delete_old()), Ok(ModelReply::text("Gone."))]);
        let h = harness(model, AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "x").unwrap();
        h.ctx
            .settings
            .apply(&SettingsPatch {
                require_confirmations: Some(false),
                confirmation_timeout_minutes: None,
            })
            .unwrap();

        let reply = h.agent.handle_message("u1", "delete Old.md", true).await;
        assert!(reply.pending.is_none());
        assert!(!h.ctx.vault().exists("Old.md").unwrap());
    }

    #[tokio::test]
    async fn test_resolve_after_expiry_does_nothing() {
        let model = ScriptedModel::new(vec![Ok(delete_old())]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "old stuff").unwrap();

        let reply = h.agent.handle_message("u1", "delete Old.md", true).await;
        assert!(reply.pending.is_some());

        h.advance(6);
        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::ConfirmAll, None, true)
            .await;
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert_eq!(reply.resolved, Some(BatchStatus::Expired));
        assert!(reply.text.contains("expired"));
        assert!(h.ctx.vault().exists("Old.md").unwrap());
        assert_eq!(model.calls(), 1);

        let history = h.history();
        assert!(history.pending_batch.is_none());
        let last = history.turns.last().unwrap();
        assert_eq!(last.content.as_deref(), Some(EXPIRED_RESULT));
        assert_eq!(h.audit()[0].result_status, AuditStatus::Expired);

        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::ConfirmAll, None, true)
            .await;
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert!(reply.text.contains("nothing waiting"));
    }

    #[tokio::test]
    async fn test_confirm_all_executes_every_action() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::tools(vec![
                tool("c1", "delete_note", json!({"path": "A"})),
                tool("c2", "append_to_note", json!({"path": "B", "content": "- [ ] eggs"})),
                tool("c3", "read_note", json!({"path": "B"})),
            ])),
            Ok(ModelReply::text("Deleted A and added eggs to B.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("A.md", "a").unwrap();
        h.ctx.vault().write("B.md", "# List").unwrap();

        let reply = h.agent.handle_message("u1", "tidy up", true).await;
        let batch = reply.pending.unwrap();
        assert_eq!(batch.actions.len(), 2);

        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::ConfirmAll, None, true)
            .await;
        assert_eq!(reply.resolved, Some(BatchStatus::Confirmed));
        assert_eq!(reply.text, "Deleted A and added eggs to B.");
        assert!(!h.ctx.vault().exists("A.md").unwrap());
        assert_eq!(h.ctx.vault().read("B.md").unwrap(), "# List\n- [ ] eggs");

        let audit = h.audit();
        let confirmed: Vec<_> = audit.iter().filter(|e| e.user_confirmed).collect();
        assert_eq!(confirmed.len(), 2);
        assert!(confirmed.iter().all(|e| e.result_status == AuditStatus::Success));

        // Every tool call in history has exactly one result.
        assert!(h.history().unanswered_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_batch_actions_on_same_note_all_apply() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::tools(vec![
                tool("c1", "append_to_note", json!({"path": "B", "content": "- eggs"})),
                tool("c2", "append_to_note", json!({"path": "B", "content": "- milk"})),
            ])),
            Ok(ModelReply::text("Added both.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("B.md", "# List").unwrap();

        h.agent.handle_message("u1", "add eggs and milk", true).await;
        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::ConfirmAll, None, true)
            .await;
        assert_eq!(reply.resolved, Some(BatchStatus::Confirmed));
        assert_eq!(h.ctx.vault().read("B.md").unwrap(), "# List\n- eggs\n- milk");

        let confirmed: Vec<_> = h.audit().into_iter().filter(|e| e.user_confirmed).collect();
        assert_eq!(confirmed.len(), 2);
        assert!(confirmed.iter().all(|e| e.result_status == AuditStatus::Success));
    }

    #[tokio::test]
    async fn test_same_note_actions_confirmed_one_by_one() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::tools(vec![
                tool("c1", "append_to_note", json!({"path": "B", "content": "- eggs"})),
                tool("c2", "append_to_note", json!({"path": "B", "content": "- milk"})),
            ])),
            Ok(ModelReply::text("Added both.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("B.md", "# List").unwrap();

        h.agent.handle_message("u1", "add eggs and milk", true).await;
        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::Confirm, Some("1"), true)
            .await;
        assert!(reply.text.contains("done: "));
        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::Confirm, Some("2"), true)
            .await;
        assert_eq!(reply.resolved, Some(BatchStatus::Confirmed));
        assert_eq!(h.ctx.vault().read("B.md").unwrap(), "# List\n- eggs\n- milk");
    }

    #[tokio::test]
    async fn test_outside_edit_still_refuses_approved_action() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::tools(vec![tool(
                "c1",
                "append_to_note",
                json!({"path": "B", "content": "- eggs"}),
            )])),
            Ok(ModelReply::text("Could not add eggs.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("B.md", "# List").unwrap();

        h.agent.handle_message("u1", "add eggs", true).await;
        h.ctx.vault().write("B.md", "# List\nedited elsewhere").unwrap();
        h.agent
            .resolve_confirmation("u1", Decision::ConfirmAll, None, true)
            .await;
        assert_eq!(h.ctx.vault().read("B.md").unwrap(), "# List\nedited elsewhere");
        let confirmed: Vec<_> = h.audit().into_iter().filter(|e| e.user_confirmed).collect();
        assert_eq!(confirmed[0].result_status, AuditStatus::Error);
    }

    #[tokio::test]
    async fn test_partial_decision_keeps_batch_open() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::tools(vec![
                tool("c1", "delete_note", json!({"path": "A"})),
                tool("c2", "delete_note", json!({"path": "B"})),
            ])),
            Ok(ModelReply::text("Deleted B only.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("A.md", "a").unwrap();
        h.ctx.vault().write("B.md", "b").unwrap();

        h.agent.handle_message("u1", "delete A and B", true).await;
        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::Reject, Some("1"), true)
            .await;
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert!(reply.text.contains("rejected: "));
        assert_eq!(reply.pending.as_ref().unwrap().pending_count(), 1);
        assert_eq!(model.calls(), 1);

        let reply = h
            .agent
            .resolve_confirmation("u1", Decision::Confirm, Some("2"), true)
            .await;
        assert_eq!(reply.resolved, Some(BatchStatus::Confirmed));
        assert!(h.ctx.vault().exists("A.md").unwrap());
        assert!(!h.ctx.vault().exists("B.md").unwrap());
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_new_message_while_pending_is_refused() {
        let model = ScriptedModel::new(vec![Ok(delete_old())]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "x").unwrap();

        h.agent.handle_message("u1", "delete Old.md", true).await;
        let reply = h.agent.handle_message("u1", "what's in my vault?", true).await;
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert!(reply.pending.is_some());
        assert_eq!(model.calls(), 1);
        // Refused message is not recorded.
        assert_eq!(h.history().turns.len(), 2);
    }

    #[tokio::test]
    async fn test_message_after_lapse_settles_abandoned_batch() {
        let model = ScriptedModel::new(vec![
            Ok(delete_old()),
            Ok(ModelReply::text("Your vault has one note.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "x").unwrap();

        h.agent.handle_message("u1", "delete Old.md", true).await;
        h.advance(10);
        let reply = h.agent.handle_message("u1", "what's in my vault?", true).await;
        assert_eq!(reply.kind, ReplyKind::Normal);
        assert!(reply.text.contains("expired"));
        assert!(reply.text.ends_with("Your vault has one note."));
        assert!(h.ctx.vault().exists("Old.md").unwrap());

        let sent = model.last_request();
        let expired = sent
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_del"))
            .unwrap();
        assert_eq!(expired.content.as_deref(), Some(EXPIRED_RESULT));
    }

    #[tokio::test]
    async fn test_round_limit_returns_apology() {
        let replies = (0..3)
            .map(|i| {
                Ok(ModelReply::tools(vec![tool(
                    &format!("c{i}"),
                    "glob_notes",
                    json!({"pattern": "**/*.md"}),
                )]))
            })
            .collect();
        let model = ScriptedModel::new(replies);
        let config = AgentLoopConfig {
            max_tool_rounds: 3,
            ..AgentLoopConfig::default()
        };
        let h = harness(model.clone(), config);

        let reply = h.agent.handle_message("u1", "find everything", true).await;
        assert_eq!(reply.kind, ReplyKind::Error);
        assert!(reply.text.starts_with("Sorry"));
        assert_eq!(model.calls(), 3);
        assert!(h.history().unanswered_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_model_timeout_retried_then_reported() {
        let model = ScriptedModel::slow(Duration::from_millis(200));
        let config = AgentLoopConfig {
            model_timeout: Duration::from_millis(20),
            model_retry_backoff: Duration::from_millis(1),
            ..AgentLoopConfig::default()
        };
        let h = harness(model.clone(), config);

        let reply = h.agent.handle_message("u1", "hello", true).await;
        assert_eq!(reply.kind, ReplyKind::Error);
        assert!(reply.text.contains("try again"));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let model = ScriptedModel::new(vec![
            Err(InferenceError::HttpError {
                status: 503,
                body: "busy".to_string(),
            }),
            Ok(ModelReply::text("Hi!")),
        ]);
        let config = AgentLoopConfig {
            model_retry_backoff: Duration::from_millis(1),
            ..AgentLoopConfig::default()
        };
        let h = harness(model.clone(), config);

        let reply = h.agent.handle_message("u1", "hello", true).await;
        assert_eq!(reply.text, "Hi!");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_prompt_carries_guidelines_and_summary() {
        let model = ScriptedModel::new(vec![Ok(ModelReply::text("Hi!"))]);
        let h = harness(model.clone(), AgentLoopConfig::default());
        h.ctx.vault().write("KNAP.md", "Answer in French.").unwrap();
        h.ctx.vault().write("Projects/Plan.md", "# Plan\n#work").unwrap();

        h.agent.handle_message("u1", "hello", true).await;
        let sent = model.last_request();
        let system = sent[0].content.as_deref().unwrap();
        assert!(system.contains("## User Guidelines\n\nAnswer in French."));
        assert!(system.contains("## Your Vault"));
        assert!(system.contains("#work"));
        assert_eq!(sent.last().unwrap().content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_history_persists_and_clears() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::text("First.")),
            Ok(ModelReply::text("Second.")),
        ]);
        let h = harness(model.clone(), AgentLoopConfig::default());

        h.agent.handle_message("u1", "one", true).await;
        h.agent.handle_message("u1", "two", true).await;
        assert_eq!(h.history().turns.len(), 4);
        // System prompt, the first exchange, then the new message.
        assert_eq!(model.last_request().len(), 4);

        let reply = h.agent.clear_history("u1").await;
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert!(h.history().turns.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_index_reply() {
        let model = ScriptedModel::new(vec![]);
        let h = harness(model, AgentLoopConfig::default());
        h.ctx.vault().write("A.md", "#tag").unwrap();
        let reply = h.agent.refresh_index();
        assert_eq!(reply.kind, ReplyKind::Notice);
        assert!(reply.text.contains("1 notes"));
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let model = ScriptedModel::new(vec![Ok(delete_old()), Ok(ModelReply::text("Hi u2"))]);
        let h = harness(model, AgentLoopConfig::default());
        h.ctx.vault().write("Old.md", "x").unwrap();

        let first = h.agent.handle_message("u1", "delete Old.md", true).await;
        assert!(first.pending.is_some());
        let other = h.agent.handle_message("u2", "hello", true).await;
        assert_eq!(other.text, "Hi u2");
        assert!(h.agent.pending_batch("u1").unwrap().is_some());
        assert!(h.agent.pending_batch("u2").unwrap().is_none());
    }
}
