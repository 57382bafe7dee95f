//! Per-identity conversation history.
//!
//! `ConversationState` is the in-memory value the agent loop works on; the
//! `ConversationStore` loads and saves it through the shared database. A
//! save replaces the stored turns in one transaction, so a concurrent load
//! sees either the previous or the new history.

use chrono::Utc;

use crate::inference::types::{ChatMessage, FunctionCallResponse, Role, ToolCall, ToolCallResponse};

use super::database::{self, SharedDatabase};
use super::errors::AgentError;
use super::types::ConversationMessage;

// ─── ConversationState ──────────────────────────────────────────────────────

/// Ordered history for one identity plus its outstanding batch, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub identity: String,
    pub turns: Vec<ConversationMessage>,
    /// Id of the confirmation batch this conversation is waiting on.
    pub pending_batch: Option<String>,
}

impl ConversationState {
    /// Empty state, as returned for an identity seen for the first time.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            turns: Vec::new(),
            pending_batch: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn push(&mut self, role: Role, content: Option<String>) -> &mut ConversationMessage {
        self.turns.push(ConversationMessage {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            tool_result: None,
            timestamp: Utc::now().to_rfc3339(),
        });
        let last = self.turns.len() - 1;
        &mut self.turns[last]
    }

    pub fn push_user(&mut self, content: &str) {
        self.push(Role::User, Some(content.to_string()));
    }

    pub fn push_assistant(&mut self, content: &str) {
        self.push(Role::Assistant, Some(content.to_string()));
    }

    /// Record an assistant turn that requested tool calls.
    pub fn push_tool_calls(&mut self, content: Option<&str>, calls: Vec<ToolCall>) {
        let msg = self.push(Role::Assistant, content.map(str::to_string));
        msg.tool_calls = Some(calls);
    }

    /// Record the result for one tool call.
    pub fn push_tool_result(&mut self, tool_call_id: &str, result: serde_json::Value) {
        // Plain strings are stored as-is; double-encoding them confuses small models.
        let text = match result.as_str() {
            Some(s) => s.to_string(),
            None => result.to_string(),
        };
        let msg = self.push(Role::Tool, Some(text));
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg.tool_result = Some(result);
    }

    /// Ids of tool calls in the latest assistant turn that have no result yet.
    pub fn unanswered_tool_calls(&self) -> Vec<String> {
        let Some(start) = self
            .turns
            .iter()
            .rposition(|t| t.role == Role::Assistant && t.tool_calls.is_some())
        else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.turns[start + 1..]
            .iter()
            .filter_map(|t| t.tool_call_id.as_deref())
            .collect();
        self.turns[start]
            .tool_calls
            .iter()
            .flatten()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Keep at most `max` of the newest turns, cutting only where a user
    /// turn begins so tool calls never lose their results.
    ///
    /// Returns the number of turns dropped.
    pub fn trim_history(&mut self, max: usize) -> usize {
        if self.turns.len() <= max {
            return 0;
        }
        let earliest = self.turns.len() - max;
        let cut = self.turns[earliest..]
            .iter()
            .position(|t| t.role == Role::User)
            .map(|offset| earliest + offset)
            .or_else(|| self.turns.iter().rposition(|t| t.role == Role::User))
            .unwrap_or(0);
        self.turns.drain(..cut);
        cut
    }

    /// Build the message list for the model: system prompt, then history.
    pub fn build_chat_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut chat_messages = Vec::with_capacity(self.turns.len() + 1);
        chat_messages.push(ChatMessage::system(system_prompt));

        for msg in &self.turns {
            match msg.role {
                // System prompts are rebuilt every turn, never stored.
                Role::System => {}
                Role::User => chat_messages.push(ChatMessage {
                    role: Role::User,
                    content: msg.content.clone(),
                    tool_call_id: None,
                    tool_calls: None,
                }),
                Role::Assistant => {
                    let tool_calls = msg.tool_calls.as_ref().map(|calls| {
                        calls
                            .iter()
                            .map(|tc| ToolCallResponse {
                                id: tc.id.clone(),
                                r#type: "function".to_string(),
                                function: FunctionCallResponse {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.to_string(),
                                },
                            })
                            .collect()
                    });
                    chat_messages.push(ChatMessage {
                        role: Role::Assistant,
                        content: msg.content.clone(),
                        tool_call_id: None,
                        tool_calls,
                    });
                }
                Role::Tool => chat_messages.push(ChatMessage {
                    role: Role::Tool,
                    content: msg.content.clone(),
                    tool_call_id: msg.tool_call_id.clone(),
                    tool_calls: None,
                }),
            }
        }

        chat_messages
    }
}

// ─── ConversationStore ──────────────────────────────────────────────────────

/// Load/save access to persisted conversations.
#[derive(Clone)]
pub struct ConversationStore {
    db: SharedDatabase,
}

impl ConversationStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Unknown identities load as an empty state.
    pub fn load(&self, identity: &str) -> Result<ConversationState, AgentError> {
        database::lock(&self.db)?.load_conversation(identity)
    }

    pub fn save(&self, state: &ConversationState) -> Result<(), AgentError> {
        database::lock(&self.db)?.save_conversation(state)
    }

    pub fn clear(&self, identity: &str) -> Result<(), AgentError> {
        database::lock(&self.db)?.delete_conversation(identity)?;
        tracing::info!(identity = %identity, "conversation cleared");
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
