//! Agent Core — conversation engine for the vault assistant.
//!
//! Submodules:
//! - `agent_loop`: Model/tool exchange, confirmation suspend and resume
//! - `confirmation`: Pending destructive actions, per-identity batches, expiry
//! - `conversation`: Per-identity history and its store
//! - `tool_router`: Dispatches model tool calls to the vault tool registry
//! - `prompts`: System prompt assembly (rules, date, guidelines, vault summary)
//! - `tokens`: Token estimation and UTF-8 safe truncation
//! - `database`: SQLite persistence for conversations, batches, audit
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod agent_loop;
pub mod confirmation;
pub mod conversation;
pub mod database;
pub mod errors;
pub mod prompts;
pub mod tokens;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use agent_loop::{AgentLoop, AgentLoopConfig, AgentReply, ReplyKind};
pub use confirmation::ConfirmationStore;
pub use conversation::{ConversationState, ConversationStore};
pub use database::{AgentDatabase, SharedDatabase};
pub use errors::AgentError;
pub use tool_router::ToolRouter;
pub use types::{
    ActionKind, AuditEntry, AuditStatus, BatchStatus, ConfirmationBatch, ConversationMessage,
    Decision, PendingAction,
};
