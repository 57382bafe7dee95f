//! Agent Core error types.

use thiserror::Error;

use crate::vault::VaultError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Vault access outside a tool call failed.
    #[error("vault error: {reason}")]
    VaultAccessError { reason: String },

    /// The vault index could not be built. The previous snapshot is kept.
    #[error("vault index unavailable: {reason}")]
    IndexBuildError { reason: String },

    /// One tool call failed. Reported back to the model, never fatal to a turn.
    #[error("tool '{tool_name}' failed: {reason}")]
    ToolExecutionError {
        tool_name: String,
        arguments: serde_json::Value,
        reason: String,
    },

    /// The model asked for a tool that is not registered.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool arguments do not match the declared schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A batch is already awaiting a decision for this identity.
    #[error("identity '{identity}' already has pending batch '{batch_id}'")]
    ConfirmationConflictError { identity: String, batch_id: String },

    /// No batch is awaiting a decision for this identity.
    #[error("no pending confirmation for '{identity}'")]
    NoBatchError { identity: String },

    /// The batch lapsed before a decision arrived.
    #[error("confirmation batch '{batch_id}' expired")]
    BatchExpiredError { batch_id: String },

    /// The selector names no pending action in the batch.
    #[error("no pending action '{action_id}' in batch '{batch_id}'")]
    UnknownAction { batch_id: String, action_id: String },

    /// The model did not answer in time.
    #[error("model did not respond within {duration_secs}s")]
    ModelTimeoutError { duration_secs: u64 },

    /// The model call failed for a reason other than a timeout.
    #[error("model call failed: {reason}")]
    ModelError { reason: String },

    /// Too many tool rounds without a final answer.
    #[error("agent loop exceeded {rounds} tool rounds")]
    AgentLoopExceededError { rounds: usize },
}

impl AgentError {
    /// Message shown to the user when this error ends a request.
    ///
    /// Distinct from normal replies; front ends render it as a notice.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::ConfirmationConflictError { .. } => {
                "There are still actions waiting for your approval. Approve or reject them first."
                    .to_string()
            }
            AgentError::NoBatchError { .. } => "There is nothing waiting for approval.".to_string(),
            AgentError::BatchExpiredError { .. } => {
                "Those pending actions expired and were not performed. Ask again if you still want them."
                    .to_string()
            }
            AgentError::UnknownAction { action_id, .. } => {
                format!("There is no pending action '{action_id}'.")
            }
            AgentError::ModelTimeoutError { .. } => {
                "The assistant took too long to respond. Please try again.".to_string()
            }
            AgentError::ModelError { .. } => {
                "The assistant is unavailable right now. Please try again.".to_string()
            }
            AgentError::AgentLoopExceededError { .. } => {
                "Sorry, I couldn't finish that request. Could you try breaking it into smaller steps?"
                    .to_string()
            }
            AgentError::IndexBuildError { reason } => {
                format!("I couldn't read the vault right now ({reason}).")
            }
            other => format!("Something went wrong: {other}"),
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<VaultError> for AgentError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::IndexBuild { .. } => AgentError::IndexBuildError {
                reason: e.to_string(),
            },
            other => AgentError::VaultAccessError {
                reason: other.to_string(),
            },
        }
    }
}
