//! Shared types for the agent core.
//!
//! Conversation turns, pending destructive actions, confirmation batches, and
//! audit entries used across the conversation store, confirmation store, and
//! agent loop.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::types::{Role, ToolCall};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single turn stored in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Message role: user, assistant, or tool.
    pub role: Role,
    /// Text content (user input, assistant reply).
    pub content: Option<String>,
    /// Tool calls made by the assistant in this turn.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For `tool` role: the ID of the tool call this result belongs to.
    pub tool_call_id: Option<String>,
    /// For `tool` role: the JSON result from executing the tool.
    pub tool_result: Option<serde_json::Value>,
    /// ISO 8601 timestamp.
    pub timestamp: String,
}

// ─── Pending Actions ────────────────────────────────────────────────────────

/// Kind of mutation a destructive tool performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Edit,
    Delete,
    Settings,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Edit => "edit",
            ActionKind::Delete => "delete",
            ActionKind::Settings => "settings",
        }
    }
}

/// Human-readable before/after view of a proposed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPreview {
    /// One-line description, e.g. "Delete note Old.md".
    pub summary: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Per-action decision state inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
}

/// One proposed destructive mutation awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Short id, unique within its batch ("1", "2", ...).
    pub id: String,
    /// The model tool call this action answers.
    pub tool_call_id: String,
    pub tool_name: String,
    pub kind: ActionKind,
    /// Target note path (or `settings`).
    pub target: String,
    pub preview: ActionPreview,
    /// Arguments to execute with once approved.
    pub arguments: serde_json::Value,
    /// Content hash of the target when proposed; `None` if it did not exist.
    pub base_hash: Option<String>,
    pub status: ActionStatus,
}

// ─── Confirmation Batches ───────────────────────────────────────────────────

/// Lifecycle of a confirmation batch. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Confirmed,
    Rejected,
    Expired,
}

impl BatchStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Confirmed => "confirmed",
            BatchStatus::Rejected => "rejected",
            BatchStatus::Expired => "expired",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => BatchStatus::Pending,
            "confirmed" => BatchStatus::Confirmed,
            "rejected" => BatchStatus::Rejected,
            _ => BatchStatus::Expired,
        }
    }
}

/// Ordered group of pending actions proposed in one model round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationBatch {
    /// Short opaque id (first 8 chars of a UUID).
    pub id: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    /// Timeout in force when the batch was created.
    pub timeout_minutes: u32,
    pub status: BatchStatus,
    pub actions: Vec<PendingAction>,
}

impl ConfirmationBatch {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(i64::from(self.timeout_minutes))
    }

    /// Expiry is derived from the clock, never stored.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn pending_actions(&self) -> impl Iterator<Item = &PendingAction> {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_actions().count()
    }
}

/// A user decision on a pending batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Approve one named action.
    Confirm,
    /// Approve every action still pending.
    ConfirmAll,
    /// Reject one named action, or every pending action when no id is given.
    Reject,
}

/// What the caller must do with a resolved action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Execute,
    Discard,
}

/// One action affected by a resolve call.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub action: PendingAction,
    pub verdict: Verdict,
}

/// Outcome of `ConfirmationStore::resolve`.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Batch state after applying the decision.
    pub batch: ConfirmationBatch,
    pub resolved: Vec<ResolvedAction>,
}

impl Resolution {
    /// True once no action in the batch is pending.
    pub fn is_complete(&self) -> bool {
        self.batch.status != BatchStatus::Pending
    }
}

// ─── Audit Log ──────────────────────────────────────────────────────────────

/// A single entry in the tool execution audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Auto-incremented row ID.
    pub id: i64,
    /// Identity the action was performed for.
    pub identity: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// The tool that was executed.
    pub tool_name: String,
    /// Arguments passed to the tool.
    pub arguments: serde_json::Value,
    /// Result returned by the tool (if successful).
    pub result: Option<serde_json::Value>,
    /// Execution status.
    pub result_status: AuditStatus,
    /// Whether the user approved this action.
    pub user_confirmed: bool,
    /// How long the execution took (ms).
    pub execution_time_ms: u64,
}

/// Status of a tool execution in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Tool executed successfully.
    Success,
    /// Tool execution returned an error.
    Error,
    /// User rejected the action.
    RejectedByUser,
    /// Batch lapsed before a decision.
    Expired,
}

impl AuditStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::RejectedByUser => "rejected_by_user",
            AuditStatus::Expired => "expired",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => AuditStatus::Success,
            "error" => AuditStatus::Error,
            "rejected_by_user" => AuditStatus::RejectedByUser,
            "expired" => AuditStatus::Expired,
            _ => AuditStatus::Error,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
