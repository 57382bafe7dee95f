//! Plain-text rendering of agent replies for the terminal.

use crate::agent_core::tokens::truncate_chars;
use crate::agent_core::{AgentReply, BatchStatus, ConfirmationBatch, ReplyKind};

/// Lines of before/after text shown per action.
const MAX_PREVIEW_LINES: usize = 8;

/// Characters per preview line.
const MAX_PREVIEW_LINE_CHARS: usize = 120;

/// Render a reply, including the detail of any pending batch.
pub fn render_reply(reply: &AgentReply) -> String {
    let mut out = match reply.kind {
        ReplyKind::Normal => reply.text.clone(),
        ReplyKind::Notice => format!("[notice] {}", reply.text),
        ReplyKind::Error => format!("[error] {}", reply.text),
    };

    if let Some(status) = reply.resolved {
        let label = match status {
            BatchStatus::Confirmed => "changes applied",
            BatchStatus::Rejected => "changes rejected",
            BatchStatus::Expired => "changes expired",
            BatchStatus::Pending => "still pending",
        };
        out = format!("({label})\n{out}");
    }

    if let Some(batch) = &reply.pending {
        out.push_str("\n\n");
        out.push_str(&render_batch(batch));
    }
    out
}

/// Before/after detail for each pending action.
pub fn render_batch(batch: &ConfirmationBatch) -> String {
    let mut lines = vec![format!(
        "Pending changes (batch {}, expires {}):",
        batch.id,
        batch.expires_at().format("%H:%M:%S UTC")
    )];
    for action in batch.pending_actions() {
        lines.push(format!("  [{}] {}", action.id, action.preview.summary));
        if let Some(before) = &action.preview.before {
            push_preview(&mut lines, "-", before);
        }
        if let Some(after) = &action.preview.after {
            push_preview(&mut lines, "+", after);
        }
    }
    lines.join("\n")
}

fn push_preview(lines: &mut Vec<String>, marker: &str, text: &str) {
    let total = text.lines().count();
    for line in text.lines().take(MAX_PREVIEW_LINES) {
        lines.push(format!(
            "      {marker} {}",
            truncate_chars(line, MAX_PREVIEW_LINE_CHARS)
        ));
    }
    if total > MAX_PREVIEW_LINES {
        lines.push(format!("      {marker} ... ({} more lines)", total - MAX_PREVIEW_LINES));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::{ActionKind, ActionPreview, ActionStatus, PendingAction};
    use chrono::Utc;

    fn batch() -> ConfirmationBatch {
        ConfirmationBatch {
            id: "abcd1234".to_string(),
            identity: "u1".to_string(),
            created_at: Utc::now(),
            timeout_minutes: 5,
            status: BatchStatus::Pending,
            actions: vec![PendingAction {
                id: "1".to_string(),
                tool_call_id: "c1".to_string(),
                tool_name: "update_note".to_string(),
                kind: ActionKind::Update,
                target: "Todo.md".to_string(),
                preview: ActionPreview {
                    summary: "Replace the content of Todo.md".to_string(),
                    before: Some("- [ ] milk".to_string()),
                    after: Some((0..12).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")),
                },
                arguments: serde_json::json!({}),
                base_hash: None,
                status: ActionStatus::Pending,
            }],
        }
    }

    #[test]
    fn test_render_batch_bounds_preview() {
        let text = render_batch(&batch());
        assert!(text.contains("[1] Replace the content of Todo.md"));
        assert!(text.contains("- - [ ] milk"));
        assert!(text.contains("+ line 7"));
        assert!(!text.contains("+ line 8"));
        assert!(text.contains("(4 more lines)"));
    }

    #[test]
    fn test_render_reply_kinds() {
        let reply = AgentReply {
            text: "There is nothing waiting for approval.".to_string(),
            kind: ReplyKind::Notice,
            pending: None,
            resolved: None,
        };
        assert!(render_reply(&reply).starts_with("[notice] "));

        let pending = AgentReply {
            text: "I need your approval".to_string(),
            kind: ReplyKind::Normal,
            pending: Some(batch()),
            resolved: None,
        };
        let out = render_reply(&pending);
        assert!(out.starts_with("I need your approval\n\nPending changes (batch abcd1234"));
    }
}
