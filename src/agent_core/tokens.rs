//! Text bounding and token estimation for the model context.
//!
//! Token counts are character-based heuristics (~3.2 chars/token for prose,
//! ~2.8 for JSON). They are only used for logging and budgeting decisions,
//! never for correctness.

use crate::inference::types::{ChatMessage, Role};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

// ─── Truncation ─────────────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate a string to at most `max_chars` characters.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Estimation ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for a `ChatMessage`.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;

    if let Some(ref content) = message.content {
        total += match message.role {
            Role::Tool => estimate_json_tokens(content),
            _ => estimate_tokens(content),
        };
    }

    if let Some(ref calls) = message.tool_calls {
        for call in calls {
            total += TOOL_CALL_OVERHEAD_TOKENS;
            total += estimate_tokens(&call.function.name);
            total += estimate_json_tokens(&call.function.arguments);
        }
    }

    total
}

/// Estimate the total for a full request.
pub fn estimate_request_tokens(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{FunctionCallResponse, ToolCallResponse};

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        // "hello" = 5 chars → ceil(5/3.2) = 2
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 32);
    }

    #[test]
    fn test_estimate_json_tokens() {
        // 16 chars → ceil(16/2.8) = 6
        assert_eq!(estimate_json_tokens(r#"{"path": "/tmp"}"#), 6);
    }

    #[test]
    fn test_estimate_message_tokens() {
        let user = ChatMessage {
            role: Role::User,
            content: Some("Hello, world!".to_string()),
            tool_call_id: None,
            tool_calls: None,
        };
        // 4 overhead + ceil(13/3.2) = 9
        assert_eq!(estimate_message_tokens(&user), 9);

        let call = ChatMessage {
            role: Role::Assistant,
            content: None,
            tool_call_id: None,
            tool_calls: Some(vec![ToolCallResponse {
                id: "call_1".to_string(),
                r#type: "function".to_string(),
                function: FunctionCallResponse {
                    name: "read_note".to_string(),
                    arguments: r#"{"path": "/tmp"}"#.to_string(),
                },
            }]),
        };
        assert!(estimate_message_tokens(&call) > MESSAGE_OVERHEAD_TOKENS + TOOL_CALL_OVERHEAD_TOKENS);
        assert_eq!(
            estimate_request_tokens(&[user.clone(), user]),
            18
        );
    }

    #[test]
    fn test_truncate_utf8_within_multibyte() {
        let text = "═══";
        assert_eq!(truncate_utf8(text, 4), "═");
        assert_eq!(truncate_utf8(text, 6), "══");
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
