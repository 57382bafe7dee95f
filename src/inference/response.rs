//! Chat-completion response parsing.
//!
//! Turns a non-streaming `/chat/completions` body into a [`ModelReply`].
//! Tool-call ids are generated when the server omits them, and empty
//! argument strings are read as `{}`.

use serde::Deserialize;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ModelReply, ToolCall};

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    id: Option<String>,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Parse a complete response body.
pub fn parse_completion_response(body: &str) -> Result<ModelReply, InferenceError> {
    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseError {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
        let arguments = parse_arguments(&tc.function.arguments)?;
        tool_calls.push(ToolCall {
            id,
            name: tc.function.name,
            arguments,
        });
    }

    Ok(ModelReply {
        content,
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}

fn parse_arguments(raw: &str) -> Result<serde_json::Value, InferenceError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| InferenceError::ToolCallParseError {
        raw_response: raw.to_string(),
        reason: format!("invalid JSON: {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_reply() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Done."},"finish_reason":"stop"}]}"#;
        let reply = parse_completion_response(body).unwrap();
        assert_eq!(reply.content.as_deref(), Some("Done."));
        assert!(!reply.has_tool_calls());
        assert_eq!(reply.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_tool_calls() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null,
            "tool_calls":[
              {"id":"call_a","type":"function","function":{"name":"read_note","arguments":"{\"path\":\"A.md\"}"}},
              {"type":"function","function":{"name":"get_settings","arguments":""}}
            ]},"finish_reason":"tool_calls"}]}"#;
        let reply = parse_completion_response(body).unwrap();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].id, "call_a");
        assert_eq!(reply.tool_calls[0].arguments["path"], "A.md");
        assert!(reply.tool_calls[1].id.starts_with("call_"));
        assert_eq!(reply.tool_calls[1].arguments, serde_json::json!({}));
    }

    #[test]
    fn test_parse_bad_arguments() {
        let body = r#"{"choices":[{"message":{"tool_calls":[
              {"id":"c","function":{"name":"read_note","arguments":"{path: A.md"}}
            ]},"finish_reason":"tool_calls"}]}"#;
        let err = parse_completion_response(body).unwrap_err();
        assert!(matches!(err, InferenceError::ToolCallParseError { .. }));
    }

    #[test]
    fn test_parse_empty_choices() {
        let err = parse_completion_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, InferenceError::ResponseError { .. }));
    }
}
