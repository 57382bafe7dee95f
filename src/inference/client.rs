//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests and parses the reply into
//! text or tool calls. The agent loop talks to it through the
//! [`LanguageModel`] trait so tests can script replies.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::response::parse_completion_response;
use super::types::{ChatCompletionRequest, ChatMessage, ModelReply, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── LanguageModel ───────────────────────────────────────────────────────────

/// The model capability: given a transcript and callable tools, return
/// either final text or tool invocations.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ModelReply, InferenceError>;

    /// Name used in logs.
    fn model_name(&self) -> &str;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
    api_key: Option<String>,
}

impl InferenceClient {
    /// Create a client. Resolves the API key now; does NOT check connectivity.
    pub fn from_config(config: ModelConfig) -> Result<Self, InferenceError> {
        let api_key = config.api_key()?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    /// The base URL of the model endpoint.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Check if the endpoint is reachable.
    ///
    /// Sends a lightweight request; does not consume inference tokens.
    pub async fn health_check(&self) -> bool {
        let mut req = self.http.get(self.config.endpoint("models")).timeout(CONNECT_TIMEOUT);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> ChatCompletionRequest {
        let tools = if tools.is_empty() { None } else { Some(tools) };
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        }
    }
}

#[async_trait]
impl LanguageModel for InferenceClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ModelReply, InferenceError> {
        let url = self.config.endpoint("chat/completions");
        let body = self.build_request(messages, tools);

        // Log the request metadata (not the full body; it can be huge)
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "=== LLM REQUEST ==="
        );

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to read response body: {e}"),
        })?;

        let reply = parse_completion_response(&body_text)?;
        tracing::info!(
            tool_calls = reply.tool_calls.len(),
            has_text = reply.content.is_some(),
            finish_reason = reply.finish_reason.as_deref().unwrap_or(""),
            "=== LLM RESPONSE ==="
        );
        Ok(reply)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::FunctionDefinition;

    fn local_config() -> ModelConfig {
        ModelConfig {
            base_url: "http://localhost:11111/v1".to_string(),
            model: "qwen2.5:7b".to_string(),
            api_key_env: String::new(),
            temperature: Some(0.2),
            max_tokens: None,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_from_config_without_key() {
        let client = InferenceClient::from_config(local_config()).unwrap();
        assert_eq!(client.model_name(), "qwen2.5:7b");
        assert_eq!(client.base_url(), "http://localhost:11111/v1");
    }

    #[test]
    fn test_build_request_tool_choice_follows_tools() {
        let client = InferenceClient::from_config(local_config()).unwrap();
        let bare = client.build_request(vec![ChatMessage::system("hi")], vec![]);
        assert!(bare.tools.is_none());
        assert!(bare.tool_choice.is_none());

        let tool = ToolDefinition {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: "read_note".to_string(),
                description: "Read a note".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            },
        };
        let with_tools = client.build_request(vec![ChatMessage::system("hi")], vec![tool]);
        assert_eq!(with_tools.tool_choice.as_deref(), Some("auto"));
        assert_eq!(with_tools.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let client = InferenceClient::from_config(ModelConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            ..local_config()
        })
        .unwrap();
        assert!(!client.health_check().await);
        let err = client
            .complete(vec![ChatMessage::system("hi")], vec![])
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }
}
