//! Inference error types.
//!
//! Structured logging is the caller's responsibility. These types carry the
//! context needed to build meaningful log entries.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Failed to parse a tool call from the model's response.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body was not a valid completion.
    #[error("malformed response: {reason}")]
    ResponseError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the failure is transient and worth one more attempt.
    ///
    /// HTTP 500 is included because OpenAI-compatible local servers return it
    /// when the model emits malformed tool-call JSON.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 429, .. }
                | InferenceError::HttpError { status: 500, .. }
                | InferenceError::HttpError { status: 502..=504, .. }
                | InferenceError::ToolCallParseError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retriable() {
        assert!(InferenceError::ConnectionFailed {
            endpoint: "".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(InferenceError::Timeout { duration_secs: 5 }.is_retriable());
        assert!(InferenceError::HttpError {
            status: 503,
            body: "".into()
        }
        .is_retriable());
        assert!(!InferenceError::HttpError {
            status: 401,
            body: "bad key".into()
        }
        .is_retriable());
        assert!(!InferenceError::ConfigError { reason: "".into() }.is_retriable());
    }
}
