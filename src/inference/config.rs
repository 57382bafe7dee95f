//! Model endpoint configuration.
//!
//! Lives under the `model:` key of `knap.yaml`. Any OpenAI-compatible
//! chat-completions endpoint works; switching models is a config change.

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

/// Runtime configuration for the chat model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key. Empty for
    /// endpoints that need none (local servers).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per-call timeout; a call that exceeds it fails with a timeout error.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: None,
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// Resolve the API key from the configured environment variable.
    ///
    /// Returns `Ok(None)` when no variable is configured.
    pub fn api_key(&self) -> Result<Option<String>, InferenceError> {
        resolve_api_key(&self.api_key_env)
    }

    /// Full URL for an API path under `base_url`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Read an API key from `var`; an empty name means no key is needed.
pub(crate) fn resolve_api_key(var: &str) -> Result<Option<String>, InferenceError> {
    if var.is_empty() {
        return Ok(None);
    }
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
        _ => Err(InferenceError::ConfigError {
            reason: format!("environment variable {var} is not set"),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
