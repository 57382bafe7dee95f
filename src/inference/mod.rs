//! Inference Client — OpenAI-compatible API client for the chat model.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with tool schemas
//! - Response parsing into text or tool calls
//! - Model configuration
//!
//! The client speaks the OpenAI Chat Completions API, making the model
//! interchangeable via config.

pub mod client;
pub mod config;
pub mod errors;
pub mod response;
pub mod types;

// Re-exports for convenience
pub use client::{InferenceClient, LanguageModel};
pub use config::ModelConfig;
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelReply, Role, ToolCall, ToolDefinition};
