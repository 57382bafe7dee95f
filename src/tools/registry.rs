//! Tool registry — maps tool names to vault capabilities.
//!
//! Each entry carries its JSON schema, whether it mutates the vault, and an
//! executor. Destructive entries also carry a previewer that turns a call
//! into a [`ProposedAction`] without touching the vault. Dispatch is a map
//! lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::agent_core::errors::AgentError;
use crate::agent_core::types::{ActionKind, ActionPreview, PendingAction};
use crate::inference::types::{FunctionDefinition, ToolDefinition};
use crate::vault::{notes, SettingsStore, Vault, VaultError, VaultIndex, VaultIndexSnapshot};

/// Runs a tool against validated arguments.
pub type Executor = fn(&ToolContext, &Value) -> Result<Value, VaultError>;

/// Describes what a destructive call would do, without doing it.
pub type Previewer = fn(&ToolContext, &Value) -> Result<ProposedAction, VaultError>;

/// Output of a previewer.
#[derive(Debug, Clone)]
pub struct ProposedAction {
    pub kind: ActionKind,
    pub target: String,
    pub preview: ActionPreview,
    /// Content hash of the target right now, `None` if it does not exist.
    pub base_hash: Option<String>,
}

// ─── ToolContext ─────────────────────────────────────────────────────────────

/// Everything a tool may touch.
#[derive(Clone)]
pub struct ToolContext {
    pub index: Arc<VaultIndex>,
    pub settings: Arc<SettingsStore>,
}

impl ToolContext {
    pub fn new(index: Arc<VaultIndex>, settings: Arc<SettingsStore>) -> Self {
        Self { index, settings }
    }

    pub fn vault(&self) -> &Vault {
        self.index.vault()
    }

    /// A snapshot within the freshness window.
    pub fn snapshot(&self) -> Result<Arc<VaultIndexSnapshot>, VaultError> {
        self.index.ensure_fresh(Utc::now())
    }

    /// Current content hash of a note, `None` if it does not exist.
    pub fn current_hash(&self, path: &str) -> Result<Option<String>, VaultError> {
        match self.vault().read(path) {
            Ok(content) => Ok(Some(notes::content_hash(&content))),
            Err(VaultError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// A registered capability.
#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub destructive: bool,
    executor: Executor,
    previewer: Option<Previewer>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name)
            .field("destructive", &self.destructive)
            .finish()
    }
}

/// Name → capability mapping. Ordered so tool schemas are sent deterministically.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool that only reads (or refreshes derived state).
    pub fn register_read(
        &mut self,
        name: &str,
        description: &str,
        parameters: Value,
        executor: Executor,
    ) {
        self.insert(name, description, parameters, executor, None);
    }

    /// Register a tool that mutates the vault or settings.
    pub fn register_destructive(
        &mut self,
        name: &str,
        description: &str,
        parameters: Value,
        executor: Executor,
        previewer: Previewer,
    ) {
        self.insert(name, description, parameters, executor, Some(previewer));
    }

    fn insert(
        &mut self,
        name: &str,
        description: &str,
        parameters: Value,
        executor: Executor,
        previewer: Option<Previewer>,
    ) {
        self.tools.insert(
            name.to_string(),
            RegisteredTool {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
                destructive: previewer.is_some(),
                executor,
                previewer,
            },
        );
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Whether a tool mutates the vault. Unknown tools are treated as destructive.
    pub fn is_destructive(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.destructive).unwrap_or(true)
    }

    /// Return all registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas in the OpenAI `tools` format.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                r#type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    /// Validate a tool call: tool exists, required fields are present, and
    /// top-level fields have the declared JSON type.
    pub fn validate_tool_call(&self, tool_name: &str, arguments: &Value) -> Result<(), AgentError> {
        let tool = self.get(tool_name).ok_or_else(|| AgentError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        let args_obj = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            _ => {
                return Err(AgentError::InvalidArguments {
                    tool: tool_name.to_string(),
                    reason: "arguments must be a JSON object".to_string(),
                })
            }
        };

        if let Some(required) = tool.parameters.get("required").and_then(|r| r.as_array()) {
            for field in required.iter().filter_map(|f| f.as_str()) {
                let has_field = args_obj
                    .map(|obj| obj.get(field).map(|v| !v.is_null()).unwrap_or(false))
                    .unwrap_or(false);
                if !has_field {
                    return Err(AgentError::InvalidArguments {
                        tool: tool_name.to_string(),
                        reason: format!("missing required field: '{field}'"),
                    });
                }
            }
        }

        if let (Some(props), Some(obj)) = (
            tool.parameters.get("properties").and_then(|p| p.as_object()),
            args_obj,
        ) {
            for (key, value) in obj {
                let expected = props
                    .get(key)
                    .and_then(|p| p.get("type"))
                    .and_then(|t| t.as_str());
                if let Some(expected) = expected {
                    if !value.is_null() && !type_matches(expected, value) {
                        return Err(AgentError::InvalidArguments {
                            tool: tool_name.to_string(),
                            reason: format!("field '{key}' must be of type {expected}"),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Validate then execute immediately.
    pub fn execute(
        &self,
        tool_name: &str,
        ctx: &ToolContext,
        arguments: &Value,
    ) -> Result<Value, AgentError> {
        self.validate_tool_call(tool_name, arguments)?;
        let tool = self.get(tool_name).ok_or_else(|| AgentError::UnknownTool {
            name: tool_name.to_string(),
        })?;
        (tool.executor)(ctx, arguments).map_err(|e| tool_error(tool_name, arguments, e))
    }

    /// Validate then build a preview for a destructive call.
    pub fn propose(
        &self,
        tool_name: &str,
        ctx: &ToolContext,
        arguments: &Value,
    ) -> Result<ProposedAction, AgentError> {
        self.validate_tool_call(tool_name, arguments)?;
        let previewer = self
            .get(tool_name)
            .and_then(|t| t.previewer)
            .ok_or_else(|| AgentError::InvalidArguments {
                tool: tool_name.to_string(),
                reason: "tool does not modify the vault".to_string(),
            })?;
        previewer(ctx, arguments).map_err(|e| tool_error(tool_name, arguments, e))
    }

    /// Execute an approved action, refusing if its target changed since the
    /// preview was shown.
    pub fn execute_approved(
        &self,
        action: &PendingAction,
        ctx: &ToolContext,
    ) -> Result<Value, AgentError> {
        if action.kind != ActionKind::Settings {
            let current = ctx
                .current_hash(&action.target)
                .map_err(|e| tool_error(&action.tool_name, &action.arguments, e))?;
            if current != action.base_hash {
                return Err(AgentError::ToolExecutionError {
                    tool_name: action.tool_name.clone(),
                    arguments: action.arguments.clone(),
                    reason: format!(
                        "'{}' changed since approval was requested; not applied",
                        action.target
                    ),
                });
            }
        }
        self.execute(&action.tool_name, ctx, &action.arguments)
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "boolean" => value.is_boolean() || matches!(value.as_str(), Some("true" | "false")),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_str().map(|s| s.parse::<i64>().is_ok()).unwrap_or(false)
        }
        "number" => value.is_number(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn tool_error(tool_name: &str, arguments: &Value, e: VaultError) -> AgentError {
    AgentError::ToolExecutionError {
        tool_name: tool_name.to_string(),
        arguments: arguments.clone(),
        reason: e.to_string(),
    }
}

// ─── Argument helpers ────────────────────────────────────────────────────────

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, VaultError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| VaultError::InvalidArgument {
            reason: format!("'{key}' must be a string"),
        })
}

pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

pub(crate) fn opt_u64(args: &Value, key: &str) -> Option<u64> {
    let v = args.get(key)?;
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Like [`opt_u64`], saturating at `usize::MAX` on narrow targets.
pub(crate) fn opt_usize(args: &Value, key: &str) -> Option<usize> {
    opt_u64(args, key).map(|n| usize::try_from(n).unwrap_or(usize::MAX))
}

pub(crate) fn opt_bool(args: &Value, key: &str) -> Option<bool> {
    let v = args.get(key)?;
    v.as_bool().or_else(|| match v.as_str() {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    })
}
