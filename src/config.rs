//! Application configuration.
//!
//! Loaded from `knap.yaml`. Values may reference environment variables as
//! `${VAR}` or `${VAR:-default}`, and paths may start with `~`. Every field
//! has a default, so a missing file is equivalent to an empty one.
//!
//! Search order: explicit `--config` path, then `$KNAP_CONFIG`, then
//! `knap.yaml` in the working directory or any parent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent_core::AgentLoopConfig;
use crate::inference::ModelConfig;
use crate::vault::SummaryLimits;

/// Config file name looked up while walking upward.
pub const CONFIG_FILE_NAME: &str = "knap.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "KNAP_CONFIG";

/// Errors raised while locating or parsing the config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("no vault configured: set vault_path in knap.yaml or pass --vault")]
    NoVault,
}

// ─── Sections ───────────────────────────────────────────────────────────────

/// Root of `knap.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnapConfig {
    /// Vault root directory.
    #[serde(default)]
    pub vault_path: Option<PathBuf>,
    /// Where the database, index snapshot, and settings live.
    /// Defaults to `<vault>/.knap`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub model: ModelConfig,
    /// Voice input; disabled when absent.
    #[serde(default)]
    pub transcription: Option<TranscriptionConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

/// Speech-to-text endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_transcription_base_url")]
    pub base_url: String,
    #[serde(default = "default_transcription_model")]
    pub model: String,
    #[serde(default = "default_transcription_key_env")]
    pub api_key_env: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: default_transcription_base_url(),
            model: default_transcription_model(),
            api_key_env: default_transcription_key_env(),
        }
    }
}

fn default_transcription_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_transcription_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Agent loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    #[serde(default = "default_model_retry_backoff_ms")]
    pub model_retry_backoff_ms: u64,
    /// Vault-relative note whose body is injected as user guidelines.
    #[serde(default = "default_guideline_note")]
    pub guideline_note: String,
    #[serde(default = "default_guideline_max_chars")]
    pub guideline_max_chars: usize,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_history_messages: default_max_history_messages(),
            model_retry_backoff_ms: default_model_retry_backoff_ms(),
            guideline_note: default_guideline_note(),
            guideline_max_chars: default_guideline_max_chars(),
            max_tool_result_chars: default_max_tool_result_chars(),
        }
    }
}

fn default_max_tool_rounds() -> usize {
    20
}
fn default_max_history_messages() -> usize {
    40
}
fn default_model_retry_backoff_ms() -> u64 {
    500
}
fn default_guideline_note() -> String {
    "KNAP.md".to_string()
}
fn default_guideline_max_chars() -> usize {
    4_000
}
fn default_max_tool_result_chars() -> usize {
    6_000
}

/// Vault index tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Snapshots older than this are refreshed at the start of a turn.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    #[serde(default = "default_max_key_notes")]
    pub max_key_notes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
            summary_max_chars: default_summary_max_chars(),
            max_key_notes: default_max_key_notes(),
        }
    }
}

fn default_freshness_secs() -> u64 {
    300
}
fn default_summary_max_chars() -> usize {
    6_000
}
fn default_max_key_notes() -> usize {
    30
}

// ─── Derived values ─────────────────────────────────────────────────────────

impl KnapConfig {
    /// The vault root; `override_path` (from `--vault`) wins over the file.
    pub fn resolve_vault(&self, override_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        override_path
            .map(Path::to_path_buf)
            .or_else(|| self.vault_path.clone())
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::NoVault)
    }

    /// State directory for a given vault root.
    pub fn resolve_state_dir(&self, vault: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| vault.join(".knap"))
    }

    pub fn summary_limits(&self) -> SummaryLimits {
        SummaryLimits {
            max_chars: self.index.summary_max_chars,
            max_key_notes: self.index.max_key_notes,
        }
    }

    pub fn index_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.index.freshness_secs).unwrap_or(i64::MAX))
    }

    /// Settings for [`crate::agent_core::AgentLoop`].
    pub fn agent_loop_config(&self) -> AgentLoopConfig {
        AgentLoopConfig {
            max_tool_rounds: self.agent.max_tool_rounds,
            max_history_messages: self.agent.max_history_messages,
            model_timeout: Duration::from_secs(self.model.timeout_secs),
            model_retry_backoff: Duration::from_millis(self.agent.model_retry_backoff_ms),
            guideline_note: self.agent.guideline_note.clone(),
            guideline_max_chars: self.agent.guideline_max_chars,
            max_tool_result_chars: self.agent.max_tool_result_chars,
            summary_limits: self.summary_limits(),
        }
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// An explicit path must exist. Otherwise `$KNAP_CONFIG`, then `knap.yaml`
/// walking upward from `start`. `Ok(None)` means run on defaults.
pub fn find_config_path(
    explicit: Option<&Path>,
    start: &Path,
) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        let path = PathBuf::from(expand_tilde(&path.to_string_lossy()));
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            });
        }
        return Ok(Some(path));
    }

    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            break;
        }
    }

    Ok(None)
}

/// Load and parse a config file, interpolating `${VAR}` references.
pub fn load_config(path: &Path) -> Result<KnapConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text. Empty text yields the defaults.
pub fn parse_config(raw: &str) -> Result<KnapConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(KnapConfig::default());
    }

    let mut config: KnapConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;

    config.vault_path = config
        .vault_path
        .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())));
    config.state_dir = config
        .state_dir
        .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())));
    Ok(config)
}

/// Find and load the config, falling back to defaults when none exists.
pub fn load(explicit: Option<&Path>) -> Result<(KnapConfig, Option<PathBuf>), ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(explicit, &cwd)? {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(path = %path.display(), "config loaded");
            Ok((config, Some(path)))
        }
        None => {
            tracing::info!("no {CONFIG_FILE_NAME} found, using defaults");
            Ok((KnapConfig::default(), None))
        }
    }
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
///
/// Unset variables without a default become empty strings.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{rest}", home.display());
            }
        }
    }
    path.to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
