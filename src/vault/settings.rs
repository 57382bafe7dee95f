//! User settings — runtime toggles the user (or the model, with approval)
//! can change, persisted to `<state_dir>/settings.json`.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::errors::VaultError;
use super::notes::write_atomic;

/// Bounds for the confirmation timeout.
const MIN_TIMEOUT_MINUTES: u32 = 1;
const MAX_TIMEOUT_MINUTES: u32 = 60;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Persisted user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Whether destructive actions wait for approval.
    #[serde(default = "default_require_confirmations")]
    pub require_confirmations: bool,
    /// Minutes before a pending confirmation batch lapses.
    #[serde(default = "default_confirmation_timeout_minutes")]
    pub confirmation_timeout_minutes: u32,
}

fn default_require_confirmations() -> bool {
    true
}

fn default_confirmation_timeout_minutes() -> u32 {
    5
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            require_confirmations: default_require_confirmations(),
            confirmation_timeout_minutes: default_confirmation_timeout_minutes(),
        }
    }
}

/// Partial update, as accepted by the `update_settings` tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub require_confirmations: Option<bool>,
    pub confirmation_timeout_minutes: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.require_confirmations.is_none() && self.confirmation_timeout_minutes.is_none()
    }
}

// ─── SettingsStore ──────────────────────────────────────────────────────────

/// Loads, caches, and saves [`UserSettings`].
pub struct SettingsStore {
    current: RwLock<UserSettings>,
    persist_path: PathBuf,
}

impl SettingsStore {
    /// Load settings from `persist_path`; missing or unreadable files give defaults.
    pub fn load(persist_path: impl Into<PathBuf>) -> Self {
        let persist_path = persist_path.into();
        let current = read_settings(&persist_path).unwrap_or_default();
        Self {
            current: RwLock::new(current),
            persist_path,
        }
    }

    pub fn get(&self) -> UserSettings {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Validate and apply a patch, then persist atomically.
    pub fn apply(&self, patch: &SettingsPatch) -> Result<UserSettings, VaultError> {
        if patch.is_empty() {
            return Err(VaultError::InvalidArgument {
                reason: "no settings to update".to_string(),
            });
        }
        if let Some(minutes) = patch.confirmation_timeout_minutes {
            if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&minutes) {
                return Err(VaultError::InvalidArgument {
                    reason: format!(
                        "confirmation_timeout_minutes must be between {MIN_TIMEOUT_MINUTES} and {MAX_TIMEOUT_MINUTES}"
                    ),
                });
            }
        }

        let mut next = self.get();
        if let Some(v) = patch.require_confirmations {
            next.require_confirmations = v;
        }
        if let Some(v) = patch.confirmation_timeout_minutes {
            next.confirmation_timeout_minutes = v;
        }

        self.save(&next)?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        tracing::info!(
            require_confirmations = next.require_confirmations,
            timeout_minutes = next.confirmation_timeout_minutes,
            "settings updated"
        );
        Ok(next)
    }

    fn save(&self, settings: &UserSettings) -> Result<(), VaultError> {
        let display = self.persist_path.display().to_string();
        if let Some(parent) = self.persist_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(&display, e))?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(|e| VaultError::Io {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.persist_path, &json).map_err(|e| VaultError::io(&display, e))
    }
}

fn read_settings(path: &Path) -> Option<UserSettings> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to parse settings file, using defaults"
            );
            None
        }
    }
}
