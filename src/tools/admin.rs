//! Housekeeping tools: `refresh_vault_index`, `get_settings`, `update_settings`.

use serde_json::{json, Value};

use super::registry::{opt_bool, opt_u64, ProposedAction, ToolContext, ToolRegistry};
use crate::agent_core::types::{ActionKind, ActionPreview};
use crate::vault::{SettingsPatch, UserSettings, VaultError};

/// Pseudo-target recorded for settings changes.
pub const SETTINGS_TARGET: &str = "settings";

pub(crate) fn register(reg: &mut ToolRegistry) {
    reg.register_read(
        "refresh_vault_index",
        "Rescan the whole vault. Use after the user says notes changed outside this chat.",
        json!({"type": "object", "properties": {}}),
        refresh_vault_index,
    );
    reg.register_read(
        "get_settings",
        "Show the current assistant settings.",
        json!({"type": "object", "properties": {}}),
        get_settings,
    );
    reg.register_destructive(
        "update_settings",
        "Change assistant settings: require_confirmations (bool), \
         confirmation_timeout_minutes (1-60).",
        json!({
            "type": "object",
            "properties": {
                "require_confirmations": {"type": "boolean"},
                "confirmation_timeout_minutes": {"type": "integer"}
            }
        }),
        update_settings,
        preview_settings,
    );
}

fn refresh_vault_index(ctx: &ToolContext, _args: &Value) -> Result<Value, VaultError> {
    let snapshot = ctx.index.rebuild()?;
    Ok(json!({
        "notes": snapshot.note_count(),
        "folders": snapshot.folders.len(),
        "tags": snapshot.tags.len(),
    }))
}

fn get_settings(ctx: &ToolContext, _args: &Value) -> Result<Value, VaultError> {
    settings_json(&ctx.settings.get())
}

fn settings_json(settings: &UserSettings) -> Result<Value, VaultError> {
    serde_json::to_value(settings).map_err(|e| VaultError::InvalidArgument {
        reason: e.to_string(),
    })
}

fn patch_from(args: &Value) -> SettingsPatch {
    SettingsPatch {
        require_confirmations: opt_bool(args, "require_confirmations"),
        confirmation_timeout_minutes: opt_u64(args, "confirmation_timeout_minutes")
            .map(|m| u32::try_from(m).unwrap_or(u32::MAX)),
    }
}

fn update_settings(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let updated = ctx.settings.apply(&patch_from(args))?;
    settings_json(&updated)
}

fn preview_settings(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let patch = patch_from(args);
    if patch.is_empty() {
        return Err(VaultError::InvalidArgument {
            reason: "no settings to update".to_string(),
        });
    }
    let before = ctx.settings.get();
    let mut after = before.clone();
    if let Some(v) = patch.require_confirmations {
        after.require_confirmations = v;
    }
    if let Some(v) = patch.confirmation_timeout_minutes {
        after.confirmation_timeout_minutes = v;
    }
    Ok(ProposedAction {
        kind: ActionKind::Settings,
        target: SETTINGS_TARGET.to_string(),
        preview: ActionPreview {
            summary: "Change assistant settings".to_string(),
            before: Some(settings_json(&before)?.to_string()),
            after: Some(settings_json(&after)?.to_string()),
        },
        base_hash: None,
    })
}
