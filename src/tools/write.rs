//! Destructive note tools: `create_note`, `update_note`, `append_to_note`,
//! `edit_note`, `delete_note`, `set_frontmatter`.
//!
//! Each tool has an executor and a previewer. The previewer runs the same
//! checks as the executor so a doomed call fails before it is ever proposed.

use serde_json::{json, Value};
use serde_yaml::{Mapping, Value as YamlValue};

use super::registry::{opt_bool, str_arg, ProposedAction, ToolContext, ToolRegistry};
use crate::agent_core::tokens::truncate_chars;
use crate::agent_core::types::{ActionKind, ActionPreview};
use crate::vault::{notes, VaultError};

/// Characters of content shown in a preview.
const PREVIEW_CHARS: usize = 300;

pub(crate) fn register(reg: &mut ToolRegistry) {
    let path_prop = json!({"type": "string", "description": "Note path relative to the vault root; '.md' optional."});

    reg.register_destructive(
        "create_note",
        "Create a new note. Fails if the note already exists.",
        json!({
            "type": "object",
            "properties": {
                "path": path_prop,
                "content": {"type": "string", "description": "Full markdown content."}
            },
            "required": ["path", "content"]
        }),
        create_note,
        preview_create,
    );
    reg.register_destructive(
        "update_note",
        "Replace the entire content of an existing note.",
        json!({
            "type": "object",
            "properties": {
                "path": path_prop,
                "content": {"type": "string", "description": "New full markdown content."}
            },
            "required": ["path", "content"]
        }),
        update_note,
        preview_update,
    );
    reg.register_destructive(
        "append_to_note",
        "Append text to the end of an existing note.",
        json!({
            "type": "object",
            "properties": {
                "path": path_prop,
                "content": {"type": "string", "description": "Text to append."}
            },
            "required": ["path", "content"]
        }),
        append_to_note,
        preview_append,
    );
    reg.register_destructive(
        "edit_note",
        "Replace an exact string in a note. old_string must match exactly and be unique \
         unless replace_all is true. Read the note first.",
        json!({
            "type": "object",
            "properties": {
                "path": path_prop,
                "old_string": {"type": "string", "description": "Exact text to find."},
                "new_string": {"type": "string", "description": "Replacement text; must differ from old_string."},
                "replace_all": {"type": "boolean", "description": "Replace every occurrence. Default false."}
            },
            "required": ["path", "old_string", "new_string"]
        }),
        edit_note,
        preview_edit,
    );
    reg.register_destructive(
        "delete_note",
        "Delete a note.",
        json!({
            "type": "object",
            "properties": {"path": path_prop},
            "required": ["path"]
        }),
        delete_note,
        preview_delete,
    );
    reg.register_destructive(
        "set_frontmatter",
        "Merge keys into a note's YAML front-matter. A null value removes the key.",
        json!({
            "type": "object",
            "properties": {
                "path": path_prop,
                "fields": {"type": "object", "description": "Keys to set, e.g. {\"status\": \"done\"}."}
            },
            "required": ["path", "fields"]
        }),
        set_frontmatter,
        preview_frontmatter,
    );
}

fn excerpt(s: &str) -> String {
    let cut = truncate_chars(s, PREVIEW_CHARS);
    if cut.len() < s.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

/// Read an existing note, returning its path, content, and hash.
fn existing(ctx: &ToolContext, args: &Value) -> Result<(String, String, String), VaultError> {
    let (rel, _) = ctx.vault().resolve(str_arg(args, "path")?)?;
    let content = ctx.vault().read(&rel)?;
    let hash = notes::content_hash(&content);
    Ok((rel, content, hash))
}

// ─── create ──────────────────────────────────────────────────────────────────

fn create_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, abs) = ctx.vault().resolve(str_arg(args, "path")?)?;
    if abs.exists() {
        return Err(VaultError::AlreadyExists { path: rel });
    }
    let content = str_arg(args, "content")?;
    ctx.vault().write(&rel, content)?;
    tracing::info!(path = %rel, "note created");
    Ok(json!({"path": rel, "created": true}))
}

fn preview_create(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let (rel, abs) = ctx.vault().resolve(str_arg(args, "path")?)?;
    if abs.exists() {
        return Err(VaultError::AlreadyExists { path: rel });
    }
    Ok(ProposedAction {
        kind: ActionKind::Create,
        preview: ActionPreview {
            summary: format!("Create note {rel}"),
            before: None,
            after: Some(excerpt(str_arg(args, "content")?)),
        },
        target: rel,
        base_hash: None,
    })
}

// ─── update ──────────────────────────────────────────────────────────────────

fn update_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, _, _) = existing(ctx, args)?;
    ctx.vault().write(&rel, str_arg(args, "content")?)?;
    tracing::info!(path = %rel, "note updated");
    Ok(json!({"path": rel, "updated": true}))
}

fn preview_update(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let (rel, content, hash) = existing(ctx, args)?;
    Ok(ProposedAction {
        kind: ActionKind::Update,
        preview: ActionPreview {
            summary: format!("Replace the content of {rel}"),
            before: Some(excerpt(&content)),
            after: Some(excerpt(str_arg(args, "content")?)),
        },
        target: rel,
        base_hash: Some(hash),
    })
}

// ─── append ──────────────────────────────────────────────────────────────────

fn appended(existing: &str, addition: &str) -> String {
    if existing.is_empty() || existing.ends_with('\n') {
        format!("{existing}{addition}")
    } else {
        format!("{existing}\n{addition}")
    }
}

fn append_to_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, content, _) = existing(ctx, args)?;
    ctx.vault().write(&rel, &appended(&content, str_arg(args, "content")?))?;
    tracing::info!(path = %rel, "note appended");
    Ok(json!({"path": rel, "appended": true}))
}

fn preview_append(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let (rel, _, hash) = existing(ctx, args)?;
    Ok(ProposedAction {
        kind: ActionKind::Edit,
        preview: ActionPreview {
            summary: format!("Append to {rel}"),
            before: None,
            after: Some(excerpt(str_arg(args, "content")?)),
        },
        target: rel,
        base_hash: Some(hash),
    })
}

// ─── edit ────────────────────────────────────────────────────────────────────

/// Apply an exact-string replacement. Returns the new content and the number
/// of replacements.
pub(crate) fn apply_edit(
    rel: &str,
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, usize), VaultError> {
    if old == new {
        return Err(VaultError::InvalidArgument {
            reason: "old_string and new_string must be different".to_string(),
        });
    }
    if old.is_empty() {
        return Err(VaultError::InvalidArgument {
            reason: "old_string must not be empty".to_string(),
        });
    }
    let count = content.matches(old).count();
    if count == 0 {
        return Err(VaultError::InvalidArgument {
            reason: format!(
                "could not find the text to replace in {rel}; read the note and use the exact text"
            ),
        });
    }
    if count > 1 && !replace_all {
        return Err(VaultError::InvalidArgument {
            reason: format!(
                "found {count} occurrences in {rel}; add surrounding context or set replace_all"
            ),
        });
    }
    if replace_all {
        Ok((content.replace(old, new), count))
    } else {
        Ok((content.replacen(old, new, 1), 1))
    }
}

fn edit_args(args: &Value) -> Result<(&str, &str, bool), VaultError> {
    Ok((
        str_arg(args, "old_string")?,
        str_arg(args, "new_string")?,
        opt_bool(args, "replace_all").unwrap_or(false),
    ))
}

fn edit_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, content, _) = existing(ctx, args)?;
    let (old, new, replace_all) = edit_args(args)?;
    let (next, count) = apply_edit(&rel, &content, old, new, replace_all)?;
    ctx.vault().write(&rel, &next)?;
    tracing::info!(path = %rel, replacements = count, "note edited");
    Ok(json!({"path": rel, "replacements": count}))
}

fn preview_edit(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let (rel, content, hash) = existing(ctx, args)?;
    let (old, new, replace_all) = edit_args(args)?;
    let (_, count) = apply_edit(&rel, &content, old, new, replace_all)?;
    let summary = if count > 1 {
        format!("Replace {count} occurrences in {rel}")
    } else {
        format!("Edit {rel}")
    };
    Ok(ProposedAction {
        kind: ActionKind::Edit,
        preview: ActionPreview {
            summary,
            before: Some(excerpt(old)),
            after: Some(excerpt(new)),
        },
        target: rel,
        base_hash: Some(hash),
    })
}

// ─── delete ──────────────────────────────────────────────────────────────────

fn delete_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let rel = ctx.vault().delete(str_arg(args, "path")?)?;
    tracing::info!(path = %rel, "note deleted");
    Ok(json!({"path": rel, "deleted": true}))
}

fn preview_delete(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let (rel, content, hash) = existing(ctx, args)?;
    Ok(ProposedAction {
        kind: ActionKind::Delete,
        preview: ActionPreview {
            summary: format!("Delete note {rel}"),
            before: Some(excerpt(&content)),
            after: None,
        },
        target: rel,
        base_hash: Some(hash),
    })
}

// ─── front-matter ────────────────────────────────────────────────────────────

fn merged_frontmatter(rel: &str, content: &str, args: &Value) -> Result<(Mapping, Mapping, String), VaultError> {
    let fields = args
        .get("fields")
        .and_then(|f| f.as_object())
        .ok_or_else(|| VaultError::InvalidArgument {
            reason: "'fields' must be an object".to_string(),
        })?;
    if fields.is_empty() {
        return Err(VaultError::InvalidArgument {
            reason: "'fields' must not be empty".to_string(),
        });
    }

    let (before, body) = notes::parse_frontmatter(rel, content)?;
    let mut after = before.clone();
    for (key, value) in fields {
        let k = YamlValue::String(key.clone());
        if value.is_null() {
            after.remove(&k);
        } else {
            let v = serde_yaml::to_value(value).map_err(|e| VaultError::InvalidArgument {
                reason: format!("field '{key}' cannot be stored as YAML: {e}"),
            })?;
            after.insert(k, v);
        }
    }
    Ok((before, after, body))
}

fn yaml_text(fm: &Mapping) -> String {
    if fm.is_empty() {
        "(none)".to_string()
    } else {
        serde_yaml::to_string(fm).unwrap_or_default().trim_end().to_string()
    }
}

fn set_frontmatter(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, content, _) = existing(ctx, args)?;
    let (_, after, body) = merged_frontmatter(&rel, &content, args)?;
    ctx.vault().write(&rel, &notes::render_with_frontmatter(&after, &body)?)?;
    tracing::info!(path = %rel, keys = after.len(), "front-matter updated");
    let fm_json = serde_json::to_value(&after).unwrap_or(Value::Null);
    Ok(json!({"path": rel, "frontmatter": fm_json}))
}

fn preview_frontmatter(ctx: &ToolContext, args: &Value) -> Result<ProposedAction, VaultError> {
    let (rel, content, hash) = existing(ctx, args)?;
    let (before, after, _) = merged_frontmatter(&rel, &content, args)?;
    Ok(ProposedAction {
        kind: ActionKind::Update,
        preview: ActionPreview {
            summary: format!("Update front-matter of {rel}"),
            before: Some(yaml_text(&before)),
            after: Some(yaml_text(&after)),
        },
        target: rel,
        base_hash: Some(hash),
    })
}
