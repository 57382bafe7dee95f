//! Read-only note tools: `read_note`, `get_frontmatter`, `get_daily_note`.

use chrono::{Local, NaiveDate};
use serde_json::{json, Value};

use super::registry::{opt_str, opt_usize, str_arg, ToolContext, ToolRegistry};
use crate::vault::{notes, VaultError};

/// Lines returned by `read_note` when no limit is given.
const DEFAULT_READ_LIMIT: usize = 2_000;

/// Folder holding daily notes.
pub const DAILY_FOLDER: &str = "Daily Notes";

pub(crate) fn register(reg: &mut ToolRegistry) {
    reg.register_read(
        "read_note",
        "Read a note's content with line numbers. Use offset/limit for long notes.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Note path relative to the vault root; '.md' optional."},
                "offset": {"type": "integer", "description": "First line to return (1-based)."},
                "limit": {"type": "integer", "description": "Maximum number of lines to return."}
            },
            "required": ["path"]
        }),
        read_note,
    );
    reg.register_read(
        "get_frontmatter",
        "Return a note's YAML front-matter as JSON.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Note path."}
            },
            "required": ["path"]
        }),
        get_frontmatter,
    );
    reg.register_read(
        "get_daily_note",
        "Get the daily note for a date (default today). If it does not exist, returns \
         the path and a template to create it with create_note.",
        json!({
            "type": "object",
            "properties": {
                "date": {"type": "string", "description": "Date as YYYY-MM-DD. Defaults to today."}
            }
        }),
        get_daily_note,
    );
}

fn read_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, _) = ctx.vault().resolve(str_arg(args, "path")?)?;
    let content = ctx.vault().read(&rel)?;

    let lines: Vec<&str> = content.lines().collect();
    let offset = opt_usize(args, "offset").unwrap_or(1).max(1);
    let limit = opt_usize(args, "limit").unwrap_or(DEFAULT_READ_LIMIT).max(1);

    if lines.is_empty() {
        return Ok(Value::String(format!("{rel} is empty.")));
    }
    if offset > lines.len() {
        return Err(VaultError::InvalidArgument {
            reason: format!("offset {offset} is past the end of {rel} ({} lines)", lines.len()),
        });
    }

    let end = (offset - 1).saturating_add(limit).min(lines.len());
    let mut out: Vec<String> = lines[offset - 1..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:6}\t{}", offset + i, line))
        .collect();
    if end < lines.len() {
        out.push(format!("... ({} more lines)", lines.len() - end));
    }
    Ok(Value::String(out.join("\n")))
}

fn get_frontmatter(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, _) = ctx.vault().resolve(str_arg(args, "path")?)?;
    let content = ctx.vault().read(&rel)?;
    let (fm, _) = notes::parse_frontmatter(&rel, &content)?;
    let fm_json = serde_json::to_value(&fm).map_err(|e| VaultError::Frontmatter {
        path: rel.clone(),
        reason: e.to_string(),
    })?;
    Ok(json!({"path": rel, "frontmatter": fm_json}))
}

/// Relative path of the daily note for `date`.
pub fn daily_note_path(date: NaiveDate) -> String {
    format!("{DAILY_FOLDER}/{}.md", date.format("%Y-%m-%d"))
}

/// Starting content for a new daily note.
pub fn daily_note_template(date: NaiveDate) -> String {
    format!(
        "---\ndate: {}\ntags: [daily]\n---\n\n## Tasks\n\n- [ ] \n\n## Notes\n\n",
        date.format("%Y-%m-%d")
    )
}

fn get_daily_note(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let date = match opt_str(args, "date") {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
            VaultError::InvalidArgument {
                reason: format!("date must be YYYY-MM-DD, got '{s}'"),
            }
        })?,
        None => Local::now().date_naive(),
    };
    let path = daily_note_path(date);

    match ctx.vault().read(&path) {
        Ok(content) => Ok(json!({"path": path, "exists": true, "content": content})),
        Err(VaultError::NotFound { .. }) => Ok(json!({
            "path": path,
            "exists": false,
            "template": daily_note_template(date),
        })),
        Err(e) => Err(e),
    }
}
