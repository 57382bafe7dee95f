//! Search and navigation tools: `glob_notes`, `grep_notes`, `search_by_tag`,
//! `list_folder`, `get_backlinks`.

use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};

use super::registry::{opt_bool, opt_str, opt_usize, str_arg, ToolContext, ToolRegistry};
use crate::vault::{index, notes, VaultError};

const DEFAULT_MAX_RESULTS: usize = 20;
const DEFAULT_CONTEXT_LINES: usize = 1;
/// Matches shown per file in `content` mode.
const MAX_MATCHES_PER_FILE: usize = 5;
const MAX_GLOB_RESULTS: usize = 50;

pub(crate) fn register(reg: &mut ToolRegistry) {
    reg.register_read(
        "glob_notes",
        "Find notes by path pattern. '*' matches within one folder, '**' across folders: \
         '**/*.md' (all notes), 'Projects/**' (a folder), '**/*meeting*' (names containing \
         'meeting'). Newest first.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Glob pattern, case-insensitive."},
                "path": {"type": "string", "description": "Optional folder to search in."}
            },
            "required": ["pattern"]
        }),
        glob_notes,
    );
    reg.register_read(
        "grep_notes",
        "Search note contents with a regular expression.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression."},
                "glob": {"type": "string", "description": "Only search notes whose path matches this glob."},
                "output_mode": {
                    "type": "string",
                    "enum": ["files_with_matches", "content", "count"],
                    "description": "Default files_with_matches."
                },
                "case_insensitive": {"type": "boolean", "description": "Default true."},
                "context_lines": {"type": "integer", "description": "Lines of context in content mode. Default 1."},
                "max_results": {"type": "integer", "description": "Default 20."}
            },
            "required": ["pattern"]
        }),
        grep_notes,
    );
    reg.register_read(
        "search_by_tag",
        "List notes carrying a tag (from front-matter or inline #tags).",
        json!({
            "type": "object",
            "properties": {
                "tag": {"type": "string", "description": "Tag with or without '#'."}
            },
            "required": ["tag"]
        }),
        search_by_tag,
    );
    reg.register_read(
        "list_folder",
        "List subfolders and notes (with titles) in a folder. Empty path lists the vault root.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Folder path relative to the vault root."}
            }
        }),
        list_folder,
    );
    reg.register_read(
        "get_backlinks",
        "List notes that link to the given note with [[wiki-links]].",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Note path."}
            },
            "required": ["path"]
        }),
        get_backlinks,
    );
}

// ─── Glob ────────────────────────────────────────────────────────────────────

/// Compile a path glob to an anchored, case-insensitive regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, VaultError> {
    let mut re = String::from("^");
    let chars: Vec<char> = pattern.trim().trim_start_matches('/').chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    RegexBuilder::new(&re)
        .case_insensitive(true)
        .build()
        .map_err(|e| VaultError::InvalidArgument {
            reason: format!("invalid glob '{pattern}': {e}"),
        })
}

fn glob_notes(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let pattern = str_arg(args, "pattern")?;
    let matcher = glob_to_regex(pattern)?;
    let folder = match opt_str(args, "path") {
        Some(p) => {
            let (rel, abs) = ctx.vault().resolve_folder(p)?;
            if !abs.is_dir() {
                return Err(VaultError::NotFound { path: rel });
            }
            Some(rel)
        }
        None => None,
    };

    let mut matches: Vec<(String, i64)> = index::list_notes(ctx.vault())?
        .into_iter()
        .filter(|(rel, _)| match &folder {
            Some(f) if !f.is_empty() => rel.starts_with(&format!("{f}/")),
            _ => true,
        })
        .filter(|(rel, _)| matcher.is_match(rel))
        .collect();
    matches.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let total = matches.len();
    let paths: Vec<String> = matches
        .into_iter()
        .take(MAX_GLOB_RESULTS)
        .map(|(p, _)| p)
        .collect();
    Ok(json!({"pattern": pattern, "count": total, "matches": paths}))
}

// ─── Grep ────────────────────────────────────────────────────────────────────

fn grep_notes(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let pattern = str_arg(args, "pattern")?;
    let case_insensitive = opt_bool(args, "case_insensitive").unwrap_or(true);
    let context_lines = opt_usize(args, "context_lines").unwrap_or(DEFAULT_CONTEXT_LINES);
    let max_results = opt_usize(args, "max_results")
        .unwrap_or(DEFAULT_MAX_RESULTS)
        .max(1);
    let mode = opt_str(args, "output_mode").unwrap_or("files_with_matches");
    if !matches!(mode, "files_with_matches" | "content" | "count") {
        return Err(VaultError::InvalidArgument {
            reason: format!("unknown output_mode '{mode}'"),
        });
    }

    let re = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| VaultError::InvalidArgument {
            reason: format!("invalid regex: {e}"),
        })?;
    let path_filter = opt_str(args, "glob").map(glob_to_regex).transpose()?;

    let mut paths: Vec<String> = index::list_notes(ctx.vault())?
        .into_iter()
        .map(|(p, _)| p)
        .filter(|p| path_filter.as_ref().map(|f| f.is_match(p)).unwrap_or(true))
        .collect();
    paths.sort();

    let mut files: Vec<String> = Vec::new();
    let mut counts: Vec<String> = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut shown = 0usize;

    for path in paths {
        if shown >= max_results {
            break;
        }
        let content = match ctx.vault().read(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "grep skipped unreadable note");
                continue;
            }
        };
        let lines: Vec<&str> = content.lines().collect();
        let hits: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| re.is_match(l))
            .map(|(i, _)| i)
            .collect();
        if hits.is_empty() {
            continue;
        }

        match mode {
            "files_with_matches" => {
                files.push(path);
                shown += 1;
            }
            "count" => {
                counts.push(format!("{path}: {}", hits.len()));
                shown += 1;
            }
            _ => {
                let mut block = vec![format!("## {path}")];
                for &hit in hits.iter().take(MAX_MATCHES_PER_FILE) {
                    if shown >= max_results {
                        break;
                    }
                    let start = hit.saturating_sub(context_lines);
                    let end = hit
                        .saturating_add(context_lines)
                        .saturating_add(1)
                        .min(lines.len());
                    for (i, line) in lines.iter().enumerate().take(end).skip(start) {
                        let sep = if i == hit { ':' } else { '-' };
                        block.push(format!("{}{sep} {}", i + 1, line));
                    }
                    block.push("--".to_string());
                    shown += 1;
                }
                if hits.len() > MAX_MATCHES_PER_FILE {
                    block.push(format!(
                        "({} more matches in this note)",
                        hits.len() - MAX_MATCHES_PER_FILE
                    ));
                }
                blocks.push(block.join("\n"));
            }
        }
    }

    let result = match mode {
        "files_with_matches" => json!({"pattern": pattern, "files": files}),
        "count" => Value::String(if counts.is_empty() {
            format!("No matches for '{pattern}'.")
        } else {
            counts.join("\n")
        }),
        _ => Value::String(if blocks.is_empty() {
            format!("No matches for '{pattern}'.")
        } else {
            blocks.join("\n\n")
        }),
    };
    Ok(result)
}

// ─── Index-backed lookups ────────────────────────────────────────────────────

fn search_by_tag(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let tag = str_arg(args, "tag")?;
    let snapshot = ctx.snapshot()?;
    let notes: Vec<Value> = snapshot
        .notes_with_tag(tag)
        .into_iter()
        .map(|p| {
            let title = snapshot
                .notes
                .get(&p)
                .map(|e| e.title.clone())
                .unwrap_or_default();
            json!({"path": p, "title": title})
        })
        .collect();
    Ok(json!({"tag": tag.trim_start_matches('#'), "notes": notes}))
}

fn get_backlinks(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, _) = ctx.vault().resolve(str_arg(args, "path")?)?;
    let snapshot = ctx.snapshot()?;
    Ok(json!({"path": rel, "backlinks": snapshot.backlinks_to(&rel)}))
}

fn list_folder(ctx: &ToolContext, args: &Value) -> Result<Value, VaultError> {
    let (rel, abs) = ctx.vault().resolve_folder(opt_str(args, "path").unwrap_or(""))?;
    if !abs.is_dir() {
        return Err(VaultError::NotFound { path: rel });
    }

    let mut folders: Vec<String> = Vec::new();
    let mut entries: Vec<(String, String)> = Vec::new();
    let read_dir = std::fs::read_dir(&abs).map_err(|e| VaultError::io(&rel, e))?;
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        let child = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        if file_type.is_dir() {
            folders.push(format!("{name}/"));
        } else if name.to_lowercase().ends_with(".md") {
            let title = ctx
                .vault()
                .read(&child)
                .map(|c| {
                    let (fm, body) = notes::frontmatter_lenient(&c);
                    notes::extract_title(&fm, body, &child)
                })
                .unwrap_or_else(|_| notes::stem_of(&child).to_string());
            entries.push((child, title));
        }
    }
    folders.sort();
    entries.sort();

    let notes: Vec<Value> = entries
        .into_iter()
        .map(|(path, title)| json!({"path": path, "title": title}))
        .collect();
    let display = if rel.is_empty() { "/".to_string() } else { rel };
    Ok(json!({"folder": display, "folders": folders, "notes": notes}))
}
