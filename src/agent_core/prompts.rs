//! System prompt assembly.
//!
//! The prompt is rebuilt for every model call from four parts: a static intro
//! and rule set, the current date and time, the user's guideline note, and
//! the rendered vault summary.

use chrono::{DateTime, Local};

use crate::agent_core::tokens::truncate_chars;
use crate::vault::{notes, Vault, VaultError};

/// Identity and intro (static).
const SYSTEM_PROMPT_INTRO: &str = "You are Knap, an assistant that manages a vault \
of markdown notes for the user. You read, search, and edit notes by calling the \
tools you are given. You never see the vault except through those tools and the \
summary below.";

fn system_prompt_rules() -> &'static str {
    "Rules:\n\
1. SEARCH FIRST: before creating a note, look for an existing one with \
glob_notes or grep_notes. Never assume a note does not exist.\n\
2. READ BEFORE WRITING: always call read_note before editing or replacing a note. \
read_note prefixes lines with numbers; never copy those numbers into an edit.\n\
3. BE SURGICAL: prefer edit_note for small changes. Use update_note only when \
most of the note changes.\n\
4. DO NOT ASK IN TEXT: for changes, call the tool directly. The user is shown \
every change and approves or rejects it before anything is written.\n\
5. If a tool result says a change was rejected by the user or expired, do not \
retry it unless the user asks again.\n\
6. Do only what was asked. Keep replies short: one line confirming what changed \
or what you found.\n\
7. Only report results you actually received from tool calls.\n\
8. Links between notes use [[Note Name]]. External links use [text](url).\n\n\
Examples:\n\
  User: \"Add eggs to my shopping list\"\n\
  Step 1: grep_notes({\"pattern\": \"shopping\", \"output_mode\": \"files_with_matches\"})\n\
  Step 2: read_note({\"path\": \"Lists/Shopping.md\"})\n\
  Step 3: append_to_note({\"path\": \"Lists/Shopping.md\", \"content\": \"- [ ] Eggs\"})\n\n\
  User: \"I bought the potatoes\"\n\
  Step 1: grep_notes({\"pattern\": \"potato\"})\n\
  Step 2: read_note on the match\n\
  Step 3: edit_note({\"path\": \"...\", \"old_string\": \"- [ ] Potatoes\", \"new_string\": \"- [x] Potatoes\"})\n\n\
If a \"User Guidelines\" section appears below, its preferences override these defaults."
}

/// Build the full system prompt for one model call.
pub fn build_system_prompt(
    now: DateTime<Local>,
    guidelines: Option<&str>,
    vault_summary: &str,
) -> String {
    let rules = system_prompt_rules();
    let when = now.format("%A, %B %d, %Y at %H:%M");

    let mut prompt = format!(
        "{SYSTEM_PROMPT_INTRO}\n\n{rules}\n\n## Current Date and Time\n\n{when}"
    );
    if let Some(text) = guidelines {
        prompt.push_str("\n\n## User Guidelines\n\n");
        prompt.push_str(text);
    }
    prompt.push_str("\n\n");
    prompt.push_str(vault_summary);
    prompt
}

/// Read the guideline note, front-matter stripped and bounded to `max_chars`.
///
/// Returns `None` when the note is absent, empty, or unreadable; a broken
/// guideline note never blocks a turn.
pub fn load_guidelines(vault: &Vault, note: &str, max_chars: usize) -> Option<String> {
    let content = match vault.read(note) {
        Ok(content) => content,
        Err(VaultError::NotFound { .. }) => return None,
        Err(e) => {
            tracing::warn!(note = %note, error = %e, "failed to read guideline note");
            return None;
        }
    };

    let body = notes::strip_frontmatter(&content).trim();
    if body.is_empty() {
        return None;
    }
    let bounded = truncate_chars(body, max_chars);
    if bounded.len() < body.len() {
        tracing::debug!(note = %note, max_chars, "guideline note truncated");
        return Some(format!("{bounded}\n[guidelines truncated]"));
    }
    Some(bounded.to_string())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_prompt_sections_in_order() {
        let now = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 0).unwrap();
        let prompt = build_system_prompt(now, Some("Reply in Portuguese."), "## Your Vault\n\n**2 notes** indexed");

        let rules = prompt.find("Rules:").unwrap();
        let date = prompt.find("Friday, March 07, 2025 at 09:05").unwrap();
        let guide = prompt.find("## User Guidelines\n\nReply in Portuguese.").unwrap();
        let vault = prompt.find("## Your Vault").unwrap();
        assert!(rules < date && date < guide && guide < vault);
    }

    #[test]
    fn test_prompt_without_guidelines() {
        let prompt = build_system_prompt(Local::now(), None, "## Your Vault");
        assert!(!prompt.contains("## User Guidelines"));
        assert!(prompt.ends_with("## Your Vault"));
    }

    #[test]
    fn test_load_guidelines() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        assert!(load_guidelines(&vault, "KNAP.md", 100).is_none());

        vault
            .write("KNAP.md", "---\naliases: [rules]\n---\nAlways use metric units.\n")
            .unwrap();
        assert_eq!(
            load_guidelines(&vault, "KNAP.md", 100).as_deref(),
            Some("Always use metric units.")
        );

        let bounded = load_guidelines(&vault, "KNAP.md", 6).unwrap();
        assert!(bounded.starts_with("Always\n"));
        assert!(bounded.ends_with("[guidelines truncated]"));
    }
}
