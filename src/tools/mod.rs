//! Tools the model can call against the vault.
//!
//! Submodules:
//! - `registry`: name → capability mapping, schema validation, dispatch
//! - `read`: note reading, front-matter, daily notes
//! - `search`: glob, grep, tags, folders, backlinks
//! - `write`: destructive note mutations with previews
//! - `admin`: index refresh and settings

pub mod admin;
pub mod read;
pub mod registry;
pub mod search;
pub mod write;

pub use registry::{ProposedAction, RegisteredTool, ToolContext, ToolRegistry};

/// Registry with every vault tool registered.
pub fn vault_tools() -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    read::register(&mut reg);
    search::register(&mut reg);
    write::register(&mut reg);
    admin::register(&mut reg);
    reg
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_tools_flags() {
        let reg = vault_tools();
        for name in [
            "read_note",
            "grep_notes",
            "glob_notes",
            "search_by_tag",
            "list_folder",
            "get_backlinks",
            "get_frontmatter",
            "get_daily_note",
            "refresh_vault_index",
            "get_settings",
        ] {
            assert!(!reg.is_destructive(name), "{name} should be read-only");
        }
        for name in [
            "create_note",
            "update_note",
            "append_to_note",
            "edit_note",
            "delete_note",
            "set_frontmatter",
            "update_settings",
        ] {
            assert!(reg.is_destructive(name), "{name} should be destructive");
        }
        assert_eq!(reg.len(), 17);
    }
}
