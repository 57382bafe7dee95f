//! Vault — the markdown notes folder the assistant operates on.
//!
//! Submodules:
//! - `notes`: path resolution, atomic writes, front-matter and tag/link parsing
//! - `index`: scanned snapshot of folders, tags, and note summaries, plus its cache
//! - `settings`: user-editable runtime settings stored next to the vault
//! - `errors`: vault error types

pub mod errors;
pub mod index;
pub mod notes;
pub mod settings;

pub use errors::VaultError;
pub use index::{render_summary, SummaryLimits, VaultIndex, VaultIndexSnapshot};
pub use notes::Vault;
pub use settings::{SettingsPatch, SettingsStore, UserSettings};
