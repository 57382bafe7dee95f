//! Vault error types.

use thiserror::Error;

/// Errors raised while reading, writing, or indexing the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A requested path resolves outside the vault root.
    #[error("path escapes the vault: '{path}'")]
    PathEscape { path: String },

    /// The note does not exist.
    #[error("note not found: '{path}'")]
    NotFound { path: String },

    /// The note already exists (create refuses to overwrite).
    #[error("note already exists: '{path}'")]
    AlreadyExists { path: String },

    /// A tool argument is present but unusable.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Filesystem I/O failed for a specific path.
    #[error("I/O error on '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The vault root could not be scanned. The previous snapshot stays in use.
    #[error("failed to build vault index for '{root}': {reason}")]
    IndexBuild { root: String, reason: String },

    /// Front-matter block is not valid YAML.
    #[error("invalid front-matter in '{path}': {reason}")]
    Frontmatter { path: String, reason: String },
}

impl VaultError {
    pub(crate) fn io(path: impl std::fmt::Display, e: std::io::Error) -> Self {
        VaultError::Io {
            path: path.to_string(),
            reason: e.to_string(),
        }
    }
}
