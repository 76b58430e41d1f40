//! Error types for the merge-state engine

use std::path::PathBuf;

/// Result type for merge-state operations
pub type Result<T> = std::result::Result<T, MergeStateError>;

/// Errors that can occur while tracking, persisting or resolving merge state
#[derive(Debug, thiserror::Error)]
pub enum MergeStateError {
    /// `local` or `other` was read before `start` (a caller bug)
    #[error("{0} accessed but the merge state was never started")]
    UninitializedAccess(&'static str),

    /// The state file holds mandatory records this reader does not know
    #[error("unsupported merge state records: {}", .0.join(", "))]
    UnsupportedRecords(Vec<String>),

    /// A state file is truncated or otherwise malformed
    #[error("corrupt merge state file {}: {detail}", .file.display())]
    Corrupt { file: PathBuf, detail: String },

    /// Reading or writing a backup failed
    #[error("backup {key} unavailable: {source}")]
    Backup {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no merge state entry for {0}")]
    UnknownPath(String),

    /// A state that does not fit the kind of entry it was applied to
    #[error("state {state} does not apply to the entry for {path}")]
    InvalidState { path: String, state: &'static str },

    /// An action table entry whose arguments do not fit its kind
    #[error("action {kind} for {path} carries the wrong arguments")]
    InvalidAction { kind: &'static str, path: String },

    #[error("invalid node identifier: {0:?}")]
    InvalidNode(String),

    #[error("invalid merge state configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure raised by a repository, working directory, merge tool or tracker
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl MergeStateError {
    pub(crate) fn corrupt(file: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            file: file.into(),
            detail: detail.into(),
        }
    }
}
