//! Mergestate Core Library
//!
//! Persistent three-way merge state for an interrupted merge, including:
//! - Record codec for the v1 and v2 state files
//! - Backup storage for pre-merge local contents (disk and memory)
//! - Conflict registry and session lifecycle
//! - Conflict resolution through an external merge tool
//! - Translation of resolutions into working-copy tracker actions

pub mod action;
pub mod backup;
pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod record;
pub mod resolve;
pub mod state;

pub use action::{apply, ActionArgs, ActionEntry, ActionKind, ActionTable, ChangeKind};
pub use backup::{BackupStore, DiskBackupStore, MemoryBackupStore};
pub use config::MergeStateConfig;
pub use context::{
    FileFlags, FileUpdate, FileVersion, MergeOutcome, MergeRequest, MergeTool, ParentFileData,
    Repository, Revision, TrackerEntry, WorkingCopyTracker, WorkingDirectory,
};
pub use error::{MergeStateError, Result};
pub use node::{BackupKey, Node};
pub use record::{Record, RecordType, RecordView, StateFiles};
pub use resolve::{merge_flags, ResolveSummary};
pub use state::{
    EntryState, Extras, FileConflict, MergeEntry, MergeState, PathConflict, PathOrigin,
    ResolutionResult,
};
