//! Merge actions and their application to the working-copy tracker
//!
//! Resolving conflicts yields an [`ActionTable`]: per action kind, the paths
//! whose tracking state must change. [`apply`] replays the table against a
//! [`WorkingCopyTracker`] in a fixed order. Removals and forgets always run
//! before anything that (re)creates an entry, so a path that is removed and
//! re-added under a colliding name ends up added.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::context::{FileFlags, FileUpdate, ParentFileData, WorkingCopyTracker};
use crate::error::{MergeStateError, Result};

/// Message attached to actions produced by conflict resolution
pub const MERGE_RESULT_MESSAGE: &str = "merge result";

/// Kind of change an action makes to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The file is new in both parents
    Added,
    /// The file existed in one parent and is going away
    Removed,
    /// The file existed in at least one parent and is changing
    Modified,
}

/// Every action the merge layer exchanges with the working-copy tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Forget,
    Remove,
    Add,
    Get,
    PathConflict,
    PathConflictResolve,
    AddModified,
    Created,
    DeletedChanged,
    ChangedDeleted,
    Merge,
    LocalDirRenameGet,
    DirRenameMoveLocal,
    Keep,
    /// The file was absent locally before the merge and stays absent
    KeepAbsent,
    /// The file is absent in the ancestor and the other side; keep it
    KeepNew,
    Exec,
    CreatedMerge,
}

impl ActionKind {
    pub const ALL: [ActionKind; 18] = [
        Self::Forget,
        Self::Remove,
        Self::Add,
        Self::Get,
        Self::PathConflict,
        Self::PathConflictResolve,
        Self::AddModified,
        Self::Created,
        Self::DeletedChanged,
        Self::ChangedDeleted,
        Self::Merge,
        Self::LocalDirRenameGet,
        Self::DirRenameMoveLocal,
        Self::Keep,
        Self::KeepAbsent,
        Self::KeepNew,
        Self::Exec,
        Self::CreatedMerge,
    ];

    /// Short code used in debug output
    pub fn short(&self) -> &'static str {
        match self {
            Self::Forget => "f",
            Self::Remove => "r",
            Self::Add => "a",
            Self::Get => "g",
            Self::PathConflict => "p",
            Self::PathConflictResolve => "pr",
            Self::AddModified => "am",
            Self::Created => "c",
            Self::DeletedChanged => "dc",
            Self::ChangedDeleted => "cd",
            Self::Merge => "m",
            Self::LocalDirRenameGet => "dg",
            Self::DirRenameMoveLocal => "dm",
            Self::Keep => "k",
            Self::KeepAbsent => "ka",
            Self::KeepNew => "kn",
            Self::Exec => "e",
            Self::CreatedMerge => "cm",
        }
    }

    pub fn from_short(short: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.short() == short)
    }

    /// Actions that touch neither content nor tracking state
    pub fn is_no_op(&self) -> bool {
        matches!(self, Self::Keep | Self::KeepAbsent | Self::KeepNew)
    }

    /// Actions that can safely apply to files outside a narrow clone's set
    pub fn is_narrow_safe(&self) -> bool {
        matches!(
            self,
            Self::Forget
                | Self::Remove
                | Self::Add
                | Self::Get
                | Self::AddModified
                | Self::Created
                | Self::Exec
                | Self::CreatedMerge
        )
    }

    /// The change this action implies, where it is known up front
    pub fn changes(&self) -> Option<ChangeKind> {
        match self {
            Self::Forget | Self::Remove => Some(ChangeKind::Removed),
            Self::Add | Self::AddModified | Self::Created | Self::CreatedMerge => {
                Some(ChangeKind::Added)
            }
            Self::Get | Self::Exec => Some(ChangeKind::Modified),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Per-action arguments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActionArgs {
    #[default]
    None,
    /// The conflicting path and the path it originally came from
    PathConflictResolve { source: String, original: String },
    /// A content merge planned by the merge layer
    Merge {
        local_path: String,
        other_path: String,
        ancestor_path: String,
        moved: bool,
    },
    /// A directory rename carrying a file from `source`
    DirRename { source: String, flags: FileFlags },
}

/// One `(path, args, message)` action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
    pub path: String,
    pub args: ActionArgs,
    pub message: String,
}

impl ActionEntry {
    pub fn new(path: impl Into<String>, args: ActionArgs, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args,
            message: message.into(),
        }
    }

    /// An action produced by conflict resolution
    pub fn merge_result(path: impl Into<String>) -> Self {
        Self::new(path, ActionArgs::None, MERGE_RESULT_MESSAGE)
    }
}

/// Actions grouped by kind; kinds without actions are absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTable {
    actions: BTreeMap<ActionKind, Vec<ActionEntry>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ActionKind, entry: ActionEntry) {
        self.actions.entry(kind).or_default().push(entry);
    }

    /// Actions of one kind, in insertion order
    pub fn get(&self, kind: ActionKind) -> &[ActionEntry] {
        self.actions.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn kinds(&self) -> impl Iterator<Item = ActionKind> + '_ {
        self.actions.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionKind, &ActionEntry)> + '_ {
        self.actions
            .iter()
            .flat_map(|(kind, entries)| entries.iter().map(move |e| (*kind, e)))
    }

    /// Total number of actions
    pub fn len(&self) -> usize {
        self.actions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Append the actions of another table (e.g. those planned by the merge
    /// layer) to this one
    pub fn extend(&mut self, other: ActionTable) {
        for (kind, entries) in other.actions {
            self.actions.entry(kind).or_default().extend(entries);
        }
    }
}

impl FromIterator<(ActionKind, ActionEntry)> for ActionTable {
    fn from_iter<T: IntoIterator<Item = (ActionKind, ActionEntry)>>(iter: T) -> Self {
        let mut table = Self::new();
        for (kind, entry) in iter {
            table.push(kind, entry);
        }
        table
    }
}

/// Order in which action kinds reach the tracker
pub const APPLY_ORDER: [ActionKind; 13] = [
    ActionKind::Remove,
    ActionKind::Forget,
    ActionKind::PathConflictResolve,
    ActionKind::Add,
    ActionKind::AddModified,
    ActionKind::Exec,
    ActionKind::Keep,
    ActionKind::KeepAbsent,
    ActionKind::KeepNew,
    ActionKind::Get,
    ActionKind::Merge,
    ActionKind::DirRenameMoveLocal,
    ActionKind::LocalDirRenameGet,
];

fn invalid_args(kind: ActionKind, entry: &ActionEntry) -> MergeStateError {
    MergeStateError::InvalidAction {
        kind: kind.short(),
        path: entry.path.clone(),
    }
}

/// Record merge actions in the working-copy tracker
///
/// `branch_merge` distinguishes a merge with a second parent from an update.
/// `file_data` supplies stat data for files fetched during an update.
pub fn apply(
    tracker: &mut dyn WorkingCopyTracker,
    actions: &ActionTable,
    branch_merge: bool,
    file_data: Option<&HashMap<String, ParentFileData>>,
) -> Result<()> {
    for kind in APPLY_ORDER {
        for entry in actions.get(kind) {
            debug!(action = kind.short(), path = %entry.path, "recording merge action");
            apply_one(tracker, kind, entry, branch_merge, file_data)?;
        }
    }
    Ok(())
}

fn apply_one(
    tracker: &mut dyn WorkingCopyTracker,
    kind: ActionKind,
    entry: &ActionEntry,
    branch_merge: bool,
    file_data: Option<&HashMap<String, ParentFileData>>,
) -> Result<()> {
    let f = entry.path.as_str();
    match kind {
        ActionKind::Remove => {
            tracker.update_file(f, FileUpdate::new(branch_merge, false))?;
        }
        ActionKind::Forget => {
            tracker.update_file(f, FileUpdate::new(false, false))?;
        }
        ActionKind::PathConflictResolve => {
            let ActionArgs::PathConflictResolve { source, original } = &entry.args else {
                return Err(invalid_args(kind, entry));
            };
            tracker.update_file(f, FileUpdate::new(false, true))?;
            tracker.copy(original, f)?;
            if source == original {
                tracker.update_file(source, FileUpdate::new(true, false))?;
            } else {
                tracker.update_file(source, FileUpdate::new(false, false))?;
            }
        }
        ActionKind::Add => {
            tracker.update_file(f, FileUpdate::new(false, true))?;
        }
        ActionKind::AddModified => {
            let update = if branch_merge {
                FileUpdate::new(true, true).possibly_dirty()
            } else {
                FileUpdate::new(false, true)
            };
            tracker.update_file(f, update)?;
        }
        ActionKind::Exec => {
            tracker.update_file(f, FileUpdate::new(true, true).possibly_dirty())?;
        }
        ActionKind::Get => {
            if branch_merge {
                let old = tracker.get_entry(f)?;
                let p1_tracked = old.any_tracked && !old.added;
                tracker.update_file(f, FileUpdate::new(p1_tracked, true).with_p2_info())?;
            } else {
                let parent_data = file_data.and_then(|data| data.get(f)).copied();
                tracker.update_file(
                    f,
                    FileUpdate::new(true, true).with_parent_file_data(parent_data),
                )?;
            }
        }
        ActionKind::Merge => {
            let ActionArgs::Merge {
                local_path: f1,
                other_path: f2,
                moved,
                ..
            } = &entry.args
            else {
                return Err(invalid_args(kind, entry));
            };
            if branch_merge {
                tracker.update_file(f, FileUpdate::new(f1 == f, true).with_p2_info())?;
                if f1 != f2 {
                    if *moved {
                        tracker.update_file(f1, FileUpdate::new(true, false))?;
                    }
                    if f1 != f {
                        tracker.copy(f1, f)?;
                    } else {
                        tracker.copy(f2, f)?;
                    }
                }
            } else {
                // an update merge looks like a plain local modification
                if f2 == f {
                    tracker.update_file(f, FileUpdate::new(true, true).possibly_dirty())?;
                }
                if *moved {
                    tracker.update_file(f1, FileUpdate::new(false, false))?;
                }
            }
        }
        ActionKind::DirRenameMoveLocal => {
            let ActionArgs::DirRename { source, .. } = &entry.args else {
                return Err(invalid_args(kind, entry));
            };
            if branch_merge {
                tracker.update_file(f, FileUpdate::new(false, true))?;
                tracker.update_file(source, FileUpdate::new(true, false))?;
                tracker.copy(source, f)?;
            } else {
                tracker.update_file(f, FileUpdate::new(true, true))?;
                tracker.update_file(source, FileUpdate::new(false, false))?;
            }
        }
        ActionKind::LocalDirRenameGet => {
            let ActionArgs::DirRename { source, .. } = &entry.args else {
                return Err(invalid_args(kind, entry));
            };
            if branch_merge {
                tracker.update_file(f, FileUpdate::new(false, true))?;
                tracker.copy(source, f)?;
            } else {
                tracker.update_file(f, FileUpdate::new(true, true))?;
            }
        }
        // no-ops, and kinds the merge layer handles before recording
        _ => {}
    }
    Ok(())
}
