//! Conflict resolution
//!
//! Resolving a file conflict restores the backed-up local content into the
//! working directory, runs the merge tool against the other and ancestor
//! versions, and classifies the result into the tracker action it implies.

use tracing::{debug, info, warn};

use crate::action::{ActionArgs, ActionKind};
use crate::backup::BackupStore;
use crate::context::{
    FileFlags, FileVersion, MergeRequest, MergeTool, Repository, WorkingDirectory,
};
use crate::error::{MergeStateError, Result};
use crate::node::Node;
use crate::state::{EntryState, FileConflict, MergeEntry, MergeState, ResolutionResult};

/// Flags to apply to the working file before merging
///
/// Only the executable bit is merged, and only when no side is a symlink.
/// Without a common ancestor differing flags cannot be merged, so the local
/// ones are kept.
pub fn merge_flags(
    local: FileFlags,
    ancestor: FileFlags,
    other: FileFlags,
    root_conflict: bool,
    ancestor_path: &str,
) -> FileFlags {
    let sides = [local, ancestor, other];
    if !sides.contains(&FileFlags::Executable) || sides.contains(&FileFlags::Symlink) {
        return local;
    }
    if root_conflict {
        if local != other {
            warn!(
                path = ancestor_path,
                "cannot merge flags without common ancestor, keeping local flags"
            );
        }
        return local;
    }
    if local == ancestor { other } else { local }
}

/// Aggregate outcome of [`MergeState::resolve_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    /// Paths the merge tool left conflicted, with its return code
    pub failed: Vec<(String, i32)>,
    /// Paths dropped because both sides already matched
    pub identical: Vec<String>,
    pub merged: usize,
}

impl ResolveSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<B: BackupStore> MergeState<B> {
    /// Rerun the merge for `path`
    ///
    /// Returns the merge tool's return code, or `None` when the local and
    /// other contents were identical and the entry was dropped. Entries that
    /// are already resolved return `Some(0)` without side effects.
    pub fn resolve(
        &mut self,
        path: &str,
        repo: &dyn Repository,
        wctx: &mut dyn WorkingDirectory,
        tool: &mut dyn MergeTool,
    ) -> Result<Option<i32>> {
        let conflict = match self.entries.get(path) {
            None => return Err(MergeStateError::UnknownPath(path.to_string())),
            Some(MergeEntry::Path(_)) => return self.resolve_path_conflict(path),
            Some(MergeEntry::File(fc)) => fc.clone(),
        };
        if conflict.state == EntryState::Resolved {
            return Ok(Some(0));
        }

        let local_rev = self.local()?.clone();
        let other_rev = self.other()?.clone();

        let other = self.other_version(&conflict, &other_rev, repo)?;
        let root_conflict = conflict.ancestor_node.is_null();
        let ancestor = if root_conflict {
            FileVersion::absent(&conflict.ancestor_path)
        } else {
            repo.get_file_content(&conflict.ancestor_path, &conflict.ancestor_node)?
        };
        let flags = merge_flags(
            conflict.flags,
            ancestor.flags,
            other.flags,
            root_conflict,
            &conflict.ancestor_path,
        );

        let local = if conflict.local_key.is_null() {
            wctx.remove_file(path)?;
            FileVersion::absent(path)
        } else {
            let data = self.backups.get(&conflict.local_key)?;
            wctx.write_file(path, &data, flags)?;
            FileVersion {
                path: path.to_string(),
                filenode: Node::null(),
                changeset: local_rev.clone(),
                flags,
                data: Some(data),
            }
        };

        if other.same_content(&local) {
            debug!(path, "local and other are identical, dropping entry");
            self.entries.remove(path);
            self.results.insert(
                path.to_string(),
                ResolutionResult {
                    return_code: None,
                    action: None,
                    args: ActionArgs::None,
                },
            );
            self.dirty = true;
            return Ok(None);
        }

        let labels = self.labels.clone().unwrap_or_default();
        let request = MergeRequest {
            local_rev: &local_rev,
            path: &conflict.local_path,
            local: &local,
            other: &other,
            ancestor: &ancestor,
            labels: &labels,
        };
        let outcome = tool.merge(repo, wctx, &request)?;

        if outcome.return_code == 0 {
            self.mark(path, EntryState::Resolved)?;
        }

        let action = if outcome.deleted {
            Some(if local.is_absent() {
                ActionKind::Forget
            } else {
                ActionKind::Remove
            })
        } else if local.is_absent() {
            Some(ActionKind::Get)
        } else if other.is_absent() {
            // the merge result becomes a new file unless local already tracks it
            if repo.get_file_at(&local_rev, path)?.is_some() {
                Some(ActionKind::AddModified)
            } else {
                Some(ActionKind::Add)
            }
        } else {
            None
        };

        debug!(
            path,
            return_code = outcome.return_code,
            action = action.map(|a| a.short()),
            "resolved file"
        );
        self.results.insert(
            path.to_string(),
            ResolutionResult {
                return_code: Some(outcome.return_code),
                action,
                args: ActionArgs::None,
            },
        );
        self.dirty = true;
        Ok(Some(outcome.return_code))
    }

    /// Resolve every unresolved entry, stopping at the first hard failure
    ///
    /// Non-zero merge tool return codes are collected instead of aborting.
    pub fn resolve_all(
        &mut self,
        repo: &dyn Repository,
        wctx: &mut dyn WorkingDirectory,
        tool: &mut dyn MergeTool,
    ) -> Result<ResolveSummary> {
        let pending: Vec<String> = self.unresolved().map(str::to_string).collect();
        let mut summary = ResolveSummary::default();
        for path in pending {
            match self.resolve(&path, repo, wctx, tool)? {
                None => summary.identical.push(path),
                Some(0) => summary.merged += 1,
                Some(code) => summary.failed.push((path, code)),
            }
        }
        if summary.is_clean() {
            info!(merged = summary.merged, "all conflicts resolved");
        } else {
            warn!(
                unresolved = summary.failed.len(),
                "merge tool left conflicts unresolved"
            );
        }
        Ok(summary)
    }

    fn other_version(
        &self,
        conflict: &FileConflict,
        other_rev: &Node,
        repo: &dyn Repository,
    ) -> Result<FileVersion> {
        let version = match &conflict.other_node {
            Some(node) if node.is_null() => FileVersion::absent(&conflict.other_path),
            Some(node) => repo.get_file_content(&conflict.other_path, node)?,
            // rebuilt from a v1 file: only the other changeset is known
            None => repo
                .get_file_at(other_rev, &conflict.other_path)?
                .unwrap_or_else(|| FileVersion::absent(&conflict.other_path)),
        };
        Ok(version)
    }

    fn resolve_path_conflict(&mut self, path: &str) -> Result<Option<i32>> {
        self.local()?;
        self.other()?;
        let Some(MergeEntry::Path(pc)) = self.entries.get_mut(path) else {
            return Err(MergeStateError::UnknownPath(path.to_string()));
        };
        if pc.state == EntryState::ResolvedPath {
            return Ok(Some(0));
        }
        pc.state = EntryState::ResolvedPath;
        let rename_target = pc.rename_target.clone();
        debug!(path, rename_target = %rename_target, "resolved path conflict");
        self.results.insert(
            rename_target,
            ResolutionResult {
                return_code: Some(0),
                action: Some(ActionKind::PathConflictResolve),
                args: ActionArgs::PathConflictResolve {
                    source: path.to_string(),
                    original: path.to_string(),
                },
            },
        );
        self.dirty = true;
        Ok(Some(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FileFlags::{Executable as X, None as N, Symlink as L};

    #[test]
    fn test_exec_bit_follows_changed_side() {
        // local unchanged from ancestor: take other
        assert_eq!(merge_flags(N, N, X, false, "a"), X);
        // local changed: keep local
        assert_eq!(merge_flags(X, N, N, false, "a"), X);
        assert_eq!(merge_flags(N, X, X, false, "a"), N);
    }

    #[test]
    fn test_symlinks_and_plain_files_keep_local() {
        assert_eq!(merge_flags(L, N, X, false, "a"), L);
        assert_eq!(merge_flags(N, X, L, false, "a"), N);
        assert_eq!(merge_flags(N, N, N, false, "a"), N);
    }

    #[test]
    fn test_root_conflict_keeps_local() {
        assert_eq!(merge_flags(N, N, X, true, "a"), N);
        assert_eq!(merge_flags(X, N, X, true, "a"), X);
    }

    #[test]
    fn test_summary_cleanliness() {
        let mut summary = ResolveSummary::default();
        assert!(summary.is_clean());
        summary.failed.push(("a".into(), 1));
        assert!(!summary.is_clean());
    }
}
