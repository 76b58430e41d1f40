//! Interfaces to the systems the merge state works against
//!
//! The engine never reaches into the revision store, the working directory,
//! the merge tool or the working-copy tracker directly. Callers hand in
//! implementations of the traits below; their failures surface as
//! [`crate::MergeStateError::External`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::node::Node;

/// File mode flags tracked by the revision store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileFlags {
    #[default]
    None,
    Executable,
    Symlink,
}

impl FileFlags {
    /// Parse the on-disk form (`""`, `"x"` or `"l"`)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "" => Some(Self::None),
            "x" => Some(Self::Executable),
            "l" => Some(Self::Symlink),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Executable => "x",
            Self::Symlink => "l",
        }
    }
}

/// One side of a three-way merge: a file at a given revision, or its absence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    /// Path of the file on this side
    pub path: String,
    /// File revision; null when absent
    pub filenode: Node,
    /// Changeset the file revision belongs to
    pub changeset: Node,
    pub flags: FileFlags,
    /// Content; `None` when the file does not exist on this side
    pub data: Option<Bytes>,
}

impl FileVersion {
    pub fn new(
        path: impl Into<String>,
        filenode: Node,
        changeset: Node,
        flags: FileFlags,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            path: path.into(),
            filenode,
            changeset,
            flags,
            data: Some(data.into()),
        }
    }

    /// The file does not exist on this side
    pub fn absent(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filenode: Node::null(),
            changeset: Node::null(),
            flags: FileFlags::None,
            data: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.data.is_none()
    }

    /// Byte-for-byte equality of content (two absent files are equal)
    pub fn same_content(&self, other: &FileVersion) -> bool {
        self.data == other.data
    }
}

/// A revision of the repository, or the working copy itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    WorkingCopy,
    Node(Node),
}

/// Read access to revision history and file contents
pub trait Repository {
    /// The file revision `filenode` of `path`
    fn get_file_content(&self, path: &str, filenode: &Node) -> anyhow::Result<FileVersion>;

    /// `path` as it exists in `changeset`, or `None` if it is not there
    fn get_file_at(&self, changeset: &Node, path: &str) -> anyhow::Result<Option<FileVersion>>;

    /// Parents of a revision; the working copy has one or two
    fn revision_parents(&self, rev: &Revision) -> anyhow::Result<Vec<Node>>;
}

/// Write access to files in the working directory
pub trait WorkingDirectory {
    fn write_file(&mut self, path: &str, data: &[u8], flags: FileFlags) -> anyhow::Result<()>;

    /// Remove a file; a file that is already missing is not an error
    fn remove_file(&mut self, path: &str) -> anyhow::Result<()>;
}

/// Everything the external merge tool needs for one file
#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    /// Local ("ours") revision of the session
    pub local_rev: &'a Node,
    /// Local path of the file being merged
    pub path: &'a str,
    pub local: &'a FileVersion,
    pub other: &'a FileVersion,
    pub ancestor: &'a FileVersion,
    pub labels: &'a [String],
}

/// Result reported by the merge tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Zero when the file merged cleanly
    pub return_code: i32,
    /// The tool resolved the conflict by deleting the file
    pub deleted: bool,
}

impl MergeOutcome {
    pub fn clean() -> Self {
        Self {
            return_code: 0,
            deleted: false,
        }
    }

    pub fn conflicted(return_code: i32) -> Self {
        Self {
            return_code,
            deleted: false,
        }
    }
}

/// The external text merge tool
pub trait MergeTool {
    /// Merge one file; a non-zero return code is a normal "still conflicted"
    /// outcome, an `Err` is a tool failure
    fn merge(
        &mut self,
        repo: &dyn Repository,
        wctx: &mut dyn WorkingDirectory,
        request: &MergeRequest<'_>,
    ) -> anyhow::Result<MergeOutcome>;
}

/// Stat data of a file freshly written from a parent revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentFileData {
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
}

/// Tracking-state change for one path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileUpdate {
    pub p1_tracked: bool,
    pub wc_tracked: bool,
    pub p2_info: bool,
    pub possibly_dirty: bool,
    pub parent_file_data: Option<ParentFileData>,
}

impl FileUpdate {
    pub fn new(p1_tracked: bool, wc_tracked: bool) -> Self {
        Self {
            p1_tracked,
            wc_tracked,
            ..Default::default()
        }
    }

    pub fn possibly_dirty(mut self) -> Self {
        self.possibly_dirty = true;
        self
    }

    pub fn with_p2_info(mut self) -> Self {
        self.p2_info = true;
        self
    }

    pub fn with_parent_file_data(mut self, data: Option<ParentFileData>) -> Self {
        self.parent_file_data = data;
        self
    }
}

/// Current tracking state of a path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerEntry {
    pub any_tracked: bool,
    pub added: bool,
}

/// The working-copy tracker ("dirstate") that merge actions are applied to
pub trait WorkingCopyTracker {
    fn update_file(&mut self, path: &str, update: FileUpdate) -> anyhow::Result<()>;

    /// Record `dest` as a copy of `source`
    fn copy(&mut self, source: &str, dest: &str) -> anyhow::Result<()>;

    fn get_entry(&self, path: &str) -> anyhow::Result<TrackerEntry>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        for flags in [FileFlags::None, FileFlags::Executable, FileFlags::Symlink] {
            assert_eq!(FileFlags::parse(flags.as_str()), Some(flags));
        }
        assert_eq!(FileFlags::parse("xl"), None);
    }

    #[test]
    fn test_absent_versions() {
        let absent = FileVersion::absent("a");
        assert!(absent.is_absent());
        assert!(absent.filenode.is_null());
        assert!(absent.same_content(&FileVersion::absent("b")));

        let present = FileVersion::new("a", Node::null(), Node::null(), FileFlags::None, "");
        assert!(!present.is_absent());
        assert!(!present.same_content(&absent));
    }

    #[test]
    fn test_file_update_builders() {
        let update = FileUpdate::new(true, true).possibly_dirty().with_p2_info();
        assert!(update.p1_tracked && update.wc_tracked);
        assert!(update.possibly_dirty && update.p2_info);
        assert_eq!(update.parent_file_data, None);
    }
}
