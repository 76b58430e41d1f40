//! Shared fakes for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use mergestate_core::{
    FileFlags, FileUpdate, FileVersion, MergeOutcome, MergeRequest, MergeTool, Node, Repository,
    Revision, TrackerEntry, WorkingCopyTracker, WorkingDirectory,
};

pub fn node(hex: &str) -> Node {
    Node::from_hex(hex).unwrap()
}

pub fn version(path: &str, filenode: &str, changeset: &str, data: &'static str) -> FileVersion {
    FileVersion::new(path, node(filenode), node(changeset), FileFlags::None, data)
}

/// Revision store backed by maps
#[derive(Default)]
pub struct FakeRepo {
    revisions: HashMap<(String, String), FileVersion>,
    changesets: HashMap<(String, String), FileVersion>,
    pub parents: Vec<Node>,
}

impl FakeRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `file` reachable by its file revision and by its changeset
    pub fn insert(&mut self, file: FileVersion) {
        self.revisions
            .insert((file.path.clone(), file.filenode.to_hex()), file.clone());
        self.changesets
            .insert((file.changeset.to_hex(), file.path.clone()), file);
    }
}

impl Repository for FakeRepo {
    fn get_file_content(&self, path: &str, filenode: &Node) -> anyhow::Result<FileVersion> {
        self.revisions
            .get(&(path.to_string(), filenode.to_hex()))
            .cloned()
            .ok_or_else(|| anyhow!("no revision {} of {}", filenode, path))
    }

    fn get_file_at(&self, changeset: &Node, path: &str) -> anyhow::Result<Option<FileVersion>> {
        Ok(self
            .changesets
            .get(&(changeset.to_hex(), path.to_string()))
            .cloned())
    }

    fn revision_parents(&self, rev: &Revision) -> anyhow::Result<Vec<Node>> {
        match rev {
            Revision::WorkingCopy => Ok(self.parents.clone()),
            Revision::Node(_) => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
pub struct FakeWorkingDir {
    pub files: BTreeMap<String, (Vec<u8>, FileFlags)>,
}

impl WorkingDirectory for FakeWorkingDir {
    fn write_file(&mut self, path: &str, data: &[u8], flags: FileFlags) -> anyhow::Result<()> {
        self.files.insert(path.to_string(), (data.to_vec(), flags));
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> anyhow::Result<()> {
        self.files.remove(path);
        Ok(())
    }
}

/// Merge tool returning canned outcomes
#[derive(Default)]
pub struct ScriptedTool {
    pub outcomes: HashMap<String, MergeOutcome>,
    pub fail: bool,
    pub calls: Vec<String>,
    pub seen_labels: Vec<String>,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, path: &str, outcome: MergeOutcome) -> Self {
        self.outcomes.insert(path.to_string(), outcome);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl MergeTool for ScriptedTool {
    fn merge(
        &mut self,
        _repo: &dyn Repository,
        _wctx: &mut dyn WorkingDirectory,
        request: &MergeRequest<'_>,
    ) -> anyhow::Result<MergeOutcome> {
        self.calls.push(request.path.to_string());
        self.seen_labels = request.labels.to_vec();
        if self.fail {
            return Err(anyhow!("merge tool crashed on {}", request.path));
        }
        Ok(self
            .outcomes
            .get(request.path)
            .copied()
            .unwrap_or_else(MergeOutcome::clean))
    }
}

/// Tracker keeping the last update per path
#[derive(Default)]
pub struct FakeTracker {
    pub state: BTreeMap<String, FileUpdate>,
    pub copies: Vec<(String, String)>,
    pub entries: HashMap<String, TrackerEntry>,
}

impl WorkingCopyTracker for FakeTracker {
    fn update_file(&mut self, path: &str, update: FileUpdate) -> anyhow::Result<()> {
        self.state.insert(path.to_string(), update);
        Ok(())
    }

    fn copy(&mut self, source: &str, dest: &str) -> anyhow::Result<()> {
        self.copies.push((source.to_string(), dest.to_string()));
        Ok(())
    }

    fn get_entry(&self, path: &str) -> anyhow::Result<TrackerEntry> {
        Ok(self.entries.get(path).copied().unwrap_or_default())
    }
}
