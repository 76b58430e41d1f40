//! Revision store stand-in for offline inspection

use anyhow::anyhow;
use mergestate_core::{FileVersion, Node, Repository, Revision};

/// Serves no revisions
///
/// State files that need the working copy's parents fall back to a null
/// other revision.
pub(crate) struct DetachedRepository;

impl Repository for DetachedRepository {
    fn get_file_content(&self, path: &str, filenode: &Node) -> anyhow::Result<FileVersion> {
        Err(anyhow!(
            "no revision store available to read {} at {}",
            path,
            filenode
        ))
    }

    fn get_file_at(&self, _changeset: &Node, _path: &str) -> anyhow::Result<Option<FileVersion>> {
        Ok(None)
    }

    fn revision_parents(&self, _rev: &Revision) -> anyhow::Result<Vec<Node>> {
        Ok(Vec::new())
    }
}
