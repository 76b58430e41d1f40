//! Conflict registry and merge session lifecycle
//!
//! A [`MergeState`] tracks every file and path conflict of one interrupted
//! merge (merge, rebase, graft, update) together with the revisions being
//! merged. It is created empty, started with [`MergeState::start`], filled
//! by the merge planner, persisted with [`MergeState::commit`] and thrown
//! away with [`MergeState::reset`].
//!
//! The engine is generic over its [`BackupStore`]: disk-backed sessions
//! survive process restarts, in-memory sessions serve transient merges.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::action::{ActionArgs, ActionEntry, ActionKind, ActionTable, MERGE_RESULT_MESSAGE};
use crate::backup::{BackupStore, DiskBackupStore, MemoryBackupStore};
use crate::config::MergeStateConfig;
use crate::context::{FileFlags, FileVersion, Repository, Revision};
use crate::error::{MergeStateError, Result};
use crate::node::{BackupKey, Node};
use crate::record::{Record, RecordType, StateFiles};

/// Extras key holding the changeset of the ancestor file revision
pub const EXTRA_ANCESTOR_LINKNODE: &str = "ancestorlinknode";

/// Extras key set when an entry was merged in favor of the other side
pub const EXTRA_FILENODE_SOURCE: &str = "filenode-source";

/// On-disk tag of the deprecated "merged in favor of other" state
const LEGACY_MERGED_OTHER: &str = "o";

/// Resolution state of a conflict entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Unresolved,
    Resolved,
    UnresolvedPath,
    ResolvedPath,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "u",
            Self::Resolved => "r",
            Self::UnresolvedPath => "pu",
            Self::ResolvedPath => "pr",
        }
    }

    /// Parse an on-disk tag. The legacy driver-resolved tag `d` reads as
    /// resolved.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "u" => Some(Self::Unresolved),
            "r" | "d" => Some(Self::Resolved),
            "pu" => Some(Self::UnresolvedPath),
            "pr" => Some(Self::ResolvedPath),
            _ => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved | Self::UnresolvedPath)
    }

    pub fn is_path_state(&self) -> bool {
        matches!(self, Self::UnresolvedPath | Self::ResolvedPath)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the merge a path-conflicting file came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOrigin {
    Local,
    Other,
}

impl PathOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "l",
            Self::Other => "r",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "l" => Some(Self::Local),
            "r" => Some(Self::Other),
            _ => None,
        }
    }
}

/// A file whose content conflicts between the two sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub state: EntryState,
    /// Key of the local content backup; null when the file is absent locally
    pub local_key: BackupKey,
    pub local_path: String,
    pub ancestor_path: String,
    pub ancestor_node: Node,
    pub other_path: String,
    /// Other side's file revision; null when absent there, `None` when
    /// unknown (state rebuilt from a v1 file)
    pub other_node: Option<Node>,
    pub flags: FileFlags,
}

impl FileConflict {
    /// One side deleted the file while the other changed it
    pub fn is_change_delete(&self) -> bool {
        self.local_key.is_null() || self.other_node.as_ref().is_some_and(Node::is_null)
    }
}

/// A path that is a file on one side and a directory on the other
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConflict {
    pub state: EntryState,
    /// Where the conflicting file was moved aside to
    pub rename_target: String,
    pub origin: PathOrigin,
}

/// One tracked conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEntry {
    File(FileConflict),
    Path(PathConflict),
}

impl MergeEntry {
    pub fn state(&self) -> EntryState {
        match self {
            Self::File(file) => file.state,
            Self::Path(path) => path.state,
        }
    }

    fn set_state(&mut self, state: EntryState) {
        match self {
            Self::File(file) => file.state = state,
            Self::Path(path) => path.state = state,
        }
    }
}

/// Outcome of resolving one path in this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionResult {
    /// Merge tool return code; `None` when the sides turned out identical
    pub return_code: Option<i32>,
    pub action: Option<ActionKind>,
    pub args: ActionArgs,
}

/// Per-path extras: opaque key/value metadata that must survive round trips
pub type Extras = BTreeMap<String, String>;

/// Three-way merge state of individual files
#[derive(Debug)]
pub struct MergeState<B: BackupStore> {
    pub(crate) files: Option<StateFiles>,
    pub(crate) backups: B,
    pub(crate) entries: BTreeMap<String, MergeEntry>,
    pub(crate) extras: BTreeMap<String, Extras>,
    pub(crate) local: Option<Node>,
    pub(crate) other: Option<Node>,
    pub(crate) labels: Option<Vec<String>>,
    pub(crate) results: BTreeMap<String, ResolutionResult>,
    pub(crate) dirty: bool,
}

impl MergeState<DiskBackupStore> {
    /// A brand new session, removing any state left on disk
    pub fn clean(repo_path: &Path, config: &MergeStateConfig) -> Result<Self> {
        let mut ms = Self::open(repo_path, config)?;
        ms.reset()?;
        Ok(ms)
    }

    /// Load the session persisted under `repo_path`
    ///
    /// `repo` is consulted only when the legacy file is newer than the
    /// current one and the other revision must be inferred from the
    /// working copy's parents.
    pub fn read(repo_path: &Path, config: &MergeStateConfig, repo: &dyn Repository) -> Result<Self> {
        let mut ms = Self::open(repo_path, config)?;
        let records = match &ms.files {
            Some(files) => files.read(|| infer_other(repo))?,
            None => Vec::new(),
        };
        ms.apply_records(records)?;
        Ok(ms)
    }

    fn open(repo_path: &Path, config: &MergeStateConfig) -> Result<Self> {
        config.validate()?;
        let backups = DiskBackupStore::new(config.state_dir_path(repo_path));
        let mut ms = Self::with_backup_store(backups);
        ms.files = Some(StateFiles::new(repo_path, config));
        Ok(ms)
    }
}

impl MergeState<MemoryBackupStore> {
    /// A transient session; `commit` keeps nothing
    pub fn in_memory() -> Self {
        Self::with_backup_store(MemoryBackupStore::new())
    }
}

fn infer_other(repo: &dyn Repository) -> Result<Node> {
    let parents = repo.revision_parents(&Revision::WorkingCopy)?;
    match parents.last() {
        Some(node) => Ok(node.clone()),
        None => {
            warn!("working copy has no parents, recording null other revision");
            Ok(Node::null())
        }
    }
}

impl<B: BackupStore> MergeState<B> {
    /// A session without persisted state files
    pub fn with_backup_store(backups: B) -> Self {
        Self {
            files: None,
            backups,
            entries: BTreeMap::new(),
            extras: BTreeMap::new(),
            local: None,
            other: None,
            labels: None,
            results: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Begin tracking a merge of `other` into `local`
    ///
    /// Any previous session is discarded together with its backups.
    pub fn start(&mut self, local: Node, other: Node, labels: Option<Vec<String>>) -> Result<()> {
        debug!(local = %local, other = %other, "starting merge state");
        self.backups.clear()?;
        self.entries.clear();
        self.extras.clear();
        self.results.clear();
        self.local = Some(local);
        self.other = Some(other);
        self.labels = labels.map(|mut l| {
            l.truncate(3);
            l
        });
        self.dirty = true;
        Ok(())
    }

    pub fn local(&self) -> Result<&Node> {
        self.local
            .as_ref()
            .ok_or(MergeStateError::UninitializedAccess("local"))
    }

    pub fn other(&self) -> Result<&Node> {
        self.other
            .as_ref()
            .ok_or(MergeStateError::UninitializedAccess("other"))
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    /// Whether a merge appears to be in progress
    pub fn active(&self) -> bool {
        self.local.is_some() || !self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn backups(&self) -> &B {
        &self.backups
    }

    /// Register a conflicting file and back up its local content
    pub fn add(
        &mut self,
        local: &FileVersion,
        other: &FileVersion,
        ancestor: &FileVersion,
        dest: &str,
    ) -> Result<()> {
        self.local()?;
        self.other()?;
        let local_key = match &local.data {
            None => BackupKey::null(),
            Some(data) => {
                let key = BackupKey::for_path(dest);
                self.backups.put(&key, data.clone())?;
                key
            }
        };
        debug!(path = dest, key = %local_key, "adding file conflict");
        self.entries.insert(
            dest.to_string(),
            MergeEntry::File(FileConflict {
                state: EntryState::Unresolved,
                local_key,
                local_path: local.path.clone(),
                ancestor_path: ancestor.path.clone(),
                ancestor_node: ancestor.filenode.clone(),
                other_path: other.path.clone(),
                other_node: Some(other.filenode.clone()),
                flags: local.flags,
            }),
        );
        self.extras
            .entry(dest.to_string())
            .or_default()
            .insert(EXTRA_ANCESTOR_LINKNODE.to_string(), ancestor.changeset.to_hex());
        self.dirty = true;
        Ok(())
    }

    /// Register a path that is a file on one side and a directory on the other
    pub fn add_path_conflict(
        &mut self,
        path: &str,
        rename_target: &str,
        origin: PathOrigin,
    ) -> Result<()> {
        self.local()?;
        self.other()?;
        debug!(path, rename_target, origin = origin.as_str(), "adding path conflict");
        self.entries.insert(
            path.to_string(),
            MergeEntry::Path(PathConflict {
                state: EntryState::UnresolvedPath,
                rename_target: rename_target.to_string(),
                origin,
            }),
        );
        self.dirty = true;
        Ok(())
    }

    /// Merge commit-time metadata into a path's extras
    pub fn add_commit_info<I, K, V>(&mut self, path: &str, data: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut data = data.into_iter().peekable();
        if data.peek().is_none() {
            return;
        }
        let extras = self.extras.entry(path.to_string()).or_default();
        extras.extend(data.map(|(k, v)| (k.into(), v.into())));
        self.dirty = true;
    }

    /// Overwrite the state of an entry
    ///
    /// File conflicts only take file states and path conflicts only path
    /// states.
    pub fn mark(&mut self, path: &str, state: EntryState) -> Result<()> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| MergeStateError::UnknownPath(path.to_string()))?;
        let is_path_entry = matches!(entry, MergeEntry::Path(_));
        if state.is_path_state() != is_path_entry {
            return Err(MergeStateError::InvalidState {
                path: path.to_string(),
                state: state.as_str(),
            });
        }
        entry.set_state(state);
        self.dirty = true;
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn state(&self, path: &str) -> Option<EntryState> {
        self.entries.get(path).map(MergeEntry::state)
    }

    pub fn entry(&self, path: &str) -> Option<&MergeEntry> {
        self.entries.get(path)
    }

    /// Paths of all entries, sorted
    pub fn files(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MergeEntry)> + '_ {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    /// Paths still waiting for resolution, sorted
    pub fn unresolved(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state().is_unresolved())
            .map(|(path, _)| path.as_str())
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    pub fn extras(&self, path: &str) -> Option<&Extras> {
        self.extras.get(path)
    }

    pub fn all_extras(&self) -> &BTreeMap<String, Extras> {
        &self.extras
    }

    /// Whether `path` was recorded with the deprecated "merged in favor of
    /// other" state
    pub fn merged_in_favor_of_other(&self, path: &str) -> bool {
        self.extras
            .get(path)
            .and_then(|extras| extras.get(EXTRA_FILENODE_SOURCE))
            .is_some_and(|source| source == "other")
    }

    /// Results of the resolutions run in this process
    pub fn results(&self) -> &BTreeMap<String, ResolutionResult> {
        &self.results
    }

    /// `(updated, merged, removed)` counts over this session's resolutions
    pub fn counts(&self) -> (usize, usize, usize) {
        let (mut updated, mut merged, mut removed) = (0, 0, 0);
        for result in self.results.values() {
            match result.return_code {
                None => updated += 1,
                Some(0) if result.action == Some(ActionKind::Remove) => removed += 1,
                Some(0) => merged += 1,
                Some(_) => {}
            }
        }
        (updated, merged, removed)
    }

    /// Tracker actions implied by this session's resolutions
    pub fn actions(&self) -> ActionTable {
        self.results
            .iter()
            .filter_map(|(path, result)| {
                result.action.map(|kind| {
                    (
                        kind,
                        ActionEntry::new(path.clone(), result.args.clone(), MERGE_RESULT_MESSAGE),
                    )
                })
            })
            .collect()
    }

    /// Write the state to disk if anything changed since the last commit
    pub fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(files) = &self.files {
            let records = self.make_records()?;
            files.write(&records)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Discard the session, its backups and any persisted state
    pub fn reset(&mut self) -> Result<()> {
        self.backups.clear()?;
        if let Some(files) = &self.files {
            remove_if_exists(files.v1_path())?;
            remove_if_exists(files.v2_path())?;
        }
        self.entries.clear();
        self.extras.clear();
        self.results.clear();
        self.local = None;
        self.other = None;
        self.labels = None;
        self.dirty = false;
        info!("merge state reset");
        Ok(())
    }

    /// Serialize the session into records
    pub fn make_records(&self) -> Result<Vec<Record>> {
        let mut records = vec![
            Record::new(RecordType::Local, self.local()?.to_hex()),
            Record::new(RecordType::Other, self.other()?.to_hex()),
        ];
        for (path, entry) in &self.entries {
            let record = match entry {
                MergeEntry::Path(pc) => Record::from_fields(
                    RecordType::PathConflict,
                    [
                        path.as_str(),
                        pc.state.as_str(),
                        pc.rename_target.as_str(),
                        pc.origin.as_str(),
                    ],
                ),
                MergeEntry::File(fc) => {
                    let kind = if fc.is_change_delete() {
                        RecordType::ChangeDelete
                    } else {
                        RecordType::Merged
                    };
                    let ancestor_node = fc.ancestor_node.to_hex();
                    let other_node = fc.other_node.as_ref().map(Node::to_hex).unwrap_or_default();
                    Record::from_fields(
                        kind,
                        [
                            path.as_str(),
                            fc.state.as_str(),
                            fc.local_key.as_str(),
                            fc.local_path.as_str(),
                            fc.ancestor_path.as_str(),
                            ancestor_node.as_str(),
                            fc.other_path.as_str(),
                            other_node.as_str(),
                            fc.flags.as_str(),
                        ],
                    )
                }
            };
            records.push(record);
        }
        for (path, extras) in &self.extras {
            if extras.is_empty() {
                continue;
            }
            let mut fields = vec![path.as_str()];
            for (key, value) in extras {
                fields.push(key);
                fields.push(value);
            }
            records.push(Record::from_fields(RecordType::FileValues, fields));
        }
        if let Some(labels) = &self.labels {
            records.push(Record::from_fields(RecordType::Labels, labels));
        }
        Ok(records)
    }

    fn state_file(&self) -> PathBuf {
        self.files
            .as_ref()
            .map(|f| f.v2_path().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("<memory>"))
    }

    /// Rebuild the session from decoded records
    pub fn apply_records(&mut self, records: Vec<Record>) -> Result<()> {
        let file = self.state_file();
        let mut unsupported = BTreeSet::new();
        for record in records {
            match record.kind {
                RecordType::Local => self.local = Some(parse_node(&record.data)?),
                RecordType::Other => self.other = Some(parse_node(&record.data)?),
                RecordType::LegacyDriverState => {}
                RecordType::Merged
                | RecordType::ChangeDelete
                | RecordType::PathConflict
                | RecordType::LegacyDriverMerge
                | RecordType::LegacyResolvedOther => {
                    let fields = text_fields(&record, &file)?;
                    if fields.len() < 2 {
                        return Err(MergeStateError::corrupt(
                            &file,
                            format!("{} record has {} fields", record.kind.tag_str(), fields.len()),
                        ));
                    }
                    if fields[1] == LEGACY_MERGED_OTHER {
                        self.extras
                            .entry(fields[0].clone())
                            .or_default()
                            .insert(EXTRA_FILENODE_SOURCE.to_string(), "other".to_string());
                        continue;
                    }
                    let entry = parse_entry(&fields, &file)?;
                    self.entries.insert(fields[0].clone(), entry);
                }
                RecordType::FileValues => {
                    let (path, extras) = parse_extras(&record, &file)?;
                    self.extras.insert(path, extras);
                }
                RecordType::Labels => {
                    let labels = text_fields(&record, &file)?
                        .into_iter()
                        .take(3)
                        .filter(|l| !l.is_empty())
                        .collect();
                    self.labels = Some(labels);
                }
                kind if kind.is_mandatory() => {
                    unsupported.insert(kind.tag_str());
                }
                _ => {}
            }
        }
        if !unsupported.is_empty() {
            return Err(MergeStateError::UnsupportedRecords(
                unsupported.into_iter().collect(),
            ));
        }
        debug!(entries = self.entries.len(), "loaded merge state");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn parse_node(raw: &[u8]) -> Result<Node> {
    let text = String::from_utf8_lossy(raw);
    Node::from_hex(&text).map_err(|_| MergeStateError::InvalidNode(text.into_owned()))
}

fn text_fields(record: &Record, file: &Path) -> Result<Vec<String>> {
    record
        .fields()
        .into_iter()
        .map(|field| {
            String::from_utf8(field.to_vec()).map_err(|_| {
                MergeStateError::corrupt(
                    file,
                    format!("{} record is not valid UTF-8", record.kind.tag_str()),
                )
            })
        })
        .collect()
}

fn parse_entry(fields: &[String], file: &Path) -> Result<MergeEntry> {
    let state = EntryState::parse(&fields[1]).ok_or_else(|| {
        MergeStateError::corrupt(file, format!("unknown state {:?} for {}", fields[1], fields[0]))
    })?;

    if state.is_path_state() {
        let [_, _, rename_target, origin] = fields else {
            return Err(MergeStateError::corrupt(
                file,
                format!("path conflict {} has {} fields", fields[0], fields.len()),
            ));
        };
        let origin = PathOrigin::parse(origin).ok_or_else(|| {
            MergeStateError::corrupt(file, format!("unknown origin {:?} for {}", origin, fields[0]))
        })?;
        return Ok(MergeEntry::Path(PathConflict {
            state,
            rename_target: rename_target.clone(),
            origin,
        }));
    }

    let [_, _, local_key, local_path, ancestor_path, ancestor_node, other_path, other_node, flags] =
        fields
    else {
        return Err(MergeStateError::corrupt(
            file,
            format!("file conflict {} has {} fields", fields[0], fields.len()),
        ));
    };
    let other_node = if other_node.is_empty() {
        None
    } else {
        Some(parse_node(other_node.as_bytes())?)
    };
    let flags = FileFlags::parse(flags).ok_or_else(|| {
        MergeStateError::corrupt(file, format!("unknown flags {:?} for {}", flags, fields[0]))
    })?;
    Ok(MergeEntry::File(FileConflict {
        state,
        local_key: BackupKey::from_raw(local_key.clone()),
        local_path: local_path.clone(),
        ancestor_path: ancestor_path.clone(),
        ancestor_node: parse_node(ancestor_node.as_bytes())?,
        other_path: other_path.clone(),
        other_node,
        flags,
    }))
}

fn parse_extras(record: &Record, file: &Path) -> Result<(String, Extras)> {
    let mut fields = text_fields(record, file)?.into_iter();
    let path = fields.next().unwrap_or_default();
    let rest: Vec<String> = fields.collect();
    // "path\0" with nothing after it carries no extras
    if rest.len() == 1 && rest[0].is_empty() {
        return Ok((path, Extras::new()));
    }
    if rest.len() % 2 != 0 {
        return Err(MergeStateError::corrupt(
            file,
            format!("extras for {} have an odd number of fields", path),
        ));
    }
    let extras = rest
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok((path, extras))
}
