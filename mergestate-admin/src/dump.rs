//! Print the persisted merge state

use crate::detached::DetachedRepository;
use anyhow::{Context, Result};
use mergestate_core::record::v1_v2_match;
use mergestate_core::{
    BackupStore, MergeEntry, MergeState, MergeStateConfig, PathOrigin, RecordView, StateFiles,
};
use serde::Serialize;
use std::path::Path;

/// Raw contents of both state files
#[derive(Debug, Serialize)]
pub struct DumpReport {
    pub state_dir: String,
    /// False when a v1-only writer ran after the v2 file was written
    pub v1_matches: bool,
    pub v1: Vec<RecordView>,
    pub v2: Vec<RecordView>,
}

impl DumpReport {
    pub fn is_empty(&self) -> bool {
        self.v1.is_empty() && self.v2.is_empty()
    }
}

pub fn collect(repo_path: &Path, config: &MergeStateConfig) -> Result<DumpReport> {
    let files = StateFiles::new(repo_path, config);
    let v1 = files
        .read_v1()
        .with_context(|| format!("failed to read {}", files.v1_path().display()))?;
    let v2 = files
        .read_v2()
        .with_context(|| format!("failed to read {}", files.v2_path().display()))?;
    Ok(DumpReport {
        state_dir: config.state_dir_path(repo_path).display().to_string(),
        v1_matches: v1_v2_match(&v1, &v2),
        v1: v1.iter().map(RecordView::from).collect(),
        v2: v2.iter().map(RecordView::from).collect(),
    })
}

/// Human-readable lines for a decoded merge state
pub fn summarize<B: BackupStore>(ms: &MergeState<B>) -> Result<Vec<String>> {
    let mut lines = vec![
        format!("  local:  {}", ms.local()?),
        format!("  other:  {}", ms.other()?),
    ];
    if let Some(labels) = ms.labels() {
        lines.push(format!("  labels: {}", labels.join(", ")));
    }

    lines.push("Entries:".to_string());
    for (path, entry) in ms.iter() {
        lines.push(format!("  {} [{}]", path, entry.state().as_str()));
        match entry {
            MergeEntry::File(file) => {
                let local = if file.local_key.is_null() {
                    "absent".to_string()
                } else {
                    format!("{} (backup {})", file.local_path, file.local_key)
                };
                let other = match &file.other_node {
                    None => format!("{}@unknown", file.other_path),
                    Some(node) if node.is_null() => "absent".to_string(),
                    Some(node) => format!("{}@{}", file.other_path, node),
                };
                lines.push(format!("    local:    {}", local));
                lines.push(format!("    ancestor: {}@{}", file.ancestor_path, file.ancestor_node));
                lines.push(format!("    other:    {}", other));
                if !file.flags.as_str().is_empty() {
                    lines.push(format!("    flags:    {}", file.flags.as_str()));
                }
            }
            MergeEntry::Path(conflict) => {
                let side = match conflict.origin {
                    PathOrigin::Local => "local",
                    PathOrigin::Other => "other",
                };
                lines.push(format!("    moved to {} (from {})", conflict.rename_target, side));
            }
        }
    }

    if !ms.all_extras().is_empty() {
        lines.push("Extras:".to_string());
        for (path, extras) in ms.all_extras() {
            for (key, value) in extras {
                lines.push(format!("  {}: {}={}", path, key, value));
            }
        }
    }
    Ok(lines)
}

pub fn dump_state(repo_path: &Path, config: &MergeStateConfig, json: bool) -> Result<()> {
    let report = collect(repo_path, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Merge state: {}", report.state_dir);
    if report.is_empty() {
        println!("  No merge in progress");
        return Ok(());
    }
    println!(
        "  v1 agrees with v2: {}",
        if report.v1_matches { "yes" } else { "no (v1 is newer)" }
    );

    let ms = MergeState::read(repo_path, config, &DetachedRepository)
        .with_context(|| format!("failed to decode merge state in {}", report.state_dir))?;
    for line in summarize(&ms)? {
        println!("{}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergestate_core::{EntryState, FileFlags, FileVersion, Node};
    use tempfile::TempDir;

    #[test]
    fn test_collect_without_state() {
        let temp = TempDir::new().unwrap();
        let report = collect(temp.path(), &MergeStateConfig::default()).unwrap();
        assert!(report.is_empty());
        assert!(report.v1_matches);
    }

    #[test]
    fn test_collect_committed_state() {
        let temp = TempDir::new().unwrap();
        let config = MergeStateConfig::default();
        let mut ms = MergeState::clean(temp.path(), &config).unwrap();
        ms.start(
            Node::from_hex("aaaa").unwrap(),
            Node::from_hex("bbbb").unwrap(),
            Some(vec!["local".into(), "other".into()]),
        )
        .unwrap();
        ms.commit().unwrap();

        let report = collect(temp.path(), &config).unwrap();
        assert!(report.v1_matches);
        let kinds: Vec<_> = report.v2.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["L", "O", "l"]);
        assert_eq!(report.v1.len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["v2"][2]["mandatory"], false);
        assert_eq!(json["v2"][2]["fields"][1], "other");
    }

    #[test]
    fn test_summarize_decoded_state() {
        let temp = TempDir::new().unwrap();
        let config = MergeStateConfig::default();
        let node = |hex: &str| Node::from_hex(hex).unwrap();
        let mut ms = MergeState::clean(temp.path(), &config).unwrap();
        ms.start(
            node("aaaa"),
            node("bbbb"),
            Some(vec!["working copy".into(), "merge rev".into()]),
        )
        .unwrap();
        ms.add(
            &FileVersion::new("run.sh", node("01"), node("aaaa"), FileFlags::Executable, "local"),
            &FileVersion::new("run.sh", node("02"), node("bbbb"), FileFlags::None, "other"),
            &FileVersion::new("run.sh", node("03"), node("cccc"), FileFlags::None, "base"),
            "run.sh",
        )
        .unwrap();
        ms.add_path_conflict("dir", "dir~aaaa", PathOrigin::Local)
            .unwrap();
        ms.mark("run.sh", EntryState::Resolved).unwrap();
        ms.commit().unwrap();

        let loaded = MergeState::read(temp.path(), &config, &DetachedRepository).unwrap();
        let lines = summarize(&loaded).unwrap();

        assert_eq!(lines[0], format!("  local:  {}", node("aaaa")));
        assert_eq!(lines[1], format!("  other:  {}", node("bbbb")));
        assert_eq!(lines[2], "  labels: working copy, merge rev");
        assert!(lines.contains(&"  dir [pu]".to_string()));
        assert!(lines.contains(&"    moved to dir~aaaa (from local)".to_string()));
        assert!(lines.contains(&"  run.sh [r]".to_string()));
        assert!(lines.contains(&format!("    other:    run.sh@{}", node("02"))));
        assert!(lines.contains(&"    flags:    x".to_string()));
        assert!(lines.contains(&format!("  run.sh: ancestorlinknode={}", node("cccc"))));
    }
}
