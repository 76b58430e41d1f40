//! Verify merge state integrity

use crate::detached::DetachedRepository;
use anyhow::{anyhow, Result};
use mergestate_core::{BackupStore, MergeEntry, MergeState, MergeStateConfig};
use std::path::Path;

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub entries: usize,
    pub unresolved: Vec<String>,
    /// Paths whose local backup is gone
    pub missing_backups: Vec<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.missing_backups.is_empty()
    }
}

pub fn check(repo_path: &Path, config: &MergeStateConfig) -> Result<VerifyReport> {
    let ms = MergeState::read(repo_path, config, &DetachedRepository)?;
    let mut report = VerifyReport {
        entries: ms.files().count(),
        unresolved: ms.unresolved().map(str::to_string).collect(),
        ..Default::default()
    };
    for (path, entry) in ms.iter() {
        if let MergeEntry::File(conflict) = entry {
            if !conflict.local_key.is_null() && !ms.backups().contains(&conflict.local_key) {
                report.missing_backups.push(path.to_string());
            }
        }
    }
    Ok(report)
}

pub fn verify_state(repo_path: &Path, config: &MergeStateConfig, quiet: bool) -> Result<()> {
    let report = check(repo_path, config)?;

    if !quiet {
        println!("Verifying merge state: {}", repo_path.display());
        for path in &report.missing_backups {
            eprintln!("  ERROR: backup missing for '{}'", path);
        }
        println!();
    }

    println!("Verification:");
    println!("  Entries:          {}", report.entries);
    println!("  Unresolved:       {}", report.unresolved.len());
    println!("  Missing backups:  {}", report.missing_backups.len());

    if !report.is_healthy() {
        return Err(anyhow!(
            "verification failed: {} backups missing",
            report.missing_backups.len()
        ));
    }
    println!("\n✓ Merge state is healthy");
    Ok(())
}
