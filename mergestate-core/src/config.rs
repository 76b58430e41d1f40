//! Merge-state configuration stored at `repo/mergestate-config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MergeStateError, Result};

const CONFIG_FILE: &str = "mergestate-config.json";

/// Largest record a v2 state file may declare (256 MB).
pub const DEFAULT_MAX_RECORD_SIZE: u32 = 256 * 1024 * 1024;

/// Names and limits of the persisted merge state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStateConfig {
    /// Directory (relative to the repository metadata root) holding state
    /// files and backups.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Legacy line-oriented state file.
    #[serde(default = "default_v1_file")]
    pub v1_file: String,
    /// Length-prefixed record state file.
    #[serde(default = "default_v2_file")]
    pub v2_file: String,
    /// Records declaring a longer payload are treated as corruption.
    #[serde(default = "default_max_record_size")]
    pub max_record_size: u32,
}

fn default_state_dir() -> String {
    "merge".to_string()
}

fn default_v1_file() -> String {
    "state".to_string()
}

fn default_v2_file() -> String {
    "state2".to_string()
}

fn default_max_record_size() -> u32 {
    DEFAULT_MAX_RECORD_SIZE
}

impl Default for MergeStateConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            v1_file: default_v1_file(),
            v2_file: default_v2_file(),
            max_record_size: default_max_record_size(),
        }
    }
}

impl MergeStateConfig {
    /// Load config from a repository metadata root, falling back to defaults.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = Self::config_file_path(repo_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: MergeStateConfig = serde_json::from_str(&data).map_err(|e| {
            MergeStateError::Config(format!("{}: {}", config_path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a repository metadata root.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        self.validate()?;
        let config_path = Self::config_file_path(repo_path);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| MergeStateError::Config(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("state_dir", &self.state_dir),
            ("v1_file", &self.v1_file),
            ("v2_file", &self.v2_file),
        ] {
            if value.is_empty() {
                return Err(MergeStateError::Config(format!("{} is empty", field)));
            }
            if value.contains('/') || value.contains('\\') {
                return Err(MergeStateError::Config(format!(
                    "{} must be a single path component, got {:?}",
                    field, value
                )));
            }
        }
        if self.v1_file == self.v2_file {
            return Err(MergeStateError::Config(
                "v1_file and v2_file must differ".to_string(),
            ));
        }
        if self.max_record_size == 0 {
            return Err(MergeStateError::Config(
                "max_record_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the state files and disk backups.
    pub fn state_dir_path(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(&self.state_dir)
    }

    pub fn v1_path(&self, repo_path: &Path) -> PathBuf {
        self.state_dir_path(repo_path).join(&self.v1_file)
    }

    pub fn v2_path(&self, repo_path: &Path) -> PathBuf {
        self.state_dir_path(repo_path).join(&self.v2_file)
    }

    fn config_file_path(repo_path: &Path) -> PathBuf {
        repo_path.join(CONFIG_FILE)
    }
}
