//! Canonical locations inside `<project>/.state/`.

use std::path::{Path, PathBuf};

/// Name of the live state directory under the project root.
pub const STATE_DIR: &str = ".state";
pub const SPECIFICATION_FILE: &str = "specification.yaml";
pub const CHANGELOG_FILE: &str = "changelog.yaml";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const CONFIG_FILE: &str = "config.toml";
pub const LOCK_FILE: &str = ".lock";
pub const LOCK_GUARD_FILE: &str = ".lock.guard";

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub specification_path: PathBuf,
    pub changelog_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            specification_path: state_dir.join(SPECIFICATION_FILE),
            changelog_path: state_dir.join(CHANGELOG_FILE),
            snapshots_dir: state_dir.join(SNAPSHOTS_DIR),
            config_path: state_dir.join(CONFIG_FILE),
            lock_path: state_dir.join(LOCK_FILE),
        }
    }

    /// True once `init` has laid down a changelog.
    pub fn is_initialized(&self) -> bool {
        self.changelog_path.is_file()
    }
}

/// Path of a snapshot file relative to the state directory.
pub fn snapshot_relative_path(file_name: &str) -> PathBuf {
    Path::new(SNAPSHOTS_DIR).join(file_name)
}
