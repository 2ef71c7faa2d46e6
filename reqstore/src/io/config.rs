//! Store configuration stored under `.state/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::event_log::DEFAULT_SNAPSHOT_INTERVAL;
use super::lock::{DEFAULT_STALE_AFTER, LockOptions};

/// Store configuration (TOML).
///
/// Optional and human-edited. Missing fields default to the values every
/// project starts with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Age in seconds after which a recorded lock holder is considered stale.
    pub stale_lock_secs: u64,

    /// Events between snapshots.
    pub snapshot_interval: usize,

    /// Staging/backup directories older than this are removed after acquiring the lock.
    pub orphan_max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stale_lock_secs: DEFAULT_STALE_AFTER.as_secs(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            orphan_max_age_secs: 60 * 60,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stale_lock_secs == 0 {
            return Err(anyhow!("stale_lock_secs must be > 0"));
        }
        if self.snapshot_interval == 0 {
            return Err(anyhow!("snapshot_interval must be > 0"));
        }
        Ok(())
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(self.stale_lock_secs),
        }
    }

    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.orphan_max_age_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StoreConfig::default()`.
pub fn load_config(path: &Path) -> Result<StoreConfig> {
    if !path.exists() {
        return Ok(StoreConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StoreConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StoreConfig::default());
        assert_eq!(cfg.stale_lock_secs, 1800);
        assert_eq!(cfg.snapshot_interval, 100);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "snapshot_interval = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.snapshot_interval, 5);
        assert_eq!(cfg.stale_lock_secs, 1800);
        assert_eq!(cfg.lock_options().stale_after, Duration::from_secs(1800));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "snapshot_interval = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("snapshot_interval"));
    }
}
