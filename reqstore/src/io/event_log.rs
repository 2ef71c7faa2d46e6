//! Persistence of the changelog and its snapshots.
//!
//! ## Layout
//! - `changelog.yaml`: genesis, every event, snapshot bookkeeping, indexes.
//! - `snapshots/<taken_at>-<event_count>.yaml`: materialized state after the
//!   first `event_count` events.
//!
//! Reads take a state directory so the same code serves the live directory
//! and a transaction's staged copy.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::codec::{decode_yaml, encode_yaml, read_yaml};
use super::paths::{CHANGELOG_FILE, SNAPSHOTS_DIR, snapshot_relative_path};
use super::transaction::{Transaction, read_committed};
use crate::core::changelog::{Changelog, FORMAT_VERSION, Snapshot, reconstruct};
use crate::core::events::ChangelogEvent;
use crate::core::types::Specification;
use crate::error::{Result, StoreError};

/// Default number of events between snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: usize = 100;

/// Outcome of [`EventLog::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendSummary {
    pub positions: Vec<usize>,
    /// Snapshot files staged, relative to the state directory.
    pub snapshot_files: Vec<PathBuf>,
    /// Specification after the appended events.
    pub state: Specification,
    pub changelog: Changelog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLog {
    snapshot_interval: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

impl EventLog {
    pub fn new(snapshot_interval: usize) -> Self {
        Self {
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Current state of `state_dir`: latest snapshot plus the events after it.
    ///
    /// Safe to call while another process commits: a read that spans a swap
    /// is retried.
    pub fn reconstruct(&self, state_dir: &Path) -> Result<Specification> {
        read_committed(state_dir, |dir| {
            // Snapshot first: an older snapshot is always a prefix of a newer log.
            let snapshot = latest_snapshot(dir)?;
            let changelog = load_changelog(dir)?;
            reconstruct(&changelog.genesis, snapshot.as_ref(), &changelog.events)
        })
    }

    /// Validate and stage `events` in `tx`.
    ///
    /// Writes any snapshots that fell due and the updated `changelog.yaml`.
    /// Nothing is staged if any event is invalid.
    pub fn append(
        &self,
        tx: &mut Transaction,
        events: Vec<ChangelogEvent>,
        now: DateTime<Utc>,
    ) -> Result<AppendSummary> {
        let staged = tx.staged_path().to_path_buf();
        let mut changelog = load_changelog(&staged)?;
        let snapshot = latest_snapshot(&staged)?;
        let current = reconstruct(&changelog.genesis, snapshot.as_ref(), &changelog.events)?;

        let outcome = changelog.append(current, events, self.snapshot_interval, now)?;

        let mut staged_snapshots = Vec::with_capacity(outcome.snapshots.len());
        for snapshot in &outcome.snapshots {
            let relative = snapshot_relative_path(&snapshot_file_name(snapshot));
            staged_snapshots.push((relative, encode_yaml(snapshot, "snapshot")?));
        }
        let changelog_yaml = encode_yaml(&changelog, "changelog")?;

        let mut snapshot_files = Vec::with_capacity(staged_snapshots.len());
        for (relative, yaml) in staged_snapshots {
            tx.write_file(&relative, yaml.as_bytes())?;
            debug!(path = %relative.display(), "staged snapshot");
            snapshot_files.push(relative);
        }
        tx.write_file(Path::new(CHANGELOG_FILE), changelog_yaml.as_bytes())?;

        Ok(AppendSummary {
            positions: outcome.positions,
            snapshot_files,
            state: outcome.state,
            changelog,
        })
    }
}

/// Load `changelog.yaml`, replacing stored indexes with a rebuild if they drifted.
pub fn load_changelog(state_dir: &Path) -> Result<Changelog> {
    let path = state_dir.join(CHANGELOG_FILE);
    let mut changelog: Changelog = read_yaml(&path)?;
    if changelog.version != FORMAT_VERSION {
        return Err(StoreError::Decode {
            path,
            reason: format!(
                "unsupported changelog version '{}' (expected {})",
                changelog.version, FORMAT_VERSION
            ),
        });
    }
    if changelog.reindex() {
        warn!(path = %path.display(), "stored changelog indexes were stale; rebuilt from events");
    }
    Ok(changelog)
}

/// `<taken_at>-<event_count>.yaml`
pub fn snapshot_file_name(snapshot: &Snapshot) -> String {
    format!(
        "{}-{:08}.yaml",
        snapshot.taken_at.format("%Y%m%dT%H%M%S%.3fZ"),
        snapshot.event_count_at_snapshot
    )
}

/// Event count encoded in a snapshot file name.
fn snapshot_event_count(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(".yaml")?;
    let (_, count) = stem.rsplit_once('-')?;
    count.parse().ok()
}

/// Snapshot files in `state_dir`, ordered by the event count they cover.
pub fn list_snapshots(state_dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let dir = state_dir.join(SNAPSHOTS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::state_io("list", &dir, err)),
    };

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::state_io("list", &dir, err))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match snapshot_event_count(name) {
            Some(count) => snapshots.push((count, entry.path())),
            None => debug!(file = name, "ignoring unrecognized file in snapshots directory"),
        }
    }
    snapshots.sort();
    Ok(snapshots)
}

/// The snapshot covering the most events, if any.
pub fn latest_snapshot(state_dir: &Path) -> Result<Option<Snapshot>> {
    let Some((count, path)) = list_snapshots(state_dir)?.pop() else {
        return Ok(None);
    };
    let bytes = fs::read(&path).map_err(|err| StoreError::state_io("read", &path, err))?;
    let snapshot: Snapshot = decode_yaml(&bytes, &path)?;
    if snapshot.event_count_at_snapshot != count {
        return Err(StoreError::ReconstructionInconsistency {
            reason: format!(
                "snapshot {} records {} events but is named for {}",
                path.display(),
                snapshot.event_count_at_snapshot,
                count
            ),
        });
    }
    Ok(Some(snapshot))
}
