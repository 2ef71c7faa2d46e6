//! Project repository: the single entry point front ends use.
//!
//! Composes the lock, transactions and the event log. Reads are allowed at
//! any time; mutations require the project lock held through this handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::changelog::Changelog;
use crate::core::events::ChangelogEvent;
use crate::core::invariants::validate_specification;
use crate::core::types::Specification;
use crate::error::{Result, StoreError};
use crate::io::codec::encode_yaml;
use crate::io::config::StoreConfig;
use crate::io::event_log::{EventLog, load_changelog};
use crate::io::liveness::{ProcessLiveness, SystemLiveness};
use crate::io::lock::{FileLock, InterfaceTag, LockMetadata, LockStatus, force_unlock, lock_status};
use crate::io::paths::{SPECIFICATION_FILE, StatePaths};
use crate::io::transaction::{
    CleanupReport, Transaction, cleanup, read_committed, recover_interrupted_commit,
};

/// Output of the external requirement producer: the document it expects and
/// the events that lead there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Expected result. When absent the replayed state is taken as-is.
    #[serde(default)]
    pub specification: Option<Specification>,
    #[serde(default)]
    pub events: Vec<ChangelogEvent>,
}

/// What a commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Changelog positions assigned to the new events.
    pub positions: Vec<usize>,
    /// Snapshot files written, as live paths.
    pub snapshots: Vec<PathBuf>,
    /// Changelog length after the commit.
    pub total_events: usize,
    pub version: String,
}

pub struct Repository {
    paths: StatePaths,
    config: StoreConfig,
    event_log: EventLog,
    liveness: Arc<dyn ProcessLiveness>,
    lock: Option<FileLock>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.paths.root)
            .field("config", &self.config)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Open an initialized project rooted at `root`.
    pub fn open(root: &Path, config: StoreConfig) -> Result<Self> {
        Self::open_with_liveness(root, config, Arc::new(SystemLiveness))
    }

    pub fn open_with_liveness(
        root: &Path,
        config: StoreConfig,
        liveness: Arc<dyn ProcessLiveness>,
    ) -> Result<Self> {
        let paths = StatePaths::new(root);
        recover_interrupted_commit(&paths.state_dir)?;
        let initialized = read_committed(&paths.state_dir, |_| Ok(paths.is_initialized()))?;
        if !initialized {
            return Err(StoreError::NotInitialized {
                path: paths.state_dir,
            });
        }
        Ok(Self {
            event_log: EventLog::new(config.snapshot_interval),
            paths,
            config,
            liveness,
            lock: None,
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current specification, reconstructed from snapshot plus tail.
    pub fn read_state(&self) -> Result<Specification> {
        let state = self.event_log.reconstruct(&self.paths.state_dir)?;
        let errors = validate_specification(&state);
        if !errors.is_empty() {
            return Err(StoreError::ReconstructionInconsistency {
                reason: errors.join("; "),
            });
        }
        Ok(state)
    }

    pub fn read_changelog(&self) -> Result<Changelog> {
        read_committed(&self.paths.state_dir, load_changelog)
    }

    /// Take the project lock for this handle. A no-op if already held.
    ///
    /// Orphaned transaction directories past the configured age are removed
    /// once the lock is ours.
    pub fn acquire_lock(&mut self, interface: InterfaceTag) -> Result<LockMetadata> {
        if let Some(lock) = self.lock.as_ref().filter(|lock| lock.verify().is_ok()) {
            return Ok(lock.metadata().clone());
        }
        let lock = FileLock::acquire(
            &self.paths.lock_path,
            interface,
            &self.config.lock_options(),
            self.liveness.as_ref(),
        )?;
        let metadata = lock.metadata().clone();
        self.lock = Some(lock);
        match cleanup(&self.paths.state_dir, self.config.orphan_max_age()) {
            Ok(report) if !report.removed.is_empty() => {
                info!(removed = report.removed.len(), "cleaned up orphaned transactions");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "orphan cleanup failed"),
        }
        Ok(metadata)
    }

    pub fn release_lock(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        }
    }

    /// True if this handle holds the lock and nobody has taken it over.
    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(|lock| lock.verify().is_ok())
    }

    pub fn lock_status(&self) -> Result<Option<LockStatus>> {
        lock_status(
            &self.paths.lock_path,
            &self.config.lock_options(),
            self.liveness.as_ref(),
        )
    }

    /// Delete the project lock regardless of who holds it.
    pub fn force_unlock(root: &Path) -> Result<bool> {
        force_unlock(&StatePaths::new(root).lock_path)
    }

    /// Append `events` and store `specification`, atomically.
    ///
    /// `specification` must equal the state the events produce. Fails with
    /// `LockHeld` if the lock was taken over since it was acquired.
    ///
    /// # Panics
    /// If this handle never acquired the project lock.
    pub fn commit_delta(
        &mut self,
        specification: &Specification,
        events: Vec<ChangelogEvent>,
    ) -> Result<CommitSummary> {
        self.held_lock("commit_delta").verify()?;
        let tx = Transaction::begin(&self.paths.state_dir)?;
        self.commit_in(tx, Some(specification), events)
    }

    /// Commit a producer delta; an absent specification means "whatever the
    /// events produce".
    ///
    /// # Panics
    /// If this handle never acquired the project lock.
    pub fn apply_delta(&mut self, delta: Delta) -> Result<CommitSummary> {
        self.held_lock("apply_delta").verify()?;
        let tx = Transaction::begin(&self.paths.state_dir)?;
        self.commit_in(tx, delta.specification.as_ref(), delta.events)
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn commit_delta_with_faults(
        &mut self,
        specification: &Specification,
        events: Vec<ChangelogEvent>,
        faults: crate::io::transaction::FaultPlan,
    ) -> Result<CommitSummary> {
        self.held_lock("commit_delta").verify()?;
        let tx = Transaction::begin_with_faults(&self.paths.state_dir, faults)?;
        self.commit_in(tx, Some(specification), events)
    }

    /// Remove orphaned transaction directories regardless of age.
    ///
    /// # Panics
    /// If this handle never acquired the project lock.
    pub fn cleanup(&mut self) -> Result<CleanupReport> {
        self.held_lock("cleanup")
            .while_verified(|| cleanup(&self.paths.state_dir, std::time::Duration::ZERO))
    }

    fn commit_in(
        &self,
        mut tx: Transaction,
        expected: Option<&Specification>,
        events: Vec<ChangelogEvent>,
    ) -> Result<CommitSummary> {
        let last_event_id = events.last().map(|event| event.event_id.clone());
        let appended = self.event_log.append(&mut tx, events, Utc::now())?;

        if let Some(expected) = expected.filter(|expected| **expected != appended.state) {
            return Err(StoreError::EventValidation {
                position: appended.changelog.len().saturating_sub(1),
                event_id: last_event_id.unwrap_or_default(),
                reason: format!(
                    "submitted specification does not match the replayed state ({})",
                    describe_mismatch(&appended.state, expected)
                ),
            });
        }

        let yaml = encode_yaml(&appended.state, "specification")?;
        tx.write_file(Path::new(SPECIFICATION_FILE), yaml.as_bytes())?;
        // Holding the guard keeps a takeover from landing mid-swap.
        self.held_lock("commit").while_verified(|| tx.commit())?;

        let summary = CommitSummary {
            snapshots: appended
                .snapshot_files
                .iter()
                .map(|relative| self.paths.state_dir.join(relative))
                .collect(),
            positions: appended.positions,
            total_events: appended.changelog.len(),
            version: appended.state.metadata.version,
        };
        info!(
            events = summary.positions.len(),
            total = summary.total_events,
            snapshots = summary.snapshots.len(),
            "delta committed"
        );
        Ok(summary)
    }

    fn held_lock(&self, op: &str) -> &FileLock {
        match self.lock.as_ref().filter(|lock| lock.is_held()) {
            Some(lock) => lock,
            None => panic!("{op} requires the project lock; call acquire_lock first"),
        }
    }
}

fn describe_mismatch(replayed: &Specification, submitted: &Specification) -> String {
    let mut parts = Vec::new();
    if replayed.metadata != submitted.metadata {
        parts.push("metadata differs".to_string());
    }
    if replayed.categories != submitted.categories {
        parts.push("categories differ".to_string());
    }
    if replayed.requirements.len() != submitted.requirements.len() {
        parts.push(format!(
            "{} requirements expected, {} submitted",
            replayed.requirements.len(),
            submitted.requirements.len()
        ));
    } else if let Some(req) = replayed
        .requirements
        .iter()
        .zip(&submitted.requirements)
        .find(|(a, b)| a != b)
        .map(|(a, _)| a)
    {
        parts.push(format!("requirement '{}' differs", req.id));
    }
    parts.join(", ")
}
