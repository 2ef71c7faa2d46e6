//! Error taxonomy for the persistence core.
//!
//! Lock contention, lock I/O, transaction I/O and commit failures are distinct
//! variants so the calling layer can decide between "wait and retry" and
//! "something is broken on disk".

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::io::lock::LockMetadata;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another live process holds the project lock.
    #[error("{}", held_message(.holder.as_ref(), .age))]
    LockHeld {
        /// Recorded holder, `None` while the holder is still writing its metadata.
        holder: Option<LockMetadata>,
        age: Option<Duration>,
    },

    #[error("lock {op} failed for {}: {source}", .path.display())]
    LockIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Staging, copy or rename failure. The staged copy is already discarded.
    #[error("transaction {op} failed for {}: {source}", .path.display())]
    TransactionIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Staged directory could not be swapped in; the live directory was restored.
    #[error(
        "commit failed moving staged state into {}; restored from {}: {source}",
        .live.display(),
        .backup.display()
    )]
    CommitPartial {
        live: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Swap failed and the restore failed too. Manual recovery required.
    #[error(
        "commit failed and restore failed: live {} is missing, previous state is at {} ({source}; restore: {undo})",
        .live.display(),
        .backup.display()
    )]
    CommitFatal {
        live: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
        undo: std::io::Error,
    },

    /// Reading live state outside a transaction failed.
    #[error("state {op} failed for {}: {source}", .path.display())]
    StateIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("event {event_id} at position {position} rejected: {reason}")]
    EventValidation {
        position: usize,
        event_id: String,
        reason: String,
    },

    #[error("state reconstruction inconsistent: {reason}")]
    ReconstructionInconsistency { reason: String },

    #[error("decode {}: {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("project state not initialized at {}", .path.display())]
    NotInitialized { path: PathBuf },
}

impl StoreError {
    pub fn lock_io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LockIo {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn transaction_io(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::TransactionIo {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn state_io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StateIo {
            op,
            path: path.into(),
            source,
        }
    }

    /// True when the failure is "someone else holds the lock" rather than I/O.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }

    /// Short operator-facing hint for the CLI.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockHeld { .. } => Some(
                "another session is editing this project; retry later or run `reqstore unlock --force` if it crashed",
            ),
            Self::CommitFatal { .. } => {
                Some("rename the backup directory back to `.state` before running anything else")
            }
            Self::NotInitialized { .. } => Some("run `reqstore init` first"),
            _ => None,
        }
    }
}

fn held_message(holder: Option<&LockMetadata>, age: &Option<Duration>) -> String {
    match holder {
        Some(meta) => match age {
            Some(age) => format!("project locked by {} for {}", meta, format_age(*age)),
            None => format!("project locked by {}", meta),
        },
        None => "project locked by a process that is still acquiring it".to_string(),
    }
}

/// Render an age as `1h 5m`, `5m 3s` or `42s`.
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_age_picks_largest_units() {
        assert_eq!(format_age(Duration::from_secs(42)), "42s");
        assert_eq!(format_age(Duration::from_secs(5 * 60 + 3)), "5m 3s");
        assert_eq!(format_age(Duration::from_secs(3600 + 5 * 60)), "1h 5m");
    }

    #[test]
    fn only_lock_held_is_contention() {
        let held = StoreError::LockHeld {
            holder: None,
            age: None,
        };
        let io = StoreError::lock_io("open", "/tmp/x", std::io::Error::other("boom"));
        assert!(held.is_lock_contention());
        assert!(!io.is_lock_contention());
        assert!(held.hint().is_some());
    }
}
