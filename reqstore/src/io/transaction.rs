//! All-or-nothing updates of a state directory.
//!
//! A transaction stages a full physical copy of the live directory next to it
//! (`<live>.staging-<id>`), accepts writes only against that copy, and commits
//! with two renames:
//!
//! 1. live → `<live>.backup-<id>`
//! 2. staging → live
//!
//! then deletes the backup. Siblings share a filesystem, so each rename is
//! atomic. Readers of the live path see either the old or the new directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::paths::{LOCK_FILE, LOCK_GUARD_FILE};
use crate::error::{Result, StoreError};

pub const STAGING_MARKER: &str = ".staging-";
pub const BACKUP_MARKER: &str = ".backup-";

/// Times a reader retries after the live directory was swapped under it.
const READ_ATTEMPTS: u64 = 20;

/// Top-level files linked rather than copied so the advisory lock's inode
/// follows the directory swap. Transactions never write them.
const LINKED_FILES: [&str; 2] = [LOCK_FILE, LOCK_GUARD_FILE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStep {
    RenameLiveToBackup,
    RenameStagingToLive,
    RemoveBackup,
}

/// Injected failures for atomicity tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the n-th `write_file` call (0-based).
    pub fail_write: Option<usize>,
    pub fail_commit_step: Option<CommitStep>,
    /// Also fail the rename that restores live after a failed swap.
    pub fail_undo: bool,
}

/// An open transaction over one live directory.
#[derive(Debug)]
pub struct Transaction {
    live: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
    finished: bool,
    writes: usize,
    faults: FaultPlan,
}

impl Transaction {
    /// Stage a copy of `live`.
    pub fn begin(live: &Path) -> Result<Self> {
        Self::begin_inner(live, FaultPlan::default())
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn begin_with_faults(live: &Path, faults: FaultPlan) -> Result<Self> {
        Self::begin_inner(live, faults)
    }

    fn begin_inner(live: &Path, faults: FaultPlan) -> Result<Self> {
        let meta = fs::metadata(live).map_err(|err| StoreError::transaction_io("stat", live, err))?;
        if !meta.is_dir() {
            return Err(StoreError::transaction_io(
                "stat",
                live,
                std::io::Error::new(ErrorKind::InvalidInput, "live path is not a directory"),
            ));
        }

        let id = Uuid::new_v4().simple().to_string();
        let staging = sibling_path(live, STAGING_MARKER, &id)?;
        let backup = sibling_path(live, BACKUP_MARKER, &id)?;
        fs::create_dir(&staging)
            .map_err(|err| StoreError::transaction_io("create staging", &staging, err))?;

        if let Err(err) = copy_tree(live, &staging, true) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        debug!(live = %live.display(), staging = %staging.display(), "transaction begun");

        Ok(Self {
            live: live.to_path_buf(),
            staging,
            backup,
            finished: false,
            writes: 0,
            faults,
        })
    }

    pub fn staged_path(&self) -> &Path {
        &self.staging
    }

    /// Write `contents` at `relative` inside the staged copy.
    ///
    /// On failure the staged copy is discarded and the transaction is dead.
    pub fn write_file(&mut self, relative: &Path, contents: &[u8]) -> Result<()> {
        self.ensure_active()?;
        let target = self.resolve(relative)?;
        let index = self.writes;
        self.writes += 1;

        let result = (|| -> std::io::Result<()> {
            if self.faults.fail_write == Some(index) {
                return Err(std::io::Error::other("injected write failure"));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, contents)
        })();

        if let Err(err) = result {
            self.discard_quietly();
            return Err(StoreError::transaction_io("write", target, err));
        }
        debug!(path = %target.display(), bytes = contents.len(), "staged write");
        Ok(())
    }

    pub fn read_file(&self, relative: &Path) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let target = self.resolve(relative)?;
        fs::read(&target).map_err(|err| StoreError::transaction_io("read", target, err))
    }

    pub fn remove_file(&mut self, relative: &Path) -> Result<()> {
        self.ensure_active()?;
        let target = self.resolve(relative)?;
        if let Err(err) = fs::remove_file(&target) {
            self.discard_quietly();
            return Err(StoreError::transaction_io("remove", target, err));
        }
        Ok(())
    }

    /// Replace the directory at `relative` in the staged copy with an empty one.
    pub fn reset_dir(&mut self, relative: &Path) -> Result<()> {
        self.ensure_active()?;
        let target = self.resolve(relative)?;
        if let Err(err) = remove_dir_if_present(&target).and_then(|()| fs::create_dir_all(&target)) {
            self.discard_quietly();
            return Err(StoreError::transaction_io("reset dir", target, err));
        }
        Ok(())
    }

    /// Swap the staged copy into place.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let live = self.live.clone();
        let backup = self.backup.clone();

        if let Err(source) = self
            .inject(CommitStep::RenameLiveToBackup)
            .and_then(|()| fs::rename(&live, &backup))
        {
            self.discard_quietly();
            return Err(StoreError::transaction_io("rename live to backup", live, source));
        }

        if let Err(source) = self
            .inject(CommitStep::RenameStagingToLive)
            .and_then(|()| fs::rename(&self.staging, &live))
        {
            return match self.restore_live() {
                Ok(()) => {
                    self.discard_quietly();
                    warn!(live = %live.display(), error = %source, "commit failed; live state restored");
                    Err(StoreError::CommitPartial {
                        live,
                        backup,
                        source,
                    })
                }
                Err(undo) => {
                    // Leave staging and backup on disk for manual recovery.
                    self.finished = true;
                    error!(
                        live = %live.display(),
                        backup = %backup.display(),
                        error = %source,
                        undo_error = %undo,
                        "commit failed and live state could not be restored"
                    );
                    Err(StoreError::CommitFatal {
                        live,
                        backup,
                        source,
                        undo,
                    })
                }
            };
        }
        self.finished = true;

        if let Err(err) = self
            .inject(CommitStep::RemoveBackup)
            .and_then(|()| fs::remove_dir_all(&backup))
        {
            warn!(backup = %backup.display(), error = %err, "could not remove commit backup; left for cleanup");
        }
        info!(live = %live.display(), writes = self.writes, "transaction committed");
        Ok(())
    }

    /// Discard the staged copy; live is untouched.
    pub fn rollback(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        remove_dir_if_present(&self.staging)
            .map_err(|err| StoreError::transaction_io("remove staging", &self.staging, err))?;
        debug!(staging = %self.staging.display(), "transaction rolled back");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            return Err(StoreError::transaction_io(
                "use",
                &self.staging,
                std::io::Error::other("transaction is no longer active"),
            ));
        }
        Ok(())
    }

    fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        let reject = |reason: &str| {
            StoreError::transaction_io(
                "resolve",
                relative,
                std::io::Error::new(ErrorKind::InvalidInput, reason.to_string()),
            )
        };
        if relative.as_os_str().is_empty() {
            return Err(reject("empty path"));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir => return Err(reject("path escapes the state directory")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(reject("absolute paths are not allowed"));
                }
                Component::CurDir => return Err(reject("path must be normalized")),
            }
        }
        if LINKED_FILES.iter().any(|name| relative == Path::new(name)) {
            return Err(reject("lock files are not writable through a transaction"));
        }
        Ok(self.staging.join(relative))
    }

    fn restore_live(&self) -> std::io::Result<()> {
        if self.faults.fail_undo {
            return Err(std::io::Error::other("injected failure restoring live"));
        }
        fs::rename(&self.backup, &self.live)
    }

    fn inject(&self, step: CommitStep) -> std::io::Result<()> {
        if self.faults.fail_commit_step == Some(step) {
            return Err(std::io::Error::other(format!("injected failure at {step:?}")));
        }
        Ok(())
    }

    fn discard_quietly(&mut self) {
        self.finished = true;
        if let Err(err) = remove_dir_if_present(&self.staging) {
            warn!(staging = %self.staging.display(), error = %err, "could not remove staging directory");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(staging = %self.staging.display(), "dropping uncommitted transaction");
            self.discard_quietly();
        }
    }
}

/// Result of [`cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Backup renamed back to live after an interrupted commit.
    pub restored: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Remove staging and backup siblings of `live` older than `max_age`.
///
/// Runs [`recover_interrupted_commit`] first so a lone backup is restored
/// instead of deleted.
pub fn cleanup(live: &Path, max_age: Duration) -> Result<CleanupReport> {
    let restored = recover_interrupted_commit(live)?;
    let mut removed = Vec::new();
    for orphan in transaction_siblings(live)? {
        let age = fs::metadata(&orphan.path)
            .and_then(|meta| meta.modified())
            .map(|modified| modified.elapsed().unwrap_or(Duration::ZERO))
            .map_err(|err| StoreError::transaction_io("stat orphan", &orphan.path, err))?;
        if age < max_age {
            continue;
        }
        remove_dir_if_present(&orphan.path)
            .map_err(|err| StoreError::transaction_io("remove orphan", &orphan.path, err))?;
        warn!(path = %orphan.path.display(), age_secs = age.as_secs(), "removed orphaned transaction directory");
        removed.push(orphan.path);
    }
    Ok(CleanupReport { restored, removed })
}

/// If `live` is missing because a commit died between its two renames,
/// rename the newest backup back into place.
///
/// A backup whose lock file is still advisory-locked belongs to a commit in
/// progress and is left alone.
pub fn recover_interrupted_commit(live: &Path) -> Result<Option<PathBuf>> {
    if live.exists() {
        return Ok(None);
    }
    let mut backups: Vec<_> = transaction_siblings(live)?
        .into_iter()
        .filter(|sibling| sibling.kind == SiblingKind::Backup)
        .collect();
    backups.sort_by_key(|sibling| {
        fs::metadata(&sibling.path)
            .and_then(|meta| meta.modified())
            .ok()
    });
    let Some(newest) = backups.pop() else {
        return Ok(None);
    };

    if lock_in_use(&newest.path.join(LOCK_FILE))? {
        debug!(backup = %newest.path.display(), "commit in progress; not recovering");
        return Ok(None);
    }

    match fs::rename(&newest.path, live) {
        Ok(()) => {
            warn!(backup = %newest.path.display(), live = %live.display(), "restored state from interrupted commit");
            Ok(Some(newest.path))
        }
        // The in-flight commit finished after we looked.
        Err(_) if live.exists() => Ok(None),
        Err(err) => Err(StoreError::transaction_io("restore backup", newest.path, err)),
    }
}

/// Run `read` against `live` until it completes without a commit swapping the
/// directory underneath it.
///
/// A read that spans a swap may see files from both directories, or none while
/// live is briefly missing between the two renames. Such a read is discarded
/// and retried. Results from a stable directory, including errors, are
/// returned as-is.
pub fn read_committed<T>(live: &Path, mut read: impl FnMut(&Path) -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        let before = dir_identity(live);
        let result = read(live);
        let after = dir_identity(live);
        let stable = match before {
            Some(_) => before == after,
            // Missing with no backup around: not mid-commit, just absent.
            None => after.is_none() && !has_backup(live)?,
        };
        if stable || attempt >= READ_ATTEMPTS {
            return result;
        }
        debug!(live = %live.display(), attempt, "state swapped during read; retrying");
        std::thread::sleep(Duration::from_millis(attempt));
        attempt += 1;
    }
}

/// Identity of the directory currently at `path`; `None` if absent.
#[cfg(unix)]
fn dir_identity(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;

    fs::metadata(path).ok().map(|meta| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn dir_identity(path: &Path) -> Option<(u64, u64)> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    let nanos = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    Some((0, nanos))
}

fn has_backup(live: &Path) -> Result<bool> {
    Ok(transaction_siblings(live)?
        .iter()
        .any(|sibling| sibling.kind == SiblingKind::Backup))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SiblingKind {
    Staging,
    Backup,
}

#[derive(Debug)]
struct Sibling {
    path: PathBuf,
    kind: SiblingKind,
}

fn transaction_siblings(live: &Path) -> Result<Vec<Sibling>> {
    let Some(name) = live.file_name().and_then(|name| name.to_str()) else {
        return Ok(Vec::new());
    };
    let parent = match live.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staging_prefix = format!("{name}{STAGING_MARKER}");
    let backup_prefix = format!("{name}{BACKUP_MARKER}");

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::transaction_io("list", parent, err)),
    };
    let mut siblings = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::transaction_io("list", parent, err))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let kind = if file_name.starts_with(&staging_prefix) {
            SiblingKind::Staging
        } else if file_name.starts_with(&backup_prefix) {
            SiblingKind::Backup
        } else {
            continue;
        };
        siblings.push(Sibling {
            path: entry.path(),
            kind,
        });
    }
    siblings.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(siblings)
}

fn lock_in_use(lock_path: &Path) -> Result<bool> {
    let file = match fs::OpenOptions::new().read(true).write(true).open(lock_path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StoreError::transaction_io("open lock", lock_path, err)),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(err)
            if err.kind() == ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Ok(true)
        }
        Err(err) => Err(StoreError::transaction_io("probe lock", lock_path, err)),
    }
}

fn sibling_path(live: &Path, marker: &str, id: &str) -> Result<PathBuf> {
    let name = live.file_name().ok_or_else(|| {
        StoreError::transaction_io(
            "name",
            live,
            std::io::Error::new(ErrorKind::InvalidInput, "live path has no file name"),
        )
    })?;
    let mut sibling = name.to_os_string();
    sibling.push(marker);
    sibling.push(id);
    Ok(live.with_file_name(sibling))
}

/// Recursive physical copy. Only top-level lock artifacts are hard-linked.
fn copy_tree(from: &Path, to: &Path, top_level: bool) -> Result<()> {
    let entries = fs::read_dir(from).map_err(|err| StoreError::transaction_io("list", from, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::transaction_io("list", from, err))?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|err| StoreError::transaction_io("stat", &source, err))?;

        if file_type.is_dir() {
            fs::create_dir(&target)
                .map_err(|err| StoreError::transaction_io("create dir", &target, err))?;
            copy_tree(&source, &target, false)?;
        } else if top_level && LINKED_FILES.iter().any(|name| entry.file_name() == *name) {
            fs::hard_link(&source, &target)
                .map_err(|err| StoreError::transaction_io("link", &target, err))?;
        } else {
            fs::copy(&source, &target).map_err(|err| StoreError::transaction_io("copy", &source, err))?;
        }
    }
    Ok(())
}

fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
