//! Cross-process project lock.
//!
//! ## Protocol
//! - Ownership is arbitrated by an OS advisory exclusive lock (`fs2`) on
//!   `.state/.lock`, never by the file's existence.
//! - The file body is [`LockMetadata`] JSON, used for diagnostics and for
//!   judging staleness.
//! - A sibling guard file (`.lock.guard`) serializes metadata writes, stale
//!   takeovers and releases, so a takeover cannot interleave with a fresh
//!   acquisition or with a release deleting the file.
//! - A crashed holder's advisory lock is dropped by the kernel, so its leftover
//!   file is simply overwritten by the next acquirer.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::liveness::ProcessLiveness;
use crate::error::{Result, StoreError};

/// Default age after which a recorded holder is considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Times an acquirer reopens the lock file after finding it was unlinked or
/// replaced between open and lock.
const REOPEN_ATTEMPTS: usize = 3;

/// Which front end holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceTag {
    Cli,
    Web,
}

impl InterfaceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for InterfaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterfaceTag {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "cli" => Ok(Self::Cli),
            "web" => Ok(Self::Web),
            other => Err(format!("unknown interface '{}' (expected cli or web)", other)),
        }
    }
}

/// Ownership facts stored in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub hostname: String,
    pub interface: InterfaceTag,
    pub timestamp: DateTime<Utc>,
}

/// Why a recorded holder no longer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Holder pid is not running on this host.
    HolderDead,
    /// Lock is older than the stale threshold.
    Expired,
}

impl LockMetadata {
    pub fn for_current_process(interface: InterfaceTag, liveness: &dyn ProcessLiveness) -> Self {
        Self {
            pid: std::process::id(),
            hostname: liveness.hostname(),
            interface,
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| StoreError::Encode {
            what: "lock metadata",
            reason: err.to_string(),
        })
    }

    pub fn decode(contents: &str, path: &Path) -> Result<Self> {
        serde_json::from_str(contents).map_err(|err| StoreError::Decode {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Time since acquisition; zero if the timestamp is in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Liveness is only judged for holders on this host; age applies to all.
    pub fn staleness(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        liveness: &dyn ProcessLiveness,
    ) -> Option<StaleReason> {
        if self.hostname == liveness.hostname() && !liveness.is_alive(self.pid) {
            return Some(StaleReason::HolderDead);
        }
        if self.age(now) > stale_after {
            return Some(StaleReason::Expired);
        }
        None
    }
}

impl fmt::Display for LockMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} on {} ({})", self.pid, self.hostname, self.interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// A held project lock. Released on [`FileLock::release`] or drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    guard_path: PathBuf,
    file: Option<File>,
    metadata: LockMetadata,
}

impl FileLock {
    /// Try to take the lock at `path` without blocking.
    ///
    /// Returns `LockHeld` if a live, non-stale holder owns it.
    pub fn acquire(
        path: &Path,
        interface: InterfaceTag,
        options: &LockOptions,
        liveness: &dyn ProcessLiveness,
    ) -> Result<Self> {
        let guard_path = guard_path_for(path);
        for attempt in 0..REOPEN_ATTEMPTS {
            let file = open_lock_file(path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if let Some(lock) = Self::claim(path, &guard_path, file, interface, liveness)? {
                        return Ok(lock);
                    }
                    debug!(path = %path.display(), attempt, "lock file replaced before claim; reopening");
                }
                Err(err) if is_contended(&err) => {
                    return Self::contend(path, &guard_path, interface, options, liveness);
                }
                Err(err) => return Err(StoreError::lock_io("lock", path, err)),
            }
        }
        Err(held_error(read_lock_metadata(path)?, Utc::now()))
    }

    /// Finish an acquisition whose advisory lock succeeded.
    ///
    /// Returns `None` if `file` is no longer the file at `path` (a release
    /// unlinked it, or a takeover replaced it, between open and lock).
    fn claim(
        path: &Path,
        guard_path: &Path,
        mut file: File,
        interface: InterfaceTag,
        liveness: &dyn ProcessLiveness,
    ) -> Result<Option<Self>> {
        let guard = lock_guard(guard_path)?;
        let result = (|| -> Result<Option<Self>> {
            if !same_file(&file, path).map_err(|err| StoreError::lock_io("stat", path, err))? {
                return Ok(None);
            }
            if let Some(previous) = read_metadata_from(&mut file, path)? {
                warn!(
                    pid = previous.pid,
                    host = %previous.hostname,
                    interface = %previous.interface,
                    "recovered lock left behind by a terminated holder"
                );
            }
            let metadata = LockMetadata::for_current_process(interface, liveness);
            write_metadata(&mut file, path, &metadata)?;
            debug!(path = %path.display(), pid = metadata.pid, "lock acquired");
            Ok(Some(Self {
                path: path.to_path_buf(),
                guard_path: guard_path.to_path_buf(),
                file: Some(file),
                metadata,
            }))
        })();
        let _ = FileExt::unlock(&guard);
        result
    }

    /// The advisory lock is held elsewhere: report the holder, or take over if
    /// its metadata is stale.
    fn contend(
        path: &Path,
        guard_path: &Path,
        interface: InterfaceTag,
        options: &LockOptions,
        liveness: &dyn ProcessLiveness,
    ) -> Result<Self> {
        let now = Utc::now();
        let Some(existing) = read_lock_metadata(path)? else {
            return Err(held_error(None, now));
        };
        if existing.staleness(now, options.stale_after, liveness).is_none() {
            return Err(held_error(Some(existing), now));
        }

        let guard = open_guard_file(guard_path)?;
        match guard.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                debug!(path = %path.display(), "another process is mid-takeover");
                return Err(held_error(Some(existing), now));
            }
            Err(err) => return Err(StoreError::lock_io("lock guard", guard_path, err)),
        }
        let result = Self::take_over(path, guard_path, interface, options, liveness);
        let _ = FileExt::unlock(&guard);
        result
    }

    /// Stale takeover; caller holds the guard.
    ///
    /// Staleness is re-checked here because the metadata read before taking the
    /// guard may already have been replaced by another contender.
    fn take_over(
        path: &Path,
        guard_path: &Path,
        interface: InterfaceTag,
        options: &LockOptions,
        liveness: &dyn ProcessLiveness,
    ) -> Result<Self> {
        let now = Utc::now();
        let current = read_lock_metadata(path)?;

        let mut probe = open_lock_file(path)?;
        match probe.try_lock_exclusive() {
            Ok(()) => {
                // Holder let go since we looked; this is a plain acquisition.
                let metadata = LockMetadata::for_current_process(interface, liveness);
                write_metadata(&mut probe, path, &metadata)?;
                return Ok(Self {
                    path: path.to_path_buf(),
                    guard_path: guard_path.to_path_buf(),
                    file: Some(probe),
                    metadata,
                });
            }
            Err(err) if is_contended(&err) => {}
            Err(err) => return Err(StoreError::lock_io("lock", path, err)),
        }
        drop(probe);

        let Some(current) = current else {
            return Err(held_error(None, now));
        };
        match current.staleness(now, options.stale_after, liveness) {
            None => return Err(held_error(Some(current), now)),
            // The advisory lock is still held, so whoever holds it is alive and
            // has not written its metadata yet.
            Some(StaleReason::HolderDead) => return Err(held_error(None, now)),
            Some(StaleReason::Expired) => {}
        }

        warn!(
            pid = current.pid,
            host = %current.hostname,
            age_secs = current.age(now).as_secs(),
            "taking over expired project lock"
        );
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::lock_io("remove stale", path, err)),
        }

        let mut file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => return Err(held_error(None, now)),
            Err(err) => return Err(StoreError::lock_io("lock", path, err)),
        }
        let metadata = LockMetadata::for_current_process(interface, liveness);
        write_metadata(&mut file, path, &metadata)?;
        info!(path = %path.display(), previous_pid = current.pid, "stale lock taken over");
        Ok(Self {
            path: path.to_path_buf(),
            guard_path: guard_path.to_path_buf(),
            file: Some(file),
            metadata,
        })
    }

    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }

    /// True until released. Says nothing about takeovers; see [`FileLock::verify`].
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Confirm this handle still owns the lock file at its path.
    ///
    /// Fails with `LockHeld` naming the current holder if the lock was
    /// released or taken over since acquisition.
    pub fn verify(&self) -> Result<()> {
        self.while_verified(|| Ok(()))
    }

    /// Run `f` with ownership confirmed and the takeover guard held, so no
    /// contender can take the lock over until `f` returns.
    pub fn while_verified<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = lock_guard(&self.guard_path)?;
        let result = self.check_owned().and_then(|()| f());
        let _ = FileExt::unlock(&guard);
        result
    }

    /// Caller holds the guard.
    fn check_owned(&self) -> Result<()> {
        let owned = match &self.file {
            Some(file) => same_file(file, &self.path)
                .map_err(|err| StoreError::lock_io("stat", &self.path, err))?,
            None => false,
        };
        if owned {
            return Ok(());
        }
        let current = read_lock_metadata(&self.path)?;
        warn!(
            path = %self.path.display(),
            pid = self.metadata.pid,
            current = ?current.as_ref().map(ToString::to_string),
            "project lock is no longer ours"
        );
        Err(held_error(current, Utc::now()))
    }

    /// Delete the lock file (if it is still ours) and drop the advisory lock.
    ///
    /// Idempotent. If the lock was taken over, the thief's file is left alone.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let guard = lock_guard(&self.guard_path)?;
        let result = match same_file(&file, &self.path) {
            Ok(true) => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StoreError::lock_io("remove", &self.path, err)),
            },
            Ok(false) => {
                warn!(path = %self.path.display(), "lock was taken over; leaving current holder in place");
                Ok(())
            }
            Err(err) => Err(StoreError::lock_io("stat", &self.path, err)),
        };
        let _ = FileExt::unlock(&file);
        let _ = FileExt::unlock(&guard);
        debug!(path = %self.path.display(), "lock released");
        result
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            debug!(error = %err, "failed to release lock on drop");
        }
    }
}

/// Holder information for `reqstore lock status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub holder: LockMetadata,
    pub age: Duration,
    pub stale: Option<StaleReason>,
}

/// Read the recorded holder without touching the advisory lock.
pub fn lock_status(
    path: &Path,
    options: &LockOptions,
    liveness: &dyn ProcessLiveness,
) -> Result<Option<LockStatus>> {
    let now = Utc::now();
    Ok(read_lock_metadata(path)?.map(|holder| LockStatus {
        age: holder.age(now),
        stale: holder.staleness(now, options.stale_after, liveness),
        holder,
    }))
}

/// Administrative override: delete the lock file regardless of holder.
///
/// Returns false if there was nothing to remove.
pub fn force_unlock(path: &Path) -> Result<bool> {
    let previous = read_lock_metadata(path)?;
    match fs::remove_file(path) {
        Ok(()) => {
            match previous {
                Some(holder) => warn!(holder = %holder, "forcibly removed project lock"),
                None => warn!(path = %path.display(), "forcibly removed project lock"),
            }
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::lock_io("force remove", path, err)),
    }
}

/// Read metadata at `path`; `None` if absent, empty or mid-write.
pub fn read_lock_metadata(path: &Path) -> Result<Option<LockMetadata>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::lock_io("read", path, err)),
    };
    Ok(parse_metadata(&contents, path))
}

/// `<lock>.guard`, next to the lock file.
pub fn guard_path_for(lock_path: &Path) -> PathBuf {
    let mut guard = lock_path.as_os_str().to_owned();
    guard.push(".guard");
    PathBuf::from(guard)
}

fn parse_metadata(contents: &str, path: &Path) -> Option<LockMetadata> {
    if contents.trim().is_empty() {
        return None;
    }
    match LockMetadata::decode(contents, path) {
        Ok(meta) => Some(meta),
        Err(err) => {
            debug!(error = %err, "unreadable lock metadata");
            None
        }
    }
}

fn read_metadata_from(file: &mut File, path: &Path) -> Result<Option<LockMetadata>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut contents))
        .map_err(|err| StoreError::lock_io("read", path, err))?;
    Ok(parse_metadata(&contents, path))
}

fn write_metadata(file: &mut File, path: &Path, metadata: &LockMetadata) -> Result<()> {
    let json = metadata.encode()?;
    file.set_len(0)
        .and_then(|_| file.seek(SeekFrom::Start(0)))
        .and_then(|_| file.write_all(json.as_bytes()))
        .and_then(|_| file.sync_all())
        .map_err(|err| StoreError::lock_io("write metadata", path, err))
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| StoreError::lock_io("open", path, err))
}

fn open_guard_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| StoreError::lock_io("open guard", path, err))
}

/// Open and block on the guard. Guard sections are short and never nest.
fn lock_guard(path: &Path) -> Result<File> {
    let guard = open_guard_file(path)?;
    guard
        .lock_exclusive()
        .map_err(|err| StoreError::lock_io("lock guard", path, err))?;
    Ok(guard)
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn held_error(holder: Option<LockMetadata>, now: DateTime<Utc>) -> StoreError {
    let age = holder.as_ref().map(|meta| meta.age(now));
    StoreError::LockHeld { holder, age }
}

/// True if `file` is still the file named by `path`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Open files cannot be unlinked on this platform, so presence is enough.
#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;
    use crate::test_support::FakeLiveness;

    const DEAD_PID: u32 = 4_000_000;

    fn lock_path(dir: &Path) -> PathBuf {
        dir.join(".lock")
    }

    fn write_raw_metadata(path: &Path, pid: u32, hostname: &str, age: Duration) {
        let meta = LockMetadata {
            pid,
            hostname: hostname.to_string(),
            interface: InterfaceTag::Web,
            timestamp: Utc::now() - chrono::Duration::from_std(age).expect("duration"),
        };
        fs::write(path, meta.encode().expect("encode")).expect("write lock");
    }

    #[test]
    fn metadata_encodes_documented_json_shape() {
        let meta = LockMetadata {
            pid: 42,
            hostname: "box".to_string(),
            interface: InterfaceTag::Cli,
            timestamp: crate::test_support::ts(0),
        };
        let json = meta.encode().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["pid"], 42);
        assert_eq!(value["hostname"], "box");
        assert_eq!(value["interface"], "cli");
        assert_eq!(value["timestamp"], "2026-01-01T00:00:00Z");
        assert_eq!(LockMetadata::decode(&json, Path::new("x")).expect("decode"), meta);
    }

    #[test]
    fn acquire_writes_metadata_and_release_removes_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();

        let mut lock = FileLock::acquire(&path, InterfaceTag::Cli, &LockOptions::default(), &liveness)
            .expect("acquire");
        let recorded = read_lock_metadata(&path).expect("read").expect("metadata");
        assert_eq!(recorded.pid, std::process::id());
        assert_eq!(recorded.interface, InterfaceTag::Cli);
        assert_eq!(&recorded, lock.metadata());

        lock.release().expect("release");
        assert!(!path.exists());
        assert!(!lock.is_held());
    }

    #[test]
    fn live_holder_blocks_second_acquire() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();
        let options = LockOptions::default();

        let _first = FileLock::acquire(&path, InterfaceTag::Cli, &options, &liveness).expect("first");
        let err = FileLock::acquire(&path, InterfaceTag::Web, &options, &liveness)
            .expect_err("second must fail");
        match err {
            StoreError::LockHeld { holder, age } => {
                let holder = holder.expect("holder identity");
                assert_eq!(holder.pid, std::process::id());
                assert_eq!(holder.interface, InterfaceTag::Cli);
                assert!(age.is_some());
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn leftover_file_from_dead_holder_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();
        write_raw_metadata(&path, DEAD_PID, &liveness.hostname(), Duration::from_secs(5));

        let lock = FileLock::acquire(&path, InterfaceTag::Cli, &LockOptions::default(), &liveness)
            .expect("reclaim");
        assert_eq!(lock.metadata().pid, std::process::id());
        let recorded = read_lock_metadata(&path).expect("read").expect("metadata");
        assert_eq!(recorded.pid, std::process::id());
    }

    /// Five contenders racing over a dead, 31-minute-old lock: exactly one wins.
    #[test]
    fn concurrent_stale_takeover_has_single_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = Arc::new(FakeLiveness::default());
        write_raw_metadata(
            &path,
            DEAD_PID,
            &liveness.hostname(),
            Duration::from_secs(31 * 60),
        );

        let barrier = Arc::new(Barrier::new(5));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let path = path.clone();
                let liveness = Arc::clone(&liveness);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    FileLock::acquire(
                        &path,
                        InterfaceTag::Cli,
                        &LockOptions::default(),
                        liveness.as_ref(),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect();
        let winners = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(winners, 1, "results: {results:?}");
        for result in &results {
            if let Err(err) = result {
                assert!(err.is_lock_contention(), "unexpected error {err:?}");
            }
        }
    }

    #[test]
    fn expired_live_holder_is_taken_over_and_its_release_is_harmless() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();

        let mut hung = FileLock::acquire(&path, InterfaceTag::Web, &LockOptions::default(), &liveness)
            .expect("first");
        std::thread::sleep(Duration::from_millis(20));

        let impatient = LockOptions {
            stale_after: Duration::from_millis(1),
        };
        let mut thief =
            FileLock::acquire(&path, InterfaceTag::Cli, &impatient, &liveness).expect("takeover");
        assert_eq!(
            read_lock_metadata(&path).expect("read").expect("meta").interface,
            InterfaceTag::Cli
        );

        hung.release().expect("old holder release");
        assert!(path.exists(), "old holder must not delete the new lock");
        assert!(thief.is_held());

        thief.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn verify_fails_once_the_lock_is_taken_over() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();

        let hung = FileLock::acquire(&path, InterfaceTag::Web, &LockOptions::default(), &liveness)
            .expect("first");
        hung.verify().expect("owner verifies");
        std::thread::sleep(Duration::from_millis(20));

        let impatient = LockOptions {
            stale_after: Duration::from_millis(1),
        };
        let thief =
            FileLock::acquire(&path, InterfaceTag::Cli, &impatient, &liveness).expect("takeover");

        assert!(hung.is_held());
        match hung.verify().expect_err("taken over") {
            StoreError::LockHeld { holder, .. } => {
                assert_eq!(holder.expect("holder").interface, InterfaceTag::Cli);
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
        let mut ran = false;
        let result = hung.while_verified(|| {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
        thief.verify().expect("thief verifies");
    }

    #[test]
    fn release_twice_never_touches_next_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();
        let options = LockOptions::default();

        let mut first = FileLock::acquire(&path, InterfaceTag::Cli, &options, &liveness).expect("first");
        first.release().expect("release");
        let second = FileLock::acquire(&path, InterfaceTag::Web, &options, &liveness).expect("second");

        first.release().expect("second release is a no-op");
        assert!(path.exists());
        assert!(second.is_held());
        let err = FileLock::acquire(&path, InterfaceTag::Cli, &options, &liveness)
            .expect_err("second still holds");
        assert!(err.is_lock_contention());
    }

    #[test]
    fn drop_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();
        let options = LockOptions::default();

        {
            let _lock = FileLock::acquire(&path, InterfaceTag::Cli, &options, &liveness).expect("acquire");
        }
        assert!(!path.exists());
        FileLock::acquire(&path, InterfaceTag::Cli, &options, &liveness).expect("reacquire");
    }

    #[test]
    fn status_reports_dead_holder_as_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        let liveness = FakeLiveness::default();
        assert!(
            lock_status(&path, &LockOptions::default(), &liveness)
                .expect("status")
                .is_none()
        );

        write_raw_metadata(&path, DEAD_PID, &liveness.hostname(), Duration::from_secs(60));
        let status = lock_status(&path, &LockOptions::default(), &liveness)
            .expect("status")
            .expect("holder");
        assert_eq!(status.stale, Some(StaleReason::HolderDead));
        assert!(status.age >= Duration::from_secs(60));
    }

    #[test]
    fn foreign_host_is_only_stale_by_age() {
        let liveness = FakeLiveness::default();
        let mut meta = LockMetadata::for_current_process(InterfaceTag::Web, &liveness);
        meta.pid = DEAD_PID;
        meta.hostname = "elsewhere".to_string();
        let now = Utc::now();
        assert_eq!(meta.staleness(now, DEFAULT_STALE_AFTER, &liveness), None);
        let later = now + chrono::Duration::minutes(31);
        assert_eq!(
            meta.staleness(later, DEFAULT_STALE_AFTER, &liveness),
            Some(StaleReason::Expired)
        );
    }

    #[test]
    fn force_unlock_removes_any_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path());
        assert!(!force_unlock(&path).expect("nothing to remove"));

        write_raw_metadata(&path, DEAD_PID, "elsewhere", Duration::from_secs(1));
        assert!(force_unlock(&path).expect("remove"));
        assert!(!path.exists());
    }
}
