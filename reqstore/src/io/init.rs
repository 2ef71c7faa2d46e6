//! Initialization of `.state/` for a new project.
//!
//! A first-time scaffold writes files directly. Re-initializing an existing
//! project goes through the project lock and a transaction like any other
//! mutation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::warn;

use super::codec::encode_yaml;
use super::config::load_config;
use super::liveness::SystemLiveness;
use super::lock::{FileLock, InterfaceTag};
use super::paths::{CHANGELOG_FILE, SNAPSHOTS_DIR, SPECIFICATION_FILE, StatePaths};
use super::transaction::Transaction;
use crate::core::changelog::Changelog;
use crate::core::invariants::validate_specification;
use crate::core::types::Specification;

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    /// If true, discard existing state (history included).
    pub force: bool,
}

/// Create `.state/` in `root` with a genesis specification and an empty
/// changelog.
///
/// Fails if the project is already initialized unless `options.force` is set.
/// A forced re-init fails with `LockHeld` while another session holds the
/// project lock.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("init: .state exists but is not a directory"));
    }
    if paths.is_initialized() && !options.force {
        return Err(anyhow!(
            "init: project already initialized at {} (use --force to overwrite)",
            paths.state_dir.display()
        ));
    }
    if options.name.trim().is_empty() {
        return Err(anyhow!("init: project name must not be empty"));
    }

    let mut genesis = Specification::new(&options.name, &options.description, Utc::now());
    for category in &options.categories {
        let category = category.trim();
        if category.is_empty() {
            return Err(anyhow!("init: category names must not be empty"));
        }
        genesis.categories.insert(category.to_string());
    }
    let errors = validate_specification(&genesis);
    if !errors.is_empty() {
        return Err(anyhow!("init: invalid genesis: {}", errors.join("; ")));
    }

    let spec_yaml = encode_yaml(&genesis, "specification")?;
    let changelog_yaml = encode_yaml(&Changelog::new(genesis), "changelog")?;

    if paths.is_initialized() {
        reinitialize(&paths, &spec_yaml, &changelog_yaml)?;
        return Ok(paths);
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    if paths.snapshots_dir.exists() {
        fs::remove_dir_all(&paths.snapshots_dir)
            .with_context(|| format!("clear {}", paths.snapshots_dir.display()))?;
    }
    fs::create_dir_all(&paths.snapshots_dir)
        .with_context(|| format!("create directory {}", paths.snapshots_dir.display()))?;
    write_atomic(&paths.specification_path, &spec_yaml)?;
    write_atomic(&paths.changelog_path, &changelog_yaml)?;

    Ok(paths)
}

/// Replace an initialized project's history with a fresh genesis.
fn reinitialize(paths: &StatePaths, spec_yaml: &str, changelog_yaml: &str) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let mut lock = FileLock::acquire(
        &paths.lock_path,
        InterfaceTag::Cli,
        &config.lock_options(),
        &SystemLiveness,
    )?;

    let mut tx = Transaction::begin(&paths.state_dir)?;
    tx.reset_dir(Path::new(SNAPSHOTS_DIR))?;
    tx.write_file(Path::new(SPECIFICATION_FILE), spec_yaml.as_bytes())?;
    tx.write_file(Path::new(CHANGELOG_FILE), changelog_yaml.as_bytes())?;
    lock.while_verified(|| tx.commit())?;
    lock.release()?;

    warn!(path = %paths.state_dir.display(), "project re-initialized; previous history discarded");
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("yaml.tmp");
    let result = fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp {}", tmp_path.display()))
        .and_then(|()| {
            fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
        });
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::io::config::StoreConfig;
    use crate::io::event_log::load_changelog;
    use crate::repository::{Delta, Repository};
    use crate::test_support::category_added;

    fn options(categories: &[&str]) -> InitOptions {
        InitOptions {
            name: "demo".to_string(),
            description: "demo project".to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            force: false,
        }
    }

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &options(&["auth", "ui"])).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.snapshots_dir.is_dir());
        assert!(paths.specification_path.is_file());
        assert!(paths.is_initialized());

        let changelog = load_changelog(&paths.state_dir).expect("changelog");
        assert!(changelog.is_empty());
        assert_eq!(changelog.genesis.metadata.name, "demo");
        assert!(changelog.genesis.categories.contains("auth"));
        assert_eq!(changelog.events_since_snapshot, 0);
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &options(&[])).expect("init");
        let err = init_project(temp.path(), &options(&[])).expect_err("second init");
        assert!(err.to_string().contains("--force"));

        let forced = InitOptions {
            force: true,
            ..options(&["ops"])
        };
        let paths = init_project(temp.path(), &forced).expect("forced init");
        let changelog = load_changelog(&paths.state_dir).expect("changelog");
        assert!(changelog.genesis.categories.contains("ops"));
    }

    #[test]
    fn forced_init_waits_for_the_lock_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &options(&["auth"])).expect("init");
        let mut repo = Repository::open(temp.path(), StoreConfig::default()).expect("open");
        repo.acquire_lock(InterfaceTag::Web).expect("lock");
        repo.apply_delta(Delta {
            specification: None,
            events: vec![category_added(1, "ui")],
        })
        .expect("commit");

        let forced = InitOptions {
            force: true,
            ..options(&[])
        };
        let err = init_project(temp.path(), &forced).expect_err("lock is held");
        assert!(
            err.downcast_ref::<StoreError>()
                .is_some_and(StoreError::is_lock_contention),
            "{err:#}"
        );
        assert_eq!(repo.read_changelog().expect("changelog").len(), 1);
        assert!(repo.holds_lock());

        repo.release_lock().expect("release");
        let paths = init_project(temp.path(), &forced).expect("forced init");
        assert!(load_changelog(&paths.state_dir).expect("changelog").is_empty());
        assert_eq!(fs::read_dir(&paths.snapshots_dir).expect("snapshots").count(), 0);
        assert!(!paths.lock_path.exists());
    }

    #[test]
    fn failed_replace_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("specification.yaml");
        fs::create_dir_all(target.join("occupied")).expect("block target");

        assert!(write_atomic(&target, "x: 1\n").is_err());
        assert!(!temp.path().join("specification.yaml.tmp").exists());
    }

    #[test]
    fn blank_category_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(init_project(temp.path(), &options(&["  "])).is_err());
        assert!(!StatePaths::new(temp.path()).is_initialized());
    }
}
