//! End-to-end repository scenarios: commits, history, snapshots, atomicity.
//!
//! Each test initializes a fresh project in a temp dir and drives it through
//! `Repository` the way a front end would: lock, read, commit, release.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqstore::core::events::{ChangelogEvent, EventKind};
use reqstore::core::replay::apply_event;
use reqstore::core::types::{AcceptanceCriterion, Specification};
use reqstore::io::config::StoreConfig;
use reqstore::io::event_log::list_snapshots;
use reqstore::io::init::{InitOptions, init_project};
use reqstore::io::lock::InterfaceTag;
use reqstore::io::transaction::{CommitStep, FaultPlan};
use reqstore::test_support::{FakeLiveness, bump, category_added, read_tree, requirement, ts};
use reqstore::{Repository, StoreError};

fn init(root: &Path, categories: &[&str]) {
    init_project(
        root,
        &InitOptions {
            name: "checkout".to_string(),
            description: "checkout service".to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            force: false,
        },
    )
    .expect("init");
}

fn open(root: &Path) -> Repository {
    Repository::open_with_liveness(
        root,
        StoreConfig::default(),
        Arc::new(FakeLiveness::default()),
    )
    .expect("open")
}

/// Play `events` on top of `state` the way a producer computes its delta.
fn expected_after(state: &Specification, events: &[ChangelogEvent]) -> Specification {
    let mut next = state.clone();
    for event in events {
        apply_event(&mut next, event).expect("producer event applies");
    }
    next
}

fn commit(repo: &mut Repository, events: Vec<ChangelogEvent>) {
    let state = repo.read_state().expect("state");
    let expected = expected_after(&state, &events);
    repo.commit_delta(&expected, events).expect("commit");
}

#[test]
fn added_requirement_is_stored_once_and_indexed() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &["auth"]);
    let mut repo = open(temp.path());
    repo.acquire_lock(InterfaceTag::Cli).expect("lock");

    let mut req = requirement("REQ-AUTH-a8b2f91k", "auth");
    req.acceptance_criteria = vec![AcceptanceCriterion::Behavioral {
        id: "AC-1".to_string(),
        given: "a user with a valid password".to_string(),
        when: "they log in".to_string(),
        then: "a session token is issued".to_string(),
        created_at: ts(0),
    }];
    let event = ChangelogEvent::new(EventKind::RequirementAdded {
        requirement: req.clone(),
    });
    let state = repo.read_state().expect("state");
    let expected = expected_after(&state, std::slice::from_ref(&event));

    let summary = repo.commit_delta(&expected, vec![event]).expect("commit");
    assert_eq!(summary.positions, vec![0]);
    repo.release_lock().expect("release");

    let state = repo.read_state().expect("state");
    let matching: Vec<_> = state
        .requirements
        .iter()
        .filter(|r| r.id == "REQ-AUTH-a8b2f91k")
        .collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0], &req);

    let changelog = repo.read_changelog().expect("changelog");
    assert_eq!(changelog.indexes.by_requirement["REQ-AUTH-a8b2f91k"], vec![0]);
    assert_eq!(changelog.indexes.by_category["auth"], vec![0]);

    let on_disk: Specification = serde_yaml::from_slice(
        &fs::read(&repo.paths().specification_path).expect("read spec"),
    )
    .expect("decode spec");
    assert_eq!(on_disk, state);
}

#[test]
fn version_bumps_accumulate_across_commits() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &[]);
    let mut repo = open(temp.path());
    repo.acquire_lock(InterfaceTag::Web).expect("lock");

    commit(&mut repo, vec![bump(1, "0.1.0", "0.2.0")]);
    commit(&mut repo, vec![bump(2, "0.2.0", "0.2.1")]);

    assert_eq!(repo.read_state().expect("state").metadata.version, "0.2.1");
    let changelog = repo.read_changelog().expect("changelog");
    let bumps: Vec<_> = changelog
        .events_of_type("version_bumped")
        .into_iter()
        .map(|event| match &event.kind {
            EventKind::VersionBumped {
                old_version,
                new_version,
            } => (old_version.as_str(), new_version.as_str()),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(bumps, vec![("0.1.0", "0.2.0"), ("0.2.0", "0.2.1")]);
}

#[test]
fn snapshots_follow_the_hundred_event_cadence() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &[]);
    let mut repo = open(temp.path());
    repo.acquire_lock(InterfaceTag::Cli).expect("lock");

    let batch = |from: i64, to: i64| -> Vec<ChangelogEvent> {
        (from..to)
            .map(|n| category_added(n, &format!("cat-{n:03}")))
            .collect()
    };

    for start in (0..100).step_by(25) {
        commit(&mut repo, batch(start, start + 25));
    }
    let changelog = repo.read_changelog().expect("changelog");
    assert_eq!(changelog.len(), 100);
    assert_eq!(changelog.events_since_snapshot, 0);
    assert_eq!(list_snapshots(&repo.paths().state_dir).expect("list").len(), 1);

    commit(&mut repo, batch(100, 250));
    let changelog = repo.read_changelog().expect("changelog");
    assert_eq!(changelog.events_since_snapshot, 50);
    let counts: Vec<_> = list_snapshots(&repo.paths().state_dir)
        .expect("list")
        .into_iter()
        .map(|(count, _)| count)
        .collect();
    assert_eq!(counts, vec![100, 200]);

    let state = repo.read_state().expect("state");
    assert_eq!(state.categories.len(), 250);
}

#[test]
fn failed_commit_leaves_state_byte_identical() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &["auth"]);
    let mut repo = open(temp.path());
    repo.acquire_lock(InterfaceTag::Cli).expect("lock");
    commit(&mut repo, vec![category_added(1, "ui")]);

    let state_dir = repo.paths().state_dir.clone();
    let before = read_tree(&state_dir);
    let state = repo.read_state().expect("state");
    let events = vec![bump(2, "0.1.0", "0.2.0")];
    let expected = expected_after(&state, &events);

    for faults in [
        FaultPlan {
            fail_write: Some(0),
            ..FaultPlan::default()
        },
        FaultPlan {
            fail_write: Some(1),
            ..FaultPlan::default()
        },
        FaultPlan {
            fail_commit_step: Some(CommitStep::RenameLiveToBackup),
            ..FaultPlan::default()
        },
        FaultPlan {
            fail_commit_step: Some(CommitStep::RenameStagingToLive),
            ..FaultPlan::default()
        },
    ] {
        let err = repo
            .commit_delta_with_faults(&expected, events.clone(), faults.clone())
            .expect_err("injected failure");
        assert!(
            matches!(
                err,
                StoreError::TransactionIo { .. } | StoreError::CommitPartial { .. }
            ),
            "{faults:?}: {err:?}"
        );
        assert_eq!(read_tree(&state_dir), before, "{faults:?}");
    }

    repo.commit_delta(&expected, events).expect("clean commit");
    assert_eq!(repo.read_state().expect("state").metadata.version, "0.2.0");
}

#[test]
fn rejected_delta_changes_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &["auth"]);
    let mut repo = open(temp.path());
    repo.acquire_lock(InterfaceTag::Cli).expect("lock");
    let before = read_tree(&repo.paths().state_dir);

    let state = repo.read_state().expect("state");
    let err = repo
        .commit_delta(
            &state,
            vec![ChangelogEvent::new(EventKind::RequirementDeleted {
                requirement_id: "REQ-AUTH-missing".to_string(),
                deleted_requirement: requirement("REQ-AUTH-missing", "auth"),
            })],
        )
        .expect_err("unknown requirement");
    assert!(matches!(err, StoreError::EventValidation { position: 0, .. }));
    assert_eq!(read_tree(&repo.paths().state_dir), before);
}

#[test]
fn lock_is_exclusive_across_handles_and_survives_commits() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &[]);
    let mut writer = open(temp.path());
    let mut other = open(temp.path());

    writer.acquire_lock(InterfaceTag::Cli).expect("writer lock");
    commit(&mut writer, vec![category_added(1, "ops")]);

    let err = other.acquire_lock(InterfaceTag::Web).expect_err("held");
    match err {
        StoreError::LockHeld { holder, .. } => {
            assert_eq!(holder.expect("holder").interface, InterfaceTag::Cli);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Readers are never blocked.
    assert!(
        other
            .read_state()
            .expect("read while locked")
            .categories
            .contains("ops")
    );

    writer.release_lock().expect("release");
    other.acquire_lock(InterfaceTag::Web).expect("after release");
}

#[test]
fn holder_whose_lock_was_taken_over_cannot_commit() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &[]);
    let mut hung = open(temp.path());
    hung.acquire_lock(InterfaceTag::Web).expect("lock");
    std::thread::sleep(Duration::from_millis(1100));

    let mut thief = Repository::open_with_liveness(
        temp.path(),
        StoreConfig {
            stale_lock_secs: 1,
            ..StoreConfig::default()
        },
        Arc::new(FakeLiveness::default()),
    )
    .expect("open");
    thief.acquire_lock(InterfaceTag::Cli).expect("takeover");
    assert!(!hung.holds_lock());

    let state = hung.read_state().expect("state");
    let events = vec![category_added(1, "ops")];
    let expected = expected_after(&state, &events);
    match hung.commit_delta(&expected, events).expect_err("lock lost") {
        StoreError::LockHeld { holder, .. } => {
            assert_eq!(holder.expect("holder").interface, InterfaceTag::Cli);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(hung.read_changelog().expect("changelog").is_empty());

    commit(&mut thief, vec![category_added(2, "ui")]);
    assert!(thief.holds_lock());
    assert_eq!(thief.read_changelog().expect("changelog").len(), 1);
}

#[test]
fn readers_only_see_whole_commits_while_a_writer_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path(), &[]);
    let mut writer = Repository::open_with_liveness(
        temp.path(),
        StoreConfig {
            snapshot_interval: 1,
            ..StoreConfig::default()
        },
        Arc::new(FakeLiveness::default()),
    )
    .expect("open writer");
    writer.acquire_lock(InterfaceTag::Cli).expect("lock");
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let repo = open(temp.path());
            let mut last = 0;
            let mut reads = 0;
            loop {
                let finished = done.load(Ordering::Acquire);
                let state = repo.read_state().expect("read during commits");
                let seen = state.categories.len();
                assert!(seen >= last, "state went backwards: {seen} < {last}");
                let changelog = repo.read_changelog().expect("changelog during commits");
                assert!(changelog.len() >= seen);
                last = seen;
                reads += 1;
                if finished {
                    return (reads, last);
                }
            }
        });

        for n in 0..40 {
            commit(&mut writer, vec![category_added(n, &format!("cat-{n:03}"))]);
        }
        done.store(true, Ordering::Release);

        let (reads, last) = reader.join().expect("reader");
        assert!(reads > 0);
        assert_eq!(last, 40);
    });
}
