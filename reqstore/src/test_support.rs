//! Test-only builders for specifications, events and process liveness.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::core::events::{
    ChangelogEvent, EventKind, FieldChange, MetadataField, RequirementField,
};
use crate::core::types::{AcceptanceCriterion, EarsType, Priority, Requirement, Specification};
use crate::io::liveness::ProcessLiveness;

/// Hostname reported by [`FakeLiveness`] unless overridden.
pub const FAKE_HOSTNAME: &str = "test-host";

/// Deterministic timestamp `secs` seconds after 2026-01-01T00:00:00Z.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_767_225_600 + secs, 0)
        .single()
        .expect("valid timestamp")
}

/// Empty specification at version 0.1.0 with no categories.
pub fn genesis() -> Specification {
    Specification::new("demo", "demo project", ts(0))
}

pub fn behavioral(id: &str) -> AcceptanceCriterion {
    AcceptanceCriterion::Behavioral {
        id: id.to_string(),
        given: "a registered user".to_string(),
        when: "they submit valid credentials".to_string(),
        then: "a session is created".to_string(),
        created_at: ts(0),
    }
}

pub fn assertion(id: &str) -> AcceptanceCriterion {
    AcceptanceCriterion::Assertion {
        id: id.to_string(),
        statement: format!("{} holds", id),
        created_at: ts(0),
    }
}

/// Medium-priority ubiquitous requirement with one behavioral criterion
/// (`<id>-AC-1`).
pub fn requirement(id: &str, category: &str) -> Requirement {
    Requirement {
        id: id.to_string(),
        ears_type: EarsType::Ubiquitous,
        category: category.to_string(),
        description: format!("{} description", id),
        rationale: format!("{} rationale", id),
        acceptance_criteria: vec![behavioral(&format!("{}-AC-1", id))],
        priority: Priority::Medium,
        created_at: ts(0),
    }
}

/// Event with id `evt-<secs>` at `ts(secs)`.
pub fn event(secs: i64, kind: EventKind) -> ChangelogEvent {
    ChangelogEvent::at(format!("evt-{}", secs), ts(secs), kind)
}

pub fn added(secs: i64, requirement: Requirement) -> ChangelogEvent {
    event(secs, EventKind::RequirementAdded { requirement })
}

pub fn category_added(secs: i64, category: &str) -> ChangelogEvent {
    event(
        secs,
        EventKind::CategoryAdded {
            category: category.to_string(),
        },
    )
}

pub fn bump(secs: i64, old_version: &str, new_version: &str) -> ChangelogEvent {
    event(
        secs,
        EventKind::VersionBumped {
            old_version: old_version.to_string(),
            new_version: new_version.to_string(),
        },
    )
}

/// One instance of every event kind, in `EVENT_TYPES` order.
pub fn all_event_kinds() -> Vec<EventKind> {
    let req = requirement("REQ-AUTH-a8b2f91k", "auth");
    vec![
        EventKind::RequirementAdded {
            requirement: req.clone(),
        },
        EventKind::RequirementDeleted {
            requirement_id: req.id.clone(),
            deleted_requirement: req.clone(),
        },
        EventKind::RequirementModified {
            requirement_id: req.id.clone(),
            changes: vec![FieldChange {
                field: RequirementField::EarsType,
                old_value: "ubiquitous".to_string(),
                new_value: "event".to_string(),
            }],
        },
        EventKind::RequirementRecategorized {
            requirement_id: req.id.clone(),
            old_category: "auth".to_string(),
            new_category: "security".to_string(),
        },
        EventKind::AcceptanceCriterionAdded {
            requirement_id: req.id.clone(),
            criterion: assertion("AC-2"),
        },
        EventKind::AcceptanceCriterionModified {
            requirement_id: req.id.clone(),
            criterion_id: "AC-2".to_string(),
            old_criterion: assertion("AC-2"),
            new_criterion: behavioral("AC-2"),
        },
        EventKind::AcceptanceCriterionDeleted {
            requirement_id: req.id.clone(),
            criterion_id: "AC-2".to_string(),
            deleted_criterion: behavioral("AC-2"),
        },
        EventKind::ProjectMetadataUpdated {
            field: MetadataField::Description,
            old_value: "demo project".to_string(),
            new_value: "requirements for demo".to_string(),
        },
        EventKind::CategoryAdded {
            category: "ops".to_string(),
        },
        EventKind::CategoryDeleted {
            category: "ops".to_string(),
        },
        EventKind::VersionBumped {
            old_version: "0.1.0".to_string(),
            new_version: "0.2.0".to_string(),
        },
    ]
}

/// Scripted liveness: this process and any pid in `alive` are running.
#[derive(Debug, Clone)]
pub struct FakeLiveness {
    pub hostname: String,
    pub alive: HashSet<u32>,
}

impl Default for FakeLiveness {
    fn default() -> Self {
        Self {
            hostname: FAKE_HOSTNAME.to_string(),
            alive: HashSet::new(),
        }
    }
}

impl ProcessLiveness for FakeLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        pid == std::process::id() || self.alive.contains(&pid)
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }
}

/// Every regular file under `dir`, keyed by relative path.
pub fn read_tree(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    collect(dir, dir, &mut files);
    files
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            collect(root, &path, files);
        } else {
            let relative = path.strip_prefix(root).expect("under root").to_path_buf();
            files.insert(relative, fs::read(&path).expect("read file"));
        }
    }
}
