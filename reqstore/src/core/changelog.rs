//! Append-only changelog with derived indexes and snapshot cadence.
//!
//! Everything here is in-memory and deterministic; `io::event_log` decides
//! where the results are persisted.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{ChangelogEvent, EventKind};
use super::replay::{ReplayError, apply_event, replay};
use super::types::Specification;
use crate::error::{Result, StoreError};

/// On-disk format version for `changelog.yaml` and snapshot files.
pub const FORMAT_VERSION: &str = "1.0";

/// Event positions keyed by requirement id, event type and category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogIndexes {
    #[serde(default)]
    pub by_requirement: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub by_type: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub by_category: BTreeMap<String, Vec<usize>>,
}

impl ChangelogIndexes {
    /// Rebuild all indexes from scratch by scanning `events` in order.
    pub fn rebuild(events: &[ChangelogEvent]) -> Self {
        let mut indexes = Self::default();
        let mut categories = HashMap::new();
        for (position, event) in events.iter().enumerate() {
            indexes.record(position, event, &mut categories);
        }
        indexes
    }

    /// Index a single event at `position`.
    ///
    /// `categories` tracks the category of each requirement as of the events
    /// seen so far, so events that only name a requirement still land in the
    /// right category bucket.
    fn record(
        &mut self,
        position: usize,
        event: &ChangelogEvent,
        categories: &mut HashMap<String, String>,
    ) {
        self.by_type
            .entry(event.event_type().to_string())
            .or_default()
            .push(position);

        if let Some(requirement_id) = event.kind.requirement_id() {
            self.by_requirement
                .entry(requirement_id.to_string())
                .or_default()
                .push(position);
        }

        let touched: Vec<String> = match &event.kind {
            EventKind::RequirementAdded { requirement } => {
                categories.insert(requirement.id.clone(), requirement.category.clone());
                vec![requirement.category.clone()]
            }
            EventKind::RequirementDeleted {
                requirement_id,
                deleted_requirement,
            } => {
                categories.remove(requirement_id);
                vec![deleted_requirement.category.clone()]
            }
            EventKind::RequirementRecategorized {
                requirement_id,
                old_category,
                new_category,
            } => {
                categories.insert(requirement_id.clone(), new_category.clone());
                vec![old_category.clone(), new_category.clone()]
            }
            EventKind::CategoryAdded { category } | EventKind::CategoryDeleted { category } => {
                vec![category.clone()]
            }
            EventKind::RequirementModified { requirement_id, .. }
            | EventKind::AcceptanceCriterionAdded { requirement_id, .. }
            | EventKind::AcceptanceCriterionModified { requirement_id, .. }
            | EventKind::AcceptanceCriterionDeleted { requirement_id, .. } => categories
                .get(requirement_id)
                .cloned()
                .into_iter()
                .collect(),
            EventKind::ProjectMetadataUpdated { .. } | EventKind::VersionBumped { .. } => {
                Vec::new()
            }
        };
        for category in touched {
            self.by_category.entry(category).or_default().push(position);
        }
    }
}

/// Materialized state at a given changelog position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub taken_at: DateTime<Utc>,
    pub event_count_at_snapshot: usize,
    pub reconstructed_state: Specification,
}

/// Persisted changelog (`changelog.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changelog {
    pub version: String,
    /// State before the first event; the replay base when no snapshot exists.
    pub genesis: Specification,
    #[serde(default)]
    pub events: Vec<ChangelogEvent>,
    #[serde(default)]
    pub last_snapshot_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events_since_snapshot: usize,
    #[serde(default)]
    pub indexes: ChangelogIndexes,
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Positions assigned to the appended events, in order.
    pub positions: Vec<usize>,
    /// Snapshots that fell due during this append.
    pub snapshots: Vec<Snapshot>,
    /// State after the last appended event.
    pub state: Specification,
}

impl Changelog {
    pub fn new(genesis: Specification) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            genesis,
            events: Vec::new(),
            last_snapshot_at: None,
            events_since_snapshot: 0,
            indexes: ChangelogIndexes::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append `events` on top of `current` (the reconstructed state at the end
    /// of the log).
    ///
    /// The whole batch is validated before anything is recorded. A snapshot is
    /// produced each time `events_since_snapshot` reaches `snapshot_interval`.
    pub fn append(
        &mut self,
        current: Specification,
        events: Vec<ChangelogEvent>,
        snapshot_interval: usize,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let interval = snapshot_interval.max(1);
        let base_len = self.events.len();

        let mut seen: HashSet<&str> = self.events.iter().map(|e| e.event_id.as_str()).collect();
        for (offset, event) in events.iter().enumerate() {
            if !seen.insert(event.event_id.as_str()) {
                return Err(StoreError::EventValidation {
                    position: base_len + offset,
                    event_id: event.event_id.clone(),
                    reason: "duplicate event id".to_string(),
                });
            }
        }

        let mut state = current;
        let mut since = self.events_since_snapshot;
        let mut snapshots = Vec::new();
        for (offset, event) in events.iter().enumerate() {
            let position = base_len + offset;
            apply_event(&mut state, event).map_err(|reason| StoreError::EventValidation {
                position,
                event_id: event.event_id.clone(),
                reason,
            })?;
            since += 1;
            if since >= interval {
                snapshots.push(Snapshot {
                    version: FORMAT_VERSION.to_string(),
                    taken_at: now,
                    event_count_at_snapshot: position + 1,
                    reconstructed_state: state.clone(),
                });
                since = 0;
            }
        }

        let mut categories = category_map(&self.events);
        let mut positions = Vec::with_capacity(events.len());
        for event in events {
            let position = self.events.len();
            self.indexes.record(position, &event, &mut categories);
            self.events.push(event);
            positions.push(position);
        }
        self.events_since_snapshot = since;
        if !snapshots.is_empty() {
            self.last_snapshot_at = Some(now);
        }

        Ok(AppendOutcome {
            positions,
            snapshots,
            state,
        })
    }

    /// Events recorded for `requirement_id`, in log order.
    pub fn events_for_requirement(&self, requirement_id: &str) -> Vec<&ChangelogEvent> {
        self.lookup(self.indexes.by_requirement.get(requirement_id))
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<&ChangelogEvent> {
        self.lookup(self.indexes.by_type.get(event_type))
    }

    pub fn events_in_category(&self, category: &str) -> Vec<&ChangelogEvent> {
        self.lookup(self.indexes.by_category.get(category))
    }

    fn lookup(&self, positions: Option<&Vec<usize>>) -> Vec<&ChangelogEvent> {
        positions
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|pos| self.events.get(*pos))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace stored indexes with a rebuild; returns true if they differed.
    pub fn reindex(&mut self) -> bool {
        let rebuilt = ChangelogIndexes::rebuild(&self.events);
        if rebuilt == self.indexes {
            return false;
        }
        self.indexes = rebuilt;
        true
    }
}

/// Requirement → category map as of the end of `events`.
fn category_map(events: &[ChangelogEvent]) -> HashMap<String, String> {
    let mut categories = HashMap::new();
    let mut scratch = ChangelogIndexes::default();
    for (position, event) in events.iter().enumerate() {
        scratch.record(position, event, &mut categories);
    }
    categories
}

/// Rebuild current state from the latest snapshot (if any) plus the events
/// recorded after it.
///
/// Pure: equal inputs always produce equal output.
pub fn reconstruct(
    genesis: &Specification,
    snapshot: Option<&Snapshot>,
    events: &[ChangelogEvent],
) -> Result<Specification> {
    let (base, start) = match snapshot {
        Some(snapshot) => {
            if snapshot.event_count_at_snapshot > events.len() {
                return Err(StoreError::ReconstructionInconsistency {
                    reason: format!(
                        "snapshot covers {} events but the changelog only has {}",
                        snapshot.event_count_at_snapshot,
                        events.len()
                    ),
                });
            }
            (
                snapshot.reconstructed_state.clone(),
                snapshot.event_count_at_snapshot,
            )
        }
        None => (genesis.clone(), 0),
    };

    replay(base, &events[start..]).map_err(|err: ReplayError| {
        StoreError::ReconstructionInconsistency {
            reason: format!(
                "event {} at position {} does not apply: {}",
                err.event_id,
                start + err.offset,
                err.reason
            ),
        }
    })
}
