//! Changelog event vocabulary.
//!
//! Events are serialized as flat maps: the common envelope (`event_id`,
//! `timestamp`) plus an `event_type` discriminator that selects the payload
//! shape on decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{AcceptanceCriterion, Requirement};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ChangelogEvent {
    /// Wrap `kind` with a fresh random id and the current time.
    pub fn new(kind: EventKind) -> Self {
        Self::at(format!("evt-{}", Uuid::new_v4()), Utc::now(), kind)
    }

    pub fn at(event_id: impl Into<String>, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp,
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    RequirementAdded {
        requirement: Requirement,
    },
    RequirementDeleted {
        requirement_id: String,
        deleted_requirement: Requirement,
    },
    RequirementModified {
        requirement_id: String,
        changes: Vec<FieldChange>,
    },
    RequirementRecategorized {
        requirement_id: String,
        old_category: String,
        new_category: String,
    },
    AcceptanceCriterionAdded {
        requirement_id: String,
        criterion: AcceptanceCriterion,
    },
    AcceptanceCriterionModified {
        requirement_id: String,
        criterion_id: String,
        old_criterion: AcceptanceCriterion,
        new_criterion: AcceptanceCriterion,
    },
    AcceptanceCriterionDeleted {
        requirement_id: String,
        criterion_id: String,
        deleted_criterion: AcceptanceCriterion,
    },
    ProjectMetadataUpdated {
        field: MetadataField,
        old_value: String,
        new_value: String,
    },
    CategoryAdded {
        category: String,
    },
    CategoryDeleted {
        category: String,
    },
    VersionBumped {
        old_version: String,
        new_version: String,
    },
}

impl EventKind {
    /// The serialized `event_type` discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequirementAdded { .. } => "requirement_added",
            Self::RequirementDeleted { .. } => "requirement_deleted",
            Self::RequirementModified { .. } => "requirement_modified",
            Self::RequirementRecategorized { .. } => "requirement_recategorized",
            Self::AcceptanceCriterionAdded { .. } => "acceptance_criterion_added",
            Self::AcceptanceCriterionModified { .. } => "acceptance_criterion_modified",
            Self::AcceptanceCriterionDeleted { .. } => "acceptance_criterion_deleted",
            Self::ProjectMetadataUpdated { .. } => "project_metadata_updated",
            Self::CategoryAdded { .. } => "category_added",
            Self::CategoryDeleted { .. } => "category_deleted",
            Self::VersionBumped { .. } => "version_bumped",
        }
    }

    /// Requirement this event touches, if any.
    pub fn requirement_id(&self) -> Option<&str> {
        match self {
            Self::RequirementAdded { requirement } => Some(&requirement.id),
            Self::RequirementDeleted { requirement_id, .. }
            | Self::RequirementModified { requirement_id, .. }
            | Self::RequirementRecategorized { requirement_id, .. }
            | Self::AcceptanceCriterionAdded { requirement_id, .. }
            | Self::AcceptanceCriterionModified { requirement_id, .. }
            | Self::AcceptanceCriterionDeleted { requirement_id, .. } => Some(requirement_id),
            Self::ProjectMetadataUpdated { .. }
            | Self::CategoryAdded { .. }
            | Self::CategoryDeleted { .. }
            | Self::VersionBumped { .. } => None,
        }
    }
}

/// All `event_type` values, in declaration order.
pub const EVENT_TYPES: [&str; 11] = [
    "requirement_added",
    "requirement_deleted",
    "requirement_modified",
    "requirement_recategorized",
    "acceptance_criterion_added",
    "acceptance_criterion_modified",
    "acceptance_criterion_deleted",
    "project_metadata_updated",
    "category_added",
    "category_deleted",
    "version_bumped",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: RequirementField,
    pub old_value: String,
    pub new_value: String,
}

/// Requirement fields editable through `requirement_modified`.
///
/// Category and acceptance criteria have dedicated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementField {
    Description,
    Rationale,
    Priority,
    EarsType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Name,
    Description,
}
