//! Requirement document model.
//!
//! These types are the persisted YAML shape of `specification.yaml` and of the
//! `reconstructed_state` inside snapshots. They carry no I/O and compare by value
//! so replay results can be checked structurally.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on acceptance criteria per requirement.
pub const MAX_ACCEPTANCE_CRITERIA: usize = 10;

/// Version assigned to freshly initialized projects.
pub const INITIAL_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The full requirement document for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    pub metadata: ProjectMetadata,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
}

impl Specification {
    /// Empty specification at `INITIAL_VERSION`.
    pub fn new(name: &str, description: &str, now: DateTime<Utc>) -> Self {
        Self {
            metadata: ProjectMetadata {
                name: name.to_string(),
                description: description.to_string(),
                version: INITIAL_VERSION.to_string(),
                created_at: now,
                updated_at: now,
            },
            requirements: Vec::new(),
            categories: BTreeSet::new(),
        }
    }

    pub fn requirement(&self, id: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|req| req.id == id)
    }

    /// Number of requirements filed under `category`.
    pub fn category_usage(&self, category: &str) -> usize {
        self.requirements
            .iter()
            .filter(|req| req.category == category)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarsType {
    Ubiquitous,
    Event,
    State,
    Optional,
}

impl EarsType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ubiquitous => "ubiquitous",
            Self::Event => "event",
            Self::State => "state",
            Self::Optional => "optional",
        }
    }
}

impl FromStr for EarsType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ubiquitous" => Ok(Self::Ubiquitous),
            "event" => Ok(Self::Event),
            "state" => Ok(Self::State),
            "optional" => Ok(Self::Optional),
            other => Err(format!("unknown EARS type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub ears_type: EarsType,
    pub category: String,
    pub description: String,
    pub rationale: String,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl Requirement {
    pub fn criterion(&self, id: &str) -> Option<&AcceptanceCriterion> {
        self.acceptance_criteria.iter().find(|ac| ac.id() == id)
    }
}

/// Acceptance criterion, discriminated by `type` in the serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcceptanceCriterion {
    Behavioral {
        id: String,
        given: String,
        when: String,
        then: String,
        created_at: DateTime<Utc>,
    },
    Assertion {
        id: String,
        statement: String,
        created_at: DateTime<Utc>,
    },
}

impl AcceptanceCriterion {
    pub fn id(&self) -> &str {
        match self {
            Self::Behavioral { id, .. } | Self::Assertion { id, .. } => id,
        }
    }

}

impl fmt::Display for AcceptanceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Behavioral {
                given, when, then, ..
            } => write!(f, "GIVEN {} WHEN {} THEN {}", given, when, then),
            Self::Assertion { statement, .. } => write!(f, "{}", statement),
        }
    }
}
