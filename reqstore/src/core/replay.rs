//! Deterministic replay of changelog events onto a specification.
//!
//! `apply_event` is the single definition of what each event means. It both
//! validates an event against the state it is applied to and performs the
//! mutation, so append-time validation and reconstruction cannot drift apart.

use super::events::{ChangelogEvent, EventKind, FieldChange, MetadataField, RequirementField};
use super::types::{MAX_ACCEPTANCE_CRITERIA, Specification};

/// Replay failure at a specific position in an event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayError {
    /// Offset into the slice passed to `replay`.
    pub offset: usize,
    pub event_id: String,
    pub reason: String,
}

/// Apply `events` in order to `base`, returning the resulting specification.
///
/// Stops at the first event that does not apply cleanly.
pub fn replay(base: Specification, events: &[ChangelogEvent]) -> Result<Specification, ReplayError> {
    let mut state = base;
    for (offset, event) in events.iter().enumerate() {
        apply_event(&mut state, event).map_err(|reason| ReplayError {
            offset,
            event_id: event.event_id.clone(),
            reason,
        })?;
    }
    Ok(state)
}

/// Validate `event` against `spec` and apply it.
///
/// On error `spec` is left unchanged.
pub fn apply_event(spec: &mut Specification, event: &ChangelogEvent) -> Result<(), String> {
    match &event.kind {
        EventKind::RequirementAdded { requirement } => {
            if spec.requirement(&requirement.id).is_some() {
                return Err(format!("requirement '{}' already exists", requirement.id));
            }
            if !spec.categories.contains(&requirement.category) {
                return Err(format!(
                    "requirement '{}' uses unknown category '{}'",
                    requirement.id, requirement.category
                ));
            }
            let count = requirement.acceptance_criteria.len();
            if count == 0 || count > MAX_ACCEPTANCE_CRITERIA {
                return Err(format!(
                    "requirement '{}' has {} acceptance criteria (expected 1..={})",
                    requirement.id, count, MAX_ACCEPTANCE_CRITERIA
                ));
            }
            if let Some(dup) = first_duplicate(
                requirement
                    .acceptance_criteria
                    .iter()
                    .map(|ac| ac.id()),
            ) {
                return Err(format!(
                    "requirement '{}' repeats acceptance criterion '{}'",
                    requirement.id, dup
                ));
            }
            spec.requirements.push(requirement.clone());
        }
        EventKind::RequirementDeleted {
            requirement_id,
            deleted_requirement,
        } => {
            let idx = requirement_index(spec, requirement_id)?;
            if spec.requirements[idx] != *deleted_requirement {
                return Err(format!(
                    "deleted snapshot of '{}' does not match current requirement",
                    requirement_id
                ));
            }
            spec.requirements.remove(idx);
        }
        EventKind::RequirementModified {
            requirement_id,
            changes,
        } => {
            if changes.is_empty() {
                return Err(format!("modification of '{}' has no changes", requirement_id));
            }
            let idx = requirement_index(spec, requirement_id)?;
            let mut updated = spec.requirements[idx].clone();
            for change in changes {
                apply_field_change(&mut updated, change)?;
            }
            spec.requirements[idx] = updated;
        }
        EventKind::RequirementRecategorized {
            requirement_id,
            old_category,
            new_category,
        } => {
            if !spec.categories.contains(new_category) {
                return Err(format!("unknown category '{}'", new_category));
            }
            let idx = requirement_index(spec, requirement_id)?;
            let requirement = &mut spec.requirements[idx];
            if requirement.category != *old_category {
                return Err(format!(
                    "requirement '{}' is in '{}', not '{}'",
                    requirement_id, requirement.category, old_category
                ));
            }
            requirement.category = new_category.clone();
        }
        EventKind::AcceptanceCriterionAdded {
            requirement_id,
            criterion,
        } => {
            let idx = requirement_index(spec, requirement_id)?;
            let requirement = &mut spec.requirements[idx];
            if requirement.criterion(criterion.id()).is_some() {
                return Err(format!(
                    "acceptance criterion '{}' already exists on '{}'",
                    criterion.id(),
                    requirement_id
                ));
            }
            if requirement.acceptance_criteria.len() >= MAX_ACCEPTANCE_CRITERIA {
                return Err(format!(
                    "requirement '{}' already has {} acceptance criteria",
                    requirement_id, MAX_ACCEPTANCE_CRITERIA
                ));
            }
            requirement.acceptance_criteria.push(criterion.clone());
        }
        EventKind::AcceptanceCriterionModified {
            requirement_id,
            criterion_id,
            old_criterion,
            new_criterion,
        } => {
            if new_criterion.id() != criterion_id {
                return Err(format!(
                    "modified criterion id '{}' does not match '{}'",
                    new_criterion.id(),
                    criterion_id
                ));
            }
            let idx = requirement_index(spec, requirement_id)?;
            let requirement = &mut spec.requirements[idx];
            let slot = requirement
                .acceptance_criteria
                .iter_mut()
                .find(|ac| ac.id() == criterion_id)
                .ok_or_else(|| missing_criterion(requirement_id, criterion_id))?;
            if slot != old_criterion {
                return Err(format!(
                    "previous value of criterion '{}' does not match current state",
                    criterion_id
                ));
            }
            *slot = new_criterion.clone();
        }
        EventKind::AcceptanceCriterionDeleted {
            requirement_id,
            criterion_id,
            deleted_criterion,
        } => {
            let idx = requirement_index(spec, requirement_id)?;
            let requirement = &mut spec.requirements[idx];
            let pos = requirement
                .acceptance_criteria
                .iter()
                .position(|ac| ac.id() == criterion_id)
                .ok_or_else(|| missing_criterion(requirement_id, criterion_id))?;
            if requirement.acceptance_criteria[pos] != *deleted_criterion {
                return Err(format!(
                    "deleted snapshot of criterion '{}' does not match current state",
                    criterion_id
                ));
            }
            if requirement.acceptance_criteria.len() == 1 {
                return Err(format!(
                    "cannot delete the last acceptance criterion of '{}'",
                    requirement_id
                ));
            }
            requirement.acceptance_criteria.remove(pos);
        }
        EventKind::ProjectMetadataUpdated {
            field,
            old_value,
            new_value,
        } => {
            let slot = match field {
                MetadataField::Name => &mut spec.metadata.name,
                MetadataField::Description => &mut spec.metadata.description,
            };
            expect_value("project metadata", slot, old_value)?;
            *slot = new_value.clone();
        }
        EventKind::CategoryAdded { category } => {
            if category.trim().is_empty() {
                return Err("category name must not be empty".to_string());
            }
            if !spec.categories.insert(category.clone()) {
                return Err(format!("category '{}' already exists", category));
            }
        }
        EventKind::CategoryDeleted { category } => {
            if !spec.categories.contains(category) {
                return Err(format!("unknown category '{}'", category));
            }
            let used = spec.category_usage(category);
            if used > 0 {
                return Err(format!(
                    "category '{}' is still used by {} requirement(s)",
                    category, used
                ));
            }
            spec.categories.remove(category);
        }
        EventKind::VersionBumped {
            old_version,
            new_version,
        } => {
            expect_value("version", &spec.metadata.version, old_version)?;
            if new_version == old_version {
                return Err(format!("version bump to the same version '{}'", new_version));
            }
            spec.metadata.version = new_version.clone();
        }
    }

    spec.metadata.updated_at = event.timestamp;
    Ok(())
}

fn apply_field_change(
    requirement: &mut super::types::Requirement,
    change: &FieldChange,
) -> Result<(), String> {
    let label = format!("{} of '{}'", field_name(change.field), requirement.id);
    match change.field {
        RequirementField::Description => {
            expect_value(&label, &requirement.description, &change.old_value)?;
            requirement.description = change.new_value.clone();
        }
        RequirementField::Rationale => {
            expect_value(&label, &requirement.rationale, &change.old_value)?;
            requirement.rationale = change.new_value.clone();
        }
        RequirementField::Priority => {
            expect_value(&label, requirement.priority.as_str(), &change.old_value)?;
            requirement.priority = change.new_value.parse()?;
        }
        RequirementField::EarsType => {
            expect_value(&label, requirement.ears_type.as_str(), &change.old_value)?;
            requirement.ears_type = change.new_value.parse()?;
        }
    }
    Ok(())
}

fn field_name(field: RequirementField) -> &'static str {
    match field {
        RequirementField::Description => "description",
        RequirementField::Rationale => "rationale",
        RequirementField::Priority => "priority",
        RequirementField::EarsType => "ears_type",
    }
}

fn expect_value(label: &str, current: &str, expected: &str) -> Result<(), String> {
    if current != expected {
        return Err(format!(
            "{} is '{}' but event expects '{}'",
            label, current, expected
        ));
    }
    Ok(())
}

fn requirement_index(spec: &Specification, id: &str) -> Result<usize, String> {
    spec.requirements
        .iter()
        .position(|req| req.id == id)
        .ok_or_else(|| format!("requirement '{}' does not exist", id))
}

fn missing_criterion(requirement_id: &str, criterion_id: &str) -> String {
    format!(
        "acceptance criterion '{}' does not exist on '{}'",
        criterion_id, requirement_id
    )
}

fn first_duplicate<'a>(ids: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().find(|id| !seen.insert(*id))
}
