//! Structural invariants of a specification.

use std::collections::HashSet;

use super::types::{MAX_ACCEPTANCE_CRITERIA, Specification};

/// Check invariants that the type system cannot express:
/// - No duplicate requirement ids
/// - Every requirement's category is a declared category
/// - 1..=10 acceptance criteria per requirement, ids unique within it
///
/// Returns stable messages in requirement order.
pub fn validate_specification(spec: &Specification) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for req in &spec.requirements {
        if !seen.insert(req.id.as_str()) {
            errors.push(format!("duplicate requirement id '{}'", req.id));
        }

        if !spec.categories.contains(&req.category) {
            errors.push(format!(
                "{}: category '{}' is not declared",
                req.id, req.category
            ));
        }

        let count = req.acceptance_criteria.len();
        if count == 0 || count > MAX_ACCEPTANCE_CRITERIA {
            errors.push(format!(
                "{}: {} acceptance criteria (expected 1..={})",
                req.id, count, MAX_ACCEPTANCE_CRITERIA
            ));
        }

        let mut criteria = HashSet::new();
        for ac in &req.acceptance_criteria {
            if !criteria.insert(ac.id()) {
                errors.push(format!(
                    "{}: duplicate acceptance criterion id '{}'",
                    req.id,
                    ac.id()
                ));
            }
        }
    }

    errors
}
