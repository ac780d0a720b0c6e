//! Profile conformance validation
//!
//! Validates a resource against the profiles declared in `meta.profile` (or
//! the explicit profile list from [`crate::ProfilesPlan`]), checking the
//! cardinality and required-type constraints a profile's differential adds
//! on top of the base resource type. Base-type structural validation itself
//! is the Schema step's job; this step only checks what a *profile* adds.

use crate::validator::{IssueCode, ValidationIssue};
use crate::ProfilesPlan;
use ferrum_context::FhirContext;
use ferrum_models::common::element_definition::ElementDefinition;
use ferrum_fhirpath::Engine as FhirPathEngine;
use ferrum_snapshot::ExpandedFhirContext;
use serde_json::Value;
use std::sync::Arc;

/// `_fhirpath_engine` is accepted (but unused today) so slicing discriminators
/// can be evaluated here once profile slicing support lands, without changing
/// this function's signature again.
pub fn validate_profiles<C: FhirContext>(
    resource: &Value,
    plan: &ProfilesPlan,
    context: &C,
    _fhirpath_engine: &Arc<FhirPathEngine>,
    issues: &mut Vec<ValidationIssue>,
) {
    let profile_urls =
        context.resolve_validation_profiles(resource, plan.explicit_profiles.as_deref());

    if profile_urls.is_empty() {
        return;
    }

    let expanded = ExpandedFhirContext::borrowed(context);

    for profile_url in profile_urls {
        let profile_def = match expanded.get_structure_definition(&profile_url) {
            Ok(Some(sd)) => sd,
            Ok(None) => {
                issues.push(
                    ValidationIssue::error(
                        IssueCode::NotFound,
                        format!("Profile '{}' could not be resolved", profile_url),
                    )
                    .with_location("Resource.meta.profile".to_string()),
                );
                continue;
            }
            Err(err) => {
                issues.push(ValidationIssue::information(
                    IssueCode::Processing,
                    format!("Error resolving profile '{}': {}", profile_url, err),
                ));
                continue;
            }
        };

        let Some(snapshot) = profile_def.snapshot.as_ref() else {
            continue;
        };

        for element in &snapshot.element {
            check_element_against_profile(resource, element, &profile_url, issues);
        }
    }
}

/// Checks a single profile element's cardinality against the instance.
/// Profiles only ever narrow cardinality relative to the base type, so a
/// `min` of 1 or more here is a profile-specific requirement worth
/// reporting even though it passed the base Schema step.
fn check_element_against_profile(
    resource: &Value,
    element: &ElementDefinition,
    profile_url: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(min) = element.min else {
        return;
    };
    if min == 0 {
        return;
    }

    let segments: Vec<&str> = element.path.split('.').skip(1).collect();
    if segments.is_empty() {
        return;
    }

    let count = count_at_path(resource, &segments);
    if count < min as usize {
        issues.push(
            ValidationIssue::error(
                IssueCode::Required,
                format!(
                    "Element '{}' is required by profile '{}' (min={}, found={})",
                    element.path, profile_url, min, count
                ),
            )
            .with_location(element.path.clone()),
        );
    }
}

fn count_at_path(resource: &Value, segments: &[&str]) -> usize {
    let mut current = resource;
    for (i, segment) in segments.iter().enumerate() {
        let key = segment.trim_end_matches("[x]");
        let Some(next) = current.get(key).or_else(|| {
            // choice type: look for any concrete valueX-style key sharing the base name
            current.as_object().and_then(|obj| {
                obj.iter()
                    .find(|(k, _)| k.starts_with(key) && k.len() > key.len())
                    .map(|(_, v)| v)
            })
        }) else {
            return 0;
        };

        if i == segments.len() - 1 {
            return match next {
                Value::Array(arr) => arr.len(),
                Value::Null => 0,
                _ => 1,
            };
        }

        current = match next {
            Value::Array(arr) => match arr.first() {
                Some(v) => v,
                None => return 0,
            },
            other => other,
        };
    }
    0
}
