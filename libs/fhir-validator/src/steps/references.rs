//! Reference target-type validation
//!
//! Rides [`ElementWalker`] looking for `Reference`-typed nodes, extracts the
//! resource type the reference actually points at, and checks it against
//! the declared `targetProfile[]` on that element.

use std::collections::HashMap;

use ferrum_context::FhirContext;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::resolver::TypeResolver;
use crate::validator::{IssueCode, ValidationIssue};
use crate::walk::{ElementWalker, WalkContext, WalkControl};

const CORE_PREFIX: &str = "http://hl7.org/fhir/StructureDefinition/";

pub fn validate_references<C: FhirContext>(
    resource: &Value,
    resolver: &TypeResolver<C>,
    cancellation: &CancellationToken,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(resource_type) = resource.get("resourceType").and_then(|v| v.as_str()) else {
        return;
    };

    let contained_types = index_contained(resource);
    let bundle_index = if resource_type == "Bundle" {
        index_bundle(resource)
    } else {
        HashMap::new()
    };

    let walker = ElementWalker::new(resolver);
    let mut visitor = |ctx: &WalkContext| -> WalkControl {
        if ctx.type_name.as_deref() != Some("Reference") {
            return WalkControl::Continue;
        }

        let Some(reference) = ctx.node.get("reference").and_then(|v| v.as_str()) else {
            return WalkControl::Continue;
        };

        let Some(candidate_type) = extract_target_type(reference, &contained_types, &bundle_index) else {
            return WalkControl::Continue;
        };

        let allowed = allowed_target_types(ctx);
        if !allowed.is_empty() && !allowed.contains("Resource") && !allowed.contains(&candidate_type) {
            issues.push(
                ValidationIssue::error(
                    IssueCode::ReferenceTargetType,
                    format!(
                        "Reference target type '{}' is not one of the allowed types ({})",
                        candidate_type,
                        allowed.into_iter().collect::<Vec<_>>().join(", ")
                    ),
                )
                .with_location(ctx.path.clone()),
            );
        }

        WalkControl::Continue
    };

    walker.walk(resource, resource_type, cancellation, &mut visitor);
}

fn index_contained(resource: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(contained) = resource.get("contained").and_then(|v| v.as_array()) {
        for entry in contained {
            if let (Some(id), Some(rt)) = (
                entry.get("id").and_then(|v| v.as_str()),
                entry.get("resourceType").and_then(|v| v.as_str()),
            ) {
                map.insert(id.to_string(), rt.to_string());
            }
        }
    }
    map
}

fn index_bundle(bundle: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(entries) = bundle.get("entry").and_then(|v| v.as_array()) {
        for entry in entries {
            let full_url = entry.get("fullUrl").and_then(|v| v.as_str());
            let resource_type = entry
                .get("resource")
                .and_then(|r| r.get("resourceType"))
                .and_then(|v| v.as_str());
            if let (Some(url), Some(rt)) = (full_url, resource_type) {
                map.insert(url.to_string(), rt.to_string());
            }
        }
    }
    map
}

fn extract_target_type(
    reference: &str,
    contained_types: &HashMap<String, String>,
    bundle_index: &HashMap<String, String>,
) -> Option<String> {
    if let Some(local_id) = reference.strip_prefix('#') {
        return contained_types.get(local_id).cloned();
    }

    if reference.starts_with("urn:uuid:") || reference.starts_with("urn:oid:") {
        return bundle_index.get(reference).cloned();
    }

    let mut segments = reference.rsplit('/');
    let _id = segments.next()?;
    let type_segment = segments.next()?;
    type_segment
        .chars()
        .next()
        .filter(|c| c.is_ascii_uppercase())
        .map(|_| type_segment.to_string())
}

fn allowed_target_types(ctx: &WalkContext) -> std::collections::HashSet<String> {
    let Some(def) = ctx.element_def.as_ref() else {
        return Default::default();
    };
    let Some(types) = def.types.as_ref() else {
        return Default::default();
    };

    types
        .iter()
        .filter(|t| t.code == "Reference")
        .filter_map(|t| t.target_profile.as_ref())
        .flatten()
        .map(|profile| {
            profile
                .strip_prefix(CORE_PREFIX)
                .unwrap_or(profile)
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_target_type_from_relative_reference() {
        let contained = HashMap::new();
        let bundle = HashMap::new();
        assert_eq!(
            extract_target_type("Patient/123", &contained, &bundle),
            Some("Patient".to_string())
        );
        assert_eq!(extract_target_type("123", &contained, &bundle), None);
    }

    #[test]
    fn extract_target_type_from_contained_local_id() {
        let mut contained = HashMap::new();
        contained.insert("p1".to_string(), "Practitioner".to_string());
        let bundle = HashMap::new();
        assert_eq!(
            extract_target_type("#p1", &contained, &bundle),
            Some("Practitioner".to_string())
        );
        assert_eq!(extract_target_type("#missing", &contained, &bundle), None);
    }

    #[test]
    fn extract_target_type_from_bundle_urn() {
        let contained = HashMap::new();
        let mut bundle = HashMap::new();
        bundle.insert(
            "urn:uuid:abc".to_string(),
            "Observation".to_string(),
        );
        assert_eq!(
            extract_target_type("urn:uuid:abc", &contained, &bundle),
            Some("Observation".to_string())
        );
    }

    #[test]
    fn index_contained_and_bundle_collect_ids() {
        let resource = json!({
            "resourceType": "Patient",
            "contained": [
                {"resourceType": "Organization", "id": "org1"}
            ]
        });
        let contained = index_contained(&resource);
        assert_eq!(contained.get("org1"), Some(&"Organization".to_string()));

        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [
                {"fullUrl": "urn:uuid:1", "resource": {"resourceType": "Encounter"}}
            ]
        });
        let index = index_bundle(&bundle);
        assert_eq!(index.get("urn:uuid:1"), Some(&"Encounter".to_string()));
    }
}
