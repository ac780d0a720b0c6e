//! Terminology validation step
//!
//! Walks the resource's StructureDefinition snapshot, finds elements with ValueSet bindings,
//! extracts coded values from the resource, and validates them via a TerminologyProvider.

use ferrum_context::FhirContext;
use ferrum_models::BindingStrength;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::terminology::provider::is_external_system;
use crate::terminology::TerminologyProvider;
use crate::validator::{IssueCode, IssueSeverity, ValidationIssue};
use crate::{ExtensibleHandling, TerminologyPlan};

/// Run terminology validation on a resource.
pub fn validate_terminology(
    resource: &Value,
    plan: &TerminologyPlan,
    context: &dyn FhirContext,
    terminology: &dyn TerminologyProvider,
    cancellation: &CancellationToken,
    issues: &mut Vec<ValidationIssue>,
) {
    let resource_type = match resource.get("resourceType").and_then(|v| v.as_str()) {
        Some(rt) => rt,
        None => return,
    };

    // Get the base StructureDefinition
    let sd = match context.get_core_structure_definition_by_type(resource_type) {
        Ok(Some(sd)) => sd,
        _ => return,
    };

    let snapshot = match sd.snapshot.as_ref() {
        Some(s) => s,
        None => return,
    };

    // Walk elements looking for bindings
    for element in &snapshot.element {
        if cancellation.is_cancelled() {
            return;
        }

        let binding = match element.binding.as_ref() {
            Some(b) => b,
            None => continue,
        };

        // Only required and extensible strengths produce findings.
        if binding.strength == BindingStrength::Example || binding.strength == BindingStrength::Preferred {
            continue;
        }

        let value_set_url = match binding.value_set.as_deref() {
            Some(url) => crate::terminology::provider::strip_version(url),
            None => continue,
        };

        // Determine the element type
        let type_code = element
            .types
            .as_ref()
            .and_then(|types| types.first())
            .map(|t| t.code.as_str())
            .unwrap_or("");

        // Navigate to the value in the resource at this element's path
        let element_path = &element.path;
        let relative_path = strip_resource_type(element_path, resource_type);

        let values = extract_values_at_path(resource, relative_path);
        if values.is_empty() {
            continue;
        }

        for (value, location) in values {
            validate_coded_value(
                value,
                type_code,
                value_set_url,
                binding.strength,
                plan,
                terminology,
                cancellation,
                &location,
                issues,
            );
        }
    }
}

/// Strip the resource type prefix from an element path.
/// "Patient.name" → "name", "Patient" → ""
fn strip_resource_type<'a>(path: &'a str, resource_type: &str) -> &'a str {
    if path == resource_type {
        return "";
    }
    path.strip_prefix(resource_type)
        .and_then(|s| s.strip_prefix('.'))
        .unwrap_or(path)
}

/// Extract all values at a dot-separated path from a JSON resource.
/// Returns (value, fhirpath_location) pairs.
/// Handles arrays: "Patient.name" could have multiple entries.
fn extract_values_at_path<'a>(resource: &'a Value, path: &str) -> Vec<(&'a Value, String)> {
    if path.is_empty() {
        return vec![(resource, String::new())];
    }

    let resource_type = resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let segments: Vec<&str> = path.split('.').collect();
    let mut results = Vec::new();
    collect_at_path(
        resource,
        &segments,
        0,
        resource_type.to_string(),
        &mut results,
    );
    results
}

fn collect_at_path<'a>(
    value: &'a Value,
    segments: &[&str],
    index: usize,
    current_path: String,
    results: &mut Vec<(&'a Value, String)>,
) {
    if index >= segments.len() {
        results.push((value, current_path));
        return;
    }

    let segment = segments[index];

    // Handle choice types: if segment is "value[x]", look for valueCode, valueCoding, etc.
    if segment.ends_with("[x]") {
        let prefix = segment.strip_suffix("[x]").unwrap_or(segment);
        if let Some(obj) = value.as_object() {
            for (key, val) in obj {
                if key.starts_with(prefix) && key.len() > prefix.len() {
                    let path = format!("{}.{}", current_path, key);
                    if val.is_array() {
                        if let Some(arr) = val.as_array() {
                            for (i, item) in arr.iter().enumerate() {
                                let item_path = format!("{}[{}]", path, i);
                                collect_at_path(item, segments, index + 1, item_path, results);
                            }
                        }
                    } else {
                        collect_at_path(val, segments, index + 1, path, results);
                    }
                }
            }
        }
        return;
    }

    match value.get(segment) {
        Some(child) if child.is_array() => {
            if let Some(arr) = child.as_array() {
                for (i, item) in arr.iter().enumerate() {
                    let path = format!("{}[{}]", format_path(&current_path, segment), i);
                    collect_at_path(item, segments, index + 1, path, results);
                }
            }
        }
        Some(child) => {
            let path = format_path(&current_path, segment);
            collect_at_path(child, segments, index + 1, path, results);
        }
        None => {}
    }
}

fn format_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

/// Validate a coded value against a ValueSet binding.
#[allow(clippy::too_many_arguments)]
fn validate_coded_value(
    value: &Value,
    type_code: &str,
    value_set_url: &str,
    binding_strength: BindingStrength,
    plan: &TerminologyPlan,
    terminology: &dyn TerminologyProvider,
    cancellation: &CancellationToken,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    match type_code {
        "code" => {
            // A code is a bare string value. The system comes from the binding.
            if let Some(code) = value.as_str() {
                validate_single_code(
                    None,
                    code,
                    None,
                    value_set_url,
                    binding_strength,
                    plan,
                    terminology,
                    cancellation,
                    location,
                    issues,
                );
            }
        }
        "Coding" => {
            validate_coding(
                value,
                value_set_url,
                binding_strength,
                plan,
                terminology,
                cancellation,
                location,
                issues,
            );
        }
        "CodeableConcept" => {
            validate_codeable_concept(
                value,
                value_set_url,
                binding_strength,
                plan,
                terminology,
                cancellation,
                location,
                issues,
            );
        }
        "Quantity" => {
            // Quantity can have a system + code for units
            let system = value.get("system").and_then(|v| v.as_str());
            let code = value.get("code").and_then(|v| v.as_str());
            if let (Some(system), Some(code)) = (system, code) {
                validate_single_code(
                    Some(system),
                    code,
                    None,
                    value_set_url,
                    binding_strength,
                    plan,
                    terminology,
                    cancellation,
                    location,
                    issues,
                );
            }
        }
        "string" | "uri" => {
            // string/uri with a binding: treat like a code
            if let Some(code) = value.as_str() {
                validate_single_code(
                    None,
                    code,
                    None,
                    value_set_url,
                    binding_strength,
                    plan,
                    terminology,
                    cancellation,
                    location,
                    issues,
                );
            }
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_coding(
    coding: &Value,
    value_set_url: &str,
    binding_strength: BindingStrength,
    plan: &TerminologyPlan,
    terminology: &dyn TerminologyProvider,
    cancellation: &CancellationToken,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let system = coding.get("system").and_then(|v| v.as_str());
    let code = coding.get("code").and_then(|v| v.as_str());
    let display = coding.get("display").and_then(|v| v.as_str());

    if let Some(code) = code {
        validate_single_code(
            system,
            code,
            display,
            value_set_url,
            binding_strength,
            plan,
            terminology,
            cancellation,
            location,
            issues,
        );
    }
}

/// Each coding in a CodeableConcept is validated independently against the
/// bound ValueSet — there's no "any coding valid, concept passes" aggregate;
/// a required/extensible binding applies to every coding in the array.
#[allow(clippy::too_many_arguments)]
fn validate_codeable_concept(
    cc: &Value,
    value_set_url: &str,
    binding_strength: BindingStrength,
    plan: &TerminologyPlan,
    terminology: &dyn TerminologyProvider,
    cancellation: &CancellationToken,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let codings = match cc.get("coding").and_then(|v| v.as_array()) {
        Some(arr) => arr,
        None => return,
    };

    for (i, coding) in codings.iter().enumerate() {
        let coding_location = format!("{}.coding[{}]", location, i);
        validate_coding(
            coding,
            value_set_url,
            binding_strength,
            plan,
            terminology,
            cancellation,
            &coding_location,
            issues,
        );
    }
}

/// Core validation: check a single system+code against a ValueSet.
///
/// Only `required` and `extensible` strengths produce findings here — the
/// caller already skips `example` bindings, and `preferred` falls through
/// the match below with no issue, kept only so its coding is still extracted
/// and available to a caller that wants to layer its own check on top.
#[allow(clippy::too_many_arguments)]
fn validate_single_code(
    system: Option<&str>,
    code: &str,
    display: Option<&str>,
    value_set_url: &str,
    binding_strength: BindingStrength,
    plan: &TerminologyPlan,
    terminology: &dyn TerminologyProvider,
    cancellation: &CancellationToken,
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let system = system.unwrap_or("");

    // Externally-maintained systems (SNOMED, LOINC, ...) can't be expanded
    // locally. Delegate to the provider if it actually answers; otherwise
    // accept the code and say so rather than silently passing it.
    if !system.is_empty() && is_external_system(system) {
        match terminology.validate_code_in_system(system, code, cancellation) {
            Ok(Some(result)) if !result.valid => {
                let msg = result
                    .message
                    .unwrap_or_else(|| format!("Code '{}' from system '{}' is not valid", code, system));
                issues.push(
                    ValidationIssue::error(IssueCode::CodeInvalid, msg).with_location(location.to_string()),
                );
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                issues.push(
                    ValidationIssue::information(
                        IssueCode::BindingCannotValidate,
                        format!(
                            "Code '{}' from externally-maintained system '{}' was accepted unchecked",
                            code, system
                        ),
                    )
                    .with_location(location.to_string()),
                );
            }
        }
        return;
    }

    let result = match terminology.validate_code(system, code, display, value_set_url, cancellation) {
        Ok(Some(r)) => r,
        Ok(None) => {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::BindingValueSetNotFound,
                    format!("ValueSet '{}' is not loaded; binding was not validated", value_set_url),
                )
                .with_location(location.to_string()),
            );
            return;
        }
        Err(err) => {
            warn!(error = %err, value_set_url, "terminology provider failed; binding accepted unchecked");
            return;
        }
    };

    if result.valid {
        if let Some(ref msg) = result.message {
            let severity = result.severity_override.unwrap_or(IssueSeverity::Warning);
            issues.push(ValidationIssue {
                severity,
                code: IssueCode::CodeInvalid,
                diagnostics: msg.clone(),
                location: Some(location.to_string()),
                expression: None,
            });
        }
        return;
    }

    match binding_strength {
        BindingStrength::Required => {
            let msg = result.message.unwrap_or_else(|| {
                format!(
                    "Code '{}' from system '{}' is not in the required ValueSet '{}'",
                    code, system, value_set_url
                )
            });
            issues.push(ValidationIssue {
                severity: result.severity_override.unwrap_or(IssueSeverity::Error),
                code: IssueCode::BindingRequired,
                diagnostics: msg,
                location: Some(location.to_string()),
                expression: None,
            });
        }
        BindingStrength::Extensible => {
            if plan.extensible_handling == ExtensibleHandling::Ignore {
                return;
            }
            // A code whose system the ValueSet never mentions extends the
            // binding rather than violating it — only warn when the system
            // is either absent (bare code against this ValueSet) or one the
            // ValueSet actually declares.
            let system_declared = system.is_empty()
                || terminology
                    .value_set_declares_system(value_set_url, system)
                    .ok()
                    .flatten()
                    .unwrap_or(false);
            if !system_declared {
                return;
            }
            let severity = match plan.extensible_handling {
                ExtensibleHandling::Error => IssueSeverity::Error,
                ExtensibleHandling::Warn => IssueSeverity::Warning,
                ExtensibleHandling::Ignore => unreachable!(),
            };
            let msg = result.message.unwrap_or_else(|| {
                format!(
                    "Code '{}' from system '{}' is not in the extensible ValueSet '{}'",
                    code, system, value_set_url
                )
            });
            issues.push(ValidationIssue {
                severity,
                code: IssueCode::BindingExtensible,
                diagnostics: msg,
                location: Some(location.to_string()),
                expression: None,
            });
        }
        BindingStrength::Preferred | BindingStrength::Example => {}
    }
}
