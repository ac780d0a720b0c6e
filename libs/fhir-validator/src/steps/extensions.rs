//! Extension validation
//!
//! Checks every `extension[]`/`modifierExtension[]` entry found anywhere in
//! the resource against the Extension StructureDefinition its `url`
//! resolves to: URL presence, SD resolution, declared `context[]`, and
//! `value[x]` shape. Runs as its own recursive descent over the raw JSON
//! tree rather than riding the schema walk, since extension context
//! matching needs a FHIRPath-shaped "context path" that gets rewritten at
//! Bundle/contained boundaries — a concern orthogonal to element-type
//! resolution.

use ferrum_context::FhirContext;
use ferrum_models::{ElementDefinition, StructureDefinition, StructureDefinitionContext};
use serde_json::Value;

use crate::validator::{IssueCode, ValidationIssue};

pub fn validate_extensions<C: FhirContext>(
    resource: &Value,
    context: &C,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(resource_type) = resource.get("resourceType").and_then(|v| v.as_str()) else {
        return;
    };
    walk(resource, resource_type, context, issues);
}

/// `context_path` is the FHIRPath-shaped path used for `context[]` matching;
/// it is reset to a bare resource type whenever traversal crosses into a
/// nested resource (`Bundle.entry[].resource`, `contained[]`).
fn walk<C: FhirContext>(node: &Value, context_path: &str, context: &C, issues: &mut Vec<ValidationIssue>) {
    let Some(obj) = node.as_object() else {
        return;
    };

    for (key, value) in obj {
        if key == "extension" || key == "modifierExtension" {
            if let Some(arr) = value.as_array() {
                for ext in arr {
                    validate_extension(ext, context_path, key == "modifierExtension", context, issues);
                }
            }
            continue;
        }

        if let Some(shadowed) = key.strip_prefix('_') {
            let sibling_context = format!("{}.{}", context_path, shadowed);
            walk(value, &sibling_context, context, issues);
            continue;
        }

        if matches!(key.as_str(), "resourceType" | "id" | "meta") {
            continue;
        }

        match value {
            Value::Object(child_obj) => {
                if let Some(inner_rt) = child_obj.get("resourceType").and_then(|v| v.as_str()) {
                    walk(value, inner_rt, context, issues);
                } else {
                    let child_context = format!("{}.{}", context_path, key);
                    walk(value, &child_context, context, issues);
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Some(inner_rt) = item.get("resourceType").and_then(|v| v.as_str()) {
                        walk(item, inner_rt, context, issues);
                    } else if item.is_object() {
                        let child_context = format!("{}.{}", context_path, key);
                        walk(item, &child_context, context, issues);
                    }
                }
            }
            _ => {}
        }
    }
}

fn validate_extension<C: FhirContext>(
    ext: &Value,
    context_path: &str,
    is_modifier: bool,
    context: &C,
    issues: &mut Vec<ValidationIssue>,
) {
    let location = format!(
        "{}.{}",
        context_path,
        if is_modifier { "modifierExtension" } else { "extension" }
    );

    let url = match ext.get("url").and_then(|v| v.as_str()) {
        Some(u) if !u.is_empty() => u,
        _ => {
            issues.push(
                ValidationIssue::error(IssueCode::ExtensionNoURL, "Extension is missing a 'url'".to_string())
                    .with_location(location),
            );
            return;
        }
    };

    let ext_sd = match context.get_structure_definition(url) {
        Ok(Some(sd)) => sd,
        _ => {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::ExtensionUnknown,
                    format!("Extension '{}' could not be resolved", url),
                )
                .with_location(location),
            );
            return;
        }
    };

    if let Some(contexts) = ext_sd.context.as_ref() {
        if !contexts.is_empty() && !contexts.iter().any(|c| context_matches(c, context_path, context)) {
            issues.push(
                ValidationIssue::error(
                    IssueCode::ExtensionInvalidContext,
                    format!("Extension '{}' is not allowed in context '{}'", url, context_path),
                )
                .with_location(location),
            );
            return;
        }
    }

    validate_value(ext, &ext_sd, &location, issues);
}

fn context_matches<C: FhirContext>(ctx: &StructureDefinitionContext, context_path: &str, context: &C) -> bool {
    if ctx.context_type != "element" {
        // `fhirpath`/`extension` context types would need FHIRPath evaluation
        // against the whole resource; accepted conservatively since they're rare.
        return true;
    }

    let expr = ctx.expression.as_str();

    if expr == "Element" || expr == "Resource" {
        return true;
    }

    if context_path == expr || context_path.starts_with(&format!("{}.", expr)) {
        return true;
    }

    if matches!(expr, "DomainResource" | "CanonicalResource" | "MetadataResource") {
        let root = context_path.split('.').next().unwrap_or(context_path);
        return classify_resource(root, context).as_deref() == Some(expr);
    }

    let last_segment = context_path.rsplit('.').next().unwrap_or(context_path);
    if last_segment.eq_ignore_ascii_case(expr) {
        return true;
    }
    common_suffix_len(last_segment, expr) >= 4
}

/// Classify `type_name` as one of the abstract base resource kinds by
/// walking `baseDefinition` up from it. Capped to guard against a malformed
/// (cyclic) inheritance chain.
fn classify_resource<C: FhirContext>(type_name: &str, context: &C) -> Option<String> {
    let mut current = type_name.to_string();
    for _ in 0..16 {
        if matches!(current.as_str(), "DomainResource" | "CanonicalResource" | "MetadataResource") {
            return Some(current);
        }
        let sd = context.get_core_structure_definition_by_type(&current).ok().flatten()?;
        current = sd.get_base_type_name()?;
    }
    None
}

fn common_suffix_len(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x.eq_ignore_ascii_case(y))
        .count()
}

fn validate_value(ext: &Value, ext_sd: &StructureDefinition, location: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(snapshot) = ext_sd.snapshot.as_ref() else {
        return;
    };
    let value_def = snapshot.element.iter().find(|e| e.path == "Extension.value[x]");
    check_value_against_def(ext, value_def, snapshot.element.as_slice(), location, issues);

    if let Some(nested) = ext.get("extension").and_then(|v| v.as_array()) {
        for child in nested {
            validate_nested_extension(child, &snapshot.element, location, issues);
        }
    }
}

fn value_key(node: &Value) -> Option<&str> {
    node.as_object()?
        .keys()
        .find(|k| k.starts_with("value") && k.len() > "value".len())
        .map(|k| k.as_str())
}

fn check_value_against_def(
    node: &Value,
    value_def: Option<&ElementDefinition>,
    _elements: &[ElementDefinition],
    location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(def) = value_def else {
        return;
    };

    let key = value_key(node);

    if def.max.as_deref() == Some("0") {
        if key.is_some() {
            issues.push(
                ValidationIssue::error(
                    IssueCode::ExtensionValueNotAllowed,
                    "Extension does not allow a value".to_string(),
                )
                .with_location(location.to_string()),
            );
        }
        return;
    }

    let has_nested = node
        .get("extension")
        .and_then(|v| v.as_array())
        .is_some_and(|a| !a.is_empty());

    if def.min.unwrap_or(0) > 0 && key.is_none() && !has_nested {
        issues.push(
            ValidationIssue::error(IssueCode::ExtensionValueRequired, "Extension requires a value".to_string())
                .with_location(location.to_string()),
        );
        return;
    }

    let Some(key) = key else {
        return;
    };
    let type_name = &key["value".len()..];
    let declared = def
        .types
        .as_ref()
        .map(|ts| ts.iter().any(|t| t.code.eq_ignore_ascii_case(type_name)))
        .unwrap_or(false);

    if !declared {
        let expected: Vec<String> = def
            .types
            .as_ref()
            .map(|ts| ts.iter().map(|t| t.code.clone()).collect())
            .unwrap_or_default();
        issues.push(
            ValidationIssue::error(
                IssueCode::ExtensionInvalidValueType,
                format!("Extension value type '{}' is not declared (expected one of: {})", type_name, expected.join(", ")),
            )
            .with_location(format!("{}.{}", location, key)),
        );
    }
}

/// Nested extensions are matched against their parent slice by the `url`
/// fixed value carried on that slice's `.url` child, keyed by the slice's
/// element id (`Extension.extension:sliceName.url`) — the convention real
/// nested-extension StructureDefinitions use.
fn validate_nested_extension(
    child: &Value,
    elements: &[ElementDefinition],
    parent_location: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let location = format!("{}.extension", parent_location);
    let child_url = child.get("url").and_then(|v| v.as_str());

    let Some(child_url) = child_url else {
        issues.push(
            ValidationIssue::error(IssueCode::ExtensionNoURL, "Nested extension is missing a 'url'".to_string())
                .with_location(location),
        );
        return;
    };

    let slice_name = elements.iter().find_map(|e| {
        let id = e.id.as_ref()?;
        let slice = id.strip_prefix("Extension.extension:")?.strip_suffix(".url")?;
        let fixed_url = e.fixed.as_ref()?.as_str()?;
        (fixed_url == child_url).then(|| slice.to_string())
    });

    let Some(slice_name) = slice_name else {
        issues.push(
            ValidationIssue::warning(
                IssueCode::ExtensionNestedUnknown,
                format!("Nested extension '{}' does not match any declared slice", child_url),
            )
            .with_location(location),
        );
        return;
    };

    let value_path_prefix = format!("Extension.extension:{}.value", slice_name);
    let value_def = elements
        .iter()
        .find(|e| e.id.as_deref().is_some_and(|id| id.starts_with(&value_path_prefix)));
    check_value_against_def(child, value_def, elements, &location, issues);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_key_finds_the_populated_value_x_field() {
        let node = json!({"url": "http://example.org/ext", "valueString": "hi"});
        assert_eq!(value_key(&node), Some("valueString"));

        let no_value = json!({"url": "http://example.org/ext"});
        assert_eq!(value_key(&no_value), None);
    }

    #[test]
    fn common_suffix_len_counts_matching_trailing_chars() {
        assert_eq!(common_suffix_len("HumanName", "Name"), 4);
        assert_eq!(common_suffix_len("Patient", "Observation"), 0);
        assert_eq!(common_suffix_len("code", "Code"), 4);
    }

    fn element_def(value: serde_json::Value) -> ElementDefinition {
        serde_json::from_value(value).expect("valid ElementDefinition fixture")
    }

    #[test]
    fn check_value_against_def_flags_disallowed_value() {
        let def = element_def(json!({"path": "Extension.value[x]", "max": "0"}));
        let node = json!({"valueString": "not allowed"});
        let mut issues = Vec::new();
        check_value_against_def(&node, Some(&def), &[], "Patient.extension", &mut issues);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ExtensionValueNotAllowed);
    }

    #[test]
    fn check_value_against_def_flags_missing_required_value() {
        let def = element_def(json!({"path": "Extension.value[x]", "min": 1}));
        let node = json!({"url": "http://example.org/ext"});
        let mut issues = Vec::new();
        check_value_against_def(&node, Some(&def), &[], "Patient.extension", &mut issues);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ExtensionValueRequired);
    }

    #[test]
    fn check_value_against_def_flags_undeclared_value_type() {
        let def = element_def(json!({
            "path": "Extension.value[x]",
            "type": [{"code": "string"}]
        }));
        let node = json!({"valueBoolean": true});
        let mut issues = Vec::new();
        check_value_against_def(&node, Some(&def), &[], "Patient.extension", &mut issues);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ExtensionInvalidValueType);
    }

    #[test]
    fn validate_extension_reports_missing_url() {
        let ext = json!({"valueString": "hi"});
        let mut issues = Vec::new();
        walk(
            &json!({"resourceType": "Patient", "extension": [ext]}),
            "Patient",
            &NoopContext,
            &mut issues,
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::ExtensionNoURL);
    }

    struct NoopContext;

    impl FhirContext for NoopContext {
        fn get_resource_by_url(
            &self,
            _canonical_url: &str,
            _version: Option<&str>,
        ) -> ferrum_context::Result<Option<std::sync::Arc<Value>>> {
            Ok(None)
        }
    }
}
