//! ID and slice-name normalization for generated snapshots/differentials
//!
//! After merging, element `id`s should read as `path` with `:sliceName`
//! segments appended at each sliced ancestor (`Patient.name:official.family`).
//! This keeps ordering from the merge step untouched and only fixes up IDs.

use ferrum_models::{Differential, Snapshot};

/// Recompute `id` for every element from its `path` and `sliceName`, walking
/// ancestors to pick up any slice context they introduced.
pub fn normalize_snapshot(snapshot: &mut Snapshot) {
    normalize_ids(&mut snapshot.element);
}

pub fn normalize_differential(differential: &mut Differential) {
    normalize_ids(&mut differential.element);
}

fn normalize_ids(elements: &mut [ferrum_models::ElementDefinition]) {
    let slice_by_path: std::collections::HashMap<String, String> = elements
        .iter()
        .filter_map(|e| e.slice_name.clone().map(|s| (e.path.clone(), s)))
        .collect();

    for elem in elements.iter_mut() {
        elem.id = Some(compute_id(&elem.path, elem.slice_name.as_deref(), &slice_by_path));
    }
}

fn compute_id(
    path: &str,
    own_slice: Option<&str>,
    slice_by_path: &std::collections::HashMap<String, String>,
) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();

    for part in path.split('.') {
        if !current.is_empty() {
            current.push('.');
        }
        current.push_str(part);

        let mut segment = part.to_string();
        if current == path {
            if let Some(slice) = own_slice {
                segment = format!("{}:{}", segment, slice);
            }
        } else if let Some(slice) = slice_by_path.get(&current) {
            segment = format!("{}:{}", segment, slice);
        }
        segments.push(segment);
    }

    segments.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrum_models::ElementDefinition;
    use std::collections::HashMap;

    fn make_element(path: &str, slice_name: Option<&str>) -> ElementDefinition {
        ElementDefinition {
            id: None,
            path: path.to_string(),
            slice_name: slice_name.map(|s| s.to_string()),
            short: None,
            definition: None,
            comment: None,
            requirements: None,
            alias: None,
            min: None,
            max: None,
            content_reference: None,
            types: None,
            fixed: None,
            pattern: None,
            default_value: None,
            slicing: None,
            binding: None,
            constraint: None,
            mapping: None,
            must_support: None,
            is_modifier: None,
            is_summary: None,
            base: None,
            extensions: HashMap::new(),
        }
    }

    #[test]
    fn assigns_plain_ids() {
        let mut snapshot = Snapshot {
            element: vec![make_element("Patient", None), make_element("Patient.name", None)],
        };
        normalize_snapshot(&mut snapshot);
        assert_eq!(snapshot.element[1].id.as_deref(), Some("Patient.name"));
    }

    #[test]
    fn appends_slice_name_to_self_and_children() {
        let mut snapshot = Snapshot {
            element: vec![
                make_element("Patient.name", Some("official")),
                make_element("Patient.name.family", None),
            ],
        };
        normalize_snapshot(&mut snapshot);
        assert_eq!(
            snapshot.element[0].id.as_deref(),
            Some("Patient.name:official")
        );
        assert_eq!(
            snapshot.element[1].id.as_deref(),
            Some("Patient.name:official.family")
        );
    }
}
