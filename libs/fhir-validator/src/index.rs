//! `ElementIndex`: a path-indexed view over a StructureDefinition snapshot.
//!
//! Shared by every validation step that needs to resolve an instance path
//! down to the `ElementDefinition` that governs it — schema, terminology,
//! extensions, references, and the walker that drives them all. Built once
//! per resolved type (see [`crate::resolver::TypeResolver`]) and cached.
//!
//! Three lookup tables are layered over the element list:
//! - `byPath` — exact dotted path, e.g. `Patient.name.family`.
//! - content-reference aliases — an element with `contentReference: "#X"`
//!   reuses `X`'s entire subtree; every descendant of `X` gets an extra
//!   `byPath` entry rooted at the referencing element's own path.
//! - choice-type variant aliases — `value[x]` gets one extra `byPath` entry
//!   per declared type (`valueQuantity`, `valueString`, ...), each resolving
//!   back to the same `value[x]` `ElementDefinition`.
//! - short-path aliases — every path also gets indexed with the resource
//!   type prefix stripped, so callers that already know the root type can
//!   look up `name.family` instead of `Patient.name.family`.

use ferrum_models::ElementDefinition;
use std::collections::HashMap;

#[derive(Debug)]
pub struct ElementIndex {
    elements: Vec<ElementDefinition>,
    by_path: HashMap<String, usize>,
    children_by_parent: HashMap<String, Vec<usize>>,
    choice_bases_by_parent: HashMap<String, Vec<usize>>,
    root_path: String,
}

impl ElementIndex {
    pub fn new(elements: &[ElementDefinition]) -> Self {
        let elements: Vec<ElementDefinition> = elements.to_vec();
        let root_path = elements.first().map(|e| e.path.clone()).unwrap_or_default();

        let mut by_path: HashMap<String, usize> = HashMap::new();
        let mut children_by_parent: HashMap<String, Vec<usize>> = HashMap::new();
        let mut choice_bases_by_parent: HashMap<String, Vec<usize>> = HashMap::new();

        for (i, element) in elements.iter().enumerate() {
            if element.path.contains(':') {
                continue; // slices are not part of the base path index
            }
            by_path.insert(element.path.clone(), i);

            if let Some(parent) = element.parent_path() {
                if element.is_choice_type() {
                    choice_bases_by_parent
                        .entry(parent.clone())
                        .or_default()
                        .push(i);
                }
                children_by_parent.entry(parent).or_default().push(i);
            }
        }

        let mut index = Self {
            elements,
            by_path,
            children_by_parent,
            choice_bases_by_parent,
            root_path,
        };

        index.alias_content_references();
        index.alias_choice_variants();
        index.alias_short_paths();
        index
    }

    /// For every `contentReference: "#X"`, reuse `X`'s subtree under the
    /// referencing element's own path.
    fn alias_content_references(&mut self) {
        let mut aliases = Vec::new();
        for element in &self.elements {
            let Some(content_ref) = &element.content_reference else {
                continue;
            };
            let target_id = content_ref.trim_start_matches('#');
            let Some(&target_idx) = self.by_path.get(target_id) else {
                continue;
            };
            let target_path = self.elements[target_idx].path.clone();
            let target_prefix = format!("{}.", target_path);

            for (i, candidate) in self.elements.iter().enumerate() {
                if candidate.path == target_path {
                    continue; // the referencing element itself already has its own entry
                }
                if let Some(suffix) = candidate.path.strip_prefix(&target_prefix) {
                    aliases.push((format!("{}.{}", element.path, suffix), i));
                }
            }
        }
        for (alias_path, idx) in aliases {
            self.by_path.entry(alias_path).or_insert(idx);
        }
    }

    /// `value[x]` gets one `byPath` entry per declared type: `valueQuantity`,
    /// `valueString`, etc, each resolving back to the `value[x]` element.
    fn alias_choice_variants(&mut self) {
        let mut aliases = Vec::new();
        for bases in self.choice_bases_by_parent.values() {
            for &idx in bases {
                let element = &self.elements[idx];
                let Some(parent) = element.parent_path() else {
                    continue;
                };
                let Some(last) = element.path.rsplit('.').next() else {
                    continue;
                };
                let base_name = last.trim_end_matches("[x]");
                if let Some(types) = &element.types {
                    for t in types {
                        let variant_name = format!("{}{}", base_name, upper_first(&t.code));
                        aliases.push((format!("{}.{}", parent, variant_name), idx));
                    }
                }
            }
        }
        for (alias_path, idx) in aliases {
            self.by_path.entry(alias_path).or_insert(idx);
        }
    }

    /// Every path is also indexed with the root path's prefix stripped.
    fn alias_short_paths(&mut self) {
        if self.root_path.is_empty() {
            return;
        }
        let prefix = format!("{}.", self.root_path);
        let aliases: Vec<(String, usize)> = self
            .elements
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                if e.path.contains(':') {
                    return None;
                }
                e.path.strip_prefix(&prefix).map(|s| (s.to_string(), i))
            })
            .collect();
        for (alias_path, idx) in aliases {
            self.by_path.entry(alias_path).or_insert(idx);
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// `get`: exact (possibly aliased) path lookup.
    pub fn get(&self, path: &str) -> Option<&ElementDefinition> {
        self.by_path.get(path).map(|&i| &self.elements[i])
    }

    pub fn children_of(&self, parent_path: &str) -> Vec<&ElementDefinition> {
        self.children_by_parent
            .get(parent_path)
            .map(|v| v.iter().map(|&i| &self.elements[i]).collect())
            .unwrap_or_default()
    }

    pub fn choice_bases_of(&self, parent_path: &str) -> Vec<&ElementDefinition> {
        self.choice_bases_by_parent
            .get(parent_path)
            .map(|v| v.iter().map(|&i| &self.elements[i]).collect())
            .unwrap_or_default()
    }

    /// `getChoiceTypeDefinition`: given a concrete field name (`valueQuantity`)
    /// under `parent_path`, find the declaring `value[x]` element and the
    /// concrete type name (`Quantity`) it resolves to.
    pub fn get_choice_type_definition(
        &self,
        parent_path: &str,
        field_name: &str,
    ) -> Option<(&ElementDefinition, String)> {
        for base in self.choice_bases_of(parent_path) {
            let last = base.path.rsplit('.').next()?;
            let base_name = last.trim_end_matches("[x]");
            if field_name.starts_with(base_name) && field_name.len() > base_name.len() {
                let suffix = &field_name[base_name.len()..];
                if suffix.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
                    return Some((base, suffix.to_string()));
                }
            }
        }
        None
    }

    /// `getWithTyped`: exact lookup under `parent.field`, falling back to
    /// choice-variant resolution. Returns the matched concrete type name
    /// when the match came through a choice variant.
    pub fn get_with_typed(
        &self,
        parent_path: &str,
        field_name: &str,
    ) -> Option<(&ElementDefinition, Option<String>)> {
        let full_path = format!("{}.{}", parent_path, field_name);
        if let Some(element) = self.get(&full_path) {
            return Some((element, None));
        }
        self.get_choice_type_definition(parent_path, field_name)
            .map(|(e, t)| (e, Some(t)))
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrum_models::common::element_definition::ElementDefinitionType;

    fn element(path: &str, content_reference: Option<&str>, types: Option<Vec<&str>>) -> ElementDefinition {
        ElementDefinition {
            id: None,
            path: path.to_string(),
            slice_name: None,
            short: None,
            definition: None,
            comment: None,
            requirements: None,
            alias: None,
            min: None,
            max: None,
            content_reference: content_reference.map(|s| s.to_string()),
            types: types.map(|ts| {
                ts.into_iter()
                    .map(|code| ElementDefinitionType {
                        code: code.to_string(),
                        profile: None,
                        target_profile: None,
                        aggregation: None,
                        versioning: None,
                    })
                    .collect()
            }),
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
            extensions: Default::default(),
        }
    }

    #[test]
    fn resolves_choice_variant_aliases() {
        let elements = vec![
            element("Observation", None, None),
            element("Observation.value[x]", None, Some(vec!["Quantity", "string"])),
        ];
        let index = ElementIndex::new(&elements);
        let (def, typed) = index.get_with_typed("Observation", "valueQuantity").unwrap();
        assert_eq!(def.path, "Observation.value[x]");
        assert_eq!(typed, Some("Quantity".to_string()));
    }

    #[test]
    fn aliases_content_reference_subtree() {
        let elements = vec![
            element("Questionnaire", None, None),
            element("Questionnaire.item", None, None),
            element("Questionnaire.item.text", None, Some(vec!["string"])),
            element("Questionnaire.item.item", Some("#Questionnaire.item"), None),
        ];
        let index = ElementIndex::new(&elements);
        let aliased = index.get("Questionnaire.item.item.text").unwrap();
        assert_eq!(aliased.path, "Questionnaire.item.text");
    }

    #[test]
    fn short_path_alias_strips_root() {
        let elements = vec![
            element("Patient", None, None),
            element("Patient.name", None, None),
        ];
        let index = ElementIndex::new(&elements);
        assert!(index.has_path("name"));
    }
}
