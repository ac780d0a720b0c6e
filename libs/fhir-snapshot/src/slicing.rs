//! Slicing bookkeeping for snapshot generation
//!
//! Tracks `slicing` declarations and the slice instances that fill them as a
//! differential is merged onto a base snapshot, so the generator can decide
//! where new slices insert and whether a "closed" rule is being violated.

use crate::error::{Error, Result};
use ferrum_models::{ElementDefinition, ElementDefinitionSlicing, SlicingDiscriminator};
use std::collections::HashMap;

/// A registered `slicing` declaration: the element path it applies to, the
/// declaration itself, and the index in the base/merged element list where
/// the declaring element lives.
struct SliceEntry {
    slicing: ElementDefinitionSlicing,
    #[allow(dead_code)]
    index: usize,
}

#[derive(Default)]
pub struct SlicingContext {
    entries: HashMap<String, SliceEntry>,
    instances: HashMap<String, Vec<String>>,
    implicit: HashMap<String, Vec<String>>,
}

impl SlicingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `slicing` declaration for the element at `path`.
    pub fn register_slice_entry(
        &mut self,
        path: &str,
        slicing: ElementDefinitionSlicing,
        index: usize,
    ) -> Result<()> {
        self.entries
            .insert(path.to_string(), SliceEntry { slicing, index });
        Ok(())
    }

    /// Record that a named slice instance exists for its path.
    pub fn register_slice_instance(&mut self, elem: &ElementDefinition) -> Result<()> {
        let Some(slice_name) = &elem.slice_name else {
            return Ok(());
        };
        let names = self.instances.entry(elem.path.clone()).or_default();
        if !names.contains(slice_name) {
            names.push(slice_name.clone());
        }
        Ok(())
    }

    /// Detect paths that carry named slice instances but no explicit
    /// `slicing` declaration anywhere in the differential — FHIR allows this
    /// ("discriminator-less" slicing by value equality), and a default entry
    /// should be synthesized.
    pub fn detect_implicit_slicing(&mut self, elements: &[ElementDefinition]) {
        let mut by_path: HashMap<String, Vec<String>> = HashMap::new();
        for elem in elements {
            if let Some(slice_name) = &elem.slice_name {
                let names = by_path.entry(elem.path.clone()).or_default();
                if !names.contains(slice_name) {
                    names.push(slice_name.clone());
                }
            }
        }
        for (path, names) in by_path {
            if !self.entries.contains_key(&path) {
                self.implicit.insert(path, names);
            }
        }
    }

    pub fn get_all_implicit_slicing(&self) -> &HashMap<String, Vec<String>> {
        &self.implicit
    }

    /// A conservative default: value-based discriminator on the whole element,
    /// open rules (closed slicing is only meaningful once explicitly declared).
    pub fn create_default_slicing_entry(&self, _path: &str) -> ElementDefinitionSlicing {
        ElementDefinitionSlicing {
            discriminator: Some(vec![SlicingDiscriminator {
                discriminator_type: "value".to_string(),
                path: "$this".to_string(),
            }]),
            description: Some("auto-generated from implicit slice instances".to_string()),
            ordered: Some(false),
            rules: Some("open".to_string()),
        }
    }

    pub fn get_all_slice_entries(&self) -> HashMap<&str, &ElementDefinitionSlicing> {
        self.entries
            .iter()
            .map(|(path, entry)| (path.as_str(), &entry.slicing))
            .collect()
    }

    /// Whether a new named slice may still be added at `path` given the
    /// registered `rules` (`closed` rejects unknown slices).
    pub fn can_add_slice(&self, path: &str, slice_name: &str) -> Result<bool> {
        let Some(entry) = self.entries.get(path) else {
            return Ok(true);
        };
        if entry.slicing.rules.as_deref() != Some("closed") {
            return Ok(true);
        }
        let known = self
            .instances
            .get(path)
            .map(|names| names.iter().any(|n| n == slice_name))
            .unwrap_or(false);
        Ok(known)
    }

    /// A `slicing` declaration must have at least one discriminator unless it
    /// explicitly opts out via `rules: closed` with no instances — otherwise
    /// there's no way to tell slices apart.
    pub fn validate_discriminators(&self, path: &str) -> Result<()> {
        let Some(entry) = self.entries.get(path) else {
            return Ok(());
        };
        let has_discriminator = entry
            .slicing
            .discriminator
            .as_ref()
            .is_some_and(|d| !d.is_empty());
        if !has_discriminator {
            return Err(Error::Slicing(format!(
                "slicing declaration on '{}' has no discriminator",
                path
            )));
        }
        Ok(())
    }

    /// Insertion position for a new slice instance: immediately after the
    /// last existing element sharing `new_elem`'s path (slice or not).
    pub fn get_slice_position(
        &self,
        elements: &[ElementDefinition],
        new_elem: &ElementDefinition,
    ) -> usize {
        let mut last = None;
        for (i, elem) in elements.iter().enumerate() {
            if elem.path == new_elem.path
                || elem.path.starts_with(&format!("{}.", new_elem.path))
            {
                last = Some(i);
            }
        }
        last.map(|i| i + 1).unwrap_or(elements.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn make_slice(path: &str, slice_name: &str) -> ElementDefinition {
        ElementDefinition {
            id: None,
            path: path.to_string(),
            slice_name: Some(slice_name.to_string()),
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
            extensions: Map::new(),
        }
    }

    #[test]
    fn detects_implicit_slicing_without_declaration() {
        let mut ctx = SlicingContext::new();
        let elements = vec![
            make_slice("Patient.identifier", "mrn"),
            make_slice("Patient.identifier", "ssn"),
        ];
        ctx.detect_implicit_slicing(&elements);
        assert_eq!(
            ctx.get_all_implicit_slicing().get("Patient.identifier"),
            Some(&vec!["mrn".to_string(), "ssn".to_string()])
        );
    }

    #[test]
    fn closed_slicing_rejects_unknown_slice() {
        let mut ctx = SlicingContext::new();
        let slicing = ElementDefinitionSlicing {
            discriminator: Some(vec![SlicingDiscriminator {
                discriminator_type: "value".to_string(),
                path: "system".to_string(),
            }]),
            description: None,
            ordered: Some(false),
            rules: Some("closed".to_string()),
        };
        ctx.register_slice_entry("Patient.identifier", slicing, 0)
            .unwrap();
        ctx.register_slice_instance(&make_slice("Patient.identifier", "mrn"))
            .unwrap();

        assert!(ctx.can_add_slice("Patient.identifier", "mrn").unwrap());
        assert!(!ctx.can_add_slice("Patient.identifier", "ssn").unwrap());
    }

    #[test]
    fn validates_discriminator_presence() {
        let mut ctx = SlicingContext::new();
        let slicing = ElementDefinitionSlicing {
            discriminator: None,
            description: None,
            ordered: None,
            rules: Some("open".to_string()),
        };
        ctx.register_slice_entry("Patient.identifier", slicing, 0)
            .unwrap();
        assert!(ctx.validate_discriminators("Patient.identifier").is_err());
    }
}
