//! FHIR ElementDefinition model
//!
//! Version-agnostic model for the `snapshot`/`differential` element lists
//! carried by a StructureDefinition. No validation logic here — see
//! `ferrum_validator` for the engine that interprets these fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::complex::BindingStrength;

/// A snapshot view: a fully-resolved, ordered list of elements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub element: Vec<ElementDefinition>,
}

impl Snapshot {
    /// Look up an element by its exact dotted path (no indices).
    pub fn get_element(&self, path: &str) -> Option<&ElementDefinition> {
        self.element.iter().find(|e| e.path == path)
    }
}

/// A differential view: only the elements a profile actually constrains.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Differential {
    pub element: Vec<ElementDefinition>,
}

impl Differential {
    pub fn get_element(&self, path: &str) -> Option<&ElementDefinition> {
        self.element.iter().find(|e| e.path == path)
    }
}

/// Resolved type information for an element, used by callers that need to
/// know "what type(s) can this field hold" without walking the raw `type[]`
/// list themselves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElementTypeInfo {
    pub type_codes: Vec<String>,
    pub is_choice: bool,
    pub target_profiles: Vec<String>,
}

/// A single field in a StructureDefinition snapshot or differential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub path: String,

    #[serde(rename = "sliceName", skip_serializing_if = "Option::is_none")]
    pub slice_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,

    #[serde(rename = "contentReference", skip_serializing_if = "Option::is_none")]
    pub content_reference: Option<String>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<ElementDefinitionType>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,

    #[serde(rename = "defaultValue", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slicing: Option<ElementDefinitionSlicing>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<ElementDefinitionBinding>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Vec<Constraint>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Vec<ElementDefinitionMapping>>,

    #[serde(rename = "mustSupport", skip_serializing_if = "Option::is_none")]
    pub must_support: Option<bool>,

    #[serde(rename = "isModifier", skip_serializing_if = "Option::is_none")]
    pub is_modifier: Option<bool>,

    #[serde(rename = "isSummary", skip_serializing_if = "Option::is_none")]
    pub is_summary: Option<bool>,

    /// Tracks which base-type element this snapshot element was derived
    /// from, and its unconstrained cardinality. Populated by snapshot
    /// generation, not present on raw differentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<ElementDefinitionBase>,

    /// Everything not modeled above (`elementdefinition-bestpractice` and
    /// similar extensions live here via `_short`/`_path` style siblings are
    /// not flattened this way — only unrecognized top-level keys are).
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

impl ElementDefinition {
    /// `value[x]`-style choice element, e.g. `Observation.value[x]`.
    pub fn is_choice_type(&self) -> bool {
        self.path.ends_with("[x]")
    }

    /// A named slice of a sliced element (`Patient.identifier:mrn`).
    pub fn is_slice(&self) -> bool {
        self.slice_name.is_some()
    }

    /// The dotted path of this element's immediate parent, if any (`Patient.name.family`
    /// → `Patient.name`; `Patient` → `None`).
    pub fn parent_path(&self) -> Option<String> {
        self.path.rfind('.').map(|pos| self.path[..pos].to_string())
    }

    /// A merge/index key that distinguishes slices sharing the same path
    /// (`Patient.identifier` vs. `Patient.identifier:mrn`).
    pub fn key(&self) -> String {
        match &self.slice_name {
            Some(slice) => format!("{}:{}", self.path, slice),
            None => self.path.clone(),
        }
    }

    /// Resolve the allowed type code(s) for this element, if any are declared.
    pub fn to_type_info(&self) -> Option<ElementTypeInfo> {
        let types = self.types.as_ref()?;
        if types.is_empty() {
            return None;
        }
        let type_codes = types.iter().map(|t| t.code.clone()).collect();
        let target_profiles = types
            .iter()
            .flat_map(|t| t.target_profile.clone().unwrap_or_default())
            .collect();
        Some(ElementTypeInfo {
            type_codes,
            is_choice: self.is_choice_type(),
            target_profiles,
        })
    }

    /// True if the `elementdefinition-bestpractice` extension marks this
    /// element's constraints as best-practice (vs. normative) checks.
    pub fn is_best_practice(&self) -> bool {
        self.extensions
            .get("extension")
            .and_then(|v| v.as_array())
            .map(|exts| {
                exts.iter().any(|e| {
                    e.get("url").and_then(|u| u.as_str())
                        == Some("http://hl7.org/fhir/StructureDefinition/elementdefinition-bestpractice")
                        && e.get("valueBoolean").and_then(|v| v.as_bool()) == Some(true)
                })
            })
            .unwrap_or(false)
    }
}

/// `ElementDefinition.base`: the path and cardinality of the element in its
/// original (unconstrained) defining StructureDefinition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionBase {
    pub path: String,
    pub min: u32,
    pub max: String,
}

/// One allowed type for an element (`ElementDefinition.type[]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionType {
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Vec<String>>,

    #[serde(rename = "targetProfile", skip_serializing_if = "Option::is_none")]
    pub target_profile: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub versioning: Option<String>,
}

/// A binding to a ValueSet at a given strength.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionBinding {
    pub strength: BindingStrength,

    #[serde(rename = "valueSet", skip_serializing_if = "Option::is_none")]
    pub value_set: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Discriminator-based slicing declaration. Full slice matching is out of
/// scope for the core validator; this is carried so differential merge can
/// preserve/propagate it correctly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinitionSlicing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<Vec<SlicingDiscriminator>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlicingDiscriminator {
    #[serde(rename = "type")]
    pub discriminator_type: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementDefinitionMapping {
    pub identity: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Severity of a `constraint[]` invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintSeverity {
    Error,
    Warning,
}

/// A FHIRPath invariant attached to an element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub key: String,
    pub severity: ConstraintSeverity,
    pub human: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_element_with_binding_and_constraint() {
        let json = json!({
            "path": "Observation.status",
            "min": 1,
            "max": "1",
            "type": [{"code": "code"}],
            "binding": {"strength": "required", "valueSet": "http://hl7.org/fhir/ValueSet/observation-status"},
            "constraint": [{"key": "ele-1", "severity": "error", "human": "must be present"}]
        });
        let elem: ElementDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(elem.min, Some(1));
        assert_eq!(elem.max.as_deref(), Some("1"));
        assert_eq!(
            elem.binding.as_ref().unwrap().strength,
            BindingStrength::Required
        );
        assert_eq!(elem.constraint.as_ref().unwrap()[0].key, "ele-1");
    }

    #[test]
    fn choice_type_detection() {
        let elem = ElementDefinition {
            id: None,
            path: "Observation.value[x]".to_string(),
            slice_name: None,
            short: None,
            definition: None,
            comment: None,
            requirements: None,
            alias: None,
            min: Some(0),
            max: Some("1".to_string()),
            content_reference: None,
            types: Some(vec![
                ElementDefinitionType {
                    code: "Quantity".to_string(),
                    profile: None,
                    target_profile: None,
                    aggregation: None,
                    versioning: None,
                },
                ElementDefinitionType {
                    code: "string".to_string(),
                    profile: None,
                    target_profile: None,
                    aggregation: None,
                    versioning: None,
                },
            ]),
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
        };
        assert!(elem.is_choice_type());
        let info = elem.to_type_info().unwrap();
        assert!(info.is_choice);
        assert_eq!(info.type_codes, vec!["Quantity", "string"]);
    }

    #[test]
    fn slice_detection() {
        let mut elem_json = json!({"path": "Patient.identifier", "sliceName": "mrn"});
        let elem: ElementDefinition = serde_json::from_value(elem_json.take()).unwrap();
        assert!(elem.is_slice());
    }
}
