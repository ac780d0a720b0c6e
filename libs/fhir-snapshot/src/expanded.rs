//! A [`FhirContext`] decorator that materializes differential-only
//! StructureDefinitions into full snapshots and deep-expands existing
//! snapshots (resolving `contentReference`, choice types, and complex-type
//! children) before handing them to a caller.
//!
//! Wraps any `FhirContext`; expanded StructureDefinitions are cached by
//! canonical URL so repeated validation runs against the same profile set
//! only pay the expansion cost once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ferrum_context::{FhirContext, Result};
use ferrum_models::StructureDefinition;
use serde_json::Value;

use crate::generator::generate_deep_snapshot;
use crate::snapshot_generation::generate_structure_definition_snapshot;

/// Wraps `C`, transparently expanding StructureDefinitions it resolves.
pub struct ExpandedFhirContext<C> {
    inner: C,
    cache: RwLock<HashMap<String, Arc<StructureDefinition>>>,
}

impl<C: FhirContext> ExpandedFhirContext<C> {
    /// Take ownership of `inner`.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn expand(&self, sd: Arc<StructureDefinition>) -> Result<Arc<StructureDefinition>> {
        let mut sd = (*sd).clone();

        if sd.snapshot.is_none() {
            if sd.differential.is_some() {
                let generated = generate_structure_definition_snapshot(None, &sd, self)?;
                sd = generated;
            } else {
                return Ok(Arc::new(sd));
            }
        }

        if let Some(snapshot) = sd.snapshot.as_ref() {
            let deep = generate_deep_snapshot(snapshot, self)?;
            sd.snapshot = Some(deep);
        }

        Ok(Arc::new(sd))
    }
}

/// Convenience constructor for wrapping a borrowed context. The returned
/// value is a distinct `ExpandedFhirContext<&C>`, valid only for `'a`, handy
/// for one-off on-the-fly expansion inside a function body.
impl<'a, C: FhirContext> ExpandedFhirContext<&'a C> {
    pub fn borrowed(inner: &'a C) -> Self {
        Self::new(inner)
    }
}

impl<C: FhirContext> FhirContext for ExpandedFhirContext<C> {
    fn get_resource_by_url(
        &self,
        canonical_url: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<Value>>> {
        self.inner.get_resource_by_url(canonical_url, version)
    }

    fn get_structure_definition(
        &self,
        canonical_url: &str,
    ) -> Result<Option<Arc<StructureDefinition>>> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(canonical_url)
        {
            return Ok(Some(cached.clone()));
        }

        let Some(sd) = self.inner.get_structure_definition(canonical_url)? else {
            return Ok(None);
        };

        let expanded = self.expand(sd)?;

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(canonical_url.to_string(), expanded.clone());

        Ok(Some(expanded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrum_context::InMemoryFhirContext;
    use serde_json::json;

    #[test]
    fn materializes_snapshot_from_differential() {
        let ctx = InMemoryFhirContext::from_resources([
            json!({
                "resourceType": "StructureDefinition",
                "url": "http://hl7.org/fhir/StructureDefinition/Patient",
                "name": "Patient",
                "status": "active",
                "kind": "resource",
                "abstract": false,
                "type": "Patient",
                "snapshot": { "element": [
                    { "id": "Patient", "path": "Patient" },
                    { "id": "Patient.birthDate", "path": "Patient.birthDate", "min": 0, "max": "1", "type": [{ "code": "date" }] }
                ]}
            }),
            json!({
                "resourceType": "StructureDefinition",
                "url": "http://example.org/fhir/StructureDefinition/MyPatient",
                "name": "MyPatient",
                "status": "active",
                "kind": "resource",
                "abstract": false,
                "type": "Patient",
                "baseDefinition": "http://hl7.org/fhir/StructureDefinition/Patient",
                "derivation": "constraint",
                "differential": { "element": [
                    { "id": "Patient.birthDate", "path": "Patient.birthDate", "min": 1, "max": "1", "type": [{ "code": "date" }] }
                ]}
            }),
        ]);

        let expanded = ExpandedFhirContext::new(ctx);
        let sd = expanded
            .get_structure_definition("http://example.org/fhir/StructureDefinition/MyPatient")
            .unwrap()
            .unwrap();

        let snapshot = sd.snapshot.as_ref().expect("snapshot materialized");
        let birth_date = snapshot
            .element
            .iter()
            .find(|e| e.path == "Patient.birthDate")
            .expect("birthDate present");
        assert_eq!(birth_date.min, Some(1));
    }

    #[test]
    fn caches_expanded_structure_definitions() {
        let ctx = InMemoryFhirContext::from_resources([json!({
            "resourceType": "StructureDefinition",
            "url": "http://hl7.org/fhir/StructureDefinition/Patient",
            "name": "Patient",
            "status": "active",
            "kind": "resource",
            "abstract": false,
            "type": "Patient",
            "snapshot": { "element": [{ "id": "Patient", "path": "Patient" }] }
        })]);

        let expanded = ExpandedFhirContext::new(ctx);
        let url = "http://hl7.org/fhir/StructureDefinition/Patient";
        let first = expanded.get_structure_definition(url).unwrap().unwrap();
        let second = expanded.get_structure_definition(url).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn borrowed_expands_without_taking_ownership() {
        let ctx = InMemoryFhirContext::from_resources([json!({
            "resourceType": "StructureDefinition",
            "url": "http://hl7.org/fhir/StructureDefinition/Patient",
            "name": "Patient",
            "status": "active",
            "kind": "resource",
            "abstract": false,
            "type": "Patient",
            "snapshot": { "element": [{ "id": "Patient", "path": "Patient" }] }
        })]);

        let expanded = ExpandedFhirContext::borrowed(&ctx);
        let sd = expanded
            .get_structure_definition("http://hl7.org/fhir/StructureDefinition/Patient")
            .unwrap();
        assert!(sd.is_some());
    }
}
