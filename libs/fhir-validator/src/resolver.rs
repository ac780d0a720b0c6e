//! `TypeResolver`: a memoized `(type name | canonical URL) -> (StructureDefinition, ElementIndex)`
//! cache sitting in front of a [`FhirContext`].
//!
//! Every walker descent that crosses into a complex type (`Patient.contact`,
//! `Observation.value[x]` resolving to `Quantity`, a referenced `Resource`)
//! needs both the type's `StructureDefinition` and its `ElementIndex`. Both
//! are expensive to rebuild per node, so they're resolved once per type name
//! and cached for the lifetime of the resolver. Reads never block each
//! other; only a cache miss takes the write lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ferrum_context::{normalize_type_code, FhirContext};
use ferrum_models::StructureDefinition;

use crate::index::ElementIndex;

pub type ResolvedType = (Arc<StructureDefinition>, Arc<ElementIndex>);

const PRIMITIVE_TYPES: &[&str] = &[
    "base64Binary",
    "boolean",
    "canonical",
    "code",
    "date",
    "dateTime",
    "decimal",
    "id",
    "instant",
    "integer",
    "integer64",
    "markdown",
    "oid",
    "positiveInt",
    "string",
    "time",
    "unsignedInt",
    "uri",
    "url",
    "uuid",
    "xhtml",
];

pub fn is_primitive_type(type_code: &str) -> bool {
    let normalized = normalize_type_code(type_code);
    PRIMITIVE_TYPES
        .iter()
        .any(|p| p.eq_ignore_ascii_case(&normalized))
}

pub struct TypeResolver<C> {
    context: Arc<C>,
    cache: RwLock<HashMap<String, Option<ResolvedType>>>,
}

impl<C: FhirContext> TypeResolver<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self {
            context,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a type name (`Quantity`) or canonical URL
    /// (`http://hl7.org/fhir/StructureDefinition/Quantity`) to its
    /// `StructureDefinition` and `ElementIndex`. Returns `None` for
    /// primitive types (they carry no snapshot) and for types the
    /// underlying context can't resolve.
    pub fn resolve(&self, type_name_or_url: &str) -> Option<ResolvedType> {
        let key = normalize_type_code(type_name_or_url);
        if is_primitive_type(&key) {
            return None;
        }

        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return hit.clone();
        }

        let canonical_url = if key.starts_with("http://") || key.starts_with("https://") {
            key.clone()
        } else {
            format!("http://hl7.org/fhir/StructureDefinition/{}", key)
        };

        let resolved = self
            .context
            .get_structure_definition(&canonical_url)
            .ok()
            .flatten()
            .map(|sd| {
                let elements = sd
                    .snapshot
                    .as_ref()
                    .map(|s| s.element.as_slice())
                    .unwrap_or(&[]);
                let index = Arc::new(ElementIndex::new(elements));
                (sd, index)
            });

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, resolved.clone());

        resolved
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrum_context::InMemoryFhirContext;
    use serde_json::json;

    #[test]
    fn primitive_types_never_resolve() {
        let ctx = Arc::new(InMemoryFhirContext::new());
        let resolver = TypeResolver::new(ctx);
        assert!(resolver.resolve("string").is_none());
        assert!(resolver.resolve("dateTime").is_none());
    }

    #[test]
    fn resolves_and_caches_complex_type() {
        let ctx = InMemoryFhirContext::from_resources([json!({
            "resourceType": "StructureDefinition",
            "url": "http://hl7.org/fhir/StructureDefinition/Quantity",
            "name": "Quantity",
            "status": "active",
            "kind": "complex-type",
            "abstract": false,
            "type": "Quantity",
            "snapshot": { "element": [
                { "id": "Quantity", "path": "Quantity" },
                { "id": "Quantity.value", "path": "Quantity.value", "type": [{ "code": "decimal" }] }
            ]}
        })]);
        let resolver = TypeResolver::new(Arc::new(ctx));
        let (sd, index) = resolver.resolve("Quantity").expect("resolves");
        assert_eq!(sd.type_, "Quantity");
        assert!(index.has_path("Quantity.value"));

        let (sd2, _) = resolver.resolve("Quantity").unwrap();
        assert!(Arc::ptr_eq(&sd, &sd2));
    }
}
