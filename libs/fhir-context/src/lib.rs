//! Conformance resource resolution: canonical URL and type-name lookup of
//! StructureDefinitions, backed either by an in-memory map (`InMemoryFhirContext`)
//! or an async `ConformanceResourceProvider` bridged through `FlexibleFhirContext`.
//!
//! Loading resources (from packages, a registry, a database) is outside this
//! crate's scope — callers hand in already-parsed `serde_json::Value`s.

pub mod context;
pub mod error;
pub mod version;

pub use context::{
    normalize_type_code, ConformanceResourceProvider, FallbackConformanceProvider, FhirContext,
    FlexibleFhirContext, InMemoryFhirContext,
};
pub use error::{Error, Result};
