//! Snapshot and differential generation for StructureDefinitions
//!
//! Given a base snapshot and a differential, merges them into a new
//! snapshot; the reverse direction (computing a differential from a
//! snapshot and its base) is also supported. `SnapshotExpander` additionally
//! resolves `contentReference`, choice-type (`value[x]`), and complex-type
//! expansions against a `ferrum_context::FhirContext`.

pub mod error;
pub mod expanded;
pub mod expander;
pub mod generator;
pub mod inheritance;
pub mod merge;
pub mod normalization;
pub mod slicing;
pub mod snapshot_generation;
pub mod validation;

pub use error::{Error, Result};
pub use expanded::ExpandedFhirContext;
pub use expander::SnapshotExpander;
pub use ferrum_models::ElementDefinition;
pub use generator::{generate_deep_snapshot, generate_differential, generate_snapshot};
pub use inheritance::{
    propagate_constraints, propagate_slice_names, validate_cardinality_inheritance,
    InheritanceContext,
};
pub use merge::merge_element;
pub use normalization::{normalize_differential, normalize_snapshot};
pub use slicing::SlicingContext;
pub use snapshot_generation::{
    generate_structure_definition_differential, generate_structure_definition_snapshot,
};
pub use validation::{validate_differential, validate_snapshot};
