//! Version-agnostic FHIR data model: no validation, just wire-format types.

pub mod complex;
pub mod element_definition;
pub mod error;
pub mod structure_definition;

pub use complex::*;
pub use element_definition::{
    Constraint, ConstraintSeverity, Differential, ElementDefinition, ElementDefinitionBase,
    ElementDefinitionBinding, ElementDefinitionMapping, ElementDefinitionSlicing,
    ElementDefinitionType, ElementTypeInfo, SlicingDiscriminator, Snapshot,
};
pub use error::{Error, Result};
pub use structure_definition::{
    StructureDefinition, StructureDefinitionContext, StructureDefinitionKind,
    StructureDefinitionMapping, TypeDerivationRule,
};
