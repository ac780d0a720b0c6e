//! Version-agnostic FHIR data model (StructureDefinition, ElementDefinition,
//! and shared complex types) used across the validation engine.
//!
//! This crate holds no validation logic — it is pure data representation,
//! (de)serialization, and the small set of accessor methods every consumer
//! needs (`get_element_by_path`, `is_choice_type`, ...).

pub mod common;

pub use common::*;
