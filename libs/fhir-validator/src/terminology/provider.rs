use tokio_util::sync::CancellationToken;

use crate::validator::IssueSeverity;

/// Result of validating a code against a ValueSet or CodeSystem.
#[derive(Debug, Clone)]
pub struct CodeValidationResult {
    /// Whether the code is valid in the given context.
    pub valid: bool,
    /// The correct display for the concept (if known).
    pub display: Option<String>,
    /// Human-readable message (error or warning detail).
    pub message: Option<String>,
    /// Override the default severity (e.g., for fragment CodeSystems: Warning instead of Error).
    pub severity_override: Option<IssueSeverity>,
}

/// Code systems maintained externally (SNOMED CT, LOINC, RxNorm, ICD-10, CPT,
/// the IANA/ISO identifier registries) that no in-memory provider can expand
/// or walk locally. A binding against one of these is accepted unchecked
/// unless a real provider is wired in to answer for it.
pub const EXTERNAL_SYSTEMS: &[&str] = &[
    "http://snomed.info/sct",
    "http://loinc.org",
    "http://www.nlm.nih.gov/research/umls/rxnorm",
    "http://hl7.org/fhir/sid/icd-10",
    "http://hl7.org/fhir/sid/icd-10-cm",
    "http://hl7.org/fhir/sid/icd-10-pcs",
    "http://www.cms.gov/Medicare/Coding/ICD10",
    "http://www.ama-assn.org/go/cpt",
    "urn:ietf:bcp:13",
    "urn:ietf:bcp:47",
    "urn:iana:tz",
    "urn:iso:std:iso:3166",
    "urn:iso:std:iso:4217",
];

/// Strip a trailing `|<version>` suffix, truncating at the last `|`.
pub fn strip_version(url: &str) -> &str {
    url.rsplit_once('|').map(|(base, _)| base).unwrap_or(url)
}

/// Whether `system` (after version-stripping) is one of the fixed
/// externally-maintained code systems.
pub fn is_external_system(system: &str) -> bool {
    let system = strip_version(system);
    EXTERNAL_SYSTEMS.iter().any(|s| *s == system)
}

/// Provides terminology validation capabilities to the validator.
///
/// Implementations range from in-memory (package-based, using FhirContext) to
/// remote (HTTP terminology server). The validator calls this trait during
/// the terminology validation step.
pub trait TerminologyProvider: Send + Sync {
    /// Validate a code against a ValueSet binding.
    ///
    /// Returns `Ok(None)` if the ValueSet cannot be resolved (provider doesn't know it).
    /// Returns `Ok(Some(result))` with validation outcome if the ValueSet is known.
    fn validate_code(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
        value_set_url: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<CodeValidationResult>, Box<dyn std::error::Error>>;

    /// Check if a code exists in a CodeSystem (without ValueSet context).
    ///
    /// Returns `Ok(None)` if the CodeSystem is not known.
    fn validate_code_in_system(
        &self,
        system: &str,
        code: &str,
        cancellation: &CancellationToken,
    ) -> Result<Option<CodeValidationResult>, Box<dyn std::error::Error>>;

    /// Whether `system` is one of the systems a bound ValueSet's expansion
    /// declares (directly, or via an external-system wildcard). Used to
    /// decide whether a failed extensible binding should warn: a code whose
    /// system the ValueSet never mentions is read as *extending* the
    /// binding, not violating it.
    ///
    /// Returns `Ok(None)` when the provider has no opinion (e.g. the
    /// ValueSet isn't loaded); callers should treat that permissively.
    fn value_set_declares_system(
        &self,
        _value_set_url: &str,
        _system: &str,
    ) -> Result<Option<bool>, Box<dyn std::error::Error>> {
        Ok(None)
    }
}
