use crate::resolver::TypeResolver;
use crate::terminology::{InMemoryTerminologyProvider, TerminologyProvider};
use crate::{ConfigError, TerminologyMode, ValidationPlan};
use ferrum_context::FhirContext;
use ferrum_fhirpath::Engine as FhirPathEngine;
use ferrum_snapshot::ExpandedFhirContext;
use rayon::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reusable validator - owns plan, context, FHIRPath engine, and optional terminology provider
pub struct Validator<C: FhirContext> {
    plan: ValidationPlan,
    context: Arc<C>,
    fhirpath_engine: Arc<FhirPathEngine>,
    terminology: Option<Arc<dyn TerminologyProvider>>,
    type_resolver: Arc<TypeResolver<C>>,
}

impl<C: FhirContext + 'static> Validator<C> {
    pub fn new(plan: ValidationPlan, context: C) -> Self {
        let context = Arc::new(context);

        // Create FHIRPath engine sharing the same context for discriminator evaluation
        let fhirpath_engine = Arc::new(FhirPathEngine::new(
            context.clone() as Arc<dyn FhirContext>,
            None,
        ));

        // Create terminology provider based on plan
        let terminology = Self::create_terminology_provider(&plan, &context);
        let type_resolver = Arc::new(TypeResolver::new(context.clone()));

        Self {
            plan,
            context,
            fhirpath_engine,
            terminology,
            type_resolver,
        }
    }

    pub fn from_config(config: &crate::ValidatorConfig, context: C) -> Result<Self, ConfigError> {
        let plan = config.compile()?;
        Ok(Self::new(plan, context))
    }

    /// Wrap the current context with an [`ExpandedFhirContext`], which:
    /// - materializes snapshots from differentials (via `baseDefinition`)
    /// - deep-expands snapshots for nested type validation
    /// - caches expanded StructureDefinitions across validation runs
    pub fn with_expanded_snapshots(self) -> Validator<ExpandedFhirContext<C>>
    where
        C: Clone,
    {
        // Extract inner context from Arc
        let inner_context = Arc::try_unwrap(self.context).unwrap_or_else(|arc| (*arc).clone());
        let expanded_context = ExpandedFhirContext::new(inner_context);
        let expanded_arc = Arc::new(expanded_context);

        // Create new engine for the expanded context
        let fhirpath_engine = Arc::new(FhirPathEngine::new(
            expanded_arc.clone() as Arc<dyn FhirContext>,
            None,
        ));

        // Create terminology provider for expanded context
        let terminology = Validator::<ExpandedFhirContext<C>>::create_terminology_provider_from_plan_and_context(
            &self.plan,
            &expanded_arc,
        );
        let type_resolver = Arc::new(TypeResolver::new(expanded_arc.clone()));

        Validator {
            plan: self.plan,
            context: expanded_arc,
            fhirpath_engine,
            terminology,
            type_resolver,
        }
    }

    /// Validate a single resource against the compiled plan.
    #[tracing::instrument(level = "debug", skip_all, fields(resource_type = tracing::field::Empty))]
    pub fn validate(&self, resource: &Value) -> ValidationOutcome {
        self.validate_with_cancellation(resource, &CancellationToken::new())
    }

    /// Validate a single resource, stopping early if `cancellation` fires.
    /// A canceled run returns the partial [`ValidationOutcome`] accumulated
    /// so far with `canceled` set, not an error.
    pub fn validate_with_cancellation(
        &self,
        resource: &Value,
        cancellation: &CancellationToken,
    ) -> ValidationOutcome {
        if let Some(rt) = resource.get("resourceType").and_then(|v| v.as_str()) {
            tracing::Span::current().record("resource_type", rt);
        }
        ValidationRun::new(
            &self.plan,
            &self.context,
            &self.fhirpath_engine,
            self.terminology.as_deref(),
            &self.type_resolver,
            cancellation,
            resource,
        )
        .execute()
    }

    /// Validate many resources independently in parallel. Each resource owns
    /// its own `ValidationRun`/issue list; nothing is shared but the
    /// read-mostly caches (`TypeResolver`, terminology expansion). Results
    /// are returned in input order regardless of completion order.
    pub fn validate_batch(&self, resources: &[Value]) -> Vec<ValidationOutcome>
    where
        C: Sync,
    {
        let cancellation = CancellationToken::new();
        resources
            .par_iter()
            .map(|r| self.validate_with_cancellation(r, &cancellation))
            .collect()
    }

    /// Like [`Self::validate_batch`], but every job shares `cancellation` —
    /// firing it stops in-flight and not-yet-started jobs early.
    pub fn validate_batch_with_cancellation(
        &self,
        resources: &[Value],
        cancellation: &CancellationToken,
    ) -> Vec<ValidationOutcome>
    where
        C: Sync,
    {
        resources
            .par_iter()
            .map(|r| self.validate_with_cancellation(r, cancellation))
            .collect()
    }

    pub fn plan(&self) -> &ValidationPlan {
        &self.plan
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    fn create_terminology_provider(
        plan: &ValidationPlan,
        context: &Arc<C>,
    ) -> Option<Arc<dyn TerminologyProvider>> {
        Self::create_terminology_provider_from_plan_and_context(plan, context)
    }

    fn create_terminology_provider_from_plan_and_context(
        plan: &ValidationPlan,
        context: &Arc<C>,
    ) -> Option<Arc<dyn TerminologyProvider>> {
        // Check if any step requires terminology
        let has_terminology_step = plan.steps.iter().any(|s| {
            matches!(s, crate::Step::Terminology(t) if t.mode != TerminologyMode::Off)
        });

        if !has_terminology_step {
            return None;
        }

        // For Local mode, create an InMemoryTerminologyProvider
        Some(Arc::new(InMemoryTerminologyProvider::new(context.clone())))
    }
}

/// Short-lived validation execution
struct ValidationRun<'a, C: FhirContext> {
    plan: &'a ValidationPlan,
    context: &'a Arc<C>,
    fhirpath_engine: &'a Arc<FhirPathEngine>,
    terminology: Option<&'a dyn TerminologyProvider>,
    type_resolver: &'a TypeResolver<C>,
    cancellation: &'a CancellationToken,
    resource: &'a Value,
    issues: Vec<ValidationIssue>,
}

impl<'a, C: FhirContext> ValidationRun<'a, C> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        plan: &'a ValidationPlan,
        context: &'a Arc<C>,
        fhirpath_engine: &'a Arc<FhirPathEngine>,
        terminology: Option<&'a dyn TerminologyProvider>,
        type_resolver: &'a TypeResolver<C>,
        cancellation: &'a CancellationToken,
        resource: &'a Value,
    ) -> Self {
        Self {
            plan,
            context,
            fhirpath_engine,
            terminology,
            type_resolver,
            cancellation,
            resource,
            issues: Vec::new(),
        }
    }

    fn execute(mut self) -> ValidationOutcome {
        let mut canceled = false;

        for step in &self.plan.steps {
            if self.cancellation.is_cancelled() {
                canceled = true;
                break;
            }

            if self.plan.fail_fast && self.has_errors() {
                break;
            }

            if self.issues.len() >= self.plan.max_issues {
                break;
            }

            self.execute_step(step);
        }

        ValidationOutcome {
            resource_type: self.get_resource_type(),
            valid: !self.has_errors(),
            issues: self.issues,
            canceled,
        }
    }

    fn execute_step(&mut self, step: &crate::Step) {
        use crate::Step;

        match step {
            Step::Schema(plan) => self.validate_schema(plan),
            Step::Profiles(plan) => self.validate_profiles(plan),
            Step::Constraints(plan) => self.validate_constraints(plan),
            Step::Terminology(plan) => self.validate_terminology(plan),
            Step::References(plan) => self.validate_references(plan),
            Step::Bundles(plan) => self.validate_bundles(plan),
        }
    }

    fn validate_schema(&mut self, plan: &crate::SchemaPlan) {
        crate::steps::schema::validate_schema(
            self.resource,
            plan,
            self.context.as_ref(),
            &mut self.issues,
        );
        crate::steps::extensions::validate_extensions(self.resource, self.context.as_ref(), &mut self.issues);
    }

    fn validate_profiles(&mut self, plan: &crate::ProfilesPlan) {
        crate::steps::profiles::validate_profiles(
            self.resource,
            plan,
            self.context.as_ref(),
            self.fhirpath_engine,
            &mut self.issues,
        );
    }

    fn validate_constraints(&mut self, plan: &crate::ConstraintsPlan) {
        crate::steps::constraints::validate_constraints(
            self.resource,
            plan,
            self.context.as_ref(),
            self.fhirpath_engine,
            &mut self.issues,
        );
    }

    fn validate_terminology(&mut self, plan: &crate::TerminologyPlan) {
        if let Some(terminology) = self.terminology {
            crate::steps::terminology::validate_terminology(
                self.resource,
                plan,
                self.context.as_ref(),
                terminology,
                self.cancellation,
                &mut self.issues,
            );
        }
    }

    fn validate_references(&mut self, plan: &crate::ReferencesPlan) {
        if plan.mode == crate::ReferenceMode::Off {
            return;
        }
        crate::steps::references::validate_references(
            self.resource,
            self.type_resolver,
            self.cancellation,
            &mut self.issues,
        );
    }

    /// Minimal bundle-level check: every `entry[].fullUrl` must be unique.
    /// Per-entry structural/reference validation already runs via the
    /// contained-resource walk each other step performs.
    fn validate_bundles(&mut self, plan: &crate::BundlePlan) {
        if plan.mode == crate::BundleMode::Off {
            return;
        }
        if self.resource.get("resourceType").and_then(|v| v.as_str()) != Some("Bundle") {
            return;
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(entries) = self.resource.get("entry").and_then(|v| v.as_array()) {
            for (i, entry) in entries.iter().enumerate() {
                let Some(full_url) = entry.get("fullUrl").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !seen.insert(full_url.to_string()) {
                    self.issues.push(
                        ValidationIssue::error(
                            IssueCode::BusinessRule,
                            format!("Duplicate Bundle.entry.fullUrl '{}'", full_url),
                        )
                        .with_location(format!("Bundle.entry[{}]", i)),
                    );
                }
            }
        }
    }

    fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error || i.severity == IssueSeverity::Fatal)
    }

    fn get_resource_type(&self) -> Option<String> {
        self.resource
            .get("resourceType")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Validation result for a single resource
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub resource_type: Option<String>,
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    /// Set when the run was stopped early by a fired `CancellationToken`.
    /// `issues` still holds whatever was accumulated before cancellation;
    /// this is not an error condition.
    pub canceled: bool,
}

impl ValidationOutcome {
    pub fn success(resource_type: Option<String>) -> Self {
        Self {
            resource_type,
            valid: true,
            issues: Vec::new(),
            canceled: false,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.valid
    }

    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error || i.severity == IssueSeverity::Fatal)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count()
    }

    pub fn to_operation_outcome(&self) -> Value {
        serde_json::json!({
            "resourceType": "OperationOutcome",
            "issue": self.issues.iter().map(|i| i.to_json()).collect::<Vec<_>>()
        })
    }
}

/// Individual validation issue
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub code: IssueCode,
    pub diagnostics: String,
    pub location: Option<String>,
    pub expression: Option<Vec<String>>,
}

impl ValidationIssue {
    pub fn error(code: IssueCode, diagnostics: String) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code,
            diagnostics,
            location: None,
            expression: None,
        }
    }

    pub fn warning(code: IssueCode, diagnostics: String) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code,
            diagnostics,
            location: None,
            expression: None,
        }
    }

    pub fn information(code: IssueCode, diagnostics: String) -> Self {
        Self {
            severity: IssueSeverity::Information,
            code,
            diagnostics,
            location: None,
            expression: None,
        }
    }

    pub fn with_location(mut self, location: String) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_expression(mut self, expression: Vec<String>) -> Self {
        self.expression = Some(expression);
        self
    }

    fn to_json(&self) -> Value {
        let mut issue = serde_json::json!({
            "severity": self.severity.to_string().to_lowercase(),
            "code": self.code.to_string(),
            "diagnostics": self.diagnostics,
        });

        if let Some(ref loc) = self.location {
            issue["location"] = serde_json::json!([loc]);
        }

        if let Some(ref expr) = self.expression {
            issue["expression"] = serde_json::json!(expr);
        }

        issue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal => write!(f, "Fatal"),
            Self::Error => write!(f, "Error"),
            Self::Warning => write!(f, "Warning"),
            Self::Information => write!(f, "Information"),
        }
    }
}

/// FHIR-standard top-level codes plus named sub-codes for the binding,
/// extension, and reference validators. Every sub-code maps to exactly one
/// top-level code via [`IssueCode::top_level_code`] when serialized to an
/// `OperationOutcome` — the internal enum is more specific than the wire
/// vocabulary, not a replacement for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCode {
    Invalid,
    Structure,
    Required,
    Value,
    Invariant,
    Processing,
    NotFound,
    CodeInvalid,
    Extension,
    BusinessRule,
    Informational,
    Success,
    Timeout,

    BindingCannotValidate,
    BindingValueSetNotFound,
    BindingRequired,
    BindingExtensible,

    ExtensionNoURL,
    ExtensionUnknown,
    ExtensionInvalidContext,
    ExtensionValueNotAllowed,
    ExtensionValueRequired,
    ExtensionInvalidValueType,
    ExtensionNestedUnknown,

    ReferenceTargetType,
}

impl IssueCode {
    /// Collapse this code to one of the closed `OperationOutcome.issue.code`
    /// values: `invalid, structure, required, value, invariant, processing,
    /// not-found, code-invalid, extension, business-rule, informational,
    /// success, timeout`.
    pub fn top_level_code(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Structure => "structure",
            Self::Required => "required",
            Self::Value => "value",
            Self::Invariant => "invariant",
            Self::Processing => "processing",
            Self::NotFound => "not-found",
            Self::CodeInvalid => "code-invalid",
            Self::Extension => "extension",
            Self::BusinessRule => "business-rule",
            Self::Informational => "informational",
            Self::Success => "success",
            Self::Timeout => "timeout",

            Self::BindingCannotValidate => "informational",
            Self::BindingValueSetNotFound => "not-found",
            Self::BindingRequired => "code-invalid",
            Self::BindingExtensible => "code-invalid",

            Self::ExtensionNoURL
            | Self::ExtensionUnknown
            | Self::ExtensionInvalidContext
            | Self::ExtensionValueNotAllowed
            | Self::ExtensionValueRequired
            | Self::ExtensionInvalidValueType
            | Self::ExtensionNestedUnknown => "extension",

            Self::ReferenceTargetType => "value",
        }
    }
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.top_level_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_outcome_operations() {
        let outcome = ValidationOutcome {
            resource_type: Some("Patient".to_string()),
            valid: false,
            issues: vec![
                ValidationIssue::error(IssueCode::Required, "Missing required field".to_string()),
                ValidationIssue::warning(IssueCode::Value, "Deprecated code".to_string()),
            ],
            canceled: false,
        };

        assert!(!outcome.valid);
        assert!(outcome.has_errors());
        assert_eq!(outcome.error_count(), 1);
        assert_eq!(outcome.warning_count(), 1);
    }

    #[test]
    fn test_operation_outcome_conversion() {
        let outcome = ValidationOutcome {
            resource_type: Some("Patient".to_string()),
            valid: false,
            issues: vec![ValidationIssue::error(
                IssueCode::Required,
                "name is required".to_string(),
            )
            .with_location("Patient.name".to_string())
            .with_expression(vec!["Patient.name".to_string()])],
            canceled: false,
        };

        let op_outcome = outcome.to_operation_outcome();
        assert_eq!(op_outcome["resourceType"], "OperationOutcome");
        assert_eq!(op_outcome["issue"][0]["severity"], "error");
        assert_eq!(op_outcome["issue"][0]["code"], "required");
    }
}
