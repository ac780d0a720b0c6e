//! The compiled, executable form of a [`crate::ValidatorConfig`].
//!
//! A [`ValidationPlan`] is an ordered list of [`Step`]s, each carrying only
//! the fields its validation step actually reads. Steps that are `Off` in
//! the config simply don't appear here — a [`crate::Validator`] never has to
//! branch on mode at validation time.

use crate::{
    BestPracticeMode, BundleConfig, ConstraintId, ConstraintLevelOverride, ConstraintsConfig,
    ExtensibleHandling, ProfilesConfig, ReferenceMode, ReferencesConfig, SchemaConfig,
    TerminologyConfig, TerminologyMode,
};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ValidationPlan {
    pub steps: Vec<Step>,
    pub fail_fast: bool,
    pub max_issues: usize,
}

#[derive(Debug, Clone)]
pub enum Step {
    Schema(SchemaPlan),
    Profiles(ProfilesPlan),
    Constraints(ConstraintsPlan),
    Terminology(TerminologyPlan),
    References(ReferencesPlan),
    Bundles(BundlePlan),
}

#[derive(Debug, Clone)]
pub struct SchemaPlan {
    pub allow_unknown_elements: bool,
    pub allow_modifier_extensions: bool,
}

impl From<&SchemaConfig> for SchemaPlan {
    fn from(cfg: &SchemaConfig) -> Self {
        Self {
            allow_unknown_elements: cfg.allow_unknown_elements,
            allow_modifier_extensions: cfg.allow_modifier_extensions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfilesPlan {
    pub explicit_profiles: Option<Vec<String>>,
}

impl From<&ProfilesConfig> for ProfilesPlan {
    fn from(cfg: &ProfilesConfig) -> Self {
        Self {
            explicit_profiles: cfg.explicit_profiles.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConstraintsPlan {
    pub best_practice: BestPracticeMode,
    pub suppress: Vec<ConstraintId>,
    pub level_overrides: Vec<ConstraintLevelOverride>,
}

impl From<&ConstraintsConfig> for ConstraintsPlan {
    fn from(cfg: &ConstraintsConfig) -> Self {
        Self {
            best_practice: cfg.best_practice,
            suppress: cfg.suppress.clone(),
            level_overrides: cfg.level_overrides.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminologyPlan {
    pub mode: TerminologyMode,
    pub extensible_handling: ExtensibleHandling,
    pub timeout: Duration,
}

impl From<&TerminologyConfig> for TerminologyPlan {
    fn from(cfg: &TerminologyConfig) -> Self {
        Self {
            mode: cfg.mode,
            extensible_handling: cfg.extensible_handling,
            timeout: cfg.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferencesPlan {
    pub mode: ReferenceMode,
    pub allow_external: bool,
}

impl From<&ReferencesConfig> for ReferencesPlan {
    fn from(cfg: &ReferencesConfig) -> Self {
        Self {
            mode: cfg.mode,
            allow_external: cfg.allow_external,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundlePlan {
    pub mode: crate::BundleMode,
}

impl From<&BundleConfig> for BundlePlan {
    fn from(cfg: &BundleConfig) -> Self {
        Self { mode: cfg.mode }
    }
}
