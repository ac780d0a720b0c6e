use thiserror::Error;

/// Errors raised while compiling a [`crate::ValidatorConfig`] into a
/// [`crate::ValidationPlan`]. Validation *findings* are never represented as
/// errors — only configurations that can't be turned into a runnable plan at
/// all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("references.mode = Full requires terminology.mode != Off")]
    TerminologyRequiredForFullRef,
}
