use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("structure definition not found for type '{0}'")]
    StructureDefinitionNotFound(String),

    #[error("invalid structure definition: {0}")]
    InvalidStructureDefinition(String),

    #[error("conformance resource provider failed: {0}")]
    ProviderError(String),

    #[error("no Tokio runtime is available on the current thread")]
    AsyncRuntimeUnavailable,
}

pub type Result<T> = std::result::Result<T, Error>;
