use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid StructureDefinition: {0}")]
    InvalidStructureDefinition(String),
}

pub type Result<T> = std::result::Result<T, Error>;
