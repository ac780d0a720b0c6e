use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("snapshot generation failed: {0}")]
    Snapshot(String),

    #[error("differential generation failed: {0}")]
    Differential(String),

    #[error("snapshot expansion failed: {0}")]
    Expansion(String),

    #[error("invalid slicing: {0}")]
    Slicing(String),

    #[error(transparent)]
    Context(#[from] ferrum_context::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
