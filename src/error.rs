use thiserror::Error;

/// Error kinds the orchestrator surfaces distinctly to callers. Everything
/// below the orchestrator boundary (fetch, parse, adapter internals) uses
/// `anyhow::Error` and is folded into `EngineError::Adapter` or swallowed as
/// an empty result, per the failure semantics in the design notes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown source requested: {0}")]
    UnknownSource(String),

    #[error("query must be between 2 and 120 characters")]
    InvalidQuery,

    #[error("limit must be between 1 and 100")]
    InvalidLimit,

    #[error("adapter {source} failed: {cause}")]
    Adapter { source: String, cause: anyhow::Error },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
