use thiserror::Error;

/// Domain errors surfaced by the core services. `Invalid` covers missing or
/// nonexistent referenced entities and invariant violations; `Storage` wraps
/// anything the persistence layer failed at.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
