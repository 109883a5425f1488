use thiserror::Error;

/// Failures surfaced to callers of chat operations.
///
/// None of these are retried by the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Missing caller identity.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A known caller not allowed to touch the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The transaction was rolled back; nothing was written.
    #[error("store error: {0}")]
    Store(String),
}

impl ChatError {
    pub fn unauthenticated() -> Self {
        Self::Authorization("no caller identity".into())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

