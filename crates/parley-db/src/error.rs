use parley_types::error::ChatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("DB lock poisoned: {0}")]
    Poisoned(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for ChatError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => ChatError::NotFound(what),
            other => ChatError::Store(other.to_string()),
        }
    }
}
