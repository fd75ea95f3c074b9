//! Error type for the persistence layer

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors opening or querying the database.
///
/// Failures inside queued writes never surface here; the async consumer
/// logs them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
