//! Error types for the engine

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to engine callers.
///
/// Background failures (persistence, metrics, pruning) are logged, not
/// surfaced; this type covers only what a caller can act on.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A service wrapper was used on an entity that has not been bound
    /// to a connection yet
    #[error("entity {0} is not registered with a connection")]
    EntityNotRegistered(String),

    #[error(transparent)]
    Ws(#[from] haven_ws::WsError),

    #[error(transparent)]
    Store(#[from] haven_store::StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Two or more members of a group operation failed
    #[error("{}", join_errors(.0))]
    Multiple(Vec<EngineError>),
}

impl EngineError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, EngineError::Ws(err) if err.is_not_connected())
    }
}

fn join_errors(errors: &[EngineError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
