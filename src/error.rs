//! Error types for the signal engine
//!
//! Errors are classified by where they originate:
//! - Store: SQLite, migrations, payload encoding (`DbError`)
//! - Engine: missing or archived targets, worker pool failures, configuration

use thiserror::Error;

pub use crate::db::DbError;

/// Errors surfaced by the `SignalEngine` facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// The event or entity was archived/deleted while work was queued.
    #[error("Target no longer available: {0}")]
    EntityUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding unavailable: {0}")]
    Embedding(String),

    #[error("Worker pool error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Returns true if the caller should simply drop the work item.
    ///
    /// Queued work whose target disappeared is discarded, not retried.
    pub fn is_discardable(&self) -> bool {
        matches!(
            self,
            EngineError::EventNotFound(_) | EngineError::EntityUnavailable(_)
        )
    }

    /// Returns true if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Db(DbError::Sqlite(e)) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            EngineError::Worker(_) => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Worker(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discardable_classification() {
        assert!(EngineError::EventNotFound("m1".into()).is_discardable());
        assert!(EngineError::EntityUnavailable("m1".into()).is_discardable());
        assert!(!EngineError::Config("bad".into()).is_discardable());
    }

    #[test]
    fn test_worker_errors_are_retryable() {
        assert!(EngineError::Worker("pool closed".into()).is_retryable());
        assert!(!EngineError::Embedding("not ready".into()).is_retryable());
    }
}
