//! Shared error types for the services crate.

use thiserror::Error;

use lms_core::RecordError;
use lms_storage::RemoteError;
use lms_storage::sqlite::SqliteInitError;

/// Errors emitted by `ProgressStore`.
///
/// Storage and remote failures never show up here: they are logged and
/// absorbed. Only invalid input and bootstrap failures reach the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error("progress store must be opened inside a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Errors from remote writes the caller waits on (ratings and comments).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Errors emitted by `CourseCatalog` implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("course catalog unavailable: {0}")]
    Unavailable(String),
    #[error("malformed course catalog: {0}")]
    Malformed(#[from] serde_json::Error),
}
