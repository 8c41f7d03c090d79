//! Error type for the database layer.

use keel_types::ContextKey;

use crate::url::UrlError;

/// Errors that can occur in sessions, the registry, and model operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A lookup by primary key found nothing.
    #[error("{table} with id {id} not found")]
    NotFound {
        /// Table that was queried.
        table: String,
        /// Primary key that was looked up.
        id: i64,
    },

    /// A SQLite statement failed.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A scoped operation was attempted outside any request scope.
    #[error("no active request scope; run inside the request-scope middleware or `scope::run_scoped`")]
    NoActiveScope,

    /// The request scope has already been cleaned up.
    #[error("request scope {0} is closed")]
    ScopeClosed(ContextKey),

    /// The session was closed when its request finished.
    #[error("session for scope {0} is closed")]
    SessionClosed(ContextKey),

    /// An instance operation requires a primary key the instance does not have.
    #[error("{0} instance has not been saved")]
    NotPersisted(String),

    /// Bulk truncation was requested outside testing without `force`.
    #[error("can only truncate while TESTING=TRUE or with force")]
    TruncateRefused,

    /// The database URL could not be used to build an engine.
    #[error(transparent)]
    Url(#[from] UrlError),

    /// A lock guarding session state was poisoned by a panicking thread.
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    /// A blocking database task panicked or was cancelled.
    #[error("blocking database task failed: {0}")]
    Blocking(String),

    /// JSON serialization of audit data failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// Returns `true` for the not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Blocking(err.to_string())
    }
}
