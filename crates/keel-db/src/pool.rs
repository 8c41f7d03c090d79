//! Connection pool creation and configuration.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::error::DbError;
use crate::url::{DatabaseUrl, SqliteTarget};

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long a session waits for a pooled connection, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            connection_timeout_ms: 30_000,
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Creates a SQLite connection pool for the given URL.
///
/// File databases run in WAL mode so that one request can write while other
/// requests read. Every connection has foreign keys enabled.
///
/// In-memory databases live inside a single connection, so their pool is
/// capped at one connection that is never recycled; concurrent sessions on
/// such an engine wait for each other.
///
/// # Errors
///
/// Returns `DbError::Url` if the URL does not name a SQLite database and
/// `DbError::Pool` if the connection pool cannot be created.
pub fn create_pool(url: &DatabaseUrl, settings: DbRuntimeSettings) -> Result<DbPool, DbError> {
    let target = url.sqlite_target()?;

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = match &target {
        SqliteTarget::Memory => SqliteConnectionManager::memory(),
        SqliteTarget::File(path) => SqliteConnectionManager::file(path),
    };

    let manager = manager.with_flags(flags).with_init(move |conn| {
        // In-memory databases report "memory" which is expected and acceptable.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if journal_mode != "wal" && journal_mode != "memory" {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!(
                    "failed to set WAL journal mode, got: {}",
                    journal_mode
                )),
            ));
        }
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            settings.busy_timeout_ms
        ))
    });

    let builder = Pool::builder().connection_timeout(Duration::from_millis(
        settings.connection_timeout_ms,
    ));

    let pool = match target {
        SqliteTarget::Memory => {
            if settings.pool_max_size > 1 {
                tracing::debug!(
                    requested = settings.pool_max_size,
                    "in-memory database: limiting pool to a single connection"
                );
            }
            builder
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .build(manager)?
        }
        SqliteTarget::File(_) => builder.max_size(settings.pool_max_size).build(manager)?,
    };

    Ok(pool)
}
