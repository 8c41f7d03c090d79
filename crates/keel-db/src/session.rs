//! Database sessions: a unit of work on one pooled connection.
//!
//! A session checks a connection out of the pool when it is opened and holds
//! it until it is closed. Writes run inside a transaction that the session
//! begins on demand; `commit` and `rollback` end it. Closing a session rolls
//! back anything still uncommitted and returns the connection to the pool.
//!
//! All methods block on SQLite and are meant to run on a blocking thread
//! (`tokio::task::spawn_blocking`) when called from async code.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use keel_types::ContextKey;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::error::DbError;
use crate::pool::DbPool;
use crate::schema::Metadata;

pub(crate) type Pooled = PooledConnection<SqliteConnectionManager>;

/// A unit-of-work handle bound to one pooled connection.
pub struct Session {
    key: ContextKey,
    conn: Mutex<Option<Pooled>>,
    actor: Mutex<Option<i64>>,
    metadata: Arc<Metadata>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Opens a session for `key`, checking a connection out of `pool`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if no connection becomes available within the
    /// pool's connection timeout.
    pub fn open(key: ContextKey, pool: &DbPool, metadata: Arc<Metadata>) -> Result<Self, DbError> {
        Ok(Self::with_checked_out(key, pool.get()?, metadata))
    }

    /// Wraps a connection the caller already checked out.
    pub(crate) fn with_checked_out(key: ContextKey, conn: Pooled, metadata: Arc<Metadata>) -> Self {
        tracing::debug!(key = %key, "session opened");
        Self {
            key,
            conn: Mutex::new(Some(conn)),
            actor: Mutex::new(None),
            metadata,
        }
    }

    /// The scope key this session belongs to.
    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// Tables known to the engine that created this session.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Pooled>>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned("session"))
    }

    /// Returns `true` once the session has been closed.
    pub fn is_closed(&self) -> bool {
        match self.conn.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }

    /// Runs `f` with exclusive access to the session's connection.
    ///
    /// The session lock is held for the duration of `f`; calling back into
    /// the same session from inside `f` deadlocks.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SessionClosed` once the session has been closed,
    /// otherwise whatever `f` returns.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(DbError::SessionClosed(self.key))?;
        f(conn)
    }

    /// Returns `true` while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.with_connection(|conn| Ok(!conn.is_autocommit()))
            .unwrap_or(false)
    }

    /// Begins a write transaction unless one is already open.
    pub fn begin(&self) -> Result<(), DbError> {
        self.with_connection(begin)
    }

    /// Commits the open transaction, if any.
    pub fn commit(&self) -> Result<(), DbError> {
        self.with_connection(commit)
    }

    /// Rolls back the open transaction, if any.
    pub fn rollback(&self) -> Result<(), DbError> {
        self.with_connection(rollback)
    }

    /// Runs `f` inside a transaction and commits it.
    ///
    /// Work already pending on the session is committed along with `f`'s. If
    /// `f` or the commit fails, the transaction is rolled back and the
    /// original error is returned.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        self.with_connection(|conn| {
            begin(conn)?;
            let result = f(conn).and_then(|value| {
                commit(conn)?;
                Ok(value)
            });
            if result.is_err() {
                if let Err(e) = rollback(conn) {
                    tracing::warn!(key = %self.key, "rollback after failed transaction failed: {}", e);
                }
            }
            result
        })
    }

    /// The user recorded as `created_by_id` in audit entries.
    pub fn actor(&self) -> Option<i64> {
        self.actor.lock().map(|a| *a).unwrap_or(None)
    }

    pub fn set_actor(&self, actor: Option<i64>) {
        match self.actor.lock() {
            Ok(mut guard) => *guard = actor,
            Err(poisoned) => *poisoned.into_inner() = actor,
        }
    }

    /// Rolls back uncommitted work and returns the connection to the pool.
    ///
    /// Idempotent. Any later use of the session fails with
    /// `DbError::SessionClosed`.
    pub fn close(&self) {
        let guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(key = %self.key, "session lock poisoned, closing anyway");
                poisoned.into_inner()
            }
        };
        self.release(guard);
    }

    /// Closes the session only if no other thread is using it.
    ///
    /// Returns `false` without waiting when the connection is busy; the
    /// caller should then [`close`](Self::close) it from a blocking thread.
    pub fn try_close(&self) -> bool {
        let guard = match self.conn.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(poisoned)) => {
                tracing::error!(key = %self.key, "session lock poisoned, closing anyway");
                poisoned.into_inner()
            }
        };
        self.release(guard);
        true
    }

    fn release(&self, mut guard: MutexGuard<'_, Option<Pooled>>) {
        if let Some(conn) = guard.take() {
            if let Err(e) = rollback(&conn) {
                tracing::warn!(key = %self.key, "rollback on session close failed: {}", e);
            }
            tracing::debug!(key = %self.key, "session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn begin(conn: &Connection) -> Result<(), DbError> {
    if conn.is_autocommit() {
        conn.execute_batch("BEGIN IMMEDIATE")?;
    }
    Ok(())
}

fn commit(conn: &Connection) -> Result<(), DbError> {
    if !conn.is_autocommit() {
        conn.execute_batch("COMMIT")?;
    }
    Ok(())
}

fn rollback(conn: &Connection) -> Result<(), DbError> {
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    Ok(())
}
