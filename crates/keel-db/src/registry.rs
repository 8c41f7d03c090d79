//! The session registry: one session per live request scope.
//!
//! The registry maps [`ContextKey`]s to open [`Session`]s. Sessions are
//! created on the first lookup for a key and stay until the key is removed,
//! which the request scope does exactly once when its request finishes.
//!
//! The map is sharded (`dashmap`), so requests with different keys do not
//! contend on one lock, and no shard lock is held while a new session waits
//! for a pooled connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use keel_types::ContextKey;

use crate::error::DbError;
use crate::pool::DbPool;
use crate::schema::Metadata;
use crate::session::{Pooled, Session};

/// How long one pool wait lasts before `resolve_while` re-checks its caller.
const CHECKOUT_SLICE: Duration = Duration::from_millis(50);

/// Concurrent map from scope key to session. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<ContextKey, Arc<Session>>,
    pool: DbPool,
    metadata: Arc<Metadata>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Creates an empty registry whose sessions come from `pool`.
    pub fn new(pool: DbPool, metadata: Arc<Metadata>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                pool,
                metadata,
            }),
        }
    }

    /// Returns the session for `key`, opening one if none exists.
    ///
    /// Repeated calls with the same key return the same `Arc<Session>`. This
    /// blocks while waiting for a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns the error from opening the session (for example
    /// `DbError::Pool` when the pool is exhausted). Nothing is stored in that
    /// case.
    pub fn resolve(&self, key: ContextKey) -> Result<Arc<Session>, DbError> {
        self.resolve_while(key, || true)
    }

    /// Like [`resolve`](Self::resolve), but gives up once `wanted` returns
    /// `false`.
    ///
    /// `wanted` is checked before and during the wait for a pooled
    /// connection, so a caller whose request has gone away stops queueing
    /// for the pool.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ScopeClosed` if `wanted` turned `false` before a
    /// session was stored, and otherwise the same errors as `resolve`.
    pub fn resolve_while(
        &self,
        key: ContextKey,
        wanted: impl Fn() -> bool,
    ) -> Result<Arc<Session>, DbError> {
        if let Some(session) = self.get(key) {
            return Ok(session);
        }

        let conn = self.checkout(key, &wanted)?;
        let fresh = Arc::new(Session::with_checked_out(
            key,
            conn,
            Arc::clone(&self.inner.metadata),
        ));

        let session = Arc::clone(
            self.inner
                .sessions
                .entry(key)
                .or_insert_with(|| Arc::clone(&fresh))
                .value(),
        );

        if !Arc::ptr_eq(&session, &fresh) {
            // Another caller with the same key won the race.
            fresh.close();
        }
        Ok(session)
    }

    /// Waits up to the pool's connection timeout, in slices, for a connection.
    fn checkout(&self, key: ContextKey, wanted: &impl Fn() -> bool) -> Result<Pooled, DbError> {
        let pool = &self.inner.pool;
        let deadline = Instant::now() + pool.connection_timeout();
        loop {
            if !wanted() {
                return Err(DbError::ScopeClosed(key));
            }
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(CHECKOUT_SLICE);
            match pool.get_timeout(slice) {
                Ok(conn) => return Ok(conn),
                Err(e) if Instant::now() >= deadline => return Err(e.into()),
                Err(_) => continue,
            }
        }
    }

    /// Returns the session for `key` without creating one.
    pub fn get(&self, key: ContextKey) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns `true` if a session exists for `key`.
    pub fn has(&self, key: ContextKey) -> bool {
        self.inner.sessions.contains_key(&key)
    }

    /// Closes and forgets the session for `key`. No-op if there is none.
    pub fn remove(&self, key: ContextKey) {
        if let Some(session) = self.take(key) {
            session.close();
        }
    }

    /// Forgets the session for `key` and hands it to the caller to close.
    pub fn take(&self, key: ContextKey) -> Option<Arc<Session>> {
        self.inner.sessions.remove(&key).map(|(_, session)| session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// The pool sessions are opened from.
    pub fn pool(&self) -> &DbPool {
        &self.inner.pool
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.inner.metadata
    }
}
