//! Request scopes: the task-local "current request" and its cleanup.
//!
//! A [`RequestScope`] carries the [`ContextKey`] of one request together with
//! the registry its session lives in. [`run_scoped`] publishes a scope to the
//! future it runs (via `tokio::task_local!`) and guarantees that the scope's
//! session is removed from the registry when that future finishes, returns an
//! error, panics, or is dropped before completion.
//!
//! Code inside the future finds its scope with [`current`] and its session
//! with [`current_session`]. Outside any scope both report
//! [`DbError::NoActiveScope`] rather than falling back to a shared session.
//!
//! Work that outlives the scoped future but still belongs to its request,
//! such as the socket task of a WebSocket upgrade, [`retain`]s the scope.
//! The scope then closes when the last of the future and its
//! [`ScopeHandle`]s is done.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use keel_types::{ContextKey, RequestInfo};
use tokio::task::JoinHandle;

use crate::error::DbError;
use crate::registry::SessionRegistry;
use crate::session::Session;

tokio::task_local! {
    static CURRENT: Arc<RequestScope>;
}

/// State of one request scope.
#[derive(Debug)]
pub struct RequestScope {
    key: ContextKey,
    registry: SessionRegistry,
    info: RequestInfo,
    actor: Option<i64>,
    holders: AtomicUsize,
    closed: AtomicBool,
}

impl RequestScope {
    /// Creates a scope with a freshly minted key.
    pub fn new(registry: SessionRegistry, info: RequestInfo) -> Self {
        Self {
            key: ContextKey::mint(),
            registry,
            info,
            actor: None,
            holders: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the actor that sessions of this scope record in audit entries.
    pub fn with_actor(mut self, actor: Option<i64>) -> Self {
        self.actor = actor;
        self
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Returns `true` once the scope has been cleaned up.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns `true` if this scope's session has been opened.
    pub fn has_session(&self) -> bool {
        self.registry.has(self.key)
    }

    /// Resolves this scope's session, opening it on first use.
    ///
    /// Blocks while waiting for a pooled connection; use [`Self::session`]
    /// from async code.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ScopeClosed` after cleanup, or the error from
    /// opening the session.
    pub fn session_blocking(&self) -> Result<Arc<Session>, DbError> {
        if self.is_closed() {
            return Err(DbError::ScopeClosed(self.key));
        }
        let session = self
            .registry
            .resolve_while(self.key, || !self.is_closed())?;
        if self.is_closed() {
            // Cleanup ran while the session was being opened; do not leave
            // an entry behind for a finished request.
            self.registry.remove(self.key);
            return Err(DbError::ScopeClosed(self.key));
        }
        if self.actor.is_some() && session.actor().is_none() {
            session.set_actor(self.actor);
        }
        Ok(session)
    }

    /// Resolves this scope's session, opening it on a blocking thread on
    /// first use.
    pub async fn session(self: &Arc<Self>) -> Result<Arc<Session>, DbError> {
        if !self.is_closed() {
            if let Some(session) = self.registry.get(self.key) {
                return Ok(session);
            }
        }
        let scope = Arc::clone(self);
        tokio::task::spawn_blocking(move || scope.session_blocking()).await?
    }

    /// Keeps this scope open until the returned handle is dropped, even if
    /// the future that opened it has finished.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ScopeClosed` once the scope has been cleaned up.
    pub fn retain(self: &Arc<Self>) -> Result<ScopeHandle, DbError> {
        let mut holders = self.holders.load(Ordering::SeqCst);
        loop {
            if holders == 0 || self.is_closed() {
                return Err(DbError::ScopeClosed(self.key));
            }
            match self.holders.compare_exchange(
                holders,
                holders + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(ScopeHandle {
                        guard: ScopeGuard(Arc::clone(self)),
                    })
                }
                Err(actual) => holders = actual,
            }
        }
    }

    /// Closes the scope and removes its session. Runs its effect once.
    ///
    /// The entry leaves the registry right away. If another thread is still
    /// using the session, closing it is handed to a blocking thread so the
    /// caller never waits on SQLite.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.registry.take(self.key);
        let had_session = session.is_some();
        if let Some(session) = session {
            if !session.try_close() {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn_blocking(move || session.close());
                    }
                    Err(_) => session.close(),
                }
            }
        }
        tracing::debug!(
            key = %self.key,
            kind = %self.info.kind,
            had_session,
            "request scope closed"
        );
    }
}

/// One hold on a scope. The last one dropped closes it, whichever way the
/// scoped future ends.
#[derive(Debug)]
struct ScopeGuard(Arc<RequestScope>);

impl ScopeGuard {
    fn first(scope: Arc<RequestScope>) -> Self {
        scope.holders.fetch_add(1, Ordering::SeqCst);
        Self(scope)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.0.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.close();
        }
    }
}

/// Keeps a request scope open past the future that opened it.
///
/// Obtained from [`retain`] or [`RequestScope::retain`]. The scope closes
/// when every handle and the original future are gone.
#[derive(Debug)]
pub struct ScopeHandle {
    guard: ScopeGuard,
}

impl ScopeHandle {
    pub fn scope(&self) -> &Arc<RequestScope> {
        &self.guard.0
    }

    /// Runs `fut` as part of the retained scope, then releases the handle.
    pub async fn run<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        let scope = Arc::clone(self.scope());
        let output = CURRENT.scope(scope, fut).await;
        drop(self);
        output
    }
}

/// Runs `fut` inside `scope` and cleans the scope up afterwards.
///
/// Cleanup also happens if `fut` panics or if the returned future is dropped
/// before it completes.
pub async fn run_scoped<F>(scope: RequestScope, fut: F) -> F::Output
where
    F: Future,
{
    let scope = Arc::new(scope);
    tracing::debug!(key = %scope.key, kind = %scope.info.kind, "request scope opened");
    let _guard = ScopeGuard::first(Arc::clone(&scope));
    CURRENT.scope(scope, fut).await
}

/// Spawns `fut` on the runtime, inheriting the caller's scope if there is one.
///
/// The sub-task shares the caller's session. Once the parent request has
/// finished, the inherited scope is closed and session lookups in the
/// sub-task fail with `DbError::ScopeClosed`.
pub fn spawn_in_scope<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(scope) => tokio::spawn(CURRENT.scope(scope, fut)),
        None => tokio::spawn(fut),
    }
}

/// The scope of the calling task, if any.
pub fn current() -> Option<Arc<RequestScope>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// The key of the calling task's scope, if any.
pub fn current_key() -> Option<ContextKey> {
    CURRENT.try_with(|scope| scope.key).ok()
}

/// The scope of the calling task.
///
/// # Errors
///
/// Returns `DbError::NoActiveScope` outside any scope.
pub fn require() -> Result<Arc<RequestScope>, DbError> {
    current().ok_or(DbError::NoActiveScope)
}

/// Retains the calling task's scope. See [`RequestScope::retain`].
///
/// # Errors
///
/// Returns `DbError::NoActiveScope` outside any scope and
/// `DbError::ScopeClosed` once it has been cleaned up.
pub fn retain() -> Result<ScopeHandle, DbError> {
    require()?.retain()
}

/// The session of the calling task's scope, opened on first use.
pub async fn current_session() -> Result<Arc<Session>, DbError> {
    require()?.session().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbRuntimeSettings};
    use crate::url::DatabaseUrl;
    use std::time::{Duration, Instant};

    fn registry(dir: &tempfile::TempDir) -> SessionRegistry {
        registry_with(dir, DbRuntimeSettings::default())
    }

    fn registry_with(dir: &tempfile::TempDir, settings: DbRuntimeSettings) -> SessionRegistry {
        let url =
            DatabaseUrl::parse(&format!("sqlite:///{}", dir.path().join("c.db").display())).unwrap();
        SessionRegistry::new(create_pool(&url, settings).unwrap(), Arc::default())
    }

    #[tokio::test]
    async fn no_scope_outside_requests() {
        assert!(current().is_none());
        assert!(current_key().is_none());
        assert!(matches!(current_session().await, Err(DbError::NoActiveScope)));
    }

    #[tokio::test]
    async fn scope_is_visible_inside_and_cleaned_after() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();

        let session = run_scoped(scope, async {
            assert_eq!(current_key(), Some(key));
            let first = current_session().await.unwrap();
            let second = current_session().await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));
            first
        })
        .await;

        assert!(!registry.has(key));
        assert!(session.is_closed());
        assert!(current_key().is_none());
    }

    #[tokio::test]
    async fn concurrent_scopes_see_their_own_keys() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let scope = RequestScope::new(registry.clone(), RequestInfo::task());
                let key = scope.key();
                tokio::spawn(run_scoped(scope, async move {
                    tokio::task::yield_now().await;
                    assert_eq!(current_key(), Some(key));
                    current_session().await.unwrap().key()
                }))
            })
            .collect();

        let mut keys = Vec::new();
        for task in tasks {
            keys.push(task.await.unwrap());
        }
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 8);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancelled_scope_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();
        let (opened_tx, opened_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(run_scoped(scope, async move {
            current_session().await.unwrap();
            let _ = opened_tx.send(());
            std::future::pending::<()>().await;
        }));

        opened_rx.await.unwrap();
        assert!(registry.has(key));
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!registry.has(key));
    }

    #[tokio::test]
    async fn sub_tasks_inherit_the_scope() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();

        run_scoped(scope, async move {
            let parent = current_session().await.unwrap();
            let child = spawn_in_scope(async { current_session().await.unwrap() })
                .await
                .unwrap();
            assert!(Arc::ptr_eq(&parent, &child));
        })
        .await;
        assert!(!registry.has(key));
    }

    #[tokio::test]
    async fn late_sub_task_cannot_reopen_a_closed_scope() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

        let child = run_scoped(scope, async move {
            spawn_in_scope(async move {
                go_rx.await.unwrap();
                current_session().await
            })
        })
        .await;

        go_tx.send(()).unwrap();
        let result = child.await.unwrap();
        assert!(matches!(result, Err(DbError::ScopeClosed(k)) if k == key));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn scope_actor_seeds_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry, RequestInfo::task()).with_actor(Some(42));

        run_scoped(scope, async {
            assert_eq!(current_session().await.unwrap().actor(), Some(42));
        })
        .await;
    }

    #[tokio::test]
    async fn retained_scope_outlives_its_future() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();

        // 1. The future opens the session and hands out a handle.
        let (handle, opened) = run_scoped(scope, async {
            let session = current_session().await.unwrap();
            (retain().unwrap(), session)
        })
        .await;

        // 2. The session survives the future because the handle holds it.
        assert!(registry.has(key));
        assert!(!handle.scope().is_closed());

        // 3. Work run through the handle sees the same scope and session.
        let scope = Arc::clone(handle.scope());
        let reused = handle
            .run(async move {
                assert_eq!(current_key(), Some(key));
                current_session().await.unwrap()
            })
            .await;
        assert!(Arc::ptr_eq(&opened, &reused));

        // 4. Releasing the last handle closes the scope.
        assert!(scope.is_closed());
        assert!(!registry.has(key));
        assert!(opened.is_closed());
    }

    #[tokio::test]
    async fn dropped_handle_closes_the_scope() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();

        let handle = run_scoped(scope, async {
            current_session().await.unwrap();
            retain().unwrap()
        })
        .await;
        let scope = Arc::clone(handle.scope());
        assert!(registry.has(key));

        drop(handle);
        assert!(scope.is_closed());
        assert!(!registry.has(key));
        assert!(matches!(scope.retain(), Err(DbError::ScopeClosed(k)) if k == key));
    }

    #[tokio::test]
    async fn retain_outside_a_scope_fails() {
        assert!(matches!(retain(), Err(DbError::NoActiveScope)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cleanup_does_not_wait_for_a_busy_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let scope = RequestScope::new(registry.clone(), RequestInfo::task());
        let key = scope.key();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();

        // 1. A blocking thread is still inside the session when the future ends.
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            run_scoped(scope, async move {
                let session = current_session().await.unwrap();
                let busy = Arc::clone(&session);
                let worker = tokio::task::spawn_blocking(move || {
                    busy.with_connection(|_| {
                        let _ = locked_tx.send(());
                        let _ = release_rx.recv();
                        Ok(())
                    })
                });
                locked_rx.await.unwrap();
                (session, worker)
            }),
        )
        .await;
        let (session, worker) = finished.expect("cleanup blocked on the busy session");

        // 2. The entry is gone even though the session could not close yet.
        assert!(!registry.has(key));

        // 3. Once the blocking work ends, the session is closed behind it.
        release_tx.send(()).unwrap();
        worker.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn closing_scope_stops_waiting_for_a_connection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(
            &dir,
            DbRuntimeSettings {
                pool_max_size: 1,
                connection_timeout_ms: 30_000,
                ..DbRuntimeSettings::default()
            },
        );
        registry.resolve(ContextKey::mint()).unwrap();

        // 1. A request queues for the only connection.
        let scope = Arc::new(RequestScope::new(registry.clone(), RequestInfo::task()));
        let waiter = {
            let scope = Arc::clone(&scope);
            std::thread::spawn(move || scope.session_blocking())
        };
        std::thread::sleep(Duration::from_millis(100));

        // 2. The request goes away; the waiter gives up well before the
        //    pool timeout and stores nothing.
        let started = Instant::now();
        scope.close();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(DbError::ScopeClosed(k)) if k == scope.key()));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!registry.has(scope.key()));
        assert_eq!(registry.len(), 1);
    }
}
