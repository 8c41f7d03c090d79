//! WebSocket upgrades whose socket task stays in the request scope.
//!
//! axum runs the socket callback on a task of its own after the `101`
//! response has been sent, which is after [`RequestScopeLayer`] has
//! finished with the upgrade request. [`ScopedWebSocketUpgrade`] retains the
//! request's scope for that task, so the socket shares the upgrade request's
//! session and the session is cleaned up when the socket task ends.
//!
//! [`RequestScopeLayer`]: crate::RequestScopeLayer

use std::future::Future;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use keel_db::scope::{self, ScopeHandle};

use crate::error::ApiError;

/// Drop-in replacement for [`WebSocketUpgrade`] that carries the request
/// scope into the socket task.
#[derive(Debug)]
pub struct ScopedWebSocketUpgrade {
    upgrade: WebSocketUpgrade,
    handle: ScopeHandle,
}

impl<S> FromRequestParts<S> for ScopedWebSocketUpgrade
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let upgrade = WebSocketUpgrade::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;
        let handle = scope::retain().map_err(|e| ApiError::from(e).into_response())?;
        Ok(Self { upgrade, handle })
    }
}

impl ScopedWebSocketUpgrade {
    /// Adjusts the underlying upgrade (protocols, frame limits).
    pub fn configure(mut self, f: impl FnOnce(WebSocketUpgrade) -> WebSocketUpgrade) -> Self {
        self.upgrade = f(self.upgrade);
        self
    }

    /// Completes the upgrade and runs `callback` inside the request scope.
    ///
    /// The scope stays open until `callback` returns. If the upgrade itself
    /// fails, the callback is never run and the scope is released.
    pub fn on_upgrade<C, Fut>(self, callback: C) -> Response
    where
        C: FnOnce(WebSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle;
        tracing::debug!(key = %handle.scope().key(), "websocket scope retained");
        self.upgrade
            .on_upgrade(move |socket| handle.run(async move { callback(socket).await }))
    }
}
