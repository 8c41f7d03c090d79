//! The request-scope layer.
//!
//! [`RequestScopeLayer`] gives every request its own [`RequestScope`] for as
//! long as the downstream service is handling it. When the response future
//! completes, fails, panics or is dropped, the scope's session is removed
//! from the registry unless a
//! [`ScopedWebSocketUpgrade`](crate::ws::ScopedWebSocketUpgrade) has
//! retained the scope for its socket.
//!
//! `CONNECT` tunnels and non-WebSocket upgrades are scoped as plain HTTP.

use std::task::{Context, Poll};

use axum::http::{header, Method, Request};
use futures_util::future::BoxFuture;
use keel_db::scope::run_scoped;
use keel_db::{RequestScope, SessionRegistry};
use keel_types::{RequestInfo, RequestKind};
use tower::{Layer, Service};

/// Request extension naming the user recorded in audit entries.
///
/// An authentication layer placed outside [`RequestScopeLayer`] can insert
/// this to seed the session's actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditActor(pub i64);

/// Labels a request for its scope. Every request is scoped; only
/// `Upgrade: websocket` requests are labelled as WebSocket.
pub fn request_kind<B>(req: &Request<B>) -> RequestKind {
    let websocket = req.method() != Method::CONNECT
        && req
            .headers()
            .get(header::UPGRADE)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"websocket"));
    if websocket {
        RequestKind::WebSocket
    } else {
        RequestKind::Http
    }
}

/// Layer that wraps services in [`RequestScopeService`].
#[derive(Debug, Clone)]
pub struct RequestScopeLayer {
    registry: SessionRegistry,
}

impl RequestScopeLayer {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for RequestScopeLayer {
    type Service = RequestScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestScopeService {
            inner,
            registry: self.registry.clone(),
        }
    }
}

/// Runs each request inside a fresh request scope.
#[derive(Debug, Clone)]
pub struct RequestScopeService<S> {
    inner: S,
    registry: SessionRegistry,
}

impl<S, B> Service<Request<B>> for RequestScopeService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // The clone is not necessarily ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let kind = request_kind(&req);
        let actor = req.extensions().get::<AuditActor>().map(|actor| actor.0);
        let info = RequestInfo::new(kind, req.method().as_str(), req.uri().path());
        let scope = RequestScope::new(self.registry.clone(), info).with_actor(actor);

        Box::pin(run_scoped(scope, async move { inner.call(req).await }))
    }
}
