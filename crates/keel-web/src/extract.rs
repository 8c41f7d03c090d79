//! Extractors for the current request scope and its session.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use keel_db::{scope, RequestScope, Session};

use crate::error::ApiError;

/// The request's database session, opened on first extraction.
///
/// Rejects with a 500 when the route is not behind
/// [`RequestScopeLayer`](crate::RequestScopeLayer).
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Arc<Session>);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(scope::current_session().await?))
    }
}

/// The request's scope. Extracting it does not open a session.
#[derive(Debug, Clone)]
pub struct CurrentScope(pub Arc<RequestScope>);

impl<S> FromRequestParts<S> for CurrentScope
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(scope::require()?))
    }
}
