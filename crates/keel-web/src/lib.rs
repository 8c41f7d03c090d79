//! axum integration for request-scoped database sessions.
//!
//! ```rust,ignore
//! let config = keel_web::config::load_config(Some("config.toml"))?;
//! keel_web::telemetry::init_tracing(&config.logging);
//!
//! let database = config
//!     .database
//!     .connect(Metadata::new().register::<User>())?;
//! database.create_all()?;
//!
//! let app = keel_web::install(Router::new().route("/users/{id}", get(show_user)), &database);
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod telemetry;
pub mod ws;

use axum::Router;
use keel_db::Database;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use extract::{CurrentScope, CurrentSession};
pub use middleware::{request_kind, AuditActor, RequestScopeLayer, RequestScopeService};
pub use ws::ScopedWebSocketUpgrade;

/// Wraps every route of `router` in a request scope on `database`, plus
/// HTTP request tracing.
pub fn install<S>(router: Router<S>, database: &Database) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(RequestScopeLayer::new(database.registry().clone()))
        .layer(TraceLayer::new_for_http())
}
