//! Request-scoped SQLite sessions and declarative models.
//!
//! Every request (or explicitly scoped task) gets its own [`Session`], opened
//! lazily on first use, shared by all code running for that request, and
//! closed when the request finishes. Sessions live in a [`SessionRegistry`]
//! keyed by the [`ContextKey`](keel_types::ContextKey) of the request scope;
//! the scope itself is published task-locally by [`scope::run_scoped`].
//!
//! Models implement [`Model`] and get async persistence through
//! [`ModelExt`], which always uses the session of the current scope.

pub mod audit;
pub mod database;
pub mod error;
pub mod model;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod scope;
pub mod session;
pub mod url;

pub use audit::AuditEntry;
pub use database::{ColumnInfo, Database, TruncateReport};
pub use error::DbError;
pub use model::{Model, ModelExt, Order, Query};
pub use pool::{create_pool, DbPool, DbRuntimeSettings};
pub use registry::SessionRegistry;
pub use schema::{Column, ColumnType, ForeignKey, Metadata, OnDelete, TableDef};
pub use scope::{RequestScope, ScopeHandle};
pub use session::Session;
pub use url::{DatabaseUrl, SqliteTarget, UrlError, UrlParts};

pub use rusqlite::types::Value;
pub use rusqlite::Row;
