//! Shared types for the Keel crates.
//!
//! This crate is the leaf of the workspace: it holds the identifiers and
//! request descriptors that both the database layer (`keel-db`) and the web
//! layer (`keel-web`) need to agree on, without pulling in either runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier for one request scope.
///
/// A key is minted when request handling starts and is never reused. It
/// names the database session that belongs to the request in the session
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(Uuid);

impl ContextKey {
    /// Mints a fresh, globally unique key.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ContextKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The kind of inbound request, as far as request scoping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// A plain request/response exchange.
    Http,
    /// A WebSocket upgrade (persistent bidirectional stream).
    WebSocket,
    /// A background task or job that opened its own scope.
    Task,
}

impl RequestKind {
    /// Returns the string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of the request that owns a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Request kind.
    pub kind: RequestKind,
    /// HTTP method, if any.
    pub method: Option<String>,
    /// Request path, if any.
    pub path: Option<String>,
}

impl RequestInfo {
    /// Describes an HTTP-level request.
    pub fn new(kind: RequestKind, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind,
            method: Some(method.into()),
            path: Some(path.into()),
        }
    }

    /// Describes a background task that is not tied to an HTTP request.
    pub fn task() -> Self {
        Self {
            kind: RequestKind::Task,
            method: None,
            path: None,
        }
    }
}

/// Row operation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
}

impl AuditOperation {
    /// Returns the label stored in the `operation` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown audit operation label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAuditOperationError(pub String);

impl fmt::Display for ParseAuditOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown audit operation: {}", self.0)
    }
}

impl std::error::Error for ParseAuditOperationError {}

impl FromStr for AuditOperation {
    type Err = ParseAuditOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(ParseAuditOperationError(other.to_string())),
        }
    }
}
