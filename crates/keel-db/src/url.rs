//! Database connection URLs.
//!
//! URLs take the form `dialect[+driver]://[user[:password]@]host[:port]/database[?options]`.
//! Parsing is done by the `url` crate; this type adds the dialect/driver
//! split, password masking in `Debug`, and component replacement.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::{Position, Url};

/// Errors produced while parsing or rewriting a database URL.
#[derive(Debug, Error)]
pub enum UrlError {
    /// The string is not a valid URL.
    #[error("invalid database url: {0}")]
    Parse(#[from] url::ParseError),

    /// The URL has no `//` authority section.
    #[error("database url must have the form dialect://...: {0}")]
    MissingAuthority(String),

    /// A replacement component was rejected.
    #[error("cannot set {0} on this database url")]
    Component(&'static str),

    /// The engine does not support this dialect.
    #[error("unsupported database dialect: {0}")]
    UnsupportedDialect(String),
}

/// A parsed database URL.
///
/// `Display` yields the URL exactly as given; `Debug` masks the password.
#[derive(Clone)]
pub struct DatabaseUrl {
    raw: String,
    parsed: Url,
}

/// Components to substitute with [`DatabaseUrl::replace`].
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UrlParts {
    pub dialect: Option<String>,
    pub driver: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
}

/// Where a SQLite engine stores its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    /// A private in-memory database.
    Memory,
    /// A database file at the given path.
    File(String),
}

impl DatabaseUrl {
    /// Parses a database URL.
    ///
    /// # Errors
    ///
    /// Returns `UrlError::Parse` for malformed input and
    /// `UrlError::MissingAuthority` when the `//` section is absent.
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let parsed = Url::parse(input)?;
        if !parsed.has_authority() {
            return Err(UrlError::MissingAuthority(input.to_string()));
        }
        Ok(Self {
            raw: input.to_string(),
            parsed,
        })
    }

    fn from_url(parsed: Url) -> Self {
        Self {
            raw: parsed.as_str().to_string(),
            parsed,
        }
    }

    /// The database dialect, e.g. `postgresql` for `postgresql+psycopg2://`.
    pub fn dialect(&self) -> &str {
        self.scheme().split('+').next().unwrap_or_default()
    }

    /// The driver after `+` in the scheme, or an empty string.
    pub fn driver(&self) -> &str {
        self.scheme()
            .split_once('+')
            .map(|(_, driver)| driver)
            .unwrap_or_default()
    }

    fn scheme(&self) -> &str {
        self.parsed.scheme()
    }

    pub fn username(&self) -> Option<&str> {
        Some(self.parsed.username()).filter(|u| !u.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.parsed.password()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.parsed.host_str().filter(|h| !h.is_empty())
    }

    pub fn port(&self) -> Option<u16> {
        self.parsed.port()
    }

    /// The raw `user:password@host:port` section.
    pub fn netloc(&self) -> &str {
        &self.parsed[Position::BeforeUsername..Position::AfterPort]
    }

    /// The database name: the URL path without its leading slash.
    ///
    /// Only one slash is removed, so `sqlite:////var/db.sqlite` names the
    /// absolute path `/var/db.sqlite`.
    pub fn database(&self) -> &str {
        let path = self.parsed.path();
        path.strip_prefix('/').unwrap_or(path)
    }

    /// Query-string options as decoded key/value pairs.
    pub fn options(&self) -> BTreeMap<String, String> {
        self.parsed.query_pairs().into_owned().collect()
    }

    /// Returns a new URL with the given components replaced.
    ///
    /// # Errors
    ///
    /// Returns `UrlError::Component` if the underlying URL rejects a
    /// component (for example a username on a URL with no host).
    pub fn replace(&self, parts: UrlParts) -> Result<Self, UrlError> {
        let mut url = self.parsed.clone();

        if parts.dialect.is_some() || parts.driver.is_some() {
            let dialect = parts
                .dialect
                .unwrap_or_else(|| self.dialect().to_string());
            let driver = parts.driver.unwrap_or_else(|| self.driver().to_string());
            let scheme = if driver.is_empty() {
                dialect
            } else {
                format!("{dialect}+{driver}")
            };
            url.set_scheme(&scheme)
                .map_err(|()| UrlError::Component("scheme"))?;
        }

        if let Some(hostname) = parts.hostname {
            url.set_host(Some(&hostname))?;
        }
        if let Some(port) = parts.port {
            url.set_port(Some(port))
                .map_err(|()| UrlError::Component("port"))?;
        }
        if let Some(username) = parts.username {
            url.set_username(&username)
                .map_err(|()| UrlError::Component("username"))?;
        }
        if let Some(password) = parts.password {
            url.set_password(Some(&password))
                .map_err(|()| UrlError::Component("password"))?;
        }
        if let Some(database) = parts.database {
            url.set_path(&format!("/{database}"));
        }

        Ok(Self::from_url(url))
    }

    /// Resolves the storage target for the SQLite engine.
    ///
    /// `sqlite://` and `sqlite:///:memory:` are in-memory databases.
    ///
    /// # Errors
    ///
    /// Returns `UrlError::UnsupportedDialect` for any dialect other than
    /// `sqlite`.
    pub fn sqlite_target(&self) -> Result<SqliteTarget, UrlError> {
        if self.dialect() != "sqlite" {
            return Err(UrlError::UnsupportedDialect(self.dialect().to_string()));
        }
        match self.database() {
            "" | ":memory:" => Ok(SqliteTarget::Memory),
            path => Ok(SqliteTarget::File(path.to_string())),
        }
    }

    fn masked(&self) -> String {
        if self.password().is_none() {
            return self.raw.clone();
        }
        let mut url = self.parsed.clone();
        match url.set_password(Some("********")) {
            Ok(()) => url.as_str().to_string(),
            Err(()) => self.raw.clone(),
        }
    }
}

impl fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseUrl({:?})", self.masked())
    }
}

impl FromStr for DatabaseUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for DatabaseUrl {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for DatabaseUrl {}

impl PartialEq<str> for DatabaseUrl {
    fn eq(&self, other: &str) -> bool {
        self.raw == other
    }
}

impl PartialEq<&str> for DatabaseUrl {
    fn eq(&self, other: &&str) -> bool {
        self.raw == *other
    }
}
