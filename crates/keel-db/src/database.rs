//! The engine: a pool, its registered tables and the session registry.

use std::sync::Arc;

use keel_types::RequestInfo;
use rusqlite::Connection;

use crate::error::DbError;
use crate::pool::{create_pool, DbPool, DbRuntimeSettings};
use crate::registry::SessionRegistry;
use crate::schema::Metadata;
use crate::scope::RequestScope;
use crate::url::DatabaseUrl;

/// Outcome of [`Database::truncate_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncateReport {
    /// Tables whose rows were deleted.
    pub cleared: Vec<String>,
    /// Tables that could not be cleared, with the error message.
    pub failed: Vec<(String, String)>,
}

impl TruncateReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A column as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<String>,
    /// Covered by a single-column unique index or constraint.
    pub unique: bool,
    /// Covered by a single-column index.
    pub indexed: bool,
}

/// A configured SQLite engine.
#[derive(Clone)]
pub struct Database {
    url: DatabaseUrl,
    pool: DbPool,
    metadata: Arc<Metadata>,
    registry: SessionRegistry,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.url)
            .field("tables", &self.metadata.tables().len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl Database {
    /// Builds the connection pool for `url` and an empty session registry.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Url` for non-SQLite URLs and `DbError::Pool` if the
    /// pool cannot be created.
    pub fn connect(
        url: &DatabaseUrl,
        settings: DbRuntimeSettings,
        metadata: Metadata,
    ) -> Result<Self, DbError> {
        let pool = create_pool(url, settings)?;
        let metadata = Arc::new(metadata);
        let registry = SessionRegistry::new(pool.clone(), Arc::clone(&metadata));
        tracing::info!(url = ?url, tables = metadata.tables().len(), "database engine ready");
        Ok(Self {
            url: url.clone(),
            pool,
            metadata,
            registry,
        })
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// A new scope on this engine's registry, for use with
    /// [`run_scoped`](crate::scope::run_scoped) outside the web layer.
    pub fn scope(&self, info: RequestInfo) -> RequestScope {
        RequestScope::new(self.registry.clone(), info)
    }

    /// Creates every registered table, parents first. Existing tables are
    /// left alone.
    pub fn create_all(&self) -> Result<(), DbError> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        for table in self.metadata.sorted_tables() {
            tx.execute_batch(&table.create_sql())?;
            tracing::debug!(table = %table.name, "table created");
        }
        tx.commit()?;
        Ok(())
    }

    /// Drops every registered table, children first.
    pub fn drop_all(&self) -> Result<(), DbError> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        for table in self.metadata.sorted_tables().into_iter().rev() {
            tx.execute_batch(&table.drop_sql())?;
            tracing::debug!(table = %table.name, "table dropped");
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes all rows from every registered table, children first.
    ///
    /// Refused unless the `TESTING` environment variable is `TRUE` or
    /// `force` is set. A table that cannot be cleared is reported in
    /// [`TruncateReport::failed`]; the others are still cleared.
    pub fn truncate_all(&self, force: bool) -> Result<TruncateReport, DbError> {
        let testing = std::env::var("TESTING").is_ok_and(|v| v == "TRUE");
        if !testing && !force {
            return Err(DbError::TruncateRefused);
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut report = TruncateReport::default();
        for table in self.metadata.sorted_tables().into_iter().rev() {
            match tx.execute(&format!("DELETE FROM \"{}\"", table.name), []) {
                Ok(_) => report.cleared.push(table.name.clone()),
                Err(e) => {
                    tracing::warn!(table = %table.name, "failed to clear table: {}", e);
                    report.failed.push((table.name.clone(), e.to_string()));
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }

    /// Names of all user tables in the database, sorted.
    pub fn table_names(&self) -> Result<Vec<String>, DbError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Columns of `table` as the database reports them. Empty if the table
    /// does not exist.
    pub fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        let conn = self.pool.get()?;
        let indexes = single_column_indexes(&conn, table)?;

        let mut stmt = conn.prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)")?;
        let columns = stmt
            .query_map([table], |row| {
                let name: String = row.get(0)?;
                let primary_key = row.get::<_, i64>(4)? > 0;
                let unique = primary_key
                    || indexes.iter().any(|(col, unique)| *col == name && *unique);
                let indexed = indexes.iter().any(|(col, _)| *col == name);
                Ok(ColumnInfo {
                    sql_type: row.get(1)?,
                    nullable: row.get::<_, i64>(2)? == 0 && !primary_key,
                    default: row.get(3)?,
                    primary_key,
                    unique,
                    indexed,
                    name,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }
}

/// `(column, unique)` for every index of `table` that covers one column.
fn single_column_indexes(conn: &Connection, table: &str) -> Result<Vec<(String, bool)>, DbError> {
    let mut list = conn.prepare("SELECT name, \"unique\" FROM pragma_index_list(?1)")?;
    let indexes = list
        .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1)")?;
    let mut covered = Vec::new();
    for (index, unique) in indexes {
        let columns = info
            .query_map([&index], |row| row.get::<_, Option<String>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if let [Some(column)] = columns.as_slice() {
            covered.push((column.clone(), unique));
        }
    }
    Ok(covered)
}
