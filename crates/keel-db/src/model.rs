//! Declarative models and their persistence operations.
//!
//! A model is a plain struct that implements [`Model`]: it names its columns,
//! converts itself to and from rows, and exposes its `id`. Persistence comes
//! in two flavours:
//!
//! - synchronous methods on [`Session`] (`save`, `delete`, `refresh`,
//!   `query`) for code that already holds a session on a blocking thread;
//! - async methods from [`ModelExt`] (`save`, `delete`, `refresh_from_db`,
//!   `get_or_fail`, ...) that take the session of the current request scope
//!   and run the SQL on a blocking thread.
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, PartialEq)]
//! struct User {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! impl Model for User {
//!     const COLUMNS: &'static [Column] =
//!         &[Column::new("name", ColumnType::Text).length(255).not_null().unique()];
//!
//!     fn id(&self) -> Option<i64> { self.id }
//!     fn set_id(&mut self, id: Option<i64>) { self.id = id; }
//!     fn values(&self) -> Vec<Value> { vec![self.name.clone().into()] }
//!     fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
//!         Ok(Self { id: row.get("id")?, name: row.get("name")? })
//!     }
//! }
//!
//! let mut user = User { id: None, name: "ted".into() };
//! user.save().await?;
//! let found = User::get_or_fail(user.id.unwrap()).await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use keel_types::AuditOperation;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

use crate::audit::{self, AuditEntry};
use crate::error::DbError;
use crate::schema::Column;
use crate::scope;
use crate::session::Session;

/// A table-backed entity with an integer primary key named `id`.
pub trait Model: Sized + Send + Sync + 'static {
    /// Declared columns, excluding `id`, in the order of [`Model::values`].
    const COLUMNS: &'static [Column];

    /// Whether changes are recorded in the audit log.
    const AUDITED: bool = false;

    /// Table name. Defaults to the lower-cased type name.
    fn table_name() -> String {
        default_table_name::<Self>()
    }

    /// Primary key, `None` until the instance has been saved.
    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: Option<i64>);

    /// Column values in [`Model::COLUMNS`] order.
    fn values(&self) -> Vec<Value>;

    /// Builds an instance from a row holding `id` followed by the columns.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Lower-cased type name without module path or generics: `app::User` → `user`.
pub fn default_table_name<M>() -> String {
    let full = std::any::type_name::<M>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_lowercase()
}

fn quoted_columns<M: Model>() -> Vec<String> {
    M::COLUMNS.iter().map(|c| format!("\"{}\"", c.name)).collect()
}

fn select_list<M: Model>() -> String {
    std::iter::once("\"id\"".to_string())
        .chain(quoted_columns::<M>())
        .collect::<Vec<_>>()
        .join(", ")
}

fn check_arity<M: Model>(values: &[Value]) -> Result<(), DbError> {
    if values.len() != M::COLUMNS.len() {
        return Err(rusqlite::Error::InvalidParameterCount(values.len(), M::COLUMNS.len()).into());
    }
    Ok(())
}

fn row_json<M: Model>(id: i64, values: &[Value]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("id".to_string(), id.into());
    for (column, value) in M::COLUMNS.iter().zip(values) {
        let json = match value {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => (*i).into(),
            Value::Real(f) => (*f).into(),
            Value::Text(s) => s.clone().into(),
            Value::Blob(b) => b.clone().into(),
        };
        map.insert(column.name.to_string(), json);
    }
    serde_json::Value::Object(map)
}

fn row_exists(conn: &Connection, table: &str, id: i64) -> Result<bool, DbError> {
    Ok(conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM \"{table}\" WHERE \"id\" = ?1)"),
        [id],
        |row| row.get(0),
    )?)
}

impl Session {
    /// Inserts or updates `model` and commits.
    ///
    /// An instance without an `id` is inserted and receives its new id. An
    /// instance with an `id` is updated, or inserted under that id when no
    /// such row exists. On failure the transaction is rolled back.
    pub fn save<M: Model>(&self, model: &mut M) -> Result<(), DbError> {
        let id = self.save_values::<M>(model.id(), model.values())?;
        model.set_id(Some(id));
        Ok(())
    }

    pub(crate) fn save_values<M: Model>(
        &self,
        id: Option<i64>,
        values: Vec<Value>,
    ) -> Result<i64, DbError> {
        check_arity::<M>(&values)?;
        let table = M::table_name();
        let actor = self.actor();

        self.transaction(|conn| {
            let existing = match id {
                Some(id) => row_exists(conn, &table, id)?,
                None => false,
            };

            let (id, operation) = if existing {
                let id = id.unwrap_or_default();
                if !values.is_empty() {
                    let assignments = quoted_columns::<M>()
                        .iter()
                        .enumerate()
                        .map(|(i, c)| format!("{c} = ?{}", i + 1))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "UPDATE \"{table}\" SET {assignments} WHERE \"id\" = ?{}",
                        values.len() + 1
                    );
                    let params = values.iter().cloned().chain(std::iter::once(Value::Integer(id)));
                    conn.execute(&sql, params_from_iter(params))?;
                }
                (id, AuditOperation::Update)
            } else {
                let mut columns = quoted_columns::<M>();
                let mut params: Vec<Value> = values.clone();
                if let Some(id) = id {
                    columns.insert(0, "\"id\"".to_string());
                    params.insert(0, Value::Integer(id));
                }
                if columns.is_empty() {
                    conn.execute(&format!("INSERT INTO \"{table}\" DEFAULT VALUES"), [])?;
                } else {
                    let placeholders = (1..=params.len())
                        .map(|i| format!("?{i}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "INSERT INTO \"{table}\" ({}) VALUES ({placeholders})",
                        columns.join(", ")
                    );
                    conn.execute(&sql, params_from_iter(params))?;
                }
                (conn.last_insert_rowid(), AuditOperation::Insert)
            };

            if M::AUDITED {
                audit::record(conn, &table, id, operation, actor, &row_json::<M>(id, &values))?;
            }
            tracing::debug!(table = %table, id, operation = operation.as_str(), "row saved");
            Ok(id)
        })
    }

    /// Deletes `model`'s row and commits.
    ///
    /// # Errors
    ///
    /// `DbError::NotPersisted` if the instance has no id, `DbError::NotFound`
    /// if its row is already gone.
    pub fn delete<M: Model>(&self, model: &M) -> Result<(), DbError> {
        let id = model
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        self.delete_values::<M>(id, model.values())
    }

    pub(crate) fn delete_values<M: Model>(&self, id: i64, values: Vec<Value>) -> Result<(), DbError> {
        let table = M::table_name();
        let actor = self.actor();

        self.transaction(|conn| {
            let deleted = conn.execute(&format!("DELETE FROM \"{table}\" WHERE \"id\" = ?1"), [id])?;
            if deleted == 0 {
                return Err(DbError::NotFound {
                    table: table.clone(),
                    id,
                });
            }
            if M::AUDITED {
                audit::record(
                    conn,
                    &table,
                    id,
                    AuditOperation::Delete,
                    actor,
                    &row_json::<M>(id, &values),
                )?;
            }
            tracing::debug!(table = %table, id, "row deleted");
            Ok(())
        })
    }

    /// Re-reads `model` from the database, overwriting its fields.
    pub fn refresh<M: Model>(&self, model: &mut M) -> Result<(), DbError> {
        let id = model
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        *model = self.query::<M>().get_or_fail(id)?;
        Ok(())
    }

    /// Returns `false` if another table references the row through a foreign
    /// key whose `ON DELETE` is `RESTRICT` or unspecified.
    pub fn can_be_deleted<M: Model>(&self, model: &M) -> Result<bool, DbError> {
        let id = model
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        self.row_can_be_deleted::<M>(id)
    }

    pub(crate) fn row_can_be_deleted<M: Model>(&self, id: i64) -> Result<bool, DbError> {
        let table = M::table_name();
        let blockers: Vec<(String, &'static str)> = self
            .metadata()
            .referencing(&table)
            .into_iter()
            .filter(|(_, column)| {
                column
                    .references
                    .is_some_and(|fk| fk.on_delete.blocks_delete())
            })
            .map(|(t, column)| (t.name.clone(), column.name))
            .collect();

        self.with_connection(|conn| {
            for (child, column) in &blockers {
                let referenced: bool = conn.query_row(
                    &format!("SELECT EXISTS(SELECT 1 FROM \"{child}\" WHERE \"{column}\" = ?1)"),
                    [id],
                    |row| row.get(0),
                )?;
                if referenced {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    /// Audit entries of the row `id` of `M`, oldest first.
    pub fn audit_entries<M: Model>(&self, id: i64) -> Result<Vec<AuditEntry>, DbError> {
        let table = M::table_name();
        self.with_connection(|conn| audit::entries(conn, &table, id))
    }

    /// Starts a query over `M`'s table.
    pub fn query<M: Model>(&self) -> Query<'_, M> {
        Query::new(self)
    }
}

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A read query over one model's table, bound to a session.
pub struct Query<'s, M> {
    session: &'s Session,
    filters: Vec<(String, Value)>,
    order: Vec<(String, Order)>,
    limit: Option<u64>,
    offset: Option<u64>,
    invalid_column: Option<String>,
    _model: PhantomData<fn() -> M>,
}

impl<'s, M: Model> Query<'s, M> {
    fn new(session: &'s Session) -> Self {
        Self {
            session,
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            invalid_column: None,
            _model: PhantomData,
        }
    }

    fn known_column(&mut self, column: &str) -> bool {
        let known = column == "id" || M::COLUMNS.iter().any(|c| c.name == column);
        if !known && self.invalid_column.is_none() {
            self.invalid_column = Some(column.to_string());
        }
        known
    }

    /// Keeps rows whose `column` equals `value`.
    pub fn filter_by(mut self, column: &str, value: impl Into<Value>) -> Self {
        if self.known_column(column) {
            self.filters.push((column.to_string(), value.into()));
        }
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        if self.known_column(column) {
            self.order.push((column.to_string(), order));
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn check(&self) -> Result<(), DbError> {
        match &self.invalid_column {
            Some(column) => Err(rusqlite::Error::InvalidColumnName(column.clone()).into()),
            None => Ok(()),
        }
    }

    fn where_clause(&self) -> String {
        if self.filters.is_empty() {
            return String::new();
        }
        let conditions = self
            .filters
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("\"{column}\" = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(" WHERE {conditions}")
    }

    fn select_sql(&self) -> String {
        let mut sql = format!(
            "SELECT {} FROM \"{}\"{}",
            select_list::<M>(),
            M::table_name(),
            self.where_clause()
        );
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(column, order)| match order {
                    Order::Asc => format!("\"{column}\" ASC"),
                    Order::Desc => format!("\"{column}\" DESC"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        sql
    }

    /// Looks a row up by primary key, ignoring filters, ordering and paging.
    pub fn get(&self, id: i64) -> Result<Option<M>, DbError> {
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE \"id\" = ?1",
            select_list::<M>(),
            M::table_name()
        );
        self.session.with_connection(|conn| {
            Ok(conn.query_row(&sql, [id], |row| M::from_row(row)).optional()?)
        })
    }

    /// Like [`Query::get`], but a missing row is `DbError::NotFound`.
    pub fn get_or_fail(&self, id: i64) -> Result<M, DbError> {
        self.get(id)?.ok_or_else(|| DbError::NotFound {
            table: M::table_name(),
            id,
        })
    }

    /// All matching rows.
    pub fn all(&self) -> Result<Vec<M>, DbError> {
        self.check()?;
        let sql = self.select_sql();
        self.session.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(self.filters.iter().map(|(_, value)| value)),
                |row| M::from_row(row),
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// The first matching row.
    pub fn first(self) -> Result<Option<M>, DbError> {
        Ok(self.limit(1).all()?.into_iter().next())
    }

    /// Number of matching rows, ignoring ordering and paging.
    pub fn count(&self) -> Result<i64, DbError> {
        self.check()?;
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\"{}",
            M::table_name(),
            self.where_clause()
        );
        self.session.with_connection(|conn| {
            Ok(conn.query_row(
                &sql,
                params_from_iter(self.filters.iter().map(|(_, value)| value)),
                |row| row.get(0),
            )?)
        })
    }
}

/// Runs `f` on a blocking thread with the current scope's session.
async fn with_current_session<T, F>(f: F) -> Result<T, DbError>
where
    F: FnOnce(&Session) -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    let session: Arc<Session> = scope::current_session().await?;
    tokio::task::spawn_blocking(move || f(&*session)).await?
}

/// Async persistence through the current request scope's session.
///
/// Every method fails with `DbError::NoActiveScope` when called outside a
/// request scope.
pub trait ModelExt: Model {
    /// Inserts or updates the instance and commits.
    fn save(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Deletes the instance's row and commits.
    fn delete(&self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Overwrites the instance with its stored row.
    fn refresh_from_db(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    fn can_be_deleted(&self) -> impl Future<Output = Result<bool, DbError>> + Send;

    /// The instance's audit entries, oldest first.
    fn audit_log(&self) -> impl Future<Output = Result<Vec<AuditEntry>, DbError>> + Send;

    fn get(id: i64) -> impl Future<Output = Result<Option<Self>, DbError>> + Send;

    /// Looks up by primary key; a missing row is `DbError::NotFound`.
    fn get_or_fail(id: i64) -> impl Future<Output = Result<Self, DbError>> + Send;

    fn all() -> impl Future<Output = Result<Vec<Self>, DbError>> + Send;

    fn count() -> impl Future<Output = Result<i64, DbError>> + Send;
}

impl<M: Model> ModelExt for M {
    async fn save(&mut self) -> Result<(), DbError> {
        let id = self.id();
        let values = self.values();
        let id = with_current_session(move |session| session.save_values::<M>(id, values)).await?;
        self.set_id(Some(id));
        Ok(())
    }

    async fn delete(&self) -> Result<(), DbError> {
        let id = self
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        let values = self.values();
        with_current_session(move |session| session.delete_values::<M>(id, values)).await
    }

    async fn refresh_from_db(&mut self) -> Result<(), DbError> {
        let id = self
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        *self = Self::get_or_fail(id).await?;
        Ok(())
    }

    async fn can_be_deleted(&self) -> Result<bool, DbError> {
        let id = self
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        with_current_session(move |session| session.row_can_be_deleted::<M>(id)).await
    }

    async fn audit_log(&self) -> Result<Vec<AuditEntry>, DbError> {
        let id = self
            .id()
            .ok_or_else(|| DbError::NotPersisted(M::table_name()))?;
        with_current_session(move |session| session.audit_entries::<M>(id)).await
    }

    async fn get(id: i64) -> Result<Option<Self>, DbError> {
        with_current_session(move |session| session.query::<M>().get(id)).await
    }

    async fn get_or_fail(id: i64) -> Result<Self, DbError> {
        with_current_session(move |session| session.query::<M>().get_or_fail(id)).await
    }

    async fn all() -> Result<Vec<Self>, DbError> {
        with_current_session(|session| session.query::<M>().all()).await
    }

    async fn count() -> Result<i64, DbError> {
        with_current_session(|session| session.query::<M>().count()).await
    }
}
