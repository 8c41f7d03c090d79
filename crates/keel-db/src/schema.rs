//! Table metadata and DDL generation.
//!
//! Models describe their columns with [`Column`]. A [`Metadata`] collects the
//! tables of every registered model and orders them by foreign-key
//! dependencies so tables can be created parents-first and cleared
//! children-first.

use std::collections::{HashMap, HashSet};

use crate::audit::AUDIT_LOG_TABLE;
use crate::model::Model;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Blob,
    /// ISO 8601 text.
    DateTime,
    /// JSON text.
    Json,
}

impl ColumnType {
    fn sql(self, length: Option<u32>) -> String {
        match (self, length) {
            (Self::Text, Some(len)) => format!("VARCHAR({len})"),
            (Self::Integer, _) => "INTEGER".to_string(),
            (Self::Real, _) => "REAL".to_string(),
            (Self::Text, None) => "TEXT".to_string(),
            (Self::Boolean, _) => "BOOLEAN".to_string(),
            (Self::Blob, _) => "BLOB".to_string(),
            (Self::DateTime, _) => "DATETIME".to_string(),
            (Self::Json, _) => "JSON".to_string(),
        }
    }
}

/// Action taken on referencing rows when a referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// No clause; SQLite treats this as `NO ACTION`.
    Unspecified,
    Restrict,
    Cascade,
    SetNull,
}

impl OnDelete {
    /// Returns `true` if a referencing row prevents deleting its parent.
    pub fn blocks_delete(self) -> bool {
        matches!(self, Self::Unspecified | Self::Restrict)
    }

    fn clause(self) -> &'static str {
        match self {
            Self::Unspecified => "",
            Self::Restrict => " ON DELETE RESTRICT",
            Self::Cascade => " ON DELETE CASCADE",
            Self::SetNull => " ON DELETE SET NULL",
        }
    }
}

/// A foreign key to another table's `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: &'static str,
    pub on_delete: OnDelete,
}

/// A declared column. Every table also has an implicit `id INTEGER PRIMARY KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub index: bool,
    pub length: Option<u32>,
    pub references: Option<ForeignKey>,
}

impl Column {
    /// A nullable, non-unique, unindexed column.
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            unique: false,
            index: false,
            length: None,
            references: None,
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub const fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub const fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub const fn references(mut self, table: &'static str, on_delete: OnDelete) -> Self {
        self.references = Some(ForeignKey { table, on_delete });
        self
    }

    fn ddl(&self) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.ty.sql(self.length));
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(fk) = self.references {
            sql.push_str(&format!(
                " REFERENCES \"{}\"(id){}",
                fk.table,
                fk.on_delete.clause()
            ));
        }
        sql
    }
}

/// Schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<Column>,
    pub audited: bool,
}

impl TableDef {
    /// Builds the table definition of a model.
    pub fn of<M: Model>() -> Self {
        Self {
            name: M::table_name(),
            columns: M::COLUMNS.to_vec(),
            audited: M::AUDITED,
        }
    }

    /// `CREATE TABLE` plus one `CREATE INDEX` per indexed column.
    pub fn create_sql(&self) -> String {
        let columns = std::iter::once("\"id\" INTEGER PRIMARY KEY".to_string())
            .chain(self.columns.iter().map(Column::ddl))
            .collect::<Vec<_>>()
            .join(",\n    ");
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n);",
            self.name, columns
        );
        for column in self.columns.iter().filter(|c| c.index) {
            sql.push_str(&format!(
                "\nCREATE INDEX IF NOT EXISTS \"ix_{table}_{col}\" ON \"{table}\" (\"{col}\");",
                table = self.name,
                col = column.name
            ));
        }
        sql
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\";", self.name)
    }

    fn dependencies(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns
            .iter()
            .filter_map(|c| c.references)
            .map(|fk| fk.table)
            .filter(move |t| *t != self.name)
    }
}

/// The set of tables known to an engine.
///
/// Built explicitly at startup and handed to the [`Database`](crate::Database);
/// there is no global registry of models.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    tables: Vec<TableDef>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model's table. Registering the same table twice is a no-op.
    pub fn register<M: Model>(mut self) -> Self {
        self.add(TableDef::of::<M>());
        self
    }

    /// Adds a table definition.
    pub fn add(&mut self, table: TableDef) {
        if self.table(&table.name).is_some() {
            return;
        }
        let needs_audit_log = table.audited;
        self.tables.push(table);
        if needs_audit_log && self.table(AUDIT_LOG_TABLE).is_none() {
            self.tables.push(crate::audit::audit_log_table());
        }
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables in registration order.
    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    /// Tables ordered so that every table comes after the tables it
    /// references. Ties keep registration order. References to tables that
    /// are not registered are ignored.
    pub fn sorted_tables(&self) -> Vec<&TableDef> {
        let known: HashSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let mut remaining: HashMap<&str, HashSet<&str>> = self
            .tables
            .iter()
            .map(|t| {
                let deps = t.dependencies().filter(|d| known.contains(d)).collect();
                (t.name.as_str(), deps)
            })
            .collect();

        let mut sorted = Vec::with_capacity(self.tables.len());
        while sorted.len() < self.tables.len() {
            let ready = self
                .tables
                .iter()
                .find(|t| {
                    remaining
                        .get(t.name.as_str())
                        .is_some_and(|deps| deps.is_empty())
                })
                .or_else(|| {
                    // Cycle: fall back to registration order for what is left.
                    self.tables
                        .iter()
                        .find(|t| remaining.contains_key(t.name.as_str()))
                });
            let Some(table) = ready else { break };
            remaining.remove(table.name.as_str());
            for deps in remaining.values_mut() {
                deps.remove(table.name.as_str());
            }
            sorted.push(table);
        }
        sorted
    }

    /// Every `(table, column)` whose foreign key points at `table`.
    pub fn referencing(&self, table: &str) -> Vec<(&TableDef, &Column)> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(move |c| (t, c)))
            .filter(|(_, c)| c.references.is_some_and(|fk| fk.table == table))
            .collect()
    }
}
