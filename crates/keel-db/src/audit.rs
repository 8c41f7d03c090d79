//! Audit log for models that opt in with `Model::AUDITED`.
//!
//! Every INSERT, UPDATE and DELETE made through the model API on an audited
//! model appends a row to `audit_log` inside the same transaction, so an
//! audit entry exists exactly when the change it describes was committed.

use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use keel_types::AuditOperation;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::schema::{Column, ColumnType, TableDef};

/// Name of the audit log table.
pub const AUDIT_LOG_TABLE: &str = "audit_log";

pub(crate) fn audit_log_table() -> TableDef {
    TableDef {
        name: AUDIT_LOG_TABLE.to_string(),
        columns: vec![
            Column::new("discriminator", ColumnType::Text).length(255),
            Column::new("parent_id", ColumnType::Integer).index(),
            Column::new("operation", ColumnType::Text).not_null(),
            Column::new("created_on", ColumnType::DateTime).not_null(),
            Column::new("created_by_id", ColumnType::Integer),
            Column::new("data", ColumnType::Json),
        ],
        audited: false,
    }
}

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    /// Table of the changed row.
    pub discriminator: String,
    /// Primary key of the changed row.
    pub parent_id: i64,
    pub operation: AuditOperation,
    /// RFC 3339 UTC timestamp.
    pub created_on: String,
    /// Actor recorded on the session, if any.
    pub created_by_id: Option<i64>,
    /// Column values after the change (before it, for deletes).
    pub data: serde_json::Value,
}

pub(crate) fn record(
    conn: &Connection,
    table: &str,
    parent_id: i64,
    operation: AuditOperation,
    actor: Option<i64>,
    data: &serde_json::Value,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO audit_log (discriminator, parent_id, operation, created_on, created_by_id, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            table,
            parent_id,
            operation.as_str(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            actor,
            serde_json::to_string(data)?,
        ],
    )?;
    tracing::trace!(table, parent_id, operation = operation.as_str(), "audit entry recorded");
    Ok(())
}

pub(crate) fn entries(
    conn: &Connection,
    table: &str,
    parent_id: i64,
) -> Result<Vec<AuditEntry>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, discriminator, parent_id, operation, created_on, created_by_id, data
         FROM audit_log
         WHERE discriminator = ?1 AND parent_id = ?2
         ORDER BY created_on, id",
    )?;
    let rows = stmt.query_map(params![table, parent_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<i64>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, discriminator, parent_id, operation, created_on, created_by_id, data) = row?;
        let operation = AuditOperation::from_str(&operation).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let data = match data {
            Some(text) => serde_json::from_str(&text)?,
            None => serde_json::Value::Null,
        };
        entries.push(AuditEntry {
            id,
            discriminator,
            parent_id,
            operation,
            created_on,
            created_by_id,
            data,
        });
    }
    Ok(entries)
}
