//! Column-level schema changes on store tables.

use crate::conversions::column_type_to_str;
use crate::error::{Result, operation_failed};
use crate::store::{Store, column_exists};
use crate::types::{ColumnType, Ident, Outcome, SkipReason};
use rusqlite::Connection;

/// Add `column` to `table` unless it is already there.
pub fn ensure_column(
    store: &Store,
    table: &Ident,
    column: &Ident,
    column_type: ColumnType,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    if store.field_exists(table, column)? {
        tracing::debug!(%table, %column, "column already present");
        return Ok(Outcome::Skipped(SkipReason::AlreadyPresent));
    }

    add_column(store.connection(), table, column, column_type)
        .map_err(operation_failed("ensure_column", format!("{table}.{column}")))?;
    tracing::debug!(%table, %column, "added column");
    Ok(Outcome::Applied { rows: 0 })
}

/// Drop `column` from `table`; a missing column is not an error.
pub fn drop_column_if_exists(store: &Store, table: &Ident, column: &Ident) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    if !store.field_exists(table, column)? {
        return Ok(Outcome::Skipped(SkipReason::Absent));
    }

    drop_column(store.connection(), table, column)
        .map_err(operation_failed("drop_column", format!("{table}.{column}")))?;
    tracing::debug!(%table, %column, "dropped column");
    Ok(Outcome::Applied { rows: 0 })
}

/// Drop (if present) and re-add a column so it starts out all NULL.
///
/// Takes a bare connection so it can run inside an open transaction.
pub(crate) fn replace_column(
    conn: &Connection,
    table: &Ident,
    column: &Ident,
    column_type: ColumnType,
) -> Result<()> {
    if column_exists(conn, table.as_str(), column.as_str())? {
        drop_column(conn, table, column)?;
    }
    add_column(conn, table, column, column_type)
}

fn add_column(
    conn: &Connection,
    table: &Ident,
    column: &Ident,
    column_type: ColumnType,
) -> Result<()> {
    let column_type = column_type_to_str(column_type);
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {column_type}",
        table.quoted(),
        column.quoted()
    ))?;
    Ok(())
}

fn drop_column(conn: &Connection, table: &Ident, column: &Ident) -> Result<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} DROP COLUMN {}",
        table.quoted(),
        column.quoted()
    ))?;
    Ok(())
}
