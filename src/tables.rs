//! Whole-table utilities: existence checks, drops, joins and row cleanup.

use crate::conversions::column_type_to_str;
use crate::error::{OverlayError, Result, operation_failed};
use crate::ogc_sql::quote_name;
use crate::schema::drop_column_if_exists;
use crate::store::Store;
use crate::types::{ColumnType, Ident, Outcome, SkipReason};

pub fn table_exists(store: &Store, table: &Ident) -> Result<bool> {
    store.table_exists(table)
}

pub fn field_exists(store: &Store, table: &Ident, field: &Ident) -> Result<bool> {
    store.field_exists(table, field)
}

/// Drop `table`; a missing table is not an error.
pub fn drop_table_if_exists(store: &Store, table: &Ident) -> Result<Outcome> {
    store.ensure_writable()?;
    if !store.table_exists(table)? {
        return Ok(Outcome::Skipped(SkipReason::Absent));
    }
    store
        .connection()
        .execute_batch(&format!("DROP TABLE {}", table.quoted()))
        .map_err(OverlayError::from)
        .map_err(operation_failed("drop_table", table))?;
    tracing::debug!(%table, "dropped table");
    Ok(Outcome::Applied { rows: 0 })
}

/// Drop `field` from `table`; a missing field is not an error.
pub fn drop_field_if_exists(store: &Store, table: &Ident, field: &Ident) -> Result<Outcome> {
    drop_column_if_exists(store, table, field)
}

/// Full outer join of `left` and `right` on `id` into a new `output` table.
///
/// Every id found in either table appears once, with the columns of the
/// missing side left NULL. Columns of `right` whose name clashes with a
/// column of `left` are renamed to `<column>_<right>`; if that name is taken
/// too, the join fails before any work.
pub fn full_outer_join(
    store: &Store,
    left: &Ident,
    right: &Ident,
    id: &Ident,
    output: &Ident,
) -> Result<Outcome> {
    store.ensure_writable()?;
    for table in [left, right] {
        store.require_table(table)?;
        store.require_field(table, id)?;
    }
    if output == left || output == right {
        return Err(OverlayError::InvalidArgument(format!(
            "output table {output} is one of the joined tables"
        )));
    }

    let left_columns = store.table_columns(left)?;
    let right_columns = store.table_columns(right)?;
    let is_id = |name: &str| name.eq_ignore_ascii_case(id.as_str());

    let mut select = vec![format!(
        "COALESCE(l.{id}, r.{id}) AS {id}",
        id = id.quoted()
    )];
    select.extend(
        left_columns
            .iter()
            .filter(|c| !is_id(c))
            .map(|c| format!("l.{}", quote_name(c))),
    );
    let mut taken: Vec<String> = left_columns.clone();
    let is_taken =
        |taken: &[String], name: &str| taken.iter().any(|c| c.eq_ignore_ascii_case(name));
    for column in right_columns.iter().filter(|c| !is_id(c)) {
        if is_taken(&taken, column) {
            let renamed = format!("{column}_{right}");
            if is_taken(&taken, &renamed) {
                return Err(OverlayError::InvalidArgument(format!(
                    "column {column} of {right} clashes with {left}, and so does {renamed}"
                )));
            }
            select.push(format!("r.{} AS {}", quote_name(column), quote_name(&renamed)));
            taken.push(renamed);
        } else {
            select.push(format!("r.{}", quote_name(column)));
            taken.push(column.clone());
        }
    }

    let join = || -> Result<usize> {
        let tx = store.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", output.quoted()))?;
        tx.execute_batch(&format!(
            "CREATE TABLE {output} AS
SELECT {select}
FROM {left} AS l
FULL OUTER JOIN {right} AS r ON l.{id} = r.{id}",
            output = output.quoted(),
            select = select.join(", "),
            left = left.quoted(),
            right = right.quoted(),
            id = id.quoted(),
        ))?;
        let rows: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", output.quoted()),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(rows as usize)
    };
    let rows = join().map_err(operation_failed("full_outer_join", output))?;

    tracing::info!(%left, %right, %output, rows, "joined tables");
    Ok(Outcome::Applied { rows })
}

/// Rebuild `table` from its distinct rows and return how many were removed.
///
/// The distinct rows go through a temp table, the original is emptied and
/// refilled. Row order is not preserved. An `INTEGER PRIMARY KEY` column is
/// left out of the comparison and renumbered on reinsert.
pub fn remove_duplicate_rows(store: &Store, table: &Ident) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;

    let rowid_alias = rowid_alias(store, table)?;
    let columns: Vec<String> = store
        .table_columns(table)?
        .into_iter()
        .filter(|c| rowid_alias.as_deref() != Some(c.as_str()))
        .map(|c| quote_name(&c))
        .collect();
    if columns.is_empty() {
        return Ok(Outcome::Applied { rows: 0 });
    }
    let columns = columns.join(", ");
    let temp = table.with_suffix("_distinct")?;

    let dedup = || -> Result<usize> {
        let tx = store.transaction()?;
        let before: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.quoted()),
            [],
            |row| row.get(0),
        )?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{temp};
             CREATE TEMP TABLE {temp} AS SELECT DISTINCT {columns} FROM {table};
             DELETE FROM {table};
             INSERT INTO {table} ({columns}) SELECT {columns} FROM temp.{temp};
             DROP TABLE temp.{temp};",
            temp = temp.quoted(),
            table = table.quoted(),
        ))?;
        let after: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.quoted()),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((before - after) as usize)
    };
    let rows = dedup().map_err(operation_failed("remove_duplicate_rows", table))?;

    tracing::info!(%table, removed = rows, "removed duplicate rows");
    Ok(Outcome::Applied { rows })
}

/// Add an integer id column numbered from the rowid, unless it exists.
pub fn ensure_id(store: &Store, table: &Ident, id: &Ident) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    if store.field_exists(table, id)? {
        return Ok(Outcome::Skipped(SkipReason::AlreadyPresent));
    }

    let number = || -> Result<usize> {
        let tx = store.transaction()?;
        tx.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {id} {column_type}",
            table = table.quoted(),
            id = id.quoted(),
            column_type = column_type_to_str(ColumnType::Integer),
        ))?;
        let rows = tx.execute(
            &format!("UPDATE {} SET {} = rowid", table.quoted(), id.quoted()),
            [],
        )?;
        tx.commit()?;
        Ok(rows)
    };
    let rows = number().map_err(operation_failed("ensure_id", format!("{table}.{id}")))?;

    tracing::debug!(%table, %id, rows, "numbered rows");
    Ok(Outcome::Applied { rows })
}

// The column that aliases the rowid, if the table has one.
fn rowid_alias(store: &Store, table: &Ident) -> Result<Option<String>> {
    let mut stmt = store
        .connection()
        .prepare("SELECT name, type FROM pragma_table_info(?1) WHERE pk > 0")?;
    let keys = stmt
        .query_map([table.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
    match keys.as_slice() {
        [(name, column_type)] if column_type.eq_ignore_ascii_case("INTEGER") => {
            Ok(Some(name.clone()))
        }
        _ => Ok(None),
    }
}
