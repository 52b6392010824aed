//! Per-feature area, perimeter, shape index and field arithmetic.
//!
//! Every function recreates its output column and fills it with a single
//! `UPDATE` inside one transaction. When anything fails the transaction is
//! rolled back and the previous column, values included, is left as it was.

use crate::error::{OverlayError, Result, operation_failed};
use crate::schema::replace_column;
use crate::store::Store;
use crate::types::{ColumnType, Ident, Outcome};
use rusqlite::types::Value;

/// Shape indices below `1 - SHAPE_INDEX_TOLERANCE` cannot come from a valid
/// polygon.
pub const SHAPE_INDEX_TOLERANCE: f64 = 1e-9;

/// Store `ST_Area(geom)` of every row in `output`.
pub fn geom_area(store: &Store, table: &Ident, geom: &Ident, output: &Ident) -> Result<Outcome> {
    per_row_metric(store, "geom_area", table, geom, output, |g| {
        format!("ST_Area({g})")
    })
}

/// Store the summed area of all rows sharing an id in each of those rows.
pub fn geom_area_by_group(
    store: &Store,
    table: &Ident,
    id: &Ident,
    geom: &Ident,
    output: &Ident,
) -> Result<Outcome> {
    grouped_metric(store, "geom_area_by_group", table, id, geom, output, |g| {
        format!("SUM(ST_Area({g}))")
    })
}

/// Store `ST_Perimeter(geom)` of every row in `output`.
pub fn geom_perimeter(
    store: &Store,
    table: &Ident,
    geom: &Ident,
    output: &Ident,
) -> Result<Outcome> {
    per_row_metric(store, "geom_perimeter", table, geom, output, |g| {
        format!("ST_Perimeter({g})")
    })
}

pub fn geom_perimeter_by_group(
    store: &Store,
    table: &Ident,
    id: &Ident,
    geom: &Ident,
    output: &Ident,
) -> Result<Outcome> {
    grouped_metric(store, "geom_perimeter_by_group", table, id, geom, output, |g| {
        format!("SUM(ST_Perimeter({g}))")
    })
}

/// Store the shape index `P / (2π·sqrt(A/π))` of every row.
///
/// A circle scores 1; the index grows as the outline gets less compact. Rows
/// with zero area get `NULL`.
pub fn shape_index(store: &Store, table: &Ident, geom: &Ident, output: &Ident) -> Result<Outcome> {
    per_row_metric(store, "shape_index", table, geom, output, |g| {
        format!("SHAPE_INDEX(ST_Perimeter({g}), ST_Area({g}))")
    })
}

/// Shape index of the union of parts sharing an id, from summed perimeter and
/// area.
pub fn shape_index_by_group(
    store: &Store,
    table: &Ident,
    id: &Ident,
    geom: &Ident,
    output: &Ident,
) -> Result<Outcome> {
    grouped_metric(store, "shape_index_by_group", table, id, geom, output, |g| {
        format!("SHAPE_INDEX(SUM(ST_Perimeter({g})), SUM(ST_Area({g})))")
    })
}

/// Store `COALESCE(f1, 0) + COALESCE(f2, 0) + ...` in `output`.
///
/// Rows whose `id` is `NULL` are left untouched.
pub fn sum_fields(
    store: &Store,
    table: &Ident,
    id: &Ident,
    fields: &[Ident],
    output: &Ident,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    store.require_field(table, id)?;
    for field in fields {
        store.require_field(table, field)?;
    }
    reject_overwrite(table, output, fields.iter().chain([id]))?;

    let sum = if fields.is_empty() {
        "0".to_string()
    } else {
        fields
            .iter()
            .map(|f| format!("COALESCE({}, 0)", f.quoted()))
            .collect::<Vec<String>>()
            .join(" + ")
    };
    let sql = format!(
        "UPDATE {} SET {} = {sum} WHERE {} IS NOT NULL",
        table.quoted(),
        output.quoted(),
        id.quoted()
    );
    write_column(store, "sum_fields", table, output, &sql)
}

/// Store `COALESCE(a, 0) - COALESCE(b, 0)` in `output`.
pub fn field_difference(
    store: &Store,
    table: &Ident,
    a: &Ident,
    b: &Ident,
    output: &Ident,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    store.require_field(table, a)?;
    store.require_field(table, b)?;
    reject_overwrite(table, output, [a, b])?;

    let sql = format!(
        "UPDATE {} SET {} = COALESCE({}, 0) - COALESCE({}, 0)",
        table.quoted(),
        output.quoted(),
        a.quoted(),
        b.quoted()
    );
    write_column(store, "field_difference", table, output, &sql)
}

/// A row whose shape index is impossible for a valid polygon.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeIndexDefect {
    pub id: Value,
    pub shape_index: f64,
}

/// Report rows whose shape index is below 1, which points at invalid or
/// degenerate geometries. Each defect is also logged at `warn`.
pub fn shape_index_defects(
    store: &Store,
    table: &Ident,
    id: &Ident,
    field: &Ident,
) -> Result<Vec<ShapeIndexDefect>> {
    store.require_table(table)?;
    store.require_field(table, id)?;
    store.require_field(table, field)?;

    let sql = format!(
        "SELECT {id}, {field} FROM {table} WHERE {field} < ?1 ORDER BY {id}",
        id = id.quoted(),
        field = field.quoted(),
        table = table.quoted()
    );
    let mut stmt = store.connection().prepare(&sql)?;
    let defects = stmt
        .query_map([1.0 - SHAPE_INDEX_TOLERANCE], |row| {
            Ok(ShapeIndexDefect {
                id: row.get(0)?,
                shape_index: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for defect in &defects {
        tracing::warn!(%table, id = ?defect.id, shape_index = defect.shape_index, "shape index below 1");
    }
    Ok(defects)
}

fn per_row_metric<F>(
    store: &Store,
    operation: &'static str,
    table: &Ident,
    geom: &Ident,
    output: &Ident,
    expr: F,
) -> Result<Outcome>
where
    F: FnOnce(&str) -> String,
{
    store.ensure_writable()?;
    store.ensure_spatial()?;
    store.require_table(table)?;
    store.require_field(table, geom)?;
    reject_overwrite(table, output, [geom])?;

    let sql = format!(
        "UPDATE {} SET {} = {}",
        table.quoted(),
        output.quoted(),
        expr(&geom.quoted())
    );
    write_column(store, operation, table, output, &sql)
}

fn grouped_metric<F>(
    store: &Store,
    operation: &'static str,
    table: &Ident,
    id: &Ident,
    geom: &Ident,
    output: &Ident,
    aggregate: F,
) -> Result<Outcome>
where
    F: FnOnce(&str) -> String,
{
    store.ensure_writable()?;
    store.ensure_spatial()?;
    store.require_table(table)?;
    store.require_field(table, id)?;
    store.require_field(table, geom)?;
    reject_overwrite(table, output, [id, geom])?;

    let sql = format!(
        "UPDATE {table} SET {output} = grouped.value
FROM (SELECT {id} AS id, {aggregate} AS value FROM {table} GROUP BY {id}) AS grouped
WHERE {table}.{id} = grouped.id",
        table = table.quoted(),
        output = output.quoted(),
        id = id.quoted(),
        aggregate = aggregate(&geom.quoted()),
    );
    write_column(store, operation, table, output, &sql)
}

fn write_column(
    store: &Store,
    operation: &'static str,
    table: &Ident,
    output: &Ident,
    sql: &str,
) -> Result<Outcome> {
    let write = || -> Result<usize> {
        let tx = store.transaction()?;
        replace_column(&tx, table, output, ColumnType::Double)?;
        let rows = tx.execute(sql, [])?;
        tx.commit()?;
        Ok(rows)
    };
    let rows = write().map_err(operation_failed(operation, format!("{table}.{output}")))?;

    tracing::info!(%table, field = %output, rows, operation, "computed field");
    Ok(Outcome::Applied { rows })
}

fn reject_overwrite<'a, I>(table: &Ident, output: &Ident, inputs: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Ident>,
{
    if inputs.into_iter().any(|input| input == output) {
        return Err(OverlayError::InvalidArgument(format!(
            "output field {output} is also an input of {table}"
        )));
    }
    Ok(())
}
