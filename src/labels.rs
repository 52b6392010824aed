//! Percent-class labels for a numeric field, e.g. protected-area density
//! per grid cell binned into `"0-5%"`, `"5-10%"`, ...

use crate::error::{OverlayError, Result, operation_failed};
use crate::geom::union_by_group;
use crate::schema::replace_column;
use crate::store::Store;
use crate::types::{ColumnType, Ident, Outcome};
use rusqlite::params_from_iter;
use rusqlite::types::Value;

/// Lower break that stands for "from zero, inclusive" in the label text.
pub const ZERO_INCLUSIVE_BREAK: f64 = -0.01;

/// Label text for each interval between consecutive breaks.
pub fn bin_labels(breaks: &[f64]) -> Result<Vec<String>> {
    if breaks.len() < 2 {
        return Err(OverlayError::InvalidArgument(
            "label binning needs at least two breaks".to_string(),
        ));
    }
    if breaks.windows(2).any(|w| !(w[0] < w[1])) {
        return Err(OverlayError::InvalidArgument(format!(
            "label breaks must be strictly increasing: {breaks:?}"
        )));
    }

    let mut labels: Vec<String> = breaks
        .windows(2)
        .map(|w| format!("{}-{}%", w[0], w[1]))
        .collect();
    if breaks[0] == ZERO_INCLUSIVE_BREAK {
        labels[0] = format!("0-{}%", breaks[1]);
    }
    Ok(labels)
}

/// Write the label of the interval `(b[i], b[i+1]]` containing `value_field`
/// into `label_field`.
///
/// Values outside all intervals, and `NULL` values, get a `NULL` label.
/// Returns the number of labelled rows.
pub fn classify_labels(
    store: &Store,
    table: &Ident,
    value_field: &Ident,
    label_field: &Ident,
    breaks: &[f64],
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    store.require_field(table, value_field)?;
    let labels = bin_labels(breaks)?;

    let mut cases = String::new();
    let mut params = Vec::with_capacity(labels.len() * 3);
    for (i, label) in labels.into_iter().enumerate() {
        let p = i * 3;
        cases.push_str(&format!(
            " WHEN {v} > ?{} AND {v} <= ?{} THEN ?{}",
            p + 1,
            p + 2,
            p + 3,
            v = value_field.quoted()
        ));
        params.push(Value::Real(breaks[i]));
        params.push(Value::Real(breaks[i + 1]));
        params.push(Value::Text(label));
    }

    let classify = || -> Result<usize> {
        let tx = store.transaction()?;
        replace_column(&tx, table, label_field, ColumnType::Varchar)?;
        tx.execute(
            &format!(
                "UPDATE {} SET {} = CASE{cases} END",
                table.quoted(),
                label_field.quoted()
            ),
            params_from_iter(params),
        )?;
        let labelled: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NOT NULL",
                table.quoted(),
                label_field.quoted()
            ),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(labelled as usize)
    };
    let rows = classify().map_err(operation_failed("classify_labels", label_field))?;

    tracing::info!(%table, %value_field, %label_field, rows, "labelled rows");
    Ok(Outcome::Applied { rows })
}

/// Dissolve the geometries of `table` into one row per label.
pub fn dissolve_by_label(
    store: &Store,
    table: &Ident,
    label_field: &Ident,
    geom: &Ident,
    output_table: &Ident,
) -> Result<Outcome> {
    union_by_group(store, table, label_field, geom, output_table)
}
