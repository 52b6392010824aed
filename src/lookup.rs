//! Attribute reclassification of a GeoPackage layer through a CSV lookup
//! table.
//!
//! The lookup maps a fixed tuple of integer codes (e.g. `artype`,
//! `artreslag`, `arskogbon`) to one new code. Features whose tuple is not in
//! the table keep their prior value.

use crate::error::{OverlayError, Result};
use crate::gpkg::Gpkg;
use crate::types::{ColumnSpec, ColumnType};
use rusqlite::types::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Integer lookup from a key tuple to a reclassified code.
#[derive(Clone, Debug, PartialEq)]
pub struct LookupTable {
    keys: Vec<String>,
    value: String,
    entries: HashMap<Vec<i64>, i64>,
}

impl LookupTable {
    /// Build a lookup from a CSV file with a header row.
    ///
    /// `rename` maps CSV header names onto the names used in `keys` and
    /// `value`. A key tuple that appears more than once keeps its last value.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        keys: &[String],
        value: &str,
        rename: &HashMap<String, String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OverlayError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let table = Self::from_reader(std::fs::File::open(path)?, keys, value, rename)?;
        tracing::info!(path = %path.display(), entries = table.len(), "read lookup table");
        Ok(table)
    }

    pub fn from_reader<R: Read>(
        reader: R,
        keys: &[String],
        value: &str,
        rename: &HashMap<String, String>,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(OverlayError::InvalidArgument(
                "lookup needs at least one key column".to_string(),
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|name| rename.get(name).cloned().unwrap_or_else(|| name.to_string()))
            .collect();
        let column_index = |name: &str| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or_else(|| OverlayError::MissingField {
                    table: "lookup csv".to_string(),
                    field: name.to_string(),
                })
        };
        let key_indices = keys
            .iter()
            .map(|key| column_index(key.as_str()))
            .collect::<Result<Vec<usize>>>()?;
        let value_index = column_index(value)?;

        let mut entries = HashMap::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            // header is line 1
            let line = row + 2;
            let cell = |idx: usize| parse_code(record.get(idx).unwrap_or(""), line, &headers[idx]);

            let key = key_indices
                .iter()
                .map(|idx| cell(*idx))
                .collect::<Result<Vec<i64>>>()?;
            let code = cell(value_index)?;
            if let Some(previous) = entries.insert(key.clone(), code) {
                if previous != code {
                    tracing::debug!(?key, previous, code, line, "duplicate lookup key, last value wins");
                }
            }
        }

        Ok(Self {
            keys: keys.to_vec(),
            value: value.to_string(),
            entries,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Name of the value column, which is also the field written on layers.
    pub fn value_field(&self) -> &str {
        &self.value
    }

    pub fn get(&self, key: &[i64]) -> Option<i64> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Codes may be written as integral floats ("21.0") by spreadsheet exports.
fn parse_code(text: &str, line: usize, column: &str) -> Result<i64> {
    if let Ok(code) = text.parse::<i64>() {
        return Ok(code);
    }
    match text.parse::<f64>() {
        Ok(code) if code.fract() == 0.0 && code.is_finite() => Ok(code as i64),
        _ => Err(OverlayError::InvalidArgument(format!(
            "lookup csv line {line}: {column} value {text:?} is not an integer code"
        ))),
    }
}

/// Counts from one reclassification run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclassifyReport {
    pub features: usize,
    pub matched: usize,
    /// Features whose key tuple is not in the lookup.
    pub missed: usize,
    /// Features with a NULL or non-integer key field, counted as missed too.
    pub incomplete_keys: usize,
}

/// Write the lookup value of every matching feature of a GeoPackage layer.
///
/// The target field is the lookup's value column; it is added as an
/// `INTEGER` column when the layer lacks it.
pub fn reclassify_layer<P: AsRef<Path>>(
    gpkg_path: P,
    layer_name: &str,
    lookup: &LookupTable,
) -> Result<ReclassifyReport> {
    let gpkg_path = gpkg_path.as_ref();
    let gpkg = Gpkg::open(gpkg_path)?;
    let mut layer = gpkg.open_layer(layer_name)?;

    let key_indices = lookup
        .keys()
        .iter()
        .map(|key| {
            layer
                .property_index(key)
                .ok_or_else(|| OverlayError::MissingField {
                    table: layer_name.to_string(),
                    field: key.clone(),
                })
        })
        .collect::<Result<Vec<usize>>>()?;

    let target = lookup.value_field();
    if layer.property_index(target).is_none() {
        layer.add_column(ColumnSpec {
            name: target.to_string(),
            column_type: ColumnType::Integer,
        })?;
        tracing::info!(layer = layer_name, field = target, "added reclassification field");
    }

    let mut report = ReclassifyReport::default();
    let tx = gpkg.connection().unchecked_transaction()?;
    for feature in layer.features()? {
        report.features += 1;
        let key = key_indices
            .iter()
            .map(|idx| feature.property::<Value>(*idx).ok().and_then(code_of))
            .collect::<Option<Vec<i64>>>();
        let Some(key) = key else {
            report.incomplete_keys += 1;
            report.missed += 1;
            continue;
        };

        match lookup.get(&key) {
            Some(code) => {
                layer.set_property(feature.id(), target, &Value::Integer(code))?;
                report.matched += 1;
            }
            None => {
                tracing::debug!(fid = feature.id(), ?key, "no lookup entry");
                report.missed += 1;
            }
        }
    }
    tx.commit()?;

    tracing::info!(
        path = %gpkg_path.display(),
        layer = layer_name,
        features = report.features,
        matched = report.matched,
        missed = report.missed,
        "reclassified layer"
    );
    Ok(report)
}

fn code_of(value: Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(i),
        Value::Real(f) if f.fract() == 0.0 && f.is_finite() => Some(f as i64),
        Value::Text(t) => t.trim().parse().ok(),
        _ => None,
    }
}
