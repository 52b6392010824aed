//! End-to-end overlap run driven by a [`PipelineConfig`].
//!
//! Steps, in order: load source layers, convert raw WKB columns, number the
//! study area, compute every overlap field of every reference, zero the
//! gaps, derive sums, areas and differences, shape metrics, summarize and
//! export. Unmet preconditions abort the run; a layer that fails to load or
//! an output field that fails to compute is recorded in the report and the
//! run carries on with the rest.

use crate::config::{PipelineConfig, ReferenceConfig};
use crate::error::{OverlayError, Result};
use crate::geom::blob_to_geometry;
use crate::load::{export_table_to_csv, export_table_to_gpkg, load_gpkg_layer};
use crate::metrics::{
    ShapeIndexDefect, field_difference, geom_area, geom_perimeter, shape_index,
    shape_index_defects, sum_fields,
};
use crate::overlay::{OverlapSpec, coerce_nulls_to_zero, compute_overlap_area};
use crate::store::{AccessMode, Store, with_connection};
use crate::tables::ensure_id;
use crate::types::{Ident, Outcome};
use rusqlite::types::Value;
use std::path::{Path, PathBuf};

/// Rows listed in [`OverlapSummary::worst_differences`].
pub const SUMMARY_ROWS: usize = 5;

/// A source layer that could not be loaded.
#[derive(Debug)]
pub struct LoadFailure {
    pub gpkg: PathBuf,
    pub layer: String,
    pub error: OverlayError,
}

/// An output field that could not be computed.
#[derive(Debug)]
pub struct FieldFailure {
    pub table: Ident,
    pub field: Ident,
    pub error: OverlayError,
}

/// One row of the area reconciliation listing.
#[derive(Clone, Debug, PartialEq)]
pub struct AreaDifference {
    pub id: Value,
    pub sum: Option<f64>,
    pub area: Option<f64>,
    pub difference: Option<f64>,
}

/// How well the overlap fields of one reference add up to the polygon areas.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlapSummary {
    pub table: Ident,
    pub rows: usize,
    pub unique_ids: usize,
    /// Rows with the largest `area - sum`, i.e. the most area not covered
    /// by any class.
    pub worst_differences: Vec<AreaDifference>,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub loaded: Vec<(String, Outcome)>,
    pub load_failures: Vec<LoadFailure>,
    pub computed: Vec<Ident>,
    pub failures: Vec<FieldFailure>,
    /// Per reference table.
    pub summaries: Vec<(Ident, OverlapSummary)>,
    pub shape_index_defects: Vec<ShapeIndexDefect>,
    pub exported: Vec<PathBuf>,
}

impl PipelineReport {
    /// Whether every configured layer was loaded and every field computed.
    pub fn is_complete(&self) -> bool {
        self.load_failures.is_empty() && self.failures.is_empty()
    }

    fn record(&mut self, table: &Ident, field: &Ident, result: Result<Outcome>) -> bool {
        match result {
            Ok(_) => {
                self.computed.push(field.clone());
                true
            }
            Err(error) => {
                tracing::warn!(%table, %field, %error, "field not computed, continuing");
                self.failures.push(FieldFailure {
                    table: table.clone(),
                    field: field.clone(),
                    error,
                });
                false
            }
        }
    }
}

/// Open the configured store, run the pipeline on it and close it.
pub fn run(config: &PipelineConfig) -> Result<PipelineReport> {
    create_parent_dir(&config.database)?;
    with_connection(&config.database, AccessMode::ReadWrite, |store| {
        run_with_store(store, config)
    })
}

/// Run the pipeline on an open store.
pub fn run_with_store(store: &Store, config: &PipelineConfig) -> Result<PipelineReport> {
    store.ensure_spatial()?;
    let mut report = PipelineReport::default();

    for source in &config.layers {
        match load_gpkg_layer(store, &source.gpkg, &source.layer, config.staging) {
            Ok(outcome) => report.loaded.push((source.layer.clone(), outcome)),
            Err(error) => {
                tracing::warn!(
                    gpkg = %source.gpkg.display(),
                    layer = %source.layer,
                    %error,
                    "layer not loaded, continuing"
                );
                report.load_failures.push(LoadFailure {
                    gpkg: source.gpkg.clone(),
                    layer: source.layer.clone(),
                    error,
                });
            }
        }
    }
    for conversion in &config.convert_blob {
        blob_to_geometry(
            store,
            &conversion.table,
            &conversion.blob_field,
            &conversion.geom_field,
            conversion.srs_id,
        )?;
    }

    let study = &config.study_area;
    store.require_table(&study.table)?;
    store.require_field(&study.table, &study.geom_field)?;
    for reference in &config.references {
        store.require_table(&reference.table)?;
        store.require_field(&reference.table, &reference.class_field)?;
        store.require_field(&reference.table, &reference.geom_field)?;
    }
    ensure_id(store, &study.table, &study.id_field)?;

    for reference in &config.references {
        run_reference(store, config, reference, &mut report)?;
    }

    let metrics = &config.metrics;
    if let Some(field) = &metrics.perimeter_field {
        let result = geom_perimeter(store, &study.table, &study.geom_field, field);
        report.record(&study.table, field, result);
    }
    if let Some(field) = &metrics.shape_index_field {
        let result = shape_index(store, &study.table, &study.geom_field, field);
        if report.record(&study.table, field, result) {
            report.shape_index_defects =
                shape_index_defects(store, &study.table, &study.id_field, field)?;
        }
    }

    if let Some(export) = &config.export {
        if let Some(path) = &export.gpkg {
            create_parent_dir(path)?;
            let layer = export.layer.as_deref().unwrap_or(study.table.as_str());
            export_table_to_gpkg(store, &study.table, &study.geom_field, path, layer)?;
            report.exported.push(path.clone());
        }
        if let Some(path) = &export.csv {
            create_parent_dir(path)?;
            export_table_to_csv(store, &study.table, path)?;
            report.exported.push(path.clone());
        }
    }

    if report.is_complete() {
        tracing::info!(fields = report.computed.len(), "pipeline finished");
    } else {
        tracing::warn!(
            fields = report.computed.len(),
            failed = report.failures.len(),
            failed_layers = report.load_failures.len(),
            "pipeline finished with failures"
        );
    }
    Ok(report)
}

fn run_reference(
    store: &Store,
    config: &PipelineConfig,
    reference: &ReferenceConfig,
    report: &mut PipelineReport,
) -> Result<()> {
    let study = &config.study_area;
    let table = &study.table;

    let mut computed = Vec::new();
    for (field, classes) in reference.overlap_fields()? {
        tracing::info!(reference = %reference.table, %field, ?classes, "computing overlap");
        let spec = OverlapSpec {
            study_table: table.clone(),
            study_id: study.id_field.clone(),
            study_geom: study.geom_field.clone(),
            reference_table: reference.table.clone(),
            class_field: reference.class_field.clone(),
            reference_geom: reference.geom_field.clone(),
            classes,
            output_field: field.clone(),
        };
        let result = compute_overlap_area(store, &spec);
        if report.record(table, &field, result) {
            computed.push(field);
        }
    }
    coerce_nulls_to_zero(store, table, &computed)?;

    let summed: Vec<Ident> = reference
        .summed_fields()?
        .into_iter()
        .filter(|field| computed.contains(field))
        .collect();
    let sum_ok = match &reference.sum_field {
        Some(output) => {
            let result = sum_fields(store, table, &study.id_field, &summed, output);
            report.record(table, output, result)
        }
        None => false,
    };
    let area_ok = match &reference.area_field {
        Some(output) => {
            let result = geom_area(store, table, &study.geom_field, output);
            report.record(table, output, result)
        }
        None => false,
    };

    if let (Some(sum), Some(area), Some(diff)) = (
        &reference.sum_field,
        &reference.area_field,
        &reference.diff_field,
    ) {
        if sum_ok && area_ok {
            let result = field_difference(store, table, area, sum, diff);
            if report.record(table, diff, result) {
                let summary =
                    overlap_summary(store, table, &study.id_field, sum, area, diff, SUMMARY_ROWS)?;
                log_summary(&summary);
                report.summaries.push((reference.table.clone(), summary));
            }
        }
    }
    Ok(())
}

/// Row count, distinct ids and the `limit` rows with the largest
/// `area - sum` difference.
pub fn overlap_summary(
    store: &Store,
    table: &Ident,
    id: &Ident,
    sum: &Ident,
    area: &Ident,
    diff: &Ident,
    limit: usize,
) -> Result<OverlapSummary> {
    for field in [id, sum, area, diff] {
        store.require_field(table, field)?;
    }

    let (rows, unique_ids): (i64, i64) = store.connection().query_row(
        &format!(
            "SELECT COUNT(*), COUNT(DISTINCT {}) FROM {}",
            id.quoted(),
            table.quoted()
        ),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = store.connection().prepare(&format!(
        "SELECT {id}, {sum}, {area}, {diff} FROM {table} ORDER BY {diff} DESC, {id} LIMIT ?1",
        id = id.quoted(),
        sum = sum.quoted(),
        area = area.quoted(),
        diff = diff.quoted(),
        table = table.quoted(),
    ))?;
    let worst_differences = stmt
        .query_map([limit as i64], |row| {
            Ok(AreaDifference {
                id: row.get(0)?,
                sum: row.get(1)?,
                area: row.get(2)?,
                difference: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(OverlapSummary {
        table: table.clone(),
        rows: rows as usize,
        unique_ids: unique_ids as usize,
        worst_differences,
    })
}

fn log_summary(summary: &OverlapSummary) {
    tracing::info!(
        table = %summary.table,
        rows = summary.rows,
        unique_ids = summary.unique_ids,
        "overlap summary"
    );
    for row in &summary.worst_differences {
        tracing::info!(
            id = ?row.id,
            sum = ?row.sum,
            area = ?row.area,
            difference = ?row.difference,
            "area difference"
        );
    }
}

fn create_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}
