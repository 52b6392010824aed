//! Polygon overlap and area statistics for GeoPackage layers, built on top of
//! rusqlite.
//!
//! ## Overview
//!
//! - `Store` owns the SQLite file that holds a run's tables. It registers a
//!   spatial function set (`ST_Intersection`, `ST_Area`, `ST_Union_Agg`, ...)
//!   working on GeoPackage geometry blobs.
//! - `load` moves layers between GeoPackage files and the store, caching them
//!   as Parquet under `parquet/` next to the store file.
//! - `overlay` sums, per study polygon, the area shared with the polygons of a
//!   reference table that fall in a set of classes.
//! - `metrics` derives area, perimeter, shape index, sums and differences.
//! - `geom` and `tables` hold the table-level conversions and utilities.
//! - `pipeline` strings all of it together from a TOML `PipelineConfig`.
//!
//! Every table and field name goes through `Ident`, which only accepts plain
//! identifiers; values are always bound as parameters. Mutations return an
//! `Outcome` telling whether anything was done, so reruns are cheap no-ops or
//! full replacements, never partial updates.
//!
//! ## Short usage
//!
//! ```no_run
//! use gpkg_overlay::{
//!     AccessMode, ClassValue, Ident, OverlapSpec, coerce_nulls_to_zero, compute_overlap_area,
//!     load_gpkg_layer, with_connection,
//! };
//!
//! with_connection("run.db", AccessMode::ReadWrite, |store| {
//!     load_gpkg_layer(store, "plan.gpkg", "plan_verneformal", true)?;
//!     load_gpkg_layer(store, "ar50.gpkg", "ar50_flate", true)?;
//!
//!     let spec = OverlapSpec {
//!         study_table: Ident::new("plan_verneformal")?,
//!         study_id: Ident::new("fid")?,
//!         study_geom: Ident::new("geom")?,
//!         reference_table: Ident::new("ar50_flate")?,
//!         class_field: Ident::new("ar50_bonitet")?,
//!         reference_geom: Ident::new("geom")?,
//!         classes: vec![ClassValue::Integer(11), ClassValue::Integer(12)],
//!         output_field: Ident::new("ar50_skog_m2")?,
//!     };
//!     compute_overlap_area(store, &spec)?;
//!     coerce_nulls_to_zero(store, &spec.study_table, &[spec.output_field.clone()])?;
//!     Ok(())
//! })?;
//! # Ok::<(), gpkg_overlay::OverlayError>(())
//! ```
//!
//! ## Pipeline
//!
//! ```no_run
//! use gpkg_overlay::{PipelineConfig, pipeline};
//!
//! let config = PipelineConfig::from_path("overlay.toml")?;
//! let report = pipeline::run(&config)?;
//! for (reference, summary) in &report.summaries {
//!     println!("{reference}: {} rows, {} unique ids", summary.rows, summary.unique_ids);
//! }
//! # Ok::<(), gpkg_overlay::OverlayError>(())
//! ```
mod conversions;
mod error;
mod geometry;
mod ogc_sql;
mod sql_functions;
mod types;

pub mod config;
pub mod geom;
pub mod gpkg;
pub mod labels;
pub mod load;
pub mod lookup;
pub mod metrics;
pub mod overlay;
pub mod pipeline;
pub mod schema;
pub mod staging;
pub mod store;
pub mod tables;

pub use config::{LookupConfig, PipelineConfig};
pub use error::{OverlayError, Result};
pub use geom::{NON_AREAL_TYPES, blob_to_geometry, filter_by_geometry_type, union_by_group};
pub use gpkg::{Gpkg, GpkgFeature, GpkgLayer};
pub use labels::{bin_labels, classify_labels, dissolve_by_label};
pub use load::{
    LayerData, export_table_to_csv, export_table_to_gpkg, insert_layer, load_gpkg_layer,
    read_gpkg_layer,
};
pub use lookup::{LookupTable, ReclassifyReport, reclassify_layer};
pub use metrics::{
    ShapeIndexDefect, field_difference, geom_area, geom_area_by_group, geom_perimeter,
    geom_perimeter_by_group, shape_index, shape_index_by_group, shape_index_defects, sum_fields,
};
pub use overlay::{
    ClassFilter, OverlapSpec, coerce_nulls_to_zero, compute_overlap_area,
    extract_overlap_geometry,
};
pub use pipeline::{OverlapSummary, PipelineReport};
pub use schema::{drop_column_if_exists, ensure_column};
pub use sql_functions::register_spatial_functions;
pub use store::{AccessMode, Store, with_connection};
pub use tables::{
    drop_field_if_exists, drop_table_if_exists, ensure_id, full_outer_join,
    remove_duplicate_rows,
};
pub use types::{ClassValue, ColumnSpec, ColumnType, Ident, Outcome, SkipReason, SpatialRefSys};

// Re-export types used in public fields to keep the public API stable.
pub use wkb::reader::{Dimension, GeometryType};
