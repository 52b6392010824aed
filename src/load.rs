//! Moving layers between GeoPackage files and the store.
//!
//! Loaded tables always have the layout `fid INTEGER PRIMARY KEY, geom
//! <geometry type>, <properties...>`, whatever the source geometry column was
//! called. The layer's SRS definition is recorded in the store so exports can
//! write it back out.

use crate::conversions::{
    column_type_to_str, geometry_type_from_str, layer_geometry_type_to_str,
};
use crate::error::{OverlayError, Result, operation_failed};
use crate::geometry::gpkg_srs_id;
use crate::gpkg::{Gpkg, GpkgFeature};
use crate::ogc_sql::quote_name;
use crate::staging;
use crate::store::Store;
use crate::types::{ColumnSpec, ColumnType, Ident, Outcome, SkipReason, SpatialRefSys};
use rusqlite::OptionalExtension;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::path::{Path, PathBuf};
use wkb::reader::{Dimension, GeometryType};

/// Name of the primary key column of loaded tables.
pub const FID_COLUMN: &str = "fid";
/// Name of the geometry column of loaded tables.
pub const GEOMETRY_COLUMN: &str = "geom";

/// Directory next to the store file that caches one Parquet file per layer.
pub const STAGING_DIR: &str = "parquet";

/// A layer read into memory: schema, SRS and all features.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerData {
    pub layer_name: String,
    /// `None` for a layer declared with the generic `GEOMETRY` type.
    pub geometry_type: Option<GeometryType>,
    pub srs: SpatialRefSys,
    pub columns: Vec<ColumnSpec>,
    pub features: Vec<GpkgFeature>,
}

/// Read a whole layer from a GeoPackage file.
pub fn read_gpkg_layer<P: AsRef<Path>>(path: P, layer_name: &str) -> Result<LayerData> {
    let gpkg = Gpkg::open_read_only(path)?;
    let layer = gpkg.open_layer(layer_name)?;

    for spec in &layer.property_columns {
        if spec.name.eq_ignore_ascii_case(FID_COLUMN)
            || spec.name.eq_ignore_ascii_case(GEOMETRY_COLUMN)
        {
            return Err(OverlayError::InvalidArgument(format!(
                "layer {layer_name} has a property column named {}",
                spec.name
            )));
        }
    }

    let srs_id = layer.srs_id as i32;
    let srs = match gpkg.spatial_ref_sys(srs_id)? {
        Some(srs) => srs,
        None => {
            tracing::warn!(layer = layer_name, srs_id, "layer SRS is not registered");
            SpatialRefSys::undefined(srs_id)
        }
    };

    let features = layer.features()?;
    tracing::debug!(layer = layer_name, features = features.len(), srs_id, "read GeoPackage layer");

    Ok(LayerData {
        layer_name: layer_name.to_string(),
        geometry_type: layer.geometry_type,
        srs,
        columns: layer.property_columns.clone(),
        features,
    })
}

/// Create `table` in the store and fill it with the layer's features.
pub fn insert_layer(store: &Store, table: &Ident, data: &LayerData) -> Result<Outcome> {
    store.ensure_writable()?;
    if store.table_exists(table)? {
        return Err(OverlayError::InvalidArgument(format!(
            "table {table} already exists"
        )));
    }

    let mut column_defs = vec![
        format!("{FID_COLUMN} INTEGER PRIMARY KEY"),
        format!(
            "{GEOMETRY_COLUMN} {}",
            layer_geometry_type_to_str(data.geometry_type)
        ),
    ];
    let mut insert_columns = vec![FID_COLUMN.to_string(), GEOMETRY_COLUMN.to_string()];
    for spec in &data.columns {
        column_defs.push(format!(
            "{} {}",
            quote_name(&spec.name),
            column_type_to_str(spec.column_type)
        ));
        insert_columns.push(quote_name(&spec.name));
    }
    let placeholders = (1..=insert_columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<String>>()
        .join(", ");

    let insert = || -> Result<usize> {
        let tx = store.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            table.quoted(),
            column_defs.join(", ")
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                table.quoted(),
                insert_columns.join(", ")
            ))?;
            for feature in &data.features {
                let geometry = match feature.geometry_blob() {
                    Some(blob) => Value::Blob(blob.to_vec()),
                    None => Value::Null,
                };
                let params = [Value::Integer(feature.id()), geometry]
                    .into_iter()
                    .chain(feature.properties().iter().cloned());
                stmt.execute(params_from_iter(params))?;
            }
        }
        store.record_srs(&data.srs)?;
        tx.commit()?;
        Ok(data.features.len())
    };
    let rows = insert().map_err(operation_failed("insert_layer", table))?;

    tracing::info!(%table, rows, srs_id = data.srs.srs_id, "loaded layer");
    Ok(Outcome::Applied { rows })
}

/// Path of the staging file for `layer_name`, if the store lives in a file.
pub fn staging_path(store: &Store, layer_name: &str) -> Option<PathBuf> {
    let parent = store.path()?.parent()?;
    Some(parent.join(STAGING_DIR).join(format!("{layer_name}.parquet")))
}

/// Load a GeoPackage layer into a store table named after the layer.
///
/// An existing table is left alone. With `staging` on, a Parquet file in
/// the sibling `parquet/` directory is used instead of the GeoPackage when
/// present, and written after reading the GeoPackage otherwise.
pub fn load_gpkg_layer<P: AsRef<Path>>(
    store: &Store,
    gpkg_path: P,
    layer_name: &str,
    staging: bool,
) -> Result<Outcome> {
    let table = Ident::new(layer_name)?;
    if store.table_exists(&table)? {
        tracing::info!(%table, "table already exists, skipping load");
        return Ok(Outcome::Skipped(SkipReason::AlreadyPresent));
    }

    let staged = if staging {
        staging_path(store, layer_name)
    } else {
        None
    };

    let data = match &staged {
        Some(path) if path.exists() => {
            tracing::info!(path = %path.display(), "reading staged layer");
            staging::read_layer(path)?
        }
        _ => {
            let gpkg_path = gpkg_path.as_ref();
            tracing::info!(path = %gpkg_path.display(), layer = layer_name, "reading GeoPackage layer");
            let data = read_gpkg_layer(gpkg_path, layer_name)?;
            if let Some(path) = &staged {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                staging::write_layer(path, &data)?;
                tracing::debug!(path = %path.display(), "staged layer");
            }
            data
        }
    };

    insert_layer(store, &table, &data)
}

/// Write a store table out as a GeoPackage layer.
///
/// `geom` becomes the layer's geometry column under the same name. The SRS
/// is taken from the first geometry and the recorded definition; a
/// mixed-type table is declared as `GEOMETRY`. An existing layer of the same
/// name is replaced.
pub fn export_table_to_gpkg<P: AsRef<Path>>(
    store: &Store,
    table: &Ident,
    geom: &Ident,
    gpkg_path: P,
    layer_name: &str,
) -> Result<Outcome> {
    store.ensure_spatial()?;
    store.require_table(table)?;
    store.require_field(table, geom)?;

    let property_columns: Vec<ColumnSpec> = store
        .column_specs(table)?
        .into_iter()
        .filter(|spec| {
            !spec.name.eq_ignore_ascii_case(FID_COLUMN)
                && !spec.name.eq_ignore_ascii_case(geom.as_str())
        })
        .collect();
    let geometry_type = table_geometry_type(store, table, geom)?;

    let first_blob: Option<Vec<u8>> = store
        .connection()
        .query_row(
            &format!(
                "SELECT {geom} FROM {} WHERE {geom} IS NOT NULL LIMIT 1",
                table.quoted(),
                geom = geom.quoted()
            ),
            [],
            |row| row.get(0),
        )
        .optional()?;
    let srs_id = match first_blob {
        Some(blob) => gpkg_srs_id(&blob)?,
        None => 0,
    };
    let srs = store
        .srs(srs_id as i32)?
        .unwrap_or_else(|| SpatialRefSys::undefined(srs_id as i32));

    let gpkg_path = gpkg_path.as_ref();
    let export = || -> Result<usize> {
        let gpkg = Gpkg::open_or_create(gpkg_path)?;
        if gpkg.has_layer(layer_name)? {
            tracing::debug!(layer = layer_name, "replacing existing layer");
            gpkg.delete_layer(layer_name)?;
        }
        gpkg.register_srs(&srs)?;
        let layer = gpkg.new_layer(
            layer_name,
            geom.to_string(),
            geometry_type,
            Dimension::Xy,
            srs_id,
            &property_columns,
        )?;

        let mut select_columns = vec![geom.quoted()];
        select_columns.extend(property_columns.iter().map(|spec| quote_name(&spec.name)));
        let mut stmt = store.connection().prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid",
            select_columns.join(", "),
            table.quoted()
        ))?;
        let mut rows = stmt.query([])?;

        let tx = gpkg.connection().unchecked_transaction()?;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            let blob: Option<Vec<u8>> = row.get(0)?;
            let mut properties = Vec::with_capacity(property_columns.len());
            for idx in 0..property_columns.len() {
                properties.push(row.get::<_, Value>(idx + 1)?);
            }
            layer.insert_blob(blob.as_deref(), properties)?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    };
    let rows = export().map_err(operation_failed("export_gpkg", table))?;

    tracing::info!(%table, path = %gpkg_path.display(), layer = layer_name, rows, "exported GeoPackage layer");
    Ok(Outcome::Applied { rows })
}

/// Write the non-geometry columns of a store table to a CSV file.
pub fn export_table_to_csv<P: AsRef<Path>>(
    store: &Store,
    table: &Ident,
    csv_path: P,
) -> Result<Outcome> {
    store.require_table(table)?;
    let columns: Vec<String> = store
        .column_specs(table)?
        .into_iter()
        .filter(|spec| spec.column_type != ColumnType::Geometry)
        .map(|spec| spec.name)
        .collect();
    if columns.is_empty() {
        return Err(OverlayError::InvalidArgument(format!(
            "table {table} has no non-geometry columns"
        )));
    }

    let csv_path = csv_path.as_ref();
    let export = || -> Result<usize> {
        let mut writer = csv::Writer::from_path(csv_path)?;
        writer.write_record(&columns)?;

        let quoted: Vec<String> = columns.iter().map(|c| quote_name(c)).collect();
        let mut stmt = store.connection().prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid",
            quoted.join(", "),
            table.quoted()
        ))?;
        let mut rows = stmt.query([])?;
        let mut count = 0;
        let mut record = Vec::with_capacity(columns.len());
        while let Some(row) = rows.next()? {
            record.clear();
            for idx in 0..columns.len() {
                record.push(csv_field(row.get::<_, Value>(idx)?));
            }
            writer.write_record(&record)?;
            count += 1;
        }
        writer.flush()?;
        Ok(count)
    };
    let rows = export().map_err(operation_failed("export_csv", table))?;

    tracing::info!(%table, path = %csv_path.display(), rows, "exported CSV");
    Ok(Outcome::Applied { rows })
}

fn csv_field(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(t) => t,
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

// The single geometry type of a table, `None` when mixed or empty.
fn table_geometry_type(
    store: &Store,
    table: &Ident,
    geom: &Ident,
) -> Result<Option<GeometryType>> {
    let mut stmt = store.connection().prepare(&format!(
        "SELECT DISTINCT ST_GeometryType({geom}) FROM {} WHERE {geom} IS NOT NULL",
        table.quoted(),
        geom = geom.quoted()
    ))?;
    let types = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    match types.as_slice() {
        [single] => geometry_type_from_str(single),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        LayerData, export_table_to_csv, export_table_to_gpkg, insert_layer, load_gpkg_layer,
        read_gpkg_layer, staging_path,
    };
    use crate::error::OverlayError;
    use crate::geometry::tests::square;
    use crate::gpkg::Gpkg;
    use crate::store::{AccessMode, Store};
    use crate::types::{ColumnSpec, ColumnType, Ident, Outcome, SkipReason, SpatialRefSys};
    use geo_types::{MultiPolygon, Point};
    use rusqlite::types::Value;
    use std::path::Path;
    use wkb::reader::{Dimension, GeometryType};

    fn utm33() -> SpatialRefSys {
        SpatialRefSys {
            srs_name: "ETRS89 / UTM zone 33N".to_string(),
            srs_id: 25833,
            organization: "EPSG".to_string(),
            organization_coordsys_id: 25833,
            definition: "PROJCS[\"ETRS89 / UTM zone 33N\"]".to_string(),
            description: Some("test".to_string()),
        }
    }

    // A source GeoPackage with one polygon layer whose geometry column is
    // called "shape", as some exports do.
    fn write_source_gpkg(path: &Path) -> crate::Result<()> {
        let gpkg = Gpkg::new(path)?;
        gpkg.register_srs(&utm33())?;
        let columns = vec![
            ColumnSpec {
                name: "arealtype".to_string(),
                column_type: ColumnType::Integer,
            },
            ColumnSpec {
                name: "navn".to_string(),
                column_type: ColumnType::Varchar,
            },
        ];
        let layer = gpkg.new_layer(
            "ar5",
            "shape".to_string(),
            Some(GeometryType::MultiPolygon),
            Dimension::Xy,
            25833,
            &columns,
        )?;
        layer.insert(
            MultiPolygon::new(vec![square(0.0, 0.0, 10.0)]),
            [Value::Integer(30), Value::Text("skog".to_string())],
        )?;
        layer.insert(
            MultiPolygon::new(vec![square(10.0, 0.0, 5.0)]),
            [Value::Integer(60), Value::Null],
        )?;
        Ok(())
    }

    #[test]
    fn reads_layer_with_srs() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("source.gpkg");
        write_source_gpkg(&path)?;

        let data = read_gpkg_layer(&path, "ar5")?;
        assert_eq!(data.srs, utm33());
        assert_eq!(data.geometry_type, Some(GeometryType::MultiPolygon));
        assert_eq!(data.features.len(), 2);
        assert_eq!(data.columns.len(), 2);

        let err = read_gpkg_layer(&path, "missing").expect_err("missing layer");
        assert!(matches!(err, OverlayError::MissingLayer { .. }));
        let err = read_gpkg_layer(dir.path().join("nope.gpkg"), "ar5").expect_err("missing file");
        assert!(matches!(err, OverlayError::MissingFile { .. }));
        Ok(())
    }

    #[test]
    fn loads_layer_into_store_once() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("source.gpkg");
        write_source_gpkg(&source)?;
        let store = Store::open(dir.path().join("run.db"), AccessMode::ReadWrite)?;
        store.ensure_spatial()?;

        let outcome = load_gpkg_layer(&store, &source, "ar5", false)?;
        assert_eq!(outcome, Outcome::Applied { rows: 2 });
        assert_eq!(
            store.table_columns(&Ident::new("ar5")?)?,
            vec!["fid", "geom", "arealtype", "navn"]
        );
        assert_eq!(store.srs(25833)?, Some(utm33()));

        let area: f64 = store.connection().query_row(
            "SELECT SUM(ST_Area(geom)) FROM ar5",
            [],
            |row| row.get(0),
        )?;
        assert!((area - 125.0).abs() < 1e-9);

        let again = load_gpkg_layer(&store, &source, "ar5", false)?;
        assert_eq!(again, Outcome::Skipped(SkipReason::AlreadyPresent));
        Ok(())
    }

    #[test]
    fn staged_layer_is_preferred_over_gpkg() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("source.gpkg");
        write_source_gpkg(&source)?;

        {
            let store = Store::open(dir.path().join("first.db"), AccessMode::ReadWrite)?;
            load_gpkg_layer(&store, &source, "ar5", true)?;
            let staged = staging_path(&store, "ar5").expect("file-backed store");
            assert!(staged.exists());
        }

        std::fs::remove_file(&source)?;
        let store = Store::open(dir.path().join("second.db"), AccessMode::ReadWrite)?;
        let outcome = load_gpkg_layer(&store, &source, "ar5", true)?;
        assert_eq!(outcome, Outcome::Applied { rows: 2 });
        assert_eq!(store.srs(25833)?, Some(utm33()));

        let name: Option<String> = store.connection().query_row(
            "SELECT navn FROM ar5 WHERE fid = 2",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(name, None);
        Ok(())
    }

    #[test]
    fn exports_table_with_srs_and_replaces_layer() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("source.gpkg");
        write_source_gpkg(&source)?;
        let store = Store::open_in_memory()?;
        store.ensure_spatial()?;
        let data = read_gpkg_layer(&source, "ar5")?;
        insert_layer(&store, &Ident::new("ar5")?, &data)?;
        store
            .connection()
            .execute_batch("ALTER TABLE ar5 ADD COLUMN areal_m2 REAL; UPDATE ar5 SET areal_m2 = ST_Area(geom);")?;

        let out = dir.path().join("out.gpkg");
        let (table, geom) = (Ident::new("ar5")?, Ident::new("geom")?);
        assert_eq!(
            export_table_to_gpkg(&store, &table, &geom, &out, "ar5_overlapp")?,
            Outcome::Applied { rows: 2 }
        );
        assert_eq!(
            export_table_to_gpkg(&store, &table, &geom, &out, "ar5_overlapp")?,
            Outcome::Applied { rows: 2 }
        );

        let exported = read_gpkg_layer(&out, "ar5_overlapp")?;
        assert_eq!(exported.srs, utm33());
        assert_eq!(exported.geometry_type, Some(GeometryType::MultiPolygon));
        assert_eq!(exported.features.len(), 2);
        let names: Vec<&str> = exported.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["arealtype", "navn", "areal_m2"]);
        assert_eq!(exported.features[0].property::<f64>(2)?, 100.0);
        Ok(())
    }

    #[test]
    fn mixed_geometry_exports_as_generic_type() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open_in_memory()?;
        let data = LayerData {
            layer_name: "mixed".to_string(),
            geometry_type: None,
            srs: SpatialRefSys::undefined(0),
            columns: Vec::new(),
            features: vec![
                crate::gpkg::GpkgFeature::from_parts(
                    1,
                    Some(crate::geometry::tests::gpkg_blob(Point::new(1.0, 1.0), 0)),
                    Vec::new(),
                ),
                crate::gpkg::GpkgFeature::from_parts(
                    2,
                    Some(crate::geometry::tests::gpkg_blob(square(0.0, 0.0, 1.0), 0)),
                    Vec::new(),
                ),
            ],
        };
        let table = Ident::new("mixed")?;
        insert_layer(&store, &table, &data)?;

        let out = dir.path().join("mixed.gpkg");
        export_table_to_gpkg(&store, &table, &Ident::new("geom")?, &out, "mixed")?;
        assert_eq!(read_gpkg_layer(&out, "mixed")?.geometry_type, None);
        Ok(())
    }

    #[test]
    fn exports_named_geometry_column() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open_in_memory()?;
        store
            .connection()
            .execute_batch("CREATE TABLE plan (id INTEGER, shape BLOB, navn TEXT)")?;
        store.connection().execute(
            "INSERT INTO plan VALUES (7, ?1, 'a')",
            [crate::geometry::tests::gpkg_blob(square(0.0, 0.0, 10.0), 0)],
        )?;

        let out = dir.path().join("plan.gpkg");
        let table = Ident::new("plan")?;
        let outcome = export_table_to_gpkg(&store, &table, &Ident::new("shape")?, &out, "plan")?;
        assert_eq!(outcome, Outcome::Applied { rows: 1 });

        let gpkg = Gpkg::open_read_only(&out)?;
        let layer = gpkg.open_layer("plan")?;
        assert_eq!(layer.geometry_column, "shape");
        let names: Vec<&str> = layer.property_columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "navn"]);
        assert_eq!(layer.count()?, 1);

        let err = export_table_to_gpkg(&store, &table, &Ident::new("geom")?, &out, "plan")
            .expect_err("no geom column");
        assert!(matches!(err, OverlayError::MissingField { .. }));
        Ok(())
    }

    #[test]
    fn csv_export_skips_geometry() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open_in_memory()?;
        store.connection().execute_batch(
            "CREATE TABLE stats (id INTEGER, geom BLOB, areal_m2 REAL, navn TEXT);
             INSERT INTO stats VALUES (1, x'00', 120.5, 'a'), (2, NULL, NULL, 'b, c');",
        )?;

        let path = dir.path().join("stats.csv");
        let outcome = export_table_to_csv(&store, &Ident::new("stats")?, &path)?;
        assert_eq!(outcome, Outcome::Applied { rows: 2 });
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text, "id,areal_m2,navn\n1,120.5,a\n2,,\"b, c\"\n");
        Ok(())
    }
}
