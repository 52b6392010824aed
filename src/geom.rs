//! Table-level geometry conversions: raw WKB columns, dissolves and cleanup.

use crate::conversions::geometry_type_to_str;
use crate::error::{OverlayError, Result, operation_failed};
use crate::store::{Store, table_exists};
use crate::types::{Ident, Outcome, SkipReason};
use rusqlite::params_from_iter;
use wkb::reader::GeometryType;

/// Geometry types dropped by [`filter_by_geometry_type`] by default: anything
/// without area.
pub const NON_AREAL_TYPES: [GeometryType; 4] = [
    GeometryType::Point,
    GeometryType::LineString,
    GeometryType::MultiPoint,
    GeometryType::MultiLineString,
];

/// Replace the raw WKB column `blob_field` with a GeoPackage geometry column
/// `geom_field` tagged with `srs_id`.
///
/// The table is rebuilt as `<table>_tmp` and renamed over the original in
/// one transaction. Once the blob column is gone a rerun is a no-op.
pub fn blob_to_geometry(
    store: &Store,
    table: &Ident,
    blob_field: &Ident,
    geom_field: &Ident,
    srs_id: u32,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.ensure_spatial()?;
    store.require_table(table)?;

    let has_blob = store.field_exists(table, blob_field)?;
    let has_geom = store.field_exists(table, geom_field)?;
    match (has_blob, has_geom) {
        (false, true) => {
            tracing::debug!(%table, %geom_field, "geometry column already converted");
            return Ok(Outcome::Skipped(SkipReason::AlreadyPresent));
        }
        (false, false) => {
            return Err(OverlayError::MissingField {
                table: table.to_string(),
                field: blob_field.to_string(),
            });
        }
        (true, true) => {
            return Err(OverlayError::InvalidArgument(format!(
                "{table} already has a column named {geom_field}"
            )));
        }
        (true, false) => {}
    }

    let tmp = table.with_suffix("_tmp")?;
    let convert = || -> Result<usize> {
        let tx = store.transaction()?;
        if table_exists(&tx, tmp.as_str())? {
            tracing::warn!(table = %tmp, "dropping leftover table from an interrupted conversion");
            tx.execute_batch(&format!("DROP TABLE {}", tmp.quoted()))?;
        }
        tx.execute(
            &format!(
                "CREATE TABLE {tmp} AS SELECT *, ST_GeomFromWKB({blob}, ?1) AS {geom} FROM {table}",
                tmp = tmp.quoted(),
                blob = blob_field.quoted(),
                geom = geom_field.quoted(),
                table = table.quoted(),
            ),
            [srs_id],
        )?;
        tx.execute_batch(&format!(
            "ALTER TABLE {tmp} DROP COLUMN {blob};
             DROP TABLE {table};
             ALTER TABLE {tmp} RENAME TO {table};",
            tmp = tmp.quoted(),
            blob = blob_field.quoted(),
            table = table.quoted(),
        ))?;
        let rows: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.quoted()),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(rows as usize)
    };
    let rows = convert().map_err(operation_failed("blob_to_geometry", table))?;

    tracing::info!(%table, %blob_field, %geom_field, srs_id, rows, "converted blob column to geometry");
    Ok(Outcome::Applied { rows })
}

/// Dissolve all geometries sharing an id into one multipolygon per id.
///
/// `output_table` gets the columns `(<id>, <geom>)` and is replaced if it
/// exists.
pub fn union_by_group(
    store: &Store,
    table: &Ident,
    id: &Ident,
    geom: &Ident,
    output_table: &Ident,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.ensure_spatial()?;
    store.require_table(table)?;
    store.require_field(table, id)?;
    store.require_field(table, geom)?;
    reject_same_table(table, output_table)?;

    let sql = format!(
        "CREATE TABLE {output} AS
SELECT {id}, ST_Union_Agg({geom}) AS {geom}
FROM {table}
GROUP BY {id}",
        output = output_table.quoted(),
        id = id.quoted(),
        geom = geom.quoted(),
        table = table.quoted(),
    );
    let rows = replace_table(store, output_table, &sql, &[])
        .map_err(operation_failed("union_by_group", output_table))?;

    tracing::info!(%table, output = %output_table, rows, "dissolved geometries by id");
    Ok(Outcome::Applied { rows })
}

/// Copy the rows of `table` whose geometry type is not in `excluded` into
/// `output_table`, repairing the kept geometries with `ST_MakeValid`.
///
/// Rows with a `NULL` geometry are dropped as well.
pub fn filter_by_geometry_type(
    store: &Store,
    table: &Ident,
    geom: &Ident,
    excluded: &[GeometryType],
    output_table: &Ident,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.ensure_spatial()?;
    store.require_table(table)?;
    store.require_field(table, geom)?;
    reject_same_table(table, output_table)?;

    let type_names: Vec<&str> = excluded.iter().map(|t| geometry_type_to_str(*t)).collect();
    let predicate = if type_names.is_empty() {
        format!("{} IS NOT NULL", geom.quoted())
    } else {
        let placeholders = (1..=type_names.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<String>>()
            .join(", ");
        format!("ST_GeometryType({}) NOT IN ({placeholders})", geom.quoted())
    };
    let sql = format!(
        "CREATE TABLE {output} AS SELECT * FROM {table} WHERE {predicate};
UPDATE {output} SET {geom} = ST_MakeValid({geom})",
        output = output_table.quoted(),
        table = table.quoted(),
        geom = geom.quoted(),
    );
    let rows = replace_table(store, output_table, &sql, &type_names)
        .map_err(operation_failed("filter_by_geometry_type", output_table))?;

    tracing::info!(%table, output = %output_table, rows, "kept areal geometries");
    Ok(Outcome::Applied { rows })
}

// Runs `create_sql` (statements separated by ';', the first one bound to
// `params`) after dropping `output`, and returns the new row count.
fn replace_table(store: &Store, output: &Ident, create_sql: &str, params: &[&str]) -> Result<usize> {
    let tx = store.transaction()?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", output.quoted()))?;

    let mut statements = create_sql.split(';').map(str::trim).filter(|s| !s.is_empty());
    if let Some(first) = statements.next() {
        tx.execute(first, params_from_iter(params))?;
    }
    for statement in statements {
        tx.execute(statement, [])?;
    }

    let rows: i64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM {}", output.quoted()),
        [],
        |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(rows as usize)
}

fn reject_same_table(table: &Ident, output_table: &Ident) -> Result<()> {
    if table == output_table {
        return Err(OverlayError::InvalidArgument(format!(
            "output table {output_table} is the input table"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{NON_AREAL_TYPES, blob_to_geometry, filter_by_geometry_type, union_by_group};
    use crate::geometry::tests::{gpkg_blob, square};
    use crate::store::Store;
    use crate::types::{Ident, Outcome, SkipReason};
    use geo_types::{Geometry, LineString, MultiPolygon, Point, Polygon};
    use rusqlite::params;

    fn ident(name: &str) -> Ident {
        Ident::new(name).expect("valid identifier")
    }

    fn raw_wkb(geometry: &Geometry<f64>) -> Vec<u8> {
        let mut wkb = Vec::new();
        wkb::writer::write_geometry(&mut wkb, geometry, &Default::default()).expect("write wkb");
        wkb
    }

    fn wkt_of(geometry: &Geometry<f64>) -> String {
        let mut wkt = String::new();
        wkt::to_wkt::write_geometry(&mut wkt, geometry).expect("write wkt");
        wkt
    }

    #[test]
    fn blob_column_roundtrips_through_wkt() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store
            .connection()
            .execute_batch("CREATE TABLE parcels (id INTEGER, name TEXT, wkb BLOB)")?;
        let with_hole = Geometry::Polygon(Polygon::new(
            square(0.0, 0.0, 10.0).exterior().clone(),
            vec![LineString::from(vec![(2.0, 2.0), (4.0, 2.0), (4.0, 4.0), (2.0, 2.0)])],
        ));
        let originals = vec![
            Geometry::Polygon(square(0.0, 0.0, 4.0)),
            with_hole,
            Geometry::MultiPolygon(MultiPolygon::new(vec![
                square(0.0, 0.0, 1.0),
                square(3.0, 3.0, 1.0),
            ])),
        ];
        for (id, geometry) in originals.iter().enumerate() {
            store.connection().execute(
                "INSERT INTO parcels VALUES (?1, 'p', ?2)",
                params![id as i64, raw_wkb(geometry)],
            )?;
        }

        let (table, wkb, geom) = (ident("parcels"), ident("wkb"), ident("geom"));
        let outcome = blob_to_geometry(&store, &table, &wkb, &geom, 25833)?;
        assert_eq!(outcome, Outcome::Applied { rows: 3 });
        assert_eq!(store.table_columns(&table)?, vec!["id", "name", "geom"]);

        let mut stmt = store
            .connection()
            .prepare("SELECT ST_AsText(geom) FROM parcels ORDER BY id")?;
        let texts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let expected: Vec<String> = originals.iter().map(wkt_of).collect();
        assert_eq!(texts, expected);

        let rerun = blob_to_geometry(&store, &table, &wkb, &geom, 25833)?;
        assert_eq!(rerun, Outcome::Skipped(SkipReason::AlreadyPresent));
        Ok(())
    }

    #[test]
    fn leftover_tmp_table_is_replaced() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store.connection().execute_batch(
            "CREATE TABLE parcels (id INTEGER, wkb BLOB);
             CREATE TABLE parcels_tmp (junk TEXT);",
        )?;
        store.connection().execute(
            "INSERT INTO parcels VALUES (1, ?1)",
            params![raw_wkb(&Geometry::Point(Point::new(1.0, 2.0)))],
        )?;

        blob_to_geometry(&store, &ident("parcels"), &ident("wkb"), &ident("geom"), 0)?;
        assert!(!store.table_exists(&ident("parcels_tmp"))?);
        let srs_id: u32 = store.connection().query_row(
            "SELECT geom FROM parcels",
            [],
            |row| {
                let blob: Vec<u8> = row.get(0)?;
                Ok(crate::geometry::gpkg_srs_id(&blob).expect("gpkg blob"))
            },
        )?;
        assert_eq!(srs_id, 0);
        Ok(())
    }

    #[test]
    fn union_by_group_dissolves_each_id() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store
            .connection()
            .execute_batch("CREATE TABLE pieces (id INTEGER, geom BLOB)")?;
        for (id, x) in [(1, 0.0), (1, 0.5), (2, 10.0)] {
            store.connection().execute(
                "INSERT INTO pieces VALUES (?1, ?2)",
                params![id, gpkg_blob(square(x, 0.0, 1.0), 0)],
            )?;
        }

        let outcome = union_by_group(
            &store,
            &ident("pieces"),
            &ident("id"),
            &ident("geom"),
            &ident("dissolved"),
        )?;
        assert_eq!(outcome, Outcome::Applied { rows: 2 });

        let area: f64 = store.connection().query_row(
            "SELECT ST_Area(geom) FROM dissolved WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        assert!((area - 1.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn filter_drops_points_and_lines() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store
            .connection()
            .execute_batch("CREATE TABLE mixed (id INTEGER, geom BLOB)")?;
        let rows: Vec<Geometry<f64>> = vec![
            Geometry::Polygon(square(0.0, 0.0, 1.0)),
            Geometry::Point(Point::new(0.0, 0.0)),
            Geometry::LineString(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)])),
            Geometry::MultiPolygon(MultiPolygon::new(vec![square(0.0, 0.0, 2.0), square(1.0, 0.0, 2.0)])),
        ];
        for (id, geometry) in rows.into_iter().enumerate() {
            store.connection().execute(
                "INSERT INTO mixed VALUES (?1, ?2)",
                params![id as i64, gpkg_blob(geometry, 0)],
            )?;
        }

        let outcome = filter_by_geometry_type(
            &store,
            &ident("mixed"),
            &ident("geom"),
            &NON_AREAL_TYPES,
            &ident("areal"),
        )?;
        assert_eq!(outcome, Outcome::Applied { rows: 2 });

        let mut stmt = store
            .connection()
            .prepare("SELECT id, ST_Area(geom) FROM areal ORDER BY id")?;
        let kept = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(i64, f64)>>>()?;
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], (0, 1.0));
        assert_eq!(kept[1].0, 3);
        assert!((kept[1].1 - 6.0).abs() < 1e-9);
        Ok(())
    }
}
