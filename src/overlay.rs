//! Overlap areas between a study-area table and a classified reference table.
//!
//! For every study polygon, the area of its intersection with the reference
//! polygons of a class set is summed and written to one `REAL` column. Study
//! rows without any matching reference polygon keep `NULL` until
//! [`coerce_nulls_to_zero`] runs, which keeps "not computed" distinguishable
//! from "computed zero" while the classes are processed one by one.

use crate::error::{OverlayError, Result, operation_failed};
use crate::schema::replace_column;
use crate::store::Store;
use crate::types::{ClassValue, ColumnType, Ident, Outcome};
use rusqlite::params_from_iter;
use rusqlite::types::Value;

/// Inputs of one overlap computation.
#[derive(Clone, Debug)]
pub struct OverlapSpec {
    pub study_table: Ident,
    pub study_id: Ident,
    pub study_geom: Ident,
    pub reference_table: Ident,
    pub class_field: Ident,
    pub reference_geom: Ident,
    /// Class codes whose areas are summed into `output_field`.
    pub classes: Vec<ClassValue>,
    pub output_field: Ident,
}

/// Which reference rows [`extract_overlap_geometry`] keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassFilter {
    /// Rows whose class is one of the listed classes.
    Include,
    /// Rows whose class is none of the listed classes.
    Exclude,
}

impl OverlapSpec {
    fn check_inputs(&self, store: &Store) -> Result<()> {
        store.require_table(&self.study_table)?;
        store.require_field(&self.study_table, &self.study_id)?;
        store.require_field(&self.study_table, &self.study_geom)?;
        store.require_table(&self.reference_table)?;
        store.require_field(&self.reference_table, &self.class_field)?;
        store.require_field(&self.reference_table, &self.reference_geom)?;
        Ok(())
    }

    fn class_predicate(&self, filter: ClassFilter) -> String {
        if self.classes.is_empty() {
            return match filter {
                ClassFilter::Include => "0".to_string(),
                ClassFilter::Exclude => "1".to_string(),
            };
        }
        let placeholders = (1..=self.classes.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<String>>()
            .join(", ");
        let op = match filter {
            ClassFilter::Include => "IN",
            ClassFilter::Exclude => "NOT IN",
        };
        format!("{} {op} ({placeholders})", self.class_field.quoted())
    }

    // Envelopes are materialized once per side so the join compares plain
    // numbers before any geometry gets decoded.
    fn intersecting_pairs_sql(&self, filter: ClassFilter, select: &str) -> String {
        let sgeom = self.study_geom.quoted();
        let rgeom = self.reference_geom.quoted();
        format!(
            "WITH s AS MATERIALIZED (
  SELECT {id} AS id, {sgeom} AS geom,
         ST_MinX({sgeom}) AS minx, ST_MaxX({sgeom}) AS maxx,
         ST_MinY({sgeom}) AS miny, ST_MaxY({sgeom}) AS maxy
  FROM {study}
  WHERE {sgeom} IS NOT NULL
),
r AS MATERIALIZED (
  SELECT {rgeom} AS geom,
         ST_MinX({rgeom}) AS minx, ST_MaxX({rgeom}) AS maxx,
         ST_MinY({rgeom}) AS miny, ST_MaxY({rgeom}) AS maxy
  FROM {reference}
  WHERE {rgeom} IS NOT NULL AND {predicate}
)
SELECT {select}
FROM s JOIN r
  ON r.minx <= s.maxx AND r.maxx >= s.minx
 AND r.miny <= s.maxy AND r.maxy >= s.miny
 AND ST_Intersects(s.geom, r.geom)",
            id = self.study_id.quoted(),
            study = self.study_table.quoted(),
            reference = self.reference_table.quoted(),
            predicate = self.class_predicate(filter),
        )
    }
}

/// Sum, per study id, the area shared with reference polygons of the given
/// classes and store it in `output_field`.
///
/// The output column is recreated on every call, so a rerun replaces the
/// previous values in full. Ids with no overlap are left `NULL`.
pub fn compute_overlap_area(store: &Store, spec: &OverlapSpec) -> Result<Outcome> {
    store.ensure_writable()?;
    store.ensure_spatial()?;
    spec.check_inputs(store)?;
    if spec.output_field == spec.study_id || spec.output_field == spec.study_geom {
        return Err(OverlayError::InvalidArgument(format!(
            "output field {} would overwrite an input column of {}",
            spec.output_field, spec.study_table
        )));
    }

    let target = format!("{}.{}", spec.study_table, spec.output_field);
    let sums = overlap_sums(store, spec)
        .map_err(operation_failed("compute_overlap_area", &target))?;
    let rows = write_sums(store, spec, &sums)
        .map_err(operation_failed("compute_overlap_area", &target))?;

    tracing::info!(
        table = %spec.study_table,
        field = %spec.output_field,
        reference = %spec.reference_table,
        classes = spec.classes.len(),
        rows,
        "computed overlap area"
    );
    Ok(Outcome::Applied { rows })
}

fn overlap_sums(store: &Store, spec: &OverlapSpec) -> Result<Vec<(Value, f64)>> {
    if spec.classes.is_empty() {
        return Ok(Vec::new());
    }

    let sql = spec.intersecting_pairs_sql(
        ClassFilter::Include,
        "s.id, SUM(ST_Area(ST_Intersection(s.geom, r.geom)))",
    ) + "\nGROUP BY s.id";
    tracing::debug!(%sql, "overlap query");

    let mut stmt = store.connection().prepare(&sql)?;
    let sums = stmt
        .query_map(params_from_iter(&spec.classes), |row| {
            Ok((row.get::<_, Value>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(sums)
}

fn write_sums(store: &Store, spec: &OverlapSpec, sums: &[(Value, f64)]) -> Result<usize> {
    let tx = store.transaction()?;
    replace_column(&tx, &spec.study_table, &spec.output_field, ColumnType::Double)?;

    let mut rows = 0;
    {
        let mut stmt = tx.prepare(&format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            spec.study_table.quoted(),
            spec.output_field.quoted(),
            spec.study_id.quoted()
        ))?;
        for (id, sum) in sums {
            if matches!(id, Value::Null) {
                continue;
            }
            rows += stmt.execute(rusqlite::params![sum, id])?;
        }
    }
    tx.commit()?;
    Ok(rows)
}

/// Replace `NULL` with `0` in each of the given overlap fields.
pub fn coerce_nulls_to_zero(store: &Store, table: &Ident, fields: &[Ident]) -> Result<Outcome> {
    store.ensure_writable()?;
    store.require_table(table)?;
    for field in fields {
        store.require_field(table, field)?;
    }

    let coerce = || -> Result<usize> {
        let tx = store.transaction()?;
        let mut rows = 0;
        for field in fields {
            rows += tx.execute(
                &format!(
                    "UPDATE {} SET {field} = 0 WHERE {field} IS NULL",
                    table.quoted(),
                    field = field.quoted()
                ),
                [],
            )?;
        }
        tx.commit()?;
        Ok(rows)
    };
    let rows = coerce().map_err(operation_failed("coerce_nulls_to_zero", table))?;

    tracing::debug!(%table, fields = fields.len(), rows, "coerced nulls to zero");
    Ok(Outcome::Applied { rows })
}

/// Materialize the intersection pieces between study polygons and reference
/// polygons into `output_table` as `(<study id>, <study geom>)` rows.
///
/// With [`ClassFilter::Include`] only reference rows of the listed classes
/// take part; with [`ClassFilter::Exclude`] only the others do. An existing
/// `output_table` is replaced.
pub fn extract_overlap_geometry(
    store: &Store,
    spec: &OverlapSpec,
    output_table: &Ident,
    filter: ClassFilter,
) -> Result<Outcome> {
    store.ensure_writable()?;
    store.ensure_spatial()?;
    spec.check_inputs(store)?;
    if output_table == &spec.study_table || output_table == &spec.reference_table {
        return Err(OverlayError::InvalidArgument(format!(
            "output table {output_table} would overwrite an input table"
        )));
    }

    let select = format!(
        "s.id AS {}, ST_Intersection(s.geom, r.geom) AS {}",
        spec.study_id.quoted(),
        spec.study_geom.quoted()
    );
    let sql = format!(
        "CREATE TABLE {} AS\n{}",
        output_table.quoted(),
        spec.intersecting_pairs_sql(filter, &select)
    );

    let extract = || -> Result<usize> {
        let tx = store.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", output_table.quoted()))?;
        tx.execute(&sql, params_from_iter(&spec.classes))?;
        let rows: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM {}", output_table.quoted()),
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(rows as usize)
    };
    let rows = extract().map_err(operation_failed("extract_overlap_geometry", output_table))?;

    tracing::info!(table = %output_table, ?filter, rows, "extracted overlap geometry");
    Ok(Outcome::Applied { rows })
}

#[cfg(test)]
mod tests {
    use super::{
        ClassFilter, OverlapSpec, coerce_nulls_to_zero, compute_overlap_area,
        extract_overlap_geometry,
    };
    use crate::error::OverlayError;
    use crate::geometry::tests::{gpkg_blob, square};
    use crate::store::Store;
    use crate::types::{ClassValue, Ident, Outcome};
    use geo_types::{LineString, Polygon};
    use rusqlite::params;

    fn ident(name: &str) -> Ident {
        Ident::new(name).expect("valid identifier")
    }

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)]),
            vec![],
        )
    }

    /// Three 20x20 study squares side by side; only id 2 meets class 5, with
    /// a 12x10 overlap.
    fn scenario() -> crate::Result<Store> {
        let store = Store::open_in_memory()?;
        store.connection().execute_batch(
            "CREATE TABLE study (id INTEGER, geom BLOB);
             CREATE TABLE ar50 (bonitet INTEGER, geom BLOB);",
        )?;
        for id in 1..=3_i64 {
            let x = (id - 1) as f64 * 100.0;
            store.connection().execute(
                "INSERT INTO study VALUES (?1, ?2)",
                params![id, gpkg_blob(square(x, 0.0, 20.0), 25833)],
            )?;
        }
        store.connection().execute(
            "INSERT INTO ar50 VALUES (5, ?1)",
            params![gpkg_blob(rect(100.0, 0.0, 112.0, 10.0), 25833)],
        )?;
        store.connection().execute(
            "INSERT INTO ar50 VALUES (7, ?1)",
            params![gpkg_blob(rect(500.0, 500.0, 510.0, 510.0), 25833)],
        )?;
        Ok(store)
    }

    fn spec(classes: Vec<ClassValue>, output: &str) -> OverlapSpec {
        OverlapSpec {
            study_table: ident("study"),
            study_id: ident("id"),
            study_geom: ident("geom"),
            reference_table: ident("ar50"),
            class_field: ident("bonitet"),
            reference_geom: ident("geom"),
            classes,
            output_field: ident(output),
        }
    }

    fn column(store: &Store, field: &str) -> crate::Result<Vec<Option<f64>>> {
        let mut stmt = store
            .connection()
            .prepare(&format!("SELECT \"{field}\" FROM study ORDER BY id"))?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<Option<f64>>>>()?;
        Ok(values)
    }

    #[test]
    fn null_coercion_scenario() -> crate::Result<()> {
        let store = scenario()?;
        let c5 = compute_overlap_area(&store, &spec(vec![ClassValue::Integer(5)], "c5"))?;
        let c7 = compute_overlap_area(&store, &spec(vec![ClassValue::Integer(7)], "c7"))?;
        assert_eq!(c5, Outcome::Applied { rows: 1 });
        assert_eq!(c7, Outcome::Applied { rows: 0 });

        assert_eq!(column(&store, "c5")?, vec![None, Some(120.0), None]);
        assert_eq!(column(&store, "c7")?, vec![None, None, None]);

        coerce_nulls_to_zero(&store, &ident("study"), &[ident("c5"), ident("c7")])?;
        assert_eq!(column(&store, "c5")?, vec![Some(0.0), Some(120.0), Some(0.0)]);
        assert_eq!(column(&store, "c7")?, vec![Some(0.0), Some(0.0), Some(0.0)]);
        Ok(())
    }

    #[test]
    fn single_class_and_class_list_agree() -> crate::Result<()> {
        let store = scenario()?;
        compute_overlap_area(&store, &spec(vec![ClassValue::Integer(5)], "one"))?;
        let many = vec![ClassValue::Integer(5), ClassValue::Integer(99)];
        compute_overlap_area(&store, &spec(many, "many"))?;
        assert_eq!(column(&store, "one")?, column(&store, "many")?);
        Ok(())
    }

    #[test]
    fn rerun_replaces_values_identically() -> crate::Result<()> {
        let store = scenario()?;
        let spec = spec(vec![ClassValue::Integer(5), ClassValue::Integer(7)], "ar50_m2");
        compute_overlap_area(&store, &spec)?;
        let first = column(&store, "ar50_m2")?;
        compute_overlap_area(&store, &spec)?;
        assert_eq!(column(&store, "ar50_m2")?, first);
        assert_eq!(store.table_columns(&ident("study"))?, vec!["id", "geom", "ar50_m2"]);
        Ok(())
    }

    #[test]
    fn empty_class_list_recreates_column() -> crate::Result<()> {
        let store = scenario()?;
        store
            .connection()
            .execute_batch("ALTER TABLE study ADD COLUMN none_m2 REAL; UPDATE study SET none_m2 = 3;")?;

        let outcome = compute_overlap_area(&store, &spec(Vec::new(), "none_m2"))?;
        assert_eq!(outcome, Outcome::Applied { rows: 0 });
        assert_eq!(column(&store, "none_m2")?, vec![None, None, None]);
        Ok(())
    }

    #[test]
    fn text_class_codes_are_bound() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store.connection().execute_batch(
            "CREATE TABLE study (id INTEGER, geom BLOB);
             CREATE TABLE klima (sone TEXT, geom BLOB);",
        )?;
        store.connection().execute(
            "INSERT INTO study VALUES (1, ?1)",
            params![gpkg_blob(square(0.0, 0.0, 10.0), 0)],
        )?;
        store.connection().execute(
            "INSERT INTO klima VALUES ('O''3', ?1)",
            params![gpkg_blob(rect(0.0, 0.0, 5.0, 10.0), 0)],
        )?;

        let mut spec = spec(vec![ClassValue::from("O'3")], "o3_m2");
        spec.reference_table = ident("klima");
        spec.class_field = ident("sone");
        compute_overlap_area(&store, &spec)?;
        assert_eq!(column(&store, "o3_m2")?, vec![Some(50.0)]);
        Ok(())
    }

    #[test]
    fn missing_reference_field_fails_before_work() -> crate::Result<()> {
        let store = scenario()?;
        let mut spec = spec(vec![ClassValue::Integer(5)], "c5");
        spec.class_field = ident("ar50_bonitet");
        let err = compute_overlap_area(&store, &spec).expect_err("missing field");
        assert!(matches!(err, OverlayError::MissingField { .. }));
        assert!(!store.field_exists(&ident("study"), &ident("c5"))?);
        Ok(())
    }

    #[test]
    fn output_differing_from_id_only_in_case_is_rejected() -> crate::Result<()> {
        let store = scenario()?;
        let ids = || -> crate::Result<Vec<i64>> {
            let mut stmt = store.connection().prepare("SELECT id FROM study ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        };
        let before = ids()?;

        for output in ["ID", "GEOM"] {
            let err = compute_overlap_area(&store, &spec(vec![ClassValue::Integer(5)], output))
                .expect_err("output clashes with an input column");
            assert!(matches!(err, OverlayError::InvalidArgument(_)));
        }
        assert_eq!(ids()?, before);
        assert_eq!(store.table_columns(&ident("study"))?, vec!["id", "geom"]);
        Ok(())
    }

    #[test]
    fn extracts_included_and_excluded_pieces() -> crate::Result<()> {
        let store = scenario()?;
        store.connection().execute(
            "INSERT INTO ar50 VALUES (3, ?1)",
            params![gpkg_blob(rect(0.0, 0.0, 5.0, 5.0), 25833)],
        )?;
        let spec = spec(vec![ClassValue::Integer(5)], "unused");

        let included =
            extract_overlap_geometry(&store, &spec, &ident("study_c5"), ClassFilter::Include)?;
        let excluded =
            extract_overlap_geometry(&store, &spec, &ident("study_not_c5"), ClassFilter::Exclude)?;
        assert_eq!(included, Outcome::Applied { rows: 1 });
        assert_eq!(excluded, Outcome::Applied { rows: 1 });

        let (id, area): (i64, f64) = store.connection().query_row(
            "SELECT id, ST_Area(geom) FROM study_not_c5",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(id, 1);
        assert!((area - 25.0).abs() < 1e-9);
        Ok(())
    }
}
