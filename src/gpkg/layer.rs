use crate::conversions::column_type_to_str;
use crate::error::{OverlayError, Result};
use crate::geometry::{gpkg_geometry_to_wkb, wkb_to_gpkg_geometry};
use crate::ogc_sql::{quote_name, sql_insert_feature, sql_select_features};
use crate::types::ColumnSpec;
use geo_traits::GeometryTrait;
use rusqlite::params_from_iter;
use rusqlite::types::{Type, Value};

use super::{Gpkg, GpkgFeature};

#[derive(Debug)]
/// A GeoPackage feature layer with geometry metadata and column specs.
pub struct GpkgLayer<'a> {
    conn: &'a Gpkg,
    pub layer_name: String,
    pub geometry_column: String,
    pub primary_key_column: String,
    /// `None` when the layer declares the generic `GEOMETRY` type.
    pub geometry_type: Option<wkb::reader::GeometryType>,
    pub geometry_dimension: wkb::reader::Dimension,
    pub srs_id: u32,
    pub property_columns: Vec<ColumnSpec>,
    insert_sql: String,
}

// When issuing the SELECT query, always place these columns first so that
// we don't need to find the positions every time.
const GEOMETRY_INDEX: usize = 0;
const PRIMARY_INDEX: usize = 1;

impl<'a> GpkgLayer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        conn: &'a Gpkg,
        layer_name: String,
        geometry_column: String,
        primary_key_column: String,
        geometry_type: Option<wkb::reader::GeometryType>,
        geometry_dimension: wkb::reader::Dimension,
        srs_id: u32,
        property_columns: Vec<ColumnSpec>,
    ) -> Self {
        let insert_sql = Self::build_insert_sql(&layer_name, &geometry_column, &property_columns);
        Self {
            conn,
            layer_name,
            geometry_column,
            primary_key_column,
            geometry_type,
            geometry_dimension,
            srs_id,
            property_columns,
            insert_sql,
        }
    }

    /// Position of a property column in [`GpkgFeature`] properties.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.property_columns
            .iter()
            .position(|spec| spec.name.eq_ignore_ascii_case(name))
    }

    /// Read all features in primary key order.
    pub fn features(&self) -> Result<Vec<GpkgFeature>> {
        let columns = self.property_columns.iter().map(|spec| spec.name.as_str());
        let sql = sql_select_features(
            &self.layer_name,
            &self.geometry_column,
            &self.primary_key_column,
            columns,
        );

        let mut stmt = self.conn.connection().prepare(&sql)?;
        let features = stmt
            .query_map([], |row| {
                let geometry = match row.get_ref(GEOMETRY_INDEX)? {
                    rusqlite::types::ValueRef::Blob(bytes) => Some(bytes.to_vec()),
                    rusqlite::types::ValueRef::Null => None,
                    other => {
                        return Err(rusqlite::Error::InvalidColumnType(
                            GEOMETRY_INDEX,
                            self.geometry_column.clone(),
                            other.data_type(),
                        ));
                    }
                };
                let id: Option<i64> = row.get(PRIMARY_INDEX)?;
                let id = id.ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(
                        PRIMARY_INDEX,
                        self.primary_key_column.clone(),
                        Type::Null,
                    )
                })?;

                let mut properties = Vec::with_capacity(self.property_columns.len());
                for idx in 0..self.property_columns.len() {
                    properties.push(row.get::<_, Value>(idx + 2)?);
                }

                Ok(GpkgFeature::from_parts(id, geometry, properties))
            })?
            .collect::<std::result::Result<Vec<GpkgFeature>, _>>()?;

        Ok(features)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.conn.connection().query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_name(&self.layer_name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Insert a feature with geometry and ordered property values.
    pub fn insert<G, P>(&self, geometry: G, properties: P) -> Result<()>
    where
        G: GeometryTrait<T = f64>,
        P: IntoIterator<Item = Value>,
    {
        self.ensure_writable()?;

        let mut wkb = Vec::new();
        wkb::writer::write_geometry(&mut wkb, &geometry, &Default::default())?;
        let geom = wkb_to_gpkg_geometry(&wkb, self.srs_id);

        self.execute_insert(Value::Blob(geom), properties)
    }

    /// Insert a feature from a GeoPackage geometry blob.
    ///
    /// The blob header is rewritten to carry this layer's SRS id.
    pub fn insert_blob<P>(&self, blob: Option<&[u8]>, properties: P) -> Result<()>
    where
        P: IntoIterator<Item = Value>,
    {
        self.ensure_writable()?;

        let geom = match blob {
            Some(blob) => {
                let wkb = gpkg_geometry_to_wkb(blob)?;
                Value::Blob(wkb_to_gpkg_geometry(wkb.buf(), self.srs_id))
            }
            None => Value::Null,
        };
        self.execute_insert(geom, properties)
    }

    /// Add a property column to the layer.
    pub fn add_column(&mut self, spec: ColumnSpec) -> Result<()> {
        self.ensure_writable()?;
        if self.property_index(&spec.name).is_some() {
            return Err(OverlayError::InvalidArgument(format!(
                "column {} already exists on layer {}",
                spec.name, self.layer_name
            )));
        }

        self.conn.connection().execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_name(&self.layer_name),
            quote_name(&spec.name),
            column_type_to_str(spec.column_type)
        ))?;
        self.property_columns.push(spec);
        self.insert_sql = Self::build_insert_sql(
            &self.layer_name,
            &self.geometry_column,
            &self.property_columns,
        );
        Ok(())
    }

    /// Set one property of the feature with primary key `id`.
    ///
    /// Returns whether a feature was updated.
    pub fn set_property(&self, id: i64, column: &str, value: &Value) -> Result<bool> {
        self.ensure_writable()?;
        let idx = self.property_index(column).ok_or_else(|| OverlayError::MissingField {
            table: self.layer_name.clone(),
            field: column.to_string(),
        })?;

        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE {} = ?2",
            quote_name(&self.layer_name),
            quote_name(&self.property_columns[idx].name),
            quote_name(&self.primary_key_column)
        );
        let mut stmt = self.conn.connection().prepare_cached(&sql)?;
        let updated = stmt.execute(rusqlite::params![value, id])?;
        Ok(updated > 0)
    }

    fn execute_insert<P>(&self, geom: Value, properties: P) -> Result<()>
    where
        P: IntoIterator<Item = Value>,
    {
        let params = std::iter::once(geom).chain(properties);
        let mut stmt = self.conn.connection().prepare_cached(&self.insert_sql)?;
        stmt.execute(params_from_iter(params))?;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.conn.is_read_only() {
            return Err(OverlayError::ReadOnly);
        }
        Ok(())
    }

    fn build_insert_sql(
        layer_name: &str,
        geometry_column: &str,
        property_columns: &[ColumnSpec],
    ) -> String {
        let mut columns = Vec::with_capacity(property_columns.len() + 1);
        columns.push(quote_name(geometry_column));
        columns.extend(property_columns.iter().map(|spec| quote_name(&spec.name)));

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<String>>()
            .join(",");

        sql_insert_feature(layer_name, &columns.join(","), &placeholders)
    }
}
