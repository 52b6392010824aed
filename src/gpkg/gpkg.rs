use crate::conversions::{
    column_type_from_str, column_type_to_str, dimension_from_zm, dimension_to_zm,
    geometry_type_from_str, layer_geometry_type_to_str,
};
use crate::error::{OverlayError, Result};
use crate::ogc_sql::{
    SQL_DELETE_LAYER_META, SQL_INSERT_GPKG_CONTENTS, SQL_INSERT_GPKG_GEOMETRY_COLUMNS,
    SQL_INSERT_SRS, SQL_LIST_LAYERS, SQL_SELECT_GEOMETRY_COLUMN_META, SQL_SELECT_SRS,
    SQL_TABLE_COLUMNS, execute_rtree_sqls, gpkg_rtree_drop_sql, initialize_gpkg, quote_name,
    sql_create_table, sql_drop_table,
};
use crate::sql_functions::register_spatial_functions;
use crate::types::{ColumnSpec, ColumnSpecs, SpatialRefSys};
use rusqlite::{OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

use super::layer::GpkgLayer;

#[derive(Debug)]
/// GeoPackage connection wrapper for reading source layers and writing exports.
pub struct Gpkg {
    conn: rusqlite::Connection,
    path: Option<PathBuf>,
    read_only: bool,
}

impl Gpkg {
    /// Open a GeoPackage in read-only mode.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OverlayError::MissingFile {
                path: path.to_path_buf(),
            });
        }

        let conn = rusqlite::Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        register_spatial_functions(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            read_only: true,
        })
    }

    /// Open an existing GeoPackage in read-write mode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OverlayError::MissingFile {
                path: path.to_path_buf(),
            });
        }

        let conn = rusqlite::Connection::open(path)?;
        register_spatial_functions(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            read_only: false,
        })
    }

    /// Create a new GeoPackage; fails if the file already exists.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(OverlayError::InvalidArgument(format!(
                "GeoPackage file already exists: {}",
                path.display()
            )));
        }

        let conn = rusqlite::Connection::open(path)?;
        initialize_gpkg(&conn)?;
        register_spatial_functions(&conn)?;
        tracing::debug!(path = %path.display(), "created GeoPackage");

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            read_only: false,
        })
    }

    /// Create a new GeoPackage in memory
    pub fn new_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;

        initialize_gpkg(&conn)?;
        register_spatial_functions(&conn)?;

        Ok(Self {
            conn,
            path: None,
            read_only: false,
        })
    }

    /// Open `path` for writing, creating the GeoPackage if needed.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::new(path)
        }
    }

    /// Register a spatial reference system in `gpkg_spatial_ref_sys`.
    ///
    /// Layers must reference an `srs_id` that is already registered. An entry
    /// with the same id is left untouched.
    pub fn register_srs(&self, srs: &SpatialRefSys) -> Result<()> {
        self.ensure_writable()?;

        self.conn.execute(
            SQL_INSERT_SRS,
            rusqlite::params![
                srs.srs_name,
                srs.srs_id,
                srs.organization,
                srs.organization_coordsys_id,
                srs.definition,
                srs.description
            ],
        )?;
        Ok(())
    }

    /// Look up a registered spatial reference system.
    pub fn spatial_ref_sys(&self, srs_id: i32) -> Result<Option<SpatialRefSys>> {
        let srs = self
            .conn
            .query_row(SQL_SELECT_SRS, [srs_id], |row| {
                Ok(SpatialRefSys {
                    srs_name: row.get(0)?,
                    srs_id: row.get(1)?,
                    organization: row.get(2)?,
                    organization_coordsys_id: row.get(3)?,
                    definition: row.get(4)?,
                    description: row.get(5)?,
                })
            })
            .optional()?;
        Ok(srs)
    }

    /// List the names of the feature layers.
    pub fn list_layers(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(SQL_LIST_LAYERS)?;
        let layers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(layers)
    }

    pub fn has_layer(&self, layer_name: &str) -> Result<bool> {
        Ok(self.list_layers()?.iter().any(|name| name == layer_name))
    }

    /// Load a layer definition and metadata by name.
    pub fn open_layer<'a>(&'a self, layer_name: &str) -> Result<GpkgLayer<'a>> {
        if !self.has_layer(layer_name)? {
            return Err(OverlayError::MissingLayer {
                path: self.path.clone().unwrap_or_default(),
                layer: layer_name.to_string(),
            });
        }

        let (geometry_column, geometry_type, geometry_dimension, srs_id) =
            self.get_geometry_column_and_srs_id(layer_name)?;
        let column_specs = self.get_column_specs(layer_name)?;
        let property_columns = column_specs
            .other_columns
            .into_iter()
            .filter(|spec| {
                spec.name != geometry_column && spec.name != column_specs.primary_key
            })
            .collect();

        Ok(GpkgLayer::new(
            self,
            layer_name.to_string(),
            geometry_column,
            column_specs.primary_key,
            geometry_type,
            geometry_dimension,
            srs_id,
            property_columns,
        ))
    }

    /// Create a new feature layer with an `fid` primary key and an R-tree
    /// index on the geometry column.
    ///
    /// `geometry_type` of `None` declares the generic `GEOMETRY` type.
    pub fn new_layer<'a>(
        &'a self,
        layer_name: &str,
        geometry_column: String,
        geometry_type: Option<wkb::reader::GeometryType>,
        geometry_dimension: wkb::reader::Dimension,
        srs_id: u32,
        property_columns: &[ColumnSpec],
    ) -> Result<GpkgLayer<'a>> {
        self.ensure_writable()?;

        if self.has_layer(layer_name)? {
            return Err(OverlayError::LayerAlreadyExists {
                layer_name: layer_name.to_string(),
            });
        }

        let srs_exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM gpkg_spatial_ref_sys WHERE srs_id = ?1)",
            rusqlite::params![srs_id],
            |row| row.get(0),
        )?;
        if !srs_exists {
            return Err(OverlayError::MissingSpatialRefSysId { srs_id });
        }

        let geometry_type_name = layer_geometry_type_to_str(geometry_type);
        let (z, m) = dimension_to_zm(geometry_dimension);

        let mut column_defs = Vec::with_capacity(property_columns.len() + 2);
        column_defs.push("fid INTEGER PRIMARY KEY AUTOINCREMENT".to_string());
        column_defs.push(format!(
            "{} {geometry_type_name}",
            quote_name(&geometry_column)
        ));
        for spec in property_columns {
            let col_type = column_type_to_str(spec.column_type);
            column_defs.push(format!("{} {col_type}", quote_name(&spec.name)));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&sql_create_table(layer_name, &column_defs.join(", ")))?;
        tx.execute(
            SQL_INSERT_GPKG_CONTENTS,
            rusqlite::params![layer_name, layer_name, srs_id],
        )?;
        tx.execute(
            SQL_INSERT_GPKG_GEOMETRY_COLUMNS,
            rusqlite::params![
                layer_name,
                geometry_column,
                geometry_type_name,
                srs_id,
                z,
                m
            ],
        )?;
        execute_rtree_sqls(&tx, layer_name, &geometry_column, "fid")?;
        tx.commit()?;
        tracing::debug!(layer = layer_name, geometry_type = geometry_type_name, srs_id, "created layer");

        Ok(GpkgLayer::new(
            self,
            layer_name.to_string(),
            geometry_column,
            "fid".to_string(),
            geometry_type,
            geometry_dimension,
            srs_id,
            property_columns.to_vec(),
        ))
    }

    /// Delete a layer together with its metadata rows and R-tree index.
    pub fn delete_layer(&self, layer_name: &str) -> Result<()> {
        self.ensure_writable()?;

        let (geometry_column, _, _, _) = self.get_geometry_column_and_srs_id(layer_name)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&gpkg_rtree_drop_sql(layer_name, &geometry_column))?;
        tx.execute_batch(&sql_drop_table(layer_name))?;
        for sql in SQL_DELETE_LAYER_META {
            tx.execute(sql, [layer_name])?;
        }
        tx.commit()?;
        tracing::debug!(layer = layer_name, "deleted layer");
        Ok(())
    }

    pub(crate) fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(OverlayError::ReadOnly);
        }
        Ok(())
    }

    /// Resolve the table columns and map SQLite types.
    pub(crate) fn get_column_specs(&self, layer_name: &str) -> Result<ColumnSpecs> {
        let mut stmt = self.conn.prepare(SQL_TABLE_COLUMNS)?;

        let columns = stmt
            .query_map([layer_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)? != 0,
                ))
            })?
            .collect::<std::result::Result<Vec<(String, String, bool)>, _>>()?;

        let mut primary_key: Option<String> = None;
        let mut other_columns = Vec::new();
        for (name, declared_type, is_primary_key) in columns {
            if is_primary_key {
                if primary_key.is_some() {
                    return Err(OverlayError::CompositePrimaryKeyUnsupported {
                        layer_name: layer_name.to_string(),
                    });
                }
                primary_key = Some(name.clone());
            }

            // cf. https://www.geopackage.org/spec140/index.html#_sqlite_container
            let column_type = column_type_from_str(&declared_type).ok_or_else(|| {
                OverlayError::UnsupportedColumnType {
                    column: name.clone(),
                    declared_type: declared_type.clone(),
                }
            })?;
            other_columns.push(ColumnSpec { name, column_type });
        }

        let primary_key = primary_key.ok_or_else(|| OverlayError::MissingPrimaryKeyColumn {
            layer_name: layer_name.to_string(),
        })?;

        Ok(ColumnSpecs {
            primary_key,
            other_columns,
        })
    }

    /// Resolve the geometry column metadata and SRS information for a layer.
    pub(crate) fn get_geometry_column_and_srs_id(
        &self,
        layer_name: &str,
    ) -> Result<(
        String,
        Option<wkb::reader::GeometryType>,
        wkb::reader::Dimension,
        u32,
    )> {
        let mut stmt = self.conn.prepare(SQL_SELECT_GEOMETRY_COLUMN_META)?;

        let meta = stmt
            .query_row([layer_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i8>(2)?,
                    row.get::<_, i8>(3)?,
                    row.get::<_, i32>(4)?,
                ))
            })
            .optional()?;
        let (geometry_column, geometry_type_str, z, m, srs_id) =
            meta.ok_or_else(|| OverlayError::MissingLayer {
                path: self.path.clone().unwrap_or_default(),
                layer: layer_name.to_string(),
            })?;

        let geometry_type = geometry_type_from_str(&geometry_type_str)?;
        let geometry_dimension = dimension_from_zm(z, m)?;

        Ok((geometry_column, geometry_type, geometry_dimension, srs_id as u32))
    }
}
