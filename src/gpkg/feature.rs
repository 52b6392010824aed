use crate::error::{OverlayError, Result};
use crate::geometry::gpkg_geometry_to_wkb;
use rusqlite::types::{FromSql, FromSqlError, Value, ValueRef};
use wkb::reader::Wkb;

/// A single feature with its GeoPackage geometry blob and owned properties.
#[derive(Clone, Debug, PartialEq)]
pub struct GpkgFeature {
    pub(super) id: i64,
    pub(super) geometry: Option<Vec<u8>>,
    pub(super) properties: Vec<Value>,
}

impl GpkgFeature {
    pub(crate) fn from_parts(id: i64, geometry: Option<Vec<u8>>, properties: Vec<Value>) -> Self {
        Self {
            id,
            geometry,
            properties,
        }
    }

    /// Return the primary key value.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Decode the geometry column into WKB.
    pub fn geometry(&self) -> Result<Wkb<'_>> {
        let bytes = self
            .geometry
            .as_ref()
            .ok_or(OverlayError::NullGeometryValue)?;
        gpkg_geometry_to_wkb(bytes)
    }

    /// The raw GeoPackage geometry blob, `None` for a NULL geometry.
    pub fn geometry_blob(&self) -> Option<&[u8]> {
        self.geometry.as_deref()
    }

    pub fn properties(&self) -> &[Value] {
        &self.properties
    }

    /// Read a property by index using rusqlite's `FromSql` conversion.
    pub fn property<T: FromSql>(&self, idx: usize) -> Result<T> {
        let value = self
            .properties
            .get(idx)
            .ok_or(OverlayError::Sql(rusqlite::Error::InvalidColumnIndex(idx)))?;
        let value_ref = ValueRef::from(value);
        FromSql::column_result(value_ref).map_err(|err| {
            let err = match err {
                FromSqlError::InvalidType => rusqlite::Error::InvalidColumnType(
                    idx,
                    format!("column {idx}"),
                    value_ref.data_type(),
                ),
                FromSqlError::OutOfRange(i) => rusqlite::Error::IntegralValueOutOfRange(idx, i),
                FromSqlError::Other(err) => {
                    rusqlite::Error::FromSqlConversionFailure(idx, value_ref.data_type(), err)
                }
                other => rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    value_ref.data_type(),
                    Box::new(other),
                ),
            };
            OverlayError::Sql(err)
        })
    }
}
