use crate::error::OverlayError;
use crate::types::ColumnType;

#[inline]
pub(crate) fn geometry_type_to_str(geometry_type: wkb::reader::GeometryType) -> &'static str {
    match geometry_type {
        wkb::reader::GeometryType::GeometryCollection => "GEOMETRYCOLLECTION",
        wkb::reader::GeometryType::Point => "POINT",
        wkb::reader::GeometryType::LineString => "LINESTRING",
        wkb::reader::GeometryType::Polygon => "POLYGON",
        wkb::reader::GeometryType::MultiPoint => "MULTIPOINT",
        wkb::reader::GeometryType::MultiLineString => "MULTILINESTRING",
        wkb::reader::GeometryType::MultiPolygon => "MULTIPOLYGON",
        _ => "GEOMETRY",
    }
}

/// Layer-level geometry type name; `None` stands for the generic `GEOMETRY`.
#[inline]
pub(crate) fn layer_geometry_type_to_str(
    geometry_type: Option<wkb::reader::GeometryType>,
) -> &'static str {
    match geometry_type {
        Some(geometry_type) => geometry_type_to_str(geometry_type),
        None => "GEOMETRY",
    }
}

#[inline]
pub(crate) fn geometry_type_from_str(
    geometry_type_str: &str,
) -> Result<Option<wkb::reader::GeometryType>, OverlayError> {
    let s = geometry_type_str;
    if s.eq_ignore_ascii_case("GEOMETRY") {
        Ok(None)
    } else if s.eq_ignore_ascii_case("GEOMETRYCOLLECTION") {
        Ok(Some(wkb::reader::GeometryType::GeometryCollection))
    } else if s.eq_ignore_ascii_case("POINT") {
        Ok(Some(wkb::reader::GeometryType::Point))
    } else if s.eq_ignore_ascii_case("LINESTRING") {
        Ok(Some(wkb::reader::GeometryType::LineString))
    } else if s.eq_ignore_ascii_case("POLYGON") {
        Ok(Some(wkb::reader::GeometryType::Polygon))
    } else if s.eq_ignore_ascii_case("MULTIPOINT") {
        Ok(Some(wkb::reader::GeometryType::MultiPoint))
    } else if s.eq_ignore_ascii_case("MULTILINESTRING") {
        Ok(Some(wkb::reader::GeometryType::MultiLineString))
    } else if s.eq_ignore_ascii_case("MULTIPOLYGON") {
        Ok(Some(wkb::reader::GeometryType::MultiPolygon))
    } else {
        Err(OverlayError::UnsupportedGeometryType(
            geometry_type_str.to_string(),
        ))
    }
}

#[inline]
pub(crate) fn dimension_to_zm(dimension: wkb::reader::Dimension) -> (i8, i8) {
    match dimension {
        wkb::reader::Dimension::Xy => (0, 0),
        wkb::reader::Dimension::Xyz => (1, 0),
        wkb::reader::Dimension::Xym => (0, 1),
        wkb::reader::Dimension::Xyzm => (1, 1),
    }
}

#[inline]
pub(crate) fn dimension_from_zm(z: i8, m: i8) -> Result<wkb::reader::Dimension, OverlayError> {
    match (z, m) {
        (0, 0) => Ok(wkb::reader::Dimension::Xy),
        (1, 0) => Ok(wkb::reader::Dimension::Xyz),
        (0, 1) => Ok(wkb::reader::Dimension::Xym),
        (1, 1) => Ok(wkb::reader::Dimension::Xyzm),
        // 2 means "optional"; treat it as XY since the store keeps 2D only.
        (2, 2) | (2, 0) | (0, 2) => Ok(wkb::reader::Dimension::Xy),
        _ => Err(OverlayError::InvalidDimension { z, m }),
    }
}

#[inline]
pub(crate) fn column_type_to_str(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "INTEGER",
        ColumnType::Double => "REAL",
        ColumnType::Varchar => "TEXT",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Geometry => "GEOMETRY",
    }
}

#[inline]
pub(crate) fn column_type_from_str(column_type_str: &str) -> Option<ColumnType> {
    let s = column_type_str;
    if s.eq_ignore_ascii_case("TINYINT")
        || s.eq_ignore_ascii_case("SMALLINT")
        || s.eq_ignore_ascii_case("MEDIUMINT")
        || s.eq_ignore_ascii_case("INT")
        || s.eq_ignore_ascii_case("INTEGER")
        || s.eq_ignore_ascii_case("BIGINT")
    {
        Some(ColumnType::Integer)
    } else if s.eq_ignore_ascii_case("DOUBLE")
        || s.eq_ignore_ascii_case("FLOAT")
        || s.eq_ignore_ascii_case("REAL")
        || s.eq_ignore_ascii_case("NUM")
        || s.eq_ignore_ascii_case("NUMERIC")
    {
        Some(ColumnType::Double)
    } else if s.eq_ignore_ascii_case("TEXT")
        || (s.len() > 4 && s[..4].eq_ignore_ascii_case("TEXT"))
        || s.eq_ignore_ascii_case("DATE")
        || s.eq_ignore_ascii_case("DATETIME")
    {
        // GeoPackage allows TEXT(maxlen); dates are ISO-8601 text
        Some(ColumnType::Varchar)
    } else if s.eq_ignore_ascii_case("BOOLEAN") {
        Some(ColumnType::Boolean)
    } else if s.eq_ignore_ascii_case("BLOB") {
        Some(ColumnType::Geometry)
    } else if s.eq_ignore_ascii_case("GEOMETRY")
        || s.eq_ignore_ascii_case("POINT")
        || s.eq_ignore_ascii_case("LINESTRING")
        || s.eq_ignore_ascii_case("POLYGON")
        || s.eq_ignore_ascii_case("MULTIPOINT")
        || s.eq_ignore_ascii_case("MULTILINESTRING")
        || s.eq_ignore_ascii_case("MULTIPOLYGON")
        || s.eq_ignore_ascii_case("GEOMETRYCOLLECTION")
    {
        Some(ColumnType::Geometry)
    } else {
        None
    }
}

/// Map the result of SQLite's `typeof()` onto a column type.
///
/// Used for columns created by `CREATE TABLE ... AS SELECT`, which carry no
/// declared type for expression results.
#[inline]
pub(crate) fn column_type_from_typeof(type_name: &str) -> Option<ColumnType> {
    match type_name {
        "integer" => Some(ColumnType::Integer),
        "real" => Some(ColumnType::Double),
        "text" => Some(ColumnType::Varchar),
        "blob" => Some(ColumnType::Geometry),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkb::reader::GeometryType;

    #[test]
    fn geometry_type_names_roundtrip() {
        for ty in [
            GeometryType::Point,
            GeometryType::LineString,
            GeometryType::Polygon,
            GeometryType::MultiPoint,
            GeometryType::MultiLineString,
            GeometryType::MultiPolygon,
            GeometryType::GeometryCollection,
        ] {
            let name = geometry_type_to_str(ty);
            assert_eq!(geometry_type_from_str(name).expect("known type"), Some(ty));
        }
        assert_eq!(geometry_type_from_str("geometry").expect("generic"), None);
        assert!(geometry_type_from_str("CURVEPOLYGON").is_err());
    }

    #[test]
    fn declared_types_from_create_table_as() {
        assert_eq!(column_type_from_str("INT"), Some(ColumnType::Integer));
        assert_eq!(column_type_from_str("NUM"), Some(ColumnType::Double));
        assert_eq!(column_type_from_str("TEXT(32)"), Some(ColumnType::Varchar));
        assert_eq!(column_type_from_str(""), None);
        assert_eq!(column_type_from_typeof("real"), Some(ColumnType::Double));
        assert_eq!(column_type_from_typeof("null"), None);
    }
}
