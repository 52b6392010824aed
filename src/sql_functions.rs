use crate::conversions::geometry_type_to_str;
use crate::error::{OverlayError, to_sql_error};
use crate::geometry::{
    area, decode_geometry, encode_geometry, gpkg_geometry_to_wkb, perimeter,
    require_multi_polygon, shape_index, to_multi_polygon, wkb_to_gpkg_geometry,
};
use geo::algorithm::bool_ops::{BooleanOps, unary_union};
use geo::{Geometry, Intersects, MultiPolygon, Polygon};
use geo_traits::{
    CoordTrait, GeometryCollectionTrait, GeometryTrait, LineStringTrait, MultiLineStringTrait,
    MultiPointTrait, MultiPolygonTrait, PointTrait, PolygonTrait,
};
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{Connection, Error};
use wkb::reader::Wkb;

type SqlResult<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy)]
struct Bounds {
    minx: f64,
    maxx: f64,
    miny: f64,
    maxy: f64,
}

/// Register the spatial SQL function set in the provided connection.
///
/// Re-registering replaces the previous definitions, so calling this twice on
/// the same connection is harmless.
///
/// Example:
/// ```no_run
/// use rusqlite::Connection;
/// use gpkg_overlay::register_spatial_functions;
///
/// let conn = Connection::open_in_memory()?;
/// register_spatial_functions(&conn)?;
/// # Ok::<(), gpkg_overlay::OverlayError>(())
/// ```
pub fn register_spatial_functions(conn: &Connection) -> crate::Result<()> {
    register_st_minx(conn)?;
    register_st_miny(conn)?;
    register_st_maxx(conn)?;
    register_st_maxy(conn)?;
    register_st_isempty(conn)?;
    register_st_area(conn)?;
    register_st_perimeter(conn)?;
    register_st_intersects(conn)?;
    register_st_intersection(conn)?;
    register_st_difference(conn)?;
    register_st_makevalid(conn)?;
    register_st_geometrytype(conn)?;
    register_st_geomfromwkb(conn)?;
    register_st_astext(conn)?;
    register_st_aswkb(conn)?;
    register_shape_index(conn)?;
    register_st_union_agg(conn)?;
    Ok(())
}

pub(crate) fn register_st_minx(conn: &Connection) -> crate::Result<()> {
    register_bounds_component(conn, "ST_MinX", |b| b.minx)
}

pub(crate) fn register_st_miny(conn: &Connection) -> crate::Result<()> {
    register_bounds_component(conn, "ST_MinY", |b| b.miny)
}

pub(crate) fn register_st_maxx(conn: &Connection) -> crate::Result<()> {
    register_bounds_component(conn, "ST_MaxX", |b| b.maxx)
}

pub(crate) fn register_st_maxy(conn: &Connection) -> crate::Result<()> {
    register_bounds_component(conn, "ST_MaxY", |b| b.maxy)
}

pub(crate) fn register_st_isempty(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function(
        "ST_IsEmpty",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let Some(blob) = blob_arg(ctx, 0)? else {
                return Ok(None);
            };
            let wkb = gpkg_geometry_to_wkb(&blob).map_err(to_sql_error)?;
            let is_empty = bounds_from_geometry(&wkb).is_none();
            Ok(Some(i64::from(is_empty)))
        },
    )?;
    Ok(())
}

fn register_st_area(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function("ST_Area", 1, FunctionFlags::SQLITE_DETERMINISTIC, |ctx| {
        Ok(geometry_arg(ctx, 0)?.map(|(geom, _)| area(&geom)))
    })?;
    Ok(())
}

fn register_st_perimeter(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function(
        "ST_Perimeter",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(geometry_arg(ctx, 0)?.map(|(geom, _)| perimeter(&geom))),
    )?;
    Ok(())
}

fn register_st_intersects(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function(
        "ST_Intersects",
        2,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let (Some((a, _)), Some((b, _))) = (geometry_arg(ctx, 0)?, geometry_arg(ctx, 1)?)
            else {
                return Ok(None);
            };
            Ok(Some(i64::from(a.intersects(&b))))
        },
    )?;
    Ok(())
}

fn register_st_intersection(conn: &Connection) -> crate::Result<()> {
    register_polygon_op(conn, "ST_Intersection", |a, b| a.intersection(b))
}

fn register_st_difference(conn: &Connection) -> crate::Result<()> {
    register_polygon_op(conn, "ST_Difference", |a, b| a.difference(b))
}

fn register_polygon_op<F>(conn: &Connection, name: &'static str, op: F) -> crate::Result<()>
where
    F: Fn(&MultiPolygon<f64>, &MultiPolygon<f64>) -> MultiPolygon<f64> + Copy + Send + 'static,
{
    conn.create_scalar_function(name, 2, FunctionFlags::SQLITE_DETERMINISTIC, move |ctx| {
        let (Some((a, srs_id)), Some((b, _))) = (geometry_arg(ctx, 0)?, geometry_arg(ctx, 1)?)
        else {
            return Ok(None);
        };
        let a = require_multi_polygon(&a, name).map_err(to_sql_error)?;
        let b = require_multi_polygon(&b, name).map_err(to_sql_error)?;
        let result = Geometry::MultiPolygon(op(&a, &b));
        encode_geometry(&result, srs_id)
            .map(Some)
            .map_err(to_sql_error)
    })?;
    Ok(())
}

fn register_st_makevalid(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function(
        "ST_MakeValid",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let Some((geom, srs_id)) = geometry_arg(ctx, 0)? else {
                return Ok(None);
            };
            let repaired = make_valid(geom);
            encode_geometry(&repaired, srs_id)
                .map(Some)
                .map_err(to_sql_error)
        },
    )?;
    Ok(())
}

/// Repair polygonal geometries by re-noding them through a unary union, which
/// resolves self-overlaps and drops zero-area rings. Other types pass through.
pub(crate) fn make_valid(geom: Geometry<f64>) -> Geometry<f64> {
    let Some(mp) = to_multi_polygon(&geom) else {
        return geom;
    };
    let was_single = matches!(geom, Geometry::Polygon(_));
    let mut repaired = unary_union(mp.iter());
    if was_single && repaired.0.len() == 1 {
        if let Some(polygon) = repaired.0.pop() {
            return Geometry::Polygon(polygon);
        }
    }
    Geometry::MultiPolygon(repaired)
}

fn register_st_geometrytype(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function(
        "ST_GeometryType",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let Some(blob) = blob_arg(ctx, 0)? else {
                return Ok(None);
            };
            let wkb = gpkg_geometry_to_wkb(&blob).map_err(to_sql_error)?;
            Ok(Some(geometry_type_to_str(wkb.geometry_type()).to_string()))
        },
    )?;
    Ok(())
}

fn register_st_geomfromwkb(conn: &Connection) -> crate::Result<()> {
    fn from_wkb(ctx: &Context<'_>, srs_id: u32) -> SqlResult<Option<Vec<u8>>> {
        let Some(blob) = blob_arg(ctx, 0)? else {
            return Ok(None);
        };
        Wkb::try_new(&blob).map_err(|err| to_sql_error(OverlayError::from(err)))?;
        Ok(Some(wkb_to_gpkg_geometry(&blob, srs_id)))
    }

    conn.create_scalar_function(
        "ST_GeomFromWKB",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| from_wkb(ctx, 0),
    )?;
    conn.create_scalar_function(
        "ST_GeomFromWKB",
        2,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let srs_id: i64 = ctx.get(1)?;
            let srs_id = u32::try_from(srs_id).map_err(|_| {
                to_sql_error(OverlayError::InvalidArgument(format!(
                    "ST_GeomFromWKB: srs id {srs_id} is out of range"
                )))
            })?;
            from_wkb(ctx, srs_id)
        },
    )?;
    Ok(())
}

fn register_st_astext(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function("ST_AsText", 1, FunctionFlags::SQLITE_DETERMINISTIC, |ctx| {
        let Some(blob) = blob_arg(ctx, 0)? else {
            return Ok(None);
        };
        let wkb = gpkg_geometry_to_wkb(&blob).map_err(to_sql_error)?;
        let mut wkt = String::new();
        wkt::to_wkt::write_geometry(&mut wkt, &wkb)
            .map_err(|err| Error::UserFunctionError(err.to_string().into()))?;
        Ok(Some(wkt))
    })?;
    Ok(())
}

fn register_st_aswkb(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function("ST_AsWKB", 1, FunctionFlags::SQLITE_DETERMINISTIC, |ctx| {
        let Some(blob) = blob_arg(ctx, 0)? else {
            return Ok(None);
        };
        let wkb = gpkg_geometry_to_wkb(&blob).map_err(to_sql_error)?;
        Ok(Some(wkb.buf().to_vec()))
    })?;
    Ok(())
}

fn register_shape_index(conn: &Connection) -> crate::Result<()> {
    conn.create_scalar_function(
        "SHAPE_INDEX",
        2,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let perimeter: Option<f64> = ctx.get(0)?;
            let area: Option<f64> = ctx.get(1)?;
            Ok(match (perimeter, area) {
                (Some(perimeter), Some(area)) => shape_index(perimeter, area),
                _ => None,
            })
        },
    )?;
    Ok(())
}

#[derive(Default)]
struct UnionState {
    polygons: Vec<Polygon<f64>>,
    srs_id: Option<u32>,
}

/// `ST_Union_Agg(geom)`: dissolve all polygonal inputs of a group into one
/// multipolygon. NULL inputs are ignored.
struct UnionAgg;

impl Aggregate<UnionState, Option<Vec<u8>>> for UnionAgg {
    fn init(&self, _ctx: &mut Context<'_>) -> SqlResult<UnionState> {
        Ok(UnionState::default())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut UnionState) -> SqlResult<()> {
        let Some((geom, srs_id)) = geometry_arg(ctx, 0)? else {
            return Ok(());
        };
        let mp = require_multi_polygon(&geom, "ST_Union_Agg").map_err(to_sql_error)?;
        acc.srs_id.get_or_insert(srs_id);
        acc.polygons.extend(mp.0);
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        acc: Option<UnionState>,
    ) -> SqlResult<Option<Vec<u8>>> {
        let Some(UnionState {
            polygons,
            srs_id: Some(srs_id),
        }) = acc
        else {
            return Ok(None);
        };
        let union = unary_union(polygons.iter());
        encode_geometry(&Geometry::MultiPolygon(union), srs_id)
            .map(Some)
            .map_err(to_sql_error)
    }
}

fn register_st_union_agg(conn: &Connection) -> crate::Result<()> {
    conn.create_aggregate_function(
        "ST_Union_Agg",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        UnionAgg,
    )?;
    Ok(())
}

fn register_bounds_component<F>(conn: &Connection, name: &str, f: F) -> crate::Result<()>
where
    F: Fn(Bounds) -> f64 + Copy + Send + Sync + 'static,
{
    conn.create_scalar_function(name, 1, FunctionFlags::SQLITE_DETERMINISTIC, move |ctx| {
        let Some(blob) = blob_arg(ctx, 0)? else {
            return Ok(None);
        };
        let wkb = gpkg_geometry_to_wkb(&blob).map_err(to_sql_error)?;
        Ok(bounds_from_geometry(&wkb).map(f))
    })?;
    Ok(())
}

fn blob_arg(ctx: &Context<'_>, idx: usize) -> SqlResult<Option<Vec<u8>>> {
    match ctx.get_raw(idx) {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(blob) => Ok(Some(blob.to_vec())),
        _ => Err(Error::InvalidFunctionParameterType(idx, Type::Blob)),
    }
}

fn geometry_arg(ctx: &Context<'_>, idx: usize) -> SqlResult<Option<(Geometry<f64>, u32)>> {
    match ctx.get_raw(idx) {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(blob) => decode_geometry(blob).map(Some).map_err(to_sql_error),
        _ => Err(Error::InvalidFunctionParameterType(idx, Type::Blob)),
    }
}

fn bounds_from_geometry<G: GeometryTrait<T = f64>>(geom: &G) -> Option<Bounds> {
    use geo_traits::GeometryType as GeoType;

    let mut bounds: Option<Bounds> = None;
    match geom.as_type() {
        GeoType::Point(point) => {
            if let Some(coord) = point.coord() {
                add_coord(&mut bounds, &coord);
            }
        }
        GeoType::LineString(line) => {
            add_line_string(&mut bounds, line);
        }
        GeoType::Polygon(poly) => {
            if let Some(ring) = poly.exterior() {
                add_line_string(&mut bounds, &ring);
            }
            for ring in poly.interiors() {
                add_line_string(&mut bounds, &ring);
            }
        }
        GeoType::MultiPoint(multi) => {
            for point in multi.points() {
                if let Some(coord) = point.coord() {
                    add_coord(&mut bounds, &coord);
                }
            }
        }
        GeoType::MultiLineString(multi) => {
            for line in multi.line_strings() {
                add_line_string(&mut bounds, &line);
            }
        }
        GeoType::MultiPolygon(multi) => {
            for poly in multi.polygons() {
                if let Some(ring) = poly.exterior() {
                    add_line_string(&mut bounds, &ring);
                }
                for ring in poly.interiors() {
                    add_line_string(&mut bounds, &ring);
                }
            }
        }
        GeoType::GeometryCollection(collection) => {
            for sub_geom in collection.geometries() {
                if let Some(sub_bounds) = bounds_from_geometry(&sub_geom) {
                    merge_bounds(&mut bounds, sub_bounds);
                }
            }
        }
        GeoType::Rect(_) | GeoType::Triangle(_) | GeoType::Line(_) => {
            // WKB never decodes to these.
            unreachable!()
        }
    }

    bounds
}

fn add_line_string<L: LineStringTrait<T = f64>>(bounds: &mut Option<Bounds>, line: &L) {
    for coord in line.coords() {
        add_coord(bounds, &coord);
    }
}

fn add_coord<C: CoordTrait<T = f64>>(bounds: &mut Option<Bounds>, coord: &C) {
    let (x, y) = coord.x_y();
    merge_bounds(
        bounds,
        Bounds {
            minx: x,
            maxx: x,
            miny: y,
            maxy: y,
        },
    );
}

fn merge_bounds(bounds: &mut Option<Bounds>, other: Bounds) {
    match bounds {
        Some(existing) => {
            existing.minx = existing.minx.min(other.minx);
            existing.maxx = existing.maxx.max(other.maxx);
            existing.miny = existing.miny.min(other.miny);
            existing.maxy = existing.maxy.max(other.maxy);
        }
        None => *bounds = Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::register_spatial_functions;
    use crate::geometry::tests::{gpkg_blob, square};
    use geo_types::{LineString, MultiPolygon, Point};
    use rusqlite::{Connection, params};

    fn conn() -> crate::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        register_spatial_functions(&conn)?;
        Ok(conn)
    }

    #[test]
    fn registering_twice_is_a_noop() -> crate::Result<()> {
        let conn = conn()?;
        register_spatial_functions(&conn)?;
        let area: f64 = conn.query_row(
            "SELECT ST_Area(?1)",
            params![gpkg_blob(square(0.0, 0.0, 2.0), 0)],
            |row| row.get(0),
        )?;
        assert_eq!(area, 4.0);
        Ok(())
    }

    #[test]
    fn st_bounds_for_point() -> crate::Result<()> {
        let conn = conn()?;
        let blob = gpkg_blob(Point::new(1.5, -2.0), 4326);

        let (minx, maxx, miny, maxy, empty): (f64, f64, f64, f64, i64) = conn.query_row(
            "SELECT ST_MinX(?1), ST_MaxX(?1), ST_MinY(?1), ST_MaxY(?1), ST_IsEmpty(?1)",
            params![blob],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;

        assert_eq!((minx, maxx, miny, maxy), (1.5, 1.5, -2.0, -2.0));
        assert_eq!(empty, 0);
        Ok(())
    }

    #[test]
    fn st_bounds_for_line_string() -> crate::Result<()> {
        let conn = conn()?;
        let line = LineString::from(vec![(3.0, -1.0), (-2.0, 4.0), (1.0, 0.5)]);

        let (minx, maxx, miny, maxy): (f64, f64, f64, f64) = conn.query_row(
            "SELECT ST_MinX(?1), ST_MaxX(?1), ST_MinY(?1), ST_MaxY(?1)",
            params![gpkg_blob(line, 0)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        assert_eq!((minx, maxx, miny, maxy), (-2.0, 3.0, -1.0, 4.0));
        Ok(())
    }

    #[test]
    fn intersection_area_of_overlapping_squares() -> crate::Result<()> {
        let conn = conn()?;
        let a = gpkg_blob(square(0.0, 0.0, 2.0), 25833);
        let b = gpkg_blob(square(1.0, 0.0, 2.0), 25833);

        let (hit, overlap, rest): (i64, f64, f64) = conn.query_row(
            "SELECT ST_Intersects(?1, ?2), ST_Area(ST_Intersection(?1, ?2)), ST_Area(ST_Difference(?1, ?2))",
            params![a, b],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        assert_eq!(hit, 1);
        assert!((overlap - 2.0).abs() < 1e-9);
        assert!((rest - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn disjoint_squares_do_not_intersect() -> crate::Result<()> {
        let conn = conn()?;
        let a = gpkg_blob(square(0.0, 0.0, 1.0), 0);
        let b = gpkg_blob(square(5.0, 5.0, 1.0), 0);
        let (hit, overlap): (i64, f64) = conn.query_row(
            "SELECT ST_Intersects(?1, ?2), ST_Area(ST_Intersection(?1, ?2))",
            params![a, b],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(hit, 0);
        assert_eq!(overlap, 0.0);
        Ok(())
    }

    #[test]
    fn intersection_rejects_lines() -> crate::Result<()> {
        let conn = conn()?;
        let line = gpkg_blob(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]), 0);
        let poly = gpkg_blob(square(0.0, 0.0, 1.0), 0);
        let result: rusqlite::Result<Vec<u8>> =
            conn.query_row("SELECT ST_Intersection(?1, ?2)", params![line, poly], |row| {
                row.get(0)
            });
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn null_inputs_give_null() -> crate::Result<()> {
        let conn = conn()?;
        let (area, text): (Option<f64>, Option<String>) = conn.query_row(
            "SELECT ST_Area(NULL), ST_AsText(NULL)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(area, None);
        assert_eq!(text, None);
        Ok(())
    }

    #[test]
    fn union_agg_dissolves_group() -> crate::Result<()> {
        let conn = conn()?;
        conn.execute_batch("CREATE TABLE parts (id INTEGER, geom BLOB)")?;
        for (id, x) in [(1, 0.0), (1, 1.0), (2, 10.0)] {
            conn.execute(
                "INSERT INTO parts VALUES (?1, ?2)",
                params![id, gpkg_blob(square(x, 0.0, 1.0), 0)],
            )?;
        }

        let mut stmt = conn.prepare(
            "SELECT id, ST_Area(ST_Union_Agg(geom)), ST_GeometryType(ST_Union_Agg(geom)) FROM parts GROUP BY id ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<(i64, f64, String)>>>()?;

        assert_eq!(rows.len(), 2);
        assert!((rows[0].1 - 2.0).abs() < 1e-9);
        assert_eq!(rows[0].2, "MULTIPOLYGON");
        assert!((rows[1].1 - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn make_valid_dissolves_overlapping_parts() -> crate::Result<()> {
        let conn = conn()?;
        let overlapping = MultiPolygon::new(vec![square(0.0, 0.0, 2.0), square(1.0, 0.0, 2.0)]);
        let blob = gpkg_blob(overlapping, 0);
        let (before, after): (f64, f64) = conn.query_row(
            "SELECT ST_Area(?1), ST_Area(ST_MakeValid(?1))",
            params![blob],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert!((after - 6.0).abs() < 1e-9);
        assert!(before >= after);
        Ok(())
    }

    #[test]
    fn wkb_roundtrip_through_text() -> crate::Result<()> {
        let conn = conn()?;
        let mut wkb = Vec::new();
        wkb::writer::write_geometry(&mut wkb, &Point::new(1.0, 2.0), &Default::default())?;

        let (text, ty, raw): (String, String, Vec<u8>) = conn.query_row(
            "SELECT ST_AsText(ST_GeomFromWKB(?1, 25833)), ST_GeometryType(ST_GeomFromWKB(?1)), ST_AsWKB(ST_GeomFromWKB(?1))",
            params![wkb],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!(text, "POINT(1 2)");
        assert_eq!(ty, "POINT");
        assert_eq!(raw, wkb);
        Ok(())
    }

    #[test]
    fn out_of_range_srs_id_is_an_error() -> crate::Result<()> {
        let conn = conn()?;
        let mut wkb = Vec::new();
        wkb::writer::write_geometry(&mut wkb, &Point::new(1.0, 2.0), &Default::default())?;

        for srs_id in [-1_i64, i64::from(u32::MAX) + 1] {
            let result: rusqlite::Result<Vec<u8>> = conn.query_row(
                "SELECT ST_GeomFromWKB(?1, ?2)",
                params![wkb, srs_id],
                |row| row.get(0),
            );
            assert!(result.is_err(), "srs id {srs_id}");
        }

        let srs_id: i64 = conn.query_row(
            "SELECT ST_GeomFromWKB(?1, 4294967295) IS NOT NULL",
            params![wkb],
            |row| row.get(0),
        )?;
        assert_eq!(srs_id, 1);
        Ok(())
    }

    #[test]
    fn shape_index_of_zero_area_is_null() -> crate::Result<()> {
        let conn = conn()?;
        let (zero, square_si): (Option<f64>, f64) =
            conn.query_row("SELECT SHAPE_INDEX(4.0, 0.0), SHAPE_INDEX(4.0, 1.0)", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        assert_eq!(zero, None);
        assert!(square_si > 1.0);
        Ok(())
    }
}
