//! GeoPackage binary geometry codec and conversions to `geo` types.
//!
//! Every geometry value in the store is a GeoPackage geometry blob: the `GP`
//! header (with SRS id and optional envelope) followed by standard WKB.

use crate::error::{OverlayError, Result};
use geo::{Area, Geometry, MultiPolygon, Polygon};
use geo_traits::to_geo::ToGeoGeometry;
use wkb::reader::Wkb;

const GPKG_HEADER_LEN: usize = 8;

fn envelope_size(flags: u8) -> Result<usize> {
    match flags & 0b00001110 {
        0b00000000 => Ok(0),  // no envelope
        0b00000010 => Ok(32), // envelope is [minx, maxx, miny, maxy], 32 bytes
        0b00000100 => Ok(48), // envelope is [minx, maxx, miny, maxy, minz, maxz], 48 bytes
        0b00000110 => Ok(48), // envelope is [minx, maxx, miny, maxy, minm, maxm], 48 bytes
        0b00001000 => Ok(64), // envelope is [minx, maxx, miny, maxy, minz, maxz, minm, maxm], 64 bytes
        _ => Err(OverlayError::InvalidGpkgGeometryFlags(flags)),
    }
}

fn check_header(b: &[u8]) -> Result<u8> {
    if b.len() < GPKG_HEADER_LEN {
        return Err(OverlayError::InvalidGpkgGeometryLength {
            len: b.len(),
            minimum: GPKG_HEADER_LEN,
        });
    }
    if &b[..2] != b"GP" {
        return Err(OverlayError::InvalidGpkgGeometryMagic);
    }
    Ok(b[3])
}

/// Strip GeoPackage header and envelope bytes to access raw WKB.
// cf. https://www.geopackage.org/spec140/index.html#gpb_format
pub(crate) fn gpkg_geometry_to_wkb<'a>(b: &'a [u8]) -> Result<Wkb<'a>> {
    let flags = check_header(b)?;
    let offset = GPKG_HEADER_LEN + envelope_size(flags)?;
    if b.len() < offset {
        return Err(OverlayError::InvalidGpkgGeometryLength {
            len: b.len(),
            minimum: offset,
        });
    }

    Ok(Wkb::try_new(&b[offset..])?)
}

/// Read the SRS id stored in the GeoPackage geometry header.
pub(crate) fn gpkg_srs_id(b: &[u8]) -> Result<u32> {
    let flags = check_header(b)?;
    let bytes = [b[4], b[5], b[6], b[7]];
    // bit 0 of flags: 1 = little endian header values
    let srs_id = if flags & 0b00000001 == 1 {
        i32::from_le_bytes(bytes)
    } else {
        i32::from_be_bytes(bytes)
    };
    Ok(srs_id as u32)
}

// cf. https://www.geopackage.org/spec140/index.html#gpb_format
pub(crate) fn wkb_to_gpkg_geometry(wkb: &[u8], srs_id: u32) -> Vec<u8> {
    let mut geom = Vec::with_capacity(wkb.len() + GPKG_HEADER_LEN);
    geom.extend_from_slice(&[
        0x47u8, // magic
        0x50u8, // magic
        0x00u8, // version
        0x01u8, // flags (little endian SRS ID, no envelope)
    ]);
    geom.extend_from_slice(&srs_id.to_le_bytes());
    geom.extend_from_slice(wkb);
    geom
}

/// Decode a GeoPackage blob into a `geo` geometry plus its SRS id.
pub(crate) fn decode_geometry(blob: &[u8]) -> Result<(Geometry<f64>, u32)> {
    let srs_id = gpkg_srs_id(blob)?;
    let wkb = gpkg_geometry_to_wkb(blob)?;
    let geometry = wkb.try_to_geometry().ok_or(OverlayError::EmptyGeometry)?;
    Ok((geometry, srs_id))
}

/// Encode a `geo` geometry as a GeoPackage blob with the given SRS id.
pub(crate) fn encode_geometry(geometry: &Geometry<f64>, srs_id: u32) -> Result<Vec<u8>> {
    let mut wkb = Vec::new();
    wkb::writer::write_geometry(&mut wkb, geometry, &Default::default())?;
    Ok(wkb_to_gpkg_geometry(&wkb, srs_id))
}

/// Collect the area-bearing parts of a geometry, `None` for points and lines.
pub(crate) fn to_multi_polygon(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Some(MultiPolygon::new(vec![t.to_polygon()])),
        Geometry::GeometryCollection(gc) => {
            let mut polygons: Vec<Polygon<f64>> = Vec::new();
            for g in gc.iter() {
                polygons.extend(to_multi_polygon(g)?.0);
            }
            Some(MultiPolygon::new(polygons))
        }
        _ => None,
    }
}

pub(crate) fn require_multi_polygon(
    geometry: &Geometry<f64>,
    function: &'static str,
) -> Result<MultiPolygon<f64>> {
    to_multi_polygon(geometry).ok_or_else(|| OverlayError::NonPolygonalGeometry {
        function,
        geometry_type: geometry_name(geometry).to_string(),
    })
}

pub(crate) fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "POINT",
        Geometry::Line(_) | Geometry::LineString(_) => "LINESTRING",
        Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => "POLYGON",
        Geometry::MultiPoint(_) => "MULTIPOINT",
        Geometry::MultiLineString(_) => "MULTILINESTRING",
        Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
    }
}

pub(crate) fn area(geometry: &Geometry<f64>) -> f64 {
    geometry.unsigned_area()
}

/// Boundary length: sum of all polygon rings; zero for points and lines.
pub(crate) fn perimeter(geometry: &Geometry<f64>) -> f64 {
    fn ring_length(ring: &geo::LineString<f64>) -> f64 {
        ring.lines().map(|l| l.dx().hypot(l.dy())).sum()
    }

    match to_multi_polygon(geometry) {
        Some(mp) => mp
            .iter()
            .map(|p| ring_length(p.exterior()) + p.interiors().iter().map(ring_length).sum::<f64>())
            .sum(),
        None => 0.0,
    }
}

/// Shape index `P / (2π·sqrt(A/π))`; `None` when the area is not positive.
pub(crate) fn shape_index(perimeter: f64, area: f64) -> Option<f64> {
    if !(area > 0.0) || !perimeter.is_finite() {
        return None;
    }
    let pi = std::f64::consts::PI;
    Some(perimeter / (2.0 * pi * (area / pi).sqrt()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Result;
    use geo_types::{LineString, Point, polygon};

    /// Build a GeoPackage blob from any `geo-types` geometry.
    pub(crate) fn gpkg_blob<G: Into<Geometry<f64>>>(geometry: G, srs_id: u32) -> Vec<u8> {
        encode_geometry(&geometry.into(), srs_id).expect("encode geometry")
    }

    pub(crate) fn square(x: f64, y: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
            (x: x, y: y),
        ]
    }

    #[test]
    fn gpkg_geometry_roundtrip() -> Result<()> {
        let point = Point::new(3.0, -1.0);
        let mut wkb = Vec::new();
        wkb::writer::write_geometry(&mut wkb, &point, &Default::default())?;
        let gpkg_blob = wkb_to_gpkg_geometry(&wkb, 25833);

        let recovered = gpkg_geometry_to_wkb(&gpkg_blob)?;
        assert_eq!(recovered.buf(), wkb.as_slice());
        assert_eq!(gpkg_srs_id(&gpkg_blob)?, 25833);
        Ok(())
    }

    #[test]
    fn gpkg_geometry_rejects_invalid_flags() {
        let mut blob = vec![0x47, 0x50, 0x00, 0x0A, 0, 0, 0, 0];
        blob.extend_from_slice(&[0; 16]);
        let result = gpkg_geometry_to_wkb(&blob);
        assert!(matches!(
            result,
            Err(OverlayError::InvalidGpkgGeometryFlags(_))
        ));
    }

    #[test]
    fn gpkg_geometry_rejects_raw_wkb_and_short_blobs() {
        let mut wkb = Vec::new();
        wkb::writer::write_geometry(&mut wkb, &Point::new(1.0, 1.0), &Default::default())
            .expect("write wkb");
        assert!(matches!(
            gpkg_geometry_to_wkb(&wkb),
            Err(OverlayError::InvalidGpkgGeometryMagic)
        ));
        assert!(matches!(
            gpkg_geometry_to_wkb(b"GP"),
            Err(OverlayError::InvalidGpkgGeometryLength { .. })
        ));
    }

    #[test]
    fn perimeter_includes_holes() -> Result<()> {
        let outer = square(0.0, 0.0, 10.0);
        let hole = LineString::from(vec![(2.0, 2.0), (4.0, 2.0), (4.0, 4.0), (2.0, 4.0), (2.0, 2.0)]);
        let with_hole = Polygon::new(outer.exterior().clone(), vec![hole]);
        let (decoded, _) = decode_geometry(&gpkg_blob(with_hole, 0))?;

        assert!((perimeter(&decoded) - 48.0).abs() < 1e-9);
        assert!((area(&decoded) - 96.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn shape_index_of_square_and_degenerate_area() {
        let si = shape_index(4.0, 1.0).expect("positive area");
        assert!((si - 2.0 / std::f64::consts::PI.sqrt()).abs() < 1e-12);
        assert!(si >= 1.0);
        assert_eq!(shape_index(4.0, 0.0), None);
    }
}
