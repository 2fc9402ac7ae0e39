//! Longitude/latitude coordinate encoding shared by raw input and layer artifacts.
//!
//! Rings are `[[lon, lat], ...]` arrays, the same nesting GeoJSON uses for
//! `Polygon` and `Point` coordinates.

use geo::{Coord, LineString, Point, Polygon};

pub type Position = [f64; 2];
pub type Ring = Vec<Position>;

pub fn ring_from_line_string(ls: &LineString<f64>) -> Ring {
    ls.coords().map(|c| [c.x, c.y]).collect()
}

pub fn line_string_from_ring(ring: &[Position]) -> LineString<f64> {
    LineString::new(ring.iter().map(|p| Coord { x: p[0], y: p[1] }).collect())
}

/// Exterior first, then holes.
pub fn polygon_to_rings(polygon: &Polygon<f64>) -> Vec<Ring> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors().iter())
        .map(ring_from_line_string)
        .collect()
}

/// `None` when there is no exterior ring. Rings are closed by `Polygon::new`.
pub fn polygon_from_rings(rings: &[Ring]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    Some(Polygon::new(
        line_string_from_ring(exterior),
        interiors.iter().map(|r| line_string_from_ring(r)).collect(),
    ))
}

pub fn is_closed(ring: &[Position]) -> bool {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) => ring.len() > 1 && first == last,
        _ => false,
    }
}

pub mod polygon_lonlat {
    use super::*;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(polygon: &Polygon<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        polygon_to_rings(polygon).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Polygon<f64>, D::Error> {
        let rings = Vec::<Ring>::deserialize(deserializer)?;
        polygon_from_rings(&rings).ok_or_else(|| de::Error::custom("polygon has no exterior ring"))
    }
}

pub mod point_lonlat {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(point: &Point<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        [point.x(), point.y()].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Point<f64>, D::Error> {
        let [lon, lat] = Position::deserialize(deserializer)?;
        Ok(Point::new(lon, lat))
    }
}
