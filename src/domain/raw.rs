//! Raw layer input: loosely typed GeoJSON features.

use geo::{Point, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::coords::{self, Position, Ring};
use super::Scored;

/// CRS names accepted as WGS84 lon/lat.
const WGS84_NAMES: &[&str] = &[
    "EPSG:4326",
    "urn:ogc:def:crs:EPSG::4326",
    "urn:ogc:def:crs:OGC:1.3:CRS84",
    "urn:ogc:def:crs:OGC::CRS84",
    "CRS84",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    /// Legacy GeoJSON `crs` member; absent means RFC 7946 WGS84.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<Value>,
    pub features: Vec<RawFeature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<RawFeature>) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            crs: None,
            features,
        }
    }

    /// Name of the declared CRS, when one is declared.
    pub fn crs_name(&self) -> Option<&str> {
        self.crs
            .as_ref()
            .and_then(|crs| crs.get("properties"))
            .and_then(|props| props.get("name"))
            .and_then(Value::as_str)
    }

    /// Ok when no CRS is declared or the declared one is WGS84 lon/lat.
    pub fn ensure_wgs84(&self) -> Result<(), String> {
        if self.kind != "FeatureCollection" {
            return Err(format!("expected a FeatureCollection, got '{}'", self.kind));
        }
        match (&self.crs, self.crs_name()) {
            (None, _) => Ok(()),
            (Some(_), Some(name)) if WGS84_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name)) => Ok(()),
            (Some(_), Some(name)) => Err(format!("unsupported CRS '{}', expected EPSG:4326", name)),
            (Some(_), None) => Err("crs member without a name".to_string()),
        }
    }
}

/// One raw record: arbitrary properties plus an unparsed geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFeature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
}

fn feature_type() -> String {
    "Feature".to_string()
}

impl Scored for RawFeature {
    /// Raw records have not been assessed yet.
    fn quality_score(&self) -> f64 {
        1.0
    }
}

impl RawFeature {
    pub fn new(properties: Map<String, Value>, geometry: Option<Value>) -> Self {
        Self {
            kind: feature_type(),
            id: None,
            properties,
            geometry,
        }
    }

    pub fn with_polygon(properties: Map<String, Value>, polygon: &Polygon<f64>) -> Self {
        Self::new(
            properties,
            Some(json!({ "type": "Polygon", "coordinates": coords::polygon_to_rings(polygon) })),
        )
    }

    pub fn with_point(properties: Map<String, Value>, point: &Point<f64>) -> Self {
        Self::new(
            properties,
            Some(json!({ "type": "Point", "coordinates": [point.x(), point.y()] })),
        )
    }

    /// First non-null property among `keys`.
    pub fn property(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|k| self.properties.get(*k))
            .find(|v| !v.is_null())
    }
}

/// A polygon parsed from GeoJSON, with a note on whether rings had to be closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPolygon {
    pub polygon: Polygon<f64>,
    pub closed_open_rings: bool,
}

fn geometry_type<'a>(geometry: &'a Value) -> Result<&'a str, String> {
    geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "geometry has no type".to_string())
}

fn position(value: &Value) -> Result<Position, String> {
    let arr = value
        .as_array()
        .ok_or_else(|| "position is not an array".to_string())?;
    if arr.len() < 2 {
        return Err(format!("position has {} ordinates, expected 2", arr.len()));
    }
    let lon = arr[0].as_f64().ok_or_else(|| "longitude is not a number".to_string())?;
    let lat = arr[1].as_f64().ok_or_else(|| "latitude is not a number".to_string())?;
    Ok([lon, lat])
}

fn ring(value: &Value) -> Result<Ring, String> {
    value
        .as_array()
        .ok_or_else(|| "ring is not an array".to_string())?
        .iter()
        .map(position)
        .collect()
}

/// Parse a GeoJSON `Polygon` (or a single-member `MultiPolygon`).
pub fn parse_polygon(geometry: &Value) -> Result<ParsedPolygon, String> {
    let coordinates = geometry
        .get("coordinates")
        .ok_or_else(|| "geometry has no coordinates".to_string())?;
    let rings_value = match geometry_type(geometry)? {
        "Polygon" => coordinates,
        "MultiPolygon" => {
            let members = coordinates
                .as_array()
                .ok_or_else(|| "MultiPolygon coordinates are not an array".to_string())?;
            match members.as_slice() {
                [single] => single,
                _ => {
                    return Err(format!(
                        "MultiPolygon with {} members is not a single hazard polygon",
                        members.len()
                    ))
                }
            }
        }
        other => return Err(format!("expected Polygon geometry, got {}", other)),
    };

    let rings: Vec<Ring> = rings_value
        .as_array()
        .ok_or_else(|| "polygon coordinates are not an array".to_string())?
        .iter()
        .map(ring)
        .collect::<Result<_, _>>()?;

    let closed_open_rings = rings.iter().any(|r| !r.is_empty() && !coords::is_closed(r));
    let polygon = coords::polygon_from_rings(&rings).ok_or_else(|| "polygon has no rings".to_string())?;
    Ok(ParsedPolygon {
        polygon,
        closed_open_rings,
    })
}

/// Parse a GeoJSON `Point`.
pub fn parse_point(geometry: &Value) -> Result<Point<f64>, String> {
    match geometry_type(geometry)? {
        "Point" => {
            let coordinates = geometry
                .get("coordinates")
                .ok_or_else(|| "geometry has no coordinates".to_string())?;
            let [lon, lat] = position(coordinates)?;
            Ok(Point::new(lon, lat))
        }
        other => Err(format!("expected Point geometry, got {}", other)),
    }
}
