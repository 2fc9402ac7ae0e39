//! Domain data shapes shared across layers

pub mod coords;
pub mod raw;

use chrono::{DateTime, NaiveDate, Utc};
use geo::{Point, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use raw::{FeatureCollection, RawFeature};

/// Schema version stamped on every persisted record set.
pub const SCHEMA_VERSION: u32 = 1;

/// Sequence of pipeline layers (Bronze/Silver/Gold in medallion terms, plus the partitioned views).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Raw,
    Validated,
    Classified,
    Partitioned,
}

impl Layer {
    /// The layer that legally follows this one, if any.
    pub fn next(self) -> Option<Layer> {
        match self {
            Layer::Raw => Some(Layer::Validated),
            Layer::Validated => Some(Layer::Classified),
            Layer::Classified => Some(Layer::Partitioned),
            Layer::Partitioned => None,
        }
    }

    /// Storage namespace the layer's artifacts live under.
    pub fn namespace(self) -> Namespace {
        match self {
            Layer::Raw => Namespace::Raw,
            Layer::Validated => Namespace::Validated,
            Layer::Classified | Layer::Partitioned => Namespace::Classified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Raw => "raw",
            Layer::Validated => "validated",
            Layer::Classified => "classified",
            Layer::Partitioned => "partitioned",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical storage prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Raw,
    Validated,
    Classified,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Raw, Namespace::Validated, Namespace::Classified];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Raw => "raw",
            Namespace::Validated => "validated",
            Namespace::Classified => "classified",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal flood severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::VeryHigh => "very_high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect();
        match folded.as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "veryhigh" => Ok(Severity::VeryHigh),
            _ => Err(format!("unknown severity '{}'", s)),
        }
    }
}

/// Extra attributes carried through the layers without interpretation.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// A flood-affected zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardArea {
    pub id: i64,
    pub name: String,
    pub occurrence_date: Option<NaiveDate>,
    pub severity: Option<Severity>,
    pub affected_population: Option<i64>,
    /// WGS84, longitude-then-latitude.
    #[serde(with = "coords::polygon_lonlat")]
    pub geometry: Polygon<f64>,
    pub quality_score: f64,
    #[serde(default)]
    pub attributes: Attributes,
}

/// A registered person with a point location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub contact: String,
    pub registration_date: Option<NaiveDate>,
    /// WGS84, longitude-then-latitude.
    #[serde(with = "coords::point_lonlat")]
    pub location: Point<f64>,
    /// `None` until the classifier has run.
    pub affected: Option<bool>,
    pub hazard_area_id: Option<i64>,
    pub quality_score: f64,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Individual {
    /// Annotate with the owning hazard area (or none).
    pub fn classified(mut self, hazard_area_id: Option<i64>) -> Self {
        self.affected = Some(hazard_area_id.is_some());
        self.hazard_area_id = hazard_area_id;
        self
    }

    /// membership=true <=> exactly one reference; unclassified records carry no reference.
    pub fn membership_is_consistent(&self) -> bool {
        match self.affected {
            Some(true) => self.hazard_area_id.is_some(),
            Some(false) | None => self.hazard_area_id.is_none(),
        }
    }
}

/// Anything that carries a per-record data-quality score.
pub trait Scored {
    fn quality_score(&self) -> f64;
}

impl Scored for HazardArea {
    fn quality_score(&self) -> f64 {
        self.quality_score
    }
}

impl Scored for Individual {
    fn quality_score(&self) -> f64 {
        self.quality_score
    }
}

/// Immutable, versioned output of a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecordSet<T> {
    layer: Layer,
    run_id: Uuid,
    schema_version: u32,
    processed_at: DateTime<Utc>,
    quality_score: f64,
    records: Vec<T>,
}

impl<T: Scored> LayerRecordSet<T> {
    /// Build a set whose aggregate score is the mean of its record scores.
    pub fn new(layer: Layer, run_id: Uuid, records: Vec<T>) -> Self {
        let quality_score = if records.is_empty() {
            1.0
        } else {
            records.iter().map(Scored::quality_score).sum::<f64>() / records.len() as f64
        };
        Self {
            layer,
            run_id,
            schema_version: SCHEMA_VERSION,
            processed_at: Utc::now(),
            quality_score,
            records,
        }
    }
}

impl<T> LayerRecordSet<T> {
    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        self.processed_at
    }

    pub fn quality_score(&self) -> f64 {
        self.quality_score
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

/// Outcome of matching one individual against the hazard polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub individual_id: i64,
    pub hazard_area_id: Option<i64>,
    /// Polygons whose bounding box contained the point.
    pub candidates: usize,
    /// Polygons that actually contained the point.
    pub matches: usize,
}
