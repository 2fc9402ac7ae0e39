//! Typed entity schemas: field mapping tables from raw property names to
//! entity fields, plus the reverse encoding back to raw features.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use super::coerce::{coerce_date, coerce_exact_integer, coerce_integer, coerce_string, fold_categorical};
use crate::config::NormalizeConfig;
use crate::domain::raw::{parse_point, parse_polygon};
use crate::domain::{Attributes, HazardArea, Individual, RawFeature, Scored, Severity};
use crate::pipeline::processing::geometry::{GeometryValidator, TopologyIssue, ValidationOutcome};

/// One typed field and the raw property names it may be read from, in priority order.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub field: &'static str,
    pub sources: &'static [&'static str],
}

const QUALITY_SOURCES: &[&str] = &["data_quality_score", "quality_score"];

pub const HAZARD_AREA_FIELDS: &[FieldMapping] = &[
    FieldMapping { field: "id", sources: &["area_id", "hazard_area_id", "id"] },
    FieldMapping { field: "name", sources: &["area_name", "name"] },
    FieldMapping { field: "occurrence_date", sources: &["flood_date", "occurrence_date", "date"] },
    FieldMapping { field: "severity", sources: &["severity", "risk_level"] },
    FieldMapping { field: "affected_population", sources: &["affected_population", "population"] },
    FieldMapping { field: "quality_score", sources: QUALITY_SOURCES },
];

pub const INDIVIDUAL_FIELDS: &[FieldMapping] = &[
    FieldMapping { field: "id", sources: &["citizen_id", "individual_id", "id"] },
    FieldMapping { field: "name", sources: &["name", "full_name"] },
    FieldMapping { field: "address", sources: &["address"] },
    FieldMapping { field: "contact", sources: &["phone", "contact"] },
    FieldMapping { field: "registration_date", sources: &["registration_date", "registered_at"] },
    FieldMapping { field: "quality_score", sources: QUALITY_SOURCES },
];

/// Why a raw feature did not make it into the validated layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Missing required column or unparsable geometry.
    Input(String),
    InvalidGeometry(TopologyIssue),
}

/// A typed record plus the bookkeeping the normalizer scores it with.
#[derive(Debug, Clone)]
pub struct Mapped<T> {
    pub record: T,
    pub substitutions: u32,
    pub repaired: bool,
    /// Score carried by an already-assessed record.
    pub prior_score: Option<f64>,
}

/// Shared state available while mapping a single feature.
pub struct MappingContext<'a> {
    pub config: &'a NormalizeConfig,
    pub validator: &'a GeometryValidator,
}

/// An entity that can be read from, and written back to, a raw feature.
pub trait EntitySchema: Scored + Sized {
    const ENTITY: &'static str;
    const FIELDS: &'static [FieldMapping];

    fn id(&self) -> i64;

    fn set_quality_score(&mut self, score: f64);

    fn from_feature(feature: &RawFeature, ctx: &MappingContext<'_>) -> Result<Mapped<Self>, Rejection>;

    /// Canonical raw encoding; feeding it back through the normalizer is a no-op.
    fn to_feature(&self) -> RawFeature;
}

fn field_sources(fields: &[FieldMapping], field: &str) -> &'static [&'static str] {
    fields
        .iter()
        .find(|m| m.field == field)
        .map(|m| m.sources)
        .unwrap_or(&[])
}

fn lookup<'f>(feature: &'f RawFeature, fields: &[FieldMapping], field: &str) -> Option<&'f Value> {
    feature.property(field_sources(fields, field))
}

/// Counts substitutions while coercing individual fields.
#[derive(Default)]
struct Tally {
    substitutions: u32,
}

impl Tally {
    fn text_or_sentinel(&mut self, value: Option<&Value>, sentinel: &str) -> String {
        match value.and_then(coerce_string) {
            Some(s) => s,
            None => {
                self.substitutions += 1;
                sentinel.to_string()
            }
        }
    }

    fn date(&mut self, value: Option<&Value>) -> Option<NaiveDate> {
        let value = value?;
        let date = coerce_date(value);
        if date.is_none() {
            self.substitutions += 1;
        }
        date
    }

    fn integer(&mut self, value: Option<&Value>) -> Option<i64> {
        let value = value?;
        let n = coerce_integer(value);
        if n.is_none() {
            self.substitutions += 1;
        }
        n
    }

    fn severity(&mut self, value: Option<&Value>, max_len: usize) -> Option<Severity> {
        let raw = value.and_then(coerce_string)?;
        match fold_categorical(&raw, max_len).parse::<Severity>() {
            Ok(severity) => Some(severity),
            Err(_) => {
                self.substitutions += 1;
                None
            }
        }
    }
}

fn required_id(feature: &RawFeature, fields: &[FieldMapping]) -> Result<i64, Rejection> {
    let value = lookup(feature, fields, "id")
        .or(feature.id.as_ref())
        .ok_or_else(|| Rejection::Input("missing identifier".to_string()))?;
    coerce_exact_integer(value).ok_or_else(|| Rejection::Input(format!("identifier {} is not an integer", value)))
}

fn required_geometry(feature: &RawFeature) -> Result<&Value, Rejection> {
    feature
        .geometry
        .as_ref()
        .filter(|g| !g.is_null())
        .ok_or_else(|| Rejection::Input("missing geometry".to_string()))
}

fn prior_score(feature: &RawFeature) -> Option<f64> {
    feature
        .property(QUALITY_SOURCES)
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite())
        .map(|s| s.clamp(0.0, 1.0))
}

/// Unmapped properties, trimmed, with configured categorical attributes folded.
fn passthrough(feature: &RawFeature, fields: &[FieldMapping], config: &NormalizeConfig) -> Attributes {
    let mapped: HashSet<&str> = fields.iter().flat_map(|m| m.sources.iter().copied()).collect();
    feature
        .properties
        .iter()
        .filter(|(key, _)| !mapped.contains(key.as_str()))
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) if config.extra_categorical_fields.iter().any(|f| f == key) => {
                    Value::String(fold_categorical(s.trim(), config.categorical_max_len))
                }
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn encode_attributes(properties: &mut Map<String, Value>, attributes: &Attributes) {
    for (key, value) in attributes {
        properties.insert(key.clone(), value.clone());
    }
}

fn encode_date(date: Option<NaiveDate>) -> Value {
    date.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

impl EntitySchema for HazardArea {
    const ENTITY: &'static str = "hazard_area";
    const FIELDS: &'static [FieldMapping] = HAZARD_AREA_FIELDS;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_quality_score(&mut self, score: f64) {
        self.quality_score = score;
    }

    fn from_feature(feature: &RawFeature, ctx: &MappingContext<'_>) -> Result<Mapped<Self>, Rejection> {
        let fields = Self::FIELDS;
        let id = required_id(feature, fields)?;
        let parsed = parse_polygon(required_geometry(feature)?).map_err(Rejection::Input)?;

        let mut tally = Tally::default();
        if parsed.closed_open_rings {
            tally.substitutions += 1;
        }
        let (geometry, repaired) = match ctx.validator.validate_polygon(parsed.polygon) {
            ValidationOutcome::Valid(polygon) => (polygon, false),
            ValidationOutcome::Repaired(polygon) => {
                tally.substitutions += 1;
                (polygon, true)
            }
            ValidationOutcome::Invalid(issue) => return Err(Rejection::InvalidGeometry(issue)),
        };

        let record = HazardArea {
            id,
            name: tally.text_or_sentinel(lookup(feature, fields, "name"), &ctx.config.sentinel),
            occurrence_date: tally.date(lookup(feature, fields, "occurrence_date")),
            severity: tally.severity(lookup(feature, fields, "severity"), ctx.config.categorical_max_len),
            affected_population: tally.integer(lookup(feature, fields, "affected_population")),
            geometry,
            quality_score: 1.0,
            attributes: passthrough(feature, fields, ctx.config),
        };

        Ok(Mapped {
            record,
            substitutions: tally.substitutions,
            repaired,
            prior_score: prior_score(feature),
        })
    }

    fn to_feature(&self) -> RawFeature {
        let mut properties = Map::new();
        properties.insert("area_id".to_string(), json!(self.id));
        properties.insert("area_name".to_string(), json!(self.name));
        properties.insert("flood_date".to_string(), encode_date(self.occurrence_date));
        properties.insert(
            "severity".to_string(),
            self.severity.map(|s| json!(s.as_str())).unwrap_or(Value::Null),
        );
        properties.insert("affected_population".to_string(), json!(self.affected_population));
        properties.insert("data_quality_score".to_string(), json!(self.quality_score));
        encode_attributes(&mut properties, &self.attributes);
        RawFeature::with_polygon(properties, &self.geometry)
    }
}

impl EntitySchema for Individual {
    const ENTITY: &'static str = "individual";
    const FIELDS: &'static [FieldMapping] = INDIVIDUAL_FIELDS;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_quality_score(&mut self, score: f64) {
        self.quality_score = score;
    }

    fn from_feature(feature: &RawFeature, ctx: &MappingContext<'_>) -> Result<Mapped<Self>, Rejection> {
        let fields = Self::FIELDS;
        let id = required_id(feature, fields)?;
        let point = parse_point(required_geometry(feature)?).map_err(Rejection::Input)?;
        let location = match ctx.validator.validate_point(point) {
            ValidationOutcome::Valid(point) | ValidationOutcome::Repaired(point) => point,
            ValidationOutcome::Invalid(issue) => return Err(Rejection::InvalidGeometry(issue)),
        };

        let mut tally = Tally::default();
        let sentinel = &ctx.config.sentinel;
        let record = Individual {
            id,
            name: tally.text_or_sentinel(lookup(feature, fields, "name"), sentinel),
            address: tally.text_or_sentinel(lookup(feature, fields, "address"), sentinel),
            contact: tally.text_or_sentinel(lookup(feature, fields, "contact"), sentinel),
            registration_date: tally.date(lookup(feature, fields, "registration_date")),
            location,
            affected: None,
            hazard_area_id: None,
            quality_score: 1.0,
            attributes: passthrough(feature, fields, ctx.config),
        };

        Ok(Mapped {
            record,
            substitutions: tally.substitutions,
            repaired: false,
            prior_score: prior_score(feature),
        })
    }

    /// Classification fields are not part of the validated schema and are not encoded.
    fn to_feature(&self) -> RawFeature {
        let mut properties = Map::new();
        properties.insert("citizen_id".to_string(), json!(self.id));
        properties.insert("name".to_string(), json!(self.name));
        properties.insert("address".to_string(), json!(self.address));
        properties.insert("phone".to_string(), json!(self.contact));
        properties.insert("registration_date".to_string(), encode_date(self.registration_date));
        properties.insert("data_quality_score".to_string(), json!(self.quality_score));
        encode_attributes(&mut properties, &self.attributes);
        RawFeature::with_point(properties, &self.location)
    }
}
