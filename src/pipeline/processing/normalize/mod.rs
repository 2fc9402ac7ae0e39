//! Record Normalizer: raw features to typed, validated, deduplicated records.

pub mod coerce;
pub mod schema;

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::NormalizeConfig;
use crate::domain::{Layer, LayerRecordSet, RawFeature};
use crate::pipeline::processing::geometry::GeometryValidator;

pub use schema::{EntitySchema, FieldMapping, Mapped, MappingContext, Rejection};

/// Per-run accounting; nothing is dropped without a count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizationReport {
    pub input: usize,
    /// Records that passed field mapping (had an identifier and a parsable geometry).
    pub mapped: usize,
    pub input_errors: usize,
    pub invalid_geometry: usize,
    pub repaired_geometry: usize,
    pub duplicates: usize,
    pub output: usize,
    pub substitutions: usize,
}

/// A validated record set together with the report that produced it.
#[derive(Debug, Clone)]
pub struct Normalized<T> {
    pub records: LayerRecordSet<T>,
    pub report: NormalizationReport,
}

pub struct RecordNormalizer {
    config: NormalizeConfig,
    validator: GeometryValidator,
}

impl RecordNormalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        Self {
            config,
            validator: GeometryValidator::new(),
        }
    }

    /// Score after `substitutions` imputations, never above a prior assessment.
    pub fn score(&self, substitutions: u32, prior: Option<f64>) -> f64 {
        let computed = (1.0 - self.config.substitution_penalty * f64::from(substitutions)).max(0.0);
        prior.map_or(computed, |p| computed.min(p))
    }

    /// Map, validate, deduplicate and score a raw record set into the validated layer.
    pub fn normalize<T: EntitySchema>(&self, input: &LayerRecordSet<RawFeature>) -> Normalized<T> {
        let ctx = MappingContext {
            config: &self.config,
            validator: &self.validator,
        };
        let mut report = NormalizationReport {
            input: input.len(),
            ..NormalizationReport::default()
        };
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(input.len());

        for (position, feature) in input.records().iter().enumerate() {
            let mapped = match T::from_feature(feature, &ctx) {
                Ok(mapped) => mapped,
                Err(Rejection::Input(reason)) => {
                    report.input_errors += 1;
                    debug!(entity = T::ENTITY, position, %reason, "dropping raw record");
                    continue;
                }
                Err(Rejection::InvalidGeometry(issue)) => {
                    report.mapped += 1;
                    report.invalid_geometry += 1;
                    debug!(entity = T::ENTITY, position, %issue, "dropping record with invalid geometry");
                    continue;
                }
            };
            report.mapped += 1;

            let Mapped {
                mut record,
                substitutions,
                repaired,
                prior_score,
            } = mapped;

            if !seen.insert(record.id()) {
                report.duplicates += 1;
                debug!(entity = T::ENTITY, id = record.id(), position, "discarding duplicate");
                continue;
            }
            if repaired {
                report.repaired_geometry += 1;
            }
            report.substitutions += substitutions as usize;
            record.set_quality_score(self.score(substitutions, prior_score));
            records.push(record);
        }

        report.output = records.len();
        info!(
            entity = T::ENTITY,
            input = report.input,
            mapped = report.mapped,
            input_errors = report.input_errors,
            invalid_geometry = report.invalid_geometry,
            repaired = report.repaired_geometry,
            duplicates = report.duplicates,
            output = report.output,
            substitutions = report.substitutions,
            "🧹 Normalized {} records",
            T::ENTITY
        );

        Normalized {
            records: LayerRecordSet::new(Layer::Validated, input.run_id(), records),
            report,
        }
    }
}
