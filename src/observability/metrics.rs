//! Per-stage metrics. Every name is `esteira_<phase>_<name>` with a `_total`
//! suffix on counters.

use crate::domain::Layer;

macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("esteira_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("esteira_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("esteira_", $phase, "_", $name)
    };
}

/// Register descriptions so the exposition carries HELP lines.
pub fn describe_all() {
    ::metrics::describe_counter!(phase_metric!(counter, "stage", "records_in"), "Records loaded by a stage");
    ::metrics::describe_counter!(phase_metric!(counter, "stage", "records_out"), "Records persisted by a stage");
    ::metrics::describe_counter!(
        phase_metric!(counter, "stage", "records_dropped"),
        "Records dropped by a stage, by reason"
    );
    ::metrics::describe_histogram!(
        phase_metric!(histogram, "stage", "duration_seconds"),
        "Wall time of one layer transition"
    );
    ::metrics::describe_gauge!(
        phase_metric!(gauge, "stage", "quality_score"),
        "Aggregate quality score of the last published record set"
    );
    ::metrics::describe_counter!(
        phase_metric!(counter, "classify", "individuals"),
        "Classified individuals by outcome"
    );
    ::metrics::describe_counter!(phase_metric!(counter, "storage", "mirror_failures"), "Failed mirror uploads");
    ::metrics::describe_counter!(phase_metric!(counter, "database", "load_failures"), "Failed database loads");
    ::metrics::describe_counter!(phase_metric!(counter, "run", "completed"), "Pipeline runs by status");
}

pub struct StageMetrics;

impl StageMetrics {
    pub fn records_in(stage: Layer, entity: &'static str, count: usize) {
        ::metrics::counter!(phase_metric!(counter, "stage", "records_in"), "stage" => stage.as_str(), "entity" => entity)
            .increment(count as u64);
    }

    pub fn records_out(stage: Layer, entity: &'static str, count: usize) {
        ::metrics::counter!(phase_metric!(counter, "stage", "records_out"), "stage" => stage.as_str(), "entity" => entity)
            .increment(count as u64);
    }

    pub fn records_dropped(stage: Layer, entity: &'static str, reason: &'static str, count: usize) {
        if count == 0 {
            return;
        }
        ::metrics::counter!(
            phase_metric!(counter, "stage", "records_dropped"),
            "stage" => stage.as_str(),
            "entity" => entity,
            "reason" => reason
        )
        .increment(count as u64);
    }

    pub fn duration(stage: Layer, seconds: f64) {
        ::metrics::histogram!(phase_metric!(histogram, "stage", "duration_seconds"), "stage" => stage.as_str())
            .record(seconds);
    }

    pub fn quality_score(stage: Layer, entity: &'static str, score: f64) {
        ::metrics::gauge!(phase_metric!(gauge, "stage", "quality_score"), "stage" => stage.as_str(), "entity" => entity)
            .set(score);
    }
}

pub struct ClassifyMetrics;

impl ClassifyMetrics {
    pub fn outcome(affected: usize, unaffected: usize, ambiguous: usize) {
        ::metrics::counter!(phase_metric!(counter, "classify", "individuals"), "outcome" => "affected")
            .increment(affected as u64);
        ::metrics::counter!(phase_metric!(counter, "classify", "individuals"), "outcome" => "unaffected")
            .increment(unaffected as u64);
        ::metrics::counter!(phase_metric!(counter, "classify", "individuals"), "outcome" => "ambiguous")
            .increment(ambiguous as u64);
    }
}

pub struct StorageMetrics;

impl StorageMetrics {
    pub fn mirror_failed() {
        ::metrics::counter!(phase_metric!(counter, "storage", "mirror_failures")).increment(1);
    }
}

pub struct DatabaseMetrics;

impl DatabaseMetrics {
    pub fn load_failed() {
        ::metrics::counter!(phase_metric!(counter, "database", "load_failures")).increment(1);
    }
}

pub struct RunMetrics;

impl RunMetrics {
    pub fn completed(status: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "run", "completed"), "status" => status).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert_eq!(phase_metric!(counter, "stage", "records_in"), "esteira_stage_records_in_total");
        assert_eq!(phase_metric!(histogram, "stage", "duration_seconds"), "esteira_stage_duration_seconds");
    }

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        StageMetrics::records_in(Layer::Validated, "individual", 3);
        StageMetrics::records_dropped(Layer::Validated, "individual", "duplicate", 0);
        ClassifyMetrics::outcome(1, 2, 0);
        RunMetrics::completed("success");
    }
}
