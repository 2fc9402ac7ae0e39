//! Layer Orchestrator: drives RAW -> VALIDATED -> CLASSIFIED -> PARTITIONED.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::ports::{CountsSummary, DatabasePort, StoragePort};
use crate::config::Config;
use crate::domain::{HazardArea, Individual, Layer, LayerRecordSet};
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::observability::metrics::{ClassifyMetrics, DatabaseMetrics, RunMetrics, StageMetrics};
use crate::pipeline::artifact::{read_raw_features, LayerBatch, LayerReader, PublishReport};
use crate::pipeline::cancel::CancellationFlag;
use crate::pipeline::processing::geometry::check_polygon;
use crate::pipeline::processing::normalize::{EntitySchema, NormalizationReport, Normalized, RecordNormalizer};
use crate::pipeline::processing::{ClassificationReport, OutputPartitioner, SpatialClassifier};
use crate::pipeline::run_lock::RunLock;

pub const HAZARD_AREAS_ARTIFACT: &str = "hazard_areas.json";
pub const INDIVIDUALS_ARTIFACT: &str = "individuals.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidateSummary {
    pub hazard_areas: NormalizationReport,
    pub individuals: NormalizationReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub affected: usize,
    pub unaffected: usize,
    pub all: usize,
}

/// What happened to the database load of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    /// Turned off in configuration.
    #[default]
    Disabled,
    /// Enabled but no connection could be opened.
    Unavailable,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub validated: ValidateSummary,
    pub classified: ClassificationReport,
    pub partitioned: PartitionSummary,
    pub published: Vec<String>,
    pub mirror_failures: usize,
    pub database: Option<CountsSummary>,
    pub database_status: DatabaseStatus,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn affected_percent(&self) -> f64 {
        if self.partitioned.all == 0 {
            0.0
        } else {
            self.partitioned.affected as f64 * 100.0 / self.partitioned.all as f64
        }
    }
}

pub struct Orchestrator {
    config: Config,
    storage: Arc<dyn StoragePort>,
    database: Option<Arc<dyn DatabasePort>>,
    cancel: CancellationFlag,
    normalizer: RecordNormalizer,
    classifier: SpatialClassifier,
    partitioner: OutputPartitioner,
    lock: Option<RunLock>,
    run_id: Uuid,
    state: Layer,
    summary: RunSummary,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        storage: Arc<dyn StoragePort>,
        database: Option<Arc<dyn DatabasePort>>,
        cancel: CancellationFlag,
    ) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            config: config.clone(),
            storage,
            database,
            cancel,
            normalizer: RecordNormalizer::new(config.normalize.clone()),
            classifier: SpatialClassifier::new(),
            partitioner: OutputPartitioner::new(),
            lock: None,
            run_id,
            state: Layer::Raw,
            summary: RunSummary {
                run_id,
                ..RunSummary::default()
            },
        }
    }

    /// Hold `lock` for the lifetime of the orchestrator, refreshing it before every step.
    pub fn with_lock(mut self, lock: RunLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn refresh_lock(&self) -> Result<()> {
        match &self.lock {
            Some(lock) => lock.refresh(),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> Layer {
        self.state
    }

    /// Guard a transition: strictly linear and not cancelled.
    fn begin(&self, to: Layer) -> Result<Instant> {
        if self.state.next() != Some(to) {
            return Err(PipelineError::IllegalTransition { from: self.state, to });
        }
        self.cancel.check(to)?;
        self.refresh_lock()?;
        info!("▶️ {} -> {} (run {})", self.state, to, self.run_id);
        Ok(Instant::now())
    }

    fn finish(&mut self, to: Layer, started: Instant, published: PublishReport) {
        let elapsed = started.elapsed().as_secs_f64();
        StageMetrics::duration(to, elapsed);
        self.summary.mirror_failures += published.mirror_failures;
        self.summary.published.extend(published.artifacts);
        self.state = to;
        info!("✅ {} layer complete in {:.2}s", to, elapsed);
    }

    async fn publish(&self, batch: LayerBatch) -> Result<PublishReport> {
        let report = batch.publish(self.storage.as_ref(), &self.cancel).await?;
        if report.mirror_failures > 0 {
            warn!(
                "⚠️ {} artifacts were stored locally but not mirrored",
                report.mirror_failures
            );
        }
        Ok(report)
    }

    fn record_normalization(entity: &'static str, report: &NormalizationReport, score: f64) {
        StageMetrics::records_in(Layer::Validated, entity, report.input);
        StageMetrics::records_dropped(Layer::Validated, entity, "input_error", report.input_errors);
        StageMetrics::records_dropped(Layer::Validated, entity, "invalid_geometry", report.invalid_geometry);
        StageMetrics::records_dropped(Layer::Validated, entity, "duplicate", report.duplicates);
        StageMetrics::records_out(Layer::Validated, entity, report.output);
        StageMetrics::quality_score(Layer::Validated, entity, score);
    }

    /// RAW -> VALIDATED
    pub async fn validate(&mut self) -> Result<ValidateSummary> {
        let started = self.begin(Layer::Validated)?;
        let storage = self.storage.as_ref();

        let raw_areas = read_raw_features(storage, &self.config.pipeline.hazard_areas_file, self.run_id).await?;
        let raw_individuals = read_raw_features(storage, &self.config.pipeline.individuals_file, self.run_id).await?;
        info!(
            "📥 Loaded {} raw hazard areas and {} raw individuals",
            raw_areas.len(),
            raw_individuals.len()
        );

        let areas: Normalized<HazardArea> = self.normalizer.normalize(&raw_areas);
        let individuals: Normalized<Individual> = self.normalizer.normalize(&raw_individuals);
        Self::record_normalization(HazardArea::ENTITY, &areas.report, areas.records.quality_score());
        Self::record_normalization(Individual::ENTITY, &individuals.report, individuals.records.quality_score());

        let mut batch = LayerBatch::new(Layer::Validated, self.run_id);
        batch.add_record_set(HAZARD_AREAS_ARTIFACT, HazardArea::ENTITY, &areas.records)?;
        batch.add_record_set(INDIVIDUALS_ARTIFACT, Individual::ENTITY, &individuals.records)?;
        let published = self.publish(batch).await?;

        let summary = ValidateSummary {
            hazard_areas: areas.report,
            individuals: individuals.report,
        };
        self.summary.validated = summary;
        self.finish(Layer::Validated, started, published);
        Ok(summary)
    }

    /// VALIDATED -> CLASSIFIED
    pub async fn classify(&mut self) -> Result<ClassificationReport> {
        let started = self.begin(Layer::Classified)?;

        let reader = LayerReader::open(self.storage.as_ref(), Layer::Validated, self.run_id).await?;
        let areas: LayerRecordSet<HazardArea> = reader.read_record_set(HAZARD_AREAS_ARTIFACT).await?;
        let individuals: LayerRecordSet<Individual> = reader.read_record_set(INDIVIDUALS_ARTIFACT).await?;
        StageMetrics::records_in(Layer::Classified, HazardArea::ENTITY, areas.len());
        StageMetrics::records_in(Layer::Classified, Individual::ENTITY, individuals.len());

        for area in areas.records() {
            if let Err(issue) = check_polygon(&area.geometry) {
                return Err(PipelineError::CorruptInput {
                    layer: Layer::Validated,
                    name: HAZARD_AREAS_ARTIFACT.to_string(),
                    reason: format!("hazard area {} has invalid geometry: {}", area.id, issue),
                });
            }
        }

        let (classified, report) = self.classifier.classify_layer(&areas, &individuals);
        ClassifyMetrics::outcome(report.affected, report.unaffected, report.ambiguous);
        if report.ambiguous > 0 {
            info!(
                "🔀 {} individuals fell inside overlapping areas; assigned to the smallest",
                report.ambiguous
            );
        }
        let areas = LayerRecordSet::new(Layer::Classified, self.run_id, areas.into_records());

        let mut batch = LayerBatch::new(Layer::Classified, self.run_id);
        batch.add_record_set(HAZARD_AREAS_ARTIFACT, HazardArea::ENTITY, &areas)?;
        batch.add_record_set(INDIVIDUALS_ARTIFACT, Individual::ENTITY, &classified)?;
        let published = self.publish(batch).await?;
        StageMetrics::records_out(Layer::Classified, Individual::ENTITY, classified.len());

        self.summary.classified = report;
        self.finish(Layer::Classified, started, published);
        Ok(report)
    }

    /// CLASSIFIED -> PARTITIONED
    pub async fn partition(&mut self) -> Result<PartitionSummary> {
        let started = self.begin(Layer::Partitioned)?;

        let reader = LayerReader::open(self.storage.as_ref(), Layer::Classified, self.run_id).await?;
        let areas: LayerRecordSet<HazardArea> = reader.read_record_set(HAZARD_AREAS_ARTIFACT).await?;
        let classified: LayerRecordSet<Individual> = reader.read_record_set(INDIVIDUALS_ARTIFACT).await?;
        StageMetrics::records_in(Layer::Partitioned, Individual::ENTITY, classified.len());

        let outputs = self.partitioner.partition(&classified, &areas)?;
        if !outputs.is_consistent() {
            return Err(PipelineError::Stage {
                stage: Layer::Partitioned,
                reason: format!(
                    "affected {} + unaffected {} != all {}",
                    outputs.affected.len(),
                    outputs.unaffected.len(),
                    outputs.all.len()
                ),
            });
        }

        let mut batch = LayerBatch::new(Layer::Partitioned, self.run_id);
        for view in outputs.views() {
            batch.add(&format!("{}.json", view.name), Individual::ENTITY, view.len(), view)?;
        }
        let published = self.publish(batch).await?;
        StageMetrics::records_out(Layer::Partitioned, Individual::ENTITY, outputs.all.len());

        let summary = PartitionSummary {
            affected: outputs.affected.len(),
            unaffected: outputs.unaffected.len(),
            all: outputs.all.len(),
        };
        self.summary.partitioned = summary;
        self.finish(Layer::Partitioned, started, published);
        Ok(summary)
    }

    /// Load the classified sets into the database. Failures are fatal only with
    /// `pipeline.fail_on_database_error`.
    pub async fn load_database(&mut self) -> Result<Option<CountsSummary>> {
        if self.state != Layer::Partitioned {
            return Err(PipelineError::Stage {
                stage: self.state,
                reason: "database load requires a partitioned run".to_string(),
            });
        }
        self.refresh_lock()?;
        let Some(database) = self.database.clone() else {
            if !self.config.database.enabled {
                info!("Database load disabled");
                self.summary.database_status = DatabaseStatus::Disabled;
                return Ok(None);
            }
            DatabaseMetrics::load_failed();
            self.summary.database_status = DatabaseStatus::Unavailable;
            if self.config.pipeline.fail_on_database_error {
                error!("❌ Database unavailable, cannot load run {}", self.run_id);
                return Err(PipelineError::Database {
                    message: format!("database {} is unavailable", self.config.database.path.display()),
                });
            }
            warn!("⚠️ Database unavailable, skipping load; layers remain on disk");
            return Ok(None);
        };

        match self.load_into(database.as_ref()).await {
            Ok(counts) => {
                self.summary.database = Some(counts);
                self.summary.database_status = DatabaseStatus::Loaded;
                Ok(Some(counts))
            }
            Err(e) => {
                DatabaseMetrics::load_failed();
                self.summary.database_status = DatabaseStatus::Failed;
                if self.config.pipeline.fail_on_database_error {
                    error!("❌ Database load failed: {}", e);
                    Err(e)
                } else {
                    warn!("⚠️ Database load failed, layers remain on disk: {}", e);
                    Ok(None)
                }
            }
        }
    }

    async fn load_into(&self, database: &dyn DatabasePort) -> Result<CountsSummary> {
        let reader = LayerReader::open(self.storage.as_ref(), Layer::Classified, self.run_id).await?;
        let areas: LayerRecordSet<HazardArea> = reader.read_record_set(HAZARD_AREAS_ARTIFACT).await?;
        let individuals: LayerRecordSet<Individual> = reader.read_record_set(INDIVIDUALS_ARTIFACT).await?;
        database.upsert_hazard_areas(&areas).await?;
        database.upsert_individuals(&individuals).await?;
        database.query_counts().await
    }

    /// Every transition in order, then the database load.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        info!("🚀 Starting pipeline run {}", self.run_id);

        self.validate().await?;
        self.classify().await?;
        self.partition().await?;
        self.load_database().await?;

        self.summary.duration_secs = started.elapsed().as_secs_f64();
        let summary = self.summary.clone();
        info!(
            "🏁 Run {} finished in {:.2}s: {} affected, {} unaffected, {} total ({:.1}% affected)",
            summary.run_id,
            summary.duration_secs,
            summary.partitioned.affected,
            summary.partitioned.unaffected,
            summary.partitioned.all,
            summary.affected_percent()
        );
        for name in &summary.published {
            info!("   📄 {}", name);
        }
        Ok(summary)
    }
}

/// One complete run under the data-root lock, with metrics export afterwards.
pub async fn run_once(
    config: &Config,
    storage: Arc<dyn StoragePort>,
    database: Option<Arc<dyn DatabasePort>>,
    cancel: CancellationFlag,
) -> Result<RunSummary> {
    let lock = RunLock::acquire(
        &config.storage.data_root,
        Duration::from_secs(config.pipeline.lock_stale_after_secs),
    )?;

    let mut orchestrator = Orchestrator::new(config, storage, database, cancel).with_lock(lock);
    let result = orchestrator.run().await;
    match &result {
        Ok(_) => RunMetrics::completed("success"),
        Err(PipelineError::Cancelled { .. }) => RunMetrics::completed("cancelled"),
        Err(e) => {
            error!("❌ Run {} failed at {}: {}", orchestrator.run_id(), orchestrator.state(), e);
            RunMetrics::completed("failure");
        }
    }

    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = observability::write_textfile(path) {
            warn!("Failed to write metrics textfile {}: {}", path.display(), e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FeatureCollection, Namespace, RawFeature};
    use crate::infra::InMemoryStorage;
    use serde_json::{json, Map};

    fn props(value: serde_json::Value) -> Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn seed(storage: &InMemoryStorage) {
        let areas = FeatureCollection::new(vec![RawFeature::new(
            props(json!({"area_id": 1, "area_name": "Partenon", "severity": "high"})),
            Some(json!({
                "type": "Polygon",
                "coordinates": [[[-51.30, -30.05], [-51.20, -30.05], [-51.20, -29.95], [-51.30, -29.95], [-51.30, -30.05]]]
            })),
        )]);
        let individuals = FeatureCollection::new(vec![
            RawFeature::with_point(props(json!({"citizen_id": 1, "name": "A"})), &geo::Point::new(-51.25, -30.00)),
            RawFeature::with_point(props(json!({"citizen_id": 2, "name": "B"})), &geo::Point::new(-51.00, -29.00)),
        ]);
        storage
            .put(Namespace::Raw, "hazard_areas.geojson", serde_json::to_vec(&areas).unwrap())
            .await
            .unwrap();
        storage
            .put(Namespace::Raw, "individuals.geojson", serde_json::to_vec(&individuals).unwrap())
            .await
            .unwrap();
    }

    fn orchestrator(storage: &InMemoryStorage) -> Orchestrator {
        Orchestrator::new(&Config::default(), Arc::new(storage.clone()), None, CancellationFlag::new())
    }

    #[tokio::test]
    async fn test_transitions_are_strictly_linear() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;
        let mut orch = orchestrator(&storage);

        let err = orch.classify().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IllegalTransition { from: Layer::Raw, to: Layer::Classified }
        ));

        orch.validate().await.unwrap();
        assert_eq!(orch.state(), Layer::Validated);
        assert!(orch.validate().await.is_err());
        orch.classify().await.unwrap();
        orch.partition().await.unwrap();
        assert_eq!(orch.state(), Layer::Partitioned);
        assert!(orch.partition().await.is_err());
    }

    #[tokio::test]
    async fn test_full_run_without_database() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;
        let summary = orchestrator(&storage).run().await.unwrap();

        assert_eq!(summary.partitioned, PartitionSummary { affected: 1, unaffected: 1, all: 2 });
        assert_eq!(summary.classified.affected, 1);
        assert!(summary.database.is_none());
        assert!((summary.affected_percent() - 50.0).abs() < 1e-9);
        assert!(summary.published.contains(&"affected_individuals.json".to_string()));
        assert!(storage
            .names(Namespace::Classified)
            .contains(&"_manifest.partitioned.json".to_string()));
    }

    #[tokio::test]
    async fn test_missing_database_is_reported_as_unavailable_or_disabled() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;
        let summary = orchestrator(&storage).run().await.unwrap();
        assert_eq!(summary.database_status, DatabaseStatus::Unavailable);

        let mut config = Config::default();
        config.database.enabled = false;
        let summary = Orchestrator::new(&config, Arc::new(storage.clone()), None, CancellationFlag::new())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.database_status, DatabaseStatus::Disabled);
        assert!(summary.database.is_none());

        let mut config = Config::default();
        config.pipeline.fail_on_database_error = true;
        let err = Orchestrator::new(&config, Arc::new(storage.clone()), None, CancellationFlag::new())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Database { .. }));
    }

    #[tokio::test]
    async fn test_lost_lock_stops_the_run_before_the_next_step() {
        let dir = tempfile::tempdir().unwrap();
        let storage = InMemoryStorage::new();
        seed(&storage).await;
        let lock = RunLock::acquire(dir.path(), Duration::from_secs(3600)).unwrap();
        let marker = lock.path().to_path_buf();
        let mut orch = orchestrator(&storage).with_lock(lock);

        orch.validate().await.unwrap();
        std::fs::write(&marker, "pid 7 holder other since now\n").unwrap();
        let err = orch.classify().await.unwrap_err();
        assert!(matches!(err, PipelineError::RunLocked { .. }));
        assert_eq!(orch.state(), Layer::Validated);

        drop(orch);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_missing_raw_input_fails_validation() {
        let storage = InMemoryStorage::new();
        let err = orchestrator(&storage).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { layer: Layer::Raw, .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_stage() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;
        let cancel = CancellationFlag::new();
        let mut orch = Orchestrator::new(&Config::default(), Arc::new(storage.clone()), None, cancel.clone());
        orch.validate().await.unwrap();
        cancel.cancel();
        let err = orch.classify().await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Layer::Classified }));
        assert_eq!(orch.state(), Layer::Validated);
    }

    #[tokio::test]
    async fn test_corrupt_validated_layer_is_fatal_and_named() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;
        let mut orch = orchestrator(&storage);
        orch.validate().await.unwrap();
        storage
            .put(Namespace::Validated, INDIVIDUALS_ARTIFACT, b"{not json".to_vec())
            .await
            .unwrap();
        let err = orch.classify().await.unwrap_err();
        assert!(matches!(err, PipelineError::CorruptInput { layer: Layer::Validated, .. }));
    }
}
