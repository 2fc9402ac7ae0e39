use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;

use esteira_geo::app::ports::{AreaCount, CountsSummary, DatabasePort, StoragePort};
use esteira_geo::config::{Config, RetryConfig};
use esteira_geo::domain::{HazardArea, Individual, Layer, LayerRecordSet, Severity};
use esteira_geo::error::PipelineError;
use esteira_geo::infra::{InMemoryStorage, LocalFsStorage, MirroredStorage, SqliteDatabase};
use esteira_geo::pipeline::artifact::LayerReader;
use esteira_geo::pipeline::processing::partition::PartitionView;
use esteira_geo::pipeline::run_lock::RunLock;
use esteira_geo::pipeline::{run_once, seed, CancellationFlag, DatabaseStatus, Orchestrator};

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_root = root.join("data");
    config.database.path = root.join("data").join("esteira.db");
    config.metrics.textfile = Some(root.join("metrics.prom"));
    config
}

fn write_raw(config: &Config, name: &str, value: serde_json::Value) -> Result<()> {
    let dir = config.storage.data_root.join("raw");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(name), serde_json::to_vec(&value)?)?;
    Ok(())
}

fn write_square_scenario(config: &Config) -> Result<()> {
    write_raw(
        config,
        "hazard_areas.geojson",
        json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"area_id": 1, "area_name": "Square", "severity": "High"},
                "geometry": {"type": "Polygon", "coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]]}
            }]
        }),
    )?;
    write_raw(
        config,
        "individuals.geojson",
        json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"citizen_id": 1, "name": "Inside"},
                 "geometry": {"type": "Point", "coordinates": [5.0, 5.0]}},
                {"type": "Feature", "properties": {"citizen_id": 2, "name": "Outside", "phone": "51 99999-0002"},
                 "geometry": {"type": "Point", "coordinates": [15.0, 15.0]}},
                {"type": "Feature", "properties": {"citizen_id": 3, "name": "Edge"},
                 "geometry": {"type": "Point", "coordinates": [10.0, 5.0]}}
            ]
        }),
    )
}

fn local_storage(config: &Config) -> Arc<dyn StoragePort> {
    Arc::new(LocalFsStorage::new(&config.storage.data_root))
}

#[tokio::test]
async fn test_square_scenario_end_to_end() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    write_square_scenario(&config)?;

    let storage = local_storage(&config);
    let db = Arc::new(SqliteDatabase::open(&config.database.path)?);
    let summary = run_once(&config, storage.clone(), Some(db.clone()), CancellationFlag::new()).await?;

    // boundary counts as inside
    assert_eq!(summary.partitioned.affected, 2);
    assert_eq!(summary.partitioned.unaffected, 1);
    assert_eq!(summary.partitioned.all, 3);
    assert_eq!(
        summary.database,
        Some(CountsSummary { total: 3, affected: 2, unaffected: 1 })
    );

    let classified_dir = config.storage.data_root.join("classified");
    for name in [
        "hazard_areas.json",
        "individuals.json",
        "affected_individuals.json",
        "unaffected_individuals.json",
        "all_individuals_evaluated.json",
        "_manifest.classified.json",
        "_manifest.partitioned.json",
    ] {
        assert!(classified_dir.join(name).exists(), "missing {}", name);
    }
    assert!(config.storage.data_root.join("validated").join("_manifest.validated.json").exists());
    assert!(!config.storage.data_root.join(".esteira.lock").exists());

    let reader = LayerReader::open(storage.as_ref(), Layer::Partitioned, summary.run_id).await?;
    let affected: PartitionView = reader.read("affected_individuals.json").await?;
    let mut ids: Vec<i64> = affected.records.iter().map(|i| i.id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 3]);
    assert!(affected.records.iter().all(|i| i.hazard_area_id == Some(1)));
    let square = affected.hazard_area_of(&affected.records[0]).expect("area attached to affected view");
    assert_eq!(square.name, "Square");
    assert_eq!(square.severity, Some(Severity::High));

    let unaffected: PartitionView = reader.read("unaffected_individuals.json").await?;
    assert_eq!(unaffected.records.len(), 1);
    assert_eq!(unaffected.records[0].id, 2);
    assert_eq!(unaffected.records[0].hazard_area_id, None);

    let validated = LayerReader::open(storage.as_ref(), Layer::Validated, summary.run_id).await?;
    let individuals: LayerRecordSet<Individual> = validated.read_record_set("individuals.json").await?;
    assert!(individuals.records().iter().all(|i| i.affected.is_none()));
    let inside = individuals.records().iter().find(|i| i.id == 1).expect("individual 1");
    assert_eq!(inside.contact, "N/A");
    assert!(inside.quality_score < 1.0);

    assert_eq!(db.membership_of(3)?, Some(Some(true)));
    assert_eq!(db.membership_of(2)?, Some(Some(false)));
    Ok(())
}

#[tokio::test]
async fn test_seeded_dataset_classifies_sixty_affected() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    let storage = local_storage(&config);
    seed::seed_raw(storage.as_ref(), &config.pipeline, false).await?;

    let db = Arc::new(SqliteDatabase::open_in_memory()?);
    let summary = run_once(&config, storage, Some(db.clone()), CancellationFlag::new()).await?;
    assert_eq!(summary.partitioned.affected, 60);
    assert_eq!(summary.partitioned.unaffected, 40);
    assert_eq!(summary.validated.hazard_areas.output, 3);
    assert_eq!(summary.validated.individuals.output, 100);

    let by_area = db.counts_by_area().await?;
    assert_eq!(by_area.len(), 3);
    assert_eq!(by_area.iter().map(|a| a.affected).sum::<u64>(), 60);
    Ok(())
}

#[tokio::test]
async fn test_seeded_anomalies_are_cleaned() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    let storage = local_storage(&config);
    seed::seed_raw(storage.as_ref(), &config.pipeline, true).await?;

    let summary = run_once(&config, storage.clone(), None, CancellationFlag::new()).await?;
    let areas = summary.validated.hazard_areas;
    assert_eq!(areas.input, 5);
    assert_eq!(areas.duplicates, 1);
    assert_eq!(areas.repaired_geometry, 1);
    assert_eq!(areas.output, 4);

    let individuals = summary.validated.individuals;
    assert_eq!(individuals.input, 101);
    assert_eq!(individuals.duplicates, 1);
    assert_eq!(individuals.output, 100);
    assert_eq!(summary.partitioned.affected, 60);

    let reader = LayerReader::open(storage.as_ref(), Layer::Validated, summary.run_id).await?;
    let validated: LayerRecordSet<Individual> = reader.read_record_set("individuals.json").await?;
    let padded = validated.records().iter().find(|i| i.id == 1).expect("individual 1");
    assert_eq!(padded.name, "Citizen_001");
    let no_phone = validated.records().iter().find(|i| i.id == 2).expect("individual 2");
    assert_eq!(no_phone.contact, "N/A");
    assert!(no_phone.quality_score < 1.0);

    let hazards: LayerRecordSet<HazardArea> = reader.read_record_set("hazard_areas.json").await?;
    let repaired = hazards.records().iter().find(|a| a.id == 4).expect("area 4");
    assert_eq!(repaired.name, "Arquipélago");
    Ok(())
}

#[tokio::test]
async fn test_rerun_is_idempotent_in_database() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    write_square_scenario(&config)?;
    let storage = local_storage(&config);
    let db = Arc::new(SqliteDatabase::open(&config.database.path)?);

    let first = run_once(&config, storage.clone(), Some(db.clone()), CancellationFlag::new()).await?;
    let second = run_once(&config, storage, Some(db.clone()), CancellationFlag::new()).await?;
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.partitioned, second.partitioned);
    assert_eq!(db.query_counts().await?.total, 3);
    Ok(())
}

#[tokio::test]
async fn test_rerun_with_fewer_individuals_drops_stale_rows() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    let storage = local_storage(&config);
    seed::seed_raw(storage.as_ref(), &config.pipeline, false).await?;
    let db = Arc::new(SqliteDatabase::open(&config.database.path)?);

    let first = run_once(&config, storage.clone(), Some(db.clone()), CancellationFlag::new()).await?;
    assert_eq!(first.database.map(|c| c.total), Some(100));
    assert_eq!(first.database_status, DatabaseStatus::Loaded);

    let mut sample = seed::sample_individuals(false);
    sample.features.truncate(10);
    write_raw(&config, "individuals.geojson", serde_json::to_value(&sample)?)?;

    let second = run_once(&config, storage, Some(db.clone()), CancellationFlag::new()).await?;
    assert_eq!(second.partitioned.all, 10);
    let counts = second.database.expect("database counts");
    assert_eq!(counts.total, second.partitioned.all as u64);
    assert_eq!(counts.affected, second.partitioned.affected as u64);
    assert_eq!(db.membership_of(50)?, None);
    Ok(())
}

#[tokio::test]
async fn test_missing_raw_input_names_the_layer() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    let err = run_once(&config, local_storage(&config), None, CancellationFlag::new())
        .await
        .unwrap_err();
    match err {
        PipelineError::MissingInput { layer, name } => {
            assert_eq!(layer, Layer::Raw);
            assert_eq!(name, "hazard_areas.geojson");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!config.storage.data_root.join("validated").exists());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_run_is_refused() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    write_square_scenario(&config)?;
    let _held = RunLock::acquire(&config.storage.data_root, std::time::Duration::from_secs(3600))?;

    let err = run_once(&config, local_storage(&config), None, CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::RunLocked { .. }));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_publishes_nothing() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    write_square_scenario(&config)?;
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let err = run_once(&config, local_storage(&config), None, cancel).await.unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled { stage: Layer::Validated }));
    assert!(!config.storage.data_root.join("validated").exists());
    Ok(())
}

#[tokio::test]
async fn test_mirror_failure_does_not_fail_the_run() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = test_config(temp_dir.path());
    write_square_scenario(&config)?;

    let mirror = InMemoryStorage::new();
    mirror.set_failing(true);
    let retry = RetryConfig { max_attempts: 1, delay_ms: 0 };
    let storage: Arc<dyn StoragePort> = Arc::new(MirroredStorage::new(
        local_storage(&config),
        Some(Arc::new(mirror)),
        retry,
    ));

    let summary = run_once(&config, storage, None, CancellationFlag::new()).await?;
    assert_eq!(summary.partitioned.all, 3);
    assert!(summary.mirror_failures > 0);
    Ok(())
}

struct UnreachableDatabase;

#[async_trait]
impl DatabasePort for UnreachableDatabase {
    async fn upsert_hazard_areas(&self, _set: &LayerRecordSet<HazardArea>) -> esteira_geo::error::Result<usize> {
        Err(PipelineError::Database { message: "connection refused".to_string() })
    }

    async fn upsert_individuals(&self, _set: &LayerRecordSet<Individual>) -> esteira_geo::error::Result<usize> {
        Err(PipelineError::Database { message: "connection refused".to_string() })
    }

    async fn query_counts(&self) -> esteira_geo::error::Result<CountsSummary> {
        Err(PipelineError::Database { message: "connection refused".to_string() })
    }

    async fn hazard_areas_containing(&self, _lon: f64, _lat: f64) -> esteira_geo::error::Result<Vec<HazardArea>> {
        Ok(Vec::new())
    }

    async fn counts_by_area(&self) -> esteira_geo::error::Result<Vec<AreaCount>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_database_failure_is_partial_success_by_default() -> Result<()> {
    let temp_dir = tempdir()?;
    let mut config = test_config(temp_dir.path());
    write_square_scenario(&config)?;
    let storage = local_storage(&config);

    let summary = Orchestrator::new(&config, storage.clone(), Some(Arc::new(UnreachableDatabase)), CancellationFlag::new())
        .run()
        .await?;
    assert!(summary.database.is_none());
    assert_eq!(summary.database_status, DatabaseStatus::Failed);
    assert!(config.storage.data_root.join("classified").join("affected_individuals.json").exists());

    config.pipeline.fail_on_database_error = true;
    let err = Orchestrator::new(&config, storage, Some(Arc::new(UnreachableDatabase)), CancellationFlag::new())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Database { .. }));
    Ok(())
}
