use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{HazardArea, Individual, LayerRecordSet, Namespace};
use crate::error::{Result, StorageError};

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored by the primary; there is no mirror.
    Stored,
    /// Stored by the primary and copied to the mirror.
    Mirrored,
    /// Stored by the primary; the mirror copy failed.
    MirrorFailed { error: String },
}

#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn put(&self, namespace: Namespace, name: &str, bytes: Vec<u8>) -> std::result::Result<PutOutcome, StorageError>;

    /// `StorageError::NotFound` when the object does not exist.
    async fn get(&self, namespace: Namespace, name: &str) -> std::result::Result<Vec<u8>, StorageError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountsSummary {
    pub total: u64,
    pub affected: u64,
    pub unaffected: u64,
}

impl CountsSummary {
    pub fn affected_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.affected as f64 * 100.0 / self.total as f64
        }
    }
}

/// Affected individuals per hazard area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaCount {
    pub hazard_area_id: i64,
    pub name: String,
    pub severity: Option<String>,
    pub affected: u64,
}

#[async_trait]
pub trait DatabasePort: Send + Sync {
    /// Insert or update by area id, then drop areas left by other runs; returns rows written.
    async fn upsert_hazard_areas(&self, set: &LayerRecordSet<HazardArea>) -> Result<usize>;

    /// Insert or update by individual id, then drop individuals left by other runs; returns rows written.
    async fn upsert_individuals(&self, set: &LayerRecordSet<Individual>) -> Result<usize>;

    async fn query_counts(&self) -> Result<CountsSummary>;

    /// Hazard areas whose polygon contains the point (boundary inclusive).
    async fn hazard_areas_containing(&self, lon: f64, lat: f64) -> Result<Vec<HazardArea>>;

    async fn counts_by_area(&self) -> Result<Vec<AreaCount>>;
}
