//! Output Partitioner: split classified individuals into named views.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{HazardArea, Individual, Layer, LayerRecordSet, Severity};
use crate::error::{PipelineError, Result};

pub const AFFECTED_VIEW: &str = "affected_individuals";
pub const UNAFFECTED_VIEW: &str = "unaffected_individuals";
pub const ALL_VIEW: &str = "all_individuals_evaluated";

/// The hazard-area fields reported alongside affected individuals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaSummary {
    pub id: i64,
    pub name: String,
    pub occurrence_date: Option<NaiveDate>,
    pub severity: Option<Severity>,
}

impl From<&HazardArea> for AreaSummary {
    fn from(area: &HazardArea) -> Self {
        Self {
            id: area.id,
            name: area.name.clone(),
            occurrence_date: area.occurrence_date,
            severity: area.severity,
        }
    }
}

/// One named output view.
///
/// `hazard_areas` holds every area referenced by the view's records, keyed by id.
/// Only the affected view carries entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionView {
    pub name: String,
    pub partitioned_at: DateTime<Utc>,
    pub records: Vec<Individual>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hazard_areas: BTreeMap<i64, AreaSummary>,
}

impl PartitionView {
    fn new(name: &str, partitioned_at: DateTime<Utc>, records: Vec<Individual>) -> Self {
        Self {
            name: name.to_string(),
            partitioned_at,
            records,
            hazard_areas: BTreeMap::new(),
        }
    }

    /// Area an individual in this view belongs to, if it was attached.
    pub fn hazard_area_of(&self, individual: &Individual) -> Option<&AreaSummary> {
        individual.hazard_area_id.and_then(|id| self.hazard_areas.get(&id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionedOutputs {
    pub affected: PartitionView,
    pub unaffected: PartitionView,
    pub all: PartitionView,
}

impl PartitionedOutputs {
    pub fn views(&self) -> [&PartitionView; 3] {
        [&self.affected, &self.unaffected, &self.all]
    }

    /// affected + unaffected == all
    pub fn is_consistent(&self) -> bool {
        self.affected.len() + self.unaffected.len() == self.all.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputPartitioner;

impl OutputPartitioner {
    pub fn new() -> Self {
        Self
    }

    pub fn partition(
        &self,
        classified: &LayerRecordSet<Individual>,
        areas: &LayerRecordSet<HazardArea>,
    ) -> Result<PartitionedOutputs> {
        self.partition_at(classified, areas, Utc::now())
    }

    /// Partition with an explicit timestamp; the result is a pure function of its inputs.
    /// Every affected individual must reference an area present in `areas`.
    pub fn partition_at(
        &self,
        classified: &LayerRecordSet<Individual>,
        areas: &LayerRecordSet<HazardArea>,
        partitioned_at: DateTime<Utc>,
    ) -> Result<PartitionedOutputs> {
        if classified.layer() != Layer::Classified {
            return Err(PipelineError::Stage {
                stage: Layer::Partitioned,
                reason: format!("expected a classified record set, got {}", classified.layer()),
            });
        }

        let by_id: HashMap<i64, &HazardArea> = areas.records().iter().map(|a| (a.id, a)).collect();
        let mut attached = BTreeMap::new();
        let mut affected = Vec::new();
        let mut unaffected = Vec::new();
        for individual in classified.records() {
            match individual.affected {
                Some(true) => {
                    let area = individual
                        .hazard_area_id
                        .and_then(|id| by_id.get(&id))
                        .ok_or_else(|| PipelineError::Stage {
                            stage: Layer::Partitioned,
                            reason: format!(
                                "affected individual {} references unknown hazard area {:?}",
                                individual.id, individual.hazard_area_id
                            ),
                        })?;
                    attached.entry(area.id).or_insert_with(|| AreaSummary::from(*area));
                    affected.push(individual.clone());
                }
                Some(false) => unaffected.push(individual.clone()),
                None => {
                    return Err(PipelineError::Stage {
                        stage: Layer::Partitioned,
                        reason: format!("individual {} has no membership flag", individual.id),
                    })
                }
            }
        }

        let mut affected = PartitionView::new(AFFECTED_VIEW, partitioned_at, affected);
        affected.hazard_areas = attached;
        let outputs = PartitionedOutputs {
            affected,
            unaffected: PartitionView::new(UNAFFECTED_VIEW, partitioned_at, unaffected),
            all: PartitionView::new(ALL_VIEW, partitioned_at, classified.records().to_vec()),
        };
        info!(
            affected = outputs.affected.len(),
            unaffected = outputs.unaffected.len(),
            all = outputs.all.len(),
            "📂 Partitioned classified individuals"
        );
        Ok(outputs)
    }
}
