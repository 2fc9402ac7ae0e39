//! Spatial Classifier: point-in-polygon membership of individuals in hazard areas.
//!
//! Containment is boundary-inclusive. When several areas contain a point the
//! one with the smallest unsigned planar area owns it; equal areas fall back
//! to the lowest hazard area id.

pub mod index;

use std::cmp::Ordering;

use geo::{Area, Intersects, Point};
use serde::Serialize;
use tracing::info;

use crate::domain::{ClassificationResult, HazardArea, Individual, Layer, LayerRecordSet};

pub use index::HazardIndex;

/// How candidate polygons are found before the exact containment test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSearch {
    /// R-tree of bounding boxes.
    Indexed,
    /// Every polygon is a candidate.
    Exhaustive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationReport {
    pub classified: usize,
    pub affected: usize,
    pub unaffected: usize,
    /// Individuals contained by more than one area.
    pub ambiguous: usize,
}

impl ClassificationReport {
    fn record(&mut self, result: &ClassificationResult) {
        self.classified += 1;
        if result.hazard_area_id.is_some() {
            self.affected += 1;
        } else {
            self.unaffected += 1;
        }
        if result.matches > 1 {
            self.ambiguous += 1;
        }
    }
}

/// Annotated individuals, in input order, with per-individual match details.
#[derive(Debug, Clone)]
pub struct Classification {
    pub individuals: Vec<Individual>,
    pub results: Vec<ClassificationResult>,
    pub report: ClassificationReport,
}

/// Hazard areas prepared for repeated point lookups.
pub struct PreparedAreas<'a> {
    areas: &'a [HazardArea],
    planar_areas: Vec<f64>,
    index: Option<HazardIndex>,
}

impl<'a> PreparedAreas<'a> {
    pub fn new(areas: &'a [HazardArea], search: CandidateSearch) -> Self {
        let index = match search {
            CandidateSearch::Indexed => Some(HazardIndex::build(areas)),
            CandidateSearch::Exhaustive => None,
        };
        Self {
            areas,
            planar_areas: areas.iter().map(|a| a.geometry.unsigned_area()).collect(),
            index,
        }
    }

    fn candidates(&self, point: &Point<f64>) -> Vec<usize> {
        match &self.index {
            Some(index) => index.candidates(point),
            None => (0..self.areas.len()).collect(),
        }
    }

    /// Smallest area first, then lowest id.
    fn precedence(&self, a: usize, b: usize) -> Ordering {
        self.planar_areas[a]
            .total_cmp(&self.planar_areas[b])
            .then_with(|| self.areas[a].id.cmp(&self.areas[b].id))
    }

    /// Areas containing `point`, best owner first.
    pub fn containing(&self, point: &Point<f64>) -> Vec<&'a HazardArea> {
        let mut matches: Vec<usize> = self
            .candidates(point)
            .into_iter()
            .filter(|&i| self.areas[i].geometry.intersects(point))
            .collect();
        matches.sort_by(|&a, &b| self.precedence(a, b));
        let areas = self.areas;
        matches.into_iter().map(|i| &areas[i]).collect()
    }

    pub fn locate(&self, individual: &Individual) -> ClassificationResult {
        let candidates = self.candidates(&individual.location);
        let matches: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| self.areas[i].geometry.intersects(&individual.location))
            .collect();
        let owner = matches
            .iter()
            .copied()
            .min_by(|&a, &b| self.precedence(a, b))
            .map(|i| self.areas[i].id);

        ClassificationResult {
            individual_id: individual.id,
            hazard_area_id: owner,
            candidates: candidates.len(),
            matches: matches.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialClassifier {
    search: CandidateSearch,
}

impl Default for SpatialClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialClassifier {
    pub fn new() -> Self {
        Self {
            search: CandidateSearch::Indexed,
        }
    }

    pub fn with_search(search: CandidateSearch) -> Self {
        Self { search }
    }

    /// Annotate every individual; each appears exactly once, in input order.
    pub fn classify(&self, areas: &[HazardArea], individuals: Vec<Individual>) -> Classification {
        let prepared = PreparedAreas::new(areas, self.search);
        let mut report = ClassificationReport::default();
        let mut results = Vec::with_capacity(individuals.len());

        let individuals = individuals
            .into_iter()
            .map(|individual| {
                let result = prepared.locate(&individual);
                report.record(&result);
                results.push(result);
                individual.classified(result.hazard_area_id)
            })
            .collect();

        Classification {
            individuals,
            results,
            report,
        }
    }

    /// Classify validated record sets into the classified layer.
    pub fn classify_layer(
        &self,
        areas: &LayerRecordSet<HazardArea>,
        individuals: &LayerRecordSet<Individual>,
    ) -> (LayerRecordSet<Individual>, ClassificationReport) {
        let classification = self.classify(areas.records(), individuals.records().to_vec());
        let report = classification.report;
        info!(
            areas = areas.len(),
            classified = report.classified,
            affected = report.affected,
            unaffected = report.unaffected,
            ambiguous = report.ambiguous,
            "🗺️ Classified individuals against hazard areas"
        );
        (
            LayerRecordSet::new(Layer::Classified, individuals.run_id(), classification.individuals),
            report,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Attributes;
    use geo::{point, polygon, Polygon};

    fn area(id: i64, geometry: Polygon<f64>) -> HazardArea {
        HazardArea {
            id,
            name: format!("area {}", id),
            occurrence_date: None,
            severity: None,
            affected_population: None,
            geometry,
            quality_score: 1.0,
            attributes: Attributes::new(),
        }
    }

    fn square(id: i64, x0: f64, y0: f64, side: f64) -> HazardArea {
        area(
            id,
            polygon![(x: x0, y: y0), (x: x0 + side, y: y0), (x: x0 + side, y: y0 + side), (x: x0, y: y0 + side)],
        )
    }

    fn person(id: i64, x: f64, y: f64) -> Individual {
        Individual {
            id,
            name: format!("Citizen_{:03}", id),
            address: "N/A".to_string(),
            contact: "N/A".to_string(),
            registration_date: None,
            location: point!(x: x, y: y),
            affected: None,
            hazard_area_id: None,
            quality_score: 1.0,
            attributes: Attributes::new(),
        }
    }

    #[test]
    fn test_inside_and_outside() {
        let areas = vec![area(
            1,
            polygon![(x: -51.30, y: -30.05), (x: -51.20, y: -30.05), (x: -51.20, y: -29.95), (x: -51.30, y: -29.95)],
        )];
        let out = SpatialClassifier::new().classify(&areas, vec![person(1, -51.25, -30.00), person(2, -51.00, -29.00)]);

        assert_eq!(out.individuals[0].affected, Some(true));
        assert_eq!(out.individuals[0].hazard_area_id, Some(1));
        assert_eq!(out.individuals[1].affected, Some(false));
        assert_eq!(out.individuals[1].hazard_area_id, None);
        assert_eq!(
            out.report,
            ClassificationReport { classified: 2, affected: 1, unaffected: 1, ambiguous: 0 }
        );
    }

    #[test]
    fn test_boundary_points_are_inside() {
        let areas = vec![square(1, 0.0, 0.0, 1.0)];
        let classifier = SpatialClassifier::new();
        for _ in 0..3 {
            let out = classifier.classify(
                &areas,
                vec![person(1, 1.0, 0.5), person(2, 0.0, 0.0), person(3, 0.5, 1.0)],
            );
            assert!(out.individuals.iter().all(|i| i.hazard_area_id == Some(1)));
        }
    }

    #[test]
    fn test_hole_interior_is_outside_but_hole_edge_is_inside() {
        let with_hole = area(
            4,
            polygon!(
                exterior: [(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: 0.0, y: 4.0)],
                interiors: [[(x: 1.0, y: 1.0), (x: 3.0, y: 1.0), (x: 3.0, y: 3.0), (x: 1.0, y: 3.0)]],
            ),
        );
        let out = SpatialClassifier::new().classify(&[with_hole], vec![person(1, 2.0, 2.0), person(2, 1.0, 2.0)]);
        assert_eq!(out.individuals[0].hazard_area_id, None);
        assert_eq!(out.individuals[1].hazard_area_id, Some(4));
    }

    #[test]
    fn test_overlap_goes_to_smallest_area() {
        let areas = vec![square(1, 0.0, 0.0, 10.0), square(2, 4.0, 4.0, 2.0)];
        let out = SpatialClassifier::new().classify(&areas, vec![person(1, 5.0, 5.0)]);
        assert_eq!(out.individuals[0].hazard_area_id, Some(2));
        assert_eq!(out.results[0].matches, 2);
        assert_eq!(out.report.ambiguous, 1);
    }

    #[test]
    fn test_equal_areas_go_to_lowest_id() {
        let areas = vec![square(9, 0.0, 0.0, 2.0), square(3, 1.0, 1.0, 2.0)];
        let out = SpatialClassifier::new().classify(&areas, vec![person(1, 1.5, 1.5)]);
        assert_eq!(out.individuals[0].hazard_area_id, Some(3));
    }

    #[test]
    fn test_indexed_and_exhaustive_agree() {
        let areas: Vec<HazardArea> = (0..12)
            .map(|i| square(i, (i % 4) as f64 * 0.75, (i / 4) as f64 * 0.75, 1.0))
            .collect();
        let people: Vec<Individual> = (0..200)
            .map(|i| person(i, (i % 20) as f64 * 0.2, (i / 20) as f64 * 0.3))
            .collect();

        let indexed = SpatialClassifier::new().classify(&areas, people.clone());
        let exhaustive = SpatialClassifier::with_search(CandidateSearch::Exhaustive).classify(&areas, people.clone());
        let again = SpatialClassifier::new().classify(&areas, people);

        assert_eq!(indexed.individuals, exhaustive.individuals);
        assert_eq!(indexed.individuals, again.individuals);
        assert_eq!(indexed.report, exhaustive.report);
        assert!(indexed.individuals.iter().all(Individual::membership_is_consistent));
    }

    #[test]
    fn test_output_preserves_input_order_and_size() {
        let areas = vec![square(1, 0.0, 0.0, 1.0)];
        let people = vec![person(30, 5.0, 5.0), person(10, 0.5, 0.5), person(20, 9.0, 9.0)];
        let out = SpatialClassifier::new().classify(&areas, people);
        let ids: Vec<i64> = out.individuals.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![30, 10, 20]);
    }

    #[test]
    fn test_no_areas_means_nobody_affected() {
        let out = SpatialClassifier::new().classify(&[], vec![person(1, 0.0, 0.0)]);
        assert_eq!(out.individuals[0].affected, Some(false));
        assert_eq!(out.report.unaffected, 1);
    }

    #[test]
    fn test_containing_orders_by_precedence() {
        let areas = vec![square(1, 0.0, 0.0, 10.0), square(2, 4.0, 4.0, 2.0), square(3, 20.0, 20.0, 1.0)];
        let prepared = PreparedAreas::new(&areas, CandidateSearch::Indexed);
        let ids: Vec<i64> = prepared.containing(&point!(x: 5.0, y: 5.0)).iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
