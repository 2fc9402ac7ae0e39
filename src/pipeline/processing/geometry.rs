//! Geometry validation and repair.
//!
//! A polygon is valid when all of its coordinates are finite WGS84 positions,
//! every ring is closed with at least four vertices, the exterior encloses a
//! non-zero area, no ring touches or overlaps itself, and holes stay inside
//! the exterior without crossing it or each other. Invalid polygons are
//! repaired by re-noding them through a boolean union with the empty set (the
//! equivalent of a zero-width buffer); a repair that comes back empty or still
//! invalid marks the geometry as unrepairable.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{Area, BooleanOps, Contains, Coord, Intersects, Line, LineString, MultiPolygon, Point, Polygon};
use serde::Serialize;
use std::fmt;

pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;
pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;

/// Per-geometry verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome<G> {
    /// Already valid; returned unchanged.
    Valid(G),
    /// Invalid on input, valid after repair.
    Repaired(G),
    /// Unrepairable; excluded from downstream layers.
    Invalid(TopologyIssue),
}

impl<G> ValidationOutcome<G> {
    pub fn is_usable(&self) -> bool {
        !matches!(self, ValidationOutcome::Invalid(_))
    }

    /// The usable geometry, if any.
    pub fn into_geometry(self) -> Option<G> {
        match self {
            ValidationOutcome::Valid(g) | ValidationOutcome::Repaired(g) => Some(g),
            ValidationOutcome::Invalid(_) => None,
        }
    }
}

/// Why a geometry failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyIssue {
    NonFiniteCoordinate,
    OutOfBounds { lon: f64, lat: f64 },
    TooFewVertices { ring: usize, count: usize },
    ZeroArea,
    SelfIntersection { ring: usize },
    RingsCross { first: usize, second: usize },
    HoleOutsideShell { ring: usize },
    NestedHoles { outer: usize, inner: usize },
    RepairFailed(String),
}

impl TopologyIssue {
    /// Coordinate problems cannot be fixed by re-noding.
    fn is_repairable(&self) -> bool {
        !matches!(
            self,
            TopologyIssue::NonFiniteCoordinate | TopologyIssue::OutOfBounds { .. }
        )
    }
}

impl fmt::Display for TopologyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyIssue::NonFiniteCoordinate => write!(f, "non-finite coordinate"),
            TopologyIssue::OutOfBounds { lon, lat } => {
                write!(f, "coordinate ({}, {}) outside WGS84 bounds", lon, lat)
            }
            TopologyIssue::TooFewVertices { ring, count } => {
                write!(f, "ring {} has {} distinct vertices, needs at least 4", ring, count)
            }
            TopologyIssue::ZeroArea => write!(f, "exterior ring encloses no area"),
            TopologyIssue::SelfIntersection { ring } => write!(f, "ring {} self-intersects", ring),
            TopologyIssue::RingsCross { first, second } => {
                write!(f, "rings {} and {} cross", first, second)
            }
            TopologyIssue::HoleOutsideShell { ring } => {
                write!(f, "hole {} lies outside the exterior ring", ring)
            }
            TopologyIssue::NestedHoles { outer, inner } => {
                write!(f, "hole {} is nested inside hole {}", inner, outer)
            }
            TopologyIssue::RepairFailed(reason) => write!(f, "repair failed: {}", reason),
        }
    }
}

/// Counts for stage reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: usize,
    pub repaired: usize,
    pub invalid: usize,
}

impl ValidationReport {
    pub fn record<G>(&mut self, outcome: &ValidationOutcome<G>) {
        match outcome {
            ValidationOutcome::Valid(_) => self.valid += 1,
            ValidationOutcome::Repaired(_) => self.repaired += 1,
            ValidationOutcome::Invalid(_) => self.invalid += 1,
        }
    }

    pub fn from_outcomes<G>(outcomes: &[ValidationOutcome<G>]) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            report.record(outcome);
        }
        report
    }

    pub fn total(&self) -> usize {
        self.valid + self.repaired + self.invalid
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GeometryValidator;

impl GeometryValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a batch; one outcome per input, in input order.
    pub fn validate_polygons<I>(&self, geometries: I) -> Vec<ValidationOutcome<Polygon<f64>>>
    where
        I: IntoIterator<Item = Polygon<f64>>,
    {
        geometries.into_iter().map(|g| self.validate_polygon(g)).collect()
    }

    pub fn validate_polygon(&self, polygon: Polygon<f64>) -> ValidationOutcome<Polygon<f64>> {
        let issue = match check_polygon(&polygon) {
            Ok(()) => return ValidationOutcome::Valid(polygon),
            Err(issue) => issue,
        };
        if !issue.is_repairable() {
            return ValidationOutcome::Invalid(issue);
        }

        match repair(&polygon) {
            Some(repaired) => match check_polygon(&repaired) {
                Ok(()) => ValidationOutcome::Repaired(repaired),
                Err(still) => ValidationOutcome::Invalid(TopologyIssue::RepairFailed(format!(
                    "{} (originally: {})",
                    still, issue
                ))),
            },
            None => ValidationOutcome::Invalid(TopologyIssue::RepairFailed(format!(
                "empty result (originally: {})",
                issue
            ))),
        }
    }

    pub fn validate_point(&self, point: Point<f64>) -> ValidationOutcome<Point<f64>> {
        match check_coord(point.0) {
            Ok(()) => ValidationOutcome::Valid(point),
            Err(issue) => ValidationOutcome::Invalid(issue),
        }
    }
}

fn check_coord(c: Coord<f64>) -> Result<(), TopologyIssue> {
    if !c.x.is_finite() || !c.y.is_finite() {
        return Err(TopologyIssue::NonFiniteCoordinate);
    }
    if !(MIN_LON..=MAX_LON).contains(&c.x) || !(MIN_LAT..=MAX_LAT).contains(&c.y) {
        return Err(TopologyIssue::OutOfBounds { lon: c.x, lat: c.y });
    }
    Ok(())
}

/// Ring with consecutive duplicate vertices collapsed; still closed.
fn distinct_ring(ring: &LineString<f64>) -> Vec<Coord<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in ring.coords() {
        if coords.last() != Some(c) {
            coords.push(*c);
        }
    }
    coords
}

fn segments(ring: &[Coord<f64>]) -> Vec<Line<f64>> {
    ring.windows(2).map(|w| Line::new(w[0], w[1])).collect()
}

fn ring_is_simple(ring: &[Coord<f64>]) -> bool {
    let segs = segments(ring);
    let m = segs.len();
    for i in 0..m {
        for j in (i + 1)..m {
            let adjacent = j == i + 1 || (i == 0 && j == m - 1);
            match line_intersection(segs[i], segs[j]) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return false,
            }
        }
    }
    true
}

fn rings_cross(a: &[Coord<f64>], b: &[Coord<f64>]) -> bool {
    let (sa, sb) = (segments(a), segments(b));
    sa.iter().any(|p| {
        sb.iter().any(|q| {
            matches!(
                line_intersection(*p, *q),
                Some(LineIntersection::SinglePoint { is_proper: true, .. })
                    | Some(LineIntersection::Collinear { .. })
            )
        })
    })
}

/// Full topological check; `Ok` means the polygon passes unchanged.
pub fn check_polygon(polygon: &Polygon<f64>) -> Result<(), TopologyIssue> {
    for c in polygon
        .exterior()
        .coords()
        .chain(polygon.interiors().iter().flat_map(|r| r.coords()))
    {
        check_coord(*c)?;
    }

    let rings: Vec<Vec<Coord<f64>>> = std::iter::once(polygon.exterior())
        .chain(polygon.interiors().iter())
        .map(distinct_ring)
        .collect();

    for (idx, ring) in rings.iter().enumerate() {
        if ring.len() < 4 || ring.first() != ring.last() {
            return Err(TopologyIssue::TooFewVertices {
                ring: idx,
                count: ring.len().saturating_sub(1),
            });
        }
    }

    for (idx, ring) in rings.iter().enumerate() {
        if !ring_is_simple(ring) {
            return Err(TopologyIssue::SelfIntersection { ring: idx });
        }
    }

    let shell = Polygon::new(polygon.exterior().clone(), Vec::new());
    if shell.unsigned_area() <= 0.0 {
        return Err(TopologyIssue::ZeroArea);
    }

    for first in 0..rings.len() {
        for second in (first + 1)..rings.len() {
            if rings_cross(&rings[first], &rings[second]) {
                return Err(TopologyIssue::RingsCross { first, second });
            }
        }
    }

    for (offset, hole) in polygon.interiors().iter().enumerate() {
        let idx = offset + 1;
        if !hole.coords().all(|c| shell.intersects(&Point::from(*c))) {
            return Err(TopologyIssue::HoleOutsideShell { ring: idx });
        }
        let hole_shell = Polygon::new(hole.clone(), Vec::new());
        for (other_offset, other) in polygon.interiors().iter().enumerate() {
            if other_offset != offset && other.coords().any(|c| hole_shell.contains(&Point::from(*c))) {
                return Err(TopologyIssue::NestedHoles {
                    outer: idx,
                    inner: other_offset + 1,
                });
            }
        }
    }

    Ok(())
}

/// Re-node through a union with the empty set and keep the dominant component.
fn repair(polygon: &Polygon<f64>) -> Option<Polygon<f64>> {
    let subject = MultiPolygon::new(vec![polygon.clone()]);
    let renoded = subject.union(&MultiPolygon::<f64>::new(Vec::new()));

    let mut best: Option<(f64, Polygon<f64>)> = None;
    for candidate in renoded.0 {
        let area = candidate.unsigned_area();
        if area <= 0.0 {
            continue;
        }
        match &best {
            Some((best_area, _)) if *best_area >= area => {}
            _ => best = Some((area, candidate)),
        }
    }
    best.map(|(_, polygon)| polygon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};

    fn square() -> Polygon<f64> {
        polygon![
            (x: -51.30, y: -30.05),
            (x: -51.20, y: -30.05),
            (x: -51.20, y: -29.95),
            (x: -51.30, y: -29.95),
        ]
    }

    fn bowtie() -> Polygon<f64> {
        polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 2.0),
            (x: 2.0, y: 0.0),
            (x: 0.0, y: 2.0),
        ]
    }

    #[test]
    fn test_valid_polygon_is_returned_unchanged() {
        let validator = GeometryValidator::new();
        let outcome = validator.validate_polygon(square());
        assert_eq!(outcome, ValidationOutcome::Valid(square()));
    }

    #[test]
    fn test_revalidation_is_identity() {
        let validator = GeometryValidator::new();
        let once = validator.validate_polygon(bowtie()).into_geometry().unwrap();
        let twice = validator.validate_polygon(once.clone());
        assert_eq!(twice, ValidationOutcome::Valid(once));
    }

    #[test]
    fn test_self_intersection_is_detected_and_repaired() {
        assert_eq!(
            check_polygon(&bowtie()),
            Err(TopologyIssue::SelfIntersection { ring: 0 })
        );

        let validator = GeometryValidator::new();
        match validator.validate_polygon(bowtie()) {
            ValidationOutcome::Repaired(repaired) => {
                assert!(check_polygon(&repaired).is_ok());
                assert!(repaired.unsigned_area() > 0.0);
            }
            other => panic!("expected repair, got {:?}", other),
        }
    }

    #[test]
    fn test_degenerate_polygon_is_invalid() {
        let flat = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 2.0, y: 0.0),
        ];
        let validator = GeometryValidator::new();
        assert!(!validator.validate_polygon(flat).is_usable());
    }

    #[test]
    fn test_out_of_bounds_is_not_repaired() {
        let swapped = polygon![
            (x: -30.05, y: -151.30),
            (x: -30.05, y: -151.20),
            (x: -29.95, y: -151.20),
        ];
        let validator = GeometryValidator::new();
        assert!(matches!(
            validator.validate_polygon(swapped),
            ValidationOutcome::Invalid(TopologyIssue::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_hole_outside_shell_is_flagged() {
        let shell = LineString::from(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]);
        let hole = LineString::from(vec![(5.0, 5.0), (6.0, 5.0), (6.0, 6.0), (5.0, 5.0)]);
        let polygon = Polygon::new(shell, vec![hole]);
        assert_eq!(
            check_polygon(&polygon),
            Err(TopologyIssue::HoleOutsideShell { ring: 1 })
        );
    }

    #[test]
    fn test_polygon_with_inner_hole_is_valid() {
        let shell = LineString::from(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]);
        let hole = LineString::from(vec![(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 2.0), (1.0, 1.0)]);
        assert!(check_polygon(&Polygon::new(shell, vec![hole])).is_ok());
    }

    #[test]
    fn test_repeated_vertices_are_tolerated() {
        let polygon = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 1.0),
        ];
        assert!(check_polygon(&polygon).is_ok());
    }

    #[test]
    fn test_empty_batch_yields_empty_result() {
        let validator = GeometryValidator::new();
        let outcomes = validator.validate_polygons(Vec::new());
        assert!(outcomes.is_empty());
        assert_eq!(ValidationReport::from_outcomes(&outcomes).total(), 0);
    }

    #[test]
    fn test_batch_report_counts_each_verdict() {
        let validator = GeometryValidator::new();
        let flat = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)];
        let outcomes = validator.validate_polygons(vec![square(), bowtie(), flat]);
        let report = ValidationReport::from_outcomes(&outcomes);
        assert_eq!(report, ValidationReport { valid: 1, repaired: 1, invalid: 1 });
    }

    #[test]
    fn test_point_validation() {
        let validator = GeometryValidator::new();
        assert!(validator.validate_point(point!(x: -51.25, y: -30.0)).is_usable());
        assert!(!validator.validate_point(point!(x: f64::NAN, y: 0.0)).is_usable());
        assert!(!validator.validate_point(point!(x: 0.0, y: 91.0)).is_usable());
    }
}
