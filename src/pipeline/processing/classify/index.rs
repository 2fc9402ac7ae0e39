//! R-tree of hazard polygon bounding boxes for candidate pruning.

use geo::{BoundingRect, Point};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;

use crate::domain::HazardArea;

type IndexedBox = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Bounding-box index over a slice of hazard areas; entries carry the slice position.
pub struct HazardIndex {
    tree: RTree<IndexedBox>,
}

impl HazardIndex {
    pub fn build(areas: &[HazardArea]) -> Self {
        let boxes: Vec<IndexedBox> = areas
            .iter()
            .enumerate()
            .filter_map(|(position, area)| {
                let rect = area.geometry.bounding_rect()?;
                let min = rect.min();
                let max = rect.max();
                Some(GeomWithData::new(
                    Rectangle::from_corners([min.x, min.y], [max.x, max.y]),
                    position,
                ))
            })
            .collect();
        Self {
            tree: RTree::bulk_load(boxes),
        }
    }

    /// Positions of areas whose bounding box contains `point` (edges included), ascending.
    pub fn candidates(&self, point: &Point<f64>) -> Vec<usize> {
        let mut positions: Vec<usize> = self
            .tree
            .locate_all_at_point(&[point.x(), point.y()])
            .map(|entry| entry.data)
            .collect();
        positions.sort_unstable();
        positions
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}
