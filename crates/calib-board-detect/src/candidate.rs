//! Marker candidates: progressive assembly state from 16 border points to a
//! placed board marker.

use nalgebra::{Point2, Vector2};

use calib_board::catalog::{self, Orientation};
use calib_board::{MarkerCoordinate, MarkerSign, MarkerType};
use calib_board_core::Point;

/// Sentinel for an unresolved point slot.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Marker-frame indices of the 16 border slots, walking the border
/// clockwise from the top-left corner.
///
/// ```text
/// border:            marker:
///  0  1  2  3  4      0  1  2  3  4
/// 15           5      5  6  7  8  9
/// 14           6     10 11 12 13 14
/// 13           7     15 16 17 18 19
/// 12 11 10  9  8     20 21 22 23 24
/// ```
const BORDER_TO_MARKER: [usize; 16] = [0, 1, 2, 3, 4, 9, 14, 19, 24, 23, 22, 21, 20, 15, 10, 5];

/// Marker-frame index of a border slot.
#[inline]
pub(crate) const fn border_slot_marker_index(index_in_border: usize) -> usize {
    BORDER_TO_MARKER[index_in_border]
}

/// A detection that may turn out to be a board marker.
///
/// Candidates are stored in a plain vector and reference each other by
/// index; removing one swaps the tail into the hole and patches every
/// back-reference. State only moves forward: border points, then the full
/// 25 points, then an identified id (canonical orientation), then a board
/// coordinate. A candidate failing any stage is removed.
#[derive(Clone, Debug)]
pub struct MarkerCandidate {
    point_indices: [u32; 25],
    sign: bool,
    marker_id: Option<usize>,
    coordinate: Option<MarkerCoordinate>,
    /// Neighbor candidate indices keyed by the edge direction.
    neighbors: [Option<usize>; 4],
}

impl MarkerCandidate {
    /// Builds a border-only candidate from 16 border point indices in
    /// walk order. The winding is normalized so the stored border runs
    /// clockwise in image space.
    pub fn from_border(border_indices: &[u32; 16], points: &[Point]) -> Self {
        let sign = points[border_indices[0] as usize].sign();

        debug_assert!(border_indices
            .iter()
            .all(|&index| points[index as usize].sign() == sign));

        let p0 = points[border_indices[0] as usize].observation;
        let p4 = points[border_indices[4] as usize].observation;
        let p12 = points[border_indices[12] as usize].observation;

        let direction_a = p4 - p0;
        let direction_b = p12 - p0;

        let counter_clockwise = cross(direction_a, direction_b) < 0.0;

        let point_indices = if counter_clockwise {
            border_to_marker_indices_ccw(border_indices)
        } else {
            border_to_marker_indices_cw(border_indices)
        };

        Self {
            point_indices,
            sign,
            marker_id: None,
            coordinate: None,
            neighbors: [None; 4],
        }
    }

    #[inline]
    pub fn sign(&self) -> bool {
        self.sign
    }

    #[inline]
    pub fn marker_id(&self) -> Option<usize> {
        self.marker_id
    }

    #[inline]
    pub fn coordinate(&self) -> Option<MarkerCoordinate> {
        self.coordinate
    }

    pub fn marker_type(&self) -> Option<MarkerType> {
        let id = self.marker_id?;
        Some(
            calib_board::Marker::new(id, MarkerSign::from_bool(self.sign)).marker_type(),
        )
    }

    pub fn set_coordinate(&mut self, coordinate: MarkerCoordinate) {
        debug_assert!(self.coordinate.is_none());
        self.coordinate = Some(coordinate);
    }

    /// Point index of a marker-frame slot, `INVALID_INDEX` if unresolved.
    #[inline]
    pub fn point_index(&self, index_in_marker: usize) -> u32 {
        self.point_indices[index_in_marker]
    }

    pub fn set_point_index(&mut self, index_in_marker: usize, point_index: u32) {
        self.point_indices[index_in_marker] = point_index;
    }

    /// Point index of a border slot (0..16, clockwise from top-left).
    #[inline]
    pub fn border_index(&self, index_in_border: usize) -> u32 {
        self.point_indices[BORDER_TO_MARKER[index_in_border]]
    }

    pub fn has_valid_border_indices(&self) -> bool {
        (0..16).all(|n| self.border_index(n) != INVALID_INDEX)
    }

    pub fn has_valid_indices(&self) -> bool {
        self.point_indices.iter().all(|&index| index != INVALID_INDEX)
    }

    /// Mean position of all resolved points.
    pub fn center(&self, points: &[Point]) -> Point2<f32> {
        let mut sum = Vector2::zeros();
        let mut count = 0usize;

        for &index in &self.point_indices {
            if index != INVALID_INDEX {
                sum += points[index as usize].observation.coords;
                count += 1;
            }
        }

        debug_assert!(count != 0);
        Point2::from(sum / count as f32)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = (Orientation, usize)> + '_ {
        Orientation::ALL
            .into_iter()
            .zip(self.neighbors)
            .filter_map(|(edge, neighbor)| neighbor.map(|index| (edge, index)))
    }

    pub fn has_neighbors(&self) -> bool {
        self.neighbors.iter().any(Option::is_some)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.iter().filter(|n| n.is_some()).count()
    }

    pub fn add_neighbor(&mut self, edge: Orientation, candidate_index: usize) {
        self.neighbors[edge.quarter_turns() as usize] = Some(candidate_index);
    }

    /// Edge through which this candidate sees the given neighbor.
    pub fn neighbor_direction(&self, candidate_index: usize) -> Option<Orientation> {
        self.neighbors()
            .find(|&(_, index)| index == candidate_index)
            .map(|(edge, _)| edge)
    }

    pub fn has_neighbor_with_marker_id(&self, candidates: &[MarkerCandidate]) -> bool {
        self.neighbors()
            .any(|(_, index)| candidates[index].marker_id.is_some())
    }

    /// Tests whether `other` is a direct grid neighbor by extending each of
    /// this candidate's four edges and matching the prediction against
    /// `other`'s corners. Returns (own edge, other's edge).
    pub fn find_neighbor_edge(
        &self,
        other: &MarkerCandidate,
        points: &[Point],
        max_distance_percentage: f32,
    ) -> Option<(Orientation, Orientation)> {
        if self.sign == other.sign {
            // grid neighbors always have opposite signs
            return None;
        }

        let at = |index_in_marker: usize| points[self.point_indices[index_in_marker] as usize].observation;

        let sqr_percentage = max_distance_percentage * max_distance_percentage;

        // One prediction pair per edge: both corners pushed outward by one
        // row/column step.
        let edges = [
            (Orientation::Deg0, at(0) - at(5), at(0), at(4) - at(9), at(4)),
            (Orientation::Deg270, at(4) - at(3), at(4), at(24) - at(23), at(24)),
            (Orientation::Deg180, at(24) - at(19), at(24), at(20) - at(15), at(20)),
            (Orientation::Deg90, at(20) - at(21), at(20), at(0) - at(1), at(0)),
        ];

        for (local_edge, offset_a, corner_a, offset_b, corner_b) in edges {
            let predicted_a = corner_a + offset_a;
            let predicted_b = corner_b + offset_b;

            let max_sqr_a = offset_a.norm_squared() * sqr_percentage;
            let max_sqr_b = offset_b.norm_squared() * sqr_percentage;

            if let Some(neighbor_edge) =
                other.edge_facing(predicted_a, predicted_b, points, max_sqr_a, max_sqr_b)
            {
                return Some((local_edge, neighbor_edge));
            }
        }

        None
    }

    /// Which of this candidate's edges faces a pair of predicted corner
    /// positions.
    fn edge_facing(
        &self,
        predicted_a: Point2<f32>,
        predicted_b: Point2<f32>,
        points: &[Point],
        max_sqr_a: f32,
        max_sqr_b: f32,
    ) -> Option<Orientation> {
        let at = |index_in_marker: usize| points[self.point_indices[index_in_marker] as usize].observation;

        let p0 = at(0);
        let p4 = at(4);
        let p20 = at(20);
        let p24 = at(24);

        let close = |prediction: Point2<f32>, corner: Point2<f32>, max_sqr: f32| {
            (prediction - corner).norm_squared() <= max_sqr
        };

        // The caller predicted two corners beyond one of its own edges; the
        // matching pair of our corners names the edge we face it through.
        if close(predicted_a, p20, max_sqr_a) && close(predicted_b, p24, max_sqr_b) {
            return Some(Orientation::Deg180);
        }

        if close(predicted_a, p0, max_sqr_a) && close(predicted_b, p20, max_sqr_b) {
            return Some(Orientation::Deg90);
        }

        if close(predicted_a, p4, max_sqr_a) && close(predicted_b, p0, max_sqr_b) {
            return Some(Orientation::Deg0);
        }

        if close(predicted_a, p24, max_sqr_a) && close(predicted_b, p4, max_sqr_b) {
            return Some(Orientation::Deg270);
        }

        None
    }

    /// Identifies the marker id from the point signs and rotates the
    /// candidate into the catalog's canonical orientation.
    pub fn determine_marker_id(&mut self, points: &[Point]) -> bool {
        debug_assert!(self.has_valid_indices());
        debug_assert!(self.marker_id.is_none());

        let mut positive = 0usize;
        for &index in &self.point_indices {
            if points[index as usize].sign() {
                positive += 1;
            }
        }
        let negative = 25 - positive;

        if positive == 0 || negative == 0 {
            // a marker always toggles at least one dot
            return false;
        }

        if positive > 4 && negative > 4 {
            return false;
        }

        let majority_sign = negative < positive;

        let mut layout: catalog::Layout = [1; 25];
        for (index_in_marker, &index) in self.point_indices.iter().enumerate() {
            if points[index as usize].sign() != majority_sign {
                layout[index_in_marker] = 0;
            }
        }

        for (marker_id, reference) in catalog::catalog().iter().enumerate() {
            if let Some(orientation) = catalog::rotation_between(reference, &layout, true) {
                self.rotate_clockwise_quarters(-(orientation.quarter_turns() as i32));
                self.marker_id = Some(marker_id);
                return true;
            }
        }

        false
    }

    /// Rotates the point slots and the neighbor map clockwise by quarter
    /// turns (negative for counter-clockwise).
    pub fn rotate_clockwise_quarters(&mut self, quarter_turns: i32) {
        match quarter_turns.rem_euclid(4) {
            0 => {}
            1 => self.point_indices = rotate_indices_cw_90(&self.point_indices),
            2 => self.point_indices = rotate_indices_180(&self.point_indices),
            3 => self.point_indices = rotate_indices_ccw_90(&self.point_indices),
            _ => unreachable!(),
        }

        if quarter_turns.rem_euclid(4) != 0 {
            let mut rotated: [Option<usize>; 4] = [None; 4];

            for (edge, neighbor) in self.neighbors() {
                let turned = (edge.quarter_turns() as i32 - quarter_turns).rem_euclid(4);
                rotated[turned as usize] = Some(neighbor);
            }

            self.neighbors = rotated;
        }
    }

    /// Removes one candidate, swapping the tail into the hole and fixing
    /// every neighbor index that referenced the moved tail.
    pub fn remove_candidate(candidates: &mut Vec<MarkerCandidate>, index: usize) {
        debug_assert!(index < candidates.len());

        if candidates.len() == 1 {
            candidates.clear();
            return;
        }

        let back_index = candidates.len() - 1;

        for candidate in candidates.iter_mut() {
            for slot in &mut candidate.neighbors {
                match *slot {
                    Some(neighbor) if neighbor == index => *slot = None,
                    Some(neighbor) if neighbor == back_index => *slot = Some(index),
                    _ => {}
                }
            }
        }

        candidates.swap_remove(index);
    }
}

#[inline]
fn cross(a: Vector2<f32>, b: Vector2<f32>) -> f32 {
    a.x * b.y - a.y * b.x
}

fn border_to_marker_indices_cw(border: &[u32; 16]) -> [u32; 25] {
    const I: u32 = INVALID_INDEX;
    [
        border[0], border[1], border[2], border[3], border[4], //
        border[15], I, I, I, border[5], //
        border[14], I, I, I, border[6], //
        border[13], I, I, I, border[7], //
        border[12], border[11], border[10], border[9], border[8],
    ]
}

fn border_to_marker_indices_ccw(border: &[u32; 16]) -> [u32; 25] {
    const I: u32 = INVALID_INDEX;
    [
        border[0], border[15], border[14], border[13], border[12], //
        border[1], I, I, I, border[11], //
        border[2], I, I, I, border[10], //
        border[3], I, I, I, border[9], //
        border[4], border[5], border[6], border[7], border[8],
    ]
}

fn rotate_indices_cw_90(indices: &[u32; 25]) -> [u32; 25] {
    [
        indices[20], indices[15], indices[10], indices[5], indices[0], //
        indices[21], indices[16], indices[11], indices[6], indices[1], //
        indices[22], indices[17], indices[12], indices[7], indices[2], //
        indices[23], indices[18], indices[13], indices[8], indices[3], //
        indices[24], indices[19], indices[14], indices[9], indices[4],
    ]
}

fn rotate_indices_180(indices: &[u32; 25]) -> [u32; 25] {
    let mut rotated = [0u32; 25];
    for n in 0..25 {
        rotated[n] = indices[24 - n];
    }
    rotated
}

fn rotate_indices_ccw_90(indices: &[u32; 25]) -> [u32; 25] {
    [
        indices[4], indices[9], indices[14], indices[19], indices[24], //
        indices[3], indices[8], indices[13], indices[18], indices[23], //
        indices[2], indices[7], indices[12], indices[17], indices[22], //
        indices[1], indices[6], indices[11], indices[16], indices[21], //
        indices[0], indices[5], indices[10], indices[15], indices[20],
    ]
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Identified candidate stub: every point slot references one
    /// synthetic point, enough for locator and bootstrap unit tests.
    pub(crate) fn identified_candidate(
        marker_id: usize,
        sign: bool,
        point_index: u32,
    ) -> MarkerCandidate {
        MarkerCandidate {
            point_indices: [point_index; 25],
            sign,
            marker_id: Some(marker_id),
            coordinate: None,
            neighbors: [None; 4],
        }
    }
}
