//! Locating identified marker candidates on the board.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use calib_board::{Board, MarkerCoordinate, Orientation};
use calib_board_core::Point;

use crate::candidate::MarkerCandidate;

/// Tuning knobs of board localization.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Minimal number of identified neighbors a candidate needs before it
    /// can be matched against the board.
    pub min_identified_neighbors: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            min_identified_neighbors: 1,
        }
    }
}

/// Board coordinate of one candidate, derived from its type and its
/// identified neighbors.
///
/// The candidate's type narrows the search to at most four board cells;
/// each identified neighbor must then agree on type and on both relative
/// edge orientations. The board's neighborhood uniqueness guarantees at
/// most one consistent cell.
pub fn locate_candidate(
    board: &Board,
    candidates: &[MarkerCandidate],
    candidate_index: usize,
    config: &LocatorConfig,
) -> Option<(MarkerCoordinate, Vec<(Orientation, MarkerCoordinate)>)> {
    let candidate = &candidates[candidate_index];
    let candidate_type = candidate.marker_type()?;

    let mut matched_neighbors = Vec::with_capacity(4);

    'slots: for &slot in board.type_coordinates(candidate_type) {
        let board_marker = board.marker(&slot);

        matched_neighbors.clear();

        let mut expected_matches = 0usize;

        for (edge, neighbor_index) in candidate.neighbors() {
            let neighbor_candidate = &candidates[neighbor_index];

            let Some(neighbor_type) = neighbor_candidate.marker_type() else {
                // an unidentified neighbor carries no information
                continue;
            };

            expected_matches += 1;

            let Some(neighbor_coordinate) =
                board_marker.neighbor_coordinate(edge, board.x_markers(), board.y_markers())
            else {
                continue 'slots;
            };

            let neighbor_board_marker = board.marker(&neighbor_coordinate);

            if neighbor_board_marker.marker_type() != neighbor_type {
                continue 'slots;
            }

            // Both markers must also agree on the edge the neighbor sees
            // this candidate through.
            let board_back_edge = neighbor_board_marker.neighbor_direction(board_marker);
            let candidate_back_edge = neighbor_candidate
                .neighbor_direction(candidate_index)
                .expect("neighbor links are symmetric");

            if board_back_edge != candidate_back_edge {
                continue 'slots;
            }

            matched_neighbors.push((edge, neighbor_coordinate));
        }

        if expected_matches >= config.min_identified_neighbors.max(1)
            && matched_neighbors.len() == expected_matches
        {
            return Some((slot, std::mem::take(&mut matched_neighbors)));
        }
    }

    None
}

/// Assigns board coordinates to every candidate with enough identified
/// neighborhood. Returns the number of placed candidates.
pub fn locate_candidates(
    board: &Board,
    candidates: &mut Vec<MarkerCandidate>,
    config: &LocatorConfig,
) -> usize {
    let mut placed = 0usize;

    for candidate_index in 0..candidates.len() {
        if candidates[candidate_index].marker_id().is_none() {
            continue;
        }

        if !candidates[candidate_index].has_neighbor_with_marker_id(candidates) {
            continue;
        }

        if let Some((coordinate, _)) =
            locate_candidate(board, candidates, candidate_index, config)
        {
            candidates[candidate_index].set_coordinate(coordinate);
            placed += 1;
        }
    }

    placed
}

/// Seed for pose bootstrapping: the placed candidate with the most placed
/// neighbors, ties broken towards the image center.
///
/// Returns the seed index and its placed neighbor indices.
pub fn select_seed(
    candidates: &[MarkerCandidate],
    points: &[Point],
    image_width: u32,
    image_height: u32,
) -> Option<(usize, Vec<usize>)> {
    let image_center = Point2::new(image_width as f32 / 2.0, image_height as f32 / 2.0);

    let mut best_index = None;
    let mut best_neighbors: Vec<usize> = Vec::new();
    let mut best_sqr_distance = f32::MAX;

    for (candidate_index, candidate) in candidates.iter().enumerate() {
        if candidate.marker_id().is_none() || candidate.coordinate().is_none() {
            continue;
        }

        let placed_neighbors: Vec<usize> = candidate
            .neighbors()
            .filter(|&(_, index)| {
                candidates[index].marker_id().is_some() && candidates[index].coordinate().is_some()
            })
            .map(|(_, index)| index)
            .collect();

        if best_neighbors.len() <= placed_neighbors.len() {
            let sqr_distance = (candidate.center(points) - image_center).norm_squared();

            if best_neighbors.len() < placed_neighbors.len() || sqr_distance < best_sqr_distance {
                best_index = Some(candidate_index);
                best_neighbors = placed_neighbors;
                best_sqr_distance = sqr_distance;
            }
        }
    }

    best_index.map(|index| (index, best_neighbors))
}

/// Reusable board-sized bitmap tracking which grid cells are in use.
///
/// Cleared at the start of every image so no state leaks between frames.
#[derive(Clone, Debug, Default)]
pub struct CoordinateUsage {
    x_markers: u32,
    y_markers: u32,
    cells: Vec<bool>,
}

impl CoordinateUsage {
    pub fn reset(&mut self, x_markers: u32, y_markers: u32) {
        self.x_markers = x_markers;
        self.y_markers = y_markers;
        self.cells.clear();
        self.cells
            .resize(x_markers as usize * y_markers as usize, false);
    }

    #[inline]
    pub fn mark(&mut self, coordinate: &MarkerCoordinate) {
        let index = self.cell_index(coordinate);
        self.cells[index] = true;
    }

    #[inline]
    pub fn is_marked(&self, coordinate: &MarkerCoordinate) -> bool {
        self.cells[self.cell_index(coordinate)]
    }

    #[inline]
    fn cell_index(&self, coordinate: &MarkerCoordinate) -> usize {
        debug_assert!(coordinate.x < self.x_markers && coordinate.y < self.y_markers);
        coordinate.y as usize * self.x_markers as usize + coordinate.x as usize
    }

    pub fn marked_count(&self) -> usize {
        self.cells.iter().filter(|&&marked| marked).count()
    }

    /// Unmarked cells with at least one marked 4-neighbor.
    pub fn frontier(&self, out: &mut Vec<MarkerCoordinate>) {
        out.clear();

        for y in 0..self.y_markers {
            for x in 0..self.x_markers {
                let coordinate = MarkerCoordinate::new(x, y);

                if self.is_marked(&coordinate) {
                    continue;
                }

                let has_marked_neighbor = Orientation::ALL.into_iter().any(|direction| {
                    coordinate
                        .neighbor(direction, self.x_markers, self.y_markers)
                        .is_some_and(|neighbor| self.is_marked(&neighbor))
                });

                if has_marked_neighbor {
                    out.push(coordinate);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests_support::identified_candidate;
    use calib_board::MarkerSign;
    use nalgebra::Point2 as P2;

    /// Builds identified candidates for a connected patch of board cells,
    /// with neighbor links mirroring the board's ground truth.
    fn candidates_for_patch(
        board: &Board,
        patch: &[MarkerCoordinate],
        points: &mut Vec<Point>,
    ) -> Vec<MarkerCandidate> {
        let mut candidates: Vec<MarkerCandidate> = patch
            .iter()
            .map(|coordinate| {
                let marker = board.marker(coordinate);

                // One synthetic point per candidate keeps `center` usable.
                let point_index = points.len() as u32;
                points.push(Point::new(
                    P2::new(
                        100.0 + coordinate.x as f32 * 50.0,
                        100.0 + coordinate.y as f32 * 50.0,
                    ),
                    3,
                    if marker.marker.sign == MarkerSign::Normal {
                        40.0
                    } else {
                        -40.0
                    },
                ));

                identified_candidate(
                    marker.marker.id,
                    marker.marker.sign == MarkerSign::Normal,
                    point_index,
                )
            })
            .collect();

        for (a, coordinate_a) in patch.iter().enumerate() {
            for (b, coordinate_b) in patch.iter().enumerate().skip(a + 1) {
                if coordinate_a.direction_to(coordinate_b).is_none() {
                    continue;
                }

                let marker_a = board.marker(coordinate_a);
                let marker_b = board.marker(coordinate_b);

                candidates[a].add_neighbor(marker_a.neighbor_direction(marker_b), b);
                candidates[b].add_neighbor(marker_b.neighbor_direction(marker_a), a);
            }
        }

        candidates
    }

    #[test]
    fn patch_of_candidates_locates_itself() {
        let board = Board::generate(13, 6, 9).unwrap();

        let patch = [
            MarkerCoordinate::new(2, 3),
            MarkerCoordinate::new(3, 3),
            MarkerCoordinate::new(2, 4),
            MarkerCoordinate::new(3, 4),
        ];

        let mut points = Vec::new();
        let mut candidates = candidates_for_patch(&board, &patch, &mut points);

        let placed = locate_candidates(&board, &mut candidates, &LocatorConfig::default());
        assert_eq!(placed, patch.len());

        for (candidate, expected) in candidates.iter().zip(&patch) {
            assert_eq!(candidate.coordinate(), Some(*expected));
        }
    }

    #[test]
    fn lone_candidate_is_never_placed() {
        let board = Board::generate(2, 4, 4).unwrap();

        let patch = [MarkerCoordinate::new(1, 1)];
        let mut points = Vec::new();
        let mut candidates = candidates_for_patch(&board, &patch, &mut points);

        let placed = locate_candidates(&board, &mut candidates, &LocatorConfig::default());
        assert_eq!(placed, 0);
        assert_eq!(candidates[0].coordinate(), None);
    }

    #[test]
    fn inconsistent_neighbor_is_rejected() {
        let board = Board::generate(21, 5, 5).unwrap();

        let patch = [MarkerCoordinate::new(1, 1), MarkerCoordinate::new(2, 1)];
        let mut points = Vec::new();
        let mut candidates = candidates_for_patch(&board, &patch, &mut points);

        // Rebuild the neighbor with the correct type but the opposite back
        // edge. The true cell fails the edge check, and no other cell can
        // match because the id pair occurs only once on the board.
        let marker_a = *board.marker(&patch[0]);
        let marker_b = *board.marker(&patch[1]);

        candidates[1] = identified_candidate(
            marker_b.marker.id,
            marker_b.marker.sign == MarkerSign::Normal,
            1,
        );
        candidates[1].add_neighbor(marker_b.neighbor_direction(&marker_a).opposite(), 0);

        let config = LocatorConfig::default();
        assert!(locate_candidate(&board, &candidates, 0, &config).is_none());
    }

    #[test]
    fn seed_prefers_most_connected_then_central() {
        let board = Board::generate(13, 6, 9).unwrap();

        let patch = [
            MarkerCoordinate::new(2, 3),
            MarkerCoordinate::new(3, 3),
            MarkerCoordinate::new(2, 4),
            MarkerCoordinate::new(3, 4),
            MarkerCoordinate::new(2, 2),
        ];

        let mut points = Vec::new();
        let mut candidates = candidates_for_patch(&board, &patch, &mut points);
        locate_candidates(&board, &mut candidates, &LocatorConfig::default());

        let (seed, neighbors) = select_seed(&candidates, &points, 640, 480).unwrap();

        // Candidate 0 at (2,3) has three placed neighbors, more than any
        // other patch member.
        assert_eq!(seed, 0);
        assert_eq!(neighbors.len(), 3);
    }

    #[test]
    fn usage_frontier_grows_around_marked_cells() {
        let mut usage = CoordinateUsage::default();
        usage.reset(4, 3);

        usage.mark(&MarkerCoordinate::new(1, 1));

        let mut frontier = Vec::new();
        usage.frontier(&mut frontier);

        assert_eq!(frontier.len(), 4);
        assert!(frontier.contains(&MarkerCoordinate::new(1, 0)));
        assert!(frontier.contains(&MarkerCoordinate::new(0, 1)));
        assert!(frontier.contains(&MarkerCoordinate::new(2, 1)));
        assert!(frontier.contains(&MarkerCoordinate::new(1, 2)));

        for coordinate in &frontier {
            usage.mark(coordinate);
        }
        assert_eq!(usage.marked_count(), 5);

        usage.reset(4, 3);
        assert_eq!(usage.marked_count(), 0);
    }
}
