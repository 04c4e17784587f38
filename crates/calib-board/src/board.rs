use std::collections::{HashMap, HashSet};

use log::debug;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::catalog::{self, Orientation};
use crate::marker::{BoardMarker, MarkerCoordinate, MarkerSign, MarkerType};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BoardError {
    #[error("x_markers and y_markers must be >= 1")]
    InvalidSize,
    #[error("no neighborhood-unique marker assignment exists for this seed and size")]
    GenerationFailed,
}

/// Up to four board cells sharing one marker type.
///
/// Fixed capacity plus length; a board never places the same (id, sign)
/// more than four times because each orientation of an id is used at most
/// once per sign.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CoordinateSlots {
    slots: [MarkerCoordinate; 4],
    len: usize,
}

impl CoordinateSlots {
    fn push(&mut self, coordinate: MarkerCoordinate) {
        assert!(self.len < self.slots.len(), "marker type placed too often");
        self.slots[self.len] = coordinate;
        self.len += 1;
    }

    pub fn as_slice(&self) -> &[MarkerCoordinate] {
        &self.slots[..self.len]
    }
}

/// Overlap counters between the oriented neighborhoods of two boards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UniquenessReport {
    /// Marker/neighbor pairs of board B whose oriented pair value also
    /// occurs in board A.
    pub one_identical_neighbor: usize,
    /// Markers of board B with at least two such neighbors.
    pub two_identical_neighbors: usize,
    /// Markers of board B with at least three such neighbors.
    pub three_identical_neighbors: usize,
}

/// A grid of oriented markers whose 4-neighborhoods are unique.
///
/// Invariant: for every pair of 4-neighboring markers, the combination of
/// both marker types and their mutual edge orientations occurs exactly once
/// on the board (in both traversal directions), which lets a detected local
/// patch identify its absolute grid cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Board {
    x_markers: u32,
    y_markers: u32,
    markers: Vec<BoardMarker>,
    type_index: HashMap<MarkerType, CoordinateSlots>,
    hash: u64,
}

impl Board {
    /// Builds a board from explicit markers (row-major, one per grid cell).
    pub fn new(x_markers: u32, y_markers: u32, markers: Vec<BoardMarker>) -> Result<Self, BoardError> {
        if x_markers == 0 || y_markers == 0 {
            return Err(BoardError::InvalidSize);
        }
        if markers.len() != x_markers as usize * y_markers as usize {
            return Err(BoardError::InvalidSize);
        }

        let mut type_index: HashMap<MarkerType, CoordinateSlots> = HashMap::new();
        for marker in &markers {
            type_index
                .entry(marker.marker_type())
                .or_default()
                .push(marker.coordinate);
        }

        let mut board = Self {
            x_markers,
            y_markers,
            markers,
            type_index,
            hash: 0,
        };
        board.hash = board_hash(&board);

        Ok(board)
    }

    /// Generates a neighborhood-unique board from a seed.
    ///
    /// The same seed and dimensions always produce the same board.
    pub fn generate(seed: u32, x_markers: u32, y_markers: u32) -> Result<Self, BoardError> {
        if x_markers == 0 || y_markers == 0 {
            return Err(BoardError::InvalidSize);
        }

        let markers = create_unique_board_markers(seed, x_markers, y_markers)?;
        Self::new(x_markers, y_markers, markers)
    }

    #[inline]
    pub fn x_markers(&self) -> u32 {
        self.x_markers
    }

    #[inline]
    pub fn y_markers(&self) -> u32 {
        self.y_markers
    }

    #[inline]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Total number of marker dots on the board.
    #[inline]
    pub fn point_count(&self) -> usize {
        self.markers.len() * catalog::MARKER_POINTS
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn marker(&self, coordinate: &MarkerCoordinate) -> &BoardMarker {
        debug_assert!(coordinate.x < self.x_markers && coordinate.y < self.y_markers);
        &self.markers[coordinate.y as usize * self.x_markers as usize + coordinate.x as usize]
    }

    #[inline]
    pub fn marker_at(&self, x: u32, y: u32) -> &BoardMarker {
        self.marker(&MarkerCoordinate::new(x, y))
    }

    pub fn markers(&self) -> &[BoardMarker] {
        &self.markers
    }

    /// Board cells carrying the given marker type, at most four.
    pub fn type_coordinates(&self, marker_type: MarkerType) -> &[MarkerCoordinate] {
        self.type_index
            .get(&marker_type)
            .map(CoordinateSlots::as_slice)
            .unwrap_or(&[])
    }

    /// Overlap of oriented neighbor-pair values between two boards.
    ///
    /// Also verifies board A's uniqueness invariant: every oriented pair
    /// value must occur exactly twice (once per traversal direction).
    pub fn determine_uniqueness(a: &Board, b: &Board) -> Result<UniquenessReport, BoardError> {
        let mut values_a: HashMap<u64, u32> = HashMap::new();

        a.for_each_neighbor_pair(|marker, neighbor| {
            *values_a
                .entry(oriented_neighbor_value(marker, neighbor))
                .or_insert(0) += 1;
        });

        if values_a.values().any(|&count| count != 2) {
            return Err(BoardError::GenerationFailed);
        }

        let mut report = UniquenessReport::default();

        for y in 0..b.y_markers {
            for x in 0..b.x_markers {
                let marker = b.marker_at(x, y);

                let mut local = 0usize;

                for direction in Orientation::ALL {
                    let Some(neighbor_coordinate) =
                        marker.coordinate.neighbor(direction, b.x_markers, b.y_markers)
                    else {
                        continue;
                    };

                    let neighbor = b.marker(&neighbor_coordinate);

                    if values_a.contains_key(&oriented_neighbor_value(marker, neighbor)) {
                        report.one_identical_neighbor += 1;
                        local += 1;
                    }
                }

                if local >= 2 {
                    report.two_identical_neighbors += 1;
                }
                if local >= 3 {
                    report.three_identical_neighbors += 1;
                }
            }
        }

        Ok(report)
    }

    fn for_each_neighbor_pair(&self, mut f: impl FnMut(&BoardMarker, &BoardMarker)) {
        for y in 0..self.y_markers {
            for x in 0..self.x_markers {
                let marker = self.marker_at(x, y);

                for direction in Orientation::ALL {
                    if let Some(neighbor_coordinate) =
                        marker
                            .coordinate
                            .neighbor(direction, self.x_markers, self.y_markers)
                    {
                        f(marker, self.marker(&neighbor_coordinate));
                    }
                }
            }
        }
    }
}

/// Grid dimensions closest to an aspect ratio with at least `min_markers`
/// cells.
pub fn optimal_marker_grid(aspect_ratio: f64, min_markers: usize) -> Option<(u32, u32)> {
    if !(aspect_ratio > 1e-12) || min_markers == 0 {
        return None;
    }

    let y_base = (min_markers as f64 / aspect_ratio).sqrt().floor().max(1.0);
    let x_base = (aspect_ratio * (min_markers as f64 / aspect_ratio).sqrt())
        .floor()
        .max(1.0);

    let mut best: Option<(u32, u32)> = None;
    let mut best_ratio = f64::MAX;

    for option in 0..4u32 {
        let x_candidate = x_base as u32 + (option & 1);
        let y_candidate = y_base as u32 + ((option >> 1) & 1);

        if (x_candidate as usize) * (y_candidate as usize) < min_markers {
            continue;
        }

        if let Some((x, y)) = best {
            if x <= x_candidate && y <= y_candidate {
                break;
            }
        }

        let ratio = x_candidate as f64 / y_candidate as f64;

        if best.is_none() || (ratio - aspect_ratio).abs() < (best_ratio - aspect_ratio).abs() {
            best_ratio = ratio;
            best = Some((x_candidate, y_candidate));
        }
    }

    best.filter(|(x, y)| (*x as usize) * (*y as usize) >= min_markers)
}

/// Vertical marker count matching an aspect ratio for a fixed width.
pub fn optimal_marker_grid_for_width(aspect_ratio: f64, x_markers: u32) -> Option<u32> {
    if !(aspect_ratio > 1e-12) || x_markers == 0 {
        return None;
    }

    Some(((x_markers as f64 / aspect_ratio).round() as u32).max(1))
}

/// Order-independent value identifying an unordered pair of values.
#[inline]
fn unordered_pair_value(a: u32, b: u32) -> u64 {
    if a < b {
        (b as u64) << 32 | a as u64
    } else {
        (a as u64) << 32 | b as u64
    }
}

/// Unique value of an oriented marker/neighbor pair: both types combined
/// with the edge orientation each marker sees the other through.
pub fn oriented_neighbor_value(marker: &BoardMarker, neighbor: &BoardMarker) -> u64 {
    debug_assert!(marker.marker.sign != neighbor.marker.sign);

    let absolute = marker
        .coordinate
        .direction_to(&neighbor.coordinate)
        .expect("markers must be 4-neighbors");

    let relative_edge = marker.orientation.minus(absolute);
    let neighbor_relative_edge = neighbor.orientation.minus(absolute.opposite());

    let value = marker.marker_type().0 << 2 | relative_edge.quarter_turns() as u32;
    let neighbor_value =
        neighbor.marker_type().0 << 2 | neighbor_relative_edge.quarter_turns() as u32;

    unordered_pair_value(value, neighbor_value)
}

fn create_unique_board_markers(
    seed: u32,
    x_markers: u32,
    y_markers: u32,
) -> Result<Vec<BoardMarker>, BoardError> {
    let marker_ids = catalog::marker_id_count() as u32;

    // One option per (id, orientation) pair and sign; every option is
    // consumed at most once, bounding each marker type to four cells.
    let all_options: Vec<u32> = (0..marker_ids)
        .flat_map(|id| (0..4u32).map(move |orientation| id << 2 | orientation))
        .collect();

    let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);

    let mut normal_options = all_options.clone();
    let mut inverted_options = all_options;

    normal_options.shuffle(&mut rng);
    inverted_options.shuffle(&mut rng);

    let mut neighbor_values: HashSet<u64> =
        HashSet::with_capacity(x_markers as usize * y_markers as usize * 4);

    let mut markers: Vec<BoardMarker> =
        Vec::with_capacity(x_markers as usize * y_markers as usize);

    let mut row_start_normal = true;

    for y in 0..y_markers {
        let mut normal = row_start_normal;

        for x in 0..x_markers {
            let options = if normal {
                &mut normal_options
            } else {
                &mut inverted_options
            };

            let mut chosen = None;

            for (option_index, &option) in options.iter().enumerate() {
                let marker_id = option >> 2;

                let mut left_value = None;
                let mut top_value = None;

                if x > 0 {
                    let left = &markers[markers.len() - 1];
                    let value = unordered_pair_value(marker_id, left.marker.id as u32);
                    if neighbor_values.contains(&value) {
                        continue;
                    }
                    left_value = Some(value);
                }

                if y > 0 {
                    let top = &markers[(x + (y - 1) * x_markers) as usize];
                    let value = unordered_pair_value(marker_id, top.marker.id as u32);
                    if neighbor_values.contains(&value) {
                        continue;
                    }
                    top_value = Some(value);
                }

                if let Some(value) = left_value {
                    neighbor_values.insert(value);
                }
                if let Some(value) = top_value {
                    neighbor_values.insert(value);
                }

                chosen = Some((option_index, option));
                break;
            }

            let Some((option_index, option)) = chosen else {
                debug!("board generation exhausted marker options at ({x}, {y})");
                return Err(BoardError::GenerationFailed);
            };

            let marker_id = (option >> 2) as usize;
            let orientation = Orientation::from_quarter_turns((option & 3) as u8);

            markers.push(BoardMarker::new(
                marker_id,
                MarkerSign::from_bool(normal),
                orientation,
                MarkerCoordinate::new(x, y),
            ));

            normal = !normal;

            options.swap_remove(option_index);
        }

        row_start_normal = !row_start_normal;
    }

    Ok(markers)
}

/// Hash over the board dimensions and every marker placement.
fn board_hash(board: &Board) -> u64 {
    const GOLDEN: u64 = 0x9e37_79b9;

    #[inline]
    fn scramble(value: u64) -> u64 {
        // Fibonacci hashing of the raw value.
        value.wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }

    let mut hash = GOLDEN;
    let mut mix = |value: u64| {
        hash ^= scramble(value)
            .wrapping_add(GOLDEN)
            .wrapping_add(hash << 6)
            .wrapping_add(hash >> 2);
    };

    mix(board.x_markers as u64);
    mix(board.y_markers as u64);

    for marker in &board.markers {
        mix(marker.marker.id as u64);
        mix(u64::from(marker.marker.sign.is_normal()));
        mix(marker.orientation.degrees() as u64);
        mix(marker.coordinate.x as u64);
        mix(marker.coordinate.y as u64);
    }

    hash
}
