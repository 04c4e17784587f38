use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::board::{Board, BoardError};
use crate::catalog::MARKER_POINTS;
use crate::marker::MarkerCoordinate;

/// Fraction of one marker size left blank around the marker grid on a
/// printed board.
pub const PADDING_FACTOR: f64 = 0.1;

/// Identifies one marker dot on the board: grid cell plus dot index 0..24.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPointId {
    pub coordinate: MarkerCoordinate,
    pub index_in_marker: u8,
}

impl ObjectPointId {
    pub fn new(coordinate: MarkerCoordinate, index_in_marker: usize) -> Self {
        debug_assert!(index_in_marker < MARKER_POINTS);
        Self {
            coordinate,
            index_in_marker: index_in_marker as u8,
        }
    }
}

/// A [`Board`] with physical marker sizes, placed in its xz-plane with the
/// origin at the board center and the y-axis pointing out of the board.
#[derive(Clone, Debug)]
pub struct MetricBoard {
    board: Board,
    x_marker_size: f64,
    z_marker_size: f64,
}

impl MetricBoard {
    /// Board with explicit per-marker sizes in meters.
    pub fn new(board: Board, x_marker_size: f64, z_marker_size: f64) -> Result<Self, BoardError> {
        if !(x_marker_size > 0.0) || !(z_marker_size > 0.0) {
            return Err(BoardError::InvalidSize);
        }

        Ok(Self {
            board,
            x_marker_size,
            z_marker_size,
        })
    }

    /// Board sized from the measured extent of the printed marker area
    /// including the padding border.
    pub fn from_measured_size(
        board: Board,
        measured_width: f64,
        measured_height: f64,
    ) -> Result<Self, BoardError> {
        if !(measured_width > 0.0) || !(measured_height > 0.0) {
            return Err(BoardError::InvalidSize);
        }

        let x_marker_size = measured_width / (board.x_markers() as f64 + PADDING_FACTOR * 2.0);
        let z_marker_size = measured_height / (board.y_markers() as f64 + PADDING_FACTOR * 2.0);

        log::debug!(
            "measured board marker size: {:.1}mm x {:.1}mm",
            x_marker_size * 1000.0,
            z_marker_size * 1000.0
        );

        let aspect_ratio = x_marker_size / z_marker_size;
        if !(0.99..=1.01).contains(&aspect_ratio) {
            log::warn!("marker cells are not square, aspect ratio {aspect_ratio:.3}:1");
        }

        Self::new(board, x_marker_size, z_marker_size)
    }

    /// Generates a board and applies per-marker sizes in one step.
    pub fn generate(
        seed: u32,
        x_markers: u32,
        y_markers: u32,
        x_marker_size: f64,
        z_marker_size: f64,
    ) -> Result<Self, BoardError> {
        let board = Board::generate(seed, x_markers, y_markers)?;
        Self::new(board, x_marker_size, z_marker_size)
    }

    #[inline]
    pub fn board(&self) -> &Board {
        &self.board
    }

    #[inline]
    pub fn x_marker_size(&self) -> f64 {
        self.x_marker_size
    }

    #[inline]
    pub fn z_marker_size(&self) -> f64 {
        self.z_marker_size
    }

    /// Physical width of the marker area (without padding).
    #[inline]
    pub fn markers_width(&self) -> f64 {
        self.board.x_markers() as f64 * self.x_marker_size
    }

    /// Physical height of the marker area (without padding).
    #[inline]
    pub fn markers_height(&self) -> f64 {
        self.board.y_markers() as f64 * self.z_marker_size
    }

    /// Center of a marker cell in board coordinates.
    pub fn marker_center(&self, coordinate: &MarkerCoordinate) -> Point3<f64> {
        let x = (coordinate.x as f64 + 0.5) * self.x_marker_size - self.markers_width() / 2.0;
        let z = (coordinate.y as f64 + 0.5) * self.z_marker_size - self.markers_height() / 2.0;

        Point3::new(x, 0.0, z)
    }

    /// 3D object point of one marker dot.
    pub fn object_point(&self, coordinate: &MarkerCoordinate, index_in_marker: usize) -> Point3<f64> {
        let center = self.marker_center(coordinate);

        self.board.marker(coordinate).object_point(
            &center,
            self.x_marker_size,
            self.z_marker_size,
            index_in_marker,
        )
    }

    /// All 25 object points per marker with their ids, row-major over the
    /// grid and dot indices.
    pub fn object_points(&self) -> (Vec<Point3<f64>>, Vec<ObjectPointId>) {
        let mut points = Vec::with_capacity(self.board.point_count());
        let mut ids = Vec::with_capacity(self.board.point_count());

        for y in 0..self.board.y_markers() {
            for x in 0..self.board.x_markers() {
                let coordinate = MarkerCoordinate::new(x, y);

                for index_in_marker in 0..MARKER_POINTS {
                    points.push(self.object_point(&coordinate, index_in_marker));
                    ids.push(ObjectPointId::new(coordinate, index_in_marker));
                }
            }
        }

        (points, ids)
    }
}

/// Marker grid filling a printed page of the given physical size.
///
/// `margin` is subtracted on every side; the padding border scales with the
/// marker size.
pub fn optimal_marker_grid_for_paper(
    paper_width: f64,
    paper_height: f64,
    min_marker_size: f64,
    margin: f64,
) -> Option<(u32, u32)> {
    if !(min_marker_size > 0.0) {
        return None;
    }

    let content_width = paper_width - margin * 2.0;
    let content_height = paper_height - margin * 2.0;

    let min_content = min_marker_size * (1.0 + PADDING_FACTOR * 2.0);
    if content_width < min_content || content_height < min_content {
        return None;
    }

    let x_markers = (content_width - min_marker_size * 2.0 * PADDING_FACTOR) / min_marker_size;
    let y_markers = (content_height - min_marker_size * 2.0 * PADDING_FACTOR) / min_marker_size;

    if x_markers < 1.0 || y_markers < 1.0 {
        return None;
    }

    Some((x_markers as u32, y_markers as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::catalog::Orientation;

    #[test]
    fn center_marker_center_dot_is_the_origin() {
        // 3x3 board: the middle marker's middle dot sits at the board origin.
        let board = MetricBoard::generate(0, 3, 3, 0.030, 0.030).unwrap();

        let p = board.object_point(&MarkerCoordinate::new(1, 1), 12);
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn measured_size_recovers_marker_size() {
        let board = Board::generate(0, 8, 13).unwrap();

        // 25 mm markers plus a 10% padding border on each side.
        let width = 0.025 * (8.0 + 0.2);
        let height = 0.025 * (13.0 + 0.2);

        let metric = MetricBoard::from_measured_size(board, width, height).unwrap();
        assert_relative_eq!(metric.x_marker_size(), 0.025, epsilon = 1e-9);
        assert_relative_eq!(metric.z_marker_size(), 0.025, epsilon = 1e-9);
    }

    #[test]
    fn object_points_cover_the_marker_area() {
        let metric = MetricBoard::generate(3, 4, 2, 0.02, 0.02).unwrap();
        let (points, ids) = metric.object_points();

        assert_eq!(points.len(), 4 * 2 * 25);
        assert_eq!(ids.len(), points.len());

        let half_width = metric.markers_width() / 2.0;
        let half_height = metric.markers_height() / 2.0;

        for point in &points {
            assert!(point.x.abs() <= half_width);
            assert!(point.z.abs() <= half_height);
            assert_relative_eq!(point.y, 0.0);
        }
    }

    #[test]
    fn object_points_respect_marker_orientation() {
        let metric = MetricBoard::generate(11, 4, 4, 0.03, 0.03).unwrap();

        // Index 4 (top-right dot in the unoriented frame) must land on a
        // different corner depending on the marker orientation.
        for marker in metric.board().markers() {
            let center = metric.marker_center(&marker.coordinate);
            let dot = metric.object_point(&marker.coordinate, 4);
            let offset = dot - center;

            let step = 2.0 * 0.03 / 5.0;
            let expected = match marker.orientation {
                Orientation::Deg0 => (step, -step),
                Orientation::Deg90 => (-step, -step),
                Orientation::Deg180 => (-step, step),
                Orientation::Deg270 => (step, step),
            };

            assert_relative_eq!(offset.x, expected.0, epsilon = 1e-12);
            assert_relative_eq!(offset.z, expected.1, epsilon = 1e-12);
        }
    }

    #[test]
    fn paper_grid_requires_enough_space() {
        // A4 portrait with 30 mm markers and 6 mm margins.
        let grid = optimal_marker_grid_for_paper(0.210, 0.297, 0.030, 0.006).unwrap();
        assert_eq!(grid, (6, 9));

        assert!(optimal_marker_grid_for_paper(0.02, 0.02, 0.030, 0.006).is_none());
    }
}
