use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::catalog::{self, Orientation, MARKER_GRID, MARKER_POINTS};

/// Marker polarity: dark dots on bright background, or the complement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerSign {
    Normal,
    Inverted,
}

impl MarkerSign {
    #[inline]
    pub fn is_normal(self) -> bool {
        self == MarkerSign::Normal
    }

    pub fn from_bool(sign: bool) -> MarkerSign {
        if sign {
            MarkerSign::Normal
        } else {
            MarkerSign::Inverted
        }
    }
}

/// Compact identity of a marker ignoring position and orientation:
/// the catalog id combined with the sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerType(pub u32);

/// A catalog marker with a known sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub id: usize,
    pub sign: MarkerSign,
}

impl Marker {
    pub fn new(id: usize, sign: MarkerSign) -> Self {
        debug_assert!(id < catalog::marker_id_count());
        Self { id, sign }
    }

    #[inline]
    pub fn marker_type(&self) -> MarkerType {
        MarkerType((self.id as u32) << 1 | u32::from(self.sign.is_normal()))
    }
}

/// Grid cell of a marker on the board.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerCoordinate {
    pub x: u32,
    pub y: u32,
}

impl MarkerCoordinate {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Absolute direction from this cell towards a 4-neighbor cell.
    pub fn direction_to(&self, neighbor: &MarkerCoordinate) -> Option<Orientation> {
        let dx = neighbor.x as i64 - self.x as i64;
        let dy = neighbor.y as i64 - self.y as i64;

        match (dx, dy) {
            (0, -1) => Some(Orientation::Deg0),
            (-1, 0) => Some(Orientation::Deg90),
            (0, 1) => Some(Orientation::Deg180),
            (1, 0) => Some(Orientation::Deg270),
            _ => None,
        }
    }

    /// 4-neighbor cell in an absolute direction, bounded by the grid size.
    pub fn neighbor(
        &self,
        direction: Orientation,
        x_markers: u32,
        y_markers: u32,
    ) -> Option<MarkerCoordinate> {
        let (dx, dy): (i64, i64) = match direction {
            Orientation::Deg0 => (0, -1),
            Orientation::Deg90 => (-1, 0),
            Orientation::Deg180 => (0, 1),
            Orientation::Deg270 => (1, 0),
        };

        let x = self.x as i64 + dx;
        let y = self.y as i64 + dy;

        if x < 0 || y < 0 || x >= x_markers as i64 || y >= y_markers as i64 {
            return None;
        }

        Some(MarkerCoordinate::new(x as u32, y as u32))
    }
}

/// A marker placed on the board with an orientation and a grid cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMarker {
    pub marker: Marker,
    pub orientation: Orientation,
    pub coordinate: MarkerCoordinate,
}

impl BoardMarker {
    pub fn new(
        id: usize,
        sign: MarkerSign,
        orientation: Orientation,
        coordinate: MarkerCoordinate,
    ) -> Self {
        Self {
            marker: Marker::new(id, sign),
            orientation,
            coordinate,
        }
    }

    #[inline]
    pub fn marker_type(&self) -> MarkerType {
        self.marker.marker_type()
    }

    /// Dot sign addressed in the marker's own (oriented) frame.
    pub fn point_sign_oriented(&self, index_in_marker: usize) -> bool {
        catalog::layout_point_sign_by_index(
            self.marker.id,
            self.marker.sign.is_normal(),
            Orientation::Deg0,
            index_in_marker,
        )
    }

    /// Dot sign addressed in the board frame (the index is rotated by the
    /// marker orientation before the layout lookup).
    pub fn point_sign_unoriented(&self, index_in_marker: usize) -> bool {
        catalog::layout_point_sign_by_index(
            self.marker.id,
            self.marker.sign.is_normal(),
            self.orientation,
            index_in_marker,
        )
    }

    /// 3D object point of one marker dot around `marker_center`.
    ///
    /// The marker lies in the board's xz-plane; the dot offsets are rotated
    /// around the y-axis by the marker orientation. Quarter turns are exact.
    pub fn object_point(
        &self,
        marker_center: &Point3<f64>,
        x_marker_size: f64,
        z_marker_size: f64,
        index_in_marker: usize,
    ) -> Point3<f64> {
        debug_assert!(index_in_marker < MARKER_POINTS);

        let x = (index_in_marker % MARKER_GRID) as f64 - 2.0;
        let z = (index_in_marker / MARKER_GRID) as f64 - 2.0;

        let local_x = x * x_marker_size / MARKER_GRID as f64;
        let local_z = z * z_marker_size / MARKER_GRID as f64;

        // Rotation around +y by the orientation angle: quarter-turn exact.
        let (rotated_x, rotated_z) = match self.orientation {
            Orientation::Deg0 => (local_x, local_z),
            Orientation::Deg90 => (local_z, -local_x),
            Orientation::Deg180 => (-local_x, -local_z),
            Orientation::Deg270 => (-local_z, local_x),
        };

        marker_center + Vector3::new(rotated_x, 0.0, rotated_z)
    }

    /// Direction towards a neighbor marker, relative to this marker's own
    /// orientation.
    pub fn neighbor_direction(&self, neighbor: &BoardMarker) -> Orientation {
        let absolute = self
            .coordinate
            .direction_to(&neighbor.coordinate)
            .expect("markers must be 4-neighbors");

        absolute.minus(self.orientation)
    }

    /// Board cell of the neighbor reached by walking `direction` relative
    /// to this marker's orientation.
    pub fn neighbor_coordinate(
        &self,
        direction: Orientation,
        x_markers: u32,
        y_markers: u32,
    ) -> Option<MarkerCoordinate> {
        let absolute = self.orientation.plus(direction);
        self.coordinate.neighbor(absolute, x_markers, y_markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn marker_type_packs_id_and_sign() {
        let normal = Marker::new(5, MarkerSign::Normal);
        let inverted = Marker::new(5, MarkerSign::Inverted);

        assert_ne!(normal.marker_type(), inverted.marker_type());
        assert_eq!(normal.marker_type().0 >> 1, 5);
        assert_eq!(normal.marker_type().0 & 1, 1);
        assert_eq!(inverted.marker_type().0 & 1, 0);
    }

    #[test]
    fn coordinate_directions_and_neighbors() {
        let center = MarkerCoordinate::new(1, 1);

        let north = MarkerCoordinate::new(1, 0);
        assert_eq!(center.direction_to(&north), Some(Orientation::Deg0));
        assert_eq!(center.neighbor(Orientation::Deg0, 3, 3), Some(north));

        let east = MarkerCoordinate::new(2, 1);
        assert_eq!(center.direction_to(&east), Some(Orientation::Deg270));

        // walking off the grid
        assert_eq!(north.neighbor(Orientation::Deg0, 3, 3), None);
        assert_eq!(
            MarkerCoordinate::new(2, 1).neighbor(Orientation::Deg270, 3, 3),
            None
        );
    }

    #[test]
    fn neighbor_direction_accounts_for_orientation() {
        let marker = BoardMarker::new(
            0,
            MarkerSign::Normal,
            Orientation::Deg90,
            MarkerCoordinate::new(1, 1),
        );
        let neighbor = BoardMarker::new(
            1,
            MarkerSign::Inverted,
            Orientation::Deg0,
            MarkerCoordinate::new(1, 0),
        );

        // Absolute north, but the marker itself is rotated by 90 degrees.
        assert_eq!(marker.neighbor_direction(&neighbor), Orientation::Deg270);
        assert_eq!(
            marker.neighbor_coordinate(Orientation::Deg270, 3, 3),
            Some(MarkerCoordinate::new(1, 0))
        );
    }

    #[test]
    fn board_marker_serialization_round_trips() {
        let marker = BoardMarker::new(
            17,
            MarkerSign::Inverted,
            Orientation::Deg270,
            MarkerCoordinate::new(3, 7),
        );

        let json = serde_json::to_string(&marker).unwrap();
        let restored: BoardMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, marker);
    }

    #[test]
    fn object_points_rotate_in_quarter_turns() {
        let center = Point3::new(0.0, 0.0, 0.0);

        // Dot index 4 is the top-right corner: offset (+2, -2) grid steps.
        let north = BoardMarker::new(
            0,
            MarkerSign::Normal,
            Orientation::Deg0,
            MarkerCoordinate::new(0, 0),
        );
        let p = north.object_point(&center, 0.05, 0.05, 4);
        assert_relative_eq!(p.x, 0.02, epsilon = 1e-12);
        assert_relative_eq!(p.z, -0.02, epsilon = 1e-12);

        let west = BoardMarker::new(
            0,
            MarkerSign::Normal,
            Orientation::Deg90,
            MarkerCoordinate::new(0, 0),
        );
        let q = west.object_point(&center, 0.05, 0.05, 4);
        assert_relative_eq!(q.x, -0.02, epsilon = 1e-12);
        assert_relative_eq!(q.z, -0.02, epsilon = 1e-12);

        // The center dot never moves.
        for orientation in Orientation::ALL {
            let marker = BoardMarker::new(
                0,
                MarkerSign::Normal,
                orientation,
                MarkerCoordinate::new(0, 0),
            );
            let c = marker.object_point(&center, 0.05, 0.05, 12);
            assert_relative_eq!(c.x, 0.0, epsilon = 1e-12);
            assert_relative_eq!(c.z, 0.0, epsilon = 1e-12);
        }
    }
}
