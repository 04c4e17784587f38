//! Calibration board construction.
//!
//! A board is a grid of square dot markers drawn from a rotation-unique
//! layout catalog, arranged so that every marker's 4-neighborhood is unique
//! on the board. The metric variant adds physical marker sizes and yields
//! the 3D object points consumed by the detector and the calibrator.

pub mod catalog;

mod board;
mod marker;
mod metric;

pub use board::{
    optimal_marker_grid, optimal_marker_grid_for_width, oriented_neighbor_value, Board, BoardError,
    CoordinateSlots, UniquenessReport,
};
pub use catalog::{Layout, Orientation, MARKER_GRID, MARKER_POINTS};
pub use marker::{BoardMarker, Marker, MarkerCoordinate, MarkerSign, MarkerType};
pub use metric::{
    optimal_marker_grid_for_paper, MetricBoard, ObjectPointId, PADDING_FACTOR,
};
