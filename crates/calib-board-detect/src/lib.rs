//! Marker-board detection pipeline.
//!
//! One image runs through four stages: the point detector finds and
//! refines the marker dots, the assembler groups them into identified
//! marker candidates, the locator assigns board coordinates, and the
//! bootstrapper estimates the camera pose and grows the 2D/3D
//! correspondence set into an [`Observation`].

mod assembler;
mod bootstrap;
mod candidate;
mod locator;
mod observation;
mod pattern;
mod point_detector;
pub mod synthetic;

pub use assembler::{
    determine_camera_pose_for_marker, determine_marker_candidates,
    determine_remaining_marker_point_indices, identify_candidates, AssemblerConfig,
};
pub use bootstrap::{
    densify_board_pose, determine_additional_correspondences, determine_board_pose,
    determine_initial_pose, initial_camera_from_fov_sweep, BoardPose, FovSweepConfig,
};
pub use candidate::{MarkerCandidate, INVALID_INDEX};
pub use locator::{
    locate_candidate, locate_candidates, select_seed, CoordinateUsage, LocatorConfig,
};
pub use observation::Observation;
pub use pattern::{create_point_patterns, PointPattern};
pub use point_detector::{PointDetector, PointDetectorConfig};
