//! Core types for marker-board camera calibration.
//!
//! This crate is image-format agnostic and purely geometric/numeric: it
//! provides grayscale image views, refined point observations with spatial
//! lookup, the tagged camera model, planar pose solving, and the staged
//! camera optimizer. Board construction and the detection pipeline live in
//! the crates built on top.

mod camera;
mod error;
mod homography;
mod image;
pub mod logger;
mod optimizer;
mod point;
pub mod pose;
mod solver;

pub use camera::{CameraKind, CameraModel, FisheyeCamera, ParamSet, PinholeCamera};
pub use error::CalibrationError;
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{sample_bilinear, GrayImage, ImageView};
pub use optimizer::{
    optimize_cameras_and_poses, CameraOptimization, OptimizationStrategy, OptimizerError,
};
pub use point::{ClosestPoints, Point, PointGrid};
pub use solver::{
    optimize_pose, solve_pose, Estimator, PoseSolution, PoseSolverConfig, PoseSolverError,
};
