//! Camera calibration from marker-board images.
//!
//! The calibrator consumes grayscale views of one printed marker board,
//! runs the detection pipeline per image, and refines the shared camera
//! model plus per-image poses in two stages: a first pass that determines
//! the initial camera from scratch, and a second pass over the same images
//! against the refined camera.

mod calibrator;

pub use calibrator::{
    CalibrationStage, CalibratorConfig, CameraCalibrator, ImageResult, InitialCameraProperties,
};
