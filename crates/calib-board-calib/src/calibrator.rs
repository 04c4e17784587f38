//! Multi-image camera calibration over board observations.

use log::{debug, info, warn};
use nalgebra::{Isometry3, Point2, Point3};
use serde::{Deserialize, Serialize};

use calib_board::{MetricBoard, MARKER_POINTS};
use calib_board_core::{
    optimize_cameras_and_poses, solve_pose, CalibrationError, CameraKind, CameraModel, Estimator,
    ImageView, OptimizationStrategy, PoseSolverConfig,
};
use calib_board_detect::{
    densify_board_pose, determine_additional_correspondences, determine_initial_pose,
    determine_marker_candidates, identify_candidates, initial_camera_from_fov_sweep,
    locate_candidates, AssemblerConfig, CoordinateUsage, FovSweepConfig, LocatorConfig,
    Observation, PointDetector, PointDetectorConfig,
};

/// Constraints on the camera used to jump-start the calibration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InitialCameraProperties {
    /// Pin the camera model instead of auto-selecting it.
    pub model_kind: Option<CameraKind>,
    pub min_fov_x: f64,
    pub max_fov_x: f64,
}

impl Default for InitialCameraProperties {
    fn default() -> Self {
        Self {
            model_kind: None,
            min_fov_x: 20f64.to_radians(),
            max_fov_x: 175f64.to_radians(),
        }
    }
}

/// Tuning knobs of the calibrator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CalibratorConfig {
    /// Minimal number of correspondences an observation must keep.
    pub min_correspondences: usize,
    /// Minimal number of identified neighbors required to place a
    /// candidate on the board.
    pub min_identified_neighbors: usize,
    /// Field-of-view samples per camera model during bootstrapping.
    pub fov_steps: usize,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            min_correspondences: 100,
            min_identified_neighbors: 1,
            fov_steps: 20,
        }
    }
}

/// Calibration progress: the first image pass determines the initial
/// camera; after the first `finalize` the caller feeds every image again
/// against the refined camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationStage {
    DetermineInitialFov,
    CalibrateCamera,
}

/// Per-image outcome of [`CameraCalibrator::handle_image`].
#[derive(Clone, Debug, PartialEq)]
pub enum ImageResult {
    BoardDetected,
    NoBoardDetected,
    Error(CalibrationError),
}

/// Camera calibrator consuming grayscale views of one metric board.
///
/// Per-image failures are reported as values and never poison the
/// calibration; `finalize` failures clear any partially computed camera.
pub struct CameraCalibrator {
    board: MetricBoard,
    initial_camera_properties: InitialCameraProperties,
    config: CalibratorConfig,
    stage: CalibrationStage,
    detector: PointDetector,
    usage: CoordinateUsage,
    observations: Vec<Observation>,
    camera: Option<CameraModel>,
    camera_projection_error: f64,
}

/// Loose projection gate for bootstrapping, in pixels.
const BOOTSTRAP_PROJECTION_ERROR: f64 = 10.0;
/// Tightened gate for re-densification during the FOV stage.
const REFINED_PROJECTION_ERROR: f64 = 5.0;
/// Final gate for additional correspondences.
const TIGHT_PROJECTION_ERROR: f64 = 2.0;

/// Distortion bound of the per-image and first-pass refinements.
const DISTORTION_CONSTRAINT: f64 = 2.0;
/// Loosened distortion bound of the second finalize pass.
const RELAXED_DISTORTION_CONSTRAINT: f64 = 2.5;

const PER_IMAGE_ITERATIONS: usize = 20;
const MULTI_IMAGE_ITERATIONS: usize = 100;
const CONVERGENCE_EPSILON: f64 = 1e-3;

impl CameraCalibrator {
    pub fn new(
        board: MetricBoard,
        initial_camera_properties: InitialCameraProperties,
        config: CalibratorConfig,
    ) -> Self {
        Self {
            board,
            initial_camera_properties,
            config,
            stage: CalibrationStage::DetermineInitialFov,
            detector: PointDetector::new(PointDetectorConfig::default()),
            usage: CoordinateUsage::default(),
            observations: Vec::new(),
            camera: None,
            camera_projection_error: f64::MAX,
        }
    }

    #[inline]
    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    #[inline]
    pub fn board(&self) -> &MetricBoard {
        &self.board
    }

    /// Current camera estimate with its projection error, if any.
    pub fn camera(&self) -> Option<(&CameraModel, f64)> {
        self.camera
            .as_ref()
            .map(|camera| (camera, self.camera_projection_error))
    }

    #[inline]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn latest_observation(&self) -> Option<&Observation> {
        self.observations.last()
    }

    /// Total number of correspondences across all observations.
    pub fn correspondence_count(&self) -> usize {
        self.observations
            .iter()
            .map(Observation::correspondence_count)
            .sum()
    }

    /// Mean coverage of the collected observations.
    pub fn mean_coverage(&self) -> f32 {
        if self.observations.is_empty() {
            return 0.0;
        }

        let sum: f32 = self.observations.iter().map(Observation::coverage).sum();
        sum / self.observations.len() as f32
    }

    /// Runs the full detection pipeline over one image and, on success,
    /// stores the resulting observation.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip(self, image)))]
    pub fn handle_image(&mut self, image_id: u64, image: &ImageView<'_>) -> ImageResult {
        if self
            .observations
            .iter()
            .any(|observation| observation.image_id() == image_id)
        {
            return ImageResult::Error(CalibrationError::ArithmeticError(
                "duplicate image id presented to the calibrator",
            ));
        }

        if let Err(error) = self.detector.detect_points(image) {
            return ImageResult::Error(error);
        }

        let points = self.detector.points().to_vec();
        let grid = self.detector.grid().clone();

        let mut candidates =
            determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
        if candidates.is_empty() {
            return ImageResult::NoBoardDetected;
        }

        let initial_camera = match self.stage {
            CalibrationStage::DetermineInitialFov => {
                let sweep = FovSweepConfig {
                    min_fov_x: self.initial_camera_properties.min_fov_x,
                    max_fov_x: self.initial_camera_properties.max_fov_x,
                    steps: self.config.fov_steps,
                };

                match initial_camera_from_fov_sweep(
                    image.width(),
                    image.height(),
                    &points,
                    &candidates,
                    self.initial_camera_properties.model_kind,
                    &sweep,
                    image_id,
                ) {
                    Some(camera) => camera,
                    None => return ImageResult::NoBoardDetected,
                }
            }
            CalibrationStage::CalibrateCamera => match &self.camera {
                Some(camera) => camera.clone(),
                None => {
                    return ImageResult::Error(CalibrationError::ArithmeticError(
                        "calibration stage advanced without a camera",
                    ))
                }
            },
        };

        identify_candidates(
            &initial_camera,
            &mut candidates,
            &points,
            &grid,
            image_id,
            BOOTSTRAP_PROJECTION_ERROR,
        );
        if candidates.is_empty() {
            return ImageResult::NoBoardDetected;
        }

        let locator_config = LocatorConfig {
            min_identified_neighbors: self.config.min_identified_neighbors,
        };
        if locate_candidates(self.board.board(), &mut candidates, &locator_config) == 0 {
            return ImageResult::NoBoardDetected;
        }

        let Some(initial_pose) = determine_initial_pose(
            &self.board,
            &initial_camera,
            &candidates,
            &points,
            image.width(),
            image.height(),
            &mut self.usage,
            image_id,
            BOOTSTRAP_PROJECTION_ERROR,
        ) else {
            return ImageResult::NoBoardDetected;
        };

        // In the FOV stage the sweep camera benefits from one staged
        // refinement over the reliable candidates before densification.
        let mut camera = initial_camera;
        let mut board_t_camera = initial_pose.board_t_camera;

        if self.stage == CalibrationStage::DetermineInitialFov {
            let (object_points, image_points) =
                candidate_correspondences(&self.board, &candidates, &initial_pose.used_candidate_indices, &points);

            match optimize_cameras_and_poses(
                &camera,
                &[board_t_camera],
                &[object_points],
                &[image_points],
                OptimizationStrategy::UpToMajorDistortionAfterAnother,
                Estimator::Square,
                PER_IMAGE_ITERATIONS,
                CONVERGENCE_EPSILON,
                DISTORTION_CONSTRAINT,
            ) {
                Ok(optimization) => {
                    camera = optimization.camera;
                    board_t_camera = optimization.world_t_cameras[0];
                }
                Err(error) => {
                    debug!("per-marker camera refinement failed: {error}");
                    return ImageResult::NoBoardDetected;
                }
            }
        }

        let densified = match densify_board_pose(
            &self.board,
            &camera,
            &board_t_camera,
            &candidates,
            &initial_pose.used_candidate_indices,
            &points,
            &grid,
            &mut self.usage,
            BOOTSTRAP_PROJECTION_ERROR,
        ) {
            Ok(densified) => densified,
            Err(_) => return ImageResult::NoBoardDetected,
        };

        if densified.object_points.len() < MARKER_POINTS * 4 {
            return ImageResult::NoBoardDetected;
        }

        let mut observation = Observation::new(
            image_id,
            camera,
            densified.board_t_camera,
            densified.object_point_ids,
            densified.object_points,
            densified.image_points,
        );

        if self.stage == CalibrationStage::DetermineInitialFov {
            // Refine once, then re-densify under a tighter gate and refine
            // again so the first camera estimate settles.
            if Self::refine_observations(
                std::slice::from_mut(&mut observation),
                OptimizationStrategy::UpToMajorDistortionAfterAnother,
                true,
                DISTORTION_CONSTRAINT,
            )
            .is_err()
            {
                return ImageResult::NoBoardDetected;
            }

            let redensified = match densify_board_pose(
                &self.board,
                observation.camera(),
                observation.board_t_camera(),
                &candidates,
                &initial_pose.used_candidate_indices,
                &points,
                &grid,
                &mut self.usage,
                REFINED_PROJECTION_ERROR,
            ) {
                Ok(densified) => densified,
                Err(_) => return ImageResult::NoBoardDetected,
            };

            observation = Observation::new(
                image_id,
                observation.camera().clone(),
                redensified.board_t_camera,
                redensified.object_point_ids,
                redensified.object_points,
                redensified.image_points,
            );

            if Self::refine_observations(
                std::slice::from_mut(&mut observation),
                OptimizationStrategy::UpToMajorDistortionAfterAnother,
                true,
                DISTORTION_CONSTRAINT,
            )
            .is_err()
            {
                return ImageResult::NoBoardDetected;
            }
        }

        // Alternate between harvesting additional correspondences under
        // the tight gate and refining; switch to the full parameter list
        // once the correspondence set stops growing.
        let mut strategy = match self.stage {
            CalibrationStage::DetermineInitialFov => {
                OptimizationStrategy::UpToMajorDistortionAfterAnother
            }
            CalibrationStage::CalibrateCamera => OptimizationStrategy::AllParametersAfterAnother,
        };

        loop {
            let (additional_ids, additional_objects, additional_images) =
                determine_additional_correspondences(
                    &self.board,
                    &observation,
                    &points,
                    &grid,
                    TIGHT_PROJECTION_ERROR,
                );

            let exhausted = additional_ids.is_empty();

            if !exhausted {
                debug!("image {image_id}: {} additional correspondences", additional_ids.len());
                observation.add_correspondences(
                    &additional_ids,
                    &additional_objects,
                    &additional_images,
                );
            }

            if exhausted {
                if strategy == OptimizationStrategy::AllParametersAfterAnother {
                    break;
                }
                strategy = OptimizationStrategy::AllParametersAfterAnother;
            }

            if Self::refine_observations(
                std::slice::from_mut(&mut observation),
                strategy,
                true,
                DISTORTION_CONSTRAINT,
            )
            .is_err()
            {
                return ImageResult::NoBoardDetected;
            }
        }

        if observation.correspondence_count() < self.config.min_correspondences {
            debug!(
                "image {image_id}: only {} correspondences, rejecting",
                observation.correspondence_count()
            );
            return ImageResult::NoBoardDetected;
        }

        info!(
            "image {image_id}: observation with {} correspondences, coverage {:.2}",
            observation.correspondence_count(),
            observation.coverage()
        );

        self.observations.push(observation);

        ImageResult::BoardDetected
    }

    /// Refines the camera over all collected observations.
    ///
    /// The first finalize ends the initial-FOV stage: all observations are
    /// discarded and `need_more_passes` asks the caller to feed every
    /// image again against the refined camera.
    pub fn finalize(&mut self, need_more_passes: &mut bool) -> Result<(), CalibrationError> {
        *need_more_passes = false;

        if self.observations.is_empty() {
            return Err(CalibrationError::InsufficientObservations);
        }

        for pass in 0..2 {
            let (start_from_focal_length, distortion_constraint) = if pass == 0 {
                (true, DISTORTION_CONSTRAINT)
            } else {
                (false, RELAXED_DISTORTION_CONSTRAINT)
            };

            let mut observations = std::mem::take(&mut self.observations);

            let result = Self::refine_observations(
                &mut observations,
                OptimizationStrategy::AllParametersAfterAnother,
                start_from_focal_length,
                distortion_constraint,
            );

            self.observations = observations;

            match result {
                Ok((camera, final_error)) => {
                    self.camera = Some(camera);
                    self.camera_projection_error = final_error;
                }
                Err(error) => {
                    self.camera = None;
                    self.camera_projection_error = f64::MAX;
                    return Err(error);
                }
            }
        }

        info!(
            "finalize: projection error {:.4} px over {} observations",
            self.camera_projection_error,
            self.observations.len()
        );

        if self.stage == CalibrationStage::DetermineInitialFov {
            self.observations.clear();
            *need_more_passes = true;
        }

        self.stage = CalibrationStage::CalibrateCamera;

        Ok(())
    }

    /// Re-estimates every observation pose with the pass-initial camera
    /// and optimizes the shared camera plus all poses.
    fn refine_observations(
        observations: &mut [Observation],
        strategy: OptimizationStrategy,
        start_from_focal_length: bool,
        distortion_constraint: f64,
    ) -> Result<(CameraModel, f64), CalibrationError> {
        debug_assert!(!observations.is_empty());

        let camera = if start_from_focal_length {
            observations[0].camera().reduced_to_fov()
        } else {
            observations[0].camera().clone()
        };

        let mut poses: Vec<Isometry3<f64>> = Vec::with_capacity(observations.len());
        let mut object_point_groups: Vec<Vec<Point3<f64>>> = Vec::with_capacity(observations.len());
        let mut image_point_groups: Vec<Vec<Point2<f64>>> = Vec::with_capacity(observations.len());

        for observation in observations.iter() {
            let pose = match solve_pose(
                &camera,
                observation.object_points(),
                observation.image_points(),
                &PoseSolverConfig {
                    seed: observation.image_id().wrapping_mul(0x9e37_79b9),
                    min_inliers: observation.correspondence_count() / 2,
                    max_iterations: 20,
                    sqr_error_threshold: BOOTSTRAP_PROJECTION_ERROR * BOOTSTRAP_PROJECTION_ERROR,
                    refine: true,
                },
            ) {
                Ok(solution) => solution.world_t_camera,
                Err(error) => {
                    warn!(
                        "pose re-estimation failed for image {}: {error}",
                        observation.image_id()
                    );
                    *observation.board_t_camera()
                }
            };

            poses.push(pose);
            object_point_groups.push(observation.object_points().to_vec());
            image_point_groups.push(observation.image_points().to_vec());
        }

        let iterations = if observations.len() == 1 {
            PER_IMAGE_ITERATIONS
        } else {
            MULTI_IMAGE_ITERATIONS
        };

        let optimization = optimize_cameras_and_poses(
            &camera,
            &poses,
            &object_point_groups,
            &image_point_groups,
            strategy,
            Estimator::Square,
            iterations,
            CONVERGENCE_EPSILON,
            distortion_constraint,
        )?;

        debug!(
            "refinement: {:.4} -> {:.4} px in {} accepted steps",
            optimization.initial_error,
            optimization.final_error,
            optimization.iteration_errors.len() - 1
        );

        for (observation, pose) in observations.iter_mut().zip(&optimization.world_t_cameras) {
            observation.update_camera(optimization.camera.clone(), *pose);
        }

        Ok((optimization.camera, optimization.final_error))
    }
}

/// Correspondences of the used candidates: board object points against
/// detected image points, one pair per resolved dot.
fn candidate_correspondences(
    board: &MetricBoard,
    candidates: &[calib_board_detect::MarkerCandidate],
    candidate_indices: &[usize],
    points: &[calib_board_core::Point],
) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
    let mut object_points = Vec::with_capacity(candidate_indices.len() * MARKER_POINTS);
    let mut image_points = Vec::with_capacity(candidate_indices.len() * MARKER_POINTS);

    for &candidate_index in candidate_indices {
        let candidate = &candidates[candidate_index];
        let Some(coordinate) = candidate.coordinate() else {
            continue;
        };

        for index_in_marker in 0..MARKER_POINTS {
            let point_index = candidate.point_index(index_in_marker);
            if point_index == calib_board_detect::INVALID_INDEX {
                continue;
            }

            object_points.push(board.object_point(&coordinate, index_in_marker));

            let observation = points[point_index as usize].observation;
            image_points.push(Point2::new(observation.x as f64, observation.y as f64));
        }
    }

    (object_points, image_points)
}
