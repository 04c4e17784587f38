//! Staged non-linear refinement of camera intrinsics and per-image poses.
//!
//! The optimizer walks a strategy-defined list of intrinsic parameter
//! subsets from smallest to largest and, for each subset, runs a damped
//! Gauss-Newton loop over the subset plus all 6-DoF poses. Steps that do
//! not reduce the reprojection error are rejected, so the final error never
//! exceeds the initial error.

use log::debug;
use nalgebra::{DMatrix, DVector, Isometry3, Point2, Point3};

use crate::camera::{CameraModel, ParamSet};
use crate::pose::{inverted_flipped_to_standard, standard_to_inverted_flipped};
use crate::solver::Estimator;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OptimizerError {
    #[error("optimization diverged to non-finite residuals")]
    Divergent,
    #[error("normal equations are singular")]
    Singular,
}

/// Order in which intrinsic parameter subsets are unfrozen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizationStrategy {
    /// Focal length, then principal point, then k1, then k2 + tangential.
    UpToMajorDistortionAfterAnother,
    /// The staged list extended through k3 and the higher-order terms.
    AllParametersAfterAnother,
}

impl OptimizationStrategy {
    pub fn parameter_sets(self) -> Vec<ParamSet> {
        let focal = ParamSet::FOCAL;
        let principal = focal.with(ParamSet::PRINCIPAL_POINT);
        let k1 = principal.with(ParamSet::K1);
        let major = k1.with(ParamSet::K2).with(ParamSet::TANGENTIAL);

        let mut sets = vec![focal, principal, k1, major];

        if self == OptimizationStrategy::AllParametersAfterAnother {
            let k3 = major.with(ParamSet::K3);
            sets.push(k3);
            sets.push(k3.with(ParamSet::HIGHER_ORDER));
        }

        sets
    }
}

#[derive(Clone, Debug)]
pub struct CameraOptimization {
    pub camera: CameraModel,
    /// Standard-frame per-observation poses (`board_T_camera`).
    pub world_t_cameras: Vec<Isometry3<f64>>,
    /// Root-mean-square reprojection error before optimization, in pixels.
    pub initial_error: f64,
    /// Root-mean-square reprojection error after optimization, in pixels.
    pub final_error: f64,
    /// Error after every accepted step, starting with the initial error.
    pub iteration_errors: Vec<f64>,
}

struct State {
    camera: CameraModel,
    flipped_t_worlds: Vec<Isometry3<f64>>,
}

impl State {
    fn residuals(
        &self,
        object_point_groups: &[Vec<Point3<f64>>],
        image_point_groups: &[Vec<Point2<f64>>],
    ) -> DVector<f64> {
        let total: usize = object_point_groups.iter().map(Vec::len).sum();
        let mut residuals = DVector::zeros(2 * total);

        let mut row = 0;
        for (group_index, group) in object_point_groups.iter().enumerate() {
            let pose = &self.flipped_t_worlds[group_index];
            let image_group = &image_point_groups[group_index];

            for (object_point, image_point) in group.iter().zip(image_group.iter()) {
                let projected = self.camera.project_if(pose, object_point);

                let (rx, ry) = if projected.x.is_finite() && projected.y.is_finite() {
                    (projected.x - image_point.x, projected.y - image_point.y)
                } else {
                    (1e6, 1e6)
                };

                residuals[row] = rx;
                residuals[row + 1] = ry;
                row += 2;
            }
        }

        residuals
    }
}

fn apply_step(
    state: &State,
    subset: ParamSet,
    camera_param_count: usize,
    step: &DVector<f64>,
    distortion_constraint: f64,
) -> State {
    let mut camera_params = state.camera.params(subset);
    for (index, value) in camera_params.iter_mut().enumerate() {
        *value += step[index];
    }

    let mut camera = state.camera.with_params(subset, &camera_params);
    camera.clamp_distortion(distortion_constraint);

    let flipped_t_worlds = state
        .flipped_t_worlds
        .iter()
        .enumerate()
        .map(|(pose_index, pose)| {
            let base = camera_param_count + 6 * pose_index;
            let rotation = nalgebra::UnitQuaternion::from_scaled_axis(nalgebra::Vector3::new(
                step[base],
                step[base + 1],
                step[base + 2],
            ));
            let translation = nalgebra::Translation3::new(
                pose.translation.x + step[base + 3],
                pose.translation.y + step[base + 4],
                pose.translation.z + step[base + 5],
            );
            Isometry3::from_parts(translation, rotation * pose.rotation)
        })
        .collect();

    State {
        camera,
        flipped_t_worlds,
    }
}

fn weighted_rms(residuals: &DVector<f64>, estimator: Estimator) -> f64 {
    let pairs = residuals.len() / 2;
    if pairs == 0 {
        return 0.0;
    }

    let mut sum = 0.0;
    for i in 0..pairs {
        let sqr = residuals[2 * i].powi(2) + residuals[2 * i + 1].powi(2);
        let weight = estimator_weight(estimator, sqr.sqrt());
        sum += weight * sqr;
    }

    (sum / pairs as f64).sqrt()
}

#[inline]
fn estimator_weight(estimator: Estimator, norm: f64) -> f64 {
    match estimator {
        Estimator::Square => 1.0,
        Estimator::Huber => {
            const DELTA: f64 = 2.5;
            if norm <= DELTA {
                1.0
            } else {
                DELTA / norm
            }
        }
    }
}

/// Refines the shared camera and all per-observation poses.
///
/// `iterations` caps the Gauss-Newton iterations per parameter subset;
/// `epsilon` is the relative error-improvement convergence threshold;
/// `distortion_constraint` bounds the absolute value of every distortion
/// coefficient.
#[allow(clippy::too_many_arguments)]
pub fn optimize_cameras_and_poses(
    camera: &CameraModel,
    world_t_cameras: &[Isometry3<f64>],
    object_point_groups: &[Vec<Point3<f64>>],
    image_point_groups: &[Vec<Point2<f64>>],
    strategy: OptimizationStrategy,
    estimator: Estimator,
    iterations: usize,
    epsilon: f64,
    distortion_constraint: f64,
) -> Result<CameraOptimization, OptimizerError> {
    debug_assert_eq!(world_t_cameras.len(), object_point_groups.len());
    debug_assert_eq!(world_t_cameras.len(), image_point_groups.len());

    if world_t_cameras.is_empty()
        || object_point_groups
            .iter()
            .zip(image_point_groups)
            .any(|(objects, images)| objects.is_empty() || objects.len() != images.len())
    {
        return Err(OptimizerError::Singular);
    }

    let mut state = State {
        camera: camera.clone(),
        flipped_t_worlds: world_t_cameras
            .iter()
            .map(standard_to_inverted_flipped)
            .collect(),
    };

    let mut residuals = state.residuals(object_point_groups, image_point_groups);
    let mut error = weighted_rms(&residuals, estimator);

    if !error.is_finite() {
        return Err(OptimizerError::Divergent);
    }

    let initial_error = error;
    let mut iteration_errors = vec![error];
    let mut solved_any_system = false;

    for subset in strategy.parameter_sets() {
        let camera_param_count = state.camera.param_count(subset);
        let pose_param_count = 6 * state.flipped_t_worlds.len();
        let param_count = camera_param_count + pose_param_count;

        let mut lambda = 1e-3;

        for _ in 0..iterations.max(1) {
            let rows = residuals.len();
            let mut jacobian = DMatrix::zeros(rows, param_count);

            for param in 0..param_count {
                // Scale-aware central differences; camera parameters span
                // several orders of magnitude.
                let scale = if param < camera_param_count {
                    let values = state.camera.params(subset);
                    values[param].abs().max(1.0) * 1e-6
                } else {
                    1e-6
                };

                let mut delta = DVector::zeros(param_count);

                delta[param] = scale;
                let forward = apply_step(
                    &state,
                    subset,
                    camera_param_count,
                    &delta,
                    distortion_constraint,
                )
                .residuals(object_point_groups, image_point_groups);

                delta[param] = -scale;
                let backward = apply_step(
                    &state,
                    subset,
                    camera_param_count,
                    &delta,
                    distortion_constraint,
                )
                .residuals(object_point_groups, image_point_groups);

                for row in 0..rows {
                    jacobian[(row, param)] = (forward[row] - backward[row]) / (2.0 * scale);
                }
            }

            let mut weights = DVector::from_element(rows, 1.0);
            for i in 0..rows / 2 {
                let norm = (residuals[2 * i].powi(2) + residuals[2 * i + 1].powi(2)).sqrt();
                let weight = estimator_weight(estimator, norm);
                weights[2 * i] = weight;
                weights[2 * i + 1] = weight;
            }

            let jt_w = jacobian.transpose() * DMatrix::from_diagonal(&weights);
            let jt_w_j = &jt_w * &jacobian;
            let jt_w_r = &jt_w * &residuals;

            let mut improved = false;

            for _ in 0..6 {
                let mut damped = jt_w_j.clone();
                for d in 0..param_count {
                    damped[(d, d)] += lambda * jt_w_j[(d, d)].max(1e-12);
                }

                let Some(step) = damped.lu().solve(&(-&jt_w_r)) else {
                    lambda *= 10.0;
                    continue;
                };

                solved_any_system = true;

                let candidate = apply_step(
                    &state,
                    subset,
                    camera_param_count,
                    &step,
                    distortion_constraint,
                );
                let candidate_residuals =
                    candidate.residuals(object_point_groups, image_point_groups);
                let candidate_error = weighted_rms(&candidate_residuals, estimator);

                if !candidate_error.is_finite() {
                    lambda *= 10.0;
                    continue;
                }

                if candidate_error < error {
                    let relative_gain = (error - candidate_error) / error.max(1e-12);

                    state = candidate;
                    residuals = candidate_residuals;
                    error = candidate_error;
                    iteration_errors.push(error);

                    lambda = (lambda * 0.5).max(1e-9);
                    improved = true;

                    if relative_gain < epsilon {
                        // Converged for this subset.
                        lambda = 1e-3;
                    }

                    break;
                }

                lambda *= 10.0;
            }

            if !improved {
                break;
            }
        }
    }

    if !solved_any_system {
        return Err(OptimizerError::Singular);
    }

    debug!(
        "optimized projection error {:.4} -> {:.4} px in {} accepted steps",
        initial_error,
        error,
        iteration_errors.len() - 1
    );

    Ok(CameraOptimization {
        camera: state.camera,
        world_t_cameras: state
            .flipped_t_worlds
            .iter()
            .map(inverted_flipped_to_standard)
            .collect(),
        initial_error,
        final_error: error,
        iteration_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use nalgebra::{Translation3, UnitQuaternion};

    fn board_points() -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for z in -4..=4 {
            for x in -4..=4 {
                points.push(Point3::new(x as f64 * 0.03, 0.0, z as f64 * 0.03));
            }
        }
        points
    }

    fn view_poses() -> Vec<Isometry3<f64>> {
        let base = |x: f64, angle: f64| {
            inverted_flipped_to_standard(&Isometry3::from_parts(
                Translation3::new(x, 0.02, 0.6),
                UnitQuaternion::from_euler_angles(0.15 + angle, -angle, 0.05),
            ))
        };

        vec![base(0.0, 0.0), base(0.08, 0.2), base(-0.06, -0.25)]
    }

    fn render(
        camera: &CameraModel,
        world_t_cameras: &[Isometry3<f64>],
        object_points: &[Point3<f64>],
    ) -> (Vec<Vec<Point3<f64>>>, Vec<Vec<Point2<f64>>>) {
        let mut object_groups = Vec::new();
        let mut image_groups = Vec::new();

        for pose in world_t_cameras {
            let flipped = standard_to_inverted_flipped(pose);
            object_groups.push(object_points.to_vec());
            image_groups.push(
                object_points
                    .iter()
                    .map(|p| camera.project_if(&flipped, p))
                    .collect(),
            );
        }

        (object_groups, image_groups)
    }

    #[test]
    fn strategy_subset_lists_grow_monotonically() {
        for strategy in [
            OptimizationStrategy::UpToMajorDistortionAfterAnother,
            OptimizationStrategy::AllParametersAfterAnother,
        ] {
            let sets = strategy.parameter_sets();
            assert!(sets.len() >= 4);

            for window in sets.windows(2) {
                assert!(window[1].contains(window[0]));
            }
        }

        assert_eq!(
            OptimizationStrategy::UpToMajorDistortionAfterAnother
                .parameter_sets()
                .len()
                + 2,
            OptimizationStrategy::AllParametersAfterAnother
                .parameter_sets()
                .len()
        );
    }

    #[test]
    fn recovers_perturbed_focal_length() {
        let mut ground_truth_pinhole = PinholeCamera::from_fov_x(640, 480, 60f64.to_radians());
        ground_truth_pinhole.radial = [-0.08, 0.0, 0.0];
        let ground_truth = CameraModel::Pinhole(ground_truth_pinhole);

        let poses = view_poses();
        let (object_groups, image_groups) = render(&ground_truth, &poses, &board_points());

        // Start from the true field of view with distortion dropped.
        let start = ground_truth.reduced_to_fov();

        let result = optimize_cameras_and_poses(
            &start,
            &poses,
            &object_groups,
            &image_groups,
            OptimizationStrategy::AllParametersAfterAnother,
            Estimator::Square,
            40,
            1e-4,
            2.0,
        )
        .expect("optimization");

        assert!(result.final_error <= result.initial_error);
        assert!(result.final_error < 0.05, "final {}", result.final_error);

        let CameraModel::Pinhole(refined) = result.camera else {
            panic!("model kind must be preserved");
        };
        let CameraModel::Pinhole(truth) = ground_truth else {
            unreachable!();
        };

        assert!((refined.fx - truth.fx).abs() / truth.fx < 0.02);
        assert!((refined.radial[0] - truth.radial[0]).abs() < 0.02);
    }

    #[test]
    fn error_history_is_monotone() {
        let ground_truth = CameraModel::pinhole_from_fov_x(640, 480, 65f64.to_radians());
        let poses = view_poses();
        let (object_groups, image_groups) = render(&ground_truth, &poses, &board_points());

        let start = CameraModel::pinhole_from_fov_x(640, 480, 55f64.to_radians());

        let result = optimize_cameras_and_poses(
            &start,
            &poses,
            &object_groups,
            &image_groups,
            OptimizationStrategy::UpToMajorDistortionAfterAnother,
            Estimator::Square,
            20,
            1e-3,
            2.0,
        )
        .expect("optimization");

        assert_eq!(result.iteration_errors.first(), Some(&result.initial_error));
        for window in result.iteration_errors.windows(2) {
            assert!(window[1] <= window[0]);
        }
    }

    #[test]
    fn distortion_constraint_bounds_coefficients() {
        let ground_truth = CameraModel::pinhole_from_fov_x(320, 240, 75f64.to_radians());
        let poses = view_poses();
        let (object_groups, image_groups) = render(&ground_truth, &poses, &board_points());

        let result = optimize_cameras_and_poses(
            &ground_truth,
            &poses,
            &object_groups,
            &image_groups,
            OptimizationStrategy::AllParametersAfterAnother,
            Estimator::Square,
            10,
            1e-3,
            0.01,
        )
        .expect("optimization");

        let CameraModel::Pinhole(refined) = result.camera else {
            panic!("model kind must be preserved");
        };

        for k in refined.radial {
            assert!(k.abs() <= 0.01 + 1e-12);
        }
    }

    #[test]
    fn empty_observations_are_singular() {
        let camera = CameraModel::pinhole_from_fov_x(640, 480, 60f64.to_radians());
        let result = optimize_cameras_and_poses(
            &camera,
            &[],
            &[],
            &[],
            OptimizationStrategy::AllParametersAfterAnother,
            Estimator::Square,
            10,
            1e-3,
            2.0,
        );

        assert_eq!(result.unwrap_err(), OptimizerError::Singular);
    }
}
