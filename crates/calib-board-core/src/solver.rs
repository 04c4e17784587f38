//! Planar pose solving: seeded RANSAC over board-plane homographies plus
//! iterative non-linear pose refinement.

use nalgebra::{DMatrix, DVector, Isometry3, Point2, Point3, Translation3, UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::camera::CameraModel;
use crate::homography::homography_from_4pt;
use crate::pose::{inverted_flipped_to_standard, pose_from_plane_homography};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoseSolverError {
    #[error("{provided} correspondences provided, at least {required} required")]
    InsufficientCorrespondences { provided: usize, required: usize },
    #[error("no pose with enough inliers below the error threshold")]
    NoSolutionBelowThreshold,
    #[error("degenerate geometry: {0}")]
    Degenerate(&'static str),
}

/// Robust cost shaping for the iterative refinement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Estimator {
    Square,
    Huber,
}

impl Estimator {
    /// Residual weight for a residual of magnitude `norm` (pixels).
    #[inline]
    fn weight(self, norm: f64) -> f64 {
        match self {
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
}

#[derive(Clone, Copy, Debug)]
pub struct PoseSolverConfig {
    /// Seed for the internal RANSAC random generator.
    pub seed: u64,
    pub min_inliers: usize,
    pub max_iterations: usize,
    /// Squared reprojection error threshold in pixels.
    pub sqr_error_threshold: f64,
    /// Refine the best hypothesis over all of its inliers.
    pub refine: bool,
}

impl Default for PoseSolverConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            min_inliers: 4,
            max_iterations: 20,
            sqr_error_threshold: 10.0 * 10.0,
            refine: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoseSolution {
    /// Standard-frame pose of the camera in board coordinates.
    pub world_t_camera: Isometry3<f64>,
    pub used_indices: Vec<usize>,
    /// Mean squared reprojection error over the used correspondences.
    pub sqr_accuracy: f64,
}

fn collect_inliers(
    camera: &CameraModel,
    flipped_t_world: &Isometry3<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    sqr_error_threshold: f64,
    out: &mut Vec<usize>,
) -> f64 {
    out.clear();

    let mut sqr_error_sum = 0.0;

    for index in 0..object_points.len() {
        if !camera.is_object_point_in_front_if(flipped_t_world, &object_points[index]) {
            continue;
        }

        let projected = camera.project_if(flipped_t_world, &object_points[index]);
        let sqr_error = (projected - image_points[index]).norm_squared();

        if sqr_error.is_finite() && sqr_error <= sqr_error_threshold {
            out.push(index);
            sqr_error_sum += sqr_error;
        }
    }

    if out.is_empty() {
        f64::MAX
    } else {
        sqr_error_sum / out.len() as f64
    }
}

/// Estimates the camera pose from 2D/3D correspondences on the board plane.
///
/// The minimal solve samples four correspondences, estimates the board-plane
/// homography in undistorted normalized coordinates, and decomposes it into
/// a pose hypothesis; the hypothesis with the most inliers wins.
pub fn solve_pose(
    camera: &CameraModel,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    config: &PoseSolverConfig,
) -> Result<PoseSolution, PoseSolverError> {
    if object_points.len() != image_points.len() || object_points.len() < 4 {
        return Err(PoseSolverError::InsufficientCorrespondences {
            provided: object_points.len().min(image_points.len()),
            required: 4,
        });
    }

    let normalized: Vec<Option<Point2<f64>>> = image_points
        .iter()
        .map(|p| camera.unproject_normalized(p).map(|v| Point2::new(v.x, v.y)))
        .collect();

    let plane: Vec<Point2<f64>> = object_points.iter().map(|p| Point2::new(p.x, p.z)).collect();

    let usable: Vec<usize> = (0..object_points.len())
        .filter(|&index| normalized[index].is_some())
        .collect();

    if usable.len() < 4 {
        return Err(PoseSolverError::InsufficientCorrespondences {
            provided: usable.len(),
            required: 4,
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    let mut best_pose: Option<Isometry3<f64>> = None;
    let mut best_inliers = Vec::new();
    let mut best_sqr_accuracy = f64::MAX;
    let mut inliers = Vec::new();

    for _ in 0..config.max_iterations.max(1) {
        let mut sample = [0usize; 4];
        for slot in 0..4 {
            loop {
                let candidate = usable[rng.random_range(0..usable.len())];
                if !sample[..slot].contains(&candidate) {
                    sample[slot] = candidate;
                    break;
                }
            }
        }

        let src = [
            plane[sample[0]],
            plane[sample[1]],
            plane[sample[2]],
            plane[sample[3]],
        ];
        let dst = [
            normalized[sample[0]].unwrap(),
            normalized[sample[1]].unwrap(),
            normalized[sample[2]].unwrap(),
            normalized[sample[3]].unwrap(),
        ];

        let Some(homography) = homography_from_4pt(&src, &dst) else {
            continue;
        };

        let Some(flipped_t_world) = pose_from_plane_homography(&homography.h) else {
            continue;
        };

        let sqr_accuracy = collect_inliers(
            camera,
            &flipped_t_world,
            object_points,
            image_points,
            config.sqr_error_threshold,
            &mut inliers,
        );

        if inliers.len() > best_inliers.len()
            || (inliers.len() == best_inliers.len() && sqr_accuracy < best_sqr_accuracy)
        {
            best_pose = Some(flipped_t_world);
            best_sqr_accuracy = sqr_accuracy;
            std::mem::swap(&mut best_inliers, &mut inliers);
        }
    }

    let mut flipped_t_world = match best_pose {
        Some(pose) if best_inliers.len() >= config.min_inliers.max(4) => pose,
        _ => return Err(PoseSolverError::NoSolutionBelowThreshold),
    };

    if config.refine {
        let inlier_object: Vec<Point3<f64>> =
            best_inliers.iter().map(|&i| object_points[i]).collect();
        let inlier_image: Vec<Point2<f64>> = best_inliers.iter().map(|&i| image_points[i]).collect();

        if let Ok(refined) = optimize_pose(
            camera,
            &flipped_t_world,
            &inlier_object,
            &inlier_image,
            20,
            Estimator::Square,
        ) {
            flipped_t_world = refined;
        }

        best_sqr_accuracy = collect_inliers(
            camera,
            &flipped_t_world,
            object_points,
            image_points,
            config.sqr_error_threshold,
            &mut best_inliers,
        );

        if best_inliers.len() < config.min_inliers.max(4) {
            return Err(PoseSolverError::NoSolutionBelowThreshold);
        }
    }

    Ok(PoseSolution {
        world_t_camera: inverted_flipped_to_standard(&flipped_t_world),
        used_indices: best_inliers,
        sqr_accuracy: best_sqr_accuracy,
    })
}

fn apply_pose_delta(pose: &Isometry3<f64>, delta: &DVector<f64>) -> Isometry3<f64> {
    let rotation_delta = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
    let translation = Translation3::new(
        pose.translation.x + delta[3],
        pose.translation.y + delta[4],
        pose.translation.z + delta[5],
    );

    Isometry3::from_parts(translation, rotation_delta * pose.rotation)
}

fn pose_residuals(
    camera: &CameraModel,
    flipped_t_world: &Isometry3<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> DVector<f64> {
    let mut residuals = DVector::zeros(2 * object_points.len());

    for (index, (object_point, image_point)) in
        object_points.iter().zip(image_points.iter()).enumerate()
    {
        let projected = camera.project_if(flipped_t_world, object_point);

        let (rx, ry) = if projected.x.is_finite() && projected.y.is_finite() {
            (projected.x - image_point.x, projected.y - image_point.y)
        } else {
            (1e6, 1e6)
        };

        residuals[2 * index] = rx;
        residuals[2 * index + 1] = ry;
    }

    residuals
}

fn weighted_rms(residuals: &DVector<f64>, estimator: Estimator) -> f64 {
    let n = residuals.len() / 2;
    if n == 0 {
        return 0.0;
    }

    let mut sum = 0.0;
    for i in 0..n {
        let norm = (residuals[2 * i].powi(2) + residuals[2 * i + 1].powi(2)).sqrt();
        let weight = estimator.weight(norm);
        sum += weight * norm * norm;
    }

    (sum / n as f64).sqrt()
}

/// Refines an inverted-flipped camera pose by damped Gauss-Newton over the
/// reprojection error. Returns the refined `flipped_T_world`.
pub fn optimize_pose(
    camera: &CameraModel,
    flipped_t_world: &Isometry3<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    iterations: usize,
    estimator: Estimator,
) -> Result<Isometry3<f64>, PoseSolverError> {
    if object_points.len() != image_points.len() || object_points.len() < 3 {
        return Err(PoseSolverError::InsufficientCorrespondences {
            provided: object_points.len().min(image_points.len()),
            required: 3,
        });
    }

    let mut pose = *flipped_t_world;
    let mut residuals = pose_residuals(camera, &pose, object_points, image_points);
    let mut error = weighted_rms(&residuals, estimator);

    if !error.is_finite() {
        return Err(PoseSolverError::Degenerate("non-finite initial residuals"));
    }

    let mut lambda = 1e-3;
    const STEP: f64 = 1e-6;

    for _ in 0..iterations {
        // Numeric Jacobian of the residuals with respect to the 6 pose
        // parameters (rotation vector delta, translation delta).
        let rows = residuals.len();
        let mut jacobian = DMatrix::zeros(rows, 6);

        for param in 0..6 {
            let mut delta = DVector::zeros(6);

            delta[param] = STEP;
            let forward = pose_residuals(
                camera,
                &apply_pose_delta(&pose, &delta),
                object_points,
                image_points,
            );

            delta[param] = -STEP;
            let backward = pose_residuals(
                camera,
                &apply_pose_delta(&pose, &delta),
                object_points,
                image_points,
            );

            for row in 0..rows {
                jacobian[(row, param)] = (forward[row] - backward[row]) / (2.0 * STEP);
            }
        }

        let mut weights = DVector::from_element(rows, 1.0);
        for i in 0..rows / 2 {
            let norm = (residuals[2 * i].powi(2) + residuals[2 * i + 1].powi(2)).sqrt();
            let weight = estimator.weight(norm);
            weights[2 * i] = weight;
            weights[2 * i + 1] = weight;
        }

        let jt_w = jacobian.transpose() * DMatrix::from_diagonal(&weights);
        let jt_w_j = &jt_w * &jacobian;
        let jt_w_r = &jt_w * &residuals;

        let mut improved = false;

        for _ in 0..5 {
            let mut damped = jt_w_j.clone();
            for d in 0..6 {
                damped[(d, d)] += lambda * jt_w_j[(d, d)].max(1e-12);
            }

            let Some(step) = damped.lu().solve(&(-&jt_w_r)) else {
                lambda *= 10.0;
                continue;
            };

            let candidate = apply_pose_delta(&pose, &step);
            let candidate_residuals =
                pose_residuals(camera, &candidate, object_points, image_points);
            let candidate_error = weighted_rms(&candidate_residuals, estimator);

            if candidate_error < error {
                pose = candidate;
                residuals = candidate_residuals;

                let relative_gain = (error - candidate_error) / error.max(1e-12);
                error = candidate_error;

                lambda = (lambda * 0.5).max(1e-9);
                improved = true;

                if relative_gain < 1e-3 {
                    return Ok(pose);
                }

                break;
            }

            lambda *= 10.0;
        }

        if !improved {
            break;
        }
    }

    Ok(pose)
}
