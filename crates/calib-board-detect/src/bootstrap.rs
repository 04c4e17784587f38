//! Initial camera bootstrapping and correspondence growth for one image.

use std::collections::HashSet;

use log::debug;
use nalgebra::{Isometry3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

use calib_board::{MarkerCoordinate, MetricBoard, ObjectPointId, Orientation, MARKER_POINTS};
use calib_board_core::pose::standard_to_inverted_flipped;
use calib_board_core::{
    optimize_pose, solve_pose, CalibrationError, CameraKind, CameraModel, Estimator, Point,
    PointGrid, PoseSolverConfig,
};

use crate::candidate::{border_slot_marker_index, MarkerCandidate, INVALID_INDEX};
use crate::locator::CoordinateUsage;

/// Field-of-view sweep bounds for the initial camera.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FovSweepConfig {
    pub min_fov_x: f64,
    pub max_fov_x: f64,
    pub steps: usize,
}

impl Default for FovSweepConfig {
    fn default() -> Self {
        Self {
            min_fov_x: 20f64.to_radians(),
            max_fov_x: 175f64.to_radians(),
            steps: 20,
        }
    }
}

/// A pinhole model is preferred as long as its best field of view stays
/// below this bound; anything wider points at a fisheye lens.
const PINHOLE_PLAUSIBLE_FOV_X: f64 = 100.0 * std::f64::consts::PI / 180.0;

/// Spacing of neighbor markers in unit-marker coordinates.
const UNIT_NEIGHBOR_DISTANCE: f64 = 5.0;

fn unit_marker_border_object_point(index_in_border: usize) -> Point3<f64> {
    let index_in_marker = border_slot_marker_index(index_in_border);
    let x = (index_in_marker % 5) as f64 - 2.0;
    let z = (index_in_marker / 5) as f64 - 2.0;
    Point3::new(x, 0.0, z)
}

/// Picks the initial camera model and field of view.
///
/// Pinhole is tried first and kept when its best field of view is
/// plausible for a pinhole lens; otherwise the fisheye sweep decides.
/// `model_kind` pins the model instead of auto-selecting.
pub fn initial_camera_from_fov_sweep(
    width: u32,
    height: u32,
    points: &[Point],
    candidates: &[MarkerCandidate],
    model_kind: Option<CameraKind>,
    config: &FovSweepConfig,
    seed: u64,
) -> Option<CameraModel> {
    if model_kind != Some(CameraKind::Fisheye) {
        if let Some(fov_x) = sweep_fov(
            width,
            height,
            points,
            candidates,
            CameraKind::Pinhole,
            config,
            seed,
        ) {
            if model_kind == Some(CameraKind::Pinhole) || fov_x <= PINHOLE_PLAUSIBLE_FOV_X {
                debug!("initial camera: pinhole, fovX {:.1} deg", fov_x.to_degrees());
                return Some(CameraModel::pinhole_from_fov_x(width, height, fov_x));
            }
        }
    }

    if model_kind != Some(CameraKind::Pinhole) {
        if let Some(fov_x) = sweep_fov(
            width,
            height,
            points,
            candidates,
            CameraKind::Fisheye,
            config,
            seed,
        ) {
            debug!("initial camera: fisheye, fovX {:.1} deg", fov_x.to_degrees());
            return Some(CameraModel::fisheye_from_fov_x(width, height, fov_x));
        }
    }

    None
}

/// Scores every field-of-view step by the pose fit of each marker
/// candidate (plus its connected neighbors) and returns the best one.
fn sweep_fov(
    width: u32,
    height: u32,
    points: &[Point],
    candidates: &[MarkerCandidate],
    kind: CameraKind,
    config: &FovSweepConfig,
    seed: u64,
) -> Option<f64> {
    if config.steps < 2 || !(config.min_fov_x > 0.0) || config.min_fov_x >= config.max_fov_x {
        return None;
    }

    let cameras: Vec<CameraModel> = (0..config.steps)
        .map(|step| {
            let fov_x = config.min_fov_x
                + (config.max_fov_x - config.min_fov_x) * step as f64 / (config.steps - 1) as f64;
            CameraModel::from_fov_x(kind, width, height, fov_x)
        })
        .collect();

    // (participating candidates, summed error) per camera.
    let mut votes = vec![(0usize, 0.0f64); cameras.len()];

    const SQR_PIXEL_ERROR: f64 = 15.0 * 15.0;

    let mut object_points: Vec<Point3<f64>> = Vec::with_capacity(16 * 5);
    let mut image_points: Vec<Point2<f64>> = Vec::with_capacity(16 * 5);

    for (candidate_index, candidate) in candidates.iter().enumerate() {
        object_points.clear();
        image_points.clear();

        for index_in_border in 0..16 {
            object_points.push(unit_marker_border_object_point(index_in_border));

            let point_index = candidate.border_index(index_in_border);
            let observation = points[point_index as usize].observation;
            image_points.push(Point2::new(observation.x as f64, observation.y as f64));
        }

        // Neighbors contribute their border points, rotated into this
        // candidate's frame and offset along the connecting edge.
        for (local_edge, neighbor_index) in candidate.neighbors() {
            let neighbor = &candidates[neighbor_index];

            let Some(neighbor_edge) = neighbor.neighbor_direction(candidate_index) else {
                continue;
            };

            let direction: Vector2<f64> = match local_edge {
                Orientation::Deg0 => Vector2::new(0.0, -1.0),
                Orientation::Deg90 => Vector2::new(-1.0, 0.0),
                Orientation::Deg180 => Vector2::new(0.0, 1.0),
                Orientation::Deg270 => Vector2::new(1.0, 0.0),
            };
            let offset = direction * UNIT_NEIGHBOR_DISTANCE;

            let rotation_quarters = (local_edge.quarter_turns() as i32 + 2
                - neighbor_edge.quarter_turns() as i32)
                .rem_euclid(4);

            let mut rotated_neighbor = neighbor.clone();
            rotated_neighbor.rotate_clockwise_quarters(-rotation_quarters);

            for index_in_border in 0..16 {
                let base = unit_marker_border_object_point(index_in_border);
                object_points.push(Point3::new(base.x + offset.x, 0.0, base.z + offset.y));

                let point_index = rotated_neighbor.border_index(index_in_border);
                let observation = points[point_index as usize].observation;
                image_points.push(Point2::new(observation.x as f64, observation.y as f64));
            }
        }

        for (camera_index, camera) in cameras.iter().enumerate() {
            // Pose from the candidate's own border only, refined over all
            // correspondences.
            let Ok(solution) = solve_pose(
                camera,
                &object_points[..16],
                &image_points[..16],
                &PoseSolverConfig {
                    seed: seed.wrapping_add(candidate_index as u64),
                    min_inliers: 16,
                    max_iterations: 20,
                    sqr_error_threshold: SQR_PIXEL_ERROR,
                    refine: false,
                },
            ) else {
                continue;
            };

            let flipped = standard_to_inverted_flipped(&solution.world_t_camera);

            let Ok(refined) = optimize_pose(
                camera,
                &flipped,
                &object_points,
                &image_points,
                20,
                Estimator::Square,
            ) else {
                continue;
            };

            let error = mean_sqr_error(camera, &refined, &object_points, &image_points);

            votes[camera_index].0 += 1;
            votes[camera_index].1 += error;
        }
    }

    let mut best_camera = None;
    let mut best_error = f64::MAX;

    for (camera_index, &(count, error_sum)) in votes.iter().enumerate() {
        if count == 0 {
            continue;
        }

        let average_error = error_sum / count as f64;
        if average_error < best_error {
            best_error = average_error;
            best_camera = Some(camera_index);
        }
    }

    best_camera.map(|index| cameras[index].fov_x())
}

fn mean_sqr_error(
    camera: &CameraModel,
    flipped_t_world: &Isometry3<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> f64 {
    let mut sum = 0.0;

    for (object_point, image_point) in object_points.iter().zip(image_points) {
        let projected = camera.project_if(flipped_t_world, object_point);
        let sqr = (projected - image_point).norm_squared();
        sum += if sqr.is_finite() { sqr } else { 1e12 };
    }

    sum / object_points.len().max(1) as f64
}

/// Pose of the board from a set of placed candidates, with the
/// correspondences that survived the robust fit.
#[derive(Clone, Debug)]
pub struct BoardPose {
    pub board_t_camera: Isometry3<f64>,
    /// Candidate indices (into the full candidate vector) that contributed
    /// at least one used correspondence.
    pub used_candidate_indices: Vec<usize>,
    pub object_point_ids: Vec<ObjectPointId>,
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
}

/// Robust board pose from the full point sets of placed candidates.
pub fn determine_board_pose(
    board: &MetricBoard,
    camera: &CameraModel,
    candidates: &[MarkerCandidate],
    candidate_indices: &[usize],
    points: &[Point],
    seed: u64,
    max_projection_error: f64,
) -> Option<BoardPose> {
    if candidate_indices.is_empty() {
        return None;
    }

    let mut object_point_ids = Vec::with_capacity(candidate_indices.len() * MARKER_POINTS);
    let mut object_points = Vec::with_capacity(candidate_indices.len() * MARKER_POINTS);
    let mut image_points = Vec::with_capacity(candidate_indices.len() * MARKER_POINTS);

    for &candidate_index in candidate_indices {
        let candidate = &candidates[candidate_index];
        let coordinate = candidate.coordinate()?;

        for index_in_marker in 0..MARKER_POINTS {
            let point_index = candidate.point_index(index_in_marker);
            if point_index == INVALID_INDEX {
                return None;
            }

            object_point_ids.push(ObjectPointId::new(coordinate, index_in_marker));
            object_points.push(board.object_point(&coordinate, index_in_marker));

            let observation = points[point_index as usize].observation;
            image_points.push(Point2::new(observation.x as f64, observation.y as f64));
        }
    }

    let solution = solve_pose(
        camera,
        &object_points,
        &image_points,
        &PoseSolverConfig {
            seed,
            min_inliers: object_points.len() / 2,
            max_iterations: 20,
            sqr_error_threshold: max_projection_error * max_projection_error,
            refine: true,
        },
    )
    .ok()?;

    let mut used_candidates: HashSet<usize> = HashSet::with_capacity(candidate_indices.len());
    for &used in &solution.used_indices {
        used_candidates.insert(candidate_indices[used / MARKER_POINTS]);
    }

    let mut used_candidate_indices: Vec<usize> = used_candidates.into_iter().collect();
    used_candidate_indices.sort_unstable();

    Some(BoardPose {
        board_t_camera: solution.world_t_camera,
        used_candidate_indices,
        object_point_ids: solution
            .used_indices
            .iter()
            .map(|&index| object_point_ids[index])
            .collect(),
        object_points: solution
            .used_indices
            .iter()
            .map(|&index| object_points[index])
            .collect(),
        image_points: solution
            .used_indices
            .iter()
            .map(|&index| image_points[index])
            .collect(),
    })
}

/// Initial board pose by region growth from the seed candidate.
///
/// Starting with the best-connected candidate and its neighbors, the board
/// region in use grows ring by ring; the pose is re-estimated per ring and
/// the largest supporting candidate set wins. Growing from the image
/// center outwards keeps strongly distorted border regions out of the
/// early estimates.
pub fn determine_initial_pose(
    board: &MetricBoard,
    camera: &CameraModel,
    candidates: &[MarkerCandidate],
    points: &[Point],
    image_width: u32,
    image_height: u32,
    usage: &mut CoordinateUsage,
    seed: u64,
    max_projection_error: f64,
) -> Option<BoardPose> {
    let (seed_index, seed_neighbors) =
        crate::locator::select_seed(candidates, points, image_width, image_height)?;

    usage.reset(board.board().x_markers(), board.board().y_markers());

    usage.mark(&candidates[seed_index].coordinate()?);
    for &neighbor_index in &seed_neighbors {
        usage.mark(&candidates[neighbor_index].coordinate()?);
    }

    let mut best: Option<BoardPose> = None;
    let mut no_improvement_iterations = 0usize;
    let mut frontier = Vec::new();

    loop {
        let candidate_indices: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| {
                candidate
                    .coordinate()
                    .is_some_and(|coordinate| usage.is_marked(&coordinate))
            })
            .map(|(index, _)| index)
            .collect();

        let Some(pose) = determine_board_pose(
            board,
            camera,
            candidates,
            &candidate_indices,
            points,
            seed,
            max_projection_error,
        ) else {
            break;
        };

        let improved = best
            .as_ref()
            .is_none_or(|existing| existing.used_candidate_indices.len() < pose.used_candidate_indices.len());

        if improved {
            best = Some(pose);
            no_improvement_iterations = 0;
        } else {
            no_improvement_iterations += 1;
        }

        if no_improvement_iterations >= 2 {
            break;
        }

        usage.frontier(&mut frontier);
        if frontier.is_empty() && no_improvement_iterations > 0 {
            break;
        }
        for coordinate in &frontier {
            usage.mark(coordinate);
        }
    }

    best
}

/// Grows the correspondence set of a posed board marker by marker.
///
/// Starting from the markers already in use, every frontier cell is
/// projected into the image and matched point by point; a marker is
/// accepted only when at least 21 of its 25 dots match, which guards
/// against half-occluded markers. The pose is re-optimized after every
/// ring.
#[allow(clippy::too_many_arguments)]
pub fn densify_board_pose(
    board: &MetricBoard,
    camera: &CameraModel,
    board_t_camera: &Isometry3<f64>,
    candidates: &[MarkerCandidate],
    valid_candidate_indices: &[usize],
    points: &[Point],
    grid: &PointGrid,
    usage: &mut CoordinateUsage,
    max_projection_error: f64,
) -> Result<BoardPose, CalibrationError> {
    /// A marker joins only with at least this many matched dots.
    const MIN_NEW_CORRESPONDENCES: usize = 21;

    usage.reset(board.board().x_markers(), board.board().y_markers());

    let mut object_point_ids: Vec<ObjectPointId> = Vec::new();
    let mut object_points: Vec<Point3<f64>> = Vec::new();
    let mut image_points: Vec<Point2<f64>> = Vec::new();

    for &candidate_index in valid_candidate_indices {
        let candidate = &candidates[candidate_index];
        let Some(coordinate) = candidate.coordinate() else {
            return Err(CalibrationError::ArithmeticError(
                "densification requires placed candidates",
            ));
        };

        usage.mark(&coordinate);

        for index_in_marker in 0..MARKER_POINTS {
            let point_index = candidate.point_index(index_in_marker);
            if point_index == INVALID_INDEX {
                continue;
            }

            object_point_ids.push(ObjectPointId::new(coordinate, index_in_marker));
            object_points.push(board.object_point(&coordinate, index_in_marker));

            let observation = points[point_index as usize].observation;
            image_points.push(Point2::new(observation.x as f64, observation.y as f64));
        }
    }

    let mut flipped_t_board = standard_to_inverted_flipped(board_t_camera);
    let mut frontier = Vec::new();

    loop {
        usage.frontier(&mut frontier);
        if frontier.is_empty() {
            break;
        }

        let mut found_new_correspondences = false;

        for coordinate in &frontier {
            usage.mark(coordinate);

            let correspondences_at_start = object_point_ids.len();
            let board_marker = board.board().marker(coordinate);

            for index_in_marker in 0..MARKER_POINTS {
                let object_point = board.object_point(coordinate, index_in_marker);

                let projected = camera.project_if(&flipped_t_board, &object_point);
                if !camera.is_object_point_in_front_if(&flipped_t_board, &object_point)
                    || !camera.is_inside(&projected, 10.0)
                {
                    continue;
                }

                let query = Point2::new(projected.x as f32, projected.y as f32);
                let Some(closest) = grid.closest_two_points(points, query) else {
                    continue;
                };

                if closest.closest_sqr_distance
                    > (max_projection_error * max_projection_error) as f32
                {
                    continue;
                }

                if closest.second_sqr_distance <= closest.closest_sqr_distance * 4.0 {
                    continue;
                }

                let point = &points[closest.closest_index];
                if point.sign() != board_marker.point_sign_oriented(index_in_marker) {
                    continue;
                }

                object_point_ids.push(ObjectPointId::new(*coordinate, index_in_marker));
                object_points.push(object_point);
                image_points.push(Point2::new(
                    point.observation.x as f64,
                    point.observation.y as f64,
                ));
            }

            let new_correspondences = object_point_ids.len() - correspondences_at_start;

            if new_correspondences > 0 && new_correspondences < MIN_NEW_CORRESPONDENCES {
                // Likely a partially occluded marker; drop its points.
                object_point_ids.truncate(correspondences_at_start);
                object_points.truncate(correspondences_at_start);
                image_points.truncate(correspondences_at_start);
            } else if new_correspondences > 0 {
                found_new_correspondences = true;
            }
        }

        if !found_new_correspondences {
            break;
        }

        flipped_t_board = optimize_pose(
            camera,
            &flipped_t_board,
            &object_points,
            &image_points,
            20,
            Estimator::Huber,
        )?;
    }

    // Keep only correspondences the final pose still explains.
    let mut used_ids = Vec::with_capacity(object_point_ids.len());
    let mut used_objects = Vec::with_capacity(object_points.len());
    let mut used_images = Vec::with_capacity(image_points.len());

    for index in 0..object_points.len() {
        if !camera.is_object_point_in_front_if(&flipped_t_board, &object_points[index]) {
            continue;
        }

        let projected = camera.project_if(&flipped_t_board, &object_points[index]);
        let sqr_error = (projected - image_points[index]).norm_squared();

        if sqr_error <= max_projection_error * max_projection_error {
            used_ids.push(object_point_ids[index]);
            used_objects.push(object_points[index]);
            used_images.push(image_points[index]);
        }
    }

    Ok(BoardPose {
        board_t_camera: calib_board_core::pose::inverted_flipped_to_standard(&flipped_t_board),
        used_candidate_indices: valid_candidate_indices.to_vec(),
        object_point_ids: used_ids,
        object_points: used_objects,
        image_points: used_images,
    })
}

/// Correspondences for board dots a posed observation does not use yet.
///
/// Returns parallel lists of ids, object points, and image points matched
/// through the observation's camera and pose under the error gate.
pub fn determine_additional_correspondences(
    board: &MetricBoard,
    observation: &crate::observation::Observation,
    points: &[Point],
    grid: &PointGrid,
    max_projection_error: f64,
) -> (Vec<ObjectPointId>, Vec<Point3<f64>>, Vec<Point2<f64>>) {
    let x_markers = board.board().x_markers() as usize;
    let marker_count = board.board().marker_count();

    const ALL_POINTS_USED: u32 = (1 << MARKER_POINTS) - 1;

    let mut used_masks = vec![0u32; marker_count];

    for object_point_id in observation.object_point_ids() {
        let marker_index = object_point_id.coordinate.y as usize * x_markers
            + object_point_id.coordinate.x as usize;
        used_masks[marker_index] |= 1 << object_point_id.index_in_marker;
    }

    let flipped_t_board = standard_to_inverted_flipped(observation.board_t_camera());
    let camera = observation.camera();

    let mut additional_ids = Vec::new();
    let mut additional_objects = Vec::new();
    let mut additional_images = Vec::new();

    for (marker_index, &used_mask) in used_masks.iter().enumerate() {
        if used_mask == ALL_POINTS_USED {
            continue;
        }

        let coordinate = MarkerCoordinate::new(
            (marker_index % x_markers) as u32,
            (marker_index / x_markers) as u32,
        );
        let board_marker = board.board().marker(&coordinate);

        for index_in_marker in 0..MARKER_POINTS {
            if used_mask & (1 << index_in_marker) != 0 {
                continue;
            }

            let object_point = board.object_point(&coordinate, index_in_marker);

            if !camera.is_object_point_in_front_if(&flipped_t_board, &object_point) {
                continue;
            }

            let projected = camera.project_if(&flipped_t_board, &object_point);
            if !camera.is_inside(&projected, 0.0) {
                continue;
            }

            let query = Point2::new(projected.x as f32, projected.y as f32);
            let Some(closest) = grid.closest_two_points(points, query) else {
                continue;
            };

            if closest.closest_sqr_distance > (max_projection_error * max_projection_error) as f32 {
                continue;
            }

            if closest.second_sqr_distance <= closest.closest_sqr_distance * 4.0 {
                continue;
            }

            let point = &points[closest.closest_index];
            if point.sign() != board_marker.point_sign_oriented(index_in_marker) {
                continue;
            }

            additional_ids.push(ObjectPointId::new(coordinate, index_in_marker));
            additional_objects.push(object_point);
            additional_images.push(Point2::new(
                point.observation.x as f64,
                point.observation.y as f64,
            ));
        }
    }

    (additional_ids, additional_objects, additional_images)
}
