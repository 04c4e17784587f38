//! Grouping refined points into marker candidates.
//!
//! A marker appears as a 5x5 grid of same-sign dots whose 16 border dots
//! form a square outline. Assembly grows straight point chains, closes
//! them into rectangles, connects neighboring candidates, recovers the
//! nine interior dots through a per-marker pose, and finally identifies
//! the catalog id and orientation.

use std::collections::{HashSet, VecDeque};

use nalgebra::{Isometry3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

use calib_board_core::{
    solve_pose, CameraModel, Point, PointGrid, PoseSolverConfig,
};

use crate::candidate::{MarkerCandidate, INVALID_INDEX};

/// Tuning knobs of marker assembly.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Maximal distance between chain seed points, in pixels.
    pub max_point_distance: f32,
    /// Prediction tolerance as a fraction of the local point spacing.
    pub max_distance_percentage: f32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_point_distance: 50.0,
            max_distance_percentage: 0.25,
        }
    }
}

/// Minimal pixel separation of a chain seed pair.
const MIN_SEED_DISTANCE: f32 = 5.0;

/// Finds border-only marker candidates and connects their neighborhoods.
pub fn determine_marker_candidates(
    points: &[Point],
    grid: &PointGrid,
    config: &AssemblerConfig,
) -> Vec<MarkerCandidate> {
    let mut used = vec![false; points.len()];
    let mut candidates = Vec::new();

    let mut seeds: Vec<(u32, f32)> = Vec::with_capacity(4);
    let mut line = VecDeque::with_capacity(17);

    for point_index in 0..points.len() {
        if used[point_index] {
            continue;
        }

        seeds.clear();
        grid.nearest_same_sign(
            points,
            point_index,
            config.max_point_distance * config.max_point_distance,
            4,
            &mut seeds,
        );

        for &(closest_index, _) in &seeds {
            if used[closest_index as usize] {
                continue;
            }

            line.clear();
            if !determine_continuous_line(
                point_index as u32,
                closest_index,
                points,
                &used,
                grid,
                config.max_distance_percentage,
                &mut line,
            ) {
                continue;
            }

            if line.len() != 5 {
                continue;
            }

            if determine_closed_rectangle(
                &mut line,
                points,
                &used,
                grid,
                config.max_distance_percentage,
            ) {
                debug_assert_eq!(line.len(), 16);

                let mut border = [0u32; 16];
                for (slot, &index) in border.iter_mut().zip(line.iter()) {
                    *slot = index;
                }

                for &index in &border {
                    debug_assert!(!used[index as usize]);
                    used[index as usize] = true;
                }

                candidates.push(MarkerCandidate::from_border(&border, points));
                break;
            }
        }
    }

    determine_candidate_neighborhood(&mut candidates, points, config.max_distance_percentage * 1.1);

    candidates
}

/// Grows a straight chain of same-sign points from a seed pair: up to four
/// steps forward from the second point, then up to four steps backwards
/// from the first. A chain of at least three points is a line.
fn determine_continuous_line(
    index_a: u32,
    index_b: u32,
    points: &[Point],
    used: &[bool],
    grid: &PointGrid,
    max_distance_percentage: f32,
    line: &mut VecDeque<u32>,
) -> bool {
    debug_assert!(index_a != index_b);
    debug_assert!(line.is_empty());

    let sign = points[index_a as usize].sign();
    debug_assert_eq!(sign, points[index_b as usize].sign());

    let offset = points[index_b as usize].observation - points[index_a as usize].observation;

    if offset.norm_squared() < MIN_SEED_DISTANCE * MIN_SEED_DISTANCE {
        return false;
    }

    line.push_back(index_a);
    line.push_back(index_b);

    let sqr_percentage = max_distance_percentage * max_distance_percentage;

    let mut updated_offset = offset;

    for _ in 0..4 {
        let previous = points[*line.back().unwrap() as usize].observation;
        let predicted = previous + updated_offset;

        let max_sqr_distance = updated_offset.norm_squared() * sqr_percentage;

        let Some(index) = grid.closest_point(points, predicted, sign, max_sqr_distance) else {
            break;
        };

        if used[index] || index as u32 == *line.back().unwrap() {
            break;
        }

        updated_offset = points[index].observation - previous;
        line.push_back(index as u32);
    }

    updated_offset = -offset;

    for _ in 0..4 {
        let previous = points[*line.front().unwrap() as usize].observation;
        let predicted = previous + updated_offset;

        let max_sqr_distance = updated_offset.norm_squared() * sqr_percentage;

        let Some(index) = grid.closest_point(points, predicted, sign, max_sqr_distance) else {
            break;
        };

        if used[index] || index as u32 == *line.front().unwrap() {
            break;
        }

        updated_offset = points[index].observation - previous;
        line.push_front(index as u32);
    }

    line.len() > 2
}

/// Extends a 5-point line with three perpendicular 5-point lines into a
/// closed 16-point border walk.
///
/// A T-intersection on the first perpendicular replaces the seed line and
/// restarts, which recovers from seeds running through a marker interior.
fn determine_closed_rectangle(
    line: &mut VecDeque<u32>,
    points: &[Point],
    used: &[bool],
    grid: &PointGrid,
    max_distance_percentage: f32,
) -> bool {
    debug_assert_eq!(line.len(), 5);

    let sign = points[*line.front().unwrap() as usize].sign();
    let sqr_percentage = max_distance_percentage * max_distance_percentage;

    let mut allow_replacing_seed_line = true;
    let mut perpendicular = VecDeque::with_capacity(10);

    let mut iteration = 1;
    while iteration < 4 {
        let last_index = *line.back().unwrap();
        let second_last_index = line[line.len() - 2];

        let last = points[last_index as usize].observation;
        let second_last = points[second_last_index as usize].observation;

        let end_vector = last - second_last;
        let perpendicular_vector = Vector2::new(-end_vector.y, end_vector.x);

        let mut found_next_line = false;

        for side in [1.0f32, -1.0] {
            perpendicular.clear();

            let predicted = last + perpendicular_vector * side;
            let max_sqr_distance = end_vector.norm_squared() * sqr_percentage;

            let Some(predicted_index) = grid.closest_point(points, predicted, sign, max_sqr_distance)
            else {
                continue;
            };

            if used[predicted_index] {
                continue;
            }

            if !determine_continuous_line(
                last_index,
                predicted_index as u32,
                points,
                used,
                grid,
                max_distance_percentage,
                &mut perpendicular,
            ) {
                continue;
            }

            if perpendicular.len() != 5 {
                continue;
            }

            if *perpendicular.front().unwrap() == last_index {
                line.extend(perpendicular.iter().skip(1));

                found_next_line = true;
                break;
            }

            if iteration == 1 && allow_replacing_seed_line {
                // The seed line hit this one mid-way: start over from the
                // perpendicular line instead.
                std::mem::swap(line, &mut perpendicular);
                iteration = 0;

                found_next_line = true;
                break;
            }
        }

        allow_replacing_seed_line = false;

        if !found_next_line {
            return false;
        }

        iteration += 1;
    }

    // A closed walk revisits its start as the 17th point.
    if line.len() == 17 && line.front() == line.back() {
        line.pop_back();
        return true;
    }

    false
}

/// Connects every opposite-sign candidate pair that shares an edge.
fn determine_candidate_neighborhood(
    candidates: &mut [MarkerCandidate],
    points: &[Point],
    max_distance_percentage: f32,
) {
    if candidates.len() <= 1 {
        return;
    }

    for outer in 0..candidates.len() {
        for inner in outer + 1..candidates.len() {
            let Some((outer_edge, inner_edge)) = candidates[outer].find_neighbor_edge(
                &candidates[inner],
                points,
                max_distance_percentage,
            ) else {
                continue;
            };

            candidates[outer].add_neighbor(outer_edge, inner);
            candidates[inner].add_neighbor(inner_edge, outer);
        }
    }
}

/// Canonical border dot positions of a unit-scale marker in its xz-plane.
fn unit_marker_object_point(index_in_marker: usize) -> Point3<f64> {
    let x = (index_in_marker % 5) as f64 - 2.0;
    let z = (index_in_marker / 5) as f64 - 2.0;
    Point3::new(x, 0.0, z)
}

/// Pose of a single marker candidate against the canonical unit marker.
pub fn determine_camera_pose_for_marker(
    camera: &CameraModel,
    candidate: &MarkerCandidate,
    points: &[Point],
    seed: u64,
    max_projection_error: f64,
) -> Option<Isometry3<f64>> {
    let mut object_points = Vec::with_capacity(25);
    let mut image_points = Vec::with_capacity(25);

    for index_in_marker in 0..25 {
        let point_index = candidate.point_index(index_in_marker);
        if point_index == INVALID_INDEX {
            continue;
        }

        let observation = points[point_index as usize].observation;

        object_points.push(unit_marker_object_point(index_in_marker));
        image_points.push(Point2::new(observation.x as f64, observation.y as f64));
    }

    debug_assert!(object_points.len() >= 16);

    let solution = solve_pose(
        camera,
        &object_points,
        &image_points,
        &PoseSolverConfig {
            seed,
            min_inliers: object_points.len(),
            max_iterations: 20,
            sqr_error_threshold: max_projection_error * max_projection_error,
            refine: true,
        },
    )
    .ok()?;

    Some(solution.world_t_camera)
}

/// Resolves the nine interior dots of a border-only candidate by projecting
/// the canonical interior positions through the marker pose.
///
/// Every projection must hit a unique detected point: within the error
/// gate, with the runner-up at least twice as far, and not a point already
/// claimed by the candidate.
pub fn determine_remaining_marker_point_indices(
    camera: &CameraModel,
    marker_t_camera: &Isometry3<f64>,
    candidate: &mut MarkerCandidate,
    points: &[Point],
    grid: &PointGrid,
    max_projection_error: f64,
) -> bool {
    debug_assert!(candidate.has_valid_border_indices());
    debug_assert!(!candidate.has_valid_indices());

    let mut claimed: HashSet<u32> = HashSet::with_capacity(25);
    for index_in_border in 0..16 {
        claimed.insert(candidate.border_index(index_in_border));
    }

    if claimed.len() != 16 {
        return false;
    }

    let flipped_t_marker = calib_board_core::pose::standard_to_inverted_flipped(marker_t_camera);

    for row in 1..4 {
        for col in 1..4 {
            let index_in_marker = row * 5 + col;

            let projected = camera.project_if(
                &flipped_t_marker,
                &unit_marker_object_point(index_in_marker),
            );

            if !camera.is_inside(&projected, 0.0) {
                return false;
            }

            let query = Point2::new(projected.x as f32, projected.y as f32);

            let Some(closest) = grid.closest_two_points(points, query) else {
                return false;
            };

            if closest.closest_sqr_distance > (max_projection_error * max_projection_error) as f32 {
                return false;
            }

            // The runner-up must be clearly farther for a unique match.
            if closest.second_sqr_distance <= closest.closest_sqr_distance * 4.0 {
                return false;
            }

            if !claimed.insert(closest.closest_index as u32) {
                // the projection re-used a border point
                return false;
            }

            candidate.set_point_index(index_in_marker, closest.closest_index as u32);
        }
    }

    debug_assert!(claimed.len() == 25);

    true
}

/// Runs pose estimation, interior fill, and identification over all
/// candidates, removing every candidate that fails a stage.
pub fn identify_candidates(
    camera: &CameraModel,
    candidates: &mut Vec<MarkerCandidate>,
    points: &[Point],
    grid: &PointGrid,
    seed: u64,
    max_projection_error: f64,
) {
    let mut candidate_index = 0;

    while candidate_index < candidates.len() {
        let candidate = &mut candidates[candidate_index];

        let advanced = determine_camera_pose_for_marker(
            camera,
            candidate,
            points,
            seed.wrapping_add(candidate_index as u64),
            max_projection_error,
        )
        .map(|marker_t_camera| {
            determine_remaining_marker_point_indices(
                camera,
                &marker_t_camera,
                candidate,
                points,
                grid,
                max_projection_error,
            )
        })
        .unwrap_or(false)
            && candidate.determine_marker_id(points);

        if advanced {
            candidate_index += 1;
        } else {
            MarkerCandidate::remove_candidate(candidates, candidate_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_board::catalog;
    use calib_board_core::pose::standard_to_inverted_flipped;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn camera() -> CameraModel {
        CameraModel::pinhole_from_fov_x(640, 480, 60f64.to_radians())
    }

    fn marker_pose() -> Isometry3<f64> {
        // Marker 20 units in front of the camera facing it, slightly tilted
        // away from fronto-parallel.
        calib_board_core::pose::inverted_flipped_to_standard(&Isometry3::from_parts(
            Translation3::new(0.3, -0.2, 20.0),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -1.35),
        ))
    }

    /// Projects all 25 dots of a marker with the signs of a catalog layout.
    fn project_marker(
        camera: &CameraModel,
        marker_t_camera: &Isometry3<f64>,
        marker_id: usize,
        normal: bool,
    ) -> Vec<Point> {
        let flipped = standard_to_inverted_flipped(marker_t_camera);

        (0..25)
            .map(|index_in_marker| {
                let projected = camera.project_if(&flipped, &unit_marker_object_point(index_in_marker));
                let sign = catalog::layout_point_sign_by_index(
                    marker_id,
                    normal,
                    catalog::Orientation::Deg0,
                    index_in_marker,
                );

                Point::new(
                    Point2::new(projected.x as f32, projected.y as f32),
                    3,
                    if sign { 50.0 } else { -50.0 },
                )
            })
            .collect()
    }

    fn grid_for(points: &[Point]) -> PointGrid {
        let mut grid = PointGrid::new(640, 480, 50.0);
        grid.rebuild(points);
        grid
    }

    #[test]
    fn assembles_and_identifies_projected_marker() {
        let camera = camera();
        let marker_id = 23;

        let points = project_marker(&camera, &marker_pose(), marker_id, true);
        let grid = grid_for(&points);

        let mut candidates =
            determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].has_valid_border_indices());

        identify_candidates(&camera, &mut candidates, &points, &grid, 11, 10.0);

        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];

        assert!(candidate.has_valid_indices());
        assert_eq!(candidate.marker_id(), Some(marker_id));
        assert!(candidate.sign());

        // Canonical orientation: every resolved dot sign matches the layout.
        for index_in_marker in 0..25 {
            let point = &points[candidate.point_index(index_in_marker) as usize];
            let expected = catalog::layout_point_sign_by_index(
                marker_id,
                true,
                catalog::Orientation::Deg0,
                index_in_marker,
            );
            assert_eq!(point.sign(), expected);
        }
    }

    #[test]
    fn identification_recovers_rotated_markers() {
        let camera = camera();
        let marker_id = 3;

        // Rotate the whole marker a quarter turn in its plane: the border
        // walk starts elsewhere, identification must undo the rotation.
        let rotated_pose = marker_pose()
            * Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::FRAC_PI_2),
            );

        let points = project_marker(&camera, &rotated_pose, marker_id, false);
        let grid = grid_for(&points);

        let mut candidates =
            determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
        assert_eq!(candidates.len(), 1);

        identify_candidates(&camera, &mut candidates, &points, &grid, 5, 10.0);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].marker_id(), Some(marker_id));
        assert!(!candidates[0].sign());
    }

    #[test]
    fn clutter_points_produce_no_candidate() {
        // Random-ish scatter without any grid structure.
        let points: Vec<Point> = (0..40)
            .map(|n| {
                let x = 37.0 + (n as f32 * 97.3) % 560.0;
                let y = 29.0 + (n as f32 * 53.7) % 410.0;
                Point::new(Point2::new(x, y), 2, 40.0)
            })
            .collect();
        let grid = grid_for(&points);

        let candidates = determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
        assert!(candidates.is_empty());
    }

    #[test]
    fn continuous_line_requires_spacing_and_alignment() {
        let mut points: Vec<Point> = (0..5)
            .map(|n| Point::new(Point2::new(100.0 + n as f32 * 12.0, 50.0), 2, 30.0))
            .collect();
        // A same-sign point far off the line must not join it.
        points.push(Point::new(Point2::new(130.0, 90.0), 2, 30.0));

        let grid = grid_for(&points);
        let used = vec![false; points.len()];

        let mut line = VecDeque::new();
        assert!(determine_continuous_line(
            0,
            1,
            &points,
            &used,
            &grid,
            0.25,
            &mut line
        ));
        assert_eq!(line.len(), 5);
        assert_eq!(line, VecDeque::from(vec![0, 1, 2, 3, 4]));

        // Seed pair below the minimal spacing fails.
        let tight = vec![
            Point::new(Point2::new(10.0, 10.0), 2, 30.0),
            Point::new(Point2::new(12.0, 10.0), 2, 30.0),
        ];
        let tight_grid = grid_for(&tight);
        let mut rejected = VecDeque::new();
        assert!(!determine_continuous_line(
            0,
            1,
            &tight,
            &[false, false],
            &tight_grid,
            0.25,
            &mut rejected
        ));
    }

    #[test]
    fn neighboring_markers_get_connected() {
        let camera = camera();
        let pose = marker_pose();

        let mut points = project_marker(&camera, &pose, 7, true);

        // A second, inverted marker one marker width to the east.
        let east_pose = pose
            * Isometry3::from_parts(Translation3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());
        points.extend(project_marker(&camera, &east_pose, 9, false));

        let grid = grid_for(&points);

        let candidates = determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].neighbor_count(), 1);
        assert_eq!(candidates[1].neighbor_count(), 1);

        let (edge, index) = candidates[0].neighbors().next().unwrap();
        assert_eq!(index, 1);
        assert_eq!(candidates[0].neighbor_direction(1), Some(edge));

        let (_, back_index) = candidates[1].neighbors().next().unwrap();
        assert_eq!(back_index, 0);
    }
}
