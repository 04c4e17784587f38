//! End-to-end detection pipeline on synthetic board views.

use nalgebra::{Isometry3, Point2, Translation3, UnitQuaternion, Vector3};

use calib_board::{Board, MetricBoard};
use calib_board_core::pose::{inverted_flipped_to_standard, standard_to_inverted_flipped};
use calib_board_core::{CameraKind, CameraModel, PointGrid};
use calib_board_detect::{
    densify_board_pose, determine_initial_pose, determine_marker_candidates,
    identify_candidates, initial_camera_from_fov_sweep, locate_candidates, synthetic,
    AssemblerConfig, CoordinateUsage, FovSweepConfig, LocatorConfig, PointDetector,
    PointDetectorConfig,
};

fn camera() -> CameraModel {
    CameraModel::pinhole_from_fov_x(640, 480, 60f64.to_radians())
}

/// Board facing the camera with a mild out-of-plane tilt.
fn tilted_pose(distance: f64, tilt: f64) -> Isometry3<f64> {
    let facing = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -std::f64::consts::FRAC_PI_2);
    let wobble = UnitQuaternion::from_euler_angles(tilt, tilt * 0.6, 0.05);

    inverted_flipped_to_standard(&Isometry3::from_parts(
        Translation3::new(0.0, 0.0, distance),
        wobble * facing,
    ))
}

fn metric_board() -> MetricBoard {
    MetricBoard::new(Board::generate(42, 5, 5).unwrap(), 0.03, 0.03).unwrap()
}

#[test]
fn ideal_points_locate_every_marker() {
    let board = metric_board();
    let camera = camera();
    let pose = tilted_pose(0.35, 0.2);

    let points = synthetic::board_points(&board, &camera, &pose);
    assert_eq!(points.len(), 25 * 25);

    let mut grid = PointGrid::new(camera.width(), camera.height(), 50.0);
    grid.rebuild(&points);

    let mut candidates = determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
    assert_eq!(candidates.len(), 25, "every marker becomes a candidate");

    identify_candidates(&camera, &mut candidates, &points, &grid, 9, 10.0);
    assert_eq!(candidates.len(), 25, "every candidate identifies");

    let placed = locate_candidates(board.board(), &mut candidates, &LocatorConfig::default());
    assert_eq!(placed, 25, "every candidate finds its board cell");

    // Each placed candidate's center matches the projected marker center.
    let flipped = standard_to_inverted_flipped(&pose);
    for candidate in &candidates {
        let coordinate = candidate.coordinate().unwrap();
        let projected_center =
            camera.project_if(&flipped, &board.marker_center(&coordinate));

        let center = candidate.center(&points);
        let distance = ((center.x as f64 - projected_center.x).powi(2)
            + (center.y as f64 - projected_center.y).powi(2))
        .sqrt();

        assert!(distance < 2.0, "candidate center off by {distance:.2} px");
    }
}

#[test]
fn bootstrap_recovers_pose_and_all_correspondences() {
    let board = metric_board();
    let camera = camera();
    let pose = tilted_pose(0.35, 0.2);

    let points = synthetic::board_points(&board, &camera, &pose);
    let mut grid = PointGrid::new(camera.width(), camera.height(), 50.0);
    grid.rebuild(&points);

    let mut candidates = determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
    identify_candidates(&camera, &mut candidates, &points, &grid, 9, 10.0);
    locate_candidates(board.board(), &mut candidates, &LocatorConfig::default());

    let mut usage = CoordinateUsage::default();

    let initial = determine_initial_pose(
        &board,
        &camera,
        &candidates,
        &points,
        camera.width(),
        camera.height(),
        &mut usage,
        17,
        10.0,
    )
    .expect("initial pose");

    assert!(!initial.used_candidate_indices.is_empty());

    let densified = densify_board_pose(
        &board,
        &camera,
        &initial.board_t_camera,
        &candidates,
        &initial.used_candidate_indices,
        &points,
        &grid,
        &mut usage,
        5.0,
    )
    .expect("densified pose");

    // With ideal points the whole board is recovered.
    assert_eq!(densified.object_points.len(), 25 * 25);

    // The pose reproduces the ground truth projection.
    let recovered_flipped = standard_to_inverted_flipped(&densified.board_t_camera);
    let truth_flipped = standard_to_inverted_flipped(&pose);

    let mut worst = 0.0f64;
    for object_point in &densified.object_points {
        let a = camera.project_if(&recovered_flipped, object_point);
        let b = camera.project_if(&truth_flipped, object_point);
        worst = worst.max((a - b).norm());
    }

    assert!(worst < 0.1, "worst reprojection disagreement {worst:.4} px");

    let translation_error = (densified.board_t_camera.translation.vector
        - pose.translation.vector)
        .norm();
    assert!(translation_error < 1e-3 * 0.15, "translation off by {translation_error}");

    let rotation_error = densified
        .board_t_camera
        .rotation
        .angle_to(&pose.rotation);
    assert!(rotation_error < 1e-3, "rotation off by {rotation_error}");
}

#[test]
fn fov_sweep_finds_the_true_field_of_view() {
    let board = metric_board();
    let camera = camera();
    let pose = tilted_pose(0.35, 0.35);

    let points = synthetic::board_points(&board, &camera, &pose);
    let mut grid = PointGrid::new(camera.width(), camera.height(), 50.0);
    grid.rebuild(&points);

    let candidates = determine_marker_candidates(&points, &grid, &AssemblerConfig::default());
    assert!(candidates.len() >= 20);

    let initial = initial_camera_from_fov_sweep(
        camera.width(),
        camera.height(),
        &points,
        &candidates,
        None,
        &FovSweepConfig::default(),
        23,
    )
    .expect("initial camera");

    assert_eq!(initial.kind(), CameraKind::Pinhole);

    let error = (initial.fov_x() - 60f64.to_radians()).abs();
    assert!(
        error < 10f64.to_radians(),
        "fov sweep off by {:.1} deg",
        error.to_degrees()
    );
}

#[test]
fn rendered_frame_detection_matches_ideal_points() {
    let board = metric_board();
    let camera = camera();
    let pose = tilted_pose(0.22, 0.12);

    let frame = synthetic::render_board_image(&board, &camera, &pose);
    let ideal = synthetic::board_points(&board, &camera, &pose);

    let mut detector = PointDetector::new(PointDetectorConfig::default());
    detector.detect_points(&frame.view()).unwrap();

    let detected = detector.points();
    assert!(
        detected.len() >= ideal.len() * 9 / 10,
        "detected {} of {} dots",
        detected.len(),
        ideal.len()
    );

    // Every detection matches an ideal dot of the same sign, sub-pixel
    // close.
    let mut total_error = 0.0f32;
    let mut matched = 0usize;

    for point in detected {
        let best = ideal
            .iter()
            .filter(|candidate| candidate.sign() == point.sign())
            .map(|candidate| (candidate.observation - point.observation).norm())
            .fold(f32::MAX, f32::min);

        assert!(best < 1.0, "detection {} px away from any dot", best);
        total_error += best;
        matched += 1;
    }

    let mean_error = total_error / matched as f32;
    assert!(mean_error < 0.25, "mean localization error {mean_error:.3} px");
}

#[test]
fn rendered_frame_runs_the_full_pipeline() {
    let board = metric_board();
    let camera = camera();
    let pose = tilted_pose(0.22, 0.12);

    let frame = synthetic::render_board_image(&board, &camera, &pose);

    let mut detector = PointDetector::new(PointDetectorConfig::default());
    detector.detect_points(&frame.view()).unwrap();

    let points: Vec<_> = detector.points().to_vec();
    let grid = detector.grid();

    let mut candidates = determine_marker_candidates(&points, grid, &AssemblerConfig::default());
    identify_candidates(&camera, &mut candidates, &points, grid, 31, 10.0);
    let placed = locate_candidates(board.board(), &mut candidates, &LocatorConfig::default());

    assert!(placed >= 16, "only {placed} candidates placed");

    let mut usage = CoordinateUsage::default();
    let initial = determine_initial_pose(
        &board,
        &camera,
        &candidates,
        &points,
        camera.width(),
        camera.height(),
        &mut usage,
        3,
        10.0,
    )
    .expect("initial pose");

    let densified = densify_board_pose(
        &board,
        &camera,
        &initial.board_t_camera,
        &candidates,
        &initial.used_candidate_indices,
        &points,
        grid,
        &mut usage,
        5.0,
    )
    .expect("densified pose");

    assert!(
        densified.object_points.len() >= 500,
        "only {} correspondences",
        densified.object_points.len()
    );

    // Reprojection residuals stay sub-pixel on average.
    let flipped = standard_to_inverted_flipped(&densified.board_t_camera);
    let mut error_sum = 0.0f64;
    for (object_point, image_point) in densified
        .object_points
        .iter()
        .zip(&densified.image_points)
    {
        let projected = camera.project_if(&flipped, object_point);
        error_sum += (projected - Point2::new(image_point.x, image_point.y)).norm();
    }
    let mean_error = error_sum / densified.object_points.len() as f64;

    assert!(mean_error < 0.5, "mean reprojection error {mean_error:.3} px");
}
