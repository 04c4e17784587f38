//! Synthetic board views for tests, benchmarks, and demos.
//!
//! Generates either ideal point observations or rendered grayscale frames
//! of a metric board seen through a known camera, the ground-truth input
//! for exercising the detection pipeline end to end.

use nalgebra::{Isometry3, Point2, Point3};

use calib_board::{MarkerSign, MetricBoard, MARKER_GRID, MARKER_POINTS};
use calib_board_core::pose::standard_to_inverted_flipped;
use calib_board_core::{CameraModel, GrayImage, Point};

/// Dot radius as a fraction of one dot cell. Printed boards keep the dots
/// small relative to the cell so the ring kernels see clean surround.
const DOT_RADIUS_FRACTION: f64 = 0.12;

/// Ideal detector output: every board dot projected through the camera,
/// with the sign the detector would report. Dots projecting outside the
/// image (10 px margin) are skipped.
pub fn board_points(
    board: &MetricBoard,
    camera: &CameraModel,
    world_t_camera: &Isometry3<f64>,
) -> Vec<Point> {
    let flipped_t_world = standard_to_inverted_flipped(world_t_camera);

    let mut points = Vec::with_capacity(board.board().point_count());

    for marker in board.board().markers() {
        for index_in_marker in 0..MARKER_POINTS {
            let object_point = board.object_point(&marker.coordinate, index_in_marker);

            if !camera.is_object_point_in_front_if(&flipped_t_world, &object_point) {
                continue;
            }

            let projected = camera.project_if(&flipped_t_world, &object_point);
            if !camera.is_inside(&projected, 10.0) {
                continue;
            }

            let sign = marker.point_sign_oriented(index_in_marker);

            points.push(Point::new(
                Point2::new(projected.x as f32, projected.y as f32),
                3,
                if sign { 50.0 } else { -50.0 },
            ));
        }
    }

    points
}

/// Renders the board into a grayscale frame.
///
/// Marker cells are filled with the marker's background shade, toggled dot
/// cells with the inverted shade, and every dot is drawn as an
/// anti-aliased disc, matching the printed board artwork.
pub fn render_board_image(
    board: &MetricBoard,
    camera: &CameraModel,
    world_t_camera: &Isometry3<f64>,
) -> GrayImage {
    let flipped_t_world = standard_to_inverted_flipped(world_t_camera);

    let mut image = GrayImage::new(camera.width(), camera.height(), 0x80);

    let project = |x: f64, z: f64| -> Point2<f64> {
        camera.project_if(&flipped_t_world, &Point3::new(x, 0.0, z))
    };

    // Paper background including the padding border.
    let padding_x = board.x_marker_size() * calib_board::PADDING_FACTOR;
    let padding_z = board.z_marker_size() * calib_board::PADDING_FACTOR;
    let half_width = board.markers_width() / 2.0 + padding_x;
    let half_height = board.markers_height() / 2.0 + padding_z;

    fill_quad(
        &mut image,
        &[
            project(-half_width, -half_height),
            project(half_width, -half_height),
            project(half_width, half_height),
            project(-half_width, half_height),
        ],
        0xFF,
    );

    let cell_x = board.x_marker_size() / MARKER_GRID as f64;
    let cell_z = board.z_marker_size() / MARKER_GRID as f64;

    // Marker backgrounds.
    for marker in board.board().markers() {
        let center = board.marker_center(&marker.coordinate);
        let half_x = board.x_marker_size() / 2.0;
        let half_z = board.z_marker_size() / 2.0;

        let shade = if marker.marker.sign == MarkerSign::Normal {
            0xFF
        } else {
            0x00
        };

        fill_quad(
            &mut image,
            &[
                project(center.x - half_x, center.z - half_z),
                project(center.x + half_x, center.z - half_z),
                project(center.x + half_x, center.z + half_z),
                project(center.x - half_x, center.z + half_z),
            ],
            shade,
        );
    }

    // Toggled dot cells carry the inverted background patch.
    for marker in board.board().markers() {
        let background_sign = marker.marker.sign == MarkerSign::Normal;

        for index_in_marker in 0..MARKER_POINTS {
            let dot_sign = marker.point_sign_oriented(index_in_marker);
            if dot_sign == background_sign {
                continue;
            }

            let dot_center = board.object_point(&marker.coordinate, index_in_marker);
            let half_x = cell_x / 2.0;
            let half_z = cell_z / 2.0;

            let shade = if dot_sign { 0xFF } else { 0x00 };

            fill_quad(
                &mut image,
                &[
                    project(dot_center.x - half_x, dot_center.z - half_z),
                    project(dot_center.x + half_x, dot_center.z - half_z),
                    project(dot_center.x + half_x, dot_center.z + half_z),
                    project(dot_center.x - half_x, dot_center.z + half_z),
                ],
                shade,
            );
        }
    }

    // Dots on top.
    let dot_radius = cell_x.min(cell_z) * DOT_RADIUS_FRACTION;

    for marker in board.board().markers() {
        for index_in_marker in 0..MARKER_POINTS {
            let dot_sign = marker.point_sign_oriented(index_in_marker);
            let dot_center = board.object_point(&marker.coordinate, index_in_marker);

            let center = project(dot_center.x, dot_center.z);
            if !center.x.is_finite() || !center.y.is_finite() {
                continue;
            }

            // Projected radius from the local image scale.
            let offset = project(dot_center.x + dot_radius, dot_center.z);
            let radius = (offset - center).norm();

            if !(0.5..=50.0).contains(&radius) {
                continue;
            }

            let shade = if dot_sign { 0x00 } else { 0xFF };
            fill_disc(&mut image, &center, radius, shade);
        }
    }

    image
}

/// Fills a convex quadrilateral with 2x2 supersampled coverage blending.
fn fill_quad(image: &mut GrayImage, corners: &[Point2<f64>; 4], shade: u8) {
    if corners
        .iter()
        .any(|corner| !corner.x.is_finite() || !corner.y.is_finite())
    {
        return;
    }

    let min_x = corners.iter().fold(f64::MAX, |m, c| m.min(c.x)).floor().max(0.0) as u32;
    let min_y = corners.iter().fold(f64::MAX, |m, c| m.min(c.y)).floor().max(0.0) as u32;
    let max_x = (corners.iter().fold(f64::MIN, |m, c| m.max(c.x)).ceil() as i64)
        .clamp(0, image.width as i64 - 1) as u32;
    let max_y = (corners.iter().fold(f64::MIN, |m, c| m.max(c.y)).ceil() as i64)
        .clamp(0, image.height as i64 - 1) as u32;

    if min_x > max_x || min_y > max_y {
        return;
    }

    // Winding sign of the polygon (projection can mirror it).
    let area = polygon_area(corners);
    if area.abs() < 1e-9 {
        return;
    }
    let winding = area.signum();

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let mut coverage = 0.0f64;

            for sub_y in 0..2 {
                for sub_x in 0..2 {
                    let px = x as f64 + (sub_x as f64 + 0.5) / 2.0 - 0.5;
                    let py = y as f64 + (sub_y as f64 + 0.5) / 2.0 - 0.5;

                    if inside_convex(corners, px, py, winding) {
                        coverage += 0.25;
                    }
                }
            }

            if coverage > 0.0 {
                let base = image.pixel(x, y) as f64;
                let blended = base + (shade as f64 - base) * coverage;
                image.set_pixel(x, y, blended.round() as u8);
            }
        }
    }
}

fn polygon_area(corners: &[Point2<f64>; 4]) -> f64 {
    let mut area = 0.0;
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        area += a.x * b.y - b.x * a.y;
    }
    area / 2.0
}

fn inside_convex(corners: &[Point2<f64>; 4], px: f64, py: f64, winding: f64) -> bool {
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];

        let cross = (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x);
        if cross * winding < 0.0 {
            return false;
        }
    }
    true
}

/// Draws an anti-aliased disc with 4x4 supersampled coverage blending.
fn fill_disc(image: &mut GrayImage, center: &Point2<f64>, radius: f64, shade: u8) {
    let min_x = ((center.x - radius - 1.0).floor().max(0.0)) as u32;
    let min_y = ((center.y - radius - 1.0).floor().max(0.0)) as u32;
    let max_x = (((center.x + radius + 1.0).ceil()) as i64).clamp(0, image.width as i64 - 1) as u32;
    let max_y = (((center.y + radius + 1.0).ceil()) as i64).clamp(0, image.height as i64 - 1) as u32;

    if min_x > max_x || min_y > max_y {
        return;
    }

    let sqr_radius = radius * radius;

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let mut coverage = 0.0f64;

            for sub_y in 0..4 {
                for sub_x in 0..4 {
                    let px = x as f64 + (sub_x as f64 + 0.5) / 4.0 - 0.5;
                    let py = y as f64 + (sub_y as f64 + 0.5) / 4.0 - 0.5;

                    let sqr = (px - center.x).powi(2) + (py - center.y).powi(2);
                    if sqr <= sqr_radius {
                        coverage += 1.0 / 16.0;
                    }
                }
            }

            if coverage > 0.0 {
                let base = image.pixel(x, y) as f64;
                let blended = base + (shade as f64 - base) * coverage;
                image.set_pixel(x, y, blended.round() as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_board_core::pose::inverted_flipped_to_standard;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn facing_pose(distance: f64) -> Isometry3<f64> {
        inverted_flipped_to_standard(&Isometry3::from_parts(
            Translation3::new(0.0, 0.0, distance),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -std::f64::consts::FRAC_PI_2),
        ))
    }

    #[test]
    fn point_projection_covers_visible_board() {
        let board = MetricBoard::generate(42, 5, 5, 0.03, 0.03).unwrap();
        let camera = CameraModel::pinhole_from_fov_x(640, 480, 60f64.to_radians());

        let points = board_points(&board, &camera, &facing_pose(0.4));
        assert_eq!(points.len(), 5 * 5 * 25);

        // Signs are balanced: neighbors alternate between normal and
        // inverted markers, dominant dot signs alternate with them.
        let dark = points.iter().filter(|p| p.sign()).count();
        assert!(dark > points.len() / 4 && dark < points.len() * 3 / 4);
    }

    #[test]
    fn rendered_frame_shows_dot_contrast() {
        let board = MetricBoard::generate(42, 5, 5, 0.03, 0.03).unwrap();
        let camera = CameraModel::pinhole_from_fov_x(640, 480, 60f64.to_radians());
        let pose = facing_pose(0.4);

        let image = render_board_image(&board, &camera, &pose);
        let points = board_points(&board, &camera, &pose);

        // At every ideal dot position the frame carries the dot shade.
        let view = image.view();
        for point in &points {
            let pixel =
                calib_board_core::sample_bilinear(&view, point.observation.x, point.observation.y);
            if point.sign() {
                assert!(pixel < 100.0, "dark dot rendered at {pixel}");
            } else {
                assert!(pixel > 155.0, "bright dot rendered at {pixel}");
            }
        }
    }
}
