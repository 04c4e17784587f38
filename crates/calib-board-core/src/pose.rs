//! Pose conventions and planar pose recovery.
//!
//! Two camera frames are used throughout the pipeline:
//! - *standard*: the camera looks along its negative z-axis, y up
//!   (`world_T_camera`),
//! - *inverted flipped* (IF): the camera looks along its positive z-axis,
//!   y down (`flipped_T_world`), which is the frame projection happens in.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3};

/// Rotation by 180 degrees around the x-axis relating the two camera frames.
#[inline]
fn frame_flip() -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::identity(),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI),
    )
}

/// Converts `world_T_camera` (standard frame) into `flipped_T_world`.
pub fn standard_to_inverted_flipped(world_t_camera: &Isometry3<f64>) -> Isometry3<f64> {
    frame_flip() * world_t_camera.inverse()
}

/// Converts `flipped_T_world` back into `world_T_camera` (standard frame).
pub fn inverted_flipped_to_standard(flipped_t_world: &Isometry3<f64>) -> Isometry3<f64> {
    (frame_flip() * flipped_t_world).inverse()
}

/// Recovers `flipped_T_world` from a homography mapping board-plane
/// coordinates `(x, z)` onto normalized image coordinates.
///
/// The board lies in its xz-plane, so the homography columns correspond to
/// the rotation columns of the board's x- and z-axes plus the translation.
/// Returns `None` for degenerate (rank-deficient) homographies.
pub fn pose_from_plane_homography(h: &Matrix3<f64>) -> Option<Isometry3<f64>> {
    let c0 = h.column(0).into_owned();
    let c1 = h.column(1).into_owned();
    let c2 = h.column(2).into_owned();

    let norm0 = c0.norm();
    let norm1 = c1.norm();

    if norm0 < 1e-12 || norm1 < 1e-12 {
        return None;
    }

    let scale = 2.0 / (norm0 + norm1);

    let mut x_axis = c0 * scale;
    let mut z_axis = c1 * scale;
    let mut translation = c2 * scale;

    // The board must be in front of the camera in the IF frame.
    if translation.z < 0.0 {
        x_axis = -x_axis;
        z_axis = -z_axis;
        translation = -translation;
    }

    let y_axis = z_axis.cross(&x_axis);

    let mut rotation = Matrix3::zeros();
    rotation.set_column(0, &x_axis);
    rotation.set_column(1, &y_axis);
    rotation.set_column(2, &z_axis);

    // Orthonormalize: nearest rotation in the Frobenius sense.
    let svd = rotation.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let flipped_last = -u.column(2).into_owned();
        let mut u_fixed = u;
        u_fixed.set_column(2, &flipped_last);
        r = u_fixed * v_t;
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(r));

    Some(Isometry3::from_parts(
        Translation3::new(translation.x, translation.y, translation.z),
        rotation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    #[test]
    fn frame_conversions_invert_each_other() {
        let world_t_camera = Isometry3::from_parts(
            Translation3::new(0.3, -0.2, 1.5),
            UnitQuaternion::from_euler_angles(0.1, -0.4, 0.25),
        );

        let flipped = standard_to_inverted_flipped(&world_t_camera);
        let restored = inverted_flipped_to_standard(&flipped);

        let probe = Point3::new(0.5, 0.25, -0.75);
        assert_relative_eq!(world_t_camera * probe, restored * probe, epsilon = 1e-12);
    }

    #[test]
    fn plane_homography_recovers_pose() {
        // Ground-truth IF pose: board slightly rotated, 2 m in front.
        let flipped_t_board = Isometry3::from_parts(
            Translation3::new(0.1, -0.05, 2.0),
            UnitQuaternion::from_euler_angles(1.4, 0.2, -0.1),
        );

        let rotation = flipped_t_board.rotation.to_rotation_matrix();
        let mut h = Matrix3::zeros();
        h.set_column(0, &rotation.matrix().column(0).into_owned());
        h.set_column(1, &rotation.matrix().column(2).into_owned());
        h.set_column(2, &flipped_t_board.translation.vector);

        let recovered = pose_from_plane_homography(&(h * 3.7)).expect("pose");

        for point in [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.2, 0.0, -0.1),
            Point3::new(-0.15, 0.0, 0.3),
        ] {
            assert_relative_eq!(flipped_t_board * point, recovered * point, epsilon = 1e-9);
        }
    }
}
