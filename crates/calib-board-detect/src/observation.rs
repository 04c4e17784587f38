//! One image's full detection result.

use std::cell::Cell;

use nalgebra::{Isometry3, Point2, Point3};

use calib_board::ObjectPointId;
use calib_board_core::CameraModel;

/// Edge length of the coverage bins, in pixels.
const COVERAGE_BIN_PIXELS: u32 = 40;

/// A successfully detected board in one image: the camera estimate at the
/// time of detection, the board-to-camera pose, and all 2D/3D
/// correspondences in use.
///
/// The coverage value is cached and recomputed lazily whenever the
/// correspondence set or the camera changes.
#[derive(Clone, Debug)]
pub struct Observation {
    image_id: u64,
    camera: CameraModel,
    board_t_camera: Isometry3<f64>,
    object_point_ids: Vec<ObjectPointId>,
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
    coverage: Cell<f32>,
}

impl Observation {
    pub fn new(
        image_id: u64,
        camera: CameraModel,
        board_t_camera: Isometry3<f64>,
        object_point_ids: Vec<ObjectPointId>,
        object_points: Vec<Point3<f64>>,
        image_points: Vec<Point2<f64>>,
    ) -> Self {
        debug_assert_eq!(object_point_ids.len(), object_points.len());
        debug_assert_eq!(object_point_ids.len(), image_points.len());

        Self {
            image_id,
            camera,
            board_t_camera,
            object_point_ids,
            object_points,
            image_points,
            coverage: Cell::new(-1.0),
        }
    }

    #[inline]
    pub fn image_id(&self) -> u64 {
        self.image_id
    }

    #[inline]
    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    #[inline]
    pub fn board_t_camera(&self) -> &Isometry3<f64> {
        &self.board_t_camera
    }

    #[inline]
    pub fn object_point_ids(&self) -> &[ObjectPointId] {
        &self.object_point_ids
    }

    #[inline]
    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    #[inline]
    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }

    #[inline]
    pub fn correspondence_count(&self) -> usize {
        self.object_points.len()
    }

    /// Appends new correspondences; the ids must not repeat existing ones.
    pub fn add_correspondences(
        &mut self,
        object_point_ids: &[ObjectPointId],
        object_points: &[Point3<f64>],
        image_points: &[Point2<f64>],
    ) {
        debug_assert_eq!(object_point_ids.len(), object_points.len());
        debug_assert_eq!(object_point_ids.len(), image_points.len());

        #[cfg(debug_assertions)]
        {
            let existing: std::collections::HashSet<_> =
                self.object_point_ids.iter().copied().collect();
            debug_assert!(object_point_ids.iter().all(|id| !existing.contains(id)));
        }

        self.object_point_ids.extend_from_slice(object_point_ids);
        self.object_points.extend_from_slice(object_points);
        self.image_points.extend_from_slice(image_points);

        self.coverage.set(-1.0);
    }

    /// Replaces the camera estimate and pose after a refinement pass.
    pub fn update_camera(&mut self, camera: CameraModel, board_t_camera: Isometry3<f64>) {
        self.camera = camera;
        self.board_t_camera = board_t_camera;
        self.coverage.set(-1.0);
    }

    /// Fraction of coverage bins containing at least one used image point.
    pub fn coverage(&self) -> f32 {
        let cached = self.coverage.get();
        if cached >= 0.0 {
            return cached;
        }

        let computed = self.determine_coverage(COVERAGE_BIN_PIXELS);
        self.coverage.set(computed);
        computed
    }

    fn determine_coverage(&self, pixels_per_bin: u32) -> f32 {
        if self.image_points.is_empty() {
            return 0.0;
        }

        let width = self.camera.width();
        let height = self.camera.height();

        let horizontal_bins = ((width + pixels_per_bin / 2) / pixels_per_bin).max(1);
        let vertical_bins = ((height + pixels_per_bin / 2) / pixels_per_bin).max(1);

        let mut occupied = vec![false; horizontal_bins as usize * vertical_bins as usize];
        let mut used_bins = 0usize;

        for point in &self.image_points {
            let x_bin = ((point.x / width as f64 * horizontal_bins as f64) as i64)
                .clamp(0, horizontal_bins as i64 - 1) as usize;
            let y_bin = ((point.y / height as f64 * vertical_bins as f64) as i64)
                .clamp(0, vertical_bins as i64 - 1) as usize;

            let bin = y_bin * horizontal_bins as usize + x_bin;
            if !occupied[bin] {
                occupied[bin] = true;
                used_bins += 1;
            }
        }

        used_bins as f32 / occupied.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_board::MarkerCoordinate;
    use nalgebra::{Translation3, UnitQuaternion};

    fn observation_with(points: Vec<Point2<f64>>) -> Observation {
        let ids: Vec<ObjectPointId> = (0..points.len())
            .map(|n| ObjectPointId::new(MarkerCoordinate::new(n as u32, 0), 0))
            .collect();
        let objects = vec![Point3::new(0.0, 0.0, 0.0); points.len()];

        Observation::new(
            0,
            CameraModel::pinhole_from_fov_x(640, 480, 60f64.to_radians()),
            Isometry3::from_parts(Translation3::identity(), UnitQuaternion::identity()),
            ids,
            objects,
            points,
        )
    }

    #[test]
    fn empty_observation_has_zero_coverage() {
        let observation = observation_with(Vec::new());
        assert_eq!(observation.coverage(), 0.0);
    }

    #[test]
    fn coverage_counts_distinct_bins() {
        // Two points in the same 40 px bin, one far away.
        let observation = observation_with(vec![
            Point2::new(10.0, 10.0),
            Point2::new(12.0, 11.0),
            Point2::new(600.0, 400.0),
        ]);

        let bins_x = 640 / 40;
        let bins_y = 480 / 40;
        let expected = 2.0 / (bins_x * bins_y) as f32;

        assert!((observation.coverage() - expected).abs() < 1e-6);
    }

    #[test]
    fn adding_correspondences_never_lowers_coverage() {
        let mut observation = observation_with(vec![Point2::new(10.0, 10.0)]);
        let before = observation.coverage();

        observation.add_correspondences(
            &[ObjectPointId::new(MarkerCoordinate::new(30, 30), 1)],
            &[Point3::new(0.1, 0.0, 0.1)],
            &[Point2::new(300.0, 200.0)],
        );

        let after = observation.coverage();
        assert!(after >= before);
        assert!(after > before, "a new bin must raise the coverage");
    }
}
