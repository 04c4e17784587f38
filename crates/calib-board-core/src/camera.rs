use nalgebra::{Isometry3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

/// Camera model kind, used to request a specific model during bootstrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    Pinhole,
    Fisheye,
}

/// Selects a subset of intrinsic parameters for staged optimization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamSet(u32);

impl ParamSet {
    pub const EMPTY: ParamSet = ParamSet(0);
    pub const FOCAL: ParamSet = ParamSet(1);
    pub const PRINCIPAL_POINT: ParamSet = ParamSet(1 << 1);
    pub const K1: ParamSet = ParamSet(1 << 2);
    pub const K2: ParamSet = ParamSet(1 << 3);
    pub const TANGENTIAL: ParamSet = ParamSet(1 << 4);
    pub const K3: ParamSet = ParamSet(1 << 5);
    pub const HIGHER_ORDER: ParamSet = ParamSet(1 << 6);

    #[inline]
    pub const fn with(self, other: ParamSet) -> ParamSet {
        ParamSet(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: ParamSet) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Pinhole camera with Brown-Conrady distortion (k1, k2, k3, p1, p2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Radial coefficients k1, k2, k3.
    pub radial: [f64; 3],
    /// Tangential coefficients p1, p2.
    pub tangential: [f64; 2],
}

impl PinholeCamera {
    /// Distortion-free camera with the principal point at the image center.
    pub fn from_fov_x(width: u32, height: u32, fov_x: f64) -> Self {
        debug_assert!(fov_x > 0.0 && fov_x < std::f64::consts::PI);

        let fx = 0.5 * width as f64 / (0.5 * fov_x).tan();

        Self {
            width,
            height,
            fx,
            fy: fx,
            cx: 0.5 * width as f64,
            cy: 0.5 * height as f64,
            radial: [0.0; 3],
            tangential: [0.0; 2],
        }
    }

    pub fn fov_x(&self) -> f64 {
        2.0 * (0.5 * self.width as f64 / self.fx).atan()
    }

    /// Applies distortion to normalized image-plane coordinates.
    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, k3] = self.radial;
        let [p1, p2] = self.tangential;

        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));

        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        (x * radial + dx, y * radial + dy)
    }

    /// Inverts the distortion by fixed-point iteration.
    fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        let [k1, k2, k3] = self.radial;
        let [p1, p2] = self.tangential;

        let mut x = xd;
        let mut y = yd;

        for _ in 0..10 {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));

            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }

        (x, y)
    }
}

/// Fisheye camera with an equidistant projection, six radial and two
/// tangential distortion coefficients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FisheyeCamera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub radial: [f64; 6],
    pub tangential: [f64; 2],
}

impl FisheyeCamera {
    /// Distortion-free fisheye camera; `fov_x` maps linearly onto the width.
    pub fn from_fov_x(width: u32, height: u32, fov_x: f64) -> Self {
        debug_assert!(fov_x > 0.0 && fov_x < 2.0 * std::f64::consts::PI);

        let fx = width as f64 / fov_x;

        Self {
            width,
            height,
            fx,
            fy: fx,
            cx: 0.5 * width as f64,
            cy: 0.5 * height as f64,
            radial: [0.0; 6],
            tangential: [0.0; 2],
        }
    }

    pub fn fov_x(&self) -> f64 {
        self.width as f64 / self.fx
    }

    /// Distorted angle for an incidence angle `theta`.
    fn distort_theta(&self, theta: f64) -> f64 {
        let theta2 = theta * theta;

        let mut power = theta2;
        let mut factor = 1.0;
        for k in self.radial {
            factor += k * power;
            power *= theta2;
        }

        theta * factor
    }

    /// Inverts `distort_theta` by Newton iteration.
    fn undistort_theta(&self, theta_d: f64) -> f64 {
        let mut theta = theta_d;

        for _ in 0..10 {
            let theta2 = theta * theta;

            let mut power = theta2;
            let mut value = 1.0;
            let mut derivative = 1.0;
            for (order, k) in self.radial.iter().enumerate() {
                value += k * power;
                derivative += k * power * (2 * order + 3) as f64;
                power *= theta2;
            }

            let residual = theta * value - theta_d;
            if derivative.abs() < 1e-12 {
                break;
            }

            theta -= residual / derivative;
        }

        theta.max(0.0)
    }
}

/// Tagged camera model dispatching the capability set of the calibration
/// pipeline: projection in the inverted-flipped frame, bounds checks, and
/// parameter-subset access for the optimizer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraModel {
    Pinhole(PinholeCamera),
    Fisheye(FisheyeCamera),
}

impl CameraModel {
    pub fn pinhole_from_fov_x(width: u32, height: u32, fov_x: f64) -> Self {
        CameraModel::Pinhole(PinholeCamera::from_fov_x(width, height, fov_x))
    }

    pub fn fisheye_from_fov_x(width: u32, height: u32, fov_x: f64) -> Self {
        CameraModel::Fisheye(FisheyeCamera::from_fov_x(width, height, fov_x))
    }

    pub fn from_fov_x(kind: CameraKind, width: u32, height: u32, fov_x: f64) -> Self {
        match kind {
            CameraKind::Pinhole => Self::pinhole_from_fov_x(width, height, fov_x),
            CameraKind::Fisheye => Self::fisheye_from_fov_x(width, height, fov_x),
        }
    }

    /// A camera of the same kind and resolution keeping only the field of
    /// view, with principal point re-centered and distortion dropped.
    pub fn reduced_to_fov(&self) -> Self {
        Self::from_fov_x(self.kind(), self.width(), self.height(), self.fov_x())
    }

    #[inline]
    pub fn kind(&self) -> CameraKind {
        match self {
            CameraModel::Pinhole(_) => CameraKind::Pinhole,
            CameraModel::Fisheye(_) => CameraKind::Fisheye,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        match self {
            CameraModel::Pinhole(camera) => camera.width,
            CameraModel::Fisheye(camera) => camera.width,
        }
    }

    #[inline]
    pub fn height(&self) -> u32 {
        match self {
            CameraModel::Pinhole(camera) => camera.height,
            CameraModel::Fisheye(camera) => camera.height,
        }
    }

    pub fn fov_x(&self) -> f64 {
        match self {
            CameraModel::Pinhole(camera) => camera.fov_x(),
            CameraModel::Fisheye(camera) => camera.fov_x(),
        }
    }

    /// Projects a world point given the inverted-flipped camera pose
    /// (camera looks along +z with y pointing down).
    pub fn project_if(&self, flipped_t_world: &Isometry3<f64>, world_point: &Point3<f64>) -> Point2<f64> {
        let q = flipped_t_world * world_point;

        match self {
            CameraModel::Pinhole(camera) => {
                if q.z <= 1e-9 {
                    return Point2::new(f64::INFINITY, f64::INFINITY);
                }

                let (xd, yd) = camera.distort(q.x / q.z, q.y / q.z);
                Point2::new(camera.fx * xd + camera.cx, camera.fy * yd + camera.cy)
            }
            CameraModel::Fisheye(camera) => {
                let r_xy = (q.x * q.x + q.y * q.y).sqrt();

                if r_xy <= 1e-12 {
                    if q.z <= 0.0 {
                        return Point2::new(f64::INFINITY, f64::INFINITY);
                    }
                    return Point2::new(camera.cx, camera.cy);
                }

                let theta = r_xy.atan2(q.z);
                let theta_d = camera.distort_theta(theta);

                let xd = theta_d * q.x / r_xy;
                let yd = theta_d * q.y / r_xy;

                let [p1, p2] = camera.tangential;
                let r2 = xd * xd + yd * yd;
                let tx = 2.0 * p1 * xd * yd + p2 * (r2 + 2.0 * xd * xd);
                let ty = p1 * (r2 + 2.0 * yd * yd) + 2.0 * p2 * xd * yd;

                Point2::new(
                    camera.fx * (xd + tx) + camera.cx,
                    camera.fy * (yd + ty) + camera.cy,
                )
            }
        }
    }

    /// True when the world point lies in front of the camera in the
    /// inverted-flipped frame.
    pub fn is_object_point_in_front_if(
        &self,
        flipped_t_world: &Isometry3<f64>,
        world_point: &Point3<f64>,
    ) -> bool {
        (flipped_t_world * world_point).z > 1e-9
    }

    pub fn is_inside(&self, point: &Point2<f64>, margin: f64) -> bool {
        point.x.is_finite()
            && point.y.is_finite()
            && point.x >= margin
            && point.y >= margin
            && point.x < self.width() as f64 - margin
            && point.y < self.height() as f64 - margin
    }

    /// Undistorted normalized image-plane coordinates for a pixel; `None`
    /// when the pixel maps onto or behind the camera plane.
    pub fn unproject_normalized(&self, pixel: &Point2<f64>) -> Option<Vector2<f64>> {
        match self {
            CameraModel::Pinhole(camera) => {
                let xd = (pixel.x - camera.cx) / camera.fx;
                let yd = (pixel.y - camera.cy) / camera.fy;
                let (x, y) = camera.undistort(xd, yd);
                Some(Vector2::new(x, y))
            }
            CameraModel::Fisheye(camera) => {
                let xd = (pixel.x - camera.cx) / camera.fx;
                let yd = (pixel.y - camera.cy) / camera.fy;

                let theta_d = (xd * xd + yd * yd).sqrt();
                if theta_d <= 1e-12 {
                    return Some(Vector2::new(0.0, 0.0));
                }

                let theta = camera.undistort_theta(theta_d);
                if theta >= std::f64::consts::FRAC_PI_2 - 1e-3 {
                    return None;
                }

                let scale = theta.tan() / theta_d;
                Some(Vector2::new(xd * scale, yd * scale))
            }
        }
    }

    /// Number of scalars selected by `set` for this model.
    pub fn param_count(&self, set: ParamSet) -> usize {
        let mut count = 0;

        if set.contains(ParamSet::FOCAL) {
            count += 2;
        }
        if set.contains(ParamSet::PRINCIPAL_POINT) {
            count += 2;
        }
        if set.contains(ParamSet::K1) {
            count += 1;
        }
        if set.contains(ParamSet::K2) {
            count += 1;
        }
        if set.contains(ParamSet::TANGENTIAL) {
            count += 2;
        }
        if set.contains(ParamSet::K3) {
            count += 1;
        }
        if set.contains(ParamSet::HIGHER_ORDER) {
            if let CameraModel::Fisheye(_) = self {
                count += 3;
            }
        }

        count
    }

    pub fn params(&self, set: ParamSet) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.param_count(set));

        let (fx, fy, cx, cy) = match self {
            CameraModel::Pinhole(camera) => (camera.fx, camera.fy, camera.cx, camera.cy),
            CameraModel::Fisheye(camera) => (camera.fx, camera.fy, camera.cx, camera.cy),
        };

        if set.contains(ParamSet::FOCAL) {
            values.extend([fx, fy]);
        }
        if set.contains(ParamSet::PRINCIPAL_POINT) {
            values.extend([cx, cy]);
        }

        match self {
            CameraModel::Pinhole(camera) => {
                if set.contains(ParamSet::K1) {
                    values.push(camera.radial[0]);
                }
                if set.contains(ParamSet::K2) {
                    values.push(camera.radial[1]);
                }
                if set.contains(ParamSet::TANGENTIAL) {
                    values.extend(camera.tangential);
                }
                if set.contains(ParamSet::K3) {
                    values.push(camera.radial[2]);
                }
            }
            CameraModel::Fisheye(camera) => {
                if set.contains(ParamSet::K1) {
                    values.push(camera.radial[0]);
                }
                if set.contains(ParamSet::K2) {
                    values.push(camera.radial[1]);
                }
                if set.contains(ParamSet::TANGENTIAL) {
                    values.extend(camera.tangential);
                }
                if set.contains(ParamSet::K3) {
                    values.push(camera.radial[2]);
                }
                if set.contains(ParamSet::HIGHER_ORDER) {
                    values.extend(&camera.radial[3..6]);
                }
            }
        }

        values
    }

    pub fn with_params(&self, set: ParamSet, values: &[f64]) -> CameraModel {
        debug_assert_eq!(values.len(), self.param_count(set));

        let mut camera = self.clone();
        let mut cursor = 0;

        let mut take = |count: usize| {
            let slice = &values[cursor..cursor + count];
            cursor += count;
            slice
        };

        match &mut camera {
            CameraModel::Pinhole(pinhole) => {
                if set.contains(ParamSet::FOCAL) {
                    let focal = take(2);
                    pinhole.fx = focal[0];
                    pinhole.fy = focal[1];
                }
                if set.contains(ParamSet::PRINCIPAL_POINT) {
                    let principal = take(2);
                    pinhole.cx = principal[0];
                    pinhole.cy = principal[1];
                }
                if set.contains(ParamSet::K1) {
                    pinhole.radial[0] = take(1)[0];
                }
                if set.contains(ParamSet::K2) {
                    pinhole.radial[1] = take(1)[0];
                }
                if set.contains(ParamSet::TANGENTIAL) {
                    let tangential = take(2);
                    pinhole.tangential = [tangential[0], tangential[1]];
                }
                if set.contains(ParamSet::K3) {
                    pinhole.radial[2] = take(1)[0];
                }
            }
            CameraModel::Fisheye(fisheye) => {
                if set.contains(ParamSet::FOCAL) {
                    let focal = take(2);
                    fisheye.fx = focal[0];
                    fisheye.fy = focal[1];
                }
                if set.contains(ParamSet::PRINCIPAL_POINT) {
                    let principal = take(2);
                    fisheye.cx = principal[0];
                    fisheye.cy = principal[1];
                }
                if set.contains(ParamSet::K1) {
                    fisheye.radial[0] = take(1)[0];
                }
                if set.contains(ParamSet::K2) {
                    fisheye.radial[1] = take(1)[0];
                }
                if set.contains(ParamSet::TANGENTIAL) {
                    let tangential = take(2);
                    fisheye.tangential = [tangential[0], tangential[1]];
                }
                if set.contains(ParamSet::K3) {
                    fisheye.radial[2] = take(1)[0];
                }
                if set.contains(ParamSet::HIGHER_ORDER) {
                    let higher = take(3);
                    fisheye.radial[3] = higher[0];
                    fisheye.radial[4] = higher[1];
                    fisheye.radial[5] = higher[2];
                }
            }
        }

        camera
    }

    /// Clamps every distortion coefficient into `[-max_abs, max_abs]`.
    pub fn clamp_distortion(&mut self, max_abs: f64) {
        match self {
            CameraModel::Pinhole(camera) => {
                for k in &mut camera.radial {
                    *k = k.clamp(-max_abs, max_abs);
                }
                for p in &mut camera.tangential {
                    *p = p.clamp(-max_abs, max_abs);
                }
            }
            CameraModel::Fisheye(camera) => {
                for k in &mut camera.radial {
                    *k = k.clamp(-max_abs, max_abs);
                }
                for p in &mut camera.tangential {
                    *p = p.clamp(-max_abs, max_abs);
                }
            }
        }
    }
}
