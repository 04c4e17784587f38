//! Multi-scale detection and sub-pixel refinement of marker dots.

use std::collections::HashMap;

use log::debug;
use nalgebra::Point2;

use serde::{Deserialize, Serialize};

use calib_board_core::{sample_bilinear, CalibrationError, GrayImage, ImageView, Point, PointGrid};

use crate::pattern::{create_point_patterns, PointPattern};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Tuning knobs of the point detector.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PointDetectorConfig {
    /// Minimal center/surround intensity difference.
    pub min_difference: u8,
    /// Maximal standard deviation of the ring samples.
    pub max_deviation: u32,
    /// Two detections closer than this are duplicates, in pixels.
    pub max_duplicate_distance: f32,
    /// Scan rows in parallel bands (effective with the `rayon` feature;
    /// results are identical either way).
    pub parallel: bool,
}

impl Default for PointDetectorConfig {
    fn default() -> Self {
        Self {
            min_difference: 5,
            max_deviation: 30,
            max_duplicate_distance: 2.0,
            parallel: false,
        }
    }
}

/// Largest ring radius scanned; the inner radius keeps one ring of samples.
const PATTERN_RADIUS: u32 = 5;
const PATTERN_INNER_RADIUS: u32 = 4;

/// Every other radius is scanned; the skipped radii only serve the
/// per-point radius refinement.
const DETECTION_SCALE_STEPS: usize = 2;

/// Bin size of the reusable point lookup grid, in pixels.
const POINT_GRID_BIN: f32 = 50.0;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    x: u32,
    y: u32,
    strength: u32,
}

/// Detects dark and bright marker dots in a grayscale image.
///
/// The detector owns the ring kernels (rebuilt only when the image stride
/// changes), the dot templates used for sub-pixel refinement, and the
/// spatial lookup grid over the refined points.
pub struct PointDetector {
    config: PointDetectorConfig,
    patterns: Vec<PointPattern>,
    templates: HashMap<(u32, bool), GrayImage>,
    points: Vec<Point>,
    grid: PointGrid,
    mask: Vec<u8>,
}

impl PointDetector {
    pub fn new(config: PointDetectorConfig) -> Self {
        Self {
            config,
            patterns: Vec::new(),
            templates: HashMap::new(),
            points: Vec::new(),
            grid: PointGrid::default(),
            mask: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &PointDetectorConfig {
        &self.config
    }

    /// Refined points of the most recent image.
    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Spatial lookup grid over [`Self::points`].
    #[inline]
    pub fn grid(&self) -> &PointGrid {
        &self.grid
    }

    /// Runs the full detection pass over one image.
    ///
    /// Individual candidates failing any gate are dropped silently; the
    /// only error is an image the detector cannot scan at all.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self, image), fields(width = image.width(), height = image.height()))
    )]
    pub fn detect_points(&mut self, image: &ImageView<'_>) -> Result<(), CalibrationError> {
        if self.patterns.is_empty()
            || self.patterns[0].stride_elements() != image.stride_elements()
        {
            self.patterns = create_point_patterns(
                PATTERN_RADIUS,
                PATTERN_INNER_RADIUS,
                image.stride_elements(),
            );
        }

        // The image must fit the complete kernel set, including the
        // largest ring.
        let Some(largest) = self.patterns.last() else {
            return Err(CalibrationError::InvalidImage);
        };
        if largest.radius() != PATTERN_RADIUS
            || largest.diameter() > image.width()
            || largest.diameter() > image.height()
        {
            return Err(CalibrationError::InvalidImage);
        }

        let rough_points = self.scan_all_radii(image);

        self.points.clear();
        self.refine_points(image, &rough_points);

        if self.points.len() >= 2 {
            self.remove_duplicates(image.width(), image.height());
        }

        self.grid = PointGrid::new(image.width(), image.height(), POINT_GRID_BIN);
        self.grid.rebuild(&self.points);

        Ok(())
    }

    /// Integer-precision scan over all detection radii, largest first.
    fn scan_all_radii(&mut self, image: &ImageView<'_>) -> Vec<Point> {
        let width = image.width();
        let height = image.height();

        let mut points: Vec<Point> = Vec::new();
        let mut mask_active = false;
        self.mask.clear();

        let max_variance = self.config.max_deviation * self.config.max_deviation;

        let mut pattern_index = self.patterns.len() - 1;

        loop {
            let pattern = &self.patterns[pattern_index];
            let iteration_first_point = points.len();

            let mut dark_positions: Vec<Point2<f32>> = Vec::new();

            for detect_dark in [true, false] {
                let candidates = self.scan_pattern(
                    image,
                    pattern,
                    detect_dark,
                    max_variance,
                    mask_active.then_some(self.mask.as_slice()),
                );

                let survivors = suppress_non_maximum(&candidates);

                for candidate in survivors {
                    let observation =
                        Point2::new(candidate.x as f32, candidate.y as f32);

                    if detect_dark {
                        dark_positions.push(observation);
                    } else if dark_positions
                        .iter()
                        .any(|dark| (dark - observation).norm_squared() <= 16.0)
                    {
                        // a dark point already claimed this neighborhood
                        continue;
                    }

                    let (radius, strength) = self.determine_point_radius(
                        image,
                        candidate,
                        pattern.radius(),
                        detect_dark,
                        max_variance,
                    );

                    let normalized = self
                        .patterns
                        .iter()
                        .find(|p| p.radius() == radius)
                        .map(|p| p.normalized_strength(strength))
                        .unwrap_or(0.0);

                    let sign = if detect_dark { 1.0 } else { -1.0 };

                    points.push(Point::new(observation, radius, normalized * sign));
                }
            }

            if pattern_index < DETECTION_SCALE_STEPS {
                break;
            }
            pattern_index -= DETECTION_SCALE_STEPS;

            // Mask out accepted points so smaller kernels skip them.
            if !mask_active {
                self.mask.resize(width as usize * height as usize, 0xFF);
                mask_active = true;
            }

            for point in &points[iteration_first_point..] {
                let mask_radius = point.radius * 3 / 2;

                let x = point.observation.x as i64;
                let y = point.observation.y as i64;

                let x_first = (x - mask_radius as i64).max(0) as u32;
                let y_first = (y - mask_radius as i64).max(0) as u32;
                let x_last = ((x + mask_radius as i64) as u32).min(width - 1);
                let y_last = ((y + mask_radius as i64) as u32).min(height - 1);

                for my in y_first..=y_last {
                    for mx in x_first..=x_last {
                        self.mask[my as usize * width as usize + mx as usize] = 0x00;
                    }
                }
            }
        }

        points
    }

    /// Scans one pattern/sign combination over the full image interior.
    fn scan_pattern(
        &self,
        image: &ImageView<'_>,
        pattern: &PointPattern,
        detect_dark: bool,
        max_variance: u32,
        mask: Option<&[u8]>,
    ) -> Vec<Candidate> {
        let radius = pattern.radius();
        let width = image.width();
        let first_row = radius;
        let last_row = image.height() - radius;

        let scan_row = |y: u32| -> Vec<Candidate> {
            let mut row_candidates = Vec::new();
            let data = image.data();
            let min_difference = self.config.min_difference;

            for x in radius..width - radius {
                if let Some(mask) = mask {
                    if mask[y as usize * width as usize + x as usize] == 0 {
                        continue;
                    }
                }

                let center_offset = image.offset(x, y);

                let strength = if detect_dark {
                    pattern.dark_strength(data, center_offset, min_difference, max_variance)
                } else {
                    pattern.bright_strength(data, center_offset, min_difference, max_variance)
                };

                if strength != 0 {
                    row_candidates.push(Candidate { x, y, strength });
                }
            }

            row_candidates
        };

        #[cfg(feature = "rayon")]
        if self.config.parallel {
            return (first_row..last_row)
                .into_par_iter()
                .map(scan_row)
                .flatten_iter()
                .collect();
        }

        (first_row..last_row).flat_map(scan_row).collect()
    }

    /// Shrinks the detection radius to the smallest pattern that still
    /// yields a positive strength at the candidate position.
    fn determine_point_radius(
        &self,
        image: &ImageView<'_>,
        candidate: Candidate,
        detection_radius: u32,
        detect_dark: bool,
        max_variance: u32,
    ) -> (u32, u32) {
        let mut radius = detection_radius;
        let mut strength = candidate.strength;

        for pattern in &self.patterns {
            if pattern.radius() >= detection_radius {
                break;
            }

            let r = pattern.radius();
            if candidate.x < r
                || candidate.y < r
                || candidate.x + r >= image.width()
                || candidate.y + r >= image.height()
            {
                break;
            }

            let center_offset = image.offset(candidate.x, candidate.y);

            let pattern_strength = if detect_dark {
                pattern.dark_strength(
                    image.data(),
                    center_offset,
                    self.config.min_difference,
                    max_variance,
                )
            } else {
                pattern.bright_strength(
                    image.data(),
                    center_offset,
                    self.config.min_difference,
                    max_variance,
                )
            };

            if pattern_strength != 0 {
                radius = r;
                strength = pattern_strength;
                break;
            }
        }

        (radius, strength)
    }

    /// Refines every rough point to sub-pixel precision by SSD matching
    /// against a rendered dot template.
    fn refine_points(&mut self, image: &ImageView<'_>, rough_points: &[Point]) {
        let mut rejected_flipped = 0usize;
        let mut rejected_moved = 0usize;

        let large_frame = image.width() as u64 * image.height() as u64 > 640 * 480;

        for point in rough_points {
            let radius = point.radius;
            let window = if radius <= 3 {
                if large_frame {
                    7
                } else {
                    5
                }
            } else {
                9
            };

            let template = self.template(radius, point.sign());
            let search_radius = (2 + radius) as i32;

            let Some((du, dv)) = match_template_ssd(image, &template, point, window, search_radius)
            else {
                rejected_moved += 1;
                continue;
            };

            let refined = Point2::new(point.observation.x + du, point.observation.y + dv);

            // Points refined too close to the border cannot be re-measured.
            let border = (radius + 1) as f32;
            if refined.x < border
                || refined.y < border
                || refined.x >= (image.width() - radius - 2) as f32
                || refined.y >= (image.height() - radius - 2) as f32
            {
                rejected_moved += 1;
                continue;
            }

            let displacement = (refined - point.observation).norm_squared();
            let max_displacement = ((search_radius - 1) * (search_radius - 1)) as f32;
            if displacement > max_displacement {
                rejected_moved += 1;
                continue;
            }

            let Some(signed_strength) = self.signed_strength_at(image, refined, radius) else {
                rejected_moved += 1;
                continue;
            };

            if (signed_strength >= 0.0) != point.sign() {
                rejected_flipped += 1;
                continue;
            }

            self.points.push(Point::new(refined, radius, signed_strength));
        }

        if rejected_flipped + rejected_moved > 0 {
            debug!(
                "point refinement dropped {} flipped and {} moved candidates",
                rejected_flipped, rejected_moved
            );
        }
    }

    /// Signed average-of-squared-differences strength at a sub-pixel
    /// position, bilinear samples over the ring of the matching radius.
    fn signed_strength_at(
        &self,
        image: &ImageView<'_>,
        position: Point2<f32>,
        radius: u32,
    ) -> Option<f32> {
        let pattern = self.patterns.iter().find(|p| p.radius() == radius)?;

        let center = sample_bilinear(image, position.x, position.y);

        let mut sum = 0.0f32;
        for &(dx, dy) in pattern.offsets() {
            let sample = sample_bilinear(image, position.x + dx as f32, position.y + dy as f32);
            let difference = sample - center;

            if difference >= 0.0 {
                sum += difference * difference;
            } else {
                sum -= difference * difference;
            }
        }

        Some(sum / pattern.sample_count() as f32)
    }

    /// Dot template for a radius and sign: a binomial intensity profile
    /// over the dot diameter on the opposite background.
    fn template(&mut self, radius: u32, dark: bool) -> GrayImage {
        self.templates
            .entry((radius, dark))
            .or_insert_with(|| paint_dot_template(radius, dark))
            .clone()
    }

    /// Keeps the stronger point of every pair closer than the duplicate
    /// distance.
    fn remove_duplicates(&mut self, width: u32, height: u32) {
        let max_sqr_distance =
            self.config.max_duplicate_distance * self.config.max_duplicate_distance;

        let mut grid = PointGrid::new(width, height, 10.0);
        grid.rebuild(&self.points);

        let mut duplicated = vec![false; self.points.len()];
        let mut neighbors: Vec<u32> = Vec::with_capacity(16);

        for index in 0..self.points.len() {
            if duplicated[index] {
                continue;
            }

            neighbors.clear();
            grid.points_within(
                &self.points,
                self.points[index].observation,
                max_sqr_distance,
                &mut neighbors,
            );

            for &neighbor in &neighbors {
                let neighbor = neighbor as usize;
                if neighbor == index || duplicated[neighbor] {
                    continue;
                }

                if self.points[index].strength.abs() < self.points[neighbor].strength.abs() {
                    duplicated[index] = true;
                    break;
                } else {
                    duplicated[neighbor] = true;
                }
            }
        }

        let before = self.points.len();

        let mut index = self.points.len();
        while index > 0 {
            index -= 1;
            if duplicated[index] {
                self.points.swap_remove(index);
                duplicated.swap_remove(index);
            }
        }

        if before != self.points.len() {
            debug!("removed {} duplicate points of {}", before - self.points.len(), before);
        }
    }
}

/// 3x3 non-maximum suppression with deterministic tie-breaking.
fn suppress_non_maximum(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut by_position: HashMap<(u32, u32), u32> = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        by_position.insert((candidate.x, candidate.y), candidate.strength);
    }

    let mut survivors = Vec::new();

    'candidates: for candidate in candidates {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }

                let nx = candidate.x as i64 + dx;
                let ny = candidate.y as i64 + dy;
                if nx < 0 || ny < 0 {
                    continue;
                }

                if let Some(&neighbor_strength) = by_position.get(&(nx as u32, ny as u32)) {
                    if neighbor_strength > candidate.strength {
                        continue 'candidates;
                    }

                    // Ties go to the scan-order first position.
                    if neighbor_strength == candidate.strength
                        && (ny as u32, nx as u32) < (candidate.y, candidate.x)
                    {
                        continue 'candidates;
                    }
                }
            }
        }

        survivors.push(*candidate);
    }

    survivors
}

/// SSD block match of a dot template around a rough point, with quadratic
/// sub-pixel interpolation of the cost minimum. Returns the sub-pixel
/// displacement, or `None` when no in-bounds position exists.
fn match_template_ssd(
    image: &ImageView<'_>,
    template: &GrayImage,
    point: &Point,
    window: i32,
    search_radius: i32,
) -> Option<(f32, f32)> {
    let half_window = window / 2;
    let template_center = (template.width / 2) as i32;

    let x0 = point.observation.x as i32;
    let y0 = point.observation.y as i32;

    let span = (2 * search_radius + 1) as usize;
    let mut costs = vec![f64::INFINITY; span * span];

    let mut best_cost = f64::INFINITY;
    let mut best = None;

    for dv in -search_radius..=search_radius {
        for du in -search_radius..=search_radius {
            let mut cost = 0.0f64;
            let mut valid = true;

            'window: for wy in -half_window..=half_window {
                for wx in -half_window..=half_window {
                    let ix = x0 + du + wx;
                    let iy = y0 + dv + wy;

                    if ix < 0 || iy < 0 || ix >= image.width() as i32 || iy >= image.height() as i32
                    {
                        valid = false;
                        break 'window;
                    }

                    let frame = image.pixel(ix as u32, iy as u32) as f64;
                    let reference = template
                        .pixel((template_center + wx) as u32, (template_center + wy) as u32)
                        as f64;

                    let difference = frame - reference;
                    cost += difference * difference;
                }
            }

            if !valid {
                continue;
            }

            let cost_index =
                (dv + search_radius) as usize * span + (du + search_radius) as usize;
            costs[cost_index] = cost;

            if cost < best_cost {
                best_cost = cost;
                best = Some((du, dv));
            }
        }
    }

    let (du, dv) = best?;

    let cost_at = |du: i32, dv: i32| -> f64 {
        if du.abs() > search_radius || dv.abs() > search_radius {
            return f64::INFINITY;
        }
        costs[(dv + search_radius) as usize * span + (du + search_radius) as usize]
    };

    let interpolate = |minus: f64, center: f64, plus: f64| -> f32 {
        if !minus.is_finite() || !plus.is_finite() {
            return 0.0;
        }
        let denominator = minus - 2.0 * center + plus;
        if denominator <= 1e-12 {
            return 0.0;
        }
        (0.5 * (minus - plus) / denominator).clamp(-1.0, 1.0) as f32
    };

    let sub_x = interpolate(cost_at(du - 1, dv), best_cost, cost_at(du + 1, dv));
    let sub_y = interpolate(cost_at(du, dv - 1), best_cost, cost_at(du, dv + 1));

    Some((du as f32 + sub_x, dv as f32 + sub_y))
}

/// Renders the dot template for one radius: a separable binomial profile
/// over the dot diameter, dark-on-bright or the complement.
fn paint_dot_template(radius: u32, dark: bool) -> GrayImage {
    let diameter = radius * 2 + 1;
    let size = diameter * 2 + 9; // dot plus margin covering every window

    let background = if dark { 0xFF } else { 0x00 };
    let mut template = GrayImage::new(size, size, background);

    let mut coefficients = vec![1u64; diameter as usize];
    for n in 1..diameter as usize {
        coefficients[n] =
            coefficients[n - 1] * (diameter as u64 - n as u64) / n as u64;
    }

    let max_coefficient = coefficients[diameter as usize / 2];
    let normalization = 1.0 / (max_coefficient * max_coefficient) as f32;

    let first = size / 2 - radius;

    for y in 0..diameter {
        for x in 0..diameter {
            let coefficient = (coefficients[x as usize] * coefficients[y as usize]) as f32;
            let color = (coefficient * normalization * 255.0).min(255.0) as u8;

            let value = if dark { 0xFF - color } else { color };
            template.set_pixel(first + x, first + y, value);
        }
    }

    template
}
