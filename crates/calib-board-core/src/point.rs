use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// A refined marker point observation.
///
/// The sign of `strength` encodes the point polarity: positive for a dark
/// dot on bright surrounding, negative for a bright dot on dark surrounding.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Point {
    pub observation: Point2<f32>,
    pub radius: u32,
    pub strength: f32,
}

impl Point {
    pub fn new(observation: Point2<f32>, radius: u32, strength: f32) -> Self {
        Self {
            observation,
            radius,
            strength,
        }
    }

    /// True for dark points, false for bright points.
    #[inline]
    pub fn sign(&self) -> bool {
        self.strength >= 0.0
    }
}

/// Result of a best/runner-up proximity query.
#[derive(Clone, Copy, Debug)]
pub struct ClosestPoints {
    pub closest_index: usize,
    pub closest_sqr_distance: f32,
    pub second_index: Option<usize>,
    pub second_sqr_distance: f32,
}

/// Spatial bin array over the image used for nearest-point queries.
///
/// Queries inspect the 3x3 bin neighborhood of the query position, so the
/// bin size bounds the query radius.
#[derive(Clone, Debug, Default)]
pub struct PointGrid {
    width: f32,
    height: f32,
    horizontal_bins: u32,
    vertical_bins: u32,
    bins: Vec<Vec<u32>>,
}

impl PointGrid {
    /// Creates an empty grid for an image with bins of at least `bin_size`
    /// pixels, so a 3x3 bin neighborhood always covers a `bin_size` query
    /// radius.
    pub fn new(width: u32, height: u32, bin_size: f32) -> Self {
        debug_assert!(width > 0 && height > 0 && bin_size > 0.0);

        let horizontal_bins = ((width as f32 / bin_size).floor() as u32).max(1);
        let vertical_bins = ((height as f32 / bin_size).floor() as u32).max(1);

        Self {
            width: width as f32,
            height: height as f32,
            horizontal_bins,
            vertical_bins,
            bins: vec![Vec::new(); horizontal_bins as usize * vertical_bins as usize],
        }
    }

    pub fn clear(&mut self) {
        for bin in &mut self.bins {
            bin.clear();
        }
    }

    pub fn rebuild(&mut self, points: &[Point]) {
        self.clear();
        for (index, point) in points.iter().enumerate() {
            self.insert(point.observation, index as u32);
        }
    }

    pub fn insert(&mut self, observation: Point2<f32>, index: u32) {
        let (x_bin, y_bin) = self.bin(observation.x, observation.y);
        self.bins[y_bin as usize * self.horizontal_bins as usize + x_bin as usize].push(index);
    }

    #[inline]
    fn bin(&self, x: f32, y: f32) -> (u32, u32) {
        let x_bin = ((x / self.width * self.horizontal_bins as f32) as i64)
            .clamp(0, self.horizontal_bins as i64 - 1) as u32;
        let y_bin = ((y / self.height * self.vertical_bins as f32) as i64)
            .clamp(0, self.vertical_bins as i64 - 1) as u32;
        (x_bin, y_bin)
    }

    fn neighborhood(&self, query: Point2<f32>) -> impl Iterator<Item = &u32> {
        let (x_center, y_center) = self.bin(query.x, query.y);

        let x_first = x_center.saturating_sub(1);
        let x_last = (x_center + 1).min(self.horizontal_bins - 1);
        let y_first = y_center.saturating_sub(1);
        let y_last = (y_center + 1).min(self.vertical_bins - 1);

        (y_first..=y_last).flat_map(move |y_bin| {
            (x_first..=x_last).flat_map(move |x_bin| {
                self.bins[y_bin as usize * self.horizontal_bins as usize + x_bin as usize].iter()
            })
        })
    }

    /// Closest point with the requested polarity within `max_sqr_distance`.
    pub fn closest_point(
        &self,
        points: &[Point],
        query: Point2<f32>,
        sign: bool,
        max_sqr_distance: f32,
    ) -> Option<usize> {
        let mut best_index = None;
        let mut best_sqr_distance = max_sqr_distance;

        for &index in self.neighborhood(query) {
            let point = &points[index as usize];

            if point.sign() != sign {
                continue;
            }

            let sqr_distance = (point.observation - query).norm_squared();

            if sqr_distance <= best_sqr_distance {
                best_index = Some(index as usize);
                best_sqr_distance = sqr_distance;
            }
        }

        best_index
    }

    /// Closest point and runner-up regardless of polarity.
    pub fn closest_two_points(&self, points: &[Point], query: Point2<f32>) -> Option<ClosestPoints> {
        let mut closest_index = None;
        let mut closest_sqr_distance = f32::MAX;
        let mut second_index = None;
        let mut second_sqr_distance = f32::MAX;

        for &index in self.neighborhood(query) {
            let sqr_distance = (points[index as usize].observation - query).norm_squared();

            if sqr_distance < closest_sqr_distance {
                second_index = closest_index;
                second_sqr_distance = closest_sqr_distance;

                closest_index = Some(index as usize);
                closest_sqr_distance = sqr_distance;
            } else if sqr_distance < second_sqr_distance {
                second_index = Some(index as usize);
                second_sqr_distance = sqr_distance;
            }
        }

        closest_index.map(|index| ClosestPoints {
            closest_index: index,
            closest_sqr_distance,
            second_index,
            second_sqr_distance,
        })
    }

    /// All point indices within `max_sqr_distance`, appended to `out`.
    pub fn points_within(
        &self,
        points: &[Point],
        query: Point2<f32>,
        max_sqr_distance: f32,
        out: &mut Vec<u32>,
    ) {
        for &index in self.neighborhood(query) {
            let sqr_distance = (points[index as usize].observation - query).norm_squared();

            if sqr_distance <= max_sqr_distance {
                out.push(index);
            }
        }
    }

    pub fn has_close_point(
        &self,
        points: &[Point],
        query: Point2<f32>,
        max_sqr_distance: f32,
    ) -> bool {
        self.neighborhood(query).any(|&index| {
            (points[index as usize].observation - query).norm_squared() <= max_sqr_distance
        })
    }

    /// Up to `max_results` nearest same-sign points around `seed_index`,
    /// ordered by increasing distance, excluding the seed itself.
    pub fn nearest_same_sign(
        &self,
        points: &[Point],
        seed_index: usize,
        max_sqr_distance: f32,
        max_results: usize,
        out: &mut Vec<(u32, f32)>,
    ) {
        out.clear();

        let seed = &points[seed_index];

        for &index in self.neighborhood(seed.observation) {
            if index as usize == seed_index {
                continue;
            }

            let point = &points[index as usize];
            if point.sign() != seed.sign() {
                continue;
            }

            let sqr_distance = (point.observation - seed.observation).norm_squared();
            if sqr_distance > max_sqr_distance {
                continue;
            }

            let position = out
                .iter()
                .position(|&(_, existing)| sqr_distance < existing)
                .unwrap_or(out.len());

            if position < max_results {
                out.insert(position, (index, sqr_distance));
                out.truncate(max_results);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with(points: &[Point]) -> PointGrid {
        let mut grid = PointGrid::new(200, 100, 50.0);
        grid.rebuild(points);
        grid
    }

    fn dark(x: f32, y: f32) -> Point {
        Point::new(Point2::new(x, y), 2, 10.0)
    }

    fn bright(x: f32, y: f32) -> Point {
        Point::new(Point2::new(x, y), 2, -10.0)
    }

    #[test]
    fn closest_point_respects_sign_and_distance() {
        let points = vec![dark(10.0, 10.0), bright(12.0, 10.0), dark(40.0, 10.0)];
        let grid = grid_with(&points);

        let query = Point2::new(11.0, 10.0);
        assert_eq!(grid.closest_point(&points, query, true, 25.0), Some(0));
        assert_eq!(grid.closest_point(&points, query, false, 25.0), Some(1));
        assert_eq!(grid.closest_point(&points, query, true, 0.25), None);
    }

    #[test]
    fn closest_two_points_orders_by_distance() {
        let points = vec![dark(10.0, 10.0), dark(14.0, 10.0), dark(30.0, 10.0)];
        let grid = grid_with(&points);

        let result = grid
            .closest_two_points(&points, Point2::new(11.0, 10.0))
            .unwrap();

        assert_eq!(result.closest_index, 0);
        assert_eq!(result.second_index, Some(1));
        assert!(result.closest_sqr_distance <= result.second_sqr_distance);
    }

    #[test]
    fn nearest_same_sign_excludes_seed_and_sorts() {
        let points = vec![
            dark(50.0, 50.0),
            dark(58.0, 50.0),
            dark(50.0, 56.0),
            bright(52.0, 50.0),
        ];
        let grid = grid_with(&points);

        let mut out = Vec::new();
        grid.nearest_same_sign(&points, 0, 40.0 * 40.0, 4, &mut out);

        let indices: Vec<u32> = out.iter().map(|&(index, _)| index).collect();
        assert_eq!(indices, vec![2, 1]);
    }
}
