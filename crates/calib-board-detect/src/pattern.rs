//! Ring sampling kernels for the point detector.

/// Maximal center intensity for a dark point (75% of white).
pub const MAX_DARK_CENTER: u8 = (0xFF * 75 / 100) as u8;
/// Minimal surround intensity for a dark point (25% of white).
pub const MIN_DARK_SURROUND: u8 = (0xFF * 25 / 100) as u8;

/// A concentric ring kernel of integer sample offsets.
///
/// The offsets are stored twice: as 2D offsets, and as a chain of linear
/// strides so that successive samples are reached by adding one integer to
/// the previous sample address. The stride chain is only valid for the
/// image stride the pattern was built for.
#[derive(Clone, Debug)]
pub struct PointPattern {
    radius: u32,
    inner_radius: u32,
    stride_elements: u32,
    offsets: Vec<(i32, i32)>,
    /// Stride deltas between consecutive samples, first one relative to the
    /// top-left sample.
    positive_offsets: Vec<u32>,
    /// Backwards stride from the center pixel to the top-left sample.
    negative_offset: u32,
}

impl PointPattern {
    /// Builds the ring `{(dx, dy) : inner² < dx²+dy² <= radius²}` for a
    /// fixed image stride. Returns `None` for degenerate geometry.
    pub fn new(radius: u32, inner_radius: u32, stride_elements: u32) -> Option<Self> {
        if radius == 0 || inner_radius >= radius || stride_elements < radius * 2 + 1 {
            return None;
        }

        let mut offsets = Vec::new();

        for dy in -(radius as i32)..=radius as i32 {
            for dx in -(radius as i32)..=radius as i32 {
                let sqr_distance = (dx * dx + dy * dy) as u32;

                if sqr_distance > radius * radius || sqr_distance <= inner_radius * inner_radius {
                    continue;
                }

                offsets.push((dx, dy));
            }
        }

        if offsets.is_empty() {
            return None;
        }

        // Offsets enumerate rows top to bottom, so the first sample is the
        // most negative linear address.
        let first = offsets[0];
        debug_assert!(first.1 < 0 && first.0 <= 0);

        let negative_offset = (-first.1 * stride_elements as i32 - first.0) as u32;

        let mut positive_offsets = Vec::with_capacity(offsets.len());
        let mut previous = first;

        for &offset in &offsets {
            let delta_x = offset.0 - previous.0;
            let delta_y = offset.1 - previous.1;
            debug_assert!(delta_y >= 0);

            positive_offsets.push((delta_y * stride_elements as i32 + delta_x) as u32);
            previous = offset;
        }

        debug_assert_eq!(positive_offsets[0], 0);

        Some(Self {
            radius,
            inner_radius,
            stride_elements,
            offsets,
            positive_offsets,
            negative_offset,
        })
    }

    /// The same ring rebuilt for a different image stride.
    pub fn with_stride(&self, stride_elements: u32) -> Option<Self> {
        Self::new(self.radius, self.inner_radius, stride_elements)
    }

    #[inline]
    pub fn radius(&self) -> u32 {
        self.radius
    }

    #[inline]
    pub fn inner_radius(&self) -> u32 {
        self.inner_radius
    }

    #[inline]
    pub fn diameter(&self) -> u32 {
        self.radius * 2 + 1
    }

    #[inline]
    pub fn stride_elements(&self) -> u32 {
        self.stride_elements
    }

    #[inline]
    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.positive_offsets.len()
    }

    /// Average-of-squared-differences normalization for raw strengths.
    #[inline]
    pub fn normalized_strength(&self, strength: u32) -> f32 {
        strength as f32 / self.positive_offsets.len() as f32
    }

    /// Strength of a dark point at `center_offset` into `data`, 0 when the
    /// pixel is not a dark point.
    ///
    /// A dark point has a sufficiently dark center whose surround samples
    /// are all at least `min_difference` brighter and not darker than 25%
    /// of white; the surround intensity variance must stay below
    /// `max_variance` (0 disables the variance gate).
    pub fn dark_strength(
        &self,
        data: &[u8],
        center_offset: usize,
        min_difference: u8,
        max_variance: u32,
    ) -> u32 {
        let center = data[center_offset];

        if center > MAX_DARK_CENTER {
            return 0;
        }

        let min_surround = MIN_DARK_SURROUND.max(center.saturating_add(min_difference));

        let mut cursor = center_offset - self.negative_offset as usize;
        let mut sum_sqr_differences = 0u32;
        let mut sum = 0u64;
        let mut sum_sqr = 0u64;

        for &delta in &self.positive_offsets {
            cursor += delta as usize;
            let sample = data[cursor];

            if sample < min_surround {
                return 0;
            }

            sum += sample as u64;
            sum_sqr += sample as u64 * sample as u64;

            let difference = (sample - center) as u32;
            sum_sqr_differences += difference * difference;
        }

        if sum_sqr_differences == 0 {
            return 0;
        }

        if max_variance != 0 && self.variance(sum, sum_sqr) > max_variance as u64 {
            return 0;
        }

        sum_sqr_differences
    }

    /// Mirror of [`Self::dark_strength`] for bright points.
    pub fn bright_strength(
        &self,
        data: &[u8],
        center_offset: usize,
        min_difference: u8,
        max_variance: u32,
    ) -> u32 {
        let center = data[center_offset];

        if center < MIN_DARK_SURROUND {
            return 0;
        }

        let max_surround = MAX_DARK_CENTER.min(center.saturating_sub(min_difference));

        let mut cursor = center_offset - self.negative_offset as usize;
        let mut sum_sqr_differences = 0u32;
        let mut sum = 0u64;
        let mut sum_sqr = 0u64;

        for &delta in &self.positive_offsets {
            cursor += delta as usize;
            let sample = data[cursor];

            if sample > max_surround {
                return 0;
            }

            sum += sample as u64;
            sum_sqr += sample as u64 * sample as u64;

            let difference = (center - sample) as u32;
            sum_sqr_differences += difference * difference;
        }

        if sum_sqr_differences == 0 {
            return 0;
        }

        if max_variance != 0 && self.variance(sum, sum_sqr) > max_variance as u64 {
            return 0;
        }

        sum_sqr_differences
    }

    #[inline]
    fn variance(&self, sum: u64, sum_sqr: u64) -> u64 {
        let n = self.positive_offsets.len() as u64;
        (sum_sqr - sum * sum / n) / n
    }
}

/// Ring kernels for radii `1..=radius`, skipping radii with fewer than
/// eight samples, largest radius last.
pub fn create_point_patterns(radius: u32, inner_radius: u32, stride_elements: u32) -> Vec<PointPattern> {
    debug_assert!(radius >= 1);

    let mut patterns = Vec::with_capacity(radius as usize);

    for r in 1..radius {
        let inner = inner_radius.min(r - 1);

        if let Some(pattern) = PointPattern::new(r, inner, stride_elements) {
            if pattern.sample_count() >= 8 {
                patterns.push(pattern);
            }
        }
    }

    if let Some(pattern) = PointPattern::new(radius, inner_radius, stride_elements) {
        patterns.push(pattern);
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_chain_matches_2d_offsets() {
        let stride = 37u32;
        let pattern = PointPattern::new(4, 3, stride).unwrap();

        let mut linear = -(pattern.negative_offset as i64);
        for (index, &delta) in pattern.positive_offsets.iter().enumerate() {
            linear += delta as i64;

            let (dx, dy) = pattern.offsets()[index];
            assert_eq!(linear, dy as i64 * stride as i64 + dx as i64);
        }
    }

    #[test]
    fn ring_excludes_inner_disc() {
        let pattern = PointPattern::new(3, 2, 32).unwrap();

        for &(dx, dy) in pattern.offsets() {
            let sqr = dx * dx + dy * dy;
            assert!(sqr > 4 && sqr <= 9);
        }
    }

    #[test]
    fn degenerate_geometry_rejected() {
        assert!(PointPattern::new(0, 0, 32).is_none());
        assert!(PointPattern::new(3, 3, 32).is_none());
        assert!(PointPattern::new(5, 4, 10).is_none());
    }

    fn synthetic_dot(size: usize, center_value: u8, surround_value: u8) -> Vec<u8> {
        let mut data = vec![surround_value; size * size];
        data[(size / 2) * size + size / 2] = center_value;
        data
    }

    #[test]
    fn dark_strength_requires_contrast() {
        let size = 11;
        let pattern = PointPattern::new(3, 2, size as u32).unwrap();
        let center_offset = (size / 2) * size + size / 2;

        let strong = synthetic_dot(size, 10, 200);
        assert!(pattern.dark_strength(&strong, center_offset, 5, 900) > 0);

        // Surround barely brighter than the center fails the gate.
        let weak = synthetic_dot(size, 100, 103);
        assert_eq!(pattern.dark_strength(&weak, center_offset, 5, 900), 0);

        // A bright center can never be a dark point.
        let inverted = synthetic_dot(size, 250, 10);
        assert_eq!(pattern.dark_strength(&inverted, center_offset, 5, 900), 0);
        assert!(pattern.bright_strength(&inverted, center_offset, 5, 900) > 0);
    }

    #[test]
    fn variance_gate_rejects_cluttered_surround() {
        let size = 11;
        let pattern = PointPattern::new(3, 2, size as u32).unwrap();
        let center_offset = (size / 2) * size + size / 2;

        let mut clutter = synthetic_dot(size, 10, 200);
        // Make the ring wildly uneven while keeping every sample above the
        // surround threshold.
        for (index, &(dx, dy)) in pattern.offsets().iter().enumerate() {
            let x = (size as i32 / 2 + dx) as usize;
            let y = (size as i32 / 2 + dy) as usize;
            clutter[y * size + x] = if index % 2 == 0 { 120 } else { 250 };
        }

        assert_eq!(pattern.dark_strength(&clutter, center_offset, 5, 900), 0);
        assert!(pattern.dark_strength(&clutter, center_offset, 5, 0) > 0);
    }

    #[test]
    fn pattern_set_skips_tiny_rings() {
        let patterns = create_point_patterns(5, 4, 64);

        // Radius 1 has only 4 ring samples and is skipped.
        assert!(patterns.iter().all(|p| p.radius() >= 2));
        assert_eq!(patterns.last().unwrap().radius(), 5);

        for window in patterns.windows(2) {
            assert!(window[0].radius() < window[1].radius());
        }
    }
}
