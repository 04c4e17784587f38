//! The catalog of 5x5 marker layouts unique under 90-degree rotation.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Number of dot rows/columns per marker.
pub const MARKER_GRID: usize = 5;

/// Number of dots per marker.
pub const MARKER_POINTS: usize = MARKER_GRID * MARKER_GRID;

/// One marker layout: row-major bits, 1 where the dot matches the marker
/// sign, 0 for a toggled dot. All 16 border cells are always 1.
pub type Layout = [u8; MARKER_POINTS];

/// A quarter-turn rotation, counter-clockwise: `Deg0` is "north".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Orientation {
    Deg0 = 0,
    Deg90 = 1,
    Deg180 = 2,
    Deg270 = 3,
}

impl Orientation {
    pub const ALL: [Orientation; 4] = [
        Orientation::Deg0,
        Orientation::Deg90,
        Orientation::Deg180,
        Orientation::Deg270,
    ];

    #[inline]
    pub fn quarter_turns(self) -> u8 {
        self as u8
    }

    pub fn from_quarter_turns(turns: u8) -> Orientation {
        Orientation::ALL[(turns % 4) as usize]
    }

    #[inline]
    pub fn degrees(self) -> u32 {
        self.quarter_turns() as u32 * 90
    }

    /// Composition of two rotations.
    #[inline]
    pub fn plus(self, other: Orientation) -> Orientation {
        Orientation::from_quarter_turns(self.quarter_turns() + other.quarter_turns())
    }

    /// Rotation difference `self - other`.
    #[inline]
    pub fn minus(self, other: Orientation) -> Orientation {
        Orientation::from_quarter_turns(self.quarter_turns() + 4 - other.quarter_turns())
    }

    #[inline]
    pub fn opposite(self) -> Orientation {
        Orientation::from_quarter_turns(self.quarter_turns() + 2)
    }
}

/// Index permutation rotating a layout by 90 degrees clockwise.
///
/// `rotated[n] = layout[MAPPING_90_CW[n]]` is *not* the relation used below;
/// rather `layout[n] == rotated[MAPPING_90_CW[n]]` tests whether `rotated`
/// is `layout` turned clockwise by 90 degrees.
const MAPPING_90_CW: [usize; MARKER_POINTS] = [
    20, 15, 10, 5, 0, //
    21, 16, 11, 6, 1, //
    22, 17, 12, 7, 2, //
    23, 18, 13, 8, 3, //
    24, 19, 14, 9, 4,
];

/// Rotation relating two layouts, or `None` when no quarter turn matches.
///
/// With `check_identity` the 0-degree case is tested first; without it only
/// proper rotations are considered (used for the self-similarity test).
pub fn rotation_between(layout: &Layout, rotated: &Layout, check_identity: bool) -> Option<Orientation> {
    if check_identity && layout == rotated {
        return Some(Orientation::Deg0);
    }

    if (0..MARKER_POINTS).all(|n| layout[n] == rotated[MAPPING_90_CW[n]]) {
        return Some(Orientation::Deg270);
    }

    if (0..MARKER_POINTS).all(|n| layout[n] == rotated[MARKER_POINTS - 1 - n]) {
        return Some(Orientation::Deg180);
    }

    if (0..MARKER_POINTS).all(|n| layout[n] == rotated[MAPPING_90_CW[MARKER_POINTS - 1 - n]]) {
        return Some(Orientation::Deg90);
    }

    None
}

fn is_similar(layouts: &[Layout], candidate: &Layout) -> bool {
    // Symmetric layouts would be ambiguous under rotation.
    if rotation_between(candidate, candidate, false).is_some() {
        return true;
    }

    layouts
        .iter()
        .any(|existing| rotation_between(existing, candidate, true).is_some())
}

fn interior_cells() -> impl Iterator<Item = usize> + Clone {
    (0..MARKER_POINTS).filter(|n| {
        let y = n / MARKER_GRID;
        let x = n % MARKER_GRID;
        (1..=3).contains(&y) && (1..=3).contains(&x)
    })
}

fn push_if_unique(layouts: &mut Vec<Layout>, cells: &[usize]) {
    let mut candidate: Layout = [1; MARKER_POINTS];
    for &cell in cells {
        candidate[cell] = 0;
    }

    if !is_similar(layouts, &candidate) {
        layouts.push(candidate);
    }
}

/// Deterministic enumeration of all rotation-unique layouts with one to
/// four toggled interior dots. Two-dot candidates whose dots are direct or
/// diagonal neighbors are skipped.
fn determine_unique_layouts() -> Vec<Layout> {
    let cells: Vec<usize> = interior_cells().collect();
    let mut layouts = Vec::new();

    for &a in &cells {
        push_if_unique(&mut layouts, &[a]);
    }

    for (i, &a) in cells.iter().enumerate() {
        for &b in &cells[i + 1..] {
            let (ya, xa) = (a / MARKER_GRID, a % MARKER_GRID);
            let (yb, xb) = (b / MARKER_GRID, b % MARKER_GRID);

            if ya.abs_diff(yb) <= 1 && xa.abs_diff(xb) <= 1 {
                // two toggled dots must not touch
                continue;
            }

            push_if_unique(&mut layouts, &[a, b]);
        }
    }

    for (i, &a) in cells.iter().enumerate() {
        for (j, &b) in cells.iter().enumerate().skip(i + 1) {
            for &c in &cells[j + 1..] {
                push_if_unique(&mut layouts, &[a, b, c]);
            }
        }
    }

    for (i, &a) in cells.iter().enumerate() {
        for (j, &b) in cells.iter().enumerate().skip(i + 1) {
            for (k, &c) in cells.iter().enumerate().skip(j + 1) {
                for &d in &cells[k + 1..] {
                    push_if_unique(&mut layouts, &[a, b, c, d]);
                }
            }
        }
    }

    layouts
}

/// The shared layout catalog.
pub fn catalog() -> &'static [Layout] {
    static CATALOG: OnceLock<Vec<Layout>> = OnceLock::new();
    CATALOG.get_or_init(determine_unique_layouts)
}

/// Number of distinct marker ids.
pub fn marker_id_count() -> usize {
    catalog().len()
}

/// Sign of a layout dot under a marker orientation.
///
/// `(x, y)` addresses the dot in the *unoriented* frame; the coordinates are
/// rotated by `orientation` before the lookup. For an inverted marker
/// (`marker_sign == false`) the result is complemented.
pub fn layout_point_sign(
    marker_id: usize,
    marker_sign: bool,
    orientation: Orientation,
    x: usize,
    y: usize,
) -> bool {
    debug_assert!(x < MARKER_GRID && y < MARKER_GRID);

    let (rx, ry) = match orientation {
        Orientation::Deg0 => (x, y),
        Orientation::Deg90 => (MARKER_GRID - 1 - y, x),
        Orientation::Deg180 => (MARKER_GRID - 1 - x, MARKER_GRID - 1 - y),
        Orientation::Deg270 => (y, MARKER_GRID - 1 - x),
    };

    let layout = &catalog()[marker_id];
    let bit = layout[ry * MARKER_GRID + rx] != 0;

    if marker_sign {
        bit
    } else {
        !bit
    }
}

/// Like [`layout_point_sign`] addressed by the flat dot index.
pub fn layout_point_sign_by_index(
    marker_id: usize,
    marker_sign: bool,
    orientation: Orientation,
    index_in_marker: usize,
) -> bool {
    layout_point_sign(
        marker_id,
        marker_sign,
        orientation,
        index_in_marker % MARKER_GRID,
        index_in_marker / MARKER_GRID,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_expected_size() {
        // 2 one-dot, 3 two-dot, 20 three-dot, 30 four-dot layouts.
        assert_eq!(catalog().len(), 55);
    }

    #[test]
    fn catalog_layouts_have_solid_borders() {
        for layout in catalog() {
            for n in 0..MARKER_POINTS {
                let y = n / MARKER_GRID;
                let x = n % MARKER_GRID;
                if y == 0 || x == 0 || y == MARKER_GRID - 1 || x == MARKER_GRID - 1 {
                    assert_eq!(layout[n], 1);
                }
            }
        }
    }

    #[test]
    fn catalog_is_rotation_unique() {
        let layouts = catalog();

        for (i, a) in layouts.iter().enumerate() {
            assert!(
                rotation_between(a, a, false).is_none(),
                "layout {i} is rotation-symmetric"
            );

            for (j, b) in layouts.iter().enumerate() {
                if i == j {
                    continue;
                }
                assert!(
                    rotation_between(a, b, true).is_none(),
                    "layouts {i} and {j} are rotations of each other"
                );
            }
        }
    }

    #[test]
    fn rotation_between_detects_quarter_turns() {
        let layout = &catalog()[10];

        // Rotate the layout clockwise by 90 degrees by hand.
        let mut rotated: Layout = [0; MARKER_POINTS];
        for n in 0..MARKER_POINTS {
            rotated[MAPPING_90_CW[n]] = layout[n];
        }

        assert_eq!(
            rotation_between(layout, &rotated, true),
            Some(Orientation::Deg270)
        );
        assert_eq!(
            rotation_between(&rotated, layout, true),
            Some(Orientation::Deg90)
        );
    }

    #[test]
    fn oriented_point_sign_round_trips() {
        let marker_id = 7;

        for orientation in Orientation::ALL {
            for y in 0..MARKER_GRID {
                for x in 0..MARKER_GRID {
                    let normal = layout_point_sign(marker_id, true, orientation, x, y);
                    let inverted = layout_point_sign(marker_id, false, orientation, x, y);
                    assert_ne!(normal, inverted);
                }
            }
        }

        // Orientation Deg0 reads the layout directly.
        let layout = &catalog()[marker_id];
        for n in 0..MARKER_POINTS {
            assert_eq!(
                layout_point_sign_by_index(marker_id, true, Orientation::Deg0, n),
                layout[n] != 0
            );
        }
    }

    #[test]
    fn orientation_arithmetic() {
        use Orientation::*;

        assert_eq!(Deg90.plus(Deg180), Deg270);
        assert_eq!(Deg90.plus(Deg270), Deg0);
        assert_eq!(Deg0.minus(Deg90), Deg270);
        assert_eq!(Deg180.opposite(), Deg0);
        assert_eq!(Deg270.degrees(), 270);
    }
}
