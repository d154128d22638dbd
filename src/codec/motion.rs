//! Block-matching motion estimation
//!
//! Finds, for a 16×16 block of the current picture, the displacement into
//! the reference picture that minimizes a hybrid rate-distortion cost:
//! `SAD + λ·(|dx| + |dy|)`. Four strategies trade accuracy for speed; the
//! encoder governor picks one through the complexity preset.
//!
//! Every strategy evaluates the zero vector first, so the returned cost is
//! never worse than staying put. Ties break toward the shorter vector.

use crate::codec::frame::Plane;

/// Motion block dimension
pub const MV_BLOCK: usize = 16;

/// Search radius for the exhaustive strategy, in pixels
pub const SEARCH_RANGE: i32 = 32;

/// Cost below which a search stops early
pub const EARLY_EXIT_THRESHOLD: u32 = 256;

/// Rate weight applied to the vector magnitude in the hybrid cost
const MV_LAMBDA: u32 = 2;

/// Variance thresholds routing the adaptive strategy
const LOW_COMPLEXITY_VARIANCE: u64 = 1_000;
const HIGH_COMPLEXITY_VARIANCE: u64 = 10_000;

/// A motion vector with the cost of the match it points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionVector {
    /// Horizontal displacement in pixels
    pub dx: i16,
    /// Vertical displacement in pixels
    pub dy: i16,
    /// Hybrid cost at this displacement
    pub cost: u32,
}

impl MotionVector {
    /// The zero vector with unevaluated (maximal) cost
    pub fn unset() -> Self {
        Self { dx: 0, dy: 0, cost: u32::MAX }
    }

    /// Manhattan length, used for tie-breaking
    #[inline]
    pub fn magnitude(&self) -> u32 {
        self.dx.unsigned_abs() as u32 + self.dy.unsigned_abs() as u32
    }

    /// True when `cost` (then shorter vector) improves on `self`
    #[inline]
    fn improved_by(&self, cost: u32, dx: i16, dy: i16) -> bool {
        cost < self.cost
            || (cost == self.cost
                && (dx.unsigned_abs() as u32 + dy.unsigned_abs() as u32) < self.magnitude())
    }
}

/// Search strategy selected by the complexity preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// Exhaustive over `[-R, R]²`
    Full,
    /// Large-diamond iteration plus one small-diamond refinement
    Diamond,
    /// Three halving steps of 8 neighbors each
    ThreeStep,
    /// Previous-vector reuse plus variance-routed fallback
    Adaptive,
}

/// Sum of absolute differences between two 16×16 blocks
pub fn sad(current: &Plane, cx: usize, cy: usize, reference: &Plane, rx: usize, ry: usize) -> u32 {
    let mut total = 0u32;
    for row in 0..MV_BLOCK {
        let cur = &current.row(cy + row)[cx..cx + MV_BLOCK];
        let refr = &reference.row(ry + row)[rx..rx + MV_BLOCK];
        for (a, b) in cur.iter().zip(refr.iter()) {
            total += u32::from(a.abs_diff(*b));
        }
    }
    total
}

/// Sum of absolute transformed differences over 4×4 Hadamard sub-blocks
///
/// Sharper than SAD around edges; used by the partition decision when the
/// preset allows the extra arithmetic.
pub fn satd(current: &Plane, cx: usize, cy: usize, reference: &Plane, rx: usize, ry: usize) -> u32 {
    let mut total = 0i64;
    for by in (0..MV_BLOCK).step_by(4) {
        for bx in (0..MV_BLOCK).step_by(4) {
            let mut diff = [[0i32; 4]; 4];
            for i in 0..4 {
                for j in 0..4 {
                    diff[i][j] = i32::from(current.pixel(cx + bx + j, cy + by + i))
                        - i32::from(reference.pixel(rx + bx + j, ry + by + i));
                }
            }
            // Horizontal butterfly
            for row in diff.iter_mut() {
                let a = row[0] + row[2];
                let b = row[1] + row[3];
                let c = row[0] - row[2];
                let d = row[1] - row[3];
                *row = [a + b, c + d, a - b, c - d];
            }
            // Vertical butterfly, accumulating magnitudes
            for j in 0..4 {
                let a = diff[0][j] + diff[2][j];
                let b = diff[1][j] + diff[3][j];
                let c = diff[0][j] - diff[2][j];
                let d = diff[1][j] - diff[3][j];
                total += i64::from((a + b).abs())
                    + i64::from((c + d).abs())
                    + i64::from((a - b).abs())
                    + i64::from((c - d).abs());
            }
        }
    }
    (total / 2) as u32
}

/// Sample variance of a 16×16 block, the adaptive router's complexity proxy
pub fn block_variance(plane: &Plane, x: usize, y: usize) -> u64 {
    let mut sum = 0u64;
    for row in 0..MV_BLOCK {
        for &p in &plane.row(y + row)[x..x + MV_BLOCK] {
            sum += u64::from(p);
        }
    }
    let mean = sum / (MV_BLOCK * MV_BLOCK) as u64;
    let mut var = 0u64;
    for row in 0..MV_BLOCK {
        for &p in &plane.row(y + row)[x..x + MV_BLOCK] {
            let d = u64::from(p).abs_diff(mean);
            var += d * d;
        }
    }
    var / (MV_BLOCK * MV_BLOCK) as u64
}

#[inline]
fn hybrid_cost(
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
    dx: i32,
    dy: i32,
) -> u32 {
    let rx = (x as i32 + dx) as usize;
    let ry = (y as i32 + dy) as usize;
    sad(current, x, y, reference, rx, ry) + MV_LAMBDA * (dx.unsigned_abs() + dy.unsigned_abs())
}

#[inline]
fn in_frame(x: i32, y: i32, width: usize, height: usize) -> bool {
    x >= 0 && y >= 0 && (x + MV_BLOCK as i32) <= width as i32 && (y + MV_BLOCK as i32) <= height as i32
}

/// Evaluate a candidate displacement and fold it into `best`
#[inline]
fn consider(
    best: &mut MotionVector,
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
    dx: i32,
    dy: i32,
) {
    if !in_frame(x as i32 + dx, y as i32 + dy, reference.width(), reference.height()) {
        return;
    }
    let cost = hybrid_cost(current, reference, x, y, dx, dy);
    if best.improved_by(cost, dx as i16, dy as i16) {
        *best = MotionVector { dx: dx as i16, dy: dy as i16, cost };
    }
}

/// Exhaustive search over `[-SEARCH_RANGE, SEARCH_RANGE]²`
pub fn estimate_full_search(
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
) -> MotionVector {
    let mut best = MotionVector::unset();
    // Zero vector first so the result never regresses below it
    consider(&mut best, current, reference, x, y, 0, 0);
    if best.cost < EARLY_EXIT_THRESHOLD {
        return best;
    }
    for dy in -SEARCH_RANGE..=SEARCH_RANGE {
        for dx in -SEARCH_RANGE..=SEARCH_RANGE {
            if dx == 0 && dy == 0 {
                continue;
            }
            consider(&mut best, current, reference, x, y, dx, dy);
            if best.cost < EARLY_EXIT_THRESHOLD {
                return best;
            }
        }
    }
    best
}

/// Large-diamond / small-diamond search
pub fn estimate_diamond_search(
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
) -> MotionVector {
    const LDSP: [(i32, i32); 9] = [
        (0, 0),
        (0, -4),
        (0, 4),
        (-4, 0),
        (4, 0),
        (-2, -2),
        (-2, 2),
        (2, -2),
        (2, 2),
    ];
    const SDSP: [(i32, i32); 5] = [(0, 0), (0, -1), (0, 1), (-1, 0), (1, 0)];

    let mut best = MotionVector::unset();
    let (mut center_x, mut center_y) = (0i32, 0i32);

    // Walk the large diamond until the minimum sits at its center
    loop {
        let mut moved = false;
        for &(dx, dy) in &LDSP {
            let (sx, sy) = (center_x + dx, center_y + dy);
            let before = best.cost;
            consider(&mut best, current, reference, x, y, sx, sy);
            if best.cost < before && (dx, dy) != (0, 0) {
                center_x = sx;
                center_y = sy;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    // One small-diamond refinement pass
    for &(dx, dy) in &SDSP {
        consider(&mut best, current, reference, x, y, center_x + dx, center_y + dy);
    }

    best
}

/// Three-step search with halving step sizes 4 → 2 → 1
pub fn estimate_three_step_search(
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
) -> MotionVector {
    let mut best = MotionVector::unset();
    consider(&mut best, current, reference, x, y, 0, 0);

    let mut step = 4i32;
    let (mut center_x, mut center_y) = (0i32, 0i32);

    for _ in 0..3 {
        let mut moved = false;
        for dy in [-step, 0, step] {
            for dx in [-step, 0, step] {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (sx, sy) = (center_x + dx, center_y + dy);
                let before = best.cost;
                consider(&mut best, current, reference, x, y, sx, sy);
                if best.cost < before {
                    center_x = sx;
                    center_y = sy;
                    moved = true;
                }
            }
        }
        step = (step / 2).max(1);
        if !moved {
            break;
        }
    }

    best
}

/// Adaptive search: previous-vector reuse, then variance routing
///
/// A previous-block vector whose cost undercuts `2 · EARLY_EXIT_THRESHOLD`
/// is adopted outright. Otherwise the block variance routes to three-step
/// (flat), diamond (moderate), or full search (busy).
pub fn estimate_adaptive(
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
    previous: Option<MotionVector>,
) -> MotionVector {
    if let Some(prev) = previous {
        if (prev.dx, prev.dy) != (0, 0) {
            let (dx, dy) = (i32::from(prev.dx), i32::from(prev.dy));
            if in_frame(x as i32 + dx, y as i32 + dy, reference.width(), reference.height()) {
                let cost = hybrid_cost(current, reference, x, y, dx, dy);
                if cost < 2 * EARLY_EXIT_THRESHOLD {
                    return MotionVector { dx: prev.dx, dy: prev.dy, cost };
                }
            }
        }
    }

    let variance = block_variance(current, x, y);
    if variance < LOW_COMPLEXITY_VARIANCE {
        estimate_three_step_search(current, reference, x, y)
    } else if variance < HIGH_COMPLEXITY_VARIANCE {
        estimate_diamond_search(current, reference, x, y)
    } else {
        estimate_full_search(current, reference, x, y)
    }
}

/// Run the strategy picked by the preset
pub fn estimate(
    strategy: SearchStrategy,
    current: &Plane,
    reference: &Plane,
    x: usize,
    y: usize,
    previous: Option<MotionVector>,
) -> MotionVector {
    match strategy {
        SearchStrategy::Full => estimate_full_search(current, reference, x, y),
        SearchStrategy::Diamond => estimate_diamond_search(current, reference, x, y),
        SearchStrategy::ThreeStep => estimate_three_step_search(current, reference, x, y),
        SearchStrategy::Adaptive => estimate_adaptive(current, reference, x, y, previous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth plane: long-period sinusoids so SAD falls off monotonically
    /// toward a translation match (what pattern searches rely on)
    fn smooth_plane(width: usize, height: usize) -> Plane {
        let mut plane = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let v = (x as f64 * 0.11).sin() * 55.0
                    + (y as f64 * 0.09).cos() * 45.0
                    + (x as f64 * 0.04 + y as f64 * 0.05).sin() * 25.0;
                *plane.pixel_mut(x, y) = (v + 128.0) as u8;
            }
        }
        plane
    }

    /// Pseudo-random texture: unique best match, no gradient
    fn textured_plane(width: usize, height: usize) -> Plane {
        let mut plane = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                *plane.pixel_mut(x, y) = ((x * 31 + y * 57 + (x * y) % 13) % 251) as u8;
            }
        }
        plane
    }

    /// Camera pans right by `shift`: current samples reference at x + shift
    fn panned(reference: &Plane, shift: usize) -> Plane {
        let mut out = Plane::new(reference.width(), reference.height());
        for y in 0..reference.height() {
            for x in 0..reference.width() {
                let sx = (x + shift).min(reference.width() - 1);
                *out.pixel_mut(x, y) = reference.pixel(sx, y);
            }
        }
        out
    }

    #[test]
    fn test_sad_zero_for_identical_blocks() {
        let plane = textured_plane(64, 64);
        assert_eq!(sad(&plane, 16, 16, &plane, 16, 16), 0);
    }

    #[test]
    fn test_diamond_resolves_five_pixel_pan() {
        let reference = smooth_plane(72, 72);
        let current = panned(&reference, 5);

        // Every interior block resolves to (5, 0), beating the zero vector
        for by in [16usize, 32] {
            for bx in [16usize, 32] {
                let mv = estimate_diamond_search(&current, &reference, bx, by);
                let zero = sad(&current, bx, by, &reference, bx, by);
                assert!(mv.cost < zero, "({bx},{by}): {} !< {zero}", mv.cost);
                assert_eq!((mv.dx, mv.dy), (5, 0), "block ({bx},{by})");
            }
        }
    }

    #[test]
    fn test_full_search_matches_translation() {
        let reference = textured_plane(64, 64);
        let current = panned(&reference, 3);
        let mv = estimate_full_search(&current, &reference, 24, 24);
        assert_eq!((mv.dx, mv.dy), (3, 0));
        assert!(mv.cost <= 2 * 3); // pure copy: SAD 0 plus vector rate
    }

    #[test]
    fn test_cost_never_exceeds_zero_vector() {
        let reference = textured_plane(96, 96);
        let current = textured_plane(96, 96);
        for strategy in [
            SearchStrategy::Full,
            SearchStrategy::Diamond,
            SearchStrategy::ThreeStep,
            SearchStrategy::Adaptive,
        ] {
            let mv = estimate(strategy, &current, &reference, 40, 40, None);
            let zero = hybrid_cost(&current, &reference, 40, 40, 0, 0);
            assert!(mv.cost <= zero, "{strategy:?}: {} > {zero}", mv.cost);
        }
    }

    #[test]
    fn test_tie_breaks_toward_shorter_vector() {
        // A constant plane makes every candidate SAD zero; the rate term
        // then forces the zero vector to win outright.
        let mut reference = Plane::new(64, 64);
        reference.fill(128);
        let mut current = Plane::new(64, 64);
        current.fill(128);

        for strategy in [
            SearchStrategy::Full,
            SearchStrategy::Diamond,
            SearchStrategy::ThreeStep,
        ] {
            let mv = estimate(strategy, &current, &reference, 24, 24, None);
            assert_eq!((mv.dx, mv.dy, mv.cost), (0, 0, 0), "{strategy:?}");
        }
    }

    #[test]
    fn test_adaptive_adopts_good_previous_vector() {
        let reference = textured_plane(64, 64);
        let current = panned(&reference, 5);
        let prev = MotionVector { dx: 5, dy: 0, cost: 0 };
        let mv = estimate_adaptive(&current, &reference, 32, 32, Some(prev));
        assert_eq!((mv.dx, mv.dy), (5, 0));
    }

    #[test]
    fn test_out_of_frame_candidates_skipped() {
        let reference = textured_plane(32, 32);
        let current = textured_plane(32, 32);
        // Block at the corner: negative displacements all fall outside
        let mv = estimate_full_search(&current, &reference, 0, 0);
        assert!(mv.dx >= 0 && mv.dy >= 0);
    }

    #[test]
    fn test_satd_zero_for_identical_blocks() {
        let plane = textured_plane(64, 64);
        assert_eq!(satd(&plane, 8, 8, &plane, 8, 8), 0);
    }

    #[test]
    fn test_block_variance_flat_vs_textured() {
        let mut flat = Plane::new(32, 32);
        flat.fill(77);
        assert_eq!(block_variance(&flat, 0, 0), 0);

        let busy = textured_plane(32, 32);
        assert!(block_variance(&busy, 0, 0) > LOW_COMPLEXITY_VARIANCE);
    }
}
