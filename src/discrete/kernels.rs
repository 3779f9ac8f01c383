//! Discrete line integrals and their incremental updates.
//!
//! The discrete profile assigns one reddening bin per distance column,
//! so the per-star line integral is a plain sum of one image value per
//! column. Every proposal kind touches a known set of columns; these
//! kernels compute the integral deltas from exactly those columns.

use crate::stack::ImageStack;

/// Full line integral of each star along the discrete profile `y`.
pub fn line_integrals(stack: &ImageStack, y: &[i32], out: &mut [f64]) {
    debug_assert_eq!(y.len(), stack.grid().n_mu());
    for (k, acc) in out.iter_mut().enumerate() {
        let img = stack.image(k);
        *acc = y
            .iter()
            .enumerate()
            .map(|(x, &yi)| img[(yi as usize, x)])
            .sum();
    }
}

/// Delta from changing column `x` from `y_old` to `y_new`.
pub fn diff_step(stack: &ImageStack, x: usize, y_old: i32, y_new: i32, out: &mut [f64]) {
    for (k, d) in out.iter_mut().enumerate() {
        let img = stack.image(k);
        *d = img[(y_new as usize, x)] - img[(y_old as usize, x)];
    }
}

/// Delta from swapping the reddening jumps at columns `x` and `x + 1`.
///
/// The swap conserves the cumulative reddening on both sides of the
/// pair, so only column `x` changes: its new level is the left
/// neighbor's level plus the former right-hand jump.
pub fn diff_swap(stack: &ImageStack, x: usize, y: &[i32], out: &mut [f64]) {
    let dy = y[x + 1] - y[x];
    let y_old = y[x];
    let y_new = y[x - 1] + dy;
    diff_step(stack, x, y_old, y_new, out);
}

/// Delta from shifting `y[x..]` by `dy`.
pub fn diff_shift_r(stack: &ImageStack, x: usize, dy: i32, y: &[i32], out: &mut [f64]) {
    for (k, d) in out.iter_mut().enumerate() {
        let img = stack.image(k);
        *d = 0.;
        for (j, &yj) in y.iter().enumerate().skip(x) {
            *d += img[((yj + dy) as usize, j)] - img[(yj as usize, j)];
        }
    }
}

/// Delta from shifting `y[0..=x]` by `dy`.
pub fn diff_shift_l(stack: &ImageStack, x: usize, dy: i32, y: &[i32], out: &mut [f64]) {
    for (k, d) in out.iter_mut().enumerate() {
        let img = stack.image(k);
        *d = 0.;
        for (j, &yj) in y.iter().enumerate().take(x + 1) {
            *d += img[((yj + dy) as usize, j)] - img[(yj as usize, j)];
        }
    }
}

/// Whether shifting `y[x..]` by `dy` keeps every touched level inside
/// `[0, n_e)`.
pub fn shift_r_valid(n_e: usize, x: usize, dy: i32, y: &[i32]) -> bool {
    y[x..]
        .iter()
        .all(|&yj| yj + dy >= 0 && ((yj + dy) as usize) < n_e)
}

/// Whether shifting `y[0..=x]` by `dy` keeps every touched level inside
/// `[0, n_e)`.
pub fn shift_l_valid(n_e: usize, x: usize, dy: i32, y: &[i32]) -> bool {
    y[..=x]
        .iter()
        .all(|&yj| yj + dy >= 0 && ((yj + dy) as usize) < n_e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RectGrid;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_stack(n_stars: usize, n_e: usize, n_mu: usize, seed: u64) -> ImageStack {
        let mut rng = SmallRng::seed_from_u64(seed);
        let grid = RectGrid::new([0., 4.], [n_e as f64 * 0.02, 19.], [n_e, n_mu]).unwrap();
        let images = (0..n_stars)
            .map(|_| Array2::from_shape_fn((n_e, n_mu), |_| rng.gen_range(0.0..1e-3)))
            .collect();
        ImageStack::new(images, grid).unwrap()
    }

    fn apply_and_compare(
        stack: &ImageStack,
        y: &[i32],
        y_after: &[i32],
        delta: &[f64],
    ) {
        let n = stack.n_stars();
        let mut before = vec![0.; n];
        let mut after = vec![0.; n];
        line_integrals(stack, y, &mut before);
        line_integrals(stack, y_after, &mut after);
        for k in 0..n {
            assert_abs_diff_eq!(after[k] - before[k], delta[k], epsilon = 1e-12);
        }
    }

    #[test]
    fn step_delta_matches_recomputation() {
        let stack = random_stack(5, 40, 16, 2);
        let y: Vec<i32> = (0..16).map(|i| 3 + i / 2).collect();
        let mut delta = vec![0.; 5];
        diff_step(&stack, 7, y[7], y[7] + 1, &mut delta);
        let mut y2 = y.clone();
        y2[7] += 1;
        apply_and_compare(&stack, &y, &y2, &delta);
    }

    #[test]
    fn swap_delta_matches_recomputation() {
        let stack = random_stack(4, 40, 16, 3);
        let y: Vec<i32> = (0..16).map(|i| 2 + i).collect();
        let x = 5;
        let mut delta = vec![0.; 4];
        diff_swap(&stack, x, &y, &mut delta);
        let mut y2 = y.clone();
        y2[x] = y[x - 1] + (y[x + 1] - y[x]);
        apply_and_compare(&stack, &y, &y2, &delta);
    }

    #[test]
    fn shift_deltas_match_recomputation() {
        let stack = random_stack(3, 40, 16, 4);
        let y: Vec<i32> = (0..16).map(|i| 5 + i / 3).collect();

        let (x, dy) = (6, 1);
        assert!(shift_r_valid(40, x, dy, &y));
        let mut delta = vec![0.; 3];
        diff_shift_r(&stack, x, dy, &y, &mut delta);
        let mut y2 = y.clone();
        for v in &mut y2[x..] {
            *v += dy;
        }
        apply_and_compare(&stack, &y, &y2, &delta);

        let (x, dy) = (4, -2);
        assert!(shift_l_valid(40, x, dy, &y));
        diff_shift_l(&stack, x, dy, &y, &mut delta);
        let mut y2 = y.clone();
        for v in &mut y2[..=x] {
            *v += dy;
        }
        apply_and_compare(&stack, &y, &y2, &delta);
    }

    #[test]
    fn shift_validity_detects_out_of_range() {
        let y: Vec<i32> = vec![0, 1, 2, 38, 39];
        assert!(!shift_r_valid(40, 3, 1, &y));
        assert!(!shift_l_valid(40, 1, -1, &y));
        assert!(shift_r_valid(40, 3, -1, &y));
        assert!(shift_l_valid(40, 1, 1, &y));
    }

    #[test]
    fn incremental_updates_track_full_recomputation_over_many_steps() {
        // Long random walk applying step deltas incrementally; the
        // accumulated integrals must match a fresh recomputation to
        // within tight relative error.
        let stack = random_stack(6, 50, 20, 9);
        let mut rng = SmallRng::seed_from_u64(77);
        let mut y: Vec<i32> = vec![10; 20];
        let mut line_int = vec![0.; 6];
        line_integrals(&stack, &y, &mut line_int);
        let mut delta = vec![0.; 6];

        for _ in 0..5000 {
            let x = rng.gen_range(0..20);
            let dy = if rng.gen::<bool>() { 1 } else { -1 };
            let y_new = y[x] + dy;
            if y_new < 0 || y_new >= 50 {
                continue;
            }
            diff_step(&stack, x, y[x], y_new, &mut delta);
            y[x] = y_new;
            for (li, d) in line_int.iter_mut().zip(&delta) {
                *li += d;
            }
        }

        let mut fresh = vec![0.; 6];
        line_integrals(&stack, &y, &mut fresh);
        for (running, exact) in line_int.iter().zip(&fresh) {
            let rel = (running - exact).abs() / exact.abs().max(1e-30);
            assert!(rel < 1e-6, "drift {rel}");
        }
    }
}
