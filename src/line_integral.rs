//! Line integrals of per-star posterior images along candidate
//! reddening profiles.
//!
//! The piecewise-linear kernel is the hot loop of the continuous
//! sampler: one call evaluates every star for one proposed profile.
//! Interpolation along the E axis runs in unsigned Q14.18 fixed point,
//! with one integer slope added per distance column; the fractional
//! part of the accumulator is the interpolation weight. The fixed-point
//! discipline is part of the contract: results must agree with the
//! floating-point reference loop to a relative 1e-4 per star.

use crate::grid::{E_AXIS, MU_AXIS};
use crate::stack::ImageStack;

/// Fractional bits of the fixed-point accumulator (unsigned Q14.18).
const FIXED_POINT_BITS: u32 = 18;

/// Integrate each star's posterior along a piecewise-linear E(mu) curve.
///
/// `delta_ebv` holds the N+1 break increments of the profile: entry 0
/// is the reddening at the near edge of the grid, entries 1..=N the
/// increase across each of the N equal distance runs. `subpixel[k]`
/// scales the E axis of star `k`. Results are written to `out`, one
/// entry per star.
///
/// The caller must guarantee that the scaled profile stays at least two
/// E bins below the top of the grid (the posterior's bounds check does
/// this); the interpolation reads bin `floor(y) + 1`.
pub fn piecewise_linear(
    stack: &ImageStack,
    subpixel: &[f64],
    delta_ebv: &[f64],
    out: &mut [f64],
) {
    let grid = stack.grid();
    let n_regions = delta_ebv.len() - 1;
    let n_mu = grid.n_mu();
    assert_eq!(n_mu % n_regions, 0);
    assert_eq!(subpixel.len(), stack.n_stars());
    assert_eq!(out.len(), stack.n_stars());

    let n_pix_per_bin = n_mu / n_regions;
    let de = grid.step(E_AXIS);
    let y_0 = -grid.min(E_AXIS) / de;

    let prec_factor_int: u32 = 1 << FIXED_POINT_BITS;
    let prec_factor = prec_factor_int as f64;

    let dy_mult_factor = 1. / (n_pix_per_bin as f64 * de);
    let ret_mult_factor = 1. / prec_factor;

    for k in 0..stack.n_stars() {
        let img = stack.image(k);
        let s_k = subpixel[k];
        let mut acc = 0.0f64;

        let mut x = 0usize;
        let y = y_0 + s_k * delta_ebv[0] / de;
        let mut y_int = (prec_factor * y) as u32;

        for &d_ebv in &delta_ebv[1..] {
            let dy = s_k * d_ebv * dy_mult_factor;
            let dy_int = (prec_factor * dy) as u32;

            for _ in 0..n_pix_per_bin {
                let y_floor = y_int >> FIXED_POINT_BITS;
                let diff = y_int - (y_floor << FIXED_POINT_BITS);
                let y_floor = y_floor as usize;

                acc += (prec_factor_int - diff) as f64 * img[(y_floor, x)]
                    + diff as f64 * img[(y_floor + 1, x)];

                x += 1;
                y_int += dy_int;
            }
        }

        out[k] = acc * ret_mult_factor;
    }
}

/// Floating-point reference for [`piecewise_linear`]; used by the
/// fixed-point equivalence tests and nowhere on the hot path.
pub fn piecewise_linear_reference(
    stack: &ImageStack,
    subpixel: &[f64],
    delta_ebv: &[f64],
    out: &mut [f64],
) {
    let grid = stack.grid();
    let n_regions = delta_ebv.len() - 1;
    let n_mu = grid.n_mu();
    assert_eq!(n_mu % n_regions, 0);

    let n_pix_per_bin = n_mu / n_regions;
    let de = grid.step(E_AXIS);
    let y_0 = -grid.min(E_AXIS) / de;

    for k in 0..stack.n_stars() {
        let img = stack.image(k);
        let s_k = subpixel[k];
        let mut acc = 0.;

        let mut x = 0usize;
        let mut y = y_0 + s_k * delta_ebv[0] / de;

        for &d_ebv in &delta_ebv[1..] {
            let dy = s_k * d_ebv / (n_pix_per_bin as f64 * de);
            for _ in 0..n_pix_per_bin {
                let y_floor = y.floor();
                let frac = y - y_floor;
                let y_floor = y_floor as usize;
                acc += (1. - frac) * img[(y_floor, x)] + frac * img[(y_floor + 1, x)];
                x += 1;
                y += dy;
            }
        }

        out[k] = acc;
    }
}

/// Integrate each star's posterior along a piecewise-constant cloud
/// profile.
///
/// `delta_mu[i]` is the distance-modulus gap to cloud `i` (the first
/// gap is measured from the grid origin), `log_delta_ebv[i]` its
/// reddening jump. Between clouds the cumulative reddening is constant,
/// so the sweep advances the E coordinate only at cloud positions and
/// linearly interpolates on the E axis inside each run.
pub fn clouds_sweep(
    stack: &ImageStack,
    subpixel: &[f64],
    delta_mu: &[f64],
    log_delta_ebv: &[f64],
    out: &mut [f64],
) {
    let grid = stack.grid();
    let n_clouds = delta_mu.len();
    assert_eq!(log_delta_ebv.len(), n_clouds);
    assert_eq!(out.len(), stack.n_stars());

    let n_mu = grid.n_mu() as isize;
    let de = grid.step(E_AXIS);
    let y_0 = -grid.min(E_AXIS) / de;

    out.iter_mut().for_each(|v| *v = 0.);

    let mut x_start: isize = 0;
    let mut x_next: isize =
        ((delta_mu[0] - grid.min(MU_AXIS)) / grid.step(MU_AXIS)).ceil() as isize;
    let mut y = 0.0f64;

    for i in 0..=n_clouds {
        if i == n_clouds {
            x_next = n_mu;
        } else if i != 0 {
            x_next += (delta_mu[i] / grid.step(MU_AXIS)).ceil() as isize;
        }
        x_next = x_next.clamp(0, n_mu);

        if i != 0 {
            y += log_delta_ebv[i - 1].exp() / de;
        }

        for (k, ret) in out.iter_mut().enumerate() {
            let img = stack.image(k);
            let y_scaled = y_0 + y * subpixel[k];
            let y_floor = y_scaled.floor();
            let frac = y_scaled - y_floor;
            let y_floor = y_floor as usize;

            for x in x_start..x_next {
                let x = x as usize;
                *ret += (1. - frac) * img[(y_floor, x)] + frac * img[(y_floor + 1, x)];
            }
        }
        x_start = x_next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RectGrid;
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

    #[test]
    fn fixed_point_matches_reference() {
        let stack = random_stack(8, 120, 60, 17);
        let subpixel = vec![1.0, 0.9, 1.1, 0.8, 1.0, 0.95, 1.05, 1.0];
        // Modest profile that stays well inside the E range.
        let delta_ebv = vec![0.05, 0.2, 0.3, 0.15, 0.1, 0.05, 0.1];

        let mut fixed = vec![0.; 8];
        let mut float = vec![0.; 8];
        piecewise_linear(&stack, &subpixel, &delta_ebv, &mut fixed);
        piecewise_linear_reference(&stack, &subpixel, &delta_ebv, &mut float);

        for (f, r) in fixed.iter().zip(&float) {
            let rel = (f - r).abs() / r.abs().max(1e-30);
            assert!(rel < 1e-4, "relative error {rel}");
        }
    }

    #[test]
    fn flat_image_integral_is_column_count() {
        // On a constant image the interpolation weights always sum to 1
        // per column, so the integral equals n_mu * value.
        let grid = RectGrid::new([0., 4.], [1., 19.], [50, 20]).unwrap();
        let images = vec![Array2::from_elem((50, 20), 1e-4)];
        let stack = ImageStack::new(images, grid).unwrap();

        let mut out = vec![0.; 1];
        piecewise_linear(&stack, &[1.0], &[0.1, 0.1, 0.1, 0.1, 0.1], &mut out);
        let expected = 20. * 1e-4;
        assert!((out[0] - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn clouds_sweep_counts_flat_columns() {
        let grid = RectGrid::new([0., 4.], [1., 19.], [50, 30]).unwrap();
        let images = vec![Array2::from_elem((50, 30), 2e-4)];
        let stack = ImageStack::new(images, grid).unwrap();

        let mut out = vec![0.; 1];
        clouds_sweep(&stack, &[1.0], &[10.0, 4.0], &[(0.3f64).ln(), (0.2f64).ln()], &mut out);
        let expected = 30. * 2e-4;
        assert!((out[0] - expected).abs() / expected < 1e-6);
    }
}
