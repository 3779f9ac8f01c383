//! Log-prior surfaces over (reddening jump, distance bin).
//!
//! The Galactic density model fixes a log-normal prior on the
//! reddening increase in each distance run; the discrete sampler
//! consumes a discretized version of that prior, optionally shifted
//! toward the Gaussian-process mean implied by the current neighbor
//! choices.

use ndarray::Array2;

use crate::galactic::GalacticLosModel;
use crate::grid::{RectGrid, E_AXIS, MU_AXIS};
use crate::neighbors::{CentralProfile, NeighborPixelBank};

const SQRT_2: f64 = std::f64::consts::SQRT_2;
const PI: f64 = std::f64::consts::PI;

/// Per-distance log-normal prior parameters on the reddening increment.
#[derive(Debug, Clone)]
pub struct LogNormalColumns {
    pub mu: Vec<f64>,
    pub sigma: Vec<f64>,
}

impl LogNormalColumns {
    /// Integrate the Galactic dA/dmu model over each distance run and
    /// convert to a clamped log-normal prior on log(Delta E).
    ///
    /// Returns `n_regions + 1` columns: entry 0 covers everything in
    /// front of the grid, entries 1..=n_regions the equal runs of the
    /// mu axis. `sigma` is the width of the log-normal before the
    /// skew-normal correction controlled by `alpha_skew`.
    pub fn from_galactic_model(
        model: &dyn GalacticLosModel,
        grid: &RectGrid,
        n_regions: usize,
        log_floor: f64,
        log_ceil: f64,
        sigma: f64,
        alpha_skew: f64,
    ) -> Self {
        let mu_0 = grid.min(MU_AXIS);
        let mu_1 = grid.max(MU_AXIS);

        let subsampling = 100usize;
        let d_mu = (mu_1 - mu_0) / (n_regions * subsampling) as f64;

        // Normalization anchored to the local reddening rate:
        // 0.2 mag/kpc at the solar position, with the log-normal bias
        // correction folded in.
        let d_ebv_ds = 0.2;
        let ds_dmu = 10. * 10f64.ln() / 5. * 10f64.powf(-10. / 5.);
        let d_ebv_ds_local = model.da_dmu(-10.) / ds_dmu * (0.5 * sigma * sigma).exp();
        let log_norm = (0.001 * d_ebv_ds / d_ebv_ds_local).ln();

        let mut delta_a = vec![0.0f64; n_regions + 1];

        // Everything closer than the grid is folded into column 0.
        let n_close = 1usize;
        let mut mu = mu_0 - (n_close * subsampling) as f64 * d_mu;
        for _ in 0..n_close * subsampling {
            delta_a[0] += model.da_dmu(mu);
            mu += d_mu;
        }
        delta_a[0] *= d_mu;

        for i in 1..=n_regions {
            for _ in 0..subsampling {
                delta_a[i] += model.da_dmu(mu);
                mu += d_mu;
            }
            delta_a[i] *= d_mu;
        }

        let mut mu_cols = Vec::with_capacity(n_regions + 1);
        let mut sigma_cols = Vec::with_capacity(n_regions + 1);
        for &da in &delta_a {
            let m = (da.ln() + log_norm).clamp(log_floor, log_ceil);
            mu_cols.push(m);
            sigma_cols.push(sigma);
        }

        // Recenter for the skew-normal parameterization.
        let delta_skew = alpha_skew / (1. + alpha_skew * alpha_skew);
        let sigma_scale = (1. - 2. * delta_skew * delta_skew / PI).sqrt();
        for (m, s) in mu_cols.iter_mut().zip(&mut sigma_cols) {
            *s /= sigma_scale;
            *m -= delta_skew * *s * SQRT_2 / PI;
        }

        LogNormalColumns {
            mu: mu_cols,
            sigma: sigma_cols,
        }
    }

    pub fn len(&self) -> usize {
        self.mu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mu.is_empty()
    }
}

/// Discretized log-prior surface lnP(reddening jump | distance bin).
///
/// Entries are indexed `(dy, distance)`. `y_zero` is the E bin
/// corresponding to zero cumulative reddening; the first distance
/// column's jump is measured from it.
#[derive(Debug, Clone)]
pub struct PriorImage {
    lnp: Array2<f64>,
    y_zero: i32,
}

impl PriorImage {
    pub fn zeros(n_e: usize, n_dists: usize, y_zero: i32) -> Self {
        PriorImage {
            lnp: Array2::zeros((n_e, n_dists)),
            y_zero,
        }
    }

    pub fn n_e(&self) -> usize {
        self.lnp.nrows()
    }

    pub fn n_dists(&self) -> usize {
        self.lnp.ncols()
    }

    pub fn y_zero(&self) -> i32 {
        self.y_zero
    }

    /// Log-prior of a single reddening jump `dy` at distance `x`.
    ///
    /// Negative jumps are penalized through the annealed shape
    /// constraint `inv_sigma_dy_neg`; jumps beyond the grid top are
    /// impossible.
    #[inline]
    pub fn log_dy_prior(&self, x: usize, dy: i32, inv_sigma_dy_neg: f64) -> f64 {
        if dy < 0 {
            let z = dy as f64 * inv_sigma_dy_neg;
            -0.5 * z * z
        } else if dy as usize >= self.n_e() {
            f64::NEG_INFINITY
        } else {
            self.lnp[(dy as usize, x)]
        }
    }

    /// Total log-prior of a discrete profile.
    pub fn log_prior(&self, y: &[i32], inv_sigma_dy_neg: f64) -> f64 {
        let mut log_p = self.log_dy_prior(0, y[0] - self.y_zero, inv_sigma_dy_neg);
        for x in 1..y.len() {
            log_p += self.log_dy_prior(x, y[x] - y[x - 1], inv_sigma_dy_neg);
        }
        log_p
    }

    /// Prior change for a single-bin step `y[x] -> y_new`.
    ///
    /// Only the jump into bin `x` and the jump out of it change.
    pub fn log_prior_diff_step(
        &self,
        x: usize,
        y: &[i32],
        y_new: i32,
        inv_sigma_dy_neg: f64,
    ) -> f64 {
        let left = if x == 0 { self.y_zero } else { y[x - 1] };
        let dy_old = y[x] - left;
        let dy_new = y_new - left;

        let mut diff = self.log_dy_prior(x, dy_new, inv_sigma_dy_neg)
            - self.log_dy_prior(x, dy_old, inv_sigma_dy_neg);

        if x != y.len() - 1 {
            let dy_old_r = y[x + 1] - y[x];
            let dy_new_r = y[x + 1] - y_new;
            diff += self.log_dy_prior(x + 1, dy_new_r, inv_sigma_dy_neg)
                - self.log_dy_prior(x + 1, dy_old_r, inv_sigma_dy_neg);
        }

        diff
    }

    /// Prior change for swapping the jumps at `x` and `x + 1`.
    /// Requires `1 <= x <= n_dists - 2`.
    pub fn log_prior_diff_swap(&self, x: usize, y: &[i32], inv_sigma_dy_neg: f64) -> f64 {
        let dy_left = y[x] - y[x - 1];
        let dy_right = y[x + 1] - y[x];

        self.log_dy_prior(x, dy_right, inv_sigma_dy_neg)
            + self.log_dy_prior(x + 1, dy_left, inv_sigma_dy_neg)
            - self.log_dy_prior(x, dy_left, inv_sigma_dy_neg)
            - self.log_dy_prior(x + 1, dy_right, inv_sigma_dy_neg)
    }

    /// Prior change for shifting `y[0..=x]` by `dy`: only the jump out
    /// of the shifted block and the jump from the zero watermark move.
    pub fn log_prior_diff_shift_l(
        &self,
        x: usize,
        dy: i32,
        y: &[i32],
        inv_sigma_dy_neg: f64,
    ) -> f64 {
        let dy_old = y[x + 1] - y[x];
        self.log_dy_prior(x + 1, dy_old - dy, inv_sigma_dy_neg)
            - self.log_dy_prior(x + 1, dy_old, inv_sigma_dy_neg)
            + self.log_dy_prior(0, y[0] + dy - self.y_zero, inv_sigma_dy_neg)
            - self.log_dy_prior(0, y[0] - self.y_zero, inv_sigma_dy_neg)
    }

    /// Prior change for shifting `y[x..]` by `dy`: only the jump into
    /// the shifted block moves.
    pub fn log_prior_diff_shift_r(
        &self,
        x: usize,
        dy: i32,
        y: &[i32],
        inv_sigma_dy_neg: f64,
    ) -> f64 {
        let left = if x == 0 { self.y_zero } else { y[x - 1] };
        let dy_old = y[x] - left;
        self.log_dy_prior(x, dy_old + dy, inv_sigma_dy_neg)
            - self.log_dy_prior(x, dy_old, inv_sigma_dy_neg)
    }
}

/// Builds [`PriorImage`]s for a fixed grid and Galactic prior, with or
/// without neighbor coupling.
///
/// One builder is shared by all temperatures of the discrete sampler;
/// each temperature owns the image the builder writes into.
#[derive(Debug, Clone)]
pub struct PriorImageBuilder {
    mu0: Vec<f64>,
    sigma0: Vec<f64>,
    de: f64,
    n_e: usize,
    n_dists: usize,
    y_zero: i32,
    subsampling: usize,
}

impl PriorImageBuilder {
    /// `columns` must hold at least `n_dists` entries; extra entries
    /// (the continuous model computes one per region boundary) are
    /// ignored.
    pub fn new(columns: &LogNormalColumns, grid: &RectGrid, subsampling: usize) -> Self {
        let n_dists = grid.n_mu();
        assert!(columns.len() >= n_dists);
        assert!(subsampling >= 1);
        PriorImageBuilder {
            mu0: columns.mu[..n_dists].to_vec(),
            sigma0: columns.sigma[..n_dists].to_vec(),
            de: grid.step(E_AXIS),
            n_e: grid.n_e(),
            n_dists,
            y_zero: grid.zero_reddening_bin().round() as i32,
            subsampling,
        }
    }

    pub fn mu0(&self) -> &[f64] {
        &self.mu0
    }

    pub fn sigma0(&self) -> &[f64] {
        &self.sigma0
    }

    pub fn new_image(&self) -> PriorImage {
        PriorImage::zeros(self.n_e, self.n_dists, self.y_zero)
    }

    /// Rebuild `img` for the given neighbor configuration.
    ///
    /// Without a bank the columns are the bare Galactic log-normals.
    /// With a bank, each column's mean is pulled toward the GP
    /// conditional mean of the central pixel and its width replaced by
    /// the GP conditional variance.
    pub fn build_into(
        &self,
        bank: Option<(&NeighborPixelBank, &[u16], &CentralProfile, f64)>,
        img: &mut PriorImage,
    ) {
        assert_eq!(img.n_e(), self.n_e);
        assert_eq!(img.n_dists(), self.n_dists);

        let sub = self.subsampling;
        let log_scale = self.de.ln();

        for x in 0..self.n_dists {
            let (mean_shift, inv_var_gp) = match &bank {
                Some((bank, choices, central, shift_weight)) => (
                    bank.mean(0, x, choices, central.values(), *shift_weight),
                    bank.inv_var(0, x),
                ),
                None => (0., 1.),
            };

            let sigma0 = self.sigma0[x];
            let mu = mean_shift * sigma0 + self.mu0[x];
            let inv_var = inv_var_gp / (sigma0 * sigma0);

            let mut p_dist = 0.;

            // dy = 0 is a point mass; 1.5 is a fudge factor favoring
            // exactly-flat columns over marginally-positive ones.
            let p0 = if mu < log_scale {
                sub as f64 / self.de * 1.5
            } else {
                let delta = log_scale - mu;
                sub as f64 * (-0.5 * delta * delta * inv_var).exp() / self.de * 1.5
            };
            img.lnp[(0, x)] = p0;
            p_dist += p0;

            for y in 1..self.n_e {
                let de0 = y as f64 * self.de;
                let mut p = 0.;
                for k in 0..sub {
                    let de = de0 + k as f64 / sub as f64 * self.de;
                    let log_de = de.ln();
                    if log_de.is_finite() {
                        let delta = log_de - mu;
                        p += (-0.5 * delta * delta * inv_var).exp() / de;
                    }
                }
                img.lnp[(y, x)] = p;
                p_dist += p;
            }

            for y in 0..self.n_e {
                let mut v = img.lnp[(y, x)];
                if p_dist > 0. {
                    v /= p_dist;
                }
                let mut lnv = v.ln();
                if lnv < -100. {
                    lnv = -100. - 0.01 * (y * y) as f64;
                }
                img.lnp[(y, x)] = lnv;
            }

            // A floored flat-column entry would forbid dy = 0 outright;
            // promote it back to certainty instead.
            if img.lnp[(0, x)] <= -99.999 {
                img.lnp[(0, x)] = 0.;
            }
        }
    }
}
