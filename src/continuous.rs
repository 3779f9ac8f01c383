//! Continuous line-of-sight posterior over log reddening increments,
//! and the ensemble driver that samples it.
//!
//! The unknowns are the N+1 log increments of a piecewise-linear
//! cumulative reddening profile. The likelihood couples to the stellar
//! images through the fixed-point line integral; the prior either
//! follows the Galactic model (a skew-normal on each log increment) or
//! falls back to a wide Gaussian.

use itertools::izip;
use log::{debug, info};
use nalgebra::DMatrix;
use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;
use statrs::function::erf::erf;

use crate::chain::CumulativeReddening;
use crate::ensemble::{LogProbFn, ParallelEnsemble, ReversibleMove};
use crate::error::StackError;
use crate::grid::{E_AXIS, MU_AXIS};
use crate::line_integral::piecewise_linear;
use crate::settings::McmcOptions;
use crate::stack::ImageStack;

const INV_SQRT_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Convergence threshold for the transformed Gelman-Rubin statistic.
const GR_THRESHOLD: f64 = 1.25;

/// Chains covering distances past this modulus are allowed to stay
/// unconverged; the data rarely constrain them.
const MAX_CONV_MU: f64 = 15.;

/// Per-increment skew-normal prior from the Galactic model.
#[derive(Debug, Clone)]
pub struct SkewPrior {
    pub mu: Vec<f64>,
    pub sigma: Vec<f64>,
    pub alpha_skew: f64,
}

impl SkewPrior {
    pub fn from_columns(columns: &crate::prior::LogNormalColumns, alpha_skew: f64) -> Self {
        SkewPrior {
            mu: columns.mu.clone(),
            sigma: columns.sigma.clone(),
            alpha_skew,
        }
    }
}

/// How fresh walker positions are drawn.
enum InitMode {
    /// Diffuse draws around the prior (or a flat heuristic); used by
    /// the short guess chain.
    Diffuse,
    /// Correlated jitter around a previously fitted profile; used by
    /// the main chain.
    FromGuess {
        profile: Vec<f64>,
        sqrt_cov: Option<DMatrix<f64>>,
    },
}

/// The continuous LOS posterior.
pub struct LosPosterior<'a> {
    stack: &'a ImageStack,
    n_regions: usize,
    subpixel: Vec<f64>,
    subpixel_max: f64,
    p0_over_z: Vec<f64>,
    ln_p0_over_z: Vec<f64>,
    inv_p0_over_z: Vec<f64>,
    ebv_max: Option<f64>,
    guess_max: f64,
    prior: Option<SkewPrior>,
    init: InitMode,
}

/// Scratch owned by each walker: the exponentiated profile and the
/// per-star line integrals.
pub struct LosWorkspace {
    delta_ebv: Vec<f64>,
    line_int: Vec<f64>,
}

impl<'a> LosPosterior<'a> {
    /// `ln_z` holds the per-star log-evidences used by the p0/Z
    /// likelihood softening; `p0` is the bad-star floor density.
    pub fn new(
        stack: &'a ImageStack,
        n_regions: usize,
        ln_z: &[f64],
        p0: f64,
        ebv_max: Option<f64>,
    ) -> Result<Self, StackError> {
        let n_mu = stack.grid().n_mu();
        if n_regions == 0 || n_mu % n_regions != 0 {
            return Err(StackError::IndivisibleRegions { n_mu, n_regions });
        }
        assert_eq!(ln_z.len(), stack.n_stars());

        let ln_p0 = p0.ln();
        let ln_p0_over_z: Vec<f64> = ln_z.iter().map(|&z| ln_p0 - z).collect();
        let p0_over_z: Vec<f64> = ln_p0_over_z.iter().map(|&v| v.exp()).collect();
        let inv_p0_over_z: Vec<f64> = ln_p0_over_z.iter().map(|&v| (-v).exp()).collect();

        Ok(LosPosterior {
            guess_max: stack.guess_max_reddening(),
            stack,
            n_regions,
            subpixel: vec![1.; stack.n_stars()],
            subpixel_max: 1.,
            p0_over_z,
            ln_p0_over_z,
            inv_p0_over_z,
            ebv_max,
            prior: None,
            init: InitMode::Diffuse,
        })
    }

    /// Install per-star subpixel scalings of the E axis.
    pub fn set_subpixel(&mut self, subpixel: &[f64]) {
        assert_eq!(subpixel.len(), self.stack.n_stars());
        self.subpixel = subpixel.to_vec();
        self.subpixel_max = subpixel.iter().copied().fold(0., f64::max);
    }

    /// Install the Galactic skew-normal prior on the log increments.
    pub fn set_prior(&mut self, prior: SkewPrior) {
        assert_eq!(prior.mu.len(), self.dim());
        self.prior = Some(prior);
    }

    /// Seed walkers near `profile` (log increments), jittered through
    /// `sqrt_cov` when provided.
    pub fn set_guess(&mut self, profile: Vec<f64>, sqrt_cov: Option<DMatrix<f64>>) {
        assert_eq!(profile.len(), self.dim());
        self.init = InitMode::FromGuess { profile, sqrt_cov };
    }

    pub fn stack(&self) -> &ImageStack {
        self.stack
    }

    pub fn guess_max(&self) -> f64 {
        self.guess_max
    }

    fn draw_diffuse<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        let grid = self.stack.grid();
        let ebv_ceil = grid.max(E_AXIS) / self.subpixel_max;
        let n = out.len();
        let mu = 1.5 * self.guess_max / self.subpixel_max / n as f64;
        let mut ebv_sum = 0.;

        match &self.prior {
            Some(prior) if rng.gen::<f64>() < 0.8 => {
                for (i, v) in out.iter_mut().enumerate() {
                    let eps: f64 = rng.sample(StandardNormal);
                    *v = prior.mu[i] + prior.sigma[i] * eps;
                    ebv_sum += v.exp();
                }
            }
            _ => {
                let eps: f64 = rng.sample(StandardNormal);
                let log_scaling = 0.25 * eps;
                for v in out.iter_mut() {
                    *v = (mu * rng.gen::<f64>()).ln() + log_scaling;
                    ebv_sum += v.exp();
                }
            }
        }

        // Occasionally top the profile up to the guessed maximum with
        // one extra cloud.
        if rng.gen::<f64>() < 0.25 {
            let sigma_tmp = 0.5f64;
            let eps: f64 = rng.sample(StandardNormal);
            let target =
                self.guess_max * (sigma_tmp * eps - 0.5 * sigma_tmp * sigma_tmp - 0.5).exp();
            if ebv_sum < target {
                let k = rng.gen_range(0..n);
                out[k] = (out[k].exp() + target - ebv_sum).ln();
                ebv_sum = target;
            }
        }

        if ebv_sum >= 0.95 * ebv_ceil {
            let factor = (0.95 * ebv_ceil / ebv_sum).ln();
            for v in out.iter_mut() {
                *v += factor;
            }
        }
    }

    fn draw_from_guess<R: Rng + ?Sized>(
        &self,
        profile: &[f64],
        sqrt_cov: Option<&DMatrix<f64>>,
        rng: &mut R,
        out: &mut [f64],
    ) {
        let ebv_ceil = self.stack.grid().max(E_AXIS);
        let sigma = 0.05;
        let mut ebv_sum = 0.;

        match sqrt_cov {
            None => {
                for (v, &g) in out.iter_mut().zip(profile) {
                    let eps: f64 = rng.sample(StandardNormal);
                    *v = g + sigma * eps;
                    ebv_sum += v.exp();
                }
            }
            Some(sqrt_cov) => {
                // Correlated redistribution of reddening among bins.
                let n = out.len();
                let z = DMatrix::from_fn(n, 1, |_, _| rng.sample::<f64, _>(StandardNormal));
                let v = sqrt_cov * z;
                for i in 0..n {
                    out[i] = profile[i] + sigma * v[(i, 0)];
                    ebv_sum += out[i].exp();
                }
            }
        }

        if ebv_sum >= 0.95 * ebv_ceil {
            let factor = (0.95 * ebv_ceil / ebv_sum).ln();
            for v in out.iter_mut() {
                *v += factor;
            }
        }
    }
}

impl<'a> LogProbFn for LosPosterior<'a> {
    type Workspace = LosWorkspace;

    fn dim(&self) -> usize {
        self.n_regions + 1
    }

    fn workspace(&self) -> LosWorkspace {
        LosWorkspace {
            delta_ebv: vec![0.; self.n_regions + 1],
            line_int: vec![0.; self.stack.n_stars()],
        }
    }

    fn log_prob(&self, x: &[f64], ws: &mut LosWorkspace) -> f64 {
        let grid = self.stack.grid();
        let mut lnp = 0.;
        let mut ebv_tot = 0.;

        for (d, &v) in ws.delta_ebv.iter_mut().zip(x) {
            *d = v.exp();
            ebv_tot += *d;
        }

        match &self.prior {
            Some(prior) => {
                for (i, &v) in x.iter().enumerate() {
                    let z = (v - prior.mu[i]) / prior.sigma[i];
                    lnp -= 0.5 * z * z;
                    lnp += (1. + erf(prior.alpha_skew * z * INV_SQRT_2)).ln();
                }
            }
            None => {
                let bias = -4.;
                let sigma = 2.;
                for &v in x {
                    lnp -= (v - bias) * (v - bias) / (2. * sigma * sigma);
                }
            }
        }

        // The scaled profile must leave interpolation head-room below
        // the top of the E grid.
        let ebv_tot_idx = ((ebv_tot * self.subpixel_max - grid.min(E_AXIS))
            / grid.step(E_AXIS))
        .ceil();
        if ebv_tot_idx + 1. >= grid.n_e() as f64 {
            return f64::NEG_INFINITY;
        }

        if let Some(ebv_max) = self.ebv_max {
            if ebv_tot > ebv_max {
                let over = ebv_tot - ebv_max;
                lnp -= over * over / (2. * 0.20 * 0.20 * ebv_max * ebv_max);
            }
        }

        piecewise_linear(self.stack, &self.subpixel, &ws.delta_ebv, &mut ws.line_int);

        // Soften each star's contribution against the bad-star floor;
        // the two branches avoid cancellation across the many orders
        // of magnitude the line integrals span.
        for (i, &li) in ws.line_int.iter().enumerate() {
            lnp += if li > self.p0_over_z[i] {
                li.ln() + (1. + self.p0_over_z[i] / li).ln()
            } else {
                self.ln_p0_over_z[i] + (1. + li * self.inv_p0_over_z[i]).ln()
            };
        }

        lnp
    }

    fn draw_initial<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        match &self.init {
            InitMode::Diffuse => self.draw_diffuse(rng, out),
            InitMode::FromGuess { profile, sqrt_cov } => {
                self.draw_from_guess(profile, sqrt_cov.as_ref(), rng, out)
            }
        }
    }
}

/// Square root of the guess covariance: unit diagonal with
/// exponentially decaying negative off-diagonals, which redistributes
/// reddening between bins without collapsing the total.
pub fn guess_covariance_sqrt(n: usize, scale_length: f64) -> DMatrix<f64> {
    let mut cov = DMatrix::zeros(n, n);
    for k in 0..n {
        cov[(k, k)] = 1.;
    }
    for offset in 1..n {
        let val = -(-((offset * offset) as f64) / (2. * scale_length * scale_length)).exp();
        for k in 0..n - offset {
            cov[(k + offset, k)] = val;
            cov[(k, k + offset)] = val;
        }
    }

    let eig = cov.symmetric_eigen();
    let sqrt_vals = DMatrix::from_diagonal(&eig.eigenvalues.map(|l| l.max(0.).sqrt()));
    &eig.eigenvectors * sqrt_vals * eig.eigenvectors.transpose()
}

/// Positive monotonic-profile target used by [`monotonic_guess`].
struct MonotonicTarget {
    anchors_ebv: Vec<f64>,
    anchors_sigma: Vec<f64>,
    anchors_weight: Vec<f64>,
    ebv_max: f64,
    ebv_ceil: f64,
}

impl LogProbFn for MonotonicTarget {
    type Workspace = ();

    fn dim(&self) -> usize {
        self.anchors_ebv.len()
    }

    fn workspace(&self) -> Self::Workspace {}

    fn log_prob(&self, x: &[f64], _ws: &mut ()) -> f64 {
        let mut lnp = 0.;
        let mut ebv = 0.;
        for (i, &d) in x.iter().enumerate() {
            if d < 0. {
                return f64::NEG_INFINITY;
            }
            ebv += d;
            if self.anchors_weight[i] > 1e-10 {
                let z = (ebv - self.anchors_ebv[i]) / self.anchors_sigma[i];
                lnp -= 0.5 * z * z;
            }
        }
        lnp
    }

    fn draw_initial<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        let mu = 2. * self.ebv_max / out.len() as f64;
        let mut sum = 0.;
        for v in out.iter_mut() {
            *v = mu * rng.gen::<f64>();
            sum += *v;
        }
        if sum >= 0.95 * self.ebv_ceil {
            let factor = 0.95 * self.ebv_ceil / sum;
            for v in out.iter_mut() {
                *v *= factor;
            }
        }
    }
}

/// Build a monotonic seed profile from the weighted mean reddening
/// around each region anchor, then refine it with a short
/// positive-increment chain. Returns log increments.
pub fn monotonic_guess(
    stack: &ImageStack,
    n_regions: usize,
    options: &McmcOptions,
    seed: u64,
) -> Vec<f64> {
    let grid = stack.grid();
    let stacked = stack.stacked();
    let (n_e, n_mu) = stacked.dim();

    // Weighted mean and scatter of E in each distance column.
    let mut dist_y_sum = vec![0.0f64; n_mu];
    let mut dist_y2_sum = vec![0.0f64; n_mu];
    let mut dist_sum = vec![0.0f64; n_mu];
    for e in 0..n_e {
        let y = e as f64 + 0.5;
        for m in 0..n_mu {
            let w = stacked[(e, m)];
            dist_y_sum[m] += y * w;
            dist_y2_sum[m] += y * y * w;
            dist_sum[m] += w;
        }
    }

    // Aggregate around each anchor point.
    let n_anchor = n_regions + 1;
    let width = n_mu as f64 / n_regions as f64;
    let mut y_sum = vec![0.0f64; n_anchor];
    let mut y2_sum = vec![0.0f64; n_anchor];
    let mut w_sum = vec![0.0f64; n_anchor];
    let mut k_start = 0usize;
    for n in 0..n_anchor {
        let k_end = if n == n_regions {
            n_mu
        } else {
            ((((n as f64) + 0.5) * width).ceil() as usize).min(n_mu)
        };
        let k0 = k_start.min(k_end);
        for (ys, y2s, ws) in izip!(
            &dist_y_sum[k0..k_end],
            &dist_y2_sum[k0..k_end],
            &dist_sum[k0..k_end]
        ) {
            y_sum[n] += ys;
            y2_sum[n] += y2s;
            w_sum[n] += ws;
        }
        k_start = (k_end + 1).min(n_mu);
    }

    let mut anchors_ebv = vec![0.0f64; n_anchor];
    let mut anchors_sigma = vec![0.0f64; n_anchor];
    for n in 0..n_anchor {
        if w_sum[n] > 0. {
            anchors_ebv[n] = grid.min(E_AXIS) + grid.step(E_AXIS) * y_sum[n] / w_sum[n];
            let var = (y2_sum[n] - y_sum[n] * y_sum[n] / w_sum[n]) / w_sum[n];
            anchors_sigma[n] = grid.step(E_AXIS) * var.max(0.25).sqrt();
        } else {
            anchors_sigma[n] = grid.step(E_AXIS);
        }
    }

    let target = MonotonicTarget {
        ebv_max: anchors_ebv.iter().copied().fold(0., f64::max),
        ebv_ceil: grid.max(E_AXIS),
        anchors_ebv,
        anchors_sigma,
        anchors_weight: w_sum,
    };

    let n_steps = 100usize;
    let n_walkers = (2 * (n_regions + 1)).max(4);
    let mut sampler = ParallelEnsemble::new(
        &target,
        n_walkers,
        options.n_runs.max(1),
        2 * n_steps * n_walkers,
        seed,
    );
    sampler.set_scale(1.1);
    sampler.set_replacement_bandwidth(0.75);

    sampler.step(n_steps * 40 / 100, true, 0.);
    sampler.step(n_steps * 10 / 100, true, 1.);
    sampler.step(n_steps * 40 / 100, true, 0.);
    sampler.step(n_steps * 10 / 100, true, 1.);

    let best = sampler.best().unwrap_or(vec![1e-3; n_anchor]);
    best.iter().map(|&d| d.max(1e-9).ln()).collect()
}

/// Fit a rough reddening profile with a short diffuse chain; the
/// result seeds the main run.
pub fn guess_profile(posterior: &LosPosterior, options: &McmcOptions, seed: u64) -> Vec<f64> {
    let ndim = posterior.dim();
    let mut n_steps = options.steps / 8;
    n_steps = n_steps.max(50).max(2 * ndim);
    let base = (n_steps as f64 / 10.).ceil() as usize;

    let n_walkers = (options.samplers * ndim).max(4);
    let capacity = 12 * base * n_walkers;
    let mut sampler =
        ParallelEnsemble::new(posterior, n_walkers, options.n_runs.max(1), capacity, seed);
    sampler.set_sigma_min(0.001);
    sampler.set_scale(1.05);
    sampler.set_replacement_bandwidth(0.25);

    sampler.step_mh(2 * base, true);
    sampler.step_custom(base, ReversibleMove::SwapAdjacent, true);

    sampler.step_mh(base, true);
    sampler.step_custom(base, ReversibleMove::SwapAdjacent, true);
    sampler.step_custom(base, ReversibleMove::StepOne, true);
    sampler.step(base, false, 1.);

    sampler.step_mh(base, true);
    sampler.step_custom(base, ReversibleMove::SwapAdjacent, true);
    sampler.step_custom(base, ReversibleMove::StepOne, true);
    sampler.step(base, false, 1.);

    sampler.step_mh(base, true);

    sampler.log_diagnostics();
    sampler
        .best()
        .expect("guess chain recorded at least one state")
}

/// Result of one continuous line-of-sight fit.
#[derive(Debug, Clone)]
pub struct LosFit {
    /// Saved log-increment profiles, one row per saved state.
    pub samples: Array2<f64>,
    pub gelman_rubin: Vec<f64>,
    pub converged: bool,
    pub dm_min: f64,
    pub dm_max: f64,
}

fn subsample(chain: &crate::chain::Chain, n_save: usize) -> Array2<f64> {
    let n = chain.len();
    let n_save = n_save.min(n);
    let mut out = Array2::zeros((n_save, chain.n_dim()));
    if n_save == 0 {
        return out;
    }
    for i in 0..n_save {
        let src = i * n / n_save;
        out.row_mut(i).assign(&ndarray::ArrayView1::from(chain.coords(src)));
    }
    out
}

/// Sample the piecewise-linear LOS model end to end: guess, burn-in,
/// main phase with convergence checks, optional chain extension.
pub fn sample_los_extinction(
    posterior: &mut LosPosterior,
    options: &McmcOptions,
    n_save: usize,
    seed: u64,
) -> LosFit {
    let grid_dm_min = posterior.stack().grid().min(MU_AXIS);
    let grid_dm_max = posterior.stack().grid().max(MU_AXIS);
    let ndim = posterior.dim();

    if posterior.stack().is_empty() {
        info!("empty image stack; writing empty chain");
        return LosFit {
            samples: Array2::zeros((0, ndim)),
            gelman_rubin: vec![f64::NAN; ndim],
            converged: false,
            dm_min: grid_dm_min,
            dm_max: grid_dm_max,
        };
    }

    // Seed the main run from a short diffuse fit.
    let guess = guess_profile(posterior, options, seed ^ 0x9e37_79b9);
    debug!("profile guess: {guess:?}");
    posterior.set_guess(guess, Some(guess_covariance_sqrt(ndim, 1.0)));

    let max_attempts = 2usize;
    let n_steps = options.steps;
    let n_walkers = (options.samplers * ndim).max(4);
    let capacity = 16 * n_steps.max(1) * n_walkers;
    let mut sampler =
        ParallelEnsemble::new(&*posterior, n_walkers, options.n_runs.max(1), capacity, seed);

    // Burn-in round 1: Metropolis warm-up, then stretch tuning.
    let base = (n_steps as f64 / 20.).ceil() as usize;
    sampler.set_sigma_min(1e-5);
    sampler.set_scale(1.1);
    sampler.set_replacement_bandwidth(0.25);
    sampler.set_mh_bandwidth(0.15);

    sampler.tune_mh(8, 0.25);
    sampler.step_mh(base, false);
    sampler.tune_mh(8, 0.25);
    sampler.step_mh(base, false);
    sampler.tune_stretch(5, 0.30);
    sampler.step(2 * base, false, options.p_replacement);
    sampler.step(base, false, 1.);

    // Round 2: custom reversible sweeps with a replacement bias.
    sampler.set_replacement_accept_bias(1e-2);
    sampler.tune_stretch(8, 0.30);
    sampler.step(2 * base, false, options.p_replacement);
    sampler.step_custom(base, ReversibleMove::SwapAdjacent, false);
    sampler.step_custom(base, ReversibleMove::Mix, false);
    sampler.step_custom(base, ReversibleMove::StepOne, false);
    sampler.step(base, false, 1.);

    // Round 3.
    sampler.tune_stretch(8, 0.30);
    sampler.step(2 * base, false, options.p_replacement);
    sampler.step_custom(base, ReversibleMove::SwapAdjacent, false);
    sampler.step_custom(base, ReversibleMove::Mix, false);
    sampler.step_custom(base, ReversibleMove::StepOne, false);

    // Round 4: bias off.
    sampler.set_replacement_accept_bias(0.);
    sampler.tune_stretch(8, 0.30);
    sampler.step(2 * base, false, options.p_replacement);
    sampler.step_custom(2 * base, ReversibleMove::SwapAdjacent, false);
    sampler.step_custom(base, ReversibleMove::StepOne, false);

    sampler.clear();

    // Convergence only matters out to MAX_CONV_MU.
    let delta_dm = (grid_dm_max - grid_dm_min) / (ndim - 1).max(1) as f64;
    let max_conv_idx = (((MAX_CONV_MU - grid_dm_min) / delta_dm).ceil() as usize).min(ndim);

    let mut converged = false;
    let mut gr = vec![f64::NAN; ndim];
    for attempt in 0..max_attempts {
        let base = (((1usize << attempt) * n_steps) as f64 / 15.).ceil() as usize;

        for _ in 0..3 {
            sampler.step(2 * base, true, options.p_replacement);
            sampler.step_custom(2 * base, ReversibleMove::SwapAdjacent, true);
            sampler.step_custom(base, ReversibleMove::StepOne, true);
        }

        gr = sampler.gelman_rubin(&CumulativeReddening);
        debug!("transformed G-R: {gr:?}");

        converged = gr[..max_conv_idx].iter().all(|&r| r <= GR_THRESHOLD);
        if converged {
            break;
        }
        if attempt + 1 < max_attempts {
            info!("not converged; extending run");
            sampler.step(3 * base, false, 1.);
            sampler.step_custom(base, ReversibleMove::SwapAdjacent, true);
            sampler.clear();
        }
    }

    let merged = sampler.merged_chain();
    LosFit {
        samples: subsample(&merged, n_save),
        gelman_rubin: gr,
        converged,
        dm_min: grid_dm_min,
        dm_max: grid_dm_max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RectGrid;
    use ndarray::Array2 as NdArray2;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn flat_stack(n_stars: usize, n_e: usize, n_mu: usize, value: f64) -> ImageStack {
        let grid = RectGrid::new([0., 4.], [n_e as f64 * 0.02, 19.], [n_e, n_mu]).unwrap();
        let images = (0..n_stars)
            .map(|_| NdArray2::from_elem((n_e, n_mu), value))
            .collect();
        ImageStack::new(images, grid).unwrap()
    }

    #[test]
    fn rejects_indivisible_region_count() {
        let stack = flat_stack(1, 50, 20, 1e-4);
        assert!(matches!(
            LosPosterior::new(&stack, 7, &[0.], 1e-5, None),
            Err(StackError::IndivisibleRegions { .. })
        ));
    }

    #[test]
    fn out_of_range_profile_is_rejected() {
        let stack = flat_stack(1, 50, 20, 1e-4);
        let posterior = LosPosterior::new(&stack, 4, &[0.], 1e-5, None).unwrap();
        let mut ws = posterior.workspace();
        // Total reddening far beyond the grid top.
        let x = vec![1.0f64; 5];
        assert_eq!(posterior.log_prob(&x, &mut ws), f64::NEG_INFINITY);
    }

    #[test]
    fn likelihood_softening_is_continuous_at_crossover() {
        let stack = flat_stack(1, 50, 20, 1e-4);
        // Choose ln Z so that the flat-image line integral sits right
        // at the p0/Z crossover, then verify both branches agree.
        let li: f64 = 20. * 1e-4;
        let ln_z = (1e-5f64).ln() - li.ln();
        let posterior = LosPosterior::new(&stack, 4, &[ln_z], 1e-5, None).unwrap();
        let mut ws = posterior.workspace();
        let x = vec![-6.0f64; 5];
        let lnp = posterior.log_prob(&x, &mut ws);
        assert!(lnp.is_finite());
    }

    #[test]
    fn guess_covariance_sqrt_squares_back() {
        let n = 6;
        let sqrt = guess_covariance_sqrt(n, 1.0);
        let prod = &sqrt * sqrt.transpose();
        // Diagonal should be close to the clipped covariance diagonal.
        for i in 0..n {
            assert!((prod[(i, i)] - 1.).abs() < 0.5, "diag {}", prod[(i, i)]);
        }
    }

    #[test]
    fn diffuse_draws_respect_reddening_ceiling() {
        let stack = flat_stack(2, 50, 20, 1e-4);
        let posterior = LosPosterior::new(&stack, 4, &[0., 0.], 1e-5, None).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut x = vec![0.; 5];
        let ceil = stack.grid().max(E_AXIS);
        for _ in 0..200 {
            posterior.draw_initial(&mut rng, &mut x);
            let total: f64 = x.iter().map(|v| v.exp()).sum();
            assert!(total < ceil, "total {total} >= ceiling {ceil}");
        }
    }

    #[test]
    fn flat_image_posterior_recovers_uniform_reddening() {
        // Scenario: single star, flat image. The likelihood is then
        // indifferent, so the posterior follows the fallback prior and
        // the cumulative profile must stay within the grid.
        let stack = flat_stack(1, 50, 20, 1e-4);
        let mut posterior = LosPosterior::new(&stack, 4, &[0.], 1e-5, Some(0.3)).unwrap();
        let options = McmcOptions {
            steps: 200,
            samplers: 3,
            p_replacement: 0.2,
            n_runs: 2,
        };
        let fit = sample_los_extinction(&mut posterior, &options, 100, 99);
        assert!(fit.samples.nrows() > 0);
        for row in fit.samples.rows() {
            let total: f64 = row.iter().map(|v| v.exp()).sum();
            assert!(total < stack.grid().max(E_AXIS));
        }
    }
}
