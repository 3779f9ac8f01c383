//! Discrete-cloud line-of-sight model: a handful of thin clouds, each
//! with a distance gap and a reddening depth.
//!
//! The parameter vector is `[delta_mu_1.., log_delta_ebv_1..]`. The
//! cumulative reddening is a staircase, so the line integral reduces
//! to a single piecewise-constant sweep.

use log::{debug, info};
use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::chain::CloudTransform;
use crate::ensemble::{LogProbFn, ParallelEnsemble};
use crate::error::StackError;
use crate::grid::{E_AXIS, MU_AXIS};
use crate::line_integral::clouds_sweep;
use crate::settings::McmcOptions;
use crate::stack::ImageStack;

const GR_THRESHOLD: f64 = 1.25;

/// Posterior over `n_clouds` thin clouds.
pub struct CloudsPosterior<'a> {
    stack: &'a ImageStack,
    n_clouds: usize,
    subpixel: Vec<f64>,
    subpixel_max: f64,
    p0_over_z: Vec<f64>,
    ln_p0_over_z: Vec<f64>,
    inv_p0_over_z: Vec<f64>,
    ebv_max: Option<f64>,
    guess_max: f64,
}

pub struct CloudsWorkspace {
    line_int: Vec<f64>,
}

impl<'a> CloudsPosterior<'a> {
    pub fn new(
        stack: &'a ImageStack,
        n_clouds: usize,
        ln_z: &[f64],
        p0: f64,
        ebv_max: Option<f64>,
    ) -> Result<Self, StackError> {
        if n_clouds == 0 {
            return Err(StackError::IndivisibleRegions {
                n_mu: stack.grid().n_mu(),
                n_regions: 0,
            });
        }
        assert_eq!(ln_z.len(), stack.n_stars());

        let ln_p0 = p0.ln();
        let ln_p0_over_z: Vec<f64> = ln_z.iter().map(|&z| ln_p0 - z).collect();

        Ok(CloudsPosterior {
            guess_max: stack.guess_max_reddening(),
            stack,
            n_clouds,
            subpixel: vec![1.; stack.n_stars()],
            subpixel_max: 1.,
            p0_over_z: ln_p0_over_z.iter().map(|&v| v.exp()).collect(),
            inv_p0_over_z: ln_p0_over_z.iter().map(|&v| (-v).exp()).collect(),
            ln_p0_over_z,
            ebv_max,
        })
    }

    pub fn set_subpixel(&mut self, subpixel: &[f64]) {
        assert_eq!(subpixel.len(), self.stack.n_stars());
        self.subpixel = subpixel.to_vec();
        self.subpixel_max = subpixel.iter().copied().fold(0., f64::max);
    }

    pub fn n_clouds(&self) -> usize {
        self.n_clouds
    }

    pub fn stack(&self) -> &ImageStack {
        self.stack
    }
}

impl<'a> LogProbFn for CloudsPosterior<'a> {
    type Workspace = CloudsWorkspace;

    fn dim(&self) -> usize {
        2 * self.n_clouds
    }

    fn workspace(&self) -> CloudsWorkspace {
        CloudsWorkspace {
            line_int: vec![0.; self.stack.n_stars()],
        }
    }

    fn log_prob(&self, x: &[f64], ws: &mut CloudsWorkspace) -> f64 {
        let grid = self.stack.grid();
        let n_clouds = self.n_clouds;
        let (delta_mu, log_delta_ebv) = x.split_at(n_clouds);

        let mut lnp = 0.;

        // Clouds are ordered by construction: every gap must be
        // positive and the first cloud must sit inside the grid.
        let mut mu_tot = 0.;
        for &dm in delta_mu {
            if dm <= 0. {
                return f64::NEG_INFINITY;
            }
            mu_tot += dm;
        }
        if delta_mu[0] < grid.min(MU_AXIS) {
            return f64::NEG_INFINITY;
        }
        let mu_tot_idx =
            ((mu_tot * self.subpixel_max - grid.min(MU_AXIS)) / grid.step(MU_AXIS)).ceil();
        if mu_tot_idx + 1. >= grid.n_mu() as f64 {
            return f64::NEG_INFINITY;
        }

        let bias = -5.;
        let sigma = 5.;
        let mut ebv_tot = 0.;
        for &le in log_delta_ebv {
            let de = le.exp();
            ebv_tot += de;
            // Quadratic pull against very deep individual clouds.
            lnp -= 0.5 * de * de / (2. * 2.);
            lnp -= (le - bias) * (le - bias) / (2. * sigma * sigma);
        }

        let ebv_tot_idx =
            ((ebv_tot * self.subpixel_max - grid.min(E_AXIS)) / grid.step(E_AXIS)).ceil();
        if ebv_tot_idx + 1. >= grid.n_e() as f64 {
            return f64::NEG_INFINITY;
        }

        if let Some(ebv_max) = self.ebv_max {
            if ebv_tot > ebv_max {
                let over = ebv_tot - ebv_max;
                lnp -= over * over / (2. * 0.20 * 0.20 * ebv_max * ebv_max);
            }
        }

        // Repulsion keeps clouds from coalescing.
        for &dm in &delta_mu[1..] {
            lnp -= 1. / dm;
        }

        clouds_sweep(
            self.stack,
            &self.subpixel,
            delta_mu,
            log_delta_ebv,
            &mut ws.line_int,
        );

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
        let grid = self.stack.grid();
        let mu_floor = grid.min(MU_AXIS);
        let mu_ceil = grid.max(MU_AXIS);
        let ebv_ceil = grid.max(E_AXIS) / self.subpixel_max;
        let n_clouds = self.n_clouds;

        let log_ebv_mean =
            (1.5 * self.guess_max / self.subpixel_max / n_clouds as f64).ln();
        let mu_mean = (mu_ceil - mu_floor) / n_clouds as f64;
        let log_mu_mean = (0.5 * mu_mean).ln();

        let mut ebv_sum = 0.;
        let mut mu_sum = mu_floor;

        for i in 0..n_clouds {
            let eps: f64 = rng.sample(StandardNormal);
            out[n_clouds + i] = log_ebv_mean + 1.5 * eps;
            ebv_sum += out[n_clouds + i].exp();

            let eps: f64 = rng.sample(StandardNormal);
            out[i] = (log_mu_mean + 1.5 * eps).exp();
            mu_sum += out[i];
        }
        out[0] += mu_floor;

        if ebv_sum >= 0.95 * ebv_ceil {
            let factor = (0.95 * ebv_ceil / ebv_sum).ln();
            for v in &mut out[n_clouds..] {
                *v += factor;
            }
        }

        if mu_sum >= 0.95 * mu_ceil {
            let factor = 0.95 * mu_ceil / mu_sum;
            for v in &mut out[..n_clouds] {
                *v *= factor;
            }
        }
    }
}

/// Result of one cloud-model fit.
#[derive(Debug, Clone)]
pub struct CloudsFit {
    /// Saved states, one row per state, `2 * n_clouds` wide in
    /// `(delta_mu.., log_delta_ebv..)` order.
    pub samples: Array2<f64>,
    pub gelman_rubin: Vec<f64>,
    pub converged: bool,
    pub dm_min: f64,
    pub dm_max: f64,
}

/// Sample the cloud model: five burn-in phases with one stretch-tuning
/// pass, then a Gelman-Rubin-checked main run with doubling extension.
pub fn sample_los_extinction_clouds(
    posterior: &CloudsPosterior,
    options: &McmcOptions,
    n_save: usize,
    seed: u64,
) -> CloudsFit {
    let ndim = 2 * posterior.n_clouds();
    let dm_min = posterior.stack().grid().min(MU_AXIS);
    let dm_max = posterior.stack().grid().max(MU_AXIS);

    if posterior.stack().is_empty() {
        info!("empty image stack; writing empty chain");
        return CloudsFit {
            samples: Array2::zeros((0, ndim)),
            gelman_rubin: vec![f64::NAN; ndim],
            converged: false,
            dm_min,
            dm_max,
        };
    }

    let max_attempts = 2usize;
    let n_steps = options.steps;
    let n_walkers = (options.samplers * ndim).max(4);
    let capacity = 8 * n_steps.max(1) * n_walkers;
    let mut sampler =
        ParallelEnsemble::new(posterior, n_walkers, options.n_runs.max(1), capacity, seed);

    sampler.set_sigma_min(1e-5);
    sampler.set_scale(2.);
    sampler.set_replacement_bandwidth(0.35);

    // Burn-in.
    sampler.step(n_steps * 25 / 100, false, 0.);
    sampler.step(n_steps * 20 / 100, false, options.p_replacement);
    sampler.step(n_steps * 20 / 100, false, 0.85);
    sampler.step(n_steps * 20 / 100, false, options.p_replacement);
    sampler.tune_stretch(5, 0.40);
    sampler.step(n_steps * 20 / 100, false, 0.85);
    sampler.log_diagnostics();
    sampler.clear();

    // Main phase.
    let transform = CloudTransform {
        n_clouds: posterior.n_clouds(),
    };
    let mut converged = false;
    let mut gr = vec![f64::NAN; ndim];
    for attempt in 0..max_attempts {
        sampler.tune_stretch(8, 0.40);
        sampler.step((1usize << attempt) * n_steps, true, options.p_replacement);

        gr = sampler.gelman_rubin(&transform);
        debug!("transformed G-R: {gr:?}");

        converged = gr.iter().all(|&r| r <= GR_THRESHOLD);
        if converged {
            break;
        }
        if attempt + 1 < max_attempts {
            info!("not converged; extending run");
            sampler.step(n_steps / 5, false, 1.);
            sampler.clear();
        }
    }

    let merged = sampler.merged_chain();
    let n = merged.len();
    let n_save = n_save.min(n);
    let mut samples = Array2::zeros((n_save, ndim));
    for i in 0..n_save {
        let src = i * n / n_save.max(1);
        samples
            .row_mut(i)
            .assign(&ndarray::ArrayView1::from(merged.coords(src)));
    }

    CloudsFit {
        samples,
        gelman_rubin: gr,
        converged,
        dm_min,
        dm_max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RectGrid;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    /// Two delta-ridges: E jumps to 0.3 at mu = 10 and to 0.7 at
    /// mu = 14, smeared by a narrow Gaussian.
    fn two_cloud_stack(n_stars: usize) -> ImageStack {
        let grid = RectGrid::new([0., 4.], [1.4, 19.], [70, 60]).unwrap();
        let mut images = Vec::new();
        for _ in 0..n_stars {
            let mut img = ndarray::Array2::zeros((70, 60));
            for m in 0..60 {
                let mu = grid.bin_center(MU_AXIS, m);
                let e_true = if mu < 10. {
                    0.0
                } else if mu < 14. {
                    0.3
                } else {
                    0.7
                };
                for e in 0..70 {
                    let ev = grid.bin_center(E_AXIS, e);
                    let z = (ev - e_true) / 0.05;
                    img[(e, m)] = (-0.5 * z * z).exp();
                }
            }
            let sum: f64 = img.iter().sum();
            img.mapv_inplace(|v| v / sum);
            images.push(img);
        }
        ImageStack::new(images, grid).unwrap()
    }

    #[test]
    fn negative_gaps_are_outside_support() {
        let stack = two_cloud_stack(1);
        let posterior = CloudsPosterior::new(&stack, 2, &[0.], 1e-5, None).unwrap();
        let mut ws = posterior.workspace();
        let x = vec![10., -1., -1.2, -0.9];
        assert_eq!(posterior.log_prob(&x, &mut ws), f64::NEG_INFINITY);
    }

    #[test]
    fn true_cloud_configuration_beats_perturbations() {
        let stack = two_cloud_stack(4);
        let posterior = CloudsPosterior::new(&stack, 2, &[0.; 4], 1e-5, None).unwrap();
        let mut ws = posterior.workspace();

        let truth = vec![10., 4., (0.3f64).ln(), (0.4f64).ln()];
        let lnp_truth = posterior.log_prob(&truth, &mut ws);

        for shift in [
            vec![8., 4., (0.3f64).ln(), (0.4f64).ln()],
            vec![10., 6., (0.3f64).ln(), (0.4f64).ln()],
            vec![10., 4., (0.6f64).ln(), (0.4f64).ln()],
        ] {
            let lnp = posterior.log_prob(&shift, &mut ws);
            assert!(
                lnp_truth > lnp,
                "truth {lnp_truth} not preferred over {shift:?} ({lnp})"
            );
        }
    }

    #[test]
    fn initial_draws_stay_in_support_often_enough(){
        let stack = two_cloud_stack(1);
        let posterior = CloudsPosterior::new(&stack, 2, &[0.], 1e-5, None).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let mut ws = posterior.workspace();
        let mut x = vec![0.; 4];
        let mut finite = 0;
        for _ in 0..200 {
            posterior.draw_initial(&mut rng, &mut x);
            if posterior.log_prob(&x, &mut ws).is_finite() {
                finite += 1;
            }
        }
        assert!(finite > 50, "only {finite}/200 draws inside support");
    }

    #[test]
    fn recovers_two_cloud_synthetic() {
        let stack = two_cloud_stack(6);
        let posterior = CloudsPosterior::new(&stack, 2, &[0.; 6], 1e-5, None).unwrap();
        let options = McmcOptions {
            steps: 400,
            samplers: 4,
            p_replacement: 0.2,
            n_runs: 2,
        };
        let fit = sample_los_extinction_clouds(&posterior, &options, 100, 5);
        assert!(fit.samples.nrows() > 0);

        // Posterior means of (delta_mu_1, delta_mu_2, dE_1, dE_2)
        // should land within a few grid bins of the truth.
        let n = fit.samples.nrows() as f64;
        let mut mean = vec![0.; 4];
        for row in fit.samples.rows() {
            for (m, &v) in mean.iter_mut().zip(row.iter()) {
                *m += v / n;
            }
        }
        assert!((mean[0] - 10.).abs() < 1.0, "delta_mu_1 mean {}", mean[0]);
        assert!((mean[1] - 4.).abs() < 1.5, "delta_mu_2 mean {}", mean[1]);
        assert!((mean[2].exp() - 0.3).abs() < 0.1, "dE_1 mean {}", mean[2].exp());
        assert!((mean[3].exp() - 0.4).abs() < 0.15, "dE_2 mean {}", mean[3].exp());
    }
}
