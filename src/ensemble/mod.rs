//! Goodman-Weare affine-invariant ensemble sampler.
//!
//! An ensemble of walkers explores the target with stretch moves,
//! kernel-density "replacement" moves, an isotropic Metropolis-Hastings
//! mode and the custom reversible moves of [`moves::ReversibleMove`].
//! Several independent walker groups ("runs") are advanced in parallel
//! so that a transformed Gelman-Rubin diagnostic can compare them.

pub mod moves;

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::chain::{gelman_rubin_transformed, Chain, ParamTransform};
use crate::math::logsumexp;
pub use moves::ReversibleMove;

/// A log-density that the ensemble can sample from.
///
/// Evaluations receive an exclusive workspace so that walkers can be
/// evaluated in parallel without shared scratch; the workspace is where
/// implementations keep their per-star line-integral buffers.
pub trait LogProbFn: Sync {
    type Workspace: Send;

    fn dim(&self) -> usize;

    fn workspace(&self) -> Self::Workspace;

    fn log_prob(&self, x: &[f64], ws: &mut Self::Workspace) -> f64;

    /// Draw an initial walker position.
    fn draw_initial<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]);
}

#[derive(Debug, Clone, Copy, Default)]
struct AcceptCounter {
    accepted: u64,
    proposed: u64,
}

impl AcceptCounter {
    fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MoveStats {
    stretch: AcceptCounter,
    replacement: AcceptCounter,
    mh: AcceptCounter,
    custom: AcceptCounter,
}

struct Walker {
    x: Vec<f64>,
    log_p: f64,
    /// Stretch scale `a`; tuned per walker.
    scale: f64,
    mh_bandwidth: f64,
    window: AcceptCounter,
}

enum Pending {
    Stretch { y: Vec<f64>, ln_z_term: f64 },
    Replacement { y: Vec<f64> },
    Mh { y: Vec<f64> },
    Custom { y: Vec<f64>, ln_hastings: f64 },
}

impl Pending {
    fn proposal(&self) -> &[f64] {
        match self {
            Pending::Stretch { y, .. }
            | Pending::Replacement { y }
            | Pending::Mh { y }
            | Pending::Custom { y, .. } => y,
        }
    }
}

/// One ensemble of walkers over a single target.
pub struct EnsembleSampler<'a, F: LogProbFn> {
    target: &'a F,
    dim: usize,
    walkers: Vec<Walker>,
    workspaces: Vec<F::Workspace>,
    rng: SmallRng,
    chain: Chain,
    stats: MoveStats,
    replacement_bandwidth: f64,
    sigma_min: f64,
    replacement_accept_bias: f64,
}

impl<'a, F: LogProbFn> EnsembleSampler<'a, F> {
    pub fn new(target: &'a F, n_walkers: usize, chain_capacity: usize, seed: u64) -> Self {
        assert!(n_walkers >= 4, "ensemble needs at least 4 walkers");
        let dim = target.dim();
        let mut rng = SmallRng::seed_from_u64(seed);

        let mut walkers = Vec::with_capacity(n_walkers);
        let mut workspaces = Vec::with_capacity(n_walkers);
        for _ in 0..n_walkers {
            let mut ws = target.workspace();
            let mut x = vec![0.; dim];
            let mut log_p = f64::NEG_INFINITY;
            // A fresh draw can land outside the support; retry a few
            // times before giving up and letting burn-in recover.
            for _ in 0..100 {
                target.draw_initial(&mut rng, &mut x);
                log_p = target.log_prob(&x, &mut ws);
                if log_p.is_finite() {
                    break;
                }
            }
            walkers.push(Walker {
                x,
                log_p,
                scale: 2.,
                mh_bandwidth: 0.25,
                window: AcceptCounter::default(),
            });
            workspaces.push(ws);
        }

        EnsembleSampler {
            target,
            dim,
            walkers,
            workspaces,
            rng,
            chain: Chain::new(dim, chain_capacity),
            stats: MoveStats::default(),
            replacement_bandwidth: 0.25,
            sigma_min: 1e-5,
            replacement_accept_bias: 0.,
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn n_walkers(&self) -> usize {
        self.walkers.len()
    }

    pub fn set_scale(&mut self, scale: f64) {
        for w in &mut self.walkers {
            w.scale = scale;
        }
    }

    pub fn set_mh_bandwidth(&mut self, bw: f64) {
        for w in &mut self.walkers {
            w.mh_bandwidth = bw;
        }
    }

    pub fn set_replacement_bandwidth(&mut self, bw: f64) {
        self.replacement_bandwidth = bw;
    }

    pub fn set_sigma_min(&mut self, sigma_min: f64) {
        self.sigma_min = sigma_min;
    }

    pub fn set_replacement_accept_bias(&mut self, bias: f64) {
        self.replacement_accept_bias = bias;
    }

    pub fn clear(&mut self) {
        self.chain.clear();
        self.stats = MoveStats::default();
    }

    /// Advance the ensemble `n_steps` sweeps with stretch moves,
    /// replacing the stretch proposal by a kernel-density replacement
    /// proposal with probability `p_replacement` per walker.
    pub fn step(&mut self, n_steps: usize, record: bool, p_replacement: f64) {
        for _ in 0..n_steps {
            self.sweep_halves(p_replacement);
            if record {
                self.record_all();
            }
        }
    }

    /// Advance `n_steps` isotropic Metropolis-Hastings sweeps.
    pub fn step_mh(&mut self, n_steps: usize, record: bool) {
        let n = self.walkers.len();
        for _ in 0..n_steps {
            let mut pending = Vec::with_capacity(n);
            for i in 0..n {
                let bw = self.walkers[i].mh_bandwidth;
                let mut y = self.walkers[i].x.clone();
                for v in &mut y {
                    let eps: f64 = self.rng.sample(StandardNormal);
                    *v += bw * eps;
                }
                pending.push(Pending::Mh { y });
            }
            self.resolve(0, n, pending);
            if record {
                self.record_all();
            }
        }
    }

    /// Advance `n_steps` sweeps of one custom reversible move.
    pub fn step_custom(&mut self, n_steps: usize, mv: ReversibleMove, record: bool) {
        let n = self.walkers.len();
        for _ in 0..n_steps {
            let mut pending = Vec::with_capacity(n);
            for i in 0..n {
                let mut y = vec![0.; self.dim];
                let ln_hastings = mv.propose(&self.walkers[i].x, &mut y, &mut self.rng);
                pending.push(Pending::Custom { y, ln_hastings });
            }
            self.resolve(0, n, pending);
            if record {
                self.record_all();
            }
        }
    }

    /// Auto-tune the per-walker stretch scale toward an acceptance
    /// target, over `rounds` probe windows of ten sweeps each.
    pub fn tune_stretch(&mut self, rounds: usize, target: f64) {
        for _ in 0..rounds {
            for w in &mut self.walkers {
                w.window = AcceptCounter::default();
            }
            for _ in 0..10 {
                self.sweep_halves(0.);
            }
            for w in &mut self.walkers {
                let rate = w.window.rate();
                let ratio = if target > 0. { (rate / target).clamp(0.5, 2.) } else { 1. };
                w.scale = (1. + (w.scale - 1.) * ratio).clamp(1.01, 100.);
            }
        }
    }

    /// Auto-tune the Metropolis-Hastings bandwidth toward an acceptance
    /// target.
    pub fn tune_mh(&mut self, rounds: usize, target: f64) {
        for _ in 0..rounds {
            for w in &mut self.walkers {
                w.window = AcceptCounter::default();
            }
            self.step_mh(10, false);
            for w in &mut self.walkers {
                let rate = w.window.rate();
                let ratio = if target > 0. { (rate / target).clamp(0.5, 2.) } else { 1. };
                w.mh_bandwidth = (w.mh_bandwidth * ratio).clamp(1e-6, 1e3);
            }
        }
    }

    pub fn stretch_acceptance(&self) -> f64 {
        self.stats.stretch.rate()
    }

    pub fn mh_acceptance(&self) -> f64 {
        self.stats.mh.rate()
    }

    pub fn custom_acceptance(&self) -> f64 {
        self.stats.custom.rate()
    }

    pub fn replacement_acceptance(&self) -> f64 {
        self.stats.replacement.rate()
    }

    fn record_all(&mut self) {
        for w in &self.walkers {
            self.chain.push(&w.x, w.log_p, 0., 1.);
        }
    }

    /// One Goodman-Weare sweep: update each half of the ensemble
    /// conditioned on the current state of the other half.
    fn sweep_halves(&mut self, p_replacement: f64) {
        let n = self.walkers.len();
        let mid = n / 2;
        self.sweep_half(0, mid, mid, n, p_replacement);
        self.sweep_half(mid, n, 0, mid, p_replacement);
    }

    fn sweep_half(
        &mut self,
        lo: usize,
        hi: usize,
        comp_lo: usize,
        comp_hi: usize,
        p_replacement: f64,
    ) {
        let dim = self.dim;
        let comp_sigma = self.complement_sigma(comp_lo, comp_hi);

        let mut pending = Vec::with_capacity(hi - lo);
        for i in lo..hi {
            let use_replacement = p_replacement > 0. && self.rng.gen::<f64>() < p_replacement;
            if use_replacement {
                let c = self.rng.gen_range(comp_lo..comp_hi);
                let mut y = vec![0.; dim];
                for d in 0..dim {
                    let eps: f64 = self.rng.sample(StandardNormal);
                    y[d] = self.walkers[c].x[d]
                        + self.replacement_bandwidth * comp_sigma[d] * eps;
                }
                pending.push(Pending::Replacement { y });
            } else {
                let c = self.rng.gen_range(comp_lo..comp_hi);
                let a = self.walkers[i].scale;
                let u: f64 = self.rng.gen();
                let z = ((a - 1.) * u + 1.).powi(2) / a;
                let mut y = vec![0.; dim];
                for d in 0..dim {
                    y[d] = self.walkers[c].x[d]
                        + z * (self.walkers[i].x[d] - self.walkers[c].x[d]);
                }
                pending.push(Pending::Stretch {
                    y,
                    ln_z_term: (dim as f64 - 1.) * z.ln(),
                });
            }
        }

        self.resolve_with_kde(lo, hi, comp_lo, comp_hi, &comp_sigma, pending);
    }

    /// Per-dimension standard deviation of the complementary half,
    /// floored at `sigma_min`; the KDE bandwidth scales with it.
    fn complement_sigma(&self, comp_lo: usize, comp_hi: usize) -> Vec<f64> {
        let n = (comp_hi - comp_lo) as f64;
        let mut mean = vec![0.; self.dim];
        for w in &self.walkers[comp_lo..comp_hi] {
            for (m, &v) in mean.iter_mut().zip(&w.x) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }
        let mut var = vec![0.; self.dim];
        for w in &self.walkers[comp_lo..comp_hi] {
            for (s, (&v, &m)) in var.iter_mut().zip(w.x.iter().zip(&mean)) {
                *s += (v - m) * (v - m);
            }
        }
        var.iter()
            .map(|&s| (s / n).sqrt().max(self.sigma_min))
            .collect()
    }

    /// Log-density of the replacement mixture centered on the
    /// complementary half, evaluated at `point`.
    fn kde_log_density(
        &self,
        point: &[f64],
        comp_lo: usize,
        comp_hi: usize,
        sigma: &[f64],
    ) -> f64 {
        let h = self.replacement_bandwidth;
        let mut terms = Vec::with_capacity(comp_hi - comp_lo);
        let ln_norm: f64 = sigma
            .iter()
            .map(|&s| (h * s * (2. * std::f64::consts::PI).sqrt()).ln())
            .sum();
        for w in &self.walkers[comp_lo..comp_hi] {
            let mut chi2 = 0.;
            for d in 0..self.dim {
                let z = (point[d] - w.x[d]) / (h * sigma[d]);
                chi2 += z * z;
            }
            terms.push(-0.5 * chi2 - ln_norm);
        }
        logsumexp(&terms) - ((comp_hi - comp_lo) as f64).ln()
    }

    fn evaluate(&mut self, lo: usize, hi: usize, pending: &[Pending]) -> Vec<f64> {
        let target = self.target;
        pending
            .par_iter()
            .zip(self.workspaces[lo..hi].par_iter_mut())
            .map(|(p, ws)| target.log_prob(p.proposal(), ws))
            .collect()
    }

    /// Evaluate proposals in parallel, then accept or reject serially.
    fn resolve(&mut self, lo: usize, hi: usize, pending: Vec<Pending>) {
        let sigma = vec![0.; 0];
        self.resolve_with_kde(lo, hi, 0, 0, &sigma, pending);
    }

    fn resolve_with_kde(
        &mut self,
        lo: usize,
        hi: usize,
        comp_lo: usize,
        comp_hi: usize,
        comp_sigma: &[f64],
        pending: Vec<Pending>,
    ) {
        let log_probs = self.evaluate(lo, hi, &pending);

        for (offset, (p, lp_new)) in pending.into_iter().zip(log_probs).enumerate() {
            let i = lo + offset;
            let lp_old = self.walkers[i].log_p;

            let (ln_accept, counter): (f64, fn(&mut MoveStats) -> &mut AcceptCounter) = match &p {
                Pending::Stretch { ln_z_term, .. } => {
                    (ln_z_term + lp_new - lp_old, |s| &mut s.stretch)
                }
                Pending::Replacement { y } => {
                    let ln_q_y = self.kde_log_density(y, comp_lo, comp_hi, comp_sigma);
                    let ln_q_x =
                        self.kde_log_density(&self.walkers[i].x, comp_lo, comp_hi, comp_sigma);
                    (
                        lp_new - lp_old + ln_q_x - ln_q_y + self.replacement_accept_bias,
                        |s| &mut s.replacement,
                    )
                }
                Pending::Mh { .. } => (lp_new - lp_old, |s| &mut s.mh),
                Pending::Custom { ln_hastings, .. } => {
                    (lp_new - lp_old + ln_hastings, |s| &mut s.custom)
                }
            };

            let accept = lp_new.is_finite()
                && (ln_accept >= 0. || self.rng.gen::<f64>() < ln_accept.exp());

            let stats = counter(&mut self.stats);
            stats.proposed += 1;
            self.walkers[i].window.proposed += 1;
            if accept {
                stats.accepted += 1;
                self.walkers[i].window.accepted += 1;
                let y = match p {
                    Pending::Stretch { y, .. }
                    | Pending::Replacement { y }
                    | Pending::Mh { y }
                    | Pending::Custom { y, .. } => y,
                };
                self.walkers[i].x = y;
                self.walkers[i].log_p = lp_new;
            }
        }
    }
}

/// Several independent ensembles advanced in lockstep.
///
/// The runs never exchange walkers; they exist so that the
/// Gelman-Rubin diagnostic has independent chains to compare.
pub struct ParallelEnsemble<'a, F: LogProbFn> {
    runs: Vec<EnsembleSampler<'a, F>>,
}

impl<'a, F: LogProbFn> ParallelEnsemble<'a, F>
where
    F::Workspace: Send,
{
    pub fn new(
        target: &'a F,
        n_walkers_per_run: usize,
        n_runs: usize,
        chain_capacity: usize,
        seed: u64,
    ) -> Self {
        assert!(n_runs >= 1);
        let runs = (0..n_runs)
            .map(|r| {
                EnsembleSampler::new(
                    target,
                    n_walkers_per_run,
                    chain_capacity,
                    seed.wrapping_add(r as u64),
                )
            })
            .collect();
        ParallelEnsemble { runs }
    }

    pub fn n_runs(&self) -> usize {
        self.runs.len()
    }

    fn for_each_run(&mut self, f: impl Fn(&mut EnsembleSampler<'a, F>) + Sync + Send)
    where
        EnsembleSampler<'a, F>: Send,
    {
        self.runs.par_iter_mut().for_each(f);
    }

    pub fn step(&mut self, n_steps: usize, record: bool, p_replacement: f64)
    where
        EnsembleSampler<'a, F>: Send,
    {
        self.for_each_run(|r| r.step(n_steps, record, p_replacement));
    }

    pub fn step_mh(&mut self, n_steps: usize, record: bool)
    where
        EnsembleSampler<'a, F>: Send,
    {
        self.for_each_run(|r| r.step_mh(n_steps, record));
    }

    pub fn step_custom(&mut self, n_steps: usize, mv: ReversibleMove, record: bool)
    where
        EnsembleSampler<'a, F>: Send,
    {
        self.for_each_run(move |r| r.step_custom(n_steps, mv, record));
    }

    pub fn tune_stretch(&mut self, rounds: usize, target: f64)
    where
        EnsembleSampler<'a, F>: Send,
    {
        self.for_each_run(|r| r.tune_stretch(rounds, target));
    }

    pub fn tune_mh(&mut self, rounds: usize, target: f64)
    where
        EnsembleSampler<'a, F>: Send,
    {
        self.for_each_run(|r| r.tune_mh(rounds, target));
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.runs.iter_mut().for_each(|r| r.set_scale(scale));
    }

    pub fn set_mh_bandwidth(&mut self, bw: f64) {
        self.runs.iter_mut().for_each(|r| r.set_mh_bandwidth(bw));
    }

    pub fn set_replacement_bandwidth(&mut self, bw: f64) {
        self.runs
            .iter_mut()
            .for_each(|r| r.set_replacement_bandwidth(bw));
    }

    pub fn set_sigma_min(&mut self, sigma_min: f64) {
        self.runs.iter_mut().for_each(|r| r.set_sigma_min(sigma_min));
    }

    pub fn set_replacement_accept_bias(&mut self, bias: f64) {
        self.runs
            .iter_mut()
            .for_each(|r| r.set_replacement_accept_bias(bias));
    }

    pub fn clear(&mut self) {
        self.runs.iter_mut().for_each(|r| r.clear());
    }

    /// Gelman-Rubin statistic across runs on transformed coordinates.
    pub fn gelman_rubin(&self, transform: &dyn ParamTransform) -> Vec<f64> {
        let chains: Vec<&Chain> = self.runs.iter().map(|r| r.chain()).collect();
        gelman_rubin_transformed(&chains, transform)
    }

    /// All run chains merged into one, in run order.
    pub fn merged_chain(&self) -> Chain {
        let dim = self.runs[0].chain().n_dim();
        let total: usize = self.runs.iter().map(|r| r.chain().len()).sum();
        let mut merged = Chain::new(dim, total);
        for run in &self.runs {
            let chain = run.chain();
            for i in 0..chain.len() {
                merged.push(
                    chain.coords(i),
                    chain.log_like(i),
                    chain.log_prior(i),
                    chain.weight(i),
                );
            }
        }
        merged
    }

    /// The best stored point across all runs.
    pub fn best(&self) -> Option<Vec<f64>> {
        let mut best: Option<Vec<f64>> = None;
        let mut best_logp = f64::NEG_INFINITY;
        for run in &self.runs {
            let chain = run.chain();
            for i in 0..chain.len() {
                let logp = chain.log_like(i) + chain.log_prior(i);
                if logp > best_logp {
                    best_logp = logp;
                    best = Some(chain.coords(i).to_vec());
                }
            }
        }
        best
    }

    pub fn log_diagnostics(&self) {
        for (i, run) in self.runs.iter().enumerate() {
            debug!(
                "run {i}: stretch {:.3} repl {:.3} mh {:.3} custom {:.3}",
                run.stretch_acceptance(),
                run.replacement_acceptance(),
                run.mh_acceptance(),
                run.custom_acceptance()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::CumulativeReddening;

    /// Isotropic Gaussian in log-space with mean `mu`.
    struct GaussianTarget {
        dim: usize,
        mu: f64,
    }

    impl LogProbFn for GaussianTarget {
        type Workspace = ();

        fn dim(&self) -> usize {
            self.dim
        }

        fn workspace(&self) -> Self::Workspace {}

        fn log_prob(&self, x: &[f64], _ws: &mut ()) -> f64 {
            -0.5 * x.iter().map(|v| (v - self.mu) * (v - self.mu)).sum::<f64>()
        }

        fn draw_initial<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
            for v in out {
                let eps: f64 = rng.sample(StandardNormal);
                *v = self.mu + 2. * eps;
            }
        }
    }

    #[test]
    fn stretch_recovers_gaussian_mean() {
        let target = GaussianTarget { dim: 4, mu: -1.5 };
        let mut sampler = EnsembleSampler::new(&target, 24, 200_000, 42);
        sampler.step(200, false, 0.);
        sampler.step(2000, true, 0.);

        let mean = sampler.chain().mean();
        for m in mean {
            assert!((m - -1.5).abs() < 0.1, "mean component {m}");
        }
    }

    #[test]
    fn replacement_moves_are_accepted() {
        let target = GaussianTarget { dim: 3, mu: 0. };
        let mut sampler = EnsembleSampler::new(&target, 16, 10_000, 7);
        sampler.step(100, false, 0.);
        sampler.step(500, false, 0.5);
        assert!(sampler.replacement_acceptance() > 0.05);
    }

    #[test]
    fn tuning_moves_acceptance_toward_target() {
        let target = GaussianTarget { dim: 6, mu: 0. };
        let mut sampler = EnsembleSampler::new(&target, 24, 1000, 21);
        sampler.set_scale(30.);
        sampler.step(50, false, 0.);
        sampler.tune_stretch(8, 0.35);
        sampler.clear();
        sampler.step(500, false, 0.);
        let rate = sampler.stretch_acceptance();
        assert!(rate > 0.15 && rate < 0.6, "acceptance {rate}");
    }

    #[test]
    fn parallel_runs_converge_on_shared_target() {
        let target = GaussianTarget { dim: 3, mu: -2. };
        let mut ens = ParallelEnsemble::new(&target, 12, 4, 100_000, 3);
        ens.step(300, false, 0.1);
        ens.clear();
        ens.step(1500, true, 0.1);
        let rhat = ens.gelman_rubin(&CumulativeReddening);
        for r in rhat {
            assert!(r < 1.25, "rhat {r}");
        }
    }
}
