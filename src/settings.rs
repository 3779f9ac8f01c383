//! Settings records for the samplers.

use serde::{Deserialize, Serialize};

/// Options shared by the ensemble-based (continuous and cloud) runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct McmcOptions {
    /// Base number of main-phase steps; burn-in phases are fractions
    /// of this and non-convergence doubles it per attempt.
    pub steps: usize,
    /// Walkers per run, as a multiple of the dimensionality.
    pub samplers: usize,
    /// Probability of a kernel-density replacement proposal per walker
    /// during the mixed stretch/replacement phases.
    pub p_replacement: f64,
    /// Number of independent runs compared by the Gelman-Rubin
    /// diagnostic.
    pub n_runs: usize,
}

impl Default for McmcOptions {
    fn default() -> Self {
        McmcOptions {
            steps: 1000,
            samplers: 4,
            p_replacement: 0.2,
            n_runs: 4,
        }
    }
}

/// Settings for the parallel-tempered discrete line-of-sight sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscreteSettings {
    pub n_temperatures: usize,
    /// Geometric spacing of the inverse-temperature ladder, in (0, 1).
    pub beta_spacing: f64,
    pub log_shift_weight_min: f64,
    pub log_shift_weight_max: f64,
    /// Space the shift-weight ladder in log (true) or linear (false)
    /// shift weight.
    pub shift_weight_ladder_logarithmic: bool,
    /// Mini-cycles of (neighbor sweeps + central proposals) between
    /// consecutive swap attempts.
    pub updates_per_swap: usize,
    /// Central proposals per mini-cycle, as a multiple of n_dists.
    pub central_steps_per_update: usize,
    /// Gibbs sweeps over the neighbor pixels per mini-cycle.
    pub neighbor_steps_per_update: usize,
    /// Post-burn-in swap iterations.
    pub n_swaps: usize,
    /// Extra swap iterations discarded up front, as a fraction of
    /// `n_swaps`.
    pub burnin_frac: f64,
    /// Number of states saved per retained temperature.
    pub n_save: usize,
    pub save_all_temperatures: bool,
    /// Bad-star floor: the likelihood softening epsilon is
    /// `p_badstar / n_E`.
    pub p_badstar: f64,
    /// Memoize Gibbs scoring tables per neighbor configuration.
    pub use_gibbs_cache: bool,
    pub gibbs_cache_capacity: usize,
    /// Accepted central steps between full line-integral
    /// recomputations.
    pub recalculate_every: usize,
    /// Sub-samples per reddening bin when discretizing prior columns.
    pub priors_subsampling: usize,
}

impl Default for DiscreteSettings {
    fn default() -> Self {
        DiscreteSettings {
            n_temperatures: 4,
            beta_spacing: 0.50,
            log_shift_weight_min: -8.,
            log_shift_weight_max: -1.,
            shift_weight_ladder_logarithmic: true,
            updates_per_swap: 2,
            central_steps_per_update: 4,
            neighbor_steps_per_update: 2,
            n_swaps: 1000,
            burnin_frac: 0.25,
            n_save: 500,
            save_all_temperatures: false,
            p_badstar: 1e-5,
            use_gibbs_cache: false,
            gibbs_cache_capacity: 5000,
            recalculate_every: 1000,
            priors_subsampling: 1,
        }
    }
}

/// Inverse temperatures and shift weights, one per rung.
#[derive(Debug, Clone)]
pub struct TemperatureLadder {
    pub beta: Vec<f64>,
    pub shift_weight: Vec<f64>,
}

impl TemperatureLadder {
    pub fn from_settings(s: &DiscreteSettings) -> Self {
        let n_t = s.n_temperatures.max(1);

        let mut beta = Vec::with_capacity(n_t);
        let mut b = 1.;
        for _ in 0..n_t {
            beta.push(b);
            b *= s.beta_spacing;
        }

        let mut shift_weight = Vec::with_capacity(n_t);
        if n_t == 1 {
            shift_weight.push(s.log_shift_weight_min.exp());
        } else if s.shift_weight_ladder_logarithmic {
            let d = (s.log_shift_weight_max - s.log_shift_weight_min) / (n_t - 1) as f64;
            for t in 0..n_t {
                shift_weight.push((s.log_shift_weight_min + t as f64 * d).exp());
            }
        } else {
            let lo = s.log_shift_weight_min.exp();
            let hi = s.log_shift_weight_max.exp();
            let d = (hi - lo) / (n_t - 1) as f64;
            for t in 0..n_t {
                shift_weight.push(lo + t as f64 * d);
            }
        }

        TemperatureLadder { beta, shift_weight }
    }
}
