//! Pre-computed reddening libraries of neighboring sky pixels and the
//! Gibbs sampler that conditions the central pixel on them.
//!
//! Each sky pixel carries a fixed library of discrete reddening
//! profiles sampled earlier; a Gaussian process along the distance
//! axis couples the pixels. The bank itself is immutable and sharable;
//! the central pixel's evolving profile is passed in separately as a
//! [`CentralProfile`] instead of being written into the bank.

use std::collections::HashMap;

use log::debug;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::BankError;

/// Pixel index 0 is reserved for the central pixel.
pub const CENTRAL_PIXEL: usize = 0;

/// The central pixel's current profile, standardized into the bank's
/// units, together with its log-jump Jacobian term.
#[derive(Debug, Clone)]
pub struct CentralProfile {
    values: Vec<f64>,
    sum_log_dy: f64,
}

impl CentralProfile {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn sum_log_dy(&self) -> f64 {
        self.sum_log_dy
    }
}

/// Fixed library of reddening profiles for the pixels around (and
/// including) one central sky pixel.
pub struct NeighborPixelBank {
    n_pix: usize,
    n_samples: usize,
    n_dists: usize,
    /// Standardized log reddening jumps, `[pix][sample][dist]`.
    delta: Vec<f64>,
    /// Conditional GP precision of each pixel per distance, `[pix][dist]`.
    inv_var: Vec<f64>,
    /// Conditional-mean weights, `[dist][pix][other_pix]`; the entry
    /// for `other_pix == pix` is unused.
    inv_cov: Vec<f64>,
    /// Per-sample scalars, `[pix][sample]`.
    ln_prior: Vec<f64>,
    ln_like: Vec<f64>,
    sum_log_dy: Vec<f64>,
    /// Standardization parameters fixed by `apply_priors`.
    mu0: Vec<f64>,
    sigma0: Vec<f64>,
    de: f64,
}

impl NeighborPixelBank {
    /// Assemble a bank from raw (unstandardized) reddening profiles,
    /// one per (pixel, sample), each `n_dists` long: the differential
    /// reddening accumulated in each distance bin.
    ///
    /// `inv_var` is `[pix][dist]` row-major, `inv_cov` is
    /// `[dist][pix][other]` row-major, and the per-sample scalars are
    /// `[pix][sample]` row-major.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_pix: usize,
        n_samples: usize,
        n_dists: usize,
        raw_profiles: Vec<f64>,
        inv_var: Vec<f64>,
        inv_cov: Vec<f64>,
        ln_prior: Vec<f64>,
        ln_like: Vec<f64>,
    ) -> Result<Self, BankError> {
        if n_pix == 0 {
            return Err(BankError::NoPixels);
        }
        let profile_len = n_pix * n_samples * n_dists;
        if raw_profiles.len() != profile_len {
            return Err(BankError::ProfileLengthMismatch {
                pix: 0,
                sample: 0,
                got: raw_profiles.len() / (n_pix * n_samples).max(1),
                expected: n_dists,
            });
        }
        if ln_prior.len() != n_pix * n_samples || ln_like.len() != n_pix * n_samples {
            return Err(BankError::SampleCountMismatch {
                pix: 0,
                got: ln_prior.len() / n_pix.max(1),
                expected: n_samples,
            });
        }
        if inv_cov.len() != n_dists * n_pix * n_pix {
            return Err(BankError::CouplingShapeMismatch {
                got: inv_cov.len(),
                expected: n_dists * n_pix * n_pix,
            });
        }

        Ok(NeighborPixelBank {
            n_pix,
            n_samples,
            n_dists,
            delta: raw_profiles,
            inv_var,
            inv_cov,
            ln_prior,
            ln_like,
            sum_log_dy: vec![0.; n_pix * n_samples],
            mu0: vec![0.; n_dists],
            sigma0: vec![1.; n_dists],
            de: 1.,
        })
    }

    pub fn n_pix(&self) -> usize {
        self.n_pix
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_dists(&self) -> usize {
        self.n_dists
    }

    /// Standardize the stored profiles against the Galactic prior:
    /// every value becomes `(ln max(E, dE/2) - mu0_d) / sigma0_d` and
    /// the per-sample Jacobian sums are recomputed. Must be called once
    /// before sampling.
    pub fn apply_priors(&mut self, mu0: &[f64], sigma0: &[f64], de: f64) {
        assert_eq!(mu0.len(), self.n_dists);
        assert_eq!(sigma0.len(), self.n_dists);
        self.mu0 = mu0.to_vec();
        self.sigma0 = sigma0.to_vec();
        self.de = de;

        for pix in 0..self.n_pix {
            for sample in 0..self.n_samples {
                let base = (pix * self.n_samples + sample) * self.n_dists;
                let mut sum_log_dy = 0.;
                for dist in 0..self.n_dists {
                    let e = self.delta[base + dist].max(de / 2.);
                    sum_log_dy += (e / de).ln();
                    self.delta[base + dist] = (e.ln() - mu0[dist]) / sigma0[dist];
                }
                self.sum_log_dy[pix * self.n_samples + sample] = sum_log_dy;
            }
        }
    }

    /// Standardize the central pixel's discrete profile into the
    /// bank's units.
    ///
    /// `y` holds cumulative reddening bins; the bank works in
    /// standardized log *jumps* per distance, so the profile is
    /// differenced against `y_zero` first.
    pub fn standardize_central(&self, y: &[i32], y_zero: i32) -> CentralProfile {
        assert_eq!(y.len(), self.n_dists);
        let mut values = Vec::with_capacity(self.n_dists);
        let mut sum_log_dy = 0.;
        let mut prev = y_zero;
        for (dist, &yi) in y.iter().enumerate() {
            let jump = (yi - prev).max(0);
            prev = yi;
            let e = (jump as f64 * self.de).max(self.de / 2.);
            sum_log_dy += (e / self.de).ln();
            values.push((e.ln() - self.mu0[dist]) / self.sigma0[dist]);
        }
        CentralProfile { values, sum_log_dy }
    }

    #[inline]
    pub fn delta(&self, pix: usize, sample: usize, dist: usize) -> f64 {
        self.delta[(pix * self.n_samples + sample) * self.n_dists + dist]
    }

    #[inline]
    fn delta_at(&self, pix: usize, sample: usize, dist: usize, central: &[f64]) -> f64 {
        if pix == CENTRAL_PIXEL {
            central[dist]
        } else {
            self.delta(pix, sample, dist)
        }
    }

    #[inline]
    pub fn inv_var(&self, pix: usize, dist: usize) -> f64 {
        self.inv_var[pix * self.n_dists + dist]
    }

    #[inline]
    pub fn inv_cov(&self, dist: usize, pix: usize, other: usize) -> f64 {
        self.inv_cov[(dist * self.n_pix + pix) * self.n_pix + other]
    }

    #[inline]
    pub fn ln_prior(&self, pix: usize, sample: usize) -> f64 {
        self.ln_prior[pix * self.n_samples + sample]
    }

    #[inline]
    pub fn ln_like(&self, pix: usize, sample: usize) -> f64 {
        self.ln_like[pix * self.n_samples + sample]
    }

    #[inline]
    pub fn sum_log_dy(&self, pix: usize, sample: usize) -> f64 {
        self.sum_log_dy[pix * self.n_samples + sample]
    }

    /// Conditional GP mean at `(pix, dist)` given the other pixels'
    /// current sample choices.
    ///
    /// `shift_weight` couples the pixel to distance-shifted versions of
    /// its neighbors; zero disables the shift terms entirely.
    pub fn mean(
        &self,
        pix: usize,
        dist: usize,
        choices: &[u16],
        central: &[f64],
        shift_weight: f64,
    ) -> f64 {
        self.mean_from(pix, dist, choices, central, shift_weight, 0)
    }

    /// Like [`Self::mean`], but only summing contributions from pixels
    /// with index `>= from_pix`. The Gibbs cache uses `from_pix = 1` to
    /// exclude the fast-changing central pixel.
    fn mean_from(
        &self,
        pix: usize,
        dist: usize,
        choices: &[u16],
        central: &[f64],
        shift_weight: f64,
        from_pix: usize,
    ) -> f64 {
        let mut mean = 0.;
        for q in from_pix..self.n_pix {
            if q == pix {
                continue;
            }
            let s = choices[q] as usize;
            mean += self.inv_cov(dist, pix, q) * self.delta_at(q, s, dist, central);
            if shift_weight > 0. {
                if dist > 0 {
                    mean += shift_weight
                        * self.inv_cov(dist - 1, pix, q)
                        * self.delta_at(q, s, dist - 1, central);
                }
                if dist + 1 < self.n_dists {
                    mean += shift_weight
                        * self.inv_cov(dist + 1, pix, q)
                        * self.delta_at(q, s, dist + 1, central);
                }
            }
        }
        mean
    }

    /// The central-pixel contribution to the conditional mean at
    /// `(pix, dist)`; added on top of a cached `mean_from(.., 1)`.
    fn central_mean_term(
        &self,
        pix: usize,
        dist: usize,
        central: &[f64],
        shift_weight: f64,
    ) -> f64 {
        let mut mean = self.inv_cov(dist, pix, CENTRAL_PIXEL) * central[dist];
        if shift_weight > 0. {
            if dist > 0 {
                mean += shift_weight * self.inv_cov(dist - 1, pix, CENTRAL_PIXEL) * central[dist - 1];
            }
            if dist + 1 < self.n_dists {
                mean += shift_weight * self.inv_cov(dist + 1, pix, CENTRAL_PIXEL) * central[dist + 1];
            }
        }
        mean
    }

    /// Log-probability of a full neighbor configuration under the GP
    /// prior, the per-sample priors and optionally the per-sample
    /// likelihoods.
    pub fn ln_prob(
        &self,
        choices: &[u16],
        central: &CentralProfile,
        shift_weight: f64,
        include_likelihood: bool,
    ) -> f64 {
        let mut lnp = 0.;
        for pix in 0..self.n_pix {
            let s = choices[pix] as usize;
            let mut chi2 = 0.;
            for dist in 0..self.n_dists {
                let mu = self.mean(pix, dist, choices, central.values(), shift_weight);
                let dx = self.delta_at(pix, s, dist, central.values()) - mu;
                chi2 += self.inv_var(pix, dist) * dx * dx;
            }
            lnp -= 0.5 * chi2;
            if pix == CENTRAL_PIXEL {
                lnp -= central.sum_log_dy();
            } else {
                lnp -= self.sum_log_dy(pix, s);
                lnp -= self.ln_prior(pix, s);
                if include_likelihood {
                    lnp += self.ln_like(pix, s);
                }
            }
        }
        lnp
    }

    /// The distance bin holding the largest reddening jump of a stored
    /// sample; a cheap summary used in diagnostics.
    pub fn dominant_distance(&self, pix: usize, sample: usize) -> usize {
        let mut best = 0;
        let mut best_jump = f64::NEG_INFINITY;
        for dist in 0..self.n_dists {
            let v = self.delta(pix, sample, dist);
            if v > best_jump {
                best_jump = v;
                best = dist;
            }
        }
        best
    }
}

/// Draw a random sample index for every pixel.
pub fn randomize_choices<R: Rng + ?Sized>(bank: &NeighborPixelBank, rng: &mut R) -> Vec<u16> {
    let mut choices: Vec<u16> = (0..bank.n_pix())
        .map(|_| rng.gen_range(0..bank.n_samples()) as u16)
        .collect();
    // The central pixel's library is never sampled; its profile is
    // copied in before every sweep.
    choices[CENTRAL_PIXEL] = 0;
    choices
}

/// Scratch buffers reused across Gibbs steps.
#[derive(Debug, Default)]
pub struct GibbsWorkspace {
    log_p: Vec<f64>,
    p: Vec<f64>,
}

/// Scores below this (relative to the per-step maximum) are treated as
/// zero probability.
const LN_P_CUTOFF: f64 = -8.;

fn draw_discrete<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        u -= w;
        if u <= 0. {
            return i;
        }
    }
    weights.len() - 1
}

/// One tempered Gibbs step at pixel `pix`: re-draw its sample index
/// conditioned on every other pixel's current choice.
///
/// Returns the change in the pixel's conditional log-score.
#[allow(clippy::too_many_arguments)]
pub fn gibbs_step<R: Rng + ?Sized>(
    pix: usize,
    bank: &NeighborPixelBank,
    choices: &mut [u16],
    central: &CentralProfile,
    ws: &mut GibbsWorkspace,
    rng: &mut R,
    beta: f64,
    shift_weight: f64,
) -> f64 {
    let n_samples = bank.n_samples();
    ws.log_p.clear();
    ws.log_p.resize(n_samples, 0.);
    ws.p.clear();
    ws.p.resize(n_samples, 0.);

    for dist in 0..bank.n_dists() {
        let mu = bank.mean(pix, dist, choices, central.values(), shift_weight);
        let iv = bank.inv_var(pix, dist);
        for sample in 0..n_samples {
            let dy = bank.delta(pix, sample, dist) - mu;
            ws.log_p[sample] += iv * dy * dy;
        }
    }

    for sample in 0..n_samples {
        let mut lp = -0.5 * ws.log_p[sample];
        lp -= bank.sum_log_dy(pix, sample);
        lp *= beta;
        lp -= bank.ln_prior(pix, sample) + (1. - beta) * bank.ln_like(pix, sample);
        ws.log_p[sample] = lp;
    }

    let log_p_max = ws.log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for sample in 0..n_samples {
        let rel = ws.log_p[sample] - log_p_max;
        ws.p[sample] = if rel < LN_P_CUTOFF { 0. } else { rel.exp() };
    }

    let old = choices[pix] as usize;
    let idx = draw_discrete(&ws.p, rng);
    choices[pix] = idx as u16;

    ws.log_p[idx] - ws.log_p[old]
}

/// Pre-scored candidates for one (pixel, other-neighbors) combination.
struct CacheEntry {
    /// Sample indices that survived the cutoff.
    samples: Vec<u16>,
    /// Candidate-major mean contributions from the non-central pixels,
    /// `[candidate][dist]`.
    mu: Vec<f64>,
}

/// Bounded cache of Gibbs scoring tables, keyed by the neighbor-choice
/// vector with the sampled pixel replaced by the sentinel `n_pix`.
///
/// The capacity stays small (thousands), so eviction scans for the
/// stalest entry instead of maintaining an intrusive list.
pub struct NeighborGibbsCache {
    map: HashMap<Vec<u16>, (u64, CacheEntry)>,
    capacity: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl NeighborGibbsCache {
    pub fn new(capacity: usize) -> Self {
        NeighborGibbsCache {
            map: HashMap::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn get_or_insert_with(
        &mut self,
        key: Vec<u16>,
        build: impl FnOnce() -> CacheEntry,
    ) -> &CacheEntry {
        self.tick += 1;
        let tick = self.tick;

        if !self.map.contains_key(&key) {
            self.misses += 1;
            if self.map.len() >= self.capacity {
                if let Some(stalest) = self
                    .map
                    .iter()
                    .min_by_key(|(_, (t, _))| *t)
                    .map(|(k, _)| k.clone())
                {
                    self.map.remove(&stalest);
                }
            }
            self.map.insert(key.clone(), (tick, build()));
        } else {
            self.hits += 1;
        }

        let entry = self.map.get_mut(&key).expect("entry just ensured");
        entry.0 = tick;
        &entry.1
    }
}

/// Cached variant of [`gibbs_step`].
///
/// The expensive part of the score, the conditional-mean contribution
/// of the *other* neighbor pixels, is memoized per neighbor
/// configuration; on a hit only the central-pixel term is re-added.
#[allow(clippy::too_many_arguments)]
pub fn gibbs_step_cached<R: Rng + ?Sized>(
    pix: usize,
    bank: &NeighborPixelBank,
    choices: &mut [u16],
    central: &CentralProfile,
    cache: &mut NeighborGibbsCache,
    ws: &mut GibbsWorkspace,
    rng: &mut R,
    beta: f64,
    shift_weight: f64,
) -> f64 {
    let n_dists = bank.n_dists();

    // The sampled pixel becomes the wildcard sentinel n_pix; its own
    // index is prepended so that wildcard positions never alias.
    let mut key = Vec::with_capacity(choices.len() + 1);
    key.push(pix as u16);
    key.extend_from_slice(choices);
    key[pix + 1] = bank.n_pix() as u16;

    let entry = cache.get_or_insert_with(key, || {
        // Score every sample against the non-central mean field and
        // keep the candidates that are not hopeless under any central
        // profile.
        let n_samples = bank.n_samples();
        let mut mu_all = vec![0.; n_samples * n_dists];
        let mut log_p = vec![0.; n_samples];

        for dist in 0..n_dists {
            let mu = bank.mean_from(pix, dist, choices, central.values(), shift_weight, 1);
            let iv = bank.inv_var(pix, dist);
            for sample in 0..n_samples {
                mu_all[sample * n_dists + dist] = mu;
                let dx = bank.delta(pix, sample, dist) - mu;
                log_p[sample] += iv * dx * dx;
            }
        }
        for (sample, lp) in log_p.iter_mut().enumerate() {
            *lp *= -0.5 * beta;
            *lp -= bank.ln_prior(pix, sample);
        }
        let log_p_max = log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let samples: Vec<u16> = (0..n_samples)
            .filter(|&s| log_p[s] - log_p_max > LN_P_CUTOFF + LN_P_CUTOFF)
            .map(|s| s as u16)
            .collect();
        let mut mu = Vec::with_capacity(samples.len() * n_dists);
        for &s in &samples {
            mu.extend_from_slice(&mu_all[s as usize * n_dists..(s as usize + 1) * n_dists]);
        }
        CacheEntry { samples, mu }
    });

    let n_cand = entry.samples.len();
    ws.log_p.clear();
    ws.log_p.resize(n_cand, 0.);
    ws.p.clear();
    ws.p.resize(n_cand, 0.);

    for (i, &sample) in entry.samples.iter().enumerate() {
        let sample = sample as usize;
        let mut chi2 = 0.;
        for dist in 0..n_dists {
            let mu = entry.mu[i * n_dists + dist]
                + bank.central_mean_term(pix, dist, central.values(), shift_weight);
            let dx = bank.delta(pix, sample, dist) - mu;
            chi2 += bank.inv_var(pix, dist) * dx * dx;
        }
        let mut lp = -0.5 * chi2;
        lp -= bank.sum_log_dy(pix, sample);
        lp *= beta;
        lp -= bank.ln_prior(pix, sample) + (1. - beta) * bank.ln_like(pix, sample);
        ws.log_p[i] = lp;
    }

    let log_p_max = ws.log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for i in 0..n_cand {
        let rel = ws.log_p[i] - log_p_max;
        ws.p[i] = if rel < LN_P_CUTOFF { 0. } else { rel.exp() };
    }

    let old = choices[pix];
    let drawn = draw_discrete(&ws.p, rng);
    choices[pix] = entry.samples[drawn];

    let old_score = entry
        .samples
        .iter()
        .position(|&s| s == old)
        .map(|i| ws.log_p[i])
        .unwrap_or(log_p_max + LN_P_CUTOFF);
    ws.log_p[drawn] - old_score
}

/// Settings for the standalone parallel-tempered neighbor sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborPtSettings {
    pub n_temperatures: usize,
    pub beta_spacing: f64,
    pub steps_per_swap: usize,
    pub n_swaps: usize,
    pub burnin_frac: f64,
    pub n_save: usize,
    pub log_shift_weight: f64,
    pub cache_capacity: usize,
}

impl Default for NeighborPtSettings {
    fn default() -> Self {
        NeighborPtSettings {
            n_temperatures: 5,
            beta_spacing: 0.70,
            steps_per_swap: 10,
            n_swaps: 200,
            burnin_frac: 0.3,
            n_save: 200,
            log_shift_weight: -1.,
            cache_capacity: 10_000,
        }
    }
}

/// Sample neighbor-index configurations with parallel tempering over
/// Gibbs sweeps, independent of any central-pixel chain.
///
/// The central profile is held fixed at `central`. Returns the saved
/// configurations from the coldest temperature.
pub fn sample_neighbor_configurations(
    bank: &NeighborPixelBank,
    central: &CentralProfile,
    settings: &NeighborPtSettings,
    seed: u64,
) -> Vec<Vec<u16>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let shift_weight = settings.log_shift_weight.exp();

    let n_t = settings.n_temperatures;
    let mut beta = Vec::with_capacity(n_t);
    let mut b = 1.;
    for _ in 0..n_t {
        beta.push(b);
        b *= settings.beta_spacing;
    }

    let init = randomize_choices(bank, &mut rng);
    let mut choices: Vec<Vec<u16>> = (0..n_t).map(|_| init.clone()).collect();
    let mut log_p = vec![0.0f64; n_t];

    let mut gibbs_order: Vec<usize> = (1..bank.n_pix()).collect();
    let mut temp_order: Vec<usize> = (1..n_t).collect();
    let mut ws = GibbsWorkspace::default();
    let mut cache: Vec<NeighborGibbsCache> = (0..n_t)
        .map(|_| NeighborGibbsCache::new(settings.cache_capacity))
        .collect();

    let n_swaps_burnin = (settings.burnin_frac * settings.n_swaps as f64) as usize;
    let n_swaps_total = settings.n_swaps + n_swaps_burnin;
    let save_every = (settings.n_swaps / settings.n_save).max(1);
    let mut save_in = save_every;

    let mut saved = Vec::with_capacity(settings.n_save);
    let mut swaps_proposed = vec![0u64; n_t.saturating_sub(1)];
    let mut swaps_accepted = vec![0u64; n_t.saturating_sub(1)];

    for swap in 0..n_swaps_total {
        for t in 0..n_t {
            for _ in 0..settings.steps_per_swap {
                gibbs_order.shuffle(&mut rng);
                for &pix in &gibbs_order {
                    gibbs_step_cached(
                        pix,
                        bank,
                        &mut choices[t],
                        central,
                        &mut cache[t],
                        &mut ws,
                        &mut rng,
                        beta[t],
                        shift_weight,
                    );
                }
            }
            log_p[t] = bank.ln_prob(&choices[t], central, shift_weight, true);
        }

        temp_order.shuffle(&mut rng);
        for &t in &temp_order {
            swaps_proposed[t - 1] += 1;
            let ln_p_swap = (beta[t] - beta[t - 1]) * (log_p[t - 1] - log_p[t]);
            if ln_p_swap > 0. || (ln_p_swap > -10. && rng.gen::<f64>() < ln_p_swap.exp()) {
                choices.swap(t, t - 1);
                log_p.swap(t, t - 1);
                swaps_accepted[t - 1] += 1;
            }
        }

        if swap >= n_swaps_burnin {
            save_in -= 1;
            if save_in == 0 {
                save_in = save_every;
                saved.push(choices[0].clone());
            }
        }
    }

    for t in 1..n_t {
        let rate = swaps_accepted[t - 1] as f64 / swaps_proposed[t - 1].max(1) as f64;
        debug!("neighbor PT swap {}<->{}: acceptance {rate:.3}", t - 1, t);
    }
    debug!("gibbs cache hit rate: {:.3}", cache[0].hit_rate());

    saved
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bank whose conditional means weight every other pixel
    /// equally at each distance.
    fn toy_bank(n_pix: usize, n_samples: usize, n_dists: usize) -> NeighborPixelBank {
        // Sample s in every pixel carries a jump of roughly
        // 0.05 + 0.1 s magnitudes in each distance bin.
        let mut raw = Vec::new();
        for _pix in 0..n_pix {
            for s in 0..n_samples {
                for d in 0..n_dists {
                    raw.push(0.05 + s as f64 * 0.1 + d as f64 * 0.01);
                }
            }
        }
        let inv_var = vec![4.0; n_pix * n_dists];
        let mut inv_cov = vec![0.0; n_dists * n_pix * n_pix];
        for dist in 0..n_dists {
            for pix in 0..n_pix {
                for other in 0..n_pix {
                    if pix != other {
                        inv_cov[(dist * n_pix + pix) * n_pix + other] =
                            1. / (n_pix as f64 - 1.);
                    }
                }
            }
        }
        let ln_prior = vec![0.0; n_pix * n_samples];
        let mut ln_like = vec![0.0; n_pix * n_samples];
        for pix in 0..n_pix {
            for s in 0..n_samples {
                ln_like[pix * n_samples + s] = -0.05 * s as f64;
            }
        }

        let mut bank = NeighborPixelBank::new(
            n_pix, n_samples, n_dists, raw, inv_var, inv_cov, ln_prior, ln_like,
        )
        .unwrap();
        bank.apply_priors(&vec![-2.0; n_dists], &vec![1.0; n_dists], 0.02);
        bank
    }

    #[test]
    fn rejects_malformed_tables() {
        let res = NeighborPixelBank::new(2, 3, 4, vec![0.; 10], vec![0.; 8], vec![0.; 64], vec![0.; 6], vec![0.; 6]);
        assert!(res.is_err());
    }

    #[test]
    fn mean_averages_identical_neighbors() {
        let bank = toy_bank(4, 5, 6);
        let choices = vec![0u16, 2, 2, 2];
        let central = bank.standardize_central(&vec![0; 6], 0);
        // All contributing neighbors hold sample 2, so the conditional
        // mean must equal sample 2's standardized value (weights sum
        // to 1 and pixel 0 is excluded for pix >= 1... here pix=0).
        let mu = bank.mean(0, 3, &choices, central.values(), 0.);
        let expected = bank.delta(1, 2, 3);
        assert!((mu - expected).abs() < 1e-12);
    }

    #[test]
    fn gibbs_concentrates_on_matching_samples() {
        let bank = toy_bank(5, 8, 6);
        // Central profile with a constant jump of 8 bins (0.16 mag) per
        // distance, close to sample 1's jump level (0.15 mag).
        let y_central: Vec<i32> = (1..=6).map(|i| 8 * i).collect();
        let central = bank.standardize_central(&y_central, 0);

        let mut rng = SmallRng::seed_from_u64(5);
        let mut choices = randomize_choices(&bank, &mut rng);
        let mut ws = GibbsWorkspace::default();

        let mut counts = vec![0usize; 8];
        for _ in 0..400 {
            for pix in 1..5 {
                gibbs_step(pix, &bank, &mut choices, &central, &mut ws, &mut rng, 1.0, 0.);
            }
            for pix in 1..5 {
                counts[choices[pix] as usize] += 1;
            }
        }
        let best = counts.iter().enumerate().max_by_key(|(_, &c)| c).unwrap().0;
        assert!(
            best <= 3,
            "gibbs concentrated on sample {best}, counts {counts:?}"
        );
    }

    #[test]
    fn cached_gibbs_agrees_with_uncached_distribution() {
        let bank = toy_bank(4, 6, 5);
        let central = bank.standardize_central(&vec![10; 5], 0);
        let mut ws = GibbsWorkspace::default();
        let mut cache = NeighborGibbsCache::new(100);

        let mut counts_plain = vec![0usize; 6];
        let mut counts_cached = vec![0usize; 6];
        let n_trials = 4000;

        for trial in 0..n_trials {
            let mut rng = SmallRng::seed_from_u64(1000 + trial);
            let mut choices = vec![0u16, 1, 2, 3];
            gibbs_step(2, &bank, &mut choices, &central, &mut ws, &mut rng, 0.8, 0.1);
            counts_plain[choices[2] as usize] += 1;

            let mut rng = SmallRng::seed_from_u64(1000 + trial);
            let mut choices = vec![0u16, 1, 2, 3];
            gibbs_step_cached(
                2, &bank, &mut choices, &central, &mut cache, &mut ws, &mut rng, 0.8, 0.1,
            );
            counts_cached[choices[2] as usize] += 1;
        }

        for s in 0..6 {
            let diff = (counts_plain[s] as f64 - counts_cached[s] as f64).abs();
            assert!(
                diff / n_trials as f64 <= 0.05,
                "sample {s}: plain {} vs cached {}",
                counts_plain[s],
                counts_cached[s]
            );
        }
        assert!(cache.hit_rate() > 0.9);
    }

    #[test]
    fn cache_evicts_at_capacity() {
        let mut cache = NeighborGibbsCache::new(2);
        for i in 0..5u16 {
            cache.get_or_insert_with(vec![i], || CacheEntry {
                samples: vec![],
                mu: vec![],
            });
        }
        assert!(cache.map.len() <= 2);
    }

    #[test]
    fn identical_neighbor_library_marginal_is_exact() {
        // Single neighbor with a single sample: the configuration
        // probability is the raw GP + prior + likelihood score of that
        // sample, with nothing to marginalize over.
        let bank = toy_bank(2, 1, 4);
        let central = bank.standardize_central(&vec![5; 4], 0);
        let choices = vec![0u16, 0];
        let with_like = bank.ln_prob(&choices, &central, 0., true);
        let without = bank.ln_prob(&choices, &central, 0., false);
        assert!((with_like - without - bank.ln_like(1, 0)).abs() < 1e-12);
    }

    #[test]
    fn pt_neighbor_sampler_returns_requested_samples() {
        let bank = toy_bank(4, 6, 5);
        let central = bank.standardize_central(&vec![8; 5], 0);
        let settings = NeighborPtSettings {
            n_swaps: 50,
            n_save: 25,
            ..Default::default()
        };
        let saved = sample_neighbor_configurations(&bank, &central, &settings, 11);
        assert_eq!(saved.len(), 25);
        for cfg in &saved {
            assert_eq!(cfg.len(), 4);
            assert_eq!(cfg[0], 0);
        }
    }
}
