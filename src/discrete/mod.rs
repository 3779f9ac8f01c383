//! Parallel-tempered sampler over discrete line-of-sight reddening
//! profiles.
//!
//! Each temperature rung owns a profile (one reddening bin per
//! distance column), its per-star line integrals, a neighbor-choice
//! vector and the prior image implied by those choices. Between swap
//! attempts every rung interleaves Gibbs sweeps over the neighbor
//! pixels with incremental Metropolis proposals on the central
//! profile.

pub mod kernels;
pub mod proposal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{ChiSquared, Distribution};

use crate::chain::Chain;
use crate::math::{ln_one_plus, logsumexp};
use crate::neighbors::{
    gibbs_step, gibbs_step_cached, randomize_choices, CentralProfile, GibbsWorkspace,
    NeighborGibbsCache, NeighborPixelBank,
};
use crate::prior::{PriorImage, PriorImageBuilder};
use crate::settings::{DiscreteSettings, TemperatureLadder};
use crate::stack::ImageStack;
use proposal::{Proposal, N_PROPOSAL_KINDS, PROPOSAL_NAMES};

/// Acceptance exponents below this are treated as certain rejection.
const LN_ACCEPT_CUTOFF: f64 = -10.;

/// Tolerated drift between running and recomputed log-prior before a
/// forced refresh.
const LOG_PRIOR_DRIFT_TOL: f64 = 1e-3;

/// Per-kind proposal statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalStats {
    pub proposed: [u64; N_PROPOSAL_KINDS],
    pub valid: [u64; N_PROPOSAL_KINDS],
    pub accepted: [u64; N_PROPOSAL_KINDS],
}

impl ProposalStats {
    pub fn acceptance(&self, kind: usize) -> f64 {
        if self.proposed[kind] == 0 {
            0.
        } else {
            self.accepted[kind] as f64 / self.proposed[kind] as f64
        }
    }
}

/// Saved states of one retained temperature.
#[derive(Debug, Clone)]
pub struct DiscreteTemperatureChain {
    /// Saved profiles, one row per state.
    pub y: Array2<i32>,
    pub log_like: Vec<f64>,
    pub log_prior: Vec<f64>,
    /// Marginal weights normalized to a maximum of 1; all 1 when no
    /// neighbor bank was attached.
    pub weight: Vec<f64>,
}

/// Result of one discrete line-of-sight run.
#[derive(Debug, Clone)]
pub struct DiscreteFit {
    /// One chain per saved temperature (only the coldest unless
    /// `save_all_temperatures`).
    pub chains: Vec<DiscreteTemperatureChain>,
    pub proposal_stats: ProposalStats,
    /// Swap acceptance per adjacent temperature pair.
    pub swap_acceptance: Vec<f64>,
    pub converged: bool,
    pub dm_min: f64,
    pub dm_max: f64,
    /// Wall-clock runtime in seconds.
    pub runtime: f64,
}

/// Per-temperature state. Swaps exchange whole slots by handle.
struct TemperatureSlot {
    y: Vec<i32>,
    line_int: Vec<f64>,
    log_like: f64,
    log_prior: f64,
    neighbors: Vec<u16>,
    prior_image: PriorImage,
}

/// Draw an initial profile: chi-squared(1) increments rescaled so the
/// far edge lands near the guessed maximum reddening.
fn guess_profile_discrete<R: Rng + ?Sized>(
    stack: &ImageStack,
    y_zero: i32,
    rng: &mut R,
) -> Vec<i32> {
    let n_x = stack.grid().n_mu();
    let n_y = stack.grid().n_e();
    let de = stack.grid().step(crate::grid::E_AXIS);

    let ebv_max_guess = stack.guess_max_reddening() * (0.8 + 0.4 * rng.gen::<f64>());

    let chi2 = ChiSquared::new(1.).expect("k = 1 is valid");
    let mut cum = Vec::with_capacity(n_x);
    let mut acc = 0.;
    for _ in 0..n_x {
        acc += chi2.sample(rng);
        cum.push(acc);
    }

    let y_scale = (ebv_max_guess / cum[n_x - 1]) / de;
    cum.iter()
        .map(|&c| {
            let y = (c * y_scale + y_zero as f64).ceil() as i32;
            y.clamp(0, n_y as i32 - 1)
        })
        .collect()
}

/// Sample the discrete LOS model.
///
/// When a neighbor bank is given it must already be standardized
/// against the same prior columns as `prior_builder`
/// (see [`NeighborPixelBank::apply_priors`]).
pub fn sample_los_extinction_discrete(
    stack: &ImageStack,
    bank: Option<&NeighborPixelBank>,
    prior_builder: &PriorImageBuilder,
    settings: &DiscreteSettings,
    seed: u64,
    cancel: Option<&AtomicBool>,
) -> DiscreteFit {
    let t_start = Instant::now();

    let grid = stack.grid();
    let n_x = grid.n_mu();
    let n_y = grid.n_e();
    let n_stars = stack.n_stars();
    let dm_min = grid.min(crate::grid::MU_AXIS);
    let dm_max = grid.max(crate::grid::MU_AXIS);

    let n_t = settings.n_temperatures.max(1);
    let t_save_max = if settings.save_all_temperatures { n_t } else { 1 };

    if stack.is_empty() {
        info!("empty image stack; writing empty discrete chain");
        return DiscreteFit {
            chains: vec![
                DiscreteTemperatureChain {
                    y: Array2::zeros((0, n_x)),
                    log_like: vec![],
                    log_prior: vec![],
                    weight: vec![],
                };
                t_save_max
            ],
            proposal_stats: ProposalStats::default(),
            swap_acceptance: vec![0.; n_t.saturating_sub(1)],
            converged: false,
            dm_min,
            dm_max,
            runtime: t_start.elapsed().as_secs_f64(),
        };
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    let ladder = TemperatureLadder::from_settings(settings);

    let n_swaps_burnin = (settings.burnin_frac * settings.n_swaps as f64) as usize;
    let n_swaps_total = settings.n_swaps + n_swaps_burnin;
    let central_steps_per_update = settings.central_steps_per_update * n_x;
    let save_every = (settings.n_swaps / settings.n_save).max(1);
    let mut save_in = save_every;

    // Softening floor and anneal of the negative-step penalty.
    let epsilon = settings.p_badstar / n_y as f64;
    let mut sigma_dy_neg = 1e-5;
    let sigma_dy_neg_target = 1e-10;
    let tau_decay = n_swaps_total as f64 / 20.;
    let mut inv_sigma_dy_neg = 1. / sigma_dy_neg;

    // Absolute-shift proposal parameters.
    let y_abs_mean = n_y as f64 / 20.;
    let y_abs_max = n_y as f64;

    // Initialize the cold rung and copy it to the others.
    let y_zero = prior_builder.new_image().y_zero();
    let y_init = guess_profile_discrete(stack, y_zero, &mut rng);
    let mut line_int_init = vec![0.; n_stars];
    kernels::line_integrals(stack, &y_init, &mut line_int_init);

    let neighbors_init = match bank {
        Some(bank) => randomize_choices(bank, &mut rng),
        None => vec![0u16; 1],
    };

    let mut slots: Vec<TemperatureSlot> = (0..n_t)
        .map(|t| {
            let mut slot = TemperatureSlot {
                y: y_init.clone(),
                line_int: line_int_init.clone(),
                log_like: 0.,
                log_prior: 0.,
                neighbors: neighbors_init.clone(),
                prior_image: prior_builder.new_image(),
            };
            match bank {
                Some(bank) => {
                    let central = bank.standardize_central(&slot.y, y_zero);
                    prior_builder.build_into(
                        Some((bank, &slot.neighbors, &central, ladder.shift_weight[t])),
                        &mut slot.prior_image,
                    );
                }
                None => prior_builder.build_into(None, &mut slot.prior_image),
            }
            slot.log_prior = slot.prior_image.log_prior(&slot.y, inv_sigma_dy_neg);
            slot
        })
        .collect();

    // Saved chains and the raw snapshots the marginal pass needs.
    let n_save_buffered = (1.1 * settings.n_save as f64) as usize + 5;
    let mut chains: Vec<Chain> = (0..t_save_max)
        .map(|_| Chain::new(n_x, n_save_buffered))
        .collect();
    let mut y_chain: Vec<Vec<i32>> = vec![Vec::new(); t_save_max];
    let mut neighbor_chain: Vec<Vec<u16>> = vec![Vec::new(); t_save_max];

    let mut stats = ProposalStats::default();
    let mut swaps_proposed = vec![0u64; n_t.saturating_sub(1)];
    let mut swaps_accepted = vec![0u64; n_t.saturating_sub(1)];
    let mut recalculate_in = vec![settings.recalculate_every; n_t];

    let mut gibbs_order: Vec<usize> = match bank {
        Some(bank) => (1..bank.n_pix()).collect(),
        None => Vec::new(),
    };
    let mut gibbs_ws = GibbsWorkspace::default();
    let mut gibbs_cache: Vec<NeighborGibbsCache> = (0..n_t)
        .map(|_| NeighborGibbsCache::new(settings.gibbs_cache_capacity))
        .collect();

    let mut delta_line_int = vec![0.; n_stars];
    let mut y_dbl = vec![0.; n_x];

    for swap in 0..n_swaps_total {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                info!("cancellation requested after {swap} swap iterations");
                break;
            }
        }

        // Ramp the negative-step penalty toward its target.
        sigma_dy_neg -= (sigma_dy_neg - sigma_dy_neg_target) / tau_decay;
        inv_sigma_dy_neg = 1. / sigma_dy_neg;

        for t in 0..n_t {
            let beta = ladder.beta[t];
            let shift_weight = ladder.shift_weight[t];

            for _ in 0..settings.updates_per_swap {
                // Neighbor Gibbs sweeps conditioned on the current
                // central profile.
                if let Some(bank) = bank {
                    let slot = &mut slots[t];
                    let central = bank.standardize_central(&slot.y, y_zero);

                    for _ in 0..settings.neighbor_steps_per_update {
                        gibbs_order.shuffle(&mut rng);
                        for &pix in &gibbs_order {
                            if settings.use_gibbs_cache {
                                gibbs_step_cached(
                                    pix,
                                    bank,
                                    &mut slot.neighbors,
                                    &central,
                                    &mut gibbs_cache[t],
                                    &mut gibbs_ws,
                                    &mut rng,
                                    beta,
                                    shift_weight,
                                );
                            } else {
                                gibbs_step(
                                    pix,
                                    bank,
                                    &mut slot.neighbors,
                                    &central,
                                    &mut gibbs_ws,
                                    &mut rng,
                                    beta,
                                    shift_weight,
                                );
                            }
                        }
                    }

                    prior_builder.build_into(
                        Some((bank, &slot.neighbors, &central, shift_weight)),
                        &mut slot.prior_image,
                    );
                    slot.log_prior = slot.prior_image.log_prior(&slot.y, inv_sigma_dy_neg);
                }

                // Central-profile proposals.
                for _ in 0..central_steps_per_update {
                    let slot = &mut slots[t];
                    let prop = Proposal::roll(&mut rng, &slot.y, y_abs_mean, y_abs_max);
                    let kind = prop.kind();
                    stats.proposed[kind] += 1;

                    let valid = match prop {
                        Proposal::Step { y_new, .. } => y_new >= 0 && (y_new as usize) < n_y,
                        Proposal::Swap { x } => {
                            let y_new = slot.y[x - 1] + (slot.y[x + 1] - slot.y[x]);
                            y_new >= 0 && (y_new as usize) < n_y
                        }
                        Proposal::ShiftLeft { x, dy }
                        | Proposal::ShiftAbsLeft { x, dy, .. } => {
                            kernels::shift_l_valid(n_y, x, dy, &slot.y)
                        }
                        Proposal::ShiftRight { x, dy }
                        | Proposal::ShiftAbsRight { x, dy, .. } => {
                            kernels::shift_r_valid(n_y, x, dy, &slot.y)
                        }
                    };
                    if !valid {
                        continue;
                    }
                    stats.valid[kind] += 1;

                    // Prior delta first: a hopeless prior skips the
                    // line-integral work entirely.
                    let d_log_prior = match prop {
                        Proposal::Step { x, y_new } => {
                            slot.prior_image
                                .log_prior_diff_step(x, &slot.y, y_new, inv_sigma_dy_neg)
                        }
                        Proposal::Swap { x } => {
                            slot.prior_image
                                .log_prior_diff_swap(x, &slot.y, inv_sigma_dy_neg)
                        }
                        Proposal::ShiftLeft { x, dy }
                        | Proposal::ShiftAbsLeft { x, dy, .. } => slot
                            .prior_image
                            .log_prior_diff_shift_l(x, dy, &slot.y, inv_sigma_dy_neg),
                        Proposal::ShiftRight { x, dy }
                        | Proposal::ShiftAbsRight { x, dy, .. } => slot
                            .prior_image
                            .log_prior_diff_shift_r(x, dy, &slot.y, inv_sigma_dy_neg),
                    };

                    let mut d_log_like = 0.;
                    if d_log_prior != f64::NEG_INFINITY {
                        match prop {
                            Proposal::Step { x, y_new } => kernels::diff_step(
                                stack,
                                x,
                                slot.y[x],
                                y_new,
                                &mut delta_line_int,
                            ),
                            Proposal::Swap { x } => {
                                kernels::diff_swap(stack, x, &slot.y, &mut delta_line_int)
                            }
                            Proposal::ShiftLeft { x, dy }
                            | Proposal::ShiftAbsLeft { x, dy, .. } => kernels::diff_shift_l(
                                stack,
                                x,
                                dy,
                                &slot.y,
                                &mut delta_line_int,
                            ),
                            Proposal::ShiftRight { x, dy }
                            | Proposal::ShiftAbsRight { x, dy, .. } => kernels::diff_shift_r(
                                stack,
                                x,
                                dy,
                                &slot.y,
                                &mut delta_line_int,
                            ),
                        }

                        for k in 0..n_stars {
                            let zeta = delta_line_int[k] / (slot.line_int[k] + epsilon);
                            d_log_like += ln_one_plus(zeta);
                        }
                    }

                    let alpha =
                        beta * (d_log_like + d_log_prior) + prop.ln_proposal_factor();

                    let accept = alpha > 0.
                        || (alpha > LN_ACCEPT_CUTOFF && alpha.exp() > rng.gen::<f64>());
                    if !accept {
                        continue;
                    }
                    stats.accepted[kind] += 1;

                    match prop {
                        Proposal::Step { x, y_new } => slot.y[x] = y_new,
                        Proposal::Swap { x } => {
                            slot.y[x] = slot.y[x - 1] + (slot.y[x + 1] - slot.y[x])
                        }
                        Proposal::ShiftLeft { x, dy }
                        | Proposal::ShiftAbsLeft { x, dy, .. } => {
                            for v in &mut slot.y[..=x] {
                                *v += dy;
                            }
                        }
                        Proposal::ShiftRight { x, dy }
                        | Proposal::ShiftAbsRight { x, dy, .. } => {
                            for v in &mut slot.y[x..] {
                                *v += dy;
                            }
                        }
                    }

                    for (li, d) in slot.line_int.iter_mut().zip(&delta_line_int) {
                        *li += d;
                    }
                    slot.log_like += d_log_like;
                    slot.log_prior += d_log_prior;

                    // Periodic exact recomputation caps the drift of
                    // the running quantities.
                    recalculate_in[t] -= 1;
                    if recalculate_in[t] == 0 {
                        recalculate_in[t] = settings.recalculate_every;
                        kernels::line_integrals(stack, &slot.y, &mut slot.line_int);

                        let exact = slot.prior_image.log_prior(&slot.y, inv_sigma_dy_neg);
                        if (exact - slot.log_prior).abs() > LOG_PRIOR_DRIFT_TOL {
                            warn!(
                                "log-prior drift {:.3e}; forcing refresh",
                                exact - slot.log_prior
                            );
                        }
                        slot.log_prior = exact;
                    }
                }
            }
        }

        // Save the retained temperatures before any swap.
        if swap >= n_swaps_burnin {
            save_in -= 1;
            if save_in == 0 {
                save_in = save_every;
                for t in 0..t_save_max {
                    let slot = &slots[t];
                    for (d, &yi) in y_dbl.iter_mut().zip(&slot.y) {
                        *d = yi as f64;
                    }
                    chains[t].push(&y_dbl, slot.log_like, slot.log_prior, 1.);
                    if bank.is_some() {
                        y_chain[t].extend_from_slice(&slot.y);
                        neighbor_chain[t].extend_from_slice(&slot.neighbors[1..]);
                    }
                }
            }
        }

        // Attempt one adjacent-pair swap.
        if n_t > 1 {
            let t1 = rng.gen_range(1..n_t);
            let t0 = t1 - 1;
            swaps_proposed[t0] += 1;

            let (pr_x0s0, pr_x0s1, pr_x1s0, pr_x1s1) = match bank {
                Some(bank) => {
                    let central_1 = bank.standardize_central(&slots[t1].y, y_zero);
                    let pr_x1s1 = bank.ln_prob(
                        &slots[t1].neighbors,
                        &central_1,
                        ladder.shift_weight[t1],
                        false,
                    );
                    let pr_x1s0 = bank.ln_prob(
                        &slots[t1].neighbors,
                        &central_1,
                        ladder.shift_weight[t0],
                        false,
                    );
                    let central_0 = bank.standardize_central(&slots[t0].y, y_zero);
                    let pr_x0s0 = bank.ln_prob(
                        &slots[t0].neighbors,
                        &central_0,
                        ladder.shift_weight[t0],
                        false,
                    );
                    let pr_x0s1 = bank.ln_prob(
                        &slots[t0].neighbors,
                        &central_0,
                        ladder.shift_weight[t1],
                        false,
                    );
                    (pr_x0s0, pr_x0s1, pr_x1s0, pr_x1s1)
                }
                None => {
                    let pr_x1s1 =
                        slots[t1].prior_image.log_prior(&slots[t1].y, inv_sigma_dy_neg);
                    let pr_x1s0 =
                        slots[t0].prior_image.log_prior(&slots[t1].y, inv_sigma_dy_neg);
                    let pr_x0s0 =
                        slots[t0].prior_image.log_prior(&slots[t0].y, inv_sigma_dy_neg);
                    let pr_x0s1 =
                        slots[t1].prior_image.log_prior(&slots[t0].y, inv_sigma_dy_neg);
                    (pr_x0s0, pr_x0s1, pr_x1s0, pr_x1s1)
                }
            };

            let mut log_like_t0 = slots[t0].log_like;
            let mut log_like_t1 = slots[t1].log_like;
            if let Some(bank) = bank {
                for pix in 1..bank.n_pix() {
                    log_like_t0 += bank.ln_like(pix, slots[t0].neighbors[pix] as usize);
                    log_like_t1 += bank.ln_like(pix, slots[t1].neighbors[pix] as usize);
                }
            }

            let alpha_like =
                (ladder.beta[t1] - ladder.beta[t0]) * (log_like_t0 - log_like_t1);
            let alpha_prior = ladder.beta[t0] * (pr_x1s0 - pr_x0s0)
                + ladder.beta[t1] * (pr_x0s1 - pr_x1s1);
            let alpha = alpha_like + alpha_prior;

            if alpha > 0. || (alpha > LN_ACCEPT_CUTOFF && alpha.exp() > rng.gen::<f64>()) {
                swaps_accepted[t0] += 1;
                slots.swap(t0, t1);
                // The swapped states keep their likelihoods; the
                // priors are re-expressed under the new rungs' shift
                // weights.
                slots[t1].log_prior = pr_x0s1;
                slots[t0].log_prior = pr_x1s0;
            }
        }
    }

    let chain_len = chains[0].len();

    // Marginalize the saved states over the neighbor configurations
    // visited by the coldest chain.
    if bank.is_some() && chain_len > 0 {
        let bank = bank.unwrap();
        let n_other = bank.n_pix() - 1;
        let mut neighbors_ws = vec![0u16; bank.n_pix()];
        let mut img = prior_builder.new_image();

        // prior_of[t][state * chain_len + config]
        let mut prior_of: Vec<Vec<f64>> =
            vec![vec![0.; chain_len * chain_len]; t_save_max];

        for i in 0..chain_len {
            neighbors_ws[0] = 0;
            neighbors_ws[1..].copy_from_slice(
                &neighbor_chain[0][i * n_other..(i + 1) * n_other],
            );

            // The central profile enters the shifted mean only through
            // pixel 0's couplings, which the prior image for pixel 0
            // never reads; the saved profile at index i keeps the
            // standardization consistent.
            let central =
                bank.standardize_central(&y_chain[0][i * n_x..(i + 1) * n_x], y_zero);
            prior_builder.build_into(
                Some((bank, &neighbors_ws, &central, ladder.shift_weight[0])),
                &mut img,
            );

            for t in 0..t_save_max {
                for k in 0..chain_len {
                    let y_k = &y_chain[t][k * n_x..(k + 1) * n_x];
                    prior_of[t][k * chain_len + i] = img.log_prior(y_k, inv_sigma_dy_neg);
                }
            }
        }

        let ln_chain_len = (chain_len as f64).ln();
        for t in 0..t_save_max {
            let mut log_w: Vec<f64> = (0..chain_len)
                .map(|k| {
                    let row = &prior_of[t][k * chain_len..(k + 1) * chain_len];
                    logsumexp(row) - ln_chain_len
                })
                .collect();
            let max = log_w.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            for (k, lw) in log_w.iter_mut().enumerate() {
                *lw -= max;
                chains[t].set_log_weight(k, *lw);
            }
        }
    }

    for kind in 0..N_PROPOSAL_KINDS {
        debug!(
            "{} proposals: {:.1}% valid, {:.1}% accepted",
            PROPOSAL_NAMES[kind],
            100. * stats.valid[kind] as f64 / stats.proposed[kind].max(1) as f64,
            100. * stats.acceptance(kind),
        );
    }

    let swap_acceptance: Vec<f64> = swaps_accepted
        .iter()
        .zip(&swaps_proposed)
        .map(|(&a, &p)| a as f64 / p.max(1) as f64)
        .collect();
    debug!("swap acceptance: {swap_acceptance:?}");

    let chains_out = chains
        .iter()
        .map(|chain| {
            let n = chain.len();
            let mut y = Array2::zeros((n, n_x));
            let mut log_like = Vec::with_capacity(n);
            let mut log_prior = Vec::with_capacity(n);
            let mut weight = Vec::with_capacity(n);
            for i in 0..n {
                for (x, &v) in chain.coords(i).iter().enumerate() {
                    y[(i, x)] = v as i32;
                }
                log_like.push(chain.log_like(i));
                log_prior.push(chain.log_prior(i));
                weight.push(chain.weight(i));
            }
            DiscreteTemperatureChain {
                y,
                log_like,
                log_prior,
                weight,
            }
        })
        .collect();

    DiscreteFit {
        chains: chains_out,
        proposal_stats: stats,
        swap_acceptance,
        converged: true,
        dm_min,
        dm_max,
        runtime: t_start.elapsed().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{RectGrid, E_AXIS, MU_AXIS};
    use crate::prior::LogNormalColumns;

    fn step_function_stack(n_e: usize, n_mu: usize) -> (ImageStack, Vec<i32>) {
        // Several identical stars whose posteriors follow a step: low
        // reddening out to the middle distance, then a jump. Multiple
        // stars sharpen the per-column likelihood.
        let grid = RectGrid::new([0., 4.], [n_e as f64 * 0.02, 19.], [n_e, n_mu]).unwrap();
        let mut truth = Vec::with_capacity(n_mu);
        let mut img = ndarray::Array2::from_elem((n_e, n_mu), 1e-8);
        for m in 0..n_mu {
            let y_true = if m < n_mu / 2 { 3 } else { 12 };
            truth.push(y_true as i32);
            for e in 0..n_e {
                let z = (e as f64 - y_true as f64) / 0.8;
                img[(e, m)] += (-0.5 * z * z).exp();
            }
        }
        let sum: f64 = img.iter().sum();
        img.mapv_inplace(|v| v / sum);
        let images = vec![img; 8];
        (ImageStack::new(images, grid).unwrap(), truth)
    }

    fn weak_columns(n_dists: usize) -> LogNormalColumns {
        LogNormalColumns {
            mu: vec![(0.05f64).ln(); n_dists + 1],
            sigma: vec![2.0; n_dists + 1],
        }
    }

    #[test]
    fn empty_stack_short_circuits() {
        let grid = RectGrid::new([0., 4.], [1., 19.], [20, 10]).unwrap();
        let stack = ImageStack::new(vec![], grid).unwrap();
        let builder = PriorImageBuilder::new(&weak_columns(10), stack.grid(), 1);
        let fit = sample_los_extinction_discrete(
            &stack,
            None,
            &builder,
            &DiscreteSettings::default(),
            1,
            None,
        );
        assert!(!fit.converged);
        assert_eq!(fit.chains[0].y.nrows(), 0);
    }

    #[test]
    fn single_temperature_recovers_step_profile() {
        let (stack, truth) = step_function_stack(24, 12);
        let builder = PriorImageBuilder::new(&weak_columns(12), stack.grid(), 1);
        let settings = DiscreteSettings {
            n_temperatures: 1,
            n_swaps: 400,
            n_save: 200,
            updates_per_swap: 1,
            central_steps_per_update: 4,
            burnin_frac: 0.25,
            ..Default::default()
        };
        let fit =
            sample_los_extinction_discrete(&stack, None, &builder, &settings, 17, None);
        let chain = &fit.chains[0];
        assert!(chain.y.nrows() >= 100);

        // Posterior mode per column within one bin of the step.
        for x in 0..12 {
            let mut counts = std::collections::HashMap::new();
            for i in 0..chain.y.nrows() {
                *counts.entry(chain.y[(i, x)]).or_insert(0usize) += 1;
            }
            let mode = *counts.iter().max_by_key(|(_, &c)| c).unwrap().0;
            assert!(
                (mode - truth[x]).abs() <= 1,
                "column {x}: mode {mode}, truth {}",
                truth[x]
            );
        }
    }

    #[test]
    fn cancellation_stops_early() {
        let (stack, _) = step_function_stack(24, 12);
        let builder = PriorImageBuilder::new(&weak_columns(12), stack.grid(), 1);
        let settings = DiscreteSettings {
            n_temperatures: 2,
            n_swaps: 100_000,
            n_save: 100,
            ..Default::default()
        };
        let cancel = AtomicBool::new(true);
        let fit = sample_los_extinction_discrete(
            &stack,
            None,
            &builder,
            &settings,
            3,
            Some(&cancel),
        );
        // Cancelled on the first iteration: nothing saved.
        assert_eq!(fit.chains[0].y.nrows(), 0);
    }

    #[test]
    fn identical_temperatures_always_swap() {
        // Detailed balance check: with two identical rungs the swap
        // acceptance must be exactly 1.
        let (stack, _) = step_function_stack(24, 12);
        let builder = PriorImageBuilder::new(&weak_columns(12), stack.grid(), 1);
        let settings = DiscreteSettings {
            n_temperatures: 2,
            beta_spacing: 1.0,
            log_shift_weight_min: -3.,
            log_shift_weight_max: -3.,
            n_swaps: 100,
            n_save: 50,
            updates_per_swap: 1,
            central_steps_per_update: 1,
            ..Default::default()
        };
        let fit =
            sample_los_extinction_discrete(&stack, None, &builder, &settings, 23, None);
        assert!(
            (fit.swap_acceptance[0] - 1.).abs() < 1e-12,
            "swap acceptance {}",
            fit.swap_acceptance[0]
        );
    }

    #[test]
    fn tempered_swaps_are_neither_free_nor_frozen() {
        // Two rungs at beta = (1.0, 0.5) on a peaked target: swaps
        // must happen at an intermediate rate.
        let (stack, _) = step_function_stack(24, 12);
        let builder = PriorImageBuilder::new(&weak_columns(12), stack.grid(), 1);
        let settings = DiscreteSettings {
            n_temperatures: 2,
            beta_spacing: 0.5,
            n_swaps: 800,
            n_save: 200,
            updates_per_swap: 1,
            central_steps_per_update: 2,
            ..Default::default()
        };
        let fit =
            sample_los_extinction_discrete(&stack, None, &builder, &settings, 31, None);
        let rate = fit.swap_acceptance[0];
        assert!(
            rate > 0.05 && rate < 0.95,
            "swap acceptance {rate} outside the tempered band"
        );
    }

    #[test]
    fn grid_axes_used_consistently() {
        let (stack, _) = step_function_stack(24, 12);
        assert_eq!(stack.grid().n_bins(E_AXIS), 24);
        assert_eq!(stack.grid().n_bins(MU_AXIS), 12);
    }
}
