//! Proposal taxonomy of the discrete sampler.
//!
//! Six kinds, drawn with weights 4:4:1:1:1:1 out of twelve: bump one
//! bin, swap adjacent jumps, shift everything left/right of a column
//! by one, or jump the shifted block to an absolute level drawn from a
//! truncated exponential.

use rand::Rng;

pub const N_PROPOSAL_KINDS: usize = 6;

pub const PROPOSAL_NAMES: [&str; N_PROPOSAL_KINDS] = [
    "step",
    "swap",
    "shift_l",
    "shift_r",
    "shift_abs_l",
    "shift_abs_r",
];

/// A fully specified move; the payload carries exactly the indices the
/// corresponding incremental kernel needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    /// Bump column `x` to `y_new` (a +-1 step).
    Step { x: usize, y_new: i32 },
    /// Swap the jumps at `x` and `x + 1`; requires `1 <= x <= n-2`.
    Swap { x: usize },
    /// Shift `y[0..=x]` by `dy`.
    ShiftLeft { x: usize, dy: i32 },
    /// Shift `y[x..]` by `dy`.
    ShiftRight { x: usize, dy: i32 },
    /// Shift `y[0..=x]` so that column `x` lands on an absolute level
    /// drawn from a truncated exponential.
    ShiftAbsLeft {
        x: usize,
        dy: i32,
        ln_proposal_factor: f64,
    },
    /// Same, shifting `y[x..]`.
    ShiftAbsRight {
        x: usize,
        dy: i32,
        ln_proposal_factor: f64,
    },
}

impl Proposal {
    pub fn kind(&self) -> usize {
        match self {
            Proposal::Step { .. } => 0,
            Proposal::Swap { .. } => 1,
            Proposal::ShiftLeft { .. } => 2,
            Proposal::ShiftRight { .. } => 3,
            Proposal::ShiftAbsLeft { .. } => 4,
            Proposal::ShiftAbsRight { .. } => 5,
        }
    }

    /// The log-proposal asymmetry correction; zero for the symmetric
    /// kinds.
    pub fn ln_proposal_factor(&self) -> f64 {
        match self {
            Proposal::ShiftAbsLeft {
                ln_proposal_factor, ..
            }
            | Proposal::ShiftAbsRight {
                ln_proposal_factor, ..
            } => *ln_proposal_factor,
            _ => 0.,
        }
    }

    /// Draw a proposal for the profile `y`.
    ///
    /// `y_abs_mean` and `y_abs_max` parameterize the truncated
    /// exponential of the absolute-shift kinds.
    pub fn roll<R: Rng + ?Sized>(
        rng: &mut R,
        y: &[i32],
        y_abs_mean: f64,
        y_abs_max: f64,
    ) -> Proposal {
        let n_x = y.len();
        match rng.gen_range(0..12u32) {
            0..=3 => {
                let x = rng.gen_range(0..n_x);
                let dy = if rng.gen::<bool>() { 1 } else { -1 };
                Proposal::Step { x, y_new: y[x] + dy }
            }
            4..=7 => Proposal::Swap {
                x: rng.gen_range(0..n_x - 2) + 1,
            },
            8 => Proposal::ShiftLeft {
                x: rng.gen_range(0..n_x - 1),
                dy: if rng.gen::<bool>() { 1 } else { -1 },
            },
            9 => Proposal::ShiftRight {
                x: rng.gen_range(0..n_x - 1),
                dy: if rng.gen::<bool>() { 1 } else { -1 },
            },
            10 => {
                let (x, dy, f) = roll_shift_abs(rng, y, y_abs_mean, y_abs_max);
                Proposal::ShiftAbsLeft {
                    x,
                    dy,
                    ln_proposal_factor: f,
                }
            }
            _ => {
                let (x, dy, f) = roll_shift_abs(rng, y, y_abs_mean, y_abs_max);
                Proposal::ShiftAbsRight {
                    x,
                    dy,
                    ln_proposal_factor: f,
                }
            }
        }
    }
}

/// Exponential variate with rate `lambda`, truncated to `[0, tau)`.
fn truncated_exponential<R: Rng + ?Sized>(rng: &mut R, lambda: f64, tau: f64) -> f64 {
    let u = rng.gen::<f64>();
    -(1. - (1. - (-lambda * tau).exp()) * u).ln() / lambda
}

fn roll_shift_abs<R: Rng + ?Sized>(
    rng: &mut R,
    y: &[i32],
    y_abs_mean: f64,
    y_abs_max: f64,
) -> (usize, i32, f64) {
    let x = rng.gen_range(0..y.len() - 1);
    let lambda = 1. / y_abs_mean;
    let y_target = truncated_exponential(rng, lambda, y_abs_max) as i32;
    let dy = y_target - y[x];
    (x, dy, lambda * dy as f64)
}
