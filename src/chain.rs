//! Accumulation of accepted states and convergence diagnostics.

use serde::{Deserialize, Serialize};

/// An append-only record of accepted sampler states.
///
/// Each point carries its coordinates, log-likelihood, log-prior and a
/// weight. The discrete sampler later overwrites the weights with
/// marginal probabilities; everything else is immutable once pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    n_dim: usize,
    capacity: usize,
    coords: Vec<f64>,
    log_like: Vec<f64>,
    log_prior: Vec<f64>,
    weight: Vec<f64>,
}

impl Chain {
    pub fn new(n_dim: usize, capacity: usize) -> Self {
        Chain {
            n_dim,
            capacity,
            coords: Vec::with_capacity(n_dim * capacity),
            log_like: Vec::with_capacity(capacity),
            log_prior: Vec::with_capacity(capacity),
            weight: Vec::with_capacity(capacity),
        }
    }

    pub fn n_dim(&self) -> usize {
        self.n_dim
    }

    pub fn len(&self) -> usize {
        self.log_like.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_like.is_empty()
    }

    /// Append a state. Silently drops the point once the chain is full;
    /// drivers size the capacity with head-room so this only guards
    /// against runaway saving.
    pub fn push(&mut self, coords: &[f64], log_like: f64, log_prior: f64, weight: f64) {
        assert_eq!(coords.len(), self.n_dim);
        if self.len() >= self.capacity {
            return;
        }
        self.coords.extend_from_slice(coords);
        self.log_like.push(log_like);
        self.log_prior.push(log_prior);
        self.weight.push(weight);
    }

    pub fn coords(&self, idx: usize) -> &[f64] {
        &self.coords[idx * self.n_dim..(idx + 1) * self.n_dim]
    }

    pub fn log_like(&self, idx: usize) -> f64 {
        self.log_like[idx]
    }

    pub fn log_prior(&self, idx: usize) -> f64 {
        self.log_prior[idx]
    }

    pub fn weight(&self, idx: usize) -> f64 {
        self.weight[idx]
    }

    /// Replace the weight of point `idx` with `exp(log_weight)`.
    pub fn set_log_weight(&mut self, idx: usize, log_weight: f64) {
        self.weight[idx] = log_weight.exp();
    }

    /// The stored point with the highest log-posterior.
    pub fn best(&self) -> Option<&[f64]> {
        let mut best = None;
        let mut best_logp = f64::NEG_INFINITY;
        for i in 0..self.len() {
            let logp = self.log_like[i] + self.log_prior[i];
            if logp > best_logp {
                best_logp = logp;
                best = Some(i);
            }
        }
        best.map(|i| self.coords(i))
    }

    pub fn clear(&mut self) {
        self.coords.clear();
        self.log_like.clear();
        self.log_prior.clear();
        self.weight.clear();
    }

    /// Weighted per-component mean of the stored points.
    pub fn mean(&self) -> Vec<f64> {
        let mut mean = vec![0.; self.n_dim];
        let mut w_sum = 0.;
        for i in 0..self.len() {
            let w = self.weight[i];
            w_sum += w;
            for (m, &c) in mean.iter_mut().zip(self.coords(i)) {
                *m += w * c;
            }
        }
        if w_sum > 0. {
            for m in &mut mean {
                *m /= w_sum;
            }
        }
        mean
    }
}

/// A monotone reparameterization applied before computing the
/// Gelman-Rubin statistic.
///
/// The raw log-increment coordinates mix badly across components; the
/// diagnostic is computed on the cumulative profile instead, which
/// makes it invariant to the monotone map from increments to the
/// physical curve.
pub trait ParamTransform: Sync {
    fn transform(&self, x: &[f64], out: &mut [f64]);
}

/// Cumulative reddening transform for the piecewise-linear model:
/// `y_0 = exp(x_0)`, `y_i = y_{i-1} + exp(x_i)`.
pub struct CumulativeReddening;

impl ParamTransform for CumulativeReddening {
    fn transform(&self, x: &[f64], out: &mut [f64]) {
        let mut acc = 0.;
        for (o, &v) in out.iter_mut().zip(x) {
            acc += v.exp();
            *o = acc;
        }
    }
}

/// Transform for the cloud model: distances pass through, reddening
/// depths are exponentiated.
pub struct CloudTransform {
    pub n_clouds: usize,
}

impl ParamTransform for CloudTransform {
    fn transform(&self, x: &[f64], out: &mut [f64]) {
        for i in 0..self.n_clouds {
            out[i] = x[i];
            out[self.n_clouds + i] = x[self.n_clouds + i].exp();
        }
    }
}

/// Per-component Gelman-Rubin statistic over a set of chains, computed
/// in the transformed space.
///
/// Returns one value per dimension; values near 1 indicate that the
/// between-chain variance has collapsed onto the within-chain variance.
pub fn gelman_rubin_transformed(chains: &[&Chain], transform: &dyn ParamTransform) -> Vec<f64> {
    assert!(chains.len() >= 2, "need at least two chains");
    let n_dim = chains[0].n_dim();
    let m = chains.len() as f64;

    let mut chain_mean = vec![vec![0.0f64; n_dim]; chains.len()];
    let mut chain_var = vec![vec![0.0f64; n_dim]; chains.len()];
    let mut buf = vec![0.0f64; n_dim];

    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    assert!(n >= 2, "chains too short for a variance estimate");
    let n_f = n as f64;

    for (c_idx, chain) in chains.iter().enumerate() {
        for i in 0..n {
            transform.transform(chain.coords(i), &mut buf);
            for (d, &v) in buf.iter().enumerate() {
                chain_mean[c_idx][d] += v;
            }
        }
        for v in &mut chain_mean[c_idx] {
            *v /= n_f;
        }
        for i in 0..n {
            transform.transform(chain.coords(i), &mut buf);
            for (d, &v) in buf.iter().enumerate() {
                let diff = v - chain_mean[c_idx][d];
                chain_var[c_idx][d] += diff * diff;
            }
        }
        for v in &mut chain_var[c_idx] {
            *v /= n_f - 1.;
        }
    }

    (0..n_dim)
        .map(|d| {
            let grand_mean: f64 = chain_mean.iter().map(|cm| cm[d]).sum::<f64>() / m;
            let b: f64 = n_f / (m - 1.)
                * chain_mean
                    .iter()
                    .map(|cm| (cm[d] - grand_mean) * (cm[d] - grand_mean))
                    .sum::<f64>();
            let w: f64 = chain_var.iter().map(|cv| cv[d]).sum::<f64>() / m;
            if w <= 0. {
                return 1.;
            }
            let var_plus = (n_f - 1.) / n_f * w + b / n_f;
            (var_plus / w).sqrt()
        })
        .collect()
}
