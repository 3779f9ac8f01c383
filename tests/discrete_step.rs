//! End-to-end discrete run on a star whose posterior is a step
//! function in distance.

use dustmc::{
    sample_los_extinction_discrete, DiscreteSettings, ImageStack, LogNormalColumns,
    PriorImageBuilder, RectGrid, E_AXIS, MU_AXIS,
};
use ndarray::Array2;

fn step_stack(n_e: usize, n_mu: usize, y_near: usize, y_far: usize) -> (ImageStack, Vec<i32>) {
    let grid = RectGrid::new([0., 4.], [n_e as f64 * 0.02, 19.], [n_e, n_mu]).unwrap();
    let mut truth = Vec::with_capacity(n_mu);
    let mut img = Array2::from_elem((n_e, n_mu), 1e-8);
    for m in 0..n_mu {
        let y_true = if m < n_mu / 2 { y_near } else { y_far };
        truth.push(y_true as i32);
        for e in 0..n_e {
            let z = (e as f64 - y_true as f64) / 0.8;
            img[(e, m)] += (-0.5 * z * z).exp();
        }
    }
    let sum: f64 = img.iter().sum();
    img.mapv_inplace(|v| v / sum);
    // Identical stars multiply the likelihood and sharpen the column
    // modes the test checks.
    let images = vec![img; 10];
    (ImageStack::new(images, grid).unwrap(), truth)
}

#[test]
fn posterior_mode_matches_step_within_one_bin() {
    let (stack, truth) = step_stack(30, 16, 4, 15);
    assert_eq!(stack.grid().n_bins(E_AXIS), 30);
    assert_eq!(stack.grid().n_bins(MU_AXIS), 16);

    let columns = LogNormalColumns {
        mu: vec![(0.05f64).ln(); 17],
        sigma: vec![2.0; 17],
    };
    let builder = PriorImageBuilder::new(&columns, stack.grid(), 1);

    let settings = DiscreteSettings {
        n_temperatures: 1,
        n_swaps: 600,
        n_save: 300,
        updates_per_swap: 1,
        central_steps_per_update: 4,
        burnin_frac: 0.25,
        ..Default::default()
    };

    let fit = sample_los_extinction_discrete(&stack, None, &builder, &settings, 1234, None);
    assert!(fit.converged);
    let chain = &fit.chains[0];
    assert!(chain.y.nrows() >= 150);

    for x in 0..16 {
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
fn step_acceptance_on_flat_posterior_is_near_prior_only_rate() {
    // With a perfectly flat image the likelihood deltas vanish, so the
    // step-proposal acceptance reflects the prior alone and must stay
    // strictly between 0 and 1.
    let grid = RectGrid::new([0., 4.], [0.8, 19.], [40, 12]).unwrap();
    let stack =
        ImageStack::new(vec![Array2::from_elem((40, 12), 1e-4)], grid).unwrap();
    let columns = LogNormalColumns {
        mu: vec![(0.1f64).ln(); 13],
        sigma: vec![2.0; 13],
    };
    let builder = PriorImageBuilder::new(&columns, stack.grid(), 1);
    let settings = DiscreteSettings {
        n_temperatures: 1,
        n_swaps: 500,
        n_save: 100,
        updates_per_swap: 1,
        central_steps_per_update: 8,
        ..Default::default()
    };

    let fit = sample_los_extinction_discrete(&stack, None, &builder, &settings, 9, None);
    let rate = fit.proposal_stats.acceptance(0);
    assert!(rate > 0.05 && rate < 0.95, "step acceptance {rate}");
}
