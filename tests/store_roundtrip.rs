//! Chain write/read round-trip through the keyed store.

use dustmc::storage::{discrete_datasets, PixelDataset};
use dustmc::{
    sample_los_extinction_discrete, ChainStore, DiscreteSettings, ImageStack,
    LogNormalColumns, MemoryStore, PixelKey, PriorImageBuilder, RectGrid,
};
use ndarray::Array2;

#[test]
fn discrete_chain_survives_write_and_read() {
    let grid = RectGrid::new([0., 4.], [0.6, 19.], [30, 10]).unwrap();
    let stack = ImageStack::new(vec![Array2::from_elem((30, 10), 1e-4)], grid).unwrap();
    let columns = LogNormalColumns {
        mu: vec![(0.05f64).ln(); 11],
        sigma: vec![2.0; 11],
    };
    let builder = PriorImageBuilder::new(&columns, stack.grid(), 1);
    let settings = DiscreteSettings {
        n_temperatures: 2,
        n_swaps: 200,
        n_save: 100,
        save_all_temperatures: true,
        updates_per_swap: 1,
        central_steps_per_update: 2,
        ..Default::default()
    };

    let fit = sample_los_extinction_discrete(&stack, None, &builder, &settings, 55, None);
    let expected: Vec<_> = fit.chains.clone();

    let store = MemoryStore::new();
    let key = PixelKey::from_nested(8, 77);
    store.create_group(&key).unwrap();
    for (name, data) in discrete_datasets(fit) {
        store.write(&key, &name, data).unwrap();
    }

    for (t, chain) in expected.iter().enumerate() {
        let name = if t == 0 {
            "discrete-los".to_string()
        } else {
            format!("discrete-los/{t}")
        };
        let read = store.read(&key, &name).unwrap();
        let PixelDataset::DiscreteLos {
            y,
            log_like,
            log_prior,
            weight,
            dm_min,
            dm_max,
            runtime,
        } = read
        else {
            panic!("wrong dataset type under {name}");
        };

        // Integer profiles must survive byte-exactly.
        assert_eq!(y, chain.y);

        for (a, b) in log_like.iter().zip(&chain.log_like) {
            assert!((a - b).abs() <= 1e-7, "log_like {a} vs {b}");
        }
        for (a, b) in log_prior.iter().zip(&chain.log_prior) {
            assert!((a - b).abs() <= 1e-7);
        }
        assert_eq!(weight.len(), chain.weight.len());
        assert!(dm_min < dm_max);
        assert!(runtime >= 0.);
    }
}
