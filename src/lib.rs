//! Sample line-of-sight dust reddening profiles from stacks of
//! per-star posterior images in (distance modulus, reddening).
//!
//! Three samplers share the stellar-image machinery:
//!
//! - [`continuous::sample_los_extinction`]: an affine-invariant
//!   ensemble over the log increments of a piecewise-linear profile.
//! - [`clouds::sample_los_extinction_clouds`]: the same engine over a
//!   small number of discrete clouds.
//! - [`discrete::sample_los_extinction_discrete`]: a parallel-tempered
//!   sampler over integer reddening bins, optionally coupled to
//!   neighboring sky pixels through a Gaussian-process prior over
//!   pre-computed reddening libraries.
//!
//! The stellar forward model, sky-map file formats and the Galactic
//! density model stay outside the crate; they enter only through the
//! [`ImageStack`], [`ChainStore`] and [`GalacticLosModel`] contracts.
//!
//! ## Usage
//!
//! ```no_run
//! use dustmc::{
//!     ChainStore, DiscreteSettings, ImageStack, LogNormalColumns, MemoryStore, PixelKey,
//!     PriorImageBuilder, RectGrid,
//! };
//! use ndarray::Array2;
//!
//! // One star with a flat posterior over a small grid.
//! let grid = RectGrid::new([0., 4.], [1., 19.], [50, 20]).unwrap();
//! let images = vec![Array2::from_elem((50, 20), 1e-4)];
//! let stack = ImageStack::new(images, grid).unwrap();
//!
//! // A weak log-normal prior on each distance column.
//! let columns = LogNormalColumns {
//!     mu: vec![(0.05f64).ln(); 21],
//!     sigma: vec![2.0; 21],
//! };
//! let builder = PriorImageBuilder::new(&columns, stack.grid(), 1);
//!
//! let fit = dustmc::discrete::sample_los_extinction_discrete(
//!     &stack,
//!     None,
//!     &builder,
//!     &DiscreteSettings::default(),
//!     42,
//!     None,
//! );
//!
//! let store = MemoryStore::new();
//! let key = PixelKey::from_nested(64, 1234);
//! store.create_group(&key).unwrap();
//! for (name, data) in dustmc::storage::discrete_datasets(fit) {
//!     store.write(&key, &name, data).unwrap();
//! }
//! ```

pub mod chain;
pub mod clouds;
pub mod continuous;
pub mod discrete;
pub mod ensemble;
pub mod error;
pub mod galactic;
pub mod grid;
pub mod line_integral;
pub mod math;
pub mod neighbors;
pub mod prior;
pub mod settings;
pub mod stack;
pub mod storage;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use log::info;
use rayon::prelude::*;

pub use chain::{Chain, CloudTransform, CumulativeReddening, ParamTransform};
pub use clouds::{sample_los_extinction_clouds, CloudsFit, CloudsPosterior};
pub use continuous::{sample_los_extinction, LosFit, LosPosterior, SkewPrior};
pub use discrete::{sample_los_extinction_discrete, DiscreteFit};
pub use ensemble::{EnsembleSampler, LogProbFn, ParallelEnsemble, ReversibleMove};
pub use error::{BankError, GridError, StackError, StoreError};
pub use galactic::GalacticLosModel;
pub use grid::{RectGrid, E_AXIS, MU_AXIS};
pub use neighbors::{CentralProfile, NeighborPixelBank};
pub use prior::{LogNormalColumns, PriorImage, PriorImageBuilder};
pub use settings::{DiscreteSettings, McmcOptions, TemperatureLadder};
pub use stack::ImageStack;
pub use storage::{ChainStore, MemoryStore, PixelDataset, PixelKey};

/// Everything one sky pixel needs for a discrete run.
///
/// Tasks are independent and are dispatched in parallel; each one
/// writes its datasets under its own key before the next task of the
/// same worker starts.
pub struct DiscretePixelTask {
    pub key: PixelKey,
    pub stack: ImageStack,
    pub bank: Option<NeighborPixelBank>,
    pub prior_columns: LogNormalColumns,
}

/// Run the discrete sampler over many pixels in parallel and persist
/// every result.
///
/// Pixels are embarrassingly parallel; output order is unspecified but
/// every dataset is tagged by its pixel key. The cancellation flag is
/// polled between swap iterations inside each pixel.
pub fn run_discrete_pixels(
    tasks: Vec<DiscretePixelTask>,
    store: &dyn ChainStore,
    settings: &DiscreteSettings,
    seed: u64,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<()> {
    let results: Vec<Result<()>> = tasks
        .into_par_iter()
        .enumerate()
        .map(|(i, mut task)| {
            let builder = PriorImageBuilder::new(
                &task.prior_columns,
                task.stack.grid(),
                settings.priors_subsampling,
            );
            if let Some(bank) = task.bank.as_mut() {
                bank.apply_priors(
                    builder.mu0(),
                    builder.sigma0(),
                    task.stack.grid().step(E_AXIS),
                );
            }

            let fit = sample_los_extinction_discrete(
                &task.stack,
                task.bank.as_ref(),
                &builder,
                settings,
                seed.wrapping_add(i as u64),
                cancel.as_deref(),
            );

            store.create_group(&task.key)?;
            for (name, data) in storage::discrete_datasets(fit) {
                store.write(&task.key, &name, data)?;
            }
            info!("pixel {} written", task.key);
            Ok(())
        })
        .collect();

    for r in results {
        r?;
    }
    Ok(())
}

/// Per-pixel input for the ensemble-based piecewise-linear run.
pub struct LosPixelTask {
    pub key: PixelKey,
    pub stack: ImageStack,
    /// Per-star log-evidences for the p0/Z likelihood softening.
    pub ln_z: Vec<f64>,
    /// Per-star subpixel scalings of the E axis.
    pub subpixel: Vec<f64>,
    /// Bad-star floor density.
    pub p0: f64,
    pub n_regions: usize,
    pub ebv_max: Option<f64>,
    /// Galactic prior on the log increments; the fallback Gaussian is
    /// used when absent.
    pub prior: Option<SkewPrior>,
}

/// Run the piecewise-linear sampler over many pixels in parallel.
pub fn run_los_pixels(
    tasks: Vec<LosPixelTask>,
    store: &dyn ChainStore,
    options: &McmcOptions,
    n_save: usize,
    seed: u64,
) -> Result<()> {
    let results: Vec<Result<()>> = tasks
        .into_par_iter()
        .enumerate()
        .map(|(i, task)| {
            let mut posterior = LosPosterior::new(
                &task.stack,
                task.n_regions,
                &task.ln_z,
                task.p0,
                task.ebv_max,
            )?;
            posterior.set_subpixel(&task.subpixel);
            if let Some(prior) = task.prior {
                posterior.set_prior(prior);
            }

            let fit = sample_los_extinction(
                &mut posterior,
                options,
                n_save,
                seed.wrapping_add(i as u64),
            );

            store.create_group(&task.key)?;
            store.write(&task.key, "los", fit.into())?;
            info!("pixel {} written", task.key);
            Ok(())
        })
        .collect();

    for r in results {
        r?;
    }
    Ok(())
}
