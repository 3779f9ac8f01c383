//! Keyed hierarchical output store.
//!
//! Results are addressed by a digit path mirroring a nested sky
//! pixelization: the first digit selects one of twelve level-0 cells,
//! each further digit one of four children. Writers locate the deepest
//! group that already exists along the path and attach the dataset
//! there, so coarse stores transparently absorb fine-grained keys.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use ndarray::Array2;

use crate::clouds::CloudsFit;
use crate::continuous::LosFit;
use crate::discrete::DiscreteFit;
use crate::error::StoreError;

/// A nested-pixel key: digit 0 in `0..12`, every further digit in
/// `0..4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PixelKey {
    digits: Vec<u8>,
}

impl PixelKey {
    pub fn new(digits: Vec<u8>) -> Self {
        debug_assert!(digits.first().map_or(true, |&d| d < 12));
        debug_assert!(digits.iter().skip(1).all(|&d| d < 4));
        PixelKey { digits }
    }

    /// Convert an (nside, pixel index) pair in the nested scheme to
    /// its digit path.
    pub fn from_nested(nside: u32, pix_idx: u32) -> Self {
        let mut n_levels = 1usize;
        let mut n = nside;
        while n > 1 {
            n >>= 1;
            n_levels += 1;
        }

        let mut digits = vec![0u8; n_levels];
        let mut idx = pix_idx;
        for i in 0..n_levels - 1 {
            let d = (idx % 4) as u8;
            digits[n_levels - i - 1] = d;
            idx /= 4;
        }
        digits[0] = (idx % 12) as u8;
        PixelKey { digits }
    }

    pub fn digits(&self) -> &[u8] {
        &self.digits
    }
}

impl fmt::Display for PixelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.digits {
            write!(f, "/{d}")?;
        }
        Ok(())
    }
}

/// One stored dataset.
#[derive(Debug, Clone)]
pub enum PixelDataset {
    /// Piecewise-linear samples: log increments with convergence
    /// diagnostics and distance watermarks.
    Los {
        samples: Array2<f64>,
        gelman_rubin: Vec<f64>,
        converged: bool,
        dm_min: f64,
        dm_max: f64,
    },
    /// Cloud samples in (delta_mu.., log_delta_ebv..) order.
    Clouds {
        samples: Array2<f64>,
        gelman_rubin: Vec<f64>,
        converged: bool,
    },
    /// Discrete profile samples for one temperature.
    DiscreteLos {
        y: Array2<i32>,
        log_like: Vec<f64>,
        log_prior: Vec<f64>,
        weight: Vec<f64>,
        dm_min: f64,
        dm_max: f64,
        runtime: f64,
    },
}

impl From<LosFit> for PixelDataset {
    fn from(fit: LosFit) -> Self {
        PixelDataset::Los {
            samples: fit.samples,
            gelman_rubin: fit.gelman_rubin,
            converged: fit.converged,
            dm_min: fit.dm_min,
            dm_max: fit.dm_max,
        }
    }
}

impl From<CloudsFit> for PixelDataset {
    fn from(fit: CloudsFit) -> Self {
        PixelDataset::Clouds {
            samples: fit.samples,
            gelman_rubin: fit.gelman_rubin,
            converged: fit.converged,
        }
    }
}

/// Split a discrete fit into its per-temperature datasets, named
/// `discrete-los` for the coldest and `discrete-los/<t>` for the rest.
pub fn discrete_datasets(fit: DiscreteFit) -> Vec<(String, PixelDataset)> {
    let (dm_min, dm_max, runtime) = (fit.dm_min, fit.dm_max, fit.runtime);
    fit.chains
        .into_iter()
        .enumerate()
        .map(|(t, chain)| {
            let name = if t == 0 {
                "discrete-los".to_string()
            } else {
                format!("discrete-los/{t}")
            };
            (
                name,
                PixelDataset::DiscreteLos {
                    y: chain.y,
                    log_like: chain.log_like,
                    log_prior: chain.log_prior,
                    weight: chain.weight,
                    dm_min,
                    dm_max,
                    runtime,
                },
            )
        })
        .collect()
}

/// Write access to a hierarchical chain store.
///
/// Implementations serialize writes internally; one store is shared by
/// all pixel tasks.
pub trait ChainStore: Send + Sync {
    /// Create a group at exactly this digit path, so later writes can
    /// resolve against it.
    fn create_group(&self, key: &PixelKey) -> Result<(), StoreError>;

    /// Attach `data` under `name` at the deepest existing group along
    /// `key`'s path.
    fn write(&self, key: &PixelKey, name: &str, data: PixelDataset) -> Result<(), StoreError>;

    /// Read a dataset back from the deepest existing group along the
    /// path.
    fn read(&self, key: &PixelKey, name: &str) -> Result<PixelDataset, StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    groups: HashSet<Vec<u8>>,
    datasets: HashMap<(Vec<u8>, String), PixelDataset>,
}

impl MemoryStoreInner {
    /// The deepest prefix of `digits` for which a group exists. The
    /// root (empty prefix) always exists.
    fn resolve(&self, digits: &[u8]) -> Vec<u8> {
        let mut deepest = Vec::new();
        let mut prefix = Vec::with_capacity(digits.len());
        for &d in digits {
            prefix.push(d);
            if self.groups.contains(&prefix) {
                deepest = prefix.clone();
            }
        }
        deepest
    }
}

/// In-memory [`ChainStore`], mainly for tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.datasets.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainStore for MemoryStore {
    fn create_group(&self, key: &PixelKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        // All ancestors exist implicitly once a group is created.
        let digits = key.digits();
        for depth in 1..=digits.len() {
            inner.groups.insert(digits[..depth].to_vec());
        }
        Ok(())
    }

    fn write(&self, key: &PixelKey, name: &str, data: PixelDataset) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let group = inner.resolve(key.digits());
        let slot = (group, name.to_string());
        if let Some(existing) = inner.datasets.get(&slot) {
            let conflicting = std::mem::discriminant(existing) != std::mem::discriminant(&data);
            if conflicting {
                return Err(StoreError::TypeConflict {
                    key: key.to_string(),
                    name: name.to_string(),
                });
            }
        }
        inner.datasets.insert(slot, data);
        Ok(())
    }

    fn read(&self, key: &PixelKey, name: &str) -> Result<PixelDataset, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let group = inner.resolve(key.digits());
        inner
            .datasets
            .get(&(group, name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::MissingDataset {
                key: key.to_string(),
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_key_round_trips_digits() {
        // nside 16 has 5 digit levels; reconstruct the index.
        let key = PixelKey::from_nested(16, 1 + 4 * 3 + 16 * 1 + 64 * 0 + 256 * 10);
        assert_eq!(key.digits(), &[10, 0, 1, 3, 1]);
        assert_eq!(key.to_string(), "/10/0/1/3/1");
    }

    #[test]
    fn nside_one_keeps_only_base_digit() {
        let key = PixelKey::from_nested(1, 7);
        assert_eq!(key.digits(), &[7]);
    }

    #[test]
    fn write_lands_at_deepest_existing_group() {
        let store = MemoryStore::new();
        let coarse = PixelKey::new(vec![3, 1]);
        store.create_group(&coarse).unwrap();

        let fine = PixelKey::new(vec![3, 1, 2, 0]);
        store
            .write(
                &fine,
                "los",
                PixelDataset::Los {
                    samples: Array2::zeros((2, 3)),
                    gelman_rubin: vec![1.0; 3],
                    converged: true,
                    dm_min: 4.,
                    dm_max: 19.,
                },
            )
            .unwrap();

        // Readable through any key sharing the coarse prefix.
        let sibling = PixelKey::new(vec![3, 1, 0, 0]);
        assert!(store.read(&sibling, "los").is_ok());
    }

    #[test]
    fn missing_dataset_is_an_error() {
        let store = MemoryStore::new();
        let key = PixelKey::new(vec![0]);
        assert!(matches!(
            store.read(&key, "los"),
            Err(StoreError::MissingDataset { .. })
        ));
    }

    #[test]
    fn type_conflicts_are_fatal() {
        let store = MemoryStore::new();
        let key = PixelKey::new(vec![5]);
        store.create_group(&key).unwrap();
        store
            .write(
                &key,
                "x",
                PixelDataset::Clouds {
                    samples: Array2::zeros((1, 2)),
                    gelman_rubin: vec![1., 1.],
                    converged: true,
                },
            )
            .unwrap();
        let err = store.write(
            &key,
            "x",
            PixelDataset::DiscreteLos {
                y: Array2::zeros((1, 2)),
                log_like: vec![0.],
                log_prior: vec![0.],
                weight: vec![1.],
                dm_min: 4.,
                dm_max: 19.,
                runtime: 0.,
            },
        );
        assert!(matches!(err, Err(StoreError::TypeConflict { .. })));
    }
}
