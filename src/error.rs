use thiserror::Error;

/// Errors raised while constructing a [`crate::RectGrid`].
#[derive(Debug, Error)]
pub enum GridError {
    #[error("axis {axis} has zero bins")]
    EmptyAxis { axis: usize },

    #[error("axis {axis} has inverted bounds: min {min} >= max {max}")]
    InvertedBounds { axis: usize, min: f64, max: f64 },
}

/// Errors raised while building or reshaping an image stack.
///
/// These are fatal: a malformed stack means the caller handed us
/// inconsistent per-star posterior images, and no amount of sampling
/// can recover from that.
#[derive(Debug, Error)]
pub enum StackError {
    #[error(
        "image {index} has shape {rows}x{cols}, but the grid expects {expected_rows}x{expected_cols}"
    )]
    ShapeMismatch {
        index: usize,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error("image {index} contains a negative or non-finite value")]
    InvalidValue { index: usize },

    #[error("cull mask has length {mask_len}, stack holds {n_images} images")]
    MaskMismatch { mask_len: usize, n_images: usize },

    #[error("crop window is empty along axis {axis}")]
    EmptyCrop { axis: usize },

    #[error("distance axis has {n_mu} bins, which cannot be split into {n_regions} equal runs")]
    IndivisibleRegions { n_mu: usize, n_regions: usize },
}

/// Errors raised while assembling a neighbor-pixel bank.
#[derive(Debug, Error)]
pub enum BankError {
    #[error("bank requires at least one pixel (the central pixel)")]
    NoPixels,

    #[error("pixel {pix} holds {got} samples, expected {expected}")]
    SampleCountMismatch {
        pix: usize,
        got: usize,
        expected: usize,
    },

    #[error("pixel {pix}, sample {sample} has {got} distance bins, expected {expected}")]
    ProfileLengthMismatch {
        pix: usize,
        sample: usize,
        got: usize,
        expected: usize,
    },

    #[error("coupling table has {got} entries, expected {expected} (n_dists * n_pix * n_pix)")]
    CouplingShapeMismatch { got: usize, expected: usize },
}

/// Errors raised by the keyed output store.
///
/// Store failures are fatal for the pixel being written: no partial
/// output is ever left behind.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no dataset {name:?} under key {key}")]
    MissingDataset { key: String, name: String },

    #[error("dataset {name:?} under key {key} already exists with a different type")]
    TypeConflict { key: String, name: String },

    #[error("store is poisoned; a previous writer panicked")]
    Poisoned,
}
