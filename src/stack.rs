//! Stacks of per-star posterior images over a shared (E, mu) grid.

use ndarray::Array2;

use crate::error::StackError;
use crate::grid::{RectGrid, E_AXIS, MU_AXIS};

/// A stack of per-star 2-D posterior densities sharing one [`RectGrid`].
///
/// Each image is a dense `(n_E, n_mu)` matrix of non-negative finite
/// values: row index is the reddening bin, column index the distance
/// bin. The stack is cropped, smoothed and normalized once during
/// setup and treated as immutable by the samplers, which only borrow
/// it read-only.
#[derive(Debug, Clone)]
pub struct ImageStack {
    images: Vec<Array2<f64>>,
    grid: RectGrid,
}

impl ImageStack {
    pub fn new(images: Vec<Array2<f64>>, grid: RectGrid) -> Result<Self, StackError> {
        let (n_e, n_mu) = (grid.n_e(), grid.n_mu());
        for (index, img) in images.iter().enumerate() {
            let (rows, cols) = img.dim();
            if rows != n_e || cols != n_mu {
                return Err(StackError::ShapeMismatch {
                    index,
                    rows,
                    cols,
                    expected_rows: n_e,
                    expected_cols: n_mu,
                });
            }
            if img.iter().any(|&v| !v.is_finite() || v < 0.) {
                return Err(StackError::InvalidValue { index });
            }
        }
        Ok(ImageStack { images, grid })
    }

    pub fn n_stars(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn grid(&self) -> &RectGrid {
        &self.grid
    }

    pub fn image(&self, star: usize) -> &Array2<f64> {
        &self.images[star]
    }

    /// Posterior density of `star` at (reddening bin, distance bin).
    #[inline]
    pub fn value(&self, star: usize, e_idx: usize, mu_idx: usize) -> f64 {
        self.images[star][(e_idx, mu_idx)]
    }

    /// Drop the images whose mask entry is false.
    pub fn cull(&mut self, keep: &[bool]) -> Result<(), StackError> {
        if keep.len() != self.images.len() {
            return Err(StackError::MaskMismatch {
                mask_len: keep.len(),
                n_images: self.images.len(),
            });
        }
        let mut iter = keep.iter();
        self.images.retain(|_| *iter.next().expect("mask length checked"));
        Ok(())
    }

    /// Crop every image to the sub-window `[e_min, e_max] x [mu_min, mu_max]`,
    /// shrinking the grid accordingly. Bounds outside the grid are clamped.
    pub fn crop(
        &mut self,
        e_min: f64,
        e_max: f64,
        mu_min: f64,
        mu_max: f64,
    ) -> Result<(), StackError> {
        let grid = &self.grid;

        let lo_bin = |axis: usize, v: f64| -> usize {
            if v <= grid.min(axis) {
                0
            } else {
                ((v - grid.min(axis)) / grid.step(axis)).floor() as usize
            }
        };
        let hi_bin = |axis: usize, v: f64| -> usize {
            if v >= grid.max(axis) {
                grid.n_bins(axis)
            } else {
                grid.n_bins(axis) - ((grid.max(axis) - v) / grid.step(axis)).floor() as usize
            }
        };

        let e0 = lo_bin(E_AXIS, e_min);
        let e1 = hi_bin(E_AXIS, e_max);
        let m0 = lo_bin(MU_AXIS, mu_min);
        let m1 = hi_bin(MU_AXIS, mu_max);

        if e1 <= e0 {
            return Err(StackError::EmptyCrop { axis: E_AXIS });
        }
        if m1 <= m0 {
            return Err(StackError::EmptyCrop { axis: MU_AXIS });
        }

        for img in &mut self.images {
            *img = img.slice(ndarray::s![e0..e1, m0..m1]).to_owned();
        }

        let new_grid = RectGrid::new(
            [grid.bin_edge(E_AXIS, e0), grid.bin_edge(MU_AXIS, m0)],
            [grid.bin_edge(E_AXIS, e1), grid.bin_edge(MU_AXIS, m1)],
            [e1 - e0, m1 - m0],
        )
        .expect("cropped grid is non-degenerate");
        self.grid = new_grid;
        Ok(())
    }

    /// Element-wise sum of all images.
    pub fn stacked(&self) -> Array2<f64> {
        let mut dest = Array2::zeros((self.grid.n_e(), self.grid.n_mu()));
        for img in &self.images {
            dest += img;
        }
        dest
    }

    /// Smooth each image along the reddening axis with a Gaussian kernel
    /// whose width varies per destination row.
    ///
    /// `sigma` gives the kernel width (in bins) for each reddening bin;
    /// the kernel is truncated at `n_sigma` widths. Rows past the grid
    /// edges are clamped, mirroring how the per-star images were binned.
    pub fn smooth(&mut self, sigma: &[f64], n_sigma: f64) {
        let n_rows = self.grid.n_e();
        let n_cols = self.grid.n_mu();
        assert_eq!(sigma.len(), n_rows);
        assert!(n_sigma > 0.);

        let mut weights = vec![0.0f64; n_rows];

        for img in &mut self.images {
            let mut smoothed = img.clone();

            for dest_row in 0..n_rows {
                let mut m_max = (sigma[dest_row] * n_sigma).ceil() as usize;
                if m_max > n_rows {
                    m_max = n_rows;
                }

                let a = -0.5 / (sigma[dest_row] * sigma[dest_row]);
                let mut norm = 1.;
                for m in 1..m_max {
                    weights[m] = (a * (m * m) as f64).exp();
                    norm += 2. * weights[m];
                }
                let norm = 1. / norm;

                for col in 0..n_cols {
                    smoothed[(dest_row, col)] = norm * img[(dest_row, col)];
                }

                for m in 1..m_max {
                    let w = weights[m] * norm;
                    let up = (dest_row + m).min(n_rows - 1);
                    let down = dest_row.saturating_sub(m);
                    for col in 0..n_cols {
                        smoothed[(dest_row, col)] +=
                            w * (img[(up, col)] + img[(down, col)]);
                    }
                }
            }

            *img = smoothed;
        }
    }

    /// Scale each image so that it sums to `norm`.
    ///
    /// Images with (near-)zero total are left untouched rather than
    /// blown up by a huge factor.
    pub fn normalize(&mut self, norm: f64) {
        for img in &mut self.images {
            let mut sum: f64 = img.iter().sum();
            if sum < 1e-30 {
                sum = 1.;
            }
            let factor = norm / sum;
            img.mapv_inplace(|v| v * factor);
        }
    }

    /// Estimate an upper limit on cumulative reddening from the stacked
    /// probability surfaces: the E value below which 90 % of the
    /// column-averaged weight lies.
    pub fn guess_max_reddening(&self) -> f64 {
        let stack = self.stacked();
        let n_e = self.grid.n_e();
        let n_mu = self.grid.n_mu() as f64;

        let mut row_avg = vec![0.0f64; n_e];
        for (e_idx, row) in stack.rows().into_iter().enumerate() {
            row_avg[e_idx] = row.sum() / n_mu;
        }

        let total: f64 = row_avg.iter().sum();
        let mut partial = 0.;
        for (e_idx, &avg) in row_avg.iter().enumerate() {
            partial += avg;
            if partial > 0.90 * total {
                return self.grid.bin_edge(E_AXIS, e_idx);
            }
        }
        self.grid.bin_edge(E_AXIS, n_e - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn flat_stack(n_stars: usize, n_e: usize, n_mu: usize, value: f64) -> ImageStack {
        let grid = RectGrid::new([0., 4.], [n_e as f64 * 0.02, 19.], [n_e, n_mu]).unwrap();
        let images = (0..n_stars)
            .map(|_| Array2::from_elem((n_e, n_mu), value))
            .collect();
        ImageStack::new(images, grid).unwrap()
    }

    #[test]
    fn rejects_shape_mismatch() {
        let grid = RectGrid::new([0., 4.], [7., 19.], [10, 20]).unwrap();
        let images = vec![Array2::zeros((10, 21))];
        assert!(matches!(
            ImageStack::new(images, grid),
            Err(StackError::ShapeMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn rejects_negative_values() {
        let grid = RectGrid::new([0., 4.], [7., 19.], [4, 4]).unwrap();
        let mut img = Array2::zeros((4, 4));
        img[(2, 2)] = -1e-8;
        assert!(matches!(
            ImageStack::new(vec![img], grid),
            Err(StackError::InvalidValue { index: 0 })
        ));
    }

    #[test]
    fn normalize_scales_to_unit_sum() {
        let mut stack = flat_stack(3, 10, 20, 0.5);
        stack.normalize(1.);
        let sum: f64 = stack.image(1).iter().sum();
        assert_abs_diff_eq!(sum, 1., epsilon = 1e-12);
    }

    #[test]
    fn cull_drops_masked_images() {
        let mut stack = flat_stack(4, 5, 5, 1.);
        stack.cull(&[true, false, true, false]).unwrap();
        assert_eq!(stack.n_stars(), 2);
    }

    #[test]
    fn crop_shrinks_grid_and_images() {
        let mut stack = flat_stack(2, 100, 40, 1.);
        let e_hi = stack.grid().max(E_AXIS);
        let mu_step = stack.grid().step(MU_AXIS);
        stack.crop(0.2, e_hi, 6., 12.).unwrap();
        assert_eq!(stack.image(0).dim().0, stack.grid().n_e());
        assert_eq!(stack.image(0).dim().1, stack.grid().n_mu());
        // The cropped bounds land on bin edges within one bin of the
        // requested window.
        assert!(stack.grid().min(MU_AXIS) >= 6. - mu_step);
        assert!(stack.grid().max(MU_AXIS) <= 12. + mu_step);
        assert!(stack.grid().min(E_AXIS) >= 0.2 - stack.grid().step(E_AXIS));
    }

    #[test]
    fn guess_max_reddening_finds_weight_edge() {
        // All weight in the bottom decile of the E axis.
        let grid = RectGrid::new([0., 4.], [1., 19.], [100, 10]).unwrap();
        let mut img = Array2::zeros((100, 10));
        for e in 0..10 {
            for m in 0..10 {
                img[(e, m)] = 1.;
            }
        }
        let stack = ImageStack::new(vec![img], grid).unwrap();
        let guess = stack.guess_max_reddening();
        assert!(guess < 0.15, "guess = {guess}");
    }

    #[test]
    fn smooth_preserves_total_weight_in_interior() {
        let grid = RectGrid::new([0., 4.], [1., 19.], [50, 4]).unwrap();
        let mut img = Array2::zeros((50, 4));
        img[(25, 2)] = 1.;
        let mut stack = ImageStack::new(vec![img], grid).unwrap();
        stack.smooth(&vec![2.0; 50], 4.);
        let total: f64 = stack.image(0).iter().sum();
        assert_abs_diff_eq!(total, 1., epsilon = 1e-6);
        assert!(stack.value(0, 25, 2) < 1.);
        assert!(stack.value(0, 23, 2) > 0.);
    }
}
