// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A masked two-dimensional array: values paired with a per-pixel validity
//! bitmap.
//!
//! Every numeric kernel in this crate (sigma clipping, tile statistics,
//! interpolation, island selection) must honour the mask rather than let
//! masked pixels leak into an aggregate as NaN. Aggregating over an input
//! that is entirely masked returns a sentinel "all masked" state (`None`,
//! or an explicit `is_all_masked()` check), never a NaN.

use ndarray::Array2;

/// A 2-D array of `f64` with a parallel boolean mask; `true` marks an
/// invalid (masked) pixel.
#[derive(Debug, Clone)]
pub struct MaskedArray2 {
    pub values: Array2<f64>,
    pub mask: Array2<bool>,
}

impl MaskedArray2 {
    pub fn new(values: Array2<f64>, mask: Array2<bool>) -> Self {
        assert_eq!(
            values.dim(),
            mask.dim(),
            "MaskedArray2: values and mask must have the same shape"
        );
        Self { values, mask }
    }

    /// Build a fully-unmasked array.
    pub fn unmasked(values: Array2<f64>) -> Self {
        let mask = Array2::from_elem(values.dim(), false);
        Self { values, mask }
    }

    /// An all-masked array of the given shape; values are zeroed.
    pub fn all_masked(dim: (usize, usize)) -> Self {
        Self {
            values: Array2::zeros(dim),
            mask: Array2::from_elem(dim, true),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn is_all_masked(&self) -> bool {
        self.mask.iter().all(|&m| m)
    }

    pub fn num_unmasked(&self) -> usize {
        self.mask.iter().filter(|&&m| !m).count()
    }

    /// Collect the unmasked values, in row-major order.
    pub fn unmasked_values(&self) -> Vec<f64> {
        self.values
            .iter()
            .zip(self.mask.iter())
            .filter_map(|(v, m)| if *m { None } else { Some(*v) })
            .collect()
    }

    /// Return a dense array with masked entries replaced by `fill`.
    pub fn filled(&self, fill: f64) -> Array2<f64> {
        let mut out = self.values.clone();
        out.zip_mut_with(&self.mask, |v, &m| {
            if m {
                *v = fill;
            }
        });
        out
    }

    /// The logical OR of this mask with `other`, applied in place.
    pub fn or_mask(&mut self, other: &Array2<bool>) {
        self.mask.zip_mut_with(other, |m, &o| *m = *m || o);
    }
}
