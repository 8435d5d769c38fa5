// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The tile estimator (C3): partitions the unmasked region into fixed-size
//! tiles and produces coarse background/RMS grids. See spec §4.3.

use log::debug;
use ndarray::Array2;

use crate::beam::Beam;
use crate::constants::SKEWNESS_THRESHOLD;
use crate::masked_array::MaskedArray2;
use crate::stats::sigma_clip;

/// A pixel-space bounding box, `[row_start, row_end)` x `[col_start,
/// col_end)`, of the tightest rectangle enclosing the unmasked region.
pub type BBox = ((usize, usize), (usize, usize));

pub struct CoarseGrids {
    pub bg: MaskedArray2,
    pub rms: MaskedArray2,
    /// The tight bounding box of the unmasked region in the full image this
    /// grid was estimated from.
    pub bbox: BBox,
}

/// Find the tightest axis-aligned bounding box enclosing the unmasked
/// pixels. Returns `None` if every pixel is masked.
pub fn tight_bbox(mask: &Array2<bool>) -> Option<BBox> {
    let (nx, ny) = mask.dim();
    let (mut rmin, mut rmax, mut cmin, mut cmax) = (None, None, None, None);
    for i in 0..nx {
        for j in 0..ny {
            if !mask[[i, j]] {
                rmin = Some(rmin.map_or(i, |v: usize| v.min(i)));
                rmax = Some(rmax.map_or(i, |v: usize| v.max(i)));
                cmin = Some(cmin.map_or(j, |v: usize| v.min(j)));
                cmax = Some(cmax.map_or(j, |v: usize| v.max(j)));
            }
        }
    }
    match (rmin, rmax, cmin, cmax) {
        (Some(rmin), Some(rmax), Some(cmin), Some(cmax)) => {
            Some(((rmin, cmin), (rmax + 1, cmax + 1)))
        }
        _ => None,
    }
}

/// Partition the unmasked region of `data` into `tile_x` x `tile_y` tiles
/// (row-major, truncated at the right/bottom boundary) and compute the
/// coarse background/RMS grids.
pub fn estimate_tiles(data: &MaskedArray2, beam: Beam, tile_x: usize, tile_y: usize) -> CoarseGrids {
    let bbox = match tight_bbox(&data.mask) {
        Some(b) => b,
        None => {
            return CoarseGrids {
                bg: MaskedArray2::all_masked((1, 1)),
                rms: MaskedArray2::all_masked((1, 1)),
                bbox: ((0, 0), (0, 0)),
            }
        }
    };
    let ((r0, c0), (r1, c1)) = bbox;
    let (ux, uy) = (r1 - r0, c1 - c0);

    let n_tiles_x = ux.div_ceil(tile_x).max(1);
    let n_tiles_y = uy.div_ceil(tile_y).max(1);

    let mut bg_values = Array2::<f64>::zeros((n_tiles_x, n_tiles_y));
    let mut bg_mask = Array2::<bool>::from_elem((n_tiles_x, n_tiles_y), true);
    let mut rms_values = Array2::<f64>::zeros((n_tiles_x, n_tiles_y));
    let mut rms_mask = Array2::<bool>::from_elem((n_tiles_x, n_tiles_y), true);

    for ti in 0..n_tiles_x {
        for tj in 0..n_tiles_y {
            let row_start = r0 + ti * tile_x;
            let row_end = (row_start + tile_x).min(r1);
            let col_start = c0 + tj * tile_y;
            let col_end = (col_start + tile_y).min(c1);

            let mut sample = Vec::new();
            for i in row_start..row_end {
                for j in col_start..col_end {
                    if !data.mask[[i, j]] {
                        sample.push(data.values[[i, j]]);
                    }
                }
            }

            // Step 1: all masked, or all exactly zero -> masked tile.
            if sample.is_empty() || sample.iter().all(|&v| v == 0.0) {
                continue;
            }

            let clip = match sigma_clip(&sample, beam) {
                Some(c) if !c.clipped.is_empty() => c,
                _ => continue,
            };

            let mean: f64 = clip.clipped.iter().sum::<f64>() / clip.clipped.len() as f64;
            rms_values[[ti, tj]] = clip.sigma;
            rms_mask[[ti, tj]] = false;

            // Skewness rule (spec §4.3): a quick-and-dirty Pearson skewness
            // estimator decides whether this tile looks like a crowded
            // field (skewed) or an empty-sky field.
            let skew = if clip.sigma > 0.0 {
                (mean - clip.median).abs() / clip.sigma
            } else {
                0.0
            };
            if skew >= SKEWNESS_THRESHOLD {
                debug!("bg skewed ({skew:.3}), {} clipping iterations", clip.iterations);
                bg_values[[ti, tj]] = clip.median;
            } else {
                debug!("bg not skewed ({skew:.3}), {} clipping iterations", clip.iterations);
                bg_values[[ti, tj]] = 2.5 * clip.median - 1.5 * mean;
            }
            bg_mask[[ti, tj]] = false;
        }
    }

    CoarseGrids {
        bg: MaskedArray2::new(bg_values, bg_mask),
        rms: MaskedArray2::new(rms_values, rms_mask),
        bbox,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tight_bbox_of_fully_masked_is_none() {
        let mask = Array2::from_elem((4, 4), true);
        assert!(tight_bbox(&mask).is_none());
    }

    #[test]
    fn tight_bbox_excludes_margins() {
        let mut mask = Array2::from_elem((10, 10), true);
        for i in 2..8 {
            for j in 3..7 {
                mask[[i, j]] = false;
            }
        }
        assert_eq!(tight_bbox(&mask), Some(((2, 3), (8, 7))));
    }

    #[test]
    fn all_zero_tile_is_masked_in_both_grids() {
        let values = Array2::<f64>::zeros((8, 8));
        let mask = Array2::from_elem((8, 8), false);
        let data = MaskedArray2::new(values, mask);
        let grids = estimate_tiles(&data, Beam::new(2.0, 2.0, 0.0), 8, 8);
        assert!(grids.bg.is_all_masked());
        assert!(grids.rms.is_all_masked());
    }

    #[test]
    fn skewed_tile_uses_median() {
        // Build a tile dominated by a constant level with a handful of much
        // brighter pixels: classic crowded-field skew.
        let mut values = Array2::<f64>::from_elem((16, 16), 1.0);
        for k in 0..8 {
            values[[k, 0]] = 50.0;
        }
        let mask = Array2::from_elem((16, 16), false);
        let data = MaskedArray2::new(values, mask);
        let grids = estimate_tiles(&data, Beam::new(2.0, 2.0, 0.0), 16, 16);
        assert!(!grids.bg.mask[[0, 0]]);
        // The median of a field that's mostly 1.0 should be close to 1.0,
        // well below a mean inflated by the bright outliers.
        assert!(grids.bg.values[[0, 0]] < 10.0);
    }
}
