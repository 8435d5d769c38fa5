// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The deblender (C7): hierarchical re-thresholding that splits a merged
//! island into its constituent sources, mirroring SExtractor's tree-of-
//! thresholds deblending. See spec §4.7.

use ndarray::Array2;

use crate::config::StructuringElement;
use crate::islands::{label, Island};
use crate::masked_array::MaskedArray2;

/// Minimum contrast (fraction of parent peak) a sub-island's local maximum
/// must exceed relative to the threshold level it split off at, to be
/// accepted as a genuine child rather than noise. Not specified in closed
/// form by the source system; matches SExtractor's `DEBLEND_MINCONT`
/// default. See `DESIGN.md`.
pub const DEFAULT_MIN_CONTRAST: f64 = 0.005;

/// Minimum area (pixels) a sub-island must have to be considered separate
/// from its parent, matching SExtractor's `DEBLEND_MINAREA`-like behaviour
/// at a scale appropriate for single-beam-sized sources.
pub const DEFAULT_MIN_AREA: usize = 2;

/// Deblend `island` into `nthresh` levels linearly spaced between its
/// analysis threshold and its peak value. Returns the leaves of the
/// threshold tree: either the original island (if it never splits) or the
/// accepted sub-islands.
pub fn deblend(
    island: &Island,
    nthresh: usize,
    structuring_element: StructuringElement,
    min_contrast: f64,
    min_area: usize,
) -> Vec<Island> {
    let peak = island
        .pixels_subarray
        .unmasked_values()
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
    if !peak.is_finite() || peak <= island.analysis_threshold_effective || nthresh < 2 {
        return vec![island.clone()];
    }

    let levels: Vec<f64> = (0..nthresh)
        .map(|k| {
            island.analysis_threshold_effective
                + (peak - island.analysis_threshold_effective) * k as f64 / (nthresh - 1) as f64
        })
        .collect();

    let mut children: Vec<(Array2<bool>, f64)> = vec![(full_island_mask(island), island.analysis_threshold_effective)];

    for &level in levels.iter().skip(1) {
        let mut next_generation = Vec::new();
        for (parent_mask, _) in &children {
            let clipped = threshold_mask(island, parent_mask, level);
            let (labels, n) = label(&clipped, structuring_element);
            if n == 0 {
                continue;
            }
            let mut sub_masks: Vec<Array2<bool>> = (0..n)
                .map(|_| Array2::from_elem(clipped.dim(), false))
                .collect();
            let (nx, ny) = labels.dim();
            for i in 0..nx {
                for j in 0..ny {
                    let l = labels[[i, j]];
                    if l > 0 {
                        sub_masks[l - 1][[i, j]] = true;
                    }
                }
            }
            for sub in sub_masks {
                if has_significant_peak(island, &sub, level, min_contrast, min_area) {
                    next_generation.push((sub, level));
                }
            }
        }
        if next_generation.len() > children.len() {
            children = next_generation;
        } else if next_generation.is_empty() {
            break;
        } else {
            children = next_generation;
        }
    }

    if children.len() <= 1 {
        return vec![island.clone()];
    }

    children
        .into_iter()
        .filter_map(|(mask, _)| crop_child(island, &mask))
        .collect()
}

fn full_island_mask(island: &Island) -> Array2<bool> {
    island.pixels_subarray.mask.mapv(|m| !m)
}

fn threshold_mask(island: &Island, parent_mask: &Array2<bool>, level: f64) -> Array2<bool> {
    let (nx, ny) = parent_mask.dim();
    let mut out = Array2::from_elem((nx, ny), false);
    for i in 0..nx {
        for j in 0..ny {
            if parent_mask[[i, j]] && !island.pixels_subarray.mask[[i, j]] {
                out[[i, j]] = island.pixels_subarray.values[[i, j]] > level;
            }
        }
    }
    out
}

fn has_significant_peak(island: &Island, sub: &Array2<bool>, level: f64, min_contrast: f64, min_area: usize) -> bool {
    let mut area = 0usize;
    let mut peak = f64::NEG_INFINITY;
    let (nx, ny) = sub.dim();
    for i in 0..nx {
        for j in 0..ny {
            if sub[[i, j]] {
                area += 1;
                peak = peak.max(island.pixels_subarray.values[[i, j]]);
            }
        }
    }
    if area < min_area || !peak.is_finite() {
        return false;
    }
    let global_peak = island
        .pixels_subarray
        .unmasked_values()
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
    if global_peak <= 0.0 {
        return false;
    }
    (peak - level) / global_peak >= min_contrast
}

fn crop_child(parent: &Island, sub: &Array2<bool>) -> Option<Island> {
    let (nx, ny) = sub.dim();
    let (mut rmin, mut rmax, mut cmin, mut cmax) = (None, None, None, None);
    for i in 0..nx {
        for j in 0..ny {
            if sub[[i, j]] {
                rmin = Some(rmin.map_or(i, |v: usize| v.min(i)));
                rmax = Some(rmax.map_or(i, |v: usize| v.max(i)));
                cmin = Some(cmin.map_or(j, |v: usize| v.min(j)));
                cmax = Some(cmax.map_or(j, |v: usize| v.max(j)));
            }
        }
    }
    let (rmin, rmax, cmin, cmax) = (rmin?, rmax?, cmin?, cmax?);
    let (rs, re, cs, ce) = (rmin, rmax + 1, cmin, cmax + 1);
    let (ux, uy) = (re - rs, ce - cs);

    let mut values = Array2::<f64>::zeros((ux, uy));
    let mut mask = Array2::<bool>::from_elem((ux, uy), true);
    let mut rms_sub = Array2::<f64>::zeros((ux, uy));
    let mut detection_sub = Array2::<f64>::zeros((ux, uy));

    for i in rs..re {
        for j in cs..ce {
            let (li, lj) = (i - rs, j - cs);
            let in_child = sub[[i, j]];
            values[[li, lj]] = parent.pixels_subarray.values[[i, j]];
            mask[[li, lj]] = !in_child || parent.pixels_subarray.mask[[i, j]];
            rms_sub[[li, lj]] = parent.rms_subarray[[i, j]];
            detection_sub[[li, lj]] = parent.detection_threshold_subarray[[i, j]];
        }
    }

    let (parent_rs, parent_cs) = parent.chunk_bounds.0;
    Some(Island {
        label: parent.label,
        pixels_subarray: MaskedArray2::new(values, mask),
        rms_subarray: rms_sub,
        chunk_bounds: ((parent_rs + rs, parent_cs + cs), (parent_rs + re, parent_cs + ce)),
        analysis_threshold_effective: parent.analysis_threshold_effective,
        detection_threshold_subarray: detection_sub,
        beam: parent.beam,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::Beam;
    use crate::config::FULL_STRUCTURING_ELEMENT;

    fn two_peak_island() -> Island {
        let mut values = Array2::from_elem((9, 3), 0.0);
        for i in 0..9 {
            values[[i, 1]] = 4.0;
        }
        values[[1, 1]] = 20.0;
        values[[7, 1]] = 20.0;
        let mask = Array2::from_elem((9, 3), false);
        Island {
            label: 1,
            pixels_subarray: MaskedArray2::new(values, mask),
            rms_subarray: Array2::from_elem((9, 3), 1.0),
            chunk_bounds: ((0, 0), (9, 3)),
            analysis_threshold_effective: 3.0,
            detection_threshold_subarray: Array2::from_elem((9, 3), 10.0),
            beam: Beam::new(2.0, 2.0, 0.0),
        }
    }

    #[test]
    fn single_peak_island_is_not_split() {
        let mut values = Array2::from_elem((5, 5), 0.0);
        values[[2, 2]] = 20.0;
        let mask = Array2::from_elem((5, 5), false);
        let island = Island {
            label: 1,
            pixels_subarray: MaskedArray2::new(values, mask),
            rms_subarray: Array2::from_elem((5, 5), 1.0),
            chunk_bounds: ((0, 0), (5, 5)),
            analysis_threshold_effective: 3.0,
            detection_threshold_subarray: Array2::from_elem((5, 5), 10.0),
            beam: Beam::new(2.0, 2.0, 0.0),
        };
        let children = deblend(&island, 32, FULL_STRUCTURING_ELEMENT, DEFAULT_MIN_CONTRAST, DEFAULT_MIN_AREA);
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn two_well_separated_peaks_split() {
        let island = two_peak_island();
        let children = deblend(&island, 32, FULL_STRUCTURING_ELEMENT, DEFAULT_MIN_CONTRAST, DEFAULT_MIN_AREA);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn high_min_contrast_suppresses_the_split() {
        let island = two_peak_island();
        let children = deblend(&island, 32, FULL_STRUCTURING_ELEMENT, 0.9, DEFAULT_MIN_AREA);
        assert_eq!(children.len(), 1);
    }
}
