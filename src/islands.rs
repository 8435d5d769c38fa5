// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The island labeller (C5): connected-component labelling of pixels
//! clearing the analysis threshold, filtered to islands whose peak clears
//! the detection threshold. See spec §4.5.

use ndarray::Array2;

use crate::beam::Beam;
use crate::config::StructuringElement;
use crate::masked_array::MaskedArray2;
use crate::stats::median;

/// A connected island of pixels, cropped to its tight bounding box.
#[derive(Debug, Clone)]
pub struct Island {
    pub label: usize,
    pub pixels_subarray: MaskedArray2,
    pub rms_subarray: Array2<f64>,
    /// `((row_start, col_start), (row_end, col_end))` in the parent image.
    pub chunk_bounds: ((usize, usize), (usize, usize)),
    pub analysis_threshold_effective: f64,
    pub detection_threshold_subarray: Array2<f64>,
    pub beam: Beam,
}

/// Connected-component label a boolean array using the offsets implied by
/// `element` (any non-zero, non-centre entry is a connectivity offset).
/// Returns the label map (`0` = unlabelled) and the number of labels
/// assigned, in first-encountered scan order (spec §4.5 tie-break).
pub fn label(clipped: &Array2<bool>, element: StructuringElement) -> (Array2<usize>, usize) {
    let (nx, ny) = clipped.dim();
    let mut labels = Array2::<usize>::zeros((nx, ny));
    let offsets: Vec<(i64, i64)> = (0..3)
        .flat_map(|di| (0..3).map(move |dj| (di, dj)))
        .filter(|&(di, dj)| !(di == 1 && dj == 1) && element[di as usize][dj as usize] != 0)
        .map(|(di, dj)| (di - 1, dj - 1))
        .collect();

    let mut next_label = 1usize;
    let mut stack = Vec::new();
    for i in 0..nx {
        for j in 0..ny {
            if clipped[[i, j]] && labels[[i, j]] == 0 {
                let this_label = next_label;
                next_label += 1;
                labels[[i, j]] = this_label;
                stack.push((i, j));
                while let Some((ci, cj)) = stack.pop() {
                    for &(di, dj) in &offsets {
                        let ni = ci as i64 + di;
                        let nj = cj as i64 + dj;
                        if ni < 0 || nj < 0 || ni >= nx as i64 || nj >= ny as i64 {
                            continue;
                        }
                        let (ni, nj) = (ni as usize, nj as usize);
                        if clipped[[ni, nj]] && labels[[ni, nj]] == 0 {
                            labels[[ni, nj]] = this_label;
                            stack.push((ni, nj));
                        }
                    }
                }
            }
        }
    }
    (labels, next_label - 1)
}

/// Build islands from a background-subtracted image, its RMS map, and
/// per-pixel analysis/detection threshold maps (spec §4.5).
///
/// `rms_filter` is the fraction of the median RMS below which a pixel is
/// excluded regardless of how far it clears the analysis threshold (the
/// "RMS floor filter").
pub fn build_islands(
    bg_subtracted: &MaskedArray2,
    rms_map: &MaskedArray2,
    analysis_map: &Array2<f64>,
    detection_map: &Array2<f64>,
    rms_filter: f64,
    structuring_element: StructuringElement,
    beam: Beam,
) -> (Array2<usize>, Vec<Island>) {
    let (nx, ny) = bg_subtracted.dim();
    let rms_unmasked: Vec<f64> = rms_map.unmasked_values();
    let rms_median = if rms_unmasked.is_empty() { 0.0 } else { median(&rms_unmasked) };
    let floor = rms_filter * rms_median;

    let mut clipped = Array2::<bool>::from_elem((nx, ny), false);
    for i in 0..nx {
        for j in 0..ny {
            if bg_subtracted.mask[[i, j]] || rms_map.mask[[i, j]] {
                continue;
            }
            let above_analysis = bg_subtracted.values[[i, j]] > analysis_map[[i, j]];
            let above_floor = rms_map.values[[i, j]] >= floor;
            clipped[[i, j]] = above_analysis && above_floor;
        }
    }

    let (mut labels, n) = label(&clipped, structuring_element);

    let mut max_excess = vec![f64::NEG_INFINITY; n + 1];
    for i in 0..nx {
        for j in 0..ny {
            let l = labels[[i, j]];
            if l > 0 {
                let excess = bg_subtracted.values[[i, j]] - detection_map[[i, j]];
                if excess > max_excess[l] {
                    max_excess[l] = excess;
                }
            }
        }
    }

    let mut surviving: Vec<bool> = vec![false; n + 1];
    for l in 1..=n {
        surviving[l] = max_excess[l] > 0.0;
    }

    for v in labels.iter_mut() {
        if *v > 0 && !surviving[*v] {
            *v = 0;
        }
    }

    let mut islands = Vec::new();
    for l in 1..=n {
        if !surviving[l] {
            continue;
        }
        if let Some(island) = extract_island(bg_subtracted, rms_map, analysis_map, detection_map, &labels, l, beam) {
            islands.push(island);
        }
    }

    (labels, islands)
}

fn extract_island(
    bg_subtracted: &MaskedArray2,
    rms_map: &MaskedArray2,
    analysis_map: &Array2<f64>,
    detection_map: &Array2<f64>,
    labels: &Array2<usize>,
    target: usize,
    beam: Beam,
) -> Option<Island> {
    let (nx, ny) = labels.dim();
    let (mut rmin, mut rmax, mut cmin, mut cmax) = (None, None, None, None);
    for i in 0..nx {
        for j in 0..ny {
            if labels[[i, j]] == target {
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
    let mut analysis_min = f64::INFINITY;

    for i in rs..re {
        for j in cs..ce {
            let (li, lj) = (i - rs, j - cs);
            let in_island = labels[[i, j]] == target;
            values[[li, lj]] = bg_subtracted.values[[i, j]];
            mask[[li, lj]] = !in_island || bg_subtracted.mask[[i, j]];
            rms_sub[[li, lj]] = rms_map.values[[i, j]];
            detection_sub[[li, lj]] = detection_map[[i, j]];
            if in_island {
                analysis_min = analysis_min.min(analysis_map[[i, j]]);
            }
        }
    }
    if !analysis_min.is_finite() {
        return None;
    }

    Some(Island {
        label: target,
        pixels_subarray: MaskedArray2::new(values, mask),
        rms_subarray: rms_sub,
        chunk_bounds: ((rs, cs), (re, ce)),
        analysis_threshold_effective: analysis_min,
        detection_threshold_subarray: detection_sub,
        beam,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FULL_STRUCTURING_ELEMENT, PLUS_STRUCTURING_ELEMENT};

    #[test]
    fn plus_connectivity_separates_diagonal_pixels() {
        let mut clipped = Array2::from_elem((3, 3), false);
        clipped[[0, 0]] = true;
        clipped[[1, 1]] = true;
        let (labels, n) = label(&clipped, PLUS_STRUCTURING_ELEMENT);
        assert_eq!(n, 2);
        assert_ne!(labels[[0, 0]], labels[[1, 1]]);
    }

    #[test]
    fn full_connectivity_joins_diagonal_pixels() {
        let mut clipped = Array2::from_elem((3, 3), false);
        clipped[[0, 0]] = true;
        clipped[[1, 1]] = true;
        let (labels, n) = label(&clipped, FULL_STRUCTURING_ELEMENT);
        assert_eq!(n, 1);
        assert_eq!(labels[[0, 0]], labels[[1, 1]]);
    }

    #[test]
    fn island_below_detection_threshold_is_discarded() {
        let values = Array2::from_elem((5, 5), 4.0);
        let mask = Array2::from_elem((5, 5), false);
        let bg_subtracted = MaskedArray2::new(values, mask.clone());
        let rms = MaskedArray2::new(Array2::from_elem((5, 5), 1.0), mask);
        let analysis = Array2::from_elem((5, 5), 3.0);
        let detection = Array2::from_elem((5, 5), 10.0);
        let (_, islands) = build_islands(
            &bg_subtracted,
            &rms,
            &analysis,
            &detection,
            0.001,
            PLUS_STRUCTURING_ELEMENT,
            Beam::new(2.0, 2.0, 0.0),
        );
        assert!(islands.is_empty());
    }

    #[test]
    fn island_above_detection_threshold_survives() {
        let mut values = Array2::from_elem((7, 7), 0.0);
        for i in 2..5 {
            for j in 2..5 {
                values[[i, j]] = 20.0;
            }
        }
        let mask = Array2::from_elem((7, 7), false);
        let bg_subtracted = MaskedArray2::new(values, mask.clone());
        let rms = MaskedArray2::new(Array2::from_elem((7, 7), 1.0), mask);
        let analysis = Array2::from_elem((7, 7), 3.0);
        let detection = Array2::from_elem((7, 7), 10.0);
        let (label_map, islands) = build_islands(
            &bg_subtracted,
            &rms,
            &analysis,
            &detection,
            0.001,
            PLUS_STRUCTURING_ELEMENT,
            Beam::new(2.0, 2.0, 0.0),
        );
        assert_eq!(islands.len(), 1);
        assert_eq!(islands[0].chunk_bounds, ((2, 2), (5, 5)));
        assert!(label_map[[3, 3]] > 0);
        assert_eq!(label_map[[0, 0]], 0);
    }

    #[test]
    fn rms_floor_filter_excludes_untrustworthy_pixels() {
        let values = Array2::from_elem((5, 5), 20.0);
        let mask = Array2::from_elem((5, 5), false);
        let bg_subtracted = MaskedArray2::new(values, mask.clone());
        // Median RMS is 1.0; one tiny RMS pixel should fail the floor test
        // at a filter fraction of 0.5.
        let mut rms_values = Array2::from_elem((5, 5), 1.0);
        rms_values[[2, 2]] = 1e-6;
        let rms = MaskedArray2::new(rms_values, mask);
        let analysis = Array2::from_elem((5, 5), 3.0);
        let detection = Array2::from_elem((5, 5), 10.0);
        let (label_map, _) = build_islands(
            &bg_subtracted,
            &rms,
            &analysis,
            &detection,
            0.5,
            FULL_STRUCTURING_ELEMENT,
            Beam::new(2.0, 2.0, 0.0),
        );
        assert_eq!(label_map[[2, 2]], 0);
    }
}
