// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The FDR threshold selector (C6): Hopkins et al. (2002) false-discovery-rate
//! controlled detection threshold. See spec §4.6.

use std::f64::consts::PI;

use crate::beam::Beam;
use crate::masked_array::MaskedArray2;

/// Result of an FDR threshold search: both thresholds in units of sigma.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdrThreshold {
    pub detection_sigma: f64,
    pub analysis_sigma: f64,
}

/// Select an FDR-controlled detection threshold for `bg_subtracted`
/// standardized by `rms_map`, at false-discovery rate `alpha`.
///
/// Returns `None` if no index satisfies the Hopkins et al. ordering
/// condition (spec §4.6 step 5): an empty result set, not an error.
pub fn select_threshold(bg_subtracted: &MaskedArray2, rms_map: &MaskedArray2, beam: Beam, alpha: f64) -> Option<FdrThreshold> {
    let (long, short) = beam.correlation_lengths();
    let k = (0.25 * PI * long * short).round() as i64 + 1;
    let k = k.max(1) as usize;
    let c_n: f64 = (1..=k).map(|i| 1.0 / i as f64).sum();

    let mut z: Vec<f64> = Vec::new();
    let (nx, ny) = bg_subtracted.dim();
    for i in 0..nx {
        for j in 0..ny {
            if bg_subtracted.mask[[i, j]] || rms_map.mask[[i, j]] {
                continue;
            }
            let rms = rms_map.values[[i, j]];
            if rms > 0.0 {
                z.push(bg_subtracted.values[[i, j]] / rms);
            }
        }
    }
    if z.is_empty() {
        return None;
    }

    let sqrt_2pi = (2.0 * PI).sqrt();
    let mut p: Vec<f64> = z.iter().map(|v| (-v * v / 2.0).exp() / sqrt_2pi).collect();
    p.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let m = p.len() as f64;

    let mut best: Option<usize> = None;
    for (idx, &pi) in p.iter().enumerate() {
        let i = (idx + 1) as f64;
        let q = (alpha / c_n) * i / m;
        if pi < q {
            best = Some(idx);
        }
    }

    let i_star = best?;
    let detection_sigma = (-2.0 * (sqrt_2pi * p[i_star]).ln()).sqrt();
    Some(FdrThreshold {
        detection_sigma,
        analysis_sigma: detection_sigma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn no_signal_sometimes_yields_no_threshold_at_tiny_alpha() {
        let values = Array2::from_elem((8, 8), 0.0);
        let mask = Array2::from_elem((8, 8), false);
        let bg = MaskedArray2::new(values, mask.clone());
        let rms = MaskedArray2::new(Array2::from_elem((8, 8), 1.0), mask);
        // All-zero standardized residuals give p = 1/sqrt(2 pi) uniformly;
        // whether that clears the Hopkins condition depends on m and alpha,
        // but the call must not panic and must return a consistent result.
        let result = select_threshold(&bg, &rms, Beam::new(2.0, 2.0, 0.0), 0.01);
        if let Some(t) = result {
            assert!(t.detection_sigma.is_finite());
        }
    }

    #[test]
    fn strong_source_pixels_lower_the_detection_threshold() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut values = Array2::from_shape_fn((64, 64), |_| normal.sample(&mut rng));
        for i in 30..34 {
            for j in 30..34 {
                values[[i, j]] = 20.0;
            }
        }
        let mask = Array2::from_elem((64, 64), false);
        let bg = MaskedArray2::new(values, mask.clone());
        let rms = MaskedArray2::new(Array2::from_elem((64, 64), 1.0), mask);
        let result = select_threshold(&bg, &rms, Beam::new(2.0, 2.0, 0.0), 0.1);
        assert!(result.is_some());
    }
}
