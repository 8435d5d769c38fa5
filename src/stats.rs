// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The robust statistics kernel (C2): iterative sigma clipping over a
//! flat sample, beam-corrected for pixel-to-pixel correlation. See spec
//! §4.2.

use crate::beam::Beam;
use crate::constants::{CLIP_KAPPA, CLIP_MAX_ITERATIONS};

/// Result of an iterative sigma-clip.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipResult {
    pub clipped: Vec<f64>,
    pub sigma: f64,
    pub median: f64,
    pub iterations: usize,
}

/// Iteratively sigma-clip `sample`, returning `None` if the sample is empty
/// to begin with or becomes empty during clipping (the "all masked"
/// sentinel of spec §9, rather than a NaN).
///
/// The clip threshold itself (`CLIP_KAPPA`) is fixed; what the beam
/// contributes is a correction to the reported standard deviation, because
/// neighbouring pixels in a beam-convolved image are not independent
/// samples. We treat one resolution element ([`Beam::area_px`] pixels) as a
/// single independent draw, and use the resulting effective sample size
/// (rather than the raw pixel count) as the denominator of the variance
/// estimate. This is the "beam-derived correlation-length correction"
/// spec §9 flags as a hot-spot without a closed form; see `DESIGN.md`.
pub fn sigma_clip(sample: &[f64], beam: Beam) -> Option<ClipResult> {
    if sample.is_empty() {
        return None;
    }

    let beam_area = beam.area_px().max(1.0);
    let mut current = sample.to_vec();
    let mut iterations = 0usize;

    loop {
        if current.is_empty() {
            return None;
        }
        let median = median(&current);
        let sigma = beam_corrected_sigma(&current, median, beam_area);
        iterations += 1;

        let next: Vec<f64> = if sigma > 0.0 {
            current
                .iter()
                .copied()
                .filter(|v| (v - median).abs() <= CLIP_KAPPA * sigma)
                .collect()
        } else {
            current.clone()
        };

        let converged = next.len() == current.len();
        current = next;
        if converged || iterations >= CLIP_MAX_ITERATIONS {
            break;
        }
    }

    if current.is_empty() {
        return None;
    }
    let median = median(&current);
    let sigma = beam_corrected_sigma(&current, median, beam_area);
    Some(ClipResult {
        clipped: current,
        sigma,
        median,
        iterations,
    })
}

fn beam_corrected_sigma(sample: &[f64], median: f64, beam_area: f64) -> f64 {
    let n = sample.len() as f64;
    let n_eff = (n / beam_area).max(1.0);
    let sum_sq: f64 = sample.iter().map(|v| (v - median).powi(2)).sum();
    (sum_sq / n_eff.max(1.0)).sqrt()
}

/// The median of a slice. Not in-place; clones and sorts.
pub fn median(sample: &[f64]) -> f64 {
    let mut s = sample.to_vec();
    s.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = s.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        s[n / 2]
    } else {
        0.5 * (s[n / 2 - 1] + s[n / 2])
    }
}
