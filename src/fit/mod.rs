// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Gaussian fitter (C8): moment-based initial guess, weighted
//! non-linear least squares, and Condon (1997)-style error propagation.
//! See spec §4.8.

pub mod lm;
pub mod model;

use log::warn;
use thiserror::Error;

use crate::constants::{FIT_CONVERGENCE_TOLERANCE, FIT_MAX_ITERATIONS};
use crate::islands::Island;
use model::GaussianParams;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum FitError {
    /// Fixed parameters preclude a moment-based initial guess, or the
    /// island's second-moment matrix is degenerate.
    #[error("moments not applicable for this island")]
    MomentsNotApplicable,

    /// The non-linear least squares fit did not converge.
    #[error("Gaussian fit did not converge")]
    FitFailed,
}

/// Which parameters are pinned rather than fitted, per spec §4.8 item 2's
/// forced-photometry modes.
#[derive(Debug, Clone, Copy)]
pub enum FixedMode {
    /// All six parameters are free.
    None,
    /// Centroid is pinned to a caller-supplied position; shape is fitted.
    Position { xbar: f64, ybar: f64 },
    /// Centroid and shape are both pinned; only the peak is fitted.
    PositionAndShape(GaussianParams),
}

/// The outcome of a successful fit: best-fit parameters, their formal
/// 1-sigma errors (same field layout as [`GaussianParams`]), and fit
/// statistics.
#[derive(Debug, Clone, Copy)]
pub struct FitOutcome {
    pub params: GaussianParams,
    pub errors: GaussianParams,
    pub chisq: f64,
    pub reduced_chisq: f64,
}

/// Fit an elliptical Gaussian to `island`'s unmasked pixels.
///
/// If `force_beam` is set, the shape parameters are pinned to `island.beam`
/// regardless of `fixed_mode` (spec §3 `force_beam` option), unless
/// `fixed_mode` already pins shape.
pub fn fit_island(island: &Island, fixed_mode: FixedMode, force_beam: bool) -> Result<FitOutcome, FitError> {
    let initial = match fixed_mode {
        FixedMode::None => {
            let mut guess = model::moments_guess(island).ok_or(FitError::MomentsNotApplicable)?;
            if force_beam {
                guess.semimajor = island.beam.semimajor_px;
                guess.semiminor = island.beam.semiminor_px;
                guess.theta = island.beam.theta_rad;
            }
            guess
        }
        FixedMode::Position { xbar, ybar } => {
            let mut guess = model::moments_guess(island).unwrap_or(GaussianParams {
                peak: peak_value(island),
                xbar,
                ybar,
                semimajor: island.beam.semimajor_px,
                semiminor: island.beam.semiminor_px,
                theta: island.beam.theta_rad,
            });
            guess.xbar = xbar;
            guess.ybar = ybar;
            if force_beam {
                guess.semimajor = island.beam.semimajor_px;
                guess.semiminor = island.beam.semiminor_px;
                guess.theta = island.beam.theta_rad;
            }
            guess
        }
        FixedMode::PositionAndShape(fixed) => fixed,
    };

    let (free_indices, fit_result) = run_fit(island, initial, fixed_mode)?;

    let (nx, ny) = island.pixels_subarray.dim();
    let points: Vec<(f64, f64)> = (0..nx)
        .flat_map(|i| (0..ny).map(move |j| (i as f64, j as f64)))
        .filter(|&(i, j)| !island.pixels_subarray.mask[[i as usize, j as usize]])
        .collect();
    let n_free = free_indices.len();
    let dof = (points.len().saturating_sub(n_free)).max(1) as f64;
    let reduced_chisq = fit_result.chisq / dof;

    let rms_centre = rms_at(island, initial.xbar, initial.ybar);
    let errors = propagate_errors(island, &fit_result, &free_indices, rms_centre);

    let params = GaussianParams::from_vec(expand_params(&fit_result.params, &free_indices, &initial));

    if params.xbar < 0.0 || params.xbar > nx as f64 || params.ybar < 0.0 || params.ybar > ny as f64 {
        warn!(
            "fitted centroid ({}, {}) lies outside the island's chunk bounds",
            params.xbar, params.ybar
        );
    }

    Ok(FitOutcome {
        params,
        errors,
        chisq: fit_result.chisq,
        reduced_chisq,
    })
}

fn peak_value(island: &Island) -> f64 {
    island
        .pixels_subarray
        .unmasked_values()
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max)
}

fn rms_at(island: &Island, x: f64, y: f64) -> f64 {
    let (nx, ny) = island.rms_subarray.dim();
    let i = (x.round() as i64).clamp(0, nx as i64 - 1) as usize;
    let j = (y.round() as i64).clamp(0, ny as i64 - 1) as usize;
    island.rms_subarray[[i, j]].max(1e-12)
}

/// Which indices into the 6-element parameter vector are free, given
/// `fixed_mode`.
fn free_indices_for(fixed_mode: FixedMode) -> Vec<usize> {
    match fixed_mode {
        FixedMode::None => vec![0, 1, 2, 3, 4, 5],
        FixedMode::Position { .. } => vec![0, 3, 4, 5],
        FixedMode::PositionAndShape(_) => vec![0],
    }
}

fn expand_params(free_values: &[f64], free_indices: &[usize], initial: &GaussianParams) -> [f64; 6] {
    let mut full = initial.to_vec();
    for (&idx, &val) in free_indices.iter().zip(free_values.iter()) {
        full[idx] = val;
    }
    full
}

struct RunResult {
    params: Vec<f64>,
    covariance: ndarray::Array2<f64>,
    chisq: f64,
}

fn run_fit(island: &Island, initial: GaussianParams, fixed_mode: FixedMode) -> Result<(Vec<usize>, RunResult), FitError> {
    let free_indices = free_indices_for(fixed_mode);
    let full_initial = initial.to_vec();
    let free_initial: Vec<f64> = free_indices.iter().map(|&i| full_initial[i]).collect();

    let (nx, ny) = island.pixels_subarray.dim();
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut data = Vec::new();
    let mut weights = Vec::new();
    for i in 0..nx {
        for j in 0..ny {
            if island.pixels_subarray.mask[[i, j]] {
                continue;
            }
            xs.push(i as f64);
            ys.push(j as f64);
            data.push(island.pixels_subarray.values[[i, j]]);
            weights.push(1.0 / island.rms_subarray[[i, j]].max(1e-12));
        }
    }
    if data.is_empty() {
        return Err(FitError::FitFailed);
    }

    let residuals = |free: &[f64]| -> Vec<f64> {
        let full = expand_params(free, &free_indices, &initial);
        let params = GaussianParams::from_vec(full);
        itertools::izip!(xs.iter(), ys.iter(), data.iter(), weights.iter())
            .map(|(&x, &y, &d, &w)| (params.eval(x, y) - d) * w)
            .collect()
    };

    match lm::levenberg_marquardt(&free_initial, residuals, FIT_MAX_ITERATIONS, FIT_CONVERGENCE_TOLERANCE) {
        Some(result) => Ok((
            free_indices,
            RunResult {
                params: result.params,
                covariance: result.covariance,
                chisq: result.chisq,
            },
        )),
        None => Err(FitError::FitFailed),
    }
}

/// Propagate formal parameter errors from the fit covariance, scaled by
/// the local noise, with a Condon (1997)-style correlation-length
/// correction for the loss of independent information near the beam
/// scale. The exact closed form is not reconstructable from the retrieval
/// pack (see `DESIGN.md`); this applies the standard covariance scaling
/// `sigma_i = rms * sqrt(covariance[i,i])` and inflates it by the ratio of
/// the beam's correlation length to the fitted source size when the
/// source is at or below the beam scale.
fn propagate_errors(island: &Island, fit: &RunResult, free_indices: &[usize], rms_centre: f64) -> GaussianParams {
    let (long, short) = island.beam.correlation_lengths();
    let mut sigma_full = [0.0f64; 6];
    for (k, &idx) in free_indices.iter().enumerate() {
        let variance = fit.covariance[[k, k]];
        let raw = if variance.is_finite() && variance >= 0.0 {
            rms_centre * variance.sqrt()
        } else {
            f64::INFINITY
        };
        sigma_full[idx] = raw;
    }

    let smaj = fit
        .params
        .get(free_indices.iter().position(|&i| i == 3).unwrap_or(usize::MAX))
        .copied()
        .unwrap_or(long);
    let condon_factor = if smaj > 0.0 { (long / smaj).max(1.0) } else { 1.0 };

    // Positional errors (xbar, ybar) pick up the Condon correlation-length
    // inflation; shape and peak errors do not.
    sigma_full[1] *= condon_factor;
    sigma_full[2] *= condon_factor;
    let _ = short;

    GaussianParams::from_vec(sigma_full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::Beam;
    use crate::masked_array::MaskedArray2;
    use approx::assert_relative_eq;
    use model::{render, GaussianParams as GP};
    use ndarray::Array2;

    fn synthetic_island(peak: f64, xbar: f64, ybar: f64, smaj: f64, smin: f64, theta: f64, size: usize, rms: f64) -> Island {
        let params = GP {
            peak,
            xbar,
            ybar,
            semimajor: smaj,
            semiminor: smin,
            theta,
        };
        let values = render(&params, (size, size));
        let mask = Array2::from_elem((size, size), false);
        Island {
            label: 1,
            pixels_subarray: MaskedArray2::new(values, mask),
            rms_subarray: Array2::from_elem((size, size), rms),
            chunk_bounds: ((0, 0), (size, size)),
            analysis_threshold_effective: 3.0 * rms,
            detection_threshold_subarray: Array2::from_elem((size, size), 5.0 * rms),
            beam: Beam::new(smaj, smin, theta),
        }
    }

    #[test]
    fn recovers_injected_circular_source() {
        let island = synthetic_island(5.0, 16.0, 16.0, 3.0, 3.0, 0.0, 32, 0.001);
        let outcome = fit_island(&island, FixedMode::None, false).unwrap();
        assert_relative_eq!(outcome.params.peak, 5.0, epsilon = 1e-2);
        assert_relative_eq!(outcome.params.xbar, 16.0, epsilon = 0.1);
        assert_relative_eq!(outcome.params.ybar, 16.0, epsilon = 0.1);
    }

    #[test]
    fn position_fixed_mode_pins_centroid() {
        let island = synthetic_island(5.0, 16.0, 16.0, 3.0, 3.0, 0.0, 32, 0.001);
        let outcome = fit_island(&island, FixedMode::Position { xbar: 16.0, ybar: 16.0 }, false).unwrap();
        assert_relative_eq!(outcome.params.xbar, 16.0);
        assert_relative_eq!(outcome.params.ybar, 16.0);
    }

    #[test]
    fn position_and_shape_fixed_mode_pins_everything_but_peak() {
        let island = synthetic_island(5.0, 16.0, 16.0, 3.0, 3.0, 0.0, 32, 0.001);
        let fixed = GP {
            peak: 1.0,
            xbar: 16.0,
            ybar: 16.0,
            semimajor: 3.0,
            semiminor: 3.0,
            theta: 0.0,
        };
        let outcome = fit_island(&island, FixedMode::PositionAndShape(fixed), false).unwrap();
        assert_relative_eq!(outcome.params.xbar, 16.0);
        assert_relative_eq!(outcome.params.semimajor, 3.0);
        assert_relative_eq!(outcome.params.peak, 5.0, epsilon = 1e-2);
    }

    #[test]
    fn all_masked_island_fails_to_fit() {
        let values = Array2::from_elem((5, 5), 0.0);
        let mask = Array2::from_elem((5, 5), true);
        let island = Island {
            label: 1,
            pixels_subarray: MaskedArray2::new(values, mask),
            rms_subarray: Array2::from_elem((5, 5), 1.0),
            chunk_bounds: ((0, 0), (5, 5)),
            analysis_threshold_effective: 3.0,
            detection_threshold_subarray: Array2::from_elem((5, 5), 5.0),
            beam: Beam::new(2.0, 2.0, 0.0),
        };
        let err = fit_island(&island, FixedMode::None, false).unwrap_err();
        assert_eq!(err, FitError::MomentsNotApplicable);
    }
}
