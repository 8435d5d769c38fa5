// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The result assembler (C9): converts pixel-space fits into sky-coordinate
//! detections, adds systematic error budgets, and filters physically
//! unreasonable results. See spec §4.9.

use log::warn;
use ndarray::Array2;

use crate::fit::model::GaussianParams;
use crate::fit::FitOutcome;
use crate::islands::Island;
use crate::wcs::Wcs;

const RAD_TO_ARCSEC: f64 = 180.0 / std::f64::consts::PI * 3600.0;
const WCS_JACOBIAN_STEP_PX: f64 = 1e-3;

/// A single measured source, converted to sky coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub ra_rad: f64,
    pub ra_err_arcsec: f64,
    pub dec_rad: f64,
    pub dec_err_arcsec: f64,
    pub peak_flux: f64,
    pub peak_err: f64,
    pub integrated_flux: f64,
    pub flux_err: f64,
    pub semimajor: f64,
    pub semiminor: f64,
    pub theta: f64,
    pub x_pix: f64,
    pub y_pix: f64,
    pub chisq: f64,
    pub reduced_chisq: f64,
    pub sig: f64,
}

/// Convert a fit result for `island` into a [`Detection`], or `None` if it
/// fails one of spec §4.9's validation rules (non-finite positional error,
/// a semi-axis endpoint off the reliable image, or an out-of-projection
/// sky position).
pub fn assemble(
    island: &Island,
    fit: &FitOutcome,
    wcs: &dyn Wcs,
    full_mask: &Array2<bool>,
    systematics_arcsec: (f64, f64),
) -> Option<Detection> {
    let (row0, col0) = island.chunk_bounds.0;
    let abs_x = row0 as f64 + fit.params.xbar;
    let abs_y = col0 as f64 + fit.params.ybar;

    // FITS pixel convention is 1-indexed; our grids are 0-indexed.
    let (ra, dec) = match wcs.pix_to_sky(abs_x + 1.0, abs_y + 1.0) {
        Ok(v) => v,
        Err(e) => {
            warn!("fitted position does not map to sky: {e}");
            return None;
        }
    };

    let (dra_dx, ddec_dx) = partial(wcs, abs_x, abs_y, 1.0, 0.0)?;
    let (dra_dy, ddec_dy) = partial(wcs, abs_x, abs_y, 0.0, 1.0)?;

    let x_err = fit.errors.xbar;
    let y_err = fit.errors.ybar;
    let ra_err_rad = ((dra_dx * x_err).powi(2) + (dra_dy * y_err).powi(2)).sqrt();
    let dec_err_rad = ((ddec_dx * x_err).powi(2) + (ddec_dy * y_err).powi(2)).sqrt();

    let (ra_sys, dec_sys) = systematics_arcsec;
    let ra_err_arcsec = ((ra_err_rad * RAD_TO_ARCSEC).powi(2) + ra_sys.powi(2)).sqrt();
    let dec_err_arcsec = ((dec_err_rad * RAD_TO_ARCSEC).powi(2) + dec_sys.powi(2)).sqrt();

    if !ra_err_arcsec.is_finite() || !dec_err_arcsec.is_finite() {
        return None;
    }

    if !axis_endpoints_on_image(island, &fit.params, full_mask) {
        return None;
    }

    let beam = island.beam;
    let area_ratio = (fit.params.semimajor * fit.params.semiminor) / (beam.semimajor_px * beam.semiminor_px).max(1e-12);
    let integrated_flux = fit.params.peak * area_ratio;

    let peak_err = fit.errors.peak;
    let smaj_err = fit.errors.semimajor;
    let smin_err = fit.errors.semiminor;
    let rel_err = ((peak_err / fit.params.peak.abs().max(1e-12)).powi(2)
        + (smaj_err / fit.params.semimajor.abs().max(1e-12)).powi(2)
        + (smin_err / fit.params.semiminor.abs().max(1e-12)).powi(2))
    .sqrt();
    let flux_err = integrated_flux.abs() * rel_err;

    let rms_centre = rms_at_centre(island, fit.params.xbar, fit.params.ybar);
    let sig = fit.params.peak / rms_centre;

    Some(Detection {
        ra_rad: ra,
        ra_err_arcsec,
        dec_rad: dec,
        dec_err_arcsec,
        peak_flux: fit.params.peak,
        peak_err,
        integrated_flux,
        flux_err,
        semimajor: fit.params.semimajor,
        semiminor: fit.params.semiminor,
        theta: fit.params.theta,
        x_pix: abs_x,
        y_pix: abs_y,
        chisq: fit.chisq,
        reduced_chisq: fit.reduced_chisq,
        sig,
    })
}

fn partial(wcs: &dyn Wcs, x: f64, y: f64, dx: f64, dy: f64) -> Option<(f64, f64)> {
    let base = wcs.pix_to_sky(x + 1.0, y + 1.0).ok()?;
    let step = wcs
        .pix_to_sky(x + 1.0 + dx * WCS_JACOBIAN_STEP_PX, y + 1.0 + dy * WCS_JACOBIAN_STEP_PX)
        .ok()?;
    Some(((step.0 - base.0) / WCS_JACOBIAN_STEP_PX, (step.1 - base.1) / WCS_JACOBIAN_STEP_PX))
}

fn rms_at_centre(island: &Island, x: f64, y: f64) -> f64 {
    let (nx, ny) = island.rms_subarray.dim();
    let i = (x.round() as i64).clamp(0, nx as i64 - 1) as usize;
    let j = (y.round() as i64).clamp(0, ny as i64 - 1) as usize;
    island.rms_subarray[[i, j]].max(1e-12)
}

/// Spec §4.9: reject if any of the four semi-axis endpoints maps to a
/// masked or out-of-image pixel in the full image.
fn axis_endpoints_on_image(island: &Island, params: &GaussianParams, full_mask: &Array2<bool>) -> bool {
    let (row0, col0) = island.chunk_bounds.0;
    let abs_x = row0 as f64 + params.xbar;
    let abs_y = col0 as f64 + params.ybar;
    let (ct, st) = (params.theta.cos(), params.theta.sin());
    let endpoints = [
        (abs_x + params.semimajor * ct, abs_y + params.semimajor * st),
        (abs_x - params.semimajor * ct, abs_y - params.semimajor * st),
        (abs_x - params.semiminor * st, abs_y + params.semiminor * ct),
        (abs_x + params.semiminor * st, abs_y - params.semiminor * ct),
    ];
    let (nx, ny) = full_mask.dim();
    for (ex, ey) in endpoints {
        if ex < 0.0 || ey < 0.0 || ex >= nx as f64 || ey >= ny as f64 {
            return false;
        }
        if full_mask[[ex.round() as usize, ey.round() as usize]] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::Beam;
    use crate::masked_array::MaskedArray2;
    use crate::wcs::TangentPlaneWcs;
    use ndarray::Array2;

    fn wcs() -> TangentPlaneWcs {
        TangentPlaneWcs::new_sin([0.0, 0.0], [128.0, 128.0], [-1.0 / 3600.0, 1.0 / 3600.0])
    }

    fn sample_island() -> Island {
        let values = Array2::from_elem((16, 16), 0.5);
        let mask = Array2::from_elem((16, 16), false);
        Island {
            label: 1,
            pixels_subarray: MaskedArray2::new(values, mask),
            rms_subarray: Array2::from_elem((16, 16), 0.01),
            chunk_bounds: ((120, 120), (136, 136)),
            analysis_threshold_effective: 0.03,
            detection_threshold_subarray: Array2::from_elem((16, 16), 0.1),
            beam: Beam::new(2.0, 2.0, 0.0),
        }
    }

    fn sample_fit() -> FitOutcome {
        FitOutcome {
            params: GaussianParams {
                peak: 0.5,
                xbar: 8.0,
                ybar: 8.0,
                semimajor: 2.0,
                semiminor: 2.0,
                theta: 0.0,
            },
            errors: GaussianParams {
                peak: 0.01,
                xbar: 0.05,
                ybar: 0.05,
                semimajor: 0.1,
                semiminor: 0.1,
                theta: 0.01,
            },
            chisq: 10.0,
            reduced_chisq: 1.0,
        }
    }

    #[test]
    fn valid_fit_produces_a_detection() {
        let island = sample_island();
        let fit = sample_fit();
        let mask = Array2::from_elem((256, 256), false);
        let det = assemble(&island, &fit, &wcs(), &mask, (0.0, 0.0)).unwrap();
        assert!(det.ra_err_arcsec.is_finite());
        assert!(det.dec_err_arcsec.is_finite());
        assert!(det.integrated_flux > 0.0);
    }

    #[test]
    fn semi_axis_endpoint_off_image_is_rejected() {
        let island = sample_island();
        let mut fit = sample_fit();
        fit.params.semimajor = 1000.0;
        let mask = Array2::from_elem((256, 256), false);
        assert!(assemble(&island, &fit, &wcs(), &mask, (0.0, 0.0)).is_none());
    }

    #[test]
    fn masked_endpoint_is_rejected() {
        let island = sample_island();
        let fit = sample_fit();
        let mut mask = Array2::from_elem((256, 256), false);
        // The +semimajor endpoint along theta=0 lands at (128+2, 128) in
        // full-image coordinates.
        mask[[130, 128]] = true;
        assert!(assemble(&island, &fit, &wcs(), &mask, (0.0, 0.0)).is_none());
    }

    #[test]
    fn systematics_inflate_the_reported_error() {
        let island = sample_island();
        let fit = sample_fit();
        let mask = Array2::from_elem((256, 256), false);
        let without = assemble(&island, &fit, &wcs(), &mask, (0.0, 0.0)).unwrap();
        let with = assemble(&island, &fit, &wcs(), &mask, (10.0, 10.0)).unwrap();
        assert!(with.ra_err_arcsec > without.ra_err_arcsec);
        assert!(with.dec_err_arcsec > without.dec_err_arcsec);
    }
}
