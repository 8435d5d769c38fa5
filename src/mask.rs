// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The masking layer (C1): the logical-OR of projection degradation, a
//! border margin, an off-centre radius cut, and obviously-bad (zero/NaN)
//! pixels. See spec §4.1.

use log::warn;
use ndarray::Array2;

use crate::wcs::Wcs;

/// Build the full mask for an image, given its WCS and the masking options
/// from [`crate::config::Config`].
pub fn build_mask(
    shape: (usize, usize),
    wcs: &dyn Wcs,
    max_degradation: f64,
    margin: usize,
    radius: usize,
    pixels: &Array2<f64>,
) -> Array2<bool> {
    let mut mask = reliable_window(shape, wcs, max_degradation);

    if margin > 0 {
        apply_margin(&mut mask, margin);
    }
    if radius > 0 {
        apply_radius(&mut mask, radius);
    }
    apply_zero_and_nan(&mut mask, pixels);

    mask
}

/// The window within which the image's astrometry is considered reliable
/// (spec §4.1). Returns a mask that is `true` (masked) outside that window.
pub fn reliable_window(shape: (usize, usize), wcs: &dyn Wcs, max_degradation: f64) -> Array2<bool> {
    let (nx, ny) = shape;
    if max_degradation <= 0.0 {
        return Array2::from_elem(shape, false);
    }

    let ctype = wcs.ctype();
    if ctype[0] != "RA---SIN" || ctype[1] != "DEC--SIN" {
        warn!("Not a SIN projection: reliable window not calculated; retaining full image");
        return Array2::from_elem(shape, false);
    }

    let phi_max = (1.0 / (1.0 + max_degradation)).acos();
    let c = 0.5 * std::f64::consts::SQRT_2 * phi_max.sin();
    let cdelt = wcs.cdelt();
    let ra_incr_rad = cdelt[0].abs().to_radians();
    let dec_incr_rad = cdelt[1].abs().to_radians();

    let delta_ra_pix = (c / ra_incr_rad).floor().max(0.0) as i64;
    let delta_dec_pix = (c / dec_incr_rad).floor().max(0.0) as i64;

    let crpix = wcs.crpix();
    // FITS crpix is 1-indexed; convert to our 0-indexed pixel grid.
    let cx = crpix[0] - 1.0;
    let cy = crpix[1] - 1.0;

    let x_lo = ((cx - delta_ra_pix as f64).round() as i64).clamp(0, nx as i64);
    let x_hi = ((cx + delta_ra_pix as f64).round() as i64 + 1).clamp(0, nx as i64);
    let y_lo = ((cy - delta_dec_pix as f64).round() as i64).clamp(0, ny as i64);
    let y_hi = ((cy + delta_dec_pix as f64).round() as i64 + 1).clamp(0, ny as i64);

    let mut mask = Array2::from_elem(shape, true);
    if x_lo < x_hi && y_lo < y_hi {
        for i in x_lo..x_hi {
            for j in y_lo..y_hi {
                mask[[i as usize, j as usize]] = false;
            }
        }
    }
    mask
}

fn apply_margin(mask: &mut Array2<bool>, margin: usize) {
    let (nx, ny) = mask.dim();
    for i in 0..nx {
        for j in 0..ny {
            if i < margin || j < margin || i + margin >= nx || j + margin >= ny {
                mask[[i, j]] = true;
            }
        }
    }
}

fn apply_radius(mask: &mut Array2<bool>, radius: usize) {
    let (nx, ny) = mask.dim();
    let cx = (nx as f64 - 1.0) / 2.0;
    let cy = (ny as f64 - 1.0) / 2.0;
    let r2 = (radius * radius) as f64;
    for i in 0..nx {
        for j in 0..ny {
            let d2 = (i as f64 - cx).powi(2) + (j as f64 - cy).powi(2);
            if d2 > r2 {
                mask[[i, j]] = true;
            }
        }
    }
}

fn apply_zero_and_nan(mask: &mut Array2<bool>, pixels: &Array2<f64>) {
    mask.zip_mut_with(pixels, |m, &p| {
        if p == 0.0 || p.is_nan() {
            *m = true;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wcs::TangentPlaneWcs;
    use ndarray::Array2;

    fn wcs_sin() -> TangentPlaneWcs {
        TangentPlaneWcs::new_sin([0.0, 0.0], [128.0, 128.0], [-1.0 / 3600.0, 1.0 / 3600.0])
    }

    #[test]
    fn max_degradation_zero_retains_full_image() {
        let mask = reliable_window((64, 64), &wcs_sin(), 0.0);
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn non_sin_projection_retains_full_image_with_warning() {
        let mut wcs = wcs_sin();
        wcs.ctype = ["RA---TAN".to_string(), "DEC--TAN".to_string()];
        let mask = reliable_window((64, 64), &wcs, 0.2);
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn margin_masks_border_pixels() {
        let mut mask = Array2::from_elem((10, 10), false);
        apply_margin(&mut mask, 2);
        assert!(mask[[0, 0]]);
        assert!(mask[[1, 5]]);
        assert!(!mask[[5, 5]]);
        assert!(mask[[9, 9]]);
    }

    #[test]
    fn zero_and_nan_pixels_are_masked() {
        let mut mask = Array2::from_elem((2, 2), false);
        let mut pixels = Array2::from_elem((2, 2), 1.0);
        pixels[[0, 0]] = 0.0;
        pixels[[1, 1]] = f64::NAN;
        apply_zero_and_nan(&mut mask, &pixels);
        assert!(mask[[0, 0]]);
        assert!(mask[[1, 1]]);
        assert!(!mask[[0, 1]]);
        assert!(!mask[[1, 0]]);
    }

    #[test]
    fn severe_degradation_shrinks_the_window_to_almost_nothing() {
        // With a very restrictive max_degradation and a coarse pixel scale,
        // the retained rectangle shrinks to a handful of pixels.
        let wcs = TangentPlaneWcs::new_sin([0.0, 0.0], [128.0, 128.0], [-10.0, 10.0]);
        let mask = reliable_window((256, 256), &wcs, 1e-6);
        let unmasked = mask.iter().filter(|&&m| !m).count();
        assert!(unmasked < 10, "expected a tiny reliable window, got {unmasked} unmasked pixels");
    }
}
