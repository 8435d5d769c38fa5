// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! World Coordinate System contract.
//!
//! Per spec §6, the image accessor (including its WCS) is an external
//! collaborator: this crate only depends on the small surface needed to mask
//! projection-degraded pixels (§4.1), convert fitted pixel positions to sky
//! coordinates and propagate their errors (§4.9), and map caller-supplied
//! sky positions back to pixels for forced photometry (§4.10). Real WCS
//! math (general projections, SIP distortion, etc) lives outside this
//! crate; [`TangentPlaneWcs`] is a minimal implementation used by this
//! crate's own tests.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum WcsError {
    #[error("sky position (ra={ra}, dec={dec}) does not map onto the image")]
    OutOfProjection { ra: f64, dec: f64 },
}

/// The mapping between pixel indices and sky coordinates.
pub trait Wcs {
    fn crval(&self) -> [f64; 2];
    fn crpix(&self) -> [f64; 2];
    /// Pixel scale, degrees/pixel.
    fn cdelt(&self) -> [f64; 2];
    fn ctype(&self) -> [String; 2];

    /// Pixel (x, y) -> sky (ra, dec), radians.
    fn pix_to_sky(&self, x: f64, y: f64) -> Result<(f64, f64), WcsError>;

    /// Sky (ra, dec), radians -> pixel (x, y).
    fn sky_to_pix(&self, ra: f64, dec: f64) -> Result<(f64, f64), WcsError>;
}

/// A flat-sky (tangent-plane) approximation to a SIN-projected WCS, good
/// enough over the small fields this crate is tested against. `crval` is in
/// radians, `cdelt` in degrees/pixel (as FITS headers store it), `crpix` in
/// 1-indexed FITS pixel convention.
#[derive(Debug, Clone)]
pub struct TangentPlaneWcs {
    pub crval_rad: [f64; 2],
    pub crpix: [f64; 2],
    pub cdelt_deg: [f64; 2],
    pub ctype: [String; 2],
}

impl TangentPlaneWcs {
    pub fn new_sin(crval_rad: [f64; 2], crpix: [f64; 2], cdelt_deg: [f64; 2]) -> Self {
        Self {
            crval_rad,
            crpix,
            cdelt_deg,
            ctype: ["RA---SIN".to_string(), "DEC--SIN".to_string()],
        }
    }
}

impl Wcs for TangentPlaneWcs {
    fn crval(&self) -> [f64; 2] {
        self.crval_rad
    }

    fn crpix(&self) -> [f64; 2] {
        self.crpix
    }

    fn cdelt(&self) -> [f64; 2] {
        self.cdelt_deg
    }

    fn ctype(&self) -> [String; 2] {
        self.ctype.clone()
    }

    fn pix_to_sky(&self, x: f64, y: f64) -> Result<(f64, f64), WcsError> {
        let xi = (x - self.crpix[0]) * self.cdelt_deg[0].to_radians();
        let eta = (y - self.crpix[1]) * self.cdelt_deg[1].to_radians();
        let dec0 = self.crval_rad[1];
        let ra = self.crval_rad[0] + xi / dec0.cos().max(1e-9);
        let dec = dec0 + eta;
        Ok((ra, dec))
    }

    fn sky_to_pix(&self, ra: f64, dec: f64) -> Result<(f64, f64), WcsError> {
        let dec0 = self.crval_rad[1];
        let dra = ra - self.crval_rad[0];
        // Wrap to [-pi, pi] so positions near the RA branch cut still map
        // sensibly.
        let dra = dra.rem_euclid(2.0 * std::f64::consts::PI);
        let dra = if dra > std::f64::consts::PI {
            dra - 2.0 * std::f64::consts::PI
        } else {
            dra
        };
        let xi = dra * dec0.cos();
        let eta = dec - dec0;
        if xi.abs() > std::f64::consts::FRAC_PI_2 || eta.abs() > std::f64::consts::FRAC_PI_2 {
            return Err(WcsError::OutOfProjection { ra, dec });
        }
        let x = self.crpix[0] + xi.to_degrees() / self.cdelt_deg[0];
        let y = self.crpix[1] + eta.to_degrees() / self.cdelt_deg[1];
        Ok((x, y))
    }
}
