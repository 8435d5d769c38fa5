// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The elliptical Gaussian model (C8) and its moment-based initial guess.

use ndarray::Array2;

use crate::islands::Island;

/// The six parameters of an elliptical Gaussian: peak flux density,
/// centroid (pixel coordinates), semi-major/semi-minor axes (pixels, as
/// Gaussian sigmas) and position angle (radians, measured from the pixel
/// x-axis to the major axis).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianParams {
    pub peak: f64,
    pub xbar: f64,
    pub ybar: f64,
    pub semimajor: f64,
    pub semiminor: f64,
    pub theta: f64,
}

impl GaussianParams {
    pub fn to_vec(self) -> [f64; 6] {
        [self.peak, self.xbar, self.ybar, self.semimajor, self.semiminor, self.theta]
    }

    pub fn from_vec(v: [f64; 6]) -> Self {
        Self {
            peak: v[0],
            xbar: v[1],
            ybar: v[2],
            semimajor: v[3],
            semiminor: v[4],
            theta: v[5],
        }
    }

    /// Evaluate the model at pixel coordinates `(x, y)`.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let (a, b, c) = self.quadratic_form();
        let dx = x - self.xbar;
        let dy = y - self.ybar;
        self.peak * (-(a * dx * dx + 2.0 * b * dx * dy + c * dy * dy)).exp()
    }

    /// The `(A, B, C)` coefficients of the quadratic form in the Gaussian
    /// exponent, for a Gaussian whose major axis is rotated by `theta` from
    /// the x-axis.
    pub fn quadratic_form(&self) -> (f64, f64, f64) {
        let ct = self.theta.cos();
        let st = self.theta.sin();
        let smaj2 = 2.0 * self.semimajor * self.semimajor;
        let smin2 = 2.0 * self.semiminor * self.semiminor;
        let a = ct * ct / smaj2 + st * st / smin2;
        let b = st * ct * (1.0 / smin2 - 1.0 / smaj2);
        let c = st * st / smaj2 + ct * ct / smin2;
        (a, b, c)
    }
}

/// Compute a moment-based initial guess for the Gaussian parameters over
/// `island`'s unmasked pixels (spec §4.8 item 1). Returns `None` if the
/// second-moment matrix is not positive definite (degenerate or
/// single-pixel islands), signalling the caller should raise
/// `MomentsNotApplicable`.
pub fn moments_guess(island: &Island) -> Option<GaussianParams> {
    let (nx, ny) = island.pixels_subarray.dim();
    let mut sum_v = 0.0;
    let mut sum_vx = 0.0;
    let mut sum_vy = 0.0;
    let mut peak = f64::NEG_INFINITY;

    for i in 0..nx {
        for j in 0..ny {
            if island.pixels_subarray.mask[[i, j]] {
                continue;
            }
            let v = island.pixels_subarray.values[[i, j]].max(0.0);
            sum_v += v;
            sum_vx += v * i as f64;
            sum_vy += v * j as f64;
            peak = peak.max(island.pixels_subarray.values[[i, j]]);
        }
    }
    if sum_v <= 0.0 || !peak.is_finite() {
        return None;
    }
    let xbar = sum_vx / sum_v;
    let ybar = sum_vy / sum_v;

    let mut mxx = 0.0;
    let mut myy = 0.0;
    let mut mxy = 0.0;
    for i in 0..nx {
        for j in 0..ny {
            if island.pixels_subarray.mask[[i, j]] {
                continue;
            }
            let v = island.pixels_subarray.values[[i, j]].max(0.0);
            let dx = i as f64 - xbar;
            let dy = j as f64 - ybar;
            mxx += v * dx * dx;
            myy += v * dy * dy;
            mxy += v * dx * dy;
        }
    }
    mxx /= sum_v;
    myy /= sum_v;
    mxy /= sum_v;

    let det = mxx * myy - mxy * mxy;
    if det <= 0.0 || mxx <= 0.0 || myy <= 0.0 {
        return None;
    }

    let trace = mxx + myy;
    let disc = ((mxx - myy).powi(2) + 4.0 * mxy * mxy).sqrt();
    let lambda1 = 0.5 * (trace + disc);
    let lambda2 = 0.5 * (trace - disc);
    if lambda2 <= 0.0 {
        return None;
    }

    let theta = 0.5 * (2.0 * mxy).atan2(mxx - myy);
    Some(GaussianParams {
        peak,
        xbar,
        ybar,
        semimajor: lambda1.sqrt(),
        semiminor: lambda2.sqrt(),
        theta,
    })
}

/// Evaluate the model over the shape of `template`, for residual-map
/// construction.
pub fn render(params: &GaussianParams, shape: (usize, usize)) -> Array2<f64> {
    Array2::from_shape_fn(shape, |(i, j)| params.eval(i as f64, j as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::Beam;
    use crate::masked_array::MaskedArray2;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn synthetic_island(peak: f64, xbar: f64, ybar: f64, smaj: f64, smin: f64, theta: f64, size: usize) -> Island {
        let params = GaussianParams {
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
            rms_subarray: Array2::from_elem((size, size), 0.01),
            chunk_bounds: ((0, 0), (size, size)),
            analysis_threshold_effective: 0.01,
            detection_threshold_subarray: Array2::from_elem((size, size), 0.05),
            beam: Beam::new(smaj, smin, theta),
        }
    }

    #[test]
    fn eval_peaks_at_centroid() {
        let params = GaussianParams {
            peak: 3.0,
            xbar: 5.0,
            ybar: 5.0,
            semimajor: 2.0,
            semiminor: 2.0,
            theta: 0.0,
        };
        assert_relative_eq!(params.eval(5.0, 5.0), 3.0);
        assert!(params.eval(7.0, 5.0) < 3.0);
    }

    #[test]
    fn moments_recover_circular_source_centroid() {
        let island = synthetic_island(10.0, 16.0, 16.0, 2.5, 2.5, 0.0, 32);
        let guess = moments_guess(&island).unwrap();
        assert_relative_eq!(guess.xbar, 16.0, epsilon = 0.5);
        assert_relative_eq!(guess.ybar, 16.0, epsilon = 0.5);
    }

    #[test]
    fn single_bright_pixel_has_no_moments_guess() {
        let mut values = Array2::from_elem((5, 5), 0.0);
        values[[2, 2]] = 10.0;
        let mask = Array2::from_elem((5, 5), false);
        let island = Island {
            label: 1,
            pixels_subarray: MaskedArray2::new(values, mask),
            rms_subarray: Array2::from_elem((5, 5), 0.01),
            chunk_bounds: ((0, 0), (5, 5)),
            analysis_threshold_effective: 0.01,
            detection_threshold_subarray: Array2::from_elem((5, 5), 0.05),
            beam: Beam::new(2.0, 2.0, 0.0),
        };
        assert!(moments_guess(&island).is_none());
    }
}
