// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Numeric constants shared across the engine's components.
*/

pub use std::f64::consts::PI;

/// The clip multiple (in units of sigma) used by the iterative sigma-clip
/// kernel (C2). Fixed, rather than user-configurable, matching the source
/// system's behaviour.
pub const CLIP_KAPPA: f64 = 3.0;

/// Hard bound on sigma-clip iterations (C2), in case the clipped sample
/// oscillates rather than converging.
pub const CLIP_MAX_ITERATIONS: usize = 10;

/// Skewness ratio above which a tile's background level is taken as the
/// median rather than the Pearson skewness-corrected mean (C3, spec §4.3).
pub const SKEWNESS_THRESHOLD: f64 = 0.3;

/// Relative parameter-change convergence criterion for the Gaussian fitter
/// (C8, spec §4.8 item 3).
pub const FIT_CONVERGENCE_TOLERANCE: f64 = 1e-6;

/// Hard bound on Levenberg-Marquardt iterations (C8).
pub const FIT_MAX_ITERATIONS: usize = 200;

/// Default cap on the number of distinct thresholds the label-map cache
/// (spec §5, §9) will hold before evicting the oldest entry.
pub const LABEL_CACHE_CAPACITY: usize = 32;
