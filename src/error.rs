// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for the engine façade (C10). This is the *only* error that
//! propagates to the caller; per-source failures (`FitFailed`,
//! `OutOfProjection`) are logged and the affected source dropped rather than
//! raised (spec §7), and `AllMasked` is absorbed into an empty result.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceFindError {
    /// A user-supplied background or RMS map did not match the image shape.
    #[error("shape mismatch: map is {actual:?}, image is {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// A user-supplied RMS map contained a negative value.
    #[error("RMS map contains negative values")]
    InvalidNoise,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
