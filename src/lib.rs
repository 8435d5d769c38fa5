// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A source-extraction engine for calibrated radio-astronomy images.
//!
//! Given a pixel array, its world-coordinate system, and a synthesized
//! beam, [`Engine`] estimates the local background and noise, labels
//! islands of significant emission, optionally deblends them, and fits
//! each with an elliptical Gaussian to produce a list of [`Detection`]s.

pub mod background;
pub mod beam;
pub(crate) mod config;
pub(crate) mod constants;
pub mod deblend;
pub mod detection;
pub mod engine;
pub(crate) mod error;
pub mod fdr;
pub mod fit;
pub mod islands;
pub mod mask;
pub mod masked_array;
pub(crate) mod stats;
pub mod wcs;

pub use beam::Beam;
pub use config::{Config, ConfigError, StructuringElement, FULL_STRUCTURING_ELEMENT, PLUS_STRUCTURING_ELEMENT};
pub use detection::Detection;
pub use engine::{Engine, ForcedFixedMode};
pub use error::SourceFindError;
pub use fit::{FitError, FixedMode};
pub use islands::Island;
pub use masked_array::MaskedArray2;
pub use wcs::{TangentPlaneWcs, Wcs, WcsError};
