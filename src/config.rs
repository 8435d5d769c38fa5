// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The engine's parameter set (spec §3).
//!
//! [`Config`] is a plain, `serde`-derived struct so it can round-trip
//! through TOML/JSON the way the rest of this crate's ambient stack expects.
//! [`Config::from_options`] is the entry point for a caller that only has a
//! flat, dynamically-typed mapping of option names to values (spec §6); it
//! rejects anything it doesn't recognise with [`ConfigError::UnknownOption`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The 3x3 connectivity mask used by the island labeller (C5). A non-zero
/// entry means that offset participates in connectivity; the centre entry
/// is ignored.
pub type StructuringElement = [[u8; 3]; 3];

/// 4-connected "plus" structuring element, the most common default for
/// island labelling.
pub const PLUS_STRUCTURING_ELEMENT: StructuringElement = [[0, 1, 0], [1, 1, 1], [0, 1, 0]];

/// 8-connected structuring element.
pub const FULL_STRUCTURING_ELEMENT: StructuringElement = [[1, 1, 1], [1, 1, 1], [1, 1, 1]];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown configuration option: `{0}`")]
    UnknownOption(String),

    #[error("invalid value for configuration option `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub back_size_x: usize,
    pub back_size_y: usize,
    pub margin: usize,
    pub radius: usize,
    pub max_degradation: f64,
    /// Window size for median-filtering the coarse background/RMS grids
    /// before interpolation (C4, spec §4.4 item 1); `0` disables it.
    pub median_filter: usize,
    /// If nonzero, a median-filtered grid entry only replaces the raw entry
    /// where they differ by more than this; if zero and `median_filter > 0`,
    /// the filtered grid replaces the raw grid outright (spec §4.4 item 1).
    pub mf_threshold: f64,
    /// Spline order used to resample the coarse grid up to full resolution
    /// (C4, spec §4.4 item 2): `order >= 3` is bicubic, anything lower is
    /// bilinear.
    pub interpolate_order: usize,
    pub detection_threshold: f64,
    pub analysis_threshold: f64,
    pub fdr_alpha: f64,
    pub structuring_element: StructuringElement,
    pub deblend: bool,
    pub deblend_nthresh: usize,
    pub force_beam: bool,
    /// If true, the engine retains image-sized gaussian-fit and deblending
    /// residual maps from the most recent blind/FDR extraction (spec §3,
    /// §5 resource ceiling); see [`crate::engine::Engine::residual_maps`].
    pub residuals: bool,
    /// Fraction of the median RMS below which a pixel's noise estimate is
    /// considered unusable (spec §4.5, §9 Open Questions). Exposed as a
    /// parameter, defaulting to the value the source system hard-codes.
    pub rms_filter: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            back_size_x: 32,
            back_size_y: 32,
            margin: 0,
            radius: 0,
            max_degradation: 0.2,
            median_filter: 0,
            mf_threshold: 0.0,
            interpolate_order: 1,
            detection_threshold: 10.0,
            analysis_threshold: 3.0,
            fdr_alpha: 1e-2,
            structuring_element: PLUS_STRUCTURING_ELEMENT,
            deblend: false,
            deblend_nthresh: 32,
            force_beam: false,
            residuals: true,
            rms_filter: 0.001,
        }
    }
}

macro_rules! take_f64 {
    ($opts:expr, $key:expr, $default:expr) => {
        match $opts.remove($key) {
            None => $default,
            Some(v) => v.as_f64().ok_or_else(|| ConfigError::InvalidValue {
                key: $key.to_string(),
                reason: "expected a number".to_string(),
            })?,
        }
    };
}

macro_rules! take_usize {
    ($opts:expr, $key:expr, $default:expr) => {
        match $opts.remove($key) {
            None => $default,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: $key.to_string(),
                    reason: "expected a non-negative integer".to_string(),
                })?
                .try_into()
                .map_err(|_| ConfigError::InvalidValue {
                    key: $key.to_string(),
                    reason: "integer out of range".to_string(),
                })?,
        }
    };
}

macro_rules! take_bool {
    ($opts:expr, $key:expr, $default:expr) => {
        match $opts.remove($key) {
            None => $default,
            Some(v) => v.as_bool().ok_or_else(|| ConfigError::InvalidValue {
                key: $key.to_string(),
                reason: "expected a boolean".to_string(),
            })?,
        }
    };
}

impl Config {
    /// Build a `Config` from a flat mapping of option name to JSON-ish
    /// value, as described in spec §6. Any key left over once all
    /// recognised options have been consumed is rejected.
    pub fn from_options(options: &HashMap<String, Value>) -> Result<Self, ConfigError> {
        let mut opts = options.clone();
        let defaults = Self::default();

        let structuring_element = match opts.remove("structuring_element") {
            None => defaults.structuring_element,
            Some(v) => parse_structuring_element(&v)?,
        };

        let config = Self {
            back_size_x: take_usize!(opts, "back_size_x", defaults.back_size_x),
            back_size_y: take_usize!(opts, "back_size_y", defaults.back_size_y),
            margin: take_usize!(opts, "margin", defaults.margin),
            radius: take_usize!(opts, "radius", defaults.radius),
            max_degradation: take_f64!(opts, "max_degradation", defaults.max_degradation),
            median_filter: take_usize!(opts, "median_filter", defaults.median_filter),
            mf_threshold: take_f64!(opts, "mf_threshold", defaults.mf_threshold),
            interpolate_order: take_usize!(opts, "interpolate_order", defaults.interpolate_order),
            detection_threshold: take_f64!(
                opts,
                "detection_threshold",
                defaults.detection_threshold
            ),
            analysis_threshold: take_f64!(opts, "analysis_threshold", defaults.analysis_threshold),
            fdr_alpha: take_f64!(opts, "fdr_alpha", defaults.fdr_alpha),
            structuring_element,
            deblend: take_bool!(opts, "deblend", defaults.deblend),
            deblend_nthresh: take_usize!(opts, "deblend_nthresh", defaults.deblend_nthresh),
            force_beam: take_bool!(opts, "force_beam", defaults.force_beam),
            residuals: take_bool!(opts, "residuals", defaults.residuals),
            rms_filter: take_f64!(opts, "rms_filter", defaults.rms_filter),
        };

        if let Some(unknown) = opts.keys().next() {
            return Err(ConfigError::UnknownOption(unknown.clone()));
        }

        Ok(config)
    }
}

fn parse_structuring_element(value: &Value) -> Result<StructuringElement, ConfigError> {
    let rows = value.as_array().ok_or_else(|| ConfigError::InvalidValue {
        key: "structuring_element".to_string(),
        reason: "expected a 3x3 array".to_string(),
    })?;
    if rows.len() != 3 {
        return Err(ConfigError::InvalidValue {
            key: "structuring_element".to_string(),
            reason: "expected exactly 3 rows".to_string(),
        });
    }
    let mut out = [[0u8; 3]; 3];
    for (i, row) in rows.iter().enumerate() {
        let cols = row.as_array().ok_or_else(|| ConfigError::InvalidValue {
            key: "structuring_element".to_string(),
            reason: "expected a 3x3 array".to_string(),
        })?;
        if cols.len() != 3 {
            return Err(ConfigError::InvalidValue {
                key: "structuring_element".to_string(),
                reason: "expected exactly 3 columns".to_string(),
            });
        }
        for (j, v) in cols.iter().enumerate() {
            let cell = v.as_u64().ok_or_else(|| ConfigError::InvalidValue {
                key: "structuring_element".to_string(),
                reason: "expected a non-negative integer cell".to_string(),
            })?;
            out[i][j] = cell as u8;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_round_trip_through_json() {
        let cfg = Config::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&s).unwrap();
        assert_eq!(cfg, cfg2);
    }

    #[test]
    fn from_options_applies_overrides() {
        let mut opts = HashMap::new();
        opts.insert("detection_threshold".to_string(), json!(8.0));
        opts.insert("deblend".to_string(), json!(true));
        let cfg = Config::from_options(&opts).unwrap();
        assert_eq!(cfg.detection_threshold, 8.0);
        assert!(cfg.deblend);
        assert_eq!(cfg.analysis_threshold, Config::default().analysis_threshold);
    }

    #[test]
    fn from_options_rejects_unknown_keys() {
        let mut opts = HashMap::new();
        opts.insert("not_a_real_option".to_string(), json!(1));
        let err = Config::from_options(&opts).unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("not_a_real_option".to_string()));
    }
}
