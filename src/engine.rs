// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The engine façade (C10): holds one image plus its parameters, lazily
//! derives and caches C1-C4 products, and exposes the public extraction
//! operations. See spec §4.10, §5, §9.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use ndarray::Array2;

use crate::background;
use crate::beam::Beam;
use crate::config::Config;
use crate::constants::LABEL_CACHE_CAPACITY;
use crate::deblend;
use crate::detection::{self, Detection};
use crate::fdr;
use crate::fit::model;
use crate::fit::{self, FixedMode};
use crate::islands::{self, Island};
use crate::mask;
use crate::masked_array::MaskedArray2;
use crate::wcs::Wcs;
use crate::SourceFindError;

/// Which parameters [`Engine::fit_at_positions`] pins during forced
/// photometry (spec §4.10).
#[derive(Debug, Clone, Copy)]
pub enum ForcedFixedMode {
    Position,
    PositionAndError,
}

/// A small LRU cache of label maps keyed by the (bit-pattern of the)
/// detection threshold they were built at (spec §9).
struct LabelCache {
    order: VecDeque<u64>,
    maps: HashMap<u64, Array2<usize>>,
    capacity: usize,
}

impl LabelCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            maps: HashMap::new(),
            capacity,
        }
    }

    fn get_or_insert_with(&mut self, key: f64, build: impl FnOnce() -> Array2<usize>) -> &Array2<usize> {
        let bits = key.to_bits();
        if !self.maps.contains_key(&bits) {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.maps.remove(&oldest);
                }
            }
            self.maps.insert(bits, build());
            self.order.push_back(bits);
        }
        self.maps.get(&bits).unwrap()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.maps.clear();
    }
}

/// The stateful source-extraction engine for one image. Not `Sync` while
/// mutating: per spec §5, share read-only across threads only after all
/// derived products have been realised.
pub struct Engine {
    pixels: Array2<f64>,
    wcs: Box<dyn Wcs>,
    beam: Beam,
    systematics_arcsec: (f64, f64),
    config: Config,

    mask: Option<Array2<bool>>,
    bg_map: Option<MaskedArray2>,
    rms_map: Option<MaskedArray2>,
    bg_subtracted: Option<MaskedArray2>,
    label_maps: LabelCache,

    /// Per-pixel residual maps from the most recent blind/FDR extraction,
    /// retained only when `config.residuals` is set (spec §3, §5).
    residual_gauss: Option<Array2<f64>>,
    residual_deblend: Option<Array2<f64>>,
}

impl Engine {
    pub fn new(pixels: Array2<f64>, wcs: Box<dyn Wcs>, beam: Beam, systematics_arcsec: (f64, f64), config: Config) -> Self {
        Self {
            pixels,
            wcs,
            beam,
            systematics_arcsec,
            config,
            mask: None,
            bg_map: None,
            rms_map: None,
            bg_subtracted: None,
            label_maps: LabelCache::new(LABEL_CACHE_CAPACITY),
            residual_gauss: None,
            residual_deblend: None,
        }
    }

    /// Drop all derived products. Must be called if upstream parameters
    /// (other than through the override setters, which call this
    /// themselves) change.
    pub fn clear_cache(&mut self) {
        self.mask = None;
        self.bg_map = None;
        self.rms_map = None;
        self.bg_subtracted = None;
        self.label_maps.clear();
        self.residual_gauss = None;
        self.residual_deblend = None;
    }

    /// The gaussian-fit and deblending residual maps from the most recent
    /// blind/FDR extraction, if `config.residuals` is set and at least one
    /// extraction has run (spec §3, §5).
    pub fn residual_maps(&self) -> Option<(&Array2<f64>, &Array2<f64>)> {
        match (&self.residual_gauss, &self.residual_deblend) {
            (Some(g), Some(d)) => Some((g, d)),
            _ => None,
        }
    }

    fn get_or_build_mask(&mut self) -> &Array2<bool> {
        if self.mask.is_none() {
            let built = mask::build_mask(
                self.pixels.dim(),
                self.wcs.as_ref(),
                self.config.max_degradation,
                self.config.margin,
                self.config.radius,
                &self.pixels,
            );
            self.mask = Some(built);
        }
        self.mask.as_ref().unwrap()
    }

    fn get_or_build_bg_rms(&mut self) -> (&MaskedArray2, &MaskedArray2) {
        if self.bg_map.is_none() || self.rms_map.is_none() {
            let mask = self.get_or_build_mask().clone();
            let masked_pixels = MaskedArray2::new(self.pixels.clone(), mask);
            let maps = background::estimate(
                &masked_pixels,
                self.beam,
                self.config.back_size_x,
                self.config.back_size_y,
                self.config.interpolate_order,
                self.config.median_filter,
                self.config.mf_threshold,
            );
            self.bg_map = Some(maps.bg);
            self.rms_map = Some(maps.rms);
        }
        (self.bg_map.as_ref().unwrap(), self.rms_map.as_ref().unwrap())
    }

    fn get_or_build_bg_subtracted(&mut self) -> &MaskedArray2 {
        if self.bg_subtracted.is_none() {
            let mask = self.get_or_build_mask().clone();
            let (bg_map, rms_map) = self.get_or_build_bg_rms();
            let mut values = &self.pixels - &bg_map.values;
            // Masked entries are irrelevant but keep them finite so
            // downstream aggregations never have to special-case NaN.
            values.zip_mut_with(&mask, |v, &m| {
                if m {
                    *v = 0.0;
                }
            });
            let mut combined_mask = mask;
            combined_mask.zip_mut_with(&bg_map.mask, |m, &o| *m = *m || o);
            combined_mask.zip_mut_with(&rms_map.mask, |m, &o| *m = *m || o);
            self.bg_subtracted = Some(MaskedArray2::new(values, combined_mask));
        }
        self.bg_subtracted.as_ref().unwrap()
    }

    /// Override the background map. Shape must match the image; overriding
    /// invalidates `bg_subtracted` and all label maps (spec §4.10).
    pub fn set_bg_map(&mut self, values: Array2<f64>) -> Result<(), SourceFindError> {
        if values.dim() != self.pixels.dim() {
            return Err(SourceFindError::ShapeMismatch {
                expected: self.pixels.dim(),
                actual: values.dim(),
            });
        }
        let mask = self.get_or_build_mask().clone();
        self.bg_map = Some(MaskedArray2::new(values, mask));
        self.bg_subtracted = None;
        self.label_maps.clear();
        Ok(())
    }

    /// Override the RMS map. Shape must match the image and all values
    /// must be non-negative; overriding invalidates `bg_subtracted` and all
    /// label maps.
    pub fn set_rms_map(&mut self, values: Array2<f64>) -> Result<(), SourceFindError> {
        if values.dim() != self.pixels.dim() {
            return Err(SourceFindError::ShapeMismatch {
                expected: self.pixels.dim(),
                actual: values.dim(),
            });
        }
        if values.iter().any(|&v| v < 0.0) {
            return Err(SourceFindError::InvalidNoise);
        }
        let mask = self.get_or_build_mask().clone();
        self.rms_map = Some(MaskedArray2::new(values, mask));
        self.bg_subtracted = None;
        self.label_maps.clear();
        Ok(())
    }

    /// The background-subtracted, noise-normalized flux at `(x, y)`,
    /// maximized over a `(2*numpix+1)` box centred on that pixel (matches
    /// the source system's forced single-pixel flux lookup).
    pub fn flux_at_pixel(&mut self, x: usize, y: usize, numpix: usize) -> Option<f64> {
        let bg_subtracted = self.get_or_build_bg_subtracted();
        let (nx, ny) = bg_subtracted.dim();
        let x_lo = x.saturating_sub(numpix);
        let x_hi = (x + numpix + 1).min(nx);
        let y_lo = y.saturating_sub(numpix);
        let y_hi = (y + numpix + 1).min(ny);
        let mut best: Option<f64> = None;
        for i in x_lo..x_hi {
            for j in y_lo..y_hi {
                if !bg_subtracted.mask[[i, j]] {
                    best = Some(best.map_or(bg_subtracted.values[[i, j]], |b| b.max(bg_subtracted.values[[i, j]])));
                }
            }
        }
        best
    }

    fn build_islands_at(&mut self, detection_sigma: f64, analysis_sigma: f64) -> (Array2<usize>, Vec<Island>) {
        let rms_filter = self.config.rms_filter;
        let structuring_element = self.config.structuring_element;
        let (bg_map, rms_map) = self.get_or_build_bg_rms();
        let detection_map = rms_map.values.mapv(|r| r * detection_sigma);
        let analysis_map = rms_map.values.mapv(|r| r * analysis_sigma);
        let _ = bg_map;
        let bg_subtracted = self.get_or_build_bg_subtracted().clone();
        let rms_map = self.rms_map.as_ref().unwrap().clone();
        let beam = self.beam;
        islands::build_islands(
            &bg_subtracted,
            &rms_map,
            &analysis_map,
            &detection_map,
            rms_filter,
            structuring_element,
            beam,
        )
    }

    fn fit_and_assemble(&mut self, islands: Vec<Island>) -> Vec<Detection> {
        let full_mask = self.get_or_build_mask().clone();
        let deblend_enabled = self.config.deblend;
        let nthresh = self.config.deblend_nthresh;
        let structuring_element = self.config.structuring_element;
        let force_beam = self.config.force_beam;
        let systematics = self.systematics_arcsec;
        let wcs = self.wcs.as_ref();
        let track_residuals = self.config.residuals;

        let mut residual_deblend = track_residuals.then(|| Array2::<f64>::zeros(self.pixels.dim()));
        let mut residual_gauss = track_residuals.then(|| Array2::<f64>::zeros(self.pixels.dim()));

        let mut expanded = Vec::new();
        for island in &islands {
            if let Some(target) = residual_deblend.as_mut() {
                accumulate_into(target, island.chunk_bounds, &island.pixels_subarray.filled(0.0), 1.0);
            }
            if deblend_enabled {
                expanded.extend(deblend::deblend(
                    island,
                    nthresh,
                    structuring_element,
                    deblend::DEFAULT_MIN_CONTRAST,
                    deblend::DEFAULT_MIN_AREA,
                ));
            } else {
                expanded.push(island.clone());
            }
        }

        let mut detections = Vec::new();
        for island in &expanded {
            match fit::fit_island(island, FixedMode::None, force_beam) {
                Ok(outcome) => {
                    if let Some(det) = detection::assemble(island, &outcome, wcs, &full_mask, systematics) {
                        if let Some(target) = residual_deblend.as_mut() {
                            accumulate_into(target, island.chunk_bounds, &island.pixels_subarray.filled(0.0), -1.0);
                        }
                        if let Some(target) = residual_gauss.as_mut() {
                            let model = model::render(&outcome.params, island.pixels_subarray.dim());
                            let resid = &island.pixels_subarray.filled(0.0) - &model;
                            accumulate_into(target, island.chunk_bounds, &resid, 1.0);
                        }
                        detections.push(det);
                    }
                }
                Err(e) => {
                    warn!("fit failed for island at {:?}: {e}", island.chunk_bounds);
                }
            }
        }

        self.residual_deblend = residual_deblend;
        self.residual_gauss = residual_gauss;
        detections
    }

    /// Blind extraction using fixed multiples of the local RMS (spec
    /// §4.10). Missing thresholds fall back to the configured defaults.
    pub fn extract_blind(&mut self, detection_threshold: Option<f64>, analysis_threshold: Option<f64>) -> Vec<Detection> {
        let det_sigma = detection_threshold.unwrap_or(self.config.detection_threshold);
        let anl_sigma = analysis_threshold.unwrap_or(self.config.analysis_threshold);
        let key = det_sigma;
        let (labels, islands) = self.build_islands_at(det_sigma, anl_sigma);
        self.label_maps.get_or_insert_with(key, || labels);
        self.fit_and_assemble(islands)
    }

    /// FDR-controlled extraction (spec §4.6 + §4.10). Returns an empty
    /// list if the Hopkins et al. search finds no valid threshold.
    pub fn extract_fdr(&mut self, alpha: Option<f64>, analysis_threshold: Option<f64>) -> Vec<Detection> {
        let alpha = alpha.unwrap_or(self.config.fdr_alpha);
        let bg_subtracted = self.get_or_build_bg_subtracted().clone();
        let (_, rms_map) = self.get_or_build_bg_rms();
        let rms_map = rms_map.clone();
        let threshold = match fdr::select_threshold(&bg_subtracted, &rms_map, self.beam, alpha) {
            Some(t) => t,
            None => {
                debug!("FDR search found no valid threshold at alpha={alpha}");
                return Vec::new();
            }
        };
        let anl_sigma = analysis_threshold.unwrap_or(threshold.analysis_sigma);
        let (labels, islands) = self.build_islands_at(threshold.detection_sigma, anl_sigma);
        self.label_maps.get_or_insert_with(threshold.detection_sigma, || labels);
        self.fit_and_assemble(islands)
    }

    /// Forced photometry at caller-supplied sky positions (spec §4.10).
    /// Positions that don't map onto the image are skipped with a warning.
    pub fn fit_at_positions(
        &mut self,
        sky_positions: &[(f64, f64)],
        box_size_px: usize,
        pixel_threshold: Option<f64>,
        fixed_mode: ForcedFixedMode,
    ) -> Vec<Detection> {
        let full_mask = self.get_or_build_mask().clone();
        let bg_subtracted = self.get_or_build_bg_subtracted().clone();
        let rms_map = self.rms_map.as_ref().unwrap().clone();
        let beam = self.beam;
        let systematics = self.systematics_arcsec;
        let force_beam_shape = matches!(fixed_mode, ForcedFixedMode::PositionAndError);
        let threshold_sigma = pixel_threshold.unwrap_or(0.0);

        let mut detections = Vec::new();
        for &(ra, dec) in sky_positions {
            let (x, y) = match self.wcs.sky_to_pix(ra, dec) {
                Ok(v) => v,
                Err(e) => {
                    warn!("forced-photometry position (ra={ra}, dec={dec}) out of projection: {e}");
                    continue;
                }
            };
            // Convert FITS 1-indexed pixel coords back to our 0-indexed grid.
            let (x, y) = (x - 1.0, y - 1.0);
            let (nx, ny) = bg_subtracted.dim();
            if x < 0.0 || y < 0.0 || x >= nx as f64 || y >= ny as f64 {
                warn!("forced-photometry position (ra={ra}, dec={dec}) maps outside the image");
                continue;
            }

            let ibr = box_size_px / 2;
            let xi = x.round() as i64;
            let yi = y.round() as i64;
            let row_start = (xi - ibr as i64).max(0) as usize;
            let row_end = ((xi + ibr as i64 + 1).max(0) as usize).min(nx);
            let col_start = (yi - ibr as i64).max(0) as usize;
            let col_end = ((yi + ibr as i64 + 1).max(0) as usize).min(ny);
            if row_start >= row_end || col_start >= col_end {
                continue;
            }

            let (ux, uy) = (row_end - row_start, col_end - col_start);
            let mut values = Array2::<f64>::zeros((ux, uy));
            let mut island_mask = Array2::<bool>::from_elem((ux, uy), true);
            let mut rms_sub = Array2::<f64>::zeros((ux, uy));
            for i in row_start..row_end {
                for j in col_start..col_end {
                    let (li, lj) = (i - row_start, j - col_start);
                    let below_threshold = rms_map.values[[i, j]] * threshold_sigma > bg_subtracted.values[[i, j]];
                    island_mask[[li, lj]] = bg_subtracted.mask[[i, j]] || (threshold_sigma > 0.0 && below_threshold);
                    values[[li, lj]] = bg_subtracted.values[[i, j]];
                    rms_sub[[li, lj]] = rms_map.values[[i, j]];
                }
            }

            let island = Island {
                label: 0,
                pixels_subarray: MaskedArray2::new(values, island_mask),
                rms_subarray: rms_sub,
                chunk_bounds: ((row_start, col_start), (row_end, col_end)),
                analysis_threshold_effective: threshold_sigma,
                detection_threshold_subarray: Array2::from_elem((ux, uy), threshold_sigma),
                beam,
            };

            let local_x = x - row_start as f64;
            let local_y = y - col_start as f64;
            let mode = match fixed_mode {
                ForcedFixedMode::Position => FixedMode::Position { xbar: local_x, ybar: local_y },
                ForcedFixedMode::PositionAndError => FixedMode::PositionAndShape(crate::fit::model::GaussianParams {
                    peak: island
                        .pixels_subarray
                        .unmasked_values()
                        .into_iter()
                        .fold(f64::NEG_INFINITY, f64::max),
                    xbar: local_x,
                    ybar: local_y,
                    semimajor: beam.semimajor_px,
                    semiminor: beam.semiminor_px,
                    theta: beam.theta_rad,
                }),
            };

            match fit::fit_island(&island, mode, force_beam_shape) {
                Ok(outcome) => {
                    if let Some(det) = detection::assemble(&island, &outcome, self.wcs.as_ref(), &full_mask, systematics) {
                        detections.push(det);
                    }
                }
                Err(e) => {
                    warn!("forced fit failed at (ra={ra}, dec={dec}): {e}");
                }
            }
        }
        detections
    }

    /// Extraction on the negated background-subtracted image, to estimate
    /// the false-positive rate (spec §4.10). Only `bg_subtracted` and the
    /// label-map cache are disturbed; `mask`, `bg_map` and `rms_map` are
    /// left alone and restored exactly, matching the source system's
    /// negate-then-restore approach.
    pub fn extract_negative(&mut self, detection_threshold: Option<f64>) -> Vec<Detection> {
        let det_sigma = detection_threshold.unwrap_or(self.config.detection_threshold);
        self.label_maps.clear();

        let original = self.get_or_build_bg_subtracted().clone();
        let negated = MaskedArray2::new(original.values.mapv(|v| -v), original.mask.clone());
        self.bg_subtracted = Some(negated);

        let results = self.extract_blind(Some(det_sigma), None);

        self.bg_subtracted = Some(original);
        self.label_maps.clear();
        results
    }
}

/// Add (or, with `sign = -1.0`, subtract) `values` into `target` at the
/// pixel range described by `chunk` (an island's `chunk_bounds`).
fn accumulate_into(target: &mut Array2<f64>, chunk: ((usize, usize), (usize, usize)), values: &Array2<f64>, sign: f64) {
    let ((row0, col0), (row1, col1)) = chunk;
    let mut dest = target.slice_mut(ndarray::s![row0..row1, col0..col1]);
    dest.zip_mut_with(values, |d, &v| *d += sign * v);
}
