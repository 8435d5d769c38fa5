// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The grid interpolator (C4): optionally median-filters a coarse tile
//! grid, then expands it back up to full image resolution by bicubic or
//! bilinear resampling, falling back to nearest-neighbour at masked grid
//! nodes and, for the RMS grid, clamping away spline overshoot. See spec
//! §4.4.

use ndarray::Array2;

use crate::background::tiles::BBox;
use crate::masked_array::MaskedArray2;
use crate::stats::median;

/// Interpolate a coarse grid (one sample per tile) up to the full pixel
/// grid spanned by `bbox` within an image of shape `full_shape`. Pixels
/// outside `bbox` are masked. Grid nodes that were themselves masked are
/// filled by nearest-neighbour lookup among unmasked nodes before
/// interpolating, so a handful of bad tiles don't poison the whole
/// surface.
///
/// If `median_filter > 0`, the grid is median-filtered over a
/// `median_filter`-wide window first (spec §4.4 item 1): with
/// `mf_threshold == 0.0` the filtered grid replaces the raw grid outright;
/// otherwise only entries differing from the filtered value by more than
/// `mf_threshold` are replaced. `order >= 3` resamples with a Catmull-Rom
/// bicubic spline; anything lower uses bilinear interpolation (spec §4.4
/// item 2). If `roundup` is set (used for the RMS grid), the output is
/// clamped to never fall below the minimum of the (filtered) coarse grid,
/// guarding against spline overshoot driving the interpolated RMS at or
/// below zero near a sharp gradient (spec §4.4 item 4).
#[allow(clippy::too_many_arguments)]
pub fn interpolate(
    grid: &MaskedArray2,
    bbox: BBox,
    full_shape: (usize, usize),
    tile_x: usize,
    tile_y: usize,
    order: usize,
    median_filter: usize,
    mf_threshold: f64,
    roundup: bool,
) -> MaskedArray2 {
    let smoothed = apply_median_filter(grid, median_filter, mf_threshold);
    let filled_grid = fill_masked_nodes(&smoothed);

    let ((r0, c0), (r1, c1)) = bbox;
    let mut values = Array2::<f64>::zeros(full_shape);
    let mut mask = Array2::<bool>::from_elem(full_shape, true);

    if filled_grid.is_none() {
        return MaskedArray2::new(values, mask);
    }
    let filled_grid = filled_grid.unwrap();
    let (gx, gy) = filled_grid.dim();

    // Grid node (ti, tj) represents the tile centre at pixel coordinates
    // (r0 + ti*tile_x + tile_x/2, c0 + tj*tile_y + tile_y/2). We evaluate a
    // spline through the grid at every pixel's fractional node coordinate.
    let node_x = |ti: usize| r0 as f64 + ti as f64 * tile_x as f64 + tile_x as f64 / 2.0;
    let node_y = |tj: usize| c0 as f64 + tj as f64 * tile_y as f64 + tile_y as f64 / 2.0;

    for i in r0..r1 {
        for j in c0..c1 {
            let fx = (i as f64 - node_x(0)) / tile_x as f64;
            let fy = (j as f64 - node_y(0)) / tile_y as f64;
            if let Some(v) = interpolate_at(&filled_grid, gx, gy, fx, fy, order) {
                values[[i, j]] = v;
                mask[[i, j]] = false;
            }
        }
    }

    if roundup {
        let min_val = smoothed.unmasked_values().into_iter().fold(f64::INFINITY, f64::min);
        if min_val.is_finite() {
            values.zip_mut_with(&mask, |v, &m| {
                if !m && *v < min_val {
                    *v = min_val;
                }
            });
        }
    }

    MaskedArray2::new(values, mask)
}

/// Median-filter the unmasked entries of `grid` over a `window`-wide
/// square neighbourhood (masked neighbours excluded), then conditionally
/// replace raw entries with the filtered value (spec §4.4 item 1). A
/// `window` of `0` is a no-op.
fn apply_median_filter(grid: &MaskedArray2, window: usize, mf_threshold: f64) -> MaskedArray2 {
    if window == 0 {
        return grid.clone();
    }
    let (gx, gy) = grid.dim();
    let radius = (window.saturating_sub(1) / 2) as i64;

    let mut filtered = grid.values.clone();
    for i in 0..gx {
        for j in 0..gy {
            let mut sample = Vec::new();
            for di in -radius..=radius {
                for dj in -radius..=radius {
                    let ii = clamp_idx(i as i64 + di, gx);
                    let jj = clamp_idx(j as i64 + dj, gy);
                    if !grid.mask[[ii, jj]] {
                        sample.push(grid.values[[ii, jj]]);
                    }
                }
            }
            filtered[[i, j]] = if sample.is_empty() { grid.values[[i, j]] } else { median(&sample) };
        }
    }

    let mut out = grid.values.clone();
    for i in 0..gx {
        for j in 0..gy {
            if grid.mask[[i, j]] {
                continue;
            }
            let raw = grid.values[[i, j]];
            let f = filtered[[i, j]];
            out[[i, j]] = if mf_threshold > 0.0 {
                if (f - raw).abs() > mf_threshold {
                    f
                } else {
                    raw
                }
            } else {
                f
            };
        }
    }
    MaskedArray2::new(out, grid.mask.clone())
}

/// Replace masked grid nodes with the value of their nearest unmasked
/// neighbour (Manhattan distance). Returns `None` if every node is masked.
fn fill_masked_nodes(grid: &MaskedArray2) -> Option<Array2<f64>> {
    if grid.is_all_masked() {
        return None;
    }
    let (gx, gy) = grid.dim();
    let mut out = grid.values.clone();
    for i in 0..gx {
        for j in 0..gy {
            if grid.mask[[i, j]] {
                let mut best = None;
                let mut best_d = usize::MAX;
                for ii in 0..gx {
                    for jj in 0..gy {
                        if !grid.mask[[ii, jj]] {
                            let d = ii.abs_diff(i) + jj.abs_diff(j);
                            if d < best_d {
                                best_d = d;
                                best = Some(grid.values[[ii, jj]]);
                            }
                        }
                    }
                }
                out[[i, j]] = best.unwrap();
            }
        }
    }
    Some(out)
}

/// Cubic Catmull-Rom convolution kernel.
fn cubic_weight(t: f64) -> f64 {
    let a = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (a + 2.0) * t.powi(3) - (a + 3.0) * t.powi(2) + 1.0
    } else if t < 2.0 {
        a * t.powi(3) - 5.0 * a * t.powi(2) + 8.0 * a * t - 4.0 * a
    } else {
        0.0
    }
}

fn linear_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.0 - t
    } else {
        0.0
    }
}

fn clamp_idx(v: i64, max: usize) -> usize {
    v.clamp(0, max as i64 - 1) as usize
}

/// Evaluate a separable interpolant of `grid` at fractional coordinates
/// `(fx, fy)`, clamping at the grid edges. `order >= 3` uses a 4-tap
/// bicubic kernel; anything lower uses a 2-tap bilinear kernel (spec §4.4
/// item 2). Returns `None` if the grid has fewer than one node along
/// either axis.
fn interpolate_at(grid: &Array2<f64>, gx: usize, gy: usize, fx: f64, fy: f64, order: usize) -> Option<f64> {
    if gx == 0 || gy == 0 {
        return None;
    }
    let ix = fx.floor() as i64;
    let iy = fy.floor() as i64;
    let tx = fx - ix as f64;
    let ty = fy - iy as f64;

    let mut acc = 0.0;
    if order >= 3 {
        for m in -1..=2 {
            let row = clamp_idx(ix + m, gx);
            let wx = cubic_weight(tx - m as f64);
            for n in -1..=2 {
                let col = clamp_idx(iy + n, gy);
                let wy = cubic_weight(ty - n as f64);
                acc += wx * wy * grid[[row, col]];
            }
        }
    } else {
        for m in 0..=1 {
            let row = clamp_idx(ix + m, gx);
            let wx = linear_weight(tx - m as f64);
            for n in 0..=1 {
                let col = clamp_idx(iy + n, gy);
                let wy = linear_weight(ty - n as f64);
                acc += wx * wy * grid[[row, col]];
            }
        }
    }
    Some(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn constant_grid_interpolates_to_constant() {
        let values = Array2::from_elem((4, 4), 5.0);
        let mask = Array2::from_elem((4, 4), false);
        let grid = MaskedArray2::new(values, mask);
        let out = interpolate(&grid, ((0, 0), (32, 32)), (32, 32), 8, 8, 3, 0, 0.0, false);
        for &v in out.values.iter() {
            assert_relative_eq!(v, 5.0, epsilon = 1e-9);
        }
        assert!(out.mask.iter().all(|&m| !m));
    }

    #[test]
    fn bilinear_order_also_reproduces_a_constant_grid() {
        let values = Array2::from_elem((4, 4), 3.0);
        let mask = Array2::from_elem((4, 4), false);
        let grid = MaskedArray2::new(values, mask);
        let out = interpolate(&grid, ((0, 0), (32, 32)), (32, 32), 8, 8, 1, 0, 0.0, false);
        for &v in out.values.iter() {
            assert_relative_eq!(v, 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn all_masked_grid_produces_all_masked_output() {
        let grid = MaskedArray2::all_masked((3, 3));
        let out = interpolate(&grid, ((0, 0), (16, 16)), (16, 16), 8, 8, 3, 0, 0.0, false);
        assert!(out.is_all_masked());
    }

    #[test]
    fn masked_node_is_filled_from_nearest_neighbour() {
        let mut values = Array2::from_elem((3, 3), 1.0);
        values[[1, 1]] = 100.0;
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[1, 1]] = true;
        let grid = MaskedArray2::new(values, mask);
        let filled = fill_masked_nodes(&grid).unwrap();
        assert_relative_eq!(filled[[1, 1]], 1.0);
    }

    #[test]
    fn outside_bbox_stays_masked() {
        let values = Array2::from_elem((2, 2), 3.0);
        let mask = Array2::from_elem((2, 2), false);
        let grid = MaskedArray2::new(values, mask);
        let out = interpolate(&grid, ((2, 2), (6, 6)), (16, 16), 4, 4, 3, 0, 0.0, false);
        assert!(out.mask[[0, 0]]);
        assert!(!out.mask[[3, 3]]);
    }

    #[test]
    fn roundup_clamps_overshoot_above_the_grid_minimum() {
        // A sharp step in the coarse grid makes the Catmull-Rom spline
        // overshoot below the lower tile's value near the edge.
        let mut values = Array2::from_elem((1, 4), 0.0);
        for j in 0..4 {
            values[[0, j]] = if j < 2 { 10.0 } else { 0.01 };
        }
        let mask = Array2::from_elem((1, 4), false);
        let grid = MaskedArray2::new(values, mask);
        let out = interpolate(&grid, ((0, 0), (8, 32)), (8, 32), 8, 8, 3, 0, 0.0, true);
        let min_grid = 0.01;
        for &v in out.values.iter() {
            assert!(v >= min_grid - 1e-9, "roundup should clamp at or above {min_grid}, got {v}");
        }
    }

    #[test]
    fn median_filter_suppresses_an_isolated_spike() {
        let mut values = Array2::from_elem((5, 5), 1.0);
        values[[2, 2]] = 1000.0;
        let mask = Array2::from_elem((5, 5), false);
        let grid = MaskedArray2::new(values, mask);
        let out = interpolate(&grid, ((0, 0), (40, 40)), (40, 40), 8, 8, 3, 3, 0.0, false);
        assert!(out.values.iter().all(|&v| v < 500.0), "median filter should have removed the spike");
    }

    #[test]
    fn mf_threshold_retains_raw_value_below_threshold() {
        let filtered = apply_median_filter(
            &MaskedArray2::new(Array2::from_elem((3, 3), 2.0), Array2::from_elem((3, 3), false)),
            3,
            1.0,
        );
        // A perfectly flat grid is unaffected either way.
        for &v in filtered.values.iter() {
            assert_relative_eq!(v, 2.0);
        }
    }
}
