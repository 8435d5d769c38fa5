// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Background and RMS estimation (C3 + C4): reduce an image to a coarse
//! tile grid, then interpolate that grid back up to full resolution.

pub mod interpolate;
pub mod tiles;

use crate::beam::Beam;
use crate::masked_array::MaskedArray2;

/// A pair of full-resolution background and RMS maps, masked outside the
/// tight bounding box of the data they were derived from.
pub struct BackgroundMaps {
    pub bg: MaskedArray2,
    pub rms: MaskedArray2,
}

/// Estimate full-resolution background/RMS maps for `data`: tile, then
/// interpolate. This is the composition spec §4.3/§4.4 describe as the
/// background grid's normal life cycle. `order`, `median_filter` and
/// `mf_threshold` are passed straight through to the interpolator (spec
/// §4.4 items 1-2); the RMS map alone gets the `roundup` overshoot clamp
/// (item 4), since it is the background map's negative excursions that are
/// physically meaningless, not the background's.
pub fn estimate(
    data: &MaskedArray2,
    beam: Beam,
    tile_x: usize,
    tile_y: usize,
    order: usize,
    median_filter: usize,
    mf_threshold: f64,
) -> BackgroundMaps {
    let grids = tiles::estimate_tiles(data, beam, tile_x, tile_y);
    let full_shape = data.dim();
    let bg = interpolate::interpolate(
        &grids.bg,
        grids.bbox,
        full_shape,
        tile_x,
        tile_y,
        order,
        median_filter,
        mf_threshold,
        false,
    );
    let rms = interpolate::interpolate(
        &grids.rms,
        grids.bbox,
        full_shape,
        tile_x,
        tile_y,
        order,
        median_filter,
        mf_threshold,
        true,
    );
    BackgroundMaps { bg, rms }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn estimate_on_flat_image_gives_roughly_flat_background() {
        let values = Array2::from_elem((64, 64), 2.0);
        let mask = Array2::from_elem((64, 64), false);
        let data = MaskedArray2::new(values, mask);
        let maps = estimate(&data, Beam::new(2.0, 2.0, 0.0), 16, 16, 3, 0, 0.0);
        assert_eq!(maps.bg.dim(), (64, 64));
        assert_eq!(maps.rms.dim(), (64, 64));
    }
}
