//! Pixel-level conditioning of merged block rasters before binning:
//! slope clipping, the elevation floor and fallback Manning roughness.
//!
//! Every operation here reads at most the 4-neighbourhood of a pixel from
//! the unmodified input, so a pixel's result does not depend on which block
//! it was merged in as long as the block carries a one-pixel margin.

use crate::raster::Raster;

/// Neighbour offsets `(drow, dcol)` for the 4-neighbourhood.
const NEIGHBOURS: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// Clip pixel-to-pixel slopes steeper than `max_gradient` (m/m).
///
/// Single pass against the original values. Each valid 4-neighbour `k`
/// allows the band `[z_k − g·d_k, z_k + g·d_k]`, with `d_k` the pixel
/// spacing towards it; a pixel outside the median band of its neighbours is
/// clamped into it. Returns the number of clipped pixels.
pub fn clip_gradients(raster: &mut Raster, max_gradient: f32) -> usize {
    let (rows, cols) = (raster.height(), raster.width());
    let dx = raster.grid.dx as f32;
    let dy = raster.grid.dy as f32;
    let original = raster.data.clone();
    let at = |r: usize, c: usize| original[r * cols + c];
    let mut clipped = 0;

    for r in 0..rows {
        for c in 0..cols {
            let z = at(r, c);
            if z.is_nan() {
                continue;
            }
            let mut lows = [0.0f32; 4];
            let mut highs = [0.0f32; 4];
            let mut count = 0;
            for (dr, dc) in NEIGHBOURS {
                let (nr, nc) = (r as isize + dr, c as isize + dc);
                if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
                    continue;
                }
                let zk = at(nr as usize, nc as usize);
                if zk.is_nan() {
                    continue;
                }
                let reach = max_gradient * if dr != 0 { dy } else { dx };
                lows[count] = zk - reach;
                highs[count] = zk + reach;
                count += 1;
            }
            if count == 0 {
                continue;
            }
            let lo = median(&mut lows[..count]);
            let hi = median(&mut highs[..count]);
            if z < lo || z > hi {
                raster.set(r, c, z.clamp(lo, hi));
                clipped += 1;
            }
        }
    }
    clipped
}

fn median(values: &mut [f32]) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Raise every valid pixel to at least `z_minimum`.
pub fn apply_floor(raster: &mut Raster, z_minimum: f32) {
    for v in raster.data.iter_mut().filter(|v| !v.is_nan()) {
        *v = v.max(z_minimum);
    }
}

/// Constant land/sea Manning roughness split at an elevation threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManningFallback {
    pub land: f32,
    pub sea: f32,
    /// Pixels strictly above this elevation are land.
    pub land_level: f32,
}

impl ManningFallback {
    #[inline]
    pub fn at(&self, z: f32) -> f32 {
        if z.is_nan() || z > self.land_level {
            self.land
        } else {
            self.sea
        }
    }

    /// Roughness raster derived from elevation alone.
    pub fn synthesize(&self, dep: &Raster) -> Raster {
        Raster {
            grid: dep.grid.clone(),
            data: dep.data.iter().map(|&z| self.at(z)).collect(),
        }
    }

    /// Fill nodata pixels of `rgh` from the elevation. Returns the number of filled pixels.
    pub fn fill_gaps(&self, rgh: &mut Raster, dep: &Raster) -> usize {
        let mut filled = 0;
        for (n, &z) in rgh.data.iter_mut().zip(dep.data.iter()) {
            if n.is_nan() {
                *n = self.at(z);
                filled += 1;
            }
        }
        filled
    }
}
