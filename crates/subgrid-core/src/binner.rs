//! Level binning of one cell's (or one face strip's) high-resolution pixels.
//!
//! Volume curve: with samples sorted ascending `s[0] ≤ … ≤ s[N-1]`, raising
//! the water level from `s[i]` to `s[i+1]` wets the `i + 1` lowest pixels,
//! so
//!
//! ```text
//!   V[0]   = 0
//!   V[i+1] = V[i] + (s[i+1] − s[i]) · a · (i + 1)        a = pixel area
//! ```
//!
//! and `V[N-1] = Σ (s[N-1] − s[i]) · a`, the volume of the cell filled to its
//! highest pixel.
//!
//! Conveyance curve: at level `z` every pixel has depth `h_i = max(z − z_i, 0)`
//! and Manning roughness `n_i`. The representative depth and effective
//! roughness are
//!
//! ```text
//!   hrep = ( Σ a·h_i^(5/3) / Σ a )^(3/5)
//!   navg = Σ_wet a·h_i^(5/3) / Σ_wet a·h_i^(5/3) / n_i
//! ```
//!
//! so that `hrep^(5/3) / navg` equals the area-averaged conveyance
//! `mean(h_i^(5/3) / n_i)` of the full pixel distribution. `hrep` is 0 when
//! dry and non-decreasing in `z`. When dry, `navg` is the plain mean of `n_i`.

use crate::table::{CellTable, EdgeTable};

/// Manning depth exponent.
const FIVE_THIRDS: f64 = 5.0 / 3.0;

/// A monotone sampled curve `levels[i] → values[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    /// Ascending water levels.
    pub levels: Vec<f64>,
    /// Metric at each level.
    pub values: Vec<f64>,
}

impl Curve {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Linear interpolation, clamped to the first/last value outside the domain.
    pub fn interpolate(&self, level: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let j = self.levels.partition_point(|&l| l <= level);
        if j == 0 {
            return self.values[0];
        }
        if j == self.len() {
            return self.values[j - 1];
        }
        let (l0, l1) = (self.levels[j - 1], self.levels[j]);
        let (v0, v1) = (self.values[j - 1], self.values[j]);
        v0 + (v1 - v0) * (level - l0) / (l1 - l0)
    }
}

/// Representative depth and effective roughness sampled at ascending levels.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthCurve {
    /// Ascending water levels.
    pub levels: Vec<f64>,
    /// Conveyance-weighted representative depth at each level.
    pub hrep: Vec<f64>,
    /// Effective Manning roughness of the wet pixels at each level.
    pub navg: Vec<f64>,
}

/// Valid elevation samples sorted ascending.
fn sorted_valid(elevation: &[f32]) -> Vec<f64> {
    let mut samples: Vec<f64> = elevation
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| v as f64)
        .collect();
    samples.sort_by(|a, b| a.total_cmp(b));
    samples
}

/// Cumulative volume against water level for one cell.
///
/// Nodata (NaN) pixels are ignored. An empty or all-nodata patch gives an
/// empty curve; a flat patch gives an all-zero curve.
pub fn volume_curve(elevation: &[f32], pixel_dx: f64, pixel_dy: f64) -> Curve {
    let levels = sorted_valid(elevation);
    let area = pixel_dx * pixel_dy;
    let mut values = Vec::with_capacity(levels.len());
    let mut volume = 0.0;
    for (i, &z) in levels.iter().enumerate() {
        if i > 0 {
            volume += (z - levels[i - 1]) * area * i as f64;
        }
        values.push(volume);
    }
    Curve { levels, values }
}

/// `nbins + 1` equally spaced levels over `[lo, hi]`, the last one exactly `hi`.
pub fn bin_levels(lo: f64, hi: f64, nbins: usize) -> Vec<f64> {
    let step = (hi - lo) / nbins as f64;
    (0..=nbins)
        .map(|i| if i == nbins { hi } else { lo + step * i as f64 })
        .collect()
}

/// Resample a curve onto `nbins + 1` equally spaced levels spanning its
/// domain. Returns an empty curve for an empty input.
pub fn discretize(curve: &Curve, nbins: usize) -> Curve {
    let (Some(&lo), Some(&hi)) = (curve.levels.first(), curve.levels.last()) else {
        return Curve {
            levels: Vec::new(),
            values: Vec::new(),
        };
    };
    let levels = bin_levels(lo, hi, nbins);
    let values = levels.iter().map(|&l| curve.interpolate(l)).collect();
    Curve { levels, values }
}

/// Paired (elevation, roughness) pixels with both values present.
fn valid_pairs(elevation: &[f32], roughness: &[f32]) -> Vec<(f64, f64)> {
    elevation
        .iter()
        .zip(roughness.iter())
        .filter(|(z, n)| !z.is_nan() && !n.is_nan() && **n > 0.0)
        .map(|(&z, &n)| (z as f64, n as f64))
        .collect()
}

/// Representative depth and effective roughness at one level.
fn conveyance_at(pixels: &[(f64, f64)], area: f64, level: f64) -> (f64, f64) {
    let mut sum_h = 0.0;
    let mut sum_q = 0.0;
    let mut sum_n = 0.0;
    for &(z, n) in pixels {
        sum_n += n;
        let h = level - z;
        if h > 0.0 {
            let h53 = h.powf(FIVE_THIRDS) * area;
            sum_h += h53;
            sum_q += h53 / n;
        }
    }
    let total_area = area * pixels.len() as f64;
    if sum_q <= 0.0 {
        return (0.0, sum_n / pixels.len() as f64);
    }
    let hrep = (sum_h / total_area).powf(0.6);
    (hrep, sum_h / sum_q)
}

/// Representative depth and effective roughness evaluated at every sorted
/// elevation sample of the patch.
pub fn depth_curve(elevation: &[f32], roughness: &[f32], pixel_dx: f64, pixel_dy: f64) -> DepthCurve {
    let pixels = valid_pairs(elevation, roughness);
    let mut levels: Vec<f64> = pixels.iter().map(|&(z, _)| z).collect();
    levels.sort_by(|a, b| a.total_cmp(b));
    depth_levels(&pixels, pixel_dx * pixel_dy, levels)
}

fn depth_levels(pixels: &[(f64, f64)], area: f64, levels: Vec<f64>) -> DepthCurve {
    let mut hrep = Vec::with_capacity(levels.len());
    let mut navg = Vec::with_capacity(levels.len());
    if !pixels.is_empty() {
        for &level in &levels {
            let (h, n) = conveyance_at(pixels, area, level);
            hrep.push(h);
            navg.push(n);
        }
    }
    DepthCurve { levels, hrep, navg }
}

/// Subgrid table row for one cell, or None when the patch holds no data.
pub fn cell_table(elevation: &[f32], pixel_dx: f64, pixel_dy: f64, nbins: usize) -> Option<CellTable> {
    let curve = volume_curve(elevation, pixel_dx, pixel_dy);
    let (&zmin, &zmax) = (curve.levels.first()?, curve.levels.last()?);
    let zmean = curve.levels.iter().sum::<f64>() / curve.len() as f64;
    let binned = discretize(&curve, nbins);
    let volmax = curve.values.last().copied().unwrap_or(0.0);

    Some(CellTable {
        zmin: zmin as f32,
        zmax: zmax as f32,
        zmean: zmean as f32,
        volmax: volmax as f32,
        levels: binned.levels.iter().map(|&v| v as f32).collect(),
        volumes: binned.values.iter().map(|&v| v as f32).collect(),
    })
}

/// Subgrid table row for one face, or None when the strip holds no data.
///
/// The conveyance rule is evaluated exactly at the `nbins + 1` levels
/// spanning the strip's elevation range.
pub fn edge_table(
    elevation: &[f32],
    roughness: &[f32],
    pixel_dx: f64,
    pixel_dy: f64,
    nbins: usize,
) -> Option<EdgeTable> {
    let pixels = valid_pairs(elevation, roughness);
    let zmin = pixels.iter().map(|&(z, _)| z).reduce(f64::min)?;
    let zmax = pixels.iter().map(|&(z, _)| z).reduce(f64::max)?;
    let curve = depth_levels(&pixels, pixel_dx * pixel_dy, bin_levels(zmin, zmax, nbins));

    Some(EdgeTable {
        zmin: zmin as f32,
        zmax: zmax as f32,
        pixel_count: pixels.len() as u32,
        levels: curve.levels.iter().map(|&v| v as f32).collect(),
        hrep: curve.hrep.iter().map(|&v| v as f32).collect(),
        navg: curve.navg.iter().map(|&v| v as f32).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_patch(rng: &mut StdRng, len: usize) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-5.0f32..20.0)).collect()
    }

    #[test]
    fn volume_curve_is_monotone_from_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in [1, 2, 16, 400] {
            let patch = random_patch(&mut rng, len);
            let curve = volume_curve(&patch, 2.5, 2.5);
            assert_eq!(curve.values[0], 0.0);
            assert!(curve.values.windows(2).all(|w| w[0] <= w[1]));
            assert!(curve.levels.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn max_volume_fills_cell_to_highest_pixel() {
        let patch = [1.0f32, 4.0, 2.0, 0.0];
        let curve = volume_curve(&patch, 2.0, 3.0);
        // (4-1) + (4-4) + (4-2) + (4-0) = 9 metres over 6 m² pixels.
        assert_relative_eq!(*curve.values.last().unwrap(), 54.0, epsilon = 1e-9);
    }

    #[test]
    fn discretize_keeps_maximum_and_order() {
        let mut rng = StdRng::seed_from_u64(11);
        let patch = random_patch(&mut rng, 225);
        let curve = volume_curve(&patch, 1.0, 1.0);
        let binned = discretize(&curve, 10);
        assert_eq!(binned.len(), 11);
        assert_eq!(binned.values[0], 0.0);
        assert_eq!(*binned.values.last().unwrap(), *curve.values.last().unwrap());
        assert!(binned.values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(binned.levels[10], *curve.levels.last().unwrap());
    }

    #[test]
    fn flat_patch_gives_repeated_levels() {
        let patch = [2.5f32; 9];
        let curve = volume_curve(&patch, 1.0, 1.0);
        assert!(curve.values.iter().all(|&v| v == 0.0));
        let binned = discretize(&curve, 4);
        assert_eq!(binned.levels, vec![2.5; 5]);
        assert_eq!(binned.values, vec![0.0; 5]);
    }

    #[test]
    fn nodata_only_patch_is_excluded() {
        let patch = [f32::NAN; 4];
        assert!(cell_table(&patch, 1.0, 1.0, 3).is_none());
        assert!(edge_table(&patch, &[0.02; 4], 1.0, 1.0, 3).is_none());
    }

    #[test]
    fn single_pixel_cell_is_flat_but_valid() {
        let table = cell_table(&[3.0], 10.0, 10.0, 3).unwrap();
        assert_eq!(table.zmin, 3.0);
        assert_eq!(table.zmax, 3.0);
        assert_eq!(table.volmax, 0.0);
        assert_eq!(table.levels, vec![3.0; 4]);
        assert_eq!(table.volumes, vec![0.0; 4]);
    }

    #[test]
    fn partial_nodata_uses_remaining_pixels() {
        let table = cell_table(&[0.0, f32::NAN, 2.0, f32::NAN], 1.0, 1.0, 2).unwrap();
        assert_eq!(table.zmean, 1.0);
        assert_eq!(table.volmax, 2.0);
        // One pixel is wet between the two samples.
        assert_eq!(table.volumes, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn depth_curve_dry_then_rising() {
        let elevation = [0.0f32, 1.0, 2.0, 3.0];
        let roughness = [0.02f32; 4];
        let curve = depth_curve(&elevation, &roughness, 1.0, 1.0);
        assert_eq!(curve.hrep[0], 0.0);
        assert!(curve.hrep.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(curve.navg[0], 0.02, epsilon = 1e-6);
    }

    #[test]
    fn depth_curve_matches_conveyance_when_inundated() {
        let elevation = [0.0f32, 0.5, 1.0, 1.5];
        let roughness = [0.02f32, 0.04, 0.03, 0.1];
        let pixels = valid_pairs(&elevation, &roughness);
        let level = 3.0;
        let (hrep, navg) = conveyance_at(&pixels, 1.0, level);
        let expected: f64 = pixels
            .iter()
            .map(|&(z, n)| (level - z).powf(FIVE_THIRDS) / n)
            .sum::<f64>()
            / pixels.len() as f64;
        assert_relative_eq!(hrep.powf(FIVE_THIRDS) / navg, expected, max_relative = 1e-10);
    }

    #[test]
    fn uniform_roughness_is_reproduced() {
        let elevation = [0.0f32, 1.0, 1.0, 2.0];
        let table = edge_table(&elevation, &[0.035; 4], 5.0, 5.0, 4).unwrap();
        assert_eq!(table.pixel_count, 4);
        assert_eq!(table.hrep[0], 0.0);
        for &n in &table.navg {
            assert_relative_eq!(n, 0.035, max_relative = 1e-5);
        }
        assert!(table.hrep.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(table.levels, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn interpolate_clamps_outside_domain() {
        let curve = Curve {
            levels: vec![0.0, 1.0, 2.0],
            values: vec![0.0, 1.0, 4.0],
        };
        assert_eq!(curve.interpolate(-1.0), 0.0);
        assert_eq!(curve.interpolate(3.0), 4.0);
        assert_relative_eq!(curve.interpolate(1.5), 2.5);
    }
}
