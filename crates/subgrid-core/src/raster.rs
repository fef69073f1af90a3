use serde::{Deserialize, Deserializer, Serialize};

use crate::grid::PixelGrid;

/// A georeferenced 2D raster of f32 values, row-major, row 0 at the
/// lattice origin side (south for unrotated lattices).
/// Nodata is NaN; JSON stores NaN as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    pub grid: PixelGrid,
    #[serde(deserialize_with = "null_as_nan_vec")]
    pub data: Vec<f32>,
}

pub(crate) fn null_as_nan_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f32>, D::Error> {
    let v: Vec<Option<f32>> = Vec::deserialize(d)?;
    Ok(v.into_iter().map(|x| x.unwrap_or(f32::NAN)).collect())
}

impl Raster {
    /// Create a raster over `grid` filled with the given value.
    pub fn new(grid: PixelGrid, fill: f32) -> Self {
        let len = grid.len();
        Self {
            grid,
            data: vec![fill; len],
        }
    }

    /// Create a raster over `grid` with every pixel set to nodata.
    pub fn nodata(grid: PixelGrid) -> Self {
        Self::new(grid, f32::NAN)
    }

    /// Wrap row-major values; returns None when the length does not match the grid.
    pub fn from_data(grid: PixelGrid, data: Vec<f32>) -> Option<Self> {
        (data.len() == grid.len()).then_some(Self { grid, data })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.grid.cols
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.grid.rows
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.grid.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f32) {
        self.data[row * self.grid.cols + col] = val;
    }

    /// Nearest-pixel value at a world point.
    /// Returns None outside the raster or on nodata.
    pub fn sample_nearest(&self, x: f64, y: f64) -> Option<f32> {
        let (fr, fc) = self.grid.world_to_pixel(x, y);
        if fr < 0.0 || fc < 0.0 {
            return None;
        }
        let (r, c) = (fr.floor() as usize, fc.floor() as usize);
        if r >= self.height() || c >= self.width() {
            return None;
        }
        let v = self.get(r, c);
        (!v.is_nan()).then_some(v)
    }

    /// Bilinear value at a world point between the four surrounding pixel
    /// centres. Falls back to the nearest pixel at the raster rim or when a
    /// surrounding pixel is nodata.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> Option<f32> {
        let (fr, fc) = self.grid.world_to_pixel(x, y);
        let (fy, fx) = (fr - 0.5, fc - 0.5);
        if fy < 0.0 || fx < 0.0 {
            return self.sample_nearest(x, y);
        }

        let y0 = fy.floor() as usize;
        let x0 = fx.floor() as usize;
        if y0 + 1 >= self.height() || x0 + 1 >= self.width() {
            return self.sample_nearest(x, y);
        }
        let (y1, x1) = (y0 + 1, x0 + 1);

        let tx = (fx - x0 as f64) as f32;
        let ty = (fy - y0 as f64) as f32;

        let v00 = self.get(y0, x0);
        let v10 = self.get(y0, x1);
        let v01 = self.get(y1, x0);
        let v11 = self.get(y1, x1);
        if v00.is_nan() || v10.is_nan() || v01.is_nan() || v11.is_nan() {
            return self.sample_nearest(x, y);
        }

        let v = v00 * (1.0 - tx) * (1.0 - ty)
            + v10 * tx * (1.0 - ty)
            + v01 * (1.0 - tx) * ty
            + v11 * tx * ty;

        Some(v)
    }

    /// Number of pixels holding data.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// Copy a `rows × cols` window starting at `(row, col)` into `out`, row-major.
    pub fn copy_window(&self, row: usize, col: usize, rows: usize, cols: usize, out: &mut Vec<f32>) {
        for r in row..row + rows {
            let start = r * self.grid.cols + col;
            out.extend_from_slice(&self.data[start..start + cols]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_raster(n: usize) -> Raster {
        Raster::new(PixelGrid::north_up(0.0, 0.0, 1.0, 1.0, n, n), 0.0)
    }

    #[test]
    fn sample_at_pixel_centres_returns_exact_values() {
        let mut r = unit_raster(4);
        r.set(0, 0, 10.0);
        r.set(0, 3, 20.0);
        r.set(3, 0, 30.0);
        r.set(3, 3, 40.0);

        assert!((r.sample_bilinear(0.5, 0.5).unwrap() - 10.0).abs() < 1e-5);
        assert!((r.sample_bilinear(3.5, 0.5).unwrap() - 20.0).abs() < 1e-5);
        assert!((r.sample_bilinear(0.5, 3.5).unwrap() - 30.0).abs() < 1e-5);
        assert!((r.sample_bilinear(3.5, 3.5).unwrap() - 40.0).abs() < 1e-5);
    }

    #[test]
    fn bilinear_interpolates_between_centres() {
        let mut r = unit_raster(2);
        r.set(0, 1, 2.0);
        r.set(1, 1, 2.0);
        assert!((r.sample_bilinear(1.0, 1.0).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sample_out_of_bounds_returns_none() {
        let r = unit_raster(4);
        assert!(r.sample_nearest(-0.1, 1.0).is_none());
        assert!(r.sample_nearest(1.0, 4.0).is_none());
        assert!(r.sample_bilinear(5.0, 1.0).is_none());
    }

    #[test]
    fn nodata_is_skipped() {
        let mut r = unit_raster(2);
        r.set(0, 0, f32::NAN);
        assert!(r.sample_nearest(0.5, 0.5).is_none());
        // Bilinear next to a hole degrades to nearest.
        assert_eq!(r.sample_bilinear(1.4, 1.4), Some(0.0));
        assert_eq!(r.valid_count(), 3);
    }

    #[test]
    fn json_null_reads_as_nodata() {
        let json = r#"{"grid":{"x0":0.0,"y0":0.0,"dx":1.0,"dy":1.0,"rows":1,"cols":2},"data":[1.5,null]}"#;
        let r: Raster = serde_json::from_str(json).unwrap();
        assert_eq!(r.get(0, 0), 1.5);
        assert!(r.get(0, 1).is_nan());
    }
}
