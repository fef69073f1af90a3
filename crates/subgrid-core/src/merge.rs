//! Raster merge: resolve an ordered list of elevation or roughness sources
//! onto one pixel lattice.
//!
//! The block builder only depends on the [`RasterMerge`] trait. Its contract:
//! - the output covers the requested footprint at the footprint's resolution;
//! - nodata pixels are NaN;
//! - with [`MergeMethod::Override`], later sources win where they hold data.
//!
//! [`SourceMerger`] is the in-memory implementation used by the CLI and tests.

use serde::{Deserialize, Serialize};

use crate::grid::PixelGrid;
use crate::raster::Raster;
use crate::{Result, SubgridError};

/// How a source combines with the sources before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Replace earlier values wherever this source holds data.
    #[default]
    Override,
    /// Only fill pixels that are still nodata.
    Fill,
    /// Keep the lower of the existing and new value.
    Min,
    /// Keep the higher of the existing and new value.
    Max,
}

/// Sampling used when the source and target lattices differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
}

/// Vertical offset added to a source before filtering and merging.
#[derive(Debug, Clone, PartialEq)]
pub enum Offset {
    Constant(f32),
    /// Spatially varying offset; a pixel without offset data is treated as nodata.
    Gridded(Raster),
}

impl Offset {
    fn at(&self, x: f64, y: f64) -> Option<f32> {
        match self {
            Offset::Constant(v) => Some(*v),
            Offset::Gridded(r) => r.sample_bilinear(x, y),
        }
    }
}

/// Polygon(s) outside of which a source is ignored.
/// Each ring is a closed or open list of `[x, y]` vertices; a point is valid
/// when it lies inside an odd number of rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidArea {
    pub rings: Vec<Vec<[f64; 2]>>,
}

impl ValidArea {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.rings
            .iter()
            .filter(|ring| ring_contains(ring, x, y))
            .count()
            % 2
            == 1
    }
}

/// Even-odd ray casting.
fn ring_contains(ring: &[[f64; 2]], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// One entry of an ordered source list.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSource {
    pub name: String,
    pub raster: Raster,
    /// Values below `zmin` (after offset) are ignored.
    pub zmin: Option<f32>,
    /// Values above `zmax` (after offset) are ignored.
    pub zmax: Option<f32>,
    pub merge_method: MergeMethod,
    pub resampling: Resampling,
    pub offset: Option<Offset>,
    pub valid_area: Option<ValidArea>,
}

impl RasterSource {
    pub fn new(name: impl Into<String>, raster: Raster) -> Self {
        Self {
            name: name.into(),
            raster,
            zmin: None,
            zmax: None,
            merge_method: MergeMethod::default(),
            resampling: Resampling::default(),
            offset: None,
            valid_area: None,
        }
    }

    pub fn with_range(mut self, zmin: Option<f32>, zmax: Option<f32>) -> Self {
        self.zmin = zmin;
        self.zmax = zmax;
        self
    }

    pub fn with_merge_method(mut self, method: MergeMethod) -> Self {
        self.merge_method = method;
        self
    }

    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_valid_area(mut self, area: ValidArea) -> Self {
        self.valid_area = Some(area);
        self
    }

    /// Value this source contributes at a world point, if any.
    pub fn value_at(&self, x: f64, y: f64) -> Option<f32> {
        if let Some(area) = &self.valid_area {
            if !area.contains(x, y) {
                return None;
            }
        }
        let mut v = match self.resampling {
            Resampling::Nearest => self.raster.sample_nearest(x, y),
            Resampling::Bilinear => self.raster.sample_bilinear(x, y),
        }?;
        if let Some(offset) = &self.offset {
            v += offset.at(x, y)?;
        }
        if self.zmin.is_some_and(|zmin| v < zmin) || self.zmax.is_some_and(|zmax| v > zmax) {
            return None;
        }
        Some(v)
    }

    /// Quick overlap test against a footprint's bounding box.
    fn overlaps(&self, footprint: &PixelGrid) -> bool {
        let (axmin, aymin, axmax, aymax) = self.raster.grid.bounds();
        let (bxmin, bymin, bxmax, bymax) = footprint.bounds();
        axmin <= bxmax && axmax >= bxmin && aymin <= bymax && aymax >= bymin
    }
}

/// Resolves an ordered source list onto a target lattice.
pub trait RasterMerge {
    fn merge(&self, sources: &[RasterSource], footprint: &PixelGrid) -> Result<Raster>;
}

/// In-memory merger sampling every source at each target pixel centre.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceMerger;

impl RasterMerge for SourceMerger {
    fn merge(&self, sources: &[RasterSource], footprint: &PixelGrid) -> Result<Raster> {
        if footprint.is_empty() {
            return Err(SubgridError::config("merge footprint has no pixels"));
        }
        let mut out = Raster::nodata(footprint.clone());
        for source in sources.iter().filter(|s| s.overlaps(footprint)) {
            for row in 0..footprint.rows {
                for col in 0..footprint.cols {
                    let (x, y) = footprint.pixel_center(row, col);
                    let Some(v) = source.value_at(x, y) else {
                        continue;
                    };
                    let current = out.get(row, col);
                    let merged = match source.merge_method {
                        MergeMethod::Override => v,
                        MergeMethod::Fill if current.is_nan() => v,
                        MergeMethod::Fill => current,
                        MergeMethod::Min if current.is_nan() => v,
                        MergeMethod::Min => current.min(v),
                        MergeMethod::Max if current.is_nan() => v,
                        MergeMethod::Max => current.max(v),
                    };
                    out.set(row, col, merged);
                }
            }
        }
        Ok(out)
    }
}
