//! Computational grid, mask and the active-cell / active-edge index scheme.
//!
//! Cells are addressed as `(n, m)`: `n` counts rows along the grid's local
//! y axis (0 at the origin), `m` counts columns along the local x axis.
//! Storage is row-major (`n * mmax + m`). The simulator numbers active
//! cells in column-major order (`m * nmax + n`); every per-cell and
//! per-edge array in a subgrid table follows that order.

use serde::{Deserialize, Serialize};

use crate::{Result, SubgridError};

/// Regular, optionally rotated lattice of computational cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationalGrid {
    pub x0: f64,
    pub y0: f64,
    pub dx: f64,
    pub dy: f64,
    /// Number of cells along the local x axis.
    pub mmax: usize,
    /// Number of cells along the local y axis.
    pub nmax: usize,
    /// Counter-clockwise rotation in degrees.
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub epsg: Option<u32>,
}

impl ComputationalGrid {
    /// Create a validated, unrotated grid.
    pub fn new(x0: f64, y0: f64, dx: f64, dy: f64, mmax: usize, nmax: usize) -> Result<Self> {
        let grid = Self {
            x0,
            y0,
            dx,
            dy,
            mmax,
            nmax,
            rotation: 0.0,
            epsg: None,
        };
        grid.validate()?;
        Ok(grid)
    }

    pub fn with_rotation(mut self, rotation: f64) -> Result<Self> {
        self.rotation = rotation;
        self.validate()?;
        Ok(self)
    }

    /// Check the grid invariants (`mmax, nmax > 0`, `dx, dy > 0`, finite origin).
    pub fn validate(&self) -> Result<()> {
        if self.mmax == 0 || self.nmax == 0 {
            return Err(SubgridError::config(format!(
                "grid must have at least one cell, got mmax={} nmax={}",
                self.mmax, self.nmax
            )));
        }
        if !(self.dx > 0.0 && self.dy > 0.0) || !self.dx.is_finite() || !self.dy.is_finite() {
            return Err(SubgridError::config(format!(
                "grid cell size must be positive, got dx={} dy={}",
                self.dx, self.dy
            )));
        }
        if !self.x0.is_finite() || !self.y0.is_finite() || !self.rotation.is_finite() {
            return Err(SubgridError::config("grid origin and rotation must be finite"));
        }
        Ok(())
    }

    pub fn cell_count(&self) -> usize {
        self.nmax * self.mmax
    }

    /// World coordinates of a point given in local grid units (metres along
    /// the rotated x and y axes, measured from the origin).
    pub fn to_world(&self, u: f64, v: f64) -> (f64, f64) {
        to_world(self.x0, self.y0, self.rotation, u, v)
    }

    /// World coordinates of the centre of cell `(n, m)`.
    pub fn cell_center(&self, n: usize, m: usize) -> (f64, f64) {
        self.to_world((m as f64 + 0.5) * self.dx, (n as f64 + 0.5) * self.dy)
    }

    /// Pixel lattice at `nr_subgrid_pixels` per cell covering cells
    /// `n0..n0+rows`, `m0..m0+cols`, extended by `pad` pixels on every side.
    pub fn pixel_grid(
        &self,
        nr_subgrid_pixels: usize,
        n0: usize,
        m0: usize,
        rows: usize,
        cols: usize,
        pad: usize,
    ) -> PixelGrid {
        let nsub = nr_subgrid_pixels;
        PixelGrid {
            x0: self.x0,
            y0: self.y0,
            dx: self.dx / nsub as f64,
            dy: self.dy / nsub as f64,
            rotation: self.rotation,
            row0: (n0 * nsub) as i64 - pad as i64,
            col0: (m0 * nsub) as i64 - pad as i64,
            rows: rows * nsub + 2 * pad,
            cols: cols * nsub + 2 * pad,
        }
    }
}

fn to_world(x0: f64, y0: f64, rotation_deg: f64, u: f64, v: f64) -> (f64, f64) {
    if rotation_deg == 0.0 {
        return (x0 + u, y0 + v);
    }
    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    (x0 + u * cos - v * sin, y0 + u * sin + v * cos)
}

/// A window of a (possibly rotated) pixel lattice.
///
/// The lattice is anchored at `(x0, y0)`; `row0`/`col0` locate this window's
/// first pixel in lattice indices. Pixel centres are computed from lattice
/// indices, so one pixel has identical coordinates in every window that
/// contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelGrid {
    pub x0: f64,
    pub y0: f64,
    pub dx: f64,
    pub dy: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub row0: i64,
    #[serde(default)]
    pub col0: i64,
    pub rows: usize,
    pub cols: usize,
}

impl PixelGrid {
    /// Unrotated lattice whose first pixel has its lower-left corner at `(x0, y0)`.
    pub fn north_up(x0: f64, y0: f64, dx: f64, dy: f64, rows: usize, cols: usize) -> Self {
        Self {
            x0,
            y0,
            dx,
            dy,
            rotation: 0.0,
            row0: 0,
            col0: 0,
            rows,
            cols,
        }
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// World coordinates of the centre of window pixel `(row, col)`.
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let u = ((self.col0 + col as i64) as f64 + 0.5) * self.dx;
        let v = ((self.row0 + row as i64) as f64 + 0.5) * self.dy;
        to_world(self.x0, self.y0, self.rotation, u, v)
    }

    /// Continuous window coordinates `(row, col)` of a world point; pixel
    /// `(r, c)` spans `[r, r+1) × [c, c+1)`.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let (mut u, mut v) = (x - self.x0, y - self.y0);
        if self.rotation != 0.0 {
            let (sin, cos) = self.rotation.to_radians().sin_cos();
            let (ru, rv) = (u * cos + v * sin, -u * sin + v * cos);
            u = ru;
            v = rv;
        }
        (v / self.dy - self.row0 as f64, u / self.dx - self.col0 as f64)
    }

    /// Approximate axis-aligned world bounds `(xmin, ymin, xmax, ymax)`.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let u0 = self.col0 as f64 * self.dx;
        let v0 = self.row0 as f64 * self.dy;
        let u1 = u0 + self.cols as f64 * self.dx;
        let v1 = v0 + self.rows as f64 * self.dy;
        let corners = [(u0, v0), (u1, v0), (u0, v1), (u1, v1)];
        corners.iter().fold(
            (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            |(xmin, ymin, xmax, ymax), &(u, v)| {
                let (x, y) = to_world(self.x0, self.y0, self.rotation, u, v);
                (xmin.min(x), ymin.min(y), xmax.max(x), ymax.max(y))
            },
        )
    }
}

// ── Mask ──────────────────────────────────────────────────────────────────────

/// Per-cell state of the computational mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MaskState {
    #[default]
    Inactive = 0,
    Active = 1,
    WaterLevelBoundary = 2,
    OutflowBoundary = 3,
}

impl MaskState {
    pub fn is_active(self) -> bool {
        self != MaskState::Inactive
    }
}

impl TryFrom<u8> for MaskState {
    type Error = SubgridError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MaskState::Inactive),
            1 => Ok(MaskState::Active),
            2 => Ok(MaskState::WaterLevelBoundary),
            3 => Ok(MaskState::OutflowBoundary),
            v => Err(SubgridError::config(format!("invalid mask value {v} (expected 0..=3)"))),
        }
    }
}

/// Orientation of a staggered face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeOrientation {
    /// Face between `(n, m)` and `(n, m + 1)`.
    U,
    /// Face between `(n, m)` and `(n + 1, m)`.
    V,
}

/// An active face, keyed by its lower-index cell `(n, m)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub n: usize,
    pub m: usize,
    pub orientation: EdgeOrientation,
    /// Whether the key cell `(n, m)` is active.
    pub a_active: bool,
    /// Whether the neighbour across the face is active.
    pub b_active: bool,
}

impl Edge {
    /// Cell on the far side of the face.
    pub fn neighbour(&self) -> (usize, usize) {
        match self.orientation {
            EdgeOrientation::U => (self.n, self.m + 1),
            EdgeOrientation::V => (self.n + 1, self.m),
        }
    }
}

/// Per-cell mask over a computational grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MaskFile", into = "MaskFile")]
pub struct Mask {
    nmax: usize,
    mmax: usize,
    data: Vec<MaskState>,
}

/// Serialized form of a [`Mask`]: raw row-major values.
#[derive(Serialize, Deserialize)]
struct MaskFile {
    nmax: usize,
    mmax: usize,
    data: Vec<u8>,
}

impl TryFrom<MaskFile> for Mask {
    type Error = SubgridError;

    fn try_from(file: MaskFile) -> Result<Self> {
        Mask::from_values(file.nmax, file.mmax, &file.data)
    }
}

impl From<Mask> for MaskFile {
    fn from(mask: Mask) -> Self {
        MaskFile {
            nmax: mask.nmax,
            mmax: mask.mmax,
            data: mask.data.iter().map(|&s| s as u8).collect(),
        }
    }
}

impl Mask {
    /// All-inactive mask.
    pub fn new(nmax: usize, mmax: usize) -> Self {
        Self {
            nmax,
            mmax,
            data: vec![MaskState::Inactive; nmax * mmax],
        }
    }

    /// All-active mask matching `grid`.
    pub fn all_active(grid: &ComputationalGrid) -> Self {
        Self {
            nmax: grid.nmax,
            mmax: grid.mmax,
            data: vec![MaskState::Active; grid.cell_count()],
        }
    }

    /// Build a mask from row-major raw values (0..=3).
    pub fn from_values(nmax: usize, mmax: usize, values: &[u8]) -> Result<Self> {
        if values.len() != nmax * mmax {
            return Err(SubgridError::config(format!(
                "mask has {} values, expected {}x{}={}",
                values.len(),
                nmax,
                mmax,
                nmax * mmax
            )));
        }
        let data = values
            .iter()
            .map(|&v| MaskState::try_from(v))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nmax, mmax, data })
    }

    pub fn nmax(&self) -> usize {
        self.nmax
    }

    pub fn mmax(&self) -> usize {
        self.mmax
    }

    #[inline]
    pub fn get(&self, n: usize, m: usize) -> MaskState {
        self.data[n * self.mmax + m]
    }

    #[inline]
    pub fn set(&mut self, n: usize, m: usize, state: MaskState) {
        self.data[n * self.mmax + m] = state;
    }

    #[inline]
    pub fn is_active(&self, n: usize, m: usize) -> bool {
        self.get(n, m).is_active()
    }

    /// Fails unless the mask has the grid's shape.
    pub fn check_shape(&self, grid: &ComputationalGrid) -> Result<()> {
        if self.nmax != grid.nmax || self.mmax != grid.mmax {
            return Err(SubgridError::config(format!(
                "mask shape {}x{} does not match grid {}x{}",
                self.nmax, self.mmax, grid.nmax, grid.mmax
            )));
        }
        Ok(())
    }

    /// Column-major linear index used by the simulator.
    #[inline]
    pub fn linear_index(&self, n: usize, m: usize) -> usize {
        m * self.nmax + n
    }

    /// Active cells `(n, m)` in column-major order.
    pub fn active_cells(&self) -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for m in 0..self.mmax {
            for n in 0..self.nmax {
                if self.is_active(n, m) {
                    cells.push((n, m));
                }
            }
        }
        cells
    }

    pub fn active_count(&self) -> usize {
        self.data.iter().filter(|s| s.is_active()).count()
    }

    /// Active faces of one orientation, ordered like [`Mask::active_cells`].
    pub fn active_edges(&self, orientation: EdgeOrientation) -> Vec<Edge> {
        let mut edges = Vec::new();
        for m in 0..self.mmax {
            for n in 0..self.nmax {
                if let Some(edge) = self.edge_at(n, m, orientation) {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    /// The face keyed by `(n, m)` if it exists and touches an active cell.
    pub fn edge_at(&self, n: usize, m: usize, orientation: EdgeOrientation) -> Option<Edge> {
        let (nb, mb) = match orientation {
            EdgeOrientation::U if m + 1 < self.mmax => (n, m + 1),
            EdgeOrientation::V if n + 1 < self.nmax => (n + 1, m),
            _ => return None,
        };
        let a_active = self.is_active(n, m);
        let b_active = self.is_active(nb, mb);
        if !a_active && !b_active {
            return None;
        }
        Some(Edge {
            n,
            m,
            orientation,
            a_active,
            b_active,
        })
    }

    pub fn edge_count(&self, orientation: EdgeOrientation) -> usize {
        self.active_edges(orientation).len()
    }

    /// Slot lookup: row-major cell position → slot in the active-cell order.
    pub(crate) fn cell_slots(&self) -> Vec<Option<usize>> {
        let mut slots = vec![None; self.nmax * self.mmax];
        for (slot, (n, m)) in self.active_cells().into_iter().enumerate() {
            slots[n * self.mmax + m] = Some(slot);
        }
        slots
    }

    /// Slot lookup for faces: row-major key cell → slot in the active-edge order.
    pub(crate) fn edge_slots(&self, orientation: EdgeOrientation) -> Vec<Option<usize>> {
        let mut slots = vec![None; self.nmax * self.mmax];
        for (slot, edge) in self.active_edges(orientation).into_iter().enumerate() {
            slots[edge.n * self.mmax + edge.m] = Some(slot);
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn grid_rejects_invalid_dimensions() {
        assert!(ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 0, 4).is_err());
        assert!(ComputationalGrid::new(0.0, 0.0, -1.0, 10.0, 4, 4).is_err());
        assert!(ComputationalGrid::new(0.0, 0.0, 10.0, f64::NAN, 4, 4).is_err());
        assert!(ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 4, 4).is_ok());
    }

    #[test]
    fn rotated_cell_center() {
        let grid = ComputationalGrid::new(100.0, 200.0, 10.0, 10.0, 3, 3)
            .unwrap()
            .with_rotation(90.0)
            .unwrap();
        // Local x axis points north after a 90° rotation.
        let (x, y) = grid.cell_center(0, 0);
        assert_relative_eq!(x, 95.0, epsilon = 1e-9);
        assert_relative_eq!(y, 205.0, epsilon = 1e-9);
    }

    #[test]
    fn pixel_grid_round_trips_world_coordinates() {
        let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 4, 4)
            .unwrap()
            .with_rotation(30.0)
            .unwrap();
        let pg = grid.pixel_grid(4, 1, 2, 2, 2, 5);
        let (x, y) = pg.pixel_center(3, 7);
        let (r, c) = pg.world_to_pixel(x, y);
        assert_relative_eq!(r, 3.5, epsilon = 1e-9);
        assert_relative_eq!(c, 7.5, epsilon = 1e-9);
    }

    #[test]
    fn same_pixel_same_coordinates_in_overlapping_windows() {
        let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 4, 4).unwrap();
        let a = grid.pixel_grid(4, 0, 0, 4, 4, 0);
        let b = grid.pixel_grid(4, 2, 2, 2, 2, 5);
        // Lattice pixel (9, 9) is window pixel (9, 9) in `a` and (9 - 3, 9 - 3) in `b`.
        assert_eq!(a.pixel_center(9, 9), b.pixel_center(6, 6));
    }

    #[test]
    fn active_cells_are_column_major() {
        let mask = Mask::from_values(2, 3, &[1, 0, 1, 1, 1, 0]).unwrap();
        assert_eq!(mask.active_cells(), vec![(0, 0), (1, 0), (1, 1), (0, 2)]);
        assert_eq!(mask.linear_index(1, 1), 3);
    }

    #[test]
    fn invalid_mask_value_is_rejected() {
        assert!(Mask::from_values(1, 2, &[0, 4]).is_err());
        assert!(Mask::from_values(1, 2, &[0]).is_err());
    }

    #[test]
    fn edges_need_one_active_side() {
        // n=0: [1 0 0]
        // n=1: [0 0 1]
        let mask = Mask::from_values(2, 3, &[1, 0, 0, 0, 0, 1]).unwrap();
        let u = mask.active_edges(EdgeOrientation::U);
        let keys: Vec<_> = u.iter().map(|e| (e.n, e.m)).collect();
        assert_eq!(keys, vec![(0, 0), (1, 1)]);
        assert!(u[0].a_active && !u[0].b_active);
        assert!(!u[1].a_active && u[1].b_active);

        let v = mask.active_edges(EdgeOrientation::V);
        let keys: Vec<_> = v.iter().map(|e| (e.n, e.m)).collect();
        assert_eq!(keys, vec![(0, 0), (0, 2)]);
        // (0,1)-(1,1) joins two inactive cells.
        assert!(mask.edge_at(0, 1, EdgeOrientation::V).is_none());
    }

    #[test]
    fn mask_json_round_trip() {
        let mask = Mask::from_values(2, 2, &[0, 1, 2, 3]).unwrap();
        let json = serde_json::to_string(&mask).unwrap();
        let back: Mask = serde_json::from_str(&json).unwrap();
        assert_eq!(mask, back);
        assert!(serde_json::from_str::<Mask>(r#"{"nmax":1,"mmax":1,"data":[7]}"#).is_err());
    }
}
