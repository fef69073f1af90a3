//! In-memory subgrid tables: one row per active cell and per active face.

use serde::{Deserialize, Serialize};

use crate::builder::BuildParams;

/// Build parameters recorded in the table and the binary header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubgridMeta {
    pub nbins: usize,
    pub nr_subgrid_pixels: usize,
    pub z_minimum: f32,
    pub max_gradient: f32,
}

impl From<&BuildParams> for SubgridMeta {
    fn from(params: &BuildParams) -> Self {
        Self {
            nbins: params.nbins,
            nr_subgrid_pixels: params.nr_subgrid_pixels,
            z_minimum: params.z_minimum,
            max_gradient: params.max_gradient,
        }
    }
}

/// Volume-vs-level table of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellTable {
    pub zmin: f32,
    pub zmax: f32,
    pub zmean: f32,
    /// Volume with the cell filled to `zmax`.
    pub volmax: f32,
    /// `nbins + 1` levels from `zmin` to `zmax`.
    pub levels: Vec<f32>,
    /// Stored volume at each level; starts at 0, ends at `volmax`.
    pub volumes: Vec<f32>,
}

/// Representative depth and effective roughness table of one face.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeTable {
    pub zmin: f32,
    pub zmax: f32,
    /// Valid pixels in the face strip.
    pub pixel_count: u32,
    pub levels: Vec<f32>,
    pub hrep: Vec<f32>,
    pub navg: Vec<f32>,
}

/// Complete subgrid table for one grid and mask.
///
/// Slot `k` of `cells` is the k-th active cell in column-major order; the
/// edge vectors follow the same order of their key cells. `None` marks a
/// cell or face that had no elevation data.
#[derive(Debug, Clone, PartialEq)]
pub struct SubgridTable {
    pub meta: SubgridMeta,
    pub cells: Vec<Option<CellTable>>,
    pub u_edges: Vec<Option<EdgeTable>>,
    pub v_edges: Vec<Option<EdgeTable>>,
}

impl SubgridTable {
    /// Empty table with all slots unset.
    pub fn with_slots(meta: SubgridMeta, cells: usize, u_edges: usize, v_edges: usize) -> Self {
        Self {
            meta,
            cells: vec![None; cells],
            u_edges: vec![None; u_edges],
            v_edges: vec![None; v_edges],
        }
    }

    /// Slots of cells holding a table.
    pub fn valid_cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
    }

    /// Total stored volume with every valid cell filled to its top.
    pub fn total_volmax(&self) -> f64 {
        self.cells.iter().flatten().map(|c| c.volmax as f64).sum()
    }
}
