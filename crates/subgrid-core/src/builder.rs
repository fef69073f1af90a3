//! Block-wise construction of a [`SubgridTable`].
//!
//! The grid is processed one block at a time so that only one block's
//! high-resolution elevation and roughness rasters are resident. Per block:
//!
//! 1. skip it when it holds no active cell and keys no active face;
//! 2. merge elevation over the block footprint plus a margin of
//!    `nr_subgrid_pixels + 1` pixels (face strips of the neighbouring cells
//!    and one pixel of gradient context);
//! 3. clip gradients, apply the elevation floor;
//! 4. merge or synthesize roughness;
//! 5. bin every active cell and every active face keyed in the block and
//!    write the rows into their pre-allocated slots.
//!
//! Pixel centres come from global lattice indices, so the table does not
//! depend on the block size except where a data gap forces the fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "threading")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binner::{cell_table, edge_table};
use crate::block::{partition_blocks, Block};
use crate::conditioning::{apply_floor, clip_gradients, ManningFallback};
use crate::grid::{ComputationalGrid, Edge, EdgeOrientation, Mask, PixelGrid};
use crate::merge::{RasterMerge, RasterSource};
use crate::raster::Raster;
use crate::table::{CellTable, EdgeTable, SubgridMeta, SubgridTable};
use crate::{Result, SubgridError};

// ── Parameters ────────────────────────────────────────────────────────────────

/// Subgrid build settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildParams {
    /// Number of level bins per cell and face.
    pub nbins: usize,
    /// High-resolution pixels per cell side.
    pub nr_subgrid_pixels: usize,
    /// Upper bound on cells per processing block.
    pub block_max_cells: usize,
    /// Maximum pixel-to-pixel slope (m/m).
    pub max_gradient: f32,
    /// Elevation floor applied to merged pixels.
    pub z_minimum: f32,
    pub manning_land: f32,
    pub manning_sea: f32,
    /// Pixels above this elevation get `manning_land`.
    pub manning_land_level: f32,
    /// Return the conditioned full-extent rasters.
    pub keep_highres: bool,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            nbins: 10,
            nr_subgrid_pixels: 20,
            block_max_cells: 2000,
            max_gradient: 5.0,
            z_minimum: -99999.0,
            manning_land: 0.04,
            manning_sea: 0.02,
            manning_land_level: 0.0,
            keep_highres: false,
        }
    }
}

impl BuildParams {
    pub fn validate(&self) -> Result<()> {
        if self.nbins < 2 {
            return Err(SubgridError::config(format!("nbins must be at least 2, got {}", self.nbins)));
        }
        if self.nr_subgrid_pixels == 0 {
            return Err(SubgridError::config("nr_subgrid_pixels must be positive"));
        }
        if self.block_max_cells == 0 {
            return Err(SubgridError::config("block_max_cells must be positive"));
        }
        if !(self.max_gradient.is_finite() && self.max_gradient > 0.0) {
            return Err(SubgridError::config(format!(
                "max_gradient must be positive and finite, got {}",
                self.max_gradient
            )));
        }
        if !self.z_minimum.is_finite() {
            return Err(SubgridError::config("z_minimum must be finite"));
        }
        for (name, v) in [("manning_land", self.manning_land), ("manning_sea", self.manning_sea)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(SubgridError::config(format!("{name} must be positive and finite, got {v}")));
            }
        }
        if !self.manning_land_level.is_finite() {
            return Err(SubgridError::config("manning_land_level must be finite"));
        }
        Ok(())
    }

    fn manning_fallback(&self) -> ManningFallback {
        ManningFallback {
            land: self.manning_land,
            sea: self.manning_sea,
            land_level: self.manning_land_level,
        }
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateKind {
    /// Every pixel has the same elevation.
    Flat,
    /// No pixel holds data; the slot is left empty.
    NoData,
}

/// Recoverable condition met during a build.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildWarning {
    /// No elevation source covers the block; it was filled with fallback values.
    DataGap { block: usize },
    /// A cell's patch is flat or empty.
    DegenerateCell {
        slot: usize,
        n: usize,
        m: usize,
        kind: DegenerateKind,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    pub blocks_processed: usize,
    pub blocks_skipped: usize,
    /// Pixels changed by gradient clipping, summed over blocks.
    pub clipped_pixels: usize,
    pub warnings: Vec<BuildWarning>,
}

impl BuildReport {
    pub fn data_gaps(&self) -> impl Iterator<Item = usize> + '_ {
        self.warnings.iter().filter_map(|w| match w {
            BuildWarning::DataGap { block } => Some(*block),
            _ => None,
        })
    }
}

/// Conditioned elevation and roughness over the whole grid.
#[derive(Debug, Clone, PartialEq)]
pub struct HighresRasters {
    pub dep: Raster,
    pub rgh: Raster,
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub table: SubgridTable,
    pub report: BuildReport,
    pub highres: Option<HighresRasters>,
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Active items of one block with their table slots.
#[derive(Default)]
struct BlockItems {
    cells: Vec<(usize, usize, usize)>,
    u_edges: Vec<(usize, Edge)>,
    v_edges: Vec<(usize, Edge)>,
}

impl BlockItems {
    fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.u_edges.is_empty() && self.v_edges.is_empty()
    }
}

/// Pixel geometry of one merged block raster.
struct BlockWindow {
    n0: usize,
    m0: usize,
    nsub: usize,
    pad: usize,
}

impl BlockWindow {
    /// First local pixel row of cell row `n`.
    fn row(&self, n: usize) -> usize {
        (n - self.n0) * self.nsub + self.pad
    }

    fn col(&self, m: usize) -> usize {
        (m - self.m0) * self.nsub + self.pad
    }

    /// Valid pixels under the block's own `rows × cols` cells, margin excluded.
    fn interior_valid(&self, dep: &Raster, rows: usize, cols: usize) -> usize {
        let (r0, c0) = (self.pad, self.pad);
        (r0..r0 + rows * self.nsub)
            .flat_map(|r| (c0..c0 + cols * self.nsub).map(move |c| (r, c)))
            .filter(|&(r, c)| !dep.get(r, c).is_nan())
            .count()
    }

    /// Pixel windows of the half strips on either side of a face. Only
    /// sides whose cell is active are returned.
    fn edge_strips(&self, edge: &Edge) -> Vec<(usize, usize, usize, usize)> {
        let nsub = self.nsub;
        let hw = (nsub + 1) / 2;
        let (nb, mb) = edge.neighbour();
        let mut strips = Vec::with_capacity(2);
        match edge.orientation {
            EdgeOrientation::U => {
                if edge.a_active {
                    strips.push((self.row(edge.n), self.col(edge.m) + nsub - hw, nsub, hw));
                }
                if edge.b_active {
                    strips.push((self.row(nb), self.col(mb), nsub, hw));
                }
            }
            EdgeOrientation::V => {
                if edge.a_active {
                    strips.push((self.row(edge.n) + nsub - hw, self.col(edge.m), hw, nsub));
                }
                if edge.b_active {
                    strips.push((self.row(nb), self.col(mb), hw, nsub));
                }
            }
        }
        strips
    }
}

/// Builds subgrid tables for one grid and mask.
pub struct SubgridBuilder<'a> {
    grid: &'a ComputationalGrid,
    mask: &'a Mask,
    params: BuildParams,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> SubgridBuilder<'a> {
    /// Validates the grid, mask shape and parameters.
    pub fn new(grid: &'a ComputationalGrid, mask: &'a Mask, params: BuildParams) -> Result<Self> {
        grid.validate()?;
        mask.check_shape(grid)?;
        params.validate()?;
        Ok(Self {
            grid,
            mask,
            params,
            cancel: None,
        })
    }

    /// Abort the build before the next block once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Run the build. `dep` must hold at least one source; an empty `rgh`
    /// derives roughness from elevation.
    pub fn build<M: RasterMerge + ?Sized>(
        &self,
        dep: &[RasterSource],
        rgh: &[RasterSource],
        merger: &M,
    ) -> Result<BuildOutput> {
        if dep.is_empty() {
            return Err(SubgridError::config("at least one elevation source is required"));
        }
        let p = &self.params;
        let nsub = p.nr_subgrid_pixels;
        let (nmax, mmax) = (self.grid.nmax, self.grid.mmax);

        let cell_slots = self.mask.cell_slots();
        let u_slots = self.mask.edge_slots(EdgeOrientation::U);
        let v_slots = self.mask.edge_slots(EdgeOrientation::V);
        let count = |slots: &[Option<usize>]| slots.iter().flatten().count();
        let mut table = SubgridTable::with_slots(
            SubgridMeta::from(p),
            count(&cell_slots),
            count(&u_slots),
            count(&v_slots),
        );
        let mut report = BuildReport::default();
        let mut highres = p.keep_highres.then(|| {
            let full = self.grid.pixel_grid(nsub, 0, 0, nmax, mmax, 0);
            HighresRasters {
                dep: Raster::nodata(full.clone()),
                rgh: Raster::nodata(full),
            }
        });

        let blocks = partition_blocks(nmax, mmax, p.block_max_cells);
        info!(
            nmax,
            mmax,
            cells = table.cells.len(),
            u_edges = table.u_edges.len(),
            v_edges = table.v_edges.len(),
            blocks = blocks.len(),
            nr_subgrid_pixels = nsub,
            nbins = p.nbins,
            "building subgrid tables"
        );

        for block in &blocks {
            if self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                warn!(block = block.index, "subgrid build cancelled");
                return Err(SubgridError::Cancelled { block: block.index });
            }

            let items = self.block_items(block, &cell_slots, &u_slots, &v_slots);
            if items.is_empty() {
                debug!(block = block.index, "no active cells or faces, skipping block");
                report.blocks_skipped += 1;
                continue;
            }
            self.process_block(block, &items, dep, rgh, merger, &mut table, &mut report, highres.as_mut())?;
            report.blocks_processed += 1;
        }

        info!(
            processed = report.blocks_processed,
            skipped = report.blocks_skipped,
            valid_cells = table.valid_cells().count(),
            warnings = report.warnings.len(),
            "subgrid build finished"
        );
        Ok(BuildOutput {
            table,
            report,
            highres,
        })
    }

    fn block_items(
        &self,
        block: &Block,
        cell_slots: &[Option<usize>],
        u_slots: &[Option<usize>],
        v_slots: &[Option<usize>],
    ) -> BlockItems {
        let mmax = self.grid.mmax;
        let mut items = BlockItems::default();
        for n in block.n0..block.n1 {
            for m in block.m0..block.m1 {
                let k = n * mmax + m;
                if let Some(slot) = cell_slots[k] {
                    items.cells.push((slot, n, m));
                }
                if let (Some(slot), Some(edge)) = (u_slots[k], self.mask.edge_at(n, m, EdgeOrientation::U)) {
                    items.u_edges.push((slot, edge));
                }
                if let (Some(slot), Some(edge)) = (v_slots[k], self.mask.edge_at(n, m, EdgeOrientation::V)) {
                    items.v_edges.push((slot, edge));
                }
            }
        }
        items
    }

    fn merge_block<M: RasterMerge + ?Sized>(
        &self,
        block: &Block,
        sources: &[RasterSource],
        footprint: &PixelGrid,
        merger: &M,
    ) -> Result<Raster> {
        let merged = merger.merge(sources, footprint).map_err(|e| match e {
            SubgridError::Merge { .. } => e,
            other => SubgridError::Merge {
                block: block.index,
                reason: other.to_string(),
            },
        })?;
        if merged.grid.rows != footprint.rows
            || merged.grid.cols != footprint.cols
            || merged.data.len() != footprint.len()
        {
            return Err(SubgridError::Merge {
                block: block.index,
                reason: format!(
                    "expected {}x{} pixels, got {}x{}",
                    footprint.rows, footprint.cols, merged.grid.rows, merged.grid.cols
                ),
            });
        }
        Ok(merged)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_block<M: RasterMerge + ?Sized>(
        &self,
        block: &Block,
        items: &BlockItems,
        dep_sources: &[RasterSource],
        rgh_sources: &[RasterSource],
        merger: &M,
        table: &mut SubgridTable,
        report: &mut BuildReport,
        highres: Option<&mut HighresRasters>,
    ) -> Result<()> {
        let p = &self.params;
        let nsub = p.nr_subgrid_pixels;
        let pad = nsub + 1;
        let footprint = self
            .grid
            .pixel_grid(nsub, block.n0, block.m0, block.rows(), block.cols(), pad);
        let fallback = p.manning_fallback();

        let window = BlockWindow {
            n0: block.n0,
            m0: block.m0,
            nsub,
            pad,
        };
        let mut dep = self.merge_block(block, dep_sources, &footprint, merger)?;
        let valid = window.interior_valid(&dep, block.rows(), block.cols());
        debug!(
            block = block.index,
            rows = footprint.rows,
            cols = footprint.cols,
            valid,
            margin = dep.valid_count() - valid,
            "merged elevation"
        );

        let data_gap = valid == 0;
        let rgh = if data_gap {
            warn!(
                block = block.index,
                z_minimum = p.z_minimum,
                manning = p.manning_land,
                "no elevation data for block, using fallback values"
            );
            report.warnings.push(BuildWarning::DataGap { block: block.index });
            dep = Raster::new(footprint.clone(), p.z_minimum);
            Raster::new(footprint.clone(), p.manning_land)
        } else {
            report.clipped_pixels += clip_gradients(&mut dep, p.max_gradient);
            apply_floor(&mut dep, p.z_minimum);
            if rgh_sources.is_empty() {
                fallback.synthesize(&dep)
            } else {
                let mut rgh = self.merge_block(block, rgh_sources, &footprint, merger)?;
                let filled = fallback.fill_gaps(&mut rgh, &dep);
                if filled > 0 {
                    debug!(block = block.index, filled, "filled roughness gaps");
                }
                rgh
            }
        };

        let pdx = self.grid.dx / nsub as f64;
        let pdy = self.grid.dy / nsub as f64;
        let nbins = p.nbins;

        let bin_cell = |&(slot, n, m): &(usize, usize, usize)| -> (usize, Option<CellTable>) {
            let mut patch = Vec::with_capacity(nsub * nsub);
            dep.copy_window(window.row(n), window.col(m), nsub, nsub, &mut patch);
            (slot, cell_table(&patch, pdx, pdy, nbins))
        };
        let bin_edge = |(slot, edge): &(usize, Edge)| -> (usize, Option<EdgeTable>) {
            let mut z = Vec::with_capacity(2 * nsub * nsub);
            let mut n = Vec::with_capacity(2 * nsub * nsub);
            for (row, col, rows, cols) in window.edge_strips(edge) {
                dep.copy_window(row, col, rows, cols, &mut z);
                rgh.copy_window(row, col, rows, cols, &mut n);
            }
            (*slot, edge_table(&z, &n, pdx, pdy, nbins))
        };

        #[cfg(feature = "threading")]
        let (cells, u_edges, v_edges) = (
            items.cells.par_iter().map(bin_cell).collect::<Vec<_>>(),
            items.u_edges.par_iter().map(bin_edge).collect::<Vec<_>>(),
            items.v_edges.par_iter().map(bin_edge).collect::<Vec<_>>(),
        );
        #[cfg(not(feature = "threading"))]
        let (cells, u_edges, v_edges) = (
            items.cells.iter().map(bin_cell).collect::<Vec<_>>(),
            items.u_edges.iter().map(bin_edge).collect::<Vec<_>>(),
            items.v_edges.iter().map(bin_edge).collect::<Vec<_>>(),
        );

        let (mut flat, mut empty) = (0usize, 0usize);
        for ((slot, row), &(_, n, m)) in cells.into_iter().zip(items.cells.iter()) {
            let kind = match &row {
                None => Some(DegenerateKind::NoData),
                Some(c) if c.zmin == c.zmax && !data_gap => Some(DegenerateKind::Flat),
                Some(_) => None,
            };
            match kind {
                Some(DegenerateKind::NoData) => empty += 1,
                Some(DegenerateKind::Flat) => flat += 1,
                None => {}
            }
            if let Some(kind) = kind {
                report.warnings.push(BuildWarning::DegenerateCell { slot, n, m, kind });
            }
            table.cells[slot] = row;
        }
        if flat + empty > 0 {
            warn!(block = block.index, flat, nodata = empty, "degenerate cells in block");
        }
        for (slot, row) in u_edges {
            table.u_edges[slot] = row;
        }
        for (slot, row) in v_edges {
            table.v_edges[slot] = row;
        }

        if let Some(out) = highres {
            let (r0, c0) = (block.n0 * nsub, block.m0 * nsub);
            let (rows, cols) = (block.rows() * nsub, block.cols() * nsub);
            for r in 0..rows {
                for c in 0..cols {
                    out.dep.set(r0 + r, c0 + c, dep.get(pad + r, pad + c));
                    out.rgh.set(r0 + r, c0 + c, rgh.get(pad + r, pad + c));
                }
            }
        }

        info!(
            block = block.index,
            n0 = block.n0,
            m0 = block.m0,
            cells = items.cells.len(),
            u_edges = items.u_edges.len(),
            v_edges = items.v_edges.len(),
            "processed block"
        );
        Ok(())
    }
}
