use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use subgrid_core::{
    io, BuildParams, BuildWarning, ComputationalGrid, DegenerateKind, EdgeOrientation, Mask, PixelGrid,
    Raster, RasterMerge, RasterSource, Result, SourceMerger, SubgridBuilder, SubgridError,
};
use tempfile::TempDir;

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// Every cell holds the same ramp `z = k · 3/15`, `k = 0..16` in row-major
/// pixel order, on a lattice of 2.5 m pixels.
fn ramp_source(grid: &ComputationalGrid, nsub: usize) -> RasterSource {
    let rows = grid.nmax * nsub;
    let cols = grid.mmax * nsub;
    let pg = PixelGrid::north_up(grid.x0, grid.y0, grid.dx / nsub as f64, grid.dy / nsub as f64, rows, cols);
    let mut raster = Raster::nodata(pg);
    for r in 0..rows {
        for c in 0..cols {
            let k = (r % nsub) * nsub + c % nsub;
            raster.set(r, c, k as f32 * 3.0 / 15.0);
        }
    }
    RasterSource::new("ramp", raster)
}

fn random_source(grid: &ComputationalGrid, res: f64, seed: u64, lo: f32, hi: f32) -> Raster {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = (grid.nmax as f64 * grid.dy / res).ceil() as usize;
    let cols = (grid.mmax as f64 * grid.dx / res).ceil() as usize;
    let pg = PixelGrid::north_up(grid.x0, grid.y0, res, res, rows, cols);
    let data = (0..rows * cols).map(|_| rng.gen_range(lo..hi)).collect();
    Raster::from_data(pg, data).unwrap()
}

/// Counts merge calls and delegates to the in-memory merger.
#[derive(Default)]
struct CountingMerger {
    calls: AtomicUsize,
}

impl RasterMerge for CountingMerger {
    fn merge(&self, sources: &[RasterSource], footprint: &PixelGrid) -> Result<subgrid_core::Raster> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        SourceMerger.merge(sources, footprint)
    }
}

struct FailingMerger;

impl RasterMerge for FailingMerger {
    fn merge(&self, _sources: &[RasterSource], _footprint: &PixelGrid) -> Result<Raster> {
        Err(SubgridError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "tile missing")))
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn ramp_cells_have_expected_volumes() {
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 2, 2).unwrap();
    let mask = Mask::all_active(&grid);
    let params = BuildParams {
        nbins: 3,
        nr_subgrid_pixels: 4,
        ..BuildParams::default()
    };
    let out = SubgridBuilder::new(&grid, &mask, params)
        .unwrap()
        .build(&[ramp_source(&grid, 4)], &[], &SourceMerger)
        .unwrap();

    assert_eq!(out.report.clipped_pixels, 0);
    assert_eq!(out.table.cells.len(), 4);
    for cell in &out.table.cells {
        let cell = cell.as_ref().unwrap();
        // Σ (3 − 0.2k) · 6.25 over k = 0..16
        let volmax = (0..16).map(|k| (3.0 - 0.2 * k as f64) * 6.25).sum::<f64>();
        assert_relative_eq!(volmax, 150.0, epsilon = 1e-9);
        assert_eq!(cell.zmin, 0.0);
        assert_eq!(cell.zmax, 3.0);
        assert_relative_eq!(cell.zmean, 1.5, epsilon = 1e-5);
        assert_relative_eq!(cell.volmax, 150.0, epsilon = 1e-3);
        assert_eq!(cell.volumes[0], 0.0);
        assert_relative_eq!(cell.volumes[3], 150.0, epsilon = 1e-3);
        // Level 1 wets k = 0..=5, level 2 wets k = 0..=10.
        assert_relative_eq!(cell.volumes[1], 18.75, epsilon = 1e-3);
        assert_relative_eq!(cell.volumes[2], 68.75, epsilon = 1e-3);
        for (b, &level) in cell.levels.iter().enumerate() {
            assert_relative_eq!(level, b as f32, epsilon = 1e-6);
        }
    }

    let u = out.table.u_edges[0].as_ref().unwrap();
    assert_eq!(u.pixel_count, 16);
    assert_eq!(u.hrep[0], 0.0);
    assert!(u.hrep.windows(2).all(|w| w[0] <= w[1]));
    // Ramp is above the land level everywhere except k = 0.
    assert!(u.navg.iter().all(|&n| (0.02..=0.04).contains(&n)));
}

#[test]
fn tables_do_not_depend_on_block_size() {
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 4, 3).unwrap();
    let mut mask = Mask::all_active(&grid);
    mask.set(1, 2, subgrid_core::MaskState::Inactive);
    mask.set(2, 0, subgrid_core::MaskState::WaterLevelBoundary);

    let dep = RasterSource::new("dep", random_source(&grid, 2.0, 3, -4.0, 12.0));
    let mut rgh_raster = random_source(&grid, 5.0, 5, 0.015, 0.06);
    rgh_raster.set(0, 0, f32::NAN);
    rgh_raster.set(3, 5, f32::NAN);
    let rgh = RasterSource::new("rgh", rgh_raster);

    let build = |block_max_cells: usize| {
        let params = BuildParams {
            nbins: 5,
            nr_subgrid_pixels: 5,
            block_max_cells,
            max_gradient: 1.0,
            ..BuildParams::default()
        };
        SubgridBuilder::new(&grid, &mask, params)
            .unwrap()
            .build(std::slice::from_ref(&dep), std::slice::from_ref(&rgh), &SourceMerger)
            .unwrap()
    };
    let whole = build(2000);
    let quads = build(4);
    let single = build(1);
    assert_eq!(whole.report.blocks_processed, 1);
    assert!(quads.report.blocks_processed > 1);
    assert!(whole.report.clipped_pixels > 0);
    assert_eq!(whole.table, quads.table);
    assert_eq!(whole.table, single.table);
}

#[test]
fn faces_need_an_active_side() {
    // n=0: [1 0 0]
    // n=1: [1 0 1]
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 3, 2).unwrap();
    let mask = Mask::from_values(2, 3, &[1, 0, 0, 1, 0, 1]).unwrap();
    let nsub = 4;
    let params = BuildParams {
        nbins: 2,
        nr_subgrid_pixels: nsub,
        ..BuildParams::default()
    };
    let out = SubgridBuilder::new(&grid, &mask, params)
        .unwrap()
        .build(&[ramp_source(&grid, nsub)], &[], &SourceMerger)
        .unwrap();

    // u faces keyed (0,0), (1,0), (1,1); (0,1)-(0,2) joins two inactive cells.
    assert_eq!(out.table.u_edges.len(), 3);
    assert!(mask.edge_at(0, 1, EdgeOrientation::U).is_none());
    // One-sided faces only sample the active half strip.
    for face in &out.table.u_edges {
        assert_eq!(face.as_ref().unwrap().pixel_count as usize, nsub * nsub / 2);
    }
    // v faces keyed (0,0) (both active) and (0,2) (upper side active).
    assert_eq!(out.table.v_edges.len(), 2);
    assert_eq!(out.table.v_edges[0].as_ref().unwrap().pixel_count as usize, nsub * nsub);
    assert_eq!(out.table.v_edges[1].as_ref().unwrap().pixel_count as usize, nsub * nsub / 2);
}

#[test]
fn built_table_survives_save_and_load() {
    let grid = ComputationalGrid::new(100.0, 50.0, 20.0, 20.0, 3, 3)
        .unwrap()
        .with_rotation(15.0)
        .unwrap();
    let mask = Mask::from_values(3, 3, &[1, 1, 0, 1, 2, 0, 3, 1, 1]).unwrap();
    let wide = PixelGrid::north_up(0.0, 0.0, 4.0, 4.0, 60, 60);
    let mut rng = StdRng::seed_from_u64(17);
    let data = (0..wide.len()).map(|_| rng.gen_range(-2.0f32..8.0)).collect();
    let dep = RasterSource::new("dep", Raster::from_data(wide, data).unwrap());
    let params = BuildParams {
        nbins: 4,
        nr_subgrid_pixels: 4,
        block_max_cells: 2,
        ..BuildParams::default()
    };
    let out = SubgridBuilder::new(&grid, &mask, params)
        .unwrap()
        .build(&[dep], &[], &SourceMerger)
        .unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("roundtrip.sbg");
    io::save(&out.table, &path, &mask).unwrap();
    let back = io::load(&path, &mask).unwrap();
    assert_eq!(back, out.table);

    let other = Mask::all_active(&grid);
    match io::load(&path, &other) {
        Err(SubgridError::FormatMismatch { field, offset, .. }) => {
            assert_eq!(field, "nr_cells");
            assert_eq!(offset, 0);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn uncovered_blocks_fall_back_to_constants() {
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 6, 1).unwrap();
    let mask = Mask::all_active(&grid);
    // Elevation only under the first two cells.
    let covered = PixelGrid::north_up(0.0, 0.0, 5.0, 5.0, 2, 4);
    let dep = RasterSource::new("partial", Raster::new(covered, 2.0));
    let params = BuildParams {
        nbins: 2,
        nr_subgrid_pixels: 2,
        block_max_cells: 1,
        z_minimum: -10.0,
        ..BuildParams::default()
    };
    let out = SubgridBuilder::new(&grid, &mask, params)
        .unwrap()
        .build(&[dep], &[], &SourceMerger)
        .unwrap();

    // Cells 2 and 3 see data in their margins only; that does not cover them.
    assert_eq!(out.report.data_gaps().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    for slot in 2..6 {
        let gap = out.table.cells[slot].as_ref().unwrap();
        assert_eq!((gap.zmin, gap.zmax, gap.volmax), (-10.0, -10.0, 0.0));
    }
    for slot in 2..5 {
        let face = out.table.u_edges[slot].as_ref().unwrap();
        assert!(face.navg.iter().all(|&n| n == 0.04));
    }

    assert!(!out
        .report
        .warnings
        .iter()
        .any(|w| matches!(w, BuildWarning::DegenerateCell { kind: DegenerateKind::NoData, .. })));
    for cell in &out.table.cells[..2] {
        assert_eq!(cell.as_ref().unwrap().zmin, 2.0);
    }
}

#[test]
fn empty_blocks_are_not_merged() {
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 6, 1).unwrap();
    let mask = Mask::from_values(1, 6, &[1, 1, 0, 0, 0, 0]).unwrap();
    let params = BuildParams {
        nbins: 2,
        nr_subgrid_pixels: 2,
        block_max_cells: 1,
        ..BuildParams::default()
    };
    let merger = CountingMerger::default();
    let out = SubgridBuilder::new(&grid, &mask, params)
        .unwrap()
        .build(&[ramp_source(&grid, 2)], &[], &merger)
        .unwrap();
    // Block 1 keys the face towards the inactive cell 2; blocks 2..6 hold nothing.
    assert_eq!(out.report.blocks_processed, 2);
    assert_eq!(out.report.blocks_skipped, 4);
    assert_eq!(merger.calls.load(Ordering::Relaxed), 2);
    assert_eq!(out.table.u_edges.len(), 2);
}

#[test]
fn cancelled_build_stops_between_blocks() {
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 2, 2).unwrap();
    let mask = Mask::all_active(&grid);
    let flag = Arc::new(AtomicBool::new(true));
    let result = SubgridBuilder::new(&grid, &mask, BuildParams::default())
        .unwrap()
        .with_cancel_flag(flag)
        .build(&[ramp_source(&grid, 20)], &[], &SourceMerger);
    assert!(matches!(result, Err(SubgridError::Cancelled { block: 0 })));
}

#[test]
fn merge_failures_name_the_block() {
    let grid = ComputationalGrid::new(0.0, 0.0, 10.0, 10.0, 2, 2).unwrap();
    let mask = Mask::all_active(&grid);
    let result = SubgridBuilder::new(&grid, &mask, BuildParams::default())
        .unwrap()
        .build(&[ramp_source(&grid, 20)], &[], &FailingMerger);
    match result {
        Err(SubgridError::Merge { block, reason }) => {
            assert_eq!(block, 0);
            assert!(reason.contains("tile missing"));
        }
        other => panic!("unexpected result: {:?}", other.map(|o| o.report)),
    }
}
