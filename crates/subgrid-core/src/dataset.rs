//! Labelled full-grid export of a subgrid table.
//!
//! Sparse per-slot rows are scattered back onto the `nmax × mmax` grid; cells
//! and faces without a row are NaN. Per-level fields carry a leading `bins`
//! dimension.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::grid::{ComputationalGrid, EdgeOrientation, Mask};
use crate::raster::null_as_nan_vec;
use crate::table::{CellTable, EdgeTable, SubgridTable};
use crate::{Result, SubgridError};

/// One labelled array, row-major over `dims`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArray {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    #[serde(deserialize_with = "null_as_nan_vec")]
    pub data: Vec<f32>,
}

/// Coordinate values along one or two dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub dims: Vec<String>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgridDataset {
    pub dims: BTreeMap<String, usize>,
    pub coords: BTreeMap<String, Coordinate>,
    pub data_vars: BTreeMap<String, DataArray>,
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl SubgridDataset {
    pub fn var(&self, name: &str) -> Option<&DataArray> {
        self.data_vars.get(name)
    }
}

impl DataArray {
    /// Value at a full index, e.g. `[bin, n, m]` or `[n, m]`.
    pub fn at(&self, index: &[usize]) -> f32 {
        let flat = index
            .iter()
            .zip(self.shape.iter())
            .fold(0, |acc, (&i, &len)| acc * len + i);
        self.data[flat]
    }
}

/// Scatters per-slot values into full-grid layers.
struct Scatter<'a> {
    /// Row-major grid positions of the slots.
    positions: &'a [usize],
    cells: usize,
}

impl Scatter<'_> {
    fn layer<T>(&self, rows: &[Option<T>], field: impl Fn(&T) -> f32) -> Vec<f32> {
        let mut out = vec![f32::NAN; self.cells];
        for (row, &pos) in rows.iter().zip(self.positions) {
            if let Some(row) = row {
                out[pos] = field(row);
            }
        }
        out
    }

    fn binned<T>(&self, rows: &[Option<T>], bins: usize, field: impl Fn(&T) -> &[f32]) -> Vec<f32> {
        (0..bins)
            .flat_map(|b| self.layer(rows, |r| field(r)[b]))
            .collect()
    }
}

/// Export `table` as labelled arrays over the grid.
///
/// `dims` names the row and column dimensions (`("y", "x")` for the usual
/// raster layout). Unrotated grids get 1-D coordinates named after them;
/// rotated grids get 2-D `xc`/`yc` cell-centre coordinates.
pub fn to_dataset(
    table: &SubgridTable,
    mask: &Mask,
    grid: &ComputationalGrid,
    dims: (&str, &str),
) -> Result<SubgridDataset> {
    mask.check_shape(grid)?;
    let cell_pos: Vec<usize> = mask
        .active_cells()
        .into_iter()
        .map(|(n, m)| n * grid.mmax + m)
        .collect();
    let u_pos: Vec<usize> = edge_positions(mask, EdgeOrientation::U, grid.mmax);
    let v_pos: Vec<usize> = edge_positions(mask, EdgeOrientation::V, grid.mmax);
    for (name, slots, expected) in [
        ("cells", table.cells.len(), cell_pos.len()),
        ("u edges", table.u_edges.len(), u_pos.len()),
        ("v edges", table.v_edges.len(), v_pos.len()),
    ] {
        if slots != expected {
            return Err(SubgridError::config(format!(
                "table has {slots} {name}, mask has {expected}"
            )));
        }
    }

    let (row_dim, col_dim) = (dims.0.to_string(), dims.1.to_string());
    let (nmax, mmax) = (grid.nmax, grid.mmax);
    let bins = table.meta.nbins + 1;
    let grid_array = |data: Vec<f32>| DataArray {
        dims: vec![row_dim.clone(), col_dim.clone()],
        shape: vec![nmax, mmax],
        data,
    };
    let binned_array = |data: Vec<f32>| DataArray {
        dims: vec!["bins".to_string(), row_dim.clone(), col_dim.clone()],
        shape: vec![bins, nmax, mmax],
        data,
    };

    let mut vars = BTreeMap::new();
    let cells = Scatter {
        positions: &cell_pos,
        cells: nmax * mmax,
    };
    let rows: &[Option<CellTable>] = &table.cells;
    vars.insert("z_zmin".into(), grid_array(cells.layer(rows, |c| c.zmin)));
    vars.insert("z_zmax".into(), grid_array(cells.layer(rows, |c| c.zmax)));
    vars.insert("z_zmean".into(), grid_array(cells.layer(rows, |c| c.zmean)));
    vars.insert("z_volmax".into(), grid_array(cells.layer(rows, |c| c.volmax)));
    vars.insert("z_level".into(), binned_array(cells.binned(rows, bins, |c| c.levels.as_slice())));
    vars.insert("z_volume".into(), binned_array(cells.binned(rows, bins, |c| c.volumes.as_slice())));

    for (prefix, positions, rows) in [("u", &u_pos, &table.u_edges), ("v", &v_pos, &table.v_edges)] {
        let edges = Scatter {
            positions,
            cells: nmax * mmax,
        };
        let rows: &[Option<EdgeTable>] = rows;
        vars.insert(format!("{prefix}_zmin"), grid_array(edges.layer(rows, |e| e.zmin)));
        vars.insert(format!("{prefix}_zmax"), grid_array(edges.layer(rows, |e| e.zmax)));
        vars.insert(
            format!("{prefix}_npix"),
            grid_array(edges.layer(rows, |e| e.pixel_count as f32)),
        );
        vars.insert(format!("{prefix}_level"), binned_array(edges.binned(rows, bins, |e| e.levels.as_slice())));
        vars.insert(format!("{prefix}_hrep"), binned_array(edges.binned(rows, bins, |e| e.hrep.as_slice())));
        vars.insert(format!("{prefix}_navg"), binned_array(edges.binned(rows, bins, |e| e.navg.as_slice())));
    }

    let mut coords = BTreeMap::new();
    coords.insert(
        "bins".to_string(),
        Coordinate {
            dims: vec!["bins".to_string()],
            values: (0..bins).map(|b| b as f64).collect(),
        },
    );
    if grid.rotation == 0.0 {
        coords.insert(
            col_dim.clone(),
            Coordinate {
                dims: vec![col_dim.clone()],
                values: (0..mmax).map(|m| grid.cell_center(0, m).0).collect(),
            },
        );
        coords.insert(
            row_dim.clone(),
            Coordinate {
                dims: vec![row_dim.clone()],
                values: (0..nmax).map(|n| grid.cell_center(n, 0).1).collect(),
            },
        );
    } else {
        let centres: Vec<(f64, f64)> = (0..nmax)
            .flat_map(|n| (0..mmax).map(move |m| (n, m)))
            .map(|(n, m)| grid.cell_center(n, m))
            .collect();
        let plane = vec![row_dim.clone(), col_dim.clone()];
        coords.insert(
            "xc".to_string(),
            Coordinate {
                dims: plane.clone(),
                values: centres.iter().map(|c| c.0).collect(),
            },
        );
        coords.insert(
            "yc".to_string(),
            Coordinate {
                dims: plane,
                values: centres.iter().map(|c| c.1).collect(),
            },
        );
    }

    let mut attrs = BTreeMap::new();
    attrs.insert("nbins".to_string(), table.meta.nbins.into());
    attrs.insert("nr_subgrid_pixels".to_string(), table.meta.nr_subgrid_pixels.into());
    attrs.insert("z_minimum".to_string(), table.meta.z_minimum.into());
    attrs.insert("max_gradient".to_string(), table.meta.max_gradient.into());
    attrs.insert("rotation".to_string(), grid.rotation.into());
    if let Some(epsg) = grid.epsg {
        attrs.insert("epsg".to_string(), epsg.into());
    }

    let dims = BTreeMap::from([(row_dim, nmax), (col_dim, mmax), ("bins".to_string(), bins)]);
    Ok(SubgridDataset {
        dims,
        coords,
        data_vars: vars,
        attrs,
    })
}

fn edge_positions(mask: &Mask, orientation: EdgeOrientation, mmax: usize) -> Vec<usize> {
    mask.active_edges(orientation)
        .into_iter()
        .map(|e| e.n * mmax + e.m)
        .collect()
}
