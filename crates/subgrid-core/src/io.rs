//! Binary subgrid file plus the simulator's index and mask files.
//!
//! Subgrid file layout, little-endian:
//!
//! ```text
//! i32 nr_cells            active cells in the mask
//! i32 version             = 1
//! i32 nbins
//! i32 nr_u_edges
//! i32 nr_v_edges
//! i32 nr_subgrid_pixels
//! f32 z_minimum
//! f32 max_gradient
//! f32 × nr_cells          zmin, zmax, zmean, volmax            (one block each)
//! f32 × nr_cells          level[b] for b in 0..=nbins           (one block per b)
//! f32 × nr_cells          volume[b] for b in 0..=nbins
//! f32 × nr_u_edges        zmin, zmax, pixel_count
//! f32 × nr_u_edges        level[b], hrep[b], navg[b]            (b in 0..=nbins each)
//! …                       v edges, same as u
//! ```
//!
//! An empty slot is written as NaN in every field.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::grid::{EdgeOrientation, Mask};
use crate::table::{CellTable, EdgeTable, SubgridMeta, SubgridTable};
use crate::{Result, SubgridError};

pub const FORMAT_VERSION: i32 = 1;
const HEADER_LEN: usize = 32;
const CELL_SCALARS: usize = 4;
const EDGE_SCALARS: usize = 3;

fn mismatch(field: &'static str, expected: usize, found: usize, offset: usize) -> SubgridError {
    SubgridError::FormatMismatch {
        field,
        expected: expected as i64,
        found: found as i64,
        offset,
    }
}

/// Expected file size for the given counts.
pub fn encoded_len(nbins: usize, cells: usize, u_edges: usize, v_edges: usize) -> usize {
    let bins = nbins + 1;
    let values = cells * (CELL_SCALARS + 2 * bins) + (u_edges + v_edges) * (EDGE_SCALARS + 3 * bins);
    HEADER_LEN + 4 * values
}

// ── Encoding ──────────────────────────────────────────────────────────────────

fn check_counts(table: &SubgridTable, mask: &Mask) -> Result<()> {
    let checks = [
        ("nr_cells", 0, mask.active_count(), table.cells.len()),
        ("nr_u_edges", 12, mask.edge_count(EdgeOrientation::U), table.u_edges.len()),
        ("nr_v_edges", 16, mask.edge_count(EdgeOrientation::V), table.v_edges.len()),
    ];
    for (field, offset, expected, found) in checks {
        if expected != found {
            return Err(mismatch(field, expected, found, offset));
        }
    }
    Ok(())
}

fn check_bins(table: &SubgridTable) -> Result<()> {
    let bins = table.meta.nbins + 1;
    let cells_ok = table
        .cells
        .iter()
        .flatten()
        .all(|c| c.levels.len() == bins && c.volumes.len() == bins);
    let edges_ok = table.u_edges.iter().chain(table.v_edges.iter()).flatten().all(|e| {
        e.levels.len() == bins && e.hrep.len() == bins && e.navg.len() == bins
    });
    if !(cells_ok && edges_ok) {
        return Err(SubgridError::config(format!(
            "table rows must hold nbins + 1 = {bins} levels"
        )));
    }
    Ok(())
}

fn put_i32(buf: &mut Vec<u8>, v: usize) {
    buf.extend_from_slice(&(v as i32).to_le_bytes());
}

/// Write one field of every slot, NaN for empty slots.
fn put_field<T>(buf: &mut Vec<u8>, rows: &[Option<T>], field: impl Fn(&T) -> f32) {
    for row in rows {
        let v = row.as_ref().map_or(f32::NAN, &field);
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_edges(buf: &mut Vec<u8>, edges: &[Option<EdgeTable>], bins: usize) {
    put_field(buf, edges, |e| e.zmin);
    put_field(buf, edges, |e| e.zmax);
    put_field(buf, edges, |e| e.pixel_count as f32);
    for b in 0..bins {
        put_field(buf, edges, |e| e.levels[b]);
    }
    for b in 0..bins {
        put_field(buf, edges, |e| e.hrep[b]);
    }
    for b in 0..bins {
        put_field(buf, edges, |e| e.navg[b]);
    }
}

/// Encode a table into the binary layout.
pub fn encode(table: &SubgridTable) -> Result<Vec<u8>> {
    check_bins(table)?;
    let meta = &table.meta;
    let bins = meta.nbins + 1;
    let mut buf = Vec::with_capacity(encoded_len(
        meta.nbins,
        table.cells.len(),
        table.u_edges.len(),
        table.v_edges.len(),
    ));

    put_i32(&mut buf, table.cells.len());
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    put_i32(&mut buf, meta.nbins);
    put_i32(&mut buf, table.u_edges.len());
    put_i32(&mut buf, table.v_edges.len());
    put_i32(&mut buf, meta.nr_subgrid_pixels);
    buf.extend_from_slice(&meta.z_minimum.to_le_bytes());
    buf.extend_from_slice(&meta.max_gradient.to_le_bytes());

    let cells = &table.cells;
    put_field(&mut buf, cells, |c| c.zmin);
    put_field(&mut buf, cells, |c| c.zmax);
    put_field(&mut buf, cells, |c| c.zmean);
    put_field(&mut buf, cells, |c| c.volmax);
    for b in 0..bins {
        put_field(&mut buf, cells, |c| c.levels[b]);
    }
    for b in 0..bins {
        put_field(&mut buf, cells, |c| c.volumes[b]);
    }
    put_edges(&mut buf, &table.u_edges, bins);
    put_edges(&mut buf, &table.v_edges, bins);
    Ok(buf)
}

/// Write a table to `path`, replacing any existing file only once the new
/// contents are fully on disk. The temporary file is removed on failure.
pub fn save(table: &SubgridTable, path: &Path, mask: &Mask) -> Result<()> {
    check_counts(table, mask)?;
    let bytes = encode(table)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    info!(path = %path.display(), bytes = bytes.len(), cells = table.cells.len(), "wrote subgrid file");
    Ok(())
}

// ── Decoding ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn word(&mut self) -> [u8; 4] {
        let mut w = [0u8; 4];
        w.copy_from_slice(&self.bytes[self.offset..self.offset + 4]);
        self.offset += 4;
        w
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.word())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.word())
    }

    fn field(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.f32()).collect()
    }

    /// `bins` consecutive fields, transposed to one vector per slot.
    fn binned(&mut self, n: usize, bins: usize) -> Vec<Vec<f32>> {
        let mut rows = vec![Vec::with_capacity(bins); n];
        for _ in 0..bins {
            for row in rows.iter_mut() {
                row.push(self.f32());
            }
        }
        rows
    }
}

/// Header count checked against the mask; negative counts are mismatches too.
fn header_count(raw: i32, field: &'static str, expected: usize, offset: usize) -> Result<usize> {
    if raw < 0 || raw as usize != expected {
        return Err(SubgridError::FormatMismatch {
            field,
            expected: expected as i64,
            found: raw as i64,
            offset,
        });
    }
    Ok(expected)
}

fn read_edges(r: &mut Reader, n: usize, bins: usize) -> Vec<Option<EdgeTable>> {
    let zmin = r.field(n);
    let zmax = r.field(n);
    let npix = r.field(n);
    let levels = r.binned(n, bins);
    let hrep = r.binned(n, bins);
    let navg = r.binned(n, bins);
    levels
        .into_iter()
        .zip(hrep)
        .zip(navg)
        .enumerate()
        .map(|(i, ((levels, hrep), navg))| {
            (!zmin[i].is_nan()).then(|| EdgeTable {
                zmin: zmin[i],
                zmax: zmax[i],
                pixel_count: npix[i] as u32,
                levels,
                hrep,
                navg,
            })
        })
        .collect()
}

/// Decode a subgrid file, validating it against `mask`.
pub fn decode(bytes: &[u8], mask: &Mask) -> Result<SubgridTable> {
    if bytes.len() < HEADER_LEN {
        return Err(mismatch("header", HEADER_LEN, bytes.len(), 0));
    }
    let mut r = Reader { bytes, offset: 0 };
    let nr_cells = header_count(r.i32(), "nr_cells", mask.active_count(), 0)?;
    let version = r.i32();
    if version != FORMAT_VERSION {
        return Err(SubgridError::FormatMismatch {
            field: "version",
            expected: FORMAT_VERSION as i64,
            found: version as i64,
            offset: 4,
        });
    }
    let raw_nbins = r.i32();
    if raw_nbins < 2 {
        return Err(SubgridError::FormatMismatch {
            field: "nbins",
            expected: 2,
            found: raw_nbins as i64,
            offset: 8,
        });
    }
    let nbins = raw_nbins as usize;
    let nr_u = header_count(r.i32(), "nr_u_edges", mask.edge_count(EdgeOrientation::U), 12)?;
    let nr_v = header_count(r.i32(), "nr_v_edges", mask.edge_count(EdgeOrientation::V), 16)?;
    let raw_nsub = r.i32();
    if raw_nsub < 1 {
        return Err(SubgridError::FormatMismatch {
            field: "nr_subgrid_pixels",
            expected: 1,
            found: raw_nsub as i64,
            offset: 20,
        });
    }
    let meta = SubgridMeta {
        nbins,
        nr_subgrid_pixels: raw_nsub as usize,
        z_minimum: r.f32(),
        max_gradient: r.f32(),
    };

    let expected_len = encoded_len(nbins, nr_cells, nr_u, nr_v);
    if bytes.len() != expected_len {
        return Err(mismatch("file length", expected_len, bytes.len(), bytes.len().min(expected_len)));
    }

    let bins = nbins + 1;
    let zmin = r.field(nr_cells);
    let zmax = r.field(nr_cells);
    let zmean = r.field(nr_cells);
    let volmax = r.field(nr_cells);
    let levels = r.binned(nr_cells, bins);
    let volumes = r.binned(nr_cells, bins);
    let cells = levels
        .into_iter()
        .zip(volumes)
        .enumerate()
        .map(|(i, (levels, volumes))| {
            (!zmin[i].is_nan()).then(|| CellTable {
                zmin: zmin[i],
                zmax: zmax[i],
                zmean: zmean[i],
                volmax: volmax[i],
                levels,
                volumes,
            })
        })
        .collect();
    let u_edges = read_edges(&mut r, nr_u, bins);
    let v_edges = read_edges(&mut r, nr_v, bins);

    Ok(SubgridTable {
        meta,
        cells,
        u_edges,
        v_edges,
    })
}

/// Read a subgrid file written for `mask`.
pub fn load(path: &Path, mask: &Mask) -> Result<SubgridTable> {
    let bytes = fs::read(path)?;
    let table = decode(&bytes, mask)?;
    debug!(path = %path.display(), cells = table.cells.len(), nbins = table.meta.nbins, "read subgrid file");
    Ok(table)
}

// ── Index and mask files ─────────────────────────────────────────────────────

/// 1-based column-major indices of the active cells.
pub fn active_indices(mask: &Mask) -> Vec<u32> {
    mask.active_cells()
        .into_iter()
        .map(|(n, m)| mask.linear_index(n, m) as u32 + 1)
        .collect()
}

/// Write the index file: `u32` count followed by the active-cell indices.
pub fn write_index_file(mask: &Mask, path: &Path) -> Result<()> {
    let indices = active_indices(mask);
    let mut buf = Vec::with_capacity(4 * (indices.len() + 1));
    buf.extend_from_slice(&(indices.len() as u32).to_le_bytes());
    for i in &indices {
        buf.extend_from_slice(&i.to_le_bytes());
    }
    fs::write(path, buf)?;
    Ok(())
}

pub fn read_index_file(path: &Path) -> Result<Vec<u32>> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(mismatch("index count", 4, bytes.len(), 0));
    }
    let mut r = Reader { bytes: &bytes, offset: 0 };
    let count = r.i32() as u32 as usize;
    let expected = 4 * (count + 1);
    if bytes.len() != expected {
        return Err(mismatch("index file length", expected, bytes.len(), 4));
    }
    Ok((0..count).map(|_| r.i32() as u32).collect())
}

/// Write the mask file: one `u8` mask value per active cell, in index order.
pub fn write_mask_file(mask: &Mask, path: &Path) -> Result<()> {
    let values: Vec<u8> = mask
        .active_cells()
        .into_iter()
        .map(|(n, m)| mask.get(n, m) as u8)
        .collect();
    fs::write(path, values)?;
    Ok(())
}

/// Rebuild a full mask from the mask file and the matching index list.
pub fn read_mask_file(path: &Path, indices: &[u32], nmax: usize, mmax: usize) -> Result<Mask> {
    let values = fs::read(path)?;
    if values.len() != indices.len() {
        return Err(mismatch("mask file length", indices.len(), values.len(), 0));
    }
    let mut raw = vec![0u8; nmax * mmax];
    for (&index, &value) in indices.iter().zip(values.iter()) {
        let lin = (index as usize)
            .checked_sub(1)
            .filter(|&lin| lin < nmax * mmax)
            .ok_or_else(|| SubgridError::config(format!("cell index {index} outside {nmax}x{mmax} grid")))?;
        let (n, m) = (lin % nmax, lin / nmax);
        raw[n * mmax + m] = value;
    }
    Mask::from_values(nmax, mmax, &raw)
}
