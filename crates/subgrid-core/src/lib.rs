//! Subgrid volume and conveyance tables for regular-grid flood models.
//!
//! High-resolution elevation and roughness rasters are merged block by block
//! onto a fine pixel lattice, and every active computational cell and face
//! is compressed into a small table of level bins:
//!
//! - cells: stored volume against water level;
//! - faces: representative depth and effective Manning roughness against
//!   water level.
//!
//! ```no_run
//! use subgrid_core::{BuildParams, ComputationalGrid, Mask, RasterSource, SourceMerger, SubgridBuilder};
//! # fn run(dep: RasterSource) -> subgrid_core::Result<()> {
//! let grid = ComputationalGrid::new(0.0, 0.0, 50.0, 50.0, 40, 30)?;
//! let mask = Mask::all_active(&grid);
//! let builder = SubgridBuilder::new(&grid, &mask, BuildParams::default())?;
//! let output = builder.build(&[dep], &[], &SourceMerger)?;
//! subgrid_core::io::save(&output.table, "sfincs.sbg".as_ref(), &mask)?;
//! # Ok(())
//! # }
//! ```

pub mod binner;
pub mod block;
pub mod builder;
pub mod conditioning;
pub mod dataset;
pub mod error;
pub mod grid;
pub mod io;
pub mod merge;
pub mod raster;
pub mod table;

pub use builder::{
    BuildOutput, BuildParams, BuildReport, BuildWarning, DegenerateKind, HighresRasters, SubgridBuilder,
};
pub use dataset::{to_dataset, DataArray, SubgridDataset};
pub use error::SubgridError;
pub use grid::{ComputationalGrid, Edge, EdgeOrientation, Mask, MaskState, PixelGrid};
pub use merge::{MergeMethod, Offset, RasterMerge, RasterSource, Resampling, SourceMerger, ValidArea};
pub use raster::Raster;
pub use table::{CellTable, EdgeTable, SubgridMeta, SubgridTable};

pub type Result<T> = std::result::Result<T, SubgridError>;
