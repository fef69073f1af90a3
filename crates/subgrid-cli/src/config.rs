//! JSON project file for the `subgrid` driver.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use subgrid_core::{
    io, BuildParams, ComputationalGrid, Mask, MergeMethod, Offset, Raster, RasterSource, Resampling, ValidArea,
};
use tracing::debug;

fn default_sbgfile() -> PathBuf {
    PathBuf::from("sfincs.sbg")
}

/// Vertical offset of a source: a constant or a raster file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OffsetEntry {
    Constant(f32),
    Raster(PathBuf),
}

/// One entry of `datasets_dep` / `datasets_rgh`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceEntry {
    /// Raster JSON document.
    pub path: PathBuf,
    #[serde(default)]
    pub zmin: Option<f32>,
    #[serde(default)]
    pub zmax: Option<f32>,
    #[serde(default)]
    pub merge_method: MergeMethod,
    #[serde(default)]
    pub resampling: Resampling,
    #[serde(default)]
    pub offset: Option<OffsetEntry>,
    #[serde(default)]
    pub valid_area: Option<ValidArea>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub grid: ComputationalGrid,
    /// Mask JSON document; without it the index/mask file pair is tried,
    /// then an all-active mask.
    #[serde(default)]
    pub mask: Option<PathBuf>,
    #[serde(default = "default_sbgfile")]
    pub sbgfile: PathBuf,
    #[serde(default)]
    pub indfile: Option<PathBuf>,
    #[serde(default)]
    pub mskfile: Option<PathBuf>,
    #[serde(default)]
    pub datasets_dep: Vec<SourceEntry>,
    #[serde(default)]
    pub datasets_rgh: Vec<SourceEntry>,
    #[serde(default)]
    pub subgrid: BuildParams,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
        let mut config: ProjectConfig =
            serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.grid.validate()?;
        Ok(config)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn sbg_path(&self) -> PathBuf {
        self.resolve(&self.sbgfile)
    }

    pub fn load_mask(&self) -> Result<Mask> {
        if let Some(path) = &self.mask {
            let path = self.resolve(path);
            let text = fs::read_to_string(&path).with_context(|| format!("Cannot read mask {}", path.display()))?;
            let mask: Mask =
                serde_json::from_str(&text).with_context(|| format!("Invalid mask {}", path.display()))?;
            mask.check_shape(&self.grid)?;
            return Ok(mask);
        }
        if let (Some(ind), Some(msk)) = (&self.indfile, &self.mskfile) {
            let (ind, msk) = (self.resolve(ind), self.resolve(msk));
            if ind.exists() && msk.exists() {
                debug!(indfile = %ind.display(), mskfile = %msk.display(), "reading mask from index files");
                let indices = io::read_index_file(&ind)?;
                return Ok(io::read_mask_file(&msk, &indices, self.grid.nmax, self.grid.mmax)?);
            }
        }
        Ok(Mask::all_active(&self.grid))
    }

    pub fn dep_sources(&self) -> Result<Vec<RasterSource>> {
        self.sources(&self.datasets_dep)
    }

    pub fn rgh_sources(&self) -> Result<Vec<RasterSource>> {
        self.sources(&self.datasets_rgh)
    }

    fn sources(&self, entries: &[SourceEntry]) -> Result<Vec<RasterSource>> {
        entries
            .iter()
            .map(|entry| {
                let path = self.resolve(&entry.path);
                let mut source = RasterSource::new(path.display().to_string(), read_raster(&path)?)
                    .with_range(entry.zmin, entry.zmax)
                    .with_merge_method(entry.merge_method)
                    .with_resampling(entry.resampling);
                match &entry.offset {
                    Some(OffsetEntry::Constant(v)) => source = source.with_offset(Offset::Constant(*v)),
                    Some(OffsetEntry::Raster(p)) => {
                        source = source.with_offset(Offset::Gridded(read_raster(&self.resolve(p))?))
                    }
                    None => {}
                }
                if let Some(area) = &entry.valid_area {
                    source = source.with_valid_area(area.clone());
                }
                Ok(source)
            })
            .collect()
    }
}

pub fn read_raster(path: &Path) -> Result<Raster> {
    let text = fs::read_to_string(path).with_context(|| format!("Cannot read raster {}", path.display()))?;
    let raster: Raster =
        serde_json::from_str(&text).with_context(|| format!("Invalid raster {}", path.display()))?;
    anyhow::ensure!(
        raster.data.len() == raster.grid.len(),
        "raster {} has {} values for a {}x{} grid",
        path.display(),
        raster.data.len(),
        raster.grid.rows,
        raster.grid.cols
    );
    Ok(raster)
}
