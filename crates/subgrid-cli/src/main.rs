//! `subgrid`: build, inspect and export subgrid tables from a JSON project file.

mod config;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use subgrid_core::{io, to_dataset, Mask, Raster, SourceMerger, SubgridBuilder, SubgridTable};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::ProjectConfig;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "subgrid", version, about = "Subgrid tables for regular-grid flood models")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the subgrid file from the project's elevation and roughness datasets
    Build {
        /// Project JSON file
        #[arg(short, long)]
        config: PathBuf,
        /// Also write the labelled dataset as JSON
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
    /// Print a summary of an existing subgrid file
    Inspect {
        #[arg(short, long)]
        config: PathBuf,
        /// Subgrid file (defaults to the project's sbgfile)
        #[arg(long)]
        sbg: Option<PathBuf>,
    },
    /// Export an existing subgrid file as labelled full-grid arrays
    Export {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Build { config, dataset } => build(&config, dataset.as_deref()),
        Command::Inspect { config, sbg } => inspect(&config, sbg.as_deref()),
        Command::Export { config, output } => export(&config, &output),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn build(config_path: &Path, dataset: Option<&Path>) -> Result<()> {
    let config = ProjectConfig::load(config_path)?;
    if config.datasets_dep.is_empty() {
        bail!("{} lists no datasets_dep", config_path.display());
    }
    let mask = config.load_mask()?;
    let dep = config.dep_sources()?;
    let rgh = config.rgh_sources()?;
    info!(
        dep = dep.len(),
        rgh = rgh.len(),
        active = mask.active_count(),
        "loaded project {}",
        config_path.display()
    );

    let start = Instant::now();
    let output = SubgridBuilder::new(&config.grid, &mask, config.subgrid.clone())?
        .build(&dep, &rgh, &SourceMerger)
        .context("subgrid build failed")?;
    info!(elapsed = ?start.elapsed(), "built subgrid tables");
    if !output.report.warnings.is_empty() {
        let gaps = output.report.data_gaps().count();
        warn!(
            warnings = output.report.warnings.len(),
            data_gaps = gaps,
            "build finished with warnings"
        );
    }

    let sbg = config.sbg_path();
    io::save(&output.table, &sbg, &mask).with_context(|| format!("Cannot write {}", sbg.display()))?;
    if let Some(ind) = &config.indfile {
        io::write_index_file(&mask, &config.resolve(ind))?;
    }
    if let Some(msk) = &config.mskfile {
        io::write_mask_file(&mask, &config.resolve(msk))?;
    }

    if let Some(highres) = &output.highres {
        let dir = config.root.join("tiles").join("subgrid");
        fs::create_dir_all(&dir)?;
        write_raster(&dir.join("dep_subgrid.json"), &highres.dep)?;
        write_raster(&dir.join("manning_subgrid.json"), &highres.rgh)?;
        info!(dir = %dir.display(), "wrote high-resolution rasters");
    }

    if let Some(path) = dataset {
        write_dataset(&output.table, &mask, &config, path)?;
    }
    let report = serde_json::to_string_pretty(&output.report)?;
    println!("{report}");
    Ok(())
}

fn load_table(config: &ProjectConfig, sbg: Option<&Path>) -> Result<(Mask, SubgridTable)> {
    let mask = config.load_mask()?;
    let path = sbg.map_or_else(|| config.sbg_path(), |p| p.to_path_buf());
    let table = io::load(&path, &mask).with_context(|| format!("Cannot load {}", path.display()))?;
    Ok((mask, table))
}

fn inspect(config_path: &Path, sbg: Option<&Path>) -> Result<()> {
    let config = ProjectConfig::load(config_path)?;
    let (_, table) = load_table(&config, sbg)?;
    let meta = &table.meta;

    let valid = table.valid_cells().count();
    let (zlo, zhi) = table
        .cells
        .iter()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), c| (lo.min(c.zmin), hi.max(c.zmax)));
    println!("nbins              {}", meta.nbins);
    println!("nr_subgrid_pixels  {}", meta.nr_subgrid_pixels);
    println!("z_minimum          {}", meta.z_minimum);
    println!("max_gradient       {}", meta.max_gradient);
    println!("cells              {} ({} valid)", table.cells.len(), valid);
    println!("u edges            {}", table.u_edges.len());
    println!("v edges            {}", table.v_edges.len());
    if valid > 0 {
        println!("elevation range    {zlo:.3} .. {zhi:.3}");
        println!("total volmax       {:.1} m³", table.total_volmax());
    }
    Ok(())
}

fn export(config_path: &Path, output: &Path) -> Result<()> {
    let config = ProjectConfig::load(config_path)?;
    let (mask, table) = load_table(&config, None)?;
    write_dataset(&table, &mask, &config, output)
}

// ── Output helpers ────────────────────────────────────────────────────────────

fn write_dataset(table: &SubgridTable, mask: &Mask, config: &ProjectConfig, path: &Path) -> Result<()> {
    let ds = to_dataset(table, mask, &config.grid, ("y", "x"))?;
    let json = serde_json::to_string(&ds)?;
    fs::write(path, json).with_context(|| format!("Cannot write {}", path.display()))?;
    info!(path = %path.display(), vars = ds.data_vars.len(), "wrote dataset");
    Ok(())
}

fn write_raster(path: &Path, raster: &Raster) -> Result<()> {
    let json = serde_json::to_string(raster)?;
    fs::write(path, json).with_context(|| format!("Cannot write {}", path.display()))
}
