use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{LevelFilter, error, info};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use otdetect::{CalibrationMethod, FilePolicy, FwhmSource, Grid, Pipeline, PipelineConfig, Result};

/// Find unknown point sources in astronomical images.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image to process, or a directory whose FITS images are all processed
    path: PathBuf,

    /// TOML configuration file; command line options take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving all products
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Typical FWHM in pixels, or `psfex` to estimate it per file
    #[arg(long)]
    fwhm: Option<FwhmSource>,

    /// Detection threshold in units of the background noise
    #[arg(long)]
    threshold: Option<f64>,

    /// Crossmatch radius in pixels
    #[arg(long)]
    radius_crossmatch: Option<f64>,

    /// Partition grid, `N` for NxN or `RxC`
    #[arg(long, value_parser = parse_grid)]
    quadrants: Option<Grid>,

    /// Astrometric calibration: scamp, astrometrynet or none
    #[arg(long)]
    calibration: Option<CalibrationMethod>,

    /// Required astrometric accuracy in arcseconds
    #[arg(long)]
    accuracy: Option<f64>,

    /// Discard detections with a larger magnitude error
    #[arg(long)]
    mag_err_cut: Option<f64>,

    /// What to do with a file failing a stage: skip or abort
    #[arg(long)]
    on_file_error: Option<FilePolicy>,

    /// Do not remove known solar system objects
    #[arg(long)]
    no_moving_objects: bool,

    /// Do not calibrate magnitudes
    #[arg(long)]
    no_photometry: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Debug output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_grid(value: &str) -> std::result::Result<Grid, String> {
    let parse = |v: &str| v.trim().parse::<usize>().map_err(|e| format!("`{v}`: {e}"));
    let grid = match value.split_once(['x', 'X', ',']) {
        Some((rows, cols)) => Grid::new(parse(rows)?, parse(cols)?),
        None => Grid::square(parse(value)?),
    };
    grid.map_err(|e| e.to_string())
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(fwhm) = self.fwhm {
            config.fwhm = fwhm;
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(radius) = self.radius_crossmatch {
            config.radius_pixels = radius;
        }
        if let Some(grid) = self.quadrants {
            config.grid = grid;
        }
        if let Some(calibration) = self.calibration {
            config.calibration = calibration;
        }
        if let Some(accuracy) = self.accuracy {
            config.accuracy_arcsec = accuracy;
        }
        if let Some(cut) = self.mag_err_cut {
            config.mag_err_cut = cut;
        }
        if let Some(policy) = self.on_file_error {
            config.on_file_error = policy;
        }
        config.moving_objects.enabled &= !self.no_moving_objects;
        config.photometry.enabled &= !self.no_photometry;

        config.validate()?;
        Ok(config)
    }
}

/// The images named by `path`: the file itself, or the `*.fit*` files of a directory in name order.
fn images(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut images = std::fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .is_some_and(|n| n.to_string_lossy().to_ascii_lowercase().contains(".fit"))
        })
        .collect::<Vec<_>>();
    images.sort();
    Ok(images)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    let log_config = ConfigBuilder::new().set_target_level(LevelFilter::Off).build();
    if let Err(e) = TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto) {
        eprintln!("could not set up logging: {e}");
    }

    let config = match args.pipeline_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if args.print_config {
        return match config.to_toml() {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    let images = match images(&args.path) {
        Ok(images) if !images.is_empty() => images,
        Ok(_) => {
            error!("No FITS image found in {}.", args.path.display());
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = match Pipeline::load(config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut failed = 0;
    for image in &images {
        match pipeline.run_field(image) {
            Ok(report) => {
                info!(
                    "{}: {} candidates out of {} detections written to {}.",
                    report.field.name,
                    report.candidates,
                    report.detections,
                    report.candidate_file.display()
                );
                for (path, reason) in &report.skipped {
                    info!("Skipped {}: {reason}", path.display());
                }
            }
            Err(e) => {
                error!("{}: {e}", image.display());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        error!("{failed} of {} images failed.", images.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
