//! Astrometric calibration of the partitioned files with SCAMP or astrometry.net.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::FilePolicy;
use crate::error::{Error, Result};
use crate::fits::{self, Header};
use crate::partition::{ImageTable, derived_path};
use crate::tools::Invocation;
use crate::votable;
use crate::wcs::pixel_scale;

/// Which calibration engine to run, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMethod {
    /// Use the image as it is.
    None,
    /// SCAMP on a SExtractor catalog of the image.
    #[default]
    Scamp,
    /// astrometry.net's `solve-field`.
    AstrometryNet,
}

impl FromStr for CalibrationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "none" => Ok(CalibrationMethod::None),
            "scamp" => Ok(CalibrationMethod::Scamp),
            "astrometrynet" | "astrometry.net" => Ok(CalibrationMethod::AstrometryNet),
            other => Err(Error::Config(format!("unknown calibration method `{other}`"))),
        }
    }
}

/// One run of an astrometric solver on a single file.
pub trait AstrometricSolver {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Solve `path` in place.
    ///
    /// Returns the achieved positional accuracy in arcseconds, or `None` for solvers that do
    /// not report one; those are run exactly once.
    fn solve(&self, path: &Path) -> Result<Option<f64>>;
}

/// Executables and configuration files for SCAMP and its SExtractor pre-pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScampConfig {
    /// SCAMP executable.
    pub program: String,
    /// SCAMP configuration file.
    pub config: PathBuf,
    /// SExtractor executable for the catalog SCAMP works on.
    pub sextractor_program: String,
    /// SExtractor configuration file.
    pub sextractor_config: PathBuf,
    /// SExtractor output parameter list.
    pub sextractor_parameters: PathBuf,
    /// `VERBOSE_TYPE` passed to both tools.
    pub verbose: String,
}

impl Default for ScampConfig {
    fn default() -> Self {
        Self {
            program: "scamp".to_string(),
            config: PathBuf::from("config/scamp.conf"),
            sextractor_program: "sex".to_string(),
            sextractor_config: PathBuf::from("config/prepscamp.sex"),
            sextractor_parameters: PathBuf::from("config/prepscamp.param"),
            verbose: "NORMAL".to_string(),
        }
    }
}

/// SCAMP, fed with a FITS_LDAC catalog from SExtractor. The resulting `.head` is merged into the image.
#[derive(Clone, Debug)]
pub struct Scamp {
    config: ScampConfig,
}

impl Scamp {
    /// SCAMP run with `config`.
    pub fn new(config: ScampConfig) -> Self {
        Self { config }
    }
}

impl AstrometricSolver for Scamp {
    fn name(&self) -> &str {
        "SCAMP"
    }

    fn solve(&self, path: &Path) -> Result<Option<f64>> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let catalog = derived_path(path, ".cat");
        let head = derived_path(path, ".head");
        let xml = derived_path(path, "_scamp.xml");

        Invocation::new("SExtractor", &self.config.sextractor_program)
            .arg(path)
            .path_option("c", &self.config.sextractor_config)
            .path_option("PARAMETERS_NAME", &self.config.sextractor_parameters)
            .option("CATALOG_TYPE", "FITS_LDAC")
            .path_option("CATALOG_NAME", &catalog)
            .option("VERBOSE_TYPE", &self.config.verbose)
            .run(path)?;

        Invocation::new("SCAMP", &self.config.program)
            .arg(&catalog)
            .path_option("c", &self.config.config)
            .path_option("XML_NAME", &xml)
            .option("VERBOSE_TYPE", &self.config.verbose)
            .in_dir(dir)
            .run(path)?;

        let head_text = fs::read_to_string(&head)
            .map_err(|e| Error::tool("SCAMP", path, format!("no header written to {}: {e}", head.display())))?;
        let solution = Header::from_lines(&head_text);
        fits::update_header(path, |h| h.merge(&solution))?;

        let report = fs::read_to_string(&xml)
            .map_err(|e| Error::tool("SCAMP", path, format!("no XML report written to {}: {e}", xml.display())))?;
        let sigma = votable::first_numbers(&report, "AstromSigma_Reference").ok_or_else(|| {
            Error::tool("SCAMP", path, "no AstromSigma_Reference in XML report")
        })?;
        Ok(sigma.into_iter().reduce(f64::max))
    }
}

/// Executable and options for astrometry.net's `solve-field`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstrometryNetConfig {
    /// `solve-field` executable.
    pub program: String,
    /// Relative tolerance around the header pixel scale given to the solver.
    pub scale_tolerance: f64,
}

impl Default for AstrometryNetConfig {
    fn default() -> Self {
        Self {
            program: "solve-field".to_string(),
            scale_tolerance: 0.3,
        }
    }
}

/// astrometry.net, constrained by the pixel scale and extent of the original image.
#[derive(Clone, Debug)]
pub struct AstrometryNet {
    config: AstrometryNetConfig,
    /// Pixel scale in degrees.
    pixel_scale: f64,
    /// Search radius in degrees.
    radius: f64,
    center: Option<(f64, f64)>,
}

impl AstrometryNet {
    /// Derive the solver constraints from the header of the original image.
    pub fn from_header(config: AstrometryNetConfig, header: &Header, path: &Path) -> Result<Self> {
        let pixel_scale = pixel_scale(header, path)?;
        let naxis = |k: &str| {
            header
                .get_f64(k)
                .ok_or_else(|| Error::missing_key(path, &[k]))
        };
        let radius = naxis("NAXIS1")?.max(naxis("NAXIS2")?) * pixel_scale;
        let center = header.get_f64("CRVAL1").zip(header.get_f64("CRVAL2"));
        Ok(Self {
            config,
            pixel_scale,
            radius,
            center,
        })
    }

    fn invocation(&self, path: &Path, solved: &Path) -> Invocation {
        let arcsec = self.pixel_scale * 3600.;
        let mut run = Invocation::new("astrometry.net", &self.config.program)
            .arg(path)
            .switch("overwrite")
            .switch("no-plots")
            .long("scale-units", "arcsecperpix")
            .long("scale-low", format!("{:.4}", (1. - self.config.scale_tolerance) * arcsec))
            .long("scale-high", format!("{:.4}", (1. + self.config.scale_tolerance) * arcsec))
            .long("radius", format!("{:.4}", self.radius))
            .long("new-fits", solved.display());
        if let Some((ra, dec)) = self.center {
            run = run.long("ra", ra).long("dec", dec);
        }
        if let Some(dir) = path.parent() {
            run = run.long("dir", dir.display());
        }
        run
    }
}

impl AstrometricSolver for AstrometryNet {
    fn name(&self) -> &str {
        "astrometry.net"
    }

    fn solve(&self, path: &Path) -> Result<Option<f64>> {
        let solved = derived_path(path, ".new");
        self.invocation(path, &solved).run(path)?;
        if !solved.exists() {
            return Err(Error::tool("astrometry.net", path, "field could not be solved"));
        }
        fs::rename(&solved, path)?;
        Ok(None)
    }
}

/// Result of calibrating one file.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationReport {
    /// The calibrated file.
    pub path: PathBuf,
    /// Number of solver runs.
    pub runs: usize,
    /// Last accuracy reported by the solver, in arcseconds.
    pub accuracy: Option<f64>,
    /// Whether the requested accuracy was reached. Solvers without a report count as converged.
    pub converged: bool,
    /// Failure that was skipped under [`FilePolicy::Skip`].
    pub error: Option<String>,
}

/// Runs a solver over every file of an [`ImageTable`].
pub struct Calibrator<'a> {
    solver: &'a dyn AstrometricSolver,
    /// Target accuracy in arcseconds.
    accuracy: f64,
    max_iterations: usize,
    policy: FilePolicy,
}

impl<'a> Calibrator<'a> {
    /// A calibrator aiming at 0.65 arcsec in at most 3 runs per file.
    pub fn new(solver: &'a dyn AstrometricSolver) -> Self {
        Self {
            solver,
            accuracy: 0.65,
            max_iterations: 3,
            policy: FilePolicy::default(),
        }
    }

    /// Set the target accuracy in arcseconds.
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Set the maximum number of solver runs per file.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set what happens to a file the solver fails on.
    pub fn with_policy(mut self, policy: FilePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Calibrate all files. Files outside the output directory are copied into it first,
    /// so the original image is never modified.
    ///
    /// Missing the target accuracy is not an error. Solver failures follow the file policy:
    /// skipped files are dropped from the table and only show up in their report.
    pub fn calibrate(&self, mut table: ImageTable) -> Result<(ImageTable, Vec<CalibrationReport>)> {
        info!(
            "Performing astrometric calibration on {} using {}.",
            table.field.path.display(),
            self.solver.name()
        );
        info!("Required astrometric precision: {:.3} arcsec.", self.accuracy);

        let mut reports = Vec::with_capacity(table.len());
        let mut calibrated = Vec::with_capacity(table.len());
        for mut entry in table.entries.drain(..) {
            let target = match entry.path.file_name() {
                Some(name) => table.output_dir.join(name),
                None => entry.path.clone(),
            };
            if target != entry.path {
                fs::copy(&entry.path, &target)?;
                entry.path = target;
            }

            let report = self.calibrate_file(&entry.path);
            match report {
                Ok(report) => {
                    reports.push(report);
                    calibrated.push(entry);
                }
                Err(e) => {
                    if self.policy == FilePolicy::Abort || !e.is_per_file() {
                        return Err(e);
                    }
                    error!("Calibration of {} failed, skipping it: {e}", entry.path.display());
                    reports.push(CalibrationReport {
                        path: entry.path.clone(),
                        runs: 0,
                        accuracy: None,
                        converged: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        table.entries = calibrated;
        Ok((table, reports))
    }

    fn calibrate_file(&self, path: &Path) -> Result<CalibrationReport> {
        let mut report = CalibrationReport {
            path: path.to_path_buf(),
            runs: 0,
            accuracy: None,
            converged: false,
            error: None,
        };

        while report.runs < self.max_iterations {
            report.runs += 1;
            report.accuracy = self.solver.solve(path)?;
            match report.accuracy {
                None => {
                    report.converged = true;
                    break;
                }
                Some(accuracy) => {
                    info!(
                        "Astrometric precision after run {}: {:.2} arcseconds",
                        report.runs, accuracy
                    );
                    if accuracy < self.accuracy {
                        report.converged = true;
                        break;
                    }
                }
            }
        }

        if !report.converged {
            warn!(
                "{}: precision of {:.2} arcseconds not reached after {} runs, continuing.",
                path.display(),
                self.accuracy,
                report.runs
            );
        }
        Ok(report)
    }
}
