//! Seeing (FWHM) estimation with PSFEx.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partition::derived_path;
use crate::tools::Invocation;
use crate::votable;

/// Where the FWHM given to the detector comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FwhmValue", into = "FwhmValue")]
pub enum FwhmSource {
    /// Estimated per file with PSFEx.
    #[default]
    Psfex,
    /// The same value in pixels for every file.
    Fixed(f64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FwhmValue {
    Pixels(f64),
    Name(String),
}

impl TryFrom<FwhmValue> for FwhmSource {
    type Error = Error;

    fn try_from(value: FwhmValue) -> Result<Self> {
        match value {
            FwhmValue::Pixels(fwhm) => Ok(FwhmSource::Fixed(fwhm)),
            FwhmValue::Name(name) => name.parse(),
        }
    }
}

impl From<FwhmSource> for FwhmValue {
    fn from(source: FwhmSource) -> Self {
        match source {
            FwhmSource::Psfex => FwhmValue::Name("psfex".to_string()),
            FwhmSource::Fixed(fwhm) => FwhmValue::Pixels(fwhm),
        }
    }
}

impl FromStr for FwhmSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("psfex") {
            return Ok(FwhmSource::Psfex);
        }
        s.parse()
            .map(FwhmSource::Fixed)
            .map_err(|_| Error::Config(format!("FWHM must be `psfex` or a number of pixels, got `{s}`")))
    }
}

impl fmt::Display for FwhmSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwhmSource::Psfex => write!(f, "psfex"),
            FwhmSource::Fixed(fwhm) => write!(f, "{fwhm}"),
        }
    }
}

/// PSF width statistics over the sources of one image, in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FwhmStats {
    /// Smallest FWHM.
    pub min: f64,
    /// Average FWHM, passed on to the detector.
    pub mean: f64,
    /// Largest FWHM.
    pub max: f64,
}

/// Seeing estimation for one image.
pub trait FwhmEstimator: Sync {
    /// FWHM statistics of the image at `path`.
    fn estimate(&self, path: &Path) -> Result<FwhmStats>;
}

/// A fixed FWHM, reported as min = mean = max.
impl FwhmEstimator for f64 {
    fn estimate(&self, _path: &Path) -> Result<FwhmStats> {
        Ok(FwhmStats {
            min: *self,
            mean: *self,
            max: *self,
        })
    }
}

/// PSFEx and its SExtractor preparation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsfexConfig {
    /// PSFEx executable.
    pub program: String,
    /// PSFEx configuration file.
    pub config: PathBuf,
    /// SExtractor executable for the preparation pass.
    pub sextractor_program: String,
    /// SExtractor configuration file.
    pub sextractor_config: PathBuf,
    /// SExtractor output parameter list.
    pub sextractor_parameters: PathBuf,
}

impl Default for PsfexConfig {
    fn default() -> Self {
        Self {
            program: "psfex".to_string(),
            config: PathBuf::from("config/psfex.conf"),
            sextractor_program: "sex".to_string(),
            sextractor_config: PathBuf::from("config/preppsfex.sex"),
            sextractor_parameters: PathBuf::from("config/preppsfex.param"),
        }
    }
}

/// SExtractor in PSFEx preparation mode followed by PSFEx.
#[derive(Clone, Debug)]
pub struct Psfex {
    config: PsfexConfig,
}

impl Psfex {
    /// PSFEx run with `config`.
    pub fn new(config: PsfexConfig) -> Self {
        Self { config }
    }
}

impl FwhmEstimator for Psfex {
    fn estimate(&self, path: &Path) -> Result<FwhmStats> {
        info!("Running PSFEx to estimate FWHM in {}.", path.display());
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let catalog = derived_path(path, "_preppsfex.cat");
        let xml = derived_path(path, "_psfex.xml");

        Invocation::new("SExtractor", &self.config.sextractor_program)
            .arg(path)
            .path_option("c", &self.config.sextractor_config)
            .path_option("PARAMETERS_NAME", &self.config.sextractor_parameters)
            .option("CATALOG_TYPE", "FITS_LDAC")
            .path_option("CATALOG_NAME", &catalog)
            .run(path)?;

        Invocation::new("PSFEx", &self.config.program)
            .arg(&catalog)
            .path_option("c", &self.config.config)
            .path_option("XML_NAME", &xml)
            .in_dir(dir)
            .run(path)?;

        // PSFEx names the snapshot after the catalog and writes it to its working directory.
        if let Some(name) = catalog.file_stem() {
            let snapshot = dir.join(format!("snap_{}.fits", name.to_string_lossy()));
            if snapshot.exists() {
                fs::rename(&snapshot, derived_path(path, "_psf.fits"))?;
            }
        }
        let _ = fs::remove_file(&catalog);

        let report = fs::read_to_string(&xml)
            .map_err(|e| Error::tool("PSFEx", path, format!("no XML report: {e}")))?;
        let stats = parse_fwhm(&report).ok_or_else(|| Error::tool("PSFEx", path, "no FWHM in XML report"))?;

        info!("FWHM min: {:.2} pixels", stats.min);
        info!("FWHM mean: {:.2} pixels", stats.mean);
        info!("FWHM max: {:.2} pixels", stats.max);
        Ok(stats)
    }
}

/// FWHM statistics from a PSFEx XML report.
pub fn parse_fwhm(report: &str) -> Option<FwhmStats> {
    let value = |name| votable::first_numbers(report, name).and_then(|v| v.first().copied());
    Some(FwhmStats {
        min: value("FWHM_Min")?,
        mean: value("FWHM_Mean")?,
        max: value("FWHM_Max")?,
    })
}

/// Build the estimator selected by `source`.
pub fn estimator(source: FwhmSource, config: &PsfexConfig) -> Box<dyn FwhmEstimator> {
    match source {
        FwhmSource::Psfex => Box::new(Psfex::new(config.clone())),
        FwhmSource::Fixed(fwhm) => Box::new(fwhm),
    }
}
