//! Pipeline configuration, read from TOML and overridden from the command line.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::error;
use serde::{Deserialize, Serialize};

use crate::calibration::{AstrometryNetConfig, CalibrationMethod, ScampConfig};
use crate::crossmatch::ReferenceCatalog;
use crate::detection::SextractorConfig;
use crate::error::{Error, Result};
use crate::partition::Grid;
use crate::psf::{FwhmSource, PsfexConfig};

/// What to do when a single file fails in a per-file stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilePolicy {
    /// Drop the file's contribution and carry on with the rest of the field.
    #[default]
    Skip,
    /// Fail the whole field.
    Abort,
}

impl FilePolicy {
    /// Route a per-file result through the policy.
    ///
    /// `Ok(None)` means the file failed and was skipped. Errors that are not tied to a single
    /// file are always returned.
    pub fn apply<T>(self, result: Result<T>, stage: &str, path: &Path) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if self == FilePolicy::Skip && e.is_per_file() => {
                error!("{stage} failed for {}, skipping it: {e}", path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl FromStr for FilePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(FilePolicy::Skip),
            "abort" => Ok(FilePolicy::Abort),
            other => Err(Error::Config(format!("unknown file error policy `{other}`"))),
        }
    }
}

/// External executables and their configuration files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Source detection.
    pub sextractor: SextractorConfig,
    /// Astrometric calibration with SCAMP.
    pub scamp: ScampConfig,
    /// FWHM estimation.
    pub psfex: PsfexConfig,
    /// Astrometric calibration with astrometry.net.
    pub astrometry_net: AstrometryNetConfig,
}

/// Remote services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// CDS XMatch endpoint.
    pub xmatch_url: String,
    /// SkyBoT cone search endpoint.
    pub skybot_url: String,
    /// Timeout of a whole request, in seconds.
    pub timeout_secs: u64,
    /// IAU observatory code sent to SkyBoT.
    pub observer: String,
    /// Local CSV files standing in for XMatch, keyed by catalog identifier.
    ///
    /// When non-empty, every crossmatch is answered from these files.
    pub catalog_files: BTreeMap<String, PathBuf>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            xmatch_url: "http://cdsxmatch.u-strasbg.fr/xmatch/api/v1/sync".to_string(),
            skybot_url: "http://vo.imcce.fr/webservices/skybot/skybotconesearch_query.php".to_string(),
            timeout_secs: 300,
            observer: "500".to_string(),
            catalog_files: BTreeMap::new(),
        }
    }
}

impl ServicesConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Removal of known solar system objects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovingObjectsConfig {
    /// Query SkyBoT and drop coincident candidates.
    pub enabled: bool,
    /// Cone search radius around the field centre, in degrees.
    pub search_radius_deg: f64,
    /// Candidates closer than this to a known object are removed, in arcseconds.
    pub match_radius_arcsec: f64,
}

impl Default for MovingObjectsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_radius_deg: 2.0,
            match_radius_arcsec: 10.0,
        }
    }
}

/// Photometric calibration of the candidates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    /// Compute a zero point and write calibrated magnitudes.
    pub enabled: bool,
    /// Catalog providing the reference magnitudes.
    pub catalog: ReferenceCatalog,
    /// Column of the reference catalog holding the calibration magnitude.
    pub magnitude_column: String,
    /// Clipping threshold in standard deviations.
    pub sigma_clip: f64,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            catalog: ReferenceCatalog::Ps1Dr1,
            magnitude_column: "rmag".to_string(),
            sigma_clip: 3.0,
        }
    }
}

/// Settings for processing one or more fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Partition grid.
    pub grid: Grid,
    /// Directory receiving all products.
    pub output_dir: PathBuf,
    /// Astrometric calibration engine.
    pub calibration: CalibrationMethod,
    /// Target astrometric accuracy in arcseconds.
    pub accuracy_arcsec: f64,
    /// Maximum number of calibration runs per file.
    pub max_iterations: usize,
    /// Fixed FWHM or per-file estimation.
    pub fwhm: FwhmSource,
    /// Detection threshold in units of the background noise.
    pub threshold: f64,
    /// Detections with a larger magnitude error are discarded.
    pub mag_err_cut: f64,
    /// Crossmatch tolerance in pixels.
    pub radius_pixels: f64,
    /// Catalogs applied in order by the candidate reducer.
    pub catalogs: Vec<ReferenceCatalog>,
    /// Handling of files failing a per-file stage.
    pub on_file_error: FilePolicy,
    /// External programs.
    pub tools: ToolsConfig,
    /// Remote services.
    pub services: ServicesConfig,
    /// Known solar system objects.
    pub moving_objects: MovingObjectsConfig,
    /// Photometric calibration.
    pub photometry: PhotometryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            grid: Grid::default(),
            output_dir: PathBuf::from("gmadet_results"),
            calibration: CalibrationMethod::default(),
            accuracy_arcsec: 0.65,
            max_iterations: 3,
            fwhm: FwhmSource::default(),
            threshold: 4.0,
            mag_err_cut: 0.5,
            radius_pixels: 3.0,
            catalogs: ReferenceCatalog::DEFAULT_SEQUENCE.to_vec(),
            on_file_error: FilePolicy::default(),
            tools: ToolsConfig::default(),
            services: ServicesConfig::default(),
            moving_objects: MovingObjectsConfig::default(),
            photometry: PhotometryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML configuration. Missing keys take their default.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the TOML configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| match e {
            Error::Config(reason) => Error::Config(format!("{}: {reason}", path.display())),
            e => e,
        })
    }

    /// Render as TOML, as read by [`from_toml`](PipelineConfig::from_toml).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the values that cannot be expressed by the types.
    pub fn validate(&self) -> Result<()> {
        Grid::new(self.grid.rows, self.grid.cols)?;
        if !(self.radius_pixels > 0.) {
            return Err(Error::Config(format!(
                "crossmatch radius must be positive, got {}",
                self.radius_pixels
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".to_string()));
        }
        if let FwhmSource::Fixed(fwhm) = self.fwhm {
            if !(fwhm > 0.) {
                return Err(Error::Config(format!("FWHM must be positive, got {fwhm}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert!(config.grid.is_whole());
        assert_eq!(config.output_dir, Path::new("gmadet_results"));
        assert_eq!(config.calibration, CalibrationMethod::Scamp);
        assert_eq!(config.fwhm, FwhmSource::Psfex);
        assert_eq!(config.catalogs.len(), 4);
        assert_eq!(config.catalogs[0], ReferenceCatalog::GaiaDr2);
        assert_eq!(config.services.timeout(), Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml() {
        let config = PipelineConfig::from_toml(
            r#"
            calibration = "astrometrynet"
            fwhm = 3.5
            radius_pixels = 2.0
            catalogs = ["I/345/gaia2", "J/A+A/600/A1/table"]
            on_file_error = "abort"

            [grid]
            rows = 2
            cols = 2

            [moving_objects]
            enabled = false

            [services]
            observer = "809"

            [services.catalog_files]
            "I/345/gaia2" = "catalogs/gaia.csv"
            "#,
        )
        .unwrap();

        assert_eq!(config.grid, Grid::square(2).unwrap());
        assert_eq!(config.calibration, CalibrationMethod::AstrometryNet);
        assert_eq!(config.fwhm, FwhmSource::Fixed(3.5));
        assert_eq!(
            config.catalogs,
            vec![
                ReferenceCatalog::GaiaDr2,
                ReferenceCatalog::Custom("J/A+A/600/A1/table".to_string())
            ]
        );
        assert_eq!(config.on_file_error, FilePolicy::Abort);
        assert!(!config.moving_objects.enabled);
        assert_eq!(config.moving_objects.search_radius_deg, 2.0);
        assert_eq!(config.threshold, 4.0);
        assert_eq!(config.services.observer, "809");
        assert_eq!(
            config.services.catalog_files["I/345/gaia2"],
            Path::new("catalogs/gaia.csv")
        );
        assert_eq!(config.services.timeout_secs, 300);
    }

    #[test]
    fn toml_round_trip() {
        let config = PipelineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(PipelineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn invalid_values() {
        assert!(PipelineConfig::from_toml("radius_pixels = 0.0").is_err());
        assert!(PipelineConfig::from_toml("[grid]\nrows = 0\ncols = 2").is_err());
        assert!(PipelineConfig::from_toml("calibration = \"iraf\"").is_err());
    }

    #[test]
    fn policy_skips_only_per_file_errors() {
        let path = Path::new("a.fits");
        let skipped = FilePolicy::Skip.apply::<()>(Err(Error::tool("sex", path, "crash")), "Detection", path);
        assert!(matches!(skipped, Ok(None)));

        let fatal = FilePolicy::Skip.apply::<()>(
            Err(Error::CatalogQuery {
                catalog: "GAIA DR2".to_string(),
                reason: "timeout".to_string(),
            }),
            "Reduction",
            path,
        );
        assert!(fatal.is_err());

        let aborted =
            FilePolicy::Abort.apply::<()>(Err(Error::MissingCalibration { path: path.into() }), "Projection", path);
        assert!(aborted.is_err());
        assert_eq!(FilePolicy::Skip.apply(Ok(3), "Detection", path).unwrap(), Some(3));
    }
}
