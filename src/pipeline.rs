//! Processing of one field from the raw image to the list of transient candidates.

use std::path::{Path, PathBuf};

use log::{info, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::calibration::{AstrometricSolver, AstrometryNet, CalibrationMethod, CalibrationReport, Calibrator, Scamp};
use crate::config::PipelineConfig;
use crate::crossmatch::{CatalogService, LocalCatalogs, XMatchClient};
use crate::detection::{SourceDetector, Sextractor, apply_mag_err_cut};
use crate::error::Result;
use crate::fits;
use crate::moving::{EphemerisService, Observation, SkybotClient, filter_moving_objects, write_moving_objects};
use crate::partition::{Field, ImageEntry, ImageTable, QuadrantGeometry, partition};
use crate::photometry::{PhotometricCalibrator, ZeroPoint, calibrate_candidates, write_calibrated};
use crate::projection::{project_file, write_sky_catalog};
use crate::psf::{FwhmEstimator, estimator};
use crate::reducer::{CandidateReducer, CandidateSet, FileCatalog, FiltrationStep, assemble, persist};

/// Summary of the processing of one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldReport {
    /// The processed field.
    pub field: Field,
    /// Number of files the field was cut into.
    pub files: usize,
    /// One report per calibrated file, empty without calibration.
    pub calibration: Vec<CalibrationReport>,
    /// Files dropped under the skip policy, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Detections over all processed files, after the magnitude error cut.
    pub detections: usize,
    /// Candidates left after each reference catalog.
    pub steps: Vec<FiltrationStep>,
    /// Candidates coincident with a known solar system object.
    pub moving_objects_removed: usize,
    /// Candidates written to `candidate_file`.
    pub candidates: usize,
    /// Photometric zero point, when enabled and enough reference stars matched.
    pub zero_point: Option<ZeroPoint>,
    /// The `.oc` table.
    pub candidate_file: PathBuf,
}

/// The transient detection pipeline with its external collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    solver: Option<Box<dyn AstrometricSolver>>,
    fwhm: Box<dyn FwhmEstimator>,
    detector: Box<dyn SourceDetector>,
    catalogs: Box<dyn CatalogService>,
    ephemerides: Box<dyn EphemerisService>,
}

impl Pipeline {
    /// A pipeline using the tools and services named in `config`.
    pub fn new(config: PipelineConfig) -> Self {
        let timeout = config.services.timeout();
        Self {
            solver: None,
            fwhm: estimator(config.fwhm, &config.tools.psfex),
            detector: Box::new(Sextractor::new(config.tools.sextractor.clone())),
            catalogs: Box::new(XMatchClient::new(&config.services.xmatch_url, timeout)),
            ephemerides: Box::new(
                SkybotClient::new(&config.services.skybot_url, timeout).with_observer(&config.services.observer),
            ),
            config,
        }
    }

    /// Like [`new`](Pipeline::new), answering crossmatches from the local catalog files of the
    /// configuration if it names any.
    pub fn load(config: PipelineConfig) -> Result<Self> {
        if config.services.catalog_files.is_empty() {
            return Ok(Self::new(config));
        }
        let catalogs = LocalCatalogs::load(&config.services.catalog_files)?;
        info!(
            "Crossmatching against {} local catalog files.",
            config.services.catalog_files.len()
        );
        Ok(Self::new(config).with_catalog_service(Box::new(catalogs)))
    }

    /// Use `solver` instead of the one selected by the calibration method.
    pub fn with_solver(mut self, solver: Box<dyn AstrometricSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Estimate the FWHM with `fwhm`.
    pub fn with_fwhm_estimator(mut self, fwhm: Box<dyn FwhmEstimator>) -> Self {
        self.fwhm = fwhm;
        self
    }

    /// Detect sources with `detector` instead of SExtractor.
    pub fn with_detector(mut self, detector: Box<dyn SourceDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Crossmatch with `catalogs` instead of XMatch.
    pub fn with_catalog_service(mut self, catalogs: Box<dyn CatalogService>) -> Self {
        self.catalogs = catalogs;
        self
    }

    /// Look up moving objects with `ephemerides` instead of SkyBoT.
    pub fn with_ephemeris_service(mut self, ephemerides: Box<dyn EphemerisService>) -> Self {
        self.ephemerides = ephemerides;
        self
    }

    /// The settings the pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage on the image at `image`.
    pub fn run_field(&self, image: &Path) -> Result<FieldReport> {
        let config = &self.config;
        let field = Field::new(image);
        let output_dir = config.output_dir.as_path();
        info!("Processing {}.", field.path.display());

        let table = partition(&field, config.grid, output_dir)?;
        let files = table.len();
        let (table, calibration) = self.calibrate(table)?;
        let mut skipped = calibration
            .iter()
            .filter_map(|r| Some((r.path.clone(), r.error.clone()?)))
            .collect::<Vec<_>>();

        let catalogs = self.detect_and_project(&table, &mut skipped)?;
        let original = fits::read_header(&field.path)?;
        let geometry = QuadrantGeometry::from_header(&original, &field.path, table.grid)?;
        let detections = assemble(&catalogs, &geometry);

        let (candidates, steps, tolerance) = if catalogs.is_empty() {
            warn!("No file of {} could be processed.", field.name);
            (CandidateSet::default(), Vec::new(), None)
        } else {
            let processed = ImageTable {
                entries: catalogs.iter().map(|c| c.entry.clone()).collect(),
                ..table.clone()
            };
            let reduction = CandidateReducer::new(self.catalogs.as_ref())
                .with_catalogs(config.catalogs.clone())
                .with_radius_pixels(config.radius_pixels)
                .reduce_field(&processed, &catalogs)?;
            (reduction.candidates, reduction.steps, Some(reduction.tolerance_arcsec))
        };

        let (candidates, moving_objects_removed) = self.remove_moving_objects(candidates, &original, &field)?;
        let (candidate_file, _) = persist(&candidates, &field, output_dir)?;

        let zero_point = match tolerance {
            Some(tolerance) if config.photometry.enabled => {
                let zero_point = PhotometricCalibrator::new(self.catalogs.as_ref(), config.photometry.catalog.clone())
                    .with_magnitude_column(&config.photometry.magnitude_column)
                    .with_sigma(config.photometry.sigma_clip)
                    .zero_point(&detections, tolerance)?;
                write_calibrated(&calibrate_candidates(&candidates, zero_point), &field, output_dir)?;
                zero_point
            }
            _ => None,
        };

        Ok(FieldReport {
            field,
            files,
            calibration,
            skipped,
            detections: detections.len(),
            steps,
            moving_objects_removed,
            candidates: candidates.len(),
            zero_point,
            candidate_file,
        })
    }

    fn calibrate(&self, table: ImageTable) -> Result<(ImageTable, Vec<CalibrationReport>)> {
        let config = &self.config;
        let built: Box<dyn AstrometricSolver>;
        let solver: &dyn AstrometricSolver = match (&self.solver, config.calibration) {
            (_, CalibrationMethod::None) => return Ok((table, Vec::new())),
            (Some(solver), _) => solver.as_ref(),
            (None, CalibrationMethod::Scamp) => {
                built = Box::new(Scamp::new(config.tools.scamp.clone()));
                built.as_ref()
            }
            (None, CalibrationMethod::AstrometryNet) => {
                let header = fits::read_header(&table.field.path)?;
                built = Box::new(AstrometryNet::from_header(
                    config.tools.astrometry_net.clone(),
                    &header,
                    &table.field.path,
                )?);
                built.as_ref()
            }
        };

        Calibrator::new(solver)
            .with_accuracy(config.accuracy_arcsec)
            .with_max_iterations(config.max_iterations)
            .with_policy(config.on_file_error)
            .calibrate(table)
    }

    /// FWHM, detection, magnitude error cut and projection of every file. Each file's `.magwcs`
    /// catalog is written and read back as the reducer input. Files failing any step are
    /// handled by the file policy.
    fn detect_and_project(&self, table: &ImageTable, skipped: &mut Vec<(PathBuf, String)>) -> Result<Vec<FileCatalog>> {
        let (fwhm, detector) = (self.fwhm.as_ref(), self.detector.as_ref());
        let (threshold, mag_err_cut) = (self.config.threshold, self.config.mag_err_cut);
        let process = |entry: &ImageEntry| -> Result<FileCatalog> {
            let path = entry.path.as_path();
            let fwhm = fwhm.estimate(path)?;
            let detections = detector.detect(path, fwhm.mean, threshold)?;
            let detections = apply_mag_err_cut(detections, mag_err_cut);
            let sources = project_file(path, &detections)?;
            write_sky_catalog(path, &sources)?;
            FileCatalog::read(entry.clone())
        };

        #[cfg(feature = "parallel")]
        let results = table.entries.par_iter().map(process).collect::<Vec<_>>();
        #[cfg(not(feature = "parallel"))]
        let results = table.entries.iter().map(process).collect::<Vec<_>>();

        let mut catalogs = Vec::with_capacity(results.len());
        for (entry, result) in table.entries.iter().zip(results) {
            let reason = match &result {
                Err(e) => e.to_string(),
                Ok(_) => String::new(),
            };
            match self.config.on_file_error.apply(result, "Detection", &entry.path)? {
                Some(catalog) => catalogs.push(catalog),
                None => skipped.push((entry.path.clone(), reason)),
            }
        }
        Ok(catalogs)
    }

    fn remove_moving_objects(
        &self,
        candidates: CandidateSet,
        original: &fits::Header,
        field: &Field,
    ) -> Result<(CandidateSet, usize)> {
        let settings = &self.config.moving_objects;
        if !settings.enabled || candidates.is_empty() {
            return Ok((candidates, 0));
        }

        let observation = Observation::from_header(original, &field.path);
        let Some(observation) = self
            .config
            .on_file_error
            .apply(observation, "Moving-object filter", &field.path)?
        else {
            return Ok((candidates, 0));
        };

        let objects = self
            .ephemerides
            .cone_search(&observation, settings.search_radius_deg)?;
        write_moving_objects(&objects, field, &self.config.output_dir)?;
        Ok(filter_moving_objects(candidates, &objects, settings.match_radius_arcsec))
    }
}
