//! Source detection and photometry with SExtractor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partition::derived_path;
use crate::sources::RawDetection;
use crate::tools::Invocation;

/// Runs a detector on one file.
pub trait SourceDetector: Sync {
    /// Detect sources in `path` given the seeing `fwhm` in pixels and a detection `threshold`
    /// in units of the background noise. Positions are 1-based pixels.
    fn detect(&self, path: &Path, fwhm: f64, threshold: f64) -> Result<Vec<RawDetection>>;
}

/// SExtractor executable and configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SextractorConfig {
    /// SExtractor executable.
    pub program: String,
    /// Configuration file.
    pub config: PathBuf,
    /// Output parameter list.
    pub parameters: PathBuf,
    /// `VERBOSE_TYPE`: `QUIET`, `NORMAL` or `FULL`.
    pub verbose: String,
}

impl Default for SextractorConfig {
    fn default() -> Self {
        Self {
            program: "sex".to_string(),
            config: PathBuf::from("config/sourcesdet.sex"),
            parameters: PathBuf::from("config/sourcesdet.param"),
            verbose: "NORMAL".to_string(),
        }
    }
}

/// SExtractor writing an ASCII_HEAD catalog (`<stem>_SourcesDet.cat`) and a segmentation
/// map (`<stem>_segmentation.fits`) next to the image.
#[derive(Clone, Debug)]
pub struct Sextractor {
    config: SextractorConfig,
}

impl Sextractor {
    /// SExtractor run with `config`.
    pub fn new(config: SextractorConfig) -> Self {
        Self { config }
    }

    fn invocation(&self, path: &Path, fwhm: f64, threshold: f64) -> Invocation {
        Invocation::new("SExtractor", &self.config.program)
            .arg(path)
            .path_option("c", &self.config.config)
            .option("SEEING_FWHM", fwhm)
            .option("DETECT_THRESH", threshold)
            .path_option("PARAMETERS_NAME", &self.config.parameters)
            .option("CATALOG_TYPE", "ASCII_HEAD")
            .path_option("CATALOG_NAME", &derived_path(path, "_SourcesDet.cat"))
            .option("CHECKIMAGE_TYPE", "SEGMENTATION")
            .path_option("CHECKIMAGE_NAME", &derived_path(path, "_segmentation.fits"))
            .option("VERBOSE_TYPE", &self.config.verbose)
    }
}

impl SourceDetector for Sextractor {
    fn detect(&self, path: &Path, fwhm: f64, threshold: f64) -> Result<Vec<RawDetection>> {
        self.invocation(path, fwhm, threshold).run(path)?;

        let catalog = derived_path(path, "_SourcesDet.cat");
        let text = fs::read_to_string(&catalog)
            .map_err(|e| Error::tool("SExtractor", path, format!("no catalog written: {e}")))?;
        let detections = parse_sextractor_catalog(&text, &catalog)?;
        debug!("{} sources detected in {}.", detections.len(), path.display());
        Ok(detections)
    }
}

const REQUIRED: [&str; 4] = ["X_IMAGE", "Y_IMAGE", "MAG_AUTO", "MAGERR_AUTO"];

/// Parse a SExtractor ASCII_HEAD catalog.
///
/// Header lines have the form `#   3 MAG_AUTO  Kron-like elliptical aperture magnitude  [mag]`,
/// the number being the 1-based column. Vector parameters occupy several columns and only
/// declare the first one.
pub fn parse_sextractor_catalog(text: &str, path: &Path) -> Result<Vec<RawDetection>> {
    let mut columns = HashMap::new();
    let mut detections = Vec::new();
    let mut indices = None;

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            let mut parts = header.split_whitespace();
            let column = parts.next().and_then(|c| c.parse::<usize>().ok());
            if let (Some(column), Some(name)) = (column, parts.next()) {
                columns.insert(name.to_string(), column.saturating_sub(1));
            }
            continue;
        }

        let [x, y, mag, err] = match indices {
            Some(found) => found,
            None => {
                let found = required_columns(&columns, path)?;
                indices = Some(found);
                found
            }
        };
        let values = line.split_whitespace().collect::<Vec<_>>();
        let value = |i: usize| -> Result<f64> {
            values
                .get(i)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::catalog(path, format!("line {}: bad value in column {}", number + 1, i + 1)))
        };
        detections.push(RawDetection {
            position: Vector2::new(value(x)?, value(y)?),
            mag: value(mag)?,
            mag_err: value(err)?,
        });
    }

    if indices.is_none() {
        // Validate the header of an empty catalog too.
        required_columns(&columns, path)?;
    }
    Ok(detections)
}

fn required_columns(columns: &HashMap<String, usize>, path: &Path) -> Result<[usize; 4]> {
    let mut indices = [0; 4];
    for (index, name) in indices.iter_mut().zip(REQUIRED) {
        *index = *columns
            .get(name)
            .ok_or_else(|| Error::catalog(path, format!("missing column {name}")))?;
    }
    Ok(indices)
}

/// Keep detections with a finite magnitude and an error below `cut`.
pub fn apply_mag_err_cut(detections: Vec<RawDetection>, cut: f64) -> Vec<RawDetection> {
    detections
        .into_iter()
        .filter(|d| d.mag.is_finite() && d.mag_err.is_finite() && d.mag_err < cut)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = "\
#   1 NUMBER                 Running object number
#   2 X_IMAGE                Object position along x                                    [pixel]
#   3 Y_IMAGE                Object position along y                                    [pixel]
#   4 MAG_APER               Fixed aperture magnitude vector                            [mag]
#   7 MAG_AUTO               Kron-like elliptical aperture magnitude                    [mag]
#   8 MAGERR_AUTO            RMS error for AUTO magnitude                               [mag]
         1    100.250     50.125  -9.1 -9.2 -9.3  -10.0312   0.0120
         2     10.000   1020.500  -8.1 -8.2 -8.3   -6.5000   0.6000
         3     12.000     13.000  -8.1 -8.2 -8.3   99.0000  99.0000
";

    #[test]
    fn parse_catalog_with_vector_columns() {
        let detections = parse_sextractor_catalog(CATALOG, Path::new("a_SourcesDet.cat")).unwrap();
        assert_eq!(detections.len(), 3);
        assert_eq!(detections[0].position, Vector2::new(100.25, 50.125));
        assert_eq!(detections[0].mag, -10.0312);
        assert_eq!(detections[1].mag_err, 0.6);
    }

    #[test]
    fn mag_err_cut() {
        let detections = parse_sextractor_catalog(CATALOG, Path::new("a_SourcesDet.cat")).unwrap();
        let mut kept = apply_mag_err_cut(detections, 0.5);
        assert_eq!(kept.len(), 1);

        kept[0].mag = f64::NAN;
        assert!(apply_mag_err_cut(kept, 0.5).is_empty());
    }

    #[test]
    fn missing_columns() {
        let text = "#   1 X_IMAGE\n#   2 Y_IMAGE\n  1.0 2.0\n";
        let err = parse_sextractor_catalog(text, Path::new("b.cat")).unwrap_err();
        assert!(err.to_string().contains("MAG_AUTO"));

        assert!(parse_sextractor_catalog("#   1 X_IMAGE\n", Path::new("b.cat")).is_err());
    }

    #[test]
    fn empty_catalog() {
        let header = CATALOG.lines().take(6).collect::<Vec<_>>().join("\n");
        assert!(parse_sextractor_catalog(&header, Path::new("c.cat")).unwrap().is_empty());
    }

    #[test]
    fn truncated_row() {
        let text = format!("{}\n 4 1.0 2.0\n", CATALOG.lines().take(6).collect::<Vec<_>>().join("\n"));
        assert!(matches!(
            parse_sextractor_catalog(&text, Path::new("d.cat")),
            Err(Error::Catalog { .. })
        ));
    }

    #[test]
    fn sextractor_invocation() {
        let line = Sextractor::new(SextractorConfig::default())
            .invocation(Path::new("out/f_Q2.fits"), 2.5, 4.0)
            .command_line();
        assert!(line.starts_with("sex out/f_Q2.fits -c config/sourcesdet.sex -SEEING_FWHM 2.5 -DETECT_THRESH 4"));
        assert!(line.contains("-CATALOG_NAME out/f_Q2_SourcesDet.cat"));
        assert!(line.contains("-CHECKIMAGE_NAME out/f_Q2_segmentation.fits"));
    }
}
