//! Photometric calibration of instrumental magnitudes against a reference catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{info, warn};

use crate::crossmatch::{CatalogMatch, CatalogService, QueryPosition, ReferenceCatalog};
use crate::error::Result;
use crate::partition::Field;
use crate::reducer::CandidateSet;
use crate::sources::{Detection, candidate_table};

/// Fewest reference stars a zero point is computed from.
pub const MIN_REFERENCE_STARS: usize = 3;

const MAX_CLIP_ITERATIONS: usize = 10;

/// Offset from instrumental to calibrated magnitudes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZeroPoint {
    /// Median offset, added to instrumental magnitudes.
    pub value: f64,
    /// Standard deviation of the retained offsets.
    pub scatter: f64,
    /// Number of reference stars retained after clipping.
    pub stars: usize,
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.
    }
}

/// Median of `offsets` after iteratively rejecting values more than `sigma` standard deviations
/// from the median.
///
/// `None` for fewer than [`MIN_REFERENCE_STARS`] finite values.
pub fn sigma_clipped_zero_point(offsets: &[f64], sigma: f64) -> Option<ZeroPoint> {
    let mut kept = offsets
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .sorted_by(f64::total_cmp)
        .collect::<Vec<_>>();
    if kept.len() < MIN_REFERENCE_STARS {
        return None;
    }

    for _ in 0..MAX_CLIP_ITERATIONS {
        let center = median(&kept);
        let std = standard_deviation(&kept);
        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= sigma * std);
        if kept.len() == before || kept.len() < MIN_REFERENCE_STARS {
            break;
        }
    }
    if kept.len() < MIN_REFERENCE_STARS {
        return None;
    }

    Some(ZeroPoint {
        value: median(&kept),
        scatter: standard_deviation(&kept),
        stars: kept.len(),
    })
}

fn standard_deviation(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Offsets `reference - instrumental` of the closest match of every detection.
pub fn reference_offsets(detections: &[Detection], matches: &[CatalogMatch]) -> Vec<f64> {
    let mut closest = BTreeMap::<usize, &CatalogMatch>::new();
    for m in matches.iter().filter(|m| m.magnitude.is_some()) {
        closest
            .entry(m.index)
            .and_modify(|c| {
                if m.separation_arcsec < c.separation_arcsec {
                    *c = m;
                }
            })
            .or_insert(m);
    }
    closest
        .into_iter()
        .filter_map(|(index, m)| Some(m.magnitude? - detections.get(index)?.mag))
        .collect()
}

/// A calibrated candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibratedCandidate {
    /// The candidate as detected.
    pub detection: Detection,
    /// Calibrated magnitude, if a zero point exists.
    pub mag: Option<f64>,
    /// Instrumental error combined with the zero point scatter.
    pub mag_err: Option<f64>,
}

/// Zero point estimation against a reference catalog.
pub struct PhotometricCalibrator<'a> {
    service: &'a dyn CatalogService,
    catalog: ReferenceCatalog,
    magnitude_column: String,
    sigma: f64,
}

impl<'a> PhotometricCalibrator<'a> {
    /// Calibrate against `catalog`, using its usual magnitude column and 3 sigma clipping.
    pub fn new(service: &'a dyn CatalogService, catalog: ReferenceCatalog) -> Self {
        let magnitude_column = catalog.magnitude_column().unwrap_or("rmag").to_string();
        Self {
            service,
            catalog,
            magnitude_column,
            sigma: 3.,
        }
    }

    /// Catalog column holding the reference magnitude.
    pub fn with_magnitude_column(mut self, column: &str) -> Self {
        self.magnitude_column = column.to_string();
        self
    }

    /// Sigma clipping threshold.
    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    /// Zero point from all detections of the field, crossmatched within `radius_arcsec`.
    pub fn zero_point(&self, detections: &[Detection], radius_arcsec: f64) -> Result<Option<ZeroPoint>> {
        let positions = detections
            .iter()
            .enumerate()
            .map(|(index, d)| QueryPosition {
                index,
                ra: d.ra,
                dec: d.dec,
            })
            .collect::<Vec<_>>();
        let matches = self.service.crossmatch(
            &positions,
            &self.catalog,
            radius_arcsec,
            Some(&self.magnitude_column),
        )?;
        let offsets = reference_offsets(detections, &matches);

        let zero_point = sigma_clipped_zero_point(&offsets, self.sigma);
        match zero_point {
            Some(zp) => info!(
                "Zero point {:.3} +/- {:.3} mag from {} {} stars ({}).",
                zp.value, zp.scatter, zp.stars, self.catalog, self.magnitude_column
            ),
            None => warn!(
                "Only {} {} stars matched, fewer than {}: magnitudes stay uncalibrated.",
                offsets.len(),
                self.catalog,
                MIN_REFERENCE_STARS
            ),
        }
        Ok(zero_point)
    }
}

/// Apply `zero_point` to the candidates. Errors add the zero point scatter in quadrature.
pub fn calibrate_candidates(candidates: &CandidateSet, zero_point: Option<ZeroPoint>) -> Vec<CalibratedCandidate> {
    candidates
        .detections()
        .iter()
        .map(|d| CalibratedCandidate {
            detection: d.clone(),
            mag: zero_point.map(|zp| d.mag + zp.value),
            mag_err: zero_point.map(|zp| d.mag_err.hypot(zp.scatter)),
        })
        .collect()
}

/// Write `<field>_calibrated.dat` to `output_dir`. Uncalibrated magnitudes are written as `nan`.
pub fn write_calibrated(candidates: &[CalibratedCandidate], field: &Field, output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join(format!("{}_calibrated.dat", field.name));
    let detections = candidates.iter().map(|c| c.detection.clone()).collect::<Vec<_>>();
    let mut table = candidate_table(&detections);
    table.columns.extend(["mag_calib".to_string(), "mag_calib_err".to_string()]);
    for (row, c) in table.rows.iter_mut().zip(candidates) {
        row.push(format!("{:.4}", c.mag.unwrap_or(f64::NAN)));
        row.push(format!("{:.4}", c.mag_err.unwrap_or(f64::NAN)));
    }
    table.write(&path)?;
    Ok(path)
}
