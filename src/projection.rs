//! Pixel to sky conversion of detections and the per-file `.magwcs` catalogs.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fits;
use crate::partition::derived_path;
use crate::sources::{RawDetection, SkySource, sky_sources, sky_table};
use crate::table::AsciiTable;
use crate::wcs::Wcs;

/// Project detections with 1-based pixel positions onto the sky.
pub fn project(detections: &[RawDetection], wcs: &Wcs<f64>) -> Vec<SkySource> {
    detections
        .iter()
        .map(|d| {
            let world = wcs.pixel_to_world(d.position);
            SkySource {
                position: d.position,
                ra: world.x,
                dec: world.y,
                mag: d.mag,
                mag_err: d.mag_err,
            }
        })
        .collect()
}

/// Project the detections of `image` with the WCS in its header.
///
/// Fails with [`Error::MissingCalibration`](crate::Error::MissingCalibration) if the header
/// carries no usable WCS.
pub fn project_file(image: &Path, detections: &[RawDetection]) -> Result<Vec<SkySource>> {
    let header = fits::read_header(image)?;
    let wcs = Wcs::from_header(&header, image)?;
    Ok(project(detections, &wcs))
}

/// Path of the sky catalog of `image`.
pub fn magwcs_path(image: &Path) -> PathBuf {
    derived_path(image, ".magwcs")
}

/// Write `<stem>.magwcs` and the RA/Dec only `<stem>.magwcs2` next to `image`.
pub fn write_sky_catalog(image: &Path, sources: &[SkySource]) -> Result<PathBuf> {
    let path = magwcs_path(image);
    let table = sky_table(image, sources);
    table.write(&path)?;
    if let Some(radec) = table.select(&["RA", "DEC"]) {
        radec.write(derived_path(image, ".magwcs2"))?;
    }
    Ok(path)
}

/// Read back the sky catalog of `image`.
pub fn read_sky_catalog(image: &Path) -> Result<Vec<SkySource>> {
    let path = magwcs_path(image);
    let table = AsciiTable::read(&path)?;
    sky_sources(&table, &path)
}
