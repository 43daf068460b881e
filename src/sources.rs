//! Source records passed between the detection, projection and reduction stages,
//! and their on-disk table layouts.

use std::path::{Path, PathBuf};

use nalgebra::Vector2;

use crate::error::Result;
use crate::partition::QuadrantLabel;
use crate::table::AsciiTable;

/// A source as reported by the detector, in quadrant-local pixels (1-based).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    /// Pixel position.
    pub position: Vector2<f64>,
    /// Instrumental magnitude.
    pub mag: f64,
    /// Magnitude error.
    pub mag_err: f64,
}

/// A detected source with its sky position, still in quadrant-local pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkySource {
    /// Pixel position.
    pub position: Vector2<f64>,
    /// Right ascension in degrees.
    pub ra: f64,
    /// Declination in degrees.
    pub dec: f64,
    /// Instrumental magnitude.
    pub mag: f64,
    /// Magnitude error.
    pub mag_err: f64,
}

/// One row of the field-wide detection table.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Dense index within the current candidate set.
    pub index: usize,
    /// File the source was detected in.
    pub file: PathBuf,
    /// Quadrant of that file.
    pub quadrant: QuadrantLabel,
    /// Position in the quadrant the source was detected in.
    pub local: Vector2<f64>,
    /// Position in the original, unpartitioned image.
    pub global: Vector2<f64>,
    /// Degrees.
    pub ra: f64,
    /// Degrees.
    pub dec: f64,
    /// Instrumental magnitude.
    pub mag: f64,
    /// Magnitude error.
    pub mag_err: f64,
}

const SKY_COLUMNS: [&str; 7] = ["Xpos", "Ypos", "RA", "DEC", "Mag_inst", "Magerr_inst", "filenames"];

const CANDIDATE_COLUMNS: [&str; 11] = [
    "idx",
    "Xpos",
    "Ypos",
    "Xpos_quad",
    "Ypos_quad",
    "_RAJ2000",
    "_DEJ2000",
    "mag_inst",
    "mag_inst_err",
    "filenames",
    "quadrant",
];

/// Right ascension and declination columns of the candidate companion file.
pub const RADEC_COLUMNS: [&str; 2] = ["_RAJ2000", "_DEJ2000"];

/// Per-file sky catalog (`.magwcs`) of the sources of `image`.
pub fn sky_table(image: &Path, sources: &[SkySource]) -> AsciiTable {
    let mut table = AsciiTable::new(&SKY_COLUMNS);
    for s in sources {
        table.push_row(vec![
            format!("{:.4}", s.position.x),
            format!("{:.4}", s.position.y),
            format!("{:.8}", s.ra),
            format!("{:.8}", s.dec),
            format!("{:.4}", s.mag),
            format!("{:.4}", s.mag_err),
            image.display().to_string(),
        ]);
    }
    table
}

/// Inverse of [`sky_table`].
pub fn sky_sources(table: &AsciiTable, path: &Path) -> Result<Vec<SkySource>> {
    let cols = columns(table, &SKY_COLUMNS[..6], path)?;
    (0..table.len())
        .map(|row| {
            let v = |c: usize| table.f64_at(row, cols[c], path);
            Ok(SkySource {
                position: Vector2::new(v(0)?, v(1)?),
                ra: v(2)?,
                dec: v(3)?,
                mag: v(4)?,
                mag_err: v(5)?,
            })
        })
        .collect()
}

/// Candidate table (`.oc`) layout.
pub fn candidate_table(detections: &[Detection]) -> AsciiTable {
    let mut table = AsciiTable::new(&CANDIDATE_COLUMNS);
    for d in detections {
        table.push_row(vec![
            d.index.to_string(),
            format!("{:.4}", d.global.x),
            format!("{:.4}", d.global.y),
            format!("{:.4}", d.local.x),
            format!("{:.4}", d.local.y),
            format!("{:.8}", d.ra),
            format!("{:.8}", d.dec),
            format!("{:.4}", d.mag),
            format!("{:.4}", d.mag_err),
            d.file.display().to_string(),
            d.quadrant.to_string(),
        ]);
    }
    table
}

/// Inverse of [`candidate_table`].
pub fn candidates(table: &AsciiTable, path: &Path) -> Result<Vec<Detection>> {
    let cols = columns(table, &CANDIDATE_COLUMNS, path)?;
    (0..table.len())
        .map(|row| {
            let v = |c: usize| table.f64_at(row, cols[c], path);
            Ok(Detection {
                index: v(0)? as usize,
                global: Vector2::new(v(1)?, v(2)?),
                local: Vector2::new(v(3)?, v(4)?),
                ra: v(5)?,
                dec: v(6)?,
                mag: v(7)?,
                mag_err: v(8)?,
                file: PathBuf::from(&table.rows[row][cols[9]]),
                quadrant: table.rows[row][cols[10]].parse()?,
            })
        })
        .collect()
}

fn columns(table: &AsciiTable, names: &[&str], path: &Path) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|n| {
            table
                .column(n)
                .ok_or_else(|| crate::error::Error::catalog(path, format!("missing column {n}")))
        })
        .collect()
}
