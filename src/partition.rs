//! Cutting a field image into a grid of quadrants and mapping quadrant pixels back.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use nalgebra::Vector2;
use ndarray::s;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fits::{self, Header, HeaderValue};

/// Shape of the partition grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    /// Cells along `NAXIS2`.
    pub rows: usize,
    /// Cells along `NAXIS1`.
    pub cols: usize,
}

impl Default for Grid {
    fn default() -> Self {
        Self { rows: 1, cols: 1 }
    }
}

impl Grid {
    /// Fails with [`Error::Config`] for an empty grid.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(Error::Config(format!("invalid grid {rows}x{cols}")));
        }
        Ok(Self { rows, cols })
    }

    /// Square grid, as requested with `--quadrants n`.
    pub fn square(n: usize) -> Result<Self> {
        Self::new(n, n)
    }

    /// Whether the image is processed uncut.
    pub fn is_whole(&self) -> bool {
        self.rows == 1 && self.cols == 1
    }

    /// Quadrant labels in row-major order.
    pub fn labels(&self) -> Vec<QuadrantLabel> {
        if self.is_whole() {
            return vec![QuadrantLabel::Whole];
        }
        (0..self.rows)
            .flat_map(|row| (0..self.cols).map(move |col| (row, col)))
            .map(|(row, col)| QuadrantLabel::Cell {
                index: row * self.cols + col + 1,
                row,
                col,
            })
            .collect()
    }
}

/// Label of one processed file: the whole image or one grid cell.
///
/// Encoded as `none` or `Q<n>_<row>_<col>` with a 1-based linear index `n`
/// and 0-based grid coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuadrantLabel {
    /// The unpartitioned image.
    Whole,
    /// A grid cell.
    Cell {
        /// 1-based position in row-major order.
        index: usize,
        /// 0-based row, along `NAXIS2`.
        row: usize,
        /// 0-based column, along `NAXIS1`.
        col: usize,
    },
}

impl QuadrantLabel {
    /// Grid coordinates `(row, col)`; `(0, 0)` for an unpartitioned image.
    pub fn position(&self) -> (usize, usize) {
        match self {
            QuadrantLabel::Whole => (0, 0),
            QuadrantLabel::Cell { row, col, .. } => (*row, *col),
        }
    }
}

impl fmt::Display for QuadrantLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuadrantLabel::Whole => write!(f, "none"),
            QuadrantLabel::Cell { index, row, col } => write!(f, "Q{index}_{row}_{col}"),
        }
    }
}

impl FromStr for QuadrantLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("none") {
            return Ok(QuadrantLabel::Whole);
        }
        let invalid = || Error::InvalidQuadrant(s.to_string());
        let mut parts = s.strip_prefix('Q').ok_or_else(invalid)?.split('_');
        let mut next = || -> Result<usize> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let (index, row, col) = (next()?, next()?, next()?);
        if parts.next().is_some() || index == 0 {
            return Err(invalid());
        }
        Ok(QuadrantLabel::Cell { index, row, col })
    }
}

/// Pixel geometry of the unpartitioned image and its grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuadrantGeometry {
    /// `NAXIS1` of the original image.
    pub width: usize,
    /// `NAXIS2` of the original image.
    pub height: usize,
    /// Partition grid.
    pub grid: Grid,
}

impl QuadrantGeometry {
    /// Geometry of a `width` x `height` image cut by `grid`.
    pub fn new(width: usize, height: usize, grid: Grid) -> Self {
        Self {
            width,
            height,
            grid,
        }
    }

    /// Geometry of the original image from its header.
    ///
    /// Fails with [`Error::MissingHeaderKey`] if `NAXIS1` or `NAXIS2` is absent and with
    /// [`Error::Fits`] if either is negative.
    pub fn from_header(header: &Header, path: &Path, grid: Grid) -> Result<Self> {
        let width = header
            .get_i64("NAXIS1")
            .ok_or_else(|| Error::missing_key(path, &["NAXIS1"]))?;
        let height = header
            .get_i64("NAXIS2")
            .ok_or_else(|| Error::missing_key(path, &["NAXIS2"]))?;
        let size = |key: &str, n: i64| {
            usize::try_from(n).map_err(|_| Error::fits(path, format!("invalid {key} = {n}")))
        };
        Ok(Self::new(size("NAXIS1", width)?, size("NAXIS2", height)?, grid))
    }

    /// Width of all but the last column.
    pub fn cell_width(&self) -> usize {
        self.width / self.grid.cols
    }

    /// Height of all but the last row.
    pub fn cell_height(&self) -> usize {
        self.height / self.grid.rows
    }

    /// Offset to add to a quadrant-local pixel position to get the position in the original image.
    pub fn offset(&self, label: &QuadrantLabel) -> Vector2<f64> {
        let (row, col) = label.position();
        Vector2::new(
            (col * self.cell_width()) as f64,
            (row * self.cell_height()) as f64,
        )
    }

    /// Pixel ranges `(x_range, y_range)` (0-based, exclusive end) covered by a quadrant.
    /// The last row and column absorb the remainder of uneven divisions.
    pub fn bounds(&self, label: &QuadrantLabel) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let (row, col) = label.position();
        let x0 = col * self.cell_width();
        let y0 = row * self.cell_height();
        let x1 = if col + 1 == self.grid.cols {
            self.width
        } else {
            x0 + self.cell_width()
        };
        let y1 = if row + 1 == self.grid.rows {
            self.height
        } else {
            y0 + self.cell_height()
        };
        (x0..x1, y0..y1)
    }
}

/// The original, unpartitioned image of a field.
///
/// Carried through the pipeline so that output names never need to be derived
/// from quadrant file names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    /// Path to the original image.
    pub path: PathBuf,
    /// File stem without any extension, e.g. `tile42` for `tile42.fits.gz`.
    pub name: String,
    /// All extensions including the leading dot, e.g. `.fits`.
    pub extension: String,
}

impl Field {
    /// Field of the image at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (name, extension) = match file_name.find('.') {
            Some(i) => (file_name[..i].to_string(), file_name[i..].to_string()),
            None => (file_name.clone(), String::new()),
        };
        Self {
            path,
            name,
            extension,
        }
    }

    /// File name of a quadrant cut from this field.
    pub fn quadrant_file_name(&self, label: &QuadrantLabel) -> String {
        match label {
            QuadrantLabel::Whole => format!("{}{}", self.name, self.extension),
            QuadrantLabel::Cell { index, .. } => {
                format!("{}_Q{}{}", self.name, index, self.extension)
            }
        }
    }
}

/// One processed file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageEntry {
    /// Image file in the output directory.
    pub path: PathBuf,
    /// Part of the field the file covers.
    pub quadrant: QuadrantLabel,
}

/// The files of one field, in partition order.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTable {
    /// The field the files were cut from.
    pub field: Field,
    /// Grid the field was cut with.
    pub grid: Grid,
    /// Directory receiving all products of the field.
    pub output_dir: PathBuf,
    /// Files still taking part in the processing.
    pub entries: Vec<ImageEntry>,
}

impl ImageTable {
    /// Number of files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no file is left.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cut `field` into `grid` quadrants written to `output_dir`.
///
/// For a 1x1 grid the original image is copied unchanged, so that every product of the field
/// lands in `output_dir`.
/// Each quadrant keeps the original header with `CRPIX1/2` shifted by the cut origin.
pub fn partition(field: &Field, grid: Grid, output_dir: &Path) -> Result<ImageTable> {
    fs::create_dir_all(output_dir)?;

    let mut table = ImageTable {
        field: field.clone(),
        grid,
        output_dir: output_dir.to_path_buf(),
        entries: Vec::with_capacity(grid.rows * grid.cols),
    };

    if grid.is_whole() {
        let path = output_dir.join(field.quadrant_file_name(&QuadrantLabel::Whole));
        if !same_file(&field.path, &path) {
            fs::copy(&field.path, &path)?;
            debug!("Copied {} to {}.", field.path.display(), path.display());
        }
        table.entries.push(ImageEntry {
            path,
            quadrant: QuadrantLabel::Whole,
        });
        return Ok(table);
    }

    info!(
        "Cutting {} into {}x{} quadrants.",
        field.path.display(),
        grid.rows,
        grid.cols
    );
    let (header, image) = fits::read_image(&field.path)?;
    let geometry = QuadrantGeometry::from_header(&header, &field.path, grid)?;

    for label in grid.labels() {
        let (xs, ys) = geometry.bounds(&label);
        let cut = image.slice(s![ys.start..ys.end, xs.start..xs.end]);

        let mut quadrant_header = header.clone();
        shift_reference_pixel(&mut quadrant_header, xs.start as f64, ys.start as f64);

        let path = output_dir.join(field.quadrant_file_name(&label));
        fits::write_image(&path, &quadrant_header, cut)?;
        debug!("Wrote quadrant {} to {}.", label, path.display());

        table.entries.push(ImageEntry {
            path,
            quadrant: label,
        });
    }

    Ok(table)
}

/// Path of a product derived from `image`: same directory, stem without extensions, plus `suffix`.
pub fn derived_path(image: &Path, suffix: &str) -> PathBuf {
    let field = Field::new(image);
    image
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{}{}", field.name, suffix))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn shift_reference_pixel(header: &mut Header, dx: f64, dy: f64) {
    for (key, shift) in [("CRPIX1", dx), ("CRPIX2", dy)] {
        if let Some(crpix) = header.get_f64(key) {
            header.set(key, HeaderValue::Float(crpix - shift));
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use itertools::Itertools;
    use ndarray::Array2;

    use super::*;

    #[test]
    fn labels_are_distinct_for_all_grids() {
        for rows in 1..6 {
            for cols in 1..6 {
                let labels = Grid::new(rows, cols).unwrap().labels();
                assert_eq!(labels.len(), rows * cols);
                assert_eq!(labels.iter().unique().count(), rows * cols);
            }
        }
    }

    #[test]
    fn labels_are_row_major() {
        let labels = Grid::square(2).unwrap().labels().iter().map(|l| l.to_string()).collect_vec();
        assert_eq!(labels, ["Q1_0_0", "Q2_0_1", "Q3_1_0", "Q4_1_1"]);
        assert_eq!(Grid::default().labels(), [QuadrantLabel::Whole]);
    }

    #[test]
    fn parse_labels() {
        assert_eq!("none".parse::<QuadrantLabel>().unwrap(), QuadrantLabel::Whole);
        assert_eq!(
            "Q12_2_3".parse::<QuadrantLabel>().unwrap(),
            QuadrantLabel::Cell {
                index: 12,
                row: 2,
                col: 3
            }
        );
        for bad in ["Q1_0", "X1_0_0", "Q1_0_0_0", "Q0_0_0", ""] {
            assert!(bad.parse::<QuadrantLabel>().is_err(), "{bad}");
        }
    }

    #[test]
    fn zero_offset_for_whole_image() {
        let geometry = QuadrantGeometry::new(2048, 4096, Grid::default());
        assert_eq!(geometry.offset(&QuadrantLabel::Whole), Vector2::zeros());
    }

    #[test]
    fn third_quadrant_offset() {
        let geometry = QuadrantGeometry::new(2048, 1024, Grid::square(2).unwrap());
        let label: QuadrantLabel = "Q3_1_0".parse().unwrap();
        assert_eq!(geometry.offset(&label), Vector2::new(0., 512.));
    }

    #[test]
    fn bounds_cover_uneven_image() {
        let geometry = QuadrantGeometry::new(101, 51, Grid::new(2, 3).unwrap());
        let covered: usize = geometry
            .grid
            .labels()
            .iter()
            .map(|l| {
                let (xs, ys) = geometry.bounds(l);
                xs.len() * ys.len()
            })
            .sum();
        assert_eq!(covered, 101 * 51);
    }

    #[test]
    fn missing_dimensions() {
        let header = Header::from_lines("NAXIS1  = 100\n");
        let err = QuadrantGeometry::from_header(&header, Path::new("f.fits"), Grid::default())
            .unwrap_err();
        assert!(matches!(err, Error::MissingHeaderKey { ref keys, .. } if keys == &["NAXIS2"]));

        let header = Header::from_lines("NAXIS1  = 100\nNAXIS2  = -4\n");
        let err = QuadrantGeometry::from_header(&header, Path::new("f.fits"), Grid::default())
            .unwrap_err();
        assert!(matches!(err, Error::Fits { ref reason, .. } if reason.contains("NAXIS2")));
    }

    #[test]
    fn field_names() {
        let field = Field::new("/data/night/tile42.fits.gz");
        assert_eq!(field.name, "tile42");
        assert_eq!(field.extension, ".fits.gz");
        let label = QuadrantLabel::Cell {
            index: 3,
            row: 1,
            col: 0,
        };
        assert_eq!(field.quadrant_file_name(&label), "tile42_Q3.fits.gz");
    }

    #[test]
    fn derived_products() {
        assert_eq!(
            derived_path(Path::new("out/tile42_Q2.fits"), "_SourcesDet.cat"),
            Path::new("out/tile42_Q2_SourcesDet.cat")
        );
        assert_eq!(derived_path(Path::new("tile42.fit"), ".magwcs"), Path::new("tile42.magwcs"));
    }

    #[test]
    fn partition_writes_quadrants() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.fits");
        let image = Array2::from_shape_fn((4, 6), |(y, x)| (10 * y + x) as f32);
        let mut header = Header::default();
        header.set("CRPIX1", HeaderValue::Float(3.5));
        header.set("CRPIX2", HeaderValue::Float(2.5));
        fits::write_image(&path, &header, image.view()).unwrap();

        let out = dir.path().join("results");
        let table = partition(&Field::new(&path), Grid::square(2).unwrap(), &out).unwrap();
        assert_eq!(table.len(), 4);

        let q4 = &table.entries[3];
        assert_eq!(q4.quadrant.to_string(), "Q4_1_1");
        let (q4_header, q4_image) = fits::read_image(&q4.path).unwrap();
        assert_eq!(q4_image.dim(), (2, 3));
        assert_eq!(q4_image[[0, 0]], 23.);
        assert_abs_diff_eq!(q4_header.get_f64("CRPIX1").unwrap(), 0.5);
        assert_abs_diff_eq!(q4_header.get_f64("CRPIX2").unwrap(), 0.5);
    }

    #[test]
    fn whole_grid_copies_into_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.fits");
        let image = Array2::from_shape_fn((3, 5), |(y, x)| (y * x) as f32);
        fits::write_image(&path, &Header::default(), image.view()).unwrap();
        let field = Field::new(&path);

        let out = dir.path().join("out");
        let table = partition(&field, Grid::default(), &out).unwrap();
        assert_eq!(table.entries[0].path, out.join("field.fits"));
        assert_eq!(table.entries[0].quadrant, QuadrantLabel::Whole);
        assert_eq!(fits::read_image(&table.entries[0].path).unwrap().1, image);

        // Partitioning in place leaves the file alone.
        let table = partition(&field, Grid::default(), dir.path()).unwrap();
        assert_eq!(table.entries[0].path, path);
        assert!(matches!(
            partition(&Field::new(dir.path().join("missing.fits")), Grid::default(), &out),
            Err(Error::Io(_))
        ));
    }
}
