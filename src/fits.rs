//! FITS primary-HDU access through `fitsio`.
//!
//! [`Header`] is a typed view of the keywords the pipeline reads or carries over to quadrants
//! and calibrated copies: world coordinates, observation epoch and the detector keywords
//! SExtractor looks up. Image arrays keep the FITS row order, i.e. `data[[y - 1, x - 1]]` is
//! the pixel at 1-based FITS position `(x, y)`.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fitsio::FitsFile;
use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use log::debug;
use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};

/// String valued keywords read by [`read_header`].
const TEXT_KEYWORDS: [&str; 12] = [
    "CTYPE1", "CTYPE2", "CUNIT1", "CUNIT2", "RADESYS", "RADECSYS", "DATE-OBS", "DATE-GPS", "FILTER",
    "OBJECT", "TELESCOP", "INSTRUME",
];

/// Numeric keywords read by [`read_header`], besides the TPV coefficients.
const NUMBER_KEYWORDS: [&str; 27] = [
    "EQUINOX", "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2", "CD1_1", "CD1_2", "CD2_1", "CD2_2", "CDELT1",
    "CDELT2", "_DELT1", "_DELT2", "PC1_1", "PC1_2", "PC2_1", "PC2_2", "CROTA1", "CROTA2", "LONPOLE",
    "LATPOLE", "EXPTIME", "EXPOSURE", "MJD-OBS", "GAIN", "SATURATE", "AIRMASS",
];

/// Highest `PVi_k` index read.
const MAX_PV: usize = 10;

/// Keywords describing the data unit. cfitsio writes them itself.
const STRUCTURAL: [&str; 8] = ["SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BZERO", "BSCALE"];

// cfitsio keeps global state and is not built reentrant.
static CFITSIO: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    CFITSIO.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Value of a header keyword.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    /// Character string.
    Str(String),
    /// Integer.
    Int(i64),
    /// Real number.
    Float(f64),
    /// Logical.
    Bool(bool),
}

impl HeaderValue {
    /// Numeric value; strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    /// Integral value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0. => Some(*f as i64),
            _ => None,
        }
    }

    /// String value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Parse the value field of a card, i.e. everything after `= `, comment included.
    fn parse(field: &str) -> Option<Self> {
        let field = field.trim_start();
        if let Some(rest) = field.strip_prefix('\'') {
            // '' is an escaped quote inside a string value
            let mut value = String::new();
            let mut chars = rest.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        value.push('\'');
                    } else {
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            return Some(HeaderValue::Str(value.trim_end().to_string()));
        }

        let value = field.split('/').next().unwrap_or("").trim();
        match value {
            "" => None,
            "T" => Some(HeaderValue::Bool(true)),
            "F" => Some(HeaderValue::Bool(false)),
            _ => value
                .parse::<i64>()
                .map(HeaderValue::Int)
                .or_else(|_| value.replace(['D', 'd'], "E").parse::<f64>().map(HeaderValue::Float))
                .ok(),
        }
    }
}

/// Keywords of a primary header, in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    entries: Vec<(String, HeaderValue)>,
}

impl Header {
    /// Parse a newline separated ASCII header, like the `.head` files written by SCAMP.
    ///
    /// Cards without a value (`COMMENT`, `HISTORY`, blank) are dropped; parsing stops at `END`.
    pub fn from_lines(text: &str) -> Self {
        let mut header = Header::default();
        for line in text.lines() {
            let keyword = line.chars().take(8).collect::<String>();
            let keyword = keyword.trim();
            if keyword == "END" {
                break;
            }
            let field = line.chars().skip(8).collect::<String>();
            if let Some(value) = field.strip_prefix("= ").and_then(HeaderValue::parse)
                && !keyword.is_empty()
            {
                header.set(keyword, value);
            }
        }
        header
    }

    /// Value of `keyword`.
    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == keyword).map(|(_, v)| v)
    }

    /// Numeric value of `keyword`.
    pub fn get_f64(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(HeaderValue::as_f64)
    }

    /// Integral value of `keyword`.
    pub fn get_i64(&self, keyword: &str) -> Option<i64> {
        self.get(keyword).and_then(HeaderValue::as_i64)
    }

    /// String value of `keyword`.
    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(HeaderValue::as_str)
    }

    /// Value of the first keyword of `keywords` that is present and numeric.
    pub fn first_f64(&self, keywords: &[&str]) -> Option<f64> {
        keywords.iter().find_map(|k| self.get_f64(k))
    }

    /// Like [`first_f64`](Header::first_f64), failing with [`Error::MissingHeaderKey`].
    pub fn require_f64(&self, path: &Path, keywords: &[&str]) -> Result<f64> {
        self.first_f64(keywords)
            .ok_or_else(|| Error::missing_key(path, keywords))
    }

    /// Whether `keyword` is present.
    pub fn contains(&self, keyword: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == keyword)
    }

    /// Set a keyword, replacing an existing value or appending a new one.
    pub fn set(&mut self, keyword: &str, value: HeaderValue) {
        match self.entries.iter_mut().find(|(k, _)| k == keyword) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((keyword.to_string(), value)),
        }
    }

    /// Remove `keyword`, returning its value.
    pub fn remove(&mut self, keyword: &str) -> Option<HeaderValue> {
        let index = self.entries.iter().position(|(k, _)| k == keyword)?;
        Some(self.entries.remove(index).1)
    }

    /// Copy every keyword of `other` into `self`.
    pub fn merge(&mut self, other: &Header) {
        for (keyword, value) in &other.entries {
            self.set(keyword, value.clone());
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn open(path: &Path) -> Result<(FitsFile, FitsHdu)> {
    // a missing file is an I/O error, not a malformed one
    fs::metadata(path)?;
    let mut fptr = FitsFile::open(path).map_err(|e| Error::fits(path, e.to_string()))?;
    let hdu = fptr.primary_hdu().map_err(|e| Error::fits(path, e.to_string()))?;
    Ok((fptr, hdu))
}

fn header_of(fptr: &mut FitsFile, hdu: &FitsHdu) -> Header {
    let mut header = Header::default();
    if let HduInfo::ImageInfo { shape, .. } = &hdu.info {
        // shape is in C order, NAXIS1 last
        for (axis, n) in shape.iter().rev().enumerate() {
            header.set(&format!("NAXIS{}", axis + 1), HeaderValue::Int(*n as i64));
        }
    }

    for keyword in TEXT_KEYWORDS {
        if let Ok(value) = hdu.read_key::<String>(fptr, keyword) {
            header.set(keyword, HeaderValue::Str(value.trim_end().to_string()));
        }
    }
    let distortion = (1..=2).flat_map(|axis| (0..=MAX_PV).map(move |k| format!("PV{axis}_{k}")));
    for keyword in NUMBER_KEYWORDS.iter().map(|k| k.to_string()).chain(distortion) {
        if let Ok(value) = hdu.read_key::<f64>(fptr, &keyword) {
            header.set(&keyword, HeaderValue::Float(value));
        }
    }
    header
}

fn write_keys(fptr: &mut FitsFile, hdu: &FitsHdu, header: &Header) -> fitsio::errors::Result<()> {
    for (keyword, value) in header.iter().filter(|(k, _)| !STRUCTURAL.contains(k)) {
        match value {
            HeaderValue::Str(s) => hdu.write_key(fptr, keyword, s.as_str())?,
            HeaderValue::Int(i) => hdu.write_key(fptr, keyword, *i)?,
            HeaderValue::Float(f) => hdu.write_key(fptr, keyword, *f)?,
            HeaderValue::Bool(_) => debug!("Logical keyword {keyword} not carried over."),
        }
    }
    Ok(())
}

/// Read the primary header of a FITS file.
///
/// `NAXISn` come from the image description, the other keywords from the header cards.
pub fn read_header(path: impl AsRef<Path>) -> Result<Header> {
    let path = path.as_ref();
    let _guard = lock();
    let (mut fptr, hdu) = open(path)?;
    Ok(header_of(&mut fptr, &hdu))
}

/// Read a 2-D primary image as `f32`. cfitsio applies `BZERO`/`BSCALE`.
pub fn read_image(path: impl AsRef<Path>) -> Result<(Header, Array2<f32>)> {
    let path = path.as_ref();
    let _guard = lock();
    let (mut fptr, hdu) = open(path)?;

    let (rows, cols) = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[0], shape[1]),
        HduInfo::ImageInfo { shape, .. } => {
            return Err(Error::fits(path, format!("expected a 2-D image, found {} axes", shape.len())));
        }
        _ => return Err(Error::fits(path, "primary HDU is not an image")),
    };
    let pixels: Vec<f32> = hdu
        .read_image(&mut fptr)
        .map_err(|e| Error::fits(path, e.to_string()))?;
    let image = Array2::from_shape_vec((rows, cols), pixels).map_err(|e| Error::fits(path, e.to_string()))?;

    debug!("Read {}x{} image from {}.", cols, rows, path.display());
    Ok((header_of(&mut fptr, &hdu), image))
}

/// Write a 2-D `f32` image with the keywords of `header`, replacing any existing file.
pub fn write_image(path: impl AsRef<Path>, header: &Header, image: ArrayView2<f32>) -> Result<()> {
    let path = path.as_ref();
    let (rows, cols) = image.dim();
    let description = ImageDescription {
        data_type: ImageType::Float,
        dimensions: &[rows, cols],
    };
    let pixels = image.iter().copied().collect::<Vec<f32>>();

    let _guard = lock();
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(|e| Error::fits(path, e.to_string()))?;
    let hdu = fptr.primary_hdu().map_err(|e| Error::fits(path, e.to_string()))?;
    hdu.write_image(&mut fptr, &pixels[..])
        .map_err(|e| Error::fits(path, e.to_string()))?;
    write_keys(&mut fptr, &hdu, header).map_err(|e| Error::fits(path, e.to_string()))?;
    Ok(())
}

/// Rewrite the file at `path` with `update` applied to its header. The image is kept.
pub fn update_header(path: impl AsRef<Path>, update: impl FnOnce(&mut Header)) -> Result<()> {
    let path = path.as_ref();
    let (mut header, image) = read_image(path)?;
    update(&mut header);
    write_image(path, &header, image.view())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    #[test]
    fn parse_card_values() {
        let header = Header::from_lines(
            "NAXIS1  =                 2048 / length of data axis 1\n\
             CDELT1  = -1.543390792967E-04 / pixel scale\n\
             OBJECT  = 'GW190425 tile''s'   / target\n\
             SIMPLE  =                    T\n\
             COMMENT   no value here\n\
             END\n\
             CRVAL1  = 1.0\n",
        );

        assert_eq!(header.get_i64("NAXIS1"), Some(2048));
        assert_abs_diff_eq!(header.get_f64("CDELT1").unwrap(), -1.543390792967e-4);
        assert_eq!(header.get_str("OBJECT"), Some("GW190425 tile's"));
        assert_eq!(header.get("SIMPLE"), Some(&HeaderValue::Bool(true)));
        assert!(!header.contains("COMMENT"));
        assert!(!header.contains("CRVAL1"));
    }

    #[test]
    fn non_ascii_cards() {
        let comment = format!("COMMENT   {}é", "x".repeat(69));
        let text = format!("{comment}\nOBJECT  = 'Nébuleuse'\nCRVAL1  = 12.5 / ascension droite\né\n");
        let header = Header::from_lines(&text);
        assert_eq!(header.get_str("OBJECT"), Some("Nébuleuse"));
        assert_eq!(header.get_f64("CRVAL1"), Some(12.5));
    }

    #[test]
    fn first_f64_respects_priority() {
        let header = Header::from_lines("CD1_1   = 2.0\n_DELT1  = 1.0\n");
        assert_eq!(header.first_f64(&["CDELT1", "_DELT1", "CD1_1"]), Some(1.0));

        let err = header
            .require_f64(Path::new("a.fits"), &["CDELT1"])
            .unwrap_err();
        assert!(matches!(err, Error::MissingHeaderKey { .. }));
    }

    #[test]
    fn write_then_read_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.fits");

        let mut header = Header::default();
        header.set("CRPIX1", HeaderValue::Float(10.5));
        header.set("BZERO", HeaderValue::Int(32768));
        header.set("CTYPE1", HeaderValue::Str("RA---TAN".to_string()));
        header.set("DATE-OBS", HeaderValue::Str("2019-04-25T08:31:22".to_string()));
        let image = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];

        write_image(&path, &header, image.view()).unwrap();
        let (stored, read) = read_image(&path).unwrap();

        assert_eq!(read, image);
        assert_eq!(stored.get_i64("NAXIS1"), Some(3));
        assert_eq!(stored.get_i64("NAXIS2"), Some(2));
        assert_eq!(stored.get_f64("BZERO"), None);
        assert_abs_diff_eq!(stored.get_f64("CRPIX1").unwrap(), 10.5);
        assert_eq!(stored.get_str("CTYPE1"), Some("RA---TAN"));
        assert_eq!(stored.get_str("DATE-OBS"), Some("2019-04-25T08:31:22"));
        assert_eq!(read_header(&path).unwrap(), stored);
    }

    #[test]
    fn update_header_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.fits");
        let image = array![[7.0f32, 8.0], [9.0, 10.0]];
        let mut header = Header::default();
        header.set("CRVAL1", HeaderValue::Float(1.));
        write_image(&path, &header, image.view()).unwrap();

        let head = Header::from_lines("CRVAL1  = 150.25\nCRVAL2  = -12.5\nEND\n");
        update_header(&path, |h| h.merge(&head)).unwrap();

        let (header, read) = read_image(&path).unwrap();
        assert_eq!(read, image);
        assert_abs_diff_eq!(header.get_f64("CRVAL1").unwrap(), 150.25);
        assert_abs_diff_eq!(header.get_f64("CRVAL2").unwrap(), -12.5);
    }

    #[test]
    fn reject_non_fits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.fits");
        fs::write(&path, b"hello").unwrap();
        assert!(matches!(read_header(&path), Err(Error::Fits { .. })));
        assert!(matches!(
            read_header(dir.path().join("missing.fits")),
            Err(Error::Io(_))
        ));
    }
}
