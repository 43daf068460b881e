//! Error type shared by all pipeline stages.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while processing a field.
///
/// Per-file variants ([`MissingHeaderKey`](Error::MissingHeaderKey),
/// [`MissingCalibration`](Error::MissingCalibration),
/// [`ExternalToolFailure`](Error::ExternalToolFailure)) can be isolated to the file
/// they concern. [`CatalogQuery`](Error::CatalogQuery) always aborts the reduction of a field.
#[derive(Debug, Error)]
pub enum Error {
    /// None of the keywords `keys` is present.
    #[error("{}: missing FITS header keyword (tried {})", path.display(), keys.join(", "))]
    MissingHeaderKey {
        /// File whose header was read.
        path: PathBuf,
        /// Alternative keywords, in lookup order.
        keys: Vec<String>,
    },

    /// The header has no usable world coordinate system.
    #[error("{}: no world coordinate system in header, cannot project to sky", path.display())]
    MissingCalibration {
        /// The uncalibrated file.
        path: PathBuf,
    },

    /// An external program could not be run, failed or left no usable output.
    #[error("{tool} failed on {}: {reason}", path.display())]
    ExternalToolFailure {
        /// Name of the program.
        tool: String,
        /// File the program ran on.
        path: PathBuf,
        /// Exit status or the missing output.
        reason: String,
    },

    /// A reference catalog query failed.
    #[error("crossmatch with {catalog} failed: {reason}")]
    CatalogQuery {
        /// Catalog identifier.
        catalog: String,
        /// Transport or service error.
        reason: String,
    },

    /// A file is not a readable FITS image.
    #[error("{}: invalid FITS file: {reason}", path.display())]
    Fits {
        /// The unreadable file.
        path: PathBuf,
        /// What cfitsio or the header check reported.
        reason: String,
    },

    /// A table or catalog file is malformed.
    #[error("{}: invalid catalog: {reason}", path.display())]
    Catalog {
        /// The malformed file.
        path: PathBuf,
        /// Offending row or column.
        reason: String,
    },

    /// Unparsable quadrant label.
    #[error("invalid quadrant label `{0}`")]
    InvalidQuadrant(String),

    /// Invalid setting.
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading or writing a file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn missing_key(path: impl Into<PathBuf>, keys: &[&str]) -> Self {
        Error::MissingHeaderKey {
            path: path.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub(crate) fn tool(tool: &str, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::ExternalToolFailure {
            tool: tool.to_string(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn fits(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Fits {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn catalog(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Catalog {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error only concerns a single file and may be skipped by the per-file policy.
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            Error::MissingHeaderKey { .. }
                | Error::MissingCalibration { .. }
                | Error::ExternalToolFailure { .. }
                | Error::Fits { .. }
                | Error::Catalog { .. }
        )
    }
}

/// Result alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
