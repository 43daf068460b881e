#![warn(missing_docs)]

//! Detection of optical transient candidates in astronomical images.
//!
//! A field image is cut into quadrants, astrometrically calibrated with SCAMP or astrometry.net,
//! searched for sources with SExtractor and projected onto the sky. The [`CandidateReducer`]
//! then merges the detections of all quadrants and removes, catalog by catalog, every source
//! with a counterpart in a reference catalog. What survives is a transient candidate.
//! Known solar system objects and a photometric zero point are handled afterwards.
//!
//! ## Interface
//! [`Pipeline`] runs all stages for one image and is configured with a [`PipelineConfig`].
//! External programs and services sit behind traits ([`AstrometricSolver`],
//! [`FwhmEstimator`], [`SourceDetector`], [`CatalogService`], [`EphemerisService`]) and can be
//! replaced with `Pipeline::with_*()`.
//!
//! Example:
//! ```no_run
//! use otdetect::{Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::load("otdetect.toml")?;
//! let report = Pipeline::load(config)?.run_field("tile42.fits".as_ref())?;
//! println!("{} candidates", report.candidates);
//! # Ok::<(), otdetect::Error>(())
//! ```
//!
//! The reducer can also be used on its own, e.g. with a [`LocalCatalog`]:
//! ```no_run
//! # use otdetect::*;
//! # let (detections, stars) = (Vec::new(), Vec::new());
//! let service = LocalCatalogs::new().with_catalog(ReferenceCatalog::GaiaDr2, LocalCatalog::new(stars));
//! let reduction = CandidateReducer::new(&service)
//!     .with_catalogs(vec![ReferenceCatalog::GaiaDr2])
//!     .reduce(detections, tolerance_arcsec(3., 1.5e-4))?;
//! # Ok::<(), otdetect::Error>(())
//! ```
//!
//! ## Output
//! All products are written to the output directory: quadrant images (a copy of the image for
//! a 1x1 grid), `.magwcs` sky catalogs per file, `<field>.oc` with the candidates,
//! `<field>_oc_RADEC` with their positions only and `<field>_moving_objects.dat`.

pub mod calibration;
pub mod config;
pub mod crossmatch;
pub mod detection;
mod error;
pub mod fits;
pub mod moving;
pub mod partition;
pub mod photometry;
pub mod pipeline;
pub mod projection;
pub mod psf;
pub mod reducer;
pub mod sources;
pub mod table;
pub(crate) mod tools;
pub(crate) mod votable;
pub mod wcs;

pub use calibration::{AstrometricSolver, CalibrationMethod};
pub use config::{FilePolicy, PipelineConfig};
pub use crossmatch::{CatalogService, LocalCatalog, LocalCatalogs, ReferenceCatalog, XMatchClient};
pub use detection::SourceDetector;
pub use error::{Error, Result};
pub use moving::EphemerisService;
pub use partition::{Field, Grid, QuadrantLabel};
pub use pipeline::{FieldReport, Pipeline};
pub use psf::{FwhmEstimator, FwhmSource};
pub use reducer::{CandidateReducer, CandidateSet, tolerance_arcsec};
pub use sources::Detection;

/// A generic float trait such that the world coordinate transformations are generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
/// [`num_traits::Float`] is not a supertrait as the need to specify the provider of the redundant definitions of the basic math functions would clutter the code.
pub trait Float: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}

impl<F> Float for F where F: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}
