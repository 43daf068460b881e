//! Simple implementation of the World Coordinate System standard.
//!
//! Supports linear and gnomonic (`-TAN`, `-TPV`) celestial axes with a CD matrix,
//! which covers what SCAMP and astrometry.net write into calibrated images.
//! Pixel positions follow the FITS convention: the centre of the first pixel is `(1, 1)`.

use std::path::Path;

use nalgebra::{Matrix2, Vector2};

use crate::Float;
use crate::error::{Error, Result};
use crate::fits::Header;

/// Header keywords holding the pixel scale, in order of preference.
pub const PIXEL_SCALE_KEYS: [&str; 3] = ["CDELT1", "_DELT1", "CD1_1"];

/// Pixel scale in degrees per pixel: absolute value of the first of [`PIXEL_SCALE_KEYS`] present.
///
/// There is no fallback value; a header without any of the keywords is an error.
pub fn pixel_scale(header: &Header, path: &Path) -> Result<f64> {
    header.require_f64(path, &PIXEL_SCALE_KEYS).map(f64::abs)
}

/// Projection of the celestial axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    /// Intermediate world coordinates are the sky coordinates.
    #[default]
    Linear,
    /// Gnomonic projection.
    Tan,
}

/// TPV polynomial distortion, up to third order (`PVi_0` .. `PVi_10`).
#[derive(Clone, Debug, PartialEq)]
pub struct Tpv<F: Float> {
    /// `PV1_0` to `PV1_10`, for the first axis.
    pub pv1: [F; 11],
    /// `PV2_0` to `PV2_10`, for the second axis.
    pub pv2: [F; 11],
}

impl<F: Float> Tpv<F> {
    fn terms(u: F, v: F) -> [F; 11] {
        let r = (u * u + v * v).sqrt();
        [
            F::one(),
            u,
            v,
            r,
            u * u,
            u * v,
            v * v,
            u * u * u,
            u * u * v,
            u * v * v,
            v * v * v,
        ]
    }

    /// Apply the distortion to intermediate world coordinates in degrees.
    pub fn distort(&self, xy: Vector2<F>) -> Vector2<F> {
        let t1 = Self::terms(xy.x, xy.y);
        let t2 = Self::terms(xy.y, xy.x);
        let x = self.pv1.iter().zip(t1).fold(F::zero(), |acc, (p, t)| acc + *p * t);
        let y = self.pv2.iter().zip(t2).fold(F::zero(), |acc, (p, t)| acc + *p * t);
        Vector2::new(x, y)
    }

    /// Inverse of [`distort`](Tpv::distort) by fixed point iteration.
    pub fn undistort(&self, target: Vector2<F>) -> Vector2<F> {
        let mut xy = target;
        for _ in 0..50 {
            let step = target - self.distort(xy);
            xy += step;
            if step.norm() < F::from_f64(1e-13).unwrap_or_else(F::zero) {
                break;
            }
        }
        xy
    }
}

/// Relevant data for WCS transformations from FITS headers.
#[derive(Clone, Debug, PartialEq)]
pub struct Wcs<F: Float> {
    /// Reference pixel.
    pub crpix: Vector2<F>,
    /// Coordinate value at `crpix`.
    pub crval: Vector2<F>,
    /// Linear transformation matrix.
    pub cd: Matrix2<F>,
    /// Projection of the celestial axes.
    pub projection: Projection,
    /// Optional TPV distortion.
    pub tpv: Option<Tpv<F>>,
}

impl<F: Float> Wcs<F> {
    /// Create a new linear instance.
    pub fn new(crpix: Vector2<F>, crval: Vector2<F>, cd: Matrix2<F>) -> Self {
        Self {
            crpix,
            crval,
            cd,
            projection: Projection::Linear,
            tpv: None,
        }
    }

    /// Use the given projection.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    fn deg2rad() -> F {
        F::pi() / F::from_f64(180.).unwrap_or_else(F::one)
    }

    /// Transforms from pixel to sky coordinate space.
    pub fn pixel_to_world(&self, pixel: Vector2<F>) -> Vector2<F> {
        let mut xy = self.cd * (pixel - self.crpix);
        if let Some(tpv) = &self.tpv {
            xy = tpv.distort(xy);
        }

        match self.projection {
            Projection::Linear => self.crval + xy,
            Projection::Tan => {
                let d2r = Self::deg2rad();
                let (xi, eta) = (xy.x * d2r, xy.y * d2r);
                let (ra0, dec0) = (self.crval.x * d2r, self.crval.y * d2r);
                let denom = dec0.cos() - eta * dec0.sin();
                let ra = ra0 + xi.atan2(denom);
                let dec = (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt());

                let full = F::from_f64(360.).unwrap_or_else(F::one);
                let mut ra = ra / d2r;
                while ra < F::zero() {
                    ra += full;
                }
                while ra >= full {
                    ra -= full;
                }
                Vector2::new(ra, dec / d2r)
            }
        }
    }

    /// Transforms from sky coordinate to pixel space.
    ///
    /// Returns `None` if the CD matrix is singular or the position lies on the far hemisphere.
    pub fn world_to_pixel(&self, world_coordinate: Vector2<F>) -> Option<Vector2<F>> {
        let cd_inv = self.cd.try_inverse()?;

        let mut xy = match self.projection {
            Projection::Linear => world_coordinate - self.crval,
            Projection::Tan => {
                let d2r = Self::deg2rad();
                let (ra, dec) = (world_coordinate.x * d2r, world_coordinate.y * d2r);
                let (ra0, dec0) = (self.crval.x * d2r, self.crval.y * d2r);
                let dra = ra - ra0;
                let cos_c = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * dra.cos();
                if cos_c <= F::zero() {
                    return None;
                }
                let xi = dec.cos() * dra.sin() / cos_c;
                let eta = (dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * dra.cos()) / cos_c;
                Vector2::new(xi / d2r, eta / d2r)
            }
        };
        if let Some(tpv) = &self.tpv {
            xy = tpv.undistort(xy);
        }

        Some(self.crpix + cd_inv * xy)
    }
}

impl Wcs<f64> {
    /// Read the celestial WCS of a calibrated image header.
    ///
    /// The CD matrix is taken from `CDi_j`, or built from `CDELTi` with either a `PCi_j`
    /// matrix or a `CROTA2` rotation. Fails with [`Error::MissingCalibration`] if the header
    /// carries no reference point or no scale.
    pub fn from_header(header: &Header, path: &Path) -> Result<Self> {
        let missing = || Error::MissingCalibration {
            path: path.to_path_buf(),
        };
        let get = |key: &str| header.get_f64(key);

        let crpix = Vector2::new(get("CRPIX1").ok_or_else(missing)?, get("CRPIX2").ok_or_else(missing)?);
        let crval = Vector2::new(get("CRVAL1").ok_or_else(missing)?, get("CRVAL2").ok_or_else(missing)?);

        let cd = if ["CD1_1", "CD1_2", "CD2_1", "CD2_2"].iter().any(|k| header.contains(k)) {
            Matrix2::new(
                get("CD1_1").unwrap_or(0.),
                get("CD1_2").unwrap_or(0.),
                get("CD2_1").unwrap_or(0.),
                get("CD2_2").unwrap_or(0.),
            )
        } else {
            let cdelt1 = get("CDELT1").ok_or_else(missing)?;
            let cdelt2 = get("CDELT2").ok_or_else(missing)?;
            let pc = if header.contains("PC1_1") || header.contains("PC2_2") {
                Matrix2::new(
                    get("PC1_1").unwrap_or(1.),
                    get("PC1_2").unwrap_or(0.),
                    get("PC2_1").unwrap_or(0.),
                    get("PC2_2").unwrap_or(1.),
                )
            } else {
                let rho = get("CROTA2").unwrap_or(0.).to_radians();
                Matrix2::new(rho.cos(), -rho.sin(), rho.sin(), rho.cos())
            };
            Matrix2::from_diagonal(&Vector2::new(cdelt1, cdelt2)) * pc
        };

        if cd.determinant() == 0. {
            return Err(missing());
        }

        let ctype = header.get_str("CTYPE1").unwrap_or("");
        let projection = if ctype.ends_with("-TAN") || ctype.ends_with("-TPV") {
            Projection::Tan
        } else {
            Projection::Linear
        };

        let tpv = ctype.ends_with("-TPV").then(|| {
            let mut pv1 = [0.; 11];
            let mut pv2 = [0.; 11];
            pv1[1] = 1.;
            pv2[1] = 1.;
            for k in 0..11 {
                if let Some(v) = get(&format!("PV1_{k}")) {
                    pv1[k] = v;
                }
                if let Some(v) = get(&format!("PV2_{k}")) {
                    pv2[k] = v;
                }
            }
            Tpv { pv1, pv2 }
        });

        Ok(Self {
            crpix,
            crval,
            cd,
            projection,
            tpv,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::Rng;

    use super::*;
    use crate::fits::HeaderValue;

    fn header(cards: &[(&str, HeaderValue)]) -> Header {
        let mut header = Header::default();
        for (k, v) in cards {
            header.set(k, v.clone());
        }
        header
    }

    #[test]
    fn consistency_check() {
        let wcs = Wcs::new(
            Vector2::new(5.065191000000E+02, 4.892484000000E+02),
            Vector2::new(2.711529441199E+01, -3.925398447545E+01),
            Matrix2::new(
                1.672682044534E-04,
                1.996643749806E-06,
                -9.963899403011E-08,
                1.729743106508E-04,
            ),
        );

        for projection in [Projection::Linear, Projection::Tan] {
            let wcs = wcs.clone().with_projection(projection);
            let wc = wcs.pixel_to_world(Vector2::new(1., 1.));
            let px = wcs.world_to_pixel(wc).unwrap();

            assert_abs_diff_eq!(px.x, 1., epsilon = 1e-8);
            assert_abs_diff_eq!(px.y, 1., epsilon = 1e-8);
        }
    }

    #[test]
    fn reference_pixel_maps_to_reference_value() {
        let mut rng = rand::rng();
        let crval = Vector2::new(rng.random_range(0.0..360.0), rng.random_range(-80.0..80.0));
        let crpix = Vector2::new(rng.random_range(1.0..2048.0), rng.random_range(1.0..2048.0));
        let wcs = Wcs::new(crpix, crval, Matrix2::new(-1e-4, 0., 0., 1e-4))
            .with_projection(Projection::Tan);

        let world = wcs.pixel_to_world(crpix);
        assert_abs_diff_eq!(world, crval, epsilon = 1e-9);
    }

    #[test]
    fn tan_scale_near_reference() {
        // one pixel of 1 arcsec along declination at the equator
        let scale = 1. / 3600.;
        let wcs = Wcs::new(
            Vector2::new(100., 100.),
            Vector2::new(10., 0.),
            Matrix2::new(-scale, 0., 0., scale),
        )
        .with_projection(Projection::Tan);

        let world = wcs.pixel_to_world(Vector2::new(100., 101.));
        assert_abs_diff_eq!(world.x, 10., epsilon = 1e-12);
        assert_abs_diff_eq!(world.y, scale, epsilon = 1e-12);

        let world = wcs.pixel_to_world(Vector2::new(101., 100.));
        assert_abs_diff_eq!(world.x, 10. - scale, epsilon = 1e-10);
    }

    #[test]
    fn tan_wraps_right_ascension() {
        let wcs = Wcs::new(
            Vector2::new(1., 1.),
            Vector2::new(0., 0.),
            Matrix2::new(-1e-3, 0., 0., 1e-3),
        )
        .with_projection(Projection::Tan);

        let world = wcs.pixel_to_world(Vector2::new(11., 1.));
        assert!(world.x > 359.9 && world.x < 360.);
    }

    #[test]
    fn from_header_with_cd_matrix() {
        let header = header(&[
            ("CTYPE1", HeaderValue::Str("RA---TAN".into())),
            ("CTYPE2", HeaderValue::Str("DEC--TAN".into())),
            ("CRPIX1", HeaderValue::Float(1024.)),
            ("CRPIX2", HeaderValue::Float(1024.)),
            ("CRVAL1", HeaderValue::Float(150.)),
            ("CRVAL2", HeaderValue::Float(2.)),
            ("CD1_1", HeaderValue::Float(-1.543390792967e-4)),
            ("CD2_2", HeaderValue::Float(1.543390792967e-4)),
        ]);

        let wcs = Wcs::from_header(&header, Path::new("a.fits")).unwrap();
        assert_eq!(wcs.projection, Projection::Tan);
        assert_eq!(wcs.cd.m12, 0.);
        assert!(wcs.tpv.is_none());
    }

    #[test]
    fn from_header_with_cdelt_and_rotation() {
        let header = header(&[
            ("CRPIX1", HeaderValue::Float(1.)),
            ("CRPIX2", HeaderValue::Float(1.)),
            ("CRVAL1", HeaderValue::Float(0.)),
            ("CRVAL2", HeaderValue::Float(0.)),
            ("CDELT1", HeaderValue::Float(1.)),
            ("CDELT2", HeaderValue::Float(1.)),
            ("CROTA2", HeaderValue::Float(90.)),
        ]);

        let wcs = Wcs::from_header(&header, Path::new("a.fits")).unwrap();
        assert_eq!(wcs.projection, Projection::Linear);
        let world = wcs.pixel_to_world(Vector2::new(2., 1.));
        assert_abs_diff_eq!(world, Vector2::new(0., 1.), epsilon = 1e-12);
    }

    #[test]
    fn tpv_round_trip() {
        let mut header = header(&[
            ("CTYPE1", HeaderValue::Str("RA---TPV".into())),
            ("CRPIX1", HeaderValue::Float(500.)),
            ("CRPIX2", HeaderValue::Float(500.)),
            ("CRVAL1", HeaderValue::Float(80.)),
            ("CRVAL2", HeaderValue::Float(-30.)),
            ("CD1_1", HeaderValue::Float(-2e-4)),
            ("CD2_2", HeaderValue::Float(2e-4)),
        ]);
        header.set("PV1_4", HeaderValue::Float(1e-3));
        header.set("PV2_5", HeaderValue::Float(-2e-3));

        let wcs = Wcs::from_header(&header, Path::new("a.fits")).unwrap();
        assert!(wcs.tpv.is_some());

        let pixel = Vector2::new(900., 120.);
        let back = wcs.world_to_pixel(wcs.pixel_to_world(pixel)).unwrap();
        assert_abs_diff_eq!(back, pixel, epsilon = 1e-6);
    }

    #[test]
    fn pixel_scale_priority_and_sign() {
        let h = header(&[
            ("CD1_1", HeaderValue::Float(-3e-4)),
            ("_DELT1", HeaderValue::Float(-1.543390e-4)),
        ]);
        assert_abs_diff_eq!(pixel_scale(&h, Path::new("a.fits")).unwrap(), 1.543390e-4);

        let h = header(&[("CD1_1", HeaderValue::Float(-3e-4))]);
        assert_abs_diff_eq!(pixel_scale(&h, Path::new("a.fits")).unwrap(), 3e-4);

        let h = header(&[("NAXIS1", HeaderValue::Int(10))]);
        let err = pixel_scale(&h, Path::new("a.fits")).unwrap_err();
        assert!(matches!(err, Error::MissingHeaderKey { ref keys, .. } if keys.len() == 3));
    }

    #[test]
    fn from_header_without_calibration() {
        let header = header(&[("NAXIS1", HeaderValue::Int(2048))]);
        let err = Wcs::from_header(&header, Path::new("raw.fits")).unwrap_err();
        assert!(matches!(err, Error::MissingCalibration { .. }));
    }
}
