//! The candidate reducer: merges the detections of all quadrants of a field and removes,
//! catalog by catalog, every detection with a counterpart in a reference catalog.
//!
//! Catalogs are applied strictly in order. A detection matched by one catalog is never sent to
//! the next one, so the order of [`CandidateReducer::with_catalogs`] is a priority order.
//! The indices of the candidate set are dense after every step.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{debug, info};

use crate::crossmatch::{CatalogService, QueryPosition, ReferenceCatalog};
use crate::error::{Error, Result};
use crate::fits;
use crate::partition::{Field, ImageEntry, ImageTable, QuadrantGeometry};
use crate::projection::read_sky_catalog;
use crate::sources::{Detection, RADEC_COLUMNS, SkySource, candidate_table};
use crate::wcs::pixel_scale;

/// The sky catalog of one file of an [`ImageTable`].
#[derive(Clone, Debug, PartialEq)]
pub struct FileCatalog {
    /// The file the sources were detected in.
    pub entry: ImageEntry,
    /// Sources in quadrant-local pixels.
    pub sources: Vec<SkySource>,
}

impl FileCatalog {
    /// Load the `.magwcs` catalog written next to the file of `entry`.
    pub fn read(entry: ImageEntry) -> Result<Self> {
        let sources = read_sky_catalog(&entry.path)?;
        Ok(Self { entry, sources })
    }
}

/// Concatenate the catalogs of all files into one detection table, in file order.
///
/// Global positions are the quadrant-local positions shifted by the quadrant offset.
pub fn assemble(files: &[FileCatalog], geometry: &QuadrantGeometry) -> Vec<Detection> {
    files
        .iter()
        .flat_map(|file| {
            let offset = geometry.offset(&file.entry.quadrant);
            file.sources.iter().map(move |s| Detection {
                index: 0,
                file: file.entry.path.clone(),
                quadrant: file.entry.quadrant,
                local: s.position,
                global: s.position + offset,
                ra: s.ra,
                dec: s.dec,
                mag: s.mag,
                mag_err: s.mag_err,
            })
        })
        .enumerate()
        .map(|(index, detection)| Detection { index, ..detection })
        .collect()
}

/// Crossmatch tolerance in arcseconds for a radius in pixels and a pixel scale in degrees.
pub fn tolerance_arcsec(radius_pixels: f64, pixel_scale: f64) -> f64 {
    radius_pixels * pixel_scale * 3600.
}

/// Detections not matched by any catalog so far.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CandidateSet {
    detections: Vec<Detection>,
}

impl CandidateSet {
    /// Take ownership of `detections` and index them densely from 0.
    pub fn new(detections: Vec<Detection>) -> Self {
        let mut set = Self { detections };
        set.reindex();
        set
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    /// Whether no candidate is left.
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Remaining detections, ordered by index.
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    /// Take the remaining detections.
    pub fn into_detections(self) -> Vec<Detection> {
        self.detections
    }

    /// Sky positions keyed by candidate index.
    pub fn positions(&self) -> Vec<QueryPosition> {
        self.detections
            .iter()
            .map(|d| QueryPosition {
                index: d.index,
                ra: d.ra,
                dec: d.dec,
            })
            .collect()
    }

    /// Drop the candidates whose index is in `matched` and reindex the rest.
    ///
    /// Returns the number of removed candidates.
    pub fn remove_matched(&mut self, matched: &BTreeSet<usize>) -> usize {
        let before = self.detections.len();
        self.detections.retain(|d| !matched.contains(&d.index));
        self.reindex();
        before - self.detections.len()
    }

    fn reindex(&mut self) {
        for (index, detection) in self.detections.iter_mut().enumerate() {
            detection.index = index;
        }
    }
}

/// Outcome of filtering with one catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct FiltrationStep {
    /// The queried catalog.
    pub catalog: ReferenceCatalog,
    /// Number of distinct candidates with at least one counterpart.
    pub matched: usize,
    /// Candidates left after this step.
    pub remaining: usize,
}

/// Result of [`CandidateReducer::reduce`].
#[derive(Clone, Debug, PartialEq)]
pub struct Reduction {
    /// Detections without a counterpart in any catalog.
    pub candidates: CandidateSet,
    /// Number of detections before filtering.
    pub total: usize,
    /// One entry per queried catalog. Catalogs skipped after the set emptied have none.
    pub steps: Vec<FiltrationStep>,
    /// Crossmatch radius that was used.
    pub tolerance_arcsec: f64,
}

/// Sequential multi-catalog filtration of the detections of a field.
pub struct CandidateReducer<'a> {
    service: &'a dyn CatalogService,
    catalogs: Vec<ReferenceCatalog>,
    radius_pixels: f64,
}

impl<'a> CandidateReducer<'a> {
    /// A reducer over the default catalog sequence with a 3 pixel radius.
    pub fn new(service: &'a dyn CatalogService) -> Self {
        Self {
            service,
            catalogs: ReferenceCatalog::DEFAULT_SEQUENCE.to_vec(),
            radius_pixels: 3.,
        }
    }

    /// Catalogs to apply, in priority order.
    pub fn with_catalogs(mut self, catalogs: Vec<ReferenceCatalog>) -> Self {
        self.catalogs = catalogs;
        self
    }

    /// Crossmatch tolerance in pixels.
    pub fn with_radius_pixels(mut self, radius_pixels: f64) -> Self {
        self.radius_pixels = radius_pixels;
        self
    }

    /// Filter `detections` against every catalog in turn.
    ///
    /// Stops querying as soon as no candidate is left. A failing query aborts the reduction.
    pub fn reduce(&self, detections: Vec<Detection>, tolerance_arcsec: f64) -> Result<Reduction> {
        let total = detections.len();
        let mut candidates = CandidateSet::new(detections);
        let mut steps = Vec::with_capacity(self.catalogs.len());

        info!("Crossmatching sources with catalogs.");
        info!(
            "Radius used for crossmatching with catalogs: {:.2} arcseconds",
            tolerance_arcsec
        );

        for catalog in &self.catalogs {
            if candidates.is_empty() {
                debug!("No candidates left, skipping {catalog}.");
                break;
            }

            let matches = self
                .service
                .crossmatch(&candidates.positions(), catalog, tolerance_arcsec, None)?;
            let matched = matches.iter().map(|m| m.index).collect::<BTreeSet<_>>();
            if let Some(&index) = matched.iter().next_back().filter(|&&i| i >= candidates.len()) {
                return Err(Error::CatalogQuery {
                    catalog: catalog.to_string(),
                    reason: format!("match refers to unknown candidate {index}"),
                });
            }

            let removed = candidates.remove_matched(&matched);
            info!(
                "{}/{} candidates left after crossmatching with {}",
                candidates.len(),
                total,
                catalog
            );
            steps.push(FiltrationStep {
                catalog: catalog.clone(),
                matched: removed,
                remaining: candidates.len(),
            });
        }

        Ok(Reduction {
            candidates,
            total,
            steps,
            tolerance_arcsec,
        })
    }

    /// Assemble the catalogs of the files of `table` and reduce them.
    ///
    /// The image dimensions come from the original image of the field, the pixel scale from
    /// the first processed file, which carries the astrometric solution. Both are required.
    pub fn reduce_field(&self, table: &ImageTable, files: &[FileCatalog]) -> Result<Reduction> {
        let field = &table.field;
        let original = fits::read_header(&field.path)?;
        let geometry = QuadrantGeometry::from_header(&original, &field.path, table.grid)?;

        let scale = match table.entries.first() {
            Some(entry) if entry.path != field.path => pixel_scale(&fits::read_header(&entry.path)?, &entry.path)?,
            _ => pixel_scale(&original, &field.path)?,
        };

        let detections = assemble(files, &geometry);
        debug!(
            "{} detections in {} files of {}.",
            detections.len(),
            files.len(),
            field.name
        );
        self.reduce(detections, tolerance_arcsec(self.radius_pixels, scale))
    }
}

/// Paths of the candidate table and its RA/Dec companion for `field`.
pub fn candidate_paths(field: &Field, output_dir: &Path) -> (PathBuf, PathBuf) {
    (
        output_dir.join(format!("{}.oc", field.name)),
        output_dir.join(format!("{}_oc_RADEC", field.name)),
    )
}

/// Write the candidates of `field` to `<name>.oc` and `<name>_oc_RADEC` in `output_dir`.
pub fn persist(candidates: &CandidateSet, field: &Field, output_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let (oc, radec) = candidate_paths(field, output_dir);
    let table = candidate_table(candidates.detections());
    table.write(&oc)?;
    if let Some(positions) = table.select(&RADEC_COLUMNS) {
        positions.write(&radec)?;
    }

    let per_quadrant = candidates
        .detections()
        .iter()
        .counts_by(|d| d.quadrant)
        .into_iter()
        .sorted()
        .map(|(quadrant, n)| format!("{quadrant}: {n}"))
        .join(", ");
    info!(
        "{} candidates written to {} ({}).",
        candidates.len(),
        oc.display(),
        if per_quadrant.is_empty() { "none" } else { per_quadrant.as_str() }
    );
    Ok((oc, radec))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use approx::assert_abs_diff_eq;
    use nalgebra::Vector2;
    use ndarray::Array2;
    use rand::Rng;

    use super::*;
    use crate::crossmatch::{CatalogMatch, CatalogStar, LocalCatalog, LocalCatalogs};
    use crate::fits::{Header, HeaderValue};
    use crate::partition::{Grid, QuadrantLabel, partition};

    /// Matches fixed candidate indices per catalog and records every query.
    struct Scripted {
        matches: Vec<(ReferenceCatalog, Vec<usize>)>,
        queries: Mutex<Vec<(ReferenceCatalog, usize)>>,
    }

    impl Scripted {
        fn new(matches: Vec<(ReferenceCatalog, Vec<usize>)>) -> Self {
            Self {
                matches,
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<(ReferenceCatalog, usize)> {
            self.queries.lock().unwrap().clone()
        }
    }

    impl CatalogService for Scripted {
        fn crossmatch(
            &self,
            positions: &[QueryPosition],
            catalog: &ReferenceCatalog,
            _radius_arcsec: f64,
            _magnitude_column: Option<&str>,
        ) -> Result<Vec<CatalogMatch>> {
            self.queries.lock().unwrap().push((catalog.clone(), positions.len()));
            let indices = self
                .matches
                .iter()
                .find(|(c, _)| c == catalog)
                .map(|(_, i)| i.clone())
                .unwrap_or_default();
            // Every matched index twice, as for two catalog stars near one source.
            Ok(indices
                .into_iter()
                .flat_map(|index| {
                    [0.1, 0.2].map(|separation_arcsec| CatalogMatch {
                        index,
                        separation_arcsec,
                        magnitude: None,
                    })
                })
                .collect())
        }
    }

    fn source(x: f64, y: f64, ra: f64, dec: f64) -> SkySource {
        SkySource {
            position: Vector2::new(x, y),
            ra,
            dec,
            mag: -10.,
            mag_err: 0.01,
        }
    }

    fn whole(sources: Vec<SkySource>) -> Vec<FileCatalog> {
        vec![FileCatalog {
            entry: ImageEntry {
                path: PathBuf::from("field.fits"),
                quadrant: QuadrantLabel::Whole,
            },
            sources,
        }]
    }

    fn three_detections() -> Vec<Detection> {
        let files = whole(vec![
            source(10., 10., 100.0, 20.0),
            source(20., 20., 100.1, 20.1),
            source(30., 30., 100.2, 20.2),
        ]);
        assemble(&files, &QuadrantGeometry::new(100, 100, Grid::default()))
    }

    #[test]
    fn single_match_is_removed_and_reindexed() {
        let service = Scripted::new(vec![(ReferenceCatalog::GaiaDr2, vec![1])]);
        let reduction = CandidateReducer::new(&service)
            .with_catalogs(vec![ReferenceCatalog::GaiaDr2])
            .reduce(three_detections(), 1.)
            .unwrap();

        let candidates = reduction.candidates.detections();
        assert_eq!(candidates.iter().map(|d| d.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(candidates[0].global, Vector2::new(10., 10.));
        assert_eq!(candidates[1].global, Vector2::new(30., 30.));
        assert_eq!(reduction.steps[0].matched, 1);
        assert_eq!(reduction.total, 3);
    }

    #[test]
    fn quadrant_offsets() {
        let geometry = QuadrantGeometry::new(2048, 1024, Grid::square(2).unwrap());
        let files = Grid::square(2)
            .unwrap()
            .labels()
            .into_iter()
            .map(|quadrant| FileCatalog {
                entry: ImageEntry {
                    path: PathBuf::from(format!("field_{quadrant}.fits")),
                    quadrant,
                },
                sources: vec![source(5., 7., 10., 10.)],
            })
            .collect::<Vec<_>>();

        let detections = assemble(&files, &geometry);
        assert_eq!(detections.len(), 4);
        assert_eq!(detections[2].quadrant.to_string(), "Q3_1_0");
        assert_eq!(detections[2].index, 2);
        assert_eq!(detections[2].global, Vector2::new(5., 7. + 512.));
        assert_eq!(detections[2].local, Vector2::new(5., 7.));
        assert_eq!(detections[1].global, Vector2::new(5. + 1024., 7.));
        for d in &detections {
            assert_eq!(d.global - d.local, geometry.offset(&d.quadrant));
        }
    }

    #[test]
    fn whole_image_has_no_offset() {
        for d in three_detections() {
            assert_eq!(d.global, d.local);
        }
    }

    #[test]
    fn file_catalog_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let entry = ImageEntry {
            path: dir.path().join("tile 42_Q2.fits"),
            quadrant: "Q2_0_1".parse().unwrap(),
        };
        let sources = vec![source(5.25, 7.5, 100.125, -20.5), source(1., 2., 100.2, -20.25)];
        crate::projection::write_sky_catalog(&entry.path, &sources).unwrap();

        let catalog = FileCatalog::read(entry.clone()).unwrap();
        assert_eq!(catalog.entry, entry);
        assert_eq!(catalog.sources, sources);

        let missing = ImageEntry {
            path: dir.path().join("tile42_Q3.fits"),
            ..entry
        };
        assert!(matches!(FileCatalog::read(missing), Err(Error::Io(_))));
    }

    #[test]
    fn tolerance_conversion() {
        assert_abs_diff_eq!(tolerance_arcsec(3., 0.0001543390), 1.6668612, epsilon = 1e-6);
    }

    #[test]
    fn sizes_never_increase() {
        let mut rng = rand::rng();
        let detections = (0..200)
            .map(|i| source(i as f64, i as f64, rng.random_range(0. ..1.), rng.random_range(-1. ..1.)))
            .collect::<Vec<_>>();
        let detections = assemble(&whole(detections), &QuadrantGeometry::new(200, 200, Grid::default()));

        let catalogs = ReferenceCatalog::DEFAULT_SEQUENCE.to_vec();
        let service = Scripted::new(
            catalogs
                .iter()
                .map(|c| (c.clone(), (0..40).map(|_| rng.random_range(0..100)).collect()))
                .collect(),
        );
        let reduction = CandidateReducer::new(&service)
            .with_catalogs(catalogs)
            .reduce(detections, 1.)
            .unwrap();

        let mut before = reduction.total;
        for step in &reduction.steps {
            assert!(step.remaining <= before);
            assert_eq!(step.remaining + step.matched, before);
            before = step.remaining;
        }
        let indices = reduction.candidates.detections().iter().map(|d| d.index);
        assert!(indices.eq(0..reduction.candidates.len()));
    }

    #[test]
    fn catalog_without_matches_keeps_the_set() {
        let service = Scripted::new(Vec::new());
        let reduction = CandidateReducer::new(&service)
            .with_catalogs(vec![ReferenceCatalog::Gsc])
            .reduce(three_detections(), 1.)
            .unwrap();
        assert_eq!(reduction.candidates.len(), 3);
        assert_eq!(reduction.candidates.into_detections(), three_detections());
    }

    #[test]
    fn stops_querying_when_empty() {
        let service = Scripted::new(vec![(ReferenceCatalog::Ps1Dr1, vec![0, 1, 2])]);
        let reduction = CandidateReducer::new(&service)
            .reduce(three_detections(), 1.)
            .unwrap();

        assert!(reduction.candidates.is_empty());
        assert_eq!(reduction.steps.len(), 2);
        assert_eq!(
            service.queries(),
            vec![(ReferenceCatalog::GaiaDr2, 3), (ReferenceCatalog::Ps1Dr1, 3)]
        );
    }

    #[test]
    fn matched_candidates_are_not_queried_again() {
        let service = Scripted::new(vec![(ReferenceCatalog::GaiaDr2, vec![0])]);
        CandidateReducer::new(&service)
            .with_catalogs(vec![ReferenceCatalog::GaiaDr2, ReferenceCatalog::UsnoB1])
            .reduce(three_detections(), 1.)
            .unwrap();
        assert_eq!(service.queries()[1], (ReferenceCatalog::UsnoB1, 2));
    }

    #[test]
    fn unknown_index_is_a_query_error() {
        let service = Scripted::new(vec![(ReferenceCatalog::GaiaDr2, vec![7])]);
        let result = CandidateReducer::new(&service).reduce(three_detections(), 1.);
        assert!(matches!(result, Err(Error::CatalogQuery { .. })));
    }

    fn write_field(dir: &Path, header: &Header) -> Field {
        let path = dir.join("tile42.fits");
        fits::write_image(&path, header, Array2::zeros((4, 8)).view()).unwrap();
        Field::new(path)
    }

    fn scaled_header() -> Header {
        let mut header = Header::default();
        header.set("CDELT1", HeaderValue::Float(-0.0001543390));
        header
    }

    #[test]
    fn field_reduction_with_local_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let field = write_field(dir.path(), &scaled_header());
        let table = partition(&field, Grid::square(2).unwrap(), &dir.path().join("out")).unwrap();

        let files = table
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| FileCatalog {
                entry: entry.clone(),
                sources: vec![source(1., 1., 10. + i as f64 * 0.01, 20.)],
            })
            .collect::<Vec<_>>();
        // 1.2 arcsec from the second source, outside the tolerance of the first.
        let catalog = LocalCatalog::new(vec![CatalogStar {
            ra: 10.01,
            dec: 20. + 1.2 / 3600.,
            magnitude: None,
        }]);
        let service = LocalCatalogs::new().with_catalog(ReferenceCatalog::GaiaDr2, catalog);

        let reduction = CandidateReducer::new(&service)
            .with_catalogs(vec![ReferenceCatalog::GaiaDr2])
            .reduce_field(&table, &files)
            .unwrap();

        assert_abs_diff_eq!(reduction.tolerance_arcsec, 1.6668612, epsilon = 1e-6);
        let quadrants = reduction
            .candidates
            .detections()
            .iter()
            .map(|d| d.quadrant.to_string())
            .collect::<Vec<_>>();
        assert_eq!(quadrants, vec!["Q1_0_0", "Q3_1_0", "Q4_1_1"]);
        assert_eq!(reduction.candidates.detections()[2].global, Vector2::new(5., 3.));
    }

    #[test]
    fn missing_keys_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let field = write_field(dir.path(), &Header::default());
        let table = partition(&field, Grid::default(), &dir.path().join("out")).unwrap();
        let service = Scripted::new(Vec::new());

        let result = CandidateReducer::new(&service).reduce_field(&table, &[]);
        match result {
            Err(Error::MissingHeaderKey { keys, .. }) => {
                assert_eq!(keys, vec!["CDELT1", "_DELT1", "CD1_1"]);
            }
            other => panic!("expected a missing key, got {other:?}"),
        }
        assert!(service.queries().is_empty());
    }

    #[test]
    fn persisted_output_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let field = Field::new(dir.path().join("tile42.fits"));
        let service = Scripted::new(vec![(ReferenceCatalog::GaiaDr2, vec![1])]);
        let reducer = CandidateReducer::new(&service);

        let first = reducer.reduce(three_detections(), 1.).unwrap();
        let (oc, radec) = persist(&first.candidates, &field, dir.path()).unwrap();
        let written = std::fs::read(&oc).unwrap();

        let second = reducer.reduce(three_detections(), 1.).unwrap();
        persist(&second.candidates, &field, dir.path()).unwrap();
        assert_eq!(std::fs::read(&oc).unwrap(), written);

        assert_eq!(oc, dir.path().join("tile42.oc"));
        assert_eq!(radec, dir.path().join("tile42_oc_RADEC"));
        let radec = std::fs::read_to_string(radec).unwrap();
        assert!(radec.starts_with("# _RAJ2000 _DEJ2000\n100.00000000 20.00000000\n"));
    }
}
