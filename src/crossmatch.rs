//! Crossmatching positions against reference catalogs.
//!
//! [`XMatchClient`] queries the CDS XMatch service over HTTP, [`LocalCatalog`] matches against
//! stars held in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiddo::float::{distance::SquaredEuclidean, kdtree::KdTree};
use log::debug;
use serde::{Deserialize, Serialize};
use ureq::Agent;

use crate::error::{Error, Result};

/// A reference catalog, identified by its VizieR table name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReferenceCatalog {
    /// Gaia DR2, `I/345/gaia2`.
    GaiaDr2,
    /// Pan-STARRS1 DR1, `II/349/ps1`.
    Ps1Dr1,
    /// Guide Star Catalog 2.2, `I/271/out`.
    Gsc,
    /// USNO-B1.0, `I/284/out`.
    UsnoB1,
    /// Any other VizieR table.
    Custom(String),
}

impl ReferenceCatalog {
    /// Catalogs applied by default, most authoritative astrometry first.
    pub const DEFAULT_SEQUENCE: [ReferenceCatalog; 4] = [
        ReferenceCatalog::GaiaDr2,
        ReferenceCatalog::Ps1Dr1,
        ReferenceCatalog::Gsc,
        ReferenceCatalog::UsnoB1,
    ];

    /// VizieR identifier, e.g. `I/345/gaia2`.
    pub fn id(&self) -> &str {
        match self {
            ReferenceCatalog::GaiaDr2 => "I/345/gaia2",
            ReferenceCatalog::Ps1Dr1 => "II/349/ps1",
            ReferenceCatalog::Gsc => "I/271/out",
            ReferenceCatalog::UsnoB1 => "I/284/out",
            ReferenceCatalog::Custom(id) => id,
        }
    }

    /// Default magnitude column.
    pub fn magnitude_column(&self) -> Option<&str> {
        match self {
            ReferenceCatalog::GaiaDr2 => Some("phot_g_mean_mag"),
            ReferenceCatalog::Ps1Dr1 => Some("rmag"),
            ReferenceCatalog::Gsc => Some("Vmag"),
            ReferenceCatalog::UsnoB1 => Some("R1mag"),
            ReferenceCatalog::Custom(_) => None,
        }
    }
}

impl From<String> for ReferenceCatalog {
    fn from(id: String) -> Self {
        match id.as_str() {
            "I/345/gaia2" => ReferenceCatalog::GaiaDr2,
            "II/349/ps1" => ReferenceCatalog::Ps1Dr1,
            "I/271/out" => ReferenceCatalog::Gsc,
            "I/284/out" => ReferenceCatalog::UsnoB1,
            _ => ReferenceCatalog::Custom(id),
        }
    }
}

impl From<ReferenceCatalog> for String {
    fn from(catalog: ReferenceCatalog) -> Self {
        catalog.id().to_string()
    }
}

impl fmt::Display for ReferenceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceCatalog::GaiaDr2 => write!(f, "GAIA DR2"),
            ReferenceCatalog::Ps1Dr1 => write!(f, "PS1 DR1"),
            ReferenceCatalog::Gsc => write!(f, "GSC"),
            ReferenceCatalog::UsnoB1 => write!(f, "USNO-B1"),
            ReferenceCatalog::Custom(id) => write!(f, "{id}"),
        }
    }
}

/// A position sent to a catalog service, keyed by the caller's index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryPosition {
    /// Caller defined key, returned with each match.
    pub index: usize,
    /// Degrees.
    pub ra: f64,
    /// Degrees.
    pub dec: f64,
}

/// One catalog entry within the radius of a query position.
///
/// A query position may appear in several matches.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CatalogMatch {
    /// Index of the matched [`QueryPosition`].
    pub index: usize,
    /// Distance between query position and catalog entry.
    pub separation_arcsec: f64,
    /// Value of the requested magnitude column, if any.
    pub magnitude: Option<f64>,
}

/// Crossmatching against a reference catalog.
pub trait CatalogService: Sync {
    /// All catalog entries within `radius_arcsec` of any of `positions`.
    ///
    /// `magnitude_column` selects the catalog magnitude returned with each match.
    fn crossmatch(
        &self,
        positions: &[QueryPosition],
        catalog: &ReferenceCatalog,
        radius_arcsec: f64,
        magnitude_column: Option<&str>,
    ) -> Result<Vec<CatalogMatch>>;
}

/// Blocking client of the CDS XMatch API.
pub struct XMatchClient {
    agent: Agent,
    url: String,
}

impl XMatchClient {
    /// Synchronous endpoint of the public service.
    pub const DEFAULT_URL: &'static str = "http://cdsxmatch.u-strasbg.fr/xmatch/api/v1/sync";

    /// Client of the service at `url`, giving up on requests after `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            url: url.to_string(),
        }
    }
}

impl Default for XMatchClient {
    fn default() -> Self {
        Self::new(Self::DEFAULT_URL, Duration::from_secs(300))
    }
}

const BOUNDARY: &str = "otdetect-xmatch-boundary";

/// `multipart/form-data` body uploading `positions` as `cat1`.
fn multipart_body(positions: &[QueryPosition], catalog: &ReferenceCatalog, radius_arcsec: f64) -> String {
    let mut upload = String::from("idx,ra,dec\n");
    for p in positions {
        let _ = writeln!(upload, "{},{:.8},{:.8}", p.index, p.ra, p.dec);
    }

    let fields = [
        ("request", "xmatch".to_string()),
        ("distMaxArcsec", format!("{radius_arcsec}")),
        ("RESPONSEFORMAT", "csv".to_string()),
        ("colRA1", "ra".to_string()),
        ("colDec1", "dec".to_string()),
        ("cat2", format!("vizier:{}", catalog.id())),
    ];
    let mut body = String::new();
    for (name, value) in fields {
        let _ = write!(
            body,
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        );
    }
    let _ = write!(
        body,
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"cat1\"; filename=\"cat1.csv\"\r\n\
         Content-Type: text/csv\r\n\r\n{upload}\r\n--{BOUNDARY}--\r\n"
    );
    body
}

impl CatalogService for XMatchClient {
    fn crossmatch(
        &self,
        positions: &[QueryPosition],
        catalog: &ReferenceCatalog,
        radius_arcsec: f64,
        magnitude_column: Option<&str>,
    ) -> Result<Vec<CatalogMatch>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let query_error = |reason: String| Error::CatalogQuery {
            catalog: catalog.to_string(),
            reason,
        };

        debug!(
            "Crossmatching {} positions with {} ({}) within {:.2} arcsec.",
            positions.len(),
            catalog,
            catalog.id(),
            radius_arcsec
        );
        let body = multipart_body(positions, catalog, radius_arcsec);
        let response = self
            .agent
            .post(&self.url)
            .header("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .send(body.as_bytes())
            .map_err(|e: ureq::Error| query_error(e.to_string()))?;

        let text = response
            .into_body()
            .read_to_string()
            .map_err(|e| query_error(e.to_string()))?;
        parse_xmatch_csv(&text, magnitude_column).map_err(query_error)
    }
}

/// Parse the CSV returned by XMatch: `angDist`, the uploaded columns, then the catalog columns.
pub fn parse_xmatch_csv(text: &str, magnitude_column: Option<&str>) -> std::result::Result<Vec<CatalogMatch>, String> {
    let mut reader = csv::ReaderBuilder::new().from_reader(text.as_bytes());
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| format!("response has no column {name}"))
    };
    let distance = column("angDist")?;
    let index = column("idx")?;
    let magnitude = magnitude_column.and_then(|name| headers.iter().position(|h| h == name));

    reader
        .records()
        .map(|record| {
            let record = record.map_err(|e| e.to_string())?;
            let field = |i: usize| record.get(i).unwrap_or("").trim();
            Ok(CatalogMatch {
                index: field(index)
                    .parse()
                    .map_err(|_| format!("bad idx `{}`", field(index)))?,
                separation_arcsec: field(distance)
                    .parse()
                    .map_err(|_| format!("bad angDist `{}`", field(distance)))?,
                magnitude: magnitude.and_then(|i| field(i).parse().ok()),
            })
        })
        .collect()
}

/// A catalog star.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CatalogStar {
    /// Degrees.
    pub ra: f64,
    /// Degrees.
    pub dec: f64,
    /// Magnitude used for photometric calibration.
    pub magnitude: Option<f64>,
}

/// Unit vector of a position given in degrees.
pub(crate) fn unit_vector(ra: f64, dec: f64) -> [f64; 3] {
    let (ra, dec) = (ra.to_radians(), dec.to_radians());
    [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
}

/// Squared chord length between two unit vectors separated by `arcsec`.
pub(crate) fn squared_chord(arcsec: f64) -> f64 {
    let chord = 2. * ((arcsec / 3600.).to_radians() / 2.).sin();
    chord * chord
}

/// Angular separation in arcseconds of two unit vectors with squared chord `chord2`.
pub(crate) fn chord_to_arcsec(chord2: f64) -> f64 {
    (2. * (chord2.sqrt() / 2.).min(1.).asin()).to_degrees() * 3600.
}

/// Stars of one catalog indexed in a k-d tree over unit vectors.
pub struct LocalCatalog {
    stars: Vec<CatalogStar>,
    tree: KdTree<f64, usize, 3, 32, u32>,
}

impl LocalCatalog {
    /// Index `stars`.
    pub fn new(stars: Vec<CatalogStar>) -> Self {
        let tree = stars
            .iter()
            .enumerate()
            .map(|(i, s)| (unit_vector(s.ra, s.dec), i))
            .collect();
        Self { stars, tree }
    }

    /// Read a CSV file with `ra` and `dec` columns in degrees and an optional `mag` column.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path).map_err(|e| Error::catalog(path, e.to_string()))?;
        let headers = reader.headers().map_err(|e| Error::catalog(path, e.to_string()))?.clone();
        let column = |name: &str| headers.iter().position(|h| h.trim() == name);
        let (ra, dec) = column("ra")
            .zip(column("dec"))
            .ok_or_else(|| Error::catalog(path, "expected ra and dec columns"))?;
        let mag = column("mag");

        let stars = reader
            .records()
            .enumerate()
            .map(|(row, record)| {
                let record = record.map_err(|e| Error::catalog(path, e.to_string()))?;
                let value = |i: usize| record.get(i).and_then(|v| v.trim().parse::<f64>().ok());
                Ok(CatalogStar {
                    ra: value(ra).ok_or_else(|| Error::catalog(path, format!("row {}: bad ra", row + 1)))?,
                    dec: value(dec).ok_or_else(|| Error::catalog(path, format!("row {}: bad dec", row + 1)))?,
                    magnitude: mag.and_then(value),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(stars))
    }

    /// Number of stars.
    pub fn len(&self) -> usize {
        self.stars.len()
    }

    /// Whether the catalog has no star.
    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    /// Matches of `positions` within `radius_arcsec`, ordered by query index then separation.
    pub fn matches(&self, positions: &[QueryPosition], radius_arcsec: f64) -> Vec<CatalogMatch> {
        let radius = squared_chord(radius_arcsec);
        positions
            .iter()
            .flat_map(|p| {
                let mut found = self
                    .tree
                    .within_unsorted::<SquaredEuclidean>(&unit_vector(p.ra, p.dec), radius)
                    .into_iter()
                    .map(|m| CatalogMatch {
                        index: p.index,
                        separation_arcsec: chord_to_arcsec(m.distance),
                        magnitude: self.stars[m.item].magnitude,
                    })
                    .collect::<Vec<_>>();
                found.sort_by(|a, b| a.separation_arcsec.total_cmp(&b.separation_arcsec));
                found
            })
            .collect()
    }
}

/// In-memory catalogs, one per [`ReferenceCatalog`].
#[derive(Default)]
pub struct LocalCatalogs {
    catalogs: Vec<(ReferenceCatalog, LocalCatalog)>,
}

impl LocalCatalogs {
    /// No catalog loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `catalog` under `id`, replacing a catalog loaded earlier under the same id.
    pub fn with_catalog(mut self, id: ReferenceCatalog, catalog: LocalCatalog) -> Self {
        self.catalogs.retain(|(c, _)| *c != id);
        self.catalogs.push((id, catalog));
        self
    }

    /// Read one CSV file per catalog, keyed by catalog identifier.
    pub fn load(files: &BTreeMap<String, PathBuf>) -> Result<Self> {
        files.iter().try_fold(Self::new(), |catalogs, (id, path)| {
            let catalog = LocalCatalog::from_csv(path)?;
            debug!("Loaded {} stars of {id} from {}.", catalog.len(), path.display());
            Ok(catalogs.with_catalog(ReferenceCatalog::from(id.clone()), catalog))
        })
    }
}

impl CatalogService for LocalCatalogs {
    fn crossmatch(
        &self,
        positions: &[QueryPosition],
        catalog: &ReferenceCatalog,
        radius_arcsec: f64,
        _magnitude_column: Option<&str>,
    ) -> Result<Vec<CatalogMatch>> {
        let (_, local) = self
            .catalogs
            .iter()
            .find(|(id, _)| id == catalog)
            .ok_or_else(|| Error::CatalogQuery {
                catalog: catalog.to_string(),
                reason: "catalog not loaded".to_string(),
            })?;
        Ok(local.matches(positions, radius_arcsec))
    }
}
