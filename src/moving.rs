//! Removal of candidates coincident with known solar system objects, found with SkyBoT.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use kiddo::float::{distance::SquaredEuclidean, kdtree::KdTree};
use log::{debug, info};
use ureq::Agent;

use crate::crossmatch::{squared_chord, unit_vector};
use crate::error::{Error, Result};
use crate::fits::Header;
use crate::partition::Field;
use crate::reducer::CandidateSet;
use crate::table::AsciiTable;

/// Julian date of the Unix epoch.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Pointing and timing of an exposure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    /// Field centre in degrees.
    pub ra: f64,
    /// Degrees.
    pub dec: f64,
    /// Start of the exposure, UTC.
    pub start: NaiveDateTime,
    /// Exposure time in seconds.
    pub exposure: f64,
}

impl Observation {
    /// Read the field centre from `CRVAL1/2`, the start from `DATE-OBS` or `DATE-GPS` and the
    /// exposure time from `EXPOSURE` or `EXPTIME`.
    pub fn from_header(header: &Header, path: &Path) -> Result<Self> {
        let ra = header.require_f64(path, &["CRVAL1"])?;
        let dec = header.require_f64(path, &["CRVAL2"])?;
        let exposure = header.require_f64(path, &["EXPOSURE", "EXPTIME"])?;

        let date_keys = ["DATE-OBS", "DATE-GPS"];
        let date = date_keys
            .iter()
            .find_map(|k| header.get_str(k))
            .ok_or_else(|| Error::missing_key(path, &date_keys))?;
        let start = parse_date(date)
            .ok_or_else(|| Error::fits(path, format!("cannot parse observation date `{date}`")))?;

        Ok(Self {
            ra,
            dec,
            start,
            exposure,
        })
    }

    /// Julian date at the middle of the exposure.
    pub fn mid_exposure_jd(&self) -> f64 {
        let mid = self.start + TimeDelta::milliseconds((self.exposure * 500.).round() as i64);
        let utc = mid.and_utc();
        UNIX_EPOCH_JD + (utc.timestamp() as f64 + utc.timestamp_subsec_nanos() as f64 * 1e-9) / 86_400.
    }
}

fn parse_date(date: &str) -> Option<NaiveDateTime> {
    let date = date.trim().trim_end_matches('Z');
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(date, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(date).ok().map(|d| d.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// A solar system object at the observation epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct MovingObject {
    /// Designation, e.g. `Ceres`.
    pub name: String,
    /// Degrees.
    pub ra: f64,
    /// Degrees.
    pub dec: f64,
}

/// Positions of known solar system objects.
pub trait EphemerisService {
    /// Known objects within `radius_deg` of the field centre during `observation`.
    fn cone_search(&self, observation: &Observation, radius_deg: f64) -> Result<Vec<MovingObject>>;
}

/// Blocking client of the IMCCE SkyBoT cone search.
pub struct SkybotClient {
    agent: Agent,
    url: String,
    /// IAU observatory code.
    observer: String,
}

impl SkybotClient {
    /// Cone search endpoint of IMCCE.
    pub const DEFAULT_URL: &'static str = "http://vo.imcce.fr/webservices/skybot/skybotconesearch_query.php";

    /// A geocentric client of the service at `url`.
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            url: url.to_string(),
            observer: "500".to_string(),
        }
    }

    /// Set the IAU observatory code, geocentric (`500`) by default.
    pub fn with_observer(mut self, code: &str) -> Self {
        self.observer = code.to_string();
        self
    }
}

impl EphemerisService for SkybotClient {
    fn cone_search(&self, observation: &Observation, radius_deg: f64) -> Result<Vec<MovingObject>> {
        let query_error = |reason: String| Error::CatalogQuery {
            catalog: "SkyBoT".to_string(),
            reason,
        };
        let epoch = observation.mid_exposure_jd();
        debug!(
            "SkyBoT cone search at ({:.5}, {:.5}), radius {radius_deg} deg, JD {epoch:.6}.",
            observation.ra, observation.dec
        );

        let response = self
            .agent
            .get(&self.url)
            .query("-ep", format!("{epoch:.6}"))
            .query("-ra", format!("{:.6}", observation.ra))
            .query("-dec", format!("{:.6}", observation.dec))
            .query("-rd", format!("{radius_deg}"))
            .query("-mime", "text")
            .query("-output", "basic")
            .query("-loc", &self.observer)
            .call()
            .map_err(|e: ureq::Error| query_error(e.to_string()))?;
        let text = response
            .into_body()
            .read_to_string()
            .map_err(|e| query_error(e.to_string()))?;
        parse_skybot(&text).map_err(query_error)
    }
}

/// Parse the pipe separated text output of SkyBoT.
///
/// Comment lines start with `#`; rows are `Num | Name | RA(h) | DE(deg) | ...` with
/// sexagesimal coordinates.
pub fn parse_skybot(text: &str) -> std::result::Result<Vec<MovingObject>, String> {
    let mut objects = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            if let Some(flag) = line.strip_prefix("# Flag:") {
                if flag.trim() == "-1" {
                    return Err("SkyBoT reported an error".to_string());
                }
            }
            continue;
        }
        let fields = line.split('|').map(str::trim).collect::<Vec<_>>();
        let [_, name, ra, dec, ..] = fields[..] else {
            return Err(format!("unexpected line `{line}`"));
        };
        let ra = sexagesimal(ra).ok_or_else(|| format!("bad right ascension `{ra}`"))? * 15.;
        let dec = sexagesimal(dec).ok_or_else(|| format!("bad declination `{dec}`"))?;
        objects.push(MovingObject {
            name: name.to_string(),
            ra,
            dec,
        });
    }
    Ok(objects)
}

/// `dd mm ss.s` or `dd:mm:ss.s` (or a plain number) to decimal units, keeping the sign of `-00`.
fn sexagesimal(value: &str) -> Option<f64> {
    let value = value.trim();
    let negative = value.starts_with('-');
    let parts = value
        .trim_start_matches(['-', '+'])
        .split([' ', ':'])
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let magnitude = parts
        .iter()
        .zip([1., 60., 3600.])
        .map(|(v, d)| v / d)
        .sum::<f64>();
    Some(if negative { -magnitude } else { magnitude })
}

/// Remove candidates within `radius_arcsec` of any object. Survivors are reindexed.
///
/// Returns the filtered set and the number of removed candidates.
pub fn filter_moving_objects(
    candidates: CandidateSet,
    objects: &[MovingObject],
    radius_arcsec: f64,
) -> (CandidateSet, usize) {
    let before = candidates.len();
    if objects.is_empty() || candidates.is_empty() {
        return (candidates, 0);
    }

    let tree: KdTree<f64, usize, 3, 32, u32> = objects
        .iter()
        .enumerate()
        .map(|(i, o)| (unit_vector(o.ra, o.dec), i))
        .collect();
    let radius = squared_chord(radius_arcsec);

    let kept = candidates
        .into_detections()
        .into_iter()
        .filter(|d| {
            tree.within_unsorted::<SquaredEuclidean>(&unit_vector(d.ra, d.dec), radius)
                .is_empty()
        })
        .collect::<Vec<_>>();
    let kept = CandidateSet::new(kept);
    let removed = before - kept.len();
    info!("{removed} match with a moving object found");
    (kept, removed)
}

/// Write the objects to `<field>_moving_objects.dat` in `output_dir`.
pub fn write_moving_objects(objects: &[MovingObject], field: &Field, output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join(format!("{}_moving_objects.dat", field.name));
    let mut table = AsciiTable::new(&["Name", "RA", "DEC"]);
    for o in objects {
        table.push_row(vec![o.name.clone(), format!("{:.6}", o.ra), format!("{:.6}", o.dec)]);
    }
    table.write(&path)?;
    debug!("{} known objects written to {}.", objects.len(), path.display());
    Ok(path)
}
