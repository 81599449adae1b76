//! # Coordinate Projection
//!
//! Conversion between geographic WGS84 coordinates and the projected (metric)
//! reference systems used for distance math. Transforms are delegated to PROJ
//! through the `proj` crate, so any CRS the PROJ database knows is accepted:
//! `EPSG:2039` (Israeli TM Grid), `EPSG:2100` (Greek Grid), UTM zones,
//! national grids and so on.
//!
//! Building a PROJ transformation looks up the database and picks an
//! operation, so projectors are reused through a small [`ProjectorCache`].

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;

use geo::{Coord, LineString};
use lru::LruCache;
use proj::Proj;

use crate::error::{LinkMonitorError, Result};

/// Maximum number of projector pairs kept per cache.
pub const PROJECTOR_CACHE_SIZE: usize = 4;

/// Default projected CRS for distance computations.
pub const DEFAULT_METRIC_CRS: &str = "EPSG:2039";

/// Default CRS for reference geometries and decoded polylines.
pub const GEOGRAPHIC_CRS: &str = "EPSG:4326";

/// Lon/lat points tried in turn when measuring the units of a CRS.
const UNIT_SAMPLE_POINTS: [(f64, f64); 5] = [(35.0, 32.0), (0.0, 0.0), (10.0, 50.0), (-100.0, 40.0), (120.0, -30.0)];

/// Latitude step for the unit check; about 111 m on the ground.
const UNIT_STEP_DEG: f64 = 0.001;

/// A coordinate reference system identifier known to PROJ.
///
/// Authority codes are normalized: `2039`, `epsg:2039` and `EPSG:2039` all
/// name the same system. Parsing checks the identifier against the PROJ
/// database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Crs(String);

impl Crs {
    /// WGS84 geographic, `EPSG:4326`.
    pub fn wgs84() -> Self {
        Crs(GEOGRAPHIC_CRS.to_string())
    }

    /// Israeli Transverse Mercator grid, `EPSG:2039`.
    pub fn israeli_tm() -> Self {
        Crs(DEFAULT_METRIC_CRS.to_string())
    }

    /// Normalized identifier, e.g. `EPSG:2039`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn normalize(s: &str) -> String {
        let s = s.trim();
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            return format!("EPSG:{}", s);
        }
        match s.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("epsg:") => format!("EPSG:{}", &s[5..]),
            _ => s.to_string(),
        }
    }

    /// Whether coordinates in this system are angular (degrees).
    ///
    /// A 0.001 degree step of latitude moves less than one unit in an
    /// angular system and about 111 units in a metre-based one.
    pub fn is_geographic(&self) -> Result<bool> {
        if self.0 == GEOGRAPHIC_CRS {
            return Ok(true);
        }
        let pj = Proj::new_known_crs(GEOGRAPHIC_CRS, &self.0, None)
            .map_err(|e| LinkMonitorError::projection(GEOGRAPHIC_CRS, &self.0, e.to_string()))?;
        for (lon, lat) in UNIT_SAMPLE_POINTS {
            let (Ok(a), Ok(b)) = (pj.convert((lon, lat)), pj.convert((lon, lat + UNIT_STEP_DEG))) else {
                continue;
            };
            let step = (b.0 - a.0).hypot(b.1 - a.1);
            if step.is_finite() {
                return Ok(step < 1.0);
            }
        }
        Err(LinkMonitorError::projection(
            GEOGRAPHIC_CRS,
            &self.0,
            "no sample point could be transformed to determine the coordinate units",
        ))
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Crs {
    type Err = LinkMonitorError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = Crs::normalize(s);
        if normalized.is_empty() {
            return Err(LinkMonitorError::config("crs", "is empty"));
        }
        Proj::new(&normalized).map_err(|e| {
            LinkMonitorError::config(
                "crs",
                format!("'{}' is not a coordinate reference system known to PROJ: {}", s, e),
            )
        })?;
        Ok(Crs(normalized))
    }
}

/// A ready-to-use transform between two reference systems.
///
/// Coordinates are always lon/lat (x/y) order regardless of the axis order
/// the authority declares.
pub struct Projector {
    from: Crs,
    to: Crs,
    // None when both ends are the same system
    inner: Option<Proj>,
}

impl fmt::Debug for Projector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projector")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("identity", &self.inner.is_none())
            .finish()
    }
}

impl Projector {
    /// Build a projector. PROJ picks the best available operation for the pair.
    pub fn new(from: Crs, to: Crs) -> Result<Self> {
        let inner = if from == to {
            None
        } else {
            let pj = Proj::new_known_crs(from.as_str(), to.as_str(), None).map_err(|e| {
                LinkMonitorError::projection(from.as_str(), to.as_str(), e.to_string())
            })?;
            Some(pj)
        };
        Ok(Self { from, to, inner })
    }

    pub fn from_crs(&self) -> &Crs {
        &self.from
    }

    pub fn to_crs(&self) -> &Crs {
        &self.to
    }

    fn fail(&self, message: String) -> LinkMonitorError {
        LinkMonitorError::projection(self.from.as_str(), self.to.as_str(), message)
    }

    /// Transform a single coordinate, failing on out-of-domain input.
    pub fn transform(&self, c: Coord<f64>) -> Result<Coord<f64>> {
        if !c.x.is_finite() || !c.y.is_finite() {
            return Err(self.fail(format!("non-finite input coordinate ({}, {})", c.x, c.y)));
        }
        let Some(pj) = &self.inner else {
            return Ok(c);
        };

        let (x, y) = pj
            .convert((c.x, c.y))
            .map_err(|e| self.fail(format!("({}, {}): {}", c.x, c.y, e)))?;
        if !x.is_finite() || !y.is_finite() {
            return Err(self.fail(format!(
                "transform of ({}, {}) produced a non-finite coordinate",
                c.x, c.y
            )));
        }
        Ok(Coord { x, y })
    }

    /// Transform every vertex of a line string.
    pub fn transform_line(&self, line: &LineString<f64>) -> Result<LineString<f64>> {
        let coords = line
            .0
            .iter()
            .map(|c| self.transform(*c))
            .collect::<Result<Vec<_>>>()?;
        Ok(LineString::new(coords))
    }
}

/// Bounded cache of projectors keyed by `(from, to)`.
///
/// `Proj` handles are not thread-safe, so each worker owns its own cache.
pub struct ProjectorCache {
    entries: LruCache<(Crs, Crs), Arc<Projector>>,
}

impl ProjectorCache {
    pub fn new() -> Self {
        Self::with_capacity(PROJECTOR_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Fetch (or build and insert) the projector for a CRS pair.
    pub fn get(&mut self, from: &Crs, to: &Crs) -> Result<Arc<Projector>> {
        self.entries
            .try_get_or_insert((from.clone(), to.clone()), || {
                Projector::new(from.clone(), to.clone()).map(Arc::new)
            })
            .cloned()
    }

    /// Convenience: project a line between two reference systems.
    pub fn project(&mut self, line: &LineString<f64>, from: &Crs, to: &Crs) -> Result<LineString<f64>> {
        self.get(from, to)?.transform_line(line)
    }

    pub fn contains(&self, from: &Crs, to: &Crs) -> bool {
        self.entries.contains(&(from.clone(), to.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ProjectorCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Project a line between CRS identifiers without a cache.
pub fn project(line: &LineString<f64>, from: &str, to: &str) -> Result<LineString<f64>> {
    let from: Crs = from.parse()?;
    let to: Crs = to.parse()?;
    Projector::new(from, to)?.transform_line(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wgs(lon: f64, lat: f64) -> Coord<f64> {
        Coord { x: lon, y: lat }
    }

    fn crs(s: &str) -> Crs {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_crs() {
        assert_eq!(crs("EPSG:4326"), Crs::wgs84());
        assert_eq!(crs("epsg:2039"), Crs::israeli_tm());
        assert_eq!(crs("32636").as_str(), "EPSG:32636");
        assert_eq!(crs(" EPSG:2100 ").as_str(), "EPSG:2100");
        assert!("EPSG:999999".parse::<Crs>().is_err());
        assert!("not-a-crs".parse::<Crs>().is_err());
        assert!("".parse::<Crs>().is_err());
    }

    #[test]
    fn test_is_geographic() {
        assert!(Crs::wgs84().is_geographic().unwrap());
        assert!(crs("EPSG:4258").is_geographic().unwrap());
        assert!(!Crs::israeli_tm().is_geographic().unwrap());
        assert!(!crs("EPSG:2100").is_geographic().unwrap());
        assert!(!crs("EPSG:32636").is_geographic().unwrap());
    }

    #[test]
    fn test_utm_central_meridian() {
        let p = Projector::new(Crs::wgs84(), crs("EPSG:32631")).unwrap();
        let origin = p.transform(wgs(3.0, 0.0)).unwrap();
        assert!((origin.x - 500_000.0).abs() < 1e-3);
        assert!(origin.y.abs() < 1e-3);

        // Meridian arc to 45N scaled by 0.9996
        let mid = p.transform(wgs(3.0, 45.0)).unwrap();
        assert!((mid.y - 4_982_950.4).abs() < 1.0, "northing {}", mid.y);
    }

    #[test]
    fn test_web_mercator_edge() {
        let p = Projector::new(Crs::wgs84(), crs("EPSG:3857")).unwrap();
        let edge = p.transform(wgs(180.0, 0.0)).unwrap();
        assert!((edge.x - 20_037_508.342_789_244).abs() < 1e-3);
    }

    #[test]
    fn test_israeli_grid_near_origin() {
        let p = Projector::new(Crs::wgs84(), Crs::israeli_tm()).unwrap();
        let c = p
            .transform(wgs(35.204_516_944_444_4, 31.734_393_611_111_1))
            .unwrap();
        // Datum shift moves the origin by tens of metres, not kilometres
        assert!((c.x - 219_529.584).abs() < 200.0, "x {}", c.x);
        assert!((c.y - 626_907.39).abs() < 200.0, "y {}", c.y);
    }

    #[test]
    fn test_greek_grid_is_metric() {
        // Athens, on the Greek Grid (GGRS87)
        let p = Projector::new(Crs::wgs84(), crs("EPSG:2100")).unwrap();
        let a = p.transform(wgs(23.72, 37.98)).unwrap();
        let b = p.transform(wgs(23.72, 37.99)).unwrap();
        assert!((a.x - 476_000.0).abs() < 5_000.0, "easting {}", a.x);
        assert!((a.y - 4_204_000.0).abs() < 5_000.0, "northing {}", a.y);
        let d = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();
        // 0.01 degree of latitude is roughly 1110 m here
        assert!((d - 1110.0).abs() < 5.0, "distance {}", d);
    }

    #[test]
    fn test_israeli_grid_distances_are_metric() {
        let p = Projector::new(Crs::wgs84(), Crs::israeli_tm()).unwrap();
        let a = p.transform(wgs(34.78, 32.08)).unwrap();
        let b = p.transform(wgs(34.78, 32.09)).unwrap();
        let d = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();
        // 0.01 degree of latitude is roughly 1109 m here
        assert!((d - 1109.0).abs() < 5.0, "distance {}", d);
    }

    #[test]
    fn test_round_trips() {
        let pairs = [
            (Crs::israeli_tm(), wgs(34.8, 32.1)),
            (crs("EPSG:2100"), wgs(23.7, 38.0)),
            (crs("EPSG:32636"), wgs(34.8, 32.1)),
            (crs("EPSG:32723"), wgs(-46.6, -23.5)),
            (crs("EPSG:3857"), wgs(-0.1278, 51.5074)),
        ];
        for (target, point) in pairs {
            let there = Projector::new(Crs::wgs84(), target.clone()).unwrap().transform(point).unwrap();
            let back = Projector::new(target.clone(), Crs::wgs84()).unwrap().transform(there).unwrap();
            assert!((back.x - point.x).abs() < 1e-6, "{} lon {}", target, back.x);
            assert!((back.y - point.y).abs() < 1e-6, "{} lat {}", target, back.y);
        }
    }

    #[test]
    fn test_identity_projector() {
        let p = Projector::new(Crs::wgs84(), Crs::wgs84()).unwrap();
        assert_eq!(p.transform(wgs(34.8, 32.1)).unwrap(), wgs(34.8, 32.1));
    }

    #[test]
    fn test_rejects_non_geographic_input() {
        let p = Projector::new(Crs::wgs84(), Crs::israeli_tm()).unwrap();
        assert!(p.transform(wgs(180_000.0, 650_000.0)).is_err());
        assert!(p.transform(wgs(f64::NAN, 32.0)).is_err());
    }

    #[test]
    fn test_projector_cache_is_bounded() {
        let mut cache = ProjectorCache::new();
        let targets = ["EPSG:2039", "EPSG:3857", "EPSG:32636", "EPSG:32635", "EPSG:2100"];
        for t in targets {
            cache.get(&Crs::wgs84(), &crs(t)).unwrap();
        }
        assert_eq!(cache.len(), PROJECTOR_CACHE_SIZE);
        // Least recently used pair was evicted
        assert!(!cache.contains(&Crs::wgs84(), &Crs::israeli_tm()));

        let first = cache.get(&Crs::wgs84(), &crs("EPSG:2100")).unwrap();
        let second = cache.get(&Crs::wgs84(), &crs("EPSG:2100")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
