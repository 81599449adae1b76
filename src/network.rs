//! # Reference Network
//!
//! Link-name parsing and the read-only table of reference road links.
//!
//! Each link is keyed by `s_{from}-{to}`. Node identifiers stay strings so
//! leading zeros survive. The metric geometry of every link is projected once,
//! when the table is built, and shared read-only by all validation workers.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use geo::{Geometry, LineString};
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use wkt::TryFromWkt;

use crate::error::{LinkMonitorError, OptionExt, Result};
use crate::geometry::{line_length, repair};
use crate::projection::{Crs, Projector};

static LINK_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[sS]?[_-]?(\d+)[_-](\d+)$").expect("link name pattern is a valid regex")
});

/// Parse a link name like `s_653-655` into `(from_node, to_node)`.
///
/// Accepts an optional `s`/`S` prefix, an optional `_`/`-` after it, and two
/// digit groups separated by `_` or `-`. Digits are kept verbatim.
///
/// # Example
/// ```
/// use link_monitor::parse_link_name;
///
/// assert_eq!(
///     parse_link_name("S_0653_655"),
///     Some(("0653".to_string(), "655".to_string()))
/// );
/// assert_eq!(parse_link_name("road-7"), None);
/// ```
pub fn parse_link_name(name: &str) -> Option<(String, String)> {
    let caps = LINK_NAME_PATTERN.captures(name.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Canonical link key for a node pair.
pub fn link_id(from_node: &str, to_node: &str) -> String {
    format!("s_{}-{}", from_node, to_node)
}

/// One reference road segment.
#[derive(Debug, Clone)]
pub struct ReferenceLink {
    pub from_node: String,
    pub to_node: String,
    /// Geometry in the table's source CRS (lon/lat unless configured otherwise)
    pub geometry_geographic: LineString<f64>,
    /// Same geometry in the metric CRS
    pub geometry_metric: LineString<f64>,
    /// Planar length of the metric geometry in metres
    pub length_m: f64,
}

impl ReferenceLink {
    pub fn link_id(&self) -> String {
        link_id(&self.from_node, &self.to_node)
    }
}

/// Read-only lookup table of reference links.
#[derive(Debug, Clone)]
pub struct ReferenceNetwork {
    links: HashMap<String, ReferenceLink>,
    source_crs: Crs,
    metric_crs: Crs,
}

impl ReferenceNetwork {
    /// Build the table, projecting every geometry into `metric_crs`.
    ///
    /// A later duplicate of the same node pair replaces the earlier one.
    /// Projection failures and geometries with fewer than two distinct
    /// vertices are hard errors.
    pub fn build<I>(links: I, source_crs: Crs, metric_crs: Crs) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String, LineString<f64>)>,
    {
        if metric_crs.is_geographic()? {
            return Err(LinkMonitorError::config(
                "metric_crs",
                format!("{} is geographic; distances would be in degrees", metric_crs),
            ));
        }

        let projector = Projector::new(source_crs.clone(), metric_crs.clone())?;
        let mut table: HashMap<String, ReferenceLink> = HashMap::new();
        for (from_node, to_node, geometry) in links {
            let key = link_id(&from_node, &to_node);
            let geometry = repair(&geometry).ok_or_else(|| LinkMonitorError::Geometry {
                link_id: key.clone(),
                message: format!(
                    "reference geometry has fewer than two distinct finite vertices ({} given)",
                    geometry.0.len()
                ),
            })?;
            let geometry_metric = projector.transform_line(&geometry)?;
            let link = ReferenceLink {
                length_m: line_length(&geometry_metric),
                from_node,
                to_node,
                geometry_geographic: geometry,
                geometry_metric,
            };
            if table.insert(key.clone(), link).is_some() {
                warn!("[ReferenceNetwork] Duplicate link {}, keeping the last one", key);
            }
        }

        info!(
            "[ReferenceNetwork] Loaded {} links ({} -> {})",
            table.len(),
            source_crs,
            metric_crs
        );
        Ok(Self {
            links: table,
            source_crs,
            metric_crs,
        })
    }

    /// Load links from a CSV with node columns and a WKT geometry column.
    ///
    /// Accepted headers: `From`/`from_node`/`from`, `To`/`to_node`/`to`,
    /// `geometry`/`WKT`/`wkt`. Rows whose geometry is not a (multi)line string
    /// or that collapse to a single point are skipped with a warning.
    pub fn from_csv_reader<R: Read>(reader: R, source_crs: Crs, metric_crs: Crs) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let find = |names: &[&str]| headers.iter().position(|h| names.contains(&h.trim()));

        let from_idx = find(&["From", "from_node", "from"]).ok_or_schema("reference table has no From column")?;
        let to_idx = find(&["To", "to_node", "to"]).ok_or_schema("reference table has no To column")?;
        let geom_idx =
            find(&["geometry", "WKT", "wkt"]).ok_or_schema("reference table has no geometry column")?;

        let mut links = Vec::new();
        let mut skipped = 0usize;
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let from = record.get(from_idx).unwrap_or("").trim();
            let to = record.get(to_idx).unwrap_or("").trim();
            let wkt_text = record.get(geom_idx).unwrap_or("");

            match parse_wkt_line(wkt_text).and_then(|line| repair(&line)) {
                Some(line) if !from.is_empty() && !to.is_empty() => {
                    links.push((from.to_string(), to.to_string(), line));
                }
                _ => {
                    skipped += 1;
                    warn!("[ReferenceNetwork] Skipping reference row {}: unusable geometry or nodes", row + 1);
                }
            }
        }
        if skipped > 0 {
            warn!("[ReferenceNetwork] Skipped {} reference rows", skipped);
        }
        Self::build(links, source_crs, metric_crs)
    }

    pub fn from_csv_path(path: impl AsRef<Path>, source_crs: Crs, metric_crs: Crs) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, source_crs, metric_crs)
    }

    /// O(1) lookup by node pair.
    pub fn lookup(&self, from_node: &str, to_node: &str) -> Option<&ReferenceLink> {
        self.links.get(&link_id(from_node, to_node))
    }

    /// Lookup by canonical link key.
    pub fn get(&self, link_id: &str) -> Option<&ReferenceLink> {
        self.links.get(link_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn source_crs(&self) -> &Crs {
        &self.source_crs
    }

    pub fn metric_crs(&self) -> &Crs {
        &self.metric_crs
    }

    pub fn links(&self) -> impl Iterator<Item = &ReferenceLink> {
        self.links.values()
    }
}

/// Parse a WKT LineString, or a MultiLineString whose parts are chained.
fn parse_wkt_line(text: &str) -> Option<LineString<f64>> {
    match Geometry::<f64>::try_from_wkt_str(text.trim()).ok()? {
        Geometry::LineString(line) => Some(line),
        Geometry::MultiLineString(multi) => {
            let coords: Vec<_> = multi.0.into_iter().flat_map(|l| l.0).collect();
            (coords.len() >= 2).then(|| LineString::new(coords))
        }
        _ => None,
    }
}
