//! # Input Schema
//!
//! Resolves the many historical column spellings of link-monitoring exports
//! into canonical fields, once per input header. Everything downstream works
//! on [`Field`] values only. All original columns are kept verbatim so they
//! can be written back unchanged.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use log::info;

use crate::error::Result;
use crate::Observation;

/// Cell values treated as missing.
pub const NULL_MARKERS: [&str; 6] = ["", "NA", "NULL", "null", "NaN", "nan"];

/// True if a raw cell counts as missing.
pub fn is_null(value: &str) -> bool {
    NULL_MARKERS.contains(&value.trim())
}

/// Canonical input fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    LinkName,
    SegmentId,
    RouteAlternative,
    RequestedTime,
    Timestamp,
    DayInWeek,
    DayType,
    Duration,
    Distance,
    Speed,
    Url,
    Polyline,
    DataId,
    IsValid,
    ValidCode,
}

impl Field {
    pub const ALL: [Field; 15] = [
        Field::LinkName,
        Field::SegmentId,
        Field::RouteAlternative,
        Field::RequestedTime,
        Field::Timestamp,
        Field::DayInWeek,
        Field::DayType,
        Field::Duration,
        Field::Distance,
        Field::Speed,
        Field::Url,
        Field::Polyline,
        Field::DataId,
        Field::IsValid,
        Field::ValidCode,
    ];

    /// Accepted header spellings, in priority order. Matching is case-sensitive.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::LinkName => &["Name", "name", "link_id"],
            Field::SegmentId => &["SegmentID", "segment_id"],
            Field::RouteAlternative => &["RouteAlternative", "route_alternative"],
            Field::RequestedTime => &["RequestedTime", "requested_time"],
            Field::Timestamp => &["Timestamp", "timestamp"],
            Field::DayInWeek => &["DayInWeek", "day_in_week"],
            Field::DayType => &["DayType", "day_type"],
            Field::Duration => &["Duration (seconds)", "Duration", "duration"],
            Field::Distance => &["Distance (meters)", "Distance", "distance"],
            Field::Speed => &["Speed (km/h)", "Speed", "speed"],
            Field::Url => &["Url", "url"],
            Field::Polyline => &["Polyline", "polyline"],
            Field::DataId => &["DataID", "data_id"],
            Field::IsValid => &["is_valid", "valid"],
            Field::ValidCode => &["valid_code"],
        }
    }

    /// Snake-case name used in logs and outputs.
    pub fn canonical_name(self) -> &'static str {
        match self {
            Field::LinkName => "name",
            Field::SegmentId => "segment_id",
            Field::RouteAlternative => "route_alternative",
            Field::RequestedTime => "requested_time",
            Field::Timestamp => "timestamp",
            Field::DayInWeek => "day_in_week",
            Field::DayType => "day_type",
            Field::Duration => "duration",
            Field::Distance => "distance",
            Field::Speed => "speed",
            Field::Url => "url",
            Field::Polyline => "polyline",
            Field::DataId => "data_id",
            Field::IsValid => "is_valid",
            Field::ValidCode => "valid_code",
        }
    }
}

/// Header row plus the resolved column index of each known field.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    headers: Vec<String>,
    resolved: HashMap<Field, usize>,
}

impl InputSchema {
    /// Resolve aliases against a header row. A leading UTF-8 BOM is ignored.
    pub fn resolve(headers: Vec<String>) -> Self {
        let headers: Vec<String> = headers
            .into_iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h.as_str() };
                h.trim().to_string()
            })
            .collect();

        let mut resolved = HashMap::new();
        for field in Field::ALL {
            let hit = field
                .aliases()
                .iter()
                .find_map(|alias| headers.iter().position(|h| h == alias));
            if let Some(idx) = hit {
                resolved.insert(field, idx);
            }
        }
        Self { headers, resolved }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn column(&self, field: Field) -> Option<usize> {
        self.resolved.get(&field).copied()
    }

    pub fn has(&self, field: Field) -> bool {
        self.resolved.contains_key(&field)
    }
}

/// Parse a route-alternative cell (`2`, `2.0`) into an integer.
fn parse_route_alternative(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<u32>() {
        return Some(v);
    }
    let v: f64 = raw.parse().ok()?;
    (v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64).then_some(v as u32)
}

/// Rows of an input file with their resolved schema.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    schema: InputSchema,
    rows: Vec<Observation>,
}

impl ObservationTable {
    /// Read a CSV with the given delimiter.
    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
        let schema = InputSchema::resolve(headers);

        let mut rows = Vec::new();
        for (index, record) in rdr.records().enumerate() {
            let record = record?;
            let fields: Vec<String> = record.iter().map(String::from).collect();
            rows.push(Self::observation_from_fields(&schema, index, fields));
        }

        info!(
            "[Schema] Read {} rows, {} columns, {} recognised fields",
            rows.len(),
            schema.headers().len(),
            schema.resolved.len()
        );
        Ok(Self { schema, rows })
    }

    pub fn from_path(path: impl AsRef<Path>, delimiter: u8) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file, delimiter)
    }

    /// Build a table from typed observations, synthesising the raw columns.
    ///
    /// Without `with_route_alternative` the table has no route-alternative
    /// column at all (geometry-only input).
    pub fn from_observations(observations: Vec<Observation>, with_route_alternative: bool) -> Self {
        let mut headers = vec!["Name".to_string(), "Timestamp".to_string()];
        if with_route_alternative {
            headers.push("RouteAlternative".to_string());
        }
        headers.push("Polyline".to_string());
        let schema = InputSchema::resolve(headers);

        let rows = observations
            .into_iter()
            .enumerate()
            .map(|(index, mut obs)| {
                let mut fields = vec![
                    obs.link_name.clone().unwrap_or_default(),
                    obs.timestamp.clone().unwrap_or_default(),
                ];
                if with_route_alternative {
                    fields.push(obs.route_alternative.map(|a| a.to_string()).unwrap_or_default());
                } else {
                    obs.route_alternative = None;
                }
                fields.push(obs.polyline.clone().unwrap_or_default());
                obs.index = index;
                obs.fields = fields;
                obs
            })
            .collect();
        Self { schema, rows }
    }

    fn observation_from_fields(schema: &InputSchema, index: usize, fields: Vec<String>) -> Observation {
        let get = |field: Field| -> Option<String> {
            schema
                .column(field)
                .and_then(|i| fields.get(i))
                .filter(|v| !is_null(v))
                .cloned()
        };
        Observation {
            index,
            link_name: get(Field::LinkName),
            timestamp: get(Field::Timestamp).map(|t| t.trim().to_string()),
            route_alternative: get(Field::RouteAlternative).and_then(|v| parse_route_alternative(&v)),
            polyline: get(Field::Polyline),
            fields,
        }
    }

    pub fn schema(&self) -> &InputSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Observation> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether the input carries a route-alternative column at all.
    pub fn has_route_alternative(&self) -> bool {
        self.schema.has(Field::RouteAlternative)
    }

    /// Non-null raw value of a field for a row.
    pub fn value<'a>(&self, row: &'a Observation, field: Field) -> Option<&'a str> {
        let idx = self.schema.column(field)?;
        row.fields
            .get(idx)
            .map(String::as_str)
            .filter(|v| !is_null(v))
    }

    /// Numeric value of a field for a row.
    pub fn number(&self, row: &Observation, field: Field) -> Option<f64> {
        self.value(row, field)?.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}DataID,Name,SegmentID,RouteAlternative,RequestedTime,Timestamp,DayInWeek,DayType,Duration (seconds),Distance (meters),Speed (km/h),Url,Polyline,Extra\n\
        1,s_653-655,7,1,10:00,2025-01-01 10:00,Wed,weekday,120,1000,30,http://x,_p~iF~ps|U_ulLnnqC,keep me\n\
        2,s_653-655,7,2.0,10:00,NA,Wed,weekday,,1000,30,http://x,_p~iF~ps|U_ulLnnqC,\n";

    #[test]
    fn test_resolve_aliases() {
        let table = ObservationTable::from_reader(SAMPLE.as_bytes(), b',').unwrap();
        let schema = table.schema();
        assert_eq!(schema.column(Field::DataId), Some(0));
        assert_eq!(schema.column(Field::Duration), Some(8));
        assert_eq!(schema.column(Field::Speed), Some(10));
        assert!(!schema.has(Field::IsValid));
        assert!(table.has_route_alternative());
    }

    #[test]
    fn test_row_values_and_nulls() {
        let table = ObservationTable::from_reader(SAMPLE.as_bytes(), b',').unwrap();
        let rows = table.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].link_name.as_deref(), Some("s_653-655"));
        assert_eq!(rows[0].route_alternative, Some(1));
        assert_eq!(rows[1].route_alternative, Some(2));
        assert_eq!(rows[1].timestamp, None);
        assert_eq!(table.number(&rows[0], Field::Duration), Some(120.0));
        assert_eq!(table.number(&rows[1], Field::Duration), None);
        // Passthrough keeps unknown columns verbatim
        assert_eq!(rows[0].fields[13], "keep me");
        assert_eq!(table.schema().headers()[0], "DataID");
    }

    #[test]
    fn test_from_observations_without_route_alternative() {
        let obs = vec![Observation::new(5, Some("s_1-2"), None, Some(3), Some("abc"))];
        let table = ObservationTable::from_observations(obs, false);
        assert!(!table.has_route_alternative());
        assert_eq!(table.rows()[0].index, 0);
        assert_eq!(table.rows()[0].route_alternative, None);
        assert_eq!(table.rows()[0].fields, vec!["s_1-2", "", "abc"]);
    }

    #[test]
    fn test_parse_route_alternative() {
        assert_eq!(parse_route_alternative(" 3 "), Some(3));
        assert_eq!(parse_route_alternative("2.0"), Some(2));
        assert_eq!(parse_route_alternative("2.5"), None);
        assert_eq!(parse_route_alternative("x"), None);
    }
}
