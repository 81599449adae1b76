//! # Temporal Enrichment
//!
//! Turns raw timestamp text into calendar context for aggregation:
//! - Parsing against an ordered list of formats with an automatic fallback
//! - Localisation into a configured time zone, with fixed DST rules
//!   (ambiguous wall times read as standard time, non-existent ones shifted
//!   forward one hour)
//! - Derived `date`, `hour_of_day`, `iso_week` and `weekday_index` (Monday = 0)
//! - Daytype classification from the raw `DayType` field, a custom mapping,
//!   the weekday and a holiday calendar

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike,
};
use chrono_tz::Tz;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{LinkMonitorError, Result};

pub const DEFAULT_TIMEZONE: &str = "Asia/Jerusalem";

/// Formats tried after the preferred one, in order.
pub const TIMESTAMP_FORMATS: [&str; 9] = [
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
];

/// Rows sampled for column format detection.
const DETECTION_SAMPLE: usize = 1000;

/// Resolve an IANA time-zone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim().parse::<Tz>().map_err(|e| {
        LinkMonitorError::config("timezone", format!("'{}' is not a valid IANA time zone: {}", name, e))
    })
}

/// Formats that stop at day precision and never carry a time part.
fn parse_date_only(raw: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

enum Parsed {
    Naive(NaiveDateTime),
    Aware(DateTime<chrono::FixedOffset>),
}

/// Unconstrained fallback: RFC 3339 / ISO-8601 with a `T`, then date only.
fn parse_auto(raw: &str) -> Option<Parsed> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(Parsed::Aware(dt));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(Parsed::Aware(dt));
    }
    for f in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, f) {
            return Some(Parsed::Naive(dt));
        }
    }
    parse_date_only(raw).map(Parsed::Naive)
}

/// Parse wall-clock text without attaching a zone.
///
/// Offset-carrying inputs found by the fallback are converted to UTC wall time;
/// use [`parse_timestamp`] to keep their instant.
pub fn parse_naive(raw: &str, preferred: Option<&str>) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    preferred
        .into_iter()
        .chain(TIMESTAMP_FORMATS.iter().copied())
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| match parse_auto(raw)? {
            Parsed::Naive(dt) => Some(dt),
            Parsed::Aware(dt) => Some(dt.naive_utc()),
        })
}

/// Whether `raw` parses with exactly `format`, as a date-time or a bare date.
pub fn matches_format(raw: &str, format: &str) -> bool {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, format).is_ok() || NaiveDate::parse_from_str(raw, format).is_ok()
}

/// Attach a zone to a naive wall time.
///
/// Ambiguous times (clocks going back) resolve to standard time, which is the
/// reading with the smaller UTC offset. Non-existent times (clocks going
/// forward) are shifted forward one hour.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(a, b) => {
            let offset_a = a.offset().fix().local_minus_utc();
            let offset_b = b.offset().fix().local_minus_utc();
            Some(if offset_a <= offset_b { a } else { b })
        }
        LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest(),
    }
}

/// Parse and localise one timestamp.
pub fn parse_timestamp(raw: &str, preferred: Option<&str>, tz: Tz) -> Option<DateTime<Tz>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let listed = preferred
        .into_iter()
        .chain(TIMESTAMP_FORMATS.iter().copied())
        .find_map(|f| NaiveDateTime::parse_from_str(trimmed, f).ok());
    match listed {
        Some(naive) => localize(naive, tz),
        None => match parse_auto(trimmed)? {
            Parsed::Naive(naive) => localize(naive, tz),
            Parsed::Aware(dt) => Some(dt.with_timezone(&tz)),
        },
    }
}

/// Pick the format for a whole column from a sample of its values.
///
/// The first listed format that parses more than half of the sample wins; a
/// format parsing more than 90% ends the search at once.
pub fn detect_format<'a, I>(values: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    let sample: Vec<&str> = values
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .take(DETECTION_SAMPLE)
        .collect();
    if sample.is_empty() {
        return None;
    }

    let mut best: Option<(&'static str, f64)> = None;
    for format in TIMESTAMP_FORMATS {
        let ok = sample
            .iter()
            .filter(|v| NaiveDateTime::parse_from_str(v, format).is_ok())
            .count();
        let rate = ok as f64 / sample.len() as f64;
        if rate > 0.9 {
            return Some(format);
        }
        if rate > 0.5 && best.map_or(true, |(_, r)| rate > r) {
            best = Some((format, rate));
        }
    }
    best.map(|(f, _)| f)
}

/// Calendar position of one localised timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeContext {
    pub date: NaiveDate,
    pub hour_of_day: u32,
    pub iso_week: u32,
    /// Monday = 0 ... Sunday = 6
    pub weekday_index: u32,
}

impl TimeContext {
    pub fn from_datetime<T: TimeZone>(dt: &DateTime<T>) -> Self {
        let date = dt.date_naive();
        Self {
            date,
            hour_of_day: dt.hour(),
            iso_week: date.iso_week().week(),
            weekday_index: date.weekday().num_days_from_monday(),
        }
    }
}

/// Day category used as an aggregation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Weekday,
    Weekend,
    Holiday,
}

impl DayType {
    pub fn as_str(self) -> &'static str {
        match self {
            DayType::Weekday => "weekday",
            DayType::Weekend => "weekend",
            DayType::Holiday => "holiday",
        }
    }

    /// Monday to Friday are weekdays.
    pub fn from_weekday_index(weekday_index: u32) -> Self {
        if weekday_index < 5 {
            DayType::Weekday
        } else {
            DayType::Weekend
        }
    }
}

impl fmt::Display for DayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayType {
    type Err = LinkMonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weekday" => Ok(DayType::Weekday),
            "weekend" => Ok(DayType::Weekend),
            "holiday" => Ok(DayType::Holiday),
            other => Err(LinkMonitorError::config(
                "daytype",
                format!("'{}' is not one of weekday, weekend, holiday", other),
            )),
        }
    }
}

/// How dates in the holiday calendar are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolidayTreatment {
    #[default]
    Holiday,
    Weekend,
    Weekday,
}

impl HolidayTreatment {
    pub fn daytype(self) -> DayType {
        match self {
            HolidayTreatment::Holiday => DayType::Holiday,
            HolidayTreatment::Weekend => DayType::Weekend,
            HolidayTreatment::Weekday => DayType::Weekday,
        }
    }
}

/// Maps raw `DayType` cells onto [`DayType`].
#[derive(Debug, Clone)]
pub struct DaytypeMapper {
    table: HashMap<String, DayType>,
}

impl DaytypeMapper {
    const BUILTIN: [(&'static str, DayType); 19] = [
        ("weekday", DayType::Weekday),
        ("weekend", DayType::Weekend),
        ("holiday", DayType::Holiday),
        ("workday", DayType::Weekday),
        ("work", DayType::Weekday),
        // Hebrew labels as exported by the monitoring system
        ("יום חול", DayType::Weekday),
        ("חול", DayType::Weekday),
        ("יום עבודה", DayType::Weekday),
        ("עבודה", DayType::Weekday),
        ("סוף שבוע", DayType::Weekend),
        ("שבת", DayType::Weekend),
        ("יום שבת", DayType::Weekend),
        // Friday is part of the Israeli weekend
        ("שישי", DayType::Weekend),
        ("יום שישי", DayType::Weekend),
        ("חג", DayType::Holiday),
        ("ערב חג", DayType::Holiday),
        ("יום חג", DayType::Holiday),
        ("חול המועד", DayType::Holiday),
        ("מועד", DayType::Holiday),
    ];

    /// Built-in table merged with `custom` (category name to raw values).
    /// Custom entries win over built-in ones.
    pub fn new(custom: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut table: HashMap<String, DayType> = Self::BUILTIN
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        for (category, values) in custom {
            let daytype: DayType = category.parse()?;
            for value in values {
                table.insert(Self::normalize(value), daytype);
            }
        }
        Ok(Self { table })
    }

    fn normalize(raw: &str) -> String {
        raw.replace('\u{a0}', " ").trim().to_lowercase()
    }

    /// Mapped category, or the weekday-based inference when unmapped or absent.
    pub fn classify(&self, raw: Option<&str>, weekday_index: u32) -> DayType {
        raw.and_then(|r| self.table.get(&Self::normalize(r)).copied())
            .unwrap_or_else(|| DayType::from_weekday_index(weekday_index))
    }

    pub fn is_mapped(&self, raw: &str) -> bool {
        self.table.contains_key(&Self::normalize(raw))
    }
}

impl Default for DaytypeMapper {
    fn default() -> Self {
        Self {
            table: Self::BUILTIN.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

/// A configured holiday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayEntry {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Set of holiday dates.
#[derive(Debug, Clone, Default)]
pub struct HolidayCalendar {
    dates: BTreeMap<NaiveDate, String>,
}

impl HolidayCalendar {
    pub fn new(entries: &[HolidayEntry]) -> Self {
        let dates = entries
            .iter()
            .map(|e| {
                let name = e
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("Custom Holiday {}", e.date));
                (e.date, name)
            })
            .collect();
        Self { dates }
    }

    /// Read `YYYY-MM-DD [name]` lines. Blank lines and `#` comments are
    /// skipped; malformed lines are logged and skipped.
    pub fn from_text<R: BufRead>(reader: R) -> Result<Self> {
        let mut dates = BTreeMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (date_part, rest) = match (line.get(..10), line.get(10..)) {
                (Some(d), Some(r)) => (d, r),
                _ => (line, ""),
            };
            match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                Ok(date) => {
                    let name = rest.trim().trim_start_matches(['-', ',']).trim();
                    let name = if name.is_empty() {
                        format!("Custom Holiday {}", date)
                    } else {
                        name.to_string()
                    };
                    dates.insert(date, name);
                }
                Err(e) => warn!("[Temporal] Skipping holiday line {}: '{}' ({})", line_no + 1, line, e),
            }
        }
        info!("[Temporal] Loaded {} holidays", dates.len());
        Ok(Self { dates })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains_key(&date)
    }

    pub fn name(&self, date: NaiveDate) -> Option<&str> {
        self.dates.get(&date).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn entries(&self) -> Vec<HolidayEntry> {
        self.dates
            .iter()
            .map(|(date, name)| HolidayEntry {
                date: *date,
                name: Some(name.clone()),
            })
            .collect()
    }
}

/// Everything needed to enrich one row with calendar context.
#[derive(Debug, Clone)]
pub struct TemporalEnricher {
    tz: Tz,
    format: Option<String>,
    mapper: DaytypeMapper,
    holidays: HolidayCalendar,
    treatment: HolidayTreatment,
}

impl TemporalEnricher {
    pub fn new(
        tz: Tz,
        format: Option<String>,
        mapper: DaytypeMapper,
        holidays: HolidayCalendar,
        treatment: HolidayTreatment,
    ) -> Self {
        Self {
            tz,
            format,
            mapper,
            holidays,
            treatment,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// Time context and daytype for one row, or `None` if the timestamp
    /// cannot be parsed.
    pub fn enrich(&self, raw_timestamp: &str, raw_daytype: Option<&str>) -> Option<(TimeContext, DayType)> {
        let dt = parse_timestamp(raw_timestamp, self.format.as_deref(), self.tz)?;
        let ctx = TimeContext::from_datetime(&dt);
        let daytype = if self.holidays.contains(ctx.date) {
            self.treatment.daytype()
        } else {
            self.mapper.classify(raw_daytype, ctx.weekday_index)
        };
        Some((ctx, daytype))
    }
}
