//! # Processing Pipeline
//!
//! End-to-end aggregation run over a link-monitoring CSV:
//!
//! 1. Parameter validation (before any I/O)
//! 2. CSV load with column aliasing
//! 3. Row validity (validity column, valid codes or numeric range rules)
//! 4. De-duplication
//! 5. Temporal enrichment
//! 6. Date, weekday, hour, link and preset filters
//! 7. Hourly and weekly aggregation
//! 8. Output files
//!
//! [`validate_csv`] is the geometric front end: it annotates a raw CSV against
//! a reference network and writes the `validated.csv` that feeds this run.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::aggregation::{
    aggregate_hourly, aggregate_weekly, AggregationRow, HourlyTable, WeeklyGrouping, WeeklyRecord,
};
use crate::batch::{validate_batch, AnnotatedTable};
use crate::error::{LinkMonitorError, Result};
use crate::network::ReferenceNetwork;
use crate::progress::ValidationProgressCallback;
use crate::report;
use crate::schema::{Field, ObservationTable};
use crate::temporal::{
    detect_format, matches_format, parse_timezone, DayType, DaytypeMapper, HolidayCalendar, HolidayEntry,
    HolidayTreatment, TemporalEnricher, DEFAULT_TIMEZONE,
};
use crate::validator::ValidationConfig;
use crate::Observation;

/// File name of the annotated validation output.
pub const VALIDATED_FILE: &str = "validated.csv";

/// Link list given either as one comma-separated string or as a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkList {
    Csv(String),
    List(Vec<String>),
}

impl LinkList {
    pub fn names(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            LinkList::Csv(s) => s.split(',').collect(),
            LinkList::List(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Configuration of an aggregation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input CSV (required)
    pub input_file_path: PathBuf,
    /// Directory for all outputs, created if missing
    pub output_dir: PathBuf,
    pub delimiter: char,
    /// Rows per enrichment work unit
    pub chunk_size: usize,
    /// IANA time zone for naive timestamps
    pub timezone: String,
    /// Preferred timestamp format; detected from the data when `None`
    pub timestamp_format: Option<String>,
    /// Valid rows needed for an hour to count as valid
    pub min_valid_per_hour: usize,
    /// Codes accepted as valid when validity comes from `valid_code`
    pub valid_codes_ok: Vec<u8>,
    pub duration_range_sec: [f64; 2],
    pub distance_range_m: [f64; 2],
    pub speed_range_kmh: [f64; 2],
    pub remove_data_id_duplicates: bool,
    pub remove_link_timestamp_duplicates: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Monday = 0 ... Sunday = 6
    pub weekday_include: Option<Vec<u32>>,
    pub hours_include: Option<Vec<u32>>,
    pub whitelist_links: Option<LinkList>,
    pub blacklist_links: Option<LinkList>,
    pub weekday_only: bool,
    pub weekend_only: bool,
    pub holiday_only: bool,
    /// Extra raw `DayType` values per category (`weekday`, `weekend`, `holiday`)
    pub daytype_mapping: BTreeMap<String, Vec<String>>,
    pub enable_holiday_classification: bool,
    pub holidays: Vec<HolidayEntry>,
    /// Text file of `YYYY-MM-DD [name]` lines, merged with `holidays`
    pub holidays_file: Option<PathBuf>,
    pub holidays_as: HolidayTreatment,
    pub weekly_grouping: WeeklyGrouping,
    pub recompute_std_from_raw: bool,
    pub generate_quality_reports: bool,
    /// Also write Parquet copies of the hourly and weekly tables
    /// (needs the `parquet` feature)
    pub write_parquet: bool,
    /// Geometric validation settings used by [`validate_csv`]
    pub validation: ValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_file_path: PathBuf::new(),
            output_dir: PathBuf::from("."),
            delimiter: ',',
            chunk_size: 50_000,
            timezone: DEFAULT_TIMEZONE.to_string(),
            timestamp_format: None,
            min_valid_per_hour: 1,
            valid_codes_ok: Vec::new(),
            duration_range_sec: [0.0, f64::MAX],
            distance_range_m: [0.0, f64::MAX],
            speed_range_kmh: [0.0, f64::MAX],
            remove_data_id_duplicates: true,
            remove_link_timestamp_duplicates: true,
            start_date: None,
            end_date: None,
            weekday_include: None,
            hours_include: None,
            whitelist_links: None,
            blacklist_links: None,
            weekday_only: false,
            weekend_only: false,
            holiday_only: false,
            daytype_mapping: BTreeMap::new(),
            enable_holiday_classification: true,
            holidays: Vec::new(),
            holidays_file: None,
            holidays_as: HolidayTreatment::Holiday,
            weekly_grouping: WeeklyGrouping::DayType,
            recompute_std_from_raw: false,
            generate_quality_reports: true,
            write_parquet: false,
            validation: ValidationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(input_file_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_file_path: input_file_path.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Check every parameter, naming the first one out of range.
    pub fn validate(&self) -> Result<()> {
        if self.input_file_path.as_os_str().is_empty() {
            return Err(LinkMonitorError::config("input_file_path", "is required"));
        }
        if !self.delimiter.is_ascii() {
            return Err(LinkMonitorError::config("delimiter", "must be a single ASCII character"));
        }
        if !(1..=1_000_000).contains(&self.chunk_size) {
            return Err(LinkMonitorError::config(
                "chunk_size",
                format!("must be between 1 and 1000000, got {}", self.chunk_size),
            ));
        }
        if self.min_valid_per_hour > 1000 {
            return Err(LinkMonitorError::config(
                "min_valid_per_hour",
                format!("must be between 0 and 1000, got {}", self.min_valid_per_hour),
            ));
        }
        parse_timezone(&self.timezone)?;
        for (name, range) in [
            ("duration_range_sec", self.duration_range_sec),
            ("distance_range_m", self.distance_range_m),
            ("speed_range_kmh", self.speed_range_kmh),
        ] {
            if range.iter().any(|v| v.is_nan()) || range[0] > range[1] {
                return Err(LinkMonitorError::config(
                    name,
                    format!("must be an ordered [min, max] pair, got {:?}", range),
                ));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(LinkMonitorError::config(
                    "start_date",
                    format!("{} is after end_date {}", start, end),
                ));
            }
        }
        if let Some(days) = &self.weekday_include {
            if let Some(bad) = days.iter().find(|d| **d > 6) {
                return Err(LinkMonitorError::config(
                    "weekday_include",
                    format!("entries must be 0-6 (Monday-Sunday), got {}", bad),
                ));
            }
        }
        if let Some(hours) = &self.hours_include {
            if let Some(bad) = hours.iter().find(|h| **h > 23) {
                return Err(LinkMonitorError::config(
                    "hours_include",
                    format!("entries must be 0-23, got {}", bad),
                ));
            }
        }
        DaytypeMapper::new(&self.daytype_mapping)?;
        self.validation.validate()?;
        Ok(())
    }
}

// ============================================================================
// Validity
// ============================================================================

/// How row validity was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityMethod {
    BooleanValidColumn,
    BooleanIsValidColumn,
    ValidCodeColumn,
    NumericRangeRules,
}

impl ValidityMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidityMethod::BooleanValidColumn => "boolean_valid_column",
            ValidityMethod::BooleanIsValidColumn => "boolean_is_valid_column",
            ValidityMethod::ValidCodeColumn => "valid_code_column",
            ValidityMethod::NumericRangeRules => "numeric_range_rules",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidityStats {
    pub method: ValidityMethod,
    pub total_rows: usize,
    pub valid_rows: usize,
    /// Invalid row count per reason (rule name or valid code)
    pub invalid_reasons: BTreeMap<String, usize>,
}

impl ValidityStats {
    pub fn invalid_rows(&self) -> usize {
        self.total_rows - self.valid_rows
    }

    pub fn percent_valid(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.valid_rows as f64 / self.total_rows as f64 * 100.0
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_uppercase().as_str(), "TRUE" | "1" | "YES")
}

fn parse_code(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    raw.parse::<u8>().ok().or_else(|| {
        let v: f64 = raw.parse().ok()?;
        (v.fract() == 0.0 && (0.0..=255.0).contains(&v)).then_some(v as u8)
    })
}

/// Decide validity for every row.
///
/// Priority: a boolean validity column, then `valid_code` against
/// `valid_codes_ok`, then numeric range rules where a missing value is
/// invalid.
pub fn determine_validity(table: &ObservationTable, config: &PipelineConfig) -> (Vec<bool>, ValidityStats) {
    let rows = table.rows();
    let mut invalid_reasons = BTreeMap::new();

    let (flags, method): (Vec<bool>, ValidityMethod) = if let Some(col) = table.schema().column(Field::IsValid) {
        let method = if table.schema().headers()[col] == "valid" {
            ValidityMethod::BooleanValidColumn
        } else {
            ValidityMethod::BooleanIsValidColumn
        };
        info!("[Pipeline] Using '{}' column for validity", table.schema().headers()[col]);
        let flags = rows
            .iter()
            .map(|r| table.value(r, Field::IsValid).map_or(false, parse_flag))
            .collect();
        (flags, method)
    } else if table.schema().has(Field::ValidCode) {
        info!("[Pipeline] Using 'valid_code' column for validity");
        if config.valid_codes_ok.is_empty() {
            warn!("[Pipeline] No valid codes specified, treating all rows as invalid");
        }
        let ok: HashSet<u8> = config.valid_codes_ok.iter().copied().collect();
        let flags: Vec<bool> = rows
            .iter()
            .map(|r| {
                let code = table.value(r, Field::ValidCode).and_then(parse_code);
                let valid = code.map_or(false, |c| ok.contains(&c));
                if !valid {
                    if let Some(raw) = table.value(r, Field::ValidCode) {
                        let key = code.map_or_else(|| raw.trim().to_string(), |c| c.to_string());
                        *invalid_reasons.entry(key).or_insert(0) += 1;
                    }
                }
                valid
            })
            .collect();
        (flags, ValidityMethod::ValidCodeColumn)
    } else {
        info!("[Pipeline] Using numeric range rules for validity");
        let mut flags = vec![true; rows.len()];
        for (field, range, reason) in [
            (Field::Duration, config.duration_range_sec, "duration_out_of_range"),
            (Field::Distance, config.distance_range_m, "distance_out_of_range"),
            (Field::Speed, config.speed_range_kmh, "speed_out_of_range"),
        ] {
            let mut count = 0usize;
            for (flag, row) in flags.iter_mut().zip(rows) {
                let in_range = table
                    .number(row, field)
                    .map_or(false, |v| v >= range[0] && v <= range[1]);
                if !in_range {
                    *flag = false;
                    count += 1;
                }
            }
            invalid_reasons.insert(reason.to_string(), count);
        }
        (flags, ValidityMethod::NumericRangeRules)
    };

    let stats = ValidityStats {
        method,
        total_rows: rows.len(),
        valid_rows: flags.iter().filter(|v| **v).count(),
        invalid_reasons,
    };
    (flags, stats)
}

// ============================================================================
// De-duplication
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub original_rows: usize,
    pub data_id_duplicates: usize,
    pub link_timestamp_duplicates: usize,
    pub final_rows: usize,
}

impl DedupStats {
    pub fn duplicates_removed(&self) -> usize {
        self.data_id_duplicates + self.link_timestamp_duplicates
    }
}

/// Keep the first row per data id, then the first per (link name, timestamp).
/// Rows without a data id never collide on it.
pub fn remove_duplicates<'a>(
    table: &'a ObservationTable,
    rows: Vec<(&'a Observation, bool)>,
    config: &PipelineConfig,
) -> (Vec<(&'a Observation, bool)>, DedupStats) {
    let mut stats = DedupStats {
        original_rows: rows.len(),
        ..DedupStats::default()
    };
    let mut rows = rows;

    if config.remove_data_id_duplicates && table.schema().has(Field::DataId) {
        let before = rows.len();
        let mut seen: HashSet<&str> = HashSet::new();
        rows.retain(|&(row, _)| match table.value(row, Field::DataId) {
            Some(id) => seen.insert(id.trim()),
            None => true,
        });
        stats.data_id_duplicates = before - rows.len();
        info!("[Pipeline] Removed {} DataID duplicates", stats.data_id_duplicates);
    }

    if config.remove_link_timestamp_duplicates {
        if table.schema().has(Field::LinkName) && table.schema().has(Field::Timestamp) {
            let before = rows.len();
            let mut seen: HashSet<(Option<&str>, Option<&str>)> = HashSet::new();
            rows.retain(|&(row, _)| seen.insert((row.link_name.as_deref(), row.timestamp.as_deref())));
            stats.link_timestamp_duplicates = before - rows.len();
            info!(
                "[Pipeline] Removed {} link+timestamp duplicates",
                stats.link_timestamp_duplicates
            );
        } else {
            warn!("[Pipeline] Cannot remove link+timestamp duplicates: missing name or timestamp column");
        }
    }

    stats.final_rows = rows.len();
    (rows, stats)
}

// ============================================================================
// Enrichment and filters
// ============================================================================

fn build_enricher(table: &ObservationTable, config: &PipelineConfig) -> Result<TemporalEnricher> {
    let tz = parse_timezone(&config.timezone)?;
    let format = match &config.timestamp_format {
        Some(f) => {
            let mut present = table
                .rows()
                .iter()
                .filter_map(|r| r.timestamp.as_deref())
                .filter(|t| !t.trim().is_empty())
                .peekable();
            if present.peek().is_some() && !present.any(|t| matches_format(t, f)) {
                return Err(LinkMonitorError::Timestamp {
                    message: format!("configured timestamp_format '{}' matches none of the input timestamps", f),
                });
            }
            Some(f.clone())
        }
        None => {
            let detected = detect_format(table.rows().iter().filter_map(|r| r.timestamp.as_deref()));
            match detected {
                Some(f) => info!("[Pipeline] Detected timestamp format '{}'", f),
                None => info!("[Pipeline] No listed timestamp format fits, using automatic parsing"),
            }
            detected.map(String::from)
        }
    };

    let holidays = if config.enable_holiday_classification {
        let mut entries = config.holidays.clone();
        if let Some(path) = &config.holidays_file {
            let file = fs::File::open(path)?;
            entries.extend(HolidayCalendar::from_text(BufReader::new(file))?.entries());
        }
        HolidayCalendar::new(&entries)
    } else {
        HolidayCalendar::default()
    };

    Ok(TemporalEnricher::new(
        tz,
        format,
        DaytypeMapper::new(&config.daytype_mapping)?,
        holidays,
        config.holidays_as,
    ))
}

fn enrich_one(
    table: &ObservationTable,
    enricher: &TemporalEnricher,
    row: &Observation,
    is_valid: bool,
) -> Option<AggregationRow> {
    let link_id = row.link_name.as_deref()?.trim().to_string();
    let (ctx, daytype) = enricher.enrich(row.timestamp.as_deref()?, table.value(row, Field::DayType))?;
    Some(AggregationRow {
        link_id,
        date: ctx.date,
        hour_of_day: ctx.hour_of_day,
        daytype,
        is_valid,
        duration: table.number(row, Field::Duration),
        distance: table.number(row, Field::Distance),
        speed: table.number(row, Field::Speed),
    })
}

/// Enrich rows with time context in chunks of `chunk_size`.
/// Returns the enriched rows and how many were dropped.
fn enrich_rows(
    table: &ObservationTable,
    enricher: &TemporalEnricher,
    rows: &[(&Observation, bool)],
    chunk_size: usize,
) -> (Vec<AggregationRow>, usize) {
    #[cfg(feature = "parallel")]
    let enriched: Vec<Option<AggregationRow>> = {
        use rayon::prelude::*;
        rows.par_chunks(chunk_size)
            .flat_map_iter(|chunk| chunk.iter().map(|(row, valid)| enrich_one(table, enricher, row, *valid)))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let enriched: Vec<Option<AggregationRow>> = rows
        .chunks(chunk_size)
        .flat_map(|chunk| chunk.iter().map(|(row, valid)| enrich_one(table, enricher, row, *valid)))
        .collect();

    let total = enriched.len();
    let kept: Vec<AggregationRow> = enriched.into_iter().flatten().collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

fn weekday_index(row: &AggregationRow) -> u32 {
    use chrono::Datelike;
    row.date.weekday().num_days_from_monday()
}

/// Apply date, weekday, hour, link and preset filters in that order.
pub fn apply_filters(rows: Vec<AggregationRow>, config: &PipelineConfig) -> Vec<AggregationRow> {
    let initial = rows.len();
    let mut rows = rows;

    if let Some(start) = config.start_date {
        rows.retain(|r| r.date >= start);
    }
    if let Some(end) = config.end_date {
        rows.retain(|r| r.date <= end);
    }
    if let Some(days) = config.weekday_include.as_ref().filter(|d| !d.is_empty()) {
        rows.retain(|r| days.contains(&weekday_index(r)));
    }
    if let Some(hours) = config.hours_include.as_ref().filter(|h| !h.is_empty()) {
        rows.retain(|r| hours.contains(&r.hour_of_day));
    }
    if let Some(list) = &config.whitelist_links {
        let names: HashSet<String> = list.names().into_iter().collect();
        if !names.is_empty() {
            rows.retain(|r| names.contains(&r.link_id));
        }
    }
    if let Some(list) = &config.blacklist_links {
        let names: HashSet<String> = list.names().into_iter().collect();
        rows.retain(|r| !names.contains(&r.link_id));
    }
    if config.weekday_only {
        rows.retain(|r| r.daytype == DayType::Weekday);
    }
    if config.weekend_only {
        rows.retain(|r| r.daytype == DayType::Weekend);
    }
    if config.holiday_only {
        rows.retain(|r| r.daytype == DayType::Holiday);
    }

    info!("[Pipeline] Filtering: {} -> {} rows", initial, rows.len());
    rows
}

// ============================================================================
// Run
// ============================================================================

/// Everything produced by one run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub hourly: HourlyTable,
    pub weekly: Vec<WeeklyRecord>,
    pub validity: ValidityStats,
    pub dedup: DedupStats,
    pub rows_loaded: usize,
    /// Rows dropped because link name or timestamp was unusable
    pub rows_unparsed: usize,
    pub rows_after_filter: usize,
    /// Artifact name to written path
    pub output_files: BTreeMap<String, PathBuf>,
}

/// Run the full aggregation pipeline and write its outputs.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineOutput> {
    let started = Instant::now();
    info!("[Pipeline] Step 1: validating parameters");
    config.validate()?;
    fs::create_dir_all(&config.output_dir)?;

    info!("[Pipeline] Step 2: reading {}", config.input_file_path.display());
    let table = ObservationTable::from_path(&config.input_file_path, config.delimiter as u8)?;
    if table.is_empty() {
        warn!("[Pipeline] No data loaded from {}", config.input_file_path.display());
    }

    info!("[Pipeline] Step 3: determining validity and removing duplicates");
    let (flags, validity) = determine_validity(&table, config);
    info!(
        "[Pipeline] Valid rows: {}/{} ({:.1}%) via {}",
        validity.valid_rows,
        validity.total_rows,
        validity.percent_valid(),
        validity.method.as_str()
    );
    let rows: Vec<(&Observation, bool)> = table.rows().iter().zip(flags).collect();
    let (rows, dedup) = remove_duplicates(&table, rows, config);

    info!("[Pipeline] Step 4: temporal enrichment");
    let enricher = build_enricher(&table, config)?;
    let (enriched, rows_unparsed) = enrich_rows(&table, &enricher, &rows, config.chunk_size);
    if rows_unparsed > 0 {
        warn!(
            "[Pipeline] Dropped {} rows with missing link name or unparseable timestamp",
            rows_unparsed
        );
    }

    info!("[Pipeline] Step 5: filtering");
    let filtered = apply_filters(enriched.clone(), config);
    if filtered.is_empty() {
        warn!("[Pipeline] No data remaining after filtering");
    }

    info!("[Pipeline] Step 6: aggregation");
    let hourly = aggregate_hourly(&filtered, config.min_valid_per_hour);
    let weekly = if hourly.is_empty() {
        warn!("[Pipeline] Skipping weekly profile: no hourly data");
        Vec::new()
    } else {
        aggregate_weekly(&hourly, config.weekly_grouping, config.recompute_std_from_raw)
    };

    info!("[Pipeline] Step 7: writing outputs to {}", config.output_dir.display());
    let mut output = PipelineOutput {
        rows_loaded: table.len(),
        rows_unparsed,
        rows_after_filter: filtered.len(),
        hourly,
        weekly,
        validity,
        dedup,
        output_files: BTreeMap::new(),
    };
    output.output_files = report::write_outputs(&output, &enriched, config, started.elapsed())?;

    info!(
        "[Pipeline] Completed in {:.1}s: {} hourly rows, {} weekly rows, {} files",
        started.elapsed().as_secs_f64(),
        output.hourly.len(),
        output.weekly.len(),
        output.output_files.len()
    );
    Ok(output)
}

/// Validate a raw CSV against `network` and write the annotated table to
/// `output_dir/validated.csv`.
pub fn validate_csv(
    input: &Path,
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    output_dir: &Path,
    progress: &dyn ValidationProgressCallback,
) -> Result<AnnotatedTable> {
    config.validate()?;
    let table = ObservationTable::from_path(input, b',')?;
    let annotated = validate_batch(&table, network, config, progress)?;
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(VALIDATED_FILE);
    report::write_validated_csv(&path, &annotated)?;
    info!(
        "[Pipeline] Wrote {} ({} rows, {} valid)",
        path.display(),
        annotated.len(),
        annotated.valid_count()
    );
    for (code, n) in report::code_breakdown(&annotated) {
        info!("[Pipeline]   valid_code {:>2} {:?}: {}", code.code(), code, n);
    }
    Ok(annotated)
}

/// Local completion timestamp used in reports.
pub(crate) fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}
