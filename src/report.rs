//! # Reports
//!
//! Flat-file outputs of a run and helpers for reviewing validation results.
//!
//! File names are fixed: `hourly_agg.csv`, `weekly_hourly_profile.csv`,
//! `quality_by_link.csv`, `invalid_reason_counts.csv`, `processing_log.txt`,
//! `run_config.json` and, for geometric validation, `validated.csv`. With the
//! `parquet` feature and `write_parquet` set, the hourly and weekly tables are
//! also written as `.parquet`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use log::{info, warn};
use serde_json::{json, Value};

use crate::aggregation::{AggregationRow, HourlyTable, WeeklyGrouping, WeeklyRecord};
use crate::batch::{output_order, AnnotatedRow, AnnotatedTable};
use crate::error::Result;
use crate::pipeline::{now_local, PipelineConfig, PipelineOutput, ValidityStats};
use crate::validator::{LengthCheckMode, ValidCode};

pub const HOURLY_FILE: &str = "hourly_agg.csv";
pub const WEEKLY_FILE: &str = "weekly_hourly_profile.csv";
pub const QUALITY_FILE: &str = "quality_by_link.csv";
pub const REASONS_FILE: &str = "invalid_reason_counts.csv";
pub const LOG_FILE: &str = "processing_log.txt";
pub const CONFIG_FILE: &str = "run_config.json";

const RULE: &str = "============================================================";

fn fmt_float(v: Option<f64>) -> String {
    v.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

fn fmt_bool(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `1234567` -> `1,234,567`
fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Aggregation tables
// ============================================================================

pub fn write_hourly_csv(path: &Path, hourly: &HourlyTable) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "link_id",
        "date",
        "hour_of_day",
        "daytype",
        "n_total",
        "n_valid",
        "valid_hour",
        "no_valid_hour",
        "avg_duration_sec",
        "std_duration_sec",
        "avg_distance_m",
        "avg_speed_kmh",
    ])?;
    for r in &hourly.records {
        wtr.write_record([
            r.link_id.clone(),
            r.date.format("%Y-%m-%d").to_string(),
            r.hour_of_day.to_string(),
            r.daytype.to_string(),
            r.n_total.to_string(),
            r.n_valid.to_string(),
            fmt_bool(r.valid_hour).to_string(),
            r.no_valid_hour().to_string(),
            fmt_float(r.avg_duration_sec),
            fmt_float(r.std_duration_sec),
            fmt_float(r.avg_distance_m),
            fmt_float(r.avg_speed_kmh),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_weekly_csv(path: &Path, weekly: &[WeeklyRecord], grouping: WeeklyGrouping) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "link_id",
        grouping.column_name(),
        "hour_of_day",
        "avg_n_valid",
        "total_valid_n",
        "total_not_valid",
        "avg_dur",
        "std_dur",
        "avg_dist",
        "avg_speed",
        "n_days",
    ])?;
    for r in weekly {
        wtr.write_record([
            r.link_id.clone(),
            r.key.to_string(),
            r.hour_of_day.to_string(),
            fmt_float(Some(r.avg_n_valid)),
            r.total_valid_n.to_string(),
            r.total_not_valid.to_string(),
            fmt_float(r.avg_dur),
            fmt_float(r.std_dur),
            fmt_float(r.avg_dist),
            fmt_float(r.avg_speed),
            r.n_days.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

// ============================================================================
// Quality reports
// ============================================================================

/// Data quality of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkQuality {
    pub link_id: String,
    pub percent_valid: f64,
    pub hours_with_data: usize,
    pub hours_valid: usize,
    pub hours_dropped: usize,
    pub percent_valid_hours: f64,
    pub days_covered: usize,
}

/// Per-link quality from the enriched rows and the hourly table, sorted by link.
pub fn quality_by_link(rows: &[AggregationRow], hourly: &HourlyTable) -> Vec<LinkQuality> {
    let mut raw: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for row in rows {
        let e = raw.entry(row.link_id.as_str()).or_insert((0, 0));
        e.0 += 1;
        e.1 += usize::from(row.is_valid);
    }
    let mut hours: HashMap<&str, (usize, usize, BTreeSet<chrono::NaiveDate>)> = HashMap::new();
    for rec in &hourly.records {
        let e = hours.entry(rec.link_id.as_str()).or_default();
        e.0 += 1;
        e.1 += usize::from(rec.valid_hour);
        e.2.insert(rec.date);
    }

    raw.into_iter()
        .map(|(link_id, (total, valid))| {
            let (hours_with_data, hours_valid, days) = hours
                .get(link_id)
                .map(|(h, v, d)| (*h, *v, d.len()))
                .unwrap_or((0, 0, 0));
            let pct = |num: usize, den: usize| if den > 0 { round2(num as f64 / den as f64 * 100.0) } else { 0.0 };
            LinkQuality {
                link_id: link_id.to_string(),
                percent_valid: pct(valid, total),
                hours_with_data,
                hours_valid,
                hours_dropped: hours_with_data - hours_valid,
                percent_valid_hours: pct(hours_valid, hours_with_data),
                days_covered: days,
            }
        })
        .collect()
}

pub fn write_quality_csv(path: &Path, quality: &[LinkQuality]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "link_id",
        "percent_valid",
        "hours_with_data",
        "hours_valid",
        "hours_dropped",
        "percent_valid_hours",
        "days_covered",
    ])?;
    for q in quality {
        wtr.write_record([
            q.link_id.clone(),
            q.percent_valid.to_string(),
            q.hours_with_data.to_string(),
            q.hours_valid.to_string(),
            q.hours_dropped.to_string(),
            q.percent_valid_hours.to_string(),
            q.days_covered.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Invalid reasons sorted by count, largest first; ties by reason.
pub fn invalid_reason_counts(stats: &ValidityStats) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = stats
        .invalid_reasons
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

pub fn write_reasons_csv(path: &Path, counts: &[(String, usize)]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["invalid_reason", "count"])?;
    for (reason, count) in counts {
        wtr.write_record([reason.clone(), count.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

// ============================================================================
// Processing log and run configuration
// ============================================================================

/// Human-readable summary of a run.
pub fn processing_log(
    output: &PipelineOutput,
    distinct_links: usize,
    completed: NaiveDateTime,
    elapsed: Duration,
) -> String {
    let v = &output.validity;
    let mut lines = vec![
        RULE.to_string(),
        "LINK MONITORING - PROCESSING LOG".to_string(),
        RULE.to_string(),
        format!("Processing completed: {}", completed.format("%Y-%m-%d %H:%M:%S")),
        format!("Processing duration: {:.1} seconds", elapsed.as_secs_f64()),
        String::new(),
        "ROW COUNTS:".to_string(),
        format!("  Raw data rows processed: {}", thousands(output.rows_loaded)),
        format!("  Duplicates removed: {}", thousands(output.dedup.duplicates_removed())),
        format!("  Rows without usable timestamp: {}", thousands(output.rows_unparsed)),
        format!("  Rows after filtering: {}", thousands(output.rows_after_filter)),
        format!("  Hourly aggregation rows: {}", thousands(output.hourly.len())),
        format!("  Weekly profile rows: {}", thousands(output.weekly.len())),
        String::new(),
        "DATA VALIDITY:".to_string(),
        format!("  Validation method: {}", v.method.as_str()),
        format!(
            "  Valid rows: {} / {} ({:.1}%)",
            thousands(v.valid_rows),
            thousands(v.total_rows),
            v.percent_valid()
        ),
        format!("  Invalid rows: {}", thousands(v.invalid_rows())),
        String::new(),
        "LINK COVERAGE:".to_string(),
        format!("  Distinct links processed: {}", thousands(distinct_links)),
    ];

    if !output.hourly.is_empty() {
        let mut n_valid: Vec<usize> = output.hourly.records.iter().map(|r| r.n_valid).collect();
        n_valid.sort_unstable();
        let n = n_valid.len();
        let mean = n_valid.iter().sum::<usize>() as f64 / n as f64;
        let median = if n % 2 == 1 {
            n_valid[n / 2] as f64
        } else {
            (n_valid[n / 2 - 1] + n_valid[n / 2]) as f64 / 2.0
        };
        lines.extend([
            String::new(),
            "N_VALID DISTRIBUTION (per hour):".to_string(),
            format!("  Min: {}", n_valid[0]),
            format!("  Mean: {:.1}", mean),
            format!("  Median: {:.1}", median),
            format!("  Max: {}", n_valid[n - 1]),
        ]);

        let mut by_daytype: BTreeMap<String, usize> = BTreeMap::new();
        for rec in output.hourly.valid_hours() {
            *by_daytype.entry(rec.daytype.to_string()).or_insert(0) += 1;
        }
        if !by_daytype.is_empty() {
            lines.push(String::new());
            lines.push("VALID HOURS BY DAYTYPE:".to_string());
            for (daytype, count) in by_daytype {
                lines.push(format!("  {}: {} hours", daytype, thousands(count)));
            }
        }
    }

    let reasons = invalid_reason_counts(v);
    if !reasons.is_empty() {
        lines.push(String::new());
        lines.push("INVALID REASONS:".to_string());
        for (reason, count) in reasons {
            lines.push(format!("  {}: {} rows", reason, thousands(count)));
        }
    }

    lines.push(String::new());
    lines.push(RULE.to_string());
    lines.join("\n")
}

/// Full parameter dump with sorted keys and a `_metadata` block.
pub fn run_config_json(config: &PipelineConfig, generated_at: NaiveDateTime) -> Result<String> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "_metadata".to_string(),
            json!({
                "generated_at": generated_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
                "config_version": "1.0",
                "description": "Link Monitoring Processing Configuration",
            }),
        );
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Write every artifact of a run and return name -> path of each file written.
///
/// Empty tables are skipped with a warning; the log and the configuration
/// dump are always written.
pub fn write_outputs(
    output: &PipelineOutput,
    rows: &[AggregationRow],
    config: &PipelineConfig,
    elapsed: Duration,
) -> Result<BTreeMap<String, PathBuf>> {
    let dir = &config.output_dir;
    fs::create_dir_all(dir)?;
    let mut files = BTreeMap::new();

    if output.hourly.is_empty() {
        warn!("[Report] Skipping {}: no data", HOURLY_FILE);
    } else {
        let path = dir.join(HOURLY_FILE);
        write_hourly_csv(&path, &output.hourly)?;
        info!("[Report] Written {} ({} rows)", HOURLY_FILE, output.hourly.len());
        files.insert("hourly_agg".to_string(), path);
    }

    if output.weekly.is_empty() {
        warn!("[Report] Skipping {}: no data", WEEKLY_FILE);
    } else {
        let path = dir.join(WEEKLY_FILE);
        write_weekly_csv(&path, &output.weekly, config.weekly_grouping)?;
        info!("[Report] Written {} ({} rows)", WEEKLY_FILE, output.weekly.len());
        files.insert("weekly_hourly_profile".to_string(), path);
    }

    if config.write_parquet {
        write_parquet_outputs(output, config, &mut files)?;
    }

    if config.generate_quality_reports && !rows.is_empty() && !output.hourly.is_empty() {
        let quality = quality_by_link(rows, &output.hourly);
        let path = dir.join(QUALITY_FILE);
        write_quality_csv(&path, &quality)?;
        info!("[Report] Written {} ({} links)", QUALITY_FILE, quality.len());
        files.insert("quality_by_link".to_string(), path);

        let reasons = invalid_reason_counts(&output.validity);
        if !reasons.is_empty() {
            let path = dir.join(REASONS_FILE);
            write_reasons_csv(&path, &reasons)?;
            files.insert("invalid_reason_counts".to_string(), path);
        }
    }

    let completed = now_local();
    let distinct_links = rows.iter().map(|r| r.link_id.as_str()).collect::<BTreeSet<_>>().len();
    let log_path = dir.join(LOG_FILE);
    fs::write(&log_path, processing_log(output, distinct_links, completed, elapsed))?;
    files.insert("processing_log".to_string(), log_path);

    let config_path = dir.join(CONFIG_FILE);
    fs::write(&config_path, run_config_json(config, completed)?)?;
    files.insert("run_config".to_string(), config_path);

    info!("[Report] {} files written to {}", files.len(), dir.display());
    Ok(files)
}

#[cfg(feature = "parquet")]
fn write_parquet_outputs(
    output: &PipelineOutput,
    config: &PipelineConfig,
    files: &mut BTreeMap<String, PathBuf>,
) -> Result<()> {
    use crate::columnar::{
        write_hourly_parquet, write_weekly_parquet, HOURLY_PARQUET_FILE, WEEKLY_PARQUET_FILE,
    };

    let dir = &config.output_dir;
    if !output.hourly.is_empty() {
        let path = dir.join(HOURLY_PARQUET_FILE);
        write_hourly_parquet(&path, &output.hourly)?;
        info!("[Report] Written {} ({} rows)", HOURLY_PARQUET_FILE, output.hourly.len());
        files.insert("hourly_agg_parquet".to_string(), path);
    }
    if !output.weekly.is_empty() {
        let path = dir.join(WEEKLY_PARQUET_FILE);
        write_weekly_parquet(&path, &output.weekly, config.weekly_grouping)?;
        info!("[Report] Written {} ({} rows)", WEEKLY_PARQUET_FILE, output.weekly.len());
        files.insert("weekly_hourly_profile_parquet".to_string(), path);
    }
    Ok(())
}

#[cfg(not(feature = "parquet"))]
fn write_parquet_outputs(
    _output: &PipelineOutput,
    _config: &PipelineConfig,
    _files: &mut BTreeMap<String, PathBuf>,
) -> Result<()> {
    warn!("[Report] write_parquet is set but the parquet feature is not enabled; skipping");
    Ok(())
}

// ============================================================================
// Validation results
// ============================================================================

/// Result columns appended after the input columns.
fn result_headers(table: &AnnotatedTable) -> Vec<&'static str> {
    let config = &table.config;
    let mut headers = vec!["is_valid", "valid_code"];
    if config.use_hausdorff {
        headers.extend(["hausdorff_distance", "hausdorff_pass"]);
    }
    if config.use_length_check {
        match config.length_check_mode {
            LengthCheckMode::Ratio => headers.push("length_ratio"),
            LengthCheckMode::Exact => headers.push("length_diff"),
        }
        headers.push("length_pass");
    }
    if config.use_coverage_check {
        headers.extend(["coverage_percent", "coverage_pass"]);
    }
    headers
}

fn result_cells(table: &AnnotatedTable, row: &AnnotatedRow) -> Vec<String> {
    let config = &table.config;
    let o = &row.outcome;
    let mut cells = vec![fmt_bool(o.is_valid).to_string(), o.valid_code.code().to_string()];
    if config.use_hausdorff {
        cells.push(o.hausdorff.map(|h| h.distance_m.to_string()).unwrap_or_default());
        cells.push(o.hausdorff.map(|h| fmt_bool(h.pass).to_string()).unwrap_or_default());
    }
    if config.use_length_check {
        let value = o.length.and_then(|l| match config.length_check_mode {
            LengthCheckMode::Ratio => l.ratio,
            LengthCheckMode::Exact => Some(l.diff_m),
        });
        cells.push(value.map(|v| v.to_string()).unwrap_or_default());
        cells.push(o.length.map(|l| fmt_bool(l.pass).to_string()).unwrap_or_default());
    }
    if config.use_coverage_check {
        cells.push(o.coverage.map(|c| c.percent().to_string()).unwrap_or_default());
        cells.push(o.coverage.map(|c| fmt_bool(c.pass).to_string()).unwrap_or_default());
    }
    cells
}

/// Write the annotated table: input columns unchanged, then result columns.
/// Input columns named like a result column are replaced.
pub fn write_validated_csv(path: &Path, table: &AnnotatedTable) -> Result<()> {
    let appended = result_headers(table);
    let keep: Vec<usize> = table
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !appended.contains(&h.as_str()))
        .map(|(i, _)| i)
        .collect();

    let mut wtr = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = keep.iter().map(|&i| table.headers[i].as_str()).collect();
    header.extend(appended.iter().copied());
    wtr.write_record(&header)?;

    for row in &table.rows {
        let mut record: Vec<String> = keep
            .iter()
            .map(|&i| row.observation.fields.get(i).cloned().unwrap_or_default())
            .collect();
        record.extend(result_cells(table, row));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

type GroupKey<'a> = (Option<&'a str>, Option<&'a str>);

fn group_key(row: &AnnotatedRow) -> GroupKey<'_> {
    (row.observation.link_name.as_deref(), row.observation.timestamp.as_deref())
}

/// Rows of every (link, timestamp) group in which no alternative is valid.
pub fn extract_failed_observations(rows: &[AnnotatedRow]) -> Vec<AnnotatedRow> {
    let mut any_valid: HashMap<GroupKey<'_>, bool> = HashMap::new();
    for row in rows {
        *any_valid.entry(group_key(row)).or_insert(false) |= row.outcome.is_valid;
    }
    let mut failed: Vec<AnnotatedRow> = rows
        .iter()
        .filter(|r| !any_valid.get(&group_key(r)).copied().unwrap_or(false))
        .cloned()
        .collect();
    failed.sort_by(|a, b| output_order(&a.observation, &b.observation));
    failed
}

/// Ranking score of a valid row: closer, better length match and more coverage win.
pub fn observation_score(row: &AnnotatedRow) -> f64 {
    let o = &row.outcome;
    let hausdorff = o.hausdorff.map_or(0.0, |h| -1000.0 * h.distance_m);
    let length = o.length.and_then(|l| l.ratio).map_or(0.0, |r| -100.0 * (r - 1.0).abs());
    let coverage = o.coverage.map_or(0.0, |c| c.percent());
    hausdorff + length + coverage
}

/// The best valid row of every (link, timestamp) group.
pub fn extract_best_valid_observations(rows: &[AnnotatedRow]) -> Vec<AnnotatedRow> {
    let mut order: Vec<GroupKey<'_>> = Vec::new();
    let mut best: HashMap<GroupKey<'_>, (&AnnotatedRow, f64)> = HashMap::new();
    for row in rows.iter().filter(|r| r.outcome.is_valid) {
        let key = group_key(row);
        let score = observation_score(row);
        match best.get_mut(&key) {
            Some(current) => {
                if score > current.1 {
                    *current = (row, score);
                }
            }
            None => {
                order.push(key);
                best.insert(key, (row, score));
            }
        }
    }
    let mut out: Vec<AnnotatedRow> = order
        .iter()
        .filter_map(|k| best.get(k).map(|(r, _)| (*r).clone()))
        .collect();
    out.sort_by(|a, b| output_order(&a.observation, &b.observation));
    out
}

/// Validation summary of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkValidationSummary {
    pub link_name: String,
    pub total_timestamps: usize,
    /// Timestamps with at least one valid alternative
    pub successful_timestamps: usize,
    pub single_alternative_timestamps: usize,
    pub multi_alternative_timestamps: usize,
    pub total_routes: usize,
    /// Percent of timestamps that succeeded
    pub success_rate: f64,
}

/// Per-link summaries sorted by link name. Rows without a link name or
/// stopped by a data error are left out.
pub fn summarize_links(rows: &[AnnotatedRow]) -> Vec<LinkValidationSummary> {
    let mut groups: BTreeMap<&str, BTreeMap<Option<&str>, (usize, bool)>> = BTreeMap::new();
    for row in rows {
        if row.outcome.valid_code.is_data_error() {
            continue;
        }
        let Some(link) = row.observation.link_name.as_deref() else { continue };
        let entry = groups
            .entry(link)
            .or_default()
            .entry(row.observation.timestamp.as_deref())
            .or_insert((0, false));
        entry.0 += 1;
        entry.1 |= row.outcome.is_valid;
    }

    groups
        .into_iter()
        .map(|(link, timestamps)| {
            let total_timestamps = timestamps.len();
            let successful = timestamps.values().filter(|(_, ok)| *ok).count();
            let single = timestamps.values().filter(|(n, _)| *n == 1).count();
            LinkValidationSummary {
                link_name: link.to_string(),
                total_timestamps,
                successful_timestamps: successful,
                single_alternative_timestamps: single,
                multi_alternative_timestamps: total_timestamps - single,
                total_routes: timestamps.values().map(|(n, _)| n).sum(),
                success_rate: if total_timestamps > 0 {
                    successful as f64 / total_timestamps as f64 * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect()
}

/// Row count per valid code, for quick review of a validated table.
pub fn code_breakdown(table: &AnnotatedTable) -> Vec<(ValidCode, usize)> {
    table
        .code_counts()
        .into_iter()
        .filter_map(|(code, n)| ValidCode::from_code(code).map(|c| (c, n)))
        .collect()
}
