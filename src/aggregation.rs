//! # Aggregation
//!
//! Rolls validated observations up into hourly and weekly traffic profiles.
//!
//! ## Hourly
//! One record per `(link_id, date, hour_of_day, daytype)`. Counts include
//! every row; metrics come from valid rows only and are `None` whenever the
//! hour has no valid row.
//!
//! ## Weekly
//! One record per `(link_id, daytype | weekday_index, hour_of_day)`, built only
//! from hourly records with `valid_hour = true`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::temporal::DayType;

/// One validated, time-enriched observation ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRow {
    pub link_id: String,
    pub date: NaiveDate,
    pub hour_of_day: u32,
    pub daytype: DayType,
    pub is_valid: bool,
    pub duration: Option<f64>,
    pub distance: Option<f64>,
    pub speed: Option<f64>,
}

/// Mean of the finite values, `None` when there are none.
pub fn mean(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Sample standard deviation (ddof = 1), `None` below two values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return None;
    }
    let m = finite.iter().sum::<f64>() / finite.len() as f64;
    let ss: f64 = finite.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (finite.len() - 1) as f64).sqrt())
}

// ============================================================================
// Hourly
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct HourlyRecord {
    pub link_id: String,
    pub date: NaiveDate,
    pub hour_of_day: u32,
    pub daytype: DayType,
    pub n_total: usize,
    pub n_valid: usize,
    pub valid_hour: bool,
    pub avg_duration_sec: Option<f64>,
    pub std_duration_sec: Option<f64>,
    pub avg_distance_m: Option<f64>,
    pub avg_speed_kmh: Option<f64>,
    /// Durations of the valid rows, kept for pooled weekly statistics
    valid_durations: Vec<f64>,
}

impl HourlyRecord {
    /// `1` when the hour is not valid, else `0`.
    pub fn no_valid_hour(&self) -> u8 {
        u8::from(!self.valid_hour)
    }

    /// Monday = 0 ... Sunday = 6
    pub fn weekday_index(&self) -> u32 {
        self.date.weekday().num_days_from_monday()
    }

    pub fn valid_durations(&self) -> &[f64] {
        &self.valid_durations
    }
}

/// Hourly records sorted by `(link_id, date, hour_of_day, daytype)`.
#[derive(Debug, Clone, Default)]
pub struct HourlyTable {
    pub records: Vec<HourlyRecord>,
    pub min_valid_per_hour: usize,
}

impl HourlyTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn valid_hours(&self) -> impl Iterator<Item = &HourlyRecord> {
        self.records.iter().filter(|r| r.valid_hour)
    }
}

#[derive(Default)]
struct HourAccumulator {
    n_total: usize,
    n_valid: usize,
    durations: Vec<f64>,
    distances: Vec<f64>,
    speeds: Vec<f64>,
}

/// Build the hourly table.
pub fn aggregate_hourly(rows: &[AggregationRow], min_valid_per_hour: usize) -> HourlyTable {
    if rows.is_empty() {
        warn!("[Aggregation] No rows to aggregate into hours");
        return HourlyTable {
            records: Vec::new(),
            min_valid_per_hour,
        };
    }
    info!("[Aggregation] Creating hourly aggregation from {} rows", rows.len());

    let mut groups: BTreeMap<(&str, NaiveDate, u32, DayType), HourAccumulator> = BTreeMap::new();
    for row in rows {
        let acc = groups
            .entry((row.link_id.as_str(), row.date, row.hour_of_day, row.daytype))
            .or_default();
        acc.n_total += 1;
        if row.is_valid {
            acc.n_valid += 1;
            acc.durations.extend(row.duration.filter(|v| v.is_finite()));
            acc.distances.extend(row.distance.filter(|v| v.is_finite()));
            acc.speeds.extend(row.speed.filter(|v| v.is_finite()));
        }
    }

    let records: Vec<HourlyRecord> = groups
        .into_iter()
        .map(|((link_id, date, hour_of_day, daytype), acc)| {
            let has_valid = acc.n_valid > 0;
            HourlyRecord {
                link_id: link_id.to_string(),
                date,
                hour_of_day,
                daytype,
                n_total: acc.n_total,
                n_valid: acc.n_valid,
                valid_hour: acc.n_valid >= min_valid_per_hour,
                avg_duration_sec: mean(&acc.durations).filter(|_| has_valid),
                std_duration_sec: sample_std(&acc.durations).filter(|_| has_valid),
                avg_distance_m: mean(&acc.distances).filter(|_| has_valid),
                avg_speed_kmh: mean(&acc.speeds).filter(|_| has_valid),
                valid_durations: acc.durations,
            }
        })
        .collect();

    let valid = records.iter().filter(|r| r.valid_hour).count();
    let links: BTreeSet<&str> = records.iter().map(|r| r.link_id.as_str()).collect();
    info!(
        "[Aggregation] Hourly aggregation: {} hour-link combinations, {} valid (>= {} valid rows), {} links",
        records.len(),
        valid,
        min_valid_per_hour,
        links.len()
    );

    HourlyTable {
        records,
        min_valid_per_hour,
    }
}

// ============================================================================
// Weekly
// ============================================================================

/// Second key of the weekly profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeeklyGrouping {
    #[default]
    #[serde(rename = "daytype")]
    DayType,
    WeekdayIndex,
}

impl WeeklyGrouping {
    /// Header of the grouping column.
    pub fn column_name(self) -> &'static str {
        match self {
            WeeklyGrouping::DayType => "daytype",
            WeeklyGrouping::WeekdayIndex => "weekday_index",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeeklyKey {
    DayType(DayType),
    WeekdayIndex(u32),
}

impl fmt::Display for WeeklyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeeklyKey::DayType(d) => write!(f, "{}", d),
            WeeklyKey::WeekdayIndex(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyRecord {
    pub link_id: String,
    pub key: WeeklyKey,
    pub hour_of_day: u32,
    pub avg_n_valid: f64,
    pub total_valid_n: usize,
    pub total_not_valid: usize,
    pub avg_dur: Option<f64>,
    pub std_dur: Option<f64>,
    pub avg_dist: Option<f64>,
    pub avg_speed: Option<f64>,
    pub n_days: usize,
}

#[derive(Default)]
struct WeekAccumulator {
    total_valid_n: usize,
    total_not_valid: usize,
    avg_durs: Vec<f64>,
    std_durs: Vec<f64>,
    avg_dists: Vec<f64>,
    avg_speeds: Vec<f64>,
    raw_durations: Vec<f64>,
    dates: BTreeSet<NaiveDate>,
}

/// Build the weekly profile from the valid hours of `hourly`.
///
/// With `recompute_std_from_raw` the duration spread is the sample standard
/// deviation of all pooled valid durations of the group; otherwise it is the
/// mean of the hourly standard deviations.
pub fn aggregate_weekly(
    hourly: &HourlyTable,
    grouping: WeeklyGrouping,
    recompute_std_from_raw: bool,
) -> Vec<WeeklyRecord> {
    let valid: Vec<&HourlyRecord> = hourly.valid_hours().collect();
    if valid.is_empty() {
        warn!("[Aggregation] No valid hours found for weekly profile generation");
        return Vec::new();
    }
    info!(
        "[Aggregation] Creating weekly profile from {} of {} hours, grouped by {}",
        valid.len(),
        hourly.len(),
        grouping.column_name()
    );

    let mut groups: BTreeMap<(&str, WeeklyKey, u32), WeekAccumulator> = BTreeMap::new();
    for rec in valid {
        let key = match grouping {
            WeeklyGrouping::DayType => WeeklyKey::DayType(rec.daytype),
            WeeklyGrouping::WeekdayIndex => WeeklyKey::WeekdayIndex(rec.weekday_index()),
        };
        let acc = groups.entry((rec.link_id.as_str(), key, rec.hour_of_day)).or_default();
        acc.total_valid_n += rec.n_valid;
        acc.total_not_valid += rec.n_total - rec.n_valid;
        acc.avg_durs.extend(rec.avg_duration_sec);
        acc.std_durs.extend(rec.std_duration_sec);
        acc.avg_dists.extend(rec.avg_distance_m);
        acc.avg_speeds.extend(rec.avg_speed_kmh);
        acc.raw_durations.extend_from_slice(&rec.valid_durations);
        acc.dates.insert(rec.date);
    }

    let records: Vec<WeeklyRecord> = groups
        .into_iter()
        .map(|((link_id, key, hour_of_day), acc)| {
            let n_days = acc.dates.len();
            let std_dur = if recompute_std_from_raw {
                sample_std(&acc.raw_durations)
            } else {
                mean(&acc.std_durs)
            };
            WeeklyRecord {
                link_id: link_id.to_string(),
                key,
                hour_of_day,
                avg_n_valid: acc.total_valid_n as f64 / n_days as f64,
                total_valid_n: acc.total_valid_n,
                total_not_valid: acc.total_not_valid,
                avg_dur: mean(&acc.avg_durs),
                std_dur,
                avg_dist: mean(&acc.avg_dists),
                avg_speed: mean(&acc.avg_speeds),
                n_days,
            }
        })
        .collect();

    info!("[Aggregation] Weekly profile: {} profiles", records.len());
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(link: &str, day: u32, hour: u32, valid: bool, duration: f64) -> AggregationRow {
        let date = NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        AggregationRow {
            link_id: link.to_string(),
            date,
            hour_of_day: hour,
            daytype: DayType::from_weekday_index(date.weekday().num_days_from_monday()),
            is_valid: valid,
            duration: Some(duration),
            distance: Some(1000.0),
            speed: Some(3600.0 / duration),
        }
    }

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 3.0, f64::NAN]), Some(2.0));
        assert_eq!(sample_std(&[5.0]), None);
        let s = sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((s - 2.138089935).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_hour_excluded_from_weekly() {
        // 4 rows, 1 valid, threshold 2
        let rows = vec![
            row("s_1-2", 6, 8, true, 100.0),
            row("s_1-2", 6, 8, false, 500.0),
            row("s_1-2", 6, 8, false, 500.0),
            row("s_1-2", 6, 8, false, 500.0),
        ];
        let hourly = aggregate_hourly(&rows, 2);
        assert_eq!(hourly.len(), 1);
        let rec = &hourly.records[0];
        assert_eq!((rec.n_total, rec.n_valid), (4, 1));
        assert!(!rec.valid_hour);
        assert_eq!(rec.no_valid_hour(), 1);
        // Metrics come from the valid row only
        assert_eq!(rec.avg_duration_sec, Some(100.0));
        assert_eq!(rec.std_duration_sec, None);

        assert!(aggregate_weekly(&hourly, WeeklyGrouping::DayType, false).is_empty());
    }

    #[test]
    fn test_zero_valid_hour_has_null_metrics() {
        let rows = vec![row("s_1-2", 6, 9, false, 100.0), row("s_1-2", 6, 9, false, 120.0)];
        let hourly = aggregate_hourly(&rows, 0);
        let rec = &hourly.records[0];
        assert_eq!(rec.n_valid, 0);
        assert!(rec.valid_hour);
        assert_eq!(rec.avg_duration_sec, None);
        assert_eq!(rec.std_duration_sec, None);
        assert_eq!(rec.avg_distance_m, None);
        assert_eq!(rec.avg_speed_kmh, None);
    }

    #[test]
    fn test_hourly_sorted_by_key() {
        let rows = vec![
            row("s_2-3", 6, 8, true, 100.0),
            row("s_1-2", 7, 8, true, 100.0),
            row("s_1-2", 6, 9, true, 100.0),
            row("s_1-2", 6, 8, true, 100.0),
        ];
        let hourly = aggregate_hourly(&rows, 1);
        let keys: Vec<(&str, u32, u32)> = hourly
            .records
            .iter()
            .map(|r| (r.link_id.as_str(), r.date.day(), r.hour_of_day))
            .collect();
        assert_eq!(keys, vec![("s_1-2", 6, 8), ("s_1-2", 6, 9), ("s_1-2", 7, 8), ("s_2-3", 6, 8)]);
    }

    #[test]
    fn test_weekly_by_daytype() {
        // Monday 6th and Tuesday 7th, both weekdays, same hour
        let rows = vec![
            row("s_1-2", 6, 8, true, 100.0),
            row("s_1-2", 6, 8, true, 120.0),
            row("s_1-2", 6, 8, false, 999.0),
            row("s_1-2", 7, 8, true, 140.0),
        ];
        let hourly = aggregate_hourly(&rows, 1);
        let weekly = aggregate_weekly(&hourly, WeeklyGrouping::DayType, false);
        assert_eq!(weekly.len(), 1);
        let w = &weekly[0];
        assert_eq!(w.key, WeeklyKey::DayType(DayType::Weekday));
        assert_eq!(w.n_days, 2);
        assert_eq!(w.total_valid_n, 3);
        assert_eq!(w.total_not_valid, 1);
        assert!((w.avg_n_valid - 1.5).abs() < 1e-12);
        assert!((w.avg_n_valid - w.total_valid_n as f64 / w.n_days as f64).abs() < 1e-12);
        // mean of 110 and 140
        assert_eq!(w.avg_dur, Some(125.0));
        // only day 6 has an hourly std
        let day6_std = sample_std(&[100.0, 120.0]).unwrap();
        assert!((w.std_dur.unwrap() - day6_std).abs() < 1e-12);
    }

    #[test]
    fn test_weekly_std_from_raw() {
        let rows = vec![
            row("s_1-2", 6, 8, true, 100.0),
            row("s_1-2", 6, 8, true, 120.0),
            row("s_1-2", 7, 8, true, 140.0),
        ];
        let hourly = aggregate_hourly(&rows, 1);
        let weekly = aggregate_weekly(&hourly, WeeklyGrouping::DayType, true);
        assert!((weekly[0].std_dur.unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_weekly_by_weekday_index() {
        let rows = vec![
            row("s_1-2", 6, 8, true, 100.0),
            row("s_1-2", 13, 8, true, 100.0),
            row("s_1-2", 7, 8, true, 100.0),
        ];
        let hourly = aggregate_hourly(&rows, 1);
        let weekly = aggregate_weekly(&hourly, WeeklyGrouping::WeekdayIndex, false);
        assert_eq!(weekly.len(), 2);
        assert_eq!(weekly[0].key, WeeklyKey::WeekdayIndex(0));
        assert_eq!(weekly[0].n_days, 2);
        assert_eq!(weekly[1].key, WeeklyKey::WeekdayIndex(1));
        assert_eq!(weekly[1].n_days, 1);
    }

    fn row_as(day: u32, daytype: DayType, valid: bool, duration: f64) -> AggregationRow {
        AggregationRow {
            daytype,
            ..row("s_1-2", day, 8, valid, duration)
        }
    }

    /// Monday 6th is split into a weekday part and a holiday part within the
    /// same hour; Monday 13th is a plain weekday.
    fn split_monday_rows() -> Vec<AggregationRow> {
        vec![
            row_as(6, DayType::Weekday, true, 100.0),
            row_as(6, DayType::Weekday, true, 120.0),
            row_as(6, DayType::Weekday, false, 999.0),
            row_as(6, DayType::Holiday, true, 160.0),
            row_as(6, DayType::Holiday, true, 200.0),
            row_as(13, DayType::Weekday, true, 90.0),
        ]
    }

    #[test]
    fn test_weekday_index_counts_days_not_hours() {
        let hourly = aggregate_hourly(&split_monday_rows(), 1);
        // (6, weekday), (6, holiday), (13, weekday)
        assert_eq!(hourly.len(), 3);

        let weekly = aggregate_weekly(&hourly, WeeklyGrouping::WeekdayIndex, false);
        assert_eq!(weekly.len(), 1);
        let w = &weekly[0];
        assert_eq!(w.key, WeeklyKey::WeekdayIndex(0));
        assert_eq!(w.n_days, 2);
        assert_eq!(w.total_valid_n, 5);
        assert_eq!(w.total_not_valid, 1);
        // 5 valid rows over 2 distinct dates, not the mean of 2, 2 and 1
        assert!((w.avg_n_valid - 2.5).abs() < 1e-12);
        let hourly_mean = hourly.records.iter().map(|r| r.n_valid as f64).sum::<f64>() / 3.0;
        assert!((w.avg_n_valid - hourly_mean).abs() > 0.5);

        // Mean of the hourly means 110, 180 and 90
        assert!((w.avg_dur.unwrap() - 380.0 / 3.0).abs() < 1e-9);
        assert_eq!(w.avg_dist, Some(1000.0));
        // Mean of the hourly stds sqrt(200) and sqrt(800); the single-row hour has none
        assert!((w.std_dur.unwrap() - 21.213_203_435_596_43).abs() < 1e-9);

        let pooled = aggregate_weekly(&hourly, WeeklyGrouping::WeekdayIndex, true);
        // Sample std of 100, 120, 160, 200, 90: sqrt(8320 / 4)
        assert!((pooled[0].std_dur.unwrap() - 45.607_017_003_965_52).abs() < 1e-9);
        assert_eq!(pooled[0].avg_dur, w.avg_dur);
    }

    #[test]
    fn test_split_day_by_daytype() {
        let hourly = aggregate_hourly(&split_monday_rows(), 1);
        let weekly = aggregate_weekly(&hourly, WeeklyGrouping::DayType, false);
        assert_eq!(weekly.len(), 2);
        let find = |d: DayType| weekly.iter().find(|w| w.key == WeeklyKey::DayType(d)).unwrap();

        let weekday = find(DayType::Weekday);
        assert_eq!((weekday.n_days, weekday.total_valid_n, weekday.total_not_valid), (2, 3, 1));
        assert!((weekday.avg_n_valid - 1.5).abs() < 1e-12);
        assert!((weekday.avg_dur.unwrap() - 100.0).abs() < 1e-9);
        assert!((weekday.std_dur.unwrap() - 200f64.sqrt()).abs() < 1e-9);

        let holiday = find(DayType::Holiday);
        assert_eq!((holiday.n_days, holiday.total_valid_n, holiday.total_not_valid), (1, 2, 0));
        assert!((holiday.avg_n_valid - 2.0).abs() < 1e-12);
        assert!((holiday.std_dur.unwrap() - 800f64.sqrt()).abs() < 1e-9);

        let pooled = aggregate_weekly(&hourly, WeeklyGrouping::DayType, true);
        let weekday = pooled.iter().find(|w| w.key == WeeklyKey::DayType(DayType::Weekday)).unwrap();
        // Sample std of 100, 120, 90: sqrt(1400 / 3 / 2)
        assert!((weekday.std_dur.unwrap() - 15.275_252_316_519_467).abs() < 1e-9);
    }

    #[test]
    fn test_grouping_serde_names() {
        assert_eq!(serde_json::to_string(&WeeklyGrouping::DayType).unwrap(), "\"daytype\"");
        assert_eq!(
            serde_json::from_str::<WeeklyGrouping>("\"weekday_index\"").unwrap(),
            WeeklyGrouping::WeekdayIndex
        );
    }
}
