//! # Columnar Output
//!
//! Parquet copies of the hourly and weekly aggregation tables, written next
//! to the CSV files when `write_parquet` is set.
//!
//! Column names and order follow the CSV outputs. Dates are stored as
//! `Date32` and missing metrics as nulls rather than empty strings.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, StringArray, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::aggregation::{HourlyTable, WeeklyGrouping, WeeklyKey, WeeklyRecord};
use crate::error::Result;

pub const HOURLY_PARQUET_FILE: &str = "hourly_agg.parquet";
pub const WEEKLY_PARQUET_FILE: &str = "weekly_hourly_profile.parquet";

/// `num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn float_column(values: impl Iterator<Item = Option<f64>>) -> ArrayRef {
    Arc::new(values.collect::<Float64Array>())
}

/// Hourly table as a single record batch.
pub fn hourly_batch(hourly: &HourlyTable) -> Result<RecordBatch> {
    let recs = &hourly.records;
    let schema = Schema::new(vec![
        Field::new("link_id", DataType::Utf8, false),
        Field::new("date", DataType::Date32, false),
        Field::new("hour_of_day", DataType::UInt32, false),
        Field::new("daytype", DataType::Utf8, false),
        Field::new("n_total", DataType::UInt64, false),
        Field::new("n_valid", DataType::UInt64, false),
        Field::new("valid_hour", DataType::Boolean, false),
        Field::new("no_valid_hour", DataType::UInt8, false),
        Field::new("avg_duration_sec", DataType::Float64, true),
        Field::new("std_duration_sec", DataType::Float64, true),
        Field::new("avg_distance_m", DataType::Float64, true),
        Field::new("avg_speed_kmh", DataType::Float64, true),
    ]);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(recs.iter().map(|r| r.link_id.as_str()))),
        Arc::new(Date32Array::from(recs.iter().map(|r| days_since_epoch(r.date)).collect::<Vec<_>>())),
        Arc::new(UInt32Array::from(recs.iter().map(|r| r.hour_of_day).collect::<Vec<_>>())),
        Arc::new(StringArray::from_iter_values(recs.iter().map(|r| r.daytype.as_str()))),
        Arc::new(UInt64Array::from(recs.iter().map(|r| r.n_total as u64).collect::<Vec<_>>())),
        Arc::new(UInt64Array::from(recs.iter().map(|r| r.n_valid as u64).collect::<Vec<_>>())),
        Arc::new(BooleanArray::from(recs.iter().map(|r| r.valid_hour).collect::<Vec<_>>())),
        Arc::new(UInt8Array::from(recs.iter().map(|r| r.no_valid_hour()).collect::<Vec<_>>())),
        float_column(recs.iter().map(|r| r.avg_duration_sec)),
        float_column(recs.iter().map(|r| r.std_duration_sec)),
        float_column(recs.iter().map(|r| r.avg_distance_m)),
        float_column(recs.iter().map(|r| r.avg_speed_kmh)),
    ];
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

/// Weekly profile as a single record batch. The second column is `daytype`
/// (text) or `weekday_index` (integer) depending on `grouping`.
pub fn weekly_batch(weekly: &[WeeklyRecord], grouping: WeeklyGrouping) -> Result<RecordBatch> {
    let key_column: ArrayRef = match grouping {
        WeeklyGrouping::DayType => Arc::new(
            weekly
                .iter()
                .map(|r| match r.key {
                    WeeklyKey::DayType(d) => Some(d.as_str()),
                    WeeklyKey::WeekdayIndex(_) => None,
                })
                .collect::<StringArray>(),
        ),
        WeeklyGrouping::WeekdayIndex => Arc::new(
            weekly
                .iter()
                .map(|r| match r.key {
                    WeeklyKey::WeekdayIndex(i) => Some(i),
                    WeeklyKey::DayType(_) => None,
                })
                .collect::<UInt32Array>(),
        ),
    };
    let key_type = match grouping {
        WeeklyGrouping::DayType => DataType::Utf8,
        WeeklyGrouping::WeekdayIndex => DataType::UInt32,
    };

    let schema = Schema::new(vec![
        Field::new("link_id", DataType::Utf8, false),
        Field::new(grouping.column_name(), key_type, true),
        Field::new("hour_of_day", DataType::UInt32, false),
        Field::new("avg_n_valid", DataType::Float64, false),
        Field::new("total_valid_n", DataType::UInt64, false),
        Field::new("total_not_valid", DataType::UInt64, false),
        Field::new("avg_dur", DataType::Float64, true),
        Field::new("std_dur", DataType::Float64, true),
        Field::new("avg_dist", DataType::Float64, true),
        Field::new("avg_speed", DataType::Float64, true),
        Field::new("n_days", DataType::UInt64, false),
    ]);

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(weekly.iter().map(|r| r.link_id.as_str()))),
        key_column,
        Arc::new(UInt32Array::from(weekly.iter().map(|r| r.hour_of_day).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(weekly.iter().map(|r| r.avg_n_valid).collect::<Vec<_>>())),
        Arc::new(UInt64Array::from(weekly.iter().map(|r| r.total_valid_n as u64).collect::<Vec<_>>())),
        Arc::new(UInt64Array::from(weekly.iter().map(|r| r.total_not_valid as u64).collect::<Vec<_>>())),
        float_column(weekly.iter().map(|r| r.avg_dur)),
        float_column(weekly.iter().map(|r| r.std_dur)),
        float_column(weekly.iter().map(|r| r.avg_dist)),
        float_column(weekly.iter().map(|r| r.avg_speed)),
        Arc::new(UInt64Array::from(weekly.iter().map(|r| r.n_days as u64).collect::<Vec<_>>())),
    ];
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

pub fn write_hourly_parquet(path: &Path, hourly: &HourlyTable) -> Result<()> {
    write_batch(path, &hourly_batch(hourly)?)
}

pub fn write_weekly_parquet(path: &Path, weekly: &[WeeklyRecord], grouping: WeeklyGrouping) -> Result<()> {
    write_batch(path, &weekly_batch(weekly, grouping)?)
}
