//! End-to-end pipeline tests.
//!
//! Runs geometric validation into `validated.csv`, then feeds that file to
//! the aggregation pipeline and checks the written artifacts.
//!
//! Run with: `cargo test --test pipeline_run`

use std::fs;
use std::path::Path;

use geo::{Coord, LineString};
use link_monitor::{
    codec, run_pipeline, validate_csv, Crs, DayType, LinkMonitorError, NoopProgress,
    PipelineConfig, ReferenceNetwork, ValidationConfig, ValidityMethod, WeeklyKey,
};
use tempfile::TempDir;

fn network() -> ReferenceNetwork {
    let line = LineString::new(vec![
        Coord { x: 34.7900, y: 32.0900 },
        Coord { x: 34.7930, y: 32.0900 },
    ]);
    ReferenceNetwork::build(
        vec![("1".to_string(), "2".to_string(), line)],
        Crs::wgs84(),
        Crs::israeli_tm(),
    )
    .unwrap()
}

fn polyline(lat: f64) -> String {
    let coords = [Coord { x: 34.7900, y: lat }, Coord { x: 34.7930, y: lat }];
    codec::encode(&coords, 5).unwrap()
}

/// Raw observations for link `s_1-2` on Monday 2025-01-06 and Tuesday 2025-01-07.
fn write_raw_input(path: &Path) {
    let good = polyline(32.0900);
    let bad = polyline(32.0905);
    let rows: Vec<(&str, u32, &str, &str, &str)> = vec![
        ("1", 1, "2025-01-06 08:05", "weekday", good.as_str()),
        ("2", 2, "2025-01-06 08:05", "weekday", bad.as_str()),
        ("3", 1, "2025-01-06 08:20", "weekday", good.as_str()),
        ("4", 1, "2025-01-06 08:40", "weekday", bad.as_str()),
        ("5", 1, "2025-01-06 09:10", "weekday", good.as_str()),
        ("6", 1, "2025-01-07 08:15", "weekday", good.as_str()),
        ("7", 1, "2025-01-07 08:30", "weekday", good.as_str()),
    ];

    let mut wtr = csv::Writer::from_path(path).unwrap();
    wtr.write_record([
        "DataID",
        "Name",
        "RouteAlternative",
        "Timestamp",
        "DayType",
        "Duration (seconds)",
        "Distance (meters)",
        "Speed (km/h)",
        "Polyline",
    ])
    .unwrap();
    for (id, alt, ts, daytype, poly) in rows {
        let alt = alt.to_string();
        wtr.write_record([id, "s_1-2", alt.as_str(), ts, daytype, "60", "280", "16.8", poly])
            .unwrap();
    }
    wtr.flush().unwrap();
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path).unwrap().lines().map(String::from).collect()
}

// ============================================================================
// Validation then aggregation
// ============================================================================

#[test]
fn test_validate_then_aggregate() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("raw.csv");
    write_raw_input(&raw);

    let validated = validate_csv(
        &raw,
        &network(),
        &ValidationConfig::default(),
        dir.path(),
        &NoopProgress,
    )
    .unwrap();
    assert_eq!(validated.len(), 7);
    assert_eq!(validated.valid_count(), 5);

    let validated_path = dir.path().join("validated.csv");
    let lines = read_lines(&validated_path);
    assert_eq!(lines.len(), 8);
    assert!(lines[0].starts_with("DataID,Name,RouteAlternative,Timestamp"));
    assert!(lines[0].ends_with("is_valid,valid_code,hausdorff_distance,hausdorff_pass"));

    let out_dir = dir.path().join("agg");
    let mut config = PipelineConfig::new(&validated_path, &out_dir);
    config.min_valid_per_hour = 2;
    let output = run_pipeline(&config).unwrap();

    assert_eq!(output.validity.method, ValidityMethod::BooleanIsValidColumn);
    assert_eq!(output.rows_loaded, 7);
    // The second alternative at 08:05 shares link and timestamp with the first
    assert_eq!(output.dedup.link_timestamp_duplicates, 1);
    assert_eq!(output.rows_unparsed, 0);
    assert_eq!(output.rows_after_filter, 6);

    // Monday 08, Monday 09, Tuesday 08
    let hourly = &output.hourly.records;
    assert_eq!(hourly.len(), 3);
    assert_eq!((hourly[0].n_total, hourly[0].n_valid, hourly[0].valid_hour), (3, 2, true));
    assert_eq!((hourly[1].n_total, hourly[1].n_valid, hourly[1].valid_hour), (1, 1, false));
    assert_eq!((hourly[2].n_total, hourly[2].n_valid, hourly[2].valid_hour), (2, 2, true));
    for record in hourly {
        assert!(record.n_valid <= record.n_total);
        assert_eq!(record.daytype, DayType::Weekday);
    }
    assert_eq!(hourly[0].avg_duration_sec, Some(60.0));

    assert_eq!(output.weekly.len(), 1);
    let weekly = &output.weekly[0];
    assert_eq!(weekly.link_id, "s_1-2");
    assert_eq!(weekly.key, WeeklyKey::DayType(DayType::Weekday));
    assert_eq!(weekly.hour_of_day, 8);
    assert_eq!(weekly.n_days, 2);
    assert_eq!(weekly.total_valid_n, 4);
    assert_eq!(weekly.total_not_valid, 1);
    assert!((weekly.avg_n_valid - 2.0).abs() < 1e-9);

    for name in [
        "hourly_agg.csv",
        "weekly_hourly_profile.csv",
        "quality_by_link.csv",
        "processing_log.txt",
        "run_config.json",
    ] {
        assert!(out_dir.join(name).exists(), "missing {}", name);
    }
    assert_eq!(read_lines(&out_dir.join("hourly_agg.csv")).len(), 4);

    let log = fs::read_to_string(out_dir.join("processing_log.txt")).unwrap();
    assert!(log.contains("LINK MONITORING - PROCESSING LOG"));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out_dir.join("run_config.json")).unwrap()).unwrap();
    assert_eq!(json["min_valid_per_hour"], 2);
    assert!(json["_metadata"].is_object());
}

// ============================================================================
// Degenerate inputs
// ============================================================================

#[test]
fn test_unparseable_timestamps_yield_empty_tables() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    fs::write(
        &input,
        "Name,Timestamp,Duration,Distance,Speed\n\
         s_1-2,not a time,60,280,16.8\n\
         s_1-2,,60,280,16.8\n",
    )
    .unwrap();

    let out_dir = dir.path().join("out");
    let config = PipelineConfig::new(&input, &out_dir);
    let output = run_pipeline(&config).unwrap();

    assert_eq!(output.validity.method, ValidityMethod::NumericRangeRules);
    assert!(output.hourly.is_empty());
    assert!(output.weekly.is_empty());
    assert_eq!(output.rows_unparsed, 2);
    assert!(!out_dir.join("hourly_agg.csv").exists());
    assert!(out_dir.join("processing_log.txt").exists());
    assert!(out_dir.join("run_config.json").exists());
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = PipelineConfig::new(dir.path().join("missing.csv"), dir.path());
    config.timezone = "Mars/Olympus_Mons".to_string();
    let err = run_pipeline(&config).unwrap_err();
    assert!(err.to_string().contains("timezone"), "{}", err);
}

#[test]
fn test_mismatched_timestamp_format_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    fs::write(
        &input,
        "Name,Timestamp,Duration,Distance,Speed\n\
         s_1-2,2025-01-06 08:05,60,280,16.8\n\
         s_1-2,,60,280,16.8\n",
    )
    .unwrap();

    let mut config = PipelineConfig::new(&input, dir.path().join("out"));
    config.timestamp_format = Some("%d/%m/%Y %H:%M".to_string());
    let err = run_pipeline(&config).unwrap_err();
    assert!(matches!(err, LinkMonitorError::Timestamp { .. }), "{}", err);
    assert!(err.to_string().contains("%d/%m/%Y %H:%M"));

    // The matching format is accepted
    config.timestamp_format = Some("%Y-%m-%d %H:%M".to_string());
    let output = run_pipeline(&config).unwrap();
    assert_eq!(output.hourly.len(), 1);
}

#[test]
fn test_holiday_overrides_weekday() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    fs::write(
        &input,
        "Name,Timestamp,DayType,Duration,Distance,Speed\n\
         s_1-2,2025-01-06 08:05,weekday,60,280,16.8\n\
         s_1-2,2025-01-07 08:05,weekday,60,280,16.8\n",
    )
    .unwrap();
    let holidays = dir.path().join("holidays.txt");
    fs::write(&holidays, "# test calendar\n2025-01-06 Office closure\n").unwrap();

    let mut config = PipelineConfig::new(&input, dir.path().join("out"));
    config.holidays_file = Some(holidays);
    let output = run_pipeline(&config).unwrap();

    let daytypes: Vec<DayType> = output.hourly.records.iter().map(|r| r.daytype).collect();
    assert_eq!(daytypes, vec![DayType::Holiday, DayType::Weekday]);
    assert_eq!(output.weekly.len(), 2);
}

#[cfg(feature = "parquet")]
#[test]
fn test_parquet_mirrors_match_csv() {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    init_logging();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    fs::write(
        &input,
        "Name,Timestamp,DayType,Duration,Distance,Speed\n\
         s_1-2,2025-01-06 08:05,weekday,60,280,16.8\n\
         s_1-2,2025-01-06 09:05,weekday,60,280,16.8\n\
         s_1-2,2025-01-13 08:05,weekday,60,280,16.8\n",
    )
    .unwrap();

    let out_dir = dir.path().join("out");
    let mut config = PipelineConfig::new(&input, &out_dir);
    config.write_parquet = true;
    let output = run_pipeline(&config).unwrap();
    assert!(output.output_files.contains_key("hourly_agg_parquet"));
    assert!(output.output_files.contains_key("weekly_hourly_profile_parquet"));

    let rows_in = |name: &str| -> usize {
        let file = fs::File::open(out_dir.join(name)).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|b| b.unwrap().num_rows())
            .sum()
    };
    assert_eq!(rows_in("hourly_agg.parquet"), output.hourly.len());
    assert_eq!(rows_in("hourly_agg.parquet"), 3);
    assert_eq!(rows_in("weekly_hourly_profile.parquet"), output.weekly.len());
    assert_eq!(rows_in("weekly_hourly_profile.parquet"), 2);
}

#[test]
fn test_parquet_is_off_by_default() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.csv");
    fs::write(&input, "Name,Timestamp,Duration,Distance,Speed\ns_1-2,2025-01-06 08:05,60,280,16.8\n").unwrap();

    let out_dir = dir.path().join("out");
    let output = run_pipeline(&PipelineConfig::new(&input, &out_dir)).unwrap();
    assert!(!PipelineConfig::default().write_parquet);
    assert!(!out_dir.join("hourly_agg.parquet").exists());
    assert!(!output.output_files.contains_key("hourly_agg_parquet"));
}
