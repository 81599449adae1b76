//! # Link Monitor
//!
//! Geometric validation and temporal aggregation of GPS link-monitoring
//! observations (polyline samples of road segments).
//!
//! This library provides:
//! - Polyline decoding with a bounded decode cache
//! - Projection of lon/lat geometry into a metric CRS
//! - Per-observation validation against a reference road network
//!   (Hausdorff distance, length similarity, coverage)
//! - Batch validation with route-alternative context coding, sequential or parallel
//! - Hourly and weekly aggregation of validated observations, with flat-file reports
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel batch validation with rayon (default)
//!
//! ## Quick Start
//!
//! ```rust
//! use geo::{Coord, LineString};
//! use link_monitor::{
//!     codec, validate_batch, Crs, NoopProgress, Observation, ObservationTable,
//!     ReferenceNetwork, ValidCode, ValidationConfig,
//! };
//!
//! let reference = LineString::new(vec![
//!     Coord { x: 34.780, y: 32.080 },
//!     Coord { x: 34.782, y: 32.080 },
//! ]);
//! let network = ReferenceNetwork::build(
//!     vec![("653".to_string(), "655".to_string(), reference.clone())],
//!     Crs::wgs84(),
//!     Crs::israeli_tm(),
//! )
//! .unwrap();
//!
//! let polyline = codec::encode(&reference.0, 5).unwrap();
//! let table = ObservationTable::from_observations(
//!     vec![Observation::new(0, Some("s_653-655"), None, None, Some(polyline.as_str()))],
//!     false,
//! );
//!
//! let result = validate_batch(&table, &network, &ValidationConfig::default(), &NoopProgress).unwrap();
//! assert!(result.rows[0].outcome.is_valid);
//! assert_eq!(result.rows[0].outcome.valid_code, ValidCode::NoRouteAlternative);
//! ```

// Unified error handling
pub mod error;
pub use error::{LinkMonitorError, OptionExt, Result};

// Polyline decoding/encoding with LRU cache
pub mod codec;
pub use codec::{DecodeError, PolylineCodec};

// CRS definitions and cached projectors
pub mod projection;
pub use projection::{Crs, Projector, ProjectorCache};

// Reference network and link-name parsing
pub mod network;
pub use network::{link_id, parse_link_name, ReferenceLink, ReferenceNetwork};

// Metric geometry primitives (Hausdorff, length, coverage)
pub mod geometry;

// Single-observation validation
pub mod validator;
pub use validator::{
    CoverageResult, HausdorffResult, LengthCheckMode, LengthResult, SpatialValidator, ValidCode,
    ValidationConfig, ValidationOutcome,
};

// Progress callbacks for batch work
pub mod progress;
pub use progress::{NoopProgress, ValidationProgressCallback};

// Batch validation with context coding
pub mod batch;
pub use batch::{
    validate_batch, validate_batch_sequential, AnnotatedRow, AnnotatedTable, PARALLEL_THRESHOLD,
};
#[cfg(feature = "parallel")]
pub use batch::validate_batch_parallel;

// Input column aliasing
pub mod schema;
pub use schema::{Field, InputSchema, ObservationTable};

// Timestamp parsing and calendar enrichment
pub mod temporal;
pub use temporal::{
    DayType, DaytypeMapper, HolidayCalendar, HolidayEntry, HolidayTreatment, TemporalEnricher,
    TimeContext,
};

// Hourly and weekly aggregation
pub mod aggregation;
pub use aggregation::{
    aggregate_hourly, aggregate_weekly, AggregationRow, HourlyRecord, HourlyTable, WeeklyGrouping,
    WeeklyKey, WeeklyRecord,
};

// Parquet copies of the aggregation tables
#[cfg(feature = "parquet")]
pub mod columnar;

// End-to-end aggregation run
pub mod pipeline;
pub use pipeline::{
    run_pipeline, validate_csv, DedupStats, LinkList, PipelineConfig, PipelineOutput,
    ValidityMethod, ValidityStats,
};

// Output artifacts and validation report helpers
pub mod report;
pub use report::{
    extract_best_valid_observations, extract_failed_observations, summarize_links,
    LinkValidationSummary,
};

// ============================================================================
// Core Types
// ============================================================================

/// One raw observation row.
///
/// The typed fields are extracted once at load; `fields` keeps every input
/// cell verbatim so output tables can reproduce the input unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Position in the input file, carried through every stage
    pub index: usize,
    pub link_name: Option<String>,
    /// Raw timestamp text (grouping key; parsing happens in aggregation)
    pub timestamp: Option<String>,
    pub route_alternative: Option<u32>,
    pub polyline: Option<String>,
    /// Passthrough cells in input column order
    pub fields: Vec<String>,
}

impl Observation {
    /// Create an observation without passthrough cells.
    pub fn new(
        index: usize,
        link_name: Option<&str>,
        timestamp: Option<&str>,
        route_alternative: Option<u32>,
        polyline: Option<&str>,
    ) -> Self {
        Self {
            index,
            link_name: link_name.map(String::from),
            timestamp: timestamp.map(String::from),
            route_alternative,
            polyline: polyline.map(String::from),
            fields: Vec::new(),
        }
    }
}
