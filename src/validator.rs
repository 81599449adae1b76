//! # Spatial Validator
//!
//! Validates one observation's decoded polyline against its reference link.
//!
//! Validation runs in two phases:
//!
//! 1. A data-availability gate (codes 90 to 93) that returns early with a
//!    tagged [`ValidationOutcome`]. These are per-row results, not errors.
//! 2. The enabled geometric tests (Hausdorff, length, coverage). All enabled
//!    tests always run so the outcome carries full diagnostics; `is_valid` is
//!    the AND of their pass flags.
//!
//! Projection failures are returned as [`LinkMonitorError::Projection`] and
//! are never converted into a failing row.

use serde::{Deserialize, Serialize};

use crate::codec::{PolylineCodec, DEFAULT_DECODE_CACHE_SIZE, DEFAULT_PRECISION};
use crate::error::{LinkMonitorError, Result};
use crate::geometry::{coverage_fraction, hausdorff_distance, line_length};
use crate::network::{parse_link_name, ReferenceNetwork};
use crate::projection::{Crs, ProjectorCache, DEFAULT_METRIC_CRS};
use crate::Observation;

/// Ratio bounds are widened by this much for links shorter than `min_link_length_m`.
const SHORT_LINK_RATIO_SLACK: f64 = 0.05;

/// Fraction of `min_link_length_m` used as the exact-mode tolerance floor for short links.
const SHORT_LINK_EPSILON_FRACTION: f64 = 0.01;

/// How the length test compares polyline and reference lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthCheckMode {
    /// `polyline / reference` within `[length_ratio_min, length_ratio_max]`
    Ratio,
    /// `|polyline - reference|` within `epsilon_length_m`
    Exact,
}

/// Configuration for the geometric tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Enable the Hausdorff distance test
    pub use_hausdorff: bool,
    /// Maximum Hausdorff distance in metres (default: 5.0)
    pub hausdorff_threshold_m: f64,
    /// Enable the length-similarity test
    pub use_length_check: bool,
    pub length_check_mode: LengthCheckMode,
    /// Ratio bounds (default: 0.90 / 1.10)
    pub length_ratio_min: f64,
    pub length_ratio_max: f64,
    /// Exact-mode tolerance in metres (default: 0.5)
    pub epsilon_length_m: f64,
    /// Reference links shorter than this get widened tolerances (default: 20.0)
    pub min_link_length_m: f64,
    /// Enable the coverage test
    pub use_coverage_check: bool,
    /// Minimum covered fraction of the reference (default: 0.85)
    pub coverage_min: f64,
    /// Buffer width in metres for the overlap retry (default: 1.0)
    pub coverage_spacing_m: f64,
    /// Projected CRS for all distance math (default: EPSG:2039)
    pub metric_crs: String,
    /// Polyline coordinate precision (default: 5)
    pub polyline_precision: u32,
    /// Decode cache size per validator
    pub decode_cache_size: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            use_hausdorff: true,
            hausdorff_threshold_m: 5.0,
            use_length_check: false,
            length_check_mode: LengthCheckMode::Ratio,
            length_ratio_min: 0.90,
            length_ratio_max: 1.10,
            epsilon_length_m: 0.5,
            min_link_length_m: 20.0,
            use_coverage_check: false,
            coverage_min: 0.85,
            coverage_spacing_m: 1.0,
            metric_crs: DEFAULT_METRIC_CRS.to_string(),
            polyline_precision: DEFAULT_PRECISION,
            decode_cache_size: DEFAULT_DECODE_CACHE_SIZE,
        }
    }
}

impl ValidationConfig {
    /// Resolve and check the metric CRS.
    pub fn metric_crs(&self) -> Result<Crs> {
        let crs: Crs = self.metric_crs.parse()?;
        if crs.is_geographic()? {
            return Err(LinkMonitorError::config(
                "metric_crs",
                format!("must be a projected CRS, got {}", crs),
            ));
        }
        Ok(crs)
    }

    /// Check thresholds before any row is processed.
    pub fn validate(&self) -> Result<()> {
        self.metric_crs()?;
        let non_negative = [
            ("hausdorff_threshold_m", self.hausdorff_threshold_m),
            ("epsilon_length_m", self.epsilon_length_m),
            ("min_link_length_m", self.min_link_length_m),
            ("coverage_spacing_m", self.coverage_spacing_m),
            ("length_ratio_min", self.length_ratio_min),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(LinkMonitorError::config(
                    name,
                    format!("must be a finite non-negative number, got {}", value),
                ));
            }
        }
        if !(self.length_ratio_max >= self.length_ratio_min) {
            return Err(LinkMonitorError::config(
                "length_ratio_max",
                format!(
                    "must be >= length_ratio_min ({}), got {}",
                    self.length_ratio_min, self.length_ratio_max
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.coverage_min) {
            return Err(LinkMonitorError::config(
                "coverage_min",
                format!("must be between 0 and 1, got {}", self.coverage_min),
            ));
        }
        if !(1..=10).contains(&self.polyline_precision) {
            return Err(LinkMonitorError::config(
                "polyline_precision",
                format!("must be between 1 and 10, got {}", self.polyline_precision),
            ));
        }
        Ok(())
    }
}

/// Per-row code. Context codes describe the grouping, error codes the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValidCode {
    /// Reserved; no rule currently assigns it
    ExactMatch,
    /// Input has no route-alternative column
    NoRouteAlternative,
    /// Only row for its (link, timestamp)
    SingleRouteAlternative,
    /// One of several rows for its (link, timestamp)
    MultiRouteAlternative,
    RequiredFieldsMissing,
    NameParseFailure,
    LinkNotInShapefile,
    PolylineDecodeFailure,
}

impl ValidCode {
    pub fn code(self) -> u8 {
        match self {
            ValidCode::ExactMatch => 0,
            ValidCode::NoRouteAlternative => 1,
            ValidCode::SingleRouteAlternative => 2,
            ValidCode::MultiRouteAlternative => 3,
            ValidCode::RequiredFieldsMissing => 90,
            ValidCode::NameParseFailure => 91,
            ValidCode::LinkNotInShapefile => 92,
            ValidCode::PolylineDecodeFailure => 93,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ValidCode::ExactMatch,
            1 => ValidCode::NoRouteAlternative,
            2 => ValidCode::SingleRouteAlternative,
            3 => ValidCode::MultiRouteAlternative,
            90 => ValidCode::RequiredFieldsMissing,
            91 => ValidCode::NameParseFailure,
            92 => ValidCode::LinkNotInShapefile,
            93 => ValidCode::PolylineDecodeFailure,
            _ => return None,
        })
    }

    /// Data-availability failures (90-93); never overwritten by context coding.
    pub fn is_data_error(self) -> bool {
        self.code() >= 90
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HausdorffResult {
    pub distance_m: f64,
    pub pass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthResult {
    pub mode: LengthCheckMode,
    pub polyline_length_m: f64,
    pub reference_length_m: f64,
    /// `None` for a degenerate (zero-length) reference
    pub ratio: Option<f64>,
    pub diff_m: f64,
    pub pass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageResult {
    /// Covered fraction in `[0, 1]`
    pub fraction: f64,
    pub pass: bool,
}

impl CoverageResult {
    pub fn percent(&self) -> f64 {
        self.fraction * 100.0
    }
}

/// Result of validating one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub valid_code: ValidCode,
    /// Present only when the Hausdorff test is enabled and the gate passed
    pub hausdorff: Option<HausdorffResult>,
    pub length: Option<LengthResult>,
    pub coverage: Option<CoverageResult>,
}

impl ValidationOutcome {
    /// Outcome for a row stopped by the data-availability gate.
    pub fn data_error(code: ValidCode) -> Self {
        Self {
            is_valid: false,
            valid_code: code,
            hausdorff: None,
            length: None,
            coverage: None,
        }
    }

    /// Recompute `is_valid` from whichever test results are present.
    fn with_aggregate_validity(mut self) -> Self {
        self.is_valid = self.hausdorff.map_or(true, |r| r.pass)
            && self.length.map_or(true, |r| r.pass)
            && self.coverage.map_or(true, |r| r.pass);
        self
    }
}

/// Length-similarity test on metric lengths.
pub fn evaluate_length(polyline_length: f64, reference_length: f64, config: &ValidationConfig) -> LengthResult {
    let diff = (polyline_length - reference_length).abs();
    let mut result = LengthResult {
        mode: config.length_check_mode,
        polyline_length_m: polyline_length,
        reference_length_m: reference_length,
        ratio: None,
        diff_m: diff,
        pass: false,
    };

    if reference_length <= 0.0 {
        result.pass = polyline_length.abs() <= config.epsilon_length_m;
        return result;
    }

    let short_link = reference_length < config.min_link_length_m;
    match config.length_check_mode {
        LengthCheckMode::Ratio => {
            let ratio = polyline_length / reference_length;
            let (lo, hi) = if short_link {
                (
                    (config.length_ratio_min - SHORT_LINK_RATIO_SLACK).max(0.0),
                    config.length_ratio_max + SHORT_LINK_RATIO_SLACK,
                )
            } else {
                (config.length_ratio_min, config.length_ratio_max)
            };
            result.ratio = Some(ratio);
            result.pass = lo <= ratio && ratio <= hi;
        }
        LengthCheckMode::Exact => {
            let epsilon = if short_link {
                config
                    .epsilon_length_m
                    .max(SHORT_LINK_EPSILON_FRACTION * config.min_link_length_m)
            } else {
                config.epsilon_length_m
            };
            result.ratio = Some(polyline_length / reference_length);
            result.pass = diff <= epsilon;
        }
    }
    result
}

/// Validates observations against a shared reference network.
///
/// Owns its decode and projector caches; build one per worker.
pub struct SpatialValidator<'a> {
    network: &'a ReferenceNetwork,
    config: &'a ValidationConfig,
    geographic_crs: Crs,
    metric_crs: Crs,
    codec: PolylineCodec,
    projectors: ProjectorCache,
}

impl<'a> SpatialValidator<'a> {
    pub fn new(network: &'a ReferenceNetwork, config: &'a ValidationConfig) -> Result<Self> {
        config.validate()?;
        let metric_crs = config.metric_crs()?;
        if &metric_crs != network.metric_crs() {
            return Err(LinkMonitorError::config(
                "metric_crs",
                format!(
                    "is {} but the reference network was projected to {}",
                    metric_crs,
                    network.metric_crs()
                ),
            ));
        }
        Ok(Self {
            network,
            config,
            geographic_crs: Crs::wgs84(),
            metric_crs,
            codec: PolylineCodec::new(config.decode_cache_size),
            projectors: ProjectorCache::new(),
        })
    }

    pub fn config(&self) -> &ValidationConfig {
        self.config
    }

    /// Validate one observation.
    ///
    /// `require_route_alternative` adds the route-alternative field to the
    /// required set and selects the placeholder context code (2 instead of 1).
    pub fn validate(
        &mut self,
        observation: &Observation,
        require_route_alternative: bool,
    ) -> Result<ValidationOutcome> {
        let name = observation.link_name.as_deref().filter(|s| !s.trim().is_empty());
        let polyline = observation.polyline.as_deref().filter(|s| !s.trim().is_empty());
        let (Some(name), Some(polyline)) = (name, polyline) else {
            return Ok(ValidationOutcome::data_error(ValidCode::RequiredFieldsMissing));
        };
        if require_route_alternative && observation.route_alternative.is_none() {
            return Ok(ValidationOutcome::data_error(ValidCode::RequiredFieldsMissing));
        }

        let Some((from_node, to_node)) = parse_link_name(name) else {
            return Ok(ValidationOutcome::data_error(ValidCode::NameParseFailure));
        };
        let Some(reference) = self.network.lookup(&from_node, &to_node) else {
            return Ok(ValidationOutcome::data_error(ValidCode::LinkNotInShapefile));
        };
        let Ok(decoded) = self.codec.decode(polyline, self.config.polyline_precision) else {
            return Ok(ValidationOutcome::data_error(ValidCode::PolylineDecodeFailure));
        };

        let context = if require_route_alternative {
            ValidCode::SingleRouteAlternative
        } else {
            ValidCode::NoRouteAlternative
        };
        let mut outcome = ValidationOutcome {
            is_valid: false,
            valid_code: context,
            hausdorff: None,
            length: None,
            coverage: None,
        };

        let config = self.config;
        if !(config.use_hausdorff || config.use_length_check || config.use_coverage_check) {
            return Ok(outcome.with_aggregate_validity());
        }

        let projected = self
            .projectors
            .project(&decoded, &self.geographic_crs, &self.metric_crs)?;
        let reference_metric = &reference.geometry_metric;

        if config.use_hausdorff {
            let distance_m = hausdorff_distance(&projected, reference_metric);
            outcome.hausdorff = Some(HausdorffResult {
                distance_m,
                pass: distance_m <= config.hausdorff_threshold_m,
            });
        }

        if config.use_length_check {
            outcome.length = Some(evaluate_length(
                line_length(&projected),
                reference.length_m,
                config,
            ));
        }

        if config.use_coverage_check {
            let fraction = coverage_fraction(reference_metric, &projected, config.coverage_spacing_m);
            outcome.coverage = Some(CoverageResult {
                fraction,
                pass: fraction >= config.coverage_min,
            });
        }

        Ok(outcome.with_aggregate_validity())
    }
}
