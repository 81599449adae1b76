//! # Batch Validation
//!
//! Validates a whole observation table and assigns route-alternative context
//! codes.
//!
//! - Without a route-alternative column every row is validated on its own and
//!   every non-error row gets code 1.
//! - Otherwise rows without a timestamp get code 90 without any geometry work,
//!   and the rest are grouped by `(link name, timestamp)`: a group of one gets
//!   code 2, larger groups get code 3. Data-error codes (90-93) are never
//!   overwritten.
//!
//! Large inputs are validated in parallel chunks. Whole links stay inside one
//! chunk, each chunk owns its own caches and the reference network is shared
//! read-only. Output order never depends on completion order: results are
//! reassembled by original row index and then sorted by
//! `(link name, timestamp, route alternative)`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::error::{LinkMonitorError, OptionExt, Result};
use crate::network::ReferenceNetwork;
use crate::progress::{ProgressTracker, ValidationProgressCallback};
use crate::schema::ObservationTable;
use crate::validator::{SpatialValidator, ValidCode, ValidationConfig, ValidationOutcome};
use crate::Observation;

/// Inputs smaller than this always take the sequential path.
pub const PARALLEL_THRESHOLD: usize = 5000;

/// Work chunks per rayon thread, for load balancing across uneven links.
#[cfg(feature = "parallel")]
const CHUNKS_PER_THREAD: usize = 4;

/// An input row with its validation outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedRow {
    pub observation: Observation,
    pub outcome: ValidationOutcome,
}

/// Fully annotated validation output.
#[derive(Debug, Clone)]
pub struct AnnotatedTable {
    /// Input headers, in input order
    pub headers: Vec<String>,
    /// Whether the input had a route-alternative column
    pub route_alternative_mode: bool,
    /// Configuration used; decides which result columns exist
    pub config: ValidationConfig,
    pub rows: Vec<AnnotatedRow>,
}

impl AnnotatedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.rows.iter().filter(|r| r.outcome.is_valid).count()
    }

    /// Row count per numeric valid code.
    pub fn code_counts(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.outcome.valid_code.code()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Auto,
    Sequential,
    #[cfg(feature = "parallel")]
    Parallel,
}

/// Validate a table, choosing the parallel path for large inputs.
pub fn validate_batch(
    table: &ObservationTable,
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    progress: &dyn ValidationProgressCallback,
) -> Result<AnnotatedTable> {
    run_batch(table, network, config, progress, Strategy::Auto)
}

/// Validate a table on the calling thread only.
pub fn validate_batch_sequential(
    table: &ObservationTable,
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    progress: &dyn ValidationProgressCallback,
) -> Result<AnnotatedTable> {
    run_batch(table, network, config, progress, Strategy::Sequential)
}

/// Validate a table in parallel regardless of its size.
#[cfg(feature = "parallel")]
pub fn validate_batch_parallel(
    table: &ObservationTable,
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    progress: &dyn ValidationProgressCallback,
) -> Result<AnnotatedTable> {
    run_batch(table, network, config, progress, Strategy::Parallel)
}

fn run_batch(
    table: &ObservationTable,
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    progress: &dyn ValidationProgressCallback,
    strategy: Strategy,
) -> Result<AnnotatedTable> {
    config.validate()?;
    let rows = table.rows();
    let mode = table.has_route_alternative();
    let mut outcomes: Vec<Option<ValidationOutcome>> = vec![None; rows.len()];

    let groups: Vec<Vec<usize>> = if mode {
        let mut missing_ts = 0usize;
        let mut group_of: HashMap<(Option<&str>, &str), usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (pos, row) in rows.iter().enumerate() {
            let Some(ts) = row.timestamp.as_deref() else {
                outcomes[pos] = Some(ValidationOutcome::data_error(ValidCode::RequiredFieldsMissing));
                missing_ts += 1;
                continue;
            };
            let key = (row.link_name.as_deref(), ts);
            let gi = *group_of.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[gi].push(pos);
        }
        if missing_ts > 0 {
            info!("[BatchValidator] {} rows without timestamp marked as code 90", missing_ts);
        }
        groups
    } else {
        (0..rows.len()).map(|pos| vec![pos]).collect()
    };

    let use_parallel = match strategy {
        Strategy::Auto => cfg!(feature = "parallel") && rows.len() >= PARALLEL_THRESHOLD,
        Strategy::Sequential => false,
        #[cfg(feature = "parallel")]
        Strategy::Parallel => true,
    };

    info!(
        "[BatchValidator] Validating {} rows in {} groups ({}, route alternatives {})",
        rows.len(),
        groups.len(),
        if use_parallel { "parallel" } else { "sequential" },
        if mode { "present" } else { "absent" }
    );

    let tracker = ProgressTracker::new(progress, groups.len());
    let validated = if use_parallel {
        validate_groups_parallel(rows, &groups, network, config, mode, &tracker)?
    } else {
        validate_groups_sequential(rows, &groups, network, config, mode, &tracker)?
    };
    for (pos, outcome) in validated {
        outcomes[pos] = Some(outcome);
    }

    // Context coding needs the complete group, so it runs after all workers.
    for group in &groups {
        let context = if !mode {
            ValidCode::NoRouteAlternative
        } else if group.len() == 1 {
            ValidCode::SingleRouteAlternative
        } else {
            ValidCode::MultiRouteAlternative
        };
        for &pos in group {
            if let Some(outcome) = outcomes[pos].as_mut() {
                if !outcome.valid_code.is_data_error() {
                    outcome.valid_code = context;
                }
            }
        }
    }

    let mut annotated = rows
        .iter()
        .zip(outcomes)
        .map(|(row, outcome)| {
            Ok(AnnotatedRow {
                observation: row.clone(),
                outcome: outcome.ok_or_internal("row left without a validation outcome")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if mode {
        annotated.sort_by(|a, b| output_order(&a.observation, &b.observation));
    }

    let result = AnnotatedTable {
        headers: table.schema().headers().to_vec(),
        route_alternative_mode: mode,
        config: config.clone(),
        rows: annotated,
    };
    info!(
        "[BatchValidator] Completed: {}/{} rows valid, codes {:?}",
        result.valid_count(),
        result.len(),
        result.code_counts()
    );
    Ok(result)
}

fn validate_groups_sequential(
    rows: &[Observation],
    groups: &[Vec<usize>],
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    mode: bool,
    tracker: &ProgressTracker<'_>,
) -> Result<Vec<(usize, ValidationOutcome)>> {
    let mut validator = SpatialValidator::new(network, config)?;
    let mut out = Vec::with_capacity(rows.len());
    for group in groups {
        for &pos in group {
            out.push((pos, validator.validate(&rows[pos], mode)?));
        }
        tracker.advance(1);
    }
    Ok(out)
}

#[cfg(feature = "parallel")]
fn validate_groups_parallel(
    rows: &[Observation],
    groups: &[Vec<usize>],
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    mode: bool,
    tracker: &ProgressTracker<'_>,
) -> Result<Vec<(usize, ValidationOutcome)>> {
    use rayon::prelude::*;

    let n_chunks = rayon::current_num_threads().max(1) * CHUNKS_PER_THREAD;
    let chunks = partition_by_link(rows, groups, n_chunks);
    debug!(
        "[BatchValidator] {} groups split into {} chunks",
        groups.len(),
        chunks.len()
    );

    let per_chunk: Vec<Vec<(usize, ValidationOutcome)>> = chunks
        .par_iter()
        .enumerate()
        .map(|(chunk_index, chunk)| {
            let fail = |e: LinkMonitorError| LinkMonitorError::WorkerFailed {
                chunk_index,
                source: Box::new(e),
            };
            let mut validator = SpatialValidator::new(network, config).map_err(fail)?;
            let mut out = Vec::new();
            for &gi in chunk {
                for &pos in &groups[gi] {
                    let outcome = validator.validate(&rows[pos], mode).map_err(fail)?;
                    out.push((pos, outcome));
                }
                tracker.advance(1);
            }
            Ok(out)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(per_chunk.into_iter().flatten().collect())
}

#[cfg(not(feature = "parallel"))]
fn validate_groups_parallel(
    rows: &[Observation],
    groups: &[Vec<usize>],
    network: &ReferenceNetwork,
    config: &ValidationConfig,
    mode: bool,
    tracker: &ProgressTracker<'_>,
) -> Result<Vec<(usize, ValidationOutcome)>> {
    validate_groups_sequential(rows, groups, network, config, mode, tracker)
}

/// Split groups into at most `n_chunks` chunks, keeping each link whole.
///
/// Links are placed largest first onto the currently lightest chunk.
#[cfg_attr(not(feature = "parallel"), allow(dead_code))]
fn partition_by_link(rows: &[Observation], groups: &[Vec<usize>], n_chunks: usize) -> Vec<Vec<usize>> {
    let mut link_order: Vec<Option<&str>> = Vec::new();
    let mut by_link: HashMap<Option<&str>, (Vec<usize>, usize)> = HashMap::new();
    for (gi, group) in groups.iter().enumerate() {
        let Some(&first) = group.first() else { continue };
        let link = rows[first].link_name.as_deref();
        let entry = by_link.entry(link).or_insert_with(|| {
            link_order.push(link);
            (Vec::new(), 0)
        });
        entry.0.push(gi);
        entry.1 += group.len();
    }

    let mut buckets: Vec<(Vec<usize>, usize)> = link_order
        .iter()
        .filter_map(|link| by_link.remove(link))
        .collect();
    buckets.sort_by(|a, b| b.1.cmp(&a.1));

    let n_chunks = n_chunks.clamp(1, buckets.len().max(1));
    let mut chunks: Vec<(Vec<usize>, usize)> = vec![(Vec::new(), 0); n_chunks];
    for (group_ids, size) in buckets {
        if let Some(lightest) = chunks.iter_mut().min_by_key(|c| c.1) {
            lightest.0.extend(group_ids);
            lightest.1 += size;
        }
    }
    chunks
        .into_iter()
        .filter(|c| !c.0.is_empty())
        .map(|c| c.0)
        .collect()
}

fn none_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Final output order: link name, timestamp, route alternative; missing values last.
pub(crate) fn output_order(a: &Observation, b: &Observation) -> Ordering {
    none_last(&a.link_name, &b.link_name)
        .then_with(|| none_last(&a.timestamp, &b.timestamp))
        .then_with(|| none_last(&a.route_alternative, &b.route_alternative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::progress::NoopProgress;
    use crate::projection::Crs;
    use geo::{Coord, LineString};

    fn network() -> ReferenceNetwork {
        let a = LineString::new(vec![Coord { x: 34.780, y: 32.080 }, Coord { x: 34.782, y: 32.080 }]);
        let b = LineString::new(vec![Coord { x: 34.790, y: 32.090 }, Coord { x: 34.790, y: 32.092 }]);
        ReferenceNetwork::build(
            vec![
                ("1".to_string(), "2".to_string(), a),
                ("3".to_string(), "4".to_string(), b),
            ],
            Crs::wgs84(),
            Crs::israeli_tm(),
        )
        .unwrap()
    }

    fn poly_1_2(offset: f64) -> String {
        encode(
            &[
                Coord { x: 34.780, y: 32.080 + offset },
                Coord { x: 34.782, y: 32.080 + offset },
            ],
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_geometry_only_mode_codes() {
        let net = network();
        let good = poly_1_2(0.0);
        let table = ObservationTable::from_observations(
            vec![
                Observation::new(0, Some("s_1-2"), None, None, Some(good.as_str())),
                Observation::new(1, Some("s_1-2"), None, None, Some(poly_1_2(0.001).as_str())),
                Observation::new(2, Some("bogus"), None, None, Some(good.as_str())),
            ],
            false,
        );
        let out = validate_batch(&table, &net, &ValidationConfig::default(), &NoopProgress).unwrap();
        let codes: Vec<u8> = out.rows.iter().map(|r| r.outcome.valid_code.code()).collect();
        assert_eq!(codes, vec![1, 1, 91]);
        assert_eq!(
            out.rows.iter().map(|r| r.outcome.is_valid).collect::<Vec<_>>(),
            vec![true, false, false]
        );
    }

    #[test]
    fn test_single_and_multi_alternative_codes() {
        let net = network();
        let good = poly_1_2(0.0);
        let bad = poly_1_2(0.001);
        let table = ObservationTable::from_observations(
            vec![
                Observation::new(0, Some("s_1-2"), Some("2025-01-01 10:00"), Some(2), Some(bad.as_str())),
                Observation::new(1, Some("s_1-2"), Some("2025-01-01 10:00"), Some(1), Some(good.as_str())),
                Observation::new(2, Some("s_1-2"), Some("2025-01-01 10:15"), Some(1), Some(good.as_str())),
                Observation::new(3, Some("s_1-2"), None, Some(1), Some(good.as_str())),
                Observation::new(4, Some("s_9-9"), Some("2025-01-01 10:00"), Some(1), Some(good.as_str())),
                Observation::new(5, Some("s_9-9"), Some("2025-01-01 10:00"), Some(2), Some(good.as_str())),
            ],
            true,
        );
        let out = validate_batch(&table, &net, &ValidationConfig::default(), &NoopProgress).unwrap();

        let summary: Vec<(usize, u8, bool)> = out
            .rows
            .iter()
            .map(|r| (r.observation.index, r.outcome.valid_code.code(), r.outcome.is_valid))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, 3, true),
                (0, 3, false),
                (2, 2, true),
                (3, 90, false),
                // Link not in the network keeps its error code inside a multi group
                (4, 92, false),
                (5, 92, false),
            ]
        );
    }

    #[test]
    fn test_partition_keeps_links_whole() {
        let rows: Vec<Observation> = (0..10)
            .map(|i| {
                let link = format!("s_{}-{}", i % 3, i % 3 + 1);
                Observation::new(i, Some(link.as_str()), Some("t"), Some(1), None)
            })
            .collect();
        let groups: Vec<Vec<usize>> = (0..10).map(|i| vec![i]).collect();
        let chunks = partition_by_link(&rows, &groups, 8);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            let links: std::collections::HashSet<_> =
                chunk.iter().map(|&g| rows[groups[g][0]].link_name.clone()).collect();
            assert_eq!(links.len(), 1);
        }
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_output_order_puts_missing_last() {
        let a = Observation::new(0, Some("s_1-2"), None, Some(1), None);
        let b = Observation::new(1, Some("s_1-2"), Some("2025"), Some(2), None);
        let c = Observation::new(2, None, Some("2025"), Some(1), None);
        let mut rows = vec![a.clone(), c.clone(), b.clone()];
        rows.sort_by(output_order);
        assert_eq!(rows, vec![b, a, c]);
    }

    #[test]
    fn test_code_counts() {
        let net = network();
        let table = ObservationTable::from_observations(
            vec![
                Observation::new(0, Some("s_1-2"), Some("t1"), Some(1), Some(poly_1_2(0.0).as_str())),
                Observation::new(1, Some("s_1-2"), None, Some(1), Some(poly_1_2(0.0).as_str())),
            ],
            true,
        );
        let out = validate_batch(&table, &net, &ValidationConfig::default(), &NoopProgress).unwrap();
        let counts = out.code_counts();
        assert_eq!(counts.get(&2), Some(&1));
        assert_eq!(counts.get(&90), Some(&1));
        assert_eq!(out.valid_count(), 1);
    }
}
