//! Metric geometry primitives used by the spatial validator.
//!
//! All functions expect projected coordinates in metres.

use geo::{Coord, Euclidean, HausdorffDistance, Length, LineString};
use rstar::{RTree, RTreeObject, AABB};

/// Overlap tolerance used for the "exact" intersection pass.
const EXACT_OVERLAP_TOLERANCE: f64 = 1e-9;

/// Smallest buffer width used for the overlap retry.
pub const MIN_BUFFER_WIDTH: f64 = 1e-6;

/// Drop non-finite and consecutive duplicate vertices.
///
/// Returns `None` when fewer than two distinct vertices remain, i.e. the
/// geometry is empty after repair.
pub fn repair(line: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(line.0.len());
    for c in line.0.iter().filter(|c| c.x.is_finite() && c.y.is_finite()) {
        if coords.last() != Some(c) {
            coords.push(*c);
        }
    }
    if coords.len() < 2 {
        return None;
    }
    Some(LineString::new(coords))
}

/// Planar length of a line string.
pub fn line_length(line: &LineString<f64>) -> f64 {
    Euclidean.length(line)
}

/// Symmetric discrete Hausdorff distance.
///
/// Empty geometries (after repair) and NaN results yield `+inf`.
pub fn hausdorff_distance(a: &LineString<f64>, b: &LineString<f64>) -> f64 {
    let (Some(a), Some(b)) = (repair(a), repair(b)) else {
        return f64::INFINITY;
    };
    let d = a.hausdorff_distance(&b);
    if d.is_nan() {
        f64::INFINITY
    } else {
        d
    }
}

/// A line segment with its position in the source line, for R-tree queries.
#[derive(Debug, Clone, Copy)]
struct IndexedSegment {
    start: [f64; 2],
    end: [f64; 2],
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.start, self.end)
    }
}

fn build_segment_tree(line: &LineString<f64>) -> RTree<IndexedSegment> {
    let segments: Vec<IndexedSegment> = line
        .0
        .windows(2)
        .map(|w| IndexedSegment {
            start: [w[0].x, w[0].y],
            end: [w[1].x, w[1].y],
        })
        .collect();
    RTree::bulk_load(segments)
}

/// Parameter interval `[t0, t1]` where `p0 + t * p1` lies in `[lo, hi]`.
fn slab(p0: f64, p1: f64, lo: f64, hi: f64) -> Option<(f64, f64)> {
    if p1.abs() < f64::EPSILON {
        return (lo..=hi).contains(&p0).then_some((f64::NEG_INFINITY, f64::INFINITY));
    }
    let a = (lo - p0) / p1;
    let b = (hi - p0) / p1;
    Some((a.min(b), a.max(b)))
}

/// Parameter interval where `a + t * d` is within `r` of `centre`.
fn disc_interval(a: [f64; 2], d: [f64; 2], centre: [f64; 2], r: f64) -> Option<(f64, f64)> {
    let qa = d[0] * d[0] + d[1] * d[1];
    if qa <= 0.0 {
        return None;
    }
    let ox = a[0] - centre[0];
    let oy = a[1] - centre[1];
    let qb = 2.0 * (d[0] * ox + d[1] * oy);
    let qc = ox * ox + oy * oy - r * r;
    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return None;
    }
    let root = disc.sqrt();
    Some(((-qb - root) / (2.0 * qa), (-qb + root) / (2.0 * qa)))
}

/// Portion `[t0, t1] ⊆ [0, 1]` of segment `a -> b` lying within `r` of segment `seg`.
///
/// The r-neighbourhood of a segment is a convex capsule (rectangle plus two
/// end discs), so the hit set along a line is a single interval.
fn covered_interval(a: [f64; 2], b: [f64; 2], seg: &IndexedSegment, r: f64) -> Option<(f64, f64)> {
    let d = [b[0] - a[0], b[1] - a[1]];
    let mut pieces: Vec<(f64, f64)> = Vec::with_capacity(3);

    pieces.extend(disc_interval(a, d, seg.start, r));
    pieces.extend(disc_interval(a, d, seg.end, r));

    let sx = seg.end[0] - seg.start[0];
    let sy = seg.end[1] - seg.start[1];
    let len = sx.hypot(sy);
    if len > 0.0 {
        let (ux, uy) = (sx / len, sy / len);
        let (vx, vy) = (-uy, ux);
        let ox = a[0] - seg.start[0];
        let oy = a[1] - seg.start[1];
        let along = slab(ox * ux + oy * uy, d[0] * ux + d[1] * uy, 0.0, len);
        let across = slab(ox * vx + oy * vy, d[0] * vx + d[1] * vy, -r, r);
        if let (Some(s), Some(w)) = (along, across) {
            let lo = s.0.max(w.0);
            let hi = s.1.min(w.1);
            if lo <= hi {
                pieces.push((lo, hi));
            }
        }
    }

    let lo = pieces.iter().map(|p| p.0).fold(f64::INFINITY, f64::min).max(0.0);
    let hi = pieces.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max).min(1.0);
    (lo < hi).then_some((lo, hi))
}

/// Total length of `reference` lying within `tolerance` of `other`.
pub fn overlap_length(reference: &LineString<f64>, other: &LineString<f64>, tolerance: f64) -> f64 {
    if reference.0.len() < 2 || other.0.len() < 2 {
        return 0.0;
    }
    let tree = build_segment_tree(other);
    let mut total = 0.0;

    for w in reference.0.windows(2) {
        let a = [w[0].x, w[0].y];
        let b = [w[1].x, w[1].y];
        let seg_len = (b[0] - a[0]).hypot(b[1] - a[1]);
        if seg_len <= 0.0 {
            continue;
        }

        let search = AABB::from_corners(
            [a[0].min(b[0]) - tolerance, a[1].min(b[1]) - tolerance],
            [a[0].max(b[0]) + tolerance, a[1].max(b[1]) + tolerance],
        );
        let mut intervals: Vec<(f64, f64)> = tree
            .locate_in_envelope_intersecting(&search)
            .filter_map(|seg| covered_interval(a, b, seg, tolerance))
            .collect();
        if intervals.is_empty() {
            continue;
        }

        intervals.sort_by(|x, y| x.0.total_cmp(&y.0));
        let mut covered = 0.0;
        let (mut cur_lo, mut cur_hi) = intervals[0];
        for &(lo, hi) in &intervals[1..] {
            if lo > cur_hi {
                covered += cur_hi - cur_lo;
                cur_lo = lo;
                cur_hi = hi;
            } else {
                cur_hi = cur_hi.max(hi);
            }
        }
        covered += cur_hi - cur_lo;
        total += covered * seg_len;
    }
    total
}

/// Fraction of `reference` covered by `polyline`, in `[0, 1]`.
///
/// Exact overlap is tried first; when it is zero the polyline is buffered by
/// `max(spacing, 1e-6)` and the overlap recomputed.
pub fn coverage_fraction(reference: &LineString<f64>, polyline: &LineString<f64>, spacing: f64) -> f64 {
    let ref_len = line_length(reference);
    if ref_len <= 0.0 {
        return 0.0;
    }
    let mut overlap = overlap_length(reference, polyline, EXACT_OVERLAP_TOLERANCE);
    if overlap <= 0.0 {
        overlap = overlap_length(reference, polyline, spacing.max(MIN_BUFFER_WIDTH));
    }
    (overlap / ref_len).clamp(0.0, 1.0)
}
