//! # Polyline Codec
//!
//! Decoding and encoding of Google-style delta-encoded polylines, with a
//! bounded LRU cache for repeated inputs (batches often repeat the same
//! route string across many timestamps).
//!
//! Decoded geometries are stored as `x = longitude, y = latitude` even though
//! the wire order is latitude first.

use std::num::NonZeroUsize;

use geo::{Coord, LineString};
use lru::LruCache;

/// Default number of decoded polylines kept per codec instance.
pub const DEFAULT_DECODE_CACHE_SIZE: usize = 4096;

/// Default coordinate precision (decimal places).
pub const DEFAULT_PRECISION: u32 = 5;

/// Why a polyline string could not be turned into a usable geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Null or empty input
    Empty,
    /// Characters outside the encoding alphabet or a truncated value
    Malformed(String),
    /// Decoded fine but yields fewer than two points
    TooFewPoints(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty polyline"),
            DecodeError::Malformed(msg) => write!(f, "malformed polyline: {}", msg),
            DecodeError::TooFewPoints(n) => write!(f, "polyline has {} points, 2 required", n),
        }
    }
}

/// Check the raw character stream before handing it to the decoder.
///
/// Every byte must sit in the 63..=126 alphabet, the final byte must close a
/// value (no continuation bit) and values come in lat/lon pairs.
fn check_stream(encoded: &str) -> std::result::Result<(), DecodeError> {
    let bytes = encoded.as_bytes();
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut values = 0usize;
    for (pos, &b) in bytes.iter().enumerate() {
        if !(63..=126).contains(&b) {
            return Err(DecodeError::Malformed(format!(
                "invalid character {:?} at position {}",
                b as char, pos
            )));
        }
        if (b - 63) & 0x20 == 0 {
            values += 1;
        }
    }

    if (bytes[bytes.len() - 1] - 63) & 0x20 != 0 {
        return Err(DecodeError::Malformed("truncated final value".to_string()));
    }
    if values % 2 != 0 {
        return Err(DecodeError::Malformed(format!(
            "odd number of encoded values ({})",
            values
        )));
    }
    Ok(())
}

/// Decode an encoded polyline without caching.
///
/// # Example
/// ```
/// use link_monitor::codec::decode;
///
/// let line = decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@", 5).unwrap();
/// assert_eq!(line.0.len(), 3);
/// assert!((line.0[0].y - 38.5).abs() < 1e-9);
/// assert!((line.0[0].x + 120.2).abs() < 1e-9);
/// ```
pub fn decode(encoded: &str, precision: u32) -> std::result::Result<LineString<f64>, DecodeError> {
    let trimmed = encoded.trim();
    check_stream(trimmed)?;

    let line = polyline::decode_polyline(trimmed, precision)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if line.0.len() < 2 {
        return Err(DecodeError::TooFewPoints(line.0.len()));
    }
    Ok(line)
}

/// Encode `(x = lon, y = lat)` coordinates into a polyline string.
pub fn encode(coords: &[Coord<f64>], precision: u32) -> Option<String> {
    polyline::encode_coordinates(coords.iter().copied(), precision).ok()
}

/// A polyline decoder that memoizes results keyed on `(encoded, precision)`.
///
/// Each instance owns its cache; parallel workers build their own.
pub struct PolylineCodec {
    cache: LruCache<(String, u32), std::result::Result<LineString<f64>, DecodeError>>,
    hits: u64,
    misses: u64,
}

impl PolylineCodec {
    /// Create a codec whose cache holds at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Decode, consulting the cache first. Failures are cached too.
    pub fn decode(
        &mut self,
        encoded: &str,
        precision: u32,
    ) -> std::result::Result<LineString<f64>, DecodeError> {
        let key = (encoded.to_string(), precision);
        if let Some(cached) = self.cache.get(&key) {
            self.hits += 1;
            return cached.clone();
        }
        self.misses += 1;
        let decoded = decode(encoded, precision);
        self.cache.put(key, decoded.clone());
        decoded
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for PolylineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DECODE_CACHE_SIZE)
    }
}
