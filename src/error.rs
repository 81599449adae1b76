//! Unified error handling for the link-monitor library.
//!
//! Only hard failures travel through [`LinkMonitorError`]. Per-row data
//! problems (missing fields, unknown links, undecodable polylines) are
//! reported as [`crate::ValidCode`] values on the validation outcome and
//! never abort a batch.

use thiserror::Error;

/// Unified error type for link-monitor operations.
#[derive(Debug, Error)]
pub enum LinkMonitorError {
    /// Coordinate transform failed or the CRS is not supported
    #[error("Projection error ({from} -> {to}): {message}")]
    Projection {
        from: String,
        to: String,
        message: String,
    },

    /// Geometry could not be repaired into something measurable
    #[error("Geometry error for link '{link_id}': {message}")]
    Geometry { link_id: String, message: String },

    /// A parallel validation chunk failed; the whole batch is aborted
    #[error("Validation worker for chunk {chunk_index} failed: {source}")]
    WorkerFailed {
        chunk_index: usize,
        #[source]
        source: Box<LinkMonitorError>,
    },

    /// Invalid or missing configuration parameter
    #[error("Configuration error: '{parameter}' {message}")]
    Config { parameter: String, message: String },

    /// Required input column could not be resolved
    #[error("Input schema error: {message}")]
    Schema { message: String },

    /// Timestamp could not be interpreted
    #[error("Timestamp error: {message}")]
    Timestamp { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "parquet")]
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[cfg(feature = "parquet")]
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LinkMonitorError {
    /// Shorthand for a configuration error on a named parameter.
    pub fn config(parameter: &str, message: impl Into<String>) -> Self {
        LinkMonitorError::Config {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a projection error between two CRS identifiers.
    pub fn projection(from: &str, to: &str, message: impl Into<String>) -> Self {
        LinkMonitorError::Projection {
            from: from.to_string(),
            to: to.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for link-monitor operations.
pub type Result<T> = std::result::Result<T, LinkMonitorError>;

/// Extension trait for converting Option to LinkMonitorError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a schema error.
    fn ok_or_schema(self, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_schema(self, message: &str) -> Result<T> {
        self.ok_or_else(|| LinkMonitorError::Schema {
            message: message.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| LinkMonitorError::Internal {
            message: message.to_string(),
        })
    }
}
