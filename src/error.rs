//! Error types for logduck
//!
//! This module defines the error hierarchy that covers:
//! - Record and timestamp encoding errors
//! - DuckDB connection, schema and load errors
//! - Configuration errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Classify backend errors once, at the boundary, so callers can decide
//!   whether a failed batch is worth retrying
//! - Preserve error chains for debugging

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// Record or timestamp could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The sink has been shut down and accepts no more writes
    #[error("Sink is stopped")]
    Stopped,

    /// Background thread failure
    #[error("Flush thread error: {0}")]
    Thread(String),
}

impl SinkError {
    /// Check if retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            SinkError::Database(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Record and timestamp encoding errors
#[derive(Error, Debug)]
pub enum EncodingError {
    /// Timestamp outside the range chrono can represent
    #[error("Timestamp out of range: {secs}s + {nanos}ns")]
    TimestampOutOfRange { secs: i64, nanos: u32 },

    /// Nanosecond remainder must be below one second
    #[error("Invalid nanosecond remainder {0}: must be below 1_000_000_000")]
    InvalidNanos(u32),

    /// Timestamp text could not be parsed
    #[error("Invalid timestamp '{input}': {reason}")]
    InvalidTimestamp { input: String, reason: String },

    /// Record is not representable as JSON
    #[error("Record is not JSON-representable: {0}")]
    Json(#[from] serde_json::Error),

    /// NaN or infinity somewhere in the record
    #[error("Record contains non-finite float {0}")]
    NonFiniteFloat(f64),

    /// Timestamp formatting failed
    #[error("Failed to format timestamp with '{format}'")]
    Format { format: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to open the database or connection
    #[error("Failed to open database '{location}': {source}")]
    Connection {
        location: String,
        #[source]
        source: duckdb::Error,
    },

    /// Operation attempted before connect()
    #[error("Database is not connected")]
    NotConnected,

    /// Operation attempted after close()
    #[error("Database connection has been closed")]
    Closed,

    /// DDL failed (e.g. incompatible pre-existing table)
    #[error("Schema error on table '{table}': {source}")]
    Schema {
        table: String,
        #[source]
        source: duckdb::Error,
    },

    /// Existing table does not match the configured column layout
    #[error("Table '{table}' has columns {found:?}, expected {expected:?}")]
    IncompatibleTable {
        table: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// Uniqueness constraint rejected a row (replayed data)
    #[error("Duplicate key: {0}")]
    DuplicateKey(#[source] duckdb::Error),

    /// Engine refused the data for structural reasons; retrying will not help
    #[error("Rejected by database: {0}")]
    Rejected(#[source] duckdb::Error),

    /// Anything else: I/O, lock contention, dropped connection
    #[error("DuckDB error: {0}")]
    TransientBackend(#[source] duckdb::Error),
}

impl DbError {
    /// Check if the failed batch may succeed on retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, DbError::TransientBackend(_))
    }

    /// Check if this is a uniqueness violation
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DbError::DuplicateKey(_))
    }

    /// Check if the failure is caused by the data of some row
    ///
    /// A batch failing this way can be split to find the offending rows.
    pub fn is_row_level(&self) -> bool {
        matches!(self, DbError::DuplicateKey(_) | DbError::Rejected(_))
    }
}

impl From<duckdb::Error> for DbError {
    fn from(err: duckdb::Error) -> Self {
        let message = err.to_string().to_lowercase();

        if message.contains("duplicate key")
            || message.contains("unique constraint")
            || message.contains("constraint violated")
        {
            return DbError::DuplicateKey(err);
        }

        if message.contains("conversion error")
            || message.contains("type mismatch")
            || message.contains("invalid json")
            || message.contains("malformed json")
            || message.contains("binder error")
            || message.contains("catalog error")
            || message.contains("parser error")
        {
            return DbError::Rejected(err);
        }

        DbError::TransientBackend(err)
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Table or column name that cannot be used as a bare SQL identifier
    #[error("Invalid {kind} name '{name}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier { kind: &'static str, name: String },

    /// Two columns configured with the same name
    #[error("Column name '{0}' is used more than once")]
    DuplicateColumn(String),

    /// Invalid flush size
    #[error("Invalid flush size {size}: must be at least {min}")]
    InvalidFlushSize { size: usize, min: usize },

    /// Invalid check interval
    #[error("Invalid check interval: must be greater than zero")]
    InvalidCheckInterval,

    /// strftime string chrono cannot render
    #[error("Invalid time format '{0}'")]
    InvalidTimeFormat(String),

    /// Dedupe needs row-level conflict detection
    #[error("Dedupe requires the transactional load strategy")]
    DedupeRequiresTransactional,

    /// Output path error
    #[error("Invalid database path '{path}': {reason}")]
    InvalidDatabasePath { path: PathBuf, reason: String },
}

/// Result type alias for SinkError
pub type Result<T> = std::result::Result<T, SinkError>;

/// Result type alias for DbError
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Result type alias for EncodingError
pub type EncodingResult<T> = std::result::Result<T, EncodingError>;
