//! Configuration types for logduck
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime sink configuration with validation
//! - The load strategy and duplicate policy switches

use crate::db::{DbLocation, TableLayout, HASH_COLUMN};
use crate::encoder::TimeFormat;
use crate::error::ConfigError;
use crate::flush::FlushTriggers;
use clap::Parser;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Smallest meaningful flush size
const MIN_FLUSH_SIZE: usize = 1;

/// Default rows per batch
pub const DEFAULT_FLUSH_SIZE: usize = 1000;

/// Default maximum age of a buffered row before it is flushed
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default timer tick
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default target table
pub const DEFAULT_TABLE: &str = "log_events";

/// Table and column names are interpolated into SQL, so only bare identifiers pass
static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid identifier regex"));

/// How drained batches reach DuckDB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LoadStrategy {
    /// One transaction per batch with prepared-statement inserts.
    /// Retrying a failed batch is idempotent when dedupe is on.
    #[default]
    Transactional,

    /// DuckDB appender, no transaction and no conflict detection.
    /// Retrying a failed batch may insert rows twice.
    Appender,
}

/// How a uniqueness violation is handled in dedupe mode
///
/// Either way duplicates end up counted and skipped; the policies differ in
/// how many statements it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DuplicatePolicy {
    /// Roll the batch back; the flusher then splits it to find the duplicates
    Abort,

    /// Let DuckDB skip the conflicting row (`ON CONFLICT DO NOTHING`)
    #[default]
    Skip,
}

/// Buffer tagged JSON log records and load them into DuckDB in batches
#[derive(Parser, Debug, Clone)]
#[command(
    name = "logduck",
    version,
    about = "Buffer tagged JSON log records and load them into DuckDB in batches",
    long_about = "Reads newline-delimited JSON records from a file or stdin, tags and timestamps\n\
                  them, and writes them to a DuckDB table in size- or time-triggered batches.",
    after_help = "EXAMPLES:\n    \
        tail -F app.log | logduck --tag app -d logs.duckdb\n    \
        logduck events.ndjson --tag svc --time-key ts --flush-size 5000\n    \
        logduck events.ndjson --strategy appender --no-dedupe"
)]
pub struct CliArgs {
    /// Input file with one JSON record per line (stdin when omitted)
    #[arg(value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// DuckDB database file, or ':memory:'
    #[arg(short = 'd', long, default_value = "logduck.duckdb", value_name = "PATH")]
    pub database: String,

    /// Target table
    #[arg(short = 't', long, default_value = DEFAULT_TABLE, value_name = "NAME")]
    pub table: String,

    /// Tag assigned to every record read
    #[arg(long, default_value = "logduck", value_name = "TAG")]
    pub tag: String,

    /// Record field holding an RFC 3339 event time (current time when absent)
    #[arg(long, value_name = "FIELD")]
    pub time_key: Option<String>,

    /// Column storing the tag
    #[arg(long, default_value = "tag", value_name = "NAME")]
    pub tag_col: String,

    /// Column storing the event time
    #[arg(long, default_value = "time", value_name = "NAME")]
    pub time_col: String,

    /// Column storing the JSON record
    #[arg(long, default_value = "record", value_name = "NAME")]
    pub record_col: String,

    /// Disable content-hash deduplication
    #[arg(long)]
    pub no_dedupe: bool,

    /// Behaviour on a duplicate row when dedupe is on
    #[arg(long, value_enum, default_value_t = DuplicatePolicy::Skip)]
    pub on_duplicate: DuplicatePolicy,

    /// Load strategy
    #[arg(long, value_enum, default_value_t = LoadStrategy::Transactional)]
    pub strategy: LoadStrategy,

    /// Rows buffered before a flush
    #[arg(short = 'b', long, default_value_t = DEFAULT_FLUSH_SIZE, value_name = "ROWS")]
    pub flush_size: usize,

    /// Maximum milliseconds between flushes (0 flushes on every check)
    #[arg(long, default_value = "5000", value_name = "MS")]
    pub flush_interval_ms: u64,

    /// Milliseconds between timer checks
    #[arg(long, default_value = "1000", value_name = "MS")]
    pub check_interval_ms: u64,

    /// strftime format for the time column (default: UTC with nanoseconds)
    #[arg(long, value_name = "FORMAT")]
    pub time_format: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Validated runtime configuration for one sink
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Database file or in-memory
    pub location: DbLocation,

    /// Table name, column names and dedupe flag
    pub layout: TableLayout,

    /// Transactional inserts or appender
    pub strategy: LoadStrategy,

    /// Duplicate handling in dedupe mode
    pub on_duplicate: DuplicatePolicy,

    /// Size and time thresholds
    pub triggers: FlushTriggers,

    /// Timer tick
    pub check_interval: Duration,

    /// Timestamp rendering
    pub time_format: TimeFormat,
}

impl SinkConfig {
    /// Configuration with defaults for everything but the location
    pub fn new(location: DbLocation) -> Self {
        Self {
            location,
            layout: TableLayout::default(),
            strategy: LoadStrategy::default(),
            on_duplicate: DuplicatePolicy::default(),
            triggers: FlushTriggers::new(DEFAULT_FLUSH_SIZE, DEFAULT_FLUSH_INTERVAL),
            check_interval: DEFAULT_CHECK_INTERVAL,
            time_format: TimeFormat::default(),
        }
    }

    /// In-memory database with defaults
    pub fn in_memory() -> Self {
        Self::new(DbLocation::InMemory)
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.layout.table = table.into();
        self
    }

    pub fn columns(
        mut self,
        tag_col: impl Into<String>,
        time_col: impl Into<String>,
        record_col: impl Into<String>,
    ) -> Self {
        self.layout.tag_col = tag_col.into();
        self.layout.time_col = time_col.into();
        self.layout.record_col = record_col.into();
        self
    }

    pub fn dedupe(mut self, dedupe: bool) -> Self {
        self.layout.dedupe = dedupe;
        self
    }

    pub fn strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn on_duplicate(mut self, policy: DuplicatePolicy) -> Self {
        self.on_duplicate = policy;
        self
    }

    pub fn flush_size(mut self, rows: usize) -> Self {
        self.triggers.flush_size = rows;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.triggers.flush_interval = interval;
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn time_format(mut self, format: TimeFormat) -> Self {
        self.time_format = format;
        self
    }

    /// Check every invariant the sink relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("table", &self.layout.table)?;
        validate_identifier("tag column", &self.layout.tag_col)?;
        validate_identifier("time column", &self.layout.time_col)?;
        validate_identifier("record column", &self.layout.record_col)?;

        let mut columns = vec![
            &self.layout.tag_col,
            &self.layout.time_col,
            &self.layout.record_col,
        ];
        let hash_col = HASH_COLUMN.to_string();
        if self.layout.dedupe {
            columns.push(&hash_col);
        }
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].iter().any(|prev| prev.eq_ignore_ascii_case(name)) {
                return Err(ConfigError::DuplicateColumn(name.to_string()));
            }
        }

        if self.triggers.flush_size < MIN_FLUSH_SIZE {
            return Err(ConfigError::InvalidFlushSize {
                size: self.triggers.flush_size,
                min: MIN_FLUSH_SIZE,
            });
        }

        if self.check_interval.is_zero() {
            return Err(ConfigError::InvalidCheckInterval);
        }

        if let TimeFormat::Strftime(format) = &self.time_format {
            if TimeFormat::strftime(format).is_none() {
                return Err(ConfigError::InvalidTimeFormat(format.clone()));
            }
        }

        if self.layout.dedupe && self.strategy == LoadStrategy::Appender {
            return Err(ConfigError::DedupeRequiresTransactional);
        }

        if let DbLocation::File(path) = &self.location {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(ConfigError::InvalidDatabasePath {
                        path: path.clone(),
                        reason: format!("Parent directory '{}' does not exist", parent.display()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let time_format = match &args.time_format {
            Some(format) => TimeFormat::strftime(format)
                .ok_or_else(|| ConfigError::InvalidTimeFormat(format.clone()))?,
            None => TimeFormat::Utc,
        };

        let config = Self::new(DbLocation::parse(&args.database))
            .table(&args.table)
            .columns(&args.tag_col, &args.time_col, &args.record_col)
            .dedupe(!args.no_dedupe)
            .strategy(args.strategy)
            .on_duplicate(args.on_duplicate)
            .flush_size(args.flush_size)
            .flush_interval(Duration::from_millis(args.flush_interval_ms))
            .check_interval(Duration::from_millis(args.check_interval_ms))
            .time_format(time_format);

        config.validate()?;
        Ok(config)
    }
}

fn validate_identifier(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    if IDENTIFIER_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            kind,
            name: name.to_string(),
        })
    }
}
