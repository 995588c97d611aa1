//! DuckDB storage for log events
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Flusher                           │
//! │  - Drains encoded rows from the buffer             │
//! └─────────────────────┬───────────────────────────────┘
//!                       │ &[EncodedRow]
//!                       ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                   Backend                           │
//! │  - Database: the single connection                 │
//! │  - Loader: transactional insert or appender        │
//! └─────────────────────┬───────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────┐
//! │         DuckDB file or in-memory database           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod loader;
pub mod schema;

pub use connection::{Database, DbLocation};
pub use loader::Loader;
pub use schema::{count_rows, create_table_sql, ensure_schema, insert_sql, TableLayout, HASH_COLUMN};

use crate::encoder::{encode_timestamp, EncodedRow, TimeFormat};
use crate::error::{ConfigError, DbError, DbResult, Result};
use crate::event::EventTime;
use duckdb::{params, Connection};
use tracing::{debug, warn};

/// 2025-03-14 15:09:26.535897932 UTC; day and month are not interchangeable
const SAMPLE_SECS: i64 = 1_741_964_966;
const SAMPLE_NANOS: u32 = 535_897_932;

/// Connection plus the loader bound to it
///
/// Only the flusher touches this, always under its lock.
#[derive(Debug)]
pub struct Backend {
    database: Database,
    loader: Loader,
}

impl Backend {
    /// Connect, create the table if missing and validate the loader against it
    pub fn open(mut database: Database, loader: Loader) -> DbResult<Self> {
        database.connect()?;
        let conn = database.connection()?;
        ensure_schema(conn, loader.layout())?;
        loader.prepare(conn)?;
        Ok(Self { database, loader })
    }

    /// Write one batch
    pub fn load(&self, batch: &[EncodedRow]) -> DbResult<usize> {
        let conn = self.database.connection()?;
        self.loader.load(conn, batch)
    }

    /// Check that DuckDB can cast timestamps rendered with `format`
    ///
    /// chrono accepts patterns such as `%s` or `%d/%m/%Y` whose output the
    /// `TIMESTAMP` column would refuse on every row.
    pub fn verify_time_format(&self, format: &TimeFormat) -> Result<()> {
        let sample = encode_timestamp(EventTime::new(SAMPLE_SECS, SAMPLE_NANOS)?, format)?;
        let conn = self.connection()?;

        match conn.query_row("SELECT CAST(? AS TIMESTAMP)", params![sample], |_| Ok(())) {
            Ok(()) => {
                debug!(format = format.pattern(), sample = %sample, "Time format accepted");
                Ok(())
            }
            Err(e) => match DbError::from(e) {
                DbError::Rejected(e) => {
                    warn!(format = format.pattern(), sample = %sample, error = %e, "DuckDB cannot cast rendered timestamps");
                    Err(ConfigError::InvalidTimeFormat(format.pattern().to_string()).into())
                }
                other => Err(other.into()),
            },
        }
    }

    pub fn connection(&self) -> DbResult<&Connection> {
        self.database.connection()
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn close(&mut self) {
        self.database.close();
    }
}
