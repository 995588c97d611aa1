//! Output instance
//!
//! [`DuckSink`] owns the lifecycle: start-up opens the database, creates the
//! table and starts the flush timer; [`DuckSink::finish`] (or drop) stops the
//! timer, flushes what is buffered and closes the database.
//!
//! Writers use a cloneable [`SinkHandle`]:
//!
//! ```no_run
//! use logduck::{Chunk, DuckSink, EventTime, SinkConfig};
//! use serde_json::json;
//!
//! let sink = DuckSink::start(SinkConfig::in_memory())?;
//! let handle = sink.handle();
//!
//! let chunk = Chunk::new("svc")
//!     .with(EventTime::parse_rfc3339("2025-01-01T00:00:00.123456789Z")?, json!({"user": {"id": 123}}));
//! handle.write(&chunk)?;
//!
//! let stats = sink.finish()?;
//! assert_eq!(stats.rows_written, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::SinkConfig;
use crate::db::{Backend, Database, Loader};
use crate::encoder::RecordEncoder;
use crate::error::{DbResult, Result, SinkError};
use crate::event::{Chunk, Event};
use crate::flush::{FlushTimer, Flusher, SchedulerState, StatsSnapshot};
use duckdb::Connection;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, trace, warn};

/// Handle for writing to a sink from any thread
#[derive(Clone)]
pub struct SinkHandle {
    encoder: RecordEncoder,
    flusher: Arc<Flusher>,
}

impl SinkHandle {
    /// Encode and buffer a chunk; returns rows buffered
    ///
    /// The whole chunk is encoded before anything is buffered, so an encoding
    /// error leaves the buffer untouched. A flush triggered from here that
    /// fails is logged and counted in [`StatsSnapshot::flush_failures`], not
    /// returned.
    pub fn write(&self, chunk: &Chunk) -> Result<usize> {
        if self.flusher.is_stopped() {
            return Err(SinkError::Stopped);
        }
        if chunk.is_empty() {
            return Ok(0);
        }

        let rows = self.encoder.encode_chunk(chunk)?;
        let count = rows.len();

        self.flusher
            .buffer()
            .append_all(rows)
            .ok_or(SinkError::Stopped)?;
        self.flusher
            .stats()
            .rows_received
            .fetch_add(count as u64, Ordering::Relaxed);
        trace!(tag = %chunk.tag, rows = count, "Chunk buffered");

        self.flusher.flush_if_due();
        Ok(count)
    }

    /// Write a single event
    pub fn emit(&self, event: Event) -> Result<usize> {
        self.write(&Chunk::from(event))
    }

    /// Load everything buffered now; returns rows written
    ///
    /// Rows already in the table are skipped, not reported as errors. Rows
    /// DuckDB refuses are discarded and the first refusal is returned.
    pub fn flush(&self) -> Result<usize> {
        if self.flusher.is_stopped() {
            return Err(SinkError::Stopped);
        }
        Ok(self.flusher.flush_now()?)
    }

    /// Run a query against the sink's connection
    ///
    /// Holds the load lock for the duration of the closure.
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> duckdb::Result<R>) -> Result<R> {
        self.flusher
            .with_backend(|backend| -> DbResult<R> {
                let conn = backend.connection()?;
                Ok(f(conn)?)
            })
            .map_err(SinkError::Database)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.flusher.stats().snapshot()
    }

    /// Rows waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.flusher.buffer().len()
    }

    pub fn state(&self) -> SchedulerState {
        self.flusher.state()
    }
}

/// A running sink
pub struct DuckSink {
    handle: SinkHandle,
    timer: FlushTimer,
    finished: bool,
}

impl DuckSink {
    /// Validate the configuration, open the database and start the timer
    ///
    /// Connection and schema failures are returned here; nothing is retried.
    /// A time format whose output DuckDB cannot cast to `TIMESTAMP` fails
    /// with [`ConfigError::InvalidTimeFormat`](crate::ConfigError::InvalidTimeFormat).
    pub fn start(config: SinkConfig) -> Result<Self> {
        config.validate()?;

        let loader = Loader::new(config.layout.clone(), config.strategy, config.on_duplicate);
        let backend = Backend::open(Database::new(config.location.clone()), loader)?;
        backend.verify_time_format(&config.time_format)?;
        let flusher = Arc::new(Flusher::new(backend, config.triggers));

        let timer = FlushTimer::spawn(Arc::clone(&flusher), config.check_interval)
            .map_err(|e| SinkError::Thread(format!("Failed to spawn flush timer: {}", e)))?;

        info!(
            location = %config.location,
            table = %config.layout.table,
            strategy = ?config.strategy,
            dedupe = config.layout.dedupe,
            flush_size = config.triggers.flush_size,
            flush_interval_ms = config.triggers.flush_interval.as_millis() as u64,
            "Sink started"
        );

        Ok(Self {
            handle: SinkHandle {
                encoder: RecordEncoder::new(config.time_format, config.layout.dedupe),
                flusher,
            },
            timer,
            finished: false,
        })
    }

    /// Get a handle for writing
    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Stop the timer, flush what is buffered and close the database
    ///
    /// Returns an error only if the final flush failed.
    pub fn finish(mut self) -> Result<StatsSnapshot> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<StatsSnapshot> {
        self.finished = true;
        let flusher = &self.handle.flusher;

        if !flusher.mark_stopped() {
            return Ok(flusher.stats().snapshot());
        }

        // Joining the timer waits for a flush it may be running
        if let Err(e) = self.timer.stop() {
            warn!(error = %e, "Continuing shutdown without the flush timer");
        }

        let result = flusher.shutdown();
        let stats = flusher.stats().snapshot();

        match result {
            Ok(_) => {
                info!(
                    rows_written = stats.rows_written,
                    batches = stats.batches_committed,
                    duplicates = stats.rows_duplicate,
                    failures = stats.flush_failures,
                    discarded = stats.rows_discarded,
                    "Sink stopped"
                );
                Ok(stats)
            }
            Err(e) => {
                error!(error = %e, "Final flush failed");
                Err(e.into())
            }
        }
    }
}

impl Drop for DuckSink {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.shutdown() {
                warn!(error = %e, "Sink dropped with a failed final flush");
            }
        }
    }
}
