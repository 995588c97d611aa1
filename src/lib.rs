//! logduck - Buffered, batched loading of JSON log records into DuckDB
//!
//! Tagged, timestamped log records are encoded, buffered in memory and
//! written to an embedded DuckDB table in batches, so the table can be
//! queried with SQL and DuckDB's JSON operators.
//!
//! # Features
//!
//! - **Dual flush triggers**: a batch is written when the buffer reaches the
//!   flush size or when the flush interval has passed, whichever comes first.
//!
//! - **Non-blocking writes**: appending never waits for a running load.
//!
//! - **Atomic batches**: the transactional strategy commits a batch as a
//!   whole or not at all.
//!
//! - **Content-hash dedupe**: a `UNIQUE (tag, time, record_hash)` constraint
//!   makes replayed batches harmless.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Writer threads (SinkHandle)                     │
//! │            write(&Chunk) → RecordEncoder → EncodedRow           │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ append
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         RowBuffer                                │
//! │               (parking_lot mutex, swap on drain)                 │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ drain when size or age is due
//!                ┌──────────────┴──────────────┐
//!                │                             │
//!        ingestion path                 logduck-flush timer
//!                │                             │
//!                └──────────────┬──────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Flusher → Backend → Loader                       │
//! │     BEGIN / prepared INSERT ... / COMMIT   or   Appender         │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────┐
//!                    │   DuckDB table   │
//!                    │  (logs.duckdb)   │
//!                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Load a file of JSON lines
//! logduck events.ndjson --tag svc -d logs.duckdb
//!
//! # Query results
//! duckdb logs.duckdb "SELECT tag, time, record->'user'->>'id' FROM log_events"
//! ```

pub mod buffer;
pub mod config;
pub mod db;
pub mod encoder;
pub mod error;
pub mod event;
pub mod flush;
pub mod sink;

pub use config::{DuplicatePolicy, LoadStrategy, SinkConfig};
pub use db::DbLocation;
pub use encoder::{EncodedRow, RecordEncoder, TimeFormat};
pub use error::{ConfigError, DbError, EncodingError, Result, SinkError};
pub use event::{record_from, Chunk, Event, EventTime, Record};
pub use flush::{FlushTriggers, SchedulerState, StatsSnapshot};
pub use sink::{DuckSink, SinkHandle};
