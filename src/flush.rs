//! Flush scheduling
//!
//! A [`Flusher`] decides when buffered rows go to DuckDB and applies the
//! failure policy when a load fails. Two callers drive it:
//!
//! - the ingestion path, after every append, through [`Flusher::flush_if_due`]
//! - the [`FlushTimer`] thread, once per check interval
//!
//! Loads are serialised by the backend lock, which also owns the connection.
//! The ingestion path only ever `try_lock`s it, so a writer never waits for a
//! running load. A writer that finds the lock taken leaves a re-check flag;
//! whoever holds the lock looks at the triggers again after releasing it, so
//! a size trigger is never left waiting for the next timer tick. Explicit
//! flushes and shutdown wait.
//!
//! # Failure policy
//!
//! Each load is all-or-nothing. When one fails because of the data in some
//! row (`DuplicateKey` or `Rejected`), the batch is split in halves and each
//! half loaded on its own, down to single rows, so one bad row never takes
//! acknowledged neighbours with it:
//!
//! | Error                         | Rows                                   |
//! |-------------------------------|----------------------------------------|
//! | `DuplicateKey` on one row     | already stored; counted as duplicate   |
//! | `Rejected` on one row         | discarded, logged with tag and time    |
//! | `TransientBackend`            | unloaded rows requeued at buffer head  |
//! | anything else                 | unloaded rows discarded, logged        |
//!
//! Rows are resolved in order, so the rows left after a batch-level failure
//! are always a suffix of the batch.

use crate::buffer::RowBuffer;
use crate::db::Backend;
use crate::encoder::EncodedRow;
use crate::error::{DbError, DbResult, SinkError};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Size and time thresholds; whichever fires first wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTriggers {
    /// Rows buffered before a flush (at least 1)
    pub flush_size: usize,

    /// Maximum time between flushes; zero flushes on every check
    pub flush_interval: Duration,
}

impl FlushTriggers {
    pub fn new(flush_size: usize, flush_interval: Duration) -> Self {
        Self {
            flush_size,
            flush_interval,
        }
    }

    pub fn is_due(&self, len: usize, elapsed: Duration) -> bool {
        len >= self.flush_size || elapsed >= self.flush_interval
    }
}

/// What the flusher is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Flushing = 1,
    /// Terminal
    Stopped = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Flushing,
            _ => SchedulerState::Stopped,
        }
    }
}

/// Counters updated by writers and the flusher
#[derive(Debug, Default)]
pub struct FlushStats {
    /// Rows accepted into the buffer
    pub rows_received: AtomicU64,

    /// Rows DuckDB reported as inserted
    pub rows_written: AtomicU64,

    /// Rows already present in the table, skipped by the unique key
    pub rows_duplicate: AtomicU64,

    /// Batches loaded successfully
    pub batches_committed: AtomicU64,

    /// Loads that returned an error
    pub flush_failures: AtomicU64,

    /// Rows put back after a retriable failure
    pub rows_requeued: AtomicU64,

    /// Rows dropped: refused by DuckDB, or left after a non-retriable failure
    pub rows_discarded: AtomicU64,
}

impl FlushStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rows_received: self.rows_received.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_duplicate: self.rows_duplicate.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            rows_requeued: self.rows_requeued.load(Ordering::Relaxed),
            rows_discarded: self.rows_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FlushStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rows_received: u64,
    pub rows_written: u64,
    pub rows_duplicate: u64,
    pub batches_committed: u64,
    pub flush_failures: u64,
    pub rows_requeued: u64,
    pub rows_discarded: u64,
}

/// Owns the buffer and the backend, shared by writers and the timer
pub struct Flusher {
    buffer: RowBuffer,
    backend: Mutex<Backend>,
    triggers: FlushTriggers,
    state: AtomicU8,
    /// Set by a writer that found the backend busy
    recheck: AtomicBool,
    stats: FlushStats,
}

/// How the rows of one drained batch were resolved
#[derive(Debug, Default)]
struct LoadReport {
    inserted: usize,
    duplicates: usize,
    /// Batch index and error of each row DuckDB refused
    rejected: Vec<(usize, DbError)>,
    /// First unresolved row and the batch-level error that stopped the load
    failed: Option<(usize, DbError)>,
}

impl Flusher {
    pub fn new(backend: Backend, triggers: FlushTriggers) -> Self {
        Self {
            buffer: RowBuffer::with_capacity(triggers.flush_size),
            backend: Mutex::new(backend),
            triggers,
            state: AtomicU8::new(SchedulerState::Idle as u8),
            recheck: AtomicBool::new(false),
            stats: FlushStats::default(),
        }
    }

    pub fn buffer(&self) -> &RowBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SchedulerState::Stopped
    }

    /// Flush while a trigger has fired, unless another load is running
    ///
    /// Returns rows written. Failures are logged and counted, never returned;
    /// the rows they affect are requeued or discarded per the failure policy.
    /// When the backend is busy the holder re-checks after releasing it.
    pub fn flush_if_due(&self) -> usize {
        let mut written = 0;

        loop {
            if self.is_stopped() {
                return written;
            }

            let backend = match self.backend.try_lock() {
                Some(backend) => backend,
                None => {
                    self.recheck.store(true, Ordering::SeqCst);
                    // The holder may have released before seeing the flag
                    match self.backend.try_lock() {
                        Some(backend) => backend,
                        None => {
                            trace!("Load already running, holder will re-check");
                            return written;
                        }
                    }
                }
            };

            written += self.drain_due_locked(&backend);
            drop(backend);

            if !self.recheck.swap(false, Ordering::SeqCst) {
                return written;
            }
        }
    }

    /// Drain and load everything buffered, waiting for any running load
    pub fn flush_now(&self) -> DbResult<usize> {
        let result = {
            let backend = self.backend.lock();
            let batch = self.buffer.drain();
            if batch.is_empty() {
                Ok(0)
            } else {
                self.load_locked(&backend, batch)
            }
        };
        self.recheck_pending();
        result
    }

    /// Run a closure against the backend under the load lock
    pub fn with_backend<R>(&self, f: impl FnOnce(&Backend) -> R) -> R {
        let result = {
            let backend = self.backend.lock();
            f(&backend)
        };
        self.recheck_pending();
        result
    }

    /// Enter the terminal state; returns false if already stopped
    ///
    /// Nothing is flushed here. Writers see `Stopped` from now on while the
    /// timer is stopped and [`Flusher::shutdown`] runs the final load.
    pub fn mark_stopped(&self) -> bool {
        let previous = self.state.swap(SchedulerState::Stopped as u8, Ordering::AcqRel);
        previous != SchedulerState::Stopped as u8
    }

    /// Seal the buffer, load what is left and close the connection
    ///
    /// Waits for an in-flight load first. The connection is closed even when
    /// the final load fails.
    pub fn shutdown(&self) -> DbResult<usize> {
        let mut backend = self.backend.lock();

        let batch = self.buffer.seal();
        let result = if batch.is_empty() {
            Ok(0)
        } else {
            debug!(rows = batch.len(), "Final flush");
            self.load_locked(&backend, batch)
        };

        backend.close();
        result
    }

    /// Run the checks writers asked for while the lock was held
    fn recheck_pending(&self) {
        if self.recheck.swap(false, Ordering::SeqCst) {
            self.flush_if_due();
        }
    }

    /// Load batches until no trigger fires; caller holds the backend lock
    fn drain_due_locked(&self, backend: &Backend) -> usize {
        let mut written = 0;
        while let Some(batch) = self.buffer.drain_if_due(&self.triggers) {
            match self.load_locked(backend, batch) {
                Ok(n) => written += n,
                Err(_) => break,
            }
        }
        written
    }

    /// Load one drained batch; caller holds the backend lock
    ///
    /// Returns rows inserted, or the first error if any row was lost or
    /// requeued.
    fn load_locked(&self, backend: &Backend, mut batch: Vec<EncodedRow>) -> DbResult<usize> {
        let rows = batch.len();
        self.transition(SchedulerState::Idle, SchedulerState::Flushing);

        let mut report = LoadReport::default();
        self.load_isolating(backend, &batch, 0, &mut report);

        self.stats.rows_written.fetch_add(report.inserted as u64, Ordering::Relaxed);
        self.stats.rows_duplicate.fetch_add(report.duplicates as u64, Ordering::Relaxed);

        let mut rejection = None;
        if !report.rejected.is_empty() {
            for (index, e) in &report.rejected {
                let row = &batch[*index];
                warn!(tag = %row.tag, time = %row.time, error = %e, "Row rejected by database");
            }
            let refused = report.rejected.len();
            self.stats.rows_discarded.fetch_add(refused as u64, Ordering::Relaxed);
            error!(rows = refused, "Rejected rows discarded");
            rejection = report.rejected.into_iter().next().map(|(_, e)| e);
        }

        let result = match report.failed {
            Some((from, e)) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                let rest = batch.split_off(from);
                if e.is_retriable() && !self.buffer.is_sealed() {
                    self.stats.rows_requeued.fetch_add(rest.len() as u64, Ordering::Relaxed);
                    warn!(rows = rest.len(), loaded = from, error = %e, "Flush failed, rows requeued");
                    self.buffer.requeue(rest);
                } else {
                    self.stats.rows_discarded.fetch_add(rest.len() as u64, Ordering::Relaxed);
                    error!(rows = rest.len(), loaded = from, error = %e, "Flush failed, rows discarded");
                }
                Err(e)
            }
            None => {
                self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    rows,
                    written = report.inserted,
                    duplicates = report.duplicates,
                    "Batch loaded"
                );
                match rejection {
                    Some(e) => {
                        self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                    None => Ok(report.inserted),
                }
            }
        };

        self.transition(SchedulerState::Flushing, SchedulerState::Idle);
        result
    }

    /// Load `rows`, splitting on row-level failures until the bad rows are
    /// isolated
    ///
    /// `offset` is the index of `rows[0]` in the drained batch. Returns false
    /// once a batch-level failure has stopped the load.
    fn load_isolating(
        &self,
        backend: &Backend,
        rows: &[EncodedRow],
        offset: usize,
        report: &mut LoadReport,
    ) -> bool {
        let e = match backend.load(rows) {
            Ok(inserted) => {
                report.inserted += inserted;
                report.duplicates += rows.len().saturating_sub(inserted);
                return true;
            }
            Err(e) => e,
        };

        if !e.is_row_level() {
            report.failed = Some((offset, e));
            return false;
        }

        if rows.len() == 1 {
            if e.is_duplicate() {
                report.duplicates += 1;
            } else {
                report.rejected.push((offset, e));
            }
            return true;
        }

        debug!(rows = rows.len(), error = %e, "Batch refused, splitting");
        let (left, right) = rows.split_at(rows.len() / 2);
        self.load_isolating(backend, left, offset, report)
            && self.load_isolating(backend, right, offset + left.len(), report)
    }

    /// Compare-and-set so that `Stopped` is never overwritten
    fn transition(&self, from: SchedulerState, to: SchedulerState) {
        let _ = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Background thread that checks the triggers once per interval
pub struct FlushTimer {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushTimer {
    /// Spawn the timer thread
    pub fn spawn(flusher: Arc<Flusher>, check_interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("logduck-flush".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(check_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            flusher.flush_if_due();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                trace!("Flush timer exited");
            })?;

        info!(interval_ms = check_interval.as_millis() as u64, "Flush timer started");

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it, including any flush it is running
    ///
    /// Idempotent.
    pub fn stop(&mut self) -> Result<(), SinkError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }

        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SinkError::Thread("Flush timer panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Flush timer did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DuplicatePolicy, LoadStrategy};
    use crate::db::{count_rows, Database, DbLocation, Loader, TableLayout};
    use crate::encoder::{RecordEncoder, TimeFormat};
    use crate::event::EventTime;
    use serde_json::json;
    use std::time::Instant;

    const HOUR: Duration = Duration::from_secs(3600);

    fn flusher(triggers: FlushTriggers) -> Flusher {
        flusher_with(triggers, DuplicatePolicy::Abort)
    }

    fn flusher_with(triggers: FlushTriggers, policy: DuplicatePolicy) -> Flusher {
        let layout = TableLayout::default();
        let loader = Loader::new(layout, LoadStrategy::Transactional, policy);
        let backend = Backend::open(Database::new(DbLocation::InMemory), loader).unwrap();
        Flusher::new(backend, triggers)
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<EncodedRow> {
        let encoder = RecordEncoder::new(TimeFormat::Utc, true);
        range
            .map(|i| {
                encoder
                    .encode(EventTime::new(i, 0).unwrap(), "svc", &json!({"i": i}))
                    .unwrap()
            })
            .collect()
    }

    fn stored(flusher: &Flusher) -> i64 {
        flusher.with_backend(|b| {
            count_rows(b.connection().unwrap(), &b.loader().layout().table).unwrap()
        })
    }

    #[test]
    fn test_triggers() {
        let triggers = FlushTriggers::new(10, Duration::from_secs(5));
        assert!(!triggers.is_due(9, Duration::from_secs(4)));
        assert!(triggers.is_due(10, Duration::ZERO));
        assert!(triggers.is_due(1, Duration::from_secs(5)));

        let every_check = FlushTriggers::new(10, Duration::ZERO);
        assert!(every_check.is_due(1, Duration::ZERO));
    }

    #[test]
    fn test_flush_if_due_respects_size() {
        let flusher = flusher(FlushTriggers::new(5, HOUR));

        flusher.buffer().append_all(rows(0..4));
        assert_eq!(flusher.flush_if_due(), 0);
        assert_eq!(stored(&flusher), 0);

        flusher.buffer().append_all(rows(4..5));
        assert_eq!(flusher.flush_if_due(), 5);
        assert_eq!(stored(&flusher), 5);
        assert_eq!(flusher.stats().snapshot().batches_committed, 1);
        assert_eq!(flusher.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_flush_now_ignores_triggers() {
        let flusher = flusher(FlushTriggers::new(1000, HOUR));
        flusher.buffer().append_all(rows(0..3));

        assert_eq!(flusher.flush_now().unwrap(), 3);
        assert_eq!(flusher.flush_now().unwrap(), 0);
        assert_eq!(stored(&flusher), 3);
    }

    #[test]
    fn test_size_trigger_hit_while_busy_flushes_on_release() {
        let flusher = flusher(FlushTriggers::new(3, HOUR));

        flusher.with_backend(|_| {
            flusher.buffer().append_all(rows(0..4));
            assert_eq!(flusher.flush_if_due(), 0);
            assert_eq!(flusher.buffer().len(), 4);
        });

        // No timer: releasing the lock ran the pending check
        assert!(flusher.buffer().is_empty());
        assert_eq!(stored(&flusher), 4);
        assert_eq!(flusher.stats().snapshot().rows_written, 4);
    }

    #[test]
    fn test_replayed_rows_do_not_take_new_rows_down() {
        for policy in [DuplicatePolicy::Abort, DuplicatePolicy::Skip] {
            let flusher = flusher_with(FlushTriggers::new(1000, HOUR), policy);
            flusher.buffer().append_all(rows(0..3));
            assert_eq!(flusher.flush_now().unwrap(), 3);

            // Replay of 0..3 mixed with two new rows
            let mut batch = rows(0..3);
            batch.insert(1, rows(10..11).remove(0));
            batch.extend(rows(11..12));
            flusher.buffer().append_all(batch);
            assert_eq!(flusher.flush_now().unwrap(), 2, "{:?}", policy);

            let stats = flusher.stats().snapshot();
            assert_eq!(stats.rows_written, 5);
            assert_eq!(stats.rows_duplicate, 3);
            assert_eq!(stats.rows_discarded, 0);
            assert_eq!(stats.flush_failures, 0);
            assert!(flusher.buffer().is_empty());
            assert_eq!(stored(&flusher), 5);
        }
    }

    #[test]
    fn test_rejected_row_is_isolated() {
        let flusher = flusher(FlushTriggers::new(1000, HOUR));
        let mut batch = rows(0..5);
        batch[2].time = "not a timestamp".into();
        flusher.buffer().append_all(batch);

        let err = flusher.flush_now().unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)));

        let stats = flusher.stats().snapshot();
        assert_eq!(stats.rows_written, 4);
        assert_eq!(stats.rows_discarded, 1);
        assert_eq!(stats.flush_failures, 1);
        assert!(flusher.buffer().is_empty());
        assert_eq!(stored(&flusher), 4);
    }

    #[test]
    fn test_failed_load_is_requeued_or_discarded() {
        let flusher = flusher(FlushTriggers::new(1000, HOUR));
        flusher.buffer().append_all(rows(0..3));

        // Dropping the table makes every load fail; the classifier decides the path
        flusher.with_backend(|b| {
            b.connection()
                .unwrap()
                .execute_batch("DROP TABLE log_events")
                .unwrap();
        });
        let err = flusher.flush_now().unwrap_err();
        let stats = flusher.stats().snapshot();
        assert_eq!(stats.flush_failures, 1);
        assert_eq!(stats.rows_written, 0);

        if err.is_retriable() {
            assert_eq!(flusher.buffer().len(), 3);
            assert_eq!(stats.rows_requeued, 3);
        } else {
            assert!(flusher.buffer().is_empty());
            assert_eq!(stats.rows_discarded, 3);
        }
    }

    #[test]
    fn test_shutdown_drains_and_closes() {
        let flusher = flusher(FlushTriggers::new(1000, HOUR));
        flusher.buffer().append_all(rows(0..7));

        assert!(flusher.mark_stopped());
        assert!(!flusher.mark_stopped());
        assert_eq!(flusher.flush_if_due(), 0);

        assert_eq!(flusher.shutdown().unwrap(), 7);
        assert_eq!(flusher.state(), SchedulerState::Stopped);
        assert!(flusher.buffer().is_sealed());
        assert!(matches!(
            flusher.with_backend(|b| b.connection().map(|_| ())),
            Err(DbError::Closed)
        ));
    }

    #[test]
    fn test_timer_flushes_on_interval() {
        let flusher = Arc::new(flusher(FlushTriggers::new(1000, Duration::from_millis(20))));
        let mut timer = FlushTimer::spawn(Arc::clone(&flusher), Duration::from_millis(10)).unwrap();

        flusher.buffer().append_all(rows(0..2));

        let deadline = Instant::now() + Duration::from_secs(5);
        while flusher.stats().snapshot().rows_written < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        timer.stop().unwrap();
        timer.stop().unwrap();

        assert_eq!(stored(&flusher), 2);
    }
}
