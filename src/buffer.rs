//! In-memory row buffer shared by writers and the flusher
//!
//! Every operation takes the one lock, so a row is either in the buffer or in
//! exactly one drained batch. Rows come out in the order they went in.

use crate::encoder::EncodedRow;
use crate::flush::FlushTriggers;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct State {
    rows: Vec<EncodedRow>,
    last_flush: Instant,
    sealed: bool,
}

/// Ordered, thread-safe buffer of encoded rows
pub struct RowBuffer {
    state: Mutex<State>,
}

impl RowBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                rows: Vec::with_capacity(capacity),
                last_flush: Instant::now(),
                sealed: false,
            }),
        }
    }

    /// Append one row; returns the new length, or `None` once sealed
    pub fn append(&self, row: EncodedRow) -> Option<usize> {
        let mut state = self.state.lock();
        if state.sealed {
            return None;
        }
        state.rows.push(row);
        Some(state.rows.len())
    }

    /// Append rows as one contiguous run
    pub fn append_all(&self, rows: Vec<EncodedRow>) -> Option<usize> {
        let mut state = self.state.lock();
        if state.sealed {
            return None;
        }
        state.rows.extend(rows);
        Some(state.rows.len())
    }

    /// Take everything buffered and restart the flush clock
    pub fn drain(&self) -> Vec<EncodedRow> {
        let mut state = self.state.lock();
        state.last_flush = Instant::now();
        std::mem::take(&mut state.rows)
    }

    /// Take everything buffered if a trigger has fired
    ///
    /// The check and the take happen under one lock acquisition.
    pub fn drain_if_due(&self, triggers: &FlushTriggers) -> Option<Vec<EncodedRow>> {
        let mut state = self.state.lock();
        if state.rows.is_empty() || !triggers.is_due(state.rows.len(), state.last_flush.elapsed()) {
            return None;
        }
        state.last_flush = Instant::now();
        Some(std::mem::take(&mut state.rows))
    }

    /// Put a failed batch back in front of anything appended since
    pub fn requeue(&self, mut batch: Vec<EncodedRow>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        batch.append(&mut state.rows);
        state.rows = batch;
    }

    /// Refuse further appends and take what is left
    pub fn seal(&self) -> Vec<EncodedRow> {
        let mut state = self.state.lock();
        state.sealed = true;
        std::mem::take(&mut state.rows)
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().rows.is_empty()
    }

    /// Time since the last drain (or creation)
    pub fn since_last_flush(&self) -> Duration {
        self.state.lock().last_flush.elapsed()
    }
}

impl Default for RowBuffer {
    fn default() -> Self {
        Self::new()
    }
}
