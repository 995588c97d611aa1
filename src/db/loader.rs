//! Batch loading into DuckDB
//!
//! Two strategies, picked per sink:
//!
//! - **Transactional**: `BEGIN`, one prepared insert per row, `COMMIT`. Any
//!   row failure rolls the whole batch back, so a batch is either fully
//!   visible or not at all. With dedupe on, retrying a failed batch is
//!   idempotent. Splitting a refused batch to isolate its bad rows is the
//!   flusher's job.
//! - **Appender**: DuckDB's bulk appender, no transaction and no conflict
//!   detection. Rows appended before a failing row may already be visible
//!   when the error is returned, so a retry can insert them twice.

use crate::config::{DuplicatePolicy, LoadStrategy};
use crate::db::schema::{insert_sql, table_columns, TableLayout};
use crate::encoder::EncodedRow;
use crate::error::{DbError, DbResult};
use duckdb::{params, Connection};
use tracing::{debug, warn};

/// Writes drained batches with the configured strategy
#[derive(Debug, Clone)]
pub struct Loader {
    layout: TableLayout,
    strategy: LoadStrategy,
    insert_sql: String,
}

impl Loader {
    pub fn new(layout: TableLayout, strategy: LoadStrategy, on_duplicate: DuplicatePolicy) -> Self {
        let insert_sql = insert_sql(&layout, on_duplicate);
        Self {
            layout,
            strategy,
            insert_sql,
        }
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    /// Validate the target table before the first batch
    ///
    /// Transactional loads prepare the insert into the statement cache, which
    /// fails for a pre-existing table with missing or mistyped columns. The
    /// appender writes columns by position, so the table's column order must
    /// match the layout exactly.
    pub fn prepare(&self, conn: &Connection) -> DbResult<()> {
        match self.strategy {
            LoadStrategy::Transactional => {
                conn.prepare_cached(&self.insert_sql)?;
            }
            LoadStrategy::Appender => {
                let found = table_columns(conn, &self.layout.table)?;
                let expected: Vec<String> =
                    self.layout.columns().into_iter().map(str::to_string).collect();

                let matches = found.len() == expected.len()
                    && found
                        .iter()
                        .zip(&expected)
                        .all(|(a, b)| a.eq_ignore_ascii_case(b));
                if !matches {
                    return Err(DbError::IncompatibleTable {
                        table: self.layout.table.clone(),
                        expected,
                        found,
                    });
                }
            }
        }
        Ok(())
    }

    /// Write a batch; returns rows inserted
    ///
    /// On error the caller owns the retry of the entire batch.
    pub fn load(&self, conn: &Connection, batch: &[EncodedRow]) -> DbResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        match self.strategy {
            LoadStrategy::Transactional => self.load_transactional(conn, batch),
            LoadStrategy::Appender => self.load_appender(conn, batch),
        }
    }

    fn load_transactional(&self, conn: &Connection, batch: &[EncodedRow]) -> DbResult<usize> {
        conn.execute_batch("BEGIN TRANSACTION")?;

        let result = self
            .insert_rows(conn, batch)
            .and_then(|inserted| {
                conn.execute_batch("COMMIT")?;
                Ok(inserted)
            });

        if result.is_err() {
            rollback(conn);
        }
        result
    }

    fn insert_rows(&self, conn: &Connection, batch: &[EncodedRow]) -> DbResult<usize> {
        let mut stmt = conn.prepare_cached(&self.insert_sql)?;
        let mut inserted = 0;

        for row in batch {
            inserted += match &row.record_hash {
                Some(hash) => stmt.execute(params![row.tag, row.time, row.record, hash])?,
                None => stmt.execute(params![row.tag, row.time, row.record])?,
            };
        }

        if inserted < batch.len() {
            debug!(
                skipped = batch.len() - inserted,
                "Duplicate rows skipped by conflict clause"
            );
        }
        Ok(inserted)
    }

    fn load_appender(&self, conn: &Connection, batch: &[EncodedRow]) -> DbResult<usize> {
        let mut appender = conn.appender(&self.layout.table)?;

        for row in batch {
            match &row.record_hash {
                Some(hash) => appender.append_row(params![row.tag, row.time, row.record, hash])?,
                None => appender.append_row(params![row.tag, row.time, row.record])?,
            }
        }

        appender.flush()?;
        Ok(batch.len())
    }
}

/// Best-effort rollback; the error that caused it is what the caller sees
fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{count_rows, ensure_schema};
    use crate::encoder::{RecordEncoder, TimeFormat};
    use crate::event::EventTime;
    use serde_json::json;

    fn layout(dedupe: bool) -> TableLayout {
        TableLayout {
            table: "test_events".into(),
            dedupe,
            ..TableLayout::default()
        }
    }

    fn setup(dedupe: bool, strategy: LoadStrategy, policy: DuplicatePolicy) -> (Connection, Loader) {
        let conn = Connection::open_in_memory().unwrap();
        let layout = layout(dedupe);
        ensure_schema(&conn, &layout).unwrap();
        let loader = Loader::new(layout, strategy, policy);
        loader.prepare(&conn).unwrap();
        (conn, loader)
    }

    fn rows(n: usize, dedupe: bool) -> Vec<EncodedRow> {
        let encoder = RecordEncoder::new(TimeFormat::Utc, dedupe);
        (0..n)
            .map(|i| {
                let time = EventTime::new(1_735_689_600 + i as i64, 0).unwrap();
                encoder.encode(time, "svc", &json!({"seq": i})).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_transactional_load() {
        let (conn, loader) = setup(true, LoadStrategy::Transactional, DuplicatePolicy::Abort);
        assert_eq!(loader.load(&conn, &rows(5, true)).unwrap(), 5);
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 5);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (conn, loader) = setup(true, LoadStrategy::Transactional, DuplicatePolicy::Abort);
        assert_eq!(loader.load(&conn, &[]).unwrap(), 0);
    }

    #[test]
    fn test_injected_duplicate_rolls_back_whole_batch() {
        let (conn, loader) = setup(true, LoadStrategy::Transactional, DuplicatePolicy::Abort);

        // Row 7 of 10 repeats row 2
        let mut batch = rows(10, true);
        batch[7] = batch[2].clone();

        let err = loader.load(&conn, &batch).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 0);

        // Connection is usable again after the rollback
        assert_eq!(loader.load(&conn, &rows(3, true)).unwrap(), 3);
    }

    #[test]
    fn test_replayed_batch_is_rejected() {
        let (conn, loader) = setup(true, LoadStrategy::Transactional, DuplicatePolicy::Abort);
        let batch = rows(4, true);

        loader.load(&conn, &batch).unwrap();
        assert!(loader.load(&conn, &batch).unwrap_err().is_duplicate());
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 4);
    }

    #[test]
    fn test_skip_policy_inserts_only_new_rows() {
        let (conn, loader) = setup(true, LoadStrategy::Transactional, DuplicatePolicy::Skip);
        let all = rows(6, true);

        assert_eq!(loader.load(&conn, &all[..3]).unwrap(), 3);
        // Replay of the first three plus three new rows
        assert_eq!(loader.load(&conn, &all).unwrap(), 3);
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 6);
    }

    #[test]
    fn test_without_dedupe_duplicates_are_kept() {
        let (conn, loader) = setup(false, LoadStrategy::Transactional, DuplicatePolicy::Abort);
        let batch = rows(2, false);

        loader.load(&conn, &batch).unwrap();
        loader.load(&conn, &batch).unwrap();
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 4);
    }

    #[test]
    fn test_bad_timestamp_is_rejected_and_rolled_back() {
        let (conn, loader) = setup(false, LoadStrategy::Transactional, DuplicatePolicy::Abort);
        let mut batch = rows(3, false);
        batch[1].time = "not a timestamp".into();

        let err = loader.load(&conn, &batch).unwrap_err();
        assert!(matches!(err, DbError::Rejected(_)));
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 0);
    }

    #[test]
    fn test_appender_load() {
        let (conn, loader) = setup(false, LoadStrategy::Appender, DuplicatePolicy::Abort);
        let batch = rows(50, false);

        assert_eq!(loader.load(&conn, &batch).unwrap(), 50);
        // No conflict detection: the same rows land again
        assert_eq!(loader.load(&conn, &batch).unwrap(), 50);
        assert_eq!(count_rows(&conn, "test_events").unwrap(), 100);

        let id: String = conn
            .query_row(
                "SELECT record->>'seq' FROM test_events ORDER BY time DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(id, "49");
    }

    #[test]
    fn test_appender_rejects_mismatched_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE test_events (record JSON, tag VARCHAR, time TIMESTAMP)")
            .unwrap();

        let loader = Loader::new(layout(false), LoadStrategy::Appender, DuplicatePolicy::Abort);
        let err = loader.prepare(&conn).unwrap_err();
        assert!(matches!(err, DbError::IncompatibleTable { .. }));
    }
}
