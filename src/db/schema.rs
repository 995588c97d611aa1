//! Table definition and creation
//!
//! This module defines the DuckDB table that stores log events and the
//! insert statement the transactional loader prepares against it.

use crate::config::{DuplicatePolicy, DEFAULT_TABLE};
use crate::error::{DbError, DbResult};
use duckdb::Connection;

/// Column holding the content hash when dedupe is on
pub const HASH_COLUMN: &str = "record_hash";

/// Table name, column names and whether the dedupe constraint exists
///
/// Names are validated as bare identifiers by `SinkConfig::validate` before
/// they reach any SQL built here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table: String,
    pub tag_col: String,
    pub time_col: String,
    pub record_col: String,
    pub dedupe: bool,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            tag_col: "tag".to_string(),
            time_col: "time".to_string(),
            record_col: "record".to_string(),
            dedupe: true,
        }
    }
}

impl TableLayout {
    /// Columns in declared order
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = vec![
            self.tag_col.as_str(),
            self.time_col.as_str(),
            self.record_col.as_str(),
        ];
        if self.dedupe {
            columns.push(HASH_COLUMN);
        }
        columns
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

/// `CREATE TABLE IF NOT EXISTS` for the layout
pub fn create_table_sql(layout: &TableLayout) -> String {
    let mut columns = vec![
        format!("{} VARCHAR", quote(&layout.tag_col)),
        // Stored as UTC; DuckDB keeps microsecond precision
        format!("{} TIMESTAMP", quote(&layout.time_col)),
        format!("{} JSON", quote(&layout.record_col)),
    ];

    if layout.dedupe {
        columns.push(format!("{} VARCHAR", quote(HASH_COLUMN)));
        columns.push(format!(
            "UNIQUE ({}, {}, {})",
            quote(&layout.tag_col),
            quote(&layout.time_col),
            quote(HASH_COLUMN)
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(&layout.table),
        columns.join(",\n    ")
    )
}

/// Parameterised insert for one encoded row
pub fn insert_sql(layout: &TableLayout, on_duplicate: DuplicatePolicy) -> String {
    let mut sql = if layout.dedupe {
        format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES (?, CAST(? AS TIMESTAMP), CAST(? AS JSON), ?)",
            quote(&layout.table),
            quote(&layout.tag_col),
            quote(&layout.time_col),
            quote(&layout.record_col),
            quote(HASH_COLUMN)
        )
    } else {
        format!(
            "INSERT INTO {} ({}, {}, {}) VALUES (?, CAST(? AS TIMESTAMP), CAST(? AS JSON))",
            quote(&layout.table),
            quote(&layout.tag_col),
            quote(&layout.time_col),
            quote(&layout.record_col)
        )
    };

    // Conflicts only exist when the UNIQUE constraint does
    if layout.dedupe && on_duplicate == DuplicatePolicy::Skip {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}

/// Create the table if missing; never touches existing rows
pub fn ensure_schema(conn: &Connection, layout: &TableLayout) -> DbResult<()> {
    conn.execute_batch(&create_table_sql(layout))
        .map_err(|source| DbError::Schema {
            table: layout.table.clone(),
            source,
        })
}

/// Column names of an existing table in declared order
pub fn table_columns(conn: &Connection, table: &str) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = stmt
        .query_map(duckdb::params![table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(columns)
}

/// Number of rows in a table
pub fn count_rows(conn: &Connection, table: &str) -> DbResult<i64> {
    let count = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}
