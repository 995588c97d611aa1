//! DuckDB connection lifecycle
//!
//! A [`Database`] owns at most one connection. DuckDB allows a single
//! writer per database file, so the sink never opens a second one.

use crate::error::{DbError, DbResult};
use duckdb::Connection;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    /// Private in-memory database, gone when the connection closes
    InMemory,

    /// Database file, created on first open
    File(PathBuf),
}

impl DbLocation {
    /// Marker accepted for an in-memory database
    pub const MEMORY: &'static str = ":memory:";

    /// Parse a path, treating `:memory:` and the empty string as in-memory
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.is_empty() || location == Self::MEMORY {
            DbLocation::InMemory
        } else {
            DbLocation::File(PathBuf::from(location))
        }
    }
}

impl fmt::Display for DbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbLocation::InMemory => f.write_str(Self::MEMORY),
            DbLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

enum ConnState {
    Disconnected,
    Connected(Connection),
    Closed,
}

/// Owner of the single DuckDB connection
///
/// States move `Disconnected -> Connected -> Closed`. Reconnecting after
/// `close()` is refused so that out-of-order lifecycle calls surface early.
pub struct Database {
    location: DbLocation,
    state: ConnState,
}

impl Database {
    pub fn new(location: DbLocation) -> Self {
        Self {
            location,
            state: ConnState::Disconnected,
        }
    }

    /// Open the connection; a no-op when already connected
    pub fn connect(&mut self) -> DbResult<()> {
        match self.state {
            ConnState::Connected(_) => return Ok(()),
            ConnState::Closed => return Err(DbError::Closed),
            ConnState::Disconnected => {}
        }

        let result = match &self.location {
            DbLocation::InMemory => Connection::open_in_memory(),
            DbLocation::File(path) => Connection::open(path),
        };

        let conn = result.map_err(|source| DbError::Connection {
            location: self.location.to_string(),
            source,
        })?;

        debug!(location = %self.location, "Database connected");
        self.state = ConnState::Connected(conn);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnState::Connected(_))
    }

    /// Borrow the live connection
    pub fn connection(&self) -> DbResult<&Connection> {
        match &self.state {
            ConnState::Connected(conn) => Ok(conn),
            ConnState::Disconnected => Err(DbError::NotConnected),
            ConnState::Closed => Err(DbError::Closed),
        }
    }

    /// Release the connection and database handle
    ///
    /// Idempotent and safe before `connect()`. Close failures are logged,
    /// never returned.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, ConnState::Closed) {
            ConnState::Connected(conn) => match conn.close() {
                Ok(()) => debug!(location = %self.location, "Database closed"),
                Err((_conn, e)) => {
                    warn!(location = %self.location, error = %e, "Failed to close database cleanly")
                }
            },
            ConnState::Disconnected | ConnState::Closed => {}
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ConnState::Disconnected => "disconnected",
            ConnState::Connected(_) => "connected",
            ConnState::Closed => "closed",
        };
        f.debug_struct("Database")
            .field("location", &self.location)
            .field("state", &state)
            .finish()
    }
}
