//! tether-db: the durable session registry.
//!
//! One table of session rows keyed by the client-assigned `id`, independent
//! of any live connection. Every operation is atomic on a single row;
//! last-writer-wins is acceptable because all mutated fields are small
//! enumerations or scalars.

pub mod schema;
pub mod sessions;

use rusqlite::Connection;
use std::path::Path;

pub use sessions::{DbError, SessionPatch};

pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    schema::initialize(&conn)?;
    Ok(conn)
}

/// In-memory database, used by tests.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schema::initialize(&conn)?;
    Ok(conn)
}
