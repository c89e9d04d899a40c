use crate::core::error::{SightlineError, io_at};
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

pub fn db_connect(db_path: &Path) -> Result<Connection, SightlineError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

/// Open the session catalog, creating its tables on first use.
pub fn open_catalog(db_path: &Path) -> Result<Connection, SightlineError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }
    let conn = db_connect(db_path)?;
    conn.execute(schemas::SESSIONS_SCHEMA, [])?;
    conn.execute(schemas::SESSIONS_INDEX, [])?;
    conn.execute(schemas::TRANSITIONS_SCHEMA, [])?;
    Ok(conn)
}
