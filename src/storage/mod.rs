// src/storage/mod.rs
//! Durable tables for transfer checkpoints and file permissions
//!
//! Both stores sit on SQLite. They can share one database file; each store
//! keeps its own connection.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use rusqlite::Connection;

use crate::error::{CoreError, Result};

pub mod checkpoints;
pub mod permissions;

pub use checkpoints::{Checkpoint, CheckpointStore};
pub use permissions::PermissionStore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a file-backed connection in WAL mode
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns a row, so it cannot go through execute()
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    debug!("Opened database {} (journal mode {})", path.display(), mode);
    Ok(conn)
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| CoreError::Database("database connection lock poisoned".to_string()))
}
