// src/storage/checkpoints.rs
//! Transfer progress checkpoints

use std::path::Path;
use std::sync::Mutex;

use log::{debug, trace};
use rusqlite::{params, Connection, OptionalExtension};

use super::{lock, open_connection};
use crate::error::Result;
use crate::models::now_millis;

/// Last durable offset of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub transfer_id: String,
    pub offset: u64,
    /// Epoch milliseconds of the last save
    pub updated_at: i64,
}

pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(open_connection(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS checkpoints (
                transfer_id TEXT PRIMARY KEY,
                "offset" INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Upsert the offset for a transfer
    pub fn save(&self, transfer_id: &str, offset: u64) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            r#"INSERT OR REPLACE INTO checkpoints (transfer_id, "offset", updated_at)
             VALUES (?1, ?2, ?3)"#,
            params![transfer_id, offset as i64, now_millis()],
        )?;
        trace!("Checkpoint for {} saved at {}", transfer_id, offset);
        Ok(())
    }

    pub fn load(&self, transfer_id: &str) -> Result<Option<Checkpoint>> {
        let conn = lock(&self.conn)?;
        let checkpoint = conn
            .query_row(
                r#"SELECT transfer_id, "offset", updated_at FROM checkpoints WHERE transfer_id = ?1"#,
                params![transfer_id],
                |row| {
                    Ok(Checkpoint {
                        transfer_id: row.get(0)?,
                        offset: row.get::<_, i64>(1)? as u64,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    /// Remove a checkpoint; deleting a missing one is not an error
    pub fn delete(&self, transfer_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            "DELETE FROM checkpoints WHERE transfer_id = ?1",
            params![transfer_id],
        )?;
        if removed > 0 {
            debug!("Deleted checkpoint for {}", transfer_id);
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"SELECT transfer_id, "offset", updated_at FROM checkpoints ORDER BY updated_at"#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Checkpoint {
                transfer_id: row.get(0)?,
                offset: row.get::<_, i64>(1)? as u64,
                updated_at: row.get(2)?,
            })
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?);
        }
        Ok(checkpoints)
    }
}
