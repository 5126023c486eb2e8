// src/storage/permissions.rs
//! Per-file, per-user access grants
//!
//! No row means no access.

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};

use super::{lock, open_connection};
use crate::error::Result;
use crate::models::{now_millis, PermissionKind, PermissionRecord};

pub struct PermissionStore {
    conn: Mutex<Connection>,
}

impl PermissionStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(open_connection(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS permissions (
                file_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                can_read INTEGER NOT NULL,
                can_write INTEGER NOT NULL,
                can_share INTEGER NOT NULL,
                expiry_time INTEGER,
                PRIMARY KEY (file_id, user_id)
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create or replace the grant for `user_id` on `file_id`
    pub fn set(&self, file_id: &str, user_id: &str, record: &PermissionRecord) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO permissions
                (file_id, user_id, can_read, can_write, can_share, expiry_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file_id,
                user_id,
                record.can_read,
                record.can_write,
                record.can_share,
                record.expiry_time,
            ],
        )?;
        info!("Permissions for {} on {} set to {:?}", user_id, file_id, record);
        Ok(())
    }

    pub fn get(&self, file_id: &str, user_id: &str) -> Result<Option<PermissionRecord>> {
        let conn = lock(&self.conn)?;
        let record = conn
            .query_row(
                "SELECT can_read, can_write, can_share, expiry_time
                 FROM permissions WHERE file_id = ?1 AND user_id = ?2",
                params![file_id, user_id],
                |row| {
                    Ok(PermissionRecord {
                        can_read: row.get(0)?,
                        can_write: row.get(1)?,
                        can_share: row.get(2)?,
                        expiry_time: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn revoke(&self, file_id: &str, user_id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM permissions WHERE file_id = ?1 AND user_id = ?2",
            params![file_id, user_id],
        )?;
        debug!("Revoked permissions for {} on {}", user_id, file_id);
        Ok(())
    }

    /// False when there is no grant or the grant has expired, whatever its flags
    pub fn has_permission(&self, user_id: &str, file_id: &str, kind: PermissionKind) -> Result<bool> {
        let record = match self.get(file_id, user_id)? {
            Some(record) => record,
            None => return Ok(false),
        };
        if record.is_expired(now_millis()) {
            debug!("Grant for {} on {} expired", user_id, file_id);
            return Ok(false);
        }

        Ok(match kind {
            PermissionKind::Read => record.can_read,
            PermissionKind::Write => record.can_write,
            PermissionKind::Share => record.can_share,
        })
    }
}
