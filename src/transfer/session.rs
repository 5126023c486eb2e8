// src/transfer/session.rs
//! Per-transfer state

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::crypto::PeerPublicKey;
use crate::models::TransferStatus;

/// Progress observer: `(bytes_transferred, total_size)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Which side asked for the pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOrigin {
    Local,
    Peer,
}

pub(crate) struct TransferSession {
    pub transfer_id: String,
    pub file_path: PathBuf,
    /// Permission key of the file (canonical path) for outgoing transfers
    pub file_id: String,
    pub file_name: String,
    pub peer_id: String,
    pub direction: Direction,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub pause_position: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub pause_origin: Option<PauseOrigin>,
    /// Offset the worker must seek to and announce on its next step
    pub resume_offset: Option<u64>,
    pub peer_key: Option<PeerPublicKey>,
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("transfer_id", &self.transfer_id)
            .field("file_path", &self.file_path)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("total_size", &self.total_size)
            .field("bytes_transferred", &self.bytes_transferred)
            .field("pause_position", &self.pause_position)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("encrypted", &self.peer_key.is_some())
            .finish()
    }
}

impl TransferSession {
    pub fn new(
        transfer_id: String,
        file_path: PathBuf,
        file_id: String,
        peer_id: String,
        direction: Direction,
        total_size: u64,
    ) -> Self {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            transfer_id,
            file_path,
            file_id,
            file_name,
            peer_id,
            direction,
            total_size,
            bytes_transferred: 0,
            pause_position: 0,
            status: TransferStatus::Pending,
            error: None,
            pause_origin: None,
            resume_offset: None,
            peer_key: None,
            progress: None,
        }
    }

    pub fn info(&self) -> TransferInfo {
        TransferInfo {
            transfer_id: self.transfer_id.clone(),
            file_path: self.file_path.clone(),
            peer_id: self.peer_id.clone(),
            direction: self.direction,
            total_size: self.total_size,
            bytes_transferred: self.bytes_transferred,
            pause_position: self.pause_position,
            status: self.status,
            paused_by: self.pause_origin,
            error: self.error.clone(),
        }
    }
}

pub(crate) type SharedSession = Arc<Mutex<TransferSession>>;

pub(crate) fn lock_session(session: &SharedSession) -> MutexGuard<'_, TransferSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of a transfer returned to callers
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub transfer_id: String,
    pub file_path: PathBuf,
    pub peer_id: String,
    pub direction: Direction,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub pause_position: u64,
    pub status: TransferStatus,
    pub paused_by: Option<PauseOrigin>,
    pub error: Option<String>,
}

impl TransferInfo {
    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == TransferStatus::Completed { 100.0 } else { 0.0 };
        }
        self.bytes_transferred as f64 * 100.0 / self.total_size as f64
    }
}
