// src/transfer/mod.rs
//! Resumable peer-to-peer file transfers
//!
//! The [`TransferManager`] owns one state machine per transfer:
//!
//! ```text
//! Pending -> Connecting -> Transferring -> { Paused, Completed, Cancelled, Error }
//!                          Paused -> Transferring
//! ```
//!
//! Bytes move over a dedicated TCP connection per transfer (see [`frame`]),
//! not over the messaging channel. The sending side connects; the receiving
//! side listens and matches the HELLO frame against transfers it accepted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::crypto::primitives::AES_TAG_SIZE;
use crate::crypto::CryptoService;
use crate::error::{CoreError, Result};
use crate::models::{Message, MessageType, PermissionKind, PermissionRecord, TransferStatus};
use crate::storage::{CheckpointStore, PermissionStore};

pub mod events;
pub mod frame;
pub mod session;
mod worker;

pub use events::TransferEvent;
pub use session::{Direction, PauseOrigin, ProgressCallback, TransferInfo};

use events::EventSink;
use frame::{Frame, FrameReader, FrameWriter};
use session::{lock_session, SharedSession, TransferSession};
use worker::WorkerContext;

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Largest chunk that still fits a DATA frame once encrypted
pub const MAX_CHUNK_SIZE: usize = frame::MAX_PAYLOAD - AES_TAG_SIZE;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Delay after each chunk; crude bandwidth cap
    pub chunk_interval: Option<Duration>,
    pub handshake_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval: None,
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

/// Announcement of a transfer, carried as the content of a FileTransfer message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOffer {
    pub transfer_id: String,
    pub file_name: String,
    pub total_size: u64,
    /// Filled from the carrying message, not from the JSON body
    #[serde(skip)]
    pub sender_id: String,
}

impl TransferOffer {
    /// Parse the offer out of a received FileTransfer message
    pub fn from_message(message: &Message) -> Result<Self> {
        if message.kind() != MessageType::FileTransfer {
            return Err(CoreError::InvalidOperation(format!(
                "message {} is not a file transfer offer",
                message.id()
            )));
        }
        let mut offer: TransferOffer = serde_json::from_str(message.content())
            .map_err(|e| CoreError::InvalidOperation(format!("malformed transfer offer: {}", e)))?;
        offer.sender_id = message.sender_id().to_string();
        Ok(offer)
    }

    pub fn to_content(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Key used for permission records: the canonical path when the file exists
pub fn file_id_for(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn validate_peer_address(addr: &str) -> Result<()> {
    let invalid = || CoreError::InvalidOperation(format!("invalid peer address '{}', expected host:port", addr));
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(invalid()),
    }
}

struct TransferEntry {
    session: SharedSession,
    wake: Arc<Notify>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TransferEntry {
    fn new(session: TransferSession) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            session: Arc::new(StdMutex::new(session)),
            wake: Arc::new(Notify::new()),
            cancel,
            task: None,
        }
    }

    /// Raise the cancel flag. Must happen before the status goes terminal so
    /// the worker still sends CANCEL.
    fn signal_cancel(&self) {
        self.cancel.send_replace(true);
        self.wake.notify_one();
    }

    /// Stop the worker and wait for it to release the socket and file
    async fn shut_down(mut self) {
        self.signal_cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Transfer worker ended abnormally: {}", e);
            }
        }
    }
}

struct Inner {
    local_user: String,
    crypto: Arc<CryptoService>,
    checkpoints: Arc<CheckpointStore>,
    permissions: Arc<PermissionStore>,
    config: TransferConfig,
    transfers: Mutex<HashMap<String, TransferEntry>>,
    events: EventSink,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn worker_context(&self, transfer_id: &str, entry: &TransferEntry) -> WorkerContext {
        WorkerContext {
            transfer_id: transfer_id.to_string(),
            session: entry.session.clone(),
            wake: entry.wake.clone(),
            cancel: entry.cancel.subscribe(),
            checkpoints: self.checkpoints.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let hello = match timeout(self.config.handshake_timeout, reader.read_frame()).await {
            Ok(Ok(Some(Frame::Hello(hello)))) => hello,
            Ok(Ok(Some(other))) => {
                return Err(CoreError::Network(format!("expected HELLO, got {}", other.name())))
            }
            Ok(Ok(None)) => return Err(CoreError::Network("connection closed before HELLO".to_string())),
            Ok(Err(e)) => return Err(CoreError::Network(format!("bad HELLO: {}", e))),
            Err(_) => return Err(CoreError::Network("timed out waiting for HELLO".to_string())),
        };
        debug!("HELLO for transfer {} from {}", hello.transfer_id, hello.sender_id);

        let transfer_id = hello.transfer_id.clone();
        let mut transfers = self.transfers.lock().await;
        let prepared = match transfers.get_mut(&transfer_id) {
            None => Err(CoreError::not_found("transfer", &transfer_id)),
            Some(entry) => self
                .open_incoming(&hello, &entry.session)
                .await
                .map(|(file, key)| (self.worker_context(&transfer_id, entry), file, key)),
        };

        match prepared {
            Ok((ctx, file, key)) => {
                if let Some(entry) = transfers.get_mut(&transfer_id) {
                    entry.task = Some(tokio::spawn(worker::run_incoming(ctx, reader, writer, file, key)));
                }
                drop(transfers);
                info!("Receiving transfer {} ({} bytes) from {}", transfer_id, hello.total_size, hello.sender_id);
                self.events.emit(TransferEvent::Started { transfer_id });
                Ok(())
            }
            Err(e) => {
                drop(transfers);
                // The sender treats CANCEL as a refusal
                let _ = timeout(Duration::from_secs(2), writer.write_frame(&Frame::Cancel)).await;
                Err(e)
            }
        }
    }

    /// Validate a HELLO against the accepted session and prepare the output file
    async fn open_incoming(
        &self,
        hello: &frame::Hello,
        session: &SharedSession,
    ) -> Result<(File, Option<worker::PayloadKey>)> {
        let path = {
            let s = lock_session(session);
            if s.direction != Direction::Incoming || s.status != TransferStatus::Pending {
                return Err(CoreError::InvalidOperation(format!(
                    "transfer {} is not waiting for a connection ({})",
                    s.transfer_id, s.status
                )));
            }
            if s.peer_id != hello.sender_id || s.total_size != hello.total_size {
                return Err(CoreError::InvalidOperation(format!(
                    "HELLO for {} does not match the accepted offer",
                    s.transfer_id
                )));
            }
            s.file_path.clone()
        };

        let key = match &hello.wrapped_key {
            Some(wrapped) => Some(worker::unwrap_payload_key(wrapped, |sealed| self.crypto.open_sealed(sealed))?),
            None => None,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(&path).await?;

        let mut s = lock_session(session);
        if s.status != TransferStatus::Pending {
            return Err(CoreError::InvalidOperation(format!("transfer {} changed state", s.transfer_id)));
        }
        s.status = TransferStatus::Transferring;
        Ok((file, key))
    }
}

async fn accept_loop(listener: TcpListener, inner: Weak<Inner>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Transfer listener accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        debug!("Transfer connection from {}", peer);
        tokio::spawn(async move {
            if let Err(e) = inner.handle_connection(stream).await {
                warn!("Rejected transfer connection from {}: {}", peer, e);
            }
        });
    }
}

/// Drives every transfer of one local user
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    pub fn new(
        local_user: &str,
        crypto: Arc<CryptoService>,
        checkpoints: Arc<CheckpointStore>,
        permissions: Arc<PermissionStore>,
        mut config: TransferConfig,
    ) -> Self {
        config.chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let events = EventSink::new(config.event_buffer);
        Self {
            inner: Arc::new(Inner {
                local_user: local_user.to_string(),
                crypto,
                checkpoints,
                permissions,
                config,
                transfers: Mutex::new(HashMap::new()),
                events,
                listener: StdMutex::new(None),
            }),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.inner.local_user
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Receive lifecycle events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> mpsc::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    async fn session(&self, transfer_id: &str) -> Result<(SharedSession, Arc<Notify>)> {
        let transfers = self.inner.transfers.lock().await;
        transfers
            .get(transfer_id)
            .map(|entry| (entry.session.clone(), entry.wake.clone()))
            .ok_or_else(|| CoreError::not_found("transfer", transfer_id))
    }

    /// Register an outgoing transfer of `file_path` to `receiver_id`
    pub async fn initiate_transfer(&self, file_path: &Path, receiver_id: &str) -> Result<String> {
        let metadata = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| CoreError::File(format!("{}: {}", file_path.display(), e)))?;
        if !metadata.is_file() {
            return Err(CoreError::File(format!("{} is not a regular file", file_path.display())));
        }

        let file_id = file_id_for(file_path);
        if !self.inner.permissions.has_permission(receiver_id, &file_id, PermissionKind::Read)? {
            warn!("{} has no read grant on {}", receiver_id, file_id);
            return Err(CoreError::PermissionDenied(format!(
                "{} may not read {}",
                receiver_id, file_id
            )));
        }

        let transfer_id = uuid::Uuid::new_v4().to_string();
        let session = TransferSession::new(
            transfer_id.clone(),
            PathBuf::from(&file_id),
            file_id,
            receiver_id.to_string(),
            Direction::Outgoing,
            metadata.len(),
        );
        self.inner
            .transfers
            .lock()
            .await
            .insert(transfer_id.clone(), TransferEntry::new(session));

        info!(
            "Created transfer {} of {} ({} bytes) to {}",
            transfer_id,
            file_path.display(),
            metadata.len(),
            receiver_id
        );
        Ok(transfer_id)
    }

    /// Offer describing an outgoing transfer, for announcing it to the receiver
    pub async fn offer_for(&self, transfer_id: &str) -> Result<TransferOffer> {
        let (session, _) = self.session(transfer_id).await?;
        let s = lock_session(&session);
        Ok(TransferOffer {
            transfer_id: s.transfer_id.clone(),
            file_name: s.file_name.clone(),
            total_size: s.total_size,
            sender_id: self.inner.local_user.clone(),
        })
    }

    /// Encrypt the chunks of an outgoing transfer for this peer key (PEM)
    pub async fn set_peer_public_key(&self, transfer_id: &str, public_key: &str) -> Result<()> {
        let key = self.inner.crypto.import_public_key(public_key)?;
        let (session, _) = self.session(transfer_id).await?;
        let mut s = lock_session(&session);
        if s.direction != Direction::Outgoing || s.status != TransferStatus::Pending {
            return Err(CoreError::InvalidOperation(format!(
                "peer key can only be set on a pending outgoing transfer ({})",
                s.status
            )));
        }
        s.peer_key = Some(key);
        Ok(())
    }

    pub async fn set_progress_callback<F>(&self, transfer_id: &str, callback: F) -> Result<()>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let (session, _) = self.session(transfer_id).await?;
        lock_session(&session).progress = Some(Arc::new(callback));
        Ok(())
    }

    /// Connect to the receiver at `addr` ("host:port") and start sending
    pub async fn initiate_p2p_transfer(&self, transfer_id: &str, addr: &str) -> Result<()> {
        validate_peer_address(addr)?;

        let mut transfers = self.inner.transfers.lock().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| CoreError::not_found("transfer", transfer_id))?;
        {
            let mut s = lock_session(&entry.session);
            if s.direction != Direction::Outgoing {
                return Err(CoreError::InvalidOperation(format!(
                    "transfer {} is incoming; the sender connects",
                    transfer_id
                )));
            }
            if s.status != TransferStatus::Pending {
                return Err(CoreError::InvalidOperation(format!(
                    "transfer {} cannot connect from state {}",
                    transfer_id, s.status
                )));
            }
            s.status = TransferStatus::Connecting;
        }

        let ctx = self.inner.worker_context(transfer_id, entry);
        entry.task = Some(tokio::spawn(worker::run_outgoing(
            ctx,
            addr.to_string(),
            self.inner.local_user.clone(),
        )));

        info!("Transfer {} connecting to {}", transfer_id, addr);
        self.inner.events.emit(TransferEvent::Connecting { transfer_id: transfer_id.to_string() });
        Ok(())
    }

    /// Accept incoming transfer connections on `addr`; returns the bound address
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        if self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Err(CoreError::InvalidOperation("already listening for transfers".to_string()));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::Network(format!("cannot listen on {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CoreError::Network(e.to_string()))?;

        let handle = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner)));
        *self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Listening for transfers on {}", local_addr);
        Ok(local_addr)
    }

    /// Register an announced transfer so the sender's connection is accepted
    pub async fn accept_transfer(&self, offer: &TransferOffer, save_path: &Path) -> Result<()> {
        let mut transfers = self.inner.transfers.lock().await;
        if transfers.contains_key(&offer.transfer_id) {
            return Err(CoreError::InvalidOperation(format!(
                "transfer {} is already registered",
                offer.transfer_id
            )));
        }

        let session = TransferSession::new(
            offer.transfer_id.clone(),
            save_path.to_path_buf(),
            save_path.to_string_lossy().into_owned(),
            offer.sender_id.clone(),
            Direction::Incoming,
            offer.total_size,
        );
        transfers.insert(offer.transfer_id.clone(), TransferEntry::new(session));
        info!(
            "Accepted transfer {} of '{}' from {} into {}",
            offer.transfer_id,
            offer.file_name,
            offer.sender_id,
            save_path.display()
        );
        Ok(())
    }

    /// Pause at the current offset; the checkpoint is saved before returning
    pub async fn pause_transfer(&self, transfer_id: &str) -> Result<()> {
        let (session, wake) = self.session(transfer_id).await?;
        let offset = {
            let mut s = lock_session(&session);
            if s.status != TransferStatus::Transferring {
                return Err(CoreError::InvalidOperation(format!(
                    "cannot pause transfer {} in state {}",
                    transfer_id, s.status
                )));
            }
            self.inner.checkpoints.save(transfer_id, s.bytes_transferred)?;
            s.pause_position = s.bytes_transferred;
            s.status = TransferStatus::Paused;
            s.pause_origin = Some(PauseOrigin::Local);
            s.pause_position
        };
        wake.notify_one();

        info!("Transfer {} paused at {}", transfer_id, offset);
        self.inner
            .events
            .emit(TransferEvent::Paused { transfer_id: transfer_id.to_string(), offset });
        Ok(())
    }

    /// Continue a locally paused transfer from its checkpoint
    pub async fn resume_transfer(&self, transfer_id: &str) -> Result<()> {
        let (session, wake) = self.session(transfer_id).await?;
        let (direction, file_id, peer_id) = {
            let s = lock_session(&session);
            if s.status != TransferStatus::Paused || s.pause_origin != Some(PauseOrigin::Local) {
                return Err(CoreError::InvalidOperation(format!(
                    "cannot resume transfer {} in state {}",
                    transfer_id, s.status
                )));
            }
            (s.direction, s.file_id.clone(), s.peer_id.clone())
        };

        if direction == Direction::Outgoing
            && !self.inner.permissions.has_permission(&peer_id, &file_id, PermissionKind::Read)?
        {
            return Err(CoreError::PermissionDenied(format!(
                "{} may no longer read {}",
                peer_id, file_id
            )));
        }

        // A chunk still in flight at pause time may move the checkpoint, so it
        // is read under the same lock the worker advances under.
        let offset = {
            let mut s = lock_session(&session);
            if s.status != TransferStatus::Paused || s.pause_origin != Some(PauseOrigin::Local) {
                return Err(CoreError::InvalidOperation(format!(
                    "transfer {} changed state during resume",
                    transfer_id
                )));
            }
            let checkpoint = match self.inner.checkpoints.load(transfer_id) {
                Ok(Some(checkpoint)) => checkpoint.offset,
                Ok(None) => s.pause_position,
                Err(e) => {
                    warn!("Checkpoint for {} unavailable ({}), using in-memory position", transfer_id, e);
                    s.pause_position
                }
            };
            let offset = checkpoint.min(s.bytes_transferred);
            s.bytes_transferred = offset;
            s.pause_position = offset;
            s.status = TransferStatus::Transferring;
            s.pause_origin = None;
            s.resume_offset = Some(offset);
            offset
        };
        wake.notify_one();

        info!("Transfer {} resumed from {}", transfer_id, offset);
        self.inner
            .events
            .emit(TransferEvent::Resumed { transfer_id: transfer_id.to_string(), offset });
        Ok(())
    }

    /// Stop the transfer, tell the peer, and forget it
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        let entry = {
            let mut transfers = self.inner.transfers.lock().await;
            let entry = transfers
                .get(transfer_id)
                .ok_or_else(|| CoreError::not_found("transfer", transfer_id))?;
            {
                let mut s = lock_session(&entry.session);
                if s.status.is_terminal() {
                    return Err(CoreError::InvalidOperation(format!(
                        "transfer {} already ended ({})",
                        transfer_id, s.status
                    )));
                }
                entry.signal_cancel();
                s.status = TransferStatus::Cancelled;
            }
            transfers.remove(transfer_id)
        };

        if let Some(entry) = entry {
            entry.shut_down().await;
        }
        if let Err(e) = self.inner.checkpoints.delete(transfer_id) {
            warn!("Could not delete checkpoint for {}: {}", transfer_id, e);
        }

        info!("Transfer {} cancelled", transfer_id);
        self.inner
            .events
            .emit(TransferEvent::Cancelled { transfer_id: transfer_id.to_string() });
        Ok(())
    }

    /// Release everything held for a transfer, whatever its state
    pub async fn cleanup_transfer(&self, transfer_id: &str) -> Result<()> {
        let entry = self.inner.transfers.lock().await.remove(transfer_id);
        if let Some(entry) = entry {
            self.release(transfer_id, entry).await;
        }
        Ok(())
    }

    pub async fn cleanup_all_transfers(&self) -> Result<()> {
        let entries: Vec<(String, TransferEntry)> = self.inner.transfers.lock().await.drain().collect();
        for (transfer_id, entry) in entries {
            self.release(&transfer_id, entry).await;
        }
        Ok(())
    }

    async fn release(&self, transfer_id: &str, entry: TransferEntry) {
        entry.signal_cancel();
        {
            let mut s = lock_session(&entry.session);
            if !s.status.is_terminal() {
                s.status = TransferStatus::Cancelled;
            }
        }
        entry.shut_down().await;
        if let Err(e) = self.inner.checkpoints.delete(transfer_id) {
            warn!("Could not delete checkpoint for {}: {}", transfer_id, e);
        }
        debug!("Released transfer {}", transfer_id);
    }

    /// Snapshot of one transfer. Transfers that ended on their own (completed,
    /// failed, or cancelled by the peer) stay visible until cleaned up;
    /// [`cancel_transfer`](Self::cancel_transfer) forgets them at once.
    pub async fn get_transfer(&self, transfer_id: &str) -> Option<TransferInfo> {
        let transfers = self.inner.transfers.lock().await;
        transfers.get(transfer_id).map(|entry| lock_session(&entry.session).info())
    }

    /// Transfers that have not reached a terminal state
    pub async fn active_transfers(&self) -> Vec<TransferInfo> {
        let transfers = self.inner.transfers.lock().await;
        transfers
            .values()
            .map(|entry| lock_session(&entry.session).info())
            .filter(|info| !info.status.is_terminal())
            .collect()
    }

    pub fn set_permissions(&self, file_path: &Path, user_id: &str, record: &PermissionRecord) -> Result<()> {
        self.inner.permissions.set(&file_id_for(file_path), user_id, record)
    }

    pub fn get_permissions(&self, file_path: &Path, user_id: &str) -> Result<Option<PermissionRecord>> {
        self.inner.permissions.get(&file_id_for(file_path), user_id)
    }

    pub fn has_permission(&self, user_id: &str, file_path: &Path, kind: PermissionKind) -> Result<bool> {
        self.inner.permissions.has_permission(user_id, &file_id_for(file_path), kind)
    }
}
