// src/transfer/worker.rs
//! Per-transfer worker task
//!
//! One task owns the socket and the file handle. It runs a step loop: look at
//! the session state, then either announce a pause/resume to the peer, wait
//! for a wake-up, or move one chunk. Inbound frames arrive through a pump task
//! so that waiting on them never loses a partially read frame.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, error, info, trace, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use zeroize::Zeroizing;

use super::events::{EventSink, TransferEvent};
use super::frame::{Frame, FrameError, FrameReader, FrameWriter, Hello};
use super::session::{lock_session, PauseOrigin, SharedSession};
use super::TransferConfig;
use crate::crypto::primitives::{self, AES_IV_SIZE, AES_KEY_SIZE};
use crate::models::TransferStatus;
use crate::storage::CheckpointStore;

const CANCEL_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-transfer payload key
pub(crate) type PayloadKey = Zeroizing<[u8; AES_KEY_SIZE]>;

type PeerFrames = mpsc::Receiver<Result<Frame, FrameError>>;

/// Everything a worker shares with the manager
pub(crate) struct WorkerContext {
    pub transfer_id: String,
    pub session: SharedSession,
    pub wake: Arc<Notify>,
    pub cancel: watch::Receiver<bool>,
    pub checkpoints: Arc<CheckpointStore>,
    pub events: EventSink,
    pub config: TransferConfig,
}

impl WorkerContext {
    pub fn fail(&self, message: String) {
        {
            let mut session = lock_session(&self.session);
            if session.status.is_terminal() {
                return;
            }
            session.status = TransferStatus::Error;
            session.error = Some(message.clone());
        }
        error!("Transfer {} failed: {}", self.transfer_id, message);
        self.events.emit(TransferEvent::Failed { transfer_id: self.transfer_id.clone(), error: message });
    }

    /// Mark the transfer done. A local pause that raced the last chunk does
    /// not hold it back once every byte is in.
    fn complete(&self) {
        {
            let mut session = lock_session(&self.session);
            let all_bytes_paused =
                session.status == TransferStatus::Paused && session.bytes_transferred == session.total_size;
            if !all_bytes_paused && !session.status.can_transition_to(TransferStatus::Completed) {
                return;
            }
            session.status = TransferStatus::Completed;
            session.pause_origin = None;
        }
        if let Err(e) = self.checkpoints.delete(&self.transfer_id) {
            warn!("Could not delete checkpoint for {}: {}", self.transfer_id, e);
        }
        info!("Transfer {} completed", self.transfer_id);
        self.events.emit(TransferEvent::Completed { transfer_id: self.transfer_id.clone() });
    }

    /// Count `n` more bytes. A chunk that lands while paused moves the pause
    /// position and the checkpoint along with it.
    pub(crate) fn advance(&self, n: u64) {
        let (bytes, total, progress) = {
            let mut session = lock_session(&self.session);
            session.bytes_transferred += n;
            if session.status == TransferStatus::Paused {
                session.pause_position = session.bytes_transferred;
                if let Err(e) = self.checkpoints.save(&self.transfer_id, session.pause_position) {
                    warn!("Could not refresh checkpoint for {}: {}", self.transfer_id, e);
                }
            }
            (session.bytes_transferred, session.total_size, session.progress.clone())
        };

        trace!("Transfer {}: {}/{} bytes", self.transfer_id, bytes, total);
        if let Some(callback) = progress {
            callback(bytes, total);
        }
        self.events.emit(TransferEvent::Progress {
            transfer_id: self.transfer_id.clone(),
            bytes_transferred: bytes,
            total_size: total,
        });
    }
}

/// What the step loop should do next
enum Step {
    Exit,
    Cancel,
    AnnouncePause(u64),
    AnnounceResume(u64),
    Wait,
    Run,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

fn data_nonce(offset: u64) -> [u8; AES_IV_SIZE] {
    let mut nonce = [0u8; AES_IV_SIZE];
    nonce[4..].copy_from_slice(&offset.to_be_bytes());
    nonce
}

fn spawn_frame_pump(mut reader: FrameReader<OwnedReadHalf>) -> (PeerFrames, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move {
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    (rx, handle)
}

struct Worker {
    ctx: WorkerContext,
    writer: FrameWriter<OwnedWriteHalf>,
    frames: PeerFrames,
    file: File,
    key: Option<PayloadKey>,
    incoming: bool,
    pause_announced: bool,
}

impl Worker {
    fn next_step(&mut self) -> Step {
        if *self.ctx.cancel.borrow() {
            return Step::Cancel;
        }
        let mut session = lock_session(&self.ctx.session);
        match session.status {
            status if status.is_terminal() => Step::Exit,
            TransferStatus::Paused => {
                if session.pause_origin == Some(PauseOrigin::Local) && !self.pause_announced {
                    Step::AnnouncePause(session.pause_position)
                } else {
                    Step::Wait
                }
            }
            TransferStatus::Transferring => match session.resume_offset.take() {
                Some(offset) => Step::AnnounceResume(offset),
                None => Step::Run,
            },
            _ => Step::Wait,
        }
    }

    async fn run(mut self) {
        loop {
            if !self.incoming && self.drain_peer_frames().await == Flow::Stop {
                return;
            }

            let flow = match self.next_step() {
                Step::Exit => return,
                Step::Cancel => {
                    self.cancelled().await;
                    Flow::Stop
                }
                Step::AnnouncePause(offset) => {
                    self.pause_announced = true;
                    self.announce_pause(offset).await
                }
                Step::AnnounceResume(offset) => {
                    self.pause_announced = false;
                    match self.reposition(offset).await {
                        Flow::Continue => self.send_control(Frame::Resume(offset)).await,
                        Flow::Stop => Flow::Stop,
                    }
                }
                Step::Run if !self.incoming => self.send_chunk().await,
                Step::Run | Step::Wait => self.wait().await,
            };
            if flow == Flow::Stop {
                return;
            }
        }
    }

    async fn wait(&mut self) -> Flow {
        tokio::select! {
            biased;
            _ = self.ctx.cancel.changed() => {
                self.cancelled().await;
                Flow::Stop
            }
            _ = self.ctx.wake.notified() => Flow::Continue,
            frame = self.frames.recv() => self.handle_peer_frame(frame).await,
        }
    }

    /// Handle control frames that arrived while the sender was busy
    async fn drain_peer_frames(&mut self) -> Flow {
        loop {
            match self.frames.try_recv() {
                Ok(frame) => {
                    if self.handle_peer_frame(Some(frame)).await == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return self.handle_peer_frame(None).await,
            }
        }
    }

    async fn send_control(&mut self, frame: Frame) -> Flow {
        debug!("Transfer {}: sending {}", self.ctx.transfer_id, frame.name());
        match self.writer.write_frame(&frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                self.ctx.fail(format!("could not send {}: {}", frame.name(), e));
                Flow::Stop
            }
        }
    }

    /// A peer that already hung up is reported by the frame pump, after any
    /// frames it sent before closing.
    async fn announce_pause(&mut self, offset: u64) -> Flow {
        debug!("Transfer {}: sending PAUSE", self.ctx.transfer_id);
        if let Err(e) = self.writer.write_frame(&Frame::Pause(offset)).await {
            debug!("Transfer {}: PAUSE not delivered: {}", self.ctx.transfer_id, e);
        }
        Flow::Continue
    }

    /// Move the file cursor (and truncate on the receiving side) to `offset`
    async fn reposition(&mut self, offset: u64) -> Flow {
        let result = async {
            if self.incoming {
                self.file.flush().await?;
                self.file.set_len(offset).await?;
            }
            self.file.seek(SeekFrom::Start(offset)).await.map(|_| ())
        }
        .await;

        match result {
            Ok(()) => Flow::Continue,
            Err(e) => {
                self.ctx.fail(format!("could not seek to offset {}: {}", offset, e));
                Flow::Stop
            }
        }
    }

    async fn send_chunk(&mut self) -> Flow {
        let (offset, total) = {
            let session = lock_session(&self.ctx.session);
            (session.bytes_transferred, session.total_size)
        };

        if offset >= total {
            if self.send_control(Frame::End(total)).await == Flow::Stop {
                return Flow::Stop;
            }
            let _ = self.writer.shutdown().await;
            self.ctx.complete();
            return Flow::Stop;
        }

        let len = (total - offset).min(self.ctx.config.chunk_size as u64) as usize;
        let mut chunk = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.file.read(&mut chunk[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.ctx.fail(format!("read failed at offset {}: {}", offset, e));
                    return Flow::Stop;
                }
            }
        }
        if filled < len {
            self.ctx.fail(format!(
                "file ended at {} bytes, expected {}",
                offset + filled as u64,
                total
            ));
            return Flow::Stop;
        }

        let payload = match &self.key {
            Some(key) => match primitives::encrypt(
                &chunk,
                &key[..],
                &data_nonce(offset),
                self.ctx.transfer_id.as_bytes(),
            ) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    self.ctx.fail(format!("chunk encryption failed: {}", e));
                    return Flow::Stop;
                }
            },
            None => chunk,
        };

        let frame = Frame::Data(payload);
        tokio::select! {
            biased;
            _ = self.ctx.cancel.changed() => {
                self.cancelled().await;
                return Flow::Stop;
            }
            result = self.writer.write_frame(&frame) => {
                if let Err(e) = result {
                    self.ctx.fail(format!("send failed at offset {}: {}", offset, e));
                    return Flow::Stop;
                }
            }
        }
        self.ctx.advance(len as u64);

        if let Some(interval) = self.ctx.config.chunk_interval {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.changed() => {
                    self.cancelled().await;
                    return Flow::Stop;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Flow::Continue
    }

    async fn receive_chunk(&mut self, payload: Vec<u8>) -> Flow {
        let (offset, total) = {
            let session = lock_session(&self.ctx.session);
            if session.status.is_terminal() {
                return Flow::Stop;
            }
            (session.bytes_transferred, session.total_size)
        };

        let chunk = match &self.key {
            Some(key) => match primitives::decrypt(
                &payload,
                &key[..],
                &data_nonce(offset),
                self.ctx.transfer_id.as_bytes(),
            ) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    self.ctx.fail(format!("chunk at offset {} failed to decrypt: {}", offset, e));
                    return Flow::Stop;
                }
            },
            None => payload,
        };

        if offset + chunk.len() as u64 > total {
            self.ctx.fail(format!("peer sent more than the announced {} bytes", total));
            return Flow::Stop;
        }
        if let Err(e) = self.file.write_all(&chunk).await {
            self.ctx.fail(format!("write failed at offset {}: {}", offset, e));
            return Flow::Stop;
        }
        self.ctx.advance(chunk.len() as u64);
        Flow::Continue
    }

    async fn finish_receive(&mut self, announced: u64) -> Flow {
        if let Err(e) = self.file.flush().await {
            self.ctx.fail(format!("flush failed: {}", e));
            return Flow::Stop;
        }
        let (bytes, total) = {
            let session = lock_session(&self.ctx.session);
            (session.bytes_transferred, session.total_size)
        };
        if bytes == total && announced == total {
            self.ctx.complete();
        } else {
            self.ctx.fail(format!(
                "peer ended the transfer at {} bytes (received {}, expected {})",
                announced, bytes, total
            ));
        }
        Flow::Stop
    }

    async fn handle_peer_frame(&mut self, frame: Option<Result<Frame, FrameError>>) -> Flow {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                self.ctx.fail(format!("bad frame from peer: {}", e));
                return Flow::Stop;
            }
            None => {
                self.ctx.fail("connection closed by peer".to_string());
                return Flow::Stop;
            }
        };
        trace!("Transfer {}: received {}", self.ctx.transfer_id, frame.name());

        match frame {
            Frame::Data(payload) if self.incoming => self.receive_chunk(payload).await,
            Frame::End(total) if self.incoming => self.finish_receive(total).await,
            Frame::Pause(offset) => {
                self.peer_paused(offset);
                Flow::Continue
            }
            Frame::Resume(offset) => self.peer_resumed(offset).await,
            Frame::Cancel => {
                self.peer_cancelled();
                Flow::Stop
            }
            other => {
                self.ctx.fail(format!("unexpected {} frame", other.name()));
                Flow::Stop
            }
        }
    }

    fn peer_paused(&self, offset: u64) {
        let position = {
            let mut session = lock_session(&self.ctx.session);
            if session.status != TransferStatus::Transferring {
                debug!("Ignoring PAUSE for {} in state {}", self.ctx.transfer_id, session.status);
                return;
            }
            session.status = TransferStatus::Paused;
            session.pause_origin = Some(PauseOrigin::Peer);
            session.pause_position = session.bytes_transferred;
            if let Err(e) = self.ctx.checkpoints.save(&self.ctx.transfer_id, session.pause_position) {
                warn!("Could not save checkpoint for {}: {}", self.ctx.transfer_id, e);
            }
            session.pause_position
        };
        if position != offset {
            debug!("Peer paused {} at {}, local position {}", self.ctx.transfer_id, offset, position);
        }
        info!("Transfer {} paused by peer at {}", self.ctx.transfer_id, position);
        self.ctx.events.emit(TransferEvent::Paused { transfer_id: self.ctx.transfer_id.clone(), offset: position });
    }

    async fn peer_resumed(&mut self, offset: u64) -> Flow {
        {
            let mut session = lock_session(&self.ctx.session);
            match (session.status, session.pause_origin) {
                (TransferStatus::Paused, Some(PauseOrigin::Peer)) => {}
                // Our PAUSE crossed the peer's RESUME; say it again
                (TransferStatus::Paused, Some(PauseOrigin::Local)) => {
                    self.pause_announced = false;
                    return Flow::Continue;
                }
                // The peer resumed before its PAUSE got here
                (TransferStatus::Transferring, _) if offset == session.bytes_transferred => {
                    return Flow::Continue;
                }
                (TransferStatus::Transferring, _) => {}
                (status, _) => {
                    debug!("Ignoring RESUME for {} in state {}", self.ctx.transfer_id, status);
                    return Flow::Continue;
                }
            }
            if offset > session.bytes_transferred {
                drop(session);
                self.ctx.fail(format!("peer asked to resume at {} beyond local data", offset));
                return Flow::Stop;
            }
            session.bytes_transferred = offset;
            session.pause_position = offset;
            session.status = TransferStatus::Transferring;
            session.pause_origin = None;
        }

        if self.reposition(offset).await == Flow::Stop {
            return Flow::Stop;
        }
        info!("Transfer {} resumed by peer at {}", self.ctx.transfer_id, offset);
        self.ctx.events.emit(TransferEvent::Resumed { transfer_id: self.ctx.transfer_id.clone(), offset });
        Flow::Continue
    }

    fn peer_cancelled(&self) {
        {
            let mut session = lock_session(&self.ctx.session);
            if session.status.is_terminal() {
                return;
            }
            session.status = TransferStatus::Cancelled;
        }
        if let Err(e) = self.ctx.checkpoints.delete(&self.ctx.transfer_id) {
            warn!("Could not delete checkpoint for {}: {}", self.ctx.transfer_id, e);
        }
        info!("Transfer {} cancelled by peer", self.ctx.transfer_id);
        self.ctx.events.emit(TransferEvent::Cancelled { transfer_id: self.ctx.transfer_id.clone() });
    }

    /// Local cancellation: best-effort CANCEL, then drop the socket
    async fn cancelled(&mut self) {
        send_cancel(&mut self.writer, &self.ctx.transfer_id).await;

        let mut session = lock_session(&self.ctx.session);
        if !session.status.is_terminal() {
            session.status = TransferStatus::Cancelled;
        }
    }
}

/// Tell the peer we are giving up. An interrupted frame is finished first,
/// all within [`CANCEL_FRAME_TIMEOUT`].
async fn send_cancel(writer: &mut FrameWriter<OwnedWriteHalf>, transfer_id: &str) {
    if writer.is_dirty() {
        debug!("Transfer {}: finishing an interrupted frame before CANCEL", transfer_id);
    }
    match timeout(CANCEL_FRAME_TIMEOUT, writer.write_frame(&Frame::Cancel)).await {
        Ok(Ok(())) => debug!("Transfer {}: CANCEL sent", transfer_id),
        Ok(Err(e)) => debug!("Transfer {}: CANCEL not delivered: {}", transfer_id, e),
        Err(_) => warn!("Transfer {}: timed out sending CANCEL", transfer_id),
    }
}

/// Connect to the receiver, send HELLO and stream the file
pub(crate) async fn run_outgoing(mut ctx: WorkerContext, addr: String, local_user: String) {
    let (path, total_size, file_name, peer_key) = {
        let session = lock_session(&ctx.session);
        (
            session.file_path.clone(),
            session.total_size,
            session.file_name.clone(),
            session.peer_key.clone(),
        )
    };

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            ctx.fail(format!("cannot open {}: {}", path.display(), e));
            return;
        }
    };

    let handshake_timeout = ctx.config.handshake_timeout;
    let stream = tokio::select! {
        biased;
        _ = ctx.cancel.changed() => return,
        result = timeout(handshake_timeout, TcpStream::connect(addr.as_str())) => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                ctx.fail(format!("could not connect to {}: {}", addr, e));
                return;
            }
            Err(_) => {
                ctx.fail(format!("timed out connecting to {}", addr));
                return;
            }
        },
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }

    let (key, wrapped_key) = match peer_key {
        Some(peer) => {
            let key = primitives::generate_symmetric_key();
            match primitives::seal(peer.exchange_key(), &key[..]) {
                Ok(wrapped) => (Some(key), Some(BASE64.encode(wrapped))),
                Err(e) => {
                    ctx.fail(format!("could not wrap transfer key: {}", e));
                    return;
                }
            }
        }
        None => (None, None),
    };

    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half);
    let hello = Hello {
        transfer_id: ctx.transfer_id.clone(),
        sender_id: local_user,
        file_name,
        total_size,
        wrapped_key,
    };
    if let Err(e) = writer.write_frame(&Frame::Hello(hello)).await {
        ctx.fail(format!("handshake with {} failed: {}", addr, e));
        return;
    }

    let started = {
        let mut session = lock_session(&ctx.session);
        let started = !*ctx.cancel.borrow() && session.status.can_transition_to(TransferStatus::Transferring);
        if started {
            session.status = TransferStatus::Transferring;
        }
        started
    };
    if !started {
        send_cancel(&mut writer, &ctx.transfer_id).await;
        return;
    }
    info!("Transfer {} connected to {}, sending {} bytes", ctx.transfer_id, addr, total_size);
    ctx.events.emit(TransferEvent::Started { transfer_id: ctx.transfer_id.clone() });

    let (frames, pump) = spawn_frame_pump(FrameReader::new(read_half));
    let worker = Worker {
        ctx,
        writer,
        frames,
        file,
        key,
        incoming: false,
        pause_announced: false,
    };
    worker.run().await;
    pump.abort();
}

/// Receive into `file` after a HELLO has been matched to a registered session
pub(crate) async fn run_incoming(
    ctx: WorkerContext,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    file: File,
    key: Option<PayloadKey>,
) {
    let (frames, pump) = spawn_frame_pump(reader);
    let worker = Worker {
        ctx,
        writer,
        frames,
        file,
        key,
        incoming: true,
        pause_announced: false,
    };
    worker.run().await;
    pump.abort();
}

/// Recover the payload key from a HELLO's wrapped key
pub(crate) fn unwrap_payload_key(
    wrapped: &str,
    open: impl FnOnce(&[u8]) -> crate::error::Result<Vec<u8>>,
) -> crate::error::Result<PayloadKey> {
    let sealed = BASE64
        .decode(wrapped)
        .map_err(|e| crate::error::CoreError::Encryption(format!("bad wrapped key encoding: {}", e)))?;
    let raw = Zeroizing::new(open(&sealed)?);
    if raw.len() != AES_KEY_SIZE {
        return Err(crate::error::CoreError::Encryption("wrapped key has wrong size".to_string()));
    }
    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    key.copy_from_slice(&raw);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::net::TcpListener;

    use super::*;
    use crate::transfer::session::{Direction, TransferSession};

    /// A receiving worker fed by a raw socket the test writes frames into
    async fn receiving_worker(
        dest: &Path,
        total: u64,
    ) -> (SharedSession, FrameWriter<OwnedWriteHalf>, JoinHandle<()>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, _) = accepted.unwrap();
        let (read_half, write_half) = server.into_split();
        let (_client_read, client_write) = client.unwrap().into_split();

        let mut session = TransferSession::new(
            "t-rw".into(),
            dest.to_path_buf(),
            dest.to_string_lossy().into_owned(),
            "alice".into(),
            Direction::Incoming,
            total,
        );
        session.status = TransferStatus::Transferring;
        let session: SharedSession = Arc::new(std::sync::Mutex::new(session));
        let (cancel_tx, cancel) = watch::channel(false);
        let ctx = WorkerContext {
            transfer_id: "t-rw".into(),
            session: session.clone(),
            wake: Arc::new(Notify::new()),
            cancel,
            checkpoints: Arc::new(CheckpointStore::in_memory().unwrap()),
            events: EventSink::new(16),
            config: TransferConfig::default(),
        };
        let file = File::create(dest).await.unwrap();
        let task = tokio::spawn(run_incoming(
            ctx,
            FrameReader::new(read_half),
            FrameWriter::new(write_half),
            file,
            None,
        ));
        (session, FrameWriter::new(client_write), task, cancel_tx)
    }

    #[tokio::test]
    async fn test_receiver_rewinds_on_resume_while_transferring() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let (session, mut peer, task, _cancel) = receiving_worker(&dest, 300).await;

        // The sender resumed before its PAUSE was sent and backs up one chunk
        for frame in [
            Frame::Data(vec![1u8; 100]),
            Frame::Data(vec![2u8; 100]),
            Frame::Resume(100),
            Frame::Data(vec![3u8; 100]),
            Frame::Data(vec![4u8; 100]),
            Frame::End(300),
        ] {
            peer.write_frame(&frame).await.unwrap();
        }
        task.await.unwrap();

        let info = lock_session(&session).info();
        assert_eq!(info.status, TransferStatus::Completed, "{:?}", info.error);
        assert_eq!(info.bytes_transferred, 300);
        let mut expected = vec![1u8; 100];
        expected.extend_from_slice(&[3u8; 100]);
        expected.extend_from_slice(&[4u8; 100]);
        assert_eq!(std::fs::read(&dest).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_locally_paused_receiver_completes_on_end() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let (session, mut peer, task, _cancel) = receiving_worker(&dest, 200).await;

        peer.write_frame(&Frame::Data(vec![1u8; 100])).await.unwrap();
        peer.write_frame(&Frame::Data(vec![2u8; 100])).await.unwrap();
        loop {
            {
                let mut s = lock_session(&session);
                if s.bytes_transferred == 200 {
                    // Local pause that lost the race with the last chunk
                    s.status = TransferStatus::Paused;
                    s.pause_origin = Some(PauseOrigin::Local);
                    s.pause_position = 200;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        peer.write_frame(&Frame::End(200)).await.unwrap();
        task.await.unwrap();

        let info = lock_session(&session).info();
        assert_eq!(info.status, TransferStatus::Completed, "{:?}", info.error);
        assert_eq!(info.paused_by, None);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 200);
    }

    #[test]
    fn test_data_nonce_layout() {
        let nonce = data_nonce(0x0102);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &0x0102u64.to_be_bytes());
    }

    #[test]
    fn test_unwrap_payload_key() {
        let key = unwrap_payload_key(&BASE64.encode([1u8; 4]), |_| Ok(vec![7u8; AES_KEY_SIZE])).unwrap();
        assert_eq!(*key, [7u8; AES_KEY_SIZE]);

        assert!(unwrap_payload_key("***", |_| Ok(vec![0u8; AES_KEY_SIZE])).is_err());
        assert!(unwrap_payload_key(&BASE64.encode([1u8; 4]), |_| Ok(vec![0u8; 3])).is_err());
    }
}
