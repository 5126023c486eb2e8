// src/session/mod.rs
//! Messaging session with the backend
//!
//! One WebSocket per session, owned by the reactor task. Callers talk to it
//! through a command channel; inbound envelopes update the shared state and
//! are fanned out to subscribers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::crypto::CryptoService;
use crate::error::{CoreError, Result};
use crate::models::{ConnectionStatus, FriendRequest, Message, MessageType, UserStatus};
use crate::transfer::TransferManager;

mod envelope;
mod friends;
mod presence;
mod reactor;

use envelope::{ControlEnvelope, Inbound};
use reactor::Command;

pub use crate::transfer::TransferOffer;

/// Default capacity of each subscriber channel
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

/// Something observers of a session may care about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessageReceived(Message),
    StatusChanged(UserStatus),
    FriendRequest(FriendRequest),
    FriendRequestAnswered(FriendRequest),
    ConnectionChanged(ConnectionStatus),
    /// An inbound frame could not be decoded
    Malformed { reason: String },
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the session handle and its reactor
pub(crate) struct SessionState {
    user_id: RwLock<String>,
    status: RwLock<ConnectionStatus>,
    presence: RwLock<HashMap<String, UserStatus>>,
    friends: RwLock<Vec<String>>,
    pending_requests: RwLock<HashMap<String, FriendRequest>>,
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    subscriber_buffer: usize,
    malformed: AtomicU64,
}

impl SessionState {
    fn new(subscriber_buffer: usize) -> Self {
        Self {
            user_id: RwLock::new(String::new()),
            status: RwLock::new(ConnectionStatus::Disconnected),
            presence: RwLock::new(HashMap::new()),
            friends: RwLock::new(Vec::new()),
            pending_requests: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            subscriber_buffer: subscriber_buffer.max(1),
            malformed: AtomicU64::new(0),
        }
    }

    pub(crate) fn user_id(&self) -> String {
        read(&self.user_id).clone()
    }

    pub(crate) fn connection_status(&self) -> ConnectionStatus {
        *read(&self.status)
    }

    pub(crate) fn set_connection_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *write(&self.status), status);
        if previous != status {
            debug!("Connection status {:?} -> {:?}", previous, status);
            self.emit(SessionEvent::ConnectionChanged(status));
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Non-blocking fan-out; closed subscribers are dropped
    pub(crate) fn emit(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Subscriber is not keeping up, dropped {:?}", event);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Dispatch one inbound text frame
    pub(crate) fn handle_inbound(&self, text: &str) {
        trace!("<- {}", text);
        match envelope::decode(text) {
            Ok(Inbound::Message(message)) => {
                debug!("Message {} from {}", message.id(), message.sender_id());
                self.emit(SessionEvent::MessageReceived(message));
            }
            Ok(Inbound::Control(ControlEnvelope::StatusUpdate {
                user_id,
                is_online,
                status_message,
                last_seen,
            })) => self.apply_status(UserStatus { user_id, is_online, status_message, last_seen }),
            Ok(Inbound::Control(ControlEnvelope::FriendRequest {
                request_id,
                sender_id,
                receiver_id,
                status,
                message,
                timestamp,
            })) => self.receive_friend_request(FriendRequest {
                request_id,
                sender_id,
                receiver_id,
                status,
                message,
                timestamp,
            }),
            Ok(Inbound::Control(ControlEnvelope::FriendRequestResponse { request_id, status, .. })) => {
                self.receive_friend_response(&request_id, status)
            }
            Err(reason) => self.report_malformed(reason),
        }
    }

    pub(crate) fn report_malformed(&self, reason: String) {
        let count = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Dropped malformed envelope ({} so far): {}", count, reason);
        self.emit(SessionEvent::Malformed { reason });
    }
}

/// Client side of the messaging backend
pub struct MessagingSession {
    crypto: Arc<CryptoService>,
    transfers: Arc<TransferManager>,
    state: Arc<SessionState>,
    endpoint: RwLock<Option<String>>,
    commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    reactor: TokioMutex<Option<JoinHandle<()>>>,
}

impl MessagingSession {
    pub fn new(crypto: Arc<CryptoService>, transfers: Arc<TransferManager>) -> Self {
        Self::with_subscriber_buffer(crypto, transfers, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_subscriber_buffer(
        crypto: Arc<CryptoService>,
        transfers: Arc<TransferManager>,
        subscriber_buffer: usize,
    ) -> Self {
        Self {
            crypto,
            transfers,
            state: Arc::new(SessionState::new(subscriber_buffer)),
            endpoint: RwLock::new(None),
            commands: RwLock::new(None),
            reactor: TokioMutex::new(None),
        }
    }

    /// Record the backend URL (`ws://` or `wss://`); does not connect
    pub fn initialize(&self, endpoint: &str) -> Result<()> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(CoreError::InvalidOperation(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                endpoint
            )));
        }
        *write(&self.endpoint) = Some(endpoint.trim_end_matches('/').to_string());
        info!("Messaging endpoint set to {}", endpoint);
        Ok(())
    }

    pub fn crypto(&self) -> &Arc<CryptoService> {
        &self.crypto
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.connection_status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Id of the connected user, empty before the first connect
    pub fn user_id(&self) -> String {
        self.state.user_id()
    }

    /// Observe session events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    /// Number of inbound frames that could not be decoded
    pub fn malformed_count(&self) -> u64 {
        self.state.malformed.load(Ordering::Relaxed)
    }

    /// Open the channel as `user_id`, authenticating with `auth_token`
    pub async fn connect(&self, user_id: &str, auth_token: &str) -> Result<()> {
        let endpoint = read(&self.endpoint)
            .clone()
            .ok_or_else(|| CoreError::InvalidOperation("session not initialized".to_string()))?;
        if user_id.is_empty() {
            return Err(CoreError::InvalidOperation("user id must not be empty".to_string()));
        }

        {
            let mut status = write(&self.state.status);
            if matches!(*status, ConnectionStatus::Connected | ConnectionStatus::Connecting) {
                return Err(CoreError::InvalidOperation(format!("already {:?}", *status).to_lowercase()));
            }
            *status = ConnectionStatus::Connecting;
        }
        self.state.emit(SessionEvent::ConnectionChanged(ConnectionStatus::Connecting));

        // A reactor left over from a failed connection has already stopped
        if let Some(old) = self.reactor.lock().await.take() {
            old.abort();
        }

        let url = format!("{}/{}", endpoint, user_id);
        info!("Connecting to {}", url);
        let ws = match Self::open_channel(&url, user_id, auth_token).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Connection to {} failed: {}", url, e);
                self.state.set_connection_status(ConnectionStatus::Error);
                return Err(e);
            }
        };

        *write(&self.state.user_id) = user_id.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        *write(&self.commands) = Some(tx);
        // Before the reactor starts: it sets the final status on exit
        self.state.set_connection_status(ConnectionStatus::Connected);
        *self.reactor.lock().await = Some(tokio::spawn(reactor::run(ws, rx, self.state.clone())));
        info!("Connected as {}", user_id);

        let status_message = self.own_status_message();
        if let Err(e) = self.update_status(true, &status_message) {
            warn!("Could not publish presence: {}", e);
        }
        Ok(())
    }

    async fn open_channel(url: &str, user_id: &str, auth_token: &str) -> Result<reactor::Channel> {
        let mut request = url.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", auth_token))
            .map_err(|e| CoreError::InvalidOperation(format!("invalid auth token: {}", e)))?;
        let user = HeaderValue::from_str(user_id)
            .map_err(|e| CoreError::InvalidOperation(format!("invalid user id: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);
        request.headers_mut().insert("X-User-Id", user);

        let (ws, response) = connect_async(request).await?;
        debug!("Handshake complete ({})", response.status());
        Ok(ws)
    }

    /// Close the channel; waits until the reactor has drained
    pub async fn disconnect(&self) -> Result<()> {
        let commands = write(&self.commands).take();
        if let Some(tx) = commands {
            if self.is_connected() {
                let status_message = self.own_status_message();
                match self.status_envelope(false, &status_message) {
                    Ok(text) => {
                        let _ = tx.send(Command::Send { text, ack: None });
                    }
                    Err(e) => debug!("Skipping offline presence: {}", e),
                }
            }
            let _ = tx.send(Command::Close);
        }

        let reactor = self.reactor.lock().await.take();
        if let Some(handle) = reactor {
            if let Err(e) = handle.await {
                warn!("Reactor ended abnormally: {}", e);
            }
        }

        self.state.set_connection_status(ConnectionStatus::Disconnected);
        info!("Disconnected");
        Ok(())
    }

    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>> {
        if !self.is_connected() {
            return Err(CoreError::Network("not connected".to_string()));
        }
        read(&self.commands)
            .clone()
            .ok_or_else(|| CoreError::Network("not connected".to_string()))
    }

    /// Queue a frame and wait until the reactor has written it
    async fn send_text(&self, text: String) -> Result<()> {
        let tx = self.command_sender()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Command::Send { text, ack: Some(ack_tx) })
            .map_err(|_| CoreError::Network("connection closed".to_string()))?;
        ack_rx
            .await
            .map_err(|_| CoreError::Network("connection closed before the frame was written".to_string()))?
    }

    /// Queue a frame without waiting for it
    fn enqueue_text(&self, text: String) -> Result<()> {
        self.command_sender()?
            .send(Command::Send { text, ack: None })
            .map_err(|_| CoreError::Network("connection closed".to_string()))
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(CoreError::Network("not connected".to_string()));
        }
        let message = message.with_sender(&self.state.user_id());
        let text = envelope::encode_message(&message)?;
        self.send_text(text).await?;
        debug!("Sent message {} to {}", message.id(), message.receiver_id());
        Ok(())
    }

    /// Encrypt the content for `recipient_public_key` (PEM) and send it
    pub async fn send_encrypted_message(&self, message: Message, recipient_public_key: &str) -> Result<()> {
        let ciphertext = self
            .crypto
            .encrypt_message(message.content().as_bytes(), recipient_public_key)?;
        let encrypted = Message::from_parts(
            message.id().to_string(),
            message.sender_id().to_string(),
            message.receiver_id().to_string(),
            MessageType::Encrypted,
            String::new(),
            Some(ciphertext),
            message.timestamp(),
        );
        self.send_message(encrypted).await
    }

    /// Plaintext of a received Encrypted message
    pub fn decrypt_message(&self, message: &Message) -> Result<String> {
        if message.kind() != MessageType::Encrypted {
            return Err(CoreError::InvalidOperation(format!("message {} is not encrypted", message.id())));
        }
        let data = message
            .data()
            .ok_or_else(|| CoreError::Encryption(format!("message {} has no payload", message.id())))?;
        let plaintext = self.crypto.decrypt_message(data)?;
        String::from_utf8(plaintext)
            .map_err(|_| CoreError::Encryption("decrypted payload is not UTF-8".to_string()))
    }

    /// Create a transfer and announce it to the receiver; nothing is left
    /// behind if the announcement fails
    pub async fn initiate_file_transfer(&self, receiver_id: &str, file_path: &Path) -> Result<String> {
        if !self.is_connected() {
            return Err(CoreError::Network("not connected".to_string()));
        }

        let transfer_id = self.transfers.initiate_transfer(file_path, receiver_id).await?;
        let announced = async {
            let offer = self.transfers.offer_for(&transfer_id).await?;
            let message = Message::new(
                MessageType::FileTransfer,
                &self.state.user_id(),
                receiver_id,
                &offer.to_content()?,
            );
            self.send_message(message).await
        }
        .await;

        if let Err(e) = announced {
            warn!("Could not announce transfer {}: {}", transfer_id, e);
            if let Err(cancel_err) = self.transfers.cancel_transfer(&transfer_id).await {
                debug!("Rollback of {} failed: {}", transfer_id, cancel_err);
            }
            return Err(e);
        }

        info!("Offered transfer {} to {}", transfer_id, receiver_id);
        Ok(transfer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{FriendRequestStatus, PermissionRecord};
    use crate::storage::{CheckpointStore, PermissionStore};
    use crate::transfer::{TransferConfig, TransferEvent};

    fn session() -> MessagingSession {
        let crypto = Arc::new(CryptoService::new());
        let transfers = Arc::new(TransferManager::new(
            "alice",
            crypto.clone(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            Arc::new(PermissionStore::in_memory().unwrap()),
            TransferConfig::default(),
        ));
        MessagingSession::new(crypto, transfers)
    }

    #[tokio::test]
    async fn test_connect_requires_initialize() {
        let s = session();
        let err = s.connect("alice", "token").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(s.status(), ConnectionStatus::Disconnected);

        assert!(s.initialize("http://example.com").is_err());
        s.initialize("ws://127.0.0.1:1/ws/").unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let s = session();
        let err = s.send_message(Message::text("bob", "hi")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(s.add_friend("bob", "hello").await.is_err());
        assert_eq!(
            s.initiate_file_transfer("bob", Path::new("/nonexistent")).await.unwrap_err().kind(),
            ErrorKind::NetworkError
        );
        // Disconnect from any state is fine
        s.disconnect().await.unwrap();
    }

    #[test]
    fn test_inbound_dispatch_and_malformed_count() {
        let state = SessionState::new(8);
        let mut events = state.subscribe();

        state.handle_inbound(r#"{"type":"status_update","userId":"bob","isOnline":true,"statusMessage":"","lastSeen":1}"#);
        state.handle_inbound("{broken");
        state.handle_inbound(r#"{"type":0,"id":"m1","senderId":"bob","receiverId":"alice","content":"hi","timestamp":2}"#);

        assert!(matches!(events.try_recv(), Ok(SessionEvent::StatusChanged(s)) if s.user_id == "bob"));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Malformed { .. })));
        match events.try_recv() {
            Ok(SessionEvent::MessageReceived(m)) => {
                assert_eq!(m.kind(), MessageType::Text);
                assert_eq!(m.content(), "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.malformed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let state = SessionState::new(1);
        let _slow = state.subscribe();
        for _ in 0..5 {
            state.emit(SessionEvent::ConnectionChanged(ConnectionStatus::Connecting));
        }
        assert_eq!(state.subscribers.lock().unwrap().len(), 1);
    }

    /// A session that believes it is connected but whose channel is gone
    fn session_with_dead_channel(user: &str) -> MessagingSession {
        let s = session();
        *write(&s.state.user_id) = user.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        *write(&s.commands) = Some(tx);
        s.state.set_connection_status(ConnectionStatus::Connected);
        s
    }

    #[tokio::test]
    async fn test_unannounced_transfer_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"quarterly numbers").unwrap();

        let s = session_with_dead_channel("alice");
        let mut transfer_events = s.transfers.subscribe();
        s.transfers.set_permissions(&path, "bob", &PermissionRecord::read_only()).unwrap();

        let err = s.initiate_file_transfer("bob", &path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(s.transfers.active_transfers().await.is_empty());

        match transfer_events.try_recv() {
            Ok(TransferEvent::Cancelled { transfer_id }) => {
                assert!(s.transfers.get_transfer(&transfer_id).await.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsent_friend_answer_stays_pending() {
        let s = session_with_dead_channel("bob");
        let request = FriendRequest {
            request_id: "r1".into(),
            sender_id: "alice".into(),
            receiver_id: "bob".into(),
            status: FriendRequestStatus::Pending,
            message: String::new(),
            timestamp: 1,
        };
        write(&s.state.pending_requests).insert("r1".into(), request);

        let err = s.accept_friend_request("r1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(s.friends().is_empty());
        let pending = s.pending_friend_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, FriendRequestStatus::Pending);
    }

    #[test]
    fn test_decrypt_message_checks_kind() {
        let s = session();
        let plain = Message::text("bob", "hi");
        assert_eq!(s.decrypt_message(&plain).unwrap_err().kind(), ErrorKind::InvalidOperation);
    }
}
