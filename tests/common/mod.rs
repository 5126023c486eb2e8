// Common test utilities for integration tests
//
// Each test binary pulls in only part of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, LevelFilter};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use parley::{
    CheckpointStore, CryptoService, MessagingSession, PermissionStore, TransferConfig, TransferInfo,
    TransferManager,
};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

const WAIT_LIMIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Clients = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;
/// (sender, control `type`) of every frame the backend routed
type Routed = Arc<Mutex<Vec<(String, String)>>>;

/// In-process stand-in for the messaging backend.
///
/// Clients connect to `/ws/<user>` with a bearer token starting with "tok".
/// Frames with a `receiverId` go to that user, friend request responses go
/// back to the original sender, everything else is broadcast to the others.
pub struct MockBackend {
    addr: SocketAddr,
    clients: Clients,
    routed: Routed,
    hang_up: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let clients: Clients = Arc::default();
        let routed: Routed = Arc::default();
        let hang_up = Arc::new(AtomicBool::new(false));

        let accept_clients = clients.clone();
        let accept_routed = routed.clone();
        let accept_hang_up = hang_up.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let hang_up = accept_hang_up.swap(false, Ordering::SeqCst);
                tokio::spawn(serve_client(stream, accept_clients.clone(), accept_routed.clone(), hang_up));
            }
        });

        MockBackend { addr, clients, routed, hang_up, task }
    }

    /// How many control frames of `kind` (e.g. "friend_request_response") `user_id` sent
    pub fn control_frames_from(&self, user_id: &str, kind: &str) -> usize {
        self.routed
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, routed_kind)| from == user_id && routed_kind == kind)
            .count()
    }

    /// Close the next connection right after its handshake
    pub fn hang_up_next(&self) {
        self.hang_up.store(true, Ordering::SeqCst);
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.clients.lock().unwrap().contains_key(user_id)
    }

    /// Push a raw text frame to one client
    pub fn inject(&self, user_id: &str, text: &str) {
        let clients = self.clients.lock().unwrap();
        let tx = clients.get(user_id).expect("client not connected");
        tx.send(text.to_string()).unwrap();
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_client(stream: TcpStream, clients: Clients, routed: Routed, hang_up: bool) {
    let mut user_id = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let authorized = request
            .headers()
            .get("Authorization")
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| value.starts_with("Bearer tok"));
        if !authorized {
            let mut denied = ErrorResponse::new(Some("unauthorized".to_string()));
            *denied.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(denied);
        }
        user_id = request.uri().path().rsplit('/').next().unwrap_or_default().to_string();
        Ok(response)
    };

    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Mock backend refused a client: {}", e);
            return;
        }
    };
    if hang_up {
        let _ = ws.close(None).await;
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    clients.lock().unwrap().insert(user_id.clone(), tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(WsMessage::text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => route(&clients, &routed, &user_id, text.as_str()),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    {
        let mut clients = clients.lock().unwrap();
        if clients.get(&user_id).map_or(false, |current| current.same_channel(&tx)) {
            clients.remove(&user_id);
        }
    }
    writer.abort();
}

fn str_field<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value.get(name).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn route(clients: &Clients, routed: &Routed, from: &str, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return,
    };
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        routed.lock().unwrap().push((from.to_string(), kind.to_string()));
    }
    let target = match value.get("type").and_then(Value::as_str) {
        Some("friend_request_response") => str_field(&value, "senderId"),
        Some("status_update") => None,
        _ => str_field(&value, "receiverId"),
    };

    let clients = clients.lock().unwrap();
    match target {
        Some(user) => {
            if let Some(tx) = clients.get(user) {
                let _ = tx.send(text.to_string());
            }
        }
        None => {
            for (user, tx) in clients.iter() {
                if user != from {
                    let _ = tx.send(text.to_string());
                }
            }
        }
    }
}

/// One user's transfer engine with in-memory tables
pub struct TransferPeer {
    pub user: String,
    pub crypto: Arc<CryptoService>,
    pub checkpoints: Arc<CheckpointStore>,
    pub permissions: Arc<PermissionStore>,
    pub transfers: Arc<TransferManager>,
}

pub fn transfer_peer(user: &str, config: TransferConfig) -> TransferPeer {
    let crypto = Arc::new(CryptoService::new());
    crypto.generate_key_pair().unwrap();
    let checkpoints = Arc::new(CheckpointStore::in_memory().unwrap());
    let permissions = Arc::new(PermissionStore::in_memory().unwrap());
    let transfers = Arc::new(TransferManager::new(
        user,
        crypto.clone(),
        checkpoints.clone(),
        permissions.clone(),
        config,
    ));
    TransferPeer { user: user.to_string(), crypto, checkpoints, permissions, transfers }
}

/// A messaging session on top of a [`TransferPeer`], initialized but not connected
pub struct ChatPeer {
    pub peer: TransferPeer,
    pub session: Arc<MessagingSession>,
}

pub fn chat_peer(backend: &MockBackend, user: &str) -> ChatPeer {
    let peer = transfer_peer(user, TransferConfig::default());
    let session = Arc::new(MessagingSession::new(peer.crypto.clone(), peer.transfers.clone()));
    session.initialize(&backend.endpoint()).unwrap();
    ChatPeer { peer, session }
}

pub async fn connected_peer(backend: &MockBackend, user: &str) -> ChatPeer {
    let chat = chat_peer(backend, user);
    chat.session.connect(user, &format!("tok-{}", user)).await.unwrap();
    wait_until(&format!("{} registered with the backend", user), || backend.is_connected(user)).await;
    chat
}

/// Poll `check` until it holds; panics after a generous limit
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll a transfer until `check` accepts its snapshot
pub async fn wait_for_transfer<F>(manager: &TransferManager, transfer_id: &str, what: &str, check: F) -> TransferInfo
where
    F: Fn(&TransferInfo) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(info) = manager.get_transfer(transfer_id).await {
            if check(&info) {
                return info;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {}: {:?}",
                what,
                manager.get_transfer(transfer_id).await
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Next item from `rx` that `pick` accepts, skipping the rest
pub async fn expect_event<T, F>(rx: &mut mpsc::Receiver<T>, what: &str, mut pick: F) -> T
where
    F: FnMut(&T) -> bool,
{
    let found = tokio::time::timeout(WAIT_LIMIT, async {
        while let Some(item) = rx.recv().await {
            if pick(&item) {
                return Some(item);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(item)) => item,
        Ok(None) => panic!("event stream ended while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// File of `len` bytes with a non-repeating-per-chunk pattern
pub fn write_test_file(path: &Path, len: usize) {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(path, data).unwrap();
}
