// Core data types shared by the messaging session and the transfer engine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Current epoch time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Message kind, carried on the wire as its integer value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text = 0,
    File = 1,
    Status = 2,
    System = 3,
    Encrypted = 4,
    FileTransfer = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Text),
            1 => Ok(MessageType::File),
            2 => Ok(MessageType::Status),
            3 => Ok(MessageType::System),
            4 => Ok(MessageType::Encrypted),
            5 => Ok(MessageType::FileTransfer),
            other => Err(CoreError::InvalidOperation(format!("unknown message type {}", other))),
        }
    }
}

/// A message exchanged over the messaging channel.
///
/// Fields are private so a message cannot change after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    sender_id: String,
    receiver_id: String,
    kind: MessageType,
    content: String,
    data: Option<Vec<u8>>,
    timestamp: i64,
}

impl Message {
    /// Build an outgoing message with a fresh id and the current time
    pub fn new(kind: MessageType, sender_id: &str, receiver_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            kind,
            content: content.to_string(),
            data: None,
            timestamp: now_millis(),
        }
    }

    /// Plain text message
    pub fn text(receiver_id: &str, content: &str) -> Self {
        Self::new(MessageType::Text, "", receiver_id, content)
    }

    /// Rebuild a message from already-known parts (inbound envelopes)
    pub fn from_parts(
        id: String,
        sender_id: String,
        receiver_id: String,
        kind: MessageType,
        content: String,
        data: Option<Vec<u8>>,
        timestamp: i64,
    ) -> Self {
        Self { id, sender_id, receiver_id, kind, content, data, timestamp }
    }

    /// Copy of this message with a binary payload attached
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Copy of this message stamped with the given sender
    pub(crate) fn with_sender(mut self, sender_id: &str) -> Self {
        self.sender_id = sender_id.to_string();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Cached presence of a user
#[derive(Debug, Clone, PartialEq)]
pub struct UserStatus {
    pub user_id: String,
    pub is_online: bool,
    pub status_message: String,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
    Blocked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FriendRequest {
    pub request_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: FriendRequestStatus,
    pub message: String,
    pub timestamp: i64,
}

impl FriendRequest {
    /// The party on the other side of the request, seen from `local_user`
    pub fn counterpart(&self, local_user: &str) -> &str {
        if self.sender_id == local_user {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Lifecycle of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    Connecting,
    Transferring,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Connecting) => true,
            (Connecting, Transferring) => true,
            (Transferring, Paused) | (Transferring, Completed) => true,
            (Paused, Transferring) => true,
            (from, Cancelled) | (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Access grant for one user on one file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PermissionRecord {
    pub can_read: bool,
    pub can_write: bool,
    pub can_share: bool,
    /// Epoch milliseconds after which the grant is void; None never expires
    pub expiry_time: Option<i64>,
}

impl PermissionRecord {
    pub fn read_only() -> Self {
        Self { can_read: true, ..Default::default() }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expiry_time, Some(expiry) if now > expiry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionKind {
    Read,
    Write,
    Share,
}
