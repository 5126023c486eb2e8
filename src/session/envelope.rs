// src/session/envelope.rs
//! JSON envelopes exchanged with the messaging backend
//!
//! Chat messages carry an integer `type`. Control envelopes (presence and
//! friend handshake) carry a string `type` and their own fields.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::{FriendRequest, FriendRequestStatus, Message, MessageType, UserStatus};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: String,
    sender_id: String,
    receiver_id: String,
    #[serde(rename = "type")]
    kind: u8,
    content: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ControlEnvelope {
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        user_id: String,
        is_online: bool,
        status_message: String,
        last_seen: i64,
    },
    #[serde(rename_all = "camelCase")]
    FriendRequest {
        request_id: String,
        sender_id: String,
        receiver_id: String,
        status: FriendRequestStatus,
        message: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    FriendRequestResponse {
        request_id: String,
        sender_id: String,
        receiver_id: String,
        status: FriendRequestStatus,
    },
}

impl ControlEnvelope {
    pub fn status_update(status: &UserStatus) -> Self {
        ControlEnvelope::StatusUpdate {
            user_id: status.user_id.clone(),
            is_online: status.is_online,
            status_message: status.status_message.clone(),
            last_seen: status.last_seen,
        }
    }

    pub fn friend_request(request: &FriendRequest) -> Self {
        ControlEnvelope::FriendRequest {
            request_id: request.request_id.clone(),
            sender_id: request.sender_id.clone(),
            receiver_id: request.receiver_id.clone(),
            status: request.status,
            message: request.message.clone(),
            timestamp: request.timestamp,
        }
    }

    pub fn friend_response(request: &FriendRequest) -> Self {
        ControlEnvelope::FriendRequestResponse {
            request_id: request.request_id.clone(),
            sender_id: request.sender_id.clone(),
            receiver_id: request.receiver_id.clone(),
            status: request.status,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Message(Message),
    Control(ControlEnvelope),
}

pub(crate) fn encode_message(message: &Message) -> Result<String> {
    let wire = WireMessage {
        id: message.id().to_string(),
        sender_id: message.sender_id().to_string(),
        receiver_id: message.receiver_id().to_string(),
        kind: message.kind() as u8,
        content: message.content().to_string(),
        timestamp: message.timestamp(),
        data: message.data().map(|d| BASE64.encode(d)),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Decode one text frame; the error string says why it was rejected
pub(crate) fn decode(text: &str) -> std::result::Result<Inbound, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("not JSON: {}", e))?;

    match value.get("type") {
        Some(Value::String(_)) => serde_json::from_value::<ControlEnvelope>(value)
            .map(Inbound::Control)
            .map_err(|e| format!("bad control envelope: {}", e)),
        Some(Value::Number(_)) => {
            let wire: WireMessage =
                serde_json::from_value(value).map_err(|e| format!("bad message envelope: {}", e))?;
            let kind = MessageType::try_from(wire.kind).map_err(|e| e.to_string())?;
            let data = match wire.data {
                Some(encoded) => Some(
                    BASE64
                        .decode(encoded)
                        .map_err(|e| format!("bad base64 data: {}", e))?,
                ),
                None => None,
            };
            Ok(Inbound::Message(Message::from_parts(
                wire.id,
                wire.sender_id,
                wire.receiver_id,
                kind,
                wire.content,
                data,
                wire.timestamp,
            )))
        }
        Some(_) => Err("'type' is neither a string nor a number".to_string()),
        None => Err("missing 'type'".to_string()),
    }
}
