// src/session/friends.rs
//! Friend request handshake
//!
//! Pending requests (ours and theirs) live in memory only. A request is
//! answered exactly once and then forgotten.

use log::{debug, info, warn};

use super::envelope::ControlEnvelope;
use super::{read, write, MessagingSession, SessionEvent, SessionState};
use crate::error::{CoreError, Result};
use crate::models::{now_millis, FriendRequest, FriendRequestStatus};

impl SessionState {
    fn add_friend_once(&self, user_id: &str) {
        let mut friends = write(&self.friends);
        if !friends.iter().any(|f| f == user_id) {
            friends.push(user_id.to_string());
            info!("{} added to friends", user_id);
        }
    }

    pub(crate) fn receive_friend_request(&self, request: FriendRequest) {
        if request.sender_id == self.user_id() {
            debug!("Ignoring echo of our own friend request {}", request.request_id);
            return;
        }
        info!("Friend request {} from {}", request.request_id, request.sender_id);
        write(&self.pending_requests).insert(request.request_id.clone(), request.clone());
        self.emit(SessionEvent::FriendRequest(request));
    }

    pub(crate) fn receive_friend_response(&self, request_id: &str, status: FriendRequestStatus) {
        let request = write(&self.pending_requests).remove(request_id);
        let mut request = match request {
            Some(request) => request,
            None => {
                warn!("Response for unknown friend request {}", request_id);
                return;
            }
        };

        request.status = status;
        if status == FriendRequestStatus::Accepted {
            let local = self.user_id();
            self.add_friend_once(request.counterpart(&local));
        }
        info!("Friend request {} answered: {:?}", request_id, status);
        self.emit(SessionEvent::FriendRequestAnswered(request));
    }
}

impl MessagingSession {
    /// Ask `user_id` to become a friend; returns the request id
    pub async fn add_friend(&self, user_id: &str, message: &str) -> Result<String> {
        let request = FriendRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            sender_id: self.state.user_id(),
            receiver_id: user_id.to_string(),
            status: FriendRequestStatus::Pending,
            message: message.to_string(),
            timestamp: now_millis(),
        };

        self.send_text(ControlEnvelope::friend_request(&request).to_json()?).await?;
        write(&self.state.pending_requests).insert(request.request_id.clone(), request.clone());
        info!("Sent friend request {} to {}", request.request_id, user_id);
        Ok(request.request_id)
    }

    pub async fn accept_friend_request(&self, request_id: &str) -> Result<()> {
        self.answer_friend_request(request_id, FriendRequestStatus::Accepted).await
    }

    pub async fn reject_friend_request(&self, request_id: &str) -> Result<()> {
        self.answer_friend_request(request_id, FriendRequestStatus::Rejected).await
    }

    /// Claims the request before the answer goes out; it is put back if the
    /// send fails.
    async fn answer_friend_request(&self, request_id: &str, status: FriendRequestStatus) -> Result<()> {
        let local = self.state.user_id();
        let mut request = {
            let mut pending = write(&self.state.pending_requests);
            let addressed_to_us = pending
                .get(request_id)
                .map(|request| request.receiver_id == local)
                .ok_or_else(|| CoreError::not_found("friend request", request_id))?;
            if !addressed_to_us {
                return Err(CoreError::InvalidOperation(format!(
                    "friend request {} was sent by us and cannot be answered here",
                    request_id
                )));
            }
            pending
                .remove(request_id)
                .ok_or_else(|| CoreError::not_found("friend request", request_id))?
        };

        request.status = status;
        let sent = async { self.send_text(ControlEnvelope::friend_response(&request).to_json()?).await }.await;
        if let Err(e) = sent {
            request.status = FriendRequestStatus::Pending;
            write(&self.state.pending_requests).insert(request_id.to_string(), request);
            return Err(e);
        }

        if status == FriendRequestStatus::Accepted {
            self.state.add_friend_once(request.counterpart(&local));
        }
        info!("Friend request {} from {} {:?}", request_id, request.sender_id, status);
        Ok(())
    }

    pub fn friends(&self) -> Vec<String> {
        read(&self.state.friends).clone()
    }

    pub fn pending_friend_requests(&self) -> Vec<FriendRequest> {
        let mut pending: Vec<FriendRequest> = read(&self.state.pending_requests).values().cloned().collect();
        pending.sort_by_key(|r| r.timestamp);
        pending
    }
}
