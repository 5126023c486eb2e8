// src/session/presence.rs
//! Presence cache and status publishing

use log::{debug, info};

use super::envelope::ControlEnvelope;
use super::{read, write, MessagingSession, SessionEvent, SessionState};
use crate::error::Result;
use crate::models::{now_millis, UserStatus};

impl SessionState {
    /// Fold an inbound status update into the cache
    pub(crate) fn apply_status(&self, status: UserStatus) {
        debug!(
            "{} is {} ({})",
            status.user_id,
            if status.is_online { "online" } else { "offline" },
            status.status_message
        );
        write(&self.presence).insert(status.user_id.clone(), status.clone());
        self.emit(SessionEvent::StatusChanged(status));
    }
}

impl MessagingSession {
    pub(crate) fn own_status_message(&self) -> String {
        let user_id = self.state.user_id();
        read(&self.state.presence)
            .get(&user_id)
            .map(|s| s.status_message.clone())
            .unwrap_or_default()
    }

    /// Update the local cache for ourselves and return the envelope to publish
    pub(crate) fn status_envelope(&self, is_online: bool, status_message: &str) -> Result<String> {
        let status = UserStatus {
            user_id: self.state.user_id(),
            is_online,
            status_message: status_message.to_string(),
            last_seen: now_millis(),
        };
        write(&self.state.presence).insert(status.user_id.clone(), status.clone());
        ControlEnvelope::status_update(&status).to_json()
    }

    /// Publish our presence. The cache is updated immediately; the envelope
    /// is queued without waiting for it to be written.
    pub fn update_status(&self, is_online: bool, status_message: &str) -> Result<()> {
        let text = self.status_envelope(is_online, status_message)?;
        self.enqueue_text(text)?;
        info!("Status set to {} '{}'", if is_online { "online" } else { "offline" }, status_message);
        Ok(())
    }

    /// Users currently believed to be online, excluding ourselves
    pub fn get_online_users(&self) -> Vec<String> {
        let user_id = self.state.user_id();
        let mut online: Vec<String> = read(&self.state.presence)
            .values()
            .filter(|s| s.is_online && s.user_id != user_id)
            .map(|s| s.user_id.clone())
            .collect();
        online.sort();
        online
    }

    pub fn get_user_status(&self, user_id: &str) -> Option<UserStatus> {
        read(&self.state.presence).get(user_id).cloned()
    }
}
