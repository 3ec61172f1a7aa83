//! Persisted call session record and its layout in the store.

use crate::peer::types::{IceCandidate, NegotiationMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub type SessionId = String;
pub type UserId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// The shared `status` field both peers write.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Calling,
    Accepted,
    Connecting,
    Connected,
    Ended,
    Rejected,
}

impl SessionStatus {
    /// Statuses under which the callee still sees an invitation.
    pub fn is_inviting(self) -> bool {
        matches!(self, SessionStatus::Calling | SessionStatus::Accepted)
    }
}

/// `calls/{id}` as stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: SessionId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: SessionStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<NegotiationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<NegotiationMessage>,
    /// peer id -> auto id -> candidate
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub candidates: BTreeMap<UserId, BTreeMap<String, IceCandidate>>,
}

impl CallSession {
    pub fn new(
        id: SessionId,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            caller_id,
            callee_id,
            call_type,
            status: SessionStatus::Calling,
            created_at,
            offer: None,
            answer: None,
            candidates: BTreeMap::new(),
        }
    }

    pub fn is_fresh(&self, now_millis: i64, window: Duration) -> bool {
        is_fresh(self.created_at, now_millis, window)
    }
}

pub fn is_fresh(created_at: i64, now_millis: i64, window: Duration) -> bool {
    now_millis.saturating_sub(created_at) <= window.as_millis() as i64
}

/// Builds store paths for the session and user collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    calls: String,
    users: String,
}

impl Paths {
    pub fn new(calls: &str, users: &str) -> Self {
        Self {
            calls: calls.trim_matches('/').to_string(),
            users: users.trim_matches('/').to_string(),
        }
    }

    pub fn calls(&self) -> &str {
        &self.calls
    }

    pub fn session(&self, id: &str) -> String {
        format!("{}/{}", self.calls, id)
    }

    pub fn status(&self, id: &str) -> String {
        format!("{}/{}/status", self.calls, id)
    }

    pub fn offer(&self, id: &str) -> String {
        format!("{}/{}/offer", self.calls, id)
    }

    pub fn answer(&self, id: &str) -> String {
        format!("{}/{}/answer", self.calls, id)
    }

    pub fn candidates(&self, id: &str, peer_id: &str) -> String {
        format!("{}/{}/candidates/{}", self.calls, id, peer_id)
    }

    pub fn user(&self, user_id: &str) -> String {
        format!("{}/{}", self.users, user_id)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new("calls", "users")
    }
}
