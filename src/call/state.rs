use crate::call::CallStatus;
use crate::media::{LocalStream, RemoteStream};
use crate::peer::NegotiationEngine;
use crate::session::{CallType, SessionId, SessionStatus, UserId};
use crate::store::SubscriptionId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

/// Everything one call owns. Replaced wholesale when a new call begins; `generation`
/// tells late events which call they belonged to.
pub struct LocalCallState {
    pub generation: u64,
    pub role: Option<Role>,
    pub session_id: Option<SessionId>,
    pub peer_id: Option<UserId>,
    pub call_type: Option<CallType>,
    pub status: CallStatus,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: RemoteStream,
    pub engine: Option<Arc<NegotiationEngine>>,
    pub subscriptions: Vec<SubscriptionId>,
    pub muted: bool,
    pub video_enabled: bool,
    pub speaker_on: bool,
    /// Last `status` value read back from the record, own echoes included.
    pub last_remote_status: Option<SessionStatus>,
    pub disposed: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl LocalCallState {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            role: None,
            session_id: None,
            peer_id: None,
            call_type: None,
            status: CallStatus::Idle,
            local_stream: None,
            remote_stream: RemoteStream::default(),
            engine: None,
            subscriptions: Vec::new(),
            muted: false,
            video_enabled: true,
            speaker_on: false,
            last_remote_status: None,
            disposed: false,
            connected_at: None,
            last_error: None,
        }
    }

    pub fn view(&self) -> CallView {
        CallView {
            status: self.status,
            is_connected: self.status == CallStatus::Connected,
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            is_muted: self.muted,
            is_video_enabled: self.video_enabled,
            is_speaker_on: self.speaker_on,
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
            call_type: self.call_type,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only projection of the current call.
#[derive(Debug, Clone)]
pub struct CallView {
    pub status: CallStatus,
    pub is_connected: bool,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: RemoteStream,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_speaker_on: bool,
    pub session_id: Option<SessionId>,
    pub peer_id: Option<UserId>,
    pub call_type: Option<CallType>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for CallView {
    fn default() -> Self {
        LocalCallState::new(0).view()
    }
}
