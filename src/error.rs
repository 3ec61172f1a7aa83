//! Error types for call signaling.

use crate::call::CallStatus;
use thiserror::Error;

/// Failures reported by a [`SignalingStore`](crate::store::SignalingStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient infrastructure failure; never retried inside this crate.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed value at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum CallError {
    /// Camera or microphone missing or refused.
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("invitation {0} is older than the freshness window")]
    StaleInvitation(String),

    #[error("no pending invitation")]
    NoInvitation,

    #[error("another call is in progress ({0})")]
    Busy(CallStatus),

    #[error("session {0} has no offer")]
    MissingOffer(String),

    #[error("invalid ICE server: {0}")]
    InvalidIceServer(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::NegotiationFailed(e.to_string())
    }
}
