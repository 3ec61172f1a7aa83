use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer as written to the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NegotiationMessage {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(rename = "sdp")]
    pub body: String,
}

impl NegotiationMessage {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            body: body.into(),
        }
    }
}

/// ICE candidate for the WebRTC connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Connection state as reported by one of the link's two signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Everything a link reports back asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Locally gathered candidate, to be published to the peer.
    LocalCandidate(IceCandidate),
    /// Aggregate peer-connection state.
    PeerState(LinkState),
    /// Lower-level ICE reachability state.
    IceState(LinkState),
    RemoteTrack(RemoteTrack),
}
