pub mod connection;
pub mod engine;
pub mod ice;
pub mod link;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use connection::{RtcPeer, RtcPeerFactory};
pub use engine::{ApplyOutcome, ConnectionSignal, NegotiationEngine};
pub use link::{PeerLink, PeerLinkFactory};
pub use types::{
    IceCandidate, LinkEvent, LinkState, NegotiationMessage, RemoteTrack, SdpKind, ServerConfig,
    TrackKind,
};
