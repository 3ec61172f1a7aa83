use crate::error::CallError;
use crate::media::LocalStream;
use crate::peer::types::{IceCandidate, LinkEvent, NegotiationMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One underlying peer connection.
///
/// Asynchronous reports (gathered candidates, state changes, remote tracks) go to the
/// event sender handed to [`PeerLinkFactory::open`].
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), CallError>;

    /// Creates an offer and sets it as the local description.
    async fn create_local_offer(&self) -> Result<NegotiationMessage, CallError>;

    /// Creates an answer and sets it as the local description.
    async fn create_local_answer(&self) -> Result<NegotiationMessage, CallError>;

    async fn set_remote_description(&self, message: NegotiationMessage) -> Result<(), CallError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, CallError>;
}
