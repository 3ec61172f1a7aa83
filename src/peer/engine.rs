//! Offer/answer and candidate exchange over one [`PeerLink`].

use crate::error::CallError;
use crate::media::LocalStream;
use crate::peer::ice::CandidateQueue;
use crate::peer::link::{PeerLink, PeerLinkFactory};
use crate::peer::types::{IceCandidate, LinkEvent, LinkState, NegotiationMessage};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// What happened to a remote description or candidate handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Held until the remote description is set.
    Deferred,
    /// Already applied earlier; nothing done.
    Duplicate,
}

/// Folded view of the link's two connection signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

struct Negotiation {
    remote_set: bool,
    candidates: CandidateQueue,
}

pub struct NegotiationEngine {
    link: Arc<dyn PeerLink>,
    // held across link calls so a candidate never races the remote description
    negotiation: Mutex<Negotiation>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl NegotiationEngine {
    /// Opens a link; the receiver yields everything the link reports.
    pub async fn open(
        factory: &dyn PeerLinkFactory,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = factory.open(tx).await?;
        Ok((Self::with_link(link), rx))
    }

    pub fn with_link(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            negotiation: Mutex::new(Negotiation {
                remote_set: false,
                candidates: CandidateQueue::default(),
            }),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), CallError> {
        info!(
            "engine: attaching stream {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
        self.link.add_local_stream(stream).await
    }

    pub async fn create_offer(&self) -> Result<NegotiationMessage, CallError> {
        self.link.create_local_offer().await
    }

    pub async fn create_answer(&self) -> Result<NegotiationMessage, CallError> {
        self.link.create_local_answer().await
    }

    /// Sets the remote description once, then replays buffered candidates in receipt order.
    pub async fn set_remote_description(
        &self,
        message: NegotiationMessage,
    ) -> Result<ApplyOutcome, CallError> {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_set || self.link.has_remote_description().await {
            debug!("engine: remote {:?} already set, ignoring", message.kind);
            return Ok(ApplyOutcome::Duplicate);
        }

        self.link.set_remote_description(message).await?;
        negotiation.remote_set = true;

        let pending = negotiation.candidates.drain();
        if !pending.is_empty() {
            info!("engine: replaying {} buffered candidates", pending.len());
        }
        for (id, candidate) in pending {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                warn!("engine: buffered candidate {} rejected: {}", id, e);
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Adds a remote candidate identified by its store key.
    pub async fn add_remote_candidate(
        &self,
        id: &str,
        candidate: IceCandidate,
    ) -> Result<ApplyOutcome, CallError> {
        let mut negotiation = self.negotiation.lock().await;
        if !negotiation.candidates.admit(id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if !negotiation.remote_set {
            debug!("engine: remote description not set yet, queuing candidate {}", id);
            negotiation.candidates.defer(id.to_string(), candidate);
            return Ok(ApplyOutcome::Deferred);
        }
        self.link.add_ice_candidate(candidate).await?;
        Ok(ApplyOutcome::Applied)
    }

    pub async fn pending_candidates(&self) -> usize {
        self.negotiation.lock().await.candidates.pending_len()
    }

    pub async fn has_remote_description(&self) -> bool {
        self.negotiation.lock().await.remote_set
    }

    /// Folds a state report into a connection signal. `Connected` is reported once, from
    /// whichever signal gets there first.
    pub fn observe(&self, event: &LinkEvent) -> Option<ConnectionSignal> {
        let state = match event {
            LinkEvent::PeerState(state) | LinkEvent::IceState(state) => *state,
            _ => return None,
        };
        match state {
            LinkState::New => None,
            LinkState::Connecting => {
                (!self.is_connected()).then_some(ConnectionSignal::Connecting)
            }
            LinkState::Connected => {
                if self.connected.swap(true, Ordering::SeqCst) {
                    None
                } else {
                    Some(ConnectionSignal::Connected)
                }
            }
            LinkState::Disconnected => Some(ConnectionSignal::Disconnected),
            LinkState::Failed => Some(ConnectionSignal::Failed),
            LinkState::Closed => Some(ConnectionSignal::Closed),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Idempotent.
    pub async fn close(&self) -> Result<(), CallError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.negotiation.lock().await.candidates.clear();
        self.link.close().await
    }
}
