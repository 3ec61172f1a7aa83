//! Scripted peer link for tests.

use crate::error::CallError;
use crate::media::LocalStream;
use crate::peer::link::{PeerLink, PeerLinkFactory};
use crate::peer::types::{IceCandidate, LinkEvent, LinkState, NegotiationMessage, SdpKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[derive(Default)]
struct Recorded {
    local: Option<NegotiationMessage>,
    remote: Vec<NegotiationMessage>,
    applied: Vec<IceCandidate>,
    streams: Vec<String>,
}

pub struct FakeLink {
    events: mpsc::UnboundedSender<LinkEvent>,
    recorded: Mutex<Recorded>,
    auto_connect: bool,
    connected: AtomicBool,
    closes: AtomicUsize,
}

impl FakeLink {
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.recorded.lock().unwrap().applied.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<NegotiationMessage> {
        self.recorded.lock().unwrap().remote.clone()
    }

    pub fn local_description(&self) -> Option<NegotiationMessage> {
        self.recorded.lock().unwrap().local.clone()
    }

    pub fn attached_streams(&self) -> Vec<String> {
        self.recorded.lock().unwrap().streams.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn gather(&self, base: u32) {
        for n in base..base + 2 {
            self.emit(LinkEvent::LocalCandidate(candidate(n)));
        }
    }

    fn maybe_connect(&self) {
        if !self.auto_connect {
            return;
        }
        let ready = {
            let rec = self.recorded.lock().unwrap();
            rec.local.is_some() && !rec.remote.is_empty() && !rec.applied.is_empty()
        };
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(LinkEvent::PeerState(LinkState::Connecting));
            self.emit(LinkEvent::IceState(LinkState::Connected));
            self.emit(LinkEvent::PeerState(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), CallError> {
        self.recorded.lock().unwrap().streams.push(stream.id().to_string());
        Ok(())
    }

    async fn create_local_offer(&self) -> Result<NegotiationMessage, CallError> {
        let offer = NegotiationMessage::offer("v=0 fake-offer");
        self.recorded.lock().unwrap().local = Some(offer.clone());
        self.gather(10);
        Ok(offer)
    }

    async fn create_local_answer(&self) -> Result<NegotiationMessage, CallError> {
        let answer = {
            let mut rec = self.recorded.lock().unwrap();
            match rec.remote.first() {
                Some(remote) if remote.kind == SdpKind::Offer => {}
                _ => {
                    return Err(CallError::NegotiationFailed(
                        "answer requested without a remote offer".into(),
                    ))
                }
            }
            let answer = NegotiationMessage::answer("v=0 fake-answer");
            rec.local = Some(answer.clone());
            answer
        };
        self.gather(20);
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(&self, message: NegotiationMessage) -> Result<(), CallError> {
        self.recorded.lock().unwrap().remote.push(message);
        self.maybe_connect();
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        !self.recorded.lock().unwrap().remote.is_empty()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        {
            let mut rec = self.recorded.lock().unwrap();
            if rec.remote.is_empty() {
                return Err(CallError::NegotiationFailed(
                    "candidate added before remote description".into(),
                ));
            }
            rec.applied.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.emit(LinkEvent::PeerState(LinkState::Closed));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeLinkFactory {
    links: Arc<Mutex<Vec<Arc<FakeLink>>>>,
    auto_connect: bool,
}

impl FakeLinkFactory {
    /// Links report `connected` once they have both descriptions and a remote candidate.
    pub fn connecting() -> Self {
        Self {
            links: Arc::default(),
            auto_connect: true,
        }
    }

    pub fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> Arc<FakeLink> {
        self.links.lock().unwrap().last().cloned().expect("no link opened")
    }

    pub fn opened(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let link = Arc::new(FakeLink {
            events,
            recorded: Mutex::default(),
            auto_connect: self.auto_connect,
            connected: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}
