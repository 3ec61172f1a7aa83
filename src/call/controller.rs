//! The call state machine.
//!
//! Every store subscription and the link's event channel feed a pump task. Pumps hand
//! their event to the controller, which applies it under one lock over
//! [`LocalCallState`]. An event whose generation no longer matches, or that arrives after
//! disposal, is dropped, so nothing needs to cancel a pump: unwatching closes its channel.

use crate::call::disposer::Disposer;
use crate::call::state::{CallView, LocalCallState, Role};
use crate::call::CallStatus;
use crate::error::CallError;
use crate::media::MediaDevices;
use crate::peer::{
    ApplyOutcome, ConnectionSignal, IceCandidate, LinkEvent, NegotiationEngine,
    NegotiationMessage, PeerLinkFactory, SdpKind, TrackKind,
};
use crate::scanner::{IncomingCallScanner, Invitation};
use crate::session::{CallSession, CallType, SessionId, SessionStatus, UserId};
use crate::signaling::{decode, SignalingChannel};
use crate::store::Watch;
use crate::utils::{now_millis, random_id};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Status,
    Answer,
    Candidates,
}

pub struct CallController {
    user_id: UserId,
    channel: SignalingChannel,
    links: Arc<dyn PeerLinkFactory>,
    devices: Arc<dyn MediaDevices>,
    freshness: Duration,
    disposer: Disposer,
    scanner: Option<Arc<IncomingCallScanner>>,
    generations: AtomicU64,
    state: Mutex<LocalCallState>,
    view: watch::Sender<CallView>,
}

impl CallController {
    pub fn new(
        user_id: impl Into<UserId>,
        channel: SignalingChannel,
        links: Arc<dyn PeerLinkFactory>,
        devices: Arc<dyn MediaDevices>,
        scanner: Option<Arc<IncomingCallScanner>>,
        freshness: Duration,
    ) -> Arc<Self> {
        let (view, _) = watch::channel(CallView::default());
        Arc::new(Self {
            user_id: user_id.into(),
            disposer: Disposer::new(channel.clone(), scanner.clone()),
            scanner,
            channel,
            links,
            devices,
            freshness,
            generations: AtomicU64::new(0),
            state: Mutex::new(LocalCallState::new(0)),
            view,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn view(&self) -> watch::Receiver<CallView> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> CallView {
        self.view.borrow().clone()
    }

    /// Number of calls torn down so far.
    pub fn teardowns(&self) -> usize {
        self.disposer.teardowns()
    }

    /// Places a call to `contact_id` and returns the new session id.
    pub async fn start_call(
        self: &Arc<Self>,
        contact_id: &str,
        call_type: CallType,
    ) -> Result<SessionId, CallError> {
        let mut st = self.state.lock().await;
        if is_busy(st.status) {
            return Err(CallError::Busy(st.status));
        }
        *st = LocalCallState::new(self.next_generation());

        let stream = match self.devices.acquire(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("call: cannot start, {}", e);
                st.last_error = Some(e.to_string());
                self.publish(&st);
                return Err(e);
            }
        };

        let session_id = random_id();
        st.role = Some(Role::Caller);
        st.session_id = Some(session_id.clone());
        st.peer_id = Some(contact_id.to_string());
        st.call_type = Some(call_type);
        st.local_stream = Some(stream);
        self.transition(&mut st, CallStatus::Calling);

        if let Err(e) = self.setup_caller(&mut st).await {
            self.end_locally(&mut st, CallStatus::Ended, Some(&e)).await;
            return Err(e);
        }
        Ok(session_id)
    }

    async fn setup_caller(self: &Arc<Self>, st: &mut LocalCallState) -> Result<(), CallError> {
        let (id, peer, call_type) = current_call(st)?;
        let engine = self.open_engine(st).await?;

        let session = CallSession::new(
            id.clone(),
            self.user_id.clone(),
            peer.clone(),
            call_type,
            now_millis(),
        );
        self.channel.create_session(&session).await?;

        let offer = engine.create_offer().await?;
        self.channel.write_offer(&id, &offer).await?;
        info!("call {}: offer sent to {}", id, peer);

        let answer = self.channel.watch_answer(&id).await?;
        self.pump(st, Feed::Answer, answer);
        let status = self.channel.watch_status(&id).await?;
        self.pump(st, Feed::Status, status);
        let candidates = self.channel.watch_candidates(&id, &peer).await?;
        self.pump(st, Feed::Candidates, candidates);
        Ok(())
    }

    /// Shows `invitation` as ringing, or reports a withdrawn invitation as missed.
    pub async fn on_invitation(&self, invitation: Option<Invitation>) {
        let mut st = self.state.lock().await;
        match invitation {
            Some(inv) => {
                if st.session_id.as_deref() == Some(inv.session_id.as_str()) {
                    return;
                }
                let idle = st.status == CallStatus::Idle || st.status.is_terminal();
                if !idle && st.status != CallStatus::Ringing {
                    debug!("call: busy ({}), not ringing for {}", st.status, inv.session_id);
                    return;
                }
                *st = self.callee_state(&inv);
                self.transition(&mut st, CallStatus::Ringing);
            }
            None => {
                if st.status == CallStatus::Ringing {
                    info!("call {:?}: missed", st.session_id);
                    self.finish(&mut st, CallStatus::Ended, None).await;
                }
            }
        }
    }

    /// Answers `invitation`. A failure after this point ends the call for both sides.
    pub async fn accept(self: &Arc<Self>, invitation: &Invitation) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        self.claim_invitation(&mut st, invitation)?;

        if !invitation.is_fresh(now_millis(), self.freshness) {
            let e = CallError::StaleInvitation(invitation.session_id.clone());
            self.finish(&mut st, CallStatus::Ended, Some(&e)).await;
            return Err(e);
        }

        if let Err(e) = self.setup_callee(&mut st).await {
            self.end_locally(&mut st, CallStatus::Ended, Some(&e)).await;
            return Err(e);
        }
        self.transition(&mut st, CallStatus::Connecting);
        Ok(())
    }

    async fn setup_callee(self: &Arc<Self>, st: &mut LocalCallState) -> Result<(), CallError> {
        let (id, peer, call_type) = current_call(st)?;
        st.local_stream = Some(self.devices.acquire(call_type).await?);
        let engine = self.open_engine(st).await?;

        let offer = self
            .channel
            .read_offer(&id)
            .await?
            .ok_or_else(|| CallError::MissingOffer(id.clone()))?;
        engine.set_remote_description(offer).await?;

        self.channel.write_status(&id, SessionStatus::Accepted).await?;
        let answer = engine.create_answer().await?;
        self.channel.write_answer(&id, &answer).await?;
        info!("call {}: answer sent to {}", id, peer);

        let status = self.channel.watch_status(&id).await?;
        self.pump(st, Feed::Status, status);
        let candidates = self.channel.watch_candidates(&id, &peer).await?;
        self.pump(st, Feed::Candidates, candidates);
        Ok(())
    }

    /// Declines `invitation`. The record is left for the caller to clean up.
    pub async fn reject(&self, invitation: &Invitation) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        self.claim_invitation(&mut st, invitation)?;
        self.decline(&mut st).await
    }

    async fn decline(&self, st: &mut LocalCallState) -> Result<(), CallError> {
        let written = match &st.session_id {
            Some(id) => self.channel.write_status(id, SessionStatus::Rejected).await,
            None => Ok(()),
        };
        if let Err(e) = &written {
            warn!("call {:?}: could not announce rejection: {}", st.session_id, e);
        }
        self.finish(st, CallStatus::Rejected, None).await;
        written.map_err(CallError::from)
    }

    /// Hangs up. Ringing counts as a decline; with no call this does nothing.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        match st.status {
            CallStatus::Idle | CallStatus::Ended | CallStatus::Rejected => Ok(()),
            CallStatus::Ringing => self.decline(&mut st).await,
            _ => {
                self.end_locally(&mut st, CallStatus::Ended, None).await;
                Ok(())
            }
        }
    }

    /// Ends whatever is in progress and releases it.
    pub async fn shutdown(&self) {
        if let Err(e) = self.end_call().await {
            warn!("call: shutdown could not announce the hang-up: {}", e);
        }
        let mut st = self.state.lock().await;
        if st.session_id.is_some() {
            self.disposer.dispose(&mut st).await;
            self.publish(&st);
        }
    }

    pub async fn toggle_mute(&self) -> bool {
        let mut st = self.state.lock().await;
        st.muted = !st.muted;
        if let Some(stream) = &st.local_stream {
            for track in stream.tracks_of(TrackKind::Audio) {
                track.set_enabled(!st.muted);
            }
        }
        self.publish(&st);
        st.muted
    }

    pub async fn toggle_video(&self) -> bool {
        let mut st = self.state.lock().await;
        st.video_enabled = !st.video_enabled;
        if let Some(stream) = &st.local_stream {
            for track in stream.tracks_of(TrackKind::Video) {
                track.set_enabled(st.video_enabled);
            }
        }
        self.publish(&st);
        st.video_enabled
    }

    pub async fn toggle_speaker(&self) -> bool {
        let mut st = self.state.lock().await;
        st.speaker_on = !st.speaker_on;
        self.publish(&st);
        st.speaker_on
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn callee_state(&self, invitation: &Invitation) -> LocalCallState {
        let mut st = LocalCallState::new(self.next_generation());
        st.role = Some(Role::Callee);
        st.session_id = Some(invitation.session_id.clone());
        st.peer_id = Some(invitation.caller_id.clone());
        st.call_type = Some(invitation.call_type);
        st
    }

    /// Makes `invitation` the current call, unless another call is live.
    fn claim_invitation(
        &self,
        st: &mut LocalCallState,
        invitation: &Invitation,
    ) -> Result<(), CallError> {
        let ringing_this = st.status == CallStatus::Ringing
            && st.session_id.as_deref() == Some(invitation.session_id.as_str());
        if ringing_this {
            return Ok(());
        }
        if is_busy(st.status) {
            return Err(CallError::Busy(st.status));
        }
        *st = self.callee_state(invitation);
        self.publish(st);
        Ok(())
    }

    async fn open_engine(
        self: &Arc<Self>,
        st: &mut LocalCallState,
    ) -> Result<Arc<NegotiationEngine>, CallError> {
        let (engine, events) = NegotiationEngine::open(self.links.as_ref()).await?;
        let engine = Arc::new(engine);
        st.engine = Some(engine.clone());
        self.pump_link(st.generation, events);
        if let Some(stream) = &st.local_stream {
            engine.attach_local_stream(stream).await?;
        }
        Ok(engine)
    }

    fn pump(self: &Arc<Self>, st: &mut LocalCallState, feed: Feed, watch: Watch) {
        let Watch { id, mut updates } = watch;
        st.subscriptions.push(id);
        let generation = st.generation;
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(value) = updates.recv().await {
                let Some(this) = this.upgrade() else { break };
                this.on_feed(generation, feed, value).await;
            }
        });
    }

    fn pump_link(self: &Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = this.upgrade() else { break };
                this.on_link_event(generation, event).await;
            }
        });
    }

    async fn on_feed(&self, generation: u64, feed: Feed, value: Option<Value>) {
        let mut st = self.state.lock().await;
        if st.generation != generation || st.disposed {
            debug!("call: dropping late {:?} update for generation {}", feed, generation);
            return;
        }
        match feed {
            Feed::Status => self.on_remote_status(&mut st, value).await,
            Feed::Answer => self.on_answer(&mut st, value).await,
            Feed::Candidates => self.on_candidates(&mut st, value).await,
        }
    }

    async fn on_remote_status(&self, st: &mut LocalCallState, raw: Option<Value>) {
        let Some(id) = st.session_id.clone() else { return };
        let status = match decode::<SessionStatus>(&self.channel.paths().status(&id), raw) {
            Ok(status) => status,
            Err(e) => {
                self.end_locally(st, CallStatus::Ended, Some(&CallError::from(e))).await;
                return;
            }
        };

        let Some(status) = status else {
            info!("call {}: record removed", id);
            self.finish(st, CallStatus::Ended, None).await;
            return;
        };
        if st.last_remote_status == Some(status) {
            debug!("call {}: status {:?} repeated", id, status);
            return;
        }
        st.last_remote_status = Some(status);

        match status {
            SessionStatus::Accepted if st.role == Some(Role::Caller) => {
                if self.transition(st, CallStatus::Connecting) {
                    self.announce(st, SessionStatus::Connecting).await;
                }
            }
            SessionStatus::Ended => self.finish(st, CallStatus::Ended, None).await,
            SessionStatus::Rejected => self.finish(st, CallStatus::Rejected, None).await,
            other => debug!("call {}: status {:?}", id, other),
        }
    }

    async fn on_answer(&self, st: &mut LocalCallState, raw: Option<Value>) {
        let (Some(id), Some(engine)) = (st.session_id.clone(), st.engine.clone()) else {
            return;
        };
        let answer = match decode::<NegotiationMessage>(&self.channel.paths().answer(&id), raw) {
            Ok(Some(answer)) if answer.kind == SdpKind::Answer => answer,
            Ok(Some(other)) => {
                warn!("call {}: expected an answer, got {:?}", id, other.kind);
                return;
            }
            Ok(None) => return,
            Err(e) => {
                self.end_locally(st, CallStatus::Ended, Some(&CallError::from(e))).await;
                return;
            }
        };

        match engine.set_remote_description(answer).await {
            Ok(ApplyOutcome::Applied) => {
                info!("call {}: answer applied", id);
                if self.transition(st, CallStatus::Connecting) {
                    self.announce(st, SessionStatus::Connecting).await;
                }
            }
            Ok(outcome) => debug!("call {}: answer {:?}", id, outcome),
            Err(e) => self.end_locally(st, CallStatus::Ended, Some(&e)).await,
        }
    }

    async fn on_candidates(&self, st: &mut LocalCallState, raw: Option<Value>) {
        let Some(engine) = st.engine.clone() else { return };
        let Some(Value::Object(entries)) = raw else { return };
        // push keys sort in arrival order
        for (key, value) in entries {
            let candidate: IceCandidate = match serde_json::from_value(value) {
                Ok(candidate) => candidate,
                Err(e) => {
                    debug!("call: skipping malformed candidate {}: {}", key, e);
                    continue;
                }
            };
            match engine.add_remote_candidate(&key, candidate).await {
                Ok(outcome) => debug!("call: remote candidate {} {:?}", key, outcome),
                Err(e) => warn!("call: remote candidate {} rejected: {}", key, e),
            }
        }
    }

    async fn on_link_event(&self, generation: u64, event: LinkEvent) {
        let mut st = self.state.lock().await;
        if st.generation != generation || st.disposed {
            return;
        }
        let Some(engine) = st.engine.clone() else { return };

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let Some(id) = st.session_id.clone() else { return };
                if let Err(e) = self.channel.push_candidate(&id, &self.user_id, &candidate).await {
                    warn!("call {}: could not publish local candidate: {}", id, e);
                }
            }
            LinkEvent::RemoteTrack(track) => {
                info!("call: remote {:?} track {}", track.kind, track.id);
                st.remote_stream.add(track);
                self.publish(&st);
            }
            state_event => {
                if let Some(signal) = engine.observe(&state_event) {
                    self.on_signal(&mut st, signal).await;
                }
            }
        }
    }

    async fn on_signal(&self, st: &mut LocalCallState, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Connecting => debug!("call {:?}: transport connecting", st.session_id),
            ConnectionSignal::Connected => {
                if self.transition(st, CallStatus::Connected) && st.role == Some(Role::Caller) {
                    self.announce(st, SessionStatus::Connected).await;
                }
            }
            ConnectionSignal::Disconnected | ConnectionSignal::Failed | ConnectionSignal::Closed => {
                let e = CallError::NegotiationFailed(format!("transport {:?}", signal));
                self.end_locally(st, CallStatus::Ended, Some(&e)).await;
            }
        }
    }

    /// Moves to `status` if allowed and publishes the view.
    fn transition(&self, st: &mut LocalCallState, status: CallStatus) -> bool {
        if !st.status.accepts(status) {
            debug!("call {:?}: ignoring {} -> {}", st.session_id, st.status, status);
            return false;
        }
        info!("call {:?}: {} -> {}", st.session_id, st.status, status);
        st.status = status;
        if status == CallStatus::Connected {
            st.connected_at = Some(Utc::now());
        }
        self.publish(st);
        true
    }

    /// Terminal transition driven by this side: tells the peer, then releases everything.
    async fn end_locally(&self, st: &mut LocalCallState, status: CallStatus, error: Option<&CallError>) {
        if st.status.is_terminal() {
            return;
        }
        let announced = match status {
            CallStatus::Rejected => SessionStatus::Rejected,
            _ => SessionStatus::Ended,
        };
        self.announce(st, announced).await;
        self.finish(st, status, error).await;
    }

    async fn finish(&self, st: &mut LocalCallState, status: CallStatus, error: Option<&CallError>) {
        if !st.status.accepts(status) {
            debug!("call {:?}: already {}", st.session_id, st.status);
            return;
        }
        if let Some(e) = error {
            warn!("call {:?}: {}", st.session_id, e);
            st.last_error = Some(e.to_string());
        }
        // released before the terminal status is published
        self.disposer.dispose(st).await;
        if self.transition(st, status) {
            self.ring_waiting(st);
        }
    }

    /// An invitation that arrived during the call was held back; show it now.
    fn ring_waiting(&self, st: &mut LocalCallState) {
        let Some(waiting) = self.scanner.as_ref().and_then(|s| s.current()) else {
            return;
        };
        if st.session_id.as_deref() == Some(waiting.session_id.as_str()) {
            return;
        }
        info!("call {:?}: ringing for waiting call {}", st.session_id, waiting.session_id);
        *st = self.callee_state(&waiting);
        self.transition(st, CallStatus::Ringing);
    }

    async fn announce(&self, st: &mut LocalCallState, status: SessionStatus) {
        let Some(id) = st.session_id.clone() else { return };
        match self.channel.write_status(&id, status).await {
            Ok(()) => st.last_remote_status = Some(status),
            Err(e) => warn!("call {}: could not write status {:?}: {}", id, status, e),
        }
    }

    fn publish(&self, st: &LocalCallState) {
        self.view.send_replace(st.view());
    }
}

fn is_busy(status: CallStatus) -> bool {
    status.is_engaged() || status == CallStatus::Ringing
}

fn current_call(st: &LocalCallState) -> Result<(SessionId, UserId, CallType), CallError> {
    match (&st.session_id, &st.peer_id, st.call_type) {
        (Some(id), Some(peer), Some(call_type)) => Ok((id.clone(), peer.clone(), call_type)),
        _ => Err(CallError::NoInvitation),
    }
}
