//! Local capture handles and the remote stream projection.
//!
//! Capture itself lives outside this crate; a [`MediaDevices`] implementation hands back a
//! [`LocalStream`] whose tracks the negotiation engine publishes and the controller mutes,
//! disables and finally stops.

use crate::error::CallError;
use crate::peer::types::{RemoteTrack, TrackKind};
use crate::session::CallType;
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            id: format!("{}-{}", prefix, random_id()),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Tracks handed out by a [`MediaDevices`] implementation.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: format!("stream-{}", random_id()),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(MediaTrack::is_stopped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn add(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Source of local capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with [`CallError::MediaAccessDenied`] when capture is unavailable.
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, CallError>;
}

/// Hands out tracks with no capture source behind them.
#[derive(Debug, Default, Clone)]
pub struct SilentDevices;

#[async_trait]
impl MediaDevices for SilentDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, CallError> {
        let mut tracks = vec![MediaTrack::new(TrackKind::Audio)];
        if call_type.has_video() {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Ok(LocalStream::new(tracks))
    }
}
