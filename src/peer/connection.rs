use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::LocalStream;
use crate::peer::ice::analyze_candidates;
use crate::peer::link::{PeerLink, PeerLinkFactory};
use crate::peer::types::{
    IceCandidate, LinkEvent, LinkState, NegotiationMessage, RemoteTrack, SdpKind, ServerConfig,
    TrackKind,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Opens `webrtc` peer connections configured from [`CallConfig`].
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<ServerConfig>,
    pool_size: u8,
}

impl RtcPeerFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            pool_size: config.ice_candidate_pool_size,
        }
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerFactory {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let config = rtc_config(&self.ice_servers, self.pool_size);
        let pc = new_peer(config, events).await?;
        Ok(Arc::new(RtcPeer {
            pc,
            tracks: Mutex::new(Vec::new()),
        }))
    }
}

/// [`PeerLink`] backed by an `RTCPeerConnection`.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl RtcPeer {
    /// Local tracks, for a capture pipeline to write samples into.
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    async fn local_message(&self, kind: SdpKind, fallback: String) -> NegotiationMessage {
        let body = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or(fallback);
        NegotiationMessage { kind, body }
    }
}

#[async_trait]
impl PeerLink for RtcPeer {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), CallError> {
        for track in stream.tracks() {
            let capability = match track.kind() {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id().to_owned(),
                stream.id().to_owned(),
            ));
            let sender = self
                .pc
                .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // drain RTCP so interceptors keep running
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });

            if let Ok(mut tracks) = self.tracks.lock() {
                tracks.push(local);
            }
        }
        Ok(())
    }

    async fn create_local_offer(&self) -> Result<NegotiationMessage, CallError> {
        debug!("Creating offer...");
        let offer = self.pc.create_offer(None).await?;
        let fallback = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(self.local_message(SdpKind::Offer, fallback).await)
    }

    async fn create_local_answer(&self) -> Result<NegotiationMessage, CallError> {
        debug!("Creating answer...");
        let answer = self.pc.create_answer(None).await?;
        let fallback = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(self.local_message(SdpKind::Answer, fallback).await)
    }

    async fn set_remote_description(&self, message: NegotiationMessage) -> Result<(), CallError> {
        let description = match message.kind {
            SdpKind::Offer => RTCSessionDescription::offer(message.body)?,
            SdpKind::Answer => RTCSessionDescription::answer(message.body)?,
        };
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Creates a peer and wires every callback into `events`.
pub async fn new_peer(
    config: RTCConfiguration,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Result<Arc<RTCPeerConnection>, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(config).await?);

    // local candidates, kept for the gathering summary
    let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::default();
    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = candidate_tx.clone();
        let gathered = gathered.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                // cand == None means gathering is complete
                info!("ICE candidate gathering completed");
                if let Ok(list) = gathered.lock() {
                    analyze_candidates(&list);
                }
                return;
            };
            let Ok(init) = c.to_json() else {
                warn!("Failed to serialize local candidate");
                return;
            };
            let candidate = IceCandidate {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
                username_fragment: init.username_fragment,
            };
            dump_candidate("LOCAL", &candidate);
            if let Ok(mut list) = gathered.lock() {
                list.push(candidate.clone());
            }
            let _ = tx.send(LinkEvent::LocalCandidate(candidate));
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let ice_tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        debug!("ICE connection state changed to: {:?}", st);
        let mapped = match st {
            RTCIceConnectionState::New => Some(LinkState::New),
            RTCIceConnectionState::Checking => Some(LinkState::Connecting),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                Some(LinkState::Connected)
            }
            RTCIceConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCIceConnectionState::Failed => Some(LinkState::Failed),
            RTCIceConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        };
        if let Some(state) = mapped {
            let _ = ice_tx.send(LinkEvent::IceState(state));
        }
        Box::pin(async {})
    }));

    // weak copy for the state handler, the callback lives inside the peer
    let pc_stats = Arc::downgrade(&pc);
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        let mapped = match st {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        };

        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = pc_stats.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }

        if let Some(state) = mapped {
            let _ = state_tx.send(LinkEvent::PeerState(state));
        }
        Box::pin(async {})
    }));

    let track_tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let remote = RemoteTrack {
                id: track.id(),
                kind,
            };
            info!("Remote track arrived: {} ({:?})", remote.id, remote.kind);
            let _ = track_tx.send(LinkEvent::RemoteTrack(remote));
            Box::pin(async {})
        },
    ));

    Ok(pc)
}

/// Builds the peer configuration
pub fn rtc_config(servers: &[ServerConfig], pool_size: u8) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(servers),
        ice_candidate_pool_size: pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
