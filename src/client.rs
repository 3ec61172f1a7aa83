//! Application-facing entry point: one signed-in user, one call at a time.

use crate::call::{CallController, CallStatus, CallView};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{MediaDevices, SilentDevices};
use crate::peer::{PeerLinkFactory, RtcPeerFactory};
use crate::profile::{ProfileDirectory, StoreProfiles};
use crate::scanner::{IncomingCallScanner, Invitation};
use crate::session::{CallType, SessionId, UserId};
use crate::signaling::SignalingChannel;
use crate::store::SignalingStore;
use log::info;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub struct CallClient {
    user_id: UserId,
    controller: Arc<CallController>,
    scanner: Arc<IncomingCallScanner>,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl CallClient {
    /// Wires the scanner and the call controller for `user_id` and starts listening for
    /// invitations.
    pub async fn connect(
        user_id: impl Into<UserId>,
        store: Arc<dyn SignalingStore>,
        config: &CallConfig,
        links: Arc<dyn PeerLinkFactory>,
        devices: Arc<dyn MediaDevices>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let user_id = user_id.into();
        let channel = SignalingChannel::new(store, config.paths());

        let scanner = IncomingCallScanner::new(
            user_id.clone(),
            channel.clone(),
            profiles,
            config.freshness_window(),
            config.rescan_interval(),
        );
        let controller = CallController::new(
            user_id.clone(),
            channel,
            links,
            devices,
            Some(scanner.clone()),
            config.freshness_window(),
        );

        let mut invitations = scanner.invitations();
        let ringer = controller.clone();
        let feed = tokio::spawn(async move {
            while invitations.changed().await.is_ok() {
                let invitation = invitations.borrow_and_update().clone();
                ringer.on_invitation(invitation).await;
            }
        });

        scanner.start().await?;
        info!("client: {} ready", user_id);
        Ok(Self {
            user_id,
            controller,
            scanner,
            feed: Mutex::new(Some(feed)),
        })
    }

    /// Real peer connections, silent capture and profiles from the same store.
    pub async fn with_defaults(
        user_id: impl Into<UserId>,
        store: Arc<dyn SignalingStore>,
        config: &CallConfig,
    ) -> Result<Self, CallError> {
        let profiles = Arc::new(StoreProfiles::new(store.clone(), config.paths()));
        Self::connect(
            user_id,
            store,
            config,
            Arc::new(RtcPeerFactory::new(config)),
            Arc::new(SilentDevices),
            profiles,
        )
        .await
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn start_call(
        &self,
        contact_id: &str,
        call_type: CallType,
    ) -> Result<SessionId, CallError> {
        self.controller.start_call(contact_id, call_type).await
    }

    /// Accepts the invitation currently shown.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let invitation = self.scanner.begin_decision().await.ok_or(CallError::NoInvitation)?;
        let result = self.controller.accept(&invitation).await;
        self.settle(&invitation, result).await
    }

    /// Declines the invitation currently shown.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let invitation = self.scanner.begin_decision().await.ok_or(CallError::NoInvitation)?;
        let result = self.controller.reject(&invitation).await;
        self.settle(&invitation, result).await
    }

    /// Hangs up, or declines while ringing.
    pub async fn end_call(&self) -> Result<(), CallError> {
        if let Some(invitation) = self.ringing_invitation().await {
            let result = self.controller.reject(&invitation).await;
            return self.settle(&invitation, result).await;
        }
        self.controller.end_call().await
    }

    pub async fn toggle_mute(&self) -> bool {
        self.controller.toggle_mute().await
    }

    pub async fn toggle_video(&self) -> bool {
        self.controller.toggle_video().await
    }

    pub async fn toggle_speaker(&self) -> bool {
        self.controller.toggle_speaker().await
    }

    pub fn view(&self) -> watch::Receiver<CallView> {
        self.controller.view()
    }

    pub fn snapshot(&self) -> CallView {
        self.controller.snapshot()
    }

    pub fn invitations(&self) -> watch::Receiver<Option<Invitation>> {
        self.scanner.invitations()
    }

    pub fn teardowns(&self) -> usize {
        self.controller.teardowns()
    }

    /// Hangs up and stops listening. The client is inert afterwards.
    pub async fn shutdown(&self) {
        if let Some(feed) = self.feed.lock().await.take() {
            feed.abort();
        }
        self.scanner.stop().await;
        self.controller.shutdown().await;
        info!("client: {} shut down", self.user_id);
    }

    /// A busy refusal never claimed the invitation, so it stays up for later.
    async fn settle(
        &self,
        invitation: &Invitation,
        result: Result<(), CallError>,
    ) -> Result<(), CallError> {
        match &result {
            Err(CallError::Busy(_)) => self.scanner.cancel_decision().await,
            _ => self.scanner.finish_decision(&invitation.session_id).await,
        }
        result
    }

    async fn ringing_invitation(&self) -> Option<Invitation> {
        let view = self.snapshot();
        if view.status != CallStatus::Ringing {
            return None;
        }
        let invitation = self.scanner.begin_decision().await?;
        if view.session_id.as_deref() == Some(invitation.session_id.as_str()) {
            Some(invitation)
        } else {
            self.scanner.cancel_decision().await;
            None
        }
    }
}
