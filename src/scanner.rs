//! Incoming call discovery.
//!
//! The scanner keeps one long-lived filtered subscription on sessions addressed to the
//! local user and publishes at most one [`Invitation`] at a time. While an invitation is
//! shown it also watches that session's `status`, so a caller hang-up withdraws it right
//! away. A periodic rescan ages invitations out of the freshness window without needing a
//! store write.

use crate::error::CallError;
use crate::profile::ProfileDirectory;
use crate::session::{CallSession, CallType, SessionId, SessionStatus, UserId};
use crate::signaling::{decode, SignalingChannel};
use crate::store::{SubscriptionId, Watch};
use crate::utils::now_millis;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub session_id: SessionId,
    pub caller_id: UserId,
    pub caller_name: String,
    pub caller_avatar: Option<String>,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub created_at: i64,
}

impl Invitation {
    pub fn is_fresh(&self, now_millis: i64, window: Duration) -> bool {
        crate::session::is_fresh(self.created_at, now_millis, window)
    }
}

#[derive(Default)]
struct ScanState {
    subscription: Option<SubscriptionId>,
    session_watch: Option<(SessionId, SubscriptionId)>,
    deciding: bool,
    decided: HashSet<SessionId>,
    records: Option<Value>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct IncomingCallScanner {
    user_id: UserId,
    channel: SignalingChannel,
    profiles: Arc<dyn ProfileDirectory>,
    window: Duration,
    rescan_every: Duration,
    state: Mutex<ScanState>,
    feed: watch::Sender<Option<Invitation>>,
}

impl IncomingCallScanner {
    pub fn new(
        user_id: impl Into<UserId>,
        channel: SignalingChannel,
        profiles: Arc<dyn ProfileDirectory>,
        window: Duration,
        rescan_every: Duration,
    ) -> Arc<Self> {
        let (feed, _) = watch::channel(None);
        Arc::new(Self {
            user_id: user_id.into(),
            channel,
            profiles,
            window,
            rescan_every,
            state: Mutex::new(ScanState::default()),
            feed,
        })
    }

    /// Subscribes and starts the rescan ticker. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        if st.subscription.is_some() {
            return Ok(());
        }
        let Watch { id, mut updates } = self.channel.watch_invitations(&self.user_id).await?;
        st.subscription = Some(id);
        info!("scanner: watching invitations for {}", self.user_id);

        let this = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(records) = updates.recv().await {
                this.on_records(records).await;
            }
        });

        let this = Arc::clone(self);
        let every = self.rescan_every;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                this.rescan_at(now_millis()).await;
            }
        });

        st.tasks = vec![pump, ticker];
        Ok(())
    }

    pub async fn stop(&self) {
        let mut st = self.state.lock().await;
        for task in st.tasks.drain(..) {
            task.abort();
        }
        if let Some(id) = st.subscription.take() {
            self.channel.unwatch(id);
        }
        self.withdraw(&mut st);
    }

    pub fn invitations(&self) -> watch::Receiver<Option<Invitation>> {
        self.feed.subscribe()
    }

    pub fn current(&self) -> Option<Invitation> {
        self.feed.borrow().clone()
    }

    /// Re-evaluates the last snapshot as of `now_millis`.
    pub async fn rescan_at(self: &Arc<Self>, now_millis: i64) {
        let mut st = self.state.lock().await;
        self.evaluate(&mut st, now_millis).await;
    }

    /// Freezes reporting and hands out the invitation being decided on.
    pub async fn begin_decision(&self) -> Option<Invitation> {
        let mut st = self.state.lock().await;
        let current = self.current();
        if current.is_some() {
            st.deciding = true;
        }
        current
    }

    /// Resumes reporting; `session_id` is never reported again.
    pub async fn finish_decision(self: &Arc<Self>, session_id: &str) {
        let mut st = self.state.lock().await;
        st.deciding = false;
        st.decided.insert(session_id.to_string());
        self.evaluate(&mut st, now_millis()).await;
    }

    /// Resumes reporting without recording a decision.
    pub async fn cancel_decision(self: &Arc<Self>) {
        let mut st = self.state.lock().await;
        st.deciding = false;
        self.evaluate(&mut st, now_millis()).await;
    }

    /// Drops the status watch if it belongs to `session_id`.
    pub async fn release_session_watch(&self, session_id: &str) {
        let mut st = self.state.lock().await;
        if st.session_watch.as_ref().is_some_and(|(id, _)| id == session_id) {
            self.release_watch(&mut st);
        }
    }

    pub async fn has_session_watch(&self) -> bool {
        self.state.lock().await.session_watch.is_some()
    }

    async fn on_records(self: &Arc<Self>, records: Option<Value>) {
        let mut st = self.state.lock().await;
        st.records = records;
        self.evaluate(&mut st, now_millis()).await;
    }

    async fn evaluate(self: &Arc<Self>, st: &mut ScanState, now: i64) {
        if st.deciding {
            debug!("scanner: decision in flight, not reporting");
            return;
        }

        let records = parse_records(st.records.as_ref());
        st.decided.retain(|id| records.iter().any(|r| &r.id == id));

        let Some(session) = select(&records, &self.user_id, now, self.window, &st.decided) else {
            self.withdraw(st);
            return;
        };

        let already_shown = self
            .feed
            .borrow()
            .as_ref()
            .is_some_and(|inv| inv.session_id == session.id);
        if already_shown {
            return;
        }

        let invitation = self.resolve(session).await;
        self.raise(st, invitation).await;
    }

    async fn resolve(&self, session: &CallSession) -> Invitation {
        let (caller_name, caller_avatar) = match self.profiles.lookup(&session.caller_id).await {
            Ok(Some(profile)) => (profile.name, profile.avatar),
            Ok(None) => (session.caller_id.clone(), None),
            Err(e) => {
                warn!("scanner: profile lookup for {} failed: {}", session.caller_id, e);
                (session.caller_id.clone(), None)
            }
        };
        Invitation {
            session_id: session.id.clone(),
            caller_id: session.caller_id.clone(),
            caller_name,
            caller_avatar,
            call_type: session.call_type,
            created_at: session.created_at,
        }
    }

    async fn raise(self: &Arc<Self>, st: &mut ScanState, invitation: Invitation) {
        self.release_watch(st);

        match self.channel.watch_status(&invitation.session_id).await {
            Ok(Watch { id, mut updates }) => {
                st.session_watch = Some((invitation.session_id.clone(), id));
                let this = Arc::clone(self);
                let session_id = invitation.session_id.clone();
                tokio::spawn(async move {
                    while let Some(status) = updates.recv().await {
                        this.on_session_status(&session_id, id, status).await;
                    }
                });
            }
            Err(e) => warn!(
                "scanner: cannot watch status of {}: {}",
                invitation.session_id, e
            ),
        }

        info!(
            "scanner: invitation {} from {} ({:?})",
            invitation.session_id, invitation.caller_name, invitation.call_type
        );
        self.feed.send_replace(Some(invitation));
    }

    async fn on_session_status(&self, session_id: &str, sub: SubscriptionId, raw: Option<Value>) {
        let mut st = self.state.lock().await;
        if st.deciding || st.session_watch.as_ref() != Some(&(session_id.to_string(), sub)) {
            return;
        }
        let path = self.channel.paths().status(session_id);
        let status: Option<SessionStatus> = match decode(&path, raw) {
            Ok(status) => status,
            Err(e) => {
                debug!("scanner: ignoring {}", e);
                return;
            }
        };
        if !status.is_some_and(SessionStatus::is_inviting) {
            info!("scanner: invitation {} withdrawn ({:?})", session_id, status);
            self.withdraw(&mut st);
        }
    }

    fn withdraw(&self, st: &mut ScanState) {
        self.release_watch(st);
        if self.feed.borrow().is_some() {
            self.feed.send_replace(None);
        }
    }

    fn release_watch(&self, st: &mut ScanState) {
        if let Some((session_id, id)) = st.session_watch.take() {
            debug!("scanner: releasing status watch on {}", session_id);
            self.channel.unwatch(id);
        }
    }
}

fn parse_records(records: Option<&Value>) -> Vec<CallSession> {
    let Some(Value::Object(map)) = records else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!("scanner: skipping malformed session {}: {}", key, e);
                None
            }
        })
        .collect()
}

/// The oldest fresh, undecided session inviting `user_id`.
pub fn select<'a>(
    records: &'a [CallSession],
    user_id: &str,
    now_millis: i64,
    window: Duration,
    decided: &HashSet<SessionId>,
) -> Option<&'a CallSession> {
    records
        .iter()
        .filter(|s| s.callee_id == user_id && s.status.is_inviting())
        .filter(|s| !decided.contains(&s.id))
        .filter(|s| {
            let fresh = s.is_fresh(now_millis, window);
            if !fresh {
                debug!("scanner: dropping stale invitation {}", s.id);
            }
            fresh
        })
        .min_by_key(|s| s.created_at)
}
