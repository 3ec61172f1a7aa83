//! Two clients sharing one in-memory store, with scripted peer links.

use crate::call::{CallController, CallStatus, CallView};
use crate::client::CallClient;
use crate::config::CallConfig;
use crate::error::{CallError, StoreError};
use crate::media::{LocalStream, MediaDevices, SilentDevices};
use crate::peer::fake::FakeLinkFactory;
use crate::peer::{LinkEvent, LinkState, SdpKind, TrackKind};
use crate::profile::StoreProfiles;
use crate::scanner::Invitation;
use crate::session::{CallType, Paths};
use crate::signaling::SignalingChannel;
use crate::store::{MemoryStore, SignalingStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const LIMIT: Duration = Duration::from_secs(5);

struct DeniedDevices;

#[async_trait]
impl MediaDevices for DeniedDevices {
    async fn acquire(&self, _call_type: CallType) -> Result<LocalStream, CallError> {
        Err(CallError::MediaAccessDenied("no microphone".into()))
    }
}

struct Pair {
    store: MemoryStore,
    alice: CallClient,
    bob: CallClient,
    alice_links: FakeLinkFactory,
    bob_links: FakeLinkFactory,
}

async fn client(
    user: &str,
    shared: &Arc<dyn SignalingStore>,
    config: &CallConfig,
    links: &FakeLinkFactory,
) -> CallClient {
    CallClient::connect(
        user,
        shared.clone(),
        config,
        Arc::new(links.clone()),
        Arc::new(SilentDevices),
        Arc::new(StoreProfiles::new(shared.clone(), config.paths())),
    )
    .await
    .unwrap()
}

async fn pair_with(config: CallConfig) -> Pair {
    let store = MemoryStore::new();
    let shared: Arc<dyn SignalingStore> = Arc::new(store.clone());
    shared
        .write("users/alice", json!({"name": "Alice", "avatar": "a.png"}))
        .await
        .unwrap();
    let alice_links = FakeLinkFactory::connecting();
    let bob_links = FakeLinkFactory::connecting();
    let alice = client("alice", &shared, &config, &alice_links).await;
    let bob = client("bob", &shared, &config, &bob_links).await;
    Pair {
        store,
        alice,
        bob,
        alice_links,
        bob_links,
    }
}

async fn pair() -> Pair {
    pair_with(CallConfig::default()).await
}

async fn reach(client: &CallClient, status: CallStatus) -> CallView {
    let mut view = client.view();
    let reached = timeout(LIMIT, view.wait_for(|v| v.status == status))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {}", client.user_id(), status))
        .unwrap()
        .clone();
    reached
}

async fn invited(client: &CallClient) -> Invitation {
    let mut feed = client.invitations();
    let invitation = timeout(LIMIT, feed.wait_for(Option::is_some))
        .await
        .expect("no invitation")
        .unwrap()
        .clone();
    invitation.unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(LIMIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn connected_call(p: &Pair) -> String {
    let session_id = p.alice.start_call("bob", CallType::Voice).await.unwrap();
    invited(&p.bob).await;
    reach(&p.bob, CallStatus::Ringing).await;
    p.bob.accept_call().await.unwrap();
    reach(&p.alice, CallStatus::Connected).await;
    reach(&p.bob, CallStatus::Connected).await;
    session_id
}

#[tokio::test]
async fn full_voice_call_connects_both_sides() {
    let p = pair().await;
    let session_id = p.alice.start_call("bob", CallType::Voice).await.unwrap();
    assert_eq!(p.alice.snapshot().status, CallStatus::Calling);

    let invitation = invited(&p.bob).await;
    assert_eq!(invitation.session_id, session_id);
    assert_eq!(invitation.caller_name, "Alice");
    assert_eq!(invitation.caller_avatar.as_deref(), Some("a.png"));
    assert_eq!(invitation.call_type, CallType::Voice);
    reach(&p.bob, CallStatus::Ringing).await;

    p.bob.accept_call().await.unwrap();
    let alice = reach(&p.alice, CallStatus::Connected).await;
    let bob = reach(&p.bob, CallStatus::Connected).await;
    assert!(alice.is_connected && bob.is_connected);
    assert!(alice.connected_at.is_some());
    assert_eq!(bob.peer_id.as_deref(), Some("alice"));

    let status = format!("calls/{session_id}/status");
    eventually(|| p.store.get(&status) == Some(json!("connected"))).await;

    let callee_link = p.bob_links.last();
    assert_eq!(callee_link.remote_descriptions()[0].kind, SdpKind::Offer);
    assert_eq!(callee_link.local_description().unwrap().kind, SdpKind::Answer);
    let caller_link = p.alice_links.last();
    assert_eq!(caller_link.remote_descriptions().len(), 1);
    assert_eq!(caller_link.remote_descriptions()[0].kind, SdpKind::Answer);
    assert!(!caller_link.applied_candidates().is_empty());

    p.alice.end_call().await.unwrap();
    reach(&p.bob, CallStatus::Ended).await;
    let session = format!("calls/{session_id}");
    eventually(|| p.store.get(&session).is_none()).await;
    assert_eq!(p.alice.teardowns(), 1);
    eventually(|| p.bob.teardowns() == 1).await;
    assert!(p.alice.snapshot().local_stream.is_none());
}

#[tokio::test]
async fn video_call_attaches_both_tracks() {
    let p = pair().await;
    p.alice.start_call("bob", CallType::Video).await.unwrap();
    let invitation = invited(&p.bob).await;
    assert_eq!(invitation.call_type, CallType::Video);
    p.bob.accept_call().await.unwrap();
    reach(&p.bob, CallStatus::Connected).await;

    let local = p.bob.snapshot().local_stream.unwrap();
    assert_eq!(local.tracks_of(TrackKind::Video).count(), 1);
    assert_eq!(p.bob_links.last().attached_streams(), vec![local.id().to_string()]);
}

#[tokio::test]
async fn callee_rejects() {
    let p = pair().await;
    let session_id = p.alice.start_call("bob", CallType::Voice).await.unwrap();
    invited(&p.bob).await;
    p.bob.reject_call().await.unwrap();

    reach(&p.alice, CallStatus::Rejected).await;
    assert_eq!(p.bob.snapshot().status, CallStatus::Rejected);
    let session = format!("calls/{session_id}");
    eventually(|| p.store.get(&session).is_none()).await;
    assert_eq!(p.alice.teardowns(), 1);

    p.store.redeliver(&session);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(p.alice.teardowns(), 1);
    assert_eq!(p.alice.snapshot().status, CallStatus::Rejected);
    assert_eq!(p.bob.invitations().borrow().clone(), None);
}

#[tokio::test]
async fn hanging_up_while_ringing_declines() {
    let p = pair().await;
    p.alice.start_call("bob", CallType::Voice).await.unwrap();
    invited(&p.bob).await;
    reach(&p.bob, CallStatus::Ringing).await;

    p.bob.end_call().await.unwrap();
    reach(&p.alice, CallStatus::Rejected).await;
    assert_eq!(p.bob.snapshot().status, CallStatus::Rejected);
}

#[tokio::test]
async fn transport_drop_ends_the_call() {
    let p = pair().await;
    let session_id = connected_call(&p).await;

    let caller_link = p.alice_links.last();
    caller_link.emit(LinkEvent::PeerState(LinkState::Disconnected));

    let alice = reach(&p.alice, CallStatus::Ended).await;
    assert!(alice.last_error.is_some());
    reach(&p.bob, CallStatus::Ended).await;
    let session = format!("calls/{session_id}");
    eventually(|| p.store.get(&session).is_none()).await;
    assert_eq!(caller_link.close_count(), 1);

    caller_link.emit(LinkEvent::PeerState(LinkState::Connected));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(p.alice.snapshot().status, CallStatus::Ended);
    assert_eq!(p.alice.teardowns(), 1);
}

#[tokio::test]
async fn caller_hang_up_while_ringing_is_a_missed_call() {
    let p = pair().await;
    let session_id = p.alice.start_call("bob", CallType::Voice).await.unwrap();
    invited(&p.bob).await;
    reach(&p.bob, CallStatus::Ringing).await;

    p.alice.end_call().await.unwrap();
    reach(&p.bob, CallStatus::Ended).await;
    assert_eq!(p.bob.invitations().borrow().clone(), None);
    let session = format!("calls/{session_id}");
    eventually(|| p.store.get(&session).is_none()).await;
}

#[tokio::test]
async fn unanswered_call_ages_out() {
    let config = CallConfig {
        freshness_window_secs: 1,
        rescan_interval_secs: 1,
        ..CallConfig::default()
    };
    let p = pair_with(config).await;
    let session_id = p.alice.start_call("bob", CallType::Voice).await.unwrap();
    invited(&p.bob).await;

    let mut feed = p.bob.invitations();
    timeout(Duration::from_secs(5), feed.wait_for(Option::is_none))
        .await
        .expect("invitation never aged out")
        .unwrap();
    reach(&p.bob, CallStatus::Ended).await;
    assert_eq!(
        p.store.get(&format!("calls/{session_id}/status")),
        Some(json!("calling"))
    );
    assert_eq!(p.alice.snapshot().status, CallStatus::Calling);
}

#[tokio::test]
async fn second_call_while_busy_is_refused() {
    let p = pair().await;
    p.alice.start_call("bob", CallType::Voice).await.unwrap();
    match p.alice.start_call("carol", CallType::Voice).await {
        Err(CallError::Busy(CallStatus::Calling)) => {}
        other => panic!("expected busy, got {other:?}"),
    }
}

#[tokio::test]
async fn accept_without_invitation_fails() {
    let p = pair().await;
    assert!(matches!(p.bob.accept_call().await, Err(CallError::NoInvitation)));
}

#[tokio::test]
async fn toggles_drive_local_tracks() {
    let p = pair().await;
    connected_call(&p).await;

    assert!(p.alice.toggle_mute().await);
    let view = p.alice.snapshot();
    assert!(view.is_muted);
    let stream = view.local_stream.unwrap();
    assert!(stream.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));

    assert!(!p.alice.toggle_mute().await);
    assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
    assert!(p.alice.toggle_speaker().await);
    assert!(!p.alice.toggle_video().await);
    assert!(!p.alice.snapshot().is_video_enabled);
}

#[tokio::test]
async fn a_new_call_starts_from_fresh_state() {
    let p = pair().await;
    connected_call(&p).await;
    p.alice.end_call().await.unwrap();
    reach(&p.bob, CallStatus::Ended).await;

    let second = p.alice.start_call("bob", CallType::Voice).await.unwrap();
    let invitation = invited(&p.bob).await;
    assert_eq!(invitation.session_id, second);
    p.bob.accept_call().await.unwrap();
    reach(&p.alice, CallStatus::Connected).await;
    assert_eq!(p.alice_links.opened(), 2);
}

#[tokio::test]
async fn shutdown_hangs_up() {
    let p = pair().await;
    let session_id = connected_call(&p).await;
    p.alice.shutdown().await;
    reach(&p.bob, CallStatus::Ended).await;
    let session = format!("calls/{session_id}");
    eventually(|| p.store.get(&session).is_none()).await;
}

#[tokio::test]
async fn shutdown_without_a_call_tears_nothing_down() {
    let p = pair().await;
    p.bob.shutdown().await;
    assert_eq!(p.bob.teardowns(), 0);
    assert_eq!(p.bob.snapshot().status, CallStatus::Idle);
}

/// Alice and Bob are talking when Carol calls Bob.
async fn waiting_call(p: &Pair) -> (CallClient, String) {
    connected_call(p).await;
    let shared: Arc<dyn SignalingStore> = Arc::new(p.store.clone());
    let carol = client(
        "carol",
        &shared,
        &CallConfig::default(),
        &FakeLinkFactory::connecting(),
    )
    .await;
    let waiting = carol.start_call("bob", CallType::Voice).await.unwrap();
    let feed = p.bob.invitations();
    eventually(|| {
        feed.borrow().as_ref().map(|i| i.session_id.as_str()) == Some(waiting.as_str())
    })
    .await;
    assert_eq!(p.bob.snapshot().status, CallStatus::Connected);
    (carol, waiting)
}

#[tokio::test]
async fn busy_accept_keeps_the_waiting_invitation() {
    let p = pair().await;
    let (carol, waiting) = waiting_call(&p).await;

    match p.bob.accept_call().await {
        Err(CallError::Busy(CallStatus::Connected)) => {}
        other => panic!("expected busy, got {other:?}"),
    }
    let shown = p.bob.invitations().borrow().clone();
    assert_eq!(shown.map(|i| i.session_id), Some(waiting.clone()));

    p.bob.end_call().await.unwrap();
    reach(&p.alice, CallStatus::Ended).await;
    let bob = reach(&p.bob, CallStatus::Ringing).await;
    assert_eq!(bob.session_id.as_deref(), Some(waiting.as_str()));

    p.bob.accept_call().await.unwrap();
    reach(&carol, CallStatus::Connected).await;
    let bob = reach(&p.bob, CallStatus::Connected).await;
    assert_eq!(bob.peer_id.as_deref(), Some("carol"));
}

#[tokio::test]
async fn waiting_call_rings_once_the_current_call_ends() {
    let p = pair().await;
    let (carol, waiting) = waiting_call(&p).await;

    p.alice.end_call().await.unwrap();
    let bob = reach(&p.bob, CallStatus::Ringing).await;
    assert_eq!(bob.session_id.as_deref(), Some(waiting.as_str()));
    assert_eq!(bob.peer_id.as_deref(), Some("carol"));

    carol.end_call().await.unwrap();
    let bob = reach(&p.bob, CallStatus::Ended).await;
    assert_eq!(bob.session_id.as_deref(), Some(waiting.as_str()));
    assert_eq!(p.bob.invitations().borrow().clone(), None);
}

fn controller(
    store: &MemoryStore,
    links: &FakeLinkFactory,
    devices: Arc<dyn MediaDevices>,
) -> Arc<CallController> {
    let channel = SignalingChannel::new(Arc::new(store.clone()), Paths::default());
    CallController::new(
        "alice",
        channel,
        Arc::new(links.clone()),
        devices,
        None,
        Duration::from_secs(300),
    )
}

async fn reach_status(controller: &CallController, status: CallStatus) {
    let mut view = controller.view();
    timeout(LIMIT, view.wait_for(|v| v.status == status))
        .await
        .unwrap_or_else(|_| panic!("never reached {status}"))
        .unwrap();
}

#[tokio::test]
async fn repeated_status_has_one_effect() {
    let store = MemoryStore::new();
    let links = FakeLinkFactory::default();
    let caller = controller(&store, &links, Arc::new(SilentDevices));
    let id = caller.start_call("bob", CallType::Voice).await.unwrap();
    let status = format!("calls/{id}/status");

    store.write(&status, json!("accepted")).await.unwrap();
    reach_status(&caller, CallStatus::Connecting).await;
    eventually(|| store.get(&status) == Some(json!("connecting"))).await;

    store.write(&status, json!("accepted")).await.unwrap();
    for _ in 0..3 {
        store.redeliver(&status);
    }
    sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get(&status), Some(json!("accepted")));
    assert_eq!(caller.snapshot().status, CallStatus::Connecting);

    store.write(&status, json!("ended")).await.unwrap();
    store.redeliver(&status);
    reach_status(&caller, CallStatus::Ended).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(caller.teardowns(), 1);
}

#[tokio::test]
async fn media_failure_leaves_call_idle() {
    let store = MemoryStore::new();
    let links = FakeLinkFactory::default();
    let caller = controller(&store, &links, Arc::new(DeniedDevices));

    let result = caller.start_call("bob", CallType::Video).await;
    assert!(matches!(result, Err(CallError::MediaAccessDenied(_))));
    let view = caller.snapshot();
    assert_eq!(view.status, CallStatus::Idle);
    assert!(view.last_error.is_some());
    assert_eq!(links.opened(), 0);
    assert_eq!(store.get("calls"), None);
}

#[tokio::test]
async fn store_outage_during_setup_ends_the_call() {
    let store = MemoryStore::new();
    let links = FakeLinkFactory::default();
    let caller = controller(&store, &links, Arc::new(SilentDevices));
    store.set_available(false);

    let result = caller.start_call("bob", CallType::Voice).await;
    assert!(matches!(
        result,
        Err(CallError::Store(StoreError::Unavailable(_)))
    ));
    let view = caller.snapshot();
    assert_eq!(view.status, CallStatus::Ended);
    assert!(view.last_error.is_some());
    assert_eq!(caller.teardowns(), 1);
    assert_eq!(links.last().close_count(), 1);
}

#[tokio::test]
async fn accepting_without_an_offer_ends_the_call() {
    let store = MemoryStore::new();
    store
        .write(
            "calls/s1",
            json!({"id": "s1", "callerId": "bob", "calleeId": "alice", "type": "voice",
                   "status": "calling", "createdAt": crate::utils::now_millis()}),
        )
        .await
        .unwrap();
    let links = FakeLinkFactory::default();
    let callee = controller(&store, &links, Arc::new(SilentDevices));
    let invitation = Invitation {
        session_id: "s1".into(),
        caller_id: "bob".into(),
        caller_name: "bob".into(),
        caller_avatar: None,
        call_type: CallType::Voice,
        created_at: crate::utils::now_millis(),
    };
    callee.on_invitation(Some(invitation.clone())).await;
    assert_eq!(callee.snapshot().status, CallStatus::Ringing);

    let result = callee.accept(&invitation).await;
    assert!(matches!(result, Err(CallError::MissingOffer(_))));
    assert_eq!(callee.snapshot().status, CallStatus::Ended);
    assert_eq!(store.get("calls/s1/status"), Some(json!("ended")));
}

#[tokio::test]
async fn stale_invitation_cannot_be_accepted() {
    let store = MemoryStore::new();
    let links = FakeLinkFactory::default();
    let callee = controller(&store, &links, Arc::new(SilentDevices));
    let invitation = Invitation {
        session_id: "old".into(),
        caller_id: "bob".into(),
        caller_name: "bob".into(),
        caller_avatar: None,
        call_type: CallType::Voice,
        created_at: crate::utils::now_millis() - 10 * 60 * 1000,
    };
    let result = callee.accept(&invitation).await;
    assert!(matches!(result, Err(CallError::StaleInvitation(_))));
    assert_eq!(links.opened(), 0);
}
