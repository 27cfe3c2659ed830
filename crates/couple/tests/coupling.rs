use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, timeout};
use tracing_subscriber::EnvFilter;

use couple::mock::{MockCall, MockMedia};
use couple::{
    Candidate, CoupleConfig, CoupleError, DescriptionKind, LifecycleEvent, MemoryHub,
    MonitorHandle, MonitorState, RawConnectionState, SessionId, SignalChannel, SignalMessage,
    couple_with_config,
};

const EVENT_WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(50);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn next_event(events: &mut UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("event stream ended")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + EVENT_WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

fn host_candidate(n: u16) -> Candidate {
    Candidate {
        candidate: format!(
            "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
            50000 + n
        ),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

fn applied_count(media: &MockMedia, candidate: &Candidate) -> usize {
    media
        .calls()
        .iter()
        .filter(|call| **call == MockCall::ApplyRemoteCandidate(candidate.clone()))
        .count()
}

struct Side {
    media: Arc<MockMedia>,
    handle: MonitorHandle,
    events: UnboundedReceiver<LifecycleEvent>,
}

fn start_side(hub: &MemoryHub, local: &str, remote: &str, config: CoupleConfig) -> Side {
    let media = MockMedia::new(local);
    let handle = couple_with_config(media.clone(), remote, hub.endpoint(local), config);
    let events = handle.events().expect("event stream");
    Side {
        media,
        handle,
        events,
    }
}

/// Walk a pair of monitors through the full handshake: negotiating, first
/// connectivity, then the second signal that marks them active.
async fn drive_to_active(a: &mut Side, b: &mut Side) {
    assert_eq!(next_event(&mut a.events).await, LifecycleEvent::Negotiating);
    assert_eq!(next_event(&mut b.events).await, LifecycleEvent::Negotiating);

    a.media.push_state(RawConnectionState::Connected);
    b.media.push_state(RawConnectionState::Connected);
    assert_eq!(next_event(&mut a.events).await, LifecycleEvent::Connected);
    assert_eq!(next_event(&mut b.events).await, LifecycleEvent::Connected);

    a.media.push_state(RawConnectionState::Connected);
    b.media.push_state(RawConnectionState::Connected);
    assert_eq!(next_event(&mut a.events).await, LifecycleEvent::Active);
    assert_eq!(next_event(&mut b.events).await, LifecycleEvent::Active);
}

#[tokio::test]
async fn initiator_and_responder_reach_active() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut alice = start_side(
        &hub,
        "alice",
        "bob",
        CoupleConfig::default().with_session_id(SessionId::from_raw(5)),
    );
    let mut bob = start_side(&hub, "bob", "alice", CoupleConfig::responder());

    drive_to_active(&mut alice, &mut bob).await;

    let from_alice = host_candidate(1);
    let from_bob = host_candidate(2);
    alice.media.push_candidate(from_alice.clone());
    bob.media.push_candidate(from_bob.clone());

    wait_until(|| applied_count(&bob.media, &from_alice) == 1).await;
    wait_until(|| applied_count(&alice.media, &from_bob) == 1).await;

    for side in [&alice, &bob] {
        let calls = side.media.calls();
        let description = calls
            .iter()
            .position(|call| matches!(call, MockCall::ApplyRemoteDescription(_)))
            .expect("description applied");
        let candidate = calls
            .iter()
            .position(|call| matches!(call, MockCall::ApplyRemoteCandidate(_)))
            .expect("candidate applied");
        assert!(
            description < candidate,
            "candidate applied before description: {calls:?}"
        );
    }

    assert!(alice.events.try_recv().is_err(), "no further events expected");
    assert!(bob.events.try_recv().is_err(), "no further events expected");
    assert_eq!(alice.handle.state(), MonitorState::Active);
    assert_eq!(bob.handle.state(), MonitorState::Active);
}

#[tokio::test]
async fn racing_offers_resolve_to_lower_session_id() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut alice = start_side(
        &hub,
        "alice",
        "bob",
        CoupleConfig::default().with_session_id(SessionId::from_raw(3)),
    );
    let mut bob = start_side(
        &hub,
        "bob",
        "alice",
        CoupleConfig::default().with_session_id(SessionId::from_raw(7)),
    );

    drive_to_active(&mut alice, &mut bob).await;

    // The higher id yielded: bob sent an offer of his own but ended up
    // answering alice's.
    let bob_calls = bob.media.calls();
    assert!(bob_calls.contains(&MockCall::CreateOffer));
    assert!(bob_calls.iter().any(|call| matches!(
        call,
        MockCall::ApplyRemoteDescription(d) if d.kind == DescriptionKind::Offer
    )));
    assert!(bob_calls.contains(&MockCall::CreateAnswer));

    // Alice kept the initiator role throughout.
    let alice_calls = alice.media.calls();
    assert!(alice_calls.iter().any(|call| matches!(
        call,
        MockCall::ApplyRemoteDescription(d) if d.kind == DescriptionKind::Answer
    )));
    assert!(!alice_calls.contains(&MockCall::CreateAnswer));

    assert!(alice.events.try_recv().is_err(), "glare must not surface errors");
    assert!(bob.events.try_recv().is_err(), "glare must not surface errors");
}

#[tokio::test]
async fn early_candidates_wait_for_their_description() {
    init_tracing();
    let hub = MemoryHub::new();
    let eve = hub.endpoint("eve");
    let mut from_local = eve.subscribe(&"local".into());

    let media = MockMedia::new("local");
    let handle = couple_with_config(
        media.clone(),
        "eve",
        hub.endpoint("local"),
        CoupleConfig::responder(),
    );
    let mut events = handle.events().expect("event stream");
    assert_eq!(next_event(&mut events).await, LifecycleEvent::Negotiating);

    let session = SessionId::from_raw(9);
    let early = host_candidate(1);
    // A relay replay can surface candidates ahead of the offer they belong
    // to; they must be held back, never applied early.
    eve.send(&"local".into(), SignalMessage::candidate(session, &early))
        .await
        .expect("send candidate");
    eve.send(
        &"local".into(),
        SignalMessage::Offer {
            session_id: session,
            sdp: "v=0 eve offer".into(),
        },
    )
    .await
    .expect("send offer");

    let answer = timeout(EVENT_WAIT, from_local.recv())
        .await
        .expect("timed out waiting for answer")
        .expect("answer");
    assert!(matches!(
        answer,
        SignalMessage::Answer { session_id, .. } if session_id == session
    ));

    let calls = media.calls();
    let description = calls
        .iter()
        .position(|call| matches!(call, MockCall::ApplyRemoteDescription(_)))
        .expect("description applied");
    let candidate = calls
        .iter()
        .position(|call| *call == MockCall::ApplyRemoteCandidate(early.clone()))
        .expect("held candidate applied");
    let answered = calls
        .iter()
        .position(|call| *call == MockCall::CreateAnswer)
        .expect("answer created");
    assert!(description < candidate, "candidate applied early: {calls:?}");
    assert!(candidate < answered, "held candidates flush as the description applies");
}

#[tokio::test]
async fn duplicate_candidates_apply_once() {
    init_tracing();
    let hub = MemoryHub::new();
    let eve = hub.endpoint("eve");

    let media = MockMedia::new("local");
    let _handle = couple_with_config(
        media.clone(),
        "eve",
        hub.endpoint("local"),
        CoupleConfig::responder(),
    );

    let session = SessionId::from_raw(9);
    eve.send(
        &"local".into(),
        SignalMessage::Offer {
            session_id: session,
            sdp: "v=0 eve offer".into(),
        },
    )
    .await
    .expect("send offer");
    wait_until(|| media.calls().contains(&MockCall::CreateAnswer)).await;

    let dup = host_candidate(4);
    for _ in 0..2 {
        eve.send(&"local".into(), SignalMessage::candidate(session, &dup))
            .await
            .expect("send candidate");
    }
    wait_until(|| applied_count(&media, &dup) >= 1).await;
    sleep(SETTLE).await;
    assert_eq!(applied_count(&media, &dup), 1, "duplicate must be idempotent");
}

#[tokio::test]
async fn stale_session_candidates_are_rejected() {
    init_tracing();
    let hub = MemoryHub::new();
    let eve = hub.endpoint("eve");

    let media = MockMedia::new("local");
    let _handle = couple_with_config(
        media.clone(),
        "eve",
        hub.endpoint("local"),
        CoupleConfig::responder(),
    );

    eve.send(
        &"local".into(),
        SignalMessage::Offer {
            session_id: SessionId::from_raw(9),
            sdp: "v=0 eve offer".into(),
        },
    )
    .await
    .expect("send offer");
    wait_until(|| media.calls().contains(&MockCall::CreateAnswer)).await;

    let stale = host_candidate(8);
    eve.send(
        &"local".into(),
        SignalMessage::candidate(SessionId::from_raw(4), &stale),
    )
    .await
    .expect("send stale candidate");
    sleep(SETTLE).await;
    assert_eq!(applied_count(&media, &stale), 0, "stale candidate must be dropped");
}

#[tokio::test]
async fn duplicate_offers_are_discarded() {
    init_tracing();
    let hub = MemoryHub::new();
    let eve = hub.endpoint("eve");
    let mut from_local = eve.subscribe(&"local".into());

    let media = MockMedia::new("local");
    let _handle = couple_with_config(
        media.clone(),
        "eve",
        hub.endpoint("local"),
        CoupleConfig::responder(),
    );

    let offer = SignalMessage::Offer {
        session_id: SessionId::from_raw(9),
        sdp: "v=0 eve offer".into(),
    };
    eve.send(&"local".into(), offer.clone()).await.expect("send offer");
    eve.send(&"local".into(), offer).await.expect("send duplicate offer");

    let answer = timeout(EVENT_WAIT, from_local.recv())
        .await
        .expect("timed out waiting for answer")
        .expect("answer");
    assert!(matches!(answer, SignalMessage::Answer { .. }));
    sleep(SETTLE).await;

    let calls = media.calls();
    let applies = calls
        .iter()
        .filter(|call| matches!(call, MockCall::ApplyRemoteDescription(_)))
        .count();
    let answers = calls
        .iter()
        .filter(|call| **call == MockCall::CreateAnswer)
        .count();
    assert_eq!(applies, 1, "duplicate offer must not re-apply");
    assert_eq!(answers, 1, "duplicate offer must not re-answer");
    assert!(from_local.try_recv().is_err(), "only one answer on the wire");
}

#[tokio::test]
async fn close_says_goodbye_to_the_peer() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut alice = start_side(&hub, "alice", "bob", CoupleConfig::default());
    let mut bob = start_side(&hub, "bob", "alice", CoupleConfig::responder());

    drive_to_active(&mut alice, &mut bob).await;

    alice.handle.close();
    assert_eq!(next_event(&mut alice.events).await, LifecycleEvent::Closed);
    assert_eq!(next_event(&mut bob.events).await, LifecycleEvent::Closed);

    wait_until(|| bob.media.calls().contains(&MockCall::Close)).await;
    assert_eq!(alice.handle.state(), MonitorState::Closed);
    assert_eq!(bob.handle.state(), MonitorState::Closed);
}

#[tokio::test]
async fn reconnection_within_grace_keeps_the_session() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut alice = start_side(&hub, "alice", "bob", CoupleConfig::default());
    let mut bob = start_side(&hub, "bob", "alice", CoupleConfig::responder());

    drive_to_active(&mut alice, &mut bob).await;

    bob.media.push_state(RawConnectionState::Disconnected);
    assert_eq!(next_event(&mut bob.events).await, LifecycleEvent::Disconnected);

    bob.media.push_state(RawConnectionState::Connected);
    assert_eq!(next_event(&mut bob.events).await, LifecycleEvent::Active);

    assert!(bob.events.try_recv().is_err(), "recovery must not close the session");
    assert_eq!(bob.handle.state(), MonitorState::Active);
}

#[tokio::test]
async fn unrecovered_disconnection_fails_the_session() {
    init_tracing();
    let grace = Duration::from_millis(100);
    let hub = MemoryHub::new();
    let mut alice = start_side(&hub, "alice", "bob", CoupleConfig::default());
    let mut bob = start_side(
        &hub,
        "bob",
        "alice",
        CoupleConfig::responder().with_grace_period(grace),
    );

    drive_to_active(&mut alice, &mut bob).await;

    bob.media.push_state(RawConnectionState::Disconnected);
    assert_eq!(next_event(&mut bob.events).await, LifecycleEvent::Disconnected);
    assert_eq!(
        next_event(&mut bob.events).await,
        LifecycleEvent::Error(CoupleError::Timeout(grace))
    );
    assert_eq!(next_event(&mut bob.events).await, LifecycleEvent::Closed);
    assert_eq!(bob.handle.state(), MonitorState::Failed);

    // The other side is untouched by its peer's local failure.
    assert!(alice.events.try_recv().is_err());
}

#[tokio::test]
async fn silent_peer_times_out_negotiation() {
    init_tracing();
    let window = Duration::from_millis(100);
    let hub = MemoryHub::new();
    hub.endpoint("mute");

    let mut local = start_side(
        &hub,
        "local",
        "mute",
        CoupleConfig::default().with_negotiation_timeout(window),
    );

    assert_eq!(next_event(&mut local.events).await, LifecycleEvent::Negotiating);
    assert_eq!(
        next_event(&mut local.events).await,
        LifecycleEvent::Error(CoupleError::NegotiationTimeout(window))
    );
    assert_eq!(next_event(&mut local.events).await, LifecycleEvent::Closed);
    assert_eq!(local.handle.state(), MonitorState::Failed);
}

#[tokio::test]
async fn unreachable_peer_surfaces_channel_error() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut config = CoupleConfig::default();
    config.send_retries = 1;
    config.send_retry_delay = Duration::from_millis(10);

    // "ghost" never registers with the relay.
    let mut local = start_side(&hub, "local", "ghost", config);

    assert_eq!(next_event(&mut local.events).await, LifecycleEvent::Negotiating);
    assert!(matches!(
        next_event(&mut local.events).await,
        LifecycleEvent::Error(CoupleError::ChannelUnavailable(_))
    ));
    assert_eq!(next_event(&mut local.events).await, LifecycleEvent::Closed);
    assert_eq!(local.handle.state(), MonitorState::Failed);
}

#[tokio::test]
async fn rejected_description_fails_only_its_session() {
    init_tracing();
    let hub = MemoryHub::new();
    let mut alice = start_side(&hub, "alice", "bob", CoupleConfig::default());
    let mut bob = start_side(&hub, "bob", "alice", CoupleConfig::responder());
    drive_to_active(&mut alice, &mut bob).await;

    let carol_media = MockMedia::new("carol");
    carol_media.reject_descriptions("incompatible description");
    let carol = couple_with_config(
        carol_media.clone(),
        "dave",
        hub.endpoint("carol"),
        CoupleConfig::responder(),
    );
    let mut carol_events = carol.events().expect("event stream");
    let _dave = start_side(&hub, "dave", "carol", CoupleConfig::default());

    assert_eq!(next_event(&mut carol_events).await, LifecycleEvent::Negotiating);
    assert!(matches!(
        next_event(&mut carol_events).await,
        LifecycleEvent::Error(CoupleError::NegotiationRejected(_))
    ));
    assert_eq!(next_event(&mut carol_events).await, LifecycleEvent::Closed);
    assert_eq!(carol.state(), MonitorState::Failed);

    // The healthy pair never noticed.
    assert!(alice.events.try_recv().is_err());
    assert!(bob.events.try_recv().is_err());
    assert_eq!(alice.handle.state(), MonitorState::Active);
    assert_eq!(bob.handle.state(), MonitorState::Active);
}
