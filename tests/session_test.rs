//! Session state machine scenarios: discovery, negotiation, reconnect
//! budget, and candidate queueing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use pairlink::session::SessionDescription;
use pairlink::{
    ConnectionState, MessageKind, PeerSession, SendOutcome, SessionConfig, SessionError,
    SessionEvent, SignalingMessage, TransportKind,
};

fn test_config() -> SessionConfig {
    SessionConfig {
        enable_reflexive_discovery: false,
        keepalive_interval_ms: 200,
        ..SessionConfig::default()
    }
}

async fn wait_for_state(
    session: &PeerSession,
    wanted: ConnectionState,
    limit: Duration,
) -> Result<(), String> {
    let mut rx = session.subscribe_state();
    timeout(limit, rx.wait_for(|state| *state == wanted))
        .await
        .map_err(|_| format!("timed out waiting for {wanted:?}, last state {:?}", session.state()))?
        .map_err(|_| "session actor stopped".to_string())?;
    Ok(())
}

/// Forward every envelope from one session's outbox to the other's inbox,
/// counting offers and recording who sent them.
fn route(
    mut from: mpsc::Receiver<SignalingMessage>,
    to: mpsc::Sender<SignalingMessage>,
    offers: Arc<AtomicUsize>,
    offer_senders: Arc<parking_lot::Mutex<Vec<Uuid>>>,
) {
    tokio::spawn(async move {
        while let Some(msg) = from.recv().await {
            if let SignalingMessage::Offer { from_id, .. } = &msg {
                offers.fetch_add(1, Ordering::SeqCst);
                offer_senders.lock().push(*from_id);
            }
            if to.send(msg).await.is_err() {
                break;
            }
        }
    });
}

/// Two participants discover each other: exactly one offer is emitted,
/// by the participant with the lower id, and both reach `Connected`.
#[tokio::test]
async fn test_single_offer_from_lower_id() {
    let (a_out_tx, mut a_out_rx) = mpsc::channel(64);
    let (a_in_tx, a_in_rx) = mpsc::channel(64);
    let (b_out_tx, mut b_out_rx) = mpsc::channel(64);
    let (b_in_tx, b_in_rx) = mpsc::channel(64);

    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();

    let a = PeerSession::spawn(test_config(), id_a, "alice", a_out_tx, a_in_rx);
    let b = PeerSession::spawn(test_config(), id_b, "bob", b_out_tx, b_in_rx);

    a.join("room").await.unwrap();
    b.join("room").await.unwrap();

    // consume the join-room envelopes the way a server would
    match a_out_rx.recv().await {
        Some(SignalingMessage::JoinRoom { .. }) => {}
        other => panic!("expected join-room from a, got {other:?}"),
    }
    match b_out_rx.recv().await {
        Some(SignalingMessage::JoinRoom { .. }) => {}
        other => panic!("expected join-room from b, got {other:?}"),
    }

    // announce each participant to the other within the discovery window
    a_in_tx
        .send(SignalingMessage::UserJoined {
            user_id: id_b,
            nickname: "bob".to_string(),
            relay_capable: false,
        })
        .await
        .unwrap();
    b_in_tx
        .send(SignalingMessage::UserJoined {
            user_id: id_a,
            nickname: "alice".to_string(),
            relay_capable: false,
        })
        .await
        .unwrap();

    let offers = Arc::new(AtomicUsize::new(0));
    let offer_senders = Arc::new(parking_lot::Mutex::new(Vec::new()));
    route(a_out_rx, b_in_tx.clone(), offers.clone(), offer_senders.clone());
    route(b_out_rx, a_in_tx.clone(), offers.clone(), offer_senders.clone());

    wait_for_state(&a, ConnectionState::Connected, Duration::from_secs(15))
        .await
        .unwrap();
    wait_for_state(&b, ConnectionState::Connected, Duration::from_secs(15))
        .await
        .unwrap();

    assert_eq!(offers.load(Ordering::SeqCst), 1, "exactly one offer");
    let expected_initiator = id_a.min(id_b);
    assert_eq!(offer_senders.lock().as_slice(), [expected_initiator]);

    a.leave().await.unwrap();
    b.leave().await.unwrap();
}

/// Messages sent while disconnected are delivered in order, without
/// duplicates, once the session connects.
#[tokio::test]
async fn test_buffered_messages_flush_in_order() {
    let (a_out_tx, mut a_out_rx) = mpsc::channel(64);
    let (a_in_tx, a_in_rx) = mpsc::channel(64);
    let (b_out_tx, mut b_out_rx) = mpsc::channel(64);
    let (b_in_tx, b_in_rx) = mpsc::channel(64);

    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();

    let a = PeerSession::spawn(test_config(), id_a, "alice", a_out_tx, a_in_rx);
    let b = PeerSession::spawn(test_config(), id_b, "bob", b_out_tx, b_in_rx);

    // queued while nothing is connected
    for i in 0..3 {
        let outcome = a
            .send_message(MessageKind::Text, &format!("queued {i}"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Buffered);
    }

    let mut b_messages = b.subscribe_messages();

    a.join("room").await.unwrap();
    b.join("room").await.unwrap();
    assert!(matches!(
        a_out_rx.recv().await,
        Some(SignalingMessage::JoinRoom { .. })
    ));
    assert!(matches!(
        b_out_rx.recv().await,
        Some(SignalingMessage::JoinRoom { .. })
    ));

    a_in_tx
        .send(SignalingMessage::UserJoined {
            user_id: id_b,
            nickname: "bob".to_string(),
            relay_capable: false,
        })
        .await
        .unwrap();
    b_in_tx
        .send(SignalingMessage::UserJoined {
            user_id: id_a,
            nickname: "alice".to_string(),
            relay_capable: false,
        })
        .await
        .unwrap();

    let offers = Arc::new(AtomicUsize::new(0));
    let senders = Arc::new(parking_lot::Mutex::new(Vec::new()));
    route(a_out_rx, b_in_tx.clone(), offers.clone(), senders.clone());
    route(b_out_rx, a_in_tx.clone(), offers, senders);

    wait_for_state(&a, ConnectionState::Connected, Duration::from_secs(15))
        .await
        .unwrap();

    for i in 0..3 {
        let message = timeout(Duration::from_secs(5), b_messages.recv())
            .await
            .expect("flush should deliver buffered messages")
            .unwrap();
        assert_eq!(message.content, format!("queued {i}"));
    }

    // a live send after the flush arrives after the queued batch
    let outcome = a.send_message(MessageKind::Caption, "live").await.unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
    let message = timeout(Duration::from_secs(5), b_messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.content, "live");

    a.leave().await.unwrap();
    b.leave().await.unwrap();
}

/// With `max_retries = 3` and a remote that never offers, the session
/// passes through `Reconnecting` exactly three times and ends `Failed`,
/// with no further automatic attempts.
#[tokio::test]
async fn test_retry_budget_exhaustion() {
    let config = SessionConfig {
        max_retries: 3,
        connection_timeout_ms: 300,
        reconnect_backoff_base_ms: 50,
        reconnect_backoff_cap_ms: 400,
        enable_reflexive_discovery: false,
        ..SessionConfig::default()
    };

    // remote has the lower id, so the local session is the answerer and
    // waits for an offer that never arrives
    let local_id = Uuid::from_u128(0xFFFF_FFFF_FFFF_FFFF);
    let remote_id = Uuid::from_u128(1);

    let (out_tx, _out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let session = PeerSession::spawn(config, local_id, "carol", out_tx, in_rx);
    let mut events = session.subscribe_events();

    session.join("room").await.unwrap();
    in_tx
        .send(SignalingMessage::UserJoined {
            user_id: remote_id,
            nickname: "ghost".to_string(),
            relay_capable: false,
        })
        .await
        .unwrap();

    wait_for_state(&session, ConnectionState::Failed, Duration::from_secs(20))
        .await
        .unwrap();

    let mut reconnecting = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged {
            to: ConnectionState::Reconnecting,
            ..
        } = event
        {
            reconnecting += 1;
        }
    }
    assert_eq!(reconnecting, 3, "exactly max_retries reconnect attempts");

    // no further automatic attempts out of the terminal state
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(session.state(), ConnectionState::Failed);

    // leave works even from Failed
    session.leave().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);
}

/// Candidates that arrive before the offer are queued and drained into
/// the transport: the session connects even though the offer itself
/// carries no candidates.
#[tokio::test]
async fn test_early_candidates_are_queued_not_lost() {
    let config = test_config();
    let local_id = Uuid::from_u128(0xAAAA);
    let remote_id = Uuid::from_u128(0x1);

    let (out_tx, mut out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let session = PeerSession::spawn(config, local_id, "dave", out_tx, in_rx);

    // the "remote peer" is a bare transport driven by the test
    let (remote_transport, _remote_events, _remote_data) = pairlink::PeerTransport::bind(
        TransportKind::Direct,
        remote_id,
        0,
        Duration::from_millis(200),
        false,
    )
    .await
    .unwrap();

    session.join("room").await.unwrap();
    assert!(matches!(
        out_rx.recv().await,
        Some(SignalingMessage::JoinRoom { .. })
    ));

    // candidate first, then an offer with an empty candidate list: the
    // session can only connect if the early candidate was preserved
    in_tx
        .send(SignalingMessage::IceCandidate {
            target_id: local_id,
            from_id: remote_id,
            candidate: format!("host 127.0.0.1:{}", remote_transport.local_addr().port()),
        })
        .await
        .unwrap();

    let offer_sdp = SessionDescription {
        participant_id: remote_id,
        candidates: vec![],
        relay: None,
    };
    in_tx
        .send(SignalingMessage::Offer {
            target_id: local_id,
            from_id: remote_id,
            sdp: serde_json::to_string(&offer_sdp).unwrap(),
        })
        .await
        .unwrap();

    // harvest the answer and feed its candidates to the bare transport
    let answer_sdp = loop {
        match timeout(Duration::from_secs(5), out_rx.recv()).await {
            Ok(Some(SignalingMessage::Answer { sdp, .. })) => break sdp,
            Ok(Some(_)) => continue,
            other => panic!("expected an answer, got {other:?}"),
        }
    };
    let description = SessionDescription::parse(&answer_sdp).unwrap();
    for candidate in &description.candidates {
        let parsed = pairlink::candidate::IceCandidate::parse(candidate).unwrap();
        remote_transport.add_remote_candidate(parsed.addr);
    }

    let establishing = {
        let transport = remote_transport.clone();
        tokio::spawn(async move { transport.establish(Duration::from_secs(10)).await })
    };

    wait_for_state(&session, ConnectionState::Connected, Duration::from_secs(15))
        .await
        .unwrap();
    establishing.await.unwrap().unwrap();

    session.leave().await.unwrap();
}

/// A malformed offer counts as a failed attempt and enters the
/// reconnect cycle rather than killing the session outright.
#[tokio::test]
async fn test_malformed_offer_triggers_reconnect_cycle() {
    let config = SessionConfig {
        max_retries: 1,
        connection_timeout_ms: 300,
        reconnect_backoff_base_ms: 50,
        enable_reflexive_discovery: false,
        ..SessionConfig::default()
    };
    let local_id = Uuid::from_u128(0xBBBB);
    let remote_id = Uuid::from_u128(0x2);

    let (out_tx, _out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let session = PeerSession::spawn(config, local_id, "erin", out_tx, in_rx);

    session.join("room").await.unwrap();
    in_tx
        .send(SignalingMessage::Offer {
            target_id: local_id,
            from_id: remote_id,
            sdp: "definitely not a description".to_string(),
        })
        .await
        .unwrap();

    // one retry, then the budget is spent and the session fails
    wait_for_state(&session, ConnectionState::Failed, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(session.last_error().is_some());
}

/// Joining a closed session is rejected with `SessionError::Closed`.
#[tokio::test]
async fn test_closed_session_rejects_join() {
    let (out_tx, _out_rx) = mpsc::channel(8);
    let (_in_tx, in_rx) = mpsc::channel(8);
    let session = PeerSession::spawn(test_config(), Uuid::new_v4(), "frank", out_tx, in_rx);

    session.join("room").await.unwrap();
    session.leave().await.unwrap();

    assert!(matches!(
        session.join("room").await,
        Err(SessionError::Closed)
    ));
}
