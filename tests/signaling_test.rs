//! Signaling server flow: join, roster, two-party cap, routing, leave.

use std::net::TcpListener;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use pairlink::{SignalingClient, SignalingMessage, SignalingServer};

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local address")
        .port()
}

async fn start_test_server() -> String {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");
    let server = SignalingServer::new();
    tokio::spawn(async move {
        let _ = server.run(&addr).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn join(
    connection: &mut pairlink::SignalingConnection,
    room: &str,
    user_id: Uuid,
    nickname: &str,
) -> SignalingMessage {
    connection
        .send(SignalingMessage::JoinRoom {
            room_id: room.to_string(),
            user_id,
            nickname: nickname.to_string(),
            relay_capable: false,
        })
        .await
        .unwrap();
    timeout(Duration::from_secs(2), connection.recv())
        .await
        .expect("join reply")
        .unwrap()
}

#[tokio::test]
async fn test_join_returns_roster() {
    let url = start_test_server().await;
    let mut alice = SignalingClient::new(&url).connect().await.unwrap();

    let alice_id = Uuid::new_v4();
    let reply = join(&mut alice, "room-1", alice_id, "alice").await;

    match reply {
        SignalingMessage::RoomStatus { users, can_join } => {
            assert!(can_join);
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].user_id, alice_id);
            assert_eq!(users[0].nickname, "alice");
        }
        other => panic!("expected room-status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_join_announced_to_first() {
    let url = start_test_server().await;
    let mut alice = SignalingClient::new(&url).connect().await.unwrap();
    let mut bob = SignalingClient::new(&url).connect().await.unwrap();

    let alice_id = Uuid::new_v4();
    let bob_id = Uuid::new_v4();

    join(&mut alice, "room-1", alice_id, "alice").await;
    let reply = join(&mut bob, "room-1", bob_id, "bob").await;

    match reply {
        SignalingMessage::RoomStatus { users, can_join } => {
            assert!(can_join);
            assert_eq!(users.len(), 2);
        }
        other => panic!("expected room-status, got {other:?}"),
    }

    let announcement = timeout(Duration::from_secs(2), alice.recv())
        .await
        .expect("user-joined announcement")
        .unwrap();
    match announcement {
        SignalingMessage::UserJoined { user_id, nickname, .. } => {
            assert_eq!(user_id, bob_id);
            assert_eq!(nickname, "bob");
        }
        other => panic!("expected user-joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_third_participant_cannot_join() {
    let url = start_test_server().await;
    let mut alice = SignalingClient::new(&url).connect().await.unwrap();
    let mut bob = SignalingClient::new(&url).connect().await.unwrap();
    let mut carol = SignalingClient::new(&url).connect().await.unwrap();

    join(&mut alice, "room-1", Uuid::new_v4(), "alice").await;
    join(&mut bob, "room-1", Uuid::new_v4(), "bob").await;
    let reply = join(&mut carol, "room-1", Uuid::new_v4(), "carol").await;

    match reply {
        SignalingMessage::RoomStatus { users, can_join } => {
            assert!(!can_join, "two-party room must refuse a third participant");
            assert_eq!(users.len(), 2);
        }
        other => panic!("expected room-status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offer_routed_to_target() {
    let url = start_test_server().await;
    let mut alice = SignalingClient::new(&url).connect().await.unwrap();
    let mut bob = SignalingClient::new(&url).connect().await.unwrap();

    let alice_id = Uuid::new_v4();
    let bob_id = Uuid::new_v4();
    join(&mut alice, "room-1", alice_id, "alice").await;
    join(&mut bob, "room-1", bob_id, "bob").await;

    // drain alice's user-joined announcement
    let _ = timeout(Duration::from_secs(2), alice.recv()).await.unwrap();

    alice
        .send(SignalingMessage::Offer {
            target_id: bob_id,
            from_id: alice_id,
            sdp: "opaque".to_string(),
        })
        .await
        .unwrap();

    let routed = timeout(Duration::from_secs(2), bob.recv())
        .await
        .expect("routed offer")
        .unwrap();
    match routed {
        SignalingMessage::Offer { from_id, sdp, .. } => {
            assert_eq!(from_id, alice_id);
            assert_eq!(sdp, "opaque");
        }
        other => panic!("expected offer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_announces_user_left() {
    let url = start_test_server().await;
    let mut alice = SignalingClient::new(&url).connect().await.unwrap();
    let mut bob = SignalingClient::new(&url).connect().await.unwrap();

    let alice_id = Uuid::new_v4();
    let bob_id = Uuid::new_v4();
    join(&mut alice, "room-1", alice_id, "alice").await;
    join(&mut bob, "room-1", bob_id, "bob").await;
    let _ = timeout(Duration::from_secs(2), alice.recv()).await.unwrap();

    bob.close().await.unwrap();

    let departure = timeout(Duration::from_secs(2), alice.recv())
        .await
        .expect("user-left announcement")
        .unwrap();
    match departure {
        SignalingMessage::UserLeft { user_id } => assert_eq!(user_id, bob_id),
        other => panic!("expected user-left, got {other:?}"),
    }
}

/// Full end-to-end run over a real signaling server: both sessions reach
/// `Connected` and exchange a message.
#[tokio::test]
async fn test_sessions_connect_via_server() {
    let url = start_test_server().await;

    let config = pairlink::SessionConfig {
        enable_reflexive_discovery: false,
        keepalive_interval_ms: 200,
        ..pairlink::SessionConfig::default()
    };

    let (a_out, a_in, _a_pump) = SignalingClient::new(&url)
        .connect()
        .await
        .unwrap()
        .into_channels();
    let (b_out, b_in, _b_pump) = SignalingClient::new(&url)
        .connect()
        .await
        .unwrap()
        .into_channels();

    let a = pairlink::PeerSession::spawn(config.clone(), Uuid::new_v4(), "alice", a_out, a_in);
    let b = pairlink::PeerSession::spawn(config, Uuid::new_v4(), "bob", b_out, b_in);

    a.join("e2e-room").await.unwrap();
    b.join("e2e-room").await.unwrap();

    let mut a_state = a.subscribe_state();
    let mut b_state = b.subscribe_state();
    timeout(Duration::from_secs(20), a_state.wait_for(|s| s.is_connected()))
        .await
        .expect("alice connects")
        .unwrap();
    timeout(Duration::from_secs(20), b_state.wait_for(|s| s.is_connected()))
        .await
        .expect("bob connects")
        .unwrap();

    let mut b_messages = b.subscribe_messages();
    let outcome = a
        .send_message(pairlink::MessageKind::Text, "hello over the wire")
        .await
        .unwrap();
    assert_eq!(outcome, pairlink::SendOutcome::Sent);

    let message = timeout(Duration::from_secs(5), b_messages.recv())
        .await
        .expect("message delivery")
        .unwrap();
    assert_eq!(message.content, "hello over the wire");

    a.leave().await.unwrap();
    b.leave().await.unwrap();
}
