//! Signaling envelopes, client, and two-party room server
//!
//! The session core treats signaling as an injected message bus: it consumes
//! and produces [`SignalingMessage`] envelopes and never touches the wire.
//! This module additionally provides the WebSocket client used by
//! applications and the compact room server used by deployments and
//! integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SessionError;

/// A two-party room never holds more than two participants
pub const ROOM_CAPACITY: usize = 2;

/// A participant as seen in the room roster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomUser {
    pub user_id: Uuid,
    pub nickname: String,
    /// Capability tag: this peer is willing to forward relay traffic
    #[serde(default)]
    pub relay_capable: bool,
}

/// Signaling envelopes
///
/// Negotiation payloads (`sdp`, `candidate`) are opaque strings; the
/// envelope only routes them to the addressed participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    // Client -> Server
    JoinRoom {
        room_id: String,
        user_id: Uuid,
        nickname: String,
        #[serde(default)]
        relay_capable: bool,
    },
    LeaveRoom,

    // Routed peer-to-peer through the server
    Offer {
        target_id: Uuid,
        from_id: Uuid,
        sdp: String,
    },
    Answer {
        target_id: Uuid,
        from_id: Uuid,
        sdp: String,
    },
    IceCandidate {
        target_id: Uuid,
        from_id: Uuid,
        candidate: String,
    },

    // Server -> Client
    RoomStatus {
        users: Vec<RoomUser>,
        can_join: bool,
    },
    UserJoined {
        user_id: Uuid,
        nickname: String,
        #[serde(default)]
        relay_capable: bool,
    },
    UserLeft {
        user_id: Uuid,
    },
    Error {
        message: String,
    },
}

impl SignalingMessage {
    /// The participant this envelope is addressed to, if it is routed
    pub fn target(&self) -> Option<Uuid> {
        match self {
            SignalingMessage::Offer { target_id, .. }
            | SignalingMessage::Answer { target_id, .. }
            | SignalingMessage::IceCandidate { target_id, .. } => Some(*target_id),
            _ => None,
        }
    }
}

struct RoomMember {
    info: RoomUser,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct Room {
    members: HashMap<Uuid, RoomMember>,
}

impl Room {
    fn roster(&self) -> Vec<RoomUser> {
        self.members.values().map(|m| m.info.clone()).collect()
    }
}

type Rooms = Arc<RwLock<HashMap<String, Room>>>;

/// Two-party signaling room server
pub struct SignalingServer {
    rooms: Rooms,
}

impl SignalingServer {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Accept WebSocket connections until the task is cancelled
    pub async fn run(&self, addr: &str) -> Result<(), SessionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SessionError::SignalingUnavailable(format!("bind failed: {e}")))?;

        info!("signaling server listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("signaling connection from {}", peer_addr);
                    let rooms = self.rooms.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, rooms).await {
                            warn!("signaling connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }

    /// Number of rooms currently tracked
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_connection(stream: TcpStream, rooms: Rooms) -> Result<(), SessionError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| SessionError::SignalingUnavailable(format!("handshake failed: {e}")))?;

    let (mut write, mut read) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let mut current_room: Option<String> = None;
    let mut current_user: Option<Uuid> = None;

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("invalid signaling message: {}", e);
                                continue;
                            }
                        };

                        let reply = dispatch(
                            msg,
                            &rooms,
                            &out_tx,
                            &mut current_room,
                            &mut current_user,
                        )
                        .await;

                        if let Some(reply) = reply {
                            let json = match serde_json::to_string(&reply) {
                                Ok(json) => json,
                                Err(e) => {
                                    error!("reply serialize failed: {}", e);
                                    continue;
                                }
                            };
                            if write.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            routed = out_rx.recv() => {
                match routed {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("routed serialize failed: {}", e);
                                continue;
                            }
                        };
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let (Some(room_id), Some(user_id)) = (current_room, current_user) {
        depart(&rooms, &room_id, user_id).await;
    }

    Ok(())
}

async fn dispatch(
    msg: SignalingMessage,
    rooms: &Rooms,
    out_tx: &mpsc::UnboundedSender<SignalingMessage>,
    current_room: &mut Option<String>,
    current_user: &mut Option<Uuid>,
) -> Option<SignalingMessage> {
    match msg {
        SignalingMessage::JoinRoom {
            room_id,
            user_id,
            nickname,
            relay_capable,
        } => {
            let mut rooms_guard = rooms.write().await;
            let room = rooms_guard.entry(room_id.clone()).or_default();

            if room.members.len() >= ROOM_CAPACITY && !room.members.contains_key(&user_id) {
                return Some(SignalingMessage::RoomStatus {
                    users: room.roster(),
                    can_join: false,
                });
            }

            let info = RoomUser {
                user_id,
                nickname: nickname.clone(),
                relay_capable,
            };

            for member in room.members.values() {
                let _ = member.tx.send(SignalingMessage::UserJoined {
                    user_id,
                    nickname: nickname.clone(),
                    relay_capable,
                });
            }

            room.members.insert(
                user_id,
                RoomMember {
                    info,
                    tx: out_tx.clone(),
                },
            );

            *current_room = Some(room_id.clone());
            *current_user = Some(user_id);

            info!("user {} joined room {}", user_id, room_id);

            Some(SignalingMessage::RoomStatus {
                users: room.roster(),
                can_join: true,
            })
        }

        SignalingMessage::LeaveRoom => {
            if let (Some(room_id), Some(user_id)) = (current_room.take(), current_user.take()) {
                depart(rooms, &room_id, user_id).await;
            }
            None
        }

        // Routed envelopes: deliver to the addressed member of the
        // sender's room, drop with a diagnostic otherwise
        routed @ (SignalingMessage::Offer { .. }
        | SignalingMessage::Answer { .. }
        | SignalingMessage::IceCandidate { .. }) => {
            let target = routed.target()?;
            let room_id = current_room.as_ref()?;
            let rooms_guard = rooms.read().await;
            match rooms_guard
                .get(room_id)
                .and_then(|room| room.members.get(&target))
            {
                Some(member) => {
                    let _ = member.tx.send(routed);
                }
                None => debug!("dropping envelope for unknown target {}", target),
            }
            None
        }

        // Server -> client shapes are ignored when received
        _ => None,
    }
}

async fn depart(rooms: &Rooms, room_id: &str, user_id: Uuid) {
    let mut rooms_guard = rooms.write().await;
    if let Some(room) = rooms_guard.get_mut(room_id) {
        room.members.remove(&user_id);
        for member in room.members.values() {
            let _ = member.tx.send(SignalingMessage::UserLeft { user_id });
        }
        if room.members.is_empty() {
            rooms_guard.remove(room_id);
            info!("room {} removed (empty)", room_id);
        } else {
            info!("user {} left room {}", user_id, room_id);
        }
    }
}

/// Client for connecting to a signaling server
pub struct SignalingClient {
    server_url: String,
}

impl SignalingClient {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Open a WebSocket connection to the server
    pub async fn connect(&self) -> Result<SignalingConnection, SessionError> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| SessionError::SignalingUnavailable(format!("connect failed: {e}")))?;

        debug!("connected to signaling server {}", self.server_url);

        Ok(SignalingConnection { ws_stream })
    }
}

/// An open connection to the signaling server
pub struct SignalingConnection {
    ws_stream:
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

impl SignalingConnection {
    /// Send an envelope
    pub async fn send(&mut self, msg: SignalingMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(&msg)
            .map_err(|e| SessionError::SignalingUnavailable(format!("serialize failed: {e}")))?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::SignalingUnavailable(format!("send failed: {e}")))?;

        Ok(())
    }

    /// Receive the next envelope
    pub async fn recv(&mut self) -> Result<SignalingMessage, SessionError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        SessionError::SignalingUnavailable(format!("deserialize failed: {e}"))
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SessionError::SignalingUnavailable(
                        "connection closed".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    return Err(SessionError::SignalingUnavailable(format!(
                        "receive failed: {e}"
                    )));
                }
                _ => continue,
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| SessionError::SignalingUnavailable(format!("close failed: {e}")))?;
        Ok(())
    }

    /// Split into the channel pair a [`crate::session::PeerSession`] is
    /// constructed with, pumping both directions until either side closes
    pub fn into_channels(
        self,
    ) -> (
        mpsc::Sender<SignalingMessage>,
        mpsc::Receiver<SignalingMessage>,
        tokio::task::JoinHandle<()>,
    ) {
        let (out_tx, mut out_rx) = mpsc::channel::<SignalingMessage>(64);
        let (in_tx, in_rx) = mpsc::channel::<SignalingMessage>(64);
        let (mut write, mut read) = self.ws_stream.split();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => {
                        match outbound {
                            Some(msg) => {
                                let json = match serde_json::to_string(&msg) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        error!("envelope serialize failed: {}", e);
                                        continue;
                                    }
                                };
                                if write.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<SignalingMessage>(&text) {
                                    Ok(msg) => {
                                        if in_tx.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("invalid envelope: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!("signaling stream error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            debug!("signaling pump stopped");
        });

        (out_tx, in_rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let msg = SignalingMessage::Offer {
            target_id: Uuid::new_v4(),
            from_id: Uuid::new_v4(),
            sdp: "opaque-description".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"offer\""));

        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalingMessage::Offer { sdp, .. } => assert_eq!(sdp, "opaque-description"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_wire_names() {
        let msg = SignalingMessage::IceCandidate {
            target_id: Uuid::new_v4(),
            from_id: Uuid::new_v4(),
            candidate: "host 127.0.0.1:1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"ice-candidate\""));

        let status = SignalingMessage::RoomStatus {
            users: vec![],
            can_join: true,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"room-status\""));
    }

    #[test]
    fn test_target_extraction() {
        let target = Uuid::new_v4();
        let msg = SignalingMessage::Answer {
            target_id: target,
            from_id: Uuid::new_v4(),
            sdp: String::new(),
        };
        assert_eq!(msg.target(), Some(target));
        assert_eq!(SignalingMessage::LeaveRoom.target(), None);
    }
}
