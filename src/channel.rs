//! Reliable application message channel
//!
//! A thin framing and buffering layer over the transport's data channel.
//! Messages sent while disconnected are buffered in order and flushed
//! exactly once on the next connect; a malformed incoming payload is
//! dropped with a diagnostic rather than surfaced as a channel error.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::transport::PeerTransport;

/// Application message kinds riding the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    Caption,
}

/// The channel's wire envelope: `content` is opaque to the channel;
/// chat, file transfer, and captions own its internal structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
}

/// Outcome of a send call
///
/// `Buffered` is not an error; the message is queued and the caller
/// must not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Buffered,
}

/// Ordered, buffered message channel over the active transport
pub struct MessageChannel {
    transport: Option<Arc<PeerTransport>>,
    buffer: VecDeque<ChannelMessage>,
    incoming_tx: broadcast::Sender<ChannelMessage>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(128);
        Self {
            transport: None,
            buffer: VecDeque::new(),
            incoming_tx,
            pump: None,
        }
    }

    /// Subscribe to incoming messages
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.incoming_tx.subscribe()
    }

    /// Clone the incoming fan-out so detached consumers can subscribe
    /// without holding the channel itself
    pub fn incoming_sender(&self) -> broadcast::Sender<ChannelMessage> {
        self.incoming_tx.clone()
    }

    /// Number of messages waiting for the next connect
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Send a message, buffering it when the channel is not open
    pub async fn send(
        &mut self,
        kind: MessageKind,
        content: &str,
    ) -> Result<SendOutcome, SessionError> {
        let message = ChannelMessage {
            kind,
            content: content.to_string(),
        };

        if let Some(transport) = self.transport.as_ref().filter(|t| t.is_connected()) {
            transmit(transport, &message).await?;
            return Ok(SendOutcome::Sent);
        }

        trace!("buffering {:?} message while disconnected", kind);
        self.buffer.push_back(message);
        Ok(SendOutcome::Buffered)
    }

    /// Attach a freshly connected transport
    ///
    /// Starts the incoming dispatch pump and flushes the send buffer in
    /// enqueue order. Each entry is removed only after successful
    /// transmission; a mid-flush failure keeps the remainder buffered for
    /// the next connect.
    pub async fn attach(&mut self, transport: Arc<PeerTransport>, data_rx: mpsc::Receiver<Vec<u8>>) {
        self.detach();

        self.start_pump(data_rx);
        self.transport = Some(transport.clone());

        while let Some(message) = self.buffer.front() {
            match transmit(&transport, message).await {
                Ok(()) => {
                    self.buffer.pop_front();
                }
                Err(e) => {
                    warn!(
                        "flush interrupted ({}); {} message(s) remain buffered",
                        e,
                        self.buffer.len()
                    );
                    return;
                }
            }
        }

        debug!("send buffer flushed");
    }

    /// Detach from the current transport; subsequent sends buffer
    pub fn detach(&mut self) {
        self.transport = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn start_pump(&mut self, mut data_rx: mpsc::Receiver<Vec<u8>>) {
        let incoming_tx = self.incoming_tx.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(payload) = data_rx.recv().await {
                match serde_json::from_slice::<ChannelMessage>(&payload) {
                    Ok(message) => {
                        // no subscribers is fine; the value is simply dropped
                        let _ = incoming_tx.send(message);
                    }
                    Err(e) => {
                        // one bad message must not kill the session
                        warn!("dropping malformed channel payload: {}", e);
                    }
                }
            }
        }));
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn transmit(
    transport: &Arc<PeerTransport>,
    message: &ChannelMessage,
) -> Result<(), SessionError> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| SessionError::Transport(format!("message serialize failed: {e}")))?;
    transport.send_data(&payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let message = ChannelMessage {
            kind: MessageKind::Caption,
            content: "hello".to_string(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"type":"caption","content":"hello"}"#);
    }

    #[tokio::test]
    async fn test_send_without_transport_buffers_in_order() {
        let mut channel = MessageChannel::new();

        for i in 0..3 {
            let outcome = channel
                .send(MessageKind::Text, &format!("message {i}"))
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Buffered);
        }

        assert_eq!(channel.buffered_len(), 3);
        let contents: Vec<&str> = channel.buffer.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["message 0", "message 1", "message 2"]);
    }

    #[tokio::test]
    async fn test_malformed_incoming_is_dropped() {
        let mut channel = MessageChannel::new();
        let mut incoming = channel.subscribe();

        let (tx, rx) = mpsc::channel(8);
        channel.start_pump(rx);

        tx.send(b"not json at all".to_vec()).await.unwrap();
        tx.send(serde_json::to_vec(&ChannelMessage {
            kind: MessageKind::Text,
            content: "survives".to_string(),
        })
        .unwrap())
        .await
        .unwrap();

        // the good message arrives even though a bad one preceded it
        let message = tokio::time::timeout(std::time::Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.content, "survives");
    }
}
