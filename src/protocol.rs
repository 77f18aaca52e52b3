//! Wire frames for the peer transport
//!
//! Frame format (8-byte header):
//! - version: 1 byte
//! - kind: 1 byte
//! - sequence: 4 bytes (big-endian)
//! - payload length: 2 bytes (big-endian)
//!
//! Control frames carry bincode-encoded payload structs; data frames carry
//! opaque application bytes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum frame size kept under a conservative path MTU
pub const MAX_FRAME_SIZE: usize = 1400;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Opaque application data (reliable message channel payloads)
    Data = 0x01,
    /// Keep-alive
    KeepAlive = 0x02,
    /// Latency measurement ping
    LatencyPing = 0x03,
    /// Latency measurement pong
    LatencyPong = 0x04,
    /// Connectivity / benchmark probe
    Probe = 0x05,
    /// Probe acknowledgment
    ProbeAck = 0x06,
    /// Relay connection request
    RelayRequest = 0x10,
    /// Relay connection response
    RelayResponse = 0x11,
    /// Relayed opaque payload
    RelayData = 0x12,
    /// Relay connection teardown notice
    RelayClose = 0x13,
    /// Endpoint attachment to an accepted relay connection
    RelayAttach = 0x14,
}

impl TryFrom<u8> for FrameKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::KeepAlive),
            0x03 => Ok(FrameKind::LatencyPing),
            0x04 => Ok(FrameKind::LatencyPong),
            0x05 => Ok(FrameKind::Probe),
            0x06 => Ok(FrameKind::ProbeAck),
            0x10 => Ok(FrameKind::RelayRequest),
            0x11 => Ok(FrameKind::RelayResponse),
            0x12 => Ok(FrameKind::RelayData),
            0x13 => Ok(FrameKind::RelayClose),
            0x14 => Ok(FrameKind::RelayAttach),
            _ => Err(()),
        }
    }
}

/// A transport frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u8,
    pub kind: FrameKind,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with an opaque payload
    pub fn new(kind: FrameKind, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            sequence,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(sequence: u32, payload: Vec<u8>) -> Self {
        Self::new(FrameKind::Data, sequence, payload)
    }

    /// Create an empty keep-alive frame
    pub fn keep_alive(sequence: u32) -> Self {
        Self::new(FrameKind::KeepAlive, sequence, Vec::new())
    }

    /// Create a control frame with a bincode-encoded payload
    pub fn control<T: Serialize>(
        kind: FrameKind,
        sequence: u32,
        message: &T,
    ) -> Result<Self, SessionError> {
        let payload = bincode::serialize(message)?;
        Ok(Self::new(kind, sequence, payload))
    }

    /// Decode this frame's control payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.version);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a frame from bytes
    ///
    /// Returns `None` for truncated input, unknown versions or kinds,
    /// or a length field that disagrees with the datagram.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return None;
        }

        let kind = FrameKind::try_from(data[1]).ok()?;
        let sequence = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let declared_len = u16::from_be_bytes([data[6], data[7]]) as usize;
        if data.len() != HEADER_SIZE + declared_len {
            return None;
        }

        Some(Self {
            version,
            kind,
            sequence,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Latency measurement ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPing {
    /// Sender's monotonic timestamp in microseconds
    pub sent_at_us: u64,
    /// Ping sequence, echoed back in the pong
    pub ping_seq: u32,
}

/// Latency measurement pong
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPong {
    pub original_sent_at_us: u64,
    pub ping_seq: u32,
}

/// Connectivity / benchmark probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    /// Random nonce, echoed back in the acknowledgment
    pub nonce: u64,
    /// Fixed-size padding so every probe has the same wire cost
    pub padding: Vec<u8>,
}

/// Size of the probe padding; keeps benchmark probes comparable
pub const PROBE_PADDING: usize = 64;

impl Probe {
    pub fn new(nonce: u64) -> Self {
        Self {
            nonce,
            padding: vec![0u8; PROBE_PADDING],
        }
    }
}

/// Probe acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAck {
    pub nonce: u64,
    /// Responder's spare forwarding capacity, bytes per second.
    /// Zero when the responder is a plain peer rather than a relay.
    pub spare_bandwidth_bps: u64,
}

/// Relay connection request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub requester_id: Uuid,
    pub target_peer_id: Uuid,
    pub connection_type: String,
}

/// Relay connection response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub success: bool,
    pub connection_id: Option<Uuid>,
    pub relay_peer_id: Option<Uuid>,
    pub error: Option<String>,
}

/// Relayed opaque payload addressed by connection id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayData {
    pub connection_id: Uuid,
    pub payload: Vec<u8>,
}

/// Relay connection teardown notice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayClose {
    pub connection_id: Uuid,
    pub reason: String,
}

/// Endpoint attachment to an accepted relay connection
///
/// Both endpoints send this from their transport socket so the forwarder
/// learns where to deliver each direction. The forwarder echoes the
/// message back as acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAttach {
    pub connection_id: Uuid,
    pub peer_id: Uuid,
}
