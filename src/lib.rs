//! pairlink - two-party peer sessions over unreliable networks
//!
//! This library negotiates a direct or relayed transport between exactly
//! two participants, monitors its quality, adapts media and transport
//! settings in a closed loop, and provides an ordered, buffered message
//! channel on top of the active transport.

pub mod candidate;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod quality;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transport;

pub use channel::{ChannelMessage, MessageKind, SendOutcome};
pub use config::SessionConfig;
pub use error::SessionError;
pub use quality::{OptimizationSettings, QualityPreset, QualitySample, RelayPreference};
pub use relay::{RelayForwarder, RelayMetrics, RelayNegotiator, RelayPath};
pub use session::{ConnectionState, PeerSession, SessionEvent};
pub use signaling::{
    RoomUser, SignalingClient, SignalingConnection, SignalingMessage, SignalingServer,
};
pub use transport::{PeerTransport, TransportKind, TransportStats};
