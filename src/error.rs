//! Error types for the session core

use thiserror::Error;

/// Errors that can occur while establishing or operating a peer session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed or unsupported remote description. Fatal for the current
    /// negotiation attempt, recovered through the reconnect cycle.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Transport-level failure (connectivity check failed, unexpected close).
    /// Recoverable via reconnect with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// A relay node refused the request (at capacity or disabled).
    #[error("relay refused: {0}")]
    RelayCapacity(String),

    /// A relay connection was hard-stopped for exceeding its bandwidth cap.
    #[error("relay bandwidth limit exceeded")]
    RelayBandwidthExceeded,

    /// The signaling transport is unreachable. The session cannot proceed
    /// but is not destroyed; the caller decides whether to retry joining.
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("not connected")]
    NotConnected,

    /// The session has been closed and cannot be re-entered.
    #[error("session closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
