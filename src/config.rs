//! Session configuration and tunables

use serde::{Deserialize, Serialize};

/// Default retry budget before a session is declared failed
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default relay bandwidth cap (1 MiB/s sustained)
pub const DEFAULT_RELAY_BANDWIDTH_LIMIT_BPS: u64 = 1024 * 1024;

/// Configuration for a peer session
///
/// All tunables exposed by the core. Values are normalized through
/// [`SessionConfig::validated`] before use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Reconnection attempts before the session enters `Failed`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for the linear reconnect backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub reconnect_backoff_base_ms: u64,

    /// Upper bound for the reconnect backoff, in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub reconnect_backoff_cap_ms: u64,

    /// Initial connection timeout; adapted at runtime by the
    /// adaptation engine within [5000, 30000] ms
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Maximum simultaneous relay connections a forwarder accepts
    #[serde(default = "default_max_relay_connections")]
    pub max_relay_connections: usize,

    /// Hard bandwidth cap per relay connection, bytes per second
    #[serde(default = "default_relay_bandwidth_limit")]
    pub relay_bandwidth_limit_bps: u64,

    /// Relay connections with no forwarded bytes for this long are removed
    #[serde(default = "default_relay_inactivity_timeout_ms")]
    pub relay_inactivity_timeout_ms: u64,

    /// Quality monitor sampling interval while connected
    #[serde(default = "default_quality_interval_ms")]
    pub quality_monitor_interval_ms: u64,

    /// Relay metrics recompute interval
    #[serde(default = "default_relay_metrics_interval_ms")]
    pub relay_metrics_interval_ms: u64,

    /// Keep-alive and latency-ping interval on an active transport
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Discover the server-reflexive address via STUN when gathering
    /// candidates. Disable on closed networks where no STUN server is
    /// reachable.
    #[serde(default = "default_true")]
    pub enable_reflexive_discovery: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    15_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_max_relay_connections() -> usize {
    10
}

fn default_relay_bandwidth_limit() -> u64 {
    DEFAULT_RELAY_BANDWIDTH_LIMIT_BPS
}

fn default_relay_inactivity_timeout_ms() -> u64 {
    30_000
}

fn default_quality_interval_ms() -> u64 {
    2000
}

fn default_relay_metrics_interval_ms() -> u64 {
    5000
}

fn default_keepalive_interval_ms() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            reconnect_backoff_base_ms: default_backoff_base_ms(),
            reconnect_backoff_cap_ms: default_backoff_cap_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_relay_connections: default_max_relay_connections(),
            relay_bandwidth_limit_bps: default_relay_bandwidth_limit(),
            relay_inactivity_timeout_ms: default_relay_inactivity_timeout_ms(),
            quality_monitor_interval_ms: default_quality_interval_ms(),
            relay_metrics_interval_ms: default_relay_metrics_interval_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            enable_reflexive_discovery: true,
        }
    }
}

impl SessionConfig {
    /// Validate and normalize the configuration
    ///
    /// Returns a config with:
    /// - backoff cap >= backoff base, base >= 1 ms
    /// - all intervals >= 100 ms so background tasks never spin
    /// - at least one relay connection slot when relaying is configured
    pub fn validated(self) -> Self {
        let reconnect_backoff_base_ms = self.reconnect_backoff_base_ms.max(1);
        let reconnect_backoff_cap_ms = self.reconnect_backoff_cap_ms.max(reconnect_backoff_base_ms);

        Self {
            reconnect_backoff_base_ms,
            reconnect_backoff_cap_ms,
            connection_timeout_ms: self.connection_timeout_ms.max(100),
            quality_monitor_interval_ms: self.quality_monitor_interval_ms.max(100),
            relay_metrics_interval_ms: self.relay_metrics_interval_ms.max(100),
            keepalive_interval_ms: self.keepalive_interval_ms.max(100),
            relay_inactivity_timeout_ms: self.relay_inactivity_timeout_ms.max(100),
            max_relay_connections: self.max_relay_connections.max(1),
            ..self
        }
    }

    /// Backoff delay in milliseconds for the given 1-based attempt number
    ///
    /// `min(cap, base * attempt)` — non-decreasing in the attempt counter.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.reconnect_backoff_base_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.reconnect_backoff_cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_relay_connections, 10);
        assert_eq!(config.relay_bandwidth_limit_bps, 1024 * 1024);
        assert_eq!(config.quality_monitor_interval_ms, 2000);
        assert_eq!(config.relay_metrics_interval_ms, 5000);
    }

    #[test]
    fn test_validated_normalizes_backoff() {
        let config = SessionConfig {
            reconnect_backoff_base_ms: 5000,
            reconnect_backoff_cap_ms: 100,
            ..SessionConfig::default()
        }
        .validated();

        assert!(config.reconnect_backoff_cap_ms >= config.reconnect_backoff_base_ms);
    }

    #[test]
    fn test_backoff_non_decreasing_and_capped() {
        let config = SessionConfig::default();
        let mut previous = 0;
        for attempt in 1..=10 {
            let delay = config.backoff_ms(attempt);
            assert!(delay >= previous, "backoff must be non-decreasing");
            assert!(delay <= config.reconnect_backoff_cap_ms);
            previous = delay;
        }
        assert_eq!(config.backoff_ms(1), config.reconnect_backoff_base_ms);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
