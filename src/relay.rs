//! Relay negotiation and forwarding
//!
//! When a direct path is unavailable or undesirable, a third peer willing
//! to forward traffic carries the session. The negotiator (on the
//! requesting peer) benchmarks known relay-capable peers and asks the best
//! one for a connection; the forwarder (on the relay peer) copies opaque
//! frames between the two endpoints under a hard bandwidth cap.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{
    Frame, FrameKind, Probe, ProbeAck, RelayAttach, RelayClose, RelayData, RelayRequest,
    RelayResponse,
};
use crate::transport::UdpEndpoint;

/// Connections whose last activity falls within this window still count
/// toward the success rate. Deliberately generous; see DESIGN.md.
const RECENT_ACTIVITY_WINDOW: Duration = Duration::from_secs(30);

/// Timeout for a single probe or relay request exchange
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// A relay-capable peer known to the negotiator
#[derive(Debug, Clone)]
pub struct RelayCandidate {
    pub peer_id: Uuid,
    pub addr: SocketAddr,
    pub discovered_at: Instant,
}

/// Result of benchmarking one candidate
#[derive(Debug, Clone)]
struct BenchmarkedCandidate {
    candidate: RelayCandidate,
    latency_ms: f64,
    bandwidth_bps: u64,
}

/// The relay path handed to the session controller on success
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RelayPath {
    pub relay_peer_id: Uuid,
    pub relay_addr: SocketAddr,
    pub connection_id: Uuid,
}

/// Finds and engages the best relay for a session
pub struct RelayNegotiator {
    local_peer_id: Uuid,
    candidates: RwLock<Vec<RelayCandidate>>,
}

impl RelayNegotiator {
    pub fn new(local_peer_id: Uuid) -> Self {
        Self {
            local_peer_id,
            candidates: RwLock::new(Vec::new()),
        }
    }

    /// Register a relay-capable peer discovered through signaling or
    /// any out-of-band channel
    pub fn register_candidate(&self, peer_id: Uuid, addr: SocketAddr) {
        let mut candidates = self.candidates.write();
        if candidates.iter().any(|c| c.peer_id == peer_id) {
            return;
        }
        debug!("relay candidate {} at {}", peer_id, addr);
        candidates.push(RelayCandidate {
            peer_id,
            addr,
            discovered_at: Instant::now(),
        });
    }

    pub fn forget_candidate(&self, peer_id: Uuid) {
        self.candidates.write().retain(|c| c.peer_id != peer_id);
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.read().len()
    }

    /// Combined ranking score; lower is better.
    ///
    /// Placeholder heuristic carried over from the original system: very
    /// high-bandwidth, high-latency relays can rank above nearer ones.
    /// Only the ordering leaks out of this function, so the formula can
    /// be replaced without touching the negotiation flow.
    fn rank_score(latency_ms: f64, bandwidth_bps: u64) -> f64 {
        latency_ms - bandwidth_bps as f64 / 1000.0
    }

    /// Negotiate a relay path to `target_peer_id`
    ///
    /// Benchmarks every known candidate, then asks them best-first until
    /// one accepts. Reports failure when no candidate exists, none answer
    /// the probe, or all refuse; the session controller then falls back
    /// to its normal retry cycle.
    pub async fn negotiate(&self, target_peer_id: Uuid) -> Result<RelayPath, SessionError> {
        let candidates = self.candidates.read().clone();
        if candidates.is_empty() {
            return Err(SessionError::RelayCapacity(
                "no relay candidates known".to_string(),
            ));
        }

        let endpoint = UdpEndpoint::bind("0.0.0.0:0").await?;

        let mut benchmarked = Vec::new();
        for candidate in candidates {
            match self.benchmark(&endpoint, &candidate).await {
                Ok(result) => benchmarked.push(result),
                Err(e) => debug!("relay probe to {} failed: {}", candidate.peer_id, e),
            }
        }

        if benchmarked.is_empty() {
            return Err(SessionError::RelayCapacity(
                "all relay probes failed".to_string(),
            ));
        }

        // rank ascending; ties broken by earliest discovery
        benchmarked.sort_by(|a, b| {
            let sa = Self::rank_score(a.latency_ms, a.bandwidth_bps);
            let sb = Self::rank_score(b.latency_ms, b.bandwidth_bps);
            sa.partial_cmp(&sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.candidate.discovered_at.cmp(&b.candidate.discovered_at))
        });

        let mut last_error = None;
        for entry in &benchmarked {
            match self.request_relay(&endpoint, &entry.candidate, target_peer_id).await {
                Ok(path) => {
                    info!(
                        "relay {} accepted (latency {:.1}ms), connection {}",
                        path.relay_peer_id, entry.latency_ms, path.connection_id
                    );
                    return Ok(path);
                }
                Err(e) => {
                    debug!("relay {} refused: {}", entry.candidate.peer_id, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SessionError::RelayCapacity("no relay accepted".to_string())))
    }

    /// Round-trip a fixed-size probe and record latency plus the spare
    /// bandwidth the relay advertises
    async fn benchmark(
        &self,
        endpoint: &UdpEndpoint,
        candidate: &RelayCandidate,
    ) -> Result<BenchmarkedCandidate, SessionError> {
        let nonce: u64 = rand::random();
        let frame = Frame::control(FrameKind::Probe, 0, &Probe::new(nonce))?;

        let started = Instant::now();
        endpoint.send_frame(&frame, candidate.addr).await?;

        let deadline = started + EXCHANGE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ConnectionTimeout);
            }

            let (reply, from) = timeout(remaining, endpoint.recv_frame())
                .await
                .map_err(|_| SessionError::ConnectionTimeout)??;

            if from != candidate.addr || reply.kind != FrameKind::ProbeAck {
                continue;
            }
            let ack: ProbeAck = match reply.decode() {
                Ok(ack) => ack,
                Err(_) => continue,
            };
            if ack.nonce != nonce {
                continue;
            }

            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            trace!(
                "relay {} probe: {:.1}ms, spare {} Bps",
                candidate.peer_id,
                latency_ms,
                ack.spare_bandwidth_bps
            );
            return Ok(BenchmarkedCandidate {
                candidate: candidate.clone(),
                latency_ms,
                bandwidth_bps: ack.spare_bandwidth_bps,
            });
        }
    }

    /// Ask one relay for a connection to the target peer
    async fn request_relay(
        &self,
        endpoint: &UdpEndpoint,
        candidate: &RelayCandidate,
        target_peer_id: Uuid,
    ) -> Result<RelayPath, SessionError> {
        let request = RelayRequest {
            requester_id: self.local_peer_id,
            target_peer_id,
            connection_type: "data".to_string(),
        };
        let frame = Frame::control(FrameKind::RelayRequest, 0, &request)?;
        endpoint.send_frame(&frame, candidate.addr).await?;

        let deadline = Instant::now() + EXCHANGE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ConnectionTimeout);
            }

            let (reply, from) = timeout(remaining, endpoint.recv_frame())
                .await
                .map_err(|_| SessionError::ConnectionTimeout)??;

            if from != candidate.addr || reply.kind != FrameKind::RelayResponse {
                continue;
            }

            let response: RelayResponse = reply.decode()?;
            if !response.success {
                return Err(SessionError::RelayCapacity(
                    response.error.unwrap_or_else(|| "rejected".to_string()),
                ));
            }

            let connection_id = response.connection_id.ok_or_else(|| {
                SessionError::RelayCapacity("accepted without connection id".to_string())
            })?;

            return Ok(RelayPath {
                relay_peer_id: response.relay_peer_id.unwrap_or(candidate.peer_id),
                relay_addr: candidate.addr,
                connection_id,
            });
        }
    }
}

/// One forwarded connection hosted by this node
#[derive(Debug, Clone)]
pub struct RelayConnection {
    pub connection_id: Uuid,
    pub requester_id: Uuid,
    pub target_peer_id: Uuid,
    pub requester_addr: Option<SocketAddr>,
    pub target_addr: Option<SocketAddr>,
    pub bytes_forwarded: u64,
    pub bandwidth_bps: u64,
    pub latency_ms: f64,
    pub is_active: bool,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

impl RelayConnection {
    fn new(connection_id: Uuid, request: &RelayRequest) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            requester_id: request.requester_id,
            target_peer_id: request.target_peer_id,
            requester_addr: None,
            target_addr: None,
            bytes_forwarded: 0,
            bandwidth_bps: 0,
            latency_ms: 0.0,
            is_active: true,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// The forwarding destination for a frame arriving from `from`
    fn destination_for(&self, from: SocketAddr) -> Option<SocketAddr> {
        if self.requester_addr == Some(from) {
            self.target_addr
        } else if self.target_addr == Some(from) {
            self.requester_addr
        } else {
            None
        }
    }

    fn involves(&self, addr: SocketAddr) -> bool {
        self.requester_addr == Some(addr) || self.target_addr == Some(addr)
    }
}

/// Node-wide relay statistics, recomputed on a fixed interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayMetrics {
    pub total_connections: usize,
    pub active_relays: usize,
    pub bandwidth_used_bps: u64,
    pub average_latency_ms: f64,
    pub success_rate_pct: f64,
}

impl RelayMetrics {
    /// Recompute from the tracked connection set
    ///
    /// An empty set reports a 100 % success rate. Connections count as
    /// successful while active or recently active; see DESIGN.md on the
    /// masking caveat of the recent-activity window.
    fn recompute(connections: &HashMap<Uuid, RelayConnection>) -> Self {
        let total_connections = connections.len();
        let active: Vec<&RelayConnection> =
            connections.values().filter(|c| c.is_active).collect();
        let active_relays = active.len();

        let bandwidth_used_bps = active.iter().map(|c| c.bandwidth_bps).sum();
        let average_latency_ms = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|c| c.latency_ms).sum::<f64>() / active.len() as f64
        };

        let success_rate_pct = if total_connections == 0 {
            100.0
        } else {
            let successful = connections
                .values()
                .filter(|c| {
                    c.is_active || c.last_activity_at.elapsed() <= RECENT_ACTIVITY_WINDOW
                })
                .count();
            successful as f64 / total_connections as f64 * 100.0
        };

        Self {
            total_connections,
            active_relays,
            bandwidth_used_bps,
            average_latency_ms,
            success_rate_pct,
        }
    }
}

struct ForwarderShared {
    local_peer_id: Uuid,
    endpoint: Arc<UdpEndpoint>,
    connections: RwLock<HashMap<Uuid, RelayConnection>>,
    // outstanding endpoint-latency probes: nonce -> (connection, sent at)
    pending_probes: RwLock<HashMap<u64, (Uuid, Instant)>>,
    metrics: RwLock<RelayMetrics>,
    enabled: AtomicBool,
    max_connections: usize,
    bandwidth_limit_bps: u64,
    inactivity_timeout: Duration,
    metrics_interval: Duration,
}

/// Forwards opaque traffic between two peers that cannot connect directly
pub struct RelayForwarder {
    shared: Arc<ForwarderShared>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RelayForwarder {
    /// Bind the forwarder socket. `start` must be called before the node
    /// serves requests.
    pub async fn bind(
        local_peer_id: Uuid,
        addr: &str,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let endpoint = UdpEndpoint::bind(addr).await?;
        info!("relay forwarder bound to {}", endpoint.local_addr());

        Ok(Self {
            shared: Arc::new(ForwarderShared {
                local_peer_id,
                endpoint: Arc::new(endpoint),
                connections: RwLock::new(HashMap::new()),
                pending_probes: RwLock::new(HashMap::new()),
                metrics: RwLock::new(RelayMetrics {
                    success_rate_pct: 100.0,
                    ..RelayMetrics::default()
                }),
                enabled: AtomicBool::new(true),
                max_connections: config.max_relay_connections,
                bandwidth_limit_bps: config.relay_bandwidth_limit_bps,
                inactivity_timeout: Duration::from_millis(config.relay_inactivity_timeout_ms),
                metrics_interval: Duration::from_millis(config.relay_metrics_interval_ms),
            }),
            tasks: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.endpoint.local_addr()
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.shared.local_peer_id
    }

    /// Administratively enable or disable relaying; a disabled node
    /// refuses new requests but keeps forwarding existing connections
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Start the receive and maintenance loops
    pub fn start(&mut self) {
        let (mut rx, pump_handle) = self.shared.endpoint.start_pump();
        let shared = self.shared.clone();

        let recv_handle = tokio::spawn(async move {
            while let Some((frame, from)) = rx.recv().await {
                shared.handle_frame(frame, from).await;
            }
        });

        let shared = self.shared.clone();
        let maintenance_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.metrics_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                shared.cleanup();
                shared.probe_endpoints().await;
                let metrics = RelayMetrics::recompute(&shared.connections.read());
                trace!(
                    "relay metrics: {} total, {} active, success {:.0}%",
                    metrics.total_connections,
                    metrics.active_relays,
                    metrics.success_rate_pct
                );
                *shared.metrics.write() = metrics;
            }
        });

        self.tasks.push(pump_handle);
        self.tasks.push(recv_handle);
        self.tasks.push(maintenance_handle);
    }

    /// Latest recomputed metrics
    pub fn metrics(&self) -> RelayMetrics {
        self.shared.metrics.read().clone()
    }

    /// Count of currently active relay connections
    pub fn active_connections(&self) -> usize {
        self.shared
            .connections
            .read()
            .values()
            .filter(|c| c.is_active)
            .count()
    }

    /// Snapshot of one connection's bookkeeping, for diagnostics
    pub fn connection(&self, connection_id: Uuid) -> Option<RelayConnection> {
        self.shared.connections.read().get(&connection_id).cloned()
    }

    /// Drop every connection involving a disconnected peer address
    pub fn peer_disconnected(&self, addr: SocketAddr) {
        let mut connections = self.shared.connections.write();
        let before = connections.len();
        connections.retain(|_, c| !c.involves(addr));
        let removed = before - connections.len();
        if removed > 0 {
            info!("removed {} relay connection(s) for {}", removed, addr);
        }
    }

    /// Stop all loops; existing sockets are released when handles drop
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RelayForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ForwarderShared {
    async fn handle_frame(&self, frame: Frame, from: SocketAddr) {
        match frame.kind {
            FrameKind::RelayRequest => {
                if let Ok(request) = frame.decode::<RelayRequest>() {
                    let response = self.admit(&request);
                    match Frame::control(FrameKind::RelayResponse, 0, &response) {
                        Ok(reply) => {
                            if let Err(e) = self.endpoint.send_frame(&reply, from).await {
                                warn!("relay response send failed: {}", e);
                            }
                        }
                        Err(e) => warn!("relay response encode failed: {}", e),
                    }
                }
            }
            FrameKind::RelayAttach => {
                if let Ok(attach) = frame.decode::<RelayAttach>() {
                    if self.attach(&attach, from) {
                        // echo as acknowledgment
                        if let Ok(echo) = Frame::control(FrameKind::RelayAttach, 0, &attach) {
                            if let Err(e) = self.endpoint.send_frame(&echo, from).await {
                                warn!("attach echo send failed: {}", e);
                            }
                        }
                    }
                }
            }
            FrameKind::RelayData => {
                if let Ok(data) = frame.decode::<RelayData>() {
                    self.forward(data, from).await;
                }
            }
            FrameKind::RelayClose => {
                if let Ok(close) = frame.decode::<RelayClose>() {
                    if let Some(conn) = self.connections.write().get_mut(&close.connection_id) {
                        conn.is_active = false;
                    }
                }
            }
            FrameKind::Probe => {
                if let Ok(probe) = frame.decode::<Probe>() {
                    let used: u64 = {
                        let connections = self.connections.read();
                        connections
                            .values()
                            .filter(|c| c.is_active)
                            .map(|c| c.bandwidth_bps)
                            .sum()
                    };
                    let ack = ProbeAck {
                        nonce: probe.nonce,
                        spare_bandwidth_bps: self.bandwidth_limit_bps.saturating_sub(used),
                    };
                    if let Ok(reply) = Frame::control(FrameKind::ProbeAck, 0, &ack) {
                        if let Err(e) = self.endpoint.send_frame(&reply, from).await {
                            warn!("probe ack send failed: {}", e);
                        }
                    }
                }
            }
            FrameKind::ProbeAck => {
                if let Ok(ack) = frame.decode::<ProbeAck>() {
                    self.record_endpoint_latency(ack.nonce);
                }
            }
            _ => trace!("ignoring {:?} from {}", frame.kind, from),
        }
    }

    /// Accept or reject a relay request
    fn admit(&self, request: &RelayRequest) -> RelayResponse {
        if !self.enabled.load(Ordering::SeqCst) {
            return RelayResponse {
                success: false,
                connection_id: None,
                relay_peer_id: Some(self.local_peer_id),
                error: Some("relaying disabled".to_string()),
            };
        }

        let mut connections = self.connections.write();
        let active = connections.values().filter(|c| c.is_active).count();
        if active >= self.max_connections {
            return RelayResponse {
                success: false,
                connection_id: None,
                relay_peer_id: Some(self.local_peer_id),
                error: Some(format!("at capacity ({active} connections)")),
            };
        }

        let connection_id = Uuid::new_v4();
        connections.insert(connection_id, RelayConnection::new(connection_id, request));
        info!(
            "relay connection {} accepted: {} <-> {}",
            connection_id, request.requester_id, request.target_peer_id
        );

        RelayResponse {
            success: true,
            connection_id: Some(connection_id),
            relay_peer_id: Some(self.local_peer_id),
            error: None,
        }
    }

    /// Bind an endpoint address to its side of a connection
    fn attach(&self, attach: &RelayAttach, from: SocketAddr) -> bool {
        let mut connections = self.connections.write();
        let Some(conn) = connections.get_mut(&attach.connection_id) else {
            debug!("attach to unknown connection {}", attach.connection_id);
            return false;
        };
        if !conn.is_active {
            return false;
        }

        if attach.peer_id == conn.requester_id {
            conn.requester_addr = Some(from);
        } else if attach.peer_id == conn.target_peer_id {
            conn.target_addr = Some(from);
        } else {
            debug!(
                "attach from foreign peer {} to connection {}",
                attach.peer_id, attach.connection_id
            );
            return false;
        }

        conn.last_activity_at = Instant::now();
        true
    }

    /// Copy one relayed frame to the opposite endpoint, enforcing the
    /// bandwidth hard cap
    async fn forward(&self, data: RelayData, from: SocketAddr) {
        let payload_len = data.payload.len() as u64;

        let (destination, closed) = {
            let mut connections = self.connections.write();
            let Some(conn) = connections.get_mut(&data.connection_id) else {
                trace!("relay data for unknown connection {}", data.connection_id);
                return;
            };
            if !conn.is_active {
                return;
            }

            let Some(destination) = conn.destination_for(from) else {
                trace!(
                    "relay data from unattached source {} on {}",
                    from,
                    data.connection_id
                );
                return;
            };

            conn.bytes_forwarded += payload_len;
            conn.last_activity_at = Instant::now();

            // sliding measurement from connection start, minimum 1s window
            let elapsed = conn.created_at.elapsed().as_secs_f64().max(1.0);
            conn.bandwidth_bps = (conn.bytes_forwarded as f64 / elapsed) as u64;

            if conn.bytes_forwarded as f64 > self.bandwidth_limit_bps as f64 * elapsed {
                // hard cap: close the pipe, do not forward this frame
                conn.is_active = false;
                warn!(
                    "relay connection {} exceeded bandwidth cap ({} bytes in {:.1}s)",
                    data.connection_id, conn.bytes_forwarded, elapsed
                );
                (None, Some((conn.requester_addr, conn.target_addr)))
            } else {
                (Some(destination), None)
            }
        };

        if let Some((requester, target)) = closed {
            let close = RelayClose {
                connection_id: data.connection_id,
                reason: "bandwidth limit exceeded".to_string(),
            };
            if let Ok(frame) = Frame::control(FrameKind::RelayClose, 0, &close) {
                for addr in [requester, target].into_iter().flatten() {
                    if let Err(e) = self.endpoint.send_frame(&frame, addr).await {
                        warn!("relay close send failed: {}", e);
                    }
                }
            }
            return;
        }

        if let Some(destination) = destination {
            match Frame::control(FrameKind::RelayData, 0, &data) {
                Ok(frame) => {
                    if let Err(e) = self.endpoint.send_frame(&frame, destination).await {
                        warn!("relay forward to {} failed: {}", destination, e);
                    }
                }
                Err(e) => warn!("relay data encode failed: {}", e),
            }
        }
    }

    /// Remove connections with no recent activity
    fn cleanup(&self) {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, c| c.last_activity_at.elapsed() < self.inactivity_timeout);
        let removed = before - connections.len();
        if removed > 0 {
            debug!("cleaned up {} idle relay connection(s)", removed);
        }
    }

    /// Measure the relay legs: probe each attached endpoint of active
    /// connections and fold acknowledgments into per-connection latency
    async fn probe_endpoints(&self) {
        let targets: Vec<(Uuid, SocketAddr)> = {
            let connections = self.connections.read();
            connections
                .values()
                .filter(|c| c.is_active)
                .flat_map(|c| {
                    [c.requester_addr, c.target_addr]
                        .into_iter()
                        .flatten()
                        .map(|addr| (c.connection_id, addr))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (connection_id, addr) in targets {
            let nonce: u64 = rand::random();
            self.pending_probes
                .write()
                .insert(nonce, (connection_id, Instant::now()));
            if let Ok(frame) = Frame::control(FrameKind::Probe, 0, &Probe::new(nonce)) {
                if let Err(e) = self.endpoint.send_frame(&frame, addr).await {
                    trace!("endpoint probe to {} failed: {}", addr, e);
                }
            }
        }

        // discard probes that never came back
        self.pending_probes
            .write()
            .retain(|_, (_, sent_at)| sent_at.elapsed() < self.metrics_interval * 2);
    }

    fn record_endpoint_latency(&self, nonce: u64) {
        let Some((connection_id, sent_at)) = self.pending_probes.write().remove(&nonce) else {
            return;
        };
        let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
        if let Some(conn) = self.connections.write().get_mut(&connection_id) {
            conn.latency_ms = if conn.latency_ms == 0.0 {
                rtt_ms
            } else {
                0.75 * conn.latency_ms + 0.25 * rtt_ms
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requester: Uuid, target: Uuid) -> RelayRequest {
        RelayRequest {
            requester_id: requester,
            target_peer_id: target,
            connection_type: "data".to_string(),
        }
    }

    #[test]
    fn test_rank_score_prefers_low_latency() {
        let near = RelayNegotiator::rank_score(10.0, 0);
        let far = RelayNegotiator::rank_score(200.0, 0);
        assert!(near < far);
    }

    #[test]
    fn test_rank_score_bandwidth_compensates() {
        // the documented counter-intuitive case: enough bandwidth ranks a
        // high-latency relay first
        let near_slow = RelayNegotiator::rank_score(10.0, 1_000);
        let far_fast = RelayNegotiator::rank_score(200.0, 500_000);
        assert!(far_fast < near_slow);
    }

    #[test]
    fn test_metrics_empty_set_is_perfect() {
        let metrics = RelayMetrics::recompute(&HashMap::new());
        assert_eq!(metrics.total_connections, 0);
        assert_eq!(metrics.active_relays, 0);
        assert_eq!(metrics.success_rate_pct, 100.0);
    }

    #[test]
    fn test_metrics_single_active_connection() {
        let mut connections = HashMap::new();
        let conn = RelayConnection::new(Uuid::new_v4(), &request(Uuid::new_v4(), Uuid::new_v4()));
        connections.insert(conn.connection_id, conn);

        let metrics = RelayMetrics::recompute(&connections);
        assert_eq!(metrics.total_connections, 1);
        assert_eq!(metrics.active_relays, 1);
        assert_eq!(metrics.success_rate_pct, 100.0);
    }

    #[test]
    fn test_metrics_average_latency_over_active_only() {
        let mut connections = HashMap::new();

        let mut a = RelayConnection::new(Uuid::new_v4(), &request(Uuid::new_v4(), Uuid::new_v4()));
        a.latency_ms = 10.0;
        let mut b = RelayConnection::new(Uuid::new_v4(), &request(Uuid::new_v4(), Uuid::new_v4()));
        b.latency_ms = 30.0;
        let mut dead =
            RelayConnection::new(Uuid::new_v4(), &request(Uuid::new_v4(), Uuid::new_v4()));
        dead.latency_ms = 500.0;
        dead.is_active = false;

        connections.insert(a.connection_id, a);
        connections.insert(b.connection_id, b);
        connections.insert(dead.connection_id, dead);

        let metrics = RelayMetrics::recompute(&connections);
        assert_eq!(metrics.active_relays, 2);
        assert!((metrics.average_latency_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_destination_for_opposite_endpoint() {
        let mut conn = RelayConnection::new(Uuid::new_v4(), &request(Uuid::new_v4(), Uuid::new_v4()));
        let requester: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let target: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        conn.requester_addr = Some(requester);
        conn.target_addr = Some(target);

        assert_eq!(conn.destination_for(requester), Some(target));
        assert_eq!(conn.destination_for(target), Some(requester));
        assert_eq!(
            conn.destination_for("10.0.0.3:3000".parse().unwrap()),
            None
        );
    }

    #[tokio::test]
    async fn test_negotiate_without_candidates_fails() {
        let negotiator = RelayNegotiator::new(Uuid::new_v4());
        let result = negotiator.negotiate(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SessionError::RelayCapacity(_))));
    }
}
