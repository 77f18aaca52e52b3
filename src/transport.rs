//! UDP peer transport, direct and relayed
//!
//! One transport type with two variants selected at negotiation time:
//! `Direct` talks straight to the remote peer, `Relayed` wraps every frame
//! in a relay-data envelope addressed to a forwarder. Exactly one transport
//! is active per session; the session controller destroys the old one
//! before creating a replacement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::candidate::{self, IceCandidate};
use crate::error::SessionError;
use crate::protocol::{
    Frame, FrameKind, LatencyPing, LatencyPong, Probe, ProbeAck, RelayAttach, RelayClose,
    RelayData, HEADER_SIZE,
};

/// Number of keep-alive intervals of inbound silence before the link
/// is considered dead
const SILENCE_FACTOR: u32 = 3;

/// Pings unanswered for this long count as lost
const PING_EXPIRY: Duration = Duration::from_secs(3);

/// Re-probe cadence while establishing connectivity
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// A bound UDP socket with frame encode/decode
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpEndpoint {
    /// Bind to a local address with `SO_REUSEADDR` enabled so a session
    /// can rebind its port immediately after leaving
    pub async fn bind(addr: &str) -> Result<Self, SessionError> {
        let parsed: SocketAddr = addr.parse()?;
        let domain = if parsed.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&parsed.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        debug!("UDP endpoint bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Borrow the underlying socket (candidate gathering sends STUN
    /// requests on it before the receive pump starts)
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send a frame to a remote address
    pub async fn send_frame(&self, frame: &Frame, addr: SocketAddr) -> Result<(), SessionError> {
        let data = frame.to_bytes();
        self.socket.send_to(&data, addr).await?;
        trace!("sent {:?} ({} bytes) to {}", frame.kind, data.len(), addr);
        Ok(())
    }

    /// Receive the next valid frame, skipping datagrams that do not decode
    pub async fn recv_frame(&self) -> Result<(Frame, SocketAddr), SessionError> {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            match Frame::from_bytes(&buf[..len]) {
                Some(frame) => {
                    trace!("received {:?} ({} bytes) from {}", frame.kind, len, addr);
                    return Ok((frame, addr));
                }
                None => trace!("dropped undecodable datagram from {}", addr),
            }
        }
    }

    /// Start a receive loop feeding frames into a channel
    pub fn start_pump(
        self: &Arc<Self>,
    ) -> (
        mpsc::Receiver<(Frame, SocketAddr)>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(1024);
        let endpoint = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                match endpoint.recv_frame().await {
                    Ok(pair) => {
                        if tx.send(pair).await.is_err() {
                            debug!("frame channel closed, stopping pump");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("receive error: {}", e);
                    }
                }
            }
        });

        (rx, handle)
    }
}

/// Transport variant selected by negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Straight path to the remote peer
    Direct,
    /// Frames wrapped and forwarded through a relay node
    Relayed {
        relay_addr: SocketAddr,
        connection_id: Uuid,
    },
}

/// Events surfaced to the session controller
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Failed(String),
}

/// Statistics sampled by the quality monitor
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Smoothed round-trip time
    pub rtt_ms: f64,
    /// RTT variation
    pub jitter_ms: f64,
    /// Unanswered latency pings as a percentage of pings sent
    pub packet_loss_pct: f64,
    /// Recent throughput in bits per second (sent + received)
    pub bandwidth_bps: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LinkState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
    Closed = 4,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            4 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

/// Smoothed RTT and loss estimation from latency ping/pong exchange
struct RttEstimator {
    srtt_ms: f64,
    jitter_ms: f64,
    pending: HashMap<u32, Instant>,
    next_seq: u32,
    sent: u64,
    lost: u64,
    origin: Instant,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            srtt_ms: 0.0,
            jitter_ms: 0.0,
            pending: HashMap::new(),
            next_seq: 0,
            sent: 0,
            lost: 0,
            origin: Instant::now(),
        }
    }

    fn create_ping(&mut self) -> LatencyPing {
        self.expire_stale();

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending.insert(seq, Instant::now());
        self.sent += 1;

        LatencyPing {
            sent_at_us: self.origin.elapsed().as_micros() as u64,
            ping_seq: seq,
        }
    }

    fn process_pong(&mut self, pong: &LatencyPong) {
        if let Some(sent_at) = self.pending.remove(&pong.ping_seq) {
            let rtt = sent_at.elapsed().as_secs_f64() * 1000.0;

            // TCP-style smoothing
            let alpha = 0.125;
            if self.srtt_ms == 0.0 {
                self.srtt_ms = rtt;
            } else {
                self.srtt_ms = (1.0 - alpha) * self.srtt_ms + alpha * rtt;
            }

            let beta = 0.25;
            let diff = (rtt - self.srtt_ms).abs();
            self.jitter_ms = (1.0 - beta) * self.jitter_ms + beta * diff;

            trace!(
                "rtt sample {:.2}ms (srtt={:.2}ms jitter={:.2}ms)",
                rtt,
                self.srtt_ms,
                self.jitter_ms
            );
        }
    }

    fn expire_stale(&mut self) {
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, sent_at)| sent_at.elapsed() > PING_EXPIRY)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale {
            self.pending.remove(&seq);
            self.lost += 1;
        }
    }

    fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64 * 100.0
        }
    }
}

struct BandwidthWindow {
    sampled_at: Instant,
    total_bytes: u64,
    bps: u64,
}

/// A peer transport carrying the session's data channel
pub struct PeerTransport {
    endpoint: Arc<UdpEndpoint>,
    kind: TransportKind,
    local_peer_id: Uuid,
    state: AtomicU8,
    remote_addr: RwLock<Option<SocketAddr>>,
    remote_candidates: RwLock<Vec<SocketAddr>>,
    sequence: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    rtt: RwLock<RttEstimator>,
    last_inbound: Mutex<Instant>,
    bandwidth: Mutex<BandwidthWindow>,
    events_tx: mpsc::Sender<TransportEvent>,
    data_tx: mpsc::Sender<Vec<u8>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    keepalive_interval: Duration,
    gather_reflexive: bool,
}

impl PeerTransport {
    /// Bind a new transport
    ///
    /// Returns the transport together with its event stream (for the
    /// session controller) and its inbound data stream (for the reliable
    /// message channel).
    pub async fn bind(
        kind: TransportKind,
        local_peer_id: Uuid,
        local_port: u16,
        keepalive_interval: Duration,
        gather_reflexive: bool,
    ) -> Result<
        (
            Arc<Self>,
            mpsc::Receiver<TransportEvent>,
            mpsc::Receiver<Vec<u8>>,
        ),
        SessionError,
    > {
        let endpoint = UdpEndpoint::bind(&format!("0.0.0.0:{local_port}")).await?;
        let (events_tx, events_rx) = mpsc::channel(16);
        let (data_tx, data_rx) = mpsc::channel(256);
        let now = Instant::now();

        let transport = Arc::new(Self {
            endpoint: Arc::new(endpoint),
            kind,
            local_peer_id,
            state: AtomicU8::new(LinkState::Idle as u8),
            remote_addr: RwLock::new(None),
            remote_candidates: RwLock::new(Vec::new()),
            sequence: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            rtt: RwLock::new(RttEstimator::new()),
            last_inbound: Mutex::new(now),
            bandwidth: Mutex::new(BandwidthWindow {
                sampled_at: now,
                total_bytes: 0,
                bps: 0,
            }),
            events_tx,
            data_tx,
            tasks: Mutex::new(Vec::new()),
            keepalive_interval,
            gather_reflexive,
        });

        Ok((transport, events_rx, data_rx))
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Gather the local candidate set for negotiation
    ///
    /// Relayed transports skip reflexive discovery; the path to the relay
    /// is already known and the peer never dials us directly.
    pub async fn gather_local_candidates(&self) -> Vec<IceCandidate> {
        match self.kind {
            TransportKind::Direct => {
                candidate::gather_candidates(self.endpoint.socket(), self.gather_reflexive).await
            }
            TransportKind::Relayed { .. } => vec![IceCandidate::host(self.local_addr())],
        }
    }

    /// Add a remote address candidate; picked up by the next probe round
    pub fn add_remote_candidate(&self, addr: SocketAddr) {
        let mut candidates = self.remote_candidates.write();
        if !candidates.contains(&addr) {
            debug!("remote candidate {}", addr);
            candidates.push(addr);
        }
    }

    /// Establish connectivity, then start the receive and keep-alive loops
    ///
    /// Emits `TransportEvent::Connected` on success and
    /// `TransportEvent::Failed` on error, in addition to the returned
    /// `Result`, so a detached caller can fire-and-forget.
    pub async fn establish(self: &Arc<Self>, limit: Duration) -> Result<(), SessionError> {
        self.set_state(LinkState::Connecting);

        let result = match self.kind {
            TransportKind::Direct => self.probe_candidates(limit).await,
            TransportKind::Relayed {
                relay_addr,
                connection_id,
            } => self.attach_to_relay(relay_addr, connection_id, limit).await,
        };

        match result {
            Ok(selected) => {
                *self.remote_addr.write() = Some(selected);
                *self.last_inbound.lock() = Instant::now();
                self.set_state(LinkState::Connected);
                self.start_loops();
                info!("transport connected via {} ({:?})", selected, self.kind);
                let _ = self.events_tx.send(TransportEvent::Connected).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(LinkState::Failed);
                let _ = self
                    .events_tx
                    .send(TransportEvent::Failed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Probe remote candidates until one answers or the limit expires
    async fn probe_candidates(&self, limit: Duration) -> Result<SocketAddr, SessionError> {
        let deadline = Instant::now() + limit;
        let nonce: u64 = rand::random();
        let probe = Frame::control(FrameKind::Probe, 0, &Probe::new(nonce))?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ConnectionTimeout);
            }

            let candidates = self.remote_candidates.read().clone();
            if candidates.is_empty() {
                tokio::time::sleep(Duration::from_millis(50).min(remaining)).await;
                continue;
            }

            for addr in &candidates {
                self.endpoint.send_frame(&probe, *addr).await?;
            }

            let wait = PROBE_INTERVAL.min(remaining);
            match timeout(wait, self.endpoint.recv_frame()).await {
                Ok(Ok((frame, from))) if candidates.contains(&from) => match frame.kind {
                    FrameKind::ProbeAck => {
                        if frame.decode::<ProbeAck>().map(|a| a.nonce).ok() == Some(nonce) {
                            return Ok(from);
                        }
                    }
                    FrameKind::Probe => {
                        // the peer is probing us at the same time; answer so
                        // its side converges, and accept the working path
                        if let Ok(p) = frame.decode::<Probe>() {
                            let ack = Frame::control(
                                FrameKind::ProbeAck,
                                0,
                                &ProbeAck {
                                    nonce: p.nonce,
                                    spare_bandwidth_bps: 0,
                                },
                            )?;
                            self.endpoint.send_frame(&ack, from).await?;
                        }
                        return Ok(from);
                    }
                    _ => return Ok(from),
                },
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    warn!("probe receive error: {}", e);
                }
                Err(_) => continue,
            }
        }
    }

    /// Announce this endpoint to the forwarder until the attach is echoed
    async fn attach_to_relay(
        &self,
        relay_addr: SocketAddr,
        connection_id: Uuid,
        limit: Duration,
    ) -> Result<SocketAddr, SessionError> {
        let deadline = Instant::now() + limit;
        let attach = Frame::control(
            FrameKind::RelayAttach,
            0,
            &RelayAttach {
                connection_id,
                peer_id: self.local_peer_id,
            },
        )?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ConnectionTimeout);
            }

            self.endpoint.send_frame(&attach, relay_addr).await?;

            let wait = PROBE_INTERVAL.min(remaining);
            match timeout(wait, self.endpoint.recv_frame()).await {
                Ok(Ok((frame, from))) if from == relay_addr => {
                    if frame.kind == FrameKind::RelayAttach {
                        if let Ok(echo) = frame.decode::<RelayAttach>() {
                            if echo.connection_id == connection_id {
                                return Ok(relay_addr);
                            }
                        }
                    }
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => warn!("attach receive error: {}", e),
                Err(_) => continue,
            }
        }
    }

    /// Send opaque application data over the data channel
    pub async fn send_data(&self, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let frame = Frame::data(self.next_sequence(), payload.to_vec());
        self.send_peer_frame(frame).await
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a frame to the remote peer, wrapping for the relay variant
    async fn send_peer_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let remote = (*self.remote_addr.read()).ok_or(SessionError::NotConnected)?;

        let wire = match self.kind {
            TransportKind::Direct => frame,
            TransportKind::Relayed { connection_id, .. } => Frame::control(
                FrameKind::RelayData,
                self.next_sequence(),
                &RelayData {
                    connection_id,
                    payload: frame.to_bytes(),
                },
            )?,
        };

        let len = wire.payload.len() + HEADER_SIZE;
        self.endpoint.send_frame(&wire, remote).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }

    fn start_loops(self: &Arc<Self>) {
        let (mut rx, pump_handle) = self.endpoint.start_pump();
        let transport = self.clone();

        let recv_handle = tokio::spawn(async move {
            while let Some((frame, from)) = rx.recv().await {
                match transport.link_state() {
                    LinkState::Connected => {}
                    _ => break,
                }
                transport.handle_frame(frame, from).await;
            }
        });

        let transport = self.clone();
        let keepalive_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(transport.keepalive_interval);
            // first tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if transport.link_state() != LinkState::Connected {
                    break;
                }

                let silence = transport.last_inbound.lock().elapsed();
                if silence > transport.keepalive_interval * SILENCE_FACTOR {
                    transport.fail(format!(
                        "no inbound traffic for {:.1}s",
                        silence.as_secs_f64()
                    ));
                    break;
                }

                let seq = transport.next_sequence();
                if let Err(e) = transport.send_peer_frame(Frame::keep_alive(seq)).await {
                    warn!("keep-alive send failed: {}", e);
                    continue;
                }

                let ping = transport.rtt.write().create_ping();
                match Frame::control(FrameKind::LatencyPing, transport.next_sequence(), &ping) {
                    Ok(frame) => {
                        if let Err(e) = transport.send_peer_frame(frame).await {
                            warn!("latency ping send failed: {}", e);
                        }
                    }
                    Err(e) => warn!("latency ping encode failed: {}", e),
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(pump_handle);
        tasks.push(recv_handle);
        tasks.push(keepalive_handle);
    }

    async fn handle_frame(&self, frame: Frame, from: SocketAddr) {
        let remote = *self.remote_addr.read();

        match self.kind {
            TransportKind::Relayed { connection_id, .. } => {
                if Some(from) != remote {
                    trace!("ignoring frame from non-relay source {}", from);
                    return;
                }
                match frame.kind {
                    FrameKind::RelayData => {
                        if let Ok(wrapped) = frame.decode::<RelayData>() {
                            if wrapped.connection_id == connection_id {
                                if let Some(inner) = Frame::from_bytes(&wrapped.payload) {
                                    self.handle_peer_frame(inner).await;
                                }
                            }
                        }
                    }
                    FrameKind::RelayClose => {
                        if let Ok(close) = frame.decode::<RelayClose>() {
                            if close.connection_id == connection_id {
                                self.fail(format!("relay closed connection: {}", close.reason));
                            }
                        }
                    }
                    // the forwarder measures its legs with bare probes
                    FrameKind::Probe => self.answer_probe(&frame, from).await,
                    // late attach echoes are harmless
                    FrameKind::RelayAttach => {}
                    _ => {}
                }
            }
            TransportKind::Direct => {
                if frame.kind == FrameKind::Probe {
                    // answer probes from anywhere: the peer may be
                    // re-establishing after a failure on its side
                    self.answer_probe(&frame, from).await;
                    return;
                }
                if Some(from) != remote {
                    trace!("ignoring frame from unknown source {}", from);
                    return;
                }
                self.handle_peer_frame(frame).await;
            }
        }
    }

    async fn handle_peer_frame(&self, frame: Frame) {
        *self.last_inbound.lock() = Instant::now();
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add((frame.payload.len() + HEADER_SIZE) as u64, Ordering::Relaxed);

        match frame.kind {
            FrameKind::Data => {
                if self.data_tx.send(frame.payload).await.is_err() {
                    trace!("data channel receiver dropped");
                }
            }
            FrameKind::KeepAlive => {}
            FrameKind::LatencyPing => {
                if let Ok(ping) = frame.decode::<LatencyPing>() {
                    let pong = LatencyPong {
                        original_sent_at_us: ping.sent_at_us,
                        ping_seq: ping.ping_seq,
                    };
                    match Frame::control(FrameKind::LatencyPong, self.next_sequence(), &pong) {
                        Ok(reply) => {
                            if let Err(e) = self.send_peer_frame(reply).await {
                                warn!("latency pong send failed: {}", e);
                            }
                        }
                        Err(e) => warn!("latency pong encode failed: {}", e),
                    }
                }
            }
            FrameKind::LatencyPong => {
                if let Ok(pong) = frame.decode::<LatencyPong>() {
                    self.rtt.write().process_pong(&pong);
                }
            }
            FrameKind::Probe => {
                // relayed probes arrive through handle_peer_frame too
                if let Ok(probe) = frame.decode::<Probe>() {
                    let ack = ProbeAck {
                        nonce: probe.nonce,
                        spare_bandwidth_bps: 0,
                    };
                    if let Ok(reply) =
                        Frame::control(FrameKind::ProbeAck, self.next_sequence(), &ack)
                    {
                        if let Err(e) = self.send_peer_frame(reply).await {
                            warn!("probe ack send failed: {}", e);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    async fn answer_probe(&self, frame: &Frame, from: SocketAddr) {
        if let Ok(probe) = frame.decode::<Probe>() {
            let ack = ProbeAck {
                nonce: probe.nonce,
                spare_bandwidth_bps: 0,
            };
            if let Ok(reply) = Frame::control(FrameKind::ProbeAck, self.next_sequence(), &ack) {
                if let Err(e) = self.endpoint.send_frame(&reply, from).await {
                    warn!("probe ack send failed: {}", e);
                }
            }
        }
    }

    fn fail(&self, reason: String) {
        let previous = self.state.swap(LinkState::Failed as u8, Ordering::SeqCst);
        if LinkState::from_u8(previous) == LinkState::Connected {
            warn!("transport failed: {}", reason);
            let _ = self.events_tx.try_send(TransportEvent::Failed(reason));
        }
    }

    /// Current transport statistics
    pub fn stats(&self) -> TransportStats {
        let total_bytes =
            self.bytes_sent.load(Ordering::Relaxed) + self.bytes_received.load(Ordering::Relaxed);

        let bandwidth_bps = {
            let mut window = self.bandwidth.lock();
            let elapsed = window.sampled_at.elapsed();
            if elapsed >= Duration::from_millis(200) {
                let delta = total_bytes.saturating_sub(window.total_bytes);
                window.bps = (delta as f64 * 8.0 / elapsed.as_secs_f64()) as u64;
                window.sampled_at = Instant::now();
                window.total_bytes = total_bytes;
            }
            window.bps
        };

        let rtt = self.rtt.read();
        TransportStats {
            rtt_ms: rtt.srtt_ms,
            jitter_ms: rtt.jitter_ms,
            packet_loss_pct: rtt.loss_pct(),
            bandwidth_bps,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }

    /// Tear down the transport: stops all loops and releases the socket
    /// once the handles are dropped. Synchronous; safe to call twice.
    pub fn close(&self) {
        self.set_state(LinkState::Closed);
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("transport closed");
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.close();
    }
}
