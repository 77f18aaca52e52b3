//! Address candidate gathering for connectivity establishment
//!
//! Produces the candidate set a session exchanges during negotiation:
//! the host address the socket is bound to, plus the server-reflexive
//! address discovered through a STUN binding request (RFC 5389 subset).

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::SessionError;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Default public STUN servers, tried in order
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Per-server timeout for a binding request
const STUN_TIMEOUT_MS: u64 = 3000;

/// How a candidate address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// The address the local socket is bound to
    Host,
    /// The public mapping observed by a STUN server
    ServerReflexive,
}

impl CandidateKind {
    fn tag(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
        }
    }
}

/// A connectivity candidate exchanged during negotiation
///
/// The string encoding (`"host 192.168.1.4:5000"`) is the opaque
/// candidate payload carried in signaling envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub kind: CandidateKind,
    pub addr: SocketAddr,
}

impl IceCandidate {
    pub fn host(addr: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Host,
            addr,
        }
    }

    pub fn server_reflexive(addr: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::ServerReflexive,
            addr,
        }
    }

    /// Encode to the wire string
    pub fn encode(&self) -> String {
        format!("{} {}", self.kind.tag(), self.addr)
    }

    /// Parse the wire string
    pub fn parse(value: &str) -> Result<Self, SessionError> {
        let mut parts = value.split_whitespace();
        let tag = parts
            .next()
            .ok_or_else(|| SessionError::Negotiation(format!("empty candidate: {value:?}")))?;
        let addr = parts
            .next()
            .ok_or_else(|| SessionError::Negotiation(format!("candidate missing address: {value:?}")))?
            .parse::<SocketAddr>()
            .map_err(|e| SessionError::Negotiation(format!("bad candidate address: {e}")))?;

        let kind = match tag {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            other => {
                return Err(SessionError::Negotiation(format!(
                    "unknown candidate kind: {other}"
                )))
            }
        };

        Ok(Self { kind, addr })
    }
}

impl std::fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Gather candidates for the given socket
///
/// Always yields the host candidate; when `include_reflexive` is set,
/// appends the server-reflexive candidate if any STUN server answers.
/// STUN failures are logged and skipped, never fatal — a host-only
/// candidate set is still negotiable on a LAN.
pub async fn gather_candidates(socket: &UdpSocket, include_reflexive: bool) -> Vec<IceCandidate> {
    let mut candidates = Vec::with_capacity(2);

    match socket.local_addr() {
        Ok(addr) => candidates.push(IceCandidate::host(routable_host_addr(addr))),
        Err(e) => warn!("local address unavailable: {}", e),
    }

    if include_reflexive {
        match discover_reflexive(socket, DEFAULT_STUN_SERVERS).await {
            Ok(addr) => {
                if !candidates.iter().any(|c| c.addr == addr) {
                    candidates.push(IceCandidate::server_reflexive(addr));
                }
            }
            Err(e) => debug!("reflexive discovery skipped: {}", e),
        }
    }

    info!("gathered {} candidate(s)", candidates.len());
    candidates
}

/// A socket bound to the unspecified address is not reachable by that
/// address; substitute the machine's interface address, falling back to
/// loopback when no interface is known
fn routable_host_addr(addr: SocketAddr) -> SocketAddr {
    if !addr.ip().is_unspecified() {
        return addr;
    }
    let ip = local_ip_address::local_ip()
        .unwrap_or_else(|_| std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, addr.port())
}

/// Discover the server-reflexive address, trying each server in order
pub async fn discover_reflexive(
    socket: &UdpSocket,
    servers: &[&str],
) -> Result<SocketAddr, SessionError> {
    for server in servers {
        match binding_request(socket, server).await {
            Ok(addr) => {
                info!("reflexive address {} via {}", addr, server);
                return Ok(addr);
            }
            Err(e) => {
                warn!("STUN request to {} failed: {}", server, e);
            }
        }
    }
    Err(SessionError::Transport("all STUN servers failed".into()))
}

/// Send one binding request and parse the mapped address from the response
async fn binding_request(socket: &UdpSocket, server: &str) -> Result<SocketAddr, SessionError> {
    let server_addr = tokio::net::lookup_host(server)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| SessionError::Transport(format!("no IPv4 address for {server}")))?;

    let txn_id: [u8; 12] = rand::random();
    let request = encode_binding_request(&txn_id);
    socket.send_to(&request, server_addr).await?;

    let mut buf = [0u8; 576];
    let (len, from) = timeout(
        Duration::from_millis(STUN_TIMEOUT_MS),
        socket.recv_from(&mut buf),
    )
    .await
    .map_err(|_| SessionError::ConnectionTimeout)??;

    if from != server_addr {
        return Err(SessionError::Transport(format!(
            "binding response from unexpected source {from}"
        )));
    }

    decode_binding_response(&buf[..len], &txn_id)
}

fn encode_binding_request(txn_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(txn_id);
    msg
}

fn decode_binding_response(data: &[u8], txn_id: &[u8; 12]) -> Result<SocketAddr, SessionError> {
    if data.len() < 20 {
        return Err(SessionError::Transport("binding response too short".into()));
    }
    if u16::from_be_bytes([data[0], data[1]]) != BINDING_RESPONSE {
        return Err(SessionError::Transport("not a binding response".into()));
    }
    if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
        return Err(SessionError::Transport("bad magic cookie".into()));
    }
    if &data[8..20] != txn_id {
        return Err(SessionError::Transport("transaction id mismatch".into()));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (20 + msg_len).min(data.len());

    let mut offset = 20;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;
        if value_start + attr_len > data.len() {
            break;
        }
        let value = &data[value_start..value_start + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return decode_mapped(value, true),
            ATTR_MAPPED_ADDRESS => return decode_mapped(value, false),
            _ => {}
        }

        // attributes are padded to 4-byte alignment
        offset = value_start + ((attr_len + 3) & !3);
    }

    Err(SessionError::Transport(
        "no mapped address in binding response".into(),
    ))
}

fn decode_mapped(value: &[u8], xored: bool) -> Result<SocketAddr, SessionError> {
    if value.len() < 8 {
        return Err(SessionError::Transport("mapped address too short".into()));
    }
    if value[1] != 0x01 {
        // only the IPv4 family is decoded; IPv6 mappings are rare on the
        // STUN servers we use and a host candidate still covers v6 LANs
        return Err(SessionError::Transport("unsupported address family".into()));
    }

    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let raw_ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);

    let (port, ip) = if xored {
        (
            raw_port ^ (MAGIC_COOKIE >> 16) as u16,
            Ipv4Addr::from(raw_ip ^ MAGIC_COOKIE),
        )
    } else {
        (raw_port, Ipv4Addr::from(raw_ip))
    };

    Ok(SocketAddr::new(ip.into(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_encode_parse() {
        let candidate = IceCandidate::host("127.0.0.1:5000".parse().unwrap());
        let encoded = candidate.encode();
        assert_eq!(encoded, "host 127.0.0.1:5000");
        assert_eq!(IceCandidate::parse(&encoded).unwrap(), candidate);

        let srflx = IceCandidate::server_reflexive("203.0.113.9:61234".parse().unwrap());
        assert_eq!(IceCandidate::parse(&srflx.encode()).unwrap(), srflx);
    }

    #[test]
    fn test_candidate_parse_rejects_garbage() {
        assert!(IceCandidate::parse("").is_err());
        assert!(IceCandidate::parse("host").is_err());
        assert!(IceCandidate::parse("warp 10.0.0.1:1").is_err());
        assert!(IceCandidate::parse("host not-an-address").is_err());
    }

    #[test]
    fn test_binding_response_roundtrip() {
        let txn_id = [7u8; 12];
        let mapped: SocketAddr = "192.0.2.17:3478".parse().unwrap();

        // build a response carrying XOR-MAPPED-ADDRESS
        let ip = match mapped.ip() {
            std::net::IpAddr::V4(v4) => u32::from(v4),
            _ => unreachable!(),
        };
        let mut attr = Vec::new();
        attr.push(0);
        attr.push(0x01);
        attr.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        attr.extend_from_slice(&(ip ^ MAGIC_COOKIE).to_be_bytes());

        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&((attr.len() + 4) as u16).to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&txn_id);
        response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        response.extend_from_slice(&attr);

        let decoded = decode_binding_response(&response, &txn_id).unwrap();
        assert_eq!(decoded, mapped);
    }

    #[test]
    fn test_binding_response_rejects_wrong_txn() {
        let response = encode_binding_request(&[1u8; 12]);
        assert!(decode_binding_response(&response, &[2u8; 12]).is_err());
    }
}
