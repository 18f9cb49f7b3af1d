// src/nat/ice/candidate.rs
//! ICE candidate representation

use std::fmt;
use std::sync::Arc;

use crate::nat::address::{Address, NetworkProtocol};

use super::transport::{SocketId, SocketKind};

/// Maximum foundation length, including room for a terminator
pub const CANDIDATE_MAX_FOUNDATION: usize = 33;

/// Maximum remote candidates accepted per component
pub const MAX_REMOTE_CANDIDATES: usize = 25;

/// Maximum validated remote candidates kept per component
pub const MAX_VALID_CANDIDATES: usize = 50;

/// ICE candidate type (RFC 5245 Section 4.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Host candidate (local address)
    Host,
    /// Server reflexive (from STUN)
    ServerReflexive,
    /// Peer reflexive (discovered during connectivity checks)
    PeerReflexive,
    /// Relayed candidate (from TURN)
    Relayed,
}

impl CandidateType {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }
}

/// Candidate transport, including the ICE-TCP connection roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateTransport {
    Udp,
    TcpActive,
    TcpPassive,
    TcpSimultaneousOpen,
}

impl CandidateTransport {
    pub fn is_udp(self) -> bool {
        self == Self::Udp
    }

    pub fn network(self) -> NetworkProtocol {
        match self {
            Self::Udp => NetworkProtocol::Udp,
            _ => NetworkProtocol::Tcp,
        }
    }

    /// Transport a remote candidate needs to pair with this one
    pub fn matching(self) -> Self {
        match self {
            Self::Udp => Self::Udp,
            Self::TcpActive => Self::TcpPassive,
            Self::TcpPassive => Self::TcpActive,
            Self::TcpSimultaneousOpen => Self::TcpSimultaneousOpen,
        }
    }

    /// Transport of candidates gathered on a socket of this kind
    pub fn from_socket_kind(kind: SocketKind) -> Self {
        match kind {
            SocketKind::Udp | SocketKind::TurnRelay => Self::Udp,
            SocketKind::TcpActive => Self::TcpActive,
            SocketKind::TcpPassive => Self::TcpPassive,
        }
    }
}

/// TURN relay transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayType {
    TurnUdp,
    TurnTcp,
    TurnTls,
}

/// TURN server a relayed candidate was allocated on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub server: Address,
    pub username: String,
    pub password: String,
    pub relay_type: RelayType,
}

impl TurnServer {
    pub fn new(server: Address, username: &str, password: &str, relay_type: RelayType) -> Self {
        Self {
            server,
            username: username.to_string(),
            password: password.to_string(),
            relay_type,
        }
    }

    /// Same server and account, whatever the port
    pub fn equal_no_port(&self, other: &TurnServer) -> bool {
        self.server.equal_no_port(&other.server)
            && self.relay_type == other.relay_type
            && self.username == other.username
    }
}

/// ICE candidate.
///
/// Local candidates carry the socket they were gathered on; remote
/// candidates only get one when learned from an inbound check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub typ: CandidateType,
    pub transport: CandidateTransport,
    pub addr: Address,
    /// Address the candidate was derived from
    pub base_addr: Address,
    pub priority: u32,
    pub stream_id: u32,
    pub component_id: u32,
    pub foundation: String,
    /// Per-candidate credentials (Google, MSN, OC2007)
    pub username: Option<String>,
    pub password: Option<String>,
    pub turn: Option<Arc<TurnServer>>,
    pub socket: Option<SocketId>,
}

impl Candidate {
    pub fn new(typ: CandidateType, transport: CandidateTransport, addr: Address) -> Self {
        Self {
            typ,
            transport,
            addr,
            base_addr: addr,
            priority: 0,
            stream_id: 0,
            component_id: 0,
            foundation: String::new(),
            username: None,
            password: None,
            turn: None,
            socket: None,
        }
    }

    /// Remote candidate as received through signaling
    pub fn remote(
        typ: CandidateType,
        transport: CandidateTransport,
        addr: Address,
        priority: u32,
        foundation: &str,
    ) -> Self {
        let mut candidate = Self::new(typ, transport, addr);
        candidate.priority = priority;
        candidate.foundation = foundation.to_string();
        candidate
    }

    pub fn with_component(mut self, component_id: u32) -> Self {
        self.component_id = component_id;
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub(crate) fn has_username(&self) -> bool {
        self.username.as_deref().map_or(false, |u| !u.is_empty())
    }

    pub(crate) fn has_password(&self) -> bool {
        self.password.as_deref().map_or(false, |p| !p.is_empty())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} prio={} foundation={}",
            self.typ.to_str(),
            self.addr,
            match self.transport {
                CandidateTransport::Udp => "udp",
                CandidateTransport::TcpActive => "tcp-act",
                CandidateTransport::TcpPassive => "tcp-pass",
                CandidateTransport::TcpSimultaneousOpen => "tcp-so",
            },
            self.priority,
            self.foundation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_transport() {
        assert_eq!(CandidateTransport::TcpActive.matching(), CandidateTransport::TcpPassive);
        assert_eq!(CandidateTransport::TcpPassive.matching(), CandidateTransport::TcpActive);
        assert_eq!(
            CandidateTransport::TcpSimultaneousOpen.matching(),
            CandidateTransport::TcpSimultaneousOpen
        );
        assert_eq!(CandidateTransport::Udp.matching(), CandidateTransport::Udp);
    }

    #[test]
    fn test_turn_server_comparison() {
        let a = TurnServer::new(
            Address::udp("203.0.113.1:3478".parse().unwrap()),
            "user",
            "pass",
            RelayType::TurnUdp,
        );
        let mut b = a.clone();
        b.server = b.server.with_port(3479);
        assert!(a.equal_no_port(&b));

        b.relay_type = RelayType::TurnTcp;
        assert!(!a.equal_no_port(&b));
    }

    #[test]
    fn test_remote_candidate() {
        let c = Candidate::remote(
            CandidateType::Host,
            CandidateTransport::Udp,
            Address::udp("10.0.0.2:5000".parse().unwrap()),
            2130706431,
            "1",
        )
        .with_component(1);
        assert_eq!(c.base_addr, c.addr);
        assert_eq!(c.component_id, 1);
        assert!(!c.has_username());
        assert_eq!(
            c.to_string(),
            "host 10.0.0.2:5000/udp udp prio=2130706431 foundation=1"
        );
    }
}
