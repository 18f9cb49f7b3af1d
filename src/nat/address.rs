// src/nat/address.rs
//! Transport address identity used by candidates and STUN attributes

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family byte used by MAPPED-ADDRESS style attributes
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Ipv4 => 0x01,
            Self::Ipv6 => 0x02,
        }
    }

    /// Address length in bytes
    pub fn address_len(self) -> usize {
        match self {
            Self::Ipv4 => 4,
            Self::Ipv6 => 16,
        }
    }
}

/// Network protocol an address is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkProtocol {
    Udp,
    Tcp,
}

/// An IP endpoint.
///
/// `PartialEq` is full equality (family, network, ip, port);
/// [`Address::equal_no_port`] drops the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    network: NetworkProtocol,
    addr: SocketAddr,
}

impl Address {
    pub fn new(network: NetworkProtocol, addr: SocketAddr) -> Self {
        Self { network, addr }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(NetworkProtocol::Udp, addr)
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(NetworkProtocol::Tcp, addr)
    }

    pub fn family(&self) -> AddressFamily {
        match self.addr.ip() {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn network(&self) -> NetworkProtocol {
        self.network
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Same endpoint on another port
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.network, SocketAddr::new(self.addr.ip(), port))
    }

    /// Same endpoint over another network protocol
    pub fn with_network(&self, network: NetworkProtocol) -> Self {
        Self::new(network, self.addr)
    }

    /// Compare family, network and ip, ignoring the port
    pub fn equal_no_port(&self, other: &Address) -> bool {
        self.network == other.network && self.addr.ip() == other.addr.ip()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.network {
            NetworkProtocol::Udp => "udp",
            NetworkProtocol::Tcp => "tcp",
        };
        write!(f, "{}/{}", self.addr, proto)
    }
}
