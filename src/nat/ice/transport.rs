// src/nat/ice/transport.rs
//! Sockets and interface enumeration used by the agent
//!
//! The agent never touches the network directly: it writes datagrams
//! through [`Transport`] handles it was given and learns local addresses
//! from an [`InterfaceProvider`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::nat::address::Address;
use crate::nat::error::{NatError, NatResult};

/// Handle to a socket attached to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Udp,
    TcpActive,
    TcpPassive,
    /// Socket tunnelled through a TURN allocation
    TurnRelay,
}

/// Datagram transport owned by the agent
pub trait Transport: Send {
    fn kind(&self) -> SocketKind;

    fn local_addr(&self) -> Address;

    /// Send without blocking. Returns the number of bytes written.
    fn send(&self, to: &Address, data: &[u8]) -> NatResult<usize>;

    /// Receive a pending datagram, `None` when nothing is queued
    fn try_recv(&self, buf: &mut [u8]) -> NatResult<Option<(usize, Address)>>;

    fn is_reliable(&self) -> bool {
        matches!(self.kind(), SocketKind::TcpActive | SocketKind::TcpPassive)
    }

    fn can_send(&self, _to: &Address) -> bool {
        true
    }
}

/// Tokio UDP socket
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: Address,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> NatResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(Arc::new(socket))
    }

    pub fn from_socket(socket: Arc<UdpSocket>) -> NatResult<Self> {
        let local = Address::udp(socket.local_addr()?);
        debug!("UDP transport bound to {}", local);
        Ok(Self { socket, local })
    }

    /// Shared handle for a reader task
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> SocketKind {
        SocketKind::Udp
    }

    fn local_addr(&self) -> Address {
        self.local
    }

    fn send(&self, to: &Address, data: &[u8]) -> NatResult<usize> {
        let sent = self.socket.try_send_to(data, to.socket_addr())?;
        trace!("Sent {} bytes to {} from {}", sent, to, self.local);
        Ok(sent)
    }

    fn try_recv(&self, buf: &mut [u8]) -> NatResult<Option<(usize, Address)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, Address::udp(from)))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NatError::Io(e)),
        }
    }
}

/// Datagram captured by a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
}

/// In-process transport. Clones share the same queues, so a test can keep
/// one handle while the agent owns another.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: Address,
    kind: SocketKind,
    outbox: Arc<Mutex<VecDeque<Datagram>>>,
    inbox: Arc<Mutex<VecDeque<Datagram>>>,
}

impl MemoryTransport {
    pub fn new(local: Address) -> Self {
        Self::with_kind(local, SocketKind::Udp)
    }

    pub fn with_kind(local: Address, kind: SocketKind) -> Self {
        Self {
            local,
            kind,
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Everything sent since the last call
    pub fn drain_sent(&self) -> Vec<Datagram> {
        self.outbox.lock().drain(..).collect()
    }

    /// Queue a datagram for [`Transport::try_recv`]
    pub fn deliver(&self, from: Address, data: Bytes) {
        self.inbox.lock().push_back(Datagram {
            from,
            to: self.local,
            data,
        });
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> SocketKind {
        self.kind
    }

    fn local_addr(&self) -> Address {
        self.local
    }

    fn send(&self, to: &Address, data: &[u8]) -> NatResult<usize> {
        self.outbox.lock().push_back(Datagram {
            from: self.local,
            to: *to,
            data: Bytes::copy_from_slice(data),
        });
        Ok(data.len())
    }

    fn try_recv(&self, buf: &mut [u8]) -> NatResult<Option<(usize, Address)>> {
        let Some(datagram) = self.inbox.lock().pop_front() else {
            return Ok(None);
        };
        if datagram.data.len() > buf.len() {
            return Err(NatError::Transport(format!(
                "datagram of {} bytes does not fit a {} byte buffer",
                datagram.data.len(),
                buf.len()
            )));
        }
        buf[..datagram.data.len()].copy_from_slice(&datagram.data);
        Ok(Some((datagram.data.len(), datagram.from)))
    }
}

/// Source of local interface addresses
pub trait InterfaceProvider {
    fn local_addresses(&self) -> NatResult<Vec<IpAddr>>;
}

/// Fixed address list
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<IpAddr>);

impl InterfaceProvider for StaticInterfaces {
    fn local_addresses(&self) -> NatResult<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// Interfaces of this host, loopback excluded
#[cfg(feature = "system-interfaces")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

#[cfg(feature = "system-interfaces")]
impl InterfaceProvider for SystemInterfaces {
    fn local_addresses(&self) -> NatResult<Vec<IpAddr>> {
        let interfaces = if_addrs::get_if_addrs()?;
        let addresses: Vec<IpAddr> = interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip())
            .collect();
        debug!("Found {} local interface addresses", addresses.len());
        Ok(addresses)
    }
}
