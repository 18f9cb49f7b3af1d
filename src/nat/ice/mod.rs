// src/nat/ice/mod.rs
//! ICE (Interactive Connectivity Establishment) agent
//!
//! A full ICE agent after RFC 5245, with the Google, MSN and Microsoft OC2007
//! dialects:
//! - Candidate priorities, foundations and pairing
//! - Server reflexive and relayed candidate discovery
//! - Connectivity checks with regular and aggressive nomination
//! - Role conflict resolution
//! - Peer-reflexive candidate learning
//! - Keepalives once a pair is selected
//!
//! [`Agent`] performs no I/O of its own; [`spawn_agent`] runs it on tokio.

pub mod agent;
pub mod candidate;
pub mod check_list;
pub mod config;
pub mod connectivity;
pub mod discovery;
pub mod driver;
pub mod events;
pub mod foundation;
pub mod priority;
pub mod states;
pub mod stream;
pub mod transport;
pub mod utils;

pub use agent::{Agent, PacketOutcome, ReceivedData};
pub use candidate::{Candidate, CandidateTransport, CandidateType, RelayType, TurnServer};
pub use check_list::{CandidateCheckPair, CheckState, PairId};
pub use config::{AgentConfig, Compatibility, NominationMode, TurnCompatibility};
pub use connectivity::{pairing_allowed, PairingRejected};
pub use discovery::HostCandidateResult;
pub use driver::{spawn_agent, spawn_udp_reader, AgentHandle};
pub use events::{AgentEvent, NotificationSink, NullSink};
pub use priority::{candidate_pair_priority, candidate_priority};
pub use states::ComponentState;
pub use transport::{
    Datagram, InterfaceProvider, MemoryTransport, SocketId, SocketKind, StaticInterfaces,
    Transport, UdpTransport,
};

#[cfg(feature = "system-interfaces")]
pub use transport::SystemInterfaces;
