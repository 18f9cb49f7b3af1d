// src/nat/mod.rs
//! NAT traversal: STUN messages and the ICE agent built on them

pub mod address;
pub mod error;
pub mod ice;
pub mod stun;

pub use address::{Address, AddressFamily, NetworkProtocol};
pub use error::{DecodeError, NatError, NatResult};
