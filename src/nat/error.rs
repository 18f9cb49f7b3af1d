// src/nat/error.rs
//! Error types for the ICE agent core

use std::io;
use thiserror::Error;

use crate::nat::ice::transport::SocketId;

/// Errors raised while reading or writing STUN wire data.
///
/// Always recoverable: the agent maps every decode failure onto a
/// validation status instead of propagating it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes remain than the read requires
    #[error("Insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },

    /// Address family byte is neither IPv4 nor IPv6
    #[error("Invalid address family: 0x{0:02X}")]
    InvalidFamily(u8),

    /// Address payload is not 4 or 16 bytes
    #[error("Invalid address length: {0}")]
    InvalidAddressLength(usize),

    /// XOR encoding needs the magic cookie and transaction ID
    #[error("Missing encoding context: {0}")]
    MissingContext(&'static str),

    /// Text attribute is not valid UTF-8
    #[error("Attribute is not valid UTF-8")]
    InvalidUtf8,

    /// Attribute header or value overruns the message
    #[error("Malformed attribute 0x{attr_type:04X} with length {length}")]
    MalformedAttribute { attr_type: u16, length: usize },

    /// Message header is not a STUN header
    #[error("Malformed STUN header: {0}")]
    MalformedHeader(&'static str),
}

/// Errors surfaced by the agent API
#[derive(Debug, Error)]
pub enum NatError {
    /// STUN wire errors
    #[error("STUN decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No stream with this id
    #[error("Unknown stream {0}")]
    UnknownStream(u32),

    /// No component with this id in the stream
    #[error("Unknown component {component} in stream {stream}")]
    UnknownComponent { stream: u32, component: u32 },

    /// Socket handle not attached to the agent
    #[error("Unknown socket {0}")]
    UnknownSocket(SocketId),

    /// Failure reported by a transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The task owning the agent is gone
    #[error("Agent task has shut down")]
    AgentClosed,
}

/// Result type for agent operations
pub type NatResult<T> = Result<T, NatError>;
