//! SHARP ICE library (lib.rs)
//!
//! ICE agent core with its own STUN stack: candidate gathering, priorities,
//! connectivity checks, nomination and keepalives, driven either by hand
//! through [`Agent`] or on tokio through [`spawn_agent`].

#![warn(clippy::all)]

pub mod nat;

// Re-export main types
pub use nat::ice::{
    spawn_agent, spawn_udp_reader, Agent, AgentConfig, AgentEvent, AgentHandle, Candidate,
    CandidateTransport, CandidateType, Compatibility, ComponentState, MemoryTransport,
    NominationMode, NotificationSink, PacketOutcome, SocketId, Transport, TurnServer,
    UdpTransport,
};
pub use nat::stun::{StunAgent, StunCompatibility, StunMessage, StunUsageFlags};
pub use nat::{Address, NatError, NatResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with an env-filter directive such as `"debug"` or
/// `"sharp_ice=trace"`. `RUST_LOG` wins when set. Does nothing if a global
/// subscriber is already installed.
///
/// # Example
/// ```
/// sharp_ice::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("info");
    }
}
