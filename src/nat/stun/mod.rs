// src/nat/stun/mod.rs
//! STUN (Session Traversal Utilities for NAT) for the ICE agent
//!
//! Wire codec, message model and the transaction-tracking agent used by
//! connectivity checks and candidate discovery:
//! - RFC 5389 messages, with RFC 3489, MS-ICE2 and OC2007 dialects
//! - Short-term and long-term credentials (MESSAGE-INTEGRITY)
//! - FINGERPRINT
//! - Retransmission timer with exponential backoff

pub mod agent;
pub mod attributes;
pub mod auth;
pub mod codec;
pub mod protocol;
pub mod timer;

pub use agent::{
    StunAgent, StunCompatibility, StunUsageFlags, StunValidationStatus, Validation,
    STUN_AGENT_MAX_SAVED_IDS,
};
pub use attributes::{
    AttributeCodec, ErrorCode, MappedAddress, MessageIntegrity, Software, StunAttributeType,
    UnknownAttributes, Username, XorMappedAddress,
};
pub use auth::{long_term_key, StunCredentials};
pub use codec::{DataStream, DataWriter};
pub use protocol::{
    pack_message_type, unpack_message_type, MessageClass, RawAttribute, StunMessage, StunMethod,
    TransactionId, TurnDraft, HEADER_SIZE, MAGIC_COOKIE,
};
pub use timer::{StunTimer, StunTimerReturn};
