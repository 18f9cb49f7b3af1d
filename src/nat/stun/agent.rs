// src/nat/stun/agent.rs
//! STUN agent: outstanding transactions, message finishing and validation
//!
//! The agent is stateless across calls except for the table of sent
//! requests, which correlates responses and supplies the key their
//! MESSAGE-INTEGRITY is checked against.

use std::collections::VecDeque;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::nat::error::DecodeError;

use super::attributes::{
    StunAttributeType, FINGERPRINT_SIZE, KNOWN_ATTRIBUTES, MESSAGE_INTEGRITY_SIZE,
};
use super::auth::{
    compute_fingerprint, compute_message_integrity, long_term_key, verify_message_integrity,
    StunCredentials,
};
use super::protocol::{
    find_attribute_offset, MessageClass, StunMessage, StunMethod, TransactionId,
    ATTRIBUTE_HEADER_SIZE, HEADER_SIZE, MAGIC_COOKIE,
};

/// Capacity of the sent-transaction table; the oldest entry is evicted
pub const STUN_AGENT_MAX_SAVED_IDS: usize = 200;

/// Upper bound on UNKNOWN-ATTRIBUTES entries reported back
pub const STUN_AGENT_MAX_UNKNOWN_ATTRIBUTES: usize = 256;

/// STUN dialect spoken by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunCompatibility {
    /// Classic STUN, no magic cookie
    Rfc3489,
    /// RFC 5389
    Rfc5389,
    /// Microsoft ICE v2 (also used for WLM 2009)
    MsIce2,
    /// RFC 3489 with swapped REALM/NONCE ids and unaligned attributes
    Oc2007,
}

impl StunCompatibility {
    /// Alias kept for Windows Live Messenger 2009 peers
    pub const WLM2009: Self = Self::MsIce2;

    /// Whether messages carry the RFC 5389 magic cookie
    pub fn uses_cookie(self) -> bool {
        matches!(self, Self::Rfc5389 | Self::MsIce2)
    }

    /// Legacy dialects pad the MESSAGE-INTEGRITY input to 64 bytes
    pub fn pads_integrity(self) -> bool {
        matches!(self, Self::Rfc3489 | Self::Oc2007)
    }
}

/// Usage flags controlling credentials and optional attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StunUsageFlags(u32);

impl StunUsageFlags {
    pub const SHORT_TERM_CREDENTIALS: Self = Self(1 << 0);
    pub const LONG_TERM_CREDENTIALS: Self = Self(1 << 1);
    pub const USE_FINGERPRINT: Self = Self(1 << 2);
    pub const ADD_SOFTWARE: Self = Self(1 << 3);
    pub const IGNORE_CREDENTIALS: Self = Self(1 << 4);
    pub const NO_INDICATION_AUTH: Self = Self(1 << 5);
    pub const FORCE_VALIDATER: Self = Self(1 << 6);
    pub const NO_ALIGNED_ATTRIBUTES: Self = Self(1 << 7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for StunUsageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StunUsageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Outcome of [`StunAgent::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunValidationStatus {
    Success,
    NotStun,
    IncompleteStun,
    BadRequest,
    UnauthorizedBadRequest,
    Unauthorized,
    UnmatchedResponse,
    UnknownRequestAttribute,
    UnknownAttribute,
}

/// A validated (or partially validated) inbound message
#[derive(Debug, Clone)]
pub struct Validation {
    pub status: StunValidationStatus,
    /// Parsed message, present once the header and attributes decoded
    pub message: Option<StunMessage>,
    /// Key the integrity was checked with
    pub key: Option<Vec<u8>>,
    /// Comprehension-required attributes the agent does not know
    pub unknown_attributes: Vec<u16>,
}

impl Validation {
    fn status(status: StunValidationStatus) -> Self {
        Self {
            status,
            message: None,
            key: None,
            unknown_attributes: Vec::new(),
        }
    }

    fn with_message(status: StunValidationStatus, message: StunMessage) -> Self {
        Self {
            status,
            message: Some(message),
            key: None,
            unknown_attributes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StunValidationStatus::Success
    }
}

#[derive(Debug, Clone)]
struct SavedTransaction {
    id: TransactionId,
    method: u16,
    key: Option<Vec<u8>>,
}

/// STUN transaction bookkeeping and validation
#[derive(Debug, Clone)]
pub struct StunAgent {
    compatibility: StunCompatibility,
    usage: StunUsageFlags,
    known_attributes: Vec<u16>,
    sent_ids: VecDeque<SavedTransaction>,
    software: Option<String>,
}

impl StunAgent {
    pub fn new(compatibility: StunCompatibility, mut usage: StunUsageFlags) -> Self {
        if compatibility == StunCompatibility::Oc2007 {
            usage.insert(StunUsageFlags::NO_ALIGNED_ATTRIBUTES);
        }
        Self {
            compatibility,
            usage,
            known_attributes: KNOWN_ATTRIBUTES.to_vec(),
            sent_ids: VecDeque::with_capacity(STUN_AGENT_MAX_SAVED_IDS),
            software: None,
        }
    }

    /// Replace the list of comprehension-required attributes accepted
    pub fn with_known_attributes(mut self, known: &[u16]) -> Self {
        self.known_attributes = known.to_vec();
        self
    }

    pub fn set_software(&mut self, software: Option<String>) {
        self.software = software;
    }

    pub fn compatibility(&self) -> StunCompatibility {
        self.compatibility
    }

    pub fn usage(&self) -> StunUsageFlags {
        self.usage
    }

    pub fn is_aligned(&self) -> bool {
        !self.usage.contains(StunUsageFlags::NO_ALIGNED_ATTRIBUTES)
    }

    /// Number of requests awaiting a response
    pub fn pending_transactions(&self) -> usize {
        self.sent_ids.len()
    }

    pub fn has_transaction(&self, id: &TransactionId) -> bool {
        self.sent_ids.iter().any(|t| t.id == *id)
    }

    fn fresh_transaction_id(&self) -> TransactionId {
        loop {
            let id = TransactionId::random(self.compatibility.uses_cookie());
            if !self.has_transaction(&id) {
                return id;
            }
        }
    }

    pub fn init_request(&self, method: StunMethod) -> StunMessage {
        StunMessage::new(
            MessageClass::Request,
            method,
            self.fresh_transaction_id(),
            self.is_aligned(),
        )
    }

    pub fn init_indication(&self, method: StunMethod) -> StunMessage {
        StunMessage::new(
            MessageClass::Indication,
            method,
            self.fresh_transaction_id(),
            self.is_aligned(),
        )
    }

    /// Success response echoing the request's method and transaction ID
    pub fn init_response(&self, request: &StunMessage) -> StunMessage {
        StunMessage::new(
            MessageClass::SuccessResponse,
            StunMethod::Unknown(request.method_code()),
            request.transaction_id(),
            self.is_aligned(),
        )
    }

    /// Error response carrying ERROR-CODE
    pub fn init_error(&self, request: &StunMessage, code: u16) -> Result<StunMessage, DecodeError> {
        let mut msg = StunMessage::new(
            MessageClass::ErrorResponse,
            StunMethod::Unknown(request.method_code()),
            request.transaction_id(),
            self.is_aligned(),
        );
        msg.append_error_code(code)?;
        Ok(msg)
    }

    /// 420 response listing the attributes that were not understood
    pub fn init_unknown_attributes_error(
        &self,
        request: &StunMessage,
        unknown: &[u16],
    ) -> Result<StunMessage, DecodeError> {
        let mut msg = self.init_error(request, 420)?;
        let listed = &unknown[..unknown.len().min(STUN_AGENT_MAX_UNKNOWN_ATTRIBUTES)];
        msg.append_unknown_attributes(listed)?;
        Ok(msg)
    }

    fn save_transaction(&mut self, id: TransactionId, method: u16, key: Option<Vec<u8>>) {
        if let Some(saved) = self.sent_ids.iter_mut().find(|t| t.id == id) {
            saved.method = method;
            saved.key = key;
            return;
        }
        if self.sent_ids.len() >= STUN_AGENT_MAX_SAVED_IDS {
            if let Some(evicted) = self.sent_ids.pop_front() {
                trace!("Evicting oldest STUN transaction {}", evicted.id);
            }
        }
        self.sent_ids.push_back(SavedTransaction { id, method, key });
    }

    /// Create a request and record its transaction with the credential key
    pub fn start_transaction(
        &mut self,
        method: StunMethod,
        credentials: Option<&StunCredentials>,
    ) -> (StunMessage, TransactionId) {
        let msg = self.init_request(method);
        let id = msg.transaction_id();
        self.save_transaction(id, method.code(), credentials.map(StunCredentials::key));
        (msg, id)
    }

    /// Remove a transaction from the table. Returns whether it was present.
    pub fn forget_transaction(&mut self, id: &TransactionId) -> bool {
        let before = self.sent_ids.len();
        self.sent_ids.retain(|t| t.id != *id);
        before != self.sent_ids.len()
    }

    /// Append SOFTWARE, MESSAGE-INTEGRITY and FINGERPRINT as the usage flags
    /// require and serialize. Requests are recorded in the transaction table.
    pub fn finish_message(
        &mut self,
        msg: &mut StunMessage,
        key: Option<&[u8]>,
    ) -> Result<Bytes, DecodeError> {
        if self.usage.contains(StunUsageFlags::ADD_SOFTWARE)
            && self.compatibility.uses_cookie()
            && msg.class() != MessageClass::Indication
        {
            if let Some(software) = &self.software {
                msg.append_string(StunAttributeType::Software.code(), software);
            }
        }

        if let Some(key) = key {
            let attr = StunAttributeType::MessageIntegrity.code();
            msg.append(attr, Bytes::from_static(&[0u8; MESSAGE_INTEGRITY_SIZE]));
            let wire = msg.encode();
            let offset = wire.len() - ATTRIBUTE_HEADER_SIZE - MESSAGE_INTEGRITY_SIZE;
            let mac = compute_message_integrity(
                &wire,
                offset,
                key,
                self.compatibility.pads_integrity(),
            )
            .ok_or(DecodeError::MissingContext("integrity key"))?;
            msg.set_last_value(attr, Bytes::copy_from_slice(&mac));
        }

        if self.usage.contains(StunUsageFlags::USE_FINGERPRINT) && self.compatibility.uses_cookie()
        {
            let attr = StunAttributeType::Fingerprint.code();
            msg.append(attr, Bytes::from_static(&[0u8; FINGERPRINT_SIZE]));
            let wire = msg.encode();
            let offset = wire.len() - ATTRIBUTE_HEADER_SIZE - FINGERPRINT_SIZE;
            let crc = compute_fingerprint(&wire, offset);
            msg.set_last_value(attr, Bytes::copy_from_slice(&crc.to_be_bytes()));
        }

        if msg.class() == MessageClass::Request {
            self.save_transaction(
                msg.transaction_id(),
                msg.method_code(),
                key.map(<[u8]>::to_vec),
            );
        }

        Ok(msg.encode())
    }

    fn requires_credentials(&self, class: MessageClass) -> bool {
        if self.usage.contains(StunUsageFlags::IGNORE_CREDENTIALS) {
            return false;
        }
        let uses_credentials = self.usage.contains(StunUsageFlags::SHORT_TERM_CREDENTIALS)
            || self.usage.contains(StunUsageFlags::LONG_TERM_CREDENTIALS);
        let exempt_indication = class == MessageClass::Indication
            && self.usage.contains(StunUsageFlags::NO_INDICATION_AUTH);
        uses_credentials && !exempt_indication
    }

    /// Validate an inbound datagram.
    ///
    /// `validater` maps a USERNAME to the password used to key requests
    /// (and responses under `FORCE_VALIDATER`). A matched response consumes
    /// its transaction.
    pub fn validate(
        &mut self,
        buf: &[u8],
        validater: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>,
    ) -> Validation {
        use StunValidationStatus as Status;

        if buf.len() < HEADER_SIZE || buf[0] & 0xC0 != 0 {
            return Validation::status(Status::NotStun);
        }
        let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let aligned = self.is_aligned();
        if aligned && declared % 4 != 0 {
            return Validation::status(Status::NotStun);
        }
        if HEADER_SIZE + declared > buf.len() {
            return Validation::status(Status::IncompleteStun);
        }
        if HEADER_SIZE + declared < buf.len() {
            return Validation::status(Status::NotStun);
        }

        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if self.compatibility.uses_cookie() && cookie != MAGIC_COOKIE {
            debug!("STUN message without magic cookie rejected");
            return Validation::status(Status::BadRequest);
        }

        let message = match StunMessage::decode(buf, aligned) {
            Ok(message) => message,
            Err(e) => {
                trace!("Undecodable STUN message: {}", e);
                return Validation::status(Status::NotStun);
            }
        };

        if self.usage.contains(StunUsageFlags::USE_FINGERPRINT) && self.compatibility.uses_cookie()
        {
            let fingerprint = StunAttributeType::Fingerprint.code();
            let valid = match find_attribute_offset(buf, fingerprint, aligned) {
                Some(offset) if offset + ATTRIBUTE_HEADER_SIZE + FINGERPRINT_SIZE == buf.len() => {
                    let value = message.find_u32(fingerprint);
                    value == Some(compute_fingerprint(buf, offset))
                }
                _ => false,
            };
            if !valid {
                debug!("STUN message with missing or bad FINGERPRINT");
                return Validation::with_message(Status::BadRequest, message);
            }
        }

        let class = message.class();
        let id = message.transaction_id();
        let saved_key = if class.is_response() {
            match self.sent_ids.iter().find(|t| t.id == id) {
                Some(saved) => {
                    if saved.method != message.method_code() {
                        trace!("Response method differs from request for {}", id);
                    }
                    saved.key.clone()
                }
                None => {
                    trace!("No outstanding request for response {}", id);
                    return Validation::with_message(Status::UnmatchedResponse, message);
                }
            }
        } else {
            None
        };

        let mut used_key = saved_key.clone();
        if self.requires_credentials(class) {
            let integrity = StunAttributeType::MessageIntegrity.code();
            match find_attribute_offset(buf, integrity, aligned) {
                None if class == MessageClass::ErrorResponse => {
                    // Challenges (401, 438) arrive without integrity
                }
                None => {
                    return Validation::with_message(Status::UnauthorizedBadRequest, message);
                }
                Some(offset) => {
                    let username = message.find(StunAttributeType::Username.code());
                    let use_validater = !class.is_response()
                        || (self.usage.contains(StunUsageFlags::FORCE_VALIDATER)
                            && username.is_some());
                    let key = if use_validater {
                        let Some(username) = username else {
                            return Validation::with_message(
                                Status::UnauthorizedBadRequest,
                                message,
                            );
                        };
                        let Some(password) = validater(username) else {
                            debug!("Unknown STUN username");
                            return Validation::with_message(Status::Unauthorized, message);
                        };
                        if self.usage.contains(StunUsageFlags::LONG_TERM_CREDENTIALS) {
                            let realm_attr =
                                StunAttributeType::Realm.code_for(self.compatibility);
                            let realm = message.find(realm_attr).unwrap_or_default();
                            Some(long_term_key(username, realm, &password).to_vec())
                        } else {
                            Some(password)
                        }
                    } else {
                        saved_key
                    };

                    if let Some(key) = &key {
                        let legacy = self.compatibility.pads_integrity();
                        if !verify_message_integrity(buf, offset, key, legacy) {
                            debug!("MESSAGE-INTEGRITY mismatch for {}", id);
                            return Validation::with_message(Status::Unauthorized, message);
                        }
                    }
                    used_key = key;
                }
            }
        }

        let mut unknown: Vec<u16> = Vec::new();
        for attr in message.attributes() {
            let code = attr.attr_type;
            if StunAttributeType::is_comprehension_required(code)
                && !self.known_attributes.contains(&code)
                && !unknown.contains(&code)
            {
                unknown.push(code);
            }
        }
        if !unknown.is_empty() {
            let status = if class == MessageClass::Request {
                Status::UnknownRequestAttribute
            } else {
                Status::UnknownAttribute
            };
            let mut validation = Validation::with_message(status, message);
            validation.key = used_key;
            validation.unknown_attributes = unknown;
            return validation;
        }

        if class.is_response() {
            self.forget_transaction(&id);
        }

        Validation {
            status: Status::Success,
            message: Some(message),
            key: used_key,
            unknown_attributes: Vec::new(),
        }
    }
}
