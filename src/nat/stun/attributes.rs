// src/nat/stun/attributes.rs
//! STUN attribute types and value codecs
//!
//! Several attribute ids were reused across TURN drafts and Microsoft
//! dialects. [`StunAttributeType`] keeps one variant per meaning; the
//! numeric id is interpreted against a [`TurnDraft`] and a
//! [`StunCompatibility`] at the point of decoding.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::nat::address::AddressFamily;
use crate::nat::error::DecodeError;

use super::agent::StunCompatibility;
use super::codec::{DataStream, DataWriter};
use super::protocol::{TransactionId, TurnDraft};

/// Size of a MESSAGE-INTEGRITY value (HMAC-SHA1)
pub const MESSAGE_INTEGRITY_SIZE: usize = 20;

/// Size of a FINGERPRINT value (CRC-32)
pub const FINGERPRINT_SIZE: usize = 4;

/// Attribute types understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunAttributeType {
    MappedAddress,
    ResponseAddress,
    ChangeRequest,
    SourceAddress,
    ChangedAddress,
    Username,
    Password,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ReflectedFrom,
    ChannelNumber,
    Lifetime,
    MsAlternateServer,
    MagicCookie,
    Bandwidth,
    DestinationAddress,
    /// 0x0012 in TURN draft 04
    RemoteAddress,
    /// 0x0012 in TURN draft 09
    PeerAddress,
    /// 0x0012 from TURN draft 12 (RFC 5766)
    XorPeerAddress,
    Data,
    Realm,
    Nonce,
    /// 0x0016 in TURN drafts 04 and 09
    RelayAddress,
    /// 0x0016 from TURN draft 12 (RFC 5766)
    XorRelayedAddress,
    RequestedAddressType,
    /// 0x0018 in TURN draft 04
    RequestedPortProps,
    /// 0x0018 in TURN draft 09
    RequestedProps,
    /// 0x0018 from TURN draft 12 (RFC 5766)
    EvenPort,
    RequestedTransport,
    DontFragment,
    XorMappedAddress,
    TimerVal,
    /// 0x0022 in TURN draft 04
    RequestedIp,
    /// 0x0022 from TURN draft 12 (RFC 5766)
    ReservationToken,
    Priority,
    UseCandidate,
    Padding,
    ResponsePort,
    ConnectionId,
    MsVersion,
    MsXorMappedAddress,
    Software,
    AlternateServer,
    Fingerprint,
    IceControlled,
    IceControlling,
    ResponseOrigin,
    OtherAddress,
    MsSequenceNumber,
    CandidateIdentifier,
    MsImplementationVersion,
    Nomination,
    Unknown(u16),
}

impl StunAttributeType {
    /// Canonical wire id
    pub fn code(self) -> u16 {
        match self {
            Self::MappedAddress => 0x0001,
            Self::ResponseAddress => 0x0002,
            Self::ChangeRequest => 0x0003,
            Self::SourceAddress => 0x0004,
            Self::ChangedAddress => 0x0005,
            Self::Username => 0x0006,
            Self::Password => 0x0007,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::UnknownAttributes => 0x000A,
            Self::ReflectedFrom => 0x000B,
            Self::ChannelNumber => 0x000C,
            Self::Lifetime => 0x000D,
            Self::MsAlternateServer => 0x000E,
            Self::MagicCookie => 0x000F,
            Self::Bandwidth => 0x0010,
            Self::DestinationAddress => 0x0011,
            Self::RemoteAddress | Self::PeerAddress | Self::XorPeerAddress => 0x0012,
            Self::Data => 0x0013,
            Self::Realm => 0x0014,
            Self::Nonce => 0x0015,
            Self::RelayAddress | Self::XorRelayedAddress => 0x0016,
            Self::RequestedAddressType => 0x0017,
            Self::RequestedPortProps | Self::RequestedProps | Self::EvenPort => 0x0018,
            Self::RequestedTransport => 0x0019,
            Self::DontFragment => 0x001A,
            Self::XorMappedAddress => 0x0020,
            Self::TimerVal => 0x0021,
            Self::RequestedIp | Self::ReservationToken => 0x0022,
            Self::Priority => 0x0024,
            Self::UseCandidate => 0x0025,
            Self::Padding => 0x0026,
            Self::ResponsePort => 0x0027,
            Self::ConnectionId => 0x002A,
            Self::MsVersion => 0x8008,
            Self::MsXorMappedAddress => 0x8020,
            Self::Software => 0x8022,
            Self::AlternateServer => 0x8023,
            Self::Fingerprint => 0x8028,
            Self::IceControlled => 0x8029,
            Self::IceControlling => 0x802A,
            Self::ResponseOrigin => 0x802B,
            Self::OtherAddress => 0x802C,
            Self::MsSequenceNumber => 0x8050,
            Self::CandidateIdentifier => 0x8054,
            Self::MsImplementationVersion => 0x8070,
            Self::Nomination => 0xC001,
            Self::Unknown(code) => code,
        }
    }

    /// Wire id under a compatibility mode. OC2007 swaps REALM and NONCE.
    pub fn code_for(self, compatibility: StunCompatibility) -> u16 {
        match (self, compatibility) {
            (Self::Realm, StunCompatibility::Oc2007) => 0x0015,
            (Self::Nonce, StunCompatibility::Oc2007) => 0x0014,
            _ => self.code(),
        }
    }

    /// Interpret a wire id for the given TURN draft and compatibility mode
    pub fn from_code(code: u16, draft: TurnDraft, compatibility: StunCompatibility) -> Self {
        match code {
            0x0001 => Self::MappedAddress,
            0x0002 => Self::ResponseAddress,
            0x0003 => Self::ChangeRequest,
            0x0004 => Self::SourceAddress,
            0x0005 => Self::ChangedAddress,
            0x0006 => Self::Username,
            0x0007 => Self::Password,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000B => Self::ReflectedFrom,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x000E => Self::MsAlternateServer,
            0x000F => Self::MagicCookie,
            0x0010 => Self::Bandwidth,
            0x0011 => Self::DestinationAddress,
            0x0012 => match draft {
                TurnDraft::Draft00 | TurnDraft::Draft04 => Self::RemoteAddress,
                TurnDraft::Draft09 => Self::PeerAddress,
                TurnDraft::Rfc5766 => Self::XorPeerAddress,
            },
            0x0013 => Self::Data,
            0x0014 if compatibility == StunCompatibility::Oc2007 => Self::Nonce,
            0x0014 => Self::Realm,
            0x0015 if compatibility == StunCompatibility::Oc2007 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => match draft {
                TurnDraft::Rfc5766 => Self::XorRelayedAddress,
                _ => Self::RelayAddress,
            },
            0x0017 => Self::RequestedAddressType,
            0x0018 => match draft {
                TurnDraft::Draft00 | TurnDraft::Draft04 => Self::RequestedPortProps,
                TurnDraft::Draft09 => Self::RequestedProps,
                TurnDraft::Rfc5766 => Self::EvenPort,
            },
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x0020 => Self::XorMappedAddress,
            0x0021 => Self::TimerVal,
            0x0022 => match draft {
                TurnDraft::Rfc5766 => Self::ReservationToken,
                _ => Self::RequestedIp,
            },
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x0026 => Self::Padding,
            0x0027 => Self::ResponsePort,
            0x002A => Self::ConnectionId,
            0x8008 => Self::MsVersion,
            0x8020 => Self::MsXorMappedAddress,
            0x8022 => Self::Software,
            0x8023 => Self::AlternateServer,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            0x802B => Self::ResponseOrigin,
            0x802C => Self::OtherAddress,
            0x8050 => Self::MsSequenceNumber,
            0x8054 => Self::CandidateIdentifier,
            0x8070 => Self::MsImplementationVersion,
            0xC001 => Self::Nomination,
            other => Self::Unknown(other),
        }
    }

    /// Comprehension-required range per RFC 5389 Section 15
    pub fn is_comprehension_required(code: u16) -> bool {
        code < 0x8000
    }
}

/// Attribute ids every agent understands unless told otherwise
pub const KNOWN_ATTRIBUTES: &[u16] = &[
    0x0001, 0x0002, 0x0003, 0x0004, 0x0005, 0x0006, 0x0007, 0x0008, 0x0009, 0x000A, 0x000B,
    0x000C, 0x000D, 0x000E, 0x000F, 0x0010, 0x0011, 0x0012, 0x0013, 0x0014, 0x0015, 0x0016,
    0x0017, 0x0018, 0x0019, 0x001A, 0x0020, 0x0021, 0x0022, 0x0024, 0x0025, 0x0026, 0x0027,
    0x002A,
];

/// Encode/decode contract shared by attribute value types
pub trait AttributeCodec {
    /// Write the attribute value (without the TLV header)
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError>;

    /// Fill `self` from an attribute value
    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError>;

    /// Length of the encoded value, without padding
    fn encoded_size(&self) -> u16;
}

fn address_size(addr: &SocketAddr) -> u16 {
    match addr {
        SocketAddr::V4(_) => 8,
        SocketAddr::V6(_) => 20,
    }
}

fn read_family(reader: &mut DataStream<'_>) -> Result<AddressFamily, DecodeError> {
    let _reserved = reader.read_u8()?;
    match reader.read_u8()? {
        0x01 => Ok(AddressFamily::Ipv4),
        0x02 => Ok(AddressFamily::Ipv6),
        other => Err(DecodeError::InvalidFamily(other)),
    }
}

fn read_ip(reader: &mut DataStream<'_>, family: AddressFamily) -> Result<IpAddr, DecodeError> {
    let raw = reader.remaining_bytes();
    match (family, raw.len()) {
        (AddressFamily::Ipv4, 4) => Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        (AddressFamily::Ipv6, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        (_, len) => Err(DecodeError::InvalidAddressLength(len)),
    }
}

/// MAPPED-ADDRESS value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedAddress {
    pub addr: SocketAddr,
}

impl MappedAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Default for MappedAddress {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}

impl AttributeCodec for MappedAddress {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        writer.write_u8(0);
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                writer.write_u8(AddressFamily::Ipv4.wire_value());
                writer.write_u16(self.addr.port());
                writer.write_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                writer.write_u8(AddressFamily::Ipv6.wire_value());
                writer.write_u16(self.addr.port());
                writer.write_bytes(&ip.octets());
            }
        }
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        let family = read_family(reader)?;
        let port = reader.read_u16()?;
        let ip = read_ip(reader, family)?;
        self.addr = SocketAddr::new(ip, port);
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        address_size(&self.addr)
    }
}

/// XOR-MAPPED-ADDRESS value (also used for the XOR-PEER and XOR-RELAYED ids).
///
/// The port is masked with the top half of the magic cookie, IPv4 with the
/// cookie and IPv6 with the cookie followed by the 12 transaction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorMappedAddress {
    pub addr: SocketAddr,
    magic_cookie: Option<u32>,
    transaction_id: Option<TransactionId>,
}

impl XorMappedAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            magic_cookie: None,
            transaction_id: None,
        }
    }

    /// Value with the masking context of a message
    pub fn with_context(addr: SocketAddr, transaction_id: TransactionId) -> Self {
        let mut value = Self::new(addr);
        value.set_transaction_id(transaction_id);
        value
    }

    pub fn set_magic_cookie(&mut self, cookie: u32) {
        self.magic_cookie = Some(cookie);
    }

    /// Sets the transaction ID, and the cookie carried in its first four bytes
    pub fn set_transaction_id(&mut self, transaction_id: TransactionId) {
        self.magic_cookie = Some(transaction_id.magic_cookie());
        self.transaction_id = Some(transaction_id);
    }

    fn ipv4_mask(&self) -> Result<[u8; 4], DecodeError> {
        self.magic_cookie
            .map(u32::to_be_bytes)
            .ok_or(DecodeError::MissingContext("magic cookie"))
    }

    fn ipv6_mask(&self) -> Result<[u8; 16], DecodeError> {
        let cookie = self.ipv4_mask()?;
        let transaction_id = self
            .transaction_id
            .ok_or(DecodeError::MissingContext("transaction id"))?;
        let mut mask = [0u8; 16];
        mask[..4].copy_from_slice(&cookie);
        mask[4..].copy_from_slice(&transaction_id.as_bytes()[4..]);
        Ok(mask)
    }

    fn port_mask(&self) -> Result<u16, DecodeError> {
        let cookie = self
            .magic_cookie
            .ok_or(DecodeError::MissingContext("magic cookie"))?;
        Ok((cookie >> 16) as u16)
    }
}

impl Default for XorMappedAddress {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}

impl AttributeCodec for XorMappedAddress {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        let port = self.addr.port() ^ self.port_mask()?;
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                let mask = self.ipv4_mask()?;
                writer.write_u8(0);
                writer.write_u8(AddressFamily::Ipv4.wire_value());
                writer.write_u16(port);
                let mut octets = ip.octets();
                octets.iter_mut().zip(mask).for_each(|(b, m)| *b ^= m);
                writer.write_bytes(&octets);
            }
            IpAddr::V6(ip) => {
                let mask = self.ipv6_mask()?;
                writer.write_u8(0);
                writer.write_u8(AddressFamily::Ipv6.wire_value());
                writer.write_u16(port);
                let mut octets = ip.octets();
                octets.iter_mut().zip(mask).for_each(|(b, m)| *b ^= m);
                writer.write_bytes(&octets);
            }
        }
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        let family = read_family(reader)?;
        let port = reader.read_u16()? ^ self.port_mask()?;
        let ip = match read_ip(reader, family)? {
            IpAddr::V4(ip) => {
                let mut octets = ip.octets();
                octets.iter_mut().zip(self.ipv4_mask()?).for_each(|(b, m)| *b ^= m);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpAddr::V6(ip) => {
                let mut octets = ip.octets();
                octets.iter_mut().zip(self.ipv6_mask()?).for_each(|(b, m)| *b ^= m);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        self.addr = SocketAddr::new(ip, port);
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        address_size(&self.addr)
    }
}

/// USERNAME value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Username(pub String);

impl AttributeCodec for Username {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        writer.write_bytes(self.0.as_bytes());
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        self.0 = String::from_utf8(reader.copy_remaining_bytes())
            .map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        self.0.len() as u16
    }
}

/// SOFTWARE value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Software(pub String);

impl AttributeCodec for Software {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        writer.write_bytes(self.0.as_bytes());
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        self.0 = String::from_utf8(reader.copy_remaining_bytes())
            .map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        self.0.len() as u16
    }
}

/// MESSAGE-INTEGRITY value: the raw HMAC-SHA1 digest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageIntegrity(pub [u8; MESSAGE_INTEGRITY_SIZE]);

impl AttributeCodec for MessageIntegrity {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        writer.write_bytes(&self.0);
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        let raw = reader.remaining_bytes();
        if raw.len() != MESSAGE_INTEGRITY_SIZE {
            return Err(DecodeError::MalformedAttribute {
                attr_type: StunAttributeType::MessageIntegrity.code(),
                length: raw.len(),
            });
        }
        self.0.copy_from_slice(raw);
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        MESSAGE_INTEGRITY_SIZE as u16
    }
}

/// ERROR-CODE value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u16,
    pub reason: String,
}

impl ErrorCode {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: reason_phrase(code).to_string(),
        }
    }
}

impl AttributeCodec for ErrorCode {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        writer.write_u16(0);
        writer.write_u8((self.code / 100) as u8);
        writer.write_u8((self.code % 100) as u8);
        writer.write_bytes(self.reason.as_bytes());
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        let _reserved = reader.read_u16()?;
        let class = (reader.read_u8()? & 0x07) as u16;
        let number = reader.read_u8()? as u16;
        self.code = class * 100 + number;
        self.reason = String::from_utf8(reader.copy_remaining_bytes())
            .map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        4 + self.reason.len() as u16
    }
}

/// UNKNOWN-ATTRIBUTES value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnknownAttributes(pub Vec<u16>);

impl AttributeCodec for UnknownAttributes {
    fn encode(&self, writer: &mut DataWriter) -> Result<(), DecodeError> {
        for attr in &self.0 {
            writer.write_u16(*attr);
        }
        Ok(())
    }

    fn decode(&mut self, reader: &mut DataStream<'_>) -> Result<(), DecodeError> {
        self.0.clear();
        while reader.remaining() >= 2 {
            self.0.push(reader.read_u16()?);
        }
        Ok(())
    }

    fn encoded_size(&self) -> u16 {
        (self.0.len() * 2) as u16
    }
}

/// Reason phrases for the error codes the agent emits
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        300 => "Try alternate server",
        400 => "Bad request",
        401 => "Unauthorized",
        420 => "Unknown Attribute",
        438 => "Stale Nonce",
        487 => "Role conflict",
        500 => "Server Error",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::protocol::MAGIC_COOKIE;

    fn transaction() -> TransactionId {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        for (i, b) in bytes[4..].iter_mut().enumerate() {
            *b = 0xA0 + i as u8;
        }
        TransactionId::from_bytes(bytes)
    }

    #[test]
    fn test_mapped_address_layout() {
        let value = MappedAddress::new("192.0.2.1:32853".parse().unwrap());
        let mut writer = DataWriter::new();
        value.encode(&mut writer).unwrap();

        assert_eq!(writer.as_slice(), &[0x00, 0x01, 0x80, 0x55, 192, 0, 2, 1]);
        assert_eq!(value.encoded_size(), 8);
    }

    #[test]
    fn test_mapped_address_invalid_family() {
        let data = [0x00, 0x03, 0x00, 0x50, 1, 2, 3, 4];
        let mut decoded = MappedAddress::default();
        assert_eq!(
            decoded.decode(&mut DataStream::new(&data)),
            Err(DecodeError::InvalidFamily(0x03))
        );
    }

    #[test]
    fn test_mapped_address_invalid_length() {
        let data = [0x00, 0x01, 0x00, 0x50, 1, 2, 3];
        let mut decoded = MappedAddress::default();
        assert_eq!(
            decoded.decode(&mut DataStream::new(&data)),
            Err(DecodeError::InvalidAddressLength(3))
        );
    }

    #[test]
    fn test_xor_mapped_address_round_trip_ipv4() {
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let value = XorMappedAddress::with_context(addr, transaction());
        let mut writer = DataWriter::new();
        value.encode(&mut writer).unwrap();

        // RFC 5769 sample: port 32853 masks to 0xA147
        assert_eq!(&writer.as_slice()[2..4], &[0xA1, 0x47]);

        let mut decoded = XorMappedAddress::default();
        decoded.set_transaction_id(transaction());
        decoded.decode(&mut DataStream::new(writer.as_slice())).unwrap();
        assert_eq!(decoded.addr, addr);
    }

    #[test]
    fn test_xor_mapped_address_round_trip_ipv6() {
        let addr: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap();
        let value = XorMappedAddress::with_context(addr, transaction());
        let mut writer = DataWriter::new();
        value.encode(&mut writer).unwrap();
        assert_eq!(writer.len(), 20);

        let mut decoded = XorMappedAddress::default();
        decoded.set_transaction_id(transaction());
        decoded.decode(&mut DataStream::new(writer.as_slice())).unwrap();
        assert_eq!(decoded.addr, addr);
    }

    #[test]
    fn test_xor_mapped_address_requires_context() {
        let mut writer = DataWriter::new();
        let v4 = XorMappedAddress::new("10.0.0.1:80".parse().unwrap());
        assert_eq!(
            v4.encode(&mut writer),
            Err(DecodeError::MissingContext("magic cookie"))
        );

        let mut v6 = XorMappedAddress::new("[::1]:80".parse().unwrap());
        v6.set_magic_cookie(MAGIC_COOKIE);
        assert_eq!(
            v6.encode(&mut writer),
            Err(DecodeError::MissingContext("transaction id"))
        );
    }

    #[test]
    fn test_error_code() {
        let value = ErrorCode::new(487);
        let mut writer = DataWriter::new();
        value.encode(&mut writer).unwrap();
        assert_eq!(&writer.as_slice()[..4], &[0, 0, 4, 87]);

        let mut decoded = ErrorCode::default();
        decoded.decode(&mut DataStream::new(writer.as_slice())).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_username_rejects_invalid_utf8() {
        let mut decoded = Username::default();
        assert_eq!(
            decoded.decode(&mut DataStream::new(&[0xFF, 0xFE])),
            Err(DecodeError::InvalidUtf8)
        );
    }

    #[test]
    fn test_aliases_follow_draft() {
        let compat = StunCompatibility::Rfc5389;
        assert_eq!(
            StunAttributeType::from_code(0x0012, TurnDraft::Draft04, compat),
            StunAttributeType::RemoteAddress
        );
        assert_eq!(
            StunAttributeType::from_code(0x0012, TurnDraft::Rfc5766, compat),
            StunAttributeType::XorPeerAddress
        );
        assert_eq!(
            StunAttributeType::from_code(0x0014, TurnDraft::Rfc5766, StunCompatibility::Oc2007),
            StunAttributeType::Nonce
        );
        assert_eq!(StunAttributeType::Realm.code_for(StunCompatibility::Oc2007), 0x0015);
        assert_eq!(StunAttributeType::XorRelayedAddress.code(), 0x0016);
    }
}
