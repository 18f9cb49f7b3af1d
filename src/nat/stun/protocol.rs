// src/nat/stun/protocol.rs
//! STUN message model: header packing, transaction IDs and the attribute list

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use rand::RngCore;

use crate::nat::error::DecodeError;

use super::attributes::{
    AttributeCodec, ErrorCode, MappedAddress, StunAttributeType, UnknownAttributes,
    XorMappedAddress,
};
use super::codec::{DataStream, DataWriter};

/// STUN magic cookie as defined in RFC 5389
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Transaction ID size. The RFC 5389 cookie occupies the first four bytes.
pub const TRANSACTION_ID_SIZE: usize = 16;

/// Attribute TLV header size
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// TURN draft a numeric method or attribute id is interpreted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnDraft {
    Draft00,
    Draft04,
    Draft09,
    /// TURN draft 12 and RFC 5766
    Rfc5766,
}

/// Message class (RFC 5389 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::SuccessResponse => 0x0100,
            Self::ErrorResponse => 0x0110,
        }
    }

    fn from_bits(message_type: u16) -> Self {
        match message_type & 0x0110 {
            0x0000 => Self::Request,
            0x0010 => Self::Indication,
            0x0100 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Success or error response
    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// STUN methods. Ids reused across TURN drafts get one variant per meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunMethod {
    Binding,
    SharedSecret,
    Allocate,
    /// 0x004 from TURN draft 09
    Refresh,
    /// 0x004 in TURN draft 00
    Send,
    /// 0x004 in TURN draft 04
    SetActiveDestination,
    Connect,
    /// 0x006 before TURN draft 12
    OldSetActiveDestination,
    /// 0x006 indication from TURN draft 12
    IndSend,
    IndData,
    /// 0x008 indication in TURN draft 04
    IndConnectStatus,
    /// 0x008 from TURN draft 12
    CreatePermission,
    ChannelBind,
    Unknown(u16),
}

impl StunMethod {
    pub fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::SharedSecret => 0x002,
            Self::Allocate => 0x003,
            Self::Refresh | Self::Send | Self::SetActiveDestination => 0x004,
            Self::Connect => 0x005,
            Self::OldSetActiveDestination | Self::IndSend => 0x006,
            Self::IndData => 0x007,
            Self::IndConnectStatus | Self::CreatePermission => 0x008,
            Self::ChannelBind => 0x009,
            Self::Unknown(code) => code,
        }
    }

    /// Interpret a method id for a message class and TURN draft
    pub fn from_code(code: u16, class: MessageClass, draft: TurnDraft) -> Self {
        match code {
            0x001 => Self::Binding,
            0x002 => Self::SharedSecret,
            0x003 => Self::Allocate,
            0x004 => match draft {
                TurnDraft::Draft00 => Self::Send,
                TurnDraft::Draft04 => Self::SetActiveDestination,
                _ => Self::Refresh,
            },
            0x005 => Self::Connect,
            0x006 if class == MessageClass::Indication && draft == TurnDraft::Rfc5766 => {
                Self::IndSend
            }
            0x006 => Self::OldSetActiveDestination,
            0x007 => Self::IndData,
            0x008 if class == MessageClass::Indication && draft == TurnDraft::Draft04 => {
                Self::IndConnectStatus
            }
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            other => Self::Unknown(other),
        }
    }
}

/// Pack method and class into the 16-bit message type.
///
/// Method bits M11..M0 are split around the class bits: C1 sits at bit 8
/// and C0 at bit 4.
pub fn pack_message_type(class: MessageClass, method: u16) -> u16 {
    let m0 = method & 0x000F;
    let m1 = (method & 0x0070) << 1;
    let m2 = (method & 0x0F80) << 2;
    m0 | m1 | m2 | class.bits()
}

/// Inverse of [`pack_message_type`]
pub fn unpack_message_type(message_type: u16) -> (MessageClass, u16) {
    let method = (message_type & 0x000F)
        | ((message_type & 0x00E0) >> 1)
        | ((message_type & 0x3E00) >> 2);
    (MessageClass::from_bits(message_type), method)
}

/// The 16 header bytes after the length field.
///
/// RFC 5389 messages carry the magic cookie in the first four bytes;
/// RFC 3489 uses all sixteen as the transaction ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId([u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    pub fn from_bytes(bytes: [u8; TRANSACTION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Random ID, prefixed with the magic cookie when `with_cookie`
    pub fn random(with_cookie: bool) -> Self {
        let mut bytes = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        if with_cookie {
            bytes[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        &self.0
    }

    /// First four bytes as a big-endian word
    pub fn magic_cookie(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn has_magic_cookie(&self) -> bool {
        self.magic_cookie() == MAGIC_COOKIE
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One attribute as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub attr_type: u16,
    pub value: Bytes,
}

/// A STUN message.
///
/// `length` always equals the encoded size of the attribute list and is
/// recomputed on every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    class: MessageClass,
    method: u16,
    transaction_id: TransactionId,
    attributes: Vec<RawAttribute>,
    length: u16,
    aligned: bool,
}

fn padded(len: usize, aligned: bool) -> usize {
    if aligned {
        (len + 3) & !3
    } else {
        len
    }
}

impl StunMessage {
    pub fn new(
        class: MessageClass,
        method: StunMethod,
        transaction_id: TransactionId,
        aligned: bool,
    ) -> Self {
        Self {
            class,
            method: method.code(),
            transaction_id,
            attributes: Vec::new(),
            length: 0,
            aligned,
        }
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// Raw 12-bit method id
    pub fn method_code(&self) -> u16 {
        self.method
    }

    /// Method interpreted for a TURN draft
    pub fn method(&self, draft: TurnDraft) -> StunMethod {
        StunMethod::from_code(self.method, self.class, draft)
    }

    pub fn message_type(&self) -> u16 {
        pack_message_type(self.class, self.method)
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn magic_cookie(&self) -> u32 {
        self.transaction_id.magic_cookie()
    }

    pub fn has_cookie(&self) -> bool {
        self.transaction_id.has_magic_cookie()
    }

    /// Encoded size of the attribute list
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    pub fn attributes(&self) -> &[RawAttribute] {
        &self.attributes
    }

    fn recompute_length(&mut self) {
        let aligned = self.aligned;
        self.length = self
            .attributes
            .iter()
            .map(|a| ATTRIBUTE_HEADER_SIZE + padded(a.value.len(), aligned))
            .sum::<usize>() as u16;
    }

    /// Append a raw attribute value
    pub fn append(&mut self, attr_type: u16, value: impl Into<Bytes>) {
        self.attributes.push(RawAttribute {
            attr_type,
            value: value.into(),
        });
        self.recompute_length();
    }

    /// Append a value through its codec
    pub fn append_codec<A: AttributeCodec>(
        &mut self,
        attr_type: u16,
        value: &A,
    ) -> Result<(), DecodeError> {
        let mut writer = DataWriter::with_capacity(value.encoded_size() as usize);
        value.encode(&mut writer)?;
        self.append(attr_type, writer.into_bytes());
        Ok(())
    }

    pub fn append_flag(&mut self, attr_type: u16) {
        self.append(attr_type, Bytes::new());
    }

    pub fn append_u32(&mut self, attr_type: u16, value: u32) {
        self.append(attr_type, Bytes::copy_from_slice(&value.to_be_bytes()));
    }

    pub fn append_u64(&mut self, attr_type: u16, value: u64) {
        self.append(attr_type, Bytes::copy_from_slice(&value.to_be_bytes()));
    }

    pub fn append_string(&mut self, attr_type: u16, value: &str) {
        self.append(attr_type, Bytes::copy_from_slice(value.as_bytes()));
    }

    pub fn append_addr(&mut self, attr_type: u16, addr: SocketAddr) -> Result<(), DecodeError> {
        self.append_codec(attr_type, &MappedAddress::new(addr))
    }

    /// Append an address masked with this message's cookie and transaction ID
    pub fn append_xor_addr(&mut self, attr_type: u16, addr: SocketAddr) -> Result<(), DecodeError> {
        let value = XorMappedAddress::with_context(addr, self.transaction_id);
        self.append_codec(attr_type, &value)
    }

    pub fn append_error_code(&mut self, code: u16) -> Result<(), DecodeError> {
        self.append_codec(StunAttributeType::ErrorCode.code(), &ErrorCode::new(code))
    }

    pub fn append_unknown_attributes(&mut self, unknown: &[u16]) -> Result<(), DecodeError> {
        let value = UnknownAttributes(unknown.to_vec());
        self.append_codec(StunAttributeType::UnknownAttributes.code(), &value)
    }

    /// Replace the value of the last attribute of a type, keeping its size
    pub(crate) fn set_last_value(&mut self, attr_type: u16, value: Bytes) {
        if let Some(attr) = self
            .attributes
            .iter_mut()
            .rev()
            .find(|a| a.attr_type == attr_type)
        {
            attr.value = value;
        }
        self.recompute_length();
    }

    /// First value of an attribute type
    pub fn find(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type)
            .map(|a| a.value.as_ref())
    }

    pub fn has_attribute(&self, attr_type: u16) -> bool {
        self.find(attr_type).is_some()
    }

    pub fn find_flag(&self, attr_type: u16) -> bool {
        self.find(attr_type).map_or(false, |v| v.is_empty())
    }

    pub fn find_u32(&self, attr_type: u16) -> Option<u32> {
        let value = self.find(attr_type)?;
        DataStream::new(value).read_u32().ok()
    }

    pub fn find_u64(&self, attr_type: u16) -> Option<u64> {
        let value = self.find(attr_type)?;
        DataStream::new(value).read_u64().ok()
    }

    pub fn find_string(&self, attr_type: u16) -> Option<String> {
        let value = self.find(attr_type)?;
        String::from_utf8(value.to_vec()).ok()
    }

    fn find_codec<A: AttributeCodec>(&self, attr_type: u16, mut value: A) -> Result<A, DecodeError> {
        let raw = self.find(attr_type).ok_or(DecodeError::MalformedAttribute {
            attr_type,
            length: 0,
        })?;
        value.decode(&mut DataStream::new(raw))?;
        Ok(value)
    }

    pub fn find_addr(&self, attr_type: u16) -> Option<SocketAddr> {
        self.find_codec(attr_type, MappedAddress::default())
            .ok()
            .map(|v| v.addr)
    }

    pub fn find_xor_addr(&self, attr_type: u16) -> Option<SocketAddr> {
        let mut value = XorMappedAddress::default();
        value.set_transaction_id(self.transaction_id);
        self.find_codec(attr_type, value).ok().map(|v| v.addr)
    }

    pub fn find_error_code(&self) -> Option<u16> {
        self.find_codec(StunAttributeType::ErrorCode.code(), ErrorCode::default())
            .ok()
            .map(|v| v.code)
    }

    /// Serialize header and attributes
    pub fn encode(&self) -> Bytes {
        let mut writer = DataWriter::with_capacity(HEADER_SIZE + self.length as usize);
        writer.write_u16(self.message_type());
        writer.write_u16(self.length);
        writer.write_bytes(self.transaction_id.as_bytes());
        for attr in &self.attributes {
            writer.write_u16(attr.attr_type);
            writer.write_u16(attr.value.len() as u16);
            writer.write_bytes(&attr.value);
            let pad = padded(attr.value.len(), self.aligned) - attr.value.len();
            writer.write_zeros(pad);
        }
        writer.into_bytes()
    }

    /// Parse a complete message. The buffer must hold exactly one message.
    pub fn decode(buf: &[u8], aligned: bool) -> Result<Self, DecodeError> {
        let mut reader = DataStream::new(buf);
        let message_type = reader.read_u16()?;
        if message_type & 0xC000 != 0 {
            return Err(DecodeError::MalformedHeader("leading bits set"));
        }
        let length = reader.read_u16()? as usize;
        let mut id = [0u8; TRANSACTION_ID_SIZE];
        id.copy_from_slice(reader.read_bytes(TRANSACTION_ID_SIZE)?);
        if reader.remaining() != length {
            return Err(DecodeError::MalformedHeader("length mismatch"));
        }

        let (class, method) = unpack_message_type(message_type);
        let mut message = Self {
            class,
            method,
            transaction_id: TransactionId(id),
            attributes: Vec::new(),
            length: 0,
            aligned,
        };

        while !reader.is_empty() {
            let attr_type = reader.read_u16()?;
            let attr_len = reader.read_u16()? as usize;
            let value = reader
                .read_bytes(attr_len)
                .map_err(|_| DecodeError::MalformedAttribute {
                    attr_type,
                    length: attr_len,
                })?;
            let pad = padded(attr_len, aligned) - attr_len;
            // Some stacks omit padding on the final attribute
            if pad > 0 && reader.remaining() > 0 {
                reader.skip(pad).map_err(|_| DecodeError::MalformedAttribute {
                    attr_type,
                    length: attr_len,
                })?;
            }
            message.attributes.push(RawAttribute {
                attr_type,
                value: Bytes::copy_from_slice(value),
            });
        }
        message.recompute_length();
        Ok(message)
    }
}

/// Offset of the first attribute of a type in an encoded message
pub(crate) fn find_attribute_offset(buf: &[u8], attr_type: u16, aligned: bool) -> Option<usize> {
    let mut offset = HEADER_SIZE;
    while offset + ATTRIBUTE_HEADER_SIZE <= buf.len() {
        let ty = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        if ty == attr_type {
            return Some(offset);
        }
        offset += ATTRIBUTE_HEADER_SIZE + padded(len, aligned);
    }
    None
}
