// src/nat/stun/auth.rs
//! STUN credentials, MESSAGE-INTEGRITY and FINGERPRINT computation

use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

use super::attributes::{FINGERPRINT_SIZE, MESSAGE_INTEGRITY_SIZE};
use super::protocol::{ATTRIBUTE_HEADER_SIZE, HEADER_SIZE};

type HmacSha1 = Hmac<Sha1>;

/// XOR mask applied to the CRC-32 (RFC 5389 Section 15.5)
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

/// Credentials used to key MESSAGE-INTEGRITY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunCredentials {
    /// Short-term: the password is the key
    ShortTerm { username: String, password: String },
    /// Long-term: the key is MD5(username:realm:password)
    LongTerm {
        username: String,
        realm: String,
        password: String,
    },
}

impl StunCredentials {
    pub fn username(&self) -> &str {
        match self {
            Self::ShortTerm { username, .. } | Self::LongTerm { username, .. } => username,
        }
    }

    pub fn key(&self) -> Vec<u8> {
        match self {
            Self::ShortTerm { password, .. } => password.as_bytes().to_vec(),
            Self::LongTerm {
                username,
                realm,
                password,
            } => long_term_key(username.as_bytes(), realm.as_bytes(), password.as_bytes()).to_vec(),
        }
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self, Self::LongTerm { .. })
    }
}

/// MD5(username ":" realm ":" password)
pub fn long_term_key(username: &[u8], realm: &[u8], password: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username);
    hasher.update(b":");
    hasher.update(realm);
    hasher.update(b":");
    hasher.update(password);
    let mut key = [0u8; 16];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Copy of `buf[..offset]` with the header length covering `offset + trailer`
fn with_adjusted_length(buf: &[u8], offset: usize, trailer: usize) -> Vec<u8> {
    let mut input = buf[..offset].to_vec();
    let length = (offset + trailer - HEADER_SIZE) as u16;
    input[2..4].copy_from_slice(&length.to_be_bytes());
    input
}

/// HMAC-SHA1 over an encoded message whose MESSAGE-INTEGRITY attribute
/// starts at `offset`.
///
/// The length field is set as if the message ended right after the
/// integrity attribute. Legacy RFC 3489 peers hash the input zero-padded
/// to a multiple of 64 bytes.
pub fn compute_message_integrity(
    buf: &[u8],
    offset: usize,
    key: &[u8],
    legacy_padding: bool,
) -> Option<[u8; MESSAGE_INTEGRITY_SIZE]> {
    let mac = integrity_mac(buf, offset, key, legacy_padding)?;
    let mut value = [0u8; MESSAGE_INTEGRITY_SIZE];
    value.copy_from_slice(&mac.finalize().into_bytes());
    Some(value)
}

/// Check a received MESSAGE-INTEGRITY value in constant time
pub fn verify_message_integrity(
    buf: &[u8],
    offset: usize,
    key: &[u8],
    legacy_padding: bool,
) -> bool {
    let value_start = offset + ATTRIBUTE_HEADER_SIZE;
    let Some(expected) = buf.get(value_start..value_start + MESSAGE_INTEGRITY_SIZE) else {
        return false;
    };
    integrity_mac(buf, offset, key, legacy_padding)
        .map_or(false, |mac| mac.verify_slice(expected).is_ok())
}

fn integrity_mac(
    buf: &[u8],
    offset: usize,
    key: &[u8],
    legacy_padding: bool,
) -> Option<HmacSha1> {
    let mut input = with_adjusted_length(buf, offset, ATTRIBUTE_HEADER_SIZE + MESSAGE_INTEGRITY_SIZE);
    if legacy_padding {
        let padded = (input.len() + 63) & !63;
        input.resize(padded, 0);
    }
    let mut mac = HmacSha1::new_from_slice(key).ok()?;
    mac.update(&input);
    Some(mac)
}

/// CRC-32 of an encoded message whose FINGERPRINT attribute starts at `offset`
pub fn compute_fingerprint(buf: &[u8], offset: usize) -> u32 {
    let input = with_adjusted_length(buf, offset, ATTRIBUTE_HEADER_SIZE + FINGERPRINT_SIZE);
    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    crc.checksum(&input) ^ FINGERPRINT_XOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_term_key() {
        let key = long_term_key(b"user", b"example.org", b"pass");
        let expected = Md5::digest(b"user:example.org:pass");
        assert_eq!(&key[..], expected.as_slice());

        let creds = StunCredentials::LongTerm {
            username: "user".into(),
            realm: "example.org".into(),
            password: "pass".into(),
        };
        assert_eq!(creds.key(), key.to_vec());
        assert_ne!(long_term_key(b"user", b"other.org", b"pass"), key);
    }

    #[test]
    fn test_short_term_key_is_password() {
        let creds = StunCredentials::ShortTerm {
            username: "a:b".into(),
            password: "secret".into(),
        };
        assert_eq!(creds.key(), b"secret".to_vec());
        assert_eq!(creds.username(), "a:b");
        assert!(!creds.is_long_term());
    }

    #[test]
    fn test_integrity_round_trip() {
        // 20-byte header followed by a zeroed MESSAGE-INTEGRITY attribute
        let mut buf = vec![0u8; HEADER_SIZE + 24];
        buf[1] = 0x01;
        buf[HEADER_SIZE + 1] = 0x08;
        buf[HEADER_SIZE + 3] = 20;

        let mac = compute_message_integrity(&buf, HEADER_SIZE, b"key", false).unwrap();
        buf[HEADER_SIZE + 4..].copy_from_slice(&mac);

        assert!(verify_message_integrity(&buf, HEADER_SIZE, b"key", false));
        assert!(!verify_message_integrity(&buf, HEADER_SIZE, b"other", false));
        assert!(!verify_message_integrity(&buf, HEADER_SIZE, b"key", true));
    }
}
