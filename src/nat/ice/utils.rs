// src/nat/ice/utils.rs
//! ICE utility functions

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;

use super::candidate::Candidate;
use super::config::Compatibility;

/// Characters allowed in ufrag and password (RFC 5245 Section 15.1)
pub const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

pub const STREAM_UFRAG_LEN: usize = 4;
pub const STREAM_PASSWORD_LEN: usize = 22;

/// Username length for Google candidates
pub const GOOGLE_USERNAME_LEN: usize = 16;

/// Random bytes behind base64 MSN/OC2007 credentials
pub const MSN_USERNAME_BYTES: usize = 32;
pub const MSN_PASSWORD_BYTES: usize = 16;

/// Random string over [`ICE_CHARS`]
pub fn random_ice_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ICE_CHARS[rng.gen_range(0..ICE_CHARS.len())] as char)
        .collect()
}

fn random_base64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    STANDARD.encode(bytes)
}

/// Stream-level (ufrag, password)
pub fn generate_stream_credentials(compatibility: Compatibility) -> (String, String) {
    if compatibility.base64_credentials() {
        (
            random_base64(MSN_USERNAME_BYTES),
            random_base64(MSN_PASSWORD_BYTES),
        )
    } else {
        (
            random_ice_string(STREAM_UFRAG_LEN),
            random_ice_string(STREAM_PASSWORD_LEN),
        )
    }
}

/// Fill in per-candidate credentials the compatibility mode needs, keeping
/// any inherited from a foundation match
pub fn generate_candidate_credentials(compatibility: Compatibility, candidate: &mut Candidate) {
    match compatibility {
        Compatibility::Msn | Compatibility::Oc2007 => {
            if !candidate.has_username() {
                candidate.username = Some(random_base64(MSN_USERNAME_BYTES));
            }
            if !candidate.has_password() {
                candidate.password = Some(random_base64(MSN_PASSWORD_BYTES));
            }
        }
        Compatibility::Google => {
            if !candidate.has_username() {
                candidate.username = Some(random_ice_string(GOOGLE_USERNAME_LEN));
                candidate.password = Some(String::new());
            }
        }
        _ => {}
    }
}

/// Password bytes used as the MESSAGE-INTEGRITY key
pub fn password_key(compatibility: Compatibility, password: &str) -> Vec<u8> {
    if compatibility.base64_credentials() {
        if let Ok(decoded) = STANDARD.decode(password) {
            return decoded;
        }
    }
    password.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::address::Address;
    use crate::nat::ice::candidate::{CandidateTransport, CandidateType};

    #[test]
    fn test_stream_credentials() {
        let (ufrag, password) = generate_stream_credentials(Compatibility::Rfc5245);
        assert_eq!(ufrag.len(), STREAM_UFRAG_LEN);
        assert_eq!(password.len(), STREAM_PASSWORD_LEN);
        assert!(ufrag.bytes().chain(password.bytes()).all(|b| ICE_CHARS.contains(&b)));

        let (ufrag, password) = generate_stream_credentials(Compatibility::Msn);
        assert_eq!(STANDARD.decode(&ufrag).unwrap().len(), 32);
        assert_eq!(password_key(Compatibility::Msn, &password).len(), 16);
    }

    #[test]
    fn test_candidate_credentials() {
        let addr = Address::udp("10.0.0.1:5000".parse().unwrap());
        let mut c = Candidate::new(CandidateType::Host, CandidateTransport::Udp, addr);

        generate_candidate_credentials(Compatibility::Rfc5245, &mut c);
        assert!(c.username.is_none());

        generate_candidate_credentials(Compatibility::Google, &mut c);
        assert_eq!(c.username.as_deref().map(str::len), Some(16));
        assert_eq!(c.password.as_deref(), Some(""));

        // Inherited credentials are kept
        let mut c = c.with_credentials("inherited", "secret");
        generate_candidate_credentials(Compatibility::Msn, &mut c);
        assert_eq!(c.username.as_deref(), Some("inherited"));
        assert_eq!(c.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_password_key() {
        assert_eq!(password_key(Compatibility::Rfc5245, "pass"), b"pass".to_vec());
        assert_eq!(password_key(Compatibility::Oc2007, "AAEC"), vec![0, 1, 2]);
    }
}
