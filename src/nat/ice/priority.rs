// src/nat/ice/priority.rs
//! Candidate and pair priority calculation (RFC 5245 Section 4.1.2, 5.7.2)
//!
//! Besides the RFC formula this covers the Google Jingle, MSN and
//! MS-ICE2 preference tables used by the legacy compatibility modes.

use std::net::IpAddr;

use super::candidate::{Candidate, CandidateTransport, CandidateType, RelayType};
use super::config::Compatibility;

/// Type preferences (RFC 5245 Section 4.1.2.2)
pub const TYPE_PREF_HOST: u32 = 120;
pub const TYPE_PREF_PEER_REFLEXIVE: u32 = 110;
pub const TYPE_PREF_NAT_ASSISTED: u32 = 105;
pub const TYPE_PREF_SERVER_REFLEXIVE: u32 = 100;
pub const TYPE_PREF_RELAYED_UDP: u32 = 30;
pub const TYPE_PREF_RELAYED: u32 = 20;

/// ICE-TCP direction preferences (RFC 6544 Section 4.2)
pub const DIRECTION_PREF_ACTIVE_HOST: u32 = 4;
pub const DIRECTION_PREF_PASSIVE_HOST: u32 = 2;
pub const DIRECTION_PREF_SO_HOST: u32 = 6;
pub const DIRECTION_PREF_ACTIVE: u32 = 6;
pub const DIRECTION_PREF_PASSIVE: u32 = 4;
pub const DIRECTION_PREF_SO: u32 = 2;

/// MS-ICE2 transport and direction preferences
pub const MS_TRANSPORT_PREF_UDP: u32 = 15;
pub const MS_TRANSPORT_PREF_TCP: u32 = 6;
pub const MS_DIRECTION_PREF_ACTIVE: u32 = 5;
pub const MS_DIRECTION_PREF_PASSIVE: u32 = 2;

/// Google Jingle priorities, in thousandths
pub const JINGLE_PREF_HOST: u32 = 1000;
pub const JINGLE_PREF_SERVER_REFLEXIVE: u32 = 900;
pub const JINGLE_PREF_PEER_REFLEXIVE: u32 = 900;
pub const JINGLE_PREF_RELAYED: u32 = 500;

/// MSN priorities, in thousandths
pub const MSN_PREF_HOST: u32 = 830;
pub const MSN_PREF_SERVER_REFLEXIVE: u32 = 550;
pub const MSN_PREF_PEER_REFLEXIVE: u32 = 550;
pub const MSN_PREF_RELAYED: u32 = 450;

pub fn candidate_jingle_priority(candidate: &Candidate) -> u32 {
    match candidate.typ {
        CandidateType::Host => JINGLE_PREF_HOST,
        CandidateType::ServerReflexive => JINGLE_PREF_SERVER_REFLEXIVE,
        CandidateType::PeerReflexive => JINGLE_PREF_PEER_REFLEXIVE,
        CandidateType::Relayed => JINGLE_PREF_RELAYED,
    }
}

pub fn candidate_msn_priority(candidate: &Candidate) -> u32 {
    match candidate.typ {
        CandidateType::Host => MSN_PREF_HOST,
        CandidateType::ServerReflexive => MSN_PREF_SERVER_REFLEXIVE,
        CandidateType::PeerReflexive => MSN_PREF_PEER_REFLEXIVE,
        CandidateType::Relayed => MSN_PREF_RELAYED,
    }
}

/// Type preference, halved when the transport reliability does not match
/// what the stream asked for
pub fn ice_type_preference(candidate: &Candidate, reliable: bool, nat_assisted: bool) -> u32 {
    let preference = match candidate.typ {
        CandidateType::Host => TYPE_PREF_HOST,
        CandidateType::PeerReflexive => TYPE_PREF_PEER_REFLEXIVE,
        CandidateType::ServerReflexive if nat_assisted => TYPE_PREF_NAT_ASSISTED,
        CandidateType::ServerReflexive => TYPE_PREF_SERVER_REFLEXIVE,
        CandidateType::Relayed => match candidate.turn.as_deref().map(|t| t.relay_type) {
            Some(RelayType::TurnUdp) => TYPE_PREF_RELAYED_UDP,
            _ => TYPE_PREF_RELAYED,
        },
    };

    let udp = candidate.transport.is_udp();
    if (reliable && udp) || (!reliable && !udp) {
        preference / 2
    } else {
        preference
    }
}

/// Position of the candidate's IP in the interface list, or the list
/// length when it is not listed. Host candidates use their own address,
/// the other types their base.
pub fn ip_local_preference(candidate: &Candidate, local_ips: &[IpAddr]) -> u32 {
    let ip = match candidate.typ {
        CandidateType::Host => candidate.addr.ip(),
        _ => candidate.base_addr.ip(),
    };
    local_ips
        .iter()
        .position(|local| *local == ip)
        .unwrap_or(local_ips.len()) as u32
}

pub fn ice_local_preference_full(direction_preference: u32, other_preference: u32) -> u32 {
    0x2000 * direction_preference + other_preference
}

/// Local preference: 1 for UDP, direction and interface based for TCP
pub fn ice_local_preference(candidate: &Candidate, local_ips: &[IpAddr]) -> u32 {
    let host_like = matches!(
        candidate.typ,
        CandidateType::Host | CandidateType::ServerReflexive
    );
    let direction = match candidate.transport {
        CandidateTransport::Udp => return 1,
        CandidateTransport::TcpActive if host_like => DIRECTION_PREF_ACTIVE_HOST,
        CandidateTransport::TcpActive => DIRECTION_PREF_ACTIVE,
        CandidateTransport::TcpPassive if host_like => DIRECTION_PREF_PASSIVE_HOST,
        CandidateTransport::TcpPassive => DIRECTION_PREF_PASSIVE,
        CandidateTransport::TcpSimultaneousOpen if host_like => DIRECTION_PREF_SO_HOST,
        CandidateTransport::TcpSimultaneousOpen => DIRECTION_PREF_SO,
    };
    ice_local_preference_full(direction, ip_local_preference(candidate, local_ips))
}

pub fn ms_ice_local_preference_full(
    transport_preference: u32,
    direction_preference: u32,
    other_preference: u32,
) -> u32 {
    0x1000 * transport_preference + 0x200 * direction_preference + other_preference
}

pub fn ms_ice_local_preference(candidate: &Candidate, local_ips: &[IpAddr]) -> u32 {
    let (transport, direction) = match candidate.transport {
        CandidateTransport::TcpActive | CandidateTransport::TcpSimultaneousOpen => {
            (MS_TRANSPORT_PREF_TCP, MS_DIRECTION_PREF_ACTIVE)
        }
        CandidateTransport::TcpPassive => (MS_TRANSPORT_PREF_TCP, MS_DIRECTION_PREF_PASSIVE),
        CandidateTransport::Udp => (MS_TRANSPORT_PREF_UDP, 0),
    };
    ms_ice_local_preference_full(transport, direction, ip_local_preference(candidate, local_ips))
}

/// priority = 2^24 * type + 2^8 * local + (256 - component)
///
/// # Arguments
/// * `type_preference` - 0 to 126
/// * `local_preference` - 0 to 65535
/// * `component_id` - 1 to 256
pub fn candidate_ice_priority_full(
    type_preference: u32,
    local_preference: u32,
    component_id: u32,
) -> u32 {
    let priority = 0x1000000u64 * type_preference as u64
        + 0x100u64 * local_preference as u64
        + 0x100u64.saturating_sub(component_id as u64);
    priority.min(u32::MAX as u64) as u32
}

pub fn candidate_ice_priority(
    candidate: &Candidate,
    reliable: bool,
    nat_assisted: bool,
    local_ips: &[IpAddr],
) -> u32 {
    candidate_ice_priority_full(
        ice_type_preference(candidate, reliable, nat_assisted),
        ice_local_preference(candidate, local_ips),
        candidate.component_id,
    )
}

pub fn candidate_ms_ice_priority(
    candidate: &Candidate,
    reliable: bool,
    nat_assisted: bool,
    local_ips: &[IpAddr],
) -> u32 {
    candidate_ice_priority_full(
        ice_type_preference(candidate, reliable, nat_assisted),
        ms_ice_local_preference(candidate, local_ips),
        candidate.component_id,
    )
}

/// Candidate priority under the given compatibility mode
pub fn candidate_priority(
    compatibility: Compatibility,
    candidate: &Candidate,
    reliable: bool,
    nat_assisted: bool,
    local_ips: &[IpAddr],
) -> u32 {
    match compatibility {
        Compatibility::Google => candidate_jingle_priority(candidate),
        Compatibility::Msn | Compatibility::Oc2007 => candidate_msn_priority(candidate),
        Compatibility::Oc2007R2 => {
            candidate_ms_ice_priority(candidate, reliable, nat_assisted, local_ips)
        }
        Compatibility::Rfc5245 | Compatibility::Wlm2009 => {
            candidate_ice_priority(candidate, reliable, nat_assisted, local_ips)
        }
    }
}

/// Pair priority (RFC 5245 Section 5.7.2).
///
/// `controlling` is the priority of the controlling agent's candidate.
/// 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
pub fn candidate_pair_priority(controlling: u32, controlled: u32) -> u64 {
    let (min, max) = if controlling < controlled {
        (controlling, controlled)
    } else {
        (controlled, controlling)
    };
    ((min as u64) << 32) + 2 * max as u64 + u64::from(controlling > controlled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::address::Address;
    use crate::nat::ice::candidate::TurnServer;
    use std::sync::Arc;

    fn candidate(typ: CandidateType, transport: CandidateTransport, addr: &str) -> Candidate {
        let address = match transport {
            CandidateTransport::Udp => Address::udp(addr.parse().unwrap()),
            _ => Address::tcp(addr.parse().unwrap()),
        };
        Candidate::new(typ, transport, address).with_component(1)
    }

    #[test]
    fn test_pair_priority() {
        assert_eq!(
            candidate_pair_priority(100, 200),
            100 * (1u64 << 32) + 400
        );
        assert_eq!(
            candidate_pair_priority(200, 100),
            100 * (1u64 << 32) + 401
        );
        assert_eq!(candidate_pair_priority(7, 7), 7 * (1u64 << 32) + 14);
    }

    #[test]
    fn test_pair_priority_tie_break_bit() {
        // The bit is set when the controlling side's candidate is the higher one
        assert_eq!(candidate_pair_priority(5, 10), (5u64 << 32) | 20);
        assert_eq!(candidate_pair_priority(10, 5), (5u64 << 32) | 21);
    }

    #[test]
    fn test_ip_local_preference_address_by_type() {
        let ips: Vec<IpAddr> = vec!["10.0.0.9".parse().unwrap(), "10.0.0.1".parse().unwrap()];

        let mut host = candidate(CandidateType::Host, CandidateTransport::TcpActive, "10.0.0.1:9");
        host.base_addr = Address::tcp("10.0.0.9:9".parse().unwrap());
        assert_eq!(ip_local_preference(&host, &ips), 1);

        let mut prflx = candidate(
            CandidateType::PeerReflexive,
            CandidateTransport::TcpActive,
            "203.0.113.4:9",
        );
        prflx.base_addr = Address::tcp("10.0.0.1:9".parse().unwrap());
        assert_eq!(ip_local_preference(&prflx, &ips), 1);

        prflx.base_addr = prflx.addr;
        assert_eq!(ip_local_preference(&prflx, &ips), 2);
    }

    #[test]
    fn test_udp_host_priority() {
        let host = candidate(CandidateType::Host, CandidateTransport::Udp, "10.0.0.1:5000");
        let priority = candidate_ice_priority(&host, false, false, &[]);
        assert_eq!(priority, 0x1000000 * 120 + 0x100 + 255);

        // Asking for a reliable stream halves UDP preference
        let priority = candidate_ice_priority(&host, true, false, &[]);
        assert_eq!(priority, 0x1000000 * 60 + 0x100 + 255);
    }

    #[test]
    fn test_type_preferences() {
        let mut c = candidate(
            CandidateType::ServerReflexive,
            CandidateTransport::Udp,
            "198.51.100.1:5000",
        );
        assert_eq!(ice_type_preference(&c, false, false), TYPE_PREF_SERVER_REFLEXIVE);
        assert_eq!(ice_type_preference(&c, false, true), TYPE_PREF_NAT_ASSISTED);

        c.typ = CandidateType::Relayed;
        assert_eq!(ice_type_preference(&c, false, false), TYPE_PREF_RELAYED);
        c.turn = Some(Arc::new(TurnServer::new(
            Address::udp("203.0.113.1:3478".parse().unwrap()),
            "u",
            "p",
            RelayType::TurnUdp,
        )));
        assert_eq!(ice_type_preference(&c, false, false), TYPE_PREF_RELAYED_UDP);
    }

    #[test]
    fn test_tcp_local_preference() {
        let ips: Vec<IpAddr> = vec!["10.0.0.9".parse().unwrap(), "10.0.0.1".parse().unwrap()];
        let active = candidate(CandidateType::Host, CandidateTransport::TcpActive, "10.0.0.1:9");
        assert_eq!(ice_local_preference(&active, &ips), 0x2000 * 4 + 1);

        let passive = candidate(
            CandidateType::PeerReflexive,
            CandidateTransport::TcpPassive,
            "10.0.0.7:4000",
        );
        // Unlisted interface gets the list length
        assert_eq!(ice_local_preference(&passive, &ips), 0x2000 * 4 + 2);

        let so = candidate(
            CandidateType::Relayed,
            CandidateTransport::TcpSimultaneousOpen,
            "10.0.0.9:4000",
        );
        assert_eq!(ice_local_preference(&so, &ips), 0x2000 * 2);
    }

    #[test]
    fn test_ms_ice_local_preference() {
        let udp = candidate(CandidateType::Host, CandidateTransport::Udp, "10.0.0.1:5000");
        assert_eq!(ms_ice_local_preference(&udp, &[]), 0x1000 * 15);

        let passive = candidate(CandidateType::Host, CandidateTransport::TcpPassive, "10.0.0.1:5000");
        assert_eq!(ms_ice_local_preference(&passive, &[]), 0x1000 * 6 + 0x200 * 2);
    }

    #[test]
    fn test_legacy_tables() {
        let host = candidate(CandidateType::Host, CandidateTransport::Udp, "10.0.0.1:5000");
        assert_eq!(candidate_priority(Compatibility::Google, &host, false, false, &[]), 1000);
        assert_eq!(candidate_priority(Compatibility::Msn, &host, false, false, &[]), 830);
        assert_eq!(candidate_priority(Compatibility::Oc2007, &host, false, false, &[]), 830);
    }
}
