// src/nat/ice/foundation.rs
//! Foundation assignment and priority uniqueness (RFC 5245 Section 4.1.1.3)
//!
//! Two candidates share a foundation when they have the same type, transport
//! and base IP, and for relayed candidates the same TURN server. Foundations
//! are short decimal counters handed out per agent.

use tracing::trace;

use super::candidate::{Candidate, CandidateType, CANDIDATE_MAX_FOUNDATION};
use super::config::Compatibility;
use super::stream::{find_component, Stream};

fn same_turn_server(a: &Candidate, b: &Candidate) -> bool {
    match (a.turn.as_deref(), b.turn.as_deref()) {
        (Some(x), Some(y)) => x.equal_no_port(y),
        (None, None) => true,
        _ => false,
    }
}

/// Whether `candidate` may reuse the foundation of `existing`
pub fn foundation_matches(
    compatibility: Compatibility,
    candidate: &Candidate,
    existing: &Candidate,
) -> bool {
    if candidate.typ != existing.typ || candidate.transport != existing.transport {
        return false;
    }
    if !candidate.base_addr.equal_no_port(&existing.base_addr) {
        return false;
    }
    if candidate.typ == CandidateType::Relayed && !same_turn_server(candidate, existing) {
        return false;
    }
    // Google peers expect one foundation per relayed candidate
    !(compatibility == Compatibility::Google && existing.typ == CandidateType::Relayed)
}

/// Give `candidate` the foundation of a similar local candidate, or a new one.
///
/// `existing` must cover the local candidates of every stream. A match also
/// backfills missing per-candidate credentials.
pub fn assign_foundation<'a>(
    compatibility: Compatibility,
    candidate: &mut Candidate,
    existing: impl IntoIterator<Item = &'a Candidate>,
    next_candidate_id: &mut u32,
) {
    for other in existing {
        if !foundation_matches(compatibility, candidate, other) {
            continue;
        }
        candidate.foundation = other.foundation.clone();
        if !candidate.has_username() && other.has_username() {
            candidate.username = other.username.clone();
        }
        if !candidate.has_password() && other.password.is_some() {
            candidate.password = other.password.clone();
        }
        trace!(
            "Candidate {} reuses foundation {}",
            candidate.addr,
            candidate.foundation
        );
        return;
    }

    candidate.foundation = next_candidate_id.to_string();
    candidate.foundation.truncate(CANDIDATE_MAX_FOUNDATION - 1);
    *next_candidate_id = next_candidate_id.wrapping_add(1);
}

/// Foundation for a peer-reflexive candidate learned from the remote side
pub fn assign_remote_foundation<'a>(
    candidate: &mut Candidate,
    existing: impl IntoIterator<Item = &'a Candidate>,
    next_remote_candidate_id: &mut u32,
) {
    for other in existing {
        if other.typ == candidate.typ
            && other.transport == candidate.transport
            && other.base_addr.equal_no_port(&candidate.base_addr)
        {
            candidate.foundation = other.foundation.clone();
            return;
        }
    }

    candidate.foundation = format!("remote{}", next_remote_candidate_id);
    *next_remote_candidate_id = next_remote_candidate_id.wrapping_add(1);
}

/// Decrement `priority` until no local candidate and no pair of the
/// component uses it. Zero wraps to `u32::MAX`.
pub fn ensure_unique_priority(stream: &Stream, component_id: u32, mut priority: u32) -> u32 {
    let locals = find_component(&stream.components, component_id)
        .map(|c| c.local_candidates.as_slice())
        .unwrap_or(&[]);

    loop {
        if priority == 0 {
            priority = priority.wrapping_sub(1);
        }
        let in_use = locals.iter().any(|c| c.priority == priority)
            || stream
                .check_list
                .iter()
                .any(|p| p.component_id == component_id && p.prflx_priority == priority);
        if !in_use {
            return priority;
        }
        priority = priority.wrapping_sub(1);
    }
}

/// Pairs sharing a local candidate priority share their peer-reflexive
/// priority; otherwise `prflx_priority` is made unique.
pub fn ensure_unique_prflx_priority(
    stream: &Stream,
    component_id: u32,
    local_priority: u32,
    prflx_priority: u32,
) -> u32 {
    let shared = stream.check_list.iter().find(|p| {
        p.component_id == component_id
            && find_component(&stream.components, component_id)
                .and_then(|c| c.local_candidates.get(p.local))
                .map_or(false, |local| local.priority == local_priority)
    });
    match shared {
        Some(pair) => pair.prflx_priority,
        None => ensure_unique_priority(stream, component_id, prflx_priority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::address::Address;
    use crate::nat::ice::candidate::{CandidateTransport, RelayType, TurnServer};
    use crate::nat::ice::check_list::{CandidateCheckPair, CheckState};
    use crate::nat::ice::transport::SocketId;
    use crate::nat::stun::{StunAgent, StunCompatibility, StunUsageFlags};
    use std::sync::Arc;

    fn host(addr: &str, transport: CandidateTransport) -> Candidate {
        Candidate::new(
            CandidateType::Host,
            transport,
            Address::udp(addr.parse().unwrap()),
        )
        .with_component(1)
    }

    fn stream() -> Stream {
        let agent = StunAgent::new(StunCompatibility::Rfc5389, StunUsageFlags::empty());
        Stream::new(1, 1, agent, ("ufrg".into(), "password".into()))
    }

    #[test]
    fn test_same_base_shares_foundation() {
        let mut next = 1;
        let mut a = host("10.0.0.1:5000", CandidateTransport::Udp);
        assign_foundation(Compatibility::Rfc5245, &mut a, [], &mut next);
        assert_eq!(a.foundation, "1");

        let mut b = host("10.0.0.1:6000", CandidateTransport::Udp);
        assign_foundation(Compatibility::Rfc5245, &mut b, [&a], &mut next);
        assert_eq!(b.foundation, "1");

        // Different transport never shares
        let mut c = host("10.0.0.1:5000", CandidateTransport::TcpActive);
        assign_foundation(Compatibility::Rfc5245, &mut c, [&a, &b], &mut next);
        assert_eq!(c.foundation, "2");
        assert_eq!(next, 3);
    }

    #[test]
    fn test_foundation_backfills_credentials() {
        let mut next = 1;
        let mut a = host("10.0.0.1:5000", CandidateTransport::Udp).with_credentials("user", "pass");
        assign_foundation(Compatibility::Msn, &mut a, [], &mut next);

        let mut b = host("10.0.0.1:6000", CandidateTransport::Udp);
        assign_foundation(Compatibility::Msn, &mut b, [&a], &mut next);
        assert_eq!(b.foundation, a.foundation);
        assert_eq!(b.username.as_deref(), Some("user"));
        assert_eq!(b.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_relayed_foundations() {
        let turn = Arc::new(TurnServer::new(
            Address::udp("203.0.113.1:3478".parse().unwrap()),
            "u",
            "p",
            RelayType::TurnUdp,
        ));
        let mut a = host("198.51.100.1:4000", CandidateTransport::Udp);
        a.typ = CandidateType::Relayed;
        a.turn = Some(turn.clone());
        a.foundation = "7".into();

        let mut b = host("198.51.100.1:4002", CandidateTransport::Udp);
        b.typ = CandidateType::Relayed;
        b.turn = Some(turn);
        let mut next = 8;
        assign_foundation(Compatibility::Rfc5245, &mut b, [&a], &mut next);
        assert_eq!(b.foundation, "7");

        b.foundation.clear();
        assign_foundation(Compatibility::Google, &mut b, [&a], &mut next);
        assert_eq!(b.foundation, "8");
    }

    #[test]
    fn test_remote_foundation() {
        let mut next = 1;
        let mut a = host("10.0.0.2:5000", CandidateTransport::Udp);
        a.typ = CandidateType::PeerReflexive;
        assign_remote_foundation(&mut a, [], &mut next);
        assert_eq!(a.foundation, "remote1");

        let mut b = a.clone();
        b.foundation.clear();
        assign_remote_foundation(&mut b, [&a], &mut next);
        assert_eq!(b.foundation, "remote1");
        assert_eq!(next, 2);
    }

    #[test]
    fn test_unique_priority() {
        let mut stream = stream();
        let mut a = host("10.0.0.1:5000", CandidateTransport::Udp);
        a.priority = 1000;
        stream.components[0].local_candidates.push(a);

        assert_eq!(ensure_unique_priority(&stream, 1, 1000), 999);
        assert_eq!(ensure_unique_priority(&stream, 1, 1001), 1001);

        let pair = CandidateCheckPair::new(
            1,
            1,
            0,
            0,
            SocketId(1),
            "1:1".into(),
            1,
            999,
            CheckState::Frozen,
        );
        stream.check_list.insert_sorted(pair);
        assert_eq!(ensure_unique_priority(&stream, 1, 1000), 998);
    }

    #[test]
    fn test_unique_priority_wraps_at_zero() {
        let stream = stream();
        assert_eq!(ensure_unique_priority(&stream, 1, 0), u32::MAX);
    }

    #[test]
    fn test_prflx_priority_shared_by_local_candidate() {
        let mut stream = stream();
        let mut a = host("10.0.0.1:5000", CandidateTransport::Udp);
        a.priority = 5000;
        stream.components[0].local_candidates.push(a);
        stream.check_list.insert_sorted(CandidateCheckPair::new(
            1,
            1,
            0,
            0,
            SocketId(1),
            "1:1".into(),
            1,
            4000,
            CheckState::Frozen,
        ));

        assert_eq!(ensure_unique_prflx_priority(&stream, 1, 5000, 4500), 4000);
        assert_eq!(ensure_unique_prflx_priority(&stream, 1, 6000, 4000), 3999);
    }
}
