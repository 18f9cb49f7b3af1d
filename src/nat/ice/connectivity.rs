// src/nat/ice/connectivity.rs
//! Connectivity checks (RFC 5245 Sections 5.7, 5.8 and 7)
//!
//! Pair formation, the Ta-paced check scheduler, inbound Binding request
//! handling with triggered checks, response processing, nomination and
//! keepalives on selected pairs.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::nat::address::Address;
use crate::nat::stun::{
    MessageClass, StunAttributeType, StunMessage, StunMethod, StunTimer, StunTimerReturn,
    StunValidationStatus, TransactionId,
};

use super::agent::{agent_pair_priority, Agent, PacketOutcome, Transmit};
use super::candidate::{
    Candidate, CandidateTransport, CandidateType, MAX_REMOTE_CANDIDATES, MAX_VALID_CANDIDATES,
};
use super::check_list::{CandidateCheckPair, CheckState, PairId, StunTransaction};
use super::config::{Compatibility, NominationMode};
use super::events::AgentEvent;
use super::foundation::{assign_remote_foundation, ensure_unique_prflx_priority};
use super::states::ComponentState;
use super::stream::{
    find_component, find_component_mut, Component, IncomingCheck, SelectedPair, Stream,
};
use super::transport::SocketId;
use super::utils::password_key;

/// Why a local/remote combination does not enter the check list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PairingRejected {
    #[error("server reflexive local candidates are not paired")]
    ServerReflexiveLocal,
    #[error("peer reflexive local candidates are not paired")]
    PeerReflexiveLocal,
    #[error("passive TCP local candidates do not send checks")]
    PassiveLocal,
    #[error("transports do not match")]
    TransportMismatch,
    #[error("address families differ")]
    FamilyMismatch,
    #[error("only relayed local candidates are paired")]
    RelayForced,
}

/// Pairing rules for a local and a remote candidate of one component
pub fn pairing_allowed(
    compatibility: Compatibility,
    local: &Candidate,
    remote: &Candidate,
) -> Result<(), PairingRejected> {
    // Server reflexive locals are represented by their base
    if local.typ == CandidateType::ServerReflexive
        && matches!(
            compatibility,
            Compatibility::Rfc5245 | Compatibility::Wlm2009 | Compatibility::Oc2007R2
        )
    {
        return Err(PairingRejected::ServerReflexiveLocal);
    }
    if local.typ == CandidateType::PeerReflexive && compatibility == Compatibility::Rfc5245 {
        return Err(PairingRejected::PeerReflexiveLocal);
    }
    if local.transport == CandidateTransport::TcpPassive {
        return Err(PairingRejected::PassiveLocal);
    }
    if remote.transport != local.transport.matching() {
        return Err(PairingRejected::TransportMismatch);
    }
    if local.addr.family() != remote.addr.family() {
        return Err(PairingRejected::FamilyMismatch);
    }
    Ok(())
}

fn local_username<'a>(stream_ufrag: &'a str, candidate: &'a Candidate) -> &'a str {
    candidate
        .username
        .as_deref()
        .filter(|u| !u.is_empty())
        .unwrap_or(stream_ufrag)
}

/// USERNAME of an outbound check: remote ufrag, then local ufrag
pub(crate) fn check_username(
    compatibility: Compatibility,
    local_ufrag: &str,
    remote_ufrag: &str,
    local: &Candidate,
    remote: &Candidate,
) -> String {
    let remote_part = local_username(remote_ufrag, remote);
    let local_part = local_username(local_ufrag, local);
    match compatibility {
        Compatibility::Google => format!("{}{}", remote_part, local_part),
        _ => format!("{}:{}", remote_part, local_part),
    }
}

/// Key for an inbound request whose USERNAME starts with one of our ufrags
fn inbound_key(
    compatibility: Compatibility,
    stream_ufrag: &str,
    stream_password: &str,
    component: Option<&Component>,
    username: &[u8],
) -> Option<Vec<u8>> {
    let candidate_credentials = component
        .into_iter()
        .flat_map(|c| c.local_candidates.iter())
        .filter_map(|c| Some((c.username.as_deref()?, c.password.as_deref().unwrap_or(""))));

    for (ufrag, password) in candidate_credentials.chain([(stream_ufrag, stream_password)]) {
        if ufrag.is_empty() || !username.starts_with(ufrag.as_bytes()) {
            continue;
        }
        let matched = match compatibility {
            Compatibility::Google => true,
            _ => username.get(ufrag.len()) == Some(&b':'),
        };
        if matched {
            return Some(password_key(compatibility, password));
        }
    }
    None
}

impl Agent {
    /// Run the connectivity check scheduler once and flush
    pub fn conn_check_tick(&mut self, now: Instant) -> bool {
        let keep_going = self.conn_check_tick_unlocked(now);
        self.flush();
        keep_going
    }

    pub(crate) fn conn_check_tick_unlocked(&mut self, now: Instant) -> bool {
        let mut keep_going = false;

        for si in 0..self.streams.len() {
            keep_going |= self.conn_check_refresh_timers(si, now);
        }

        // One new check per Ta across all streams
        for si in 0..self.streams.len() {
            if self.conn_check_start_next(si, now) {
                keep_going = true;
                break;
            }
        }

        for si in 0..self.streams.len() {
            keep_going |= self.conn_check_update_check_list_state(si);
        }

        keep_going |= self.conn_check_keepalives(now);
        keep_going
    }

    fn conn_check_refresh_timers(&mut self, si: usize, now: Instant) -> bool {
        let stream = &mut self.streams[si];
        let mut pending = false;
        let mut retransmits = Vec::new();

        for id in stream.check_list.ids() {
            let Some(pair) = stream.check_list.get_mut(id) else {
                continue;
            };
            if pair.state != CheckState::InProgress {
                continue;
            }
            let Some(transaction) = pair.stun_transactions.last_mut() else {
                pair.state = CheckState::Failed;
                continue;
            };

            match transaction.timer.refresh(now) {
                StunTimerReturn::Timeout => {
                    let tid = transaction.id;
                    debug!("Check for pair {} timed out", pair.foundation);
                    pair.state = CheckState::Failed;
                    pair.stun_transactions.clear();
                    stream.stun_agent.forget_transaction(&tid);
                }
                StunTimerReturn::Retransmit => {
                    pending = true;
                    if !pair.retransmit {
                        continue;
                    }
                    let to = find_component(&stream.components, pair.component_id)
                        .and_then(|c| c.remote_candidates.get(pair.remote))
                        .map(|r| r.addr);
                    if let Some(to) = to {
                        trace!("Retransmitting check for pair {}", pair.foundation);
                        retransmits.push(Transmit {
                            socket: pair.socket,
                            to,
                            data: transaction.message.clone(),
                        });
                    }
                }
                StunTimerReturn::Success => pending = true,
            }
        }

        self.outbox.extend(retransmits);
        pending
    }

    fn conn_check_start_next(&mut self, si: usize, now: Instant) -> bool {
        let compatibility = self.config.compatibility;
        if !compatibility.per_candidate_credentials() && !self.streams[si].has_remote_credentials() {
            return false;
        }

        while let Some(id) = self.streams[si].check_list.pop_triggered() {
            let waiting = self.streams[si]
                .check_list
                .get(id)
                .map_or(false, |p| p.state == CheckState::Waiting);
            if waiting {
                return self.conn_check_send(si, id, now);
            }
        }

        let mut next = self.first_waiting(si);
        if next.is_none() && self.unfreeze_next(si) {
            next = self.first_waiting(si);
        }
        match next {
            Some(id) => self.conn_check_send(si, id, now),
            None => false,
        }
    }

    fn first_waiting(&self, si: usize) -> Option<PairId> {
        self.streams[si]
            .check_list
            .iter()
            .find(|p| p.state == CheckState::Waiting)
            .map(|p| p.id)
    }

    /// Per foundation with no active pair, move the Frozen pair with the
    /// lowest component id (highest priority first) to Waiting
    fn unfreeze_next(&mut self, si: usize) -> bool {
        let check_list = &mut self.streams[si].check_list;
        let active: HashSet<&str> = check_list
            .iter()
            .filter(|p| matches!(p.state, CheckState::Waiting | CheckState::InProgress))
            .map(|p| p.foundation.as_str())
            .collect();

        let mut chosen: HashMap<&str, (u32, PairId)> = HashMap::new();
        for pair in check_list.iter() {
            if pair.state != CheckState::Frozen || active.contains(pair.foundation.as_str()) {
                continue;
            }
            match chosen.get(pair.foundation.as_str()) {
                Some((component_id, _)) if *component_id <= pair.component_id => {}
                _ => {
                    chosen.insert(pair.foundation.as_str(), (pair.component_id, pair.id));
                }
            }
        }

        let ids: Vec<PairId> = chosen.into_values().map(|(_, id)| id).collect();
        for id in &ids {
            if let Some(pair) = check_list.get_mut(*id) {
                debug!("Unfreezing pair {}", pair.foundation);
                pair.state = CheckState::Waiting;
            }
        }
        !ids.is_empty()
    }

    /// Encode a Binding request for a pair. The request is recorded in the
    /// stream's transaction table.
    fn build_check_request(
        &mut self,
        si: usize,
        id: PairId,
        use_candidate: bool,
    ) -> Option<(SocketId, Address, Bytes, TransactionId)> {
        let compatibility = self.config.compatibility;
        let controlling = self.controlling_mode;
        let tie_breaker = self.tie_breaker;

        let Stream {
            check_list,
            components,
            stun_agent,
            local_ufrag,
            remote_ufrag,
            remote_password,
            ..
        } = &mut self.streams[si];
        let pair = check_list.get(id)?;
        let component = find_component(components, pair.component_id)?;
        let local = component.local_candidates.get(pair.local)?;
        let remote = component.remote_candidates.get(pair.remote)?;

        let username = check_username(compatibility, local_ufrag, remote_ufrag, local, remote);
        let password = remote
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(remote_password.as_str());
        let key = match compatibility {
            Compatibility::Google => None,
            _ => Some(password_key(compatibility, password)),
        };

        let mut msg = stun_agent.init_request(StunMethod::Binding);
        if !username.is_empty() {
            msg.append_string(StunAttributeType::Username.code(), &username);
        }
        if compatibility != Compatibility::Google {
            msg.append_u32(StunAttributeType::Priority.code(), pair.prflx_priority);
        }
        if compatibility.supports_nomination() {
            if use_candidate {
                msg.append_flag(StunAttributeType::UseCandidate.code());
            }
            let role = if controlling {
                StunAttributeType::IceControlling
            } else {
                StunAttributeType::IceControlled
            };
            msg.append_u64(role.code(), tie_breaker);
        }

        let tid = msg.transaction_id();
        match stun_agent.finish_message(&mut msg, key.as_deref()) {
            Ok(wire) => Some((pair.socket, remote.addr, wire, tid)),
            Err(e) => {
                warn!("Failed to encode check for pair {}: {}", pair.foundation, e);
                None
            }
        }
    }

    /// Send a check on a pair and arm its retransmission timer
    fn conn_check_send(&mut self, si: usize, id: PairId, now: Instant) -> bool {
        let use_candidate = match self.streams[si].check_list.get(id) {
            Some(pair) => {
                self.controlling_mode
                    && self.config.compatibility.supports_nomination()
                    && (self.config.nomination_mode == NominationMode::Aggressive
                        || pair.use_candidate_on_next_check)
            }
            None => return false,
        };

        let Some((socket, to, wire, tid)) = self.build_check_request(si, id, use_candidate) else {
            if let Some(pair) = self.streams[si].check_list.get_mut(id) {
                pair.state = CheckState::Failed;
            }
            return false;
        };

        let timer = if self.socket_reliable(socket) {
            StunTimer::start_reliable(now, self.config.stun_reliable_timeout_ms)
        } else {
            StunTimer::start(
                now,
                self.config.stun_initial_timeout_ms,
                self.config.stun_max_retransmissions,
            )
        };

        let stream = &mut self.streams[si];
        let Some(pair) = stream.check_list.get_mut(id) else {
            return false;
        };
        for old in pair.stun_transactions.drain(..) {
            stream.stun_agent.forget_transaction(&old.id);
        }
        pair.stun_transactions.push(StunTransaction {
            id: tid,
            timer,
            message: wire.clone(),
        });
        pair.state = CheckState::InProgress;
        pair.controlling = self.controlling_mode;
        if use_candidate {
            pair.nominated = true;
        }
        debug!(
            "Sending check for pair {} to {}{}",
            pair.foundation,
            to,
            if use_candidate { " (USE-CANDIDATE)" } else { "" }
        );

        self.transmit(socket, to, wire);
        true
    }

    /// Nominate, or fail components whose checks are exhausted.
    /// Returns whether checks are still pending.
    fn conn_check_update_check_list_state(&mut self, si: usize) -> bool {
        let compatibility = self.config.compatibility;
        let regular_nomination = self.controlling_mode
            && compatibility.supports_nomination()
            && self.config.nomination_mode == NominationMode::Regular;

        let component_ids: Vec<u32> = self.streams[si].components.iter().map(|c| c.id).collect();
        let mut any_pending = false;

        for component_id in component_ids {
            let stream = &mut self.streams[si];
            let mut pending = stream.check_list.triggered_for_component(component_id);
            let mut any_pair = false;
            let mut all_failed = true;
            let mut nominating = false;

            for pair in stream.check_list.iter().filter(|p| p.component_id == component_id) {
                any_pair = true;
                pending |= pair.is_pending();
                all_failed &= pair.state == CheckState::Failed;
                nominating |= pair.use_candidate_on_next_check
                    && matches!(pair.state, CheckState::Waiting | CheckState::InProgress);
            }

            let selected = find_component(&stream.components, component_id)
                .map_or(false, |c| c.selected_pair.is_some());

            if regular_nomination && !selected && !nominating {
                // Nominate the best valid pair once no better pair is pending
                let best = stream.check_list.best_for_component(component_id, |p| {
                    p.is_pending() || (p.valid && p.state != CheckState::Failed)
                });
                let nominate = best.filter(|id| {
                    stream
                        .check_list
                        .get(*id)
                        .map_or(false, |p| p.valid && !p.is_pending())
                });
                if let Some(id) = nominate {
                    if let Some(pair) = stream.check_list.get_mut(id) {
                        info!("Nominating pair {}", pair.foundation);
                        pair.use_candidate_on_next_check = true;
                        pair.state = CheckState::Waiting;
                    }
                    stream.check_list.push_triggered_front(id);
                    pending = true;
                }
            }

            if any_pair && all_failed && !pending {
                self.set_component_state(si, component_id, ComponentState::Failed);
            }
            any_pending |= pending;
        }

        any_pending
    }

    fn conn_check_keepalives(&mut self, now: Instant) -> bool {
        let interval = Duration::from_millis(self.config.keepalive_interval_ms);
        let mut due = Vec::new();

        for (si, stream) in self.streams.iter_mut().enumerate() {
            for component in &mut stream.components {
                let Some(selected) = component.selected_pair else {
                    continue;
                };
                match component.keepalive_deadline {
                    Some(deadline) if now < deadline => {}
                    Some(_) => {
                        component.keepalive_deadline = Some(now + interval);
                        due.push((si, selected.pair));
                    }
                    None => component.keepalive_deadline = Some(now + interval),
                }
            }
        }

        let active = !due.is_empty()
            || self
                .streams
                .iter()
                .any(|s| s.components.iter().any(|c| c.selected_pair.is_some()));
        for (si, pair) in due {
            self.send_keepalive(si, pair);
        }
        active
    }

    fn send_keepalive(&mut self, si: usize, id: PairId) {
        if self.config.keepalive_conncheck {
            if let Some((socket, to, wire, _)) = self.build_check_request(si, id, false) {
                trace!("Keepalive check to {}", to);
                self.transmit(socket, to, wire);
            }
            return;
        }

        let stream = &mut self.streams[si];
        let Some(pair) = stream.check_list.get(id) else {
            return;
        };
        let Some(to) = find_component(&stream.components, pair.component_id)
            .and_then(|c| c.remote_candidates.get(pair.remote))
            .map(|r| r.addr)
        else {
            return;
        };
        let socket = pair.socket;

        let mut msg = stream.stun_agent.init_indication(StunMethod::Binding);
        match stream.stun_agent.finish_message(&mut msg, None) {
            Ok(wire) => {
                trace!("Keepalive indication to {}", to);
                self.transmit(socket, to, wire);
            }
            Err(e) => warn!("Failed to encode keepalive: {}", e),
        }
    }

    /// Pair a new local candidate with every remote candidate
    pub(crate) fn conn_check_add_for_local_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        local: usize,
    ) -> usize {
        let n_remote = find_component(&self.streams[si].components, component_id)
            .map_or(0, |c| c.remote_candidates.len());
        (0..n_remote)
            .filter(|remote| self.conn_check_add_for_candidate_pair(si, component_id, local, *remote))
            .count()
    }

    /// Pair a new remote candidate with every local candidate
    pub(crate) fn conn_check_add_for_remote_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        remote: usize,
    ) -> usize {
        let n_local = find_component(&self.streams[si].components, component_id)
            .map_or(0, |c| c.local_candidates.len());
        (0..n_local)
            .filter(|local| self.conn_check_add_for_candidate_pair(si, component_id, *local, remote))
            .count()
    }

    fn conn_check_add_for_candidate_pair(
        &mut self,
        si: usize,
        component_id: u32,
        local: usize,
        remote: usize,
    ) -> bool {
        let stream = &self.streams[si];
        let Some(component) = find_component(&stream.components, component_id) else {
            return false;
        };
        let (Some(l), Some(r)) = (
            component.local_candidates.get(local),
            component.remote_candidates.get(remote),
        ) else {
            return false;
        };

        let allowed = if self.config.force_relay && l.typ != CandidateType::Relayed {
            Err(PairingRejected::RelayForced)
        } else {
            pairing_allowed(self.config.compatibility, l, r)
        };
        if let Err(reason) = allowed {
            trace!("Not pairing {} with {}: {}", l.addr, r.addr, reason);
            return false;
        }
        if stream.check_list.find(component_id, local, remote).is_some() {
            return false;
        }

        if self
            .add_new_check_pair(si, component_id, local, remote, CheckState::Frozen)
            .is_none()
        {
            return false;
        }

        let connected = find_component(&self.streams[si].components, component_id)
            .map_or(false, |c| c.state.is_connected());
        if !connected {
            self.set_component_state(si, component_id, ComponentState::Connecting);
        }
        true
    }

    /// Insert a pair in priority order. Returns `None` when the local
    /// candidate has no socket or the pair was cut by the check list limit.
    pub(crate) fn add_new_check_pair(
        &mut self,
        si: usize,
        component_id: u32,
        local: usize,
        remote: usize,
        state: CheckState,
    ) -> Option<PairId> {
        let stream = &self.streams[si];
        let component = find_component(&stream.components, component_id)?;
        let l = component.local_candidates.get(local)?;
        let r = component.remote_candidates.get(remote)?;

        // Passive TCP answers on the connection the peer opened
        let socket = if l.transport == CandidateTransport::TcpPassive
            && r.typ == CandidateType::PeerReflexive
        {
            r.socket.or(l.socket)
        } else {
            l.socket
        };
        let Some(socket) = socket else {
            debug!("Local candidate {} has no socket", l.addr);
            return None;
        };

        let foundation = format!("{}:{}", l.foundation, r.foundation);
        let priority = agent_pair_priority(self.controlling_mode, l.priority, r.priority);
        let prflx_priority = ensure_unique_prflx_priority(
            stream,
            component_id,
            l.priority,
            self.peer_reflexive_candidate_priority(l),
        );
        debug!(
            "Stream {}: new pair {} ({} -> {}) priority {} {:?}",
            stream.id, foundation, l.addr, r.addr, priority, state
        );
        let pair = CandidateCheckPair::new(
            stream.id,
            component_id,
            local,
            remote,
            socket,
            foundation,
            priority,
            prflx_priority,
            state,
        );

        let max_conn_checks = self.config.max_conn_checks;
        let limited = self.config.compatibility == Compatibility::Rfc5245;
        let stream = &mut self.streams[si];
        let id = stream.check_list.insert_sorted(pair);
        if limited {
            for dropped in stream.check_list.truncate(max_conn_checks) {
                for transaction in &dropped.stun_transactions {
                    stream.stun_agent.forget_transaction(&transaction.id);
                }
            }
        }
        stream.check_list.get(id).map(|_| id)
    }

    /// Route a datagram received on a component's socket
    pub(crate) fn conn_check_handle_packet(
        &mut self,
        si: usize,
        component_id: u32,
        socket: SocketId,
        from: Address,
        data: &[u8],
    ) -> PacketOutcome {
        use StunValidationStatus as Status;

        let compatibility = self.config.compatibility;
        let Stream {
            stun_agent,
            components,
            local_ufrag,
            local_password,
            ..
        } = &mut self.streams[si];
        let component = find_component(components, component_id);
        let (ufrag, password) = (local_ufrag.as_str(), local_password.as_str());
        let validation = stun_agent.validate(data, &mut |username| {
            inbound_key(compatibility, ufrag, password, component, username)
        });

        match validation.status {
            Status::NotStun | Status::IncompleteStun => return PacketOutcome::Data,
            Status::Success => {}
            Status::UnmatchedResponse => {
                trace!("Unmatched STUN response from {}", from);
                return PacketOutcome::Stun;
            }
            status => {
                let request = validation
                    .message
                    .as_ref()
                    .filter(|m| m.class() == MessageClass::Request);
                if let Some(request) = request {
                    let code = match status {
                        Status::Unauthorized => Some(401),
                        Status::UnknownRequestAttribute => Some(420),
                        Status::BadRequest | Status::UnauthorizedBadRequest => Some(400),
                        _ => None,
                    };
                    if let Some(code) = code {
                        self.send_error_response(
                            si,
                            socket,
                            from,
                            request,
                            code,
                            &validation.unknown_attributes,
                            None,
                        );
                    }
                }
                debug!("Dropping STUN message from {}: {:?}", from, status);
                return PacketOutcome::Stun;
            }
        }

        let Some(msg) = validation.message else {
            return PacketOutcome::Stun;
        };
        match msg.class() {
            MessageClass::Request if msg.method_code() == StunMethod::Binding.code() => {
                self.handle_inbound_request(si, component_id, socket, from, &msg, validation.key);
            }
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                self.handle_inbound_response(si, socket, from, &msg);
            }
            MessageClass::Indication => trace!("Keepalive from {}", from),
            MessageClass::Request => {
                debug!("Ignoring request with method 0x{:03X}", msg.method_code());
            }
        }
        PacketOutcome::Stun
    }

    #[allow(clippy::too_many_arguments)]
    fn send_error_response(
        &mut self,
        si: usize,
        socket: SocketId,
        to: Address,
        request: &StunMessage,
        code: u16,
        unknown_attributes: &[u16],
        key: Option<&[u8]>,
    ) {
        let stun_agent = &mut self.streams[si].stun_agent;
        let response = if code == 420 {
            stun_agent.init_unknown_attributes_error(request, unknown_attributes)
        } else {
            stun_agent.init_error(request, code)
        };
        match response.and_then(|mut msg| stun_agent.finish_message(&mut msg, key)) {
            Ok(wire) => {
                debug!("Sending {} response to {}", code, to);
                self.transmit(socket, to, wire);
            }
            Err(e) => warn!("Failed to encode {} response: {}", code, e),
        }
    }

    fn send_binding_response(
        &mut self,
        si: usize,
        socket: SocketId,
        to: Address,
        request: &StunMessage,
        key: Option<&[u8]>,
    ) {
        let compatibility = self.config.compatibility;
        let stun_agent = &mut self.streams[si].stun_agent;
        let mut response = stun_agent.init_response(request);

        let appended = if stun_agent.compatibility().uses_cookie() {
            response.append_xor_addr(StunAttributeType::XorMappedAddress.code(), to.socket_addr())
        } else {
            response.append_addr(StunAttributeType::MappedAddress.code(), to.socket_addr())
        };
        if let Err(e) = appended {
            warn!("Failed to encode mapped address {}: {}", to, e);
            return;
        }
        if compatibility.per_candidate_credentials() {
            if let Some(username) = request.find(StunAttributeType::Username.code()) {
                response.append(
                    StunAttributeType::Username.code(),
                    Bytes::copy_from_slice(username),
                );
            }
        }

        let key = if compatibility == Compatibility::Google { None } else { key };
        match stun_agent.finish_message(&mut response, key) {
            Ok(wire) => {
                trace!("Binding response to {}", to);
                self.transmit(socket, to, wire);
            }
            Err(e) => warn!("Failed to encode Binding response: {}", e),
        }
    }

    fn handle_inbound_request(
        &mut self,
        si: usize,
        component_id: u32,
        socket: SocketId,
        from: Address,
        msg: &StunMessage,
        key: Option<Vec<u8>>,
    ) {
        let compatibility = self.config.compatibility;

        if compatibility.supports_nomination() {
            if self.controlling_mode {
                if let Some(theirs) = msg.find_u64(StunAttributeType::IceControlling.code()) {
                    if self.tie_breaker >= theirs {
                        debug!("Role conflict with {}, keeping controlling role", from);
                        self.send_error_response(si, socket, from, msg, 487, &[], key.as_deref());
                        return;
                    }
                    debug!("Role conflict with {}, yielding controlling role", from);
                    self.switch_role(false);
                }
            } else if let Some(theirs) = msg.find_u64(StunAttributeType::IceControlled.code()) {
                if self.tie_breaker >= theirs {
                    debug!("Role conflict with {}, taking controlling role", from);
                    self.switch_role(true);
                } else {
                    debug!("Role conflict with {}, keeping controlled role", from);
                    self.send_error_response(si, socket, from, msg, 487, &[], key.as_deref());
                    return;
                }
            }
        }

        let priority = msg.find_u32(StunAttributeType::Priority.code()).unwrap_or(0);
        let use_candidate = msg.find_flag(StunAttributeType::UseCandidate.code());
        let username = msg
            .find(StunAttributeType::Username.code())
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        self.send_binding_response(si, socket, from, msg, key.as_deref());

        let stream = &mut self.streams[si];
        if !stream.initial_binding_request_received {
            stream.initial_binding_request_received = true;
            let stream_id = stream.id;
            self.events
                .push(AgentEvent::InitialBindingRequestReceived { stream_id });
        }

        let stream = &mut self.streams[si];
        let missing_credentials =
            !compatibility.per_candidate_credentials() && !stream.has_remote_credentials();
        let Some(component) = find_component_mut(&mut stream.components, component_id) else {
            return;
        };
        if missing_credentials || component.remote_candidates.is_empty() {
            if component.incoming_checks.len() < MAX_REMOTE_CANDIDATES {
                debug!("Queueing early check from {}", from);
                component.incoming_checks.push(IncomingCheck {
                    from,
                    socket,
                    priority,
                    use_candidate,
                    username,
                });
            }
            return;
        }

        self.schedule_triggered_check(si, component_id, socket, from, priority, use_candidate);
    }

    /// Replay checks that arrived before credentials and candidates
    pub(crate) fn conn_check_process_incoming_checks(&mut self, si: usize, component_id: u32) {
        let compatibility = self.config.compatibility;
        let stream = &mut self.streams[si];
        if !compatibility.per_candidate_credentials() && !stream.has_remote_credentials() {
            return;
        }
        let Some(component) = find_component_mut(&mut stream.components, component_id) else {
            return;
        };
        if component.remote_candidates.is_empty() {
            return;
        }

        for check in std::mem::take(&mut component.incoming_checks) {
            debug!("Processing early check from {}", check.from);
            self.schedule_triggered_check(
                si,
                component_id,
                check.socket,
                check.from,
                check.priority,
                check.use_candidate,
            );
        }
    }

    fn learn_remote_peer_reflexive_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        socket: SocketId,
        from: Address,
        priority: u32,
    ) -> Option<usize> {
        let stream = &mut self.streams[si];
        let stream_id = stream.id;
        let component = find_component_mut(&mut stream.components, component_id)?;
        if component.remote_candidates.len() >= MAX_REMOTE_CANDIDATES {
            warn!("Too many remote candidates, ignoring check from {}", from);
            return None;
        }

        let local_transport = component
            .local_candidates
            .iter()
            .find(|l| l.socket == Some(socket))
            .map_or(CandidateTransport::Udp, |l| l.transport);
        let mut candidate =
            Candidate::new(CandidateType::PeerReflexive, local_transport.matching(), from);
        candidate.priority = priority;
        candidate.stream_id = stream_id;
        candidate.component_id = component_id;
        candidate.socket = Some(socket);
        assign_remote_foundation(
            &mut candidate,
            component.remote_candidates.iter(),
            &mut self.next_remote_candidate_id,
        );

        info!("Learned remote peer reflexive candidate {}", candidate);
        let foundation = candidate.foundation.clone();
        component.remote_candidates.push(candidate);
        let index = component.remote_candidates.len() - 1;

        self.events.push(AgentEvent::NewRemoteCandidate {
            stream_id,
            component_id,
            foundation,
        });
        self.conn_check_add_for_remote_candidate(si, component_id, index);
        Some(index)
    }

    /// Queue a triggered check toward the source of an inbound request
    fn schedule_triggered_check(
        &mut self,
        si: usize,
        component_id: u32,
        socket: SocketId,
        from: Address,
        priority: u32,
        use_candidate: bool,
    ) {
        let known = find_component(&self.streams[si].components, component_id)
            .and_then(|c| c.find_remote(&from));
        let remote = match known {
            Some(index) => index,
            None => match self.learn_remote_peer_reflexive_candidate(
                si,
                component_id,
                socket,
                from,
                priority,
            ) {
                Some(index) => index,
                None => return,
            },
        };

        let nominate = use_candidate && !self.controlling_mode;
        let stream = &mut self.streams[si];
        let existing = stream
            .check_list
            .iter()
            .find(|p| p.component_id == component_id && p.remote == remote && p.socket == socket)
            .map(|p| (p.id, p.state, p.valid, p.discovered_pair));

        let Some((id, state, valid, discovered)) = existing else {
            let local = find_component(&stream.components, component_id).and_then(|c| {
                c.local_candidates.iter().position(|l| {
                    l.socket == Some(socket)
                        && matches!(l.typ, CandidateType::Host | CandidateType::Relayed)
                })
            });
            let Some(local) = local else {
                debug!("No local candidate on {} for check from {}", socket, from);
                return;
            };
            let priority = find_component(&stream.components, component_id).and_then(|c| {
                let l = c.local_candidates.get(local)?;
                let r = c.remote_candidates.get(remote)?;
                Some(agent_pair_priority(self.controlling_mode, l.priority, r.priority))
            });
            if !nominate && priority.map_or(false, |p| self.outranked_by_success(si, component_id, p)) {
                trace!("Not pairing {} behind a succeeded pair", from);
                return;
            }
            if let Some(id) = self.add_new_check_pair(
                si,
                component_id,
                local,
                remote,
                CheckState::Waiting,
            ) {
                let check_list = &mut self.streams[si].check_list;
                if let Some(pair) = check_list.get_mut(id) {
                    pair.mark_nominated_on_response_arrival = nominate;
                }
                check_list.push_triggered(id);
                let connected = find_component(&self.streams[si].components, component_id)
                    .map_or(false, |c| c.state.is_connected());
                if !connected {
                    self.set_component_state(si, component_id, ComponentState::Connecting);
                }
            }
            return;
        };

        match state {
            CheckState::InProgress => {
                if nominate {
                    if let Some(pair) = stream.check_list.get_mut(id) {
                        pair.mark_nominated_on_response_arrival = true;
                    }
                }
                trace!("Check already in progress for pair {}", id);
            }
            CheckState::Succeeded | CheckState::Discovered => {
                if !nominate {
                    return;
                }
                let valid_id = if valid { Some(id) } else { discovered };
                if let Some(valid_id) = valid_id {
                    if let Some(pair) = stream.check_list.get_mut(valid_id) {
                        debug!("Peer nominated pair {}", pair.foundation);
                        pair.nominated = true;
                    }
                    self.update_selected_pair(si, component_id, valid_id);
                }
            }
            CheckState::Frozen | CheckState::Waiting | CheckState::Failed => {
                let priority = stream.check_list.get(id).map_or(0, |p| p.priority);
                if !nominate && self.outranked_by_success(si, component_id, priority) {
                    trace!("No triggered check for pair {} behind a succeeded pair", id);
                    return;
                }
                let stream = &mut self.streams[si];
                if let Some(pair) = stream.check_list.get_mut(id) {
                    pair.state = CheckState::Waiting;
                    if nominate {
                        pair.mark_nominated_on_response_arrival = true;
                    }
                    debug!("Triggered check for pair {}", pair.foundation);
                }
                stream.check_list.push_triggered(id);
            }
        }
    }

    fn handle_inbound_response(
        &mut self,
        si: usize,
        socket: SocketId,
        from: Address,
        msg: &StunMessage,
    ) {
        let compatibility = self.config.compatibility;
        let tid = msg.transaction_id();
        let stream = &mut self.streams[si];

        let Some(id) = stream.check_list.find_by_transaction(&tid) else {
            trace!("Response {} matches no pair", tid);
            return;
        };
        let Some(pair) = stream.check_list.get_mut(id) else {
            return;
        };
        pair.stun_transactions.clear();
        stream.stun_agent.forget_transaction(&tid);
        if pair.state != CheckState::InProgress {
            trace!("Late response for pair {}", pair.foundation);
            return;
        }
        let component_id = pair.component_id;
        let (local_idx, remote_idx, pair_socket) = (pair.local, pair.remote, pair.socket);

        if msg.class() == MessageClass::ErrorResponse {
            let code = msg.find_error_code();
            if code == Some(487) && compatibility.supports_nomination() {
                let sent_controlling = pair.controlling;
                pair.state = CheckState::Waiting;
                stream.check_list.push_triggered(id);
                debug!("Peer reported a role conflict");
                if sent_controlling == self.controlling_mode {
                    self.switch_role(!sent_controlling);
                }
            } else {
                debug!("Check for pair {} failed with {:?}", pair.foundation, code);
                pair.state = CheckState::Failed;
            }
            return;
        }

        let Some(component) = find_component(&stream.components, component_id) else {
            return;
        };
        let (Some(local), Some(remote)) = (
            component.local_candidates.get(local_idx),
            component.remote_candidates.get(remote_idx),
        ) else {
            return;
        };

        if remote.addr != from || pair_socket != socket {
            debug!(
                "Non-symmetric response for pair {} from {} on {}",
                pair.foundation, from, socket
            );
            pair.state = CheckState::Failed;
            return;
        }

        let mapped = msg
            .find_xor_addr(StunAttributeType::XorMappedAddress.code())
            .or_else(|| msg.find_xor_addr(StunAttributeType::MsXorMappedAddress.code()))
            .or_else(|| msg.find_addr(StunAttributeType::MappedAddress.code()));
        let Some(mapped) = mapped else {
            debug!("Response for pair {} has no mapped address", pair.foundation);
            pair.state = CheckState::Failed;
            return;
        };
        let mapped = Address::new(local.addr.network(), mapped);
        let local_addr = local.addr;
        let valid_remote = remote.clone();

        let ok_pair = if mapped == local_addr {
            pair.state = CheckState::Succeeded;
            pair.valid = true;
            id
        } else {
            match self.process_reflexive_response(si, id, mapped) {
                Some(ok) => ok,
                None => return,
            }
        };

        let stream = &mut self.streams[si];
        let Some(sent) = stream.check_list.get(id) else {
            return;
        };
        let nominated = sent.nominated
            || sent.mark_nominated_on_response_arrival
            || !compatibility.supports_nomination();
        let foundation = sent.foundation.clone();
        if let Some(ok) = stream.check_list.get_mut(ok_pair) {
            ok.valid = true;
            if nominated {
                ok.nominated = true;
            }
            debug!("Check succeeded, valid pair {}", ok.foundation);
        }

        if let Some(component) = find_component_mut(&mut stream.components, component_id) {
            let known = component
                .valid_candidates
                .iter()
                .any(|c| c.addr == valid_remote.addr);
            if !known && component.valid_candidates.len() < MAX_VALID_CANDIDATES {
                component.valid_candidates.push(valid_remote);
            }
        }

        self.unfreeze_related(&foundation);

        // Lower priority siblings of a succeeded pair (RFC 5245 Section 7.1.3.2.3)
        let succeeded_priority = self.streams[si].check_list.get(id).map(|p| p.priority);
        if let Some(priority) = succeeded_priority {
            self.prune_pending_checks(si, component_id, priority, false);
        }

        let connected = find_component(&self.streams[si].components, component_id)
            .map_or(false, |c| c.state.is_connected());
        if !connected {
            self.set_component_state(si, component_id, ComponentState::Connected);
        }
        if nominated {
            self.update_selected_pair(si, component_id, ok_pair);
        }
    }

    /// The mapped address differs from the local candidate: learn a local
    /// peer-reflexive candidate and build the valid pair from it
    fn process_reflexive_response(&mut self, si: usize, id: PairId, mapped: Address) -> Option<PairId> {
        let stream = &self.streams[si];
        let pair = stream.check_list.get(id)?;
        let (component_id, local_idx, remote_idx) = (pair.component_id, pair.local, pair.remote);
        let prflx_priority = pair.prflx_priority;
        let component = find_component(&stream.components, component_id)?;

        let local = match component.local_candidates.iter().position(|c| c.addr == mapped) {
            Some(index) => index,
            None => self.add_peer_reflexive_candidate(si, component_id, mapped, local_idx, prflx_priority)?,
        };

        let existing = self.streams[si].check_list.find(component_id, local, remote_idx);
        let valid_id = match existing {
            Some(existing) => existing,
            None => self.add_new_check_pair(
                si,
                component_id,
                local,
                remote_idx,
                CheckState::Discovered,
            )?,
        };

        let check_list = &mut self.streams[si].check_list;
        if let Some(pair) = check_list.get_mut(id) {
            pair.state = CheckState::Succeeded;
            if valid_id == id {
                pair.valid = true;
            } else {
                pair.discovered_pair = Some(valid_id);
            }
        }
        if valid_id != id {
            if let Some(pair) = check_list.get_mut(valid_id) {
                pair.valid = true;
                pair.succeeded_pair = Some(id);
            }
        }
        Some(valid_id)
    }

    /// Unfreeze pairs sharing a foundation with a pair that just succeeded
    fn unfreeze_related(&mut self, foundation: &str) {
        for stream in &mut self.streams {
            for id in stream.check_list.ids() {
                if let Some(pair) = stream.check_list.get_mut(id) {
                    if pair.state == CheckState::Frozen && pair.foundation == foundation {
                        trace!("Unfreezing related pair {}", pair.foundation);
                        pair.state = CheckState::Waiting;
                    }
                }
            }
        }
    }

    /// Select a nominated valid pair if it beats the current selection
    pub(crate) fn update_selected_pair(&mut self, si: usize, component_id: u32, id: PairId) {
        let stream = &mut self.streams[si];
        let stream_id = stream.id;
        let Some(pair) = stream.check_list.get(id) else {
            return;
        };
        if !pair.valid {
            return;
        }
        let selected = SelectedPair {
            pair: id,
            local: pair.local,
            remote: pair.remote,
            priority: pair.priority,
        };

        let Some(component) = find_component_mut(&mut stream.components, component_id) else {
            return;
        };
        if let Some(current) = component.selected_pair {
            if current.pair == id || current.priority >= selected.priority {
                return;
            }
        }
        let (Some(local), Some(remote)) = (
            component.local_candidates.get(selected.local),
            component.remote_candidates.get(selected.remote),
        ) else {
            return;
        };
        info!(
            "Stream {} component {}: selected pair {} -> {}",
            stream_id, component_id, local.addr, remote.addr
        );
        let event = AgentEvent::NewSelectedPair {
            stream_id,
            component_id,
            local_foundation: local.foundation.clone(),
            remote_foundation: remote.foundation.clone(),
        };
        component.selected_pair = Some(selected);
        component.keepalive_deadline = None;
        self.events.push(event);

        self.prune_pending_checks(si, component_id, selected.priority, true);

        let connected = find_component(&self.streams[si].components, component_id)
            .map_or(false, |c| c.state.is_connected());
        if !connected {
            self.set_component_state(si, component_id, ComponentState::Connected);
        }
        self.set_component_state(si, component_id, ComponentState::Ready);
    }

    /// Whether a succeeded pair of the component has a higher priority
    fn outranked_by_success(&self, si: usize, component_id: u32, priority: u64) -> bool {
        self.streams[si].check_list.iter().any(|p| {
            p.component_id == component_id
                && p.state == CheckState::Succeeded
                && p.priority > priority
        })
    }

    /// Drop waiting checks below `priority` (every waiting check once a pair
    /// is selected) and stop retransmitting lower priority ones. Valid pairs
    /// and pending nominations are kept.
    fn prune_pending_checks(
        &mut self,
        si: usize,
        component_id: u32,
        priority: u64,
        selected: bool,
    ) {
        let stream = &mut self.streams[si];
        for id in stream.check_list.ids() {
            let (state, pair_priority, keep) = match stream.check_list.get(id) {
                Some(p) if p.component_id == component_id => {
                    let nominating = p.use_candidate_on_next_check
                        || p.mark_nominated_on_response_arrival;
                    (p.state, p.priority, p.valid || nominating)
                }
                _ => continue,
            };
            match state {
                CheckState::Frozen | CheckState::Waiting
                    if !keep && (selected || pair_priority < priority) =>
                {
                    if let Some(removed) = stream.check_list.remove(id) {
                        trace!("Pruned pair {}", removed.foundation);
                        for transaction in &removed.stun_transactions {
                            stream.stun_agent.forget_transaction(&transaction.id);
                        }
                    }
                }
                CheckState::InProgress if pair_priority < priority => {
                    if let Some(pair) = stream.check_list.get_mut(id) {
                        pair.retransmit = false;
                    }
                }
                _ => {}
            }
        }
    }
}
