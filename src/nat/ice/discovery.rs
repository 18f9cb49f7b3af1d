// src/nat/ice/discovery.rs
//! Local candidate gathering
//!
//! Host candidates come from attached sockets. Server reflexive and relayed
//! candidates are discovered with Binding and Allocate requests, dispatched
//! one per Ta by the discovery tick and retransmitted on their own timers.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::nat::address::Address;
use crate::nat::error::NatResult;
use crate::nat::stun::{
    long_term_key, MessageClass, StunAgent, StunAttributeType, StunCompatibility, StunMessage,
    StunMethod, StunTimer, StunTimerReturn, StunUsageFlags, StunValidationStatus, TransactionId,
};

use super::agent::{peek_transaction_id, Agent, Transmit};
use super::candidate::{Candidate, CandidateTransport, CandidateType, TurnServer};
use super::config::{Compatibility, TurnCompatibility};
use super::events::AgentEvent;
use super::foundation::{assign_foundation, ensure_unique_priority};
use super::states::ComponentState;
use super::stream::{find_component, find_component_mut};
use super::transport::{SocketId, SocketKind};
use super::utils::{generate_candidate_credentials, password_key};

/// REQUESTED-TRANSPORT value for UDP (protocol 17)
const REQUESTED_TRANSPORT_UDP: u32 = 0x1100_0000;

/// MAGIC-COOKIE attribute value of legacy TURN servers
const TURN_MAGIC_COOKIE: u32 = 0x72C6_4BC6;

const MS_VERSION: u32 = 1;

/// Allocations retried with fresh REALM/NONCE at most this many times
const MAX_AUTH_ATTEMPTS: u32 = 2;

/// Outcome of adding a local candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCandidateResult {
    Success,
    Failed,
    CantCreateSocket,
    /// Same address, base and transport as an existing candidate
    Redundant,
}

/// A pending Binding or Allocate request
#[derive(Debug)]
pub(crate) struct CandidateDiscovery {
    pub typ: CandidateType,
    pub socket: SocketId,
    pub server: Address,
    /// Host address the request leaves from
    pub base_addr: Address,
    pub stream_id: u32,
    pub component_id: u32,
    pub turn: Option<Arc<TurnServer>>,
    pub turn_compatibility: TurnCompatibility,
    pub stun_agent: StunAgent,
    /// Request has been dispatched
    pub pending: bool,
    pub done: bool,
    pub timer: Option<StunTimer>,
    /// Transaction and encoded request, kept for retransmission
    pub request: Option<(TransactionId, Bytes)>,
    pub realm: Option<Bytes>,
    pub nonce: Option<Bytes>,
    pub auth_attempts: u32,
}

impl CandidateDiscovery {
    #[allow(clippy::too_many_arguments)]
    fn new(
        typ: CandidateType,
        socket: SocketId,
        server: Address,
        base_addr: Address,
        stream_id: u32,
        component_id: u32,
        turn: Option<Arc<TurnServer>>,
        turn_compatibility: TurnCompatibility,
        stun_agent: StunAgent,
    ) -> Self {
        Self {
            typ,
            socket,
            server,
            base_addr,
            stream_id,
            component_id,
            turn,
            turn_compatibility,
            stun_agent,
            pending: false,
            done: false,
            timer: None,
            request: None,
            realm: None,
            nonce: None,
            auth_attempts: 0,
        }
    }

    /// Build the Allocate request and its integrity key
    fn allocate_request(&self, turn: &TurnServer) -> (StunMessage, Option<Vec<u8>>) {
        let compatibility = self.stun_agent.compatibility();
        let mut msg = self.stun_agent.init_request(StunMethod::Allocate);

        let long_term = |msg: &mut StunMessage| -> Option<Vec<u8>> {
            let (realm, nonce) = (self.realm.as_ref()?, self.nonce.as_ref()?);
            msg.append_string(StunAttributeType::Username.code(), &turn.username);
            msg.append(StunAttributeType::Realm.code_for(compatibility), realm.clone());
            msg.append(StunAttributeType::Nonce.code_for(compatibility), nonce.clone());
            Some(long_term_key(turn.username.as_bytes(), realm, turn.password.as_bytes()).to_vec())
        };

        let key = match self.turn_compatibility {
            TurnCompatibility::Draft9 | TurnCompatibility::Rfc5766 => {
                msg.append_u32(
                    StunAttributeType::RequestedTransport.code(),
                    REQUESTED_TRANSPORT_UDP,
                );
                long_term(&mut msg)
            }
            TurnCompatibility::Google => {
                msg.append_u32(StunAttributeType::MagicCookie.code(), TURN_MAGIC_COOKIE);
                msg.append_string(StunAttributeType::Username.code(), &turn.username);
                None
            }
            TurnCompatibility::Msn => {
                msg.append_u32(StunAttributeType::MagicCookie.code(), TURN_MAGIC_COOKIE);
                msg.append_u32(StunAttributeType::MsVersion.code(), MS_VERSION);
                msg.append_string(StunAttributeType::Username.code(), &turn.username);
                Some(password_key(Compatibility::Msn, &turn.password))
            }
            TurnCompatibility::Oc2007 => {
                msg.append_u32(StunAttributeType::MagicCookie.code(), TURN_MAGIC_COOKIE);
                msg.append_u32(StunAttributeType::MsVersion.code(), MS_VERSION);
                match long_term(&mut msg) {
                    Some(key) => Some(key),
                    None => {
                        msg.append_string(StunAttributeType::Username.code(), &turn.username);
                        None
                    }
                }
            }
        };
        (msg, key)
    }
}

/// STUN agent for Binding discovery against a STUN server
fn binding_discovery_agent(compatibility: Compatibility) -> StunAgent {
    let stun_compatibility = match compatibility {
        Compatibility::Rfc5245 => StunCompatibility::Rfc5389,
        _ => StunCompatibility::Rfc3489,
    };
    StunAgent::new(stun_compatibility, StunUsageFlags::empty())
}

fn allocate_agent(turn_compatibility: TurnCompatibility) -> StunAgent {
    let (compatibility, usage) = turn_compatibility.stun_settings();
    StunAgent::new(compatibility, usage)
}

impl Agent {
    /// Add a host candidate for a socket already attached to the agent
    pub fn add_local_host_candidate(
        &mut self,
        stream_id: u32,
        component_id: u32,
        socket: SocketId,
    ) -> NatResult<HostCandidateResult> {
        let si = self.stream_index(stream_id)?;
        self.check_component(si, component_id)?;

        let Some(transport) = self.sockets.get(&socket) else {
            warn!("Host candidate requested on unknown {}", socket);
            return Ok(HostCandidateResult::CantCreateSocket);
        };
        let kind = transport.kind();
        if kind == SocketKind::TurnRelay {
            return Ok(HostCandidateResult::Failed);
        }

        let mut candidate = Candidate::new(
            CandidateType::Host,
            CandidateTransport::from_socket_kind(kind),
            transport.local_addr(),
        );
        candidate.stream_id = stream_id;
        candidate.component_id = component_id;
        candidate.socket = Some(socket);

        let result = self.add_local_candidate(si, component_id, candidate, false);
        self.flush();
        Ok(result)
    }

    /// Assign priority, foundation and credentials, then store and pair
    fn add_local_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        mut candidate: Candidate,
        nat_assisted: bool,
    ) -> HostCandidateResult {
        let compatibility = self.config.compatibility;
        let Some(component) = find_component(&self.streams[si].components, component_id) else {
            return HostCandidateResult::Failed;
        };
        let redundant = component.local_candidates.iter().any(|c| {
            c.addr == candidate.addr
                && c.base_addr == candidate.base_addr
                && c.transport == candidate.transport
        });
        if redundant {
            debug!("Candidate {} is redundant", candidate);
            return HostCandidateResult::Redundant;
        }

        candidate.priority = self.candidate_priority(&candidate, nat_assisted);
        candidate.priority = ensure_unique_priority(&self.streams[si], component_id, candidate.priority);

        let existing = self
            .streams
            .iter()
            .flat_map(|s| s.components.iter())
            .flat_map(|c| c.local_candidates.iter());
        assign_foundation(compatibility, &mut candidate, existing, &mut self.next_candidate_id);
        generate_candidate_credentials(compatibility, &mut candidate);

        let stream = &mut self.streams[si];
        let stream_id = stream.id;
        let Some(component) = find_component_mut(&mut stream.components, component_id) else {
            return HostCandidateResult::Failed;
        };

        info!(
            "Stream {} component {}: new local candidate {}",
            stream_id, component_id, candidate
        );
        let foundation = candidate.foundation.clone();
        component.local_candidates.push(candidate);
        let index = component.local_candidates.len() - 1;

        self.conn_check_add_for_local_candidate(si, component_id, index);
        self.events.push(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });
        HostCandidateResult::Success
    }

    pub(crate) fn add_server_reflexive_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        addr: Address,
        socket: SocketId,
        base_addr: Address,
    ) -> HostCandidateResult {
        let mut candidate = Candidate::new(CandidateType::ServerReflexive, CandidateTransport::Udp, addr);
        candidate.base_addr = base_addr;
        candidate.stream_id = self.streams[si].id;
        candidate.component_id = component_id;
        candidate.socket = Some(socket);
        self.add_local_candidate(si, component_id, candidate, false)
    }

    /// Relayed candidate from an Allocate response. It is paired once a
    /// relay transport for `addr` is attached.
    pub(crate) fn add_relay_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        addr: Address,
        turn: Arc<TurnServer>,
    ) -> HostCandidateResult {
        let mut candidate = Candidate::new(CandidateType::Relayed, CandidateTransport::Udp, addr);
        candidate.stream_id = self.streams[si].id;
        candidate.component_id = component_id;
        candidate.socket = self.relay_socket_for(&addr);
        if candidate.socket.is_none() {
            debug!("Relayed candidate {} waits for its relay transport", addr);
        }
        candidate.turn = Some(turn);
        self.add_local_candidate(si, component_id, candidate, false)
    }

    /// Local peer-reflexive candidate learned from a check response.
    /// Keeps the pair's PRIORITY and the base candidate's credentials.
    pub(crate) fn add_peer_reflexive_candidate(
        &mut self,
        si: usize,
        component_id: u32,
        addr: Address,
        base: usize,
        priority: u32,
    ) -> Option<usize> {
        let compatibility = self.config.compatibility;
        let stream = &self.streams[si];
        let stream_id = stream.id;
        let base = find_component(&stream.components, component_id)?
            .local_candidates
            .get(base)?;

        let mut candidate = Candidate::new(CandidateType::PeerReflexive, base.transport, addr);
        candidate.base_addr = base.addr;
        candidate.priority = priority;
        candidate.stream_id = stream_id;
        candidate.component_id = component_id;
        candidate.socket = base.socket;
        let (username, password) = (base.username.clone(), base.password.clone());

        let existing = self
            .streams
            .iter()
            .flat_map(|s| s.components.iter())
            .flat_map(|c| c.local_candidates.iter());
        assign_foundation(compatibility, &mut candidate, existing, &mut self.next_candidate_id);
        candidate.username = username;
        candidate.password = password;

        info!("Discovered local peer reflexive candidate {}", candidate);
        let foundation = candidate.foundation.clone();
        let component = find_component_mut(&mut self.streams[si].components, component_id)?;
        component.local_candidates.push(candidate);
        let index = component.local_candidates.len() - 1;

        self.events.push(AgentEvent::NewCandidate {
            stream_id,
            component_id,
            foundation,
        });
        Some(index)
    }

    /// Start server reflexive and relayed discovery for the stream's UDP
    /// host candidates. Gathering-done fires once every request finished.
    pub fn gather_candidates(&mut self, stream_id: u32) -> NatResult<()> {
        let si = self.stream_index(stream_id)?;
        let compatibility = self.config.compatibility;
        let turn_compatibility = self.config.turn_compatibility();
        let stun_server = if self.config.force_relay {
            None
        } else {
            self.config.stun_server
        };

        let stream = &mut self.streams[si];
        let mut items = Vec::new();
        for component in &stream.components {
            let hosts = component
                .local_candidates
                .iter()
                .filter(|c| c.typ == CandidateType::Host && c.transport.is_udp());
            for host in hosts {
                let Some(socket) = host.socket else {
                    continue;
                };
                if let Some(server) = stun_server {
                    let server = Address::udp(server);
                    if server.family() == host.addr.family() {
                        items.push(CandidateDiscovery::new(
                            CandidateType::ServerReflexive,
                            socket,
                            server,
                            host.addr,
                            stream_id,
                            component.id,
                            None,
                            turn_compatibility,
                            binding_discovery_agent(compatibility),
                        ));
                    }
                }
                for turn in &component.turn_servers {
                    if turn.server.family() != host.addr.family() {
                        continue;
                    }
                    items.push(CandidateDiscovery::new(
                        CandidateType::Relayed,
                        socket,
                        turn.server,
                        host.addr,
                        stream_id,
                        component.id,
                        Some(turn.clone()),
                        turn_compatibility,
                        allocate_agent(turn_compatibility),
                    ));
                }
            }
        }

        if items.is_empty() {
            debug!("Stream {}: nothing to discover", stream_id);
            stream.gathering = false;
            self.events.push(AgentEvent::GatheringDone { stream_id });
            self.flush();
            return Ok(());
        }

        stream.gathering = true;
        let mut gathering: Vec<u32> = items.iter().map(|d| d.component_id).collect();
        gathering.dedup();
        info!("Stream {}: {} discovery requests queued", stream_id, items.len());
        self.discovery_unsched_items += items.len();
        self.discovery.extend(items);

        for component_id in gathering {
            let idle = find_component(&self.streams[si].components, component_id)
                .map_or(false, |c| c.state == ComponentState::Disconnected);
            if idle {
                self.set_component_state(si, component_id, ComponentState::Gathering);
            }
        }
        self.flush();
        Ok(())
    }

    /// Run the discovery scheduler once and flush
    pub fn discovery_tick(&mut self, now: Instant) -> bool {
        let keep_going = self.discovery_tick_unlocked(now);
        self.flush();
        keep_going
    }

    pub(crate) fn discovery_tick_unlocked(&mut self, now: Instant) -> bool {
        if self.discovery.is_empty() {
            return false;
        }

        let mut pending = false;
        let mut dispatched = false;
        let mut retransmits = Vec::new();

        for index in 0..self.discovery.len() {
            let item = &mut self.discovery[index];
            if item.done {
                continue;
            }

            if !item.pending {
                pending = true;
                if dispatched {
                    continue;
                }
                dispatched = true;
                item.pending = true;
                self.discovery_unsched_items = self.discovery_unsched_items.saturating_sub(1);
                if !self.discovery_send_request(index, now) {
                    self.discovery[index].done = true;
                }
                continue;
            }

            let Some(timer) = item.timer.as_mut() else {
                item.done = true;
                continue;
            };
            match timer.refresh(now) {
                StunTimerReturn::Timeout => {
                    debug!("Discovery request to {} timed out", item.server);
                    item.done = true;
                    if let Some((tid, _)) = item.request.take() {
                        item.stun_agent.forget_transaction(&tid);
                    }
                }
                StunTimerReturn::Retransmit => {
                    if let Some((_, data)) = &item.request {
                        trace!("Retransmitting discovery request to {}", item.server);
                        retransmits.push(Transmit {
                            socket: item.socket,
                            to: item.server,
                            data: data.clone(),
                        });
                    }
                    pending = true;
                }
                StunTimerReturn::Success => pending = true,
            }
        }

        self.outbox.extend(retransmits);
        let unfinished = self.discovery.iter().any(|d| !d.done);
        if !unfinished {
            self.discovery_finish();
        }
        pending && unfinished
    }

    fn discovery_finish(&mut self) {
        self.discovery.clear();
        self.discovery_unsched_items = 0;
        for stream in &mut self.streams {
            if stream.gathering {
                stream.gathering = false;
                info!("Stream {}: candidate gathering done", stream.id);
                self.events.push(AgentEvent::GatheringDone {
                    stream_id: stream.id,
                });
            }
        }
    }

    fn discovery_send_request(&mut self, index: usize, now: Instant) -> bool {
        let reliable = self.socket_reliable(self.discovery[index].socket);
        let timer = if reliable {
            StunTimer::start_reliable(now, self.config.stun_reliable_timeout_ms)
        } else {
            StunTimer::start(
                now,
                self.config.stun_initial_timeout_ms,
                self.config.stun_max_retransmissions,
            )
        };

        let item = &mut self.discovery[index];
        let (mut msg, key) = match (&item.typ, &item.turn) {
            (CandidateType::Relayed, Some(turn)) => item.allocate_request(turn),
            (CandidateType::ServerReflexive, _) => {
                (item.stun_agent.init_request(StunMethod::Binding), None)
            }
            _ => return false,
        };

        let tid = msg.transaction_id();
        match item.stun_agent.finish_message(&mut msg, key.as_deref()) {
            Ok(wire) => {
                debug!(
                    "Sending {} discovery request to {}",
                    item.typ.to_str(),
                    item.server
                );
                item.timer = Some(timer);
                item.request = Some((tid, wire.clone()));
                let (socket, server) = (item.socket, item.server);
                self.transmit(socket, server, wire);
                true
            }
            Err(e) => {
                warn!("Failed to encode discovery request: {}", e);
                false
            }
        }
    }

    /// Discovery item waiting for this datagram's transaction
    pub(crate) fn discovery_find(&self, socket: SocketId, data: &[u8]) -> Option<usize> {
        let tid = peek_transaction_id(data)?;
        self.discovery.iter().position(|d| {
            d.socket == socket
                && !d.done
                && d.request
                    .as_ref()
                    .map_or(false, |(id, _)| id.as_bytes().as_slice() == tid)
        })
    }

    pub(crate) fn discovery_handle_response(
        &mut self,
        index: usize,
        from: Address,
        data: &[u8],
        now: Instant,
    ) {
        let item = &mut self.discovery[index];
        let validation = item.stun_agent.validate(data, &mut |_| None);
        if validation.status != StunValidationStatus::Success {
            debug!(
                "Discarding discovery response from {}: {:?}",
                from, validation.status
            );
            return;
        }
        let Some(msg) = validation.message else {
            return;
        };
        if !msg.class().is_response() {
            return;
        }
        item.request = None;
        item.timer = None;

        if msg.class() == MessageClass::ErrorResponse {
            let code = msg.find_error_code();
            let challenge = matches!(code, Some(401) | Some(438))
                && item.typ == CandidateType::Relayed
                && item.auth_attempts < MAX_AUTH_ATTEMPTS;
            if challenge {
                let compatibility = item.stun_agent.compatibility();
                let realm = msg.find(StunAttributeType::Realm.code_for(compatibility));
                let nonce = msg.find(StunAttributeType::Nonce.code_for(compatibility));
                if let (Some(realm), Some(nonce)) = (realm, nonce) {
                    item.realm = Some(Bytes::copy_from_slice(realm));
                    item.nonce = Some(Bytes::copy_from_slice(nonce));
                    item.auth_attempts += 1;
                    debug!("Allocation on {} challenged, retrying", item.server);
                    if self.discovery_send_request(index, now) {
                        return;
                    }
                }
            }
            let item = &mut self.discovery[index];
            debug!("Discovery on {} failed with {:?}", item.server, code);
            item.done = true;
            return;
        }

        item.done = true;
        let (typ, socket, base_addr, stream_id, component_id) = (
            item.typ,
            item.socket,
            item.base_addr,
            item.stream_id,
            item.component_id,
        );
        let turn = item.turn.clone();
        let turn_compatibility = item.turn_compatibility;
        let Ok(si) = self.stream_index(stream_id) else {
            return;
        };

        let network = base_addr.network();
        let mapped = msg
            .find_xor_addr(StunAttributeType::XorMappedAddress.code())
            .map(|addr| Address::new(network, addr));

        match typ {
            CandidateType::ServerReflexive => {
                let mapped = mapped.or_else(|| {
                    msg.find_addr(StunAttributeType::MappedAddress.code())
                        .map(|addr| Address::new(network, addr))
                });
                match mapped {
                    Some(addr) => {
                        self.add_server_reflexive_candidate(si, component_id, addr, socket, base_addr);
                    }
                    None => debug!("Binding response from {} has no mapped address", from),
                }
            }
            CandidateType::Relayed => {
                let relayed = match turn_compatibility {
                    TurnCompatibility::Rfc5766 => {
                        msg.find_xor_addr(StunAttributeType::XorRelayedAddress.code())
                    }
                    TurnCompatibility::Draft9 => {
                        msg.find_addr(StunAttributeType::RelayAddress.code())
                    }
                    _ => msg.find_addr(StunAttributeType::MappedAddress.code()),
                };
                if let Some(addr) = mapped {
                    self.add_server_reflexive_candidate(si, component_id, addr, socket, base_addr);
                }
                match (relayed, turn) {
                    (Some(addr), Some(turn)) => {
                        let relayed = Address::new(network, addr);
                        self.add_relay_candidate(si, component_id, relayed, turn);
                    }
                    _ => debug!("Allocate response from {} has no relayed address", from),
                }
            }
            _ => {}
        }
    }
}
