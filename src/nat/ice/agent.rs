// src/nat/ice/agent.rs
//! Main ICE agent implementation
//!
//! The agent does no I/O scheduling of its own. Inbound datagrams are fed
//! to [`Agent::handle_packet`] (or pulled with [`Agent::poll_sockets`]) and
//! [`Agent::tick`] is called every Ta. Outbound datagrams leave through the
//! attached [`Transport`]s when a call returns; notifications are delivered
//! to the [`NotificationSink`] in the order the transitions happened.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::nat::address::Address;
use crate::nat::error::{NatError, NatResult};
use crate::nat::stun::{StunAgent, HEADER_SIZE};

use super::candidate::{Candidate, CandidateType, TurnServer};
use super::check_list::CandidateCheckPair;
use super::config::{AgentConfig, Compatibility};
use super::discovery::CandidateDiscovery;
use super::events::{AgentEvent, NotificationSink, NullSink};
use super::priority::{candidate_pair_priority, candidate_priority};
use super::states::ComponentState;
use super::stream::{find_component, find_component_mut, Stream};
use super::transport::{InterfaceProvider, SocketId, SocketKind, Transport};
use super::utils::generate_stream_credentials;

/// Receive buffer used by [`Agent::poll_sockets`]
const RECV_BUFFER_SIZE: usize = 65536;

/// Datagram queued for sending when the current call returns
#[derive(Debug, Clone)]
pub(crate) struct Transmit {
    pub socket: SocketId,
    pub to: Address,
    pub data: Bytes,
}

/// What [`Agent::handle_packet`] did with a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// STUN message consumed by the agent
    Stun,
    /// Not STUN; belongs to the application
    Data,
    /// Arrived on a socket no component uses
    Discarded,
}

/// Application data pulled off a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    pub socket: SocketId,
    pub from: Address,
    pub data: Bytes,
}

/// Pair priority from the agent's point of view
pub(crate) fn agent_pair_priority(controlling: bool, local: u32, remote: u32) -> u64 {
    if controlling {
        candidate_pair_priority(local, remote)
    } else {
        candidate_pair_priority(remote, local)
    }
}

/// ICE agent
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) controlling_mode: bool,
    pub(crate) tie_breaker: u64,
    pub(crate) streams: Vec<Stream>,
    pub(crate) sockets: HashMap<SocketId, Box<dyn Transport>>,
    /// Pending server reflexive and relayed discoveries
    pub(crate) discovery: Vec<CandidateDiscovery>,
    pub(crate) discovery_unsched_items: usize,
    /// Interface addresses, used for the TCP local preference
    pub(crate) local_addresses: Vec<IpAddr>,
    pub(crate) next_candidate_id: u32,
    pub(crate) next_remote_candidate_id: u32,
    next_stream_id: u32,
    next_socket_id: u32,
    pub(crate) events: Vec<AgentEvent>,
    pub(crate) outbox: Vec<Transmit>,
    sink: Box<dyn NotificationSink>,
}

impl Agent {
    /// Create an agent that drops notifications
    pub fn new(config: AgentConfig) -> NatResult<Self> {
        Self::with_sink(config, NullSink)
    }

    pub fn with_sink(config: AgentConfig, sink: impl NotificationSink + 'static) -> NatResult<Self> {
        config.validate()?;
        info!(
            "Creating ICE agent ({:?}, {})",
            config.compatibility,
            if config.controlling_mode { "controlling" } else { "controlled" }
        );

        Ok(Self {
            controlling_mode: config.controlling_mode,
            tie_breaker: rand::random(),
            streams: Vec::new(),
            sockets: HashMap::new(),
            discovery: Vec::new(),
            discovery_unsched_items: 0,
            local_addresses: Vec::new(),
            next_candidate_id: 1,
            next_remote_candidate_id: 1,
            next_stream_id: 1,
            next_socket_id: 1,
            events: Vec::new(),
            outbox: Vec::new(),
            sink: Box::new(sink),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn compatibility(&self) -> Compatibility {
        self.config.compatibility
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling_mode
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// Override the random tie-breaker
    pub fn set_tie_breaker(&mut self, tie_breaker: u64) {
        self.tie_breaker = tie_breaker;
    }

    /// Pacing interval Ta
    pub fn timer_ta(&self) -> Duration {
        Duration::from_millis(self.config.timer_ta_ms)
    }

    pub fn set_local_addresses(&mut self, addresses: Vec<IpAddr>) {
        self.local_addresses = addresses;
    }

    pub fn refresh_local_addresses(&mut self, provider: &dyn InterfaceProvider) -> NatResult<()> {
        self.local_addresses = provider.local_addresses()?;
        debug!("Using {} local interface addresses", self.local_addresses.len());
        Ok(())
    }

    pub fn local_addresses(&self) -> &[IpAddr] {
        &self.local_addresses
    }

    /// Add a stream with `n_components` components, numbered from 1
    pub fn add_stream(&mut self, n_components: u32) -> NatResult<u32> {
        if n_components == 0 {
            return Err(NatError::Configuration(
                "A stream needs at least one component".to_string(),
            ));
        }

        let id = self.next_stream_id;
        self.next_stream_id += 1;

        let compatibility = self.config.compatibility;
        let mut stun_agent =
            StunAgent::new(compatibility.stun_compatibility(), self.config.conncheck_usage());
        stun_agent.set_software(self.config.software.clone());

        let stream = Stream::new(
            id,
            n_components,
            stun_agent,
            generate_stream_credentials(compatibility),
        );
        self.streams.push(stream);

        info!("Added stream {} with {} components", id, n_components);
        Ok(id)
    }

    /// Remove a stream with its pending discoveries and checks
    pub fn remove_stream(&mut self, stream_id: u32) -> NatResult<()> {
        let si = self.stream_index(stream_id)?;
        self.discovery.retain(|d| d.stream_id != stream_id);
        self.discovery_unsched_items = self.discovery.iter().filter(|d| !d.pending).count();
        self.streams.remove(si);
        info!("Removed stream {}", stream_id);
        Ok(())
    }

    /// Hand a transport to the agent
    pub fn attach_socket(&mut self, transport: Box<dyn Transport>) -> SocketId {
        let id = SocketId(self.next_socket_id);
        self.next_socket_id += 1;
        debug!(
            "Attached {:?} {} at {}",
            transport.kind(),
            id,
            transport.local_addr()
        );
        self.sockets.insert(id, transport);
        id
    }

    /// Attach the transport carrying a relayed candidate's traffic through
    /// its TURN allocation. The transport's local address is the relayed
    /// address and TURN framing is up to the transport. The relayed
    /// candidate on that address, allocated before or after this call, is
    /// bound to it and paired.
    pub fn attach_relay_socket(
        &mut self,
        stream_id: u32,
        component_id: u32,
        transport: Box<dyn Transport>,
    ) -> NatResult<SocketId> {
        let si = self.stream_index(stream_id)?;
        self.check_component(si, component_id)?;
        if transport.kind() != SocketKind::TurnRelay {
            return Err(NatError::Configuration(format!(
                "{:?} transport cannot carry a relayed candidate",
                transport.kind()
            )));
        }

        let relayed = transport.local_addr();
        let socket = self.attach_socket(transport);
        let bound = find_component_mut(&mut self.streams[si].components, component_id).and_then(|c| {
            let index = c.local_candidates.iter().position(|l| {
                l.typ == CandidateType::Relayed && l.addr == relayed && l.socket.is_none()
            })?;
            c.local_candidates[index].socket = Some(socket);
            Some(index)
        });
        if let Some(index) = bound {
            info!("Relayed candidate {} bound to {}", relayed, socket);
            self.conn_check_add_for_local_candidate(si, component_id, index);
        }
        self.flush();
        Ok(socket)
    }

    /// Attached relay transport for a relayed address, if any
    pub(crate) fn relay_socket_for(&self, relayed: &Address) -> Option<SocketId> {
        self.sockets
            .iter()
            .find(|(_, t)| t.kind() == SocketKind::TurnRelay && t.local_addr() == *relayed)
            .map(|(id, _)| *id)
    }

    pub fn socket_local_addr(&self, socket: SocketId) -> NatResult<Address> {
        self.sockets
            .get(&socket)
            .map(|t| t.local_addr())
            .ok_or(NatError::UnknownSocket(socket))
    }

    pub fn set_remote_credentials(
        &mut self,
        stream_id: u32,
        ufrag: &str,
        password: &str,
    ) -> NatResult<()> {
        if ufrag.is_empty() || password.is_empty() {
            return Err(NatError::Configuration(
                "Remote credentials cannot be empty".to_string(),
            ));
        }
        let si = self.stream_index(stream_id)?;
        let stream = &mut self.streams[si];
        stream.remote_ufrag = ufrag.to_string();
        stream.remote_password = password.to_string();
        debug!("Stream {}: remote credentials set", stream_id);

        let components: Vec<u32> = stream.components.iter().map(|c| c.id).collect();
        for component_id in components {
            self.conn_check_process_incoming_checks(si, component_id);
        }
        self.flush();
        Ok(())
    }

    /// Stream (ufrag, password)
    pub fn local_credentials(&self, stream_id: u32) -> NatResult<(String, String)> {
        let stream = self.stream(stream_id)?;
        Ok((stream.local_ufrag.clone(), stream.local_password.clone()))
    }

    /// Add remote candidates received through signaling and pair them.
    /// Returns how many were new.
    pub fn set_remote_candidates(
        &mut self,
        stream_id: u32,
        component_id: u32,
        candidates: Vec<Candidate>,
    ) -> NatResult<usize> {
        let si = self.stream_index(stream_id)?;
        self.check_component(si, component_id)?;

        let mut added = 0;
        for candidate in candidates {
            if self.add_remote_candidate(si, component_id, candidate) {
                added += 1;
            }
        }
        debug!(
            "Stream {} component {}: {} new remote candidates",
            stream_id, component_id, added
        );

        self.conn_check_process_incoming_checks(si, component_id);
        self.flush();
        Ok(added)
    }

    fn add_remote_candidate(&mut self, si: usize, component_id: u32, mut candidate: Candidate) -> bool {
        let stream = &mut self.streams[si];
        let stream_id = stream.id;
        let Some(component) = find_component_mut(&mut stream.components, component_id) else {
            return false;
        };

        if let Some(existing) = component
            .remote_candidates
            .iter_mut()
            .find(|c| c.addr == candidate.addr && c.transport == candidate.transport)
        {
            trace!("Updating remote candidate {}", existing.addr);
            existing.priority = candidate.priority;
            existing.foundation = candidate.foundation;
            existing.username = candidate.username;
            existing.password = candidate.password;
            if candidate.typ != CandidateType::PeerReflexive {
                existing.typ = candidate.typ;
                existing.base_addr = candidate.base_addr;
            }
            return false;
        }

        if component.remote_candidates.len() >= super::candidate::MAX_REMOTE_CANDIDATES {
            warn!(
                "Stream {} component {}: too many remote candidates, ignoring {}",
                stream_id, component_id, candidate.addr
            );
            return false;
        }

        candidate.stream_id = stream_id;
        candidate.component_id = component_id;
        candidate.socket = None;
        debug!("Remote candidate {}", candidate);
        component.remote_candidates.push(candidate);
        let index = component.remote_candidates.len() - 1;

        self.conn_check_add_for_remote_candidate(si, component_id, index);
        true
    }

    /// Switch role and recompute pair priorities
    pub fn set_controlling_mode(&mut self, controlling: bool) {
        self.switch_role(controlling);
    }

    pub(crate) fn switch_role(&mut self, controlling: bool) {
        if self.controlling_mode == controlling {
            return;
        }
        info!(
            "Switching to {} role",
            if controlling { "controlling" } else { "controlled" }
        );
        self.controlling_mode = controlling;

        for stream in &mut self.streams {
            let Stream {
                components,
                check_list,
                ..
            } = stream;
            for id in check_list.ids() {
                let Some(pair) = check_list.get_mut(id) else {
                    continue;
                };
                let Some(component) = find_component(components, pair.component_id) else {
                    continue;
                };
                if let (Some(local), Some(remote)) = (
                    component.local_candidates.get(pair.local),
                    component.remote_candidates.get(pair.remote),
                ) {
                    pair.priority = agent_pair_priority(controlling, local.priority, remote.priority);
                }
            }
            check_list.resort();
        }
    }

    pub fn add_turn_server(
        &mut self,
        stream_id: u32,
        component_id: u32,
        turn: TurnServer,
    ) -> NatResult<()> {
        let si = self.stream_index(stream_id)?;
        self.check_component(si, component_id)?;
        if let Some(component) = self.streams[si].component_mut(component_id) {
            debug!("Stream {} component {}: TURN server {}", stream_id, component_id, turn.server);
            component.turn_servers.push(std::sync::Arc::new(turn));
        }
        Ok(())
    }

    pub fn component_state(&self, stream_id: u32, component_id: u32) -> NatResult<ComponentState> {
        Ok(self.component(stream_id, component_id)?.state)
    }

    /// Selected (local, remote) candidates
    pub fn selected_pair(
        &self,
        stream_id: u32,
        component_id: u32,
    ) -> NatResult<Option<(Candidate, Candidate)>> {
        let component = self.component(stream_id, component_id)?;
        Ok(component.selected_pair.and_then(|selected| {
            let local = component.local_candidates.get(selected.local)?;
            let remote = component.remote_candidates.get(selected.remote)?;
            Some((local.clone(), remote.clone()))
        }))
    }

    pub fn local_candidates(&self, stream_id: u32, component_id: u32) -> NatResult<Vec<Candidate>> {
        Ok(self.component(stream_id, component_id)?.local_candidates.clone())
    }

    pub fn remote_candidates(&self, stream_id: u32, component_id: u32) -> NatResult<Vec<Candidate>> {
        Ok(self.component(stream_id, component_id)?.remote_candidates.clone())
    }

    /// Check list of a stream in priority order
    pub fn check_pairs(&self, stream_id: u32) -> NatResult<Vec<CandidateCheckPair>> {
        Ok(self.stream(stream_id)?.check_list.iter().cloned().collect())
    }

    /// Send application data over the selected pair
    pub fn send(&mut self, stream_id: u32, component_id: u32, data: &[u8]) -> NatResult<usize> {
        let si = self.stream_index(stream_id)?;
        let stream = &self.streams[si];
        let component = self.component(stream_id, component_id)?;
        let selected = component.selected_pair.ok_or_else(|| {
            NatError::InvalidState(format!(
                "Stream {} component {} has no selected pair",
                stream_id, component_id
            ))
        })?;
        let pair = stream
            .check_list
            .get(selected.pair)
            .ok_or_else(|| NatError::InvalidState("Selected pair was removed".to_string()))?;
        let remote = component
            .remote_candidates
            .get(selected.remote)
            .ok_or_else(|| NatError::InvalidState("Selected remote candidate missing".to_string()))?;
        let transport = self
            .sockets
            .get(&pair.socket)
            .ok_or(NatError::UnknownSocket(pair.socket))?;
        transport.send(&remote.addr, data)
    }

    /// Process one inbound datagram received on `socket`
    pub fn handle_packet(
        &mut self,
        socket: SocketId,
        from: Address,
        data: &[u8],
        now: Instant,
    ) -> PacketOutcome {
        let outcome = self.handle_packet_unlocked(socket, from, data, now);
        self.flush();
        outcome
    }

    fn handle_packet_unlocked(
        &mut self,
        socket: SocketId,
        from: Address,
        data: &[u8],
        now: Instant,
    ) -> PacketOutcome {
        if let Some(index) = self.discovery_find(socket, data) {
            self.discovery_handle_response(index, from, data, now);
            return PacketOutcome::Stun;
        }

        let Some((si, component_id)) = self.find_socket_component(socket) else {
            trace!("Datagram from {} on unused {}", from, socket);
            return PacketOutcome::Discarded;
        };
        self.conn_check_handle_packet(si, component_id, socket, from, data)
    }

    /// Drain every attached socket, handling STUN and returning the rest
    pub fn poll_sockets(&mut self, now: Instant) -> Vec<ReceivedData> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut received = Vec::new();
        let mut ids: Vec<SocketId> = self.sockets.keys().copied().collect();
        ids.sort();

        for socket in ids {
            loop {
                let result = match self.sockets.get(&socket) {
                    Some(transport) => transport.try_recv(&mut buf),
                    None => break,
                };
                match result {
                    Ok(Some((len, from))) => {
                        let data = &buf[..len];
                        if self.handle_packet_unlocked(socket, from, data, now) == PacketOutcome::Data {
                            received.push(ReceivedData {
                                socket,
                                from,
                                data: Bytes::copy_from_slice(data),
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Receive on {} failed: {}", socket, e);
                        break;
                    }
                }
            }
        }

        self.flush();
        received
    }

    /// Run discovery and connectivity checks. Returns whether work remains.
    pub fn tick(&mut self, now: Instant) -> bool {
        let discovering = self.discovery_tick_unlocked(now);
        let checking = self.conn_check_tick_unlocked(now);
        self.flush();
        discovering || checking
    }

    pub(crate) fn stream_index(&self, stream_id: u32) -> NatResult<usize> {
        self.streams
            .iter()
            .position(|s| s.id == stream_id)
            .ok_or(NatError::UnknownStream(stream_id))
    }

    fn stream(&self, stream_id: u32) -> NatResult<&Stream> {
        self.streams
            .iter()
            .find(|s| s.id == stream_id)
            .ok_or(NatError::UnknownStream(stream_id))
    }

    fn component(&self, stream_id: u32, component_id: u32) -> NatResult<&super::stream::Component> {
        self.stream(stream_id)?
            .component(component_id)
            .ok_or(NatError::UnknownComponent {
                stream: stream_id,
                component: component_id,
            })
    }

    pub(crate) fn check_component(&self, si: usize, component_id: u32) -> NatResult<()> {
        let stream = &self.streams[si];
        match stream.component(component_id) {
            Some(_) => Ok(()),
            None => Err(NatError::UnknownComponent {
                stream: stream.id,
                component: component_id,
            }),
        }
    }

    /// Stream index and component owning a local candidate on `socket`
    pub(crate) fn find_socket_component(&self, socket: SocketId) -> Option<(usize, u32)> {
        self.streams.iter().enumerate().find_map(|(si, stream)| {
            stream
                .components
                .iter()
                .find(|c| c.local_candidates.iter().any(|l| l.socket == Some(socket)))
                .map(|c| (si, c.id))
        })
    }

    pub(crate) fn socket_reliable(&self, socket: SocketId) -> bool {
        self.sockets
            .get(&socket)
            .map_or(self.config.reliable, |t| t.is_reliable())
    }

    /// Candidate priority under the agent's compatibility mode
    pub(crate) fn candidate_priority(&self, candidate: &Candidate, nat_assisted: bool) -> u32 {
        candidate_priority(
            self.config.compatibility,
            candidate,
            self.config.reliable,
            nat_assisted,
            &self.local_addresses,
        )
    }

    /// Priority a peer-reflexive candidate derived from `local` would get
    pub(crate) fn peer_reflexive_candidate_priority(&self, local: &Candidate) -> u32 {
        let mut prflx = Candidate::new(CandidateType::PeerReflexive, local.transport, local.addr);
        prflx.component_id = local.component_id;
        prflx.base_addr = local.addr;
        self.candidate_priority(&prflx, false)
    }

    pub(crate) fn set_component_state(&mut self, si: usize, component_id: u32, state: ComponentState) {
        let stream = &mut self.streams[si];
        let stream_id = stream.id;
        let Some(component) = stream.component_mut(component_id) else {
            return;
        };
        if component.state == state {
            return;
        }
        info!(
            "Stream {} component {}: {} -> {}",
            stream_id, component_id, component.state, state
        );
        component.state = state;
        self.events.push(AgentEvent::ComponentStateChanged {
            stream_id,
            component_id,
            state,
        });
    }

    pub(crate) fn transmit(&mut self, socket: SocketId, to: Address, data: Bytes) {
        self.outbox.push(Transmit { socket, to, data });
    }

    /// Send queued datagrams and deliver queued notifications
    pub(crate) fn flush(&mut self) {
        for transmit in self.outbox.drain(..) {
            let Some(transport) = self.sockets.get(&transmit.socket) else {
                warn!("Dropping datagram for unknown {}", transmit.socket);
                continue;
            };
            if !transport.can_send(&transmit.to) {
                debug!("{} cannot reach {} yet", transmit.socket, transmit.to);
                continue;
            }
            if let Err(e) = transport.send(&transmit.to, &transmit.data) {
                warn!("Send to {} on {} failed: {}", transmit.to, transmit.socket, e);
            }
        }

        for event in std::mem::take(&mut self.events) {
            event.dispatch(self.sink.as_mut());
        }
    }
}

/// Transaction id of a datagram that looks like STUN
pub(crate) fn peek_transaction_id(data: &[u8]) -> Option<&[u8]> {
    if data.len() < HEADER_SIZE || data[0] & 0xC0 != 0 {
        return None;
    }
    data.get(4..HEADER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::ice::candidate::CandidateTransport;
    use crate::nat::ice::transport::MemoryTransport;

    #[test]
    fn test_streams_and_credentials() {
        let mut agent = Agent::new(AgentConfig::default()).unwrap();
        let first = agent.add_stream(2).unwrap();
        let second = agent.add_stream(1).unwrap();
        assert_ne!(first, second);

        let (ufrag, password) = agent.local_credentials(first).unwrap();
        assert_eq!(ufrag.len(), 4);
        assert_eq!(password.len(), 22);

        assert!(agent.add_stream(0).is_err());
        assert!(matches!(
            agent.component_state(first, 3),
            Err(NatError::UnknownComponent { .. })
        ));
        assert_eq!(
            agent.component_state(first, 2).unwrap(),
            ComponentState::Disconnected
        );

        agent.remove_stream(first).unwrap();
        assert!(matches!(
            agent.local_credentials(first),
            Err(NatError::UnknownStream(_))
        ));
    }

    #[test]
    fn test_remote_credentials_must_be_set() {
        let mut agent = Agent::new(AgentConfig::default()).unwrap();
        let stream = agent.add_stream(1).unwrap();
        assert!(agent.set_remote_credentials(stream, "", "x").is_err());
        assert!(agent.set_remote_credentials(stream, "abcd", "password").is_ok());
    }

    #[test]
    fn test_agent_pair_priority_by_role() {
        assert_eq!(agent_pair_priority(true, 10, 5), candidate_pair_priority(10, 5));
        assert_eq!(agent_pair_priority(false, 10, 5), candidate_pair_priority(5, 10));
    }

    #[test]
    fn test_unknown_socket_is_discarded() {
        let mut agent = Agent::new(AgentConfig::default()).unwrap();
        let transport = MemoryTransport::new(Address::udp("10.0.0.1:5000".parse().unwrap()));
        let socket = agent.attach_socket(Box::new(transport));
        let outcome = agent.handle_packet(
            socket,
            Address::udp("10.0.0.2:5000".parse().unwrap()),
            b"data",
            Instant::now(),
        );
        assert_eq!(outcome, PacketOutcome::Discarded);
    }

    #[test]
    fn test_role_switch_reorders_pairs() {
        let mut agent = Agent::new(AgentConfig::default()).unwrap();
        assert!(!agent.is_controlling());
        let stream = agent.add_stream(1).unwrap();
        for local in ["10.0.0.1:5000", "10.0.0.2:5000"] {
            let transport = MemoryTransport::new(Address::udp(local.parse().unwrap()));
            let socket = agent.attach_socket(Box::new(transport));
            agent.add_local_host_candidate(stream, 1, socket).unwrap();
        }
        let locals = agent.local_candidates(stream, 1).unwrap();
        let (high, low) = (locals[0].priority, locals[1].priority);
        assert!(high > low);

        // (high, low) and (low, high) differ only in the tie-break bit
        let remotes = vec![
            Candidate::remote(
                CandidateType::Host,
                CandidateTransport::Udp,
                Address::udp("10.0.1.1:6000".parse().unwrap()),
                low,
                "r1",
            ),
            Candidate::remote(
                CandidateType::Host,
                CandidateTransport::Udp,
                Address::udp("10.0.1.2:6000".parse().unwrap()),
                high,
                "r2",
            ),
        ];
        agent.set_remote_candidates(stream, 1, remotes).unwrap();

        let position = |agent: &Agent, local: usize, remote: usize| {
            let pairs = agent.check_pairs(stream).unwrap();
            let index = pairs
                .iter()
                .position(|p| p.local == local && p.remote == remote)
                .unwrap();
            (index, pairs[index].priority)
        };

        let (a_index, a_priority) = position(&agent, 0, 0);
        let (b_index, b_priority) = position(&agent, 1, 1);
        assert_eq!(a_priority, candidate_pair_priority(low, high));
        assert_eq!(b_priority, candidate_pair_priority(high, low));
        assert_eq!(b_priority, a_priority + 1);
        assert!(b_index < a_index);

        agent.set_controlling_mode(true);
        assert!(agent.is_controlling());

        let (a_index, a_priority) = position(&agent, 0, 0);
        let (b_index, b_priority) = position(&agent, 1, 1);
        assert_eq!(a_priority, candidate_pair_priority(high, low));
        assert_eq!(b_priority, candidate_pair_priority(low, high));
        assert_eq!(a_priority, b_priority + 1);
        assert!(a_index < b_index);
    }

    #[test]
    fn test_peek_transaction_id() {
        let mut buf = [0u8; 20];
        buf[4..8].copy_from_slice(&0x2112A442u32.to_be_bytes());
        assert_eq!(peek_transaction_id(&buf).map(<[u8]>::len), Some(16));
        buf[0] = 0x80;
        assert!(peek_transaction_id(&buf).is_none());
        assert!(peek_transaction_id(&buf[..10]).is_none());
    }
}
