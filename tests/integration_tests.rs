// tests/integration_tests.rs
//! End-to-end tests for the ICE agent
//!
//! Two agents are wired together through in-memory transports and driven by
//! hand with a simulated clock, so every exchange is deterministic.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info;

use sharp_ice::nat::ice::{
    Agent, AgentConfig, AgentEvent, CheckState, ComponentState, MemoryTransport, NominationMode,
    PacketOutcome, SocketId, Transport,
};
use sharp_ice::nat::stun::{
    StunAgent, StunCompatibility, StunMethod, StunUsageFlags, StunValidationStatus,
};
use sharp_ice::nat::{Address, NatError, NatResult};

const LEFT_ADDR: &str = "192.168.1.10:40000";
const RIGHT_ADDR: &str = "192.168.1.20:50000";
const STEP: Duration = Duration::from_millis(20);

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn addr(s: &str) -> Address {
    Address::udp(s.parse().unwrap())
}

/// One agent with a single one-component stream and a host candidate
struct Peer {
    agent: Agent,
    transport: MemoryTransport,
    socket: SocketId,
    stream: u32,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    seen: Vec<AgentEvent>,
}

impl Peer {
    fn new(config: AgentConfig, local: &str) -> NatResult<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut agent = Agent::with_sink(config, tx)?;
        let stream = agent.add_stream(1)?;
        let transport = MemoryTransport::new(addr(local));
        let socket = agent.attach_socket(Box::new(transport.clone()));
        agent.add_local_host_candidate(stream, 1, socket)?;
        Ok(Self {
            agent,
            transport,
            socket,
            stream,
            events,
            seen: Vec::new(),
        })
    }

    fn collect_events(&mut self) -> &[AgentEvent] {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    fn transport_addr(&self) -> Address {
        self.agent.socket_local_addr(self.socket).unwrap()
    }

    fn state(&self) -> ComponentState {
        self.agent.component_state(self.stream, 1).unwrap()
    }

    fn credentials_from(&mut self, other: &Peer) {
        let (ufrag, password) = other.agent.local_credentials(other.stream).unwrap();
        self.agent
            .set_remote_credentials(self.stream, &ufrag, &password)
            .unwrap();
    }

    fn candidates_from(&mut self, other: &Peer) {
        let candidates = other.agent.local_candidates(other.stream, 1).unwrap();
        self.agent
            .set_remote_candidates(self.stream, 1, candidates)
            .unwrap();
    }
}

/// Move every datagram `from` sent into `to`. Returns how many moved.
fn deliver(from: &mut Peer, to: &mut Peer, now: Instant) -> usize {
    let sent = from.transport.drain_sent();
    let count = sent.len();
    for datagram in sent {
        assert_eq!(datagram.to, to.transport_addr());
        to.agent
            .handle_packet(to.socket, datagram.from, &datagram.data, now);
    }
    count
}

/// Tick both agents every Ta until both components are ready
fn run_until_ready(left: &mut Peer, right: &mut Peer, mut now: Instant) -> Instant {
    for _ in 0..500 {
        now += STEP;
        left.agent.tick(now);
        right.agent.tick(now);
        deliver(left, right, now);
        deliver(right, left, now);
        if left.state() == ComponentState::Ready && right.state() == ComponentState::Ready {
            return now;
        }
    }
    panic!(
        "agents did not connect: left {:?}, right {:?}",
        left.state(),
        right.state()
    );
}

fn connected_pair(config_left: AgentConfig, config_right: AgentConfig) -> (Peer, Peer) {
    let mut left = Peer::new(config_left, LEFT_ADDR).unwrap();
    let mut right = Peer::new(config_right, RIGHT_ADDR).unwrap();
    left.credentials_from(&right);
    right.credentials_from(&left);
    left.candidates_from(&right);
    right.candidates_from(&left);
    (left, right)
}

fn controlling() -> AgentConfig {
    AgentConfig {
        controlling_mode: true,
        ..AgentConfig::default()
    }
}

fn assert_selected_pairs_match(left: &Peer, right: &Peer) {
    let (left_local, left_remote) = left.agent.selected_pair(left.stream, 1).unwrap().unwrap();
    let (right_local, right_remote) = right.agent.selected_pair(right.stream, 1).unwrap().unwrap();
    assert_eq!(left_local.addr, addr(LEFT_ADDR));
    assert_eq!(left_remote.addr, addr(RIGHT_ADDR));
    assert_eq!(right_local.addr, addr(RIGHT_ADDR));
    assert_eq!(right_remote.addr, addr(LEFT_ADDR));
}

fn state_changes(events: &[AgentEvent]) -> Vec<ComponentState> {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ComponentStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[test]
fn test_regular_nomination_end_to_end() {
    setup_test_logging();
    info!("Two agents, regular nomination");

    let (mut left, mut right) = connected_pair(controlling(), AgentConfig::default());
    run_until_ready(&mut left, &mut right, Instant::now());
    assert_selected_pairs_match(&left, &right);

    for peer in [&mut left, &mut right] {
        let stream = peer.stream;
        let events = peer.collect_events().to_vec();
        assert_eq!(
            state_changes(&events),
            vec![
                ComponentState::Connecting,
                ComponentState::Connected,
                ComponentState::Ready
            ]
        );
        let selected = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::NewSelectedPair { .. }))
            .count();
        assert_eq!(selected, 1);
        assert!(events.contains(&AgentEvent::InitialBindingRequestReceived { stream_id: stream }));
    }

    // Application data flows over the selected pair
    left.transport.drain_sent();
    let written = left.agent.send(left.stream, 1, b"hello").unwrap();
    assert_eq!(written, 5);
    let sent = left.transport.drain_sent();
    assert_eq!(sent.len(), 1);
    let outcome = right
        .agent
        .handle_packet(right.socket, sent[0].from, &sent[0].data, Instant::now());
    assert_eq!(outcome, PacketOutcome::Data);
}

#[test]
fn test_aggressive_nomination_end_to_end() {
    setup_test_logging();

    let config = AgentConfig {
        nomination_mode: NominationMode::Aggressive,
        ..controlling()
    };
    let (mut left, mut right) = connected_pair(config, AgentConfig::default());

    // The very first check carries USE-CANDIDATE
    let now = Instant::now() + STEP;
    left.agent.tick(now);
    let sent = left.transport.drain_sent();
    assert_eq!(sent.len(), 1);
    let first = sharp_ice::StunMessage::decode(&sent[0].data, true).unwrap();
    assert_eq!(first.method_code(), StunMethod::Binding.code());
    assert!(first.find_flag(sharp_ice::nat::stun::StunAttributeType::UseCandidate.code()));
    for datagram in sent {
        right
            .agent
            .handle_packet(right.socket, datagram.from, &datagram.data, now);
    }

    run_until_ready(&mut left, &mut right, now);
    assert_selected_pairs_match(&left, &right);
}

/// Frozen or Waiting pairs ranked below a succeeded pair of the component
fn pending_below_success(peer: &Peer) -> Vec<(u64, CheckState)> {
    let pairs = peer.agent.check_pairs(peer.stream).unwrap();
    let Some(best) = pairs
        .iter()
        .filter(|p| p.state == CheckState::Succeeded)
        .map(|p| p.priority)
        .max()
    else {
        return Vec::new();
    };
    pairs
        .iter()
        .filter(|p| matches!(p.state, CheckState::Frozen | CheckState::Waiting))
        .filter(|p| p.priority < best && !p.valid && !p.mark_nominated_on_response_arrival)
        .map(|p| (p.priority, p.state))
        .collect()
}

#[test]
fn test_succeeded_pair_prunes_lower_siblings() {
    setup_test_logging();

    let mut left = Peer::new(AgentConfig::default(), LEFT_ADDR).unwrap();
    let mut right = Peer::new(controlling(), RIGHT_ADDR).unwrap();
    let second = MemoryTransport::new(addr("10.9.9.9:50001"));
    let second_socket = right.agent.attach_socket(Box::new(second.clone()));
    right
        .agent
        .add_local_host_candidate(right.stream, 1, second_socket)
        .unwrap();
    left.credentials_from(&right);
    right.credentials_from(&left);
    left.candidates_from(&right);
    right.candidates_from(&left);
    assert_eq!(left.agent.check_pairs(left.stream).unwrap().len(), 2);

    let mut now = Instant::now();
    for step in 0..500 {
        now += STEP;
        left.agent.tick(now);
        right.agent.tick(now);
        for datagram in left.transport.drain_sent() {
            let socket = if datagram.to == right.transport_addr() {
                right.socket
            } else {
                assert_eq!(datagram.to, second.local_addr());
                second_socket
            };
            right
                .agent
                .handle_packet(socket, datagram.from, &datagram.data, now);
        }
        let from_right: Vec<_> = right
            .transport
            .drain_sent()
            .into_iter()
            .chain(second.drain_sent())
            .collect();
        for datagram in from_right {
            left.agent
                .handle_packet(left.socket, datagram.from, &datagram.data, now);
        }

        for (name, peer) in [("left", &left), ("right", &right)] {
            let stale = pending_below_success(peer);
            assert!(stale.is_empty(), "step {} {}: {:?}", step, name, stale);
        }
        if left.state() == ComponentState::Ready && right.state() == ComponentState::Ready {
            break;
        }
    }
    assert_eq!(left.state(), ComponentState::Ready);
    assert_eq!(right.state(), ComponentState::Ready);
}

#[test]
fn test_role_conflict_resolved_by_tie_breaker() {
    setup_test_logging();

    let (mut left, mut right) = connected_pair(controlling(), controlling());
    left.agent.set_tie_breaker(1000);
    right.agent.set_tie_breaker(10);

    run_until_ready(&mut left, &mut right, Instant::now());
    assert!(left.agent.is_controlling());
    assert!(!right.agent.is_controlling());
    assert_selected_pairs_match(&left, &right);
}

#[test]
fn test_role_conflict_both_controlled() {
    setup_test_logging();

    let (mut left, mut right) = connected_pair(AgentConfig::default(), AgentConfig::default());
    left.agent.set_tie_breaker(1000);
    right.agent.set_tie_breaker(10);

    run_until_ready(&mut left, &mut right, Instant::now());
    assert!(left.agent.is_controlling());
    assert!(!right.agent.is_controlling());
}

#[test]
fn test_early_check_before_remote_credentials() {
    setup_test_logging();

    let mut left = Peer::new(controlling(), LEFT_ADDR).unwrap();
    let mut right = Peer::new(AgentConfig::default(), RIGHT_ADDR).unwrap();
    left.credentials_from(&right);
    left.candidates_from(&right);

    // Right knows nothing about left yet but still answers
    let mut now = Instant::now() + STEP;
    left.agent.tick(now);
    assert_eq!(deliver(&mut left, &mut right, now), 1);
    assert_eq!(right.transport.drain_sent().len(), 1);
    let right_stream = right.stream;
    assert!(right
        .collect_events()
        .contains(&AgentEvent::InitialBindingRequestReceived { stream_id: right_stream }));
    assert!(right.agent.check_pairs(right.stream).unwrap().is_empty());

    // The stored check turns into a triggered check once signaling completes
    right.credentials_from(&left);
    right.candidates_from(&left);
    let pairs = right.agent.check_pairs(right.stream).unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].state, CheckState::Waiting);

    now += STEP;
    right.agent.tick(now);
    let sent = right.transport.drain_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, addr(LEFT_ADDR));

    run_until_ready(&mut left, &mut right, now);
}

#[test]
fn test_single_pair_frozen_before_first_tick() {
    setup_test_logging();

    let (left, _right) = connected_pair(controlling(), AgentConfig::default());
    let pairs = left.agent.check_pairs(left.stream).unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].state, CheckState::Frozen);
    assert_eq!(left.state(), ComponentState::Connecting);
    assert!(left.transport.drain_sent().is_empty());
}

#[test]
fn test_component_fails_when_checks_time_out() {
    setup_test_logging();

    let config = AgentConfig {
        stun_max_retransmissions: 3,
        stun_initial_timeout_ms: 100,
        ..controlling()
    };
    let (mut left, _right) = connected_pair(config, AgentConfig::default());

    let mut now = Instant::now();
    for _ in 0..200 {
        now += STEP;
        left.agent.tick(now);
        if left.state() == ComponentState::Failed {
            break;
        }
    }
    assert_eq!(left.state(), ComponentState::Failed);
    // One request and three retransmissions, never answered
    assert_eq!(left.transport.drain_sent().len(), 4);
    let pairs = left.agent.check_pairs(left.stream).unwrap();
    assert!(pairs.iter().all(|p| p.state == CheckState::Failed));
    assert_eq!(
        state_changes(left.collect_events()),
        vec![ComponentState::Connecting, ComponentState::Failed]
    );
}

#[test]
fn test_checks_wait_for_remote_credentials() {
    setup_test_logging();

    let mut left = Peer::new(controlling(), LEFT_ADDR).unwrap();
    let right = Peer::new(AgentConfig::default(), RIGHT_ADDR).unwrap();
    left.candidates_from(&right);

    let mut now = Instant::now();
    for _ in 0..5 {
        now += STEP;
        left.agent.tick(now);
    }
    assert!(left.transport.drain_sent().is_empty());
    assert!(matches!(
        left.agent.set_remote_credentials(left.stream, "", "pw"),
        Err(NatError::Configuration(_))
    ));
}

#[test]
fn test_non_stun_and_bad_cookie_datagrams() {
    setup_test_logging();

    let (mut left, _right) = connected_pair(controlling(), AgentConfig::default());
    let now = Instant::now();
    let from = addr(RIGHT_ADDR);

    // Shorter than a STUN header
    assert_eq!(
        left.agent.handle_packet(left.socket, from, b"\x00\x01\x00", now),
        PacketOutcome::Data
    );

    let mut client = StunAgent::new(StunCompatibility::Rfc5389, StunUsageFlags::empty());
    let mut request = client.init_request(StunMethod::Binding);
    let wire = client.finish_message(&mut request, None).unwrap();
    let mut corrupted = wire.to_vec();
    corrupted[4] ^= 0xFF;

    let mut server = StunAgent::new(StunCompatibility::Rfc5389, StunUsageFlags::empty());
    assert_eq!(
        server.validate(&corrupted, &mut |_| None).status,
        StunValidationStatus::BadRequest
    );
    assert_eq!(
        server.validate(&wire[..10], &mut |_| None).status,
        StunValidationStatus::NotStun
    );

    // Neither reaches the check list
    left.agent
        .handle_packet(left.socket, from, &corrupted, now);
    assert!(left.transport.drain_sent().is_empty());
    let pairs = left.agent.check_pairs(left.stream).unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].state, CheckState::Frozen);
}

#[test]
fn test_unknown_socket_datagram_is_discarded() {
    let (mut left, _right) = connected_pair(controlling(), AgentConfig::default());
    let outcome = left.agent.handle_packet(
        SocketId(42),
        addr(RIGHT_ADDR),
        &Bytes::from_static(b"data"),
        Instant::now(),
    );
    assert_eq!(outcome, PacketOutcome::Discarded);
}

#[tokio::test]
async fn test_driver_connects_two_agents() {
    setup_test_logging();
    use sharp_ice::nat::ice::{spawn_agent, spawn_udp_reader, UdpTransport};
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    let left_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let right_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

    let (left_data, _left_rx) = mpsc::unbounded_channel();
    let (right_data, mut right_rx) = mpsc::unbounded_channel();
    let (left, _left_task) = spawn_agent(Agent::new(controlling()).unwrap(), left_data);
    let (right, _right_task) = spawn_agent(Agent::new(AgentConfig::default()).unwrap(), right_data);

    let mut streams = Vec::new();
    for (handle, socket) in [(&left, &left_socket), (&right, &right_socket)] {
        let stream = handle.add_stream(1).await.unwrap();
        let id = handle
            .attach_socket(Box::new(UdpTransport::from_socket(socket.clone()).unwrap()))
            .await
            .unwrap();
        handle.add_local_host_candidate(stream, 1, id).await.unwrap();
        spawn_udp_reader(socket.clone(), id, handle.clone());
        streams.push(stream);
    }
    let (ls, rs) = (streams[0], streams[1]);

    let (ufrag, pwd) = right.local_credentials(rs).await.unwrap();
    left.set_remote_credentials(ls, &ufrag, &pwd).await.unwrap();
    let (ufrag, pwd) = left.local_credentials(ls).await.unwrap();
    right.set_remote_credentials(rs, &ufrag, &pwd).await.unwrap();
    let candidates = right.local_candidates(rs, 1).await.unwrap();
    left.set_remote_candidates(ls, 1, candidates).await.unwrap();
    let candidates = left.local_candidates(ls, 1).await.unwrap();
    right.set_remote_candidates(rs, 1, candidates).await.unwrap();

    let ready = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let l = left.component_state(ls, 1).await.unwrap();
            let r = right.component_state(rs, 1).await.unwrap();
            if l == ComponentState::Ready && r == ComponentState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(ready.is_ok(), "agents did not reach ready");

    left.send(ls, 1, Bytes::from_static(b"over ice")).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), right_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received.data[..], b"over ice");
}
