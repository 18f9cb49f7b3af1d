// src/nat/ice/driver.rs
//! Tokio driver for the agent
//!
//! The [`Agent`] is single-threaded and never blocks. [`spawn_agent`] moves
//! it into a task that serializes commands from any number of
//! [`AgentHandle`]s and ticks it every Ta.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::nat::address::Address;
use crate::nat::error::{NatError, NatResult};

use super::agent::{Agent, PacketOutcome, ReceivedData};
use super::candidate::{Candidate, TurnServer};
use super::discovery::HostCandidateResult;
use super::states::ComponentState;
use super::transport::{SocketId, Transport};

const COMMAND_CHANNEL_SIZE: usize = 256;

type Reply<T> = oneshot::Sender<NatResult<T>>;

enum AgentCommand {
    AddStream {
        n_components: u32,
        reply: Reply<u32>,
    },
    RemoveStream {
        stream_id: u32,
        reply: Reply<()>,
    },
    AttachSocket {
        transport: Box<dyn Transport>,
        reply: Reply<SocketId>,
    },
    AttachRelaySocket {
        stream_id: u32,
        component_id: u32,
        transport: Box<dyn Transport>,
        reply: Reply<SocketId>,
    },
    AddHostCandidate {
        stream_id: u32,
        component_id: u32,
        socket: SocketId,
        reply: Reply<HostCandidateResult>,
    },
    AddTurnServer {
        stream_id: u32,
        component_id: u32,
        turn: TurnServer,
        reply: Reply<()>,
    },
    GatherCandidates {
        stream_id: u32,
        reply: Reply<()>,
    },
    LocalCredentials {
        stream_id: u32,
        reply: Reply<(String, String)>,
    },
    SetRemoteCredentials {
        stream_id: u32,
        ufrag: String,
        password: String,
        reply: Reply<()>,
    },
    SetRemoteCandidates {
        stream_id: u32,
        component_id: u32,
        candidates: Vec<Candidate>,
        reply: Reply<usize>,
    },
    LocalCandidates {
        stream_id: u32,
        component_id: u32,
        reply: Reply<Vec<Candidate>>,
    },
    SetControllingMode {
        controlling: bool,
    },
    ComponentState {
        stream_id: u32,
        component_id: u32,
        reply: Reply<ComponentState>,
    },
    SelectedPair {
        stream_id: u32,
        component_id: u32,
        reply: Reply<Option<(Candidate, Candidate)>>,
    },
    Send {
        stream_id: u32,
        component_id: u32,
        data: Bytes,
        reply: Reply<usize>,
    },
    HandlePacket {
        socket: SocketId,
        from: Address,
        data: Bytes,
        reply: Option<oneshot::Sender<PacketOutcome>>,
    },
    Shutdown,
}

/// Cloneable handle to an agent running in a [`spawn_agent`] task
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentCommand>,
}

impl AgentHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> AgentCommand) -> NatResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| NatError::AgentClosed)?;
        rx.await.map_err(|_| NatError::AgentClosed)?
    }

    pub async fn add_stream(&self, n_components: u32) -> NatResult<u32> {
        self.request(|reply| AgentCommand::AddStream {
            n_components,
            reply,
        })
        .await
    }

    pub async fn remove_stream(&self, stream_id: u32) -> NatResult<()> {
        self.request(|reply| AgentCommand::RemoveStream { stream_id, reply })
            .await
    }

    pub async fn attach_socket(&self, transport: Box<dyn Transport>) -> NatResult<SocketId> {
        self.request(|reply| AgentCommand::AttachSocket { transport, reply })
            .await
    }

    pub async fn attach_relay_socket(
        &self,
        stream_id: u32,
        component_id: u32,
        transport: Box<dyn Transport>,
    ) -> NatResult<SocketId> {
        self.request(|reply| AgentCommand::AttachRelaySocket {
            stream_id,
            component_id,
            transport,
            reply,
        })
        .await
    }

    pub async fn add_local_host_candidate(
        &self,
        stream_id: u32,
        component_id: u32,
        socket: SocketId,
    ) -> NatResult<HostCandidateResult> {
        self.request(|reply| AgentCommand::AddHostCandidate {
            stream_id,
            component_id,
            socket,
            reply,
        })
        .await
    }

    pub async fn add_turn_server(
        &self,
        stream_id: u32,
        component_id: u32,
        turn: TurnServer,
    ) -> NatResult<()> {
        self.request(|reply| AgentCommand::AddTurnServer {
            stream_id,
            component_id,
            turn,
            reply,
        })
        .await
    }

    pub async fn gather_candidates(&self, stream_id: u32) -> NatResult<()> {
        self.request(|reply| AgentCommand::GatherCandidates { stream_id, reply })
            .await
    }

    pub async fn local_credentials(&self, stream_id: u32) -> NatResult<(String, String)> {
        self.request(|reply| AgentCommand::LocalCredentials { stream_id, reply })
            .await
    }

    pub async fn set_remote_credentials(
        &self,
        stream_id: u32,
        ufrag: &str,
        password: &str,
    ) -> NatResult<()> {
        let (ufrag, password) = (ufrag.to_string(), password.to_string());
        self.request(|reply| AgentCommand::SetRemoteCredentials {
            stream_id,
            ufrag,
            password,
            reply,
        })
        .await
    }

    pub async fn set_remote_candidates(
        &self,
        stream_id: u32,
        component_id: u32,
        candidates: Vec<Candidate>,
    ) -> NatResult<usize> {
        self.request(|reply| AgentCommand::SetRemoteCandidates {
            stream_id,
            component_id,
            candidates,
            reply,
        })
        .await
    }

    pub async fn local_candidates(
        &self,
        stream_id: u32,
        component_id: u32,
    ) -> NatResult<Vec<Candidate>> {
        self.request(|reply| AgentCommand::LocalCandidates {
            stream_id,
            component_id,
            reply,
        })
        .await
    }

    pub async fn set_controlling_mode(&self, controlling: bool) -> NatResult<()> {
        self.tx
            .send(AgentCommand::SetControllingMode { controlling })
            .await
            .map_err(|_| NatError::AgentClosed)
    }

    pub async fn component_state(
        &self,
        stream_id: u32,
        component_id: u32,
    ) -> NatResult<ComponentState> {
        self.request(|reply| AgentCommand::ComponentState {
            stream_id,
            component_id,
            reply,
        })
        .await
    }

    pub async fn selected_pair(
        &self,
        stream_id: u32,
        component_id: u32,
    ) -> NatResult<Option<(Candidate, Candidate)>> {
        self.request(|reply| AgentCommand::SelectedPair {
            stream_id,
            component_id,
            reply,
        })
        .await
    }

    pub async fn send(&self, stream_id: u32, component_id: u32, data: Bytes) -> NatResult<usize> {
        self.request(|reply| AgentCommand::Send {
            stream_id,
            component_id,
            data,
            reply,
        })
        .await
    }

    /// Hand an inbound datagram to the agent and wait for the verdict
    pub async fn handle_packet(
        &self,
        socket: SocketId,
        from: Address,
        data: Bytes,
    ) -> NatResult<PacketOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::HandlePacket {
                socket,
                from,
                data,
                reply: Some(reply),
            })
            .await
            .map_err(|_| NatError::AgentClosed)?;
        rx.await.map_err(|_| NatError::AgentClosed)
    }

    async fn deliver(&self, socket: SocketId, from: Address, data: Bytes) -> NatResult<()> {
        self.tx
            .send(AgentCommand::HandlePacket {
                socket,
                from,
                data,
                reply: None,
            })
            .await
            .map_err(|_| NatError::AgentClosed)
    }

    /// Stop the agent task. The task returns the agent.
    pub async fn shutdown(&self) -> NatResult<()> {
        self.tx
            .send(AgentCommand::Shutdown)
            .await
            .map_err(|_| NatError::AgentClosed)
    }
}

/// Run `agent` on the current runtime.
///
/// Application data that arrives through [`AgentHandle`] packets is
/// forwarded to `data_tx`. The task ends on shutdown or once every handle
/// is dropped, yielding the agent back.
pub fn spawn_agent(
    mut agent: Agent,
    data_tx: mpsc::UnboundedSender<ReceivedData>,
) -> (AgentHandle, JoinHandle<Agent>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let task = tokio::spawn(async move {
        let mut ticker = interval(agent.timer_ta());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("ICE agent task started, Ta = {:?}", agent.timer_ta());

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        debug!("All agent handles dropped");
                        break;
                    };
                    if !run_command(&mut agent, command, &data_tx) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    agent.tick(Instant::now());
                }
            }
        }

        info!("ICE agent task stopped");
        agent
    });

    (AgentHandle { tx }, task)
}

/// Returns false on shutdown
fn run_command(
    agent: &mut Agent,
    command: AgentCommand,
    data_tx: &mpsc::UnboundedSender<ReceivedData>,
) -> bool {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        AgentCommand::AddStream {
            n_components,
            reply,
        } => {
            let _ = reply.send(agent.add_stream(n_components));
        }
        AgentCommand::RemoveStream { stream_id, reply } => {
            let _ = reply.send(agent.remove_stream(stream_id));
        }
        AgentCommand::AttachSocket { transport, reply } => {
            let _ = reply.send(Ok(agent.attach_socket(transport)));
        }
        AgentCommand::AttachRelaySocket {
            stream_id,
            component_id,
            transport,
            reply,
        } => {
            let _ = reply.send(agent.attach_relay_socket(stream_id, component_id, transport));
        }
        AgentCommand::AddHostCandidate {
            stream_id,
            component_id,
            socket,
            reply,
        } => {
            let _ = reply.send(agent.add_local_host_candidate(stream_id, component_id, socket));
        }
        AgentCommand::AddTurnServer {
            stream_id,
            component_id,
            turn,
            reply,
        } => {
            let _ = reply.send(agent.add_turn_server(stream_id, component_id, turn));
        }
        AgentCommand::GatherCandidates { stream_id, reply } => {
            let _ = reply.send(agent.gather_candidates(stream_id));
        }
        AgentCommand::LocalCredentials { stream_id, reply } => {
            let _ = reply.send(agent.local_credentials(stream_id));
        }
        AgentCommand::SetRemoteCredentials {
            stream_id,
            ufrag,
            password,
            reply,
        } => {
            let _ = reply.send(agent.set_remote_credentials(stream_id, &ufrag, &password));
        }
        AgentCommand::SetRemoteCandidates {
            stream_id,
            component_id,
            candidates,
            reply,
        } => {
            let _ = reply.send(agent.set_remote_candidates(stream_id, component_id, candidates));
        }
        AgentCommand::LocalCandidates {
            stream_id,
            component_id,
            reply,
        } => {
            let _ = reply.send(agent.local_candidates(stream_id, component_id));
        }
        AgentCommand::SetControllingMode { controlling } => {
            agent.set_controlling_mode(controlling);
        }
        AgentCommand::ComponentState {
            stream_id,
            component_id,
            reply,
        } => {
            let _ = reply.send(agent.component_state(stream_id, component_id));
        }
        AgentCommand::SelectedPair {
            stream_id,
            component_id,
            reply,
        } => {
            let _ = reply.send(agent.selected_pair(stream_id, component_id));
        }
        AgentCommand::Send {
            stream_id,
            component_id,
            data,
            reply,
        } => {
            let _ = reply.send(agent.send(stream_id, component_id, &data));
        }
        AgentCommand::HandlePacket {
            socket,
            from,
            data,
            reply,
        } => {
            let outcome = agent.handle_packet(socket, from, &data, Instant::now());
            if outcome == PacketOutcome::Data {
                let _ = data_tx.send(ReceivedData { socket, from, data });
            }
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        }
        AgentCommand::Shutdown => return false,
    }
    true
}

/// Read `socket` until it fails or the agent goes away, feeding every
/// datagram to the agent as arriving on `id`
pub fn spawn_udp_reader(socket: Arc<UdpSocket>, id: SocketId, handle: AgentHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Receive on {} failed: {}", id, e);
                    break;
                }
            };
            let data = Bytes::copy_from_slice(&buf[..len]);
            if handle.deliver(id, Address::udp(from), data).await.is_err() {
                debug!("Agent closed, stopping reader for {}", id);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::ice::config::AgentConfig;
    use crate::nat::ice::transport::{MemoryTransport, UdpTransport};
    use std::time::Duration;

    fn memory(addr: &str) -> MemoryTransport {
        MemoryTransport::new(Address::udp(addr.parse().unwrap()))
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let agent = Agent::new(AgentConfig::default()).unwrap();
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_agent(agent, data_tx);

        let stream = handle.add_stream(1).await.unwrap();
        let socket = handle
            .attach_socket(Box::new(memory("10.0.0.1:5000")))
            .await
            .unwrap();
        assert_eq!(
            handle.add_local_host_candidate(stream, 1, socket).await.unwrap(),
            HostCandidateResult::Success
        );
        assert_eq!(handle.local_candidates(stream, 1).await.unwrap().len(), 1);
        assert!(matches!(
            handle.component_state(stream, 9).await,
            Err(NatError::UnknownComponent { .. })
        ));

        handle.shutdown().await.unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.local_candidates(stream, 1).unwrap().len(), 1);
        assert!(matches!(handle.add_stream(1).await, Err(NatError::AgentClosed)));
    }

    #[tokio::test]
    async fn test_non_stun_packet_is_forwarded() {
        let agent = Agent::new(AgentConfig::default()).unwrap();
        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_agent(agent, data_tx);

        let stream = handle.add_stream(1).await.unwrap();
        let socket = handle
            .attach_socket(Box::new(memory("10.0.0.1:5000")))
            .await
            .unwrap();
        handle.add_local_host_candidate(stream, 1, socket).await.unwrap();

        let from = Address::udp("10.0.0.2:6000".parse().unwrap());
        let outcome = handle
            .handle_packet(socket, from, Bytes::from_static(b"\xffpayload"))
            .await
            .unwrap();
        assert_eq!(outcome, PacketOutcome::Data);
        let received = data_rx.recv().await.unwrap();
        assert_eq!(received.from, from);
        assert_eq!(&received.data[..], b"\xffpayload");
    }

    #[tokio::test]
    async fn test_udp_reader_feeds_agent() {
        let agent = Agent::new(AgentConfig::default()).unwrap();
        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_agent(agent, data_tx);

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let stream = handle.add_stream(1).await.unwrap();
        let id = handle
            .attach_socket(Box::new(UdpTransport::from_socket(socket.clone()).unwrap()))
            .await
            .unwrap();
        handle.add_local_host_candidate(stream, 1, id).await.unwrap();
        spawn_udp_reader(socket.clone(), id, handle.clone());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"\x80hello", socket.local_addr().unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.socket, id);
        assert_eq!(&received.data[..], b"\x80hello");
    }
}
