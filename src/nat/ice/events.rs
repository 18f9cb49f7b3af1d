// src/nat/ice/events.rs
//! Notifications emitted by the agent

use tokio::sync::mpsc;
use tracing::trace;

use super::states::ComponentState;

/// Agent notification, delivered in the order transitions occur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    NewCandidate {
        stream_id: u32,
        component_id: u32,
        foundation: String,
    },
    NewRemoteCandidate {
        stream_id: u32,
        component_id: u32,
        foundation: String,
    },
    GatheringDone {
        stream_id: u32,
    },
    ComponentStateChanged {
        stream_id: u32,
        component_id: u32,
        state: ComponentState,
    },
    NewSelectedPair {
        stream_id: u32,
        component_id: u32,
        local_foundation: String,
        remote_foundation: String,
    },
    InitialBindingRequestReceived {
        stream_id: u32,
    },
}

impl AgentEvent {
    pub(crate) fn dispatch(&self, sink: &mut dyn NotificationSink) {
        match self {
            Self::NewCandidate {
                stream_id,
                component_id,
                foundation,
            } => sink.on_new_candidate(*stream_id, *component_id, foundation),
            Self::NewRemoteCandidate {
                stream_id,
                component_id,
                foundation,
            } => sink.on_new_remote_candidate(*stream_id, *component_id, foundation),
            Self::GatheringDone { stream_id } => sink.on_gathering_done(*stream_id),
            Self::ComponentStateChanged {
                stream_id,
                component_id,
                state,
            } => sink.on_component_state_change(*stream_id, *component_id, *state),
            Self::NewSelectedPair {
                stream_id,
                component_id,
                local_foundation,
                remote_foundation,
            } => sink.on_selected_pair(
                *stream_id,
                *component_id,
                local_foundation,
                remote_foundation,
            ),
            Self::InitialBindingRequestReceived { stream_id } => {
                sink.on_initial_binding_request_received(*stream_id)
            }
        }
    }
}

/// One-way callbacks invoked by the agent. Every method defaults to a no-op.
pub trait NotificationSink: Send {
    fn on_new_candidate(&mut self, _stream_id: u32, _component_id: u32, _foundation: &str) {}

    fn on_new_remote_candidate(&mut self, _stream_id: u32, _component_id: u32, _foundation: &str) {
    }

    fn on_gathering_done(&mut self, _stream_id: u32) {}

    fn on_component_state_change(
        &mut self,
        _stream_id: u32,
        _component_id: u32,
        _state: ComponentState,
    ) {
    }

    fn on_selected_pair(
        &mut self,
        _stream_id: u32,
        _component_id: u32,
        _local_foundation: &str,
        _remote_foundation: &str,
    ) {
    }

    fn on_initial_binding_request_received(&mut self, _stream_id: u32) {}
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {}

fn forward(sender: &mpsc::UnboundedSender<AgentEvent>, event: AgentEvent) {
    if sender.send(event).is_err() {
        trace!("Event receiver dropped");
    }
}

impl NotificationSink for mpsc::UnboundedSender<AgentEvent> {
    fn on_new_candidate(&mut self, stream_id: u32, component_id: u32, foundation: &str) {
        forward(
            self,
            AgentEvent::NewCandidate {
                stream_id,
                component_id,
                foundation: foundation.to_string(),
            },
        );
    }

    fn on_new_remote_candidate(&mut self, stream_id: u32, component_id: u32, foundation: &str) {
        forward(
            self,
            AgentEvent::NewRemoteCandidate {
                stream_id,
                component_id,
                foundation: foundation.to_string(),
            },
        );
    }

    fn on_gathering_done(&mut self, stream_id: u32) {
        forward(self, AgentEvent::GatheringDone { stream_id });
    }

    fn on_component_state_change(
        &mut self,
        stream_id: u32,
        component_id: u32,
        state: ComponentState,
    ) {
        forward(
            self,
            AgentEvent::ComponentStateChanged {
                stream_id,
                component_id,
                state,
            },
        );
    }

    fn on_selected_pair(
        &mut self,
        stream_id: u32,
        component_id: u32,
        local_foundation: &str,
        remote_foundation: &str,
    ) {
        forward(
            self,
            AgentEvent::NewSelectedPair {
                stream_id,
                component_id,
                local_foundation: local_foundation.to_string(),
                remote_foundation: remote_foundation.to_string(),
            },
        );
    }

    fn on_initial_binding_request_received(&mut self, stream_id: u32) {
        forward(self, AgentEvent::InitialBindingRequestReceived { stream_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_round_trip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = tx;
        let events = vec![
            AgentEvent::GatheringDone { stream_id: 1 },
            AgentEvent::ComponentStateChanged {
                stream_id: 1,
                component_id: 1,
                state: ComponentState::Connecting,
            },
            AgentEvent::NewSelectedPair {
                stream_id: 1,
                component_id: 1,
                local_foundation: "1".into(),
                remote_foundation: "2".into(),
            },
        ];
        for event in &events {
            event.dispatch(&mut sink);
        }
        for event in events {
            assert_eq!(rx.try_recv().unwrap(), event);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_null_sink_ignores_events() {
        let mut sink = NullSink;
        AgentEvent::InitialBindingRequestReceived { stream_id: 3 }.dispatch(&mut sink);
    }
}
