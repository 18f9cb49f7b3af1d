// src/nat/ice/stream.rs
//! ICE stream and component bookkeeping

use std::sync::Arc;
use std::time::Instant;

use crate::nat::address::Address;
use crate::nat::stun::StunAgent;

use super::candidate::{Candidate, TurnServer};
use super::check_list::{CheckList, PairId};
use super::states::ComponentState;
use super::transport::SocketId;

/// Inbound check received before the remote credentials or candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCheck {
    pub from: Address,
    pub socket: SocketId,
    pub priority: u32,
    pub use_candidate: bool,
    pub username: Vec<u8>,
}

/// Pair chosen for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPair {
    pub pair: PairId,
    pub local: usize,
    pub remote: usize,
    pub priority: u64,
}

/// ICE stream component
#[derive(Debug)]
pub struct Component {
    pub id: u32,
    pub state: ComponentState,
    pub local_candidates: Vec<Candidate>,
    pub remote_candidates: Vec<Candidate>,
    /// Remote candidates a check succeeded against
    pub valid_candidates: Vec<Candidate>,
    pub incoming_checks: Vec<IncomingCheck>,
    pub turn_servers: Vec<Arc<TurnServer>>,
    pub selected_pair: Option<SelectedPair>,
    pub(crate) keepalive_deadline: Option<Instant>,
}

impl Component {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: ComponentState::Disconnected,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            valid_candidates: Vec::new(),
            incoming_checks: Vec::new(),
            turn_servers: Vec::new(),
            selected_pair: None,
            keepalive_deadline: None,
        }
    }

    /// Index of the remote candidate at this address
    pub fn find_remote(&self, addr: &Address) -> Option<usize> {
        self.remote_candidates.iter().position(|c| c.addr == *addr)
    }
}

/// Component by id; ids start at 1
pub(crate) fn find_component(components: &[Component], id: u32) -> Option<&Component> {
    let index = usize::try_from(id.checked_sub(1)?).ok()?;
    components.get(index)
}

pub(crate) fn find_component_mut(components: &mut [Component], id: u32) -> Option<&mut Component> {
    let index = usize::try_from(id.checked_sub(1)?).ok()?;
    components.get_mut(index)
}

/// ICE stream
#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub components: Vec<Component>,
    pub check_list: CheckList,
    /// Agent for connectivity checks on this stream
    pub stun_agent: StunAgent,
    pub local_ufrag: String,
    pub local_password: String,
    pub remote_ufrag: String,
    pub remote_password: String,
    pub initial_binding_request_received: bool,
    /// Gathering started and not yet reported done
    pub gathering: bool,
}

impl Stream {
    pub fn new(
        id: u32,
        n_components: u32,
        stun_agent: StunAgent,
        credentials: (String, String),
    ) -> Self {
        Self {
            id,
            components: (1..=n_components).map(Component::new).collect(),
            check_list: CheckList::new(id),
            stun_agent,
            local_ufrag: credentials.0,
            local_password: credentials.1,
            remote_ufrag: String::new(),
            remote_password: String::new(),
            initial_binding_request_received: false,
            gathering: false,
        }
    }

    pub fn component(&self, id: u32) -> Option<&Component> {
        find_component(&self.components, id)
    }

    pub fn component_mut(&mut self, id: u32) -> Option<&mut Component> {
        find_component_mut(&mut self.components, id)
    }

    pub fn has_remote_credentials(&self) -> bool {
        !self.remote_ufrag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::stun::{StunCompatibility, StunUsageFlags};

    #[test]
    fn test_component_lookup() {
        let agent = StunAgent::new(StunCompatibility::Rfc5389, StunUsageFlags::empty());
        let mut stream = Stream::new(1, 2, agent, ("ufrag".into(), "password".into()));

        assert!(stream.component(0).is_none());
        assert_eq!(stream.component(2).map(|c| c.id), Some(2));
        assert!(stream.component(3).is_none());

        let component = stream.component_mut(1).unwrap();
        assert_eq!(component.state, ComponentState::Disconnected);
        assert!(!stream.has_remote_credentials());
    }
}
