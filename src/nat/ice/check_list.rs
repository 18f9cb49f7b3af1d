// src/nat/ice/check_list.rs
//! ICE check list (RFC 5245 Section 5.7)
//!
//! Pairs live in an arena addressed by [`PairId`]; a separate index keeps
//! them ordered by descending priority. Pairs that reference each other
//! (a check and the peer-reflexive pair it discovered) do so by id. Freed
//! slots are reused, so removing a pair clears every link to it.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::nat::ice::transport::SocketId;
use crate::nat::stun::{StunTimer, TransactionId};

/// Maximum number of pairs in a check list (RFC 5245 Section 5.7.3)
pub const MAX_PAIRS_PER_STREAM: usize = 100;

/// Stable handle to a pair in its stream's check list
pub type PairId = usize;

/// Candidate pair state (RFC 5245 Section 5.7.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
    Frozen,
    /// Pair created from a check that succeeded on another pair
    Discovered,
}

/// An outstanding Binding request for a pair
#[derive(Debug, Clone)]
pub struct StunTransaction {
    pub id: TransactionId,
    pub timer: StunTimer,
    /// Encoded request, resent as-is on retransmission
    pub message: Bytes,
}

#[derive(Debug, Clone)]
pub struct CandidateCheckPair {
    pub id: PairId,
    pub stream_id: u32,
    pub component_id: u32,
    /// Index into the component's local candidates
    pub local: usize,
    /// Index into the component's remote candidates
    pub remote: usize,
    pub socket: SocketId,
    pub foundation: String,
    pub priority: u64,
    /// PRIORITY attribute sent in checks for this pair
    pub prflx_priority: u32,
    pub state: CheckState,
    pub nominated: bool,
    pub valid: bool,
    pub use_candidate_on_next_check: bool,
    pub mark_nominated_on_response_arrival: bool,
    /// Role the last check was sent in
    pub controlling: bool,
    /// Cleared once a better pair is selected
    pub retransmit: bool,
    /// Valid pair this check discovered
    pub discovered_pair: Option<PairId>,
    /// Check that discovered this pair
    pub succeeded_pair: Option<PairId>,
    pub stun_transactions: Vec<StunTransaction>,
}

impl CandidateCheckPair {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: u32,
        component_id: u32,
        local: usize,
        remote: usize,
        socket: SocketId,
        foundation: String,
        priority: u64,
        prflx_priority: u32,
        state: CheckState,
    ) -> Self {
        Self {
            id: 0,
            stream_id,
            component_id,
            local,
            remote,
            socket,
            foundation,
            priority,
            prflx_priority,
            state,
            nominated: false,
            valid: false,
            use_candidate_on_next_check: false,
            mark_nominated_on_response_arrival: false,
            controlling: false,
            retransmit: true,
            discovered_pair: None,
            succeeded_pair: None,
            stun_transactions: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            CheckState::Frozen | CheckState::Waiting | CheckState::InProgress
        )
    }

    pub fn has_transaction(&self, id: &TransactionId) -> bool {
        self.stun_transactions.iter().any(|t| t.id == *id)
    }
}

/// Check list for one stream
#[derive(Debug, Default)]
pub struct CheckList {
    slots: Vec<Option<CandidateCheckPair>>,
    free: Vec<PairId>,
    /// Pair ids sorted by descending priority; equal priorities keep
    /// insertion order
    order: Vec<PairId>,
    /// Triggered check queue (RFC 5245 Section 5.8)
    triggered: VecDeque<PairId>,
}

impl CheckList {
    pub fn new(stream_id: u32) -> Self {
        info!("Creating check list for stream {}", stream_id);
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert before the first pair of strictly lower priority
    pub fn insert_sorted(&mut self, mut pair: CandidateCheckPair) -> PairId {
        let id = self.free.pop().unwrap_or(self.slots.len());
        pair.id = id;
        let position = self
            .order
            .iter()
            .position(|other| {
                self.slots[*other]
                    .as_ref()
                    .map_or(true, |p| p.priority < pair.priority)
            })
            .unwrap_or(self.order.len());
        trace!(
            "Inserting pair {} ({}) with priority {} at position {}",
            id, pair.foundation, pair.priority, position
        );
        match self.slots.get_mut(id) {
            Some(slot) => *slot = Some(pair),
            None => self.slots.push(Some(pair)),
        }
        self.order.insert(position, id);
        id
    }

    pub fn get(&self, id: PairId) -> Option<&CandidateCheckPair> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut CandidateCheckPair> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Pairs in priority order
    pub fn iter(&self) -> impl Iterator<Item = &CandidateCheckPair> {
        self.order.iter().filter_map(move |id| self.get(*id))
    }

    /// Snapshot of the ordered ids, for loops that mutate pairs
    pub fn ids(&self) -> Vec<PairId> {
        self.order.clone()
    }

    pub fn remove(&mut self, id: PairId) -> Option<CandidateCheckPair> {
        let pair = self.slots.get_mut(id)?.take()?;
        self.order.retain(|other| *other != id);
        self.triggered.retain(|other| *other != id);
        for other in self.slots.iter_mut().flatten() {
            if other.discovered_pair == Some(id) {
                other.discovered_pair = None;
            }
            if other.succeeded_pair == Some(id) {
                other.succeeded_pair = None;
            }
        }
        self.free.push(id);
        Some(pair)
    }

    /// Drop the lowest priority Frozen or Waiting pairs that are not valid
    /// until at most `max` pairs remain. Returns the dropped pairs.
    pub fn truncate(&mut self, max: usize) -> Vec<CandidateCheckPair> {
        let mut dropped = Vec::new();
        while self.order.len() > max {
            let victim = self.order.iter().rev().copied().find(|id| {
                self.get(*id).map_or(false, |p| {
                    !p.valid && matches!(p.state, CheckState::Frozen | CheckState::Waiting)
                })
            });
            let Some(id) = victim else { break };
            if let Some(pair) = self.remove(id) {
                debug!(
                    "Check list full, dropping pair {} with priority {}",
                    pair.foundation, pair.priority
                );
                dropped.push(pair);
            }
        }
        dropped
    }

    /// Re-sort after priorities changed (role switch)
    pub fn resort(&mut self) {
        let slots = &self.slots;
        self.order.sort_by(|a, b| {
            let pa = slots[*a].as_ref().map_or(0, |p| p.priority);
            let pb = slots[*b].as_ref().map_or(0, |p| p.priority);
            pb.cmp(&pa)
        });
    }

    pub fn find(&self, component_id: u32, local: usize, remote: usize) -> Option<PairId> {
        self.iter()
            .find(|p| p.component_id == component_id && p.local == local && p.remote == remote)
            .map(|p| p.id)
    }

    pub fn find_by_transaction(&self, id: &TransactionId) -> Option<PairId> {
        self.iter().find(|p| p.has_transaction(id)).map(|p| p.id)
    }

    pub fn push_triggered(&mut self, id: PairId) {
        if !self.triggered.contains(&id) {
            self.triggered.push_back(id);
        }
    }

    pub fn push_triggered_front(&mut self, id: PairId) {
        self.triggered.retain(|other| *other != id);
        self.triggered.push_front(id);
    }

    pub fn pop_triggered(&mut self) -> Option<PairId> {
        self.triggered.pop_front()
    }

    pub fn has_triggered(&self) -> bool {
        !self.triggered.is_empty()
    }

    pub fn triggered_for_component(&self, component_id: u32) -> bool {
        self.triggered
            .iter()
            .any(|id| self.get(*id).map_or(false, |p| p.component_id == component_id))
    }

    /// Highest priority pair of a component matching `filter`
    pub fn best_for_component(
        &self,
        component_id: u32,
        filter: impl Fn(&CandidateCheckPair) -> bool,
    ) -> Option<PairId> {
        self.iter()
            .find(|p| p.component_id == component_id && filter(p))
            .map(|p| p.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(priority: u64, foundation: &str) -> CandidateCheckPair {
        CandidateCheckPair::new(
            1,
            1,
            0,
            0,
            SocketId(1),
            foundation.to_string(),
            priority,
            0,
            CheckState::Frozen,
        )
    }

    fn foundations(list: &CheckList) -> Vec<String> {
        list.iter().map(|p| p.foundation.clone()).collect()
    }

    #[test]
    fn test_sorted_insert_is_stable() {
        let mut list = CheckList::new(1);
        list.insert_sorted(pair(50, "50"));
        list.insert_sorted(pair(90, "90a"));
        list.insert_sorted(pair(10, "10"));
        list.insert_sorted(pair(90, "90b"));
        assert_eq!(foundations(&list), vec!["90a", "90b", "50", "10"]);
    }

    #[test]
    fn test_remove_and_triggered() {
        let mut list = CheckList::new(1);
        let a = list.insert_sorted(pair(10, "a"));
        let b = list.insert_sorted(pair(20, "b"));
        list.push_triggered(a);
        list.push_triggered(a);
        list.push_triggered_front(b);

        assert_eq!(list.pop_triggered(), Some(b));
        list.remove(a);
        assert!(!list.has_triggered());
        assert!(list.get(a).is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_removed_slots_are_reused() {
        let mut list = CheckList::new(1);
        let a = list.insert_sorted(pair(10, "a"));
        let b = list.insert_sorted(pair(20, "b"));
        list.get_mut(b).unwrap().discovered_pair = Some(a);
        list.get_mut(a).unwrap().succeeded_pair = Some(b);

        list.remove(a);
        assert_eq!(list.get(b).unwrap().discovered_pair, None);

        let c = list.insert_sorted(pair(5, "c"));
        assert_eq!(c, a);
        assert_eq!(list.get(c).unwrap().id, c);
        assert_eq!(list.get(c).unwrap().succeeded_pair, None);
        assert_eq!(foundations(&list), vec!["b", "c"]);

        for round in 0..50u64 {
            let id = list.insert_sorted(pair(round, "churn"));
            list.remove(id);
        }
        assert_eq!(list.slots.len(), 2);
    }

    #[test]
    fn test_truncate_keeps_active_pairs() {
        let mut list = CheckList::new(1);
        let low = list.insert_sorted(pair(1, "low"));
        list.get_mut(low).unwrap().state = CheckState::Succeeded;
        list.insert_sorted(pair(2, "mid"));
        list.insert_sorted(pair(3, "high"));

        let dropped = list.truncate(2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].foundation, "mid");
        assert_eq!(foundations(&list), vec!["high", "low"]);
    }

    #[test]
    fn test_resort() {
        let mut list = CheckList::new(1);
        let a = list.insert_sorted(pair(10, "a"));
        list.insert_sorted(pair(20, "b"));
        list.get_mut(a).unwrap().priority = 30;
        list.resort();
        assert_eq!(foundations(&list), vec!["a", "b"]);
        assert_eq!(list.best_for_component(1, |p| p.priority < 25), Some(1));
    }
}
