//! Leader-side batching and per-index quorum acknowledgement (§4.5).
//!
//! The actual broadcast/WAL-write loop lives in [`crate::node`] since it
//! needs the shared lock, the WAL handle, and the transport; this module
//! holds the parts of that logic that are pure enough to unit test on
//! their own.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::{LogIndex, PeerId};

/// Drains as many queued Normal proposals as fit under `budget` bytes,
/// always taking at least one so a single oversized proposal still makes
/// progress.
pub fn drain_batch(pending: &mut VecDeque<Bytes>, budget: usize) -> Vec<Bytes> {
    let mut batch = Vec::new();
    let mut used = 0usize;
    while let Some(front) = pending.front() {
        if !batch.is_empty() && used + front.len() > budget {
            break;
        }
        let item = pending.pop_front().unwrap();
        used += item.len();
        batch.push(item);
    }
    batch
}

/// `acks[index]` from §4.5: starts with `{self}` the moment the leader
/// appends `index` to its own WAL, and grows as success responses arrive.
#[derive(Default)]
pub struct AckTracker {
    acks: HashMap<LogIndex, HashSet<PeerId>>,
}

impl AckTracker {
    pub fn new() -> Self {
        AckTracker::default()
    }

    pub fn start(&mut self, index: LogIndex, self_id: PeerId) {
        self.acks.entry(index).or_default().insert(self_id);
    }

    /// Records `peer`'s ack of `index` and every index below it that is
    /// still tracked (a success response at index N implies N's own log
    /// matched, but the leader only needs the specific index's ack set
    /// sized for quorum advancement, so we only touch `index` itself).
    pub fn record(&mut self, index: LogIndex, peer: PeerId) -> usize {
        let set = self.acks.entry(index).or_default();
        set.insert(peer);
        set.len()
    }

    pub fn count(&self, index: LogIndex) -> usize {
        self.acks.get(&index).map(HashSet::len).unwrap_or(0)
    }

    /// Drops tracking for every index `<= through`, called once `commit`
    /// advances past them.
    pub fn forget_through(&mut self, through: LogIndex) {
        self.acks.retain(|idx, _| *idx > through);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_batch_always_takes_at_least_one() {
        let mut q: VecDeque<Bytes> = VecDeque::new();
        q.push_back(Bytes::from(vec![0u8; 1000]));
        q.push_back(Bytes::from(vec![0u8; 10]));
        let batch = drain_batch(&mut q, 5);
        assert_eq!(batch.len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drain_batch_packs_under_budget() {
        let mut q: VecDeque<Bytes> = VecDeque::new();
        for _ in 0..5 {
            q.push_back(Bytes::from(vec![0u8; 10]));
        }
        let batch = drain_batch(&mut q, 25);
        assert_eq!(batch.len(), 2);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn ack_tracker_reaches_quorum() {
        let mut t = AckTracker::new();
        t.start(6, 1);
        assert_eq!(t.count(6), 1);
        assert_eq!(t.record(6, 2), 2);
        assert_eq!(t.record(6, 3), 3);
        t.forget_through(6);
        assert_eq!(t.count(6), 0);
    }
}
