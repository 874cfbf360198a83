//! Peer membership and liveness tracking (§4.3).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{error::NodeError, LogIndex, PeerId};

/// Cluster-size + member-id snapshot, the thing replicated as a
/// `Entry::PeerState` and persisted to `peers.idx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub cluster_size: u32,
    pub peers: Vec<PeerId>,
}

impl PeerState {
    pub fn single(id: PeerId) -> Self {
        PeerState {
            cluster_size: 1,
            peers: vec![id],
        }
    }

    pub fn quorum(&self) -> usize {
        (self.cluster_size as usize) / 2 + 1
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerRecord {
    ts: Instant,
    last_index: LogIndex,
}

/// `peers: map<peerId, {ts, li}>` from §4.3, plus the derived quorum /
/// liveness queries the election and replication subsystems need.
pub struct PeerTracker {
    self_id: PeerId,
    cluster_size: u32,
    records: HashMap<PeerId, PeerRecord>,
}

impl PeerTracker {
    pub fn new(self_id: PeerId, state: PeerState) -> Self {
        let mut records = HashMap::new();
        for id in &state.peers {
            if *id != self_id {
                records.insert(
                    *id,
                    PeerRecord {
                        ts: Instant::now(),
                        last_index: 0,
                    },
                );
            }
        }
        PeerTracker {
            self_id,
            cluster_size: state.cluster_size.max(1),
            records,
        }
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn quorum_count(&self) -> usize {
        (self.cluster_size as usize) / 2 + 1
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.records.keys().copied().collect();
        ids.push(self.self_id);
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> PeerState {
        PeerState {
            cluster_size: self.cluster_size,
            peers: self.peer_ids(),
        }
    }

    pub fn known(&self, id: PeerId) -> bool {
        id == self.self_id || self.records.contains_key(&id)
    }

    /// Stamps last-contact time for `id`. If we are leader and `id` is
    /// unknown, it is only admitted while `|peers| < cluster_size` -- this
    /// is the guard against silent cluster growth described in §4.3.
    pub fn track_peer(&mut self, id: PeerId, is_leader: bool) -> Result<(), NodeError> {
        if id == self.self_id {
            return Ok(());
        }
        if !self.records.contains_key(&id) {
            if is_leader {
                // +1 to count self, which is not in `records`.
                if self.records.len() + 1 >= self.cluster_size as usize {
                    return Err(NodeError::UnknownPeer(id));
                }
            }
            self.records.insert(
                id,
                PeerRecord {
                    ts: Instant::now(),
                    last_index: 0,
                },
            );
        } else {
            self.records.get_mut(&id).unwrap().ts = Instant::now();
        }
        Ok(())
    }

    pub fn track_response(&mut self, id: PeerId, index: LogIndex) {
        let now = Instant::now();
        let rec = self.records.entry(id).or_insert(PeerRecord { ts: now, last_index: 0 });
        rec.ts = now;
        if index > rec.last_index {
            rec.last_index = index;
        }
    }

    pub fn last_replicated(&self, id: PeerId) -> LogIndex {
        self.records.get(&id).map(|r| r.last_index).unwrap_or(0)
    }

    /// Count of alive peers, self included (pre-initialized to 1 per §4.3
    /// so that a solo leader with zero live followers still "has quorum"
    /// in a single-node cluster).
    pub fn alive_count(&self, liveness_window: Duration) -> usize {
        let now = Instant::now();
        1 + self
            .records
            .values()
            .filter(|r| now.duration_since(r.ts) < liveness_window)
            .count()
    }

    pub fn quorum_present(&self, liveness_window: Duration) -> bool {
        self.alive_count(liveness_window) >= self.quorum_count()
    }

    pub fn add_peer(&mut self, id: PeerId) {
        if id != self.self_id && !self.records.contains_key(&id) {
            self.records.insert(
                id,
                PeerRecord {
                    ts: Instant::now(),
                    last_index: 0,
                },
            );
        }
        self.cluster_size += 1;
    }

    pub fn remove_peer(&mut self, id: PeerId) {
        if id != self.self_id && self.records.remove(&id).is_some() {
            self.cluster_size = self.cluster_size.saturating_sub(1);
        } else if id == self.self_id {
            self.cluster_size = self.cluster_size.saturating_sub(1);
        }
    }

    pub fn restore(&mut self, state: PeerState) {
        self.cluster_size = state.cluster_size.max(1);
        self.records.retain(|id, _| state.peers.contains(id));
        for id in state.peers {
            if id != self.self_id {
                self.records.entry(id).or_insert(PeerRecord {
                    ts: Instant::now(),
                    last_index: 0,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_of_three() {
        let t = PeerTracker::new(1, PeerState { cluster_size: 3, peers: vec![1, 2, 3] });
        assert_eq!(t.quorum_count(), 2);
    }

    #[test]
    fn solo_leader_has_quorum_of_one() {
        let t = PeerTracker::new(1, PeerState::single(1));
        assert!(t.quorum_present(Duration::from_millis(750)));
    }

    #[test]
    fn leader_rejects_growth_past_cluster_size() {
        let mut t = PeerTracker::new(1, PeerState { cluster_size: 2, peers: vec![1, 2] });
        // 2 already tracked; a third, unknown peer must be rejected.
        assert!(t.track_peer(3, true).is_err());
    }

    #[test]
    fn alive_count_excludes_stale_peers() {
        let mut t = PeerTracker::new(1, PeerState { cluster_size: 3, peers: vec![1, 2, 3] });
        t.track_peer(2, false).unwrap();
        // peer 3 never contacted -> not alive under a zero window except self.
        assert_eq!(t.alive_count(Duration::from_nanos(0)), 1);
    }

    #[test]
    fn add_and_remove_peer_adjust_quorum() {
        let mut t = PeerTracker::new(1, PeerState { cluster_size: 3, peers: vec![1, 2, 3] });
        assert_eq!(t.quorum_count(), 2);
        t.add_peer(4);
        assert_eq!(t.quorum_count(), 3);
        t.remove_peer(4);
        assert_eq!(t.quorum_count(), 2);
    }
}
