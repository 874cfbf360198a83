//! Leader-driven streaming catchup of a lagging follower (§4.6).
//!
//! The cooperative per-follower task and the follower-side subscription
//! handling live in [`crate::node`] (they need the transport, the WAL, and
//! the shared lock); this module holds the state shapes and the small
//! amount of logic that is pure enough to test without any of that.

use std::time::{Duration, Instant};

use crate::{LogIndex, Term};

/// Whether the follower is far enough behind that the leader must send a
/// snapshot before it can stream individual WAL entries.
pub fn needs_snapshot_first(start: LogIndex, wal_first: LogIndex) -> bool {
    start < wal_first
}

/// Leader-side bookkeeping for one in-flight catchup task.
pub struct LeaderProgress {
    /// Next WAL sequence to send.
    pub next: LogIndex,
    /// Bytes sent but not yet acknowledged; bounded by
    /// `NodeConfig::catchup_outstanding_bytes`.
    pub outstanding: usize,
    pub last_activity: Instant,
}

impl LeaderProgress {
    pub fn new(next: LogIndex) -> Self {
        LeaderProgress {
            next,
            outstanding: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.outstanding += bytes;
        self.last_activity = Instant::now();
    }

    /// Frees the outstanding-byte budget for an acked index and advances
    /// `next` past it.
    pub fn record_ack(&mut self, bytes_for_index: usize, acked_index: LogIndex) {
        self.outstanding = self.outstanding.saturating_sub(bytes_for_index);
        if acked_index >= self.next {
            self.next = acked_index + 1;
        }
        self.last_activity = Instant::now();
    }

    pub fn has_budget(&self, next_chunk_bytes: usize, budget: usize) -> bool {
        self.outstanding + next_chunk_bytes <= budget || self.outstanding == 0
    }

    pub fn is_stalled(&self, stall: Duration) -> bool {
        self.last_activity.elapsed() > stall
    }
}

/// Follower-side record of the AE that triggered catchup, and the
/// temporary `(pterm, pindex)` it is streaming toward.
#[derive(Debug, Clone)]
pub struct FollowerCatchup {
    /// `(term, index)` of the AE that opened this catchup session.
    pub cterm: Term,
    pub cindex: LogIndex,
    pub inbox: String,
    pub last_activity: Instant,
}

impl FollowerCatchup {
    pub fn new(cterm: Term, cindex: LogIndex, inbox: String) -> Self {
        FollowerCatchup {
            cterm,
            cindex,
            inbox,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_stalled(&self, stall: Duration) -> bool {
        self.last_activity.elapsed() > stall
    }

    /// §4.5 step 7: the catchup may be cancelled once the node's own log
    /// has caught up to or past the point that triggered it.
    pub fn satisfied_by(&self, pterm: Term, pindex: LogIndex) -> bool {
        pterm >= self.cterm && pindex >= self.cindex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_needed_when_start_before_wal_first() {
        assert!(needs_snapshot_first(5, 10));
        assert!(!needs_snapshot_first(10, 10));
        assert!(!needs_snapshot_first(11, 10));
    }

    #[test]
    fn leader_progress_ack_frees_budget_and_advances_next() {
        let mut p = LeaderProgress::new(5);
        p.record_sent(1000);
        assert_eq!(p.outstanding, 1000);
        p.record_ack(1000, 5);
        assert_eq!(p.outstanding, 0);
        assert_eq!(p.next, 6);
    }

    #[test]
    fn follower_catchup_satisfied_once_log_passes_trigger_point() {
        let c = FollowerCatchup::new(4, 90, "inbox".into());
        assert!(!c.satisfied_by(4, 89));
        assert!(c.satisfied_by(4, 90));
        assert!(c.satisfied_by(5, 50));
    }
}
