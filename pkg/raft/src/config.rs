//! Tunable timing and sizing constants.
//!
//! Pulled out of the teacher's habit of burying these as bare `const`s in
//! `consensus.rs` so that tests can shrink them to make timer-driven
//! behavior (election, heartbeat, catchup stall) observable on a
//! millisecond clock instead of a multi-second one.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Randomized election timeout range. Reset on startup, on any valid AE
    /// from the current leader, on any processed VoteRequest, and on any
    /// state change.
    pub election_timeout: (Duration, Duration),

    /// Leader heartbeat cadence; an empty AE is broadcast if nothing else
    /// was sent within this window.
    pub heartbeat_interval: Duration,

    /// Shorter randomized backoff used for orderly, upper-layer-requested
    /// campaigns (leader transfer, explicit `Campaign`).
    pub campaign_backoff: (Duration, Duration),

    /// A peer is alive if `now - last_contact < peer_liveness * hbInterval`.
    /// Also used as `lostQuorumInterval`.
    pub peer_liveness_multiple: u32,

    /// Byte budget for a single leader-side proposal batch.
    pub propose_batch_bytes: usize,

    /// Byte budget of outstanding, unacknowledged catchup bytes per peer.
    pub catchup_outstanding_bytes: usize,

    /// A catchup stalls if this much time passes with no forward progress.
    pub catchup_stall: Duration,

    /// Cooperative catchup loop step-check interval.
    pub catchup_step: Duration,

    /// Mailbox capacities.
    pub vote_request_mailbox: usize,
    pub vote_response_mailbox: usize,
    pub propose_mailbox: usize,
    pub apply_mailbox: usize,
    pub lead_change_mailbox: usize,
    pub stepdown_mailbox: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            election_timeout: (Duration::from_millis(1500), Duration::from_millis(4500)),
            heartbeat_interval: Duration::from_millis(250),
            campaign_backoff: (Duration::from_millis(50), Duration::from_millis(200)),
            peer_liveness_multiple: 3,
            propose_batch_bytes: 256 * 1024,
            catchup_outstanding_bytes: 2 * 1024 * 1024,
            catchup_stall: Duration::from_secs(2),
            catchup_step: Duration::from_millis(100),
            vote_request_mailbox: 8,
            vote_response_mailbox: 32,
            propose_mailbox: 256,
            apply_mailbox: 512,
            lead_change_mailbox: 8,
            stepdown_mailbox: 8,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn lost_quorum_interval(&self) -> Duration {
        self.heartbeat_interval * self.peer_liveness_multiple
    }
}
