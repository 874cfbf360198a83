//! The log entry sum type and the append-entry record that is the atomic
//! unit written to the WAL.

use bytes::Bytes;

use crate::{LogIndex, PeerId, Term};

/// One tagged log entry. The on-wire single-byte tag (see [`crate::codec`])
/// must stay stable across versions: it is replayed from disk forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Opaque application payload, handed to the FSM untouched.
    Normal(Bytes),

    /// Compatibility alias for `Snapshot`. Older logs may carry this tag;
    /// it is treated identically to `Snapshot` once surfaced upward.
    OldSnapshot(Bytes),

    /// A `peers.idx`-shaped `PeerState` record, replicated through the log
    /// so that followers learn cluster membership changes in log order.
    PeerState(Bytes),

    AddPeer(PeerId),

    RemovePeer(PeerId),

    /// Hint from the leader that `peer` should campaign immediately.
    LeaderTransfer(PeerId),

    /// Encoded `Snapshot` record (see [`crate::codec`]), used only as one
    /// of the two entries of a catchup-install AE; never appears standalone
    /// in steady-state replication.
    Snapshot(Bytes),
}

impl Entry {
    pub fn tag(&self) -> u8 {
        match self {
            Entry::Normal(_) => 0,
            Entry::OldSnapshot(_) => 1,
            Entry::PeerState(_) => 2,
            Entry::AddPeer(_) => 3,
            Entry::RemovePeer(_) => 4,
            Entry::LeaderTransfer(_) => 5,
            Entry::Snapshot(_) => 6,
        }
    }

    /// Whether this entry carries upper-layer or peer-state payload that
    /// should be delivered on the committed-entry stream. Membership and
    /// leader-transfer entries are handled inline by the node and are not
    /// themselves forwarded to the FSM.
    pub fn is_deliverable(&self) -> bool {
        matches!(
            self,
            Entry::Normal(_) | Entry::OldSnapshot(_) | Entry::Snapshot(_)
        )
    }
}

/// The atomic unit the leader writes to its own WAL and broadcasts; this is
/// the record, not the individual `Entry`s it carries.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub leader: PeerId,
    pub term: Term,
    pub commit: LogIndex,
    pub pterm: Term,
    pub pindex: LogIndex,
    pub entries: Vec<Entry>,
}

impl AppendEntry {
    /// An empty AE, used as a heartbeat or as the initial AE a new leader
    /// broadcasts right after winning an election.
    pub fn heartbeat(leader: PeerId, term: Term, commit: LogIndex, pterm: Term, pindex: LogIndex) -> Self {
        AppendEntry {
            leader,
            term,
            commit,
            pterm,
            pindex,
            entries: Vec::new(),
        }
    }
}

/// Leader's record of a follower catching up, or a follower's observation
/// of a request/response pair it issued.
#[derive(Debug, Clone)]
pub struct AppendEntryResponse {
    pub term: Term,
    pub index: LogIndex,
    pub peer: PeerId,
    pub success: bool,
    /// Populated from the transport's reply-to when the follower is
    /// requesting catchup (not part of the wire codec's 25-byte layout;
    /// this is transport-level metadata carried alongside it).
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct VoteRequest {
    pub term: Term,
    pub last_term: Term,
    pub last_index: LogIndex,
    pub candidate: PeerId,
}

#[derive(Debug, Clone, Copy)]
pub struct VoteResponse {
    pub term: Term,
    pub peer: PeerId,
    pub granted: bool,
}
