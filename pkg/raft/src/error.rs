//! Error kinds surfaced across the public API.
//!
//! The teacher crate used `error_chain!` for this; `thiserror` is the
//! idiomatic replacement and is what the rest of the corpus reaches for.

use crate::{LogIndex, PeerId, Term};

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("not leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<PeerId> },

    #[error("propose mailbox full")]
    ProposalFailed,

    #[error("node is closed")]
    NodeClosed,

    #[error("peer {0} is not a known member and cluster is already at capacity")]
    UnknownPeer(PeerId),

    #[error("peers.idx is corrupt: {0}")]
    CorruptPeers(String),

    #[error("step down failed: {0}")]
    StepdownFailed(String),

    #[error("step down requested but no eligible peer to hand off to")]
    StepdownNoPeer,

    #[error("at most one preferred successor may be given to step down")]
    TooManyPrefs,

    #[error("bad snapshot file name: {0}")]
    BadSnapName(String),

    #[error("no snapshot available")]
    NoSnapAvailable,

    #[error("snapshot failed checksum verification")]
    SnapshotCorrupt,

    #[error("failed to load log entry at index {0}")]
    EntryLoadFailed(LogIndex),

    #[error("failed to apply committed entry at index {0}")]
    FailedToApply(LogIndex),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("wal error: {0}")]
    Wal(String),
}

/// A WAL sequence-number mismatch against `pindex + 1` is a programmer bug,
/// not a recoverable condition: the WAL is single-writer and owned
/// exclusively by this node, so observing a gap or collision means the
/// in-memory mirror of its tail has desynchronized from disk.
pub fn assert_wal_sequence(expected: LogIndex, actual: LogIndex, term: Term) -> Result<(), NodeError> {
    if expected != actual {
        tracing::error!(
            expected,
            actual,
            term,
            "WAL sequence invariant violated: pindex + 1 != assigned sequence"
        );
        panic!(
            "raft: WAL sequence invariant violated (expected {}, got {})",
            expected, actual
        );
    }
    Ok(())
}
