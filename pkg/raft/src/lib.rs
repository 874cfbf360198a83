//! Raft consensus core for a named group of peers talking over a
//! pre-existing publish/subscribe transport.
//!
//! This crate owns the protocol engine only: leader election, log
//! replication, commit-quorum tracking, snapshot install, catchup of
//! lagging followers, dynamic peer membership, and persistence of the
//! (log, term+vote, snapshot) triplet. The write-ahead log, the transport,
//! and the upper-layer state machine are external collaborators expressed
//! here as traits (see [`wal`] and [`transport`]); this crate never speaks
//! to a disk or a socket directly outside of the `tav.idx` / `peers.idx` /
//! `snapshots/` files it owns.

mod checksum;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod node;
pub mod peers;
pub mod persistence;
pub mod transport;
pub mod wal;

mod catchup;
mod election;
mod replication;
mod snapshot;

pub use entry::{AppendEntry, Entry};
pub use error::NodeError;
pub use node::{Node, NodeHandle, Progress, Role};
pub use peers::PeerState;
pub use transport::Transport;
pub use wal::Wal;

/// Id of a single server within a group. Scoped to the group, not globally
/// unique across groups on the same physical server.
pub type PeerId = u64;

/// Raft term number. Monotonically non-decreasing for the lifetime of a node.
pub type Term = u64;

/// Index into the replicated log (and the WAL sequence space it mirrors).
pub type LogIndex = u64;
