//! The write-ahead log is an external collaborator (§6): an append-only,
//! numbered message store. This module only declares the trait; the
//! concrete disk-backed implementation lives outside this crate.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NodeError;
use crate::LogIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalState {
    pub first: LogIndex,
    pub last: LogIndex,
    pub count: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait Wal: Send + Sync {
    /// Appends `payload` as the next sequence and returns the assigned
    /// sequence number. The node asserts this equals `pindex + 1`.
    async fn append(&self, payload: Bytes) -> Result<LogIndex, NodeError>;

    async fn load(&self, seq: LogIndex) -> Result<Bytes, NodeError>;

    /// Removes a single record (used when unwinding a failed append).
    async fn remove(&self, seq: LogIndex) -> Result<bool, NodeError>;

    /// Drops the prefix through `seq` (inclusive). Returns the new first
    /// sequence number.
    async fn compact(&self, seq: LogIndex) -> Result<LogIndex, NodeError>;

    /// Drops the suffix after `seq`, retaining `[first..seq]`.
    async fn truncate(&self, seq: LogIndex) -> Result<(), NodeError>;

    async fn state(&self) -> WalState;

    async fn stop(&self);

    async fn delete(&self);
}
