//! Upper-layer-driven snapshot install and follower-side snapshot apply
//! (§4.7). Note that in this design a WAL sequence number corresponds to a
//! whole `AppendEntry` batch record, not to an individual `Entry` -- §1
//! calls the AE "the atomic unit written to the WAL", so `applied`/`commit`
//! /`pindex` are all WAL-sequence-granular.

use bytes::Bytes;

use crate::checksum::ChecksumKey;
use crate::codec::{self, Snapshot};
use crate::error::NodeError;
use crate::peers::PeerState;
use crate::persistence::Store;
use crate::wal::Wal;
use crate::{LogIndex, Term};

/// Leader/single-node install flow, steps 1-5 of §4.7. Returns the index
/// the new snapshot now covers, or `None` if this was a no-op because the
/// WAL was already compacted up to `applied`.
pub async fn install(
    wal: &dyn Wal,
    store: &Store,
    applied: LogIndex,
    current_term: Term,
    peer_state: PeerState,
    data: Bytes,
) -> Result<Option<LogIndex>, NodeError> {
    let wal_state = wal.state().await;
    if wal_state.first == applied {
        return Ok(None);
    }

    let last_term = match wal.load(applied).await {
        Ok(bytes) => codec::decode_append_entry(&bytes)
            .map(|ae| ae.term)
            .unwrap_or(current_term),
        Err(_) => current_term,
    };

    let snap = Snapshot {
        last_term,
        last_index: applied,
        peer_state,
        data,
    };
    store.write_snapshot(&snap)?;
    wal.compact(applied).await?;
    Ok(Some(applied))
}

/// Follower-side install triggered by receiving a catchup AE whose entries
/// are exactly `[Snapshot, PeerState]` (§4.5 step 10).
pub fn decode_installed_snapshot(bytes: &Bytes, key: &ChecksumKey) -> Result<Snapshot, NodeError> {
    codec::decode_snapshot(bytes, key)
}

pub async fn apply_installed_snapshot(
    wal: &dyn Wal,
    store: &Store,
    snap: &Snapshot,
) -> Result<(), NodeError> {
    store.write_snapshot(snap)?;
    wal.compact(snap.last_index).await?;
    Ok(())
}
