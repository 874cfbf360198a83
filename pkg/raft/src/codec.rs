//! Fixed-layout little-endian encoders/decoders (§4.1).
//!
//! Every decoder here copies bytes it needs to retain out of the
//! transport-owned buffer it was handed; none of them borrow from `src`
//! past the call, since the transport reclaims that buffer once the
//! subscribe callback returns.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::ChecksumKey;
use crate::entry::{AppendEntry, AppendEntryResponse, Entry, VoteRequest, VoteResponse};
use crate::error::NodeError;
use crate::peers::PeerState;
use crate::{LogIndex, PeerId, Term};

fn entry_tag_to_kind(tag: u8) -> Result<fn(Bytes) -> Entry, NodeError> {
    match tag {
        0 => Ok(Entry::Normal),
        1 => Ok(Entry::OldSnapshot),
        2 => Ok(Entry::PeerState),
        6 => Ok(Entry::Snapshot),
        _ => Err(NodeError::Wal(format!("unknown entry tag {tag}"))),
    }
}

fn encode_entry(buf: &mut BytesMut, entry: &Entry) {
    // entryLen covers the tag byte plus the data that follows it.
    match entry {
        Entry::Normal(d) | Entry::OldSnapshot(d) | Entry::PeerState(d) | Entry::Snapshot(d) => {
            buf.put_u32_le((1 + d.len()) as u32);
            buf.put_u8(entry.tag());
            buf.put_slice(d);
        }
        Entry::AddPeer(id) | Entry::RemovePeer(id) | Entry::LeaderTransfer(id) => {
            buf.put_u32_le((1 + 8) as u32);
            buf.put_u8(entry.tag());
            buf.put_u64_le(*id);
        }
    }
}

fn decode_entry(src: &mut Bytes) -> Result<Entry, NodeError> {
    if src.remaining() < 4 {
        return Err(NodeError::Wal("truncated entry length".into()));
    }
    let len = src.get_u32_le() as usize;
    if len == 0 || src.remaining() < len {
        return Err(NodeError::Wal("truncated entry body".into()));
    }
    let tag = src.get_u8();
    let data_len = len - 1;
    match tag {
        3 | 4 | 5 => {
            if data_len != 8 {
                return Err(NodeError::Wal("malformed peer-id entry".into()));
            }
            let id = src.get_u64_le();
            Ok(match tag {
                3 => Entry::AddPeer(id),
                4 => Entry::RemovePeer(id),
                _ => Entry::LeaderTransfer(id),
            })
        }
        _ => {
            let make = entry_tag_to_kind(tag)?;
            let mut data = vec![0u8; data_len];
            src.copy_to_slice(&mut data);
            Ok(make(Bytes::from(data)))
        }
    }
}

pub fn encode_append_entry(ae: &AppendEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(40 + ae.entries.len() * 16);
    buf.put_u64_le(ae.leader);
    buf.put_u64_le(ae.term);
    buf.put_u64_le(ae.commit);
    buf.put_u64_le(ae.pterm);
    buf.put_u64_le(ae.pindex);
    buf.put_u16_le(ae.entries.len() as u16);
    for e in &ae.entries {
        encode_entry(&mut buf, e);
    }
    buf.freeze()
}

pub fn decode_append_entry(src: &[u8]) -> Result<AppendEntry, NodeError> {
    let mut src = Bytes::copy_from_slice(src);
    if src.remaining() < 40 + 2 {
        return Err(NodeError::Wal("truncated append-entry header".into()));
    }
    let leader = src.get_u64_le();
    let term = src.get_u64_le();
    let commit = src.get_u64_le();
    let pterm = src.get_u64_le();
    let pindex = src.get_u64_le();
    let n = src.get_u16_le();
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        entries.push(decode_entry(&mut src)?);
    }
    Ok(AppendEntry {
        leader,
        term,
        commit,
        pterm,
        pindex,
        entries,
    })
}

pub fn encode_ae_response(r: &AppendEntryResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(25);
    buf.put_u64_le(r.term);
    buf.put_u64_le(r.index);
    buf.put_u64_le(r.peer);
    buf.put_u8(r.success as u8);
    buf.freeze()
}

/// `reply` is not part of the 25-byte wire layout; it is threaded in
/// separately from the transport's reply-to subject at receive time.
pub fn decode_ae_response(src: &[u8], reply: Option<String>) -> Result<AppendEntryResponse, NodeError> {
    if src.len() != 25 {
        return Err(NodeError::Wal("malformed append-entry-response".into()));
    }
    let mut src = Bytes::copy_from_slice(src);
    Ok(AppendEntryResponse {
        term: src.get_u64_le(),
        index: src.get_u64_le(),
        peer: src.get_u64_le(),
        success: src.get_u8() != 0,
        reply,
    })
}

pub fn encode_vote_request(r: &VoteRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_u64_le(r.term);
    buf.put_u64_le(r.last_term);
    buf.put_u64_le(r.last_index);
    buf.put_u64_le(r.candidate);
    buf.freeze()
}

pub fn decode_vote_request(src: &[u8]) -> Result<VoteRequest, NodeError> {
    if src.len() != 32 {
        return Err(NodeError::Wal("malformed vote-request".into()));
    }
    let mut src = Bytes::copy_from_slice(src);
    Ok(VoteRequest {
        term: src.get_u64_le(),
        last_term: src.get_u64_le(),
        last_index: src.get_u64_le(),
        candidate: src.get_u64_le(),
    })
}

pub fn encode_vote_response(r: &VoteResponse) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u64_le(r.term);
    buf.put_u64_le(r.peer);
    buf.put_u8(r.granted as u8);
    buf.freeze()
}

pub fn decode_vote_response(src: &[u8]) -> Result<VoteResponse, NodeError> {
    if src.len() != 17 {
        return Err(NodeError::Wal("malformed vote-response".into()));
    }
    let mut src = Bytes::copy_from_slice(src);
    Ok(VoteResponse {
        term: src.get_u64_le(),
        peer: src.get_u64_le(),
        granted: src.get_u8() != 0,
    })
}

pub fn encode_peer_state(ps: &PeerState) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + ps.peers.len() * 8);
    buf.put_u32_le(ps.cluster_size);
    buf.put_u32_le(ps.peers.len() as u32);
    for id in &ps.peers {
        buf.put_u64_le(*id);
    }
    buf.freeze()
}

pub fn decode_peer_state(src: &[u8]) -> Result<PeerState, NodeError> {
    let mut src = Bytes::copy_from_slice(src);
    if src.remaining() < 8 {
        return Err(NodeError::CorruptPeers("truncated header".into()));
    }
    let cluster_size = src.get_u32_le();
    let n = src.get_u32_le() as usize;
    if src.remaining() != n * 8 {
        return Err(NodeError::CorruptPeers("peer count mismatch".into()));
    }
    let mut peers = Vec::with_capacity(n);
    for _ in 0..n {
        peers.push(src.get_u64_le());
    }
    Ok(PeerState { cluster_size, peers })
}

/// A point-in-time snapshot: the log prefix's closing term/index, the peer
/// state at that point, and the opaque upper-layer FSM data.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub last_term: Term,
    pub last_index: LogIndex,
    pub peer_state: PeerState,
    pub data: Bytes,
}

pub fn encode_snapshot(snap: &Snapshot, key: &ChecksumKey) -> Bytes {
    let peer_state = encode_peer_state(&snap.peer_state);
    let mut buf = BytesMut::with_capacity(20 + peer_state.len() + snap.data.len() + 8);
    buf.put_u64_le(snap.last_term);
    buf.put_u64_le(snap.last_index);
    buf.put_u32_le(peer_state.len() as u32);
    buf.put_slice(&peer_state);
    buf.put_slice(&snap.data);
    let checksum = key.checksum(&buf);
    buf.put_u64_le(checksum);
    buf.freeze()
}

pub fn decode_snapshot(src: &[u8], key: &ChecksumKey) -> Result<Snapshot, NodeError> {
    if src.len() < 28 {
        return Err(NodeError::SnapshotCorrupt);
    }
    let (body, checksum_bytes) = src.split_at(src.len() - 8);
    let want = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
    let got = key.checksum(body);
    if want != got {
        return Err(NodeError::SnapshotCorrupt);
    }

    let mut cur = Bytes::copy_from_slice(body);
    let last_term = cur.get_u64_le();
    let last_index = cur.get_u64_le();
    let ps_len = cur.get_u32_le() as usize;
    if cur.remaining() < ps_len {
        return Err(NodeError::SnapshotCorrupt);
    }
    let ps_bytes = cur.copy_to_bytes(ps_len);
    let peer_state = decode_peer_state(&ps_bytes).map_err(|_| NodeError::SnapshotCorrupt)?;
    let data = cur.copy_to_bytes(cur.remaining());
    Ok(Snapshot {
        last_term,
        last_index,
        peer_state,
        data,
    })
}

/// Convenience for building an `AddPeer`/`RemovePeer`/`LeaderTransfer`
/// entry's opaque-bytes form, used by tests that want to round-trip entries
/// without going through a full `AppendEntry`.
pub fn peer_id_entry_bytes(id: PeerId) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(id);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_ae() -> AppendEntry {
        AppendEntry {
            leader: 1,
            term: 4,
            commit: 10,
            pterm: 4,
            pindex: 11,
            entries: vec![
                Entry::Normal(Bytes::from_static(b"hello")),
                Entry::AddPeer(42),
                Entry::PeerState(Bytes::from_static(b"abc")),
            ],
        }
    }

    #[test]
    fn append_entry_round_trips() {
        let ae = sample_ae();
        let encoded = encode_append_entry(&ae);
        let decoded = decode_append_entry(&encoded).unwrap();
        assert_eq!(decoded.leader, ae.leader);
        assert_eq!(decoded.term, ae.term);
        assert_eq!(decoded.pindex, ae.pindex);
        assert_eq!(decoded.entries, ae.entries);
    }

    #[test]
    fn ae_response_round_trips() {
        let r = AppendEntryResponse {
            term: 7,
            index: 99,
            peer: 3,
            success: true,
            reply: None,
        };
        let encoded = encode_ae_response(&r);
        assert_eq!(encoded.len(), 25);
        let decoded = decode_ae_response(&encoded, Some("$NRG.R.abc".into())).unwrap();
        assert_eq!(decoded.term, r.term);
        assert_eq!(decoded.index, r.index);
        assert_eq!(decoded.peer, r.peer);
        assert_eq!(decoded.success, r.success);
        assert_eq!(decoded.reply.as_deref(), Some("$NRG.R.abc"));
    }

    #[test]
    fn vote_request_round_trips() {
        let r = VoteRequest {
            term: 6,
            last_term: 5,
            last_index: 9,
            candidate: 2,
        };
        let encoded = encode_vote_request(&r);
        assert_eq!(encoded.len(), 32);
        let decoded = decode_vote_request(&encoded).unwrap();
        assert_eq!(decoded.term, r.term);
        assert_eq!(decoded.candidate, r.candidate);
    }

    #[test]
    fn vote_response_round_trips() {
        let r = VoteResponse { term: 6, peer: 2, granted: true };
        let encoded = encode_vote_response(&r);
        assert_eq!(encoded.len(), 17);
        let decoded = decode_vote_response(&encoded).unwrap();
        assert_eq!(decoded.term, r.term);
        assert_eq!(decoded.granted, r.granted);
    }

    #[test]
    fn peer_state_round_trips() {
        let ps = PeerState { cluster_size: 3, peers: vec![1, 2, 3] };
        let encoded = encode_peer_state(&ps);
        let decoded = decode_peer_state(&encoded).unwrap();
        assert_eq!(decoded, ps);
    }

    #[test]
    fn snapshot_round_trips_and_verifies_checksum() {
        let key = ChecksumKey::derive("group-1");
        let snap = Snapshot {
            last_term: 3,
            last_index: 90,
            peer_state: PeerState { cluster_size: 3, peers: vec![1, 2, 3] },
            data: Bytes::from_static(b"fsm-bytes"),
        };
        let encoded = encode_snapshot(&snap, &key);
        let decoded = decode_snapshot(&encoded, &key).unwrap();
        assert_eq!(decoded.last_term, snap.last_term);
        assert_eq!(decoded.last_index, snap.last_index);
        assert_eq!(decoded.peer_state, snap.peer_state);
        assert_eq!(decoded.data, snap.data);
    }

    #[test]
    fn snapshot_checksum_mismatch_is_detected() {
        let key = ChecksumKey::derive("group-1");
        let snap = Snapshot {
            last_term: 3,
            last_index: 90,
            peer_state: PeerState::single(1),
            data: Bytes::from_static(b"fsm-bytes"),
        };
        let mut encoded = encode_snapshot(&snap, &key).to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(decode_snapshot(&encoded, &key), Err(NodeError::SnapshotCorrupt)));
    }

    proptest::proptest! {
        #[test]
        fn append_entry_round_trips_for_arbitrary_normal_payloads(
            leader in any::<u64>(),
            term in any::<u64>(),
            commit in any::<u64>(),
            pterm in any::<u64>(),
            pindex in any::<u64>(),
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8),
        ) {
            let ae = AppendEntry {
                leader,
                term,
                commit,
                pterm,
                pindex,
                entries: payloads.into_iter().map(|p| Entry::Normal(Bytes::from(p))).collect(),
            };
            let encoded = encode_append_entry(&ae);
            let decoded = decode_append_entry(&encoded).unwrap();
            prop_assert_eq!(decoded.leader, ae.leader);
            prop_assert_eq!(decoded.term, ae.term);
            prop_assert_eq!(decoded.commit, ae.commit);
            prop_assert_eq!(decoded.pterm, ae.pterm);
            prop_assert_eq!(decoded.pindex, ae.pindex);
            prop_assert_eq!(decoded.entries, ae.entries);
        }

        #[test]
        fn peer_state_round_trips_for_arbitrary_membership(
            cluster_size in any::<u32>(),
            peers in proptest::collection::vec(any::<u64>(), 0..16),
        ) {
            let ps = PeerState { cluster_size, peers };
            let encoded = encode_peer_state(&ps);
            let decoded = decode_peer_state(&encoded).unwrap();
            prop_assert_eq!(decoded, ps);
        }
    }
}
