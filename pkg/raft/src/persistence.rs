//! The three on-disk artifacts living under `<store>/`, excluding the WAL
//! itself which is owned by the external [`crate::wal::Wal`] collaborator
//! (§4.2).
//!
//! These are small, infrequently-written files; all operations here are
//! synchronous. Callers on the hot path (the driver loop) perform them with
//! the state lock released, matching the "snapshot fields, do I/O outside
//! the lock" rule from §5.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::checksum::ChecksumKey;
use crate::codec::{self, Snapshot};
use crate::error::NodeError;
use crate::peers::PeerState;
use crate::{LogIndex, PeerId, Term};

/// Persisted `(term, vote)` pair. `tav.idx` layout is `term[8] | vote[0..8]`:
/// 8 bytes when no vote has been cast this term, 16 when one has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermVote {
    pub term: Term,
    pub vote: Option<PeerId>,
}

pub struct Store {
    dir: PathBuf,
    checksum_key: ChecksumKey,
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), NodeError> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Store {
    pub fn open(dir: impl Into<PathBuf>, group: &str) -> Result<Self, NodeError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join("snapshots"))?;
        Ok(Store {
            dir,
            checksum_key: ChecksumKey::derive(group),
        })
    }

    fn tav_path(&self) -> PathBuf {
        self.dir.join("tav.idx")
    }

    fn peers_path(&self) -> PathBuf {
        self.dir.join("peers.idx")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    pub fn load_term_vote(&self) -> Result<TermVote, NodeError> {
        let path = self.tav_path();
        if !path.exists() {
            return Ok(TermVote::default());
        }
        let bytes = fs::read(&path)?;
        if bytes.len() != 8 && bytes.len() != 16 {
            return Err(NodeError::CorruptPeers("tav.idx has unexpected length".into()));
        }
        let term = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let vote = if bytes.len() == 16 {
            Some(u64::from_le_bytes(bytes[8..16].try_into().unwrap()))
        } else {
            None
        };
        Ok(TermVote { term, vote })
    }

    pub fn save_term_vote(&self, tv: TermVote) -> Result<(), NodeError> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&tv.term.to_le_bytes());
        if let Some(v) = tv.vote {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        atomic_write(&self.tav_path(), &bytes)
    }

    pub fn load_peer_state(&self) -> Result<Option<PeerState>, NodeError> {
        let path = self.peers_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(codec::decode_peer_state(&bytes)?))
    }

    pub fn save_peer_state(&self, ps: &PeerState) -> Result<(), NodeError> {
        atomic_write(&self.peers_path(), &codec::encode_peer_state(ps))
    }

    fn snapshot_file_name(term: Term, index: LogIndex) -> String {
        format!("snap.{term}.{index}")
    }

    fn parse_snapshot_name(name: &str) -> Option<(Term, LogIndex)> {
        let mut parts = name.split('.');
        if parts.next()? != "snap" {
            return None;
        }
        let term: Term = parts.next()?.parse().ok()?;
        let index: LogIndex = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((term, index))
    }

    /// Enforces invariant 4: at most one snapshot file may exist. Keeps the
    /// one with the highest `(term, index)` and removes the rest. Returns
    /// the surviving file's name, if any.
    pub fn reconcile_snapshots(&self) -> Result<Option<(Term, LogIndex)>, NodeError> {
        let dir = self.snapshots_dir();
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            match Self::parse_snapshot_name(&name) {
                Some(pair) => candidates.push((pair, name)),
                None => {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        candidates.sort_by_key(|(pair, _)| *pair);
        let keep = candidates.pop();
        for (_, name) in candidates {
            let _ = fs::remove_file(dir.join(name));
        }
        Ok(keep.map(|(pair, _)| pair))
    }

    pub fn write_snapshot(&self, snap: &Snapshot) -> Result<(), NodeError> {
        let name = Self::snapshot_file_name(snap.last_term, snap.last_index);
        let path = self.snapshots_dir().join(name);
        let encoded = codec::encode_snapshot(snap, &self.checksum_key);
        atomic_write(&path, &encoded)?;
        self.remove_other_snapshots(snap.last_term, snap.last_index)
    }

    fn remove_other_snapshots(&self, keep_term: Term, keep_index: LogIndex) -> Result<(), NodeError> {
        let dir = self.snapshots_dir();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((term, index)) = Self::parse_snapshot_name(&name) {
                if (term, index) != (keep_term, keep_index) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Loads the current snapshot, if any. On a checksum or I/O failure the
    /// offending file is deleted and `Ok(None)` is returned so the caller
    /// proceeds as if no snapshot existed (§7 propagation policy).
    pub fn load_latest_snapshot(&self) -> Result<Option<Snapshot>, NodeError> {
        let kept = match self.reconcile_snapshots()? {
            Some(pair) => pair,
            None => return Ok(None),
        };
        let name = Self::snapshot_file_name(kept.0, kept.1);
        let path = self.snapshots_dir().join(&name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        match codec::decode_snapshot(&bytes, &self.checksum_key) {
            Ok(s) => Ok(Some(s)),
            Err(_) => {
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    pub fn delete(&self) -> Result<(), NodeError> {
        let _ = fs::remove_file(self.tav_path());
        let _ = fs::remove_file(self.peers_path());
        let _ = fs::remove_dir_all(self.snapshots_dir());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn term_vote_round_trips_with_and_without_vote() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "g").unwrap();
        assert_eq!(store.load_term_vote().unwrap(), TermVote::default());

        store.save_term_vote(TermVote { term: 3, vote: None }).unwrap();
        assert_eq!(store.load_term_vote().unwrap(), TermVote { term: 3, vote: None });

        store.save_term_vote(TermVote { term: 4, vote: Some(7) }).unwrap();
        assert_eq!(store.load_term_vote().unwrap(), TermVote { term: 4, vote: Some(7) });
    }

    #[test]
    fn peer_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "g").unwrap();
        assert_eq!(store.load_peer_state().unwrap(), None);
        let ps = PeerState { cluster_size: 3, peers: vec![1, 2, 3] };
        store.save_peer_state(&ps).unwrap();
        assert_eq!(store.load_peer_state().unwrap(), Some(ps));
    }

    #[test]
    fn only_highest_snapshot_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "g").unwrap();
        let low = Snapshot { last_term: 1, last_index: 5, peer_state: PeerState::single(1), data: Bytes::from_static(b"a") };
        let high = Snapshot { last_term: 2, last_index: 9, peer_state: PeerState::single(1), data: Bytes::from_static(b"b") };
        store.write_snapshot(&low).unwrap();
        store.write_snapshot(&high).unwrap();
        let entries: Vec<_> = fs::read_dir(store.snapshots_dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let loaded = store.load_latest_snapshot().unwrap().unwrap();
        assert_eq!(loaded.last_index, 9);
    }

    #[test]
    fn corrupt_snapshot_is_deleted_and_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "g").unwrap();
        let snap = Snapshot { last_term: 1, last_index: 5, peer_state: PeerState::single(1), data: Bytes::from_static(b"a") };
        store.write_snapshot(&snap).unwrap();
        let path = store.snapshots_dir().join("snap.1.5");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert_eq!(store.load_latest_snapshot().unwrap(), None);
        assert!(!path.exists());
    }
}
