//! The driver / state machine (§4.8) and the public API surface (§6).
//!
//! A single reader-writer lock guards [`State`]; handlers take the lock for
//! a short critical section, copy out whatever they need to perform I/O
//! (WAL append, file write, transport publish), release it, do the I/O,
//! then re-acquire to apply the result. This is the "guarded mutable
//! record with short critical sections" design from §9 rather than a
//! pure message-only actor; the observable contract is the same either way.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::catchup::{needs_snapshot_first, FollowerCatchup, LeaderProgress};
use crate::checksum::ChecksumKey;
use crate::codec;
use crate::config::NodeConfig;
use crate::election::{evaluate_vote_request, random_campaign_backoff, random_election_timeout};
use crate::entry::{AppendEntry, AppendEntryResponse, Entry, VoteRequest, VoteResponse};
use crate::error::NodeError;
use crate::peers::{PeerState, PeerTracker};
use crate::persistence::{Store, TermVote};
use crate::replication::{drain_batch, AckTracker};
use crate::snapshot;
use crate::transport::{self, MessageHandler, Subscription, Transport};
use crate::wal::Wal;
use crate::{LogIndex, PeerId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    /// Reserved; currently behaves identically to `Follower` (§9).
    Observer,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Index that would be written next by the leader (`pindex + 1`).
    pub next_index: LogIndex,
    pub commit: LogIndex,
    pub applied: LogIndex,
}

/// One committed record delivered to the upper-layer FSM. `index` doubles
/// as the WAL sequence number the whole batch was written at (§1: the AE,
/// not the individual `Entry`, is the unit the WAL stores).
#[derive(Debug, Clone)]
pub struct Committed {
    pub index: LogIndex,
    pub term: Term,
    pub entries: Vec<Entry>,
}

/// Sentinel delivered once, right after WAL replay finishes at startup.
pub fn end_of_replay_marker() -> Committed {
    Committed { index: 0, term: 0, entries: Vec::new() }
}

pub fn is_end_of_replay(c: &Committed) -> bool {
    c.index == 0 && c.term == 0 && c.entries.is_empty()
}

enum Proposal {
    Normal(Bytes, tokio::sync::oneshot::Sender<Result<LogIndex, NodeError>>),
    AddPeer(PeerId, tokio::sync::oneshot::Sender<Result<LogIndex, NodeError>>),
    RemovePeer(PeerId, tokio::sync::oneshot::Sender<Result<LogIndex, NodeError>>),
}

struct LeaderState {
    acks: AckTracker,
    progress: HashMap<PeerId, LeaderProgress>,
    catchup_acks: HashMap<PeerId, mpsc::Sender<LogIndex>>,
    last_broadcast: Instant,
    pending: VecDeque<(LogIndex, Bytes, Term)>,
}

impl LeaderState {
    fn new() -> Self {
        LeaderState {
            acks: AckTracker::new(),
            progress: HashMap::new(),
            catchup_acks: HashMap::new(),
            last_broadcast: Instant::now(),
            pending: VecDeque::new(),
        }
    }
}

struct CandidateState {
    votes_received: HashSet<PeerId>,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct MembershipEffect {
    peers_changed: bool,
    transfer_to_me: bool,
}

struct State {
    role: Role,
    term: Term,
    vote: Option<PeerId>,
    leader: Option<PeerId>,
    pterm: Term,
    pindex: LogIndex,
    commit: LogIndex,
    applied: LogIndex,
    hcommit: Option<LogIndex>,
    apply_paused: bool,
    peers: PeerTracker,
    election_deadline: Instant,
    candidate: Option<CandidateState>,
    leader_state: Option<LeaderState>,
    follower_catchup: Option<FollowerCatchup>,
    pending_normal: VecDeque<Bytes>,
    ae_subject: String,
}

pub struct Shared {
    id: PeerId,
    group: String,
    config: NodeConfig,
    wal: Arc<dyn Wal>,
    transport: Arc<dyn Transport>,
    store: Store,
    checksum_key: ChecksumKey,
    state: RwLock<State>,

    propose_tx: mpsc::Sender<Proposal>,
    propose_rx: AsyncMutex<Option<mpsc::Receiver<Proposal>>>,

    vote_req_tx: mpsc::Sender<(VoteRequest, Option<String>)>,
    vote_req_rx: AsyncMutex<Option<mpsc::Receiver<(VoteRequest, Option<String>)>>>,

    vote_resp_tx: mpsc::Sender<VoteResponse>,
    vote_resp_rx: AsyncMutex<Option<mpsc::Receiver<VoteResponse>>>,

    ae_tx: mpsc::Sender<(String, AppendEntry, Option<String>)>,
    ae_rx: AsyncMutex<Option<mpsc::Receiver<(String, AppendEntry, Option<String>)>>>,

    ae_resp_tx: mpsc::Sender<AppendEntryResponse>,
    ae_resp_rx: AsyncMutex<Option<mpsc::Receiver<AppendEntryResponse>>>,

    stepdown_tx: mpsc::Sender<Vec<PeerId>>,
    stepdown_rx: AsyncMutex<Option<mpsc::Receiver<Vec<PeerId>>>>,

    campaign_tx: mpsc::Sender<()>,
    campaign_rx: AsyncMutex<Option<mpsc::Receiver<()>>>,

    apply_tx: mpsc::Sender<Committed>,
    lead_change_tx: watch::Sender<bool>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,

    /// Persistent inbox every node subscribes to at startup, regardless of
    /// role; only meaningful while leader, since that's the only time
    /// anyone is publishing AEs with this as the reply-to. Followers
    /// advertise this subject back to a candidate/leader by simply
    /// publishing their response there, setting their own reply-to to a
    /// fresh catchup inbox when they need one opened.
    resp_subject: String,

    subs: parking_lot::Mutex<Vec<Box<dyn Subscription>>>,
}

/// Cheap, cloneable handle to a running node. The driver task holds the
/// only copy of authoritative mutable state; every method here talks to it
/// through the shared lock and mailboxes.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

/// Same type as [`Node`]; kept as a separate name because the external
/// interface (§6) talks about "the node" being constructed once and then
/// handed out to many callers as a handle.
pub type NodeHandle = Node;

pub struct InitialState {
    pub id: PeerId,
    pub group: String,
    pub store_dir: std::path::PathBuf,
    pub wal: Arc<dyn Wal>,
    pub transport: Arc<dyn Transport>,
    pub config: NodeConfig,
    /// Used only when no `peers.idx` exists yet, i.e. bootstrapping a new
    /// single-node cluster.
    pub bootstrap_peers: Option<PeerState>,
}

impl Node {
    /// Constructs a node: reads `peers.idx`, `tav.idx`, the latest
    /// snapshot, replays the WAL through the normal AE handler, emits the
    /// end-of-replay sentinel, then returns the handle plus the three
    /// read-only streams (§1 Lifecycle).
    pub async fn spawn(
        init: InitialState,
    ) -> Result<(Node, mpsc::Receiver<Committed>, watch::Receiver<bool>, watch::Receiver<bool>), NodeError> {
        let store = Store::open(init.store_dir, &init.group)?;
        let checksum_key = ChecksumKey::derive(&init.group);

        store.reconcile_snapshots()?;
        let snap = store.load_latest_snapshot()?;

        let tv = store.load_term_vote()?;
        let mut peer_state = store
            .load_peer_state()?
            .or_else(|| snap.as_ref().map(|s| s.peer_state.clone()))
            .or(init.bootstrap_peers)
            .unwrap_or_else(|| PeerState::single(init.id));
        if !peer_state.peers.contains(&init.id) {
            peer_state.peers.push(init.id);
        }

        let (pterm, pindex) = match &snap {
            Some(s) => (s.last_term, s.last_index),
            None => (0, 0),
        };
        let commit = snap.as_ref().map(|s| s.last_index).unwrap_or(0);

        let (propose_tx, propose_rx) = mpsc::channel(init.config.propose_mailbox);
        let (vote_req_tx, vote_req_rx) = mpsc::channel(init.config.vote_request_mailbox);
        let (vote_resp_tx, vote_resp_rx) = mpsc::channel(init.config.vote_response_mailbox);
        let (ae_tx, ae_rx) = mpsc::channel(init.config.propose_mailbox);
        let (ae_resp_tx, ae_resp_rx) = mpsc::channel(init.config.vote_response_mailbox);
        let (stepdown_tx, stepdown_rx) = mpsc::channel(init.config.stepdown_mailbox);
        let (campaign_tx, campaign_rx) = mpsc::channel(1);
        let (apply_tx, apply_rx) = mpsc::channel(init.config.apply_mailbox);
        let (lead_change_tx, lead_change_rx) = watch::channel(false);
        let (quit_tx, quit_rx) = watch::channel(false);

        let ae_subject = transport::subject_append_entries(&init.group);
        let resp_subject = transport::new_reply_inbox(&*init.transport);

        let state = State {
            role: Role::Follower,
            term: tv.term,
            vote: tv.vote,
            leader: None,
            pterm,
            pindex,
            commit,
            applied: 0,
            hcommit: None,
            apply_paused: false,
            peers: PeerTracker::new(init.id, peer_state),
            election_deadline: Instant::now() + random_election_timeout(&init.config),
            candidate: None,
            leader_state: None,
            follower_catchup: None,
            pending_normal: VecDeque::new(),
            ae_subject: ae_subject.clone(),
        };

        let shared = Arc::new(Shared {
            id: init.id,
            group: init.group,
            config: init.config,
            wal: init.wal,
            transport: init.transport,
            store,
            checksum_key,
            state: RwLock::new(state),
            propose_tx,
            propose_rx: AsyncMutex::new(Some(propose_rx)),
            vote_req_tx,
            vote_req_rx: AsyncMutex::new(Some(vote_req_rx)),
            vote_resp_tx,
            vote_resp_rx: AsyncMutex::new(Some(vote_resp_rx)),
            ae_tx,
            ae_rx: AsyncMutex::new(Some(ae_rx)),
            ae_resp_tx,
            ae_resp_rx: AsyncMutex::new(Some(ae_resp_rx)),
            stepdown_tx,
            stepdown_rx: AsyncMutex::new(Some(stepdown_rx)),
            campaign_tx,
            campaign_rx: AsyncMutex::new(Some(campaign_rx)),
            apply_tx,
            lead_change_tx,
            quit_tx,
            quit_rx,
            resp_subject,
            subs: parking_lot::Mutex::new(Vec::new()),
        });

        // Replay the WAL directly into in-memory state (pterm/pindex/commit,
        // membership) without going back through the network-AE path, since
        // that path re-persists every entry it handles and would double the
        // WAL on every restart.
        let replay_commit_floor = commit;
        let wal_state = shared.wal.state().await;
        let mut seq = wal_state.first.max(pindex + 1).min(wal_state.last + 1);
        while seq <= wal_state.last {
            match shared.wal.load(seq).await {
                Ok(bytes) => match codec::decode_append_entry(&bytes) {
                    Ok(ae) => {
                        let (effect, snapshot) = {
                            let mut st = shared.state.write();
                            st.pterm = ae.term;
                            st.pindex = seq;
                            if ae.commit > st.commit {
                                st.commit = ae.commit;
                            }
                            let effect = shared.apply_inline_membership(&mut st, &ae.entries);
                            (effect, st.peers.snapshot())
                        };
                        shared.persist_peer_state_if_changed(&effect, snapshot);
                    }
                    Err(e) => {
                        tracing::warn!(seq, error = %e, "WAL replay decode failed; treating as truncation point");
                        break;
                    }
                },
                Err(e) => {
                    // §9 open question: the source panics here and
                    // dereferences `ae` first. We instead treat any load
                    // failure during replay as a truncation point.
                    tracing::warn!(seq, error = %e, "WAL replay load failed; treating as truncation point");
                    break;
                }
            }
            seq += 1;
        }
        let final_commit = shared.state.read().commit;
        if final_commit > replay_commit_floor {
            shared.deliver_commits_range(replay_commit_floor + 1, final_commit).await;
        }

        let _ = shared.apply_tx.send(end_of_replay_marker()).await;

        shared.subscribe_follower().await?;

        let node = Node { shared: shared.clone() };
        tokio::spawn(shared.run());

        Ok((node, apply_rx, lead_change_rx, quit_rx))
    }

    // ---- public API (§6) ----

    pub async fn propose(&self, data: Bytes) -> Result<LogIndex, NodeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared
            .propose_tx
            .try_send(Proposal::Normal(data, tx))
            .map_err(|_| NodeError::ProposalFailed)?;
        rx.await.map_err(|_| NodeError::NodeClosed)?
    }

    /// Republishes `data` to the group's forwarding subject so whichever
    /// instance currently holds leadership can propose it.
    pub async fn forward_proposal(&self, data: Bytes) -> Result<(), NodeError> {
        let subject = transport::subject_propose(&self.shared.group);
        self.shared.transport.publish(&subject, None, data).await
    }

    /// Republishes a remove-peer request to the group's dedicated
    /// remove-peer forwarding subject (§6) so whichever instance currently
    /// holds leadership can propose it.
    pub async fn forward_remove_peer_proposal(&self, id: PeerId) -> Result<(), NodeError> {
        let subject = transport::subject_remove_peer_propose(&self.shared.group);
        self.shared
            .transport
            .publish(&subject, None, Bytes::copy_from_slice(&id.to_le_bytes()))
            .await
    }

    pub async fn propose_add_peer(&self, id: PeerId) -> Result<LogIndex, NodeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared
            .propose_tx
            .try_send(Proposal::AddPeer(id, tx))
            .map_err(|_| NodeError::ProposalFailed)?;
        rx.await.map_err(|_| NodeError::NodeClosed)?
    }

    pub async fn propose_remove_peer(&self, id: PeerId) -> Result<LogIndex, NodeError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared
            .propose_tx
            .try_send(Proposal::RemovePeer(id, tx))
            .map_err(|_| NodeError::ProposalFailed)?;
        rx.await.map_err(|_| NodeError::NodeClosed)?
    }

    /// Upper-layer-driven snapshot install (§4.7).
    pub async fn install_snapshot(&self, data: Bytes) -> Result<(), NodeError> {
        let (applied, term, peer_state) = {
            let st = self.shared.state.read();
            (st.applied, st.term, st.peers.snapshot())
        };
        snapshot::install(&*self.shared.wal, &self.shared.store, applied, term, peer_state, data).await?;
        Ok(())
    }

    /// Pushes the currently-installed snapshot to every known peer
    /// directly, bypassing the normal lagging-follower detection. Useful
    /// when re-seeding a follower that is known to be far behind without
    /// waiting for it to first report failure.
    pub async fn send_snapshot(&self, data: Bytes) -> Result<(), NodeError> {
        self.install_snapshot(data).await?;
        let (peer_ids, leader_id, term) = {
            let st = self.shared.state.read();
            (st.peers.peer_ids(), self.shared.id, st.term)
        };
        if let Some(snap) = self.shared.store.load_latest_snapshot()? {
            let encoded_snap = codec::encode_snapshot(&snap, &self.shared.checksum_key);
            let ps_bytes = codec::encode_peer_state(&snap.peer_state);
            let ae = AppendEntry {
                leader: leader_id,
                term,
                commit: snap.last_index,
                pterm: snap.last_term,
                pindex: snap.last_index,
                entries: vec![Entry::Snapshot(encoded_snap), Entry::PeerState(ps_bytes)],
            };
            let payload = codec::encode_append_entry(&ae);
            let subject = transport::subject_append_entries(&self.shared.group);
            for peer in peer_ids {
                if peer != leader_id {
                    let _ = self
                        .shared
                        .transport
                        .publish(&subject, Some(&self.shared.resp_subject), payload.clone())
                        .await;
                }
            }
        }
        Ok(())
    }

    pub async fn compact(&self, index: LogIndex) -> Result<(), NodeError> {
        let applied = self.shared.state.read().applied;
        if index > applied {
            return Err(NodeError::FailedToApply(index));
        }
        self.shared.wal.compact(index).await?;
        Ok(())
    }

    pub async fn applied(&self, index: LogIndex) {
        let mut st = self.shared.state.write();
        if index > st.applied {
            st.applied = index;
        }
    }

    pub fn pause_apply(&self) {
        self.shared.state.write().apply_paused = true;
    }

    pub async fn resume_apply(&self) {
        let hcommit = {
            let mut st = self.shared.state.write();
            st.apply_paused = false;
            st.hcommit.take()
        };
        if let Some(hc) = hcommit {
            self.shared.deliver_commits_through(hc).await;
        }
    }

    pub async fn step_down(&self, preferred: Vec<PeerId>) -> Result<(), NodeError> {
        if preferred.len() > 1 {
            return Err(NodeError::TooManyPrefs);
        }
        if self.shared.state.read().role != Role::Leader {
            return Err(NodeError::StepdownFailed("not leader".into()));
        }
        self.shared
            .stepdown_tx
            .try_send(preferred)
            .map_err(|_| NodeError::StepdownFailed("stepdown mailbox full".into()))
    }

    pub async fn campaign(&self) -> Result<(), NodeError> {
        self.shared.campaign_tx.try_send(()).map_err(|_| NodeError::ProposalFailed)
    }

    pub fn state(&self) -> Role {
        self.shared.state.read().role
    }

    pub fn progress(&self) -> Progress {
        let st = self.shared.state.read();
        Progress {
            next_index: st.pindex + 1,
            commit: st.commit,
            applied: st.applied,
        }
    }

    pub async fn size(&self) -> (u64, u64) {
        let s = self.shared.wal.state().await;
        (s.count, s.bytes)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.state.read().peers.peer_ids()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.shared.state.read().leader
    }

    pub fn quorum(&self) -> usize {
        self.shared.state.read().peers.quorum_count()
    }

    pub fn current(&self) -> (Term, Term, LogIndex) {
        let st = self.shared.state.read();
        (st.term, st.pterm, st.pindex)
    }

    pub fn group_leader(&self) -> Option<PeerId> {
        self.leader()
    }

    pub async fn stop(&self) {
        let _ = self.shared.quit_tx.send(true);
        for sub in self.shared.subs.lock().drain(..) {
            sub.unsubscribe();
        }
        self.shared.wal.stop().await;
    }

    pub async fn delete(&self) {
        self.stop().await;
        let _ = self.shared.store.delete();
        self.shared.wal.delete().await;
    }
}

impl Shared {
    async fn subscribe_follower(self: &Arc<Self>) -> Result<(), NodeError> {
        let vote_subject = transport::subject_vote(&self.group);
        let ae_subject = transport::subject_append_entries(&self.group);

        let vote_tx = self.vote_req_tx.clone();
        let vote_sub = self
            .transport
            .subscribe(
                &vote_subject,
                Arc::new(move |_subject: &str, reply: Option<&str>, payload: Bytes| {
                    if let Ok(vr) = codec::decode_vote_request(&payload) {
                        let _ = vote_tx.try_send((vr, reply.map(str::to_owned)));
                    }
                }) as MessageHandler,
            )
            .await?;

        let ae_tx = self.ae_tx.clone();
        let ae_sub = self
            .transport
            .subscribe(
                &ae_subject,
                Arc::new(move |subject: &str, reply: Option<&str>, payload: Bytes| {
                    if let Ok(ae) = codec::decode_append_entry(&payload) {
                        let _ = ae_tx.try_send((subject.to_owned(), ae, reply.map(str::to_owned)));
                    }
                }) as MessageHandler,
            )
            .await?;

        let ae_resp_tx = self.ae_resp_tx.clone();
        let resp_sub = self
            .transport
            .subscribe(
                &self.resp_subject,
                Arc::new(move |_s: &str, reply: Option<&str>, payload: Bytes| {
                    if let Ok(ar) = codec::decode_ae_response(&payload, reply.map(str::to_owned)) {
                        let _ = ae_resp_tx.try_send(ar);
                    }
                }) as MessageHandler,
            )
            .await?;

        let mut subs = self.subs.lock();
        subs.push(vote_sub);
        subs.push(ae_sub);
        subs.push(resp_sub);
        Ok(())
    }


    // ---- driver loop ----

    async fn run(self: Arc<Self>) {
        let _span = tracing::info_span!("raft_node", group = %self.group, id = self.id).entered();

        let mut propose_rx = self.propose_rx.lock().await.take().unwrap();
        let mut vote_req_rx = self.vote_req_rx.lock().await.take().unwrap();
        let mut vote_resp_rx = self.vote_resp_rx.lock().await.take().unwrap();
        let mut ae_rx = self.ae_rx.lock().await.take().unwrap();
        let mut ae_resp_rx = self.ae_resp_rx.lock().await.take().unwrap();
        let mut stepdown_rx = self.stepdown_rx.lock().await.take().unwrap();
        let mut campaign_rx = self.campaign_rx.lock().await.take().unwrap();
        let mut quit_rx = self.quit_rx.clone();

        let mut hb_ticker = tokio::time::interval(self.config.heartbeat_interval);
        hb_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *quit_rx.borrow() {
                self.state.write().role = Role::Closed;
                return;
            }

            let (role, deadline) = {
                let st = self.state.read();
                (st.role, st.election_deadline)
            };
            if role == Role::Closed {
                return;
            }

            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline.max(Instant::now())));

            tokio::select! {
                _ = quit_rx.changed() => { continue; }

                _ = sleep => {
                    self.on_election_timeout().await;
                }

                _ = hb_ticker.tick(), if role == Role::Leader => {
                    self.on_heartbeat_tick().await;
                }

                Some(p) = propose_rx.recv() => {
                    self.on_propose(p).await;
                }

                Some((vr, reply)) = vote_req_rx.recv() => {
                    self.on_vote_request(vr, reply).await;
                }

                Some(resp) = vote_resp_rx.recv() => {
                    self.on_vote_response(resp).await;
                }

                Some((subject, ae, reply)) = ae_rx.recv() => {
                    self.clone().handle_append_entry(subject, ae, reply).await;
                }

                Some(ar) = ae_resp_rx.recv() => {
                    self.on_ae_response(ar).await;
                }

                Some(pref) = stepdown_rx.recv() => {
                    self.do_step_down(pref).await;
                }

                Some(()) = campaign_rx.recv() => {
                    self.on_campaign_request().await;
                }
            }
        }
    }

    fn reset_election_timer(&self) {
        let mut st = self.state.write();
        st.election_deadline = Instant::now() + random_election_timeout(&self.config);
    }

    // ---- election (§4.4) ----

    async fn on_election_timeout(self: &Arc<Self>) {
        let role = self.state.read().role;
        if !matches!(role, Role::Follower | Role::Candidate | Role::Observer) {
            return;
        }
        self.start_election(random_election_timeout(&self.config)).await;
    }

    async fn on_campaign_request(self: &Arc<Self>) {
        self.start_election(random_campaign_backoff(&self.config)).await;
    }

    async fn start_election(self: &Arc<Self>, next_timeout: Duration) {
        let (term, candidate_id, last_term, last_index) = {
            let mut st = self.state.write();
            st.term += 1;
            st.vote = Some(self.id);
            st.leader = None;
            st.role = Role::Candidate;
            let mut votes = HashSet::new();
            votes.insert(self.id);
            st.candidate = Some(CandidateState { votes_received: votes, deadline: Instant::now() + next_timeout });
            st.election_deadline = Instant::now() + next_timeout;
            (st.term, self.id, st.pterm, st.pindex)
        };

        if let Err(e) = self.store.save_term_vote(TermVote { term, vote: Some(candidate_id) }) {
            tracing::warn!(error = %e, "failed to persist term+vote before campaigning");
        }

        tracing::info!(term, "starting election");

        let req = VoteRequest { term, last_term, last_index, candidate: candidate_id };
        let payload = codec::encode_vote_request(&req);
        let subject = transport::subject_vote(&self.group);
        let reply_inbox = transport::new_reply_inbox(&*self.transport);

        let vote_resp_tx = self.vote_resp_tx.clone();
        if let Ok(sub) = self
            .transport
            .subscribe(
                &reply_inbox,
                Arc::new(move |_s: &str, _r: Option<&str>, payload: Bytes| {
                    if let Ok(vresp) = codec::decode_vote_response(&payload) {
                        let _ = vote_resp_tx.try_send(vresp);
                    }
                }) as MessageHandler,
            )
            .await
        {
            self.subs.lock().push(sub);
        }

        let quorum_needed = self.state.read().peers.quorum_count();
        if quorum_needed <= 1 {
            // Single-node cluster: we already voted for ourselves above.
            self.become_leader().await;
            return;
        }

        let _ = self.transport.publish(&subject, Some(&reply_inbox), payload).await;
    }

    async fn on_vote_request(self: &Arc<Self>, vr: VoteRequest, reply: Option<String>) {
        let eval = {
            let st = self.state.read();
            evaluate_vote_request(st.term, st.vote, st.pterm, st.pindex, &vr)
        };

        let mut stepped_down = false;
        {
            let mut st = self.state.write();
            if let Some(new_term) = eval.adopt_term {
                st.term = new_term;
                st.vote = None;
                if st.role != Role::Follower {
                    st.role = Role::Follower;
                    st.leader = None;
                    stepped_down = true;
                }
            }
            if eval.grant {
                st.vote = Some(vr.candidate);
            }
        }

        if eval.adopt_term.is_some() || eval.grant {
            let (term, vote) = {
                let st = self.state.read();
                (st.term, st.vote)
            };
            if let Err(e) = self.store.save_term_vote(TermVote { term, vote }) {
                tracing::warn!(error = %e, "failed to persist term+vote after vote request");
            }
        }

        self.reset_election_timer();
        if stepped_down {
            let _ = self.lead_change_tx.send(false);
        }

        let resp = VoteResponse { term: eval.respond_term, peer: self.id, granted: eval.grant };
        tracing::debug!(candidate = vr.candidate, granted = eval.grant, "processed vote request");
        if let Some(reply) = reply {
            let payload = codec::encode_vote_response(&resp);
            let _ = self.transport.publish(&reply, None, payload).await;
        }
    }

    async fn on_vote_response(self: &Arc<Self>, resp: VoteResponse) {
        let became_leader = {
            let mut st = self.state.write();
            if st.role != Role::Candidate || resp.term != st.term {
                if resp.term > st.term {
                    st.term = resp.term;
                    st.vote = None;
                    st.role = Role::Follower;
                    st.leader = None;
                }
                false
            } else if resp.granted {
                let quorum = st.peers.quorum_count();
                if let Some(c) = st.candidate.as_mut() {
                    c.votes_received.insert(resp.peer);
                    c.votes_received.len() >= quorum
                } else {
                    false
                }
            } else {
                false
            }
        };
        if became_leader {
            self.become_leader().await;
        }
    }

    async fn become_leader(self: &Arc<Self>) {
        let (term, pterm, pindex, commit) = {
            let mut st = self.state.write();
            st.role = Role::Leader;
            st.leader = Some(self.id);
            st.candidate = None;
            st.leader_state = Some(LeaderState::new());
            if let Some(ls) = st.leader_state.as_mut() {
                ls.acks.start(st.pindex, self.id);
            }
            (st.term, st.pterm, st.pindex, st.commit)
        };

        tracing::info!(term, "won election, becoming leader");
        let _ = self.lead_change_tx.send(true);

        let propose_subject = transport::subject_propose(&self.group);
        let propose_tx = self.propose_tx.clone();
        if let Ok(sub) = self
            .transport
            .subscribe(
                &propose_subject,
                Arc::new(move |_s: &str, _r: Option<&str>, payload: Bytes| {
                    let (tx, _rx) = tokio::sync::oneshot::channel();
                    let _ = propose_tx.try_send(Proposal::Normal(payload, tx));
                }) as MessageHandler,
            )
            .await
        {
            self.subs.lock().push(sub);
        }

        let remove_peer_subject = transport::subject_remove_peer_propose(&self.group);
        let propose_tx_rp = self.propose_tx.clone();
        if let Ok(sub) = self
            .transport
            .subscribe(
                &remove_peer_subject,
                Arc::new(move |_s: &str, _r: Option<&str>, payload: Bytes| {
                    if let Ok(bytes) = <[u8; 8]>::try_from(&payload[..]) {
                        let id = u64::from_le_bytes(bytes);
                        let (tx, _rx) = tokio::sync::oneshot::channel();
                        let _ = propose_tx_rp.try_send(Proposal::RemovePeer(id, tx));
                    }
                }) as MessageHandler,
            )
            .await
        {
            self.subs.lock().push(sub);
        }

        // Initial heartbeat, followed by a PeerState entry (§4.4 "Winning").
        self.broadcast_append_entry(Vec::new(), term, pterm, pindex, commit).await;
        let ps_bytes = codec::encode_peer_state(&self.state.read().peers.snapshot());
        self.leader_append(vec![Entry::PeerState(ps_bytes)]).await;
    }

    // ---- replication, leader side (§4.5) ----

    async fn on_heartbeat_tick(self: &Arc<Self>) {
        let should_heartbeat = {
            let st = self.state.read();
            st.role == Role::Leader
                && st
                    .leader_state
                    .as_ref()
                    .map(|ls| ls.last_broadcast.elapsed() >= self.config.heartbeat_interval)
                    .unwrap_or(false)
        };

        // Lost-quorum check happens on every tick regardless of whether we
        // end up sending a heartbeat.
        let lost_quorum = {
            let st = self.state.read();
            st.role == Role::Leader && !st.peers.quorum_present(self.config.lost_quorum_interval())
        };
        if lost_quorum {
            tracing::warn!("lost quorum, stepping down");
            self.do_step_down(Vec::new()).await;
            return;
        }

        if should_heartbeat {
            self.leader_append(Vec::new()).await;
        }
    }

    async fn on_propose(self: &Arc<Self>, p: Proposal) {
        let role = self.state.read().role;
        if role != Role::Leader {
            let leader_hint = self.state.read().leader;
            match p {
                Proposal::Normal(_, tx) => { let _ = tx.send(Err(NodeError::NotLeader { leader_hint })); }
                Proposal::AddPeer(_, tx) => { let _ = tx.send(Err(NodeError::NotLeader { leader_hint })); }
                Proposal::RemovePeer(_, tx) => { let _ = tx.send(Err(NodeError::NotLeader { leader_hint })); }
            }
            return;
        }

        match p {
            Proposal::Normal(data, tx) => {
                let budget = self.config.propose_batch_bytes;
                let batch = {
                    let mut st = self.state.write();
                    st.pending_normal.push_front(data);
                    drain_batch(&mut st.pending_normal, budget)
                };
                let index = self.leader_append(batch.into_iter().map(Entry::Normal).collect()).await;
                let _ = tx.send(index.ok_or(NodeError::ProposalFailed));
            }
            Proposal::AddPeer(id, tx) => {
                let index = self.leader_append(vec![Entry::AddPeer(id)]).await;
                let _ = tx.send(index.ok_or(NodeError::ProposalFailed));
            }
            Proposal::RemovePeer(id, tx) => {
                let index = self.leader_append(vec![Entry::RemovePeer(id)]).await;
                let _ = tx.send(index.ok_or(NodeError::ProposalFailed));
            }
        }
    }

    /// Appends `entries` as a single batch to the leader's own WAL and
    /// broadcasts it. Returns the assigned index.
    async fn leader_append(self: &Arc<Self>, entries: Vec<Entry>) -> Option<LogIndex> {
        let (term, pterm, pindex, commit, leader) = {
            let st = self.state.read();
            (st.term, st.pterm, st.pindex, st.commit, self.id)
        };

        let ae = AppendEntry { leader, term, commit, pterm, pindex, entries: entries.clone() };
        let payload = codec::encode_append_entry(&ae);
        let expected = pindex + 1;
        let seq = match self.wal.append(payload.clone()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "leader WAL append failed");
                return None;
            }
        };
        crate::error::assert_wal_sequence(expected, seq, term).ok()?;

        let (effect, snapshot) = {
            let mut st = self.state.write();
            st.pterm = term;
            st.pindex = seq;
            if let Some(ls) = st.leader_state.as_mut() {
                ls.acks.start(seq, self.id);
                ls.last_broadcast = Instant::now();
            }
            let effect = self.apply_inline_membership(&mut st, &entries);
            (effect, st.peers.snapshot())
        };
        self.persist_peer_state_if_changed(&effect, snapshot);

        self.maybe_advance_commit(seq, self.id).await;

        let subject = transport::subject_append_entries(&self.group);
        let _ = self.transport.publish(&subject, Some(&self.resp_subject), payload).await;
        Some(seq)
    }

    async fn broadcast_append_entry(
        self: &Arc<Self>,
        entries: Vec<Entry>,
        term: Term,
        pterm: Term,
        pindex: LogIndex,
        commit: LogIndex,
    ) {
        let ae = AppendEntry { leader: self.id, term, commit, pterm, pindex, entries };
        let payload = codec::encode_append_entry(&ae);
        let subject = transport::subject_append_entries(&self.group);
        let _ = self.transport.publish(&subject, Some(&self.resp_subject), payload).await;
        if let Some(ls) = self.state.write().leader_state.as_mut() {
            ls.last_broadcast = Instant::now();
        }
    }

    /// Applies `AddPeer`/`RemovePeer`/`PeerState`/`LeaderTransfer` inline as
    /// they are appended (§4.5 step 11). Returns whether membership actually
    /// changed (so the caller knows to persist `peers.idx`) and whether a
    /// `LeaderTransfer` named this node as the preferred successor.
    fn apply_inline_membership(&self, st: &mut State, entries: &[Entry]) -> MembershipEffect {
        let mut effect = MembershipEffect::default();
        for e in entries {
            match e {
                Entry::AddPeer(id) => {
                    st.peers.add_peer(*id);
                    effect.peers_changed = true;
                }
                Entry::RemovePeer(id) => {
                    st.peers.remove_peer(*id);
                    effect.peers_changed = true;
                }
                Entry::PeerState(bytes) => {
                    if let Ok(ps) = codec::decode_peer_state(bytes) {
                        st.peers.restore(ps);
                        effect.peers_changed = true;
                    }
                }
                Entry::LeaderTransfer(id) if *id == self.id => {
                    effect.transfer_to_me = true;
                }
                _ => {}
            }
        }
        effect
    }

    /// Persists the current peer snapshot if `effect.peers_changed`,
    /// matching §4.2's "written on every membership mutation".
    fn persist_peer_state_if_changed(&self, effect: &MembershipEffect, snapshot: PeerState) {
        if effect.peers_changed {
            if let Err(e) = self.store.save_peer_state(&snapshot) {
                tracing::warn!(error = %e, "failed to persist peer state after membership change");
            }
        }
    }

    async fn on_ae_response(self: &Arc<Self>, ar: AppendEntryResponse) {
        let (is_leader, term) = {
            let st = self.state.read();
            (st.role == Role::Leader, st.term)
        };
        if !is_leader {
            return;
        }
        if ar.term > term {
            tracing::info!(new_term = ar.term, "stepping down: follower observed higher term");
            self.adopt_term_and_step_down(ar.term).await;
            return;
        }

        if ar.success {
            // Forward to an in-flight catchup session unconditionally -- a
            // peer still streaming toward membership hasn't been formally
            // admitted yet, but its progress acks must still drive its own
            // catchup loop forward.
            let catchup_sender = {
                let st = self.state.read();
                st.leader_state.as_ref().and_then(|ls| ls.catchup_acks.get(&ar.peer).cloned())
            };
            if let Some(tx) = catchup_sender {
                let _ = tx.send(ar.index).await;
            }

            // §4.3: an unknown peer is only admitted into the tracked set
            // while the cluster still has room for it; a peer beyond
            // `cluster_size` is a stranger and must not be allowed to grow
            // the membership or count toward quorum just by replying.
            let admitted = {
                let mut st = self.state.write();
                if st.peers.known(ar.peer) {
                    st.peers.track_response(ar.peer, ar.index);
                    true
                } else if st.peers.track_peer(ar.peer, true).is_ok() {
                    st.peers.track_response(ar.peer, ar.index);
                    true
                } else {
                    false
                }
            };
            if !admitted {
                tracing::warn!(peer = ar.peer, "rejected ae response from peer beyond cluster size");
                return;
            }
            self.maybe_advance_commit(ar.index, ar.peer).await;
        } else if let Some(reply) = ar.reply {
            self.start_catchup(ar.peer, ar.index + 1, reply).await;
        }
    }

    async fn maybe_advance_commit(self: &Arc<Self>, index: LogIndex, acked_by: PeerId) {
        let (quorum, count, current_commit) = {
            let mut st = self.state.write();
            let quorum = st.peers.quorum_count();
            let count = st.leader_state.as_mut().map(|ls| ls.acks.record(index, acked_by)).unwrap_or(0);
            (quorum, count, st.commit)
        };
        if count >= quorum && index > current_commit {
            let prev_commit = current_commit;
            {
                let mut st = self.state.write();
                if index > st.commit {
                    st.commit = index;
                }
                if let Some(ls) = st.leader_state.as_mut() {
                    ls.acks.forget_through(index);
                }
            }
            self.deliver_commits_range(prev_commit + 1, index).await;
        }
    }

    // ---- follower AE handling (§4.5, the 13-step state machine) ----

    async fn handle_append_entry(self: Arc<Self>, subject: String, ae: AppendEntry, reply: Option<String>) {
        // Step 1: closed nodes drop everything.
        if self.state.read().role == Role::Closed {
            return;
        }

        // Step 2 & 3: leader/candidate term reconciliation.
        let mut respond_not_success_assert_leadership = false;
        {
            let mut st = self.state.write();
            if st.role == Role::Leader {
                if ae.term > st.term {
                    st.term = ae.term;
                    st.vote = None;
                    st.role = Role::Follower;
                    st.leader = Some(ae.leader);
                } else {
                    respond_not_success_assert_leadership = true;
                }
            } else if st.role == Role::Candidate && ae.term >= st.term {
                st.role = Role::Follower;
                if ae.term > st.term {
                    st.term = ae.term;
                    st.vote = None;
                }
            }
        }

        if respond_not_success_assert_leadership {
            let (term, pindex) = { let st = self.state.read(); (st.term, st.pindex) };
            self.respond_ae(&reply, AppendEntryResponse { term, index: pindex, peer: self.id, success: false, reply: None }).await;
            return;
        }

        self.reset_election_timer();

        let ae_subject = self.state.read().ae_subject.clone();
        let is_new = subject == ae_subject;

        if is_new && ae.term < self.state.read().term {
            let (term, pindex) = { let st = self.state.read(); (st.term, st.pindex) };
            self.respond_ae(&reply, AppendEntryResponse { term, index: pindex, peer: self.id, success: false, reply: None }).await;
            return;
        }

        if !is_new {
            let catchup_inbox = self.state.read().follower_catchup.as_ref().map(|c| c.inbox.clone());
            if catchup_inbox.as_deref() != Some(subject.as_str()) {
                return; // stale delivery on an old catchup inbox
            }
        }

        // §4.5 step 7: only a fresh broadcast AE can retire a catchup
        // session. A message still arriving on the catchup inbox
        // (`!is_new`) must not be allowed to clear it just because the
        // local log happens to have reached the trigger point mid-stream --
        // the leader's streaming task is still actively sending on that
        // inbox and the next chunk would otherwise be dropped as stale.
        if is_new {
            let catchup_satisfied = {
                let st = self.state.read();
                st.follower_catchup.as_ref().map(|c| c.satisfied_by(st.pterm, st.pindex)).unwrap_or(false)
            };
            if catchup_satisfied {
                self.state.write().follower_catchup = None;
            }
        }

        if ae.term > self.state.read().term {
            let mut st = self.state.write();
            st.term = ae.term;
            st.vote = None;
            if st.role != Role::Follower {
                st.role = Role::Follower;
            }
            drop(st);
            let (term, vote) = { let st = self.state.read(); (st.term, st.vote) };
            let _ = self.store.save_term_vote(TermVote { term, vote });
        }

        let mut lead_changed = false;
        if is_new {
            let mut st = self.state.write();
            if st.leader != Some(ae.leader) {
                st.leader = Some(ae.leader);
                lead_changed = true;
            }
        }
        if lead_changed {
            self.reset_election_timer();
            let _ = self.lead_change_tx.send(false);
        }

        // Step 10: log match.
        let (pterm, pindex) = { let st = self.state.read(); (st.pterm, st.pindex) };
        if (ae.pterm, ae.pindex) != (pterm, pindex) {
            if ae.pindex < pindex {
                self.handle_log_conflict_behind(&reply, &ae).await;
                return;
            } else if self.state.read().follower_catchup.is_some() {
                self.handle_catchup_ae(&reply, ae).await;
                return;
            } else {
                self.open_catchup_session(&reply, &ae).await;
                return;
            }
        }

        // Step 11: append, then process add-peer/remove-peer/leader-transfer
        // hints inline.
        let mut transfer_to_me = false;
        if !ae.entries.is_empty() {
            let expected = pindex + 1;
            let payload = codec::encode_append_entry(&ae);
            match self.wal.append(payload).await {
                Ok(seq) if seq == expected => {
                    let (effect, snapshot) = {
                        let mut st = self.state.write();
                        st.pterm = ae.term;
                        st.pindex = seq;
                        let effect = self.apply_inline_membership(&mut st, &ae.entries);
                        (effect, st.peers.snapshot())
                    };
                    self.persist_peer_state_if_changed(&effect, snapshot);
                    transfer_to_me = effect.transfer_to_me;
                }
                Ok(seq) => {
                    tracing::error!(expected, got = seq, "WAL sequence invariant violated on follower append");
                    panic!("raft: follower WAL sequence invariant violated");
                }
                Err(e) => {
                    // §9 open question: the source responds success here,
                    // which is a bug. We respond not-success instead.
                    tracing::warn!(error = %e, "follower WAL append failed");
                    let (term, pindex) = { let st = self.state.read(); (st.term, st.pindex) };
                    self.respond_ae(&reply, AppendEntryResponse { term, index: pindex, peer: self.id, success: false, reply: None }).await;
                    return;
                }
            }
        }

        if transfer_to_me {
            tracing::info!("received leader-transfer hint addressed to us; campaigning immediately");
            self.start_election(random_campaign_backoff(&self.config)).await;
        }

        // Step 12: advance commit.
        if ae.commit > self.state.read().commit {
            let paused = self.state.read().apply_paused;
            if paused {
                let mut st = self.state.write();
                st.hcommit = Some(st.hcommit.map_or(ae.commit, |h| h.max(ae.commit)));
            } else {
                let prev = self.state.read().commit;
                self.state.write().commit = ae.commit;
                self.deliver_commits_range(prev + 1, ae.commit).await;
            }
        }

        // Step 13: success.
        let (term, pindex) = { let st = self.state.read(); (st.term, st.pindex) };
        self.respond_ae(&reply, AppendEntryResponse { term, index: pindex, peer: self.id, success: true, reply: None }).await;
    }

    async fn handle_log_conflict_behind(self: &Arc<Self>, reply: &Option<String>, ae: &AppendEntry) {
        let local_term_at_index = match self.wal.load(ae.pindex).await {
            Ok(bytes) => codec::decode_append_entry(&bytes).ok().map(|e| e.term),
            Err(_) => None,
        };
        match local_term_at_index {
            Some(t) if t < ae.pterm => {
                let _ = self.wal.truncate(ae.pindex).await;
                let mut st = self.state.write();
                st.pindex = ae.pindex;
                st.pterm = ae.pterm;
                drop(st);
                let (term, _) = { let st = self.state.read(); (st.term, st.pindex) };
                self.respond_ae(reply, AppendEntryResponse { term, index: ae.pindex, peer: self.id, success: false, reply: None }).await;
            }
            _ => {
                let (term, _) = { let st = self.state.read(); (st.term, st.pindex) };
                self.respond_ae(reply, AppendEntryResponse { term, index: ae.pindex, peer: self.id, success: true, reply: None }).await;
            }
        }
    }

    async fn handle_catchup_ae(self: &Arc<Self>, reply: &Option<String>, ae: AppendEntry) {
        if ae.entries.len() == 2 {
            if let (Entry::Snapshot(snap_bytes), Entry::PeerState(_)) = (&ae.entries[0], &ae.entries[1]) {
                match snapshot::decode_installed_snapshot(snap_bytes, &self.checksum_key) {
                    Ok(snap) => {
                        if snapshot::apply_installed_snapshot(&*self.wal, &self.store, &snap).await.is_ok() {
                            let mut st = self.state.write();
                            st.pterm = snap.last_term;
                            st.pindex = snap.last_index;
                            st.commit = snap.last_index;
                            st.peers.restore(snap.peer_state.clone());
                        }
                        let data = snap.data.clone();
                        let term = snap.last_term;
                        let index = snap.last_index;
                        let _ = self.apply_tx.send(Committed { index, term, entries: vec![Entry::Snapshot(data)] }).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode installed snapshot during catchup");
                    }
                }
            }
        }
        let (term, pindex) = { let st = self.state.read(); (st.term, st.pindex) };
        self.respond_ae(reply, AppendEntryResponse { term, index: pindex, peer: self.id, success: true, reply: None }).await;
    }

    async fn open_catchup_session(self: &Arc<Self>, reply: &Option<String>, ae: &AppendEntry) {
        let inbox = transport::new_reply_inbox(&*self.transport);
        let (cterm, cindex) = (ae.term, ae.pindex);

        let ae_rx_handler_subject = inbox.clone();
        if let Ok(sub) = self
            .transport
            .subscribe(
                &ae_rx_handler_subject,
                Arc::new({
                    let ae_tx = self.ae_tx.clone();
                    let subj = ae_rx_handler_subject.clone();
                    move |_s: &str, r: Option<&str>, payload: Bytes| {
                        if let Ok(ae) = codec::decode_append_entry(&payload) {
                            let _ = ae_tx.try_send((subj.clone(), ae, r.map(str::to_owned)));
                        }
                    }
                }) as MessageHandler,
            )
            .await
        {
            self.subs.lock().push(sub);
        }

        {
            let mut st = self.state.write();
            st.follower_catchup = Some(FollowerCatchup::new(cterm, cindex, inbox.clone()));
        }

        let (term, _) = { let st = self.state.read(); (st.term, st.pindex) };
        self.respond_ae(reply, AppendEntryResponse { term, index: 0, peer: self.id, success: false, reply: Some(inbox) }).await;
    }

    /// `target` is the subject to deliver the response to (captured from
    /// the reply-to of the AE this responds to); `resp.reply`, when set,
    /// becomes the response message's own reply-to so the sender can reach
    /// us back at a fresh catchup inbox without it being part of the wire
    /// layout itself.
    async fn respond_ae(self: &Arc<Self>, target: &Option<String>, resp: AppendEntryResponse) {
        if let Some(target) = target {
            let our_reply_to = resp.reply.clone();
            let payload = codec::encode_ae_response(&resp);
            let _ = self.transport.publish(target, our_reply_to.as_deref(), payload).await;
        }
    }

    // ---- catchup, leader side (§4.6) ----

    async fn start_catchup(self: &Arc<Self>, peer: PeerId, start: LogIndex, inbox: String) {
        let wal_state = self.wal.state().await;
        let (tx, mut rx) = mpsc::channel::<LogIndex>(32);
        {
            let mut st = self.state.write();
            if let Some(ls) = st.leader_state.as_mut() {
                ls.catchup_acks.insert(peer, tx);
                ls.progress.insert(peer, LeaderProgress::new(start));
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            let needs_snap = needs_snapshot_first(start, wal_state.first);
            let (term, pindex, leader_id) = {
                let st = this.state.read();
                (st.term, st.pindex, this.id)
            };

            if needs_snap {
                if let Ok(Some(snap)) = this.store.load_latest_snapshot() {
                    let encoded_snap = codec::encode_snapshot(&snap, &this.checksum_key);
                    let ps_bytes = codec::encode_peer_state(&snap.peer_state);
                    let ae = AppendEntry {
                        leader: leader_id,
                        term,
                        commit: snap.last_index,
                        pterm: snap.last_term,
                        pindex: snap.last_index,
                        entries: vec![Entry::Snapshot(encoded_snap), Entry::PeerState(ps_bytes)],
                    };
                    let payload = codec::encode_append_entry(&ae);
                    let _ = this.transport.publish(&inbox, Some(&this.resp_subject), payload).await;
                    if let Some(ls) = this.state.write().leader_state.as_mut() {
                        if let Some(p) = ls.progress.get_mut(&peer) {
                            p.next = snap.last_index + 1;
                        }
                    }
                }
            }

            let mut next = this.state.read().leader_state.as_ref().and_then(|ls| ls.progress.get(&peer)).map(|p| p.next).unwrap_or(start);

            loop {
                let still_leader = this.state.read().role == Role::Leader;
                if !still_leader {
                    break;
                }
                let cur_wal = this.wal.state().await;
                if next > cur_wal.last {
                    // Caught up to the tip; stop streaming, normal
                    // replication will keep this peer current from here.
                    let not_previously_known = !this.state.read().peers.known(peer);
                    if not_previously_known {
                        let _ = this.propose_tx.try_send(Proposal::AddPeer(peer, tokio::sync::oneshot::channel().0));
                    }
                    break;
                }

                let stalled = this
                    .state
                    .read()
                    .leader_state
                    .as_ref()
                    .and_then(|ls| ls.progress.get(&peer))
                    .map(|p| p.is_stalled(this.config.catchup_stall))
                    .unwrap_or(true);
                if stalled && next != start {
                    tracing::warn!(peer, "catchup stalled");
                    break;
                }

                match this.wal.load(next).await {
                    Ok(payload) => {
                        let len = payload.len();
                        let _ = this.transport.publish(&inbox, Some(&this.resp_subject), payload).await;
                        if let Some(ls) = this.state.write().leader_state.as_mut() {
                            if let Some(p) = ls.progress.get_mut(&peer) {
                                p.record_sent(len);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, index = next, "catchup failed to load WAL entry");
                        break;
                    }
                }

                let step = this.config.catchup_step;
                tokio::select! {
                    acked = rx.recv() => {
                        match acked {
                            Some(idx) => {
                                if let Some(ls) = this.state.write().leader_state.as_mut() {
                                    if let Some(p) = ls.progress.get_mut(&peer) {
                                        p.record_ack(0, idx);
                                        next = p.next;
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(step) => {
                        next += 1;
                    }
                }
            }

            let mut st = this.state.write();
            if let Some(ls) = st.leader_state.as_mut() {
                ls.catchup_acks.remove(&peer);
                ls.progress.remove(&peer);
            }
        });
    }

    // ---- commit delivery / pause-resume (§4.8) ----

    async fn deliver_commits_through(self: &Arc<Self>, through: LogIndex) {
        let applied_hint = self.state.read().applied;
        self.deliver_commits_range(applied_hint + 1, through).await;
    }

    async fn deliver_commits_range(self: &Arc<Self>, from: LogIndex, to: LogIndex) {
        let mut i = from;
        while i <= to {
            match self.wal.load(i).await {
                Ok(bytes) => {
                    if let Ok(ae) = codec::decode_append_entry(&bytes) {
                        let deliverable: Vec<Entry> = ae.entries.into_iter().filter(|e| e.is_deliverable()).collect();
                        let committed = Committed { index: i, term: ae.term, entries: deliverable };
                        if self.apply_tx.try_send(committed).is_err() {
                            tracing::warn!(index = i, "apply mailbox full, dropping commit delivery");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(index = i, error = %e, "failed to load committed entry for delivery");
                }
            }
            i += 1;
        }
    }

    // ---- leader transfer / stepdown ----

    async fn do_step_down(self: &Arc<Self>, preferred: Vec<PeerId>) {
        if let Some(p) = preferred.first().copied() {
            self.leader_append(vec![Entry::LeaderTransfer(p)]).await;
        }
        let mut st = self.state.write();
        if st.role == Role::Leader {
            st.role = Role::Follower;
            st.leader = None;
            st.leader_state = None;
        }
        drop(st);
        let _ = self.lead_change_tx.send(false);
        self.reset_election_timer();
    }

    async fn adopt_term_and_step_down(self: &Arc<Self>, new_term: Term) {
        {
            let mut st = self.state.write();
            st.term = new_term;
            st.vote = None;
            st.role = Role::Follower;
            st.leader = None;
            st.leader_state = None;
        }
        let (term, vote) = { let st = self.state.read(); (st.term, st.vote) };
        let _ = self.store.save_term_vote(TermVote { term, vote });
        let _ = self.lead_change_tx.send(false);
        self.reset_election_timer();
    }
}
