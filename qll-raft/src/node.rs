//! The consensus driver.
//!
//! All Raft state lives on one task: elections, replication bookkeeping,
//! commit advancement and state-machine application happen there, so no
//! lock is ever held across the protocol. Peer I/O runs on one small task
//! per peer, incoming connections on one task per connection; both funnel
//! results back into the driver's event channel.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use qll_core::{QuillError, Result};
use qll_storage::LogConfig;
use qll_transport::{NodeStream, PeerTls, StreamTransport};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::fsm::Fsm;
use crate::log_store::RaftLogStore;
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::stable::StableStore;
use crate::wire::{
    self, AppendRequest, AppendResponse, ClusterConfig, Entry, EntryKind, RaftServer, Request,
    Response, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};

/// Most entries shipped in one AppendEntries batch.
const MAX_APPEND_BATCH: usize = 64;

/// Timing and identity knobs for one Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub local_id: String,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Applied entries beyond the latest snapshot before a new snapshot is
    /// cut and the Raft log compacted.
    pub snapshot_threshold: u64,
    /// Seed a single-server cluster when no prior state exists. Joining
    /// nodes never set this; they are added through the leader.
    pub bootstrap: bool,
}

impl RaftConfig {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            snapshot_threshold: 8192,
            bootstrap: false,
        }
    }
}

/// Point-in-time view of the node, served to `get_servers` and the leader
/// wait loop.
#[derive(Debug, Clone, Default)]
pub struct RaftState {
    pub term: u64,
    pub is_leader: bool,
    pub leader_addr: Option<String>,
    pub servers: Vec<RaftServer>,
}

enum Command {
    Propose {
        kind: EntryKind,
        data: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    AddServer {
        id: String,
        addr: String,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    RemoveServer {
        id: String,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    State {
        reply: oneshot::Sender<RaftState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// What an outbound RPC was, so its response can be interpreted against
/// the state at send time.
#[derive(Debug, Clone, Copy)]
enum Outbound {
    Vote { term: u64 },
    Append { term: u64, prev: u64, count: u64 },
    Snapshot { term: u64, last_index: u64 },
}

enum Event {
    Incoming {
        req: Request,
        reply: oneshot::Sender<Response>,
    },
    PeerReply {
        peer_id: String,
        sent: Outbound,
        resp: Response,
    },
    PeerFailed {
        peer_id: String,
        sent: Outbound,
    },
}

/// Cloneable handle to the driver task.
#[derive(Clone)]
pub struct RaftHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl RaftHandle {
    pub async fn propose(&self, kind: EntryKind, data: Bytes) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Propose {
                kind,
                data,
                reply: tx,
            })
            .await
            .map_err(|_| QuillError::Shutdown)?;
        rx.await.map_err(|_| QuillError::Shutdown)?
    }

    pub async fn add_server(&self, id: String, addr: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddServer {
                id,
                addr,
                reply: tx,
            })
            .await
            .map_err(|_| QuillError::Shutdown)?;
        rx.await.map_err(|_| QuillError::Shutdown)?.map(|_| ())
    }

    pub async fn remove_server(&self, id: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RemoveServer { id, reply: tx })
            .await
            .map_err(|_| QuillError::Shutdown)?;
        rx.await.map_err(|_| QuillError::Shutdown)?.map(|_| ())
    }

    pub async fn state(&self) -> Result<RaftState> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::State { reply: tx })
            .await
            .map_err(|_| QuillError::Shutdown)?;
        rx.await.map_err(|_| QuillError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply: tx })
            .await
            .map_err(|_| QuillError::Shutdown)?;
        let _ = rx.await;
        Ok(())
    }
}

/// Start a Raft node and return its handle. `conn_rx` delivers incoming
/// peer connections from the stream transport; `local_addr` is the address
/// peers dial back, which is also the RPC address (single port).
pub fn spawn(
    config: RaftConfig,
    raft_dir: &Path,
    log_config: LogConfig,
    fsm: Box<dyn Fsm>,
    local_addr: String,
    conn_rx: mpsc::Receiver<NodeStream>,
    peer_tls: Option<PeerTls>,
) -> Result<RaftHandle> {
    std::fs::create_dir_all(raft_dir)?;

    let store = RaftLogStore::open(&raft_dir.join("log"), log_config)?;
    let stable = StableStore::open(&raft_dir.join("stable"))?;
    let snapshots = SnapshotStore::open(&raft_dir.join("snapshots"))?;

    let snapshot_meta = snapshots.latest_meta()?.unwrap_or_default();
    let has_state = !store.is_empty() || stable.existed() || snapshot_meta.last_index > 0;

    let (last_index, last_term) = if store.is_empty() {
        (snapshot_meta.last_index, snapshot_meta.last_term)
    } else {
        let last = store.last_index();
        (last, store.term_at(last).unwrap_or(0))
    };

    let membership = snapshot_meta.config.clone();
    let mut node = RaftNode {
        local_addr,
        fsm,
        store,
        stable,
        snapshots,
        snapshot_meta,
        membership,
        role: Role::Follower,
        leader_id: None,
        commit_index: 0,
        last_applied: 0,
        last_index,
        last_term,
        election_deadline: Instant::now(),
        next_heartbeat: Instant::now(),
        last_leader_contact: Instant::now(),
        votes: HashSet::new(),
        peers: HashMap::new(),
        pending: HashMap::new(),
        peer_tls,
        event_tx: mpsc::channel(1).0, // replaced below
        cmd_tx: mpsc::channel(1).0,   // replaced below
        shutdown_reply: None,
        config,
    };

    node.last_applied = node.stable.state().last_applied;
    node.commit_index = node.last_applied;

    if node.config.bootstrap && !has_state {
        let servers = vec![RaftServer {
            id: node.config.local_id.clone(),
            addr: node.local_addr.clone(),
        }];
        let cfg = ClusterConfig { servers };
        let entry = Entry {
            index: 1,
            term: 0,
            kind: EntryKind::Configuration,
            data: cfg.encode()?,
        };
        node.store.append(std::slice::from_ref(&entry))?;
        node.last_index = 1;
        node.last_term = 0;
        node.membership = cfg;
        info!(
            target: "quill::raft",
            id = %node.config.local_id,
            addr = %node.local_addr,
            "bootstrapped single-server configuration"
        );
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(1024);
    node.event_tx = event_tx;
    node.cmd_tx = cmd_tx.clone();
    node.reset_election_deadline();
    // The live membership is the newest configuration entry still in the
    // log, falling back to the snapshot's.
    node.rebuild_membership();

    info!(
        target: "quill::raft",
        id = %node.config.local_id,
        term = node.stable.state().current_term,
        last_index = node.last_index,
        members = node.membership.servers.len(),
        "raft node starting"
    );

    tokio::spawn(node.run(cmd_rx, event_rx, conn_rx));

    Ok(RaftHandle { cmd_tx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct PeerState {
    addr: String,
    next_index: u64,
    match_index: u64,
    inflight: bool,
    tx: mpsc::Sender<(Request, Outbound)>,
}

struct RaftNode {
    config: RaftConfig,
    local_addr: String,
    fsm: Box<dyn Fsm>,
    store: RaftLogStore,
    stable: StableStore,
    snapshots: SnapshotStore,
    snapshot_meta: SnapshotMeta,
    membership: ClusterConfig,
    role: Role,
    leader_id: Option<String>,
    commit_index: u64,
    last_applied: u64,
    last_index: u64,
    last_term: u64,
    election_deadline: Instant,
    next_heartbeat: Instant,
    last_leader_contact: Instant,
    votes: HashSet<String>,
    peers: HashMap<String, PeerState>,
    pending: HashMap<u64, oneshot::Sender<Result<Bytes>>>,
    peer_tls: Option<PeerTls>,
    event_tx: mpsc::Sender<Event>,
    cmd_tx: mpsc::Sender<Command>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl RaftNode {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::Receiver<Event>,
        mut conn_rx: mpsc::Receiver<NodeStream>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(15));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => self.handle_event(event),
                Some(conn) = conn_rx.recv() => self.spawn_conn(conn),
                _ = tick.tick() => self.on_tick(),
            }
        }

        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(QuillError::Shutdown));
        }
        if let Err(e) = self.store.close() {
            error!(target: "quill::raft", error = %e, "closing raft log store");
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
        info!(target: "quill::raft", id = %self.config.local_id, "raft node stopped");
    }

    // =====================================================================
    // Commands from the handle
    // =====================================================================

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Propose { kind, data, reply } => {
                if self.role != Role::Leader {
                    let _ = reply.send(Err(QuillError::NotLeader));
                } else {
                    self.propose_entry(kind, data, Some(reply));
                }
            }
            Command::AddServer { id, addr, reply } => self.add_server(id, addr, reply),
            Command::RemoveServer { id, reply } => self.remove_server(id, reply),
            Command::State { reply } => {
                let _ = reply.send(self.state_snapshot());
            }
            Command::Shutdown { reply } => {
                // Acknowledged only after the log store is closed, so a
                // restart over the same directory never races the close.
                self.shutdown_reply = Some(reply);
                return true;
            }
        }
        false
    }

    fn state_snapshot(&self) -> RaftState {
        let leader_addr = self
            .leader_id
            .as_deref()
            .and_then(|id| self.membership.addr_of(id))
            .map(String::from);

        RaftState {
            term: self.stable.state().current_term,
            is_leader: self.role == Role::Leader,
            leader_addr,
            servers: self.membership.servers.clone(),
        }
    }

    fn add_server(&mut self, id: String, addr: String, reply: oneshot::Sender<Result<Bytes>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(QuillError::NotLeader));
            return;
        }

        let exact = self
            .membership
            .servers
            .iter()
            .any(|s| s.id == id && s.addr == addr);
        if exact {
            let _ = reply.send(Ok(Bytes::new()));
            return;
        }

        // A member with the same id or the same address but not both is
        // stale. The majority-overlap argument only covers configurations
        // that change by exactly one server, so the stale entry is removed
        // as its own committed change and the addition retried afterwards,
        // never both in one entry.
        let stale = self
            .membership
            .servers
            .iter()
            .find(|s| s.id == id || s.addr == addr)
            .map(|s| s.id.clone());
        if let Some(stale_id) = stale {
            let servers: Vec<RaftServer> = self
                .membership
                .servers
                .iter()
                .filter(|s| s.id != stale_id)
                .cloned()
                .collect();

            info!(
                target: "quill::raft",
                id = %stale_id,
                members = servers.len(),
                "removing stale member before add"
            );

            let (removed_tx, removed_rx) = oneshot::channel();
            self.propose_config(ClusterConfig { servers }, removed_tx);

            let retry = self.cmd_tx.clone();
            tokio::spawn(async move {
                match removed_rx.await {
                    Ok(Ok(_)) => {
                        let _ = retry.send(Command::AddServer { id, addr, reply }).await;
                    }
                    Ok(Err(e)) => {
                        let _ = reply.send(Err(e));
                    }
                    Err(_) => {
                        let _ = reply.send(Err(QuillError::Shutdown));
                    }
                }
            });
            return;
        }

        let mut servers = self.membership.servers.clone();
        servers.push(RaftServer {
            id: id.clone(),
            addr: addr.clone(),
        });

        info!(
            target: "quill::raft",
            id = %id,
            addr = %addr,
            members = servers.len(),
            "adding voter"
        );
        self.propose_config(ClusterConfig { servers }, reply);
    }

    fn remove_server(&mut self, id: String, reply: oneshot::Sender<Result<Bytes>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(QuillError::NotLeader));
            return;
        }
        if !self.membership.contains_id(&id) {
            let _ = reply.send(Ok(Bytes::new()));
            return;
        }

        let servers: Vec<RaftServer> = self
            .membership
            .servers
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();

        info!(
            target: "quill::raft",
            id = %id,
            members = servers.len(),
            "removing server"
        );
        self.propose_config(ClusterConfig { servers }, reply);
    }

    fn propose_config(&mut self, config: ClusterConfig, reply: oneshot::Sender<Result<Bytes>>) {
        match config.encode() {
            Ok(data) => self.propose_entry(EntryKind::Configuration, data, Some(reply)),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn propose_entry(
        &mut self,
        kind: EntryKind,
        data: Bytes,
        reply: Option<oneshot::Sender<Result<Bytes>>>,
    ) {
        let index = self.last_index + 1;
        let entry = Entry {
            index,
            term: self.stable.state().current_term,
            kind,
            data: data.clone(),
        };

        if let Err(e) = self.store.append(std::slice::from_ref(&entry)) {
            error!(target: "quill::raft", error = %e, "appending to raft log");
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }

        self.last_index = index;
        self.last_term = entry.term;

        if kind == EntryKind::Configuration {
            self.apply_configuration(&data);
        }
        if let Some(reply) = reply {
            self.pending.insert(index, reply);
        }

        self.broadcast_append();
        self.maybe_advance_commit();
    }

    // =====================================================================
    // Incoming connections and RPCs
    // =====================================================================

    fn spawn_conn(&self, conn: NodeStream) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            loop {
                let req = match wire::read_request(&mut conn).await {
                    Ok(req) => req,
                    Err(_) => break,
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                if event_tx
                    .send(Event::Incoming {
                        req,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                let Ok(resp) = reply_rx.await else { break };
                if wire::write_response(&mut conn, &resp).await.is_err() {
                    break;
                }
            }
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming { req, reply } => {
                let resp = match req {
                    Request::Vote(v) => Response::Vote(self.on_vote_request(&v)),
                    Request::Append(a) => Response::Append(self.on_append_request(a)),
                    Request::Snapshot(s) => Response::Snapshot(self.on_snapshot_request(s)),
                };
                let _ = reply.send(resp);
            }
            Event::PeerReply {
                peer_id,
                sent,
                resp,
            } => self.on_peer_reply(&peer_id, sent, resp),
            Event::PeerFailed { peer_id, sent } => {
                if matches!(sent, Outbound::Append { .. } | Outbound::Snapshot { .. }) {
                    if let Some(peer) = self.peers.get_mut(&peer_id) {
                        peer.inflight = false;
                    }
                }
            }
        }
    }

    fn on_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        // Sticky leadership: while a leader is known to be active, vote
        // requests are refused without even adopting the higher term. This
        // keeps a removed or partitioned node from deposing a healthy
        // leader with inflated terms.
        let leader_active = match self.role {
            Role::Leader => true,
            _ => {
                self.leader_id.is_some()
                    && self.last_leader_contact.elapsed() < self.config.election_timeout_min
            }
        };
        if leader_active {
            return VoteResponse {
                term: self.stable.state().current_term,
                granted: false,
            };
        }

        if req.term > self.stable.state().current_term {
            self.step_down(req.term);
            self.leader_id = None;
        }

        let current = self.stable.state().current_term;
        if req.term < current {
            return VoteResponse {
                term: current,
                granted: false,
            };
        }

        let can_vote = match self.stable.state().voted_for.as_deref() {
            None => true,
            Some(id) => id == req.candidate_id,
        };
        let log_ok = (req.last_log_term, req.last_log_index) >= (self.last_term, self.last_index);

        let mut granted = can_vote && log_ok;
        if granted && self.stable.state().voted_for.is_none() {
            // The vote must be durable before it is sent.
            if let Err(e) = self.stable.set_term(current, Some(req.candidate_id.clone())) {
                error!(target: "quill::raft", error = %e, "persisting vote");
                granted = false;
            }
        }
        if granted {
            self.reset_election_deadline();
            debug!(
                target: "quill::raft",
                candidate = %req.candidate_id,
                term = current,
                "vote granted"
            );
        }

        VoteResponse {
            term: current,
            granted,
        }
    }

    fn on_append_request(&mut self, req: AppendRequest) -> AppendResponse {
        let current = self.stable.state().current_term;
        if req.term < current {
            return AppendResponse {
                term: current,
                success: false,
                match_index: self.last_index,
            };
        }
        if req.term > current || self.role != Role::Follower {
            self.step_down(req.term);
        }
        self.leader_id = Some(req.leader_id.clone());
        self.last_leader_contact = Instant::now();
        self.reset_election_deadline();

        let term = self.stable.state().current_term;

        // Log-matching check at the previous entry.
        if req.prev_log_index > 0 && self.term_of(req.prev_log_index) != Some(req.prev_log_term) {
            debug!(
                target: "quill::raft",
                prev = req.prev_log_index,
                "append rejected, log mismatch"
            );
            return AppendResponse {
                term,
                success: false,
                match_index: self.last_index.min(req.prev_log_index.saturating_sub(1)),
            };
        }

        for entry in req.entries {
            if entry.index <= self.last_index {
                if self.term_of(entry.index) == Some(entry.term) {
                    continue;
                }
                // Conflicting suffix from a deposed leader.
                if let Err(e) = self.store.truncate_tail(entry.index) {
                    error!(target: "quill::raft", error = %e, "truncating conflicting entries");
                    return AppendResponse {
                        term,
                        success: false,
                        match_index: self.last_index,
                    };
                }
                self.last_index = entry.index - 1;
                self.last_term = self.term_of(self.last_index).unwrap_or(0);
                // The dropped suffix may have carried a configuration this
                // node already applied on append; fall back to the newest
                // one that survived.
                self.rebuild_membership();
            }

            if entry.index != self.last_index + 1 {
                return AppendResponse {
                    term,
                    success: false,
                    match_index: self.last_index,
                };
            }

            if let Err(e) = self.store.append(std::slice::from_ref(&entry)) {
                error!(target: "quill::raft", error = %e, "appending replicated entry");
                return AppendResponse {
                    term,
                    success: false,
                    match_index: self.last_index,
                };
            }
            self.last_index = entry.index;
            self.last_term = entry.term;
            if entry.kind == EntryKind::Configuration {
                self.apply_configuration(&entry.data);
            }
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_index);
            self.apply_committed();
        }

        AppendResponse {
            term,
            success: true,
            match_index: self.last_index,
        }
    }

    fn on_snapshot_request(&mut self, req: SnapshotRequest) -> SnapshotResponse {
        let current = self.stable.state().current_term;
        if req.term < current {
            return SnapshotResponse {
                term: current,
                success: false,
            };
        }
        if req.term > current || self.role != Role::Follower {
            self.step_down(req.term);
        }
        self.leader_id = Some(req.leader_id.clone());
        self.last_leader_contact = Instant::now();
        self.reset_election_deadline();

        let term = self.stable.state().current_term;
        if req.last_index <= self.snapshot_meta.last_index {
            return SnapshotResponse {
                term,
                success: true,
            };
        }

        info!(
            target: "quill::raft",
            last_index = req.last_index,
            bytes = req.data.len(),
            "installing snapshot"
        );

        let mut reader = std::io::Cursor::new(req.data.as_ref());
        if let Err(e) = self.fsm.restore(&mut reader) {
            error!(target: "quill::raft", error = %e, "restoring snapshot");
            return SnapshotResponse {
                term,
                success: false,
            };
        }

        let meta = SnapshotMeta {
            last_index: req.last_index,
            last_term: req.last_term,
            config: req.config.clone(),
        };
        if let Err(e) = self
            .snapshots
            .create(&meta, std::io::Cursor::new(req.data.as_ref()))
        {
            warn!(target: "quill::raft", error = %e, "persisting installed snapshot");
        }

        if let Err(e) = self.store.reset_after(req.last_index) {
            error!(target: "quill::raft", error = %e, "resetting raft log after snapshot");
            return SnapshotResponse {
                term,
                success: false,
            };
        }

        self.snapshot_meta = meta;
        self.membership = req.config;
        self.last_index = req.last_index;
        self.last_term = req.last_term;
        self.commit_index = req.last_index;
        self.last_applied = req.last_index;
        if let Err(e) = self.stable.set_last_applied(req.last_index) {
            error!(target: "quill::raft", error = %e, "persisting last applied");
        }
        self.sync_peers();

        SnapshotResponse {
            term,
            success: true,
        }
    }

    // =====================================================================
    // Peer replies
    // =====================================================================

    fn on_peer_reply(&mut self, peer_id: &str, sent: Outbound, resp: Response) {
        match (sent, resp) {
            (Outbound::Vote { term }, Response::Vote(vr)) => self.on_vote_reply(peer_id, term, vr),
            (Outbound::Append { term, prev, count }, Response::Append(ar)) => {
                self.on_append_reply(peer_id, term, prev, count, ar)
            }
            (Outbound::Snapshot { term, last_index }, Response::Snapshot(sr)) => {
                self.on_snapshot_reply(peer_id, term, last_index, sr)
            }
            _ => warn!(target: "quill::raft", peer = %peer_id, "mismatched peer response"),
        }
    }

    fn on_vote_reply(&mut self, peer_id: &str, sent_term: u64, resp: VoteResponse) {
        if resp.term > self.stable.state().current_term {
            self.step_down(resp.term);
            return;
        }
        if self.role != Role::Candidate || sent_term != self.stable.state().current_term {
            return;
        }
        if resp.granted {
            self.votes.insert(peer_id.to_string());
            if self.votes.len() >= self.quorum() {
                self.become_leader();
            }
        }
    }

    fn on_append_reply(
        &mut self,
        peer_id: &str,
        sent_term: u64,
        prev: u64,
        count: u64,
        resp: AppendResponse,
    ) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.inflight = false;
        }
        if resp.term > self.stable.state().current_term {
            self.step_down(resp.term);
            return;
        }
        if self.role != Role::Leader || sent_term != self.stable.state().current_term {
            return;
        }
        let last_index = self.last_index;
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };

        if resp.success {
            let matched = prev + count;
            if matched > peer.match_index {
                peer.match_index = matched;
            }
            if matched + 1 > peer.next_index {
                peer.next_index = matched + 1;
            }
            let behind = peer.next_index <= last_index;
            self.maybe_advance_commit();
            if behind {
                self.send_append(peer_id);
            }
        } else {
            // Back off using the follower's hint and retry immediately.
            let hint = resp.match_index.saturating_add(1);
            peer.next_index = peer.next_index.saturating_sub(1).min(hint).max(1);
            self.send_append(peer_id);
        }
    }

    fn on_snapshot_reply(
        &mut self,
        peer_id: &str,
        sent_term: u64,
        last_index: u64,
        resp: SnapshotResponse,
    ) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.inflight = false;
        }
        if resp.term > self.stable.state().current_term {
            self.step_down(resp.term);
            return;
        }
        if self.role != Role::Leader || sent_term != self.stable.state().current_term {
            return;
        }
        let mut caught_up = false;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if resp.success {
                peer.match_index = peer.match_index.max(last_index);
                peer.next_index = last_index + 1;
                caught_up = true;
            }
        }
        if caught_up {
            self.maybe_advance_commit();
            self.send_append(peer_id);
        }
    }

    // =====================================================================
    // Timers, elections, leadership
    // =====================================================================

    fn on_tick(&mut self) {
        let now = Instant::now();
        match self.role {
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.start_election();
                }
            }
            Role::Leader => {
                if now >= self.next_heartbeat {
                    self.broadcast_append();
                    self.next_heartbeat = now + self.config.heartbeat_interval;
                }
                self.maybe_snapshot();
            }
        }
    }

    fn start_election(&mut self) {
        // A node that is not (or no longer) a voter keeps quiet.
        if !self.membership.contains_id(&self.config.local_id) {
            self.reset_election_deadline();
            return;
        }

        let term = self.stable.state().current_term + 1;
        if let Err(e) = self
            .stable
            .set_term(term, Some(self.config.local_id.clone()))
        {
            error!(target: "quill::raft", error = %e, "persisting election term");
            self.reset_election_deadline();
            return;
        }

        self.role = Role::Candidate;
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.config.local_id.clone());
        self.reset_election_deadline();

        info!(
            target: "quill::raft",
            id = %self.config.local_id,
            term,
            "starting election"
        );

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let req = Request::Vote(VoteRequest {
            term,
            candidate_id: self.config.local_id.clone(),
            last_log_index: self.last_index,
            last_log_term: self.last_term,
        });
        for peer in self.peers.values() {
            let _ = peer.tx.try_send((req.clone(), Outbound::Vote { term }));
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.config.local_id.clone());
        self.next_heartbeat = Instant::now();

        let next = self.last_index + 1;
        for peer in self.peers.values_mut() {
            peer.next_index = next;
            peer.match_index = 0;
            peer.inflight = false;
        }

        info!(
            target: "quill::raft",
            id = %self.config.local_id,
            term = self.stable.state().current_term,
            "became leader"
        );

        // Commit barrier: entries from earlier terms commit once this no-op
        // from the current term does.
        self.propose_entry(EntryKind::Noop, Bytes::new(), None);
    }

    fn step_down(&mut self, term: u64) {
        let was_leader = self.role == Role::Leader;
        if term > self.stable.state().current_term {
            if let Err(e) = self.stable.set_term(term, None) {
                error!(target: "quill::raft", error = %e, "persisting term");
            }
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.reset_election_deadline();

        if was_leader {
            warn!(
                target: "quill::raft",
                id = %self.config.local_id,
                term,
                "stepped down"
            );
            for (_, reply) in self.pending.drain() {
                let _ = reply.send(Err(QuillError::NotLeader));
            }
        }
    }

    fn reset_election_deadline(&mut self) {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let span = max.saturating_sub(min).max(1);

        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::time::SystemTime::now().hash(&mut hasher);
        self.config.local_id.hash(&mut hasher);
        let jitter = hasher.finish() % span;

        self.election_deadline = Instant::now() + Duration::from_millis(min + jitter);
    }

    // =====================================================================
    // Replication
    // =====================================================================

    fn broadcast_append(&mut self) {
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            self.send_append(&id);
        }
    }

    fn send_append(&mut self, peer_id: &str) {
        if self.role != Role::Leader {
            return;
        }
        let term = self.stable.state().current_term;
        let commit = self.commit_index;
        let last_index = self.last_index;
        let first_index = self.store.first_index();
        let snapshot_floor = self.snapshot_meta.last_index;

        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if peer.inflight {
            return;
        }
        let next = peer.next_index;

        // A peer that needs entries already compacted away gets the
        // snapshot instead.
        if next <= snapshot_floor && next < first_index {
            self.send_snapshot(peer_id);
            return;
        }

        let prev = next - 1;
        let Some(prev_term) = self.term_of(prev) else {
            self.send_snapshot(peer_id);
            return;
        };

        let mut entries = Vec::new();
        let mut idx = next;
        while idx <= last_index && entries.len() < MAX_APPEND_BATCH {
            match self.store.get(idx) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!(target: "quill::raft", index = idx, error = %e, "reading raft log");
                    break;
                }
            }
            idx += 1;
        }

        let count = entries.len() as u64;
        let req = Request::Append(AppendRequest {
            term,
            leader_id: self.config.local_id.clone(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            leader_commit: commit,
            entries,
        });

        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer
                .tx
                .try_send((req, Outbound::Append { term, prev, count }))
                .is_ok()
            {
                peer.inflight = true;
            }
        }
    }

    fn send_snapshot(&mut self, peer_id: &str) {
        let term = self.stable.state().current_term;
        let snapshot = match self.snapshots.latest() {
            Ok(Some((meta, mut file))) => {
                let mut data = Vec::new();
                match file.read_to_end(&mut data) {
                    Ok(_) => Some((meta, Bytes::from(data))),
                    Err(e) => {
                        error!(target: "quill::raft", error = %e, "reading snapshot for install");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                error!(target: "quill::raft", error = %e, "loading snapshot for install");
                None
            }
        };
        let Some((meta, data)) = snapshot else {
            return;
        };

        let req = Request::Snapshot(SnapshotRequest {
            term,
            leader_id: self.config.local_id.clone(),
            last_index: meta.last_index,
            last_term: meta.last_term,
            config: meta.config.clone(),
            data,
        });
        let last_index = meta.last_index;

        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer
                .tx
                .try_send((req, Outbound::Snapshot { term, last_index }))
                .is_ok()
            {
                peer.inflight = true;
            }
        }
    }

    fn maybe_advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }

        let mut matches: Vec<u64> = self
            .membership
            .servers
            .iter()
            .map(|s| {
                if s.id == self.config.local_id {
                    self.last_index
                } else {
                    self.peers.get(&s.id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = self.quorum();
        if matches.len() < quorum {
            return;
        }
        let candidate = matches[quorum - 1];

        // Only entries from the current term commit by counting.
        if candidate > self.commit_index
            && self.term_of(candidate) == Some(self.stable.state().current_term)
        {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        if self.commit_index <= self.last_applied {
            return;
        }

        let from = self.last_applied + 1;
        for idx in from..=self.commit_index {
            if idx <= self.snapshot_meta.last_index {
                continue;
            }
            let entry = match self.store.get(idx) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(target: "quill::raft", index = idx, error = %e, "reading committed entry");
                    return;
                }
            };

            let result = match entry.kind {
                EntryKind::Command => self.fsm.apply(&entry.data),
                EntryKind::Configuration | EntryKind::Noop => Ok(Bytes::new()),
            };

            match self.pending.remove(&idx) {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(target: "quill::raft", index = idx, error = %e, "apply failed");
                    }
                }
            }
        }

        self.last_applied = self.commit_index;
        if let Err(e) = self.stable.set_last_applied(self.last_applied) {
            error!(target: "quill::raft", error = %e, "persisting last applied");
        }

        // A leader that applied its own removal steps aside.
        if self.role == Role::Leader && !self.membership.contains_id(&self.config.local_id) {
            info!(target: "quill::raft", id = %self.config.local_id, "removed from cluster");
            self.step_down(self.stable.state().current_term);
        }
    }

    fn maybe_snapshot(&mut self) {
        if self
            .last_applied
            .saturating_sub(self.snapshot_meta.last_index)
            < self.config.snapshot_threshold
        {
            return;
        }

        let Some(last_term) = self.term_of(self.last_applied) else {
            return;
        };
        let meta = SnapshotMeta {
            last_index: self.last_applied,
            last_term,
            config: self.membership.clone(),
        };

        let reader = match self.fsm.snapshot() {
            Ok(reader) => reader,
            Err(e) => {
                error!(target: "quill::raft", error = %e, "building snapshot");
                return;
            }
        };
        if let Err(e) = self.snapshots.create(&meta, reader) {
            error!(target: "quill::raft", error = %e, "writing snapshot");
            return;
        }

        self.snapshot_meta = meta;
        if let Err(e) = self.store.compact(self.last_applied) {
            warn!(target: "quill::raft", error = %e, "compacting raft log");
        }
    }

    // =====================================================================
    // Membership plumbing
    // =====================================================================

    fn apply_configuration(&mut self, data: &[u8]) {
        match ClusterConfig::decode(data) {
            Ok(config) => {
                info!(
                    target: "quill::raft",
                    members = config.servers.len(),
                    "configuration changed"
                );
                self.membership = config;
                self.sync_peers();
            }
            Err(e) => error!(target: "quill::raft", error = %e, "decoding configuration entry"),
        }
    }

    /// Recompute the membership as the newest `Configuration` entry still
    /// present in the log, falling back to the snapshot's. Used at startup
    /// and whenever tail truncation may have dropped an applied
    /// configuration.
    fn rebuild_membership(&mut self) {
        let mut membership = self.snapshot_meta.config.clone();
        let first = self.store.first_index();
        let mut idx = self.last_index.min(self.store.last_index());
        while idx >= first && idx > 0 {
            if let Ok(entry) = self.store.get(idx) {
                if entry.kind == EntryKind::Configuration {
                    match ClusterConfig::decode(&entry.data) {
                        Ok(config) => {
                            membership = config;
                            break;
                        }
                        Err(e) => error!(
                            target: "quill::raft",
                            index = idx,
                            error = %e,
                            "decoding configuration entry"
                        ),
                    }
                }
            }
            idx -= 1;
        }

        self.membership = membership;
        self.sync_peers();
    }

    /// Reconcile peer sender tasks with the membership: spawn for new
    /// members, drop removed ones.
    fn sync_peers(&mut self) {
        let local_id = self.config.local_id.clone();
        let wanted: HashMap<String, String> = self
            .membership
            .servers
            .iter()
            .filter(|s| s.id != local_id)
            .map(|s| (s.id.clone(), s.addr.clone()))
            .collect();

        self.peers
            .retain(|id, peer| wanted.get(id) == Some(&peer.addr));

        let next = self.last_index + 1;
        for (id, addr) in wanted {
            if self.peers.contains_key(&id) {
                continue;
            }
            let tx = spawn_peer(&id, addr.clone(), self.peer_tls.clone(), self.event_tx.clone());
            self.peers.insert(
                id,
                PeerState {
                    addr,
                    next_index: next,
                    match_index: 0,
                    inflight: false,
                    tx,
                },
            );
        }
    }

    // =====================================================================
    // Helpers
    // =====================================================================

    fn quorum(&self) -> usize {
        self.membership.servers.len() / 2 + 1
    }

    fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_meta.last_index {
            return Some(self.snapshot_meta.last_term);
        }
        if index == self.last_index {
            return Some(self.last_term);
        }
        self.store.term_at(index)
    }
}

fn spawn_peer(
    id: &str,
    addr: String,
    peer_tls: Option<PeerTls>,
    event_tx: mpsc::Sender<Event>,
) -> mpsc::Sender<(Request, Outbound)> {
    let (tx, mut rx) = mpsc::channel::<(Request, Outbound)>(16);
    let peer_id = id.to_string();

    tokio::spawn(async move {
        let mut conn: Option<NodeStream> = None;
        while let Some((req, sent)) = rx.recv().await {
            let rpc_timeout = match &req {
                Request::Snapshot(_) => Duration::from_secs(30),
                _ => Duration::from_secs(5),
            };

            let outcome =
                tokio::time::timeout(rpc_timeout, exchange(&mut conn, &addr, peer_tls.as_ref(), &req))
                    .await;

            let event = match outcome {
                Ok(Ok(resp)) => Event::PeerReply {
                    peer_id: peer_id.clone(),
                    sent,
                    resp,
                },
                Ok(Err(e)) => {
                    debug!(
                        target: "quill::raft",
                        peer = %peer_id,
                        addr = %addr,
                        error = %e,
                        "peer rpc failed"
                    );
                    conn = None;
                    Event::PeerFailed {
                        peer_id: peer_id.clone(),
                        sent,
                    }
                }
                Err(_) => {
                    debug!(
                        target: "quill::raft",
                        peer = %peer_id,
                        addr = %addr,
                        "peer rpc timed out"
                    );
                    conn = None;
                    Event::PeerFailed {
                        peer_id: peer_id.clone(),
                        sent,
                    }
                }
            };

            if event_tx.send(event).await.is_err() {
                return;
            }
        }
    });

    tx
}

/// One request/response over the cached peer connection, redialing when
/// needed.
async fn exchange(
    conn: &mut Option<NodeStream>,
    addr: &str,
    peer_tls: Option<&PeerTls>,
    req: &Request,
) -> Result<Response> {
    if conn.is_none() {
        *conn = Some(StreamTransport::dial(peer_tls, addr).await?);
    }
    let stream = match conn.as_mut() {
        Some(stream) => stream,
        // Just refilled above.
        None => return Err(QuillError::Protocol("peer connection unavailable".into())),
    };

    let result = async {
        wire::write_request(stream, req).await?;
        wire::read_response(stream).await
    }
    .await;

    if result.is_err() {
        *conn = None;
    }
    result
}
