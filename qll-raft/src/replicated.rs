use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use qll_core::{
    ProduceRequest, ProduceResponse, QuillError, Record, Result, Server,
};
use qll_storage::{Log, LogConfig};
use qll_transport::{NodeStream, PeerTls};
use tokio::sync::mpsc;
use tracing::info;

use crate::fsm::{LogFsm, APPEND_REQUEST};
use crate::node::{self, RaftConfig, RaftHandle};
use crate::wire::EntryKind;

/// How long a proposed append may wait for quorum commit.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// The replicated commit log: a local segmented log driven as Raft's state
/// machine. Writes go through consensus on the leader; reads come straight
/// from the local committed log, so followers may lag.
///
/// The replicated log exclusively owns the local log and the Raft node; no
/// other writer touches either.
pub struct ReplicatedLog {
    log: Arc<Log>,
    raft: RaftHandle,
}

impl ReplicatedLog {
    /// Open the local log under `data_dir/log` and the Raft state under
    /// `data_dir/raft`, then start the consensus driver. `conn_rx` feeds
    /// incoming peer connections from the stream transport; `local_addr`
    /// is this node's advertised address on the shared port.
    pub fn setup(
        data_dir: &Path,
        storage: LogConfig,
        raft: RaftConfig,
        local_addr: String,
        conn_rx: mpsc::Receiver<NodeStream>,
        peer_tls: Option<PeerTls>,
    ) -> Result<Self> {
        let log = Arc::new(Log::open(&data_dir.join("log"), storage)?);
        let fsm = Box::new(LogFsm::new(Arc::clone(&log)));

        let handle = node::spawn(
            raft,
            &data_dir.join("raft"),
            storage,
            fsm,
            local_addr,
            conn_rx,
            peer_tls,
        )?;

        Ok(Self { log, raft: handle })
    }

    /// Replicate one record through consensus. Returns the offset the
    /// cluster agreed on. Fails with `NotLeader` on a follower and
    /// `ApplyTimeout` when quorum commit does not land in time.
    pub async fn append(&self, record: Record) -> Result<u64> {
        let req = ProduceRequest {
            record: Some(record),
        };
        let mut command = vec![APPEND_REQUEST];
        command.extend(req.encode_to_vec());

        let proposal = self.raft.propose(EntryKind::Command, Bytes::from(command));
        let response = match tokio::time::timeout(APPLY_TIMEOUT, proposal).await {
            Ok(result) => result?,
            Err(_) => return Err(QuillError::ApplyTimeout),
        };

        let resp = ProduceResponse::decode(response)?;
        Ok(resp.offset)
    }

    /// Read from the local committed log, bypassing Raft. A follower that
    /// has not replicated the offset yet reports it out of range.
    pub fn read(&self, offset: u64) -> Result<Record> {
        self.log.read(offset)
    }

    /// Add a voter. Idempotent: a member with the same id and address is a
    /// no-op, and a stale member with a matching id or address is replaced.
    pub async fn join(&self, id: &str, addr: &str) -> Result<()> {
        self.raft.add_server(id.to_string(), addr.to_string()).await
    }

    /// Remove a member from the cluster configuration.
    pub async fn leave(&self, id: &str) -> Result<()> {
        self.raft.remove_server(id.to_string()).await
    }

    /// Every member of the current configuration, with `is_leader` set on
    /// the entry whose address matches the current leader.
    pub async fn get_servers(&self) -> Result<Vec<Server>> {
        let state = self.raft.state().await?;
        Ok(state
            .servers
            .into_iter()
            .map(|s| Server {
                is_leader: state.leader_addr.as_deref() == Some(s.addr.as_str()),
                id: s.id,
                rpc_addr: s.addr,
            })
            .collect())
    }

    /// Poll until a leader is known or the deadline passes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = self.raft.state().await?;
                    if let Some(addr) = state.leader_addr {
                        if !addr.is_empty() {
                            return Ok(addr);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(QuillError::LeaderWaitTimeout);
                }
            }
        }
    }

    /// Shut down Raft, then close the local log.
    pub async fn close(&self) -> Result<()> {
        self.raft.shutdown().await?;
        self.log.close()?;
        info!(target: "quill::raft", "replicated log closed");
        Ok(())
    }
}
