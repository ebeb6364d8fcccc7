//! The agent owns one node's moving parts — stream transport, replicated
//! log, RPC serving, membership — and wires them together in dependency
//! order. Shutdown runs in reverse: membership leave, RPC stop, replicated
//! log close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use qll_core::{QuillError, Record, Result, Server};
use qll_discovery::{Membership, MembershipConfig, MembershipHandler};
use qll_raft::{RaftConfig, ReplicatedLog};
use qll_storage::LogConfig;
use qll_transport::{PeerTls, ServerTls, StreamTransport};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::Config;
use crate::server::{self, CommitLog, GetServerer};

pub struct Agent {
    log: Arc<ReplicatedLog>,
    membership: Membership,
    shutdown_tx: broadcast::Sender<()>,
    rpc_addr: SocketAddr,
}

impl Agent {
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_tls = match config.server_tls.to_files() {
            Some(files) => Some(ServerTls::from_files(&files)?),
            None => None,
        };
        let peer_tls = match config.peer_tls.to_files() {
            Some(files) => Some(PeerTls::from_files(&files)?),
            None => None,
        };

        // One listener carries both Raft and client traffic.
        let bind: SocketAddr = config
            .rpc_addr()
            .parse()
            .map_err(|e| QuillError::Config(format!("rpc address: {e}")))?;
        let transport = StreamTransport::bind(bind, server_tls, peer_tls.clone()).await?;
        let rpc_addr = transport.local_addr();

        let (raft_tx, raft_rx) = mpsc::channel(64);
        let (rpc_tx, rpc_rx) = mpsc::channel(64);
        tokio::spawn(transport.run(raft_tx, rpc_tx, shutdown_tx.subscribe()));

        let mut raft_config = RaftConfig::new(&config.node_name);
        raft_config.bootstrap = config.bootstrap;
        let storage = LogConfig {
            max_store_bytes: config.max_store_bytes,
            max_index_bytes: config.max_index_bytes,
            initial_offset: 0,
        };

        let log = Arc::new(ReplicatedLog::setup(
            &config.data_dir,
            storage,
            raft_config,
            rpc_addr.to_string(),
            raft_rx,
            peer_tls,
        )?);

        // The seed node must be leading before membership starts handing it
        // join events; joiners get no retry from the membership layer.
        if config.bootstrap {
            log.wait_for_leader(Duration::from_secs(3)).await?;
        }

        tokio::spawn(server::serve(
            rpc_rx,
            Arc::clone(&log),
            shutdown_tx.subscribe(),
        ));

        let mut membership_config =
            MembershipConfig::new(&config.node_name, config.bind_addr, rpc_addr.to_string());
        membership_config.start_point_addrs = config.start_point_addrs.clone();
        let membership = Membership::start(
            membership_config,
            LogHandler(Arc::clone(&log)),
            shutdown_tx.clone(),
        )
        .await?;

        info!(
            target: "quill::agent",
            node = %config.node_name,
            rpc = %rpc_addr,
            gossip = %membership.gossip_addr(),
            bootstrap = config.bootstrap,
            "agent started"
        );

        Ok(Self {
            log,
            membership,
            shutdown_tx,
            rpc_addr,
        })
    }

    /// The resolved address clients and peers dial.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// The resolved gossip address, handed to joining nodes as a start
    /// point.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.gossip_addr()
    }

    pub fn log(&self) -> Arc<ReplicatedLog> {
        Arc::clone(&self.log)
    }

    /// Ordered shutdown: announce departure, stop serving, then close the
    /// replicated log (Raft first, storage last).
    pub async fn shutdown(&self) -> Result<()> {
        self.membership.leave().await?;
        let _ = self.shutdown_tx.send(());
        self.log.close().await?;
        info!(target: "quill::agent", "agent stopped");
        Ok(())
    }
}

/// The replicated log is the membership handler: join/leave events become
/// Raft configuration changes on the leader and `NotLeader` no-ops
/// elsewhere.
struct LogHandler(Arc<ReplicatedLog>);

impl MembershipHandler for LogHandler {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
        self.0.join(name, rpc_addr).await
    }

    async fn leave(&self, name: &str) -> Result<()> {
        self.0.leave(name).await
    }
}

impl CommitLog for ReplicatedLog {
    async fn append(&self, record: Record) -> Result<u64> {
        ReplicatedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> Result<Record> {
        ReplicatedLog::read(self, offset)
    }
}

impl GetServerer for ReplicatedLog {
    async fn get_servers(&self) -> Result<Vec<Server>> {
        ReplicatedLog::get_servers(self).await
    }
}
