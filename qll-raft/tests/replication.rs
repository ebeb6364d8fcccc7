//! Cluster-level tests for the replicated log, wiring real stream
//! transports but joining members directly instead of through discovery.

#![allow(clippy::unwrap_used)]

use std::time::{Duration, Instant};

use qll_core::{QuillError, Record};
use qll_raft::{RaftConfig, ReplicatedLog};
use qll_transport::StreamTransport;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

struct TestNode {
    log: ReplicatedLog,
    addr: String,
    _data_dir: TempDir,
    _rpc_rx: mpsc::Receiver<qll_transport::NodeStream>,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_node(name: &str, bootstrap: bool) -> TestNode {
    let data_dir = tempfile::tempdir().unwrap();

    let transport = StreamTransport::bind("127.0.0.1:0".parse().unwrap(), None, None)
        .await
        .unwrap();
    let addr = transport.local_addr().to_string();

    let (raft_tx, raft_rx) = mpsc::channel(16);
    let (rpc_tx, rpc_rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(transport.run(raft_tx, rpc_tx, shutdown_tx.subscribe()));

    let mut raft = RaftConfig::new(name);
    raft.bootstrap = bootstrap;

    let log = ReplicatedLog::setup(
        data_dir.path(),
        Default::default(),
        raft,
        addr.clone(),
        raft_rx,
        None,
    )
    .unwrap();

    TestNode {
        log,
        addr,
        _data_dir: data_dir,
        _rpc_rx: rpc_rx,
        _shutdown_tx: shutdown_tx,
    }
}

async fn read_eventually(log: &ReplicatedLog, offset: u64, deadline: Duration) -> Option<Record> {
    let until = Instant::now() + deadline;
    loop {
        match log.read(offset) {
            Ok(record) => return Some(record),
            Err(_) if Instant::now() < until => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn test_joined_followers_replicate_appends() {
    let leader = start_node("node-0", true).await;
    leader
        .log
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let follower1 = start_node("node-1", false).await;
    let follower2 = start_node("node-2", false).await;
    leader.log.join("node-1", &follower1.addr).await.unwrap();
    leader.log.join("node-2", &follower2.addr).await.unwrap();

    let servers = leader.log.get_servers().await.unwrap();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

    let mut offsets = Vec::new();
    for value in [&b"alpha"[..], b"beta", b"gamma"] {
        offsets.push(leader.log.append(Record::new(value)).await.unwrap());
    }

    for (node, name) in [(&follower1, "node-1"), (&follower2, "node-2")] {
        for (i, value) in [&b"alpha"[..], b"beta", b"gamma"].iter().enumerate() {
            let record = read_eventually(&node.log, offsets[i], Duration::from_secs(5)).await;
            assert_eq!(
                record.unwrap_or_else(|| panic!("{name} missing offset {}", offsets[i])).value.as_ref(),
                *value
            );
        }
    }

    leader.log.close().await.unwrap();
    follower1.log.close().await.unwrap();
    follower2.log.close().await.unwrap();
}

#[tokio::test]
async fn test_join_is_idempotent_and_replaces_stale_members() {
    let leader = start_node("node-0", true).await;
    leader
        .log
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let follower = start_node("node-1", false).await;
    leader.log.join("node-1", &follower.addr).await.unwrap();
    // Same id and address: a no-op.
    leader.log.join("node-1", &follower.addr).await.unwrap();
    assert_eq!(leader.log.get_servers().await.unwrap().len(), 2);

    // A new id at the same address replaces the stale member instead of
    // growing the cluster.
    leader.log.join("node-9", &follower.addr).await.unwrap();
    let servers = leader.log.get_servers().await.unwrap();
    assert_eq!(servers.len(), 2);
    assert!(servers.iter().any(|s| s.id == "node-9"));
    assert!(!servers.iter().any(|s| s.id == "node-1"));

    leader.log.close().await.unwrap();
    follower.log.close().await.unwrap();
}

#[tokio::test]
async fn test_append_on_follower_is_not_leader() {
    let leader = start_node("node-0", true).await;
    leader
        .log
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let follower = start_node("node-1", false).await;
    leader.log.join("node-1", &follower.addr).await.unwrap();

    match follower.log.append(Record::new(&b"rejected"[..])).await {
        Err(QuillError::NotLeader) => {}
        other => panic!("expected NotLeader, got {other:?}"),
    }

    leader.log.close().await.unwrap();
    follower.log.close().await.unwrap();
}

#[tokio::test]
async fn test_leave_shrinks_configuration() {
    let leader = start_node("node-0", true).await;
    leader
        .log
        .wait_for_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let follower1 = start_node("node-1", false).await;
    let follower2 = start_node("node-2", false).await;
    leader.log.join("node-1", &follower1.addr).await.unwrap();
    leader.log.join("node-2", &follower2.addr).await.unwrap();

    let before = leader.log.append(Record::new(&b"everyone"[..])).await.unwrap();
    assert!(read_eventually(&follower1.log, before, Duration::from_secs(5)).await.is_some());

    leader.log.leave("node-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let servers = leader.log.get_servers().await.unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

    let after = leader.log.append(Record::new(&b"survivors"[..])).await.unwrap();
    assert!(read_eventually(&follower2.log, after, Duration::from_secs(5)).await.is_some());
    assert!(follower1.log.read(after).is_err());

    leader.log.close().await.unwrap();
    follower1.log.close().await.unwrap();
    follower2.log.close().await.unwrap();
}
