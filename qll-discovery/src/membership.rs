use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use qll_core::{QuillError, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::gossip::{supersedes, GossipPacket, MemberInfo, MemberStatus};

/// Peers contacted per gossip round.
const FANOUT: usize = 3;

/// Receives membership changes. Implemented by the replicated log, whose
/// join/leave are idempotent through Raft's configuration reconciliation —
/// the membership module itself never retries.
pub trait MembershipHandler: Send + Sync + 'static {
    fn join(&self, name: &str, rpc_addr: &str) -> impl Future<Output = Result<()>> + Send;
    fn leave(&self, name: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub node_name: String,
    /// UDP address gossip binds to.
    pub bind_addr: SocketAddr,
    /// RPC address published as this node's tag.
    pub rpc_addr: String,
    /// Gossip addresses of existing members to join through. Empty for the
    /// first node.
    pub start_point_addrs: Vec<String>,
    pub gossip_interval: Duration,
    /// Silence beyond this marks a member failed.
    pub suspicion_timeout: Duration,
}

impl MembershipConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr, rpc_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            rpc_addr: rpc_addr.into(),
            start_point_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            suspicion_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Join { name: String, rpc_addr: String },
    Leave { name: String },
}

/// A live view row from [`Membership::members`].
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub rpc_addr: String,
    pub status: MemberStatus,
}

struct MemberRecord {
    info: MemberInfo,
    last_heard: Instant,
}

struct Inner {
    config: MembershipConfig,
    socket: UdpSocket,
    state: Mutex<HashMap<String, MemberRecord>>,
    event_tx: mpsc::Sender<MemberEvent>,
    incarnation: AtomicU64,
    left: AtomicBool,
}

/// Gossip membership for one node. Spawns a receive loop, a periodic
/// gossip/failure-detection loop, and one event consumer driving the
/// handler.
pub struct Membership {
    inner: Arc<Inner>,
}

impl Membership {
    pub async fn start<H: MembershipHandler>(
        mut config: MembershipConfig,
        handler: H,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        // Advertise the resolved address so binding port 0 works.
        let local_addr = socket.local_addr()?;
        config.bind_addr = local_addr;
        let (event_tx, event_rx) = mpsc::channel(256);

        info!(
            target: "quill::discovery",
            name = %config.node_name,
            bind = %local_addr,
            rpc = %config.rpc_addr,
            "membership starting"
        );

        let inner = Arc::new(Inner {
            config,
            socket,
            state: Mutex::new(HashMap::new()),
            event_tx,
            incarnation: AtomicU64::new(1),
            left: AtomicBool::new(false),
        });

        tokio::spawn(recv_loop(Arc::clone(&inner), shutdown.subscribe()));
        tokio::spawn(gossip_loop(Arc::clone(&inner), shutdown.subscribe()));
        tokio::spawn(consume_events(
            inner.config.node_name.clone(),
            handler,
            event_rx,
        ));

        // Announce ourselves to the start points right away.
        let hello = inner.local_packet().await;
        for addr in &inner.config.start_point_addrs {
            inner.send_packet(&hello, addr).await;
        }

        Ok(Self { inner })
    }

    /// The resolved gossip address, usable as a start point by joiners.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.inner.config.bind_addr
    }

    /// Snapshot of every known member, the local node included.
    pub async fn members(&self) -> Vec<Member> {
        let state = self.inner.state.lock().await;
        let mut members: Vec<Member> = state
            .values()
            .map(|r| Member {
                name: r.info.name.clone(),
                rpc_addr: r.info.rpc_addr.clone(),
                status: r.info.status,
            })
            .collect();
        members.push(Member {
            name: self.inner.config.node_name.clone(),
            rpc_addr: self.inner.config.rpc_addr.clone(),
            status: if self.inner.left.load(Ordering::SeqCst) {
                MemberStatus::Left
            } else {
                MemberStatus::Alive
            },
        });
        members
    }

    /// Count of members currently believed alive (including self).
    pub async fn alive_count(&self) -> usize {
        self.members()
            .await
            .iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .count()
    }

    /// Announce a graceful departure to every known member.
    pub async fn leave(&self) -> Result<()> {
        self.inner.left.store(true, Ordering::SeqCst);
        self.inner.incarnation.fetch_add(1, Ordering::SeqCst);

        let packet = self.inner.local_packet().await;
        let targets: Vec<String> = {
            let state = self.inner.state.lock().await;
            state.values().map(|r| r.info.bind_addr.clone()).collect()
        };
        for addr in targets {
            self.inner.send_packet(&packet, &addr).await;
        }

        info!(
            target: "quill::discovery",
            name = %self.inner.config.node_name,
            "membership left"
        );
        Ok(())
    }
}

impl Inner {
    fn local_info(&self) -> MemberInfo {
        MemberInfo {
            name: self.config.node_name.clone(),
            bind_addr: self.config.bind_addr.to_string(),
            rpc_addr: self.config.rpc_addr.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            status: if self.left.load(Ordering::SeqCst) {
                MemberStatus::Left
            } else {
                MemberStatus::Alive
            },
        }
    }

    /// The full member table, self first.
    async fn local_packet(&self) -> GossipPacket {
        let mut members = vec![self.local_info()];
        let state = self.state.lock().await;
        members.extend(state.values().map(|r| r.info.clone()));
        GossipPacket {
            from: self.config.node_name.clone(),
            members,
        }
    }

    async fn send_packet(&self, packet: &GossipPacket, addr: &str) {
        let Some(encoded) = packet.encode() else {
            return;
        };
        if let Err(e) = self.socket.send_to(&encoded, addr).await {
            debug!(
                target: "quill::discovery",
                addr = %addr,
                error = %e,
                "gossip send failed"
            );
        }
    }

    /// Merge one received packet into the member table, emitting events for
    /// observable transitions.
    async fn merge(&self, packet: GossipPacket) {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        for info in packet.members {
            if info.name == self.config.node_name {
                // Someone believes we are gone; refute with a higher
                // incarnation unless we really left.
                if info.status != MemberStatus::Alive && !self.left.load(Ordering::SeqCst) {
                    let next = info.incarnation + 1;
                    self.incarnation.fetch_max(next, Ordering::SeqCst);
                }
                continue;
            }

            let heard_directly = info.name == packet.from;
            match state.get_mut(&info.name) {
                None => {
                    let event = match info.status {
                        MemberStatus::Alive => Some(MemberEvent::Join {
                            name: info.name.clone(),
                            rpc_addr: info.rpc_addr.clone(),
                        }),
                        _ => None,
                    };
                    state.insert(
                        info.name.clone(),
                        MemberRecord {
                            info,
                            last_heard: now,
                        },
                    );
                    if let Some(event) = event {
                        let _ = self.event_tx.send(event).await;
                    }
                }
                Some(record) => {
                    if heard_directly {
                        record.last_heard = now;
                    }
                    // Hearing from a member first-hand is proof of life and
                    // overrides an earlier failure suspicion.
                    let direct_revival = heard_directly
                        && record.info.status == MemberStatus::Failed
                        && info.status == MemberStatus::Alive;
                    if !supersedes(&info, &record.info) && !direct_revival {
                        continue;
                    }
                    let was_alive = record.info.status == MemberStatus::Alive;
                    let is_alive = info.status == MemberStatus::Alive;
                    record.info = info.clone();
                    if is_alive {
                        record.last_heard = now;
                    }

                    let event = match (was_alive, is_alive) {
                        (true, false) => Some(MemberEvent::Leave {
                            name: info.name.clone(),
                        }),
                        (false, true) => Some(MemberEvent::Join {
                            name: info.name.clone(),
                            rpc_addr: info.rpc_addr.clone(),
                        }),
                        _ => None,
                    };
                    if let Some(event) = event {
                        let _ = self.event_tx.send(event).await;
                    }
                }
            }
        }
    }

    /// Mark members silent past the suspicion window as failed.
    async fn detect_failures(&self) {
        let timeout = self.config.suspicion_timeout;
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock().await;
            for record in state.values_mut() {
                if record.info.status == MemberStatus::Alive
                    && record.last_heard.elapsed() > timeout
                {
                    record.info.status = MemberStatus::Failed;
                    record.info.incarnation += 1;
                    failed.push(record.info.name.clone());
                }
            }
        }
        for name in failed {
            warn!(
                target: "quill::discovery",
                member = %name,
                "member failed"
            );
            let _ = self.event_tx.send(MemberEvent::Leave { name }).await;
        }
    }

    /// Pick up to `FANOUT` gossip targets without a RNG: rotate through the
    /// table from a clock-hashed starting point.
    async fn gossip_targets(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let addrs: Vec<String> = state
            .values()
            .filter(|r| r.info.status == MemberStatus::Alive)
            .map(|r| r.info.bind_addr.clone())
            .collect();
        drop(state);

        if addrs.is_empty() {
            return self.config.start_point_addrs.clone();
        }
        if addrs.len() <= FANOUT {
            return addrs;
        }

        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::time::SystemTime::now().hash(&mut hasher);
        let start = (hasher.finish() as usize) % addrs.len();

        (0..FANOUT)
            .map(|i| addrs[(start + i) % addrs.len()].clone())
            .collect()
    }
}

async fn recv_loop(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            received = inner.socket.recv_from(&mut buf) => {
                let n = match received {
                    Ok((n, _)) => n,
                    Err(e) => {
                        debug!(target: "quill::discovery", error = %e, "gossip recv failed");
                        continue;
                    }
                };
                let Some(packet) = GossipPacket::decode(&buf[..n]) else {
                    debug!(target: "quill::discovery", "discarding malformed gossip packet");
                    continue;
                };
                inner.merge(packet).await;
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn gossip_loop(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(inner.config.gossip_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if inner.left.load(Ordering::SeqCst) {
                    continue;
                }
                inner.detect_failures().await;
                let packet = inner.local_packet().await;
                for addr in inner.gossip_targets().await {
                    inner.send_packet(&packet, &addr).await;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// The single event consumer. Errors never fail the peer's event handling:
/// `NotLeader` is expected on followers and logged at debug, everything
/// else at error.
async fn consume_events<H: MembershipHandler>(
    local_name: String,
    handler: H,
    mut event_rx: mpsc::Receiver<MemberEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let (result, name, action) = match &event {
            MemberEvent::Join { name, rpc_addr } => {
                if *name == local_name {
                    continue;
                }
                (handler.join(name, rpc_addr).await, name.clone(), "join")
            }
            MemberEvent::Leave { name } => {
                if *name == local_name {
                    continue;
                }
                (handler.leave(name).await, name.clone(), "leave")
            }
        };

        match result {
            Ok(()) => {}
            Err(QuillError::NotLeader) => debug!(
                target: "quill::discovery",
                member = %name,
                action,
                "handler deferred to leader"
            ),
            Err(e) => error!(
                target: "quill::discovery",
                member = %name,
                action,
                error = %e,
                "membership handler failed"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        joins: Arc<StdMutex<Vec<(String, String)>>>,
        leaves: Arc<StdMutex<Vec<String>>>,
    }

    impl MembershipHandler for RecordingHandler {
        async fn join(&self, name: &str, rpc_addr: &str) -> Result<()> {
            self.joins
                .lock()
                .unwrap()
                .push((name.to_string(), rpc_addr.to_string()));
            Ok(())
        }

        async fn leave(&self, name: &str) -> Result<()> {
            self.leaves.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    async fn free_udp_addr() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_three_members_discover_each_other() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut addrs = Vec::new();
        for _ in 0..3 {
            addrs.push(free_udp_addr().await);
        }

        let mut memberships = Vec::new();
        let mut handlers = Vec::new();
        for (i, addr) in addrs.iter().enumerate() {
            let mut config = MembershipConfig::new(
                format!("node-{i}"),
                *addr,
                format!("127.0.0.1:{}", 9000 + i),
            );
            if i > 0 {
                config.start_point_addrs = vec![addrs[0].to_string()];
            }

            let handler = RecordingHandler::default();
            let joins = Arc::clone(&handler.joins);
            memberships.push(
                Membership::start(config, handler, shutdown_tx.clone())
                    .await
                    .unwrap(),
            );
            handlers.push(joins);
        }

        // Everyone eventually sees all three members alive.
        for membership in &memberships {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut alive = membership.alive_count().await;
            while alive != 3 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
                alive = membership.alive_count().await;
            }
            assert_eq!(alive, 3, "membership never converged");
        }

        // The seed node's handler saw both joiners, with their rpc tags.
        let joins = Arc::clone(&handlers[0]);
        let seen = wait_until(Duration::from_secs(3), move || {
            joins.lock().unwrap().len() >= 2
        })
        .await;
        assert!(seen);
        let joined = handlers[0].lock().unwrap().clone();
        assert!(joined.iter().any(|(n, a)| n == "node-1" && a == "127.0.0.1:9001"));
        assert!(joined.iter().any(|(n, a)| n == "node-2" && a == "127.0.0.1:9002"));

        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn test_graceful_leave_emits_event() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let addr0 = free_udp_addr().await;
        let addr1 = free_udp_addr().await;

        let handler0 = RecordingHandler::default();
        let leaves = Arc::clone(&handler0.leaves);
        let m0 = Membership::start(
            MembershipConfig::new("node-0", addr0, "127.0.0.1:9100"),
            handler0,
            shutdown_tx.clone(),
        )
        .await
        .unwrap();

        let mut config1 = MembershipConfig::new("node-1", addr1, "127.0.0.1:9101");
        config1.start_point_addrs = vec![addr0.to_string()];
        let m1 = Membership::start(config1, RecordingHandler::default(), shutdown_tx.clone())
            .await
            .unwrap();

        let m0_ref = &m0;
        let converged = {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if m0_ref.alive_count().await == 2 {
                    break true;
                }
                if Instant::now() > deadline {
                    break false;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        assert!(converged);

        m1.leave().await.unwrap();

        let left = wait_until(Duration::from_secs(3), move || {
            leaves.lock().unwrap().contains(&"node-1".to_string())
        })
        .await;
        assert!(left);

        drop(shutdown_tx);
    }
}
