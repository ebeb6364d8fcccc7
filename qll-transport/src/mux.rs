use std::net::SocketAddr;

use qll_core::{QuillError, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::stream::NodeStream;
use crate::tls::{PeerTls, ServerTls};

/// First byte of every dialed Raft peer connection. Anything else on an
/// accepted connection is client RPC traffic.
pub const RAFT_MARKER: u8 = 0x01;

/// Single-port transport multiplexing Raft and client RPC traffic.
///
/// The accept loop peeks one byte off every new connection: the Raft marker
/// is consumed and the connection (after optional server-side TLS) goes to
/// the Raft channel; anything else stays in the stream and the connection
/// goes to the RPC channel.
pub struct StreamTransport {
    listener: TcpListener,
    addr: SocketAddr,
    server_tls: Option<ServerTls>,
    peer_tls: Option<PeerTls>,
}

impl StreamTransport {
    pub async fn bind(
        addr: SocketAddr,
        server_tls: Option<ServerTls>,
        peer_tls: Option<PeerTls>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            server_tls,
            peer_tls,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until shutdown, routing each to the Raft or RPC
    /// channel. Per-connection classification runs in its own task so one
    /// slow handshake cannot stall the listener.
    pub async fn run(
        self,
        raft_tx: mpsc::Sender<NodeStream>,
        rpc_tx: mpsc::Sender<NodeStream>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(target: "quill::mux", addr = %self.addr, "transport listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(target: "quill::mux", error = %e, "accept failed");
                            continue;
                        }
                    };

                    let raft_tx = raft_tx.clone();
                    let rpc_tx = rpc_tx.clone();
                    let server_tls = self.server_tls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = route(stream, peer, server_tls, raft_tx, rpc_tx).await {
                            debug!(
                                target: "quill::mux",
                                peer = %peer,
                                error = %e,
                                "dropped connection"
                            );
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!(target: "quill::mux", addr = %self.addr, "transport shutting down");
                    break;
                }
            }
        }
    }

    /// Dial a Raft peer: connect, write the marker, then optionally wrap
    /// with peer-side TLS. The marker always travels in cleartext because
    /// the remote accept loop classifies before any handshake.
    pub async fn dial(peer_tls: Option<&PeerTls>, addr: &str) -> Result<NodeStream> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&[RAFT_MARKER]).await?;

        match peer_tls {
            Some(tls) => {
                let host = addr.split(':').next().unwrap_or(addr);
                tls.connect(host, stream).await
            }
            None => Ok(NodeStream::Plain(stream)),
        }
    }

    pub fn peer_tls(&self) -> Option<PeerTls> {
        self.peer_tls.clone()
    }
}

async fn route(
    stream: TcpStream,
    peer: SocketAddr,
    server_tls: Option<ServerTls>,
    raft_tx: mpsc::Sender<NodeStream>,
    rpc_tx: mpsc::Sender<NodeStream>,
) -> Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        return Err(QuillError::Protocol("connection closed before prefix".into()));
    }

    if first[0] == RAFT_MARKER {
        // Consume the marker; the Raft protocol starts with the next byte.
        let mut marker = [0u8; 1];
        use tokio::io::AsyncReadExt;
        let mut stream = stream;
        stream.read_exact(&mut marker).await?;

        let conn = match &server_tls {
            Some(tls) => tls.accept(stream).await?,
            None => NodeStream::Plain(stream),
        };

        debug!(target: "quill::mux", peer = %peer, "routed raft connection");
        raft_tx
            .send(conn)
            .await
            .map_err(|_| QuillError::Shutdown)?;
    } else {
        // Leave the byte in place: it is the first opcode of the RPC
        // stream.
        debug!(target: "quill::mux", peer = %peer, "routed rpc connection");
        rpc_tx
            .send(NodeStream::Plain(stream))
            .await
            .map_err(|_| QuillError::Shutdown)?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_mux_routes_by_first_byte() {
        let transport = StreamTransport::bind("127.0.0.1:0".parse().unwrap(), None, None)
            .await
            .unwrap();
        let addr = transport.local_addr();

        let (raft_tx, mut raft_rx) = mpsc::channel(1);
        let (rpc_tx, mut rpc_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(transport.run(raft_tx, rpc_tx, shutdown_tx.subscribe()));

        // A connection starting with the marker lands on the raft side,
        // marker consumed.
        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(&[RAFT_MARKER, 0xAB]).await.unwrap();
        let mut conn = raft_rx.recv().await.unwrap();
        let mut b = [0u8; 1];
        conn.read_exact(&mut b).await.unwrap();
        assert_eq!(b[0], 0xAB);

        // Anything else lands on the rpc side with the byte still in the
        // stream.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x10]).await.unwrap();
        let mut conn = rpc_rx.recv().await.unwrap();
        conn.read_exact(&mut b).await.unwrap();
        assert_eq!(b[0], 0x10);

        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn test_dial_writes_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dial = tokio::spawn(async move {
            StreamTransport::dial(None, &addr.to_string()).await.unwrap()
        });

        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut b = [0u8; 1];
        accepted.read_exact(&mut b).await.unwrap();
        assert_eq!(b[0], RAFT_MARKER);

        dial.await.unwrap();
    }
}
