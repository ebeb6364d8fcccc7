use prost::Message;
use qll_core::rpc::{self, Opcode};
use qll_core::{GetServersResponse, QuillError, Result};
use tokio::net::TcpStream;
use tracing::debug;

/// A resolved cluster member, annotated with its leadership flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub addr: String,
    pub is_leader: bool,
}

/// Name resolution against the cluster itself: dial one bootstrap address,
/// ask it for the full server list, and hand the result to the connection
/// pool.
pub struct Resolver {
    bootstrap_addr: String,
}

impl Resolver {
    pub fn new(bootstrap_addr: impl Into<String>) -> Self {
        Self {
            bootstrap_addr: bootstrap_addr.into(),
        }
    }

    /// One `GetServers` round-trip. Any member answers this, so the
    /// bootstrap address does not need to be the leader.
    pub async fn resolve(&self) -> Result<Vec<ServerInfo>> {
        let mut stream = TcpStream::connect(&self.bootstrap_addr).await?;
        rpc::write_raw(&mut stream, Opcode::GetServers, &[]).await?;

        let (op, body) = rpc::read_frame(&mut stream).await?;
        match op {
            Opcode::Servers => {
                let resp = GetServersResponse::decode(body)?;
                let servers: Vec<ServerInfo> = resp
                    .servers
                    .into_iter()
                    .map(|s| ServerInfo {
                        id: s.id,
                        addr: s.rpc_addr,
                        is_leader: s.is_leader,
                    })
                    .collect();
                debug!(
                    target: "quill::client",
                    bootstrap = %self.bootstrap_addr,
                    servers = servers.len(),
                    "resolved cluster"
                );
                Ok(servers)
            }
            Opcode::OutOfRange | Opcode::Error => Err(rpc::decode_error(op, &body)),
            other => Err(QuillError::Protocol(format!(
                "unexpected response {other:?} to GetServers"
            ))),
        }
    }
}
