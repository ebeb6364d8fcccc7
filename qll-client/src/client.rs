use std::sync::Arc;
use std::sync::RwLock;

use bytes::Bytes;
use prost::Message;
use qll_core::rpc::{self, Opcode};
use qll_core::{
    ConsumeRequest, ConsumeResponse, ProduceRequest, ProduceResponse, QuillError, Record, Result,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::methods;
use crate::picker::Picker;
use crate::resolver::{Resolver, ServerInfo};

/// One pooled sub-connection: lazily dialed, serialized per call, dropped
/// on I/O failure so the next call redials.
struct ServerConn {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl ServerConn {
    fn new(addr: String) -> Arc<Self> {
        Arc::new(Self {
            addr,
            stream: Mutex::new(None),
        })
    }

    async fn call<M: Message>(&self, op: Opcode, msg: &M) -> Result<(Opcode, Bytes)> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(TcpStream::connect(&self.addr).await?);
        }
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return Err(QuillError::NoServerAvailable),
        };

        let result = async {
            rpc::write_message(stream, op, msg).await?;
            rpc::read_frame(stream).await
        }
        .await;

        if result.is_err() {
            *guard = None;
        }
        result
    }
}

/// Thin client over the resolver and picker: produce goes to the leader,
/// consume spreads over followers, and the server list can be re-resolved
/// at any time.
pub struct LogClient {
    resolver: Resolver,
    picker: RwLock<Arc<Picker<Arc<ServerConn>>>>,
}

impl LogClient {
    /// Resolve the cluster through `bootstrap_addr` and build the
    /// connection pool.
    pub async fn connect(bootstrap_addr: impl Into<String>) -> Result<Self> {
        let resolver = Resolver::new(bootstrap_addr);
        let servers = resolver.resolve().await?;
        let client = Self {
            resolver,
            picker: RwLock::new(Arc::new(build_picker(&servers))),
        };
        Ok(client)
    }

    /// Re-fetch the server list, e.g. after a `NotLeader` rejection.
    pub async fn refresh(&self) -> Result<()> {
        let servers = self.resolver.resolve().await?;
        let picker = Arc::new(build_picker(&servers));
        match self.picker.write() {
            Ok(mut guard) => *guard = picker,
            Err(poisoned) => *poisoned.into_inner() = picker,
        }
        Ok(())
    }

    fn pick(&self, method: &str) -> Result<Arc<ServerConn>> {
        let picker = match self.picker.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        };
        picker.pick(method)
    }

    pub async fn produce(&self, value: impl Into<Bytes>) -> Result<u64> {
        let conn = self.pick(methods::PRODUCE)?;
        let req = ProduceRequest {
            record: Some(Record::new(value)),
        };
        let (op, body) = conn.call(Opcode::Produce, &req).await?;
        match op {
            Opcode::ProduceOk => Ok(ProduceResponse::decode(body)?.offset),
            other => Err(rpc::decode_error(other, &body)),
        }
    }

    pub async fn consume(&self, offset: u64) -> Result<Record> {
        let conn = self.pick(methods::CONSUME)?;
        let (op, body) = conn.call(Opcode::Consume, &ConsumeRequest { offset }).await?;
        match op {
            Opcode::ConsumeOk => ConsumeResponse::decode(body)?
                .record
                .ok_or_else(|| QuillError::Protocol("consume response without record".into())),
            other => Err(rpc::decode_error(other, &body)),
        }
    }

    pub async fn get_servers(&self) -> Result<Vec<ServerInfo>> {
        self.resolver.resolve().await
    }

    /// Open a dedicated streaming consume from `offset`. The server keeps
    /// the stream alive past the log head and resumes as records arrive.
    pub async fn consume_stream(&self, offset: u64) -> Result<ConsumeStream> {
        let conn = self.pick(methods::CONSUME_STREAM)?;
        let mut stream = TcpStream::connect(&conn.addr).await?;
        rpc::write_message(&mut stream, Opcode::ConsumeStream, &ConsumeRequest { offset }).await?;
        debug!(
            target: "quill::client",
            addr = %conn.addr,
            offset,
            "consume stream opened"
        );
        Ok(ConsumeStream { stream })
    }
}

/// A lazy, unbounded stream of records. Dropping it cancels the server
/// side.
pub struct ConsumeStream {
    stream: TcpStream,
}

impl ConsumeStream {
    /// The next record, waiting as long as it takes for one to be
    /// committed.
    pub async fn next(&mut self) -> Result<Record> {
        let (op, body) = rpc::read_frame(&mut self.stream).await?;
        match op {
            Opcode::ConsumeOk => ConsumeResponse::decode(body)?
                .record
                .ok_or_else(|| QuillError::Protocol("stream frame without record".into())),
            other => Err(rpc::decode_error(other, &body)),
        }
    }
}

fn build_picker(servers: &[ServerInfo]) -> Picker<Arc<ServerConn>> {
    Picker::new(
        servers
            .iter()
            .map(|s| (ServerConn::new(s.addr.clone()), s.is_leader)),
    )
}
