//! The thin RPC adapter above the replicated log.
//!
//! Serves Produce, Consume, ConsumeStream and GetServers over the framed
//! protocol, against two narrow capabilities so tests can run it over an
//! in-memory log.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use qll_core::rpc::{self, Opcode};
use qll_core::{
    ConsumeRequest, ConsumeResponse, ProduceRequest, ProduceResponse, QuillError, Record, Result,
    Server,
};
use qll_transport::NodeStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Pause between polls when a streaming consumer is caught up with the
/// log head.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Append/read capability the RPC layer needs from the log.
pub trait CommitLog: Send + Sync + 'static {
    fn append(&self, record: Record) -> impl Future<Output = Result<u64>> + Send;
    fn read(&self, offset: u64) -> Result<Record>;
}

/// Server-listing capability, answered by any member.
pub trait GetServerer: Send + Sync + 'static {
    fn get_servers(&self) -> impl Future<Output = Result<Vec<Server>>> + Send;
}

/// Accept RPC connections from the multiplexer until shutdown, one handler
/// task per connection.
pub async fn serve<L>(
    mut rpc_rx: mpsc::Receiver<NodeStream>,
    log: Arc<L>,
    mut shutdown: broadcast::Receiver<()>,
) where
    L: CommitLog + GetServerer,
{
    loop {
        tokio::select! {
            Some(conn) = rpc_rx.recv() => {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    handle_conn(conn, log).await;
                });
            }
            _ = shutdown.recv() => {
                info!(target: "quill::server", "rpc server stopping");
                break;
            }
        }
    }
}

/// Serve one connection: sequential request/response frames, except
/// ConsumeStream which takes the connection over until the client hangs
/// up.
pub async fn handle_conn<S, L>(mut conn: S, log: Arc<L>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    L: CommitLog + GetServerer,
{
    loop {
        let (op, body) = match rpc::read_frame(&mut conn).await {
            Ok(frame) => frame,
            Err(_) => return,
        };

        let outcome = match op {
            Opcode::Produce => handle_produce(&mut conn, log.as_ref(), &body).await,
            Opcode::Consume => handle_consume(&mut conn, log.as_ref(), &body).await,
            Opcode::GetServers => handle_get_servers(&mut conn, log.as_ref()).await,
            Opcode::ConsumeStream => {
                handle_consume_stream(&mut conn, log.as_ref(), &body).await;
                return;
            }
            other => {
                let err = QuillError::Protocol(format!("unexpected request {other:?}"));
                rpc::write_error(&mut conn, &err).await
            }
        };

        if outcome.is_err() {
            return;
        }
    }
}

async fn handle_produce<S, L>(conn: &mut S, log: &L, body: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    L: CommitLog,
{
    let record = match ProduceRequest::decode(body) {
        Ok(req) => req.record.unwrap_or_default(),
        Err(e) => return rpc::write_error(conn, &e.into()).await,
    };

    match log.append(record).await {
        Ok(offset) => rpc::write_message(conn, Opcode::ProduceOk, &ProduceResponse { offset }).await,
        Err(e) => rpc::write_error(conn, &e).await,
    }
}

async fn handle_consume<S, L>(conn: &mut S, log: &L, body: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    L: CommitLog,
{
    let offset = match ConsumeRequest::decode(body) {
        Ok(req) => req.offset,
        Err(e) => return rpc::write_error(conn, &e.into()).await,
    };

    match log.read(offset) {
        Ok(record) => {
            let resp = ConsumeResponse {
                record: Some(record),
            };
            rpc::write_message(conn, Opcode::ConsumeOk, &resp).await
        }
        Err(e) => rpc::write_error(conn, &e).await,
    }
}

async fn handle_get_servers<S, L>(conn: &mut S, log: &L) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    L: GetServerer,
{
    match log.get_servers().await {
        Ok(servers) => {
            let resp = qll_core::GetServersResponse { servers };
            rpc::write_message(conn, Opcode::Servers, &resp).await
        }
        Err(e) => rpc::write_error(conn, &e).await,
    }
}

/// Stream records from `offset` onward. Reading past the head does not end
/// the stream: the handler polls until new records commit, advancing the
/// offset after every successful send. The loop ends when the client goes
/// away (the next write fails).
async fn handle_consume_stream<S, L>(conn: &mut S, log: &L, body: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    L: CommitLog,
{
    let mut offset = match ConsumeRequest::decode(body) {
        Ok(req) => req.offset,
        Err(e) => {
            let _ = rpc::write_error(conn, &e.into()).await;
            return;
        }
    };

    debug!(target: "quill::server", offset, "consume stream started");
    loop {
        match log.read(offset) {
            Ok(record) => {
                let resp = ConsumeResponse {
                    record: Some(record),
                };
                if rpc::write_message(conn, Opcode::ConsumeOk, &resp)
                    .await
                    .is_err()
                {
                    return;
                }
                offset += 1;
            }
            Err(QuillError::OffsetOutOfRange { .. }) => {
                tokio::time::sleep(STREAM_POLL_INTERVAL).await;
            }
            Err(e) => {
                let _ = rpc::write_error(conn, &e).await;
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory stand-in for the replicated log, per the narrow
    /// capability seams.
    #[derive(Default)]
    struct InMemoryLog {
        records: Mutex<Vec<Record>>,
    }

    impl CommitLog for InMemoryLog {
        async fn append(&self, mut record: Record) -> Result<u64> {
            let mut records = self.records.lock().unwrap();
            let offset = records.len() as u64;
            record.offset = offset;
            records.push(record);
            Ok(offset)
        }

        fn read(&self, offset: u64) -> Result<Record> {
            self.records
                .lock()
                .unwrap()
                .get(offset as usize)
                .cloned()
                .ok_or(QuillError::OffsetOutOfRange { offset })
        }
    }

    impl GetServerer for InMemoryLog {
        async fn get_servers(&self) -> Result<Vec<Server>> {
            Ok(vec![Server {
                id: "in-memory".into(),
                rpc_addr: "127.0.0.1:0".into(),
                is_leader: true,
            }])
        }
    }

    #[tokio::test]
    async fn test_produce_then_consume() {
        let log = Arc::new(InMemoryLog::default());
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_conn(server, Arc::clone(&log)));

        let mut client = client;
        let req = ProduceRequest {
            record: Some(Record::new(&b"hello world"[..])),
        };
        rpc::write_message(&mut client, Opcode::Produce, &req)
            .await
            .unwrap();
        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert_eq!(op, Opcode::ProduceOk);
        assert_eq!(ProduceResponse::decode(body).unwrap().offset, 0);

        rpc::write_message(&mut client, Opcode::Consume, &ConsumeRequest { offset: 0 })
            .await
            .unwrap();
        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert_eq!(op, Opcode::ConsumeOk);
        let record = ConsumeResponse::decode(body).unwrap().record.unwrap();
        assert_eq!(record.value.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_consume_past_tail_is_out_of_range() {
        let log = Arc::new(InMemoryLog::default());
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_conn(server, log));

        let mut client = client;
        rpc::write_message(&mut client, Opcode::Consume, &ConsumeRequest { offset: 1000 })
            .await
            .unwrap();
        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert_eq!(op, Opcode::OutOfRange);
        match rpc::decode_error(op, &body) {
            QuillError::OffsetOutOfRange { offset } => assert_eq!(offset, 1000),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_consume_stream_waits_for_new_records() {
        let log = Arc::new(InMemoryLog::default());
        log.append(Record::new(&b"existing"[..])).await.unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_conn(server, Arc::clone(&log)));

        let mut client = client;
        rpc::write_message(
            &mut client,
            Opcode::ConsumeStream,
            &ConsumeRequest { offset: 0 },
        )
        .await
        .unwrap();

        // The existing record arrives immediately.
        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert_eq!(op, Opcode::ConsumeOk);
        let record = ConsumeResponse::decode(body).unwrap().record.unwrap();
        assert_eq!(record.value.as_ref(), b"existing");

        // The stream stays open past the head and resumes once a new
        // record lands.
        let appender = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            appender.append(Record::new(&b"late arrival"[..])).await.unwrap();
        });

        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert_eq!(op, Opcode::ConsumeOk);
        let record = ConsumeResponse::decode(body).unwrap().record.unwrap();
        assert_eq!(record.value.as_ref(), b"late arrival");
        assert_eq!(record.offset, 1);
    }

    #[tokio::test]
    async fn test_get_servers() {
        let log = Arc::new(InMemoryLog::default());
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_conn(server, log));

        let mut client = client;
        rpc::write_raw(&mut client, Opcode::GetServers, &[]).await.unwrap();
        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert_eq!(op, Opcode::Servers);
        let resp = qll_core::GetServersResponse::decode(body).unwrap();
        assert_eq!(resp.servers.len(), 1);
        assert!(resp.servers[0].is_leader);
    }

    #[tokio::test]
    async fn test_not_leader_crosses_the_wire() {
        struct FollowerLog;
        impl CommitLog for FollowerLog {
            async fn append(&self, _record: Record) -> Result<u64> {
                Err(QuillError::NotLeader)
            }
            fn read(&self, offset: u64) -> Result<Record> {
                Err(QuillError::OffsetOutOfRange { offset })
            }
        }
        impl GetServerer for FollowerLog {
            async fn get_servers(&self) -> Result<Vec<Server>> {
                Ok(Vec::new())
            }
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_conn(server, Arc::new(FollowerLog)));

        let mut client = client;
        let req = ProduceRequest {
            record: Some(Record::new(&b"nope"[..])),
        };
        rpc::write_message(&mut client, Opcode::Produce, &req)
            .await
            .unwrap();
        let (op, body) = rpc::read_frame(&mut client).await.unwrap();
        assert!(matches!(
            rpc::decode_error(op, &body),
            QuillError::NotLeader
        ));
    }
}
