//! Protobuf message types shared by storage, replication and the RPC
//! surface. The encoding is stable: records are persisted to store files
//! and streamed through snapshots in exactly this form.

use bytes::Bytes;
use prost::Message;

/// The unit clients produce and consume. `offset` is assigned by the log at
/// commit time and is embedded in the persisted payload. `term` and
/// `record_type` are only meaningful for records carrying Raft entries.
#[derive(Clone, PartialEq, Message)]
pub struct Record {
    #[prost(bytes = "bytes", tag = "1")]
    pub value: Bytes,
    #[prost(uint64, tag = "2")]
    pub offset: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(uint32, tag = "4")]
    pub record_type: u32,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ProduceRequest {
    #[prost(message, optional, tag = "1")]
    pub record: Option<Record>,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct ProduceResponse {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct ConsumeRequest {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConsumeResponse {
    #[prost(message, optional, tag = "1")]
    pub record: Option<Record>,
}

/// A cluster member as reported by `GetServers`.
#[derive(Clone, PartialEq, Message)]
pub struct Server {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub rpc_addr: String,
    #[prost(bool, tag = "3")]
    pub is_leader: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetServersResponse {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<Server>,
}
