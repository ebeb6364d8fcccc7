//! Peer RPC messages and their wire codec.
//!
//! Raft connections carry frames `<u8 type><u32 length LE><body>` with a
//! hand-rolled little-endian body encoding. Strings are `<u16 len><utf8>`,
//! entry batches are `<u32 count>` followed by fixed headers plus data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use qll_core::{QuillError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one peer frame. Sized for snapshot installs.
const MAX_PEER_FRAME: u32 = 1 << 30;

/// What a Raft log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A framed state-machine command.
    Command = 0,
    /// A cluster membership change.
    Configuration = 1,
    /// Leader commit barrier appended on election.
    Noop = 2,
}

impl EntryKind {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Configuration,
            2 => Self::Noop,
            _ => Self::Command,
        }
    }
}

/// One Raft log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Bytes,
}

/// A voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftServer {
    pub id: String,
    pub addr: String,
}

/// The replicated membership. Changes travel through the log as
/// `Configuration` entries and take effect when appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub servers: Vec<RaftServer>,
}

impl ClusterConfig {
    pub fn contains_id(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    pub fn addr_of(&self, id: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.addr.as_str())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let buf = serde_json::to_vec(self)
            .map_err(|e| QuillError::Codec(format!("encode cluster config: {e}")))?;
        Ok(Bytes::from(buf))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| QuillError::Codec(format!("decode cluster config: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the follower's new last index; on failure, a catch-up
    /// hint (the follower's last index).
    pub match_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub last_index: u64,
    pub last_term: u64,
    pub config: ClusterConfig,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Vote(VoteRequest),
    Append(AppendRequest),
    Snapshot(SnapshotRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Vote(VoteResponse),
    Append(AppendResponse),
    Snapshot(SnapshotResponse),
}

const MSG_VOTE_REQ: u8 = 1;
const MSG_APPEND_REQ: u8 = 2;
const MSG_SNAPSHOT_REQ: u8 = 3;
const MSG_VOTE_RESP: u8 = 11;
const MSG_APPEND_RESP: u8 = 12;
const MSG_SNAPSHOT_RESP: u8 = 13;

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(QuillError::Codec("short string header".into()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(QuillError::Codec("short string body".into()));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| QuillError::Codec(format!("bad utf8: {e}")))
}

fn put_entries(buf: &mut BytesMut, entries: &[Entry]) {
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u64_le(entry.index);
        buf.put_u64_le(entry.term);
        buf.put_u8(entry.kind as u8);
        buf.put_u32_le(entry.data.len() as u32);
        buf.put_slice(&entry.data);
    }
}

fn get_entries(buf: &mut Bytes) -> Result<Vec<Entry>> {
    if buf.remaining() < 4 {
        return Err(QuillError::Codec("short entry count".into()));
    }
    let count = buf.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if buf.remaining() < 8 + 8 + 1 + 4 {
            return Err(QuillError::Codec("short entry header".into()));
        }
        let index = buf.get_u64_le();
        let term = buf.get_u64_le();
        let kind = EntryKind::from_u32(buf.get_u8() as u32);
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(QuillError::Codec("short entry data".into()));
        }
        let data = buf.split_to(len);
        entries.push(Entry {
            index,
            term,
            kind,
            data,
        });
    }
    Ok(entries)
}

fn encode_request(req: &Request) -> (u8, BytesMut) {
    let mut buf = BytesMut::with_capacity(64);
    match req {
        Request::Vote(v) => {
            buf.put_u64_le(v.term);
            put_string(&mut buf, &v.candidate_id);
            buf.put_u64_le(v.last_log_index);
            buf.put_u64_le(v.last_log_term);
            (MSG_VOTE_REQ, buf)
        }
        Request::Append(a) => {
            buf.put_u64_le(a.term);
            put_string(&mut buf, &a.leader_id);
            buf.put_u64_le(a.prev_log_index);
            buf.put_u64_le(a.prev_log_term);
            buf.put_u64_le(a.leader_commit);
            put_entries(&mut buf, &a.entries);
            (MSG_APPEND_REQ, buf)
        }
        Request::Snapshot(s) => {
            buf.put_u64_le(s.term);
            put_string(&mut buf, &s.leader_id);
            buf.put_u64_le(s.last_index);
            buf.put_u64_le(s.last_term);
            let config = s.config.encode().unwrap_or_default();
            buf.put_u32_le(config.len() as u32);
            buf.put_slice(&config);
            buf.put_u64_le(s.data.len() as u64);
            buf.put_slice(&s.data);
            (MSG_SNAPSHOT_REQ, buf)
        }
    }
}

fn decode_request(kind: u8, mut buf: Bytes) -> Result<Request> {
    match kind {
        MSG_VOTE_REQ => {
            if buf.remaining() < 8 {
                return Err(QuillError::Codec("short vote request".into()));
            }
            let term = buf.get_u64_le();
            let candidate_id = get_string(&mut buf)?;
            if buf.remaining() < 16 {
                return Err(QuillError::Codec("short vote request".into()));
            }
            Ok(Request::Vote(VoteRequest {
                term,
                candidate_id,
                last_log_index: buf.get_u64_le(),
                last_log_term: buf.get_u64_le(),
            }))
        }
        MSG_APPEND_REQ => {
            if buf.remaining() < 8 {
                return Err(QuillError::Codec("short append request".into()));
            }
            let term = buf.get_u64_le();
            let leader_id = get_string(&mut buf)?;
            if buf.remaining() < 24 {
                return Err(QuillError::Codec("short append request".into()));
            }
            let prev_log_index = buf.get_u64_le();
            let prev_log_term = buf.get_u64_le();
            let leader_commit = buf.get_u64_le();
            let entries = get_entries(&mut buf)?;
            Ok(Request::Append(AppendRequest {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            }))
        }
        MSG_SNAPSHOT_REQ => {
            if buf.remaining() < 8 {
                return Err(QuillError::Codec("short snapshot request".into()));
            }
            let term = buf.get_u64_le();
            let leader_id = get_string(&mut buf)?;
            if buf.remaining() < 16 {
                return Err(QuillError::Codec("short snapshot request".into()));
            }
            let last_index = buf.get_u64_le();
            let last_term = buf.get_u64_le();
            if buf.remaining() < 4 {
                return Err(QuillError::Codec("short snapshot config".into()));
            }
            let config_len = buf.get_u32_le() as usize;
            if buf.remaining() < config_len {
                return Err(QuillError::Codec("short snapshot config".into()));
            }
            let config = ClusterConfig::decode(&buf.split_to(config_len))?;
            if buf.remaining() < 8 {
                return Err(QuillError::Codec("short snapshot data".into()));
            }
            let data_len = buf.get_u64_le() as usize;
            if buf.remaining() < data_len {
                return Err(QuillError::Codec("short snapshot data".into()));
            }
            let data = buf.split_to(data_len);
            Ok(Request::Snapshot(SnapshotRequest {
                term,
                leader_id,
                last_index,
                last_term,
                config,
                data,
            }))
        }
        other => Err(QuillError::Codec(format!("unknown request type {other}"))),
    }
}

fn encode_response(resp: &Response) -> (u8, BytesMut) {
    let mut buf = BytesMut::with_capacity(32);
    match resp {
        Response::Vote(v) => {
            buf.put_u64_le(v.term);
            buf.put_u8(v.granted as u8);
            (MSG_VOTE_RESP, buf)
        }
        Response::Append(a) => {
            buf.put_u64_le(a.term);
            buf.put_u8(a.success as u8);
            buf.put_u64_le(a.match_index);
            (MSG_APPEND_RESP, buf)
        }
        Response::Snapshot(s) => {
            buf.put_u64_le(s.term);
            buf.put_u8(s.success as u8);
            (MSG_SNAPSHOT_RESP, buf)
        }
    }
}

fn decode_response(kind: u8, mut buf: Bytes) -> Result<Response> {
    match kind {
        MSG_VOTE_RESP => {
            if buf.remaining() < 9 {
                return Err(QuillError::Codec("short vote response".into()));
            }
            Ok(Response::Vote(VoteResponse {
                term: buf.get_u64_le(),
                granted: buf.get_u8() != 0,
            }))
        }
        MSG_APPEND_RESP => {
            if buf.remaining() < 17 {
                return Err(QuillError::Codec("short append response".into()));
            }
            Ok(Response::Append(AppendResponse {
                term: buf.get_u64_le(),
                success: buf.get_u8() != 0,
                match_index: buf.get_u64_le(),
            }))
        }
        MSG_SNAPSHOT_RESP => {
            if buf.remaining() < 9 {
                return Err(QuillError::Codec("short snapshot response".into()));
            }
            Ok(Response::Snapshot(SnapshotResponse {
                term: buf.get_u64_le(),
                success: buf.get_u8() != 0,
            }))
        }
        other => Err(QuillError::Codec(format!("unknown response type {other}"))),
    }
}

async fn write_frame<W>(w: &mut W, kind: u8, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(kind).await?;
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R>(r: &mut R) -> Result<(u8, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let kind = r.read_u8().await?;
    let len = r.read_u32_le().await?;
    if len > MAX_PEER_FRAME {
        return Err(QuillError::Codec(format!("peer frame of {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok((kind, Bytes::from(body)))
}

pub async fn write_request<W: AsyncWrite + Unpin>(w: &mut W, req: &Request) -> Result<()> {
    let (kind, body) = encode_request(req);
    write_frame(w, kind, &body).await
}

pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request> {
    let (kind, body) = read_frame(r).await?;
    decode_request(kind, body)
}

pub async fn write_response<W: AsyncWrite + Unpin>(w: &mut W, resp: &Response) -> Result<()> {
    let (kind, body) = encode_response(resp);
    write_frame(w, kind, &body).await
}

pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Response> {
    let (kind, body) = read_frame(r).await?;
    decode_response(kind, body)
}
