//! Client RPC wire framing.
//!
//! Every client request and response is a frame
//! `<u8 opcode><u32 length BE><protobuf body>`. Opcodes start at `0x10` so
//! the first byte of a client connection can never collide with the `0x01`
//! Raft marker the stream multiplexer routes on.

use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{QuillError, Result};

/// Upper bound on a single frame body. A corrupted or hostile length field
/// must not drive allocation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Produce = 0x10,
    Consume = 0x11,
    ConsumeStream = 0x12,
    GetServers = 0x13,
    ProduceOk = 0x21,
    ConsumeOk = 0x22,
    Servers = 0x23,
    OutOfRange = 0x2e,
    Error = 0x2f,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0x10 => Self::Produce,
            0x11 => Self::Consume,
            0x12 => Self::ConsumeStream,
            0x13 => Self::GetServers,
            0x21 => Self::ProduceOk,
            0x22 => Self::ConsumeOk,
            0x23 => Self::Servers,
            0x2e => Self::OutOfRange,
            0x2f => Self::Error,
            other => {
                return Err(QuillError::Protocol(format!(
                    "unknown rpc opcode {other:#04x}"
                )))
            }
        })
    }
}

/// Write one frame with a protobuf body.
pub async fn write_message<W, M>(w: &mut W, op: Opcode, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let body = msg.encode_to_vec();
    write_raw(w, op, &body).await
}

/// Write one frame with a raw body (used for error strings and empty
/// requests).
pub async fn write_raw<W>(w: &mut W, op: Opcode, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(QuillError::Protocol(format!(
            "frame body of {} bytes exceeds maximum",
            body.len()
        )));
    }

    w.write_u8(op as u8).await?;
    w.write_u32(body.len() as u32).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame. Validates the length field before allocating.
pub async fn read_frame<R>(r: &mut R) -> Result<(Opcode, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let op = Opcode::from_u8(r.read_u8().await?)?;
    let len = r.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(QuillError::Protocol(format!(
            "frame length {len} exceeds maximum"
        )));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok((op, Bytes::from(body)))
}

/// Marker body for a `NotLeader` error frame, so clients can re-resolve.
const NOT_LEADER: &[u8] = b"not-leader";

/// Write an error as its distinguished frame: out-of-range carries the
/// requested offset, not-leader carries a recognizable marker, everything
/// else is a message string.
pub async fn write_error<W>(w: &mut W, err: &QuillError) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match err {
        QuillError::OffsetOutOfRange { offset } => {
            let body = crate::record::ConsumeRequest { offset: *offset };
            write_message(w, Opcode::OutOfRange, &body).await
        }
        QuillError::NotLeader => write_raw(w, Opcode::Error, NOT_LEADER).await,
        other => write_raw(w, Opcode::Error, other.to_string().as_bytes()).await,
    }
}

/// Decode an error frame back into the typed error it carried.
pub fn decode_error(op: Opcode, body: &Bytes) -> QuillError {
    match op {
        Opcode::OutOfRange => match crate::record::ConsumeRequest::decode(body.clone()) {
            Ok(req) => QuillError::OffsetOutOfRange { offset: req.offset },
            Err(e) => QuillError::Codec(e.to_string()),
        },
        _ if body.as_ref() == NOT_LEADER => QuillError::NotLeader,
        _ => QuillError::Protocol(String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::ProduceRequest;
    use crate::Record;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let req = ProduceRequest {
            record: Some(Record::new(&b"payload"[..])),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, Opcode::Produce, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (op, body) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(op, Opcode::Produce);

        let decoded = ProduceRequest::decode(body).unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.push(Opcode::Produce as u8);
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, QuillError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let mut cursor = std::io::Cursor::new(vec![0x01u8, 0, 0, 0, 0]);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, QuillError::Protocol(_)));
    }
}
