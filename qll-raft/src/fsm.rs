use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use qll_core::{ProduceRequest, ProduceResponse, QuillError, Result};
use qll_storage::Log;
use tracing::info;

/// Command discriminator: the first byte of every framed state-machine
/// command.
pub const APPEND_REQUEST: u8 = 0;

/// The deterministic state machine Raft drives. Apply runs only on the
/// single consensus driver task; implementations never see concurrent
/// calls.
pub trait Fsm: Send + 'static {
    /// Apply one committed command and return its response payload. An
    /// error becomes the proposer's response; the entry stays committed.
    fn apply(&self, data: &[u8]) -> Result<Bytes>;

    /// A reader over the entire current state, streamed into snapshots.
    fn snapshot(&self) -> Result<Box<dyn Read + Send>>;

    /// Replace the entire state from a snapshot stream.
    fn restore(&self, reader: &mut dyn Read) -> Result<()>;
}

/// The application log as a state machine: applying an append command
/// assigns the next offset and persists the record locally.
pub struct LogFsm {
    log: Arc<Log>,
}

impl LogFsm {
    pub fn new(log: Arc<Log>) -> Self {
        Self { log }
    }

    fn apply_append(&self, body: &[u8]) -> Result<Bytes> {
        let req = ProduceRequest::decode(body)?;
        let mut record = req
            .record
            .ok_or_else(|| QuillError::Protocol("append command without a record".into()))?;

        let offset = self.log.append(&mut record)?;
        let resp = ProduceResponse { offset };
        Ok(Bytes::from(resp.encode_to_vec()))
    }
}

impl Fsm for LogFsm {
    fn apply(&self, data: &[u8]) -> Result<Bytes> {
        let Some((&request_type, body)) = data.split_first() else {
            return Err(QuillError::Protocol("empty command".into()));
        };

        match request_type {
            APPEND_REQUEST => self.apply_append(body),
            other => Err(QuillError::Protocol(format!(
                "unknown command type {other}"
            ))),
        }
    }

    fn snapshot(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.log.reader()))
    }

    /// Iterate `<u64 length><Record>` frames. The first record's embedded
    /// offset dictates where the restored log begins; every record is then
    /// re-appended, which reproduces the embedded offsets because the
    /// stream is contiguous.
    fn restore(&self, reader: &mut dyn Read) -> Result<()> {
        let mut first = true;
        let mut restored = 0u64;

        while let Some(frame) = read_snapshot_frame(reader)? {
            let mut record = qll_core::Record::decode(frame.as_slice())?;
            if first {
                self.log.reset_with_offset(record.offset)?;
                first = false;
            }
            self.log.append(&mut record)?;
            restored += 1;
        }

        info!(
            target: "quill::raft",
            records = restored,
            "restored state machine from snapshot"
        );
        Ok(())
    }
}

/// Read one `<u64 length BE><payload>` frame, or `None` at a clean end of
/// stream. A truncated frame is an error.
fn read_snapshot_frame(reader: &mut dyn Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 8];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(QuillError::Protocol("truncated snapshot frame".into()));
        }
        filled += n;
    }

    let len = u64::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use qll_core::Record;
    use qll_storage::LogConfig;
    use tempfile::tempdir;

    fn fsm(dir: &std::path::Path) -> LogFsm {
        let log = Arc::new(Log::open(dir, LogConfig::default()).unwrap());
        LogFsm::new(log)
    }

    fn append_command(value: &'static [u8]) -> Vec<u8> {
        let req = ProduceRequest {
            record: Some(Record::new(value)),
        };
        let mut data = vec![APPEND_REQUEST];
        data.extend(req.encode_to_vec());
        data
    }

    #[test]
    fn test_apply_append_assigns_offsets() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());

        for want in 0..3u64 {
            let resp_bytes = fsm.apply(&append_command(b"value")).unwrap();
            let resp = ProduceResponse::decode(resp_bytes).unwrap();
            assert_eq!(resp.offset, want);
        }

        assert_eq!(fsm.log.read(2).unwrap().value.as_ref(), b"value");
    }

    #[test]
    fn test_apply_rejects_unknown_command() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());
        assert!(fsm.apply(&[0xFF, 1, 2, 3]).is_err());
        assert!(fsm.apply(&[]).is_err());
    }

    #[test]
    fn test_snapshot_restore_preserves_offsets() {
        let src_dir = tempdir().unwrap();
        let src = fsm(src_dir.path());
        for _ in 0..4 {
            src.apply(&append_command(b"carried")).unwrap();
        }

        let mut snapshot = src.snapshot().unwrap();

        let dst_dir = tempdir().unwrap();
        let dst = fsm(dst_dir.path());
        // Pre-existing state is replaced wholesale.
        dst.apply(&append_command(b"stale")).unwrap();

        dst.restore(&mut snapshot).unwrap();

        assert_eq!(dst.log.lowest_offset(), 0);
        assert_eq!(dst.log.highest_offset(), 3);
        for offset in 0..4 {
            let record = dst.log.read(offset).unwrap();
            assert_eq!(record.offset, offset);
            assert_eq!(record.value.as_ref(), b"carried");
        }
    }

    #[test]
    fn test_restore_starts_at_first_record_offset() {
        // Build a source log that begins at a non-zero offset, as after
        // truncation on a long-lived cluster.
        let src_dir = tempdir().unwrap();
        let src_log = Arc::new(
            Log::open(
                src_dir.path(),
                LogConfig {
                    initial_offset: 40,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let src = LogFsm::new(Arc::clone(&src_log));
        for _ in 0..2 {
            src.apply(&append_command(b"shifted")).unwrap();
        }

        let mut snapshot = src.snapshot().unwrap();
        let dst_dir = tempdir().unwrap();
        let dst = fsm(dst_dir.path());
        dst.restore(&mut snapshot).unwrap();

        assert_eq!(dst.log.lowest_offset(), 40);
        assert_eq!(dst.log.highest_offset(), 41);
    }
}
