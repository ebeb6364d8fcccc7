use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use qll_core::Result;

/// Width of the length prefix on every store frame.
pub const LEN_WIDTH: u64 = 8;

/// Default write-buffer capacity. Appends accumulate here before being
/// flushed, reducing `write(2)` syscalls on the hot path.
const WRITE_BUFFER_SIZE: usize = 8 * 1024;

struct StoreInner {
    writer: BufWriter<File>,
    size: u64,
}

/// Append-only byte file holding `<u64 length BE><payload>` frames.
///
/// Readers go directly to the file via positional reads, bypassing the
/// writer's buffer, so every read flushes the buffer first. All operations
/// serialize on the internal mutex.
pub struct Store {
    inner: Mutex<StoreInner>,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            inner: Mutex::new(StoreInner {
                writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
                size,
            }),
            path: path.to_path_buf(),
        })
    }

    /// Append one frame. Returns the total bytes written (prefix included)
    /// and the position the frame starts at.
    pub fn append(&self, data: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.lock();

        let pos = inner.size;
        inner.writer.write_all(&(data.len() as u64).to_be_bytes())?;
        inner.writer.write_all(data)?;

        let written = LEN_WIDTH + data.len() as u64;
        inner.size += written;

        Ok((written, pos))
    }

    /// Read the frame starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Bytes> {
        let mut inner = self.lock();
        inner.writer.flush()?;

        let file = inner.writer.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)?;

        let len = u64::from_be_bytes(len_buf);
        let mut data = vec![0u8; len as usize];
        file.read_exact_at(&mut data, pos + LEN_WIDTH)?;

        Ok(Bytes::from(data))
    }

    /// Positional read of raw bytes, flushing buffered writes first.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut inner = self.lock();
        inner.writer.flush()?;

        let n = inner.writer.get_ref().read_at(buf, offset)?;
        Ok(n)
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered writes through to the file.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Close and delete the file.
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned store mutex means a writer panicked mid-append; the
        // size bookkeeping is still consistent because it is updated after
        // the write succeeds.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAYLOAD: &[u8] = b"hello world";

    #[test]
    fn test_store_append_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("append_read.store");
        let store = Store::open(&path).unwrap();

        let want_width = PAYLOAD.len() as u64 + LEN_WIDTH;
        for i in 1..4u64 {
            let (n, pos) = store.append(PAYLOAD).unwrap();
            assert_eq!(n, want_width);
            assert_eq!(pos + n, want_width * i);
        }

        for i in 0..3u64 {
            let read = store.read(i * want_width).unwrap();
            assert_eq!(read.as_ref(), PAYLOAD);
        }
    }

    #[test]
    fn test_store_read_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("read_at.store");
        let store = Store::open(&path).unwrap();
        store.append(PAYLOAD).unwrap();

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut len_buf, 0).unwrap();
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(len_buf), PAYLOAD.len() as u64);

        let mut body = vec![0u8; PAYLOAD.len()];
        let n = store.read_at(&mut body, LEN_WIDTH).unwrap();
        assert_eq!(n, PAYLOAD.len());
        assert_eq!(&body, PAYLOAD);
    }

    #[test]
    fn test_store_reopen_recovers_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.store");

        {
            let store = Store::open(&path).unwrap();
            store.append(PAYLOAD).unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), PAYLOAD.len() as u64 + LEN_WIDTH);
        assert_eq!(store.read(0).unwrap().as_ref(), PAYLOAD);
    }
}
