use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use qll_core::{QuillError, Result};

/// Width of one index entry: `<u32 relative offset BE><u64 position BE>`.
pub const ENTRY_WIDTH: u64 = 12;

const OFF_WIDTH: usize = 4;

/// Fixed-width table mapping relative offsets to store positions.
///
/// The file is pre-grown to its configured maximum before mapping (a mmap
/// needs a fixed extent) and truncated back to the logical size on close so
/// the entry count is recoverable from file size alone on reopen. While the
/// index is open, `size` is authoritative; the file tail past it is zeroed
/// slack.
pub struct Index {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    size: u64,
}

impl Index {
    pub fn open(path: &Path, max_index_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;

        // SAFETY: the file stays open and is never resized while mapped;
        // rolling segments is the only way an index grows past its cap.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Read the entry at `rel`. Fails with `EndOfIndex` when the index is
    /// empty or `rel` is past the last entry.
    pub fn read_entry(&self, rel: u32) -> Result<(u32, u64)> {
        let start = rel as u64 * ENTRY_WIDTH;
        if self.size < start + ENTRY_WIDTH {
            return Err(QuillError::EndOfIndex);
        }

        let entry = &self.mmap[start as usize..(start + ENTRY_WIDTH) as usize];
        let off = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let pos = u64::from_be_bytes([
            entry[4], entry[5], entry[6], entry[7], entry[8], entry[9], entry[10], entry[11],
        ]);

        Ok((off, pos))
    }

    /// Read the last entry. Fails with `EndOfIndex` when empty.
    pub fn read_last(&self) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Err(QuillError::EndOfIndex);
        }
        self.read_entry((self.size / ENTRY_WIDTH - 1) as u32)
    }

    /// Append an entry at the tail. Fails with `EndOfIndex` when the map has
    /// no room left; that is the signal to roll the segment.
    pub fn write(&mut self, rel: u32, pos: u64) -> Result<()> {
        if (self.mmap.len() as u64) < self.size + ENTRY_WIDTH {
            return Err(QuillError::EndOfIndex);
        }

        let start = self.size as usize;
        self.mmap[start..start + OFF_WIDTH].copy_from_slice(&rel.to_be_bytes());
        self.mmap[start + OFF_WIDTH..start + ENTRY_WIDTH as usize]
            .copy_from_slice(&pos.to_be_bytes());
        self.size += ENTRY_WIDTH;

        Ok(())
    }

    /// Shrink the logical size back to `entries` entries. Store bytes the
    /// dropped entries pointed at become unreachable; the store itself is
    /// append-only and never rewritten.
    pub fn rewind(&mut self, entries: u64) {
        let new_size = entries * ENTRY_WIDTH;
        if new_size < self.size {
            self.size = new_size;
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the map and the file, then truncate back to the logical size.
    pub fn close(&mut self) -> Result<()> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn remove(&mut self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("write_read.index");
        let mut index = Index::open(&path, ENTRY_WIDTH * 4).unwrap();

        assert!(matches!(index.read_last(), Err(QuillError::EndOfIndex)));

        let entries = [(0u32, 0u64), (1, 10)];
        for (off, pos) in entries {
            index.write(off, pos).unwrap();
            let (got_off, got_pos) = index.read_entry(off).unwrap();
            assert_eq!(got_off, off);
            assert_eq!(got_pos, pos);
        }

        assert_eq!(index.read_last().unwrap(), (1, 10));
        assert!(matches!(
            index.read_entry(2),
            Err(QuillError::EndOfIndex)
        ));
    }

    #[test]
    fn test_index_write_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.index");
        let mut index = Index::open(&path, ENTRY_WIDTH * 2).unwrap();

        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        assert!(matches!(index.write(2, 20), Err(QuillError::EndOfIndex)));
    }

    #[test]
    fn test_index_close_truncates_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.index");
        let max = ENTRY_WIDTH * 8;

        {
            let mut index = Index::open(&path, max).unwrap();
            index.write(0, 0).unwrap();
            index.write(1, 10).unwrap();
            index.close().unwrap();
        }

        // Closed file holds exactly the written entries.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            ENTRY_WIDTH * 2
        );

        let index = Index::open(&path, max).unwrap();
        assert_eq!(index.entries(), 2);
        assert_eq!(index.read_last().unwrap(), (1, 10));
    }

    #[test]
    fn test_index_rewind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rewind.index");
        let mut index = Index::open(&path, ENTRY_WIDTH * 4).unwrap();

        for i in 0..3u32 {
            index.write(i, i as u64 * 10).unwrap();
        }

        index.rewind(1);
        assert_eq!(index.entries(), 1);
        assert_eq!(index.read_last().unwrap(), (0, 0));

        // Rewinding never grows the index.
        index.rewind(5);
        assert_eq!(index.entries(), 1);

        index.write(1, 10).unwrap();
        assert_eq!(index.read_last().unwrap(), (1, 10));
    }
}
