use std::path::Path;
use std::sync::Arc;

use prost::Message;
use qll_core::{QuillError, Record, Result};

use crate::config::LogConfig;
use crate::index::Index;
use crate::store::Store;

/// One store/index pair sharing a base offset.
///
/// `next_offset` is recovered from the last index entry on open, so a
/// segment is self-describing: `base_offset + last_relative + 1`, or
/// `base_offset` when the index is empty.
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    config: LogConfig,
    base_offset: u64,
    next_offset: u64,
}

impl Segment {
    pub fn open(dir: &Path, base_offset: u64, config: LogConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&dir.join(format!("{base_offset}.store")))?);
        let index = Index::open(
            &dir.join(format!("{base_offset}.index")),
            config.max_index_bytes,
        )?;

        let next_offset = match index.read_last() {
            Ok((rel, _)) => base_offset + rel as u64 + 1,
            Err(QuillError::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            index,
            config,
            base_offset,
            next_offset,
        })
    }

    /// Append a record, assigning it the segment's next offset.
    ///
    /// When the index is full the record's frame has already landed in the
    /// store; the `EndOfIndex` error tells the caller to treat the segment
    /// as full and roll. The orphaned store bytes are unreachable and
    /// harmless.
    pub fn append(&mut self, record: &mut Record) -> Result<u64> {
        let offset = self.next_offset;
        record.offset = offset;

        let encoded = record.encode_to_vec();
        let (_, pos) = self.store.append(&encoded)?;
        self.index.write((offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;

        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> Result<Record> {
        let (_, pos) = self.index.read_entry((offset - self.base_offset) as u32)?;
        let data = self.store.read(pos)?;
        let record = Record::decode(data)?;
        Ok(record)
    }

    pub fn in_range(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.next_offset
    }

    /// Whether the whole segment lies strictly below the watermark, i.e. is
    /// droppable by a head truncation at `lowest`.
    pub fn below(&self, lowest: u64) -> bool {
        self.next_offset <= lowest + 1
    }

    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    /// Drop every record at or above `offset`, rewinding `next_offset`.
    /// The caller guarantees `offset >= base_offset`.
    pub fn truncate_from(&mut self, offset: u64) {
        self.index.rewind(offset - self.base_offset);
        self.next_offset = offset.max(self.base_offset);
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Shared handle to the underlying store, kept alive by snapshot
    /// readers even if the segment is later truncated away.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    pub fn close(&mut self) -> Result<()> {
        self.store.close()?;
        self.index.close()?;
        Ok(())
    }

    pub fn remove(&mut self) -> Result<()> {
        self.store.remove()?;
        self.index.remove()?;
        Ok(())
    }
}
