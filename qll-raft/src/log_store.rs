use std::path::Path;

use qll_core::{Record, Result};
use qll_storage::{Log, LogConfig};

use crate::wire::{Entry, EntryKind};

/// Raft's log-entry store, backed by the same segmented log machinery that
/// stores application records. Raft indices are 1-based, so the log is
/// opened with an initial offset of 1 and offsets coincide with indices.
pub struct RaftLogStore {
    log: Log,
}

impl RaftLogStore {
    pub fn open(dir: &Path, mut config: LogConfig) -> Result<Self> {
        config.initial_offset = 1;
        Ok(Self {
            log: Log::open(dir, config)?,
        })
    }

    /// First index present, 1 when the log has never been compacted.
    pub fn first_index(&self) -> u64 {
        self.log.lowest_offset()
    }

    /// Last index present, 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.log.highest_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    pub fn get(&self, index: u64) -> Result<Entry> {
        let record = self.log.read(index)?;
        Ok(entry_from_record(record))
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).ok().map(|e| e.term)
    }

    /// Append entries whose indices continue the log. Offset assignment by
    /// the segmented log reproduces each entry's index by construction.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            let mut record = Record {
                value: entry.data.clone(),
                offset: 0,
                term: entry.term,
                record_type: entry.kind.as_u32(),
            };
            let assigned = self.log.append(&mut record)?;
            debug_assert_eq!(assigned, entry.index);
        }
        Ok(())
    }

    /// Drop every entry at or above `from` (follower conflict repair).
    pub fn truncate_tail(&self, from: u64) -> Result<()> {
        self.log.truncate_from(from)
    }

    /// Drop every entry at or below `max` (post-snapshot compaction). Whole
    /// segments only; entries sharing a segment with live ones survive.
    pub fn compact(&self, max: u64) -> Result<()> {
        self.log.truncate(max)
    }

    /// Start over with an empty log whose next index is `index + 1`. Used
    /// after installing a snapshot covering everything up to `index`.
    pub fn reset_after(&self, index: u64) -> Result<()> {
        self.log.reset_with_offset(index + 1)
    }

    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}

fn entry_from_record(record: Record) -> Entry {
    Entry {
        index: record.offset,
        term: record.term,
        kind: EntryKind::from_u32(record.record_type),
        data: record.value,
    }
}
