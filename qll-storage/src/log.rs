use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use qll_core::{QuillError, Record, Result};
use tracing::{debug, info};

use crate::config::LogConfig;
use crate::segment::Segment;
use crate::store::Store;

struct LogState {
    config: LogConfig,
    segments: Vec<Segment>,
}

/// Ordered collection of segments covering a contiguous half-open offset
/// range. Appends target the last (active) segment; reads find the segment
/// covering the requested offset.
///
/// A single read/write lock guards the segment list: appends, truncations
/// and resets serialize, reads run concurrently with each other.
pub struct Log {
    dir: PathBuf,
    state: RwLock<LogState>,
}

impl Log {
    pub fn open(dir: &Path, config: LogConfig) -> Result<Self> {
        let config = config.with_defaults();
        std::fs::create_dir_all(dir)?;

        let mut state = LogState {
            config,
            segments: Vec::new(),
        };
        Self::setup(dir, &mut state)?;

        info!(
            target: "quill::storage",
            dir = %dir.display(),
            segments = state.segments.len(),
            next_offset = state.segments.last().map(Segment::next_offset).unwrap_or(0),
            "log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Scan the directory for `<base>.store`/`<base>.index` pairs and open a
    /// segment per base, oldest first. An empty directory gets one fresh
    /// segment at the configured initial offset.
    fn setup(dir: &Path, state: &mut LogState) -> Result<()> {
        let mut bases = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(base) = stem.parse::<u64>() else {
                continue;
            };
            bases.insert(base);
        }

        for base in bases {
            state.segments.push(Segment::open(dir, base, state.config)?);
        }

        if state.segments.is_empty() {
            state
                .segments
                .push(Segment::open(dir, state.config.initial_offset, state.config)?);
        }

        Ok(())
    }

    /// Append a record to the active segment, assigning it the next offset.
    /// Rolls to a fresh segment at `offset + 1` once the active segment is
    /// full; a full index mid-append rolls immediately and retries once.
    pub fn append(&self, record: &mut Record) -> Result<u64> {
        let mut state = self.write_state();
        let config = state.config;
        let dir = self.dir.clone();

        let active = Self::active(&mut state);
        let offset = match active.append(record) {
            Ok(offset) => offset,
            Err(QuillError::EndOfIndex) => {
                // The record's frame is already in the old store but has no
                // index entry; the fresh segment re-appends it cleanly.
                let next = active.next_offset();
                debug!(
                    target: "quill::storage",
                    base = next,
                    "index full, rolling segment"
                );
                state.segments.push(Segment::open(&dir, next, config)?);
                Self::active(&mut state).append(record)?
            }
            Err(e) => return Err(e),
        };

        if Self::active(&mut state).is_maxed() {
            debug!(target: "quill::storage", base = offset + 1, "segment maxed, rolling");
            state.segments.push(Segment::open(&dir, offset + 1, config)?);
        }

        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> Result<Record> {
        let state = self.read_state();
        let segment = state
            .segments
            .iter()
            .find(|s| s.in_range(offset))
            .ok_or(QuillError::OffsetOutOfRange { offset })?;
        segment.read(offset)
    }

    /// A reader over every segment's raw store bytes, in order, each from
    /// position zero. This is the snapshot stream: a concatenation of
    /// `<u64 length><record>` frames.
    pub fn reader(&self) -> LogReader {
        let state = self.read_state();
        LogReader {
            stores: state.segments.iter().map(Segment::store).collect(),
            current: 0,
            pos: 0,
        }
    }

    /// Drop every segment that lies entirely below `lowest`, removing its
    /// files.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut state = self.write_state();
        let config = state.config;

        let mut kept = Vec::with_capacity(state.segments.len());
        for mut segment in state.segments.drain(..) {
            if segment.below(lowest) {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        state.segments = kept;

        // Never leave the log without an active segment.
        if state.segments.is_empty() {
            state
                .segments
                .push(Segment::open(&self.dir, lowest + 1, config)?);
        }

        Ok(())
    }

    /// Drop every record at or above `offset`: later segments are deleted
    /// outright, and the boundary segment is rewound in place.
    pub fn truncate_from(&self, offset: u64) -> Result<()> {
        let mut state = self.write_state();
        let config = state.config;

        let mut kept = Vec::with_capacity(state.segments.len());
        for mut segment in state.segments.drain(..) {
            if segment.base_offset() >= offset {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        state.segments = kept;

        if let Some(last) = state.segments.last_mut() {
            if last.next_offset() > offset {
                last.truncate_from(offset);
            }
        } else {
            state
                .segments
                .push(Segment::open(&self.dir, offset.max(config.initial_offset), config)?);
        }

        Ok(())
    }

    pub fn lowest_offset(&self) -> u64 {
        let state = self.read_state();
        state.segments.first().map(Segment::base_offset).unwrap_or(0)
    }

    pub fn highest_offset(&self) -> u64 {
        let state = self.read_state();
        let next = state.segments.last().map(Segment::next_offset).unwrap_or(0);
        next.saturating_sub(1)
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.write_state();
        for segment in state.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Close everything and delete the log directory.
    pub fn remove(&self) -> Result<()> {
        {
            let mut state = self.write_state();
            for segment in state.segments.iter_mut() {
                segment.close()?;
            }
            state.segments.clear();
        }
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove the directory and start over at the same initial offset.
    pub fn reset(&self) -> Result<()> {
        let initial = self.read_state().config.initial_offset;
        self.reset_with_offset(initial)
    }

    /// Remove the directory and start over with a new initial offset. Used
    /// by snapshot restore, where the first restored record dictates where
    /// the log begins.
    pub fn reset_with_offset(&self, initial_offset: u64) -> Result<()> {
        let mut state = self.write_state();
        for segment in state.segments.iter_mut() {
            segment.close()?;
        }
        state.segments.clear();

        std::fs::remove_dir_all(&self.dir)?;
        std::fs::create_dir_all(&self.dir)?;

        state.config.initial_offset = initial_offset;
        let dir = self.dir.clone();
        Self::setup(&dir, &mut state)?;

        info!(
            target: "quill::storage",
            dir = %self.dir.display(),
            initial_offset,
            "log reset"
        );

        Ok(())
    }

    fn active<'a>(state: &'a mut RwLockWriteGuard<'_, LogState>) -> &'a mut Segment {
        let last = state.segments.len() - 1;
        &mut state.segments[last]
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LogState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LogState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Concatenating reader over segment stores, used to stream snapshots.
/// Holds shared store handles so a concurrent truncation cannot invalidate
/// it mid-stream.
pub struct LogReader {
    stores: Vec<Arc<Store>>,
    current: usize,
    pos: u64,
}

impl std::io::Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.stores.len() {
            let n = self.stores[self.current]
                .read_at(buf, self.pos)
                .map_err(std::io::Error::other)?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.pos = 0;
        }
        Ok(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::index::ENTRY_WIDTH;
    use bytes::Bytes;
    use std::io::Read;
    use tempfile::tempdir;

    fn record(value: &'static [u8]) -> Record {
        Record {
            value: Bytes::from_static(value),
            ..Default::default()
        }
    }

    fn open(dir: &Path) -> Log {
        Log::open(
            dir,
            LogConfig {
                max_store_bytes: 1024,
                max_index_bytes: 1024,
                initial_offset: 0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_append_read() {
        let dir = tempdir().unwrap();
        let log = Log::open(
            dir.path(),
            LogConfig {
                max_store_bytes: 32,
                ..Default::default()
            },
        )
        .unwrap();

        let offset = log.append(&mut record(b"hello world")).unwrap();
        assert_eq!(offset, 0);

        let got = log.read(0).unwrap();
        assert_eq!(got.value.as_ref(), b"hello world");
        assert_eq!(got.offset, 0);
    }

    #[test]
    fn test_offset_out_of_range() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());

        let err = log.read(1000).unwrap_err();
        match err {
            QuillError::OffsetOutOfRange { offset } => assert_eq!(offset, 1000),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reopen_recovers_offsets() {
        let dir = tempdir().unwrap();

        {
            let log = open(dir.path());
            for _ in 0..3 {
                log.append(&mut record(b"hello world")).unwrap();
            }
            assert_eq!(log.lowest_offset(), 0);
            assert_eq!(log.highest_offset(), 2);
            log.close().unwrap();
        }

        let log = open(dir.path());
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.read(2).unwrap().offset, 2);
    }

    #[test]
    fn test_rolls_segments_on_append() {
        let dir = tempdir().unwrap();
        let log = Log::open(
            dir.path(),
            LogConfig {
                max_store_bytes: 1024,
                max_index_bytes: ENTRY_WIDTH * 3,
                initial_offset: 0,
            },
        )
        .unwrap();

        for i in 0..7u64 {
            let offset = log.append(&mut record(b"roll me over")).unwrap();
            assert_eq!(offset, i);
        }

        // Every offset stays readable across the rolled segments.
        for i in 0..7u64 {
            assert_eq!(log.read(i).unwrap().offset, i);
        }
        assert_eq!(log.highest_offset(), 6);
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let log = Log::open(
            dir.path(),
            LogConfig {
                max_store_bytes: 1024,
                max_index_bytes: ENTRY_WIDTH,
                initial_offset: 0,
            },
        )
        .unwrap();

        for _ in 0..3 {
            log.append(&mut record(b"one per segment")).unwrap();
        }

        log.truncate(1).unwrap();

        // Segments whose highest offset is at or below the watermark are
        // gone, files and all.
        assert!(log.read(0).is_err());
        assert!(log.read(1).is_err());
        assert!(log.read(2).is_ok());
        assert_eq!(log.lowest_offset(), 2);
    }

    #[test]
    fn test_truncate_from() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());

        for _ in 0..5 {
            log.append(&mut record(b"entry")).unwrap();
        }

        log.truncate_from(3).unwrap();
        assert_eq!(log.highest_offset(), 2);
        assert!(log.read(3).is_err());

        let offset = log.append(&mut record(b"replacement")).unwrap();
        assert_eq!(offset, 3);
    }

    #[test]
    fn test_reader_concatenates_stores() {
        let dir = tempdir().unwrap();
        let log = Log::open(
            dir.path(),
            LogConfig {
                max_store_bytes: 1024,
                max_index_bytes: ENTRY_WIDTH,
                initial_offset: 0,
            },
        )
        .unwrap();

        for _ in 0..3 {
            log.append(&mut record(b"snapshot me")).unwrap();
        }

        let mut bytes = Vec::new();
        log.reader().read_to_end(&mut bytes).unwrap();

        // Three frames, one per segment store.
        let mut offset = 0usize;
        let mut frames = 0;
        while offset + 8 <= bytes.len() {
            let len = u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            let body = &bytes[offset + 8..offset + 8 + len];
            let rec = <Record as prost::Message>::decode(body).unwrap();
            assert_eq!(rec.value.as_ref(), b"snapshot me");
            assert_eq!(rec.offset, frames);
            offset += 8 + len;
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn test_reset_with_offset() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        for _ in 0..3 {
            log.append(&mut record(b"old world")).unwrap();
        }

        log.reset_with_offset(100).unwrap();
        assert_eq!(log.lowest_offset(), 100);

        let offset = log.append(&mut record(b"new world")).unwrap();
        assert_eq!(offset, 100);
    }
}
