use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use qll_core::{QuillError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::wire::ClusterConfig;

/// Metadata describing what a snapshot covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    pub config: ClusterConfig,
}

/// File-based snapshot store under `raft/snapshots/`, keeping the most
/// recent `retain` snapshots (default 1).
///
/// A snapshot is a directory `snap-<term>-<index>` holding `meta.json` and
/// `state.bin`, the state machine's snapshot stream.
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retain: 1,
        })
    }

    /// Write a snapshot, then drop everything older than the retention
    /// window. The data file is synced before the metadata is written, so a
    /// snapshot with metadata is always complete.
    pub fn create(&self, meta: &SnapshotMeta, mut state: impl Read) -> Result<()> {
        let name = format!("snap-{}-{}", meta.last_term, meta.last_index);
        let snap_dir = self.dir.join(&name);
        std::fs::create_dir_all(&snap_dir)?;

        {
            let mut file = File::create(snap_dir.join("state.bin"))?;
            std::io::copy(&mut state, &mut file)?;
            file.sync_all()?;
        }

        let encoded = serde_json::to_vec_pretty(meta)
            .map_err(|e| QuillError::Codec(format!("encode snapshot meta: {e}")))?;
        std::fs::write(snap_dir.join("meta.json"), encoded)?;

        info!(
            target: "quill::raft",
            snapshot = %name,
            last_index = meta.last_index,
            last_term = meta.last_term,
            "snapshot written"
        );

        self.prune()?;
        Ok(())
    }

    /// The newest complete snapshot, if any.
    pub fn latest(&self) -> Result<Option<(SnapshotMeta, File)>> {
        let Some((meta, dir)) = self.latest_entry()? else {
            return Ok(None);
        };
        let file = File::open(dir.join("state.bin"))?;
        Ok(Some((meta, file)))
    }

    pub fn latest_meta(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.latest_entry()?.map(|(meta, _)| meta))
    }

    fn latest_entry(&self) -> Result<Option<(SnapshotMeta, PathBuf)>> {
        let mut best: Option<(SnapshotMeta, PathBuf)> = None;
        for (meta, path) in self.scan()? {
            let newer = match &best {
                Some((cur, _)) => {
                    (meta.last_index, meta.last_term) > (cur.last_index, cur.last_term)
                }
                None => true,
            };
            if newer {
                best = Some((meta, path));
            }
        }
        Ok(best)
    }

    fn scan(&self) -> Result<Vec<(SnapshotMeta, PathBuf)>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let meta_path = path.join("meta.json");
            let Ok(content) = std::fs::read(&meta_path) else {
                // Partial snapshot from an interrupted write.
                continue;
            };
            match serde_json::from_slice::<SnapshotMeta>(&content) {
                Ok(meta) => found.push((meta, path)),
                Err(e) => warn!(
                    target: "quill::raft",
                    path = %meta_path.display(),
                    error = %e,
                    "skipping unreadable snapshot metadata"
                ),
            }
        }
        Ok(found)
    }

    fn prune(&self) -> Result<()> {
        let mut snapshots = self.scan()?;
        snapshots.sort_by_key(|(meta, _)| (meta.last_index, meta.last_term));

        while snapshots.len() > self.retain {
            let (meta, path) = snapshots.remove(0);
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(
                    target: "quill::raft",
                    path = %path.display(),
                    error = %e,
                    "failed to prune snapshot"
                );
            } else {
                info!(
                    target: "quill::raft",
                    last_index = meta.last_index,
                    "pruned old snapshot"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn meta(index: u64, term: u64) -> SnapshotMeta {
        SnapshotMeta {
            last_index: index,
            last_term: term,
            config: ClusterConfig::default(),
        }
    }

    #[test]
    fn test_empty_store() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_create_and_read_back() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store
            .create(&meta(5, 2), std::io::Cursor::new(b"state bytes".to_vec()))
            .unwrap();

        let (got, mut file) = store.latest().unwrap().unwrap();
        assert_eq!(got.last_index, 5);
        assert_eq!(got.last_term, 2);

        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"state bytes");
    }

    #[test]
    fn test_retains_only_newest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store
            .create(&meta(3, 1), std::io::Cursor::new(b"old".to_vec()))
            .unwrap();
        store
            .create(&meta(9, 2), std::io::Cursor::new(b"new".to_vec()))
            .unwrap();

        let snapshots: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        assert_eq!(snapshots.len(), 1);

        let (got, _) = store.latest().unwrap().unwrap();
        assert_eq!(got.last_index, 9);
    }
}
