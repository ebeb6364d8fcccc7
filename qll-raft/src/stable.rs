use std::path::{Path, PathBuf};

use qll_core::{QuillError, Result};
use serde::{Deserialize, Serialize};

/// The small amount of Raft state that must survive restarts: the latest
/// term seen, who was voted for in it, and how far the state machine has
/// applied.
///
/// `last_applied` exists because the state machine here is itself durable
/// (it is the on-disk application log); replaying the whole Raft log into
/// it on restart would duplicate records. A crash between an apply and the
/// `last_applied` write can re-apply the last batch; exactly-once across
/// that window is explicitly not promised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StableState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub last_applied: u64,
}

/// Key-value file at `raft/stable`, written atomically via a temp file and
/// rename, synced before the rename so a crash never leaves a torn state.
pub struct StableStore {
    path: PathBuf,
    state: StableState,
    existed: bool,
}

impl StableStore {
    pub fn open(path: &Path) -> Result<Self> {
        let (state, existed) = if path.exists() {
            let content = std::fs::read(path)?;
            let state = serde_json::from_slice(&content)
                .map_err(|e| QuillError::Codec(format!("decode stable state: {e}")))?;
            (state, true)
        } else {
            (StableState::default(), false)
        };

        Ok(Self {
            path: path.to_path_buf(),
            state,
            existed,
        })
    }

    /// Whether any state had been persisted before this open.
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn state(&self) -> &StableState {
        &self.state
    }

    /// Persist a new term and vote. Must complete before the vote is sent
    /// or the election started.
    pub fn set_term(&mut self, term: u64, voted_for: Option<String>) -> Result<()> {
        self.state.current_term = term;
        self.state.voted_for = voted_for;
        self.save()
    }

    pub fn set_last_applied(&mut self, last_applied: u64) -> Result<()> {
        self.state.last_applied = last_applied;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let content = serde_json::to_vec(&self.state)
            .map_err(|e| QuillError::Codec(format!("encode stable state: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_store_is_default() {
        let dir = tempdir().unwrap();
        let store = StableStore::open(&dir.path().join("stable")).unwrap();
        assert!(!store.existed());
        assert_eq!(store.state().current_term, 0);
        assert_eq!(store.state().voted_for, None);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stable");

        {
            let mut store = StableStore::open(&path).unwrap();
            store.set_term(7, Some("node-2".into())).unwrap();
            store.set_last_applied(31).unwrap();
        }

        let store = StableStore::open(&path).unwrap();
        assert!(store.existed());
        assert_eq!(store.state().current_term, 7);
        assert_eq!(store.state().voted_for.as_deref(), Some("node-2"));
        assert_eq!(store.state().last_applied, 31);
    }
}
