//! Raft consensus for the quill commit log.
//!
//! The durable substrate for Raft's own log entries is the same segmented
//! log that stores application records, offset-shifted to Raft's 1-based
//! indices. The finite-state machine the consensus module drives is the
//! application log itself: applying a committed command means appending to
//! it.

mod fsm;
mod log_store;
mod node;
mod replicated;
mod snapshot;
mod stable;
mod wire;

pub use fsm::{Fsm, LogFsm, APPEND_REQUEST};
pub use log_store::RaftLogStore;
pub use node::{spawn, RaftConfig, RaftHandle, RaftState};
pub use replicated::ReplicatedLog;
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use stable::StableStore;
pub use wire::{ClusterConfig, Entry, EntryKind, RaftServer};
