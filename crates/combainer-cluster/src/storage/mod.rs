//! Persistent raft log storage
//!
//! The log and the hard state (vote, committed, last purged) live in a single
//! redb file. State machine snapshots are plain files next to it, see
//! [`crate::raft::StateMachine`].
//!
//! ```ignore
//! use combainer_cluster::storage::RedbLogStore;
//!
//! let store = RedbLogStore::new(data_dir.join("raft.redb"))?;
//! ```

mod redb_store;

pub use redb_store::RedbLogStore;
