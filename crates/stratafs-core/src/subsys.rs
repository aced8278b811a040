//! Contracts of the subsystems the lifecycle layer drives.
//!
//! The journal, mark-and-sweep pass, per-device allocators, data movers,
//! tier placement, consistency checker and btree store live outside this
//! crate. The lifecycle layer only starts, stops and sequences them through
//! the traits below.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{FsError, FsResult, FsckError};
use crate::fault::FaultInjector;
use crate::fs::Filesystem;
use crate::superblock::{Superblock, SuperblockIo};
use crate::types::{DataMask, RootPtr, TreeId};

/// One journal entry as seen by the lifecycle layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequence number; strictly increasing within a journal.
    pub seq: u64,
    /// Read prio-clock hand at the time of the entry.
    pub read_clock: u16,
    /// Write prio-clock hand at the time of the entry.
    pub write_clock: u16,
    /// Btree roots recorded by the entry.
    pub roots: Vec<RootPtr>,
    /// Opaque keys to replay.
    pub keys: Vec<u64>,
}

impl JournalEntry {
    /// Root of `tree` recorded in this entry.
    pub fn root(&self, tree: TreeId) -> Option<&RootPtr> {
        self.roots.iter().find(|r| r.tree == tree)
    }
}

/// Journal entries ordered by sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalReplayList {
    entries: BTreeMap<u64, JournalEntry>,
}

impl JournalReplayList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders `entries` by sequence number, rejecting duplicates.
    pub fn from_entries(entries: impl IntoIterator<Item = JournalEntry>) -> FsResult<Self> {
        let mut list = Self::new();
        for entry in entries {
            list.insert(entry)?;
        }
        Ok(list)
    }

    /// Adds an entry.
    pub fn insert(&mut self, entry: JournalEntry) -> FsResult<()> {
        let seq = entry.seq;
        if self.entries.insert(seq, entry).is_some() {
            return Err(FsError::JournalOutOfOrder { seq });
        }
        Ok(())
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&JournalEntry> {
        self.entries.values().next_back()
    }

    /// Entries in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write-ahead journal.
pub trait Journal: Send + Sync {
    /// Reads every entry on disk.
    fn read(&self, fs: &Filesystem) -> FsResult<JournalReplayList>;
    /// Applies `list` to the btrees, in sequence order.
    fn replay(&self, fs: &Filesystem, list: &JournalReplayList) -> FsResult<()>;
    /// Blocks until every entry up to `upto` is durable.
    fn flush_all(&self, fs: &Filesystem, upto: u64) -> FsResult<()>;
    /// Stops accepting durable writes. Must not block.
    fn halt(&self, fs: &Filesystem);
    /// Returns whether the journal has been halted or hit an error.
    fn has_error(&self) -> bool;
    /// Starts the live-write machinery.
    fn start_live_writes(&self, fs: &Filesystem) -> FsResult<()>;
    /// Records that replay has finished.
    fn mark_replay_complete(&self, fs: &Filesystem);
    /// Writes a checkpoint entry and waits for it.
    fn write_meta(&self, fs: &Filesystem) -> FsResult<()>;
    /// Stops the background machinery.
    fn stop(&self, fs: &Filesystem);
}

/// Mark-and-sweep space accounting.
pub trait MarkSweep: Send + Sync {
    /// Synchronous initial pass over the journal and every tree.
    fn run_once(&self, fs: &Filesystem, list: &JournalReplayList) -> FsResult<()>;
    /// Starts the background worker.
    fn start_background(&self, fs: &Filesystem) -> FsResult<()>;
    /// Stops the background worker.
    fn stop_background(&self, fs: &Filesystem);
}

/// Per-device bucket allocator.
pub trait Allocator: Send + Sync {
    /// Starts the allocator worker of `dev`.
    fn start(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()>;
    /// Stops the allocator worker of `dev`.
    fn stop(&self, fs: &Filesystem, dev: &Arc<Device>);
    /// Adds the reserve pools of `dev` to the shared allocation pool.
    fn add_to_pool(&self, fs: &Filesystem, dev: &Arc<Device>);
    /// Removes the reserve pools of `dev` from the shared allocation pool.
    fn remove_from_pool(&self, fs: &Filesystem, dev: &Arc<Device>);
    /// Sets aside journal buckets on `dev`.
    fn alloc_journal_buckets(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()>;
    /// Loads bucket generations and usage from the journal tail.
    fn read_alloc_info(&self, fs: &Filesystem, list: &JournalReplayList) -> FsResult<()>;
}

/// Per-device data mover (moving GC) and evacuation.
pub trait DataMover: Send + Sync {
    /// Starts the mover worker of `dev`.
    fn start(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()>;
    /// Stops the mover worker of `dev`.
    fn stop(&self, fs: &Filesystem, dev: &Arc<Device>);
    /// Moves user data off `dev`.
    fn migrate_data_off(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()>;
    /// Moves metadata off `dev`.
    fn migrate_metadata_off(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()>;
    /// Marks every extent pointer to `dev` as bad.
    fn flag_data_bad(&self, fs: &Filesystem, dev: &Arc<Device>) -> FsResult<()>;
    /// Kinds of data still stored on `dev`.
    fn has_data(&self, fs: &Filesystem, dev: &Arc<Device>) -> DataMask;
}

/// Cross-tier data placement.
pub trait TierPlacement: Send + Sync {
    /// Starts the placement worker.
    fn start(&self, fs: &Filesystem) -> FsResult<()>;
    /// Stops the placement worker.
    fn stop(&self, fs: &Filesystem);
    /// Periodic rate-controller update.
    fn update_rate(&self, _fs: &Filesystem) {}
}

/// Consistency checker.
pub trait Fsck: Send + Sync {
    /// Checks the filesystem, repairing what it can when `auto_fix` is set.
    fn run(&self, fs: &Filesystem, auto_fix: bool) -> Result<(), FsckError>;
}

/// Btree root management.
pub trait BtreeStore: Send + Sync {
    /// Reads the node at `root` into memory.
    fn read_root(&self, fs: &Filesystem, root: &RootPtr) -> FsResult<()>;
    /// Allocates an empty root for `tree`.
    fn alloc_root(&self, fs: &Filesystem, tree: TreeId) -> FsResult<RootPtr>;
    /// Creates the root directory inode.
    fn create_root_inode(&self, fs: &Filesystem) -> FsResult<()>;
}

/// Handles to every subsystem of one filesystem instance.
#[derive(Clone)]
pub struct Subsystems {
    /// Journal.
    pub journal: Arc<dyn Journal>,
    /// Mark-and-sweep.
    pub gc: Arc<dyn MarkSweep>,
    /// Allocators.
    pub allocator: Arc<dyn Allocator>,
    /// Data movers.
    pub mover: Arc<dyn DataMover>,
    /// Tier placement.
    pub tiering: Arc<dyn TierPlacement>,
    /// Consistency checker.
    pub fsck: Arc<dyn Fsck>,
    /// Btree roots.
    pub btree: Arc<dyn BtreeStore>,
    /// Superblock persistence.
    pub sb_io: Arc<dyn SuperblockIo>,
    /// Fault points armed for this instance.
    pub faults: Arc<FaultInjector>,
}

impl fmt::Debug for Subsystems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subsystems").finish_non_exhaustive()
    }
}

/// Builds subsystems for new filesystem instances.
pub trait SubsystemFactory: Send + Sync {
    /// Superblock I/O used to read candidate devices.
    fn superblock_io(&self) -> Arc<dyn SuperblockIo>;
    /// Creates the subsystems for the filesystem described by `sb`.
    fn create(&self, sb: &Superblock) -> FsResult<Subsystems>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64) -> JournalEntry {
        JournalEntry {
            seq,
            read_clock: seq as u16,
            write_clock: seq as u16 + 1,
            roots: vec![RootPtr {
                tree: TreeId::Inodes,
                level: 0,
                ptr: seq * 10,
            }],
            keys: vec![seq],
        }
    }

    #[test]
    fn test_replay_list_orders_by_seq() {
        let list = JournalReplayList::from_entries(vec![entry(3), entry(1), entry(2)]).unwrap();
        let seqs: Vec<u64> = list.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(list.last().unwrap().seq, 3);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_replay_list_rejects_duplicate_seq() {
        let err = JournalReplayList::from_entries(vec![entry(1), entry(1)]).unwrap_err();
        assert!(matches!(err, FsError::JournalOutOfOrder { seq: 1 }));
    }

    #[test]
    fn test_entry_root_lookup() {
        let e = entry(4);
        assert_eq!(e.root(TreeId::Inodes).unwrap().ptr, 40);
        assert!(e.root(TreeId::Alloc).is_none());
        assert!(JournalReplayList::new().last().is_none());
    }
}
