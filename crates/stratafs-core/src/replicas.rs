//! Replica-usage table and the "enough devices to read everything" predicate.
//!
//! The table records, for every distinct set of devices that holds copies of
//! some data, which kind of data it is. It is persisted in the superblock
//! and only ever grows while data is written; evaluating it against a set of
//! online devices tells whether every object is still readable.

use serde::{Deserialize, Serialize};

use crate::types::{DataType, DevMask, ForceFlags};

/// One set of devices holding replicas of one kind of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicasEntry {
    /// Kind of data replicated across `devs`.
    pub data_type: DataType,
    /// Devices holding a copy.
    pub devs: DevMask,
}

/// Persisted list of replica sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasTable {
    entries: Vec<ReplicasEntry>,
}

impl ReplicasTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `data_type` has copies on exactly `devs`.
    ///
    /// Returns `true` if the entry was new and the table changed.
    pub fn mark(&mut self, data_type: DataType, devs: DevMask) -> bool {
        if devs.is_empty() {
            return false;
        }
        let entry = ReplicasEntry { data_type, devs };
        if self.entries.contains(&entry) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Drops every entry that references a device in `devs`.
    pub fn forget(&mut self, devs: DevMask) {
        self.entries.retain(|e| e.devs.0 & devs.0 == 0);
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[ReplicasEntry] {
        &self.entries
    }

    /// Returns whether any entry references the device set.
    pub fn references(&self, devs: DevMask) -> bool {
        self.entries.iter().any(|e| e.devs.0 & devs.0 != 0)
    }

    /// Evaluates the table against a set of online devices.
    pub fn status(&self, online: DevMask) -> ReplicasStatus {
        let mut status = ReplicasStatus::default();
        for entry in &self.entries {
            let nr_online = (entry.devs.0 & online.0).count_ones() as u8;
            let nr_offline = (entry.devs.0 & !online.0).count_ones() as u8;
            let slot = status.slot_mut(entry.data_type);
            slot.nr_online = slot.nr_online.min(nr_online);
            slot.nr_offline = slot.nr_offline.max(nr_offline);
        }
        status
    }
}

/// Worst-case replica counts for one data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCounts {
    /// Fewest online copies of any object; `u8::MAX` when nothing is stored.
    pub nr_online: u8,
    /// Most offline copies of any object.
    pub nr_offline: u8,
}

impl Default for ReplicaCounts {
    fn default() -> Self {
        Self {
            nr_online: u8::MAX,
            nr_offline: 0,
        }
    }
}

/// Replica counts per data type for one online-device set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicasStatus {
    /// Journal replicas.
    pub journal: ReplicaCounts,
    /// Btree node replicas.
    pub btree: ReplicaCounts,
    /// User data replicas.
    pub user: ReplicaCounts,
}

impl ReplicasStatus {
    fn slot_mut(&mut self, ty: DataType) -> &mut ReplicaCounts {
        match ty {
            DataType::Journal => &mut self.journal,
            DataType::Btree => &mut self.btree,
            DataType::User => &mut self.user,
        }
    }

    /// Counts for one data type.
    pub fn get(&self, ty: DataType) -> ReplicaCounts {
        match ty {
            DataType::Journal => self.journal,
            DataType::Btree => self.btree,
            DataType::User => self.user,
        }
    }
}

/// Returns whether every object is still readable given `status`, allowing
/// degraded or lost data only where `flags` says so.
pub fn have_enough_devs(status: &ReplicasStatus, flags: ForceFlags) -> bool {
    let meta_offline = status.journal.nr_offline.max(status.btree.nr_offline);
    let meta_online = status.journal.nr_online.min(status.btree.nr_online);

    if meta_offline > 0 && !flags.contains(ForceFlags::METADATA_DEGRADED) {
        return false;
    }
    if meta_online == 0 && !flags.contains(ForceFlags::METADATA_LOST) {
        return false;
    }
    if status.user.nr_offline > 0 && !flags.contains(ForceFlags::DATA_DEGRADED) {
        return false;
    }
    if status.user.nr_online == 0 && !flags.contains(ForceFlags::DATA_LOST) {
        return false;
    }
    true
}
